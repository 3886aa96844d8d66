// src/core/events.rs

//! The event system for state changes decided by the coordinator. Every
//! assignment is persisted as an event row and published on two logical
//! channels: `state` carries a structured record per change, `log` carries
//! a human-readable duplicate for observers without direct log access.

use crate::core::fsm::{Node, ReplicationState, SyncState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, Sender as BroadcastSender};
use tracing::info;

/// Capacity of the two broadcast channels. Large enough that a slow
/// subscriber does not lag out during a failover burst.
const EVENT_BUS_CAPACITY: usize = 4096;

/// The structured record published for every state change, machine-parsable
/// and totally ordered within a formation by `event_id`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StateChangeEvent {
    pub event_id: i64,
    pub formation_id: String,
    pub group_id: i32,
    pub node_id: i64,
    pub node_name: String,
    pub node_port: u16,
    pub reported_state: ReplicationState,
    pub goal_state: ReplicationState,
    pub sync_state: SyncState,
    pub reported_lsn: u64,
    pub candidate_priority: i32,
    pub replication_quorum: bool,
    pub description: String,
}

/// The distribution hub for coordinator events. Event rows persist for the
/// lifetime of the process; retention beyond that is an external concern.
#[derive(Debug)]
pub struct EventBus {
    state_sender: BroadcastSender<StateChangeEvent>,
    log_sender: BroadcastSender<String>,
    events: Mutex<Vec<StateChangeEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (state_sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (log_sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        Self {
            state_sender,
            log_sender,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Emits the given message both as a log entry and as a notification on
    /// the `log` channel.
    pub fn log_and_notify(&self, message: &str) {
        info!("{}", message);

        // It's okay if there are no active subscribers.
        let _ = self.log_sender.send(message.to_string());
    }

    /// Persists an event row for a state change and publishes it on the
    /// `state` channel. The node's fields are captured as they stand at
    /// emission time; `goal_state` is the newly decided assignment.
    /// Returns the id of the new event.
    pub fn notify_state_change(
        &self,
        node: &Node,
        goal_state: ReplicationState,
        description: &str,
    ) -> i64 {
        let mut events = self.events.lock();
        let event_id = events.len() as i64 + 1;

        let event = StateChangeEvent {
            event_id,
            formation_id: node.formation_id.clone(),
            group_id: node.group_id,
            node_id: node.node_id,
            node_name: node.node_name.clone(),
            node_port: node.node_port,
            reported_state: node.reported_state,
            goal_state,
            sync_state: node.sync_state,
            reported_lsn: node.reported_lsn,
            candidate_priority: node.candidate_priority,
            replication_quorum: node.replication_quorum,
            description: description.to_string(),
        };

        events.push(event.clone());

        // Broadcast while still holding the events lock, so subscribers see
        // events in persistence order.
        let _ = self.state_sender.send(event);

        event_id
    }

    /// Provides a new receiver for the structured `state` channel.
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChangeEvent> {
        self.state_sender.subscribe()
    }

    /// Provides a new receiver for the human-readable `log` channel.
    pub fn subscribe_log(&self) -> broadcast::Receiver<String> {
        self.log_sender.subscribe()
    }

    /// All persisted events for one formation, in persistence order.
    pub fn events_for_formation(&self, formation_id: &str) -> Vec<StateChangeEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.formation_id == formation_id)
            .cloned()
            .collect()
    }

    /// Total number of persisted events.
    pub fn event_count(&self) -> usize {
        self.events.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
