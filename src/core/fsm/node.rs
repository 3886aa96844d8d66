// src/core/fsm/node.rs

//! The node and formation records the transition engine decides over. These
//! are by-value snapshots: nothing in here owns shared state, and records
//! refer to their formation by identifier only.

use super::state::{NodeHealth, ReplicationState, SyncState};
use crate::config::FormationDefaults;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Whether a formation is a plain single-group cluster or a sharded one
/// whose writes are fenced by a routing layer. Consulted by the sharded
/// short-cut rules of the engine.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FormationKind {
    Plain,
    Sharded,
}

impl fmt::Display for FormationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FormationKind::Plain => "plain",
            FormationKind::Sharded => "sharded",
        };
        f.write_str(name)
    }
}

/// Formation-scoped lag thresholds and timers. The engine treats these as
/// inputs, never as constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormationSettings {
    /// Maximum byte lag at which a standby may enable synchronous
    /// replication.
    pub enable_sync_lag_threshold: u64,
    /// Maximum byte lag at which a standby may be promoted.
    pub promote_lag_threshold: u64,
    /// How long a demoting primary is given to self-fence.
    pub drain_timeout: Duration,
    /// Silence period after which failed health checks count against a node.
    pub unhealthy_timeout: Duration,
    /// Post-restart window during which health checks are not trusted.
    pub startup_grace: Duration,
}

impl From<&FormationDefaults> for FormationSettings {
    fn from(defaults: &FormationDefaults) -> Self {
        Self {
            enable_sync_lag_threshold: defaults.enable_sync_lag_threshold,
            promote_lag_threshold: defaults.promote_lag_threshold,
            drain_timeout: defaults.drain_timeout,
            unhealthy_timeout: defaults.unhealthy_timeout,
            startup_grace: defaults.startup_grace,
        }
    }
}

/// A formation row: a logical cluster of one or more groups sharing a kind
/// and a set of thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formation {
    pub formation_id: String,
    pub kind: FormationKind,
    pub settings: FormationSettings,
}

/// One tracked database node. `reported_state` is the last state its agent
/// confirmed; `goal_state` is the coordinator's assignment the agent is
/// expected to converge to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub node_id: i64,
    pub formation_id: String,
    pub group_id: i32,
    pub node_name: String,
    pub node_port: u16,
    pub goal_state: ReplicationState,
    pub reported_state: ReplicationState,
    /// Last heartbeat from the node's agent.
    pub report_time: Instant,
    pub pg_is_running: bool,
    pub sync_state: SyncState,
    pub health: NodeHealth,
    /// Last time the external health probe wrote a verdict.
    pub health_check_time: Instant,
    /// Last time `goal_state` was assigned.
    pub state_change_time: Instant,
    /// Monotonically non-decreasing replay position; zero means "no data yet".
    pub reported_lsn: u64,
    /// Zero means never promote this node.
    pub candidate_priority: i32,
    /// Whether the node counts toward the synchronous-replication quorum.
    pub replication_quorum: bool,
}

impl Node {
    /// True when the node is known to have converged to `state`: it both
    /// reports it and is assigned it. The convergence guard keeps the engine
    /// from racing ahead of an in-flight assignment.
    pub fn is_current_state(&self, state: ReplicationState) -> bool {
        self.goal_state == self.reported_state && self.goal_state == state
    }

    /// True when the node has converged to a state in which it is the
    /// writable primary of its group.
    pub fn is_in_primary_state(&self) -> bool {
        self.goal_state == self.reported_state && self.goal_state.can_take_writes()
    }

    /// True when the node is a primary currently busy admitting a standby.
    /// Only one standby may be registered at a time, so this blocks further
    /// registrations.
    pub fn is_in_wait_or_join_state(&self) -> bool {
        let wait_or_join = |s: ReplicationState| {
            matches!(
                s,
                ReplicationState::WaitPrimary | ReplicationState::JoinPrimary
            )
        };
        wait_or_join(self.reported_state) || wait_or_join(self.goal_state)
    }

    /// "name:port", the spelling every log message uses for a node.
    pub fn label(&self) -> String {
        format!("{}:{}", self.node_name, self.node_port)
    }
}

/// The externally visible projection of a node row, returned by the
/// read-side operations and the wire protocol.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub node_id: i64,
    pub group_id: i32,
    pub name: String,
    pub port: u16,
    pub reported_state: ReplicationState,
    pub goal_state: ReplicationState,
    pub health: NodeHealth,
    pub reported_lsn: u64,
    pub candidate_priority: i32,
    pub replication_quorum: bool,
}

impl From<&Node> for NodeSummary {
    fn from(node: &Node) -> Self {
        Self {
            node_id: node.node_id,
            group_id: node.group_id,
            name: node.node_name.clone(),
            port: node.node_port,
            reported_state: node.reported_state,
            goal_state: node.goal_state,
            health: node.health,
            reported_lsn: node.reported_lsn,
            candidate_priority: node.candidate_priority,
            replication_quorum: node.replication_quorum,
        }
    }
}
