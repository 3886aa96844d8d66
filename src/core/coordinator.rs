// src/core/coordinator.rs

//! The side-effectful shell around the pure transition engine: it owns the
//! formation and node rows, serializes decisions per group, feeds snapshots
//! to the engine, persists the resulting assignments, and emits events.

use crate::config::FormationDefaults;
use crate::core::clock::Clock;
use crate::core::errors::StewardError;
use crate::core::events::EventBus;
use crate::core::fsm::node::NodeSummary;
use crate::core::fsm::{
    Formation, FormationKind, GroupSnapshot, Node, NodeHealth, ReplicationState, SyncState,
    proceed_group_state,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, error, warn};

/// (formation id, group id): the unit of locking and of failover.
type GroupKey = (String, i32);

/// What a successful registration hands back to the node's agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredNode {
    pub node_id: i64,
    pub group_id: i32,
    pub goal_state: ReplicationState,
}

/// The report a node's agent sends on every heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeReport {
    pub reported_state: ReplicationState,
    pub reported_lsn: u64,
    pub sync_state: SyncState,
    pub pg_is_running: bool,
}

/// The authoritative in-memory store of formations and node rows, plus the
/// machinery that runs the engine over them.
///
/// Every operation resolves its group, takes that group's lock, and runs
/// read snapshot -> engine -> persist -> emit before releasing it, which
/// serializes all decisions for one group. Different groups proceed in
/// parallel.
#[derive(Debug)]
pub struct Coordinator {
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    defaults: FormationDefaults,
    formations: DashMap<String, Formation>,
    groups: DashMap<GroupKey, Arc<Mutex<BTreeMap<i64, Node>>>>,
    /// node id -> owning group, so reports can find their rows.
    node_index: DashMap<i64, GroupKey>,
    next_node_id: AtomicI64,
}

impl Coordinator {
    pub fn new(clock: Arc<dyn Clock>, bus: Arc<EventBus>, defaults: FormationDefaults) -> Self {
        Self {
            clock,
            bus,
            defaults,
            formations: DashMap::new(),
            groups: DashMap::new(),
            node_index: DashMap::new(),
            next_node_id: AtomicI64::new(1),
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Creates a formation row with the configured default thresholds.
    pub fn create_formation(
        &self,
        formation_id: &str,
        kind: FormationKind,
    ) -> Result<(), StewardError> {
        if self.formations.contains_key(formation_id) {
            return Err(StewardError::FormationExists(formation_id.to_string()));
        }

        let formation = Formation {
            formation_id: formation_id.to_string(),
            kind,
            settings: (&self.defaults).into(),
        };
        self.formations.insert(formation_id.to_string(), formation);

        self.bus
            .log_and_notify(&format!("Created formation \"{formation_id}\" of kind {kind}."));

        Ok(())
    }

    /// Creates a node row and returns its id, group, and initial goal state.
    ///
    /// The first node of a group starts as `single`; any later node starts
    /// as `wait_standby`. Only one standby may be joining at a time: while
    /// the group's writable node is busy in `wait_primary`/`join_primary`,
    /// further registrations are rejected with a retryable conflict.
    #[allow(clippy::too_many_arguments)]
    pub fn register_node(
        &self,
        formation_id: &str,
        group: i32,
        name: &str,
        port: u16,
        kind: FormationKind,
        candidate_priority: i32,
        replication_quorum: bool,
    ) -> Result<RegisteredNode, StewardError> {
        if !(0..=100).contains(&candidate_priority) {
            return Err(StewardError::InvalidCandidatePriority(candidate_priority));
        }

        let formation = self
            .formations
            .get(formation_id)
            .map(|f| f.clone())
            .ok_or_else(|| StewardError::UnknownFormation(formation_id.to_string()))?;

        if formation.kind != kind {
            return Err(StewardError::FormationKindMismatch {
                formation: formation_id.to_string(),
                formation_kind: formation.kind.to_string(),
                node_kind: kind.to_string(),
            });
        }

        let group_id = self.resolve_group_id(&formation, group)?;
        let group_key = (formation_id.to_string(), group_id);

        let group_arc = self
            .groups
            .entry(group_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(BTreeMap::new())))
            .clone();
        let mut nodes = group_arc.lock();

        let initial_state = Self::initial_state_for_group(&nodes)?;

        let node_id = self.next_node_id.fetch_add(1, Ordering::SeqCst);
        let now = self.clock.now();

        // The reported state is seeded equal to the goal state, so the
        // convergence guard holds for the new row immediately and the
        // primary's next report can admit it.
        let node = Node {
            node_id,
            formation_id: formation_id.to_string(),
            group_id,
            node_name: name.to_string(),
            node_port: port,
            goal_state: initial_state,
            reported_state: initial_state,
            report_time: now,
            pg_is_running: true,
            sync_state: SyncState::Unknown,
            health: NodeHealth::Unknown,
            health_check_time: now,
            state_change_time: now,
            reported_lsn: 0,
            candidate_priority,
            replication_quorum,
        };

        self.bus.log_and_notify(&format!(
            "Registering node {name}:{port} to formation \"{formation_id}\" in group {group_id}, initial state {initial_state}."
        ));

        nodes.insert(node_id, node);
        self.node_index.insert(node_id, group_key);

        self.run_and_apply(&formation, &mut nodes, node_id)?;

        let goal_state = nodes
            .get(&node_id)
            .expect("registered node row exists")
            .goal_state;

        Ok(RegisteredNode {
            node_id,
            group_id,
            goal_state,
        })
    }

    /// The main entry point of the protocol. The node's agent reports its
    /// current state; the coordinator records the report, runs the engine
    /// with this node as the reporter, and returns the node's goal state.
    pub fn node_active(
        &self,
        node_id: i64,
        report: NodeReport,
    ) -> Result<ReplicationState, StewardError> {
        let (formation, group_arc) = self.locate_node(node_id)?;
        let mut nodes = group_arc.lock();

        let now = self.clock.now();

        let node = nodes
            .get_mut(&node_id)
            .ok_or(StewardError::NodeNotRegistered(node_id))?;

        if node.reported_state != report.reported_state {
            // The agent reports that it converged to a new state. Log it,
            // and notify it as a state event before any new decision.
            node.reported_state = report.reported_state;

            let message = format!(
                "Node {} reported new state {}",
                node.label(),
                report.reported_state
            );
            self.bus.log_and_notify(&message);
            self.bus.notify_state_change(node, node.goal_state, &message);
        }

        // A regressing replay position is a stale report: the position is
        // rejected, the liveness fields still land, and no decision is
        // taken on top of it.
        let stale =
            report.reported_lsn != 0 && report.reported_lsn < node.reported_lsn;

        node.report_time = now;
        node.pg_is_running = report.pg_is_running;
        node.sync_state = report.sync_state;

        if stale {
            warn!(
                "Rejecting stale report from node {}: reported LSN {} is behind stored LSN {}",
                node.label(),
                report.reported_lsn,
                node.reported_lsn
            );
            return Ok(node.goal_state);
        }

        if report.reported_lsn != 0 {
            node.reported_lsn = report.reported_lsn;
        }

        self.run_and_apply(&formation, &mut nodes, node_id)?;

        Ok(nodes
            .get(&node_id)
            .expect("reporting node row exists")
            .goal_state)
    }

    /// Records the verdict of the external health probe for a node. No
    /// decision is taken here; the next report of any group member picks
    /// the change up.
    pub fn set_node_health(&self, node_id: i64, health: NodeHealth) -> Result<(), StewardError> {
        let (_, group_arc) = self.locate_node(node_id)?;
        let mut nodes = group_arc.lock();

        let node = nodes
            .get_mut(&node_id)
            .ok_or(StewardError::NodeNotRegistered(node_id))?;

        if node.health != health {
            debug!("Node {} health is now {}", node.label(), health);
        }
        node.health = health;
        node.health_check_time = self.clock.now();

        Ok(())
    }

    /// Deletes a node row. Returns false when the node is unknown. When a
    /// single node remains in the group, the engine runs once for it so the
    /// group collapses to `single` without waiting for its next heartbeat.
    pub fn remove_node(&self, node_id: i64) -> Result<bool, StewardError> {
        let Some((_, group_key)) = self.node_index.remove(&node_id) else {
            return Ok(false);
        };

        let Some(group_arc) = self.groups.get(&group_key).map(|g| g.clone()) else {
            return Ok(false);
        };
        let mut nodes = group_arc.lock();

        let Some(removed) = nodes.remove(&node_id) else {
            return Ok(false);
        };

        self.bus.log_and_notify(&format!(
            "Removing node {} from formation \"{}\"",
            removed.label(),
            removed.formation_id
        ));

        if nodes.len() == 1 {
            let remaining_id = *nodes.keys().next().expect("one node remains");
            let formation = self
                .formations
                .get(&group_key.0)
                .map(|f| f.clone())
                .ok_or_else(|| StewardError::UnknownFormation(group_key.0.clone()))?;
            self.run_and_apply(&formation, &mut nodes, remaining_id)?;
        } else if nodes.is_empty() {
            drop(nodes);
            self.groups.remove(&group_key);
        }

        Ok(true)
    }

    /// Updates a node's candidate priority and quorum flag. In a multi-node
    /// group the change must round-trip through the primary, which is
    /// assigned `apply_settings`; the primary must therefore currently be
    /// in its converged `primary` state.
    pub fn set_replication_settings(
        &self,
        node_id: i64,
        candidate_priority: i32,
        replication_quorum: bool,
    ) -> Result<(), StewardError> {
        if !(0..=100).contains(&candidate_priority) {
            return Err(StewardError::InvalidCandidatePriority(candidate_priority));
        }

        let (formation, group_arc) = self.locate_node(node_id)?;
        let mut nodes = group_arc.lock();

        // Find the group's primary before mutating anything, so a state
        // error leaves the row untouched.
        let primary_id = if nodes.len() > 1 {
            let primary = nodes
                .values()
                .find(|n| n.reported_state.belongs_to_primary())
                .ok_or_else(|| StewardError::PrimaryNotFound {
                    formation: formation.formation_id.clone(),
                    group: formation_group_of(&nodes),
                })?;

            if !primary.is_current_state(ReplicationState::Primary) {
                return Err(StewardError::InvalidState(format!(
                    "cannot change replication settings while primary node {} is in state {}",
                    primary.label(),
                    primary.reported_state
                )));
            }
            Some(primary.node_id)
        } else {
            None
        };

        let node = nodes
            .get_mut(&node_id)
            .ok_or(StewardError::NodeNotRegistered(node_id))?;
        node.candidate_priority = candidate_priority;
        node.replication_quorum = replication_quorum;

        let target_label = node.label();
        self.bus.log_and_notify(&format!(
            "Updating replication settings of node {target_label} to candidate priority {candidate_priority}, replication quorum {replication_quorum}"
        ));

        if let Some(primary_id) = primary_id {
            let now = self.clock.now();
            let primary = nodes
                .get_mut(&primary_id)
                .expect("primary row exists in its group");

            let description = format!(
                "Setting goal state of {} to apply_settings after replication properties changed on {}.",
                primary.label(),
                target_label
            );

            primary.goal_state = ReplicationState::ApplySettings;
            primary.state_change_time = now;

            self.bus.log_and_notify(&description);
            self.bus
                .notify_state_change(primary, ReplicationState::ApplySettings, &description);
        }

        Ok(())
    }

    /// The writable node of a group, if any.
    pub fn get_primary(
        &self,
        formation_id: &str,
        group_id: i32,
    ) -> Result<NodeSummary, StewardError> {
        let group_arc = self
            .groups
            .get(&(formation_id.to_string(), group_id))
            .map(|g| g.clone())
            .ok_or_else(|| StewardError::PrimaryNotFound {
                formation: formation_id.to_string(),
                group: group_id,
            })?;
        let nodes = group_arc.lock();

        nodes
            .values()
            .find(|n| n.reported_state.can_take_writes())
            .map(NodeSummary::from)
            .ok_or_else(|| StewardError::PrimaryNotFound {
                formation: formation_id.to_string(),
                group: group_id,
            })
    }

    /// All node rows of a group, in node-id order.
    pub fn get_nodes(&self, formation_id: &str, group_id: i32) -> Vec<NodeSummary> {
        self.groups
            .get(&(formation_id.to_string(), group_id))
            .map(|group_arc| {
                let nodes = group_arc.lock();
                nodes.values().map(NodeSummary::from).collect()
            })
            .unwrap_or_default()
    }

    /// Resolves the group a registration lands in. A negative group id asks
    /// the coordinator to pick: plain formations only have group 0; sharded
    /// formations take the first group, starting at 1, with room for
    /// another node.
    fn resolve_group_id(&self, formation: &Formation, group: i32) -> Result<i32, StewardError> {
        match formation.kind {
            FormationKind::Plain => {
                if group > 0 {
                    return Err(StewardError::InvalidGroup {
                        formation: formation.formation_id.clone(),
                        group,
                    });
                }
                Ok(0)
            }
            FormationKind::Sharded => {
                if group >= 0 {
                    return Ok(group);
                }
                let mut candidate_group_id = 1;
                loop {
                    let key = (formation.formation_id.clone(), candidate_group_id);
                    let len = self
                        .groups
                        .get(&key)
                        .map(|g| g.lock().len())
                        .unwrap_or(0);
                    if len < 2 {
                        return Ok(candidate_group_id);
                    }
                    candidate_group_id += 1;
                }
            }
        }
    }

    /// The initial goal state for a new row, with the single-standby
    /// admission guards.
    fn initial_state_for_group(
        nodes: &BTreeMap<i64, Node>,
    ) -> Result<ReplicationState, StewardError> {
        if nodes.is_empty() {
            return Ok(ReplicationState::Single);
        }

        // To keep the roles easy to reason about, a group only ever accepts
        // a primary first; any other node is a standby.
        let Some(primary) = nodes
            .values()
            .find(|n| n.reported_state.can_take_writes())
        else {
            // The first node was assigned single but did not report yet.
            return Err(StewardError::PrimaryNotReady);
        };

        if primary.is_in_wait_or_join_state() {
            return Err(StewardError::RegistrationConflict(primary.label()));
        }

        Ok(ReplicationState::WaitStandby)
    }

    /// Finds the formation and group lock for a node id.
    fn locate_node(
        &self,
        node_id: i64,
    ) -> Result<(Formation, Arc<Mutex<BTreeMap<i64, Node>>>), StewardError> {
        let group_key = self
            .node_index
            .get(&node_id)
            .map(|e| e.clone())
            .ok_or(StewardError::NodeNotRegistered(node_id))?;

        let formation = self
            .formations
            .get(&group_key.0)
            .map(|f| f.clone())
            .ok_or_else(|| StewardError::UnknownFormation(group_key.0.clone()))?;

        let group_arc = self
            .groups
            .get(&group_key)
            .map(|g| g.clone())
            .ok_or(StewardError::NodeNotRegistered(node_id))?;

        Ok((formation, group_arc))
    }

    /// Runs the engine over a snapshot of the locked group and applies the
    /// decision: goal states and state-change times are persisted, then one
    /// event per assignment is emitted, all before the group lock is
    /// released. A failed persistence therefore never publishes events.
    fn run_and_apply(
        &self,
        formation: &Formation,
        nodes: &mut BTreeMap<i64, Node>,
        reporting_node_id: i64,
    ) -> Result<(), StewardError> {
        let snapshot = GroupSnapshot::new(formation.clone(), nodes.values().cloned().collect());
        let t = self.clock.view();

        let assignments = match proceed_group_state(&snapshot, reporting_node_id, t) {
            Ok(assignments) => assignments,
            Err(e) => {
                error!("Group state machine failed: {}", e);
                return Err(e);
            }
        };

        let mut last_description = String::new();
        for assignment in &assignments {
            let node = nodes
                .get_mut(&assignment.node_id)
                .expect("engine only assigns to nodes of its snapshot");

            node.goal_state = assignment.goal_state;
            node.state_change_time = t.now;

            // Paired assignments share one description; notify it once on
            // the log channel but keep one structured event per assignment.
            if assignment.description != last_description {
                self.bus.log_and_notify(&assignment.description);
                last_description = assignment.description.clone();
            }
            self.bus
                .notify_state_change(node, assignment.goal_state, &assignment.description);
        }

        Ok(())
    }
}

/// Group id of the rows at hand; rows of one map always share it.
fn formation_group_of(nodes: &BTreeMap<i64, Node>) -> i32 {
    nodes.values().next().map(|n| n.group_id).unwrap_or(0)
}
