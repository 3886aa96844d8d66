// src/core/fsm/predicates.rs

//! Health, lag, and drain predicates. All wall-clock reads come in through
//! a [`ClockView`] so the engine stays a pure function of its inputs.

use super::node::{FormationSettings, Node};
use super::state::{NodeHealth, ReplicationState};
use crate::core::clock::ClockView;

/// A node is healthy when its last health check succeeded and its agent
/// reports the database as running.
pub fn is_healthy(node: Option<&Node>) -> bool {
    let Some(node) = node else {
        return false;
    };

    node.health == NodeHealth::Good && node.pg_is_running
}

/// A node is unhealthy when it has been silent past the unhealthy timeout
/// and its last health check failed, or when its agent reports the database
/// as not running.
///
/// The health-check verdict only counts when the probe ran after the
/// coordinator's own start and the startup-grace window has passed, so a
/// coordinator restart does not declare the whole group dead.
pub fn is_unhealthy(node: Option<&Node>, settings: &FormationSettings, t: ClockView) -> bool {
    let Some(node) = node else {
        return true;
    };

    // If the agent isn't reporting, trust the external health checks.
    if t.now.saturating_duration_since(node.report_time) > settings.unhealthy_timeout
        && node.health == NodeHealth::Bad
        && node.health_check_time > t.process_start
        && t.now.saturating_duration_since(t.process_start) > settings.startup_grace
    {
        return true;
    }

    if !node.pg_is_running {
        return true;
    }

    false
}

/// Whether the most recently reported replay positions of the two nodes are
/// within `delta` bytes of each other. Returns false when either node has
/// not reported a position yet (zero means no data), and vacuously true
/// when both nodes are absent.
pub fn lag_within(node: Option<&Node>, other: Option<&Node>, delta: u64) -> bool {
    let (Some(node), Some(other)) = (node, other) else {
        return true;
    };

    let node_lsn = node.reported_lsn;
    let other_lsn = other.reported_lsn;

    if node_lsn == 0 || other_lsn == 0 {
        // we don't have any data yet
        return false;
    }

    node_lsn.abs_diff(other_lsn) <= delta
}

/// Whether a demoting primary has used up its drain window. Only meaningful
/// for a node currently assigned `demote_timeout`.
pub fn drain_expired(node: Option<&Node>, settings: &FormationSettings, t: ClockView) -> bool {
    let Some(node) = node else {
        return false;
    };

    if node.goal_state != ReplicationState::DemoteTimeout {
        return false;
    }

    t.now.saturating_duration_since(node.state_change_time) > settings.drain_timeout
}
