// src/core/fsm/state.rs

//! The closed replication-state vocabulary shared by every node of a group,
//! plus the tags reported alongside it (sync state, health).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle position of a node within its group. The set is closed: every
/// transition rule pattern-matches exhaustively over these values.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationState {
    /// Sole node in the group; accepts writes, no replication.
    Single,
    /// Writable primary without a healthy synchronous standby; synchronous
    /// replication is off to preserve availability.
    WaitPrimary,
    /// Writable primary with at least one healthy synchronous standby.
    Primary,
    /// Primary preparing a replication slot and auth entries for a joining
    /// standby while continuing to serve.
    JoinPrimary,
    /// Primary applying a replication-properties change before returning to
    /// `primary`.
    ApplySettings,
    /// New node waiting for the primary to admit it.
    WaitStandby,
    /// Standby streaming but not yet within the lag threshold; not a
    /// promotion candidate.
    Catchingup,
    /// Healthy standby, caught up, eligible for promotion.
    Secondary,
    /// Chosen standby finishing replay before cutting off replication.
    PreparePromotion,
    /// Chosen standby has stopped replaying and is about to accept writes.
    StopReplication,
    /// Former primary given a bounded window to self-fence.
    DemoteTimeout,
    /// Former primary shutting down writes.
    Draining,
    /// Former primary fully down; eligible to rejoin as a standby.
    Demoted,
}

impl ReplicationState {
    /// The wire and log spelling of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationState::Single => "single",
            ReplicationState::WaitPrimary => "wait_primary",
            ReplicationState::Primary => "primary",
            ReplicationState::JoinPrimary => "join_primary",
            ReplicationState::ApplySettings => "apply_settings",
            ReplicationState::WaitStandby => "wait_standby",
            ReplicationState::Catchingup => "catchingup",
            ReplicationState::Secondary => "secondary",
            ReplicationState::PreparePromotion => "prepare_promotion",
            ReplicationState::StopReplication => "stop_replication",
            ReplicationState::DemoteTimeout => "demote_timeout",
            ReplicationState::Draining => "draining",
            ReplicationState::Demoted => "demoted",
        }
    }

    /// Whether a node in this state accepts writes. This is the
    /// "primary-like" set: at most one node per group may have a goal state
    /// in it.
    pub fn can_take_writes(&self) -> bool {
        matches!(
            self,
            ReplicationState::Single
                | ReplicationState::WaitPrimary
                | ReplicationState::Primary
                | ReplicationState::JoinPrimary
                | ReplicationState::ApplySettings
        )
    }

    /// Whether this state belongs to a primary node, either healthy or in
    /// the middle of being demoted.
    pub fn belongs_to_primary(&self) -> bool {
        self.can_take_writes()
            || matches!(
                self,
                ReplicationState::Draining
                    | ReplicationState::DemoteTimeout
                    | ReplicationState::Demoted
            )
    }

    /// Whether this state belongs to a standby, from first admission all
    /// the way through promotion.
    pub fn is_standby_like(&self) -> bool {
        matches!(
            self,
            ReplicationState::WaitStandby
                | ReplicationState::Catchingup
                | ReplicationState::Secondary
                | ReplicationState::PreparePromotion
                | ReplicationState::StopReplication
        )
    }

    /// Whether this is a resting state no rule moves a node out of without
    /// external input (a report, a health change, or a settings change).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReplicationState::Single | ReplicationState::Primary | ReplicationState::Secondary
        )
    }
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The synchronous-replication role a standby reports, mirroring the values
/// of `pg_stat_replication.sync_state`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Unknown,
    Sync,
    Async,
    Quorum,
    Potential,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Unknown => "unknown",
            SyncState::Sync => "sync",
            SyncState::Async => "async",
            SyncState::Quorum => "quorum",
            SyncState::Potential => "potential",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict of the last external health probe for a node.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    #[default]
    Unknown,
    Good,
    Bad,
}

impl fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeHealth::Unknown => "unknown",
            NodeHealth::Good => "good",
            NodeHealth::Bad => "bad",
        };
        f.write_str(name)
    }
}
