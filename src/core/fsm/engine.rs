// src/core/fsm/engine.rs

//! The pure transition engine for one group. Given a by-value snapshot of
//! the group and the identity of the reporting node, it decides which nodes
//! must move to which new goal states. The first matching rule wins, the
//! engine performs no I/O, and equal inputs always produce equal outputs;
//! the caller persists the assignments and emits the events.

use super::node::{Formation, FormationKind, Node};
use super::predicates::{drain_expired, is_healthy, is_unhealthy, lag_within};
use super::state::ReplicationState;
use crate::core::clock::ClockView;
use crate::core::errors::StewardError;

/// One goal-state assignment decided by the engine, with the human-readable
/// description that ends up in the event row and on the log channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub node_id: i64,
    pub goal_state: ReplicationState,
    pub description: String,
}

/// A consistent, by-value copy of one group: the formation record and every
/// node row, held in node-id order so that decisions over "the other nodes"
/// are deterministic.
#[derive(Debug, Clone)]
pub struct GroupSnapshot {
    pub formation: Formation,
    pub nodes: Vec<Node>,
}

impl GroupSnapshot {
    pub fn new(formation: Formation, mut nodes: Vec<Node>) -> Self {
        nodes.sort_by_key(|n| n.node_id);
        Self { formation, nodes }
    }

    pub fn node(&self, node_id: i64) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    fn others(&self, node_id: i64) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.node_id != node_id)
    }

    /// Locates the group's primary among the nodes other than `excluding`.
    ///
    /// A node qualifies when its reported or goal state can take writes;
    /// when none does, the scan falls back to any state that belongs to a
    /// primary (draining, demote_timeout, demoted), which is where the old
    /// primary sits for the tail end of a failover. Excluding the reporting
    /// node keeps a demoted ex-primary from finding itself.
    pub fn find_primary_node(&self, excluding: i64) -> Option<&Node> {
        self.others(excluding)
            .find(|n| n.reported_state.can_take_writes() || n.goal_state.can_take_writes())
            .or_else(|| {
                self.others(excluding).find(|n| {
                    n.reported_state.belongs_to_primary() || n.goal_state.belongs_to_primary()
                })
            })
    }
}

/// Proceeds the state machine of the group the reporting node is part of.
///
/// Returns the (possibly empty) list of assignments the caller must apply.
/// An empty list is a normal outcome: no rule matched, nothing to do. The
/// only error is an inconsistent snapshot, where a rule needs the group's
/// primary and none can be located.
pub fn proceed_group_state(
    snapshot: &GroupSnapshot,
    reporting_node_id: i64,
    t: ClockView,
) -> Result<Vec<Assignment>, StewardError> {
    let active = snapshot
        .node(reporting_node_id)
        .ok_or(StewardError::NodeNotRegistered(reporting_node_id))?;

    // When there's no other node anymore, not even one: collapse to single.
    if snapshot.nodes.len() == 1 && !active.is_current_state(ReplicationState::Single) {
        let description = format!(
            "Setting goal state of {} to single as there is no other node.",
            active.label()
        );
        return Ok(vec![Assignment {
            node_id: active.node_id,
            goal_state: ReplicationState::Single,
            description,
        }]);
    }

    // The primary's state machine loops over every other node to take its
    // decisions, so it lives in a specialized function.
    if active.is_in_primary_state() {
        return Ok(proceed_group_state_for_primary(snapshot, active, t));
    }

    let Some(primary) = snapshot.find_primary_node(active.node_id) else {
        return Err(StewardError::PrimaryNotFound {
            formation: snapshot.formation.formation_id.clone(),
            group: active.group_id,
        });
    };

    let settings = &snapshot.formation.settings;

    // when the primary is ready for replication:
    //  wait_standby -> catchingup
    if active.is_current_state(ReplicationState::WaitStandby)
        && (primary.is_current_state(ReplicationState::WaitPrimary)
            || primary.is_current_state(ReplicationState::JoinPrimary))
    {
        let description = format!(
            "Setting goal state of {} to catchingup after {} converged to {}.",
            active.label(),
            primary.label(),
            primary.goal_state
        );

        // start replication
        return Ok(vec![Assignment {
            node_id: active.node_id,
            goal_state: ReplicationState::Catchingup,
            description,
        }]);
    }

    // when the standby caught up:
    //    catchingup -> secondary
    //  wait_primary -> primary
    if active.is_current_state(ReplicationState::Catchingup)
        && (primary.is_current_state(ReplicationState::WaitPrimary)
            || primary.is_current_state(ReplicationState::JoinPrimary))
        && is_healthy(Some(active))
        && lag_within(
            Some(active),
            Some(primary),
            settings.enable_sync_lag_threshold,
        )
    {
        let description = format!(
            "Setting goal state of {} to primary and {} to secondary after {} caught up.",
            primary.label(),
            active.label(),
            active.label()
        );

        return Ok(vec![
            // node is ready for promotion
            Assignment {
                node_id: active.node_id,
                goal_state: ReplicationState::Secondary,
                description: description.clone(),
            },
            // the primary can enable synchronous commit
            Assignment {
                node_id: primary.node_id,
                goal_state: ReplicationState::Primary,
                description,
            },
        ]);
    }

    // when the primary fails:
    //  secondary -> prepare_promotion
    //    primary -> draining
    //
    // A node with candidate priority zero or outside the replication quorum
    // is never picked for promotion.
    if active.is_current_state(ReplicationState::Secondary)
        && primary.is_in_primary_state()
        && is_unhealthy(Some(primary), settings, t)
        && is_healthy(Some(active))
        && lag_within(Some(active), Some(primary), settings.promote_lag_threshold)
        && active.candidate_priority > 0
        && active.replication_quorum
    {
        let description = format!(
            "Setting goal state of {} to draining and {} to prepare_promotion after {} became unhealthy.",
            primary.label(),
            active.label(),
            primary.label()
        );

        return Ok(vec![
            // keep reading until no more records are available
            Assignment {
                node_id: active.node_id,
                goal_state: ReplicationState::PreparePromotion,
                description: description.clone(),
            },
            // shut down the old primary
            Assignment {
                node_id: primary.node_id,
                goal_state: ReplicationState::Draining,
                description,
            },
        ]);
    }

    // sharded short-cut: the routing layer already fenced writes on the old
    // primary, no demote timeout dance is needed.
    //  prepare_promotion -> wait_primary
    if active.is_current_state(ReplicationState::PreparePromotion)
        && snapshot.formation.kind == FormationKind::Sharded
        && active.group_id > 0
    {
        let description = format!(
            "Setting goal state of {} to wait_primary and {} to demoted after the router fenced writes on the old primary.",
            active.label(),
            primary.label()
        );

        return Ok(vec![
            // node is now taking writes
            Assignment {
                node_id: active.node_id,
                goal_state: ReplicationState::WaitPrimary,
                description: description.clone(),
            },
            // done draining, node is presumed dead
            Assignment {
                node_id: primary.node_id,
                goal_state: ReplicationState::Demoted,
                description,
            },
        ]);
    }

    // when the chosen standby is seeing no more writes:
    //  prepare_promotion -> stop_replication
    if active.is_current_state(ReplicationState::PreparePromotion) {
        let description = format!(
            "Setting goal state of {} to demote_timeout and {} to stop_replication after {} converged to prepare_promotion.",
            primary.label(),
            active.label(),
            active.label()
        );

        return Ok(vec![
            // perform promotion to stop replication
            Assignment {
                node_id: active.node_id,
                goal_state: ReplicationState::StopReplication,
                description: description.clone(),
            },
            // wait for the possibly-alive primary to kill itself
            Assignment {
                node_id: primary.node_id,
                goal_state: ReplicationState::DemoteTimeout,
                description,
            },
        ]);
    }

    // when the drain time expires or the primary reports it's drained:
    //  stop_replication -> wait_primary
    if active.is_current_state(ReplicationState::StopReplication)
        && (primary.is_current_state(ReplicationState::DemoteTimeout)
            || drain_expired(Some(primary), settings, t))
    {
        let description = format!(
            "Setting goal state of {} to wait_primary and {} to demoted after the demote timeout expired.",
            active.label(),
            primary.label()
        );

        return Ok(vec![
            // node is now taking writes
            Assignment {
                node_id: active.node_id,
                goal_state: ReplicationState::WaitPrimary,
                description: description.clone(),
            },
            // done draining, node is presumed dead
            Assignment {
                node_id: primary.node_id,
                goal_state: ReplicationState::Demoted,
                description,
            },
        ]);
    }

    // sharded short-cut, same fencing argument as above:
    //  stop_replication -> wait_primary
    if active.is_current_state(ReplicationState::StopReplication)
        && snapshot.formation.kind == FormationKind::Sharded
        && active.group_id > 0
    {
        let description = format!(
            "Setting goal state of {} to wait_primary and {} to demoted after the router fenced writes on the old primary.",
            active.label(),
            primary.label()
        );

        return Ok(vec![
            Assignment {
                node_id: active.node_id,
                goal_state: ReplicationState::WaitPrimary,
                description: description.clone(),
            },
            Assignment {
                node_id: primary.node_id,
                goal_state: ReplicationState::Demoted,
                description,
            },
        ]);
    }

    // when the new primary is ready:
    //  demoted -> catchingup
    if active.is_current_state(ReplicationState::Demoted)
        && primary.is_current_state(ReplicationState::WaitPrimary)
    {
        let description = format!(
            "Setting goal state of {} to catchingup after it converged to demoted and {} converged to wait_primary.",
            active.label(),
            primary.label()
        );

        // it's safe to rejoin as a standby
        return Ok(vec![Assignment {
            node_id: active.node_id,
            goal_state: ReplicationState::Catchingup,
            description,
        }]);
    }

    // No rule fired. A normal outcome: the caller returns the node's
    // current goal state unchanged.
    Ok(Vec::new())
}

/// Group state machine when the reporting node is the group's primary.
fn proceed_group_state_for_primary(
    snapshot: &GroupSnapshot,
    primary: &Node,
    t: ClockView,
) -> Vec<Assignment> {
    let settings = &snapshot.formation.settings;
    let other_nodes: Vec<&Node> = snapshot.others(primary.node_id).collect();

    // when a first standby wants to join:
    //  single -> wait_primary
    if primary.is_current_state(ReplicationState::Single) {
        for &other_node in &other_nodes {
            if other_node.is_current_state(ReplicationState::WaitStandby) {
                let description = format!(
                    "Setting goal state of {} to wait_primary after {} joined.",
                    primary.label(),
                    other_node.label()
                );

                // prepare the replication slot and auth entries
                return vec![Assignment {
                    node_id: primary.node_id,
                    goal_state: ReplicationState::WaitPrimary,
                    description,
                }];
            }
        }
    }

    // when an additional standby wants to join:
    //  primary -> join_primary
    if primary.is_current_state(ReplicationState::Primary) {
        for &other_node in &other_nodes {
            if other_node.is_current_state(ReplicationState::WaitStandby) {
                let description = format!(
                    "Setting goal state of {} to join_primary after {} joined.",
                    primary.label(),
                    other_node.label()
                );

                // prepare the replication slot and auth entries
                return vec![Assignment {
                    node_id: primary.node_id,
                    goal_state: ReplicationState::JoinPrimary,
                    description,
                }];
            }
        }
    }

    // standby-health bookkeeping:
    //  secondary -> catchingup      (for each standby that became unhealthy)
    //    primary -> wait_primary    (when no failover candidate remains)
    //
    // Synchronous replication must be disabled when no healthy quorum
    // standby remains, otherwise writes stall.
    if primary.is_current_state(ReplicationState::Primary) {
        let mut assignments = Vec::new();
        let mut failover_candidate_count = other_nodes.len() as i64;

        for &other_node in &other_nodes {
            if other_node.is_current_state(ReplicationState::Secondary)
                && is_unhealthy(Some(other_node), settings, t)
            {
                failover_candidate_count -= 1;

                let description = format!(
                    "Setting goal state of {} to catchingup after it became unhealthy.",
                    other_node.label()
                );

                // node is behind, no longer eligible for promotion
                assignments.push(Assignment {
                    node_id: other_node.node_id,
                    goal_state: ReplicationState::Catchingup,
                    description,
                });
            } else if !other_node.replication_quorum || other_node.candidate_priority == 0 {
                // also not a candidate
                failover_candidate_count -= 1;
            }

            if failover_candidate_count == 0 {
                let description = format!(
                    "Setting goal state of {} to wait_primary now that none of the standbys are healthy anymore.",
                    primary.label()
                );

                assignments.push(Assignment {
                    node_id: primary.node_id,
                    goal_state: ReplicationState::WaitPrimary,
                    description,
                });
            }
        }

        return assignments;
    }

    // when the primary has applied a replication-settings change:
    //  apply_settings -> primary
    if primary.is_current_state(ReplicationState::ApplySettings) {
        let description = format!(
            "Setting goal state of {} to primary after it applied replication properties change.",
            primary.label()
        );

        return vec![Assignment {
            node_id: primary.node_id,
            goal_state: ReplicationState::Primary,
            description,
        }];
    }

    Vec::new()
}
