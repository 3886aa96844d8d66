// tests/property_engine_test.rs

//! Property-based tests for the transition engine: safety invariants that
//! must hold for every reachable (and many unreachable) group snapshots.

use proptest::prelude::*;
use std::time::{Duration, Instant};
use steward::core::clock::ClockView;
use steward::core::fsm::{
    Formation, FormationKind, FormationSettings, GroupSnapshot, Node, NodeHealth,
    ReplicationState, SyncState, proceed_group_state,
};

const MB: u64 = 1024 * 1024;

fn settings() -> FormationSettings {
    FormationSettings {
        enable_sync_lag_threshold: 16 * MB,
        promote_lag_threshold: 16 * MB,
        drain_timeout: Duration::from_secs(30),
        unhealthy_timeout: Duration::from_secs(20),
        startup_grace: Duration::from_secs(10),
    }
}

fn any_state() -> impl Strategy<Value = ReplicationState> {
    use ReplicationState::*;
    prop::sample::select(vec![
        Single,
        WaitPrimary,
        Primary,
        JoinPrimary,
        ApplySettings,
        WaitStandby,
        Catchingup,
        Secondary,
        PreparePromotion,
        StopReplication,
        DemoteTimeout,
        Draining,
        Demoted,
    ])
}

fn any_health() -> impl Strategy<Value = NodeHealth> {
    prop::sample::select(vec![NodeHealth::Unknown, NodeHealth::Good, NodeHealth::Bad])
}

#[derive(Debug, Clone)]
struct NodeSpec {
    reported_state: ReplicationState,
    goal_state: ReplicationState,
    health: NodeHealth,
    pg_is_running: bool,
    reported_lsn: u64,
    candidate_priority: i32,
    replication_quorum: bool,
    silent_secs: u64,
    state_change_secs_ago: u64,
}

fn any_node_spec() -> impl Strategy<Value = NodeSpec> {
    (
        any_state(),
        any_state(),
        any_health(),
        any::<bool>(),
        0u64..64 * MB,
        0i32..=100,
        any::<bool>(),
        0u64..60,
        0u64..60,
    )
        .prop_map(
            |(
                reported_state,
                goal_state,
                health,
                pg_is_running,
                reported_lsn,
                candidate_priority,
                replication_quorum,
                silent_secs,
                state_change_secs_ago,
            )| NodeSpec {
                reported_state,
                goal_state,
                health,
                pg_is_running,
                reported_lsn,
                candidate_priority,
                replication_quorum,
                silent_secs,
                state_change_secs_ago,
            },
        )
}

/// Builds a snapshot where `now` sits 60s after every node's baseline, so
/// the per-node "seconds ago" offsets stay in the past.
fn build_snapshot(kind: FormationKind, specs: Vec<NodeSpec>) -> (GroupSnapshot, ClockView) {
    let base = Instant::now();
    let now = base + Duration::from_secs(60);
    let group_id = if kind == FormationKind::Sharded { 1 } else { 0 };

    let nodes = specs
        .into_iter()
        .enumerate()
        .map(|(i, spec)| Node {
            node_id: i as i64 + 1,
            formation_id: "default".to_string(),
            group_id,
            node_name: format!("node{}", i + 1),
            node_port: 5432,
            goal_state: spec.goal_state,
            reported_state: spec.reported_state,
            report_time: now - Duration::from_secs(spec.silent_secs),
            pg_is_running: spec.pg_is_running,
            sync_state: SyncState::Async,
            health: spec.health,
            health_check_time: base + Duration::from_secs(1),
            state_change_time: now - Duration::from_secs(spec.state_change_secs_ago),
            reported_lsn: spec.reported_lsn,
            candidate_priority: spec.candidate_priority,
            replication_quorum: spec.replication_quorum,
        })
        .collect();

    let formation = Formation {
        formation_id: "default".to_string(),
        kind,
        settings: settings(),
    };

    (
        GroupSnapshot::new(formation, nodes),
        ClockView {
            now,
            process_start: base,
        },
    )
}

fn primary_like_goal_count(nodes: &[Node]) -> usize {
    nodes
        .iter()
        .filter(|n| n.goal_state.can_take_writes())
        .count()
}

/// Nodes that look primary-like on either side of the convergence guard.
/// Reachable group states never hold more than one of these.
fn primary_like_node_count(nodes: &[Node]) -> usize {
    nodes
        .iter()
        .filter(|n| n.reported_state.can_take_writes() || n.goal_state.can_take_writes())
        .count()
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 512,
        ..ProptestConfig::default()
    })]

    /// Equal inputs always produce equal outputs.
    #[test]
    fn test_engine_is_deterministic(
        specs in prop::collection::vec(any_node_spec(), 1..=5),
        reporter in 0usize..5,
        sharded in any::<bool>(),
    ) {
        let kind = if sharded { FormationKind::Sharded } else { FormationKind::Plain };
        let reporter_id = (reporter % specs.len()) as i64 + 1;
        let (snapshot, t) = build_snapshot(kind, specs);

        let first = proceed_group_state(&snapshot, reporter_id, t);
        let second = proceed_group_state(&snapshot, reporter_id, t);
        prop_assert_eq!(first, second);
    }

    /// The engine never mutates its snapshot: it is a pure function.
    #[test]
    fn test_engine_leaves_snapshot_untouched(
        specs in prop::collection::vec(any_node_spec(), 1..=5),
        reporter in 0usize..5,
    ) {
        let reporter_id = (reporter % specs.len()) as i64 + 1;
        let (snapshot, t) = build_snapshot(FormationKind::Plain, specs);
        let before = snapshot.nodes.clone();

        let _ = proceed_group_state(&snapshot, reporter_id, t);
        prop_assert_eq!(before, snapshot.nodes);
    }

    /// A single invocation assigns at most one primary-like goal state, and
    /// applying its output to a group that satisfied the at-most-one-primary
    /// invariant cannot break that invariant.
    #[test]
    fn test_primary_like_uniqueness_is_preserved(
        specs in prop::collection::vec(any_node_spec(), 1..=5),
        reporter in 0usize..5,
        sharded in any::<bool>(),
    ) {
        let kind = if sharded { FormationKind::Sharded } else { FormationKind::Plain };
        let reporter_id = (reporter % specs.len()) as i64 + 1;
        let (snapshot, t) = build_snapshot(kind, specs);

        let Ok(assignments) = proceed_group_state(&snapshot, reporter_id, t) else {
            // Inconsistent snapshot: nothing was assigned, nothing changed.
            return Ok(());
        };

        let primary_like_assigned = assignments
            .iter()
            .filter(|a| a.goal_state.can_take_writes())
            .count();
        prop_assert!(primary_like_assigned <= 1);

        if primary_like_node_count(&snapshot.nodes) <= 1 {
            let mut after = snapshot.nodes.clone();
            for assignment in &assignments {
                let node = after
                    .iter_mut()
                    .find(|n| n.node_id == assignment.node_id)
                    .expect("assignments only target snapshot nodes");
                node.goal_state = assignment.goal_state;
            }
            prop_assert!(primary_like_goal_count(&after) <= 1);
        }
    }

    /// A node with candidate priority zero or outside the replication
    /// quorum is never told to prepare a promotion.
    #[test]
    fn test_non_candidates_are_never_promoted(
        specs in prop::collection::vec(any_node_spec(), 1..=5),
        reporter in 0usize..5,
    ) {
        let reporter_id = (reporter % specs.len()) as i64 + 1;
        let (snapshot, t) = build_snapshot(FormationKind::Plain, specs);

        let Ok(assignments) = proceed_group_state(&snapshot, reporter_id, t) else {
            return Ok(());
        };

        for assignment in &assignments {
            if assignment.goal_state == ReplicationState::PreparePromotion {
                let node = snapshot.node(assignment.node_id).expect("node exists");
                prop_assert!(node.candidate_priority > 0);
                prop_assert!(node.replication_quorum);
            }
        }
    }

    /// stop_replication is only ever assigned to a node that has converged
    /// through prepare_promotion, and always together with demote_timeout
    /// for the old primary of the same group.
    #[test]
    fn test_promotion_commit_is_always_paired(
        specs in prop::collection::vec(any_node_spec(), 1..=5),
        reporter in 0usize..5,
    ) {
        let reporter_id = (reporter % specs.len()) as i64 + 1;
        let (snapshot, t) = build_snapshot(FormationKind::Plain, specs);

        let Ok(assignments) = proceed_group_state(&snapshot, reporter_id, t) else {
            return Ok(());
        };

        for assignment in &assignments {
            if assignment.goal_state == ReplicationState::StopReplication {
                let node = snapshot.node(assignment.node_id).expect("node exists");
                prop_assert!(node.is_current_state(ReplicationState::PreparePromotion));
                prop_assert!(
                    assignments
                        .iter()
                        .any(|other| other.goal_state == ReplicationState::DemoteTimeout
                            && other.node_id != assignment.node_id)
                );
            }
        }
    }

    /// Catchingup never jumps straight to stop_replication: whatever the
    /// snapshot, a node currently catching up is only ever assigned states
    /// on the admission side of the machine.
    #[test]
    fn test_catching_up_node_never_stops_replication(
        specs in prop::collection::vec(any_node_spec(), 1..=5),
        reporter in 0usize..5,
    ) {
        let reporter_id = (reporter % specs.len()) as i64 + 1;
        let (snapshot, t) = build_snapshot(FormationKind::Plain, specs);

        let Ok(assignments) = proceed_group_state(&snapshot, reporter_id, t) else {
            return Ok(());
        };

        for assignment in &assignments {
            let node = snapshot.node(assignment.node_id).expect("node exists");
            if node.is_current_state(ReplicationState::Catchingup) {
                prop_assert_ne!(assignment.goal_state, ReplicationState::StopReplication);
                prop_assert_ne!(assignment.goal_state, ReplicationState::PreparePromotion);
            }
        }
    }
}
