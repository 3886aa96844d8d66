// src/core/fsm/mod.rs

//! The group finite state machine: the replication-state vocabulary, the
//! node and formation records, the health and lag predicates, and the pure
//! transition engine that drives failover decisions.

pub mod engine;
pub mod node;
pub mod predicates;
pub mod state;

pub use engine::{Assignment, GroupSnapshot, proceed_group_state};
pub use node::{Formation, FormationKind, FormationSettings, Node};
pub use state::{NodeHealth, ReplicationState, SyncState};
