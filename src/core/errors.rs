// src/core/errors.rs

//! Defines the primary error type for the entire application.

use thiserror::Error;

/// The main error enum, representing all possible failures within the
/// coordinator. Using `thiserror` allows for clean error definitions and
/// automatic `From` trait implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StewardError {
    #[error("formation \"{0}\" does not exist")]
    UnknownFormation(String),

    #[error("formation \"{0}\" already exists")]
    FormationExists(String),

    #[error(
        "node of kind \"{node_kind}\" can not be registered in formation \
         \"{formation}\" of kind \"{formation_kind}\""
    )]
    FormationKindMismatch {
        formation: String,
        formation_kind: String,
        node_kind: String,
    },

    #[error("node {0} is not registered")]
    NodeNotRegistered(i64),

    #[error("group {group} is not valid in formation \"{formation}\": a plain formation only has group 0")]
    InvalidGroup { formation: String, group: i32 },

    #[error("primary node is still initializing, retry registering in a moment")]
    PrimaryNotReady,

    #[error("primary node {0} is already registering a standby, retry in a moment")]
    RegistrationConflict(String),

    #[error("couldn't find the primary node in formation \"{formation}\", group {group}")]
    PrimaryNotFound { formation: String, group: i32 },

    #[error(
        "invalid value for candidate_priority \"{0}\", \
         expected an integer value between 0 and 100"
    )]
    InvalidCandidatePriority(i32),

    #[error("operation not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
