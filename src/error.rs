use thiserror::Error;

use crate::raft::state::Role;

/// A role change that the state machine does not allow.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid state transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: Role,
    pub to: Role,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// A timer fired in a role that should have cancelled it.
    #[error("Protocol invariant violated: {0}")]
    ProtocolInvariantViolation(String),

    #[error("No leader in the cluster")]
    NoLeader,

    #[error("Multiple leaders in the cluster: {0}")]
    MultipleLeaders(usize),

    #[error("Not enough followers ({followers} of {members}), split brain")]
    SplitBrain { followers: usize, members: usize },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl RaftError {
    /// True for the failures reported by `Cluster::check_invariant`.
    pub fn is_cluster_invalid(&self) -> bool {
        matches!(
            self,
            RaftError::NoLeader | RaftError::MultipleLeaders(_) | RaftError::SplitBrain { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
