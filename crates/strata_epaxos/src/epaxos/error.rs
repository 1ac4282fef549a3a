//! Error taxonomy for the consensus core.

use thiserror::Error;

use super::types::Ballot;

#[derive(Debug, Error)]
pub enum ConsensusError {
    /// A replica holds a higher ballot for the instance. Recoverable: bump
    /// past `ballot` and retry. Never surfaced to clients.
    #[error("ballot superseded, highest seen {ballot}")]
    Ballot { ballot: Ballot },

    /// A quorum was not reached within the phase window.
    #[error("{phase} did not reach quorum in time")]
    Timeout { phase: &'static str },

    /// The engine observed a state it guarantees cannot happen. Fatal to the
    /// operation; crashing the process is acceptable.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// `StateStore::apply` failed. The instance stays committed; re-execution
    /// will replay it.
    #[error("store apply failed")]
    Store(#[source] anyhow::Error),

    /// The local node is not in the replica set for the requested key.
    /// Forwarding to a replica is the responsibility of the layer above.
    #[error("node is not a replica for the requested key")]
    NotReplica,
}

impl ConsensusError {
    pub fn is_ballot(&self) -> bool {
        matches!(self, ConsensusError::Ballot { .. })
    }

    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        ConsensusError::Invariant(msg.into())
    }
}

pub(crate) type Result<T> = std::result::Result<T, ConsensusError>;
