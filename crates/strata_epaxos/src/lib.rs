//! Leaderless consensus core for the strata key-value store.
//!
//! Any replica may lead a command. Non-conflicting commands commit in one
//! round-trip to a fast quorum; conflicting commands serialize through a
//! recorded dependency graph and execute in a deterministic order on every
//! replica. The state store, the transport, and the durable instance log are
//! supplied by the embedding process through the traits in this crate.

mod epaxos;

pub use epaxos::{
    fast_quorum, slow_quorum, AcceptRequest, AcceptResponse, Ballot, Cluster, CommitRequest,
    CommitResponse, Config, ConsensusError, Instance, InstanceId, InstanceLog, InstanceRecord,
    InstanceSnapshot, InstanceStatus, Instruction, Manager, MemoryLog, NodeId, PreAcceptRequest,
    PreAcceptResponse, PrepareRequest, PrepareResponse, PrepareSuccessorRequest,
    PrepareSuccessorResponse, StateStore, StatsSnapshot,
};
