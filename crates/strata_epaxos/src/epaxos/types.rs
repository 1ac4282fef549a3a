//! Shared types for the consensus core.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by the engine, the transport layer, and the state-store seam alike.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::instance::InstanceSnapshot;

/// Logical node identifier within a replica set.
pub type NodeId = u64;

/// Monotonic counter distinguishing competing proposers for one instance.
pub type Ballot = u32;

/// Leader id recorded on instances materialized from an accept or commit for
/// an id this replica has never seen. Those messages do not carry the leader,
/// and treating the instance as remote-led is always safe.
pub(crate) const UNKNOWN_LEADER: NodeId = NodeId::MAX;

/// Globally unique, time-ordered instance identifier.
///
/// The embedded timestamp is bumped monotonically per process, so ids from a
/// single node never regress. The `(micros, node, counter)` total order is
/// the execution tiebreaker after sequence numbers.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct InstanceId {
    pub micros: u64,
    pub node: NodeId,
    pub counter: u32,
}

impl InstanceId {
    pub fn timestamp_micros(&self) -> u64 {
        self.micros
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:x}-{:x}", self.micros, self.node, self.counter)
    }
}

/// One state-store operation as submitted by a client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub cmd: String,
    pub key: String,
    pub args: Vec<String>,
    /// Client-assigned micros since epoch; applied verbatim by the store.
    pub timestamp: u64,
}

impl Instruction {
    pub fn new(
        cmd: impl Into<String>,
        key: impl Into<String>,
        args: Vec<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            cmd: cmd.into(),
            key: key.into(),
            args,
            timestamp,
        }
    }
}

/// Simple-majority quorum over `n` replicas, leader included.
pub fn slow_quorum(n: usize) -> usize {
    n / 2 + 1
}

/// Fast-path quorum over `n` replicas, leader included: `ceil(3N/4)`. For
/// the usual odd-sized replica sets this is `F + floor((F+1)/2)` remote
/// responders plus the leader.
pub fn fast_quorum(n: usize) -> usize {
    (3 * n).div_ceil(4)
}

/// Engine tuning. Every phase wait is bounded by one of these.
#[derive(Clone, Debug)]
pub struct Config {
    /// Upper bound on one pre-accept round, fan-out to fast quorum.
    pub preaccept_timeout: Duration,
    /// Upper bound on one accept round, fan-out to simple majority.
    pub accept_timeout: Duration,
    /// Upper bound on one prepare round.
    pub prepare_timeout: Duration,
    /// How long a recovering node waits on each successor before moving on.
    pub successor_timeout: Duration,
    /// Grace period after pre-accept before anyone may start recovery.
    pub commit_grace: Duration,
    /// Grace period the executor gives a local client task to apply its own
    /// instance before applying it out from under it.
    pub execute_grace: Duration,
    /// Attempts before a ballot-contended operation gives up.
    pub ballot_failure_retries: u32,
    /// Base wait unit for jittered ballot-retry backoff.
    pub ballot_failure_wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preaccept_timeout: Duration::from_secs(2),
            accept_timeout: Duration::from_secs(2),
            prepare_timeout: Duration::from_secs(2),
            successor_timeout: Duration::from_millis(500),
            commit_grace: Duration::from_secs(2),
            execute_grace: Duration::from_secs(2),
            ballot_failure_retries: 4,
            ballot_failure_wait: Duration::from_millis(250),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreAcceptRequest {
    pub instance: InstanceSnapshot,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreAcceptResponse {
    pub accepted: bool,
    pub ballot: Ballot,
    pub seq: u64,
    pub deps: Vec<InstanceId>,
    /// Instances in the responder's merged dep set that the proposal did not
    /// carry; the leader inserts unknown ones before running accept.
    pub missing_instances: Vec<InstanceSnapshot>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub id: InstanceId,
    pub ballot: Ballot,
    pub seq: u64,
    pub deps: Vec<InstanceId>,
    /// Instances gathered during pre-accept that the receiver may be missing.
    pub missing_instances: Vec<InstanceSnapshot>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcceptResponse {
    pub accepted: bool,
    pub ballot: Ballot,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitRequest {
    pub id: InstanceId,
    pub ballot: Ballot,
    pub seq: u64,
    pub deps: Vec<InstanceId>,
    pub noop: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitResponse {
    pub accepted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub id: InstanceId,
    pub ballot: Ballot,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub accepted: bool,
    /// The responder's ballot; the asker adopts it via max.
    pub ballot: Ballot,
    pub instance: Option<InstanceSnapshot>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareSuccessorRequest {
    pub id: InstanceId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareSuccessorResponse {
    pub instance: Option<InstanceSnapshot>,
}

/// Application state store driven by the execution engine.
///
/// `apply` must be deterministic across replicas for the same instruction:
/// the engine guarantees every replica applies interfering instructions in
/// the same order, and applies each instance exactly once.
pub trait StateStore: Send + Sync + 'static {
    fn apply(&self, instruction: &Instruction) -> anyhow::Result<Option<Vec<u8>>>;

    /// Read-repair hook for layers above the core; unused by the engine.
    fn reconcile(
        &self,
        _key: &str,
        values: &[Option<Vec<u8>>],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(values.iter().flatten().next().cloned())
    }

    fn is_read_only(&self, cmd: &str) -> bool;

    fn is_write_only(&self, cmd: &str) -> bool;

    /// Hierarchical keys an instruction touches, usually `[instruction.key]`.
    fn interfering_keys(&self, instruction: &Instruction) -> Vec<String> {
        vec![instruction.key.clone()]
    }
}

/// Cluster seam: identity, key placement, and typed sends for the five
/// consensus messages. Implementations can use any transport; the engine
/// assumes per-peer FIFO delivery.
#[async_trait]
pub trait Cluster: Send + Sync + 'static {
    fn local_id(&self) -> NodeId;

    fn replicas_for_key(&self, key: &str) -> Vec<NodeId>;

    async fn pre_accept(
        &self,
        peer: NodeId,
        req: PreAcceptRequest,
    ) -> anyhow::Result<PreAcceptResponse>;

    async fn accept(&self, peer: NodeId, req: AcceptRequest) -> anyhow::Result<AcceptResponse>;

    async fn commit(&self, peer: NodeId, req: CommitRequest) -> anyhow::Result<CommitResponse>;

    async fn prepare(&self, peer: NodeId, req: PrepareRequest) -> anyhow::Result<PrepareResponse>;

    async fn prepare_successor(
        &self,
        peer: NodeId,
        req: PrepareSuccessorRequest,
    ) -> anyhow::Result<PrepareSuccessorResponse>;
}
