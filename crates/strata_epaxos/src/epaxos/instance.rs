//! Per-instance state machine.
//!
//! An instance is the unit of agreement: one client command set, its
//! dependency metadata, and the ballot protecting it. The manager's instance
//! map is the sole owner; everything else holds the `Arc` or just the id.
//! Mutable attributes live behind a fine-grained lock that is only ever held
//! for short, non-blocking sections.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::event::Event;
use super::types::{Ballot, InstanceId, Instruction, NodeId};

/// Lifecycle of an instance. Transitions are monotonically non-decreasing;
/// an attempt to move backward is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstanceStatus {
    PreAccepted,
    Accepted,
    Committed,
    Executed,
}

/// Serializable view of an instance: what travels on the wire and what the
/// instance log persists. The commit/execute deadlines are runtime-only and
/// deliberately absent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: InstanceId,
    pub leader: NodeId,
    pub commands: Vec<Instruction>,
    pub deps: Vec<InstanceId>,
    pub seq: u64,
    pub status: InstanceStatus,
    pub max_ballot: Ballot,
    pub noop: bool,
    /// Set when a quorum pre-accepted with attributes identical to the
    /// proposal; lets a recovering leader skip the accept round.
    pub dependency_match: bool,
}

#[derive(Debug)]
pub(crate) struct InstanceInner {
    pub(crate) commands: Vec<Instruction>,
    pub(crate) deps: BTreeSet<InstanceId>,
    pub(crate) seq: u64,
    pub(crate) status: InstanceStatus,
    pub(crate) max_ballot: Ballot,
    pub(crate) noop: bool,
    pub(crate) read_only: bool,
    pub(crate) dependency_match: bool,
    /// False for instances materialized from an accept/commit that carried
    /// only attributes. Such instances are never applied; prepare recovers
    /// their contents first.
    pub(crate) commands_known: bool,
    pub(crate) commit_deadline: Instant,
    pub(crate) execute_deadline: Instant,
}

impl InstanceInner {
    /// Monotonic status advance. Returns whether the status changed; moving
    /// backward is a rejected no-op.
    pub(crate) fn advance_status(&mut self, status: InstanceStatus) -> bool {
        if status <= self.status {
            return false;
        }
        self.status = status;
        true
    }
}

#[derive(Debug)]
pub struct Instance {
    pub id: InstanceId,
    pub leader: NodeId,
    pub(crate) inner: Mutex<InstanceInner>,
    pub(crate) commit_event: Event,
    pub(crate) execute_event: Event,
}

impl Instance {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_local(
        id: InstanceId,
        leader: NodeId,
        commands: Vec<Instruction>,
        read_only: bool,
        seq: u64,
        deps: BTreeSet<InstanceId>,
        commit_deadline: Instant,
        execute_deadline: Instant,
    ) -> Self {
        Self {
            id,
            leader,
            inner: Mutex::new(InstanceInner {
                commands,
                deps,
                seq,
                status: InstanceStatus::PreAccepted,
                max_ballot: 0,
                noop: false,
                read_only,
                dependency_match: false,
                commands_known: true,
                commit_deadline,
                execute_deadline,
            }),
            commit_event: Event::new(),
            execute_event: Event::new(),
        }
    }

    pub(crate) fn from_snapshot(
        snapshot: &InstanceSnapshot,
        read_only: bool,
        commit_deadline: Instant,
        execute_deadline: Instant,
    ) -> Self {
        let commands_known = !snapshot.commands.is_empty() || snapshot.noop;
        Self {
            id: snapshot.id,
            leader: snapshot.leader,
            inner: Mutex::new(InstanceInner {
                commands: snapshot.commands.clone(),
                deps: snapshot.deps.iter().copied().collect(),
                seq: snapshot.seq,
                status: snapshot.status,
                max_ballot: snapshot.max_ballot,
                noop: snapshot.noop,
                read_only,
                dependency_match: snapshot.dependency_match,
                commands_known,
                commit_deadline,
                execute_deadline,
            }),
            commit_event: Event::new(),
            execute_event: Event::new(),
        }
    }

    /// Attribute-only shell for an accept/commit naming an id this replica
    /// has never seen. Applied never; recovered via prepare.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn placeholder(
        id: InstanceId,
        leader: NodeId,
        seq: u64,
        deps: BTreeSet<InstanceId>,
        status: InstanceStatus,
        ballot: Ballot,
        noop: bool,
        commit_deadline: Instant,
        execute_deadline: Instant,
    ) -> Self {
        Self {
            id,
            leader,
            inner: Mutex::new(InstanceInner {
                commands: Vec::new(),
                deps,
                seq,
                status,
                max_ballot: ballot,
                noop,
                read_only: false,
                dependency_match: false,
                commands_known: noop,
                commit_deadline,
                execute_deadline,
            }),
            commit_event: Event::new(),
            execute_event: Event::new(),
        }
    }

    pub(crate) fn inner(&self) -> MutexGuard<'_, InstanceInner> {
        self.inner.lock().expect("instance lock poisoned")
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let inner = self.inner();
        InstanceSnapshot {
            id: self.id,
            leader: self.leader,
            commands: inner.commands.clone(),
            deps: inner.deps.iter().copied().collect(),
            seq: inner.seq,
            status: inner.status,
            max_ballot: inner.max_ballot,
            noop: inner.noop,
            dependency_match: inner.dependency_match,
        }
    }

    pub fn status(&self) -> InstanceStatus {
        self.inner().status
    }

    pub fn is_committed(&self) -> bool {
        self.status() >= InstanceStatus::Committed
    }

    pub fn seq(&self) -> u64 {
        self.inner().seq
    }

    pub fn deps(&self) -> Vec<InstanceId> {
        self.inner().deps.iter().copied().collect()
    }

    pub fn max_ballot(&self) -> Ballot {
        self.inner().max_ballot
    }

    pub fn is_noop(&self) -> bool {
        self.inner().noop
    }

    pub(crate) fn read_only(&self) -> bool {
        self.inner().read_only
    }

    pub(crate) fn commands_known(&self) -> bool {
        self.inner().commands_known
    }

    pub(crate) fn commands(&self) -> Vec<Instruction> {
        self.inner().commands.clone()
    }

    /// Merge a `(seq, deps)` pair into this instance, returning whether
    /// anything changed. Attributes are frozen once committed.
    pub(crate) fn merge_attributes(&self, seq: u64, deps: &[InstanceId]) -> bool {
        let mut inner = self.inner();
        if inner.status >= InstanceStatus::Committed {
            return false;
        }
        let mut changed = false;
        if seq > inner.seq {
            inner.seq = seq;
            changed = true;
        }
        for dep in deps {
            if *dep != self.id && inner.deps.insert(*dep) {
                changed = true;
            }
        }
        changed
    }

    /// Raise the ballot to at least `ballot`; returns the resulting value.
    pub(crate) fn observe_ballot(&self, ballot: Ballot) -> Ballot {
        let mut inner = self.inner();
        inner.max_ballot = inner.max_ballot.max(ballot);
        inner.max_ballot
    }

    /// Claim the next ballot above everything seen so far.
    pub(crate) fn next_ballot(&self) -> Ballot {
        let mut inner = self.inner();
        inner.max_ballot += 1;
        inner.max_ballot
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn test_instance(deps: &[InstanceId]) -> Instance {
        let now = Instant::now();
        Instance::new_local(
            InstanceId {
                micros: 1,
                node: 1,
                counter: 1,
            },
            1,
            vec![Instruction::new("SET", "a", vec!["1".into()], 1)],
            false,
            1,
            deps.iter().copied().collect(),
            now + Duration::from_secs(2),
            now + Duration::from_secs(2),
        )
    }

    fn iid(micros: u64) -> InstanceId {
        InstanceId {
            micros,
            node: 2,
            counter: 0,
        }
    }

    #[test]
    fn merge_attributes_unions_deps_and_maxes_seq() {
        let instance = test_instance(&[iid(10)]);
        assert!(instance.merge_attributes(3, &[iid(10), iid(11)]));
        assert_eq!(instance.seq(), 3);
        assert_eq!(instance.deps(), vec![iid(10), iid(11)]);

        // Re-merging the same attributes reports no change.
        assert!(!instance.merge_attributes(3, &[iid(10), iid(11)]));
        // A lower seq never wins.
        assert!(!instance.merge_attributes(1, &[iid(10)]));
        assert_eq!(instance.seq(), 3);
    }

    #[test]
    fn merge_attributes_never_records_self_dependency() {
        let instance = test_instance(&[]);
        assert!(!instance.merge_attributes(1, &[instance.id]));
        assert!(instance.deps().is_empty());
    }

    #[test]
    fn attributes_freeze_at_commit() {
        let instance = test_instance(&[iid(10)]);
        instance.inner().advance_status(InstanceStatus::Committed);
        assert!(!instance.merge_attributes(9, &[iid(12)]));
        assert_eq!(instance.seq(), 1);
        assert_eq!(instance.deps(), vec![iid(10)]);
    }

    #[test]
    fn status_is_monotonic() {
        let instance = test_instance(&[]);
        assert!(instance.inner().advance_status(InstanceStatus::Accepted));
        assert!(instance.inner().advance_status(InstanceStatus::Committed));
        assert!(!instance.inner().advance_status(InstanceStatus::Accepted));
        assert_eq!(instance.status(), InstanceStatus::Committed);
    }

    #[test]
    fn ballots_are_monotonic() {
        let instance = test_instance(&[]);
        assert_eq!(instance.observe_ballot(5), 5);
        assert_eq!(instance.observe_ballot(3), 5);
        assert_eq!(instance.next_ballot(), 6);
    }

    #[test]
    fn placeholder_without_commands_is_marked_unknown() {
        let now = Instant::now();
        let shell = Instance::placeholder(
            iid(7),
            u64::MAX,
            2,
            BTreeSet::new(),
            InstanceStatus::Committed,
            1,
            false,
            now,
            now,
        );
        assert!(!shell.commands_known());

        let noop = Instance::placeholder(
            iid(8),
            u64::MAX,
            2,
            BTreeSet::new(),
            InstanceStatus::Committed,
            1,
            true,
            now,
            now,
        );
        // A noop applies nothing, so there is nothing left to recover.
        assert!(noop.commands_known());
    }
}
