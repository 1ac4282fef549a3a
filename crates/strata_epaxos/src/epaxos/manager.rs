//! Engine state and replica-side message handling.
//!
//! One `Manager` per process. It owns the instance map (the only strong
//! references to instances), the phase index sets, the hierarchical
//! dependency tree, and the manager-wide sequence counter. The leader rounds
//! live in `phases`, recovery in `prepare`, and the apply path in `execute`;
//! all of them are `impl Manager` blocks over the state defined here.
//!
//! Lock discipline: the manager lock covers only map mutations, the
//! dependency tree has its own lock (and never calls back in), and each
//! instance carries a fine-grained lock. No lock is ever held across an
//! `.await`, and the instance lock is always released before the manager
//! lock is taken.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::time::Instant;

use super::deps::DependencyManager;
use super::error::{ConsensusError, Result};
use super::instance::{Instance, InstanceSnapshot, InstanceStatus};
use super::log::InstanceLog;
use super::types::{
    AcceptRequest, AcceptResponse, Cluster, CommitRequest, CommitResponse, Config, InstanceId,
    Instruction, NodeId, PreAcceptRequest, PreAcceptResponse, PrepareRequest, PrepareResponse,
    PrepareSuccessorRequest, PrepareSuccessorResponse, StateStore, UNKNOWN_LEADER,
};

#[derive(Debug, Default)]
pub(crate) struct ManagerState {
    pub(crate) instances: HashMap<InstanceId, Arc<Instance>>,
    pub(crate) in_progress: HashSet<InstanceId>,
    pub(crate) committed: HashSet<InstanceId>,
    pub(crate) executed: Vec<InstanceId>,
    pub(crate) recovering: HashSet<InstanceId>,
    pub(crate) max_seq: u64,
    last_id_micros: u64,
    id_counter: u32,
}

impl ManagerState {
    fn next_instance_id(&mut self, node: NodeId) -> InstanceId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros()
            .min(u128::from(u64::MAX)) as u64;
        // ids from one node must never regress, even across clock steps
        self.last_id_micros = now.max(self.last_id_micros + 1);
        self.id_counter = self.id_counter.wrapping_add(1);
        InstanceId {
            micros: self.last_id_micros,
            node,
            counter: self.id_counter,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ManagerStats {
    pub(crate) fast_path_commits: AtomicU64,
    pub(crate) slow_path_commits: AtomicU64,
    pub(crate) prepare_attempts: AtomicU64,
    pub(crate) noop_commits: AtomicU64,
    pub(crate) ballot_retries: AtomicU64,
    pub(crate) execute_timeouts: AtomicU64,
    pub(crate) instances_executed: AtomicU64,
}

/// Counter snapshot for operators and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatsSnapshot {
    pub fast_path_commits: u64,
    pub slow_path_commits: u64,
    pub prepare_attempts: u64,
    pub noop_commits: u64,
    pub ballot_retries: u64,
    pub execute_timeouts: u64,
    pub instances_executed: u64,
}

pub struct Manager {
    pub(crate) config: Config,
    pub(crate) cluster: Arc<dyn Cluster>,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) log: Option<Arc<dyn InstanceLog>>,
    pub(crate) deps_mngr: DependencyManager,
    pub(crate) state: Mutex<ManagerState>,
    pub(crate) stats: ManagerStats,
}

impl Manager {
    pub fn new(
        config: Config,
        cluster: Arc<dyn Cluster>,
        store: Arc<dyn StateStore>,
        log: Option<Arc<dyn InstanceLog>>,
    ) -> Self {
        Self {
            config,
            cluster,
            store,
            log,
            deps_mngr: DependencyManager::new(),
            state: Mutex::new(ManagerState::default()),
            stats: ManagerStats::default(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.cluster.local_id()
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            fast_path_commits: self.stats.fast_path_commits.load(Ordering::Relaxed),
            slow_path_commits: self.stats.slow_path_commits.load(Ordering::Relaxed),
            prepare_attempts: self.stats.prepare_attempts.load(Ordering::Relaxed),
            noop_commits: self.stats.noop_commits.load(Ordering::Relaxed),
            ballot_retries: self.stats.ballot_retries.load(Ordering::Relaxed),
            execute_timeouts: self.stats.execute_timeouts.load(Ordering::Relaxed),
            instances_executed: self.stats.instances_executed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().expect("manager lock poisoned")
    }

    pub fn find(&self, id: InstanceId) -> Option<Arc<Instance>> {
        self.state().instances.get(&id).cloned()
    }

    /// Ids applied at this replica, in application order.
    pub fn executed_ids(&self) -> Vec<InstanceId> {
        self.state().executed.clone()
    }

    pub(crate) fn deadlines(&self) -> (Instant, Instant) {
        let now = Instant::now();
        (
            now + self.config.commit_grace,
            now + self.config.commit_grace + self.config.execute_grace,
        )
    }

    pub(crate) fn commands_read_only(&self, instructions: &[Instruction]) -> bool {
        !instructions.is_empty()
            && instructions
                .iter()
                .all(|instruction| self.store.is_read_only(&instruction.cmd))
    }

    pub(crate) fn instruction_keys(&self, instructions: &[Instruction]) -> Vec<String> {
        let mut keys: Vec<String> = instructions
            .iter()
            .flat_map(|instruction| self.store.interfering_keys(instruction))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// D1: the record must be durable before any message referencing the
    /// instance leaves this node.
    pub(crate) fn persist(&self, instance: &Instance) -> Result<()> {
        if let Some(log) = &self.log {
            log.save_instance(&instance.snapshot()).map_err(|err| {
                ConsensusError::invariant(format!("instance log write failed: {err:#}"))
            })?;
        }
        Ok(())
    }

    /// Build a fresh instance for a client command: new id, local leader,
    /// next manager-wide sequence, dependencies from the key tree.
    pub(crate) fn make_instance(&self, instructions: Vec<Instruction>) -> Result<Arc<Instance>> {
        if instructions.is_empty() {
            return Err(ConsensusError::invariant("empty instruction list"));
        }
        let read_only = self.commands_read_only(&instructions);
        let keys = self.instruction_keys(&instructions);
        let (commit_deadline, execute_deadline) = self.deadlines();

        let instance = {
            let mut state = self.state();
            let id = state.next_instance_id(self.local_id());
            let deps = self.deps_mngr.get_and_set_deps(id, read_only, &keys);
            // overestimate; replicas refine it during pre-accept
            state.max_seq += 1;
            let seq = state.max_seq;
            let instance = Arc::new(Instance::new_local(
                id,
                self.local_id(),
                instructions,
                read_only,
                seq,
                deps.into_iter().collect(),
                commit_deadline,
                execute_deadline,
            ));
            state.instances.insert(id, instance.clone());
            state.in_progress.insert(id);
            instance
        };

        self.persist(&instance)?;
        Ok(instance)
    }

    /// Insert instance snapshots this node had not seen. Used for the
    /// missing-instance exchange during pre-accept and accept.
    pub(crate) fn insert_missing_instances(&self, snapshots: &[InstanceSnapshot]) {
        for snapshot in snapshots {
            if self.find(snapshot.id).is_some() {
                continue;
            }
            let read_only = self.commands_read_only(&snapshot.commands);
            let (commit_deadline, execute_deadline) = self.deadlines();
            let instance = Arc::new(Instance::from_snapshot(
                snapshot,
                read_only,
                commit_deadline,
                execute_deadline,
            ));
            let committed = snapshot.status >= InstanceStatus::Committed;
            {
                let mut state = self.state();
                if state.instances.contains_key(&snapshot.id) {
                    continue;
                }
                state.instances.insert(snapshot.id, instance.clone());
                if committed {
                    state.committed.insert(snapshot.id);
                } else {
                    state.in_progress.insert(snapshot.id);
                }
                state.max_seq = state.max_seq.max(snapshot.seq);
            }
            if committed {
                instance.commit_event.fire();
            }
            if let Err(err) = self.persist(&instance) {
                tracing::warn!(instance = %snapshot.id, error = %err, "persist of missing instance failed");
            }
            tracing::debug!(instance = %snapshot.id, "added missing instance");
        }
    }

    /// Local commit transition: freeze attributes, persist (D2), move the
    /// instance between the phase sets, and only then signal the commit
    /// event. Returns false if the instance was already committed.
    pub(crate) fn commit_instance(
        &self,
        instance: &Arc<Instance>,
        attrs: Option<(u64, Vec<InstanceId>)>,
        noop: bool,
        ballot: u32,
    ) -> Result<bool> {
        {
            let mut inner = instance.inner();
            inner.max_ballot = inner.max_ballot.max(ballot);
            if inner.status >= InstanceStatus::Committed {
                return Ok(false);
            }
            if let Some((seq, deps)) = attrs {
                inner.seq = seq;
                inner.deps = deps.into_iter().filter(|dep| *dep != instance.id).collect();
            }
            if noop {
                inner.noop = true;
                // a noop has nothing left to recover
                inner.commands_known = true;
            }
            inner.advance_status(InstanceStatus::Committed);
        }
        let seq = instance.seq();
        self.persist(instance)?;
        {
            let mut state = self.state();
            state.in_progress.remove(&instance.id);
            state.committed.insert(instance.id);
            state.max_seq = state.max_seq.max(seq);
        }
        instance.commit_event.fire();
        tracing::debug!(instance = %instance.id, seq, "instance committed");
        Ok(true)
    }

    /// Adopt commands into a placeholder recovered from an attribute-only
    /// accept or commit.
    pub(crate) fn adopt_commands(&self, instance: &Arc<Instance>, snapshot: &InstanceSnapshot) {
        if snapshot.commands.is_empty() && !snapshot.noop {
            return;
        }
        let read_only = self.commands_read_only(&snapshot.commands);
        let mut inner = instance.inner();
        if inner.commands_known {
            return;
        }
        inner.commands = snapshot.commands.clone();
        inner.read_only = read_only;
        inner.noop |= snapshot.noop;
        inner.commands_known = true;
    }

    pub fn handle_pre_accept(&self, req: PreAcceptRequest) -> PreAcceptResponse {
        let proposal = req.instance;

        let (instance, inserted) = match self.find(proposal.id) {
            Some(instance) => (instance, false),
            None => {
                let read_only = self.commands_read_only(&proposal.commands);
                let (commit_deadline, execute_deadline) = self.deadlines();
                let fresh = Arc::new(Instance::from_snapshot(
                    &proposal,
                    read_only,
                    commit_deadline,
                    execute_deadline,
                ));
                let mut state = self.state();
                match state.instances.get(&proposal.id) {
                    Some(existing) => (existing.clone(), false),
                    None => {
                        state.instances.insert(proposal.id, fresh.clone());
                        state.in_progress.insert(proposal.id);
                        (fresh, true)
                    }
                }
            }
        };

        {
            let mut inner = instance.inner();
            if inner.max_ballot > proposal.max_ballot {
                return PreAcceptResponse {
                    accepted: false,
                    ballot: inner.max_ballot,
                    seq: inner.seq,
                    deps: inner.deps.iter().copied().collect(),
                    missing_instances: Vec::new(),
                };
            }
            inner.max_ballot = proposal.max_ballot;
            if inner.status >= InstanceStatus::Committed {
                // consensus already reached; report the decided attributes
                return PreAcceptResponse {
                    accepted: true,
                    ballot: inner.max_ballot,
                    seq: inner.seq,
                    deps: inner.deps.iter().copied().collect(),
                    missing_instances: Vec::new(),
                };
            }
        }

        if !instance.commands_known() {
            self.adopt_commands(&instance, &proposal);
        }

        // Register interference exactly once, when the instance first lands
        // here with its commands. Re-deliveries and recovery re-runs merge
        // against the already-recorded local view instead.
        let local_deps = if inserted {
            let commands = instance.commands();
            let keys = self.instruction_keys(&commands);
            self.deps_mngr
                .get_and_set_deps(proposal.id, instance.read_only(), &keys)
        } else {
            instance.deps()
        };

        let (merged_seq, merged_deps) = {
            let mut state = self.state();
            let local_seq = if inserted {
                state.max_seq + 1
            } else {
                instance.seq()
            };
            let merged_seq = proposal.seq.max(local_seq);
            let mut merged: Vec<InstanceId> = proposal.deps.clone();
            merged.extend(local_deps);
            merged.sort_unstable();
            merged.dedup();
            merged.retain(|dep| *dep != proposal.id);
            state.max_seq = state.max_seq.max(merged_seq);
            (merged_seq, merged)
        };

        let dependency_match = {
            let mut proposed = proposal.deps.clone();
            proposed.sort_unstable();
            proposed.dedup();
            merged_seq == proposal.seq && merged_deps == proposed
        };

        {
            let mut inner = instance.inner();
            if inner.status == InstanceStatus::PreAccepted {
                inner.seq = merged_seq;
                inner.deps = merged_deps.iter().copied().collect();
                inner.dependency_match = dependency_match;
            }
            // status above PreAccepted keeps its attributes; the leader sees
            // the divergence and falls back to the accept round
        }

        if let Err(err) = self.persist(&instance) {
            tracing::warn!(instance = %proposal.id, error = %err, "pre-accept persist failed");
            let inner = instance.inner();
            return PreAcceptResponse {
                accepted: false,
                ballot: inner.max_ballot,
                seq: inner.seq,
                deps: inner.deps.iter().copied().collect(),
                missing_instances: Vec::new(),
            };
        }

        let proposed: HashSet<InstanceId> = proposal.deps.iter().copied().collect();
        let missing_instances = {
            let state = self.state();
            merged_deps
                .iter()
                .filter(|dep| !proposed.contains(*dep))
                .filter_map(|dep| state.instances.get(dep).cloned())
                .collect::<Vec<_>>()
        }
        .into_iter()
        .map(|instance| instance.snapshot())
        .collect();

        let inner = instance.inner();
        PreAcceptResponse {
            accepted: true,
            ballot: inner.max_ballot,
            seq: inner.seq,
            deps: inner.deps.iter().copied().collect(),
            missing_instances,
        }
    }

    pub fn handle_accept(&self, req: AcceptRequest) -> AcceptResponse {
        self.insert_missing_instances(&req.missing_instances);

        let instance = match self.find(req.id) {
            Some(instance) => instance,
            None => {
                let (commit_deadline, execute_deadline) = self.deadlines();
                let fresh = Arc::new(Instance::placeholder(
                    req.id,
                    UNKNOWN_LEADER,
                    req.seq,
                    req.deps.iter().copied().collect(),
                    InstanceStatus::Accepted,
                    req.ballot,
                    false,
                    commit_deadline,
                    execute_deadline,
                ));
                let mut state = self.state();
                match state.instances.get(&req.id) {
                    Some(existing) => existing.clone(),
                    None => {
                        state.instances.insert(req.id, fresh.clone());
                        state.in_progress.insert(req.id);
                        fresh
                    }
                }
            }
        };

        {
            let mut inner = instance.inner();
            if inner.max_ballot > req.ballot {
                return AcceptResponse {
                    accepted: false,
                    ballot: inner.max_ballot,
                };
            }
            inner.max_ballot = req.ballot;
            if inner.status < InstanceStatus::Committed {
                inner.seq = req.seq;
                inner.deps = req.deps.iter().copied().filter(|dep| *dep != req.id).collect();
                inner.advance_status(InstanceStatus::Accepted);
            }
        }

        if let Err(err) = self.persist(&instance) {
            tracing::warn!(instance = %req.id, error = %err, "accept persist failed");
            return AcceptResponse {
                accepted: false,
                ballot: instance.max_ballot(),
            };
        }

        AcceptResponse {
            accepted: true,
            ballot: instance.max_ballot(),
        }
    }

    pub fn handle_commit(&self, req: CommitRequest) -> CommitResponse {
        let instance = match self.find(req.id) {
            Some(instance) => instance,
            None => {
                let (commit_deadline, execute_deadline) = self.deadlines();
                let fresh = Arc::new(Instance::placeholder(
                    req.id,
                    UNKNOWN_LEADER,
                    req.seq,
                    req.deps.iter().copied().collect(),
                    InstanceStatus::Accepted,
                    req.ballot,
                    req.noop,
                    commit_deadline,
                    execute_deadline,
                ));
                let mut state = self.state();
                match state.instances.get(&req.id) {
                    Some(existing) => existing.clone(),
                    None => {
                        state.instances.insert(req.id, fresh.clone());
                        state.in_progress.insert(req.id);
                        fresh
                    }
                }
            }
        };

        match self.commit_instance(
            &instance,
            Some((req.seq, req.deps.clone())),
            req.noop,
            req.ballot,
        ) {
            Ok(_) => CommitResponse { accepted: true },
            Err(err) => {
                tracing::warn!(instance = %req.id, error = %err, "commit persist failed");
                CommitResponse { accepted: false }
            }
        }
    }

    pub fn handle_prepare(&self, req: PrepareRequest) -> PrepareResponse {
        let Some(instance) = self.find(req.id) else {
            return PrepareResponse {
                accepted: true,
                ballot: req.ballot,
                instance: None,
            };
        };

        let accepted = {
            let mut inner = instance.inner();
            // prepare must strictly exceed everything seen for the instance
            if req.ballot > inner.max_ballot {
                inner.max_ballot = req.ballot;
                true
            } else {
                false
            }
        };
        if accepted {
            if let Err(err) = self.persist(&instance) {
                tracing::warn!(instance = %req.id, error = %err, "prepare persist failed");
            }
        }

        PrepareResponse {
            accepted,
            ballot: instance.max_ballot(),
            instance: Some(instance.snapshot()),
        }
    }

    pub fn handle_prepare_successor(
        self: &Arc<Self>,
        req: PrepareSuccessorRequest,
    ) -> PrepareSuccessorResponse {
        let Some(instance) = self.find(req.id) else {
            return PrepareSuccessorResponse { instance: None };
        };

        let snapshot = instance.snapshot();
        if snapshot.status < InstanceStatus::Committed {
            // take over recovery on behalf of the asking replica
            let manager = self.clone();
            let target = instance.clone();
            tokio::spawn(async move {
                if let Err(err) = manager.prepare_with_retries(&target, &[]).await {
                    tracing::warn!(instance = %target.id, error = %err, "successor prepare failed");
                }
            });
        }
        PrepareSuccessorResponse {
            instance: Some(snapshot),
        }
    }

    /// Agree on and apply a client command. Returns the value produced by the
    /// last instruction of the command, once the command has executed at this
    /// replica.
    pub async fn execute_command(
        self: &Arc<Self>,
        instructions: Vec<Instruction>,
        replicas: Vec<NodeId>,
    ) -> Result<Option<Vec<u8>>> {
        if instructions.is_empty() {
            return Err(ConsensusError::invariant("empty instruction list"));
        }
        let mut replicas = replicas;
        replicas.sort_unstable();
        replicas.dedup();
        if !replicas.contains(&self.local_id()) {
            return Err(ConsensusError::NotReplica);
        }

        let instance = self.make_instance(instructions)?;
        tracing::debug!(instance = %instance.id, replicas = replicas.len(), "command proposed");

        let mut attempt = 0u32;
        loop {
            match self.run_commit_ladder(&instance, &replicas).await {
                Ok(()) => break,
                Err(ConsensusError::Ballot { ballot }) => {
                    // another replica took the command over; let its commit
                    // land before competing again
                    self.stats.ballot_retries.fetch_add(1, Ordering::Relaxed);
                    attempt += 1;
                    if attempt > self.config.ballot_failure_retries {
                        return Err(ConsensusError::Timeout { phase: "commit" });
                    }
                    let wait = ballot_backoff(&self.config, attempt);
                    tracing::debug!(
                        instance = %instance.id,
                        ballot,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "ballot superseded, backing off"
                    );
                    if instance.commit_event.wait_until(Instant::now() + wait).await
                        || instance.is_committed()
                    {
                        break;
                    }
                    // compete under a fresh ballot above everything seen
                    instance.next_ballot();
                    self.persist(&instance)?;
                }
                Err(err) => return Err(err),
            }
        }

        self.execute_instance(&instance, &replicas).await
    }

    /// Rebuild in-memory state from the instance log. Called once at startup,
    /// before the node serves traffic.
    pub fn replay(&self) -> Result<usize> {
        let Some(log) = &self.log else {
            return Ok(0);
        };
        let mut records = log.load_instances().map_err(|err| {
            ConsensusError::invariant(format!("instance log load failed: {err:#}"))
        })?;
        records.sort_by_key(|record| record.id);
        let count = records.len();

        for record in records {
            let read_only = self.commands_read_only(&record.commands);
            let (commit_deadline, execute_deadline) = self.deadlines();
            let instance = Arc::new(Instance::from_snapshot(
                &record,
                read_only,
                commit_deadline,
                execute_deadline,
            ));
            {
                let mut state = self.state();
                state.max_seq = state.max_seq.max(record.seq);
                if record.id.node == self.local_id() {
                    // never reuse id timestamps from a previous run
                    let micros = record.id.micros;
                    if micros > state.last_id_micros {
                        state.last_id_micros = micros;
                    }
                }
                match record.status {
                    InstanceStatus::Executed => state.executed.push(record.id),
                    InstanceStatus::Committed => {
                        state.committed.insert(record.id);
                    }
                    _ => {
                        state.in_progress.insert(record.id);
                    }
                }
                state.instances.insert(record.id, instance.clone());
            }
            match record.status {
                InstanceStatus::Executed => {
                    instance.commit_event.fire();
                    instance.execute_event.fire();
                }
                InstanceStatus::Committed => instance.commit_event.fire(),
                _ => {}
            }
            // Executed history is already reflected in the store; only live
            // instances belong in the interference tree.
            if record.status < InstanceStatus::Executed && instance.commands_known() {
                let keys = self.instruction_keys(&instance.commands());
                let _ = self
                    .deps_mngr
                    .get_and_set_deps(record.id, read_only, &keys);
            }
        }

        tracing::info!(count, "instance log replayed");
        Ok(count)
    }
}

/// Jittered backoff for ballot contention: `wait × attempt` plus up to half
/// that again, so colliding recoverers spread out.
pub(crate) fn ballot_backoff(config: &Config, attempt: u32) -> Duration {
    let base = config.ballot_failure_wait * attempt.max(1);
    let half = (base.as_millis() / 2) as u64;
    let jitter = if half == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..half)
    };
    base + Duration::from_millis(jitter)
}
