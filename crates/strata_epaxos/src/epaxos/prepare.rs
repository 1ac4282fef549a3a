//! Recovery for commands whose leader is suspected failed.
//!
//! A replica noticing an instance stuck past its commit grace period first
//! defers to the instance's successors in order, bounding how many nodes
//! race to recover the same command. If the chain is exhausted it runs the
//! prepare protocol itself: bump the ballot past everything seen, collect a
//! majority of views, and drive the instance to a safe commit — the original
//! command when any replica still has it, a noop when none does.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use super::error::{ConsensusError, Result};
use super::instance::{Instance, InstanceSnapshot, InstanceStatus};
use super::manager::{ballot_backoff, Manager};
use super::types::{
    slow_quorum, InstanceId, NodeId, PrepareRequest, PrepareResponse, PrepareSuccessorRequest,
};

impl Manager {
    /// Recovery driver with bounded, jittered retries on ballot contention.
    pub(crate) async fn prepare_with_retries(
        &self,
        instance: &Arc<Instance>,
        fallback_replicas: &[NodeId],
    ) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            if instance.is_committed() && instance.commands_known() {
                return Ok(());
            }
            match self.prepare_instance(instance, fallback_replicas).await {
                Ok(()) => return Ok(()),
                Err(ConsensusError::Ballot { ballot }) => {
                    self.stats.ballot_retries.fetch_add(1, Ordering::Relaxed);
                    attempt += 1;
                    if attempt > self.config.ballot_failure_retries {
                        return Err(ConsensusError::Timeout { phase: "prepare" });
                    }
                    let wait = ballot_backoff(&self.config, attempt);
                    tracing::debug!(
                        instance = %instance.id,
                        ballot,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "prepare ballot contention, backing off"
                    );
                    if instance.commit_event.wait_until(Instant::now() + wait).await
                        && instance.commands_known()
                    {
                        return Ok(());
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One recovery pass: honor the commit grace period, keep recovery
    /// single-flight per instance, defer to successors, then prepare.
    pub(crate) async fn prepare_instance(
        &self,
        instance: &Arc<Instance>,
        fallback_replicas: &[NodeId],
    ) -> Result<()> {
        if instance.is_committed() && instance.commands_known() {
            return Ok(());
        }

        if !instance.is_committed() {
            // the original leader gets its grace window before anyone
            // competes for the command
            let deadline = instance.inner().commit_deadline;
            if Instant::now() < deadline && instance.commit_event.wait_until(deadline).await {
                return Ok(());
            }
        }
        if instance.is_committed() && instance.commands_known() {
            return Ok(());
        }

        let first = self.state().recovering.insert(instance.id);
        if !first {
            // someone on this node is already recovering it; wait them out
            let deadline = Instant::now() + self.config.prepare_timeout;
            instance.commit_event.wait_until(deadline).await;
            return Ok(());
        }
        let result = self.prepare_with_successors(instance, fallback_replicas).await;
        self.state().recovering.remove(&instance.id);
        result
    }

    async fn prepare_with_successors(
        &self,
        instance: &Arc<Instance>,
        fallback_replicas: &[NodeId],
    ) -> Result<()> {
        let replicas = self.replicas_for_instance(instance, fallback_replicas)?;
        let local = self.local_id();

        if instance.leader != local {
            for successor in self.successors_for(instance, &replicas) {
                if successor == local {
                    // our turn in the chain
                    break;
                }
                if instance.is_committed() && instance.commands_known() {
                    return Ok(());
                }

                let req = PrepareSuccessorRequest { id: instance.id };
                let send = self.cluster.prepare_successor(successor, req);
                let response = tokio::select! {
                    _ = instance.commit_event.wait() => None,
                    resp = time::timeout(self.config.successor_timeout, send) => Some(resp),
                };
                let Some(response) = response else {
                    if instance.commands_known() {
                        return Ok(());
                    }
                    continue;
                };

                match response {
                    Ok(Ok(resp)) => {
                        if let Some(snapshot) = resp.instance {
                            if snapshot.status >= InstanceStatus::Committed {
                                self.adopt_commands(instance, &snapshot);
                                self.commit_instance(
                                    instance,
                                    Some((snapshot.seq, snapshot.deps.clone())),
                                    snapshot.noop,
                                    snapshot.max_ballot,
                                )?;
                                return Ok(());
                            }
                            // the successor is alive and took the recovery
                            // over; give it a window to finish
                            let grace = Instant::now() + self.config.successor_timeout;
                            if instance.commit_event.wait_until(grace).await
                                && instance.commands_known()
                            {
                                return Ok(());
                            }
                        }
                        // unknown to this successor: try the next one
                    }
                    Ok(Err(err)) => {
                        tracing::debug!(
                            instance = %instance.id,
                            successor,
                            error = %err,
                            "successor unreachable"
                        );
                    }
                    Err(_) => {
                        tracing::debug!(instance = %instance.id, successor, "successor timed out");
                    }
                }
            }
        }

        self.prepare_round(instance, &replicas).await
    }

    /// One prepare round under a freshly claimed ballot, then drive the
    /// instance to commit based on the highest state a majority reports.
    async fn prepare_round(&self, instance: &Arc<Instance>, replicas: &[NodeId]) -> Result<()> {
        self.stats.prepare_attempts.fetch_add(1, Ordering::Relaxed);
        let n = replicas.len();
        let slow = slow_quorum(n);
        let local = self.local_id();
        let ballot = instance.next_ballot();
        // the claimed ballot must be durable before it is announced
        self.persist(instance)?;

        let peers: Vec<NodeId> = replicas
            .iter()
            .copied()
            .filter(|peer| *peer != local)
            .collect();
        let rpc_timeout = self.config.prepare_timeout;

        let (tx, mut rx) =
            mpsc::channel::<(NodeId, anyhow::Result<PrepareResponse>)>(peers.len().max(1));
        for peer in peers {
            let cluster = self.cluster.clone();
            let tx = tx.clone();
            let req = PrepareRequest {
                id: instance.id,
                ballot,
            };
            tokio::spawn(async move {
                let resp = match time::timeout(rpc_timeout, cluster.prepare(peer, req)).await {
                    Ok(resp) => resp,
                    Err(_) => Err(anyhow::anyhow!("prepare rpc to {peer} timed out")),
                };
                let _ = tx.send((peer, resp)).await;
            });
        }
        drop(tx);

        // the local view counts toward the majority
        let mut responses: Vec<(NodeId, PrepareResponse)> = Vec::new();
        let deadline = Instant::now() + rpc_timeout;
        while responses.len() + 1 < slow {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Ok(Some((peer, result))) = time::timeout(remaining, rx.recv()).await else {
                break;
            };
            match result {
                Ok(resp) => responses.push((peer, resp)),
                Err(err) => {
                    tracing::debug!(instance = %instance.id, error = %err, "prepare send failed");
                }
            }
        }
        if responses.len() + 1 < slow {
            return Err(ConsensusError::Timeout { phase: "prepare" });
        }

        // A rejection forces our ballot up, and its view may already be
        // decided; adopt the strongest rejecting view before yielding.
        let mut max_ballot = ballot;
        let mut rejected = false;
        let mut adopt: Option<InstanceSnapshot> = None;
        for (_, resp) in &responses {
            if resp.accepted {
                continue;
            }
            rejected = true;
            max_ballot = max_ballot.max(resp.ballot);
            if let Some(snapshot) = &resp.instance {
                if snapshot.status >= InstanceStatus::Accepted
                    && adopt
                        .as_ref()
                        .map(|current| snapshot.status > current.status)
                        .unwrap_or(true)
                {
                    adopt = Some(snapshot.clone());
                }
            }
        }
        if rejected {
            instance.observe_ballot(max_ballot);
            if let Some(snapshot) = adopt {
                self.adopt_commands(instance, &snapshot);
                if snapshot.status >= InstanceStatus::Committed {
                    self.commit_instance(
                        instance,
                        Some((snapshot.seq, snapshot.deps.clone())),
                        snapshot.noop,
                        snapshot.max_ballot,
                    )?;
                } else {
                    let mut inner = instance.inner();
                    if inner.status < InstanceStatus::Committed {
                        inner.seq = snapshot.seq;
                        inner.deps = snapshot
                            .deps
                            .iter()
                            .copied()
                            .filter(|dep| *dep != instance.id)
                            .collect();
                        inner.noop |= snapshot.noop;
                        inner.advance_status(InstanceStatus::Accepted);
                    }
                }
            }
            self.persist(instance)?;
            return Err(ConsensusError::Ballot { ballot: max_ballot });
        }

        let known: Vec<InstanceSnapshot> = responses
            .iter()
            .filter_map(|(_, resp)| resp.instance.clone())
            .collect();

        if known.is_empty() {
            // No other replica ever saw the command. It cannot have been
            // committed, so replace it with a noop under the new ballot.
            tracing::info!(instance = %instance.id, "instance unknown to quorum, committing noop");
            {
                let mut inner = instance.inner();
                inner.noop = true;
                inner.commands_known = true;
            }
            self.persist(instance)?;
            let outcome = self.preaccept_phase(instance, replicas).await?;
            if !outcome.fast_path {
                self.accept_phase(instance, replicas, outcome.missing).await?;
            }
            self.commit_phase(instance, replicas).await?;
            self.stats.noop_commits.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let best = known
            .iter()
            .max_by_key(|snapshot| (snapshot.status, snapshot.max_ballot))
            .cloned()
            .expect("known is non-empty");

        match best.status {
            InstanceStatus::Committed | InstanceStatus::Executed => {
                self.adopt_commands(instance, &best);
                self.commit_instance(
                    instance,
                    Some((best.seq, best.deps.clone())),
                    best.noop,
                    ballot.max(best.max_ballot),
                )?;
                // re-announce so stragglers converge
                self.commit_phase(instance, replicas).await?;
            }
            InstanceStatus::Accepted => {
                self.adopt_commands(instance, &best);
                {
                    let mut inner = instance.inner();
                    if inner.status < InstanceStatus::Committed {
                        inner.seq = best.seq;
                        inner.deps = best
                            .deps
                            .iter()
                            .copied()
                            .filter(|dep| *dep != instance.id)
                            .collect();
                        inner.noop |= best.noop;
                    }
                }
                self.persist(instance)?;
                self.accept_phase(instance, replicas, Vec::new()).await?;
                self.commit_phase(instance, replicas).await?;
            }
            InstanceStatus::PreAccepted => {
                // Count identical pre-accepted views from replicas other
                // than the original leader. Self counts, before its view is
                // overwritten below.
                let mut identical = 0usize;
                for (peer, resp) in &responses {
                    let Some(snapshot) = &resp.instance else {
                        continue;
                    };
                    if snapshot.status == InstanceStatus::PreAccepted
                        && *peer != instance.leader
                        && snapshot.seq == best.seq
                        && snapshot.deps == best.deps
                    {
                        identical += 1;
                    }
                }
                {
                    let inner = instance.inner();
                    let local_deps: Vec<InstanceId> = inner.deps.iter().copied().collect();
                    if local != instance.leader
                        && inner.status == InstanceStatus::PreAccepted
                        && inner.seq == best.seq
                        && local_deps == best.deps
                    {
                        identical += 1;
                    }
                }

                self.adopt_commands(instance, &best);
                {
                    let mut inner = instance.inner();
                    if inner.status < InstanceStatus::Committed {
                        inner.seq = best.seq;
                        inner.deps = best
                            .deps
                            .iter()
                            .copied()
                            .filter(|dep| *dep != instance.id)
                            .collect();
                        inner.noop |= best.noop;
                    }
                }
                self.persist(instance)?;

                if identical >= n / 2 {
                    // enough identical pre-accepts: the attributes are safe
                    // without another accept round
                    self.commit_phase(instance, replicas).await?;
                } else {
                    let outcome = self.preaccept_phase(instance, replicas).await?;
                    if !outcome.fast_path {
                        self.accept_phase(instance, replicas, outcome.missing).await?;
                    }
                    self.commit_phase(instance, replicas).await?;
                }
            }
        }

        Ok(())
    }

    fn replicas_for_instance(
        &self,
        instance: &Instance,
        fallback_replicas: &[NodeId],
    ) -> Result<Vec<NodeId>> {
        let commands = instance.commands();
        if !commands.is_empty() {
            let keys = self.instruction_keys(&commands);
            if let Some(key) = keys.first() {
                let mut replicas = self.cluster.replicas_for_key(key);
                replicas.sort_unstable();
                replicas.dedup();
                if !replicas.is_empty() {
                    return Ok(replicas);
                }
            }
        }
        if !fallback_replicas.is_empty() {
            return Ok(fallback_replicas.to_vec());
        }
        Err(ConsensusError::invariant(format!(
            "no replica set known for instance {}",
            instance.id
        )))
    }

    /// Successor order for an instance: the sorted replica set rotated by
    /// the instance id, with the original leader excluded. Deterministic on
    /// every replica without any topology knowledge.
    fn successors_for(&self, instance: &Instance, replicas: &[NodeId]) -> Vec<NodeId> {
        let mut successors: Vec<NodeId> = replicas
            .iter()
            .copied()
            .filter(|node| *node != instance.leader)
            .collect();
        if successors.len() > 1 {
            let seed =
                instance.id.micros ^ instance.id.node ^ u64::from(instance.id.counter);
            let rotation = (seed % successors.len() as u64) as usize;
            successors.rotate_left(rotation);
        }
        successors
    }
}
