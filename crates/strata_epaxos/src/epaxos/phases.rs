//! Leader rounds: pre-accept, accept, commit.
//!
//! Sends fan out to every peer as spawned tasks feeding a channel; the
//! driver gathers responses against a phase deadline. A response carrying a
//! higher ballot aborts the round with a ballot error; the caller decides
//! whether to back off or retry under a fresh ballot.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use super::error::{ConsensusError, Result};
use super::instance::{Instance, InstanceSnapshot, InstanceStatus};
use super::manager::Manager;
use super::types::{
    fast_quorum, slow_quorum, AcceptRequest, AcceptResponse, CommitRequest, InstanceId, NodeId,
    PreAcceptRequest, PreAcceptResponse,
};

pub(crate) struct PreAcceptOutcome {
    /// Every fast-quorum response agreed with the proposal; accept can be
    /// skipped.
    pub(crate) fast_path: bool,
    /// Snapshots peers reported missing from the proposal, forwarded on the
    /// accept round.
    pub(crate) missing: Vec<InstanceSnapshot>,
}

impl Manager {
    /// Drive one command from pre-accept to commit.
    pub(crate) async fn run_commit_ladder(
        &self,
        instance: &Arc<Instance>,
        replicas: &[NodeId],
    ) -> Result<()> {
        let outcome = self.preaccept_phase(instance, replicas).await?;
        if outcome.fast_path {
            self.stats.fast_path_commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.accept_phase(instance, replicas, outcome.missing).await?;
            self.stats.slow_path_commits.fetch_add(1, Ordering::Relaxed);
        }
        self.commit_phase(instance, replicas).await
    }

    /// One pre-accept round. The local replica's view is the instance itself
    /// (its dependencies were recorded when it was created or recovered), so
    /// only peers are contacted.
    pub(crate) async fn preaccept_phase(
        &self,
        instance: &Arc<Instance>,
        replicas: &[NodeId],
    ) -> Result<PreAcceptOutcome> {
        let n = replicas.len();
        let fast = fast_quorum(n);
        let slow = slow_quorum(n);
        let proposal = instance.snapshot();
        let peers: Vec<NodeId> = replicas
            .iter()
            .copied()
            .filter(|peer| *peer != self.local_id())
            .collect();
        let rpc_timeout = self.config.preaccept_timeout;

        let (tx, mut rx) = mpsc::channel::<anyhow::Result<PreAcceptResponse>>(peers.len().max(1));
        for peer in peers {
            let cluster = self.cluster.clone();
            let tx = tx.clone();
            let req = PreAcceptRequest {
                instance: proposal.clone(),
            };
            tokio::spawn(async move {
                let resp = match time::timeout(rpc_timeout, cluster.pre_accept(peer, req)).await {
                    Ok(resp) => resp,
                    Err(_) => Err(anyhow::anyhow!("pre-accept rpc to {peer} timed out")),
                };
                let _ = tx.send(resp).await;
            });
        }
        drop(tx);

        let deadline = Instant::now() + rpc_timeout;
        let mut oks: Vec<PreAcceptResponse> = Vec::new();
        let mut accepted = 1usize; // the leader itself
        while accepted < fast {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Ok(Some(result)) = time::timeout(remaining, rx.recv()).await else {
                break;
            };
            match result {
                Ok(resp) => {
                    if resp.accepted {
                        oks.push(resp);
                        accepted += 1;
                    } else if resp.ballot > proposal.max_ballot {
                        instance.observe_ballot(resp.ballot);
                        self.persist(instance)?;
                        return Err(ConsensusError::Ballot { ballot: resp.ballot });
                    }
                }
                Err(err) => {
                    tracing::debug!(instance = %proposal.id, error = %err, "pre-accept send failed");
                }
            }
        }

        let identical = oks
            .iter()
            .all(|resp| resp.seq == proposal.seq && resp.deps == proposal.deps);
        if accepted >= fast && identical {
            {
                let mut inner = instance.inner();
                inner.dependency_match = true;
            }
            self.persist(instance)?;
            tracing::debug!(instance = %proposal.id, "pre-accept fast path");
            return Ok(PreAcceptOutcome {
                fast_path: true,
                missing: Vec::new(),
            });
        }

        if accepted < slow {
            return Err(ConsensusError::Timeout { phase: "pre-accept" });
        }

        // Divergence: union every view, pick up instances peers knew about
        // that this node did not, and fall back to the accept round.
        let mut merged_seq = proposal.seq;
        let mut merged_deps: Vec<InstanceId> = proposal.deps.clone();
        let mut missing: Vec<InstanceSnapshot> = Vec::new();
        let mut missing_seen: HashSet<InstanceId> = HashSet::new();
        for resp in &oks {
            merged_seq = merged_seq.max(resp.seq);
            merged_deps.extend(resp.deps.iter().copied());
            for snapshot in &resp.missing_instances {
                if missing_seen.insert(snapshot.id) {
                    missing.push(snapshot.clone());
                }
            }
        }
        self.insert_missing_instances(&missing);
        instance.merge_attributes(merged_seq, &merged_deps);
        {
            let mut state = self.state();
            state.max_seq = state.max_seq.max(merged_seq);
        }
        self.persist(instance)?;
        tracing::debug!(
            instance = %proposal.id,
            seq = merged_seq,
            deps = instance.deps().len(),
            "pre-accept slow path"
        );

        Ok(PreAcceptOutcome {
            fast_path: false,
            missing,
        })
    }

    /// One accept round over the merged attributes; simple-majority quorum.
    pub(crate) async fn accept_phase(
        &self,
        instance: &Arc<Instance>,
        replicas: &[NodeId],
        missing: Vec<InstanceSnapshot>,
    ) -> Result<()> {
        let slow = slow_quorum(replicas.len());
        {
            let mut inner = instance.inner();
            inner.advance_status(InstanceStatus::Accepted);
        }
        self.persist(instance)?;

        let snapshot = instance.snapshot();
        let peers: Vec<NodeId> = replicas
            .iter()
            .copied()
            .filter(|peer| *peer != self.local_id())
            .collect();
        let rpc_timeout = self.config.accept_timeout;

        let (tx, mut rx) = mpsc::channel::<anyhow::Result<AcceptResponse>>(peers.len().max(1));
        for peer in peers {
            let cluster = self.cluster.clone();
            let tx = tx.clone();
            let req = AcceptRequest {
                id: snapshot.id,
                ballot: snapshot.max_ballot,
                seq: snapshot.seq,
                deps: snapshot.deps.clone(),
                missing_instances: missing.clone(),
            };
            tokio::spawn(async move {
                let resp = match time::timeout(rpc_timeout, cluster.accept(peer, req)).await {
                    Ok(resp) => resp,
                    Err(_) => Err(anyhow::anyhow!("accept rpc to {peer} timed out")),
                };
                let _ = tx.send(resp).await;
            });
        }
        drop(tx);

        let deadline = Instant::now() + rpc_timeout;
        let mut accepted = 1usize; // the leader itself
        while accepted < slow {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let Ok(Some(result)) = time::timeout(remaining, rx.recv()).await else {
                break;
            };
            match result {
                Ok(resp) => {
                    if resp.accepted {
                        accepted += 1;
                    } else if resp.ballot > snapshot.max_ballot {
                        instance.observe_ballot(resp.ballot);
                        self.persist(instance)?;
                        return Err(ConsensusError::Ballot { ballot: resp.ballot });
                    }
                }
                Err(err) => {
                    tracing::debug!(instance = %snapshot.id, error = %err, "accept send failed");
                }
            }
        }

        if accepted < slow {
            return Err(ConsensusError::Timeout { phase: "accept" });
        }
        Ok(())
    }

    /// Commit locally and announce to every peer. Commit is the announcement
    /// that consensus is reached; no quorum wait is needed for safety, so
    /// peer sends are fire-and-forget.
    pub(crate) async fn commit_phase(
        &self,
        instance: &Arc<Instance>,
        replicas: &[NodeId],
    ) -> Result<()> {
        self.commit_instance(instance, None, false, instance.max_ballot())?;

        let snapshot = instance.snapshot();
        let rpc_timeout = self.config.accept_timeout;
        let mut sends = FuturesUnordered::new();
        for peer in replicas.iter().copied() {
            if peer == self.local_id() {
                continue;
            }
            let cluster = self.cluster.clone();
            let req = CommitRequest {
                id: snapshot.id,
                ballot: snapshot.max_ballot,
                seq: snapshot.seq,
                deps: snapshot.deps.clone(),
                noop: snapshot.noop,
            };
            sends.push(async move {
                (peer, time::timeout(rpc_timeout, cluster.commit(peer, req)).await)
            });
        }
        tokio::spawn(async move {
            while let Some((peer, result)) = sends.next().await {
                match result {
                    Ok(Ok(resp)) if resp.accepted => {}
                    Ok(Ok(_)) => {
                        tracing::debug!(peer, "commit not applied by peer");
                    }
                    Ok(Err(err)) => {
                        tracing::debug!(peer, error = %err, "commit send failed");
                    }
                    Err(_) => {
                        tracing::debug!(peer, "commit send timed out");
                    }
                }
            }
        });
        Ok(())
    }
}
