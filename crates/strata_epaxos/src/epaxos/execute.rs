//! Execution engine: turn a committed instance's dependency graph into a
//! deterministic application order and drive the state store.
//!
//! The graph over the target's transitive dependencies is condensed into
//! strongly connected components with an explicit-stack Tarjan, emitted
//! dependencies-first. Members of one component are ordered by sequence,
//! then the id's embedded timestamp, then the id itself, so every replica
//! applies interfering instances identically. Uncommitted instances found on
//! the way are recovered before anything is applied.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::time::Instant;

use super::error::{ConsensusError, Result};
use super::instance::{Instance, InstanceStatus};
use super::manager::Manager;
use super::types::{InstanceId, NodeId};

impl Manager {
    /// Resolve and apply everything the target depends on, then the target,
    /// returning the value its last instruction produced.
    pub(crate) async fn execute_instance(
        self: &Arc<Self>,
        target: &Arc<Instance>,
        replicas: &[NodeId],
    ) -> Result<Option<Vec<u8>>> {
        tracing::debug!(instance = %target.id, "execute phase started");

        let mut rounds = 0u32;
        let order = loop {
            let order = self.execution_order(target)?;
            let uncommitted: Vec<Arc<Instance>> = order
                .iter()
                .filter(|instance| {
                    let inner = instance.inner();
                    inner.status < InstanceStatus::Committed || !inner.commands_known
                })
                .cloned()
                .collect();
            if uncommitted.is_empty() {
                break order;
            }

            rounds += 1;
            if rounds > self.config.ballot_failure_retries.max(1) * 2 {
                self.stats.execute_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(ConsensusError::Timeout { phase: "execute" });
            }
            tracing::debug!(
                instance = %target.id,
                uncommitted = uncommitted.len(),
                round = rounds,
                "recovering uncommitted dependencies"
            );

            let mut tasks = Vec::new();
            for dep in uncommitted {
                let manager = self.clone();
                let fallback = replicas.to_vec();
                tasks.push(tokio::spawn(async move {
                    manager.prepare_with_retries(&dep, &fallback).await
                }));
            }
            for task in tasks {
                task.await.map_err(|err| {
                    ConsensusError::invariant(format!("prepare task panicked: {err}"))
                })??;
            }
            // prepare may have discovered new instances through its
            // pre-accept cascade; recompute the order before executing
        };

        self.execute_chain(&order, target).await
    }

    /// Build the dependency graph reachable from the target and flatten it
    /// into execution order.
    fn execution_order(&self, target: &Arc<Instance>) -> Result<Vec<Arc<Instance>>> {
        let target_deps: HashSet<InstanceId> = target.deps().into_iter().collect();

        let mut graph: HashMap<InstanceId, Vec<InstanceId>> = HashMap::new();
        let mut nodes: HashMap<InstanceId, Arc<Instance>> = HashMap::new();
        nodes.insert(target.id, target.clone());
        let mut stack: Vec<InstanceId> = vec![target.id];

        while let Some(id) = stack.pop() {
            if graph.contains_key(&id) {
                continue;
            }
            let instance = match nodes.get(&id) {
                Some(instance) => instance.clone(),
                None => {
                    let found = self.find(id).ok_or_else(|| {
                        ConsensusError::invariant(format!("unknown dependency {id}"))
                    })?;
                    nodes.insert(id, found.clone());
                    found
                }
            };
            let (status, deps) = {
                let inner = instance.inner();
                (inner.status, inner.deps.iter().copied().collect::<Vec<_>>())
            };

            // Executed history outside the target's direct dependencies only
            // matters if it can share a component with something unexecuted;
            // otherwise it is pruned here.
            if status == InstanceStatus::Executed
                && id != target.id
                && !target_deps.contains(&id)
            {
                let mut connected = false;
                for dep in &deps {
                    if graph.contains_key(dep) || target_deps.contains(dep) {
                        connected = true;
                        break;
                    }
                    let dep_instance = self.find(*dep).ok_or_else(|| {
                        ConsensusError::invariant(format!("unknown dependency {dep}"))
                    })?;
                    let unexecuted = dep_instance.status() < InstanceStatus::Executed;
                    nodes.insert(*dep, dep_instance);
                    if unexecuted {
                        connected = true;
                        break;
                    }
                }
                if !connected {
                    continue;
                }
            }

            graph.insert(id, deps.clone());
            for dep in deps {
                if !graph.contains_key(&dep) {
                    stack.push(dep);
                }
            }
        }

        let components = tarjan_scc(&graph);

        let mut order: Vec<Arc<Instance>> = Vec::with_capacity(graph.len());
        for component in components {
            let mut keyed: Vec<(u64, InstanceId)> = component
                .into_iter()
                .map(|id| (nodes[&id].seq(), id))
                .collect();
            // sequence first, then the id: embedded timestamp, node, counter
            keyed.sort_unstable();
            order.extend(keyed.into_iter().map(|(_, id)| nodes[&id].clone()));
        }
        Ok(order)
    }

    /// Apply committed instances in order, stopping after the target. A
    /// locally led instance that is not the target gets a grace window for
    /// the client task that proposed it to apply it and read its value.
    async fn execute_chain(
        &self,
        order: &[Arc<Instance>],
        target: &Arc<Instance>,
    ) -> Result<Option<Vec<u8>>> {
        let local = self.local_id();
        let mut value = None;
        for instance in order {
            match instance.status() {
                InstanceStatus::Executed => {}
                InstanceStatus::Committed => {
                    if instance.id == target.id {
                        value = self.apply_instance(instance)?;
                    } else if instance.leader != local {
                        self.apply_instance(instance)?;
                    } else {
                        let deadline = instance.inner().execute_deadline;
                        let executed = Instant::now() < deadline
                            && instance.execute_event.wait_until(deadline).await;
                        if !executed {
                            self.apply_instance(instance)?;
                        }
                    }
                }
                status => {
                    return Err(ConsensusError::invariant(format!(
                        "instance {} is {status:?} in the execution chain",
                        instance.id
                    )));
                }
            }
            if instance.id == target.id {
                break;
            }
        }
        Ok(value)
    }

    /// Apply one committed instance to the store exactly once, under the
    /// instance lock. Noops transition without touching the store. A store
    /// failure leaves the instance committed so re-execution replays it.
    pub(crate) fn apply_instance(&self, instance: &Arc<Instance>) -> Result<Option<Vec<u8>>> {
        let value = {
            let mut inner = instance.inner();
            if inner.status == InstanceStatus::Executed {
                return Ok(None);
            }
            if inner.status != InstanceStatus::Committed {
                return Err(ConsensusError::invariant(format!(
                    "applying uncommitted instance {}",
                    instance.id
                )));
            }
            if !inner.commands_known {
                return Err(ConsensusError::invariant(format!(
                    "applying instance {} before its commands were recovered",
                    instance.id
                )));
            }
            let mut value = None;
            if !inner.noop {
                for instruction in &inner.commands {
                    value = self.store.apply(instruction).map_err(ConsensusError::Store)?;
                }
            }
            inner.advance_status(InstanceStatus::Executed);
            value
        };
        self.persist(instance)?;
        {
            let mut state = self.state();
            state.committed.remove(&instance.id);
            state.executed.push(instance.id);
        }
        self.stats.instances_executed.fetch_add(1, Ordering::Relaxed);
        instance.execute_event.fire();
        tracing::debug!(instance = %instance.id, "instance applied");
        Ok(value)
    }
}

/// Iterative Tarjan over `graph`, where an edge points from an instance to
/// one of its dependencies. Components come out dependencies-first: by the
/// time a component is emitted, everything it depends on already was.
fn tarjan_scc(graph: &HashMap<InstanceId, Vec<InstanceId>>) -> Vec<Vec<InstanceId>> {
    struct Frame {
        node: InstanceId,
        edge: usize,
    }

    let mut roots: Vec<InstanceId> = graph.keys().copied().collect();
    roots.sort_unstable();

    let mut index: HashMap<InstanceId, usize> = HashMap::with_capacity(graph.len());
    let mut lowlink: HashMap<InstanceId, usize> = HashMap::with_capacity(graph.len());
    let mut on_stack: HashSet<InstanceId> = HashSet::with_capacity(graph.len());
    let mut stack: Vec<InstanceId> = Vec::new();
    let mut next_index = 0usize;
    let mut components: Vec<Vec<InstanceId>> = Vec::new();

    for root in roots {
        if index.contains_key(&root) {
            continue;
        }
        let mut work = vec![Frame {
            node: root,
            edge: 0,
        }];
        index.insert(root, next_index);
        lowlink.insert(root, next_index);
        next_index += 1;
        stack.push(root);
        on_stack.insert(root);

        while let Some(frame) = work.last_mut() {
            let node = frame.node;
            let edges = &graph[&node];
            if frame.edge < edges.len() {
                let next = edges[frame.edge];
                frame.edge += 1;
                // dependencies pruned out of the graph are already settled
                if !graph.contains_key(&next) {
                    continue;
                }
                if let Some(&seen) = index.get(&next) {
                    if on_stack.contains(&next) {
                        let low = lowlink[&node].min(seen);
                        lowlink.insert(node, low);
                    }
                } else {
                    index.insert(next, next_index);
                    lowlink.insert(next, next_index);
                    next_index += 1;
                    stack.push(next);
                    on_stack.insert(next);
                    work.push(Frame {
                        node: next,
                        edge: 0,
                    });
                }
            } else {
                let finished = work.pop().expect("work stack is non-empty").node;
                if let Some(parent) = work.last() {
                    let low = lowlink[&parent.node].min(lowlink[&finished]);
                    lowlink.insert(parent.node, low);
                }
                if lowlink[&finished] == index[&finished] {
                    let mut component = Vec::new();
                    loop {
                        let member = stack.pop().expect("tarjan stack is non-empty");
                        on_stack.remove(&member);
                        component.push(member);
                        if member == finished {
                            break;
                        }
                    }
                    components.push(component);
                }
            }
        }
    }

    components
}
