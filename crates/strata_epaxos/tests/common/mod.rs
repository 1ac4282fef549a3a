//! Shared multi-replica harness.
//!
//! Wires N managers through an in-memory mesh transport over a small
//! key-value store. Nodes can be killed (their handlers become unreachable)
//! and every delivered message is recorded per type, so tests can assert
//! which protocol rounds actually ran.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use strata_epaxos::{
    AcceptRequest, AcceptResponse, Cluster, CommitRequest, CommitResponse, Config, InstanceId,
    Instruction, Manager, MemoryLog, NodeId, PreAcceptRequest, PreAcceptResponse, PrepareRequest,
    PrepareResponse, PrepareSuccessorRequest, PrepareSuccessorResponse, StateStore,
};

pub const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Last-writer-wins in-memory store recording every applied instruction.
#[derive(Debug, Default)]
pub struct MemStore {
    values: Mutex<HashMap<String, String>>,
    applied: Mutex<Vec<Instruction>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }

    pub fn applied(&self) -> Vec<Instruction> {
        self.applied.lock().unwrap().clone()
    }

    /// Values written to `key`, in application order.
    pub fn writes_to(&self, key: &str) -> Vec<String> {
        self.applied()
            .into_iter()
            .filter(|instruction| {
                instruction.key == key && instruction.cmd.eq_ignore_ascii_case("SET")
            })
            .filter_map(|instruction| instruction.args.first().cloned())
            .collect()
    }
}

impl StateStore for MemStore {
    fn apply(&self, instruction: &Instruction) -> anyhow::Result<Option<Vec<u8>>> {
        self.applied.lock().unwrap().push(instruction.clone());
        match instruction.cmd.to_uppercase().as_str() {
            "SET" => {
                let value = instruction
                    .args
                    .first()
                    .ok_or_else(|| anyhow::anyhow!("SET requires a value"))?;
                self.values
                    .lock()
                    .unwrap()
                    .insert(instruction.key.clone(), value.clone());
                Ok(Some(value.clone().into_bytes()))
            }
            "GET" => Ok(self
                .values
                .lock()
                .unwrap()
                .get(&instruction.key)
                .map(|value| value.clone().into_bytes())),
            "DEL" => {
                self.values.lock().unwrap().remove(&instruction.key);
                Ok(None)
            }
            other => anyhow::bail!("unrecognized command {other}"),
        }
    }

    fn is_read_only(&self, cmd: &str) -> bool {
        cmd.eq_ignore_ascii_case("GET")
    }

    fn is_write_only(&self, cmd: &str) -> bool {
        cmd.eq_ignore_ascii_case("SET") || cmd.eq_ignore_ascii_case("DEL")
    }
}

/// Message log: which instances saw which round, in delivery order.
#[derive(Debug, Default)]
pub struct MessageLog {
    pub pre_accepts: Mutex<Vec<InstanceId>>,
    pub accepts: Mutex<Vec<InstanceId>>,
    pub commits: Mutex<Vec<InstanceId>>,
    pub prepares: Mutex<Vec<InstanceId>>,
    pub prepare_successors: Mutex<Vec<InstanceId>>,
}

impl MessageLog {
    pub fn accepts_for(&self, id: InstanceId) -> usize {
        self.accepts.lock().unwrap().iter().filter(|i| **i == id).count()
    }

    pub fn prepares_for(&self, id: InstanceId) -> usize {
        self.prepares.lock().unwrap().iter().filter(|i| **i == id).count()
    }
}

#[derive(Default)]
struct Mesh {
    managers: RwLock<HashMap<NodeId, Arc<Manager>>>,
    down: RwLock<HashSet<NodeId>>,
    nodes: RwLock<Vec<NodeId>>,
    messages: MessageLog,
}

impl Mesh {
    fn target(&self, peer: NodeId) -> anyhow::Result<Arc<Manager>> {
        if self.down.read().unwrap().contains(&peer) {
            anyhow::bail!("node {peer} is down");
        }
        self.managers
            .read()
            .unwrap()
            .get(&peer)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no node {peer} in the mesh"))
    }
}

struct MeshCluster {
    local: NodeId,
    mesh: Arc<Mesh>,
}

#[async_trait]
impl Cluster for MeshCluster {
    fn local_id(&self) -> NodeId {
        self.local
    }

    fn replicas_for_key(&self, _key: &str) -> Vec<NodeId> {
        self.mesh.nodes.read().unwrap().clone()
    }

    async fn pre_accept(
        &self,
        peer: NodeId,
        req: PreAcceptRequest,
    ) -> anyhow::Result<PreAcceptResponse> {
        let manager = self.mesh.target(peer)?;
        self.mesh
            .messages
            .pre_accepts
            .lock()
            .unwrap()
            .push(req.instance.id);
        Ok(manager.handle_pre_accept(req))
    }

    async fn accept(&self, peer: NodeId, req: AcceptRequest) -> anyhow::Result<AcceptResponse> {
        let manager = self.mesh.target(peer)?;
        self.mesh.messages.accepts.lock().unwrap().push(req.id);
        Ok(manager.handle_accept(req))
    }

    async fn commit(&self, peer: NodeId, req: CommitRequest) -> anyhow::Result<CommitResponse> {
        let manager = self.mesh.target(peer)?;
        self.mesh.messages.commits.lock().unwrap().push(req.id);
        Ok(manager.handle_commit(req))
    }

    async fn prepare(&self, peer: NodeId, req: PrepareRequest) -> anyhow::Result<PrepareResponse> {
        let manager = self.mesh.target(peer)?;
        self.mesh.messages.prepares.lock().unwrap().push(req.id);
        Ok(manager.handle_prepare(req))
    }

    async fn prepare_successor(
        &self,
        peer: NodeId,
        req: PrepareSuccessorRequest,
    ) -> anyhow::Result<PrepareSuccessorResponse> {
        let manager = self.mesh.target(peer)?;
        self.mesh
            .messages
            .prepare_successors
            .lock()
            .unwrap()
            .push(req.id);
        Ok(manager.handle_prepare_successor(req))
    }
}

pub struct TestNode {
    pub id: NodeId,
    pub manager: Arc<Manager>,
    pub store: Arc<MemStore>,
    pub log: Arc<MemoryLog>,
}

pub struct TestCluster {
    mesh: Arc<Mesh>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    pub fn new(size: usize) -> Self {
        Self::with_config(size, test_config())
    }

    pub fn with_config(size: usize, config: Config) -> Self {
        let mesh = Arc::new(Mesh::default());
        let ids: Vec<NodeId> = (1..=size as NodeId).collect();
        *mesh.nodes.write().unwrap() = ids.clone();

        let mut nodes = Vec::with_capacity(size);
        for id in ids {
            let store = Arc::new(MemStore::new());
            let log = Arc::new(MemoryLog::new());
            let cluster = Arc::new(MeshCluster {
                local: id,
                mesh: mesh.clone(),
            });
            let manager = Arc::new(Manager::new(
                config.clone(),
                cluster,
                store.clone(),
                Some(log.clone()),
            ));
            mesh.managers.write().unwrap().insert(id, manager.clone());
            nodes.push(TestNode {
                id,
                manager,
                store,
                log,
            });
        }
        Self { mesh, nodes }
    }

    pub fn node(&self, id: NodeId) -> &TestNode {
        self.nodes
            .iter()
            .find(|node| node.id == id)
            .expect("node id in cluster")
    }

    pub fn replica_ids(&self) -> Vec<NodeId> {
        self.mesh.nodes.read().unwrap().clone()
    }

    pub fn messages(&self) -> &MessageLog {
        &self.mesh.messages
    }

    /// Drop a node out of the mesh; every message to it fails from now on.
    pub fn kill(&self, id: NodeId) {
        self.mesh.down.write().unwrap().insert(id);
    }

    pub async fn write(&self, node: NodeId, key: &str, value: &str, timestamp: u64) -> Vec<u8> {
        self.node(node)
            .manager
            .execute_command(
                vec![Instruction::new(
                    "SET",
                    key,
                    vec![value.to_string()],
                    timestamp,
                )],
                self.replica_ids(),
            )
            .await
            .expect("write committed")
            .expect("SET returns the written value")
    }

    pub async fn read(&self, node: NodeId, key: &str, timestamp: u64) -> Option<Vec<u8>> {
        self.node(node)
            .manager
            .execute_command(
                vec![Instruction::new("GET", key, Vec::new(), timestamp)],
                self.replica_ids(),
            )
            .await
            .expect("read committed")
    }

    /// Consensus read on every live node: forces every replica to execute
    /// the history of `key` before the test inspects its store.
    pub async fn read_barrier(&self, key: &str, timestamp: u64) {
        let down = self.mesh.down.read().unwrap().clone();
        for node in &self.nodes {
            if down.contains(&node.id) {
                continue;
            }
            let _ = self.read(node.id, key, timestamp).await;
        }
    }

    /// Locate an executed instance on `node` by the value its first SET
    /// wrote. Panics if no executed instance matches.
    pub fn executed_write(&self, node: NodeId, value: &str) -> InstanceId {
        let manager = &self.node(node).manager;
        for id in manager.executed_ids() {
            if let Some(instance) = manager.find(id) {
                let snapshot = instance.snapshot();
                let matches = snapshot.commands.iter().any(|instruction| {
                    instruction.cmd.eq_ignore_ascii_case("SET")
                        && instruction.args.first().map(String::as_str) == Some(value)
                });
                if matches {
                    return id;
                }
            }
        }
        panic!("no executed write of {value:?} on node {node}");
    }
}

/// Install a log subscriber for debugging a failing run; honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn test_config() -> Config {
    Config {
        preaccept_timeout: Duration::from_millis(300),
        accept_timeout: Duration::from_millis(300),
        prepare_timeout: Duration::from_millis(400),
        successor_timeout: Duration::from_millis(100),
        commit_grace: Duration::from_millis(50),
        execute_grace: Duration::from_millis(50),
        ballot_failure_retries: 4,
        ballot_failure_wait: Duration::from_millis(20),
    }
}

pub fn set(key: &str, value: &str, timestamp: u64) -> Instruction {
    Instruction::new("SET", key, vec![value.to_string()], timestamp)
}
