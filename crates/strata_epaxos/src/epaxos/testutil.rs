//! In-package mocks for the store and cluster seams.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::log::MemoryLog;
use super::manager::Manager;
use super::types::{
    AcceptRequest, AcceptResponse, Cluster, CommitRequest, CommitResponse, Config, Instruction,
    NodeId, PreAcceptRequest, PreAcceptResponse, PrepareRequest, PrepareResponse,
    PrepareSuccessorRequest, PrepareSuccessorResponse, StateStore,
};

/// Last-writer-wins key-value store recording every applied instruction.
#[derive(Debug, Default)]
pub(crate) struct MemStore {
    values: Mutex<HashMap<String, (String, u64)>>,
    pub(crate) applied: Mutex<Vec<Instruction>>,
}

impl MemStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap()
            .get(key)
            .map(|(value, _)| value.clone())
    }

    pub(crate) fn applied(&self) -> Vec<Instruction> {
        self.applied.lock().unwrap().clone()
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
                self.values.lock().unwrap().insert(
                    instruction.key.clone(),
                    (value.clone(), instruction.timestamp),
                );
                Ok(Some(value.clone().into_bytes()))
            }
            "GET" => Ok(self
                .values
                .lock()
                .unwrap()
                .get(&instruction.key)
                .map(|(value, _)| value.clone().into_bytes())),
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

/// Single-node cluster; any remote send is a bug in the test.
pub(crate) struct SoloCluster {
    pub(crate) node: NodeId,
}

#[async_trait]
impl Cluster for SoloCluster {
    fn local_id(&self) -> NodeId {
        self.node
    }

    fn replicas_for_key(&self, _key: &str) -> Vec<NodeId> {
        vec![self.node]
    }

    async fn pre_accept(
        &self,
        peer: NodeId,
        _req: PreAcceptRequest,
    ) -> anyhow::Result<PreAcceptResponse> {
        anyhow::bail!("solo cluster has no peer {peer}")
    }

    async fn accept(&self, peer: NodeId, _req: AcceptRequest) -> anyhow::Result<AcceptResponse> {
        anyhow::bail!("solo cluster has no peer {peer}")
    }

    async fn commit(&self, peer: NodeId, _req: CommitRequest) -> anyhow::Result<CommitResponse> {
        anyhow::bail!("solo cluster has no peer {peer}")
    }

    async fn prepare(&self, peer: NodeId, _req: PrepareRequest) -> anyhow::Result<PrepareResponse> {
        anyhow::bail!("solo cluster has no peer {peer}")
    }

    async fn prepare_successor(
        &self,
        peer: NodeId,
        _req: PrepareSuccessorRequest,
    ) -> anyhow::Result<PrepareSuccessorResponse> {
        anyhow::bail!("solo cluster has no peer {peer}")
    }
}

pub(crate) fn test_config() -> Config {
    Config {
        preaccept_timeout: Duration::from_millis(500),
        accept_timeout: Duration::from_millis(500),
        prepare_timeout: Duration::from_millis(500),
        successor_timeout: Duration::from_millis(100),
        commit_grace: Duration::from_millis(50),
        execute_grace: Duration::from_millis(50),
        ballot_failure_retries: 4,
        ballot_failure_wait: Duration::from_millis(20),
    }
}

pub(crate) fn solo_manager() -> (Arc<Manager>, Arc<MemStore>, Arc<MemoryLog>) {
    let store = Arc::new(MemStore::new());
    let log = Arc::new(MemoryLog::new());
    let manager = Arc::new(Manager::new(
        test_config(),
        Arc::new(SoloCluster { node: 1 }),
        store.clone(),
        Some(log.clone()),
    ));
    (manager, store, log)
}

pub(crate) fn set(key: &str, value: &str, timestamp: u64) -> Instruction {
    Instruction::new("SET", key, vec![value.to_string()], timestamp)
}

pub(crate) fn get(key: &str, timestamp: u64) -> Instruction {
    Instruction::new("GET", key, Vec::new(), timestamp)
}
