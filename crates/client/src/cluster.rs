//! Cluster client: routing, failover and the per-node connection pool.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request};
use tracing::{debug, info, warn};

use gv_core::coordinator::InfoClient;
use gv_core::info::{NodeId, ShardId};
use gv_core::status as engine;
use proto::rpc_client::RpcClient;
use proto::{iterator_request, Empty, IteratorRequest, Key, KeyValue};

/// How long to wait before refreshing the map and retrying a stale or
/// unreachable target. Long enough for a local migration to complete.
const RETRY_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Block on an unhealthy cluster instead of failing the operation.
    pub wait_on_unhealthy: bool,
    /// Record a crashed node in the coordinator when we notice one before
    /// it does.
    pub inform_on_unavailable: bool,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            wait_on_unhealthy: true,
            inform_on_unavailable: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error(transparent)]
    Info(#[from] gv_core::InfoError),
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),
    #[error("storage engine status {0}")]
    Store(i32),
    #[error("shard {0} is not placed on any node")]
    NoOwner(ShardId),
}

/// What the retry loop resends. Owns its bytes so a resend is a clone away.
enum Op {
    Get(Vec<u8>),
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
    SingleDelete(Vec<u8>),
    Merge(Vec<u8>, Vec<u8>),
}

impl Op {
    fn key(&self) -> &[u8] {
        match self {
            Op::Get(key)
            | Op::Delete(key)
            | Op::SingleDelete(key)
            | Op::Put(key, _)
            | Op::Merge(key, _) => key,
        }
    }
}

pub struct Cluster {
    info: InfoClient,
    options: ClusterOptions,
    conns: Mutex<HashMap<NodeId, RpcClient<Channel>>>,
}

impl Cluster {
    pub async fn connect(etcd: &str) -> Result<Self, ClusterError> {
        Self::with_options(etcd, ClusterOptions::default()).await
    }

    pub async fn with_options(etcd: &str, options: ClusterOptions) -> Result<Self, ClusterError> {
        let info = InfoClient::connect(etcd).await?;
        info.get().await?;
        // A freshly initialised cluster starts running on first use.
        info.run().await?;
        Ok(Self {
            info,
            options,
            conns: Mutex::new(HashMap::new()),
        })
    }

    pub fn info(&self) -> &InfoClient {
        &self.info
    }

    pub fn shard_for_key(&self, key: &[u8]) -> ShardId {
        self.info.shard_for_key(key)
    }

    pub fn index_for_key(&self, key: &[u8]) -> Option<NodeId> {
        self.info.index_for_key(key)
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, ClusterError> {
        let response = self.operation(Op::Get(key.to_vec())).await?;
        match response.status {
            engine::OK => Ok(Some(response.value)),
            engine::NOT_FOUND => Ok(None),
            code => Err(ClusterError::Store(code)),
        }
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), ClusterError> {
        self.expect_ok(Op::Put(key.to_vec(), value.to_vec())).await
    }

    pub async fn delete(&self, key: &[u8]) -> Result<(), ClusterError> {
        self.expect_ok(Op::Delete(key.to_vec())).await
    }

    pub async fn single_delete(&self, key: &[u8]) -> Result<(), ClusterError> {
        self.expect_ok(Op::SingleDelete(key.to_vec())).await
    }

    pub async fn merge(&self, key: &[u8], value: &[u8]) -> Result<(), ClusterError> {
        self.expect_ok(Op::Merge(key.to_vec(), value.to_vec())).await
    }

    pub async fn wait_until_healthy(&self) -> Result<(), ClusterError> {
        self.info.wait_until_healthy().await?;
        Ok(())
    }

    /// Ping one node; false means unreachable.
    pub async fn ping_node(&self, id: NodeId) -> bool {
        match self.conn(id).await {
            Ok(mut client) => client.ping(Request::new(Empty {})).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Every key/value pair on every node, merged and sorted. Not a
    /// consistent cluster-wide snapshot.
    pub async fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ClusterError> {
        let mut all = Vec::new();
        for id in self.info.node_ids() {
            let mut client = self
                .conn(id)
                .await
                .map_err(|status| ClusterError::Rpc(status))?;
            let (req_tx, req_rx) = mpsc::channel::<IteratorRequest>(4);
            req_tx
                .send(IteratorRequest {
                    op: iterator_request::Op::SeekToFirst as i32,
                    target: Vec::new(),
                })
                .await
                .ok();
            let mut inbound = client
                .iterator(Request::new(ReceiverStream::new(req_rx)))
                .await?
                .into_inner();
            loop {
                let Some(response) = inbound.message().await? else {
                    break;
                };
                if response.status != engine::OK {
                    return Err(ClusterError::Store(response.status));
                }
                for kv in response.kvs {
                    all.push((kv.key, kv.value));
                }
                if response.done {
                    break;
                }
                if req_tx
                    .send(IteratorRequest {
                        op: iterator_request::Op::Next as i32,
                        target: Vec::new(),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
        all.sort();
        Ok(all)
    }

    async fn expect_ok(&self, op: Op) -> Result<(), ClusterError> {
        let response = self.operation(op).await?;
        match response.status {
            engine::OK => Ok(()),
            code => Err(ClusterError::Store(code)),
        }
    }

    fn owner(&self, key: &[u8]) -> Result<NodeId, ClusterError> {
        self.info
            .index_for_key(key)
            .ok_or_else(|| ClusterError::NoOwner(self.info.shard_for_key(key)))
    }

    async fn conn(&self, id: NodeId) -> Result<RpcClient<Channel>, tonic::Status> {
        let mut conns = self.conns.lock().await;
        if let Some(client) = conns.get(&id) {
            return Ok(client.clone());
        }
        let Some(address) = self.info.address(id) else {
            return Err(tonic::Status::unavailable(format!(
                "node {id} has no address"
            )));
        };
        debug!(node = id, %address, "new connection");
        let endpoint = Endpoint::from_shared(format!("http://{address}"))
            .map_err(|e| tonic::Status::unavailable(e.to_string()))?;
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| tonic::Status::unavailable(e.to_string()))?;
        let client = RpcClient::new(channel);
        conns.insert(id, client.clone());
        Ok(client)
    }

    async fn drop_conn(&self, id: NodeId) {
        self.conns.lock().await.remove(&id);
    }

    /// Refresh the cluster map and drop connections to retired slots.
    async fn update(&self) -> Result<(), ClusterError> {
        self.info.get().await?;
        let mut conns = self.conns.lock().await;
        conns.retain(|id, _| self.info.address(*id).is_some());
        Ok(())
    }

    async fn send(&self, id: NodeId, op: &Op) -> Result<proto::Response, tonic::Status> {
        let mut client = self.conn(id).await?;
        let response = match op {
            Op::Get(key) => {
                client
                    .get(Request::new(Key {
                        key: key.clone(),
                        force: false,
                    }))
                    .await?
            }
            Op::Put(key, value) => {
                client
                    .put(Request::new(KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                    }))
                    .await?
            }
            Op::Delete(key) => {
                client
                    .delete(Request::new(Key {
                        key: key.clone(),
                        force: false,
                    }))
                    .await?
            }
            Op::SingleDelete(key) => {
                client
                    .single_delete(Request::new(Key {
                        key: key.clone(),
                        force: false,
                    }))
                    .await?
            }
            Op::Merge(key, value) => {
                client
                    .merge(Request::new(KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                    }))
                    .await?
            }
        };
        Ok(response.into_inner())
    }

    /// The error-driven retry loop. Stale routing refreshes and resends;
    /// an unreachable node reconnects, pings, and possibly waits for the
    /// cluster to become healthy again.
    async fn operation(&self, op: Op) -> Result<proto::Response, ClusterError> {
        let key = op.key().to_vec();
        let mut id = self.owner(&key)?;
        let mut result = self.send(id, &op).await;
        loop {
            let status = match result {
                Ok(response) => return Ok(response),
                Err(status) => status,
            };
            match status.code() {
                Code::InvalidArgument => {
                    debug!(node = id, "stale routing, refreshing the cluster map");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                    self.update().await?;
                    id = self.owner(&key)?;
                    debug!(node = id, "retrying with the new master");
                    result = self.send(id, &op).await;
                }
                Code::Unavailable => {
                    if status.message() == "The former master has crashed" {
                        // A proxied read failed; resend after one refresh.
                        warn!(node = id, "the former master has crashed");
                        self.update().await?;
                        id = self.owner(&key)?;
                        result = self.send(id, &op).await;
                        continue;
                    }
                    warn!(node = id, "node unavailable");
                    self.drop_conn(id).await;
                    tokio::time::sleep(RETRY_INTERVAL).await;
                    self.update().await?;
                    let owner = self.owner(&key)?;
                    if owner != id {
                        // He shut down cleanly; retry with the new master.
                        info!(node = owner, "retrying with the new master");
                        id = owner;
                        result = self.send(id, &op).await;
                        continue;
                    }
                    if self.ping_node(id).await {
                        // He crashed but is back online.
                        info!(node = id, "node is back online");
                        result = self.send(id, &op).await;
                        continue;
                    }
                    // Keep refreshing while the coordinator still believes
                    // the cluster is healthy.
                    while self.info.is_healthy() && !self.ping_node(id).await {
                        warn!(node = id, "node crashed but the coordinator is not aware");
                        if self.options.inform_on_unavailable {
                            info!(node = id, "informing the coordinator");
                            self.info.set_available(id, false).await?;
                        }
                        tokio::time::sleep(RETRY_INTERVAL).await;
                        self.drop_conn(id).await;
                        self.update().await?;
                        id = self.owner(&key)?;
                    }
                    if !self.info.is_healthy() {
                        if !self.options.wait_on_unhealthy {
                            return Err(ClusterError::Rpc(status));
                        }
                        info!("cluster is unhealthy, waiting");
                        self.info.wait_until_healthy().await?;
                        self.drop_conn(id).await;
                        self.update().await?;
                    }
                    id = self.owner(&key)?;
                    result = self.send(id, &op).await;
                }
                _ => return Err(ClusterError::Rpc(status)),
            }
        }
    }
}
