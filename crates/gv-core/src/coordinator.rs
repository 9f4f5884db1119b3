//! Coordinator client
//!
//! Wraps etcd around the cluster map: a cached copy of the latest observed
//! [`ClusterInfo`], optimistic compare-and-swap mutators, and a watch stream
//! that keeps the cache fresh. Every mutator follows the same loop: read the
//! current value, apply the pure transformation, swap it in transactionally,
//! retry from the read on a version conflict.

use std::collections::HashMap;
use std::sync::Arc;

use etcd_client::{Client, Compare, CompareOp, EventType, Txn, TxnOp, WatchOptions};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::info::{ClusterInfo, NodeId, ShardId};
use crate::InfoError;

/// The single key holding the serialized cluster map.
pub const INFO_KEY: &str = "gravel/info";

pub struct InfoClient {
    client: Client,
    cache: Arc<RwLock<ClusterInfo>>,
}

impl InfoClient {
    pub async fn connect(endpoint: &str) -> Result<Self, InfoError> {
        let client = Client::connect([endpoint], None).await?;
        Ok(Self {
            client,
            cache: Arc::new(RwLock::new(ClusterInfo::new())),
        })
    }

    /// A copy of the cached cluster map.
    pub fn current(&self) -> ClusterInfo {
        self.cache.read().clone()
    }

    pub fn shard_for_key(&self, key: &[u8]) -> ShardId {
        self.cache.read().shard_for_key(key)
    }

    pub fn index_for_shard(&self, shard: ShardId) -> Option<NodeId> {
        self.cache.read().index_for_shard(shard)
    }

    pub fn index_for_key(&self, key: &[u8]) -> Option<NodeId> {
        self.cache.read().index_for_key(key)
    }

    pub fn address(&self, id: NodeId) -> Option<String> {
        self.cache.read().address(id).map(str::to_string)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.cache.read().addresses()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.cache.read().node_ids()
    }

    pub fn index_of_address(&self, address: &str) -> Option<NodeId> {
        self.cache.read().index_of(address)
    }

    pub fn num_shards(&self) -> u32 {
        self.cache.read().num_shards()
    }

    pub fn shards(&self, id: NodeId) -> Vec<ShardId> {
        self.cache.read().shards(id)
    }

    pub fn future(&self, id: NodeId) -> Vec<ShardId> {
        self.cache.read().future(id)
    }

    pub fn is_available(&self, id: NodeId) -> bool {
        self.cache.read().is_available(id)
    }

    pub fn is_removed(&self, id: NodeId) -> bool {
        self.cache.read().is_removed(id)
    }

    pub fn is_healthy(&self) -> bool {
        self.cache.read().is_healthy()
    }

    pub fn is_migrating_shard(&self, shard: ShardId) -> bool {
        self.cache.read().is_migrating_shard(shard)
    }

    pub fn tasks(&self, id: NodeId) -> HashMap<NodeId, Vec<ShardId>> {
        self.cache.read().tasks(id)
    }

    pub fn orphan_futures(&self, id: NodeId) -> Vec<ShardId> {
        self.cache.read().orphan_futures(id)
    }

    /// Fetch the current map into the cache.
    pub async fn get(&self) -> Result<(), InfoError> {
        let (parsed, _) = self.fetch().await?.ok_or(InfoError::Missing)?;
        *self.cache.write() = parsed;
        Ok(())
    }

    async fn fetch(&self) -> Result<Option<(ClusterInfo, Vec<u8>)>, InfoError> {
        let mut kv = self.client.kv_client();
        let resp = kv.get(INFO_KEY, None).await?;
        match resp.kvs().first() {
            Some(entry) => {
                let raw = entry.value().to_vec();
                let parsed = ClusterInfo::parse(&raw)?;
                Ok(Some((parsed, raw)))
            }
            None => Ok(None),
        }
    }

    /// Swap in `new` if the stored value is still `old_raw`. On success the
    /// cache is updated under the write guard.
    async fn cas(&self, old_raw: Vec<u8>, new: &ClusterInfo) -> Result<bool, InfoError> {
        let new_raw = new.serialize()?;
        let txn = Txn::new()
            .when(vec![Compare::value(INFO_KEY, CompareOp::Equal, old_raw)])
            .and_then(vec![TxnOp::put(INFO_KEY, new_raw, None)]);
        let resp = self.client.kv_client().txn(txn).await?;
        if resp.succeeded() {
            *self.cache.write() = new.clone();
            Ok(true)
        } else {
            debug!("cluster map changed underneath us, retrying");
            Ok(false)
        }
    }

    /// Optimistic update loop. `apply` returns false when there is nothing
    /// to write, in which case only the cache is refreshed.
    async fn update<F>(&self, mut apply: F) -> Result<(), InfoError>
    where
        F: FnMut(&mut ClusterInfo) -> Result<bool, InfoError>,
    {
        loop {
            let (mut parsed, old_raw) = self.fetch().await?.ok_or(InfoError::Missing)?;
            if !apply(&mut parsed)? {
                *self.cache.write() = parsed;
                return Ok(());
            }
            if self.cas(old_raw, &parsed).await? {
                return Ok(());
            }
        }
    }

    /// Join the cluster, creating it if the coordinator has never seen one.
    /// Returns the node id. Rejoining an address that is marked available
    /// fails: there is a live node behind it.
    pub async fn add(&self, address: &str, num_shards: u32) -> Result<NodeId, InfoError> {
        loop {
            match self.fetch().await? {
                Some((mut parsed, old_raw)) => {
                    let id = if let Some(id) = parsed.index_of(address) {
                        if parsed.is_available(id) {
                            return Err(InfoError::AddressInUse(address.to_string()));
                        }
                        info!(id, "reclaiming our old slot");
                        id
                    } else if parsed.is_init() {
                        parsed.add_node_with_new_shards(address, num_shards)?
                    } else if parsed.is_running() {
                        parsed.add_node(address)?
                    } else {
                        return Err(InfoError::Migrating);
                    };
                    if self.cas(old_raw, &parsed).await? {
                        return Ok(id);
                    }
                }
                None => {
                    let mut parsed = ClusterInfo::new();
                    let id = parsed.add_node_with_new_shards(address, num_shards)?;
                    let raw = parsed.serialize()?;
                    let txn = Txn::new()
                        .when(vec![Compare::create_revision(INFO_KEY, CompareOp::Equal, 0)])
                        .and_then(vec![TxnOp::put(INFO_KEY, raw, None)]);
                    if self.client.kv_client().txn(txn).await?.succeeded() {
                        *self.cache.write() = parsed;
                        info!("created a new cluster");
                        return Ok(id);
                    }
                }
            }
        }
    }

    /// Promote INIT to RUNNING. A no-op while migrations are pending or the
    /// cluster already runs.
    pub async fn run(&self) -> Result<(), InfoError> {
        self.update(|parsed| {
            if parsed.is_running() || !parsed.no_migrations() {
                return Ok(false);
            }
            parsed.set_running()?;
            Ok(true)
        })
        .await
    }

    /// Recompute the target placement and enter MIGRATING. Returns false
    /// when the cluster is already balanced.
    pub async fn migrate(&self) -> Result<bool, InfoError> {
        let mut scheduled = false;
        self.update(|parsed| {
            if !parsed.is_running() {
                return Err(InfoError::InvalidState(
                    "migrations can only start while RUNNING".into(),
                ));
            }
            parsed.redistribute_shards();
            if parsed.no_migrations() {
                scheduled = false;
                return Ok(false);
            }
            parsed.set_migrating()?;
            scheduled = true;
            Ok(true)
        })
        .await?;
        Ok(scheduled)
    }

    /// Ask for the graceful removal of a node.
    pub async fn request_remove(&self, id: NodeId) -> Result<(), InfoError> {
        self.update(|parsed| {
            parsed.mark_remove(id)?;
            Ok(true)
        })
        .await
    }

    /// Retire our own slot after the last shard has been streamed away.
    pub async fn remove(&self, id: NodeId) -> Result<(), InfoError> {
        self.update(|parsed| {
            parsed.remove_node(id);
            Ok(true)
        })
        .await
    }

    /// Record the handover of a shard away from `from`.
    pub async fn give_shard(&self, from: NodeId, shard: ShardId) -> Result<(), InfoError> {
        self.update(|parsed| parsed.give_shard(from, shard)).await
    }

    /// Announce that a shard's migration finished on the receiving side.
    pub async fn migration_over(&self, shard: ShardId) -> Result<(), InfoError> {
        self.update(|parsed| {
            parsed.migration_over(shard)?;
            Ok(true)
        })
        .await
    }

    pub async fn set_available(&self, id: NodeId, available: bool) -> Result<(), InfoError> {
        self.update(|parsed| {
            if parsed.is_available(id) == available {
                return Ok(false);
            }
            parsed.set_available(id, available);
            Ok(true)
        })
        .await
    }

    /// Open a watch on the info key. The current value lands in the cache
    /// immediately; every subsequent committed mutation arrives as an event.
    pub async fn watch(&self) -> Result<WatchHandle, InfoError> {
        let mut kv = self.client.kv_client();
        let resp = kv.get(INFO_KEY, None).await?;
        let entry = resp.kvs().first().ok_or(InfoError::Missing)?;
        let revision = entry.mod_revision();
        *self.cache.write() = ClusterInfo::parse(entry.value())?;
        let mut wc = self.client.watch_client();
        let (watcher, stream) = wc
            .watch(
                INFO_KEY,
                Some(WatchOptions::new().with_start_revision(revision + 1)),
            )
            .await?;
        Ok(WatchHandle {
            watcher,
            stream,
            cache: self.cache.clone(),
        })
    }

    /// Block until every addressed node is marked available.
    pub async fn wait_until_healthy(&self) -> Result<(), InfoError> {
        let mut watch = self.watch().await?;
        while !self.is_healthy() {
            if watch.next().await? {
                break;
            }
        }
        if let Err(err) = watch.cancel().await {
            warn!(error = %err, "failed to cancel health watch");
        }
        Ok(())
    }
}

/// A live watch on the cluster map. Each delivered event re-parses the new
/// value into the shared cache under the write guard.
pub struct WatchHandle {
    watcher: etcd_client::Watcher,
    stream: etcd_client::WatchStream,
    cache: Arc<RwLock<ClusterInfo>>,
}

impl WatchHandle {
    /// Wait for the next cluster-map change. Returns true if the watch was
    /// canceled or the stream ended.
    pub async fn next(&mut self) -> Result<bool, InfoError> {
        loop {
            let Some(resp) = self.stream.message().await? else {
                return Ok(true);
            };
            if resp.canceled() {
                return Ok(true);
            }
            let mut updated = false;
            for event in resp.events() {
                if event.event_type() == EventType::Put {
                    if let Some(kv) = event.kv() {
                        *self.cache.write() = ClusterInfo::parse(kv.value())?;
                        updated = true;
                    }
                }
            }
            if updated {
                return Ok(false);
            }
        }
    }

    pub async fn cancel(&mut self) -> Result<(), InfoError> {
        self.watcher.cancel().await?;
        Ok(())
    }
}
