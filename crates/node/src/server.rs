//! gRPC request handlers for the storage node
//!
//! Every request resolves the target shard from the cached cluster map and
//! goes through the shard's reference counter (writes) or shared handle
//! (reads). The Migrate handler is the sender side of the shard handover.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};

use gv_core::coordinator::InfoClient;
use gv_core::info::{NodeId, ShardId};
use gv_core::status as engine;
use proto::rpc_server::Rpc;
use proto::{
    BatchBuffer, BatchUpdate, Empty, IteratorRequest, IteratorResponse, Key, KeyValue,
    MigrateRequest, MigrateResponse,
};

use crate::import;
use crate::iterator::{self, MultiIterator};
use crate::migrate::ShardMigrator;
use crate::shard::{sidecar_key, Db, Shard, ShardError, ShardTable};
use crate::status::code_for;

/// Raised ceiling for Migrate messages carrying whole bulk files.
pub const MAX_MESSAGE_SIZE: usize = 64 << 20;

/// Status returned when a request hits a shard this node is not (or no
/// longer) responsible for. Clients refresh their map and retry on it.
pub fn not_responsible() -> Status {
    Status::invalid_argument("Not responsible for this shard")
}

/// Everything the request handlers and the import worker share.
pub struct NodeState {
    pub id: NodeId,
    pub db: Arc<Db>,
    pub info: Arc<InfoClient>,
    pub shards: Arc<ShardTable>,
    /// Scratch directory for partial bulk-ingest files.
    pub scratch: PathBuf,
    /// Target size of one streamed bulk file.
    pub file_target: u64,
    /// All migrations on a node run one at a time.
    pub migrate_lock: Arc<Mutex<()>>,
    pub shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct RpcService {
    state: Arc<NodeState>,
}

impl RpcService {
    pub fn new(state: Arc<NodeState>) -> Self {
        Self { state }
    }

    /// Ref, apply, unref. The reference is what blocks a concurrent
    /// migration from dumping its snapshot before the write commits.
    fn apply_write(
        &self,
        key: &[u8],
        op: impl FnOnce(&Shard) -> Result<(), ShardError>,
    ) -> Result<Response<proto::Response>, Status> {
        let shard_id = self.state.info.shard_for_key(key);
        let Some(shard) = self.state.shards.at(shard_id) else {
            return Err(not_responsible());
        };
        if !shard.try_ref() {
            return Err(not_responsible());
        }
        let result = op(&shard);
        shard.unref();
        let status = match result {
            Ok(()) => engine::OK,
            Err(err) => shard_code(&err),
        };
        Ok(Response::new(proto::Response {
            status,
            value: Vec::new(),
        }))
    }

    /// Importing shards only hold keys up to the largest ingested one; for
    /// anything above, ask the former master with `force` set.
    async fn forward_get(
        &self,
        shard: &Arc<Shard>,
        mut request: Key,
    ) -> Result<Response<proto::Response>, Status> {
        let old_address = shard.old_address();
        debug!(shard = shard.id(), %old_address, "asking the former master");
        request.force = true;

        let proxied = match import::connect(&old_address).await {
            Ok(mut client) => client
                .get(Request::new(request.clone()))
                .await
                .map(|resp| resp.into_inner()),
            Err(err) => Err(Status::unavailable(err.to_string())),
        };

        match proxied {
            Ok(resp) if resp.status == engine::INVALID_ARGUMENT => {
                // He dropped the shard; importing must have finished.
                debug!(shard = shard.id(), "meanwhile importing finished");
                Ok(Response::new(read_local(shard, &request.key)))
            }
            Ok(resp) => Ok(Response::new(resp)),
            Err(status) if status.code() == Code::Unavailable => {
                if self
                    .state
                    .info
                    .addresses()
                    .iter()
                    .any(|a| a == &old_address)
                {
                    warn!(shard = shard.id(), "the former master crashed");
                    Err(Status::unavailable("The former master has crashed"))
                } else {
                    // He left the cluster, so the ingest completed before
                    // his shard was deleted.
                    Ok(Response::new(read_local(shard, &request.key)))
                }
            }
            Err(status) if status.code() == Code::InvalidArgument => {
                Ok(Response::new(read_local(shard, &request.key)))
            }
            Err(status) => Err(status),
        }
    }
}

fn shard_code(err: &ShardError) -> i32 {
    match err {
        ShardError::MissingCf(_) => engine::INVALID_ARGUMENT,
        ShardError::Engine(e) => code_for(e),
        ShardError::Io(_) => engine::IO_ERROR,
    }
}

fn read_local(shard: &Shard, key: &[u8]) -> proto::Response {
    match shard.get(key) {
        Ok(Some(value)) => proto::Response {
            status: engine::OK,
            value,
        },
        Ok(None) => proto::Response {
            status: engine::NOT_FOUND,
            value: Vec::new(),
        },
        Err(err) => proto::Response {
            status: shard_code(&err),
            value: Vec::new(),
        },
    }
}

#[tonic::async_trait]
impl Rpc for RpcService {
    async fn ping(&self, _request: Request<Empty>) -> Result<Response<Empty>, Status> {
        Ok(Response::new(Empty {}))
    }

    async fn get(&self, request: Request<Key>) -> Result<Response<proto::Response>, Status> {
        let req = request.into_inner();
        let shard_id = self.state.info.shard_for_key(&req.key);
        if !req.force && self.state.info.index_for_shard(shard_id) != Some(self.state.id) {
            return Err(not_responsible());
        }
        let Some(shard) = self.state.shards.at(shard_id) else {
            return Err(not_responsible());
        };
        if !req.force && shard.is_importing() && req.key > shard.largest_key() {
            return self.forward_get(&shard, req).await;
        }
        Ok(Response::new(read_local(&shard, &req.key)))
    }

    async fn put(&self, request: Request<KeyValue>) -> Result<Response<proto::Response>, Status> {
        let req = request.into_inner();
        self.apply_write(&req.key, |shard| shard.put(&req.key, &req.value))
    }

    async fn delete(&self, request: Request<Key>) -> Result<Response<proto::Response>, Status> {
        let req = request.into_inner();
        self.apply_write(&req.key, |shard| shard.delete(&req.key))
    }

    async fn single_delete(
        &self,
        request: Request<Key>,
    ) -> Result<Response<proto::Response>, Status> {
        let req = request.into_inner();
        self.apply_write(&req.key, |shard| shard.delete(&req.key))
    }

    async fn merge(&self, request: Request<KeyValue>) -> Result<Response<proto::Response>, Status> {
        let req = request.into_inner();
        self.apply_write(&req.key, |shard| shard.merge(&req.key, &req.value))
    }

    type BatchStream = ReceiverStream<Result<proto::Response, Status>>;

    async fn batch(
        &self,
        request: Request<Streaming<BatchBuffer>>,
    ) -> Result<Response<Self::BatchStream>, Status> {
        let mut in_stream = request.into_inner();
        let (tx, rx) = mpsc::channel(16);
        let state = self.state.clone();

        tokio::spawn(async move {
            let mut refs: HashMap<ShardId, Arc<Shard>> = HashMap::new();
            let mut updates: Vec<(Arc<Shard>, BatchUpdate)> = Vec::new();
            loop {
                match in_stream.message().await {
                    Ok(Some(buffer)) => {
                        let Some(first) = buffer.updates.first() else {
                            continue;
                        };
                        let shard_id = state.info.shard_for_key(&first.key);
                        let shard = match refs.get(&shard_id) {
                            Some(shard) => shard.clone(),
                            None => {
                                let taken =
                                    state.shards.at(shard_id).filter(|shard| shard.try_ref());
                                let Some(shard) = taken else {
                                    // Surface the stale shard mid-stream so
                                    // the client can abort.
                                    if tx
                                        .send(Ok(proto::Response {
                                            status: engine::INVALID_ARGUMENT,
                                            value: Vec::new(),
                                        }))
                                        .await
                                        .is_err()
                                    {
                                        break;
                                    }
                                    continue;
                                };
                                refs.insert(shard_id, shard.clone());
                                if tx
                                    .send(Ok(proto::Response {
                                        status: engine::OK,
                                        value: Vec::new(),
                                    }))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                                shard
                            }
                        };
                        for update in buffer.updates {
                            updates.push((shard.clone(), update));
                        }
                    }
                    Ok(None) => {
                        // End of stream: one atomic multi-keyspace commit.
                        let db = state.db.clone();
                        let status =
                            tokio::task::spawn_blocking(move || commit_batch(&db, updates))
                                .await
                                .unwrap_or(engine::IO_ERROR);
                        let _ = tx
                            .send(Ok(proto::Response {
                                status,
                                value: Vec::new(),
                            }))
                            .await;
                        break;
                    }
                    Err(status) => {
                        warn!(error = %status, "batch stream broke");
                        break;
                    }
                }
            }
            for shard in refs.values() {
                shard.unref();
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    type IteratorStream = ReceiverStream<Result<IteratorResponse, Status>>;

    async fn iterator(
        &self,
        request: Request<Streaming<IteratorRequest>>,
    ) -> Result<Response<Self::IteratorStream>, Status> {
        let mut in_stream = request.into_inner();
        let (req_tx, req_rx) = crossbeam_channel::unbounded::<IteratorRequest>();
        let (resp_tx, resp_rx) = mpsc::channel(4);
        let db = self.state.db.clone();
        let cf_names = self.state.shards.column_families();

        // The merged iterator is built once at stream start and lives on a
        // dedicated blocking thread for the whole call.
        tokio::task::spawn_blocking(move || {
            let handles: Vec<_> = cf_names
                .iter()
                .filter_map(|name| db.cf_handle(name))
                .collect();
            let iters = handles.iter().map(|cf| db.raw_iterator_cf(cf)).collect();
            let mut it = MultiIterator::new(iters);
            while let Ok(request) = req_rx.recv() {
                let response = iterator::apply_request(&mut it, &request);
                if resp_tx.blocking_send(Ok(response)).is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Ok(Some(request)) = in_stream.message().await {
                if req_tx.send(request).is_err() {
                    break;
                }
            }
            // Dropping the sender stops the iterator thread.
        });

        Ok(Response::new(ReceiverStream::new(resp_rx)))
    }

    type MigrateStream = ReceiverStream<Result<MigrateResponse, Status>>;

    async fn migrate(
        &self,
        request: Request<Streaming<MigrateRequest>>,
    ) -> Result<Response<Self::MigrateStream>, Status> {
        let peer = request
            .metadata()
            .get("id")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<NodeId>().ok());
        let mut in_stream = request.into_inner();
        let req = in_stream
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("missing migrate request"))?;
        let shard_id = req.shard;
        info!(
            shard = shard_id,
            start_from = req.start_from,
            "migrating shard"
        );

        let guard = self.state.migrate_lock.clone().lock_owned().await;
        let Some(shard) = self.state.shards.at(shard_id) else {
            info!(shard = shard_id, "already given and deleted");
            return Err(not_responsible());
        };

        let (tx, rx) = mpsc::channel(4);
        let state = self.state.clone();
        tokio::spawn(async move {
            let _guard = guard;
            match run_migration(&state, &shard, req.start_from, &mut in_stream, &tx).await {
                Ok(()) => finish_migration(&state, shard_id).await,
                Err(MigrateFailure::Peer(reason)) => {
                    warn!(shard = shard_id, reason, "migrate stream cancelled");
                    if let Some(peer) = peer {
                        info!(peer, "setting peer as unavailable");
                        if let Err(err) = state.info.set_available(peer, false).await {
                            error!(peer, error = %err, "failed to record peer unavailable");
                        }
                    }
                }
                Err(MigrateFailure::Internal(reason)) => {
                    error!(shard = shard_id, reason, "migration failed");
                    let _ = tx.send(Err(Status::internal(reason))).await;
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

enum MigrateFailure {
    /// The receiver went away; keep the shard and mark him unavailable.
    Peer(String),
    /// A local failure; surface it on the stream.
    Internal(String),
}

fn internal(err: impl ToString) -> MigrateFailure {
    MigrateFailure::Internal(err.to_string())
}

async fn run_migration(
    state: &Arc<NodeState>,
    shard: &Arc<Shard>,
    start_from: u64,
    in_stream: &mut Streaming<MigrateRequest>,
    tx: &mpsc::Sender<Result<MigrateResponse, Status>>,
) -> Result<(), MigrateFailure> {
    let shard_id = shard.id();
    let idle = shard.unref_drain();
    if start_from > 0 {
        info!(shard = shard_id, start_from, "resuming from bulk file");
    }

    // Persist the cleanup intent, then hand ownership over. From this point
    // new requests for the shard are rejected with INVALID_ARGUMENT.
    state
        .db
        .put(sidecar_key(shard_id, "migrating"), [1u8])
        .map_err(internal)?;
    state
        .info
        .give_shard(state.id, shard_id)
        .await
        .map_err(internal)?;

    // Tell the receiver he may start accepting requests for the shard.
    tx.send(Ok(MigrateResponse::default()))
        .await
        .map_err(|_| MigrateFailure::Peer("receiver went away".into()))?;

    // The snapshot must observe every accepted write.
    if !idle {
        shard.wait_refs().await;
    }

    let migrator = ShardMigrator::new(
        state.db.clone(),
        &state.scratch,
        shard_id,
        start_from,
        state.file_target,
    )
    .map_err(internal)?;
    let files = tokio::task::spawn_blocking(move || migrator.dump_shard())
        .await
        .map_err(internal)?
        .map_err(internal)?;

    for file in &files {
        let data = tokio::fs::read(&file.path).await.map_err(internal)?;
        let response = MigrateResponse {
            file_number: file.number,
            data,
            largest_key: file.largest_key.clone(),
            finished: false,
        };
        tx.send(Ok(response))
            .await
            .map_err(|_| MigrateFailure::Peer("receiver went away mid-stream".into()))?;
    }
    tx.send(Ok(MigrateResponse {
        finished: true,
        ..Default::default()
    }))
    .await
    .map_err(|_| MigrateFailure::Peer("receiver went away before finish".into()))?;

    // The final empty request acknowledges that everything was ingested.
    match in_stream.message().await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(MigrateFailure::Peer(
            "stream closed before the final request".into(),
        )),
        Err(status) => Err(MigrateFailure::Peer(status.to_string())),
    }
}

/// Post-finish cleanup: the shard has landed on the new master.
async fn finish_migration(state: &Arc<NodeState>, shard_id: ShardId) {
    info!(shard = shard_id, "shard handed over");
    if let Err(err) = state.shards.remove(shard_id) {
        warn!(shard = shard_id, error = %err, "failed to drop streamed-away keyspace");
    }
    if let Err(err) = state.db.delete(sidecar_key(shard_id, "migrating")) {
        warn!(shard = shard_id, error = %err, "failed to clear handover marker");
    }
    ShardMigrator::clear_state(&state.scratch, shard_id);

    if state.shards.is_empty() && state.info.is_removed(state.id) {
        info!("last shard given away, leaving the cluster");
        if let Err(err) = state.info.remove(state.id).await {
            error!(error = %err, "failed to retire our slot");
        }
        let _ = state.shutdown.send(true);
    }
}

fn commit_batch(db: &Db, updates: Vec<(Arc<Shard>, BatchUpdate)>) -> i32 {
    use proto::batch_update::Op;
    let mut batch = rocksdb::WriteBatch::default();
    for (shard, update) in &updates {
        let Some(cf) = db.cf_handle(&shard.cf_name()) else {
            return engine::INVALID_ARGUMENT;
        };
        match update.op() {
            Op::Put => batch.put_cf(&cf, &update.key, &update.value),
            Op::Delete | Op::SingleDelete => batch.delete_cf(&cf, &update.key),
            Op::Merge => batch.merge_cf(&cf, &update.key, &update.value),
            Op::Clear => batch.clear(),
        }
    }
    match db.write(batch) {
        Ok(()) => engine::OK,
        Err(err) => code_for(&err),
    }
}
