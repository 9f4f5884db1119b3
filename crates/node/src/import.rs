//! Watch-driven shard import
//!
//! A dedicated task watches the cluster map. On every event it rescans the
//! shards this node still has to acquire and pulls each one from its
//! current master over a Migrate stream. The receiver side of the handover
//! protocol lives here; the sender side is in [`crate::server`].

use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request};
use tracing::{error, info, warn};

use gv_core::coordinator::WatchHandle;
use gv_core::info::{NodeId, ShardId};
use proto::rpc_client::RpcClient;
use proto::MigrateRequest;

use crate::migrate::ShardImporter;
use crate::server::{NodeState, MAX_MESSAGE_SIZE};
use crate::shard::Shard;

pub async fn connect(address: &str) -> Result<RpcClient<Channel>, tonic::transport::Error> {
    let channel = Endpoint::from_shared(format!("http://{address}"))?
        .connect()
        .await?;
    Ok(RpcClient::new(channel)
        .max_decoding_message_size(MAX_MESSAGE_SIZE)
        .max_encoding_message_size(MAX_MESSAGE_SIZE))
}

/// Consume cluster-map events and drive shard imports until shutdown. Any
/// error that is not a routable peer crash takes the node down.
pub async fn watch_loop(
    state: Arc<NodeState>,
    mut map_watch: WatchHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if let Err(err) = scan_tasks(&state, &mut map_watch).await {
            error!(error = %err, "import worker failed");
            let _ = state.shutdown.send(true);
            return;
        }
        tokio::select! {
            canceled = map_watch.next() => match canceled {
                Ok(false) => {}
                Ok(true) => return,
                Err(err) => {
                    error!(error = %err, "cluster map watch broke");
                    let _ = state.shutdown.send(true);
                    return;
                }
            },
            _ = shutdown.changed() => return,
        }
    }
}

async fn scan_tasks(state: &Arc<NodeState>, map_watch: &mut WatchHandle) -> anyhow::Result<()> {
    // Shards still held by their masters.
    for (peer, shards) in state.info.tasks(state.id) {
        let Some(address) = state.info.address(peer) else {
            continue;
        };
        for shard_id in shards {
            if !state.info.is_available(peer) {
                info!(
                    peer,
                    shard = shard_id,
                    "node unavailable, skipping request for shard"
                );
                continue;
            }
            pull_shard(state, map_watch, shard_id, Some(peer), &address).await?;
        }
    }
    // Shards already handed to us whose old master finished or crashed
    // before we could announce the migration as over.
    for shard_id in state.info.orphan_futures(state.id) {
        let Some(shard) = state.shards.at(shard_id) else {
            warn!(shard = shard_id, "handed-over shard missing locally");
            continue;
        };
        let address = shard.old_address();
        if address.is_empty() {
            // The old master retired his slot; his stream had finished.
            let importer = ShardImporter::new(state.db.clone(), &state.scratch, shard_id)?;
            migration_over(state, map_watch, &shard, &importer).await?;
            continue;
        }
        let peer = state.info.index_of_address(&address);
        pull_shard(state, map_watch, shard_id, peer, &address).await?;
    }
    Ok(())
}

/// Pull one shard from the node at `address`. Peer crashes are recorded and
/// retried on a later watch event; only coordinator or local engine
/// failures propagate.
async fn pull_shard(
    state: &Arc<NodeState>,
    map_watch: &mut WatchHandle,
    shard_id: ShardId,
    peer: Option<NodeId>,
    address: &str,
) -> anyhow::Result<()> {
    info!(shard = shard_id, address, "requesting shard");
    let shard = match state.shards.at(shard_id) {
        Some(shard) => shard,
        None => state
            .shards
            .add(shard_id, address)
            .context("creating importing shard")?,
    };
    shard.set_importing(true);

    let mut importer = ShardImporter::new(state.db.clone(), &state.scratch, shard_id)
        .context("setting up importer")?;
    shard.set_largest_key(importer.largest_key()?);

    let mut client = match connect(address).await {
        Ok(client) => client,
        Err(err) => {
            warn!(address, error = %err, "cannot reach shard master");
            return mark_unavailable(state, peer).await;
        }
    };

    let (req_tx, req_rx) = mpsc::channel::<MigrateRequest>(4);
    req_tx
        .send(MigrateRequest {
            shard: shard_id,
            start_from: importer.next_file(),
        })
        .await
        .ok();
    let mut request = Request::new(ReceiverStream::new(req_rx));
    let id_value: MetadataValue<_> = state
        .id
        .to_string()
        .parse()
        .map_err(|_| anyhow!("node id is not valid metadata"))?;
    request.metadata_mut().insert("id", id_value);

    let mut inbound = match client.migrate(request).await {
        Ok(response) => response.into_inner(),
        Err(status) if status.code() == Code::InvalidArgument => {
            // He already streamed everything and dropped the shard, but
            // crashed before we could announce it.
            info!(
                shard = shard_id,
                "migration was already finished by the old master"
            );
            migration_over(state, map_watch, &shard, &importer).await?;
            return Ok(());
        }
        Err(status) => return handle_error(state, status, peer).await,
    };

    // The first, empty response is the go-ahead. We wait for it and for the
    // observed ownership change, in either order, and serve the shard from
    // the instant both have happened.
    match inbound.message().await {
        Ok(Some(_)) => {}
        Ok(None) => return mark_unavailable(state, peer).await,
        Err(status) => return handle_error(state, status, peer).await,
    }
    while state.info.index_for_shard(shard_id) != Some(state.id) {
        if map_watch.next().await? {
            return Ok(());
        }
    }

    loop {
        match inbound.message().await {
            Ok(Some(response)) => {
                if response.finished {
                    break;
                }
                importer
                    .write_file(response.file_number, &response.data, &response.largest_key)
                    .context("ingesting streamed file")?;
                shard.set_largest_key(response.largest_key);
            }
            Ok(None) => return mark_unavailable(state, peer).await,
            Err(status) => return handle_error(state, status, peer).await,
        }
    }

    // Acknowledge and wait for the sender to finish cleanly.
    let _ = req_tx.send(MigrateRequest::default()).await;
    drop(req_tx);
    loop {
        match inbound.message().await {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(status) => return handle_error(state, status, peer).await,
        }
    }

    migration_over(state, map_watch, &shard, &importer).await?;
    info!(shard = shard_id, "imported shard");
    Ok(())
}

/// Announce the migration as over, clear the import scratch state, and wait
/// until the coordinator confirms before serving reads purely locally.
async fn migration_over(
    state: &Arc<NodeState>,
    map_watch: &mut WatchHandle,
    shard: &Arc<Shard>,
    importer: &ShardImporter,
) -> anyhow::Result<()> {
    state.info.migration_over(shard.id()).await?;
    importer.clear_state()?;
    while state.info.is_migrating_shard(shard.id()) {
        if map_watch.next().await? {
            break;
        }
    }
    shard.set_importing(false);
    Ok(())
}

async fn mark_unavailable(state: &Arc<NodeState>, peer: Option<NodeId>) -> anyhow::Result<()> {
    if let Some(peer) = peer {
        info!(peer, "setting node as unavailable");
        state.info.set_available(peer, false).await?;
    }
    Ok(())
}

async fn handle_error(
    state: &Arc<NodeState>,
    status: tonic::Status,
    peer: Option<NodeId>,
) -> anyhow::Result<()> {
    if status.code() == Code::Unavailable {
        return mark_unavailable(state, peer).await;
    }
    // Every error other than UNAVAILABLE is unrecoverable here.
    Err(anyhow!("migrate rpc failed: {status}"))
}
