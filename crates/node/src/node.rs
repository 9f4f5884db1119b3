//! Node bootstrap: join the cluster, recover local state, serve
//!
//! The boot order matters: announce ourselves to the coordinator first (so
//! a crashed node reclaims its slot before anyone else takes the address),
//! then open the storage engine and rediscover its keyspaces, then start
//! the watch so no placement event is missed, and only then serve and flip
//! our availability.

use std::sync::Arc;

use anyhow::Context;
use rocksdb::{ColumnFamilyDescriptor, Options};
use tokio::sync::{watch, Mutex};
use tokio_stream::wrappers::TcpListenerStream;
use tracing::{error, info, warn};

use gv_core::coordinator::InfoClient;
use gv_core::info::ShardId;
use proto::rpc_server::RpcServer;

use crate::config::Config;
use crate::import;
use crate::migrate::{ShardImporter, ShardMigrator};
use crate::server::{NodeState, RpcService, MAX_MESSAGE_SIZE};
use crate::shard::{sidecar_key, Db, ShardTable};

pub struct GravelNode {
    state: Arc<NodeState>,
    map_watch: gv_core::coordinator::WatchHandle,
    listen_addr: String,
}

impl GravelNode {
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let info = Arc::new(
            InfoClient::connect(&config.node.etcd)
                .await
                .context("connecting to the coordinator")?,
        );
        let advertise = config.advertise_addr();
        let id = info
            .add(&advertise, config.node.num_shards)
            .await
            .context("joining the cluster")?;
        info!(id, address = %advertise, "joined cluster");

        let db = open_db(&config)?;
        let shards = Arc::new(ShardTable::new(db.clone()));
        let recovered = existing_shards(&config);
        if recovered.is_empty() {
            for shard_id in info.shards(id) {
                shards.create(shard_id).context("creating shard keyspace")?;
            }
        } else {
            info!(shards = ?recovered, "recovering from crash");
            for shard_id in recovered {
                shards.insert_existing(shard_id);
            }
        }

        // Watch from here on; the scan below and the import worker rely on
        // the cache being current.
        let map_watch = info.watch().await.context("watching the cluster map")?;

        let (shutdown, _) = watch::channel(false);
        let state = Arc::new(NodeState {
            id,
            db,
            info,
            shards,
            scratch: config.storage.data_dir.join("scratch"),
            file_target: config.storage.file_target,
            migrate_lock: Arc::new(Mutex::new(())),
            shutdown,
        });

        recover_given_shards(&state)?;
        recover_importing_shards(&state)?;

        Ok(Self {
            state,
            map_watch,
            listen_addr: config.listen_addr(),
        })
    }

    /// Serve until a shutdown is signalled (last shard given away on a
    /// removed node, a fatal import failure, or Ctrl-C).
    pub async fn run(self) -> anyhow::Result<()> {
        let state = self.state;

        let watcher = tokio::spawn(import::watch_loop(
            state.clone(),
            self.map_watch,
            state.shutdown.subscribe(),
        ));

        let listener = tokio::net::TcpListener::bind(&self.listen_addr)
            .await
            .with_context(|| format!("binding {}", self.listen_addr))?;
        info!(address = %self.listen_addr, "server listening");

        let service = RpcService::new(state.clone());
        let mut signal_rx = state.shutdown.subscribe();
        let server = tonic::transport::Server::builder()
            .add_service(
                RpcServer::new(service)
                    .max_decoding_message_size(MAX_MESSAGE_SIZE)
                    .max_encoding_message_size(MAX_MESSAGE_SIZE),
            )
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                let _ = signal_rx.changed().await;
            });

        let ctrl_c_state = state.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down");
                let _ = ctrl_c_state.shutdown.send(true);
            }
        });

        // The socket is bound; let the cluster route to us.
        state
            .info
            .set_available(state.id, true)
            .await
            .context("announcing availability")?;

        server.await.context("serving")?;
        watcher.abort();
        Ok(())
    }
}

fn open_db(config: &Config) -> anyhow::Result<Arc<Db>> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.increase_parallelism(4);
    opts.optimize_level_style_compaction(512 << 20);
    // Bulk files ingested during an import must sit behind live writes.
    opts.set_allow_ingest_behind(true);

    let path = &config.storage.data_dir;
    let existing = Db::list_cf(&opts, path).unwrap_or_default();
    let db = if existing.is_empty() {
        Db::open(&opts, path)
    } else {
        let descriptors: Vec<ColumnFamilyDescriptor> = existing
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();
        Db::open_cf_descriptors(&opts, path, descriptors)
    };
    Ok(Arc::new(db.context("opening the storage engine")?))
}

/// Shard ids of the keyspaces already present on disk.
fn existing_shards(config: &Config) -> Vec<ShardId> {
    let opts = Options::default();
    let names = Db::list_cf(&opts, &config.storage.data_dir).unwrap_or_default();
    let mut ids: Vec<ShardId> = names.iter().filter_map(|n| n.parse().ok()).collect();
    ids.sort_unstable();
    ids
}

/// A sender that crashed between a successful handover and its cleanup left
/// the keyspace, the scratch files and the intent marker behind. Finish the
/// job before serving.
fn recover_given_shards(state: &Arc<NodeState>) -> anyhow::Result<()> {
    for shard_id in state.shards.shard_ids() {
        let marker = state.db.get(sidecar_key(shard_id, "migrating"))?;
        if marker.is_none() {
            continue;
        }
        let owned = state.info.shards(state.id).contains(&shard_id)
            || state.info.future(state.id).contains(&shard_id);
        if owned {
            // The handover never committed; we are still the master.
            state.db.delete(sidecar_key(shard_id, "migrating"))?;
            continue;
        }
        warn!(shard = shard_id, "dropping shard left over from an interrupted handover");
        if let Err(err) = state.shards.remove(shard_id) {
            error!(shard = shard_id, error = %err, "failed to drop leftover keyspace");
        }
        ShardMigrator::clear_state(&state.scratch, shard_id);
        state.db.delete(sidecar_key(shard_id, "migrating"))?;
    }
    Ok(())
}

/// Mark shards that are still being pulled as importing and reload their
/// import progress, finishing any file a previous run wrote but did not
/// ingest.
fn recover_importing_shards(state: &Arc<NodeState>) -> anyhow::Result<()> {
    for shard_id in state.info.future(state.id) {
        let Some(shard) = state.shards.at(shard_id) else {
            continue;
        };
        shard.set_importing(true);
        if let Some(raw) = state.db.get(sidecar_key(shard_id, "old_address"))? {
            shard.set_old_address(&String::from_utf8_lossy(&raw));
        }
        let importer = ShardImporter::new(state.db.clone(), &state.scratch, shard_id)?;
        shard.set_largest_key(importer.largest_key()?);
        info!(shard = shard_id, "resuming interrupted import");
    }
    Ok(())
}
