//! Gravel cluster core
//!
//! The cluster map persisted in the coordinator, the pure placement
//! operations over it, and the coordinator client that keeps a cached copy
//! fresh through compare-and-swap mutations and a watch stream.

pub mod coordinator;
pub mod info;
pub mod status;

pub use coordinator::{InfoClient, WatchHandle};
pub use info::{ClusterInfo, ClusterState, NodeEntry, NodeId, ShardId};

/// Errors produced while reading or mutating the cluster map.
#[derive(Debug, thiserror::Error)]
pub enum InfoError {
    #[error("coordinator error: {0}")]
    Coordinator(#[from] etcd_client::Error),
    #[error("cluster map encoding failed: {0}")]
    Encode(String),
    #[error("cluster map decoding failed: {0}")]
    Decode(String),
    #[error("cluster map missing from coordinator")]
    Missing,
    #[error("invalid cluster state: {0}")]
    InvalidState(String),
    #[error("there is another node listening on {0}")]
    AddressInUse(String),
    #[error("cluster is migrating, try again later")]
    Migrating,
    #[error("shard {0} is not placed on any node")]
    UnknownShard(ShardId),
    #[error("unknown node id {0}")]
    UnknownNode(NodeId),
}
