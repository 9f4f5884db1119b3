//! The cluster map and its placement operations
//!
//! A single value in the coordinator describes the whole cluster: its
//! lifecycle state, the fixed shard count and one slot per node that ever
//! joined. Everything in this module is pure; the coordinator round-trips
//! live in [`crate::coordinator`].

use std::collections::{BTreeSet, HashMap};

use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};

use crate::InfoError;

/// Node ids are positions in the slot list and stay stable for the lifetime
/// of the cluster.
pub type NodeId = usize;
pub type ShardId = u32;

/// CRC32 used to place keys; clients and servers must agree on it.
static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Map a key to its shard.
pub fn shard_for_key(key: &[u8], num_shards: u32) -> ShardId {
    debug_assert!(num_shards > 0);
    CRC32.checksum(key) % num_shards
}

/// Cluster lifecycle. The only legal cycle is
/// INIT -> RUNNING -> MIGRATING -> RUNNING -> ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterState {
    Init,
    Running,
    Migrating,
}

/// One node slot. A retired slot keeps its position with an empty address so
/// that ids of the remaining nodes never shift.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub address: String,
    /// Shards this node currently owns.
    pub shards: BTreeSet<ShardId>,
    /// Shards this node must acquire before the current migration completes.
    pub future: BTreeSet<ShardId>,
    /// Liveness as observed by peers; advisory.
    pub available: bool,
    /// The node asked to leave the cluster.
    pub remove: bool,
}

/// The value stored under the single coordinator key.
///
/// `BTreeSet` keeps the serialized form deterministic, which the
/// compare-and-swap loop in the coordinator client relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    state: ClusterState,
    num_shards: u32,
    nodes: Vec<NodeEntry>,
}

impl Default for ClusterInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterInfo {
    pub fn new() -> Self {
        Self {
            state: ClusterState::Init,
            num_shards: 0,
            nodes: Vec::new(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, InfoError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| InfoError::Encode(e.to_string()))
    }

    pub fn parse(raw: &[u8]) -> Result<Self, InfoError> {
        bincode::serde::decode_from_slice(raw, bincode::config::standard())
            .map(|(info, _)| info)
            .map_err(|e| InfoError::Decode(e.to_string()))
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn is_init(&self) -> bool {
        self.state == ClusterState::Init
    }

    pub fn is_running(&self) -> bool {
        self.state == ClusterState::Running
    }

    pub fn is_migrating(&self) -> bool {
        self.state == ClusterState::Migrating
    }

    pub fn num_shards(&self) -> u32 {
        self.num_shards
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn entries(&self) -> &[NodeEntry] {
        &self.nodes
    }

    pub fn shard_for_key(&self, key: &[u8]) -> ShardId {
        shard_for_key(key, self.num_shards)
    }

    /// Address of a node, `None` for unknown ids and retired slots.
    pub fn address(&self, id: NodeId) -> Option<&str> {
        self.nodes
            .get(id)
            .map(|n| n.address.as_str())
            .filter(|a| !a.is_empty())
    }

    /// One address per slot, retired slots as empty strings.
    pub fn addresses(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.address.clone()).collect()
    }

    /// Ids of the slots that still have a node behind them.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.address.is_empty())
            .map(|(id, _)| id)
            .collect()
    }

    pub fn index_of(&self, address: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| !n.address.is_empty() && n.address == address)
    }

    /// The node responsible for a shard. While a migration is pending the
    /// old master owns it; once it has been handed over (present only in a
    /// `future` set) responsibility moves to the receiving node, which is
    /// what flips client routing atomically at handover.
    pub fn index_for_shard(&self, shard: ShardId) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.shards.contains(&shard))
            .or_else(|| self.nodes.iter().position(|n| n.future.contains(&shard)))
    }

    pub fn index_for_key(&self, key: &[u8]) -> Option<NodeId> {
        self.index_for_shard(self.shard_for_key(key))
    }

    pub fn shards(&self, id: NodeId) -> Vec<ShardId> {
        self.nodes
            .get(id)
            .map(|n| n.shards.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn future(&self, id: NodeId) -> Vec<ShardId> {
        self.nodes
            .get(id)
            .map(|n| n.future.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_available(&self, id: NodeId) -> bool {
        self.nodes.get(id).map(|n| n.available).unwrap_or(false)
    }

    pub fn set_available(&mut self, id: NodeId, available: bool) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.available = available;
        }
    }

    pub fn is_removed(&self, id: NodeId) -> bool {
        self.nodes.get(id).map(|n| n.remove).unwrap_or(false)
    }

    /// Healthy means every node that has an address is marked available.
    pub fn is_healthy(&self) -> bool {
        self.nodes
            .iter()
            .filter(|n| !n.address.is_empty())
            .all(|n| n.available)
    }

    pub fn no_migrations(&self) -> bool {
        self.nodes.iter().all(|n| n.future.is_empty())
    }

    /// Whether a migration for this shard is still pending.
    pub fn is_migrating_shard(&self, shard: ShardId) -> bool {
        self.nodes.iter().any(|n| n.future.contains(&shard))
    }

    /// Join during INIT: append a slot and spread `[0, num_shards)` evenly
    /// and contiguously over all current nodes. The very first writer fixes
    /// the shard count; later INIT joiners' preference is ignored.
    pub fn add_node_with_new_shards(
        &mut self,
        address: &str,
        num_shards: u32,
    ) -> Result<NodeId, InfoError> {
        if !self.is_init() {
            return Err(InfoError::InvalidState(
                "new shards can only be created during INIT".into(),
            ));
        }
        if self.nodes.is_empty() {
            self.num_shards = num_shards;
        } else if num_shards != self.num_shards {
            tracing::debug!(
                requested = num_shards,
                established = self.num_shards,
                "shard count already established, ignoring"
            );
        }
        let id = self.nodes.len();
        self.nodes.push(NodeEntry {
            address: address.to_string(),
            ..Default::default()
        });

        let n = self.nodes.len() as u32;
        let base = self.num_shards / n;
        let extra = self.num_shards % n;
        let mut next: ShardId = 0;
        for (pos, node) in self.nodes.iter_mut().enumerate() {
            let count = base + u32::from((pos as u32) < extra);
            node.shards = (next..next + count).collect();
            node.future.clear();
            next += count;
        }
        Ok(id)
    }

    /// Join a RUNNING cluster with nothing assigned.
    pub fn add_node(&mut self, address: &str) -> Result<NodeId, InfoError> {
        if !self.is_running() {
            return Err(InfoError::InvalidState(
                "nodes can only join a RUNNING cluster".into(),
            ));
        }
        let id = self.nodes.len();
        self.nodes.push(NodeEntry {
            address: address.to_string(),
            ..Default::default()
        });
        Ok(id)
    }

    /// Ask for the graceful removal of a node. The slot is emptied once a
    /// migration has drained its shards.
    pub fn mark_remove(&mut self, id: NodeId) -> Result<(), InfoError> {
        if !self.is_running() {
            return Err(InfoError::InvalidState(
                "removal can only be requested while RUNNING".into(),
            ));
        }
        let node = self.nodes.get_mut(id).ok_or(InfoError::UnknownNode(id))?;
        if node.address.is_empty() {
            return Err(InfoError::UnknownNode(id));
        }
        node.remove = true;
        Ok(())
    }

    /// Retire a slot. Only meaningful once the node owns nothing.
    pub fn remove_node(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(id) {
            debug_assert!(node.shards.is_empty() && node.future.is_empty());
            *node = NodeEntry::default();
        }
    }

    /// Compute a target allocation over the non-retired, non-removed nodes
    /// where shard counts differ by at most one, and schedule the diff as
    /// movements: each moving shard stays in its owner's `shards` and lands
    /// in the receiver's `future`. Nodes marked for removal lose everything.
    pub fn redistribute_shards(&mut self) {
        let eligible: Vec<NodeId> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.address.is_empty() && !n.remove)
            .map(|(id, _)| id)
            .collect();
        if eligible.is_empty() {
            return;
        }
        let n = eligible.len() as u32;
        let base = (self.num_shards / n) as usize;
        let extra = (self.num_shards % n) as usize;
        let targets: HashMap<NodeId, usize> = eligible
            .iter()
            .enumerate()
            .map(|(pos, &id)| (id, base + usize::from(pos < extra)))
            .collect();

        // Existing owners keep as much as their target allows; the excess
        // (largest ids first, preserving each node's contiguous prefix) and
        // everything on removed nodes has to move.
        let mut moving: Vec<ShardId> = Vec::new();
        for (id, node) in self.nodes.iter().enumerate() {
            let target = targets.get(&id).copied().unwrap_or(0);
            if node.shards.len() > target {
                let excess = node.shards.len() - target;
                moving.extend(node.shards.iter().rev().take(excess).copied());
            }
        }
        moving.sort_unstable();
        let mut moving = moving.into_iter();

        for &id in &eligible {
            let target = targets[&id];
            let have = self.nodes[id].shards.len();
            for _ in have..target {
                match moving.next() {
                    Some(shard) => {
                        self.nodes[id].future.insert(shard);
                    }
                    None => return,
                }
            }
        }
    }

    pub fn set_running(&mut self) -> Result<(), InfoError> {
        match self.state {
            ClusterState::Init | ClusterState::Migrating => {
                self.state = ClusterState::Running;
                Ok(())
            }
            ClusterState::Running => Err(InfoError::InvalidState("already RUNNING".into())),
        }
    }

    pub fn set_migrating(&mut self) -> Result<(), InfoError> {
        match self.state {
            ClusterState::Running => {
                self.state = ClusterState::Migrating;
                Ok(())
            }
            _ => Err(InfoError::InvalidState(
                "MIGRATING can only follow RUNNING".into(),
            )),
        }
    }

    /// Hand a shard over: remove it from the giver's `shards`, leaving it in
    /// the receiver's `future` only. Returns false when the handover had
    /// already been recorded (a resumed migration).
    pub fn give_shard(&mut self, from: NodeId, shard: ShardId) -> Result<bool, InfoError> {
        let has_future = self.nodes.iter().any(|n| n.future.contains(&shard));
        if !has_future {
            return Err(InfoError::UnknownShard(shard));
        }
        let node = self.nodes.get_mut(from).ok_or(InfoError::UnknownNode(from))?;
        Ok(node.shards.remove(&shard))
    }

    /// Finish one shard's migration: promote it from the holder's `future`
    /// into its `shards`. When nothing is left to migrate the cluster goes
    /// back to RUNNING and slots of drained, removal-marked nodes retire.
    pub fn migration_over(&mut self, shard: ShardId) -> Result<(), InfoError> {
        let holder = self
            .nodes
            .iter()
            .position(|n| n.future.contains(&shard))
            .ok_or(InfoError::UnknownShard(shard))?;
        self.nodes[holder].future.remove(&shard);
        self.nodes[holder].shards.insert(shard);
        if self.no_migrations() {
            self.state = ClusterState::Running;
            for node in &mut self.nodes {
                if node.remove && node.shards.is_empty() && node.future.is_empty() {
                    *node = NodeEntry::default();
                }
            }
        }
        Ok(())
    }

    /// The pulls a node has to perform: each shard in its `future` mapped to
    /// the node that still holds it. Shards whose holder already handed them
    /// over do not appear here; see [`ClusterInfo::orphan_futures`].
    pub fn tasks(&self, id: NodeId) -> HashMap<NodeId, Vec<ShardId>> {
        let mut tasks: HashMap<NodeId, Vec<ShardId>> = HashMap::new();
        for shard in self.future(id) {
            if let Some(owner) = self.nodes.iter().position(|n| n.shards.contains(&shard)) {
                tasks.entry(owner).or_default().push(shard);
            }
        }
        tasks
    }

    /// Shards in this node's `future` that no node holds in `shards` any
    /// more: the handover is recorded but this node has not yet announced
    /// the migration as over.
    pub fn orphan_futures(&self, id: NodeId) -> Vec<ShardId> {
        self.future(id)
            .into_iter()
            .filter(|shard| !self.nodes.iter().any(|n| n.shards.contains(shard)))
            .collect()
    }
}

/// Render a sorted shard list compactly, e.g. `[1,2,3,5,7,8,9]` as
/// `"1-3,5,7-9"`.
pub fn format_shard_list(shards: &[ShardId]) -> String {
    let mut out = String::new();
    let mut i = 0;
    while i < shards.len() {
        let start = shards[i];
        let mut end = start;
        while i + 1 < shards.len() && shards[i + 1] == end + 1 {
            end = shards[i + 1];
            i += 1;
        }
        if !out.is_empty() {
            out.push(',');
        }
        if end > start {
            out.push_str(&format!("{start}-{end}"));
        } else {
            out.push_str(&format!("{start}"));
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_two_nodes() -> ClusterInfo {
        let mut info = ClusterInfo::new();
        info.add_node_with_new_shards("a:1", 4).unwrap();
        info.set_running().unwrap();
        info.add_node("b:1").unwrap();
        info
    }

    #[test]
    fn test_shard_for_key_is_stable() {
        let a = shard_for_key(b"some_key", 10);
        let b = shard_for_key(b"some_key", 10);
        assert_eq!(a, b);
        assert!(a < 10);
    }

    #[test]
    fn test_first_node_gets_all_shards() {
        let mut info = ClusterInfo::new();
        let id = info.add_node_with_new_shards("a:1", 4).unwrap();
        assert_eq!(id, 0);
        assert!(info.is_init());
        assert_eq!(info.num_shards(), 4);
        assert_eq!(info.shards(0), vec![0, 1, 2, 3]);
        assert!(info.future(0).is_empty());
    }

    #[test]
    fn test_init_join_splits_contiguously() {
        let mut info = ClusterInfo::new();
        info.add_node_with_new_shards("a:1", 5).unwrap();
        info.add_node_with_new_shards("b:1", 5).unwrap();
        // 5 over 2 nodes: first node gets the extra one.
        assert_eq!(info.shards(0), vec![0, 1, 2]);
        assert_eq!(info.shards(1), vec![3, 4]);
    }

    #[test]
    fn test_join_running_owns_nothing() {
        let info = running_two_nodes();
        assert!(info.shards(1).is_empty());
        assert!(info.future(1).is_empty());
        assert_eq!(info.shards(0), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_redistribute_moves_half_to_new_node() {
        let mut info = running_two_nodes();
        info.redistribute_shards();
        // Counts may differ by at most one; movements land in futures only.
        assert_eq!(info.shards(0), vec![0, 1, 2, 3]);
        assert_eq!(info.future(1), vec![2, 3]);
        assert!(!info.no_migrations());
        info.set_migrating().unwrap();
        // Mid-migration the union of shards and future covers the range.
        for shard in 0..4 {
            assert!(info.index_for_shard(shard).is_some());
        }
    }

    #[test]
    fn test_redistribute_is_noop_when_balanced() {
        let mut info = ClusterInfo::new();
        info.add_node_with_new_shards("a:1", 4).unwrap();
        info.set_running().unwrap();
        info.redistribute_shards();
        assert!(info.no_migrations());
    }

    #[test]
    fn test_redistribute_single_removed_node_has_no_target() {
        let mut info = ClusterInfo::new();
        info.add_node_with_new_shards("a:1", 4).unwrap();
        info.set_running().unwrap();
        info.mark_remove(0).unwrap();
        info.redistribute_shards();
        // No peer to take the shards; there is nothing to migrate.
        assert!(info.no_migrations());
    }

    #[test]
    fn test_give_shard_flips_routing() {
        let mut info = running_two_nodes();
        info.redistribute_shards();
        info.set_migrating().unwrap();
        assert_eq!(info.index_for_shard(2), Some(0));
        assert!(info.give_shard(0, 2).unwrap());
        // Only in node 1's future now, so node 1 is responsible.
        assert_eq!(info.index_for_shard(2), Some(1));
        // A second handover of the same shard is recognised as already done.
        assert!(!info.give_shard(0, 2).unwrap());
    }

    #[test]
    fn test_migration_over_promotes_and_finishes() {
        let mut info = running_two_nodes();
        info.redistribute_shards();
        info.set_migrating().unwrap();
        for shard in [2, 3] {
            info.give_shard(0, shard).unwrap();
            info.migration_over(shard).unwrap();
            // Ownership is unchanged relative to the handover.
            assert_eq!(info.index_for_shard(shard), Some(1));
        }
        assert!(info.is_running());
        assert_eq!(info.shards(0), vec![0, 1]);
        assert_eq!(info.shards(1), vec![2, 3]);
        assert!(info.no_migrations());
    }

    #[test]
    fn test_graceful_removal_empties_slot() {
        let mut info = ClusterInfo::new();
        info.add_node_with_new_shards("a:1", 4).unwrap();
        info.set_running().unwrap();
        info.add_node("b:1").unwrap();
        info.mark_remove(0).unwrap();
        info.redistribute_shards();
        assert_eq!(info.future(1), vec![0, 1, 2, 3]);
        info.set_migrating().unwrap();
        for shard in 0..4 {
            info.give_shard(0, shard).unwrap();
            info.migration_over(shard).unwrap();
        }
        assert!(info.is_running());
        assert!(info.address(0).is_none());
        assert!(!info.is_removed(0));
        assert_eq!(info.shards(1), vec![0, 1, 2, 3]);
        // Ids are stable: the survivor keeps its slot.
        assert_eq!(info.index_of("b:1"), Some(1));
    }

    #[test]
    fn test_tasks_groups_by_owner() {
        let mut info = running_two_nodes();
        info.redistribute_shards();
        info.set_migrating().unwrap();
        let tasks = info.tasks(1);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[&0], vec![2, 3]);
        assert!(info.tasks(0).is_empty());
        assert!(info.orphan_futures(1).is_empty());
        // After the handover the shard no longer shows up as a task.
        info.give_shard(0, 2).unwrap();
        assert_eq!(info.tasks(1)[&0], vec![3]);
        assert_eq!(info.orphan_futures(1), vec![2]);
    }

    #[test]
    fn test_health_tracks_addressed_nodes() {
        let mut info = running_two_nodes();
        assert!(!info.is_healthy());
        info.set_available(0, true);
        info.set_available(1, true);
        assert!(info.is_healthy());
        info.set_available(1, false);
        assert!(!info.is_healthy());
    }

    #[test]
    fn test_serialize_parse_round_trip() {
        let mut info = running_two_nodes();
        info.redistribute_shards();
        info.set_migrating().unwrap();
        info.set_available(0, true);
        let raw = info.serialize().unwrap();
        let parsed = ClusterInfo::parse(&raw).unwrap();
        assert_eq!(parsed, info);
        // Deterministic bytes, as the CAS value-compare requires.
        assert_eq!(parsed.serialize().unwrap(), raw);
    }

    #[test]
    fn test_format_shard_list() {
        assert_eq!(format_shard_list(&[1, 2, 3, 5, 7, 8, 9]), "1-3,5,7-9");
        assert_eq!(format_shard_list(&[4]), "4");
        assert_eq!(format_shard_list(&[]), "");
        assert_eq!(format_shard_list(&[0, 1, 2, 3]), "0-3");
    }

    #[test]
    fn test_rejected_transitions() {
        let mut info = ClusterInfo::new();
        info.add_node_with_new_shards("a:1", 2).unwrap();
        assert!(info.set_migrating().is_err());
        info.set_running().unwrap();
        assert!(info.set_running().is_err());
        assert!(info.add_node_with_new_shards("b:1", 2).is_err());
    }
}
