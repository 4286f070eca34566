//! Consistent hash ring with virtual nodes.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, warn};

use super::hash::{fnv1a_32, HashFn};

/// Default number of virtual nodes per physical node.
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

/// Attempts at finding a free ring position before a virtual node is dropped.
const MAX_REHASHES: u32 = 16;

/// Maps keys to the physical node that owns them.
///
/// Each physical node occupies `virtual_nodes` positions on a 32-bit ring,
/// placed at `hash("{node}:{i}")`. A key belongs to the node owning the
/// first position at or after `hash(key)`, wrapping around at the top.
/// Adding or removing a node only moves keys to or from that node.
#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    virtual_nodes: usize,
    hash: HashFn,
    /// Position -> physical node
    ring: BTreeMap<u32, String>,
    /// Physical node -> the positions it holds
    nodes: HashMap<String, Vec<u32>>,
}

impl ConsistentHashRing {
    /// Create an empty ring using the default hash function.
    pub fn new(virtual_nodes: usize) -> Self {
        Self::with_hasher(virtual_nodes, fnv1a_32)
    }

    /// Create an empty ring with a custom hash function.
    pub fn with_hasher(virtual_nodes: usize, hash: HashFn) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            hash,
            ring: BTreeMap::new(),
            nodes: HashMap::new(),
        }
    }

    /// Add a physical node. No-op if it is already present.
    pub fn add_node(&mut self, node_id: &str) {
        if self.nodes.contains_key(node_id) {
            return;
        }

        let mut positions = Vec::with_capacity(self.virtual_nodes);
        for i in 0..self.virtual_nodes {
            match self.free_position(node_id, i) {
                Some(position) => {
                    self.ring.insert(position, node_id.to_string());
                    positions.push(position);
                }
                None => warn!(
                    node = %node_id,
                    replica = i,
                    "No free ring position for virtual node, skipping"
                ),
            }
        }

        debug!(node = %node_id, positions = positions.len(), "Added node to hash ring");
        self.nodes.insert(node_id.to_string(), positions);
    }

    /// Remove a physical node and exactly its virtual positions. No-op if absent.
    pub fn remove_node(&mut self, node_id: &str) {
        let Some(positions) = self.nodes.remove(node_id) else {
            return;
        };

        for position in &positions {
            self.ring.remove(position);
        }

        debug!(node = %node_id, positions = positions.len(), "Removed node from hash ring");
    }

    /// The node owning `key`, or `None` on an empty ring.
    pub fn get_node(&self, key: &str) -> Option<&str> {
        let hash = (self.hash)(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node.as_str())
    }

    /// Up to `n` distinct nodes for `key`, walking clockwise from its owner.
    ///
    /// The first entry is the owner returned by [`get_node`](Self::get_node).
    pub fn get_nodes(&self, key: &str, n: usize) -> Vec<&str> {
        let wanted = n.min(self.nodes.len());
        let mut result: Vec<&str> = Vec::with_capacity(wanted);
        if wanted == 0 {
            return result;
        }

        let hash = (self.hash)(key);
        let mut seen = HashSet::with_capacity(wanted);

        for (_, node) in self.ring.range(hash..).chain(self.ring.range(..hash)) {
            if seen.insert(node.as_str()) {
                result.push(node.as_str());
                if result.len() == wanted {
                    break;
                }
            }
        }

        result
    }

    /// Number of physical nodes.
    pub fn get_node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of virtual positions on the ring.
    pub fn get_ring_size(&self) -> usize {
        self.ring.len()
    }

    /// Physical node ids, sorted.
    pub fn get_node_list(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.nodes.keys().cloned().collect();
        nodes.sort();
        nodes
    }

    /// Virtual position count per physical node.
    pub fn get_distribution(&self) -> HashMap<String, usize> {
        self.nodes
            .iter()
            .map(|(node, positions)| (node.clone(), positions.len()))
            .collect()
    }

    /// Whether `node_id` is on the ring.
    pub fn contains_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Virtual nodes per physical node.
    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Find an unoccupied position for virtual node `replica` of `node_id`.
    ///
    /// Collisions are resolved by rehashing with an attempt suffix, so the
    /// result depends only on the node id and which positions are taken.
    fn free_position(&self, node_id: &str, replica: usize) -> Option<u32> {
        let position = (self.hash)(&format!("{}:{}", node_id, replica));
        if !self.ring.contains_key(&position) {
            return Some(position);
        }

        (1..=MAX_REHASHES)
            .map(|attempt| (self.hash)(&format!("{}:{}#{}", node_id, replica, attempt)))
            .find(|position| !self.ring.contains_key(position))
    }
}

impl Default for ConsistentHashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}
