//! Consistent hash ring for queue routing
//!
//! Each physical node owns `virtual_nodes` positions on a 128-bit ring.
//! A key is owned by the node at the smallest position >= hash(key),
//! wrapping around at the top of the ring. Position ties break by
//! lexicographic node id.

use std::collections::BTreeSet;

/// 128-bit ring position from the first 16 bytes of a BLAKE3 hash
fn ring_hash(input: &str) -> u128 {
    let hash = blake3::hash(input.as_bytes());
    u128::from_be_bytes(hash.as_bytes()[0..16].try_into().unwrap())
}

/// Consistent hash ring with virtual-node placement
#[derive(Debug, Clone)]
pub struct ConsistentHashRing {
    virtual_nodes: usize,
    /// Sorted (position, node_id) pairs
    positions: Vec<(u128, String)>,
    nodes: BTreeSet<String>,
}

impl ConsistentHashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes,
            positions: Vec::new(),
            nodes: BTreeSet::new(),
        }
    }

    /// Build a ring from a node list
    pub fn with_nodes(virtual_nodes: usize, node_ids: &[String]) -> Self {
        let mut ring = Self::new(virtual_nodes);
        for id in node_ids {
            ring.add_node(id);
        }
        ring
    }

    /// Add a node's virtual positions and re-sort the ring
    pub fn add_node(&mut self, node_id: &str) {
        if !self.nodes.insert(node_id.to_string()) {
            return;
        }
        for i in 0..self.virtual_nodes {
            let position = ring_hash(&format!("{}:{}", node_id, i));
            self.positions.push((position, node_id.to_string()));
        }
        // Ties on position resolve to the lexicographically smaller node id
        self.positions.sort();
    }

    /// Remove a node's virtual positions
    pub fn remove_node(&mut self, node_id: &str) {
        if !self.nodes.remove(node_id) {
            return;
        }
        self.positions.retain(|(_, id)| id != node_id);
    }

    /// Owner of a key: the node at the smallest position >= hash(key), wrapping
    pub fn owner(&self, key: &str) -> Option<&str> {
        if self.positions.is_empty() {
            return None;
        }
        let target = ring_hash(key);
        let idx = self
            .positions
            .partition_point(|(position, _)| *position < target);
        let (_, node_id) = &self.positions[idx % self.positions.len()];
        Some(node_id)
    }

    /// Distinct nodes in clockwise order starting at the key's owner
    pub fn successors(&self, key: &str) -> Vec<String> {
        if self.positions.is_empty() {
            return Vec::new();
        }
        let target = ring_hash(key);
        let start = self
            .positions
            .partition_point(|(position, _)| *position < target);

        let mut out: Vec<String> = Vec::with_capacity(self.nodes.len());
        for offset in 0..self.positions.len() {
            let (_, node_id) = &self.positions[(start + offset) % self.positions.len()];
            if !out.iter().any(|id| id == node_id) {
                out.push(node_id.clone());
                if out.len() == self.nodes.len() {
                    break;
                }
            }
        }
        out
    }

    /// All nodes on the ring
    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().cloned().collect()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains(node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_node_ring() -> ConsistentHashRing {
        ConsistentHashRing::with_nodes(
            150,
            &[
                "node-1".to_string(),
                "node-2".to_string(),
                "node-3".to_string(),
            ],
        )
    }

    #[test]
    fn test_owner_deterministic() {
        let ring = three_node_ring();
        let a = ring.owner("orders").unwrap().to_string();
        let b = ring.owner("orders").unwrap().to_string();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring = ConsistentHashRing::new(150);
        assert!(ring.owner("anything").is_none());
        assert!(ring.successors("anything").is_empty());
    }

    #[test]
    fn test_all_nodes_receive_keys() {
        let ring = three_node_ring();
        let mut seen = BTreeSet::new();
        for i in 0..1000 {
            seen.insert(ring.owner(&format!("queue-{}", i)).unwrap().to_string());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_successors_distinct_and_start_at_owner() {
        let ring = three_node_ring();
        let succ = ring.successors("orders");
        assert_eq!(succ.len(), 3);
        assert_eq!(succ[0], ring.owner("orders").unwrap());
        let unique: BTreeSet<_> = succ.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn test_remove_node_only_moves_its_keys() {
        let mut ring = three_node_ring();
        let keys: Vec<String> = (0..2000).map(|i| format!("key-{}", i)).collect();
        let before: Vec<String> = keys
            .iter()
            .map(|k| ring.owner(k).unwrap().to_string())
            .collect();

        ring.remove_node("node-2");

        for (key, old_owner) in keys.iter().zip(before.iter()) {
            let new_owner = ring.owner(key).unwrap();
            if old_owner != "node-2" {
                // Keys not owned by the removed node must not move
                assert_eq!(new_owner, old_owner);
            } else {
                assert_ne!(new_owner, "node-2");
            }
        }
    }

    #[test]
    fn test_add_node_idempotent() {
        let mut ring = three_node_ring();
        let positions_before = ring.positions.len();
        ring.add_node("node-1");
        assert_eq!(ring.positions.len(), positions_before);
    }

    #[test]
    fn test_virtual_node_count() {
        let ring = three_node_ring();
        assert_eq!(ring.positions.len(), 3 * 150);
    }
}
