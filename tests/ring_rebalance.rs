//! Consistent-hash rebalance properties

use minicoord::common::ConsistentHashRing;

/// Removing one node from an N-node ring moves at most ~1/N of keys
/// (3x tolerance over 10k keys).
#[test]
fn removing_one_node_moves_about_one_nth_of_keys() {
    const NODES: usize = 5;
    const KEYS: usize = 10_000;

    let ids: Vec<String> = (1..=NODES).map(|i| format!("node-{}", i)).collect();
    let mut ring = ConsistentHashRing::with_nodes(150, &ids);

    let keys: Vec<String> = (0..KEYS).map(|i| format!("key-{}", i)).collect();
    let before: Vec<String> = keys
        .iter()
        .map(|k| ring.owner(k).unwrap().to_string())
        .collect();

    ring.remove_node("node-3");

    let moved = keys
        .iter()
        .zip(before.iter())
        .filter(|(key, old)| ring.owner(key).unwrap() != old.as_str())
        .count();

    let expected = KEYS / NODES;
    assert!(
        moved <= expected * 3,
        "{} keys moved, expected at most {}",
        moved,
        expected * 3
    );
    // And every key owned by the removed node had to move
    let owned_by_removed = before.iter().filter(|o| o.as_str() == "node-3").count();
    assert!(moved >= owned_by_removed);
}

/// Adding a node only steals keys; nobody else's keys move
#[test]
fn adding_a_node_only_moves_keys_to_it() {
    let ids: Vec<String> = (1..=4).map(|i| format!("node-{}", i)).collect();
    let mut ring = ConsistentHashRing::with_nodes(150, &ids);

    let keys: Vec<String> = (0..5_000).map(|i| format!("key-{}", i)).collect();
    let before: Vec<String> = keys
        .iter()
        .map(|k| ring.owner(k).unwrap().to_string())
        .collect();

    ring.add_node("node-5");

    for (key, old) in keys.iter().zip(before.iter()) {
        let new = ring.owner(key).unwrap();
        if new != old.as_str() {
            assert_eq!(new, "node-5", "key {} moved to {} instead", key, new);
        }
    }
}

/// Distribution is roughly even with 150 virtual nodes
#[test]
fn virtual_nodes_spread_load() {
    let ids: Vec<String> = (1..=3).map(|i| format!("node-{}", i)).collect();
    let ring = ConsistentHashRing::with_nodes(150, &ids);

    let mut counts = std::collections::HashMap::new();
    for i in 0..9_000 {
        let owner = ring.owner(&format!("key-{}", i)).unwrap().to_string();
        *counts.entry(owner).or_insert(0usize) += 1;
    }

    for (node, count) in &counts {
        // Each node should own somewhere near a third; allow a wide band
        assert!(
            *count > 1_500 && *count < 4_500,
            "{} owns {} of 9000 keys",
            node,
            count
        );
    }
}
