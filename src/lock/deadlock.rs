//! Wait-for-graph deadlock detection
//!
//! Edge `A -> B` means client A is blocked waiting on a lock held by B.
//! Cycle finding is DFS with a recursion-stack set, linear in |V| + |E|.
//! A cycle is broken by aborting its youngest participant (largest
//! `enqueued_at`).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Directed wait-for graph keyed by client id.
///
/// BTreeMap keeps iteration deterministic so every detection pass over the
/// same state picks the same victim.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
    /// When each waiting client enqueued, for victim selection
    enqueued_at: HashMap<String, u64>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `waiter` (enqueued at `enqueued_at_ms`) waits on `holder`
    pub fn add_edge(&mut self, waiter: &str, holder: &str, enqueued_at_ms: u64) {
        self.edges
            .entry(waiter.to_string())
            .or_default()
            .insert(holder.to_string());
        self.enqueued_at
            .entry(waiter.to_string())
            .or_insert(enqueued_at_ms);
    }

    /// Remove a client and every edge pointing at it
    pub fn remove_client(&mut self, client_id: &str) {
        self.edges.remove(client_id);
        self.enqueued_at.remove(client_id);
        for targets in self.edges.values_mut() {
            targets.remove(client_id);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Find one cycle, if any
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited: HashSet<&str> = HashSet::new();

        for start in self.edges.keys() {
            if visited.contains(start.as_str()) {
                continue;
            }
            let mut path: Vec<&str> = Vec::new();
            let mut on_path: HashSet<&str> = HashSet::new();
            if let Some(cycle) = self.dfs(start, &mut visited, &mut path, &mut on_path) {
                return Some(cycle);
            }
        }
        None
    }

    fn dfs<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
        on_path: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        if on_path.contains(node) {
            let pos = path.iter().position(|n| *n == node).unwrap_or(0);
            return Some(path[pos..].iter().map(|n| n.to_string()).collect());
        }
        if visited.contains(node) {
            return None;
        }

        visited.insert(node);
        path.push(node);
        on_path.insert(node);

        if let Some(targets) = self.edges.get(node) {
            for next in targets {
                if let Some(cycle) = self.dfs(next, visited, path, on_path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        on_path.remove(node);
        None
    }

    /// Resolve every cycle, returning the victims in abort order.
    ///
    /// Victim of each cycle is the youngest waiter; one victim may break
    /// several cycles, so detection reruns until the graph is acyclic.
    pub fn select_victims(&mut self) -> Vec<String> {
        let mut victims = Vec::new();
        while let Some(cycle) = self.find_cycle() {
            let victim = cycle
                .iter()
                .max_by_key(|client| self.enqueued_at.get(*client).copied().unwrap_or(0))
                .cloned()
                .unwrap_or_else(|| cycle[0].clone());
            tracing::warn!(
                "deadlock cycle [{}], aborting {}",
                cycle.join(" -> "),
                victim
            );
            self.remove_client(&victim);
            victims.push(victim);
        }
        victims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_edge("c1", "c2", 10);
        graph.add_edge("c2", "c3", 20);
        assert!(graph.find_cycle().is_none());
        assert!(graph.select_victims().is_empty());
    }

    #[test]
    fn test_two_client_cycle_aborts_youngest() {
        let mut graph = WaitForGraph::new();
        graph.add_edge("c1", "c2", 10);
        graph.add_edge("c2", "c1", 20);

        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.len(), 2);

        let victims = graph.select_victims();
        // c2 enqueued later: it is the youngest and dies
        assert_eq!(victims, vec!["c2".to_string()]);
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_three_client_cycle() {
        let mut graph = WaitForGraph::new();
        graph.add_edge("c1", "c2", 10);
        graph.add_edge("c2", "c3", 30);
        graph.add_edge("c3", "c1", 20);

        let victims = graph.select_victims();
        assert_eq!(victims, vec!["c2".to_string()]);
    }

    #[test]
    fn test_self_cycle() {
        // A shared holder requesting an upgrade waits on itself
        let mut graph = WaitForGraph::new();
        graph.add_edge("c1", "c1", 10);
        let victims = graph.select_victims();
        assert_eq!(victims, vec!["c1".to_string()]);
    }

    #[test]
    fn test_shared_client_breaks_multiple_cycles() {
        // Two cycles through c2; aborting c2 clears both
        let mut graph = WaitForGraph::new();
        graph.add_edge("c1", "c2", 10);
        graph.add_edge("c2", "c1", 50);
        graph.add_edge("c2", "c3", 50);
        graph.add_edge("c3", "c2", 20);

        let victims = graph.select_victims();
        assert_eq!(victims, vec!["c2".to_string()]);
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn test_remove_client_drops_incoming_edges() {
        let mut graph = WaitForGraph::new();
        graph.add_edge("c1", "c2", 10);
        graph.add_edge("c3", "c1", 20);
        graph.remove_client("c1");
        assert!(graph.find_cycle().is_none());
        // c3's edge to c1 is gone too
        assert!(graph.edges.get("c3").map(|t| t.is_empty()).unwrap_or(true));
    }
}
