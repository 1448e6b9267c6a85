//! Graph algorithms over the link set.
//!
//! Everything here works on plain `(source, target)` pairs so it can be
//! exercised without a store. Reachability and path finding treat links as
//! undirected: a backlink connects two notes just as well as a forward link.

use crate::models::{Cluster, GraphStats};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Degree at which a note counts as a hub.
pub const HUB_THRESHOLD: usize = 5;

/// Number of entries reported in `GraphStats::most_connected`.
pub const MOST_CONNECTED: usize = 5;

// ============================================================================
// Adjacency
// ============================================================================

/// Adjacency list in both directions with neighbors sorted, so traversals are
/// deterministic.
pub fn undirected_adjacency(edges: &[(String, String)]) -> HashMap<String, Vec<String>> {
    let mut adj: HashMap<String, Vec<String>> = HashMap::new();
    for (src, tgt) in edges {
        adj.entry(src.clone()).or_default().push(tgt.clone());
        adj.entry(tgt.clone()).or_default().push(src.clone());
    }
    for neighbors in adj.values_mut() {
        neighbors.sort();
        neighbors.dedup();
    }
    adj
}

/// (in_degree, out_degree) per node id.
pub fn degrees(edges: &[(String, String)]) -> HashMap<String, (usize, usize)> {
    let mut out: HashMap<String, (usize, usize)> = HashMap::new();
    for (src, tgt) in edges {
        out.entry(src.clone()).or_default().1 += 1;
        out.entry(tgt.clone()).or_default().0 += 1;
    }
    out
}

// ============================================================================
// Shortest Path
// ============================================================================

/// Breadth-first shortest path from `start` to `end`, both ends included.
/// Returns an empty vector when the two are not connected.
pub fn find_shortest_path(edges: &[(String, String)], start: &str, end: &str) -> Vec<String> {
    let adj = undirected_adjacency(edges);
    if start == end {
        return if adj.contains_key(start) {
            vec![start.to_string()]
        } else {
            Vec::new()
        };
    }

    let mut visited = HashSet::new();
    let mut parent: HashMap<String, String> = HashMap::new();
    let mut queue = VecDeque::new();
    queue.push_back(start.to_string());
    visited.insert(start.to_string());

    while let Some(node) = queue.pop_front() {
        if node == end {
            // Reconstruct path
            let mut path = vec![end.to_string()];
            let mut current = end.to_string();
            while let Some(p) = parent.get(&current) {
                path.push(p.clone());
                current = p.clone();
            }
            path.reverse();
            return path;
        }

        if let Some(neighbors) = adj.get(&node) {
            for neighbor in neighbors {
                if visited.insert(neighbor.clone()) {
                    parent.insert(neighbor.clone(), node.clone());
                    queue.push_back(neighbor.clone());
                }
            }
        }
    }

    Vec::new() // No path found
}

// ============================================================================
// Clustering
// ============================================================================

/// Connected components of the undirected graph over `ids`.
///
/// Clusters are ordered by size (largest first), ties broken by their
/// smallest member id; a cluster's `id` is its position in that order. The
/// label is the tag carried by most members, alphabetical on ties.
pub fn compute_clusters(
    ids: &[String],
    edges: &[(String, String)],
    tags: &HashMap<String, Vec<String>>,
) -> Vec<Cluster> {
    let adj = undirected_adjacency(edges);
    let mut sorted_ids: Vec<&String> = ids.iter().collect();
    sorted_ids.sort();

    let mut seen: HashSet<&str> = HashSet::new();
    let mut components: Vec<Vec<String>> = Vec::new();

    for id in sorted_ids {
        if !seen.insert(id.as_str()) {
            continue;
        }
        let mut members = vec![id.clone()];
        let mut queue = VecDeque::from([id.as_str()]);
        while let Some(node) = queue.pop_front() {
            for neighbor in adj.get(node).into_iter().flatten() {
                if ids_contains(ids, neighbor) && seen.insert(neighbor.as_str()) {
                    members.push(neighbor.clone());
                    queue.push_back(neighbor.as_str());
                }
            }
        }
        members.sort();
        components.push(members);
    }

    components.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a[0].cmp(&b[0])));

    components
        .into_iter()
        .enumerate()
        .map(|(i, members)| Cluster {
            id: i,
            size: members.len(),
            label: dominant_tag(&members, tags),
            members,
        })
        .collect()
}

fn ids_contains(ids: &[String], id: &str) -> bool {
    ids.iter().any(|i| i == id)
}

fn dominant_tag(members: &[String], tags: &HashMap<String, Vec<String>>) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for m in members {
        for t in tags.get(m).into_iter().flatten() {
            *counts.entry(t.as_str()).or_insert(0) += 1;
        }
    }
    // BTreeMap iterates alphabetically; keep the first maximum.
    let mut best: Option<(&str, usize)> = None;
    for (tag, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((tag, count));
        }
    }
    best.map(|(t, _)| t.to_string())
}

/// Map of node id → cluster id.
pub fn cluster_index(clusters: &[Cluster]) -> HashMap<String, usize> {
    clusters
        .iter()
        .flat_map(|c| c.members.iter().map(move |m| (m.clone(), c.id)))
        .collect()
}

// ============================================================================
// Statistics
// ============================================================================

/// Summary statistics for a set of nodes given as `(id, total_degree)`.
pub fn compute_stats(
    node_degrees: &[(String, usize)],
    total_edges: usize,
    cluster_count: usize,
) -> GraphStats {
    let total_nodes = node_degrees.len();
    let orphan_count = node_degrees.iter().filter(|(_, d)| *d == 0).count();
    let hub_count = node_degrees
        .iter()
        .filter(|(_, d)| *d >= HUB_THRESHOLD)
        .count();
    let total_degree: usize = node_degrees.iter().map(|(_, d)| d).sum();
    let avg_degree = if total_nodes > 0 {
        total_degree as f64 / total_nodes as f64
    } else {
        0.0
    };
    let max_degree = node_degrees.iter().map(|(_, d)| *d).max().unwrap_or(0);
    let density = if total_nodes > 1 {
        total_edges as f64 / (total_nodes * (total_nodes - 1)) as f64
    } else {
        0.0
    };

    let mut ranked: Vec<(String, usize)> = node_degrees
        .iter()
        .filter(|(_, d)| *d > 0)
        .cloned()
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(MOST_CONNECTED);

    GraphStats {
        total_nodes,
        total_edges,
        orphan_count,
        hub_threshold: HUB_THRESHOLD,
        hub_count,
        avg_degree,
        max_degree,
        density,
        cluster_count,
        most_connected: ranked,
    }
}
