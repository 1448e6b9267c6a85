//! Knowledge graph assembly for the visualizer.
//!
//! Nodes and links are loaded from the store on every request and run
//! through the algorithms in `graph`. Neighbourhood expansion is a small
//! Datalog program evaluated with `ascent`.

use crate::error::{AppError, AppResult};
use crate::graph::{self, cluster_index, compute_clusters, compute_stats, find_shortest_path};
use crate::models::{
    Cluster, GraphEdge, GraphNode, GraphQuery, GraphStats, KnowledgeGraph, Link, Note,
    UNLIMITED_DEPTH,
};
use crate::store::GraphStore;
use ascent::ascent_run;
use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};

/// Depth used by `neighborhood` when the caller gives none.
pub const DEFAULT_NEIGHBORHOOD_DEPTH: usize = 2;
/// Upper bound on neighbourhood depth.
pub const MAX_NEIGHBORHOOD_DEPTH: usize = 10;
const MAX_RECENT_DAYS: i64 = 36_500;

// ============================================================================
// Ascent Queries
// ============================================================================

/// Nodes within `depth` hops of `start`, following links in either
/// direction. `start` itself is always part of the result. Depth is clamped
/// to `UNLIMITED_DEPTH`.
pub fn find_reachable(edges: &[(String, String)], start: &str, depth: usize) -> HashSet<String> {
    let mut pairs = Vec::with_capacity(edges.len() * 2);
    for (src, tgt) in edges {
        pairs.push((src.clone(), tgt.clone()));
        pairs.push((tgt.clone(), src.clone()));
    }

    let start = start.to_string();
    let max_d = depth.min(UNLIMITED_DEPTH) as u32;

    let result = ascent_run! {
        relation edge(String, String) = pairs;
        relation reachable(String, u32);

        reachable(start.clone(), 0);

        reachable(y.clone(), d + 1) <--
            reachable(x, d),
            edge(x, y),
            if *d < max_d;
    };

    result.reachable.into_iter().map(|(node, _)| node).collect()
}

// ============================================================================
// Loading
// ============================================================================

struct Snapshot {
    notes: Vec<Note>,
    links: Vec<Link>,
}

impl Snapshot {
    fn load(store: &GraphStore) -> AppResult<Self> {
        let notes = store.list_notes()?;
        let known: HashSet<&str> = notes.iter().map(|n| n.id.as_str()).collect();
        let links = store
            .all_links()?
            .into_iter()
            .filter(|l| known.contains(l.source.as_str()) && known.contains(l.target.as_str()))
            .collect();
        Ok(Snapshot { notes, links })
    }

    fn pairs(&self) -> Vec<(String, String)> {
        self.links
            .iter()
            .map(|l| (l.source.clone(), l.target.clone()))
            .collect()
    }

    fn ids(&self) -> Vec<String> {
        self.notes.iter().map(|n| n.id.clone()).collect()
    }

    fn clusters(&self, pairs: &[(String, String)]) -> Vec<Cluster> {
        let tags: HashMap<String, Vec<String>> = self
            .notes
            .iter()
            .map(|n| (n.id.clone(), n.tags.clone()))
            .collect();
        compute_clusters(&self.ids(), pairs, &tags)
    }
}

// ============================================================================
// Graph Building
// ============================================================================

pub fn build_knowledge_graph(store: &GraphStore, query: &GraphQuery) -> AppResult<KnowledgeGraph> {
    let snap = Snapshot::load(store)?;
    let pairs = snap.pairs();
    let degrees = graph::degrees(&pairs);
    let clusters = snap.clusters(&pairs);
    let cluster_of = cluster_index(&clusters);

    let reachable: Option<HashSet<String>> = query
        .center
        .as_deref()
        .map(|c| find_reachable(&pairs, c, query.depth));

    let path = match (&query.path_start, &query.path_end) {
        (Some(a), Some(b)) => find_shortest_path(&pairs, a, b),
        _ => Vec::new(),
    };
    let path_nodes: HashSet<&str> = path.iter().map(String::as_str).collect();

    // Notes touching at least one link of the requested type
    let typed_nodes: Option<HashSet<&str>> = query.link_filter.map(|t| {
        snap.links
            .iter()
            .filter(|l| l.link_type == t)
            .flat_map(|l| [l.source.as_str(), l.target.as_str()])
            .collect()
    });

    let cutoff = query
        .recent_days
        .map(|d| Utc::now() - Duration::days(d.clamp(0, MAX_RECENT_DAYS)));

    let mut nodes = Vec::new();
    for note in &snap.notes {
        let (in_degree, out_degree) = degrees.get(&note.id).copied().unwrap_or((0, 0));
        let total = in_degree + out_degree;
        let cluster = cluster_of.get(&note.id).copied().unwrap_or(0);

        let include = path_nodes.contains(note.id.as_str()) || {
            reachable.as_ref().map_or(true, |r| r.contains(&note.id))
                && query
                    .tag_filter
                    .as_ref()
                    .map_or(true, |t| note.tags.iter().any(|nt| nt == t))
                && typed_nodes
                    .as_ref()
                    .map_or(true, |s| s.contains(note.id.as_str()))
                && query.min_links.map_or(true, |n| total > n)
                && query.max_links.map_or(true, |n| total < n)
                && (!query.orphans_only || total == 0)
                && (!query.hubs_only || total >= graph::HUB_THRESHOLD)
                && cutoff.map_or(true, |c| note.updated >= c)
                && query.cluster.map_or(true, |c| cluster == c)
        };
        if !include {
            continue;
        }

        nodes.push(GraphNode {
            id: note.id.clone(),
            title: note.title.clone(),
            tags: note.tags.clone(),
            in_degree,
            out_degree,
            cluster,
            updated: note.updated,
        });
    }
    nodes.sort_by(|a, b| a.id.cmp(&b.id));

    let included: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    let mut edges: Vec<GraphEdge> = snap
        .links
        .iter()
        .filter(|l| included.contains(l.source.as_str()) && included.contains(l.target.as_str()))
        .filter(|l| query.link_filter.map_or(true, |t| l.link_type == t))
        .map(|l| GraphEdge {
            source: l.source.clone(),
            target: l.target.clone(),
            link_type: l.link_type,
            annotation: l.annotation.clone(),
        })
        .collect();
    edges.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));

    let visible_clusters: Vec<Cluster> = clusters
        .into_iter()
        .filter_map(|mut c| {
            c.members.retain(|m| included.contains(m.as_str()));
            c.size = c.members.len();
            (c.size > 0).then_some(c)
        })
        .collect();

    let node_degrees: Vec<(String, usize)> = nodes
        .iter()
        .map(|n| (n.id.clone(), n.in_degree + n.out_degree))
        .collect();
    let stats = compute_stats(&node_degrees, edges.len(), visible_clusters.len());

    tracing::debug!(
        query = %query.describe(),
        nodes = nodes.len(),
        edges = edges.len(),
        "knowledge graph built"
    );

    Ok(KnowledgeGraph {
        nodes,
        edges,
        stats,
        clusters: visible_clusters,
        path,
    })
}

/// Statistics over every note and link.
pub fn graph_stats(store: &GraphStore) -> AppResult<GraphStats> {
    let snap = Snapshot::load(store)?;
    let pairs = snap.pairs();
    let degrees = graph::degrees(&pairs);
    let node_degrees: Vec<(String, usize)> = snap
        .notes
        .iter()
        .map(|n| {
            let (i, o) = degrees.get(&n.id).copied().unwrap_or((0, 0));
            (n.id.clone(), i + o)
        })
        .collect();
    let cluster_count = snap.clusters(&pairs).len();
    Ok(compute_stats(&node_degrees, pairs.len(), cluster_count))
}

pub fn clusters(store: &GraphStore) -> AppResult<Vec<Cluster>> {
    let snap = Snapshot::load(store)?;
    Ok(snap.clusters(&snap.pairs()))
}

/// Graph centred on one note, `depth` hops out in either direction.
pub fn neighborhood(
    store: &GraphStore,
    id: &str,
    depth: Option<usize>,
) -> AppResult<KnowledgeGraph> {
    if !store.note_exists(id)? {
        return Err(AppError::NotFound(format!("note {} not found", id)));
    }
    let query = GraphQuery {
        center: Some(id.to_string()),
        depth: depth
            .unwrap_or(DEFAULT_NEIGHBORHOOD_DEPTH)
            .min(MAX_NEIGHBORHOOD_DEPTH),
        ..Default::default()
    };
    build_knowledge_graph(store, &query)
}
