//! Data models for the knowledge base.
//!
//! This module contains the core data structures used throughout the application:
//! notes, tags, typed links, the single user account, and the graph view
//! served to the visualizer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Core Note Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Note {
    pub id: String,
    pub title: String,
    /// Sanitized HTML for rich-text notes, Markdown source otherwise.
    pub content: String,
    pub content_format: ContentFormat,
    /// Text extracted from `content`, used for search and excerpts.
    pub plain_text: String,
    /// Normalized tag names, sorted.
    pub tags: Vec<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContentFormat {
    #[default]
    Html,
    Markdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoteSummary {
    pub id: String,
    pub title: String,
    pub excerpt: String,
    pub tags: Vec<String>,
    pub updated: DateTime<Utc>,
    pub link_count: usize,
    pub backlink_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteDetail {
    pub note: Note,
    pub outgoing: Vec<LinkView>,
    pub backlinks: Vec<LinkView>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewNote {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub format: ContentFormat,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NoteUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub format: Option<ContentFormat>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NoteSort {
    #[default]
    Updated,
    Created,
    Title,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListParams {
    pub tag: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    #[serde(default)]
    pub sort: NoteSort,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub note: NoteSummary,
    pub matches: Vec<SearchMatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub field: String, // "title", "tag", "content"
    pub snippet: String,
}

// ============================================================================
// Tags
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag {
    pub name: String,
    pub color: Option<String>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TagCount {
    pub name: String,
    pub color: Option<String>,
    pub note_count: usize,
}

// ============================================================================
// Links
// ============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    #[default]
    Related,
    Reference,
    Supports,
    Contradicts,
    Extends,
    Example,
    Parent,
}

impl LinkType {
    pub const ALL: [LinkType; 7] = [
        LinkType::Related,
        LinkType::Reference,
        LinkType::Supports,
        LinkType::Contradicts,
        LinkType::Extends,
        LinkType::Example,
        LinkType::Parent,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LinkType::Related => "related",
            LinkType::Reference => "reference",
            LinkType::Supports => "supports",
            LinkType::Contradicts => "contradicts",
            LinkType::Extends => "extends",
            LinkType::Example => "example",
            LinkType::Parent => "parent",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let lower = value.trim().to_ascii_lowercase();
        LinkType::ALL
            .into_iter()
            .find(|t| t.as_str() == lower)
            .ok_or_else(|| format!("unknown link type: {value}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Link {
    pub source: String,
    pub target: String,
    pub link_type: LinkType,
    pub annotation: Option<String>,
    pub created: DateTime<Utc>,
}

/// The far end of a link as seen from one note.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkView {
    pub note_id: String,
    pub title: String,
    pub link_type: LinkType,
    pub annotation: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewLink {
    pub source: String,
    pub target: String,
    pub link_type: Option<LinkType>,
    pub annotation: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinkUpdate {
    pub link_type: Option<LinkType>,
    /// `Some("")` clears the annotation.
    pub annotation: Option<String>,
}

// ============================================================================
// Accounts
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefreshRecord {
    pub username: String,
    /// Shared by every token produced by rotating one login.
    pub family: String,
    pub expires: DateTime<Utc>,
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_token: String,
    pub refresh_expires_in: i64,
}

// ============================================================================
// Knowledge Graph Data Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub title: String,
    pub tags: Vec<String>,
    pub in_degree: usize,  // Backlinks
    pub out_degree: usize, // Outgoing links
    pub cluster: usize,
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub link_type: LinkType,
    pub annotation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStats {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub orphan_count: usize,  // Nodes with no connections
    pub hub_threshold: usize, // Degree considered "hub"
    pub hub_count: usize,
    pub avg_degree: f64,
    pub max_degree: usize,
    pub density: f64,
    pub cluster_count: usize,
    pub most_connected: Vec<(String, usize)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: usize,
    pub size: usize,
    pub members: Vec<String>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub stats: GraphStats,
    pub clusters: Vec<Cluster>,
    /// Node ids on the requested shortest path, start first.
    pub path: Vec<String>,
}

// ============================================================================
// Graph Query Language
// ============================================================================
//
// Query syntax (composable, space-separated):
//   from:ID         - Center view on note ID, show its neighborhood
//   depth:N         - Expand N hops from center (default 2, at most 99)
//   tag:NAME        - Only notes carrying tag NAME
//   link:TYPE       - Only edges of link type TYPE
//   links:>N        - Only nodes with more than N connections
//   links:<N        - Only nodes with fewer than N connections
//   orphans         - Show only disconnected nodes
//   hubs            - Show only highly connected nodes (>=5 links)
//   path:A->B       - Highlight shortest path between A and B
//   recent:N        - Only notes modified in last N days
//   cluster:N       - Only members of cluster N

/// Depth of an unfocused query. Larger `depth:N` values are clamped to it.
pub const UNLIMITED_DEPTH: usize = 99;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphQuery {
    pub center: Option<String>,
    pub depth: usize,
    pub tag_filter: Option<String>,
    pub link_filter: Option<LinkType>,
    pub min_links: Option<usize>,
    pub max_links: Option<usize>,
    pub orphans_only: bool,
    pub hubs_only: bool,
    pub path_start: Option<String>,
    pub path_end: Option<String>,
    pub recent_days: Option<i64>,
    pub cluster: Option<usize>,
}

impl GraphQuery {
    pub fn parse(query: &str) -> Self {
        let mut gq = GraphQuery {
            depth: UNLIMITED_DEPTH,
            ..Default::default()
        };
        let mut explicit_depth = false;

        for part in query.split_whitespace() {
            if let Some(id) = part.strip_prefix("from:") {
                gq.center = Some(id.to_string());
                if !explicit_depth {
                    gq.depth = 2;
                } // Default depth when centered
            } else if let Some(d) = part.strip_prefix("depth:") {
                gq.depth = d
                    .parse::<usize>()
                    .map_or(2, |n| n.min(UNLIMITED_DEPTH));
                explicit_depth = true;
            } else if let Some(t) = part.strip_prefix("tag:") {
                gq.tag_filter = Some(t.trim_start_matches('#').to_lowercase());
            } else if let Some(t) = part.strip_prefix("link:") {
                gq.link_filter = t.parse().ok();
            } else if let Some(l) = part.strip_prefix("links:>") {
                gq.min_links = l.parse().ok();
            } else if let Some(l) = part.strip_prefix("links:<") {
                gq.max_links = l.parse().ok();
            } else if part == "orphans" {
                gq.orphans_only = true;
            } else if part == "hubs" {
                gq.hubs_only = true;
            } else if let Some(path) = part.strip_prefix("path:") {
                if let Some((a, b)) = path.split_once("->") {
                    gq.path_start = Some(a.to_string());
                    gq.path_end = Some(b.to_string());
                }
            } else if let Some(days) = part.strip_prefix("recent:") {
                gq.recent_days = days.parse().ok();
            } else if let Some(c) = part.strip_prefix("cluster:") {
                gq.cluster = c.parse().ok();
            }
        }

        gq
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();

        if let Some(ref c) = self.center {
            parts.push(format!("centered on {}", c));
        }
        if self.depth < UNLIMITED_DEPTH {
            parts.push(format!("{} hops", self.depth));
        }
        if let Some(ref t) = self.tag_filter {
            parts.push(format!("tag={}", t));
        }
        if let Some(t) = self.link_filter {
            parts.push(format!("link={}", t));
        }
        if let Some(n) = self.min_links {
            parts.push(format!("links>{}", n));
        }
        if let Some(n) = self.max_links {
            parts.push(format!("links<{}", n));
        }
        if self.orphans_only {
            parts.push("orphans only".to_string());
        }
        if self.hubs_only {
            parts.push("hubs only".to_string());
        }
        if let (Some(a), Some(b)) = (&self.path_start, &self.path_end) {
            parts.push(format!("path {}->{}", a, b));
        }
        if let Some(days) = self.recent_days {
            parts.push(format!("last {} days", days));
        }
        if let Some(c) = self.cluster {
            parts.push(format!("cluster {}", c));
        }

        if parts.is_empty() {
            "Full graph".to_string()
        } else {
            parts.join(", ")
        }
    }
}
