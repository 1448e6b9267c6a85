//! pkm library - the knowledge base service behind the HTTP server.
//!
//! Modules are public so the integration tests can drive the router and the
//! services directly.

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::{Arc, Mutex};
use tower_http::trace::TraceLayer;

pub mod auth;
pub mod config;
pub mod error;
pub mod graph;
pub mod graph_query;
pub mod handlers;
pub mod links;
pub mod models;
pub mod notes;
pub mod store;
pub mod tags;

use auth::{AuthKeys, LoginRateLimit};
use config::Config;
use error::AppResult;
use store::GraphStore;

// ============================================================================
// Application State
// ============================================================================

pub struct AppState {
    pub store: GraphStore,
    pub config: Config,
    pub keys: AuthKeys,
    pub login_rate_limit: Arc<Mutex<LoginRateLimit>>,
}

impl AppState {
    /// Open the database under `config.data_dir` and drop refresh tokens
    /// left over from previous runs.
    pub fn open(config: Config) -> AppResult<Self> {
        let store = GraphStore::open(&config.data_dir)?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: Config, store: GraphStore) -> AppResult<Self> {
        auth::purge_expired(&store)?;
        Ok(Self {
            keys: AuthKeys::from_config(&config),
            store,
            config,
            login_rate_limit: Arc::new(Mutex::new(LoginRateLimit::new())),
        })
    }
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        // Auth routes
        .route("/api/auth/register", post(handlers::register))
        .route("/api/auth/login", post(handlers::login))
        .route("/api/auth/refresh", post(handlers::refresh))
        .route("/api/auth/logout", post(handlers::logout))
        .route("/api/auth/me", get(handlers::me))
        // Note routes
        .route(
            "/api/notes",
            get(handlers::list_notes).post(handlers::create_note),
        )
        .route("/api/notes/search", get(handlers::search))
        .route(
            "/api/notes/{id}",
            get(handlers::get_note)
                .put(handlers::update_note)
                .delete(handlers::delete_note),
        )
        .route("/api/notes/{id}/render", get(handlers::render_note))
        .route("/api/notes/{id}/links", get(handlers::note_links))
        .route("/api/notes/{id}/backlinks", get(handlers::note_backlinks))
        .route("/api/notes/{id}/tags", put(handlers::set_note_tags))
        .route(
            "/api/notes/{id}/tags/{tag}",
            post(handlers::add_note_tag).delete(handlers::remove_note_tag),
        )
        // Tag routes
        .route(
            "/api/tags",
            get(handlers::list_tags).post(handlers::create_tag),
        )
        .route(
            "/api/tags/{name}",
            put(handlers::rename_tag).delete(handlers::delete_tag),
        )
        .route("/api/tags/{name}/notes", get(handlers::tag_notes))
        // Link routes
        .route("/api/links", post(handlers::create_link))
        .route(
            "/api/links/{source}/{target}",
            put(handlers::update_link).delete(handlers::delete_link),
        )
        // Graph routes
        .route("/api/graph", get(handlers::graph))
        .route("/api/graph/stats", get(handlers::graph_stats))
        .route("/api/graph/clusters", get(handlers::graph_clusters))
        .route(
            "/api/graph/neighborhood/{id}",
            get(handlers::neighborhood),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// Re-export commonly used types
pub use error::{AppError, StoreError};
pub use graph::{compute_clusters, find_shortest_path};
pub use graph_query::{build_knowledge_graph, find_reachable, neighborhood};
pub use models::{
    GraphQuery, KnowledgeGraph, Link, LinkType, Note, NoteSummary, Tag, TokenPair,
};
