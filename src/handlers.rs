//! HTTP route handlers.
//!
//! Every handler is a thin JSON shell around a service function; errors are
//! `AppError`s rendered by its `IntoResponse` impl.

use crate::auth::{self, AuthUser, REFRESH_COOKIE};
use crate::error::{AppError, AppResult};
use crate::models::{
    Cluster, GraphQuery, GraphStats, KnowledgeGraph, Link, LinkUpdate, LinkView, ListParams,
    NewLink, NewNote, Note, NoteDetail, NoteSummary, NoteUpdate, SearchResult, Tag, TagCount,
    TokenPair,
};
use crate::{graph_query, links, notes, tags, AppState};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use axum_extra::extract::CookieJar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

type SharedState = State<Arc<AppState>>;

/// Run blocking work (password hashing, graph assembly) off the async runtime.
async fn blocking<T, F>(f: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("blocking task failed: {}", e)))?
}

// ============================================================================
// Health
// ============================================================================

pub async fn health(State(state): SharedState) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "notes": state.store.note_count(),
        "links": state.store.link_count(),
        "accounts": state.store.user_count(),
    }))
}

// ============================================================================
// Auth Handlers
// ============================================================================

#[derive(Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize, Default)]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Serialize)]
pub struct AccountView {
    pub username: String,
    pub created: DateTime<Utc>,
}

pub async fn register(
    State(state): SharedState,
    Json(creds): Json<Credentials>,
) -> AppResult<(StatusCode, Json<AccountView>)> {
    let store = state.store.clone();
    let user =
        blocking(move || auth::register(&store, &creds.username, &creds.password)).await?;
    Ok((
        StatusCode::CREATED,
        Json(AccountView {
            username: user.username,
            created: user.created,
        }),
    ))
}

pub async fn login(
    State(state): SharedState,
    jar: CookieJar,
    Json(creds): Json<Credentials>,
) -> AppResult<(CookieJar, Json<TokenPair>)> {
    let st = state.clone();
    let pair = blocking(move || {
        auth::login(
            &st.store,
            &st.keys,
            &st.login_rate_limit,
            &creds.username,
            &creds.password,
        )
    })
    .await?;
    let jar = jar.add(auth::refresh_cookie(
        pair.refresh_token.clone(),
        state.config.cookie_secure,
    ));
    Ok((jar, Json(pair)))
}

/// Refresh token from the JSON body, falling back to the cookie.
fn presented_refresh_token(jar: &CookieJar, body: &Bytes) -> AppResult<Option<String>> {
    let from_body = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        serde_json::from_slice::<RefreshRequest>(body)
            .map_err(|e| AppError::BadRequest(format!("invalid request body: {}", e)))?
            .refresh_token
            .filter(|t| !t.is_empty())
    };
    Ok(from_body.or_else(|| jar.get(REFRESH_COOKIE).map(|c| c.value().to_string())))
}

pub async fn refresh(
    State(state): SharedState,
    jar: CookieJar,
    body: Bytes,
) -> AppResult<(CookieJar, Json<TokenPair>)> {
    let token = presented_refresh_token(&jar, &body)?
        .ok_or_else(|| AppError::Unauthorized("missing refresh token".into()))?;
    let pair = auth::refresh(&state.store, &state.keys, &token)?;
    let jar = jar.add(auth::refresh_cookie(
        pair.refresh_token.clone(),
        state.config.cookie_secure,
    ));
    Ok((jar, Json(pair)))
}

pub async fn logout(
    State(state): SharedState,
    jar: CookieJar,
    body: Bytes,
) -> AppResult<(CookieJar, StatusCode)> {
    if let Some(token) = presented_refresh_token(&jar, &body)? {
        auth::logout(&state.store, &token)?;
    }
    Ok((jar.remove(auth::clear_refresh_cookie()), StatusCode::NO_CONTENT))
}

pub async fn me(user: AuthUser) -> Json<Value> {
    Json(json!({ "username": user.username }))
}

// ============================================================================
// Note Handlers
// ============================================================================

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct TagList {
    pub tags: Vec<String>,
}

#[derive(Serialize)]
pub struct RenderedNote {
    pub id: String,
    pub title: String,
    pub html: String,
}

pub async fn list_notes(
    _user: AuthUser,
    State(state): SharedState,
    Query(params): Query<ListParams>,
) -> AppResult<Json<Vec<NoteSummary>>> {
    Ok(Json(notes::list_notes(&state.store, &params)?))
}

pub async fn create_note(
    _user: AuthUser,
    State(state): SharedState,
    Json(req): Json<NewNote>,
) -> AppResult<(StatusCode, Json<Note>)> {
    let note = notes::create_note(&state.store, req)?;
    Ok((StatusCode::CREATED, Json(note)))
}

pub async fn search(
    _user: AuthUser,
    State(state): SharedState,
    Query(params): Query<SearchParams>,
) -> AppResult<Json<Vec<SearchResult>>> {
    let store = state.store.clone();
    let results =
        blocking(move || notes::search_notes(&store, &params.q, params.limit)).await?;
    Ok(Json(results))
}

pub async fn get_note(
    _user: AuthUser,
    State(state): SharedState,
    Path(id): Path<String>,
) -> AppResult<Json<NoteDetail>> {
    Ok(Json(notes::note_detail(&state.store, &id)?))
}

pub async fn update_note(
    _user: AuthUser,
    State(state): SharedState,
    Path(id): Path<String>,
    Json(update): Json<NoteUpdate>,
) -> AppResult<Json<Note>> {
    Ok(Json(notes::update_note(&state.store, &id, update)?))
}

pub async fn delete_note(
    _user: AuthUser,
    State(state): SharedState,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    notes::delete_note(&state.store, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn render_note(
    _user: AuthUser,
    State(state): SharedState,
    Path(id): Path<String>,
) -> AppResult<Json<RenderedNote>> {
    let note = notes::get_note(&state.store, &id)?;
    Ok(Json(RenderedNote {
        html: notes::render_note(&note),
        id: note.id,
        title: note.title,
    }))
}

pub async fn note_links(
    _user: AuthUser,
    State(state): SharedState,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<LinkView>>> {
    Ok(Json(links::outgoing_links(&state.store, &id)?))
}

pub async fn note_backlinks(
    _user: AuthUser,
    State(state): SharedState,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<LinkView>>> {
    Ok(Json(links::backlinks(&state.store, &id)?))
}

pub async fn set_note_tags(
    _user: AuthUser,
    State(state): SharedState,
    Path(id): Path<String>,
    Json(body): Json<TagList>,
) -> AppResult<Json<Note>> {
    Ok(Json(tags::set_note_tags(&state.store, &id, &body.tags)?))
}

pub async fn add_note_tag(
    _user: AuthUser,
    State(state): SharedState,
    Path((id, tag)): Path<(String, String)>,
) -> AppResult<Json<Note>> {
    Ok(Json(tags::add_tag_to_note(&state.store, &id, &tag)?))
}

pub async fn remove_note_tag(
    _user: AuthUser,
    State(state): SharedState,
    Path((id, tag)): Path<(String, String)>,
) -> AppResult<Json<Note>> {
    Ok(Json(tags::remove_tag_from_note(&state.store, &id, &tag)?))
}

// ============================================================================
// Tag Handlers
// ============================================================================

#[derive(Deserialize)]
pub struct NewTag {
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Deserialize)]
pub struct RenameTag {
    pub name: String,
}

pub async fn list_tags(
    _user: AuthUser,
    State(state): SharedState,
) -> AppResult<Json<Vec<TagCount>>> {
    Ok(Json(tags::list_tags(&state.store)?))
}

pub async fn create_tag(
    _user: AuthUser,
    State(state): SharedState,
    Json(req): Json<NewTag>,
) -> AppResult<(StatusCode, Json<Tag>)> {
    let tag = tags::create_tag(&state.store, &req.name, req.color)?;
    Ok((StatusCode::CREATED, Json(tag)))
}

pub async fn rename_tag(
    _user: AuthUser,
    State(state): SharedState,
    Path(name): Path<String>,
    Json(req): Json<RenameTag>,
) -> AppResult<Json<Tag>> {
    Ok(Json(tags::rename_tag(&state.store, &name, &req.name)?))
}

pub async fn delete_tag(
    _user: AuthUser,
    State(state): SharedState,
    Path(name): Path<String>,
) -> AppResult<StatusCode> {
    tags::delete_tag(&state.store, &name)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn tag_notes(
    _user: AuthUser,
    State(state): SharedState,
    Path(name): Path<String>,
) -> AppResult<Json<Vec<NoteSummary>>> {
    Ok(Json(tags::notes_with_tag(&state.store, &name)?))
}

// ============================================================================
// Link Handlers
// ============================================================================

pub async fn create_link(
    _user: AuthUser,
    State(state): SharedState,
    Json(req): Json<NewLink>,
) -> AppResult<(StatusCode, Json<Link>)> {
    let link = links::create_link(&state.store, req)?;
    Ok((StatusCode::CREATED, Json(link)))
}

pub async fn update_link(
    _user: AuthUser,
    State(state): SharedState,
    Path((source, target)): Path<(String, String)>,
    Json(update): Json<LinkUpdate>,
) -> AppResult<Json<Link>> {
    Ok(Json(links::update_link(&state.store, &source, &target, update)?))
}

pub async fn delete_link(
    _user: AuthUser,
    State(state): SharedState,
    Path((source, target)): Path<(String, String)>,
) -> AppResult<StatusCode> {
    links::delete_link(&state.store, &source, &target)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Graph Handlers
// ============================================================================

#[derive(Deserialize)]
pub struct GraphQueryParams {
    pub q: Option<String>,
}

#[derive(Deserialize)]
pub struct DepthParams {
    pub depth: Option<usize>,
}

pub async fn graph(
    _user: AuthUser,
    State(state): SharedState,
    Query(params): Query<GraphQueryParams>,
) -> AppResult<Json<KnowledgeGraph>> {
    let query = GraphQuery::parse(params.q.as_deref().unwrap_or(""));
    let store = state.store.clone();
    let graph = blocking(move || graph_query::build_knowledge_graph(&store, &query)).await?;
    Ok(Json(graph))
}

pub async fn graph_stats(
    _user: AuthUser,
    State(state): SharedState,
) -> AppResult<Json<GraphStats>> {
    let store = state.store.clone();
    Ok(Json(blocking(move || graph_query::graph_stats(&store)).await?))
}

pub async fn graph_clusters(
    _user: AuthUser,
    State(state): SharedState,
) -> AppResult<Json<Vec<Cluster>>> {
    let store = state.store.clone();
    Ok(Json(blocking(move || graph_query::clusters(&store)).await?))
}

pub async fn neighborhood(
    _user: AuthUser,
    State(state): SharedState,
    Path(id): Path<String>,
    Query(params): Query<DepthParams>,
) -> AppResult<Json<KnowledgeGraph>> {
    let store = state.store.clone();
    let graph =
        blocking(move || graph_query::neighborhood(&store, &id, params.depth)).await?;
    Ok(Json(graph))
}
