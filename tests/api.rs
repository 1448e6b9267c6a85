//! HTTP API integration tests.
//!
//! Each test opens a fresh sled database in a tempdir, builds the router, and
//! sends requests through `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt; // for `.oneshot()`

use pkm::config::Config;
use pkm::{router, AppState};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const USER: &str = "ada";
const PASSWORD: &str = "correct horse battery";

struct TestApp {
    router: axum::Router,
    _tmp: TempDir,
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

impl TestApp {
    fn new() -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let config = Config::for_data_dir(tmp.path().join("db"));
        let state = Arc::new(AppState::open(config).expect("open state"));
        TestApp {
            router: router(state),
            _tmp: tmp,
        }
    }

    async fn request(&self, req: Request<Body>) -> Reply {
        let resp = self.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).to_string()));
        Reply {
            status,
            headers,
            body,
        }
    }

    async fn send(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Reply {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = match body {
            Some(val) => builder.body(Body::from(val.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.request(req).await
    }

    /// Register the account and log in, returning (access, refresh).
    async fn login(&self) -> (String, String) {
        let creds = json!({ "username": USER, "password": PASSWORD });
        let reg = self
            .send(Method::POST, "/api/auth/register", None, Some(creds.clone()))
            .await;
        assert_eq!(reg.status, StatusCode::CREATED);
        let resp = self
            .send(Method::POST, "/api/auth/login", None, Some(creds))
            .await;
        assert_eq!(resp.status, StatusCode::OK);
        (
            resp.body["access_token"].as_str().unwrap().to_string(),
            resp.body["refresh_token"].as_str().unwrap().to_string(),
        )
    }

    async fn create_note(&self, token: &str, body: Value) -> String {
        let resp = self.send(Method::POST, "/api/notes", Some(token), Some(body)).await;
        assert_eq!(resp.status, StatusCode::CREATED, "{}", resp.body);
        resp.body["id"].as_str().unwrap().to_string()
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_is_public() {
    let app = TestApp::new();
    let resp = app.send(Method::GET, "/api/health", None, None).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body["status"], "ok");
    assert_eq!(resp.body["notes"], 0);
}

#[tokio::test]
async fn protected_routes_require_a_valid_token() {
    let app = TestApp::new();
    for uri in ["/api/notes", "/api/tags", "/api/graph", "/api/auth/me"] {
        let resp = app.send(Method::GET, uri, None, None).await;
        assert_eq!(resp.status, StatusCode::UNAUTHORIZED, "{}", uri);
        assert!(resp.body["error"].is_string());
    }
    let resp = app
        .send(Method::GET, "/api/notes", Some("not-a-jwt"), None)
        .await;
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn register_is_single_user_and_login_sets_cookie() {
    let app = TestApp::new();
    let (access, _) = app.login().await;

    let again = app
        .send(
            Method::POST,
            "/api/auth/register",
            None,
            Some(json!({ "username": "bob", "password": "another password" })),
        )
        .await;
    assert_eq!(again.status, StatusCode::CONFLICT);

    let resp = app
        .send(
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({ "username": USER, "password": PASSWORD })),
        )
        .await;
    assert_eq!(resp.body["token_type"], "Bearer");
    let cookie = resp.headers[header::SET_COOKIE].to_str().unwrap();
    assert!(cookie.starts_with("pkm_refresh="));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Strict"));

    let me = app.send(Method::GET, "/api/auth/me", Some(&access), None).await;
    assert_eq!(me.status, StatusCode::OK);
    assert_eq!(me.body["username"], USER);
}

#[tokio::test]
async fn refresh_rotates_and_detects_reuse() {
    let app = TestApp::new();
    let (_, first) = app.login().await;

    let rotated = app
        .send(
            Method::POST,
            "/api/auth/refresh",
            None,
            Some(json!({ "refresh_token": first })),
        )
        .await;
    assert_eq!(rotated.status, StatusCode::OK);
    let second = rotated.body["refresh_token"].as_str().unwrap().to_string();
    assert_ne!(second, first);

    let access = rotated.body["access_token"].as_str().unwrap();
    let me = app.send(Method::GET, "/api/auth/me", Some(access), None).await;
    assert_eq!(me.status, StatusCode::OK);

    // Replaying the retired token kills the whole family.
    let replay = app
        .send(
            Method::POST,
            "/api/auth/refresh",
            None,
            Some(json!({ "refresh_token": first })),
        )
        .await;
    assert_eq!(replay.status, StatusCode::UNAUTHORIZED);
    let successor = app
        .send(
            Method::POST,
            "/api/auth/refresh",
            None,
            Some(json!({ "refresh_token": second })),
        )
        .await;
    assert_eq!(successor.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn refresh_reads_the_cookie() {
    let app = TestApp::new();
    let (_, refresh) = app.login().await;

    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/auth/refresh")
        .header(header::COOKIE, format!("pkm_refresh={}", refresh))
        .body(Body::empty())
        .unwrap();
    let resp = app.request(req).await;
    assert_eq!(resp.status, StatusCode::OK);

    let missing = app.send(Method::POST, "/api/auth/refresh", None, None).await;
    assert_eq!(missing.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn logout_revokes_refresh_token() {
    let app = TestApp::new();
    let (_, refresh) = app.login().await;

    let out = app
        .send(
            Method::POST,
            "/api/auth/logout",
            None,
            Some(json!({ "refresh_token": refresh })),
        )
        .await;
    assert_eq!(out.status, StatusCode::NO_CONTENT);

    let resp = app
        .send(
            Method::POST,
            "/api/auth/refresh",
            None,
            Some(json!({ "refresh_token": refresh })),
        )
        .await;
    assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn repeated_login_failures_are_throttled() {
    let app = TestApp::new();
    app.login().await;
    let bad = json!({ "username": USER, "password": "wrong password" });

    for _ in 0..5 {
        let resp = app
            .send(Method::POST, "/api/auth/login", None, Some(bad.clone()))
            .await;
        assert_eq!(resp.status, StatusCode::UNAUTHORIZED);
    }
    let locked = app
        .send(
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({ "username": USER, "password": PASSWORD })),
        )
        .await;
    assert_eq!(locked.status, StatusCode::TOO_MANY_REQUESTS);
    assert!(locked.headers.contains_key(header::RETRY_AFTER));
}

// ---------------------------------------------------------------------------
// Notes, links, tags
// ---------------------------------------------------------------------------

#[tokio::test]
async fn links_show_up_as_backlinks() {
    let app = TestApp::new();
    let (token, _) = app.login().await;
    let a = app
        .create_note(&token, json!({ "title": "Ownership", "content": "<p>moves</p>" }))
        .await;
    let b = app
        .create_note(&token, json!({ "title": "Borrowing", "content": "<p>refs</p>" }))
        .await;

    let link = app
        .send(
            Method::POST,
            "/api/links",
            Some(&token),
            Some(json!({ "source": a, "target": b, "link_type": "extends", "annotation": "builds on" })),
        )
        .await;
    assert_eq!(link.status, StatusCode::CREATED);
    assert_eq!(link.body["link_type"], "extends");

    let dup = app
        .send(
            Method::POST,
            "/api/links",
            Some(&token),
            Some(json!({ "source": a, "target": b })),
        )
        .await;
    assert_eq!(dup.status, StatusCode::CONFLICT);

    let detail = app
        .send(Method::GET, &format!("/api/notes/{}", b), Some(&token), None)
        .await;
    assert_eq!(detail.status, StatusCode::OK);
    assert_eq!(detail.body["backlinks"][0]["note_id"], a.as_str());
    assert_eq!(detail.body["backlinks"][0]["annotation"], "builds on");

    let updated = app
        .send(
            Method::PUT,
            &format!("/api/links/{}/{}", a, b),
            Some(&token),
            Some(json!({ "link_type": "supports" })),
        )
        .await;
    assert_eq!(updated.body["link_type"], "supports");

    let outgoing = app
        .send(Method::GET, &format!("/api/notes/{}/links", a), Some(&token), None)
        .await;
    assert_eq!(outgoing.body[0]["title"], "Borrowing");

    let deleted = app
        .send(Method::DELETE, &format!("/api/notes/{}", a), Some(&token), None)
        .await;
    assert_eq!(deleted.status, StatusCode::NO_CONTENT);

    let back = app
        .send(Method::GET, &format!("/api/notes/{}/backlinks", b), Some(&token), None)
        .await;
    assert_eq!(back.body, json!([]));
    let gone = app
        .send(Method::GET, &format!("/api/notes/{}", a), Some(&token), None)
        .await;
    assert_eq!(gone.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn note_crud_search_and_render() {
    let app = TestApp::new();
    let (token, _) = app.login().await;
    let id = app
        .create_note(
            &token,
            json!({
                "title": "Lifetimes in Rust",
                "content": "# Heading\n\nA reference must not outlive its referent.<script>alert(1)</script>",
                "format": "markdown",
                "tags": ["Rust", "#lang"]
            }),
        )
        .await;

    let empty_title = app
        .send(Method::POST, "/api/notes", Some(&token), Some(json!({ "title": "   " })))
        .await;
    assert_eq!(empty_title.status, StatusCode::BAD_REQUEST);

    let rendered = app
        .send(Method::GET, &format!("/api/notes/{}/render", id), Some(&token), None)
        .await;
    let html = rendered.body["html"].as_str().unwrap();
    assert!(html.contains("<h1>Heading</h1>"));
    assert!(!html.contains("<script>"));

    let found = app
        .send(Method::GET, "/api/notes/search?q=outlive", Some(&token), None)
        .await;
    assert_eq!(found.status, StatusCode::OK);
    assert_eq!(found.body[0]["note"]["id"], id.as_str());

    let updated = app
        .send(
            Method::PUT,
            &format!("/api/notes/{}", id),
            Some(&token),
            Some(json!({ "title": "Lifetimes" })),
        )
        .await;
    assert_eq!(updated.body["title"], "Lifetimes");
    assert_eq!(updated.body["tags"], json!(["lang", "rust"]));

    let list = app
        .send(Method::GET, "/api/notes?tag=rust", Some(&token), None)
        .await;
    assert_eq!(list.body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn tag_management() {
    let app = TestApp::new();
    let (token, _) = app.login().await;
    let id = app
        .create_note(&token, json!({ "title": "Sled", "tags": ["db"] }))
        .await;

    let added = app
        .send(Method::POST, &format!("/api/notes/{}/tags/storage", id), Some(&token), None)
        .await;
    assert_eq!(added.body["tags"], json!(["db", "storage"]));

    let created = app
        .send(
            Method::POST,
            "/api/tags",
            Some(&token),
            Some(json!({ "name": "unused", "color": "#AABBCC" })),
        )
        .await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert_eq!(created.body["color"], "#aabbcc");

    let renamed = app
        .send(
            Method::PUT,
            "/api/tags/db",
            Some(&token),
            Some(json!({ "name": "database" })),
        )
        .await;
    assert_eq!(renamed.status, StatusCode::OK);

    let tagged = app
        .send(Method::GET, "/api/tags/database/notes", Some(&token), None)
        .await;
    assert_eq!(tagged.body[0]["id"], id.as_str());

    let removed = app
        .send(Method::DELETE, "/api/tags/storage", Some(&token), None)
        .await;
    assert_eq!(removed.status, StatusCode::NO_CONTENT);

    let note = app
        .send(Method::GET, &format!("/api/notes/{}", id), Some(&token), None)
        .await;
    assert_eq!(note.body["note"]["tags"], json!(["database"]));

    let tags = app.send(Method::GET, "/api/tags", Some(&token), None).await;
    let names: Vec<&str> = tags
        .body
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["database", "unused"]);
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

#[tokio::test]
async fn graph_views() {
    let app = TestApp::new();
    let (token, _) = app.login().await;
    let a = app.create_note(&token, json!({ "title": "A", "tags": ["x"] })).await;
    let b = app.create_note(&token, json!({ "title": "B" })).await;
    let c = app.create_note(&token, json!({ "title": "C" })).await;
    let lonely = app.create_note(&token, json!({ "title": "Lonely" })).await;
    for (s, t) in [(&a, &b), (&b, &c)] {
        let resp = app
            .send(
                Method::POST,
                "/api/links",
                Some(&token),
                Some(json!({ "source": s, "target": t })),
            )
            .await;
        assert_eq!(resp.status, StatusCode::CREATED);
    }

    let full = app.send(Method::GET, "/api/graph", Some(&token), None).await;
    assert_eq!(full.status, StatusCode::OK);
    assert_eq!(full.body["nodes"].as_array().unwrap().len(), 4);
    assert_eq!(full.body["edges"].as_array().unwrap().len(), 2);

    let orphans = app
        .send(Method::GET, "/api/graph?q=orphans", Some(&token), None)
        .await;
    assert_eq!(orphans.body["nodes"][0]["id"], lonely.as_str());

    let stats = app.send(Method::GET, "/api/graph/stats", Some(&token), None).await;
    assert_eq!(stats.body["total_nodes"], 4);
    assert_eq!(stats.body["orphan_count"], 1);
    assert_eq!(stats.body["cluster_count"], 2);

    let clusters = app
        .send(Method::GET, "/api/graph/clusters", Some(&token), None)
        .await;
    assert_eq!(clusters.body[0]["size"], 3);
    assert_eq!(clusters.body[0]["label"], "x");

    let near = app
        .send(
            Method::GET,
            &format!("/api/graph/neighborhood/{}?depth=1", c),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(near.body["nodes"].as_array().unwrap().len(), 2);

    let far = app
        .send(
            Method::GET,
            &format!("/api/graph/neighborhood/{}?depth=1000000", c),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(far.status, StatusCode::OK);
    assert_eq!(far.body["nodes"].as_array().unwrap().len(), 3);

    let deep = app
        .send(
            Method::GET,
            &format!("/api/graph?q=from:{}%20depth:4000000000", a),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(deep.status, StatusCode::OK);
    assert_eq!(deep.body["nodes"].as_array().unwrap().len(), 3);

    let missing = app
        .send(Method::GET, "/api/graph/neighborhood/nope", Some(&token), None)
        .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}
