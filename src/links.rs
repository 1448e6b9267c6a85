//! Manual, typed links between notes.
//!
//! A link is created explicitly by the user; note content is never scanned
//! for references. Each link is stored once per ordered pair and indexed in
//! both directions, so a note's backlinks are simply the links whose target
//! it is.

use crate::error::{AppError, AppResult};
use crate::models::{Link, LinkUpdate, LinkView, NewLink};
use crate::store::GraphStore;
use chrono::Utc;

pub const MAX_ANNOTATION_LEN: usize = 500;

fn clean_annotation(raw: Option<String>) -> AppResult<Option<String>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > MAX_ANNOTATION_LEN {
        return Err(AppError::BadRequest(format!(
            "annotation longer than {} characters",
            MAX_ANNOTATION_LEN
        )));
    }
    Ok(Some(trimmed.to_string()))
}

fn require_note(store: &GraphStore, id: &str) -> AppResult<()> {
    if store.note_exists(id)? {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("note {} not found", id)))
    }
}

pub fn create_link(store: &GraphStore, req: NewLink) -> AppResult<Link> {
    if req.source == req.target {
        return Err(AppError::BadRequest("a note cannot link to itself".into()));
    }
    let annotation = clean_annotation(req.annotation)?;

    let _guard = store.write_guard();
    require_note(store, &req.source)?;
    require_note(store, &req.target)?;
    if store.get_link(&req.source, &req.target)?.is_some() {
        return Err(AppError::Conflict(format!(
            "link {} -> {} already exists",
            req.source, req.target
        )));
    }

    let link = Link {
        source: req.source,
        target: req.target,
        link_type: req.link_type.unwrap_or_default(),
        annotation,
        created: Utc::now(),
    };
    store.put_link(&link)?;
    tracing::info!(
        source = %link.source,
        target = %link.target,
        link_type = %link.link_type,
        "link created"
    );
    Ok(link)
}

pub fn get_link(store: &GraphStore, source: &str, target: &str) -> AppResult<Link> {
    store
        .get_link(source, target)?
        .ok_or_else(|| AppError::NotFound(format!("link {} -> {} not found", source, target)))
}

pub fn update_link(
    store: &GraphStore,
    source: &str,
    target: &str,
    update: LinkUpdate,
) -> AppResult<Link> {
    let _guard = store.write_guard();
    let mut link = get_link(store, source, target)?;
    if let Some(t) = update.link_type {
        link.link_type = t;
    }
    if update.annotation.is_some() {
        link.annotation = clean_annotation(update.annotation)?;
    }
    store.put_link(&link)?;
    tracing::debug!(source, target, link_type = %link.link_type, "link updated");
    Ok(link)
}

pub fn delete_link(store: &GraphStore, source: &str, target: &str) -> AppResult<()> {
    let _guard = store.write_guard();
    match store.remove_link(source, target)? {
        Some(_) => {
            tracing::info!(source, target, "link deleted");
            Ok(())
        }
        None => Err(AppError::NotFound(format!(
            "link {} -> {} not found",
            source, target
        ))),
    }
}

/// Resolve the far end of each link to a title; links to notes that vanished
/// are skipped.
fn views(
    store: &GraphStore,
    links: Vec<Link>,
    far_end: impl Fn(&Link) -> &str,
) -> AppResult<Vec<LinkView>> {
    let mut out = Vec::with_capacity(links.len());
    for link in &links {
        let id = far_end(link);
        if let Some(note) = store.get_note(id)? {
            out.push(LinkView {
                note_id: note.id,
                title: note.title,
                link_type: link.link_type,
                annotation: link.annotation.clone(),
            });
        }
    }
    out.sort_by(|a, b| {
        a.title
            .to_lowercase()
            .cmp(&b.title.to_lowercase())
            .then_with(|| a.note_id.cmp(&b.note_id))
    });
    Ok(out)
}

pub fn outgoing_links(store: &GraphStore, id: &str) -> AppResult<Vec<LinkView>> {
    require_note(store, id)?;
    views(store, store.outgoing_links(id)?, |l| l.target.as_str())
}

pub fn backlinks(store: &GraphStore, id: &str) -> AppResult<Vec<LinkView>> {
    require_note(store, id)?;
    views(store, store.incoming_links(id)?, |l| l.source.as_str())
}

/// (outgoing, incoming) link counts for a note.
pub fn link_counts(store: &GraphStore, id: &str) -> AppResult<(usize, usize)> {
    Ok((
        store.outgoing_links(id)?.len(),
        store.incoming_links(id)?.len(),
    ))
}
