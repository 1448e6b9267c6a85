//! Tag management.
//!
//! Tag names are normalized (`#Machine Learning` → `machine-learning`) before
//! they touch the store. A note's `tags` field and the `tags:notes` membership
//! index are always updated together.

use crate::error::{AppError, AppResult};
use crate::models::{Note, NoteSummary, Tag, TagCount};
use crate::notes::summarize;
use crate::store::GraphStore;
use chrono::Utc;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

pub const MAX_TAG_LEN: usize = 64;

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_/-]*$").expect("valid tag pattern"));
static COLOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#[0-9a-fA-F]{6}$").expect("valid color pattern"));

// ============================================================================
// Normalization
// ============================================================================

pub fn normalize_tag(raw: &str) -> AppResult<String> {
    let trimmed = raw.trim().trim_start_matches('#').trim();
    let name = trimmed
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase();

    if name.is_empty() {
        return Err(AppError::BadRequest("tag name is empty".into()));
    }
    if name.chars().count() > MAX_TAG_LEN {
        return Err(AppError::BadRequest(format!(
            "tag name longer than {} characters",
            MAX_TAG_LEN
        )));
    }
    if !TAG_RE.is_match(&name) {
        return Err(AppError::BadRequest(format!("invalid tag name: {}", raw)));
    }
    Ok(name)
}

/// Normalize and de-duplicate; the result is sorted.
pub fn normalize_tags(raw: &[String]) -> AppResult<Vec<String>> {
    let set: BTreeSet<String> = raw
        .iter()
        .map(|t| normalize_tag(t))
        .collect::<AppResult<_>>()?;
    Ok(set.into_iter().collect())
}

fn validate_color(color: Option<String>) -> AppResult<Option<String>> {
    match color {
        Some(c) if c.trim().is_empty() => Ok(None),
        Some(c) if COLOR_RE.is_match(c.trim()) => Ok(Some(c.trim().to_lowercase())),
        Some(c) => Err(AppError::BadRequest(format!("invalid color: {}", c))),
        None => Ok(None),
    }
}

// ============================================================================
// Internal Helpers (caller holds the write guard)
// ============================================================================

/// Normalize `raw` and create any tags that do not exist yet.
pub(crate) fn ensure_tags(store: &GraphStore, raw: &[String]) -> AppResult<Vec<String>> {
    let names = normalize_tags(raw)?;
    for name in &names {
        if store.get_tag(name)?.is_none() {
            store.put_tag(&Tag {
                name: name.clone(),
                color: None,
                created: Utc::now(),
            })?;
            tracing::debug!(tag = %name, "created tag");
        }
    }
    Ok(names)
}

/// Bring the membership index in line with a note's new tag list.
pub(crate) fn sync_memberships(
    store: &GraphStore,
    note_id: &str,
    old: &[String],
    new: &[String],
) -> AppResult<()> {
    for tag in old.iter().filter(|t| !new.contains(t)) {
        store.untag_note(tag, note_id)?;
    }
    for tag in new.iter().filter(|t| !old.contains(t)) {
        store.tag_note(tag, note_id)?;
    }
    Ok(())
}

fn replace_note_tags(store: &GraphStore, note: &mut Note, names: Vec<String>) -> AppResult<()> {
    sync_memberships(store, &note.id, &note.tags, &names)?;
    note.tags = names;
    note.updated = Utc::now();
    store.put_note(note)?;
    Ok(())
}

fn load_note(store: &GraphStore, id: &str) -> AppResult<Note> {
    store
        .get_note(id)?
        .ok_or_else(|| AppError::NotFound(format!("note {} not found", id)))
}

// ============================================================================
// Tag CRUD
// ============================================================================

pub fn create_tag(store: &GraphStore, name: &str, color: Option<String>) -> AppResult<Tag> {
    let name = normalize_tag(name)?;
    let color = validate_color(color)?;

    let _guard = store.write_guard();
    if store.get_tag(&name)?.is_some() {
        return Err(AppError::Conflict(format!("tag {} already exists", name)));
    }
    let tag = Tag {
        name,
        color,
        created: Utc::now(),
    };
    store.put_tag(&tag)?;
    tracing::info!(tag = %tag.name, "tag created");
    Ok(tag)
}

/// All tags with their note counts, most used first.
pub fn list_tags(store: &GraphStore) -> AppResult<Vec<TagCount>> {
    let mut counts: Vec<TagCount> = store
        .list_tags()?
        .into_iter()
        .map(|t| TagCount {
            note_count: store.tag_note_count(&t.name),
            name: t.name,
            color: t.color,
        })
        .collect();
    counts.sort_by(|a, b| b.note_count.cmp(&a.note_count).then_with(|| a.name.cmp(&b.name)));
    Ok(counts)
}

/// Rename `old` to `new`. When `new` already exists the two tags are merged.
pub fn rename_tag(store: &GraphStore, old: &str, new: &str) -> AppResult<Tag> {
    let old = normalize_tag(old)?;
    let new = normalize_tag(new)?;

    let _guard = store.write_guard();
    let old_tag = store
        .get_tag(&old)?
        .ok_or_else(|| AppError::NotFound(format!("tag {} not found", old)))?;
    if old == new {
        return Ok(old_tag);
    }

    let target = match store.get_tag(&new)? {
        Some(existing) => existing,
        None => {
            let tag = Tag {
                name: new.clone(),
                color: old_tag.color.clone(),
                created: old_tag.created,
            };
            store.put_tag(&tag)?;
            tag
        }
    };

    let members = store.notes_for_tag(&old)?;
    for note_id in &members {
        if let Some(mut note) = store.get_note(note_id)? {
            let names: BTreeSet<String> = note
                .tags
                .iter()
                .map(|t| if *t == old { new.clone() } else { t.clone() })
                .collect();
            replace_note_tags(store, &mut note, names.into_iter().collect())?;
        }
    }
    store.remove_tag(&old)?;

    tracing::info!(from = %old, to = %new, notes = members.len(), "tag renamed");
    Ok(target)
}

/// Delete a tag and strip it from every note carrying it.
pub fn delete_tag(store: &GraphStore, name: &str) -> AppResult<()> {
    let name = normalize_tag(name)?;

    let _guard = store.write_guard();
    if store.get_tag(&name)?.is_none() {
        return Err(AppError::NotFound(format!("tag {} not found", name)));
    }
    for note_id in store.notes_for_tag(&name)? {
        if let Some(mut note) = store.get_note(&note_id)? {
            let names: Vec<String> = note.tags.iter().filter(|t| **t != name).cloned().collect();
            replace_note_tags(store, &mut note, names)?;
        }
    }
    store.remove_tag(&name)?;
    tracing::info!(tag = %name, "tag deleted");
    Ok(())
}

// ============================================================================
// Note Tagging
// ============================================================================

pub fn set_note_tags(store: &GraphStore, note_id: &str, raw: &[String]) -> AppResult<Note> {
    let _guard = store.write_guard();
    let mut note = load_note(store, note_id)?;
    let names = ensure_tags(store, raw)?;
    replace_note_tags(store, &mut note, names)?;
    Ok(note)
}

pub fn add_tag_to_note(store: &GraphStore, note_id: &str, raw: &str) -> AppResult<Note> {
    let _guard = store.write_guard();
    let mut note = load_note(store, note_id)?;
    let mut wanted = note.tags.clone();
    wanted.push(raw.to_string());
    let names = ensure_tags(store, &wanted)?;
    replace_note_tags(store, &mut note, names)?;
    Ok(note)
}

pub fn remove_tag_from_note(store: &GraphStore, note_id: &str, raw: &str) -> AppResult<Note> {
    let name = normalize_tag(raw)?;

    let _guard = store.write_guard();
    let mut note = load_note(store, note_id)?;
    if !note.tags.contains(&name) {
        return Err(AppError::NotFound(format!(
            "note {} is not tagged {}",
            note_id, name
        )));
    }
    let names: Vec<String> = note.tags.iter().filter(|t| **t != name).cloned().collect();
    replace_note_tags(store, &mut note, names)?;
    Ok(note)
}

pub fn notes_with_tag(store: &GraphStore, raw: &str) -> AppResult<Vec<NoteSummary>> {
    let name = normalize_tag(raw)?;
    if store.get_tag(&name)?.is_none() {
        return Err(AppError::NotFound(format!("tag {} not found", name)));
    }

    let mut summaries = Vec::new();
    for note_id in store.notes_for_tag(&name)? {
        if let Some(note) = store.get_note(&note_id)? {
            summaries.push(summarize(store, &note)?);
        }
    }
    summaries.sort_by(|a, b| b.updated.cmp(&a.updated));
    Ok(summaries)
}
