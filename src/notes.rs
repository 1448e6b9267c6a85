//! Note storage, search, and content processing.
//!
//! This module handles all operations related to notes including:
//! - Create / read / update / delete against the graph store
//! - Rich-text sanitizing and plain-text extraction
//! - Full-text search
//! - Markdown rendering

use crate::error::{AppError, AppResult};
use crate::links;
use crate::models::{
    ContentFormat, ListParams, NewNote, Note, NoteDetail, NoteSort, NoteSummary, NoteUpdate,
    SearchMatch, SearchResult,
};
use crate::store::GraphStore;
use crate::tags::{ensure_tags, normalize_tag, sync_memberships};
use chrono::Utc;
use pulldown_cmark::Parser;
use regex::Regex;
use std::sync::LazyLock;

pub const MAX_TITLE_LEN: usize = 200;
pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 200;
pub const DEFAULT_SEARCH_LIMIT: usize = 20;
pub const MAX_SEARCH_LIMIT: usize = 100;
const EXCERPT_CHARS: usize = 160;
const SNIPPET_RADIUS: usize = 60;
const SNIPPETS_PER_NOTE: usize = 3;

static TAG_STRIP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid tag pattern"));

// ============================================================================
// Content Processing
// ============================================================================

fn html_unescape(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

/// Strip scripts, event handlers and other unsafe markup from editor HTML.
pub fn sanitize_html(html: &str) -> String {
    ammonia::clean(html)
}

pub fn render_markdown(content: &str) -> String {
    let parser = Parser::new(content);
    let mut html_output = String::new();
    pulldown_cmark::html::push_html(&mut html_output, parser);
    // Sanitize HTML to prevent XSS from raw HTML in markdown
    ammonia::clean(&html_output)
}

/// Readable text of a note body with markup removed and whitespace collapsed.
pub fn extract_plain_text(content: &str, format: ContentFormat) -> String {
    let html = match format {
        ContentFormat::Html => sanitize_html(content),
        ContentFormat::Markdown => render_markdown(content),
    };
    let stripped = TAG_STRIP_RE.replace_all(&html, " ");
    html_unescape(&stripped)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// The first `EXCERPT_CHARS` characters of `text`, cut at a word boundary.
pub fn excerpt(text: &str) -> String {
    if text.chars().count() <= EXCERPT_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(EXCERPT_CHARS).collect();
    let trimmed = match cut.rfind(' ') {
        Some(idx) if idx > EXCERPT_CHARS / 2 => &cut[..idx],
        _ => cut.as_str(),
    };
    format!("{}…", trimmed.trim_end())
}

/// Sanitized HTML ready for display.
pub fn render_note(note: &Note) -> String {
    match note.content_format {
        ContentFormat::Html => sanitize_html(&note.content),
        ContentFormat::Markdown => render_markdown(&note.content),
    }
}

fn prepare_content(raw: &str, format: ContentFormat) -> (String, String) {
    let content = match format {
        ContentFormat::Html => sanitize_html(raw),
        ContentFormat::Markdown => raw.to_string(),
    };
    let plain = extract_plain_text(&content, format);
    (content, plain)
}

fn validate_title(raw: &str) -> AppResult<String> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(AppError::BadRequest("title is required".into()));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(AppError::BadRequest(format!(
            "title longer than {} characters",
            MAX_TITLE_LEN
        )));
    }
    Ok(title.to_string())
}

// ============================================================================
// CRUD
// ============================================================================

pub fn create_note(store: &GraphStore, req: NewNote) -> AppResult<Note> {
    let title = validate_title(&req.title)?;
    let (content, plain_text) = prepare_content(&req.content, req.format);

    let _guard = store.write_guard();
    let tags = ensure_tags(store, &req.tags)?;
    let now = Utc::now();
    let note = Note {
        id: uuid::Uuid::new_v4().to_string(),
        title,
        content,
        content_format: req.format,
        plain_text,
        tags,
        created: now,
        updated: now,
    };
    store.put_note(&note)?;
    sync_memberships(store, &note.id, &[], &note.tags)?;

    tracing::info!(id = %note.id, title = %note.title, "note created");
    Ok(note)
}

pub fn get_note(store: &GraphStore, id: &str) -> AppResult<Note> {
    store
        .get_note(id)?
        .ok_or_else(|| AppError::NotFound(format!("note {} not found", id)))
}

/// A note together with its outgoing links and backlinks.
pub fn note_detail(store: &GraphStore, id: &str) -> AppResult<NoteDetail> {
    let note = get_note(store, id)?;
    Ok(NoteDetail {
        outgoing: links::outgoing_links(store, id)?,
        backlinks: links::backlinks(store, id)?,
        note,
    })
}

pub fn update_note(store: &GraphStore, id: &str, update: NoteUpdate) -> AppResult<Note> {
    let title = update.title.as_deref().map(validate_title).transpose()?;

    let _guard = store.write_guard();
    let mut note = get_note(store, id)?;

    if let Some(title) = title {
        note.title = title;
    }
    if update.content.is_some() || update.format.is_some() {
        let format = update.format.unwrap_or(note.content_format);
        let raw = update.content.unwrap_or_else(|| note.content.clone());
        let (content, plain_text) = prepare_content(&raw, format);
        note.content = content;
        note.content_format = format;
        note.plain_text = plain_text;
    }
    if let Some(raw_tags) = update.tags {
        let tags = ensure_tags(store, &raw_tags)?;
        sync_memberships(store, &note.id, &note.tags, &tags)?;
        note.tags = tags;
    }
    note.updated = Utc::now();
    store.put_note(&note)?;

    tracing::info!(id = %note.id, "note updated");
    Ok(note)
}

/// Delete a note along with every link touching it and its tag memberships.
pub fn delete_note(store: &GraphStore, id: &str) -> AppResult<Note> {
    let _guard = store.write_guard();
    let note = get_note(store, id)?;

    let removed_links = store.remove_links_touching(id)?;
    sync_memberships(store, id, &note.tags, &[])?;
    store.remove_note(id)?;

    tracing::info!(id, removed_links, "note deleted");
    Ok(note)
}

// ============================================================================
// Listing
// ============================================================================

pub fn summarize(store: &GraphStore, note: &Note) -> AppResult<NoteSummary> {
    let (link_count, backlink_count) = links::link_counts(store, &note.id)?;
    Ok(NoteSummary {
        id: note.id.clone(),
        title: note.title.clone(),
        excerpt: excerpt(&note.plain_text),
        tags: note.tags.clone(),
        updated: note.updated,
        link_count,
        backlink_count,
    })
}

fn sort_notes(notes: &mut [Note], sort: NoteSort) {
    match sort {
        NoteSort::Updated => notes.sort_by(|a, b| b.updated.cmp(&a.updated)),
        NoteSort::Created => notes.sort_by(|a, b| b.created.cmp(&a.created)),
        NoteSort::Title => notes.sort_by(|a, b| {
            a.title
                .to_lowercase()
                .cmp(&b.title.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        }),
    }
}

pub fn list_notes(store: &GraphStore, params: &ListParams) -> AppResult<Vec<NoteSummary>> {
    let mut notes = store.list_notes()?;
    if let Some(ref raw) = params.tag {
        let tag = normalize_tag(raw)?;
        notes.retain(|n| n.tags.contains(&tag));
    }
    sort_notes(&mut notes, params.sort);

    let limit = params
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = params.offset.unwrap_or(0);

    notes
        .iter()
        .skip(offset)
        .take(limit)
        .map(|n| summarize(store, n))
        .collect()
}

// ============================================================================
// Search
// ============================================================================

/// Lowercased copy of `text` plus, for every byte of the copy, the byte offset
/// of the source character in `text`. Case mapping can change byte lengths
/// (the Kelvin sign lowercases to ASCII `k`), so match offsets in the copy need translating.
fn lowercase_with_offsets(text: &str) -> (String, Vec<usize>) {
    let mut lower = String::with_capacity(text.len());
    let mut origin = Vec::with_capacity(text.len());
    for (idx, ch) in text.char_indices() {
        for lc in ch.to_lowercase() {
            lower.push(lc);
            origin.extend(std::iter::repeat(idx).take(lc.len_utf8()));
        }
    }
    (lower, origin)
}

/// Snippet of up to `SNIPPET_RADIUS` characters either side of `text[start..end]`.
/// Both offsets must be char boundaries of `text`; anything else yields an excerpt.
fn snippet_around(text: &str, start: usize, end: usize) -> String {
    let (Some(before), Some(hit), Some(after)) =
        (text.get(..start), text.get(start..end), text.get(end..))
    else {
        return excerpt(text);
    };

    let lead: Vec<char> = before.chars().collect();
    let from = lead.len().saturating_sub(SNIPPET_RADIUS);
    let mut snippet = String::new();
    if from > 0 {
        snippet.push('…');
    }
    snippet.extend(&lead[from..]);
    snippet.push_str(hit);
    let mut tail = after.chars();
    snippet.extend(tail.by_ref().take(SNIPPET_RADIUS));
    if tail.next().is_some() {
        snippet.push('…');
    }
    snippet
}

struct Scored {
    note: Note,
    title_hit: bool,
    hits: usize,
    matches: Vec<SearchMatch>,
}

fn score_note(note: &Note, query_lower: &str) -> Option<Scored> {
    let mut matches = Vec::new();

    let title_hit = note.title.to_lowercase().contains(query_lower);
    if title_hit {
        matches.push(SearchMatch {
            field: "title".to_string(),
            snippet: note.title.clone(),
        });
    }

    let mut tag_hits = 0;
    for tag in &note.tags {
        if tag.contains(query_lower) {
            tag_hits += 1;
            matches.push(SearchMatch {
                field: "tag".to_string(),
                snippet: tag.clone(),
            });
        }
    }

    let text = &note.plain_text;
    let (lower, origin) = lowercase_with_offsets(text);
    let mut content_hits = 0;
    for (pos, _) in lower.match_indices(query_lower) {
        content_hits += 1;
        if content_hits > SNIPPETS_PER_NOTE {
            continue;
        }
        let last = pos + query_lower.len() - 1;
        let (Some(&start), Some(&last_char)) = (origin.get(pos), origin.get(last)) else {
            continue;
        };
        let end = next_char_boundary(text, last_char);
        matches.push(SearchMatch {
            field: "content".to_string(),
            snippet: snippet_around(text, start, end),
        });
    }

    if matches.is_empty() {
        return None;
    }
    Some(Scored {
        note: note.clone(),
        title_hit,
        hits: content_hits + tag_hits,
        matches,
    })
}

fn next_char_boundary(text: &str, idx: usize) -> usize {
    text.get(idx..)
        .and_then(|rest| rest.chars().next())
        .map_or(text.len(), |c| idx + c.len_utf8())
}

/// Case-insensitive search over titles, tags and note text. Title hits rank
/// first, then notes with more hits.
pub fn search_notes(
    store: &GraphStore,
    query: &str,
    limit: Option<usize>,
) -> AppResult<Vec<SearchResult>> {
    use rayon::prelude::*;

    let query_lower = query.trim().to_lowercase();
    if query_lower.is_empty() {
        return Ok(Vec::new());
    }
    let limit = limit
        .unwrap_or(DEFAULT_SEARCH_LIMIT)
        .clamp(1, MAX_SEARCH_LIMIT);

    let notes = store.list_notes()?;
    let mut scored: Vec<Scored> = notes
        .par_iter()
        .filter_map(|note| score_note(note, &query_lower))
        .collect();

    scored.sort_by(|a, b| {
        b.title_hit
            .cmp(&a.title_hit)
            .then_with(|| b.hits.cmp(&a.hits))
            .then_with(|| b.note.updated.cmp(&a.note.updated))
    });

    scored
        .into_iter()
        .take(limit)
        .map(|s| {
            Ok(SearchResult {
                note: summarize(store, &s.note)?,
                matches: s.matches,
            })
        })
        .collect()
}
