//! Sled-backed graph store.
//!
//! The knowledge base lives in a handful of sled trees:
//! - `notes`: note id → serialized Note
//! - `links:out`: (source, target) → serialized Link
//! - `links:in`: (target, source) → serialized Link, the backlink index
//! - `tags`: tag name → serialized Tag
//! - `tags:notes`: (tag, note id) → empty membership marker
//! - `users`: username → serialized User
//! - `auth:refresh`: sha256(refresh token) → serialized RefreshRecord
//!
//! Every link is written to both link trees so that backlinks are a prefix
//! scan rather than a full table walk. Writes touching more than one tree are
//! serialized by the caller through [`GraphStore::write_guard`].

use crate::error::StoreError;
use crate::models::{Link, Note, RefreshRecord, Tag, User};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const NOTES_TREE: &str = "notes";
const LINKS_OUT_TREE: &str = "links:out";
const LINKS_IN_TREE: &str = "links:in";
const TAGS_TREE: &str = "tags";
const TAG_NOTES_TREE: &str = "tags:notes";
const USERS_TREE: &str = "users";
const REFRESH_TREE: &str = "auth:refresh";

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Key Encoding
// ============================================================================

fn encode_pair_key(first: &str, second: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(first.len() + second.len() + 1);
    key.extend_from_slice(first.as_bytes());
    key.push(0);
    key.extend_from_slice(second.as_bytes());
    key
}

fn decode_pair_key(key: &[u8]) -> Option<(String, String)> {
    let parts: Vec<&[u8]> = key.split(|&b| b == 0).collect();
    if parts.len() != 2 {
        return None;
    }
    Some((
        String::from_utf8_lossy(parts[0]).to_string(),
        String::from_utf8_lossy(parts[1]).to_string(),
    ))
}

fn prefix_of(first: &str) -> Vec<u8> {
    let mut prefix = first.as_bytes().to_vec();
    prefix.push(0);
    prefix
}

// ============================================================================
// JSON Helpers
// ============================================================================

fn get_json<T: DeserializeOwned>(tree: &sled::Tree, key: &[u8]) -> StoreResult<Option<T>> {
    match tree.get(key)? {
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
        None => Ok(None),
    }
}

fn put_json<T: Serialize>(tree: &sled::Tree, key: &[u8], value: &T) -> StoreResult<()> {
    let json = serde_json::to_vec(value)?;
    tree.insert(key, json)?;
    Ok(())
}

fn scan_json<T: DeserializeOwned>(iter: sled::Iter) -> StoreResult<Vec<T>> {
    let mut out = Vec::new();
    for entry in iter {
        let (_, v) = entry?;
        out.push(serde_json::from_slice(&v)?);
    }
    Ok(out)
}

// ============================================================================
// Store
// ============================================================================

#[derive(Clone)]
pub struct GraphStore {
    db: sled::Db,
    notes: sled::Tree,
    links_out: sled::Tree,
    links_in: sled::Tree,
    tags: sled::Tree,
    tag_notes: sled::Tree,
    users: sled::Tree,
    refresh: sled::Tree,
    write_lock: Arc<Mutex<()>>,
}

impl GraphStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// An in-memory store that disappears when dropped.
    pub fn temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> StoreResult<Self> {
        Ok(Self {
            notes: db.open_tree(NOTES_TREE)?,
            links_out: db.open_tree(LINKS_OUT_TREE)?,
            links_in: db.open_tree(LINKS_IN_TREE)?,
            tags: db.open_tree(TAGS_TREE)?,
            tag_notes: db.open_tree(TAG_NOTES_TREE)?,
            users: db.open_tree(USERS_TREE)?,
            refresh: db.open_tree(REFRESH_TREE)?,
            db,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Serialize a multi-tree write. A poisoned lock is recovered because the
    /// guarded data is `()`.
    pub fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Notes
    // ------------------------------------------------------------------------

    pub fn get_note(&self, id: &str) -> StoreResult<Option<Note>> {
        get_json(&self.notes, id.as_bytes())
    }

    pub fn note_exists(&self, id: &str) -> StoreResult<bool> {
        Ok(self.notes.contains_key(id.as_bytes())?)
    }

    pub fn put_note(&self, note: &Note) -> StoreResult<()> {
        put_json(&self.notes, note.id.as_bytes(), note)
    }

    pub fn remove_note(&self, id: &str) -> StoreResult<Option<Note>> {
        match self.notes.remove(id.as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub fn list_notes(&self) -> StoreResult<Vec<Note>> {
        scan_json(self.notes.iter())
    }

    pub fn note_count(&self) -> usize {
        self.notes.len()
    }

    // ------------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------------

    pub fn put_link(&self, link: &Link) -> StoreResult<()> {
        put_json(
            &self.links_out,
            &encode_pair_key(&link.source, &link.target),
            link,
        )?;
        put_json(
            &self.links_in,
            &encode_pair_key(&link.target, &link.source),
            link,
        )
    }

    pub fn get_link(&self, source: &str, target: &str) -> StoreResult<Option<Link>> {
        get_json(&self.links_out, &encode_pair_key(source, target))
    }

    pub fn remove_link(&self, source: &str, target: &str) -> StoreResult<Option<Link>> {
        let removed = self.links_out.remove(encode_pair_key(source, target))?;
        self.links_in.remove(encode_pair_key(target, source))?;
        match removed {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub fn outgoing_links(&self, id: &str) -> StoreResult<Vec<Link>> {
        scan_json(self.links_out.scan_prefix(prefix_of(id)))
    }

    /// Links pointing at `id`, read from the backlink index.
    pub fn incoming_links(&self, id: &str) -> StoreResult<Vec<Link>> {
        scan_json(self.links_in.scan_prefix(prefix_of(id)))
    }

    pub fn all_links(&self) -> StoreResult<Vec<Link>> {
        scan_json(self.links_out.iter())
    }

    pub fn link_count(&self) -> usize {
        self.links_out.len()
    }

    /// Remove every link with `id` at either end. Returns the number removed.
    pub fn remove_links_touching(&self, id: &str) -> StoreResult<usize> {
        let mut pairs = Vec::new();
        for tree in [&self.links_out, &self.links_in] {
            for entry in tree.scan_prefix(prefix_of(id)) {
                let (k, _) = entry?;
                let (first, second) = decode_pair_key(&k).ok_or_else(|| {
                    StoreError::Corrupt(format!("bad link key {:?}", String::from_utf8_lossy(&k)))
                })?;
                pairs.push((first, second));
            }
        }

        let mut removed = 0;
        for (first, second) in pairs {
            // Outgoing keys are (id, other); backlink keys are (id, other) too,
            // but describe other → id.
            if self.remove_link(&first, &second)?.is_some() {
                removed += 1;
            }
            if self.remove_link(&second, &first)?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Tags
    // ------------------------------------------------------------------------

    pub fn get_tag(&self, name: &str) -> StoreResult<Option<Tag>> {
        get_json(&self.tags, name.as_bytes())
    }

    pub fn put_tag(&self, tag: &Tag) -> StoreResult<()> {
        put_json(&self.tags, tag.name.as_bytes(), tag)
    }

    pub fn remove_tag(&self, name: &str) -> StoreResult<Option<Tag>> {
        let members = self.notes_for_tag(name)?;
        for note_id in members {
            self.untag_note(name, &note_id)?;
        }
        match self.tags.remove(name.as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub fn list_tags(&self) -> StoreResult<Vec<Tag>> {
        scan_json(self.tags.iter())
    }

    pub fn tag_note(&self, tag: &str, note_id: &str) -> StoreResult<()> {
        self.tag_notes.insert(encode_pair_key(tag, note_id), Vec::<u8>::new())?;
        Ok(())
    }

    pub fn untag_note(&self, tag: &str, note_id: &str) -> StoreResult<()> {
        self.tag_notes.remove(encode_pair_key(tag, note_id))?;
        Ok(())
    }

    pub fn notes_for_tag(&self, tag: &str) -> StoreResult<Vec<String>> {
        let mut ids = Vec::new();
        for entry in self.tag_notes.scan_prefix(prefix_of(tag)) {
            let (k, _) = entry?;
            if let Some((_, note_id)) = decode_pair_key(&k) {
                ids.push(note_id);
            }
        }
        Ok(ids)
    }

    pub fn tag_note_count(&self, tag: &str) -> usize {
        self.tag_notes.scan_prefix(prefix_of(tag)).count()
    }

    // ------------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------------

    pub fn get_user(&self, username: &str) -> StoreResult<Option<User>> {
        get_json(&self.users, username.as_bytes())
    }

    pub fn put_user(&self, user: &User) -> StoreResult<()> {
        put_json(&self.users, user.username.as_bytes(), user)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    // ------------------------------------------------------------------------
    // Refresh Tokens
    // ------------------------------------------------------------------------

    pub fn get_refresh(&self, token_hash: &str) -> StoreResult<Option<RefreshRecord>> {
        get_json(&self.refresh, token_hash.as_bytes())
    }

    pub fn put_refresh(&self, token_hash: &str, record: &RefreshRecord) -> StoreResult<()> {
        put_json(&self.refresh, token_hash.as_bytes(), record)
    }

    pub fn refresh_records(&self) -> StoreResult<Vec<(String, RefreshRecord)>> {
        let mut out = Vec::new();
        for entry in self.refresh.iter() {
            let (k, v) = entry?;
            let hash = String::from_utf8_lossy(&k).to_string();
            out.push((hash, serde_json::from_slice(&v)?));
        }
        Ok(out)
    }

    /// Drop refresh records that expired before `now`. Returns the number removed.
    pub fn purge_expired_refresh(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let expired: Vec<String> = self
            .refresh_records()?
            .into_iter()
            .filter(|(_, r)| r.expires <= now)
            .map(|(h, _)| h)
            .collect();
        for hash in &expired {
            self.refresh.remove(hash.as_bytes())?;
        }
        Ok(expired.len())
    }
}
