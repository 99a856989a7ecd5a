//! Snapshot Cursor Manager
//!
//! Paginated iteration over big collections. Opening a cursor freezes a copy
//! of the member index in most-recent-write order, so later mutations to
//! the collection never show through:
//!
//! ```text
//! writes:   store a, store b, store c, store a      (a moves to the tail)
//! index:    b c a
//! forward:  [b c] [a] done
//! backward: [a c] [b] done
//! ```
//!
//! A cursor that reported `done` is released; further calls on it fail with
//! `UnknownCursor`, as do calls on closed or never-opened ids.

use crate::backend::{CursorId, CursorPage};
use crate::error::StorageError;
use crate::types::{Entity, Version};
use ahash::AHashMap;
use tracing::debug;

#[derive(Debug)]
struct Cursor {
    snapshot_version: Version,
    index: Vec<Entity>,
    position: usize,
    page_size: usize,
    forward: bool,
}

#[derive(Debug, Default)]
pub struct CursorManager {
    cursors: AHashMap<CursorId, Cursor>,
    next_id: CursorId,
}

impl CursorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freezes `members` (oldest write first) at `version`.
    pub fn open(
        &mut self,
        members: Vec<Entity>,
        version: Version,
        page_size: usize,
        forward: bool,
    ) -> (CursorId, Version) {
        self.next_id += 1;
        let id = self.next_id;
        let mut index = members;
        if !forward {
            index.reverse();
        }
        debug!(
            cursor = id,
            version,
            members = index.len(),
            forward,
            "opened cursor"
        );
        self.cursors.insert(
            id,
            Cursor {
                snapshot_version: version,
                index,
                position: 0,
                page_size: page_size.max(1),
                forward,
            },
        );
        (id, version)
    }

    pub fn next(&mut self, id: CursorId) -> Result<CursorPage, StorageError> {
        let cursor = self
            .cursors
            .get_mut(&id)
            .ok_or(StorageError::UnknownCursor(id))?;

        if cursor.position >= cursor.index.len() {
            self.cursors.remove(&id);
            debug!(cursor = id, "cursor exhausted and released");
            return Ok(CursorPage {
                items: Vec::new(),
                done: true,
            });
        }

        let end = (cursor.position + cursor.page_size).min(cursor.index.len());
        let items = cursor.index[cursor.position..end].to_vec();
        cursor.position = end;
        Ok(CursorPage { items, done: false })
    }

    pub fn close(&mut self, id: CursorId) -> Result<(), StorageError> {
        self.cursors
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::UnknownCursor(id))
    }

    /// Snapshot version of a live cursor.
    pub fn version(&self, id: CursorId) -> Result<Version, StorageError> {
        self.cursors
            .get(&id)
            .map(|c| c.snapshot_version)
            .ok_or(StorageError::UnknownCursor(id))
    }

    pub fn is_forward(&self, id: CursorId) -> Option<bool> {
        self.cursors.get(&id).map(|c| c.forward)
    }

    pub fn open_count(&self) -> usize {
        self.cursors.len()
    }
}
