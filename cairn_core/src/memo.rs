//! In-memory read-through memoization.
//!
//! A [`Memo`] is created explicitly by the caller and attached to one or
//! more [`Cache`](crate::Cache) handles. It is only ever a shortcut: the
//! disk is authoritative, and clearing the memo (or never attaching one)
//! changes performance, not results.

use crate::index::Entry;
use crate::integrity::{Algorithm, Integrity};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EntryKey {
    root: PathBuf,
    key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DigestKey {
    root: PathBuf,
    digest: String,
    algorithm: Algorithm,
}

#[derive(Default)]
struct MemoState {
    entries: HashMap<EntryKey, (Entry, Vec<u8>)>,
    digests: HashMap<DigestKey, Vec<u8>>,
}

/// Shared memoization map keyed by `(root, key)` and `(root, digest, algorithm)`.
#[derive(Default)]
pub struct Memo {
    state: Mutex<MemoState>,
}

impl Memo {
    /// Create an empty memo.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a memoized entry and its data by key.
    pub fn get_entry(&self, root: &Path, key: &str) -> Option<(Entry, Vec<u8>)> {
        let lookup = EntryKey {
            root: root.to_path_buf(),
            key: key.to_string(),
        };
        self.state().entries.get(&lookup).cloned()
    }

    /// Look up memoized data by any hash of `sri`.
    pub fn get_digest(&self, root: &Path, sri: &Integrity) -> Option<Vec<u8>> {
        let state = self.state();
        sri.hashes().iter().find_map(|hash| {
            let lookup = DigestKey {
                root: root.to_path_buf(),
                digest: hash.to_string(),
                algorithm: hash.algorithm,
            };
            state.digests.get(&lookup).cloned()
        })
    }

    /// Remember an entry and its data; the data is also memoized by digest.
    pub fn put_entry(&self, root: &Path, entry: &Entry, data: &[u8]) {
        if let Some(sri) = &entry.integrity {
            self.put_digest(root, sri, data);
        }
        let key = EntryKey {
            root: root.to_path_buf(),
            key: entry.key.clone(),
        };
        self.state()
            .entries
            .insert(key, (entry.clone(), data.to_vec()));
    }

    /// Remember data by digest.
    pub fn put_digest(&self, root: &Path, sri: &Integrity, data: &[u8]) {
        let mut state = self.state();
        for hash in sri.hashes() {
            let key = DigestKey {
                root: root.to_path_buf(),
                digest: hash.to_string(),
                algorithm: hash.algorithm,
            };
            state.digests.insert(key, data.to_vec());
        }
    }

    /// Forget the memoized entry for one key.
    pub fn forget_entry(&self, root: &Path, key: &str) {
        let lookup = EntryKey {
            root: root.to_path_buf(),
            key: key.to_string(),
        };
        self.state().entries.remove(&lookup);
    }

    /// Forget everything.
    pub fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.digests.clear();
    }

    /// Number of memoized keys plus memoized digests.
    pub fn len(&self) -> usize {
        let state = self.state();
        state.entries.len() + state.digests.len()
    }

    /// True when nothing is memoized.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Memo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memo").field("len", &self.len()).finish()
    }
}
