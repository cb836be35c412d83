//! Keyed cache handle composing the content store and the entry index.

use crate::content::{self, Reader};
use crate::error::{Error, Result};
use crate::index::{self, CompactOpts, Entry, InsertOpts};
use crate::integrity::{Algorithm, Integrity};
use crate::lock::{self, CacheLock};
use crate::memo::Memo;
use crate::owner::{FixOwnership, NoopOwnership};
use crate::verify::{self, VerifyOpts, VerifyStats};
use crate::write::{WriteOpts, Writer, Written};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Data and metadata returned by [`Cache::get`].
#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    pub data: Vec<u8>,
    pub integrity: Integrity,
    pub metadata: Value,
    pub size: u64,
}

/// A handle on a cache directory.
///
/// Handles are cheap to clone and hold no open files. Any number of
/// handles, threads and processes may use the same root at once.
#[derive(Clone)]
pub struct Cache {
    root: PathBuf,
    memo: Option<Arc<Memo>>,
    owner: Arc<dyn FixOwnership>,
    algorithm: Option<Algorithm>,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("root", &self.root)
            .field("memo", &self.memo)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl Cache {
    /// Open a cache rooted at `root`. Directories are created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Cache {
            root: root.into(),
            memo: None,
            owner: Arc::new(NoopOwnership),
            algorithm: None,
        }
    }

    /// Consult and populate `memo` on reads.
    pub fn with_memo(mut self, memo: Arc<Memo>) -> Self {
        self.memo = Some(memo);
        self
    }

    /// Normalize ownership of created files with `owner`.
    pub fn with_owner(mut self, owner: Arc<dyn FixOwnership>) -> Self {
        self.owner = owner;
        self
    }

    /// Hash new content with `algorithm` unless a write says otherwise.
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    /// The cache root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write_opts(&self, opts: WriteOpts) -> WriteOpts {
        let mut opts = opts;
        if let Some(algorithm) = self.algorithm
            && opts.algorithms.is_empty()
            && opts.integrity.is_none()
        {
            opts = opts.algorithm(algorithm);
        }
        if opts.owner.is_none() {
            opts = opts.owner(Arc::clone(&self.owner));
        }
        opts
    }

    /// Append the entry for a committed write. The caller holds the root
    /// lock from before the write until after this returns.
    fn insert_entry(&self, key: &str, written: &Written, opts: &WriteOpts) -> Result<Entry> {
        let mut insert = InsertOpts::new()
            .size(written.size)
            .metadata(opts.metadata.clone())
            .owner(Arc::clone(&self.owner));
        if let Some(time) = opts.time {
            insert = insert.time(time);
        }
        index::append(&self.root, key, Some(&written.integrity), &insert)
    }

    /// Store `data` under `key`.
    pub fn put(&self, key: &str, data: &[u8]) -> Result<Written> {
        self.put_with(key, data, WriteOpts::new())
    }

    /// Store `data` under `key` with explicit options.
    ///
    /// `data` is hashed even when content for an expected integrity already
    /// exists, so a mismatch fails with `EINTEGRITY` before any entry is
    /// written.
    pub fn put_with(&self, key: &str, data: &[u8], opts: WriteOpts) -> Result<Written> {
        let opts = self.write_opts(opts);
        let lock = Arc::new(lock::share_root(&self.root)?);
        let mut writer = Writer::with_lock(&self.root, opts.clone(), lock)?;
        writer.write_all(data)?;
        let written = writer.commit()?;
        let entry = self.insert_entry(key, &written, &opts)?;
        if let Some(memo) = &self.memo {
            // `data` hashed to `written.integrity`, so it is the stored content.
            memo.put_entry(&self.root, &entry, data);
        }
        Ok(written)
    }

    /// Start a streaming write for `key`.
    ///
    /// The returned writer holds the cache root lock shared until it is
    /// committed or dropped; verify waits for it.
    pub fn put_stream(&self, key: &str, opts: WriteOpts) -> Result<KeyedWriter> {
        let opts = self.write_opts(opts);
        let lock = Arc::new(lock::share_root(&self.root)?);
        let writer = Writer::with_lock(&self.root, opts.clone(), Arc::clone(&lock))?;
        Ok(KeyedWriter {
            cache: self.clone(),
            key: key.to_string(),
            opts,
            writer,
            _lock: lock,
        })
    }

    /// Stream `reader` into the cache under `key`.
    pub fn put_reader<R: Read>(&self, key: &str, mut reader: R, opts: WriteOpts) -> Result<Written> {
        let mut writer = self.put_stream(key, opts)?;
        io::copy(&mut reader, &mut writer)?;
        writer.commit()
    }

    /// Read the data stored under `key`, verified against its entry.
    pub fn get(&self, key: &str) -> Result<Data> {
        if let Some(memo) = &self.memo
            && let Some((entry, data)) = memo.get_entry(&self.root, key)
            && let Some(integrity) = entry.integrity
        {
            return Ok(Data {
                data,
                integrity,
                metadata: entry.metadata,
                size: entry.size,
            });
        }

        let entry = index::find(&self.root, key)?.ok_or_else(|| Error::entry_not_found(key))?;
        let Some(integrity) = entry.integrity.clone() else {
            return Err(Error::entry_not_found(key));
        };
        let data = content::read(&self.root, &integrity, Some(entry.size))?;
        if let Some(memo) = &self.memo {
            memo.put_entry(&self.root, &entry, &data);
        }
        Ok(Data {
            data,
            integrity,
            metadata: entry.metadata,
            size: entry.size,
        })
    }

    /// Read content by digest, bypassing the index.
    pub fn get_by_digest(&self, sri: &Integrity) -> Result<Vec<u8>> {
        if let Some(memo) = &self.memo
            && let Some(data) = memo.get_digest(&self.root, sri)
        {
            return Ok(data);
        }
        let data = content::read(&self.root, sri, None)?;
        if let Some(memo) = &self.memo {
            memo.put_digest(&self.root, sri, &data);
        }
        Ok(data)
    }

    /// Open the content under `key` for streaming. Call [`Reader::check`]
    /// once done to verify it.
    pub fn open_reader(&self, key: &str) -> Result<(Entry, Reader)> {
        let entry = index::find(&self.root, key)?.ok_or_else(|| Error::entry_not_found(key))?;
        let integrity = entry
            .integrity
            .as_ref()
            .ok_or_else(|| Error::entry_not_found(key))?;
        let reader = content::open(&self.root, integrity, Some(entry.size))?;
        Ok((entry, reader))
    }

    /// Current entry for `key`, if any.
    pub fn get_info(&self, key: &str) -> Result<Option<Entry>> {
        index::find(&self.root, key)
    }

    /// Metadata of the content file for `sri`, if it exists.
    pub fn has_content(&self, sri: &Integrity) -> Result<Option<fs::Metadata>> {
        content::exists(&self.root, sri)
    }

    /// All live entries.
    pub fn ls(&self) -> Result<BTreeMap<String, Entry>> {
        index::ls(&self.root)
    }

    /// Lazily list live entries.
    pub fn ls_iter(&self) -> Result<impl Iterator<Item = Result<Entry>>> {
        index::ls_iter(&self.root)
    }

    fn forget(&self, key: &str) {
        if let Some(memo) = &self.memo {
            memo.forget_entry(&self.root, key);
        }
    }

    /// Delete `key` by appending a tombstone. Content is left for verify.
    pub fn remove_entry(&self, key: &str) -> Result<()> {
        self.forget(key);
        index::delete(&self.root, key, false)
    }

    /// Delete the whole bucket holding `key`, including any other keys
    /// that share it.
    pub fn remove_entry_fully(&self, key: &str) -> Result<()> {
        if let Some(memo) = &self.memo {
            memo.clear();
        }
        index::delete(&self.root, key, true)
    }

    /// Delete content by digest. Entries pointing at it become misses.
    pub fn remove_content(&self, sri: &Integrity) -> Result<bool> {
        if let Some(memo) = &self.memo {
            memo.clear();
        }
        content::remove(&self.root, sri)
    }

    /// Delete every entry and all content.
    pub fn remove_all(&self) -> Result<()> {
        if let Some(memo) = &self.memo {
            memo.clear();
        }
        for dir in [index::index_dir(&self.root), content::content_dir(&self.root)] {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        tracing::debug!(root = %self.root.display(), "removed all cache data");
        Ok(())
    }

    /// Compact the bucket holding `key`. See [`index::compact`].
    pub fn compact<F>(&self, key: &str, matches: F, opts: &CompactOpts<'_>) -> Result<Vec<Entry>>
    where
        F: Fn(&Entry, &Entry) -> bool,
    {
        self.forget(key);
        index::compact(&self.root, key, matches, opts)
    }

    /// Run a verify/GC pass. See [`verify::verify`].
    pub fn verify(&self, opts: VerifyOpts<'_>) -> Result<VerifyStats> {
        let mut opts = opts;
        if opts.owner.is_none() {
            opts.owner = Some(Arc::clone(&self.owner));
        }
        let stats = verify::verify(&self.root, &opts);
        if let Some(memo) = &self.memo {
            memo.clear();
        }
        stats
    }

    /// Time of the last completed verify run.
    pub fn last_verified(&self) -> Result<Option<DateTime<Utc>>> {
        verify::last_run(&self.root)
    }
}

/// Streaming write that records an index entry on commit.
///
/// Dropping it without committing leaves neither content nor entry behind.
pub struct KeyedWriter {
    cache: Cache,
    key: String,
    opts: WriteOpts,
    writer: Writer,
    _lock: Arc<CacheLock>,
}

impl KeyedWriter {
    /// Commit the content and append the entry.
    pub fn commit(self) -> Result<Written> {
        let KeyedWriter {
            cache,
            key,
            opts,
            writer,
            _lock: lock,
        } = self;
        let written = writer.commit()?;
        cache.forget(&key);
        cache.insert_entry(&key, &written, &opts)?;
        drop(lock);
        Ok(written)
    }
}

impl Write for KeyedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
