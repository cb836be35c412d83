//! Write pipeline: stage bytes in `tmp/`, verify, then place by digest.
//!
//! A [`Writer`] is a staged pipeline driven by [`std::io::Write`]:
//! bytes flow through the hash stage into a temp file, and
//! [`Writer::commit`] runs the size-check, integrity-check and placement
//! stages in that order. Dropping a writer without committing cancels it
//! and removes the temp file.
//!
//! A writer holds the cache root lock shared from creation until it is
//! committed or dropped, so a verify pass never sweeps its temp file or the
//! content it is about to place.
//!
//! The pipeline never touches the index; see [`crate::Cache`] for the
//! keyed layer on top.

use crate::content::{self, Placement};
use crate::error::{Error, Result};
use crate::integrity::{Algorithm, Integrity, IntegrityChecker, IntegrityOpts};
use crate::lock::{self, CacheLock};
use crate::owner::FixOwnership;
use serde_json::Value;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Directory holding in-flight temp files.
pub fn tmp_dir(root: &Path) -> PathBuf {
    root.join("tmp")
}

/// Options for a write.
#[derive(Clone, Default)]
pub struct WriteOpts {
    pub(crate) algorithms: Vec<Algorithm>,
    pub(crate) integrity: Option<Integrity>,
    pub(crate) size: Option<u64>,
    pub(crate) metadata: Value,
    pub(crate) time: Option<i64>,
    pub(crate) owner: Option<Arc<dyn FixOwnership>>,
}

impl WriteOpts {
    /// Default options: hash with sha512, no expectations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also hash with `algorithm`.
    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        if !self.algorithms.contains(&algorithm) {
            self.algorithms.push(algorithm);
        }
        self
    }

    /// Hash with every algorithm in `algorithms`.
    pub fn algorithms(self, algorithms: impl IntoIterator<Item = Algorithm>) -> Self {
        algorithms.into_iter().fold(self, WriteOpts::algorithm)
    }

    /// Expected integrity; the write fails with `EINTEGRITY` unless it matches.
    pub fn integrity(mut self, integrity: Integrity) -> Self {
        self.integrity = Some(integrity);
        self
    }

    /// Expected size; the write fails with `EBADSIZE` unless it matches.
    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Metadata for the index entry written by keyed puts.
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Timestamp override for the index entry written by keyed puts.
    pub fn time(mut self, time: i64) -> Self {
        self.time = Some(time);
        self
    }

    /// Ownership hook for created paths.
    pub fn owner(mut self, owner: Arc<dyn FixOwnership>) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Algorithms to hash with. Without an explicit choice, an expected
    /// integrity decides, falling back to the default algorithm.
    fn hash_algorithms(&self) -> Vec<Algorithm> {
        let mut algorithms = self.algorithms.clone();
        if let Some(expected) = &self.integrity {
            for algorithm in expected.algorithms() {
                if !algorithms.contains(&algorithm) {
                    algorithms.push(algorithm);
                }
            }
        }
        if algorithms.is_empty() {
            algorithms.push(Algorithm::default());
        }
        algorithms
    }
}

/// Result of a committed write.
#[derive(Debug, Clone, PartialEq)]
pub struct Written {
    pub integrity: Integrity,
    pub size: u64,
}

enum State {
    /// Bytes are being hashed into a temp file.
    Staging {
        tmp: NamedTempFile,
        hasher: IntegrityOpts,
        written: u64,
    },
    /// Verified content already exists; input is only hashed and compared.
    Existing {
        existing: Written,
        checker: IntegrityChecker,
        written: u64,
    },
}

/// Streaming content writer.
pub struct Writer {
    root: PathBuf,
    opts: WriteOpts,
    state: Option<State>,
    _lock: Arc<CacheLock>,
}

impl Writer {
    /// Start a write under `root`.
    ///
    /// When `opts` carries an expected integrity whose content already
    /// exists and still verifies, nothing is staged. The input is still
    /// hashed, and [`Writer::commit`] returns the existing content only if
    /// the input matches it.
    ///
    /// Fails with `ELOCKED` if a verify pass holds the root for too long.
    pub fn new(root: &Path, opts: WriteOpts) -> Result<Self> {
        let lock = lock::share_root(root)?;
        Self::with_lock(root, opts, Arc::new(lock))
    }

    /// Start a write under a root lock the caller already holds shared.
    pub(crate) fn with_lock(root: &Path, opts: WriteOpts, lock: Arc<CacheLock>) -> Result<Self> {
        if let Some(existing) = existing_content(root, &opts)? {
            tracing::debug!(integrity = %existing.integrity, "content already cached, skipping staging");
            let checker = IntegrityChecker::new(existing.integrity.clone());
            return Ok(Writer {
                root: root.to_path_buf(),
                opts,
                state: Some(State::Existing {
                    existing,
                    checker,
                    written: 0,
                }),
                _lock: lock,
            });
        }

        let dir = tmp_dir(root);
        fs::create_dir_all(&dir)?;
        let tmp = NamedTempFile::new_in(&dir)?;
        let hasher = opts
            .hash_algorithms()
            .into_iter()
            .fold(IntegrityOpts::new(), IntegrityOpts::algorithm);

        Ok(Writer {
            root: root.to_path_buf(),
            opts,
            state: Some(State::Staging {
                tmp,
                hasher,
                written: 0,
            }),
            _lock: lock,
        })
    }

    /// Bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        match &self.state {
            Some(State::Staging { written, .. } | State::Existing { written, .. }) => *written,
            None => 0,
        }
    }

    /// Finish the write: check size, check integrity, then place the file.
    pub fn commit(mut self) -> Result<Written> {
        match self.state.take() {
            Some(State::Existing {
                existing,
                checker,
                written,
            }) => self.confirm(existing, checker, written),
            Some(State::Staging {
                tmp,
                hasher,
                written,
            }) => self.finish(tmp, hasher, written),
            None => Err(Error::NoData),
        }
    }

    fn confirm(&self, existing: Written, checker: IntegrityChecker, written: u64) -> Result<Written> {
        if let Some(expected) = self.opts.size
            && expected != written
        {
            return Err(Error::size_mismatch(expected, written));
        }
        checker.result()?;
        tracing::debug!(integrity = %existing.integrity, size = written, "input matches cached content");
        Ok(existing)
    }

    fn finish(&self, mut tmp: NamedTempFile, hasher: IntegrityOpts, written: u64) -> Result<Written> {
        if let Err(err) = tmp.flush() {
            content::discard_temp(tmp);
            return Err(err.into());
        }
        let computed = hasher.result();

        if let Some(expected) = self.opts.size
            && expected != written
        {
            content::discard_temp(tmp);
            return Err(Error::size_mismatch(expected, written));
        }
        if let Some(expected) = &self.opts.integrity
            && expected.matches(&computed).is_none()
        {
            content::discard_temp(tmp);
            return Err(Error::integrity_mismatch(expected, &computed));
        }
        if written == 0 {
            content::discard_temp(tmp);
            return Err(Error::NoData);
        }

        let dest = content::path(&self.root, &computed);
        if content::place(tmp, &dest)? == Placement::Written
            && let Some(owner) = &self.opts.owner
        {
            if let Some(shard) = dest.parent() {
                owner.fix(shard)?;
            }
            owner.fix(&dest)?;
        }

        tracing::debug!(integrity = %computed, size = written, "content written");
        Ok(Written {
            integrity: computed,
            size: written,
        })
    }
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.state {
            Some(State::Staging {
                tmp,
                hasher,
                written,
            }) => {
                let n = tmp.write(buf)?;
                hasher.input(&buf[..n]);
                *written += n as u64;
                Ok(n)
            }
            Some(State::Existing {
                checker, written, ..
            }) => {
                checker.input(buf);
                *written += buf.len() as u64;
                Ok(buf.len())
            }
            None => Ok(0),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.state {
            Some(State::Staging { tmp, .. }) => tmp.flush(),
            _ => Ok(()),
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Some(State::Staging { tmp, written, .. }) = self.state.take() {
            tracing::debug!(bytes = written, "write abandoned, removing temp file");
            content::discard_temp(tmp);
        }
    }
}

/// Existing content matching the expected integrity, if it still verifies.
///
/// Content that exists but fails verification is removed so the pending
/// write can replace it.
fn existing_content(root: &Path, opts: &WriteOpts) -> Result<Option<Written>> {
    let Some(expected) = &opts.integrity else {
        return Ok(None);
    };
    let mut reader = match content::open(root, expected, opts.size) {
        Ok(reader) => reader,
        Err(err) if err.is_not_found() => return Ok(None),
        Err(err) => return Err(err),
    };
    io::copy(&mut reader, &mut io::sink())?;
    let size = reader.bytes_read();
    match reader.check() {
        Ok(_) => Ok(Some(Written {
            integrity: expected.clone(),
            size,
        })),
        Err(Error::IntegrityMismatch { .. }) => {
            tracing::warn!(integrity = %expected, "cached content failed verification, replacing it");
            content::remove(root, expected)?;
            Ok(None)
        }
        Err(Error::SizeMismatch { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Write a buffer to the content store.
pub fn write_bytes(root: &Path, data: &[u8], opts: &WriteOpts) -> Result<Written> {
    let mut writer = Writer::new(root, opts.clone())?;
    writer.write_all(data)?;
    writer.commit()
}

/// Stream a reader to the content store.
pub fn write_from_reader<R: Read>(root: &Path, mut reader: R, opts: &WriteOpts) -> Result<Written> {
    let mut writer = Writer::new(root, opts.clone())?;
    io::copy(&mut reader, &mut writer)?;
    writer.commit()
}
