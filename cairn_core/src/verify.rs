//! Verify/GC: reclaim orphaned and corrupt content, then rebuild the index.
//!
//! The pass holds `<root>/_verify.lock` exclusively for its whole duration.
//! Writers hold the same lock shared, so no put, insert or compaction runs
//! while it does. It runs in two phases:
//!
//! 1. Content sweep. Every file under `content/` that no live entry
//!    references is deleted. Referenced files are re-hashed and deleted if
//!    they no longer match their address. If any bucket could not be read,
//!    unreferenced files are kept for this run.
//! 2. Index rebuild. Each bucket is rewritten to hold only the latest live
//!    entry per key whose content still exists with the recorded size and
//!    which the caller's filter accepts. Buckets left with nothing are
//!    truncated, not removed.
//!
//! Afterwards `tmp/` is emptied and `_lastverified` records the time.

use crate::content;
use crate::error::{Error, Result};
use crate::index::{self, Entry};
use crate::integrity::{Hash, Integrity};
use crate::lock::{self, CacheLock, process_lock_for_path};
use crate::owner::FixOwnership;
use crate::write::tmp_dir;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

/// Lock file serializing verify runs against each other and against writers.
pub fn lock_path(root: &Path) -> PathBuf {
    lock::root_lock_path(root)
}

/// Marker file holding the last completed run, in epoch milliseconds.
pub fn last_verified_path(root: &Path) -> PathBuf {
    root.join("_lastverified")
}

/// Options for [`verify`].
#[derive(Default)]
pub struct VerifyOpts<'a> {
    /// Entries this rejects are dropped from the index and stop keeping
    /// their content alive.
    pub filter: Option<&'a dyn Fn(&Entry) -> bool>,
    /// How long to wait for a concurrent run. Zero fails immediately.
    pub lock_timeout: Duration,
    /// Report what would change without deleting or rewriting anything.
    pub dry_run: bool,
    /// Ownership hook for rewritten buckets.
    pub owner: Option<Arc<dyn FixOwnership>>,
}

/// Per-phase durations in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunTime {
    pub garbage_collect: u64,
    pub rebuild_index: u64,
    pub clean_tmp: u64,
    pub total: u64,
}

/// Statistics from a verify run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyStats {
    /// Referenced content files that re-hashed correctly.
    pub verified_content: u64,
    /// Content files deleted (orphaned or corrupt).
    pub reclaimed_count: u64,
    /// Bytes freed by deleted content files.
    pub reclaimed_size: u64,
    /// Referenced content files that failed to re-hash.
    pub bad_content_count: u64,
    /// Bytes of content kept.
    pub kept_size: u64,
    /// Entries dropped because their content is gone.
    pub missing_content: u64,
    /// Entries dropped for any reason.
    pub rejected_entries: u64,
    /// Content files that could not be inspected.
    pub rejected_content: u64,
    /// Entries left in the index.
    pub total_entries: u64,
    pub run_time: RunTime,
}

/// Live entries of one bucket, as read before the sweep.
struct Bucket {
    path: PathBuf,
    entries: Vec<Entry>,
}

/// Run a full verify/GC pass over `root`.
pub fn verify(root: &Path, opts: &VerifyOpts<'_>) -> Result<VerifyStats> {
    run(root, opts, index::bucket_live_entries)
}

fn run<L>(root: &Path, opts: &VerifyOpts<'_>, load: L) -> Result<VerifyStats>
where
    L: Fn(&Path, &Path) -> Result<Vec<Entry>>,
{
    let started = Instant::now();
    let _lock = CacheLock::acquire(&lock_path(root), opts.lock_timeout)?;
    tracing::debug!(root = %root.display(), dry_run = opts.dry_run, "verify started");

    let mut stats = VerifyStats::default();

    let phase = Instant::now();
    let (buckets, complete) = load_buckets(root, load, &mut stats)?;
    if !complete {
        tracing::warn!(root = %root.display(), "index not fully readable, keeping unreferenced content");
    }
    let live = live_hashes(&buckets, opts);
    let removed = sweep_content(root, &live, complete, opts, &mut stats)?;
    stats.run_time.garbage_collect = elapsed_ms(phase);

    let phase = Instant::now();
    rebuild_index(root, &buckets, &removed, opts, &mut stats)?;
    stats.run_time.rebuild_index = elapsed_ms(phase);

    let phase = Instant::now();
    if !opts.dry_run {
        clean_tmp(root)?;
        fs::write(
            last_verified_path(root),
            Utc::now().timestamp_millis().to_string(),
        )?;
    }
    stats.run_time.clean_tmp = elapsed_ms(phase);
    stats.run_time.total = elapsed_ms(started);

    tracing::debug!(
        reclaimed = stats.reclaimed_count,
        reclaimed_size = stats.reclaimed_size,
        bad_content = stats.bad_content_count,
        rejected_entries = stats.rejected_entries,
        total_entries = stats.total_entries,
        "verify finished"
    );
    Ok(stats)
}

/// Time of the last completed verify run, if any.
pub fn last_run(root: &Path) -> Result<Option<DateTime<Utc>>> {
    let raw = match fs::read_to_string(last_verified_path(root)) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let parsed = raw
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis);
    if parsed.is_none() {
        tracing::debug!(contents = raw.trim(), "unreadable last-verified marker");
    }
    Ok(parsed)
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Readable buckets, and whether every bucket was readable.
fn load_buckets<L>(root: &Path, load: L, stats: &mut VerifyStats) -> Result<(Vec<Bucket>, bool)>
where
    L: Fn(&Path, &Path) -> Result<Vec<Entry>>,
{
    let mut buckets = Vec::new();
    let mut complete = true;
    for path in index::bucket_files(root)? {
        match load(root, &path) {
            Ok(entries) => buckets.push(Bucket { path, entries }),
            Err(err) => {
                tracing::warn!(bucket = %path.display(), error = %err, "skipping unreadable index bucket");
                stats.rejected_entries += 1;
                complete = false;
            }
        }
    }
    Ok((buckets, complete))
}

fn accepted(entry: &Entry, opts: &VerifyOpts<'_>) -> bool {
    opts.filter.is_none_or(|filter| filter(entry))
}

/// Every hash referenced by an accepted live entry.
fn live_hashes(buckets: &[Bucket], opts: &VerifyOpts<'_>) -> HashSet<Hash> {
    buckets
        .iter()
        .flat_map(|bucket| bucket.entries.iter())
        .filter(|entry| accepted(entry, opts))
        .filter_map(|entry| entry.integrity.as_ref())
        .flat_map(|sri| sri.hashes().iter().cloned())
        .collect()
}

fn delete_file(path: &Path, dry_run: bool) -> std::io::Result<()> {
    if dry_run {
        return Ok(());
    }
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Phase one. Returns the hashes whose content was (or would be) deleted.
///
/// Unreferenced files are only reclaimed when `reclaim_orphans` is set.
fn sweep_content(
    root: &Path,
    live: &HashSet<Hash>,
    reclaim_orphans: bool,
    opts: &VerifyOpts<'_>,
    stats: &mut VerifyStats,
) -> Result<HashSet<Hash>> {
    let mut removed = HashSet::new();
    let dir = content::content_dir(root);
    match fs::metadata(&dir) {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(removed),
        Err(err) => return Err(err.into()),
    }

    for entry in WalkDir::new(&dir).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => return Err(err.into()),
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable content path");
                stats.rejected_content += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable content file");
                stats.rejected_content += 1;
                continue;
            }
        };

        let hash = match content::hash_from_path(root, path) {
            Some(hash) if live.contains(&hash) => hash,
            _ if !reclaim_orphans => continue,
            orphan => {
                match delete_file(path, opts.dry_run) {
                    Ok(()) => {
                        tracing::debug!(path = %path.display(), size, "reclaimed orphaned content");
                        stats.reclaimed_count += 1;
                        stats.reclaimed_size += size;
                        removed.extend(orphan);
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "failed to remove orphaned content");
                        stats.rejected_content += 1;
                    }
                }
                continue;
            }
        };

        let verdict = fs::File::open(path)
            .map_err(Error::from)
            .and_then(|file| Integrity::from(hash.clone()).check_reader(file));
        match verdict {
            Ok(_) => {
                stats.verified_content += 1;
                stats.kept_size += size;
            }
            Err(Error::IntegrityMismatch { .. }) => {
                tracing::warn!(path = %path.display(), "content failed verification, removing it");
                stats.bad_content_count += 1;
                match delete_file(path, opts.dry_run) {
                    Ok(()) => {
                        stats.reclaimed_count += 1;
                        stats.reclaimed_size += size;
                        removed.insert(hash);
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "failed to remove corrupt content");
                        stats.rejected_content += 1;
                    }
                }
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "could not verify content");
                stats.rejected_content += 1;
            }
        }
    }

    if !opts.dry_run {
        remove_empty_dirs(&dir);
    }
    Ok(removed)
}

/// Remove now-empty algorithm and shard directories below `dir`.
fn remove_empty_dirs(dir: &Path) {
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_dir() {
            // Fails harmlessly when the directory still has files.
            let _ = fs::remove_dir(entry.path());
        }
    }
}

/// Size of the first surviving content file for `sri`.
fn content_size(root: &Path, sri: &Integrity, removed: &HashSet<Hash>) -> Result<Option<u64>> {
    for hash in sri.hashes() {
        if removed.contains(hash) {
            continue;
        }
        match fs::metadata(content::hash_path(root, hash)) {
            Ok(meta) => return Ok(Some(meta.len())),
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(None)
}

/// Phase two.
fn rebuild_index(
    root: &Path,
    buckets: &[Bucket],
    removed: &HashSet<Hash>,
    opts: &VerifyOpts<'_>,
    stats: &mut VerifyStats,
) -> Result<()> {
    for bucket in buckets {
        let mut kept = Vec::new();
        for entry in &bucket.entries {
            let Some(sri) = &entry.integrity else {
                continue;
            };
            if !accepted(entry, opts) {
                stats.rejected_entries += 1;
                continue;
            }
            match content_size(root, sri, removed) {
                Ok(Some(size)) if size == entry.size => kept.push(entry.clone()),
                Ok(Some(size)) => {
                    tracing::debug!(key = %entry.key, recorded = entry.size, actual = size, "dropping entry with wrong size");
                    stats.rejected_entries += 1;
                }
                Ok(None) => {
                    stats.rejected_entries += 1;
                    stats.missing_content += 1;
                }
                Err(err) => {
                    tracing::warn!(key = %entry.key, error = %err, "could not stat entry content");
                    stats.rejected_entries += 1;
                }
            }
        }
        stats.total_entries += kept.len() as u64;

        if opts.dry_run {
            continue;
        }
        let _guard = process_lock_for_path(&bucket.path)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        index::write_bucket(root, &bucket.path, &kept)?;
        if let Some(owner) = &opts.owner {
            owner.fix(&bucket.path)?;
        }
    }
    Ok(())
}

fn clean_tmp(root: &Path) -> Result<()> {
    match fs::remove_dir_all(tmp_dir(root)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
