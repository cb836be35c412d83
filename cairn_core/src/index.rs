//! Entry index: append-only, hash-bucketed log mapping keys to content.
//!
//! Each key hashes to a bucket file `index/<sha256(key)>`. Every insert
//! appends one self-contained line:
//!
//! ```text
//! \n<sha256 hex of json>\t{"key":...,"integrity":...,"time":...,"size":...,"metadata":...}
//! ```
//!
//! Readers fold a bucket left to right and the last valid line for a key
//! wins. A line whose checksum does not match, or whose JSON does not have
//! the expected shape, is skipped. A torn append therefore damages only
//! itself. Buckets may hold several keys, so every read filters on the
//! exact key.

use crate::content;
use crate::error::Result;
use crate::integrity::Integrity;
use crate::lock::{self, process_lock_for_path};
use crate::owner::FixOwnership;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, PersistError};

/// A versioned record of a key's mapping to content.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// The exact (case-sensitive) key.
    pub key: String,
    /// Content digest, or `None` for a tombstone.
    pub integrity: Option<Integrity>,
    /// Content path derived from `integrity`.
    pub path: Option<PathBuf>,
    /// Milliseconds since the Unix epoch.
    pub time: i64,
    /// Content size in bytes.
    pub size: u64,
    /// Opaque caller data.
    pub metadata: Value,
}

impl Entry {
    /// True for a logical-delete marker.
    pub fn is_tombstone(&self) -> bool {
        self.integrity.is_none()
    }

    fn from_record(root: &Path, record: Record) -> Self {
        let path = record.integrity.as_ref().map(|sri| content::path(root, sri));
        Entry {
            key: record.key,
            integrity: record.integrity,
            path,
            time: record.time,
            size: record.size,
            metadata: record.metadata,
        }
    }

    fn to_record(&self) -> Record {
        Record {
            key: self.key.clone(),
            integrity: self.integrity.clone(),
            time: self.time,
            size: self.size,
            metadata: self.metadata.clone(),
        }
    }
}

/// On-disk shape of one bucket line.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    key: String,
    integrity: Option<Integrity>,
    time: i64,
    size: u64,
    #[serde(default)]
    metadata: Value,
}

/// Options for [`insert`].
#[derive(Clone, Default)]
pub struct InsertOpts {
    metadata: Value,
    size: u64,
    time: Option<i64>,
    owner: Option<Arc<dyn FixOwnership>>,
}

impl InsertOpts {
    /// Default options: no metadata, size 0, current time.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach opaque metadata.
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Record the content size.
    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Override the timestamp (milliseconds since the epoch).
    pub fn time(mut self, time: i64) -> Self {
        self.time = Some(time);
        self
    }

    /// Fix ownership of the bucket after appending.
    pub fn owner(mut self, owner: Arc<dyn FixOwnership>) -> Self {
        self.owner = Some(owner);
        self
    }
}

/// Directory holding all bucket files.
pub fn index_dir(root: &Path) -> PathBuf {
    root.join("index")
}

/// Hex SHA-256 of a key; the bucket file name.
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Checksum prefixed to each bucket line.
pub fn hash_entry(json: &str) -> String {
    hex::encode(Sha256::digest(json.as_bytes()))
}

/// Bucket file for `key`.
pub fn bucket_path(root: &Path, key: &str) -> PathBuf {
    index_dir(root).join(hash_key(key))
}

fn is_bucket_name(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

fn format_line(record: &Record) -> Result<String> {
    let json = serde_json::to_string(record)?;
    Ok(format!("\n{}\t{}", hash_entry(&json), json))
}

fn parse_line(line: &str) -> Option<Record> {
    let (checksum, json) = line.split_once('\t')?;
    if hash_entry(json) != checksum {
        return None;
    }
    serde_json::from_str(json).ok()
}

/// Every valid record in a bucket, in append order. A missing bucket is empty.
fn read_bucket(bucket: &Path) -> Result<Vec<Record>> {
    let file = match fs::File::open(bucket) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut records = Vec::new();
    for chunk in BufReader::new(file).split(b'\n') {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        match std::str::from_utf8(&chunk).ok().and_then(parse_line) {
            Some(record) => records.push(record),
            None => tracing::trace!(bucket = %bucket.display(), "skipping corrupt index line"),
        }
    }
    Ok(records)
}

/// Last record per key, keyed by first appearance.
fn fold_latest(records: Vec<Record>) -> Vec<Record> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut latest: Vec<Record> = Vec::new();
    for record in records {
        match slots.get(&record.key) {
            Some(&i) => latest[i] = record,
            None => {
                slots.insert(record.key.clone(), latest.len());
                latest.push(record);
            }
        }
    }
    latest
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Append an entry for `key`. `None` integrity records a tombstone.
///
/// Inserting the digest a key already maps to still appends a new line.
/// Holds the cache root lock shared while appending.
pub fn insert(
    root: &Path,
    key: &str,
    sri: Option<&Integrity>,
    opts: &InsertOpts,
) -> Result<Entry> {
    let _lock = lock::share_root(root)?;
    append(root, key, sri, opts)
}

/// [`insert`] for callers already holding the root lock.
pub(crate) fn append(
    root: &Path,
    key: &str,
    sri: Option<&Integrity>,
    opts: &InsertOpts,
) -> Result<Entry> {
    let bucket = bucket_path(root, key);
    let record = Record {
        key: key.to_string(),
        integrity: sri.cloned(),
        time: opts.time.unwrap_or_else(now_millis),
        size: opts.size,
        metadata: opts.metadata.clone(),
    };
    let line = format_line(&record)?;

    fs::create_dir_all(index_dir(root))?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&bucket)?;
    // One write per record keeps concurrent appends from interleaving.
    file.write_all(line.as_bytes())?;

    if let Some(owner) = &opts.owner {
        owner.fix(&bucket)?;
    }
    tracing::trace!(key, bucket = %bucket.display(), tombstone = sri.is_none(), "index insert");
    Ok(Entry::from_record(root, record))
}

/// Current entry for `key`, or `None` if absent or deleted.
pub fn find(root: &Path, key: &str) -> Result<Option<Entry>> {
    let latest = read_bucket(&bucket_path(root, key))?
        .into_iter()
        .rfind(|record| record.key == key);
    Ok(latest
        .filter(|record| record.integrity.is_some())
        .map(|record| Entry::from_record(root, record)))
}

/// Delete `key`.
///
/// By default a tombstone is appended. With `remove_fully` the whole bucket
/// file is removed, which also drops every other key that hashed into it.
pub fn delete(root: &Path, key: &str, remove_fully: bool) -> Result<()> {
    if remove_fully {
        let _lock = lock::share_root(root)?;
        match fs::remove_file(bucket_path(root, key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    } else {
        insert(root, key, None, &InsertOpts::new()).map(|_| ())
    }
}

/// Every bucket file under `index/`.
pub(crate) fn bucket_files(root: &Path) -> Result<Vec<PathBuf>> {
    let dir = index_dir(root);
    match fs::metadata(&dir) {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    }

    let mut buckets = Vec::new();
    for entry in walkdir::WalkDir::new(&dir).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file()
            && entry.file_name().to_str().is_some_and(is_bucket_name)
        {
            buckets.push(entry.into_path());
        }
    }
    Ok(buckets)
}

/// Live entries of one bucket (latest per key, tombstones dropped).
pub(crate) fn bucket_live_entries(root: &Path, bucket: &Path) -> Result<Vec<Entry>> {
    Ok(fold_latest(read_bucket(bucket)?)
        .into_iter()
        .filter(|record| record.integrity.is_some())
        .map(|record| Entry::from_record(root, record))
        .collect())
}

/// Lazily list live entries bucket by bucket.
pub fn ls_iter(root: &Path) -> Result<impl Iterator<Item = Result<Entry>>> {
    let root = root.to_path_buf();
    Ok(bucket_files(&root)?
        .into_iter()
        .flat_map(move |bucket| match bucket_live_entries(&root, &bucket) {
            Ok(entries) => entries.into_iter().map(Ok).collect::<Vec<_>>(),
            Err(err) => vec![Err(err)],
        }))
}

/// All live entries keyed by key.
pub fn ls(root: &Path) -> Result<BTreeMap<String, Entry>> {
    let mut out = BTreeMap::new();
    for entry in ls_iter(root)? {
        let entry = entry?;
        out.insert(entry.key.clone(), entry);
    }
    Ok(out)
}

/// Atomically replace a bucket with exactly `entries`.
pub(crate) fn write_bucket(root: &Path, bucket: &Path, entries: &[Entry]) -> Result<()> {
    let dir = index_dir(root);
    fs::create_dir_all(&dir)?;
    let mut tmp = NamedTempFile::new_in(&dir)?;

    let mut body = String::new();
    for entry in entries {
        body.push_str(&format_line(&entry.to_record())?);
    }
    if let Err(err) = tmp.write_all(body.as_bytes()).and_then(|_| tmp.flush()) {
        content::discard_temp(tmp);
        return Err(err.into());
    }

    match tmp.persist(bucket) {
        Ok(_) => Ok(()),
        Err(PersistError { error, file }) => {
            content::discard_temp(file);
            Err(error.into())
        }
    }
}

/// Options for [`compact`].
#[derive(Default)]
pub struct CompactOpts<'a> {
    /// Keep only entries this accepts. When set, tombstones are ordinary
    /// entries subject to the same test instead of deletion markers.
    pub validate_entry: Option<&'a dyn Fn(&Entry) -> bool>,
}

/// Rewrite the bucket holding `key`, dropping redundant entries.
///
/// Walking newest to oldest, an entry survives unless `matches(kept, entry)`
/// holds for a newer survivor with the same key. Without `validate_entry`,
/// a tombstone drops itself and every older entry of its key. Entries of
/// other keys sharing the bucket are compacted independently. Returns the
/// survivors in bucket order. A key without a bucket is left alone.
pub fn compact<F>(root: &Path, key: &str, matches: F, opts: &CompactOpts<'_>) -> Result<Vec<Entry>>
where
    F: Fn(&Entry, &Entry) -> bool,
{
    let bucket = bucket_path(root, key);
    let _lock = lock::share_root(root)?;
    let _guard = process_lock_for_path(&bucket)
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    match fs::metadata(&bucket) {
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    }
    let entries: Vec<Entry> = read_bucket(&bucket)?
        .into_iter()
        .map(|record| Entry::from_record(root, record))
        .collect();
    let before = entries.len();

    let mut deleted: HashSet<String> = HashSet::new();
    let mut kept: Vec<Entry> = Vec::new();
    for entry in entries.into_iter().rev() {
        if deleted.contains(&entry.key) {
            continue;
        }
        if entry.is_tombstone() && opts.validate_entry.is_none() {
            deleted.insert(entry.key.clone());
            continue;
        }
        let valid = opts.validate_entry.is_none_or(|validate| validate(&entry));
        let redundant = kept
            .iter()
            .any(|newer| newer.key == entry.key && matches(newer, &entry));
        if valid && !redundant {
            kept.push(entry);
        }
    }
    kept.reverse();

    write_bucket(root, &bucket, &kept)?;
    tracing::debug!(
        key,
        bucket = %bucket.display(),
        before,
        after = kept.len(),
        "compacted index bucket"
    );
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sri(data: &str) -> Integrity {
        Integrity::from_bytes(data.as_bytes())
    }

    fn append_raw(bucket: &Path, bytes: &[u8]) {
        fs::create_dir_all(bucket.parent().unwrap()).unwrap();
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(bucket)
            .unwrap();
        f.write_all(bytes).unwrap();
    }

    #[test]
    fn test_bucket_path() {
        let root = Path::new("/cache");
        let p = bucket_path(root, "hello");
        assert_eq!(
            p,
            Path::new(
                "/cache/index/2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
            )
        );
        // Keys are case-sensitive.
        assert_ne!(bucket_path(root, "Hello"), p);
    }

    #[test]
    fn test_line_format() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        insert(root, "k", Some(&sri("a")), &InsertOpts::new().size(1).time(42)).unwrap();

        let raw = fs::read_to_string(bucket_path(root, "k")).unwrap();
        assert!(raw.starts_with('\n'));
        let (checksum, json) = raw[1..].split_once('\t').unwrap();
        assert_eq!(checksum, hash_entry(json));
        let value: Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["key"], "k");
        assert_eq!(value["time"], 42);
        assert_eq!(value["size"], 1);
        assert_eq!(value["integrity"], sri("a").to_string());
    }

    #[test]
    fn test_insert_and_find() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let digest = sri("data");
        let inserted = insert(
            root,
            "key",
            Some(&digest),
            &InsertOpts::new().size(4).metadata(json!({"etag": "x"})),
        )
        .unwrap();
        assert_eq!(inserted.path.as_deref(), Some(content::path(root, &digest).as_path()));

        let found = find(root, "key").unwrap().unwrap();
        assert_eq!(found.key, "key");
        assert_eq!(found.size, 4);
        assert_eq!(found.metadata, json!({"etag": "x"}));
        assert_eq!(found.integrity.unwrap().to_string(), digest.to_string());

        assert!(find(root, "missing").unwrap().is_none());
    }

    #[test]
    fn test_last_write_wins() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        for (i, data) in ["one", "two", "three"].iter().enumerate() {
            insert(root, "k", Some(&sri(data)), &InsertOpts::new().time(i as i64)).unwrap();
        }
        let found = find(root, "k").unwrap().unwrap();
        assert_eq!(found.time, 2);
        assert_eq!(found.integrity.unwrap().to_string(), sri("three").to_string());
    }

    #[test]
    fn test_same_digest_still_appends() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        insert(root, "k", Some(&sri("x")), &InsertOpts::new()).unwrap();
        insert(root, "k", Some(&sri("x")), &InsertOpts::new()).unwrap();
        assert_eq!(read_bucket(&bucket_path(root, "k")).unwrap().len(), 2);
    }

    #[test]
    fn test_tombstone_and_reinsert() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        insert(root, "k", Some(&sri("x")), &InsertOpts::new()).unwrap();
        delete(root, "k", false).unwrap();
        assert!(find(root, "k").unwrap().is_none());
        assert!(ls(root).unwrap().is_empty());

        insert(root, "k", Some(&sri("y")), &InsertOpts::new()).unwrap();
        let found = find(root, "k").unwrap().unwrap();
        assert_eq!(found.integrity.unwrap().to_string(), sri("y").to_string());
    }

    #[test]
    fn test_garbage_after_valid_entry() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        insert(root, "k", Some(&sri("x")), &InsertOpts::new()).unwrap();
        let bucket = bucket_path(root, "k");
        append_raw(&bucket, b"\n\xff\xfe garbage \x00\x01\tnot json");
        append_raw(&bucket, b"\ndeadbeef\t{\"key\":\"k\",\"integrity\":null");

        let found = find(root, "k").unwrap().unwrap();
        assert_eq!(found.integrity.unwrap().to_string(), sri("x").to_string());
        assert_eq!(ls(root).unwrap().len(), 1);
    }

    #[test]
    fn test_bad_checksum_and_bad_shape_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        insert(root, "k", Some(&sri("old")), &InsertOpts::new()).unwrap();
        let bucket = bucket_path(root, "k");

        // Valid checksum, wrong JSON shape.
        let json = r#"{"key":"k","integrity":"sha512-notvalid"}"#;
        append_raw(&bucket, format!("\n{}\t{}", hash_entry(json), json).as_bytes());
        // Right shape, checksum of something else.
        let good = format_line(&Record {
            key: "k".into(),
            integrity: Some(sri("new")),
            time: 1,
            size: 3,
            metadata: Value::Null,
        })
        .unwrap();
        append_raw(&bucket, good.replacen(&good[1..9], "00000000", 1).as_bytes());

        let found = find(root, "k").unwrap().unwrap();
        assert_eq!(found.integrity.unwrap().to_string(), sri("old").to_string());
    }

    #[test]
    fn test_torn_trailing_record() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        insert(root, "k", Some(&sri("whole")), &InsertOpts::new()).unwrap();
        let line = format_line(&Record {
            key: "k".into(),
            integrity: Some(sri("torn")),
            time: 9,
            size: 4,
            metadata: Value::Null,
        })
        .unwrap();
        append_raw(&bucket_path(root, "k"), &line.as_bytes()[..line.len() / 2]);
        // A later good append lands on its own line.
        insert(root, "k", Some(&sri("after")), &InsertOpts::new()).unwrap();

        let found = find(root, "k").unwrap().unwrap();
        assert_eq!(found.integrity.unwrap().to_string(), sri("after").to_string());
    }

    #[test]
    fn test_shared_bucket_filters_by_key() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        insert(root, "mine", Some(&sri("m")), &InsertOpts::new()).unwrap();
        let bucket = bucket_path(root, "mine");
        // Simulate a hash collision by appending another key's record.
        let other = format_line(&Record {
            key: "theirs".into(),
            integrity: Some(sri("t")),
            time: 5,
            size: 1,
            metadata: Value::Null,
        })
        .unwrap();
        append_raw(&bucket, other.as_bytes());

        let found = find(root, "mine").unwrap().unwrap();
        assert_eq!(found.integrity.unwrap().to_string(), sri("m").to_string());

        let listed = ls(root).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains_key("theirs"));
    }

    #[test]
    fn test_remove_fully_drops_whole_bucket() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        insert(root, "mine", Some(&sri("m")), &InsertOpts::new()).unwrap();
        let other = format_line(&Record {
            key: "collider".into(),
            integrity: Some(sri("c")),
            time: 5,
            size: 1,
            metadata: Value::Null,
        })
        .unwrap();
        append_raw(&bucket_path(root, "mine"), other.as_bytes());

        delete(root, "mine", true).unwrap();
        assert!(!bucket_path(root, "mine").exists());
        assert!(find(root, "mine").unwrap().is_none());
        // The colliding key went with it.
        assert!(ls(root).unwrap().is_empty());
        // Removing again is a no-op.
        delete(root, "mine", true).unwrap();
    }

    #[test]
    fn test_ls_across_buckets() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        assert!(ls(root).unwrap().is_empty());

        for key in ["a", "b", "c"] {
            insert(root, key, Some(&sri(key)), &InsertOpts::new()).unwrap();
        }
        delete(root, "b", false).unwrap();
        // Stray non-bucket files are ignored.
        fs::write(index_dir(root).join(".tmpXYZ"), b"\nzz\t{}").unwrap();

        let listed = ls(root).unwrap();
        assert_eq!(listed.keys().collect::<Vec<_>>(), vec!["a", "c"]);
        assert_eq!(ls_iter(root).unwrap().count(), 2);
    }

    #[test]
    fn test_compact_by_metadata() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        for (i, tag) in ["a", "b", "a", "c"].iter().enumerate() {
            insert(
                root,
                "k",
                Some(&sri(tag)),
                &InsertOpts::new().time(i as i64).metadata(json!({ "tag": tag })),
            )
            .unwrap();
        }
        let before = find(root, "k").unwrap().unwrap();
        let size_before = fs::metadata(bucket_path(root, "k")).unwrap().len();

        let kept = compact(
            root,
            "k",
            |newer, older| newer.metadata == older.metadata,
            &CompactOpts::default(),
        )
        .unwrap();

        let tags: Vec<_> = kept.iter().map(|e| e.metadata["tag"].clone()).collect();
        assert_eq!(tags, vec![json!("b"), json!("a"), json!("c")]);
        assert_eq!(kept.iter().map(|e| e.time).collect::<Vec<_>>(), vec![1, 2, 3]);

        let after = find(root, "k").unwrap().unwrap();
        assert_eq!(after, before);
        assert!(fs::metadata(bucket_path(root, "k")).unwrap().len() < size_before);
    }

    #[test]
    fn test_compact_tombstone_only_clears_its_key() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        insert(root, "k", Some(&sri("1")), &InsertOpts::new()).unwrap();
        let bucket = bucket_path(root, "k");
        let other = format_line(&Record {
            key: "other".into(),
            integrity: Some(sri("o")),
            time: 5,
            size: 1,
            metadata: Value::Null,
        })
        .unwrap();
        append_raw(&bucket, other.as_bytes());
        delete(root, "k", false).unwrap();

        let kept = compact(root, "k", |_, _| false, &CompactOpts::default()).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].key, "other");
        assert!(find(root, "k").unwrap().is_none());
        assert_eq!(read_bucket(&bucket).unwrap().len(), 1);
    }

    #[test]
    fn test_compact_validate_keeps_tombstones() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        insert(root, "k", Some(&sri("1")), &InsertOpts::new()).unwrap();
        delete(root, "k", false).unwrap();

        let keep_all = |_: &Entry| true;
        let opts = CompactOpts {
            validate_entry: Some(&keep_all),
        };
        let kept = compact(root, "k", |_, _| false, &opts).unwrap();
        assert_eq!(kept.len(), 2);
        assert!(kept[1].is_tombstone());
        assert!(find(root, "k").unwrap().is_none());

        let only_live = |e: &Entry| !e.is_tombstone();
        let opts = CompactOpts {
            validate_entry: Some(&only_live),
        };
        let kept = compact(root, "k", |_, _| false, &opts).unwrap();
        assert_eq!(kept.len(), 1);
        // With the tombstone filtered out the older entry is live again.
        assert!(find(root, "k").unwrap().is_some());
    }

    #[test]
    fn test_compact_missing_bucket_creates_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let kept = compact(root, "never-written", |_, _| false, &CompactOpts::default()).unwrap();
        assert!(kept.is_empty());
        assert!(!bucket_path(root, "never-written").exists());
        assert!(bucket_files(root).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_inserts_all_parse() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 50;

        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();
        let metadata = json!({ "padding": "x".repeat(512) });

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let root = root.clone();
                let metadata = metadata.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        let opts = InsertOpts::new().size(i as u64).metadata(metadata.clone());
                        insert(&root, "shared", Some(&sri(&format!("{t}-{i}"))), &opts).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let records = read_bucket(&bucket_path(&root, "shared")).unwrap();
        assert_eq!(records.len(), THREADS * PER_THREAD);
        let distinct: HashSet<String> = records
            .iter()
            .filter_map(|r| r.integrity.as_ref().map(|sri| sri.to_string()))
            .collect();
        assert_eq!(distinct.len(), THREADS * PER_THREAD);
        assert!(find(&root, "shared").unwrap().is_some());
    }

    // Property-based tests
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            max_shrink_iters: 1000,
            ..ProptestConfig::default()
        })]

        /// The last operation on a key decides what `find` returns.
        #[test]
        fn prop_last_operation_wins(ops in prop::collection::vec((0u8..3, any::<bool>()), 1..20)) {
            let temp_dir = TempDir::new().unwrap();
            let root = temp_dir.path();
            let mut model: HashMap<String, Option<String>> = HashMap::new();

            for (i, (key, is_delete)) in ops.iter().enumerate() {
                let key = format!("key-{key}");
                if *is_delete {
                    delete(root, &key, false)?;
                    model.insert(key, None);
                } else {
                    let data = format!("value-{i}");
                    insert(root, &key, Some(&sri(&data)), &InsertOpts::new())?;
                    model.insert(key, Some(sri(&data).to_string()));
                }
            }

            for (key, expected) in &model {
                let found = find(root, key)?.and_then(|e| e.integrity).map(|s| s.to_string());
                prop_assert_eq!(&found, expected);
            }
            let live = model.values().filter(|v| v.is_some()).count();
            prop_assert_eq!(ls(root)?.len(), live);
        }
    }
}
