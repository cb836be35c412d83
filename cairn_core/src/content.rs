//! Content store: immutable payload files addressed by digest.
//!
//! Layout: `content/<algo>/<hex[0..2]>/<hex[2..]>`. A content file is
//! written once per digest and never modified afterwards.

use crate::error::{Error, Result};
use crate::integrity::{Algorithm, Hash, Integrity, IntegrityChecker};
use std::fs;
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, PersistError};

/// Directory holding all content files.
pub fn content_dir(root: &Path) -> PathBuf {
    root.join("content")
}

/// Path of the content file for a single hash.
///
/// Hex digests are always lower-case; algorithm names are lower-cased.
pub fn hash_path(root: &Path, hash: &Hash) -> PathBuf {
    let hex = hash.to_hex();
    content_dir(root)
        .join(hash.algorithm.as_str().to_ascii_lowercase())
        .join(&hex[..2])
        .join(&hex[2..])
}

/// Path of the content file for an integrity value (its strongest hash).
pub fn path(root: &Path, sri: &Integrity) -> PathBuf {
    hash_path(root, sri.strongest())
}

/// Recover the hash a content path was derived from.
pub(crate) fn hash_from_path(root: &Path, path: &Path) -> Option<Hash> {
    let rel = path.strip_prefix(content_dir(root)).ok()?;
    let parts: Vec<&str> = rel.iter().map(|c| c.to_str()).collect::<Option<_>>()?;
    let [algo, prefix, suffix] = parts.as_slice() else {
        return None;
    };
    let algorithm = Algorithm::parse(algo).ok()?;
    let digest = hex::decode(format!("{prefix}{suffix}")).ok()?;
    Hash::new(algorithm, digest).ok()
}

/// Stat the first candidate path of `sri` that exists.
///
/// `Ok(None)` means no candidate exists. Any error other than "not found"
/// is returned as-is so permission problems are never mistaken for misses.
pub fn exists(root: &Path, sri: &Integrity) -> Result<Option<fs::Metadata>> {
    for hash in sri.hashes() {
        match fs::metadata(hash_path(root, hash)) {
            Ok(meta) => return Ok(Some(meta)),
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(None)
}

/// Read and verify content.
///
/// Candidates are tried strongest-first; the first one that exists and
/// verifies wins. When none does, the first failure is reported, or
/// `ENOENT` if no candidate existed at all.
pub fn read(root: &Path, sri: &Integrity, size: Option<u64>) -> Result<Vec<u8>> {
    let mut first_err: Option<Error> = None;
    for hash in sri.hashes() {
        let path = hash_path(root, hash);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => {
                first_err.get_or_insert(err.into());
                continue;
            }
        };
        let attempt = match size {
            Some(expected) if data.len() as u64 != expected => {
                Err(Error::size_mismatch(expected, data.len() as u64))
            }
            _ => Integrity::from(hash.clone()).check(&data),
        };
        match attempt {
            Ok(_) => return Ok(data),
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "content candidate rejected");
                first_err.get_or_insert(err);
            }
        }
    }
    Err(first_err.unwrap_or_else(|| Error::content_not_found(sri)))
}

/// Streaming reader that verifies content once fully consumed.
///
/// Call [`Reader::check`] after reading; an unchecked reader proves nothing.
pub struct Reader {
    file: fs::File,
    checker: IntegrityChecker,
    read: u64,
    size: Option<u64>,
}

impl Reader {
    /// Total bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    /// Drain any unread bytes and verify size and integrity.
    pub fn check(mut self) -> Result<Algorithm> {
        io::copy(&mut self, &mut io::sink())?;
        if let Some(expected) = self.size
            && expected != self.read
        {
            return Err(Error::size_mismatch(expected, self.read));
        }
        self.checker.result()
    }
}

impl Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read(buf)?;
        self.checker.input(&buf[..n]);
        self.read += n as u64;
        Ok(n)
    }
}

/// Open the first existing candidate of `sri` for streaming.
pub fn open(root: &Path, sri: &Integrity, size: Option<u64>) -> Result<Reader> {
    for hash in sri.hashes() {
        match fs::File::open(hash_path(root, hash)) {
            Ok(file) => {
                return Ok(Reader {
                    file,
                    checker: IntegrityChecker::new(Integrity::from(hash.clone())),
                    read: 0,
                    size,
                });
            }
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(Error::content_not_found(sri))
}

/// Outcome of [`place`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The temp file became the content file.
    Written,
    /// Identical content was already there; the temp file was discarded.
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy)]
enum RaceCode {
    Kind(ErrorKind),
    Errno(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Platform {
    Any,
    Unix,
    Windows,
}

impl Platform {
    fn current_matches(self) -> bool {
        match self {
            Platform::Any => true,
            Platform::Unix => cfg!(unix),
            Platform::Windows => cfg!(windows),
        }
    }
}

/// Placement failures that mean another writer already produced the file.
///
/// The loser of such a race finds identical bytes already in place. Every
/// entry additionally requires the destination to exist.
const TOLERATED_RACES: &[(RaceCode, Platform)] = &[
    // EEXIST: no-clobber link/rename found the file already in place.
    (RaceCode::Kind(ErrorKind::AlreadyExists), Platform::Any),
    // EBUSY: destination is open or being replaced by another process.
    (RaceCode::Kind(ErrorKind::ResourceBusy), Platform::Unix),
    // EPERM/EACCES: rename onto a file another process holds open.
    (RaceCode::Kind(ErrorKind::PermissionDenied), Platform::Windows),
    // ERROR_SHARING_VIOLATION.
    (RaceCode::Errno(32), Platform::Windows),
];

fn is_tolerated_race(err: &io::Error, dest: &Path) -> bool {
    let listed = TOLERATED_RACES.iter().any(|(code, platform)| {
        platform.current_matches()
            && match code {
                RaceCode::Kind(kind) => err.kind() == *kind,
                RaceCode::Errno(errno) => err.raw_os_error() == Some(*errno),
            }
    });
    listed && dest.exists()
}

/// Delete a temp file, logging (not hiding) a failure to do so.
pub(crate) fn discard_temp(tmp: NamedTempFile) {
    let path = tmp.path().to_path_buf();
    if let Err(err) = tmp.close() {
        tracing::warn!(path = %path.display(), error = %err, "failed to remove temp file");
    }
}

/// Atomically move a verified temp file to `dest`.
///
/// Never overwrites: if `dest` already exists the temp file is discarded
/// and [`Placement::AlreadyPresent`] is returned.
pub fn place(tmp: NamedTempFile, dest: &Path) -> Result<Placement> {
    if let Some(parent) = dest.parent()
        && let Err(err) = fs::create_dir_all(parent)
    {
        discard_temp(tmp);
        return Err(err.into());
    }

    match tmp.persist_noclobber(dest) {
        Ok(_) => Ok(Placement::Written),
        Err(PersistError { error, file }) => {
            discard_temp(file);
            if is_tolerated_race(&error, dest) {
                tracing::debug!(path = %dest.display(), "content already present");
                Ok(Placement::AlreadyPresent)
            } else {
                Err(error.into())
            }
        }
    }
}

/// Delete every candidate file of `sri`. Returns whether anything was removed.
pub fn remove(root: &Path, sri: &Integrity) -> Result<bool> {
    let mut removed = false;
    for hash in sri.hashes() {
        match fs::remove_file(hash_path(root, hash)) {
            Ok(()) => removed = true,
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn store(root: &Path, data: &[u8], algo: Algorithm) -> Integrity {
        let sri = Integrity::compute(data, &[algo]);
        let p = path(root, &sri);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(&p, data).unwrap();
        sri
    }

    #[test]
    fn test_path_layout() {
        let root = Path::new("/cache");
        let sri = Integrity::compute(b"", &[Algorithm::Sha256]);
        assert_eq!(
            path(root, &sri),
            Path::new(
                "/cache/content/sha256/e3/b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
            )
        );
    }

    #[test]
    fn test_path_uses_strongest_hash() {
        let root = Path::new("/cache");
        let sri = Integrity::compute(b"x", &[Algorithm::Sha256, Algorithm::Sha512]);
        assert!(path(root, &sri).starts_with("/cache/content/sha512"));
    }

    #[test]
    fn test_hash_from_path_roundtrip() {
        let root = Path::new("/cache");
        let sri = Integrity::from_bytes(b"abc");
        let p = path(root, &sri);
        assert_eq!(hash_from_path(root, &p).unwrap(), *sri.strongest());
        assert!(hash_from_path(root, Path::new("/cache/content/sha512/zz")).is_none());
        assert!(hash_from_path(root, Path::new("/elsewhere/a/b/c")).is_none());
    }

    #[test]
    fn test_exists() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let sri = store(root, b"here", Algorithm::Sha512);
        assert_eq!(exists(root, &sri).unwrap().unwrap().len(), 4);
        assert!(exists(root, &Integrity::from_bytes(b"absent")).unwrap().is_none());
    }

    #[test]
    fn test_exists_propagates_non_missing_errors() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let sri = Integrity::from_bytes(b"blocked");
        // A file where the shard directory should be yields ENOTDIR, not ENOENT.
        let shard = path(root, &sri).parent().unwrap().to_path_buf();
        fs::create_dir_all(shard.parent().unwrap()).unwrap();
        fs::write(&shard, b"not a dir").unwrap();

        let err = exists(root, &sri).unwrap_err();
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_read_verifies() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let sri = store(root, b"payload", Algorithm::Sha512);

        assert_eq!(read(root, &sri, None).unwrap(), b"payload");
        assert_eq!(read(root, &sri, Some(7)).unwrap(), b"payload");
        assert_eq!(read(root, &sri, Some(3)).unwrap_err().code(), "EBADSIZE");

        fs::write(path(root, &sri), b"tampered").unwrap();
        assert_eq!(read(root, &sri, None).unwrap_err().code(), "EINTEGRITY");
    }

    #[test]
    fn test_read_missing_is_enoent() {
        let temp_dir = TempDir::new().unwrap();
        let err = read(temp_dir.path(), &Integrity::from_bytes(b"nope"), None).unwrap_err();
        assert_eq!(err.code(), "ENOENT");
    }

    #[test]
    fn test_read_falls_through_to_next_candidate() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let good = store(root, b"real", Algorithm::Sha256);
        let strong = Integrity::compute(b"real", &[Algorithm::Sha512]);
        // The strongest candidate exists but is corrupt.
        let bad_path = path(root, &strong);
        fs::create_dir_all(bad_path.parent().unwrap()).unwrap();
        fs::write(&bad_path, b"rot").unwrap();

        let both = strong.concat(&good);
        assert_eq!(read(root, &both, None).unwrap(), b"real");
    }

    #[test]
    fn test_streaming_reader() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let sri = store(root, b"streamed bytes", Algorithm::Blake3);

        let mut reader = open(root, &sri, Some(14)).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"streamed bytes");
        assert_eq!(reader.bytes_read(), 14);
        assert_eq!(reader.check().unwrap(), Algorithm::Blake3);

        fs::write(path(root, &sri), b"streamed bytez").unwrap();
        let reader = open(root, &sri, None).unwrap();
        assert_eq!(reader.check().unwrap_err().code(), "EINTEGRITY");
    }

    #[test]
    fn test_place_tolerates_existing() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let tmp_dir = root.join("tmp");
        fs::create_dir_all(&tmp_dir).unwrap();
        let sri = Integrity::from_bytes(b"same");
        let dest = path(root, &sri);

        let mut first = NamedTempFile::new_in(&tmp_dir).unwrap();
        first.write_all(b"same").unwrap();
        assert_eq!(place(first, &dest).unwrap(), Placement::Written);

        let mut second = NamedTempFile::new_in(&tmp_dir).unwrap();
        second.write_all(b"same").unwrap();
        let second_path = second.path().to_path_buf();
        assert_eq!(place(second, &dest).unwrap(), Placement::AlreadyPresent);

        assert!(!second_path.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"same");
        assert_eq!(fs::read_dir(&tmp_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_race_table_requires_destination() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing");
        let exists_err = io::Error::from(ErrorKind::AlreadyExists);
        assert!(!is_tolerated_race(&exists_err, &missing));

        fs::write(&missing, b"now here").unwrap();
        assert!(is_tolerated_race(&exists_err, &missing));
        assert!(!is_tolerated_race(&io::Error::from(ErrorKind::OutOfMemory), &missing));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let sri = store(root, b"bye", Algorithm::Sha512);
        assert!(remove(root, &sri).unwrap());
        assert!(!remove(root, &sri).unwrap());
        assert!(exists(root, &sri).unwrap().is_none());
    }
}
