//! Ownership normalization for freshly created cache paths.
//!
//! A cache shared between users (for example one populated by a root
//! process on behalf of a regular user) needs new files chowned back to
//! the cache owner. The engine only calls [`FixOwnership::fix`]; the
//! policy lives in the implementation.

use std::io;
use std::path::Path;

/// Hook invoked after the engine creates a file or directory.
pub trait FixOwnership: Send + Sync {
    /// Normalize ownership of `path`.
    fn fix(&self, path: &Path) -> io::Result<()>;
}

/// Leaves ownership untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopOwnership;

impl FixOwnership for NoopOwnership {
    fn fix(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

/// Chowns created paths to a fixed uid and/or gid.
#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
pub struct Chown {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

#[cfg(unix)]
impl FixOwnership for Chown {
    fn fix(&self, path: &Path) -> io::Result<()> {
        use std::os::unix::fs::MetadataExt;

        if self.uid.is_none() && self.gid.is_none() {
            return Ok(());
        }
        let meta = std::fs::symlink_metadata(path)?;
        let uid_ok = self.uid.is_none_or(|uid| uid == meta.uid());
        let gid_ok = self.gid.is_none_or(|gid| gid == meta.gid());
        if uid_ok && gid_ok {
            return Ok(());
        }
        std::os::unix::fs::lchown(path, self.uid, self.gid)
    }
}
