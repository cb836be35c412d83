//! # Cairn Core
//!
//! A disk-backed, content-addressable key/value cache.
//!
//! Values are stored once per digest under `content/`, and an append-only,
//! hash-bucketed index under `index/` maps string keys to those digests.
//! Every read is verified against its digest. Many processes may share one
//! cache directory without a coordinating server.
//!
//! ## Features
//!
//! - Content addressed by Subresource Integrity strings (sha512, sha384,
//!   sha256, blake3)
//! - Atomic, deduplicating writes staged through `tmp/`
//! - Corruption-tolerant index: torn or garbled lines are skipped
//! - Verify/GC pass that reclaims orphans and repairs corrupt content
//! - Optional in-memory memoization and ownership fixing
//!
//! ## Example
//!
//! ```no_run
//! use cairn_core::Cache;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = Cache::new("./my-cache");
//!
//! // Store a value under a key
//! let written = cache.put("pkg@1.0.0", b"hello")?;
//! println!("stored {} ({} bytes)", written.integrity, written.size);
//!
//! // Read it back, verified
//! let data = cache.get("pkg@1.0.0")?;
//! assert_eq!(data.data, b"hello");
//!
//! // Reclaim unreferenced content
//! let stats = cache.verify(Default::default())?;
//! println!("reclaimed {} bytes", stats.reclaimed_size);
//! # Ok(())
//! # }
//! ```

mod cache;
pub mod content;
mod error;
pub mod index;
mod integrity;
mod lock;
mod memo;
mod owner;
pub mod verify;
pub mod write;

pub use cache::{Cache, Data, KeyedWriter};
pub use error::{Error, Result};
pub use index::{CompactOpts, Entry, InsertOpts};
pub use integrity::{Algorithm, Hash, Integrity, IntegrityChecker, IntegrityOpts};
pub use lock::{CacheLock, LockMode};
pub use memo::Memo;
#[cfg(unix)]
pub use owner::Chown;
pub use owner::{FixOwnership, NoopOwnership};
pub use verify::{RunTime, VerifyOpts, VerifyStats};
pub use write::{WriteOpts, Writer, Written};
