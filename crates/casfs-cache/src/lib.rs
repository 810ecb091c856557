//! # casfs-cache
//!
//! The cache side of the casfs client.
//!
//! [`CacheManager`] is the contract every cache implementation speaks: open a
//! content hash into a small integer descriptor, read it positionally, and
//! ingest new objects through start/write/commit transactions.
//! [`StreamingCacheManager`] fronts a backing cache and serves regular data
//! objects straight from the download transport without materializing them;
//! [`InMemoryCacheManager`] is a complete backing implementation used for
//! RAM-only mounts and in tests.

pub mod fd_table;
mod mem;
mod stream;

pub use mem::InMemoryCacheManager;
pub use stream::StreamingCacheManager;

use std::any::Any;
use std::sync::Arc;

use casfs_hash::ObjectId;
use thiserror::Error;

pub use casfs_download::Compression;

/// Error taxonomy of the cache layers.
///
/// Deliberately `Copy`/`Eq`: a coalesced waiter must observe the exact error
/// value of the thread that performed the download.  Transport and integrity
/// failures are collapsed into [`CacheError::Io`] at this level.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    #[error("object not found")]
    NotFound,
    #[error("bad file descriptor")]
    BadFd,
    #[error("i/o failure")]
    Io,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("read-only cache")]
    ReadOnly,
    #[error("no space left in cache")]
    NoSpace,
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Sentinel for "object size not known up front".
pub const SIZE_UNKNOWN: u64 = u64::MAX;

/// Out-of-band request metadata.
///
/// Labels steer classification (catalog vs. data, pinned vs. evictable) and
/// transfer handling; they never participate in object identity.  Two
/// requests for the same hash with different labels are one object.
#[derive(Debug, Clone)]
pub struct Label {
    /// Original repository path, for logging and external downloads.
    pub path: String,
    /// Expected object size or [`SIZE_UNKNOWN`].
    pub size: u64,
    /// Transfer compression of the object on mirrors.
    pub compression: Compression,
    /// Bitfield of the `Label::` flag constants.
    pub flags: u32,
}

impl Label {
    pub const CATALOG: u32 = 1 << 0;
    pub const CERTIFICATE: u32 = 1 << 1;
    pub const PINNED: u32 = 1 << 2;
    pub const EXTERNAL: u32 = 1 << 3;
    pub const CHUNK: u32 = 1 << 4;
    pub const VOLATILE: u32 = 1 << 5;

    pub fn is_catalog(&self) -> bool {
        self.flags & Self::CATALOG != 0
    }

    pub fn is_certificate(&self) -> bool {
        self.flags & Self::CERTIFICATE != 0
    }

    pub fn is_pinned(&self) -> bool {
        self.flags & Self::PINNED != 0
    }

    pub fn is_external(&self) -> bool {
        self.flags & Self::EXTERNAL != 0
    }

    pub fn is_chunk(&self) -> bool {
        self.flags & Self::CHUNK != 0
    }

    pub fn is_volatile(&self) -> bool {
        self.flags & Self::VOLATILE != 0
    }
}

impl Default for Label {
    fn default() -> Self {
        Self {
            path: String::new(),
            size: SIZE_UNKNOWN,
            compression: Compression::Zlib,
            flags: 0,
        }
    }
}

/// A hash plus the label of the request asking for it.  Owned by the caller
/// for the duration of one cache operation.
#[derive(Debug, Clone)]
pub struct LabeledObject {
    pub id: ObjectId,
    pub label: Label,
}

impl LabeledObject {
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            label: Label::default(),
        }
    }

    pub fn with_label(id: ObjectId, label: Label) -> Self {
        Self { id, label }
    }
}

/// Known cache manager implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheManagerKind {
    Unknown,
    Posix,
    InMemory,
    Streaming,
    External,
}

/// Pointer into the catalog history of a repository, persisted by backing
/// caches so a client can mount without network access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breadcrumb {
    pub catalog: ObjectId,
    pub timestamp: u64,
    pub revision: u64,
}

/// Capability handle for cache space accounting.  The policy itself lives
/// outside this crate; cache managers only hold and propagate the handle.
pub trait QuotaManager: Send + Sync {
    /// Administered capacity in bytes.
    fn capacity(&self) -> u64;

    /// Whether the manager enforces limits at all.
    fn is_enforcing(&self) -> bool {
        true
    }
}

/// Quota manager that accounts nothing and limits nothing.
pub struct NoopQuotaManager;

impl QuotaManager for NoopQuotaManager {
    fn capacity(&self) -> u64 {
        u64::MAX
    }

    fn is_enforcing(&self) -> bool {
        false
    }
}

/// An object ingest in flight: started against a hash, fed through `write`,
/// finished by [`CacheManager::commit_txn`] or [`CacheManager::abort_txn`].
///
/// Transactions are owned values; the `Any` hooks let a cache manager
/// recover its concrete transaction type from the trait object it handed
/// out.  A transaction must only be finished by the manager that started it.
pub trait CacheTxn: Send {
    /// Append bytes; returns how many were accepted.
    fn write(&mut self, data: &[u8]) -> Result<u64>;

    /// Discard everything written so far so delivery can restart.
    fn reset(&mut self) -> Result<()>;

    /// Attach the request label so the cache can classify the object.
    fn set_label(&mut self, label: &Label);

    fn as_any(&mut self) -> &mut dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// The cache manager contract.
///
/// Descriptors are small non-negative integers scoped to one manager
/// instance; they are not OS file descriptors.  All operations are
/// thread-safe; a transaction is owned by one thread at a time.
pub trait CacheManager: Send + Sync {
    fn kind(&self) -> CacheManagerKind;

    /// Human-readable description of this manager and its layering.
    fn describe(&self) -> String;

    fn acquire_quota_manager(&self, quota_mgr: Arc<dyn QuotaManager>) -> bool;

    fn quota_manager(&self) -> Option<Arc<dyn QuotaManager>>;

    /// Open an object for reading; [`CacheError::NotFound`] when absent.
    fn open(&self, object: &LabeledObject) -> Result<i32>;

    fn get_size(&self, fd: i32) -> Result<u64>;

    /// Close a descriptor.  Descriptors close exactly once; any later use
    /// reports [`CacheError::BadFd`].
    fn close(&self, fd: i32) -> Result<()>;

    /// Positional read; returns the number of bytes placed into `buf`
    /// (0 past end of object).
    fn pread(&self, fd: i32, buf: &mut [u8], offset: u64) -> Result<u64>;

    /// A new descriptor for the same object, independently owned.
    fn dup(&self, fd: i32) -> Result<i32>;

    fn readahead(&self, fd: i32) -> Result<()>;

    /// Begin ingesting an object.  `size_hint` is the expected decompressed
    /// size or [`SIZE_UNKNOWN`]; a known size that the written data misses
    /// fails the commit.
    fn start_txn(&self, id: &ObjectId, size_hint: u64) -> Result<Box<dyn CacheTxn>>;

    /// Open the partially or fully written transaction content, before
    /// commit.  The descriptor stays valid independent of the commit fate.
    fn open_from_txn(&self, txn: &mut dyn CacheTxn) -> Result<i32>;

    fn abort_txn(&self, txn: Box<dyn CacheTxn>) -> Result<()>;

    fn commit_txn(&self, txn: Box<dyn CacheTxn>) -> Result<()>;

    /// Start background machinery (cleanup threads etc.); optional.
    fn spawn(&self);

    fn load_breadcrumb(&self, repo: &str) -> Option<Breadcrumb>;

    fn store_breadcrumb(&self, repo: &str, breadcrumb: Breadcrumb) -> Result<()>;

    /// Ingest a complete in-memory payload in one call.
    fn commit_from_mem(&self, object: &LabeledObject, data: &[u8]) -> Result<()> {
        let mut txn = self.start_txn(&object.id, data.len() as u64)?;
        txn.set_label(&object.label);
        let mut remaining = data;
        while !remaining.is_empty() {
            match txn.write(remaining) {
                Ok(n) if n > 0 => remaining = &remaining[n as usize..],
                Ok(_) => {
                    let _ = self.abort_txn(txn);
                    return Err(CacheError::Io);
                }
                Err(e) => {
                    let _ = self.abort_txn(txn);
                    return Err(e);
                }
            }
        }
        self.commit_txn(txn)
    }

    /// Read a complete object into memory.
    fn open_to_mem(&self, object: &LabeledObject) -> Result<Vec<u8>> {
        let fd = self.open(object)?;
        let result = (|| {
            let size = self.get_size(fd)?;
            let mut buf = vec![0u8; size as usize];
            let n = self.pread(fd, &mut buf, 0)?;
            buf.truncate(n as usize);
            Ok(buf)
        })();
        let _ = self.close(fd);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use casfs_hash::{Algorithm, Suffix};

    #[test]
    fn test_label_defaults() {
        let label = Label::default();
        assert_eq!(label.size, SIZE_UNKNOWN);
        assert_eq!(label.compression, Compression::Zlib);
        assert_eq!(label.flags, 0);
        assert!(!label.is_catalog());
        assert!(!label.is_pinned());
    }

    #[test]
    fn test_label_flags() {
        let mut label = Label::default();
        label.flags = Label::CATALOG | Label::PINNED;
        assert!(label.is_catalog());
        assert!(label.is_pinned());
        assert!(!label.is_external());
        assert!(!label.is_certificate());
        assert!(!label.is_chunk());
        assert!(!label.is_volatile());
    }

    #[test]
    fn test_commit_from_mem_roundtrip() {
        let cache = InMemoryCacheManager::new();
        let id = ObjectId::from_digest(Algorithm::Sha256, b"hello", Suffix::Data);
        let object = LabeledObject::new(id);
        cache.commit_from_mem(&object, b"hello").unwrap();
        assert_eq!(cache.open_to_mem(&object).unwrap(), b"hello");
    }

    #[test]
    fn test_open_to_mem_missing() {
        let cache = InMemoryCacheManager::new();
        let id = ObjectId::from_digest(Algorithm::Sha256, b"absent", Suffix::Data);
        assert_eq!(
            cache.open_to_mem(&LabeledObject::new(id)),
            Err(CacheError::NotFound)
        );
    }

    #[test]
    fn test_quota_handle() {
        let cache = InMemoryCacheManager::new();
        assert!(cache.quota_manager().is_none());
        assert!(cache.acquire_quota_manager(Arc::new(NoopQuotaManager)));
        let quota = cache.quota_manager().unwrap();
        assert!(!quota.is_enforcing());
        assert_eq!(quota.capacity(), u64::MAX);
    }
}
