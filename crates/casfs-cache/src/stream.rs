//! Streaming cache manager.
//!
//! Fronts a backing cache with a table of virtual descriptors.  Objects
//! present in the backing cache are served from there; regular data objects
//! that are absent get a descriptor tagged with their hash and are streamed
//! from the download transport on every read.  Catalogs and pinned objects
//! must materialize in the backing cache, so their misses stay misses.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use casfs_config::CacheConfig;
use casfs_download::{DownloadJob, DownloadManager, Sink};
use casfs_hash::ObjectId;
use tracing::debug;

use crate::fd_table::FdTable;
use crate::{
    Breadcrumb, CacheError, CacheManager, CacheManagerKind, CacheTxn, LabeledObject,
    QuotaManager, Result,
};

/// What a virtual descriptor stands for.
#[derive(Debug, Clone)]
enum FdInfo {
    /// Descriptor owned by the backing cache.
    Backed(i32),
    /// Object streamed from the transport on every read.
    Streamed(ObjectId),
}

/// Sink that counts the full payload while copying the part that overlaps
/// the caller's read window.
struct StreamingSink<'a> {
    pos: u64,
    window: Option<&'a mut [u8]>,
    offset: u64,
}

impl<'a> StreamingSink<'a> {
    fn new(window: Option<&'a mut [u8]>, offset: u64) -> Self {
        Self {
            pos: 0,
            window,
            offset,
        }
    }

    /// Total bytes the transport delivered, i.e. the object size.
    fn bytes_seen(&self) -> u64 {
        self.pos
    }
}

impl Sink for StreamingSink<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<u64> {
        let n = data.len() as u64;
        let old_pos = self.pos;
        self.pos += n;

        let Some(buf) = self.window.as_deref_mut() else {
            return Ok(n);
        };
        // Chunk entirely before or after the window: consumed, not copied.
        if self.pos < self.offset {
            return Ok(n);
        }
        if old_pos >= self.offset + buf.len() as u64 {
            return Ok(n);
        }

        let copy_offset = old_pos.max(self.offset);
        let inbuf = (copy_offset - old_pos) as usize;
        let outbuf = (copy_offset - self.offset) as usize;
        let len = (data.len() - inbuf).min(buf.len() - outbuf);
        buf[outbuf..outbuf + len].copy_from_slice(&data[inbuf..inbuf + len]);
        Ok(n)
    }

    fn reset(&mut self) -> io::Result<()> {
        self.pos = 0;
        Ok(())
    }
}

pub struct StreamingCacheManager {
    cache: Arc<dyn CacheManager>,
    download: Arc<dyn DownloadManager>,
    fd_table: Mutex<FdTable<FdInfo>>,
}

impl StreamingCacheManager {
    pub fn new(
        max_open_fds: usize,
        cache: Arc<dyn CacheManager>,
        download: Arc<dyn DownloadManager>,
    ) -> Self {
        Self {
            cache,
            download,
            fd_table: Mutex::new(FdTable::new(max_open_fds)),
        }
    }

    pub fn from_config(
        config: &CacheConfig,
        cache: Arc<dyn CacheManager>,
        download: Arc<dyn DownloadManager>,
    ) -> Self {
        Self::new(config.max_open_fds as usize, cache, download)
    }

    /// The backing cache this manager wraps.
    pub fn backing(&self) -> &Arc<dyn CacheManager> {
        &self.cache
    }

    fn table(&self) -> MutexGuard<'_, FdTable<FdInfo>> {
        self.fd_table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Download the complete object, copying `[offset, offset+len)` into the
    /// window.  Returns the object size; the transport is re-driven on every
    /// call, no bytes are memoized between reads.
    fn stream(&self, id: &ObjectId, window: Option<&mut [u8]>, offset: u64) -> Result<u64> {
        let mut sink = StreamingSink::new(window, offset);
        let mut job = DownloadJob::new(id.url(), &mut sink);
        job.expected_hash = Some(*id);
        if let Err(err) = self.download.fetch(&mut job) {
            debug!(hash = %id, error = %err, "streaming fetch failed");
            return Err(CacheError::Io);
        }
        Ok(sink.bytes_seen())
    }
}

impl CacheManager for StreamingCacheManager {
    fn kind(&self) -> CacheManagerKind {
        CacheManagerKind::Streaming
    }

    fn describe(&self) -> String {
        format!(
            "streaming cache manager, backing cache: {}",
            self.cache.describe()
        )
    }

    fn acquire_quota_manager(&self, quota_mgr: Arc<dyn QuotaManager>) -> bool {
        self.cache.acquire_quota_manager(quota_mgr)
    }

    fn quota_manager(&self) -> Option<Arc<dyn QuotaManager>> {
        self.cache.quota_manager()
    }

    fn open(&self, object: &LabeledObject) -> Result<i32> {
        match self.cache.open(object) {
            Ok(backing_fd) => {
                let result = self.table().open_fd(FdInfo::Backed(backing_fd));
                if result.is_err() {
                    let _ = self.cache.close(backing_fd);
                }
                result
            }
            Err(CacheError::NotFound) => {
                // Catalogs and pinned objects must materialize on the
                // backing cache; only regular data may be streamed.
                if object.label.is_catalog() || object.label.is_pinned() {
                    return Err(CacheError::NotFound);
                }
                self.table().open_fd(FdInfo::Streamed(object.id))
            }
            Err(e) => Err(e),
        }
    }

    fn get_size(&self, fd: i32) -> Result<u64> {
        let info = self.table().handle(fd).ok_or(CacheError::BadFd)?;
        match info {
            FdInfo::Backed(backing_fd) => self.cache.get_size(backing_fd),
            // Nothing on disk: the streamed byte count is the size.
            FdInfo::Streamed(id) => self.stream(&id, None, 0),
        }
    }

    fn close(&self, fd: i32) -> Result<()> {
        let info = {
            let mut table = self.table();
            let info = table.handle(fd).ok_or(CacheError::BadFd)?;
            table.close_fd(fd)?;
            info
        };
        match info {
            FdInfo::Backed(backing_fd) => self.cache.close(backing_fd),
            FdInfo::Streamed(_) => Ok(()),
        }
    }

    fn pread(&self, fd: i32, buf: &mut [u8], offset: u64) -> Result<u64> {
        let info = self.table().handle(fd).ok_or(CacheError::BadFd)?;
        match info {
            FdInfo::Backed(backing_fd) => self.cache.pread(backing_fd, buf, offset),
            FdInfo::Streamed(id) => {
                let len = buf.len() as u64;
                let size = self.stream(&id, Some(buf), offset)?;
                Ok(size.saturating_sub(offset).min(len))
            }
        }
    }

    fn dup(&self, fd: i32) -> Result<i32> {
        let mut table = self.table();
        let info = table.handle(fd).ok_or(CacheError::BadFd)?;
        match info {
            FdInfo::Backed(backing_fd) => {
                let dup_fd = self.cache.dup(backing_fd)?;
                table.open_fd(FdInfo::Backed(dup_fd))
            }
            FdInfo::Streamed(id) => table.open_fd(FdInfo::Streamed(id)),
        }
    }

    fn readahead(&self, fd: i32) -> Result<()> {
        let info = self.table().handle(fd).ok_or(CacheError::BadFd)?;
        match info {
            FdInfo::Backed(backing_fd) => self.cache.readahead(backing_fd),
            FdInfo::Streamed(_) => Ok(()),
        }
    }

    // Only catalogs and pinned objects are written to the cache, so the
    // transaction machinery passes through to the backing cache.

    fn start_txn(&self, id: &ObjectId, size_hint: u64) -> Result<Box<dyn CacheTxn>> {
        self.cache.start_txn(id, size_hint)
    }

    fn open_from_txn(&self, txn: &mut dyn CacheTxn) -> Result<i32> {
        let backing_fd = self.cache.open_from_txn(txn)?;
        let result = self.table().open_fd(FdInfo::Backed(backing_fd));
        if result.is_err() {
            let _ = self.cache.close(backing_fd);
        }
        result
    }

    fn abort_txn(&self, txn: Box<dyn CacheTxn>) -> Result<()> {
        self.cache.abort_txn(txn)
    }

    fn commit_txn(&self, txn: Box<dyn CacheTxn>) -> Result<()> {
        self.cache.commit_txn(txn)
    }

    fn spawn(&self) {
        self.cache.spawn()
    }

    fn load_breadcrumb(&self, repo: &str) -> Option<Breadcrumb> {
        self.cache.load_breadcrumb(repo)
    }

    fn store_breadcrumb(&self, repo: &str, breadcrumb: Breadcrumb) -> Result<()> {
        self.cache.store_breadcrumb(repo, breadcrumb)
    }
}
