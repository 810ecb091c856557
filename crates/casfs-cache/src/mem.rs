//! In-memory backing cache.
//!
//! A complete [`CacheManager`] keeping objects in RAM.  Used for diskless
//! mounts and throughout the test suites; the transaction path mirrors what
//! an on-disk cache does, including quarantining objects whose written size
//! misses the announced size.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use casfs_hash::ObjectId;
use tracing::warn;

use crate::fd_table::FdTable;
use crate::{
    Breadcrumb, CacheError, CacheManager, CacheManagerKind, CacheTxn, Label, LabeledObject,
    QuotaManager, Result, SIZE_UNKNOWN,
};

const DEFAULT_MAX_OPEN_FDS: usize = 1024;

#[derive(Clone)]
struct StoredObject {
    data: Arc<Vec<u8>>,
    flags: u32,
}

#[derive(Clone)]
struct OpenHandle {
    data: Arc<Vec<u8>>,
}

struct MemState {
    objects: HashMap<ObjectId, StoredObject>,
    used_bytes: u64,
    fds: FdTable<OpenHandle>,
    breadcrumbs: HashMap<String, Breadcrumb>,
    quarantine: HashMap<ObjectId, Vec<u8>>,
}

pub struct InMemoryCacheManager {
    state: Mutex<MemState>,
    quota: Mutex<Option<Arc<dyn QuotaManager>>>,
    capacity_bytes: Option<u64>,
    readonly: AtomicBool,
}

struct MemTxn {
    id: ObjectId,
    size_hint: u64,
    label: Label,
    buf: Vec<u8>,
}

impl CacheTxn for MemTxn {
    fn write(&mut self, data: &[u8]) -> Result<u64> {
        self.buf.extend_from_slice(data);
        Ok(data.len() as u64)
    }

    fn reset(&mut self) -> Result<()> {
        self.buf.clear();
        Ok(())
    }

    fn set_label(&mut self, label: &Label) {
        self.label = label.clone();
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl Default for InMemoryCacheManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCacheManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState {
                objects: HashMap::new(),
                used_bytes: 0,
                fds: FdTable::new(DEFAULT_MAX_OPEN_FDS),
                breadcrumbs: HashMap::new(),
                quarantine: HashMap::new(),
            }),
            quota: Mutex::new(None),
            capacity_bytes: None,
            readonly: AtomicBool::new(false),
        }
    }

    /// Bound the total stored bytes; commits beyond the limit fail with
    /// [`CacheError::NoSpace`].
    pub fn with_capacity(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = Some(capacity_bytes);
        self
    }

    /// Switch the write side off; transactions fail with
    /// [`CacheError::ReadOnly`] while set.
    pub fn set_readonly(&self, readonly: bool) {
        self.readonly.store(readonly, Ordering::SeqCst);
    }

    /// Whether `id` is stored (committed) in this cache.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.lock().objects.contains_key(id)
    }

    /// Whether `id` failed an integrity check and was moved aside.
    pub fn is_quarantined(&self, id: &ObjectId) -> bool {
        self.lock().quarantine.contains_key(id)
    }

    /// Currently open descriptors, across all objects.
    pub fn open_fd_count(&self) -> usize {
        self.lock().fds.open_count()
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CacheManager for InMemoryCacheManager {
    fn kind(&self) -> CacheManagerKind {
        CacheManagerKind::InMemory
    }

    fn describe(&self) -> String {
        let state = self.lock();
        format!(
            "in-memory cache manager ({} objects, {} bytes)",
            state.objects.len(),
            state.used_bytes
        )
    }

    fn acquire_quota_manager(&self, quota_mgr: Arc<dyn QuotaManager>) -> bool {
        *self.quota.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(quota_mgr);
        true
    }

    fn quota_manager(&self) -> Option<Arc<dyn QuotaManager>> {
        self.quota
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn open(&self, object: &LabeledObject) -> Result<i32> {
        let mut state = self.lock();
        let data = match state.objects.get(&object.id) {
            Some(stored) => Arc::clone(&stored.data),
            None => return Err(CacheError::NotFound),
        };
        state.fds.open_fd(OpenHandle { data })
    }

    fn get_size(&self, fd: i32) -> Result<u64> {
        let state = self.lock();
        let handle = state.fds.handle(fd).ok_or(CacheError::BadFd)?;
        Ok(handle.data.len() as u64)
    }

    fn close(&self, fd: i32) -> Result<()> {
        self.lock().fds.close_fd(fd)
    }

    fn pread(&self, fd: i32, buf: &mut [u8], offset: u64) -> Result<u64> {
        let state = self.lock();
        let handle = state.fds.handle(fd).ok_or(CacheError::BadFd)?;
        let data = handle.data.as_slice();
        if offset >= data.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n as u64)
    }

    fn dup(&self, fd: i32) -> Result<i32> {
        let mut state = self.lock();
        let handle = state.fds.handle(fd).ok_or(CacheError::BadFd)?;
        state.fds.open_fd(handle)
    }

    fn readahead(&self, fd: i32) -> Result<()> {
        let state = self.lock();
        state.fds.handle(fd).ok_or(CacheError::BadFd)?;
        Ok(())
    }

    fn start_txn(&self, id: &ObjectId, size_hint: u64) -> Result<Box<dyn CacheTxn>> {
        if self.readonly.load(Ordering::SeqCst) {
            return Err(CacheError::ReadOnly);
        }
        let buf = if size_hint != SIZE_UNKNOWN {
            Vec::with_capacity(size_hint as usize)
        } else {
            Vec::new()
        };
        Ok(Box::new(MemTxn {
            id: *id,
            size_hint,
            label: Label::default(),
            buf,
        }))
    }

    fn open_from_txn(&self, txn: &mut dyn CacheTxn) -> Result<i32> {
        let txn = txn
            .as_any()
            .downcast_mut::<MemTxn>()
            .ok_or(CacheError::BadFd)?;
        let data = Arc::new(txn.buf.clone());
        self.lock().fds.open_fd(OpenHandle { data })
    }

    fn abort_txn(&self, txn: Box<dyn CacheTxn>) -> Result<()> {
        txn.into_any()
            .downcast::<MemTxn>()
            .map_err(|_| CacheError::BadFd)?;
        Ok(())
    }

    fn commit_txn(&self, txn: Box<dyn CacheTxn>) -> Result<()> {
        let txn = txn
            .into_any()
            .downcast::<MemTxn>()
            .map_err(|_| CacheError::BadFd)?;
        let MemTxn {
            id,
            size_hint,
            label,
            buf,
        } = *txn;

        let mut state = self.lock();
        if size_hint != SIZE_UNKNOWN && size_hint != buf.len() as u64 {
            warn!(
                hash = %id,
                expected = size_hint,
                actual = buf.len(),
                "size mismatch on commit, quarantining"
            );
            state.quarantine.insert(id, buf);
            return Err(CacheError::Io);
        }

        let replaced = state
            .objects
            .get(&id)
            .map(|stored| stored.data.len() as u64)
            .unwrap_or(0);
        if let Some(capacity) = self.capacity_bytes {
            if state.used_bytes - replaced + buf.len() as u64 > capacity {
                return Err(CacheError::NoSpace);
            }
        }
        state.used_bytes = state.used_bytes - replaced + buf.len() as u64;
        state.objects.insert(
            id,
            StoredObject {
                data: Arc::new(buf),
                flags: label.flags,
            },
        );
        Ok(())
    }

    fn spawn(&self) {}

    fn load_breadcrumb(&self, repo: &str) -> Option<Breadcrumb> {
        self.lock().breadcrumbs.get(repo).cloned()
    }

    fn store_breadcrumb(&self, repo: &str, breadcrumb: Breadcrumb) -> Result<()> {
        self.lock().breadcrumbs.insert(repo.to_owned(), breadcrumb);
        Ok(())
    }
}
