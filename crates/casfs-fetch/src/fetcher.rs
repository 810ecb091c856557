//! The fetch coalescer.
//!
//! One download per hash, no matter how many threads ask.  The first thread
//! to miss the cache becomes the active downloader; it owns a cache
//! transaction for the duration of the transfer and, once the object is
//! committed (or the download failed), wakes every piggy-backed waiter in
//! queueing order with a privately duplicated descriptor or the exact error.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use casfs_cache::{CacheError, CacheManager, CacheTxn, LabeledObject};
use casfs_download::{DownloadJob, DownloadManager, Sink};
use casfs_hash::ObjectId;
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

type FetchResult = Result<i32, CacheError>;

/// Per-thread wakeup channel.  The receive side is only ever read by the
/// owning thread; send sides are cloned into the wait queues.  A single-slot
/// channel suffices: a waiter observes exactly one value per piggy-back.
struct FetchTls {
    tx: Sender<FetchResult>,
    rx: Receiver<FetchResult>,
}

impl FetchTls {
    fn new() -> Arc<Self> {
        let (tx, rx) = bounded(1);
        Arc::new(Self { tx, rx })
    }
}

/// Sink that forwards the downloaded payload into a cache transaction.
struct TxnSink<'a> {
    txn: &'a mut dyn CacheTxn,
}

impl Sink for TxnSink<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<u64> {
        self.txn
            .write(data)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn reset(&mut self) -> io::Result<()> {
        self.txn
            .reset()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Single-flight downloader in front of a cache manager.
///
/// `fetch` returns a descriptor on the cache manager the fetcher was built
/// with; callers read and close it there.  Each returned descriptor is
/// independently owned.
pub struct Fetcher {
    cache: Arc<dyn CacheManager>,
    download: Arc<dyn DownloadManager>,
    /// Hash → wakeup channels of the threads waiting on the in-flight
    /// download.  Presence of a key means a download is in progress; an
    /// empty list means nobody piggy-backed yet.
    queues_download: Mutex<HashMap<ObjectId, Vec<Sender<FetchResult>>>>,
    /// Wakeup channels by owning thread, lazily created; kept in a map so
    /// teardown can account for every block.
    tls_blocks: Mutex<HashMap<ThreadId, Arc<FetchTls>>>,
}

impl Fetcher {
    pub fn new(cache: Arc<dyn CacheManager>, download: Arc<dyn DownloadManager>) -> Self {
        Self {
            cache,
            download,
            queues_download: Mutex::new(HashMap::new()),
            tls_blocks: Mutex::new(HashMap::new()),
        }
    }

    /// The cache manager descriptors returned by `fetch` live on.
    pub fn cache_manager(&self) -> &Arc<dyn CacheManager> {
        &self.cache
    }

    /// Number of per-thread wakeup blocks created so far.
    pub fn tls_block_count(&self) -> usize {
        self.blocks().len()
    }

    /// Open `object`, downloading and committing it first if the cache does
    /// not hold it yet.  Concurrent calls for the same hash share one
    /// download.
    pub fn fetch(&self, object: &LabeledObject) -> Result<i32, CacheError> {
        self.fetch_impl(object, None)
    }

    /// Like [`Fetcher::fetch`], with a fallback path the transport tries
    /// when the canonical object path is not available.
    pub fn fetch_alt(&self, object: &LabeledObject, alt_url: &str) -> Result<i32, CacheError> {
        self.fetch_impl(object, Some(alt_url))
    }

    fn fetch_impl(&self, object: &LabeledObject, alt_url: Option<&str>) -> FetchResult {
        // Fast path: the common case is a cache hit, served without any
        // queue bookkeeping.  Only "not found" proceeds to the download
        // path; every other error goes back to the caller unchanged.
        match self.cache.open(object) {
            Ok(fd) => return Ok(fd),
            Err(CacheError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let tls = self.tls();
        {
            let mut queues = self.queues();
            if let Some(waiters) = queues.get_mut(&object.id) {
                // A download is in flight: leave our wakeup channel and
                // block until the downloader settles.
                waiters.push(tls.tx.clone());
                drop(queues);
                debug!(hash = %object.id, "piggy-backing onto in-flight download");
                return match tls.rx.recv() {
                    Ok(result) => result,
                    Err(_) => Err(CacheError::Io),
                };
            }
            queues.insert(object.id, Vec::new());
        }

        // We are the active downloader now.  Another thread may have
        // committed the object between the first probe and taking the
        // queue, so probe once more before paying for a transfer.
        if let Ok(fd) = self.cache.open(object) {
            self.signal_waiting_threads(Ok(fd), &object.id);
            return Ok(fd);
        }

        let result = self.download_and_commit(object, alt_url);
        self.signal_waiting_threads(result, &object.id);
        result
    }

    fn download_and_commit(&self, object: &LabeledObject, alt_url: Option<&str>) -> FetchResult {
        let mut txn = self.cache.start_txn(&object.id, object.label.size)?;
        txn.set_label(&object.label);

        let url = if object.label.is_external() {
            object.label.path.clone()
        } else {
            object.id.url()
        };
        debug!(hash = %object.id, url = %url, "downloading object");

        let status = {
            let mut sink = TxnSink { txn: txn.as_mut() };
            let mut job = DownloadJob::new(url, &mut sink);
            job.compression = object.label.compression;
            job.expected_hash = Some(object.id);
            job.alt_url = alt_url.map(str::to_owned);
            job.probe_hosts = !object.label.is_external();
            self.download.fetch(&mut job)
        };
        if let Err(err) = status {
            warn!(hash = %object.id, path = %object.label.path, error = %err, "download failed");
            let _ = self.cache.abort_txn(txn);
            return Err(CacheError::Io);
        }

        let fd = match self.cache.open_from_txn(txn.as_mut()) {
            Ok(fd) => fd,
            Err(e) => {
                let _ = self.cache.abort_txn(txn);
                return Err(e);
            }
        };
        if let Err(e) = self.cache.commit_txn(txn) {
            // The backing cache rejected the object (e.g. size mismatch,
            // quarantined there); the pre-commit descriptor is dead weight.
            let _ = self.cache.close(fd);
            return Err(e);
        }
        Ok(fd)
    }

    /// Retire the wait queue for `id` and hand every waiter its own value:
    /// a fresh duplicate of `result`'s descriptor, or the error.  A failed
    /// duplicate only affects that one waiter.
    fn signal_waiting_threads(&self, result: FetchResult, id: &ObjectId) {
        let waiters = self.queues().remove(id).unwrap_or_default();
        for waiter in waiters {
            let value = match result {
                Ok(fd) => self.cache.dup(fd),
                Err(e) => Err(e),
            };
            let _ = waiter.send(value);
        }
    }

    fn tls(&self) -> Arc<FetchTls> {
        let mut blocks = self.blocks();
        blocks
            .entry(thread::current().id())
            .or_insert_with(FetchTls::new)
            .clone()
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<ObjectId, Vec<Sender<FetchResult>>>> {
        self.queues_download
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn blocks(&self) -> MutexGuard<'_, HashMap<ThreadId, Arc<FetchTls>>> {
        self.tls_blocks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Fetcher {
    fn drop(&mut self) {
        // The active downloader always finishes signalling before its block
        // goes away, so at teardown no queue may be populated.
        if let Ok(queues) = self.queues_download.lock() {
            debug_assert!(queues.is_empty(), "fetcher dropped with downloads in flight");
        }
    }
}
