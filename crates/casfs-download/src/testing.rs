//! In-memory transport and sink helpers for tests.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use casfs_hash::ObjectId;

use crate::{
    decode_and_verify, push_to_sink, Compression, DownloadError, DownloadJob, DownloadManager,
    Result, Sink,
};

/// Sink that appends everything into a buffer and counts resets.
#[derive(Debug, Default)]
pub struct CollectSink {
    pub data: Vec<u8>,
    pub resets: usize,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sink for CollectSink {
    fn write(&mut self, data: &[u8]) -> io::Result<u64> {
        self.data.extend_from_slice(data);
        Ok(data.len() as u64)
    }

    fn reset(&mut self) -> io::Result<()> {
        self.data.clear();
        self.resets += 1;
        Ok(())
    }
}

/// zlib-compress a payload the way repository mirrors store it.
pub fn zlib_compress(payload: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(payload).expect("write to Vec");
    encoder.finish().expect("finish to Vec")
}

/// In-memory transport: a url → raw-bytes map plus fault injection.
///
/// `truncated_attempts` makes the next n deliveries abort halfway and retry
/// internally (after `Sink::reset`), the way a real transport fails over to
/// a mirror mid-transfer.  `latency` delays every job, which lets tests pile
/// concurrent requests onto one in-flight download.
#[derive(Default)]
pub struct MemDownloadManager {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    jobs: AtomicUsize,
    truncated_attempts: AtomicUsize,
    latency: Option<Duration>,
}

impl MemDownloadManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Store raw bytes under an explicit url.
    pub fn insert_raw(&self, url: impl Into<String>, raw: Vec<u8>) {
        self.objects.lock().unwrap().insert(url.into(), raw);
    }

    /// Store a payload under an explicit url, compressed as requested.
    pub fn insert_payload_at(
        &self,
        url: impl Into<String>,
        payload: &[u8],
        compression: Compression,
    ) {
        let raw = match compression {
            Compression::Zlib => zlib_compress(payload),
            Compression::None => payload.to_vec(),
        };
        self.insert_raw(url, raw);
    }

    /// Store a payload under the canonical url of `id`.
    pub fn insert_object(&self, id: &ObjectId, payload: &[u8], compression: Compression) {
        self.insert_payload_at(id.url(), payload, compression);
    }

    /// Number of fetch jobs submitted so far.
    pub fn job_count(&self) -> usize {
        self.jobs.load(Ordering::SeqCst)
    }

    /// Make the next `n` deliveries abort halfway and retry internally.
    pub fn set_truncated_attempts(&self, n: usize) {
        self.truncated_attempts.store(n, Ordering::SeqCst);
    }

    fn lookup(&self, url: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(url).cloned()
    }
}

impl DownloadManager for MemDownloadManager {
    fn fetch(&self, job: &mut DownloadJob<'_>) -> Result<()> {
        self.jobs.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }

        let raw = match self.lookup(&job.url) {
            Some(raw) => raw,
            None => match job.alt_url.as_deref().and_then(|alt| self.lookup(alt)) {
                Some(raw) => raw,
                None => return Err(DownloadError::NotFound),
            },
        };

        let plain = decode_and_verify(&raw, job.compression, job.expected_hash.as_ref())?;

        if self
            .truncated_attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            // Interrupted transfer: deliver half, then restart from scratch.
            push_to_sink(&plain[..plain.len() / 2], job.sink)?;
            job.sink.reset()?;
        }

        push_to_sink(&plain, job.sink)
    }
}
