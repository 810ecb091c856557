//! # casfs-download
//!
//! The transport contract of the casfs client: a [`DownloadManager`] turns a
//! [`DownloadJob`] into a sequence of [`Sink::write`] calls delivering the
//! decompressed, hash-verified object payload.
//!
//! Retries, mirror selection and decompression are transport concerns; the
//! cache layers above submit one job and observe either a fully delivered
//! payload or an error.  [`FsDownloadManager`] is the bundled transport for
//! local mirror directories; `testing` has an in-memory transport with fault
//! injection.

mod fs;
pub mod testing;

pub use fs::FsDownloadManager;

use std::io::{self, Read};

use casfs_hash::ObjectId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("object not available on any host")]
    NotFound,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("decompression failed: {0}")]
    Decompress(io::Error),

    #[error("content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Transfer compression of an object as stored on mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// zlib-deflate, the repository default.
    #[default]
    Zlib,
    /// Stored verbatim.
    None,
}

/// Consumer of a downloaded payload.
///
/// `write` reports how many bytes it accepted (normally the full chunk);
/// `reset` reverts all state so a transport-side retry can re-deliver the
/// object from scratch.
pub trait Sink: Send {
    fn write(&mut self, data: &[u8]) -> io::Result<u64>;
    fn reset(&mut self) -> io::Result<()>;
}

/// One download request.
pub struct DownloadJob<'a> {
    /// Path of the object relative to a mirror root (`data/ab/cdef...`).
    pub url: String,
    /// Fallback path tried when `url` is absent on all hosts.
    pub alt_url: Option<String>,
    /// Transfer compression to undo before delivery.
    pub compression: Compression,
    /// Whether the transport may probe and reorder its hosts.
    pub probe_hosts: bool,
    /// Content hash the decompressed payload must match.
    pub expected_hash: Option<ObjectId>,
    /// Receiver of the payload.
    pub sink: &'a mut dyn Sink,
}

impl<'a> DownloadJob<'a> {
    pub fn new(url: impl Into<String>, sink: &'a mut dyn Sink) -> Self {
        Self {
            url: url.into(),
            alt_url: None,
            compression: Compression::default(),
            probe_hosts: true,
            expected_hash: None,
            sink,
        }
    }
}

/// A download transport.  Implementations own connection handling, mirror
/// fallback and retries; a returned error means the job is not deliverable.
pub trait DownloadManager: Send + Sync {
    fn fetch(&self, job: &mut DownloadJob<'_>) -> Result<()>;
}

/// Chunk size used when pushing a payload into a sink.
pub(crate) const DELIVERY_CHUNK: usize = 32 * 1024;

/// Undo transfer compression and check the payload against the expected hash.
pub(crate) fn decode_and_verify(
    raw: &[u8],
    compression: Compression,
    expected: Option<&ObjectId>,
) -> Result<Vec<u8>> {
    let plain = match compression {
        Compression::None => raw.to_vec(),
        Compression::Zlib => {
            let mut out = Vec::new();
            let mut decoder = flate2::read::ZlibDecoder::new(raw);
            decoder
                .read_to_end(&mut out)
                .map_err(DownloadError::Decompress)?;
            out
        }
    };

    if let Some(expected) = expected {
        let actual = ObjectId::from_digest(expected.algorithm, &plain, expected.suffix);
        if actual != *expected {
            return Err(DownloadError::HashMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
    }
    Ok(plain)
}

/// Push a payload into a sink chunk by chunk.
pub(crate) fn push_to_sink(plain: &[u8], sink: &mut dyn Sink) -> Result<()> {
    for chunk in plain.chunks(DELIVERY_CHUNK) {
        let consumed = sink.write(chunk)?;
        if consumed != chunk.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "sink consumed fewer bytes than delivered",
            )
            .into());
        }
    }
    Ok(())
}
