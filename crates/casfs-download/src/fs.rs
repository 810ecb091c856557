//! Transport for local mirror directories.
//!
//! Each host is a directory holding the repository object tree
//! (`<host>/data/ab/cdef...`).  Hosts are tried in order; only "file does
//! not exist" advances to the next host, every other error is fatal for the
//! job.  Mostly used for locally synced mirrors and in tests.

use std::io;
use std::path::PathBuf;

use casfs_config::FetchConfig;
use tracing::debug;

use crate::{decode_and_verify, push_to_sink, DownloadError, DownloadJob, DownloadManager, Result};

pub struct FsDownloadManager {
    hosts: Vec<PathBuf>,
}

impl FsDownloadManager {
    pub fn new(hosts: Vec<PathBuf>) -> Self {
        Self { hosts }
    }

    pub fn from_config(config: &FetchConfig) -> Self {
        Self::new(config.mirrors.iter().map(PathBuf::from).collect())
    }

    fn read_from_hosts(&self, url: &str) -> Result<Vec<u8>> {
        let relative = url.trim_start_matches('/');
        for host in &self.hosts {
            let path = host.join(relative);
            match std::fs::read(&path) {
                Ok(bytes) => {
                    debug!(host = %host.display(), url, n_bytes = bytes.len(), "mirror hit");
                    return Ok(bytes);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(DownloadError::NotFound)
    }
}

impl DownloadManager for FsDownloadManager {
    fn fetch(&self, job: &mut DownloadJob<'_>) -> Result<()> {
        let raw = match self.read_from_hosts(&job.url) {
            Ok(raw) => raw,
            Err(DownloadError::NotFound) => match &job.alt_url {
                Some(alt) => self.read_from_hosts(alt)?,
                None => return Err(DownloadError::NotFound),
            },
            Err(e) => return Err(e),
        };
        let plain = decode_and_verify(&raw, job.compression, job.expected_hash.as_ref())?;
        push_to_sink(&plain, job.sink)
    }
}
