//! # casfs-fetch
//!
//! Turns object hashes into open cache descriptors, downloading on demand.
//!
//! The [`Fetcher`] collapses concurrent requests for the same hash into a
//! single download: the first thread to miss becomes the active downloader
//! and commits the object into the backing cache through a transaction;
//! every thread that asks for the same hash in the meantime blocks on its
//! own wakeup channel and is handed a privately duplicated descriptor (or
//! the downloader's exact error) when the download settles.

mod fetcher;

pub use fetcher::Fetcher;
