//! Fetcher scenarios against the real in-memory cache and transports.

use std::sync::Arc;
use std::time::Duration;

use casfs_cache::{
    CacheError, CacheManager, Compression, InMemoryCacheManager, Label, LabeledObject,
    SIZE_UNKNOWN,
};
use casfs_download::testing::{zlib_compress, MemDownloadManager};
use casfs_download::{DownloadManager, FsDownloadManager};
use casfs_fetch::Fetcher;
use casfs_hash::{Algorithm, ObjectId, Suffix};

fn id_of(data: &[u8]) -> ObjectId {
    ObjectId::from_digest(Algorithm::Sha256, data, Suffix::Data)
}

fn read_all(cache: &Arc<dyn CacheManager>, fd: i32) -> Vec<u8> {
    let size = cache.get_size(fd).unwrap();
    let mut buf = vec![0u8; size as usize];
    let n = cache.pread(fd, &mut buf, 0).unwrap();
    buf.truncate(n as usize);
    buf
}

#[test]
fn test_cache_hit_needs_no_network() {
    let cache = Arc::new(InMemoryCacheManager::new());
    let transport = Arc::new(MemDownloadManager::new());

    let id = id_of(b"x");
    cache.commit_from_mem(&LabeledObject::new(id), b"x").unwrap();

    let fetcher = Fetcher::new(cache.clone(), Arc::clone(&transport) as Arc<dyn DownloadManager>);
    let mut label = Label::default();
    label.size = 1;
    let fd = fetcher
        .fetch(&LabeledObject::with_label(id, label.clone()))
        .unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(fetcher.cache_manager().pread(fd, &mut buf, 0).unwrap(), 1);
    assert_eq!(buf[0], b'x');
    fetcher.cache_manager().close(fd).unwrap();

    // The label does not participate in identity: a catalog-flagged request
    // for the same hash is the same cache hit.
    label.flags = Label::CATALOG;
    let fd = fetcher
        .fetch(&LabeledObject::with_label(id, label))
        .unwrap();
    fetcher.cache_manager().close(fd).unwrap();

    assert_eq!(transport.job_count(), 0);
}

#[test]
fn test_miss_downloads_then_hits() {
    let cache = Arc::new(InMemoryCacheManager::new());
    let transport = Arc::new(MemDownloadManager::new());

    let id = id_of(b"payload");
    transport.insert_object(&id, b"payload", Compression::Zlib);

    let fetcher = Fetcher::new(cache.clone(), Arc::clone(&transport) as Arc<dyn DownloadManager>);
    let mut label = Label::default();
    label.path = "reg".into();
    label.size = SIZE_UNKNOWN;
    let object = LabeledObject::with_label(id, label);

    let fd = fetcher.fetch(&object).unwrap();
    assert_eq!(read_all(fetcher.cache_manager(), fd), b"payload");
    fetcher.cache_manager().close(fd).unwrap();
    assert!(cache.contains(&id));
    assert_eq!(transport.job_count(), 1);

    // Second fetch is answered by the fast-path cache probe.
    let fd = fetcher.fetch(&object).unwrap();
    fetcher.cache_manager().close(fd).unwrap();
    assert_eq!(transport.job_count(), 1);
}

#[test]
fn test_concurrent_misses_collapse_into_one_download() {
    let cache = Arc::new(InMemoryCacheManager::new());
    let transport =
        Arc::new(MemDownloadManager::new().with_latency(Duration::from_millis(100)));

    let id = ObjectId::from_digest(Algorithm::Sha256, b"catalog blob", Suffix::Catalog);
    transport.insert_object(&id, b"catalog blob", Compression::Zlib);

    let mut label = Label::default();
    label.flags = Label::CATALOG;
    label.path = "cat".into();
    let object = LabeledObject::with_label(id, label);

    let fetcher = Arc::new(Fetcher::new(cache.clone(), Arc::clone(&transport) as Arc<dyn DownloadManager>));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let fetcher = Arc::clone(&fetcher);
        let object = object.clone();
        handles.push(std::thread::spawn(move || fetcher.fetch(&object)));
    }

    let fds: Vec<i32> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap())
        .collect();

    // Exactly one transfer, N private descriptors with the same bytes.
    assert_eq!(transport.job_count(), 1);
    for fd in fds {
        assert_eq!(read_all(fetcher.cache_manager(), fd), b"catalog blob");
        fetcher.cache_manager().close(fd).unwrap();
    }
    assert_eq!(cache.open_fd_count(), 0);
}

#[test]
fn test_download_failure_leaves_cache_clean() {
    let cache = Arc::new(InMemoryCacheManager::new());
    let transport = Arc::new(MemDownloadManager::new());

    let id = id_of(b"never published");
    let fetcher = Fetcher::new(cache.clone(), Arc::clone(&transport) as Arc<dyn DownloadManager>);
    let mut label = Label::default();
    label.path = "rnd".into();
    let object = LabeledObject::with_label(id, label);

    assert_eq!(fetcher.fetch(&object), Err(CacheError::Io));
    assert!(!cache.contains(&id));

    // No negative caching: the next call pays for a new request.
    assert_eq!(fetcher.fetch(&object), Err(CacheError::Io));
    assert_eq!(transport.job_count(), 2);
}

#[test]
fn test_size_mismatch_quarantines() {
    let cache = Arc::new(InMemoryCacheManager::new());
    let transport = Arc::new(MemDownloadManager::new());

    let id = ObjectId::from_digest(Algorithm::Sha256, b"z", Suffix::Certificate);
    transport.insert_object(&id, b"z", Compression::Zlib);

    let fetcher = Fetcher::new(cache.clone(), Arc::clone(&transport) as Arc<dyn DownloadManager>);

    // The label announces two bytes; the object has one.
    let mut label = Label::default();
    label.size = 2;
    assert_eq!(
        fetcher.fetch(&LabeledObject::with_label(id, label)),
        Err(CacheError::Io)
    );
    assert!(!cache.contains(&id));
    assert!(cache.is_quarantined(&id));

    // With the right size the same object fetches fine.
    let mut label = Label::default();
    label.size = 1;
    let fd = fetcher
        .fetch(&LabeledObject::with_label(id, label))
        .unwrap();
    fetcher.cache_manager().close(fd).unwrap();
}

#[test]
fn test_compression_label_must_match() {
    let cache = Arc::new(InMemoryCacheManager::new());
    let transport = Arc::new(MemDownloadManager::new());

    // Stored verbatim on the mirror, but fetched with the default
    // zlib label: inflate fails, the fetch reports I/O.
    let id = id_of(b"u");
    transport.insert_object(&id, b"u", Compression::None);

    let fetcher = Fetcher::new(cache.clone(), Arc::clone(&transport) as Arc<dyn DownloadManager>);
    let mut label = Label::default();
    label.size = 1;
    label.path = "u".into();
    assert_eq!(
        fetcher.fetch(&LabeledObject::with_label(id, label.clone())),
        Err(CacheError::Io)
    );

    label.compression = Compression::None;
    let fd = fetcher
        .fetch(&LabeledObject::with_label(id, label))
        .unwrap();
    assert_eq!(read_all(fetcher.cache_manager(), fd), b"u");
    fetcher.cache_manager().close(fd).unwrap();
}

#[test]
fn test_alt_path_fallback() {
    let cache = Arc::new(InMemoryCacheManager::new());
    let transport = Arc::new(MemDownloadManager::new());

    let id = id_of(b"relocated");
    // Only available under the alternative path.
    transport.insert_payload_at("altpath", b"relocated", Compression::Zlib);

    let fetcher = Fetcher::new(cache.clone(), Arc::clone(&transport) as Arc<dyn DownloadManager>);
    let object = LabeledObject::new(id);
    assert_eq!(fetcher.fetch(&object), Err(CacheError::Io));

    let fd = fetcher.fetch_alt(&object, "altpath").unwrap();
    assert_eq!(read_all(fetcher.cache_manager(), fd), b"relocated");
    fetcher.cache_manager().close(fd).unwrap();
}

#[test]
fn test_external_objects_fetch_by_path() {
    let cache = Arc::new(InMemoryCacheManager::new());
    let transport = Arc::new(MemDownloadManager::new());

    let id = id_of(b"external data");
    transport.insert_payload_at("/pub/reg", b"external data", Compression::Zlib);

    let fetcher = Fetcher::new(cache.clone(), Arc::clone(&transport) as Arc<dyn DownloadManager>);

    // Wrong path: the transfer fails and nothing is cached.
    let mut label = Label::default();
    label.flags = Label::EXTERNAL;
    label.path = "/pub/reg-fail".into();
    assert_eq!(
        fetcher.fetch(&LabeledObject::with_label(id, label.clone())),
        Err(CacheError::Io)
    );

    label.path = "/pub/reg".into();
    let fd = fetcher
        .fetch(&LabeledObject::with_label(id, label))
        .unwrap();
    assert_eq!(read_all(fetcher.cache_manager(), fd), b"external data");
    fetcher.cache_manager().close(fd).unwrap();
    assert!(cache.contains(&id));
}

#[test]
fn test_readonly_cache_fails_the_transaction() {
    let cache = Arc::new(InMemoryCacheManager::new());
    let transport = Arc::new(MemDownloadManager::new());

    let id = id_of(b"w");
    transport.insert_object(&id, b"w", Compression::Zlib);

    cache.set_readonly(true);
    let fetcher = Fetcher::new(cache.clone(), Arc::clone(&transport) as Arc<dyn DownloadManager>);
    assert_eq!(
        fetcher.fetch(&LabeledObject::new(id)),
        Err(CacheError::ReadOnly)
    );
    assert_eq!(transport.job_count(), 0);
}

#[test]
fn test_fetch_from_mirror_directory() {
    let mirror = tempfile::TempDir::new().unwrap();

    let id = id_of(b"on disk");
    let path = mirror.path().join(id.url());
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, zlib_compress(b"on disk")).unwrap();

    let cache = Arc::new(InMemoryCacheManager::new());
    let transport = Arc::new(FsDownloadManager::new(vec![mirror.path().to_path_buf()]));

    let fetcher = Fetcher::new(cache.clone(), transport);
    let fd = fetcher.fetch(&LabeledObject::new(id)).unwrap();
    assert_eq!(read_all(fetcher.cache_manager(), fd), b"on disk");
    fetcher.cache_manager().close(fd).unwrap();
    assert!(cache.contains(&id));

    // Now present locally: a second fetch never touches the mirror.
    std::fs::remove_dir_all(mirror.path().join("data")).unwrap();
    let fd = fetcher.fetch(&LabeledObject::new(id)).unwrap();
    fetcher.cache_manager().close(fd).unwrap();
}
