use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::PoisonError;

use super::paginate;
use super::BlobStore;
use super::ListPage;
use crate::error::BlobError;

/// S3 returns up to 1000 keys per listing page.
const DEFAULT_PAGE_SIZE: usize = 1000;

/// An object store that lives in process memory.  Besides serving as
/// a stand-in bucket, it counts requests and can simulate an outage,
/// which makes it the reference double for exercising the directory.
#[derive(Debug)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    page_size: usize,

    // When set, every request fails like an unreachable endpoint.
    offline: AtomicBool,

    gets: AtomicU64,
    heads: AtomicU64,
    puts: AtomicU64,
    lists: AtomicU64,
}

impl Default for MemoryBlobStore {
    fn default() -> MemoryBlobStore {
        MemoryBlobStore::with_page_size(DEFAULT_PAGE_SIZE)
    }
}

impl MemoryBlobStore {
    /// Returns an empty store.
    pub fn new() -> MemoryBlobStore {
        MemoryBlobStore::default()
    }

    /// Returns an empty store that lists at most `page_size` keys per
    /// page.
    pub fn with_page_size(page_size: usize) -> MemoryBlobStore {
        MemoryBlobStore {
            objects: Mutex::new(BTreeMap::new()),
            page_size: page_size.max(1),
            offline: AtomicBool::new(false),
            gets: AtomicU64::new(0),
            heads: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            lists: AtomicU64::new(0),
        }
    }

    /// Makes every subsequent request fail (`true`) or succeed again
    /// (`false`).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of `get` requests served so far.
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of `head` requests served so far.
    pub fn heads(&self) -> u64 {
        self.heads.load(Ordering::SeqCst)
    }

    /// Number of `put` requests served so far.
    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of `list_page` requests served so far.
    pub fn lists(&self) -> u64 {
        self.lists.load(Ordering::SeqCst)
    }

    /// Returns all keys currently stored, in order.
    pub fn keys(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }

    /// Stores `bytes` at `key` directly, bypassing request accounting
    /// and outages: this is how a test replaces an object out of band.
    pub fn insert(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        self.objects().insert(key.to_owned(), bytes.into());
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> Result<(), BlobError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(BlobError::Io(std::io::Error::new(
                ErrorKind::ConnectionRefused,
                "object store unreachable",
            )))
        } else {
            Ok(())
        }
    }

    fn lookup(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        self.objects()
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound {
                key: key.to_owned(),
            })
    }
}

impl BlobStore for MemoryBlobStore {
    fn list_page(&self, prefix: &str, marker: Option<&str>) -> Result<ListPage, BlobError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let keys = self
            .objects()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        Ok(paginate(keys, marker, self.page_size))
    }

    fn head(&self, key: &str) -> Result<u64, BlobError> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        self.objects()
            .get(key)
            .map(|bytes| bytes.len() as u64)
            .ok_or_else(|| BlobError::NotFound {
                key: key.to_owned(),
            })
    }

    fn get(&self, key: &str, dst: &mut dyn Write) -> Result<u64, BlobError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        // Copy out of the map before writing: `dst` may be slow.
        let bytes = self.lookup(key)?;
        dst.write_all(&bytes)?;
        Ok(bytes.len() as u64)
    }

    fn put(&self, key: &str, src: &mut dyn Read) -> Result<u64, BlobError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;

        let mut bytes = Vec::new();
        src.read_to_end(&mut bytes)?;

        let len = bytes.len() as u64;
        self.objects().insert(key.to_owned(), bytes);
        Ok(len)
    }

    fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.check_online()?;

        self.objects().remove(key);
        Ok(())
    }
}

#[test]
fn smoke_test() {
    let store = MemoryBlobStore::new();

    store.put_bytes("a/1", b"one").expect("put must succeed");
    store.put_bytes("a/2", b"two!").expect("put must succeed");
    store.put_bytes("b/1", b"other").expect("put must succeed");

    assert_eq!(store.head("a/2").expect("head must succeed"), 4);
    assert_eq!(store.get_bytes("a/1").expect("get must succeed"), b"one");
    assert!(store.exists("b/1").expect("exists must succeed"));
    assert!(!store.exists("b/2").expect("exists must succeed"));
    assert!(store.head("b/2").expect_err("must fail").is_not_found());

    assert_eq!(
        super::list_all(&store, "a/").expect("list must succeed"),
        vec!["a/1", "a/2"]
    );

    store.delete("a/1").expect("delete must succeed");
    // Deleting again is fine.
    store.delete("a/1").expect("delete must succeed");
    assert_eq!(store.keys(), vec!["a/2", "b/1"]);
}

#[test]
fn test_paged_listing() {
    let store = MemoryBlobStore::with_page_size(3);

    for i in 0..10 {
        store.insert(&format!("dir/{:02}", i), vec![0u8; i]);
    }

    let keys = super::list_all(&store, "dir/").expect("list must succeed");
    assert_eq!(keys.len(), 10);
    // 3 + 3 + 3 + 1.
    assert_eq!(store.lists(), 4);
}

#[test]
fn test_offline() {
    let store = MemoryBlobStore::new();
    store.insert("key", b"value".to_vec());

    store.set_offline(true);
    assert!(matches!(store.head("key"), Err(BlobError::Io(_))));
    assert!(matches!(store.get_bytes("key"), Err(BlobError::Io(_))));
    assert!(store.list_page("", None).is_err());

    store.set_offline(false);
    assert_eq!(store.get_bytes("key").expect("get must succeed"), b"value");
    assert_eq!(store.gets(), 2);
}
