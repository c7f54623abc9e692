//! A `VirtualDirectory` presents the objects under one catalog prefix
//! as a flat directory of files.  Metadata calls (listing, existence,
//! length) always ask the object store and degrade to safe defaults
//! when it fails.  Data flows through the local cache: reads fetch the
//! whole object into the cache on open, and writes go to the cache
//! and are uploaded in one piece on close.
//!
//! Within a process, the directory serialises cache population and
//! replacement per logical name with a [`FileMutexRegistry`].  Across
//! processes, callers coordinate with the lease locks handed out by
//! [`VirtualDirectory::make_lock`].
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;

use derivative::Derivative;

use crate::blob::list_all;
use crate::blob::BlobStore;
use crate::cache::CacheStore;
use crate::cache::LocalCache;
use crate::catalog::Catalog;
use crate::catalog::DEFAULT_CATALOG;
use crate::error::BlobError;
use crate::error::Error;
use crate::error::Result;
use crate::input::RemoteInput;
use crate::lease::LeaseConfig;
use crate::lease::LeaseLock;
use crate::mutex::FileMutexRegistry;
use crate::output::RemoteOutput;
use crate::output::SharedWriter;
use crate::settings::Settings;

/// Cache directories default to `$TMPDIR/blobdir/$catalog`.
const DEFAULT_CACHE_SUBDIR: &str = "blobdir";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Converts a failed download of `key` into the directory's error.
fn fetch_error(name: &str, key: &str, source: BlobError) -> Error {
    if source.is_not_found() {
        Error::NotFound {
            name: name.to_owned(),
        }
    } else {
        Error::Fetch {
            key: key.to_owned(),
            source,
        }
    }
}

/// Constructs a [`VirtualDirectory`].
///
/// The catalog defaults to `index`, at the root of the store; the
/// cache directory defaults to `$TMPDIR/blobdir/$catalog`.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct DirectoryBuilder {
    #[derivative(Debug = "ignore")]
    store: Arc<dyn BlobStore>,
    folder: String,
    catalog: String,
    cache_dir: Option<PathBuf>,
    cache_store: Option<Arc<dyn CacheStore>>,
    lease: LeaseConfig,
}

impl DirectoryBuilder {
    /// Returns a builder for a directory over `store`.
    pub fn new(store: Arc<dyn BlobStore>) -> DirectoryBuilder {
        DirectoryBuilder {
            store,
            folder: String::new(),
            catalog: DEFAULT_CATALOG.to_owned(),
            cache_dir: None,
            cache_store: None,
            lease: LeaseConfig::default(),
        }
    }

    /// Names the catalog under the bucket folder.  A blank catalog
    /// means `index`.
    pub fn catalog(mut self, catalog: impl Into<String>) -> DirectoryBuilder {
        self.catalog = catalog.into();
        self
    }

    /// Places the catalog under `folder` (which may itself span
    /// several `/`-separated segments).
    pub fn bucket_folder(mut self, folder: impl Into<String>) -> DirectoryBuilder {
        self.folder = folder.into();
        self
    }

    /// Keeps cached copies in `cache_dir`.
    pub fn cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> DirectoryBuilder {
        self.cache_dir = Some(cache_dir.into());
        self
    }

    /// Uses `cache_store` for cached copies instead of a [`LocalCache`].
    /// Overrides [`DirectoryBuilder::cache_dir`].
    pub fn cache_store(mut self, cache_store: Arc<dyn CacheStore>) -> DirectoryBuilder {
        self.cache_store = Some(cache_store);
        self
    }

    /// Configures the leases of locks made by the directory.
    pub fn lease(mut self, lease: LeaseConfig) -> DirectoryBuilder {
        self.lease = lease;
        self
    }

    /// Applies the folder and catalog options of parsed connection
    /// settings.  Credentials and endpoints are for whoever constructs
    /// the [`BlobStore`].
    pub fn settings(mut self, settings: &Settings) -> DirectoryBuilder {
        if let Some(folder) = &settings.bucket_folder {
            self.folder = folder.clone();
        }

        if let Some(catalog) = &settings.catalog {
            self.catalog = catalog.clone();
        }

        self
    }

    /// Returns the directory.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the default local cache directory cannot be
    /// created.
    pub fn build(self) -> Result<VirtualDirectory> {
        let catalog = Catalog::within(&self.folder, &self.catalog);
        let cache: Arc<dyn CacheStore> = match self.cache_store {
            Some(cache) => cache,
            None => {
                let cache_dir = self.cache_dir.unwrap_or_else(|| {
                    let mut dir = std::env::temp_dir();
                    dir.push(DEFAULT_CACHE_SUBDIR);
                    dir.push(catalog.path());
                    dir
                });

                Arc::new(LocalCache::new(cache_dir)?)
            }
        };

        tracing::debug!(catalog = %catalog.path(), ?cache, "opened virtual directory");
        Ok(VirtualDirectory {
            inner: Arc::new(Inner {
                catalog,
                store: self.store,
                cache,
                mutexes: FileMutexRegistry::new(),
                outputs: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                lease: self.lease,
            }),
        })
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
struct Inner {
    catalog: Catalog,
    #[derivative(Debug = "ignore")]
    store: Arc<dyn BlobStore>,
    cache: Arc<dyn CacheStore>,
    #[derivative(Debug = "ignore")]
    mutexes: FileMutexRegistry,
    // The most recent output created for each name, for `sync`.
    #[derivative(Debug = "ignore")]
    outputs: Mutex<HashMap<String, Weak<Mutex<Option<BufWriter<File>>>>>>,
    #[derivative(Debug = "ignore")]
    locks: Mutex<HashMap<String, Arc<LeaseLock>>>,
    lease: LeaseConfig,
}

/// A flat directory of files backed by an object store, with a local
/// cache.  Clones share the same cache bookkeeping, mutexes, and
/// locks.
#[derive(Clone, Debug)]
pub struct VirtualDirectory {
    inner: Arc<Inner>,
}

impl VirtualDirectory {
    /// Returns the directory's catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    /// Returns the directory's name: the last segment of its catalog.
    pub fn name(&self) -> &str {
        self.inner.catalog.leaf()
    }

    /// Returns the backing object store.
    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.inner.store
    }

    /// Returns the local cache.
    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.inner.cache
    }

    pub(crate) fn mutexes(&self) -> &FileMutexRegistry {
        &self.inner.mutexes
    }

    /// Lists the logical names of every file in the directory, sorted.
    /// Returns an empty list if the object store fails.
    pub fn list_all(&self) -> Vec<String> {
        let catalog = &self.inner.catalog;

        match list_all(&*self.inner.store, &catalog.prefix()) {
            Ok(keys) => {
                let mut names: Vec<String> = keys
                    .iter()
                    .filter_map(|key| catalog.name(key))
                    .map(str::to_owned)
                    .collect();
                names.sort();
                names.dedup();
                names
            }
            Err(e) => {
                tracing::warn!(catalog = %catalog.path(), error = %e, "failed to list directory");
                Vec::new()
            }
        }
    }

    /// Returns whether `name` exists in the object store.  This never
    /// consults the cache, and returns `false` if the store fails.
    pub fn file_exists(&self, name: &str) -> bool {
        let key = match self.inner.catalog.key(name) {
            Ok(key) => key,
            Err(_) => return false,
        };

        match self.inner.store.exists(&key) {
            Ok(exists) => exists,
            Err(e) => {
                tracing::debug!(%key, error = %e, "failed to probe object");
                false
            }
        }
    }

    /// Returns the length of the remote object for `name`, or 0 if it
    /// does not exist or the store fails.
    pub fn file_length(&self, name: &str) -> u64 {
        let key = match self.inner.catalog.key(name) {
            Ok(key) => key,
            Err(_) => return 0,
        };

        match self.inner.store.head(&key) {
            Ok(length) => length,
            Err(e) if e.is_not_found() => 0,
            Err(e) => {
                tracing::warn!(%key, error = %e, "failed to read object length");
                0
            }
        }
    }

    /// Deletes the remote object for `name`, then any cached copy.
    /// `name` may also be a key qualified with the catalog prefix.
    /// Deleting a missing file succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Delete`] if the object store refuses the
    /// delete.  Failing to delete the cached copy is only logged: the
    /// next open notices the remote object is gone.
    pub fn delete_file(&self, name: &str) -> Result<()> {
        let name = self.inner.catalog.unqualify(name);
        let key = self.inner.catalog.key(name)?;

        let remote = self.inner.store.delete(&key);

        // Drop the cached copy even when the remote delete fails.
        self.inner.mutexes.with_lock(name, || {
            if let Err(e) = self.inner.cache.delete(name) {
                tracing::warn!(name, error = %e, "failed to delete cached copy");
            }
        });

        remote.map_err(|source| Error::Delete {
            key: key.clone(),
            source,
        })?;
        tracing::debug!(%key, "deleted file");
        Ok(())
    }

    /// Opens `name` for reading.  Fetches the remote object into the
    /// cache first, unless the cached copy has the same length as the
    /// remote object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if there is no remote object, and
    /// [`Error::Fetch`] if the object store fails.
    pub fn open_input(&self, name: &str) -> Result<RemoteInput> {
        let key = self.inner.catalog.key(name)?;
        let file = self
            .inner
            .mutexes
            .with_lock(name, || self.ensure_cached(name, &key))?;

        RemoteInput::new(self.clone(), name.to_owned(), file)
    }

    /// Returns an open handle on an up-to-date cached copy of `name`.
    /// Must be called with `name`'s mutex held.
    fn ensure_cached(&self, name: &str, key: &str) -> Result<File> {
        let cache = &self.inner.cache;

        match cache.length(name)? {
            None => {
                tracing::debug!(name, %key, "cache miss");
                self.download(name, key)?;
            }
            Some(cached) => {
                let remote = self
                    .inner
                    .store
                    .head(key)
                    .map_err(|source| fetch_error(name, key, source))?;

                if cached != remote {
                    tracing::debug!(name, %key, cached, remote, "stale cached copy");
                    self.download(name, key)?;
                }
            }
        }

        cache.open(name)?.ok_or_else(|| Error::NotFound {
            name: name.to_owned(),
        })
    }

    fn download(&self, name: &str, key: &str) -> Result<u64> {
        let mut staged = self.inner.cache.stage(name)?;
        let length = self
            .inner
            .store
            .get(key, staged.as_file_mut())
            .map_err(|source| fetch_error(name, key, source))?;

        self.inner.cache.publish(name, staged)?;
        tracing::debug!(name, %key, length, "fetched object into cache");
        Ok(length)
    }

    pub(crate) fn upload(&self, key: &str, src: &mut File) -> Result<u64> {
        let length = self
            .inner
            .store
            .put(key, src)
            .map_err(|source| Error::Publish {
                key: key.to_owned(),
                source,
            })?;

        tracing::debug!(%key, length, "published object");
        Ok(length)
    }

    /// Creates `name` for writing, replacing any cached copy.  The
    /// remote object is only replaced when the output is closed.
    pub fn create_output(&self, name: &str) -> Result<RemoteOutput> {
        let key = self.inner.catalog.key(name)?;
        let file = self
            .inner
            .mutexes
            .with_lock(name, || self.inner.cache.create(name))?;

        let writer: SharedWriter = Arc::new(Mutex::new(Some(BufWriter::new(file))));
        lock(&self.inner.outputs).insert(name.to_owned(), Arc::downgrade(&writer));

        Ok(RemoteOutput::new(self.clone(), name.to_owned(), key, writer))
    }

    /// Flushes the buffered bytes of the open outputs for `names` to
    /// their cached copies.  Names without an open output are skipped.
    /// This does not publish anything.
    pub fn sync<I, S>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        use std::io::Write;

        for name in names {
            let name = name.as_ref();
            let writer = match lock(&self.inner.outputs).get(name).and_then(Weak::upgrade) {
                Some(writer) => writer,
                None => continue,
            };

            if let Some(writer) = lock(&writer).as_mut() {
                writer.flush()?;
            };
        }

        Ok(())
    }

    /// Uploads the cached copy of `name` as the remote object.  This is
    /// how callers retry a [`RemoteOutput::close`] that failed with
    /// [`Error::Publish`].
    pub fn publish(&self, name: &str) -> Result<u64> {
        let key = self.inner.catalog.key(name)?;

        self.inner.mutexes.with_lock(name, || -> Result<u64> {
            let mut file = self.inner.cache.open(name)?.ok_or_else(|| Error::NotFound {
                name: name.to_owned(),
            })?;

            self.upload(&key, &mut file)
        })
    }

    /// Returns the lock named `name`, stored as an object in the
    /// catalog.  Every call with the same name returns the same lock.
    pub fn make_lock(&self, name: &str) -> Result<Arc<LeaseLock>> {
        let key = self.inner.catalog.key(name)?;
        let mut locks = lock(&self.inner.locks);

        let lock = locks
            .entry(name.to_owned())
            .or_insert_with(|| {
                Arc::new(LeaseLock::new(
                    self.inner.store.clone(),
                    key,
                    self.inner.lease,
                ))
            })
            .clone();
        Ok(lock)
    }

    /// Forcibly releases the lock named `name`, whoever holds it.
    pub fn clear_lock(&self, name: &str) -> Result<()> {
        self.make_lock(name)?.break_lock();
        Ok(())
    }

    /// Deletes every cached copy.  Remote objects are untouched.
    pub fn clear_cache(&self) -> Result<()> {
        for name in self.inner.cache.list()? {
            self.inner
                .mutexes
                .with_lock(&name, || self.inner.cache.delete(&name))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::io::Read;
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;
    use proptest_derive::Arbitrary;
    use test_dir::{DirBuilder, TestDir};

    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::LockStatus;

    fn directory(store: &Arc<MemoryBlobStore>, temp: &TestDir, cache: &str) -> VirtualDirectory {
        DirectoryBuilder::new(store.clone())
            .cache_dir(temp.path(cache))
            .build()
            .expect("build must succeed")
    }

    fn read_all(directory: &VirtualDirectory, name: &str) -> Vec<u8> {
        let mut input = directory.open_input(name).expect("open must succeed");
        let mut dst = Vec::new();

        input.read_to_end(&mut dst).expect("read must succeed");
        dst
    }

    fn write_all(directory: &VirtualDirectory, name: &str, bytes: &[u8]) {
        let mut output = directory.create_output(name).expect("create must succeed");

        output.write_bytes(bytes).expect("write must succeed");
        output.close().expect("close must succeed");
    }

    /// Walk through the lifecycle of a small index file, counting
    /// remote requests.
    #[test]
    fn test_segments_scenario() {
        let temp = TestDir::temp();
        let store = Arc::new(MemoryBlobStore::new());
        let directory = DirectoryBuilder::new(store.clone())
            .bucket_folder("tenant")
            .catalog("idx")
            .cache_dir(temp.path("cache"))
            .build()
            .expect("build must succeed");

        assert_eq!(directory.name(), "idx");
        assert!(directory.list_all().is_empty());

        let bytes: Vec<u8> = (0..10).collect();
        write_all(&directory, "segments.gen", &bytes);
        assert_eq!(store.keys(), vec!["tenant/idx/segments.gen"]);
        assert_eq!(directory.list_all(), vec!["segments.gen"]);
        assert!(directory.file_exists("segments.gen"));
        assert_eq!(directory.file_length("segments.gen"), 10);

        // The writer's cached copy already matches: no download.
        let mut input = directory.open_input("segments.gen").expect("open must succeed");
        assert_eq!(store.gets(), 0);
        assert_eq!(input.length(), 10);
        let mut dst = [0u8; 10];
        input.read_bytes(&mut dst).expect("read must succeed");
        assert_eq!(&dst[..], &bytes[..]);
        input.seek_to(7).expect("seek must succeed");
        assert_eq!(input.read_byte().expect("read must succeed"), 7);
        drop(input);

        directory.delete_file("segments.gen").expect("delete must succeed");
        assert!(!directory.file_exists("segments.gen"));
        assert!(directory.list_all().is_empty());
        assert!(!directory.cache().exists("segments.gen").expect("exists must succeed"));
        assert!(matches!(directory.open_input("segments.gen"), Err(Error::NotFound { .. })));
    }

    /// A second directory instance, with its own cache, sees files once
    /// they are closed.
    #[test]
    fn test_two_instances() {
        let temp = TestDir::temp();
        let store = Arc::new(MemoryBlobStore::new());
        let writer = directory(&store, &temp, "writer");
        let reader = directory(&store, &temp, "reader");

        let mut output = writer.create_output("_0.cfs").expect("create must succeed");
        output.write_bytes(b"segment data").expect("write must succeed");
        writer.sync(&["_0.cfs"]).expect("sync must succeed");
        assert_eq!(writer.cache().length("_0.cfs").expect("length must succeed"), Some(12));

        assert!(!reader.file_exists("_0.cfs"));
        assert!(matches!(reader.open_input("_0.cfs"), Err(Error::NotFound { .. })));
        assert_eq!(store.gets(), 1);

        output.close().expect("close must succeed");
        assert_eq!(read_all(&reader, "_0.cfs"), b"segment data");
        assert_eq!(store.gets(), 2);

        // Reopening a fresh cached copy only costs a HEAD.
        let heads = store.heads();
        assert_eq!(read_all(&reader, "_0.cfs"), b"segment data");
        assert_eq!(store.gets(), 2);
        assert_eq!(store.heads(), heads + 1);
    }

    /// Replacing a remote object with one of a different length
    /// invalidates every cached copy.
    #[test]
    fn test_cache_coherence() {
        let temp = TestDir::temp();
        let store = Arc::new(MemoryBlobStore::new());
        let directory = directory(&store, &temp, "cache");

        store.insert("index/data", b"v1".to_vec());
        let mut old = directory.open_input("data").expect("open must succeed");

        store.insert("index/data", b"version two".to_vec());
        assert_eq!(read_all(&directory, "data"), b"version two");
        assert_eq!(store.gets(), 2);

        // The handle opened earlier keeps reading the old bytes.
        let mut dst = Vec::new();
        old.read_to_end(&mut dst).expect("read must succeed");
        assert_eq!(dst, b"v1");
    }

    /// Many threads open the same uncached file at once; only one may
    /// download it.
    #[test]
    fn test_single_population() {
        let temp = TestDir::temp();
        let store = Arc::new(MemoryBlobStore::new());
        let directory = directory(&store, &temp, "cache");
        let payload: Vec<u8> = (0..=255u8).cycle().take(100_000).collect();

        store.insert("index/_0.cfs", payload.clone());

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let directory = directory.clone();
                std::thread::spawn(move || read_all(&directory, "_0.cfs"))
            })
            .collect();

        for worker in workers {
            assert_eq!(worker.join().expect("worker must not panic"), payload);
        }

        assert_eq!(store.gets(), 1);
    }

    #[test]
    fn test_delete_idempotent() {
        let temp = TestDir::temp();
        let store = Arc::new(MemoryBlobStore::new());
        let directory = directory(&store, &temp, "cache");

        directory.delete_file("never").expect("delete must succeed");

        write_all(&directory, "_1.si", b"x");
        // Qualified names work too.
        directory.delete_file("index/_1.si").expect("delete must succeed");
        directory.delete_file("_1.si").expect("delete must succeed");
        assert!(store.keys().is_empty());
        assert!(directory.cache().list().expect("list must succeed").is_empty());
    }

    /// Metadata calls fall back to defaults when the store is down,
    /// while data transfers fail loudly.
    #[test]
    fn test_offline() {
        let temp = TestDir::temp();
        let store = Arc::new(MemoryBlobStore::new());
        let directory = directory(&store, &temp, "cache");

        write_all(&directory, "_0.si", b"abc");
        store.set_offline(true);

        assert!(directory.list_all().is_empty());
        assert!(!directory.file_exists("_0.si"));
        assert_eq!(directory.file_length("_0.si"), 0);
        assert!(matches!(directory.open_input("_0.si"), Err(Error::Fetch { .. })));
        assert!(matches!(directory.delete_file("_0.si"), Err(Error::Delete { .. })));
        // The cached copy goes even though the remote object stays.
        assert_eq!(directory.cache().length("_0.si").expect("length must succeed"), None);

        let mut output = directory.create_output("_1.si").expect("create must succeed");
        output.write_bytes(b"pending").expect("write must succeed");
        assert!(matches!(output.close(), Err(Error::Publish { .. })));

        // The cached copy survived; retry once the store is back.
        store.set_offline(false);
        assert!(store.exists("index/_0.si").expect("exists must succeed"));
        assert_eq!(directory.publish("_1.si").expect("publish must succeed"), 7);
        assert_eq!(store.get_bytes("index/_1.si").expect("get must succeed"), b"pending");
        assert!(matches!(directory.publish("missing"), Err(Error::NotFound { .. })));
    }

    #[test]
    fn test_invalid_names() {
        let temp = TestDir::temp();
        let store = Arc::new(MemoryBlobStore::new());
        let directory = directory(&store, &temp, "cache");

        assert!(matches!(directory.create_output("a/b"), Err(Error::InvalidName { .. })));
        assert!(matches!(directory.open_input(""), Err(Error::InvalidName { .. })));
        assert!(matches!(directory.make_lock(".lock"), Err(Error::InvalidName { .. })));
        assert!(!directory.file_exists("a/b"));
        assert_eq!(directory.file_length(""), 0);

        // Keys elsewhere in the bucket never show up as names.
        store.insert("index/nested/file", b"x".to_vec());
        store.insert("indexed", b"x".to_vec());
        assert!(directory.list_all().is_empty());
    }

    /// Two outputs for the same name: `sync` flushes the most recent
    /// one, and the last close wins remotely.
    #[test]
    fn test_replaced_output() {
        let temp = TestDir::temp();
        let store = Arc::new(MemoryBlobStore::new());
        let directory = directory(&store, &temp, "cache");

        let mut first = directory.create_output("f").expect("create must succeed");
        first.write_bytes(b"first").expect("write must succeed");
        let mut second = directory.create_output("f").expect("create must succeed");
        second.write_bytes(b"2nd").expect("write must succeed");

        directory.sync(vec!["f".to_owned(), "absent".to_owned()]).expect("sync must succeed");
        assert_eq!(directory.cache().length("f").expect("length must succeed"), Some(3));

        assert_eq!(second.close().expect("close must succeed"), 3);
        assert_eq!(first.close().expect("close must succeed"), 5);
        assert_eq!(store.get_bytes("index/f").expect("get must succeed"), b"first");

        // Syncing a closed output is a no-op.
        directory.sync(&["f"]).expect("sync must succeed");
    }

    #[test]
    fn test_clear_cache() {
        let temp = TestDir::temp();
        let store = Arc::new(MemoryBlobStore::new());
        let directory = directory(&store, &temp, "cache");

        write_all(&directory, "a", b"1");
        write_all(&directory, "b", b"22");
        assert_eq!(directory.cache().list().expect("list must succeed"), vec!["a", "b"]);

        directory.clear_cache().expect("clear must succeed");
        assert!(directory.cache().list().expect("list must succeed").is_empty());
        assert_eq!(read_all(&directory, "b"), b"22");
        assert_eq!(store.gets(), 1);
    }

    #[test]
    fn test_locks() {
        let temp = TestDir::temp();
        let store = Arc::new(MemoryBlobStore::new());
        let a = directory(&store, &temp, "a");
        let b = directory(&store, &temp, "b");

        let lock = a.make_lock("write.lock").expect("make_lock must succeed");
        assert!(Arc::ptr_eq(&lock, &a.make_lock("write.lock").expect("make_lock must succeed")));
        assert!(lock.obtain());
        assert!(store.keys().contains(&"index/write.lock".to_owned()));

        let other = b.make_lock("write.lock").expect("make_lock must succeed");
        assert!(!other.obtain());
        assert_eq!(other.status(), LockStatus::HeldByOther);

        b.clear_lock("write.lock").expect("clear_lock must succeed");
        assert!(other.obtain());
        assert_eq!(lock.status(), LockStatus::HeldByOther);
        assert!(other.release());
    }

    #[test]
    fn test_settings_and_defaults() {
        let store = Arc::new(MemoryBlobStore::new());
        let settings = Settings::parse("Bucket Folder=backups;Catalog=main").expect("must parse");
        let directory = DirectoryBuilder::new(store.clone())
            .settings(&settings)
            .lease(LeaseConfig::new(Duration::from_secs(5)))
            .build()
            .expect("build must succeed");

        assert_eq!(directory.catalog().path(), "backups/main");
        assert_eq!(directory.catalog().key("x").expect("valid"), "backups/main/x");
    }

    proptest! {
        /// Listing follows every page, whatever the page size.
        #[test]
        fn test_list_pages(page_size in 1usize..20, count in 0usize..50) {
            let temp = TestDir::temp();
            let store = Arc::new(MemoryBlobStore::with_page_size(page_size));
            let directory = directory(&store, &temp, "cache");

            let mut expected: Vec<String> = (0..count).map(|i| format!("_{}.si", i)).collect();
            for name in &expected {
                store.insert(&format!("index/{}", name), b"x".to_vec());
            }
            store.insert("other/_0.si", b"x".to_vec());
            expected.sort();

            prop_assert_eq!(directory.list_all(), expected);
        }
    }

    #[derive(Arbitrary, Debug)]
    enum FileOp {
        Write(u8, u8, u8),
        Read(u8),
        Delete(u8),
        OutOfBand(u8, u8),
        ClearCache,
    }

    fn file_name(index: u8) -> String {
        format!("_{}.cfs", index % 4)
    }

    proptest! {
        /// Run random operations on two directories sharing a store,
        /// and compare against a map from name to contents.
        #[test]
        fn test_model(ops in proptest::collection::vec(any::<FileOp>(), 1..40)) {
            let temp = TestDir::temp();
            let store = Arc::new(MemoryBlobStore::new());
            let dirs = [directory(&store, &temp, "a"), directory(&store, &temp, "b")];
            let mut model: BTreeMap<String, Vec<u8>> = BTreeMap::new();

            for (i, op) in ops.iter().enumerate() {
                let dir = &dirs[i % 2];
                // Coherence only compares lengths, so every version of a
                // file gets a length no earlier version had.
                let unique_len = |len: u8| i * 8 + (len % 8) as usize;

                match op {
                    FileOp::Write(index, byte, len) => {
                        let bytes = vec![*byte; unique_len(*len)];
                        write_all(dir, &file_name(*index), &bytes);
                        model.insert(file_name(*index), bytes);
                    }
                    FileOp::Read(index) => {
                        let name = file_name(*index);
                        match model.get(&name) {
                            Some(bytes) => {
                                prop_assert_eq!(&read_all(dir, &name), bytes);
                            }
                            None => {
                                let missing = matches!(dir.open_input(&name),
                                                       Err(Error::NotFound { .. }));
                                prop_assert!(missing);
                            }
                        }
                    }
                    FileOp::Delete(index) => {
                        dir.delete_file(&file_name(*index)).expect("delete must succeed");
                        model.remove(&file_name(*index));
                    }
                    FileOp::OutOfBand(index, len) => {
                        let bytes = vec![0xAB; unique_len(*len)];
                        store.insert(&format!("index/{}", file_name(*index)), bytes.clone());
                        model.insert(file_name(*index), bytes);
                    }
                    FileOp::ClearCache => dir.clear_cache().expect("clear must succeed"),
                }

                let names: Vec<String> = model.keys().cloned().collect();
                prop_assert_eq!(dirs[0].list_all(), names.clone());
                prop_assert_eq!(dirs[1].list_all(), names);
            }
        }
    }
}
