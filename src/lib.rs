//! Blobdir exposes a prefix of a remote object store (S3 and
//! friends) as a flat directory of random-access files, for programs
//! like search index engines that expect a local directory.  Every
//! file lives in the object store as one whole object, and is only
//! ever read or written through a local cached copy: objects stores
//! offer neither partial writes nor appends, and random reads over
//! the network are too slow to be useful.
//!
//! Reads fetch the whole object into the cache when opened, unless
//! the cached copy already has the same length as the remote
//! object.[^length-check]  Writes go to a fresh cached copy, and the
//! remote object is replaced in one upload when the output is closed
//! ("publish on close").  Until then, other readers keep seeing the
//! old contents.
//!
//! [^length-check]: Comparing lengths is cheap (a single `HEAD`), but
//! means a remote object replaced by another of the exact same length
//! is served stale from the cache.  Callers that rewrite files in
//! place with fixed-length contents should call
//! [`VirtualDirectory::clear_cache`] or use distinct file names;
//! search indexes write each segment file once, so this is rarely an
//! issue in practice.
//!
//! Metadata operations ([`VirtualDirectory::list_all`],
//! [`VirtualDirectory::file_exists`], and
//! [`VirtualDirectory::file_length`]) always ask the object store,
//! and degrade to an empty listing, `false`, or 0 when it fails.
//! Transfers never fail silently: a failed fetch surfaces as
//! [`Error::Fetch`] (or [`Error::NotFound`]), and a failed upload as
//! [`Error::Publish`], with the cached copy left in place for
//! [`VirtualDirectory::publish`] to retry.
//!
//! # Concurrency
//!
//! Within a process, a directory serialises every cache population
//! and replacement for the same logical name, so concurrent opens of
//! an uncached file download it exactly once.  Cached copies are
//! always replaced atomically (staged, then renamed into place), and
//! outputs unlink the previous copy before creating theirs: handles
//! that are already open keep reading the bytes they started with.
//!
//! Across processes, there is no coordination except for advisory
//! [`LeaseLock`]s, which [`VirtualDirectory::make_lock`] stores as
//! objects in the same catalog.  A lock object holds an expiry time
//! and a random lease id; the holder renews the lease in the
//! background, and anyone may take over a lock whose lease expired.
//!
//! # Sample usage
//!
//! ```no_run
//! # fn main() -> blobdir::Result<()> {
//! use std::io::Read;
//! use std::io::Write;
//! use std::sync::Arc;
//!
//! let store = Arc::new(blobdir::FsBlobStore::new("/tmp/bucket")?);
//! let directory = blobdir::DirectoryBuilder::new(store)
//!     .bucket_folder("tenant")
//!     .catalog("index")
//!     .cache_dir("/tmp/blobdir_cache")
//!     .build()?;
//!
//! let lock = directory.make_lock("write.lock")?;
//! if let Some(_guard) = lock.try_guard() {
//!     let mut output = directory.create_output("segments.gen")?;
//!     output.write_all(b"generation 1")?;
//!     // Uploads `tenant/index/segments.gen`.
//!     output.close()?;
//! }
//!
//! let mut contents = Vec::new();
//! directory
//!     .open_input("segments.gen")?
//!     .read_to_end(&mut contents)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Layout
//!
//! The object for logical file `name` in catalog `folder/catalog`
//! lives at key `folder/catalog/name`; a lock named `write.lock` is
//! the object `folder/catalog/write.lock`.  Logical names may not be
//! empty, contain `/` or `\`, or start with a `.`.
//!
//! Cache directories simply store the cached copy of `name` in the
//! file `name`, and stage downloads in a `.blobdir_temp`
//! subdirectory.  It's always safe to delete files from a cache
//! directory while no process uses it.
mod benign_error;
pub mod blob;
pub mod cache;
pub mod catalog;
mod directory;
mod error;
mod input;
pub mod lease;
mod mutex;
mod output;
mod settings;

pub use blob::BlobStore;
pub use blob::FsBlobStore;
pub use blob::ListPage;
pub use blob::MemoryBlobStore;
#[cfg(feature = "object-store")]
pub use blob::ObjectStoreBlobs;
pub use cache::CacheStore;
pub use cache::LocalCache;
pub use catalog::Catalog;
pub use directory::DirectoryBuilder;
pub use directory::VirtualDirectory;
pub use error::BlobError;
pub use error::Error;
pub use error::Result;
pub use input::RemoteInput;
pub use lease::DistributedLock;
pub use lease::Lease;
pub use lease::LeaseConfig;
pub use lease::LeaseGuard;
pub use lease::LeaseLock;
pub use lease::LockStatus;
pub use mutex::FileMutexRegistry;
pub use output::RemoteOutput;
pub use settings::Settings;

/// Random-access reads over an open file.  Reads past the end fail
/// with an `UnexpectedEof` [`Error::Cache`].
pub trait ByteReader: Send {
    fn read_byte(&mut self) -> Result<u8>;

    /// Fills `dst` completely.
    fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()>;

    fn seek_to(&mut self, position: u64) -> Result<()>;

    fn position(&self) -> u64;

    fn length(&self) -> u64;
}

/// Sequential writes to a file that is published when closed.
pub trait ByteWriter: Send {
    fn write_byte(&mut self, byte: u8) -> Result<()>;

    fn write_bytes(&mut self, src: &[u8]) -> Result<()>;

    /// Pushes buffered bytes to the local cached copy, without
    /// publishing anything.
    fn flush_to_cache(&mut self) -> Result<()>;

    fn position(&self) -> u64;

    fn length(&self) -> u64;
}

/// Read-modify-write through the trait objects, the way an index
/// engine would use them.
#[test]
fn test_capability_traits() {
    use std::sync::Arc;
    use test_dir::{DirBuilder, TestDir};

    fn copy(src: &mut dyn ByteReader, dst: &mut dyn ByteWriter) -> Result<u64> {
        while src.position() < src.length() {
            dst.write_byte(src.read_byte()?)?;
        }

        dst.flush_to_cache()?;
        Ok(dst.length())
    }

    let temp = TestDir::temp();
    let store = Arc::new(MemoryBlobStore::new());
    store.insert("index/src", b"payload".to_vec());

    let directory = DirectoryBuilder::new(store.clone())
        .cache_dir(temp.path("cache"))
        .build()
        .expect("build must succeed");
    let mut input = directory.open_input("src").expect("open must succeed");
    let mut output = directory.create_output("dst").expect("create must succeed");

    input.seek_to(3).expect("seek must succeed");
    assert_eq!(copy(&mut input, &mut output).expect("copy must succeed"), 4);
    assert!(matches!(input.read_byte(), Err(Error::Cache(_))));

    output.close().expect("close must succeed");
    assert_eq!(store.get_bytes("index/dst").expect("get must succeed"), b"load");
}
