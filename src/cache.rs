//! The local cache is a plain directory where the cached copy of
//! logical file `name` is the file named `name`.  Downloads are
//! staged in a `.blobdir_temp` subdirectory and renamed into place,
//! so a cached copy is always either absent or complete; writers
//! unlink the old copy before creating a new one, so handles opened
//! earlier keep reading the bytes they started with.
//!
//! The cache does not fsync the directory: losing or reverting cached
//! copies after a crash is safe, since every read checks the cached
//! length against the remote object before trusting it.
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Result;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::NamedTempFile;

use crate::benign_error::absent_as_none;
use crate::benign_error::is_absent_file_error;

/// Staged downloads live in this subdirectory of the cache directory.
pub const TEMP_SUBDIR: &str = ".blobdir_temp";

/// Delete staged files with mtime older than this age.
#[cfg(not(test))]
const MAX_TEMP_FILE_AGE: Duration = Duration::from_secs(3600);

// We want a more eager timeout in tests.
#[cfg(test)]
const MAX_TEMP_FILE_AGE: Duration = Duration::from_secs(2);

/// The `CacheStore` trait is the local file store the directory
/// stages reads and writes in: one file per logical name.
pub trait CacheStore: std::fmt::Debug + Send + Sync {
    /// Returns a read-only file for the cached copy of `name`, or
    /// `None` if there is no such copy.
    fn open(&self, name: &str) -> Result<Option<File>>;

    /// Replaces any cached copy of `name` with a new empty file, and
    /// returns that file for reading and writing.
    fn create(&self, name: &str) -> Result<File>;

    /// Returns a private temporary file that [`CacheStore::publish`]
    /// can later move into place as `name`.
    fn stage(&self, name: &str) -> Result<NamedTempFile>;

    /// Atomically replaces the cached copy of `name` with `staged`.
    fn publish(&self, name: &str, staged: NamedTempFile) -> Result<()>;

    /// Deletes the cached copy of `name`.  Succeeds if there is none.
    fn delete(&self, name: &str) -> Result<()>;

    /// Returns the length of the cached copy of `name`, if any.
    fn length(&self, name: &str) -> Result<Option<u64>>;

    /// Returns whether there is a cached copy of `name`.
    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.length(name)?.is_some())
    }

    /// Lists the names of all cached copies.
    fn list(&self) -> Result<Vec<String>>;
}

/// Removes a file if it exists.
fn ensure_file_removed(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if is_absent_file_error(&e) => Ok(()),
        err => err,
    }
}

/// Deletes any file with mtime older than `MAX_TEMP_FILE_AGE` in
/// `temp_dir`: those are leftovers from downloads that crashed
/// before publication.
fn cleanup_temporary_directory(temp_dir: &Path) -> Result<()> {
    let threshold = match std::time::SystemTime::now().checked_sub(MAX_TEMP_FILE_AGE) {
        Some(time) => time,
        None => return Ok(()),
    };

    let mut temp = temp_dir.to_owned();
    for dirent in std::fs::read_dir(temp_dir)?.flatten() {
        let mut handle = || -> Result<()> {
            let mtime = dirent.metadata()?.modified()?;

            if mtime < threshold {
                temp.push(dirent.file_name());
                let ret = ensure_file_removed(&temp);
                temp.pop();

                ret?;
            }

            Ok(())
        };

        if let Err(e) = handle() {
            tracing::debug!(path = ?dirent.path(), error = %e, "failed to clean up staged file");
        }
    }

    Ok(())
}

/// A [`CacheStore`] backed by a directory on the local filesystem.
#[derive(Clone, Debug)]
pub struct LocalCache {
    // The cached files are siblings of this directory for staged
    // files.
    temp_dir: PathBuf,
}

impl LocalCache {
    /// Returns a cache in `base_dir`, creating the directory and its
    /// staging subdirectory if necessary.  Also deletes stale staged
    /// files left behind by earlier processes.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `$base_dir/.blobdir_temp` does not exist and
    /// we fail to create it.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<LocalCache> {
        let mut temp_dir = base_dir.into();

        temp_dir.push(TEMP_SUBDIR);
        std::fs::create_dir_all(&temp_dir)?;
        cleanup_temporary_directory(&temp_dir)?;

        Ok(LocalCache { temp_dir })
    }

    /// Returns the cache directory.
    pub fn base_dir(&self) -> &Path {
        self.temp_dir.parent().unwrap_or(&self.temp_dir)
    }

    fn path(&self, name: &str) -> PathBuf {
        let mut target = self.base_dir().to_owned();
        target.push(name);
        target
    }
}

impl CacheStore for LocalCache {
    fn open(&self, name: &str) -> Result<Option<File>> {
        absent_as_none(File::open(self.path(name)))
    }

    fn create(&self, name: &str) -> Result<File> {
        let target = self.path(name);

        // Unlink first: readers that still have the old copy open
        // must not see it truncated under them.
        ensure_file_removed(&target)?;
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&target)
    }

    fn stage(&self, _name: &str) -> Result<NamedTempFile> {
        NamedTempFile::new_in(&self.temp_dir)
    }

    fn publish(&self, name: &str, staged: NamedTempFile) -> Result<()> {
        staged.persist(self.path(name)).map_err(|e| e.error)?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        ensure_file_removed(&self.path(name))
    }

    fn length(&self, name: &str) -> Result<Option<u64>> {
        Ok(absent_as_none(std::fs::metadata(self.path(name)))?
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len()))
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();

        for dirent in std::fs::read_dir(self.base_dir())? {
            let dirent = match dirent {
                Ok(dirent) => dirent,
                Err(e) if is_absent_file_error(&e) => continue,
                Err(e) => return Err(e),
            };

            let is_file = match absent_as_none(dirent.file_type())? {
                Some(file_type) => file_type.is_file(),
                None => continue,
            };

            if let Some(name) = dirent.file_name().to_str() {
                if is_file && !name.starts_with('.') {
                    names.push(name.to_owned());
                }
            }
        }

        names.sort();
        Ok(names)
    }
}

/// Leave stale and fresh files in the staging subdirectory; only the
/// stale one should be cleaned up when the cache is opened.
#[test]
fn test_cleanup_stale_temp_files() {
    use filetime::FileTime;
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp()
        .create(TEMP_SUBDIR, FileType::Dir)
        .create(&format!("{}/garbage", TEMP_SUBDIR), FileType::ZeroFile(10))
        .create(&format!("{}/recent", TEMP_SUBDIR), FileType::ZeroFile(10));

    // Age the garbage file past `MAX_TEMP_FILE_AGE`.
    let old = FileTime::from_unix_time(FileTime::now().unix_seconds() - 60, 0);
    filetime::set_file_mtime(temp.path(&format!("{}/garbage", TEMP_SUBDIR)), old)
        .expect("set_file_mtime must succeed");

    let _cache = LocalCache::new(temp.path(".")).expect("::new must succeed");

    assert!(matches!(std::fs::metadata(temp.path(&format!("{}/garbage", TEMP_SUBDIR))),
                     Err(e) if e.kind() == std::io::ErrorKind::NotFound));
    assert!(std::fs::metadata(temp.path(&format!("{}/recent", TEMP_SUBDIR))).is_ok());
}

/// Stage a file, publish it, then read it back.
#[test]
fn test_stage_publish() {
    use std::io::{Read, Write};
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = LocalCache::new(temp.path(".")).expect("::new must succeed");

    assert!(cache.open("entry").expect("open must succeed").is_none());
    assert_eq!(cache.length("entry").expect("length must succeed"), None);

    let mut staged = cache.stage("entry").expect("stage must succeed");
    staged.write_all(b"v1").expect("write must succeed");
    cache.publish("entry", staged).expect("publish must succeed");

    let mut cached = cache
        .open("entry")
        .expect("open must succeed")
        .expect("must be found");
    let mut dst = Vec::new();
    cached.read_to_end(&mut dst).expect("read must succeed");
    assert_eq!(&dst, b"v1");
    assert_eq!(cache.length("entry").expect("length must succeed"), Some(2));
    assert!(cache.exists("entry").expect("exists must succeed"));
}

/// Creating a file over an open cached copy must not disturb readers
/// of the old copy.
#[test]
fn test_create_replaces() {
    use std::io::{Read, Write};
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = LocalCache::new(temp.path(".")).expect("::new must succeed");

    cache
        .create("entry")
        .expect("create must succeed")
        .write_all(b"old contents")
        .expect("write must succeed");
    let mut old = cache
        .open("entry")
        .expect("open must succeed")
        .expect("must be found");

    cache
        .create("entry")
        .expect("create must succeed")
        .write_all(b"new")
        .expect("write must succeed");

    let mut dst = Vec::new();
    old.read_to_end(&mut dst).expect("read must succeed");
    assert_eq!(&dst, b"old contents");
    assert_eq!(cache.length("entry").expect("length must succeed"), Some(3));
}

/// Deleting is idempotent, and listing skips the staging directory.
#[test]
fn test_delete_list() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let cache = LocalCache::new(temp.path(".")).expect("::new must succeed");

    for name in &["b", "a", "c"] {
        cache.create(name).expect("create must succeed");
    }
    // A staged, unpublished file is not a cached copy.
    let _staged = cache.stage("d").expect("stage must succeed");

    assert_eq!(cache.list().expect("list must succeed"), vec!["a", "b", "c"]);

    cache.delete("b").expect("delete must succeed");
    cache.delete("b").expect("second delete must succeed");
    cache.delete("never").expect("delete must succeed");
    assert_eq!(cache.list().expect("list must succeed"), vec!["a", "c"]);
}
