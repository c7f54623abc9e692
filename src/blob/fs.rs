use std::fs::File;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use walkdir::WalkDir;

use super::paginate;
use super::BlobStore;
use super::ListPage;
use crate::benign_error::is_absent_file_error;
use crate::error::BlobError;

/// Uploads are staged in this subdirectory of the bucket root, then
/// renamed into place.
const STAGING_SUBDIR: &str = ".blobdir_staging";

const DEFAULT_PAGE_SIZE: usize = 1000;

/// A bucket emulated by a local directory: the object at `a/b/c` is
/// the file `$root/a/b/c`.  Every `put` is published with an atomic
/// rename, so concurrent readers (in any process) see either the old
/// or the new object, never a prefix.  This makes a shared directory
/// a reasonable stand-in for a real object store when several
/// processes need to contend for the same leases.
#[derive(Clone, Debug)]
pub struct FsBlobStore {
    root: PathBuf,
    page_size: usize,
}

impl FsBlobStore {
    /// Returns a store rooted at `root`, creating the directory if
    /// necessary.
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<FsBlobStore> {
        let root = root.into();

        std::fs::create_dir_all(root.join(STAGING_SUBDIR))?;
        Ok(FsBlobStore {
            root,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Lists at most `page_size` keys per page.
    pub fn page_size(mut self, page_size: usize) -> FsBlobStore {
        self.page_size = page_size.max(1);
        self
    }

    /// Returns the bucket root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps `key` to a path under the root.  Rejects keys that could
    /// escape the root or collide with the staging directory.
    fn path(&self, key: &str) -> Result<PathBuf, BlobError> {
        let mut path = self.root.clone();

        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." || segment == STAGING_SUBDIR
            {
                return Err(BlobError::Io(std::io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("invalid object key {:?}", key),
                )));
            }

            path.push(segment);
        }

        Ok(path)
    }

    fn not_found(key: &str, error: std::io::Error) -> BlobError {
        if is_absent_file_error(&error) {
            BlobError::NotFound {
                key: key.to_owned(),
            }
        } else {
            BlobError::Io(error)
        }
    }

    /// Returns the key for the file at `path` under the root.
    fn key(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let segments: Option<Vec<&str>> = relative
            .components()
            .map(|component| component.as_os_str().to_str())
            .collect();

        Some(segments?.join("/"))
    }
}

impl BlobStore for FsBlobStore {
    fn list_page(&self, prefix: &str, marker: Option<&str>) -> Result<ListPage, BlobError> {
        let mut keys = Vec::new();

        let walker = WalkDir::new(&self.root)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| entry.depth() != 1 || entry.file_name() != STAGING_SUBDIR);
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                // Objects deleted while we walk are simply not listed.
                Err(e) if e.io_error().map_or(false, is_absent_file_error) => continue,
                Err(e) => return Err(BlobError::Io(e.into())),
            };

            if !entry.file_type().is_file() {
                continue;
            }

            if let Some(key) = self.key(entry.path()) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        // Walk order is per directory; listings are in key order.
        keys.sort();
        Ok(paginate(keys, marker, self.page_size))
    }

    fn head(&self, key: &str) -> Result<u64, BlobError> {
        let path = self.path(key)?;

        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            Ok(_) => Err(BlobError::NotFound {
                key: key.to_owned(),
            }),
            Err(e) => Err(FsBlobStore::not_found(key, e)),
        }
    }

    fn get(&self, key: &str, dst: &mut dyn Write) -> Result<u64, BlobError> {
        let path = self.path(key)?;
        let mut file = File::open(&path).map_err(|e| FsBlobStore::not_found(key, e))?;
        if file.metadata()?.is_dir() {
            return Err(BlobError::NotFound {
                key: key.to_owned(),
            });
        }

        Ok(std::io::copy(&mut file, dst)?)
    }

    fn put(&self, key: &str, src: &mut dyn Read) -> Result<u64, BlobError> {
        let path = self.path(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut tmp = NamedTempFile::new_in(self.root.join(STAGING_SUBDIR))?;
        let len = std::io::copy(src, tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| BlobError::Io(e.error))?;

        Ok(len)
    }

    fn delete(&self, key: &str) -> Result<(), BlobError> {
        let path = self.path(key)?;

        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if is_absent_file_error(&e) => Ok(()),
            Err(e) => Err(BlobError::Io(e)),
        }
    }
}

#[test]
fn smoke_test() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let store = FsBlobStore::new(temp.path("bucket")).expect("new must succeed");

    store
        .put_bytes("catalog/segments.gen", b"0123456789")
        .expect("put must succeed");
    store
        .put_bytes("catalog/write.lock", b"lease")
        .expect("put must succeed");
    store
        .put_bytes("other/file", b"x")
        .expect("put must succeed");

    assert_eq!(store.head("catalog/segments.gen").expect("head must succeed"), 10);
    assert_eq!(
        store.get_bytes("catalog/write.lock").expect("get must succeed"),
        b"lease"
    );
    assert!(store.head("catalog/missing").expect_err("must fail").is_not_found());
    // Intermediate "directories" are not objects.
    assert!(store.head("catalog").expect_err("must fail").is_not_found());
    assert!(store.get_bytes("catalog").expect_err("must fail").is_not_found());

    assert_eq!(
        super::list_all(&store, "catalog/").expect("list must succeed"),
        vec!["catalog/segments.gen", "catalog/write.lock"]
    );

    store.delete("catalog/write.lock").expect("delete must succeed");
    store.delete("catalog/write.lock").expect("delete must succeed");
    assert!(!store.exists("catalog/write.lock").expect("exists must succeed"));
}

#[test]
fn test_overwrite() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let store = FsBlobStore::new(temp.path("bucket")).expect("new must succeed");

    store.put_bytes("k", b"v1").expect("put must succeed");
    store.put_bytes("k", b"version 2").expect("put must succeed");
    assert_eq!(store.get_bytes("k").expect("get must succeed"), b"version 2");

    // Staging files never show up in listings.
    assert_eq!(super::list_all(&store, "").expect("list must succeed"), vec!["k"]);
}

#[test]
fn test_invalid_keys() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let store = FsBlobStore::new(temp.path("bucket")).expect("new must succeed");

    for key in &["", "a//b", "../escape", "a/./b", STAGING_SUBDIR] {
        assert!(
            matches!(store.put_bytes(key, b"x"), Err(BlobError::Io(e)) if e.kind() == ErrorKind::InvalidInput),
            "{:?} should be rejected",
            key
        );
    }
}

#[test]
fn test_paged_listing() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let store = FsBlobStore::new(temp.path("bucket"))
        .expect("new must succeed")
        .page_size(2);

    for name in &["a.b", "a/b", "a-c", "ab"] {
        store.put_bytes(name, b"x").expect("put must succeed");
    }

    let first = store.list_page("", None).expect("list must succeed");
    assert_eq!(first.keys, vec!["a-c", "a.b"]);
    assert_eq!(
        super::list_all(&store, "").expect("list must succeed"),
        vec!["a-c", "a.b", "a/b", "ab"]
    );
}
