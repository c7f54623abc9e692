//! The `BlobStore` trait is the only thing the directory knows about
//! the remote object store: a flat key namespace with list, head,
//! get, put, and delete.  Nothing here supports partial reads,
//! appends, or conditional writes; the cache and lease layers build
//! everything else on top of whole-object transfers.
//!
//! Implementations must give read-after-write consistency for a
//! single key.  Listings may lag behind writes.
use std::io::Read;
use std::io::Write;

use crate::error::BlobError;

mod fs;
mod memory;
#[cfg(feature = "object-store")]
mod object;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;
#[cfg(feature = "object-store")]
pub use object::ObjectStoreBlobs;

/// Object stores return listings one page at a time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Keys in this page, in the store's listing order.
    pub keys: Vec<String>,
    /// When the listing was truncated, pass this marker to the next
    /// `list_page` call to resume after the last key.
    pub next_marker: Option<String>,
}

/// A remote (or remote-like) object store.
pub trait BlobStore: std::fmt::Debug + Send + Sync {
    /// Lists one page of keys that start with `prefix`, resuming
    /// strictly after `marker` if provided.
    fn list_page(&self, prefix: &str, marker: Option<&str>) -> Result<ListPage, BlobError>;

    /// Returns the size in bytes of the object at `key`.
    fn head(&self, key: &str) -> Result<u64, BlobError>;

    /// Copies the whole object at `key` into `dst`, and returns the
    /// number of bytes copied.
    fn get(&self, key: &str, dst: &mut dyn Write) -> Result<u64, BlobError>;

    /// Creates or replaces the object at `key` with the contents of
    /// `src`, and returns the number of bytes uploaded.  The new
    /// contents must only become visible once the whole upload
    /// succeeded.
    fn put(&self, key: &str, src: &mut dyn Read) -> Result<u64, BlobError>;

    /// Deletes the object at `key`.  Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> Result<(), BlobError>;

    /// Probes the store for `key`.  This always goes to the store.
    fn exists(&self, key: &str) -> Result<bool, BlobError> {
        match self.head(key) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Returns the whole object at `key` as a byte vector.
    fn get_bytes(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let mut dst = Vec::new();
        self.get(key, &mut dst)?;
        Ok(dst)
    }

    /// Creates or replaces the object at `key` with `bytes`.
    fn put_bytes(&self, key: &str, mut bytes: &[u8]) -> Result<(), BlobError> {
        self.put(key, &mut bytes)?;
        Ok(())
    }
}

/// Lists every key under `prefix`, following truncated pages until
/// the store reports the listing is complete.
pub fn list_all(store: &dyn BlobStore, prefix: &str) -> Result<Vec<String>, BlobError> {
    let mut keys = Vec::new();
    let mut marker: Option<String> = None;

    loop {
        let page = store.list_page(prefix, marker.as_deref())?;
        keys.extend(page.keys);

        match page.next_marker {
            // A store that hands back the same marker would loop forever.
            Some(next) if marker.as_deref() != Some(next.as_str()) => marker = Some(next),
            _ => return Ok(keys),
        }
    }
}

/// Paginates a sorted list of `keys` the way S3-style listings do:
/// keep at most `page_size` keys strictly after `marker`, and report
/// the last key as the next marker when more remain.
pub(crate) fn paginate(keys: Vec<String>, marker: Option<&str>, page_size: usize) -> ListPage {
    let page_size = page_size.max(1);
    let mut remaining = keys
        .into_iter()
        .filter(|key| marker.map_or(true, |marker| key.as_str() > marker));

    let keys: Vec<String> = remaining.by_ref().take(page_size).collect();
    let next_marker = if remaining.next().is_some() {
        keys.last().cloned()
    } else {
        None
    };

    ListPage { keys, next_marker }
}

#[test]
fn test_paginate() {
    let keys: Vec<String> = (0..5).map(|i| format!("k{}", i)).collect();

    let first = paginate(keys.clone(), None, 2);
    assert_eq!(first.keys, vec!["k0", "k1"]);
    assert_eq!(first.next_marker.as_deref(), Some("k1"));

    let last = paginate(keys.clone(), Some("k3"), 2);
    assert_eq!(last.keys, vec!["k4"]);
    assert_eq!(last.next_marker, None);

    // An exactly full page is not truncated.
    let exact = paginate(keys, Some("k2"), 2);
    assert_eq!(exact.keys, vec!["k3", "k4"]);
    assert_eq!(exact.next_marker, None);
}
