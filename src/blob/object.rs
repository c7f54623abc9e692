//! Blocking [`BlobStore`] facade over an async
//! [`object_store::ObjectStore`] (S3, GCS, Azure, ...).  Each call
//! blocks the calling thread on a private tokio runtime, so the
//! directory's critical sections stay plain synchronous code.
//!
//! Do not call into this adapter from inside another tokio runtime:
//! `block_on` panics when nested.
use std::io::Read;
use std::io::Write;
use std::sync::Arc;

use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use object_store::PutPayload;
use tokio::runtime::Runtime;

use super::paginate;
use super::BlobStore;
use super::ListPage;
use crate::error::BlobError;

const DEFAULT_PAGE_SIZE: usize = 1000;

fn convert(error: object_store::Error) -> BlobError {
    match error {
        object_store::Error::NotFound { path, .. } => BlobError::NotFound { key: path },
        other => BlobError::Backend(Box::new(other)),
    }
}

/// Adapts an async object store to the blocking [`BlobStore`] trait.
#[derive(Debug)]
pub struct ObjectStoreBlobs {
    store: Arc<dyn ObjectStore>,
    runtime: Runtime,
    page_size: usize,
}

impl ObjectStoreBlobs {
    /// Wraps `store` with a dedicated multi-threaded runtime.
    pub fn new(store: Arc<dyn ObjectStore>) -> std::io::Result<ObjectStoreBlobs> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("blobdir-object-store")
            .build()?;

        Ok(ObjectStoreBlobs {
            store,
            runtime,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Lists at most `page_size` keys per page.
    pub fn page_size(mut self, page_size: usize) -> ObjectStoreBlobs {
        self.page_size = page_size.max(1);
        self
    }
}

impl BlobStore for ObjectStoreBlobs {
    fn list_page(&self, prefix: &str, marker: Option<&str>) -> Result<ListPage, BlobError> {
        // `object_store` prefixes are whole path segments; filter on
        // the exact string prefix ourselves.
        let trimmed = prefix.trim_end_matches('/');
        let location = if trimmed.is_empty() {
            None
        } else {
            Some(ObjectPath::from(trimmed))
        };

        // Listings come back in no particular order, so pages are cut
        // from the whole sorted listing.
        let mut keys = self.runtime.block_on(async {
            let mut listing = self.store.list(location.as_ref());
            let mut keys = Vec::new();

            while let Some(meta) = listing.try_next().await.map_err(convert)? {
                let key = meta.location.to_string();
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }

            Ok::<_, BlobError>(keys)
        })?;

        keys.sort();
        Ok(paginate(keys, marker, self.page_size))
    }

    fn head(&self, key: &str) -> Result<u64, BlobError> {
        let location = ObjectPath::from(key);

        self.runtime.block_on(async {
            let meta = self.store.head(&location).await.map_err(convert)?;
            Ok::<_, BlobError>(meta.size as u64)
        })
    }

    fn get(&self, key: &str, dst: &mut dyn Write) -> Result<u64, BlobError> {
        let location = ObjectPath::from(key);

        let bytes = self.runtime.block_on(async {
            let result = self.store.get(&location).await.map_err(convert)?;
            result.bytes().await.map_err(convert)
        })?;

        dst.write_all(&bytes)?;
        Ok(bytes.len() as u64)
    }

    fn put(&self, key: &str, src: &mut dyn Read) -> Result<u64, BlobError> {
        let location = ObjectPath::from(key);

        let mut buf = Vec::new();
        src.read_to_end(&mut buf)?;
        let len = buf.len() as u64;

        self.runtime.block_on(async {
            self.store
                .put(&location, PutPayload::from(buf))
                .await
                .map_err(convert)
        })?;
        Ok(len)
    }

    fn delete(&self, key: &str) -> Result<(), BlobError> {
        let location = ObjectPath::from(key);

        match self
            .runtime
            .block_on(async { self.store.delete(&location).await })
        {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(convert(e)),
        }
    }
}
