//! Write handles.  A `RemoteOutput` only ever writes to its local
//! cached copy; the remote object is replaced in one upload when the
//! output is closed.  Until then, other processes (and other
//! directory instances) keep seeing the previous remote contents, or
//! nothing at all.
//!
//! The buffered writer lives behind a shared mutex so that
//! [`crate::VirtualDirectory::sync`] can flush it to the cache file
//! while the handle is still open.
use std::fs::File;
use std::io::BufWriter;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use derivative::Derivative;

use crate::directory::VirtualDirectory;
use crate::error::Error;
use crate::error::Result;
use crate::ByteWriter;

/// The writer for an open output; `None` once the output is closed.
pub(crate) type SharedWriter = Arc<Mutex<Option<BufWriter<File>>>>;

fn lock(writer: &SharedWriter) -> MutexGuard<'_, Option<BufWriter<File>>> {
    writer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An append-only writer for one logical file, published on close.
///
/// Dropping an output without calling [`RemoteOutput::close`] still
/// publishes it, but the only trace of a failure is an `error!` log
/// line.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct RemoteOutput {
    directory: VirtualDirectory,
    name: String,
    key: String,
    #[derivative(Debug = "ignore")]
    writer: SharedWriter,
    position: u64,
}

impl RemoteOutput {
    pub(crate) fn new(
        directory: VirtualDirectory,
        name: String,
        key: String,
        writer: SharedWriter,
    ) -> RemoteOutput {
        RemoteOutput {
            directory,
            name,
            key,
            writer,
            position: 0,
        }
    }

    /// Returns the logical file name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Appends one byte.
    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.write_bytes(&[byte])
    }

    /// Appends all of `src`.
    pub fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        let mut guard = lock(&self.writer);
        let writer = guard.as_mut().ok_or(Error::Closed)?;

        writer.write_all(src)?;
        self.position += src.len() as u64;
        Ok(())
    }

    /// Pushes buffered bytes to the local cached copy.  This does not
    /// touch the remote object.
    pub fn flush_to_cache(&mut self) -> Result<()> {
        let mut guard = lock(&self.writer);
        let writer = guard.as_mut().ok_or(Error::Closed)?;

        writer.flush()?;
        Ok(())
    }

    /// Returns the number of bytes written so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns the current length of the file.  Outputs only append, so
    /// this is always the position.
    pub fn length(&self) -> u64 {
        self.position
    }

    /// Returns whether the output was already closed.
    pub fn is_closed(&self) -> bool {
        lock(&self.writer).is_none()
    }

    /// Flushes the cached copy and uploads it as the remote object.
    /// Returns the published length.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Publish`] if the upload fails.  The cached copy
    /// stays in place, and [`crate::VirtualDirectory::publish`] can
    /// retry the upload later.
    pub fn close(mut self) -> Result<u64> {
        self.finish()
    }

    fn finish(&mut self) -> Result<u64> {
        let writer = lock(&self.writer).take().ok_or(Error::Closed)?;
        let directory = &self.directory;
        let key = &self.key;

        directory
            .mutexes()
            .with_lock(&self.name, || -> Result<u64> {
                let mut file = writer.into_inner().map_err(|e| e.into_error())?;
                let length = file.metadata()?.len();

                // Upload from our own handle: a later `create_output`
                // may already have replaced the cached copy by name.
                file.seek(SeekFrom::Start(0))?;
                directory.upload(key, &mut file)?;
                Ok(length)
            })
    }
}

impl Drop for RemoteOutput {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }

        if let Err(e) = self.finish() {
            tracing::error!(name = %self.name, key = %self.key, error = %e,
                            "failed to publish output dropped without close");
        }
    }
}

impl Write for RemoteOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_to_cache()?;
        Ok(())
    }
}

impl ByteWriter for RemoteOutput {
    fn write_byte(&mut self, byte: u8) -> Result<()> {
        RemoteOutput::write_byte(self, byte)
    }

    fn write_bytes(&mut self, src: &[u8]) -> Result<()> {
        RemoteOutput::write_bytes(self, src)
    }

    fn flush_to_cache(&mut self) -> Result<()> {
        RemoteOutput::flush_to_cache(self)
    }

    fn position(&self) -> u64 {
        RemoteOutput::position(self)
    }

    fn length(&self) -> u64 {
        RemoteOutput::length(self)
    }
}
