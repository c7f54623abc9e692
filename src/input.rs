//! Read handles.  Opening a `RemoteInput` is the only time a read
//! touches the network: by the time the handle exists, the cached
//! copy has been checked (and refreshed if needed) under the name's
//! mutex, and every later read, seek, or length query is served by
//! the local file.
use std::fs::File;
use std::io::BufReader;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;

use crate::directory::VirtualDirectory;
use crate::error::Result;
use crate::ByteReader;

/// A random-access reader over the cached copy of one logical file.
#[derive(Debug)]
pub struct RemoteInput {
    directory: VirtualDirectory,
    name: String,
    reader: BufReader<File>,
    position: u64,
    length: u64,
}

impl RemoteInput {
    pub(crate) fn new(directory: VirtualDirectory, name: String, file: File) -> Result<RemoteInput> {
        let length = file.metadata()?.len();

        Ok(RemoteInput {
            directory,
            name,
            reader: BufReader::new(file),
            position: 0,
            length,
        })
    }

    /// Returns the logical file name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads one byte.
    pub fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];

        self.read_bytes(&mut byte)?;
        Ok(byte[0])
    }

    /// Fills `dst` entirely, or fails with `UnexpectedEof`.
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        match self.reader.read_exact(dst) {
            Ok(()) => {
                self.position += dst.len() as u64;
                Ok(())
            }
            Err(e) => {
                // `read_exact` leaves the cursor wherever it stopped.
                self.position = self.reader.stream_position()?;
                Err(e.into())
            }
        }
    }

    /// Moves the cursor to `position` bytes from the start.
    pub fn seek_to(&mut self, position: u64) -> Result<()> {
        self.reader.seek(SeekFrom::Start(position))?;
        self.position = position;
        Ok(())
    }

    /// Returns the cursor's offset from the start of the file.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns the length of the file, as of open time.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Opens an independent handle on the same logical file, at the
    /// same position.  This is a full open: the cached copy is checked
    /// against the remote object again.
    pub fn try_clone(&self) -> Result<RemoteInput> {
        let mut clone = self.directory.open_input(&self.name)?;

        clone.seek_to(self.position)?;
        Ok(clone)
    }
}

impl Read for RemoteInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let count = self.reader.read(buf)?;

        self.position += count as u64;
        Ok(count)
    }
}

impl Seek for RemoteInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.position = self.reader.seek(pos)?;
        Ok(self.position)
    }
}

impl ByteReader for RemoteInput {
    fn read_byte(&mut self) -> Result<u8> {
        RemoteInput::read_byte(self)
    }

    fn read_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        RemoteInput::read_bytes(self, dst)
    }

    fn seek_to(&mut self, position: u64) -> Result<()> {
        RemoteInput::seek_to(self, position)
    }

    fn position(&self) -> u64 {
        RemoteInput::position(self)
    }

    fn length(&self) -> u64 {
        RemoteInput::length(self)
    }
}

#[cfg(test)]
mod test {
    use std::io::ErrorKind;
    use std::io::Read;
    use std::io::Seek;
    use std::io::SeekFrom;
    use std::sync::Arc;

    use test_dir::{DirBuilder, TestDir};

    use crate::blob::MemoryBlobStore;
    use crate::error::Error;
    use crate::DirectoryBuilder;

    #[test]
    fn test_cursor() {
        let temp = TestDir::temp();
        let store = Arc::new(MemoryBlobStore::new());
        store.insert("index/data", (0u8..100).collect::<Vec<u8>>());

        let directory = DirectoryBuilder::new(store)
            .cache_dir(temp.path("cache"))
            .build()
            .expect("build must succeed");
        let mut input = directory.open_input("data").expect("open must succeed");

        assert_eq!(input.length(), 100);
        assert_eq!(input.read_byte().expect("read must succeed"), 0);
        assert_eq!(input.position(), 1);

        input.seek_to(90).expect("seek must succeed");
        let mut dst = [0u8; 5];
        input.read_bytes(&mut dst).expect("read must succeed");
        assert_eq!(dst, [90, 91, 92, 93, 94]);
        assert_eq!(input.position(), 95);

        // Reading past the end fails, and leaves the cursor at EOF.
        let mut too_much = [0u8; 10];
        assert!(matches!(input.read_bytes(&mut too_much),
                         Err(Error::Cache(e)) if e.kind() == ErrorKind::UnexpectedEof));
        assert_eq!(input.position(), 100);

        // The std traits move the same cursor.
        assert_eq!(input.seek(SeekFrom::End(-2)).expect("seek must succeed"), 98);
        let mut rest = Vec::new();
        input.read_to_end(&mut rest).expect("read must succeed");
        assert_eq!(rest, vec![98, 99]);
        assert_eq!(input.position(), 100);
    }

    #[test]
    fn test_clone_is_independent() {
        let temp = TestDir::temp();
        let store = Arc::new(MemoryBlobStore::new());
        store.insert("index/data", b"0123456789".to_vec());

        let directory = DirectoryBuilder::new(store.clone())
            .cache_dir(temp.path("cache"))
            .build()
            .expect("build must succeed");
        let mut input = directory.open_input("data").expect("open must succeed");
        input.seek_to(4).expect("seek must succeed");

        let mut clone = input.try_clone().expect("clone must succeed");
        assert_eq!(clone.position(), 4);
        // Cloning re-checks the remote length.
        assert_eq!(store.heads(), 1);

        assert_eq!(clone.read_byte().expect("read must succeed"), b'4');
        assert_eq!(clone.read_byte().expect("read must succeed"), b'5');
        assert_eq!(input.position(), 4);
        assert_eq!(input.read_byte().expect("read must succeed"), b'4');
    }
}
