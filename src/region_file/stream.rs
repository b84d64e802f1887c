use super::lock::{EntryReadGuard, EntryWriteGuard};
use super::RegionFile;
use crate::error::StoreError;
use std::io::{self, Cursor, Read, Write};

/// Shared view of one entry's committed bytes.
///
/// Holds the entry's read lock until dropped, so a writer to the same index waits for it.
#[derive(Debug)]
pub struct EntryReader<'a> {
    data: Cursor<Vec<u8>>,
    _guard: EntryReadGuard<'a>,
}

impl<'a> EntryReader<'a> {
    pub(super) fn new(guard: EntryReadGuard<'a>, bytes: Vec<u8>) -> Self {
        Self {
            data: Cursor::new(bytes),
            _guard: guard,
        }
    }

    pub fn len(&self) -> usize {
        self.data.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.get_ref().is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.data.get_ref()
    }

    /// Releases the lock and keeps the bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data.into_inner()
    }
}

impl Read for EntryReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.data.read(buf)
    }
}

/// Exclusive writer for one entry.
///
/// Bytes are buffered in memory and replace the entry as a whole when [`close`](Self::close)
/// succeeds. Dropping an unclosed writer discards the buffer.
#[derive(Debug)]
pub struct EntryWriter<'a> {
    file: &'a RegionFile,
    index: usize,
    buffer: Vec<u8>,
    guard: Option<EntryWriteGuard<'a>>,
}

impl<'a> EntryWriter<'a> {
    pub(super) fn new(file: &'a RegionFile, index: usize, guard: EntryWriteGuard<'a>) -> Self {
        Self {
            file,
            index,
            buffer: Vec::new(),
            guard: Some(guard),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_none()
    }

    /// Commits the buffered bytes and releases the entry lock.
    ///
    /// The lock is released whether or not the commit succeeds. A second call returns
    /// [`StoreError::DoubleClose`] and leaves the committed entry untouched.
    pub fn close(&mut self) -> Result<(), StoreError> {
        let Some(guard) = self.guard.take() else {
            return Err(StoreError::DoubleClose { index: self.index });
        };
        let result = self.file.commit(self.index, &self.buffer);
        drop(guard);
        self.buffer = Vec::new();
        result
    }
}

impl Write for EntryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.guard.is_none() {
            return Err(StoreError::DoubleClose { index: self.index }.into());
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EntryWriter<'_> {
    fn drop(&mut self) {
        if self.guard.is_some() {
            log::warn!(
                "{}: writer for entry {} dropped without close, discarding {} bytes",
                self.file.path().display(),
                self.index,
                self.buffer.len()
            );
        }
    }
}
