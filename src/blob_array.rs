//! Indexed collection of opaque byte blobs with per-index locking and an idle lifecycle.

use crate::error::StoreError;
use crate::region_file::{EntryReader, EntryWriter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContainerState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// A fixed number of independently locked blob entries.
///
/// `open_read`/`open_write` return `None` only from a store that is not yet usable, such as
/// [`OpenInProgress`]. Every other store returns a handle or an error.
pub trait BlobArray: Send + Sync {
    fn entry_count(&self) -> usize;

    /// Blocks until the entry's read lock is free.
    fn open_read(&self, index: usize) -> Result<Option<EntryReader<'_>>, StoreError>;

    /// Blocks until the entry's write lock is free.
    fn open_write(&self, index: usize) -> Result<Option<EntryWriter<'_>>, StoreError>;

    fn exists(&self, index: usize) -> Result<bool, StoreError>;

    fn delete(&self, index: usize) -> Result<bool, StoreError>;

    /// Closes the store if no stream is open; never blocks on entry locks.
    ///
    /// Returns `true` if the store is closed afterwards.
    fn attempt_close(&self) -> Result<bool, StoreError>;

    fn is_timed_out(&self) -> bool;

    fn close_if_timed_out(&self) -> Result<bool, StoreError>;

    fn state(&self) -> ContainerState;

    fn is_closed(&self) -> bool {
        self.state() == ContainerState::Closed
    }
}

/// Stand-in for a region whose file is still being opened by another thread.
///
/// Reports every entry as absent and refuses to close.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenInProgress;

impl BlobArray for OpenInProgress {
    fn entry_count(&self) -> usize {
        0
    }

    fn open_read(&self, _index: usize) -> Result<Option<EntryReader<'_>>, StoreError> {
        Ok(None)
    }

    fn open_write(&self, _index: usize) -> Result<Option<EntryWriter<'_>>, StoreError> {
        Ok(None)
    }

    fn exists(&self, _index: usize) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn delete(&self, _index: usize) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn attempt_close(&self) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn is_timed_out(&self) -> bool {
        false
    }

    fn close_if_timed_out(&self) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn state(&self) -> ContainerState {
        ContainerState::Opening
    }
}
