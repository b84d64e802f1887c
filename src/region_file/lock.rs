//! Per-entry locks coupled to the region file's open-stream counter.
//!
//! A guard increments the counter before it waits for its entry lock and decrements it after the
//! lock is released, so the counter never reads zero while any entry lock is held. Closing swaps
//! the counter from zero to [`CLOSED`], after which no new guard can be taken.

use crate::error::StoreError;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use web_time::Instant;

const CLOSED: isize = isize::MIN;

#[derive(Debug)]
pub(crate) struct StreamCounter {
    open: AtomicIsize,
    last_release: Mutex<Instant>,
}

impl StreamCounter {
    pub fn new() -> Self {
        Self {
            open: AtomicIsize::new(0),
            last_release: Mutex::new(Instant::now()),
        }
    }

    pub fn acquire(&self) -> Result<StreamTicket<'_>, StoreError> {
        let mut current = self.open.load(Ordering::Acquire);
        loop {
            if current < 0 {
                return Err(StoreError::Closed);
            }
            match self.open.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(StreamTicket { counter: self }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Moves the counter from zero to closed. Fails without blocking if any stream is open.
    pub fn try_close(&self) -> bool {
        self.open
            .compare_exchange(0, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Undoes a [`try_close`](Self::try_close) whose close could not complete.
    pub fn reopen(&self) {
        let _ = self
            .open
            .compare_exchange(CLOSED, 0, Ordering::AcqRel, Ordering::Acquire);
        self.touch();
    }

    pub fn is_closed(&self) -> bool {
        self.open.load(Ordering::Acquire) < 0
    }

    pub fn open_streams(&self) -> usize {
        self.open.load(Ordering::Acquire).max(0) as usize
    }

    pub fn idle_for(&self) -> Duration {
        self.last_release().elapsed()
    }

    fn touch(&self) {
        *self.last_release() = Instant::now();
    }

    fn last_release(&self) -> MutexGuard<'_, Instant> {
        self.last_release
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One open stream counted against the region file.
#[derive(Debug)]
pub(crate) struct StreamTicket<'a> {
    counter: &'a StreamCounter,
}

impl Drop for StreamTicket<'_> {
    fn drop(&mut self) {
        self.counter.touch();
        self.counter.open.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Default)]
pub(crate) struct EntryLock {
    lock: RwLock<()>,
}

// Field order matters: the entry lock is released before the ticket.
#[derive(Debug)]
pub(crate) struct EntryReadGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
    _ticket: StreamTicket<'a>,
}

#[derive(Debug)]
pub(crate) struct EntryWriteGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    _ticket: StreamTicket<'a>,
}

impl EntryLock {
    pub fn read<'a>(&'a self, counter: &'a StreamCounter) -> Result<EntryReadGuard<'a>, StoreError> {
        let ticket = counter.acquire()?;
        let guard = self
            .lock
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(EntryReadGuard {
            _guard: guard,
            _ticket: ticket,
        })
    }

    pub fn write<'a>(
        &'a self,
        counter: &'a StreamCounter,
    ) -> Result<EntryWriteGuard<'a>, StoreError> {
        let ticket = counter.acquire()?;
        let guard = self
            .lock
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(EntryWriteGuard {
            _guard: guard,
            _ticket: ticket,
        })
    }
}
