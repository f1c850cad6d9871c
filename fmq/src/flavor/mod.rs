//! Synchronization flavors.
//!
//! A queue's flavor is fixed when it is created and is carried as a type
//! parameter of [`MessageQueue`](crate::MessageQueue), so the overflow policy
//! and the location of the read cursor are resolved at compile time.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_derive::{Deserialize, Serialize};

use crate::errors::{FmqError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlavorKind {
    /// One writer, one reader, no overflow.
    Synchronized,
    /// One writer, any number of readers, writes never block.
    Unsynchronized,
}

impl FlavorKind {
    #[inline]
    pub fn has_shared_read_counter(self) -> bool {
        self == FlavorKind::Synchronized
    }

    /// Unsynchronized writers announce how far they are about to write
    /// before copying, so readers can tell when a slot was reused.
    #[inline]
    pub fn has_write_reservation(self) -> bool {
        self == FlavorKind::Unsynchronized
    }
}

/// Where a reader keeps its position.
pub trait ReadCursor {
    fn load(&self) -> u64;
    fn store(&mut self, pos: u64);
}

/// Read counter living in the shared region, owned by the single reader.
pub struct SharedCursor {
    counter: NonNull<AtomicU64>,
}

impl SharedCursor {
    /// # Safety
    /// `counter` must stay mapped for the lifetime of the cursor.
    pub(crate) unsafe fn new(counter: NonNull<AtomicU64>) -> SharedCursor {
        SharedCursor { counter }
    }
}

impl ReadCursor for SharedCursor {
    #[inline]
    fn load(&self) -> u64 {
        // Acquire pairs with the reader's release so the writer never reuses
        // a slot that is still being copied out.
        unsafe { self.counter.as_ref() }.load(Ordering::Acquire)
    }

    #[inline]
    fn store(&mut self, pos: u64) {
        unsafe { self.counter.as_ref() }.store(pos, Ordering::Release);
    }
}

/// Read position private to one handle.
#[derive(Debug, Default)]
pub struct LocalCursor {
    pos: u64,
}

impl ReadCursor for LocalCursor {
    #[inline]
    fn load(&self) -> u64 {
        self.pos
    }

    #[inline]
    fn store(&mut self, pos: u64) {
        self.pos = pos;
    }
}

mod sealed {
    pub trait Sealed {}
}

pub trait Flavor: sealed::Sealed + 'static {
    const KIND: FlavorKind;
    type Cursor: ReadCursor;

    /// Builds the read cursor for a freshly mapped handle.
    ///
    /// # Safety
    /// `shared` must point into a mapping that outlives the cursor.
    unsafe fn cursor(shared: Option<NonNull<AtomicU64>>, write_pos: u64) -> Result<Self::Cursor>;

    /// Validates a write of `count` quanta.
    fn check_write(capacity: u64, write_pos: u64, read_pos: u64, count: u64) -> Result<()>;

    /// Validates a read of `count` quanta and returns the position to read
    /// from. May move the cursor.
    fn check_read(
        cursor: &mut Self::Cursor,
        capacity: u64,
        write_pos: u64,
        count: u64,
    ) -> Result<u64>;

    /// Re-validates a read once its quanta have been copied out. `reserved`
    /// is the furthest position the writer may have started copying to,
    /// published or not.
    fn check_commit_read(
        cursor: &mut Self::Cursor,
        capacity: u64,
        write_pos: u64,
        reserved: u64,
        read_pos: u64,
    ) -> Result<()>;

    fn available_to_write(capacity: u64, write_pos: u64, read_pos: u64) -> u64;
}

/// Requests larger than the ring can never succeed, whatever the counters say.
#[inline]
fn exceeds_capacity(capacity: u64, count: u64) -> Result<()> {
    if count > capacity {
        return Err(FmqError::ExceedsCapacity {
            requested: count as usize,
            capacity: capacity as usize,
        });
    }
    Ok(())
}

/// Single writer, single reader. Writes that would overwrite unread data
/// are rejected.
#[derive(Debug)]
pub enum Synchronized {}

/// Single writer, many readers. Writes always land; readers that fall more
/// than a full ring behind lose their pending data.
#[derive(Debug)]
pub enum Unsynchronized {}

impl sealed::Sealed for Synchronized {}
impl sealed::Sealed for Unsynchronized {}

impl Flavor for Synchronized {
    const KIND: FlavorKind = FlavorKind::Synchronized;
    type Cursor = SharedCursor;

    unsafe fn cursor(shared: Option<NonNull<AtomicU64>>, _write_pos: u64) -> Result<SharedCursor> {
        shared
            .map(|counter| SharedCursor::new(counter))
            .ok_or_else(|| FmqError::InvalidDescriptor("synchronized queue without read counter".into()))
    }

    #[inline]
    fn check_write(capacity: u64, write_pos: u64, read_pos: u64, count: u64) -> Result<()> {
        exceeds_capacity(capacity, count)?;
        let available = Self::available_to_write(capacity, write_pos, read_pos);
        if count > available {
            return Err(FmqError::InsufficientSpace {
                requested: count as usize,
                available: available as usize,
            });
        }
        Ok(())
    }

    #[inline]
    fn check_read(cursor: &mut SharedCursor, capacity: u64, write_pos: u64, count: u64) -> Result<u64> {
        exceeds_capacity(capacity, count)?;
        let read_pos = cursor.load();
        let available = write_pos.wrapping_sub(read_pos);
        if count > available {
            return Err(FmqError::InsufficientData {
                requested: count as usize,
                available: available as usize,
            });
        }
        Ok(read_pos)
    }

    #[inline]
    fn check_commit_read(_: &mut SharedCursor, _: u64, _: u64, _: u64, _: u64) -> Result<()> {
        Ok(())
    }

    #[inline]
    fn available_to_write(capacity: u64, write_pos: u64, read_pos: u64) -> u64 {
        capacity.saturating_sub(write_pos.wrapping_sub(read_pos))
    }
}

impl Unsynchronized {
    fn overrun(cursor: &mut LocalCursor, lag: u64, write_pos: u64) -> FmqError {
        tracing::warn!(lag, resync_to = write_pos, "reader overrun, dropping stale quanta");
        cursor.store(write_pos);
        FmqError::Overflow {
            lag,
            resync_to: write_pos,
        }
    }
}

impl Flavor for Unsynchronized {
    const KIND: FlavorKind = FlavorKind::Unsynchronized;
    type Cursor = LocalCursor;

    unsafe fn cursor(_shared: Option<NonNull<AtomicU64>>, write_pos: u64) -> Result<LocalCursor> {
        Ok(LocalCursor { pos: write_pos })
    }

    #[inline]
    fn check_write(capacity: u64, _write_pos: u64, _read_pos: u64, count: u64) -> Result<()> {
        exceeds_capacity(capacity, count)
    }

    #[inline]
    fn check_read(cursor: &mut LocalCursor, capacity: u64, write_pos: u64, count: u64) -> Result<u64> {
        exceeds_capacity(capacity, count)?;
        let read_pos = cursor.load();
        let available = write_pos.wrapping_sub(read_pos);
        if available > capacity {
            return Err(Self::overrun(cursor, available, write_pos));
        }
        if count > available {
            return Err(FmqError::InsufficientData {
                requested: count as usize,
                available: available as usize,
            });
        }
        Ok(read_pos)
    }

    #[inline]
    fn check_commit_read(
        cursor: &mut LocalCursor,
        capacity: u64,
        write_pos: u64,
        reserved: u64,
        read_pos: u64,
    ) -> Result<()> {
        // Any slot below `reserved` may already hold newer data, even if the
        // writer has not published it yet.
        let lag = reserved.max(write_pos).wrapping_sub(read_pos);
        if lag > capacity {
            return Err(Self::overrun(cursor, lag, write_pos));
        }
        Ok(())
    }

    #[inline]
    fn available_to_write(capacity: u64, write_pos: u64, read_pos: u64) -> u64 {
        capacity - write_pos.wrapping_sub(read_pos).min(capacity)
    }
}
