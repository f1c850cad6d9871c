//! Cross-process bit flags with blocking wait.
//!
//! An [`EventFlag`] is a single `u32` in shared memory. Any process mapping
//! the word can set bits and wake waiters, or block until one of a set of
//! bits becomes set. The queue uses two conventional bits, [`NOT_FULL`] and
//! [`NOT_EMPTY`]; the remaining bits are free for applications.
//!
//! The flag only orders wakeups. Blocking queue operations always retry the
//! non-blocking operation after waking, so a stale bit costs one extra
//! attempt and never a wrong answer.

use std::fmt;
use std::mem;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::core::{Grantor, Region};
use crate::errors::{FmqError, Result};

mod futex;

/// Set by readers once slots were freed.
pub const NOT_FULL: u32 = 1 << 0;
/// Set by writers once quanta were published.
pub const NOT_EMPTY: u32 = 1 << 1;

/// Handle to an event flag word.
///
/// The handle does not own the word; the mapping it points into must outlive
/// it. Queues hand out references tied to their own lifetime, and
/// [`SharedEventFlag`] owns its region.
pub struct EventFlag {
    word: NonNull<AtomicU32>,
}

unsafe impl Send for EventFlag {}
unsafe impl Sync for EventFlag {}

impl EventFlag {
    /// # Safety
    /// `word` must be valid, 4-byte aligned, and stay mapped while the
    /// returned handle is alive.
    pub unsafe fn from_raw(word: NonNull<AtomicU32>) -> EventFlag {
        EventFlag { word }
    }

    #[inline]
    fn word(&self) -> &AtomicU32 {
        unsafe { self.word.as_ref() }
    }

    /// Current bits.
    #[inline]
    pub fn bits(&self) -> u32 {
        self.word().load(Ordering::Acquire)
    }

    /// Sets `mask` and wakes every waiter interested in any of its bits.
    pub fn wake(&self, mask: u32) -> Result<()> {
        if mask == 0 {
            return Err(FmqError::EmptyBitmask);
        }
        let previous = self.word().fetch_or(mask, Ordering::AcqRel);
        // A waiter only sleeps while all of its bits are clear, so if every
        // bit was already set nobody on `mask` can be asleep.
        if previous & mask != mask {
            futex::wake(self.word(), mask);
        }
        Ok(())
    }

    /// Clears `mask`, returning which of its bits were set.
    #[inline]
    pub fn clear(&self, mask: u32) -> u32 {
        self.word().fetch_and(!mask, Ordering::AcqRel) & mask
    }

    /// Blocks until any bit of `mask` is set and returns the whole word as
    /// observed. Bits are left set. `None` or a zero timeout waits forever.
    pub fn wait(&self, mask: u32, timeout: Option<Duration>) -> Result<u32> {
        if mask == 0 {
            return Err(FmqError::EmptyBitmask);
        }
        let deadline = Deadline::after(timeout);
        loop {
            let bits = self.bits();
            if bits & mask != 0 {
                return Ok(bits);
            }
            let remaining = match deadline.remaining() {
                Remaining::Expired => return Err(FmqError::Timeout),
                Remaining::Unbounded => None,
                Remaining::Left(left) => Some(left),
            };
            futex::wait(self.word(), bits, mask, remaining);
        }
    }

    /// Like [`wait`](Self::wait), then clears the bits of `mask` it saw set.
    pub fn wait_and_clear(&self, mask: u32, timeout: Option<Duration>) -> Result<u32> {
        let bits = self.wait(mask, timeout)?;
        self.clear(bits & mask);
        Ok(bits)
    }

    /// Sleeps while the word still equals `observed`, for at most `timeout`.
    /// Returns on any change of the word, any wake on `mask`, or spuriously;
    /// callers re-check their own condition afterwards.
    #[inline]
    pub(crate) fn park(&self, observed: u32, mask: u32, timeout: Option<Duration>) {
        futex::wait(self.word(), observed, mask, timeout)
    }

    pub(crate) fn as_ptr(&self) -> NonNull<AtomicU32> {
        self.word
    }
}

impl fmt::Debug for EventFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFlag")
            .field("bits", &format_args!("{:#034b}", self.bits()))
            .finish()
    }
}

/// An event flag in its own shared region, for use with
/// `write_blocking_on` / `read_blocking_on` or any other cross-process
/// signalling.
pub struct SharedEventFlag {
    flag: EventFlag,
    region: Region,
}

const WORD: Grantor = Grantor {
    offset: 0,
    extent: mem::size_of::<u32>(),
};

impl SharedEventFlag {
    pub fn create() -> Result<SharedEventFlag> {
        SharedEventFlag::from_region(Region::create(None, WORD.extent)?)
    }

    pub fn create_with_id(os_id: &str) -> Result<SharedEventFlag> {
        SharedEventFlag::from_region(Region::create(Some(os_id), WORD.extent)?)
    }

    pub fn open(os_id: &str) -> Result<SharedEventFlag> {
        SharedEventFlag::from_region(Region::open(os_id)?)
    }

    fn from_region(region: Region) -> Result<SharedEventFlag> {
        let word = region.at::<AtomicU32>(&WORD)?;
        let flag = unsafe { EventFlag::from_raw(word) };
        Ok(SharedEventFlag { flag, region })
    }

    pub fn os_id(&self) -> &str {
        self.region.os_id()
    }
}

impl Deref for SharedEventFlag {
    type Target = EventFlag;

    fn deref(&self) -> &EventFlag {
        &self.flag
    }
}

impl fmt::Debug for SharedEventFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedEventFlag")
            .field("region", &self.region)
            .field("flag", &self.flag)
            .finish()
    }
}

pub(crate) enum Remaining {
    Unbounded,
    Left(Duration),
    Expired,
}

/// Absolute deadline for the blocking calls.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// `None` and zero both mean no deadline.
    pub(crate) fn after(timeout: Option<Duration>) -> Deadline {
        let at = timeout
            .filter(|t| !t.is_zero())
            .and_then(|t| Instant::now().checked_add(t));
        Deadline { at }
    }

    pub(crate) fn remaining(&self) -> Remaining {
        match self.at {
            None => Remaining::Unbounded,
            Some(at) => match at.checked_duration_since(Instant::now()) {
                Some(left) if !left.is_zero() => Remaining::Left(left),
                _ => Remaining::Expired,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const CUSTOM: u32 = 1 << 5;

    #[test]
    fn wait_reports_every_set_bit() -> Result<()> {
        let flag = SharedEventFlag::create()?;
        flag.wake(NOT_EMPTY | CUSTOM)?;
        let bits = flag.wait(NOT_EMPTY, Some(Duration::from_millis(10)))?;
        assert_eq!(bits, NOT_EMPTY | CUSTOM);
        // Waiting does not consume the bits.
        assert_eq!(flag.bits(), NOT_EMPTY | CUSTOM);
        Ok(())
    }

    #[test]
    fn wait_and_clear_only_clears_the_waited_bits() -> Result<()> {
        let flag = SharedEventFlag::create()?;
        flag.wake(NOT_FULL | CUSTOM)?;
        flag.wait_and_clear(NOT_FULL | NOT_EMPTY, None)?;
        assert_eq!(flag.bits(), CUSTOM);
        assert_eq!(flag.clear(CUSTOM | NOT_EMPTY), CUSTOM);
        assert_eq!(flag.bits(), 0);
        Ok(())
    }

    #[test]
    fn wait_times_out_when_nothing_is_set() -> Result<()> {
        let flag = SharedEventFlag::create()?;
        flag.wake(CUSTOM)?;
        let start = Instant::now();
        let res = flag.wait(NOT_EMPTY, Some(Duration::from_millis(50)));
        assert!(matches!(res, Err(FmqError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(50));
        Ok(())
    }

    #[test]
    fn empty_mask_is_rejected() -> Result<()> {
        let flag = SharedEventFlag::create()?;
        assert!(matches!(flag.wake(0), Err(FmqError::EmptyBitmask)));
        assert!(matches!(flag.wait(0, None), Err(FmqError::EmptyBitmask)));
        Ok(())
    }

    #[test]
    fn wake_from_another_thread_through_a_second_mapping() -> Result<()> {
        let flag = SharedEventFlag::create()?;
        let peer = Arc::new(SharedEventFlag::open(flag.os_id())?);
        let waker = {
            let peer = Arc::clone(&peer);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                peer.wake(NOT_FULL)
            })
        };
        let bits = flag.wait(NOT_FULL, Some(Duration::from_secs(5)))?;
        assert_eq!(bits & NOT_FULL, NOT_FULL);
        waker.join().expect("waker panicked")?;
        Ok(())
    }

    #[test]
    fn zero_deadline_never_expires() {
        let deadline = Deadline::after(Some(Duration::ZERO));
        assert!(matches!(deadline.remaining(), Remaining::Unbounded));
        assert!(Deadline::after(Some(Duration::from_nanos(1))).at.is_some());
        assert!(matches!(Deadline::after(None).remaining(), Remaining::Unbounded));
    }
}
