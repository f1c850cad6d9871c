//! Bitset futex wait/wake on a word that may live in shared memory.
//!
//! The calls use the shared (not process-private) futex variants so that
//! waiters in different processes mapping the same word see each other.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod imp {
    use std::mem;
    use std::ptr;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    const NANOS_PER_SEC: libc::c_long = 1_000_000_000;

    /// Absolute CLOCK_MONOTONIC time `timeout` from now, as FUTEX_WAIT_BITSET expects.
    fn monotonic_after(timeout: Duration) -> libc::timespec {
        let mut now: libc::timespec = unsafe { mem::zeroed() };
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) };
        let secs = libc::time_t::try_from(timeout.as_secs()).unwrap_or(libc::time_t::MAX);
        let mut deadline: libc::timespec = unsafe { mem::zeroed() };
        deadline.tv_sec = now.tv_sec.saturating_add(secs);
        deadline.tv_nsec = now.tv_nsec + timeout.subsec_nanos() as libc::c_long;
        if deadline.tv_nsec >= NANOS_PER_SEC {
            deadline.tv_sec = deadline.tv_sec.saturating_add(1);
            deadline.tv_nsec -= NANOS_PER_SEC;
        }
        deadline
    }

    pub(super) fn wait(word: &AtomicU32, expected: u32, mask: u32, timeout: Option<Duration>) {
        let deadline = timeout.map(monotonic_after);
        let deadline_ptr = deadline
            .as_ref()
            .map_or(ptr::null(), |d| d as *const libc::timespec);
        // EAGAIN, EINTR and ETIMEDOUT all send the caller back to re-check the word.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32 as *const u32,
                libc::FUTEX_WAIT_BITSET,
                expected,
                deadline_ptr,
                ptr::null::<u32>(),
                mask,
            );
        }
    }

    pub(super) fn wake(word: &AtomicU32, mask: u32) {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32 as *const u32,
                libc::FUTEX_WAKE_BITSET,
                libc::c_int::MAX,
                ptr::null::<libc::timespec>(),
                ptr::null::<u32>(),
                mask,
            );
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod imp {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::Duration;

    const POLL_INTERVAL: Duration = Duration::from_micros(200);

    pub(super) fn wait(word: &AtomicU32, expected: u32, _mask: u32, timeout: Option<Duration>) {
        if word.load(Ordering::Acquire) != expected {
            return;
        }
        let nap = timeout.map_or(POLL_INTERVAL, |t| t.min(POLL_INTERVAL));
        thread::sleep(nap);
    }

    pub(super) fn wake(_word: &AtomicU32, _mask: u32) {}
}

/// Sleeps while `word == expected`, for at most `timeout`. Returns on any
/// wake, value change, signal or timeout; callers must re-check the word.
#[inline]
pub(crate) fn wait(word: &AtomicU32, expected: u32, mask: u32, timeout: Option<Duration>) {
    imp::wait(word, expected, mask, timeout)
}

/// Wakes every waiter whose mask overlaps `mask`.
#[inline]
pub(crate) fn wake(word: &AtomicU32, mask: u32) {
    imp::wake(word, mask)
}
