use std::ptr;
use std::time::Duration;

use crate::core::Quantum;
use crate::errors::{FmqError, Result};
use crate::event_flag::{Deadline, EventFlag, Remaining, NOT_EMPTY, NOT_FULL};
use crate::flavor::{Flavor, ReadCursor};
use crate::queue::MessageQueue;

/// Slots reserved for a write that has not been published yet.
///
/// The reserved range is at most two contiguous runs, split where the ring
/// wraps. Nothing becomes visible to readers until [`commit`](Self::commit);
/// dropping the transaction abandons it. On Unsynchronized queues the slots
/// count as reserved from `begin_write` on, so a reader holding one of them
/// fails its commit even if this transaction is later abandoned.
pub struct WriteTransaction<'q, T: Quantum, F: Flavor> {
    queue: &'q mut MessageQueue<T, F>,
    pos: u64,
    count: usize,
}

impl<'q, T: Quantum, F: Flavor> WriteTransaction<'q, T, F> {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    fn slot(&self, i: usize) -> *mut T {
        let (start, first, _) = self.queue.runs(self.pos, self.count);
        if i < first {
            self.queue.slot(start + i)
        } else {
            self.queue.slot(i - first)
        }
    }

    /// Stores `value` as the `i`-th quantum of the transaction.
    ///
    /// # Panics
    /// If `i` is out of range.
    pub fn set(&mut self, i: usize, value: T) {
        assert!(i < self.count, "index {} out of range for transaction of {}", i, self.count);
        unsafe { ptr::write(self.slot(i), value) };
    }

    /// Copies all of `src` into the reserved slots.
    ///
    /// # Panics
    /// If `src.len()` differs from the transaction length.
    pub fn copy_from_slice(&mut self, src: &[T]) {
        assert_eq!(src.len(), self.count, "source length must match transaction length");
        let (start, first, second) = self.queue.runs(self.pos, self.count);
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.queue.slot(start), first);
            if second > 0 {
                ptr::copy_nonoverlapping(src.as_ptr().add(first), self.queue.slot(0), second);
            }
        }
    }

    /// Publishes the reserved quanta and raises [`NOT_EMPTY`].
    pub fn commit(self) -> Result<()> {
        if self.count == 0 {
            return Ok(());
        }
        self.queue.store_write_pos(self.pos + self.count as u64);
        self.queue.notify(NOT_EMPTY);
        Ok(())
    }
}

impl<T: Quantum, F: Flavor> MessageQueue<T, F> {
    /// Reserves `count` slots for zero-copy writing.
    pub fn begin_write(&mut self, count: usize) -> Result<WriteTransaction<'_, T, F>> {
        let pos = self.load_write_pos();
        F::check_write(self.capacity, pos, self.cursor.load(), count as u64)?;
        if count > 0 {
            self.reserve(pos + count as u64);
        }
        Ok(WriteTransaction {
            queue: self,
            pos,
            count,
        })
    }

    /// Writes all of `data` or nothing.
    ///
    /// Synchronized queues refuse writes that would overwrite unread quanta.
    /// Unsynchronized queues accept any write that fits the ring and may
    /// overwrite what slow readers have not consumed.
    pub fn write(&mut self, data: &[T]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut tx = self.begin_write(data.len())?;
        tx.copy_from_slice(data);
        tx.commit()
    }

    /// [`write`](Self::write), waiting on the queue's event flag for space.
    /// Waits for [`NOT_FULL`] and raises [`NOT_EMPTY`].
    pub fn write_blocking(&mut self, data: &[T], timeout: Option<Duration>) -> Result<()> {
        self.write_blocking_with(data, NOT_FULL, NOT_EMPTY, timeout)
    }

    /// [`write`](Self::write), waiting for any of `wait_bits` on the queue's
    /// event flag and raising `notify_bits` once the data is in.
    pub fn write_blocking_with(
        &mut self,
        data: &[T],
        wait_bits: u32,
        notify_bits: u32,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let flag = self.own_event_flag()?;
        self.write_blocking_on(&flag, data, wait_bits, notify_bits, timeout)
    }

    /// Blocking write coordinated through an external event flag.
    ///
    /// `None` or a zero timeout blocks until the write succeeds. An expired
    /// deadline still gets one attempt before [`FmqError::Timeout`].
    pub fn write_blocking_on(
        &mut self,
        flag: &EventFlag,
        data: &[T],
        wait_bits: u32,
        notify_bits: u32,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if wait_bits == 0 || notify_bits == 0 {
            return Err(FmqError::EmptyBitmask);
        }
        let deadline = Deadline::after(timeout);
        loop {
            match self.write(data) {
                Ok(()) => return flag.wake(notify_bits),
                Err(e) if e.is_retryable() => {}
                Err(e) => return Err(e),
            }
            let remaining = match deadline.remaining() {
                Remaining::Expired => return Err(FmqError::Timeout),
                Remaining::Unbounded => None,
                Remaining::Left(left) => Some(left),
            };
            // Clear before re-checking so a reader that frees space after
            // the check changes the word the park below sleeps on.
            flag.clear(wait_bits);
            let observed = flag.bits();
            if observed & wait_bits != 0 || self.available_to_write() >= data.len() {
                continue;
            }
            flag.park(observed, wait_bits, remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::Synchronized;

    #[test]
    fn transaction_splits_at_the_wrap_point() -> Result<()> {
        let mut q = MessageQueue::<u32, Synchronized>::with_capacity(8, false)?;
        q.write(&[0; 6])?;
        let mut sink = [0u32; 6];
        q.read(&mut sink)?;

        let mut tx = q.begin_write(5)?;
        for i in 0..5 {
            tx.set(i, 100 + i as u32);
        }
        tx.commit()?;
        assert_eq!(q.runs(6, 5), (6, 2, 3));

        let mut out = [0u32; 5];
        q.read(&mut out)?;
        assert_eq!(out, [100, 101, 102, 103, 104]);
        Ok(())
    }

    #[test]
    fn abandoned_transaction_publishes_nothing() -> Result<()> {
        let mut q = MessageQueue::<u16, Synchronized>::with_capacity(4, false)?;
        {
            let mut tx = q.begin_write(2)?;
            tx.copy_from_slice(&[7, 8]);
        }
        assert_eq!(q.available_to_read(), 0);
        assert_eq!(q.available_to_write(), 4);
        Ok(())
    }

    #[test]
    fn write_raises_not_empty() -> Result<()> {
        let mut q = MessageQueue::<u16, Synchronized>::with_capacity(4, true)?;
        assert_eq!(q.event_flag().map(|f| f.bits()), Some(0));
        q.write(&[1])?;
        assert_eq!(q.event_flag().map(|f| f.bits() & NOT_EMPTY), Some(NOT_EMPTY));
        Ok(())
    }
}
