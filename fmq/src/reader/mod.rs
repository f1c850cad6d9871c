use std::ptr;
use std::time::Duration;

use crate::core::Quantum;
use crate::errors::{FmqError, Result};
use crate::event_flag::{Deadline, EventFlag, Remaining, NOT_EMPTY, NOT_FULL};
use crate::flavor::{Flavor, FlavorKind, ReadCursor};
use crate::queue::MessageQueue;

const PEER_WAIT_SLICE: Duration = Duration::from_millis(10);

/// Published quanta borrowed for zero-copy reading.
///
/// The cursor only moves on [`commit`](Self::commit). For Unsynchronized
/// queues the writer may overwrite the slots while they are borrowed.
/// `commit` compares against the writer's reservation, which is raised
/// before the writer touches a slot, so any overwrite that could have
/// reached a quantum read before the commit is reported as
/// [`FmqError::Overflow`]. Whatever was copied out must then be discarded.
pub struct ReadTransaction<'q, T: Quantum, F: Flavor> {
    queue: &'q mut MessageQueue<T, F>,
    pos: u64,
    count: usize,
}

impl<'q, T: Quantum, F: Flavor> ReadTransaction<'q, T, F> {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The `i`-th quantum of the transaction.
    ///
    /// # Panics
    /// If `i` is out of range.
    pub fn get(&self, i: usize) -> T {
        assert!(i < self.count, "index {} out of range for transaction of {}", i, self.count);
        let (start, first, _) = self.queue.runs(self.pos, self.count);
        let slot = if i < first {
            self.queue.slot(start + i)
        } else {
            self.queue.slot(i - first)
        };
        unsafe { ptr::read(slot) }
    }

    /// Copies every borrowed quantum into `dst`.
    ///
    /// # Panics
    /// If `dst.len()` differs from the transaction length.
    pub fn copy_to_slice(&self, dst: &mut [T]) {
        assert_eq!(dst.len(), self.count, "destination length must match transaction length");
        let (start, first, second) = self.queue.runs(self.pos, self.count);
        unsafe {
            ptr::copy_nonoverlapping(self.queue.slot(start), dst.as_mut_ptr(), first);
            if second > 0 {
                ptr::copy_nonoverlapping(self.queue.slot(0), dst.as_mut_ptr().add(first), second);
            }
        }
    }

    /// Releases the slots back to the writer and raises [`NOT_FULL`].
    pub fn commit(self) -> Result<()> {
        if self.count == 0 {
            return Ok(());
        }
        let queue = self.queue;
        let write_pos = queue.load_write_pos();
        let reserved = queue.load_reserved(write_pos);
        F::check_commit_read(&mut queue.cursor, queue.capacity, write_pos, reserved, self.pos)?;
        queue.cursor.store(self.pos + self.count as u64);
        queue.notify(NOT_FULL);
        Ok(())
    }
}

impl<T: Quantum, F: Flavor> MessageQueue<T, F> {
    /// Borrows the next `count` published quanta.
    pub fn begin_read(&mut self, count: usize) -> Result<ReadTransaction<'_, T, F>> {
        let write_pos = self.load_write_pos();
        let pos = F::check_read(&mut self.cursor, self.capacity, write_pos, count as u64)?;
        Ok(ReadTransaction {
            queue: self,
            pos,
            count,
        })
    }

    /// Fills all of `out` or nothing.
    ///
    /// An Unsynchronized reader that the writer lapped gets
    /// [`FmqError::Overflow`]; its cursor jumps to the current write
    /// position so the next read sees only fresh data.
    pub fn read(&mut self, out: &mut [T]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let tx = self.begin_read(out.len())?;
        tx.copy_to_slice(out);
        tx.commit()
    }

    /// [`read`](Self::read), waiting on the queue's event flag for data.
    /// Waits for [`NOT_EMPTY`] and raises [`NOT_FULL`].
    pub fn read_blocking(&mut self, out: &mut [T], timeout: Option<Duration>) -> Result<()> {
        self.read_blocking_with(out, NOT_EMPTY, NOT_FULL, timeout)
    }

    pub fn read_blocking_with(
        &mut self,
        out: &mut [T],
        wait_bits: u32,
        notify_bits: u32,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let flag = self.own_event_flag()?;
        self.read_blocking_on(&flag, out, wait_bits, notify_bits, timeout)
    }

    /// Blocking read coordinated through an external event flag.
    ///
    /// Overflow is returned right away rather than waited out. Every return
    /// from the futex leads to a fresh availability check, so a wake that
    /// another reader consumed costs latency but never strands this call.
    pub fn read_blocking_on(
        &mut self,
        flag: &EventFlag,
        out: &mut [T],
        wait_bits: u32,
        notify_bits: u32,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        if wait_bits == 0 || notify_bits == 0 {
            return Err(FmqError::EmptyBitmask);
        }
        let deadline = Deadline::after(timeout);
        loop {
            match self.read(out) {
                Ok(()) => return flag.wake(notify_bits),
                Err(e) if e.is_retryable() => {}
                Err(e) => return Err(e),
            }
            let remaining = match deadline.remaining() {
                Remaining::Expired => return Err(FmqError::Timeout),
                Remaining::Unbounded => None,
                Remaining::Left(left) => Some(left),
            };
            flag.clear(wait_bits);
            let observed = flag.bits();
            if observed & wait_bits != 0 || self.available_to_read() >= out.len() {
                continue;
            }
            flag.park(observed, wait_bits, Self::read_wait_slice(remaining));
        }
    }

    /// Unsynchronized readers share one [`NOT_EMPTY`] bit and each clears it
    /// before sleeping. A peer can clear a wake meant for us after our
    /// availability check, so their sleeps are cut into slices that bound
    /// the extra latency.
    #[inline]
    fn read_wait_slice(remaining: Option<Duration>) -> Option<Duration> {
        if F::KIND != FlavorKind::Unsynchronized {
            return remaining;
        }
        Some(remaining.map_or(PEER_WAIT_SLICE, |left| left.min(PEER_WAIT_SLICE)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::{Synchronized, Unsynchronized};

    #[test]
    fn read_transaction_get_walks_across_the_wrap() -> Result<()> {
        let mut q = MessageQueue::<u8, Synchronized>::with_capacity(4, false)?;
        q.write(&[1, 2, 3])?;
        q.read(&mut [0; 3])?;
        q.write(&[4, 5, 6])?;
        let tx = q.begin_read(3)?;
        let got: Vec<u8> = (0..tx.len()).map(|i| tx.get(i)).collect();
        assert_eq!(got, vec![4, 5, 6]);
        tx.commit()?;
        assert_eq!(q.available_to_read(), 0);
        Ok(())
    }

    #[test]
    fn lapped_read_transaction_fails_on_commit() -> Result<()> {
        let mut writer = MessageQueue::<u16, Unsynchronized>::with_capacity(4, false)?;
        let mut reader = MessageQueue::<u16, Unsynchronized>::attach(writer.descriptor())?;
        writer.write(&[1, 2])?;
        {
            let tx = reader.begin_read(2)?;
            assert_eq!(tx.get(0), 1);
            // the writer laps the borrowed slots
            writer.write(&[3, 4, 5, 6])?;
            writer.write(&[7])?;
            assert!(matches!(tx.commit(), Err(FmqError::Overflow { .. })));
        }
        assert_eq!(reader.available_to_read(), 0);
        writer.write(&[8])?;
        let mut out = [0u16; 1];
        reader.read(&mut out)?;
        assert_eq!(out, [8]);
        Ok(())
    }

    #[test]
    fn unpublished_overwrite_of_borrowed_slots_fails_the_commit() -> Result<()> {
        let mut writer = MessageQueue::<u16, Unsynchronized>::with_capacity(4, false)?;
        let mut reader = MessageQueue::<u16, Unsynchronized>::attach(writer.descriptor())?;
        writer.write(&[0, 1, 2, 3])?;
        {
            let tx = reader.begin_read(2)?;
            assert_eq!(tx.get(0), 0);
            // slot 0 is rewritten but write_pos still says 4
            let mut wtx = writer.begin_write(3)?;
            wtx.copy_from_slice(&[4, 5, 6]);
            assert_eq!(tx.get(0), 4);
            assert!(matches!(tx.commit(), Err(FmqError::Overflow { lag: 7, resync_to: 4 })));
            wtx.commit()?;
        }
        let mut out = [0u16; 3];
        reader.read(&mut out)?;
        assert_eq!(out, [4, 5, 6]);
        Ok(())
    }

    #[test]
    fn commit_accepts_a_reservation_that_stops_short_of_the_borrowed_slots() -> Result<()> {
        let mut writer = MessageQueue::<u16, Unsynchronized>::with_capacity(4, false)?;
        let mut reader = MessageQueue::<u16, Unsynchronized>::attach(writer.descriptor())?;
        writer.write(&[0, 1])?;
        let tx = reader.begin_read(2)?;
        let wtx = writer.begin_write(2)?;
        tx.commit()?;
        wtx.commit()?;
        assert_eq!(reader.available_to_read(), 2);
        Ok(())
    }

    #[test]
    fn read_raises_not_full() -> Result<()> {
        let mut q = MessageQueue::<u16, Synchronized>::with_capacity(4, true)?;
        q.write(&[1, 2])?;
        q.read(&mut [0; 2])?;
        let bits = q.event_flag().map(|f| f.bits()).unwrap_or(0);
        assert_eq!(bits & NOT_FULL, NOT_FULL);
        Ok(())
    }
}
