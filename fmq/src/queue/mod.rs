use std::fmt;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use crate::core::{Layout, Quantum, QueueConfig, Region};
use crate::descriptor::Descriptor;
use crate::errors::{FmqError, Result};
use crate::event_flag::EventFlag;
use crate::flavor::{Flavor, FlavorKind, ReadCursor, Synchronized, Unsynchronized};

/// A process-local handle on a shared message queue.
///
/// Handles are created either with [`create`](Self::create), which
/// allocates the shared region, or with [`attach`](Self::attach), which maps
/// a region described by a [`Descriptor`] received from the creator. All
/// data-path operations go straight to shared memory.
///
/// A handle is `Send` but not `Sync`; operations that move a position take
/// `&mut self`. Each Unsynchronized reader needs its own handle.
pub struct MessageQueue<T: Quantum, F: Flavor> {
    desc: Descriptor,
    pub(crate) capacity: u64,
    write_counter: NonNull<AtomicU64>,
    write_reserve: Option<NonNull<AtomicU64>>,
    pub(crate) cursor: F::Cursor,
    event_flag: Option<EventFlag>,
    data: NonNull<T>,
    region: Region,
}

// The pointers target the handle's own mapping, which moves with it.
unsafe impl<T: Quantum, F: Flavor> Send for MessageQueue<T, F> {}

pub type SyncQueue<T> = MessageQueue<T, Synchronized>;
pub type UnsyncQueue<T> = MessageQueue<T, Unsynchronized>;

impl<T: Quantum, F: Flavor> MessageQueue<T, F> {
    /// Allocates a new shared region and returns the creator's handle.
    ///
    /// The creator owns the OS name of the region: dropping this handle
    /// unlinks it, so peers must attach while it is alive. Peers that are
    /// already attached keep working.
    pub fn create(config: &QueueConfig) -> Result<Self> {
        let layout = Layout::plan(
            F::KIND,
            mem::size_of::<T>(),
            mem::align_of::<T>(),
            config.quantum_count,
            config.event_flag,
        )?;
        let region = Region::create(config.os_id.as_deref(), layout.size)?;
        let desc = Descriptor::new(
            region.os_id().to_string(),
            F::KIND,
            mem::size_of::<T>(),
            config.quantum_count,
            &layout,
        );
        let mut queue = Self::map(region, desc)?;
        queue.write_counter().store(0, Ordering::Release);
        if let Some(reserve) = queue.write_reserve() {
            reserve.store(0, Ordering::Release);
        }
        queue.cursor.store(0);
        if let Some(flag) = &queue.event_flag {
            flag.clear(u32::MAX);
        }
        tracing::info!(
            os_id = queue.desc.os_id(),
            flavor = ?F::KIND,
            quanta = config.quantum_count,
            quantum_size = mem::size_of::<T>(),
            event_flag = config.event_flag,
            "created message queue"
        );
        Ok(queue)
    }

    pub fn with_capacity(quantum_count: usize, event_flag: bool) -> Result<Self> {
        Self::create(&QueueConfig::new(quantum_count, event_flag))
    }

    /// Maps the queue described by `desc`.
    ///
    /// Fails when the flavor or element size disagree with the descriptor,
    /// when the descriptor is malformed, or when the region cannot be opened.
    pub fn attach(desc: &Descriptor) -> Result<Self> {
        if desc.flavor() != F::KIND {
            return Err(FmqError::FlavorMismatch {
                expected: F::KIND,
                found: desc.flavor(),
            });
        }
        if desc.quantum_size() != mem::size_of::<T>() {
            return Err(FmqError::QuantumSizeMismatch {
                expected: mem::size_of::<T>(),
                found: desc.quantum_size(),
            });
        }
        if let Err(e) = desc.validate(mem::align_of::<T>()) {
            tracing::warn!(os_id = desc.os_id(), error = %e, "rejecting descriptor");
            return Err(e);
        }
        let region = Region::open(desc.os_id())?;
        if region.len() < desc.region_size() {
            return Err(FmqError::InvalidDescriptor(format!(
                "region {} maps {} bytes, descriptor needs {}",
                desc.os_id(),
                region.len(),
                desc.region_size()
            )));
        }
        let queue = Self::map(region, desc.clone())?;
        tracing::debug!(os_id = desc.os_id(), flavor = ?F::KIND, "attached message queue");
        Ok(queue)
    }

    fn map(region: Region, desc: Descriptor) -> Result<Self> {
        let layout = desc.layout();
        let write_counter = region.at::<AtomicU64>(&layout.write_counter)?;
        let read_counter = layout
            .read_counter
            .as_ref()
            .map(|g| region.at::<AtomicU64>(g))
            .transpose()?;
        let write_reserve = layout
            .write_reserve
            .as_ref()
            .map(|g| region.at::<AtomicU64>(g))
            .transpose()?;
        let event_flag = layout
            .event_flag
            .as_ref()
            .map(|g| region.at::<AtomicU32>(g))
            .transpose()?
            .map(|word| unsafe { EventFlag::from_raw(word) });
        let data = region.at::<T>(&layout.data)?;
        let write_pos = unsafe { write_counter.as_ref() }.load(Ordering::Acquire);
        let cursor = unsafe { F::cursor(read_counter, write_pos)? };

        Ok(MessageQueue {
            capacity: desc.quantum_count() as u64,
            desc,
            write_counter,
            write_reserve,
            cursor,
            event_flag,
            data,
            region,
        })
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    pub fn flavor(&self) -> FlavorKind {
        F::KIND
    }

    pub fn quantum_count(&self) -> usize {
        self.desc.quantum_count()
    }

    pub fn quantum_size(&self) -> usize {
        self.desc.quantum_size()
    }

    /// True for the handle that created the region.
    pub fn is_owner(&self) -> bool {
        self.region.is_owner()
    }

    /// The event flag allocated with the queue, if any.
    pub fn event_flag(&self) -> Option<&EventFlag> {
        self.event_flag.as_ref()
    }

    /// Re-checks the mapping and, for Synchronized queues, the counter
    /// invariant `0 <= write - read <= capacity`.
    pub fn is_valid(&self) -> bool {
        if self.region.len() < self.desc.region_size() {
            return false;
        }
        let write_pos = self.load_write_pos();
        let read_pos = self.cursor.load();
        F::KIND != FlavorKind::Synchronized
            || (read_pos <= write_pos && write_pos - read_pos <= self.capacity)
    }

    /// Number of quanta the next write can place.
    pub fn available_to_write(&self) -> usize {
        F::available_to_write(self.capacity, self.load_write_pos(), self.cursor.load()) as usize
    }

    /// Number of published quanta this handle has not read yet.
    ///
    /// For an Unsynchronized reader that was lapped this exceeds the
    /// capacity; the next read reports the overflow.
    pub fn available_to_read(&self) -> usize {
        self.load_write_pos().wrapping_sub(self.cursor.load()) as usize
    }

    /// A second handle on the same event flag, detached from `self`'s borrow
    /// so blocking loops can keep calling `&mut self` operations.
    pub(crate) fn own_event_flag(&self) -> Result<EventFlag> {
        self.event_flag
            .as_ref()
            .map(|flag| unsafe { EventFlag::from_raw(flag.as_ptr()) })
            .ok_or(FmqError::NoEventFlag)
    }

    #[inline]
    fn write_counter(&self) -> &AtomicU64 {
        unsafe { self.write_counter.as_ref() }
    }

    #[inline]
    pub(crate) fn load_write_pos(&self) -> u64 {
        self.write_counter().load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn store_write_pos(&self, pos: u64) {
        // Release publishes the quanta copied in before this store.
        self.write_counter().store(pos, Ordering::Release);
    }

    #[inline]
    fn write_reserve(&self) -> Option<&AtomicU64> {
        self.write_reserve.map(|p| unsafe { &*p.as_ptr() })
    }

    /// Announces that slots up to `end` are about to be overwritten. Must
    /// happen before any of them is touched.
    #[inline]
    pub(crate) fn reserve(&self, end: u64) {
        if let Some(reserve) = self.write_reserve() {
            reserve.fetch_max(end, Ordering::Relaxed);
            // orders the reservation before the data stores that follow
            fence(Ordering::Release);
        }
    }

    /// Upper bound of slots a writer may be rewriting right now. Call after
    /// copying quanta out; falls back to `write_pos` without a reservation.
    #[inline]
    pub(crate) fn load_reserved(&self, write_pos: u64) -> u64 {
        match self.write_reserve() {
            Some(reserve) => {
                fence(Ordering::Acquire);
                reserve.load(Ordering::Relaxed).max(write_pos)
            }
            None => write_pos,
        }
    }

    #[inline]
    pub(crate) fn notify(&self, bits: u32) {
        if let Some(flag) = &self.event_flag {
            // bits are crate constants, never empty
            let _ = flag.wake(bits);
        }
    }

    /// Splits `count` quanta starting at `pos` into the run up to the end of
    /// the ring and the wrapped run from slot 0.
    #[inline]
    pub(crate) fn runs(&self, pos: u64, count: usize) -> (usize, usize, usize) {
        let start = (pos % self.capacity) as usize;
        let first = count.min(self.capacity as usize - start);
        (start, first, count - first)
    }

    #[inline]
    pub(crate) fn slot(&self, index: usize) -> *mut T {
        debug_assert!(index < self.capacity as usize);
        unsafe { self.data.as_ptr().add(index) }
    }
}

impl<T: Quantum, F: Flavor> fmt::Debug for MessageQueue<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("os_id", &self.desc.os_id())
            .field("flavor", &F::KIND)
            .field("quantum_count", &self.capacity)
            .field("write_pos", &self.load_write_pos())
            .field("read_pos", &self.cursor.load())
            .field("event_flag", &self.event_flag)
            .finish()
    }
}
