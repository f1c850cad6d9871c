use std::mem;

use serde_derive::{Deserialize, Serialize};

use crate::errors::{FmqError, Result};
use crate::flavor::FlavorKind;

mod region;

pub(crate) use region::Region;

/// Each counter and the event flag word get their own cache line.
pub const CACHE_LINE: usize = 64;

pub const DEFAULT_QUANTUM_COUNT: usize = 1024;

/// Element type that can be copied in and out of shared memory byte for byte.
///
/// # Safety
/// Implementors must be plain data: no pointers, no references, no drop
/// glue, and every bit pattern written by a peer must be a valid value.
pub unsafe trait Quantum: Copy + Send + 'static {}

macro_rules! impl_quantum {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl Quantum for $t {})*
    };
}

impl_quantum!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

unsafe impl<T: Quantum, const N: usize> Quantum for [T; N] {}

/// A sub-range of the shared region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grantor {
    pub offset: usize,
    pub extent: usize,
}

impl Grantor {
    #[inline]
    pub fn end(&self) -> Option<usize> {
        self.offset.checked_add(self.extent)
    }

    fn overlaps(&self, other: &Grantor) -> bool {
        self.offset < other.offset + other.extent && other.offset < self.offset + self.extent
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub quantum_count: usize,
    /// Allocate an event flag word so blocking calls work out of the box.
    pub event_flag: bool,
    /// Fixed OS id for the region. A unique id is generated when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_id: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> QueueConfig {
        QueueConfig {
            quantum_count: DEFAULT_QUANTUM_COUNT,
            event_flag: true,
            os_id: None,
        }
    }
}

impl QueueConfig {
    pub fn new(quantum_count: usize, event_flag: bool) -> QueueConfig {
        QueueConfig {
            quantum_count,
            event_flag,
            os_id: None,
        }
    }
}

/// Placement of every piece of a queue inside its shared region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Layout {
    pub read_counter: Option<Grantor>,
    pub write_counter: Grantor,
    pub write_reserve: Option<Grantor>,
    pub event_flag: Option<Grantor>,
    pub data: Grantor,
    pub size: usize,
}

#[inline]
fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

impl Layout {
    pub(crate) fn plan(
        kind: FlavorKind,
        quantum_size: usize,
        quantum_align: usize,
        quantum_count: usize,
        event_flag: bool,
    ) -> Result<Layout> {
        if quantum_size == 0 {
            return Err(FmqError::Config("zero-sized quanta are not supported".into()));
        }
        if quantum_count == 0 {
            return Err(FmqError::Config("quantum count must be positive".into()));
        }
        let data_extent = quantum_size
            .checked_mul(quantum_count)
            .ok_or_else(|| FmqError::Config(format!("{} quanta of {} bytes overflow usize", quantum_count, quantum_size)))?;

        let mut offset = 0;
        let read_counter = if kind.has_shared_read_counter() {
            let g = Grantor { offset, extent: mem::size_of::<u64>() };
            offset += CACHE_LINE;
            Some(g)
        } else {
            None
        };
        let write_counter = Grantor { offset, extent: mem::size_of::<u64>() };
        offset += CACHE_LINE;
        let write_reserve = if kind.has_write_reservation() {
            let g = Grantor { offset, extent: mem::size_of::<u64>() };
            offset += CACHE_LINE;
            Some(g)
        } else {
            None
        };
        let event_flag = if event_flag {
            let g = Grantor { offset, extent: mem::size_of::<u32>() };
            offset += CACHE_LINE;
            Some(g)
        } else {
            None
        };
        let data_offset = align_up(offset, quantum_align.max(CACHE_LINE))
            .ok_or_else(|| FmqError::Config("region layout overflows usize".into()))?;
        let data = Grantor { offset: data_offset, extent: data_extent };
        let size = data
            .end()
            .ok_or_else(|| FmqError::Config("region layout overflows usize".into()))?;

        Ok(Layout {
            read_counter,
            write_counter,
            write_reserve,
            event_flag,
            data,
            size,
        })
    }

    /// Checks a layout received from a peer against a region of `region_size` bytes.
    pub(crate) fn validate(&self, kind: FlavorKind, region_size: usize, quantum_align: usize) -> Result<()> {
        let invalid = |msg: String| Err(FmqError::InvalidDescriptor(msg));

        if self.read_counter.is_some() != kind.has_shared_read_counter() {
            return invalid(format!("{:?} queue with read counter = {}", kind, self.read_counter.is_some()));
        }
        if self.write_reserve.is_some() != kind.has_write_reservation() {
            return invalid(format!("{:?} queue with write reservation = {}", kind, self.write_reserve.is_some()));
        }
        let mut grantors = vec![("write counter", self.write_counter, mem::size_of::<u64>(), mem::align_of::<u64>())];
        if let Some(g) = self.read_counter {
            grantors.push(("read counter", g, mem::size_of::<u64>(), mem::align_of::<u64>()));
        }
        if let Some(g) = self.write_reserve {
            grantors.push(("write reservation", g, mem::size_of::<u64>(), mem::align_of::<u64>()));
        }
        if let Some(g) = self.event_flag {
            grantors.push(("event flag", g, mem::size_of::<u32>(), mem::align_of::<u32>()));
        }
        grantors.push(("data", self.data, self.data.extent, quantum_align));

        for (name, g, min_extent, align) in &grantors {
            match g.end() {
                Some(end) if end <= region_size => {}
                _ => return invalid(format!("{} {:?} outside region of {} bytes", name, g, region_size)),
            }
            if g.extent < *min_extent {
                return invalid(format!("{} extent {} below {}", name, g.extent, min_extent));
            }
            if g.offset % align != 0 {
                return invalid(format!("{} offset {} not aligned to {}", name, g.offset, align));
            }
        }
        for (i, (a_name, a, _, _)) in grantors.iter().enumerate() {
            for (b_name, b, _, _) in &grantors[i + 1..] {
                if a.overlaps(b) {
                    return invalid(format!("{} overlaps {}", a_name, b_name));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synchronized_layout_places_counters_on_separate_lines() -> Result<()> {
        let layout = Layout::plan(FlavorKind::Synchronized, 2, 2, 1024, true)?;
        assert_eq!(layout.read_counter, Some(Grantor { offset: 0, extent: 8 }));
        assert_eq!(layout.write_counter, Grantor { offset: CACHE_LINE, extent: 8 });
        assert_eq!(layout.write_reserve, None);
        assert_eq!(layout.event_flag, Some(Grantor { offset: 2 * CACHE_LINE, extent: 4 }));
        assert_eq!(layout.data, Grantor { offset: 3 * CACHE_LINE, extent: 2048 });
        assert_eq!(layout.size, 3 * CACHE_LINE + 2048);
        layout.validate(FlavorKind::Synchronized, layout.size, 2)
    }

    #[test]
    fn unsynchronized_layout_swaps_read_counter_for_reservation() -> Result<()> {
        let layout = Layout::plan(FlavorKind::Unsynchronized, 4, 4, 16, false)?;
        assert_eq!(layout.read_counter, None);
        assert_eq!(layout.event_flag, None);
        assert_eq!(layout.write_counter.offset, 0);
        assert_eq!(layout.write_reserve, Some(Grantor { offset: CACHE_LINE, extent: 8 }));
        assert_eq!(layout.data.offset, 2 * CACHE_LINE);
        layout.validate(FlavorKind::Unsynchronized, layout.size, 4)?;
        assert!(layout.validate(FlavorKind::Synchronized, layout.size, 4).is_err());
        Ok(())
    }

    #[test]
    fn plan_rejects_degenerate_sizes() {
        assert!(Layout::plan(FlavorKind::Synchronized, 0, 1, 8, false).is_err());
        assert!(Layout::plan(FlavorKind::Synchronized, 2, 2, 0, false).is_err());
        assert!(Layout::plan(FlavorKind::Synchronized, usize::MAX / 2, 1, 4, false).is_err());
    }

    #[test]
    fn validate_catches_truncated_region_and_overlap() -> Result<()> {
        let layout = Layout::plan(FlavorKind::Synchronized, 8, 8, 4, true)?;
        assert!(layout.validate(FlavorKind::Synchronized, layout.size - 1, 8).is_err());

        let mut overlapping = layout;
        overlapping.data.offset = layout.write_counter.offset;
        assert!(overlapping.validate(FlavorKind::Synchronized, layout.size, 8).is_err());

        let mut misaligned = layout;
        misaligned.write_counter.offset += 1;
        assert!(misaligned.validate(FlavorKind::Synchronized, layout.size, 8).is_err());
        Ok(())
    }
}
