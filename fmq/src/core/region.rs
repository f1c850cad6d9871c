use std::fmt;
use std::mem;
use std::ptr::NonNull;

use shared_memory::{Shmem, ShmemConf};

use super::Grantor;
use crate::errors::{FmqError, Result};

/// One named shared memory mapping.
///
/// The creating side owns the OS name and unlinks it on drop; peers that
/// opened it only unmap.
pub(crate) struct Region {
    shmem: Shmem,
}

// The mapping is valid process-wide until drop, and Region only exposes
// read-only accessors. All mutation goes through atomics or the queue's
// single-writer/single-reader discipline.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    pub(crate) fn create(os_id: Option<&str>, size: usize) -> Result<Region> {
        let mut conf = ShmemConf::new().size(size);
        if let Some(id) = os_id {
            conf = conf.os_id(id);
        }
        let shmem = conf.create()?;
        tracing::debug!(os_id = shmem.get_os_id(), size, "created shared region");
        Ok(Region { shmem })
    }

    pub(crate) fn open(os_id: &str) -> Result<Region> {
        let shmem = ShmemConf::new().os_id(os_id).open()?;
        tracing::debug!(os_id, size = shmem.len(), "opened shared region");
        Ok(Region { shmem })
    }

    #[inline]
    pub(crate) fn os_id(&self) -> &str {
        self.shmem.get_os_id()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.shmem.len()
    }

    #[inline]
    pub(crate) fn is_owner(&self) -> bool {
        self.shmem.is_owner()
    }

    /// Typed pointer to the start of `grantor`, checked against the mapping.
    pub(crate) fn at<T>(&self, grantor: &Grantor) -> Result<NonNull<T>> {
        grantor.end().filter(|end| *end <= self.len()).ok_or_else(|| {
            FmqError::InvalidDescriptor(format!("{:?} outside mapping of {} bytes", grantor, self.len()))
        })?;
        let ptr = unsafe { self.shmem.as_ptr().add(grantor.offset) };
        if (ptr as usize) % mem::align_of::<T>() != 0 {
            return Err(FmqError::InvalidDescriptor(format!(
                "{:?} is not aligned for {}",
                grantor,
                std::any::type_name::<T>()
            )));
        }
        NonNull::new(ptr as *mut T).ok_or_else(|| FmqError::InvalidDescriptor("null mapping".into()))
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("os_id", &self.os_id())
            .field("len", &self.len())
            .field("owner", &self.is_owner())
            .finish()
    }
}
