//! The immutable handle peers use to attach to an existing queue.

use std::fs;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::core::{Grantor, Layout};
use crate::errors::{FmqError, Result};
use crate::flavor::FlavorKind;

/// Everything a peer needs to map a queue: the OS id of the shared region,
/// where each piece lives inside it, and the queue's shape.
///
/// Descriptors are produced by [`MessageQueue::create`](crate::MessageQueue::create)
/// and transported to other processes by whatever channel the application
/// already has. The TOML helpers cover the common file-based handoff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    os_id: String,
    flavor: FlavorKind,
    quantum_size: usize,
    quantum_count: usize,
    region_size: usize,
    write_counter: Grantor,
    data: Grantor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    read_counter: Option<Grantor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    write_reserve: Option<Grantor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_flag: Option<Grantor>,
}

impl Descriptor {
    pub(crate) fn new(
        os_id: String,
        flavor: FlavorKind,
        quantum_size: usize,
        quantum_count: usize,
        layout: &Layout,
    ) -> Descriptor {
        Descriptor {
            os_id,
            flavor,
            quantum_size,
            quantum_count,
            region_size: layout.size,
            write_counter: layout.write_counter,
            data: layout.data,
            read_counter: layout.read_counter,
            write_reserve: layout.write_reserve,
            event_flag: layout.event_flag,
        }
    }

    pub fn os_id(&self) -> &str {
        &self.os_id
    }

    pub fn flavor(&self) -> FlavorKind {
        self.flavor
    }

    pub fn quantum_size(&self) -> usize {
        self.quantum_size
    }

    pub fn quantum_count(&self) -> usize {
        self.quantum_count
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn has_event_flag(&self) -> bool {
        self.event_flag.is_some()
    }

    pub(crate) fn layout(&self) -> Layout {
        Layout {
            read_counter: self.read_counter,
            write_counter: self.write_counter,
            write_reserve: self.write_reserve,
            event_flag: self.event_flag,
            data: self.data,
            size: self.region_size,
        }
    }

    /// Structural checks that do not need the mapping.
    pub fn validate(&self, quantum_align: usize) -> Result<()> {
        if self.os_id.is_empty() {
            return Err(FmqError::InvalidDescriptor("empty os_id".into()));
        }
        if self.quantum_size == 0 || self.quantum_count == 0 {
            return Err(FmqError::InvalidDescriptor(format!(
                "degenerate shape {} x {}",
                self.quantum_count, self.quantum_size
            )));
        }
        match self.quantum_size.checked_mul(self.quantum_count) {
            Some(extent) if extent == self.data.extent => {}
            _ => {
                return Err(FmqError::InvalidDescriptor(format!(
                    "data extent {} does not hold {} quanta of {} bytes",
                    self.data.extent, self.quantum_count, self.quantum_size
                )))
            }
        }
        self.layout().validate(self.flavor, self.region_size, quantum_align)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    pub fn from_toml(s: &str) -> Result<Descriptor> {
        Ok(toml::from_str(s)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Descriptor> {
        Descriptor::from_toml(&fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(flavor: FlavorKind) -> Descriptor {
        let layout = Layout::plan(flavor, 2, 2, 1024, true).unwrap();
        Descriptor::new("/fmq_test".into(), flavor, 2, 1024, &layout)
    }

    #[test]
    fn survives_a_trip_through_a_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("queue.toml");
        let desc = sample(FlavorKind::Synchronized);
        desc.save(&path)?;
        let loaded = Descriptor::load(&path)?;
        assert_eq!(loaded, desc);
        loaded.validate(2)
    }

    #[test]
    fn unsynchronized_descriptor_omits_read_counter() -> Result<()> {
        let text = sample(FlavorKind::Unsynchronized).to_toml()?;
        assert!(!text.contains("read_counter"));
        assert!(text.contains("write_reserve"));
        assert!(!sample(FlavorKind::Synchronized).to_toml()?.contains("write_reserve"));
        assert!(text.contains("flavor = \"unsynchronized\""));
        Ok(())
    }

    #[test]
    fn rejects_inconsistent_shape() {
        let mut desc = sample(FlavorKind::Synchronized);
        desc.quantum_count = 2048;
        assert!(matches!(desc.validate(2), Err(FmqError::InvalidDescriptor(_))));

        let mut desc = sample(FlavorKind::Synchronized);
        desc.read_counter = None;
        assert!(matches!(desc.validate(2), Err(FmqError::InvalidDescriptor(_))));

        let mut desc = sample(FlavorKind::Unsynchronized);
        desc.write_reserve = None;
        assert!(matches!(desc.validate(2), Err(FmqError::InvalidDescriptor(_))));

        let mut desc = sample(FlavorKind::Synchronized);
        desc.region_size = 16;
        assert!(matches!(desc.validate(2), Err(FmqError::InvalidDescriptor(_))));
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(matches!(
            Descriptor::from_toml("os_id = 3"),
            Err(FmqError::Decode(_))
        ));
    }
}
