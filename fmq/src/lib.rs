mod core;
mod descriptor;
mod errors;
mod event_flag;
mod flavor;
mod queue;
pub mod reader;
pub mod writer;

#[cfg(test)]
mod tests;

pub use crate::core::{Grantor, Quantum, QueueConfig, CACHE_LINE, DEFAULT_QUANTUM_COUNT};
pub use crate::descriptor::Descriptor;
pub use crate::errors::{FmqError, Result};
pub use crate::event_flag::{EventFlag, SharedEventFlag, NOT_EMPTY, NOT_FULL};
pub use crate::flavor::{Flavor, FlavorKind, Synchronized, Unsynchronized};
pub use crate::queue::{MessageQueue, SyncQueue, UnsyncQueue};
pub use crate::reader::ReadTransaction;
pub use crate::writer::WriteTransaction;
