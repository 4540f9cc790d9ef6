//! In-process implementation of the core primitives.

mod core_log;
mod registry;

pub use self::core_log::MemoryCore;
pub use self::registry::{MemoryCoreRegistry, ReplicationLink};
