//! Storage primitives shared by the buffer tiers: record and segment
//! formats, memory-mapped segment files, cursor checkpoints, and
//! filesystem probes.

pub mod clock;
pub mod disk;
pub mod error;
pub mod header;
pub mod mmap;
pub mod segment;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use segment::Position;
