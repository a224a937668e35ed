// Common types and utilities shared across the application

pub mod clock;
pub mod entity_ids;
pub mod id;

pub use clock::{to_chrono, Clock, ManualClock, SystemClock};
pub use entity_ids::*;
pub use id::Id;
