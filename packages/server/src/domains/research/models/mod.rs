pub mod checkpoint;
pub mod job;
pub mod phase;

pub use checkpoint::*;
pub use job::*;
pub use phase::*;
