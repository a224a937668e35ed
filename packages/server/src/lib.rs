// Research Job Runtime - API Core
//
// Runs long multi-phase research jobs and keeps them resumable: durable
// checkpoints in Postgres, live progress and per-job locks in Redis, and a
// small HTTP control surface for pause/resume/progress.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
