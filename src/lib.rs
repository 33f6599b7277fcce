//! weft: a parallel task orchestration engine.
//!
//! A batch of task records is analyzed into a dependency graph, each task
//! runs in its own git worktree under a supervised worker process, and
//! successful results are merged into an integration branch.

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod report;
pub mod util;
pub mod workspace;

pub use config::Config;
pub use engine::{load_batch, Batch, Orchestrator};
pub use error::{Error, Result};
pub use report::Report;
