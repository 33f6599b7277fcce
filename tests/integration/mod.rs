//! Integration test suite for weft.
//!
//! These tests run whole batches through the `Orchestrator` against
//! temporary git repositories.
//!
//! # Test Categories
//!
//! - `scheduling`: ordering, concurrency bounds and file-conflict serialization
//! - `failure_handling`: retries, isolation, cycle rejection, escalation
//! - `recovery`: batches started over state left by an earlier run
//! - `processes`: the process-backed executor end to end (unix only)
//!
//! Everything except `processes` uses an in-process scripted executor.

mod fixtures;

mod failure_handling;
#[cfg(unix)]
mod processes;
mod recovery;
