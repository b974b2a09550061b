//! Integration test suite for kiln.
//!
//! These tests drive the orchestrator and the work-stealing queue through
//! whole builds with a scripted in-process generator, so no external
//! commands are run.
//!
//! # Test Categories
//!
//! - `scheduling`: dependency ordering, parallelism and stealing
//! - `failures`: retries, exhaustion, cascades and timeouts
//! - `validation`: cycles and dangling references, up front and mid-build
//! - `control`: pause, resume, cancel, events and file claims

mod fixtures;

mod control;
mod failures;
mod scheduling;
mod validation;
