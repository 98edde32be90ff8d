//! Shared test utilities for pipeline, chaos and integration tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - In-memory pipeline fixtures (source, target, SQLite checkpoints)
//! - Polling helpers

#![allow(dead_code)]

pub mod containers;
pub mod pipeline;

pub use containers::*;
pub use pipeline::*;
