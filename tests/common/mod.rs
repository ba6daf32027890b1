//! Shared test utilities for the integration suite.
//!
//! This module provides:
//! - Journal seeding helpers
//! - An end-to-end harness (journal -> producer -> in-process transport)
//! - A call-recording handler for assertions

pub mod harness;

pub use harness::*;
