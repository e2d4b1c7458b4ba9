//! Test utilities shared by the unit tests.
//!
//! This module provides:
//! - Test data factories for creating valid test fixtures
//! - Builders wiring the use cases onto the in-memory stores with a manual clock

mod factories;
mod harness;

pub use factories::*;
pub use harness::*;
