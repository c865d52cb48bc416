//! Testing utilities and mock implementations
//!
//! Mocks for exercising agents and pipelines without a reasoning provider.

pub mod mocks;

pub use mocks::*;
