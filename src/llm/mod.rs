//! Reasoning provider layer
//!
//! Provider-agnostic completion interface plus concrete provider clients.

pub mod provider;
pub mod providers;

pub use provider::*;
pub use providers::*;
