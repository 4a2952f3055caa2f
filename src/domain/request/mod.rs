//! Request aggregate - domain model and state transitions.
//!
//! This module contains the core domain logic for requests:
//! - Request, line item and result types
//! - State transition guards and mutations

pub mod state;
pub mod transitions;

// Re-export commonly used types
pub use state::*;
pub use transitions::{ItemUpdate, MAX_QUANTITY, ResultWrite, SkipReason};
