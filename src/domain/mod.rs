//! Core domain types for the beamcheck workflow.
//!
//! This module contains pure domain types with no persistence dependencies:
//! - Actors (the authentication context)
//! - Beam catalog entries
//! - The request aggregate and its transitions

pub mod actor;
pub mod beam;
pub mod request;
