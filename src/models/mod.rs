//! Core data models for curator.
//!
//! Epistemic mapping:
//! - K_i (Knowledge): Concrete types with compile-time guarantees
//! - B_i (Beliefs): Wrapped in Result/Option
//! - I^R (Resolvable): Config parameters
//! - I^B (Bounded): Error variants with a retry classification

mod config;
mod error;
mod message;
mod outcome;

pub use config::*;
pub use error::*;
pub use message::*;
pub use outcome::*;
