//! Curation module - validation, token estimation and budgeted selection.

mod curator;
mod estimator;
mod report;
pub mod validator;

pub use curator::*;
pub use estimator::*;
pub use report::*;
pub use validator::{parse_conversation, validate, validate_prompt, validate_raw};
