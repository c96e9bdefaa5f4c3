//! Pipeline module - file-level curation and dispatch drivers.

mod curate;
mod dispatch;

pub use curate::*;
pub use dispatch::*;
