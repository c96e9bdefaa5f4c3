//! Pool module - rate-limited concurrent dispatch.

mod dispatcher;

pub use dispatcher::*;
