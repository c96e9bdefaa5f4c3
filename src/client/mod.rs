//! Remote endpoint access: chat client, retry decorator and rate limiting.

mod chat;
mod rate_limiter;
mod retry;

pub use chat::*;
pub use rate_limiter::*;
pub use retry::*;
