//! Reliability patterns for outbound queue calls

mod retry;

pub use retry::RetryPolicy;
