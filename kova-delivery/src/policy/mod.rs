//! Policies that shape how sends are retried.

pub mod retry;

pub use retry::RetryPolicy;
