//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff and jitter
//! - [`retry_transient`] - Retry loop around store calls that may fail
//!   transiently

mod retry;

pub use retry::{retry_transient, RetryPolicy};
