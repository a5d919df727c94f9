//! Common primitives for the cluster lifecycle: bounded retries, deadline
//! polling, and the environment overlay handed to the provisioning tool.

#![deny(missing_docs)]

pub mod env;
pub mod poll;
pub mod retry;

pub use env::{with_verbose_logging, EnvOverlay, VERBOSE_LOG_LEVEL, VERBOSE_LOG_VAR};
pub use poll::{poll_until, PollError, PollPolicy, PollResult};
pub use retry::{run_with_retry, RetryError, RetryPolicy};
