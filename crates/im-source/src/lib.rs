//! Authenticated, throttled, paginated access to the remote issue tracker.
//!
//! - [`rate_limiter`]: async token bucket every outbound call passes through
//! - [`error`]: the source failure taxonomy and its classification
//! - [`retry`]: bounded backoff for transient failures
//! - [`client`]: the [`client::SourceClient`] seam and its HTTP implementation

pub mod client;
pub mod error;
pub mod rate_limiter;
pub mod retry;

pub use client::{HttpSourceClient, SourceClient};
pub use error::{Result, SourceError};
