//! Shared domain for issue-mirror: configuration, credentials, the source and
//! target issue representations, and the issue file format.

pub mod config;
pub mod convert;
pub mod credentials;
pub mod markdown;
pub mod types;
