//! Background daemon for issue-mirror.
//!
//! - [`daemon`]: composition root and the poll/cleanup scheduler
//! - [`hooks`]: the optional HTTP trigger endpoint

pub mod daemon;
pub mod hooks;
