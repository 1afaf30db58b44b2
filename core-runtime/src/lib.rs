//! # Core Runtime
//!
//! Runtime plumbing shared by the authentication core:
//! - [`config`] assembles client settings and host bridges into a validated
//!   [`CoreConfig`](config::CoreConfig)
//! - [`events`] broadcasts acquisition progress to the host
//! - [`logging`] installs the `tracing` subscriber and keeps secrets out of logs

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
