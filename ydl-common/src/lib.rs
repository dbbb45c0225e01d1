//! # YDL Common Library
//!
//! Shared code for the ydl services including:
//! - Error type and result alias
//! - Configuration loading and root folder resolution
//! - Download lifecycle events and the in-process event bus
//! - Time helpers

pub mod config;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
