//! Shared types for the courier runtime.
//!
//! Everything that crosses a crate boundary lives here: the error type,
//! configuration schema, inbound/outbound messages, the LLM message and
//! tool-call model, the bus event family, and the log sanitizer.

pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod sanitize;
pub mod stream;
pub mod tool;

pub use error::{Error, Result};
