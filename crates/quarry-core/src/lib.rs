//! Core types for Quarry database drivers.
//!
//! This crate provides the driver-agnostic foundation shared by the
//! protocol crates:
//!
//! - `Value` for dynamically-typed bound parameters
//! - `Error` and the `Result` alias for all driver operations

pub mod error;
pub mod value;

pub use error::{
    ConnectionError, ConnectionErrorKind, EncodingError, Error, ProtocolError, Result, ServerError,
};
pub use value::Value;
