//! Storage layer
//!
//! Moves whole documents between memory and their backing files.
//!
//! - `persistence`: atomic read/write/destroy of one document file
//! - `error`: the error type shared by the whole crate

pub mod error;
pub mod persistence;

pub use error::{Error, Result};
pub use persistence::Storage;
