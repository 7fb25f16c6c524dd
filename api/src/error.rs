//! Error type shared by the building blocks in this crate.
//!
//! The store crate defines one error enum per storage layer and embeds this
//! type at the bottom of each chain with a `#[from]` variant, so `?` carries
//! failures upward without manual mapping.

use std::io;
use thiserror::Error;

/// Errors produced by the device controller, buffers, blocks and codecs.
#[derive(Error, Debug)]
pub enum APIError {
    /// Error caused when performing IO on the device
    #[error("io failure in the controller layer")]
    Io(#[from] io::Error),
    /// Invalid input to the controller layer
    #[error("invalid controller input: {0}")]
    ControllerInput(&'static str),
    /// An out-of-bounds access on a buffer or block
    #[error("invalid buffer access: {0}")]
    BufferInput(&'static str),
    /// Invalid block parameters or use of a released block
    #[error("invalid block input: {0}")]
    BlockInput(&'static str),
    /// A key or value could not be encoded or decoded
    #[error("codec failure: {0}")]
    Codec(&'static str),
    /// Catch-all for errors that do not fit the variants above
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Generic alias for a `Result` with the error type `APIError`.
pub type Result<T> = std::result::Result<T, APIError>;
