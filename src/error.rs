//! Error types shared by the pools, the texture allocator and the codecs.
//!
//! Only environmental failures and configuration limits are reported through
//! [`CoreError`]. Programmer errors (stale handles, zero-element draws, device
//! calls from the wrong thread) are assertions.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// A fixed-size table (texture arrays, cubemap arrays) is full.
    #[error("out of {what} capacity (limit: {limit})")]
    OutOfCapacity { what: &'static str, limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("glTF error: {0}")]
    Gltf(#[from] gltf::Error),

    #[error("invalid environment map {path:?}: {reason}")]
    InvalidEnvironment { path: PathBuf, reason: String },

    #[error("malformed mesh {path:?}: {reason}")]
    MalformedMesh { path: PathBuf, reason: String },

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A decoder panicked on a worker; the message is the panic payload.
    #[error("decoder panicked: {0}")]
    DecodePanic(String),

    /// The native backend refused an operation (object creation, compile, link).
    #[error("device error: {0}")]
    Device(String),
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;
