//! Error Module
//!
//! Error taxonomy for the upload engine and the platform backends.

use thiserror::Error;

/// Failures reported by a platform backend.
///
/// These map onto HRESULT-style return codes from the underlying API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("operation not supported by this backend")]
    Unsupported,

    #[error("device out of memory")]
    OutOfMemory,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("subresource {0} is already mapped")]
    AlreadyMapped(u32),

    #[error("device lost")]
    DeviceLost,

    #[error("platform call failed: {0}")]
    Platform(String),
}

/// Errors surfaced by the upload context and its helpers.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Deferred content has not finished loading; retry on a later frame.
    #[error("data source is not ready")]
    SourceNotReady,

    #[error("failed to map subresource {subresource}: {source}")]
    MapFailed {
        subresource: u32,
        #[source]
        source: BackendError,
    },

    /// The active backend does not advertise the capability this call needs.
    #[error("{operation} is not supported by the active backend")]
    Unsupported { operation: &'static str },

    #[error("failed to create resource '{name}': {source}")]
    ResourceCreation {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("write of {len} bytes at offset {offset} exceeds capacity {capacity}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("partial-plane texture updates must cover every lod level")]
    PartialPlaneNeedsAllLods,
}

pub type Result<T, E = UploadError> = std::result::Result<T, E>;
