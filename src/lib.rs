//! GPU Uploads
//!
//! Moves CPU-side data into GPU resources and back. The engine:
//! 1. Pushes texture and buffer contents through the cheapest primitive the
//!    backend offers (update, map, or a staging copy)
//! 2. Maps and reads back GPU resources
//! 3. Compacts fragmented buffers by replaying relocation steps
//! 4. Tracks which logical events the GPU has completed, without blocking
//!
//! Platform access goes through the [`Backend`] trait. [`SoftwareDevice`]
//! is a host-memory implementation; on Windows `d3d11::D3D11Device` drives a
//! real device.

pub mod backend;
pub mod completion;
pub mod config;
pub mod data_source;
pub mod defrag;
pub mod desc;
pub mod error;
pub mod format;
pub mod heap;
pub mod mapped;
pub mod pool;
pub mod readback;
pub mod software;
pub mod tracker;
pub mod upload;

#[cfg(windows)]
pub mod d3d11;

pub use backend::{Backend, Capabilities, CopyBox, MapMode, ResourceLocator, UpdateBox};
pub use completion::{CompletionTracker, EventId};
pub use config::Config;
pub use data_source::{DataSource, DeferredData, ImmediateData, SubresourcePitches};
pub use defrag::DefragStep;
pub use desc::{BufferDescriptor, SubresourceId, TextureShape};
pub use error::{BackendError, Result, UploadError};
pub use format::PixelFormat;
pub use heap::SpanningHeap;
pub use mapped::MappedRegion;
pub use pool::StreamingPool;
pub use readback::ReadbackData;
pub use software::{SoftwareConfig, SoftwareDevice};
pub use tracker::ResourceTracker;
pub use upload::{PartialResource, UploadContext};
