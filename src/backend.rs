//! Backend Module
//!
//! The platform surface the upload engine drives. A backend owns a device
//! context (immediate or deferred) and exposes resource creation, update,
//! map, copy and fence primitives. Behavioural differences between
//! platforms are described by [`Capabilities`], captured once per context.

use std::ptr::NonNull;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::data_source::{DataSource, SubresourcePitches};
use crate::desc::BufferDescriptor;
use crate::error::BackendError;

/// Behaviour switches for one backend/driver combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    /// Resources can be created with initial content.
    pub supports_resource_initialisation: bool,
    /// Textures must be written through a staging copy.
    pub requires_staging_texture_upload: bool,
    /// `map_partial` is available.
    pub can_do_partial_maps: bool,
    /// Partial-box updates on this context need the source pointer rebased.
    pub use_update_subresource_workaround: bool,
    /// Defrag through CPU maps instead of region copies.
    pub use_map_based_defrag: bool,
    /// GPU-resident memory can be mapped for reading without staging.
    pub can_read_gpu_memory_directly: bool,
    /// `NoOverwrite` maps are allowed off the immediate context.
    pub can_do_no_overwrite_map_in_background: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            supports_resource_initialisation: true,
            requires_staging_texture_upload: false,
            can_do_partial_maps: false,
            use_update_subresource_workaround: false,
            use_map_based_defrag: false,
            can_read_gpu_memory_directly: false,
            can_do_no_overwrite_map_in_background: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapMode {
    Read,
    Write,
    /// Invalidate previous contents.
    Discard,
    /// Caller promises not to touch memory the GPU is still reading.
    NoOverwrite,
}

impl MapMode {
    pub fn is_write(self) -> bool {
        !matches!(self, MapMode::Read)
    }
}

/// A region of a subresource, in the units the platform expects.
///
/// Texture boxes are in pixels, buffer boxes are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CopyBox {
    pub left: u32,
    pub top: u32,
    pub front: u32,
    pub right: u32,
    pub bottom: u32,
    pub back: u32,
}

impl CopyBox {
    /// A byte range of a linear buffer.
    pub const fn bytes(start: u32, end: u32) -> Self {
        Self {
            left: start,
            top: 0,
            front: 0,
            right: end,
            bottom: 1,
            back: 1,
        }
    }

    pub const fn width(&self) -> u32 {
        self.right - self.left
    }

    pub const fn height(&self) -> u32 {
        self.bottom - self.top
    }
}

/// A 2D pixel region of a texture. The all-zero default means the full
/// extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UpdateBox {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl UpdateBox {
    pub const fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn is_full(&self) -> bool {
        *self == Self::default()
    }

    /// Whether this box covers a whole `width` x `height` plane.
    pub fn covers(&self, width: u32, height: u32) -> bool {
        self.is_full()
            || (self.left == 0 && self.top == 0 && self.right == width && self.bottom == height)
    }

    pub const fn to_copy_box(self) -> CopyBox {
        CopyBox {
            left: self.left,
            top: self.top,
            front: 0,
            right: self.right,
            bottom: self.bottom,
            back: 1,
        }
    }
}

/// Raw result of a successful map.
#[derive(Debug, Clone, Copy)]
pub struct RawMapping {
    pub ptr: NonNull<u8>,
    pub len: usize,
    pub pitches: SubresourcePitches,
}

/// A logical range inside a possibly shared allocation.
#[derive(Debug)]
pub struct ResourceLocator<R> {
    pub resource: Arc<R>,
    pub offset: usize,
    /// `None` means the range extends to the end of the allocation.
    pub size: Option<usize>,
}

impl<R> ResourceLocator<R> {
    pub fn whole(resource: Arc<R>) -> Self {
        Self {
            resource,
            offset: 0,
            size: None,
        }
    }

    pub fn range(resource: Arc<R>, offset: usize, size: usize) -> Self {
        Self {
            resource,
            offset,
            size: Some(size),
        }
    }

    pub fn is_whole_resource(&self) -> bool {
        self.offset == 0 && self.size.is_none()
    }
}

impl<R> Clone for ResourceLocator<R> {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource.clone(),
            offset: self.offset,
            size: self.size,
        }
    }
}

/// Device context operations consumed by the upload engine.
///
/// Subresource arguments are linear indices (`mip + layer * mip_count`).
pub trait Backend {
    type Resource: Send + Sync + 'static;
    type Fence: Send + 'static;

    fn capabilities(&self) -> Capabilities;

    /// Whether this is the immediate (serializing) context.
    fn is_immediate(&self) -> bool;

    fn create_resource(
        &self,
        desc: &BufferDescriptor,
        init: Option<&dyn DataSource>,
    ) -> Result<Arc<Self::Resource>, BackendError>;

    fn describe(&self, resource: &Self::Resource) -> BufferDescriptor;

    fn set_debug_name(&self, resource: &Self::Resource, name: &str);

    fn debug_name(&self, resource: &Self::Resource) -> String;

    /// Write a subresource (or a box of it) from CPU memory.
    ///
    /// # Safety
    ///
    /// `src` is passed through as the platform receives it. The caller must
    /// ensure that the bytes the platform reads, relative to `src` and the
    /// pitches, lie inside one live allocation. When the context needs the
    /// update workaround `src` may point before that allocation, offset by
    /// exactly the box origin.
    unsafe fn update_subresource(
        &self,
        resource: &Self::Resource,
        sub: u32,
        dst_box: Option<&CopyBox>,
        src: *const u8,
        row_pitch: u32,
        slice_pitch: u32,
    );

    fn map(
        &self,
        resource: &Self::Resource,
        sub: u32,
        mode: MapMode,
    ) -> Result<RawMapping, BackendError>;

    /// Map `size` bytes starting at `offset`. Only valid when
    /// [`Capabilities::can_do_partial_maps`] is set.
    fn map_partial(
        &self,
        _resource: &Self::Resource,
        _sub: u32,
        _mode: MapMode,
        _offset: usize,
        _size: usize,
    ) -> Result<RawMapping, BackendError> {
        Err(BackendError::Unsupported)
    }

    fn unmap(&self, resource: &Self::Resource, sub: u32);

    fn copy_resource(&self, dst: &Self::Resource, src: &Self::Resource);

    /// Copy `src_box` of a source subresource (or all of it) to `dst_origin`
    /// (x, y, z) in a destination subresource.
    fn copy_subresource_region(
        &self,
        dst: &Self::Resource,
        dst_sub: u32,
        dst_origin: [u32; 3],
        src: &Self::Resource,
        src_sub: u32,
        src_box: Option<&CopyBox>,
    );

    /// Create a GPU event fence. `None` when the platform refused.
    fn create_fence(&self) -> Option<Self::Fence>;

    /// Insert `fence` at the current position of the command stream.
    fn end_fence(&self, fence: &Self::Fence);

    fn is_fence_signaled(&self, fence: &Self::Fence) -> bool;
}
