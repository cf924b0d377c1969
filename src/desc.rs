//! Buffer Descriptor Module
//!
//! Pure-data description of a texture or linear buffer. Produced by callers
//! and consumed by every other part of the engine.

use bitflags::bitflags;

use crate::format::{round_to_block, PixelFormat};

bitflags! {
    /// CPU access to a resource.
    ///
    /// `WRITE_DYNAMIC` includes `WRITE`; test with `contains` so that a plain
    /// `WRITE` resource is not mistaken for a dynamic one.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CpuAccess: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const WRITE_DYNAMIC = (1 << 2) | Self::WRITE.bits();
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GpuAccess: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags! {
    /// How the GPU pipeline binds a resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BindFlags: u32 {
        const VERTEX_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const SHADER_RESOURCE = 1 << 2;
        const RENDER_TARGET = 1 << 3;
        const DEPTH_STENCIL = 1 << 4;
        const UNORDERED_ACCESS = 1 << 5;
        const CONSTANT_BUFFER = 1 << 6;
        const STREAM_OUTPUT = 1 << 7;
        const STRUCTURED_BUFFER = 1 << 8;
        const DRAW_INDIRECT_ARGS = 1 << 9;
        const RAW_VIEWS = 1 << 10;
        const TRANSFER_SRC = 1 << 11;
        const TRANSFER_DST = 1 << 12;
    }
}

bitflags! {
    /// Allocation category. Empty means the default, volatile category.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocationRules: u32 {
        const STAGING = 1 << 0;
        const NON_VOLATILE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Texture,
    LinearBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimensionality {
    T1D,
    T2D,
    T3D,
    CubeMap,
}

impl Dimensionality {
    pub fn as_str(self) -> &'static str {
        match self {
            Dimensionality::T1D => "T1D",
            Dimensionality::T2D => "T2D",
            Dimensionality::T3D => "T3D",
            Dimensionality::CubeMap => "Cube",
        }
    }
}

/// Texture extents and layout.
///
/// An `array_count` of 0 means "not an array"; iteration treats it as one
/// layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureShape {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_count: u32,
    pub array_count: u32,
    pub pixel_format: PixelFormat,
    pub sample_count: u32,
    pub dimensionality: Dimensionality,
}

impl TextureShape {
    pub fn new_2d(width: u32, height: u32, mip_count: u32, pixel_format: PixelFormat) -> Self {
        Self {
            width,
            height,
            depth: 1,
            mip_count,
            array_count: 0,
            pixel_format,
            sample_count: 1,
            dimensionality: Dimensionality::T2D,
        }
    }

    pub fn with_array_count(mut self, array_count: u32) -> Self {
        self.array_count = array_count;
        self
    }

    /// Number of mip levels visited by per-subresource loops.
    pub fn mip_levels(&self) -> u32 {
        self.mip_count.max(1)
    }

    /// Number of array layers visited by per-subresource loops.
    pub fn array_layers(&self) -> u32 {
        self.array_count.max(1)
    }

    /// Shape of a single mip level. See [`calculate_mip_level_shape`].
    pub fn mip_level_shape(&self, mip: u32) -> TextureShape {
        calculate_mip_level_shape(self, mip)
    }

    /// Bytes across every mip level and array layer.
    pub fn byte_count(&self) -> usize {
        let bits = self.pixel_format.bits_per_pixel() as usize;
        let min_dim = if self.pixel_format.is_block_compressed() {
            4
        } else {
            1
        };
        let layers = self.array_layers() as usize;
        (0..self.mip_levels())
            .map(|mip| {
                let w = (self.width >> mip).max(min_dim) as usize;
                let h = (self.height >> mip).max(min_dim) as usize;
                let d = (self.depth >> mip).max(1) as usize;
                w * h * d * layers * bits / 8
            })
            .sum()
    }
}

/// Shape of mip level `mip` of a texture whose top level is `top`.
///
/// Block-compressed dimensions are rounded up to whole blocks. The returned
/// `mip_count` counts the remaining levels below and including `mip`.
pub fn calculate_mip_level_shape(top: &TextureShape, mip: u32) -> TextureShape {
    debug_assert!(mip < top.mip_levels());
    let mut result = *top;
    result.width = (top.width >> mip).max(1);
    result.height = (top.height >> mip).max(1);
    result.depth = (top.depth >> mip).max(1);
    if top.pixel_format.is_block_compressed() {
        result.width = round_to_block(result.width);
        result.height = round_to_block(result.height);
    }
    result.mip_count = top.mip_levels().saturating_sub(mip);
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinearShape {
    pub size_in_bytes: u32,
    /// Element stride for structured buffers; 0 otherwise.
    pub structure_byte_size: u32,
}

/// Exactly one shape, matching the resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    Texture(TextureShape),
    Linear(LinearShape),
}

/// Description of a texture or linear buffer allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferDescriptor {
    pub cpu_access: CpuAccess,
    pub gpu_access: GpuAccess,
    pub bind_flags: BindFlags,
    pub allocation: AllocationRules,
    pub shape: Shape,
    pub name: String,
}

impl BufferDescriptor {
    /// A GPU-readable shader resource texture.
    pub fn texture(shape: TextureShape) -> Self {
        Self {
            cpu_access: CpuAccess::empty(),
            gpu_access: GpuAccess::READ,
            bind_flags: BindFlags::SHADER_RESOURCE,
            allocation: AllocationRules::empty(),
            shape: Shape::Texture(shape),
            name: String::new(),
        }
    }

    /// A GPU-readable linear buffer of `size_in_bytes`.
    pub fn linear(size_in_bytes: u32, bind_flags: BindFlags) -> Self {
        Self {
            cpu_access: CpuAccess::empty(),
            gpu_access: GpuAccess::READ,
            bind_flags,
            allocation: AllocationRules::empty(),
            shape: Shape::Linear(LinearShape {
                size_in_bytes,
                structure_byte_size: 0,
            }),
            name: String::new(),
        }
    }

    pub fn with_cpu_access(mut self, cpu_access: CpuAccess) -> Self {
        self.cpu_access = cpu_access;
        self
    }

    pub fn with_gpu_access(mut self, gpu_access: GpuAccess) -> Self {
        self.gpu_access = gpu_access;
        self
    }

    pub fn with_allocation(mut self, allocation: AllocationRules) -> Self {
        self.allocation = allocation;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn kind(&self) -> ResourceKind {
        match self.shape {
            Shape::Texture(_) => ResourceKind::Texture,
            Shape::Linear(_) => ResourceKind::LinearBuffer,
        }
    }

    pub fn texture_shape(&self) -> Option<&TextureShape> {
        match &self.shape {
            Shape::Texture(t) => Some(t),
            Shape::Linear(_) => None,
        }
    }

    pub fn linear_shape(&self) -> Option<&LinearShape> {
        match &self.shape {
            Shape::Linear(l) => Some(l),
            Shape::Texture(_) => None,
        }
    }

    /// Mip count used to compute linear subresource indices (1 for buffers).
    pub fn mip_levels(&self) -> u32 {
        self.texture_shape().map_or(1, TextureShape::mip_levels)
    }

    pub fn array_layers(&self) -> u32 {
        self.texture_shape().map_or(1, TextureShape::array_layers)
    }

    pub fn subresource_count(&self) -> u32 {
        self.mip_levels() * self.array_layers()
    }

    pub fn byte_count(&self) -> usize {
        match &self.shape {
            Shape::Texture(t) => t.byte_count(),
            Shape::Linear(l) => l.size_in_bytes as usize,
        }
    }

    /// CPU-visible shadow of this descriptor, used to bridge GPU-only memory.
    pub fn as_staging(&self) -> Self {
        let mut result = self.clone();
        result.cpu_access = CpuAccess::READ | CpuAccess::WRITE;
        result.gpu_access = GpuAccess::empty();
        result.bind_flags = BindFlags::TRANSFER_SRC;
        result.allocation |= AllocationRules::STAGING;
        result
    }

    /// Drop the top `lod_offset` mip levels.
    pub fn with_lod_offset(&self, lod_offset: u32) -> Self {
        let mut result = self.clone();
        if let Shape::Texture(t) = &self.shape {
            result.shape = Shape::Texture(calculate_mip_level_shape(t, lod_offset));
        }
        result
    }

    /// Amount of device memory this allocation occupies (0 for staging or
    /// CPU-only allocations).
    pub fn video_memory_size(&self) -> usize {
        if self.allocation.contains(AllocationRules::STAGING) || self.gpu_access.is_empty() {
            0
        } else {
            self.byte_count()
        }
    }

    /// One-line human readable summary for reports.
    pub fn summary(&self) -> String {
        match &self.shape {
            Shape::Texture(t) => format!(
                "[{}] Tex({:>4}) ({:4}x{:4}) mips:({:2})",
                self.name,
                t.dimensionality.as_str(),
                t.width,
                t.height,
                t.mip_count
            ),
            Shape::Linear(l) => {
                let kb = l.size_in_bytes as f32 / 1024.0;
                if self.bind_flags.contains(BindFlags::VERTEX_BUFFER) {
                    format!("[{}] VB ({:6.1}kb)", self.name, kb)
                } else if self.bind_flags.contains(BindFlags::INDEX_BUFFER) {
                    format!("[{}] IB ({:6.1}kb)", self.name, kb)
                } else {
                    format!("[{}] Buf ({:6.1}kb)", self.name, kb)
                }
            }
        }
    }
}

/// One `(mip, array layer)` slice of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SubresourceId {
    pub mip: u32,
    pub array_layer: u32,
}

impl SubresourceId {
    pub const fn new(mip: u32, array_layer: u32) -> Self {
        Self { mip, array_layer }
    }

    /// Linear subresource index, `mip + array_layer * mip_count`.
    pub const fn index(self, mip_count: u32) -> u32 {
        self.mip + self.array_layer * mip_count
    }

    /// Inverse of [`SubresourceId::index`].
    pub const fn from_index(index: u32, mip_count: u32) -> Self {
        Self {
            mip: index % mip_count,
            array_layer: index / mip_count,
        }
    }
}

/// Every subresource of `desc` in `(array layer, mip)` order.
pub fn subresources(desc: &BufferDescriptor) -> impl Iterator<Item = SubresourceId> {
    let mips = desc.mip_levels();
    let layers = desc.array_layers();
    (0..layers).flat_map(move |layer| (0..mips).map(move |mip| SubresourceId::new(mip, layer)))
}
