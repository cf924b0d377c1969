//! Software Device Module
//!
//! A headless backend that keeps every subresource in host memory and
//! emulates the GPU timeline with a retire counter. It reproduces the driver
//! behaviours the upload engine has to cope with: deferred contexts without
//! driver command lists, missing partial maps, unreliable region copies,
//! exclusive mapping and late fences.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{Backend, Capabilities, CopyBox, MapMode, RawMapping};
use crate::data_source::{DataSource, SubresourcePitches};
use crate::desc::{BufferDescriptor, CpuAccess, Shape, SubresourceId};
use crate::error::BackendError;
use crate::format::PixelFormat;

/// Emulated driver/context behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareConfig {
    /// Act as the immediate context. A deferred context records work that
    /// is replayed in order, which here means executed straight away.
    pub immediate: bool,
    /// Without driver command lists a deferred context applies the box
    /// origin to the source pointer of partial updates a second time.
    pub driver_command_lists: bool,
    pub partial_maps: bool,
    /// When false the defragmenter is told to use maps instead.
    pub region_copy_reliable: bool,
    /// Unified memory: every resource may be mapped regardless of its CPU
    /// access flags.
    pub direct_gpu_read: bool,
    pub staging_texture_upload: bool,
    /// Row pitch alignment of texture subresources, in bytes.
    pub row_pitch_alignment: u32,
    /// Video memory budget in bytes. Staging allocations do not count.
    pub memory_budget: Option<usize>,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        Self {
            immediate: true,
            driver_command_lists: true,
            partial_maps: false,
            region_copy_reliable: true,
            direct_gpu_read: false,
            staging_texture_upload: false,
            row_pitch_alignment: 1,
            memory_budget: None,
        }
    }
}

/// Snapshot of the device's operation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceCounters {
    pub maps: usize,
    pub unmaps: usize,
    pub updates: usize,
    pub resource_copies: usize,
    pub region_copies: usize,
    pub resources_created: usize,
}

#[derive(Default)]
struct Counters {
    maps: AtomicUsize,
    unmaps: AtomicUsize,
    updates: AtomicUsize,
    resource_copies: AtomicUsize,
    region_copies: AtomicUsize,
    resources_created: AtomicUsize,
}

/// Geometry of one stored subresource.
#[derive(Debug, Clone, Copy)]
struct Layout {
    /// Extent in pixels (bytes for buffers).
    width: u32,
    height: u32,
    depth: u32,
    row_bytes: usize,
    rows: usize,
    row_pitch: usize,
    slice_pitch: usize,
}

impl Layout {
    fn size(&self) -> usize {
        self.slice_pitch * self.depth as usize
    }
}

struct Subresource {
    bytes: Mutex<Vec<u8>>,
    layout: Layout,
    mapped: AtomicBool,
}

/// A resource living in host memory.
pub struct SoftwareResource {
    id: u64,
    desc: BufferDescriptor,
    name: Mutex<String>,
    format: Option<PixelFormat>,
    subresources: Vec<Subresource>,
    video_memory: usize,
    in_use: Arc<AtomicUsize>,
}

impl SoftwareResource {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn subresource(&self, sub: u32) -> Option<&Subresource> {
        self.subresources.get(sub as usize)
    }
}

impl Drop for SoftwareResource {
    fn drop(&mut self) {
        self.in_use.fetch_sub(self.video_memory, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for SoftwareResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareResource")
            .field("id", &self.id)
            .field("desc", &self.desc.summary())
            .finish()
    }
}

/// Position on the emulated GPU timeline; 0 until the fence is ended.
#[derive(Debug, Default)]
pub struct SoftwareFence {
    position: AtomicU64,
}

/// Host-memory device context.
pub struct SoftwareDevice {
    config: SoftwareConfig,
    next_id: AtomicU64,
    in_use: Arc<AtomicUsize>,
    submitted: AtomicU64,
    retired: AtomicU64,
    fail_fence_creation: AtomicBool,
    failing_maps: AtomicUsize,
    counters: Counters,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn align_up(value: usize, alignment: usize) -> usize {
    let alignment = alignment.max(1);
    (value + alignment - 1) / alignment * alignment
}

/// Convert a pixel box to element (block) coordinates.
fn element_box(format: PixelFormat, b: &CopyBox) -> CopyBox {
    if format.is_block_compressed() {
        CopyBox {
            left: b.left / 4,
            top: b.top / 4,
            front: b.front,
            right: b.right.div_ceil(4),
            bottom: b.bottom.div_ceil(4),
            back: b.back,
        }
    } else {
        *b
    }
}

impl SoftwareDevice {
    pub fn new(config: SoftwareConfig) -> Self {
        debug!("Creating software device: {:?}", config);
        Self {
            config,
            next_id: AtomicU64::new(1),
            in_use: Arc::new(AtomicUsize::new(0)),
            submitted: AtomicU64::new(0),
            retired: AtomicU64::new(0),
            fail_fence_creation: AtomicBool::new(false),
            failing_maps: AtomicUsize::new(0),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &SoftwareConfig {
        &self.config
    }

    /// Let the emulated GPU catch up with everything submitted so far.
    pub fn retire_all(&self) {
        let submitted = self.submitted.load(Ordering::Acquire);
        self.retired.fetch_max(submitted, Ordering::AcqRel);
    }

    /// Number of ended fences the GPU has not reached yet.
    pub fn pending_fences(&self) -> u64 {
        self.submitted.load(Ordering::Acquire) - self.retired.load(Ordering::Acquire)
    }

    pub fn set_fail_fence_creation(&self, fail: bool) {
        self.fail_fence_creation.store(fail, Ordering::Release);
    }

    /// Refuse the next `count` map requests.
    pub fn fail_next_maps(&self, count: usize) {
        self.failing_maps.store(count, Ordering::Release);
    }

    pub fn video_memory_in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> DeviceCounters {
        let c = &self.counters;
        DeviceCounters {
            maps: c.maps.load(Ordering::Relaxed),
            unmaps: c.unmaps.load(Ordering::Relaxed),
            updates: c.updates.load(Ordering::Relaxed),
            resource_copies: c.resource_copies.load(Ordering::Relaxed),
            region_copies: c.region_copies.load(Ordering::Relaxed),
            resources_created: c.resources_created.load(Ordering::Relaxed),
        }
    }

    /// Copy of the stored bytes of one subresource, including pitch padding.
    pub fn contents(&self, resource: &SoftwareResource, sub: u32) -> Vec<u8> {
        resource
            .subresource(sub)
            .map(|s| lock(&s.bytes).clone())
            .unwrap_or_default()
    }

    /// Stored pitches of one subresource.
    pub fn pitches(&self, resource: &SoftwareResource, sub: u32) -> SubresourcePitches {
        resource
            .subresource(sub)
            .map(|s| {
                SubresourcePitches::new(s.layout.row_pitch as u32, s.layout.slice_pitch as u32)
            })
            .unwrap_or_default()
    }

    fn has_partial_update_defect(&self) -> bool {
        !self.config.immediate && !self.config.driver_command_lists
    }

    fn layouts(&self, desc: &BufferDescriptor) -> Vec<Layout> {
        match &desc.shape {
            Shape::Linear(l) => {
                let size = l.size_in_bytes as usize;
                vec![Layout {
                    width: l.size_in_bytes,
                    height: 1,
                    depth: 1,
                    row_bytes: size,
                    rows: 1,
                    row_pitch: size,
                    slice_pitch: size,
                }]
            }
            Shape::Texture(t) => {
                let alignment = self.config.row_pitch_alignment as usize;
                let mut result = Vec::with_capacity(desc.subresource_count() as usize);
                for _ in 0..t.array_layers() {
                    for mip in 0..t.mip_levels() {
                        let level = t.mip_level_shape(mip);
                        let row_bytes = t.pixel_format.row_bytes(level.width) as usize;
                        let rows = t.pixel_format.row_count(level.height) as usize;
                        let row_pitch = align_up(row_bytes, alignment);
                        result.push(Layout {
                            width: level.width,
                            height: level.height,
                            depth: level.depth,
                            row_bytes,
                            rows,
                            row_pitch,
                            slice_pitch: row_pitch * rows,
                        });
                    }
                }
                result
            }
        }
    }

    fn reserve_video_memory(&self, bytes: usize) -> Result<(), BackendError> {
        let budget = self.config.memory_budget;
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(bytes)?;
                match budget {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            })
            .map(|_| ())
            .map_err(|_| BackendError::OutOfMemory)
    }

    fn check_map_access(&self, desc: &BufferDescriptor, mode: MapMode) -> Result<(), BackendError> {
        let background = !self.config.immediate && !self.config.driver_command_lists;
        if mode == MapMode::NoOverwrite && background {
            return Err(BackendError::InvalidArgument(format!(
                "NoOverwrite map of '{}' off the immediate context",
                desc.name
            )));
        }
        if self.config.direct_gpu_read {
            return Ok(());
        }
        let needed = if mode.is_write() {
            CpuAccess::WRITE
        } else {
            CpuAccess::READ
        };
        if desc.cpu_access.contains(needed) {
            Ok(())
        } else {
            Err(BackendError::InvalidArgument(format!(
                "{:?} map of '{}' without CPU access",
                mode, desc.name
            )))
        }
    }

    fn map_range(
        &self,
        resource: &SoftwareResource,
        sub: u32,
        mode: MapMode,
        range: Option<(usize, usize)>,
    ) -> Result<RawMapping, BackendError> {
        if self
            .failing_maps
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(BackendError::Platform("map refused".to_string()));
        }
        self.check_map_access(&resource.desc, mode)?;

        let subresource = resource
            .subresource(sub)
            .ok_or_else(|| BackendError::InvalidArgument(format!("subresource {}", sub)))?;
        let size = subresource.layout.size();
        let (offset, len) = range.unwrap_or((0, size));
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(BackendError::InvalidArgument(format!(
                "range {}+{} outside subresource of {} bytes",
                offset, len, size
            )));
        }
        if subresource.mapped.swap(true, Ordering::AcqRel) {
            return Err(BackendError::AlreadyMapped(sub));
        }

        let mut bytes = lock(&subresource.bytes);
        // SAFETY: `offset + len <= bytes.len()` was checked above.
        let ptr = unsafe { bytes.as_mut_ptr().add(offset) };
        drop(bytes);

        self.counters.maps.fetch_add(1, Ordering::Relaxed);
        let ptr = NonNull::new(ptr).ok_or_else(|| BackendError::Platform("null mapping".into()))?;
        Ok(RawMapping {
            ptr,
            len,
            pitches: SubresourcePitches::new(
                subresource.layout.row_pitch as u32,
                subresource.layout.slice_pitch as u32,
            ),
        })
    }

    /// Copy rows of a texture box (or a byte range of a buffer) from `src`
    /// into stored bytes. `src` points at the first element of the box.
    ///
    /// # Safety
    ///
    /// Every row read from `src` must be readable.
    unsafe fn write_region(
        format: Option<PixelFormat>,
        dst: &mut [u8],
        layout: &Layout,
        region: &CopyBox,
        src: *const u8,
        row_pitch: usize,
        slice_pitch: usize,
    ) {
        let Some(format) = format else {
            let len = region.width() as usize;
            let start = region.left as usize;
            std::ptr::copy_nonoverlapping(src, dst[start..start + len].as_mut_ptr(), len);
            return;
        };

        let bpe = format.bytes_per_element() as usize;
        let elements = element_box(format, region);
        let row_len = (elements.width() as usize) * bpe;
        for (z_index, z) in (elements.front..elements.back).enumerate() {
            for (y_index, y) in (elements.top..elements.bottom).enumerate() {
                let src_row = src.add(z_index * slice_pitch + y_index * row_pitch);
                let offset = z as usize * layout.slice_pitch
                    + y as usize * layout.row_pitch
                    + elements.left as usize * bpe;
                std::ptr::copy_nonoverlapping(src_row, dst[offset..offset + row_len].as_mut_ptr(), row_len);
            }
        }
    }

    fn region_fits(format: Option<PixelFormat>, layout: &Layout, region: &CopyBox) -> bool {
        if region.right < region.left || region.bottom < region.top || region.back < region.front {
            return false;
        }
        match format {
            None => region.right as usize <= layout.row_bytes,
            Some(format) => {
                let e = element_box(format, region);
                let width_elements = layout.row_bytes / format.bytes_per_element().max(1) as usize;
                e.right as usize <= width_elements
                    && e.bottom as usize <= layout.rows
                    && region.back <= layout.depth
            }
        }
    }

    fn full_box(layout: &Layout) -> CopyBox {
        CopyBox {
            left: 0,
            top: 0,
            front: 0,
            right: layout.width,
            bottom: layout.height,
            back: layout.depth,
        }
    }
}

impl Backend for SoftwareDevice {
    type Resource = SoftwareResource;
    type Fence = SoftwareFence;

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_resource_initialisation: true,
            requires_staging_texture_upload: self.config.staging_texture_upload,
            can_do_partial_maps: self.config.partial_maps,
            use_update_subresource_workaround: self.has_partial_update_defect(),
            use_map_based_defrag: !self.config.region_copy_reliable,
            can_read_gpu_memory_directly: self.config.direct_gpu_read,
            can_do_no_overwrite_map_in_background: self.config.driver_command_lists,
        }
    }

    fn is_immediate(&self) -> bool {
        self.config.immediate
    }

    fn create_resource(
        &self,
        desc: &BufferDescriptor,
        init: Option<&dyn DataSource>,
    ) -> Result<Arc<SoftwareResource>, BackendError> {
        if let Shape::Texture(t) = &desc.shape {
            if t.pixel_format == PixelFormat::Unknown || t.width == 0 || t.height == 0 {
                return Err(BackendError::InvalidArgument(format!(
                    "texture '{}' has no extent or format",
                    desc.name
                )));
            }
        }

        let video_memory = desc.video_memory_size();
        self.reserve_video_memory(video_memory)?;

        let format = desc.texture_shape().map(|t| t.pixel_format);
        let mip_count = desc.mip_levels();
        let subresources = self
            .layouts(desc)
            .into_iter()
            .enumerate()
            .map(|(index, layout)| {
                let mut bytes = vec![0u8; layout.size()];
                if let Some(init) = init {
                    let data = init.subresource(SubresourceId::from_index(index as u32, mip_count));
                    let region = Self::full_box(&layout);
                    let needed = (layout.rows.saturating_sub(1)) * data.pitches.row_pitch as usize
                        + layout.row_bytes;
                    if !data.is_empty() && data.data.len() >= needed {
                        // SAFETY: the source covers every row of the full box.
                        unsafe {
                            Self::write_region(
                                format,
                                &mut bytes,
                                &layout,
                                &region,
                                data.data.as_ptr(),
                                data.pitches.row_pitch as usize,
                                data.pitches.slice_pitch as usize,
                            );
                        }
                    }
                }
                Subresource {
                    bytes: Mutex::new(bytes),
                    layout,
                    mapped: AtomicBool::new(false),
                }
            })
            .collect();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.counters.resources_created.fetch_add(1, Ordering::Relaxed);
        debug!("Created software resource {} {}", id, desc.summary());
        Ok(Arc::new(SoftwareResource {
            id,
            desc: desc.clone(),
            name: Mutex::new(desc.name.clone()),
            format,
            subresources,
            video_memory,
            in_use: self.in_use.clone(),
        }))
    }

    fn describe(&self, resource: &SoftwareResource) -> BufferDescriptor {
        let mut desc = resource.desc.clone();
        desc.name = lock(&resource.name).clone();
        desc
    }

    fn set_debug_name(&self, resource: &SoftwareResource, name: &str) {
        *lock(&resource.name) = name.to_string();
    }

    fn debug_name(&self, resource: &SoftwareResource) -> String {
        lock(&resource.name).clone()
    }

    unsafe fn update_subresource(
        &self,
        resource: &SoftwareResource,
        sub: u32,
        dst_box: Option<&CopyBox>,
        src: *const u8,
        row_pitch: u32,
        slice_pitch: u32,
    ) {
        let Some(subresource) = resource.subresource(sub) else {
            warn!("Update of missing subresource {} ignored", sub);
            return;
        };
        let layout = &subresource.layout;
        let region = dst_box.copied().unwrap_or_else(|| Self::full_box(layout));
        if !Self::region_fits(resource.format, layout, &region) {
            warn!("Update box {:?} outside subresource {}", region, sub);
            return;
        }

        let mut src = src;
        if dst_box.is_some() && self.has_partial_update_defect() {
            // Deferred contexts without driver command lists offset the
            // source by the box origin again
            let skew = match resource.format {
                Some(format) => {
                    let e = element_box(format, &region);
                    e.front as usize * slice_pitch as usize
                        + e.top as usize * row_pitch as usize
                        + e.left as usize * format.bytes_per_element() as usize
                }
                None => region.left as usize,
            };
            src = src.wrapping_add(skew);
        }

        let mut bytes = lock(&subresource.bytes);
        Self::write_region(
            resource.format,
            &mut bytes,
            layout,
            &region,
            src,
            row_pitch as usize,
            slice_pitch as usize,
        );
        self.counters.updates.fetch_add(1, Ordering::Relaxed);
    }

    fn map(
        &self,
        resource: &SoftwareResource,
        sub: u32,
        mode: MapMode,
    ) -> Result<RawMapping, BackendError> {
        self.map_range(resource, sub, mode, None)
    }

    fn map_partial(
        &self,
        resource: &SoftwareResource,
        sub: u32,
        mode: MapMode,
        offset: usize,
        size: usize,
    ) -> Result<RawMapping, BackendError> {
        if !self.config.partial_maps {
            return Err(BackendError::Unsupported);
        }
        self.map_range(resource, sub, mode, Some((offset, size)))
    }

    fn unmap(&self, resource: &SoftwareResource, sub: u32) {
        let Some(subresource) = resource.subresource(sub) else {
            return;
        };
        if !subresource.mapped.swap(false, Ordering::AcqRel) {
            warn!("Unmap of subresource {} which was not mapped", sub);
        }
        self.counters.unmaps.fetch_add(1, Ordering::Relaxed);
    }

    fn copy_resource(&self, dst: &SoftwareResource, src: &SoftwareResource) {
        if dst.subresources.len() != src.subresources.len() {
            warn!(
                "copy_resource between incompatible resources {} and {}",
                dst.id, src.id
            );
            return;
        }
        for (d, s) in dst.subresources.iter().zip(&src.subresources) {
            let source = lock(&s.bytes).clone();
            let mut target = lock(&d.bytes);
            if source.len() == target.len() {
                target.copy_from_slice(&source);
            } else {
                let rows = d.layout.rows.min(s.layout.rows) * d.layout.depth as usize;
                let row_len = d.layout.row_bytes.min(s.layout.row_bytes);
                for row in 0..rows {
                    let so = row * s.layout.row_pitch;
                    let to = row * d.layout.row_pitch;
                    target[to..to + row_len].copy_from_slice(&source[so..so + row_len]);
                }
            }
        }
        self.counters.resource_copies.fetch_add(1, Ordering::Relaxed);
    }

    fn copy_subresource_region(
        &self,
        dst: &SoftwareResource,
        dst_sub: u32,
        dst_origin: [u32; 3],
        src: &SoftwareResource,
        src_sub: u32,
        src_box: Option<&CopyBox>,
    ) {
        let (Some(d), Some(s)) = (dst.subresource(dst_sub), src.subresource(src_sub)) else {
            warn!("Region copy of missing subresource ignored");
            return;
        };
        if dst.format != src.format {
            warn!("Region copy between different formats ignored");
            return;
        }
        let region = src_box.copied().unwrap_or_else(|| Self::full_box(&s.layout));
        let target = CopyBox {
            left: dst_origin[0],
            top: dst_origin[1],
            front: dst_origin[2],
            right: dst_origin[0] + region.width(),
            bottom: dst_origin[1] + region.height(),
            back: dst_origin[2] + (region.back - region.front),
        };
        if !Self::region_fits(src.format, &s.layout, &region)
            || !Self::region_fits(dst.format, &d.layout, &target)
        {
            warn!(
                "Region copy {:?} -> {:?} outside subresource bounds",
                region, dst_origin
            );
            return;
        }

        // Gather the source rows first so copies within one subresource work
        let source = lock(&s.bytes).clone();
        let (start, row_pitch, slice_pitch) = match src.format {
            Some(format) => {
                let e = element_box(format, &region);
                (
                    e.front as usize * s.layout.slice_pitch
                        + e.top as usize * s.layout.row_pitch
                        + e.left as usize * format.bytes_per_element() as usize,
                    s.layout.row_pitch,
                    s.layout.slice_pitch,
                )
            }
            None => (region.left as usize, 0, 0),
        };
        let mut bytes = lock(&d.bytes);
        // SAFETY: `region_fits` bounds every source row inside `source`.
        unsafe {
            Self::write_region(
                dst.format,
                &mut bytes,
                &d.layout,
                &target,
                source.as_ptr().add(start),
                row_pitch,
                slice_pitch,
            );
        }
        self.counters.region_copies.fetch_add(1, Ordering::Relaxed);
    }

    fn create_fence(&self) -> Option<SoftwareFence> {
        if self.fail_fence_creation.load(Ordering::Acquire) {
            None
        } else {
            Some(SoftwareFence::default())
        }
    }

    fn end_fence(&self, fence: &SoftwareFence) {
        let position = self.submitted.fetch_add(1, Ordering::AcqRel) + 1;
        fence.position.store(position, Ordering::Release);
    }

    fn is_fence_signaled(&self, fence: &SoftwareFence) -> bool {
        let position = fence.position.load(Ordering::Acquire);
        position != 0 && position <= self.retired.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::ImmediateData;
    use crate::desc::{BindFlags, TextureShape};

    fn device() -> SoftwareDevice {
        SoftwareDevice::new(SoftwareConfig::default())
    }

    #[test]
    fn test_create_with_initial_data() {
        let dev = device();
        let desc = BufferDescriptor::linear(8, BindFlags::VERTEX_BUFFER);
        let init = ImmediateData::from_bytes((0..8).collect());
        let buffer = dev.create_resource(&desc, Some(&init)).unwrap();
        assert_eq!(dev.contents(&buffer, 0), (0..8).collect::<Vec<u8>>());
        assert_eq!(dev.video_memory_in_use(), 8);
        drop(buffer);
        assert_eq!(dev.video_memory_in_use(), 0);
    }

    #[test]
    fn test_memory_budget() {
        let dev = SoftwareDevice::new(SoftwareConfig {
            memory_budget: Some(100),
            ..Default::default()
        });
        let desc = BufferDescriptor::linear(64, BindFlags::VERTEX_BUFFER);
        let _first = dev.create_resource(&desc, None).unwrap();
        assert_eq!(
            dev.create_resource(&desc, None).unwrap_err(),
            BackendError::OutOfMemory
        );
        // Staging copies do not use video memory
        assert!(dev.create_resource(&desc.as_staging(), None).is_ok());
    }

    #[test]
    fn test_exclusive_map() {
        let dev = device();
        let desc = BufferDescriptor::linear(16, BindFlags::VERTEX_BUFFER)
            .with_cpu_access(CpuAccess::READ | CpuAccess::WRITE_DYNAMIC);
        let buffer = dev.create_resource(&desc, None).unwrap();
        let _mapping = dev.map(&buffer, 0, MapMode::Discard).unwrap();
        assert_eq!(
            dev.map(&buffer, 0, MapMode::Read).unwrap_err(),
            BackendError::AlreadyMapped(0)
        );
        dev.unmap(&buffer, 0);
        assert!(dev.map(&buffer, 0, MapMode::Read).is_ok());
    }

    #[test]
    fn test_no_overwrite_needs_command_lists_off_immediate() {
        let dev = SoftwareDevice::new(SoftwareConfig {
            immediate: false,
            driver_command_lists: false,
            ..Default::default()
        });
        assert!(!dev.capabilities().can_do_no_overwrite_map_in_background);
        let desc = BufferDescriptor::linear(16, BindFlags::VERTEX_BUFFER)
            .with_cpu_access(CpuAccess::WRITE_DYNAMIC);
        let buffer = dev.create_resource(&desc, None).unwrap();
        assert!(matches!(
            dev.map(&buffer, 0, MapMode::NoOverwrite),
            Err(BackendError::InvalidArgument(_))
        ));
        assert!(dev.map(&buffer, 0, MapMode::Discard).is_ok());
    }

    #[test]
    fn test_map_requires_cpu_access() {
        let dev = device();
        let desc = BufferDescriptor::linear(16, BindFlags::VERTEX_BUFFER);
        let buffer = dev.create_resource(&desc, None).unwrap();
        assert!(matches!(
            dev.map(&buffer, 0, MapMode::Read),
            Err(BackendError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_fences_signal_after_retire() {
        let dev = device();
        let fence = dev.create_fence().unwrap();
        assert!(!dev.is_fence_signaled(&fence));
        dev.end_fence(&fence);
        assert!(!dev.is_fence_signaled(&fence));
        assert_eq!(dev.pending_fences(), 1);
        dev.retire_all();
        assert!(dev.is_fence_signaled(&fence));

        dev.set_fail_fence_creation(true);
        assert!(dev.create_fence().is_none());
    }

    #[test]
    fn test_row_pitch_alignment() {
        let dev = SoftwareDevice::new(SoftwareConfig {
            row_pitch_alignment: 256,
            ..Default::default()
        });
        let desc = BufferDescriptor::texture(TextureShape::new_2d(8, 4, 1, PixelFormat::R8G8B8A8Unorm));
        let texture = dev.create_resource(&desc, None).unwrap();
        assert_eq!(dev.pitches(&texture, 0), SubresourcePitches::new(256, 1024));
    }

    #[test]
    fn test_deferred_context_capabilities() {
        let dev = SoftwareDevice::new(SoftwareConfig {
            immediate: false,
            driver_command_lists: false,
            region_copy_reliable: false,
            ..Default::default()
        });
        let caps = dev.capabilities();
        assert!(caps.use_update_subresource_workaround);
        assert!(caps.use_map_based_defrag);
        assert!(!dev.is_immediate());
    }
}
