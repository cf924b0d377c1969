//! Upload Context Module
//!
//! Pushes CPU data into GPU resources, copies between resources and exposes
//! mapping and readback. The primitive used for each request is chosen from
//! the backend's [`Capabilities`] and the descriptor's CPU access flags.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::backend::{Backend, Capabilities, CopyBox, MapMode, ResourceLocator, UpdateBox};
use crate::data_source::{DataSource, SubresourceData, SubresourcePitches};
use crate::defrag::{self, DefragStep};
use crate::desc::{BufferDescriptor, CpuAccess, Shape, SubresourceId, TextureShape};
use crate::error::{BackendError, Result, UploadError};
use crate::format::PixelFormat;
use crate::mapped::MappedRegion;
use crate::readback::ReadbackData;
use crate::tracker::ResourceTracker;

/// Which part of a texture a staged upload writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialResource {
    /// Region of the top mip level; the default is the whole plane.
    pub update_box: UpdateBox,
    pub lod_min: u32,
    pub lod_max: u32,
    pub array_min: u32,
    pub array_max: u32,
}

impl PartialResource {
    /// Every lod, every layer, the whole plane.
    pub const fn all() -> Self {
        Self {
            update_box: UpdateBox::new(0, 0, 0, 0),
            lod_min: 0,
            lod_max: u32::MAX,
            array_min: 0,
            array_max: u32::MAX,
        }
    }

    pub const fn with_box(mut self, update_box: UpdateBox) -> Self {
        self.update_box = update_box;
        self
    }

    pub const fn with_lods(mut self, lod_min: u32, lod_max: u32) -> Self {
        self.lod_min = lod_min;
        self.lod_max = lod_max;
        self
    }

    pub const fn with_array_layers(mut self, array_min: u32, array_max: u32) -> Self {
        self.array_min = array_min;
        self.array_max = array_max;
        self
    }
}

impl Default for PartialResource {
    fn default() -> Self {
        Self::all()
    }
}

/// How a staging texture maps onto the final texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingToFinalMapping {
    pub dst_box: UpdateBox,
    pub dst_lod_min: u32,
    pub dst_lod_max: u32,
    pub dst_array_min: u32,
    pub dst_array_max: u32,
    pub staging_lod_offset: u32,
    pub staging_array_offset: u32,
    pub staging_xy_offset: [u32; 2],
}

impl Default for StagingToFinalMapping {
    fn default() -> Self {
        Self {
            dst_box: UpdateBox::default(),
            dst_lod_min: 0,
            dst_lod_max: u32::MAX,
            dst_array_min: 0,
            dst_array_max: u32::MAX,
            staging_lod_offset: 0,
            staging_array_offset: 0,
            staging_xy_offset: [0, 0],
        }
    }
}

/// Box `update_box` (given in top-level pixels) scaled to mip level `mip`.
fn box_at_mip(update_box: UpdateBox, mip: u32) -> UpdateBox {
    if update_box.is_full() || mip == 0 {
        return update_box;
    }
    let left = update_box.left >> mip;
    let top = update_box.top >> mip;
    UpdateBox::new(
        left,
        top,
        (update_box.right >> mip).max(left + 1),
        (update_box.bottom >> mip).max(top + 1),
    )
}

/// Box `update_box` at mip level `mip`, kept inside that level's extent.
fn box_at_level(update_box: UpdateBox, mip: u32, level: &TextureShape) -> UpdateBox {
    let b = box_at_mip(update_box, mip);
    if b.is_full() {
        return b;
    }
    let right = b.right.min(level.width.max(1));
    let bottom = b.bottom.min(level.height.max(1));
    UpdateBox::new(b.left.min(right - 1), b.top.min(bottom - 1), right, bottom)
}

/// A partial box must be non-empty and lie inside the top level.
fn check_update_box(shape: &TextureShape, b: &UpdateBox) -> Result<()> {
    if b.is_full() {
        return Ok(());
    }
    if b.right <= b.left || b.bottom <= b.top || b.right > shape.width || b.bottom > shape.height {
        return Err(UploadError::InvalidDescriptor(format!(
            "update box {:?} outside {}x{}",
            b, shape.width, shape.height
        )));
    }
    Ok(())
}

/// Bytes a source must provide to cover `width` x `height` x `depth` pixels
/// laid out with `pitches`.
fn required_source_len(
    format: PixelFormat,
    width: u32,
    height: u32,
    depth: u32,
    pitches: SubresourcePitches,
) -> usize {
    let rows = format.row_count(height) as usize;
    let row_bytes = format.row_bytes(width) as usize;
    (depth.max(1) as usize - 1) * pitches.slice_pitch as usize
        + (rows - 1) * pitches.row_pitch as usize
        + row_bytes
}

/// Copy one mip level into mapped memory, honoring the destination pitch.
///
/// Returns the number of bytes written.
pub fn copy_mip_level(
    dst: &mut [u8],
    dst_pitches: SubresourcePitches,
    level: &TextureShape,
    src: SubresourceData<'_>,
) -> usize {
    let format = level.pixel_format;
    let row_bytes = format.row_bytes(level.width) as usize;
    let rows = format.row_count(level.height) as usize;
    let depth = level.depth.max(1) as usize;

    if dst_pitches == src.pitches && dst_pitches.row_pitch as usize == row_bytes {
        let len = dst.len().min(src.data.len());
        dst[..len].copy_from_slice(&src.data[..len]);
        return len;
    }

    let mut copied = 0;
    for z in 0..depth {
        for row in 0..rows {
            let from = z * src.pitches.slice_pitch as usize + row * src.pitches.row_pitch as usize;
            let to = z * dst_pitches.slice_pitch as usize + row * dst_pitches.row_pitch as usize;
            if from + row_bytes > src.data.len() || to + row_bytes > dst.len() {
                return copied;
            }
            dst[to..to + row_bytes].copy_from_slice(&src.data[from..from + row_bytes]);
            copied += row_bytes;
        }
    }
    copied
}

fn is_all_lod_levels(shape: &TextureShape, lod_min: u32, lod_max: u32) -> bool {
    let last = shape.mip_levels() - 1;
    lod_min == 0 && lod_max.min(last) == last
}

fn is_all_array_layers(shape: &TextureShape, array_min: u32, array_max: u32) -> bool {
    if shape.array_count == 0 {
        return true;
    }
    let last = shape.array_count - 1;
    array_min == 0 && array_max.min(last) == last
}

/// Staging descriptor and copy mapping for a partial texture update.
///
/// Updating only part of the 2D plane requires every lod level, since the
/// lower mips would otherwise have to be regenerated.
pub fn calculate_partial_staging_desc(
    dst_desc: &BufferDescriptor,
    part: &PartialResource,
) -> Result<(BufferDescriptor, StagingToFinalMapping)> {
    let shape = dst_desc
        .texture_shape()
        .ok_or_else(|| UploadError::InvalidDescriptor("staged uploads need a texture".into()))?;

    let mut staging = dst_desc.as_staging();
    let mut mapping = StagingToFinalMapping {
        dst_box: part.update_box,
        ..Default::default()
    };

    if part.update_box.covers(shape.width, shape.height) {
        if !is_all_lod_levels(shape, part.lod_min, part.lod_max) {
            mapping.staging_lod_offset = part.lod_min;
            mapping.dst_lod_min = part.lod_min;
            mapping.dst_lod_max = part.lod_max.min(shape.mip_levels() - 1);
            if mapping.dst_lod_min > mapping.dst_lod_max {
                return Err(UploadError::InvalidDescriptor(format!(
                    "lod range {}..={} outside {} mips",
                    part.lod_min,
                    part.lod_max,
                    shape.mip_levels()
                )));
            }
            staging = staging.with_lod_offset(mapping.staging_lod_offset);
            if let Shape::Texture(t) = &mut staging.shape {
                t.mip_count = mapping.dst_lod_max + 1 - mapping.dst_lod_min;
            }
        }
    } else {
        if !is_all_lod_levels(shape, part.lod_min, part.lod_max) {
            return Err(UploadError::PartialPlaneNeedsAllLods);
        }
        let b = part.update_box;
        check_update_box(shape, &b)?;
        mapping.staging_xy_offset = [b.left, b.top];
        if let Shape::Texture(t) = &mut staging.shape {
            t.width = b.right - b.left;
            t.height = b.bottom - b.top;
        }
    }

    if !is_all_array_layers(shape, part.array_min, part.array_max) {
        mapping.staging_array_offset = part.array_min;
        mapping.dst_array_min = part.array_min;
        mapping.dst_array_max = part.array_max.min(shape.array_count - 1);
        if let Shape::Texture(t) = &mut staging.shape {
            t.array_count = mapping.dst_array_max + 1 - mapping.dst_array_min;
            if t.array_count == 1 {
                t.array_count = 0;
            }
        }
    }

    Ok((staging, mapping))
}

/// Upload primitives bound to one device context.
pub struct UploadContext<'a, B: Backend> {
    device: &'a B,
    capabilities: Capabilities,
    tracker: Option<Arc<ResourceTracker<B::Resource>>>,
}

impl<'a, B: Backend> UploadContext<'a, B> {
    /// Bind to `device`, capturing its capabilities once.
    pub fn new(device: &'a B) -> Self {
        let capabilities = device.capabilities();
        Self::with_capabilities(device, capabilities)
    }

    /// Bind to `device` with an explicit capability set.
    ///
    /// `use_update_subresource_workaround` always follows the device: it
    /// rebases source pointers, which is only sound where the driver adds
    /// the offset back.
    pub fn with_capabilities(device: &'a B, mut capabilities: Capabilities) -> Self {
        let detected = device.capabilities().use_update_subresource_workaround;
        if capabilities.use_update_subresource_workaround != detected {
            warn!(
                "Ignoring use_update_subresource_workaround = {}; the device reports {}",
                capabilities.use_update_subresource_workaround, detected
            );
            capabilities.use_update_subresource_workaround = detected;
        }
        debug!("Upload context capabilities: {:?}", capabilities);
        Self {
            device,
            capabilities,
            tracker: None,
        }
    }

    /// Attach an observer that records every resource this context creates.
    pub fn with_tracker(mut self, tracker: Arc<ResourceTracker<B::Resource>>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn device(&self) -> &'a B {
        self.device
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn tracker(&self) -> Option<&Arc<ResourceTracker<B::Resource>>> {
        self.tracker.as_ref()
    }

    // ========================================================================
    // Resource creation
    // ========================================================================

    /// Create a resource, name it and report it to the tracker.
    ///
    /// Creation failures are escalated; there is no degraded path.
    pub fn create_resource(
        &self,
        desc: &BufferDescriptor,
        init: Option<&dyn DataSource>,
    ) -> Result<Arc<B::Resource>> {
        if init.is_some_and(|source| !source.is_ready()) {
            return Err(UploadError::SourceNotReady);
        }
        let initialise_at_creation = self.capabilities.supports_resource_initialisation;
        let resource = self
            .device
            .create_resource(desc, init.filter(|_| initialise_at_creation))
            .map_err(|source| {
                error!("Failed to create {}: {}", desc.summary(), source);
                UploadError::ResourceCreation {
                    name: desc.name.clone(),
                    source,
                }
            })?;

        if !desc.name.is_empty() {
            self.device.set_debug_name(&resource, &desc.name);
        }
        if let Some(tracker) = &self.tracker {
            tracker.register(&resource, desc);
        }

        if let (Some(init), false) = (init, initialise_at_creation) {
            match &desc.shape {
                Shape::Texture(_) => {
                    self.upload_texture(&resource, desc, &PartialResource::all(), init)?;
                }
                Shape::Linear(_) => {
                    self.push_to_buffer(&resource, desc, 0, init.get_data(SubresourceId::default()))?;
                }
            }
        }
        Ok(resource)
    }

    // ========================================================================
    // Texture uploads
    // ========================================================================

    fn partial_update_skew(format: PixelFormat, update_box: &CopyBox, pitches: SubresourcePitches) -> usize {
        let mut aligned = *update_box;
        let mut bits_per_element = format.bits_per_pixel() as usize;
        if format.is_block_compressed() {
            aligned.left /= 4;
            aligned.right /= 4;
            aligned.top /= 4;
            aligned.bottom /= 4;
            bits_per_element *= 16;
        }
        aligned.front as usize * pitches.slice_pitch as usize
            + aligned.top as usize * pitches.row_pitch as usize
            + aligned.left as usize * (bits_per_element / 8)
    }

    /// Write every non-empty subresource of `source` in the given ranges.
    /// Source subresources are numbered relative to `lod_min`/`array_min`.
    fn push_subresources(
        &self,
        resource: &B::Resource,
        shape: &TextureShape,
        update_box: UpdateBox,
        source: &dyn DataSource,
        lods: (u32, u32),
        layers: (u32, u32),
    ) -> Result<usize> {
        if !source.is_ready() {
            return Err(UploadError::SourceNotReady);
        }
        check_update_box(shape, &update_box)?;

        let format = shape.pixel_format;
        let mut copied = 0;
        for mip in lods.0..=lods.1 {
            let level = shape.mip_level_shape(mip);
            let mip_box = box_at_level(update_box, mip, &level);
            for layer in layers.0..=layers.1 {
                let data = source.subresource(SubresourceId::new(mip - lods.0, layer - layers.0));
                if data.is_empty() {
                    continue;
                }

                let index = SubresourceId::new(mip, layer).index(shape.mip_levels());
                let pitches = data.pitches;
                let (width, height) = if mip_box.is_full() {
                    (level.width, level.height)
                } else {
                    (mip_box.right - mip_box.left, mip_box.bottom - mip_box.top)
                };
                let needed = required_source_len(format, width, height, level.depth, pitches);
                if data.data.len() < needed {
                    return Err(UploadError::OutOfBounds {
                        offset: 0,
                        len: needed,
                        capacity: data.data.len(),
                    });
                }

                if mip_box.is_full() {
                    // SAFETY: `needed` bytes at the pointer were checked above.
                    unsafe {
                        self.device.update_subresource(
                            resource,
                            index,
                            None,
                            data.data.as_ptr(),
                            pitches.row_pitch,
                            pitches.slice_pitch,
                        );
                    }
                } else {
                    let copy_box = mip_box.to_copy_box();
                    let mut src = data.data.as_ptr();
                    if self.capabilities.use_update_subresource_workaround {
                        // The driver adds the box origin to the source pointer
                        // on deferred contexts; cancel that out here
                        src = src.wrapping_sub(Self::partial_update_skew(format, &copy_box, pitches));
                    }
                    // SAFETY: the rows the platform reads were bounds checked;
                    // with the workaround the platform rebases `src` itself.
                    unsafe {
                        self.device.update_subresource(
                            resource,
                            index,
                            Some(&copy_box),
                            src,
                            pitches.row_pitch,
                            pitches.slice_pitch,
                        );
                    }
                }
                copied += data.data.len();
            }
        }
        Ok(copied)
    }

    /// Write every `(mip, layer)` of `source` into `resource`.
    ///
    /// Empty subresources are skipped. A non-default `update_box` restricts
    /// the write to that region (scaled for lower mips). Returns the bytes
    /// taken from `source`.
    pub fn push_to_texture(
        &self,
        resource: &B::Resource,
        desc: &BufferDescriptor,
        update_box: UpdateBox,
        source: &dyn DataSource,
    ) -> Result<usize> {
        let shape = desc
            .texture_shape()
            .ok_or_else(|| UploadError::InvalidDescriptor("push_to_texture on a buffer".into()))?;
        let copied = self.push_subresources(
            resource,
            shape,
            update_box,
            source,
            (0, shape.mip_levels() - 1),
            (0, shape.array_layers() - 1),
        )?;
        debug!("push_to_texture {}: {} bytes", desc.summary(), copied);
        Ok(copied)
    }

    /// Write a staging texture one mapped subresource at a time.
    pub fn push_to_staging_texture(
        &self,
        resource: &Arc<B::Resource>,
        desc: &BufferDescriptor,
        update_box: UpdateBox,
        source: &dyn DataSource,
    ) -> Result<usize> {
        let shape = desc.texture_shape().ok_or_else(|| {
            UploadError::InvalidDescriptor("push_to_staging_texture on a buffer".into())
        })?;
        if !update_box.is_full() {
            return Err(UploadError::InvalidDescriptor(
                "staging textures are written whole".into(),
            ));
        }
        if !source.is_ready() {
            return Err(UploadError::SourceNotReady);
        }

        let mut copied = 0;
        for mip in 0..shape.mip_levels() {
            let level = shape.mip_level_shape(mip);
            for layer in 0..shape.array_layers() {
                let sub = SubresourceId::new(mip, layer);
                let data = source.subresource(sub);
                if data.is_empty() {
                    continue;
                }
                let mut region = self.map(resource, MapMode::Write, sub.index(shape.mip_levels()));
                if !region.is_mapped() {
                    warn!("Staging write of {:?} dropped: map failed", sub);
                    continue;
                }
                let pitches = region.pitches();
                copied += copy_mip_level(region.data_mut(), pitches, &level, data);
            }
        }
        debug!("push_to_staging_texture {}: {} bytes", desc.summary(), copied);
        Ok(copied)
    }

    /// Copy a filled staging texture into its final destination.
    pub fn update_final_resource_from_staging(
        &self,
        dst: &B::Resource,
        staging: &B::Resource,
        dst_desc: &BufferDescriptor,
        mapping: &StagingToFinalMapping,
    ) -> Result<()> {
        let shape = dst_desc.texture_shape().ok_or_else(|| {
            UploadError::InvalidDescriptor("staging copies need a texture destination".into())
        })?;

        let last_lod = shape.mip_levels() - 1;
        let dst_lod_max = mapping.dst_lod_max.min(last_lod);
        let all_lods = mapping.dst_lod_min == 0 && dst_lod_max == last_lod;
        let (dst_array_max, all_layers) = if shape.array_count == 0 {
            (0, true)
        } else {
            let last = shape.array_count - 1;
            let max = mapping.dst_array_max.min(last);
            (max, mapping.dst_array_min == 0 && max == last)
        };
        let entire_plane = mapping.dst_box.covers(shape.width, shape.height);

        if all_lods && all_layers && entire_plane {
            self.device.copy_resource(dst, staging);
            return Ok(());
        }

        let staging_mips = self.device.describe(staging).mip_levels();
        for layer in mapping.dst_array_min..=dst_array_max {
            for mip in mapping.dst_lod_min..=dst_lod_max {
                let dst_sub = SubresourceId::new(mip, layer).index(shape.mip_levels());
                let src_sub = SubresourceId::new(
                    mip - mapping.staging_lod_offset,
                    layer - mapping.staging_array_offset,
                )
                .index(staging_mips);
                let origin = box_at_level(mapping.dst_box, mip, &shape.mip_level_shape(mip));
                self.device.copy_subresource_region(
                    dst,
                    dst_sub,
                    [origin.left, origin.top, 0],
                    staging,
                    src_sub,
                    None,
                );
            }
        }
        Ok(())
    }

    /// Write `part` of a texture from `source`, going through a staging
    /// texture when the backend requires it.
    ///
    /// Source subresources are numbered from `part.lod_min` and
    /// `part.array_min`; a partial box source holds only the box region.
    pub fn upload_texture(
        &self,
        dst: &Arc<B::Resource>,
        desc: &BufferDescriptor,
        part: &PartialResource,
        source: &dyn DataSource,
    ) -> Result<usize> {
        let (staging_desc, mapping) = calculate_partial_staging_desc(desc, part)?;

        if self.capabilities.requires_staging_texture_upload {
            let staging_desc = staging_desc.named(format!("{}-staging", desc.name));
            let staging = self.create_resource(&staging_desc, None)?;
            let copied =
                self.push_to_staging_texture(&staging, &staging_desc, UpdateBox::default(), source)?;
            self.update_final_resource_from_staging(dst, &staging, desc, &mapping)?;
            return Ok(copied);
        }

        let shape = desc
            .texture_shape()
            .ok_or_else(|| UploadError::InvalidDescriptor("upload_texture on a buffer".into()))?;
        let last_layer = if shape.array_count == 0 {
            0
        } else {
            mapping.dst_array_max.min(shape.array_count - 1)
        };
        self.push_subresources(
            dst,
            shape,
            part.update_box,
            source,
            (mapping.dst_lod_min, mapping.dst_lod_max.min(shape.mip_levels() - 1)),
            (mapping.dst_array_min, last_layer),
        )
    }

    // ========================================================================
    // Buffer uploads
    // ========================================================================

    /// Write `data` at `offset` in a linear buffer.
    ///
    /// Buffers without dynamic CPU writes use a box-addressed update. Dynamic
    /// buffers are mapped `NoOverwrite` on the immediate context or where
    /// the backend allows it in the background, and `Discard` elsewhere. A
    /// map failure drops the write and returns 0.
    ///
    /// # Panics
    ///
    /// A `Discard` map covers the whole buffer, so writing at a non-zero
    /// offset through one is a programming error.
    pub fn push_to_buffer(
        &self,
        resource: &Arc<B::Resource>,
        desc: &BufferDescriptor,
        offset: usize,
        data: &[u8],
    ) -> Result<usize> {
        let linear = desc
            .linear_shape()
            .ok_or_else(|| UploadError::InvalidDescriptor("push_to_buffer on a texture".into()))?;
        let capacity = linear.size_in_bytes as usize;
        if offset.checked_add(data.len()).map_or(true, |end| end > capacity) {
            return Err(UploadError::OutOfBounds {
                offset,
                len: data.len(),
                capacity,
            });
        }
        if data.is_empty() {
            return Ok(0);
        }

        if !desc.cpu_access.contains(CpuAccess::WRITE_DYNAMIC) {
            let copy_box = CopyBox::bytes(offset as u32, (offset + data.len()) as u32);
            let mut src = data.as_ptr();
            if self.capabilities.use_update_subresource_workaround {
                src = src.wrapping_sub(offset);
            }
            // SAFETY: `data` covers the box; with the workaround the platform
            // adds `offset` back before reading.
            unsafe {
                self.device
                    .update_subresource(resource, 0, Some(&copy_box), src, 0, 0);
            }
            return Ok(data.len());
        }

        let can_no_overwrite = self.device.is_immediate()
            || self.capabilities.can_do_no_overwrite_map_in_background;
        assert!(
            can_no_overwrite || offset == 0,
            "discard map of '{}' cannot write at offset {}",
            desc.name,
            offset
        );
        let mode = if can_no_overwrite {
            MapMode::NoOverwrite
        } else {
            MapMode::Discard
        };

        let mut region = self.map(resource, mode, 0);
        if !region.is_mapped() {
            warn!("Buffer write to '{}' dropped this frame: map failed", desc.name);
            return Ok(0);
        }
        if region.len() < offset + data.len() {
            warn!(
                "Buffer write to '{}' dropped: mapping of {} bytes too small",
                desc.name,
                region.len()
            );
            return Ok(0);
        }
        region.data_mut()[offset..offset + data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    // ========================================================================
    // Copies
    // ========================================================================

    pub fn resource_copy(&self, dst: &B::Resource, src: &B::Resource) {
        self.device.copy_resource(dst, src);
    }

    /// Replay defrag relocations from `src` into `dst`. Returns `false` if
    /// the copy could not run this frame.
    pub fn resource_copy_defrag_steps(
        &self,
        dst: &Arc<B::Resource>,
        src: &Arc<B::Resource>,
        steps: &[DefragStep],
    ) -> bool {
        defrag::apply_defrag_steps(self, dst, src, steps)
    }

    // ========================================================================
    // Mapping and readback
    // ========================================================================

    fn try_map(
        &self,
        resource: &Arc<B::Resource>,
        mode: MapMode,
        sub: u32,
    ) -> std::result::Result<MappedRegion<'a, B>, BackendError> {
        let mapping = self.device.map(resource, sub, mode)?;
        Ok(MappedRegion::new(self.device, resource, sub, mapping))
    }

    /// Map a whole subresource. Returns an empty region on failure so the
    /// caller can retry on a later frame.
    pub fn map(&self, resource: &Arc<B::Resource>, mode: MapMode, sub: u32) -> MappedRegion<'a, B> {
        self.try_map(resource, mode, sub).unwrap_or_else(|e| {
            debug!("Map of subresource {} failed: {}", sub, e);
            MappedRegion::empty()
        })
    }

    /// Map `size` bytes at `offset`. Fails when the backend cannot do
    /// partial maps; it never falls back to a whole map.
    pub fn map_partial(
        &self,
        resource: &Arc<B::Resource>,
        mode: MapMode,
        offset: usize,
        size: usize,
        sub: u32,
    ) -> Result<MappedRegion<'a, B>> {
        if !self.capabilities.can_do_partial_maps {
            error!("map_partial called on a backend without partial maps");
            return Err(UploadError::Unsupported {
                operation: "map_partial",
            });
        }
        let mapping = self
            .device
            .map_partial(resource, sub, mode, offset, size)
            .map_err(|source| match source {
                BackendError::Unsupported => UploadError::Unsupported {
                    operation: "map_partial",
                },
                source => UploadError::MapFailed {
                    subresource: sub,
                    source,
                },
            })?;
        Ok(MappedRegion::new(self.device, resource, sub, mapping))
    }

    /// Produce a CPU-readable view of a resource.
    ///
    /// Resources the CPU cannot read are first copied into a staging clone.
    /// Every subresource is mapped for reading, which blocks until the GPU
    /// has written it.
    pub fn readback(&self, locator: &ResourceLocator<B::Resource>) -> Result<ReadbackData<'a, B>> {
        let desc = self.device.describe(&locator.resource);
        let readable = self.capabilities.can_read_gpu_memory_directly
            || desc.cpu_access.contains(CpuAccess::READ);

        let source = if readable {
            locator.resource.clone()
        } else {
            let staging_desc = desc.as_staging().named(format!("{}-readback", desc.name));
            let staging = self.create_resource(&staging_desc, None)?;
            self.resource_copy(&staging, &locator.resource);
            staging
        };

        let mut regions = Vec::with_capacity(desc.subresource_count() as usize);
        for index in 0..desc.subresource_count() {
            let region = self
                .try_map(&source, MapMode::Read, index)
                .map_err(|source| UploadError::MapFailed {
                    subresource: index,
                    source,
                })?;
            regions.push(region);
        }

        debug!(
            "Readback of {} at offset {} ({} subresources)",
            desc.summary(),
            locator.offset,
            regions.len()
        );
        Ok(ReadbackData::new(source, regions, desc.mip_levels(), locator.offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{BindFlags, TextureShape};
    use crate::format::PixelFormat;

    fn rgba(width: u32, height: u32, mips: u32) -> BufferDescriptor {
        BufferDescriptor::texture(TextureShape::new_2d(width, height, mips, PixelFormat::R8G8B8A8Unorm))
    }

    #[test]
    fn test_partial_staging_full_plane_lod_subset() {
        let desc = rgba(64, 64, 7);
        let part = PartialResource::all().with_lods(2, 4);
        let (staging, mapping) = calculate_partial_staging_desc(&desc, &part).unwrap();
        let shape = staging.texture_shape().unwrap();
        assert_eq!((shape.width, shape.height, shape.mip_count), (16, 16, 3));
        assert_eq!(mapping.staging_lod_offset, 2);
        assert_eq!((mapping.dst_lod_min, mapping.dst_lod_max), (2, 4));
        assert!(staging.gpu_access.is_empty());
    }

    #[test]
    fn test_partial_staging_box_needs_all_lods() {
        let desc = rgba(64, 64, 3);
        let part = PartialResource::all()
            .with_box(UpdateBox::new(8, 8, 24, 16))
            .with_lods(1, 2);
        assert!(matches!(
            calculate_partial_staging_desc(&desc, &part),
            Err(UploadError::PartialPlaneNeedsAllLods)
        ));

        let part = part.with_lods(0, u32::MAX);
        let (staging, mapping) = calculate_partial_staging_desc(&desc, &part).unwrap();
        let shape = staging.texture_shape().unwrap();
        assert_eq!((shape.width, shape.height), (16, 8));
        assert_eq!(mapping.staging_xy_offset, [8, 8]);
    }

    #[test]
    fn test_partial_staging_array_subset() {
        let mut desc = rgba(16, 16, 1);
        if let Shape::Texture(t) = &mut desc.shape {
            t.array_count = 6;
        }
        let part = PartialResource::all().with_array_layers(2, 2);
        let (staging, mapping) = calculate_partial_staging_desc(&desc, &part).unwrap();
        assert_eq!(staging.texture_shape().unwrap().array_count, 0);
        assert_eq!(mapping.staging_array_offset, 2);
        assert_eq!((mapping.dst_array_min, mapping.dst_array_max), (2, 2));
    }

    #[test]
    fn test_copy_mip_level_pitch_change() {
        let level = TextureShape::new_2d(2, 2, 1, PixelFormat::R8G8B8A8Unorm);
        let src: Vec<u8> = (0..16).collect();
        let mut dst = vec![0u8; 32];
        let copied = copy_mip_level(
            &mut dst,
            SubresourcePitches::new(16, 32),
            &level,
            SubresourceData {
                data: &src,
                pitches: SubresourcePitches::new(8, 16),
            },
        );
        assert_eq!(copied, 16);
        assert_eq!(&dst[0..8], &src[0..8]);
        assert_eq!(&dst[16..24], &src[8..16]);
        assert!(dst[8..16].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_partial_update_skew_block_compressed() {
        let b = UpdateBox::new(8, 4, 16, 12).to_copy_box();
        let pitches = SubresourcePitches::new(64, 256);
        // BC1: 8 bytes per block, box origin at block (2, 1)
        let skew = UploadContext::<crate::software::SoftwareDevice>::partial_update_skew(
            PixelFormat::Bc1Unorm,
            &b,
            pitches,
        );
        assert_eq!(skew, 64 + 2 * 8);
    }

    #[test]
    fn test_box_at_mip() {
        let b = UpdateBox::new(8, 8, 24, 16);
        assert_eq!(box_at_mip(b, 0), b);
        assert_eq!(box_at_mip(b, 1), UpdateBox::new(4, 4, 12, 8));
        assert_eq!(box_at_mip(b, 5), UpdateBox::new(0, 0, 1, 1));
        assert!(box_at_mip(UpdateBox::default(), 3).is_full());
    }

    #[test]
    fn test_box_at_level_stays_inside_level() {
        let shape = TextureShape::new_2d(10, 10, 4, PixelFormat::R8G8B8A8Unorm);
        let b = UpdateBox::new(8, 8, 10, 10);
        assert_eq!(box_at_level(b, 0, &shape.mip_level_shape(0)), b);
        assert_eq!(
            box_at_level(b, 2, &shape.mip_level_shape(2)),
            UpdateBox::new(1, 1, 2, 2)
        );
    }

    #[test]
    fn test_check_update_box() {
        let shape = TextureShape::new_2d(16, 16, 1, PixelFormat::R8G8B8A8Unorm);
        assert!(check_update_box(&shape, &UpdateBox::default()).is_ok());
        assert!(check_update_box(&shape, &UpdateBox::new(0, 0, 16, 16)).is_ok());
        assert!(check_update_box(&shape, &UpdateBox::new(8, 0, 4, 4)).is_err());
        assert!(check_update_box(&shape, &UpdateBox::new(4, 4, 4, 8)).is_err());
        assert!(check_update_box(&shape, &UpdateBox::new(12, 12, 20, 20)).is_err());
    }

    #[test]
    fn test_buffer_bounds() {
        let device = crate::software::SoftwareDevice::new(Default::default());
        let ctx = UploadContext::new(&device);
        let desc = BufferDescriptor::linear(16, BindFlags::VERTEX_BUFFER);
        let buffer = ctx.create_resource(&desc, None).unwrap();
        assert!(matches!(
            ctx.push_to_buffer(&buffer, &desc, 12, &[0; 8]),
            Err(UploadError::OutOfBounds { capacity: 16, .. })
        ));
        assert_eq!(ctx.push_to_buffer(&buffer, &desc, 4, &[9; 8]).unwrap(), 8);
        assert_eq!(&device.contents(&buffer, 0)[4..12], &[9; 8]);
    }
}
