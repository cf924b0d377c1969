//! D3D11 Device Module
//!
//! [`Backend`] implementation over an `ID3D11Device` and one of its device
//! contexts (the immediate context or a deferred one).

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, info, warn};
use windows::core::Interface;
use windows::Win32::Foundation::{E_INVALIDARG, E_OUTOFMEMORY, HMODULE};
use windows::Win32::Graphics::Direct3D::{
    WKPDID_D3DDebugObjectName, D3D_DRIVER_TYPE_HARDWARE, D3D_FEATURE_LEVEL_11_0,
};
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_DEVICE_RESET};

use crate::backend::{Backend, Capabilities, CopyBox, MapMode, RawMapping};
use crate::data_source::{DataSource, SubresourcePitches};
use crate::desc::{
    subresources, BindFlags, BufferDescriptor, CpuAccess, Dimensionality, GpuAccess, Shape,
};
use crate::error::BackendError;

/// A D3D11 texture or buffer with the descriptor it was created from.
pub struct D3D11Resource {
    resource: ID3D11Resource,
    desc: BufferDescriptor,
}

// SAFETY: D3D11 resources are free-threaded; only context calls need
// external synchronization and those go through `D3D11Device`.
unsafe impl Send for D3D11Resource {}
unsafe impl Sync for D3D11Resource {}

impl D3D11Resource {
    pub fn native(&self) -> &ID3D11Resource {
        &self.resource
    }
}

/// A `D3D11_QUERY_EVENT` query.
pub struct D3D11Fence {
    query: ID3D11Query,
}

// SAFETY: queries are device children, free-threaded like resources.
unsafe impl Send for D3D11Fence {}

/// Device plus the context every operation is recorded on.
pub struct D3D11Device {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
    immediate: bool,
    driver_command_lists: bool,
}

fn backend_error(e: windows::core::Error) -> BackendError {
    let code = e.code();
    if code == E_OUTOFMEMORY {
        BackendError::OutOfMemory
    } else if code == E_INVALIDARG {
        BackendError::InvalidArgument(e.message().to_string())
    } else if code == DXGI_ERROR_DEVICE_REMOVED || code == DXGI_ERROR_DEVICE_RESET {
        BackendError::DeviceLost
    } else {
        BackendError::Platform(format!("{:?}", e))
    }
}

/// Native usage for a descriptor. Any CPU-writable GPU resource must be
/// dynamic; plain `WRITE` means infrequent `UpdateSubresource` writes.
fn usage_for_desc(desc: &BufferDescriptor, late_initialisation: bool) -> D3D11_USAGE {
    if desc.gpu_access.is_empty() {
        return D3D11_USAGE_STAGING;
    }
    if desc.cpu_access.contains(CpuAccess::WRITE_DYNAMIC) {
        D3D11_USAGE_DYNAMIC
    } else if desc.cpu_access.contains(CpuAccess::WRITE)
        || late_initialisation
        || desc.gpu_access.contains(GpuAccess::WRITE)
    {
        D3D11_USAGE_DEFAULT
    } else {
        D3D11_USAGE_IMMUTABLE
    }
}

fn native_cpu_access(desc: &BufferDescriptor) -> u32 {
    let mut result = 0;
    if desc.cpu_access.contains(CpuAccess::READ) {
        result |= D3D11_CPU_ACCESS_READ.0 as u32;
    }
    let staging = desc.gpu_access.is_empty();
    if desc.cpu_access.contains(CpuAccess::WRITE_DYNAMIC)
        || (staging && desc.cpu_access.contains(CpuAccess::WRITE))
    {
        result |= D3D11_CPU_ACCESS_WRITE.0 as u32;
    }
    result
}

fn native_bind_flags(flags: BindFlags) -> u32 {
    let table = [
        (BindFlags::VERTEX_BUFFER, D3D11_BIND_VERTEX_BUFFER),
        (BindFlags::INDEX_BUFFER, D3D11_BIND_INDEX_BUFFER),
        (BindFlags::SHADER_RESOURCE, D3D11_BIND_SHADER_RESOURCE),
        (BindFlags::RENDER_TARGET, D3D11_BIND_RENDER_TARGET),
        (BindFlags::DEPTH_STENCIL, D3D11_BIND_DEPTH_STENCIL),
        (BindFlags::UNORDERED_ACCESS, D3D11_BIND_UNORDERED_ACCESS),
        (BindFlags::CONSTANT_BUFFER, D3D11_BIND_CONSTANT_BUFFER),
        (BindFlags::STREAM_OUTPUT, D3D11_BIND_STREAM_OUTPUT),
    ];
    table
        .iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .fold(0, |acc, (_, native)| acc | native.0 as u32)
}

fn native_map(mode: MapMode) -> D3D11_MAP {
    match mode {
        MapMode::Read => D3D11_MAP_READ,
        MapMode::Write => D3D11_MAP_WRITE,
        MapMode::Discard => D3D11_MAP_WRITE_DISCARD,
        MapMode::NoOverwrite => D3D11_MAP_WRITE_NO_OVERWRITE,
    }
}

fn native_box(b: &CopyBox) -> D3D11_BOX {
    D3D11_BOX {
        left: b.left,
        top: b.top,
        front: b.front,
        right: b.right,
        bottom: b.bottom,
        back: b.back,
    }
}

impl D3D11Device {
    /// Wrap an existing device and context.
    pub fn new(device: ID3D11Device, context: ID3D11DeviceContext) -> Self {
        // SAFETY: plain queries on live COM objects.
        let immediate = unsafe { context.GetType() } == D3D11_DEVICE_CONTEXT_IMMEDIATE;
        let mut threading = D3D11_FEATURE_DATA_THREADING::default();
        let driver_command_lists = unsafe {
            device.CheckFeatureSupport(
                D3D11_FEATURE_THREADING,
                &mut threading as *mut _ as *mut c_void,
                std::mem::size_of::<D3D11_FEATURE_DATA_THREADING>() as u32,
            )
        }
        .map(|_| threading.DriverCommandLists.as_bool())
        .unwrap_or(false);

        info!(
            "D3D11 {} context, driver command lists: {}",
            if immediate { "immediate" } else { "deferred" },
            driver_command_lists
        );
        Self {
            device,
            context,
            immediate,
            driver_command_lists,
        }
    }

    /// Create a hardware device. With `deferred` the returned backend
    /// records onto a new deferred context.
    pub fn create_hardware(deferred: bool) -> Result<Self, BackendError> {
        let mut device = None;
        let mut context = None;
        // SAFETY: out pointers are valid for the duration of the call.
        unsafe {
            D3D11CreateDevice(
                None,
                D3D_DRIVER_TYPE_HARDWARE,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_FLAG(0),
                Some(&[D3D_FEATURE_LEVEL_11_0]),
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
        }
        .map_err(backend_error)?;
        let device: ID3D11Device =
            device.ok_or_else(|| BackendError::Platform("no device returned".into()))?;
        let mut context: ID3D11DeviceContext =
            context.ok_or_else(|| BackendError::Platform("no context returned".into()))?;

        if deferred {
            let mut deferred_context = None;
            // SAFETY: as above.
            unsafe { device.CreateDeferredContext(0, Some(&mut deferred_context)) }
                .map_err(backend_error)?;
            context = deferred_context
                .ok_or_else(|| BackendError::Platform("no deferred context returned".into()))?;
        }
        Ok(Self::new(device, context))
    }

    pub fn device(&self) -> &ID3D11Device {
        &self.device
    }

    pub fn context(&self) -> &ID3D11DeviceContext {
        &self.context
    }

    fn create_texture(
        &self,
        desc: &BufferDescriptor,
        init: Option<&[D3D11_SUBRESOURCE_DATA]>,
    ) -> windows::core::Result<ID3D11Resource> {
        let Shape::Texture(t) = &desc.shape else {
            return Err(E_INVALIDARG.into());
        };
        let usage = usage_for_desc(desc, init.is_none());
        let bind = native_bind_flags(desc.bind_flags);
        let cpu = native_cpu_access(desc);
        let format = DXGI_FORMAT(t.pixel_format as i32);
        let init_ptr = init.map(<[D3D11_SUBRESOURCE_DATA]>::as_ptr);

        // SAFETY: descriptors and init arrays outlive the calls; the init
        // array holds one entry per subresource.
        unsafe {
            match t.dimensionality {
                Dimensionality::T1D => {
                    let native = D3D11_TEXTURE1D_DESC {
                        Width: t.width,
                        MipLevels: t.mip_levels(),
                        ArraySize: t.array_layers(),
                        Format: format,
                        Usage: usage,
                        BindFlags: bind,
                        CPUAccessFlags: cpu,
                        MiscFlags: 0,
                    };
                    let mut texture = None;
                    self.device.CreateTexture1D(&native, init_ptr, Some(&mut texture))?;
                    texture.ok_or_else(|| windows::core::Error::from(E_OUTOFMEMORY))?.cast()
                }
                Dimensionality::T2D | Dimensionality::CubeMap => {
                    let misc = if t.dimensionality == Dimensionality::CubeMap {
                        D3D11_RESOURCE_MISC_TEXTURECUBE.0 as u32
                    } else {
                        0
                    };
                    let native = D3D11_TEXTURE2D_DESC {
                        Width: t.width,
                        Height: t.height,
                        MipLevels: t.mip_levels(),
                        ArraySize: t.array_layers(),
                        Format: format,
                        SampleDesc: DXGI_SAMPLE_DESC {
                            Count: t.sample_count.max(1),
                            Quality: 0,
                        },
                        Usage: usage,
                        BindFlags: bind,
                        CPUAccessFlags: cpu,
                        MiscFlags: misc,
                    };
                    let mut texture = None;
                    self.device.CreateTexture2D(&native, init_ptr, Some(&mut texture))?;
                    texture.ok_or_else(|| windows::core::Error::from(E_OUTOFMEMORY))?.cast()
                }
                Dimensionality::T3D => {
                    let native = D3D11_TEXTURE3D_DESC {
                        Width: t.width,
                        Height: t.height,
                        Depth: t.depth,
                        MipLevels: t.mip_levels(),
                        Format: format,
                        Usage: usage,
                        BindFlags: bind,
                        CPUAccessFlags: cpu,
                        MiscFlags: 0,
                    };
                    let mut texture = None;
                    self.device.CreateTexture3D(&native, init_ptr, Some(&mut texture))?;
                    texture.ok_or_else(|| windows::core::Error::from(E_OUTOFMEMORY))?.cast()
                }
            }
        }
    }

    fn create_buffer(
        &self,
        desc: &BufferDescriptor,
        init: Option<&[D3D11_SUBRESOURCE_DATA]>,
    ) -> windows::core::Result<ID3D11Resource> {
        let Shape::Linear(l) = &desc.shape else {
            return Err(E_INVALIDARG.into());
        };
        let mut misc = 0;
        let mut stride = 0;
        if desc.bind_flags.contains(BindFlags::STRUCTURED_BUFFER) {
            misc |= D3D11_RESOURCE_MISC_BUFFER_STRUCTURED.0 as u32;
            stride = l.structure_byte_size;
        }
        if desc.bind_flags.contains(BindFlags::DRAW_INDIRECT_ARGS) {
            misc |= D3D11_RESOURCE_MISC_DRAWINDIRECT_ARGS.0 as u32;
        }
        if desc.bind_flags.contains(BindFlags::RAW_VIEWS) {
            misc |= D3D11_RESOURCE_MISC_BUFFER_ALLOW_RAW_VIEWS.0 as u32;
        }
        let native = D3D11_BUFFER_DESC {
            ByteWidth: l.size_in_bytes,
            Usage: usage_for_desc(desc, init.is_none()),
            BindFlags: native_bind_flags(desc.bind_flags),
            CPUAccessFlags: native_cpu_access(desc),
            MiscFlags: misc,
            StructureByteStride: stride,
        };
        let mut buffer = None;
        // SAFETY: see `create_texture`.
        unsafe {
            self.device.CreateBuffer(
                &native,
                init.map(<[D3D11_SUBRESOURCE_DATA]>::as_ptr),
                Some(&mut buffer),
            )?;
        }
        buffer.ok_or_else(|| windows::core::Error::from(E_OUTOFMEMORY))?.cast()
    }
}

impl Backend for D3D11Device {
    type Resource = D3D11Resource;
    type Fence = D3D11Fence;

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_resource_initialisation: true,
            requires_staging_texture_upload: false,
            can_do_partial_maps: false,
            use_update_subresource_workaround: !self.immediate && !self.driver_command_lists,
            use_map_based_defrag: false,
            can_read_gpu_memory_directly: false,
            can_do_no_overwrite_map_in_background: self.driver_command_lists,
        }
    }

    fn is_immediate(&self) -> bool {
        self.immediate
    }

    fn create_resource(
        &self,
        desc: &BufferDescriptor,
        init: Option<&dyn DataSource>,
    ) -> Result<Arc<D3D11Resource>, BackendError> {
        // Creation data must cover every subresource; sparse sources are
        // written after creation instead
        let init_data: Option<Vec<D3D11_SUBRESOURCE_DATA>> = init.and_then(|source| {
            subresources(desc)
                .map(|sub| {
                    let data = source.subresource(sub);
                    (!data.is_empty()).then(|| D3D11_SUBRESOURCE_DATA {
                        pSysMem: data.data.as_ptr() as *const c_void,
                        SysMemPitch: data.pitches.row_pitch,
                        SysMemSlicePitch: data.pitches.slice_pitch,
                    })
                })
                .collect()
        });

        let created = match desc.shape {
            Shape::Texture(_) => self.create_texture(desc, init_data.as_deref()),
            Shape::Linear(_) => self.create_buffer(desc, init_data.as_deref()),
        }
        .map_err(backend_error)?;

        let resource = Arc::new(D3D11Resource {
            resource: created,
            desc: desc.clone(),
        });
        if let (Some(source), None) = (init, &init_data) {
            for sub in subresources(desc) {
                let data = source.subresource(sub);
                if data.is_empty() {
                    continue;
                }
                // SAFETY: full-subresource update from a slice the source owns.
                unsafe {
                    self.update_subresource(
                        &resource,
                        sub.index(desc.mip_levels()),
                        None,
                        data.data.as_ptr(),
                        data.pitches.row_pitch,
                        data.pitches.slice_pitch,
                    );
                }
            }
        }
        debug!("Created D3D11 resource {}", desc.summary());
        Ok(resource)
    }

    fn describe(&self, resource: &D3D11Resource) -> BufferDescriptor {
        let mut desc = resource.desc.clone();
        desc.name = self.debug_name(resource);
        desc
    }

    fn set_debug_name(&self, resource: &D3D11Resource, name: &str) {
        // SAFETY: the name bytes outlive the call.
        let result = unsafe {
            resource.resource.SetPrivateData(
                &WKPDID_D3DDebugObjectName,
                name.len() as u32,
                Some(name.as_ptr() as *const c_void),
            )
        };
        if let Err(e) = result {
            warn!("Failed to name resource '{}': {}", name, e);
        }
    }

    fn debug_name(&self, resource: &D3D11Resource) -> String {
        let mut buffer = [0u8; 256];
        let mut size = buffer.len() as u32;
        // SAFETY: `size` holds the capacity of `buffer`.
        let result = unsafe {
            resource.resource.GetPrivateData(
                &WKPDID_D3DDebugObjectName,
                &mut size,
                Some(buffer.as_mut_ptr() as *mut c_void),
            )
        };
        match result {
            Ok(()) => String::from_utf8_lossy(&buffer[..size as usize]).into_owned(),
            Err(_) => String::new(),
        }
    }

    unsafe fn update_subresource(
        &self,
        resource: &D3D11Resource,
        sub: u32,
        dst_box: Option<&CopyBox>,
        src: *const u8,
        row_pitch: u32,
        slice_pitch: u32,
    ) {
        let native = dst_box.map(native_box);
        self.context.UpdateSubresource(
            &resource.resource,
            sub,
            native.as_ref().map(|b| b as *const D3D11_BOX),
            src as *const c_void,
            row_pitch,
            slice_pitch,
        );
    }

    fn map(
        &self,
        resource: &D3D11Resource,
        sub: u32,
        mode: MapMode,
    ) -> Result<RawMapping, BackendError> {
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        // SAFETY: `mapped` is written by the call.
        unsafe {
            self.context
                .Map(&resource.resource, sub, native_map(mode), 0, Some(&mut mapped))
        }
        .map_err(backend_error)?;

        let len = match &resource.desc.shape {
            Shape::Linear(l) => l.size_in_bytes as usize,
            Shape::Texture(t) => {
                let mip = sub % t.mip_levels();
                let level = t.mip_level_shape(mip);
                let rows = t.pixel_format.row_count(level.height) as usize;
                let depth = level.depth.max(1) as usize;
                (depth - 1) * mapped.DepthPitch as usize
                    + (rows.max(1) - 1) * mapped.RowPitch as usize
                    + t.pixel_format.row_bytes(level.width) as usize
            }
        };
        let ptr = NonNull::new(mapped.pData as *mut u8).ok_or_else(|| {
            // SAFETY: the map above succeeded.
            unsafe { self.context.Unmap(&resource.resource, sub) };
            BackendError::Platform("map returned a null pointer".into())
        })?;
        Ok(RawMapping {
            ptr,
            len,
            pitches: SubresourcePitches::new(mapped.RowPitch, mapped.DepthPitch),
        })
    }

    fn unmap(&self, resource: &D3D11Resource, sub: u32) {
        // SAFETY: called once per successful map.
        unsafe { self.context.Unmap(&resource.resource, sub) };
    }

    fn copy_resource(&self, dst: &D3D11Resource, src: &D3D11Resource) {
        // SAFETY: both resources are live.
        unsafe { self.context.CopyResource(&dst.resource, &src.resource) };
    }

    fn copy_subresource_region(
        &self,
        dst: &D3D11Resource,
        dst_sub: u32,
        dst_origin: [u32; 3],
        src: &D3D11Resource,
        src_sub: u32,
        src_box: Option<&CopyBox>,
    ) {
        let native = src_box.map(native_box);
        // SAFETY: both resources are live; the box outlives the call.
        unsafe {
            self.context.CopySubresourceRegion(
                &dst.resource,
                dst_sub,
                dst_origin[0],
                dst_origin[1],
                dst_origin[2],
                &src.resource,
                src_sub,
                native.as_ref().map(|b| b as *const D3D11_BOX),
            );
        }
    }

    fn create_fence(&self) -> Option<D3D11Fence> {
        let desc = D3D11_QUERY_DESC {
            Query: D3D11_QUERY_EVENT,
            MiscFlags: 0,
        };
        let mut query = None;
        // SAFETY: `desc` outlives the call.
        match unsafe { self.device.CreateQuery(&desc, Some(&mut query)) } {
            Ok(()) => query.map(|query| D3D11Fence { query }),
            Err(e) => {
                warn!("CreateQuery failed: {}", e);
                None
            }
        }
    }

    fn end_fence(&self, fence: &D3D11Fence) {
        // SAFETY: the query is live.
        unsafe { self.context.End(&fence.query) };
    }

    fn is_fence_signaled(&self, fence: &D3D11Fence) -> bool {
        let mut done = windows::Win32::Foundation::BOOL(0);
        // SAFETY: `done` is large enough for an event query result. S_FALSE
        // leaves it untouched.
        let result = unsafe {
            self.context.GetData(
                &fence.query,
                Some(&mut done as *mut _ as *mut c_void),
                std::mem::size_of_val(&done) as u32,
                D3D11_ASYNC_GETDATA_DONOTFLUSH.0 as u32,
            )
        };
        result.is_ok() && done.as_bool()
    }
}
