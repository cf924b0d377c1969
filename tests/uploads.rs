//! Upload, mapping and readback behaviour against the software device.

use std::sync::mpsc;

use gpu_uploads::desc::{BindFlags, CpuAccess};
use gpu_uploads::{
    Backend, BufferDescriptor, Capabilities, DataSource, DeferredData, ImmediateData, MapMode,
    PartialResource, PixelFormat, ResourceLocator, SoftwareConfig, SoftwareDevice, SubresourceId,
    SubresourcePitches, TextureShape, UpdateBox, UploadContext, UploadError,
};

fn rgba(width: u32, height: u32, mips: u32) -> BufferDescriptor {
    BufferDescriptor::texture(TextureShape::new_2d(
        width,
        height,
        mips,
        PixelFormat::R8G8B8A8Unorm,
    ))
}

/// 4 bytes per pixel, each byte set to the pixel's row-major index.
fn numbered_pixels(width: u32, height: u32) -> Vec<u8> {
    (0..width * height)
        .flat_map(|i| [i as u8; 4])
        .collect()
}

#[test]
fn test_sparse_source_skips_empty_subresources() {
    let device = SoftwareDevice::new(SoftwareConfig::default());
    let ctx = UploadContext::new(&device);
    let desc = rgba(8, 8, 4);
    let texture = ctx.create_resource(&desc, None).unwrap();

    let shape = *desc.texture_shape().unwrap();
    let source = ImmediateData::for_texture(&shape, |sub, pitches| {
        (sub.mip % 2 == 0).then(|| vec![0xAB; pitches.slice_pitch as usize])
    });
    let copied = ctx
        .push_to_texture(&texture, &desc, UpdateBox::default(), &source)
        .unwrap();

    assert_eq!(copied, 256 + 16);
    assert_eq!(device.counters().updates, 2);
    assert!(device.contents(&texture, 0).iter().all(|b| *b == 0xAB));
    assert!(device.contents(&texture, 1).iter().all(|b| *b == 0));
    assert!(device.contents(&texture, 2).iter().all(|b| *b == 0xAB));
    assert!(device.contents(&texture, 3).iter().all(|b| *b == 0));
}

#[test]
fn test_block_compressed_box_round_trip() {
    let device = SoftwareDevice::new(SoftwareConfig::default());
    let ctx = UploadContext::new(&device);
    let desc = BufferDescriptor::texture(TextureShape::new_2d(16, 16, 1, PixelFormat::Bc1Unorm));
    let texture = ctx.create_resource(&desc, None).unwrap();

    // 8x8 pixels = 2x2 blocks of 8 bytes
    let blocks: Vec<u8> = (1..=32).collect();
    let source = ImmediateData::new(1).with_subresource(
        SubresourceId::default(),
        blocks.clone(),
        SubresourcePitches::new(16, 32),
    );
    ctx.push_to_texture(&texture, &desc, UpdateBox::new(4, 4, 12, 12), &source)
        .unwrap();

    let readback = ctx.readback(&ResourceLocator::whole(texture.clone())).unwrap();
    let pitches = readback.get_pitches(SubresourceId::default());
    assert_eq!(pitches.row_pitch, 32);
    let data = readback.get_data(SubresourceId::default());
    assert_eq!(data.len(), 128);
    assert_eq!(&data[40..56], &blocks[..16]);
    assert_eq!(&data[72..88], &blocks[16..]);
    // Outside the box nothing was written
    assert!(data[..40].iter().all(|b| *b == 0));
    assert!(data[88..].iter().all(|b| *b == 0));
}

#[test]
fn test_readback_honors_locator_offset() {
    let device = SoftwareDevice::new(SoftwareConfig::default());
    let ctx = UploadContext::new(&device);
    let desc = BufferDescriptor::linear(64, BindFlags::VERTEX_BUFFER).named("shared");
    let buffer = ctx
        .create_resource(&desc, Some(&ImmediateData::from_bytes((0..64).collect())))
        .unwrap();
    let created = device.counters().resources_created;

    let readback = ctx
        .readback(&ResourceLocator::range(buffer.clone(), 16, 8))
        .unwrap();
    // Not CPU readable, so a staging copy was made
    assert_eq!(device.counters().resources_created, created + 1);
    assert_eq!(readback.offset(), 16);
    assert_eq!(readback.get_data(SubresourceId::default())[0], 16);
    assert_eq!(readback.get_data_size(SubresourceId::default()), 48);
    assert!(readback.get_data(SubresourceId::new(1, 0)).is_empty());
}

#[test]
fn test_readback_of_cpu_readable_resource_maps_in_place() {
    let device = SoftwareDevice::new(SoftwareConfig::default());
    let ctx = UploadContext::new(&device);
    let desc = BufferDescriptor::linear(32, BindFlags::CONSTANT_BUFFER)
        .with_cpu_access(CpuAccess::READ | CpuAccess::WRITE);
    let buffer = ctx
        .create_resource(&desc, Some(&ImmediateData::from_bytes(vec![7; 32])))
        .unwrap();
    let created = device.counters().resources_created;

    {
        let readback = ctx.readback(&ResourceLocator::whole(buffer.clone())).unwrap();
        assert_eq!(readback.get_data(SubresourceId::default()), &[7; 32][..]);
    }
    assert_eq!(device.counters().resources_created, created);
    assert_eq!(device.counters().maps, device.counters().unmaps);
}

#[test]
fn test_readback_map_failure_is_reported() {
    let device = SoftwareDevice::new(SoftwareConfig::default());
    let ctx = UploadContext::new(&device);
    let desc = BufferDescriptor::linear(32, BindFlags::VERTEX_BUFFER);
    let buffer = ctx.create_resource(&desc, None).unwrap();

    device.fail_next_maps(1);
    assert!(matches!(
        ctx.readback(&ResourceLocator::whole(buffer)),
        Err(UploadError::MapFailed { subresource: 0, .. })
    ));
}

#[test]
fn test_mapped_region_unmaps_once_after_move_and_take() {
    let device = SoftwareDevice::new(SoftwareConfig::default());
    let ctx = UploadContext::new(&device);
    let desc = BufferDescriptor::linear(16, BindFlags::VERTEX_BUFFER).with_cpu_access(CpuAccess::WRITE);
    let buffer = ctx.create_resource(&desc, None).unwrap();

    let mut first = ctx.map(&buffer, MapMode::Write, 0);
    assert!(first.is_mapped());
    let taken = first.take();
    assert!(!first.is_mapped());
    drop(first);
    assert_eq!(device.counters().unmaps, 0);

    let mut moved = taken;
    moved.data_mut()[0] = 42;
    drop(moved);
    assert_eq!(device.counters().maps, 1);
    assert_eq!(device.counters().unmaps, 1);
    assert_eq!(device.contents(&buffer, 0)[0], 42);

    // Exclusive mapping was released
    assert!(ctx.map(&buffer, MapMode::Write, 0).is_mapped());
}

#[test]
fn test_map_partial_requires_capability() {
    let device = SoftwareDevice::new(SoftwareConfig::default());
    let ctx = UploadContext::new(&device);
    let desc = BufferDescriptor::linear(64, BindFlags::VERTEX_BUFFER).with_cpu_access(CpuAccess::WRITE);
    let buffer = ctx.create_resource(&desc, None).unwrap();
    assert!(matches!(
        ctx.map_partial(&buffer, MapMode::Write, 16, 16, 0),
        Err(UploadError::Unsupported { operation: "map_partial" })
    ));

    let device = SoftwareDevice::new(SoftwareConfig {
        partial_maps: true,
        ..Default::default()
    });
    let ctx = UploadContext::new(&device);
    let buffer = ctx.create_resource(&desc, None).unwrap();
    let mut region = ctx.map_partial(&buffer, MapMode::Write, 16, 16, 0).unwrap();
    assert_eq!(region.len(), 16);
    region.data_mut().fill(9);
    drop(region);
    let contents = device.contents(&buffer, 0);
    assert!(contents[16..32].iter().all(|b| *b == 9));
    assert!(contents[..16].iter().all(|b| *b == 0));
}

#[test]
fn test_dynamic_buffer_write_at_offset() {
    let device = SoftwareDevice::new(SoftwareConfig::default());
    let ctx = UploadContext::new(&device);
    let desc = BufferDescriptor::linear(64, BindFlags::VERTEX_BUFFER)
        .with_cpu_access(CpuAccess::WRITE_DYNAMIC);
    let buffer = ctx.create_resource(&desc, None).unwrap();

    assert_eq!(ctx.push_to_buffer(&buffer, &desc, 8, &[5; 8]).unwrap(), 8);
    assert_eq!(device.counters().maps, 1);
    assert_eq!(&device.contents(&buffer, 0)[8..16], &[5; 8]);

    // A failed map drops the write instead of failing
    device.fail_next_maps(1);
    assert_eq!(ctx.push_to_buffer(&buffer, &desc, 0, &[1; 4]).unwrap(), 0);
    assert!(matches!(
        ctx.push_to_buffer(&buffer, &desc, 60, &[1; 8]),
        Err(UploadError::OutOfBounds { offset: 60, len: 8, capacity: 64 })
    ));
}

#[test]
#[should_panic(expected = "discard map")]
fn test_discard_map_at_offset_panics() {
    let device = SoftwareDevice::new(SoftwareConfig {
        immediate: false,
        driver_command_lists: false,
        ..Default::default()
    });
    let ctx = UploadContext::new(&device);
    let desc = BufferDescriptor::linear(64, BindFlags::VERTEX_BUFFER)
        .with_cpu_access(CpuAccess::WRITE_DYNAMIC)
        .named("dynamic");
    let buffer = ctx.create_resource(&desc, None).unwrap();
    let _ = ctx.push_to_buffer(&buffer, &desc, 8, &[1; 8]);
}

#[test]
fn test_background_no_overwrite_writes_at_offset() {
    let device = SoftwareDevice::new(SoftwareConfig {
        immediate: false,
        driver_command_lists: true,
        ..Default::default()
    });
    let ctx = UploadContext::new(&device);
    assert!(ctx.capabilities().can_do_no_overwrite_map_in_background);
    let desc = BufferDescriptor::linear(64, BindFlags::VERTEX_BUFFER)
        .with_cpu_access(CpuAccess::WRITE_DYNAMIC);
    let buffer = ctx.create_resource(&desc, None).unwrap();

    ctx.push_to_buffer(&buffer, &desc, 0, &[2; 8]).unwrap();
    assert_eq!(ctx.push_to_buffer(&buffer, &desc, 8, &[7; 8]).unwrap(), 8);
    let contents = device.contents(&buffer, 0);
    assert_eq!(&contents[..8], &[2; 8]);
    assert_eq!(&contents[8..16], &[7; 8]);
    assert_eq!(device.counters().maps, device.counters().unmaps);
}

#[test]
fn test_workaround_flag_follows_device_on_immediate_context() {
    let device = SoftwareDevice::new(SoftwareConfig::default());
    let forced = Capabilities {
        use_update_subresource_workaround: true,
        ..device.capabilities()
    };
    let ctx = UploadContext::with_capabilities(&device, forced);
    assert!(!ctx.capabilities().use_update_subresource_workaround);

    let desc = BufferDescriptor::linear(4096, BindFlags::VERTEX_BUFFER);
    let buffer = ctx.create_resource(&desc, None).unwrap();
    ctx.push_to_buffer(&buffer, &desc, 2048, &[0xAB; 16]).unwrap();
    let contents = device.contents(&buffer, 0);
    assert!(contents[2048..2064].iter().all(|b| *b == 0xAB));
    assert!(contents[..2048].iter().all(|b| *b == 0));
    assert!(contents[2064..].iter().all(|b| *b == 0));
}

#[test]
fn test_workaround_flag_follows_device_on_deferred_context() {
    let device = SoftwareDevice::new(SoftwareConfig {
        immediate: false,
        driver_command_lists: false,
        ..Default::default()
    });
    let cleared = Capabilities {
        use_update_subresource_workaround: false,
        ..device.capabilities()
    };
    let ctx = UploadContext::with_capabilities(&device, cleared);
    assert!(ctx.capabilities().use_update_subresource_workaround);

    let desc = BufferDescriptor::linear(4096, BindFlags::VERTEX_BUFFER);
    let buffer = ctx.create_resource(&desc, None).unwrap();
    ctx.push_to_buffer(&buffer, &desc, 2048, &[0xAB; 16]).unwrap();
    let contents = device.contents(&buffer, 0);
    assert!(contents[2048..2064].iter().all(|b| *b == 0xAB));
    assert!(contents[..2048].iter().all(|b| *b == 0));
}

#[test]
fn test_deferred_context_partial_updates_land_correctly() {
    let device = SoftwareDevice::new(SoftwareConfig {
        immediate: false,
        driver_command_lists: false,
        ..Default::default()
    });
    let ctx = UploadContext::new(&device);
    assert!(ctx.capabilities().use_update_subresource_workaround);

    let desc = rgba(16, 8, 1);
    let texture = ctx.create_resource(&desc, None).unwrap();
    let pixels = numbered_pixels(4, 4);
    let source = ImmediateData::new(1).with_subresource(
        SubresourceId::default(),
        pixels.clone(),
        SubresourcePitches::new(16, 64),
    );
    ctx.push_to_texture(&texture, &desc, UpdateBox::new(4, 2, 8, 6), &source)
        .unwrap();

    let contents = device.contents(&texture, 0);
    for row in 0..4usize {
        let start = (row + 2) * 64 + 4 * 4;
        assert_eq!(&contents[start..start + 16], &pixels[row * 16..row * 16 + 16]);
    }

    let buffer_desc = BufferDescriptor::linear(64, BindFlags::VERTEX_BUFFER);
    let buffer = ctx.create_resource(&buffer_desc, None).unwrap();
    ctx.push_to_buffer(&buffer, &buffer_desc, 24, &[3; 16]).unwrap();
    let contents = device.contents(&buffer, 0);
    assert!(contents[24..40].iter().all(|b| *b == 3));
    assert!(contents[..24].iter().all(|b| *b == 0));
}

#[test]
fn test_staged_partial_texture_upload() {
    let device = SoftwareDevice::new(SoftwareConfig {
        staging_texture_upload: true,
        ..Default::default()
    });
    let ctx = UploadContext::new(&device);
    assert!(ctx.capabilities().requires_staging_texture_upload);

    let desc = rgba(16, 16, 1).named("atlas");
    let texture = ctx.create_resource(&desc, None).unwrap();
    let pixels = numbered_pixels(8, 4);
    let source = ImmediateData::new(1).with_subresource(
        SubresourceId::default(),
        pixels.clone(),
        SubresourcePitches::new(32, 128),
    );
    let part = PartialResource::all().with_box(UpdateBox::new(8, 4, 16, 8));
    ctx.upload_texture(&texture, &desc, &part, &source).unwrap();

    assert_eq!(device.counters().region_copies, 1);
    assert_eq!(device.counters().updates, 0);
    let contents = device.contents(&texture, 0);
    for row in 0..4usize {
        let start = (row + 4) * 64 + 8 * 4;
        assert_eq!(&contents[start..start + 32], &pixels[row * 32..row * 32 + 32]);
    }
    assert!(contents[..4 * 64].iter().all(|b| *b == 0));
}

#[test]
fn test_staged_box_at_origin_copies_region_only() {
    let device = SoftwareDevice::new(SoftwareConfig {
        staging_texture_upload: true,
        ..Default::default()
    });
    let ctx = UploadContext::new(&device);
    let desc = rgba(16, 16, 1);
    let texture = ctx.create_resource(&desc, None).unwrap();
    let pixels = numbered_pixels(8, 8);
    let source = ImmediateData::new(1).with_subresource(
        SubresourceId::default(),
        pixels.clone(),
        SubresourcePitches::new(32, 256),
    );
    let part = PartialResource::all().with_box(UpdateBox::new(0, 0, 8, 8));
    ctx.upload_texture(&texture, &desc, &part, &source).unwrap();

    assert_eq!(device.counters().region_copies, 1);
    assert_eq!(device.counters().resource_copies, 0);
    let contents = device.contents(&texture, 0);
    for row in 0..16usize {
        let line = &contents[row * 64..row * 64 + 64];
        if row < 8 {
            assert_eq!(&line[..32], &pixels[row * 32..row * 32 + 32]);
            assert!(line[32..].iter().all(|b| *b == 0));
        } else {
            assert!(line.iter().all(|b| *b == 0));
        }
    }
}

#[test]
fn test_invalid_update_box_is_rejected() {
    let device = SoftwareDevice::new(SoftwareConfig::default());
    let ctx = UploadContext::new(&device);
    let desc = rgba(16, 16, 1);
    let texture = ctx.create_resource(&desc, None).unwrap();
    let source = ImmediateData::new(1).with_subresource(
        SubresourceId::default(),
        vec![1; 16 * 16 * 4],
        SubresourcePitches::new(64, 1024),
    );

    for update_box in [UpdateBox::new(8, 0, 4, 4), UpdateBox::new(12, 12, 20, 20)] {
        assert!(matches!(
            ctx.push_to_texture(&texture, &desc, update_box, &source),
            Err(UploadError::InvalidDescriptor(_))
        ));
    }
    assert_eq!(device.counters().updates, 0);
    assert!(device.contents(&texture, 0).iter().all(|b| *b == 0));
}

#[test]
fn test_lod_subset_upload_numbers_source_from_lod_min() {
    let device = SoftwareDevice::new(SoftwareConfig::default());
    let ctx = UploadContext::new(&device);
    let desc = rgba(16, 16, 5);
    let texture = ctx.create_resource(&desc, None).unwrap();

    // Source mip 0 feeds destination mip 2 (4x4)
    let source = ImmediateData::new(2)
        .with_subresource(SubresourceId::new(0, 0), vec![0x22; 64], SubresourcePitches::new(16, 64))
        .with_subresource(SubresourceId::new(1, 0), vec![0x33; 16], SubresourcePitches::new(8, 16));
    let part = PartialResource::all().with_lods(2, 3);
    ctx.upload_texture(&texture, &desc, &part, &source).unwrap();

    assert!(device.contents(&texture, 1).iter().all(|b| *b == 0));
    assert!(device.contents(&texture, 2).iter().all(|b| *b == 0x22));
    assert!(device.contents(&texture, 3).iter().all(|b| *b == 0x33));
    assert!(device.contents(&texture, 4).iter().all(|b| *b == 0));
}

#[tokio::test]
async fn test_deferred_source_is_not_ready_until_loaded() {
    let device = SoftwareDevice::new(SoftwareConfig::default());
    let ctx = UploadContext::new(&device);
    let desc = rgba(4, 4, 1);
    let texture = ctx.create_resource(&desc, None).unwrap();

    let (release, gate) = mpsc::channel::<()>();
    let source = DeferredData::spawn("streamed", move || {
        let _ = gate.recv();
        Ok(ImmediateData::new(1).with_subresource(
            SubresourceId::default(),
            vec![0x5A; 64],
            SubresourcePitches::new(16, 64),
        ))
    });

    assert!(matches!(
        ctx.push_to_texture(&texture, &desc, UpdateBox::default(), &source),
        Err(UploadError::SourceNotReady)
    ));
    assert!(matches!(
        ctx.create_resource(&desc, Some(&source)),
        Err(UploadError::SourceNotReady)
    ));
    assert_eq!(device.counters().updates, 0);

    release.send(()).unwrap();
    source.marker().wait().await;
    assert_eq!(
        ctx.push_to_texture(&texture, &desc, UpdateBox::default(), &source)
            .unwrap(),
        64
    );
    assert!(device.contents(&texture, 0).iter().all(|b| *b == 0x5A));
}
