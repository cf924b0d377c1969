//! GPU Uploads Soak Host
//!
//! Drives the upload engine against the software device:
//! 1. Churns allocations in a streaming vertex pool and writes them
//! 2. Pushes partial updates into a texture atlas
//! 3. Tracks GPU completion with the fence pool
//! 4. Lets the pool defragment itself and verifies moved data by readback

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gpu_uploads::defrag::{resolve_offset, DefragStep};
use gpu_uploads::desc::BindFlags;
use gpu_uploads::software::SoftwareResource;
use gpu_uploads::{
    Backend, BufferDescriptor, CompletionTracker, Config, DataSource, ImmediateData,
    PartialResource, PixelFormat, ResourceLocator, ResourceTracker, SoftwareDevice,
    StreamingPool, SubresourceId, SubresourcePitches, TextureShape, UpdateBox, UploadContext,
};

/// Edge length of the soak texture atlas.
const ATLAS_DIM: u32 = 256;
/// Edge length of one atlas tile update.
const ATLAS_TILE: u32 = 16;
const ATLAS_UPDATE_INTERVAL: u64 = 4;
const STATS_INTERVAL: u64 = 120;
const HEADROOM_PROBE_LIMIT: usize = 256;

/// A live pool allocation filled with one byte value.
#[derive(Debug, Clone, Copy)]
struct Allocation {
    offset: u32,
    size: u32,
    fill: u8,
}

#[derive(Debug, Default)]
struct SoakStats {
    frames: u64,
    bytes_uploaded: u64,
    allocations: u64,
    allocation_failures: u64,
    defrags: u64,
    relocated_spans: u64,
    texture_updates: u64,
    verify_failures: u64,
}

/// Soak host state
struct SoakHost {
    config: Config,
    shutdown: Arc<AtomicBool>,
    stats: SoakStats,
}

type Ctx<'a> = UploadContext<'a, SoftwareDevice>;

impl SoakHost {
    fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            stats: SoakStats::default(),
        }
    }

    /// Main frame loop
    fn run_loop(&mut self) -> Result<()> {
        let soak = self.config.soak.clone();
        let device = SoftwareDevice::new(self.config.software.clone());
        let capabilities = self
            .config
            .capabilities
            .unwrap_or_else(|| device.capabilities());
        let resources = Arc::new(ResourceTracker::new());
        let ctx = UploadContext::with_capabilities(&device, capabilities).with_tracker(resources.clone());
        let completion = CompletionTracker::<SoftwareDevice>::new(
            self.config.fence_pool_size,
            self.config.schedule_spin_limit,
        );

        let mut pool = StreamingPool::new(
            &ctx,
            "soak-vertices",
            soak.pool_size,
            BindFlags::VERTEX_BUFFER,
            soak.defrag_threshold,
        )?;
        let atlas_desc = BufferDescriptor::texture(TextureShape::new_2d(
            ATLAS_DIM,
            ATLAS_DIM,
            1,
            PixelFormat::R8G8B8A8Unorm,
        ))
        .named("soak-atlas");
        let atlas = ctx.create_resource(&atlas_desc, None)?;

        let mut rng = StdRng::seed_from_u64(soak.seed);
        let mut live: Vec<Allocation> = Vec::new();

        info!("Entering soak loop...");
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("Shutdown requested");
                break;
            }
            let frame = self.stats.frames;
            if soak.frames != 0 && frame >= soak.frames {
                break;
            }
            let event = frame + 1;

            // The emulated GPU catches up every `frames_in_flight` frames
            if frame % soak.frames_in_flight.max(1) == 0 {
                device.retire_all();
            }
            completion.update(&device);

            // Hold the heap still while a defrag plan waits for the GPU
            if !pool.is_defrag_pending() {
                self.churn(&ctx, &mut pool, &mut live, &mut rng, soak.max_allocation)?;
            }
            if frame % ATLAS_UPDATE_INTERVAL == 0 {
                self.update_atlas(&ctx, &atlas, &atlas_desc, &mut rng)?;
            }

            pool.note_use(event);
            completion.trigger_event(&device, event);

            let steps = pool.tick(&ctx, &completion)?;
            if !steps.is_empty() {
                self.relocate(&ctx, &pool, &mut live, &steps)?;
            }

            if frame % STATS_INTERVAL == 0 {
                let heap = pool.heap();
                info!(
                    "Frame {}: {} live, {} free ({} largest), {} defrags, completed event {} ({} in flight)",
                    frame,
                    live.len(),
                    heap.available_space(),
                    heap.largest_free_block(),
                    self.stats.defrags,
                    completion.last_completed_event(),
                    completion.in_flight()
                );
            }
            self.stats.frames += 1;
        }

        device.retire_all();
        completion.update(&device);
        info!(
            "Soak finished: {:?}, last completed event {}",
            self.stats,
            completion.last_completed_event()
        );
        resources.report(true);

        if self.config.software.memory_budget.is_some() {
            resources.schedule_video_memory_headroom_calculation();
            resources.recalculate_video_memory_headroom(&device, HEADROOM_PROBE_LIMIT);
        }
        Ok(())
    }

    /// Release some allocations and make a few new ones.
    fn churn(
        &mut self,
        ctx: &Ctx<'_>,
        pool: &mut StreamingPool<SoftwareResource>,
        live: &mut Vec<Allocation>,
        rng: &mut StdRng,
        max_allocation: u32,
    ) -> Result<()> {
        let releases = rng.gen_range(0..=live.len().min(6));
        for _ in 0..releases {
            let index = rng.gen_range(0..live.len());
            let alloc = live.swap_remove(index);
            if !pool.release(alloc.offset, alloc.size) {
                warn!("Release of {:?} rejected by the pool", alloc);
            }
        }

        for _ in 0..rng.gen_range(1..=4) {
            let size = rng.gen_range(16..=max_allocation.max(16));
            let Some(offset) = pool.allocate(size) else {
                self.stats.allocation_failures += 1;
                debug!("Pool full, {} byte allocation skipped", size);
                continue;
            };
            let fill = rng.gen::<u8>();
            let written = pool.write(ctx, offset, &vec![fill; size as usize])?;
            self.stats.bytes_uploaded += written as u64;
            self.stats.allocations += 1;
            live.push(Allocation { offset, size, fill });
        }
        Ok(())
    }

    /// Write one random tile of the atlas.
    fn update_atlas(
        &mut self,
        ctx: &Ctx<'_>,
        atlas: &Arc<SoftwareResource>,
        desc: &BufferDescriptor,
        rng: &mut StdRng,
    ) -> Result<()> {
        let x = rng.gen_range(0..ATLAS_DIM / ATLAS_TILE) * ATLAS_TILE;
        let y = rng.gen_range(0..ATLAS_DIM / ATLAS_TILE) * ATLAS_TILE;
        let row_pitch = ATLAS_TILE * 4;
        let tile = ImmediateData::new(1).with_subresource(
            SubresourceId::default(),
            vec![rng.gen::<u8>(); (row_pitch * ATLAS_TILE) as usize],
            SubresourcePitches::new(row_pitch, row_pitch * ATLAS_TILE),
        );
        let part = PartialResource::all().with_box(UpdateBox::new(x, y, x + ATLAS_TILE, y + ATLAS_TILE));
        let written = ctx.upload_texture(atlas, desc, &part, &tile)?;
        self.stats.bytes_uploaded += written as u64;
        self.stats.texture_updates += 1;
        Ok(())
    }

    /// Follow a committed defrag and check one moved allocation.
    fn relocate(
        &mut self,
        ctx: &Ctx<'_>,
        pool: &StreamingPool<SoftwareResource>,
        live: &mut [Allocation],
        steps: &[DefragStep],
    ) -> Result<()> {
        self.stats.defrags += 1;
        self.stats.relocated_spans += steps.len() as u64;
        for alloc in live.iter_mut() {
            match resolve_offset(alloc.offset, alloc.size, steps) {
                Some(offset) => alloc.offset = offset,
                None => {
                    error!("Allocation {:?} was not covered by the defrag", alloc);
                    self.stats.verify_failures += 1;
                }
            }
        }

        let Some(alloc) = live.first().copied() else {
            return Ok(());
        };
        let locator = ResourceLocator::range(
            pool.buffer().clone(),
            alloc.offset as usize,
            alloc.size as usize,
        );
        let readback = ctx.readback(&locator).context("reading back relocated data")?;
        let data = readback.get_data(SubresourceId::default());
        let size = alloc.size as usize;
        if data.len() < size || data[..size].iter().any(|b| *b != alloc.fill) {
            error!("Relocated allocation {:?} lost its content", alloc);
            self.stats.verify_failures += 1;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path).with_context(|| format!("loading config {}", path))?,
        None => Config::default(),
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("GPU uploads soak host starting...");
    info!("Configuration loaded: {:?}", config);

    let mut host = SoakHost::new(config);

    // Setup Ctrl+C handler
    let shutdown = host.shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        shutdown.store(true, Ordering::Relaxed);
    })
    .context("installing Ctrl+C handler")?;

    let result = host.run_loop();
    info!("Soak host shutting down");
    result?;

    if host.stats.verify_failures > 0 {
        anyhow::bail!(
            "{} relocated allocations failed verification",
            host.stats.verify_failures
        );
    }
    Ok(())
}
