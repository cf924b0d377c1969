//! Resource Tracker Module
//!
//! Optional observer attached to an [`UploadContext`](crate::upload::UploadContext).
//! It remembers every resource the context creates so that video memory use
//! can be totalled and reported, and it can probe how much memory is left.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tracing::{debug, info};

use crate::backend::Backend;
use crate::desc::{AllocationRules, BufferDescriptor, ResourceKind, TextureShape};
use crate::format::PixelFormat;

/// Edge length of the textures used to probe free video memory.
const HEADROOM_PROBE_DIM: u32 = 1024;

const MEGABYTE: f32 = 1024.0 * 1024.0;

/// Snapshot of one live resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferMetrics {
    pub name: String,
    pub desc: BufferDescriptor,
    pub video_memory_size: usize,
    pub system_memory_size: usize,
    /// Strong references held at the time of the snapshot.
    pub ref_count: usize,
}

/// Video memory totals split by resource kind and volatility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryTotals {
    pub texture: usize,
    pub buffer: usize,
    pub volatile_texture: usize,
    pub volatile_buffer: usize,
}

struct Entry<R> {
    desc: BufferDescriptor,
    resource: Weak<R>,
}

/// Registry of resources created through an upload context.
pub struct ResourceTracker<R> {
    entries: Mutex<Vec<Entry<R>>>,
    headroom: AtomicUsize,
    headroom_pending: AtomicBool,
}

impl<R> Default for ResourceTracker<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> ResourceTracker<R> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            headroom: AtomicUsize::new(0),
            headroom_pending: AtomicBool::new(false),
        }
    }

    /// Record a freshly created resource. Registering the same resource
    /// twice keeps the first entry.
    pub fn register(&self, resource: &Arc<R>, desc: &BufferDescriptor) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|e| e.resource.strong_count() > 0);
        let weak = Arc::downgrade(resource);
        if entries.iter().any(|e| Weak::ptr_eq(&e.resource, &weak)) {
            return;
        }
        debug!("Tracking {}", desc.summary());
        entries.push(Entry {
            desc: desc.clone(),
            resource: weak,
        });
    }

    /// Metrics for every resource still alive.
    pub fn metrics(&self) -> Vec<BufferMetrics> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter_map(|e| {
                // The upgrade itself holds one reference
                let resource = e.resource.upgrade()?;
                let video_memory_size = e.desc.video_memory_size();
                Some(BufferMetrics {
                    name: e.desc.name.clone(),
                    desc: e.desc.clone(),
                    video_memory_size,
                    system_memory_size: if video_memory_size == 0 {
                        e.desc.byte_count()
                    } else {
                        0
                    },
                    ref_count: Arc::strong_count(&resource) - 1,
                })
            })
            .collect()
    }

    pub fn live_count(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.iter().filter(|e| e.resource.strong_count() > 0).count()
    }

    pub fn totals(&self) -> MemoryTotals {
        let mut totals = MemoryTotals::default();
        for m in self.metrics() {
            let volatile = !m.desc.allocation.contains(AllocationRules::NON_VOLATILE);
            let slot = match (m.desc.kind(), volatile) {
                (ResourceKind::Texture, false) => &mut totals.texture,
                (ResourceKind::LinearBuffer, false) => &mut totals.buffer,
                (ResourceKind::Texture, true) => &mut totals.volatile_texture,
                (ResourceKind::LinearBuffer, true) => &mut totals.volatile_buffer,
            };
            *slot += m.video_memory_size;
        }
        totals
    }

    /// Human readable allocation report, also written to the log.
    pub fn report(&self, just_volatiles: bool) -> String {
        let totals = self.totals();
        let mut lines = vec![
            "Allocated resources report:".to_string(),
            format!(
                "Total for non-volatile texture objects: {:8.6}MB",
                totals.texture as f32 / MEGABYTE
            ),
            format!(
                "Total for non-volatile buffer objects : {:8.6}MB",
                totals.buffer as f32 / MEGABYTE
            ),
            format!(
                "Total for volatile texture objects : {:8.6}MB",
                totals.volatile_texture as f32 / MEGABYTE
            ),
            format!(
                "Total for volatile buffer objects : {:8.6}MB",
                totals.volatile_buffer as f32 / MEGABYTE
            ),
        ];

        for m in self.metrics() {
            if just_volatiles && m.desc.allocation.contains(AllocationRules::NON_VOLATILE) {
                continue;
            }
            lines.push(format!("{}  Ref count: {}", m.desc.summary(), m.ref_count));
        }

        let report = lines.join("\n");
        info!("{}", report);
        report
    }

    /// Ask for the headroom to be measured on the next
    /// [`recalculate_video_memory_headroom`](Self::recalculate_video_memory_headroom).
    pub fn schedule_video_memory_headroom_calculation(&self) {
        self.headroom_pending.store(true, Ordering::Release);
    }

    /// Measure free video memory by creating 1024x1024 RGBA8 textures until
    /// the device refuses or `probe_limit` textures exist. Every probe is
    /// released before returning. Does nothing unless a calculation was
    /// scheduled.
    pub fn recalculate_video_memory_headroom<B>(&self, device: &B, probe_limit: usize)
    where
        B: Backend<Resource = R>,
    {
        if !self.headroom_pending.swap(false, Ordering::AcqRel) {
            return;
        }

        let desc = BufferDescriptor::texture(TextureShape::new_2d(
            HEADROOM_PROBE_DIM,
            HEADROOM_PROBE_DIM,
            1,
            PixelFormat::R8G8B8A8Unorm,
        ))
        .named("headroom-probe");

        let mut probes = Vec::new();
        while probes.len() < probe_limit {
            match device.create_resource(&desc, None) {
                Ok(resource) => probes.push(resource),
                Err(e) => {
                    debug!("Headroom probe stopped after {}: {}", probes.len(), e);
                    break;
                }
            }
        }

        let headroom = desc.byte_count() * probes.len();
        self.headroom.store(headroom, Ordering::Release);
        info!(
            "Video memory headroom: {:.1}MB ({} probes)",
            headroom as f32 / MEGABYTE,
            probes.len()
        );
    }

    /// Result of the last headroom calculation, in bytes.
    pub fn video_memory_headroom(&self) -> usize {
        self.headroom.load(Ordering::Acquire)
    }
}
