//! Defragmentation Module
//!
//! Replays byte-range relocations from a fragmented buffer into a compacted
//! one, either as GPU region copies or as CPU copies between mappings.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{Backend, CopyBox, MapMode};
use crate::completion::{CompletionTracker, EventId};
use crate::upload::UploadContext;

/// Move `[source_start, source_end)` to `destination`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DefragStep {
    pub source_start: u32,
    pub source_end: u32,
    pub destination: u32,
}

impl DefragStep {
    pub const fn new(source_start: u32, source_end: u32, destination: u32) -> Self {
        Self {
            source_start,
            source_end,
            destination,
        }
    }

    pub const fn len(&self) -> u32 {
        self.source_end - self.source_start
    }

    pub const fn is_empty(&self) -> bool {
        self.source_end <= self.source_start
    }
}

fn destinations_disjoint(steps: &[DefragStep]) -> bool {
    let mut ranges: Vec<(u32, u32)> = steps
        .iter()
        .map(|s| (s.destination, s.destination + s.len()))
        .collect();
    ranges.sort_unstable();
    ranges.windows(2).all(|w| w[0].1 <= w[1].0)
}

/// Copy each step's source range from `src` into `dst`, in list order.
///
/// Destination ranges must not overlap. Returns `false` when either map of
/// the map-based strategy fails, in which case nothing was copied.
pub fn apply_defrag_steps<B: Backend>(
    ctx: &UploadContext<'_, B>,
    dst: &Arc<B::Resource>,
    src: &Arc<B::Resource>,
    steps: &[DefragStep],
) -> bool {
    debug_assert!(destinations_disjoint(steps), "overlapping defrag destinations");

    if !ctx.capabilities().use_map_based_defrag {
        for step in steps {
            assert!(!step.is_empty(), "empty defrag step {:?}", step);
            let source_box = CopyBox::bytes(step.source_start, step.source_end);
            ctx.device().copy_subresource_region(
                dst,
                0,
                [step.destination, 0, 0],
                src,
                0,
                Some(&source_box),
            );
        }
        debug!("Defrag: {} region copies", steps.len());
        return true;
    }

    let source = ctx.map(src, MapMode::Read, 0);
    let mut destination = ctx.map(dst, MapMode::Discard, 0);
    if !source.is_mapped() || !destination.is_mapped() {
        warn!("Defrag postponed: could not map source and destination");
        return false;
    }

    let mut moved = 0usize;
    for step in steps {
        assert!(!step.is_empty(), "empty defrag step {:?}", step);
        let from = step.source_start as usize..step.source_end as usize;
        let to = step.destination as usize..(step.destination + step.len()) as usize;
        if from.end > source.len() || to.end > destination.len() {
            warn!("Defrag step {:?} outside mapped buffers; skipped", step);
            continue;
        }
        destination.data_mut()[to].copy_from_slice(&source.data()[from]);
        moved += step.len() as usize;
    }
    debug!("Defrag: {} bytes moved through maps", moved);
    true
}

/// New offset of the block `[offset, offset + size)` after `steps`, or
/// `None` if no step moved it whole.
pub fn resolve_offset(offset: u32, size: u32, steps: &[DefragStep]) -> Option<u32> {
    steps
        .iter()
        .find(|s| offset >= s.source_start && offset + size <= s.source_end)
        .map(|s| s.destination + (offset - s.source_start))
}

/// A planned defrag waiting for the GPU to finish with the old layout.
pub struct ActiveDefrag<R> {
    pub steps: Vec<DefragStep>,
    pub source: Arc<R>,
    pub destination: Arc<R>,
    /// Last event that read `source`.
    pub gate_event: EventId,
}

impl<R> ActiveDefrag<R> {
    pub fn is_ready<B>(&self, tracker: &CompletionTracker<B>) -> bool
    where
        B: Backend<Resource = R>,
    {
        tracker.last_completed_event() >= self.gate_event
    }

    /// Apply the steps once `gate_event` has completed. Returns the
    /// compacted buffer, or gives the job back if it is not safe yet or the
    /// copy could not run.
    pub fn try_commit<B>(
        self,
        ctx: &UploadContext<'_, B>,
        tracker: &CompletionTracker<B>,
    ) -> Result<Arc<R>, Self>
    where
        B: Backend<Resource = R>,
    {
        if !self.is_ready(tracker) {
            return Err(self);
        }
        if !apply_defrag_steps(ctx, &self.destination, &self.source, &self.steps) {
            return Err(self);
        }
        Ok(self.destination)
    }
}

impl<R> std::fmt::Debug for ActiveDefrag<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveDefrag")
            .field("steps", &self.steps.len())
            .field("gate_event", &self.gate_event)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::ImmediateData;
    use crate::desc::{BindFlags, BufferDescriptor};
    use crate::software::{SoftwareConfig, SoftwareDevice};

    #[test]
    fn test_resolve_offset() {
        let steps = [DefragStep::new(32, 64, 0), DefragStep::new(96, 160, 32)];
        assert_eq!(resolve_offset(32, 32, &steps), Some(0));
        assert_eq!(resolve_offset(112, 16, &steps), Some(48));
        assert_eq!(resolve_offset(64, 16, &steps), None);
    }

    #[test]
    fn test_destinations_disjoint() {
        assert!(destinations_disjoint(&[
            DefragStep::new(0, 16, 16),
            DefragStep::new(16, 32, 0)
        ]));
        assert!(!destinations_disjoint(&[
            DefragStep::new(0, 16, 8),
            DefragStep::new(16, 32, 0)
        ]));
    }

    #[test]
    fn test_gate_holds_until_event_completes() {
        let device = SoftwareDevice::new(SoftwareConfig::default());
        let ctx = UploadContext::new(&device);
        let tracker = CompletionTracker::new(4, 16);
        let desc = BufferDescriptor::linear(64, BindFlags::VERTEX_BUFFER);
        let source = ctx
            .create_resource(&desc, Some(&ImmediateData::from_bytes((0..64).collect())))
            .unwrap();
        let destination = ctx.create_resource(&desc, None).unwrap();

        tracker.trigger_event(&device, 5);
        let job = ActiveDefrag {
            steps: vec![DefragStep::new(16, 32, 0)],
            source,
            destination,
            gate_event: 5,
        };
        let job = job.try_commit(&ctx, &tracker).unwrap_err();
        assert_eq!(device.counters().region_copies, 0);

        device.retire_all();
        tracker.update(&device);
        let compacted = job.try_commit(&ctx, &tracker).unwrap();
        assert_eq!(&device.contents(&compacted, 0)[..16], &(16..32).collect::<Vec<u8>>()[..]);
    }

    #[test]
    fn test_map_failure_hands_job_back() {
        let device = SoftwareDevice::new(SoftwareConfig {
            region_copy_reliable: false,
            ..Default::default()
        });
        let ctx = UploadContext::new(&device);
        let tracker = CompletionTracker::new(4, 16);
        let desc = BufferDescriptor::linear(64, BindFlags::VERTEX_BUFFER)
            .with_cpu_access(crate::desc::CpuAccess::READ | crate::desc::CpuAccess::WRITE);
        let source = ctx
            .create_resource(&desc, Some(&ImmediateData::from_bytes((0..64).collect())))
            .unwrap();
        let destination = ctx.create_resource(&desc, None).unwrap();
        let job = ActiveDefrag {
            steps: vec![DefragStep::new(16, 32, 0)],
            source,
            destination,
            gate_event: 0,
        };

        device.fail_next_maps(1);
        let job = job.try_commit(&ctx, &tracker).unwrap_err();
        assert!(device.contents(&job.destination, 0).iter().all(|b| *b == 0));
        assert_eq!(device.counters().maps, device.counters().unmaps);

        let compacted = job.try_commit(&ctx, &tracker).unwrap();
        assert_eq!(&device.contents(&compacted, 0)[..16], &(16..32).collect::<Vec<u8>>()[..]);
    }
}
