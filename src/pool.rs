//! Streaming Pool Module
//!
//! A linear GPU buffer carved up by a [`SpanningHeap`]. When the free space
//! becomes too fragmented the pool compacts itself into a fresh buffer. The
//! copy waits until the GPU has finished the last event that read the old
//! buffer, so clients keep drawing from the old offsets until `tick` hands
//! back the relocations.

use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::Backend;
use crate::completion::{CompletionTracker, EventId};
use crate::defrag::{ActiveDefrag, DefragStep};
use crate::desc::{BindFlags, BufferDescriptor, CpuAccess};
use crate::error::Result;
use crate::heap::SpanningHeap;
use crate::upload::UploadContext;

struct PendingDefrag<R> {
    job: ActiveDefrag<R>,
    /// Layout the steps were planned against.
    heap_hash: u64,
}

/// A sub-allocated vertex/index/constant buffer that defragments itself.
pub struct StreamingPool<R> {
    heap: SpanningHeap,
    buffer: Arc<R>,
    desc: BufferDescriptor,
    pending: Option<PendingDefrag<R>>,
    last_use_event: EventId,
    defrag_threshold: u32,
    defrags_completed: u64,
}

impl<R> StreamingPool<R> {
    /// Create the backing buffer. Defrag starts once the fragmentation
    /// weight exceeds `defrag_threshold` bytes.
    pub fn new<B>(
        ctx: &UploadContext<'_, B>,
        name: &str,
        size: u32,
        bind_flags: BindFlags,
        defrag_threshold: u32,
    ) -> Result<Self>
    where
        B: Backend<Resource = R>,
    {
        let heap = SpanningHeap::new(size);
        let cpu_access = if ctx.capabilities().use_map_based_defrag {
            CpuAccess::READ | CpuAccess::WRITE
        } else if ctx.device().is_immediate() {
            CpuAccess::WRITE_DYNAMIC
        } else {
            CpuAccess::empty()
        };
        let desc = BufferDescriptor::linear(heap.heap_size(), bind_flags)
            .with_cpu_access(cpu_access)
            .named(name);
        let buffer = ctx.create_resource(&desc, None)?;
        info!("Streaming pool {} created ({} bytes)", desc.summary(), heap.heap_size());

        Ok(Self {
            heap,
            buffer,
            desc,
            pending: None,
            last_use_event: 0,
            defrag_threshold,
            defrags_completed: 0,
        })
    }

    pub fn buffer(&self) -> &Arc<R> {
        &self.buffer
    }

    pub fn desc(&self) -> &BufferDescriptor {
        &self.desc
    }

    pub fn heap(&self) -> &SpanningHeap {
        &self.heap
    }

    pub fn is_defrag_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn defrags_completed(&self) -> u64 {
        self.defrags_completed
    }

    /// Reserve `bytes` and return the offset. Any pending defrag plan is
    /// dropped since it no longer matches the heap.
    pub fn allocate(&mut self, bytes: u32) -> Option<u32> {
        let offset = self.heap.allocate(bytes)?;
        self.cancel_pending();
        Some(offset)
    }

    /// Release an allocation made by [`allocate`](Self::allocate).
    pub fn release(&mut self, offset: u32, bytes: u32) -> bool {
        let released = self.heap.deallocate(offset, bytes);
        if released {
            self.cancel_pending();
        }
        released
    }

    fn cancel_pending(&mut self) {
        if self.pending.take().is_some() {
            debug!("Pool '{}': heap changed, defrag plan dropped", self.desc.name);
        }
    }

    /// Write `data` into an allocation.
    pub fn write<B>(&self, ctx: &UploadContext<'_, B>, offset: u32, data: &[u8]) -> Result<usize>
    where
        B: Backend<Resource = R>,
    {
        ctx.push_to_buffer(&self.buffer, &self.desc, offset as usize, data)
    }

    /// Record that the GPU reads the buffer as part of `event`.
    pub fn note_use(&mut self, event: EventId) {
        self.last_use_event = self.last_use_event.max(event);
    }

    /// Advance the defrag state machine.
    ///
    /// Plans a compaction when the heap is fragmented past the threshold and
    /// commits it once the last use event has completed. Returns the steps
    /// applied on commit; allocations move with the span that contains them
    /// (see [`resolve_offset`](crate::defrag::resolve_offset)).
    pub fn tick<B>(
        &mut self,
        ctx: &UploadContext<'_, B>,
        tracker: &CompletionTracker<B>,
    ) -> Result<Vec<DefragStep>>
    where
        B: Backend<Resource = R>,
    {
        if let Some(pending) = self.pending.take() {
            if pending.heap_hash != self.heap.hash() {
                debug!("Pool '{}': stale defrag plan dropped", self.desc.name);
                return Ok(Vec::new());
            }
            let steps = pending.job.steps.clone();
            return match pending.job.try_commit(ctx, tracker) {
                Ok(compacted) => {
                    self.buffer = compacted;
                    self.heap.perform_defrag(&steps);
                    self.defrags_completed += 1;
                    info!(
                        "Pool '{}': defrag committed, {} spans moved, largest free block {}",
                        self.desc.name,
                        steps.len(),
                        self.heap.largest_free_block()
                    );
                    Ok(steps)
                }
                Err(job) => {
                    self.pending = Some(PendingDefrag {
                        job,
                        heap_hash: pending.heap_hash,
                    });
                    Ok(Vec::new())
                }
            };
        }

        let weight = self.heap.fragmentation_weight();
        if weight <= self.defrag_threshold {
            return Ok(Vec::new());
        }
        let steps = self.heap.calculate_defrag_steps();
        if steps.is_empty() {
            return Ok(Vec::new());
        }

        let destination = ctx.create_resource(&self.desc, None)?;
        debug!(
            "Pool '{}': fragmentation {} bytes, planned {} steps gated on event {}",
            self.desc.name,
            weight,
            steps.len(),
            self.last_use_event
        );
        self.pending = Some(PendingDefrag {
            job: ActiveDefrag {
                steps,
                source: self.buffer.clone(),
                destination,
                gate_event: self.last_use_event,
            },
            heap_hash: self.heap.hash(),
        });
        Ok(Vec::new())
    }
}
