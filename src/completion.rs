//! Completion Tracker Module
//!
//! Learns, without blocking, which logical events the GPU has finished.
//! A fixed pool of fence slots is shared by every producer thread. Slots are
//! claimed with a compare-and-swap and fences are issued in ticket order, so
//! the order on the command stream matches the order tickets were taken.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::backend::Backend;

/// Slot is free.
const UNALLOCATED: u64 = u64::MAX;
/// Slot is owned by one thread while it is being set up or inspected.
const TEMPORARY: u64 = u64::MAX - 1;

pub type EventId = u64;

struct FenceSlot<F> {
    assigned: AtomicU64,
    event_id: AtomicU64,
    fence: UnsafeCell<Option<F>>,
}

// SAFETY: `fence` is only touched by the thread that moved `assigned` to
// TEMPORARY, and that thread releases it with a Release store.
unsafe impl<F: Send> Sync for FenceSlot<F> {}

impl<F> FenceSlot<F> {
    fn new() -> Self {
        Self {
            assigned: AtomicU64::new(UNALLOCATED),
            event_id: AtomicU64::new(0),
            fence: UnsafeCell::new(None),
        }
    }

    /// Claim the slot if it currently holds `expected`.
    fn claim(&self, expected: u64) -> bool {
        self.assigned
            .compare_exchange(expected, TEMPORARY, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// # Safety
    ///
    /// The caller must hold the slot (it moved `assigned` to TEMPORARY).
    #[allow(clippy::mut_from_ref)]
    unsafe fn fence_mut(&self) -> &mut Option<F> {
        &mut *self.fence.get()
    }
}

/// Fixed pool of GPU fences keyed by logical event id.
pub struct CompletionTracker<B: Backend> {
    slots: Box<[FenceSlot<B::Fence>]>,
    next_ticket: AtomicU64,
    next_ticket_to_schedule: AtomicU64,
    last_completed: AtomicU64,
    spin_limit: u32,
    _backend: PhantomData<fn() -> B>,
}

impl<B: Backend> CompletionTracker<B> {
    /// Create a tracker with `pool_size` slots. Fences are created on first
    /// use. `spin_limit` bounds busy-waiting for a ticket before yielding.
    pub fn new(pool_size: usize, spin_limit: u32) -> Self {
        debug!("Creating completion tracker with {} fence slots", pool_size);
        Self {
            slots: (0..pool_size).map(|_| FenceSlot::new()).collect(),
            next_ticket: AtomicU64::new(1),
            next_ticket_to_schedule: AtomicU64::new(1),
            last_completed: AtomicU64::new(0),
            spin_limit,
            _backend: PhantomData,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    /// Highest event id known to be complete. Never decreases.
    pub fn last_completed_event(&self) -> EventId {
        self.last_completed.load(Ordering::Acquire)
    }

    /// Number of slots currently waiting on the GPU.
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| {
                let assigned = slot.assigned.load(Ordering::Acquire);
                assigned != UNALLOCATED
            })
            .count()
    }

    fn complete(&self, event_id: EventId) {
        self.last_completed.fetch_max(event_id, Ordering::AcqRel);
    }

    /// Record that all work submitted so far belongs to `event_id`.
    ///
    /// When every slot is busy the event is reported complete at once.
    pub fn trigger_event(&self, ctx: &B, event_id: EventId) {
        let Some(slot) = self.slots.iter().find(|slot| slot.claim(UNALLOCATED)) else {
            warn!(
                "Fence pool exhausted ({} slots); treating event {} as complete",
                self.slots.len(),
                event_id
            );
            self.complete(event_id);
            return;
        };

        let ticket = self.next_ticket.fetch_add(1, Ordering::AcqRel);
        let mut spins = 0u32;
        while self.next_ticket_to_schedule.load(Ordering::Acquire) != ticket {
            if spins < self.spin_limit {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }

        // SAFETY: this thread claimed the slot above.
        let fence = unsafe { slot.fence_mut() };
        if fence.is_none() {
            *fence = ctx.create_fence();
            if fence.is_none() {
                warn!("Fence creation failed; event {} completes on next update", event_id);
            }
        }
        if let Some(fence) = fence.as_ref() {
            ctx.end_fence(fence);
        }
        self.next_ticket_to_schedule.fetch_add(1, Ordering::AcqRel);

        slot.event_id.store(event_id, Ordering::Relaxed);
        slot.assigned.store(ticket, Ordering::Release);
    }

    /// Retire every slot whose fence has been reached.
    pub fn update(&self, ctx: &B) {
        for slot in self.slots.iter() {
            let ticket = slot.assigned.load(Ordering::Acquire);
            if ticket == UNALLOCATED || ticket == TEMPORARY || !slot.claim(ticket) {
                continue;
            }

            // SAFETY: claimed above.
            let fence = unsafe { slot.fence_mut() };
            let signaled = fence.as_ref().map_or(true, |f| ctx.is_fence_signaled(f));
            if signaled {
                self.complete(slot.event_id.load(Ordering::Relaxed));
                slot.assigned.store(UNALLOCATED, Ordering::Release);
            } else {
                slot.assigned.store(ticket, Ordering::Release);
            }
        }
    }

    /// Outstanding fences are meaningless after device loss; complete them.
    pub fn on_lost_device(&self) {
        let mut forced = 0usize;
        for slot in self.slots.iter() {
            let ticket = slot.assigned.load(Ordering::Acquire);
            if ticket == UNALLOCATED || ticket == TEMPORARY || !slot.claim(ticket) {
                continue;
            }
            self.complete(slot.event_id.load(Ordering::Relaxed));
            slot.assigned.store(UNALLOCATED, Ordering::Release);
            forced += 1;
        }
        info!("Device lost: force-completed {} in-flight events", forced);
    }

    /// Drop every fence so that fresh ones are created on next use.
    pub fn on_device_reset(&self) {
        self.on_lost_device();
        for slot in self.slots.iter() {
            if slot.claim(UNALLOCATED) {
                // SAFETY: claimed above.
                unsafe { *slot.fence_mut() = None };
                slot.assigned.store(UNALLOCATED, Ordering::Release);
            }
        }
        info!("Device reset: fence pool will be recreated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::software::{SoftwareConfig, SoftwareDevice};

    fn setup(pool_size: usize) -> (SoftwareDevice, CompletionTracker<SoftwareDevice>) {
        (
            SoftwareDevice::new(SoftwareConfig::default()),
            CompletionTracker::new(pool_size, 64),
        )
    }

    #[test]
    fn test_event_completes_after_gpu_retires() {
        let (dev, tracker) = setup(4);
        tracker.trigger_event(&dev, 7);
        tracker.update(&dev);
        assert_eq!(tracker.last_completed_event(), 0);
        assert_eq!(tracker.in_flight(), 1);

        dev.retire_all();
        tracker.update(&dev);
        assert_eq!(tracker.last_completed_event(), 7);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn test_missing_fence_completes_on_update() {
        let (dev, tracker) = setup(4);
        dev.set_fail_fence_creation(true);
        tracker.trigger_event(&dev, 3);
        assert_eq!(tracker.last_completed_event(), 0);
        tracker.update(&dev);
        assert_eq!(tracker.last_completed_event(), 3);
    }

    #[test]
    fn test_lost_device_force_completes() {
        let (dev, tracker) = setup(4);
        tracker.trigger_event(&dev, 1);
        tracker.trigger_event(&dev, 2);
        tracker.on_lost_device();
        assert_eq!(tracker.last_completed_event(), 2);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn test_reset_recreates_fences() {
        let (dev, tracker) = setup(2);
        tracker.trigger_event(&dev, 1);
        tracker.on_device_reset();
        assert_eq!(tracker.last_completed_event(), 1);

        tracker.trigger_event(&dev, 2);
        dev.retire_all();
        tracker.update(&dev);
        assert_eq!(tracker.last_completed_event(), 2);
    }

    #[test]
    fn test_completion_never_regresses() {
        let (dev, tracker) = setup(4);
        tracker.trigger_event(&dev, 10);
        dev.retire_all();
        tracker.update(&dev);
        tracker.trigger_event(&dev, 4);
        dev.retire_all();
        tracker.update(&dev);
        assert_eq!(tracker.last_completed_event(), 10);
    }
}
