//! The event scheduler.
//!
//! A min-heap of (deadline, owner, callback tag) triples. `arm(handle,
//! delta)` sets `deadline = now + delta` and reheaps; `disarm(handle)`
//! marks the event inert and is lazily dropped once it reaches the heap
//! root. `tick(now)` repeatedly pops the root while `deadline <= now` and
//! dispatches to the event's owner. Reentrancy (a callback arming new
//! events, including itself) is permitted; deadline monotonicity bounds
//! it — nothing fires "in the past" relative to the `now` passed in.

use crate::device::DeviceId;
use crate::error::{CoreError, CoreResult};
use crate::time::VirtualTime;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Stable handle to a scheduled event slot. Carries a generation counter
/// so arming a handle whose owner has been destroyed (and whose slot was
/// reused or freed) is caught rather than silently corrupting unrelated
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle {
    index: u32,
    generation: u32,
}

/// An opaque per-device discriminator for "which timer is this" — devices
/// with more than one armed event (e.g. the CRTC's dispon/dispoff pair, or
/// the UART's shift/timeout timers) use this to tell them apart inside
/// their `Device::tick` callback.
pub type TimerTag = u32;

struct Slot {
    owner: DeviceId,
    tag: TimerTag,
    generation: u32,
    armed: bool,
    deadline: VirtualTime,
    live: bool, // false once freed via `retire`
}

#[derive(Clone, Copy, Eq, PartialEq)]
struct HeapKey {
    deadline: VirtualTime,
    seq: u64,
    index: u32,
    generation: u32,
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline (and,
        // among ties, the earliest arm sequence number) sits at the root.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Receives fired events from [`EventScheduler::tick`]. The registry
/// implements this by dispatching to `Device::tick`.
pub trait EventSink {
    fn fire(&mut self, owner: DeviceId, tag: TimerTag, now: VirtualTime);
}

#[derive(Default)]
pub struct EventScheduler {
    slots: Vec<Slot>,
    heap: BinaryHeap<HeapKey>,
    next_seq: u64,
}

impl EventScheduler {
    pub fn new() -> Self {
        Self { slots: Vec::new(), heap: BinaryHeap::new(), next_seq: 0 }
    }

    /// Allocate a new, initially disarmed event slot for `owner`.
    pub fn alloc(&mut self, owner: DeviceId, tag: TimerTag) -> EventHandle {
        let index = self.slots.len() as u32;
        self.slots.push(Slot { owner, tag, generation: 0, armed: false, deadline: VirtualTime::ZERO, live: true });
        EventHandle { index, generation: 0 }
    }

    /// Retire a slot permanently (called when its owning device is
    /// destroyed), bumping its generation so any later `arm`/`disarm` on a
    /// stale copy of the handle is rejected.
    pub fn retire(&mut self, handle: EventHandle) {
        if let Some(slot) = self.slots.get_mut(handle.index as usize) {
            slot.armed = false;
            slot.live = false;
            slot.generation = slot.generation.wrapping_add(1);
        }
    }

    fn slot_mut(&mut self, handle: EventHandle) -> CoreResult<&mut Slot> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or_else(|| CoreError::fatal("arm/disarm on an out-of-range event handle"))?;
        if !slot.live || slot.generation != handle.generation {
            return Err(CoreError::fatal("arm/disarm on a stale event handle (owner destroyed)"));
        }
        Ok(slot)
    }

    /// Arm `handle` to fire at `now + delta` (delta clamped to 0 if it
    /// would be negative/zero-or-less).
    pub fn arm(&mut self, handle: EventHandle, now: VirtualTime, delta: i64) -> CoreResult<()> {
        let deadline = now.checked_add_delta(delta)?;
        self.arm_absolute(handle, deadline)
    }

    /// Arm `handle` to fire at an absolute deadline.
    pub fn arm_absolute(&mut self, handle: EventHandle, deadline: VirtualTime) -> CoreResult<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let slot = self.slot_mut(handle)?;
        slot.armed = true;
        slot.deadline = deadline;
        let generation = slot.generation;
        self.heap.push(HeapKey { deadline, seq, index: handle.index, generation });
        Ok(())
    }

    /// Disarm `handle`. Idempotent — disarming an already-inert event is a
    /// no-op, not an error.
    pub fn disarm(&mut self, handle: EventHandle) -> CoreResult<()> {
        let slot = self.slot_mut(handle)?;
        slot.armed = false;
        Ok(())
    }

    pub fn is_armed(&self, handle: EventHandle) -> bool {
        self.slots.get(handle.index as usize).map(|s| s.live && s.armed).unwrap_or(false)
    }

    /// The deadline a still-armed handle is scheduled to fire at. Used by
    /// devices that need to reason about "how long until my own next
    /// event" (the CGA snow heuristic derives a corruption column from
    /// this), not part of the core scheduling contract itself.
    pub fn deadline(&self, handle: EventHandle) -> Option<VirtualTime> {
        let slot = self.slots.get(handle.index as usize)?;
        if !slot.live || !slot.armed || slot.generation != handle.generation {
            return None;
        }
        Some(slot.deadline)
    }

    /// Fire every event with `deadline <= now`, in non-decreasing deadline
    /// order (ties broken by arm sequence). The sink may arm new events
    /// (including re-arming the handle it was just called for); those are
    /// only eligible to fire on a later `tick` call because of deadline
    /// monotonicity (`now` does not change mid-tick).
    pub fn tick(&mut self, now: VirtualTime, sink: &mut dyn EventSink) {
        loop {
            let Some(top) = self.heap.peek().copied() else { break };
            if top.deadline > now {
                break;
            }
            self.heap.pop();
            let Some(slot) = self.slots.get_mut(top.index as usize) else { continue };
            if !slot.live || slot.generation != top.generation || !slot.armed {
                continue; // lazily-deleted stale or disarmed entry
            }
            // One-shot: disarm before invoking, callback may re-arm.
            slot.armed = false;
            let owner = slot.owner;
            let tag = slot.tag;
            sink.fire(owner, tag, now);
        }
    }
}
