//! The root registry: owns every device, the address spaces that route
//! to them, the scheduler, the interrupt aggregator, the DMA controller,
//! guest memory and the external collaborators. Nothing outside this
//! module holds a `Box<dyn BusDevice>` or a raw reference into guest
//! memory; everyone else works through the handles it hands out.

use std::collections::HashMap;

use crate::bus::{AddressSpace, RangeHandle};
use crate::context::{GuestMemory, SystemContext};
use crate::device::{AccessSize, AudioSink, BusDevice, CpuCollaborator, DeviceId, DiskImageStore, DisplaySink, FontRom, NetworkSink};
use crate::dma::DmaController;
use crate::irq::{InterruptAggregator, InterruptSink, IrqMode};
use crate::scheduler::{EventHandle, EventScheduler, EventSink, TimerTag};
use crate::time::{VirtualClock, VirtualTime};

/// Forwards interrupt-aggregator transitions to the CPU collaborator as a
/// single aggregate PIC output line, the only interrupt-related thing the
/// CPU side actually observes.
struct CpuNotifySink<'a> {
    cpu: &'a mut dyn CpuCollaborator,
}

impl InterruptSink for CpuNotifySink<'_> {
    fn notify(&mut self, _line: u8, _asserted: bool, aggregate: bool) {
        self.cpu.interrupt_notify(aggregate);
    }
}

#[derive(Default)]
struct DeviceBookkeeping {
    io_ranges: Vec<RangeHandle>,
    mem_ranges: Vec<RangeHandle>,
    events: Vec<EventHandle>,
}

/// Owns the whole device-and-interconnect core for one running machine.
pub struct DeviceRegistry {
    devices: Vec<Option<Box<dyn BusDevice>>>,
    bookkeeping: HashMap<u32, DeviceBookkeeping>,
    io_space: AddressSpace<DeviceId>,
    mem_space: AddressSpace<DeviceId>,
    scheduler: EventScheduler,
    irq: InterruptAggregator,
    dma: DmaController,
    clock: VirtualClock,
    memory: Box<dyn GuestMemory>,
    network: Box<dyn NetworkSink>,
    display: Box<dyn DisplaySink>,
    audio: Box<dyn AudioSink>,
    font_rom: Box<dyn FontRom>,
    disk_store: Box<dyn DiskImageStore>,
    cpu: Box<dyn CpuCollaborator>,
}

/// External collaborators a machine is built with. Bundled into one
/// constructor argument so adding a new collaborator doesn't churn every
/// call site.
pub struct Collaborators {
    pub memory: Box<dyn GuestMemory>,
    pub network: Box<dyn NetworkSink>,
    pub display: Box<dyn DisplaySink>,
    pub audio: Box<dyn AudioSink>,
    pub font_rom: Box<dyn FontRom>,
    pub disk_store: Box<dyn DiskImageStore>,
    pub cpu: Box<dyn CpuCollaborator>,
}

impl DeviceRegistry {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            devices: Vec::new(),
            bookkeeping: HashMap::new(),
            io_space: AddressSpace::new(),
            mem_space: AddressSpace::new(),
            scheduler: EventScheduler::new(),
            irq: InterruptAggregator::new(),
            dma: DmaController::new(),
            clock: VirtualClock::default(),
            memory: collaborators.memory,
            network: collaborators.network,
            display: collaborators.display,
            audio: collaborators.audio,
            font_rom: collaborators.font_rom,
            disk_store: collaborators.disk_store,
            cpu: collaborators.cpu,
        }
    }

    pub fn now(&self) -> VirtualTime {
        self.clock.now()
    }

    pub fn dma(&self) -> &DmaController {
        &self.dma
    }

    pub fn dma_mut(&mut self) -> &mut DmaController {
        &mut self.dma
    }

    /// Register a fully constructed device and return the id the registry
    /// will dispatch to it under from now on. The caller is expected to
    /// follow up with `install_io`/`install_mem`/`alloc_event` calls (from
    /// inside the device's own constructor, typically) to wire its address
    /// ranges and timers; a device with none of those registered simply
    /// never gets ticked or addressed.
    pub fn register(&mut self, device: Box<dyn BusDevice>) -> DeviceId {
        let index = self.devices.len() as u32;
        self.devices.push(Some(device));
        self.bookkeeping.insert(index, DeviceBookkeeping::default());
        DeviceId::new(index)
    }

    pub fn alloc_event(&mut self, owner: DeviceId, tag: TimerTag) -> EventHandle {
        let handle = self.scheduler.alloc(owner, tag);
        self.bookkeeping.entry(owner.raw()).or_default().events.push(handle);
        handle
    }

    pub fn install_io(&mut self, owner: DeviceId, base: u16, length: u32) -> RangeHandle {
        let handle = self.io_space.install(base as u32, length, owner);
        self.bookkeeping.entry(owner.raw()).or_default().io_ranges.push(handle);
        handle
    }

    pub fn install_mem(&mut self, owner: DeviceId, base: u32, length: u32) -> RangeHandle {
        let handle = self.mem_space.install(base, length, owner);
        self.bookkeeping.entry(owner.raw()).or_default().mem_ranges.push(handle);
        handle
    }

    pub fn remove_io(&mut self, handle: RangeHandle) {
        self.io_space.remove(handle);
    }

    pub fn remove_mem(&mut self, handle: RangeHandle) {
        self.mem_space.remove(handle);
    }

    /// Move `id`'s device out of storage, hand it a freshly built context
    /// borrowing everything else, run `f`, then put the device back. This
    /// is the one place the registry has to reconcile "every device lives
    /// in the same `Vec`" with "a device's callback needs mutable access
    /// to everything that isn't itself" — taking the device out for the
    /// duration of the call sidesteps the aliasing that would otherwise
    /// require unsafe code or a `RefCell` around every field.
    fn with_device<R>(&mut self, id: DeviceId, f: impl FnOnce(&mut dyn BusDevice, &mut SystemContext) -> R) -> Option<R> {
        let idx = id.raw() as usize;
        let mut device = self.devices.get_mut(idx)?.take()?;
        let now = self.clock.now();
        let mut cpu_sink = CpuNotifySink { cpu: self.cpu.as_mut() };
        let mut ctx = SystemContext {
            now,
            device_id: id,
            scheduler: &mut self.scheduler,
            irq: &mut self.irq,
            irq_sink: &mut cpu_sink,
            dma: &mut self.dma,
            memory: self.memory.as_mut(),
            network: self.network.as_mut(),
            display: self.display.as_mut(),
            audio: self.audio.as_mut(),
            font_rom: self.font_rom.as_ref(),
            disk_store: self.disk_store.as_mut(),
        };
        let result = f(device.as_mut(), &mut ctx);
        self.devices[idx] = Some(device);
        Some(result)
    }

    pub fn reset_device(&mut self, id: DeviceId) {
        self.with_device(id, |device, ctx| device.reset(ctx));
    }

    pub fn reset_all(&mut self) {
        let ids: Vec<DeviceId> = (0..self.devices.len() as u32).map(DeviceId::new).collect();
        for id in ids {
            self.reset_device(id);
        }
    }

    /// Tear a device down: retire its scheduled events, unregister its
    /// address ranges, invoke `Device::close`, then drop the boxed device
    /// itself. The slot stays reserved (its `DeviceId` is never reused) so
    /// any stale handle elsewhere is caught by the scheduler's generation
    /// check rather than silently reassigned to a new device.
    pub fn close_device(&mut self, id: DeviceId) {
        self.with_device(id, |device, ctx| device.close(ctx));
        if let Some(book) = self.bookkeeping.remove(&id.raw()) {
            for handle in book.events {
                self.scheduler.retire(handle);
            }
            for handle in book.io_ranges {
                self.io_space.remove(handle);
            }
            for handle in book.mem_ranges {
                self.mem_space.remove(handle);
            }
        }
        if let Some(slot) = self.devices.get_mut(id.raw() as usize) {
            *slot = None;
        }
    }

    fn dispatch_byte(&mut self, space: Space, addr: u32) -> u8 {
        let Some((owner, offset)) = self.lookup(space, addr) else { return 0xff };
        self.with_device(owner, |device, ctx| device.read_byte(ctx, offset)).unwrap_or(0xff)
    }

    fn dispatch_write_byte(&mut self, space: Space, addr: u32, value: u8) {
        let Some((owner, offset)) = self.lookup(space, addr) else { return };
        self.with_device(owner, |device, ctx| device.write_byte(ctx, offset, value));
    }

    fn lookup(&self, space: Space, addr: u32) -> Option<(DeviceId, u32)> {
        match space {
            Space::Io => self.io_space.lookup(addr),
            Space::Mem => self.mem_space.lookup(addr),
        }
    }

    /// Read `size` bytes at `addr` in `space`. A device is first offered
    /// the access at its native width (`read_word`/`read_long`); if it
    /// declines (returns `None`, the default for devices that never
    /// override those methods) the bus synthesizes the wider access from
    /// successive byte reads, low byte first, matching how real ISA glue
    /// logic decomposes an unaligned or oversized access into the byte
    /// lanes a simple device register file actually understands. Addresses
    /// with no installed device read as all-ones, the electrical idle
    /// state of an undriven bus.
    fn read(&mut self, space: Space, addr: u32, size: AccessSize) -> u32 {
        match size {
            AccessSize::Byte => self.dispatch_byte(space, addr) as u32,
            AccessSize::Word => {
                if let Some((owner, offset)) = self.lookup(space, addr) {
                    if let Some(word) = self.with_device(owner, |device, ctx| device.read_word(ctx, offset)).flatten() {
                        return word as u32;
                    }
                }
                let lo = self.dispatch_byte(space, addr) as u32;
                let hi = self.dispatch_byte(space, addr.wrapping_add(1)) as u32;
                lo | (hi << 8)
            }
            AccessSize::Long => {
                if let Some((owner, offset)) = self.lookup(space, addr) {
                    if let Some(long) = self.with_device(owner, |device, ctx| device.read_long(ctx, offset)).flatten() {
                        return long;
                    }
                }
                let b0 = self.dispatch_byte(space, addr) as u32;
                let b1 = self.dispatch_byte(space, addr.wrapping_add(1)) as u32;
                let b2 = self.dispatch_byte(space, addr.wrapping_add(2)) as u32;
                let b3 = self.dispatch_byte(space, addr.wrapping_add(3)) as u32;
                b0 | (b1 << 8) | (b2 << 16) | (b3 << 24)
            }
        }
    }

    fn write(&mut self, space: Space, addr: u32, size: AccessSize, value: u32) {
        match size {
            AccessSize::Byte => self.dispatch_write_byte(space, addr, value as u8),
            AccessSize::Word => {
                let handled = self
                    .lookup(space, addr)
                    .and_then(|(owner, offset)| self.with_device(owner, |device, ctx| device.write_word(ctx, offset, value as u16)))
                    .unwrap_or(false);
                if !handled {
                    self.dispatch_write_byte(space, addr, value as u8);
                    self.dispatch_write_byte(space, addr.wrapping_add(1), (value >> 8) as u8);
                }
            }
            AccessSize::Long => {
                let handled = self
                    .lookup(space, addr)
                    .and_then(|(owner, offset)| self.with_device(owner, |device, ctx| device.write_long(ctx, offset, value)))
                    .unwrap_or(false);
                if !handled {
                    self.dispatch_write_byte(space, addr, value as u8);
                    self.dispatch_write_byte(space, addr.wrapping_add(1), (value >> 8) as u8);
                    self.dispatch_write_byte(space, addr.wrapping_add(2), (value >> 16) as u8);
                    self.dispatch_write_byte(space, addr.wrapping_add(3), (value >> 24) as u8);
                }
            }
        }
    }

    pub fn io_read(&mut self, port: u16, size: AccessSize) -> u32 {
        self.read(Space::Io, port as u32, size)
    }

    pub fn io_write(&mut self, port: u16, size: AccessSize, value: u32) {
        self.write(Space::Io, port as u32, size, value);
    }

    pub fn mem_read(&mut self, addr: u32, size: AccessSize) -> u32 {
        self.read(Space::Mem, addr, size)
    }

    pub fn mem_write(&mut self, addr: u32, size: AccessSize, value: u32) {
        self.write(Space::Mem, addr, size, value);
    }

    /// Advance virtual time by `ticks` and fire every scheduler event this
    /// crosses. The front end calls this once per CPU instruction batch,
    /// using the cycle count the CPU collaborator reports; the core has no
    /// opinion on batch size.
    pub fn advance(&mut self, ticks: u64) {
        let now = self.clock.advance(ticks);
        let mut pending: Vec<(DeviceId, TimerTag, VirtualTime)> = Vec::new();
        {
            struct Collector<'a>(&'a mut Vec<(DeviceId, TimerTag, VirtualTime)>);
            impl EventSink for Collector<'_> {
                fn fire(&mut self, owner: DeviceId, tag: TimerTag, now: VirtualTime) {
                    self.0.push((owner, tag, now));
                }
            }
            let mut collector = Collector(&mut pending);
            self.scheduler.tick(now, &mut collector);
        }
        for (owner, tag, now) in pending {
            self.with_device(owner, |device, ctx| device.tick(ctx, tag, now));
        }
    }

    /// Pull the CPU collaborator's latest cycle count and advance by it.
    /// Convenience wrapper around `advance` for front ends that don't need
    /// to interleave anything else between polling cycles and firing
    /// events.
    pub fn run_batch(&mut self) {
        let cycles = self.cpu.cycles_consumed();
        self.advance(cycles);
    }

    pub fn raise_irq(&mut self, line: u8, mode: IrqMode) {
        let mut sink = CpuNotifySink { cpu: self.cpu.as_mut() };
        self.irq.raise(line, mode, &mut sink);
    }

    pub fn clear_irq(&mut self, line: u8) {
        let mut sink = CpuNotifySink { cpu: self.cpu.as_mut() };
        self.irq.clear(line, &mut sink);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Space {
    Io,
    Mem,
}
