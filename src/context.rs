//! `SystemContext`: the bundle of non-owning handles passed to every
//! device callback in place of the
//! ambient globals the original C device model relied on (shared
//! interrupt pins, the DMA channel table, the scatter/gather-visible
//! guest memory). Devices hold indices into this context; they never
//! hold raw pointers into each other.

use crate::device::{AudioSink, DeviceId, DiskImageStore, DisplaySink, FontRom, NetworkSink};
use crate::dma::DmaController;
use crate::irq::{InterruptAggregator, InterruptSink, IrqMode};
use crate::scheduler::{EventHandle, EventScheduler};
use crate::time::VirtualTime;

/// Guest physical memory, as seen by bus-master-capable DMA consumers
/// (AC'97/PAS scatter-gather, IDE bus-master PRDs, the DP8390 ring
/// buffer's backing store). Modelled as a trait rather than a concrete
/// byte slice so the core never assumes how the (out-of-scope) CPU/memory
/// collaborator actually lays out RAM.
pub trait GuestMemory {
    fn read_u8(&self, addr: u32) -> u8;
    fn write_u8(&mut self, addr: u32, value: u8);

    fn read_u16(&self, addr: u32) -> u16 {
        u16::from_le_bytes([self.read_u8(addr), self.read_u8(addr.wrapping_add(1))])
    }
    fn write_u16(&mut self, addr: u32, value: u16) {
        let b = value.to_le_bytes();
        self.write_u8(addr, b[0]);
        self.write_u8(addr.wrapping_add(1), b[1]);
    }
    fn read_u32(&self, addr: u32) -> u32 {
        u32::from_le_bytes([
            self.read_u8(addr),
            self.read_u8(addr.wrapping_add(1)),
            self.read_u8(addr.wrapping_add(2)),
            self.read_u8(addr.wrapping_add(3)),
        ])
    }
    fn write_u32(&mut self, addr: u32, value: u32) {
        let b = value.to_le_bytes();
        for (i, byte) in b.iter().enumerate() {
            self.write_u8(addr.wrapping_add(i as u32), *byte);
        }
    }
    fn read_bytes(&self, addr: u32, buf: &mut [u8]) {
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = self.read_u8(addr.wrapping_add(i as u32));
        }
    }
    fn write_bytes(&mut self, addr: u32, buf: &[u8]) {
        for (i, byte) in buf.iter().enumerate() {
            self.write_u8(addr.wrapping_add(i as u32), *byte);
        }
    }
}

/// A plain `Vec<u8>`-backed flat address space, used by tests and by
/// small standalone demos; front ends wire their own RAM implementation
/// in production.
#[derive(Debug, Default)]
pub struct FlatGuestMemory {
    pub bytes: Vec<u8>,
}

impl FlatGuestMemory {
    pub fn new(size: usize) -> Self {
        Self { bytes: vec![0; size] }
    }
}

impl GuestMemory for FlatGuestMemory {
    fn read_u8(&self, addr: u32) -> u8 {
        self.bytes.get(addr as usize).copied().unwrap_or(0xff)
    }
    fn write_u8(&mut self, addr: u32, value: u8) {
        if let Some(slot) = self.bytes.get_mut(addr as usize) {
            *slot = value;
        }
    }
}

pub struct SystemContext<'a> {
    pub now: VirtualTime,
    pub device_id: DeviceId,
    pub scheduler: &'a mut EventScheduler,
    pub irq: &'a mut InterruptAggregator,
    pub irq_sink: &'a mut dyn InterruptSink,
    pub dma: &'a mut DmaController,
    pub memory: &'a mut dyn GuestMemory,
    pub network: &'a mut dyn NetworkSink,
    pub display: &'a mut dyn DisplaySink,
    pub audio: &'a mut dyn AudioSink,
    pub font_rom: &'a dyn FontRom,
    pub disk_store: &'a mut dyn DiskImageStore,
}

impl<'a> SystemContext<'a> {
    pub fn arm(&mut self, handle: EventHandle, delta: i64) {
        self.scheduler
            .arm(handle, self.now, delta)
            .expect("arming an event this device owns should never fail");
    }

    pub fn arm_absolute(&mut self, handle: EventHandle, deadline: VirtualTime) {
        self.scheduler
            .arm_absolute(handle, deadline)
            .expect("arming an event this device owns should never fail");
    }

    pub fn disarm(&mut self, handle: EventHandle) {
        let _ = self.scheduler.disarm(handle);
    }

    pub fn raise_irq(&mut self, line: u8, mode: IrqMode) {
        self.irq.raise(line, mode, self.irq_sink);
    }

    pub fn clear_irq(&mut self, line: u8) {
        self.irq.clear(line, self.irq_sink);
    }

    pub fn ack_irq(&mut self, line: u8) {
        self.irq.ack(line, self.irq_sink);
    }
}
