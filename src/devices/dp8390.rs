//! DP8390-family Ethernet controller (the NE2000-class register file).
//!
//! One 32-byte I/O window. Register meaning is paged: the command
//! register's top two bits (`CR::PS1`/`CR::PS0`) select page 0
//! (operational registers), page 1 (MAC address + multicast hash +
//! `CURR`), page 2 (read-only shadow of page 0) or page 3 (vendor,
//! reserved). `CR` itself is readable/writable from every page.
//!
//! The device owns its receive/transmit ring as a private byte arena —
//! distinct from [`crate::context::GuestMemory`], which models *host*
//! memory for bus-master engines. A real NE2000 clone has its own onboard
//! RAM reached only through the remote-DMA data port or, on some clones,
//! a memory-mapped window; neither the CPU nor other devices see it
//! directly, so modelling it as host-visible guest memory would be wrong.

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::context::SystemContext;
use crate::device::{Device, DeviceConfig, DeviceId, PortIo};
use crate::error::{CoreError, CoreResult};
use crate::irq::IrqMode;
use crate::registry::DeviceRegistry;
use crate::scheduler::{EventHandle, TimerTag};
use crate::time::VirtualTime;

const PAGE_SIZE: u32 = 256;
const MIN_FRAME_LEN: usize = 60;
const TIMER_TX_COMPLETE: TimerTag = 0;
const TX_OVERHEAD_TICKS: i64 = 50;
const TX_PER_BYTE_TICKS: i64 = 1;

bitflags! {
    #[derive(Default, Clone, Copy)]
    pub struct Command: u8 {
        const STOP     = 0x01;
        const START    = 0x02;
        const TXP      = 0x04;
        const RD0      = 0x08;
        const RD1      = 0x10;
        const RD2      = 0x20;
        const PAGE0    = 0x00;
        const PAGE1    = 0x40;
        const PAGE2    = 0x80;
        const PAGE3    = 0xc0;
    }
}

bitflags! {
    #[derive(Default, Clone, Copy)]
    pub struct InterruptStatus: u8 {
        const RX_OK        = 0x01;
        const TX_OK        = 0x02;
        const RX_ERROR     = 0x04;
        const TX_ERROR     = 0x08;
        const OVERFLOW     = 0x10;
        const COUNTER_OVF  = 0x20;
        const REMOTE_DMA   = 0x40;
        const RESET        = 0x80;
    }
}

bitflags! {
    #[derive(Default, Clone, Copy)]
    pub struct ReceiveConfig: u8 {
        const SAVE_ERRORED = 0x01;
        const RUNTS_OK     = 0x02;
        const BROADCAST    = 0x04;
        const MULTICAST    = 0x08;
        const PROMISCUOUS  = 0x10;
        const MONITOR      = 0x20;
    }
}

bitflags! {
    #[derive(Default, Clone, Copy)]
    pub struct TransmitConfig: u8 {
        const CRC_INHIBIT = 0x01;
        const LOOPBACK_LO = 0x02;
        const LOOPBACK_HI = 0x04;
        const AUTO_DISABLE = 0x08;
    }
}

impl TransmitConfig {
    fn loopback(self) -> bool {
        self.intersects(TransmitConfig::LOOPBACK_LO | TransmitConfig::LOOPBACK_HI)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteDmaMode {
    None,
    Read,
    Write,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dp8390Config {
    pub io_base: u16,
    pub irq_line: u8,
    pub mac: [u8; 6],
    /// Size of the device's private onboard RAM, in 256-byte pages. Real
    /// NE2000 clones carry 32 KiB/64 KiB; callers size this to whatever
    /// `page_stop` they intend to program.
    pub ram_pages: u16,
}

impl Dp8390Config {
    fn validate(&self) -> CoreResult<()> {
        if self.ram_pages == 0 {
            return Err(CoreError::config("dp8390", "ram_pages must be nonzero"));
        }
        Ok(())
    }
}

struct Dp8390State {
    irq_line: u8,
    mac: [u8; 6],
    mult_hash: [u8; 8],

    cr: Command,
    isr: InterruptStatus,
    imr: InterruptStatus,
    rcr: ReceiveConfig,
    tcr: TransmitConfig,
    dcr: u8,

    page_start: u8,
    page_stop: u8,
    bound_ptr: u8,
    current_page: u8,

    tpsr: u8,
    tbcr: u16,
    tsr: u8,

    rsar: u16,
    rbcr: u16,
    remote_addr: u16,
    remote_remaining: u16,
    remote_mode: RemoteDmaMode,

    ram: Vec<u8>,
    tx_complete: Option<EventHandle>,
    irq_asserted: bool,
}

impl Dp8390State {
    fn new(config: &Dp8390Config) -> Self {
        Self {
            irq_line: config.irq_line,
            mac: config.mac,
            mult_hash: [0; 8],
            cr: Command::STOP,
            isr: InterruptStatus::empty(),
            imr: InterruptStatus::empty(),
            rcr: ReceiveConfig::empty(),
            tcr: TransmitConfig::empty(),
            dcr: 0,
            page_start: 0,
            page_stop: 0,
            bound_ptr: 0,
            current_page: 0,
            tpsr: 0,
            tbcr: 0,
            tsr: 0,
            rsar: 0,
            rbcr: 0,
            remote_addr: 0,
            remote_remaining: 0,
            remote_mode: RemoteDmaMode::None,
            ram: vec![0; config.ram_pages as usize * PAGE_SIZE as usize],
            tx_complete: None,
            irq_asserted: false,
        }
    }

    fn ram_read(&self, addr: u32) -> u8 {
        self.ram.get(addr as usize % self.ram.len().max(1)).copied().unwrap_or(0xff)
    }

    fn ram_write(&mut self, addr: u32, value: u8) {
        let len = self.ram.len();
        if len == 0 {
            return;
        }
        self.ram[addr as usize % len] = value;
    }

    fn update_interrupts(&mut self, ctx: &mut SystemContext) {
        let asserted = !(self.isr & self.imr).is_empty();
        if asserted != self.irq_asserted {
            self.irq_asserted = asserted;
            if asserted {
                ctx.raise_irq(self.irq_line, IrqMode::Level);
            } else {
                ctx.clear_irq(self.irq_line);
            }
        }
    }

    fn ring_pages(&self) -> u8 {
        self.page_stop.wrapping_sub(self.page_start)
    }

    /// Pages currently occupied by unread received frames.
    fn used_pages(&self) -> u8 {
        let ring = self.ring_pages();
        if ring == 0 {
            return 0;
        }
        if self.current_page >= self.bound_ptr {
            self.current_page - self.bound_ptr
        } else {
            ring - (self.bound_ptr - self.current_page)
        }
    }

    fn free_pages(&self) -> u8 {
        self.ring_pages().saturating_sub(self.used_pages())
    }

    fn wrap_page(&self, raw: u16) -> u8 {
        let ring = self.ring_pages() as u16;
        let stop = self.page_stop as u16;
        if ring == 0 {
            return raw as u8;
        }
        if raw >= stop {
            (raw - ring) as u8
        } else {
            raw as u8
        }
    }

    /// Multicast hash index per NS8390 convention: a CRC-32 over the
    /// destination MAC, top 6 bits select one of 64 filter bits.
    fn hash_index(mac: &[u8]) -> u8 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(mac);
        let crc = hasher.finalize();
        ((crc >> 26) & 0x3f) as u8
    }

    fn hash_bit_set(&self, idx: u8) -> bool {
        self.mult_hash[(idx / 8) as usize] & (1 << (idx % 8)) != 0
    }

    fn accepts(&self, dest: &[u8; 6]) -> bool {
        if self.rcr.contains(ReceiveConfig::PROMISCUOUS) {
            return true;
        }
        if dest == &[0xff; 6] {
            return self.rcr.contains(ReceiveConfig::BROADCAST);
        }
        if dest[0] & 0x01 != 0 {
            return self.rcr.contains(ReceiveConfig::MULTICAST) && self.hash_bit_set(Self::hash_index(dest));
        }
        *dest == self.mac
    }

    /// Accept one frame into the ring, per §4.8's header-plus-payload wire
    /// format. Returns false (and sets the overflow status bit) if the
    /// ring doesn't have room.
    fn deliver_to_ring(&mut self, ctx: &mut SystemContext, frame: &[u8]) -> bool {
        let mut payload = frame.to_vec();
        if payload.len() < MIN_FRAME_LEN {
            payload.resize(MIN_FRAME_LEN, 0);
        }
        let total_len = payload.len() as u16 + 4;
        let pages_needed = total_len.div_ceil(PAGE_SIZE as u16) as u8;
        if pages_needed > self.free_pages() {
            self.isr.insert(InterruptStatus::OVERFLOW);
            self.update_interrupts(ctx);
            return false;
        }
        let base = self.current_page as u32 * PAGE_SIZE;
        let next_page = self.wrap_page(self.current_page as u16 + pages_needed as u16);
        self.ram_write(base, 0x01); // status: packet received intact
        self.ram_write(base + 1, next_page);
        self.ram_write(base + 2, (total_len & 0xff) as u8);
        self.ram_write(base + 3, (total_len >> 8) as u8);
        for (i, &b) in payload.iter().enumerate() {
            self.ram_write(base + 4 + i as u32, b);
        }
        self.current_page = next_page;
        self.isr.insert(InterruptStatus::RX_OK);
        self.update_interrupts(ctx);
        true
    }

    /// Frame-level reception entry point: the external network sink (or
    /// this device's own loopback path) hands a raw Ethernet frame in.
    fn receive(&mut self, ctx: &mut SystemContext, frame: &[u8]) {
        if self.cr.contains(Command::STOP) || !self.cr.contains(Command::START) {
            return;
        }
        if frame.len() < 6 {
            return;
        }
        let mut dest = [0u8; 6];
        dest.copy_from_slice(&frame[..6]);
        if frame.len() < MIN_FRAME_LEN && !self.rcr.contains(ReceiveConfig::RUNTS_OK) {
            return;
        }
        if !self.accepts(&dest) {
            return;
        }
        self.deliver_to_ring(ctx, frame);
    }

    fn start_transmit(&mut self, ctx: &mut SystemContext) {
        let base = self.tpsr as u32 * PAGE_SIZE;
        let len = self.tbcr as usize;
        let mut frame = Vec::with_capacity(len);
        for i in 0..len {
            frame.push(self.ram_read(base + i as u32));
        }
        if self.tcr.loopback() {
            self.receive_owned(ctx, &frame);
        } else {
            ctx.network.transmit(&frame);
        }
        let delay = TX_OVERHEAD_TICKS + len as i64 * TX_PER_BYTE_TICKS;
        if let Some(h) = self.tx_complete {
            ctx.arm(h, delay);
        }
    }

    /// Loopback delivery bypasses `receive`'s external-frame guard since
    /// the frame never actually left the device.
    fn receive_owned(&mut self, ctx: &mut SystemContext, frame: &[u8]) {
        self.receive(ctx, frame);
    }
}

pub struct Dp8390 {
    shared: Rc<RefCell<Dp8390State>>,
}

impl Dp8390 {
    pub fn new(config: Dp8390Config) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self { shared: Rc::new(RefCell::new(Dp8390State::new(&config))) })
    }

    pub fn install(self, registry: &mut DeviceRegistry, io_base: u16) -> DeviceId {
        let shared = self.shared.clone();
        let id = registry.register(Box::new(self));
        registry.install_io(id, io_base, 32);
        let complete = registry.alloc_event(id, TIMER_TX_COMPLETE);
        shared.borrow_mut().tx_complete = Some(complete);
        id
    }

    /// External entry point the network-sink collaborator's peer (the
    /// front end delivering a received frame) calls.
    pub fn deliver_frame(&self, ctx: &mut SystemContext, frame: &[u8]) {
        self.shared.borrow_mut().receive(ctx, frame);
    }
}

impl Device for Dp8390 {
    fn kind(&self) -> &'static str {
        "dp8390"
    }

    fn reset(&mut self, ctx: &mut SystemContext) {
        let complete = {
            let mut s = self.shared.borrow_mut();
            s.cr = Command::STOP;
            s.isr = InterruptStatus::RESET;
            s.imr = InterruptStatus::empty();
            s.rcr = ReceiveConfig::empty();
            s.tcr = TransmitConfig::empty();
            s.remote_mode = RemoteDmaMode::None;
            s.irq_asserted = false;
            s.tx_complete
        };
        if let Some(h) = complete {
            ctx.disarm(h);
        }
    }

    fn tick(&mut self, ctx: &mut SystemContext, tag: TimerTag, _now: VirtualTime) {
        if tag != TIMER_TX_COMPLETE {
            return;
        }
        let mut s = self.shared.borrow_mut();
        s.cr.remove(Command::TXP);
        s.tsr = 0x01; // transmit-ok status bit
        s.isr.insert(InterruptStatus::TX_OK);
        s.update_interrupts(ctx);
    }

    fn close(&mut self, ctx: &mut SystemContext) {
        let complete = self.shared.borrow_mut().tx_complete.take();
        if let Some(h) = complete {
            ctx.disarm(h);
        }
    }

    fn config(&self) -> Option<DeviceConfig> {
        Some(DeviceConfig { name: "dp8390", description: "DP8390-family Ethernet controller".into() })
    }
}

impl PortIo for Dp8390 {
    fn read_byte(&mut self, ctx: &mut SystemContext, offset: u32) -> u8 {
        let mut s = self.shared.borrow_mut();
        if offset == 0x00 {
            return s.cr.bits();
        }
        if offset == 0x10 {
            if s.remote_mode != RemoteDmaMode::Read || s.remote_remaining == 0 {
                return 0xff;
            }
            let byte = s.ram_read(s.remote_addr as u32);
            s.remote_addr = s.remote_addr.wrapping_add(1);
            s.remote_remaining -= 1;
            if s.remote_remaining == 0 {
                s.remote_mode = RemoteDmaMode::None;
                s.isr.insert(InterruptStatus::REMOTE_DMA);
                s.update_interrupts(ctx);
            }
            return byte;
        }
        match s.cr.bits() & 0xc0 {
            0x00 => match offset {
                0x01 => (s.remote_addr & 0xff) as u8, // CLDA0
                0x02 => (s.remote_addr >> 8) as u8,   // CLDA1
                0x03 => s.bound_ptr,
                0x04 => s.tsr,
                0x05 => 0, // NCR: collision count, unmodelled
                0x06 => 0, // FIFO
                0x07 => s.isr.bits(),
                0x08 => (s.rsar & 0xff) as u8,
                0x09 => (s.rsar >> 8) as u8,
                0x0a | 0x0b => 0,
                0x0c => 0, // RSR: receive status, unmodelled beyond ISR
                0x0d | 0x0e | 0x0f => 0,
                _ => 0xff,
            },
            0x40 => match offset {
                0x01..=0x06 => s.mac[offset as usize - 1],
                0x07 => s.current_page,
                0x08..=0x0f => s.mult_hash[offset as usize - 8],
                _ => 0xff,
            },
            0x80 => match offset {
                0x01 => s.page_start,
                0x02 => s.page_stop,
                _ => 0xff,
            },
            _ => {
                log::warn!("dp8390: read from reserved page 3 offset {offset:#x}");
                0xff
            }
        }
    }

    fn write_byte(&mut self, ctx: &mut SystemContext, offset: u32, value: u8) {
        let mut s = self.shared.borrow_mut();
        if offset == 0x00 {
            s.cr = Command::from_bits_truncate(value);
            let mode = (value >> 3) & 0x07;
            s.remote_mode = match mode {
                0b001 => RemoteDmaMode::Read,
                0b010 => RemoteDmaMode::Write,
                _ => RemoteDmaMode::None,
            };
            if mode == 0b001 || mode == 0b010 {
                s.remote_addr = s.rsar;
                s.remote_remaining = s.rbcr;
            }
            if s.cr.contains(Command::TXP) {
                s.start_transmit(ctx);
            }
            return;
        }
        if offset == 0x10 {
            if s.remote_mode == RemoteDmaMode::Write && s.remote_remaining > 0 {
                let addr = s.remote_addr as u32;
                s.ram_write(addr, value);
                s.remote_addr = s.remote_addr.wrapping_add(1);
                s.remote_remaining -= 1;
                if s.remote_remaining == 0 {
                    s.remote_mode = RemoteDmaMode::None;
                    s.isr.insert(InterruptStatus::REMOTE_DMA);
                    s.update_interrupts(ctx);
                }
            }
            return;
        }
        match s.cr.bits() & 0xc0 {
            0x00 => match offset {
                0x01 => s.page_start = value,
                0x02 => s.page_stop = value,
                0x03 => s.bound_ptr = value,
                0x04 => s.tpsr = value,
                0x05 => s.tbcr = (s.tbcr & 0xff00) | value as u16,
                0x06 => s.tbcr = (s.tbcr & 0x00ff) | ((value as u16) << 8),
                0x07 => {
                    s.isr &= !InterruptStatus::from_bits_truncate(value);
                    s.update_interrupts(ctx);
                }
                0x08 => s.rsar = (s.rsar & 0xff00) | value as u16,
                0x09 => s.rsar = (s.rsar & 0x00ff) | ((value as u16) << 8),
                0x0a => s.rbcr = (s.rbcr & 0xff00) | value as u16,
                0x0b => s.rbcr = (s.rbcr & 0x00ff) | ((value as u16) << 8),
                0x0c => s.rcr = ReceiveConfig::from_bits_truncate(value),
                0x0d => s.tcr = TransmitConfig::from_bits_truncate(value),
                0x0e => s.dcr = value,
                0x0f => {
                    s.imr = InterruptStatus::from_bits_truncate(value);
                    s.update_interrupts(ctx);
                }
                _ => {}
            },
            0x40 => match offset {
                0x01..=0x06 => s.mac[offset as usize - 1] = value,
                0x07 => s.current_page = value,
                0x08..=0x0f => s.mult_hash[offset as usize - 8] = value,
                _ => {}
            },
            0x80 => {
                log::warn!("dp8390: illegal write to page-2 shadow register {offset:#x}");
            }
            _ => {
                log::warn!("dp8390: write to reserved page 3 offset {offset:#x} (value {value:#x})");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FlatGuestMemory;
    use crate::dma::DmaController;
    use crate::irq::{InterruptAggregator, InterruptSink};
    use crate::scheduler::EventScheduler;

    struct NullSink;
    impl InterruptSink for NullSink {
        fn notify(&mut self, _line: u8, _asserted: bool, _aggregate: bool) {}
    }
    struct NullCollabs;
    impl crate::device::DisplaySink for NullCollabs {
        fn blit(&mut self, _x: u32, _y: u32, _w: u32, _h: u32, _p: &[u32]) {}
    }
    impl crate::device::AudioSink for NullCollabs {
        fn push_samples(&mut self, _s: &[i16]) {}
    }
    impl crate::device::FontRom for NullCollabs {
        fn glyph(&self, _c: u8, _ch: u8, _row: u8) -> u8 {
            0
        }
    }
    impl crate::device::DiskImageStore for NullCollabs {
        fn read_sectors(&mut self, _id: u32, _lba: u64, _count: u32, _buf: &mut [u8]) -> i64 {
            0
        }
        fn write_sectors(&mut self, _id: u32, _lba: u64, _count: u32, _buf: &[u8]) -> i64 {
            0
        }
        fn zero_sectors(&mut self, _id: u32, _lba: u64, _count: u32) -> i64 {
            0
        }
    }

    #[derive(Default)]
    struct RecordingCollabs {
        transmitted: Vec<Vec<u8>>,
    }
    impl crate::device::NetworkSink for RecordingCollabs {
        fn transmit(&mut self, frame: &[u8]) {
            self.transmitted.push(frame.to_vec());
        }
    }

    fn make_nic() -> Dp8390 {
        Dp8390::new(Dp8390Config { io_base: 0x300, irq_line: 3, mac: [0x52, 0x54, 0x00, 0x12, 0x34, 0x56], ram_pages: 128 })
            .unwrap()
    }

    fn with_ctx<R>(collabs: &mut RecordingCollabs, f: impl FnOnce(&mut SystemContext) -> R) -> R {
        let mut sched = EventScheduler::new();
        let mut irqagg = InterruptAggregator::new();
        let mut sink = NullSink;
        let mut dma = DmaController::new();
        let mut mem = FlatGuestMemory::new(16);
        let mut disp = NullCollabs;
        let mut aud = NullCollabs;
        let font = NullCollabs;
        let mut disk = NullCollabs;
        let mut ctx = SystemContext {
            now: VirtualTime::ZERO,
            device_id: DeviceId::new(0),
            scheduler: &mut sched,
            irq: &mut irqagg,
            irq_sink: &mut sink,
            dma: &mut dma,
            memory: &mut mem,
            network: collabs,
            display: &mut disp,
            audio: &mut aud,
            font_rom: &font,
            disk_store: &mut disk,
        };
        f(&mut ctx)
    }

    fn wire_nic(nic: &Dp8390) {
        let mut sched = EventScheduler::new();
        let handle = sched.alloc(DeviceId::new(0), TIMER_TX_COMPLETE);
        nic.shared.borrow_mut().tx_complete = Some(handle);
    }

    #[test]
    fn small_frame_lands_in_ring_with_header_and_advances_current_page() {
        let nic = make_nic();
        wire_nic(&nic);
        let mut collabs = RecordingCollabs::default();
        {
            let mut s = nic.shared.borrow_mut();
            s.cr = Command::START;
            s.page_start = 0x46;
            s.page_stop = 0x80;
            s.current_page = 0x47;
            s.bound_ptr = 0x46;
        }
        let mut frame = vec![0x52, 0x54, 0x00, 0x12, 0x34, 0x56]; // dest == our MAC
        frame.extend_from_slice(&[0xAA; 58]); // 64 bytes total
        with_ctx(&mut collabs, |ctx| {
            nic.deliver_frame(ctx, &frame);
        });
        let s = nic.shared.borrow();
        let base = 0x47 * 256;
        assert_eq!(s.ram[base], 0x01);
        assert_eq!(s.ram[base + 1], 0x48);
        assert_eq!(u16::from_le_bytes([s.ram[base + 2], s.ram[base + 3]]), 68);
        assert_eq!(&s.ram[base + 4..base + 4 + 64], &frame[..]);
        assert_eq!(s.current_page, 0x48);
        assert!(s.isr.contains(InterruptStatus::RX_OK));
    }

    #[test]
    fn ring_full_drops_frame_and_sets_overflow() {
        let nic = make_nic();
        wire_nic(&nic);
        let mut collabs = RecordingCollabs::default();
        {
            let mut s = nic.shared.borrow_mut();
            s.cr = Command::START;
            s.page_start = 0x46;
            s.page_stop = 0x47; // one page of ring room only
            s.current_page = 0x46;
            s.bound_ptr = 0x46; // zero free pages: used == ring size
        }
        let mut frame = vec![0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
        frame.extend_from_slice(&[0; 58]);
        with_ctx(&mut collabs, |ctx| {
            nic.deliver_frame(ctx, &frame);
        });
        let s = nic.shared.borrow();
        assert!(s.isr.contains(InterruptStatus::OVERFLOW));
        assert_eq!(s.current_page, 0x46); // unchanged: frame was dropped
    }

    #[test]
    fn runt_frame_rejected_unless_runts_ok() {
        let nic = make_nic();
        wire_nic(&nic);
        let mut collabs = RecordingCollabs::default();
        {
            let mut s = nic.shared.borrow_mut();
            s.cr = Command::START;
            s.page_start = 0x46;
            s.page_stop = 0x80;
            s.current_page = 0x46;
            s.bound_ptr = 0x46;
        }
        let mut frame = vec![0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
        frame.extend_from_slice(&[0; 20]); // 26 bytes: a runt
        with_ctx(&mut collabs, |ctx| {
            nic.deliver_frame(ctx, &frame);
        });
        assert_eq!(nic.shared.borrow().current_page, 0x46); // dropped, not delivered
    }

    #[test]
    fn loopback_transmit_round_trips_into_own_ring() {
        let nic = make_nic();
        wire_nic(&nic);
        let mut collabs = RecordingCollabs::default();
        with_ctx(&mut collabs, |ctx| {
            let mut s = nic.shared.borrow_mut();
            s.cr = Command::START;
            s.page_start = 0x46;
            s.page_stop = 0x80;
            s.current_page = 0x46;
            s.bound_ptr = 0x46;
            s.tcr = TransmitConfig::LOOPBACK_LO;
            let mut frame = vec![0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
            frame.extend_from_slice(&[0x01; 58]);
            for (i, &b) in frame.iter().enumerate() {
                s.ram_write(i as u32, b);
            }
            s.tpsr = 0;
            s.tbcr = frame.len() as u16;
            drop(s);
            PortIo::write_byte(&mut nic_mut(&nic), ctx, 0x00, (Command::START | Command::TXP).bits());
        });
        assert!(collabs.transmitted.is_empty());
        assert_eq!(nic.shared.borrow().current_page, 0x47);
    }

    // `PortIo`'s methods take `&mut self`, but our test fixture only has a
    // shared `Rc` handle; this helper wraps it in a throwaway `Dp8390` that
    // shares the same state, used only to route through the trait's byte
    // interface in the loopback test above.
    fn nic_mut(nic: &Dp8390) -> Dp8390 {
        Dp8390 { shared: nic.shared.clone() }
    }

    #[test]
    fn multicast_hash_index_is_stable() {
        let idx = Dp8390State::hash_index(&[0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]);
        assert!(idx < 64);
    }
}
