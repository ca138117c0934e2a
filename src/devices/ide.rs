//! AT-attached IDE/ESDI disk controller (task-file interface).
//!
//! Eight task-file registers plus the alternate-status/device-control
//! register. Every command that isn't purely a register load goes through
//! one scheduled completion event whose delay approximates seek time (from
//! geometry and the current cylinder) plus a fixed per-sector transfer
//! cost, mirroring the WD1007-style ESDI/IDE controller this is grounded
//! on. Like the CRTC and UART, the completion-event handle has to be
//! wired into the device's own state after its `DeviceId` exists, so the
//! mutable state lives behind an `Rc<RefCell<..>>` cloned before the
//! outer value moves into the registry's `Box<dyn BusDevice>`.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::context::SystemContext;
use crate::device::{Device, DeviceConfig, DeviceId, PortIo};
use crate::error::{CoreError, CoreResult};
use crate::irq::IrqMode;
use crate::registry::DeviceRegistry;
use crate::scheduler::{EventHandle, TimerTag};
use crate::time::VirtualTime;

const SECTOR_BYTES: usize = 512;
const TIMER_COMPLETE: TimerTag = 0;

const SEEK_TICKS_PER_CYLINDER: i64 = 2;
const SEEK_SETTLE_TICKS: i64 = 50;
const SECTOR_OVERHEAD_TICKS: i64 = 100;
const PER_BYTE_TICKS: i64 = 1;

mod status {
    pub const ERR: u8 = 0x01;
    pub const DRQ: u8 = 0x08;
    pub const DSC: u8 = 0x10;
    pub const READY: u8 = 0x40;
    pub const BUSY: u8 = 0x80;
}

mod err {
    pub const ID_NOT_FOUND: u8 = 0x10;
    pub const ABORTED: u8 = 0x04;
    pub const BAD_BLOCK: u8 = 0x80;
    pub const TRACK0_NOT_FOUND: u8 = 0x02;
}

mod cmd {
    pub const RESTORE_MASK: u8 = 0x10;
    pub const SEEK_MASK: u8 = 0x70;
    pub const READ: u8 = 0x20;
    pub const WRITE: u8 = 0x30;
    pub const VERIFY: u8 = 0x40;
    pub const FORMAT: u8 = 0x50;
    pub const SET_PARAMETERS: u8 = 0x91;
    pub const DIAGNOSE: u8 = 0x90;
    pub const IDENTIFY: u8 = 0xec;
}

/// Externally observable task-file state, exactly the four states the
/// controller ever sits in between a host transaction and the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    IdleReady,
    BusyExecuting,
    DataRequestIn,
    DataRequestOut,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    pub present: bool,
    pub disk_id: u32,
    pub physical: DriveGeometry,
    pub model: String,
    pub firmware_revision: String,
    pub serial: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdeConfig {
    pub io_base: u16,
    pub control_base: u16,
    pub irq_line: u8,
    pub drives: [Option<DriveConfig>; 2],
}

impl IdeConfig {
    fn validate(&self) -> CoreResult<()> {
        for drive in self.drives.iter().flatten() {
            if drive.physical.heads == 0 || drive.physical.sectors_per_track == 0 {
                return Err(CoreError::config("ide", "drive geometry must have nonzero heads/sectors"));
            }
        }
        Ok(())
    }
}

struct Drive {
    present: bool,
    disk_id: u32,
    physical: DriveGeometry,
    /// Logical (possibly translated) geometry; identical to `physical`
    /// until a Set-Parameters command reprograms it.
    cfg_heads: u8,
    cfg_sectors: u8,
    model: String,
    firmware_revision: String,
    serial: String,
    current_cylinder: u16,
}

impl Drive {
    fn from_config(cfg: &Option<DriveConfig>) -> Self {
        match cfg {
            Some(c) => Drive {
                present: c.present,
                disk_id: c.disk_id,
                physical: c.physical.clone(),
                cfg_heads: c.physical.heads,
                cfg_sectors: c.physical.sectors_per_track,
                model: c.model.clone(),
                firmware_revision: c.firmware_revision.clone(),
                serial: c.serial.clone(),
                current_cylinder: 0,
            },
            None => Drive {
                present: false,
                disk_id: 0,
                physical: DriveGeometry { cylinders: 0, heads: 1, sectors_per_track: 1 },
                cfg_heads: 1,
                cfg_sectors: 1,
                model: String::new(),
                firmware_revision: String::new(),
                serial: String::new(),
                current_cylinder: 0,
            },
        }
    }
}

struct IdeState {
    irq_line: u8,

    status: u8,
    error: u8,
    sector_count: u8,
    sector: u8,
    cylinder: u16,
    head: u8,
    drive_sel: usize,
    command: u8,
    control: u8,

    buffer: Vec<u8>,
    pos: usize,
    state: TaskState,

    drives: [Drive; 2],
    complete: Option<EventHandle>,
    irq_asserted: bool,
}

impl IdeState {
    fn new(config: &IdeConfig) -> Self {
        let drives = [Drive::from_config(&config.drives[0]), Drive::from_config(&config.drives[1])];
        Self {
            irq_line: config.irq_line,
            status: status::READY | status::DSC,
            error: 0,
            sector_count: 1,
            sector: 1,
            cylinder: 0,
            head: 0,
            drive_sel: 0,
            command: 0,
            control: 0,
            buffer: vec![0; SECTOR_BYTES],
            pos: 0,
            state: TaskState::IdleReady,
            drives,
            complete: None,
            irq_asserted: false,
        }
    }

    fn drive(&self) -> &Drive {
        &self.drives[self.drive_sel]
    }

    fn drive_mut(&mut self) -> &mut Drive {
        &mut self.drives[self.drive_sel]
    }

    /// CHS -> LBA, reserving one spare sector per track when the
    /// configured geometry differs from the drive's physical geometry.
    fn chs_to_lba(&self) -> Result<u64, ()> {
        let drive = self.drive();
        let heads = drive.cfg_heads as u64;
        let sectors = drive.cfg_sectors as u64;
        if self.head as u64 > heads {
            return Err(());
        }
        if self.sector as u64 >= sectors + 1 {
            return Err(());
        }
        let sector = if self.sector == 0 { 1 } else { self.sector } as u64;
        let addr = ((self.cylinder as u64 * heads) + self.head as u64) * sectors + (sector - 1);
        if drive.cfg_sectors == drive.physical.sectors_per_track && drive.cfg_heads == drive.physical.heads {
            Ok(addr)
        } else {
            let real_spt = drive.physical.sectors_per_track as u64 - 1;
            let real_hpc = drive.physical.heads as u64;
            let s = addr % real_spt;
            let h = (addr / real_spt) % real_hpc;
            let c = (addr / real_spt) / real_hpc;
            Ok((c * real_hpc + h) * drive.physical.sectors_per_track as u64 + s)
        }
    }

    fn advance_chs(&mut self) {
        self.sector += 1;
        let spt = self.drive().cfg_sectors;
        if self.sector == spt + 1 {
            self.sector = 1;
            self.head += 1;
            if self.head == self.drive().cfg_heads {
                self.head = 0;
                self.cylinder += 1;
            }
        }
        let cylinder = self.cylinder;
        let tracks = self.drive().physical.cylinders;
        if cylinder < tracks {
            self.drive_mut().current_cylinder = cylinder;
        }
    }

    fn seek_ticks(&self) -> i64 {
        let delta = (self.cylinder as i64 - self.drive().current_cylinder as i64).abs();
        delta * SEEK_TICKS_PER_CYLINDER + SEEK_SETTLE_TICKS
    }

    fn transfer_ticks(&self, sectors: u32) -> i64 {
        SECTOR_OVERHEAD_TICKS + (sectors as i64) * (SECTOR_BYTES as i64) * PER_BYTE_TICKS
    }

    fn abort(&mut self, ctx: &mut SystemContext, code: u8) {
        self.status = status::READY | status::DSC | status::ERR;
        self.error = code;
        self.state = TaskState::IdleReady;
        self.raise_irq(ctx);
    }

    fn raise_irq(&mut self, ctx: &mut SystemContext) {
        self.irq_asserted = true;
        ctx.raise_irq(self.irq_line, IrqMode::Edge);
    }

    fn build_identify_block(&mut self) {
        self.buffer.iter_mut().for_each(|b| *b = 0);
        let drive_cylinders = self.drive().physical.cylinders;
        let drive_heads = self.drive().physical.heads;
        let drive_sectors = self.drive().physical.sectors_per_track;
        let serial = self.drive().serial.clone();
        let firmware = self.drive().firmware_revision.clone();
        let model = self.drive().model.clone();

        let put_word = |buf: &mut Vec<u8>, idx: usize, value: u16| {
            let bytes = value.to_le_bytes();
            buf[idx * 2] = bytes[0];
            buf[idx * 2 + 1] = bytes[1];
        };
        put_word(&mut self.buffer, 1, drive_cylinders);
        put_word(&mut self.buffer, 3, drive_heads as u16);
        put_word(&mut self.buffer, 5, 600);
        put_word(&mut self.buffer, 4, 600u16.wrapping_mul(drive_sectors as u16));
        put_word(&mut self.buffer, 6, drive_sectors as u16);
        write_padded_swapped(&mut self.buffer, 10 * 2, &serial, 20);
        write_padded_swapped(&mut self.buffer, 23 * 2, &firmware, 8);
        write_padded_swapped(&mut self.buffer, 27 * 2, &model, 40);
        put_word(&mut self.buffer, 47, 1);
    }
}

/// 86Box's `esdi_padstr`: pads with spaces to `len` bytes and writes each
/// byte at `i ^ 1` within the destination — i.e. byte-swapped within each
/// 16-bit word, matching how the ATA IDENTIFY string fields are laid out.
fn write_padded_swapped(buf: &mut [u8], base: usize, src: &str, len: usize) {
    let bytes = src.as_bytes();
    for i in 0..len {
        let byte = bytes.get(i).copied().unwrap_or(b' ');
        let dest = base + (i ^ 1);
        if dest < buf.len() {
            buf[dest] = byte;
        }
    }
}

/// The task-file-facing half: the eight consecutive data/command ports.
pub struct Ide {
    shared: Rc<RefCell<IdeState>>,
}

/// The device-control-facing half: the single alternate-status/device-
/// control register, installed as its own (non-adjacent) address range
/// so a host can read status without the side effects of reading the
/// main status register (offset 7 of the task file clears the IRQ).
pub struct IdeControl {
    shared: Rc<RefCell<IdeState>>,
}

impl Ide {
    pub fn new(config: IdeConfig) -> CoreResult<(Self, IdeControl)> {
        config.validate()?;
        let shared = Rc::new(RefCell::new(IdeState::new(&config)));
        Ok((Self { shared: shared.clone() }, IdeControl { shared }))
    }

    pub fn install(self, control: IdeControl, registry: &mut DeviceRegistry, io_base: u16, control_base: u16) -> DeviceId {
        let shared = self.shared.clone();
        let id = registry.register(Box::new(self));
        let control_id = registry.register(Box::new(control));
        registry.install_io(id, io_base, 8);
        registry.install_io(control_id, control_base, 1);
        let complete = registry.alloc_event(id, TIMER_COMPLETE);
        shared.borrow_mut().complete = Some(complete);
        id
    }
}

impl Device for IdeControl {
    fn kind(&self) -> &'static str {
        "ide-control"
    }
    fn reset(&mut self, _ctx: &mut SystemContext) {}
    fn tick(&mut self, _ctx: &mut SystemContext, _tag: TimerTag, _now: VirtualTime) {}
}

impl PortIo for IdeControl {
    fn read_byte(&mut self, _ctx: &mut SystemContext, _offset: u32) -> u8 {
        self.shared.borrow().status
    }
    fn write_byte(&mut self, _ctx: &mut SystemContext, _offset: u32, value: u8) {
        self.shared.borrow_mut().control = value;
    }
}

impl Device for Ide {
    fn kind(&self) -> &'static str {
        "ide"
    }

    fn reset(&mut self, ctx: &mut SystemContext) {
        let complete = {
            let mut s = self.shared.borrow_mut();
            s.status = status::READY | status::DSC;
            s.error = 0;
            s.sector_count = 1;
            s.sector = 1;
            s.head = 0;
            s.cylinder = 0;
            s.pos = 0;
            s.state = TaskState::IdleReady;
            s.irq_asserted = false;
            s.complete
        };
        if let Some(h) = complete {
            ctx.disarm(h);
        }
    }

    fn tick(&mut self, ctx: &mut SystemContext, tag: TimerTag, _now: VirtualTime) {
        if tag != TIMER_COMPLETE {
            return;
        }
        let mut s = self.shared.borrow_mut();
        s.state = TaskState::BusyExecuting;
        let command = s.command;
        match command {
            c if c & 0xf0 == cmd::RESTORE_MASK => {
                if !s.drive().present {
                    s.abort(ctx, err::ABORTED);
                } else if s.drive().physical.cylinders == 0 {
                    s.abort(ctx, err::TRACK0_NOT_FOUND);
                } else {
                    s.drive_mut().current_cylinder = 0;
                    s.status = status::READY | status::DSC;
                    s.state = TaskState::IdleReady;
                    s.raise_irq(ctx);
                }
            }
            c if c & 0xf0 == cmd::SEEK_MASK => {
                if !s.drive().present {
                    s.abort(ctx, err::ABORTED);
                } else {
                    s.status = status::READY | status::DSC;
                    s.state = TaskState::IdleReady;
                    s.raise_irq(ctx);
                }
            }
            c if c & 0xfc == cmd::READ => {
                if !s.drive().present {
                    s.abort(ctx, err::ABORTED);
                    return;
                }
                let Ok(lba) = s.chs_to_lba() else {
                    s.abort(ctx, err::ID_NOT_FOUND);
                    return;
                };
                let disk_id = s.drive().disk_id;
                let result = ctx.disk_store.read_sectors(disk_id, lba, 1, &mut s.buffer);
                if result < 0 {
                    s.abort(ctx, err::BAD_BLOCK);
                    return;
                }
                s.pos = 0;
                s.status = status::DRQ | status::READY | status::DSC;
                s.state = TaskState::DataRequestIn;
                s.raise_irq(ctx);
            }
            c if c & 0xfc == cmd::WRITE => {
                if !s.drive().present {
                    s.abort(ctx, err::ABORTED);
                    return;
                }
                let Ok(lba) = s.chs_to_lba() else {
                    s.abort(ctx, err::ID_NOT_FOUND);
                    return;
                };
                let disk_id = s.drive().disk_id;
                let result = ctx.disk_store.write_sectors(disk_id, lba, 1, &s.buffer);
                if result < 0 {
                    s.abort(ctx, err::BAD_BLOCK);
                    return;
                }
                s.raise_irq(ctx);
                s.sector_count = s.sector_count.wrapping_sub(1);
                if s.sector_count != 0 {
                    s.status = status::DRQ | status::READY | status::DSC;
                    s.pos = 0;
                    s.state = TaskState::DataRequestOut;
                    s.advance_chs();
                } else {
                    s.status = status::READY | status::DSC;
                    s.state = TaskState::IdleReady;
                }
            }
            c if c & 0xfe == cmd::VERIFY => {
                if !s.drive().present {
                    s.abort(ctx, err::ABORTED);
                    return;
                }
                let Ok(lba) = s.chs_to_lba() else {
                    s.abort(ctx, err::ID_NOT_FOUND);
                    return;
                };
                let disk_id = s.drive().disk_id;
                let result = ctx.disk_store.read_sectors(disk_id, lba, 1, &mut s.buffer);
                if result < 0 {
                    s.abort(ctx, err::BAD_BLOCK);
                    return;
                }
                s.advance_chs();
                s.sector_count = s.sector_count.wrapping_sub(1);
                if s.sector_count != 0 {
                    let delay = s.seek_ticks() + SECTOR_OVERHEAD_TICKS;
                    if let Some(h) = s.complete {
                        ctx.arm(h, delay);
                    }
                } else {
                    s.pos = 0;
                    s.status = status::READY | status::DSC;
                    s.state = TaskState::IdleReady;
                    s.raise_irq(ctx);
                }
            }
            cmd::FORMAT => {
                if !s.drive().present {
                    s.abort(ctx, err::ABORTED);
                    return;
                }
                let Ok(lba) = s.chs_to_lba() else {
                    s.abort(ctx, err::ID_NOT_FOUND);
                    return;
                };
                let disk_id = s.drive().disk_id;
                let count = s.sector_count.max(1) as u32;
                let result = ctx.disk_store.zero_sectors(disk_id, lba, count);
                if result < 0 {
                    s.abort(ctx, err::BAD_BLOCK);
                    return;
                }
                s.status = status::READY | status::DSC;
                s.state = TaskState::IdleReady;
                s.raise_irq(ctx);
            }
            cmd::SET_PARAMETERS => {
                if !s.drive().present {
                    s.abort(ctx, err::ABORTED);
                } else {
                    let spt = s.sector_count;
                    let hpc = s.head + 1;
                    s.drive_mut().cfg_sectors = spt;
                    s.drive_mut().cfg_heads = hpc;
                    s.status = status::READY | status::DSC;
                    s.state = TaskState::IdleReady;
                    s.raise_irq(ctx);
                }
            }
            cmd::DIAGNOSE => {
                s.drive_sel = 0;
                s.error = 1; // 1 == "no error detected", per the diagnostic code convention.
                s.status = status::READY | status::DSC;
                s.state = TaskState::IdleReady;
                s.raise_irq(ctx);
            }
            cmd::IDENTIFY => {
                if !s.drive().present {
                    s.abort(ctx, err::ABORTED);
                } else {
                    s.build_identify_block();
                    s.pos = 0;
                    s.status = status::DRQ | status::READY | status::DSC;
                    s.state = TaskState::DataRequestIn;
                    s.raise_irq(ctx);
                }
            }
            _ => {
                s.abort(ctx, err::ABORTED);
            }
        }
    }

    fn close(&mut self, ctx: &mut SystemContext) {
        let complete = self.shared.borrow_mut().complete.take();
        if let Some(h) = complete {
            ctx.disarm(h);
        }
    }

    fn config(&self) -> Option<DeviceConfig> {
        Some(DeviceConfig { name: "ide", description: "AT task-file disk controller".into() })
    }
}

impl PortIo for Ide {
    fn read_byte(&mut self, ctx: &mut SystemContext, offset: u32) -> u8 {
        let mut s = self.shared.borrow_mut();
        match offset {
            0 => {
                let byte = s.buffer.get(s.pos).copied().unwrap_or(0xff);
                s.pos += 1;
                if s.pos >= SECTOR_BYTES {
                    s.pos = 0;
                    s.status = status::READY | status::DSC;
                    s.state = TaskState::IdleReady;
                    if s.command & 0xfc == cmd::READ {
                        s.sector_count = s.sector_count.wrapping_sub(1);
                        if s.sector_count != 0 {
                            s.advance_chs();
                            s.status = status::BUSY;
                            s.state = TaskState::BusyExecuting;
                            let delay = s.seek_ticks() + s.transfer_ticks(1);
                            if let Some(h) = s.complete {
                                ctx.arm(h, delay);
                            }
                        }
                    }
                }
                byte
            }
            1 => s.error,
            2 => s.sector_count,
            3 => s.sector,
            4 => (s.cylinder & 0xff) as u8,
            5 => (s.cylinder >> 8) as u8,
            6 => s.head | if s.drive_sel != 0 { 0x10 } else { 0 } | 0xa0,
            7 => {
                s.irq_asserted = false;
                ctx.clear_irq(s.irq_line);
                s.status
            }
            _ => 0xff,
        }
    }

    fn write_byte(&mut self, ctx: &mut SystemContext, offset: u32, value: u8) {
        let mut s = self.shared.borrow_mut();
        match offset {
            0 => {
                if let Some(slot) = s.buffer.get_mut(s.pos) {
                    *slot = value;
                }
                s.pos += 1;
                if s.pos >= SECTOR_BYTES {
                    s.pos = 0;
                    s.status = status::BUSY;
                    s.state = TaskState::BusyExecuting;
                    let delay = s.seek_ticks() + s.transfer_ticks(1);
                    if let Some(h) = s.complete {
                        ctx.arm(h, delay);
                    }
                }
            }
            1 => {} // write precompensation: accepted, not modelled
            2 => s.sector_count = value,
            3 => s.sector = value,
            4 => s.cylinder = (s.cylinder & 0xff00) | value as u16,
            5 => s.cylinder = (s.cylinder & 0x00ff) | ((value as u16) << 8),
            6 => {
                s.head = value & 0x0f;
                s.drive_sel = if value & 0x10 != 0 { 1 } else { 0 };
                s.status = if s.drive().present { status::READY | status::DSC } else { 0 };
            }
            7 => {
                s.irq_asserted = false;
                ctx.clear_irq(s.irq_line);
                s.command = value;
                s.error = 0;
                s.status = status::BUSY;
                s.state = TaskState::BusyExecuting;

                match value {
                    c if c & 0xf0 == cmd::RESTORE_MASK => {
                        s.command &= 0xf0;
                        if let Some(h) = s.complete {
                            ctx.arm(h, 200 * SEEK_SETTLE_TICKS);
                        }
                    }
                    c if c & 0xf0 == cmd::SEEK_MASK => {
                        s.command &= 0xf0;
                        let delay = s.seek_ticks();
                        if let Some(h) = s.complete {
                            ctx.arm(h, delay);
                        }
                    }
                    c if c & 0xfc == cmd::READ => {
                        s.command &= 0xfc;
                        let delay = s.seek_ticks() + s.transfer_ticks(1);
                        if let Some(h) = s.complete {
                            ctx.arm(h, delay);
                        }
                    }
                    c if c & 0xfc == cmd::WRITE => {
                        s.command &= 0xfc;
                        s.status = status::READY | status::DRQ | status::DSC;
                        s.pos = 0;
                        s.state = TaskState::DataRequestOut;
                    }
                    c if c & 0xfe == cmd::VERIFY => {
                        s.command &= 0xfe;
                        let delay = s.seek_ticks() + s.transfer_ticks(1);
                        if let Some(h) = s.complete {
                            ctx.arm(h, delay);
                        }
                    }
                    cmd::FORMAT => {
                        s.status = status::DRQ;
                        s.pos = 0;
                        s.state = TaskState::DataRequestOut;
                    }
                    cmd::SET_PARAMETERS => {
                        if let Some(h) = s.complete {
                            ctx.arm(h, 30 * SEEK_SETTLE_TICKS);
                        }
                    }
                    cmd::DIAGNOSE => {
                        if let Some(h) = s.complete {
                            ctx.arm(h, 200 * SEEK_SETTLE_TICKS);
                        }
                    }
                    cmd::IDENTIFY => {
                        if let Some(h) = s.complete {
                            ctx.arm(h, 200 * SEEK_SETTLE_TICKS);
                        }
                    }
                    _ => {
                        if let Some(h) = s.complete {
                            ctx.arm(h, 200 * SEEK_SETTLE_TICKS);
                        }
                    }
                }
            }
            _ => {}
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
    use std::collections::HashMap;

    struct NullSink;
    impl InterruptSink for NullSink {
        fn notify(&mut self, _line: u8, _asserted: bool, _aggregate: bool) {}
    }
    struct NullCollabs;
    impl crate::device::NetworkSink for NullCollabs {
        fn transmit(&mut self, _f: &[u8]) {}
    }
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

    #[derive(Default)]
    struct MemDisk {
        sectors: HashMap<u64, [u8; SECTOR_BYTES]>,
    }
    impl crate::device::DiskImageStore for MemDisk {
        fn read_sectors(&mut self, _id: u32, lba: u64, count: u32, buf: &mut [u8]) -> i64 {
            for i in 0..count as u64 {
                let sector = self.sectors.entry(lba + i).or_insert([0; SECTOR_BYTES]);
                let base = (i as usize) * SECTOR_BYTES;
                if base + SECTOR_BYTES <= buf.len() {
                    buf[base..base + SECTOR_BYTES].copy_from_slice(sector);
                }
            }
            count as i64
        }
        fn write_sectors(&mut self, _id: u32, lba: u64, count: u32, buf: &[u8]) -> i64 {
            for i in 0..count as u64 {
                let base = (i as usize) * SECTOR_BYTES;
                let mut sector = [0u8; SECTOR_BYTES];
                if base + SECTOR_BYTES <= buf.len() {
                    sector.copy_from_slice(&buf[base..base + SECTOR_BYTES]);
                }
                self.sectors.insert(lba + i, sector);
            }
            count as i64
        }
        fn zero_sectors(&mut self, _id: u32, lba: u64, count: u32) -> i64 {
            for i in 0..count as u64 {
                self.sectors.insert(lba + i, [0; SECTOR_BYTES]);
            }
            count as i64
        }
    }

    fn make_drive() -> DriveConfig {
        DriveConfig {
            present: true,
            disk_id: 0,
            physical: DriveGeometry { cylinders: 1024, heads: 16, sectors_per_track: 63 },
            model: "WD1007V".into(),
            firmware_revision: "REV. A5".into(),
            serial: "00000000000000000000".into(),
        }
    }

    fn make_ide(drives: [Option<DriveConfig>; 2]) -> Ide {
        let (ide, _control) =
            Ide::new(IdeConfig { io_base: 0x1f0, control_base: 0x3f6, irq_line: 14, drives }).unwrap();
        let mut sched = EventScheduler::new();
        let handle = sched.alloc(DeviceId::new(0), TIMER_COMPLETE);
        ide.shared.borrow_mut().complete = Some(handle);
        ide
    }

    fn with_ctx<R>(disk: &mut MemDisk, f: impl FnOnce(&mut SystemContext) -> R) -> R {
        let mut sched = EventScheduler::new();
        let mut irqagg = InterruptAggregator::new();
        let mut sink = NullSink;
        let mut dma = DmaController::new();
        let mut mem = FlatGuestMemory::new(16);
        let mut net = NullCollabs;
        let mut disp = NullCollabs;
        let mut aud = NullCollabs;
        let font = NullCollabs;
        let mut ctx = SystemContext {
            now: VirtualTime::ZERO,
            device_id: DeviceId::new(0),
            scheduler: &mut sched,
            irq: &mut irqagg,
            irq_sink: &mut sink,
            dma: &mut dma,
            memory: &mut mem,
            network: &mut net,
            display: &mut disp,
            audio: &mut aud,
            font_rom: &font,
            disk_store: disk,
        };
        f(&mut ctx)
    }

    #[test]
    fn identify_reports_configured_geometry_words() {
        let mut ide = make_ide([Some(make_drive()), None]);
        let mut disk = MemDisk::default();
        with_ctx(&mut disk, |ctx| {
            PortIo::write_byte(&mut ide, ctx, 6, 0xa0);
            PortIo::write_byte(&mut ide, ctx, 7, 0xec);
            Device::tick(&mut ide, ctx, TIMER_COMPLETE, VirtualTime::ZERO);
        });
        let buf = ide.shared.borrow().buffer.clone();
        let word = |idx: usize| u16::from_le_bytes([buf[idx * 2], buf[idx * 2 + 1]]);
        assert_eq!(word(1), 1024);
        assert_eq!(word(3), 16);
        assert_eq!(word(6), 63);
    }

    #[test]
    fn write_then_read_round_trips_sector_bytes() {
        let mut ide = make_ide([Some(make_drive()), None]);
        let mut disk = MemDisk::default();
        with_ctx(&mut disk, |ctx| {
            PortIo::write_byte(&mut ide, ctx, 6, 0xa0);
            PortIo::write_byte(&mut ide, ctx, 2, 1); // sector count
            PortIo::write_byte(&mut ide, ctx, 3, 1); // sector
            PortIo::write_byte(&mut ide, ctx, 7, 0x30); // WRITE
            for i in 0..SECTOR_BYTES {
                PortIo::write_byte(&mut ide, ctx, 0, (i & 0xff) as u8);
            }
            Device::tick(&mut ide, ctx, TIMER_COMPLETE, VirtualTime::ZERO);

            PortIo::write_byte(&mut ide, ctx, 2, 1);
            PortIo::write_byte(&mut ide, ctx, 3, 1);
            PortIo::write_byte(&mut ide, ctx, 7, 0x20); // READ
            Device::tick(&mut ide, ctx, TIMER_COMPLETE, VirtualTime::ZERO);

            for i in 0..SECTOR_BYTES {
                let b = PortIo::read_byte(&mut ide, ctx, 0);
                assert_eq!(b, (i & 0xff) as u8);
            }
        });
    }

    #[test]
    fn diagnose_resets_drive_select_to_zero() {
        let mut ide = make_ide([Some(make_drive()), Some(make_drive())]);
        let mut disk = MemDisk::default();
        with_ctx(&mut disk, |ctx| {
            PortIo::write_byte(&mut ide, ctx, 6, 0x10); // select drive 1
            assert_eq!(ide.shared.borrow().drive_sel, 1);
            PortIo::write_byte(&mut ide, ctx, 7, 0x90); // DIAGNOSE
            Device::tick(&mut ide, ctx, TIMER_COMPLETE, VirtualTime::ZERO);
            assert_eq!(ide.shared.borrow().drive_sel, 0);
        });
    }
}
