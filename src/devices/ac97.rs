//! AC'97-style bus-master DMA audio engine.
//!
//! Each of [`CHANNEL_COUNT`] channels owns a scatter-gather list living in
//! guest memory: 8-byte descriptors of (4-byte little-endian buffer
//! address, 24-bit sample count, 1-byte flags). A per-channel 32-byte FIFO
//! decouples the DMA process, which walks the descriptor list one dword at
//! a time, from the poll process, which drains the FIFO at the channel's
//! programmed sample rate and pushes converted stereo samples out.
//!
//! Two 256-byte port windows are exposed, matching a VIA-style AC'97
//! bridge: the SGD window (per-channel control/status/descriptor-pointer
//! registers at `channel * 0x10`, plus a global master-volume register at
//! `0x80`) and a largely pass-through codec-mixer window.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::context::{GuestMemory, SystemContext};
use crate::device::{Device, DeviceConfig, DeviceId, PortIo};
use crate::error::{CoreError, CoreResult};
use crate::irq::IrqMode;
use crate::registry::DeviceRegistry;
use crate::scheduler::{EventHandle, TimerTag};
use crate::time::VirtualTime;

pub const CHANNEL_COUNT: usize = 4;
const FIFO_CAPACITY: usize = 32;
const CHANNEL_STRIDE: u32 = 0x10;
const GLOBAL_BASE: u32 = 0x80;
const REG_MASTER_VOLUME: u32 = GLOBAL_BASE;

const REG_CONTROL: u32 = 0x00;
const REG_STATUS: u32 = 0x01;
const REG_FORMAT_IE: u32 = 0x02;
const REG_ENTRY_PTR: u32 = 0x04; // ..0x07
const REG_SAMPLE_COUNT: u32 = 0x08; // ..0x0a, 24-bit readback
const REG_ENTRY_FLAGS: u32 = 0x0b;
const REG_SAMPLE_RATE: u32 = 0x0c; // ..0x0d, u16 LE

const CONTROL_RUN: u8 = 0x01;
const CONTROL_TRIGGER_QUEUED: u8 = 0x02;

const STATUS_EOL: u8 = 0x01;
const STATUS_FLAG: u8 = 0x02;
const STATUS_HALTED: u8 = 0x04;

const FMT_IE_EOL: u8 = 0x01;
const FMT_IE_FLAG: u8 = 0x02;
const FMT_AUTO_START: u8 = 0x04;
const FMT_STEREO: u8 = 0x10;
const FMT_BITS16: u8 = 0x20;

const ENTRY_HALT: u8 = 0x20;
const ENTRY_FLAG: u8 = 0x40;
const ENTRY_EOL: u8 = 0x80;

/// Maximum attenuation the 0.375 dB/step PCM volume table reaches before
/// clamping, per §4.10.
const MAX_ATTENUATION_STEPS: u8 = 124; // 124 * 0.375 dB == 46.5 dB

fn attenuation_linear(steps: u8) -> f32 {
    let db = -(steps.min(MAX_ATTENUATION_STEPS) as f32) * 0.375;
    10f32.powf(db / 20.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ac97Config {
    pub sgd_base: u16,
    pub codec_base: u16,
    pub irq_line: u8,
}

impl Ac97Config {
    fn validate(&self) -> CoreResult<()> {
        if self.sgd_base == self.codec_base {
            return Err(CoreError::config("ac97", "sgd_base and codec_base must differ"));
        }
        Ok(())
    }
}

#[derive(Default)]
struct ChannelState {
    control: u8,
    status: u8,
    format_ie: u8,
    base_entry_ptr: u32,
    entry_ptr: u32,
    sample_ptr: u32,
    sample_count: i32,
    entry_flags: u8,
    entry_loaded: bool,
    sample_rate_hz: u16,
    fifo: VecDeque<u8>,
    vol_steps: u8,
    dma_timer: Option<EventHandle>,
    poll_timer: Option<EventHandle>,
}

impl ChannelState {
    fn new() -> Self {
        Self { sample_rate_hz: 48000, fifo: VecDeque::with_capacity(FIFO_CAPACITY), ..Default::default() }
    }

    fn running(&self) -> bool {
        self.control & CONTROL_RUN != 0
    }

    fn poll_period_ticks(&self) -> i64 {
        let rate = self.sample_rate_hz.max(1) as i64;
        (1_000_000 / rate).max(1)
    }
}

struct Ac97State {
    irq_line: u8,
    channels: [ChannelState; CHANNEL_COUNT],
    master_vol_steps: u8,
    codec: [u8; 256],
    irq_asserted: bool,
}

impl Ac97State {
    fn new() -> Self {
        Self {
            irq_line: 0,
            channels: std::array::from_fn(|_| ChannelState::new()),
            master_vol_steps: 0,
            codec: [0; 256],
            irq_asserted: false,
        }
    }

    fn update_irqs(&mut self, ctx: &mut SystemContext) {
        let asserted = self.channels.iter().any(|ch| {
            (ch.status & STATUS_EOL != 0 && ch.format_ie & FMT_IE_EOL != 0)
                || (ch.status & STATUS_FLAG != 0 && ch.format_ie & FMT_IE_FLAG != 0)
        });
        if asserted != self.irq_asserted {
            self.irq_asserted = asserted;
            if asserted {
                ctx.raise_irq(self.irq_line, IrqMode::Level);
            } else {
                ctx.clear_irq(self.irq_line);
            }
        }
    }

    /// Read the next descriptor and/or one dword of sample payload, per
    /// §4.10's DMA process. Runs once per virtual microsecond per active
    /// channel, driven by that channel's `dma_timer`.
    fn dma_process(&mut self, ctx: &mut SystemContext, channel: usize) {
        let ch = &mut self.channels[channel];
        if !ch.running() {
            return;
        }
        if ch.fifo.len() + 4 > FIFO_CAPACITY {
            return;
        }
        if !ch.entry_loaded {
            let ptr = ch.entry_ptr;
            let sample_ptr = ctx.memory.read_u32(ptr);
            let tail = ctx.memory.read_u32(ptr.wrapping_add(4));
            ch.entry_ptr = ptr.wrapping_add(8);
            if (sample_ptr == 0xffff_ffff && tail == 0xffff_ffff) || (sample_ptr == 0 && tail == 0) {
                log::warn!("ac97: channel {channel} descriptor list ran dry without STOP/EOL");
                ch.control &= !CONTROL_RUN;
                return;
            }
            ch.sample_ptr = sample_ptr;
            ch.sample_count = (tail & 0x00ff_ffff) as i32;
            ch.entry_flags = (tail >> 24) as u8;
            ch.entry_loaded = true;
        }
        let mut word = [0u8; 4];
        ctx.memory.read_bytes(ch.sample_ptr, &mut word);
        for b in word {
            ch.fifo.push_back(b);
        }
        ch.sample_ptr = ch.sample_ptr.wrapping_add(4);
        ch.sample_count -= 4;

        if ch.sample_count <= 0 {
            ch.entry_loaded = false;
            let flags = ch.entry_flags;
            if flags & ENTRY_HALT != 0 {
                ch.status |= STATUS_HALTED;
                ch.control &= !CONTROL_RUN;
            }
            if flags & ENTRY_FLAG != 0 {
                ch.status |= STATUS_FLAG;
            }
            if flags & ENTRY_EOL != 0 {
                ch.status |= STATUS_EOL;
                let restart = ch.control & CONTROL_TRIGGER_QUEUED != 0 || ch.format_ie & FMT_AUTO_START != 0;
                if restart {
                    ch.control &= !CONTROL_TRIGGER_QUEUED;
                    ch.entry_ptr = ch.base_entry_ptr;
                } else {
                    ch.control &= !CONTROL_RUN;
                }
            }
            self.update_irqs(ctx);
        }
        let ch = &mut self.channels[channel];
        if ch.running() {
            if let Some(h) = ch.dma_timer {
                ctx.arm(h, 1);
            }
        }
    }

    /// Pop one sample tick's worth of bytes, convert to signed 16-bit
    /// stereo, apply volume attenuation, and push to the mix sink, per
    /// §4.10's poll process.
    fn poll_process(&mut self, ctx: &mut SystemContext, channel: usize) {
        let master = attenuation_linear(self.master_vol_steps);
        let ch = &mut self.channels[channel];
        let stereo = ch.format_ie & FMT_STEREO != 0;
        let bits16 = ch.format_ie & FMT_BITS16 != 0;
        let needed = match (stereo, bits16) {
            (false, false) => 1,
            (true, false) => 2,
            (false, true) => 2,
            (true, true) => 4,
        };
        let (mut l, mut r) = (0i32, 0i32);
        if ch.fifo.len() >= needed {
            if bits16 {
                let lo = ch.fifo.pop_front().unwrap();
                let hi = ch.fifo.pop_front().unwrap();
                l = i16::from_le_bytes([lo, hi]) as i32;
                r = if stereo {
                    let lo = ch.fifo.pop_front().unwrap();
                    let hi = ch.fifo.pop_front().unwrap();
                    i16::from_le_bytes([lo, hi]) as i32
                } else {
                    l
                };
            } else {
                let raw_l = ch.fifo.pop_front().unwrap();
                l = ((raw_l ^ 0x80) as i32) << 8;
                r = if stereo {
                    let raw_r = ch.fifo.pop_front().unwrap();
                    ((raw_r ^ 0x80) as i32) << 8
                } else {
                    l
                };
            }
        }
        let vol = attenuation_linear(ch.vol_steps) * master;
        let out_l = (l as f32 * vol).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        let out_r = (r as f32 * vol).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        ctx.audio.push_samples(&[out_l, out_r]);
        if ch.running() {
            if let Some(h) = ch.poll_timer {
                let period = ch.poll_period_ticks();
                ctx.arm(h, period);
            }
        }
    }

    fn start_channel(&mut self, ctx: &mut SystemContext, channel: usize) {
        let ch = &mut self.channels[channel];
        if ch.running() {
            ch.control |= CONTROL_TRIGGER_QUEUED;
            return;
        }
        ch.control |= CONTROL_RUN;
        ch.entry_ptr = ch.base_entry_ptr;
        ch.entry_loaded = false;
        ch.fifo.clear();
        if let Some(h) = ch.dma_timer {
            ctx.arm(h, 1);
        }
        if let Some(h) = ch.poll_timer {
            let period = ch.poll_period_ticks();
            ctx.arm(h, period);
        }
    }
}

pub struct Ac97 {
    shared: Rc<RefCell<Ac97State>>,
}

pub struct Ac97Codec {
    shared: Rc<RefCell<Ac97State>>,
}

impl Ac97 {
    pub fn new(config: Ac97Config) -> CoreResult<(Self, Ac97Codec)> {
        config.validate()?;
        let mut state = Ac97State::new();
        state.irq_line = config.irq_line;
        let shared = Rc::new(RefCell::new(state));
        Ok((Self { shared: shared.clone() }, Ac97Codec { shared }))
    }

    pub fn install(self, codec: Ac97Codec, registry: &mut DeviceRegistry, sgd_base: u16, codec_base: u16) -> DeviceId {
        let shared = self.shared.clone();
        let sgd_id = registry.register(Box::new(self));
        let codec_id = registry.register(Box::new(codec));
        registry.install_io(sgd_id, sgd_base, 256);
        registry.install_io(codec_id, codec_base, 256);
        for channel in 0..CHANNEL_COUNT {
            let dma = registry.alloc_event(sgd_id, dma_tag(channel));
            let poll = registry.alloc_event(sgd_id, poll_tag(channel));
            let mut s = shared.borrow_mut();
            s.channels[channel].dma_timer = Some(dma);
            s.channels[channel].poll_timer = Some(poll);
        }
        sgd_id
    }
}

fn dma_tag(channel: usize) -> TimerTag {
    channel as TimerTag * 2
}
fn poll_tag(channel: usize) -> TimerTag {
    channel as TimerTag * 2 + 1
}

impl Device for Ac97 {
    fn kind(&self) -> &'static str {
        "ac97-sgd"
    }

    fn reset(&mut self, ctx: &mut SystemContext) {
        let handles: Vec<(Option<EventHandle>, Option<EventHandle>)> = {
            let mut s = self.shared.borrow_mut();
            s.master_vol_steps = 0;
            s.irq_asserted = false;
            s.channels
                .iter_mut()
                .map(|ch| {
                    ch.control = 0;
                    ch.status = 0;
                    ch.format_ie = 0;
                    ch.base_entry_ptr = 0;
                    ch.entry_ptr = 0;
                    ch.sample_count = 0;
                    ch.entry_loaded = false;
                    ch.fifo.clear();
                    ch.vol_steps = 0;
                    (ch.dma_timer, ch.poll_timer)
                })
                .collect()
        };
        for (dma, poll) in handles {
            if let Some(h) = dma {
                ctx.disarm(h);
            }
            if let Some(h) = poll {
                ctx.disarm(h);
            }
        }
    }

    fn tick(&mut self, ctx: &mut SystemContext, tag: TimerTag, _now: VirtualTime) {
        let channel = (tag / 2) as usize;
        if channel >= CHANNEL_COUNT {
            return;
        }
        let mut s = self.shared.borrow_mut();
        if tag % 2 == 0 {
            s.dma_process(ctx, channel);
        } else {
            s.poll_process(ctx, channel);
        }
    }

    fn close(&mut self, ctx: &mut SystemContext) {
        let mut s = self.shared.borrow_mut();
        for ch in s.channels.iter_mut() {
            if let Some(h) = ch.dma_timer.take() {
                ctx.disarm(h);
            }
            if let Some(h) = ch.poll_timer.take() {
                ctx.disarm(h);
            }
        }
    }

    fn config(&self) -> Option<DeviceConfig> {
        Some(DeviceConfig { name: "ac97", description: "AC'97-style DMA audio engine".into() })
    }
}

impl PortIo for Ac97 {
    fn read_byte(&mut self, _ctx: &mut SystemContext, offset: u32) -> u8 {
        let s = self.shared.borrow();
        if offset == REG_MASTER_VOLUME {
            return s.master_vol_steps;
        }
        let channel = (offset / CHANNEL_STRIDE) as usize;
        if channel >= CHANNEL_COUNT {
            return 0xff;
        }
        let ch = &s.channels[channel];
        let reg = offset % CHANNEL_STRIDE;
        match reg {
            REG_CONTROL => ch.control,
            REG_STATUS => ch.status,
            REG_FORMAT_IE => ch.format_ie,
            0x04 => (ch.entry_ptr & 0xff) as u8,
            0x05 => ((ch.entry_ptr >> 8) & 0xff) as u8,
            0x06 => ((ch.entry_ptr >> 16) & 0xff) as u8,
            0x07 => ((ch.entry_ptr >> 24) & 0xff) as u8,
            0x08 => (ch.sample_count & 0xff) as u8,
            0x09 => ((ch.sample_count >> 8) & 0xff) as u8,
            0x0a => ((ch.sample_count >> 16) & 0xff) as u8,
            REG_ENTRY_FLAGS => ch.entry_flags,
            0x0c => (ch.sample_rate_hz & 0xff) as u8,
            0x0d => (ch.sample_rate_hz >> 8) as u8,
            0x0e => ch.vol_steps,
            _ => 0xff,
        }
    }

    fn write_byte(&mut self, ctx: &mut SystemContext, offset: u32, value: u8) {
        let mut s = self.shared.borrow_mut();
        if offset == REG_MASTER_VOLUME {
            s.master_vol_steps = value;
            return;
        }
        let channel = (offset / CHANNEL_STRIDE) as usize;
        if channel >= CHANNEL_COUNT {
            return;
        }
        let reg = offset % CHANNEL_STRIDE;
        match reg {
            REG_CONTROL => {
                let was_running = s.channels[channel].running();
                let want_running = value & CONTROL_RUN != 0;
                let extra = value & !CONTROL_RUN;
                s.channels[channel].control = (s.channels[channel].control & CONTROL_RUN) | extra;
                if want_running && !was_running {
                    s.start_channel(ctx, channel);
                } else if !want_running && was_running {
                    s.channels[channel].control &= !CONTROL_RUN;
                }
            }
            REG_STATUS => {
                s.channels[channel].status &= !value; // write-1-to-clear
                s.update_irqs(ctx);
            }
            REG_FORMAT_IE => s.channels[channel].format_ie = value,
            REG_ENTRY_PTR => {
                let p = &mut s.channels[channel].base_entry_ptr;
                *p = (*p & 0xffff_ff00) | value as u32;
            }
            0x05 => {
                let p = &mut s.channels[channel].base_entry_ptr;
                *p = (*p & 0xffff_00ff) | ((value as u32) << 8);
            }
            0x06 => {
                let p = &mut s.channels[channel].base_entry_ptr;
                *p = (*p & 0xff00_ffff) | ((value as u32) << 16);
            }
            0x07 => {
                let p = &mut s.channels[channel].base_entry_ptr;
                *p = (*p & 0x00ff_ffff) | ((value as u32) << 24);
            }
            0x0c => {
                let r = &mut s.channels[channel].sample_rate_hz;
                *r = (*r & 0xff00) | value as u16;
            }
            0x0d => {
                let r = &mut s.channels[channel].sample_rate_hz;
                *r = (*r & 0x00ff) | ((value as u16) << 8);
            }
            0x0e => s.channels[channel].vol_steps = value,
            _ => {}
        }
    }
}

impl Device for Ac97Codec {
    fn kind(&self) -> &'static str {
        "ac97-codec"
    }
    fn reset(&mut self, _ctx: &mut SystemContext) {
        self.shared.borrow_mut().codec = [0; 256];
    }
    fn tick(&mut self, _ctx: &mut SystemContext, _tag: TimerTag, _now: VirtualTime) {}
}

impl PortIo for Ac97Codec {
    fn read_byte(&mut self, _ctx: &mut SystemContext, offset: u32) -> u8 {
        self.shared.borrow().codec[offset as usize % 256]
    }
    fn write_byte(&mut self, _ctx: &mut SystemContext, offset: u32, value: u8) {
        self.shared.borrow_mut().codec[offset as usize % 256] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{FlatGuestMemory, GuestMemory};
    use crate::device::{DiskImageStore, DisplaySink, FontRom, NetworkSink};
    use crate::dma::DmaController;
    use crate::irq::{InterruptAggregator, InterruptSink};
    use crate::scheduler::EventScheduler;

    struct NullSink;
    impl InterruptSink for NullSink {
        fn notify(&mut self, _line: u8, _asserted: bool, _aggregate: bool) {}
    }
    struct NullCollabs;
    impl NetworkSink for NullCollabs {
        fn transmit(&mut self, _frame: &[u8]) {}
    }
    impl DisplaySink for NullCollabs {
        fn blit(&mut self, _x: u32, _y: u32, _w: u32, _h: u32, _p: &[u32]) {}
    }
    impl FontRom for NullCollabs {
        fn glyph(&self, _c: u8, _ch: u8, _row: u8) -> u8 {
            0
        }
    }
    impl DiskImageStore for NullCollabs {
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
    struct RecordingAudio {
        pushed: Vec<[i16; 2]>,
    }
    impl crate::device::AudioSink for RecordingAudio {
        fn push_samples(&mut self, samples: &[i16]) {
            self.pushed.push([samples[0], samples[1]]);
        }
    }

    fn with_ctx<R>(
        mem: &mut FlatGuestMemory,
        audio: &mut RecordingAudio,
        sched: &mut EventScheduler,
        f: impl FnOnce(&mut SystemContext) -> R,
    ) -> R {
        let mut irqagg = InterruptAggregator::new();
        let mut sink = NullSink;
        let mut dma = DmaController::new();
        let mut net = NullCollabs;
        let mut disp = NullCollabs;
        let font = NullCollabs;
        let mut disk = NullCollabs;
        let mut ctx = SystemContext {
            now: VirtualTime::ZERO,
            device_id: DeviceId::new(0),
            scheduler: sched,
            irq: &mut irqagg,
            irq_sink: &mut sink,
            dma: &mut dma,
            memory: mem,
            network: &mut net,
            display: &mut disp,
            audio,
            font_rom: &font,
            disk_store: &mut disk,
        };
        f(&mut ctx)
    }

    fn wire(ac97: &Ac97, channel: usize, sched: &mut EventScheduler) {
        let dma = sched.alloc(DeviceId::new(0), dma_tag(channel));
        let poll = sched.alloc(DeviceId::new(0), poll_tag(channel));
        let mut s = ac97.shared.borrow_mut();
        s.channels[channel].dma_timer = Some(dma);
        s.channels[channel].poll_timer = Some(poll);
    }

    #[test]
    fn one_shot_playback_consumes_full_descriptor_chain_and_fires_eol_once() {
        let (ac97, _codec) = Ac97::new(Ac97Config { sgd_base: 0x300, codec_base: 0x400, irq_line: 5 }).unwrap();
        let mut sched = EventScheduler::new();
        wire(&ac97, 0, &mut sched);

        let mut mem = FlatGuestMemory::new(0x20000);
        // Descriptor list at 0x0.
        mem.write_u32(0x0, 0x10000);
        mem.write_u32(0x4, 0x800); // count=0x800, flags=0x00
        mem.write_u32(0x8, 0x10800);
        mem.write_u32(0xc, 0x800 | (0xC0 << 24)); // count=0x800, flags = EOL|STOP

        let mut audio = RecordingAudio::default();
        let mut eol_irqs = 0u32;
        with_ctx(&mut mem, &mut audio, &mut sched, |ctx| {
            {
                let mut s = ac97.shared.borrow_mut();
                s.channels[0].base_entry_ptr = 0x0;
                s.channels[0].format_ie = FMT_IE_EOL | FMT_STEREO | FMT_BITS16;
            }
            let mut dev = Ac97 { shared: ac97.shared.clone() };
            PortIo::write_byte(&mut dev, ctx, REG_CONTROL, CONTROL_RUN);

            // Drain the DMA and poll processes in lockstep (4 bytes in, 4
            // bytes out per round, stereo 16-bit) until the channel halts.
            for _ in 0..1100 {
                if ac97.shared.borrow().channels[0].control & CONTROL_RUN == 0 {
                    break;
                }
                let was_eol = ac97.shared.borrow().channels[0].status & STATUS_EOL != 0;
                ac97.shared.borrow_mut().dma_process(ctx, 0);
                ac97.shared.borrow_mut().poll_process(ctx, 0);
                if !was_eol && ac97.shared.borrow().channels[0].status & STATUS_EOL != 0 {
                    eol_irqs += 1;
                }
            }
        });

        let s = ac97.shared.borrow();
        assert!(s.channels[0].status & STATUS_EOL != 0);
        assert_eq!(s.channels[0].control & CONTROL_RUN, 0);
        assert_eq!(eol_irqs, 1);
        // 0x1000 bytes total across both descriptors.
        assert_eq!(s.channels[0].entry_ptr, 0x10); // two 8-byte descriptors consumed
    }

    #[test]
    fn attenuation_clamps_at_minus_46_5_db() {
        let full = attenuation_linear(0);
        let clamped = attenuation_linear(255);
        assert!((full - 1.0).abs() < 1e-6);
        assert!(clamped > 0.0 && clamped < 0.01);
    }

    #[test]
    fn mono_8bit_poll_duplicates_across_stereo_and_applies_volume() {
        let (ac97, _codec) = Ac97::new(Ac97Config { sgd_base: 0x300, codec_base: 0x400, irq_line: 5 }).unwrap();
        let mut sched = EventScheduler::new();
        wire(&ac97, 0, &mut sched);
        let mut mem = FlatGuestMemory::new(16);
        let mut audio = RecordingAudio::default();
        {
            let mut s = ac97.shared.borrow_mut();
            s.channels[0].fifo.push_back(0xff); // max unsigned 8-bit sample
            s.channels[0].vol_steps = 0;
            s.master_vol_steps = 0;
        }
        with_ctx(&mut mem, &mut audio, &mut sched, |ctx| {
            ac97.shared.borrow_mut().poll_process(ctx, 0);
        });
        let [l, r] = audio.pushed[0];
        assert_eq!(l, r);
        assert!(l > 0);
    }
}
