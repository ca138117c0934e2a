//! Pro Audio Spectrum DMA audio engine.
//!
//! Unlike the AC'97 engine (which walks scatter-gather descriptors
//! directly against guest memory), PAS16 drains samples through the
//! legacy [`crate::dma::DmaController`] channel-read path, one byte (or
//! one word, on a 16-bit channel) per sample tick. Two internal counters
//! modelled on the board's built-in 8253-class PIT drive that cadence: a
//! sample-rate timer that fires once per sample, and a sample-count timer
//! that counts sample ticks down to a terminal-count interrupt.
//!
//! Three port windows are exposed, matching the split described in
//! §6: a 16-byte mixer/DMA register window, a 16-byte timer diagnostic
//! window, and a Compat-SB alias window whose steering bits pick which
//! IRQ/DMA the (unemulated, pass-through) Sound-Blaster-Pro personality
//! sees.

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

const MIXER_WINDOW_LEN: u32 = 16;
const TIMER_WINDOW_LEN: u32 = 16;
const COMPAT_SB_WINDOW_LEN: u32 = 16;

const PIT_HZ: u64 = 1_193_180;

const REG_SAMPLE_RATE_LO: u32 = 0x0;
const REG_SAMPLE_RATE_HI: u32 = 0x1;
const REG_SAMPLE_COUNT_LO: u32 = 0x2;
const REG_SAMPLE_COUNT_HI: u32 = 0x3;
const REG_CONTROL: u32 = 0x4;
const REG_DMA_CHANNEL: u32 = 0x5;
const REG_IRQ_LINE: u32 = 0x6;
const REG_STATUS: u32 = 0x7;
const REG_IE: u32 = 0x8;
const REG_COMPAT_STEER: u32 = 0x9;
const REG_PRESCALER: u32 = 0xa;

const CONTROL_STEREO: u8 = 0x01;
const CONTROL_BITS16: u8 = 0x02;
const CONTROL_RUN: u8 = 0x04;
const CONTROL_AUTO_INIT: u8 = 0x08;

const STATUS_SAMPLE_DONE: u8 = 0x01;
const IE_SAMPLE_DONE: u8 = 0x01;

const TIMER_SAMPLE_RATE: TimerTag = 0;

fn pit_ticks_to_virtual_ticks(pit_ticks: u32) -> i64 {
    (((pit_ticks as u64) * 1_000_000) / PIT_HZ).max(1) as i64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pas16Config {
    pub base: u16,
    pub irq_line: u8,
    pub dma_channel: u8,
}

impl Pas16Config {
    fn validate(&self) -> CoreResult<()> {
        if self.dma_channel as usize >= crate::dma::CHANNEL_COUNT {
            return Err(CoreError::config("pas16", "dma_channel out of range"));
        }
        Ok(())
    }
}

struct Pas16State {
    irq_line: u8,
    dma_channel: u8,
    sample_rate_reload: u16,
    sample_count_reload: u16,
    sample_count_remaining: u16,
    control: u8,
    status: u8,
    ie: u8,
    compat_steer: u8,
    prescaler: u8,
    stereo_phase: bool, // false = next sample is left, true = next is right
    sample_timer: Option<EventHandle>,
    timer_window: [u8; TIMER_WINDOW_LEN as usize],
    compat_sb_window: [u8; COMPAT_SB_WINDOW_LEN as usize],
    irq_asserted: bool,
}

impl Pas16State {
    fn new() -> Self {
        Self {
            irq_line: 0,
            dma_channel: 1,
            sample_rate_reload: 0xffff,
            sample_count_reload: 0xffff,
            sample_count_remaining: 0xffff,
            control: 0,
            status: 0,
            ie: 0,
            compat_steer: 0,
            prescaler: 0,
            stereo_phase: false,
            sample_timer: None,
            timer_window: [0; TIMER_WINDOW_LEN as usize],
            compat_sb_window: [0; COMPAT_SB_WINDOW_LEN as usize],
            irq_asserted: false,
        }
    }

    fn sample_period_ticks(&self) -> i64 {
        let divisor = (self.sample_rate_reload.max(1) as u32) * (self.prescaler.max(1) as u32);
        pit_ticks_to_virtual_ticks(divisor)
    }

    fn running(&self) -> bool {
        self.control & CONTROL_RUN != 0
    }

    fn start(&mut self, ctx: &mut SystemContext) {
        self.sample_count_remaining = self.sample_count_reload;
        self.stereo_phase = false;
        if let Some(h) = self.sample_timer {
            ctx.arm(h, self.sample_period_ticks());
        }
    }

    fn stop(&mut self, ctx: &mut SystemContext) {
        self.control &= !CONTROL_RUN;
        if let Some(h) = self.sample_timer {
            ctx.disarm(h);
        }
    }

    fn update_irq(&mut self, ctx: &mut SystemContext) {
        let asserted = self.status & STATUS_SAMPLE_DONE != 0 && self.ie & IE_SAMPLE_DONE != 0;
        if asserted != self.irq_asserted {
            self.irq_asserted = asserted;
            if asserted {
                ctx.raise_irq(self.irq_line, IrqMode::Level);
            } else {
                ctx.clear_irq(self.irq_line);
            }
        }
    }

    /// §4.11's per-sample-tick state machine: pull one byte (8-bit
    /// channel) or two bytes (16-bit channel) from the configured DMA
    /// channel, route into left/right per the stereo-alternation rule (or
    /// duplicate across both in mono), then step the sample-count timer.
    fn sample_tick(&mut self, ctx: &mut SystemContext) {
        if !self.running() {
            return;
        }
        let channel = self.dma_channel as usize;
        let raw: i32 = if self.control & CONTROL_BITS16 != 0 {
            let lo = ctx.dma.channel_read(channel, ctx.memory).unwrap_or(0);
            let hi = ctx.dma.channel_read(channel, ctx.memory).unwrap_or(0);
            i16::from_le_bytes([lo, hi]) as i32
        } else {
            let b = ctx.dma.channel_read(channel, ctx.memory).unwrap_or(0x80);
            ((b ^ 0x80) as i32) << 8
        };
        let sample = raw.clamp(i16::MIN as i32, i16::MAX as i32) as i16;

        if self.control & CONTROL_STEREO != 0 {
            // Alternates which output channel this tick's sample lands in;
            // the other channel of the pair carries silence for this tick
            // rather than a stale repeat, matching the uncommented (no
            // cross-channel mix) path in the source this is grounded on.
            if self.stereo_phase {
                ctx.audio.push_samples(&[0, sample]);
            } else {
                ctx.audio.push_samples(&[sample, 0]);
            }
            self.stereo_phase = !self.stereo_phase;
        } else {
            ctx.audio.push_samples(&[sample, sample]);
        }

        if self.sample_count_remaining > 0 {
            self.sample_count_remaining -= 1;
        }
        if self.sample_count_remaining == 0 {
            self.status |= STATUS_SAMPLE_DONE;
            self.update_irq(ctx);
            if self.control & CONTROL_AUTO_INIT != 0 {
                self.sample_count_remaining = self.sample_count_reload;
            } else {
                self.stop(ctx);
                return;
            }
        }
        if let Some(h) = self.sample_timer {
            ctx.arm(h, self.sample_period_ticks());
        }
    }
}

pub struct Pas16 {
    shared: Rc<RefCell<Pas16State>>,
}

pub struct Pas16Timer {
    shared: Rc<RefCell<Pas16State>>,
}

pub struct Pas16CompatSb {
    shared: Rc<RefCell<Pas16State>>,
}

impl Pas16 {
    pub fn new(config: Pas16Config) -> CoreResult<(Self, Pas16Timer, Pas16CompatSb)> {
        config.validate()?;
        let mut state = Pas16State::new();
        state.irq_line = config.irq_line;
        state.dma_channel = config.dma_channel;
        let shared = Rc::new(RefCell::new(state));
        Ok((
            Self { shared: shared.clone() },
            Pas16Timer { shared: shared.clone() },
            Pas16CompatSb { shared },
        ))
    }

    pub fn install(
        self,
        timer: Pas16Timer,
        compat_sb: Pas16CompatSb,
        registry: &mut DeviceRegistry,
        base: u16,
    ) -> DeviceId {
        let shared = self.shared.clone();
        let mixer_id = registry.register(Box::new(self));
        let timer_id = registry.register(Box::new(timer));
        let compat_id = registry.register(Box::new(compat_sb));
        registry.install_io(mixer_id, base.wrapping_add(0xb80), MIXER_WINDOW_LEN);
        registry.install_io(timer_id, base.wrapping_add(0x1380), TIMER_WINDOW_LEN);
        registry.install_io(compat_id, base, COMPAT_SB_WINDOW_LEN);
        let handle = registry.alloc_event(mixer_id, TIMER_SAMPLE_RATE);
        shared.borrow_mut().sample_timer = Some(handle);
        mixer_id
    }
}

impl Device for Pas16 {
    fn kind(&self) -> &'static str {
        "pas16-mixer"
    }

    fn reset(&mut self, ctx: &mut SystemContext) {
        let mut s = self.shared.borrow_mut();
        s.control = 0;
        s.status = 0;
        s.ie = 0;
        s.sample_count_remaining = s.sample_count_reload;
        s.irq_asserted = false;
        if let Some(h) = s.sample_timer {
            ctx.disarm(h);
        }
    }

    fn tick(&mut self, ctx: &mut SystemContext, tag: TimerTag, _now: VirtualTime) {
        if tag == TIMER_SAMPLE_RATE {
            self.shared.borrow_mut().sample_tick(ctx);
        }
    }

    fn close(&mut self, ctx: &mut SystemContext) {
        let handle = self.shared.borrow_mut().sample_timer.take();
        if let Some(h) = handle {
            ctx.disarm(h);
        }
    }

    fn config(&self) -> Option<DeviceConfig> {
        Some(DeviceConfig { name: "pas16", description: "Pro Audio Spectrum DMA audio engine".into() })
    }
}

impl PortIo for Pas16 {
    fn read_byte(&mut self, _ctx: &mut SystemContext, offset: u32) -> u8 {
        let s = self.shared.borrow();
        match offset {
            REG_SAMPLE_RATE_LO => (s.sample_rate_reload & 0xff) as u8,
            REG_SAMPLE_RATE_HI => (s.sample_rate_reload >> 8) as u8,
            REG_SAMPLE_COUNT_LO => (s.sample_count_reload & 0xff) as u8,
            REG_SAMPLE_COUNT_HI => (s.sample_count_reload >> 8) as u8,
            REG_CONTROL => s.control,
            REG_DMA_CHANNEL => s.dma_channel,
            REG_IRQ_LINE => s.irq_line,
            REG_STATUS => s.status,
            REG_IE => s.ie,
            REG_COMPAT_STEER => s.compat_steer,
            REG_PRESCALER => s.prescaler,
            _ => 0xff,
        }
    }

    fn write_byte(&mut self, ctx: &mut SystemContext, offset: u32, value: u8) {
        let mut s = self.shared.borrow_mut();
        match offset {
            REG_SAMPLE_RATE_LO => s.sample_rate_reload = (s.sample_rate_reload & 0xff00) | value as u16,
            REG_SAMPLE_RATE_HI => s.sample_rate_reload = (s.sample_rate_reload & 0x00ff) | ((value as u16) << 8),
            REG_SAMPLE_COUNT_LO => s.sample_count_reload = (s.sample_count_reload & 0xff00) | value as u16,
            REG_SAMPLE_COUNT_HI => s.sample_count_reload = (s.sample_count_reload & 0x00ff) | ((value as u16) << 8),
            REG_CONTROL => {
                let was_running = s.running();
                s.control = value;
                if s.running() && !was_running {
                    s.start(ctx);
                } else if !s.running() && was_running {
                    s.stop(ctx);
                }
            }
            REG_DMA_CHANNEL => s.dma_channel = value % crate::dma::CHANNEL_COUNT as u8,
            REG_IRQ_LINE => s.irq_line = value,
            REG_STATUS => {
                s.status &= !value; // write-1-to-clear
                s.update_irq(ctx);
            }
            REG_IE => {
                s.ie = value;
                s.update_irq(ctx);
            }
            REG_COMPAT_STEER => s.compat_steer = value,
            REG_PRESCALER => s.prescaler = value,
            _ => {}
        }
    }
}

impl Device for Pas16Timer {
    fn kind(&self) -> &'static str {
        "pas16-timer"
    }
    fn reset(&mut self, _ctx: &mut SystemContext) {
        self.shared.borrow_mut().timer_window = [0; TIMER_WINDOW_LEN as usize];
    }
    fn tick(&mut self, _ctx: &mut SystemContext, _tag: TimerTag, _now: VirtualTime) {}
}

impl PortIo for Pas16Timer {
    /// Diagnostic readback of the two built-in counters' live state, not
    /// used by the sample-tick path itself.
    fn read_byte(&mut self, _ctx: &mut SystemContext, offset: u32) -> u8 {
        let s = self.shared.borrow();
        match offset {
            0x0 => (s.sample_count_remaining & 0xff) as u8,
            0x1 => (s.sample_count_remaining >> 8) as u8,
            0x2 => (s.sample_rate_reload & 0xff) as u8,
            0x3 => (s.sample_rate_reload >> 8) as u8,
            other => s.timer_window[other as usize % TIMER_WINDOW_LEN as usize],
        }
    }
    fn write_byte(&mut self, _ctx: &mut SystemContext, offset: u32, value: u8) {
        let mut s = self.shared.borrow_mut();
        let idx = offset as usize % TIMER_WINDOW_LEN as usize;
        s.timer_window[idx] = value;
    }
}

impl Device for Pas16CompatSb {
    fn kind(&self) -> &'static str {
        "pas16-compat-sb"
    }
    fn reset(&mut self, _ctx: &mut SystemContext) {
        self.shared.borrow_mut().compat_sb_window = [0; COMPAT_SB_WINDOW_LEN as usize];
    }
    fn tick(&mut self, _ctx: &mut SystemContext, _tag: TimerTag, _now: VirtualTime) {}
}

impl PortIo for Pas16CompatSb {
    /// The Compat-SB alias window is a pass-through stub: register
    /// presence and the steering bits are modelled, but emulating the
    /// Sound-Blaster-Pro DSP command protocol itself is out of scope.
    fn read_byte(&mut self, _ctx: &mut SystemContext, offset: u32) -> u8 {
        let s = self.shared.borrow();
        s.compat_sb_window[offset as usize % COMPAT_SB_WINDOW_LEN as usize]
    }
    fn write_byte(&mut self, _ctx: &mut SystemContext, offset: u32, value: u8) {
        let mut s = self.shared.borrow_mut();
        let idx = offset as usize % COMPAT_SB_WINDOW_LEN as usize;
        s.compat_sb_window[idx] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FlatGuestMemory;
    use crate::device::{AudioSink, DiskImageStore, DisplaySink, FontRom, NetworkSink};
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
    impl AudioSink for RecordingAudio {
        fn push_samples(&mut self, samples: &[i16]) {
            self.pushed.push([samples[0], samples[1]]);
        }
    }

    fn with_ctx<R>(
        mem: &mut FlatGuestMemory,
        dma: &mut DmaController,
        audio: &mut RecordingAudio,
        sched: &mut EventScheduler,
        f: impl FnOnce(&mut SystemContext) -> R,
    ) -> R {
        let mut irqagg = InterruptAggregator::new();
        let mut sink = NullSink;
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
            dma,
            memory: mem,
            network: &mut net,
            display: &mut disp,
            audio,
            font_rom: &font,
            disk_store: &mut disk,
        };
        f(&mut ctx)
    }

    fn wire(pas: &Pas16, sched: &mut EventScheduler) {
        let handle = sched.alloc(DeviceId::new(0), TIMER_SAMPLE_RATE);
        pas.shared.borrow_mut().sample_timer = Some(handle);
    }

    #[test]
    fn mono_8bit_duplicates_sample_across_both_output_channels() {
        let (pas, _timer, _compat) =
            Pas16::new(Pas16Config { base: 0x388, irq_line: 10, dma_channel: 1 }).unwrap();
        let mut sched = EventScheduler::new();
        wire(&pas, &mut sched);

        let mut dma = DmaController::new();
        dma.channel_mut(1).program_address(0);
        dma.channel_mut(1).program_count(10);
        dma.channel_mut(1).masked = false;
        let mut mem = FlatGuestMemory::new(64);
        mem.bytes[0] = 0xff; // max unsigned 8-bit sample

        let mut audio = RecordingAudio::default();
        with_ctx(&mut mem, &mut dma, &mut audio, &mut sched, |ctx| {
            {
                let mut s = pas.shared.borrow_mut();
                s.sample_count_reload = 4;
                s.control = CONTROL_RUN;
            }
            pas.shared.borrow_mut().start(ctx);
            pas.shared.borrow_mut().sample_tick(ctx);
        });

        let [l, r] = audio.pushed[0];
        assert_eq!(l, r);
        assert!(l > 0);
    }

    #[test]
    fn stereo_alternates_left_and_right_across_ticks() {
        let (pas, _timer, _compat) =
            Pas16::new(Pas16Config { base: 0x388, irq_line: 10, dma_channel: 1 }).unwrap();
        let mut sched = EventScheduler::new();
        wire(&pas, &mut sched);

        let mut dma = DmaController::new();
        dma.channel_mut(1).program_address(0);
        dma.channel_mut(1).program_count(10);
        dma.channel_mut(1).masked = false;
        let mut mem = FlatGuestMemory::new(64);
        mem.bytes[0] = 0xff;
        mem.bytes[1] = 0xff;

        let mut audio = RecordingAudio::default();
        with_ctx(&mut mem, &mut dma, &mut audio, &mut sched, |ctx| {
            {
                let mut s = pas.shared.borrow_mut();
                s.sample_count_reload = 4;
                s.control = CONTROL_RUN | CONTROL_STEREO;
            }
            pas.shared.borrow_mut().start(ctx);
            pas.shared.borrow_mut().sample_tick(ctx);
            pas.shared.borrow_mut().sample_tick(ctx);
        });

        assert_ne!(audio.pushed[0][0], 0);
        assert_eq!(audio.pushed[0][1], 0);
        assert_eq!(audio.pushed[1][0], 0);
        assert_ne!(audio.pushed[1][1], 0);
    }

    #[test]
    fn sample_count_terminal_count_sets_status_and_stops_without_auto_init() {
        let (pas, _timer, _compat) =
            Pas16::new(Pas16Config { base: 0x388, irq_line: 10, dma_channel: 1 }).unwrap();
        let mut sched = EventScheduler::new();
        wire(&pas, &mut sched);

        let mut dma = DmaController::new();
        dma.channel_mut(1).program_address(0);
        dma.channel_mut(1).program_count(10);
        dma.channel_mut(1).masked = false;
        let mut mem = FlatGuestMemory::new(64);

        let mut audio = RecordingAudio::default();
        with_ctx(&mut mem, &mut dma, &mut audio, &mut sched, |ctx| {
            {
                let mut s = pas.shared.borrow_mut();
                s.sample_count_reload = 1;
                s.control = CONTROL_RUN;
                s.ie = IE_SAMPLE_DONE;
            }
            pas.shared.borrow_mut().start(ctx);
            pas.shared.borrow_mut().sample_tick(ctx);
        });

        let s = pas.shared.borrow();
        assert!(s.status & STATUS_SAMPLE_DONE != 0);
        assert_eq!(s.control & CONTROL_RUN, 0);
    }

    #[test]
    fn pit_ticks_convert_to_microsecond_granularity() {
        // One full 1.193180 MHz PIT tick is less than 2us.
        assert!(pit_ticks_to_virtual_ticks(1) <= 2);
        // 1193 PIT ticks is ~1ms.
        assert_eq!(pit_ticks_to_virtual_ticks(1_193_180), 1_000_000);
    }
}
