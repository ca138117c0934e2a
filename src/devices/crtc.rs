//! CRT controller + CGA/MDA-family video pipeline.
//!
//! One logical device exposes two address-space windows: the CRTC index/
//! data/mode/colour/status I/O ports, and the VRAM byte range. They are
//! modelled as two small facades (`CrtcPorts`, `CrtcVram`) sharing one
//! `Rc<RefCell<CrtcState>>` — a single `PortIo::read_byte(ctx, offset)`
//! can't otherwise tell "I/O offset 3" from "VRAM offset 3" once the bus
//! has already resolved which range matched.

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::context::SystemContext;
use crate::device::{Device, DeviceConfig, DeviceId, FontRom, PortIo};
use crate::error::{CoreError, CoreResult};
use crate::registry::DeviceRegistry;
use crate::scheduler::{EventHandle, TimerTag};
use crate::time::VirtualTime;

const VRAM_MASK_CGA: usize = 0x3fff;
const VRAM_MASK_MDA: usize = 0x1fff;
const BLINK_PERIOD_FRAMES: u8 = 16;
const TIMER_DISPON: TimerTag = 0;
const TIMER_DISPOFF: TimerTag = 1;

/// InColor-style vendor register: spec.md §6 notes "InColor adds vendor
/// registers at CRTC indices 20..28"; this is the first of that block,
/// carrying the bits the base CRTC register table has no room for (pixel
/// depth, composite output, line-doubling mode).
const REG_EXTENDED_MODE: usize = 20;

bitflags! {
    #[derive(Default, Clone, Copy)]
    pub struct ModeControl: u8 {
        const HIRES_TEXT     = 0x01;
        const GRAPHICS       = 0x02;
        const MONOCHROME     = 0x04;
        const VIDEO_ENABLE   = 0x08;
        const HIRES_GRAPHICS = 0x10;
        const BLINK_ENABLE   = 0x20;
    }
}

bitflags! {
    #[derive(Default, Clone, Copy)]
    pub struct StatusReg: u8 {
        const RETRACE           = 0x01;
        const LIGHT_PEN_TRIGGER = 0x02;
        const LIGHT_PEN_SWITCH  = 0x04;
        const VERTICAL_RETRACE  = 0x08;
    }
}

bitflags! {
    /// Vendor register 20: bits 0-1 select graphics bits-per-pixel (00 =
    /// 1bpp, 01 = 2bpp, 10 = 4bpp, 11 reserved), bit 2 routes the frame
    /// through the composite post-process, bits 3-4 select the line-
    /// doubling mode.
    #[derive(Default, Clone, Copy)]
    pub struct ExtendedMode: u8 {
        const BPP_LO         = 0x01;
        const BPP_HI         = 0x02;
        const COMPOSITE      = 0x04;
        const DOUBLE_LINE    = 0x08;
        const DOUBLE_SRGB    = 0x10;
        const DOUBLE_LINEAR  = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineDoubling {
    /// Each raw scan line is emitted once; no doubling.
    Off,
    /// Each raw scan line is emitted twice, identically.
    Identical,
    /// Each raw scan line is followed by a copy blended 50/50 against the
    /// next line in sRGB space (per-channel `pow(2.199)` gamma blend).
    SrgbBlend,
    /// As `SrgbBlend`, but the blend happens in linear light.
    LinearBlend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrtcConfig {
    pub io_base: u16,
    pub mda: bool,
    pub vram_len: u32,
    /// Whether this card model exhibits CPU-access-during-dispon VRAM
    /// corruption ("snow"). Off by default; only a handful of early CGA
    /// clones without wait-state logic actually show it.
    #[serde(default)]
    pub snow_enabled: bool,
}

impl CrtcConfig {
    fn validate(&self) -> CoreResult<()> {
        if self.vram_len == 0 || self.vram_len > 0x10000 {
            return Err(CoreError::config("crtc", format!("implausible vram length {}", self.vram_len)));
        }
        Ok(())
    }
}

/// Register indices from the programmable register table.
mod reg {
    pub const HTOTAL: usize = 0;
    pub const HDISP: usize = 1;
    pub const VTOTAL: usize = 4;
    pub const VTOTAL_ADJ: usize = 5;
    pub const VDISP: usize = 6;
    pub const VSYNC: usize = 7;
    pub const MAX_SCAN_LINE: usize = 9;
    pub const CURSOR_START: usize = 10;
    pub const CURSOR_END: usize = 11;
    pub const START_ADDR_HI: usize = 12;
    pub const START_ADDR_LO: usize = 13;
    pub const CURSOR_ADDR_HI: usize = 14;
    pub const CURSOR_ADDR_LO: usize = 15;
}

/// Write masks for registers 0..=15; undocumented registers beyond that
/// are stored unmasked and never consulted by the renderer.
const REG_MASK: [u8; 16] = [
    0xff, 0xff, 0xff, 0xff, 0x7f, 0x1f, 0x7f, 0x7f, 0xf3, 0x1f, 0x7f, 0x1f, 0x3f, 0xff, 0x3f, 0xff,
];

fn palette_rgb(index: u8) -> u32 {
    const CGA16: [u32; 16] = [
        0x00_00_00, 0x00_00_aa, 0x00_aa_00, 0x00_aa_aa, 0xaa_00_00, 0xaa_00_aa, 0xaa_55_00, 0xaa_aa_aa, 0x55_55_55, 0x55_55_ff, 0x55_ff_55,
        0x55_ff_ff, 0xff_55_55, 0xff_55_ff, 0xff_ff_55, 0xff_ff_ff,
    ];
    CGA16[(index & 0x0f) as usize]
}

/// sRGB -> linear-light lookup, one entry per 8-bit channel value,
/// computed once at first use rather than per pixel.
fn srgb_to_linear_lut() -> &'static [f32; 256] {
    static LUT: std::sync::OnceLock<[f32; 256]> = std::sync::OnceLock::new();
    LUT.get_or_init(|| {
        let mut table = [0.0f32; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = (i as f32 / 255.0).powf(2.199);
        }
        table
    })
}

fn linear_to_srgb_lut() -> &'static [u8; 4096] {
    static LUT: std::sync::OnceLock<[u8; 4096]> = std::sync::OnceLock::new();
    LUT.get_or_init(|| {
        let mut table = [0u8; 4096];
        for (i, slot) in table.iter_mut().enumerate() {
            let linear = i as f32 / 4095.0;
            *slot = (linear.powf(1.0 / 2.199) * 255.0).round().clamp(0.0, 255.0) as u8;
        }
        table
    })
}

/// A precomputed 16-entry colour LUT for the composite post-process: each
/// of the 16 possible 4-pixel on/off patterns within an NTSC colour-clock
/// group maps to one synthesized hue. Computed once, not per line.
fn composite_lut() -> &'static [u32; 16] {
    static LUT: std::sync::OnceLock<[u32; 16]> = std::sync::OnceLock::new();
    LUT.get_or_init(|| {
        let mut table = [0u32; 16];
        for (code, slot) in table.iter_mut().enumerate() {
            let density = code.count_ones() as f32 / 4.0;
            let hue = code as f32 / 16.0;
            let r = ((hue * std::f32::consts::TAU).sin() * 0.5 + 0.5) * density;
            let g = (((hue + 1.0 / 3.0) * std::f32::consts::TAU).sin() * 0.5 + 0.5) * density;
            let b = (((hue + 2.0 / 3.0) * std::f32::consts::TAU).sin() * 0.5 + 0.5) * density;
            *slot = ((r * 255.0) as u32) << 16 | ((g * 255.0) as u32) << 8 | (b * 255.0) as u32;
        }
        table
    })
}

/// Blend two already-gamma-encoded sRGB pixels 50/50, per spec.md §4.5's
/// "interpolated in sRGB (per-channel pow 2.199 blend at factor 0.5)".
fn blend_srgb(a: u32, b: u32, linear_space: bool) -> u32 {
    let [ar, ag, ab] = [(a >> 16) as u8, (a >> 8) as u8, a as u8];
    let [br, bg, bb] = [(b >> 16) as u8, (b >> 8) as u8, b as u8];
    if !linear_space {
        let r = (ar as u16 + br as u16) / 2;
        let g = (ag as u16 + bg as u16) / 2;
        let b = (ab as u16 + bb as u16) / 2;
        return (r as u32) << 16 | (g as u32) << 8 | b as u32;
    }
    let to_linear = srgb_to_linear_lut();
    let mix = |x: u8, y: u8| -> u8 {
        let blended = (to_linear[x as usize] + to_linear[y as usize]) * 0.5;
        let idx = (blended * 4095.0).round().clamp(0.0, 4095.0) as usize;
        linear_to_srgb_lut()[idx]
    };
    let r = mix(ar, br);
    let g = mix(ag, bg);
    let b = mix(ab, bb);
    (r as u32) << 16 | (g as u32) << 8 | b as u32
}

struct CrtcState {
    regs: [u8; 32],
    index: u8,
    mode: ModeControl,
    color_select: u8,
    status: StatusReg,
    vram: Vec<u8>,
    vram_mask: usize,
    memory_address: u16,
    scan_line: u8,
    vertical_counter: u8,
    vertical_adjust_remaining: u8,
    blink_counter: u8,
    in_dispon: bool,
    frame_buffer: Vec<u32>,
    frame_width: u32,
    dispon: Option<EventHandle>,
    dispoff: Option<EventHandle>,
    snow_enabled: bool,
}

impl CrtcState {
    fn new(config: &CrtcConfig) -> Self {
        Self {
            regs: [0; 32],
            index: 0,
            mode: ModeControl::empty(),
            color_select: 0,
            status: StatusReg::empty(),
            vram: vec![0; config.vram_len as usize],
            vram_mask: if config.mda { VRAM_MASK_MDA } else { VRAM_MASK_CGA },
            memory_address: 0,
            scan_line: 0,
            vertical_counter: 0,
            vertical_adjust_remaining: 0,
            blink_counter: 0,
            in_dispon: false,
            frame_buffer: Vec::new(),
            frame_width: 0,
            dispon: None,
            dispoff: None,
            snow_enabled: config.snow_enabled,
        }
    }

    fn reg(&self, idx: usize) -> u8 {
        self.regs.get(idx).copied().unwrap_or(0)
    }

    fn extended_mode(&self) -> ExtendedMode {
        ExtendedMode::from_bits_truncate(self.reg(REG_EXTENDED_MODE))
    }

    fn graphics_bpp(&self) -> u8 {
        match self.extended_mode().bits() & 0x03 {
            0b00 => 1,
            0b01 => 2,
            _ => 4,
        }
    }

    fn line_doubling(&self) -> LineDoubling {
        let ext = self.extended_mode();
        if !ext.contains(ExtendedMode::DOUBLE_LINE) {
            LineDoubling::Off
        } else if ext.contains(ExtendedMode::DOUBLE_LINEAR) {
            LineDoubling::LinearBlend
        } else if ext.contains(ExtendedMode::DOUBLE_SRGB) {
            LineDoubling::SrgbBlend
        } else {
            LineDoubling::Identical
        }
    }

    fn start_address(&self) -> u16 {
        (((self.reg(reg::START_ADDR_HI) & 0x3f) as u16) << 8) | self.reg(reg::START_ADDR_LO) as u16
    }

    fn cursor_address(&self) -> u16 {
        (((self.reg(reg::CURSOR_ADDR_HI) & 0x3f) as u16) << 8) | self.reg(reg::CURSOR_ADDR_LO) as u16
    }

    fn displayed_columns(&self) -> u16 {
        self.reg(reg::HDISP) as u16 + 1
    }

    fn displayed_rows(&self) -> u16 {
        self.reg(reg::VDISP) as u16 + 1
    }

    fn max_scan_line(&self) -> u8 {
        (self.reg(reg::MAX_SCAN_LINE) & 0x1f) + 1
    }

    fn cursor_visible_on_scan_line(&self, scan_line: u8) -> bool {
        let start = self.reg(reg::CURSOR_START) & 0x1f;
        let end = self.reg(reg::CURSOR_END) & 0x1f;
        scan_line >= start && scan_line <= end
    }

    fn write_indexed(&mut self, value: u8) {
        let idx = self.index as usize;
        if idx >= self.regs.len() {
            return;
        }
        let masked = if idx < REG_MASK.len() { value & REG_MASK[idx] } else { value };
        self.regs[idx] = masked;
    }

    /// Render one text-mode scan line, one u32 RGB pixel per dot, 8 dots
    /// per character column.
    fn render_text_line(&self, font_rom: &dyn FontRom, out: &mut Vec<u32>) {
        out.clear();
        let blink_on = self.blink_counter < BLINK_PERIOD_FRAMES / 2;
        let cursor_row = self.cursor_visible_on_scan_line(self.scan_line);
        for col in 0..self.displayed_columns() {
            let cell = self.memory_address.wrapping_add(col) as usize & self.vram_mask;
            let addr = cell * 2;
            let ch = self.vram.get(addr).copied().unwrap_or(0);
            let attr = self.vram.get(addr + 1).copied().unwrap_or(0);
            let glyph_row = font_rom.glyph(0, ch, self.scan_line);
            let fg = palette_rgb(attr & 0x0f);
            let mut bg = palette_rgb((attr >> 4) & 0x07);
            let blinking = self.mode.contains(ModeControl::BLINK_ENABLE) && attr & 0x80 != 0;
            if blinking && !blink_on {
                bg = fg;
            }
            let is_cursor_cell = cursor_row && cell as u16 == self.cursor_address();
            for bit in 0..8u8 {
                let lit = glyph_row & (0x80 >> bit) != 0;
                let mut rgb = if lit { fg } else { bg };
                if is_cursor_cell {
                    rgb ^= 0x00ff_ffff;
                }
                out.push(rgb);
            }
        }
    }

    /// Unpack pixels from one VRAM byte at the configured bits-per-pixel
    /// (1, 2 or 4), indexing the palette. A non-interleaved simplification
    /// of real CGA's even/odd bank addressing, matching the fidelity
    /// level of the rest of this rendering path.
    fn render_graphics_line(&self, out: &mut Vec<u32>) {
        out.clear();
        let bpp = self.graphics_bpp();
        let pixels_per_byte = 8 / bpp;
        let mask = (1u16 << bpp) as u8 - 1;
        for col in 0..self.displayed_columns() {
            let addr = (self.memory_address.wrapping_add(col) as usize * 2) & self.vram_mask;
            let byte = self.vram.get(addr).copied().unwrap_or(0);
            for p in 0..pixels_per_byte {
                let shift = 8 - bpp * (p + 1);
                let index = (byte >> shift) & mask;
                out.push(palette_rgb(index));
            }
        }
    }

    /// Post-process a rendered line: optionally reinterpret it as a
    /// composite-NTSC signal (orthogonal to whether it came from the text
    /// or graphics renderer), matching spec.md §4.5's "pipeline is
    /// orthogonal to the line renderer."
    fn apply_composite(&self, line: &[u32]) -> Vec<u32> {
        if !self.extended_mode().contains(ExtendedMode::COMPOSITE) {
            return line.to_vec();
        }
        let lut = composite_lut();
        let border_bias = (self.color_select & 0x07) as usize;
        let mut out = Vec::with_capacity(line.len());
        for chunk in line.chunks(4) {
            let mut code = 0u8;
            for (i, &px) in chunk.iter().enumerate() {
                if px != 0 {
                    code |= 1 << i;
                }
            }
            let color = lut[(code as usize + border_bias) & 0x0f];
            out.extend(std::iter::repeat(color).take(chunk.len()));
        }
        out
    }

    fn render_scan_line_into_frame(&mut self, font_rom: &dyn FontRom, row: u16) {
        let mut line = Vec::new();
        if self.mode.contains(ModeControl::GRAPHICS) {
            self.render_graphics_line(&mut line);
        } else {
            self.render_text_line(font_rom, &mut line);
        }
        let line = self.apply_composite(&line);
        self.frame_width = line.len() as u32;
        self.push_output_rows(row, &line);
    }

    /// Append one or two output rows for `row`, per the configured
    /// line-doubling mode; `row` still indexes raw (undoubled) scan lines,
    /// so the frame buffer's row count is `row * rows_per_line`.
    fn push_output_rows(&mut self, row: u16, line: &[u32]) {
        let rows_per_line: usize = if self.line_doubling() == LineDoubling::Off { 1 } else { 2 };
        let base = row as usize * rows_per_line * self.frame_width as usize;
        let needed = base + rows_per_line * line.len();
        if self.frame_buffer.len() < needed {
            self.frame_buffer.resize(needed, 0);
        }
        self.frame_buffer[base..base + line.len()].copy_from_slice(line);
        match self.line_doubling() {
            LineDoubling::Off => {}
            LineDoubling::Identical => {
                self.frame_buffer[base + line.len()..base + 2 * line.len()].copy_from_slice(line);
            }
            LineDoubling::SrgbBlend | LineDoubling::LinearBlend => {
                let linear = self.line_doubling() == LineDoubling::LinearBlend;
                // Blend against the previous raw line (or itself, at the
                // very first row, since there is nothing earlier to blend
                // with).
                let prev_base = base.checked_sub(rows_per_line * self.frame_width as usize);
                let second_row = &self.frame_buffer[prev_base.unwrap_or(base)..prev_base.unwrap_or(base) + line.len()].to_vec();
                let blended: Vec<u32> = line.iter().zip(second_row.iter()).map(|(&a, &b)| blend_srgb(a, b, linear)).collect();
                self.frame_buffer[base + line.len()..base + 2 * line.len()].copy_from_slice(&blended);
            }
        }
    }

    fn emit_frame(&mut self, display: &mut dyn crate::device::DisplaySink) {
        if self.frame_width == 0 || self.frame_buffer.is_empty() {
            self.frame_buffer.clear();
            return;
        }
        let height = self.frame_buffer.len() as u32 / self.frame_width;
        display.blit(0, 0, self.frame_width, height, &self.frame_buffer);
        self.frame_buffer.clear();
    }

    /// "Snow" emulation: a CPU access to VRAM while the pipeline is in
    /// dispon corrupts the byte at a column derived from how much time
    /// remains on the in-flight dispoff event, masked by 0xFC. spec.md §9
    /// flags this production as an uncorroborated heuristic rather than a
    /// documented hardware behavior, so it is gated behind `snow_enabled`
    /// and not claimed to reproduce real corruption patterns bit-for-bit.
    fn maybe_snow(&mut self, ctx: &mut SystemContext) {
        if !self.snow_enabled || !self.in_dispon {
            return;
        }
        let Some(dispoff) = self.dispoff else { return };
        let Some(deadline) = ctx.scheduler.deadline(dispoff) else { return };
        let remaining = deadline.ticks().saturating_sub(ctx.now.ticks());
        let column = (remaining & 0xfc) as usize & self.vram_mask;
        if let Some(byte) = self.vram.get_mut(column) {
            *byte ^= 0xff;
        }
    }
}

/// The I/O-port-facing half: index/data/mode/colour/status registers.
/// This facade owns the scheduler events and receives `Device::tick`.
pub struct CrtcPorts {
    shared: Rc<RefCell<CrtcState>>,
}

/// The VRAM-facing half: a byte-addressable window onto device memory.
pub struct CrtcVram {
    shared: Rc<RefCell<CrtcState>>,
}

impl CrtcPorts {
    pub fn new(config: CrtcConfig) -> CoreResult<(Self, CrtcVram)> {
        config.validate()?;
        let shared = Rc::new(RefCell::new(CrtcState::new(&config)));
        Ok((Self { shared: shared.clone() }, CrtcVram { shared }))
    }

    /// Register both facades and their address ranges, arming the first
    /// `dispon` event so the pipeline starts running.
    pub fn install(self, vram: CrtcVram, registry: &mut DeviceRegistry, io_base: u16, vram_base: u32) -> DeviceId {
        let shared = self.shared.clone();
        let vram_len = shared.borrow().vram.len() as u32;
        let ports_id = registry.register(Box::new(self));
        let vram_id = registry.register(Box::new(vram));
        registry.install_io(ports_id, io_base, 12);
        registry.install_mem(vram_id, vram_base, vram_len);
        let dispon = registry.alloc_event(ports_id, TIMER_DISPON);
        let dispoff = registry.alloc_event(ports_id, TIMER_DISPOFF);
        {
            let mut state = shared.borrow_mut();
            state.dispon = Some(dispon);
            state.dispoff = Some(dispoff);
        }
        ports_id
    }
}

fn active_period(state: &CrtcState) -> i64 {
    (state.displayed_columns() as i64).max(1)
}

fn blank_period(state: &CrtcState) -> i64 {
    let total = state.reg(reg::HTOTAL) as i64 + 1;
    let disp = state.displayed_columns() as i64;
    (total - disp).max(1)
}

impl Device for CrtcPorts {
    fn kind(&self) -> &'static str {
        "crtc"
    }

    fn reset(&mut self, ctx: &mut SystemContext) {
        let dispon = {
            let mut state = self.shared.borrow_mut();
            state.regs = [0; 32];
            state.index = 0;
            state.mode = ModeControl::empty();
            state.status = StatusReg::empty();
            state.memory_address = 0;
            state.scan_line = 0;
            state.vertical_counter = 0;
            state.blink_counter = 0;
            state.in_dispon = false;
            state.dispon
        };
        if let Some(h) = dispon {
            ctx.arm(h, 1);
        }
    }

    fn tick(&mut self, ctx: &mut SystemContext, tag: TimerTag, _now: VirtualTime) {
        match tag {
            TIMER_DISPON => {
                let (period, dispoff) = {
                    let mut state = self.shared.borrow_mut();
                    state.in_dispon = true;
                    state.status.remove(StatusReg::RETRACE);
                    if state.vertical_counter < state.displayed_rows() as u8 {
                        let row = state.vertical_counter as u16;
                        state.render_scan_line_into_frame(ctx.font_rom, row);
                    }
                    (active_period(&state), state.dispoff)
                };
                if let Some(h) = dispoff {
                    ctx.arm(h, period);
                }
            }
            TIMER_DISPOFF => {
                let (period, dispon, emit) = {
                    let mut state = self.shared.borrow_mut();
                    state.in_dispon = false;
                    state.status.insert(StatusReg::RETRACE);
                    state.scan_line += 1;
                    let mut emit = false;
                    if state.scan_line >= state.max_scan_line() {
                        state.scan_line = 0;
                        state.vertical_counter += 1;
                        let adjust = state.reg(reg::VTOTAL_ADJ);
                        let total = state.reg(reg::VTOTAL) as u16 + 1;
                        if state.vertical_counter as u16 >= total {
                            if adjust > 0 && state.vertical_adjust_remaining == 0 {
                                state.vertical_adjust_remaining = adjust;
                            }
                            if state.vertical_adjust_remaining > 0 {
                                state.vertical_adjust_remaining -= 1;
                            }
                            if state.vertical_adjust_remaining == 0 {
                                state.vertical_counter = 0;
                                state.memory_address = state.start_address();
                                state.blink_counter = (state.blink_counter + 1) % BLINK_PERIOD_FRAMES;
                                emit = true;
                            }
                        }
                    }
                    (blank_period(&state), state.dispon, emit)
                };
                if emit {
                    let mut state = self.shared.borrow_mut();
                    state.emit_frame(ctx.display);
                }
                if let Some(h) = dispon {
                    ctx.arm(h, period);
                }
            }
            _ => {}
        }
    }

    fn config(&self) -> Option<DeviceConfig> {
        Some(DeviceConfig { name: "crtc", description: "CRTC + CGA/MDA video pipeline".into() })
    }
}

impl PortIo for CrtcPorts {
    fn read_byte(&mut self, _ctx: &mut SystemContext, offset: u32) -> u8 {
        let mut state = self.shared.borrow_mut();
        match offset {
            4 => state.index,
            5 => state.reg(state.index as usize),
            8 => state.mode.bits(),
            9 => state.color_select,
            10 => {
                let mut s = state.status;
                if state.in_dispon {
                    s.remove(StatusReg::RETRACE);
                } else {
                    s.insert(StatusReg::RETRACE);
                }
                s.bits()
            }
            _ => 0xff,
        }
    }

    fn write_byte(&mut self, _ctx: &mut SystemContext, offset: u32, value: u8) {
        let mut state = self.shared.borrow_mut();
        match offset {
            4 => state.index = value,
            5 => state.write_indexed(value),
            8 => state.mode = ModeControl::from_bits_truncate(value),
            9 => state.color_select = value,
            _ => {}
        }
    }
}

impl Device for CrtcVram {
    fn kind(&self) -> &'static str {
        "crtc-vram"
    }
    fn reset(&mut self, _ctx: &mut SystemContext) {}
    fn tick(&mut self, _ctx: &mut SystemContext, _tag: TimerTag, _now: VirtualTime) {}
}

impl PortIo for CrtcVram {
    fn read_byte(&mut self, ctx: &mut SystemContext, offset: u32) -> u8 {
        let mut state = self.shared.borrow_mut();
        state.maybe_snow(ctx);
        state.vram.get(offset as usize & state.vram_mask).copied().unwrap_or(0xff)
    }
    fn write_byte(&mut self, ctx: &mut SystemContext, offset: u32, value: u8) {
        let mut state = self.shared.borrow_mut();
        state.maybe_snow(ctx);
        let mask = state.vram_mask;
        if let Some(slot) = state.vram.get_mut(offset as usize & mask) {
            *slot = value;
        }
    }
}
