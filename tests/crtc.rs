//! Crate-level scenario for the CGA text pipeline (spec.md §8 scenario 1):
//! programming a one-character, one-row display and writing a glyph cell
//! into VRAM yields a single `blit` call carrying that glyph's pixels.

mod support;

use pc_core::context::FlatGuestMemory;
use pc_core::device::AccessSize;
use pc_core::devices::crtc::{CrtcConfig, CrtcPorts};

const IO_BASE: u16 = 0x3d0;
const VRAM_BASE: u32 = 0xb8000;

// Register indices, mirroring the CRTC's programmable register table.
const REG_HTOTAL: u8 = 0;
const REG_HDISP: u8 = 1;
const REG_VTOTAL: u8 = 4;
const REG_VDISP: u8 = 6;
const REG_MAX_SCAN_LINE: u8 = 9;

fn select(registry: &mut pc_core::registry::DeviceRegistry, index: u8, value: u8) {
    registry.io_write(IO_BASE + 4, AccessSize::Byte, index as u32);
    registry.io_write(IO_BASE + 5, AccessSize::Byte, value as u32);
}

#[test]
fn one_character_frame_renders_the_cells_glyph_and_emits_a_single_blit() {
    let _ = env_logger::try_init();
    let mut harness = support::Harness::new(FlatGuestMemory::new(0x1000));
    let config = CrtcConfig { io_base: IO_BASE, mda: false, vram_len: 0x4000, snow_enabled: false };
    let (ports, vram) = CrtcPorts::new(config).unwrap();
    let id = ports.install(vram, &mut harness.registry, IO_BASE, VRAM_BASE);
    harness.registry.reset_device(id);

    // One character cell wide, one row tall, one scan line per row: the
    // smallest frame geometry that still exercises the full dispon/dispoff
    // pipeline.
    select(&mut harness.registry, REG_HTOTAL, 0);
    select(&mut harness.registry, REG_HDISP, 0);
    select(&mut harness.registry, REG_VTOTAL, 0);
    select(&mut harness.registry, REG_VDISP, 0);
    select(&mut harness.registry, REG_MAX_SCAN_LINE, 0);
    harness.registry.io_write(IO_BASE + 8, AccessSize::Byte, 0x08); // mode: VIDEO_ENABLE

    // Glyph code 0xAA (the `FlatFont` stub's glyph == its character code)
    // written at cell 0, attribute 0x07 (light grey on black).
    harness.registry.mem_write(VRAM_BASE, AccessSize::Byte, 0xAA);
    harness.registry.mem_write(VRAM_BASE + 1, AccessSize::Byte, 0x07);

    harness.registry.advance(1); // TIMER_DISPON: renders the one scan line
    harness.registry.advance(1); // TIMER_DISPOFF: closes the row, emits the frame

    let blits = harness.blits.borrow();
    assert_eq!(blits.len(), 1, "exactly one row, one frame");
    let frame = &blits[0];
    assert_eq!((frame.x, frame.y, frame.w, frame.h), (0, 0, 8, 1));

    const FG: u32 = 0xaa_aa_aa; // palette index 7, light grey
    const BG: u32 = 0x00_00_00; // palette index 0, black
    let expected: Vec<u32> = (0..8u8).map(|bit| if 0xAAu8 & (0x80 >> bit) != 0 { FG } else { BG }).collect();
    assert_eq!(frame.pixels, expected);
}

#[test]
fn status_register_reflects_whether_the_pipeline_is_mid_scanout() {
    let _ = env_logger::try_init();
    let mut harness = support::Harness::new(FlatGuestMemory::new(0x1000));
    let config = CrtcConfig { io_base: IO_BASE, mda: false, vram_len: 0x4000, snow_enabled: false };
    let (ports, vram) = CrtcPorts::new(config).unwrap();
    let id = ports.install(vram, &mut harness.registry, IO_BASE, VRAM_BASE);
    harness.registry.reset_device(id);
    select(&mut harness.registry, REG_HTOTAL, 0);
    select(&mut harness.registry, REG_HDISP, 0);
    select(&mut harness.registry, REG_VTOTAL, 0);
    select(&mut harness.registry, REG_VDISP, 0);
    select(&mut harness.registry, REG_MAX_SCAN_LINE, 0);

    const RETRACE: u32 = 0x01;
    let before = harness.registry.io_read(IO_BASE + 10, AccessSize::Byte);
    assert_eq!(before & RETRACE, RETRACE, "before the first dispon, the bus sees a retrace");

    harness.registry.advance(1); // TIMER_DISPON
    let during = harness.registry.io_read(IO_BASE + 10, AccessSize::Byte);
    assert_eq!(during & RETRACE, 0, "mid-scanout, retrace is clear");
}
