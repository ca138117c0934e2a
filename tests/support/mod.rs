//! Shared black-box test fixtures: minimal collaborator stubs wired
//! through the public `Collaborators`/`DeviceRegistry` surface, since
//! these tests only see `pc_core`'s public API, never its internals.
//!
//! Every collaborator's observable state is mirrored into an
//! `Rc<RefCell<_>>` the test keeps a handle to, since `DeviceRegistry`
//! takes ownership of the collaborators and never hands them back.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use pc_core::context::FlatGuestMemory;
use pc_core::device::{AudioSink, CpuCollaborator, DiskImageStore, DisplaySink, FontRom, NetworkSink};
use pc_core::registry::{Collaborators, DeviceRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blit {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub pixels: Vec<u32>,
}

struct RecordingDisplay(Rc<RefCell<Vec<Blit>>>);

impl DisplaySink for RecordingDisplay {
    fn blit(&mut self, x: u32, y: u32, w: u32, h: u32, pixels: &[u32]) {
        self.0.borrow_mut().push(Blit { x, y, w, h, pixels: pixels.to_vec() });
    }
}

struct RecordingNetwork(Rc<RefCell<Vec<Vec<u8>>>>);

impl NetworkSink for RecordingNetwork {
    fn transmit(&mut self, frame: &[u8]) {
        self.0.borrow_mut().push(frame.to_vec());
    }
}

struct RecordingAudio(Rc<RefCell<Vec<i16>>>);

impl AudioSink for RecordingAudio {
    fn push_samples(&mut self, samples: &[i16]) {
        self.0.borrow_mut().extend_from_slice(samples);
    }
}

/// A one-glyph-per-byte "font": `glyph(_, ch, row)` returns `ch` itself
/// for every row, so a test can pick a character and know exactly which
/// bit pattern every scan line of its glyph renders as.
pub struct FlatFont;

impl FontRom for FlatFont {
    fn glyph(&self, _charset: u8, ch: u8, _row: u8) -> u8 {
        ch
    }
}

struct NullDisk;

impl DiskImageStore for NullDisk {
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

/// Counts aggregate PIC transitions rather than recording every one, since
/// most scenarios only care "did it fire, and how many times".
struct CountingCpu {
    notifications: Rc<RefCell<Vec<bool>>>,
    cycles: u64,
}

impl CpuCollaborator for CountingCpu {
    fn cycles_consumed(&mut self) -> u64 {
        self.cycles
    }
    fn interrupt_notify(&mut self, pic_output: bool) {
        self.notifications.borrow_mut().push(pic_output);
    }
}

/// A `DeviceRegistry` plus handles onto everything its collaborator stubs
/// observed, since the registry itself never hands the collaborators back.
pub struct Harness {
    pub registry: DeviceRegistry,
    pub blits: Rc<RefCell<Vec<Blit>>>,
    pub transmitted: Rc<RefCell<Vec<Vec<u8>>>>,
    pub audio_samples: Rc<RefCell<Vec<i16>>>,
    pub irq_notifications: Rc<RefCell<Vec<bool>>>,
}

impl Harness {
    pub fn new(memory: FlatGuestMemory) -> Self {
        let blits = Rc::new(RefCell::new(Vec::new()));
        let transmitted = Rc::new(RefCell::new(Vec::new()));
        let audio_samples = Rc::new(RefCell::new(Vec::new()));
        let irq_notifications = Rc::new(RefCell::new(Vec::new()));
        let registry = DeviceRegistry::new(Collaborators {
            memory: Box::new(memory),
            network: Box::new(RecordingNetwork(transmitted.clone())),
            display: Box::new(RecordingDisplay(blits.clone())),
            audio: Box::new(RecordingAudio(audio_samples.clone())),
            font_rom: Box::new(FlatFont),
            disk_store: Box::new(NullDisk),
            cpu: Box::new(CountingCpu { notifications: irq_notifications.clone(), cycles: 0 }),
        });
        Self { registry, blits, transmitted, audio_samples, irq_notifications }
    }
}
