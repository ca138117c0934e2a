//! ISAPnP Super-I/O auto-configuration shell.
//!
//! Models a single PnP card exposing up to [`LOGICAL_DEVICE_COUNT`] logical
//! devices (conventionally: floppy controller, two UARTs, parallel port,
//! infrared UART, and the keyboard controller's main/mouse halves). Three
//! I/O ports drive the protocol: a write-only address port, a write-only
//! data port, and a relocatable read-data port. A 32-byte LFSR key stream
//! written to the address port unlocks the configuration state machine;
//! once unlocked, address-port writes select a register and data-port
//! writes/reads access it.
//!
//! Real ISA PnP cards support daisy-chained isolation among several cards
//! sharing the same three ports; this shell models exactly one card, so
//! `Wake[CSN]` only ever needs to compare against its own CSN rather than
//! run the serial-isolation contention protocol.

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::context::SystemContext;
use crate::device::{Device, DeviceConfig, DeviceId, PortIo};
use crate::error::{CoreError, CoreResult};
use crate::registry::DeviceRegistry;
use crate::scheduler::TimerTag;
use crate::time::VirtualTime;

pub const LOGICAL_DEVICE_COUNT: usize = 8;
pub const IO_RANGES_PER_LDN: usize = 2;
pub const IRQS_PER_LDN: usize = 2;
pub const DMAS_PER_LDN: usize = 2;

/// Sentinel values matching real ISA PnP convention: channel 4 is the
/// cascade line and can never be assigned to a logical device, so it
/// doubles as "no DMA assigned" the way it does on a real 8237 pair.
pub const DMA_DISABLED: u8 = 4;
pub const IO_DISABLED: u16 = 0;

const REG_CONFIG_CONTROL: u8 = 0x02;
const REG_WAKE_CSN: u8 = 0x03;
const REG_CARD_SELECT: u8 = 0x06;
const REG_LOGICAL_DEVICE: u8 = 0x07;
const REG_ACTIVATE: u8 = 0x30;
const REG_IO_BASE: u8 = 0x40; // 0x40..0x43: two (hi, lo) pairs
const REG_IRQ: u8 = 0x50; // 0x50/0x51 irq0 select/type, 0x52/0x53 irq1
const REG_DMA: u8 = 0x58; // 0x58 dma0, 0x59 dma1
const VENDOR_GLOBAL_LO: u8 = 0x20;
const VENDOR_GLOBAL_HI: u8 = 0x2f;
const VENDOR_GPIO_LO: u8 = 0x60;
const VENDOR_GPIO_HI: u8 = 0x7f;
const VENDOR_LDN_LO: u8 = 0xf0;
const VENDOR_LDN_HI: u8 = 0xff;

bitflags! {
    #[derive(Default, Clone, Copy)]
    struct ConfigControl: u8 {
        const RESET_CSN      = 0x01;
        const RESET_DEVICES  = 0x02;
        const WAIT_FOR_KEY   = 0x04;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardState {
    /// Waiting for the 32-byte initiation key; every other register is
    /// inert in this state.
    WaitForKey,
    /// Key matched. Address-port writes now select a register.
    Unlocked,
}

/// The per-logical-device resource assignment a `config_changed` callback
/// observes: I/O base(s), IRQ line(s), DMA channel(s) and the activate
/// flag, mirroring 86Box's `isapnp_device_config_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalDeviceConfig {
    pub io: [u16; IO_RANGES_PER_LDN],
    pub irq: [u8; IRQS_PER_LDN],
    pub dma: [u8; DMAS_PER_LDN],
    pub activate: bool,
}

impl Default for LogicalDeviceConfig {
    fn default() -> Self {
        Self { io: [IO_DISABLED; IO_RANGES_PER_LDN], irq: [0; IRQS_PER_LDN], dma: [DMA_DISABLED; DMAS_PER_LDN], activate: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsaPnpConfig {
    pub address_port: u16,
    pub write_data_port: u16,
    /// Relocatable read-data port; real cards are steered into
    /// `0x203..=0x3FF`, 4-byte aligned, to dodge other ISA decode.
    pub read_data_port: u16,
}

impl Default for IsaPnpConfig {
    fn default() -> Self {
        Self { address_port: 0x279, write_data_port: 0xa79, read_data_port: 0x203 }
    }
}

impl IsaPnpConfig {
    fn validate(&self) -> CoreResult<()> {
        if !(0x203..=0x3ff).contains(&self.read_data_port) || self.read_data_port % 4 != 0 {
            return Err(CoreError::config("isapnp", "read_data_port must be in 0x203..=0x3FF, 4-byte aligned"));
        }
        Ok(())
    }
}

/// The standard ISA PnP initiation key: an LFSR seeded with 0x6a. Writing
/// these 32 bytes in order to the address port (from a freshly reset or
/// freshly power-on card) takes it out of `WaitForKey`.
fn initiation_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    let mut cur: u8 = 0x6a;
    for slot in key.iter_mut() {
        *slot = cur;
        let feedback = (cur ^ (cur >> 1)) & 1;
        cur = (cur >> 1) | (feedback << 7);
    }
    key
}

struct IsaPnpState {
    config: IsaPnpConfig,
    state: CardState,
    key_pos: usize,
    csn: u8,
    selected: bool,
    current_reg: u8,
    current_ldn: usize,
    logical: [LogicalDeviceConfig; LOGICAL_DEVICE_COUNT],
    vendor_global: [u8; 16],
    vendor_gpio: [[u8; 32]; LOGICAL_DEVICE_COUNT],
    vendor_ldn: [[u8; 16]; LOGICAL_DEVICE_COUNT],
    on_config_changed: Box<dyn FnMut(u8, &LogicalDeviceConfig)>,
}

impl IsaPnpState {
    fn new(config: IsaPnpConfig, on_config_changed: Box<dyn FnMut(u8, &LogicalDeviceConfig)>) -> Self {
        Self {
            config,
            state: CardState::WaitForKey,
            key_pos: 0,
            csn: 0,
            selected: false,
            current_reg: 0,
            current_ldn: 0,
            logical: [LogicalDeviceConfig::default(); LOGICAL_DEVICE_COUNT],
            vendor_global: [0; 16],
            vendor_gpio: [[0; 32]; LOGICAL_DEVICE_COUNT],
            vendor_ldn: [[0; 16]; LOGICAL_DEVICE_COUNT],
            on_config_changed,
        }
    }

    fn reset(&mut self) {
        self.state = CardState::WaitForKey;
        self.key_pos = 0;
        self.csn = 0;
        self.selected = false;
        self.current_reg = 0;
        self.current_ldn = 0;
        self.logical = [LogicalDeviceConfig::default(); LOGICAL_DEVICE_COUNT];
    }

    fn write_address(&mut self, byte: u8) {
        let key = initiation_key();
        match self.state {
            CardState::WaitForKey => {
                if byte == key[self.key_pos] {
                    self.key_pos += 1;
                    if self.key_pos == key.len() {
                        self.state = CardState::Unlocked;
                        self.key_pos = 0;
                        log::debug!("isapnp: initiation key matched, card unlocked");
                    }
                } else {
                    self.key_pos = if byte == key[0] { 1 } else { 0 };
                }
            }
            CardState::Unlocked => {
                self.current_reg = byte;
            }
        }
    }

    fn notify(&mut self) {
        let ldn = self.current_ldn;
        (self.on_config_changed)(ldn as u8, &self.logical[ldn]);
    }

    fn write_data(&mut self, value: u8) {
        if self.state != CardState::Unlocked {
            return;
        }
        let reg = self.current_reg;
        match reg {
            REG_CONFIG_CONTROL => {
                let cc = ConfigControl::from_bits_truncate(value);
                if cc.contains(ConfigControl::RESET_CSN) {
                    self.csn = 0;
                }
                if cc.contains(ConfigControl::RESET_DEVICES) {
                    self.logical = [LogicalDeviceConfig::default(); LOGICAL_DEVICE_COUNT];
                }
                if cc.contains(ConfigControl::WAIT_FOR_KEY) {
                    self.state = CardState::WaitForKey;
                    self.key_pos = 0;
                    self.selected = false;
                }
            }
            REG_WAKE_CSN => {
                self.selected = value == self.csn;
            }
            REG_CARD_SELECT if self.selected => self.csn = value,
            REG_LOGICAL_DEVICE if self.selected => self.current_ldn = value as usize % LOGICAL_DEVICE_COUNT,
            VENDOR_GLOBAL_LO..=VENDOR_GLOBAL_HI => {
                self.vendor_global[(reg - VENDOR_GLOBAL_LO) as usize] = value;
            }
            _ if self.selected => self.write_ldn_scoped(reg, value),
            _ => {}
        }
    }

    fn write_ldn_scoped(&mut self, reg: u8, value: u8) {
        let ldn = self.current_ldn;
        match reg {
            REG_ACTIVATE => {
                self.logical[ldn].activate = value & 0x01 != 0;
                self.notify();
            }
            REG_IO_BASE..=0x43 => {
                let slot = reg - REG_IO_BASE;
                let range = (slot / 2) as usize;
                if range < IO_RANGES_PER_LDN {
                    let cur = self.logical[ldn].io[range];
                    self.logical[ldn].io[range] =
                        if slot % 2 == 0 { (cur & 0x00ff) | ((value as u16) << 8) } else { (cur & 0xff00) | value as u16 };
                    self.notify();
                }
            }
            REG_IRQ..=0x53 => {
                let slot = reg - REG_IRQ;
                let idx = (slot / 2) as usize;
                if idx < IRQS_PER_LDN && slot % 2 == 0 {
                    self.logical[ldn].irq[idx] = value;
                    self.notify();
                }
            }
            REG_DMA..=0x59 => {
                let idx = (reg - REG_DMA) as usize;
                if idx < DMAS_PER_LDN {
                    self.logical[ldn].dma[idx] = value;
                    self.notify();
                }
            }
            VENDOR_GPIO_LO..=VENDOR_GPIO_HI => {
                self.vendor_gpio[ldn][(reg - VENDOR_GPIO_LO) as usize] = value;
            }
            VENDOR_LDN_LO..=VENDOR_LDN_HI => {
                self.vendor_ldn[ldn][(reg - VENDOR_LDN_LO) as usize] = value;
            }
            other => {
                log::trace!("isapnp: write to unimplemented LDN-scoped register {other:#x}");
            }
        }
    }

    fn read_data(&self) -> u8 {
        if self.state != CardState::Unlocked {
            return 0xff;
        }
        let reg = self.current_reg;
        match reg {
            REG_CARD_SELECT => self.csn,
            REG_LOGICAL_DEVICE => self.current_ldn as u8,
            VENDOR_GLOBAL_LO..=VENDOR_GLOBAL_HI => self.vendor_global[(reg - VENDOR_GLOBAL_LO) as usize],
            _ if self.selected => self.read_ldn_scoped(reg),
            _ => 0xff,
        }
    }

    fn read_ldn_scoped(&self, reg: u8) -> u8 {
        let ldn = self.current_ldn;
        match reg {
            REG_ACTIVATE => self.logical[ldn].activate as u8,
            REG_IO_BASE..=0x43 => {
                let slot = reg - REG_IO_BASE;
                let range = (slot / 2) as usize;
                if range >= IO_RANGES_PER_LDN {
                    return 0xff;
                }
                let base = self.logical[ldn].io[range];
                if slot % 2 == 0 {
                    (base >> 8) as u8
                } else {
                    (base & 0xff) as u8
                }
            }
            REG_IRQ..=0x53 => {
                let slot = reg - REG_IRQ;
                let idx = (slot / 2) as usize;
                if idx < IRQS_PER_LDN && slot % 2 == 0 {
                    self.logical[ldn].irq[idx]
                } else {
                    0
                }
            }
            REG_DMA..=0x59 => {
                let idx = (reg - REG_DMA) as usize;
                if idx < DMAS_PER_LDN {
                    self.logical[ldn].dma[idx]
                } else {
                    DMA_DISABLED
                }
            }
            VENDOR_GPIO_LO..=VENDOR_GPIO_HI => self.vendor_gpio[ldn][(reg - VENDOR_GPIO_LO) as usize],
            VENDOR_LDN_LO..=VENDOR_LDN_HI => self.vendor_ldn[ldn][(reg - VENDOR_LDN_LO) as usize],
            _ => 0xff,
        }
    }
}

/// The read-data-port facade; also the primary handle returned by `new`
/// and the one the registry ticks/resets.
pub struct IsaPnp {
    shared: Rc<RefCell<IsaPnpState>>,
}

/// The write-only address-port facade.
pub struct IsaPnpAddress {
    shared: Rc<RefCell<IsaPnpState>>,
}

/// The write-only data-port facade.
pub struct IsaPnpWriteData {
    shared: Rc<RefCell<IsaPnpState>>,
}

impl IsaPnp {
    pub fn new(config: IsaPnpConfig, on_config_changed: Box<dyn FnMut(u8, &LogicalDeviceConfig)>) -> CoreResult<(Self, IsaPnpAddress, IsaPnpWriteData)> {
        config.validate()?;
        let shared = Rc::new(RefCell::new(IsaPnpState::new(config, on_config_changed)));
        Ok((Self { shared: shared.clone() }, IsaPnpAddress { shared: shared.clone() }, IsaPnpWriteData { shared }))
    }

    pub fn install(self, address: IsaPnpAddress, write_data: IsaPnpWriteData, registry: &mut DeviceRegistry) -> (DeviceId, DeviceId, DeviceId) {
        let cfg = self.shared.borrow().config.clone();
        let read_id = registry.register(Box::new(self));
        let addr_id = registry.register(Box::new(address));
        let write_id = registry.register(Box::new(write_data));
        registry.install_io(read_id, cfg.read_data_port, 1);
        registry.install_io(addr_id, cfg.address_port, 1);
        registry.install_io(write_id, cfg.write_data_port, 1);
        (addr_id, write_id, read_id)
    }

    pub fn logical_device(&self, ldn: usize) -> LogicalDeviceConfig {
        self.shared.borrow().logical[ldn % LOGICAL_DEVICE_COUNT]
    }
}

impl Device for IsaPnp {
    fn kind(&self) -> &'static str {
        "isapnp-read-data"
    }

    fn reset(&mut self, _ctx: &mut SystemContext) {
        self.shared.borrow_mut().reset();
    }

    fn tick(&mut self, _ctx: &mut SystemContext, _tag: TimerTag, _now: VirtualTime) {}

    fn config(&self) -> Option<DeviceConfig> {
        Some(DeviceConfig { name: "isapnp", description: "ISAPnP Super-I/O configuration shell".into() })
    }
}

impl PortIo for IsaPnp {
    fn read_byte(&mut self, _ctx: &mut SystemContext, _offset: u32) -> u8 {
        self.shared.borrow().read_data()
    }

    fn write_byte(&mut self, _ctx: &mut SystemContext, _offset: u32, _value: u8) {
        // The read-data port is read-only on real hardware.
    }
}

impl Device for IsaPnpAddress {
    fn kind(&self) -> &'static str {
        "isapnp-address"
    }
    fn reset(&mut self, _ctx: &mut SystemContext) {}
    fn tick(&mut self, _ctx: &mut SystemContext, _tag: TimerTag, _now: VirtualTime) {}
}

impl PortIo for IsaPnpAddress {
    fn read_byte(&mut self, _ctx: &mut SystemContext, _offset: u32) -> u8 {
        0xff
    }
    fn write_byte(&mut self, _ctx: &mut SystemContext, _offset: u32, value: u8) {
        self.shared.borrow_mut().write_address(value);
    }
}

impl Device for IsaPnpWriteData {
    fn kind(&self) -> &'static str {
        "isapnp-write-data"
    }
    fn reset(&mut self, _ctx: &mut SystemContext) {}
    fn tick(&mut self, _ctx: &mut SystemContext, _tag: TimerTag, _now: VirtualTime) {}
}

impl PortIo for IsaPnpWriteData {
    fn read_byte(&mut self, _ctx: &mut SystemContext, _offset: u32) -> u8 {
        0xff
    }
    fn write_byte(&mut self, _ctx: &mut SystemContext, _offset: u32, value: u8) {
        self.shared.borrow_mut().write_data(value);
    }
}
