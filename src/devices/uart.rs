//! The 8250/16450/16550+ UART family.
//!
//! One logical device, eight consecutive I/O ports. With DLAB set, offsets
//! 0/1 address the baud-divisor latch; otherwise offset 0 is THR on write
//! and RBR on read, offset 1 is the interrupt-enable register. FIFO mode
//! (16550+) layers a 16-byte ring on each side of the single-byte shift
//! register the 8250 exposes directly.
//!
//! Like the CRTC, the device needs to hand scheduler-event handles back
//! into its own state after the owning `DeviceId` exists, so the
//! `Rc<RefCell<UartState>>` is cloned before the outer value moves into the
//! registry's `Box<dyn BusDevice>`.

use std::cell::RefCell;
use std::collections::VecDeque;
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

const FIFO_DEPTH: usize = 16;
const TIMER_TRANSMIT: TimerTag = 0;
const TIMER_RX_TIMEOUT: TimerTag = 1;

bitflags! {
    #[derive(Default, Clone, Copy)]
    pub struct LineStatus: u8 {
        const DATA_READY        = 0x01;
        const OVERRUN           = 0x02;
        const PARITY_ERROR      = 0x04;
        const FRAMING_ERROR     = 0x08;
        const BREAK_INTERRUPT   = 0x10;
        const THR_EMPTY         = 0x20;
        const TRANSMITTER_EMPTY = 0x40;
        const FIFO_ERROR        = 0x80;
    }
}

bitflags! {
    #[derive(Default, Clone, Copy)]
    pub struct ModemControl: u8 {
        const DTR      = 0x01;
        const RTS      = 0x02;
        const OUT1     = 0x04;
        const OUT2     = 0x08;
        const LOOPBACK = 0x10;
    }
}

bitflags! {
    #[derive(Default, Clone, Copy)]
    pub struct ModemStatus: u8 {
        const DELTA_CTS = 0x01;
        const DELTA_DSR = 0x02;
        const DELTA_RI  = 0x04;
        const DELTA_DCD = 0x08;
        const CTS       = 0x10;
        const DSR       = 0x20;
        const RI        = 0x40;
        const DCD       = 0x80;
    }
}

bitflags! {
    #[derive(Default, Clone, Copy)]
    pub struct InterruptEnable: u8 {
        const RX_DATA      = 0x01;
        const THR_EMPTY    = 0x02;
        const LINE_STATUS  = 0x04;
        const MODEM_STATUS = 0x08;
        const RX_DMA_TC    = 0x10;
        const TX_DMA_TC    = 0x20;
    }
}

// IIR cause codes, in interrupt-priority order (lower value = higher
// priority once the FIFO-enabled bits are masked off).
const IIR_LINE_STATUS: u8 = 0x06;
const IIR_RX_AVAILABLE: u8 = 0x04;
const IIR_RX_TIMEOUT: u8 = 0x0c;
const IIR_THR_EMPTY: u8 = 0x02;
const IIR_MODEM_STATUS: u8 = 0x00;
const IIR_NO_PENDING: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UartVariant {
    Uart8250,
    Uart16450,
    Uart16550,
}

impl UartVariant {
    fn has_fifo(self) -> bool {
        matches!(self, UartVariant::Uart16550)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UartConfig {
    pub io_base: u16,
    pub irq_line: u8,
    pub clock_hz: u32,
    pub variant: UartVariant,
}

impl UartConfig {
    fn validate(&self) -> CoreResult<()> {
        if self.clock_hz == 0 {
            return Err(CoreError::config("uart", "clock_hz must be nonzero"));
        }
        Ok(())
    }
}

fn fifo_trigger_level(bits: u8) -> usize {
    match bits & 0x03 {
        0 => 1,
        1 => 4,
        2 => 8,
        _ => 14,
    }
}

fn bits_per_char(lcr: u8) -> u32 {
    let data_bits = (lcr & 0x03) as u32 + 5;
    let stop_bits = if lcr & 0x04 != 0 { 2 } else { 1 };
    let parity_bits = if lcr & 0x08 != 0 { 1 } else { 0 };
    1 + data_bits + parity_bits + stop_bits // start bit + data + parity + stop
}

struct UartState {
    variant: UartVariant,
    clock_hz: u32,
    irq_line: u8,

    dlab: bool,
    divisor: u16,
    ier: InterruptEnable,
    lcr: u8,
    mcr: ModemControl,
    lsr: LineStatus,
    msr: ModemStatus,
    scratch: u8,

    fifo_enabled: bool,
    fifo_trigger: usize,
    rx_fifo: VecDeque<u8>,
    tx_fifo: VecDeque<u8>,
    shift_register: Option<u8>,

    thr_empty_irq_pending: bool,
    rx_timeout_pending: bool,

    transmit_timer: Option<EventHandle>,
    rx_timeout_timer: Option<EventHandle>,

    irq_asserted: bool,
}

impl UartState {
    fn new(config: &UartConfig) -> Self {
        Self {
            variant: config.variant,
            clock_hz: config.clock_hz,
            irq_line: config.irq_line,
            dlab: false,
            divisor: 0x60, // power-on default: ~1200 baud at the common 1.8432 MHz clock.
            ier: InterruptEnable::empty(),
            lcr: 0x03,
            mcr: ModemControl::empty(),
            lsr: LineStatus::THR_EMPTY | LineStatus::TRANSMITTER_EMPTY,
            msr: ModemStatus::empty(),
            scratch: 0,
            fifo_enabled: false,
            fifo_trigger: 1,
            rx_fifo: VecDeque::with_capacity(FIFO_DEPTH),
            tx_fifo: VecDeque::with_capacity(FIFO_DEPTH),
            shift_register: None,
            thr_empty_irq_pending: false,
            rx_timeout_pending: false,
            transmit_timer: None,
            rx_timeout_timer: None,
            irq_asserted: false,
        }
    }

    /// Bit period in scheduler ticks (1 tick = 1 microsecond).
    fn bit_period_ticks(&self) -> i64 {
        let divisor = if self.divisor == 0 { 65536u32 } else { self.divisor as u32 };
        let period_us = (16.0 * divisor as f64 * 1_000_000.0) / self.clock_hz as f64;
        period_us.round().max(1.0) as i64
    }

    fn byte_period_ticks(&self) -> i64 {
        self.bit_period_ticks() * bits_per_char(self.lcr) as i64
    }

    fn loopback(&self) -> bool {
        self.mcr.contains(ModemControl::LOOPBACK)
    }

    fn recompute_msr_from_loopback(&mut self) {
        if !self.loopback() {
            return;
        }
        let mut msr = ModemStatus::empty();
        if self.mcr.contains(ModemControl::DTR) {
            msr.insert(ModemStatus::DSR);
        }
        if self.mcr.contains(ModemControl::RTS) {
            msr.insert(ModemStatus::CTS);
        }
        if self.mcr.contains(ModemControl::OUT1) {
            msr.insert(ModemStatus::RI);
        }
        if self.mcr.contains(ModemControl::OUT2) {
            msr.insert(ModemStatus::DCD);
        }
        self.msr = msr;
    }

    fn push_rx_byte(&mut self, ctx: &mut SystemContext, byte: u8) {
        if self.fifo_enabled {
            if self.rx_fifo.len() >= FIFO_DEPTH {
                self.lsr.insert(LineStatus::OVERRUN);
                self.rx_fifo.pop_front();
            }
            self.rx_fifo.push_back(byte);
        } else {
            if self.lsr.contains(LineStatus::DATA_READY) {
                self.lsr.insert(LineStatus::OVERRUN);
            }
            self.rx_fifo.clear();
            self.rx_fifo.push_back(byte);
        }
        self.lsr.insert(LineStatus::DATA_READY);
        self.rx_timeout_pending = false;
        if self.fifo_enabled && !self.rx_trigger_satisfied() {
            // Below the trigger level: no RX-available interrupt will fire
            // for this byte, so arm the character-timeout timer to cover
            // data left sitting in the FIFO.
            if let Some(h) = self.rx_timeout_timer {
                let period = 4 * self.byte_period_ticks();
                ctx.arm(h, period);
            }
        } else if let Some(h) = self.rx_timeout_timer {
            ctx.disarm(h);
        }
        self.update_interrupts(ctx);
    }

    fn rx_trigger_satisfied(&self) -> bool {
        if self.fifo_enabled {
            self.rx_fifo.len() >= self.fifo_trigger
        } else {
            !self.rx_fifo.is_empty()
        }
    }

    /// Resolve the highest-priority pending, enabled interrupt cause and
    /// raise/clear the device's single IRQ line accordingly.
    fn update_interrupts(&mut self, ctx: &mut SystemContext) {
        let line_status_pending = self.lsr.intersects(
            LineStatus::OVERRUN | LineStatus::PARITY_ERROR | LineStatus::FRAMING_ERROR | LineStatus::BREAK_INTERRUPT,
        );
        let rx_pending = self.rx_trigger_satisfied();
        let thr_pending = self.thr_empty_irq_pending && self.tx_fifo.is_empty() && self.shift_register.is_none();

        let asserted = (line_status_pending && self.ier.contains(InterruptEnable::LINE_STATUS))
            || (rx_pending && self.ier.contains(InterruptEnable::RX_DATA))
            || (self.rx_timeout_pending && self.ier.contains(InterruptEnable::RX_DATA))
            || (thr_pending && self.ier.contains(InterruptEnable::THR_EMPTY));

        if asserted != self.irq_asserted {
            self.irq_asserted = asserted;
            if asserted {
                ctx.raise_irq(self.irq_line, IrqMode::Level);
            } else {
                ctx.clear_irq(self.irq_line);
            }
        }
    }

    fn iir(&mut self) -> u8 {
        let line_status_pending = self.lsr.intersects(
            LineStatus::OVERRUN | LineStatus::PARITY_ERROR | LineStatus::FRAMING_ERROR | LineStatus::BREAK_INTERRUPT,
        );
        let fifo_bits = if self.variant.has_fifo() && self.fifo_enabled { 0xc0 } else { 0 };
        if line_status_pending && self.ier.contains(InterruptEnable::LINE_STATUS) {
            IIR_LINE_STATUS | fifo_bits
        } else if self.rx_timeout_pending && self.ier.contains(InterruptEnable::RX_DATA) {
            IIR_RX_TIMEOUT | fifo_bits
        } else if self.rx_trigger_satisfied() && self.ier.contains(InterruptEnable::RX_DATA) {
            IIR_RX_AVAILABLE | fifo_bits
        } else if self.thr_empty_irq_pending
            && self.tx_fifo.is_empty()
            && self.shift_register.is_none()
            && self.ier.contains(InterruptEnable::THR_EMPTY)
        {
            self.thr_empty_irq_pending = false; // reading IIR clears THR-empty indication only
            IIR_THR_EMPTY | fifo_bits
        } else if self.ier.contains(InterruptEnable::MODEM_STATUS) {
            IIR_MODEM_STATUS | fifo_bits
        } else {
            IIR_NO_PENDING | fifo_bits
        }
    }

    fn try_start_transmit(&mut self, ctx: &mut SystemContext) {
        let already_running = self.transmit_timer.map(|h| ctx.scheduler.is_armed(h)).unwrap_or(false);
        if self.shift_register.is_some() || already_running {
            return;
        }
        let Some(byte) = self.tx_fifo.pop_front() else { return };
        self.shift_register = Some(byte);
        self.lsr.remove(LineStatus::TRANSMITTER_EMPTY);
        if self.tx_fifo.is_empty() {
            self.lsr.insert(LineStatus::THR_EMPTY);
            self.thr_empty_irq_pending = true;
        }
        if let Some(h) = self.transmit_timer {
            let period = self.byte_period_ticks();
            ctx.arm(h, period);
        }
    }
}

pub struct Uart {
    shared: Rc<RefCell<UartState>>,
}

impl Uart {
    pub fn new(config: UartConfig) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self { shared: Rc::new(RefCell::new(UartState::new(&config))) })
    }

    /// Register the device and arm its two scheduler-owned timers.
    pub fn install(self, registry: &mut DeviceRegistry, io_base: u16) -> DeviceId {
        let shared = self.shared.clone();
        let id = registry.register(Box::new(self));
        registry.install_io(id, io_base, 8);
        let transmit = registry.alloc_event(id, TIMER_TRANSMIT);
        let rx_timeout = registry.alloc_event(id, TIMER_RX_TIMEOUT);
        let mut state = shared.borrow_mut();
        state.transmit_timer = Some(transmit);
        state.rx_timeout_timer = Some(rx_timeout);
        id
    }
}

impl Device for Uart {
    fn kind(&self) -> &'static str {
        "uart"
    }

    fn reset(&mut self, ctx: &mut SystemContext) {
        let (transmit, rx_timeout) = {
            let mut s = self.shared.borrow_mut();
            s.dlab = false;
            s.divisor = 0x60;
            s.ier = InterruptEnable::empty();
            s.lcr = 0x03;
            s.mcr = ModemControl::empty();
            s.lsr = LineStatus::THR_EMPTY | LineStatus::TRANSMITTER_EMPTY;
            s.msr = ModemStatus::empty();
            s.fifo_enabled = false;
            s.fifo_trigger = 1;
            s.rx_fifo.clear();
            s.tx_fifo.clear();
            s.shift_register = None;
            s.thr_empty_irq_pending = false;
            s.rx_timeout_pending = false;
            s.irq_asserted = false;
            (s.transmit_timer, s.rx_timeout_timer)
        };
        if let Some(h) = transmit {
            ctx.disarm(h);
        }
        if let Some(h) = rx_timeout {
            ctx.disarm(h);
        }
    }

    fn tick(&mut self, ctx: &mut SystemContext, tag: TimerTag, _now: VirtualTime) {
        let mut s = self.shared.borrow_mut();
        match tag {
            TIMER_TRANSMIT => {
                if let Some(byte) = s.shift_register.take() {
                    s.lsr.insert(LineStatus::TRANSMITTER_EMPTY);
                    if s.loopback() {
                        s.push_rx_byte(ctx, byte);
                    }
                }
                s.try_start_transmit(ctx);
                s.update_interrupts(ctx);
            }
            TIMER_RX_TIMEOUT => {
                if !s.rx_fifo.is_empty() {
                    s.rx_timeout_pending = true;
                }
                s.update_interrupts(ctx);
            }
            _ => {}
        }
    }

    fn close(&mut self, ctx: &mut SystemContext) {
        let mut s = self.shared.borrow_mut();
        if let Some(h) = s.transmit_timer.take() {
            ctx.disarm(h);
        }
        if let Some(h) = s.rx_timeout_timer.take() {
            ctx.disarm(h);
        }
    }

    fn config(&self) -> Option<DeviceConfig> {
        let s = self.shared.borrow();
        Some(DeviceConfig { name: "uart", description: format!("{:?} serial port", s.variant) })
    }
}

impl PortIo for Uart {
    fn read_byte(&mut self, ctx: &mut SystemContext, offset: u32) -> u8 {
        let mut s = self.shared.borrow_mut();
        match offset {
            0 if s.dlab => (s.divisor & 0xff) as u8,
            0 => {
                let byte = s.rx_fifo.pop_front().unwrap_or(0);
                if s.rx_fifo.is_empty() {
                    s.lsr.remove(LineStatus::DATA_READY);
                    s.rx_timeout_pending = false;
                    if let Some(h) = s.rx_timeout_timer {
                        ctx.disarm(h);
                    }
                }
                s.update_interrupts(ctx);
                byte
            }
            1 if s.dlab => (s.divisor >> 8) as u8,
            1 => s.ier.bits(),
            2 => s.iir(),
            3 => s.lcr,
            4 => s.mcr.bits(),
            5 => {
                let bits = s.lsr.bits();
                s.lsr.remove(
                    LineStatus::OVERRUN | LineStatus::PARITY_ERROR | LineStatus::FRAMING_ERROR | LineStatus::BREAK_INTERRUPT,
                );
                s.update_interrupts(ctx);
                bits
            }
            6 => {
                let bits = s.msr.bits();
                s.msr.remove(ModemStatus::DELTA_CTS | ModemStatus::DELTA_DSR | ModemStatus::DELTA_RI | ModemStatus::DELTA_DCD);
                bits
            }
            7 => s.scratch,
            _ => 0xff,
        }
    }

    fn write_byte(&mut self, ctx: &mut SystemContext, offset: u32, value: u8) {
        let mut s = self.shared.borrow_mut();
        match offset {
            0 if s.dlab => s.divisor = (s.divisor & 0xff00) | value as u16,
            0 => {
                if s.tx_fifo.len() >= FIFO_DEPTH {
                    s.lsr.insert(LineStatus::OVERRUN);
                    s.tx_fifo.pop_front();
                }
                s.tx_fifo.push_back(value);
                s.lsr.remove(LineStatus::THR_EMPTY);
                s.try_start_transmit(ctx);
                s.update_interrupts(ctx);
            }
            1 if s.dlab => s.divisor = (s.divisor & 0x00ff) | ((value as u16) << 8),
            1 => {
                s.ier = InterruptEnable::from_bits_truncate(value & 0x3f);
                s.update_interrupts(ctx);
            }
            2 => {
                let was_enabled = s.fifo_enabled;
                s.fifo_enabled = s.variant.has_fifo() && value & 0x01 != 0;
                s.fifo_trigger = fifo_trigger_level(value >> 6);
                if s.fifo_enabled && !was_enabled {
                    s.rx_fifo.clear();
                    s.tx_fifo.clear();
                }
                if value & 0x02 != 0 {
                    s.rx_fifo.clear();
                    s.lsr.remove(LineStatus::DATA_READY);
                }
                if value & 0x04 != 0 {
                    s.tx_fifo.clear();
                }
            }
            3 => {
                s.dlab = value & 0x80 != 0;
                s.lcr = value;
            }
            4 => {
                s.mcr = ModemControl::from_bits_truncate(value & 0x1f);
                s.recompute_msr_from_loopback();
            }
            7 => s.scratch = value,
            _ => {}
        }
    }
}
