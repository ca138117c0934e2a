//! Device-and-interconnect core for an IBM-PC-class system emulator.
//!
//! This crate is the coherence layer a CPU core and a front end link
//! against: a virtual time base, a deadline-ordered event scheduler, an
//! interrupt aggregator, an I/O-and-memory address-space dispatcher, an
//! 8237-style DMA controller, the `Device` trait every concrete device
//! implements, and the concrete devices themselves (CRTC/CGA video, the
//! 8250/16550 UART family, an AT-IDE/ESDI disk controller, a DP8390
//! Ethernet controller, an ISAPnP Super-I/O shell, and two DMA-driven
//! audio engines).
//!
//! The CPU, the board/chipset glue, the GUI front end, disk/floppy image
//! codecs and the audio output backend are all out of scope; they are
//! consumed or driven through the collaborator traits in [`device`] and
//! [`context`].

pub mod bus;
pub mod context;
pub mod device;
pub mod devices;
pub mod dma;
pub mod error;
pub mod irq;
pub mod registry;
pub mod scheduler;
pub mod time;

pub use context::{GuestMemory, SystemContext};
pub use device::{AccessSize, BusDevice, Device, DeviceConfig, DeviceId, PortIo};
pub use error::{CoreError, CoreResult};
pub use registry::{Collaborators, DeviceRegistry};
pub use time::VirtualTime;
