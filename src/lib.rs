//! Emulated legacy ISA IDE (ATA/ATAPI) host-bus-adapter core.
//!
//! This crate models the register-level behavior of up to eight IDE
//! channels as a PC emulator would see them: two legacy base/alt I/O
//! windows per channel, PIO-only transfers, LBA28/CHS addressing, and the
//! ATA and ATAPI PACKET command sets a period-correct BIOS and OS driver
//! stack would drive. It does not emulate a CPU, a PIC, or a bus — callers
//! supply an [`irq::IrqLine`] and a [`scheduler::Scheduler`] and drive
//! [`Controller`] with port reads/writes exactly as the rest of their
//! emulator decodes them.
//!
//! Typical wiring:
//!
//! ```ignore
//! let cfg = ControllerConfig::default_for_channel(0)?; // legacy primary
//! let mut ctrl = Controller::new(cfg, irq_line, scheduler)?;
//! ctrl.attach(0, Device::Ata(ata_device))?;
//! // on guest OUT to base_io+7:
//! ctrl.write_base(7, cmd as u32, 1);
//! // when the host's timer fires a previously scheduled callback:
//! ctrl.dispatch_callback(CallbackKind::DelayedCommand);
//! ```

pub mod bios13;
pub mod config;
pub mod controller;
pub mod device;
pub mod effect;
pub mod error;
pub mod irq;
pub mod scheduler;
pub mod snapshot;
pub mod storage;
pub mod taskfile;

pub use config::ControllerConfig;
pub use controller::Controller;
pub use device::ata::AtaDevice;
pub use device::atapi::AtapiDevice;
pub use device::state::DeviceState;
pub use device::Device;
pub use effect::{Effect, Effects};
pub use error::{IdeError, Result};
pub use irq::IrqLine;
pub use scheduler::{CallbackKind, EventKey, Scheduler};
pub use snapshot::{ControllerSnapshot, IoSnapshot};
pub use storage::{AudioStatus, AudioSub, ImageDisk, IsoBackend, TrackInfo};
pub use taskfile::{DeviceControl, Status, Taskfile};
