//! Per-device-type command engines (§4.4-4.6). [`Device`] is the sum type a
//! controller slot holds; [`state::DeviceCommon`] is the register/state
//! substrate both variants share.

pub mod ata;
pub mod atapi;
pub mod identify;
pub mod state;

use crate::effect::Effects;
use crate::scheduler::CallbackKind;
use ata::AtaDevice;
use atapi::AtapiDevice;
use state::DeviceState;

/// Either device type a controller slot can hold.
pub enum Device {
    Ata(AtaDevice),
    Atapi(AtapiDevice),
}

impl Device {
    pub fn state(&self) -> DeviceState {
        match self {
            Device::Ata(d) => d.common.state,
            Device::Atapi(d) => d.common.state,
        }
    }

    pub fn faked_command(&self) -> bool {
        match self {
            Device::Ata(d) => d.common.faked_command,
            Device::Atapi(d) => d.common.faked_command,
        }
    }

    pub fn set_faked_command(&mut self, v: bool) {
        match self {
            Device::Ata(d) => d.common.faked_command = v,
            Device::Atapi(d) => d.common.faked_command = v,
        }
    }

    pub fn status(&self) -> crate::taskfile::Status {
        match self {
            Device::Ata(d) => d.common.taskfile.status,
            Device::Atapi(d) => d.common.taskfile.status,
        }
    }

    pub fn allow_writing(&self) -> bool {
        match self {
            Device::Ata(d) => d.common.allow_writing,
            Device::Atapi(d) => d.common.allow_writing,
        }
    }

    pub fn taskfile(&self) -> &crate::taskfile::Taskfile {
        match self {
            Device::Ata(d) => &d.common.taskfile,
            Device::Atapi(d) => &d.common.taskfile,
        }
    }

    pub fn taskfile_mut(&mut self) -> &mut crate::taskfile::Taskfile {
        match self {
            Device::Ata(d) => &mut d.common.taskfile,
            Device::Atapi(d) => &mut d.common.taskfile,
        }
    }

    pub fn host_reset_begin(&mut self) {
        match self {
            Device::Ata(d) => d.common.host_reset_begin(),
            Device::Atapi(d) => d.common.host_reset_begin(),
        }
    }

    pub fn host_reset_complete(&mut self) {
        match self {
            Device::Ata(d) => d.common.host_reset_complete(),
            Device::Atapi(d) => d.common.host_reset_complete(),
        }
    }

    pub fn writecommand(&mut self, cmd: u8) -> Effects {
        match self {
            Device::Ata(d) => d.writecommand(cmd),
            Device::Atapi(d) => d.writecommand(cmd),
        }
    }

    pub fn data_read(&mut self, iolen: usize) -> (u16, Effects) {
        match self {
            Device::Ata(d) => d.data_read(iolen),
            Device::Atapi(d) => d.data_read(iolen),
        }
    }

    pub fn data_write(&mut self, v: u32, iolen: usize) -> Effects {
        match self {
            Device::Ata(d) => d.data_write(v, iolen),
            Device::Atapi(d) => d.data_write_command_buffer(v, iolen),
        }
    }

    /// Dispatch a matured scheduled callback to whichever completion
    /// routine it names (§4.7). The controller is the one that knows
    /// whether the device was in the ATAPI busy-wait sub-state.
    pub fn on_callback(&mut self, kind: CallbackKind) -> Effects {
        match (self, kind) {
            (Device::Ata(d), CallbackKind::DelayedCommand) => d.on_delayed_command(),
            (Device::Atapi(d), CallbackKind::DelayedCommand) => {
                if d.common.state == DeviceState::Busy {
                    d.on_delayed_command()
                } else {
                    Effects::new()
                }
            }
            (Device::Atapi(d), CallbackKind::AtapiBusyTime) => d.on_atapi_busy_time(),
            (Device::Atapi(d), CallbackKind::LoadingTransition) => d.on_loading_transition(),
            _ => Effects::new(),
        }
    }
}
