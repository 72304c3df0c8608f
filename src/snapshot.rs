//! Save-state support (§10). A [`ControllerSnapshot`] captures everything
//! needed to resume a channel mid-command: taskfile shadow, device state,
//! and (for ATAPI) the loading-state machine and pending sense data. PIO
//! sector-buffer cursors are not snapshotted — they are transient within a
//! single in-flight DRQ transfer and the reference implementation does not
//! preserve them across a save/restore either.

use crate::device::ata::AtaDevice;
use crate::device::atapi::{AtapiDevice, LoadingMode};
use crate::device::state::DeviceState;
use crate::device::Device;
use crate::error::{IdeError, Result};
use crate::taskfile::Taskfile;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "snapshot-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceCommonSnapshot {
    pub taskfile: Taskfile,
    pub state: DeviceState,
    pub allow_writing: bool,
    pub asleep: bool,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "snapshot-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AtaSnapshot {
    pub common: DeviceCommonSnapshot,
    pub log_cylinders: u16,
    pub log_heads: u8,
    pub log_sects: u8,
    pub multiple_sector_count: u8,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "snapshot-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AtapiSnapshot {
    pub common: DeviceCommonSnapshot,
    pub loading_mode: LoadingMode,
    pub has_changed: bool,
    pub sense: [u8; 256],
    pub sense_length: usize,
    pub atapi_cmd: [u8; 12],
    pub atapi_cmd_i: usize,
    pub atapi_cmd_total: usize,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "snapshot-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceSnapshot {
    Ata(AtaSnapshot),
    Atapi(AtapiSnapshot),
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "snapshot-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ControllerSnapshot {
    pub select: usize,
    pub drivehead: u8,
    pub interrupt_enable: bool,
    pub host_reset: bool,
    pub irq_pending: bool,
    pub devices: [Option<DeviceSnapshot>; 2],
}

/// Implemented by anything that can be frozen to, and thawed from, a
/// [`ControllerSnapshot`] — the crate-local analogue of the host
/// emulator's own save-state machinery.
pub trait IoSnapshot {
    fn save_state(&self) -> ControllerSnapshot;
    fn load_state(&mut self, snap: &ControllerSnapshot) -> Result<()>;
}

pub(crate) fn snapshot_device(dev: &Device) -> DeviceSnapshot {
    match dev {
        Device::Ata(d) => DeviceSnapshot::Ata(AtaSnapshot {
            common: DeviceCommonSnapshot {
                taskfile: d.common.taskfile,
                state: d.common.state,
                allow_writing: d.common.allow_writing,
                asleep: d.common.asleep,
            },
            log_cylinders: d.log_cylinders,
            log_heads: d.log_heads,
            log_sects: d.log_sects,
            multiple_sector_count: d.multiple_sector_count,
        }),
        Device::Atapi(d) => DeviceSnapshot::Atapi(AtapiSnapshot {
            common: DeviceCommonSnapshot {
                taskfile: d.common.taskfile,
                state: d.common.state,
                allow_writing: d.common.allow_writing,
                asleep: d.common.asleep,
            },
            loading_mode: d.loading_mode,
            has_changed: d.has_changed,
            sense: d.sense,
            sense_length: d.sense_length,
            atapi_cmd: d.atapi_cmd,
            atapi_cmd_i: d.atapi_cmd_i,
            atapi_cmd_total: d.atapi_cmd_total,
        }),
    }
}

pub(crate) fn restore_device(dev: &mut Device, snap: &DeviceSnapshot) -> Result<()> {
    match (dev, snap) {
        (Device::Ata(d), DeviceSnapshot::Ata(s)) => {
            d.common.taskfile = s.common.taskfile;
            d.common.state = s.common.state;
            d.common.allow_writing = s.common.allow_writing;
            d.common.asleep = s.common.asleep;
            d.log_cylinders = s.log_cylinders;
            d.log_heads = s.log_heads;
            d.log_sects = s.log_sects;
            d.multiple_sector_count = s.multiple_sector_count;
            Ok(())
        }
        (Device::Atapi(d), DeviceSnapshot::Atapi(s)) => {
            d.common.taskfile = s.common.taskfile;
            d.common.state = s.common.state;
            d.common.allow_writing = s.common.allow_writing;
            d.common.asleep = s.common.asleep;
            d.loading_mode = s.loading_mode;
            d.has_changed = s.has_changed;
            d.sense = s.sense;
            d.sense_length = s.sense_length;
            d.atapi_cmd = s.atapi_cmd;
            d.atapi_cmd_i = s.atapi_cmd_i;
            d.atapi_cmd_total = s.atapi_cmd_total;
            Ok(())
        }
        _ => Err(IdeError::SnapshotMissingField("device type mismatch between snapshot and slot")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_common_snapshot_round_trips_taskfile() {
        let mut tf = Taskfile::default();
        tf.count = 7;
        let snap = DeviceCommonSnapshot {
            taskfile: tf,
            state: DeviceState::Ready,
            allow_writing: true,
            asleep: false,
        };
        assert_eq!(snap.taskfile.count, 7);
    }
}
