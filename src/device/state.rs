use crate::taskfile::{Status, Taskfile};
use std::time::Duration;

/// Per-device command state (§4.3).
///
/// The original source also declares `IDE_DEV_SELECT_WAIT` and
/// `IDE_DEV_CONFUSED` enumerators; neither is ever assigned anywhere in the
/// 4000-line source, so both are omitted here rather than carried as dead
/// variants nothing can construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "snapshot-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceState {
    Ready,
    Busy,
    DataRead,
    DataWrite,
    AtapiPacketCommand,
    AtapiBusy,
}

/// Fields shared by ATA and ATAPI devices (the `IDEDevice` base class in the
/// reference source, realized here as composition rather than inheritance).
#[derive(Debug, Clone)]
pub struct DeviceCommon {
    pub taskfile: Taskfile,
    pub state: DeviceState,
    /// Taskfile latch: while `false`, writes to base +1..+5 are dropped.
    pub allow_writing: bool,
    pub motor_on: bool,
    pub asleep: bool,
    /// Set by the controller while it is replaying a BIOS-INT13 self-I/O
    /// sequence (§4.8). Collapses scheduled delays and suppresses the
    /// per-command trace log, but never changes protocol semantics.
    pub faked_command: bool,
    pub ide_select_delay: Duration,
    pub ide_spinup_delay: Duration,
    pub ide_spindown_delay: Duration,
    pub ide_identify_command_delay: Duration,
}

impl Default for DeviceCommon {
    fn default() -> Self {
        DeviceCommon {
            taskfile: Taskfile::default(),
            state: DeviceState::Ready,
            allow_writing: true,
            motor_on: false,
            asleep: false,
            faked_command: false,
            ide_select_delay: Duration::from_micros(100),
            ide_spinup_delay: Duration::from_millis(500),
            ide_spindown_delay: Duration::from_secs(10 * 60),
            ide_identify_command_delay: Duration::from_micros(10),
        }
    }
}

impl DeviceCommon {
    /// A command byte currently in progress was rewritten while another is
    /// mid-transfer. Clear state, no error bit.
    pub fn abort_silent(&mut self) {
        self.state = DeviceState::Ready;
        self.allow_writing = true;
        self.taskfile.command = 0x00;
        self.taskfile.status = Status::ready_seek_error();
    }

    pub fn abort_normal(&mut self) {
        self.state = DeviceState::Ready;
        self.allow_writing = true;
        self.taskfile.command = 0x00;
        self.taskfile.status = Status::READY_SEEK;
    }

    pub fn abort_error(&mut self) {
        self.state = DeviceState::Ready;
        self.allow_writing = true;
        self.taskfile.command = 0x00;
        self.taskfile.status = Status::ready_seek_error();
    }

    /// `host_reset_begin`/`host_reset_complete` (§4.1 alt-write SRST path).
    pub fn host_reset_begin(&mut self) {
        self.taskfile.status = Status::from_bits_truncate(0xFF);
        self.asleep = false;
        self.allow_writing = true;
        self.state = DeviceState::Busy;
    }

    pub fn host_reset_complete(&mut self) {
        self.taskfile.status = Status::empty();
        self.asleep = false;
        self.allow_writing = true;
        self.state = DeviceState::Ready;
    }

    pub fn interface_wakeup(&mut self) {
        self.asleep = false;
    }

    /// §4.3's command-interruption rule. Returns `true` if `cmd` may
    /// proceed to dispatch.
    pub fn command_interruption_ok(&mut self, cmd: u8) -> bool {
        if cmd == self.taskfile.command {
            return true;
        }
        if self.state != DeviceState::Ready && self.state != DeviceState::Busy && cmd == 0x08 {
            tracing::debug!(
                in_progress = self.taskfile.command,
                new = cmd,
                "device reset while another command in progress; aborting to begin another"
            );
            self.abort_silent();
            return true;
        }
        if self.state != DeviceState::Ready {
            tracing::warn!(
                in_progress = self.taskfile.command,
                new = cmd,
                "command written while another is in progress; aborting current command"
            );
            self.abort_error();
            return false;
        }
        true
    }
}
