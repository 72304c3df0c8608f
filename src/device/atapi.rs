//! ATAPI CD-ROM PACKET command engine (§4.5 "ATAPI command set", §4.6
//! "loading/spin-up state machine").
//!
//! A PACKET (0xA0) command arrives as a 12-byte buffer clocked in one word
//! at a time through the data port, then dispatched by opcode once the
//! buffer is full. Completion of most opcodes goes through a virtual
//! "busy wait" (`on_atapi_busy_time`) that also gates on the disc's
//! spin-up state (`common_spinup_response`).

use crate::device::identify::IdentifyBuilder;
use crate::device::state::{DeviceCommon, DeviceState};
use crate::effect::{Effect, Effects};
use crate::scheduler::{delay, CallbackKind};
use crate::storage::{AudioStatus, IsoBackend};
use crate::taskfile::Status;

mod opcode {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const INQUIRY: u8 = 0x12;
    pub const PREVENT_ALLOW: u8 = 0x1E;
    pub const READ_CAPACITY: u8 = 0x25;
    pub const READ10: u8 = 0x28;
    pub const SEEK: u8 = 0x2B;
    pub const READ12: u8 = 0xA8;
    pub const READ_SUBCHANNEL: u8 = 0x42;
    pub const READ_TOC: u8 = 0x43;
    pub const PLAY_AUDIO10: u8 = 0x45;
    pub const PLAY_AUDIO_MSF: u8 = 0x47;
    pub const PAUSE_RESUME: u8 = 0x4B;
    pub const MODE_SELECT10: u8 = 0x55;
    pub const MODE_SENSE10: u8 = 0x5A;
}

mod ata_cmd {
    pub const DEVICE_RESET: u8 = 0x08;
    pub const READ_SECTOR: u8 = 0x20;
    pub const PACKET: u8 = 0xA0;
    pub const IDENTIFY_PACKET_DEVICE: u8 = 0xA1;
    pub const IDENTIFY_DEVICE: u8 = 0xEC;
}

/// The disc-loading state machine (§4.6). Named `LOAD_*` in the reference
/// implementation; `has_changed` tracks whether a media-change event is
/// still owed to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "snapshot-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LoadingMode {
    Idle,
    NoDisc,
    InsertCd,
    DiscLoading,
    DiscReadied,
    Ready,
}

/// A single ATAPI CD-ROM drive attached to one controller slot.
pub struct AtapiDevice {
    pub common: DeviceCommon,
    pub backend: Box<dyn IsoBackend>,

    pub id_serial: String,
    pub id_firmware_rev: String,
    pub id_model: String,
    pub id_mmc_vendor_id: String,
    pub id_mmc_product_id: String,
    pub id_mmc_product_rev: String,

    pub loading_mode: LoadingMode,
    pub has_changed: bool,
    pub spinup_time: std::time::Duration,
    pub spindown_timeout: std::time::Duration,
    /// Delay between `insert_cd()` and the loading state machine noticing
    /// the media change; normally overwritten from `ControllerConfig` at
    /// `attach()` time (§4.6).
    pub insertion_time: std::time::Duration,

    pub(crate) sense: [u8; 256],
    pub(crate) sense_length: usize,

    pub(crate) atapi_cmd: [u8; 12],
    pub(crate) atapi_cmd_i: usize,
    pub(crate) atapi_cmd_total: usize,
    /// 0 = host-to-device, 1 = device-to-host, decoded from the `feature`
    /// register bit 2 at PACKET entry.
    atapi_to_host: bool,
    host_maximum_byte_count: u32,

    lba: u32,
    transfer_length: u32,

    sector: Vec<u8>,
    sector_i: usize,
    sector_total: usize,
}

impl AtapiDevice {
    pub fn new(
        backend: Box<dyn IsoBackend>,
        id_serial: String,
        id_firmware_rev: String,
        id_model: String,
    ) -> Self {
        let mut dev = AtapiDevice {
            common: DeviceCommon::default(),
            backend,
            id_serial,
            id_firmware_rev,
            id_model,
            id_mmc_vendor_id: "DOSBOX".into(),
            id_mmc_product_id: "VIRTUAL CD-ROM".into(),
            id_mmc_product_rev: "1.0".into(),
            loading_mode: LoadingMode::Idle,
            has_changed: false,
            spinup_time: std::time::Duration::from_secs(1),
            spindown_timeout: std::time::Duration::from_secs(10),
            insertion_time: std::time::Duration::from_secs(4),
            sense: [0; 256],
            sense_length: 18,
            atapi_cmd: [0; 12],
            atapi_cmd_i: 0,
            atapi_cmd_total: 0,
            atapi_to_host: false,
            host_maximum_byte_count: 0,
            lba: 0,
            transfer_length: 0,
            sector: vec![0u8; 65536],
            sector_i: 0,
            sector_total: 0,
        };
        dev.set_sense(0, 0, 0, 18);
        dev
    }

    fn prepare_read(&mut self, offset: usize, size: usize) {
        self.sector_i = offset;
        self.sector_total = size.min(self.sector.len());
    }

    fn prepare_write(&mut self, offset: usize, size: usize) {
        self.prepare_read(offset, size);
    }

    /// `set_sense` (§4.6): fixed-format sense data, response code 0x70.
    fn set_sense(&mut self, sk: u8, asc: u8, ascq: u8, len: usize) {
        let len = len.max(18);
        for b in self.sense[..len].iter_mut() {
            *b = 0;
        }
        self.sense_length = len;
        self.sense[0] = 0x70;
        self.sense[2] = sk & 0x0F;
        self.sense[7] = (len - 18) as u8;
        self.sense[12] = asc;
        self.sense[13] = ascq;
    }

    /// Returns `true` if the command should proceed as normal, `false` if
    /// sense data was set in its place and the command must stop here
    /// (medium not present / still loading / medium changed).
    fn common_spinup_response(&mut self, trigger: bool, _wait: bool) -> (bool, Effects) {
        let mut fx = Effects::new();

        if self.loading_mode == LoadingMode::Idle {
            if trigger {
                self.loading_mode = LoadingMode::DiscLoading;
                fx.push(Effect::Cancel(CallbackKind::LoadingTransition));
                fx.push(Effect::Schedule(CallbackKind::LoadingTransition, self.spinup_time));
            }
        } else if self.loading_mode == LoadingMode::Ready && trigger {
            fx.push(Effect::Cancel(CallbackKind::LoadingTransition));
            fx.push(Effect::Schedule(CallbackKind::LoadingTransition, self.spindown_timeout));
        }

        let ok = match self.loading_mode {
            LoadingMode::NoDisc | LoadingMode::InsertCd => {
                self.set_sense(0x02, 0x3A, 0, 18); // Medium not present
                false
            }
            LoadingMode::DiscLoading => {
                if self.has_changed && !_wait {
                    self.set_sense(0x02, 0x04, 0x01, 18); // becoming available
                    false
                } else {
                    true
                }
            }
            LoadingMode::DiscReadied => {
                self.loading_mode = LoadingMode::Ready;
                if self.has_changed {
                    if trigger {
                        self.has_changed = false;
                    }
                    self.set_sense(0x02, 0x28, 0x00, 18); // medium changed
                    false
                } else {
                    true
                }
            }
            LoadingMode::Idle | LoadingMode::Ready => true,
        };

        (ok, fx)
    }

    fn generate_identify_device(&self) -> [u8; 512] {
        let mut b = IdentifyBuilder::new();
        b.write_word(0, 0x85C0);
        b.write_swapped_ascii(20, 20, &self.id_serial);
        b.write_swapped_ascii(46, 8, &self.id_firmware_rev);
        b.write_swapped_ascii(54, 40, &self.id_model);
        b.write_word(49, 0x0A00);
        b.write_word(50, 0x4000);
        b.write_word(51, 0x00F0);
        b.write_word(52, 0x00F0);
        b.write_word(53, 0x0006);
        b.write_word(64, 0x0003);
        b.write_word(67, 0x0078);
        b.write_word(68, 0x0078);
        b.write_word(80, 0x007E);
        b.write_word(81, 0x0022);
        b.write_word(82, 0x4008);
        b.write_word(83, 0x0000);
        b.write_word(85, 0x4208);
        b.write_word(86, 0x0000);
        b.finish()
    }

    fn generate_mmc_inquiry(&mut self) {
        for b in self.sector[..36].iter_mut() {
            *b = 0;
        }
        self.sector[0] = 5; // peripheral device type: CD-ROM
        self.sector[1] = 0x80; // RMB=1 removable
        self.sector[3] = 0x21;
        self.sector[4] = 36 - 5;
        write_padded(&mut self.sector[8..16], self.id_mmc_vendor_id.as_bytes());
        write_padded(&mut self.sector[16..32], self.id_mmc_product_id.as_bytes());
        write_padded(&mut self.sector[32..36], self.id_mmc_product_rev.as_bytes());
    }

    /// MODE SENSE(10) (§4.5): only pages 0x01, 0x0E, 0x2A are populated;
    /// anything else gets a 6-byte zeroed page body (matching the
    /// reference implementation's fallback for unsupported pages).
    fn mode_sense(&mut self) {
        let page = self.atapi_cmd[2] & 0x3F;
        let mut w = 8usize; // mode parameter header
        self.sector[0..8].iter_mut().for_each(|b| *b = 0);
        self.sector[w] = page;
        w += 1;
        let page_len_pos = w;
        w += 1;
        match page {
            0x01 => {
                let body = [0x00u8, 3, 0, 0, 0, 0, 0, 0, 0, 0];
                self.sector[w..w + body.len()].copy_from_slice(&body);
                w += body.len();
            }
            0x0E => {
                let body = [0x04u8, 0, 0, 0, 0, 75, 0x01, 0xFF, 0x02, 0xFF, 0, 0, 0, 0];
                self.sector[w..w + body.len()].copy_from_slice(&body);
                w += body.len();
            }
            0x2A => {
                let speed = (176u16 * 8).to_be_bytes();
                let vol = (256u16).to_be_bytes();
                let buf = (6u16 * 256).to_be_bytes();
                let body: [u8; 18] = [
                    0x07, 0x00, 0x71, 0xFF, 0x2F, 0x03,
                    speed[0], speed[1], vol[0], vol[1], buf[0], buf[1],
                    speed[0], speed[1], 0, 0, 0, 0,
                ];
                self.sector[w..w + body.len()].copy_from_slice(&body);
                w += body.len();
            }
            _ => {
                self.sector[w..w + 6].iter_mut().for_each(|b| *b = 0);
                w += 6;
                tracing::warn!(page, "MODE SENSE on unsupported page");
            }
        }
        let data_len = (w - 2) as u16;
        self.sector[0..2].copy_from_slice(&data_len.to_be_bytes());
        self.sector[page_len_pos] = (w - page_len_pos - 1) as u8;
        self.prepare_read(0, w.min(self.host_maximum_byte_count as usize).max(1));
    }

    fn read_subchannel(&mut self) {
        let param_list = self.atapi_cmd[3];
        let subq = self.atapi_cmd[2] & 0x40 != 0;
        if param_list == 0 || param_list > 3 {
            self.prepare_read(0, 8);
            return;
        }
        let sub = self.backend.audio_sub();
        let status = self.backend.audio_status();
        let astat = match status {
            AudioStatus::Playing => 0x11,
            AudioStatus::Paused => 0x12,
            _ => 0x13,
        };

        self.sector[0..8].iter_mut().for_each(|b| *b = 0);
        self.sector[1] = astat;
        let mut w = 4usize;
        if subq {
            self.sector[w] = 0x01;
            self.sector[w + 1] = 0x10;
            self.sector[w + 2] = sub.track;
            self.sector[w + 3] = sub.index;
            w += 4;
            self.sector[w..w + 4].copy_from_slice(&sub.absolute_lba.to_be_bytes());
            w += 4;
            self.sector[w..w + 4].copy_from_slice(&sub.relative_lba.to_be_bytes());
            w += 4;
        }
        let len = (w - 4) as u16;
        self.sector[2..4].copy_from_slice(&len.to_be_bytes());
        self.prepare_read(0, w.min(self.host_maximum_byte_count as usize).max(1));
    }

    fn read_toc(&mut self) {
        let allocation_length =
            ((self.atapi_cmd[7] as usize) << 8) + self.atapi_cmd[8] as usize;
        let format = self.atapi_cmd[2] & 0x0F;
        let (first, last) = self.backend.audio_tracks();

        self.sector[0..8].iter_mut().for_each(|b| *b = 0);
        let mut w = 2usize;

        match format {
            0 => {
                self.sector[w] = first;
                self.sector[w + 1] = last;
                w += 2;
                for track in first..=last {
                    if w + 8 > allocation_length.min(self.sector.len()) {
                        break;
                    }
                    let info = self.backend.audio_track_info(track);
                    let (attr, start_lba) = match info {
                        Some(t) => (t.attr, t.start_lba),
                        None => (0x41, 0),
                    };
                    self.sector[w] = 0;
                    self.sector[w + 1] = (attr >> 4) | 0x10;
                    self.sector[w + 2] = track;
                    self.sector[w + 3] = 0;
                    self.sector[w + 4..w + 8].copy_from_slice(&start_lba.to_be_bytes());
                    w += 8;
                }
                if w + 8 <= allocation_length.min(self.sector.len()) {
                    self.sector[w] = 0;
                    self.sector[w + 1] = 0x14;
                    self.sector[w + 2] = 0xAA;
                    self.sector[w + 3] = 0;
                    w += 8;
                }
            }
            1 => {
                self.sector[w] = 1;
                self.sector[w + 1] = 1;
                w += 2;
                let info = self.backend.audio_track_info(first);
                let (attr, start_lba) = match info {
                    Some(t) => (t.attr, t.start_lba),
                    None => (0x41, 0),
                };
                self.sector[w] = 0;
                self.sector[w + 1] = (attr >> 4) | 0x10;
                self.sector[w + 2] = first;
                self.sector[w + 3] = 0;
                self.sector[w + 4..w + 8].copy_from_slice(&start_lba.to_be_bytes());
                w += 8;
            }
            _ => {
                tracing::warn!(format, "READ TOC unsupported format");
                self.prepare_read(0, 8);
                return;
            }
        }

        let data_len = (w - 2) as u16;
        self.sector[0..2].copy_from_slice(&data_len.to_be_bytes());
        self.prepare_read(0, w.min(self.sector.len()).min(allocation_length.max(8)));
    }

    fn play_audio10(&mut self) {
        let start_lba = u32::from_be_bytes([
            self.atapi_cmd[2], self.atapi_cmd[3], self.atapi_cmd[4], self.atapi_cmd[5],
        ]);
        let play_length = u16::from_be_bytes([self.atapi_cmd[7], self.atapi_cmd[8]]);
        if play_length == 0 {
            self.sector_total = 0;
            return;
        }
        if start_lba != 0xFFFFFFFF {
            self.backend.play_audio_sector(start_lba, start_lba + play_length as u32);
        } else {
            self.backend.pause_audio(true);
        }
        self.sector_total = 0;
    }

    fn play_audio_msf(&mut self) {
        let to_lba = |m: u8, s: u8, f: u8| -> u32 {
            let sec = (m as u32) * 60 * 75 + (s as u32) * 75 + f as u32;
            sec.saturating_sub(150)
        };
        let start_lba = if self.atapi_cmd[3] == 0xFF && self.atapi_cmd[4] == 0xFF && self.atapi_cmd[5] == 0xFF {
            0xFFFFFFFFu32
        } else {
            to_lba(self.atapi_cmd[3], self.atapi_cmd[4], self.atapi_cmd[5])
        };
        let end_lba = if self.atapi_cmd[6] == 0xFF && self.atapi_cmd[7] == 0xFF && self.atapi_cmd[8] == 0xFF {
            0xFFFFFFFFu32
        } else {
            to_lba(self.atapi_cmd[6], self.atapi_cmd[7], self.atapi_cmd[8])
        };
        if start_lba == end_lba {
            self.sector_total = 0;
            return;
        }
        if start_lba != 0xFFFFFFFF {
            self.backend.play_audio_sector(start_lba, end_lba);
        } else {
            self.backend.pause_audio(true);
        }
        self.sector_total = 0;
    }

    fn pause_resume(&mut self) {
        let resume = self.atapi_cmd[8] & 1 != 0;
        self.backend.pause_audio(resume);
    }

    /// ATA-level command dispatch (§4.5). Most bytes are handled the same
    /// way the base ATA device would abort them; `0xA0` is the PACKET entry
    /// point and `0xA1` is IDENTIFY PACKET DEVICE.
    pub fn writecommand(&mut self, cmd: u8) -> Effects {
        let mut fx = Effects::new();

        if !self.common.command_interruption_ok(cmd) {
            return fx;
        }
        self.common.interface_wakeup();
        self.common.allow_writing = false;
        self.common.taskfile.command = cmd;

        match cmd {
            ata_cmd::DEVICE_RESET => {
                self.common.taskfile.status = Status::empty();
                self.common.taskfile.drivehead &= 0x10;
                self.common.taskfile.count = 0x01;
                self.common.taskfile.lba = [0x01, 0x14, 0xEB];
                self.common.taskfile.feature = 0x01;
                self.common.allow_writing = true;
            }
            ata_cmd::READ_SECTOR | 0xEC => {
                self.common.abort_normal();
                self.common.taskfile.status = Status::ERROR | Status::DRIVE_READY;
                self.common.taskfile.drivehead &= 0x30;
                self.common.taskfile.count = 0x01;
                self.common.taskfile.lba = [0x01, 0x14, 0xEB];
                self.common.taskfile.feature = 0x04;
                self.common.allow_writing = true;
                fx.push(Effect::RaiseIrq);
            }
            ata_cmd::PACKET => {
                if self.common.taskfile.feature & 1 != 0 {
                    tracing::warn!("attempted DMA PACKET transfer, unsupported");
                    self.common.abort_error();
                    self.common.taskfile.count = 0x03;
                    self.common.taskfile.feature = 0xF4;
                    fx.push(Effect::RaiseIrq);
                } else {
                    self.common.state = DeviceState::Busy;
                    self.common.taskfile.status = Status::BUSY;
                    self.atapi_to_host = (self.common.taskfile.feature >> 2) & 1 != 0;
                    let mut hmbc = ((self.common.taskfile.lba[2] as u32) << 8)
                        | self.common.taskfile.lba[1] as u32;
                    if hmbc == 0 {
                        hmbc = 0x10000;
                    }
                    self.host_maximum_byte_count = hmbc;
                    fx.push(Effect::Schedule(
                        CallbackKind::DelayedCommand,
                        if self.common.faked_command {
                            std::time::Duration::from_nanos(1_000)
                        } else {
                            std::time::Duration::from_micros(250)
                        },
                    ));
                }
            }
            ata_cmd::IDENTIFY_PACKET_DEVICE => {
                self.common.state = DeviceState::Busy;
                self.common.taskfile.status = Status::BUSY;
                fx.push(Effect::Schedule(
                    CallbackKind::DelayedCommand,
                    delay::reentry(self.common.faked_command),
                ));
            }
            _ => {
                tracing::warn!(cmd, "unknown IDE/ATAPI command");
                self.common.abort_error();
                self.common.allow_writing = true;
                self.common.taskfile.count = 0x03;
                self.common.taskfile.feature = 0xF4;
                fx.push(Effect::RaiseIrq);
            }
        }

        fx
    }

    /// `IDE_DelayedCommand`'s CDROM, non-busy branch: matures the PACKET
    /// entry into the 12-byte command-buffer state, or finishes IDENTIFY
    /// PACKET DEVICE.
    pub fn on_delayed_command(&mut self) -> Effects {
        let mut fx = Effects::new();
        match self.common.taskfile.command {
            ata_cmd::PACKET => {
                self.common.state = DeviceState::AtapiPacketCommand;
                self.common.taskfile.status = Status::DRIVE_READY | Status::SEEK_COMPLETE | Status::DRQ;
                self.common.taskfile.count = 0x01;
                self.atapi_cmd_total = 12;
                self.atapi_cmd_i = 0;
            }
            ata_cmd::IDENTIFY_PACKET_DEVICE => {
                self.common.state = DeviceState::DataRead;
                self.common.taskfile.status = Status::DRQ | Status::DRIVE_READY | Status::SEEK_COMPLETE;
                let buf = self.generate_identify_device();
                self.sector[0..512].copy_from_slice(&buf);
                self.prepare_read(0, 512);
                fx.push(Effect::RaiseIrq);
            }
            _ => {
                tracing::warn!("unknown delayed IDE/ATAPI command");
                self.common.abort_error();
                fx.push(Effect::RaiseIrq);
            }
        }
        fx
    }

    pub fn data_write_command_buffer(&mut self, v: u32, iolen: usize) -> Effects {
        if self.common.state != DeviceState::AtapiPacketCommand {
            return self.data_write(v, iolen);
        }
        if self.atapi_cmd_i < self.atapi_cmd_total {
            self.atapi_cmd[self.atapi_cmd_i] = v as u8;
            self.atapi_cmd_i += 1;
        }
        if iolen >= 2 && self.atapi_cmd_i < self.atapi_cmd_total {
            self.atapi_cmd[self.atapi_cmd_i] = (v >> 8) as u8;
            self.atapi_cmd_i += 1;
        }
        if iolen >= 4 && self.atapi_cmd_i < self.atapi_cmd_total {
            self.atapi_cmd[self.atapi_cmd_i] = (v >> 16) as u8;
            self.atapi_cmd_i += 1;
            self.atapi_cmd[self.atapi_cmd_i] = (v >> 24) as u8;
            self.atapi_cmd_i += 1;
        }
        if self.atapi_cmd_i >= self.atapi_cmd_total {
            self.atapi_cmd_completion()
        } else {
            Effects::new()
        }
    }

    /// Opcode dispatch once the 12-byte PACKET command buffer is full
    /// (§4.5's ATAPI command table).
    fn atapi_cmd_completion(&mut self) -> Effects {
        let mut fx = Effects::new();
        let op = self.atapi_cmd[0];

        let abort_with_sense = |dev: &mut Self, fx: &mut Effects| {
            let sk = dev.sense[2] & 0x0F;
            dev.common.taskfile.count = 0x03;
            dev.common.state = DeviceState::Ready;
            dev.common.taskfile.feature = (sk << 4) | if sk != 0 { 0x04 } else { 0x00 };
            dev.common.taskfile.status =
                Status::DRIVE_READY | if sk != 0 { Status::ERROR } else { Status::SEEK_COMPLETE };
            fx.push(Effect::RaiseIrq);
            dev.common.allow_writing = true;
        };

        let quick = |dev: &Self| {
            if dev.common.faked_command {
                std::time::Duration::from_nanos(1_000)
            } else {
                delay::atapi_quick(false)
            }
        };

        match op {
            opcode::TEST_UNIT_READY => {
                let (ok, spin_fx) = self.common_spinup_response(false, false);
                fx.extend(spin_fx);
                if ok {
                    self.set_sense(0, 0, 0, 18);
                }
                self.common.taskfile.count = 0x03;
                self.common.state = DeviceState::Ready;
                let sk = self.sense[2] & 0x0F;
                self.common.taskfile.feature = (sk << 4) | if sk != 0 { 0x04 } else { 0x00 };
                self.common.taskfile.status =
                    Status::DRIVE_READY | if sk != 0 { Status::ERROR } else { Status::SEEK_COMPLETE };
                fx.push(Effect::RaiseIrq);
                self.common.allow_writing = true;
            }
            opcode::REQUEST_SENSE | opcode::PREVENT_ALLOW | opcode::READ_CAPACITY => {
                self.common.taskfile.count = 0x02;
                self.common.state = DeviceState::AtapiBusy;
                self.common.taskfile.status = Status::BUSY;
                fx.push(Effect::Schedule(CallbackKind::AtapiBusyTime, quick(self)));
            }
            opcode::SEEK => {
                let (ok, spin_fx) = self.common_spinup_response(true, true);
                fx.extend(spin_fx);
                if ok {
                    self.set_sense(0, 0, 0, 18);
                    self.common.taskfile.count = 0x02;
                    self.common.state = DeviceState::AtapiBusy;
                    self.common.taskfile.status = Status::BUSY;
                    fx.push(Effect::Schedule(CallbackKind::AtapiBusyTime, quick(self)));
                } else {
                    abort_with_sense(self, &mut fx);
                }
            }
            opcode::INQUIRY => {
                self.common.taskfile.count = 0x02;
                self.common.state = DeviceState::AtapiBusy;
                self.common.taskfile.status = Status::BUSY;
                fx.push(Effect::Schedule(CallbackKind::AtapiBusyTime, quick(self)));
            }
            opcode::READ10 | opcode::READ12 => {
                let (ok, spin_fx) = self.common_spinup_response(true, true);
                fx.extend(spin_fx);
                if ok {
                    self.set_sense(0, 0, 0, 18);
                    if op == opcode::READ10 {
                        self.lba = u32::from_be_bytes([
                            self.atapi_cmd[2], self.atapi_cmd[3], self.atapi_cmd[4], self.atapi_cmd[5],
                        ]);
                        self.transfer_length =
                            u16::from_be_bytes([self.atapi_cmd[7], self.atapi_cmd[8]]) as u32;
                    } else {
                        self.lba = u32::from_be_bytes([
                            self.atapi_cmd[2], self.atapi_cmd[3], self.atapi_cmd[4], self.atapi_cmd[5],
                        ]);
                        self.transfer_length = u32::from_be_bytes([
                            self.atapi_cmd[6], self.atapi_cmd[7], self.atapi_cmd[8], self.atapi_cmd[9],
                        ]);
                    }
                    if self.transfer_length * 2048 > self.sector.len() as u32 {
                        self.transfer_length = (self.sector.len() / 2048) as u32;
                    }
                    self.common.taskfile.count = 0x02;
                    self.common.state = DeviceState::AtapiBusy;
                    self.common.taskfile.status = Status::BUSY;
                    let d = if self.common.faked_command {
                        std::time::Duration::from_nanos(1_000)
                    } else {
                        delay::ata_read(false)
                    };
                    fx.push(Effect::Schedule(CallbackKind::AtapiBusyTime, d));
                } else {
                    abort_with_sense(self, &mut fx);
                }
            }
            opcode::READ_SUBCHANNEL | opcode::READ_TOC => {
                let (ok, spin_fx) = self.common_spinup_response(true, true);
                fx.extend(spin_fx);
                if ok {
                    self.set_sense(0, 0, 0, 18);
                    self.common.taskfile.count = 0x02;
                    self.common.state = DeviceState::AtapiBusy;
                    self.common.taskfile.status = Status::BUSY;
                    fx.push(Effect::Schedule(CallbackKind::AtapiBusyTime, quick(self)));
                } else {
                    abort_with_sense(self, &mut fx);
                }
            }
            opcode::PLAY_AUDIO10 | opcode::PLAY_AUDIO_MSF | opcode::PAUSE_RESUME => {
                let (ok, spin_fx) = self.common_spinup_response(true, true);
                fx.extend(spin_fx);
                if ok {
                    self.set_sense(0, 0, 0, 18);
                    self.common.taskfile.count = 0x02;
                    self.common.state = DeviceState::AtapiBusy;
                    self.common.taskfile.status = Status::BUSY;
                    fx.push(Effect::Schedule(CallbackKind::AtapiBusyTime, quick(self)));
                } else {
                    abort_with_sense(self, &mut fx);
                }
            }
            opcode::MODE_SELECT10 => {
                self.common.taskfile.count = 0x00;
                self.common.state = DeviceState::AtapiBusy;
                self.common.taskfile.status = Status::BUSY;
                fx.push(Effect::Schedule(CallbackKind::AtapiBusyTime, quick(self)));
            }
            opcode::MODE_SENSE10 => {
                self.common.taskfile.count = 0x02;
                self.common.state = DeviceState::AtapiBusy;
                self.common.taskfile.status = Status::BUSY;
                fx.push(Effect::Schedule(CallbackKind::AtapiBusyTime, quick(self)));
            }
            _ => {
                tracing::warn!(op, "unknown ATAPI command");
                self.common.abort_error();
                self.common.taskfile.count = 0x03;
                self.common.taskfile.feature = 0xF4;
                fx.push(Effect::RaiseIrq);
                self.common.allow_writing = true;
            }
        }

        fx
    }

    /// `on_atapi_busy_time` (§4.6): the virtual-spin-time completion that
    /// actually performs the command's data-producing side once its busy
    /// wait matures, honoring the loading state machine's own delays for
    /// commands other than TEST UNIT READY / REQUEST SENSE.
    pub fn on_atapi_busy_time(&mut self) -> Effects {
        let mut fx = Effects::new();
        let op = self.atapi_cmd[0];

        match self.loading_mode {
            LoadingMode::DiscLoading => {
                if !matches!(op, opcode::TEST_UNIT_READY | opcode::REQUEST_SENSE) {
                    fx.push(Effect::Schedule(
                        CallbackKind::AtapiBusyTime,
                        delay::still_loading_retry(),
                    ));
                    return fx;
                }
            }
            LoadingMode::DiscReadied => {
                if !matches!(op, opcode::TEST_UNIT_READY | opcode::REQUEST_SENSE) {
                    let (ok, spin_fx) = self.common_spinup_response(true, false);
                    fx.extend(spin_fx);
                    if !ok {
                        let sk = self.sense[2] & 0x0F;
                        self.common.taskfile.count = 0x03;
                        self.common.state = DeviceState::Ready;
                        self.common.taskfile.feature = (sk << 4) | if sk != 0 { 0x04 } else { 0x00 };
                        self.common.taskfile.status = Status::DRIVE_READY
                            | if sk != 0 { Status::ERROR } else { Status::SEEK_COMPLETE };
                        fx.push(Effect::RaiseIrq);
                        self.common.allow_writing = true;
                        return fx;
                    }
                }
            }
            _ => {}
        }

        match op {
            opcode::REQUEST_SENSE => {
                self.prepare_read(0, self.sense_length.min(self.host_maximum_byte_count as usize));
                let len = self.sense_length;
                self.sector[..len].copy_from_slice(&self.sense[..len]);
                self.common.taskfile.feature = 0x00;
                self.common.state = DeviceState::DataRead;
                self.common.taskfile.status = Status::DRIVE_READY | Status::DRQ | Status::SEEK_COMPLETE;
                self.common.taskfile.lba[2] = (self.sector_total >> 8) as u8;
                self.common.taskfile.lba[1] = self.sector_total as u8;
                fx.push(Effect::RaiseIrq);
                self.common.allow_writing = true;
            }
            opcode::PREVENT_ALLOW => {
                self.common.taskfile.count = 0x03;
                self.common.taskfile.feature = 0x00;
                self.sector_total = 0;
                self.common.state = DeviceState::DataRead;
                self.common.taskfile.status = Status::DRIVE_READY | Status::SEEK_COMPLETE;
                fx.push(Effect::RaiseIrq);
                self.common.allow_writing = true;
            }
            opcode::READ_CAPACITY => {
                let secsize = 2048u32;
                let total = self.backend.sector_count();
                let lead_out = total.saturating_sub(1);
                self.prepare_read(0, 8.min(self.host_maximum_byte_count as usize).max(1));
                self.sector[0..4].copy_from_slice(&lead_out.to_be_bytes());
                self.sector[4..8].copy_from_slice(&secsize.to_be_bytes());
                self.common.taskfile.feature = 0x00;
                self.common.state = DeviceState::DataRead;
                self.common.taskfile.status = Status::DRIVE_READY | Status::DRQ | Status::SEEK_COMPLETE;
                self.common.taskfile.lba[2] = (self.sector_total >> 8) as u8;
                self.common.taskfile.lba[1] = self.sector_total as u8;
                fx.push(Effect::RaiseIrq);
                self.common.allow_writing = true;
            }
            opcode::SEEK => {
                self.common.taskfile.count = 0x03;
                self.common.taskfile.feature = 0x00;
                self.sector_total = 0;
                self.common.state = DeviceState::DataRead;
                self.common.taskfile.status = Status::DRIVE_READY | Status::SEEK_COMPLETE;
                if matches!(self.backend.audio_status(), AudioStatus::Playing) {
                    self.backend.stop_audio();
                }
                fx.push(Effect::RaiseIrq);
                self.common.allow_writing = true;
            }
            opcode::INQUIRY => {
                self.generate_mmc_inquiry();
                self.prepare_read(0, 36.min(self.host_maximum_byte_count as usize).max(1));
                self.common.taskfile.feature = 0x00;
                self.common.state = DeviceState::DataRead;
                self.common.taskfile.status = Status::DRIVE_READY | Status::DRQ | Status::SEEK_COMPLETE;
                self.common.taskfile.lba[2] = (self.sector_total >> 8) as u8;
                self.common.taskfile.lba[1] = self.sector_total as u8;
                fx.push(Effect::RaiseIrq);
                self.common.allow_writing = true;
            }
            opcode::READ10 | opcode::READ12 => {
                if self.transfer_length == 0 {
                    self.common.taskfile.feature = 0x00;
                    self.common.taskfile.count = 0x03;
                    self.sector_total = 0;
                    self.common.state = DeviceState::Ready;
                    self.common.taskfile.status = Status::DRIVE_READY;
                } else {
                    let want = (self.transfer_length as usize * 2048).min(self.sector.len());
                    let res = self.backend.read_sectors_host(self.lba, &mut self.sector[..want]);
                    if res.is_ok() {
                        self.prepare_read(0, want.min(self.host_maximum_byte_count as usize).max(1));
                        self.common.taskfile.feature = 0x00;
                        self.common.state = DeviceState::DataRead;
                        self.common.taskfile.status = Status::DRIVE_READY | Status::DRQ | Status::SEEK_COMPLETE;
                    } else {
                        self.common.taskfile.feature = 0xF4;
                        self.common.taskfile.count = 0x03;
                        self.sector_total = 0;
                        self.common.state = DeviceState::Ready;
                        self.common.taskfile.status = Status::DRIVE_READY | Status::ERROR;
                        tracing::warn!(lba = self.lba, len = self.transfer_length, "ATAPI read failed");
                    }
                }
                self.common.taskfile.lba[2] = (self.sector_total >> 8) as u8;
                self.common.taskfile.lba[1] = self.sector_total as u8;
                fx.push(Effect::RaiseIrq);
                self.common.allow_writing = true;
            }
            opcode::READ_SUBCHANNEL => {
                self.read_subchannel();
                self.common.taskfile.feature = 0x00;
                self.common.state = DeviceState::DataRead;
                self.common.taskfile.status = Status::DRIVE_READY | Status::DRQ | Status::SEEK_COMPLETE;
                self.common.taskfile.lba[2] = (self.sector_total >> 8) as u8;
                self.common.taskfile.lba[1] = self.sector_total as u8;
                fx.push(Effect::RaiseIrq);
                self.common.allow_writing = true;
            }
            opcode::READ_TOC => {
                self.read_toc();
                self.common.taskfile.feature = 0x00;
                self.common.state = DeviceState::DataRead;
                self.common.taskfile.status = Status::DRIVE_READY | Status::DRQ | Status::SEEK_COMPLETE;
                self.common.taskfile.lba[2] = (self.sector_total >> 8) as u8;
                self.common.taskfile.lba[1] = self.sector_total as u8;
                fx.push(Effect::RaiseIrq);
                self.common.allow_writing = true;
            }
            opcode::PLAY_AUDIO10 => {
                self.play_audio10();
                self.common.taskfile.count = 0x03;
                self.common.taskfile.feature = 0x00;
                self.sector_total = 0;
                self.common.state = DeviceState::DataRead;
                self.common.taskfile.status = Status::DRIVE_READY | Status::SEEK_COMPLETE;
                fx.push(Effect::RaiseIrq);
                self.common.allow_writing = true;
            }
            opcode::PLAY_AUDIO_MSF => {
                self.play_audio_msf();
                self.common.taskfile.count = 0x03;
                self.common.taskfile.feature = 0x00;
                self.sector_total = 0;
                self.common.state = DeviceState::DataRead;
                self.common.taskfile.status = Status::DRIVE_READY | Status::SEEK_COMPLETE;
                fx.push(Effect::RaiseIrq);
                self.common.allow_writing = true;
            }
            opcode::PAUSE_RESUME => {
                self.pause_resume();
                self.common.taskfile.count = 0x03;
                self.common.taskfile.feature = 0x00;
                self.sector_total = 0;
                self.common.state = DeviceState::DataRead;
                self.common.taskfile.status = Status::DRIVE_READY | Status::SEEK_COMPLETE;
                fx.push(Effect::RaiseIrq);
                self.common.allow_writing = true;
            }
            opcode::MODE_SELECT10 => {
                let x = ((self.common.taskfile.lba[1] as u32)
                    + ((self.common.taskfile.lba[2] as u32) << 8))
                    .min(512);
                self.common.taskfile.lba[2] = (x >> 8) as u8;
                self.common.taskfile.lba[1] = x as u8;
                self.prepare_write(0, ((x + 1) & !1) as usize);
                self.common.taskfile.feature = 0x00;
                self.common.state = DeviceState::DataWrite;
                self.common.taskfile.status = Status::DRIVE_READY | Status::DRQ | Status::SEEK_COMPLETE;
                fx.push(Effect::RaiseIrq);
                self.common.allow_writing = true;
            }
            opcode::MODE_SENSE10 => {
                self.mode_sense();
                self.common.taskfile.feature = 0x00;
                self.common.state = DeviceState::DataRead;
                self.common.taskfile.status = Status::DRIVE_READY | Status::DRQ | Status::SEEK_COMPLETE;
                self.common.taskfile.lba[2] = (self.sector_total >> 8) as u8;
                self.common.taskfile.lba[1] = self.sector_total as u8;
                fx.push(Effect::RaiseIrq);
                self.common.allow_writing = true;
            }
            _ => {
                tracing::warn!(op, "unknown ATAPI command after busy wait");
                self.common.abort_error();
                fx.push(Effect::RaiseIrq);
                self.common.allow_writing = true;
            }
        }

        fx
    }

    pub fn data_read(&mut self, iolen: usize) -> (u16, Effects) {
        if self.common.state != DeviceState::DataRead {
            return (0xFFFF, Effects::new());
        }
        if !self.common.taskfile.status.contains(Status::DRQ) {
            tracing::warn!("ATAPI data read when DRQ=0");
            return (0xFFFF, Effects::new());
        }
        if self.sector_i >= self.sector_total {
            return (0xFFFF, Effects::new());
        }

        let w = if iolen >= 4 {
            let v = u32::from_le_bytes(self.sector[self.sector_i..self.sector_i + 4].try_into().unwrap());
            self.sector_i += 4;
            v as u16
        } else if iolen >= 2 {
            let v = u16::from_le_bytes(self.sector[self.sector_i..self.sector_i + 2].try_into().unwrap());
            self.sector_i += 2;
            v
        } else {
            let v = self.sector[self.sector_i] as u16;
            self.sector_i += 1;
            v
        };

        let fx = if self.sector_i >= self.sector_total {
            self.io_completion()
        } else {
            Effects::new()
        };
        (w, fx)
    }

    pub fn data_write(&mut self, v: u32, iolen: usize) -> Effects {
        if self.common.state != DeviceState::DataWrite {
            tracing::warn!("ATAPI data write when device not in data_write state");
            return Effects::new();
        }
        if !self.common.taskfile.status.contains(Status::DRQ) {
            tracing::warn!("ATAPI data write with drq=0");
            return Effects::new();
        }
        if self.sector_i + iolen > self.sector_total {
            tracing::warn!("ATAPI sector already full");
            return Effects::new();
        }
        if iolen >= 4 {
            self.sector[self.sector_i..self.sector_i + 4].copy_from_slice(&v.to_le_bytes());
            self.sector_i += 4;
        } else if iolen >= 2 {
            self.sector[self.sector_i..self.sector_i + 2].copy_from_slice(&(v as u16).to_le_bytes());
            self.sector_i += 2;
        } else {
            self.sector[self.sector_i] = v as u8;
            self.sector_i += 1;
        }
        if self.sector_i >= self.sector_total {
            self.io_completion()
        } else {
            Effects::new()
        }
    }

    /// `io_completion` for ATAPI: most commands end here (no re-arm), as
    /// only the HDD device has a multi-sector DRQ loop. A PACKET (0xA0)
    /// data phase gets a second IRQ here and `count = 0x03`; real IDE ATAPI
    /// controllers fire another IRQ after the transfer completes, and
    /// MS-DOS CD-ROM drivers assume that. IDENTIFY PACKET DEVICE's data
    /// phase touches neither.
    fn io_completion(&mut self) -> Effects {
        let mut fx = Effects::new();
        self.common.taskfile.status.remove(Status::DRQ);
        self.common.allow_writing = true;

        if self.common.taskfile.command == ata_cmd::PACKET {
            self.common.taskfile.count = 0x03;
            self.common.state = DeviceState::Ready;
            fx.push(Effect::RaiseIrq);
        } else {
            self.common.state = DeviceState::Ready;
        }

        fx
    }

    /// Loading-state-machine transition callback (§4.6), fired by whichever
    /// of the insertion/spin-up/spin-down delays the controller last armed.
    pub fn on_loading_transition(&mut self) -> Effects {
        match self.loading_mode {
            LoadingMode::InsertCd => {
                self.loading_mode = LoadingMode::DiscLoading;
                vec![Effect::Schedule(CallbackKind::LoadingTransition, self.spinup_time)]
            }
            LoadingMode::DiscLoading => {
                self.loading_mode = LoadingMode::DiscReadied;
                vec![Effect::Schedule(CallbackKind::LoadingTransition, self.spindown_timeout)]
            }
            LoadingMode::DiscReadied | LoadingMode::Ready => {
                self.loading_mode = LoadingMode::Idle;
                Effects::new()
            }
            _ => Effects::new(),
        }
    }

    /// Called by the controller when the host signals media insertion.
    pub fn insert_cd(&mut self) -> Effects {
        self.loading_mode = LoadingMode::InsertCd;
        self.has_changed = true;
        vec![Effect::Schedule(CallbackKind::LoadingTransition, self.insertion_time)]
    }
}

fn write_padded(dst: &mut [u8], src: &[u8]) {
    for (i, b) in dst.iter_mut().enumerate() {
        *b = src.get(i).copied().unwrap_or(b' ');
    }
}
