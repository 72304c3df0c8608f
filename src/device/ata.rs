//! ATA hard-disk command engine (§4.4, §4.5 "ATA command set").
//!
//! One [`AtaDevice`] owns a backing [`ImageDisk`], the IDENTIFY strings, and
//! the current PIO sector buffer. All register-visible state lives in
//! [`DeviceCommon`]; this module only adds the fields an ATA disk needs on
//! top of that (geometry, multiple-mode, the sector buffer cursor).

use crate::device::identify::IdentifyBuilder;
use crate::device::state::{DeviceCommon, DeviceState};
use crate::effect::{Effect, Effects};
use crate::scheduler::{delay, CallbackKind};
use crate::storage::ImageDisk;
use crate::taskfile::Status;

/// ATA command bytes this engine understands (§4.5).
mod cmd {
    pub const NOP: u8 = 0x00;
    pub const DEVICE_RESET: u8 = 0x08;
    pub const RECALIBRATE_LO: u8 = 0x10;
    pub const RECALIBRATE_HI: u8 = 0x1F;
    pub const READ_SECTOR: u8 = 0x20;
    pub const WRITE_SECTOR: u8 = 0x30;
    pub const READ_VERIFY: u8 = 0x40;
    pub const READ_VERIFY_NORETRY: u8 = 0x41;
    pub const INITIALIZE_DEVICE_PARAMETERS: u8 = 0x91;
    pub const READ_MULTIPLE: u8 = 0xC4;
    pub const WRITE_MULTIPLE: u8 = 0xC5;
    pub const SET_MULTIPLE_MODE: u8 = 0xC6;
    pub const IDENTIFY_PACKET_DEVICE: u8 = 0xA1;
    pub const PACKET: u8 = 0xA0;
    pub const IDENTIFY_DEVICE: u8 = 0xEC;
}

fn is_power_of_2(v: u8) -> bool {
    v != 0 && (v & (v - 1)) == 0
}

/// A single ATA (non-ATAPI) drive attached to one controller slot.
pub struct AtaDevice {
    pub common: DeviceCommon,
    pub disk: Box<dyn ImageDisk>,

    pub id_serial: String,
    pub id_firmware_rev: String,
    pub id_model: String,

    /// Physical (true) geometry, reported by IDENTIFY words 1/3/6.
    pub phys_cylinders: u16,
    pub phys_heads: u8,
    pub phys_sects: u8,

    /// Logical geometry currently in effect; INITIALIZE DEVICE PARAMETERS
    /// (0x91) rewrites `log_heads`/`log_sects` and this recomputes
    /// `log_cylinders` so `log_cylinders * log_heads * log_sects` stays
    /// within the physical sector count.
    pub log_cylinders: u16,
    pub log_heads: u8,
    pub log_sects: u8,

    pub multiple_sector_count: u8,
    pub multiple_sector_max: u8,

    /// DOS BIOS drive number (0x80+) this disk answers to for the
    /// INT13h fake-I/O shim (§4.8); `None` if it isn't BIOS-visible.
    pub bios_disk_index: Option<u8>,

    sector: Vec<u8>,
    sector_i: usize,
    sector_total: usize,
    /// Sectors transferred so far in the current multi-sector command;
    /// used to pick the first-sector `command_ramp` delay vs the
    /// steady-state `reentry` delay on WRITE (SECTOR|MULTIPLE).
    progress_count: u32,
}

impl AtaDevice {
    pub fn new(
        disk: Box<dyn ImageDisk>,
        id_serial: String,
        id_firmware_rev: String,
        id_model: String,
        phys_cylinders: u16,
        phys_heads: u8,
        phys_sects: u8,
    ) -> Self {
        AtaDevice {
            common: DeviceCommon::default(),
            disk,
            id_serial,
            id_firmware_rev,
            id_model,
            phys_cylinders,
            phys_heads,
            phys_sects,
            log_cylinders: phys_cylinders,
            log_heads: phys_heads,
            log_sects: phys_sects,
            multiple_sector_count: 0,
            multiple_sector_max: 128,
            bios_disk_index: None,
            sector: vec![0u8; 512 * 128],
            sector_i: 0,
            sector_total: 0,
            progress_count: 0,
        }
    }

    /// Mark this drive as answering to BIOS disk number `index` (0x80+) for
    /// the INT13h fake-I/O shim (§4.8).
    pub fn with_bios_disk_index(mut self, index: u8) -> Self {
        self.bios_disk_index = Some(index);
        self
    }

    fn prepare_read(&mut self, offset: usize, size: usize) {
        debug_assert_eq!(offset & 1, 0);
        self.sector_i = offset;
        self.sector_total = size;
        debug_assert!(self.sector_i <= self.sector_total);
        debug_assert!(self.sector_total <= self.sector.len());
    }

    fn prepare_write(&mut self, offset: usize, size: usize) {
        self.prepare_read(offset, size);
    }

    /// §4.4's CHS/LBA address-advance rule. `count` is always 1 per call
    /// site here; returns `false` on rollover past the addressable range
    /// (head nibble wrapping for LBA, cylinder wrapping for CHS).
    fn increment_current_address(&mut self) -> bool {
        let tf = &mut self.common.taskfile;
        if tf.is_lba() {
            tf.lba[0] = tf.lba[0].wrapping_add(1);
            if tf.lba[0] == 0 {
                tf.lba[1] = tf.lba[1].wrapping_add(1);
                if tf.lba[1] == 0 {
                    tf.lba[2] = tf.lba[2].wrapping_add(1);
                    if tf.lba[2] == 0 {
                        let head = (tf.drivehead & 0x0F).wrapping_add(1);
                        tf.drivehead = (tf.drivehead & 0xF0) | (head & 0x0F);
                        if head & 0x0F == 0 {
                            tf.drivehead = (tf.drivehead & 0xF0) | 0x0F;
                            return false;
                        }
                    }
                }
            }
        } else {
            let sects = if self.log_sects == 0 { 1 } else { self.log_sects };
            tf.lba[0] = tf.lba[0].wrapping_add(1);
            if tf.lba[0] == sects.wrapping_add(1) {
                tf.lba[0] = 1;
                let heads = self.log_heads & 0xF;
                let head = (tf.drivehead & 0x0F).wrapping_add(1);
                tf.drivehead = (tf.drivehead & 0xF0) | (head & 0x0F);
                if head & 0x0F == heads {
                    tf.drivehead &= 0xF0;
                    if self.log_heads == 16 {
                        tf.drivehead = tf.drivehead.wrapping_sub(0x10);
                    }
                    tf.lba[1] = tf.lba[1].wrapping_add(1);
                    if tf.lba[1] == 0 {
                        tf.lba[2] = tf.lba[2].wrapping_add(1);
                        if tf.lba[2] == 0 {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// Absolute sector number addressed by the current taskfile, under
    /// whichever of LBA28/CHS is selected (§4.4).
    fn current_absolute_sector(&self) -> u32 {
        let tf = &self.common.taskfile;
        if tf.is_lba() {
            tf.lba28()
        } else {
            let cyl = tf.chs_cylinder() as u32;
            let head = tf.chs_head() as u32;
            let sect = tf.chs_sector() as u32;
            let heads = self.log_heads.max(1) as u32;
            let sects = self.log_sects.max(1) as u32;
            (cyl * heads + head) * sects + (sect.saturating_sub(1))
        }
    }

    fn generate_identify_device(&self) -> [u8; 512] {
        let mut b = IdentifyBuilder::new();
        b.write_word(0, 0x0040);
        b.write_word(1, self.phys_cylinders);
        b.write_word(3, self.phys_heads as u16);
        b.write_word(6, self.phys_sects as u16);
        b.write_swapped_ascii(20, 20, &self.id_serial);
        b.write_word(47, 0x8000 | (self.multiple_sector_max as u16));
        b.write_swapped_ascii(46, 8, &self.id_firmware_rev);
        b.write_swapped_ascii(54, 40, &self.id_model);
        b.write_word(53, 0x0007);
        b.write_word(54, self.log_cylinders);
        b.write_word(55, self.log_heads as u16);
        b.write_word(56, self.log_sects as u16);
        let total = (self.log_cylinders as u32) * (self.log_heads as u32) * (self.log_sects as u32);
        b.write_dword(57, total);
        b.write_word(59, 0x0100 | (self.multiple_sector_count as u16));
        let phys_total =
            (self.phys_cylinders as u32) * (self.phys_heads as u32) * (self.phys_sects as u32);
        b.write_dword(60, phys_total);
        b.write_word(80, 0x007E);
        b.write_word(81, 0x0022);
        b.write_word(82, 0x4008);
        b.write_word(83, 0x0000);
        b.write_word(85, 0x4208);
        b.write_word(86, 0x0000);
        // Word 93 is unused by this command set; zero is written explicitly
        // (matching the reference implementation's literal byte offset,
        // which has no observable effect since the buffer is zeroed already).
        b.write_word(93, 0x0000);
        b.finish()
    }

    /// Dispatch a command byte written to the command register (§4.1/§4.5).
    /// Mirrors `writecommand`: decides whether the command starts
    /// immediately, enters `Busy` pending a scheduled completion, or aborts.
    pub fn writecommand(&mut self, cmd: u8) -> Effects {
        let mut fx = Effects::new();

        if !self.common.command_interruption_ok(cmd) {
            fx.push(Effect::RaiseIrq);
            return fx;
        }

        self.common.allow_writing = false;
        self.common.taskfile.command = cmd;

        match cmd {
            cmd::NOP => {
                // NOP always aborts with an error; unlike every other abort
                // path this one reports `feature = 0x04` (abort) rather than
                // a clean READY_SEEK.
                self.common.state = DeviceState::Ready;
                self.common.allow_writing = true;
                self.common.taskfile.command = 0x00;
                self.common.taskfile.feature = 0x04;
                self.common.taskfile.status = Status::DRIVE_READY | Status::ERROR;
                fx.push(Effect::RaiseIrq);
            }
            cmd::DEVICE_RESET => {
                self.common.taskfile.status = Status::READY_SEEK;
                self.common.taskfile.drivehead &= 0x10;
                self.common.taskfile.count = 0x01;
                self.common.taskfile.lba = [0x01, 0, 0];
                self.common.taskfile.feature = 0x00;
                self.common.taskfile.command = 0x00;
                self.common.state = DeviceState::Ready;
                self.common.allow_writing = true;
                fx.push(Effect::SetDrivehead(self.common.taskfile.drivehead));
                fx.push(Effect::RaiseIrq);
            }
            c if (cmd::RECALIBRATE_LO..=cmd::RECALIBRATE_HI).contains(&c) => {
                let is_lba = self.common.taskfile.is_lba();
                self.common.taskfile.lba[0] = if is_lba { 0x00 } else { 0x01 };
                self.common.taskfile.lba[1] = 0;
                self.common.taskfile.lba[2] = 0;
                self.common.taskfile.drivehead &= 0x10;
                self.common.taskfile.feature = 0x00;
                self.common.taskfile.status = Status::READY_SEEK;
                self.common.taskfile.command = 0x00;
                self.common.state = DeviceState::Ready;
                self.common.allow_writing = true;
                fx.push(Effect::SetDrivehead(self.common.taskfile.drivehead));
                fx.push(Effect::RaiseIrq);
            }
            cmd::READ_SECTOR => {
                self.progress_count = 0;
                self.common.state = DeviceState::Busy;
                self.common.taskfile.status = Status::BUSY;
                fx.push(Effect::Schedule(
                    CallbackKind::DelayedCommand,
                    delay::ata_read(self.common.faked_command),
                ));
            }
            cmd::WRITE_SECTOR => {
                self.progress_count = 0;
                self.prepare_write(0, 512);
                self.common.state = DeviceState::DataWrite;
                self.common.taskfile.status = Status::ready_seek_drq();
                self.common.allow_writing = true;
            }
            cmd::READ_VERIFY | cmd::READ_VERIFY_NORETRY => {
                self.common.state = DeviceState::Busy;
                self.common.taskfile.status = Status::BUSY;
                fx.push(Effect::Schedule(
                    CallbackKind::DelayedCommand,
                    delay::ata_read(self.common.faked_command),
                ));
            }
            cmd::INITIALIZE_DEVICE_PARAMETERS => {
                self.log_heads = (self.common.taskfile.drivehead & 0x0F) + 1;
                self.log_sects = self.common.taskfile.count.max(1);
                let per_cyl = (self.log_heads as u32) * (self.log_sects as u32);
                let phys_total = (self.phys_cylinders as u32)
                    * (self.phys_heads as u32)
                    * (self.phys_sects as u32);
                self.log_cylinders = if per_cyl == 0 {
                    0
                } else {
                    (phys_total / per_cyl).min(u16::MAX as u32) as u16
                };
                self.common.abort_normal();
                fx.push(Effect::RaiseIrq);
            }
            cmd::READ_MULTIPLE => {
                if self.multiple_sector_count == 0 {
                    self.common.abort_error();
                    fx.push(Effect::RaiseIrq);
                } else {
                    self.progress_count = 0;
                    self.common.state = DeviceState::Busy;
                    self.common.taskfile.status = Status::BUSY;
                    fx.push(Effect::Schedule(
                        CallbackKind::DelayedCommand,
                        delay::ata_read(self.common.faked_command),
                    ));
                }
            }
            cmd::WRITE_MULTIPLE => {
                if self.multiple_sector_count == 0 {
                    self.common.abort_error();
                    fx.push(Effect::RaiseIrq);
                } else {
                    self.progress_count = 0;
                    let n = (self.multiple_sector_count as usize).min(
                        self.common.taskfile.count_or_256() as usize,
                    );
                    self.prepare_write(0, 512 * n.max(1));
                    self.common.state = DeviceState::DataWrite;
                    self.common.taskfile.status = Status::ready_seek_drq();
                    self.common.allow_writing = true;
                }
            }
            cmd::SET_MULTIPLE_MODE => {
                let n = self.common.taskfile.count;
                if n == 0 || is_power_of_2(n) {
                    self.multiple_sector_count = n;
                    self.common.abort_normal();
                } else {
                    self.common.abort_error();
                }
                fx.push(Effect::RaiseIrq);
            }
            cmd::PACKET | cmd::IDENTIFY_PACKET_DEVICE => {
                // ATAPI-only commands issued to an ATA disk: abort with the
                // ATAPI signature left in the taskfile so host probing code
                // can tell the device type apart (§4.9).
                self.common.taskfile.lba = [0x01, 0x14, 0xEB];
                self.common.abort_error();
                fx.push(Effect::RaiseIrq);
            }
            cmd::IDENTIFY_DEVICE => {
                self.sector = self.generate_identify_device().to_vec();
                self.sector.resize(512 * 128, 0);
                self.prepare_read(0, 512);
                self.common.state = DeviceState::DataRead;
                self.common.taskfile.status = Status::ready_seek_drq();
                self.common.allow_writing = true;
                fx.push(Effect::RaiseIrq);
            }
            _ => {
                self.common.abort_error();
                fx.push(Effect::RaiseIrq);
            }
        }

        fx
    }

    pub fn data_read(&mut self, iolen: usize) -> (u16, Effects) {
        if self.common.state != DeviceState::DataRead {
            return (0xFFFF, Effects::new());
        }
        if !self.common.taskfile.status.contains(Status::DRQ) {
            tracing::warn!("ata data read when DRQ=0");
            return (0xFFFF, Effects::new());
        }
        if self.sector_i + iolen > self.sector_total {
            tracing::warn!(sector_i = self.sector_i, sector_total = self.sector_total, "ata sector already read");
            return (0xFFFF, Effects::new());
        }

        let w = self.read_word(iolen);

        let fx = if self.sector_i >= self.sector_total {
            self.io_completion()
        } else {
            Effects::new()
        };
        (w, fx)
    }

    fn read_word(&mut self, iolen: usize) -> u16 {
        if iolen >= 4 {
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
        }
    }

    pub fn data_write(&mut self, v: u32, iolen: usize) -> Effects {
        if self.common.state != DeviceState::DataWrite {
            tracing::warn!("ata data write when device not in data_write state");
            return Effects::new();
        }
        if !self.common.taskfile.status.contains(Status::DRQ) {
            tracing::warn!("ata data write with drq=0");
            return Effects::new();
        }
        if self.sector_i + iolen > self.sector_total {
            tracing::warn!(sector_i = self.sector_i, sector_total = self.sector_total, "ata sector already full");
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

    /// `io_completion` (§4.4): clears DRQ, then either re-arms for the next
    /// sector or returns to `Ready`. No IRQ is ever raised here — all IRQs
    /// come from the scheduled `DelayedCommand` callback that follows.
    fn io_completion(&mut self) -> Effects {
        let mut fx = Effects::new();
        self.common.taskfile.status.remove(Status::DRQ);

        match self.common.taskfile.command {
            cmd::READ_SECTOR => {
                self.progress_count += 1;
                if self.common.taskfile.count_or_256() == 1 {
                    self.common.taskfile.count = 0;
                    self.common.taskfile.status = Status::READY_SEEK;
                    self.common.state = DeviceState::Ready;
                    self.common.allow_writing = true;
                    return fx;
                }
                self.common.taskfile.count = self.common.taskfile.count.wrapping_sub(1);
                if !self.increment_current_address() {
                    tracing::warn!("READ advance error");
                    self.common.abort_error();
                    return fx;
                }
                self.common.state = DeviceState::Busy;
                self.common.taskfile.status = Status::BUSY;
                fx.push(Effect::Schedule(
                    CallbackKind::DelayedCommand,
                    delay::reentry(self.common.faked_command),
                ));
            }
            cmd::WRITE_SECTOR => {
                self.common.state = DeviceState::Busy;
                self.common.taskfile.status = Status::BUSY;
                let d = if self.progress_count == 0 && !self.common.faked_command {
                    delay::command_ramp(false)
                } else {
                    delay::reentry(self.common.faked_command)
                };
                fx.push(Effect::Schedule(CallbackKind::DelayedCommand, d));
            }
            cmd::READ_MULTIPLE => {
                for _ in 0..self.multiple_sector_count.max(1) {
                    self.progress_count += 1;
                    if self.common.taskfile.count_or_256() == 1 {
                        self.common.taskfile.count = 0;
                        self.common.taskfile.status = Status::READY_SEEK;
                        self.common.state = DeviceState::Ready;
                        self.common.allow_writing = true;
                        return fx;
                    }
                    self.common.taskfile.count = self.common.taskfile.count.wrapping_sub(1);
                    if !self.increment_current_address() {
                        tracing::warn!("READ advance error");
                        self.common.abort_error();
                        return fx;
                    }
                }
                self.common.state = DeviceState::Busy;
                self.common.taskfile.status = Status::BUSY;
                fx.push(Effect::Schedule(
                    CallbackKind::DelayedCommand,
                    delay::reentry(self.common.faked_command),
                ));
            }
            cmd::WRITE_MULTIPLE => {
                self.common.state = DeviceState::Busy;
                self.common.taskfile.status = Status::BUSY;
                let d = if self.progress_count == 0 && !self.common.faked_command {
                    delay::command_ramp(false)
                } else {
                    delay::reentry(self.common.faked_command)
                };
                fx.push(Effect::Schedule(CallbackKind::DelayedCommand, d));
            }
            _ => {
                self.common.taskfile.count = 0;
                self.common.taskfile.drivehead &= 0xF0;
                self.common.taskfile.lba = [0, 0, 0];
                self.common.taskfile.status = Status::READY_SEEK;
                self.common.state = DeviceState::Ready;
                self.common.allow_writing = true;
            }
        }

        fx
    }

    /// `IDE_DelayedCommand`'s HDD branch: fired when a `Busy` period
    /// matures. Performs the actual backing-store I/O for the sector just
    /// addressed/accepted and raises the IRQ that tells the guest data is
    /// ready (or that a write has landed).
    pub fn on_delayed_command(&mut self) -> Effects {
        let mut fx = Effects::new();

        match self.common.taskfile.command {
            cmd::READ_SECTOR | cmd::READ_MULTIPLE => {
                let lba = self.current_absolute_sector();
                self.prepare_read(0, 512);
                if self.disk.read_absolute_sector(lba, &mut self.sector[0..512]).is_err() {
                    tracing::warn!(lba, "ata read failed");
                    self.common.abort_error();
                    fx.push(Effect::RaiseIrq);
                    return fx;
                }
                self.common.state = DeviceState::DataRead;
                self.common.taskfile.status = Status::ready_seek_drq();
                self.common.allow_writing = true;
                fx.push(Effect::RaiseIrq);
            }
            cmd::WRITE_SECTOR | cmd::WRITE_MULTIPLE => {
                let lba = self.current_absolute_sector();
                if self.disk.write_absolute_sector(lba, &self.sector[0..512]).is_err() {
                    tracing::warn!(lba, "ata write failed");
                    self.common.abort_error();
                    fx.push(Effect::RaiseIrq);
                    return fx;
                }
                self.progress_count += 1;
                if self.common.taskfile.count_or_256() == 1 {
                    self.common.taskfile.count = 0;
                    self.common.taskfile.status = Status::READY_SEEK;
                    self.common.state = DeviceState::Ready;
                    self.common.allow_writing = true;
                    fx.push(Effect::RaiseIrq);
                    return fx;
                }
                self.common.taskfile.count = self.common.taskfile.count.wrapping_sub(1);
                if !self.increment_current_address() {
                    tracing::warn!("WRITE advance error");
                    self.common.abort_error();
                    fx.push(Effect::RaiseIrq);
                    return fx;
                }
                self.prepare_write(0, 512);
                self.common.state = DeviceState::DataWrite;
                self.common.taskfile.status = Status::ready_seek_drq();
                self.common.allow_writing = true;
                fx.push(Effect::RaiseIrq);
            }
            cmd::READ_VERIFY | cmd::READ_VERIFY_NORETRY => {
                let lba = self.current_absolute_sector();
                let mut scratch = [0u8; 512];
                if self.disk.read_absolute_sector(lba, &mut scratch).is_err() {
                    self.common.abort_error();
                } else {
                    self.common.taskfile.count = 0;
                    self.common.abort_normal();
                }
                fx.push(Effect::RaiseIrq);
            }
            _ => {
                self.common.abort_normal();
                fx.push(Effect::RaiseIrq);
            }
        }

        fx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;

    struct MemDisk {
        sectors: HashMap<u32, [u8; 512]>,
        count: u64,
    }

    impl MemDisk {
        fn new(count: u64) -> Self {
            MemDisk { sectors: HashMap::new(), count }
        }
    }

    impl ImageDisk for MemDisk {
        fn sector_count(&self) -> u64 {
            self.count
        }

        fn read_absolute_sector(&mut self, sector: u32, buf: &mut [u8]) -> io::Result<()> {
            let src = self.sectors.get(&sector).copied().unwrap_or([0u8; 512]);
            buf.copy_from_slice(&src);
            Ok(())
        }

        fn write_absolute_sector(&mut self, sector: u32, buf: &[u8]) -> io::Result<()> {
            let mut dst = [0u8; 512];
            dst.copy_from_slice(buf);
            self.sectors.insert(sector, dst);
            Ok(())
        }
    }

    fn new_dev() -> AtaDevice {
        AtaDevice::new(
            Box::new(MemDisk::new(1024)),
            "ABC".into(),
            "FW01".into(),
            "TEST MODEL".into(),
            16,
            4,
            17,
        )
    }

    #[test]
    fn identify_contains_swapped_serial_at_byte_20() {
        let dev = new_dev();
        let buf = dev.generate_identify_device();
        assert_eq!(&buf[20..24], b"BA C");
        assert_eq!(buf[510], 0xA5);
        let sum = buf.iter().fold(0u8, |a, &b| a.wrapping_add(b));
        assert_eq!(sum, 0);
    }

    #[test]
    fn read_sector_completion_raises_no_irq_at_terminal_count() {
        let mut dev = new_dev();
        dev.common.taskfile.count = 1;
        dev.common.taskfile.drivehead = 0xE0;
        dev.common.taskfile.command = cmd::READ_SECTOR;
        dev.common.state = DeviceState::DataRead;
        dev.common.taskfile.status = Status::ready_seek_drq();
        dev.prepare_read(0, 512);
        for _ in 0..255 {
            let _ = dev.data_read(2);
        }
        let (_w, fx) = dev.data_read(2);
        assert!(fx.is_empty());
        assert_eq!(dev.common.state, DeviceState::Ready);
        assert!(!dev.common.taskfile.status.contains(Status::BUSY));
    }

    #[test]
    fn write_sector_first_sector_uses_command_ramp_delay() {
        let mut dev = new_dev();
        dev.progress_count = 0;
        dev.common.faked_command = false;
        dev.common.taskfile.command = cmd::WRITE_SECTOR;
        let fx = dev.io_completion();
        assert_eq!(
            fx,
            vec![Effect::Schedule(CallbackKind::DelayedCommand, delay::command_ramp(false))]
        );
    }

    #[test]
    fn write_sector_subsequent_sector_uses_reentry_delay() {
        let mut dev = new_dev();
        dev.progress_count = 1;
        dev.common.faked_command = false;
        dev.common.taskfile.command = cmd::WRITE_SECTOR;
        let fx = dev.io_completion();
        assert_eq!(
            fx,
            vec![Effect::Schedule(CallbackKind::DelayedCommand, delay::reentry(false))]
        );
    }

    #[test]
    fn set_multiple_mode_rejects_non_power_of_two() {
        let mut dev = new_dev();
        dev.common.taskfile.count = 3;
        let _ = dev.writecommand(cmd::SET_MULTIPLE_MODE);
        assert_eq!(dev.multiple_sector_count, 0);
        assert!(dev.common.taskfile.status.contains(Status::ERROR));
    }

    #[test]
    fn nop_aborts_with_abort_feature_and_error_status() {
        let mut dev = new_dev();
        let fx = dev.writecommand(cmd::NOP);
        assert_eq!(dev.common.taskfile.feature, 0x04);
        assert!(dev.common.taskfile.status.contains(Status::ERROR));
        assert!(dev.common.taskfile.status.contains(Status::DRIVE_READY));
        assert_eq!(fx, vec![Effect::RaiseIrq]);
    }

    #[test]
    fn device_reset_restores_ata_signature_and_raises_irq() {
        let mut dev = new_dev();
        dev.common.taskfile.count = 0xAB;
        dev.common.taskfile.lba = [0x11, 0x22, 0x33];
        dev.common.taskfile.drivehead = 0xB7;
        let fx = dev.writecommand(cmd::DEVICE_RESET);
        assert_eq!(dev.common.taskfile.count, 0x01);
        assert_eq!(dev.common.taskfile.lba, [0x01, 0, 0]);
        assert_eq!(dev.common.taskfile.drivehead, 0x10);
        assert_eq!(dev.common.taskfile.feature, 0x00);
        assert_eq!(dev.common.taskfile.status, Status::READY_SEEK);
        assert_eq!(fx, vec![Effect::SetDrivehead(0x10), Effect::RaiseIrq]);
    }

    #[test]
    fn recalibrate_in_chs_mode_parks_at_sector_one() {
        let mut dev = new_dev();
        dev.common.taskfile.drivehead = 0x13; // CHS mode, head 3
        let fx = dev.writecommand(cmd::RECALIBRATE_LO);
        assert_eq!(dev.common.taskfile.lba, [0x01, 0, 0]);
        assert_eq!(dev.common.taskfile.drivehead, 0x10);
        assert_eq!(dev.common.taskfile.feature, 0x00);
        assert_eq!(fx, vec![Effect::SetDrivehead(0x10), Effect::RaiseIrq]);
    }

    #[test]
    fn recalibrate_in_lba_mode_parks_at_lba_zero() {
        let mut dev = new_dev();
        dev.common.taskfile.drivehead = 0xE3; // LBA mode (bits 7:5 = 111)
        let _ = dev.writecommand(cmd::RECALIBRATE_LO);
        assert_eq!(dev.common.taskfile.lba, [0x00, 0, 0]);
    }

    #[test]
    fn set_multiple_mode_accepts_power_of_two() {
        let mut dev = new_dev();
        dev.common.taskfile.count = 16;
        let _ = dev.writecommand(cmd::SET_MULTIPLE_MODE);
        assert_eq!(dev.multiple_sector_count, 16);
    }
}
