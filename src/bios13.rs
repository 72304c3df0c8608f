//! BIOS INT13h fake-I/O shim (§4.8).
//!
//! Real BIOS disk services normally run entirely inside the BIOS's own
//! code, touching IDE registers directly; emulators that implement INT13h
//! as a host-side shortcut (rather than interpreting real BIOS code) still
//! have to make the IDE registers *look* like a BIOS routine ran, because
//! some guest drivers probe the taskfile registers after an INT13h call to
//! fingerprint the controller (Windows 3.11 WDCTRL) or trap port I/O from
//! virtual 8086 mode to learn which drive is which (Windows 95's ESDI
//! driver). This module is that shortcut's register-level half.
//!
//! Two strategies, matching what the guest is doing:
//!
//! - **Direct taskfile poke**: write the taskfile registers to the values a
//!   real READ SECTOR completion would have left behind, without actually
//!   running the command state machine. Cheap, and enough for drivers that
//!   only read registers back.
//! - **Self-issued port-I/O replay**: drive the controller through a real
//!   register sequence (select, program taskfile, issue command, poll
//!   busy, drain the data port) via the same [`Controller`] entry points a
//!   guest would use. Needed when the guest is watching for port I/O in
//!   virtual 8086 mode. [`DeviceCommon::faked_command`] is set for the
//!   duration so the device's own tracing doesn't log it as a real command.
//!
//! Both are gated per-controller by [`ControllerConfig::int13_fake_io`] and
//! [`ControllerConfig::int13_fake_v86_io`]; a controller with neither set is
//! skipped entirely, matching how a real INT13h call would have no fake-I/O
//! effect on a controller the BIOS doesn't route the call through.
//!
//! This module does not model the host PIC: the original shim also issues a
//! specific-EOI to the 8259 after the self-I/O replay so a real in-flight
//! IRQ doesn't get stuck pending. That's the surrounding emulator's job,
//! not the IDE channel's; callers that model a PIC should issue the EOI
//! themselves once this returns.

use crate::controller::Controller;
use crate::device::Device;
use crate::scheduler::CallbackKind;
use crate::taskfile::Status;

/// Outcome of an INT13h fake-I/O call: which slot (master=0/slave=1)
/// answered, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Int13Outcome {
    NotHandled,
    Handled { slot: usize },
}

fn find_bios_disk(ctrl: &Controller, disk: u8) -> Option<usize> {
    for slot in 0..2 {
        if let Some(Device::Ata(ata)) = ctrl.device(slot) {
            if ata.bios_disk_index == Some(disk) {
                return Some(slot);
            }
        }
    }
    None
}

/// Select `slot` the way the shim does before touching any device-specific
/// state: a self-issued status read followed by a drive-select write, with
/// `faked_command` set so it doesn't read back as a real command in
/// progress.
fn self_io_select(ctrl: &mut Controller, slot: usize) {
    if let Some(dev) = ctrl.device_mut(slot) {
        dev.set_faked_command(true);
    }
    let _ = ctrl.read_base(7, 1);
    ctrl.write_base(6, (slot as u32) << 4, 1);
    if let Some(dev) = ctrl.device_mut(slot) {
        dev.set_faked_command(false);
    }
}

/// LBA-mode INT13h extended read (`IDE_EmuINT13DiskReadByBIOS_LBA`).
/// `disk` is the absolute BIOS drive number (0x80+). Returns
/// [`Int13Outcome::NotHandled`] if no attached drive answers to `disk` or no
/// controller has fake I/O enabled.
pub fn disk_read_lba(ctrl: &mut Controller, disk: u8, lba: u64, vm86: bool) -> Int13Outcome {
    if !ctrl.int13_fake_io && !ctrl.int13_fake_v86_io {
        return Int13Outcome::NotHandled;
    }
    let Some(slot) = find_bios_disk(ctrl, disk) else {
        return Int13Outcome::NotHandled;
    };

    self_io_select(ctrl, slot);

    if ctrl.int13_fake_v86_io && vm86 {
        replay_read_sector(ctrl, slot, lba);
    } else {
        direct_poke_read_completion(ctrl, slot, lba);
    }

    Int13Outcome::Handled { slot }
}

/// CHS-mode INT13h read (`IDE_EmuINT13DiskReadByBIOS`). `sect` is 1-based,
/// matching the INT13h convention the taskfile sector-number register
/// shares. Geometry translation/track-wrap correction that the original
/// performs against BIOS-reported vs. IDE-reported geometry is the caller's
/// responsibility; this entry point assumes `cyl`/`head`/`sect` are already
/// in IDE geometry terms.
pub fn disk_read_chs(
    ctrl: &mut Controller,
    disk: u8,
    cyl: u16,
    head: u8,
    sect: u8,
    vm86: bool,
) -> Int13Outcome {
    if !ctrl.int13_fake_io && !ctrl.int13_fake_v86_io {
        return Int13Outcome::NotHandled;
    }
    let Some(slot) = find_bios_disk(ctrl, disk) else {
        return Int13Outcome::NotHandled;
    };

    self_io_select(ctrl, slot);

    if ctrl.int13_fake_v86_io && vm86 {
        replay_read_sector_chs(ctrl, slot, cyl, head, sect);
    } else {
        direct_poke_read_completion_chs(ctrl, slot, cyl, head, sect);
    }

    Int13Outcome::Handled { slot }
}

/// `IDE_ResetDiskByBIOS`: INT13h AH=0x00 (reset disk system).
pub fn reset_disk(ctrl: &mut Controller, disk: u8, vm86: bool) -> Int13Outcome {
    if !ctrl.int13_fake_io && !ctrl.int13_fake_v86_io {
        return Int13Outcome::NotHandled;
    }
    let Some(slot) = find_bios_disk(ctrl, disk) else {
        return Int13Outcome::NotHandled;
    };

    self_io_select(ctrl, slot);

    if ctrl.int13_fake_v86_io && vm86 {
        if let Some(dev) = ctrl.device_mut(slot) {
            dev.set_faked_command(true);
        }
        let _ = ctrl.read_base(7, 1);
        ctrl.write_base(7, 0x08, 1); // DEVICE RESET
        let _ = ctrl.read_base(7, 1);
        if let Some(dev) = ctrl.device_mut(slot) {
            dev.set_faked_command(false);
        }
    } else {
        if let Some(dev) = ctrl.device_mut(slot) {
            dev.set_faked_command(true);
        }
        ctrl.write_base(7, 0x08, 1); // DEVICE RESET, applied through the normal effect path
        if let Some(dev) = ctrl.device_mut(slot) {
            dev.set_faked_command(false);
        }
        ctrl.lower_irq();
    }

    Int13Outcome::Handled { slot }
}

fn replay_read_sector(ctrl: &mut Controller, slot: usize, lba: u64) {
    if let Some(dev) = ctrl.device_mut(slot) {
        dev.set_faked_command(true);
    }

    let _ = ctrl.read_base(7, 1);
    ctrl.write_base(
        6,
        0xA0 | ((slot as u32) << 4) | (((lba >> 24) & 0x0F) as u32),
        1,
    );
    let _ = ctrl.read_base(7, 1);
    ctrl.write_base(2, 1, 1); // sector count
    ctrl.write_base(3, (lba & 0xFF) as u32, 1);
    ctrl.write_base(4, ((lba >> 8) & 0xFF) as u32, 1);
    ctrl.write_base(5, ((lba >> 16) & 0xFF) as u32, 1);
    ctrl.write_base(
        6,
        0xA0 | ((slot as u32) << 4) | (((lba >> 24) & 0x0F) as u32),
        1,
    );
    let _ = ctrl.read_base(7, 1);
    ctrl.write_base(7, 0x20, 1); // READ SECTOR(S)

    drain_busy_and_sector(ctrl, slot);
}

fn replay_read_sector_chs(ctrl: &mut Controller, slot: usize, cyl: u16, head: u8, sect: u8) {
    if let Some(dev) = ctrl.device_mut(slot) {
        dev.set_faked_command(true);
    }

    let drivehead = 0xA0 | ((slot as u32) << 4) | (head as u32 & 0x0F);
    let _ = ctrl.read_base(7, 1);
    ctrl.write_base(6, drivehead, 1);
    let _ = ctrl.read_base(7, 1);
    ctrl.write_base(2, 1, 1);
    ctrl.write_base(3, sect as u32, 1);
    ctrl.write_base(4, (cyl & 0xFF) as u32, 1);
    ctrl.write_base(5, ((cyl >> 8) & 0xFF) as u32, 1);
    ctrl.write_base(6, drivehead, 1);
    let _ = ctrl.read_base(7, 1);
    ctrl.write_base(7, 0x20, 1);

    drain_busy_and_sector(ctrl, slot);
}

/// Materialize the scheduled `DelayedCommand` callback immediately, then
/// poll alt-status for BUSY to clear and drain the 256-word data port —
/// standing in for the original's bare `CPU_CLI()` + tight polling loop
/// across real disk latency. There is no host timer to wait on here: this
/// self-I/O sequence *is* the BIOS pretending time passed, so it fast-
/// forwards the one scheduled event a real poll loop would have blocked on
/// rather than returning control to the host's event loop and coming back.
fn drain_busy_and_sector(ctrl: &mut Controller, slot: usize) {
    ctrl.dispatch_callback(CallbackKind::DelayedCommand);

    for _ in 0..1_000_000 {
        if ctrl.read_alt(0) & Status::BUSY.bits() == 0 {
            break;
        }
    }
    let _ = ctrl.read_base(7, 1);

    for _ in 0..256 {
        let _ = ctrl.read_base(0, 2);
    }
    let _ = ctrl.read_base(7, 1);

    ctrl.lower_irq();
    if let Some(Device::Ata(ata)) = ctrl.device_mut(slot) {
        ata.common.abort_normal();
    }
    if let Some(dev) = ctrl.device_mut(slot) {
        dev.set_faked_command(false);
    }
}

fn direct_poke_read_completion(ctrl: &mut Controller, slot: usize, lba: u64) {
    if let Some(Device::Ata(ata)) = ctrl.device_mut(slot) {
        let tf = &mut ata.common.taskfile;
        tf.feature = 0;
        tf.count = 0;
        tf.lba[0] = (lba & 0xFF) as u8;
        tf.lba[1] = ((lba >> 8) & 0xFF) as u8;
        tf.lba[2] = ((lba >> 16) & 0xFF) as u8;
        tf.drivehead = 0xE0 | ((slot as u8) << 4) | (((lba >> 24) & 0x0F) as u8);
        tf.status = Status::DRIVE_READY | Status::SEEK_COMPLETE;
        ata.common.allow_writing = true;
    }
}

fn direct_poke_read_completion_chs(ctrl: &mut Controller, slot: usize, cyl: u16, head: u8, sect: u8) {
    if let Some(Device::Ata(ata)) = ctrl.device_mut(slot) {
        let tf = &mut ata.common.taskfile;
        tf.feature = 0;
        tf.count = 0;
        tf.lba[0] = sect;
        tf.lba[1] = (cyl & 0xFF) as u8;
        tf.lba[2] = ((cyl >> 8) & 0xFF) as u8;
        tf.drivehead = 0xA0 | ((slot as u8) << 4) | (head & 0x0F);
        tf.status = Status::DRIVE_READY | Status::SEEK_COMPLETE;
        ata.common.allow_writing = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::device::ata::AtaDevice;
    use crate::irq::IrqLine;
    use crate::scheduler::{EventKey, Scheduler};
    use crate::storage::ImageDisk;
    use std::time::Duration;

    struct NullIrq;
    impl IrqLine for NullIrq {
        fn activate(&mut self, _irq: u8) {}
        fn deactivate(&mut self, _irq: u8) {}
    }

    struct NullScheduler;
    impl Scheduler for NullScheduler {
        fn schedule(&mut self, _key: EventKey, _delay: Duration) {}
        fn cancel(&mut self, _key: EventKey) {}
    }

    struct MemDisk(Vec<u8>);
    impl ImageDisk for MemDisk {
        fn sector_count(&self) -> u64 {
            (self.0.len() / 512) as u64
        }
        fn read_absolute_sector(&mut self, sector: u32, buf: &mut [u8]) -> std::io::Result<()> {
            let off = sector as usize * 512;
            buf.copy_from_slice(&self.0[off..off + buf.len()]);
            Ok(())
        }
        fn write_absolute_sector(&mut self, sector: u32, buf: &[u8]) -> std::io::Result<()> {
            let off = sector as usize * 512;
            self.0[off..off + buf.len()].copy_from_slice(buf);
            Ok(())
        }
    }

    fn new_controller(fake_io: bool, fake_v86_io: bool) -> Controller {
        let cfg = ControllerConfig {
            channel: 0,
            int13_fake_io: fake_io,
            int13_fake_v86_io: fake_v86_io,
            ..ControllerConfig::default()
        };
        Controller::new(cfg, Box::new(NullIrq), Box::new(NullScheduler)).unwrap()
    }

    fn attach_bios_disk(ctrl: &mut Controller, slot: usize, bios_disk: u8) {
        let disk = AtaDevice::new(
            Box::new(MemDisk(vec![0u8; 512 * 16])),
            "S".into(),
            "F".into(),
            "M".into(),
            16,
            1,
            1,
        )
        .with_bios_disk_index(bios_disk);
        ctrl.attach(slot, Device::Ata(disk)).unwrap();
    }

    #[test]
    fn disabled_controller_does_not_handle_int13_calls() {
        let mut ctrl = new_controller(false, false);
        attach_bios_disk(&mut ctrl, 0, 0x80);
        assert_eq!(disk_read_lba(&mut ctrl, 0x80, 0, false), Int13Outcome::NotHandled);
    }

    #[test]
    fn unmatched_disk_number_is_not_handled() {
        let mut ctrl = new_controller(true, false);
        attach_bios_disk(&mut ctrl, 0, 0x80);
        assert_eq!(disk_read_lba(&mut ctrl, 0x81, 0, false), Int13Outcome::NotHandled);
    }

    #[test]
    fn direct_poke_path_leaves_ready_seek_complete_status() {
        let mut ctrl = new_controller(true, false);
        attach_bios_disk(&mut ctrl, 0, 0x80);
        let outcome = disk_read_lba(&mut ctrl, 0x80, 5, false);
        assert_eq!(outcome, Int13Outcome::Handled { slot: 0 });
        match ctrl.device(0).unwrap() {
            Device::Ata(ata) => {
                assert!(ata.common.taskfile.status.contains(Status::DRIVE_READY));
                assert!(ata.common.taskfile.status.contains(Status::SEEK_COMPLETE));
                assert_eq!(ata.common.taskfile.lba[0], 5);
                assert!(ata.common.allow_writing);
            }
            _ => panic!("expected ATA device"),
        }
    }

    #[test]
    fn vm86_replay_path_completes_with_device_ready_and_no_irq_latched() {
        let mut ctrl = new_controller(false, true);
        attach_bios_disk(&mut ctrl, 0, 0x80);
        let outcome = disk_read_lba(&mut ctrl, 0x80, 1, true);
        assert_eq!(outcome, Int13Outcome::Handled { slot: 0 });
        match ctrl.device(0).unwrap() {
            Device::Ata(ata) => assert_eq!(ata.common.state, crate::device::state::DeviceState::Ready),
            _ => panic!("expected ATA device"),
        }
    }

    #[test]
    fn reset_disk_direct_poke_clears_irq() {
        let mut ctrl = new_controller(true, false);
        attach_bios_disk(&mut ctrl, 0, 0x80);
        let outcome = reset_disk(&mut ctrl, 0x80, false);
        assert_eq!(outcome, Int13Outcome::Handled { slot: 0 });
    }
}
