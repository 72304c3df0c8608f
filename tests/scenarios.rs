//! End-to-end scenarios exercised purely through the public port-I/O front
//! end (`Controller::read_base`/`write_base`/`read_alt`/`dispatch_callback`),
//! the same surface a real emulator core would drive. Scheduling is advanced
//! by hand rather than through a real timer, since the test scheduler never
//! actually fires anything on its own.

mod common;

use common::*;
use ide_hba::{CallbackKind, Device, Status};

#[test]
fn s1_identify_device_reports_configured_geometry_and_strings() {
    let (mut ctrl, irq) = new_controller();
    attach_ata(&mut ctrl, 0, 20 * 16 * 63, "ABC", "F1", "TEST", 20, 16, 63);

    ctrl.write_base(7, 0xEC, 1); // IDENTIFY DEVICE
    assert_eq!(irq.active.borrow().as_slice(), &[14]);

    let mut buf = [0u8; 512];
    for i in 0..256 {
        let w = ctrl.read_base(0, 2);
        buf[i * 2] = w as u8;
        buf[i * 2 + 1] = (w >> 8) as u8;
    }

    assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 20); // word 1: cylinders
    assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), 16); // word 3: heads
    assert_eq!(u16::from_le_bytes([buf[12], buf[13]]), 63); // word 6: sectors
    assert_eq!(&buf[20..24], b"BA C"); // "ABC" pair-swapped
    assert_eq!(buf[510], 0xA5);
    let sum = buf.iter().fold(0u8, |a, &b| a.wrapping_add(b));
    assert_eq!(sum, 0);

    assert_eq!(ctrl.read_alt(0) & Status::BUSY.bits(), 0);
}

#[test]
fn s2_chs_read_at_last_sector_completes_without_a_second_irq() {
    let (mut ctrl, irq) = new_controller();
    attach_ata(&mut ctrl, 0, 4, "S", "F", "M", 2, 1, 2);

    ctrl.write_base(6, 0xA0, 1); // CHS mode, head 0, slot 0
    ctrl.write_base(2, 1, 1); // count = 1
    ctrl.write_base(3, 2, 1); // sector = 2
    ctrl.write_base(4, 1, 1); // cylinder low = 1
    ctrl.write_base(5, 0, 1); // cylinder high = 0
    ctrl.write_base(7, 0x20, 1); // READ SECTOR(S)

    ctrl.dispatch_callback(CallbackKind::DelayedCommand);
    assert_eq!(irq.active.borrow().len(), 1);

    for _ in 0..255 {
        ctrl.read_base(0, 2);
    }
    let irq_count_before_last = irq.active.borrow().len();
    ctrl.read_base(0, 2); // final word of the sector: terminal io_completion

    assert_eq!(irq.active.borrow().len(), irq_count_before_last); // no new IRQ
    let status = ctrl.read_alt(0);
    assert_eq!(status & Status::BUSY.bits(), 0);
    assert_eq!(status & Status::DRQ.bits(), 0);
    assert_ne!(status & Status::DRIVE_READY.bits(), 0);
    assert_ne!(status & Status::SEEK_COMPLETE.bits(), 0);
}

#[test]
fn s3_test_unit_ready_on_idle_drive_completes_synchronously() {
    let (mut ctrl, irq) = new_controller();
    attach_atapi(&mut ctrl, 0, (1, 1), 1000);

    ctrl.write_base(6, 0xA0, 1); // select slot 0
    ctrl.write_base(7, 0xA0, 1); // PACKET
    ctrl.dispatch_callback(CallbackKind::DelayedCommand); // matures the PACKET buffer

    let cmd = [0u8; 12]; // opcode 0x00 = TEST UNIT READY
    write_atapi_command(&mut ctrl, &cmd);

    assert_eq!(ctrl.read_base(2, 1), 0x03);
    let status = ctrl.read_alt(0);
    assert_eq!(status & Status::ERROR.bits(), 0);
    assert_ne!(status & Status::DRIVE_READY.bits(), 0);
    assert_ne!(status & Status::SEEK_COMPLETE.bits(), 0);
    assert!(!irq.active.borrow().is_empty());
}

#[test]
fn s4_read10_on_newly_inserted_disc_reports_medium_changed_then_succeeds() {
    let (mut ctrl, _irq) = new_controller();
    attach_atapi(&mut ctrl, 0, (1, 1), 1000);

    match ctrl.device_mut(0) {
        Some(Device::Atapi(d)) => {
            let _ = d.insert_cd();
        }
        _ => panic!("expected ATAPI device"),
    }
    ctrl.dispatch_callback(CallbackKind::LoadingTransition); // InsertCd -> DiscLoading
    ctrl.dispatch_callback(CallbackKind::LoadingTransition); // DiscLoading -> DiscReadied

    let read10 = [0x28, 0, 0, 0, 0, 16, 0, 0, 1, 0, 0, 0]; // LBA 16, 1 sector

    // First attempt: the disc just became ready, so the pending media-change
    // notification aborts the command with MEDIUM CHANGED before any data
    // transfer starts.
    ctrl.write_base(7, 0xA0, 1);
    ctrl.dispatch_callback(CallbackKind::DelayedCommand);
    write_atapi_command(&mut ctrl, &read10);

    assert_eq!(ctrl.read_base(2, 1), 0x03);
    let status = ctrl.read_alt(0);
    assert_ne!(status & Status::ERROR.bits(), 0);
    assert_eq!(status & Status::BUSY.bits(), 0);

    // Retry: has_changed is now clear, so the read actually runs.
    ctrl.write_base(7, 0xA0, 1);
    ctrl.dispatch_callback(CallbackKind::DelayedCommand);
    write_atapi_command(&mut ctrl, &read10);
    ctrl.dispatch_callback(CallbackKind::AtapiBusyTime);

    let status = ctrl.read_alt(0);
    assert_eq!(status & Status::ERROR.bits(), 0);
    assert_ne!(status & Status::DRQ.bits(), 0);

    let mut data = Vec::with_capacity(2048);
    for _ in 0..1024 {
        let w = ctrl.read_base(0, 2);
        data.push(w as u8);
        data.push((w >> 8) as u8);
    }
    assert_eq!(data.len(), 2048);
    assert_eq!(data[0], (16u32 % 256) as u8);
    assert_eq!(data[1], (17u32 % 256) as u8);

    let status = ctrl.read_alt(0);
    assert_ne!(status & Status::DRIVE_READY.bits(), 0);
    assert_eq!(status & Status::DRQ.bits(), 0);
}

#[test]
fn s5_set_multiple_mode_rejects_non_power_of_two_at_port_level() {
    let (mut ctrl, irq) = new_controller();
    attach_ata(&mut ctrl, 0, 1024, "S", "F", "M", 16, 4, 17);

    ctrl.write_base(2, 3, 1); // count = 3, not a power of two
    ctrl.write_base(7, 0xC6, 1); // SET MULTIPLE MODE

    let status = ctrl.read_alt(0);
    assert_ne!(status & Status::ERROR.bits(), 0);
    assert!(!irq.active.borrow().is_empty());
    match ctrl.device(0) {
        Some(Device::Ata(ata)) => assert_eq!(ata.multiple_sector_count, 0),
        _ => panic!("expected ATA device"),
    }
}

#[test]
fn s6_int13_chs_shim_direct_poke_leaves_taskfile_matching_the_call() {
    use ide_hba::bios13::{disk_read_chs, Int13Outcome};
    use ide_hba::{AtaDevice, ControllerConfig, Controller};

    let cfg = ControllerConfig { channel: 0, int13_fake_io: true, ..ControllerConfig::default() };
    let (irq, sched) = (RecordingIrq::default(), NullScheduler);
    let mut ctrl = Controller::new(cfg, Box::new(irq), Box::new(sched)).unwrap();
    let disk = AtaDevice::new(
        Box::new(MemDisk::new(16)),
        "S".into(),
        "F".into(),
        "M".into(),
        16,
        4,
        17,
    )
    .with_bios_disk_index(0x80);
    ctrl.attach(0, Device::Ata(disk)).unwrap();

    let outcome = disk_read_chs(&mut ctrl, 0x80, 10, 2, 3, false);
    assert_eq!(outcome, Int13Outcome::Handled { slot: 0 });

    match ctrl.device(0).unwrap() {
        Device::Ata(ata) => {
            assert_eq!(ata.common.taskfile.lba[0], 3); // sector
            assert_eq!(ata.common.taskfile.lba[1], 10); // cylinder low
            assert_eq!(ata.common.taskfile.drivehead & 0x0F, 2); // head
            assert!(ata.common.taskfile.status.contains(Status::DRIVE_READY));
            assert!(ata.common.taskfile.status.contains(Status::SEEK_COMPLETE));
            assert!(ata.common.allow_writing);
        }
        _ => panic!("expected ATA device"),
    }
}
