//! Shared test scaffolding for the integration scenarios (§8): a recording
//! IRQ line, a synchronous no-op scheduler (callbacks are fired by hand via
//! `Controller::dispatch_callback` to keep these tests deterministic), and
//! in-memory backing stores for both device types.

use ide_hba::{AtaDevice, AtapiDevice, AudioStatus, AudioSub, Controller, ControllerConfig, Device, IrqLine, ImageDisk, IsoBackend, Scheduler, TrackInfo};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

#[derive(Default, Clone)]
pub struct RecordingIrq {
    pub active: Rc<RefCell<Vec<u8>>>,
    pub inactive: Rc<RefCell<Vec<u8>>>,
}

impl IrqLine for RecordingIrq {
    fn activate(&mut self, irq: u8) {
        self.active.borrow_mut().push(irq);
    }
    fn deactivate(&mut self, irq: u8) {
        self.inactive.borrow_mut().push(irq);
    }
}

pub struct NullScheduler;
impl Scheduler for NullScheduler {
    fn schedule(&mut self, _key: ide_hba::EventKey, _delay: Duration) {}
    fn cancel(&mut self, _key: ide_hba::EventKey) {}
}

pub struct MemDisk {
    sectors: HashMap<u32, [u8; 512]>,
    count: u64,
}

impl MemDisk {
    pub fn new(count: u64) -> Self {
        MemDisk { sectors: HashMap::new(), count }
    }
}

impl ImageDisk for MemDisk {
    fn sector_count(&self) -> u64 {
        self.count
    }
    fn read_absolute_sector(&mut self, sector: u32, buf: &mut [u8]) -> std::io::Result<()> {
        let src = self.sectors.get(&sector).copied().unwrap_or([0u8; 512]);
        buf.copy_from_slice(&src);
        Ok(())
    }
    fn write_absolute_sector(&mut self, sector: u32, buf: &[u8]) -> std::io::Result<()> {
        let mut dst = [0u8; 512];
        dst.copy_from_slice(buf);
        self.sectors.insert(sector, dst);
        Ok(())
    }
}

pub struct FakeIso {
    pub tracks: (u8, u8),
    pub sectors: u32,
}

impl IsoBackend for FakeIso {
    fn sector_count(&self) -> u32 {
        self.sectors
    }
    fn read_sectors_host(&mut self, lba: u32, buf: &mut [u8]) -> std::io::Result<()> {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (lba as usize + i).wrapping_rem(256) as u8;
        }
        Ok(())
    }
    fn audio_tracks(&self) -> (u8, u8) {
        self.tracks
    }
    fn audio_track_info(&self, track: u8) -> Option<TrackInfo> {
        Some(TrackInfo { track, attr: 0x41, start_lba: 0 })
    }
    fn audio_sub(&self) -> AudioSub {
        AudioSub::default()
    }
    fn audio_status(&self) -> AudioStatus {
        AudioStatus::NoStatus
    }
    fn play_audio_sector(&mut self, _start_lba: u32, _end_lba: u32) {}
    fn pause_audio(&mut self, _resume: bool) {}
    fn stop_audio(&mut self) {}
}

pub fn new_controller() -> (Controller, RecordingIrq) {
    let irq = RecordingIrq::default();
    let cfg = ControllerConfig { channel: 0, ..ControllerConfig::default() };
    let ctrl = Controller::new(cfg, Box::new(irq.clone()), Box::new(NullScheduler)).unwrap();
    (ctrl, irq)
}

pub fn attach_ata(
    ctrl: &mut Controller,
    slot: usize,
    sectors: u64,
    serial: &str,
    firmware: &str,
    model: &str,
    cyls: u16,
    heads: u8,
    sects: u8,
) {
    let dev = AtaDevice::new(
        Box::new(MemDisk::new(sectors)),
        serial.into(),
        firmware.into(),
        model.into(),
        cyls,
        heads,
        sects,
    );
    ctrl.attach(slot, Device::Ata(dev)).unwrap();
}

pub fn attach_atapi(ctrl: &mut Controller, slot: usize, tracks: (u8, u8), sectors: u32) {
    let dev = AtapiDevice::new(
        Box::new(FakeIso { tracks, sectors }),
        "SER1".into(),
        "FW01".into(),
        "VIRTUAL CDROM".into(),
    );
    ctrl.attach(slot, Device::Atapi(dev)).unwrap();
}

/// Clock in a 12-byte ATAPI PACKET command one word at a time, the way a
/// real driver would once PACKET has matured the device into
/// `AtapiPacketCommand`.
pub fn write_atapi_command(ctrl: &mut Controller, cmd: &[u8; 12]) {
    for &byte in cmd.iter() {
        ctrl.write_base(0, byte as u32, 1);
    }
}
