//! The port-decode front end (§4.1, §4.2): one IDE channel's eight base
//! registers plus the two alt-window registers, and the glue that applies
//! an [`Effect`] list a device command returns back onto this controller's
//! `IrqLine`/`Scheduler` handles.

use crate::config::ControllerConfig;
use crate::device::Device;
use crate::effect::{Effect, Effects};
use crate::error::{IdeError, Result};
use crate::irq::IrqLine;
use crate::scheduler::{CallbackKind, EventKey, Scheduler};
use crate::snapshot::{restore_device, snapshot_device, ControllerSnapshot, IoSnapshot};
use crate::taskfile::Status;
use std::time::Duration;

/// One IDE channel: up to two devices (master/slave), the shared
/// drive/head latch, and the host-visible enable/reset/IRQ bookkeeping
/// that lives above either device (§4.2).
pub struct Controller {
    pub interface_index: u8,
    pub irq: u8,
    pub base_io: u16,
    pub alt_io: u16,

    devices: [Option<Device>; 2],
    select: usize,
    /// 0x1F6 shadow, shared by both drives on the channel (§4.1).
    drivehead: u8,
    /// Status byte reported when no device is present at `select`.
    no_device_status: Status,
    interrupt_enable: bool,
    host_reset: bool,
    irq_pending: bool,

    /// §4.8: direct-taskfile-poke and self-issued-port-I/O-replay enables
    /// for the BIOS INT13h fake-I/O shim.
    pub int13_fake_io: bool,
    pub int13_fake_v86_io: bool,

    /// §4.1: whether a 4-byte data-port access passes straight through
    /// (`enable_pio32`) or is split into two 2-byte accesses; `ignore_pio32`
    /// drops it instead, taking precedence over either.
    pub enable_pio32: bool,
    pub ignore_pio32: bool,

    /// ATAPI loading-state-machine timing (§4.6), applied to any ATAPI
    /// device attached to this controller.
    pub spinup_time: Duration,
    pub spindown_timeout: Duration,
    pub cd_insertion_time: Duration,

    irq_line: Box<dyn IrqLine>,
    scheduler: Box<dyn Scheduler>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        irq_line: Box<dyn IrqLine>,
        scheduler: Box<dyn Scheduler>,
    ) -> Result<Self> {
        let int13_fake_io = config.int13_fake_io;
        let int13_fake_v86_io = config.int13_fake_v86_io;
        let enable_pio32 = config.enable_pio32;
        let ignore_pio32 = config.ignore_pio32;
        let spinup_time = config.spinup_time;
        let spindown_timeout = config.spindown_timeout;
        let cd_insertion_time = config.cd_insertion_time;
        let (irq, base_io, alt_io) = config.resolve()?;
        Ok(Controller {
            interface_index: config.channel as u8,
            irq,
            base_io,
            alt_io,
            devices: [None, None],
            select: 0,
            drivehead: 0,
            no_device_status: Status::empty(),
            interrupt_enable: true,
            host_reset: false,
            irq_pending: false,
            int13_fake_io,
            int13_fake_v86_io,
            enable_pio32,
            ignore_pio32,
            spinup_time,
            spindown_timeout,
            cd_insertion_time,
            irq_line,
            scheduler,
        })
    }

    pub fn attach(&mut self, slot: usize, mut device: Device) -> Result<()> {
        if slot > 1 {
            return Err(IdeError::ControllerIndexOutOfRange(slot));
        }
        if self.devices[slot].is_some() {
            return Err(IdeError::SlotOccupied(slot));
        }
        if let Device::Atapi(d) = &mut device {
            d.spinup_time = self.spinup_time;
            d.spindown_timeout = self.spindown_timeout;
            d.insertion_time = self.cd_insertion_time;
        }
        self.devices[slot] = Some(device);
        Ok(())
    }

    pub fn detach(&mut self, slot: usize) -> Option<Device> {
        self.devices.get_mut(slot).and_then(|d| d.take())
    }

    pub fn device(&self, slot: usize) -> Option<&Device> {
        self.devices.get(slot).and_then(|d| d.as_ref())
    }

    pub fn device_mut(&mut self, slot: usize) -> Option<&mut Device> {
        self.devices.get_mut(slot).and_then(|d| d.as_mut())
    }

    pub fn selected_slot(&self) -> usize {
        self.select
    }

    pub fn raise_irq(&mut self) {
        self.irq_pending = true;
        if self.interrupt_enable {
            self.irq_line.activate(self.irq);
        }
    }

    pub fn lower_irq(&mut self) {
        self.irq_pending = false;
        self.irq_line.deactivate(self.irq);
    }

    fn apply(&mut self, fx: Effects) {
        for e in fx {
            match e {
                Effect::RaiseIrq => self.raise_irq(),
                Effect::LowerIrq => self.lower_irq(),
                Effect::Schedule(kind, delay) => self.scheduler.schedule(
                    EventKey { callback: kind, controller_index: self.interface_index },
                    delay,
                ),
                Effect::Cancel(kind) => self.scheduler.cancel(EventKey {
                    callback: kind,
                    controller_index: self.interface_index,
                }),
                Effect::SetDrivehead(v) => self.drivehead = v,
            }
        }
    }

    /// `IDE_DelayedCommand` / `on_atapi_busy_time` / loading-transition
    /// re-entry (§4.7): called by the host when a previously scheduled
    /// event for this controller matures.
    pub fn dispatch_callback(&mut self, kind: CallbackKind) {
        if let Some(dev) = self.devices[self.select].as_mut() {
            let fx = dev.on_callback(kind);
            self.apply(fx);
        }
    }

    /// §4.1 base I/O read, offsets 0..7 relative to `base_io`.
    pub fn read_base(&mut self, offset: u16, iolen: usize) -> u16 {
        let dev = self.devices[self.select].as_mut();

        match offset & 7 {
            0 => {
                if iolen == 4 && self.ignore_pio32 {
                    // 32-bit PIO disallowed outright: the access never
                    // reaches the device (§4.1).
                    0xFFFF
                } else if iolen == 4 && !self.enable_pio32 {
                    // No 32-bit PIO support: split into the two 16-bit
                    // accesses a real split would perform, advancing the
                    // device's cursor by 2 bytes twice.
                    match dev {
                        Some(dev) => {
                            let (lo, fx0) = dev.data_read(2);
                            self.apply(fx0);
                            let (_hi, fx1) = dev.data_read(2);
                            self.apply(fx1);
                            lo
                        }
                        None => 0xFFFF,
                    }
                } else if let Some(dev) = dev {
                    let (w, fx) = dev.data_read(iolen);
                    self.apply(fx);
                    w
                } else {
                    0xFFFF
                }
            }
            1 => dev.map(|d| d.taskfile().feature as u16).unwrap_or(0),
            2 => dev.map(|d| d.taskfile().count as u16).unwrap_or(0),
            3 => dev.map(|d| d.taskfile().lba[0] as u16).unwrap_or(0),
            4 => dev.map(|d| d.taskfile().lba[1] as u16).unwrap_or(0),
            5 => dev.map(|d| d.taskfile().lba[2] as u16).unwrap_or(0),
            6 => self.drivehead as u16,
            7 => {
                let busy = dev.as_ref().map(|d| d.status().contains(Status::BUSY))
                    .unwrap_or(self.no_device_status.contains(Status::BUSY));
                if !busy {
                    self.lower_irq();
                }
                self.devices[self.select]
                    .as_ref()
                    .map(|d| d.status().bits() as u16)
                    .unwrap_or(self.no_device_status.bits() as u16)
            }
            _ => unreachable!(),
        }
    }

    /// §4.1 base I/O write, offsets 0..7 relative to `base_io`.
    pub fn write_base(&mut self, offset: u16, val: u32, iolen: usize) {
        let offset = offset & 7;
        let busy = self.devices[self.select]
            .as_ref()
            .map(|d| d.status().contains(Status::BUSY))
            .unwrap_or(self.no_device_status.contains(Status::BUSY));

        if busy {
            // Pedantic drivers (ATAPICD.SYS) re-assert drive selection on
            // +6 mid-command; allow that one write through regardless.
            let reasserts_select = offset == 6 && ((val >> 4) & 1) as usize == self.select;
            if !reasserts_select {
                tracing::debug!(offset, val, "write dropped: controller busy");
                return;
            }
        }

        if (1..=5).contains(&offset) {
            let allowed = self.devices[self.select].as_ref().map(|d| d.allow_writing()).unwrap_or(true);
            if !allowed {
                tracing::warn!(offset, val, "write while device not ready to accept writing");
            }
        }

        match offset {
            0 => {
                if iolen == 4 && self.ignore_pio32 {
                    // Dropped outright; the device never sees it (§4.1).
                } else if iolen == 4 && !self.enable_pio32 {
                    if let Some(dev) = self.devices[self.select].as_mut() {
                        let fx0 = dev.data_write(val & 0xFFFF, 2);
                        self.apply(fx0);
                        let fx1 = dev.data_write((val >> 16) & 0xFFFF, 2);
                        self.apply(fx1);
                    }
                } else if let Some(dev) = self.devices[self.select].as_mut() {
                    let fx = dev.data_write(val, iolen);
                    self.apply(fx);
                }
            }
            1..=5 => {
                if let Some(dev) = self.devices[self.select].as_mut() {
                    if dev.allow_writing() {
                        let tf = dev.taskfile_mut();
                        match offset {
                            1 => tf.feature = val as u8,
                            2 => tf.count = val as u8,
                            3 => tf.lba[0] = val as u8,
                            4 => tf.lba[1] = val as u8,
                            5 => tf.lba[2] = val as u8,
                            _ => unreachable!(),
                        }
                    }
                }
            }
            6 => {
                let new_select = ((val >> 4) & 1) as usize;
                if new_select != self.select {
                    self.lower_irq();
                    if let Some(dev) = self.devices[self.select].as_mut() {
                        // IDEDevice::deselect is a no-op in the reference
                        // implementation; nothing to call here.
                        let _ = dev;
                    }
                    self.select = new_select;
                    if let Some(dev) = self.devices[self.select].as_mut() {
                        if dev.allow_writing() {
                            dev.taskfile_mut().drivehead = val as u8;
                        }
                    } else {
                        self.no_device_status = Status::empty();
                    }
                } else if let Some(dev) = self.devices[self.select].as_mut() {
                    if dev.allow_writing() {
                        dev.taskfile_mut().drivehead = val as u8;
                    }
                } else {
                    self.no_device_status = Status::empty();
                }
                self.drivehead = val as u8;
            }
            7 => {
                if let Some(dev) = self.devices[self.select].as_mut() {
                    let fx = dev.writecommand(val as u8);
                    self.apply(fx);
                }
            }
            _ => unreachable!(),
        }
    }

    /// §4.2 alt-window read, offset 0 = alt status, offset 1 = Drive
    /// Address Register.
    pub fn read_alt(&self, offset: u16) -> u8 {
        match offset & 1 {
            0 => self.devices[self.select]
                .as_ref()
                .map(|d| d.status().bits())
                .unwrap_or(self.no_device_status.bits()),
            _ => {
                let sel_bits = if self.select == 0 { 0 } else { 1 } | if self.select == 1 { 0 } else { 2 };
                let head_bits = self.devices[self.select]
                    .as_ref()
                    .map(|d| ((d.taskfile().drivehead & 0x0F) ^ 0x0F) << 2)
                    .unwrap_or(0x3C);
                0x80 | sel_bits | head_bits
            }
        }
    }

    /// §4.2 alt-window write: device-control byte (nIEN at bit 1, SRST at
    /// bit 2).
    pub fn write_alt(&mut self, offset: u16, val: u8) {
        if offset & 1 != 0 {
            return;
        }

        self.interrupt_enable = val & 0x02 == 0;
        if self.interrupt_enable {
            if self.irq_pending {
                self.raise_irq();
            }
        } else {
            self.irq_line.deactivate(self.irq);
        }

        let srst = val & 0x04 != 0;
        if srst && !self.host_reset {
            for dev in self.devices.iter_mut().flatten() {
                dev.host_reset_begin();
            }
            self.host_reset = true;
        } else if !srst && self.host_reset {
            for dev in self.devices.iter_mut().flatten() {
                dev.host_reset_complete();
            }
            self.host_reset = false;
        }
    }
}

impl IoSnapshot for Controller {
    fn save_state(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            select: self.select,
            drivehead: self.drivehead,
            interrupt_enable: self.interrupt_enable,
            host_reset: self.host_reset,
            irq_pending: self.irq_pending,
            devices: [
                self.devices[0].as_ref().map(snapshot_device),
                self.devices[1].as_ref().map(snapshot_device),
            ],
        }
    }

    fn load_state(&mut self, snap: &ControllerSnapshot) -> Result<()> {
        if snap.select > 1 {
            return Err(IdeError::SnapshotOutOfRange("select"));
        }
        self.select = snap.select;
        self.drivehead = snap.drivehead;
        self.interrupt_enable = snap.interrupt_enable;
        self.host_reset = snap.host_reset;
        self.irq_pending = snap.irq_pending;
        for (slot, dev_snap) in snap.devices.iter().enumerate() {
            match (self.devices[slot].as_mut(), dev_snap) {
                (Some(dev), Some(s)) => restore_device(dev, s)?,
                (None, None) => {}
                _ => return Err(IdeError::SnapshotMissingField("device presence mismatch")),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingIrq {
        active: Rc<RefCell<Vec<u8>>>,
    }

    impl IrqLine for RecordingIrq {
        fn activate(&mut self, irq: u8) {
            self.active.borrow_mut().push(irq);
        }
        fn deactivate(&mut self, _irq: u8) {}
    }

    struct NullScheduler;
    impl Scheduler for NullScheduler {
        fn schedule(&mut self, _key: EventKey, _delay: Duration) {}
        fn cancel(&mut self, _key: EventKey) {}
    }

    fn new_controller() -> Controller {
        let cfg = ControllerConfig { channel: 0, ..ControllerConfig::default() };
        Controller::new(cfg, Box::new(RecordingIrq::default()), Box::new(NullScheduler)).unwrap()
    }

    #[test]
    fn no_device_at_select_reads_ff_data_and_zero_registers() {
        let mut ctrl = new_controller();
        assert_eq!(ctrl.read_base(0, 2), 0xFFFF);
        assert_eq!(ctrl.read_base(1, 2), 0);
    }

    #[test]
    fn selecting_other_slot_lowers_irq_and_updates_drivehead_latch() {
        let mut ctrl = new_controller();
        ctrl.write_base(6, 0x10, 1);
        assert_eq!(ctrl.drivehead, 0x10);
        assert_eq!(ctrl.select, 1);
    }

    struct NullDisk;
    impl crate::storage::ImageDisk for NullDisk {
        fn sector_count(&self) -> u64 {
            0
        }
        fn read_absolute_sector(&mut self, _sector: u32, _buf: &mut [u8]) -> std::io::Result<()> {
            Ok(())
        }
        fn write_absolute_sector(&mut self, _sector: u32, _buf: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn ata_with_identify_loaded(ctrl: &mut Controller) {
        let dev = crate::device::ata::AtaDevice::new(
            Box::new(NullDisk),
            "S".into(),
            "F".into(),
            "M".into(),
            20,
            16,
            63,
        );
        ctrl.attach(0, Device::Ata(dev)).unwrap();
        ctrl.write_base(7, 0xEC, 1); // IDENTIFY DEVICE, synchronous
    }

    #[test]
    fn four_byte_data_read_splits_into_two_words_when_pio32_disabled() {
        let mut ctrl = new_controller();
        assert!(!ctrl.enable_pio32);
        ata_with_identify_loaded(&mut ctrl);

        let w = ctrl.read_base(0, 4);
        assert_eq!(w, 0x0040); // word 0: ATA signature, the split's first word
        // The split consumed word 0 *and* word 1 (4 bytes, two 2-byte
        // accesses); word 2 is unwritten, so the next read lands there.
        assert_eq!(ctrl.read_base(0, 2), 0);
        assert_eq!(ctrl.read_base(0, 2), 16); // word 3: physical heads
    }

    #[test]
    fn four_byte_data_read_is_dropped_when_ignore_pio32_set() {
        let mut ctrl = new_controller();
        ctrl.ignore_pio32 = true;
        ata_with_identify_loaded(&mut ctrl);

        assert_eq!(ctrl.read_base(0, 4), 0xFFFF);
        let w = ctrl.read_base(0, 2);
        assert_eq!(w, 0x0040); // cursor never moved: still word 0
    }
}
