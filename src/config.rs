//! Per-controller configuration (§6, §10). Channels 1-4 have built-in
//! legacy defaults; channels 5-8 have none and must be fully specified.

use crate::error::{IdeError, Result};
use std::time::Duration;

/// One of the eight possible IDE channel slots, 0-indexed (channel 1 is
/// index 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub channel: usize,
    pub irq: Option<u8>,
    pub base_io: Option<u16>,
    pub alt_io: Option<u16>,
    /// Enable the direct-taskfile-poke half of the INT13h fake-I/O shim
    /// (§4.8) for real-mode BIOS disk calls.
    pub int13_fake_io: bool,
    /// Enable the full self-issued port-I/O replay half of the shim, used
    /// when the guest OS issues INT 13h from virtual 8086 mode (§4.8).
    pub int13_fake_v86_io: bool,

    /// Allow 32-bit (4-byte) PIO accesses to the data port to pass straight
    /// through to the device. When `false`, a 4-byte access is split into
    /// two 2-byte accesses instead (§4.1).
    pub enable_pio32: bool,
    /// Silently drop 4-byte data-port accesses instead of splitting them.
    /// Takes precedence over `enable_pio32` being `false` (§4.1).
    pub ignore_pio32: bool,

    /// ATAPI spin-up delay: time from the loading state machine leaving
    /// `Idle` until the disc is readable (§4.6).
    pub spinup_time: Duration,
    /// ATAPI auto-spindown delay: time a readied disc stays spun up with
    /// no further command before the drive spins back down (§4.6).
    pub spindown_timeout: Duration,
    /// Delay between the host signalling a CD insertion and the loading
    /// state machine noticing it (§4.6).
    pub cd_insertion_time: Duration,
}

/// `(irq, base_io, alt_io)` for channels 1-4; `None` for 5-8, which ship
/// with no default and must be configured explicitly (§6).
const BUILTIN_DEFAULTS: [Option<(u8, u16, u16)>; 8] = [
    Some((14, 0x1F0, 0x3F6)),
    Some((15, 0x170, 0x376)),
    Some((11, 0x1E8, 0x3EE)),
    Some((10, 0x168, 0x36E)),
    None,
    None,
    None,
    None,
];

impl ControllerConfig {
    /// A config for `channel` (0-indexed) using its built-in legacy default,
    /// if it has one.
    pub fn default_for_channel(channel: usize) -> Result<Self> {
        let preset = BUILTIN_DEFAULTS
            .get(channel)
            .copied()
            .flatten()
            .ok_or(IdeError::NoDefaultForChannel(channel))?;
        Ok(ControllerConfig {
            channel,
            irq: Some(preset.0),
            base_io: Some(preset.1),
            alt_io: Some(preset.2),
            ..ControllerConfig::default()
        })
    }

    /// Resolve `self` against the built-in default for `self.channel`,
    /// filling in any field left `None`. Channels without a default
    /// (5..8) require every field already set.
    pub fn resolve(mut self) -> Result<(u8, u16, u16)> {
        let preset = BUILTIN_DEFAULTS.get(self.channel).copied().flatten();
        if self.irq.is_none() {
            self.irq = preset.map(|p| p.0);
        }
        if self.base_io.is_none() {
            self.base_io = preset.map(|p| p.1);
        }
        if self.alt_io.is_none() {
            self.alt_io = preset.map(|p| p.2);
        }

        let irq = self.irq.ok_or(IdeError::NoDefaultForChannel(self.channel))?;
        let base_io = self.base_io.ok_or(IdeError::NoDefaultForChannel(self.channel))?;
        let alt_io = self.alt_io.ok_or(IdeError::NoDefaultForChannel(self.channel))?;

        if !(1..=15).contains(&irq) {
            return Err(IdeError::InvalidIrq(irq as i32));
        }
        if !(0x100..=0x3FF).contains(&base_io) || base_io % 8 != 0 {
            return Err(IdeError::InvalidBaseIo(base_io));
        }
        if !(0x100..=0x3FF).contains(&alt_io) || alt_io % 2 != 0 {
            return Err(IdeError::InvalidAltIo(alt_io));
        }

        Ok((irq, base_io, alt_io))
    }
}

impl Default for ControllerConfig {
    /// Channel 0 (legacy primary) with neither fake-I/O shim enabled and
    /// the reference source's ATAPI timing constants (`ide.cpp`'s
    /// `spindown_timeout` = 10s, `cd_insertion_time` = 4s).
    fn default() -> Self {
        ControllerConfig {
            channel: 0,
            irq: None,
            base_io: None,
            alt_io: None,
            int13_fake_io: false,
            int13_fake_v86_io: false,
            enable_pio32: false,
            ignore_pio32: false,
            spinup_time: Duration::from_secs(1),
            spindown_timeout: Duration::from_secs(10),
            cd_insertion_time: Duration::from_secs(4),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_one_resolves_to_legacy_primary() {
        let cfg = ControllerConfig { channel: 0, ..ControllerConfig::default() };
        assert_eq!(cfg.resolve().unwrap(), (14, 0x1F0, 0x3F6));
    }

    #[test]
    fn channel_five_without_config_is_rejected() {
        let cfg = ControllerConfig { channel: 4, ..ControllerConfig::default() };
        assert!(matches!(cfg.resolve(), Err(IdeError::NoDefaultForChannel(4))));
    }

    #[test]
    fn channel_five_with_explicit_config_resolves() {
        let cfg = ControllerConfig {
            channel: 4,
            irq: Some(9),
            base_io: Some(0x1A0),
            alt_io: Some(0x3A0),
            ..ControllerConfig::default()
        };
        assert_eq!(cfg.resolve().unwrap(), (9, 0x1A0, 0x3A0));
    }
}
