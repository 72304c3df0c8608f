//! Wraps the external timer/PIC event service consumed by this crate.
//!
//! The host emulator owns the actual event queue; this module only defines
//! the contract (§4.7) and the named delays the command engines schedule
//! against it. One event is ever outstanding per `(CallbackKind,
//! controller_index)` pair — posting a new one for the same key is defined
//! to replace, not queue alongside, the previous one.

use std::time::Duration;

/// Which scheduled re-entry point should fire when an event matures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    /// `IDE_DelayedCommand`: ATA command completion / next-sector ramp, or
    /// ATAPI packet-command decode.
    DelayedCommand,
    /// ATAPI busy-wait completion (`on_atapi_busy_time`): REQUEST SENSE,
    /// READ(10)/(12), and other packet commands that need virtual spin time.
    AtapiBusyTime,
    /// Loading-state-machine transition (insertion → loading → readied, or
    /// readied → idle spindown).
    LoadingTransition,
}

/// A scheduling key: which callback, on which of the up-to-eight
/// controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub callback: CallbackKind,
    pub controller_index: u8,
}

/// External timer/event-queue service. Implemented by the host emulator;
/// this crate never runs its own thread or timer.
///
/// Implementations must guarantee: enqueuing an event for a key that
/// already has one outstanding removes the prior one (coalescing, §5);
/// events for distinct keys retain posting order; callbacks fire on the
/// same thread that drives the rest of the emulator.
pub trait Scheduler {
    /// Schedule `key` to fire after `delay`, replacing any event already
    /// pending for the same key.
    fn schedule(&mut self, key: EventKey, delay: Duration);

    /// Cancel any event pending for `key`, if one exists.
    fn cancel(&mut self, key: EventKey);
}

/// Delay constants named in §4.7. Expressed as functions of `faked_command`
/// because every one of them collapses to ~1 µs during BIOS-shim self-I/O
/// (§4.8, §9) rather than wasting virtual time replaying a full command
/// cycle.
pub mod delay {
    use std::time::Duration;

    const FAKED: Duration = Duration::from_nanos(1_000);

    pub fn reentry(faked_command: bool) -> Duration {
        if faked_command {
            FAKED
        } else {
            Duration::from_micros(10)
        }
    }

    pub fn command_ramp(faked_command: bool) -> Duration {
        if faked_command {
            FAKED
        } else {
            Duration::from_micros(100)
        }
    }

    pub fn atapi_quick(faked_command: bool) -> Duration {
        if faked_command {
            FAKED
        } else {
            Duration::from_millis(1)
        }
    }

    pub fn ata_read(faked_command: bool) -> Duration {
        if faked_command {
            FAKED
        } else {
            Duration::from_millis(3)
        }
    }

    /// Issued by a command that hit while the disc is still `DISC_LOADING`;
    /// it reschedules itself at this cadence until the disc is `READY`.
    pub fn still_loading_retry() -> Duration {
        Duration::from_millis(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faked_command_collapses_every_delay() {
        assert_eq!(delay::reentry(true), Duration::from_nanos(1_000));
        assert_eq!(delay::command_ramp(true), Duration::from_nanos(1_000));
        assert_eq!(delay::atapi_quick(true), Duration::from_nanos(1_000));
        assert_eq!(delay::ata_read(true), Duration::from_nanos(1_000));
    }

    #[test]
    fn normal_delays_match_spec_literals() {
        assert_eq!(delay::reentry(false), Duration::from_micros(10));
        assert_eq!(delay::command_ramp(false), Duration::from_micros(100));
        assert_eq!(delay::atapi_quick(false), Duration::from_millis(1));
        assert_eq!(delay::ata_read(false), Duration::from_millis(3));
    }
}
