//! Side effects a device command-engine call wants applied to the owning
//! controller (IRQ line, scheduler) once it returns.
//!
//! Device methods never hold a reference to their controller (that would
//! require each device to borrow back into the structure that owns it).
//! Instead they return the list of effects they want and `Controller`
//! applies them against its own `IrqLine`/`Scheduler` handles after the call
//! returns, preserving the spec's synchronous-within-a-handler ordering
//! (§5): effects are applied in the order returned, so a handler that wants
//! "abort, then raise IRQ" gets exactly that sequence observed by the guest.

use crate::scheduler::CallbackKind;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    RaiseIrq,
    LowerIrq,
    Schedule(CallbackKind, Duration),
    Cancel(CallbackKind),
    /// Propagate a device-initiated change to the shared 0x1F6 drivehead
    /// latch (DEVICE RESET / RECALIBRATE mask it locally, then the
    /// controller's copy must follow, the way `controller->drivehead =
    /// drivehead` does in the reference source).
    SetDrivehead(u8),
}

pub type Effects = Vec<Effect>;
