use thiserror::Error;

/// Host-facing failures. Guest-visible protocol errors (bad CHS, unknown
/// command, ...) never surface here — they are taskfile outcomes, not
/// `Result::Err`s. See the crate-level docs for the split.
#[derive(Debug, Error)]
pub enum IdeError {
    #[error("IRQ line {0} out of range 1..=15")]
    InvalidIrq(i32),

    #[error("base I/O port {0:#x} must be in 0x100..=0x3FF and 8-aligned")]
    InvalidBaseIo(u16),

    #[error("alt I/O port {0:#x} must be in 0x100..=0x3FF and 2-aligned")]
    InvalidAltIo(u16),

    #[error("controller {0} has no built-in port default; base_io/alt_io/irq must be configured")]
    NoDefaultForChannel(usize),

    #[error("device slot {0} on this controller is already occupied")]
    SlotOccupied(usize),

    #[error("controller index {0} out of range 0..8")]
    ControllerIndexOutOfRange(usize),

    #[error("backing store I/O failure: {0}")]
    Storage(#[from] std::io::Error),

    #[error("snapshot is missing required field: {0}")]
    SnapshotMissingField(&'static str),

    #[error("snapshot field {0} out of range")]
    SnapshotOutOfRange(&'static str),
}

pub type Result<T> = std::result::Result<T, IdeError>;
