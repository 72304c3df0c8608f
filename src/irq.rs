//! IRQ line glue (§4.2). The emulated PIC itself is an external collaborator;
//! this crate only ever asserts/deasserts a line number it was configured
//! with.

/// A single emulated PIC input line, owned by the host emulator.
pub trait IrqLine {
    fn activate(&mut self, irq: u8);
    fn deactivate(&mut self, irq: u8);

    /// Raise the line, then immediately drop it (edge trigger). Used by the
    /// BIOS-INT13 shim's self-issued command cycles, which end with a
    /// specific end-of-interrupt rather than leaving the line asserted.
    fn specific_eoi(&mut self, irq: u8) {
        self.deactivate(irq);
    }
}
