/// Reset requests raised by guest software (reset control port, PCI hard
/// reset). The platform performs its own side of the reset synchronously
/// and queues one of these so the front-end can reset the external CPU
/// core as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetEvent {
    /// Full system reset: CPU reloads its reset vector, chipset state is
    /// back to power-on defaults.
    System,
}
