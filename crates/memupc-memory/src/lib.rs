//! Physical memory map of the 82439TX (MTXC) north-bridge: guest RAM,
//! the seven programmable-attribute-map regions steering the legacy
//! 0xC0000-0xFFFFF window, the BIOS flash windows, and the fall-through
//! to PCI memory handlers. Also carries the MTXC PCI configuration
//! registers, since they are the only way the PAM is programmed.

mod bios;
mod map;
mod mtxc;
mod pam;
mod ram;

pub use bios::Bios;
pub use map::{CodeCache, MemoryMap, PciMemoryHandler};
pub use pam::Pam;
pub use ram::{Ram, RamSize};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("BIOS image size {0} is not in [128 KiB, 1 MiB] or not a multiple of 64")]
    BadBios(usize),
}
