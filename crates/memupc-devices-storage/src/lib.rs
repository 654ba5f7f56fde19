//! PIIX4 IDE controller: two channels, master/slave each, speaking the
//! ATA command set to hard disks and the ATAPI packet command set to
//! CD-ROM drives. PIO only; the bus-master window is decoded but inert.

pub mod ata;
pub mod atapi;
mod channel;
mod controller;

pub use ata::{AtaDrive, ChsGeometry, GeometryError};
pub use atapi::AtapiDrive;
pub use controller::IdeController;

use bitflags::bitflags;

bitflags! {
    /// ATA status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AtaStatus: u8 {
        const ERR = 0x01;
        const DRQ = 0x08;
        const SRV = 0x10;
        const DF = 0x20;
        const RDY = 0x40;
        const BSY = 0x80;
    }
}

/// Error register: command aborted.
pub(crate) const ERR_ABRT: u8 = 0x04;

/// Legacy port blocks per channel.
#[derive(Debug, Clone, Copy)]
pub struct IdePorts {
    pub cmd_base: u16,
    pub ctrl: u16,
}

pub const PRIMARY_PORTS: IdePorts = IdePorts { cmd_base: 0x1F0, ctrl: 0x3F6 };
pub const SECONDARY_PORTS: IdePorts = IdePorts { cmd_base: 0x170, ctrl: 0x376 };
