//! Hard-disk drive model: CHS geometry derived from the backing file and
//! the IDENTIFY DEVICE image.

use memupc_storage::{DiskBackend, SECTOR_SIZE};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("disk image size {0} is not a multiple of {SECTOR_SIZE} bytes")]
    HddWrongSize(u64),
}

/// Logical geometry presented to the guest: 63 sectors per track, up to
/// 255 heads, up to 1024 cylinders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChsGeometry {
    pub cylinders: u32,
    pub heads: u32,
    pub sectors: u32,
}

impl ChsGeometry {
    /// Derive a geometry covering as much of `total_sectors` as the CHS
    /// limits allow.
    fn from_sector_count(total_sectors: u64) -> Self {
        if total_sectors > 63 * 1024 {
            let heads = (total_sectors / (63 * 1024)).min(255) as u32;
            ChsGeometry { cylinders: 1024, heads, sectors: 63 }
        } else if total_sectors > 63 {
            ChsGeometry {
                cylinders: (total_sectors / 63) as u32,
                heads: 1,
                sectors: 63,
            }
        } else {
            ChsGeometry { cylinders: 1, heads: 1, sectors: total_sectors as u32 }
        }
    }

    pub fn total_sectors(&self) -> u32 {
        self.cylinders * self.heads * self.sectors
    }
}

pub struct AtaDrive {
    disk: Box<dyn DiskBackend>,
    geometry: ChsGeometry,
}

impl AtaDrive {
    pub fn new(disk: Box<dyn DiskBackend>) -> Result<Self, GeometryError> {
        let bytes = disk.capacity_bytes();
        if bytes % SECTOR_SIZE as u64 != 0 {
            return Err(GeometryError::HddWrongSize(bytes));
        }
        let geometry = ChsGeometry::from_sector_count(bytes / SECTOR_SIZE as u64);
        Ok(AtaDrive { disk, geometry })
    }

    pub fn geometry(&self) -> ChsGeometry {
        self.geometry
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.disk.capacity_bytes()
    }

    /// Read one sector into `buf`; `Err(())` stands for any seek or I/O
    /// failure, which the channel reports as an aborted command.
    pub(crate) fn read_sector(&mut self, lba: u64, buf: &mut [u8]) -> Result<(), ()> {
        let offset = lba * SECTOR_SIZE as u64;
        if offset + SECTOR_SIZE as u64 > self.disk.capacity_bytes() {
            return Err(());
        }
        self.disk.read_at(offset, buf).map_err(|_| ())
    }

    pub(crate) fn write_sector(&mut self, lba: u64, buf: &[u8]) -> Result<(), ()> {
        let offset = lba * SECTOR_SIZE as u64;
        if offset + SECTOR_SIZE as u64 > self.disk.capacity_bytes() {
            return Err(());
        }
        self.disk.write_at(offset, buf).map_err(|_| ())
    }
}

/// Pack an ASCII string into IDENTIFY words, two characters per word,
/// first character in the high byte, space padded.
pub(crate) fn put_ata_string(words: &mut [u16], s: &str) {
    let bytes = s.as_bytes();
    for (i, word) in words.iter_mut().enumerate() {
        let hi = *bytes.get(2 * i).unwrap_or(&b' ');
        let lo = *bytes.get(2 * i + 1).unwrap_or(&b' ');
        *word = u16::from(hi) << 8 | u16::from(lo);
    }
}

/// Fill the 512-byte IDENTIFY DEVICE image for a hard disk.
pub(crate) fn fill_identify_device(buf: &mut [u16], geometry: ChsGeometry) {
    buf[..256].fill(0);
    // Word 0: general configuration, not-removable device.
    buf[0] = 0x0040;
    buf[1] = geometry.cylinders as u16;
    buf[3] = geometry.heads as u16;
    buf[6] = geometry.sectors as u16;
    put_ata_string(&mut buf[10..20], "XXXXXXXXXX");
    put_ata_string(&mut buf[23..27], "1.0");
    put_ata_string(&mut buf[27..47], "HDD-ATA memuPC");
    // Word 47: READ/WRITE MULTIPLE support.
    buf[47] = 256;
    // Word 50: capabilities, no standby timer.
    buf[50] = 0x4000;
    // Word 51: PIO mode 0.
    buf[51] = 0x0000;
    // Word 53: words 54-58 valid, DMA and Ultra DMA words valid.
    buf[53] = 0x0007;
    buf[54] = geometry.cylinders as u16;
    buf[55] = geometry.heads as u16;
    buf[56] = geometry.sectors as u16;
    let sectors = geometry.total_sectors();
    buf[57] = sectors as u16;
    buf[58] = (sectors >> 16) as u16;
    buf[60] = sectors as u16;
    buf[61] = (sectors >> 16) as u16;
    // Word 81: ATA/ATAPI-4 T13 1153D revision 17.
    buf[81] = 0x0017;
}

/// Fill the 512-byte IDENTIFY PACKET DEVICE image for a CD-ROM drive.
pub(crate) fn fill_identify_packet_device(buf: &mut [u16]) {
    buf[..256].fill(0);
    // Word 0: ATAPI device, CD-ROM, DRQ within 3 ms, 12-byte packets.
    buf[0] = 0x8580;
    put_ata_string(&mut buf[10..20], "XXXXXXXXXX");
    put_ata_string(&mut buf[23..27], "1.0");
    put_ata_string(&mut buf[27..47], "CD-ROM  memuPC");
    // Word 49: capabilities without DMA interleave, queuing or overlap.
    buf[49] = 0x0F00;
    buf[51] = 0x0000;
    buf[53] = 0x0007;
    buf[81] = 0x0017;
}
