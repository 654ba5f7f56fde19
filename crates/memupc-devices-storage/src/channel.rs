//! One IDE channel: the shared register file, the master/slave drive
//! pair, the PIO transfer engine and the ATA/ATAPI command state
//! machines.

use memupc_platform::IrqSink;
use memupc_storage::cd::{Msf, CD_SECTOR_SIZE};
use memupc_storage::SECTOR_SIZE;
use tracing::warn;

use crate::ata::{fill_identify_device, fill_identify_packet_device, AtaDrive, ChsGeometry};
use crate::atapi::{
    AtapiDrive, AudioStatus, ADD_SENSE_AUDIO_PLAY_OPERATION_ABORTED,
    ADD_SENSE_CAN_NOT_READ_INCOMPATIBLE_FORMAT, ADD_SENSE_CAN_NOT_READ_UNK_FORMAT,
    ADD_SENSE_ILLEGAL_MODE_FOR_THIS_TRACK, ADD_SENSE_INVALID_FIELD_IN_CDB,
    ADD_SENSE_MEDIUM_NOT_PRESENT, ADD_SENSE_NO_SEEK_COMPLETE,
    ADD_SENSE_OVERLAPPED_COMMANDS, ADD_SENSE_PARAMETER_LIST_LENGTH_ERROR,
    ADD_SENSE_PARAMETER_VALUE_INVALID, SENSE_KEY_ABORTED_COMMAND, SENSE_KEY_ILLEGAL_REQUEST,
    SENSE_KEY_MEDIUM_ERROR, SENSE_KEY_NOT_READY,
};
use crate::{AtaStatus, ERR_ABRT};

/// PIO scratch: 64 KiB of 16-bit words.
pub(crate) const PIO_BUF_WORDS: usize = 0x10000 / 2;

const PACKET_CMD_BYTES: usize = 12;

/// Frames between the start of the disc and LBA 0 (the lead-in).
const LEAD_IN_FRAMES: u32 = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferOp {
    Normal,
    ReadSectors,
    WriteSectors,
    WriteSelectCd,
    Packet,
    ReadCd,
    ReadCdBlocks,
}

pub(crate) struct PioTransfer {
    pub waiting: bool,
    /// DRQ level once the pacing delay expires.
    pub drq_after_wait: bool,
    pub remain_cc: i64,
    pub buf: Box<[u16; PIO_BUF_WORDS]>,
    pub begin: usize,
    pub end: usize,
    pub op: TransferOp,
    // READ/WRITE SECTORS cursors.
    pub current_sec: u32,
    pub end_sec: u32,
    /// Byte-count limit of the current packet transfer, from LBA-mid/hi.
    pub packet_byte_count: usize,
    // READ (10) cursors.
    pub blocks_remaining: u16,
    pub block_byte_count: usize,
}

impl PioTransfer {
    fn new() -> Self {
        PioTransfer {
            waiting: false,
            drq_after_wait: false,
            remain_cc: 0,
            buf: vec![0u16; PIO_BUF_WORDS].into_boxed_slice().try_into().unwrap(),
            begin: 0,
            end: 0,
            op: TransferOp::Normal,
            current_sec: 0,
            end_sec: 0,
            packet_byte_count: 0,
            blocks_remaining: 0,
            block_byte_count: 0,
        }
    }

    fn cancel(&mut self) {
        self.waiting = false;
        self.drq_after_wait = false;
        self.remain_cc = 0;
        self.begin = 0;
        self.end = 0;
        self.op = TransferOp::Normal;
    }

    /// Stage a byte payload, little-endian packed, odd tail zero padded.
    pub(crate) fn load_bytes(&mut self, bytes: &[u8]) {
        for (i, chunk) in bytes.chunks(2).enumerate() {
            let lo = chunk[0];
            let hi = chunk.get(1).copied().unwrap_or(0);
            self.buf[i] = u16::from_le_bytes([lo, hi]);
        }
        self.begin = 0;
        self.end = bytes.len().div_ceil(2);
    }

    /// First `n` staged bytes, little-endian unpacked.
    fn staged_bytes(&self, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n);
        for i in 0..n.div_ceil(2) {
            let [lo, hi] = self.buf[i].to_le_bytes();
            out.push(lo);
            if out.len() < n {
                out.push(hi);
            }
        }
        out
    }

    fn packet_cmd(&self) -> [u8; PACKET_CMD_BYTES] {
        let mut pkt = [0u8; PACKET_CMD_BYTES];
        for i in 0..PACKET_CMD_BYTES / 2 {
            pkt[2 * i..2 * i + 2].copy_from_slice(&self.buf[i].to_le_bytes());
        }
        pkt
    }
}

pub(crate) enum Media {
    None,
    Hdd(AtaDrive),
    Cdrom(AtapiDrive),
}

impl Media {
    pub(crate) fn is_none(&self) -> bool {
        matches!(self, Media::None)
    }

    pub(crate) fn is_cdrom(&self) -> bool {
        matches!(self, Media::Cdrom(_))
    }
}

pub(crate) struct Drive {
    pub media: Media,
    pub status: AtaStatus,
    pub intrq: bool,
    pub pio: PioTransfer,
}

impl Drive {
    fn empty() -> Self {
        Drive {
            media: Media::None,
            status: AtaStatus::empty(),
            intrq: false,
            pio: PioTransfer::new(),
        }
    }

    fn power_on(&mut self) {
        self.status = if self.media.is_cdrom() {
            AtaStatus::empty()
        } else {
            AtaStatus::RDY
        };
        self.intrq = false;
        self.pio.cancel();
        self.pio.current_sec = 0;
        self.pio.end_sec = 0;
    }

    fn cdrom(&mut self) -> &mut AtapiDrive {
        match &mut self.media {
            Media::Cdrom(cd) => cd,
            _ => unreachable!("packet command on a non-packet drive"),
        }
    }
}

/// Drive address registers: LBA-lo/mid/hi plus the low nibble of the
/// drive/head register; `use_lba` selects LBA over CHS interpretation.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct HddAddr {
    pub lba_lo: u8,
    pub lba_mid: u8,
    pub lba_hi: u8,
    pub lba_extra: u8,
    pub use_lba: bool,
}

impl HddAddr {
    /// Sector offset addressed by the registers.
    fn sector_offset(&self, geom: ChsGeometry) -> u32 {
        if self.use_lba {
            u32::from(self.lba_lo)
                | u32::from(self.lba_mid) << 8
                | u32::from(self.lba_hi) << 16
                | u32::from(self.lba_extra & 0x0F) << 24
        } else {
            let cylinder = u32::from(self.lba_mid) | u32::from(self.lba_hi) << 8;
            let head = u32::from(self.lba_extra & 0x0F);
            let sector = u32::from(self.lba_lo);
            (cylinder * geom.heads + head) * geom.sectors + sector.saturating_sub(1)
        }
    }

    /// Rewrite the registers to point at `offset`, as done after an
    /// error so the guest can see the failing sector.
    fn set_sector_offset(&mut self, geom: ChsGeometry, offset: u32) {
        if self.use_lba {
            self.lba_lo = offset as u8;
            self.lba_mid = (offset >> 8) as u8;
            self.lba_hi = (offset >> 16) as u8;
            self.lba_extra = (self.lba_extra & 0xF0) | ((offset >> 24) & 0x0F) as u8;
        } else {
            let track = offset / geom.sectors;
            self.lba_lo = (offset % geom.sectors + 1) as u8;
            self.lba_extra = (self.lba_extra & 0xF0) | (track % geom.heads) as u8;
            let cylinder = track / geom.heads;
            self.lba_mid = cylinder as u8;
            self.lba_hi = (cylinder >> 8) as u8;
        }
    }
}

pub(crate) struct Channel {
    pub irq_line: u8,
    pub selected: usize,
    pub addr: HddAddr,
    pub features: u8,
    pub sector_count: u8,
    pub error: u8,
    pub nien: bool,
    pub srst: bool,
    pub drives: [Drive; 2],
}

impl Channel {
    pub fn new(irq_line: u8) -> Self {
        Channel {
            irq_line,
            selected: 0,
            addr: HddAddr::default(),
            features: 0,
            sector_count: 0,
            error: 0,
            nien: false,
            srst: false,
            drives: [Drive::empty(), Drive::empty()],
        }
    }

    pub fn attach(&mut self, slot: usize, media: Media) {
        self.drives[slot].media = media;
        self.drives[slot].power_on();
        if !self.drives[slot].media.is_none() {
            self.set_signature(slot);
        }
    }

    /// Power-on / hard-reset state for the whole channel.
    pub fn reset(&mut self) {
        self.selected = 0;
        self.addr = HddAddr::default();
        self.features = 0;
        self.sector_count = 0;
        self.error = 0;
        self.nien = false;
        self.srst = false;
        for slot in 0..2 {
            if self.drives[slot].media.is_none() {
                continue;
            }
            self.drives[slot].power_on();
            if let Media::Cdrom(cd) = &mut self.drives[slot].media {
                cd.reset();
            }
            self.set_signature(slot);
        }
    }

    pub fn has_any_drive(&self) -> bool {
        !self.drives[0].media.is_none() || !self.drives[1].media.is_none()
    }

    pub fn irq_level(&self) -> bool {
        if self.nien {
            return false;
        }
        let drive = &self.drives[self.selected];
        !drive.media.is_none() && drive.intrq
    }

    pub fn update_irq(&self, irq: &mut dyn IrqSink) {
        irq.set_irq(self.irq_line, self.irq_level());
    }

    fn set_signature(&mut self, slot: usize) {
        self.sector_count = 0x01;
        self.addr.lba_lo = 0x01;
        self.addr.use_lba = false;
        if self.drives[slot].media.is_cdrom() {
            self.addr.lba_mid = 0x14;
            self.addr.lba_hi = 0xEB;
            self.addr.lba_extra = if slot == 0 { 0x00 } else { 0x10 };
        } else {
            self.addr.lba_mid = 0x00;
            self.addr.lba_hi = 0x00;
            self.addr.lba_extra = 0x00;
        }
    }

    fn selected_geometry(&self) -> ChsGeometry {
        match &self.drives[self.selected].media {
            Media::Hdd(hdd) => hdd.geometry(),
            _ => unreachable!("sector command on a non-disk drive"),
        }
    }

    // Register file.

    pub fn error_read(&self) -> u8 {
        if self.drives[self.selected].media.is_none() {
            warn!(channel = self.irq_line, "error register read with no drive attached");
        }
        self.error
    }

    pub fn sector_count_read(&self) -> u8 {
        if self.has_any_drive() {
            self.sector_count
        } else {
            0xFF
        }
    }

    pub fn features_write(&mut self, data: u8) {
        if self.has_any_drive() {
            self.features = data;
        }
    }

    pub fn sector_count_write(&mut self, data: u8) {
        if self.has_any_drive() {
            self.sector_count = data;
        }
    }

    pub fn drive_head_write(&mut self, irq: &mut dyn IrqSink, data: u8) {
        let s = self.selected;
        if !self.drives[s].media.is_none() {
            self.drives[s].intrq = false;
        }
        self.selected = usize::from(data & 0x10 != 0);
        self.addr.use_lba = data & 0x40 != 0;
        self.addr.lba_extra = data;
        self.update_irq(irq);
    }

    pub fn drive_head_read(&self) -> u8 {
        0xA0 | (self.addr.lba_extra & 0x0F)
            | if self.selected == 0 { 0x00 } else { 0x10 }
            | if self.addr.use_lba { 0x40 } else { 0x00 }
    }

    /// Status read: clears the pending interrupt. A missing drive reads
    /// all-zero so the BIOS concludes nothing is attached.
    pub fn status_read(&mut self, irq: &mut dyn IrqSink) -> u8 {
        let s = self.selected;
        if self.drives[s].media.is_none() {
            return 0x00;
        }
        self.drives[s].intrq = false;
        let bits = self.drives[s].status.bits();
        self.update_irq(irq);
        bits
    }

    /// Alternate status: same bits, but never acknowledges the IRQ.
    pub fn alt_status_read(&self) -> u8 {
        let drive = &self.drives[self.selected];
        if drive.media.is_none() {
            0x00
        } else {
            drive.status.bits()
        }
    }

    pub fn control_write(&mut self, irq: &mut dyn IrqSink, data: u8) {
        if !self.has_any_drive() {
            return;
        }
        self.nien = data & 0x02 != 0;
        let new_srst = data & 0x04 != 0;
        if self.srst && !new_srst {
            self.soft_reset();
        }
        self.srst = new_srst;
        self.update_irq(irq);
    }

    /// SRST falling edge: cancel everything in flight and put both
    /// drives back to their idle state with the signature asserted.
    fn soft_reset(&mut self) {
        for slot in 0..2 {
            if self.drives[slot].media.is_none() {
                continue;
            }
            let is_cdrom = self.drives[slot].media.is_cdrom();
            let drive = &mut self.drives[slot];
            drive.status = if is_cdrom { AtaStatus::empty() } else { AtaStatus::RDY };
            drive.intrq = false;
            drive.pio.cancel();
        }
        let s = self.selected;
        if !self.drives[s].media.is_none() {
            self.set_signature(s);
        }
    }

    // Data port.

    pub fn data_read(&mut self, irq: &mut dyn IrqSink, cc_per_sector: i64) -> u16 {
        let s = self.selected;
        if self.drives[s].media.is_none() {
            warn!(channel = self.irq_line, "data read with no drive attached");
            return 0xFFFF;
        }
        if self.drives[s].pio.waiting || self.drives[s].pio.begin >= self.drives[s].pio.end {
            warn!(channel = self.irq_line, "data read with no data staged");
            return 0xFFFF;
        }
        let (word, drained, op) = {
            let drive = &mut self.drives[s];
            let word = drive.pio.buf[drive.pio.begin];
            drive.pio.begin += 1;
            let drained = drive.pio.begin == drive.pio.end;
            if drained {
                drive.status.remove(AtaStatus::DRQ);
            }
            (word, drained, drive.pio.op)
        };
        if drained {
            match op {
                TransferOp::ReadSectors => self.read_sectors_iter(irq, cc_per_sector),
                TransferOp::ReadCd => self.cd_transfer_finish(irq),
                TransferOp::ReadCdBlocks => self.read_cdlb_iter(irq, cc_per_sector),
                _ => {}
            }
        }
        word
    }

    pub fn data_write(&mut self, irq: &mut dyn IrqSink, cc_per_sector: i64, data: u16) {
        let s = self.selected;
        if self.drives[s].media.is_none() {
            warn!(channel = self.irq_line, "data write with no drive attached");
            return;
        }
        if self.drives[s].pio.waiting || self.drives[s].pio.begin == self.drives[s].pio.end {
            warn!(channel = self.irq_line, "data write with no buffer space");
            return;
        }
        let (filled, op) = {
            let drive = &mut self.drives[s];
            drive.pio.buf[drive.pio.begin] = data;
            drive.pio.begin += 1;
            let filled = drive.pio.begin == drive.pio.end;
            if filled {
                drive.status.remove(AtaStatus::DRQ);
            }
            (filled, drive.pio.op)
        };
        if filled {
            match op {
                TransferOp::WriteSectors => self.write_sectors_iter(irq, cc_per_sector),
                TransferOp::WriteSelectCd => self.cdrom_write_select_data(irq),
                TransferOp::Packet => self.run_packet_command(irq, cc_per_sector),
                _ => {}
            }
        }
    }

    // Command dispatch.

    pub fn command(&mut self, irq: &mut dyn IrqSink, cc_per_sector: i64, op: u8) {
        let s = self.selected;
        self.drives[s].intrq = false;
        self.drives[s].status.remove(AtaStatus::ERR);
        self.error = 0;
        match op {
            // NOP always aborts (queue subcommands are unsupported).
            0x00 => self.command_abort(),
            // DEVICE RESET, packet devices only.
            0x08 => {
                if self.drives[s].media.is_cdrom() {
                    self.device_reset(irq);
                } else {
                    self.command_abort();
                }
            }
            // READ SECTORS (with/without retry).
            0x20 | 0x21 => {
                if matches!(self.drives[s].media, Media::Hdd(_)) {
                    self.read_sectors(irq, cc_per_sector);
                } else {
                    warn!(op, "READ SECTORS on a non-disk drive");
                    self.command_abort();
                }
            }
            // WRITE SECTORS (with/without retry).
            0x30 | 0x31 => {
                if matches!(self.drives[s].media, Media::Hdd(_)) {
                    self.write_sectors();
                } else {
                    warn!(op, "WRITE SECTORS on a non-disk drive");
                    self.command_abort();
                }
            }
            // PACKET.
            0xA0 => {
                if self.drives[s].media.is_cdrom() {
                    self.packet(irq);
                } else {
                    self.command_abort();
                }
            }
            // IDENTIFY PACKET DEVICE.
            0xA1 => {
                if self.drives[s].media.is_cdrom() {
                    let drive = &mut self.drives[s];
                    drive.status = AtaStatus::BSY | AtaStatus::RDY;
                    fill_identify_packet_device(&mut drive.pio.buf[..]);
                    Self::start_sector_transfer(drive, cc_per_sector);
                } else {
                    self.command_abort();
                }
            }
            // IDENTIFY DEVICE.
            0xEC => match &self.drives[s].media {
                Media::None => self.command_abort(),
                Media::Hdd(_) => {
                    let geom = self.selected_geometry();
                    let drive = &mut self.drives[s];
                    drive.status = AtaStatus::BSY | AtaStatus::RDY;
                    fill_identify_device(&mut drive.pio.buf[..], geom);
                    Self::start_sector_transfer(drive, cc_per_sector);
                }
                Media::Cdrom(_) => {
                    self.set_signature(s);
                    self.command_abort();
                }
            },
            _ => {
                warn!(op, "unknown ATA command");
                self.command_abort();
            }
        }
        self.update_irq(irq);
    }

    fn command_abort(&mut self) {
        let s = self.selected;
        self.error |= ERR_ABRT;
        let drive = &mut self.drives[s];
        drive.status.insert(AtaStatus::ERR);
        drive.status.set(AtaStatus::RDY, !drive.media.is_cdrom());
    }

    /// Pace one 512-byte buffer: BSY stays up for the preparation delay,
    /// then DRQ rises and the IRQ fires.
    fn start_sector_transfer(drive: &mut Drive, cc_per_sector: i64) {
        drive.pio.waiting = true;
        drive.pio.drq_after_wait = true;
        drive.pio.remain_cc = cc_per_sector;
        drive.pio.begin = 0;
        drive.pio.end = SECTOR_SIZE / 2;
        drive.pio.op = TransferOp::Normal;
    }

    // READ/WRITE SECTORS. Each sector behaves like its own paced
    // command; the next one starts only when the buffer is drained or
    // refilled.

    fn read_sectors(&mut self, irq: &mut dyn IrqSink, cc_per_sector: i64) {
        let s = self.selected;
        let drive = &mut self.drives[s];
        drive.pio.op = TransferOp::ReadSectors;
        drive.pio.current_sec = 0;
        drive.pio.end_sec = match self.sector_count {
            0 => 256,
            n => u32::from(n),
        };
        self.read_sectors_iter(irq, cc_per_sector);
    }

    fn read_sectors_iter(&mut self, irq: &mut dyn IrqSink, cc_per_sector: i64) {
        let s = self.selected;
        if self.drives[s].pio.current_sec == self.drives[s].pio.end_sec {
            self.drives[s].pio.op = TransferOp::Normal;
            return;
        }
        let geom = self.selected_geometry();
        self.drives[s].status = AtaStatus::BSY | AtaStatus::RDY | AtaStatus::DRQ;

        let sector = u64::from(self.addr.sector_offset(geom))
            + u64::from(self.drives[s].pio.current_sec);
        let mut bytes = [0u8; SECTOR_SIZE];
        let ok = match &mut self.drives[s].media {
            Media::Hdd(hdd) => hdd.read_sector(sector, &mut bytes).is_ok(),
            _ => false,
        };
        if !ok {
            self.sector_io_failed(irq, geom, sector);
            return;
        }
        let drive = &mut self.drives[s];
        drive.pio.load_bytes(&bytes);
        drive.pio.current_sec += 1;
        drive.pio.waiting = true;
        drive.pio.drq_after_wait = true;
        drive.pio.remain_cc = cc_per_sector;
    }

    fn write_sectors(&mut self) {
        let s = self.selected;
        let end_sec = match self.sector_count {
            0 => 256,
            n => u32::from(n),
        };
        let drive = &mut self.drives[s];
        drive.pio.op = TransferOp::WriteSectors;
        drive.pio.current_sec = 0;
        drive.pio.end_sec = end_sec;
        drive.pio.begin = 0;
        drive.pio.end = SECTOR_SIZE / 2;
        // Ready to accept data; BSY rises once a full sector arrives.
        drive.status = AtaStatus::RDY | AtaStatus::DRQ;
    }

    fn write_sectors_iter(&mut self, irq: &mut dyn IrqSink, cc_per_sector: i64) {
        let s = self.selected;
        let geom = self.selected_geometry();
        self.drives[s].status = AtaStatus::BSY | AtaStatus::RDY;

        let sector = u64::from(self.addr.sector_offset(geom))
            + u64::from(self.drives[s].pio.current_sec);
        let bytes = self.drives[s].pio.staged_bytes(SECTOR_SIZE);
        let ok = match &mut self.drives[s].media {
            Media::Hdd(hdd) => hdd.write_sector(sector, &bytes).is_ok(),
            _ => false,
        };
        if !ok {
            self.sector_io_failed(irq, geom, sector);
            return;
        }
        let drive = &mut self.drives[s];
        drive.pio.current_sec += 1;
        if drive.pio.current_sec == drive.pio.end_sec {
            drive.pio.op = TransferOp::Normal;
            drive.pio.drq_after_wait = false;
        } else {
            drive.pio.begin = 0;
            drive.pio.end = SECTOR_SIZE / 2;
            drive.pio.drq_after_wait = true;
        }
        drive.pio.waiting = true;
        drive.pio.remain_cc = cc_per_sector;
    }

    /// Seek past the end of the image or a backing-file failure: abort
    /// with the failing sector left in the address registers.
    fn sector_io_failed(&mut self, irq: &mut dyn IrqSink, geom: ChsGeometry, sector: u64) {
        let s = self.selected;
        self.error = ERR_ABRT;
        self.addr.set_sector_offset(geom, sector as u32);
        self.drives[s].status = AtaStatus::ERR;
        self.drives[s].intrq = true;
        self.update_irq(irq);
    }

    // ATAPI.

    fn packet(&mut self, irq: &mut dyn IrqSink) {
        let s = self.selected;
        if self.features & 0x02 != 0 {
            warn!("PACKET requested overlapped operation, which the device does not support");
        }
        if self.features & 0x01 != 0 {
            // DMA packets are out of scope; fail softly so the guest
            // retries in PIO.
            warn!("PACKET requested DMA, which the device does not support");
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_INVALID_FIELD_IN_CDB);
            return;
        }
        if self.sector_count >> 3 != 0 {
            warn!(tag = self.sector_count >> 3, "PACKET with a queue tag on an untagged device");
        }

        let byte_count = usize::from(self.addr.lba_mid) | usize::from(self.addr.lba_hi) << 8;
        {
            let drive = &mut self.drives[s];
            drive.pio.op = TransferOp::Packet;
            drive.pio.packet_byte_count = byte_count;
            drive.pio.begin = 0;
            drive.pio.end = PACKET_CMD_BYTES / 2;
            drive.status = AtaStatus::DRQ;
        }
        // Awaiting the command packet: C/D=1, I/O=0.
        self.sector_count = (self.sector_count & 0xF8) | 0x01;
    }

    fn device_reset(&mut self, irq: &mut dyn IrqSink) {
        let s = self.selected;
        // Diagnostic result: device 0 passed.
        self.error = 0x01;
        self.set_signature(s);
        let drive = &mut self.drives[s];
        drive.cdrom().busy = false;
        drive.pio.op = TransferOp::Normal;
        drive.pio.waiting = false;
        // An executing audio play survives DEVICE RESET.
        drive.intrq = false;
        drive.status = AtaStatus::empty();
        self.update_irq(irq);
    }

    fn run_packet_command(&mut self, irq: &mut dyn IrqSink, cc_per_sector: i64) {
        let s = self.selected;
        let pkt = self.drives[s].pio.packet_cmd();
        self.drives[s].status = AtaStatus::BSY;
        match pkt[0] {
            0x00 => self.cd_test_unit_ready(irq),
            0x03 => self.cd_request_sense(irq, cc_per_sector, &pkt),
            0x12 => self.cd_inquiry(irq, cc_per_sector, &pkt),
            0x15 => self.cd_mode_select(irq, &pkt, false),
            0x1A => self.cd_mode_sense(irq, cc_per_sector, &pkt, false),
            0x1B => self.cd_start_stop_unit(irq),
            0x1E => self.cd_prevent_allow_medium_removal(irq, &pkt),
            0x25 => self.cd_read_capacity(irq, cc_per_sector, &pkt),
            0x28 => self.cd_read10(irq, cc_per_sector, &pkt),
            0x2B => self.cd_seek10(irq, &pkt),
            0x42 => self.cd_read_sub_channel(irq, cc_per_sector, &pkt),
            0x43 => self.cd_read_toc(irq, cc_per_sector, &pkt),
            0x47 => self.cd_play_audio_msf(irq, &pkt),
            0x4B => self.cd_pause_resume(irq, &pkt),
            0x4E => self.cd_stop_play(irq),
            0x55 => self.cd_mode_select(irq, &pkt, true),
            0x5A => self.cd_mode_sense(irq, cc_per_sector, &pkt, true),
            op => {
                warn!(op, "unsupported packet command");
                self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_INVALID_FIELD_IN_CDB);
            }
        }
    }

    /// Fail the packet command in flight: sense recorded, CHK and the
    /// sense key in the error register, status phase interrupt.
    fn cdrom_abort(&mut self, irq: &mut dyn IrqSink, slot: usize, sense_key: u8, add_sense: u16) {
        {
            let drive = &mut self.drives[slot];
            let cd = drive.cdrom();
            cd.set_sense(sense_key, add_sense);
            cd.busy = false;
        }
        self.error = (sense_key << 4) | ERR_ABRT;
        self.sector_count = (self.sector_count & 0xF8) | 0x03;
        let drive = &mut self.drives[slot];
        drive.status = AtaStatus::SRV | AtaStatus::ERR;
        drive.pio.op = TransferOp::Normal;
        drive.intrq = true;
        self.update_irq(irq);
    }

    /// Status phase for a successful packet command: I/O=1, C/D=1,
    /// SRV up, interrupt raised.
    fn cd_success(&mut self, irq: &mut dyn IrqSink, cdrom_busy: bool) {
        let s = self.selected;
        self.sector_count = (self.sector_count & 0xF8) | 0x03;
        let drive = &mut self.drives[s];
        let keep_df = drive.status & AtaStatus::DF;
        drive.status = AtaStatus::SRV | keep_df;
        drive.cdrom().busy = cdrom_busy;
        drive.intrq = true;
        self.update_irq(irq);
    }

    /// Media and overlap gate shared by most packet commands.
    fn cdrom_check_ready(&mut self, irq: &mut dyn IrqSink, check_media: bool) -> bool {
        let s = self.selected;
        let (present, busy) = {
            let cd = self.drives[s].cdrom();
            (cd.cd.media_present(), cd.busy)
        };
        if !present && check_media {
            self.cdrom_abort(irq, s, SENSE_KEY_NOT_READY, ADD_SENSE_MEDIUM_NOT_PRESENT);
            return false;
        }
        if busy {
            warn!(channel = self.irq_line, "packet command issued while the drive is busy");
            self.cdrom_abort(irq, s, SENSE_KEY_NOT_READY, ADD_SENSE_OVERLAPPED_COMMANDS);
            return false;
        }
        true
    }

    /// Common data-in tail: stage `bytes`, schedule the pacing delay and
    /// flag the transfer-to-host phase.
    fn cd_start_data_in(&mut self, cc_per_sector: i64, bytes: &[u8]) {
        let s = self.selected;
        let drive = &mut self.drives[s];
        drive.pio.op = TransferOp::ReadCd;
        drive.pio.load_bytes(bytes);
        drive.pio.waiting = true;
        drive.pio.drq_after_wait = true;
        drive.pio.remain_cc =
            ((drive.pio.packet_byte_count as i64 * cc_per_sector) / SECTOR_SIZE as i64).max(1);
        drive.status.remove(AtaStatus::BSY | AtaStatus::DF | AtaStatus::SRV | AtaStatus::ERR);
        drive.status.insert(AtaStatus::DRQ);
        drive.cdrom().busy = true;
        self.sector_count = (self.sector_count & 0xF8) | 0x02;
    }

    fn cd_test_unit_ready(&mut self, irq: &mut dyn IrqSink) {
        let s = self.selected;
        let (present, busy) = {
            let cd = self.drives[s].cdrom();
            (cd.cd.media_present(), cd.busy)
        };
        if !present || busy {
            let add_sense = if busy {
                ADD_SENSE_OVERLAPPED_COMMANDS
            } else {
                ADD_SENSE_MEDIUM_NOT_PRESENT
            };
            self.drives[s].cdrom().set_sense(SENSE_KEY_NOT_READY, add_sense);
            self.error = SENSE_KEY_NOT_READY << 4;
            self.sector_count = (self.sector_count & 0xF8) | 0x03;
            let drive = &mut self.drives[s];
            drive.status = AtaStatus::ERR;
            drive.intrq = true;
            self.update_irq(irq);
        } else {
            self.cd_success(irq, false);
        }
    }

    fn cd_request_sense(&mut self, irq: &mut dyn IrqSink, cc_per_sector: i64, pkt: &[u8; 12]) {
        let s = self.selected;
        if !self.cdrom_check_ready(irq, false) {
            return;
        }
        let byte_count = self.drives[s].pio.packet_byte_count;
        if byte_count == 0 {
            warn!("REQUEST SENSE with a zero byte-count limit");
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_PARAMETER_VALUE_INVALID);
            return;
        }
        let length = usize::from(pkt[4]).min(18);
        if byte_count != length {
            warn!(byte_count, length, "REQUEST SENSE allocation mismatch");
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_PARAMETER_VALUE_INVALID);
            return;
        }
        let sense: Vec<u8> = self.drives[s].cdrom().sense[..length].to_vec();
        self.cd_start_data_in(cc_per_sector, &sense);
    }

    fn cd_inquiry(&mut self, irq: &mut dyn IrqSink, cc_per_sector: i64, pkt: &[u8; 12]) {
        let s = self.selected;
        if pkt[1] & 0x01 != 0 {
            warn!("INQUIRY with EVPD set");
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_INVALID_FIELD_IN_CDB);
            return;
        }
        let byte_count = self.drives[s].pio.packet_byte_count;
        if byte_count == 0 {
            warn!("INQUIRY with a zero byte-count limit");
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_PARAMETER_VALUE_INVALID);
            return;
        }
        let length = usize::from(pkt[4]).min(48);
        if byte_count != length {
            warn!(byte_count, length, "INQUIRY allocation mismatch");
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_PARAMETER_VALUE_INVALID);
            return;
        }

        let mut data = [0u8; 48];
        // CD-ROM peripheral, removable medium, SCSI-2 response format.
        data[0] = 0x05;
        data[1] = 0x80;
        data[2] = 0x02;
        data[3] = 0x02;
        data[4] = 0x2A;
        data[8..16].copy_from_slice(b"MEMUPC  ");
        data[16..32].copy_from_slice(b"CD-ROM BASIC    ");
        data[32..36].copy_from_slice(b"0100");
        data[36] = 0x20;
        data[37..47].copy_from_slice(b"2023/12/23");
        self.cd_start_data_in(cc_per_sector, &data[..length]);
    }

    fn cd_mode_sense(
        &mut self,
        irq: &mut dyn IrqSink,
        cc_per_sector: i64,
        pkt: &[u8; 12],
        is_10_byte: bool,
    ) {
        let s = self.selected;
        if !self.cdrom_check_ready(irq, false) {
            return;
        }
        let mut length = if is_10_byte {
            usize::from(pkt[7]) << 8 | usize::from(pkt[8])
        } else {
            usize::from(pkt[4])
        };
        let pcf = pkt[2] >> 5;
        let page_code = pkt[2] & 0x3F;

        let byte_count = self.drives[s].pio.packet_byte_count;
        if byte_count != length {
            warn!(byte_count, length, "MODE SENSE allocation mismatch");
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_PARAMETER_VALUE_INVALID);
            return;
        }
        if length == 0 {
            self.cd_success(irq, false);
            return;
        }

        let mut data = vec![0u8; 8];
        data[2] = self.drives[s].cdrom().media_type_byte();
        if page_code != 0x00 {
            let mode = match pcf {
                0 => self.drives[s].cdrom().mode,
                2 => Default::default(),
                _ => {
                    // Changeable (1) and saved (3) page control are not
                    // kept by the drive.
                    warn!(pcf, "MODE SENSE with an unsupported page control field");
                    self.cdrom_abort(
                        irq,
                        s,
                        SENSE_KEY_ILLEGAL_REQUEST,
                        ADD_SENSE_PARAMETER_VALUE_INVALID,
                    );
                    return;
                }
            };
            match page_code {
                0x0D => {
                    data.extend_from_slice(&[
                        0x0D,
                        0x06,
                        0x00,
                        mode.parameters.inactivity_timer_multiplier,
                        0x00,
                        mode.parameters.seconds_per_minute,
                        0x00,
                        mode.parameters.frames_per_second,
                    ]);
                }
                0x0E => {
                    let ac = mode.audio_control;
                    data.extend_from_slice(&[
                        0x0E,
                        0x0E,
                        u8::from(ac.immed) << 2 | u8::from(ac.sotc) << 1,
                        0x00,
                        0x00,
                        0x00,
                        0x00,
                        0x00,
                        ac.port0_channel,
                        ac.port0_volume,
                        ac.port1_channel,
                        ac.port1_volume,
                        0x00,
                        0x00,
                        0x00,
                        0x00,
                    ]);
                }
                _ => {
                    warn!(page_code, "MODE SENSE of an unsupported page");
                    self.cdrom_abort(
                        irq,
                        s,
                        SENSE_KEY_ILLEGAL_REQUEST,
                        ADD_SENSE_INVALID_FIELD_IN_CDB,
                    );
                    return;
                }
            }
            let sense_length = (data.len() - 2) as u16;
            data[0] = (sense_length >> 8) as u8;
            data[1] = sense_length as u8;
        }

        if data.len() < length {
            length = data.len();
        }
        if byte_count != length {
            warn!(byte_count, length, "MODE SENSE produced less data than allocated");
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_PARAMETER_VALUE_INVALID);
            return;
        }
        data.truncate(length);
        self.cd_start_data_in(cc_per_sector, &data);
    }

    fn cd_mode_select(&mut self, irq: &mut dyn IrqSink, pkt: &[u8; 12], is_10_byte: bool) {
        let s = self.selected;
        if !self.cdrom_check_ready(irq, false) {
            return;
        }
        let length = if is_10_byte {
            usize::from(pkt[7]) << 8 | usize::from(pkt[8])
        } else {
            usize::from(pkt[4])
        };
        if pkt[1] & 0x01 != 0 {
            // Saving pages is not supported.
            warn!("MODE SELECT with SP set");
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_INVALID_FIELD_IN_CDB);
            return;
        }
        let byte_count = self.drives[s].pio.packet_byte_count;
        if byte_count != length {
            warn!(byte_count, length, "MODE SELECT allocation mismatch");
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_PARAMETER_VALUE_INVALID);
            return;
        }
        if length == 0 {
            self.cd_success(irq, false);
            return;
        }

        // Data-out phase: wait for the parameter list.
        let drive = &mut self.drives[s];
        drive.pio.op = TransferOp::WriteSelectCd;
        drive.pio.begin = 0;
        drive.pio.end = length.div_ceil(2);
        drive.pio.drq_after_wait = true;
        drive.pio.waiting = false;
        drive.status.remove(AtaStatus::BSY | AtaStatus::DF | AtaStatus::SRV | AtaStatus::ERR);
        drive.status.insert(AtaStatus::DRQ);
        drive.cdrom().busy = true;
        drive.intrq = true;
        // I/O=0, C/D=0: data to the device.
        self.sector_count &= 0xF8;
        self.update_irq(irq);
    }

    fn cdrom_write_select_data(&mut self, irq: &mut dyn IrqSink) {
        let s = self.selected;
        let total = self.drives[s].pio.packet_byte_count;
        let data = self.drives[s].pio.staged_bytes(total);

        if data.len() < 8 {
            self.cdrom_abort(
                irq,
                s,
                SENSE_KEY_ILLEGAL_REQUEST,
                ADD_SENSE_PARAMETER_LIST_LENGTH_ERROR,
            );
            return;
        }
        let mut rest = &data[8..];
        while rest.len() >= 2 {
            let page_code = rest[0] & 0x3F;
            let page_length = usize::from(rest[1]);
            rest = &rest[2..];
            if page_length > rest.len() {
                self.cdrom_abort(
                    irq,
                    s,
                    SENSE_KEY_ILLEGAL_REQUEST,
                    ADD_SENSE_PARAMETER_LIST_LENGTH_ERROR,
                );
                return;
            }
            match page_code {
                0x0E => {
                    if page_length != 14 {
                        self.cdrom_abort(
                            irq,
                            s,
                            SENSE_KEY_ILLEGAL_REQUEST,
                            ADD_SENSE_PARAMETER_LIST_LENGTH_ERROR,
                        );
                        return;
                    }
                    let ac = &mut self.drives[s].cdrom().mode.audio_control;
                    ac.immed = rest[0] & 0x04 != 0;
                    ac.sotc = rest[0] & 0x02 != 0;
                    ac.port0_channel = rest[6] & 0x0F;
                    ac.port0_volume = rest[7];
                    ac.port1_channel = rest[8] & 0x0F;
                    ac.port1_volume = rest[9];
                }
                _ => {
                    warn!(page_code, "MODE SELECT of an unsupported page");
                    self.cdrom_abort(
                        irq,
                        s,
                        SENSE_KEY_ILLEGAL_REQUEST,
                        ADD_SENSE_INVALID_FIELD_IN_CDB,
                    );
                    return;
                }
            }
            rest = &rest[page_length..];
        }

        self.cd_success(irq, false);
    }

    fn cd_start_stop_unit(&mut self, irq: &mut dyn IrqSink) {
        // Spinning up and ejecting are not modelled.
        self.cd_success(irq, false);
    }

    fn cd_prevent_allow_medium_removal(&mut self, irq: &mut dyn IrqSink, pkt: &[u8; 12]) {
        let s = self.selected;
        self.drives[s].cdrom().locked = pkt[4] & 0x01 != 0;
        self.cd_success(irq, false);
    }

    fn cd_read_capacity(&mut self, irq: &mut dyn IrqSink, cc_per_sector: i64, _pkt: &[u8; 12]) {
        let s = self.selected;
        if !self.cdrom_check_ready(irq, true) {
            return;
        }
        let byte_count = self.drives[s].pio.packet_byte_count;
        if byte_count != 8 {
            warn!(byte_count, "READ CD-ROM CAPACITY with a byte-count limit other than 8");
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_PARAMETER_VALUE_INVALID);
            return;
        }
        // Last addressable LBA: one past the final frame, lead-in
        // excluded.
        let last = {
            let cd = self.drives[s].cdrom();
            let toc = cd.cd.toc().expect("media checked above");
            toc.last_track().expect("TOC has at least one track").last_sector.to_frames() + 1
        };
        let lba = last.saturating_sub(LEAD_IN_FRAMES);

        let mut data = [0u8; 8];
        data[0..4].copy_from_slice(&lba.to_be_bytes());
        data[4..8].copy_from_slice(&2048u32.to_be_bytes());
        self.cd_start_data_in(cc_per_sector, &data);
    }

    /// Position the logical-block cursor at `lba`, with LBA 0 at the
    /// first data index of track 1 (most discs start data at 00:02:00).
    fn cdrom_seek(&mut self, irq: &mut dyn IrqSink, lba: u32) -> bool {
        let s = self.selected;
        let target = {
            let cd = self.drives[s].cdrom();
            let base = cd
                .cd
                .toc()
                .and_then(|toc| toc.tracks.first())
                .and_then(|t| t.index1())
                .map(|i| i.pos.to_frames())
                .unwrap_or(0);
            Msf::from_frames(base + lba * cd.mode.sectors_per_block)
        };
        let ok = {
            let cd = self.drives[s].cdrom();
            cd.cd.seek(target.m, target.s, target.f)
        };
        if !ok {
            self.cdrom_abort(irq, s, SENSE_KEY_MEDIUM_ERROR, ADD_SENSE_NO_SEEK_COMPLETE);
            return false;
        }
        let cd = self.drives[s].cdrom();
        cd.block.pos = 0;
        cd.block.len = 0;
        true
    }

    /// Pull one logical block out of the next raw frame into the staging
    /// buffer.
    fn cdrom_read_block(&mut self, irq: &mut dyn IrqSink) -> bool {
        let s = self.selected;
        let result: Result<(), (u8, u16)> = (|| {
            let cd = self.drives[s].cdrom();
            if cd.mode.lblock_size != 2048 {
                warn!(lblock_size = cd.mode.lblock_size, "logical block size not supported");
                return Err((SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_INVALID_FIELD_IN_CDB));
            }
            let mut crc_ok = false;
            let mut q = cd.subchannel_q;
            if !cd.cd.read_subchannel_q(&mut q, &mut crc_ok) {
                return Err((SENSE_KEY_MEDIUM_ERROR, ADD_SENSE_CAN_NOT_READ_UNK_FORMAT));
            }
            cd.subchannel_q = q;
            let mut frame = [0u8; CD_SECTOR_SIZE];
            let mut is_audio = false;
            if !cd.cd.read_sector(&mut frame, &mut is_audio) {
                return Err((SENSE_KEY_MEDIUM_ERROR, ADD_SENSE_CAN_NOT_READ_UNK_FORMAT));
            }
            if is_audio {
                return Err((SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_ILLEGAL_MODE_FOR_THIS_TRACK));
            }
            match frame[15] {
                1 => {
                    cd.block.data[..2048].copy_from_slice(&frame[16..16 + 2048]);
                }
                2 => {
                    if frame[0x12] & 0x20 == 0 {
                        // Mode 2 form 1.
                        cd.block.data[..2048].copy_from_slice(&frame[0x18..0x18 + 2048]);
                    } else {
                        return Err((
                            SENSE_KEY_ILLEGAL_REQUEST,
                            ADD_SENSE_CAN_NOT_READ_INCOMPATIBLE_FORMAT,
                        ));
                    }
                }
                mode => {
                    warn!(mode, "unrecognised data sector mode");
                    return Err((SENSE_KEY_MEDIUM_ERROR, ADD_SENSE_CAN_NOT_READ_UNK_FORMAT));
                }
            }
            cd.block.pos = 0;
            cd.block.len = 2048;
            Ok(())
        })();
        match result {
            Ok(()) => true,
            Err((key, add)) => {
                self.cdrom_abort(irq, s, key, add);
                false
            }
        }
    }

    fn cd_read10(&mut self, irq: &mut dyn IrqSink, cc_per_sector: i64, pkt: &[u8; 12]) {
        let s = self.selected;
        if !self.cdrom_check_ready(irq, true) {
            return;
        }
        let lba = u32::from_be_bytes([pkt[2], pkt[3], pkt[4], pkt[5]]);
        let blocks = u16::from(pkt[7]) << 8 | u16::from(pkt[8]);
        if blocks == 0 {
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_PARAMETER_VALUE_INVALID);
            return;
        }
        if !self.cdrom_seek(irq, lba) {
            return;
        }
        let byte_count =
            (usize::from(self.addr.lba_mid) | usize::from(self.addr.lba_hi) << 8) & !1;
        if byte_count == 0 {
            warn!("READ (10) with a zero (or one-byte) byte-count limit");
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_PARAMETER_VALUE_INVALID);
            return;
        }
        let drive = &mut self.drives[s];
        drive.pio.op = TransferOp::ReadCdBlocks;
        drive.pio.blocks_remaining = blocks;
        drive.pio.block_byte_count = byte_count;
        let cd = drive.cdrom();
        cd.block.pos = 0;
        cd.block.len = 0;
        self.read_cdlb_iter(irq, cc_per_sector);
    }

    /// One DRQ round of a READ (10): fill the PIO buffer with whole
    /// logical blocks (plus any carry-over), publish the byte count, and
    /// pace the interrupt. Once everything is drained, a final status
    /// interrupt completes the command.
    fn read_cdlb_iter(&mut self, irq: &mut dyn IrqSink, cc_per_sector: i64) {
        let s = self.selected;

        let available = {
            let drive = &mut self.drives[s];
            let remaining = drive.pio.blocks_remaining;
            let cd = drive.cdrom();
            cd.block.pos < cd.block.len || remaining > 0
        };
        if !available {
            self.drives[s].pio.op = TransferOp::Normal;
            self.cd_success(irq, false);
            return;
        }

        let byte_count = self.drives[s].pio.block_byte_count;
        let mut out: Vec<u8> = Vec::with_capacity(byte_count);
        loop {
            let (pos, len) = {
                let cd = self.drives[s].cdrom();
                (cd.block.pos, cd.block.len)
            };
            if pos >= len {
                if self.drives[s].pio.blocks_remaining > 0 {
                    if !self.cdrom_read_block(irq) {
                        return;
                    }
                    self.drives[s].pio.blocks_remaining -= 1;
                    continue;
                }
                break;
            }
            let take = (len - pos).min(byte_count - out.len());
            {
                let cd = self.drives[s].cdrom();
                out.extend_from_slice(&cd.block.data[pos..pos + take]);
                cd.block.pos = pos + take;
            }
            if out.len() == byte_count {
                break;
            }
        }
        let nbytes = out.len();

        let drive = &mut self.drives[s];
        drive.pio.load_bytes(&out);
        drive.pio.waiting = true;
        drive.pio.drq_after_wait = true;
        drive.pio.remain_cc = ((nbytes as i64 * cc_per_sector) / SECTOR_SIZE as i64).max(1);
        drive.status = AtaStatus::BSY | AtaStatus::RDY | AtaStatus::DRQ;
        self.addr.lba_mid = nbytes as u8;
        self.addr.lba_hi = (nbytes >> 8) as u8;
        // I/O=1: transfer to the host.
        self.sector_count = (self.sector_count & 0xF8) | 0x02;
    }

    fn cd_transfer_finish(&mut self, irq: &mut dyn IrqSink) {
        let s = self.selected;
        self.drives[s].pio.op = TransferOp::Normal;
        self.cd_success(irq, false);
    }

    fn cd_seek10(&mut self, irq: &mut dyn IrqSink, pkt: &[u8; 12]) {
        if !self.cdrom_check_ready(irq, true) {
            return;
        }
        let lba = u32::from_be_bytes([pkt[2], pkt[3], pkt[4], pkt[5]]);
        if !self.cdrom_seek(irq, lba) {
            return;
        }
        self.cd_success(irq, false);
    }

    fn cd_read_toc(&mut self, irq: &mut dyn IrqSink, cc_per_sector: i64, pkt: &[u8; 12]) {
        let s = self.selected;
        if !self.cdrom_check_ready(irq, true) {
            return;
        }
        let use_msf = pkt[1] & 0x02 != 0;
        let mut length = usize::from(pkt[7]) << 8 | usize::from(pkt[8]);
        let mut start_track = pkt[6];
        let format = pkt[9] >> 6;

        if length == 0 {
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_PARAMETER_VALUE_INVALID);
            return;
        }
        let byte_count = self.drives[s].pio.packet_byte_count;
        if byte_count != length {
            warn!(byte_count, length, "READ TOC allocation mismatch");
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_PARAMETER_VALUE_INVALID);
            return;
        }

        let ntracks = {
            let cd = self.drives[s].cdrom();
            cd.cd.toc().expect("media checked above").tracks.len() as u8
        };
        if format == 1 && start_track != 0 {
            warn!(start_track, "READ TOC format 1 with a non-zero start track");
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_PARAMETER_VALUE_INVALID);
            return;
        }
        if format != 1 {
            if start_track == 0 {
                start_track = 1;
            }
            if start_track > ntracks {
                warn!(start_track, ntracks, "READ TOC start track out of range");
                self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_INVALID_FIELD_IN_CDB);
                return;
            }
        }

        // Model the head movement the real unit performs to fetch the
        // TOC, refreshing subchannel Q on the way.
        {
            let result: Result<(), (u8, u16)> = {
                let cd = self.drives[s].cdrom();
                if !cd.cd.seek(0, 1, 74) {
                    Err((SENSE_KEY_MEDIUM_ERROR, ADD_SENSE_NO_SEEK_COMPLETE))
                } else {
                    let mut crc_ok = false;
                    let mut q = cd.subchannel_q;
                    if !cd.cd.read_subchannel_q(&mut q, &mut crc_ok) {
                        Err((SENSE_KEY_MEDIUM_ERROR, ADD_SENSE_CAN_NOT_READ_UNK_FORMAT))
                    } else {
                        cd.subchannel_q = q;
                        Ok(())
                    }
                }
            };
            if let Err((key, add)) = result {
                self.cdrom_abort(irq, s, key, add);
                return;
            }
        }

        fn push_position(data: &mut Vec<u8>, pos: Msf, use_msf: bool) {
            if use_msf {
                data.extend_from_slice(&[0x00, pos.m, pos.s, pos.f]);
            } else {
                let frames = pos.to_frames();
                let lba = frames.saturating_sub(LEAD_IN_FRAMES);
                if frames < LEAD_IN_FRAMES {
                    warn!(frames, "track position inside the lead-in clamped to LBA 0");
                }
                data.extend_from_slice(&lba.to_be_bytes());
            }
        }

        fn adr_control(track: &memupc_storage::cd::CdTrack) -> u8 {
            0x10 | u8::from(track.four_channel_audio) << 3
                | u8::from(!track.is_audio) << 2
                | u8::from(track.copy_permitted) << 1
                | u8::from(track.preemphasis)
        }

        let mut data: Vec<u8> = vec![0, 0];
        match format {
            0 => {
                let (tracks, last): (Vec<_>, u8) = {
                    let cd = self.drives[s].cdrom();
                    let toc = cd.cd.toc().expect("media checked above");
                    (toc.tracks.clone(), toc.tracks.len() as u8)
                };
                data.push(start_track);
                data.push(last);
                for track in tracks.iter().skip(usize::from(start_track) - 1) {
                    data.push(0x00);
                    data.push(adr_control(track));
                    data.push(track.number);
                    data.push(0x00);
                    let index1 = track.index1().expect("track has an index 1");
                    push_position(&mut data, index1.pos, use_msf);
                }
            }
            1 => {
                let (first_track, sessions) = {
                    let cd = self.drives[s].cdrom();
                    let toc = cd.cd.toc().expect("media checked above");
                    (toc.tracks.first().cloned(), toc.sessions)
                };
                if sessions > 1 {
                    warn!(sessions, "READ TOC format 1 on a multisession disc");
                    self.cdrom_abort(
                        irq,
                        s,
                        SENSE_KEY_ILLEGAL_REQUEST,
                        ADD_SENSE_INVALID_FIELD_IN_CDB,
                    );
                    return;
                }
                let track = first_track.expect("TOC has at least one track");
                data.push(1);
                data.push(1);
                data.push(0x00);
                data.push(adr_control(&track));
                data.push(1);
                data.push(0x00);
                let index1 = track.index1().expect("track has an index 1");
                push_position(&mut data, index1.pos, use_msf);
            }
            2 => {
                // Raw subchannel-Q TOC: not carried by the drive.
                self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_INVALID_FIELD_IN_CDB);
                return;
            }
            _ => {
                warn!(format, "READ TOC with a reserved format");
                self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_PARAMETER_VALUE_INVALID);
                return;
            }
        }
        let toc_length = (data.len() - 2) as u16;
        data[0] = (toc_length >> 8) as u8;
        data[1] = toc_length as u8;

        if data.len() < length {
            // Less TOC than allocated: shrink the advertised byte count.
            length = data.len();
            self.drives[s].pio.packet_byte_count = length;
            self.addr.lba_hi = (length >> 8) as u8;
            self.addr.lba_mid = length as u8;
        }
        data.truncate(length);
        self.cd_start_data_in(cc_per_sector, &data);
    }

    fn cd_read_sub_channel(&mut self, irq: &mut dyn IrqSink, cc_per_sector: i64, pkt: &[u8; 12]) {
        let s = self.selected;
        if !self.cdrom_check_ready(irq, false) {
            return;
        }
        let use_msf = pkt[1] & 0x02 != 0;
        let sub_q = pkt[2] & 0x40 != 0;
        let format = pkt[3];
        let mut length = usize::from(pkt[7]) << 8 | usize::from(pkt[8]);

        let byte_count = self.drives[s].pio.packet_byte_count;
        if byte_count != length {
            warn!(byte_count, length, "READ SUB-CHANNEL allocation mismatch");
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_PARAMETER_VALUE_INVALID);
            return;
        }

        let (audio_status, q) = {
            let cd = self.drives[s].cdrom();
            let status = cd.audio.status;
            // The audio status byte is consumed by the read.
            cd.audio.status = AudioStatus::None;
            (status, cd.subchannel_q)
        };

        let mut data: Vec<u8> = vec![0x00, audio_status.as_byte()];
        if !sub_q {
            data.extend_from_slice(&[0, 0]);
        } else {
            data.extend_from_slice(&[0, 0]);
            match format {
                0x01 => {
                    if !use_msf {
                        warn!("READ SUB-CHANNEL current-position data in LBA form");
                        self.cdrom_abort(
                            irq,
                            s,
                            SENSE_KEY_ILLEGAL_REQUEST,
                            ADD_SENSE_INVALID_FIELD_IN_CDB,
                        );
                        return;
                    }
                    data.push(0x01);
                    data.push(q[1] << 4 | q[1] >> 4);
                    data.push(q[2]);
                    data.push(q[3]);
                    data.extend_from_slice(&[0x00, q[8], q[9], q[10]]);
                    data.extend_from_slice(&[0x00, q[4], q[5], q[6]]);
                }
                _ => {
                    warn!(format, "READ SUB-CHANNEL with an unsupported data format");
                    self.cdrom_abort(
                        irq,
                        s,
                        SENSE_KEY_ILLEGAL_REQUEST,
                        ADD_SENSE_INVALID_FIELD_IN_CDB,
                    );
                    return;
                }
            }
            let sub_len = (data.len() - 4) as u16;
            data[2] = (sub_len >> 8) as u8;
            data[3] = sub_len as u8;
        }

        if data.len() < length {
            length = data.len();
        }
        if byte_count != length {
            warn!(byte_count, length, "READ SUB-CHANNEL produced less data than allocated");
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_PARAMETER_VALUE_INVALID);
            return;
        }
        data.truncate(length);
        self.cd_start_data_in(cc_per_sector, &data);
    }

    fn cd_play_audio_msf(&mut self, irq: &mut dyn IrqSink, pkt: &[u8; 12]) {
        let s = self.selected;
        if !self.cdrom_check_ready(irq, true) {
            return;
        }
        if self.drives[s].cdrom().playing {
            warn!("PLAY AUDIO MSF while already playing; restarting");
        }

        let start = Msf::new(pkt[3], pkt[4], pkt[5]);
        if pkt[3] == 0xFF && pkt[4] == 0xFF && pkt[5] == 0xFF {
            // Play-from-current-position form is not supported.
            warn!("PLAY AUDIO MSF from the current position");
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_INVALID_FIELD_IN_CDB);
            return;
        }
        let end = Msf::new(pkt[6], pkt[7], pkt[8]);

        // Validate the range against the disc.
        let last = {
            let cd = self.drives[s].cdrom();
            cd.cd
                .toc()
                .expect("media checked above")
                .last_track()
                .expect("TOC has at least one track")
                .last_sector
                .next()
        };
        if !start.is_valid() || !end.is_valid() || start > end || end > last {
            self.cdrom_abort(irq, s, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_PARAMETER_VALUE_INVALID);
            return;
        }

        let cd = self.drives[s].cdrom();
        if !cd.mode.audio_control.immed {
            warn!("PLAY AUDIO MSF with IMMED clear; completing immediately anyway");
        }
        cd.busy = false;
        cd.playing = true;
        cd.paused = false;
        cd.audio.pos = 0;
        cd.audio.len = 0;
        cd.audio.current = start;
        cd.audio.end = end;
        cd.audio.status = AudioStatus::InProgress;
        // Playback runs in the background; the drive keeps accepting
        // packet commands (PAUSE/RESUME, STOP, READ SUB-CHANNEL) while
        // audio streams.
        self.cd_success(irq, false);
    }

    fn cd_pause_resume(&mut self, irq: &mut dyn IrqSink, pkt: &[u8; 12]) {
        let s = self.selected;
        if !self.cdrom_check_ready(irq, false) {
            return;
        }
        if !self.drives[s].cdrom().playing {
            self.cdrom_abort(
                irq,
                s,
                SENSE_KEY_ABORTED_COMMAND,
                ADD_SENSE_AUDIO_PLAY_OPERATION_ABORTED,
            );
            return;
        }
        let resume = pkt[8] & 0x01 != 0;
        let cd = self.drives[s].cdrom();
        cd.paused = !resume;
        cd.audio.status = if resume { AudioStatus::InProgress } else { AudioStatus::Paused };
        self.cd_success(irq, false);
    }

    fn cd_stop_play(&mut self, irq: &mut dyn IrqSink) {
        let s = self.selected;
        if !self.cdrom_check_ready(irq, false) {
            return;
        }
        let cd = self.drives[s].cdrom();
        let new_status = if cd.playing { AudioStatus::Completed } else { cd.audio.status };
        cd.stop_playing(new_status);
        self.cd_success(irq, false);
    }

    /// Burn `cc` cycles of pending transfer pacing. Expired waits drop
    /// BSY, settle DRQ and raise the drive interrupt. Returns true when
    /// any interrupt line may have changed.
    pub(crate) fn advance_transfers(&mut self, cc: i64) -> bool {
        let mut changed = false;
        for drive in &mut self.drives {
            if drive.media.is_none() || !drive.pio.waiting {
                continue;
            }
            drive.pio.remain_cc -= cc;
            if drive.pio.remain_cc <= 0 {
                drive.pio.remain_cc = 0;
                drive.pio.waiting = false;
                drive.status.remove(AtaStatus::BSY);
                drive.status.set(AtaStatus::DRQ, drive.pio.drq_after_wait);
                drive.intrq = true;
                changed = true;
            }
        }
        changed
    }

    /// Shortest pacing delay still pending on this channel.
    pub(crate) fn min_waiting_cc(&self) -> Option<i64> {
        self.drives
            .iter()
            .filter(|d| !d.media.is_none() && d.pio.waiting)
            .map(|d| d.pio.remain_cc)
            .min()
    }

    // Audio playback. Pulled one stereo sample pair at a time by the
    // sound path; sectors load on demand.

    fn play_load_next_sector(&mut self, irq: &mut dyn IrqSink, slot: usize) -> bool {
        let sotc = self.drives[slot].cdrom().mode.audio_control.sotc;
        if sotc {
            // Stop-on-track-crossing semantics are undefined for this
            // drive; refuse rather than play through a boundary.
            warn!("audio playback with SOTC set");
            self.cdrom_abort(irq, slot, SENSE_KEY_ILLEGAL_REQUEST, ADD_SENSE_INVALID_FIELD_IN_CDB);
            self.drives[slot].cdrom().stop_playing(AudioStatus::Error);
            return false;
        }
        if !self.drives[slot].cdrom().cd.media_present() {
            warn!("disc ejected while audio was playing");
            self.cdrom_abort(irq, slot, SENSE_KEY_NOT_READY, ADD_SENSE_MEDIUM_NOT_PRESENT);
            self.drives[slot].cdrom().stop_playing(AudioStatus::Error);
            return false;
        }
        {
            let cd = self.drives[slot].cdrom();
            if cd.audio.current >= cd.audio.end {
                cd.stop_playing(AudioStatus::Completed);
                return false;
            }
        }

        let result: Result<(), (u8, u16, bool)> = {
            let cd = self.drives[slot].cdrom();
            let cur = cd.audio.current;
            if !cd.cd.seek(cur.m, cur.s, cur.f) {
                Err((SENSE_KEY_MEDIUM_ERROR, ADD_SENSE_NO_SEEK_COMPLETE, true))
            } else {
                let mut crc_ok = false;
                let mut q = cd.subchannel_q;
                if !cd.cd.read_subchannel_q(&mut q, &mut crc_ok) {
                    Err((SENSE_KEY_MEDIUM_ERROR, ADD_SENSE_CAN_NOT_READ_UNK_FORMAT, false))
                } else {
                    cd.subchannel_q = q;
                    let mut is_audio = false;
                    let mut sector = [0u8; CD_SECTOR_SIZE];
                    if !cd.cd.read_sector(&mut sector, &mut is_audio) {
                        Err((SENSE_KEY_MEDIUM_ERROR, ADD_SENSE_CAN_NOT_READ_UNK_FORMAT, true))
                    } else if !is_audio {
                        Err((
                            SENSE_KEY_ILLEGAL_REQUEST,
                            ADD_SENSE_ILLEGAL_MODE_FOR_THIS_TRACK,
                            true,
                        ))
                    } else {
                        cd.audio.sector = sector;
                        cd.audio.current = cur.next();
                        cd.audio.pos = 0;
                        cd.audio.len = CD_SECTOR_SIZE;
                        Ok(())
                    }
                }
            }
        };
        match result {
            Ok(()) => true,
            Err((key, add, stop)) => {
                self.cdrom_abort(irq, slot, key, add);
                if stop {
                    self.drives[slot].cdrom().stop_playing(AudioStatus::Error);
                }
                false
            }
        }
    }

    /// Next stereo sample pair of the playing drive, with the audio
    /// control page's channel selection and volume applied per port.
    pub fn cd_audio_sample(&mut self, irq: &mut dyn IrqSink, slot: usize) -> (i16, i16) {
        let needs_sector = {
            let cd = match &mut self.drives[slot].media {
                Media::Cdrom(cd) => cd,
                _ => return (0, 0),
            };
            if !cd.playing || cd.paused {
                return (0, 0);
            }
            cd.audio.pos == cd.audio.len
        };
        if needs_sector && !self.play_load_next_sector(irq, slot) {
            return (0, 0);
        }

        let cd = self.drives[slot].cdrom();
        let p = cd.audio.pos;
        let left = i16::from_le_bytes([cd.audio.sector[p], cd.audio.sector[p + 1]]);
        let right = i16::from_le_bytes([cd.audio.sector[p + 2], cd.audio.sector[p + 3]]);
        cd.audio.pos += 4;

        let ac = cd.mode.audio_control;
        let route = |channel: u8, volume: u8| -> i16 {
            let sample = match channel {
                0 => 0,
                1 => left,
                2 => right,
                other => {
                    warn!(channel = other, "unsupported audio output channel selection");
                    0
                }
            };
            ((i32::from(sample) * i32::from(volume)) / 255) as i16
        };
        (route(ac.port0_channel, ac.port0_volume), route(ac.port1_channel, ac.port1_volume))
    }
}
