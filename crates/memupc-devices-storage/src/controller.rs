//! The controller proper: PIIX4 function 1 configuration registers,
//! legacy/bus-master port decode, and the cycle accounting that paces
//! PIO transfers.

use memupc_platform::{ClockBus, IrqSink};
use memupc_storage::SECTOR_SIZE;
use tracing::warn;

use crate::ata::AtaDrive;
use crate::atapi::AtapiDrive;
use crate::channel::{Channel, Media};

const PCICMD_IOSE: u16 = 0x0001;
const IDETIM_IDE: u16 = 0x8000;

const VID: u16 = 0x8086;
const DID: u16 = 0x7111;
const RID: u8 = 0x00;

// Mass storage, IDE controller, bus-master capable.
const BASEC: u8 = 0x01;
const SCC: u8 = 0x01;
const PI: u8 = 0x80;

const HEDT: u8 = 0x00;

struct PciRegs {
    pcicmd: u16,
    bmiba: u32,
    idetim: [u16; 2],
}

impl PciRegs {
    fn power_on() -> Self {
        PciRegs {
            pcicmd: 0x0000,
            bmiba: 0x0000_0001,
            idetim: [0x0000, 0x0000],
        }
    }
}

struct Timing {
    /// CPU cycles already folded into `cc` this round.
    cc_used: i64,
    /// Cycles accrued but not yet charged against pending transfers.
    cc: i64,
    /// Preparation delay per 512-byte buffer (about 16 MiB/s).
    cc_per_sector: i64,
    /// Cycles (from the accounting base) of the next transfer expiry.
    cc_to_event: i64,
}

pub struct IdeController {
    channels: [Channel; 2],
    pci: PciRegs,
    timing: Timing,
    /// The drive whose audio output feeds the sound path.
    audio_drive: Option<(usize, usize)>,
}

impl IdeController {
    pub fn new(clk: &mut ClockBus) -> Self {
        let mut ide = IdeController {
            channels: [Channel::new(14), Channel::new(15)],
            pci: PciRegs::power_on(),
            timing: Timing {
                cc_used: 0,
                cc: 0,
                cc_per_sector: (SECTOR_SIZE as i64 * clk.hz()) / (16 * 1024 * 1024),
                cc_to_event: 0,
            },
            audio_drive: None,
        };
        ide.update_cc_to_event(clk);
        ide
    }

    pub fn attach_ata(&mut self, channel: usize, slot: usize, drive: AtaDrive) {
        self.channels[channel].attach(slot, Media::Hdd(drive));
    }

    pub fn attach_atapi(&mut self, channel: usize, slot: usize, drive: AtapiDrive) {
        self.channels[channel].attach(slot, Media::Cdrom(drive));
        self.audio_drive = Some((channel, slot));
    }

    pub fn attach_primary_master_ata(&mut self, drive: AtaDrive) {
        self.attach_ata(0, 0, drive);
    }

    pub fn attach_primary_slave_ata(&mut self, drive: AtaDrive) {
        self.attach_ata(0, 1, drive);
    }

    pub fn attach_secondary_master_atapi(&mut self, drive: AtapiDrive) {
        self.attach_atapi(1, 0, drive);
    }

    pub fn primary_irq_pending(&self) -> bool {
        self.channels[0].irq_level()
    }

    pub fn secondary_irq_pending(&self) -> bool {
        self.channels[1].irq_level()
    }

    pub fn reset(&mut self, clk: &mut ClockBus, irq: &mut dyn IrqSink) {
        self.run(clk, irq, false);
        for channel in &mut self.channels {
            channel.reset();
            channel.update_irq(irq);
        }
        self.pci = PciRegs::power_on();
        self.timing.cc_to_event = 0;
        self.update_cc_to_event(clk);
    }

    // Cycle accounting.

    fn run(&mut self, clk: &mut ClockBus, irq: &mut dyn IrqSink, update_event: bool) {
        let cc = clk.cycles() - self.timing.cc_used;
        if cc > 0 {
            self.timing.cc += cc;
            self.timing.cc_used += cc;
        }
        let cc_proc = self.timing.cc;
        self.timing.cc = 0;

        for channel in &mut self.channels {
            if channel.advance_transfers(cc_proc) {
                channel.update_irq(irq);
            }
        }

        if update_event {
            self.update_cc_to_event(clk);
        }
    }

    fn update_cc_to_event(&mut self, clk: &mut ClockBus) {
        // One second unless a transfer expires sooner.
        self.timing.cc_to_event = clk.hz();
        for channel in &self.channels {
            if let Some(cc) = channel.min_waiting_cc() {
                debug_assert!(cc > 0);
                if cc < self.timing.cc_to_event {
                    self.timing.cc_to_event = cc;
                }
            }
        }
        clk.propose_event(self.next_event_cc());
    }

    /// Cycles until the next transfer-pacing expiry.
    pub fn next_event_cc(&self) -> i64 {
        let cc = self.timing.cc_to_event - self.timing.cc;
        debug_assert!(cc > 0);
        cc
    }

    pub fn end_iter(&mut self, clk: &mut ClockBus, irq: &mut dyn IrqSink) {
        let cc = clk.cycles() - self.timing.cc_used;
        if cc > 0 {
            self.timing.cc += cc;
            self.timing.cc_used += cc;
            if self.timing.cc_to_event != 0 && self.timing.cc >= self.timing.cc_to_event {
                self.run(clk, irq, true);
            }
        }
        self.timing.cc_used = 0;
    }

    /// Next stereo sample pair from the CD audio drive, silence when
    /// nothing is playing.
    pub fn next_cd_audio_sample(&mut self, irq: &mut dyn IrqSink) -> (i16, i16) {
        match self.audio_drive {
            Some((channel, slot)) => self.channels[channel].cd_audio_sample(irq, slot),
            None => (0, 0),
        }
    }

    // PCI configuration space (function 1 of the south bridge).

    pub fn config_read8(&mut self, addr: u8) -> u8 {
        match addr {
            0x00..=0x01 => VID.to_le_bytes()[addr as usize & 1],
            0x02..=0x03 => DID.to_le_bytes()[addr as usize & 1],
            0x08 => RID,
            0x09 => PI,
            0x0A => SCC,
            0x0B => BASEC,
            0x0E => HEDT,
            0x0F..=0x1F | 0x24..=0x3F => 0x00,
            _ => {
                warn!(addr, "PIIX4 IDE: 8-bit config read of unimplemented register");
                0xFF
            }
        }
    }

    pub fn config_read16(&mut self, addr: u8) -> u16 {
        match addr {
            0x00 => VID,
            0x01 => DID,
            0x02 => self.pci.pcicmd,
            0x04 => u16::from(PI) << 8 | u16::from(RID),
            0x05 => u16::from(BASEC) << 8 | u16::from(SCC),
            0x08..=0x0F | 0x12..=0x1F => 0x0000,
            0x20 => self.pci.idetim[0],
            0x21 => self.pci.idetim[1],
            _ => {
                warn!(addr, "PIIX4 IDE: 16-bit config read of unimplemented register");
                0xFFFF
            }
        }
    }

    pub fn config_read32(&mut self, addr: u8) -> u32 {
        match addr {
            0x00 => u32::from(DID) << 16 | u32::from(VID),
            0x02 => {
                u32::from(RID)
                    | u32::from(PI) << 8
                    | u32::from(SCC) << 16
                    | u32::from(BASEC) << 24
            }
            0x04..=0x07 | 0x09..=0x0F => 0x0000_0000,
            0x08 => self.pci.bmiba,
            _ => {
                warn!(addr, "PIIX4 IDE: 32-bit config read of unimplemented register");
                0xFFFF_FFFF
            }
        }
    }

    pub fn config_write8(&mut self, addr: u8, data: u8) {
        match addr {
            0x00..=0x03 | 0x09..=0x0B | 0x0E | 0x0F..=0x1F | 0x24..=0x3F => {}
            _ => {
                warn!(addr, data, "PIIX4 IDE: 8-bit config write of unimplemented register");
            }
        }
    }

    pub fn config_write16(&mut self, addr: u8, data: u16) {
        match addr {
            0x00..=0x01 | 0x05 | 0x08..=0x0F | 0x12..=0x1F => {}
            0x02 => {
                self.pci.pcicmd = data & 0x021F;
                if data & 0x04 != 0 {
                    warn!("PIIX4 IDE: bus-master function enable requested, but DMA is not modelled");
                }
            }
            0x20 => self.pci.idetim[0] = data,
            0x21 => self.pci.idetim[1] = data,
            _ => {
                warn!(addr, data, "PIIX4 IDE: 16-bit config write of unimplemented register");
            }
        }
    }

    pub fn config_write32(&mut self, addr: u8, data: u32) {
        match addr {
            0x00 | 0x04..=0x07 | 0x09..=0x0F => {}
            0x08 => self.pci.bmiba = (data & 0xFFFF_FFF0) | 0x1,
            _ => {
                warn!(addr, data, "PIIX4 IDE: 32-bit config write of unimplemented register");
            }
        }
    }

    fn channel_enabled(&self, channel: usize) -> bool {
        self.pci.idetim[channel] & IDETIM_IDE != 0
    }

    fn bus_master_claims(&self, port: u16) -> bool {
        let base = (self.pci.bmiba & 0x0000_FFF0) as u16;
        port >= base && port < base.wrapping_add(16)
    }

    pub fn bus_master_base(&self) -> u16 {
        (self.pci.bmiba & 0x0000_FFF0) as u16
    }

    // Port decode: the legacy command/control blocks per channel, then
    // the bus-master window, then the never-implemented tertiary and
    // quaternary address ranges.

    pub fn port_read8(&mut self, clk: &mut ClockBus, irq: &mut dyn IrqSink, port: u16) -> Option<u8> {
        if self.pci.pcicmd & PCICMD_IOSE == 0 {
            return None;
        }
        self.run(clk, irq, true);

        for channel in 0..2 {
            if !self.channel_enabled(channel) {
                continue;
            }
            let cmd_base = if channel == 0 { 0x1F0 } else { 0x170 };
            let ctrl_base = if channel == 0 { 0x3F4 } else { 0x374 };
            let ch = &mut self.channels[channel];
            match port {
                p if p == cmd_base + 1 => return Some(ch.error_read()),
                p if p == cmd_base + 2 => return Some(ch.sector_count_read()),
                p if p == cmd_base + 3 => return Some(ch.addr.lba_lo),
                p if p == cmd_base + 4 => return Some(ch.addr.lba_mid),
                p if p == cmd_base + 5 => return Some(ch.addr.lba_hi),
                p if p == cmd_base + 6 => return Some(ch.drive_head_read()),
                p if p == cmd_base + 7 => return Some(ch.status_read(irq)),
                p if p == ctrl_base + 2 => return Some(ch.alt_status_read()),
                p if p == ctrl_base || p == ctrl_base + 1 || p == ctrl_base + 3 => {
                    warn!(port, "byte read of an unimplemented IDE control-block port");
                    return Some(0xFF);
                }
                _ => {}
            }
        }

        if self.bus_master_claims(port) {
            warn!(port, "byte read of the inert bus-master window");
            return Some(0xFF);
        }
        if (0x1E8..=0x1EF).contains(&port) || (0x168..=0x16F).contains(&port) {
            warn!(port, "read of an unimplemented tertiary/quaternary IDE port");
            return Some(0xFF);
        }
        None
    }

    pub fn port_read16(&mut self, clk: &mut ClockBus, irq: &mut dyn IrqSink, port: u16) -> Option<u16> {
        if self.pci.pcicmd & PCICMD_IOSE == 0 {
            return None;
        }
        self.run(clk, irq, true);

        let cc_per_sector = self.timing.cc_per_sector;
        for channel in 0..2 {
            if !self.channel_enabled(channel) {
                continue;
            }
            let cmd_base = if channel == 0 { 0x1F0 } else { 0x170 };
            let ctrl_base = if channel == 0 { 0x3F4 } else { 0x374 };
            if port == cmd_base {
                return Some(self.channels[channel].data_read(irq, cc_per_sector));
            }
            if (cmd_base + 1..=cmd_base + 7).contains(&port)
                || (ctrl_base..=ctrl_base + 3).contains(&port)
            {
                warn!(port, "word read of a byte-wide IDE port");
                return Some(0xFFFF);
            }
        }

        if self.bus_master_claims(port) {
            warn!(port, "word read of the inert bus-master window");
            return Some(0xFFFF);
        }
        None
    }

    pub fn port_read32(&mut self, clk: &mut ClockBus, irq: &mut dyn IrqSink, port: u16) -> Option<u32> {
        if self.pci.pcicmd & PCICMD_IOSE == 0 {
            return None;
        }
        self.run(clk, irq, true);

        let cc_per_sector = self.timing.cc_per_sector;
        for channel in 0..2 {
            if !self.channel_enabled(channel) {
                continue;
            }
            let cmd_base = if channel == 0 { 0x1F0 } else { 0x170 };
            let ctrl_base = if channel == 0 { 0x3F4 } else { 0x374 };
            if port == cmd_base {
                let lo = u32::from(self.channels[channel].data_read(irq, cc_per_sector));
                let hi = u32::from(self.channels[channel].data_read(irq, cc_per_sector));
                return Some(lo | hi << 16);
            }
            if (cmd_base + 1..=cmd_base + 7).contains(&port)
                || (ctrl_base..=ctrl_base + 3).contains(&port)
            {
                warn!(port, "dword read of a byte-wide IDE port");
                return Some(0xFFFF_FFFF);
            }
        }

        if self.bus_master_claims(port) {
            warn!(port, "dword read of the inert bus-master window");
            return Some(0xFFFF_FFFF);
        }
        None
    }

    pub fn port_write8(
        &mut self,
        clk: &mut ClockBus,
        irq: &mut dyn IrqSink,
        port: u16,
        data: u8,
    ) -> bool {
        if self.pci.pcicmd & PCICMD_IOSE == 0 {
            return false;
        }
        self.run(clk, irq, false);

        let cc_per_sector = self.timing.cc_per_sector;
        let mut claimed = false;
        'decode: {
            for channel in 0..2 {
                if !self.channel_enabled(channel) {
                    continue;
                }
                let cmd_base = if channel == 0 { 0x1F0 } else { 0x170 };
                let ctrl_base = if channel == 0 { 0x3F4 } else { 0x374 };
                let ch = &mut self.channels[channel];
                match port {
                    p if p == cmd_base + 1 => ch.features_write(data),
                    p if p == cmd_base + 2 => ch.sector_count_write(data),
                    p if p == cmd_base + 3 => ch.addr.lba_lo = data,
                    p if p == cmd_base + 4 => ch.addr.lba_mid = data,
                    p if p == cmd_base + 5 => ch.addr.lba_hi = data,
                    p if p == cmd_base + 6 => ch.drive_head_write(irq, data),
                    p if p == cmd_base + 7 => ch.command(irq, cc_per_sector, data),
                    p if p == ctrl_base + 2 => ch.control_write(irq, data),
                    p if p == cmd_base => {
                        warn!(port, data, "byte write to the 16-bit data port");
                    }
                    p if p == ctrl_base || p == ctrl_base + 1 || p == ctrl_base + 3 => {
                        warn!(port, data, "byte write to an unimplemented IDE control-block port");
                    }
                    _ => continue,
                }
                claimed = true;
                break 'decode;
            }

            if self.bus_master_claims(port) {
                warn!(port, data, "byte write to the inert bus-master window");
                claimed = true;
            } else if (0x1E8..=0x1EF).contains(&port) || (0x168..=0x16F).contains(&port) {
                warn!(port, data, "write to an unimplemented tertiary/quaternary IDE port");
                claimed = true;
            }
        }

        self.update_cc_to_event(clk);
        claimed
    }

    pub fn port_write16(
        &mut self,
        clk: &mut ClockBus,
        irq: &mut dyn IrqSink,
        port: u16,
        data: u16,
    ) -> bool {
        if self.pci.pcicmd & PCICMD_IOSE == 0 {
            return false;
        }
        self.run(clk, irq, false);

        let cc_per_sector = self.timing.cc_per_sector;
        let mut claimed = false;
        for channel in 0..2 {
            if !self.channel_enabled(channel) {
                continue;
            }
            let cmd_base = if channel == 0 { 0x1F0 } else { 0x170 };
            let ctrl_base = if channel == 0 { 0x3F4 } else { 0x374 };
            if port == cmd_base {
                self.channels[channel].data_write(irq, cc_per_sector, data);
                claimed = true;
                break;
            }
            if (cmd_base + 1..=cmd_base + 7).contains(&port)
                || (ctrl_base..=ctrl_base + 3).contains(&port)
            {
                warn!(port, data, "word write to a byte-wide IDE port");
                claimed = true;
                break;
            }
        }
        if !claimed && self.bus_master_claims(port) {
            warn!(port, data, "word write to the inert bus-master window");
            claimed = true;
        }

        self.update_cc_to_event(clk);
        claimed
    }

    pub fn port_write32(
        &mut self,
        clk: &mut ClockBus,
        irq: &mut dyn IrqSink,
        port: u16,
        data: u32,
    ) -> bool {
        if self.pci.pcicmd & PCICMD_IOSE == 0 {
            return false;
        }
        self.run(clk, irq, false);

        let cc_per_sector = self.timing.cc_per_sector;
        let mut claimed = false;
        for channel in 0..2 {
            if !self.channel_enabled(channel) {
                continue;
            }
            let cmd_base = if channel == 0 { 0x1F0 } else { 0x170 };
            let ctrl_base = if channel == 0 { 0x3F4 } else { 0x374 };
            if port == cmd_base {
                self.channels[channel].data_write(irq, cc_per_sector, data as u16);
                self.channels[channel].data_write(irq, cc_per_sector, (data >> 16) as u16);
                claimed = true;
                break;
            }
            if (cmd_base + 1..=cmd_base + 7).contains(&port)
                || (ctrl_base..=ctrl_base + 3).contains(&port)
            {
                warn!(port, data, "dword write to a byte-wide IDE port");
                claimed = true;
                break;
            }
        }
        if !claimed && self.bus_master_claims(port) {
            warn!(port, data, "dword write to the inert bus-master window");
            claimed = true;
        }

        self.update_cc_to_event(clk);
        claimed
    }
}
