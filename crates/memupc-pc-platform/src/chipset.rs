//! PIIX4 functions 0, 2 and 3 (ISA bridge, USB host controller, power
//! management) plus the miscellaneous bridge state: port 0x92, the
//! reset control register and the ACPI power-management timer.

use memupc_platform::ClockBus;
use tracing::{debug, warn};

const PCICMD_IOSE: u16 = 0x0001;

/// PM timer clock, Hz.
const PM_TIMER_HZ: i64 = 3_579_545;

// Shared register-file plumbing for the three functions: vendor, device,
// class and header type are fixed; PCICMD keeps its writable bits.

macro_rules! common_config_read8 {
    ($addr:expr, $did:expr, $hedt:expr, $basec:expr, $scc:expr, $pi:expr) => {
        match $addr {
            0x00..=0x01 => Some(0x8086u16.to_le_bytes()[$addr as usize & 1]),
            0x02..=0x03 => Some($did.to_le_bytes()[$addr as usize & 1]),
            0x08 => Some(0x00),
            0x09 => Some($pi),
            0x0A => Some($scc),
            0x0B => Some($basec),
            0x0E => Some($hedt),
            _ => None,
        }
    };
}

/// Function 0: the PCI-to-ISA bridge. Only the identification registers
/// and the reset-control latch matter to the simulated chipset; the
/// legacy decode knobs are accepted and ignored.
pub struct IsaBridge {
    pcicmd: u16,
    /// Reset control register (I/O port 0xCF9); bit 2 is the trigger.
    rc: u8,
}

const ISA_DID: u16 = 0x7110;

impl IsaBridge {
    pub fn new() -> Self {
        IsaBridge { pcicmd: 0x0007, rc: 0x00 }
    }

    pub fn reset(&mut self) {
        *self = IsaBridge::new();
    }

    /// Reset control write. Returns true when bit 2 rose, which hard
    /// resets the platform; the latch clears as part of that reset.
    pub fn reset_control_write(&mut self, data: u8) -> bool {
        let rising = data & 0x04 != 0 && self.rc & 0x04 == 0;
        self.rc = data;
        rising
    }

    pub fn config_read8(&mut self, addr: u8) -> u8 {
        // Multifunction header: the BIOS probes functions 1-3 behind it.
        if let Some(v) = common_config_read8!(addr, ISA_DID, 0x80, 0x06, 0x01, 0x00) {
            return v;
        }
        match addr {
            0x0F..=0x3F | 0x4C..=0x7F => 0x00,
            _ => {
                warn!(addr, "PIIX4 ISA: 8-bit config read of unimplemented register");
                0xFF
            }
        }
    }

    pub fn config_read16(&mut self, addr: u8) -> u16 {
        match addr {
            0x00 => 0x8086,
            0x01 => ISA_DID,
            0x02 => self.pcicmd,
            0x04 => 0x0000,
            0x05 => 0x0601,
            0x08..=0x1F => 0x0000,
            _ => {
                warn!(addr, "PIIX4 ISA: 16-bit config read of unimplemented register");
                0xFFFF
            }
        }
    }

    pub fn config_read32(&mut self, addr: u8) -> u32 {
        match addr {
            0x00 => (u32::from(ISA_DID) << 16) | 0x8086,
            0x02 => 0x0601_0000,
            0x04..=0x0F => 0x0000_0000,
            _ => {
                warn!(addr, "PIIX4 ISA: 32-bit config read of unimplemented register");
                0xFFFF_FFFF
            }
        }
    }

    pub fn config_write8(&mut self, addr: u8, data: u8) {
        match addr {
            0x00..=0x0E | 0x0F..=0x3F => {}
            0x4C..=0x7F => {
                debug!(addr, data, "PIIX4 ISA: legacy decode register accepted and ignored");
            }
            _ => {
                warn!(addr, data, "PIIX4 ISA: 8-bit config write of unimplemented register");
            }
        }
    }

    pub fn config_write16(&mut self, addr: u8, data: u16) {
        match addr {
            0x02 => self.pcicmd = (data & 0x0008) | 0x0007,
            0x00..=0x01 | 0x04..=0x1F => {}
            _ => {
                warn!(addr, data, "PIIX4 ISA: 16-bit config write of unimplemented register");
            }
        }
    }

    pub fn config_write32(&mut self, addr: u8, data: u32) {
        match addr {
            0x00..=0x0F => {}
            _ => {
                warn!(addr, data, "PIIX4 ISA: 32-bit config write of unimplemented register");
            }
        }
    }
}

impl Default for IsaBridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Function 2: the UHCI USB host controller. Only the register file is
/// modelled, just enough for BIOS probes; transfers never run.
pub struct UsbController {
    pcicmd: u16,
    intln: u8,
    usbba: u32,
    usbcmd: u16,
    usbintr: u16,
    frnum: u16,
    flbaseadd: u32,
    sofmod: u8,
}

const USB_DID: u16 = 0x7112;
const USB_INTPN: u8 = 0x04;

impl UsbController {
    pub fn new() -> Self {
        UsbController {
            pcicmd: 0x0000,
            intln: 0x00,
            usbba: 0x0000_0001,
            usbcmd: 0x0000,
            usbintr: 0x0000,
            frnum: 0x0000,
            flbaseadd: 0x0000_0000,
            sofmod: 0x40,
        }
    }

    pub fn reset(&mut self) {
        *self = UsbController::new();
    }

    pub fn config_read8(&mut self, addr: u8) -> u8 {
        if let Some(v) = common_config_read8!(addr, USB_DID, 0x00, 0x0C, 0x03, 0x00) {
            return v;
        }
        match addr {
            0x0F..=0x1F | 0x24..=0x3B => 0x00,
            0x3C => self.intln,
            0x3D => USB_INTPN,
            _ => {
                warn!(addr, "PIIX4 USB: 8-bit config read of unimplemented register");
                0xFF
            }
        }
    }

    pub fn config_read16(&mut self, addr: u8) -> u16 {
        match addr {
            0x00 => 0x8086,
            0x01 => USB_DID,
            0x02 => self.pcicmd,
            0x04 => 0x0000,
            0x05 => 0x0C03,
            0x08..=0x0F | 0x12..=0x1D => 0x0000,
            _ => {
                warn!(addr, "PIIX4 USB: 16-bit config read of unimplemented register");
                0xFFFF
            }
        }
    }

    pub fn config_read32(&mut self, addr: u8) -> u32 {
        match addr {
            0x00 => (u32::from(USB_DID) << 16) | 0x8086,
            0x02 => 0x0C03_0000,
            0x04..=0x07 => 0x0000_0000,
            0x08 => self.usbba,
            0x09..=0x0E => 0x0000_0000,
            _ => {
                warn!(addr, "PIIX4 USB: 32-bit config read of unimplemented register");
                0xFFFF_FFFF
            }
        }
    }

    pub fn config_write8(&mut self, addr: u8, data: u8) {
        match addr {
            0x00..=0x0E | 0x0F..=0x1F | 0x24..=0x3B | 0x3D => {}
            0x3C => self.intln = data,
            0x60 => {
                debug!(data, "PIIX4 USB: LEGSUP write accepted");
            }
            _ => {
                warn!(addr, data, "PIIX4 USB: 8-bit config write of unimplemented register");
            }
        }
    }

    pub fn config_write16(&mut self, addr: u8, data: u16) {
        match addr {
            0x02 => self.pcicmd = data & 0x021F,
            0x00..=0x01 | 0x04..=0x1D => {}
            _ => {
                warn!(addr, data, "PIIX4 USB: 16-bit config write of unimplemented register");
            }
        }
    }

    pub fn config_write32(&mut self, addr: u8, data: u32) {
        match addr {
            0x00 | 0x04..=0x07 | 0x09..=0x0E => {}
            0x08 => self.usbba = (data & 0xFFFF_FFE0) | 0x1,
            _ => {
                warn!(addr, data, "PIIX4 USB: 32-bit config write of unimplemented register");
            }
        }
    }

    fn window(&self, port: u16) -> Option<u16> {
        if self.pcicmd & PCICMD_IOSE == 0 {
            return None;
        }
        let base = (self.usbba & 0x0000_FFE0) as u16;
        if port >= base && port < base.wrapping_add(0x20) {
            Some(port - base)
        } else {
            None
        }
    }

    pub fn port_read8(&mut self, port: u16) -> Option<u8> {
        let offset = self.window(port)?;
        warn!(port, offset, "byte read of an unimplemented USB register");
        Some(0xFF)
    }

    pub fn port_read16(&mut self, port: u16) -> Option<u16> {
        let offset = self.window(port)?;
        Some(match offset {
            0x00 => self.usbcmd,
            0x04 => self.usbintr,
            0x06 => self.frnum,
            // Port status/control: reserved bit 7 reads as one, no
            // device connected.
            0x10 | 0x12 => 0x0080,
            _ => {
                warn!(port, offset, "word read of an unimplemented USB register");
                0xFFFF
            }
        })
    }

    pub fn port_read32(&mut self, port: u16) -> Option<u32> {
        let offset = self.window(port)?;
        Some(match offset {
            0x08 => self.flbaseadd,
            _ => {
                warn!(port, offset, "dword read of an unimplemented USB register");
                0xFFFF_FFFF
            }
        })
    }

    pub fn port_write8(&mut self, port: u16, data: u8) -> bool {
        let Some(offset) = self.window(port) else { return false };
        match offset {
            0x0C => self.sofmod = data,
            _ => {
                warn!(port, offset, data, "byte write to an unimplemented USB register");
            }
        }
        true
    }

    pub fn port_write16(&mut self, port: u16, data: u16) -> bool {
        let Some(offset) = self.window(port) else { return false };
        match offset {
            0x00 => self.usbcmd = data,
            0x04 => self.usbintr = data,
            0x06 => self.frnum = data & 0x07FF,
            _ => {
                warn!(port, offset, data, "word write to an unimplemented USB register");
            }
        }
        true
    }

    pub fn port_write32(&mut self, port: u16, data: u32) -> bool {
        let Some(offset) = self.window(port) else { return false };
        match offset {
            0x08 => self.flbaseadd = data & 0xFFFF_F000,
            _ => {
                warn!(port, offset, data, "dword write to an unimplemented USB register");
            }
        }
        true
    }
}

impl Default for UsbController {
    fn default() -> Self {
        Self::new()
    }
}

/// Free-running 24-bit ACPI timer clocked at 3.579545 MHz, derived from
/// the CPU cycle counter. It produces no events of its own.
pub struct PmTimer {
    hz: i64,
    cc_used: i64,
    total_cc: i64,
}

impl PmTimer {
    pub fn new(hz: i64) -> Self {
        PmTimer { hz, cc_used: 0, total_cc: 0 }
    }

    fn sync(&mut self, clk: &ClockBus) {
        let cc = clk.cycles() - self.cc_used;
        if cc > 0 {
            self.total_cc += cc;
            self.cc_used += cc;
        }
    }

    pub fn value(&mut self, clk: &ClockBus) -> u32 {
        self.sync(clk);
        ((self.total_cc as i128 * PM_TIMER_HZ as i128 / self.hz as i128) & 0xFF_FFFF) as u32
    }

    pub fn end_iter(&mut self, clk: &ClockBus) {
        self.sync(clk);
        self.cc_used = 0;
    }

    pub fn reset(&mut self) {
        self.cc_used = 0;
        self.total_cc = 0;
    }
}

/// Function 3: power management and the SMBus host. The register files
/// decode; the windows exist so BIOS probes land somewhere defined, and
/// the PM timer is readable at PMBA+0x08.
pub struct PowerManagement {
    pcicmd: u16,
    intln: u8,
    pmba: u16,
    pmiose: bool,
    smbba: u16,
    smbhstcfg: u8,
    smbus_enabled: bool,
    pub timer: PmTimer,
}

const PM_DID: u16 = 0x7113;
const PM_INTPN: u8 = 0x01;

impl PowerManagement {
    pub fn new(hz: i64) -> Self {
        PowerManagement {
            pcicmd: 0x0000,
            intln: 0x00,
            pmba: 0x0000,
            pmiose: false,
            smbba: 0x0000,
            smbhstcfg: 0x00,
            smbus_enabled: false,
            timer: PmTimer::new(hz),
        }
    }

    pub fn reset(&mut self) {
        let hz = self.timer.hz;
        *self = PowerManagement::new(hz);
    }

    fn set_smbhstcfg(&mut self, data: u8) {
        self.smbhstcfg = data;
        self.smbus_enabled = data & 0x01 != 0;
        if self.smbus_enabled && data & 0x0E != 0 && data & 0x0E != 0x08 {
            warn!(data, "SMBus host interrupt selection is neither SMI nor IRQ9");
        }
    }

    pub fn config_read8(&mut self, addr: u8) -> u8 {
        if let Some(v) = common_config_read8!(addr, PM_DID, 0x00, 0x06, 0x80, 0x00) {
            return v;
        }
        match addr {
            0x0F..=0x3B => 0x00,
            0x3C => self.intln,
            0x3D => PM_INTPN,
            0x80 => u8::from(self.pmiose),
            0xD2 => self.smbhstcfg,
            _ => {
                warn!(addr, "PIIX4 PM: 8-bit config read of unimplemented register");
                0xFF
            }
        }
    }

    pub fn config_read16(&mut self, addr: u8) -> u16 {
        match addr {
            0x00 => 0x8086,
            0x01 => PM_DID,
            0x02 => self.pcicmd,
            0x04 => 0x0000,
            0x05 => 0x0680,
            0x08..=0x1D => 0x0000,
            _ => {
                warn!(addr, "PIIX4 PM: 16-bit config read of unimplemented register");
                0xFFFF
            }
        }
    }

    pub fn config_read32(&mut self, addr: u8) -> u32 {
        match addr {
            0x00 => (u32::from(PM_DID) << 16) | 0x8086,
            0x02 => 0x0680_0000,
            0x04..=0x0E => 0x0000_0000,
            0x10 => u32::from(self.pmba) | 0x1,
            0x24 => u32::from(self.smbba) | 0x1,
            _ => {
                warn!(addr, "PIIX4 PM: 32-bit config read of unimplemented register");
                0xFFFF_FFFF
            }
        }
    }

    pub fn config_write8(&mut self, addr: u8, data: u8) {
        match addr {
            0x00..=0x0E | 0x0F..=0x3B | 0x3D => {}
            0x3C => self.intln = data,
            0x80 => self.pmiose = data & 0x01 != 0,
            0xD2 => self.set_smbhstcfg(data),
            _ => {
                warn!(addr, data, "PIIX4 PM: 8-bit config write of unimplemented register");
            }
        }
    }

    pub fn config_write16(&mut self, addr: u8, data: u16) {
        match addr {
            0x02 => self.pcicmd = data & 0x021F,
            0x00..=0x01 | 0x04..=0x1D => {}
            _ => {
                warn!(addr, data, "PIIX4 PM: 16-bit config write of unimplemented register");
            }
        }
    }

    pub fn config_write32(&mut self, addr: u8, data: u32) {
        match addr {
            0x00 | 0x04..=0x0E => {}
            0x10 => self.pmba = (data & 0x0000_FFC0) as u16,
            0x24 => self.smbba = (data & 0x0000_FFF0) as u16,
            _ => {
                warn!(addr, data, "PIIX4 PM: 32-bit config write of unimplemented register");
            }
        }
    }

    fn pm_window(&self, port: u16) -> Option<u16> {
        if !self.pmiose {
            return None;
        }
        if port >= self.pmba && port < self.pmba.wrapping_add(0x38) {
            Some(port - self.pmba)
        } else {
            None
        }
    }

    fn smbus_window(&self, port: u16) -> Option<u16> {
        if self.pcicmd & PCICMD_IOSE == 0 {
            return None;
        }
        if port >= self.smbba && port < self.smbba.wrapping_add(0x0E) {
            Some(port - self.smbba)
        } else {
            None
        }
    }

    pub fn port_read8(&mut self, port: u16) -> Option<u8> {
        if let Some(offset) = self.pm_window(port) {
            warn!(port, offset, "byte read of an unimplemented power-management register");
            return Some(0xFF);
        }
        if let Some(offset) = self.smbus_window(port) {
            warn!(port, offset, "byte read of an unimplemented SMBus register");
            return Some(0xFF);
        }
        None
    }

    pub fn port_read16(&mut self, port: u16) -> Option<u16> {
        if let Some(offset) = self.pm_window(port) {
            warn!(port, offset, "word read of an unimplemented power-management register");
            return Some(0xFFFF);
        }
        if let Some(offset) = self.smbus_window(port) {
            warn!(port, offset, "word read of an unimplemented SMBus register");
            return Some(0xFFFF);
        }
        None
    }

    pub fn port_read32(&mut self, clk: &ClockBus, port: u16) -> Option<u32> {
        if let Some(offset) = self.pm_window(port) {
            return Some(match offset {
                // PMTMR.
                0x08 => self.timer.value(clk),
                _ => {
                    warn!(port, offset, "dword read of an unimplemented power-management register");
                    0xFFFF_FFFF
                }
            });
        }
        if let Some(offset) = self.smbus_window(port) {
            warn!(port, offset, "dword read of an unimplemented SMBus register");
            return Some(0xFFFF_FFFF);
        }
        None
    }

    pub fn port_write8(&mut self, port: u16, data: u8) -> bool {
        if let Some(offset) = self.pm_window(port) {
            warn!(port, offset, data, "byte write to an unimplemented power-management register");
            return true;
        }
        if let Some(offset) = self.smbus_window(port) {
            warn!(port, offset, data, "byte write to an unimplemented SMBus register");
            return true;
        }
        false
    }

    pub fn port_write16(&mut self, port: u16, data: u16) -> bool {
        if let Some(offset) = self.pm_window(port) {
            warn!(port, offset, data, "word write to an unimplemented power-management register");
            return true;
        }
        if let Some(offset) = self.smbus_window(port) {
            warn!(port, offset, data, "word write to an unimplemented SMBus register");
            return true;
        }
        false
    }

    pub fn port_write32(&mut self, port: u16, data: u32) -> bool {
        if let Some(offset) = self.pm_window(port) {
            warn!(port, offset, data, "dword write to an unimplemented power-management register");
            return true;
        }
        if let Some(offset) = self.smbus_window(port) {
            warn!(port, offset, data, "dword write to an unimplemented SMBus register");
            return true;
        }
        false
    }
}

/// South-bridge odds and ends that live outside the numbered functions.
pub struct Chipset {
    pub isa: IsaBridge,
    pub usb: UsbController,
    pub pm: PowerManagement,
    /// Port 0x92 bit 1.
    pub(crate) fast_a20: bool,
    /// Port 0x61 bit 1: speaker data enable.
    pub(crate) speaker_data: bool,
    /// Timer channel 2 OUT, the speaker input.
    pub(crate) speaker_out: bool,
}

impl Chipset {
    pub fn new(hz: i64) -> Self {
        Chipset {
            isa: IsaBridge::new(),
            usb: UsbController::new(),
            pm: PowerManagement::new(hz),
            fast_a20: false,
            speaker_data: false,
            speaker_out: false,
        }
    }

    pub fn reset(&mut self) {
        self.isa.reset();
        self.usb.reset();
        self.pm.reset();
        self.fast_a20 = false;
        self.speaker_data = false;
        self.speaker_out = false;
    }

    pub fn a20_enabled(&self) -> bool {
        self.fast_a20
    }

    pub fn speaker_output(&self) -> bool {
        self.speaker_data && self.speaker_out
    }

    pub(crate) fn port_92_read(&self) -> u8 {
        if self.fast_a20 {
            0x02
        } else {
            0x00
        }
    }

    pub(crate) fn port_92_write(&mut self, data: u8) {
        self.fast_a20 = data & 0x02 != 0;
        if data & 0x01 != 0 {
            debug!("port 0x92 fast-init bit set; CPU reset via 0x92 is not wired");
        }
    }
}
