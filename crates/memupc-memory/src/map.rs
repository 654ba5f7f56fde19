use std::cell::RefCell;
use std::rc::Rc;

use crate::pam::PAM_HALF_RANGES;
use crate::{Bios, MemoryError, Pam, Ram, RamSize};

/// A PCI device claiming part of the memory space (video aperture,
/// option ROM, linear frame buffer). Reads return `None` and writes
/// return `false` when the device does not decode the address.
pub trait PciMemoryHandler {
    fn read8(&mut self, addr: u64) -> Option<u8>;
    fn read16(&mut self, addr: u64) -> Option<u16>;
    fn read32(&mut self, addr: u64) -> Option<u32>;
    fn read64(&mut self, addr: u64) -> Option<u64>;
    fn write8(&mut self, addr: u64, data: u8) -> bool;
    fn write16(&mut self, addr: u64, data: u16) -> bool;
    fn write32(&mut self, addr: u64, data: u32) -> bool;
}

/// External translation cache notified when guest code may have changed.
/// `addr_changed` returns true when the cache actually held translations
/// for the page, in which case the map drops its code bits for that page
/// so later writes stay cheap.
pub trait CodeCache {
    fn addr_changed(&mut self, addr: u64) -> bool;
    fn area_remapped(&mut self, begin: u32, end: u32);
}

const VIDEO_BASE: u64 = 0xA0000;
const LEGACY_BASE: u64 = 0xC0000;
const LEGACY_TOP_BASE: u64 = 0xF0000;
const LEGACY_END: u64 = 0x100000;

/// The physical address space seen by the CPU. Dispatch policy, top to
/// bottom of the partition table:
///
/// * below 0xA0000: RAM
/// * 0xA0000-0xBFFFF: video aperture, PCI handlers
/// * 0xC0000-0xFFFFF: PAM-steered between RAM and PCI per 16 KiB half
/// * 0x100000 up to the installed RAM size: RAM
/// * everything else: PCI handlers (BIOS windows first), open bus
///
/// Multi-byte accesses that straddle a policy boundary decompose into
/// byte accesses and reassemble little-endian.
pub struct MemoryMap {
    ram: Ram,
    pam: Pam,
    bios: Bios,
    handlers: Vec<Rc<RefCell<dyn PciMemoryHandler>>>,
    code_cache: Option<Box<dyn CodeCache>>,
    pub(crate) pcicmd: u16,
    pub(crate) qemu_compat: bool,
}

impl MemoryMap {
    pub fn new(ram_size: RamSize, bios_image: Vec<u8>) -> Result<Self, MemoryError> {
        Ok(MemoryMap {
            ram: Ram::new(ram_size),
            pam: Pam::new(),
            bios: Bios::new(bios_image)?,
            handlers: Vec::new(),
            code_cache: None,
            pcicmd: 0x0006,
            qemu_compat: false,
        })
    }

    pub fn set_qemu_compat(&mut self, enabled: bool) {
        self.qemu_compat = enabled;
    }

    pub fn add_handler(&mut self, handler: Rc<RefCell<dyn PciMemoryHandler>>) {
        self.handlers.push(handler);
    }

    pub fn set_code_cache(&mut self, cache: Box<dyn CodeCache>) {
        self.code_cache = Some(cache);
    }

    pub fn ram_size(&self) -> u64 {
        self.ram.size()
    }

    pub fn bios(&self) -> &Bios {
        &self.bios
    }

    pub fn pam(&self) -> &Pam {
        &self.pam
    }

    /// Power-on state: RAM zeroed, all PAM steering to PCI, MTXC command
    /// register at its reset value.
    pub fn reset(&mut self) {
        self.ram.clear();
        for reg in 0..7 {
            self.pam_write(reg, 0x00);
        }
        self.pcicmd = 0x0006;
        if let Some(cache) = self.code_cache.as_mut() {
            cache.area_remapped(0, u32::MAX);
        }
    }

    /// Program one PAM register; a read-steering flip invalidates any
    /// cached translations in the affected half-region.
    pub fn pam_write(&mut self, index: usize, value: u8) {
        let flips = self.pam.set_reg(index, value);
        for (half, (old, new)) in flips.into_iter().enumerate() {
            if old != new {
                if let Some((begin, end)) = PAM_HALF_RANGES[index][half] {
                    if let Some(cache) = self.code_cache.as_mut() {
                        cache.area_remapped(begin as u32, end as u32);
                    }
                    self.ram.clear_code_range(begin, end);
                }
            }
        }
    }

    #[inline]
    fn legacy_read_from_ram(&self, addr: u64) -> bool {
        if addr < LEGACY_TOP_BASE {
            let (reg, half) = Pam::slot_for(addr);
            self.pam.read_enabled(reg, half)
        } else {
            self.pam.read_enabled(0, 1)
        }
    }

    #[inline]
    fn legacy_write_to_ram(&self, addr: u64) -> bool {
        if addr < LEGACY_TOP_BASE {
            let (reg, half) = Pam::slot_for(addr);
            self.pam.write_enabled(reg, half)
        } else {
            self.pam.write_enabled(0, 1)
        }
    }

    // PCI fall-through: BIOS windows first, then each handler in order,
    // open bus last.

    fn pci_read8(&mut self, addr: u64) -> u8 {
        if let Some(v) = self.bios.read8(addr) {
            return v;
        }
        for h in &self.handlers {
            if let Some(v) = h.borrow_mut().read8(addr) {
                return v;
            }
        }
        0xFF
    }

    fn pci_read16(&mut self, addr: u64) -> u16 {
        if let Some(v) = self.bios.read16(addr) {
            return v;
        }
        for h in &self.handlers {
            if let Some(v) = h.borrow_mut().read16(addr) {
                return v;
            }
        }
        0xFFFF
    }

    fn pci_read32(&mut self, addr: u64) -> u32 {
        if let Some(v) = self.bios.read32(addr) {
            return v;
        }
        for h in &self.handlers {
            if let Some(v) = h.borrow_mut().read32(addr) {
                return v;
            }
        }
        0xFFFF_FFFF
    }

    fn pci_read64(&mut self, addr: u64) -> u64 {
        if let Some(v) = self.bios.read64(addr) {
            return v;
        }
        for h in &self.handlers {
            if let Some(v) = h.borrow_mut().read64(addr) {
                return v;
            }
        }
        u64::MAX
    }

    fn pci_write8(&mut self, addr: u64, data: u8) {
        for h in &self.handlers {
            if h.borrow_mut().write8(addr, data) {
                return;
            }
        }
    }

    fn pci_write16(&mut self, addr: u64, data: u16) {
        for h in &self.handlers {
            if h.borrow_mut().write16(addr, data) {
                return;
            }
        }
    }

    fn pci_write32(&mut self, addr: u64, data: u32) {
        for h in &self.handlers {
            if h.borrow_mut().write32(addr, data) {
                return;
            }
        }
    }

    // Reads.

    pub fn read_u8(&mut self, addr: u64) -> u8 {
        if addr < VIDEO_BASE {
            self.ram.read_u8(addr)
        } else if addr < LEGACY_BASE {
            self.pci_read8(addr)
        } else if addr < LEGACY_END {
            if self.legacy_read_from_ram(addr) {
                self.ram.read_u8(addr)
            } else {
                self.pci_read8(addr)
            }
        } else if addr < self.ram.size() {
            self.ram.read_u8(addr)
        } else {
            self.pci_read8(addr)
        }
    }

    /// Instruction fetch: identical steering to `read_u8`, but RAM-served
    /// bytes mark their 16-byte line as holding translated code.
    pub fn fetch_u8(&mut self, addr: u64) -> u8 {
        if addr < VIDEO_BASE {
            self.ram.mark_code(addr);
            self.ram.read_u8(addr)
        } else if addr < LEGACY_BASE {
            self.pci_read8(addr)
        } else if addr < LEGACY_END {
            if self.legacy_read_from_ram(addr) {
                self.ram.mark_code(addr);
                self.ram.read_u8(addr)
            } else {
                self.pci_read8(addr)
            }
        } else if addr < self.ram.size() {
            self.ram.mark_code(addr);
            self.ram.read_u8(addr)
        } else {
            self.pci_read8(addr)
        }
    }

    fn read_u16_bytes(&mut self, addr: u64) -> u16 {
        u16::from_le_bytes([self.read_u8(addr), self.read_u8(addr + 1)])
    }

    pub fn read_u16(&mut self, addr: u64) -> u16 {
        if addr < VIDEO_BASE {
            if addr != VIDEO_BASE - 1 {
                self.ram.read_u16(addr)
            } else {
                self.read_u16_bytes(addr)
            }
        } else if addr < LEGACY_BASE {
            if addr != LEGACY_BASE - 1 {
                self.pci_read16(addr)
            } else {
                self.read_u16_bytes(addr)
            }
        } else if addr < LEGACY_END {
            if addr < LEGACY_TOP_BASE {
                if addr & 0x3FFF != 0x3FFF {
                    if self.legacy_read_from_ram(addr) {
                        self.ram.read_u16(addr)
                    } else {
                        self.pci_read16(addr)
                    }
                } else {
                    self.read_u16_bytes(addr)
                }
            } else if addr != LEGACY_END - 1 {
                if self.legacy_read_from_ram(addr) {
                    self.ram.read_u16(addr)
                } else {
                    self.pci_read16(addr)
                }
            } else {
                self.read_u16_bytes(addr)
            }
        } else if addr < self.ram.size() {
            if addr != self.ram.size() - 1 {
                self.ram.read_u16(addr)
            } else {
                self.read_u16_bytes(addr)
            }
        } else {
            self.pci_read16(addr)
        }
    }

    fn read_u32_halves(&mut self, addr: u64) -> u32 {
        let lo = self.read_u16(addr) as u32;
        let hi = self.read_u16(addr + 2) as u32;
        (hi << 16) | lo
    }

    pub fn read_u32(&mut self, addr: u64) -> u32 {
        if addr < VIDEO_BASE {
            if addr < VIDEO_BASE - 3 {
                self.ram.read_u32(addr)
            } else {
                self.read_u32_halves(addr)
            }
        } else if addr < LEGACY_BASE {
            if addr < LEGACY_BASE - 3 {
                self.pci_read32(addr)
            } else {
                self.read_u32_halves(addr)
            }
        } else if addr < LEGACY_END {
            if addr < LEGACY_TOP_BASE {
                if addr & 0x3FFF < 0x3FFD {
                    if self.legacy_read_from_ram(addr) {
                        self.ram.read_u32(addr)
                    } else {
                        self.pci_read32(addr)
                    }
                } else {
                    self.read_u32_halves(addr)
                }
            } else if addr < LEGACY_END - 3 {
                if self.legacy_read_from_ram(addr) {
                    self.ram.read_u32(addr)
                } else {
                    self.pci_read32(addr)
                }
            } else {
                self.read_u32_halves(addr)
            }
        } else if addr < self.ram.size() {
            if addr < self.ram.size() - 3 {
                self.ram.read_u32(addr)
            } else {
                self.read_u32_halves(addr)
            }
        } else {
            self.pci_read32(addr)
        }
    }

    pub fn read_u64(&mut self, addr: u64) -> u64 {
        if addr <= VIDEO_BASE - 8 || (addr >= LEGACY_END && addr <= self.ram.size() - 8) {
            self.ram.read_u64(addr)
        } else if addr >= self.ram.size().max(LEGACY_END) {
            self.pci_read64(addr)
        } else {
            let lo = self.read_u32(addr) as u64;
            let hi = self.read_u32(addr + 4) as u64;
            (hi << 32) | lo
        }
    }

    // Writes. RAM-bound stores drop translated code covering the target
    // bytes before mutating them.

    fn note_ram_write(&mut self, addr: u64, len: u64) {
        for a in addr..addr + len {
            if self.ram.line_is_code(a) {
                let invalidated = match self.code_cache.as_mut() {
                    Some(cache) => cache.addr_changed(a),
                    None => true,
                };
                if invalidated {
                    self.ram.clear_code_page(a);
                }
            }
        }
    }

    fn ram_write_u8(&mut self, addr: u64, data: u8) {
        self.note_ram_write(addr, 1);
        self.ram.write_u8(addr, data);
    }

    fn ram_write_u16(&mut self, addr: u64, data: u16) {
        self.note_ram_write(addr, 2);
        self.ram.write_u16(addr, data);
    }

    fn ram_write_u32(&mut self, addr: u64, data: u32) {
        self.note_ram_write(addr, 4);
        self.ram.write_u32(addr, data);
    }

    pub fn write_u8(&mut self, addr: u64, data: u8) {
        if addr < VIDEO_BASE {
            self.ram_write_u8(addr, data);
        } else if addr < LEGACY_BASE {
            self.pci_write8(addr, data);
        } else if addr < LEGACY_END {
            if self.legacy_write_to_ram(addr) {
                self.ram_write_u8(addr, data);
            } else {
                self.pci_write8(addr, data);
            }
        } else if addr < self.ram.size() {
            self.ram_write_u8(addr, data);
        } else {
            self.pci_write8(addr, data);
        }
    }

    fn write_u16_bytes(&mut self, addr: u64, data: u16) {
        let [b0, b1] = data.to_le_bytes();
        self.write_u8(addr, b0);
        self.write_u8(addr + 1, b1);
    }

    pub fn write_u16(&mut self, addr: u64, data: u16) {
        if addr < VIDEO_BASE {
            if addr != VIDEO_BASE - 1 {
                self.ram_write_u16(addr, data);
            } else {
                self.write_u16_bytes(addr, data);
            }
        } else if addr < LEGACY_BASE {
            if addr != LEGACY_BASE - 1 {
                self.pci_write16(addr, data);
            } else {
                self.write_u16_bytes(addr, data);
            }
        } else if addr < LEGACY_END {
            if addr < LEGACY_TOP_BASE {
                if addr & 0x3FFF != 0x3FFF {
                    if self.legacy_write_to_ram(addr) {
                        self.ram_write_u16(addr, data);
                    } else {
                        self.pci_write16(addr, data);
                    }
                } else {
                    self.write_u16_bytes(addr, data);
                }
            } else if addr != LEGACY_END - 1 {
                if self.legacy_write_to_ram(addr) {
                    self.ram_write_u16(addr, data);
                } else {
                    self.pci_write16(addr, data);
                }
            } else {
                self.write_u16_bytes(addr, data);
            }
        } else if addr < self.ram.size() {
            if addr != self.ram.size() - 1 {
                self.ram_write_u16(addr, data);
            } else {
                self.write_u16_bytes(addr, data);
            }
        } else {
            self.pci_write16(addr, data);
        }
    }

    fn write_u32_halves(&mut self, addr: u64, data: u32) {
        self.write_u16(addr, data as u16);
        self.write_u16(addr + 2, (data >> 16) as u16);
    }

    pub fn write_u32(&mut self, addr: u64, data: u32) {
        if addr < VIDEO_BASE {
            if addr < VIDEO_BASE - 3 {
                self.ram_write_u32(addr, data);
            } else {
                self.write_u32_halves(addr, data);
            }
        } else if addr < LEGACY_BASE {
            if addr < LEGACY_BASE - 3 {
                self.pci_write32(addr, data);
            } else {
                self.write_u32_halves(addr, data);
            }
        } else if addr < LEGACY_END {
            if addr < LEGACY_TOP_BASE {
                if addr & 0x3FFF < 0x3FFD {
                    if self.legacy_write_to_ram(addr) {
                        self.ram_write_u32(addr, data);
                    } else {
                        self.pci_write32(addr, data);
                    }
                } else {
                    self.write_u32_halves(addr, data);
                }
            } else if addr < LEGACY_END - 3 {
                if self.legacy_write_to_ram(addr) {
                    self.ram_write_u32(addr, data);
                } else {
                    self.pci_write32(addr, data);
                }
            } else {
                self.write_u32_halves(addr, data);
            }
        } else if addr < self.ram.size() {
            if addr < self.ram.size() - 3 {
                self.ram_write_u32(addr, data);
            } else {
                self.write_u32_halves(addr, data);
            }
        } else {
            self.pci_write32(addr, data);
        }
    }
}
