use std::cell::RefCell;
use std::rc::Rc;

use memupc_memory::{CodeCache, MemoryMap, PciMemoryHandler, RamSize};

const BIOS_SIZE: usize = 256 * 1024;

fn bios_image() -> Vec<u8> {
    // Fill with a position-dependent pattern so window aliasing is
    // visible.
    (0..BIOS_SIZE).map(|i| (i / 64) as u8 ^ (i as u8)).collect()
}

fn map() -> MemoryMap {
    MemoryMap::new(RamSize::M4, bios_image()).unwrap()
}

#[test]
fn ram_reads_back_below_the_video_aperture() {
    let mut mem = map();
    mem.write_u32(0x1234, 0xDEAD_BEEF);
    assert_eq!(mem.read_u32(0x1234), 0xDEAD_BEEF);
    assert_eq!(mem.read_u8(0x1234), 0xEF);
    assert_eq!(mem.read_u16(0x1236), 0xDEAD);
}

#[test]
fn unclaimed_video_aperture_is_open_bus() {
    let mut mem = map();
    mem.write_u32(0xA0000, 0x1122_3344);
    assert_eq!(mem.read_u8(0xA0000), 0xFF);
    assert_eq!(mem.read_u16(0xB0000), 0xFFFF);
    assert_eq!(mem.read_u32(0xB8000), 0xFFFF_FFFF);
}

#[test]
fn pam_round_trip_and_bios_fallback() {
    let mut mem = map();

    // Steer 0xF0000-0xFFFFF to RAM for both reads and writes.
    mem.config_write8(0x59, 0x30);
    mem.write_u8(0xF0000, 0x55);
    mem.write_u8(0xFFFF0, 0xAA);
    assert_eq!(mem.read_u8(0xF0000), 0x55);
    assert_eq!(mem.read_u8(0xFFFF0), 0xAA);

    // Read steering back to PCI: the BIOS byte shows through while the
    // RAM copy stays writable underneath.
    mem.config_write8(0x59, 0x20);
    let expected = bios_image()[BIOS_SIZE - 128 * 1024 + 0xFFF0];
    assert_eq!(mem.read_u8(0xFFFF0), expected);

    // Steering reads back on shows the RAM copy again.
    mem.config_write8(0x59, 0x30);
    assert_eq!(mem.read_u8(0xFFFF0), 0xAA);
}

#[test]
fn pam_halves_are_independent() {
    let mut mem = map();

    // 0xC4000-0xC7FFF (register 1, high half) read/write to RAM; the
    // low half stays on PCI.
    mem.config_write8(0x5A, 0x30);
    mem.write_u8(0xC4000, 0x12);
    mem.write_u8(0xC0000, 0x34);
    assert_eq!(mem.read_u8(0xC4000), 0x12);
    // Low half: no option ROM claims it, so reads are open bus.
    assert_eq!(mem.read_u8(0xC0000), 0xFF);
}

#[test]
fn bios_top_128k_is_visible_in_all_windows() {
    let mut mem = map();
    let image = bios_image();
    let base = BIOS_SIZE - 128 * 1024;

    assert_eq!(mem.read_u8(0xE0000), image[base]);
    assert_eq!(mem.read_u8(0xFFFFF), image[BIOS_SIZE - 1]);
    assert_eq!(mem.read_u8(0xFFFE0000), image[base]);
    assert_eq!(mem.read_u8(0xFFFF_FFFF), image[BIOS_SIZE - 1]);

    // 256 KiB image inside the 512 KiB window: the bottom half reads
    // all-ones, the top half is the image.
    assert_eq!(mem.read_u8(0xFFF8_0000), 0xFF);
    assert_eq!(mem.read_u8(0xFFFC_0000), image[0]);
}

#[test]
fn mtxc_identification_registers() {
    let mut mem = map();
    assert_eq!(mem.config_read32(0x00), 0x7100_8086);
    assert_eq!(mem.config_read16(0x02), 0x0006);
    assert_eq!(mem.config_read8(0x0B), 0x00);

    // Without QEMU compatibility the subsystem IDs are not decoded.
    mem.set_qemu_compat(true);
    assert_eq!(mem.config_read16(0x16), 0x1AF4);
    assert_eq!(mem.config_read16(0x17), 0x1100);
}

#[test]
fn reads_above_ram_fall_through_to_open_bus() {
    let mut mem = map();
    let size = mem.ram_size();
    assert_eq!(mem.read_u8(size), 0xFF);
    assert_eq!(mem.read_u32(0x1000_0000), 0xFFFF_FFFF);
    assert_eq!(mem.read_u64(0x1000_0000), u64::MAX);
}

#[test]
fn straddling_reads_decompose_little_endian() {
    let mut mem = map();
    // Last RAM word before the video aperture and a neighbouring
    // open-bus byte.
    mem.write_u8(0x9FFFF, 0xAB);
    assert_eq!(mem.read_u16(0x9FFFF), 0xFFAB);
    assert_eq!(mem.read_u32(0x9FFFD), 0xFFAB_0000 | u32::from(mem.read_u16(0x9FFFD)));

    // RAM-end straddle.
    let size = mem.ram_size();
    mem.write_u8(size - 1, 0x5A);
    assert_eq!(mem.read_u16(size - 1), 0xFF5A);
    assert_eq!(mem.read_u32(size - 2), 0xFFFF_5A00 | u32::from(mem.read_u8(size - 2)));
}

struct Aperture {
    base: u64,
    bytes: Vec<u8>,
}

impl PciMemoryHandler for Aperture {
    fn read8(&mut self, addr: u64) -> Option<u8> {
        let off = addr.checked_sub(self.base)?;
        self.bytes.get(off as usize).copied()
    }

    fn read16(&mut self, addr: u64) -> Option<u16> {
        let lo = self.read8(addr)?;
        Some(u16::from_le_bytes([lo, self.read8(addr + 1).unwrap_or(0xFF)]))
    }

    fn read32(&mut self, addr: u64) -> Option<u32> {
        let lo = self.read16(addr)?;
        Some(u32::from(self.read16(addr + 2).unwrap_or(0xFFFF)) << 16 | u32::from(lo))
    }

    fn read64(&mut self, addr: u64) -> Option<u64> {
        let lo = self.read32(addr)?;
        Some(u64::from(self.read32(addr + 4).unwrap_or(0xFFFF_FFFF)) << 32 | u64::from(lo))
    }

    fn write8(&mut self, addr: u64, data: u8) -> bool {
        match addr.checked_sub(self.base).and_then(|o| self.bytes.get_mut(o as usize)) {
            Some(slot) => {
                *slot = data;
                true
            }
            None => false,
        }
    }

    fn write16(&mut self, addr: u64, data: u16) -> bool {
        let [lo, hi] = data.to_le_bytes();
        self.write8(addr, lo) && self.write8(addr + 1, hi)
    }

    fn write32(&mut self, addr: u64, data: u32) -> bool {
        self.write16(addr, data as u16) && self.write16(addr + 2, (data >> 16) as u16)
    }
}

#[test]
fn handlers_claim_the_video_aperture() {
    let mut mem = map();
    let aperture = Rc::new(RefCell::new(Aperture {
        base: 0xA0000,
        bytes: vec![0; 0x20000],
    }));
    mem.add_handler(aperture.clone());

    mem.write_u16(0xA0010, 0xBEEF);
    assert_eq!(mem.read_u16(0xA0010), 0xBEEF);
    assert_eq!(aperture.borrow().bytes[0x10], 0xEF);

    // Outside the aperture nothing claims the access.
    assert_eq!(mem.read_u8(0xD0000), 0xFF);
}

#[derive(Default)]
struct RecordingCache {
    invalidated: RefCell<Vec<u64>>,
    areas: RefCell<Vec<(u32, u32)>>,
}

struct CacheHandle(Rc<RecordingCache>);

impl CodeCache for CacheHandle {
    fn addr_changed(&mut self, addr: u64) -> bool {
        self.0.invalidated.borrow_mut().push(addr);
        true
    }

    fn area_remapped(&mut self, begin: u32, end: u32) {
        self.0.areas.borrow_mut().push((begin, end));
    }
}

#[test]
fn code_pages_invalidate_on_write() {
    let mut mem = map();
    let cache = Rc::new(RecordingCache::default());
    mem.set_code_cache(Box::new(CacheHandle(cache.clone())));

    // Fetch marks the line; a plain read does not.
    mem.fetch_u8(0x4000);
    mem.read_u8(0x5000);

    mem.write_u8(0x5000, 1);
    assert!(cache.invalidated.borrow().is_empty());

    mem.write_u8(0x4000, 1);
    assert_eq!(cache.invalidated.borrow().as_slice(), &[0x4000]);

    // The whole 4 KiB page was dropped, so a second write in it is
    // silent until code is fetched again.
    mem.write_u8(0x4001, 1);
    assert_eq!(cache.invalidated.borrow().len(), 1);
}

#[test]
fn pam_read_toggle_invalidates_the_half_region() {
    let mut mem = map();
    let cache = Rc::new(RecordingCache::default());
    mem.set_code_cache(Box::new(CacheHandle(cache.clone())));

    mem.config_write8(0x5F, 0x01);
    assert_eq!(cache.areas.borrow().as_slice(), &[(0xE8000, 0xEBFFF)]);

    // Writing the same value again flips nothing.
    mem.config_write8(0x5F, 0x01);
    assert_eq!(cache.areas.borrow().len(), 1);
}

mod decomposition {
    use super::*;
    use proptest::prelude::*;

    fn interesting_addr() -> impl Strategy<Value = u64> {
        prop_oneof![
            0u64..0x2000,
            0x9FF00u64..0xA0100,
            0xBFF00u64..0xC0100,
            0xC3F00u64..0xC4100,
            0xEFF00u64..0xF0100,
            0xFFF00u64..0x100100,
            (4 * 1024 * 1024 - 0x100) as u64..(4 * 1024 * 1024 + 0x100) as u64,
            0xFFFD_FF00u64..0xFFFE_0100,
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn wide_reads_equal_byte_composition(addr in interesting_addr(), pam in 0u8..=0x33) {
            let mut mem = map();
            mem.config_write8(0x59, pam);
            mem.config_write8(0x5D, pam);
            // Deterministic RAM contents around the probe point.
            for offset in 0..8u64 {
                let a = addr.wrapping_add(offset);
                if a < mem.ram_size() {
                    mem.write_u8(a, (a as u8).wrapping_mul(31).wrapping_add(7));
                }
            }

            let bytes: Vec<u8> = (0..8).map(|i| mem.read_u8(addr + i)).collect();
            let w16 = u16::from_le_bytes([bytes[0], bytes[1]]);
            let w32 = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let w64 = u64::from_le_bytes(bytes[..8].try_into().unwrap());

            prop_assert_eq!(mem.read_u16(addr), w16);
            prop_assert_eq!(mem.read_u32(addr), w32);
            prop_assert_eq!(mem.read_u64(addr), w64);
        }
    }
}
