use memupc_devices_storage::{AtaDrive, AtapiDrive, PRIMARY_PORTS, SECONDARY_PORTS};
use memupc_pc_platform::{PcConfig, PcPlatform};
use memupc_storage::cd::{
    CdDiscKind, CdDrive, CdIndex, CdToc, CdTrack, Msf, CD_SECTOR_SIZE, CD_SUBCHANNEL_SIZE,
};
use memupc_storage::{DiskBackend, MemBackend, SECTOR_SIZE};

fn bios() -> Vec<u8> {
    vec![0; 128 * 1024]
}

fn cfg_addr(device: u8, function: u8, offset: u8) -> u32 {
    0x8000_0000 | (u32::from(device) << 11) | (u32::from(function) << 8) | u32::from(offset & 0xFC)
}

/// Enable I/O decode and both channels of the IDE function, the way
/// BIOS POST does.
fn enable_ide(pc: &mut PcPlatform) {
    pc.io_write(0x0CF8, 4, cfg_addr(1, 1, 0x04));
    pc.io_write(0x0CFC, 2, 0x0001);
    pc.io_write(0x0CF8, 4, cfg_addr(1, 1, 0x40));
    pc.io_write(0x0CFC, 2, 0x8000);
    pc.io_write(0x0CF8, 4, cfg_addr(1, 1, 0x40));
    pc.io_write(0x0CFE, 2, 0x8000);
}

fn settle(pc: &mut PcPlatform) {
    pc.clock.add_cycles(PcConfig::default().cpu_hz / 1000);
}

#[test]
fn boot_sector_read_through_the_port_map() {
    let mut disk = MemBackend::new(8 * SECTOR_SIZE as u64);
    let mut sector0 = vec![0u8; SECTOR_SIZE];
    sector0[0..4].copy_from_slice(b"BOOT");
    sector0[510] = 0x55;
    sector0[511] = 0xAA;
    disk.write_at(0, &sector0).unwrap();

    let mut pc = PcPlatform::new(PcConfig::default(), bios()).unwrap();
    pc.ide.attach_primary_master_ata(AtaDrive::new(Box::new(disk)).unwrap());
    enable_ide(&mut pc);

    let base = PRIMARY_PORTS.cmd_base;
    pc.io_write(base + 6, 1, 0xE0);
    pc.io_write(base + 2, 1, 1);
    pc.io_write(base + 3, 1, 0);
    pc.io_write(base + 4, 1, 0);
    pc.io_write(base + 5, 1, 0);
    pc.io_write(base + 7, 1, 0x20);
    settle(&mut pc);

    assert!(pc.interrupts.level(14), "primary channel raises IRQ14");

    let mut buf = [0u8; SECTOR_SIZE];
    for i in 0..SECTOR_SIZE / 2 {
        let w = pc.io_read(base, 2) as u16;
        buf[2 * i..2 * i + 2].copy_from_slice(&w.to_le_bytes());
    }
    assert_eq!(&buf[0..4], b"BOOT");
    assert_eq!(&buf[510..512], &[0x55, 0xAA]);

    // Reading Status drops the line again.
    let _ = pc.io_read(base + 7, 1);
    assert!(!pc.interrupts.level(14));
}

/// Minimal disc for the secondary-channel smoke test: a single data
/// track whose first block starts with a recognisable string.
struct MiniDisc {
    toc: CdToc,
    pos: u32,
}

impl MiniDisc {
    fn new() -> Self {
        MiniDisc {
            toc: CdToc {
                kind: CdDiscKind::Mode1,
                sessions: 1,
                tracks: vec![CdTrack {
                    number: 1,
                    is_audio: false,
                    four_channel_audio: false,
                    copy_permitted: false,
                    preemphasis: false,
                    indexes: vec![CdIndex { number: 1, pos: Msf::new(0, 2, 0) }],
                    last_sector: Msf::new(0, 2, 3),
                }],
            },
            pos: 0,
        }
    }
}

impl CdDrive for MiniDisc {
    fn media_present(&self) -> bool {
        true
    }

    fn toc(&self) -> Option<&CdToc> {
        Some(&self.toc)
    }

    fn seek(&mut self, m: u8, s: u8, f: u8) -> bool {
        self.pos = Msf::new(m, s, f).to_frames();
        true
    }

    fn read_sector(&mut self, buf: &mut [u8; CD_SECTOR_SIZE], is_audio: &mut bool) -> bool {
        *is_audio = false;
        buf.fill(0);
        buf[15] = 0x01;
        buf[16..21].copy_from_slice(b"WORLD");
        buf[21] = self.pos as u8;
        self.pos += 1;
        true
    }

    fn read_subchannel_q(&mut self, buf: &mut [u8; CD_SUBCHANNEL_SIZE], crc_ok: &mut bool) -> bool {
        buf.fill(0);
        *crc_ok = true;
        true
    }
}

#[test]
fn atapi_read_through_the_port_map_raises_irq15() {
    let mut pc = PcPlatform::new(PcConfig::default(), bios()).unwrap();
    pc.ide.attach_secondary_master_atapi(AtapiDrive::new(Box::new(MiniDisc::new())));
    enable_ide(&mut pc);

    let base = SECONDARY_PORTS.cmd_base;
    pc.io_write(base + 6, 1, 0xA0);

    // READ (10), LBA 0, one block, 2048-byte limit.
    pc.io_write(base + 1, 1, 0);
    pc.io_write(base + 4, 1, 0x00);
    pc.io_write(base + 5, 1, 0x08);
    pc.io_write(base + 7, 1, 0xA0);
    let mut pkt = [0u8; 12];
    pkt[0] = 0x28;
    pkt[7..9].copy_from_slice(&1u16.to_be_bytes());
    for i in 0..6 {
        pc.io_write(base, 2, u32::from(u16::from_le_bytes([pkt[2 * i], pkt[2 * i + 1]])));
    }
    settle(&mut pc);

    assert!(pc.interrupts.level(15), "secondary channel raises IRQ15");

    let mut out = vec![0u8; 2048];
    for i in 0..1024 {
        let w = pc.io_read(base, 2) as u16;
        out[2 * i..2 * i + 2].copy_from_slice(&w.to_le_bytes());
    }
    assert_eq!(&out[..5], b"WORLD");

    // The completion interrupt follows the drain.
    assert_eq!(pc.io_read(base + 2, 1) & 0x07, 0x03);
    let _ = pc.io_read(base + 7, 1);
    assert!(!pc.interrupts.level(15));
}

#[test]
fn ide_ports_stay_dark_until_post_enables_them() {
    let mut pc = PcPlatform::new(PcConfig::default(), bios()).unwrap();
    pc.ide
        .attach_primary_master_ata(AtaDrive::new(Box::new(MemBackend::new(512))).unwrap());

    // Without IOSE + IDETIM the command block is unclaimed.
    assert_eq!(pc.io_read(PRIMARY_PORTS.cmd_base + 7, 1), 0xFF);

    enable_ide(&mut pc);
    assert_eq!(pc.io_read(PRIMARY_PORTS.cmd_base + 7, 1), 0x40, "RDY once decoded");
}
