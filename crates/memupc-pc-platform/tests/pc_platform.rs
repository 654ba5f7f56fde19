use memupc_pc_platform::{PcConfig, PcPlatform};

fn bios() -> Vec<u8> {
    (0..128 * 1024).map(|i| (i % 251) as u8).collect()
}

fn platform() -> PcPlatform {
    PcPlatform::new(PcConfig::default(), bios()).unwrap()
}

fn cfg_addr(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    0x8000_0000
        | (u32::from(bus) << 16)
        | (u32::from(device) << 11)
        | (u32::from(function) << 8)
        | (u32::from(offset) & 0xFC)
}

fn read_cfg_u32(pc: &mut PcPlatform, device: u8, function: u8, offset: u8) -> u32 {
    pc.io_write(0x0CF8, 4, cfg_addr(0, device, function, offset));
    pc.io_read(0x0CFC, 4)
}

fn write_cfg_u16(pc: &mut PcPlatform, device: u8, function: u8, offset: u8, value: u16) {
    pc.io_write(0x0CF8, 4, cfg_addr(0, device, function, offset));
    pc.io_write(0x0CFC + (u16::from(offset) & 0x2), 2, u32::from(value));
}

#[test]
fn chipset_functions_enumerate_with_the_expected_ids() {
    let mut pc = platform();

    assert_eq!(read_cfg_u32(&mut pc, 0, 0, 0x00), 0x7100_8086, "MTXC");
    assert_eq!(read_cfg_u32(&mut pc, 1, 0, 0x00), 0x7110_8086, "PIIX4 ISA");
    assert_eq!(read_cfg_u32(&mut pc, 1, 1, 0x00), 0x7111_8086, "PIIX4 IDE");
    assert_eq!(read_cfg_u32(&mut pc, 1, 2, 0x00), 0x7112_8086, "PIIX4 USB");
    assert_eq!(read_cfg_u32(&mut pc, 1, 3, 0x00), 0x7113_8086, "PIIX4 PM");

    // The ISA bridge advertises its siblings through the header type.
    pc.io_write(0x0CF8, 4, cfg_addr(0, 1, 0, 0x0C));
    assert_eq!(pc.io_read(0x0CFE, 1), 0x80);

    // Nothing lives at device 2.
    assert_eq!(read_cfg_u32(&mut pc, 2, 0, 0x00), 0xFFFF_FFFF);
}

#[test]
fn disabled_config_latch_makes_data_accesses_inert() {
    let mut pc = platform();

    pc.io_write(0x0CF8, 4, cfg_addr(0, 0, 0, 0) & !0x8000_0000);
    assert_eq!(pc.io_read(0x0CFC, 4), 0xFFFF_FFFF);
    // The latch itself still reads back what was written.
    assert_eq!(pc.io_read(0x0CF8, 4), cfg_addr(0, 0, 0, 0) & !0x8000_0000);

    // Writes while disconnected are dropped rather than reaching a
    // function.
    pc.io_write(0x0CFC, 4, 0x1234_5678);
}

#[test]
fn pam_programming_through_config_ports_steers_the_legacy_window() {
    let mut pc = platform();

    // PAM0 high half: reads and writes to RAM.
    pc.io_write(0x0CF8, 4, cfg_addr(0, 0, 0, 0x58));
    pc.io_write(0x0CFD, 1, 0x30);
    pc.memory.write_u8(0xF0000, 0x55);
    pc.memory.write_u8(0xFFFF0, 0xAA);
    assert_eq!(pc.memory.read_u8(0xF0000), 0x55);
    assert_eq!(pc.memory.read_u8(0xFFFF0), 0xAA);

    // Back to the BIOS image.
    pc.io_write(0x0CFD, 1, 0x20);
    let expected = bios()[128 * 1024 - 0x10000 + 0xFFF0];
    assert_eq!(pc.memory.read_u8(0xFFFF0), expected);
}

#[test]
fn port_92_controls_the_fast_a20_bit() {
    let mut pc = platform();
    assert!(!pc.chipset.a20_enabled());
    assert_eq!(pc.io_read(0x92, 1), 0x00);

    pc.io_write(0x92, 1, 0x02);
    assert!(pc.chipset.a20_enabled());
    assert_eq!(pc.io_read(0x92, 1), 0x02);
}

#[test]
fn unclaimed_ports_read_all_ones() {
    let mut pc = platform();
    assert_eq!(pc.io_read(0x5555, 1), 0xFF);
    assert_eq!(pc.io_read(0x5555, 2), 0xFFFF);
    assert_eq!(pc.io_read(0x5555, 4), 0xFFFF_FFFF);
    // Writes are dropped without complaint reaching the caller.
    pc.io_write(0x5555, 4, 0x1234_5678);
}

#[test]
fn isa_port_accesses_charge_the_bus_delay() {
    let mut pc = platform();
    let delay = PcConfig::default().cpu_hz / (8_330_000 / 8);

    let before = pc.clock.cycles();
    let _ = pc.io_read(0x61, 1);
    assert_eq!(pc.clock.cycles() - before, delay);

    let before = pc.clock.cycles();
    pc.io_write(0x43, 1, 0x34);
    assert_eq!(pc.clock.cycles() - before, delay);
}

#[test]
fn port_61_reflects_timer_channel_2() {
    let mut pc = platform();

    // Gate closed out of reset (bit 0 clear); open it and enable the
    // speaker data bit.
    let initial = pc.io_read(0x61, 1);
    assert_eq!(initial & 0x03, 0x00);

    pc.io_write(0x61, 1, 0x03);
    let value = pc.io_read(0x61, 1);
    assert_eq!(value & 0x03, 0x03, "gate and speaker data set");

    // Programming the square-wave mode drives OUT2 high.
    pc.io_write(0x43, 1, 0xB6); // channel 2, lo/hi, mode 3
    pc.io_write(0x42, 1, 0x10);
    pc.io_write(0x42, 1, 0x00);
    let value = pc.io_read(0x61, 1);
    assert_ne!(value & 0x20, 0, "OUT2 visible at bit 5");
}

#[test]
fn pm_timer_ticks_at_3_579_545_hz() {
    let mut pc = platform();

    // Assign PMBA and enable its decode.
    pc.io_write(0x0CF8, 4, cfg_addr(0, 1, 3, 0x40));
    pc.io_write(0x0CFC, 4, 0x4000);
    pc.io_write(0x0CF8, 4, cfg_addr(0, 1, 3, 0x80));
    pc.io_write(0x0CFC, 1, 0x01);

    let t0 = pc.io_read(0x4008, 4);
    pc.clock.add_cycles(PcConfig::default().cpu_hz);
    let t1 = pc.io_read(0x4008, 4);
    assert_eq!((t1 - t0) & 0xFF_FFFF, 3_579_545);
}

#[test]
fn usb_bar_probe_and_relocation() {
    let mut pc = platform();

    // Size the BAR: 32-byte I/O window.
    pc.io_write(0x0CF8, 4, cfg_addr(0, 1, 2, 0x20));
    pc.io_write(0x0CFC, 4, 0xFFFF_FFFF);
    assert_eq!(pc.io_read(0x0CFC, 4), 0xFFFF_FFE1);

    // Assign it and enable I/O decode.
    pc.io_write(0x0CFC, 4, 0xD000);
    write_cfg_u16(&mut pc, 1, 2, 0x04, 0x0001);

    // BIOS-style probe of the port status registers: present, no
    // device connected.
    assert_eq!(pc.io_read(0xD010, 2), 0x0080);
    assert_eq!(pc.io_read(0xD012, 2), 0x0080);

    // Frame number register is writable.
    pc.io_write(0xD006, 2, 0x0123);
    assert_eq!(pc.io_read(0xD006, 2), 0x0123);
}

#[test]
fn qemu_compat_exposes_subsystem_ids_and_debug_port() {
    let mut pc = PcPlatform::new(
        PcConfig { qemu_compat: true, ..PcConfig::default() },
        bios(),
    )
    .unwrap();

    pc.io_write(0x0CF8, 4, cfg_addr(0, 0, 0, 0x2C));
    assert_eq!(pc.io_read(0x0CFC, 2), 0x1AF4);
    assert_eq!(pc.io_read(0x0CFE, 2), 0x1100);

    assert_eq!(pc.io_read(0x402, 1), 0xE9);
}
