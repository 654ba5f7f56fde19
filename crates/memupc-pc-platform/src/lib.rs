//! The simulated machine: a 430TX board with an MTXC north-bridge, a
//! PIIX4 south-bridge and the legacy timer, glued to an external IA-32
//! core through the cycle-budget scheduler.
//!
//! Everything simulated is owned by [`PcPlatform`] and driven through
//! `&mut` calls; the CPU, interrupt controller, video and sound
//! front-ends are collaborators behind narrow traits.

pub mod chipset;
pub mod sound;

use std::cell::RefCell;
use std::rc::Rc;

use memupc_devices_storage::{GeometryError, IdeController};
use memupc_memory::{MemoryError, MemoryMap, RamSize};
use memupc_pci::{ConfigAddress, PciDevice, PCI_CFG_ADDR_PORT, PCI_CFG_DATA_PORT};
use memupc_platform::{ClockBus, InterruptLines, IrqSink, ResetEvent};
use memupc_timers::{OutObserver, Pit};
use thiserror::Error;
use tracing::{debug, warn};

pub use chipset::Chipset;

#[derive(Debug, Error)]
pub enum PcError {
    /// The BIOS image has an unsupported size.
    #[error(transparent)]
    BadBios(#[from] MemoryError),
    /// A hard-disk image is not a whole number of sectors.
    #[error(transparent)]
    HddWrongSize(#[from] GeometryError),
    /// The external CPU adapter rejected the configured model.
    #[error("unknown CPU model")]
    UnknownCpuModel,
    /// A plugged PCI device's option ROM is malformed.
    #[error("option ROM image is malformed")]
    BadOptionRom,
    /// The external floppy adapter rejected an image size.
    #[error("floppy image size is not a supported format")]
    FloppyWrongSize,
}

#[derive(Debug, Clone)]
pub struct PcConfig {
    /// Simulated CPU frequency; must be a whole number of kHz.
    pub cpu_hz: i64,
    pub ram_size: RamSize,
    /// Surface QEMU-compatible subsystem IDs and debug ports.
    pub qemu_compat: bool,
}

impl Default for PcConfig {
    fn default() -> Self {
        PcConfig {
            cpu_hz: 50_000_000,
            ram_size: RamSize::M16,
            qemu_compat: false,
        }
    }
}

/// The external IA-32 core. `step` executes at most `max_cycles`,
/// charging whatever it consumed to `pc.clock` and performing its
/// memory and port accesses through `pc`.
pub trait CpuCore {
    fn step(&mut self, pc: &mut PcPlatform, max_cycles: i64);

    /// Reload the reset vector after a platform reset.
    fn reset(&mut self) {}
}

/// Configuration-space endpoint currently selected by the CONFADD
/// latch. Fixed chipset functions dispatch through this tag; plugged
/// devices go through their trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PciEndpoint {
    None,
    Mtxc,
    IsaBridge,
    Ide,
    Usb,
    PowerManagement,
    Device { index: usize, func: u8 },
}

/// Maps timer OUT edges onto the machine: channel 0 drives IRQ0,
/// channel 2 drives the speaker. (Channel 1's refresh toggle stays
/// inside the timer.)
struct PitWiring<'a> {
    irq: &'a mut InterruptLines,
    speaker_out: &'a mut bool,
}

impl OutObserver for PitWiring<'_> {
    fn timer_out_changed(&mut self, channel: usize, out: bool) {
        match channel {
            0 => self.irq.set_irq(0, out),
            2 => *self.speaker_out = out,
            _ => {}
        }
    }
}

const QEMU_DEBUG_READBACK: u8 = 0xE9;

pub struct PcPlatform {
    pub clock: ClockBus,
    pub interrupts: InterruptLines,
    pub memory: MemoryMap,
    pub pit: Pit,
    pub ide: IdeController,
    pub chipset: Chipset,
    devices: Vec<Rc<RefCell<dyn PciDevice>>>,
    pci_addr: ConfigAddress,
    selected: PciEndpoint,
    reset_events: Vec<ResetEvent>,
    isa_delay: i64,
    qemu_compat: bool,
}

impl PcPlatform {
    pub fn new(config: PcConfig, bios: Vec<u8>) -> Result<Self, PcError> {
        let mut clock = ClockBus::new(config.cpu_hz);
        let mut memory = MemoryMap::new(config.ram_size, bios)?;
        memory.set_qemu_compat(config.qemu_compat);
        let pit = Pit::new(&mut clock);
        let ide = IdeController::new(&mut clock);
        let chipset = Chipset::new(config.cpu_hz);
        // Every ISA-decoded access stalls the bus for roughly one
        // 8.33 MB/s byte time.
        let isa_delay = config.cpu_hz / (8_330_000 / 8);
        Ok(PcPlatform {
            clock,
            interrupts: InterruptLines::new(),
            memory,
            pit,
            ide,
            chipset,
            devices: Vec::new(),
            pci_addr: ConfigAddress::default(),
            selected: PciEndpoint::None,
            reset_events: Vec::new(),
            isa_delay,
            qemu_compat: config.qemu_compat,
        })
    }

    /// Install a pluggable PCI device (bus 0, device 2 + insertion
    /// index). An option ROM, when supplied, must look like one.
    pub fn add_pci_device(
        &mut self,
        device: Rc<RefCell<dyn PciDevice>>,
        option_rom: Option<&[u8]>,
    ) -> Result<(), PcError> {
        if let Some(rom) = option_rom {
            let valid = !rom.is_empty()
                && rom.len() % 512 == 0
                && rom.len() <= 0x1_0000
                && rom[0] == 0x55
                && rom[1] == 0xAA;
            if !valid {
                return Err(PcError::BadOptionRom);
            }
        }
        self.devices.push(device);
        Ok(())
    }

    /// Reset notifications queued since the last call; the front-end
    /// resets the CPU core on `ResetEvent::System`.
    pub fn take_reset_events(&mut self) -> Vec<ResetEvent> {
        std::mem::take(&mut self.reset_events)
    }

    /// Full platform reset: power-on state for memory, chipset and
    /// devices. The CPU core is reset by the front-end via the queued
    /// event (or directly when calling this).
    pub fn reset(&mut self) {
        self.pci_addr = ConfigAddress::default();
        self.selected = PciEndpoint::None;
        self.reset_events.clear();
        self.memory.reset();
        {
            let Self { pit, clock, interrupts, chipset, .. } = self;
            let mut wiring = PitWiring { irq: interrupts, speaker_out: &mut chipset.speaker_out };
            pit.reset(clock, &mut wiring);
        }
        self.ide.reset(&mut self.clock, &mut self.interrupts);
        self.chipset.reset();
        for device in &self.devices {
            device.borrow_mut().reset();
        }
        self.interrupts.clear();
    }

    // Scheduling.

    /// Run the machine for at least `budget` CPU cycles. Each inner
    /// round: tighten the event horizon, step the CPU at most that far,
    /// then let every time-driven subsystem consume the elapsed cycles.
    pub fn iter(&mut self, cpu: &mut dyn CpuCore, budget: i64) -> i64 {
        let mut executed: i64 = 0;
        while executed < budget {
            self.clock.begin_round(budget - executed);
            self.tighten_horizon();
            let limit = self.clock.cycles_until_event();
            cpu.step(self, limit);
            if self.clock.cycles() == 0 {
                // A halted core consumes nothing; skip to the horizon so
                // timer events still fire.
                self.clock.add_cycles(limit);
            }
            self.end_iter();
            executed += self.clock.cycles();
        }
        executed
    }

    fn tighten_horizon(&mut self) {
        self.clock.propose_event(self.pit.next_event_cc());
        self.clock.propose_event(self.ide.next_event_cc());
        let Self { clock, devices, .. } = self;
        for device in devices.iter() {
            if let Some(cc) = device.borrow().next_event_cc() {
                clock.propose_event(cc);
            }
        }
    }

    fn end_iter(&mut self) {
        let Self { pit, ide, clock, interrupts, chipset, devices, .. } = self;
        {
            let mut wiring = PitWiring { irq: interrupts, speaker_out: &mut chipset.speaker_out };
            pit.end_iter(clock, &mut wiring);
        }
        ide.end_iter(clock, interrupts);
        chipset.pm.timer.end_iter(clock);
        for device in devices.iter() {
            device.borrow_mut().end_iter(clock);
        }
    }

    /// Next CD audio sample pair for the sound path.
    pub fn next_cd_audio_sample(&mut self) -> (i16, i16) {
        let Self { ide, interrupts, .. } = self;
        ide.next_cd_audio_sample(interrupts)
    }

    // PCI configuration mechanism #1.

    fn confadd_write(&mut self, data: u32) {
        let addr = ConfigAddress(data);
        self.pci_addr = addr;
        if !addr.enabled() {
            self.selected = PciEndpoint::None;
            return;
        }
        let (bus, dev, func) = (addr.bus(), addr.device(), addr.function());
        self.selected = if bus != 0 {
            warn!(bus, dev, func, "no bridge forwards configuration cycles to this bus");
            PciEndpoint::None
        } else {
            match dev {
                0 => {
                    if func == 0 {
                        PciEndpoint::Mtxc
                    } else {
                        warn!(func, "north bridge has a single function");
                        PciEndpoint::None
                    }
                }
                1 => match func {
                    0 => PciEndpoint::IsaBridge,
                    1 => PciEndpoint::Ide,
                    2 => PciEndpoint::Usb,
                    3 => PciEndpoint::PowerManagement,
                    _ => {
                        warn!(func, "south bridge function is not populated");
                        PciEndpoint::None
                    }
                },
                d => {
                    let index = usize::from(d) - 2;
                    let populated = self
                        .devices
                        .get(index)
                        .is_some_and(|dev| dev.borrow_mut().function(func).is_some());
                    if populated {
                        PciEndpoint::Device { index, func }
                    } else {
                        warn!(dev = d, func, "no device at this configuration address");
                        PciEndpoint::None
                    }
                }
            }
        };
    }

    fn confdata_read8(&mut self, low: u8) -> u8 {
        let addr = self.pci_addr.register() << 2 | low;
        match self.selected {
            PciEndpoint::None => {
                warn!("byte read of CONFDATA with no endpoint connected");
                0xFF
            }
            PciEndpoint::Mtxc => self.memory.config_read8(addr),
            PciEndpoint::IsaBridge => self.chipset.isa.config_read8(addr),
            PciEndpoint::Ide => self.ide.config_read8(addr),
            PciEndpoint::Usb => self.chipset.usb.config_read8(addr),
            PciEndpoint::PowerManagement => self.chipset.pm.config_read8(addr),
            PciEndpoint::Device { index, func } => {
                let mut device = self.devices[index].borrow_mut();
                device.function(func).map_or(0xFF, |f| f.config_read8(addr))
            }
        }
    }

    fn confdata_read16(&mut self, low: u8) -> u16 {
        let addr = self.pci_addr.register() << 1 | low;
        match self.selected {
            PciEndpoint::None => {
                warn!("word read of CONFDATA with no endpoint connected");
                0xFFFF
            }
            PciEndpoint::Mtxc => self.memory.config_read16(addr),
            PciEndpoint::IsaBridge => self.chipset.isa.config_read16(addr),
            PciEndpoint::Ide => self.ide.config_read16(addr),
            PciEndpoint::Usb => self.chipset.usb.config_read16(addr),
            PciEndpoint::PowerManagement => self.chipset.pm.config_read16(addr),
            PciEndpoint::Device { index, func } => {
                let mut device = self.devices[index].borrow_mut();
                device.function(func).map_or(0xFFFF, |f| f.config_read16(addr))
            }
        }
    }

    fn confdata_read32(&mut self) -> u32 {
        let addr = self.pci_addr.register();
        match self.selected {
            PciEndpoint::None => {
                warn!("dword read of CONFDATA with no endpoint connected");
                0xFFFF_FFFF
            }
            PciEndpoint::Mtxc => self.memory.config_read32(addr),
            PciEndpoint::IsaBridge => self.chipset.isa.config_read32(addr),
            PciEndpoint::Ide => self.ide.config_read32(addr),
            PciEndpoint::Usb => self.chipset.usb.config_read32(addr),
            PciEndpoint::PowerManagement => self.chipset.pm.config_read32(addr),
            PciEndpoint::Device { index, func } => {
                let mut device = self.devices[index].borrow_mut();
                device.function(func).map_or(0xFFFF_FFFF, |f| f.config_read32(addr))
            }
        }
    }

    fn confdata_write8(&mut self, low: u8, data: u8) {
        let addr = self.pci_addr.register() << 2 | low;
        match self.selected {
            PciEndpoint::None => warn!("byte write of CONFDATA with no endpoint connected"),
            PciEndpoint::Mtxc => self.memory.config_write8(addr, data),
            PciEndpoint::IsaBridge => self.chipset.isa.config_write8(addr, data),
            PciEndpoint::Ide => self.ide.config_write8(addr, data),
            PciEndpoint::Usb => self.chipset.usb.config_write8(addr, data),
            PciEndpoint::PowerManagement => self.chipset.pm.config_write8(addr, data),
            PciEndpoint::Device { index, func } => {
                let mut device = self.devices[index].borrow_mut();
                if let Some(f) = device.function(func) {
                    f.config_write8(addr, data);
                }
            }
        }
    }

    fn confdata_write16(&mut self, low: u8, data: u16) {
        let addr = self.pci_addr.register() << 1 | low;
        match self.selected {
            PciEndpoint::None => warn!("word write of CONFDATA with no endpoint connected"),
            PciEndpoint::Mtxc => self.memory.config_write16(addr, data),
            PciEndpoint::IsaBridge => self.chipset.isa.config_write16(addr, data),
            PciEndpoint::Ide => self.ide.config_write16(addr, data),
            PciEndpoint::Usb => self.chipset.usb.config_write16(addr, data),
            PciEndpoint::PowerManagement => self.chipset.pm.config_write16(addr, data),
            PciEndpoint::Device { index, func } => {
                let mut device = self.devices[index].borrow_mut();
                if let Some(f) = device.function(func) {
                    f.config_write16(addr, data);
                }
            }
        }
    }

    fn confdata_write32(&mut self, data: u32) {
        let addr = self.pci_addr.register();
        match self.selected {
            PciEndpoint::None => warn!("dword write of CONFDATA with no endpoint connected"),
            PciEndpoint::Mtxc => self.memory.config_write32(addr, data),
            PciEndpoint::IsaBridge => self.chipset.isa.config_write32(addr, data),
            PciEndpoint::Ide => self.ide.config_write32(addr, data),
            PciEndpoint::Usb => self.chipset.usb.config_write32(addr, data),
            PciEndpoint::PowerManagement => self.chipset.pm.config_write32(addr, data),
            PciEndpoint::Device { index, func } => {
                let mut device = self.devices[index].borrow_mut();
                if let Some(f) = device.function(func) {
                    f.config_write32(addr, data);
                }
            }
        }
    }

    // The port 0x61 view of the timer.

    fn port_61_read(&mut self) -> u8 {
        let Self { pit, clock, interrupts, chipset, .. } = self;
        let mut wiring = PitWiring { irq: interrupts, speaker_out: &mut chipset.speaker_out };
        let out2 = pit.out2(clock, &mut wiring);
        let refresh = pit.refresh_request_toggle(clock, &mut wiring);
        let gate2 = pit.gate2(clock, &mut wiring);
        u8::from(out2) << 5
            | u8::from(refresh) << 4
            | u8::from(chipset.speaker_data) << 1
            | u8::from(gate2)
    }

    fn port_61_write(&mut self, data: u8) {
        self.chipset.speaker_data = data & 0x02 != 0;
        let Self { pit, clock, interrupts, chipset, .. } = self;
        let mut wiring = PitWiring { irq: interrupts, speaker_out: &mut chipset.speaker_out };
        pit.gate2_set(clock, &mut wiring, data & 0x01 != 0);
    }

    fn reset_control_write(&mut self, data: u8) {
        if self.chipset.isa.reset_control_write(data) {
            self.reset();
            self.reset_events.push(ResetEvent::System);
        }
    }

    /// Read with no attached collaborator behind the port.
    fn absent_read8(&mut self, port: u16, what: &str) -> u8 {
        warn!(port, "read from {what} port with no collaborator attached");
        0xFF
    }

    fn absent_write8(&mut self, port: u16, data: u8, what: &str) {
        warn!(port, data, "write to {what} port with no collaborator attached");
    }

    // I/O port fan-out: fixed legacy decode first, then the BAR claim
    // chain (IDE, USB, power management/SMBus, plugged devices), then
    // open bus with a warning.

    pub fn io_read8(&mut self, port: u16) -> u8 {
        match port {
            0x40..=0x42 => {
                let value = {
                    let Self { pit, clock, interrupts, chipset, .. } = self;
                    let mut wiring =
                        PitWiring { irq: interrupts, speaker_out: &mut chipset.speaker_out };
                    pit.data_read(clock, &mut wiring, usize::from(port - 0x40))
                };
                self.clock.add_cycles(self.isa_delay);
                value
            }
            0x43 => {
                warn!("the timer control port is write-only");
                0xFF
            }
            0x61 => {
                let value = self.port_61_read();
                self.clock.add_cycles(self.isa_delay);
                value
            }
            0x92 => self.chipset.port_92_read(),
            0x00..=0x1F => self.absent_read8(port, "DMA controller"),
            0x20..=0x3F | 0xA0..=0xBF => {
                let value = self.absent_read8(port, "interrupt controller");
                self.clock.add_cycles(self.isa_delay);
                value
            }
            0x60 | 0x64 => self.absent_read8(port, "PS/2 controller"),
            0x70 | 0x71 => self.absent_read8(port, "real-time clock"),
            0x80..=0x9F => self.absent_read8(port, "DMA page register"),
            0xC0..=0xDF => self.absent_read8(port, "DMA controller"),
            // Game port reads float high with nothing plugged in.
            0x200..=0x20F => 0xFF,
            0x220..=0x22F | 0x388..=0x389 => {
                let value = self.absent_read8(port, "sound card");
                self.clock.add_cycles(self.isa_delay);
                value
            }
            0x278..=0x27B | 0x378..=0x37A => self.absent_read8(port, "parallel port"),
            0x2E8..=0x2EF | 0x2F8..=0x2FF | 0x3E8..=0x3EF | 0x3F8..=0x3FF => {
                self.absent_read8(port, "serial port")
            }
            0x330..=0x331 => {
                let value = self.absent_read8(port, "MPU-401");
                self.clock.add_cycles(self.isa_delay);
                value
            }
            0x3F4 | 0x3F5 => self.absent_read8(port, "floppy controller"),
            0x402 if self.qemu_compat => QEMU_DEBUG_READBACK,
            0x4D0..=0x4D1 => self.absent_read8(port, "edge/level control register"),
            0x510..=0x511 => self.absent_read8(port, "firmware configuration"),
            PCI_CFG_DATA_PORT..=0x0CFF => self.confdata_read8((port & 0x3) as u8),
            _ => self.io_chain_read8(port),
        }
    }

    fn io_chain_read8(&mut self, port: u16) -> u8 {
        {
            let Self { ide, clock, interrupts, .. } = self;
            if let Some(v) = ide.port_read8(clock, interrupts, port) {
                return v;
            }
        }
        if let Some(v) = self.chipset.usb.port_read8(port) {
            return v;
        }
        if let Some(v) = self.chipset.pm.port_read8(port) {
            return v;
        }
        for device in &self.devices {
            if let Some(v) = device.borrow_mut().port_read8(port) {
                return v;
            }
        }
        warn!(port, "byte read of an unclaimed I/O port");
        0xFF
    }

    pub fn io_read16(&mut self, port: u16) -> u16 {
        match port {
            0x00 | 0x10 => {
                warn!(port, "word read of DMA registers with no controller attached");
                0xFFFF
            }
            PCI_CFG_DATA_PORT | 0x0CFE => self.confdata_read16(((port >> 1) & 0x1) as u8),
            _ => self.io_chain_read16(port),
        }
    }

    fn io_chain_read16(&mut self, port: u16) -> u16 {
        {
            let Self { ide, clock, interrupts, .. } = self;
            if let Some(v) = ide.port_read16(clock, interrupts, port) {
                return v;
            }
        }
        if let Some(v) = self.chipset.usb.port_read16(port) {
            return v;
        }
        if let Some(v) = self.chipset.pm.port_read16(port) {
            return v;
        }
        for device in &self.devices {
            if let Some(v) = device.borrow_mut().port_read16(port) {
                return v;
            }
        }
        warn!(port, "word read of an unclaimed I/O port");
        0xFFFF
    }

    pub fn io_read32(&mut self, port: u16) -> u32 {
        match port {
            PCI_CFG_ADDR_PORT => self.pci_addr.0,
            PCI_CFG_DATA_PORT => self.confdata_read32(),
            _ => self.io_chain_read32(port),
        }
    }

    fn io_chain_read32(&mut self, port: u16) -> u32 {
        {
            let Self { ide, clock, interrupts, .. } = self;
            if let Some(v) = ide.port_read32(clock, interrupts, port) {
                return v;
            }
        }
        if let Some(v) = self.chipset.usb.port_read32(port) {
            return v;
        }
        {
            let Self { chipset, clock, .. } = self;
            if let Some(v) = chipset.pm.port_read32(clock, port) {
                return v;
            }
        }
        for device in &self.devices {
            if let Some(v) = device.borrow_mut().port_read32(port) {
                return v;
            }
        }
        warn!(port, "dword read of an unclaimed I/O port");
        0xFFFF_FFFF
    }

    pub fn io_write8(&mut self, port: u16, data: u8) {
        match port {
            0x40..=0x42 => {
                let Self { pit, clock, interrupts, chipset, .. } = self;
                let mut wiring =
                    PitWiring { irq: interrupts, speaker_out: &mut chipset.speaker_out };
                pit.data_write(clock, &mut wiring, usize::from(port - 0x40), data);
                self.clock.add_cycles(self.isa_delay);
            }
            0x43 => {
                let Self { pit, clock, interrupts, chipset, .. } = self;
                let mut wiring =
                    PitWiring { irq: interrupts, speaker_out: &mut chipset.speaker_out };
                pit.control_write(clock, &mut wiring, data);
                self.clock.add_cycles(self.isa_delay);
            }
            0x61 => {
                self.port_61_write(data);
                self.clock.add_cycles(self.isa_delay);
            }
            0x92 => self.chipset.port_92_write(data),
            0x00..=0x1F | 0xC0..=0xDF => self.absent_write8(port, data, "DMA controller"),
            0x20..=0x3F | 0xA0..=0xBF => {
                self.absent_write8(port, data, "interrupt controller");
                self.clock.add_cycles(self.isa_delay);
            }
            0x60 | 0x64 => self.absent_write8(port, data, "PS/2 controller"),
            0x70 | 0x71 => self.absent_write8(port, data, "real-time clock"),
            0x80..=0x9F => self.absent_write8(port, data, "DMA page register"),
            0x200..=0x20F => {
                // Game port latch; value is discarded with nothing
                // plugged in.
                debug!(port, data, "game port write ignored");
            }
            0x220..=0x22F | 0x388..=0x389 => {
                self.absent_write8(port, data, "sound card");
                self.clock.add_cycles(self.isa_delay);
            }
            0x278..=0x27B | 0x378..=0x37A => self.absent_write8(port, data, "parallel port"),
            0x2E8..=0x2EF | 0x2F8..=0x2FF | 0x3E8..=0x3EF | 0x3F8..=0x3FF => {
                self.absent_write8(port, data, "serial port")
            }
            0x330..=0x331 => {
                self.absent_write8(port, data, "MPU-401");
                self.clock.add_cycles(self.isa_delay);
            }
            0x3F2 | 0x3F5 | 0x3F7 => self.absent_write8(port, data, "floppy controller"),
            0x402 => {
                debug!(byte = data, "firmware debug port");
            }
            0x4D0..=0x4D1 => self.absent_write8(port, data, "edge/level control register"),
            0x0CF9 => self.reset_control_write(data),
            PCI_CFG_DATA_PORT..=0x0CFF => self.confdata_write8((port & 0x3) as u8, data),
            _ => self.io_chain_write8(port, data),
        }
    }

    fn io_chain_write8(&mut self, port: u16, data: u8) {
        {
            let Self { ide, clock, interrupts, .. } = self;
            if ide.port_write8(clock, interrupts, port, data) {
                return;
            }
        }
        if self.chipset.usb.port_write8(port, data) {
            return;
        }
        if self.chipset.pm.port_write8(port, data) {
            return;
        }
        for device in &self.devices {
            if device.borrow_mut().port_write8(port, data) {
                return;
            }
        }
        warn!(port, data, "byte write to an unclaimed I/O port");
    }

    pub fn io_write16(&mut self, port: u16, data: u16) {
        match port {
            0x08 | 0x18 => {
                warn!(port, data, "word write to DMA registers with no controller attached");
            }
            PCI_CFG_DATA_PORT | 0x0CFE => {
                self.confdata_write16(((port >> 1) & 0x1) as u8, data)
            }
            _ => self.io_chain_write16(port, data),
        }
    }

    fn io_chain_write16(&mut self, port: u16, data: u16) {
        {
            let Self { ide, clock, interrupts, .. } = self;
            if ide.port_write16(clock, interrupts, port, data) {
                return;
            }
        }
        if self.chipset.usb.port_write16(port, data) {
            return;
        }
        if self.chipset.pm.port_write16(port, data) {
            return;
        }
        for device in &self.devices {
            if device.borrow_mut().port_write16(port, data) {
                return;
            }
        }
        warn!(port, data, "word write to an unclaimed I/O port");
    }

    pub fn io_write32(&mut self, port: u16, data: u32) {
        match port {
            PCI_CFG_ADDR_PORT => self.confadd_write(data),
            PCI_CFG_DATA_PORT => self.confdata_write32(data),
            _ => self.io_chain_write32(port, data),
        }
    }

    fn io_chain_write32(&mut self, port: u16, data: u32) {
        {
            let Self { ide, clock, interrupts, .. } = self;
            if ide.port_write32(clock, interrupts, port, data) {
                return;
            }
        }
        if self.chipset.usb.port_write32(port, data) {
            return;
        }
        if self.chipset.pm.port_write32(port, data) {
            return;
        }
        for device in &self.devices {
            if device.borrow_mut().port_write32(port, data) {
                return;
            }
        }
        warn!(port, data, "dword write to an unclaimed I/O port");
    }

    /// Width-dispatching port read, for front-ends that carry the size
    /// as a value.
    pub fn io_read(&mut self, port: u16, size: u8) -> u32 {
        match size {
            1 => u32::from(self.io_read8(port)),
            2 => u32::from(self.io_read16(port)),
            4 => self.io_read32(port),
            _ => panic!("unsupported port access width {size}"),
        }
    }

    pub fn io_write(&mut self, port: u16, size: u8, data: u32) {
        match size {
            1 => self.io_write8(port, data as u8),
            2 => self.io_write16(port, data as u16),
            4 => self.io_write32(port, data),
            _ => panic!("unsupported port access width {size}"),
        }
    }
}
