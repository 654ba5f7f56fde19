//! 8254-style timer/counter of the 430TX chipset: three channels fed by
//! a 1.193182 MHz clock derived from the CPU cycle counter. Channel 0
//! drives IRQ0, channel 1's rising OUT edges toggle the refresh-request
//! bit visible at port 0x61, channel 2 feeds the PC speaker and is the
//! only channel with a software-controlled gate.

use memupc_platform::ClockBus;
use tracing::error;

/// Receiver for OUT line transitions; called exactly once per edge,
/// strictly between two CPU cycle boundaries.
pub trait OutObserver {
    fn timer_out_changed(&mut self, channel: usize, out: bool);
}

/// Observer that drops every edge, for callers that only poll.
impl OutObserver for () {
    fn timer_out_changed(&mut self, _channel: usize, _out: bool) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RwMode {
    Lsb,
    Msb,
    LsbThenMsb,
}

#[derive(Debug, Clone)]
struct Channel {
    gate: bool,
    out: bool,
    mode: u8,
    bcd: bool,
    rw_mode: RwMode,
    count: u16,
    init_count: u16,
    latched_count: u16,
    status: u8,
    waiting_write_first_byte: bool,
    waiting_read_first_byte: bool,
    waiting_init_count: bool,
    /// The counting element loads `init_count` on the next timer tick.
    load_count: bool,
    latched_value: bool,
    latched_status: bool,
}

impl Channel {
    fn power_on(gate: bool) -> Self {
        Channel {
            gate,
            out: false,
            mode: 2,
            bcd: false,
            rw_mode: RwMode::Lsb,
            count: 0,
            init_count: 0,
            latched_count: 0,
            status: 0,
            waiting_write_first_byte: false,
            waiting_read_first_byte: false,
            waiting_init_count: false,
            load_count: false,
            latched_value: false,
            latched_status: false,
        }
    }
}

fn unsupported_mode(what: &str, mode: u8) -> ! {
    error!(mode, "PIT: {what} used an unimplemented counter mode");
    panic!("PIT mode {mode} is not implemented");
}

/// Ratio between the timer clock (1.193182 MHz) and the kHz part of the
/// CPU clock: `ticks = cycles * 1193 / (hz / 1000)`.
const TICK_SCALE: i64 = 1193;

/// The three-channel interval timer.
pub struct Pit {
    ch: [Channel; 3],
    refresh_toggle: bool,
    /// CPU cycles already folded into `tcc` this round.
    cc_used: i64,
    /// Accumulated time in units of 1/1193 timer tick.
    tcc: i64,
    /// `tcc` units per timer tick (`hz / 1000`).
    num: i64,
    /// Absolute `tcc` value of the next OUT edge.
    tcc_to_event: i64,
}

impl Pit {
    pub fn new(clk: &mut ClockBus) -> Self {
        let mut pit = Pit {
            ch: Self::power_on_channels(),
            refresh_toggle: false,
            cc_used: 0,
            tcc: 0,
            num: clk.hz() / 1000,
            tcc_to_event: 0,
        };
        pit.update_tcc_to_event(clk);
        pit
    }

    fn power_on_channels() -> [Channel; 3] {
        let mut ch = [
            Channel::power_on(true),
            Channel::power_on(true),
            Channel::power_on(false),
        ];
        // The BIOS never programs the refresh timer; give channel 1 the
        // period it is expected to have (one request roughly every 15 µs).
        ch[1].count = 18;
        ch[1].init_count = 18;
        ch
    }

    pub fn reset(&mut self, clk: &mut ClockBus, obs: &mut dyn OutObserver) {
        self.run(clk, obs, false);
        self.ch = Self::power_on_channels();
        self.refresh_toggle = false;
        self.tcc = 0;
        self.tcc_to_event = 0;
        self.update_tcc_to_event(clk);
    }

    /// Deliver an OUT edge for `id`; channel 1's rising edges toggle the
    /// refresh-request line.
    fn emit(&mut self, id: usize, obs: &mut dyn OutObserver) {
        let out = self.ch[id].out;
        if id == 1 && out {
            self.refresh_toggle = !self.refresh_toggle;
        }
        obs.timer_out_changed(id, out);
    }

    // Horizon of one channel, in tcc units relative to `self.tcc`'s
    // zero. `None` means the channel produces no further edge.

    fn mode0_tcc_to_event(&self, id: usize) -> Option<i64> {
        let ch = &self.ch[id];
        // After terminal count OUT stays high; the counter free-runs
        // without further edges.
        if ch.out {
            return None;
        }
        let (mut cc, count) = if ch.load_count {
            (1i64, ch.init_count)
        } else {
            (0i64, ch.count)
        };
        if count == 0 {
            return None;
        }
        cc += i64::from(count);
        Some(cc * self.num)
    }

    fn mode2_tcc_to_event(&self, id: usize) -> Option<i64> {
        let ch = &self.ch[id];
        let (mut cc, count) = if ch.load_count {
            (1i64, ch.init_count)
        } else {
            (0i64, ch.count)
        };
        cc += match count {
            0 => 0xFFFF,
            1 => 1,
            n => i64::from(n) - 1,
        };
        Some(cc * self.num)
    }

    fn mode3_tcc_to_event(&self, id: usize) -> Option<i64> {
        let ch = &self.ch[id];
        let (mut cc, count) = if ch.load_count {
            (1i64, ch.init_count & 0xFFFE)
        } else {
            (0i64, ch.count)
        };
        cc += match count {
            0 => 0xFFFE / 2,
            2 => 1,
            n => (i64::from(n) - 2) / 2,
        };
        Some(cc * self.num)
    }

    fn update_tcc_to_event(&mut self, clk: &mut ClockBus) {
        // One second unless an armed channel is closer.
        self.tcc_to_event = clk.hz() * TICK_SCALE;
        for id in 0..3 {
            if !self.ch[id].gate {
                continue;
            }
            let next = match self.ch[id].mode {
                0 => self.mode0_tcc_to_event(id),
                2 | 6 => self.mode2_tcc_to_event(id),
                3 | 7 => self.mode3_tcc_to_event(id),
                mode => unsupported_mode("horizon computation", mode),
            };
            if let Some(next) = next {
                if next < self.tcc_to_event {
                    self.tcc_to_event = next;
                }
            }
        }
        clk.propose_event(self.next_event_cc());
    }

    /// CPU cycles until the next OUT edge (or the one-second idle tick).
    pub fn next_event_cc(&self) -> i64 {
        let tcc = self.tcc_to_event - self.tcc;
        debug_assert!(tcc > 0);
        tcc / TICK_SCALE + i64::from(tcc % TICK_SCALE != 0)
    }

    fn run_mode0(&mut self, id: usize, mut clocks: i64, obs: &mut dyn OutObserver) {
        if self.ch[id].load_count {
            self.ch[id].count = self.ch[id].init_count;
            self.ch[id].load_count = false;
            clocks -= 1;
        }
        if !self.ch[id].gate {
            return;
        }
        while clocks > 0 {
            let count = i64::from(self.ch[id].count);
            if count > 0 {
                if clocks >= count {
                    clocks -= count;
                    self.ch[id].count = 0;
                    if !self.ch[id].out {
                        self.ch[id].out = true;
                        self.emit(id, obs);
                    }
                } else {
                    self.ch[id].count -= clocks as u16;
                    clocks = 0;
                }
            } else {
                self.ch[id].count = 0xFFFF;
                clocks -= 1;
            }
        }
    }

    fn run_mode2(&mut self, id: usize, mut clocks: i64, obs: &mut dyn OutObserver) {
        if self.ch[id].load_count {
            self.ch[id].count = self.ch[id].init_count;
            self.ch[id].load_count = false;
            clocks -= 1;
        }
        if !self.ch[id].gate {
            return;
        }
        while clocks > 0 {
            let count = i64::from(self.ch[id].count);
            if count > 1 {
                if clocks >= count - 1 {
                    clocks -= count - 1;
                    self.ch[id].count = 1;
                    self.ch[id].out = false;
                    self.emit(id, obs);
                } else {
                    self.ch[id].count -= clocks as u16;
                    clocks = 0;
                }
            } else if count == 1 {
                self.ch[id].count = self.ch[id].init_count;
                clocks -= 1;
                self.ch[id].out = true;
                self.emit(id, obs);
            } else {
                self.ch[id].count = 0xFFFF;
                clocks -= 1;
            }
        }
    }

    fn run_mode3(&mut self, id: usize, mut clocks: i64, obs: &mut dyn OutObserver) {
        if self.ch[id].load_count {
            self.ch[id].count = self.ch[id].init_count & 0xFFFE;
            self.ch[id].load_count = false;
            clocks -= 1;
        }
        if !self.ch[id].gate {
            return;
        }
        while clocks > 0 {
            let count = i64::from(self.ch[id].count);
            if count > 2 {
                // The counter steps by two each tick in square-wave mode.
                if 2 * clocks >= count - 2 {
                    clocks -= (count - 2) / 2;
                    self.ch[id].count = 2;
                } else {
                    self.ch[id].count -= (2 * clocks) as u16;
                    clocks = 0;
                }
            } else if count == 2 {
                self.ch[id].count = self.ch[id].init_count & 0xFFFE;
                clocks -= 1;
                self.ch[id].out = !self.ch[id].out;
                self.emit(id, obs);
            } else {
                self.ch[id].count = 0xFFFE;
                clocks -= 1;
            }
        }
    }

    /// Catch up with the CPU cycle counter, converting whole timer ticks
    /// and running every channel through them.
    fn run(&mut self, clk: &mut ClockBus, obs: &mut dyn OutObserver, update_event: bool) {
        let cc = clk.cycles() - self.cc_used;
        if cc > 0 {
            self.tcc += TICK_SCALE * cc;
            self.cc_used += cc;
        }
        let ticks = self.tcc / self.num;
        if ticks == 0 {
            return;
        }
        self.tcc %= self.num;

        for id in 0..3 {
            match self.ch[id].mode {
                0 => self.run_mode0(id, ticks, obs),
                2 | 6 => self.run_mode2(id, ticks, obs),
                3 | 7 => self.run_mode3(id, ticks, obs),
                mode => unsupported_mode("tick processing", mode),
            }
        }

        if update_event {
            self.update_tcc_to_event(clk);
        }
    }

    /// Write to the control port (0x43).
    pub fn control_write(&mut self, clk: &mut ClockBus, obs: &mut dyn OutObserver, data: u8) {
        self.run(clk, obs, false);

        if data & 0xC0 == 0xC0 {
            // Read Back: latch status and/or count for a channel subset.
            if data & 0x10 == 0 {
                for id in 0..3 {
                    if data & (0x02 << id) != 0 && !self.ch[id].latched_status {
                        let ch = &self.ch[id];
                        let mut status = if ch.out { 0x80u8 } else { 0x00 };
                        // Null-count status is left at 0: the count is
                        // always presented as transferred and readable.
                        if !ch.latched_value {
                            status |= match ch.rw_mode {
                                RwMode::Lsb => 0x10,
                                RwMode::Msb => 0x20,
                                RwMode::LsbThenMsb => 0x30,
                            };
                        }
                        status |= ch.mode << 1;
                        if ch.bcd {
                            status |= 0x01;
                        }
                        self.ch[id].status = status;
                        self.ch[id].latched_status = true;
                    }
                }
            }
            if data & 0x20 == 0 {
                for id in 0..3 {
                    if data & (0x02 << id) != 0 && !self.ch[id].latched_value {
                        self.ch[id].latched_count = self.ch[id].count;
                        self.ch[id].latched_value = true;
                        self.ch[id].waiting_read_first_byte = true;
                    }
                }
            }
        } else {
            let id = usize::from(data >> 6) & 0x3;

            if data & 0x30 == 0x00 {
                // Counter Latch.
                if !self.ch[id].latched_value {
                    self.ch[id].latched_count = self.ch[id].count;
                    self.ch[id].latched_value = true;
                    self.ch[id].waiting_read_first_byte = true;
                }
            } else {
                self.ch[id].rw_mode = match (data >> 4) & 0x3 {
                    1 => RwMode::Lsb,
                    2 => RwMode::Msb,
                    _ => RwMode::LsbThenMsb,
                };
                self.ch[id].bcd = data & 0x1 != 0;
                let mode = (data >> 1) & 0x7;
                self.ch[id].mode = mode;
                let new_out = match mode {
                    0 => false,
                    2 | 3 | 6 | 7 => true,
                    mode => unsupported_mode("control word", mode),
                };
                let old_out = self.ch[id].out;
                self.ch[id].out = new_out;
                if old_out != new_out {
                    self.emit(id, obs);
                }
                self.ch[id].waiting_init_count = true;
                self.ch[id].waiting_write_first_byte = true;
                self.ch[id].waiting_read_first_byte = true;
                self.ch[id].load_count = false;
            }
        }

        self.update_tcc_to_event(clk);
    }

    /// Write to a channel's data port (0x40-0x42).
    pub fn data_write(&mut self, clk: &mut ClockBus, obs: &mut dyn OutObserver, id: usize, data: u8) {
        self.run(clk, obs, false);

        let ch = &mut self.ch[id];
        let complete = match ch.rw_mode {
            RwMode::Lsb => {
                ch.init_count = (ch.init_count & 0xFF00) | u16::from(data);
                true
            }
            RwMode::Msb => {
                ch.init_count = (ch.init_count & 0x00FF) | (u16::from(data) << 8);
                true
            }
            RwMode::LsbThenMsb => {
                if ch.waiting_write_first_byte {
                    ch.init_count = (ch.init_count & 0xFF00) | u16::from(data);
                    ch.waiting_write_first_byte = false;
                    false
                } else {
                    ch.init_count = (ch.init_count & 0x00FF) | (u16::from(data) << 8);
                    ch.waiting_write_first_byte = true;
                    true
                }
            }
        };

        if complete {
            match self.ch[id].mode {
                0 => {
                    self.ch[id].load_count = true;
                    if self.ch[id].out {
                        self.ch[id].out = false;
                        self.emit(id, obs);
                    }
                }
                2 | 3 | 6 | 7 => {
                    if self.ch[id].waiting_init_count {
                        self.ch[id].load_count = true;
                    }
                }
                mode => unsupported_mode("count write", mode),
            }
            self.ch[id].waiting_init_count = false;
        }

        self.update_tcc_to_event(clk);
    }

    /// Read a channel's data port: latched status first, then a latched
    /// count, then the live counting element.
    pub fn data_read(&mut self, clk: &mut ClockBus, obs: &mut dyn OutObserver, id: usize) -> u8 {
        self.run(clk, obs, true);

        let ch = &mut self.ch[id];
        if ch.latched_status {
            ch.latched_status = false;
            ch.status
        } else if ch.latched_value {
            match ch.rw_mode {
                RwMode::Lsb => {
                    ch.latched_value = false;
                    ch.latched_count as u8
                }
                RwMode::Msb => {
                    ch.latched_value = false;
                    (ch.latched_count >> 8) as u8
                }
                RwMode::LsbThenMsb => {
                    if ch.waiting_read_first_byte {
                        ch.waiting_read_first_byte = false;
                        ch.latched_count as u8
                    } else {
                        ch.waiting_read_first_byte = true;
                        ch.latched_value = false;
                        (ch.latched_count >> 8) as u8
                    }
                }
            }
        } else {
            match ch.rw_mode {
                RwMode::Lsb => ch.count as u8,
                RwMode::Msb => (ch.count >> 8) as u8,
                RwMode::LsbThenMsb => {
                    if ch.waiting_read_first_byte {
                        ch.waiting_read_first_byte = false;
                        ch.count as u8
                    } else {
                        ch.waiting_read_first_byte = true;
                        (ch.count >> 8) as u8
                    }
                }
            }
        }
    }

    /// Channel 2's gate, driven by port 0x61 bit 0. A falling gate in the
    /// periodic modes parks OUT high and re-arms the channel.
    pub fn gate2_set(&mut self, clk: &mut ClockBus, obs: &mut dyn OutObserver, val: bool) {
        self.run(clk, obs, false);
        let old = self.ch[2].gate;
        self.ch[2].gate = val;
        match self.ch[2].mode {
            // Mode 0 simply stops counting while the gate is low.
            0 => {}
            2 | 3 | 6 | 7 => {
                if old && !val && !self.ch[2].out {
                    self.ch[2].out = true;
                    self.emit(2, obs);
                    self.ch[2].waiting_init_count = true;
                }
            }
            mode => unsupported_mode("gate change", mode),
        }
        self.update_tcc_to_event(clk);
    }

    pub fn gate2(&mut self, clk: &mut ClockBus, obs: &mut dyn OutObserver) -> bool {
        self.run(clk, obs, true);
        self.ch[2].gate
    }

    /// OUT2 as visible at port 0x61 bit 5.
    pub fn out2(&mut self, clk: &mut ClockBus, obs: &mut dyn OutObserver) -> bool {
        self.run(clk, obs, true);
        self.ch[2].out
    }

    /// Refresh-request bit as visible at port 0x61 bit 4.
    pub fn refresh_request_toggle(&mut self, clk: &mut ClockBus, obs: &mut dyn OutObserver) -> bool {
        self.run(clk, obs, true);
        self.refresh_toggle
    }

    /// OUT level of a channel, for wiring checks.
    pub fn out(&self, id: usize) -> bool {
        self.ch[id].out
    }

    pub fn end_iter(&mut self, clk: &mut ClockBus, obs: &mut dyn OutObserver) {
        let cc = clk.cycles() - self.cc_used;
        if cc > 0 {
            self.tcc += TICK_SCALE * cc;
            self.cc_used += cc;
            if self.tcc_to_event != 0 && self.tcc >= self.tcc_to_event {
                self.run(clk, obs, true);
            }
        }
        self.cc_used = 0;
    }
}
