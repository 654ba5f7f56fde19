/// Cycle accounting shared by the CPU and every time-driven subsystem.
///
/// `cycles` counts CPU cycles executed so far in the current `iter`
/// round; subsystems read it to catch up and the port map adds ISA wait
/// states to it. `next_event` is the smallest cycle count (measured from
/// the start of the round) at which any subsystem expects an observable
/// edge; the kernel never steps the CPU past it.
#[derive(Debug, Clone)]
pub struct ClockBus {
    hz: i64,
    cycles: i64,
    next_event: i64,
}

impl ClockBus {
    /// `hz` is the simulated CPU frequency. The timer maths divides it by
    /// 1000, so it must be a whole number of kHz.
    pub fn new(hz: i64) -> Self {
        assert!(hz > 0 && hz % 1000 == 0, "CPU frequency must be a positive multiple of 1000");
        ClockBus {
            hz,
            cycles: 0,
            next_event: i64::MAX,
        }
    }

    pub fn hz(&self) -> i64 {
        self.hz
    }

    /// Cycles executed so far in the current round.
    pub fn cycles(&self) -> i64 {
        self.cycles
    }

    /// Charge extra cycles (ISA wait states, CPU execution).
    pub fn add_cycles(&mut self, cc: i64) {
        debug_assert!(cc >= 0);
        self.cycles += cc;
    }

    /// Start a new round with at most `horizon` cycles to run.
    pub fn begin_round(&mut self, horizon: i64) {
        debug_assert!(horizon > 0);
        self.cycles = 0;
        self.next_event = horizon;
    }

    /// A subsystem expects an edge `cc` cycles from now; tighten the
    /// horizon if that is sooner than anything seen so far.
    pub fn propose_event(&mut self, cc: i64) {
        debug_assert!(cc > 0);
        let at = self.cycles.saturating_add(cc);
        if at < self.next_event {
            self.next_event = at;
        }
    }

    /// Cycle (from round start) of the nearest expected event.
    pub fn next_event(&self) -> i64 {
        self.next_event
    }

    /// Cycles the CPU may still run before the nearest event. Always at
    /// least 1 so the machine cannot stall.
    pub fn cycles_until_event(&self) -> i64 {
        (self.next_event - self.cycles).max(1)
    }
}
