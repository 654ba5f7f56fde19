//! Shared plumbing for the memupc simulator: the cycle clock bus that every
//! time-driven subsystem coordinates through, the interrupt-line sink, and
//! reset event plumbing.

pub mod clock;
pub mod interrupts;
pub mod reset;

pub use clock::ClockBus;
pub use interrupts::{InterruptLines, IrqSink};
pub use reset::ResetEvent;
