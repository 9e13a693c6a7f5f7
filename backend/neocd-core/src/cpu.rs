//! Bus and core traits for the two processors.
//!
//! The instruction decoders themselves live outside this crate; the machine treats them
//! as steppable black boxes. The bus side carries the channels a core needs to observe
//! machine state that changes underneath it mid-slice: pending bus errors, timeslice
//! aborts, and interrupt lines.

use bincode::{Decode, Encode};

/// The 68000's view of the machine.
///
/// All accesses are big-endian; word accesses are word-aligned. An access to unmapped
/// memory records a pending bus error that the core must pick up via
/// [`M68kBus::take_bus_error`] and answer with its standard bus-error exception
/// sequence.
pub trait M68kBus {
    fn read_byte(&mut self, address: u32) -> u8;

    fn read_word(&mut self, address: u32) -> u16;

    fn write_byte(&mut self, address: u32, value: u8);

    fn write_word(&mut self, address: u32, value: u16);

    /// Report how many 68K cycles the core has executed so far in the current
    /// `execute` call. Cores call this before bus accesses so that handlers sensitive
    /// to mid-slice timing (raster interrupt arming, CD audio sample taps) observe
    /// up-to-date machine time.
    fn sync(&mut self, cycles_run: u32);

    /// The interrupt level currently asserted to the CPU (0 = none).
    fn interrupt_level(&self) -> u8;

    /// Acknowledge the interrupt at the given level, returning the exception vector
    /// offset to service. Level 2 returns the latched CD-ROM vector (0x54 or 0x58);
    /// other levels autovector.
    fn acknowledge_interrupt(&mut self, level: u8) -> u32;

    /// Take the pending bus-error flag, clearing it.
    fn take_bus_error(&mut self) -> bool;

    /// True when a bus write handler asked the core to end its timeslice early so
    /// another component can observe the write (the Z80 sound-command path).
    fn should_end_timeslice(&self) -> bool;
}

/// A steppable 68000 core.
pub trait M68kCore: Encode + Decode<()> {
    /// Run for up to `cycles` CPU cycles, returning how many were actually executed.
    /// The core must stop early when [`M68kBus::should_end_timeslice`] turns true and
    /// finalize a bus-error exception when [`M68kBus::take_bus_error`] reports one.
    fn execute<B: M68kBus>(&mut self, bus: &mut B, cycles: u32) -> u32;

    /// Pulse the RESET line: reload SSP/PC from the vector table and resume from there.
    fn reset<B: M68kBus>(&mut self, bus: &mut B);
}

/// The Z80's view of the machine: 64 KiB of work RAM plus the I/O port map (sound
/// command, YM2610 ports, NMI control).
pub trait Z80Bus {
    fn read_memory(&mut self, address: u16) -> u8;

    fn write_memory(&mut self, address: u16, value: u8);

    fn read_io(&mut self, port: u16) -> u8;

    fn write_io(&mut self, port: u16, value: u8);

    /// Report how many Z80 cycles the core has executed so far in the current
    /// `execute` call; see [`M68kBus::sync`].
    fn sync(&mut self, cycles_run: u32);

    /// Take a pending NMI pulse, clearing it.
    fn take_nmi(&mut self) -> bool;

    /// Level-triggered INT line, driven by the YM2610.
    fn interrupt_line(&self) -> bool;
}

/// A steppable Z80 core.
pub trait Z80Core: Encode + Decode<()> {
    /// Run for up to `cycles` CPU cycles, returning how many were actually executed.
    /// Maskable interrupts use mode 1 semantics on this machine (the interrupt
    /// daisy-chain always supplies 0x38).
    fn execute<B: Z80Bus>(&mut self, bus: &mut B, cycles: u32) -> u32;

    fn reset(&mut self);
}
