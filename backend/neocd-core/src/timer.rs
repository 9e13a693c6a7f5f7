//! Master-clock timing constants and the deadline timer wheel that drives the
//! scheduler.
//!
//! Timers hold a signed delay in master cycles. `advance` subtracts elapsed time from
//! every active timer and reports which ones expired; the machine dispatches the
//! expirations itself, so no timer holds a callback into the machine.

use bincode::{Decode, Encode};

/*
                            Drawline timer
                                    ^
                                    |
                                0   28           348 384
                            0   +-----------------------+
                                |#######################|
                            16  |###+---------------+###|
                                |###|      320      |###|
                                |###|               |###|
                                |###| 224           |###|
                                |###|               |###|
        Vbl timer ->        240 |###+---------------+###|
                                |#######################|
                            264 +-----------------------+
*/

pub const MASTER_CLOCK: f64 = 24_168_000.0;
pub const M68K_CLOCK: f64 = 12_084_000.0;
pub const Z80_CLOCK: f64 = 4_028_000.0;
pub const PIXEL_CLOCK: f64 = 6_042_000.0;

pub const SCREEN_WIDTH: i32 = 384;
pub const SCREEN_HEIGHT: i32 = 264;

pub const ACTIVE_AREA_TOP: i32 = 16;
pub const ACTIVE_AREA_BOTTOM: i32 = ACTIVE_AREA_TOP + 224;
pub const ACTIVE_AREA_LEFT: i32 = 28;
pub const ACTIVE_AREA_RIGHT: i32 = ACTIVE_AREA_LEFT + 320;

pub const VBL_IRQ_X: i32 = ACTIVE_AREA_LEFT / 2;
pub const VBL_IRQ_Y: i32 = ACTIVE_AREA_BOTTOM;

pub const VBL_RELOAD_X: i32 = ACTIVE_AREA_RIGHT - 63;
pub const VBL_RELOAD_Y: i32 = ACTIVE_AREA_BOTTOM;

pub const WATCHDOG_DELAY: i32 = seconds_to_master(0.13516792);
pub const CDROM_64HZ_DELAY: i32 = round_i32(MASTER_CLOCK / 64.64);
pub const CDROM_75HZ_DELAY: i32 = round_i32(MASTER_CLOCK / 75.0);

pub const FRAME_RATE: f64 = PIXEL_CLOCK / ((SCREEN_WIDTH * SCREEN_HEIGHT) as f64);
pub const CYCLES_PER_FRAME: i32 =
    round_i32((MASTER_CLOCK / PIXEL_CLOCK) * (SCREEN_WIDTH * SCREEN_HEIGHT) as f64);

/// Round half away from zero, the rounding used for every cycle conversion.
#[must_use]
pub const fn round_i32(value: f64) -> i32 {
    if value >= 0.0 { (value + 0.5) as i32 } else { (value - 0.5) as i32 }
}

#[must_use]
pub const fn seconds_to_master(value: f64) -> i32 {
    round_i32(value * MASTER_CLOCK)
}

#[must_use]
pub const fn m68k_to_master(value: i32) -> i32 {
    round_i32(value as f64 * (MASTER_CLOCK / M68K_CLOCK))
}

#[must_use]
pub const fn z80_to_master(value: i32) -> i32 {
    round_i32(value as f64 * (MASTER_CLOCK / Z80_CLOCK))
}

#[must_use]
pub const fn pixel_to_master(value: i32) -> i32 {
    round_i32(value as f64 * (MASTER_CLOCK / PIXEL_CLOCK))
}

#[must_use]
pub const fn master_to_m68k(value: i32) -> i32 {
    round_i32(value as f64 / (MASTER_CLOCK / M68K_CLOCK))
}

#[must_use]
pub const fn master_to_z80(value: i32) -> i32 {
    round_i32(value as f64 / (MASTER_CLOCK / Z80_CLOCK))
}

#[must_use]
pub const fn master_to_pixel(value: i32) -> i32 {
    round_i32(value as f64 / (MASTER_CLOCK / PIXEL_CLOCK))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum TimerState {
    Stopped,
    Active,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Timer {
    state: TimerState,
    delay: i32,
    user_data: u32,
}

impl Timer {
    fn new() -> Self {
        Self { state: TimerState::Stopped, delay: 0, user_data: 0 }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TimerState::Active
    }

    #[must_use]
    pub fn state(&self) -> TimerState {
        self.state
    }

    /// Change the timer state. Returns true if activating an already-expired timer,
    /// in which case the caller must dispatch the expiration.
    pub fn set_state(&mut self, state: TimerState) -> bool {
        self.state = state;
        self.check_timeout()
    }

    #[must_use]
    pub fn delay(&self) -> i32 {
        self.delay
    }

    pub fn set_delay(&mut self, delay: i32) {
        self.delay = delay;
    }

    #[must_use]
    pub fn user_data(&self) -> u32 {
        self.user_data
    }

    pub fn set_user_data(&mut self, user_data: u32) {
        self.user_data = user_data;
    }

    /// Arm with an absolute delay. Returns true if the timer expired immediately.
    pub fn arm(&mut self, delay: i32) -> bool {
        self.delay = delay;
        self.state = TimerState::Active;
        self.check_timeout()
    }

    /// Arm with a delay added to the current remaining delay, so periodic timers keep
    /// phase even when they expired slightly late. Returns true if the timer expired
    /// immediately.
    pub fn arm_relative(&mut self, delay: i32) -> bool {
        self.delay += delay;
        self.state = TimerState::Active;
        self.check_timeout()
    }

    /// Advance time. Returns true if the timer expired.
    pub fn advance(&mut self, time: i32) -> bool {
        if !self.is_active() {
            return false;
        }

        self.delay -= time;
        self.check_timeout()
    }

    fn check_timeout(&mut self) -> bool {
        if !self.is_active() || self.delay > 0 {
            return false;
        }

        self.state = TimerState::Stopped;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum TimerId {
    Watchdog,
    Vbl,
    Hbl,
    VblReload,
    Drawline,
    Cdrom64Hz,
    Cdrom75Hz,
    Ym2610A,
    Ym2610B,
    AudioCommand,
}

impl TimerId {
    pub const ALL: [Self; TIMER_COUNT] = [
        Self::Watchdog,
        Self::Vbl,
        Self::Hbl,
        Self::VblReload,
        Self::Drawline,
        Self::Cdrom64Hz,
        Self::Cdrom75Hz,
        Self::Ym2610A,
        Self::Ym2610B,
        Self::AudioCommand,
    ];
}

pub const TIMER_COUNT: usize = 10;

/// Expirations collected by one `advance` call, in fixed timer order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FiredTimers {
    ids: [Option<TimerId>; TIMER_COUNT],
    len: usize,
}

impl FiredTimers {
    fn push(&mut self, id: TimerId) {
        self.ids[self.len] = Some(id);
        self.len += 1;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Iterator for FiredTimers {
    type Item = TimerId;

    fn next(&mut self) -> Option<TimerId> {
        if self.len == 0 {
            return None;
        }

        let id = self.ids[0];
        self.ids.copy_within(1.., 0);
        self.len -= 1;
        id
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct TimerWheel {
    timers: [Timer; TIMER_COUNT],
}

impl TimerWheel {
    #[must_use]
    pub fn new() -> Self {
        let mut wheel = Self { timers: std::array::from_fn(|_| Timer::new()) };
        wheel.timer_mut(TimerId::Watchdog).set_delay(WATCHDOG_DELAY);
        wheel
    }

    #[must_use]
    pub fn timer(&self, id: TimerId) -> &Timer {
        &self.timers[id as usize]
    }

    pub fn timer_mut(&mut self, id: TimerId) -> &mut Timer {
        &mut self.timers[id as usize]
    }

    /// Re-arm the boot-time timer layout. `cdz` halves the CD sector clock.
    pub fn reset(&mut self, cdz: bool) {
        let _ = self.timer_mut(TimerId::Watchdog).set_state(TimerState::Stopped);

        let _ = self
            .timer_mut(TimerId::Drawline)
            .arm(pixel_to_master(ACTIVE_AREA_TOP * SCREEN_WIDTH + ACTIVE_AREA_LEFT));
        let _ = self
            .timer_mut(TimerId::Vbl)
            .arm(pixel_to_master(VBL_IRQ_Y * SCREEN_WIDTH + VBL_IRQ_X));
        let _ = self.timer_mut(TimerId::Hbl).set_state(TimerState::Stopped);
        let _ = self
            .timer_mut(TimerId::VblReload)
            .arm(pixel_to_master(VBL_RELOAD_Y * SCREEN_WIDTH + VBL_RELOAD_X));

        let _ = self.timer_mut(TimerId::Cdrom64Hz).arm(CDROM_64HZ_DELAY);
        let _ = self
            .timer_mut(TimerId::Cdrom75Hz)
            .arm(if cdz { CDROM_75HZ_DELAY / 2 } else { CDROM_75HZ_DELAY });

        let _ = self.timer_mut(TimerId::AudioCommand).set_state(TimerState::Stopped);
        let _ = self.timer_mut(TimerId::Ym2610A).set_state(TimerState::Stopped);
        let _ = self.timer_mut(TimerId::Ym2610B).set_state(TimerState::Stopped);
    }

    /// The largest number of master cycles that may elapse before a timer needs
    /// servicing, bounded by one frame.
    #[must_use]
    pub fn time_slice(&self) -> i32 {
        let mut time_slice = round_i32(MASTER_CLOCK / FRAME_RATE);

        for timer in &self.timers {
            if timer.is_active() {
                time_slice = time_slice.min(timer.delay());
            }
        }

        time_slice
    }

    /// Advance every active timer, collecting the ones that expired.
    pub fn advance(&mut self, time: i32) -> FiredTimers {
        let mut fired = FiredTimers::default();

        for id in TimerId::ALL {
            if self.timers[id as usize].advance(time) {
                fired.push(id);
            }
        }

        fired
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_clock_ratios() {
        assert_eq!(m68k_to_master(100), 200);
        assert_eq!(z80_to_master(100), 600);
        assert_eq!(pixel_to_master(100), 400);
        assert_eq!(master_to_m68k(201), 101);
        assert_eq!(CYCLES_PER_FRAME, 4 * SCREEN_WIDTH * SCREEN_HEIGHT);
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(round_i32(2.5), 3);
        assert_eq!(round_i32(-2.5), -3);
        assert_eq!(round_i32(2.4), 2);
        assert_eq!(round_i32(-2.4), -2);
    }

    #[test]
    fn advance_decrements_and_fires_once() {
        let mut timer = Timer::new();
        assert!(!timer.arm(100));

        assert!(!timer.advance(60));
        assert_eq!(timer.delay(), 40);

        assert!(timer.advance(60));
        assert_eq!(timer.delay(), -20);
        assert_eq!(timer.state(), TimerState::Stopped);

        // Stopped timers do not fire again
        assert!(!timer.advance(100));
        assert_eq!(timer.delay(), -20);
    }

    #[test]
    fn arm_relative_keeps_phase() {
        let mut timer = Timer::new();
        let _ = timer.arm(100);
        let _ = timer.advance(130);
        assert_eq!(timer.delay(), -30);

        // Re-arming relative compensates for the 30-cycle overshoot
        assert!(!timer.arm_relative(100));
        assert_eq!(timer.delay(), 70);
    }

    #[test]
    fn time_slice_is_bounded_by_one_frame() {
        let mut wheel = TimerWheel::new();
        assert_eq!(wheel.time_slice(), round_i32(MASTER_CLOCK / FRAME_RATE));

        let _ = wheel.timer_mut(TimerId::Vbl).arm(1234);
        assert_eq!(wheel.time_slice(), 1234);
    }

    #[test]
    fn advance_reports_expirations_in_fixed_order() {
        let mut wheel = TimerWheel::new();
        let _ = wheel.timer_mut(TimerId::Cdrom75Hz).arm(10);
        let _ = wheel.timer_mut(TimerId::Vbl).arm(5);
        let _ = wheel.timer_mut(TimerId::Hbl).arm(100);

        let fired: Vec<TimerId> = wheel.advance(20).collect();
        assert_eq!(fired, vec![TimerId::Vbl, TimerId::Cdrom75Hz]);

        let fired: Vec<TimerId> = wheel.advance(100).collect();
        assert_eq!(fired, vec![TimerId::Hbl]);
    }
}
