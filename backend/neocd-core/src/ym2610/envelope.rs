//! FM envelope generator. `clock` is driven at one third of the chip's internal sample
//! rate by the chip-level accumulator.

use crate::ym2610::phase::PhaseGenerator;
use bincode::{Decode, Encode};
use neocd_common::num::GetBit;
use std::cmp;

const SSG_ATTENUATION_THRESHOLD: u16 = 0x200;

// Attenuation is 10 bits
pub(super) const ATTENUATION_MASK: u16 = 0x03FF;
pub(super) const MAX_ATTENUATION: u16 = ATTENUATION_MASK;

#[rustfmt::skip]
const ATTENUATION_INCREMENTS: &[[u8; 8]; 64] = &[
    [0,0,0,0,0,0,0,0], [0,0,0,0,0,0,0,0], [0,1,0,1,0,1,0,1], [0,1,0,1,0,1,0,1],  // 0-3
    [0,1,0,1,0,1,0,1], [0,1,0,1,0,1,0,1], [0,1,1,1,0,1,1,1], [0,1,1,1,0,1,1,1],  // 4-7
    [0,1,0,1,0,1,0,1], [0,1,0,1,1,1,0,1], [0,1,1,1,0,1,1,1], [0,1,1,1,1,1,1,1],  // 8-11
    [0,1,0,1,0,1,0,1], [0,1,0,1,1,1,0,1], [0,1,1,1,0,1,1,1], [0,1,1,1,1,1,1,1],  // 12-15
    [0,1,0,1,0,1,0,1], [0,1,0,1,1,1,0,1], [0,1,1,1,0,1,1,1], [0,1,1,1,1,1,1,1],  // 16-19
    [0,1,0,1,0,1,0,1], [0,1,0,1,1,1,0,1], [0,1,1,1,0,1,1,1], [0,1,1,1,1,1,1,1],  // 20-23
    [0,1,0,1,0,1,0,1], [0,1,0,1,1,1,0,1], [0,1,1,1,0,1,1,1], [0,1,1,1,1,1,1,1],  // 24-27
    [0,1,0,1,0,1,0,1], [0,1,0,1,1,1,0,1], [0,1,1,1,0,1,1,1], [0,1,1,1,1,1,1,1],  // 28-31
    [0,1,0,1,0,1,0,1], [0,1,0,1,1,1,0,1], [0,1,1,1,0,1,1,1], [0,1,1,1,1,1,1,1],  // 32-35
    [0,1,0,1,0,1,0,1], [0,1,0,1,1,1,0,1], [0,1,1,1,0,1,1,1], [0,1,1,1,1,1,1,1],  // 36-39
    [0,1,0,1,0,1,0,1], [0,1,0,1,1,1,0,1], [0,1,1,1,0,1,1,1], [0,1,1,1,1,1,1,1],  // 40-43
    [0,1,0,1,0,1,0,1], [0,1,0,1,1,1,0,1], [0,1,1,1,0,1,1,1], [0,1,1,1,1,1,1,1],  // 44-47
    [1,1,1,1,1,1,1,1], [1,1,1,2,1,1,1,2], [1,2,1,2,1,2,1,2], [1,2,2,2,1,2,2,2],  // 48-51
    [2,2,2,2,2,2,2,2], [2,2,2,4,2,2,2,4], [2,4,2,4,2,4,2,4], [2,4,4,4,2,4,4,4],  // 52-55
    [4,4,4,4,4,4,4,4], [4,4,4,8,4,4,4,8], [4,8,4,8,4,8,4,8], [4,8,8,8,4,8,8,8],  // 56-59
    [8,8,8,8,8,8,8,8], [8,8,8,8,8,8,8,8], [8,8,8,8,8,8,8,8], [8,8,8,8,8,8,8,8],  // 60-63
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
enum EnvelopePhase {
    Attack,
    Decay,
    Sustain,
    Release,
}

#[derive(Debug, Clone, Encode, Decode)]
pub(super) struct EnvelopeGenerator {
    // Register values
    pub(super) attack_rate: u8,
    pub(super) decay_rate: u8,
    pub(super) sustain_rate: u8,
    pub(super) release_rate: u8,
    pub(super) total_level: u8,
    pub(super) sustain_level: u8,
    pub(super) key_scale: u8,
    // Internal state
    phase: EnvelopePhase,
    attenuation: u16,
    pub(super) key_scale_rate: u8,
    cycle_count: u16,
    ssg_enabled: bool,
    ssg_attack: bool,
    ssg_alternate: bool,
    ssg_hold: bool,
    ssg_invert_output: bool,
}

impl EnvelopeGenerator {
    pub(super) fn new() -> Self {
        Self {
            attack_rate: 0,
            decay_rate: 0,
            sustain_rate: 0,
            release_rate: 0,
            total_level: 0,
            sustain_level: 0,
            key_scale: 0,
            phase: EnvelopePhase::Release,
            attenuation: MAX_ATTENUATION,
            key_scale_rate: 0,
            cycle_count: 1,
            ssg_enabled: false,
            ssg_attack: false,
            ssg_alternate: false,
            ssg_hold: false,
            ssg_invert_output: false,
        }
    }

    #[inline]
    pub(super) fn clock(&mut self, phase_generator: &mut PhaseGenerator) {
        if self.ssg_enabled {
            self.ssg_clock(phase_generator);
        }

        self.envelope_clock();
    }

    #[inline]
    fn envelope_clock(&mut self) {
        // The hardware's envelope cycle counter is 12-bit and skips 0 on overflow
        self.cycle_count += 1;
        self.cycle_count = (self.cycle_count & 0xFFF) + (self.cycle_count >> 12);

        // Sustain level applies in increments of 32, with max level special cased to
        // the max multiple of 32
        let sustain_level = match self.sustain_level {
            15 => (MAX_ATTENUATION >> 5) << 5,
            sl => u16::from(sl) << 5,
        };

        if self.phase == EnvelopePhase::Attack && self.attenuation == 0 {
            self.phase = EnvelopePhase::Decay;
        }

        if self.phase == EnvelopePhase::Decay && self.attenuation >= sustain_level {
            self.phase = EnvelopePhase::Sustain;
        }

        let r = match self.phase {
            EnvelopePhase::Attack => self.attack_rate,
            EnvelopePhase::Decay => self.decay_rate,
            EnvelopePhase::Sustain => self.sustain_rate,
            EnvelopePhase::Release => (self.release_rate << 1) | 1,
        };

        let rate = if r == 0 { 0 } else { cmp::min(63, 2 * r + self.key_scale_rate) };

        let update_frequency_shift = 11_u8.saturating_sub(rate >> 2);
        if self.cycle_count & ((1 << update_frequency_shift) - 1) == 0 {
            let increment_idx = (self.cycle_count >> update_frequency_shift) & 7;
            let increment: u16 =
                ATTENUATION_INCREMENTS[rate as usize][increment_idx as usize].into();

            match self.phase {
                EnvelopePhase::Attack => {
                    // Rates of 62 and 63 do nothing during attack phase; at key on
                    // they skip the phase entirely
                    if rate <= 61 {
                        self.attenuation = self
                            .attenuation
                            .wrapping_add((!self.attenuation).wrapping_mul(increment) >> 4)
                            & ATTENUATION_MASK;
                    }
                }
                EnvelopePhase::Decay | EnvelopePhase::Sustain | EnvelopePhase::Release => {
                    if self.ssg_enabled {
                        // Attenuation moves 4x as fast in SSG-EG mode, but only below
                        // the inversion threshold
                        if self.attenuation < SSG_ATTENUATION_THRESHOLD {
                            self.attenuation =
                                cmp::min(MAX_ATTENUATION, self.attenuation + 4 * increment);
                        }
                    } else {
                        self.attenuation = cmp::min(MAX_ATTENUATION, self.attenuation + increment);
                    }
                }
            }
        }
    }

    #[inline]
    fn ssg_clock(&mut self, phase_generator: &mut PhaseGenerator) {
        // SSG-EG updates only apply at or above the inversion threshold
        if self.attenuation < SSG_ATTENUATION_THRESHOLD {
            return;
        }

        // Alternate inverts the output after each attack-decay-sustain pass
        if self.ssg_alternate {
            if self.ssg_hold {
                // Once a hold begins the output stays inverted
                self.ssg_invert_output = true;
            } else {
                self.ssg_invert_output = !self.ssg_invert_output;
            }
        }

        if !self.ssg_alternate && !self.ssg_hold {
            // The phase counter is held at 0 until attenuation drops below the
            // threshold again
            phase_generator.reset();
        }

        if matches!(self.phase, EnvelopePhase::Decay | EnvelopePhase::Sustain) && !self.ssg_hold {
            // Start a new attack-decay-sustain pass
            if 2 * self.attack_rate + self.key_scale_rate >= 62 {
                self.attenuation = 0;
                self.phase = EnvelopePhase::Decay;
            } else {
                self.phase = EnvelopePhase::Attack;
            }
        } else if self.phase == EnvelopePhase::Release
            || (self.phase != EnvelopePhase::Attack && self.ssg_invert_output == self.ssg_attack)
        {
            self.attenuation = MAX_ATTENUATION;
        }
    }

    pub(super) fn is_key_on(&self) -> bool {
        self.phase != EnvelopePhase::Release
    }

    pub(super) fn key_on(&mut self) {
        if self.is_key_on() {
            return;
        }

        let rate = 2 * self.attack_rate + self.key_scale_rate;

        // Rates of 62 and 63 skip the attack phase
        if rate >= 62 {
            self.phase = EnvelopePhase::Decay;
            self.attenuation = 0;
        } else {
            self.phase = EnvelopePhase::Attack;
        }

        self.ssg_invert_output = false;
    }

    pub(super) fn key_off(&mut self) {
        if self.ssg_enabled
            && self.phase != EnvelopePhase::Release
            && self.ssg_invert_output != self.ssg_attack
        {
            // Keying off while the SSG output is inverted applies the inversion to the
            // stored attenuation
            self.attenuation =
                SSG_ATTENUATION_THRESHOLD.wrapping_sub(self.attenuation) & ATTENUATION_MASK;
        }

        self.phase = EnvelopePhase::Release;
    }

    pub(super) fn update_key_scale_rate(&mut self, f_number: u16, block: u8) {
        let key_code = super::compute_key_code(f_number, block);
        self.key_scale_rate = key_code >> (3 - self.key_scale);
    }

    pub(super) fn current_attenuation(&self) -> u16 {
        let attenuation = if self.ssg_enabled
            && self.phase != EnvelopePhase::Release
            && self.ssg_invert_output != self.ssg_attack
        {
            // SSG output inversion centers around 0x200
            SSG_ATTENUATION_THRESHOLD.wrapping_sub(self.attenuation) & ATTENUATION_MASK
        } else {
            self.attenuation
        };

        let total_level = u16::from(self.total_level) << 3;
        cmp::min(MAX_ATTENUATION, attenuation + total_level)
    }

    pub(super) fn write_ssg_register(&mut self, value: u8) {
        self.ssg_enabled = value.bit(3);
        self.ssg_attack = value.bit(2);
        self.ssg_alternate = value.bit(1);
        self.ssg_hold = value.bit(0);
    }
}

impl Default for EnvelopeGenerator {
    fn default() -> Self {
        Self::new()
    }
}
