//! YM2610 (OPNB) sound chip: four FM channels, the three-voice SSG block, six ADPCM-A
//! sample channels, and two timers driven through the machine's timer wheel.
//!
//! The model generates samples directly at the 44.1 kHz output rate; the ratio to the
//! chip's internal sample rate (8 MHz / 144) is folded into the phase and envelope
//! accumulators as a 16.16 fixed-point factor.

mod adpcm;
mod envelope;
mod lfo;
mod phase;
mod ssg;

use crate::audio::{AudioBuffer, Sample};
use crate::memory::PCM_RAM_LEN;
use crate::timer::{seconds_to_master, TimerId, TimerState, TimerWheel};
use crate::ym2610::adpcm::AdpcmA;
use crate::ym2610::envelope::EnvelopeGenerator;
use crate::ym2610::lfo::LowFrequencyOscillator;
use crate::ym2610::phase::PhaseGenerator;
use crate::ym2610::ssg::Ssg;
use bincode::{Decode, Encode};
use neocd_common::num::GetBit;
use std::array;
use std::sync::LazyLock;

pub const CHIP_CLOCK: f64 = 8_000_000.0;

// Internal FM sample rate is CHIP_CLOCK / 144; this is its ratio to 44.1 kHz in 16.16
// fixed point
pub(crate) const FREQ_BASE_FP: u64 =
    ((CHIP_CLOCK / 144.0 / crate::audio::SAMPLE_RATE as f64) * 65536.0) as u64;

// Phase is 10 bits
const PHASE_MASK: u16 = 0x03FF;
const HALF_PHASE_MASK: u16 = PHASE_MASK >> 1;

// Operator output is signed 14-bit
const OPERATOR_OUTPUT_MIN: i16 = -0x2000;
const OPERATOR_OUTPUT_MAX: i16 = 0x1FFF;

// Only four of the six FM channel slots exist on the OPNB
const ACTIVE_FM_CHANNELS: [usize; 4] = [1, 2, 4, 5];

fn compute_key_code(f_number: u16, block: u8) -> u8 {
    let f11 = f_number.bit(10);
    let f10 = f_number.bit(9);
    let f9 = f_number.bit(8);
    let f8 = f_number.bit(7);
    (block << 2)
        | (u8::from(f11) << 1)
        | u8::from((f11 && (f10 || f9 || f8)) || (!f11 && f10 && f9 && f8))
}

#[derive(Debug, Clone, Default, Encode, Decode)]
struct FmOperator {
    phase: PhaseGenerator,
    envelope: EnvelopeGenerator,
    am_enabled: bool,
    current_output: i16,
    last_output: i16,
    // Values used in output calculation that are copied here for convenience
    lfo_counter: u8,
    am_sensitivity: u8,
}

impl FmOperator {
    fn update_frequency(&mut self, f_number: u16, block: u8) {
        self.phase.f_number = f_number;
        self.phase.block = block;
        self.envelope.update_key_scale_rate(f_number, block);
    }

    fn update_key_scale(&mut self, key_scale: u8) {
        self.envelope.key_scale = key_scale;
        self.envelope.update_key_scale_rate(self.phase.f_number, self.phase.block);
    }

    fn key_on_or_off(&mut self, value: bool) {
        if value {
            if !self.envelope.is_key_on() {
                self.phase.reset();
                self.envelope.key_on();
            }
        } else {
            self.envelope.key_off();
        }
    }

    fn sample_clock(&mut self, modulation_input: i16) -> i16 {
        let phase = self.phase.current_phase().wrapping_add_signed(modulation_input);

        // Phase is a 10-bit value representing 0 to 2*PI; hardware splits it into a
        // sign bit and a half-phase, computes amplitude from the half-phase, and
        // applies the sign at output
        let sign = phase.bit(9);
        let sine_attenuation = phase_to_attenuation(phase);

        let envelope_attenuation = self.envelope.current_attenuation();
        let envelope_am_attenuation = if self.am_enabled {
            let am_attenuation = lfo::amplitude_modulation(self.lfo_counter, self.am_sensitivity);
            (envelope_attenuation + am_attenuation).clamp(0, envelope::MAX_ATTENUATION)
        } else {
            envelope_attenuation
        };

        // Phase attenuation is 4.8 fixed-point, envelope attenuation 4.6
        let total_attenuation = sine_attenuation + (envelope_am_attenuation << 2);

        let amplitude = attenuation_to_amplitude(total_attenuation);
        let output = if sign { -(amplitude as i16) } else { amplitude as i16 };

        self.last_output = self.current_output;
        self.current_output = output;

        output
    }
}

#[inline]
fn phase_to_attenuation(phase: u16) -> u16 {
    // A half-sine log2-attenuation table, computed the way the hardware's quarter-sine
    // table is
    static LOG_SINE_TABLE: LazyLock<[u16; 512]> = LazyLock::new(|| {
        array::from_fn(|mut i| {
            use std::f64::consts::PI;

            if i.bit(8) {
                // Second quarter-phase
                i = (!i) & 0xFF;
            }

            // Indices are slightly offset to avoid log2(0)
            let n = ((i << 1) | 1) as f64;
            let sine = (n / 512.0 * PI / 2.0).sin();
            let attenuation = -sine.log2();

            // 12-bit values in 4.8 fixed point
            (attenuation * f64::from(1 << 8)).round() as u16
        })
    });

    LOG_SINE_TABLE[(phase & HALF_PHASE_MASK) as usize]
}

#[inline]
fn attenuation_to_amplitude(attenuation: u16) -> u16 {
    static POW2_TABLE: LazyLock<[u16; 256]> = LazyLock::new(|| {
        array::from_fn(|i| {
            // 2^(-n) for n in (0, 1]; index i represents (i + 1)/256
            let n = ((i + 1) as f64) / 256.0;
            let inverse_pow2 = 2.0_f64.powf(-n);

            // 11-bit values in 0.11 fixed point
            (inverse_pow2 * f64::from(1 << 11)).round() as u16
        })
    });

    // Attenuation is a 5.8 fixed-point number on a log2 scale
    let int_part = (attenuation >> 8) & 0x1F;
    if int_part >= 13 {
        // Guaranteed to shift down to 0
        return 0;
    }

    let fract_part = attenuation & 0xFF;
    let fract_pow2 = POW2_TABLE[fract_part as usize];
    (fract_pow2 << 2) >> int_part
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
enum FrequencyMode {
    #[default]
    Single,
    Multiple,
}

#[derive(Debug, Clone, Encode, Decode)]
struct FmChannel {
    operators: [FmOperator; 4],
    mode: FrequencyMode,
    pending_f_number_high: u8,
    f_number: u16,
    block: u8,
    pending_op_f_numbers_high: [u8; 3],
    operator_f_numbers: [u16; 3],
    operator_blocks: [u8; 3],
    algorithm: u8,
    feedback_level: u8,
    am_sensitivity: u8,
    fm_sensitivity: u8,
    l_output: bool,
    r_output: bool,
    current_output: i16,
}

impl FmChannel {
    fn new() -> Self {
        Self {
            operators: array::from_fn(|_| FmOperator::default()),
            mode: FrequencyMode::Single,
            pending_f_number_high: 0,
            f_number: 0,
            block: 0,
            pending_op_f_numbers_high: [0; 3],
            operator_f_numbers: [0; 3],
            operator_blocks: [0; 3],
            algorithm: 0,
            feedback_level: 0,
            am_sensitivity: 0,
            fm_sensitivity: 0,
            l_output: true,
            r_output: true,
            current_output: 0,
        }
    }

    #[inline]
    fn clock(&mut self, lfo_counter: u8) {
        for operator in &mut self.operators {
            operator.phase.clock(lfo_counter, self.fm_sensitivity);

            operator.lfo_counter = lfo_counter;
            operator.am_sensitivity = self.am_sensitivity;
        }

        self.generate_sample();
    }

    #[inline]
    fn envelope_clock(&mut self) {
        for operator in &mut self.operators {
            operator.envelope.clock(&mut operator.phase);
        }
    }

    fn generate_sample(&mut self) {
        macro_rules! carrier_sum {
            ($($carrier:expr),*) => {
                {
                    let mut sum = 0;
                    $(sum += $carrier;)*
                    sum.clamp(OPERATOR_OUTPUT_MIN, OPERATOR_OUTPUT_MAX)
                }
            }
        }

        let op1_feedback = match self.feedback_level {
            0 => 0,
            f => (self.operators[0].current_output + self.operators[0].last_output) >> (10 - f),
        };

        // Operator evaluation order is 1 -> 3 -> 2 -> 4; when two consecutive
        // operators are connected, the modulator's previous-cycle output is used
        let sample = match self.algorithm {
            0 => {
                // O1 -> O2 -> O3 -> O4 -> Output
                let m1 = self.operators[0].sample_clock(op1_feedback);

                let m2_old = self.operators[1].current_output;
                self.operators[1].sample_clock(m1 >> 1);

                let m3 = self.operators[2].sample_clock(m2_old >> 1);
                self.operators[3].sample_clock(m3 >> 1)
            }
            1 => {
                // (O1 + O2) -> O3 -> O4 -> Output
                let m1_old = self.operators[0].current_output;
                self.operators[0].sample_clock(op1_feedback);

                let m2_old = self.operators[1].current_output;
                self.operators[1].sample_clock(0);

                let m3 = self.operators[2].sample_clock((m1_old + m2_old) >> 1);
                self.operators[3].sample_clock(m3 >> 1)
            }
            2 => {
                // (O1 + (O2 -> O3)) -> O4 -> Output
                let m1 = self.operators[0].sample_clock(op1_feedback);

                let m2_old = self.operators[1].current_output;
                self.operators[1].sample_clock(0);

                let m3 = self.operators[2].sample_clock(m2_old >> 1);
                self.operators[3].sample_clock((m1 + m3) >> 1)
            }
            3 => {
                // ((O1 -> O2) + O3) -> O4 -> Output
                let m1 = self.operators[0].sample_clock(op1_feedback);

                let m2_old = self.operators[1].current_output;
                self.operators[1].sample_clock(m1 >> 1);

                let m3 = self.operators[2].sample_clock(0);
                self.operators[3].sample_clock((m2_old + m3) >> 1)
            }
            4 => {
                // (O1 -> O2) + (O3 -> O4) -> Output
                let m1 = self.operators[0].sample_clock(op1_feedback);
                let c2 = self.operators[1].sample_clock(m1 >> 1);
                let m3 = self.operators[2].sample_clock(0);
                let c4 = self.operators[3].sample_clock(m3 >> 1);

                carrier_sum!(c2, c4)
            }
            5 => {
                // O1 -> (O2 + O3 + O4) -> Output
                let m1_old = self.operators[0].current_output;
                let m1 = self.operators[0].sample_clock(op1_feedback);
                let c2 = self.operators[1].sample_clock(m1 >> 1);
                let c3 = self.operators[2].sample_clock(m1_old >> 1);
                let c4 = self.operators[3].sample_clock(m1 >> 1);

                carrier_sum!(c2, c3, c4)
            }
            6 => {
                // (O1 -> O2) + O3 + O4 -> Output
                let m1 = self.operators[0].sample_clock(op1_feedback);
                let c2 = self.operators[1].sample_clock(m1 >> 1);
                let c3 = self.operators[2].sample_clock(0);
                let c4 = self.operators[3].sample_clock(0);

                carrier_sum!(c2, c3, c4)
            }
            7 => {
                // O1 + O2 + O3 + O4 -> Output
                let c1 = self.operators[0].sample_clock(op1_feedback);
                let c2 = self.operators[1].sample_clock(0);
                let c3 = self.operators[2].sample_clock(0);
                let c4 = self.operators[3].sample_clock(0);

                carrier_sum!(c1, c2, c3, c4)
            }
            _ => panic!("invalid algorithm: {}", self.algorithm),
        };

        self.current_output = sample;
    }

    // Update phase generator F-numbers & blocks after channel-level F-number, block,
    // or frequency mode changes
    fn update_phase_generators(&mut self) {
        match self.mode {
            FrequencyMode::Single => {
                let f_number = self.f_number;
                let block = self.block;
                for operator in &mut self.operators {
                    operator.update_frequency(f_number, block);
                }
            }
            FrequencyMode::Multiple => {
                for i in 0..3 {
                    let f_number = self.operator_f_numbers[i];
                    let block = self.operator_blocks[i];

                    self.operators[i].update_frequency(f_number, block);
                }

                self.operators[3].update_frequency(self.f_number, self.block);
            }
        }
    }
}

impl Default for FmChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Ym2610 {
    channels: [FmChannel; 6],
    lfo: LowFrequencyOscillator,
    ssg: Ssg,
    adpcm: AdpcmA,
    selected_register: u8,
    second_address_set: bool,
    timer_a_interval: u16,
    timer_b_interval: u8,
    timer_a_loaded: bool,
    timer_b_loaded: bool,
    timer_a_flag_enabled: bool,
    timer_b_flag_enabled: bool,
    csm_enabled: bool,
    status_flags: u8,
    chip_timer: u64,
    eg_divider: u8,
}

impl Ym2610 {
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: array::from_fn(|_| FmChannel::default()),
            lfo: LowFrequencyOscillator::new(),
            ssg: Ssg::new(),
            adpcm: AdpcmA::new(),
            selected_register: 0,
            second_address_set: false,
            timer_a_interval: 0,
            timer_b_interval: 0,
            timer_a_loaded: false,
            timer_b_loaded: false,
            timer_a_flag_enabled: false,
            timer_b_flag_enabled: false,
            csm_enabled: false,
            status_flags: 0,
            chip_timer: 0,
            eg_divider: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// The INT line to the Z80, driven by the timer status flags.
    #[must_use]
    pub fn irq_line(&self) -> bool {
        self.status_flags & 0x03 != 0
    }

    #[must_use]
    pub fn read(&self, port: u8) -> u8 {
        match port & 3 {
            // Status 0: timer flags (busy flag not modeled)
            0 => self.status_flags & 0x03,
            1 => {
                if self.selected_register < 0x10 {
                    self.ssg.read_register(self.selected_register)
                } else if self.selected_register == 0xFF {
                    // Chip identification
                    0x01
                } else {
                    0
                }
            }
            // Status 1: ADPCM-A end-address flags
            2 => self.adpcm.arrived_flags(),
            _ => 0,
        }
    }

    pub fn write(&mut self, port: u8, value: u8, wheel: &mut TimerWheel) {
        match port & 3 {
            0 => {
                self.selected_register = value;
                self.second_address_set = false;
            }
            1 => {
                if self.second_address_set {
                    // Verified on real hardware: data writes go to whichever port's
                    // address register was written last
                    return;
                }

                let register = self.selected_register;
                match register {
                    0x00..=0x0F => self.ssg.write_register(register, value),
                    // ADPCM-B is not present on the Neo Geo CD; only the flag control
                    // register matters
                    0x1C => self.adpcm.write_flag_control(value),
                    0x10..=0x1B | 0x1D..=0x1F => {}
                    0x20..=0x2F => self.write_mode_register(register, value, wheel),
                    _ => self.write_fm_register(u16::from(register), value),
                }
            }
            2 => {
                self.selected_register = value;
                self.second_address_set = true;
            }
            _ => {
                if !self.second_address_set {
                    return;
                }

                let register = u16::from(self.selected_register) | 0x100;
                if register < 0x130 {
                    self.adpcm.write_register((register - 0x100) as u8, value);
                } else {
                    self.write_fm_register(register, value);
                }
            }
        }
    }

    fn write_mode_register(&mut self, register: u8, value: u8, wheel: &mut TimerWheel) {
        match register {
            0x22 => {
                self.lfo.set_enabled(value.bit(3));
                self.lfo.set_frequency(value & 0x07);
            }
            0x24 => {
                self.timer_a_interval = (self.timer_a_interval & 3) | (u16::from(value) << 2);
                if self.timer_a_loaded {
                    let _ = wheel.timer_mut(TimerId::Ym2610A).arm(self.timer_a_period());
                }
            }
            0x25 => {
                self.timer_a_interval = (self.timer_a_interval & !3) | u16::from(value & 3);
                if self.timer_a_loaded {
                    let _ = wheel.timer_mut(TimerId::Ym2610A).arm(self.timer_a_period());
                }
            }
            0x26 => {
                self.timer_b_interval = value;
                if self.timer_b_loaded {
                    let _ = wheel.timer_mut(TimerId::Ym2610B).arm(self.timer_b_period());
                }
            }
            0x27 => {
                self.csm_enabled = value & 0xC0 == 0x80;

                let mode = if value & 0xC0 != 0 {
                    FrequencyMode::Multiple
                } else {
                    FrequencyMode::Single
                };
                let channel = &mut self.channels[2];
                channel.mode = mode;
                channel.update_phase_generators();

                let load_a = value.bit(0);
                if load_a && !self.timer_a_loaded {
                    let _ = wheel.timer_mut(TimerId::Ym2610A).arm(self.timer_a_period());
                } else if !load_a {
                    let _ = wheel.timer_mut(TimerId::Ym2610A).set_state(TimerState::Stopped);
                }
                self.timer_a_loaded = load_a;

                let load_b = value.bit(1);
                if load_b && !self.timer_b_loaded {
                    let _ = wheel.timer_mut(TimerId::Ym2610B).arm(self.timer_b_period());
                } else if !load_b {
                    let _ = wheel.timer_mut(TimerId::Ym2610B).set_state(TimerState::Stopped);
                }
                self.timer_b_loaded = load_b;

                self.timer_a_flag_enabled = value.bit(2);
                self.timer_b_flag_enabled = value.bit(3);

                if value.bit(4) {
                    self.status_flags &= !0x01;
                }
                if value.bit(5) {
                    self.status_flags &= !0x02;
                }
            }
            0x28 => {
                let offset = value & 0x03;
                if offset == 3 {
                    return;
                }

                let channel_idx = if value.bit(2) { 3 + offset as usize } else { offset as usize };
                let channel = &mut self.channels[channel_idx];
                channel.operators[0].key_on_or_off(value.bit(4));
                channel.operators[1].key_on_or_off(value.bit(5));
                channel.operators[2].key_on_or_off(value.bit(6));
                channel.operators[3].key_on_or_off(value.bit(7));
            }
            _ => {}
        }
    }

    fn write_fm_register(&mut self, register: u16, value: u8) {
        let base_channel = if register & 0x100 != 0 { 3 } else { 0 };
        let register = (register & 0xFF) as u8;

        match register {
            0x30..=0x9F => self.write_operator_level_register(register, value, base_channel),
            0xA0..=0xBF => self.write_channel_level_register(register, value, base_channel),
            _ => {}
        }
    }

    fn write_operator_level_register(&mut self, register: u8, value: u8, base_channel: usize) {
        let channel_offset = register & 0x03;
        if channel_offset == 3 {
            return;
        }

        let channel_idx = base_channel + channel_offset as usize;
        // Operator index comes from register bits 2-3, with the middle two swapped
        let operator_idx = (((register & 0x08) >> 3) | ((register & 0x04) >> 1)) as usize;

        let operator = &mut self.channels[channel_idx].operators[operator_idx];
        match register >> 4 {
            0x03 => {
                operator.phase.multiple = value & 0x0F;
                operator.phase.detune = (value >> 4) & 0x07;
            }
            0x04 => {
                operator.envelope.total_level = value & 0x7F;
            }
            0x05 => {
                operator.envelope.attack_rate = value & 0x1F;
                operator.update_key_scale(value >> 6);
            }
            0x06 => {
                operator.envelope.decay_rate = value & 0x1F;
                operator.am_enabled = value.bit(7);
            }
            0x07 => {
                operator.envelope.sustain_rate = value & 0x1F;
            }
            0x08 => {
                operator.envelope.release_rate = value & 0x0F;
                operator.envelope.sustain_level = value >> 4;
            }
            0x09 => {
                operator.envelope.write_ssg_register(value);
            }
            _ => unreachable!("register is in 0x30..=0x9F"),
        }
    }

    fn write_channel_level_register(&mut self, register: u8, value: u8, base_channel: usize) {
        match register {
            0xA0..=0xA2 => {
                // F-number low bits; the pending high bits take effect now
                let channel = &mut self.channels[base_channel + (register & 0x03) as usize];
                channel.f_number =
                    (u16::from(channel.pending_f_number_high & 7) << 8) | u16::from(value);
                channel.block = channel.pending_f_number_high >> 3;
                channel.update_phase_generators();
            }
            0xA4..=0xA6 => {
                let channel = &mut self.channels[base_channel + (register & 0x03) as usize];
                channel.pending_f_number_high = value & 0x3F;
            }
            0xA8..=0xAA => {
                // Operator-level F-numbers for the 3-slot channel (port A only)
                if base_channel != 0 {
                    return;
                }

                let operator_idx = match register {
                    0xA8 => 2,
                    0xA9 => 0,
                    0xAA => 1,
                    _ => unreachable!("nested match expressions"),
                };
                let channel = &mut self.channels[2];

                let high = channel.pending_op_f_numbers_high[operator_idx];
                channel.operator_f_numbers[operator_idx] =
                    (u16::from(high & 7) << 8) | u16::from(value);
                channel.operator_blocks[operator_idx] = high >> 3;
                if channel.mode == FrequencyMode::Multiple {
                    channel.update_phase_generators();
                }
            }
            0xAC..=0xAE => {
                if base_channel != 0 {
                    return;
                }

                let operator_idx = match register {
                    0xAC => 2,
                    0xAD => 0,
                    0xAE => 1,
                    _ => unreachable!("nested match expressions"),
                };
                self.channels[2].pending_op_f_numbers_high[operator_idx] = value & 0x3F;
            }
            0xB0..=0xB2 => {
                let channel = &mut self.channels[base_channel + (register & 0x03) as usize];
                channel.algorithm = value & 0x07;
                channel.feedback_level = (value >> 3) & 0x07;
            }
            0xB4..=0xB6 => {
                let channel = &mut self.channels[base_channel + (register & 0x03) as usize];
                channel.l_output = value.bit(7);
                channel.r_output = value.bit(6);
                channel.am_sensitivity = (value >> 4) & 0x03;
                channel.fm_sensitivity = value & 0x07;
            }
            _ => {}
        }
    }

    fn timer_a_period(&self) -> i32 {
        // Timer A counts up from its 10-bit interval once per 72 chip clocks
        seconds_to_master(72.0 * f64::from(1024 - self.timer_a_interval) / CHIP_CLOCK).max(1)
    }

    fn timer_b_period(&self) -> i32 {
        // Timer B is 8-bit with a fixed x16 prescale
        seconds_to_master(1152.0 * f64::from(256 - u16::from(self.timer_b_interval)) / CHIP_CLOCK)
            .max(1)
    }

    /// A wheel timer expired: raise the status flag if enabled, re-arm while the load
    /// bit is still set, and run the CSM key pulse for timer A.
    pub fn timer_over(&mut self, timer: TimerId, wheel: &mut TimerWheel) {
        match timer {
            TimerId::Ym2610A => {
                if self.timer_a_flag_enabled {
                    self.status_flags |= 0x01;
                }
                if self.timer_a_loaded {
                    let _ = wheel.timer_mut(TimerId::Ym2610A).arm_relative(self.timer_a_period());
                }

                if self.csm_enabled {
                    // CSM: key on & off every operator in the 3-slot channel that is
                    // not already keyed on
                    for operator in &mut self.channels[2].operators {
                        if !operator.envelope.is_key_on() {
                            operator.key_on_or_off(true);
                            operator.key_on_or_off(false);
                        }
                    }
                }
            }
            TimerId::Ym2610B => {
                if self.timer_b_flag_enabled {
                    self.status_flags |= 0x02;
                }
                if self.timer_b_loaded {
                    let _ = wheel.timer_mut(TimerId::Ym2610B).arm_relative(self.timer_b_period());
                }
            }
            _ => panic!("timer_over called with a non-YM2610 timer"),
        }
    }

    /// Generate `count` stereo samples into the audio buffer.
    pub fn update(&mut self, count: u32, pcm_ram: &[u8; PCM_RAM_LEN], audio: &mut AudioBuffer) {
        self.ssg.begin_update(count);

        for _ in 0..count {
            // Advance the chip-rate clocks: LFO every internal sample, envelopes
            // every third
            self.chip_timer += FREQ_BASE_FP;
            while self.chip_timer >= 1 << 16 {
                self.chip_timer -= 1 << 16;

                self.lfo.tick();

                self.eg_divider += 1;
                if self.eg_divider == 3 {
                    self.eg_divider = 0;
                    for channel_idx in ACTIVE_FM_CHANNELS {
                        self.channels[channel_idx].envelope_clock();
                    }
                }
            }

            let lfo_counter = self.lfo.counter();
            for channel_idx in ACTIVE_FM_CHANNELS {
                self.channels[channel_idx].clock(lfo_counter);
            }

            let ssg_output = self.ssg.calc();

            let mut pan_buses = [0_i32; 4];
            self.adpcm.calc(pcm_ram, &mut pan_buses);

            let mut left = pan_buses[adpcm::Pan::Left as usize]
                + pan_buses[adpcm::Pan::Center as usize];
            let mut right = pan_buses[adpcm::Pan::Right as usize]
                + pan_buses[adpcm::Pan::Center as usize];

            left += ssg_output;
            right += ssg_output;

            // The FM right shift was verified on real hardware
            for channel_idx in ACTIVE_FM_CHANNELS {
                let channel = &self.channels[channel_idx];
                let output = i32::from(channel.current_output) >> 1;
                if channel.l_output {
                    left += output;
                }
                if channel.r_output {
                    right += output;
                }
            }

            audio.append_sample(Sample {
                left: left.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16,
                right: right.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16,
            });
        }
    }
}

impl Default for Ym2610 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed_pcm_ram() -> Box<[u8; PCM_RAM_LEN]> {
        vec![0_u8; PCM_RAM_LEN].into_boxed_slice().try_into().unwrap()
    }

    #[test]
    fn update_appends_requested_sample_count() {
        let mut ym2610 = Ym2610::new();
        let mut audio = AudioBuffer::new();
        let pcm_ram = boxed_pcm_ram();

        let count = audio.init_frame(false);
        ym2610.update(count, &pcm_ram, &mut audio);

        assert_eq!(audio.write_pointer(), count);
    }

    #[test]
    fn timer_a_write_arms_wheel_timer() {
        let mut ym2610 = Ym2610::new();
        let mut wheel = TimerWheel::new();

        // Timer A interval, then load
        ym2610.write(0, 0x24, &mut wheel);
        ym2610.write(1, 0xFF, &mut wheel);
        ym2610.write(0, 0x25, &mut wheel);
        ym2610.write(1, 0x03, &mut wheel);
        ym2610.write(0, 0x27, &mut wheel);
        ym2610.write(1, 0x05, &mut wheel);

        assert!(wheel.timer(TimerId::Ym2610A).is_active());

        // Interval 0x3FF: one chip-timer step of 72 cycles
        let expected = seconds_to_master(72.0 / CHIP_CLOCK).max(1);
        assert_eq!(wheel.timer(TimerId::Ym2610A).delay(), expected);
    }

    #[test]
    fn timer_overflow_sets_flag_and_irq_when_enabled() {
        let mut ym2610 = Ym2610::new();
        let mut wheel = TimerWheel::new();

        ym2610.write(0, 0x27, &mut wheel);
        ym2610.write(1, 0x05, &mut wheel);

        assert!(!ym2610.irq_line());
        ym2610.timer_over(TimerId::Ym2610A, &mut wheel);
        assert!(ym2610.irq_line());
        assert_eq!(ym2610.read(0) & 0x01, 0x01);

        // Flag reset clears the interrupt
        ym2610.write(0, 0x27, &mut wheel);
        ym2610.write(1, 0x15, &mut wheel);
        assert!(!ym2610.irq_line());
    }

    #[test]
    fn timer_overflow_without_flag_enable_is_silent() {
        let mut ym2610 = Ym2610::new();
        let mut wheel = TimerWheel::new();

        ym2610.write(0, 0x27, &mut wheel);
        ym2610.write(1, 0x01, &mut wheel);

        ym2610.timer_over(TimerId::Ym2610A, &mut wheel);
        assert!(!ym2610.irq_line());

        // But the timer re-arms because the load bit is still set
        assert!(wheel.timer(TimerId::Ym2610A).is_active());
    }

    #[test]
    fn keyed_on_fm_channel_produces_output() {
        let mut ym2610 = Ym2610::new();
        let mut wheel = TimerWheel::new();
        let mut audio = AudioBuffer::new();
        let pcm_ram = boxed_pcm_ram();

        let write = |ym: &mut Ym2610, wheel: &mut TimerWheel, reg: u8, value: u8| {
            ym.write(0, reg, wheel);
            ym.write(1, value, wheel);
        };

        // Channel 2 (first active slot), operator 4 as a simple carrier
        write(&mut ym2610, &mut wheel, 0x3D, 0x01); // multiple 1
        write(&mut ym2610, &mut wheel, 0x4D, 0x00); // total level 0
        write(&mut ym2610, &mut wheel, 0x5D, 0x1F); // attack rate max
        write(&mut ym2610, &mut wheel, 0x8D, 0x00); // sustain level 0
        write(&mut ym2610, &mut wheel, 0xB1, 0x07); // algorithm 7
        write(&mut ym2610, &mut wheel, 0xB5, 0xC0); // both outputs
        write(&mut ym2610, &mut wheel, 0xA5, 0x22); // block/f-num high
        write(&mut ym2610, &mut wheel, 0xA1, 0x69); // f-num low
        write(&mut ym2610, &mut wheel, 0x28, 0xF1); // key on channel 2, all slots

        let count = audio.init_frame(false);
        ym2610.update(count, &pcm_ram, &mut audio);

        let nonzero = audio.frame_samples().iter().any(|sample| sample.left != 0);
        assert!(nonzero, "keyed-on FM channel should produce audible output");
    }
}
