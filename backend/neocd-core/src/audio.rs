//! Per-frame audio buffering: YM2610 output accumulates over the frame, CD-DA samples
//! arrive from the decode pipeline at frame start, and the two are mixed with
//! saturating adds at frame end.

use crate::timer::{round_i32, CYCLES_PER_FRAME, FRAME_RATE};
use bincode::{Decode, Encode};

pub const SAMPLE_RATE: u32 = 44_100;

/// Samples per frame is not an integer; the fractional remainder carries across frames
/// so the long-run output rate is exactly 44.1 kHz.
pub const SAMPLES_PER_FRAME: f64 = SAMPLE_RATE as f64 / FRAME_RATE;

pub const CD_BUFFER_LEN: usize = round_i32(SAMPLES_PER_FRAME + 1.0) as usize;

// The 68K can overshoot the end of frame by one long instruction, which can produce an
// extra sample or two of YM output
pub const YM_BUFFER_LEN: usize = CD_BUFFER_LEN + 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Encode, Decode)]
pub struct Sample {
    pub left: i16,
    pub right: i16,
}

#[must_use]
pub fn saturated_add(a: i16, b: i16) -> i16 {
    a.saturating_add(b)
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct AudioBuffer {
    samples_this_frame_f: f64,
    sample_count: u32,
    has_cd_audio: bool,
    cd_samples: [Sample; CD_BUFFER_LEN],
    ym_samples: [Sample; YM_BUFFER_LEN],
    write_pointer: u32,
}

impl AudioBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            samples_this_frame_f: 0.0,
            sample_count: 0,
            has_cd_audio: false,
            cd_samples: [Sample::default(); CD_BUFFER_LEN],
            ym_samples: [Sample::default(); YM_BUFFER_LEN],
            write_pointer: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    #[must_use]
    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    #[must_use]
    pub fn has_cd_audio(&self) -> bool {
        self.has_cd_audio
    }

    #[must_use]
    pub fn write_pointer(&self) -> u32 {
        self.write_pointer
    }

    /// Begin a new frame: derive this frame's sample count from the fractional
    /// accumulator, and carry over any samples the YM2610 generated past the previous
    /// frame's end. Returns the sample count.
    pub fn init_frame(&mut self, has_cd_audio: bool) -> u32 {
        self.samples_this_frame_f += SAMPLES_PER_FRAME;
        let samples = self.samples_this_frame_f as u32;
        self.samples_this_frame_f -= f64::from(samples);

        debug_assert!((samples as usize) <= CD_BUFFER_LEN);

        if self.write_pointer > self.sample_count {
            let (start, end) = (self.sample_count as usize, self.write_pointer as usize);
            self.ym_samples.copy_within(start..end, 0);
            self.write_pointer -= self.sample_count;
        } else {
            self.write_pointer = 0;
        }

        self.sample_count = samples;
        self.has_cd_audio = has_cd_audio;

        samples
    }

    /// Install this frame's CD-DA samples from raw little-endian PCM bytes
    /// (`sample_count * 4` of them).
    pub fn fill_cd_samples(&mut self, bytes: &[u8]) {
        for (sample, chunk) in self.cd_samples.iter_mut().zip(bytes.chunks_exact(4)) {
            sample.left = i16::from_le_bytes([chunk[0], chunk[1]]);
            sample.right = i16::from_le_bytes([chunk[2], chunk[3]]);
        }
    }

    pub fn append_sample(&mut self, sample: Sample) {
        debug_assert!((self.write_pointer as usize) < YM_BUFFER_LEN);

        self.ym_samples[self.write_pointer as usize] = sample;
        self.write_pointer += 1;
    }

    /// Saturating-add the CD samples into the YM samples for this frame.
    pub fn mix(&mut self) {
        if !self.has_cd_audio {
            return;
        }

        for i in 0..self.sample_count as usize {
            let cd = self.cd_samples[i];
            let ym = &mut self.ym_samples[i];
            ym.left = saturated_add(ym.left, cd.left);
            ym.right = saturated_add(ym.right, cd.right);
        }
    }

    /// Map master cycles elapsed this frame to a sample index.
    #[must_use]
    pub fn master_cycles_to_sample(&self, cycles: i32) -> i32 {
        (f64::from(self.sample_count) * f64::from(cycles) / f64::from(CYCLES_PER_FRAME)) as i32
    }

    #[must_use]
    pub fn master_cycles_to_sample_clamped(&self, cycles: i32) -> i32 {
        self.master_cycles_to_sample(cycles).clamp(0, self.sample_count.saturating_sub(1) as i32)
    }

    /// The current CD-DA sample, for the guest-visible sample tap registers.
    #[must_use]
    pub fn current_cd_sample(&self, cycles_this_frame: i32) -> Sample {
        self.cd_samples[self.master_cycles_to_sample_clamped(cycles_this_frame) as usize]
    }

    /// The finished frame's samples, for the frontend.
    #[must_use]
    pub fn frame_samples(&self) -> &[Sample] {
        &self.ym_samples[..self.sample_count as usize]
    }
}

impl Default for AudioBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturated_add_clamps() {
        assert_eq!(saturated_add(-30_000, -30_000), i16::MIN);
        assert_eq!(saturated_add(30_000, 30_000), i16::MAX);
        assert_eq!(saturated_add(-100, 250), 150);
    }

    #[test]
    fn long_run_sample_rate_is_exact() {
        let mut buffer = AudioBuffer::new();

        let frames = 1000;
        let mut total: u64 = 0;
        for _ in 0..frames {
            let count = buffer.init_frame(false);
            assert!((count as usize) <= CD_BUFFER_LEN);
            total += u64::from(count);
        }

        let expected = (frames as f64 * SAMPLES_PER_FRAME).round() as u64;
        assert!(total.abs_diff(expected) <= 1, "{total} vs {expected}");
    }

    #[test]
    fn overflow_samples_carry_to_next_frame() {
        let mut buffer = AudioBuffer::new();
        let count = buffer.init_frame(false);

        for i in 0..count + 2 {
            buffer.append_sample(Sample { left: i as i16, right: 0 });
        }

        let next_count = buffer.init_frame(false);
        assert!(next_count > 0);
        assert_eq!(buffer.write_pointer(), 2);
        assert_eq!(buffer.ym_samples[0].left, count as i16);
        assert_eq!(buffer.ym_samples[1].left, (count + 1) as i16);
    }

    #[test]
    fn mix_saturates_per_channel() {
        let mut buffer = AudioBuffer::new();
        let count = buffer.init_frame(true);

        buffer.cd_samples[0] = Sample { left: -30_000, right: 30_000 };
        buffer.append_sample(Sample { left: -30_000, right: 30_000 });
        for _ in 1..count {
            buffer.append_sample(Sample::default());
        }

        buffer.mix();
        assert_eq!(buffer.ym_samples[0], Sample { left: i16::MIN, right: i16::MAX });
    }

    #[test]
    fn cycle_to_sample_mapping_is_clamped() {
        let mut buffer = AudioBuffer::new();
        let count = buffer.init_frame(false);

        assert_eq!(buffer.master_cycles_to_sample_clamped(-50), 0);
        assert_eq!(buffer.master_cycles_to_sample_clamped(0), 0);
        assert_eq!(
            buffer.master_cycles_to_sample_clamped(CYCLES_PER_FRAME * 2),
            (count - 1) as i32
        );
    }
}
