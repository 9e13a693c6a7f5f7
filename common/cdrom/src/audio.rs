//! Audio track decoders. Every format is decoded to interleaved little-endian 16-bit
//! stereo PCM at 44.1 kHz; anything else in a cue sheet is rejected at load time.

use crate::toc::TrackType;
use crate::{CdRomError, CdRomResult};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

pub const BYTES_PER_SAMPLE: u64 = 4;

fn unsupported(path: &Path, reason: impl Into<String>) -> CdRomError {
    CdRomError::UnsupportedAudioFile { path: path.display().to_string(), reason: reason.into() }
}

/// Inspect an audio file referenced by a `FILE ... WAVE` line and return its track type
/// together with the size of its decoded PCM data in bytes.
pub fn probe_audio_file(path: &Path) -> CdRomResult<(TrackType, u64)> {
    let extension =
        path.extension().and_then(|ext| ext.to_str()).unwrap_or("").to_ascii_lowercase();

    match extension.as_str() {
        "wav" => {
            let reader = hound::WavReader::open(path)
                .map_err(|err| unsupported(path, err.to_string()))?;
            validate_wav_spec(path, reader.spec())?;
            Ok((TrackType::AudioWav, u64::from(reader.duration()) * BYTES_PER_SAMPLE))
        }
        "flac" | "ogg" => {
            let (format, track_id) = open_compressed(path, &extension)?;
            let track = format
                .tracks()
                .iter()
                .find(|track| track.id == track_id)
                .expect("track id was just selected from this format reader");

            let params = &track.codec_params;
            if params.sample_rate != Some(44_100) {
                return Err(unsupported(path, "sample rate must be 44100 Hz"));
            }
            if params.channels.map(symphonia::core::audio::Channels::count) != Some(2) {
                return Err(unsupported(path, "must be stereo"));
            }

            let Some(frames) = params.n_frames else {
                return Err(unsupported(path, "stream does not declare its length"));
            };

            let track_type =
                if extension == "flac" { TrackType::AudioFlac } else { TrackType::AudioOgg };
            Ok((track_type, frames * BYTES_PER_SAMPLE))
        }
        _ => Err(unsupported(path, format!("unrecognized extension '{extension}'"))),
    }
}

fn validate_wav_spec(path: &Path, spec: hound::WavSpec) -> CdRomResult<()> {
    if spec.channels != 2
        || spec.sample_rate != 44_100
        || spec.bits_per_sample != 16
        || spec.sample_format != hound::SampleFormat::Int
    {
        return Err(unsupported(path, "WAV audio must be 16-bit stereo PCM at 44100 Hz"));
    }

    Ok(())
}

fn open_compressed(path: &Path, extension: &str) -> CdRomResult<(Box<dyn FormatReader>, u32)> {
    let file = File::open(path).map_err(|source| CdRomError::TrackFileOpen {
        path: path.display().to_string(),
        source,
    })?;

    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    hint.with_extension(extension);

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|err| unsupported(path, err.to_string()))?;

    let format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|track| track.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| unsupported(path, "no decodable audio track"))?;

    let track_id = track.id;
    Ok((format, track_id))
}

/// Raw PCM audio read straight out of a BIN file.
#[derive(Debug)]
pub struct PcmReader {
    file: BufReader<File>,
}

impl PcmReader {
    pub fn open(path: &Path) -> CdRomResult<Self> {
        let file = File::open(path).map_err(|source| CdRomError::TrackFileOpen {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self { file: BufReader::new(file) })
    }

    pub fn seek(&mut self, byte_offset: u64) -> CdRomResult<()> {
        self.file.seek(SeekFrom::Start(byte_offset)).map_err(CdRomError::DiscReadIo)?;
        Ok(())
    }

    pub fn read(&mut self, out: &mut [u8]) -> CdRomResult<usize> {
        let mut done = 0;
        while done < out.len() {
            let n = self.file.read(&mut out[done..]).map_err(CdRomError::DiscReadIo)?;
            if n == 0 {
                break;
            }
            done += n;
        }

        Ok(done)
    }
}

/// WAV audio decoded through hound.
pub struct WavDecoder {
    reader: hound::WavReader<BufReader<File>>,
    remaining_samples: u64,
}

impl WavDecoder {
    pub fn open(path: &Path) -> CdRomResult<Self> {
        let reader =
            hound::WavReader::open(path).map_err(|err| unsupported(path, err.to_string()))?;
        validate_wav_spec(path, reader.spec())?;

        let remaining_samples = u64::from(reader.duration()) * 2;
        Ok(Self { reader, remaining_samples })
    }

    /// Seek to a byte offset within the decoded PCM stream.
    pub fn seek(&mut self, byte_offset: u64) -> CdRomResult<()> {
        let frame = (byte_offset / BYTES_PER_SAMPLE) as u32;
        let total_frames = self.reader.duration();

        self.reader.seek(frame.min(total_frames)).map_err(CdRomError::DiscReadIo)?;
        self.remaining_samples = u64::from(total_frames.saturating_sub(frame)) * 2;

        Ok(())
    }

    pub fn read(&mut self, out: &mut [u8]) -> CdRomResult<usize> {
        let mut done = 0;

        {
            let mut samples = self.reader.samples::<i16>();
            while done + 2 <= out.len() && self.remaining_samples != 0 {
                let Some(sample) = samples.next() else { break };
                let sample = sample.map_err(|err| match err {
                    hound::Error::IoError(io_err) => CdRomError::DiscReadIo(io_err),
                    other => CdRomError::DiscReadIo(std::io::Error::other(other.to_string())),
                })?;

                out[done..done + 2].copy_from_slice(&sample.to_le_bytes());
                done += 2;
                self.remaining_samples -= 1;
            }
        }

        Ok(done)
    }
}

impl std::fmt::Debug for WavDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WavDecoder {{ remaining_samples: {} }}", self.remaining_samples)
    }
}

/// FLAC or Ogg Vorbis audio decoded through symphonia.
pub struct CompressedDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    // Decoded bytes not yet handed to the caller
    pending: Vec<u8>,
    pending_offset: usize,
    // Sample frames to discard after a coarse container seek
    skip_frames: u64,
    finished: bool,
}

impl CompressedDecoder {
    pub fn open(path: &Path, track_type: TrackType) -> CdRomResult<Self> {
        let extension = match track_type {
            TrackType::AudioFlac => "flac",
            TrackType::AudioOgg => "ogg",
            _ => panic!("CompressedDecoder only handles FLAC and Ogg tracks"),
        };

        let (format, track_id) = open_compressed(path, extension)?;
        let decoder = {
            let track = format
                .tracks()
                .iter()
                .find(|track| track.id == track_id)
                .expect("track id was just selected from this format reader");
            symphonia::default::get_codecs()
                .make(&track.codec_params, &DecoderOptions::default())
                .map_err(|err| unsupported(path, err.to_string()))?
        };

        Ok(Self {
            format,
            decoder,
            track_id,
            pending: Vec::new(),
            pending_offset: 0,
            skip_frames: 0,
            finished: false,
        })
    }

    /// Seek to a byte offset within the decoded PCM stream. The container seek is only
    /// frame-accurate, so the next reads discard any leading frames the demuxer
    /// rewinds to.
    pub fn seek(&mut self, byte_offset: u64) -> CdRomResult<()> {
        let target_frame = byte_offset / BYTES_PER_SAMPLE;

        match self.format.seek(
            SeekMode::Accurate,
            SeekTo::TimeStamp { ts: target_frame, track_id: self.track_id },
        ) {
            Ok(seeked_to) => {
                self.skip_frames = seeked_to.required_ts.saturating_sub(seeked_to.actual_ts);
                self.finished = false;
            }
            Err(err) => {
                log::warn!("Audio seek to frame {target_frame} failed: {err}");
                self.finished = true;
            }
        }

        self.decoder.reset();
        self.pending.clear();
        self.pending_offset = 0;

        Ok(())
    }

    pub fn read(&mut self, out: &mut [u8]) -> CdRomResult<usize> {
        let mut done = 0;

        while done < out.len() {
            if self.pending_offset < self.pending.len() {
                let n = (out.len() - done).min(self.pending.len() - self.pending_offset);
                out[done..done + n]
                    .copy_from_slice(&self.pending[self.pending_offset..self.pending_offset + n]);
                self.pending_offset += n;
                done += n;
                continue;
            }

            if self.finished || !self.decode_next_packet() {
                break;
            }
        }

        Ok(done)
    }

    fn decode_next_packet(&mut self) -> bool {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::ResetRequired) | Err(SymphoniaError::IoError(_)) => {
                    self.finished = true;
                    return false;
                }
                Err(err) => {
                    log::warn!("Error demuxing audio packet: {err}");
                    self.finished = true;
                    return false;
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let mut sample_buffer =
                        SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
                    sample_buffer.copy_interleaved_ref(decoded);

                    let mut samples = sample_buffer.samples();
                    let skip_samples = (self.skip_frames * 2).min(samples.len() as u64) as usize;
                    self.skip_frames -= (skip_samples as u64) / 2;
                    samples = &samples[skip_samples..];

                    self.pending.clear();
                    self.pending_offset = 0;
                    self.pending.reserve(samples.len() * 2);
                    for &sample in samples {
                        self.pending.extend_from_slice(&sample.to_le_bytes());
                    }

                    return true;
                }
                Err(SymphoniaError::DecodeError(err)) => {
                    // Skip the damaged packet and keep going
                    log::warn!("Error decoding audio packet: {err}");
                }
                Err(err) => {
                    log::warn!("Error decoding audio packet: {err}");
                    self.finished = true;
                    return false;
                }
            }
        }
    }
}

impl std::fmt::Debug for CompressedDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CompressedDecoder {{ track_id: {}, pending: {}, finished: {} }}",
            self.track_id,
            self.pending.len() - self.pending_offset,
            self.finished
        )
    }
}
