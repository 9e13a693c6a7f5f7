//! The CD audio pipeline: a worker thread decodes track audio into a ring buffer that
//! the emulation thread drains once per frame.
//!
//! The worker owns its own file handles; all control (play/stop, seeks, track changes)
//! comes from the emulation thread, which reconfigures the decoder while holding the
//! ring lock and then notifies the worker.

use crate::audio::{CompressedDecoder, PcmReader, WavDecoder};
use crate::toc::chd::ChdReader;
use crate::toc::TrackType;
use crate::CdRomResult;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

pub const RING_CAPACITY: usize = 1024 * 1024;

// Decoded bytes per worker wakeup; small enough to keep the lock hold times short
const DECODE_SLICE_LEN: usize = 3000;

#[derive(Debug)]
pub struct CircularBuffer {
    buffer: Box<[u8]>,
    read_pos: usize,
    len: usize,
}

impl CircularBuffer {
    fn new(capacity: usize) -> Self {
        Self { buffer: vec![0; capacity].into_boxed_slice(), read_pos: 0, len: 0 }
    }

    #[must_use]
    pub fn available_to_read(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn available_to_write(&self) -> usize {
        self.buffer.len() - self.len
    }

    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.len = 0;
    }

    pub fn push_back(&mut self, data: &[u8]) {
        assert!(data.len() <= self.available_to_write(), "circular buffer overflow");

        let write_pos = (self.read_pos + self.len) % self.buffer.len();
        let first = data.len().min(self.buffer.len() - write_pos);
        self.buffer[write_pos..write_pos + first].copy_from_slice(&data[..first]);
        self.buffer[..data.len() - first].copy_from_slice(&data[first..]);

        self.len += data.len();
    }

    pub fn pop_front(&mut self, out: &mut [u8]) {
        assert!(out.len() <= self.len, "circular buffer underflow");

        let out_len = out.len();
        let first = out_len.min(self.buffer.len() - self.read_pos);
        out[..first].copy_from_slice(&self.buffer[self.read_pos..self.read_pos + first]);
        out[first..].copy_from_slice(&self.buffer[..out_len - first]);

        self.read_pos = (self.read_pos + out.len()) % self.buffer.len();
        self.len -= out.len();
    }
}

/// Where the worker should decode from: a track file plus a byte offset into its
/// decoded PCM stream.
#[derive(Debug)]
pub struct TrackCursor {
    pub track_type: TrackType,
    pub path: PathBuf,
    pub byte_offset: u64,
}

#[derive(Debug)]
enum AudioReader {
    Pcm(PcmReader),
    Wav(WavDecoder),
    Compressed(CompressedDecoder),
    Chd(ChdReader),
}

impl AudioReader {
    fn open(cursor: &TrackCursor) -> CdRomResult<Self> {
        let is_chd = cursor
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("chd"));

        let mut reader = if is_chd {
            Self::Chd(ChdReader::open(&cursor.path)?)
        } else {
            match cursor.track_type {
                TrackType::AudioPcm => Self::Pcm(PcmReader::open(&cursor.path)?),
                TrackType::AudioWav => Self::Wav(WavDecoder::open(&cursor.path)?),
                TrackType::AudioFlac | TrackType::AudioOgg => {
                    Self::Compressed(CompressedDecoder::open(&cursor.path, cursor.track_type)?)
                }
                TrackType::Silence | TrackType::Mode1_2048 | TrackType::Mode1_2352 => {
                    panic!("audio reader opened for a non-audio track type")
                }
            }
        };

        reader.seek(cursor.byte_offset)?;

        Ok(reader)
    }

    fn seek(&mut self, byte_offset: u64) -> CdRomResult<()> {
        match self {
            Self::Pcm(reader) => reader.seek(byte_offset),
            Self::Wav(decoder) => decoder.seek(byte_offset),
            Self::Compressed(decoder) => decoder.seek(byte_offset),
            Self::Chd(reader) => {
                reader.seek(byte_offset);
                Ok(())
            }
        }
    }

    fn read(&mut self, out: &mut [u8]) -> CdRomResult<usize> {
        match self {
            Self::Pcm(reader) => reader.read(out),
            Self::Wav(decoder) => decoder.read(out),
            Self::Compressed(decoder) => decoder.read(out),
            Self::Chd(reader) => reader.read_audio(out),
        }
    }
}

#[derive(Debug)]
struct PipeState {
    ring: CircularBuffer,
    reader: Option<AudioReader>,
    playing: bool,
    audio_track: bool,
}

#[derive(Debug)]
struct PipeShared {
    state: Mutex<PipeState>,
    signal: Condvar,
    exit: AtomicBool,
}

/// Emulation-thread handle to the decode pipeline. Dropping it stops and joins the
/// worker.
#[derive(Debug)]
pub struct AudioPipe {
    shared: Arc<PipeShared>,
    worker: Option<JoinHandle<()>>,
}

impl AudioPipe {
    #[must_use]
    #[allow(clippy::missing_panics_doc)]
    pub fn new() -> Self {
        let shared = Arc::new(PipeShared {
            state: Mutex::new(PipeState {
                ring: CircularBuffer::new(RING_CAPACITY),
                reader: None,
                playing: false,
                audio_track: false,
            }),
            signal: Condvar::new(),
            exit: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("cd-audio-decoder".into())
            .spawn(move || decode_worker(&worker_shared))
            .expect("failed to spawn CD audio decoder thread");

        Self { shared, worker: Some(worker) }
    }

    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.shared.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn set_playing(&self, playing: bool) {
        self.lock().playing = playing;
        self.shared.signal.notify_all();
    }

    /// Reconfigure the decoder for a seek or track change: the ring is discarded and
    /// decoding restarts from the given cursor (None for data tracks and silence).
    pub fn configure(&self, cursor: Option<&TrackCursor>, playing: bool, audio_track: bool) {
        let mut state = self.lock();

        state.ring.clear();
        state.playing = playing;
        state.audio_track = audio_track;
        state.reader = match cursor {
            Some(cursor) => match AudioReader::open(cursor) {
                Ok(reader) => Some(reader),
                Err(err) => {
                    log::error!("Failed to open audio track '{}': {err}", cursor.path.display());
                    None
                }
            },
            None => None,
        };

        drop(state);
        self.shared.signal.notify_all();
    }

    /// Block until `out.len()` decoded bytes are available, then copy them out.
    pub fn read_blocking(&self, out: &mut [u8]) {
        let mut state = self.lock();
        while state.ring.available_to_read() < out.len() {
            if self.shared.exit.load(Ordering::Relaxed) {
                out.fill(0);
                return;
            }
            state = self
                .shared
                .signal
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }

        state.ring.pop_front(out);

        drop(state);
        self.shared.signal.notify_all();
    }
}

impl Default for AudioPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioPipe {
    fn drop(&mut self) {
        self.shared.exit.store(true, Ordering::SeqCst);
        self.shared.signal.notify_all();

        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn decode_worker(shared: &PipeShared) {
    let mut buffer = [0_u8; DECODE_SLICE_LEN];

    loop {
        let mut state = shared.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        state = shared
            .signal
            .wait_while(state, |state| {
                !shared.exit.load(Ordering::Relaxed)
                    && !(state.ring.available_to_write() != 0 && state.playing && state.audio_track)
            })
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if shared.exit.load(Ordering::Relaxed) {
            break;
        }

        let slice = DECODE_SLICE_LEN.min(state.ring.available_to_write());
        let out = &mut buffer[..slice];

        // Tracks with no backing data (pregap silence, decode failures) produce zeros
        let done = match &mut state.reader {
            Some(reader) => match reader.read(out) {
                Ok(done) => done,
                Err(err) => {
                    log::error!("CD audio decode error: {err}");
                    state.reader = None;
                    0
                }
            },
            None => 0,
        };
        out[done..].fill(0);

        state.ring.push_back(out);

        drop(state);
        shared.signal.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_buffer_wraps_around() {
        let mut ring = CircularBuffer::new(8);
        assert_eq!(ring.available_to_write(), 8);

        ring.push_back(&[1, 2, 3, 4, 5, 6]);
        let mut out = [0; 4];
        ring.pop_front(&mut out);
        assert_eq!(out, [1, 2, 3, 4]);

        // Wraps across the end of the backing buffer
        ring.push_back(&[7, 8, 9, 10]);
        assert_eq!(ring.available_to_read(), 6);

        let mut out = [0; 6];
        ring.pop_front(&mut out);
        assert_eq!(out, [5, 6, 7, 8, 9, 10]);
        assert_eq!(ring.available_to_read(), 0);
    }

    #[test]
    fn silence_worker_fills_ring_with_zeros() {
        let pipe = AudioPipe::new();
        pipe.configure(None, true, true);

        let mut out = [0xAA_u8; 64];
        pipe.read_blocking(&mut out);
        assert!(out.iter().all(|&b| b == 0));
    }
}
