//! The emulated disc: table of contents, play position, data sector reads, and control
//! of the audio decode pipeline

use crate::pipe::{AudioPipe, TrackCursor};
use crate::toc::chd::ChdReader;
use crate::toc::{CdromToc, TocEntry, TrackIndex, TrackType};
use crate::{CdRomError, CdRomResult, BYTES_PER_SECTOR, DATA_SECTOR_LEN, RAW_SECTOR_HEADER_LEN};
use bincode::de::{BorrowDecoder, Decoder};
use bincode::enc::Encoder;
use bincode::error::{DecodeError, EncodeError};
use bincode::{BorrowDecode, Decode, Encode};
use std::ffi::OsStr;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

#[derive(Debug)]
enum DataReader {
    Bin(BufReader<File>),
    Chd(ChdReader),
}

impl DataReader {
    fn open(path: &Path) -> CdRomResult<Self> {
        if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("chd")) {
            Ok(Self::Chd(ChdReader::open(path)?))
        } else {
            let file = File::open(path).map_err(|source| CdRomError::TrackFileOpen {
                path: path.display().to_string(),
                source,
            })?;
            Ok(Self::Bin(BufReader::new(file)))
        }
    }

    fn read_at(&mut self, offset: u64, out: &mut [u8]) -> CdRomResult<usize> {
        match self {
            Self::Bin(file) => {
                file.seek(SeekFrom::Start(offset)).map_err(CdRomError::DiscReadIo)?;

                let mut done = 0;
                while done < out.len() {
                    let n = file.read(&mut out[done..]).map_err(CdRomError::DiscReadIo)?;
                    if n == 0 {
                        break;
                    }
                    done += n;
                }
                Ok(done)
            }
            Self::Chd(reader) => {
                reader.seek(offset);
                reader.read_data(out)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct CdRom {
    toc: CdromToc,
    data_reader: Option<DataReader>,
    data_reader_file: Option<usize>,
    pipe: Option<AudioPipe>,
    current_entry: Option<usize>,
    position: u32,
    playing: bool,
}

impl CdRom {
    /// Load a disc image: a cue sheet or a CHD file, chosen by extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the image metadata is invalid or any referenced file cannot
    /// be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> CdRomResult<Self> {
        let path = path.as_ref();

        let toc = if path.extension().map(OsStr::to_ascii_lowercase).is_some_and(|e| e == "chd") {
            crate::toc::chd::parse(path)?
        } else {
            crate::toc::cue::parse(path)?
        };

        let mut cdrom = Self {
            toc,
            data_reader: None,
            data_reader_file: None,
            pipe: Some(AudioPipe::new()),
            current_entry: None,
            position: 0,
            playing: false,
        };
        cdrom.seek(0);

        Ok(cdrom)
    }

    pub fn reset(&mut self) {
        self.playing = false;
        self.seek(0);
    }

    #[must_use]
    pub fn toc(&self) -> &CdromToc {
        &self.toc
    }

    #[must_use]
    pub fn is_toc_empty(&self) -> bool {
        self.toc.is_empty()
    }

    #[must_use]
    pub fn position(&self) -> u32 {
        self.position
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// The lead-out position in sectors.
    #[must_use]
    pub fn leadout(&self) -> u32 {
        self.toc.total_sectors()
    }

    #[must_use]
    pub fn first_track(&self) -> u8 {
        self.toc.first_track()
    }

    #[must_use]
    pub fn last_track(&self) -> u8 {
        self.toc.last_track()
    }

    /// Start sector of the given track's index 01, or 0 if the track does not exist.
    #[must_use]
    pub fn track_position(&self, track: u8) -> u32 {
        self.toc
            .find_by_track_index(TrackIndex::new(track, 1))
            .map_or(0, |entry| entry.start_sector)
    }

    #[must_use]
    pub fn track_is_data(&self, track: u8) -> bool {
        self.toc
            .find_by_track_index(TrackIndex::new(track, 1))
            .is_some_and(|entry| entry.track_type.is_data())
    }

    fn current_entry(&self) -> Option<&TocEntry> {
        self.current_entry.map(|i| &self.toc.entries()[i])
    }

    #[must_use]
    pub fn current_track_index(&self) -> TrackIndex {
        self.current_entry().map_or(TrackIndex::new(0, 0), |entry| entry.track_index)
    }

    /// Start sector of the current TOC entry.
    #[must_use]
    pub fn current_track_position(&self) -> u32 {
        self.current_entry().map_or(0, |entry| entry.start_sector)
    }

    /// Length in sectors of the current TOC entry.
    #[must_use]
    pub fn current_index_size(&self) -> u32 {
        self.current_entry().map_or(0, |entry| entry.length)
    }

    #[must_use]
    pub fn is_data(&self) -> bool {
        self.current_entry().is_some_and(|entry| entry.track_type.is_data())
    }

    #[must_use]
    pub fn is_audio(&self) -> bool {
        self.current_entry().is_some_and(|entry| entry.track_type.is_audio())
    }

    #[must_use]
    pub fn is_pregap(&self) -> bool {
        self.current_entry().is_some_and(|entry| entry.track_index.index == 0)
    }

    pub fn play(&mut self) {
        self.playing = true;
        if let Some(pipe) = &self.pipe {
            pipe.set_playing(true);
        }
    }

    pub fn stop(&mut self) {
        self.playing = false;
        if let Some(pipe) = &self.pipe {
            pipe.set_playing(false);
        }
    }

    /// Move the play position to the next sector (if playing).
    pub fn advance_position(&mut self) {
        if !self.playing {
            return;
        }

        self.position += 1;
        self.handle_track_change();
    }

    /// Change the play position. Discards any buffered audio and repositions the
    /// decoder.
    pub fn seek(&mut self, position: u32) {
        if self.toc.is_empty() {
            return;
        }

        self.position = position;
        self.current_entry = self.toc.find_index_by_sector(position);
        self.reconfigure_pipe();
    }

    // Called after the position advanced by one sector; only reconfigures the decoder
    // when the backing file actually changed, so continuous playback keeps streaming.
    fn handle_track_change(&mut self) {
        if self.toc.is_empty() {
            return;
        }

        let new_entry = self.toc.find_index_by_sector(self.position);
        if new_entry == self.current_entry {
            return;
        }

        let file_changed = match (self.current_entry(), new_entry.map(|i| &self.toc.entries()[i])) {
            (Some(old), Some(new)) => old.file_index != new.file_index,
            _ => true,
        };

        self.current_entry = new_entry;

        if file_changed {
            self.reconfigure_pipe();
        }
    }

    fn reconfigure_pipe(&mut self) {
        let Some(pipe) = &self.pipe else { return };

        let Some(entry) = self.current_entry() else {
            pipe.configure(None, self.playing, false);
            return;
        };

        if entry.track_type.is_data() {
            pipe.configure(None, self.playing, false);
            return;
        }

        let cursor = entry.file_index.map(|file_index| {
            let clamped = self.position.min(self.leadout().saturating_sub(1));
            let track_offset =
                u64::from(clamped.saturating_sub(entry.start_sector)) * BYTES_PER_SECTOR;
            TrackCursor {
                track_type: entry.track_type,
                path: self.toc.files()[file_index].path.clone(),
                byte_offset: entry.file_offset + track_offset,
            }
        });

        pipe.configure(cursor.as_ref(), self.playing, true);
    }

    /// Read the 2048-byte payload of the data sector at the current position. Positions
    /// outside a data track, or beyond the backing file, read as zeroes.
    pub fn read_data(&mut self, out: &mut [u8; DATA_SECTOR_LEN]) {
        let entry = self.current_entry().cloned();
        let Some(entry) = entry else {
            out.fill(0);
            return;
        };

        let (Some(file_index), true) = (entry.file_index, entry.track_type.is_data()) else {
            out.fill(0);
            return;
        };

        if self.position >= self.leadout() {
            out.fill(0);
            return;
        }

        let is_chd = self.toc.files()[file_index]
            .path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("chd"));

        let track_offset = u64::from(self.position - entry.start_sector);
        let offset = entry.file_offset
            + match entry.track_type {
                TrackType::Mode1_2048 if !is_chd => track_offset * DATA_SECTOR_LEN as u64,
                TrackType::Mode1_2048 => track_offset * BYTES_PER_SECTOR,
                TrackType::Mode1_2352 => track_offset * BYTES_PER_SECTOR + RAW_SECTOR_HEADER_LEN,
                _ => unreachable!("entry was checked to be a data track"),
            };

        if self.data_reader.is_none() || self.data_reader_file != Some(file_index) {
            match DataReader::open(&self.toc.files()[file_index].path) {
                Ok(reader) => {
                    self.data_reader = Some(reader);
                    self.data_reader_file = Some(file_index);
                }
                Err(err) => {
                    log::error!("Failed to open data track file: {err}");
                    out.fill(0);
                    return;
                }
            }
        }

        let done = match self.data_reader.as_mut().unwrap().read_at(offset, out) {
            Ok(done) => done,
            Err(err) => {
                log::error!("Error reading data sector {}: {err}", self.position);
                0
            }
        };
        out[done..].fill(0);
    }

    /// Read decoded audio from the worker-filled ring, blocking until enough data is
    /// available.
    pub fn read_audio(&self, out: &mut [u8]) {
        match &self.pipe {
            Some(pipe) => pipe.read_blocking(out),
            None => out.fill(0),
        }
    }

    /// Move the loaded disc (TOC, file handles, decode pipeline) out of `other`,
    /// keeping this instance's play position. Used on savestate restore, where the
    /// deserialized instance carries only position and play state.
    pub fn take_disc_from(&mut self, other: &mut CdRom) {
        self.toc = std::mem::take(&mut other.toc);
        self.data_reader = other.data_reader.take();
        self.data_reader_file = other.data_reader_file.take();
        self.pipe = other.pipe.take();

        // Resolve the restored position against the adopted TOC
        self.seek(self.position);
        if let Some(pipe) = &self.pipe {
            pipe.set_playing(self.playing);
        }
    }
}

// Only the play position and play state are serialized; the disc itself is reattached
// after decode via take_disc_from
impl Encode for CdRom {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        self.position.encode(encoder)?;
        self.playing.encode(encoder)?;
        Ok(())
    }
}

impl<Context> Decode<Context> for CdRom {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let position = u32::decode(decoder)?;
        let playing = bool::decode(decoder)?;

        Ok(Self { position, playing, ..Self::default() })
    }
}

impl<'de, Context> BorrowDecode<'de, Context> for CdRom {
    fn borrow_decode<D: BorrowDecoder<'de, Context = Context>>(
        decoder: &mut D,
    ) -> Result<Self, DecodeError> {
        Self::decode(decoder)
    }
}
