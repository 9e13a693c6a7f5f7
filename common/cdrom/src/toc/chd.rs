//! MAME CHD images: table-of-contents extraction from CHTR/CHT2 metadata and a
//! byte-stream view over the compressed frame data

use crate::toc::{CdromToc, FileEntry, TocEntry, TrackIndex, TrackType};
use crate::{CdRomError, CdRomResult};
use chd::iter::LendingIterator;
use chd::Chd;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

// CHD stores 2448 bytes per CD frame: 2352 bytes of sector data plus 96 bytes of subcode
const CHD_FRAME_LEN: u32 = 2448;
const CD_FRAME_LEN: u32 = crate::BYTES_PER_SECTOR as u32;

const CHTR_TAG: u32 = u32::from_be_bytes(*b"CHTR");
const CHT2_TAG: u32 = u32::from_be_bytes(*b"CHT2");

#[derive(Debug, Clone)]
struct CdTrackMetadata {
    track_number: u8,
    track_type: TrackType,
    frames: u32,
    pregap_frames: u32,
    postgap_frames: u32,
    pregap_type_is_vaudio: bool,
}

impl CdTrackMetadata {
    fn parse_from(ascii_bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(ascii_bytes).ok()?;

        let mut track_number: Option<u8> = None;
        let mut track_type: Option<TrackType> = None;
        let mut frames: Option<u32> = None;
        let mut pregap_frames: u32 = 0;
        let mut postgap_frames: u32 = 0;
        let mut pregap_type_is_vaudio = false;
        for token in text.split(' ') {
            let Some((key, value)) = token.split_once(':') else { continue };

            match key {
                "TRACK" => track_number = Some(value.parse().ok()?),
                "TYPE" => match value {
                    "MODE1" | "MODE1/2048" => track_type = Some(TrackType::Mode1_2048),
                    "MODE1_RAW" | "MODE1/2352" => track_type = Some(TrackType::Mode1_2352),
                    "AUDIO" => track_type = Some(TrackType::AudioPcm),
                    _ => return None,
                },
                "FRAMES" => frames = Some(value.parse().ok()?),
                "PREGAP" => pregap_frames = value.parse().ok()?,
                "POSTGAP" => postgap_frames = value.parse().ok()?,
                "PGTYPE" => pregap_type_is_vaudio = value.eq_ignore_ascii_case("VAUDIO"),
                _ => {}
            }
        }

        Some(Self {
            track_number: track_number?,
            track_type: track_type?,
            frames: frames?,
            pregap_frames,
            postgap_frames,
            pregap_type_is_vaudio,
        })
    }
}

/// Whether a track's pregap occupies frames inside the CHD file.
///
/// Observed CHD layouts only store pregap frames when the previous track was audio, or
/// when the newer PGTYPE metadata explicitly says VAUDIO. Other emulators disagree on
/// this rule; keep it in one place so it can be revisited.
fn pregap_consumes_chd_frames(previous_was_data: bool, pgtype_is_vaudio: bool) -> bool {
    !previous_was_data || pgtype_is_vaudio
}

/// Read the CHTR/CHT2 metadata of a CHD file and build the table of contents.
pub fn parse<P: AsRef<Path>>(chd_path: P) -> CdRomResult<CdromToc> {
    let chd_path = chd_path.as_ref();
    let mut chd = open_chd(chd_path)?;

    let mut metadata_list = Vec::new();
    let mut metadata_iter = chd.metadata();
    while let Some(mut metadata_entry) = metadata_iter.next() {
        let metadata = metadata_entry.read()?;
        if metadata.metatag != CHTR_TAG && metadata.metatag != CHT2_TAG {
            continue;
        }

        let Some(cd_metadata) = CdTrackMetadata::parse_from(&metadata.value) else {
            let metadata_value = String::from_utf8_lossy(&metadata.value).to_string();
            return Err(CdRomError::ChdHeaderParse { metadata_value });
        };

        metadata_list.push(cd_metadata);
    }

    metadata_list.sort_by_key(|metadata| metadata.track_number);

    let file_len = u64::from(total_frames(&chd)?) * u64::from(CD_FRAME_LEN);

    let mut entries = Vec::new();
    // Position inside the CHD in frames; every track starts on a multiple of 4
    let mut chd_position: u32 = 0;
    let mut previous_was_data = true;

    for metadata in metadata_list {
        if chd_position % 4 != 0 {
            chd_position += 4 - (chd_position % 4);
        }

        let mut track_length = metadata.frames;

        if metadata.pregap_frames != 0 {
            entries.push(TocEntry {
                file_index: None,
                track_index: TrackIndex::new(metadata.track_number, 0),
                track_type: TrackType::Silence,
                index_position: 0,
                start_sector: 0,
                file_offset: 0,
                length: metadata.pregap_frames,
            });

            if pregap_consumes_chd_frames(previous_was_data, metadata.pregap_type_is_vaudio) {
                chd_position += metadata.pregap_frames;
                track_length -= metadata.pregap_frames;
            }
        }

        entries.push(TocEntry {
            file_index: Some(0),
            track_index: TrackIndex::new(metadata.track_number, 1),
            track_type: metadata.track_type,
            index_position: chd_position,
            start_sector: 0,
            file_offset: u64::from(chd_position) * u64::from(CD_FRAME_LEN),
            length: track_length,
        });
        chd_position += track_length;

        if metadata.postgap_frames != 0 {
            entries.push(TocEntry {
                file_index: None,
                track_index: TrackIndex::new(metadata.track_number, 2),
                track_type: TrackType::Silence,
                index_position: 0,
                start_sector: 0,
                file_offset: 0,
                length: metadata.postgap_frames,
            });
        }

        previous_was_data = metadata.track_type.is_data();
    }

    let files = vec![FileEntry { path: PathBuf::from(chd_path), size: file_len }];

    CdromToc::finalize(entries, files, true)
}

fn open_chd(chd_path: &Path) -> CdRomResult<Chd<BufReader<File>>> {
    let file = File::open(chd_path).map_err(|source| CdRomError::ChdOpen {
        path: chd_path.display().to_string(),
        source,
    })?;
    Ok(Chd::open(BufReader::new(file), None)?)
}

fn total_frames(chd: &Chd<BufReader<File>>) -> CdRomResult<u32> {
    let hunk_bytes = chd.header().hunk_size();
    if hunk_bytes % CHD_FRAME_LEN != 0 {
        return Err(CdRomError::ChdInvalidHunkSize { hunk_bytes });
    }

    let frames_per_hunk = hunk_bytes / CHD_FRAME_LEN;
    Ok(chd.header().hunk_count() * frames_per_hunk)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HunkMode {
    Data,
    // Decompressed audio frames hold big-endian samples; serve them byte-swapped
    Audio,
}

/// A seekable byte stream over a CHD's CD frames. Byte offsets address the 2352-byte
/// frame payloads; the 96 subcode bytes stored after each frame are invisible.
pub struct ChdReader {
    chd: Chd<BufReader<File>>,
    compressed_buffer: Vec<u8>,
    hunk_buffer: Vec<u8>,
    current_hunk: Option<(u32, HunkMode)>,
    frames_per_hunk: u32,
    logical_len: u64,
    position: u64,
}

impl ChdReader {
    pub fn open<P: AsRef<Path>>(chd_path: P) -> CdRomResult<Self> {
        let mut chd = open_chd(chd_path.as_ref())?;

        let frames_per_hunk = chd.header().hunk_size() / CHD_FRAME_LEN;
        let logical_len = u64::from(total_frames(&chd)?) * u64::from(CD_FRAME_LEN);

        let compressed_buffer = Vec::with_capacity(chd.header().hunk_size() as usize);
        let hunk_buffer = chd.get_hunksized_buffer();

        Ok(Self {
            chd,
            compressed_buffer,
            hunk_buffer,
            current_hunk: None,
            frames_per_hunk,
            logical_len,
            position: 0,
        })
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.logical_len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.logical_len == 0
    }

    pub fn seek(&mut self, position: u64) {
        self.position = position.min(self.logical_len);
    }

    /// Read frame data at the current position. Returns the number of bytes read, which
    /// is short only at the end of the image.
    pub fn read_data(&mut self, out: &mut [u8]) -> CdRomResult<usize> {
        self.read(out, HunkMode::Data)
    }

    /// Read audio at the current position with samples byte-swapped to little-endian.
    pub fn read_audio(&mut self, out: &mut [u8]) -> CdRomResult<usize> {
        self.read(out, HunkMode::Audio)
    }

    fn read(&mut self, out: &mut [u8], mode: HunkMode) -> CdRomResult<usize> {
        let mut remaining = (out.len() as u64).min(self.logical_len - self.position) as usize;
        let mut done = 0;

        while remaining != 0 {
            let frame = (self.position / u64::from(CD_FRAME_LEN)) as u32;
            let frame_offset = (self.position % u64::from(CD_FRAME_LEN)) as u32;

            let hunk_number = frame / self.frames_per_hunk;
            let frame_in_hunk = frame % self.frames_per_hunk;

            self.fetch_hunk(hunk_number, mode)?;

            let slice = remaining.min((CD_FRAME_LEN - frame_offset) as usize);
            let src_start = (frame_in_hunk * CHD_FRAME_LEN + frame_offset) as usize;
            out[done..done + slice].copy_from_slice(&self.hunk_buffer[src_start..src_start + slice]);

            done += slice;
            remaining -= slice;
            self.position += slice as u64;
        }

        Ok(done)
    }

    fn fetch_hunk(&mut self, hunk_number: u32, mode: HunkMode) -> CdRomResult<()> {
        if self.current_hunk == Some((hunk_number, mode)) {
            return Ok(());
        }

        let mut hunk = self.chd.hunk(hunk_number)?;
        self.compressed_buffer.clear();
        hunk.read_hunk_in(&mut self.compressed_buffer, &mut self.hunk_buffer)?;

        if mode == HunkMode::Audio {
            for chunk in self.hunk_buffer.chunks_exact_mut(2) {
                chunk.swap(0, 1);
            }
        }

        self.current_hunk = Some((hunk_number, mode));
        Ok(())
    }
}

impl std::fmt::Debug for ChdReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChdReader {{ current_hunk: {:?}, position: {} }}", self.current_hunk, self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cht2_metadata_line() {
        let metadata = CdTrackMetadata::parse_from(
            b"TRACK:2 TYPE:AUDIO SUBTYPE:NONE FRAMES:13955 PREGAP:150 PGTYPE:VAUDIO PGSUB:NONE POSTGAP:0",
        )
        .unwrap();

        assert_eq!(metadata.track_number, 2);
        assert_eq!(metadata.track_type, TrackType::AudioPcm);
        assert_eq!(metadata.frames, 13955);
        assert_eq!(metadata.pregap_frames, 150);
        assert!(metadata.pregap_type_is_vaudio);
    }

    #[test]
    fn parses_chtr_metadata_line() {
        let metadata =
            CdTrackMetadata::parse_from(b"TRACK:1 TYPE:MODE1_RAW SUBTYPE:NONE FRAMES:2000").unwrap();

        assert_eq!(metadata.track_number, 1);
        assert_eq!(metadata.track_type, TrackType::Mode1_2352);
        assert_eq!(metadata.pregap_frames, 0);
        assert_eq!(metadata.postgap_frames, 0);
    }

    #[test]
    fn rejects_unsupported_track_type() {
        assert!(CdTrackMetadata::parse_from(b"TRACK:1 TYPE:MODE2_RAW FRAMES:100").is_none());
    }

    #[test]
    fn pregap_frame_consumption_rule() {
        // Pregap after a data track is not stored in the CHD unless PGTYPE says VAUDIO
        assert!(!pregap_consumes_chd_frames(true, false));
        assert!(pregap_consumes_chd_frames(true, true));
        assert!(pregap_consumes_chd_frames(false, false));
        assert!(pregap_consumes_chd_frames(false, true));
    }
}
