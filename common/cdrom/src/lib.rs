//! CD-ROM image handling for the Neo Geo CD: table-of-contents parsing (cue sheets and
//! MAME CHD files), data sector reads, and multi-format audio decoding fed through a
//! worker-thread pipeline.

pub mod audio;
pub mod disc;
pub mod pipe;
pub mod time;
pub mod toc;

use std::io;
use thiserror::Error;

// Audio: 1176 signed 16-bit PCM samples per sector, interleaved left/right
pub const BYTES_PER_SECTOR: u64 = 2352;

// User data payload of a MODE1 sector
pub const DATA_SECTOR_LEN: usize = 2048;

// Sync (12 bytes) + header (4 bytes) preceding the payload in a raw MODE1 sector
pub const RAW_SECTOR_HEADER_LEN: u64 = 16;

#[derive(Debug, Error)]
pub enum CdRomError {
    #[error("Unable to determine parent directory of CUE file '{0}'")]
    CueParentDir(String),
    #[error("Error parsing CUE file: {0}")]
    CueParse(String),
    #[error("Invalid/unsupported FILE line in CUE file: {0}")]
    CueInvalidFileLine(String),
    #[error("Invalid/unsupported TRACK line in CUE file: {0}")]
    CueInvalidTrackLine(String),
    #[error("Invalid/unsupported INDEX line in CUE file: {0}")]
    CueInvalidIndexLine(String),
    #[error("Invalid/unsupported PREGAP/POSTGAP line in CUE file: {0}")]
    CueInvalidPregapLine(String),
    #[error("Unable to get file metadata for file '{path}': {source}")]
    FsMetadata {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Error opening CUE file '{path}': {source}")]
    CueOpen {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Error opening track file '{path}': {source}")]
    TrackFileOpen {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("File '{path}' is not a supported audio file: {reason}")]
    UnsupportedAudioFile { path: String, reason: String },
    #[error("CHD-related error: {0}")]
    ChdError(#[from] chd::Error),
    #[error("Error opening CHD file '{path}': {source}")]
    ChdOpen {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Unable to parse CD-ROM metadata in CHD header: '{metadata_value}'")]
    ChdHeaderParse { metadata_value: String },
    #[error("CHD hunk size {hunk_bytes} is not a multiple of the frame size")]
    ChdInvalidHunkSize { hunk_bytes: u32 },
    #[error("Disc image has an empty table of contents")]
    EmptyToc,
    #[error("I/O error reading from disc: {0}")]
    DiscReadIo(#[source] io::Error),
}

pub type CdRomResult<T> = Result<T, CdRomError>;

pub use disc::CdRom;
pub use toc::{CdromToc, TocEntry, TrackIndex, TrackType};
