//! The CD table of contents: one entry per (track, index) pair, in disc order

pub mod chd;
pub mod cue;

use crate::{CdRomError, CdRomResult};
use std::cmp::Ordering;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackType {
    /// ISO track, 2048 bytes per sector
    Mode1_2048,
    /// Raw data track, 2352 bytes per sector
    Mode1_2352,
    /// Audio silence with no backing data (pregap/postgap)
    Silence,
    /// Raw 16-bit 44.1 kHz stereo PCM
    AudioPcm,
    AudioFlac,
    AudioOgg,
    AudioWav,
}

impl TrackType {
    #[must_use]
    pub fn is_data(self) -> bool {
        matches!(self, Self::Mode1_2048 | Self::Mode1_2352)
    }

    #[must_use]
    pub fn is_audio(self) -> bool {
        !self.is_data()
    }

    /// Bytes each sector of this entry occupies in its backing file.
    #[must_use]
    pub fn sector_size(self) -> u64 {
        match self {
            Self::Mode1_2048 => crate::DATA_SECTOR_LEN as u64,
            _ => crate::BYTES_PER_SECTOR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackIndex {
    pub track: u8,
    pub index: u8,
}

impl TrackIndex {
    #[must_use]
    pub fn new(track: u8, index: u8) -> Self {
        Self { track, index }
    }
}

impl PartialOrd for TrackIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TrackIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.track, self.index).cmp(&(other.track, other.index))
    }
}

#[derive(Debug, Clone)]
pub struct TocEntry {
    /// Index into the file list for the backing data; None for silence entries
    pub file_index: Option<usize>,
    pub track_index: TrackIndex,
    pub track_type: TrackType,
    /// Position of this index within its backing file, in sectors
    pub index_position: u32,
    /// Absolute start sector on the virtual disc
    pub start_sector: u32,
    /// Byte offset of this entry's data within its backing file
    pub file_offset: u64,
    /// Length in sectors
    pub length: u32,
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    /// Size in bytes; for compressed audio this is the decoded PCM size
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CdromToc {
    entries: Vec<TocEntry>,
    files: Vec<FileEntry>,
    first_track: u8,
    last_track: u8,
    total_sectors: u32,
}

impl CdromToc {
    #[must_use]
    pub fn entries(&self) -> &[TocEntry] {
        &self.entries
    }

    #[must_use]
    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    #[must_use]
    pub fn first_track(&self) -> u8 {
        self.first_track
    }

    #[must_use]
    pub fn last_track(&self) -> u8 {
        self.last_track
    }

    /// The lead-out position: total number of sectors on the virtual disc.
    #[must_use]
    pub fn total_sectors(&self) -> u32 {
        self.total_sectors
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the entry for a given (track, index) pair.
    #[must_use]
    pub fn find_by_track_index(&self, track_index: TrackIndex) -> Option<&TocEntry> {
        let i = self
            .entries
            .binary_search_by(|entry| entry.track_index.cmp(&track_index))
            .ok()?;
        Some(&self.entries[i])
    }

    /// Find the entry containing a given absolute sector: the last entry whose start
    /// sector is <= the given sector.
    #[must_use]
    pub fn find_by_sector(&self, sector: u32) -> Option<&TocEntry> {
        self.find_index_by_sector(sector).map(|i| &self.entries[i])
    }

    /// Like [`Self::find_by_sector`], returning the entry's index in [`Self::entries`].
    #[must_use]
    pub fn find_index_by_sector(&self, sector: u32) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }

        let i = self.entries.partition_point(|entry| entry.start_sector <= sector);
        Some(i.max(1) - 1)
    }

    /// Finish construction from parsed entries: compute per-file byte offsets and entry
    /// lengths (cue sheets leave them blank), then lay the entries out on the virtual
    /// disc by accumulating lengths.
    fn finalize(entries: Vec<TocEntry>, files: Vec<FileEntry>, lengths_known: bool) -> CdRomResult<Self> {
        let mut entries = entries;

        if entries.is_empty() {
            return Err(CdRomError::EmptyToc);
        }

        if !lengths_known {
            compute_file_offsets(&mut entries, &files);
        }

        let mut current_sector = 0;
        for entry in &mut entries {
            entry.start_sector = current_sector;
            current_sector += entry.length;
        }

        let first_track = entries[0].track_index.track;
        let last_track = entries[entries.len() - 1].track_index.track;

        Ok(Self { entries, files, first_track, last_track, total_sectors: current_sector })
    }
}

// Walk each file's entries in ascending index position and derive byte offsets and sector
// lengths; the last entry of a file extends to the end of the file.
fn compute_file_offsets(entries: &mut [TocEntry], files: &[FileEntry]) {
    let mut order: Vec<usize> = (0..entries.len()).collect();
    order.sort_by_key(|&i| (entries[i].file_index, entries[i].index_position));

    let mut i = 0;
    while i < order.len() {
        let Some(file_index) = entries[order[i]].file_index else {
            // Silence entries carry their length already and have no backing data
            i += 1;
            continue;
        };

        let group_end = order[i..]
            .iter()
            .position(|&j| entries[j].file_index != Some(file_index))
            .map_or(order.len(), |n| i + n);

        let mut file_offset = 0;
        for k in i..group_end {
            let sector_size = entries[order[k]].track_type.sector_size();

            let length = if k + 1 == group_end {
                ((files[file_index].size - file_offset) / sector_size) as u32
            } else {
                entries[order[k + 1]].index_position - entries[order[k]].index_position
            };

            let entry = &mut entries[order[k]];
            entry.file_offset = file_offset;
            entry.length = length;

            file_offset += u64::from(length) * sector_size;
        }

        i = group_end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(track: u8, index: u8, track_type: TrackType, length: u32) -> TocEntry {
        TocEntry {
            file_index: None,
            track_index: TrackIndex::new(track, index),
            track_type,
            index_position: 0,
            start_sector: 0,
            file_offset: 0,
            length,
        }
    }

    #[test]
    fn entries_are_laid_out_contiguously() {
        let toc = CdromToc::finalize(
            vec![
                entry(1, 1, TrackType::Mode1_2048, 100),
                entry(2, 0, TrackType::Silence, 150),
                entry(2, 1, TrackType::AudioPcm, 300),
            ],
            vec![],
            true,
        )
        .unwrap();

        let starts: Vec<u32> = toc.entries().iter().map(|e| e.start_sector).collect();
        assert_eq!(starts, vec![0, 100, 250]);
        assert_eq!(toc.total_sectors(), 550);
        assert_eq!(toc.first_track(), 1);
        assert_eq!(toc.last_track(), 2);
    }

    #[test]
    fn sector_lookup_returns_last_entry_at_or_before() {
        let toc = CdromToc::finalize(
            vec![
                entry(1, 1, TrackType::Mode1_2048, 100),
                entry(2, 0, TrackType::Silence, 150),
                entry(2, 1, TrackType::AudioPcm, 300),
            ],
            vec![],
            true,
        )
        .unwrap();

        assert_eq!(toc.find_by_sector(0).unwrap().track_index, TrackIndex::new(1, 1));
        assert_eq!(toc.find_by_sector(99).unwrap().track_index, TrackIndex::new(1, 1));
        assert_eq!(toc.find_by_sector(100).unwrap().track_index, TrackIndex::new(2, 0));
        assert_eq!(toc.find_by_sector(250).unwrap().track_index, TrackIndex::new(2, 1));
        // Past the lead-out the last entry still wins; callers check total_sectors()
        assert_eq!(toc.find_by_sector(10_000).unwrap().track_index, TrackIndex::new(2, 1));
    }

    #[test]
    fn file_offset_computation_spans_entry_types() {
        // One file: 10 sectors of MODE1/2048 then audio filling the remainder
        let files =
            vec![FileEntry { path: "disc.bin".into(), size: 10 * 2048 + 20 * 2352 }];
        let mut entries = vec![
            TocEntry {
                file_index: Some(0),
                track_index: TrackIndex::new(1, 1),
                track_type: TrackType::Mode1_2048,
                index_position: 0,
                start_sector: 0,
                file_offset: 0,
                length: 0,
            },
            TocEntry {
                file_index: Some(0),
                track_index: TrackIndex::new(2, 1),
                track_type: TrackType::AudioPcm,
                index_position: 10,
                start_sector: 0,
                file_offset: 0,
                length: 0,
            },
        ];

        compute_file_offsets(&mut entries, &files);

        assert_eq!(entries[0].length, 10);
        assert_eq!(entries[0].file_offset, 0);
        assert_eq!(entries[1].length, 20);
        assert_eq!(entries[1].file_offset, 10 * 2048);
    }
}
