//! Cue sheet parsing

use crate::audio;
use crate::time::Msf;
use crate::toc::{CdromToc, FileEntry, TocEntry, TrackIndex, TrackType};
use crate::{CdRomError, CdRomResult};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)^\s*FILE\s+"(.*)"\s+(\S+)\s*$"#).unwrap());
static TRACK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*TRACK\s+([0-9]+)\s+(\S+)\s*$").unwrap());
static INDEX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*INDEX\s+([0-9]+)\s+([0-9]+):([0-9]+):([0-9]+)\s*$").unwrap());
static PREGAP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*PREGAP\s+([0-9]+):([0-9]+):([0-9]+)\s*$").unwrap());
static POSTGAP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*POSTGAP\s+([0-9]+):([0-9]+):([0-9]+)\s*$").unwrap());

struct CueParser {
    entries: Vec<TocEntry>,
    files: Vec<FileEntry>,
    // Track type that AUDIO resolves to for each file (PCM for BINARY)
    file_audio_types: Vec<TrackType>,
    current_file: Option<usize>,
    current_file_audio_type: TrackType,
    current_track: Option<u8>,
    current_track_type: TrackType,
    current_index: Option<u8>,
    track_has_pregap: bool,
    track_has_postgap: bool,
    track_has_index_one: bool,
}

impl CueParser {
    fn new() -> Self {
        Self {
            entries: vec![],
            files: vec![],
            file_audio_types: vec![],
            current_file: None,
            current_file_audio_type: TrackType::AudioPcm,
            current_track: None,
            current_track_type: TrackType::Silence,
            current_index: None,
            track_has_pregap: false,
            track_has_postgap: false,
            track_has_index_one: false,
        }
    }

    fn parse(mut self, cue_text: &str, cue_dir: &Path) -> CdRomResult<(Vec<TocEntry>, Vec<FileEntry>)> {
        for line in cue_text.lines() {
            if let Some(captures) = FILE_RE.captures(line) {
                self.parse_file_line(line, &captures, cue_dir)?;
            } else if let Some(captures) = TRACK_RE.captures(line) {
                self.parse_track_line(line, &captures)?;
            } else if let Some(captures) = INDEX_RE.captures(line) {
                self.parse_index_line(line, &captures)?;
            } else if let Some(captures) = PREGAP_RE.captures(line) {
                self.parse_pregap_line(line, &captures)?;
            } else if let Some(captures) = POSTGAP_RE.captures(line) {
                self.parse_postgap_line(line, &captures)?;
            }
        }

        if self.current_track.is_none() {
            return Err(CdRomError::CueParse("CUE sheet defines no tracks".into()));
        }

        if !self.track_has_index_one {
            return Err(CdRomError::CueParse(format!(
                "Track {:02} has no INDEX 01",
                self.current_track.unwrap()
            )));
        }

        Ok((self.entries, self.files))
    }

    fn parse_file_line(
        &mut self,
        line: &str,
        captures: &regex::Captures<'_>,
        cue_dir: &Path,
    ) -> CdRomResult<()> {
        self.finish_track()?;

        let file_spec = captures.get(1).unwrap().as_str();
        let file_type = captures.get(2).unwrap().as_str();

        let path = if Path::new(file_spec).is_absolute() {
            PathBuf::from(file_spec)
        } else {
            cue_dir.join(file_spec)
        };

        let is_binary = file_type.eq_ignore_ascii_case("BINARY");
        let is_wave = file_type.eq_ignore_ascii_case("WAVE");
        if !is_binary && !is_wave {
            return Err(CdRomError::CueInvalidFileLine(line.into()));
        }

        if let Some(existing) = self.files.iter().position(|entry| entry.path == path) {
            self.current_file = Some(existing);
            self.current_file_audio_type = self.file_audio_types[existing];
        } else {
            let (audio_type, size) = if is_binary {
                let metadata = fs::metadata(&path).map_err(|source| CdRomError::FsMetadata {
                    path: path.display().to_string(),
                    source,
                })?;
                (TrackType::AudioPcm, metadata.len())
            } else {
                audio::probe_audio_file(&path)?
            };

            self.current_file_audio_type = audio_type;
            self.files.push(FileEntry { path, size });
            self.file_audio_types.push(audio_type);
            self.current_file = Some(self.files.len() - 1);
        }

        self.current_index = None;

        Ok(())
    }

    fn parse_track_line(&mut self, line: &str, captures: &regex::Captures<'_>) -> CdRomResult<()> {
        if self.current_file.is_none() {
            return Err(CdRomError::CueParse("TRACK directive without a FILE".into()));
        }

        let track_number: u8 = captures
            .get(1)
            .unwrap()
            .as_str()
            .parse()
            .map_err(|_| CdRomError::CueInvalidTrackLine(line.into()))?;

        if !(1..=99).contains(&track_number) {
            return Err(CdRomError::CueParse(format!(
                "Track numbers must be between 1 and 99, got {track_number}"
            )));
        }

        match self.current_track {
            None => {
                if track_number != 1 {
                    return Err(CdRomError::CueParse(format!(
                        "Expected first track to be 01, was {track_number}"
                    )));
                }
            }
            Some(last) => {
                if track_number != last + 1 {
                    return Err(CdRomError::CueParse(format!(
                        "Tracks out of order; track {track_number} after {last}"
                    )));
                }
                if !self.track_has_index_one {
                    return Err(CdRomError::CueParse(format!("Track {last:02} has no INDEX 01")));
                }
            }
        }

        let mode = captures.get(2).unwrap().as_str();
        let track_type = if mode.eq_ignore_ascii_case("MODE1/2048") {
            TrackType::Mode1_2048
        } else if mode.eq_ignore_ascii_case("MODE1/2352") {
            TrackType::Mode1_2352
        } else if mode.eq_ignore_ascii_case("AUDIO") {
            self.current_file_audio_type
        } else {
            return Err(CdRomError::CueInvalidTrackLine(line.into()));
        };

        if track_type.is_data() && self.current_file_audio_type != TrackType::AudioPcm {
            return Err(CdRomError::CueParse(
                "Data track defined while the current FILE is audio-typed".into(),
            ));
        }

        self.current_track = Some(track_number);
        self.current_track_type = track_type;
        self.current_index = None;
        self.track_has_pregap = false;
        self.track_has_postgap = false;
        self.track_has_index_one = false;

        Ok(())
    }

    fn parse_index_line(&mut self, line: &str, captures: &regex::Captures<'_>) -> CdRomResult<()> {
        let Some(track) = self.current_track else {
            return Err(CdRomError::CueParse("INDEX directive without a TRACK".into()));
        };

        if self.track_has_postgap {
            return Err(CdRomError::CueParse("INDEX directive after POSTGAP".into()));
        }

        let index_number: u8 = captures
            .get(1)
            .unwrap()
            .as_str()
            .parse()
            .map_err(|_| CdRomError::CueInvalidIndexLine(line.into()))?;

        if self.track_has_pregap && index_number == 0 {
            return Err(CdRomError::CueParse("INDEX 00 is not allowed together with PREGAP".into()));
        }

        if let Some(last) = self.current_index {
            if index_number != last + 1 {
                return Err(CdRomError::CueParse(format!(
                    "Index numbers out of order; index {index_number} after {last}"
                )));
            }
        }

        let index_position = parse_msf(captures, 2, || CdRomError::CueInvalidIndexLine(line.into()))?;

        self.current_index = Some(index_number);
        if index_number == 1 {
            self.track_has_index_one = true;
        }

        self.entries.push(TocEntry {
            file_index: self.current_file,
            track_index: TrackIndex::new(track, index_number),
            track_type: self.current_track_type,
            index_position,
            start_sector: 0,
            file_offset: 0,
            length: 0,
        });

        Ok(())
    }

    fn parse_pregap_line(&mut self, line: &str, captures: &regex::Captures<'_>) -> CdRomResult<()> {
        let Some(track) = self.current_track else {
            return Err(CdRomError::CueParse("PREGAP directive without a TRACK".into()));
        };

        if self.track_has_pregap {
            return Err(CdRomError::CueParse("A track can have only one PREGAP".into()));
        }

        if self.current_index.is_some() {
            return Err(CdRomError::CueParse("PREGAP directive must precede all INDEXes".into()));
        }

        let length = parse_msf(captures, 1, || CdRomError::CueInvalidPregapLine(line.into()))?;

        self.entries.push(TocEntry {
            file_index: None,
            track_index: TrackIndex::new(track, 0),
            track_type: TrackType::Silence,
            index_position: 0,
            start_sector: 0,
            file_offset: 0,
            length,
        });

        self.track_has_pregap = true;

        Ok(())
    }

    fn parse_postgap_line(&mut self, line: &str, captures: &regex::Captures<'_>) -> CdRomResult<()> {
        let Some(track) = self.current_track else {
            return Err(CdRomError::CueParse("POSTGAP directive without a TRACK".into()));
        };

        let Some(last_index) = self.current_index else {
            return Err(CdRomError::CueParse("POSTGAP directive must follow all INDEXes".into()));
        };

        if self.track_has_postgap {
            return Err(CdRomError::CueParse("A track can have only one POSTGAP".into()));
        }

        let length = parse_msf(captures, 1, || CdRomError::CueInvalidPregapLine(line.into()))?;

        self.entries.push(TocEntry {
            file_index: None,
            track_index: TrackIndex::new(track, last_index + 1),
            track_type: TrackType::Silence,
            index_position: 0,
            start_sector: 0,
            file_offset: 0,
            length,
        });

        self.current_index = Some(last_index + 1);
        self.track_has_postgap = true;

        Ok(())
    }

    fn finish_track(&mut self) -> CdRomResult<()> {
        if let Some(track) = self.current_track {
            if !self.track_has_index_one {
                return Err(CdRomError::CueParse(format!("Track {track:02} has no INDEX 01")));
            }
        }

        Ok(())
    }
}

fn parse_msf<E: FnOnce() -> CdRomError>(
    captures: &regex::Captures<'_>,
    first_group: usize,
    err: E,
) -> CdRomResult<u32> {
    let mut components = [0_u8; 3];
    for (i, component) in components.iter_mut().enumerate() {
        let Ok(value) = captures.get(first_group + i).unwrap().as_str().parse() else {
            return Err(err());
        };
        *component = value;
    }

    Ok(Msf { minutes: components[0], seconds: components[1], frames: components[2] }.to_sector())
}

/// Parse a cue sheet and build the table of contents, probing every referenced audio
/// file for its decoded length.
pub fn parse<P: AsRef<Path>>(cue_path: P) -> CdRomResult<CdromToc> {
    let cue_path = cue_path.as_ref();

    let cue_text = fs::read_to_string(cue_path).map_err(|source| CdRomError::CueOpen {
        path: cue_path.display().to_string(),
        source,
    })?;

    let cue_dir = cue_path
        .parent()
        .ok_or_else(|| CdRomError::CueParentDir(cue_path.display().to_string()))?;

    let (entries, files) = CueParser::new().parse(&cue_text, cue_dir)?;

    let toc = CdromToc::finalize(entries, files, false)?;

    log::debug!(
        "Parsed cue sheet '{}': tracks {:02}-{:02}, {} sectors",
        cue_path.display(),
        toc.first_track(),
        toc.last_track(),
        toc.total_sectors()
    );

    Ok(toc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_bin(dir: &Path, name: &str, len: usize) {
        let mut file = fs::File::create(dir.join(name)).unwrap();
        file.write_all(&vec![0; len]).unwrap();
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("neocd-cue-test-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test_log::test]
    fn parses_single_data_track() {
        let dir = temp_dir("single");
        write_temp_bin(&dir, "game.bin", 2048 * 50);

        let cue_path = dir.join("game.cue");
        fs::write(&cue_path, "FILE \"game.bin\" BINARY\n  TRACK 01 MODE1/2048\n    INDEX 01 00:00:00\n")
            .unwrap();

        let toc = parse(&cue_path).unwrap();
        assert_eq!(toc.entries().len(), 1);
        assert_eq!(toc.entries()[0].length, 50);
        assert_eq!(toc.total_sectors(), 50);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn pregap_becomes_silence_entry() {
        let dir = temp_dir("pregap");
        write_temp_bin(&dir, "data.bin", 2048 * 10);
        write_temp_bin(&dir, "audio.bin", 2352 * 20);

        let cue_path = dir.join("game.cue");
        fs::write(
            &cue_path,
            concat!(
                "FILE \"data.bin\" BINARY\n",
                "  TRACK 01 MODE1/2048\n",
                "    INDEX 01 00:00:00\n",
                "FILE \"audio.bin\" BINARY\n",
                "  TRACK 02 AUDIO\n",
                "    PREGAP 00:02:00\n",
                "    INDEX 01 00:00:00\n",
            ),
        )
        .unwrap();

        let toc = parse(&cue_path).unwrap();
        assert_eq!(toc.entries().len(), 3);

        let pregap = &toc.entries()[1];
        assert_eq!(pregap.track_index, TrackIndex::new(2, 0));
        assert_eq!(pregap.track_type, TrackType::Silence);
        assert_eq!(pregap.length, 150);
        assert!(pregap.file_index.is_none());

        assert_eq!(toc.entries()[2].start_sector, 160);
        assert_eq!(toc.total_sectors(), 180);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rejects_noncontiguous_tracks() {
        let dir = temp_dir("order");
        write_temp_bin(&dir, "game.bin", 2048 * 10);

        let cue_path = dir.join("game.cue");
        fs::write(
            &cue_path,
            concat!(
                "FILE \"game.bin\" BINARY\n",
                "  TRACK 01 MODE1/2048\n",
                "    INDEX 01 00:00:00\n",
                "  TRACK 03 MODE1/2048\n",
                "    INDEX 01 00:00:05\n",
            ),
        )
        .unwrap();

        assert!(parse(&cue_path).is_err());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rejects_track_without_index_one() {
        let dir = temp_dir("noindex");
        write_temp_bin(&dir, "game.bin", 2048 * 10);

        let cue_path = dir.join("game.cue");
        fs::write(&cue_path, "FILE \"game.bin\" BINARY\n  TRACK 01 MODE1/2048\n").unwrap();

        assert!(parse(&cue_path).is_err());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rejects_unsupported_track_mode() {
        let dir = temp_dir("mode");
        write_temp_bin(&dir, "game.bin", 2352 * 10);

        let cue_path = dir.join("game.cue");
        fs::write(&cue_path, "FILE \"game.bin\" BINARY\n  TRACK 01 MODE2/2352\n    INDEX 01 00:00:00\n")
            .unwrap();

        assert!(parse(&cue_path).is_err());

        fs::remove_dir_all(&dir).unwrap();
    }
}
