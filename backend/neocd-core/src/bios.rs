//! BIOS image identification and in-memory patching.
//!
//! The emulator runs any supported BIOS unmodified; the patches below only remove the
//! disc-recognition stall and (optionally) the busy-wait loops that spin on the CD
//! drive, plus the checksum self-tests in the modified BIOSes that the other patches
//! would otherwise trip.

use bincode::{Decode, Encode};

pub const BIOS_LEN: usize = 512 * 1024;

const BIOS_BASE: u32 = 0xC00000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum BiosFamily {
    FrontLoader,
    TopLoader,
    Cdz,
    Unknown,
    Invalid,
}

impl BiosFamily {
    #[must_use]
    pub fn is_cdz(self) -> bool {
        self == Self::Cdz
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum BiosMod {
    None,
    SmkDan,
    Universe32,
    Universe33,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct BiosType {
    pub family: BiosFamily,
    pub modification: BiosMod,
}

impl BiosType {
    #[must_use]
    pub fn description(self) -> String {
        let family = match self.family {
            BiosFamily::FrontLoader => "Front Loader",
            BiosFamily::TopLoader => "Top Loader",
            BiosFamily::Cdz => "CDZ",
            BiosFamily::Unknown => "Unknown",
            BiosFamily::Invalid => "Invalid",
        };

        match self.modification {
            BiosMod::None => family.into(),
            BiosMod::SmkDan => format!("{family}, SMKDan"),
            BiosMod::Universe32 => format!("{family}, Universe 3.2"),
            BiosMod::Universe33 => format!("{family}, Universe 3.3"),
        }
    }
}

struct Pattern {
    address: u32,
    data: &'static [u8],
}

struct ReplacePattern {
    address: u32,
    original: &'static [u8],
    replacement: &'static [u8],
}

const VALIDITY_PATTERN: Pattern = Pattern { address: 0xC00000, data: &[0x00, 0x10, 0xF3, 0x00] };

const FRONT_LOADER_PATTERN: Pattern =
    Pattern { address: 0xC0006C, data: &[0x00, 0xC0, 0xC8, 0x5E] };
const TOP_LOADER_PATTERN: Pattern = Pattern { address: 0xC0006C, data: &[0x00, 0xC0, 0xC2, 0x22] };
const CDZ_PATTERN: Pattern = Pattern { address: 0xC0006C, data: &[0x00, 0xC0, 0xA3, 0xE8] };

const SMKDAN_FRONT_PATTERN: Pattern =
    Pattern { address: 0xC00004, data: &[0x00, 0xC2, 0x33, 0x00] };
const SMKDAN_TOP_PATTERN: Pattern = Pattern { address: 0xC00004, data: &[0x00, 0xC2, 0x34, 0x00] };
const SMKDAN_CDZ_PATTERN: Pattern = Pattern { address: 0xC00004, data: &[0x00, 0xC6, 0x20, 0x00] };

const UNIVERSE32_PATTERN: Pattern =
    Pattern { address: 0xC00150, data: &[0x1C, 0xCA, 0x85, 0x8A] };
const UNIVERSE33_PATTERN: Pattern =
    Pattern { address: 0xC00150, data: &[0xA4, 0x4B, 0x15, 0x2F] };

const NOP: &[u8] = &[0x4E, 0x71];
// Replaces "subq.l #1,d1 / beq.w <spin>" with a short branch past the spin loop
const SPEEDHACK: &[u8] = &[0xFA, 0xBE, 0x4E, 0x71, 0x4E, 0x71];
const UNIBIOS33_CHECKSUM: &[u8] = &[0x60, 0x32];
const SMKDAN_CHECKSUM: &[u8] = &[0x22, 0x00, 0x4E, 0x71, 0x4E, 0x71];

const CD_RECOG_A: &[u8] = &[0x66, 0x10];
const CD_RECOG_B: &[u8] = &[0x66, 0x74];
const CD_RECOG_C: &[u8] = &[0x66, 0x04];

const SPEEDHACK_A: &[u8] = &[0x53, 0x81, 0x67, 0x00, 0xFE, 0xF4];
const SPEEDHACK_B: &[u8] = &[0x53, 0x81, 0x67, 0x00, 0x00, 0x0E];
const SPEEDHACK_C: &[u8] = &[0x53, 0x81, 0x67, 0x00, 0xFE, 0x70];
const SPEEDHACK_D: &[u8] = &[0x53, 0x81, 0x67, 0x00, 0xFF, 0x46];
const SPEEDHACK_E: &[u8] = &[0x53, 0x81, 0x67, 0x00, 0xFE, 0xC4];
const SPEEDHACK_F: &[u8] = &[0x53, 0x81, 0x67, 0x00, 0xFF, 0x2A];
const SPEEDHACK_G: &[u8] = &[0x53, 0x81, 0x67, 0x00, 0xFE, 0xA6];

const SMKDAN_CHECKSUM_A: &[u8] = &[0x22, 0x39, 0x00, 0xC6, 0xFF, 0xF4];
const SMKDAN_CHECKSUM_B: &[u8] = &[0x22, 0x39, 0x00, 0xC2, 0xFF, 0xF4];
const UNIBIOS33_CHECKSUM_ORIGINAL: &[u8] = &[0x67, 0x32];

const CDZ_CD_RECOG: &[ReplacePattern] = &[
    ReplacePattern { address: 0xC0EB82, original: CD_RECOG_A, replacement: NOP },
    ReplacePattern { address: 0xC0D280, original: CD_RECOG_B, replacement: NOP },
];

const CDZ_SPEEDHACK: &[ReplacePattern] = &[
    ReplacePattern { address: 0xC0E6E0, original: SPEEDHACK_A, replacement: SPEEDHACK },
    ReplacePattern { address: 0xC0E724, original: SPEEDHACK_B, replacement: SPEEDHACK },
    ReplacePattern { address: 0xC0E764, original: SPEEDHACK_C, replacement: SPEEDHACK },
    ReplacePattern { address: 0xC0E836, original: SPEEDHACK_B, replacement: SPEEDHACK },
    ReplacePattern { address: 0xC0E860, original: SPEEDHACK_B, replacement: SPEEDHACK },
];

const CDZ_SMKDAN_CHECKSUM: &[ReplacePattern] = &[ReplacePattern {
    address: 0xC62BF4,
    original: SMKDAN_CHECKSUM_A,
    replacement: SMKDAN_CHECKSUM,
}];

const CDZ_UNIVERSE33_CHECKSUM: &[ReplacePattern] = &[ReplacePattern {
    address: 0xC1D3EC,
    original: UNIBIOS33_CHECKSUM_ORIGINAL,
    replacement: UNIBIOS33_CHECKSUM,
}];

const FRONT_CD_RECOG: &[ReplacePattern] =
    &[ReplacePattern { address: 0xC10B64, original: CD_RECOG_C, replacement: NOP }];

const FRONT_SPEEDHACK: &[ReplacePattern] = &[
    ReplacePattern { address: 0xC10716, original: SPEEDHACK_D, replacement: SPEEDHACK },
    ReplacePattern { address: 0xC10758, original: SPEEDHACK_B, replacement: SPEEDHACK },
    ReplacePattern { address: 0xC10798, original: SPEEDHACK_E, replacement: SPEEDHACK },
    ReplacePattern { address: 0xC10864, original: SPEEDHACK_B, replacement: SPEEDHACK },
];

const FRONT_SMKDAN_CHECKSUM: &[ReplacePattern] = &[ReplacePattern {
    address: 0xC23EBE,
    original: SMKDAN_CHECKSUM_B,
    replacement: SMKDAN_CHECKSUM,
}];

const TOP_CD_RECOG: &[ReplacePattern] =
    &[ReplacePattern { address: 0xC10436, original: CD_RECOG_C, replacement: NOP }];

const TOP_SPEEDHACK: &[ReplacePattern] = &[
    ReplacePattern { address: 0xC0FFCA, original: SPEEDHACK_F, replacement: SPEEDHACK },
    ReplacePattern { address: 0xC1000E, original: SPEEDHACK_B, replacement: SPEEDHACK },
    ReplacePattern { address: 0xC1004E, original: SPEEDHACK_G, replacement: SPEEDHACK },
    ReplacePattern { address: 0xC10120, original: SPEEDHACK_B, replacement: SPEEDHACK },
];

const TOP_SMKDAN_CHECKSUM: &[ReplacePattern] = &[ReplacePattern {
    address: 0xC23FBE,
    original: SMKDAN_CHECKSUM_B,
    replacement: SMKDAN_CHECKSUM,
}];

/// Byte-swap a BIOS image that was dumped word-swapped. Detected by the reset vector's
/// first word reading 0x1000 instead of 0x0010.
pub fn auto_byte_swap(bios: &mut [u8]) {
    if bios[0] == 0x10 && bios[1] == 0x00 {
        for chunk in bios.chunks_exact_mut(2) {
            chunk.swap(0, 1);
        }
    }
}

#[must_use]
pub fn identify(bios: &[u8]) -> BiosType {
    let mut family = BiosFamily::Invalid;
    let mut modification = BiosMod::None;

    if pattern_present(bios, &VALIDITY_PATTERN) {
        family = BiosFamily::Unknown;
    }

    if pattern_present(bios, &FRONT_LOADER_PATTERN) {
        family = BiosFamily::FrontLoader;
        if pattern_present(bios, &SMKDAN_FRONT_PATTERN) {
            modification = BiosMod::SmkDan;
        }
    } else if pattern_present(bios, &TOP_LOADER_PATTERN) {
        family = BiosFamily::TopLoader;
        if pattern_present(bios, &SMKDAN_TOP_PATTERN) {
            modification = BiosMod::SmkDan;
        }
    } else if pattern_present(bios, &CDZ_PATTERN) {
        family = BiosFamily::Cdz;
        if pattern_present(bios, &SMKDAN_CDZ_PATTERN) {
            modification = BiosMod::SmkDan;
        } else if pattern_present(bios, &UNIVERSE32_PATTERN) {
            modification = BiosMod::Universe32;
        } else if pattern_present(bios, &UNIVERSE33_PATTERN) {
            modification = BiosMod::Universe33;
        }
    }

    BiosType { family, modification }
}

/// Apply the recognized family's patches to an in-memory BIOS image. A pattern that
/// fails to match leaves the image untouched for that patch and logs a warning.
pub fn patch(bios: &mut [u8], bios_type: BiosType, speed_hack_enabled: bool) {
    let (cd_recog, speedhack, smkdan) = match bios_type.family {
        BiosFamily::Cdz => (CDZ_CD_RECOG, CDZ_SPEEDHACK, CDZ_SMKDAN_CHECKSUM),
        BiosFamily::FrontLoader => (FRONT_CD_RECOG, FRONT_SPEEDHACK, FRONT_SMKDAN_CHECKSUM),
        BiosFamily::TopLoader => (TOP_CD_RECOG, TOP_SPEEDHACK, TOP_SMKDAN_CHECKSUM),
        BiosFamily::Unknown | BiosFamily::Invalid => return,
    };

    if !replace_patterns(bios, cd_recog) {
        log::warn!("BIOS: CD recognition patch failed");
    }

    if speed_hack_enabled && !replace_patterns(bios, speedhack) {
        log::warn!("BIOS: Speed hack patch failed");
    }

    if bios_type.modification == BiosMod::SmkDan && !replace_patterns(bios, smkdan) {
        log::warn!("BIOS: SMKDan checksum patch failed");
    }

    if bios_type.family == BiosFamily::Cdz
        && bios_type.modification == BiosMod::Universe33
        && !replace_patterns(bios, CDZ_UNIVERSE33_CHECKSUM)
    {
        log::warn!("BIOS: Universe 3.3 checksum patch failed");
    }
}

fn pattern_present(bios: &[u8], pattern: &Pattern) -> bool {
    let offset = (pattern.address - BIOS_BASE) as usize;
    bios.get(offset..offset + pattern.data.len()) == Some(pattern.data)
}

fn replace_patterns(bios: &mut [u8], patterns: &[ReplacePattern]) -> bool {
    // Verify every pattern before touching anything
    for pattern in patterns {
        let offset = (pattern.address - BIOS_BASE) as usize;
        if bios.get(offset..offset + pattern.original.len()) != Some(pattern.original) {
            return false;
        }
    }

    for pattern in patterns {
        let offset = (pattern.address - BIOS_BASE) as usize;
        bios[offset..offset + pattern.replacement.len()].copy_from_slice(pattern.replacement);
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_bios(family_marker: &[u8]) -> Vec<u8> {
        let mut bios = vec![0; BIOS_LEN];
        bios[0..4].copy_from_slice(VALIDITY_PATTERN.data);
        bios[0x6C..0x70].copy_from_slice(family_marker);
        bios
    }

    #[test]
    fn identifies_families_by_marker() {
        assert_eq!(identify(&fake_bios(&[0x00, 0xC0, 0xA3, 0xE8])).family, BiosFamily::Cdz);
        assert_eq!(
            identify(&fake_bios(&[0x00, 0xC0, 0xC8, 0x5E])).family,
            BiosFamily::FrontLoader
        );
        assert_eq!(identify(&fake_bios(&[0x00, 0xC0, 0xC2, 0x22])).family, BiosFamily::TopLoader);
        assert_eq!(identify(&fake_bios(&[0x12, 0x34, 0x56, 0x78])).family, BiosFamily::Unknown);
        assert_eq!(identify(&vec![0; BIOS_LEN]).family, BiosFamily::Invalid);
    }

    #[test]
    fn byte_swap_detection() {
        let mut bios = vec![0_u8; BIOS_LEN];
        bios[0] = 0x10;
        bios[2] = 0xAB;
        bios[3] = 0xCD;

        auto_byte_swap(&mut bios);
        assert_eq!(&bios[0..4], &[0x00, 0x10, 0xCD, 0xAB]);

        // Already correctly ordered images are left alone
        auto_byte_swap(&mut bios);
        assert_eq!(&bios[0..4], &[0x00, 0x10, 0xCD, 0xAB]);
    }

    #[test]
    fn patch_requires_all_patterns_to_match() {
        let mut bios = fake_bios(&[0x00, 0xC0, 0xA3, 0xE8]);

        // Only one of the two CD recognition sites present: nothing is patched
        let offset = (0xC0EB82 - BIOS_BASE) as usize;
        bios[offset..offset + 2].copy_from_slice(CD_RECOG_A);

        patch(&mut bios.clone(), identify(&bios), false);
        assert_eq!(&bios[offset..offset + 2], CD_RECOG_A);

        // With both sites present, both get patched
        let offset_b = (0xC0D280 - BIOS_BASE) as usize;
        bios[offset_b..offset_b + 2].copy_from_slice(CD_RECOG_B);

        let bios_type = identify(&bios);
        patch(&mut bios, bios_type, false);
        assert_eq!(&bios[offset..offset + 2], NOP);
        assert_eq!(&bios[offset_b..offset_b + 2], NOP);
    }
}
