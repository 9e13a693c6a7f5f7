//! The 24-bit memory map: banks, region dispatch, the bank-switched window at
//! $E00000, and the M68K / Z80 bus views over the machine aggregate.

pub mod cdintf;
pub mod dma;

use crate::api::{interrupt, update_interrupts, MachineState};
use crate::audio::AudioBuffer;
use crate::cpu::{M68kBus, Z80Bus};
use crate::input::InputState;
use crate::lc8951::{CdStatus, Lc8951};
use crate::timer::{m68k_to_master, z80_to_master, TimerId, TimerState, TimerWheel, WATCHDOG_DELAY};
use crate::video::{Video, HIRQ_CTRL_RELATIVE};
use crate::ym2610::Ym2610;
use bincode::{Decode, Encode};
use cdrom::CdRom;
use neocd_common::boxedarray::{BoxedByteArray, BoxedWordArray};
use std::sync::LazyLock;

pub const RAM_LEN: usize = 0x20_0000;
pub const ROM_LEN: usize = 0x8_0000;
pub const SPR_RAM_LEN: usize = 0x40_0000;
pub const FIX_RAM_LEN: usize = 0x2_0000;
pub const PCM_RAM_LEN: usize = 0x10_0000;
pub const VIDEO_RAM_WORDS: usize = 0x1_0000;
pub const PALETTE_RAM_WORDS: usize = 0x2000;
pub const Y_ZOOM_ROM_LEN: usize = 0x1_0000;
pub const Z80_RAM_LEN: usize = 0x1_0000;
pub const BACKUP_RAM_LEN: usize = 0x2000;

pub const MEMORY_GRANULARITY: u32 = 0x80;
const LOOKUP_LEN: usize = (0x100_0000 / MEMORY_GRANULARITY) as usize;

// Bank-switched window area bits
pub const AREA_SPR: u32 = 1;
pub const AREA_PCM: u32 = 2;
pub const AREA_Z80: u32 = 4;
pub const AREA_FIX: u32 = 8;

// The generated Y-zoom table is bit-identical to the ROM in a real machine
const Y_ZOOM_ROM_CRC32: u32 = 0xE09E_253C;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Ram,
    Unused,
    Controller1,
    Z80Comm,
    Controller2,
    Controller3,
    Switches,
    VideoRegs,
    Palette,
    Backup,
    Rom,
    MappedRam,
    CdInterface,
    VectorRom,
    VectorRam,
}

#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub flags: u8,
    pub start: u32,
    pub end: u32,
    pub mask: u32,
    pub kind: RegionKind,
}

impl Region {
    pub const READ_NOP: u8 = 0x01;
    pub const READ_MAPPED: u8 = 0x02;
    pub const READ_DIRECT: u8 = 0x04;
    pub const WRITE_NOP: u8 = 0x08;
    pub const WRITE_MAPPED: u8 = 0x10;
    pub const WRITE_DIRECT: u8 = 0x20;

    const fn new(flags: u8, start: u32, end: u32, mask: u32, kind: RegionKind) -> Self {
        Self { flags, start, end, mask, kind }
    }

    #[must_use]
    pub fn read_direct(&self) -> bool {
        self.flags & Self::READ_DIRECT != 0
    }

    #[must_use]
    pub fn read_mapped(&self) -> bool {
        self.flags & Self::READ_MAPPED != 0
    }

    #[must_use]
    pub fn write_direct(&self) -> bool {
        self.flags & Self::WRITE_DIRECT != 0
    }

    #[must_use]
    pub fn write_mapped(&self) -> bool {
        self.flags & Self::WRITE_MAPPED != 0
    }
}

const RW_MAPPED: u8 = Region::READ_MAPPED | Region::WRITE_MAPPED;
const RW_NOP: u8 = Region::READ_NOP | Region::WRITE_NOP;

pub static MEMORY_REGIONS: [Region; 15] = [
    Region::new(
        Region::READ_DIRECT | Region::WRITE_DIRECT,
        0x000000,
        0x1FFFFF,
        0x001F_FFFF,
        RegionKind::Ram,
    ),
    // The $200000 area is normally random data (whatever is on the data bus?)
    Region::new(RW_NOP, 0x200000, 0x2FFFFF, 0, RegionKind::Unused),
    Region::new(RW_MAPPED, 0x300000, 0x31FFFF, 0x0000_0001, RegionKind::Controller1),
    Region::new(RW_MAPPED, 0x320000, 0x33FFFF, 0x0000_0001, RegionKind::Z80Comm),
    Region::new(RW_MAPPED, 0x340000, 0x35FFFF, 0x0000_0001, RegionKind::Controller2),
    Region::new(RW_NOP, 0x360000, 0x37FFFF, 0, RegionKind::Unused),
    Region::new(RW_MAPPED, 0x380000, 0x39FFFF, 0x0000_0001, RegionKind::Controller3),
    Region::new(RW_MAPPED, 0x3A0000, 0x3BFFFF, 0x0000_001F, RegionKind::Switches),
    Region::new(RW_MAPPED, 0x3C0000, 0x3DFFFF, 0x0000_000F, RegionKind::VideoRegs),
    Region::new(RW_NOP, 0x3E0000, 0x3FFFFF, 0, RegionKind::Unused),
    Region::new(RW_MAPPED, 0x400000, 0x4FFFFF, 0x0000_1FFF, RegionKind::Palette),
    Region::new(RW_MAPPED, 0x800000, 0x8FFFFF, 0x0000_3FFF, RegionKind::Backup),
    Region::new(
        Region::READ_DIRECT | Region::WRITE_NOP,
        0xC00000,
        0xCFFFFF,
        0x0007_FFFF,
        RegionKind::Rom,
    ),
    Region::new(RW_MAPPED, 0xE00000, 0xEFFFFF, 0x000F_FFFF, RegionKind::MappedRam),
    Region::new(RW_MAPPED, 0xFF0000, 0xFF01FF, 0x0000_01FF, RegionKind::CdInterface),
];

// The first 128 bytes alias either ROM or RAM under control of a runtime switch
static VECTOR_ROM_REGION: Region = Region::new(
    Region::READ_DIRECT | Region::WRITE_NOP,
    0x000000,
    0x00007F,
    0x0000_007F,
    RegionKind::VectorRom,
);
static VECTOR_RAM_REGION: Region = Region::new(
    Region::READ_DIRECT | Region::WRITE_DIRECT,
    0x000000,
    0x00007F,
    0x0000_007F,
    RegionKind::VectorRam,
);

// One entry per 128-byte granule of the address space; 0xFF marks unmapped granules
// (bus error)
static REGION_LOOKUP: LazyLock<Box<[u8; LOOKUP_LEN]>> = LazyLock::new(|| {
    let mut lookup: Box<[u8; LOOKUP_LEN]> =
        vec![0xFF; LOOKUP_LEN].into_boxed_slice().try_into().unwrap();

    for (index, region) in MEMORY_REGIONS.iter().enumerate() {
        let start = (region.start / MEMORY_GRANULARITY) as usize;
        let end = (region.end / MEMORY_GRANULARITY) as usize;
        for entry in &mut lookup[start..=end] {
            *entry = index as u8;
        }
    }

    lookup
});

#[derive(Debug, Clone, Encode, Decode)]
pub struct Memory {
    pub vectors_mapped_to_rom: bool,
    pub dma_config: [u16; 9],
    pub dma_source: u32,
    pub dma_destination: u32,
    pub dma_length: u32,
    pub dma_pattern: u16,
    pub spr_bank_select: u32,
    pub pcm_bank_select: u32,
    pub bus_request: u32,
    pub area_select: u32,

    pub ram: BoxedByteArray<RAM_LEN>,
    pub rom: BoxedByteArray<ROM_LEN>,
    pub spr_ram: BoxedByteArray<SPR_RAM_LEN>,
    pub fix_ram: BoxedByteArray<FIX_RAM_LEN>,
    pub pcm_ram: BoxedByteArray<PCM_RAM_LEN>,
    pub video_ram: BoxedWordArray<VIDEO_RAM_WORDS>,
    pub palette_ram: BoxedWordArray<PALETTE_RAM_WORDS>,
    pub z80_ram: BoxedByteArray<Z80_RAM_LEN>,
    pub backup_ram: BoxedByteArray<BACKUP_RAM_LEN>,
    pub y_zoom_rom: BoxedByteArray<Y_ZOOM_ROM_LEN>,
}

impl Memory {
    #[must_use]
    pub fn new() -> Self {
        let mut memory = Self {
            vectors_mapped_to_rom: true,
            dma_config: [0; 9],
            dma_source: 0,
            dma_destination: 0,
            dma_length: 0,
            dma_pattern: 0,
            spr_bank_select: 0,
            pcm_bank_select: 0,
            bus_request: 0,
            area_select: 0,
            ram: BoxedByteArray::new(),
            rom: BoxedByteArray::new(),
            spr_ram: BoxedByteArray::new(),
            fix_ram: BoxedByteArray::new(),
            pcm_ram: BoxedByteArray::new(),
            video_ram: BoxedWordArray::new(),
            palette_ram: BoxedWordArray::new(),
            z80_ram: BoxedByteArray::new(),
            backup_ram: BoxedByteArray::new(),
            y_zoom_rom: BoxedByteArray::new(),
        };
        memory.generate_y_zoom_rom();
        memory
    }

    pub fn reset(&mut self) {
        self.ram.fill(0);
        self.spr_ram.fill(0);
        self.fix_ram.fill(0);
        self.pcm_ram.fill(0);
        self.video_ram.fill(0);
        self.palette_ram.fill(0);
        self.z80_ram.fill(0);

        self.vectors_mapped_to_rom = true;
        self.reset_dma();

        self.bus_request = 0;
        self.area_select = 0;
        self.spr_bank_select = 0;
        self.pcm_bank_select = 0;
    }

    pub fn reset_dma(&mut self) {
        self.dma_config = [0; 9];
        self.dma_source = 0;
        self.dma_destination = 0;
        self.dma_length = 0;
        self.dma_pattern = 0;
    }

    /// Resolve an address to its region, or None for a bus error.
    #[must_use]
    pub fn region_at(&self, address: u32) -> Option<&'static Region> {
        if address < 0x80 {
            return Some(if self.vectors_mapped_to_rom {
                &VECTOR_ROM_REGION
            } else {
                &VECTOR_RAM_REGION
            });
        }

        match REGION_LOOKUP[(address / MEMORY_GRANULARITY) as usize] {
            0xFF => None,
            index => Some(&MEMORY_REGIONS[index as usize]),
        }
    }

    fn direct_bank(&self, kind: RegionKind) -> &[u8] {
        match kind {
            RegionKind::Ram | RegionKind::VectorRam => self.ram.as_slice(),
            RegionKind::Rom | RegionKind::VectorRom => self.rom.as_slice(),
            _ => panic!("region {kind:?} has no direct read base"),
        }
    }

    fn direct_bank_mut(&mut self, kind: RegionKind) -> &mut [u8] {
        match kind {
            RegionKind::Ram | RegionKind::VectorRam => self.ram.as_mut_slice(),
            _ => panic!("region {kind:?} has no direct write base"),
        }
    }

    #[must_use]
    pub fn read_byte_direct(&self, kind: RegionKind, offset: u32) -> u8 {
        self.direct_bank(kind)[offset as usize]
    }

    #[must_use]
    pub fn read_word_direct(&self, kind: RegionKind, offset: u32) -> u16 {
        let bank = self.direct_bank(kind);
        u16::from_be_bytes([bank[offset as usize], bank[offset as usize + 1]])
    }

    pub fn write_byte_direct(&mut self, kind: RegionKind, offset: u32, value: u8) {
        self.direct_bank_mut(kind)[offset as usize] = value;
    }

    pub fn write_word_direct(&mut self, kind: RegionKind, offset: u32, value: u16) {
        let bank = self.direct_bank_mut(kind);
        bank[offset as usize..offset as usize + 2].copy_from_slice(&value.to_be_bytes());
    }

    #[must_use]
    pub fn spr_ram(&self) -> &[u8; SPR_RAM_LEN] {
        &self.spr_ram
    }

    pub fn spr_ram_mut(&mut self) -> &mut [u8; SPR_RAM_LEN] {
        &mut self.spr_ram
    }

    #[must_use]
    pub fn y_zoom_rom(&self) -> &[u8; Y_ZOOM_ROM_LEN] {
        &self.y_zoom_rom
    }

    // Generate the Y-zoom lookup data instead of loading it from a dump; the generated
    // table matches real hardware (checked by CRC32)
    fn generate_y_zoom_rom(&mut self) {
        const Y_ZOOM_ORDER: [u8; 16] =
            [0x8, 0x0, 0xC, 0x4, 0xA, 0x2, 0xE, 0x6, 0x9, 0x1, 0xD, 0x5, 0xB, 0x3, 0xF, 0x7];

        let mut present = [false; 256];
        let mut out = 0_usize;

        for z in 0..16 {
            for y in 0..16 {
                present[((Y_ZOOM_ORDER[y] as usize) << 4) | Y_ZOOM_ORDER[z] as usize] = true;

                let end = out + 256;
                for (t, &included) in present.iter().enumerate() {
                    if included {
                        self.y_zoom_rom[out] = t as u8;
                        out += 1;
                    }
                }

                self.y_zoom_rom[out..end].fill(0xFF);
                out = end;
            }
        }

        let crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
        debug_assert_eq!(crc.checksum(self.y_zoom_rom.as_slice()), Y_ZOOM_ROM_CRC32);
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

/// The 68000's bus: a borrow of everything in the machine except the CPU cores.
pub struct MainBus<'a> {
    pub memory: &'a mut Memory,
    pub video: &'a mut Video,
    pub lc8951: &'a mut Lc8951,
    pub cdrom: &'a mut CdRom,
    pub timers: &'a mut TimerWheel,
    pub input: &'a mut InputState,
    pub audio: &'a mut AudioBuffer,
    pub ym2610: &'a mut Ym2610,
    pub state: &'a mut MachineState,
}

impl MainBus<'_> {
    fn bus_error(&mut self, address: u32, write: bool) {
        log::debug!(
            "Bus error on {} of {address:06X}",
            if write { "write" } else { "read" }
        );
        self.state.pending_bus_error = true;
    }

    // Timers armed from bus handlers cannot recurse into the machine's dispatch; an
    // already-expired arm fires on the next advance instead
    fn arm_timer(&mut self, id: TimerId, delay: i32) {
        if self.timers.timer_mut(id).arm(delay) {
            let _ = self.timers.timer_mut(id).arm(1);
        }
    }

    fn mapped_read_byte(&mut self, kind: RegionKind, offset: u32) -> u8 {
        match kind {
            RegionKind::Controller1 => {
                if offset & 1 == 0 {
                    self.input.input1().unwrap_or(0xFF)
                } else {
                    0xFF
                }
            }
            RegionKind::Controller2 => {
                if offset & 1 == 0 {
                    self.input.input2().unwrap_or(0xFF)
                } else {
                    0xFF
                }
            }
            RegionKind::Controller3 => {
                if offset & 1 == 0 {
                    self.input.input3().unwrap_or(0x0F)
                } else {
                    0xFF
                }
            }
            RegionKind::Z80Comm => {
                if offset == 0 {
                    self.state.audio_result as u8
                } else {
                    0xFF
                }
            }
            RegionKind::Switches => 0xFF,
            RegionKind::VideoRegs => {
                if offset & 1 == 0 {
                    (self.video_register_read(offset & 6) >> 8) as u8
                } else {
                    0xFF
                }
            }
            RegionKind::Palette => {
                let word = self.palette_word(offset);
                if offset & 1 == 0 { (word >> 8) as u8 } else { word as u8 }
            }
            RegionKind::Backup => {
                if offset & 1 != 0 {
                    self.memory.backup_ram[(offset >> 1) as usize]
                } else {
                    0xFF
                }
            }
            RegionKind::MappedRam => self.mapped_ram_read_byte(offset),
            RegionKind::CdInterface => cdintf::read_byte(self, offset),
            _ => 0xFF,
        }
    }

    fn mapped_read_word(&mut self, kind: RegionKind, offset: u32) -> u16 {
        match kind {
            RegionKind::Controller1 => {
                self.input.input1().map_or(0xFFFF, |input| (u16::from(input) << 8) | 0xFF)
            }
            RegionKind::Controller2 => {
                self.input.input2().map_or(0xFFFF, |input| (u16::from(input) << 8) | 0xFF)
            }
            RegionKind::Controller3 => {
                self.input.input3().map_or(0x0FFF, |input| (u16::from(input) << 8) | 0xFF)
            }
            RegionKind::Z80Comm => ((self.state.audio_result as u16) << 8) | 0xFF,
            RegionKind::Switches => 0xFFFF,
            RegionKind::VideoRegs => self.video_register_read(offset),
            RegionKind::Palette => self.palette_word(offset),
            RegionKind::Backup => {
                u16::from(self.memory.backup_ram[(offset >> 1) as usize]) | 0xFF00
            }
            RegionKind::MappedRam => self.mapped_ram_read_word(offset),
            RegionKind::CdInterface => cdintf::read_word(self, offset),
            _ => 0xFFFF,
        }
    }

    fn mapped_write_byte(&mut self, kind: RegionKind, offset: u32, value: u8) {
        match kind {
            RegionKind::Controller1 => {
                if offset & 1 != 0 {
                    self.timers.timer_mut(TimerId::Watchdog).set_delay(WATCHDOG_DELAY);
                }
            }
            RegionKind::Controller2 => {}
            RegionKind::Controller3 => {
                if offset & 1 != 0 {
                    self.input.set_selector(value);
                }
            }
            RegionKind::Z80Comm => {
                if offset == 0 {
                    self.post_audio_command(u32::from(value));
                }
            }
            RegionKind::Switches => {
                // The switch registers only respond to odd byte accesses
                if offset & 1 != 0 {
                    self.switch_write(offset & !1, u16::from(value));
                }
            }
            RegionKind::VideoRegs => {
                if offset & 1 == 0 {
                    let word = (u16::from(value) << 8) | u16::from(value);
                    self.video_register_write(offset, word);
                }
            }
            RegionKind::Palette => {
                let index =
                    (self.video.active_palette_bank * 4096 + (offset >> 1)) as usize;
                let word = &mut self.memory.palette_ram[index];
                if offset & 1 == 0 {
                    *word = (*word & 0x00FF) | (u16::from(value) << 8);
                } else {
                    *word = (*word & 0xFF00) | u16::from(value);
                }
                self.video.convert_color(&self.memory.palette_ram, index);
            }
            RegionKind::Backup => {
                if offset & 1 != 0 {
                    self.memory.backup_ram[(offset >> 1) as usize] = value;
                }
            }
            RegionKind::MappedRam => self.mapped_ram_write_byte(offset, value),
            RegionKind::CdInterface => cdintf::write_byte(self, offset, value),
            _ => {}
        }
    }

    fn mapped_write_word(&mut self, kind: RegionKind, offset: u32, value: u16) {
        match kind {
            RegionKind::Controller1 => {
                self.timers.timer_mut(TimerId::Watchdog).set_delay(WATCHDOG_DELAY);
            }
            RegionKind::Controller2 => {}
            RegionKind::Controller3 => self.input.set_selector(value as u8),
            RegionKind::Z80Comm => self.post_audio_command(u32::from(value >> 8)),
            RegionKind::Switches => self.switch_write(offset, value),
            RegionKind::VideoRegs => self.video_register_write(offset, value),
            RegionKind::Palette => {
                let index =
                    (self.video.active_palette_bank * 4096 + (offset >> 1)) as usize;
                self.memory.palette_ram[index] = value;
                self.video.convert_color(&self.memory.palette_ram, index);
            }
            RegionKind::Backup => {
                self.memory.backup_ram[(offset >> 1) as usize] = value as u8;
            }
            RegionKind::MappedRam => self.mapped_ram_write_word(offset, value),
            RegionKind::CdInterface => cdintf::write_word(self, offset, value),
            _ => {}
        }
    }

    fn palette_word(&self, offset: u32) -> u16 {
        self.memory.palette_ram[(self.video.active_palette_bank * 4096 + (offset >> 1)) as usize]
    }

    // The sound command is posted through a one-shot timer armed with delay 1 (not 0),
    // and the 68K yields its timeslice so the Z80 catches up before the command lands
    fn post_audio_command(&mut self, command: u32) {
        self.timers.timer_mut(TimerId::AudioCommand).set_user_data(command);
        self.arm_timer(TimerId::AudioCommand, 1);
        self.state.end_timeslice = true;
    }

    fn switch_write(&mut self, offset: u32, value: u16) {
        match offset {
            // Darken colors, ignored for now
            0x00 | 0x10 => {}
            0x02 => self.memory.vectors_mapped_to_rom = true,
            0x0E => self.video.active_palette_bank = 0,
            0x12 => self.memory.vectors_mapped_to_rom = false,
            0x1E => self.video.active_palette_bank = 1,
            _ => {
                log::debug!("Write to unknown switch {:06X} = {value:04X}", 0x3A0000 + offset);
            }
        }
    }

    fn video_register_read(&mut self, offset: u32) -> u16 {
        match offset {
            0x0 | 0x2 => self.video.videoram_data as u16,
            0x4 => self.video.videoram_modulo as u16,
            0x6 => {
                let mut vertical_position = self.state.screen_y() + 0x100;
                if vertical_position >= 0x200 {
                    vertical_position -= crate::timer::SCREEN_HEIGHT;
                }

                ((vertical_position as u16) << 7)
                    | (self.video.auto_animation_counter as u16 & 7)
            }
            _ => 0xFFFF,
        }
    }

    fn video_register_write(&mut self, offset: u32, value: u16) {
        match offset {
            0x0 => {
                self.video.videoram_offset = u32::from(value);
                self.video.videoram_data =
                    u32::from(self.memory.video_ram[self.video.videoram_offset as usize]);
            }
            0x2 => {
                self.memory.video_ram[self.video.videoram_offset as usize] = value;
                self.video.videoram_offset = (self.video.videoram_offset & 0x8000)
                    | ((self.video.videoram_offset + self.video.videoram_modulo) & 0x7FFF);
                self.video.videoram_data =
                    u32::from(self.memory.video_ram[self.video.videoram_offset as usize]);
            }
            0x4 => self.video.videoram_modulo = u32::from(value),
            0x6 => {
                self.video.auto_animation_speed = u32::from(value >> 8);
                self.video.auto_animation_disabled = value & 0x0008 != 0;
                self.video.hirq_control = u32::from(value & 0x00F0);
            }
            0x8 => {
                self.video.hirq_register =
                    (self.video.hirq_register & 0x0000_FFFF) | (u32::from(value) << 16);
            }
            0xA => {
                self.video.hirq_register =
                    (self.video.hirq_register & 0xFFFF_0000) | u32::from(value);

                if self.video.hirq_control & HIRQ_CTRL_RELATIVE != 0 {
                    // Raster effects program the next line's interrupt in cycles from
                    // "now", so account for time already executed in this timeslice
                    let delay = crate::api::pixel_delay(self.video.hirq_register.wrapping_add(1));
                    let arm_at = self.state.slice_m68k_master_cycles + delay;
                    self.arm_timer(TimerId::Hbl, arm_at);
                }
            }
            0xC => {
                if value & 0x02 != 0 {
                    self.state.pending_interrupts &= !interrupt::RASTER;
                }
                if value & 0x04 != 0 {
                    self.state.pending_interrupts &= !interrupt::VBLANK;
                }
                update_interrupts(self.state);
            }
            0xE => {
                log::debug!("Write to video register $3C000E = {value:04X}");
            }
            _ => {}
        }
    }

    fn mapped_area_open(&self) -> bool {
        self.memory.area_select & self.memory.bus_request != 0
    }

    fn mapped_ram_read_byte(&mut self, offset: u32) -> u8 {
        if !self.mapped_area_open() {
            return 0xFF;
        }

        let memory = &mut self.memory;
        match memory.area_select {
            AREA_FIX if offset & 1 != 0 => memory.fix_ram[((offset >> 1) & 0x1FFFF) as usize],
            AREA_SPR => {
                let address =
                    (offset + (memory.spr_bank_select & 3) * 0x10_0000) & 0x3F_FFFF;
                memory.spr_ram[address as usize]
            }
            AREA_Z80 if offset & 1 != 0 => memory.z80_ram[((offset >> 1) & 0xFFFF) as usize],
            AREA_PCM if offset & 1 != 0 => {
                let address =
                    ((offset >> 1) + (memory.pcm_bank_select & 1) * 0x8_0000) & 0xF_FFFF;
                memory.pcm_ram[address as usize]
            }
            _ => 0xFF,
        }
    }

    fn mapped_ram_read_word(&mut self, offset: u32) -> u16 {
        if !self.mapped_area_open() {
            return 0xFFFF;
        }

        let memory = &mut self.memory;
        match memory.area_select {
            AREA_FIX => {
                u16::from(memory.fix_ram[((offset >> 1) & 0x1FFFF) as usize]) | 0xFF00
            }
            AREA_SPR => {
                let address =
                    ((offset + (memory.spr_bank_select & 3) * 0x10_0000) & 0x3F_FFFE) as usize;
                u16::from_be_bytes([memory.spr_ram[address], memory.spr_ram[address + 1]])
            }
            AREA_Z80 => u16::from(memory.z80_ram[((offset >> 1) & 0xFFFF) as usize]) | 0xFF00,
            AREA_PCM => {
                let address =
                    ((offset >> 1) + (memory.pcm_bank_select & 1) * 0x8_0000) & 0xF_FFFF;
                u16::from(memory.pcm_ram[address as usize]) | 0xFF00
            }
            _ => 0xFFFF,
        }
    }

    fn mapped_ram_write_byte(&mut self, offset: u32, value: u8) {
        if !self.mapped_area_open() {
            return;
        }

        let memory = &mut self.memory;
        match memory.area_select {
            AREA_FIX if offset & 1 != 0 => {
                memory.fix_ram[((offset >> 1) & 0x1FFFF) as usize] = value;
            }
            AREA_SPR => {
                let address =
                    (offset + (memory.spr_bank_select & 3) * 0x10_0000) & 0x3F_FFFF;
                memory.spr_ram[address as usize] = value;
            }
            AREA_Z80 if offset & 1 != 0 => {
                memory.z80_ram[((offset >> 1) & 0xFFFF) as usize] = value;
            }
            AREA_PCM if offset & 1 != 0 => {
                let address =
                    ((offset >> 1) + (memory.pcm_bank_select & 1) * 0x8_0000) & 0xF_FFFF;
                memory.pcm_ram[address as usize] = value;
            }
            _ => {}
        }
    }

    fn mapped_ram_write_word(&mut self, offset: u32, value: u16) {
        if !self.mapped_area_open() {
            return;
        }

        let memory = &mut self.memory;
        match memory.area_select {
            AREA_FIX => {
                memory.fix_ram[((offset >> 1) & 0x1FFFF) as usize] = value as u8;
            }
            AREA_SPR => {
                let address =
                    ((offset + (memory.spr_bank_select & 3) * 0x10_0000) & 0x3F_FFFE) as usize;
                memory.spr_ram[address..address + 2].copy_from_slice(&value.to_be_bytes());
            }
            AREA_Z80 => {
                memory.z80_ram[((offset >> 1) & 0xFFFF) as usize] = value as u8;
            }
            AREA_PCM => {
                let address =
                    ((offset >> 1) + (memory.pcm_bank_select & 1) * 0x8_0000) & 0xF_FFFF;
                memory.pcm_ram[address as usize] = value as u8;
            }
            _ => {}
        }
    }
}

impl M68kBus for MainBus<'_> {
    fn read_byte(&mut self, address: u32) -> u8 {
        let address = address & 0xFF_FFFF;
        let Some(region) = self.memory.region_at(address) else {
            self.bus_error(address, false);
            return 0xFF;
        };

        if region.read_direct() {
            self.memory.read_byte_direct(region.kind, address & region.mask)
        } else if region.read_mapped() {
            self.mapped_read_byte(region.kind, address & region.mask)
        } else {
            0xFF
        }
    }

    fn read_word(&mut self, address: u32) -> u16 {
        let address = address & 0xFF_FFFF;
        let Some(region) = self.memory.region_at(address) else {
            self.bus_error(address, false);
            return 0xFFFF;
        };

        if region.read_direct() {
            self.memory.read_word_direct(region.kind, address & region.mask)
        } else if region.read_mapped() {
            self.mapped_read_word(region.kind, address & region.mask)
        } else {
            0xFFFF
        }
    }

    fn write_byte(&mut self, address: u32, value: u8) {
        let address = address & 0xFF_FFFF;
        let Some(region) = self.memory.region_at(address) else {
            self.bus_error(address, true);
            return;
        };

        if region.write_direct() {
            self.memory.write_byte_direct(region.kind, address & region.mask, value);
        } else if region.write_mapped() {
            self.mapped_write_byte(region.kind, address & region.mask, value);
        }
    }

    fn write_word(&mut self, address: u32, value: u16) {
        let address = address & 0xFF_FFFF;
        let Some(region) = self.memory.region_at(address) else {
            self.bus_error(address, true);
            return;
        };

        if region.write_direct() {
            self.memory.write_word_direct(region.kind, address & region.mask, value);
        } else if region.write_mapped() {
            self.mapped_write_word(region.kind, address & region.mask, value);
        }
    }

    fn sync(&mut self, cycles_run: u32) {
        self.state.slice_m68k_master_cycles = m68k_to_master(cycles_run as i32);
    }

    fn interrupt_level(&self) -> u8 {
        self.state.m68k_irq_level
    }

    fn acknowledge_interrupt(&mut self, level: u8) -> u32 {
        if level == 2 {
            self.state.cdrom_vector
        } else {
            // Standard autovector offsets
            0x60 + 4 * u32::from(level)
        }
    }

    fn take_bus_error(&mut self) -> bool {
        std::mem::take(&mut self.state.pending_bus_error)
    }

    fn should_end_timeslice(&self) -> bool {
        self.state.end_timeslice
    }
}

/// The Z80's bus: work RAM plus the sound I/O ports.
pub struct AudioBus<'a> {
    pub memory: &'a mut Memory,
    pub ym2610: &'a mut Ym2610,
    pub timers: &'a mut TimerWheel,
    pub audio: &'a mut AudioBuffer,
    pub state: &'a mut MachineState,
}

impl AudioBus<'_> {
    fn catch_up_ym2610(&mut self) {
        crate::api::catch_up_ym2610(
            self.ym2610,
            self.audio,
            &self.memory.pcm_ram,
            self.state.z80_cycles_this_frame + self.state.slice_z80_master_cycles,
        );
    }
}

impl Z80Bus for AudioBus<'_> {
    fn read_memory(&mut self, address: u16) -> u8 {
        self.memory.z80_ram[address as usize]
    }

    fn write_memory(&mut self, address: u16, value: u8) {
        self.memory.z80_ram[address as usize] = value;
    }

    fn read_io(&mut self, port: u16) -> u8 {
        match port & 0xFF {
            // Sound code from the 68K
            0x00 => self.state.audio_command as u8,
            0x04..=0x07 => self.ym2610.read(((port & 0xFF) - 4) as u8),
            _ => 0,
        }
    }

    fn write_io(&mut self, port: u16, value: u8) {
        match port & 0xFF {
            // Clear sound code
            0x00 => self.state.audio_command = 0,
            0x04..=0x07 => {
                self.catch_up_ym2610();
                self.ym2610.write(((port & 0xFF) - 4) as u8, value, self.timers);
                self.state.z80_irq_line = self.ym2610.irq_line();
            }
            0x08 => self.state.z80_nmi_disable = false,
            0x0C => self.state.audio_result = u32::from(value),
            0x18 => self.state.z80_nmi_disable = true,
            _ => {}
        }
    }

    fn sync(&mut self, cycles_run: u32) {
        self.state.slice_z80_master_cycles = z80_to_master(cycles_run as i32);
    }

    fn take_nmi(&mut self) -> bool {
        std::mem::take(&mut self.state.z80_nmi_pending)
    }

    fn interrupt_line(&self) -> bool {
        self.state.z80_irq_line
    }
}

// Used by the CD interface handlers
impl MainBus<'_> {
    pub(crate) fn watchdog_control(&mut self, disable: bool) {
        let timer = self.timers.timer_mut(TimerId::Watchdog);
        if disable {
            let _ = timer.set_state(TimerState::Stopped);
        } else if timer.set_state(TimerState::Active) {
            let _ = timer.arm(1);
        }
    }

    pub(crate) fn cd_reset(&mut self) {
        self.cdrom.stop();
        self.lc8951.status = CdStatus::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_lookup_is_total_and_consistent() {
        let memory = Memory::new();

        for granule in 0..LOOKUP_LEN {
            let address = granule as u32 * MEMORY_GRANULARITY;
            match memory.region_at(address) {
                Some(region) => {
                    assert!(
                        (region.start..=region.end).contains(&address),
                        "address {address:06X} resolved outside its region"
                    );
                }
                None => {
                    // Unmapped granules must not overlap any region
                    for region in &MEMORY_REGIONS {
                        assert!(
                            !(region.start..=region.end).contains(&address),
                            "address {address:06X} is inside region {:?} but unmapped",
                            region.kind
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn every_region_address_maps_back_to_it() {
        let memory = Memory::new();

        for region in &MEMORY_REGIONS {
            for address in
                [region.start, region.end, (region.start + region.end) / 2 & !(MEMORY_GRANULARITY - 1)]
            {
                // The vector alias shadows the first granule of RAM
                if address < 0x80 {
                    continue;
                }

                let resolved = memory.region_at(address).expect("region address unmapped");
                assert_eq!(resolved.start, region.start);
            }
        }
    }

    #[test]
    fn unmapped_addresses_resolve_to_none() {
        let memory = Memory::new();

        for address in [0x500000_u32, 0x700000, 0x900000, 0xB00000, 0xD00000, 0xF00000, 0xFF0200] {
            assert!(memory.region_at(address).is_none(), "{address:06X} should be unmapped");
        }
    }

    #[test]
    fn vector_alias_switches_between_rom_and_ram() {
        let mut memory = Memory::new();
        memory.rom[0x10] = 0xAB;
        memory.ram[0x10] = 0xCD;

        assert_eq!(memory.region_at(0x10).unwrap().kind, RegionKind::VectorRom);
        assert_eq!(memory.read_byte_direct(RegionKind::VectorRom, 0x10), 0xAB);

        memory.vectors_mapped_to_rom = false;
        assert_eq!(memory.region_at(0x10).unwrap().kind, RegionKind::VectorRam);
        assert_eq!(memory.read_byte_direct(RegionKind::VectorRam, 0x10), 0xCD);

        // Addresses at and above 0x80 always hit main RAM
        assert_eq!(memory.region_at(0x80).unwrap().kind, RegionKind::Ram);
    }

    #[test]
    fn direct_word_access_is_big_endian() {
        let mut memory = Memory::new();
        memory.write_word_direct(RegionKind::Ram, 0x1000, 0x1234);

        assert_eq!(memory.read_byte_direct(RegionKind::Ram, 0x1000), 0x12);
        assert_eq!(memory.read_byte_direct(RegionKind::Ram, 0x1001), 0x34);
        assert_eq!(memory.read_word_direct(RegionKind::Ram, 0x1000), 0x1234);
    }

    #[test]
    fn y_zoom_rom_has_expected_structure() {
        let memory = Memory::new();

        // The final row (full zoom) is the identity mapping
        for line in 0..256 {
            assert_eq!(memory.y_zoom_rom[255 * 256 + line], line as u8);
        }

        // Row 0 (zoom 0) keeps exactly one line
        let row = &memory.y_zoom_rom[..256];
        assert_eq!(row.iter().filter(|&&v| v != 0xFF).count(), 1);
    }
}
