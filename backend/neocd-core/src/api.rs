//! The machine aggregate, the master-clock frame scheduler, and the public emulator
//! interface.

use crate::audio::{AudioBuffer, CD_BUFFER_LEN};
use crate::bios::{self, BiosFamily, BiosType, BIOS_LEN};
use crate::cpu::{M68kCore, Z80Core};
use crate::input::{InputState, NeoGeoCdInputs};
use crate::lc8951::Lc8951;
use crate::memory::{AudioBus, MainBus, Memory, PCM_RAM_LEN};
use crate::timer::{
    m68k_to_master, master_to_m68k, master_to_pixel, master_to_z80, pixel_to_master, z80_to_master,
    TimerId, TimerWheel, CDROM_64HZ_DELAY, CDROM_75HZ_DELAY, CYCLES_PER_FRAME, SCREEN_HEIGHT,
    SCREEN_WIDTH,
};
use crate::video::{
    Video, HIRQ_CTRL_AUTOREPEAT, HIRQ_CTRL_ENABLE, HIRQ_CTRL_VBLANK_LOAD,
};
use crate::ym2610::Ym2610;
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use cdrom::{CdRom, CdRomError};
use neocd_common::frontend::{AudioOutput, Renderer, SaveWriter};
use thiserror::Error;

/// Pending interrupt bits, in priority order.
pub mod interrupt {
    pub const VBLANK: u32 = 1;
    pub const CD_DECODER: u32 = 2;
    pub const CD_COMM: u32 = 4;
    pub const RASTER: u32 = 8;
}

// Upper bound on frames run back-to-back by the loading skip
const MAX_SKIP_FRAMES: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
pub enum Region {
    #[default]
    Japan,
    Usa,
    Europe,
}

impl Region {
    fn nationality(self) -> u32 {
        match self {
            Self::Japan => 0,
            Self::Usa => 1,
            Self::Europe => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Encode, Decode)]
pub struct NeoGeoCdConfig {
    pub region: Region,
    pub cd_speed_hack: bool,
    pub skip_cd_loading: bool,
    pub per_content_saves: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("BIOS is required for Neo Geo CD emulation")]
    MissingBios,
    #[error("BIOS must be {BIOS_LEN} bytes, was {bios_len} bytes")]
    InvalidBiosSize { bios_len: usize },
    #[error("BIOS image not recognized as a Neo Geo CD BIOS")]
    InvalidBios,
    #[error("Disc-related error: {0}")]
    Disc(#[from] CdRomError),
}

#[derive(Debug, Error)]
pub enum NeoGeoCdError<RErr, AErr> {
    #[error("Rendering error: {0}")]
    Render(RErr),
    #[error("Audio output error: {0}")]
    Audio(AErr),
}

/// Machine-level scalar state shared with the bus handlers.
#[derive(Debug, Clone, Encode, Decode)]
pub struct MachineState {
    pub cdz_irq1_divisor: u32,
    pub cd_comm_enabled: bool,
    pub irq_mask1: u32,
    pub irq_mask2: u32,
    pub irq1_enabled_this_frame: bool,
    pub fast_forward: bool,
    pub nationality: u32,
    pub cdrom_vector: u32,
    pub pending_interrupts: u32,
    pub remaining_cycles_this_frame: i32,
    pub m68k_cycles_this_frame: i32,
    pub z80_cycles_this_frame: i32,
    pub z80_time_slice: i32,
    pub z80_disable: bool,
    pub z80_nmi_disable: bool,
    pub audio_command: u32,
    pub audio_result: u32,
    pub bios_type: BiosType,
    pub m68k_irq_level: u8,
    pub pending_bus_error: bool,
    pub end_timeslice: bool,
    pub z80_nmi_pending: bool,
    pub z80_irq_line: bool,
    pub z80_reset_pending: bool,
    pub slice_m68k_master_cycles: i32,
    pub slice_z80_master_cycles: i32,
}

impl MachineState {
    fn new(region: Region, bios_type: BiosType) -> Self {
        Self {
            cdz_irq1_divisor: 0,
            cd_comm_enabled: false,
            irq_mask1: 0,
            irq_mask2: 0,
            irq1_enabled_this_frame: false,
            fast_forward: false,
            nationality: region.nationality(),
            cdrom_vector: 0,
            pending_interrupts: 0,
            remaining_cycles_this_frame: 0,
            m68k_cycles_this_frame: 0,
            z80_cycles_this_frame: 0,
            z80_time_slice: 0,
            z80_disable: true,
            z80_nmi_disable: true,
            audio_command: 0,
            audio_result: 0,
            bios_type,
            m68k_irq_level: 0,
            pending_bus_error: false,
            end_timeslice: false,
            z80_nmi_pending: false,
            z80_irq_line: false,
            z80_reset_pending: false,
            slice_m68k_master_cycles: 0,
            slice_z80_master_cycles: 0,
        }
    }

    fn reset(&mut self) {
        let region_nationality = self.nationality;
        let bios_type = self.bios_type;
        *self = Self::new(Region::Japan, bios_type);
        self.nationality = region_nationality;
    }

    #[must_use]
    pub fn bios_family(&self) -> BiosFamily {
        self.bios_type.family
    }

    fn screen_pixel(&self) -> i32 {
        master_to_pixel(CYCLES_PER_FRAME - self.remaining_cycles_this_frame)
    }

    #[must_use]
    pub fn screen_x(&self) -> i32 {
        self.screen_pixel() % SCREEN_WIDTH
    }

    #[must_use]
    pub fn screen_y(&self) -> i32 {
        self.screen_pixel() / SCREEN_WIDTH
    }

    #[must_use]
    pub fn is_vbl_enabled(&self) -> bool {
        self.irq_mask2 & 0x030 == 0x030
    }

    #[must_use]
    pub fn is_hbl_enabled(&self) -> bool {
        self.irq_mask2 & 0x700 == 0x700
    }

    #[must_use]
    pub fn cd_decoder_irq_enabled(&self) -> bool {
        self.irq_mask1 & 0x500 == 0x500
    }

    // The communication reset register gates the communication IRQ but never the
    // decoder IRQ (verified on real hardware)
    #[must_use]
    pub fn cd_comm_irq_enabled(&self) -> bool {
        self.irq_mask1 & 0x050 == 0x050 && self.cd_comm_enabled
    }
}

/// Recompute the M68K interrupt level and the latched CD-ROM vector from the pending
/// bits. The CPU core observes the result through its bus.
pub fn update_interrupts(state: &mut MachineState) {
    let mut level = 0;

    if state.pending_interrupts & interrupt::VBLANK != 0 {
        level = 1;
    }

    if state.pending_interrupts & interrupt::CD_DECODER != 0 {
        level = 2;
        state.cdrom_vector = 0x54;
    }

    if state.pending_interrupts & interrupt::CD_COMM != 0 {
        level = 2;
        state.cdrom_vector = 0x58;
    }

    if state.pending_interrupts & interrupt::RASTER != 0 {
        level = 3;
    }

    state.m68k_irq_level = level;
}

/// Convert a pixel count to a master-cycle delay, clamped so guests programming
/// extreme reload values (Neo Drift Out writes 0xFFFFFFFF) cannot overflow the timer.
#[must_use]
pub fn pixel_delay(pixels: u32) -> i32 {
    let max_pixels = master_to_pixel(i32::MAX - 4) as u32;
    pixel_to_master(pixels.clamp(1, max_pixels) as i32)
}

/// Generate YM2610 samples up to the current position in the frame. Called before any
/// register write that affects output, so earlier samples keep the old settings.
pub(crate) fn catch_up_ym2610(
    ym2610: &mut Ym2610,
    audio: &mut AudioBuffer,
    pcm_ram: &[u8; PCM_RAM_LEN],
    cycles_this_frame: i32,
) {
    let current_sample = audio.master_cycles_to_sample(cycles_this_frame);
    let target = (current_sample.max(0) as u32).min(crate::audio::YM_BUFFER_LEN as u32);

    if target > audio.write_pointer() {
        ym2610.update(target - audio.write_pointer(), pcm_ram, audio);
    }
}

#[derive(Debug, Encode, Decode)]
pub struct NeoGeoCd<M, Z> {
    state: MachineState,
    m68k: M,
    z80: Z,
    timers: TimerWheel,
    memory: Memory,
    video: Video,
    audio: AudioBuffer,
    ym2610: Ym2610,
    lc8951: Lc8951,
    cdrom: CdRom,
    input: InputState,
    config: NeoGeoCdConfig,
}

impl<M: M68kCore + Default, Z: Z80Core + Default> NeoGeoCd<M, Z> {
    /// Create a machine from a BIOS image and an optional disc.
    ///
    /// # Errors
    ///
    /// Returns an error if the BIOS image is missing, has the wrong size, or is not
    /// recognized.
    pub fn new(
        mut bios: Vec<u8>,
        disc: Option<CdRom>,
        config: NeoGeoCdConfig,
    ) -> Result<Self, LoadError> {
        if bios.is_empty() {
            return Err(LoadError::MissingBios);
        }
        if bios.len() != BIOS_LEN {
            return Err(LoadError::InvalidBiosSize { bios_len: bios.len() });
        }

        bios::auto_byte_swap(&mut bios);

        let bios_type = bios::identify(&bios);
        if bios_type.family == BiosFamily::Invalid {
            return Err(LoadError::InvalidBios);
        }
        log::info!("BIOS identified as: {}", bios_type.description());

        bios::patch(&mut bios, bios_type, config.cd_speed_hack);

        let mut memory = Memory::new();
        memory.rom.copy_from_slice(&bios);

        let mut machine = Self {
            state: MachineState::new(config.region, bios_type),
            m68k: M::default(),
            z80: Z::default(),
            timers: TimerWheel::new(),
            memory,
            video: Video::new(),
            audio: AudioBuffer::new(),
            ym2610: Ym2610::new(),
            lc8951: Lc8951::new(),
            cdrom: disc.unwrap_or_default(),
            input: InputState::new(),
            config,
        };
        machine.reset();

        Ok(machine)
    }

    /// Open a disc image and create the machine in one step.
    ///
    /// # Errors
    ///
    /// Propagates BIOS validation and disc image errors.
    pub fn with_disc_path<P: AsRef<std::path::Path>>(
        bios: Vec<u8>,
        disc_path: P,
        config: NeoGeoCdConfig,
    ) -> Result<Self, LoadError> {
        let disc = CdRom::open(disc_path)?;
        Self::new(bios, Some(disc), config)
    }

    pub fn reset(&mut self) {
        self.memory.reset();
        self.video.reset();
        self.cdrom.reset();
        self.lc8951.reset();
        self.input.reset();
        self.audio.reset();
        self.ym2610.reset();
        self.state.reset();

        self.timers.reset(self.state.bios_family().is_cdz());

        let (m68k, mut bus) = self.split_m68k();
        m68k.reset(&mut bus);
        self.z80.reset();
    }

    /// Swap in a different region without rebuilding the machine; forces a reset.
    pub fn set_region(&mut self, region: Region) {
        if self.state.nationality != region.nationality() {
            self.config.region = region;
            self.state.nationality = region.nationality();
            self.reset();
        }
    }

    #[must_use]
    pub fn bios_description(&self) -> String {
        self.state.bios_type.description()
    }

    #[must_use]
    pub fn frame_buffer(&self) -> &[u16] {
        self.video.frame_buffer().as_slice()
    }

    #[must_use]
    pub fn main_ram(&self) -> &[u8] {
        self.memory.ram.as_slice()
    }

    #[must_use]
    pub fn video_ram(&self) -> &[u16] {
        self.memory.video_ram.as_slice()
    }

    #[must_use]
    pub fn backup_ram(&self) -> &[u8] {
        self.memory.backup_ram.as_slice()
    }

    pub fn load_backup_ram(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(self.memory.backup_ram.len());
        self.memory.backup_ram[..len].copy_from_slice(&bytes[..len]);
    }

    /// Persist backup RAM through the frontend's save writer.
    ///
    /// # Errors
    ///
    /// Propagates the writer's error.
    pub fn persist_backup_ram<S: SaveWriter>(&self, save_writer: &mut S) -> Result<(), S::Err> {
        save_writer.persist_bytes("srm", self.backup_ram())
    }

    fn split_m68k(&mut self) -> (&mut M, MainBus<'_>) {
        let NeoGeoCd {
            m68k, memory, video, lc8951, cdrom, timers, input, audio, ym2610, state, ..
        } = self;
        (m68k, MainBus { memory, video, lc8951, cdrom, timers, input, audio, ym2610, state })
    }

    fn split_z80(&mut self) -> (&mut Z, AudioBus<'_>) {
        let NeoGeoCd { z80, memory, ym2610, timers, audio, state, .. } = self;
        (z80, AudioBus { memory, ym2610, timers, audio, state })
    }

    /// Run one displayed frame: advance the machine, then push video and audio to the
    /// frontend.
    ///
    /// # Errors
    ///
    /// Propagates renderer and audio output errors.
    pub fn run_one_frame<R: Renderer, A: AudioOutput>(
        &mut self,
        renderer: &mut R,
        audio_output: &mut A,
        inputs: &NeoGeoCdInputs,
    ) -> Result<(), NeoGeoCdError<R::Err, A::Err>> {
        self.input.set_inputs(inputs);

        self.state.irq1_enabled_this_frame = false;
        self.run_frame();

        // While the guest is streaming from CD (decoder IRQ armed every frame), run
        // extra unrendered frames to hide load times
        if self.config.skip_cd_loading {
            let mut extra_frames = 0;
            while self.state.irq1_enabled_this_frame && extra_frames < MAX_SKIP_FRAMES {
                self.state.irq1_enabled_this_frame = false;
                self.state.fast_forward = true;
                self.run_frame();
                extra_frames += 1;
            }
            self.state.fast_forward = false;
        }

        renderer.render_frame(self.frame_buffer()).map_err(NeoGeoCdError::Render)?;

        let samples: Vec<(i16, i16)> =
            self.audio.frame_samples().iter().map(|sample| (sample.left, sample.right)).collect();
        audio_output.push_samples(&samples).map_err(NeoGeoCdError::Audio)?;

        Ok(())
    }

    /// Advance the machine by one frame of master-clock time without touching the
    /// frontend.
    pub fn run_frame(&mut self) {
        self.state.remaining_cycles_this_frame += CYCLES_PER_FRAME;

        self.init_audio_frame();

        while self.state.remaining_cycles_this_frame > 0 {
            let slice = self.timers.time_slice().min(self.state.remaining_cycles_this_frame);

            self.state.end_timeslice = false;
            self.state.slice_m68k_master_cycles = 0;

            let elapsed = {
                let (m68k, mut bus) = self.split_m68k();
                let cycles_run = m68k.execute(&mut bus, master_to_m68k(slice) as u32);
                m68k_to_master(cycles_run as i32)
            };
            // A core that executed nothing still forfeits some master time, or the
            // frame loop would never terminate
            let elapsed = elapsed.max(1);

            self.state.m68k_cycles_this_frame += elapsed;

            // The Z80 runs second, for the same elapsed master time
            self.state.z80_time_slice += elapsed;
            if self.state.z80_time_slice > 0 {
                let z80_elapsed = if self.state.z80_disable {
                    self.state.z80_time_slice
                } else {
                    if std::mem::take(&mut self.state.z80_reset_pending) {
                        self.z80.reset();
                    }

                    self.state.slice_z80_master_cycles = 0;
                    let budget = master_to_z80(self.state.z80_time_slice);
                    let (z80, mut bus) = self.split_z80();
                    z80_to_master(z80.execute(&mut bus, budget as u32) as i32).max(1)
                };

                self.state.z80_cycles_this_frame += z80_elapsed;
                self.state.z80_time_slice -= z80_elapsed;
            }

            self.state.remaining_cycles_this_frame -= elapsed;

            let fired = self.timers.advance(elapsed);
            for id in fired {
                self.dispatch_timer(id);
            }
        }

        self.finalize_audio_frame();

        // Surplus carries into the next frame
        self.state.m68k_cycles_this_frame -= CYCLES_PER_FRAME;
        self.state.z80_cycles_this_frame -= CYCLES_PER_FRAME;
    }

    fn init_audio_frame(&mut self) {
        let has_cd_audio = self.cdrom.is_playing() && self.cdrom.is_audio();
        let samples = self.audio.init_frame(has_cd_audio);

        if has_cd_audio {
            let mut bytes = [0_u8; CD_BUFFER_LEN * 4];
            let byte_len = samples as usize * 4;
            self.cdrom.read_audio(&mut bytes[..byte_len]);
            self.audio.fill_cd_samples(&bytes[..byte_len]);
        }
    }

    fn finalize_audio_frame(&mut self) {
        let sample_count = self.audio.sample_count();
        if self.audio.write_pointer() < sample_count {
            let remaining = sample_count - self.audio.write_pointer();
            self.ym2610.update(remaining, &self.memory.pcm_ram, &mut self.audio);
        }

        self.audio.mix();
    }

    fn set_interrupt(&mut self, bit: u32) {
        self.state.pending_interrupts |= bit;
        update_interrupts(&mut self.state);
    }

    pub(crate) fn dispatch_timer(&mut self, id: TimerId) {
        match id {
            TimerId::Watchdog => {
                log::warn!("Watchdog timer triggered; machine reset");
                let (m68k, mut bus) = self.split_m68k();
                m68k.reset(&mut bus);
            }
            TimerId::Vbl => {
                if self.state.is_vbl_enabled() {
                    self.set_interrupt(interrupt::VBLANK);
                }

                if self.video.auto_animation_frame_counter == 0 {
                    self.video.auto_animation_frame_counter = self.video.auto_animation_speed;
                    self.video.auto_animation_counter =
                        self.video.auto_animation_counter.wrapping_add(1);
                } else {
                    self.video.auto_animation_frame_counter -= 1;
                }

                self.arm_relative(TimerId::Vbl, pixel_to_master(SCREEN_WIDTH * SCREEN_HEIGHT));
            }
            TimerId::Hbl => {
                if self.video.hirq_control & HIRQ_CTRL_ENABLE != 0 && self.state.is_hbl_enabled() {
                    self.set_interrupt(interrupt::RASTER);
                }

                // Neo Drift Out programs reload = 0xFFFFFFFF with auto-repeat; the +1
                // wrap must not re-arm the timer
                if self.video.hirq_control & HIRQ_CTRL_AUTOREPEAT != 0
                    && self.video.hirq_register != 0xFFFF_FFFF
                {
                    self.arm_relative(TimerId::Hbl, pixel_delay(self.video.hirq_register + 1));
                }
            }
            TimerId::VblReload => {
                if self.video.hirq_control & HIRQ_CTRL_VBLANK_LOAD != 0 {
                    let own_delay = self.timers.timer(TimerId::VblReload).delay();
                    let delay = own_delay + pixel_delay(self.video.hirq_register.wrapping_add(1));
                    self.arm(TimerId::Hbl, delay);
                }

                self.arm_relative(
                    TimerId::VblReload,
                    pixel_to_master(SCREEN_WIDTH * SCREEN_HEIGHT),
                );
            }
            TimerId::Drawline => {
                let scanline = self.state.screen_y();

                if (crate::timer::ACTIVE_AREA_TOP..crate::timer::ACTIVE_AREA_BOTTOM)
                    .contains(&scanline)
                {
                    if !self.state.fast_forward {
                        self.draw_scanline(scanline as u32);
                    }

                    self.arm_relative(TimerId::Drawline, pixel_to_master(SCREEN_WIDTH));
                } else if scanline == crate::timer::ACTIVE_AREA_BOTTOM {
                    let blank_lines = SCREEN_HEIGHT - crate::timer::ACTIVE_AREA_BOTTOM
                        + crate::timer::ACTIVE_AREA_TOP;
                    self.arm_relative(
                        TimerId::Drawline,
                        pixel_to_master(blank_lines * SCREEN_WIDTH),
                    );
                }
            }
            TimerId::Cdrom64Hz => {
                self.arm_relative(TimerId::Cdrom64Hz, CDROM_64HZ_DELAY);

                if self.cdrom.is_playing() {
                    // While playing, the communication IRQ comes from the 75 Hz timer
                    return;
                }

                if self.state.cd_comm_irq_enabled() {
                    self.set_interrupt(interrupt::CD_COMM);
                }
            }
            TimerId::Cdrom75Hz => {
                let delay = if self.state.bios_family().is_cdz() {
                    CDROM_75HZ_DELAY / 2
                } else {
                    CDROM_75HZ_DELAY
                };
                self.arm_relative(TimerId::Cdrom75Hz, delay);

                if !self.cdrom.is_playing() {
                    return;
                }

                // Update head position and decode the sector into the chip buffer
                self.lc8951.sector_decoded(&mut self.cdrom);

                if self.cdrom.is_data()
                    && self.state.cd_decoder_irq_enabled()
                    && self.lc8951.ifctrl & crate::lc8951::DECIEN != 0
                    && self.lc8951.ifstat & crate::lc8951::DECI == 0
                {
                    self.set_interrupt(interrupt::CD_DECODER);
                }

                if self.cdrom.is_data() {
                    self.state.cdz_irq1_divisor = 0;
                } else if self.state.bios_family().is_cdz() {
                    // On CDZ the head advances every other tick for audio tracks
                    self.state.cdz_irq1_divisor ^= 1;
                }

                if self.state.cdz_irq1_divisor == 0 {
                    self.cdrom.advance_position();
                }

                if self.state.cd_comm_irq_enabled() {
                    self.set_interrupt(interrupt::CD_COMM);
                }
            }
            TimerId::AudioCommand => {
                self.state.audio_command = self.timers.timer(TimerId::AudioCommand).user_data();

                if !self.state.z80_nmi_disable {
                    self.state.z80_nmi_pending = true;
                }
            }
            TimerId::Ym2610A | TimerId::Ym2610B => {
                catch_up_ym2610(
                    &mut self.ym2610,
                    &mut self.audio,
                    &self.memory.pcm_ram,
                    self.state.z80_cycles_this_frame,
                );

                self.ym2610.timer_over(id, &mut self.timers);
                self.state.z80_irq_line = self.ym2610.irq_line();
            }
        }
    }

    fn draw_scanline(&mut self, scanline: u32) {
        if !self.video.video_enable {
            self.video.draw_black_line(scanline);
            return;
        }

        self.video.draw_empty_line(scanline);

        if !self.video.spr_disable {
            // The scratch area for the sprite list alternates by scanline parity
            let list_offset = if scanline & 1 != 0 { 0x8680 } else { 0x8600 };
            let count =
                self.video.create_sprite_list(scanline, &mut self.memory.video_ram, list_offset);
            self.video.draw_sprites(
                scanline,
                &self.memory.video_ram,
                &self.memory.spr_ram,
                &self.memory.y_zoom_rom,
                list_offset,
                count,
            );
        }

        if !self.video.fix_disable {
            self.video.draw_fix(scanline, &self.memory.fix_ram, self.memory.video_ram.as_slice());
        }
    }

    fn arm(&mut self, id: TimerId, delay: i32) {
        if self.timers.timer_mut(id).arm(delay) {
            self.dispatch_timer(id);
        }
    }

    fn arm_relative(&mut self, id: TimerId, delay: i32) {
        if self.timers.timer_mut(id).arm_relative(delay) {
            self.dispatch_timer(id);
        }
    }

    /// Serialize the whole machine state.
    ///
    /// # Errors
    ///
    /// Propagates serialization errors.
    pub fn save_state(&self) -> Result<Vec<u8>, EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Restore a state produced by [`Self::save_state`]. The loaded disc stays
    /// attached; the palette shadow and fix usage map are rebuilt, and the CD is
    /// re-seeked to the restored position.
    ///
    /// # Errors
    ///
    /// Returns an error (leaving the machine untouched) if the blob is truncated or
    /// malformed.
    pub fn load_state(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        let (mut loaded, _): (Self, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard())?;

        loaded.cdrom.take_disc_from(&mut self.cdrom);
        *self = loaded;
        self.post_load();

        Ok(())
    }

    fn post_load(&mut self) {
        self.video.convert_palette(&self.memory.palette_ram);
        self.video.update_fix_usage_map(&self.memory.fix_ram);
    }

    #[cfg(test)]
    pub(crate) fn test_bus(&mut self) -> MainBus<'_> {
        self.split_m68k().1
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &MachineState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{M68kBus, Z80Bus};
    use crate::lc8951::{self, CdStatus};
    use std::fs;
    use std::path::PathBuf;

    #[derive(Debug, Default, Encode, Decode)]
    struct NopCore;

    impl M68kCore for NopCore {
        fn execute<B: M68kBus>(&mut self, bus: &mut B, cycles: u32) -> u32 {
            bus.sync(0);
            cycles
        }

        fn reset<B: M68kBus>(&mut self, _bus: &mut B) {}
    }

    impl Z80Core for NopCore {
        fn execute<B: Z80Bus>(&mut self, bus: &mut B, cycles: u32) -> u32 {
            bus.sync(0);
            cycles
        }

        fn reset(&mut self) {}
    }

    type TestMachine = NeoGeoCd<NopCore, NopCore>;

    fn test_bios() -> Vec<u8> {
        let mut bios = vec![0_u8; BIOS_LEN];
        // Validity pattern + CDZ family marker
        bios[0..4].copy_from_slice(&[0x00, 0x10, 0xF3, 0x00]);
        bios[0x6C..0x70].copy_from_slice(&[0x00, 0xC0, 0xA3, 0xE8]);
        bios
    }

    fn test_machine() -> TestMachine {
        NeoGeoCd::new(test_bios(), None, NeoGeoCdConfig::default()).unwrap()
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("neocd-api-test-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    // A single data track starting at sector 150 (2-second pregap)
    fn test_disc(tag: &str) -> CdRom {
        let dir = temp_dir(tag);
        fs::write(dir.join("game.bin"), vec![0_u8; 2048 * 100]).unwrap();
        fs::write(
            dir.join("game.cue"),
            "FILE \"game.bin\" BINARY\n  TRACK 01 MODE1/2048\n    PREGAP 00:02:00\n    INDEX 01 00:00:00\n",
        )
        .unwrap();

        CdRom::open(dir.join("game.cue")).unwrap()
    }

    #[test]
    fn rejects_invalid_bios() {
        assert!(matches!(
            TestMachine::new(vec![], None, NeoGeoCdConfig::default()),
            Err(LoadError::MissingBios)
        ));
        assert!(matches!(
            TestMachine::new(vec![0; 123], None, NeoGeoCdConfig::default()),
            Err(LoadError::InvalidBiosSize { bios_len: 123 })
        ));
        assert!(matches!(
            TestMachine::new(vec![0; BIOS_LEN], None, NeoGeoCdConfig::default()),
            Err(LoadError::InvalidBios)
        ));
    }

    #[test]
    fn scheduler_balances_master_cycles_across_frames() {
        let mut machine = test_machine();

        for _ in 0..5 {
            machine.run_frame();
            // After the frame the carry is the (non-positive) overshoot
            assert!(machine.state().remaining_cycles_this_frame <= 0);
            assert!(machine.state().remaining_cycles_this_frame > -CYCLES_PER_FRAME);
        }
    }

    #[test_log::test]
    fn boot_and_idle_paints_background_color() {
        let mut machine = test_machine();

        {
            let mut bus = machine.test_bus();
            // Background color: palette word 4095
            bus.write_word(0x401FFE, 0x7FFF);
            // Enable video output
            bus.write_byte(0xFF0119, 0x01);
        }

        for _ in 0..3 {
            machine.run_frame();
        }

        assert_eq!(machine.cdrom.position(), 0);
        let background = machine.video.palette_shadow(4095);
        assert_ne!(background, 0);
        assert!(machine.frame_buffer().iter().all(|&px| px == background));
    }

    #[test]
    fn dma_pattern_fill_writes_only_the_programmed_range() {
        let mut machine = test_machine();
        let mut bus = machine.test_bus();

        bus.write_word(0xFF0064, 0x0010); // destination high: 0x100000
        bus.write_word(0xFF0066, 0x0000);
        bus.write_word(0xFF0070, 0x0000); // length: 0x100 words
        bus.write_word(0xFF0072, 0x0100);
        bus.write_word(0xFF006C, 0xAAAA); // pattern
        bus.write_word(0xFF007E, 0xFFCD); // opcode: pattern fill
        bus.write_byte(0xFF0061, 0x40);

        for address in (0x100000..0x100200).step_by(2) {
            assert_eq!(bus.read_word(address), 0xAAAA);
        }
        assert_eq!(bus.read_word(0x0FFFFE), 0x0000);
        assert_eq!(bus.read_word(0x100200), 0x0000);
    }

    #[test]
    fn dma_copy_from_cd_clamps_length_and_fixes_shadow() {
        let mut machine = test_machine();
        let mut bus = machine.test_bus();

        bus.write_word(0xFF0064, 0x0010);
        bus.write_word(0xFF0066, 0x0000);
        bus.write_word(0xFF0070, 0x0002); // length 0x20000: far too long
        bus.write_word(0xFF0072, 0x0000);
        bus.write_word(0xFF007E, 0xFFC5);
        bus.write_byte(0xFF0061, 0x40);

        assert_eq!(bus.memory.dma_length, 0x400);
        let shadow = u32::from_be_bytes([
            bus.memory.ram[0x10FEFC],
            bus.memory.ram[0x10FEFD],
            bus.memory.ram[0x10FEFE],
            bus.memory.ram[0x10FEFF],
        ]);
        assert_eq!(shadow, 0x800);
    }

    #[test_log::test]
    fn play_command_starts_the_disc_and_updates_head_registers() {
        let mut machine = TestMachine::new(
            test_bios(),
            Some(test_disc("play")),
            NeoGeoCdConfig::default(),
        )
        .unwrap();

        {
            let mut bus = machine.test_bus();

            // Enable the sector decoder so the 75 Hz callback loads head registers
            bus.write_byte(0xFF0101, 0x0A); // select CTRL0
            bus.write_byte(0xFF0103, lc8951::DECEN);

            // Send "Play 00:00:02" as 10 nibbles with a valid checksum
            let mut packet = [0x30, 0x00, 0x00, 0x02, 0x00];
            lc8951::set_packet_checksum(&mut packet);
            for i in 0..10 {
                let byte = packet[i / 2];
                let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0F };
                bus.write_byte(0xFF0163, nibble);
                bus.write_byte(0xFF0165, 0x01);
            }

            assert_eq!(bus.lc8951.status, CdStatus::Playing);
            assert!(bus.cdrom.is_playing());

            // Walk the response nibbles: status | 0x02, then track number 1 in BCD
            bus.write_byte(0xFF0165, 0x02);
            assert_eq!(bus.read_byte(0xFF0161) & 0x0F, 0x01);
            bus.write_byte(0xFF0165, 0x02);
            assert_eq!(bus.read_byte(0xFF0161) & 0x0F, 0x02);
            bus.write_byte(0xFF0165, 0x02);
            assert_eq!(bus.read_byte(0xFF0161) & 0x0F, 0x00);
            bus.write_byte(0xFF0165, 0x02);
            assert_eq!(bus.read_byte(0xFF0161) & 0x0F, 0x01);
        }

        machine.dispatch_timer(TimerId::Cdrom75Hz);

        // HEAD1/HEAD2 now hold the commanded MSF (00:00:02)
        let mut bus = machine.test_bus();
        bus.write_byte(0xFF0101, 0x05); // select HEAD1
        assert_eq!(bus.read_byte(0xFF0103), 0x00);
        assert_eq!(bus.read_byte(0xFF0103), 0x02);
    }

    #[test]
    fn hirq_auto_repeat_fires_once_per_reload_period() {
        let mut machine = test_machine();

        {
            let mut bus = machine.test_bus();
            // Raster IRQs enabled in the interrupt mask
            bus.write_word(0xFF0004, 0x730);
            // Reload = 99, control = Enable | AutoRepeat | Relative (arms the timer)
            bus.write_word(0x3C0006, 0x00B0);
            bus.write_word(0x3C0008, 0x0000);
            bus.write_word(0x3C000A, 0x0063);
        }

        let mut fires = 0;
        let mut remaining = CYCLES_PER_FRAME;
        while remaining > 0 {
            let slice = machine.timers.time_slice().min(remaining);
            remaining -= slice;
            let fired = machine.timers.advance(slice);
            for id in fired {
                machine.dispatch_timer(id);
                if id == TimerId::Hbl {
                    fires += 1;
                    assert_ne!(machine.state().pending_interrupts & interrupt::RASTER, 0);
                }
            }
        }

        assert_eq!(fires, CYCLES_PER_FRAME / pixel_to_master(100));
    }

    #[test]
    fn vector_alias_follows_switch_writes()     {
        let mut machine = test_machine();
        let mut bus = machine.test_bus();

        bus.memory.ram[0x40] = 0x11;
        bus.memory.rom[0x40] = 0x22;

        // Vectors map to ROM after reset
        assert_eq!(bus.read_byte(0x40), 0x22);

        bus.write_word(0x3A0012, 0);
        assert_eq!(bus.read_byte(0x40), 0x11);

        bus.write_word(0x3A0002, 0);
        assert_eq!(bus.read_byte(0x40), 0x22);
    }

    #[test]
    fn unmapped_access_raises_bus_error() {
        let mut machine = test_machine();
        let mut bus = machine.test_bus();

        assert!(!bus.take_bus_error());
        let _ = bus.read_word(0x500000);
        assert!(bus.take_bus_error());
        // The flag clears once taken
        assert!(!bus.take_bus_error());
    }

    #[test]
    fn audio_command_reaches_the_z80_after_one_timer_tick() {
        let mut machine = test_machine();

        {
            let mut bus = machine.test_bus();
            bus.write_word(0x320000, 0x4200);
            assert!(bus.state.end_timeslice);
        }

        assert_eq!(machine.state().audio_command, 0);

        let fired = machine.timers.advance(1);
        for id in fired {
            machine.dispatch_timer(id);
        }
        assert_eq!(machine.state().audio_command, 0x42);
    }

    #[test]
    fn savestate_round_trips_bit_identically() {
        let mut machine = test_machine();

        {
            let mut bus = machine.test_bus();
            bus.write_word(0x100000, 0xBEEF);
            bus.write_word(0x401FFE, 0x1234);
            bus.write_word(0x3C0006, 0x00B0);
        }
        machine.run_frame();

        let saved = machine.save_state().unwrap();

        let mut restored = test_machine();
        restored.load_state(&saved).unwrap();

        assert_eq!(restored.save_state().unwrap(), saved);

        // Derived video state was rebuilt from the loaded palette RAM
        let mut expected = test_machine();
        {
            let mut bus = expected.test_bus();
            bus.write_word(0x401FFE, 0x1234);
        }
        assert_eq!(restored.video.palette_shadow(4095), expected.video.palette_shadow(4095));
    }

    #[test]
    fn truncated_savestate_is_rejected_without_corrupting_the_machine() {
        let mut machine = test_machine();
        let saved = machine.save_state().unwrap();

        assert!(machine.load_state(&saved[..saved.len() / 2]).is_err());

        // The machine still runs normally
        machine.run_frame();
    }

    #[test]
    fn watchdog_resets_only_when_enabled() {
        let mut machine = test_machine();

        // Enable the watchdog, then let it expire
        {
            let mut bus = machine.test_bus();
            bus.write_byte(0xFF016F, 0x00);
        }
        assert!(machine.timers.timer(TimerId::Watchdog).is_active());

        // A controller write reloads the delay
        {
            let mut bus = machine.test_bus();
            let before = bus.timers.timer(TimerId::Watchdog).delay();
            bus.timers.timer_mut(TimerId::Watchdog).advance(before / 2);
            bus.write_word(0x300000, 0);
            assert_eq!(
                bus.timers.timer(TimerId::Watchdog).delay(),
                crate::timer::WATCHDOG_DELAY
            );
        }

        // Disabling stops the countdown
        {
            let mut bus = machine.test_bus();
            bus.write_byte(0xFF016F, 0x01);
        }
        assert!(!machine.timers.timer(TimerId::Watchdog).is_active());
    }
}
