//! The CD unit and machine control registers at $FF0000-$FF01FF

use crate::api::{interrupt, update_interrupts};
use crate::memory::{MainBus, AREA_FIX, AREA_PCM, AREA_SPR, AREA_Z80};
use neocd_common::num::U32Ext;

pub(crate) fn read_byte(bus: &mut MainBus<'_>, offset: u32) -> u8 {
    match offset {
        // Unknown registers
        0x0017 | 0x0167 => 0x00,

        // CDROM register file data
        0x0103 => bus.lc8951.read_register(),

        // CDROM communication: response packet nibble
        0x0161 => bus.lc8951.read_response_packet(),

        _ => {
            log::debug!("Byte read from unknown CD register {:06X}", 0xFF0000 + offset);
            0x00
        }
    }
}

pub(crate) fn read_word(bus: &mut MainBus<'_>, offset: u32) -> u16 {
    match offset {
        // The VBL interrupt mask must be readable; it is saved on the stack and
        // restored inside interrupt handlers
        0x0004 => bus.state.irq_mask2 as u16,

        // System config: 00ST00NN 00000000; S shows an eject button in the top
        // loader, N is the inverted nationality, T is the tray sense (inverted on CDZ)
        0x011C => {
            let nationality = ((!bus.state.nationality & 7) << 8) as u16;
            if bus.state.bios_family().is_cdz() {
                nationality
            } else {
                nationality | 0x1000
            }
        }

        // Current CD-DA sample taps, bit-reversed
        0x0188 => cd_audio_sample(bus, |sample| sample.left),
        0x018A => cd_audio_sample(bus, |sample| sample.right),

        _ => {
            log::debug!("Word read from unknown CD register {:06X}", 0xFF0000 + offset);
            0x0000
        }
    }
}

fn cd_audio_sample(
    bus: &mut MainBus<'_>,
    channel: impl FnOnce(crate::audio::Sample) -> i16,
) -> u16 {
    if !(bus.cdrom.is_playing() && bus.cdrom.is_audio()) {
        return 0;
    }

    let cycles = bus.state.m68k_cycles_this_frame + bus.state.slice_m68k_master_cycles;
    (channel(bus.audio.current_cd_sample(cycles)) as u16).reverse_bits()
}

pub(crate) fn write_byte(bus: &mut MainBus<'_>, offset: u32, data: u8) {
    match offset {
        // Unknown registers
        0x000D | 0x000E | 0x0011 | 0x0015 | 0x0017 | 0x0167 | 0x016D => {}

        // CDROM IRQ acknowledge: $20 clears the decoder interrupt (vector $54), $10
        // the communication interrupt (vector $58)
        0x000F => {
            if data & 0x20 != 0 {
                bus.state.pending_interrupts &= !interrupt::CD_DECODER;
            }
            if data & 0x10 != 0 {
                bus.state.pending_interrupts &= !interrupt::CD_COMM;
            }
            update_interrupts(bus.state);
        }

        // DMA control: $40 starts the programmed transfer, $00 clears the registers
        0x0061 => {
            if data == 0x40 {
                bus.run_dma();
            } else if data == 0 {
                bus.memory.reset_dma();
            }
        }

        0x0101 => bus.lc8951.set_register_pointer(data),
        0x0103 => bus.lc8951.write_register(data),

        // Bank-switched window area select (0=SPR, 1=PCM, 4=Z80, 5=FIX)
        0x0105 => {
            bus.memory.area_select = match data {
                0 => AREA_SPR,
                1 => AREA_PCM,
                4 => AREA_Z80,
                5 => AREA_FIX,
                _ => 0,
            };
        }

        0x0111 => bus.video.spr_disable = data != 0,
        0x0115 => bus.video.fix_disable = data != 0,
        0x0119 => bus.video.video_enable = data != 0,

        0x0121 => bus.memory.bus_request |= AREA_SPR,
        0x0123 => bus.memory.bus_request |= AREA_PCM,
        0x0127 => bus.memory.bus_request |= AREA_Z80,
        0x0129 => bus.memory.bus_request |= AREA_FIX,

        0x0141 => bus.memory.bus_request &= !AREA_SPR,
        0x0143 => bus.memory.bus_request &= !AREA_PCM,
        0x0147 => bus.memory.bus_request &= !AREA_Z80,
        0x0149 => {
            bus.memory.bus_request &= !AREA_FIX;
            bus.video.update_fix_usage_map(&bus.memory.fix_ram);
        }

        // CDROM communication: command packet nibble / access pointer
        0x0163 => bus.lc8951.write_command_packet(data),
        0x0165 => bus.lc8951.increase_packet_pointer(data, bus.cdrom),

        // Watchdog: $00 enable, anything else disable
        0x016F => bus.watchdog_control(data != 0),

        // CD communication reset (active low). While held low no communication IRQ
        // triggers; the decoder IRQ is unaffected
        0x0181 => {
            bus.state.cd_comm_enabled = data != 0;
            bus.lc8951.reset_packet_pointers();
        }

        // Z80: $00 holds the reset line, anything else releases it
        0x0183 => {
            if data == 0 {
                bus.state.z80_disable = true;
            } else {
                bus.state.z80_disable = false;
                bus.state.z80_reset_pending = true;
                bus.ym2610.reset();
            }
        }

        0x01A1 => bus.memory.spr_bank_select = data.into(),
        0x01A3 => bus.memory.pcm_bank_select = data.into(),

        _ => {
            log::debug!("Write to unknown CD register {:06X} = {data:02X}", 0xFF0000 + offset);
        }
    }
}

pub(crate) fn write_word(bus: &mut MainBus<'_>, offset: u32, data: u16) {
    match offset {
        // Unknown registers
        0x0006 | 0x0008 | 0x000A => {}

        // CD-ROM drive reset
        0x0000 => bus.cd_reset(),

        // CDROM interrupt mask: $500 gates the decoder IRQ, $050 the communication IRQ
        0x0002 => {
            bus.state.irq_mask1 = data.into();

            // Used to detect disc activity in the frame loop
            if bus.state.cd_decoder_irq_enabled() {
                bus.state.irq1_enabled_this_frame = true;
            }
        }

        // VBL/HBL interrupt mask. While loading, the BIOS masks the VBL IRQ with this
        // register; the VBL handler repoints the bank-switched window, so ignoring the
        // mask would corrupt Z80 RAM
        0x0004 => bus.state.irq_mask2 = data.into(),

        0x0064 => bus.memory.dma_destination.set_high_word(data),
        0x0066 => bus.memory.dma_destination.set_low_word(data),
        0x0068 => bus.memory.dma_source.set_high_word(data),
        0x006A => bus.memory.dma_source.set_low_word(data),
        0x006C => bus.memory.dma_pattern = data,
        0x0070 => bus.memory.dma_length.set_high_word(data),
        0x0072 => bus.memory.dma_length.set_low_word(data),

        0x007E | 0x0080 | 0x0082 | 0x0084 | 0x0086 | 0x0088 | 0x008A | 0x008C | 0x008E => {
            bus.memory.dma_config[((offset - 0x7E) / 2) as usize] = data;
        }

        _ => {
            log::debug!("Write to unknown CD register {:06X} = {data:04X}", 0xFF0000 + offset);
        }
    }
}
