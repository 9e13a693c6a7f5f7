//! The seven-mode DMA engine. All transfers resolve their endpoints through the region
//! table, so DMA sees the same bank-switched window and mapped registers the CPU does.

use crate::lc8951::DTBSY;
use crate::memory::{MainBus, Region, RegionKind, MEMORY_REGIONS};

// Copy-from-CD transfers longer than one sector get clamped, and the DMA length shadow
// the BIOS keeps in work RAM is rewritten to match. Art of Fighting issues 0x20000-word
// transfers from the CDZ BIOS; what real hardware does here has never been traced.
const CD_LENGTH_SHADOW_ADDRESS: usize = 0x10FEFC;
const CD_MAX_LENGTH: u32 = 0x400;

impl MainBus<'_> {
    /// Execute the DMA program selected by `dma_config[0]`.
    pub(crate) fn run_dma(&mut self) {
        match self.memory.dma_config[0] {
            0xFE3D | 0xFE6D => self.dma_copy(),
            // 0xFF89 is used by the front loader BIOS
            0xFFC5 | 0xFF89 => self.dma_copy_cdrom(),
            0xFEF5 => self.dma_fill(),
            0xFFCD | 0xFFDD => self.dma_pattern(),
            // 0xF2DD is used by the front loader BIOS
            0xE2DD | 0xF2DD => self.dma_copy_odd_bytes(),
            0xFC2D => self.dma_copy_cdrom_odd_bytes(),
            0xCFFD => self.dma_fill_odd_bytes(),
            _ => {
                log::error!(
                    "DMA transfer with unknown configuration: {:04X?} source={:X} dest={:X} length={:X} pattern={:X}",
                    self.memory.dma_config,
                    self.memory.dma_source,
                    self.memory.dma_destination,
                    self.memory.dma_length,
                    self.memory.dma_pattern,
                );
            }
        }
    }

    fn find_region(address: u32) -> Option<&'static Region> {
        let address = address & 0xFF_FFFF;
        MEMORY_REGIONS
            .iter()
            .find(|region| (region.start..=region.end).contains(&address))
    }

    fn fetch_next_word(&mut self, region: &Region, offset: &mut u32) -> u16 {
        let value = if region.read_direct() {
            self.memory.read_word_direct(region.kind, *offset & region.mask)
        } else if region.read_mapped() {
            self.mapped_read_word(region.kind, *offset & region.mask)
        } else {
            0xFFFF
        };

        *offset += 2;
        value
    }

    fn write_next_word(&mut self, region: &Region, offset: &mut u32, data: u16) {
        if region.write_direct() {
            self.memory.write_word_direct(region.kind, *offset & region.mask, data);
        } else if region.write_mapped() {
            self.mapped_write_word(region.kind, *offset & region.mask, data);
        }

        *offset += 2;
    }

    // Source and destination registers are swapped by convention for the plain copies
    fn dma_copy(&mut self) {
        let (Some(source_region), Some(destination_region)) = (
            Self::find_region(self.memory.dma_destination),
            Self::find_region(self.memory.dma_source),
        ) else {
            log::error!(
                "DMA copy with unmapped endpoint: source={:X} dest={:X}",
                self.memory.dma_destination,
                self.memory.dma_source,
            );
            return;
        };

        let mut source_offset = self.memory.dma_destination & source_region.mask;
        let mut destination_offset = self.memory.dma_source & destination_region.mask;

        for _ in 0..self.memory.dma_length {
            let data = self.fetch_next_word(source_region, &mut source_offset);
            self.write_next_word(destination_region, &mut destination_offset, data);
        }
    }

    fn dma_copy_odd_bytes(&mut self) {
        let (Some(source_region), Some(destination_region)) = (
            Self::find_region(self.memory.dma_destination),
            Self::find_region(self.memory.dma_source),
        ) else {
            log::error!(
                "DMA odd-byte copy with unmapped endpoint: source={:X} dest={:X}",
                self.memory.dma_destination,
                self.memory.dma_source,
            );
            return;
        };

        let mut source_offset = self.memory.dma_destination & source_region.mask;
        let mut destination_offset = self.memory.dma_source & destination_region.mask;

        for _ in 0..self.memory.dma_length {
            let data = self.fetch_next_word(source_region, &mut source_offset);
            self.write_next_word(destination_region, &mut destination_offset, data.swap_bytes());
            self.write_next_word(destination_region, &mut destination_offset, data);
        }
    }

    fn clamp_cd_length(&mut self) {
        if self.memory.dma_length > CD_MAX_LENGTH {
            log::warn!("DMA transfer from CD buffer with length > 0x400, clamping");

            // Correct the guest's DMA length shadow as well
            self.memory.ram[CD_LENGTH_SHADOW_ADDRESS..CD_LENGTH_SHADOW_ADDRESS + 4]
                .copy_from_slice(&0x800_u32.to_be_bytes());
            self.memory.dma_length = CD_MAX_LENGTH;
        } else if self.memory.dma_length < CD_MAX_LENGTH {
            log::debug!("DMA transfer from CD buffer with length {:X}", self.memory.dma_length);
        }
    }

    fn check_cd_transfer_state(&self) {
        if self.lc8951.ifstat & DTBSY != 0 {
            log::warn!("DMA transfer from CD buffer but the LC8951 side is not started");
        }

        if self.lc8951.dbc() != 0x7FF {
            log::warn!("DMA transfer from CD buffer but the LC8951 length is not 0x7FF");
        }
    }

    fn dma_copy_cdrom(&mut self) {
        let Some(region) = Self::find_region(self.memory.dma_destination) else {
            log::error!(
                "DMA copy from CD buffer to unmapped destination {:X}",
                self.memory.dma_destination
            );
            return;
        };

        self.clamp_cd_length();
        self.check_cd_transfer_state();

        let mut offset = self.memory.dma_destination & region.mask;
        for i in 0..self.memory.dma_length as usize {
            let data = u16::from_be_bytes([
                self.lc8951.sector_buffer()[2 * i],
                self.lc8951.sector_buffer()[2 * i + 1],
            ]);
            self.write_next_word(region, &mut offset, data);
        }

        self.lc8951.end_transfer();
    }

    fn dma_copy_cdrom_odd_bytes(&mut self) {
        let Some(region) = Self::find_region(self.memory.dma_destination) else {
            log::error!(
                "DMA odd-byte copy from CD buffer to unmapped destination {:X}",
                self.memory.dma_destination
            );
            return;
        };

        self.clamp_cd_length();
        self.check_cd_transfer_state();

        let mut offset = self.memory.dma_destination & region.mask;
        for i in 0..self.memory.dma_length as usize {
            let data = u16::from_be_bytes([
                self.lc8951.sector_buffer()[2 * i],
                self.lc8951.sector_buffer()[2 * i + 1],
            ]);
            self.write_next_word(region, &mut offset, data >> 8);
            self.write_next_word(region, &mut offset, data);
        }

        self.lc8951.end_transfer();
    }

    fn dma_pattern(&mut self) {
        let Some(region) = Self::find_region(self.memory.dma_destination) else {
            log::error!("DMA pattern fill to unmapped destination {:X}", self.memory.dma_destination);
            return;
        };

        let mut offset = self.memory.dma_destination & region.mask;
        let pattern = self.memory.dma_pattern;
        for _ in 0..self.memory.dma_length {
            self.write_next_word(region, &mut offset, pattern);
        }
    }

    fn dma_fill(&mut self) {
        let Some(region) = Self::find_region(self.memory.dma_destination) else {
            log::error!("DMA fill to unmapped destination {:X}", self.memory.dma_destination);
            return;
        };

        let mut address = self.memory.dma_destination;
        let mut offset = self.memory.dma_destination & region.mask;
        for _ in 0..self.memory.dma_length {
            self.write_next_word(region, &mut offset, (address >> 16) as u16);
            self.write_next_word(region, &mut offset, address as u16);
            address = address.wrapping_add(4);
        }
    }

    fn dma_fill_odd_bytes(&mut self) {
        let Some(region) = Self::find_region(self.memory.dma_destination) else {
            log::error!(
                "DMA odd-byte fill to unmapped destination {:X}",
                self.memory.dma_destination
            );
            return;
        };

        let mut address = self.memory.dma_destination;
        let mut offset = self.memory.dma_destination & region.mask;
        for _ in 0..self.memory.dma_length {
            self.write_next_word(region, &mut offset, (address >> 24) as u16);
            self.write_next_word(region, &mut offset, (address >> 16) as u16);
            self.write_next_word(region, &mut offset, (address >> 8) as u16);
            self.write_next_word(region, &mut offset, address as u16);
            address = address.wrapping_add(8);
        }
    }
}
