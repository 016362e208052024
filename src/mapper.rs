/*
Copyright 2025 Connor Nolan

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Bidirectional mapping between a ROM file offset and a 24-bit CPU address
//! under a cartridge memory map (spec.md §4.5). The only implemented layout
//! is the 32KB-bank "LoROM" map; anything else is declared unimplemented and
//! must fail explicitly, per spec.md §1's Non-goals and §7's error table.

use crate::errors::{Error, Result};

const BANK_WINDOW: u32 = 0x8000;
const BANK_BASE: u32 = 0x80;

/// Which cartridge layout a [`crate::context::BuildContext`] was built
/// against. `LoRom` is the only implemented variant; `Other` exists purely
/// so selecting an unsupported mode is representable and fails explicitly
/// rather than being unconstructible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingMode {
    LoRom,
    Other(&'static str),
}

/// Bidirectional ROM-offset/CPU-address translation for one mapping mode.
pub trait AddressMapper {
    fn rom_offset_to_cpu_addr(&self, offset: u32) -> Result<u32>;
    fn cpu_addr_to_rom_offset(&self, addr: u32) -> Result<u32>;
    /// Fills `out` with every bank that aliases the same byte as `addr`,
    /// excluding `addr`'s own bank.
    fn enumerate_mirrors(&self, addr: u32, out: &mut Vec<u32>) -> Result<()>;
}

pub fn mapper_for(mode: MappingMode) -> Result<LoRomMapper> {
    match mode {
        MappingMode::LoRom => Ok(LoRomMapper),
        MappingMode::Other(name) => Err(Error::UnimplementedMapping(name)),
    }
}

/// The 32KB-bank cartridge layout described in spec.md §4.5.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoRomMapper;

impl AddressMapper for LoRomMapper {
    fn rom_offset_to_cpu_addr(&self, offset: u32) -> Result<u32> {
        let bank = offset / BANK_WINDOW + BANK_BASE;
        let addr = offset % BANK_WINDOW + BANK_WINDOW;
        Ok((bank << 16) | addr)
    }

    fn cpu_addr_to_rom_offset(&self, addr: u32) -> Result<u32> {
        let bank = (addr >> 16) & 0xFF;
        let low = addr & 0xFFFF;
        Ok((bank - BANK_BASE) * BANK_WINDOW + (low - BANK_WINDOW))
    }

    fn enumerate_mirrors(&self, addr: u32, out: &mut Vec<u32>) -> Result<()> {
        out.clear();
        let bank = (addr >> 16) & 0xFF;
        let low = addr & 0xFFFF;

        if (0x2000..=0x5FFF).contains(&low) {
            // I/O region: aliased across banks 0x00-0x3F and 0x80-0xBF.
            for b in 0x00..=0x3F_u32 {
                if b != bank {
                    out.push((b << 16) | low);
                }
            }
            for b in 0x80..=0xBF_u32 {
                if b != bank {
                    out.push((b << 16) | low);
                }
            }
        } else if low >= 0x8000 {
            // ROM region: the resolved Open Question from spec.md §9 — the
            // intended predicate is `addr >= 0x8000`, not the transcribed
            // `addr >= 0x0000 and addr >= 0x8000` (always-true left clause).
            // Low and high bank halves (0x00-0x7D and 0x80-0xFF) alias the
            // same ROM byte at the same offset within the 32KB window.
            let low_half = bank & 0x7F;
            let high_half = low_half | 0x80;
            if bank != low_half {
                out.push((low_half << 16) | low);
            }
            if bank != high_half {
                out.push((high_half << 16) | low);
            }
        } else {
            // Low-RAM region 0x0000-0x1FFF: mirrored across the same
            // 0x80-wide band as the I/O region, pinned to bank 0x7E.
            if bank != 0x7E {
                out.push((0x7E << 16) | low);
            }
            for b in 0x00..=0x3F_u32 {
                if b != bank {
                    out.push((b << 16) | low);
                }
            }
            for b in 0x80..=0xBF_u32 {
                if b != bank {
                    out.push((b << 16) | low);
                }
            }
        }

        Ok(())
    }
}
