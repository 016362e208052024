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

//! Debug file emission (spec.md §4.7, §6): a `SnesPrgRom:`-prefixed label
//! listing (the format Mesen-family debuggers read) and a CDLv2 ("Code/Data
//! Log") coverage file, the latter needing a CRC-32 variant that does not
//! match any published implementation's default parameters closely enough
//! to reuse a crate for it (see SPEC_FULL.md).

use crate::instr::{Instr, RegSize};
use crate::registry::Registry;
use crate::symbol::Symbol;

/// Builds the label file content (spec.md §4.7, §6): one line per
/// instruction, within a *named* function, that either defines a label
/// (only ever the function's own name, at its first instruction) or carries
/// captured comments. `SnesPrgRom:<hex byte offset>:<label>[:<comments>]`,
/// comments joined by a literal `\n` (backslash, n) rather than a real
/// newline — only the line itself ends in a real newline byte, per spec.md
/// §6's explicit clarification of the otherwise identically-rendered `\n` in
/// §4.7's line grammar.
pub fn build_label_file(registry: &Registry) -> String {
    let mut out = String::new();

    for resolved in registry.functions() {
        let Some(name) = resolved.name.as_deref() else { continue };
        let Some(func_offset) = resolved.rom_offset else { continue };

        for (i, meta) in resolved.metadata.iter().enumerate() {
            let label = if i == 0 { name } else { "" };
            if label.is_empty() && meta.comments.is_empty() {
                continue;
            }

            let abs_offset = func_offset + meta.byte_offset;
            out.push_str(&format!("SnesPrgRom:{abs_offset:x}:{label}"));
            if !meta.comments.is_empty() {
                out.push(':');
                out.push_str(&meta.comments.join("\\n"));
            }
            out.push('\n');
        }
    }

    out
}

bitflags::bitflags! {
    /// Per-byte coverage flags for one CDLv2 record (spec.md §4.7, §6). Bit
    /// positions follow §6's layout exactly; bits 6 (gsu) and 7 (cx4) are
    /// never set by this crate (no GSU/CX4 coprocessor support exists here)
    /// but are named for documentation parity with the format.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CoverageFlags: u8 {
        const CODE = 0x01;
        const DATA = 0x02;
        const JUMP_TARGET = 0x04;
        const SUB_ENTRY_POINT = 0x08;
        const INDEX_MODE_8 = 0x10;
        const MEMORY_MODE_8 = 0x20;
        const GSU = 0x40;
        const CX4 = 0x80;
    }
}

/// Builds one coverage byte per ROM byte (spec.md §4.7):
///
/// - every byte a function occupies is `CODE`, with `memory_mode_8`/
///   `index_mode_8` set for accumulator-/index-touching instructions
///   currently in 8-bit mode;
/// - every byte a data symbol occupies is `DATA`;
/// - for every relocation targeting a function, the *target* instruction
///   located by spec.md §4.7's "first instruction at or after the
///   relocation's offset" rule is marked `sub_entry_point` if the relocation
///   comes from a `jsr`, else `jump_target`.
pub fn build_coverage(registry: &Registry) -> Vec<CoverageFlags> {
    let mut out = vec![CoverageFlags::empty(); registry.total_size() as usize];

    for resolved in registry.functions() {
        let Some(func_offset) = resolved.rom_offset else { continue };
        for meta in &resolved.metadata {
            let mut flags = CoverageFlags::CODE;
            if meta.instr.touches_accumulator() && meta.a_size == RegSize::Bit8 {
                flags |= CoverageFlags::MEMORY_MODE_8;
            }
            if meta.instr.touches_index() && meta.xy_size == RegSize::Bit8 {
                flags |= CoverageFlags::INDEX_MODE_8;
            }
            let instr_len = meta.instr.size(meta.a_size, meta.xy_size) as usize;
            let start = func_offset as usize + meta.byte_offset as usize;
            for b in out.iter_mut().skip(start).take(instr_len) {
                *b |= flags;
            }
        }
    }

    for (ds, bytes, _name) in registry.data_symbols() {
        let Some(offset) = registry.data_rom_offset(ds) else { continue };
        let start = offset as usize;
        for b in out.iter_mut().skip(start).take(bytes.len()) {
            *b |= CoverageFlags::DATA;
        }
    }

    for resolved in registry.functions() {
        for meta in &resolved.metadata {
            let Some(reloc) = &meta.reloc else { continue };
            let Symbol::Function(target_fs) = &reloc.target else { continue };
            let Some(target) = registry.resolved_function(target_fs) else { continue };
            let Some(target_offset) = target.rom_offset else { continue };

            let Some(target_meta) = target
                .metadata
                .iter()
                .find(|m| m.byte_offset >= reloc.target_offset as u32)
            else {
                continue;
            };

            let flag = if matches!(meta.instr, Instr::Jsr(_)) {
                CoverageFlags::SUB_ENTRY_POINT
            } else {
                CoverageFlags::JUMP_TARGET
            };
            let instr_len = target_meta.instr.size(target_meta.a_size, target_meta.xy_size) as usize;
            let start = target_offset as usize + target_meta.byte_offset as usize;
            for b in out.iter_mut().skip(start).take(instr_len) {
                *b |= flag;
            }
        }
    }

    out
}

/// Serializes the coverage vector into a CDLv2 file: the literal 5-byte
/// magic `CDLv2`, the non-standard CRC-32 of the *full ROM* (spec.md §4.7:
/// "a little-endian CRC-32 of the full ROM"; §6 and Testable Property 6 both
/// pin the CRC input to the ROM, not the coverage-flag bytes), then one flag
/// byte per ROM byte.
pub fn format_cdl_file(rom: &[u8], coverage: &[CoverageFlags]) -> Vec<u8> {
    let raw: Vec<u8> = coverage.iter().map(|f| f.bits()).collect();
    let mut out = Vec::with_capacity(5 + 4 + raw.len());
    out.extend_from_slice(b"CDLv2");
    out.extend_from_slice(&crc32_variant(rom).to_le_bytes());
    out.extend_from_slice(&raw);
    out
}

/// The non-standard CRC-32 variant spec.md §4.7 requires for the CDLv2
/// checksum: polynomial 0x77073096 applied directly (not reflected), an
/// initial value of 0, and no input or output reflection and no final XOR.
/// This does not match the parameters any published CRC-32 crate exposes
/// (those default to the reflected "CRC-32/ISO-HDLC" variant), so it is
/// implemented directly rather than reached for as a dependency.
pub fn crc32_variant(data: &[u8]) -> u32 {
    const POLY: u32 = 0x77073096;
    let mut crc: u32 = 0;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ POLY;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::symbol::FunctionSymbol;

    #[test]
    fn crc32_variant_of_empty_input_is_zero() {
        assert_eq!(crc32_variant(&[]), 0);
    }

    #[test]
    fn crc32_variant_is_not_the_reflected_standard_variant() {
        // The standard reflected CRC-32 ("CRC-32/ISO-HDLC") of b"123456789"
        // is the well-known check value 0xCBF43926; this variant must not
        // produce it, confirming the non-reflected polynomial path is
        // actually being exercised.
        let check = crc32_variant(b"123456789");
        assert_ne!(check, 0xCBF43926);
    }

    #[test]
    fn cdl_file_starts_with_the_five_byte_magic() {
        let bytes = format_cdl_file(&[0xEA], &[CoverageFlags::CODE]);
        assert_eq!(&bytes[..5], b"CDLv2");
        assert_eq!(bytes.len(), 5 + 4 + 1);
    }

    #[test]
    fn cdl_file_crc_hashes_the_rom_not_the_coverage_bytes() {
        let rom = vec![0x11u8, 0x22, 0x33];
        let coverage = vec![CoverageFlags::CODE, CoverageFlags::DATA, CoverageFlags::empty()];
        let bytes = format_cdl_file(&rom, &coverage);
        let crc_field = u32::from_le_bytes(bytes[5..9].try_into().unwrap());
        assert_eq!(crc_field, crc32_variant(&rom));
        assert_ne!(crc_field, crc32_variant(&coverage.iter().map(|f| f.bits()).collect::<Vec<_>>()));
    }

    #[test]
    fn coverage_flags_mark_opcode_bytes_as_code() {
        let mut registry = Registry::new();
        let fs = FunctionSymbol::new(|b: &mut Builder| {
            b.emit(Instr::Nop)?;
            b.emit(Instr::Rts)
        });
        registry.register_function(&fs).unwrap();
        registry.layout().unwrap();

        let coverage = build_coverage(&registry);
        assert_eq!(coverage.len(), 2);
        assert!(coverage[0].contains(CoverageFlags::CODE));
        assert!(coverage[1].contains(CoverageFlags::CODE));
    }

    #[test]
    fn jsr_target_is_marked_sub_entry_point() {
        let helper = FunctionSymbol::named("helper", |b: &mut Builder| {
            b.emit(Instr::Nop)?;
            b.emit(Instr::Rts)
        });
        let helper_for_entry = helper.clone();
        let entry = FunctionSymbol::named("entry", move |b: &mut Builder| {
            b.call(&helper_for_entry)?;
            b.emit(Instr::Rts)
        });

        let mut registry = Registry::new();
        registry.register_function(&entry).unwrap();
        registry.layout().unwrap();

        let coverage = build_coverage(&registry);
        // entry: jsr (3 bytes) + rts (1 byte) = 4 bytes, then helper's nop.
        assert!(coverage[4].contains(CoverageFlags::SUB_ENTRY_POINT));
        assert!(!coverage[4].contains(CoverageFlags::JUMP_TARGET));
    }

    #[test]
    fn jml_symbol_target_is_marked_jump_target_not_sub_entry_point() {
        use crate::builder::JumpLongTarget;

        let other = FunctionSymbol::named("other", |b: &mut Builder| b.emit(Instr::Rts));
        let other_for_entry = other.clone();
        let entry = FunctionSymbol::named("entry", move |b: &mut Builder| {
            b.jump_long(JumpLongTarget::Symbol(Symbol::Function(other_for_entry.clone())))
        });

        let mut registry = Registry::new();
        registry.register_function(&entry).unwrap();
        registry.register_function(&other).unwrap();
        registry.layout().unwrap();

        let coverage = build_coverage(&registry);
        // entry is 4 bytes (jml); `other`'s rts starts right after.
        assert!(coverage[4].contains(CoverageFlags::JUMP_TARGET));
        assert!(!coverage[4].contains(CoverageFlags::SUB_ENTRY_POINT));
    }

    #[test]
    fn label_file_emits_function_name_at_offset_zero_and_comments_inline() {
        let fs = FunctionSymbol::named("entry", |b: &mut Builder| {
            b.note("first");
            b.emit(Instr::Nop)?;
            b.note("second");
            b.note("third");
            b.emit(Instr::Rts)
        });

        let mut registry = Registry::new();
        registry.register_function(&fs).unwrap();
        registry.layout().unwrap();

        let text = build_label_file(&registry);
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "SnesPrgRom:0:entry:first");
        assert_eq!(lines.next().unwrap(), "SnesPrgRom:1::second\\nthird");
        assert!(lines.next().is_none());
    }

    #[test]
    fn unnamed_functions_contribute_no_label_lines() {
        let fs = FunctionSymbol::new(|b: &mut Builder| {
            b.emit(Instr::Nop)?;
            b.emit(Instr::Rts)
        });

        let mut registry = Registry::new();
        registry.register_function(&fs).unwrap();
        registry.layout().unwrap();

        assert_eq!(build_label_file(&registry), "");
    }

    #[test]
    fn plain_instructions_with_no_label_or_comment_emit_no_line() {
        let fs = FunctionSymbol::named("entry", |b: &mut Builder| {
            b.emit(Instr::Nop)?;
            b.emit(Instr::Nop)?;
            b.emit(Instr::Rts)
        });

        let mut registry = Registry::new();
        registry.register_function(&fs).unwrap();
        registry.layout().unwrap();

        let text = build_label_file(&registry);
        assert_eq!(text.lines().count(), 1);
        assert_eq!(text.lines().next().unwrap(), "SnesPrgRom:0:entry");
    }
}
