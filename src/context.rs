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

//! The top-level driver (spec.md §2): registers entry points and data,
//! lays out the registry, links the result into a ROM buffer, and emits
//! debug files. Mirrors the shape of the teacher's `lib.rs::assemble()`
//! entry point, generalized from "parse a source file" to "register a
//! graph of function/data symbols".

use std::io::Write;

use crate::debug::{build_coverage, build_label_file, format_cdl_file};
use crate::errors::{Error, Result};
use crate::io::DebugFileSink;
use crate::mapper::{mapper_for, AddressMapper, MappingMode};
use crate::reloc::apply_relocations;
use crate::registry::Registry;
use crate::symbol::{DataSymbol, FunctionSymbol};

/// Orchestrates one ROM build end to end: registration, layout, linking,
/// and debug-file emission.
pub struct BuildContext {
    registry: Registry,
    mapper: Box<dyn AddressMapper>,
}

impl BuildContext {
    pub fn new(mode: MappingMode) -> Result<Self> {
        let mapper = mapper_for(mode)?;
        Ok(BuildContext {
            registry: Registry::new(),
            mapper: Box::new(mapper),
        })
    }

    /// Registers `fs` as a root of the call graph, generating it (and
    /// transitively everything it calls) if this is its first
    /// registration.
    pub fn register_entry_point(&mut self, fs: &FunctionSymbol) -> Result<()> {
        self.registry.register_function(fs)
    }

    pub fn register_data(&mut self, ds: &DataSymbol) -> Result<()> {
        self.registry.register_data(ds)
    }

    /// Assigns every registered function and data symbol a ROM offset.
    /// Must run before [`BuildContext::link_into`] or
    /// [`BuildContext::emit_debug_files`].
    pub fn layout(&mut self) -> Result<()> {
        self.registry.layout()
    }

    /// Writes every registered function's code and every data symbol's
    /// bytes into `rom` at their laid-out offsets, then patches every
    /// relocation.
    pub fn link_into(&self, rom: &mut [u8]) -> Result<()> {
        let needed = self.registry.total_size() as usize;
        if rom.len() < needed {
            return Err(Error::RomTooSmall {
                needed,
                actual: rom.len(),
            });
        }

        for resolved in self.registry.functions() {
            let offset = resolved.rom_offset.ok_or(Error::UnknownSymbol)? as usize;
            rom[offset..offset + resolved.code.len()].copy_from_slice(&resolved.code);
        }
        for (ds, bytes, _name) in self.registry.data_symbols() {
            let offset = self.registry.data_rom_offset(ds).ok_or(Error::UnknownSymbol)? as usize;
            rom[offset..offset + bytes.len()].copy_from_slice(bytes);
        }

        apply_relocations(rom, &self.registry, self.mapper.as_ref())
    }

    /// Emits the label file to `labels` and the CDLv2 coverage file (whose
    /// CRC-32 is computed over `rom`, per spec.md §4.7/§6) to `coverage`.
    /// `rom` must be the fully linked buffer [`BuildContext::link_into`]
    /// produced; this method does not re-run linking.
    pub fn emit_debug_files(&self, rom: &[u8], labels: &mut impl Write, coverage: &mut impl Write) -> Result<()> {
        labels
            .write_all(build_label_file(&self.registry).as_bytes())
            .map_err(|e| Error::Io(e.to_string()))?;

        let flags = build_coverage(&self.registry);
        coverage
            .write_all(&format_cdl_file(rom, &flags))
            .map_err(|e| Error::Io(e.to_string()))?;

        Ok(())
    }

    /// Convenience wrapper around [`BuildContext::emit_debug_files`] for
    /// hosts that prefer the named-artifact [`DebugFileSink`] abstraction
    /// (e.g. to capture writes in an in-memory mock during tests) over raw
    /// `Write` targets.
    pub fn emit_debug_files_to_sink(&self, rom: &[u8], sink: &mut dyn DebugFileSink) -> Result<()> {
        let mut labels = Vec::new();
        let mut coverage = Vec::new();
        self.emit_debug_files(rom, &mut labels, &mut coverage)?;
        sink.write_file("rom.lbl", &labels)?;
        sink.write_file("rom.cdl", &coverage)?;
        Ok(())
    }

    pub fn mapper(&self) -> &dyn AddressMapper {
        self.mapper.as_ref()
    }

    pub fn total_size(&self) -> u32 {
        self.registry.total_size()
    }
}
