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

//! A code-generation kernel for the 65C816: a programmatic instruction
//! builder, branch lowering, a relocation applier, a LoROM address mapper,
//! and debug-file emission. Host code builds a ROM image by constructing a
//! graph of [`symbol::FunctionSymbol`]/[`symbol::DataSymbol`] values, each
//! generating its own machine code into a [`builder::Builder`], and drives
//! the whole thing through a [`context::BuildContext`].

pub mod builder;
pub mod context;
pub mod debug;
pub mod errors;
pub mod instr;
pub mod io;
pub mod lowering;
pub mod mapper;
pub mod reloc;
pub mod registry;
pub mod symbol;

pub use builder::{Builder, JumpLongTarget, Label, PushValue, RegisterHandle};
pub use context::BuildContext;
pub use errors::{Error, Result};
pub use instr::{Instr, Reg, RegSize};
pub use mapper::MappingMode;
pub use reloc::{RelocKind, Relocation};
pub use symbol::{DataSymbol, FunctionSymbol, Symbol};

/// Convenience wrapper around [`BuildContext`] for the common case: one
/// entry point, any number of data symbols, laid out and linked into a
/// freshly-allocated ROM buffer of exactly the size needed.
pub fn build_rom(mode: MappingMode, entry_point: &FunctionSymbol, data: &[DataSymbol]) -> Result<Vec<u8>> {
    let mut ctx = BuildContext::new(mode)?;
    ctx.register_entry_point(entry_point)?;
    for ds in data {
        ctx.register_data(ds)?;
    }
    ctx.layout()?;

    let mut rom = vec![0u8; ctx.total_size() as usize];
    ctx.link_into(&mut rom)?;
    Ok(rom)
}
