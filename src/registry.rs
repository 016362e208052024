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

//! The symbol registry (spec.md §4.1): two insertion-ordered maps,
//! deduplicating functions and data by identity and assigning ROM offsets
//! once layout runs.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::builder::{Builder, InstrMeta};
use crate::errors::{Error, Result};
use crate::instr::{Reg, RegSize};
use crate::symbol::{DataSymbol, FunctionSymbol, Symbol};

/// A function, X or Y register considered as a value crossing a call
/// boundary (spec.md §3, "Calling convention").
pub type CallValue = Reg;

/// Entry/exit register sizes and input/output/clobber sets inferred for one
/// function (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallingConvention {
    pub start_a: RegSize,
    pub start_xy: RegSize,
    pub end_a: RegSize,
    pub end_xy: RegSize,
    pub inputs: Vec<CallValue>,
    pub outputs: Vec<CallValue>,
    pub clobbers: Vec<CallValue>,
}

impl Default for CallingConvention {
    fn default() -> Self {
        CallingConvention {
            start_a: RegSize::None,
            start_xy: RegSize::None,
            end_a: RegSize::None,
            end_xy: RegSize::None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            clobbers: Vec::new(),
        }
    }
}

/// A fully-generated function: its code, per-instruction metadata, inferred
/// calling convention, and (after layout) ROM offset (spec.md §3, "Resolved
/// function").
#[derive(Debug, Clone)]
pub struct ResolvedFunction {
    pub code: Vec<u8>,
    pub metadata: Vec<InstrMeta>,
    pub call_conv: CallingConvention,
    pub name: Option<String>,
    pub source_location: Option<(PathBuf, u32)>,
    pub rom_offset: Option<u32>,
}

/// A slot in the function registry. The `Pending` variant is the "bit on
/// each slot marks under construction" re-architecture the Design Notes
/// recommend, making re-entrant `call()` during generation detectable.
enum FunctionEntry {
    Pending,
    Resolved(ResolvedFunction),
}

struct DataEntry {
    bytes: Vec<u8>,
    name: Option<String>,
    rom_offset: Option<u32>,
}

/// Deduplicating registry of function and data symbols, preserving
/// insertion order for both (spec.md §4.1, §5 "Ordering").
#[derive(Default)]
pub struct Registry {
    function_index: HashMap<usize, usize>,
    function_slots: Vec<(FunctionSymbol, FunctionEntry)>,
    data_index: HashMap<usize, usize>,
    data_slots: Vec<(DataSymbol, DataEntry)>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Registers `fs`, generating it via a fresh [`Builder`] if this is its
    /// first registration. Idempotent: a second call returns immediately
    /// without invoking the generator again. Re-entering the same symbol
    /// while it is still generating is a circular dependency.
    pub fn register_function(&mut self, fs: &FunctionSymbol) -> Result<()> {
        let key = fs.id();
        if let Some(&idx) = self.function_index.get(&key) {
            return match &self.function_slots[idx].1 {
                FunctionEntry::Pending => Err(Error::CircularDependency),
                FunctionEntry::Resolved(_) => Ok(()),
            };
        }

        let idx = self.function_slots.len();
        self.function_index.insert(key, idx);
        self.function_slots.push((fs.clone(), FunctionEntry::Pending));

        let mut builder = Builder::new(self, fs.clone());
        fs.generate(&mut builder)?;
        let resolved = builder.finish()?;

        self.function_slots[idx].1 = FunctionEntry::Resolved(resolved);
        Ok(())
    }

    /// Insert-or-return; data symbols have no generator to run.
    pub fn register_data(&mut self, ds: &DataSymbol) -> Result<()> {
        let key = ds.id();
        if self.data_index.contains_key(&key) {
            return Ok(());
        }
        let idx = self.data_slots.len();
        self.data_index.insert(key, idx);
        self.data_slots.push((
            ds.clone(),
            DataEntry {
                bytes: ds.bytes().to_vec(),
                name: ds.name().map(String::from),
                rom_offset: None,
            },
        ));
        Ok(())
    }

    /// Dispatches on the symbol's variant; address symbols need no action.
    pub fn register_symbol(&mut self, sym: &Symbol) -> Result<()> {
        match sym {
            Symbol::Address(_) => Ok(()),
            Symbol::Function(fs) => self.register_function(fs),
            Symbol::Data(ds) => self.register_data(ds),
        }
    }

    pub fn convention_of(&self, fs: &FunctionSymbol) -> Option<&CallingConvention> {
        let idx = *self.function_index.get(&fs.id())?;
        match &self.function_slots[idx].1 {
            FunctionEntry::Resolved(rf) => Some(&rf.call_conv),
            FunctionEntry::Pending => None,
        }
    }

    pub fn function_rom_offset(&self, fs: &FunctionSymbol) -> Option<u32> {
        let idx = *self.function_index.get(&fs.id())?;
        match &self.function_slots[idx].1 {
            FunctionEntry::Resolved(rf) => rf.rom_offset,
            FunctionEntry::Pending => None,
        }
    }

    /// The fully-generated function behind `fs`, if any (spec.md §4.7 needs
    /// this to locate a call's target instruction by its own metadata).
    pub fn resolved_function(&self, fs: &FunctionSymbol) -> Option<&ResolvedFunction> {
        let idx = *self.function_index.get(&fs.id())?;
        match &self.function_slots[idx].1 {
            FunctionEntry::Resolved(rf) => Some(rf),
            FunctionEntry::Pending => None,
        }
    }

    pub fn data_rom_offset(&self, ds: &DataSymbol) -> Option<u32> {
        let idx = *self.data_index.get(&ds.id())?;
        self.data_slots[idx].1.rom_offset
    }

    /// Resolved functions in registration order, skipping any still pending
    /// (there should be none once registration has quiesced).
    pub fn functions(&self) -> impl Iterator<Item = &ResolvedFunction> {
        self.function_slots.iter().filter_map(|(_, entry)| match entry {
            FunctionEntry::Resolved(rf) => Some(rf),
            FunctionEntry::Pending => None,
        })
    }

    pub fn function_symbols(&self) -> impl Iterator<Item = &FunctionSymbol> {
        self.function_slots.iter().map(|(fs, _)| fs)
    }

    pub fn data_symbols(&self) -> impl Iterator<Item = (&DataSymbol, &[u8], Option<&str>)> {
        self.data_slots
            .iter()
            .map(|(ds, entry)| (ds, entry.bytes.as_slice(), entry.name.as_deref()))
    }

    /// Assigns ROM offsets linearly: every function in registration order,
    /// then every data symbol in registration order (spec.md §2, "layout is
    /// linear by registration order unless otherwise specified" — the two
    /// registries are laid out contiguously, functions first, since they are
    /// tracked as two separate insertion-ordered maps rather than one
    /// unified sequence; see DESIGN.md).
    pub fn layout(&mut self) -> Result<()> {
        let mut offset: u32 = 0;
        for (_, entry) in self.function_slots.iter_mut() {
            if let FunctionEntry::Resolved(rf) = entry {
                rf.rom_offset = Some(offset);
                offset += rf.code.len() as u32;
            }
        }
        for (_, entry) in self.data_slots.iter_mut() {
            entry.rom_offset = Some(offset);
            offset += entry.bytes.len() as u32;
        }
        Ok(())
    }

    pub fn total_size(&self) -> u32 {
        self.function_slots
            .iter()
            .filter_map(|(_, e)| match e {
                FunctionEntry::Resolved(rf) => Some(rf.code.len() as u32),
                FunctionEntry::Pending => None,
            })
            .sum::<u32>()
            + self.data_slots.iter().map(|(_, e)| e.bytes.len() as u32).sum::<u32>()
    }
}

/// An insertion-ordered set with no duplicates, for the calling convention's
/// input/output/clobber sets (spec.md §3: "three ordered sets of call
/// values").
#[derive(Debug, Clone, Default)]
pub struct OrderedSet<T: PartialEq> {
    items: Vec<T>,
}

impl<T: PartialEq + Clone> OrderedSet<T> {
    pub fn new() -> Self {
        OrderedSet { items: Vec::new() }
    }

    pub fn insert(&mut self, value: T) {
        if !self.items.contains(&value) {
            self.items.push(value);
        }
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::Instr;

    #[test]
    fn idempotent_registration_does_not_rerun_generator() {
        use std::cell::Cell;
        use std::rc::Rc;

        let calls = Rc::new(Cell::new(0));
        let calls_clone = calls.clone();
        let fs = FunctionSymbol::new(move |b| {
            calls_clone.set(calls_clone.get() + 1);
            b.emit(Instr::Rts)
        });

        let mut registry = Registry::new();
        registry.register_function(&fs).unwrap();
        registry.register_function(&fs).unwrap();

        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn data_and_function_layout_is_contiguous_in_registration_order() {
        let mut registry = Registry::new();
        let fs = FunctionSymbol::new(|b| {
            b.emit(Instr::Nop)?;
            b.emit(Instr::Rts)
        });
        let ds = DataSymbol::new(vec![1, 2, 3]);
        registry.register_function(&fs).unwrap();
        registry.register_data(&ds).unwrap();
        registry.layout().unwrap();

        assert_eq!(registry.function_rom_offset(&fs), Some(0));
        assert_eq!(registry.data_rom_offset(&ds), Some(2));
    }
}
