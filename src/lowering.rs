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

//! Branch lowering (spec.md §4.3): an iterative fixed-point pass that
//! decides, for every `branch_always` relocation, whether a short `bra`
//! reaches its label or a `jmp` is required, and rewrites every pending
//! branch relocation into a concrete instruction.
//!
//! `jump_long` relocations never have a size choice to make — per spec.md
//! §4.3 both the "short" and "long" sizes for that kind are the same four
//! bytes (`jml`), so they are resolved directly without participating in
//! the fixed-point loop.

use crate::builder::{BranchRelocKind, InstrMeta};
use crate::errors::{Error, Result};
use crate::instr::Instr;
use crate::reloc::{RelocKind, Relocation};
use crate::symbol::{FunctionSymbol, Symbol};

const BRA_SIZE: u32 = 2;
const JMP_SIZE: u32 = 3;
const JML_SIZE: u32 = 4;

fn assumed_size(meta: &InstrMeta, is_long: bool) -> u32 {
    match &meta.branch_reloc {
        Some(br) => match br.kind {
            BranchRelocKind::Always => {
                if is_long {
                    JMP_SIZE
                } else {
                    BRA_SIZE
                }
            }
            BranchRelocKind::JumpLong => JML_SIZE,
        },
        None => meta.instr.size(meta.a_size, meta.xy_size) as u32,
    }
}

fn layout_offsets(metadata: &[InstrMeta], is_long: &[bool]) -> Vec<u32> {
    let mut offsets = Vec::with_capacity(metadata.len());
    let mut offset = 0u32;
    for (i, meta) in metadata.iter().enumerate() {
        offsets.push(offset);
        offset += assumed_size(meta, is_long[i]);
    }
    offsets
}

/// Runs the fixed-point pass over `metadata`, using `labels` (as produced
/// by the owning [`crate::builder::Builder`]) to resolve label indices to
/// instruction indices, and replaces every branch relocation with a
/// concrete instruction. `owner` is the function being built, used as the
/// relocation target for intra-function long jumps (whose address is not
/// known until this function itself has a ROM offset, exactly like any
/// other call against it).
pub fn lower_branches(metadata: &mut [InstrMeta], labels: &[Option<usize>], owner: &FunctionSymbol) -> Result<()> {
    let mut is_long = vec![false; metadata.len()];

    let offsets = loop {
        let offsets = layout_offsets(metadata, &is_long);
        let mut changed = false;

        for (i, meta) in metadata.iter().enumerate() {
            let Some(br) = &meta.branch_reloc else { continue };
            if br.kind != BranchRelocKind::Always || is_long[i] {
                continue;
            }
            let target_index = labels
                .get(br.target_label.0)
                .copied()
                .flatten()
                .ok_or(Error::UndefinedLabel)?;
            let target_offset = offsets[target_index];
            let next_instr_offset = offsets[i] + BRA_SIZE;
            let distance = target_offset as i64 - next_instr_offset as i64;
            if distance < i8::MIN as i64 || distance > i8::MAX as i64 {
                is_long[i] = true;
                changed = true;
            }
        }

        if !changed {
            break offsets;
        }
    };

    for (i, meta) in metadata.iter_mut().enumerate() {
        let Some(br) = meta.branch_reloc.take() else { continue };
        let target_index = labels
            .get(br.target_label.0)
            .copied()
            .flatten()
            .ok_or(Error::UndefinedLabel)?;
        let target_offset = offsets[target_index];

        match br.kind {
            BranchRelocKind::Always if !is_long[i] => {
                let next_instr_offset = offsets[i] + BRA_SIZE;
                let distance = target_offset as i64 - next_instr_offset as i64;
                if !(i8::MIN as i64..=i8::MAX as i64).contains(&distance) {
                    return Err(Error::BranchOutOfRange);
                }
                meta.instr = Instr::Bra(distance as i8);
            }
            BranchRelocKind::Always => {
                meta.instr = Instr::Jmp(0);
                meta.reloc = Some(Relocation::to_offset(
                    RelocKind::Addr16,
                    Symbol::Function(owner.clone()),
                    target_offset as u16,
                ));
            }
            BranchRelocKind::JumpLong => {
                meta.instr = Instr::Jml(0);
                meta.reloc = Some(Relocation::to_offset(
                    RelocKind::Addr24,
                    Symbol::Function(owner.clone()),
                    target_offset as u16,
                ));
            }
        }
    }

    Ok(())
}
