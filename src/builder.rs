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

//! The instruction builder (spec.md §4.2): the host-facing API a function's
//! generator uses to emit instructions, set register-size modes, call other
//! functions, and note comments against the instructions it has just
//! emitted.

use crate::errors::{Error, Result};
use crate::instr::{Instr, Reg, RegClass, RegSize};
use crate::reloc::{RelocKind, Relocation};
use crate::registry::{CallingConvention, OrderedSet, Registry, ResolvedFunction};
use crate::symbol::{FunctionSymbol, Symbol};

/// A location in a function's instruction stream that can be branched to.
/// Opaque outside this module; valid only with the `Builder` that created
/// it (spec.md §4.2, "Label operations").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub(crate) usize);

impl Label {
    /// Convenience for `builder.define_label(label)`.
    pub fn define(self, builder: &mut Builder) -> Result<()> {
        builder.define_label(self)
    }
}

/// A handle to a register's current value, invalidated whenever that
/// register's size mode changes or its value is clobbered (spec.md §4.2,
/// "Register handles").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterHandle {
    reg: Reg,
    generation: u32,
}

/// The kind of branch relocation a not-yet-lowered instruction carries
/// (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchRelocKind {
    Always,
    JumpLong,
}

/// A pending branch awaiting [`crate::lowering`]'s fixed-point pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchReloc {
    pub kind: BranchRelocKind,
    pub target_label: Label,
}

/// Either a label within the current function or a symbol elsewhere, the
/// two things a long jump can target (spec.md §4.2, "jump_long").
pub enum JumpLongTarget {
    Label(Label),
    Symbol(Symbol),
}

/// Either a raw immediate or a symbol's address, the two things a stack
/// push-of-value can push (spec.md §4.2, "push_value").
pub enum PushValue {
    Immediate(u16),
    Symbol(Symbol),
}

/// One emitted instruction plus everything layout, relocation, and debug
/// emission need to know about it afterward.
#[derive(Debug, Clone)]
pub struct InstrMeta {
    pub instr: Instr,
    pub byte_offset: u32,
    pub reloc: Option<Relocation>,
    pub branch_reloc: Option<BranchReloc>,
    pub a_size: RegSize,
    pub xy_size: RegSize,
    pub comments: Vec<String>,
}

/// Tri-valued update to one status-register bit (spec.md §4.2,
/// "change_status_flags"). `Unchanged` lets callers build a partial update
/// without naming every bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlagUpdate {
    #[default]
    Unchanged,
    Set,
    Clear,
}

/// A partial update to the eight status-register bits, coalesced by
/// [`Builder::change_status_flags`] into zero, one, or two instructions.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusFlagUpdate {
    pub carry: FlagUpdate,
    pub zero: FlagUpdate,
    pub irq_disable: FlagUpdate,
    pub decimal: FlagUpdate,
    pub xy_8bit: FlagUpdate,
    pub a_8bit: FlagUpdate,
    pub overflow: FlagUpdate,
    pub negative: FlagUpdate,
}

mod flag_bits {
    pub const CARRY: u8 = 0x01;
    pub const ZERO: u8 = 0x02;
    pub const IRQ_DISABLE: u8 = 0x04;
    pub const DECIMAL: u8 = 0x08;
    pub const XY_8BIT: u8 = 0x10;
    pub const A_8BIT: u8 = 0x20;
    pub const OVERFLOW: u8 = 0x40;
    pub const NEGATIVE: u8 = 0x80;
}

fn size_to_flag(size: RegSize) -> FlagUpdate {
    match size {
        RegSize::Bit8 => FlagUpdate::Set,
        RegSize::Bit16 => FlagUpdate::Clear,
        RegSize::None => FlagUpdate::Unchanged,
    }
}

/// Builds one function's instruction stream. Borrows the [`Registry`] it
/// was spawned from so that `call()` can register and recurse into callees
/// (spec.md §4.1, §4.2).
pub struct Builder<'a> {
    registry: &'a mut Registry,
    owner: FunctionSymbol,

    metadata: Vec<InstrMeta>,
    labels: Vec<Option<usize>>,
    pending_comments: Vec<String>,

    a_size: RegSize,
    xy_size: RegSize,
    start_a: RegSize,
    start_xy: RegSize,
    end_a: Option<RegSize>,
    end_xy: Option<RegSize>,

    a_generation: u32,
    x_generation: u32,
    y_generation: u32,

    inputs: OrderedSet<Reg>,
    outputs: OrderedSet<Reg>,
    clobbers: OrderedSet<Reg>,
}

impl<'a> Builder<'a> {
    pub(crate) fn new(registry: &'a mut Registry, owner: FunctionSymbol) -> Self {
        Builder {
            registry,
            owner,
            metadata: Vec::new(),
            labels: Vec::new(),
            pending_comments: Vec::new(),
            a_size: RegSize::None,
            xy_size: RegSize::None,
            start_a: RegSize::None,
            start_xy: RegSize::None,
            end_a: None,
            end_xy: None,
            a_generation: 0,
            x_generation: 0,
            y_generation: 0,
            inputs: OrderedSet::new(),
            outputs: OrderedSet::new(),
            clobbers: OrderedSet::new(),
        }
    }

    fn current_size(&self, class: RegClass) -> RegSize {
        match class {
            RegClass::A => self.a_size,
            RegClass::Xy => self.xy_size,
        }
    }

    fn generation_of(&self, reg: Reg) -> u32 {
        match reg {
            Reg::A => self.a_generation,
            Reg::X => self.x_generation,
            Reg::Y => self.y_generation,
        }
    }

    fn bump_generation(&mut self, reg: Reg) {
        match reg {
            Reg::A => self.a_generation += 1,
            Reg::X => self.x_generation += 1,
            Reg::Y => self.y_generation += 1,
        }
    }

    fn handle_for(&self, reg: Reg) -> RegisterHandle {
        RegisterHandle {
            reg,
            generation: self.generation_of(reg),
        }
    }

    /// Fails if `handle` was issued before the register's value or size was
    /// last invalidated (spec.md §4.2, "Register handles").
    pub fn check_handle(&self, handle: RegisterHandle) -> Result<()> {
        let current = self.generation_of(handle.reg);
        if current != handle.generation {
            return Err(Error::StaleRegisterHandle {
                issued: handle.generation,
                current,
            });
        }
        Ok(())
    }

    /// Changes `a_size` or `xy_size` if `new_size` differs from the current
    /// value, bumping the affected register's generation and, the first
    /// time a class's mode is ever set, recording it as the function's
    /// start-mode. Returns whether a real change happened.
    fn apply_size_change(&mut self, class: RegClass, new_size: RegSize) -> bool {
        let current = self.current_size(class);
        if current == new_size {
            return false;
        }
        match class {
            RegClass::A => {
                self.a_size = new_size;
                if self.start_a == RegSize::None {
                    self.start_a = new_size;
                }
                self.a_generation += 1;
            }
            RegClass::Xy => {
                self.xy_size = new_size;
                if self.start_xy == RegSize::None {
                    self.start_xy = new_size;
                }
                self.x_generation += 1;
                self.y_generation += 1;
            }
        }
        true
    }

    /// Coalesces a partial status-flag update into zero, one, or two
    /// instructions: one `sep` for every bit being set, one `rep` for every
    /// bit being cleared. A-size/XY-8bit bits that do not actually change
    /// the tracked mode are dropped rather than emitted (spec.md §4.2).
    pub fn change_status_flags(&mut self, update: StatusFlagUpdate) -> Result<()> {
        use flag_bits::*;

        let mut set_mask = 0u8;
        let mut clear_mask = 0u8;

        let mut plain = |value: FlagUpdate, bit: u8, set_mask: &mut u8, clear_mask: &mut u8| match value {
            FlagUpdate::Set => *set_mask |= bit,
            FlagUpdate::Clear => *clear_mask |= bit,
            FlagUpdate::Unchanged => {}
        };
        plain(update.carry, CARRY, &mut set_mask, &mut clear_mask);
        plain(update.zero, ZERO, &mut set_mask, &mut clear_mask);
        plain(update.irq_disable, IRQ_DISABLE, &mut set_mask, &mut clear_mask);
        plain(update.decimal, DECIMAL, &mut set_mask, &mut clear_mask);
        plain(update.overflow, OVERFLOW, &mut set_mask, &mut clear_mask);
        plain(update.negative, NEGATIVE, &mut set_mask, &mut clear_mask);

        match update.a_8bit {
            FlagUpdate::Set if self.apply_size_change(RegClass::A, RegSize::Bit8) => set_mask |= A_8BIT,
            FlagUpdate::Clear if self.apply_size_change(RegClass::A, RegSize::Bit16) => clear_mask |= A_8BIT,
            _ => {}
        }
        match update.xy_8bit {
            FlagUpdate::Set if self.apply_size_change(RegClass::Xy, RegSize::Bit8) => set_mask |= XY_8BIT,
            FlagUpdate::Clear if self.apply_size_change(RegClass::Xy, RegSize::Bit16) => clear_mask |= XY_8BIT,
            _ => {}
        }

        if set_mask != 0 {
            self.record(Instr::Sep(set_mask), None, None)?;
        }
        if clear_mask != 0 {
            self.record(Instr::Rep(clear_mask), None, None)?;
        }
        Ok(())
    }

    pub fn reg_a8(&mut self) -> Result<RegisterHandle> {
        self.change_status_flags(StatusFlagUpdate {
            a_8bit: FlagUpdate::Set,
            ..Default::default()
        })?;
        Ok(self.handle_for(Reg::A))
    }

    pub fn reg_a16(&mut self) -> Result<RegisterHandle> {
        self.change_status_flags(StatusFlagUpdate {
            a_8bit: FlagUpdate::Clear,
            ..Default::default()
        })?;
        Ok(self.handle_for(Reg::A))
    }

    pub fn reg_x8(&mut self) -> Result<RegisterHandle> {
        self.change_status_flags(StatusFlagUpdate {
            xy_8bit: FlagUpdate::Set,
            ..Default::default()
        })?;
        Ok(self.handle_for(Reg::X))
    }

    pub fn reg_x16(&mut self) -> Result<RegisterHandle> {
        self.change_status_flags(StatusFlagUpdate {
            xy_8bit: FlagUpdate::Clear,
            ..Default::default()
        })?;
        Ok(self.handle_for(Reg::X))
    }

    pub fn reg_y8(&mut self) -> Result<RegisterHandle> {
        self.change_status_flags(StatusFlagUpdate {
            xy_8bit: FlagUpdate::Set,
            ..Default::default()
        })?;
        Ok(self.handle_for(Reg::Y))
    }

    pub fn reg_y16(&mut self) -> Result<RegisterHandle> {
        self.change_status_flags(StatusFlagUpdate {
            xy_8bit: FlagUpdate::Clear,
            ..Default::default()
        })?;
        Ok(self.handle_for(Reg::Y))
    }

    pub fn reg_xy8(&mut self) -> Result<(RegisterHandle, RegisterHandle)> {
        self.change_status_flags(StatusFlagUpdate {
            xy_8bit: FlagUpdate::Set,
            ..Default::default()
        })?;
        Ok((self.handle_for(Reg::X), self.handle_for(Reg::Y)))
    }

    pub fn reg_xy16(&mut self) -> Result<(RegisterHandle, RegisterHandle)> {
        self.change_status_flags(StatusFlagUpdate {
            xy_8bit: FlagUpdate::Clear,
            ..Default::default()
        })?;
        Ok((self.handle_for(Reg::X), self.handle_for(Reg::Y)))
    }

    /// Declares that this function expects `reg` to hold a meaningful value
    /// on entry, `reg` to hold a result on exit, or `reg` clobbered at some
    /// point, for the calling convention exposed to callers (spec.md §3).
    pub fn mark_input(&mut self, reg: Reg) {
        self.inputs.insert(reg);
    }
    pub fn mark_output(&mut self, reg: Reg) {
        self.outputs.insert(reg);
    }
    pub fn mark_clobber(&mut self, reg: Reg) {
        self.clobbers.insert(reg);
    }

    /// Attaches `text` as a comment on the next instruction emitted.
    pub fn note(&mut self, text: impl Into<String>) {
        self.pending_comments.push(text.into());
    }

    /// As [`Builder::note`], but also records a source location. The
    /// location is currently carried only for round-tripping through
    /// callers that want it; nothing here correlates it with host call
    /// stacks (spec.md §4.6's recommended re-architecture: explicit
    /// annotation instead of stack introspection).
    pub fn note_at(&mut self, file: &str, line: u32, text: impl Into<String>) {
        self.pending_comments.push(format!("{text} ({file}:{line})", text = text.into()));
    }

    fn drain_comments(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_comments)
    }

    /// Common bookkeeping for every instruction the builder appends:
    /// the unsized-register-operand check, metadata push, and the
    /// consistent-return-sizes check.
    fn record(&mut self, instr: Instr, reloc: Option<Relocation>, branch_reloc: Option<BranchReloc>) -> Result<usize> {
        let index = self.metadata.len();

        if branch_reloc.is_none() {
            if let Some(class) = instr.register_dependency() {
                if self.current_size(class) == RegSize::None {
                    return Err(Error::UnsizedRegisterOperand { index });
                }
            }
        }

        let comments = self.drain_comments();
        self.metadata.push(InstrMeta {
            instr,
            byte_offset: 0,
            reloc,
            branch_reloc,
            a_size: self.a_size,
            xy_size: self.xy_size,
            comments,
        });

        if instr.is_return() {
            match (self.end_a, self.end_xy) {
                (None, None) => {
                    self.end_a = Some(self.a_size);
                    self.end_xy = Some(self.xy_size);
                }
                (Some(expected_a), Some(expected_xy)) => {
                    if expected_a != self.a_size || expected_xy != self.xy_size {
                        return Err(Error::InconsistentReturnSizes {
                            index,
                            expected_a,
                            expected_xy,
                            found_a: self.a_size,
                            found_xy: self.xy_size,
                        });
                    }
                }
                _ => unreachable!("end_a and end_xy are always set together"),
            }
        }

        Ok(index)
    }

    /// Appends `instr` under the current register-size modes, with no
    /// relocation.
    pub fn emit(&mut self, instr: Instr) -> Result<()> {
        self.record(instr, None, None)?;
        Ok(())
    }

    /// Appends `instr` with a deferred operand relocation.
    pub fn emit_reloc(&mut self, instr: Instr, reloc: Relocation) -> Result<()> {
        self.record(instr, Some(reloc), None)?;
        Ok(())
    }

    pub fn create_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the position of the next instruction that will be
    /// emitted.
    pub fn define_label(&mut self, label: Label) -> Result<()> {
        self.labels[label.0] = Some(self.metadata.len());
        Ok(())
    }

    /// Appends a placeholder short branch to `label`, to be resolved into a
    /// concrete `bra` or `jmp`/`jml` by the lowering pass (spec.md §4.3).
    pub fn branch_always(&mut self, label: Label) -> Result<()> {
        self.record(
            Instr::Bra(0),
            None,
            Some(BranchReloc {
                kind: BranchRelocKind::Always,
                target_label: label,
            }),
        )?;
        Ok(())
    }

    /// Either a placeholder long branch to a label (resolved by lowering)
    /// or an immediate `jml` to a symbol elsewhere in the image.
    pub fn jump_long(&mut self, target: JumpLongTarget) -> Result<()> {
        match target {
            JumpLongTarget::Label(label) => {
                self.record(
                    Instr::Jml(0),
                    None,
                    Some(BranchReloc {
                        kind: BranchRelocKind::JumpLong,
                        target_label: label,
                    }),
                )?;
            }
            JumpLongTarget::Symbol(sym) => {
                self.record(Instr::Jml(0), Some(Relocation::to(RelocKind::Addr24, sym)), None)?;
            }
        }
        Ok(())
    }

    /// Emits `jsr` against `target` with no calling-convention tracking at
    /// all (spec.md §4.2's escape hatch for calls whose convention the host
    /// manages out of band).
    pub fn jump_subroutine(&mut self, target: &FunctionSymbol) -> Result<()> {
        self.record(
            Instr::Jsr(0),
            Some(Relocation::to(RelocKind::Addr16, Symbol::Function(target.clone()))),
            None,
        )?;
        Ok(())
    }

    /// Registers (generating if necessary) and calls `target`, adopting its
    /// resolved calling convention.
    pub fn call(&mut self, target: &FunctionSymbol) -> Result<()> {
        self.registry.register_function(target)?;
        let cc = self
            .registry
            .convention_of(target)
            .cloned()
            .expect("register_function just resolved this symbol");
        self.call_with_convention(target, &cc)
    }

    /// Calls `target` under an explicitly supplied convention, bypassing
    /// the registry lookup (spec.md §4.2, "call_with_convention"). For each
    /// of A and XY: if this function has not yet set its own start-mode,
    /// the callee's entry mode is adopted silently (propagating the
    /// convention outward); otherwise a status-flag change is emitted to
    /// match it. After the call, this function's current mode becomes the
    /// callee's exit mode, and every clobbered register's generation
    /// advances.
    pub fn call_with_convention(&mut self, target: &FunctionSymbol, cc: &CallingConvention) -> Result<()> {
        self.adopt_or_match_entry_mode(RegClass::A, cc.start_a)?;
        self.adopt_or_match_entry_mode(RegClass::Xy, cc.start_xy)?;

        if cc.end_a != RegSize::None {
            self.set_current_mode_silently(RegClass::A, cc.end_a);
        }
        if cc.end_xy != RegSize::None {
            self.set_current_mode_silently(RegClass::Xy, cc.end_xy);
        }

        for reg in &cc.clobbers {
            self.bump_generation(*reg);
        }

        self.record(
            Instr::Jsr(0),
            Some(Relocation::to(RelocKind::Addr16, Symbol::Function(target.clone()))),
            None,
        )?;
        Ok(())
    }

    fn adopt_or_match_entry_mode(&mut self, class: RegClass, required: RegSize) -> Result<()> {
        if required == RegSize::None {
            return Ok(());
        }
        let has_own_start = match class {
            RegClass::A => self.start_a != RegSize::None,
            RegClass::Xy => self.start_xy != RegSize::None,
        };
        if !has_own_start {
            match class {
                RegClass::A => {
                    self.start_a = required;
                    self.a_size = required;
                    self.a_generation += 1;
                }
                RegClass::Xy => {
                    self.start_xy = required;
                    self.xy_size = required;
                    self.x_generation += 1;
                    self.y_generation += 1;
                }
            }
            Ok(())
        } else {
            let update = match class {
                RegClass::A => StatusFlagUpdate {
                    a_8bit: size_to_flag(required),
                    ..Default::default()
                },
                RegClass::Xy => StatusFlagUpdate {
                    xy_8bit: size_to_flag(required),
                    ..Default::default()
                },
            };
            self.change_status_flags(update)
        }
    }

    /// Sets the tracked mode to reflect what the callee left it as, without
    /// emitting an instruction (the callee already changed it before
    /// returning) but still invalidating cached handles if it actually
    /// changed.
    fn set_current_mode_silently(&mut self, class: RegClass, new_size: RegSize) {
        self.apply_size_change(class, new_size);
    }

    pub fn push(&mut self, reg: Reg) -> Result<()> {
        let instr = match reg {
            Reg::A => Instr::Pha,
            Reg::X => Instr::Phx,
            Reg::Y => Instr::Phy,
        };
        self.record(instr, None, None)?;
        Ok(())
    }

    /// Pulls `reg` from the stack, advancing its generation since a new
    /// value now occupies it.
    pub fn pull(&mut self, reg: Reg) -> Result<RegisterHandle> {
        let instr = match reg {
            Reg::A => Instr::Pla,
            Reg::X => Instr::Plx,
            Reg::Y => Instr::Ply,
        };
        self.record(instr, None, None)?;
        self.bump_generation(reg);
        Ok(self.handle_for(reg))
    }

    pub fn push_status(&mut self) -> Result<()> {
        self.record(Instr::Php, None, None)?;
        Ok(())
    }

    pub fn pull_status(&mut self) -> Result<()> {
        self.record(Instr::Plp, None, None)?;
        Ok(())
    }

    /// Pushes a 16-bit value or symbol address via `pea`.
    pub fn push_value(&mut self, value: PushValue) -> Result<()> {
        match value {
            PushValue::Immediate(v) => {
                self.record(Instr::Pea(0), Some(Relocation::imm16(v)), None)?;
            }
            PushValue::Symbol(sym) => {
                self.record(Instr::Pea(0), Some(Relocation::to(RelocKind::Addr16, sym)), None)?;
            }
        }
        Ok(())
    }

    fn load_immediate(&mut self, reg: Reg, value: u16) -> Result<()> {
        let instr = match reg {
            Reg::A => Instr::LdaImm(value),
            Reg::X => Instr::LdxImm(value),
            Reg::Y => Instr::LdyImm(value),
        };
        self.record(instr, None, None)?;
        self.bump_generation(reg);
        Ok(())
    }

    fn load_reloc(&mut self, reg: Reg, reloc: Relocation) -> Result<()> {
        let instr = match reg {
            Reg::A => Instr::LdaImm(0),
            Reg::X => Instr::LdxImm(0),
            Reg::Y => Instr::LdyImm(0),
        };
        self.record(instr, Some(reloc), None)?;
        self.bump_generation(reg);
        Ok(())
    }

    fn store_from_reg(&mut self, reg: Reg, target: Symbol) -> Result<()> {
        let instr = match reg {
            Reg::A => Instr::StaAbs(0),
            Reg::X => Instr::StxAbs(0),
            Reg::Y => Instr::StyAbs(0),
        };
        self.record(instr, Some(Relocation::to(RelocKind::Addr16, target)), None)?;
        Ok(())
    }

    fn set_size_matching(&mut self, class: RegClass, size: RegSize) -> Result<()> {
        let update = match class {
            RegClass::A => StatusFlagUpdate {
                a_8bit: size_to_flag(size),
                ..Default::default()
            },
            RegClass::Xy => StatusFlagUpdate {
                xy_8bit: size_to_flag(size),
                ..Default::default()
            },
        };
        self.change_status_flags(update)
    }

    /// Zero-stores `size` bytes at `target` using `stz`, one instruction per
    /// byte, independent of the current A-size mode (spec.md §4.2's
    /// zero-store optimization: `stz` needs no accumulator, so it never
    /// flips A's size).
    pub fn store_zero(&mut self, size: RegSize, target: Symbol) -> Result<()> {
        match size {
            RegSize::Bit8 => {
                self.record(Instr::StzAbs(0), Some(Relocation::to(RelocKind::Addr16, target)), None)?;
            }
            RegSize::Bit16 => {
                self.record(
                    Instr::StzAbs(0),
                    Some(Relocation::to_offset(RelocKind::Addr16, target.clone(), 0)),
                    None,
                )?;
                self.record(
                    Instr::StzAbs(0),
                    Some(Relocation::to_offset(RelocKind::Addr16, target, 1)),
                    None,
                )?;
            }
            RegSize::None => return Err(Error::UnsizedRegisterOperand { index: self.metadata.len() }),
        }
        Ok(())
    }

    /// Stores the literal `value` at `target` as `size` bytes via `reg`. A
    /// zero value collapses to [`Builder::store_zero`]. A non-zero value
    /// temporarily flips `reg`'s size mode to `size` if it does not already
    /// match, loads the value, stores it, and flips back; `reg` is
    /// clobbered in the process.
    pub fn store_value(&mut self, size: RegSize, reg: Reg, target: Symbol, value: u16) -> Result<()> {
        if value == 0 {
            return self.store_zero(size, target);
        }
        let class = reg.class();
        let original = self.current_size(class);
        let needs_flip = original != size;
        if needs_flip {
            self.set_size_matching(class, size)?;
        }
        self.load_immediate(reg, value)?;
        self.store_from_reg(reg, target)?;
        if needs_flip {
            self.set_size_matching(class, original)?;
        }
        Ok(())
    }

    /// As [`Builder::store_value`], but the value to store is itself a
    /// relocation (e.g. a symbol's address) rather than a literal. A
    /// zero-valued immediate relocation still collapses to
    /// [`Builder::store_zero`].
    pub fn store_reloc(&mut self, size: RegSize, reg: Reg, target: Symbol, value: Relocation) -> Result<()> {
        let is_zero_immediate =
            matches!(value.kind, RelocKind::Imm8 | RelocKind::Imm16) && value.target_offset == 0;
        if is_zero_immediate {
            return self.store_zero(size, target);
        }
        let class = reg.class();
        let original = self.current_size(class);
        let needs_flip = original != size;
        if needs_flip {
            self.set_size_matching(class, size)?;
        }
        self.load_reloc(reg, value)?;
        self.store_from_reg(reg, target)?;
        if needs_flip {
            self.set_size_matching(class, original)?;
        }
        Ok(())
    }

    /// Runs branch lowering to a fixed point, assigns byte offsets, and
    /// serializes the function's code, returning the finished
    /// [`ResolvedFunction`] for the registry to store.
    pub(crate) fn finish(mut self) -> Result<ResolvedFunction> {
        crate::lowering::lower_branches(&mut self.metadata, &self.labels, &self.owner)?;

        let mut code = Vec::new();
        let mut offset = 0u32;
        for meta in &mut self.metadata {
            meta.byte_offset = offset;
            let bytes = meta.instr.encode(meta.a_size, meta.xy_size);
            offset += bytes.len() as u32;
            code.extend(bytes);
        }

        let call_conv = CallingConvention {
            start_a: self.start_a,
            start_xy: self.start_xy,
            end_a: self.end_a.unwrap_or(RegSize::None),
            end_xy: self.end_xy.unwrap_or(RegSize::None),
            inputs: self.inputs.into_vec(),
            outputs: self.outputs.into_vec(),
            clobbers: self.clobbers.into_vec(),
        };

        Ok(ResolvedFunction {
            code,
            metadata: self.metadata,
            call_conv,
            name: self.owner.name().map(String::from),
            source_location: self.owner.source_location().cloned(),
            rom_offset: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    #[test]
    fn unsized_accumulator_store_is_rejected() {
        let mut registry = Registry::new();
        let fs = FunctionSymbol::new(|b| {
            b.emit(Instr::Pha)?;
            b.emit(Instr::Rts)
        });
        let err = registry.register_function(&fs).unwrap_err();
        assert_eq!(err, Error::UnsizedRegisterOperand { index: 0 });
    }

    #[test]
    fn setting_a_size_twice_to_the_same_value_emits_no_instruction() {
        let mut registry = Registry::new();
        let fs = FunctionSymbol::new(|b| {
            b.reg_a8()?;
            b.reg_a8()?;
            b.emit(Instr::Rts)
        });
        registry.register_function(&fs).unwrap();
        let cc = registry.convention_of(&fs).unwrap();
        assert_eq!(cc.start_a, RegSize::Bit8);
    }

    #[test]
    fn inconsistent_return_sizes_are_rejected() {
        let mut registry = Registry::new();
        let fs = FunctionSymbol::new(|b| {
            b.reg_a8()?;
            b.emit(Instr::Rts)?;
            b.reg_a16()?;
            b.emit(Instr::Rts)
        });
        let err = registry.register_function(&fs).unwrap_err();
        assert!(matches!(err, Error::InconsistentReturnSizes { .. }));
    }

    #[test]
    fn stale_register_handle_is_detected() {
        let mut registry = Registry::new();
        let fs = FunctionSymbol::new(|b| {
            let handle = b.reg_a8()?;
            b.reg_a16()?;
            let check = b.check_handle(handle);
            assert!(check.is_err());
            b.reg_a8()?;
            b.emit(Instr::Rts)
        });
        registry.register_function(&fs).unwrap();
    }

    #[test]
    fn zero_store_of_sixteen_bits_emits_two_single_byte_stz_and_no_flags() {
        let mut registry = Registry::new();
        let fs = FunctionSymbol::new(|b| {
            b.store_value(RegSize::Bit16, Reg::A, Symbol::Address(0x7E0000), 0)?;
            b.emit(Instr::Rts)
        });
        registry.register_function(&fs).unwrap();
        let resolved = registry.functions().next().unwrap();
        let stz_count = resolved
            .metadata
            .iter()
            .filter(|m| matches!(m.instr, Instr::StzAbs(_)))
            .count();
        assert_eq!(stz_count, 2);
        assert!(resolved.metadata.iter().all(|m| !matches!(m.instr, Instr::Sep(_) | Instr::Rep(_))));
    }

    #[test]
    fn circular_call_is_detected() {
        use std::cell::RefCell;
        use std::rc::Rc;

        // A function that calls itself via `call()` before it has ever
        // finished generating cannot know its own calling convention.
        let slot: Rc<RefCell<Option<FunctionSymbol>>> = Rc::new(RefCell::new(None));
        let slot_for_closure = slot.clone();
        let recursive = FunctionSymbol::new(move |b| {
            let target = slot_for_closure.borrow().clone().unwrap();
            b.call(&target)?;
            b.emit(Instr::Rts)
        });
        *slot.borrow_mut() = Some(recursive.clone());

        let mut registry = Registry::new();
        let err = registry.register_function(&recursive).unwrap_err();
        assert_eq!(err, Error::CircularDependency);
    }

    #[test]
    fn marked_call_values_surface_in_the_resolved_calling_convention() {
        let mut registry = Registry::new();
        let fs = FunctionSymbol::new(|b| {
            b.mark_input(Reg::A);
            b.mark_output(Reg::X);
            b.mark_clobber(Reg::Y);
            b.mark_clobber(Reg::Y); // duplicate insert must not double up
            b.emit(Instr::Rts)
        });
        registry.register_function(&fs).unwrap();
        let cc = registry.convention_of(&fs).unwrap();
        assert_eq!(cc.inputs, vec![Reg::A]);
        assert_eq!(cc.outputs, vec![Reg::X]);
        assert_eq!(cc.clobbers, vec![Reg::Y]);
    }
}
