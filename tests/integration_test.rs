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

use snes816asm::{
    build_rom, BuildContext, Builder, DataSymbol, Error, FunctionSymbol, Instr, JumpLongTarget, MappingMode, Reg,
    RegSize, RelocKind, Relocation, Symbol,
};

#[test]
fn single_nop_function_links_at_bank_0x80() {
    let entry = FunctionSymbol::new(|b: &mut Builder| {
        b.emit(Instr::Nop)?;
        b.emit(Instr::Rts)
    });
    let rom = build_rom(MappingMode::LoRom, &entry, &[]).unwrap();
    assert_eq!(rom, vec![0xEA, 0x60]);
}

#[test]
fn call_between_two_functions_patches_jsr_address() {
    let helper = FunctionSymbol::named("helper", |b: &mut Builder| {
        b.emit(Instr::Nop)?;
        b.emit(Instr::Rts)
    });
    let helper_for_entry = helper.clone();
    let entry = FunctionSymbol::named("entry", move |b: &mut Builder| {
        b.call(&helper_for_entry)?;
        b.emit(Instr::Rts)
    });

    let rom = build_rom(MappingMode::LoRom, &entry, &[]).unwrap();

    // entry: jsr helper (3 bytes), rts (1 byte) = 4 bytes, then helper.
    assert_eq!(rom[0], 0x20); // JSR_ABS
    // helper starts at ROM offset 4 -> CPU addr 0x808004 -> low16 0x8004.
    assert_eq!(rom[1], 0x04);
    assert_eq!(rom[2], 0x80);
    assert_eq!(rom[3], 0x60); // RTS
    assert_eq!(rom[4], 0xEA); // NOP
    assert_eq!(rom[5], 0x60); // RTS
}

#[test]
fn calling_convention_propagates_entry_mode_to_an_unsized_caller() {
    let callee = FunctionSymbol::new(|b: &mut Builder| {
        b.reg_a16()?;
        b.emit(Instr::Rts)
    });
    let callee_for_caller = callee.clone();
    let caller = FunctionSymbol::new(move |b: &mut Builder| {
        // Caller never sets its own A-size; it should inherit Bit16 from
        // the callee's entry mode instead of emitting its own sep/rep.
        b.call(&callee_for_caller)?;
        b.emit(Instr::Rts)
    });

    let rom = build_rom(MappingMode::LoRom, &caller, &[]).unwrap();
    // caller: jsr callee (3) + rts (1) = 4 bytes; callee: rep #0x20 (2) + rts (1).
    assert_eq!(rom.len(), 4 + 3);
    assert_eq!(rom[3], 0x60);
}

#[test]
fn store_value_zero_collapses_to_single_byte_stz_sequence() {
    let target = Symbol::Address(0x7E0010);
    let fs = FunctionSymbol::new(move |b: &mut Builder| {
        b.store_value(RegSize::Bit16, Reg::A, target.clone(), 0)?;
        b.emit(Instr::Rts)
    });
    let rom = build_rom(MappingMode::LoRom, &fs, &[]).unwrap();
    // stz addr16, stz addr16, rts = 3 + 3 + 1 bytes, no sep/rep anywhere.
    assert_eq!(rom.len(), 7);
    assert_eq!(rom[0], 0x9C);
    assert_eq!(rom[3], 0x9C);
    assert_eq!(rom[1], 0x10);
    assert_eq!(rom[2], 0x7E);
    assert_eq!(rom[4], 0x11);
    assert_eq!(rom[5], 0x7E);
    assert_eq!(rom[6], 0x60);
}

#[test]
fn store_value_nonzero_flips_size_loads_and_restores() {
    let target = Symbol::Address(0x7E0020);
    let fs = FunctionSymbol::new(move |b: &mut Builder| {
        b.reg_a8()?;
        b.store_value(RegSize::Bit16, Reg::A, target.clone(), 0x1234)?;
        b.emit(Instr::Rts)
    });
    let rom = build_rom(MappingMode::LoRom, &fs, &[]).unwrap();
    // sep #0x20 (2) + rep #0x20 (2) + lda #imm16 (3) + sta abs (3) +
    // sep #0x20 (2) + rts (1) = 13 bytes.
    assert_eq!(rom.len(), 13);
}

#[test]
fn data_symbol_rom_placement_follows_function_code() {
    let data = DataSymbol::named("greeting", b"hi".to_vec());
    let fs = FunctionSymbol::new(|b: &mut Builder| {
        b.emit(Instr::Nop)?;
        b.emit(Instr::Rts)
    });
    let rom = build_rom(MappingMode::LoRom, &fs, std::slice::from_ref(&data)).unwrap();
    assert_eq!(&rom[2..4], b"hi");
}

#[test]
fn short_branch_loop_lowers_per_section_4_3_algorithm() {
    // Mirrors the "tiny loop" scenario: a backward branch-always at the
    // top of a function. Worked out against the lowering algorithm
    // directly (not copied from the spec's own inconsistent prose byte
    // sequence — see DESIGN.md).
    let fs = FunctionSymbol::new(|b: &mut Builder| {
        let top = b.create_label();
        top.define(b)?;
        b.emit(Instr::Nop)?;
        b.branch_always(top)?;
        b.emit(Instr::Rts)
    });
    let rom = build_rom(MappingMode::LoRom, &fs, &[]).unwrap();
    assert_eq!(rom, vec![0xEA, 0x80, 0xFD, 0x60]);
}

#[test]
fn long_branch_across_a_large_function_becomes_jmp() {
    let fs = FunctionSymbol::new(|b: &mut Builder| {
        let skip = b.create_label();
        b.branch_always(skip)?;
        for _ in 0..150 {
            b.emit(Instr::Nop)?;
        }
        skip.define(b)?;
        b.emit(Instr::Rts)
    });
    let rom = build_rom(MappingMode::LoRom, &fs, &[]).unwrap();
    assert_eq!(rom[0], 0x4C); // JMP_ABS
    assert_eq!(rom.len(), 3 + 150 + 1);
}

#[test]
fn jump_long_to_a_distant_symbol_emits_jml_with_addr24_relocation() {
    // jump_long's symbol form emits an immediate jml with no lowering
    // step, so the target must be registered independently of the
    // entry point's own call graph.
    let other = FunctionSymbol::named("other", |b: &mut Builder| b.emit(Instr::Rts));
    let other_for_entry = other.clone();
    let entry = FunctionSymbol::new(move |b: &mut Builder| {
        b.jump_long(JumpLongTarget::Symbol(Symbol::Function(other_for_entry.clone())))
    });

    let mut ctx = BuildContext::new(MappingMode::LoRom).unwrap();
    ctx.register_entry_point(&entry).unwrap();
    ctx.register_entry_point(&other).unwrap();
    ctx.layout().unwrap();
    let mut rom = vec![0u8; ctx.total_size() as usize];
    ctx.link_into(&mut rom).unwrap();

    assert_eq!(rom[0], 0x5C); // JML
    // entry is 4 bytes (jml); `other` starts at ROM offset 4 -> 0x808004.
    assert_eq!(&rom[1..4], &[0x04, 0x80, 0x80]);
}

#[test]
fn unsized_register_operand_is_rejected_before_layout() {
    let fs = FunctionSymbol::new(|b: &mut Builder| {
        b.emit(Instr::Pha)?;
        b.emit(Instr::Rts)
    });
    let err = build_rom(MappingMode::LoRom, &fs, &[]).unwrap_err();
    assert!(matches!(err, Error::UnsizedRegisterOperand { .. }));
}

#[test]
fn rom_buffer_smaller_than_the_program_is_rejected() {
    let fs = FunctionSymbol::new(|b: &mut Builder| {
        b.emit(Instr::Nop)?;
        b.emit(Instr::Rts)
    });
    let mut ctx = BuildContext::new(MappingMode::LoRom).unwrap();
    ctx.register_entry_point(&fs).unwrap();
    ctx.layout().unwrap();
    let mut rom = vec![0u8; 1];
    let err = ctx.link_into(&mut rom).unwrap_err();
    assert!(matches!(err, Error::RomTooSmall { .. }));
}

#[test]
fn explicit_imm8_relocation_round_trips_through_emit_reloc() {
    let fs = FunctionSymbol::new(|b: &mut Builder| {
        b.reg_x8()?;
        b.emit_reloc(Instr::LdxImm(0), Relocation::imm8(0x42))?;
        b.emit(Instr::Rts)
    });
    let rom = build_rom(MappingMode::LoRom, &fs, &[]).unwrap();
    assert_eq!(rom[0], 0xA2); // LDX_IMM
    assert_eq!(rom[1], 0x42);
}

#[test]
fn unimplemented_mapping_mode_fails_at_context_construction() {
    let err = BuildContext::new(MappingMode::Other("hirom")).unwrap_err();
    assert_eq!(err, Error::UnimplementedMapping("hirom"));
}

#[test]
fn store_reloc_against_a_data_symbol_address_loads_and_stores() {
    let table = DataSymbol::named("table", vec![9, 9]);
    let target = Symbol::Address(0x7E0030);
    let table_for_fn = table.clone();
    let fs = FunctionSymbol::new(move |b: &mut Builder| {
        b.reg_x16()?;
        b.store_reloc(
            RegSize::Bit16,
            Reg::X,
            target.clone(),
            Relocation::to(RelocKind::Addr16, Symbol::Data(table_for_fn.clone())),
        )?;
        b.emit(Instr::Rts)
    });

    let mut ctx = BuildContext::new(MappingMode::LoRom).unwrap();
    ctx.register_entry_point(&fs).unwrap();
    ctx.register_data(&table).unwrap();
    ctx.layout().unwrap();
    let mut rom = vec![0u8; ctx.total_size() as usize];
    ctx.link_into(&mut rom).unwrap();

    // rep #0x20 (2) + ldx abs16-imm (3) + stx abs (3) + rts (1) = 9 bytes,
    // then the 2-byte data blob.
    assert_eq!(rom.len(), 9 + 2);
    assert_eq!(rom[0], 0xC2); // REP
    assert_eq!(rom[2], 0xA2); // LDX_IMM
}
