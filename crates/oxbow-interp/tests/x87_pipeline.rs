//! End-to-end x87 pipeline: decoder-shaped blocks run through the stack
//! lowering pass and then execute on the interpreter against real guest
//! state.

use oxbow_cpu::{flag_loc, layout, CpuState};
use oxbow_interp::{execute_block, NullHost, VecMem};
use oxbow_ir::ops::{MemOffset, StackBinOp};
use oxbow_ir::passes::x87stack::{self, X87Options};
use oxbow_ir::{Instr, IrBuilder, Operand};
use oxbow_softfloat::{convert, SoftFloatState, X80};
use oxbow_types::{OpSize, RegClass};

fn run_lowered(block: &oxbow_ir::IrBlock, state: &mut CpuState, mem: &mut VecMem) {
    let lowered = x87stack::run(block, X87Options::default());
    assert!(lowered.is_lowered());
    lowered.validate().expect("lowered block must validate");
    let mut host = NullHost;
    execute_block(&lowered, state, mem, &mut host).unwrap();
}

fn x87_slot_f64(state: &CpuState, phys: u8) -> f64 {
    let x = X80::from_slot(&state.x87_slot(phys));
    convert::to_f64(&mut SoftFloatState::default(), x)
}

/// fld dword [0x100]; fadd st0, st0; exit. The stack state must land in
/// the architectural top, tag word, and slot file.
#[test]
fn push_add_flushes_architectural_state() {
    let mut b = IrBuilder::new();
    let loaded = b.load_mem(OpSize::B32, RegClass::Fpr, Operand::Const(0x100), MemOffset::NONE);
    let converted = b.f80_cvt_to(OpSize::B32, loaded);
    b.push(Instr::PushStack {
        value: converted,
        original: loaded,
        load_size: OpSize::B32,
        float: true,
    });
    b.push(Instr::StackBin {
        op: StackBinOp::Add,
        dst_slot: 0,
        slot1: 0,
        slot2: 0,
    });
    b.exit_function(Operand::Const(0x2000));
    let block = b.finish();

    let mut state = CpuState::default();
    let mut mem = VecMem::new(0x200);
    mem.load(0x100, &2.5f32.to_bits().to_le_bytes());
    run_lowered(&block, &mut state, &mut mem);

    // One push from top=0 wraps to physical slot 7.
    assert_eq!(state.top(), 7);
    assert_eq!(state.abridged_ftw, 0x80);
    assert_eq!(x87_slot_f64(&state, 7), 5.0);
    assert_eq!(state.rip, 0x2000);
}

/// fld dword; fstp dword: the lowered block must be a plain 4-byte copy
/// (no conversions), and executing it must move the bits.
#[test]
fn load_store_forwarding_end_to_end() {
    let mut b = IrBuilder::new();
    let loaded = b.load_mem(OpSize::B32, RegClass::Fpr, Operand::Const(0x100), MemOffset::NONE);
    let converted = b.f80_cvt_to(OpSize::B32, loaded);
    b.push(Instr::PushStack {
        value: converted,
        original: loaded,
        load_size: OpSize::B32,
        float: true,
    });
    b.push(Instr::StoreStackMem {
        addr: Operand::Const(0x180),
        offset: MemOffset::NONE,
        store_size: OpSize::B32,
    });
    b.push(Instr::PopStackDestroy);
    b.exit_function(Operand::Const(0));
    let block = b.finish();

    let lowered = x87stack::run(&block, X87Options::default());
    let ops: Vec<_> = lowered.blocks[0]
        .instrs
        .iter()
        .map(|i| i.opcode())
        .collect();
    assert!(!ops.contains(&oxbow_ir::Opcode::F80Cvt));
    assert!(!ops.contains(&oxbow_ir::Opcode::F80CvtTo));

    let mut state = CpuState::default();
    let mut mem = VecMem::new(0x200);
    mem.load(0x100, &1.5f32.to_bits().to_le_bytes());
    let mut host = NullHost;
    execute_block(&lowered, &mut state, &mut mem, &mut host).unwrap();

    use oxbow_interp::GuestMem;
    let mut out = [0u8; 4];
    mem.read(0x180, &mut out).unwrap();
    assert_eq!(f32::from_bits(u32::from_le_bytes(out)), 1.5);
}

/// Reading a slot the virtual stack has never seen forces the slow path:
/// the value must come from the architectural slot file through the real
/// top, and a following push must update top and tag bits.
#[test]
fn unknown_slot_read_falls_back_to_architectural_state() {
    // Architectural state: top=3, all tags valid, ST(2) = 7.0 in
    // physical slot (3+2)&7 = 5.
    let mut state = CpuState::default();
    state.set_top(3);
    state.abridged_ftw = 0xFF;
    state.set_x87_slot(5, convert::from_f64(7.0).to_slot());

    let mut b = IrBuilder::new();
    let read = b.alloc_value();
    b.push(Instr::ReadStackValue { dst: read, slot: 2 });
    b.push(Instr::StoreStackToStack { slot: 0 });
    // Store ST(2)'s value to memory through the stack top: push it.
    b.push(Instr::PushStack {
        value: read,
        original: read,
        load_size: OpSize::B128,
        float: false,
    });
    b.push(Instr::StoreStackMem {
        addr: Operand::Const(0x80),
        offset: MemOffset::NONE,
        store_size: OpSize::F80,
    });
    b.exit_function(Operand::Const(0));
    let block = b.finish();

    let mut mem = VecMem::new(0x200);
    run_lowered(&block, &mut state, &mut mem);

    // The push moved top from 3 to 2 and validated its tag bit.
    assert_eq!(state.top(), 2);
    assert_eq!(state.abridged_ftw, 0xFF);
    assert_eq!(x87_slot_f64(&state, 2), 7.0);

    use oxbow_interp::GuestMem;
    let mut raw = [0u8; 10];
    mem.read(0x80, &mut raw).unwrap();
    let stored = X80::from_bytes(&raw);
    assert_eq!(convert::to_f64(&mut SoftFloatState::default(), stored), 7.0);
}

/// FCW precision control must flow into the lowered arithmetic: with
/// PC=64 the small addend disappears, with PC=80 it survives.
#[test]
fn fcw_precision_control_end_to_end() {
    let tiny = X80 {
        sign: false,
        exp: (oxbow_softfloat::EXP_BIAS - 63) as u16,
        sig: 1 << 63,
    };

    for (fcw, expect_exact) in [(0x037Fu16, true), (0x027F, false)] {
        let mut b = IrBuilder::new();
        b.push(Instr::F80LoadFcw {
            value: Operand::Const(fcw as u64),
        });
        let one = b.vector_const(u128::from_le_bytes(X80::ONE.to_slot()));
        let tiny_v = b.vector_const(u128::from_le_bytes(tiny.to_slot()));
        b.push(Instr::PushStack {
            value: one,
            original: one,
            load_size: OpSize::B128,
            float: false,
        });
        b.push(Instr::StackBinValue {
            op: StackBinOp::Add,
            slot: 0,
            value: tiny_v,
            reverse: false,
        });
        b.exit_function(Operand::Const(0));
        let block = b.finish();

        let mut state = CpuState::default();
        let mut mem = VecMem::new(0x10);
        run_lowered(&block, &mut state, &mut mem);

        let result = X80::from_slot(&state.x87_slot(7));
        if expect_exact {
            assert_eq!(result.sig, (1 << 63) | 1, "80-bit precision keeps the bit");
        } else {
            assert_eq!(result, X80::ONE, "64-bit precision rounds it away");
        }
    }
}

/// x87 compare through the pass: the flag mask must reach the consuming
/// integer op.
#[test]
fn cmp_stack_produces_flag_mask() {
    let mut b = IrBuilder::new();
    let small = b.vector_const(u128::from_le_bytes(convert::from_f64(1.0).to_slot()));
    let big = b.vector_const(u128::from_le_bytes(convert::from_f64(2.0).to_slot()));
    for v in [big, small] {
        b.push(Instr::PushStack {
            value: v,
            original: v,
            load_size: OpSize::B128,
            float: false,
        });
    }
    // ST0 = 1.0, ST1 = 2.0: ST0 < ST1.
    let cmp = b.alloc_value();
    b.push(Instr::F80CmpStack { dst: cmp, slot: 1 });
    b.store_context(OpSize::B64, RegClass::Gpr, layout::gpr(0) as u32, cmp);
    b.exit_function(Operand::Const(0));
    let block = b.finish();

    let mut state = CpuState::default();
    let mut mem = VecMem::new(0x10);
    run_lowered(&block, &mut state, &mut mem);
    assert_eq!(state.gpr[0], oxbow_types::FcmpFlags::LT.bits() as u64);
}

/// FPREM through the pass sets the quotient condition codes.
#[test]
fn fprem_condition_codes_end_to_end() {
    let mut b = IrBuilder::new();
    let divisor = b.vector_const(u128::from_le_bytes(convert::from_f64(3.0).to_slot()));
    let dividend = b.vector_const(u128::from_le_bytes(convert::from_f64(11.0).to_slot()));
    for v in [divisor, dividend] {
        b.push(Instr::PushStack {
            value: v,
            original: v,
            load_size: OpSize::B128,
            float: false,
        });
    }
    // FPREM: ST0 = ST0 rem ST1 = 11 rem 3 = 2, quotient 3 (0b011).
    b.push(Instr::StackBin {
        op: StackBinOp::Prem,
        dst_slot: 0,
        slot1: 0,
        slot2: 1,
    });
    b.exit_function(Operand::Const(0));
    let block = b.finish();

    let mut state = CpuState::default();
    let mut mem = VecMem::new(0x10);
    run_lowered(&block, &mut state, &mut mem);

    assert_eq!(x87_slot_f64(&state, state.st_phys(0)), 2.0);
    assert_eq!(state.flags[flag_loc::X87_C0], 0);
    assert_eq!(state.flags[flag_loc::X87_C3], 1);
    assert_eq!(state.flags[flag_loc::X87_C1], 1);
    assert_eq!(state.flags[flag_loc::X87_C2], 0);
}

/// Pops must clear tag bits at the popped slot's rotated position.
#[test]
fn pop_clears_rotated_tag_bit() {
    let mut b = IrBuilder::new();
    let v = b.vector_const(u128::from_le_bytes(convert::from_f64(4.0).to_slot()));
    b.push(Instr::PushStack {
        value: v,
        original: v,
        load_size: OpSize::B128,
        float: false,
    });
    b.push(Instr::PopStackDestroy);
    b.exit_function(Operand::Const(0));
    let block = b.finish();

    let mut state = CpuState::default();
    state.set_top(3);
    state.abridged_ftw = 0xFF;
    let mut mem = VecMem::new(0x10);
    run_lowered(&block, &mut state, &mut mem);

    // Push to slot 2, pop back: top restored, tag bit 2 clear.
    assert_eq!(state.top(), 3);
    assert_eq!(state.abridged_ftw, 0xFB);
}
