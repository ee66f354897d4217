//! Atomic compare-and-swap and read-modify-write handlers.
//!
//! Every operation is sequentially consistent at its address. The
//! read-modify-write forms are expressed as CAS loops over the memory
//! trait, so a shared backing gets real atomicity without the core
//! knowing how.

use super::set;
use crate::{HandlerTable, Interp, InterpError};
use oxbow_ir::ops::AtomicOpKind;
use oxbow_ir::{Instr, Opcode, Operand};
use oxbow_types::OpSize;

pub(crate) fn register(table: &mut HandlerTable) {
    set(table, Opcode::Cas, cas);
    set(table, Opcode::CasPair, cas_pair);
    set(table, Opcode::AtomicOp, atomic_op);
    set(table, Opcode::AtomicFetchOp, atomic_fetch_op);
}

fn apply(op: AtomicOpKind, current: u64, value: u64) -> u64 {
    match op {
        AtomicOpKind::Add => current.wrapping_add(value),
        AtomicOpKind::Sub => current.wrapping_sub(value),
        AtomicOpKind::And => current & value,
        AtomicOpKind::Or => current | value,
        AtomicOpKind::Xor => current ^ value,
        AtomicOpKind::Swap => value,
        AtomicOpKind::Neg => current.wrapping_neg(),
    }
}

fn cas(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::Cas {
        dst,
        size,
        ref expected,
        ref desired,
        ref addr,
    } = *instr
    else {
        unreachable!()
    };
    let len = size.bytes();
    debug_assert!(matches!(size, OpSize::B8 | OpSize::B16 | OpSize::B32 | OpSize::B64));
    let ea = interp.ssa.operand(addr);
    let expected_v = interp.ssa.operand_sized(expected, size).to_le_bytes();
    let desired_v = interp.ssa.operand_sized(desired, size).to_le_bytes();
    let mut prev = [0u8; 8];
    interp
        .mem
        .cas(ea, &expected_v[..len], &desired_v[..len], &mut prev[..len])?;
    // The destination always receives the previous memory value.
    interp.ssa.write_u64(dst, u64::from_le_bytes(prev));
    Ok(())
}

fn cas_pair(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::CasPair {
        dst,
        size,
        ref expected_lo,
        ref expected_hi,
        ref desired_lo,
        ref desired_hi,
        ref addr,
    } = *instr
    else {
        unreachable!()
    };
    debug_assert!(matches!(size, OpSize::B32 | OpSize::B64));
    let len = size.bytes();
    let ea = interp.ssa.operand(addr);

    let mut expected = [0u8; 16];
    let mut desired = [0u8; 16];
    expected[..len].copy_from_slice(&interp.ssa.operand_sized(expected_lo, size).to_le_bytes()[..len]);
    expected[len..2 * len]
        .copy_from_slice(&interp.ssa.operand_sized(expected_hi, size).to_le_bytes()[..len]);
    desired[..len].copy_from_slice(&interp.ssa.operand_sized(desired_lo, size).to_le_bytes()[..len]);
    desired[len..2 * len]
        .copy_from_slice(&interp.ssa.operand_sized(desired_hi, size).to_le_bytes()[..len]);

    let mut prev = [0u8; 16];
    interp
        .mem
        .cas(ea, &expected[..2 * len], &desired[..2 * len], &mut prev[..2 * len])?;
    interp.ssa.write_bytes(dst, &prev[..2 * len]);
    Ok(())
}

/// CAS loop shared by the fetch and non-fetch forms; returns the value
/// observed before the update.
fn rmw(
    interp: &mut Interp<'_>,
    op: AtomicOpKind,
    size: OpSize,
    addr: &Operand,
    value: &Operand,
) -> Result<u64, InterpError> {
    let len = size.bytes();
    let ea = interp.ssa.operand(addr);
    let operand = interp.ssa.operand_sized(value, size);

    let mut current = [0u8; 8];
    interp.mem.read(ea, &mut current[..len])?;
    loop {
        let current_v = u64::from_le_bytes(current);
        let new_v = size.truncate(apply(op, current_v, operand));
        let mut prev = [0u8; 8];
        let swapped = interp.mem.cas(
            ea,
            &current[..len],
            &new_v.to_le_bytes()[..len],
            &mut prev[..len],
        )?;
        if swapped {
            return Ok(current_v);
        }
        current = prev;
    }
}

fn atomic_op(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::AtomicOp {
        op,
        size,
        ref addr,
        ref value,
    } = *instr
    else {
        unreachable!()
    };
    rmw(interp, op, size, addr, value)?;
    Ok(())
}

fn atomic_fetch_op(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::AtomicFetchOp {
        dst,
        op,
        size,
        ref addr,
        ref value,
    } = *instr
    else {
        unreachable!()
    };
    let prev = rmw(interp, op, size, addr, value)?;
    interp.ssa.write_scalar(dst, size, prev);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{execute_block, GuestMem, NullHost, VecMem};
    use oxbow_cpu::{layout, CpuState};
    use oxbow_ir::IrBuilder;
    use oxbow_types::RegClass;

    fn run(block: &oxbow_ir::IrBlock, mem: &mut VecMem) -> CpuState {
        let mut state = CpuState::default();
        let mut host = NullHost;
        execute_block(block, &mut state, mem, &mut host).unwrap();
        state
    }

    fn read_u32(mem: &mut VecMem, addr: u64) -> u32 {
        let mut buf = [0u8; 4];
        mem.read(addr, &mut buf).unwrap();
        u32::from_le_bytes(buf)
    }

    #[test]
    fn cas_success_and_failure_return_previous() {
        let mut b = IrBuilder::new();
        let ok = b.alloc_value();
        b.push(Instr::Cas {
            dst: ok,
            size: OpSize::B32,
            expected: Operand::Const(5),
            desired: Operand::Const(9),
            addr: Operand::Const(0x10),
        });
        b.store_context(OpSize::B64, RegClass::Gpr, layout::gpr(0) as u32, ok);
        let fail = b.alloc_value();
        b.push(Instr::Cas {
            dst: fail,
            size: OpSize::B32,
            expected: Operand::Const(5),
            desired: Operand::Const(1),
            addr: Operand::Const(0x10),
        });
        b.store_context(OpSize::B64, RegClass::Gpr, layout::gpr(1) as u32, fail);
        b.exit_function(Operand::Const(0));
        let block = b.finish();

        let mut mem = VecMem::new(0x40);
        mem.load(0x10, &5u32.to_le_bytes());
        let state = run(&block, &mut mem);
        assert_eq!(state.gpr[0], 5, "successful CAS returns the old value");
        assert_eq!(state.gpr[1], 9, "failed CAS returns the observed value");
        assert_eq!(read_u32(&mut mem, 0x10), 9);
    }

    #[test]
    fn fetch_add_returns_previous() {
        let mut b = IrBuilder::new();
        let prev = b.alloc_value();
        b.push(Instr::AtomicFetchOp {
            dst: prev,
            op: AtomicOpKind::Add,
            size: OpSize::B32,
            addr: Operand::Const(0x20),
            value: Operand::Const(3),
        });
        b.store_context(OpSize::B64, RegClass::Gpr, layout::gpr(0) as u32, prev);
        b.exit_function(Operand::Const(0));
        let block = b.finish();

        let mut mem = VecMem::new(0x40);
        mem.load(0x20, &100u32.to_le_bytes());
        let state = run(&block, &mut mem);
        assert_eq!(state.gpr[0], 100);
        assert_eq!(read_u32(&mut mem, 0x20), 103);
    }

    #[test]
    fn atomic_neg_ignores_operand() {
        let mut b = IrBuilder::new();
        b.push(Instr::AtomicOp {
            op: AtomicOpKind::Neg,
            size: OpSize::B16,
            addr: Operand::Const(0x8),
            value: Operand::Const(0),
        });
        b.exit_function(Operand::Const(0));
        let block = b.finish();

        let mut mem = VecMem::new(0x40);
        mem.load(0x8, &7u16.to_le_bytes());
        run(&block, &mut mem);
        let mut buf = [0u8; 2];
        mem.read(0x8, &mut buf).unwrap();
        assert_eq!(i16::from_le_bytes(buf), -7);
    }

    #[test]
    fn cas_pair_swaps_both_elements() {
        let mut b = IrBuilder::new();
        let prev = b.alloc_value();
        b.push(Instr::CasPair {
            dst: prev,
            size: OpSize::B64,
            expected_lo: Operand::Const(1),
            expected_hi: Operand::Const(2),
            desired_lo: Operand::Const(0xAA),
            desired_hi: Operand::Const(0xBB),
            addr: Operand::Const(0x0),
        });
        b.exit_function(Operand::Const(0));
        let block = b.finish();

        let mut mem = VecMem::new(0x40);
        mem.load(0, &1u64.to_le_bytes());
        mem.load(8, &2u64.to_le_bytes());
        run(&block, &mut mem);
        let mut buf = [0u8; 8];
        mem.read(0, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0xAA);
        mem.read(8, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0xBB);
    }

    #[test]
    fn swap_and_xor() {
        let mut b = IrBuilder::new();
        let prev = b.alloc_value();
        b.push(Instr::AtomicFetchOp {
            dst: prev,
            op: AtomicOpKind::Swap,
            size: OpSize::B64,
            addr: Operand::Const(0x18),
            value: Operand::Const(0x42),
        });
        b.store_context(OpSize::B64, RegClass::Gpr, layout::gpr(2) as u32, prev);
        b.push(Instr::AtomicOp {
            op: AtomicOpKind::Xor,
            size: OpSize::B64,
            addr: Operand::Const(0x18),
            value: Operand::Const(0xFF),
        });
        b.exit_function(Operand::Const(0));
        let block = b.finish();

        let mut mem = VecMem::new(0x40);
        mem.load(0x18, &0x1234u64.to_le_bytes());
        let state = run(&block, &mut mem);
        assert_eq!(state.gpr[2], 0x1234);
        let mut buf = [0u8; 8];
        mem.read(0x18, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0x42 ^ 0xFF);
    }
}
