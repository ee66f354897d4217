//! Context, architectural-register, and guest-memory access handlers.

use super::set;
use crate::{HandlerTable, Interp, InterpError};
use oxbow_ir::ops::MemOffset;
use oxbow_ir::{Instr, Opcode, Operand};
use oxbow_types::{ArchReg, OpSize};

pub(crate) fn register(table: &mut HandlerTable) {
    set(table, Opcode::LoadContext, load_context);
    set(table, Opcode::StoreContext, store_context);
    set(table, Opcode::LoadContextIndexed, load_context_indexed);
    set(table, Opcode::StoreContextIndexed, store_context_indexed);
    set(table, Opcode::LoadRegister, load_register);
    set(table, Opcode::StoreRegister, store_register);
    set(table, Opcode::LoadMem, load_mem);
    set(table, Opcode::StoreMem, store_mem);
    set(table, Opcode::StoreMemPair, store_mem_pair);
    set(table, Opcode::CacheLineClear, cache_line_clear);
}

/// Effective address: `base + extend(index) * scale`.
pub(crate) fn effective_addr(interp: &Interp<'_>, addr: &Operand, offset: &MemOffset) -> u64 {
    let base = interp.ssa.operand(addr);
    match &offset.index {
        None => base,
        Some(index) => {
            let extended = offset.ty.extend(interp.ssa.operand(index));
            base.wrapping_add((extended as u64).wrapping_mul(offset.scale as u64))
        }
    }
}

/// Materialize a GPR operand or SSA slot as `size` bytes.
fn value_bytes(interp: &Interp<'_>, value: &Operand, size: OpSize, buf: &mut [u8; 32]) {
    match value {
        Operand::Const(c) => buf[..8].copy_from_slice(&c.to_le_bytes()),
        Operand::Value(v) => {
            let len = size.bytes().min(32);
            buf[..len].copy_from_slice(interp.ssa.read_bytes(*v, len));
        }
    }
}

fn load_context(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::LoadContext {
        dst, size, offset, ..
    } = *instr
    else {
        unreachable!()
    };
    let mut buf = [0u8; 32];
    let len = size.bytes();
    interp.state.read_bytes(offset as usize, &mut buf[..len]);
    interp.ssa.write_bytes(dst, &buf[..len]);
    Ok(())
}

fn store_context(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::StoreContext {
        size,
        offset,
        ref value,
        ..
    } = *instr
    else {
        unreachable!()
    };
    let mut buf = [0u8; 32];
    value_bytes(interp, value, size, &mut buf);
    interp.state.write_bytes(offset as usize, &buf[..size.bytes()]);
    Ok(())
}

fn load_context_indexed(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::LoadContextIndexed {
        dst,
        size,
        base_offset,
        stride,
        ref index,
        ..
    } = *instr
    else {
        unreachable!()
    };
    let idx = interp.ssa.operand(index);
    let offset = base_offset as usize + (idx as usize) * stride as usize;
    let mut buf = [0u8; 32];
    let len = size.bytes();
    interp.state.read_bytes(offset, &mut buf[..len]);
    interp.ssa.write_bytes(dst, &buf[..len]);
    Ok(())
}

fn store_context_indexed(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::StoreContextIndexed {
        size,
        base_offset,
        stride,
        ref index,
        ref value,
        ..
    } = *instr
    else {
        unreachable!()
    };
    let idx = interp.ssa.operand(index);
    let offset = base_offset as usize + (idx as usize) * stride as usize;
    let mut buf = [0u8; 32];
    value_bytes(interp, value, size, &mut buf);
    interp.state.write_bytes(offset, &buf[..size.bytes()]);
    Ok(())
}

fn load_register(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::LoadRegister { dst, reg } = *instr else {
        unreachable!()
    };
    let value = match reg {
        ArchReg::Pf => interp.state.pf_raw,
        ArchReg::Af => interp.state.af_raw,
        ArchReg::Df => interp.state.df as u64,
        gpr => interp.state.gpr[gpr.as_u8() as usize],
    };
    interp.ssa.write_u64(dst, value);
    Ok(())
}

fn store_register(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::StoreRegister { reg, ref value } = *instr else {
        unreachable!()
    };
    let v = interp.ssa.operand(value);
    match reg {
        ArchReg::Pf => interp.state.pf_raw = v,
        ArchReg::Af => interp.state.af_raw = v,
        ArchReg::Df => interp.state.df = v as i64,
        gpr => interp.state.gpr[gpr.as_u8() as usize] = v,
    }
    Ok(())
}

fn load_mem(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::LoadMem {
        dst,
        size,
        ref addr,
        ref offset,
        tso,
        ..
    } = *instr
    else {
        unreachable!()
    };
    let ea = effective_addr(interp, addr, offset);
    let mut buf = [0u8; 32];
    let len = size.bytes();
    if tso {
        interp.mem.read_tso(ea, &mut buf[..len])?;
    } else {
        interp.mem.read(ea, &mut buf[..len])?;
    }
    interp.ssa.write_bytes(dst, &buf[..len]);
    Ok(())
}

fn store_mem(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::StoreMem {
        size,
        ref addr,
        ref offset,
        ref value,
        tso,
        ..
    } = *instr
    else {
        unreachable!()
    };
    let ea = effective_addr(interp, addr, offset);
    let mut buf = [0u8; 32];
    value_bytes(interp, value, size, &mut buf);
    if tso {
        interp.mem.write_tso(ea, &buf[..size.bytes()])?;
    } else {
        interp.mem.write(ea, &buf[..size.bytes()])?;
    }
    Ok(())
}

fn store_mem_pair(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::StoreMemPair {
        size,
        ref addr,
        imm_offset,
        ref value1,
        ref value2,
        ..
    } = *instr
    else {
        unreachable!()
    };
    let base = interp
        .ssa
        .operand(addr)
        .wrapping_add(imm_offset as i64 as u64);
    let len = size.bytes();
    let mut buf = [0u8; 32];
    value_bytes(interp, value1, size, &mut buf);
    interp.mem.write(base, &buf[..len])?;
    value_bytes(interp, value2, size, &mut buf);
    interp.mem.write(base.wrapping_add(len as u64), &buf[..len])?;
    Ok(())
}

fn cache_line_clear(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::CacheLineClear { ref addr } = *instr else {
        unreachable!()
    };
    let ea = interp.ssa.operand(addr);
    interp.mem.cache_line_clear(ea);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{execute_block, NullHost, VecMem};
    use oxbow_cpu::{layout, CpuState};
    use oxbow_ir::ops::MemOffset;
    use oxbow_ir::{Instr, IrBuilder, Operand};
    use oxbow_types::{ArchReg, MemOffsetType, OpSize, RegClass};

    fn run(block: &oxbow_ir::IrBlock, state: &mut CpuState, mem: &mut VecMem) {
        let mut host = NullHost;
        execute_block(block, state, mem, &mut host).unwrap();
    }

    #[test]
    fn context_roundtrip_vector() {
        let mut b = IrBuilder::new();
        let v = b.vector_const(0x1122_3344_5566_7788_99AA_BBCC_DDEE_FF00);
        b.store_context(OpSize::B128, RegClass::Fpr, layout::vector(2) as u32, v);
        let back = b.load_context(OpSize::B128, RegClass::Fpr, layout::vector(2) as u32);
        b.store_context(OpSize::B128, RegClass::Fpr, layout::vector(3) as u32, back);
        b.exit_function(Operand::Const(0));
        let block = b.finish();
        let mut state = CpuState::default();
        let mut mem = VecMem::new(0x10);
        run(&block, &mut state, &mut mem);
        assert_eq!(
            state.vectors[3].u128_at(0),
            0x1122_3344_5566_7788_99AA_BBCC_DDEE_FF00
        );
    }

    #[test]
    fn context_indexed_strides() {
        // Store into x87 slot 5 through the indexed form.
        let mut b = IrBuilder::new();
        let v = b.vector_const(0xABCD);
        b.store_context_indexed(
            OpSize::B128,
            RegClass::Fpr,
            layout::X87 as u32,
            layout::X87_STRIDE as u32,
            Operand::Const(5),
            v,
        );
        b.exit_function(Operand::Const(0));
        let block = b.finish();
        let mut state = CpuState::default();
        let mut mem = VecMem::new(0x10);
        run(&block, &mut state, &mut mem);
        assert_eq!(state.x87[5][0], 0xCD);
        assert_eq!(state.x87[5][1], 0xAB);
        assert_eq!(state.x87[4], [0; 16]);
    }

    #[test]
    fn scaled_index_addressing() {
        let mut b = IrBuilder::new();
        let loaded = b.load_mem(
            OpSize::B32,
            RegClass::Gpr,
            Operand::Const(0x10),
            MemOffset {
                index: Some(Operand::Const(0xFFFF_FFFF)), // -1 when sign-extended
                ty: MemOffsetType::Sxtw,
                scale: 4,
            },
        );
        b.store_context(OpSize::B64, RegClass::Gpr, layout::gpr(0) as u32, loaded);
        b.exit_function(Operand::Const(0));
        let block = b.finish();
        let mut state = CpuState::default();
        let mut mem = VecMem::new(0x20);
        mem.load(0xC, &0xDEAD_BEEFu32.to_le_bytes());
        run(&block, &mut state, &mut mem);
        assert_eq!(state.gpr[0], 0xDEAD_BEEF);
    }

    #[test]
    fn store_load_roundtrip_memory() {
        let mut b = IrBuilder::new();
        b.store_mem(
            OpSize::B64,
            RegClass::Gpr,
            Operand::Const(0x40),
            MemOffset::NONE,
            Operand::Const(0x0123_4567_89AB_CDEF),
        );
        let back = b.load_mem(OpSize::B64, RegClass::Gpr, Operand::Const(0x40), MemOffset::NONE);
        b.store_context(OpSize::B64, RegClass::Gpr, layout::gpr(3) as u32, back);
        b.exit_function(Operand::Const(0));
        let block = b.finish();
        let mut state = CpuState::default();
        let mut mem = VecMem::new(0x100);
        run(&block, &mut state, &mut mem);
        assert_eq!(state.gpr[3], 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn pseudo_registers_are_separate_from_gprs() {
        let mut b = IrBuilder::new();
        b.push(Instr::StoreRegister {
            reg: ArchReg::Pf,
            value: Operand::Const(0x55),
        });
        b.push(Instr::StoreRegister {
            reg: ArchReg::Rax,
            value: Operand::Const(7),
        });
        let pf = b.alloc_value();
        b.push(Instr::LoadRegister {
            dst: pf,
            reg: ArchReg::Pf,
        });
        b.store_context(OpSize::B64, RegClass::Gpr, layout::gpr(1) as u32, pf);
        b.exit_function(Operand::Const(0));
        let block = b.finish();
        let mut state = CpuState::default();
        let mut mem = VecMem::new(0x10);
        run(&block, &mut state, &mut mem);
        assert_eq!(state.gpr[1], 0x55);
        assert_eq!(state.gpr[0], 7);
        assert_eq!(state.pf_raw, 0x55);
    }

    #[test]
    fn memory_fault_surfaces() {
        let mut b = IrBuilder::new();
        let v = b.load_mem(
            OpSize::B64,
            RegClass::Gpr,
            Operand::Const(0xFFFF_0000),
            MemOffset::NONE,
        );
        b.store_context(OpSize::B64, RegClass::Gpr, layout::gpr(0) as u32, v);
        b.exit_function(Operand::Const(0));
        let block = b.finish();
        let mut state = CpuState::default();
        let mut mem = VecMem::new(0x10);
        let mut host = NullHost;
        assert!(execute_block(&block, &mut state, &mut mem, &mut host).is_err());
    }

    #[test]
    fn store_pair_writes_adjacent() {
        let mut b = IrBuilder::new();
        b.push(Instr::StoreMemPair {
            size: OpSize::B64,
            class: RegClass::Gpr,
            addr: Operand::Const(0x20),
            imm_offset: 8,
            value1: Operand::Const(0x1111),
            value2: Operand::Const(0x2222),
        });
        b.exit_function(Operand::Const(0));
        let block = b.finish();
        let mut state = CpuState::default();
        let mut mem = VecMem::new(0x100);
        run(&block, &mut state, &mut mem);
        let mut buf = [0u8; 8];
        use crate::GuestMem;
        mem.read(0x28, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0x1111);
        mem.read(0x30, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0x2222);
    }
}
