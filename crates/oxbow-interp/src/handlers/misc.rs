//! Fences, rounding-mode management, and the small host-query ops.

use super::set;
use crate::{HandlerTable, Interp, InterpError};
use oxbow_ir::{Instr, Opcode};

pub(crate) fn register(table: &mut HandlerTable) {
    set(table, Opcode::Fence, fence);
    set(table, Opcode::GetRoundingMode, get_rounding_mode);
    set(table, Opcode::SetRoundingMode, set_rounding_mode);
    set(table, Opcode::Print, print);
    set(table, Opcode::ProcessorId, processor_id);
    set(table, Opcode::CycleCounter, cycle_counter);
    set(table, Opcode::RdRand, rdrand);
}

fn fence(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::Fence { kind } = *instr else {
        unreachable!()
    };
    interp.mem.fence(kind);
    Ok(())
}

fn get_rounding_mode(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::GetRoundingMode { dst } = *instr else {
        unreachable!()
    };
    interp.ssa.write_u64(dst, interp.state.rounding_mode as u64);
    Ok(())
}

fn set_rounding_mode(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::SetRoundingMode { ref value } = *instr else {
        unreachable!()
    };
    interp.state.rounding_mode = (interp.ssa.operand(value) & 0b111) as u8;
    Ok(())
}

fn print(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::Print { size, ref value } = *instr else {
        unreachable!()
    };
    match value {
        oxbow_ir::Operand::Value(v) if size.bytes() > 8 => {
            let bytes = interp.ssa.read_bytes(*v, size.bytes());
            tracing::info!(?bytes, "print");
        }
        _ => {
            let v = interp.ssa.operand_sized(value, size);
            tracing::info!(value = format_args!("{v:#x}"), "print");
        }
    }
    Ok(())
}

fn processor_id(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::ProcessorId { dst } = *instr else {
        unreachable!()
    };
    // (node << 12) | cpu, as reported by the host.
    let id = interp.host.processor_id();
    interp.ssa.write_u64(dst, id);
    Ok(())
}

fn cycle_counter(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::CycleCounter { dst } = *instr else {
        unreachable!()
    };
    let t = interp.host.cycle_counter();
    interp.ssa.write_u64(dst, t);
    Ok(())
}

fn rdrand(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::RdRand { dst } = *instr else {
        unreachable!()
    };
    let mut bytes = [0u8; 8];
    let ok = interp.host.random(&mut bytes);
    // Lane 0 is the value, lane 1 reports success.
    let mut out = [0u8; 16];
    if ok {
        out[..8].copy_from_slice(&bytes);
        out[8] = 1;
    }
    interp.ssa.write_bytes(dst, &out);
    Ok(())
}
