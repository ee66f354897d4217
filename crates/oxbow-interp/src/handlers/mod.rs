//! Opcode handlers, grouped the way the op catalogue groups them. Each
//! module contributes its entries to the dispatch table through a
//! `register` function.

pub(crate) mod alu;
pub(crate) mod atomic;
pub(crate) mod branch;
pub(crate) mod convert;
pub(crate) mod f80;
pub(crate) mod memory;
pub(crate) mod misc;
pub(crate) mod string;
pub(crate) mod vector;

use crate::{HandlerTable, Interp, InterpError};
use oxbow_ir::{Instr, Opcode};

/// Sign-extend the low `size` bytes of `v`.
pub(crate) fn sext(size: oxbow_types::OpSize, v: u64) -> i64 {
    use oxbow_types::OpSize;
    match size {
        OpSize::B8 => v as u8 as i8 as i64,
        OpSize::B16 => v as u16 as i16 as i64,
        OpSize::B32 => v as u32 as i32 as i64,
        _ => v as i64,
    }
}

/// Shorthand for wiring one opcode to one handler.
pub(crate) fn set(
    table: &mut HandlerTable,
    op: Opcode,
    handler: for<'a, 'b> fn(&'a mut Interp<'b>, &'a Instr) -> Result<(), InterpError>,
) {
    table[op as usize] = handler;
}
