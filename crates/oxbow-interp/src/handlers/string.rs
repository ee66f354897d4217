//! SSE4.2 string comparison (PCMPESTRI/M, PCMPISTRI/M class).
//!
//! The result word carries the intermediate bitmask in its low 16 bits
//! and synthetic NZCV in the top four bits (SF=31, ZF=30, CF=29, OF=28),
//! so JIT backends can move it straight into host flags.

use super::set;
use crate::{HandlerTable, Interp, InterpError};
use oxbow_ir::{Instr, Opcode};

pub(crate) fn register(table: &mut HandlerTable) {
    set(table, Opcode::VPCmpEstrx, vpcmpestrx);
    set(table, Opcode::VPCmpIstrx, vpcmpistrx);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggregation {
    EqualAny,
    Ranges,
    EqualEach,
    EqualOrdered,
}

fn uses_words(control: u16) -> bool {
    control & 1 != 0
}

/// Element `index` of the vector, widened per the control's data type.
fn element(vec: u128, index: i32, control: u16) -> i32 {
    let bytes = vec.to_le_bytes();
    match control & 0b11 {
        0b00 => bytes[index as usize] as i32,
        0b01 => {
            u16::from_le_bytes([bytes[2 * index as usize], bytes[2 * index as usize + 1]]) as i32
        }
        0b10 => bytes[index as usize] as i8 as i32,
        _ => {
            i16::from_le_bytes([bytes[2 * index as usize], bytes[2 * index as usize + 1]]) as i32
        }
    }
}

/// Explicit length from a register, saturated to the element count.
/// Bit 8 of the control selects a 64-bit length register.
fn explicit_length(reg: u64, control: u16) -> i32 {
    let value = if (control >> 8) & 1 != 0 {
        reg as i64
    } else {
        reg as u32 as i32 as i64
    };
    let limit: i64 = if uses_words(control) { 8 } else { 16 };
    if value < -limit || value > limit {
        limit as i32
    } else {
        value.unsigned_abs() as i32
    }
}

/// Implicit length: index of the first NUL element, or the element count.
fn implicit_length(vec: u128, control: u16) -> i32 {
    let limit = if uses_words(control) { 8 } else { 16 };
    for i in 0..limit {
        if element(vec, i, control) == 0 {
            return i;
        }
    }
    limit
}

fn equal_any(lhs: u128, valid_lhs: i32, rhs: u128, valid_rhs: i32, control: u16) -> u32 {
    let mut result = 0u32;
    for j in (0..=valid_rhs).rev() {
        result <<= 1;
        let rhs_value = element(rhs, j, control);
        for i in (0..=valid_lhs).rev() {
            result |= (rhs_value == element(lhs, i, control)) as u32;
        }
    }
    result
}

fn ranges(lhs: u128, valid_lhs: i32, rhs: u128, valid_rhs: i32, control: u16) -> u32 {
    let mut result = 0u32;
    for j in (0..=valid_rhs).rev() {
        result <<= 1;
        let value = element(rhs, j, control);
        // lhs supplies lower/upper bound pairs.
        let mut i = (valid_lhs - 1) | 1;
        while i >= 0 {
            let upper = element(lhs, i, control);
            let lower = element(lhs, i - 1, control);
            result |= (lower <= value && value <= upper) as u32;
            i -= 2;
        }
    }
    result
}

fn equal_each(lhs: u128, valid_lhs: i32, rhs: u128, valid_rhs: i32, control: u16) -> u32 {
    let upper_limit = (16 >> (control & 1)) - 1;
    let max_valid = valid_lhs.max(valid_rhs);
    let min_valid = valid_lhs.min(valid_rhs);

    // Elements past both string ends compare true; the gap between the
    // two lengths compares false. Build those bits up front and shift
    // them into place as the loop emits the real comparisons.
    let mut result = (1u32 << (upper_limit - max_valid)) - 1;
    result <<= max_valid - min_valid;

    for i in (0..=min_valid).rev() {
        result <<= 1;
        result |= (element(lhs, i, control) == element(rhs, i, control)) as u32;
    }
    result
}

fn equal_ordered(lhs: u128, valid_lhs: i32, rhs: u128, valid_rhs: i32, control: u16) -> u32 {
    let upper_limit = (16 >> (control & 1)) - 1;

    // An empty needle matches everywhere.
    if valid_lhs == -1 {
        return (2u32 << upper_limit) - 1;
    }

    let mut result = 0u32;
    let initial = if valid_rhs == upper_limit {
        valid_rhs
    } else {
        valid_rhs - valid_lhs
    };
    for j in (0..=initial).rev() {
        result <<= 1;
        let mut value = 1u32;
        let start = (valid_rhs - j).min(valid_lhs);
        for i in (0..=start).rev() {
            value &= (element(lhs, i, control) == element(rhs, i + j, control)) as u32;
        }
        result |= value;
    }
    result
}

fn polarity(value: u32, control: u16, upper_limit: i32, valid_rhs: i32) -> u32 {
    match (control >> 4) & 0b11 {
        0b01 => value ^ ((2u32 << upper_limit) - 1),
        0b11 => value ^ ((1u32 << (valid_rhs + 1)) - 1),
        // Positive and positive-masked are both the identity.
        _ => value,
    }
}

/// Shared main body of the explicit and implicit variants.
fn main_body(lhs: u128, valid_lhs: i32, rhs: u128, valid_rhs: i32, control: u16) -> u32 {
    let aggregation = match (control >> 2) & 0b11 {
        0b00 => Aggregation::EqualAny,
        0b01 => Aggregation::Ranges,
        0b10 => Aggregation::EqualEach,
        _ => Aggregation::EqualOrdered,
    };
    let intermediate = match aggregation {
        Aggregation::EqualAny => equal_any(lhs, valid_lhs, rhs, valid_rhs, control),
        Aggregation::Ranges => ranges(lhs, valid_lhs, rhs, valid_rhs, control),
        Aggregation::EqualEach => equal_each(lhs, valid_lhs, rhs, valid_rhs, control),
        Aggregation::EqualOrdered => equal_ordered(lhs, valid_lhs, rhs, valid_rhs, control),
    };

    let upper_limit = (16 >> (control & 1)) - 1;

    // Synthetic flags: [SF | ZF | CF | OF] in the top nibble.
    let mut flags = 0u32;
    if valid_rhs < upper_limit {
        flags |= 0b0100;
    }
    if valid_lhs < upper_limit {
        flags |= 0b1000;
    }

    let result = polarity(intermediate, control, upper_limit, valid_rhs);
    if result != 0 {
        flags |= 0b0010;
    }
    if result & 1 != 0 {
        flags |= 0b0001;
    }

    result | (flags << 28)
}

/// Explicit-length variant: lengths come from two integer registers.
pub fn pcmpestr(lhs_len: u64, rhs_len: u64, lhs: u128, rhs: u128, control: u16) -> u32 {
    let valid_lhs = explicit_length(lhs_len, control) - 1;
    let valid_rhs = explicit_length(rhs_len, control) - 1;
    main_body(lhs, valid_lhs, rhs, valid_rhs, control)
}

/// Implicit-length variant: lengths come from scanning for NUL elements.
pub fn pcmpistr(lhs: u128, rhs: u128, control: u16) -> u32 {
    let valid_lhs = implicit_length(lhs, control) - 1;
    let valid_rhs = implicit_length(rhs, control) - 1;
    main_body(lhs, valid_lhs, rhs, valid_rhs, control)
}

fn vpcmpestrx(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VPCmpEstrx {
        dst,
        lhs,
        rhs,
        ref lhs_len,
        ref rhs_len,
        control,
    } = *instr
    else {
        unreachable!()
    };
    let lhs_v = interp.ssa.read_u128(lhs);
    let rhs_v = interp.ssa.read_u128(rhs);
    let lhs_len = interp.ssa.operand(lhs_len);
    let rhs_len = interp.ssa.operand(rhs_len);
    let result = pcmpestr(lhs_len, rhs_len, lhs_v, rhs_v, control);
    interp.ssa.write_u64(dst, result as u64);
    Ok(())
}

fn vpcmpistrx(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VPCmpIstrx {
        dst,
        lhs,
        rhs,
        control,
    } = *instr
    else {
        unreachable!()
    };
    let lhs_v = interp.ssa.read_u128(lhs);
    let rhs_v = interp.ssa.read_u128(rhs);
    let result = pcmpistr(lhs_v, rhs_v, control);
    interp.ssa.write_u64(dst, result as u64);
    Ok(())
}
