//! F80 soft-float handlers and their reduced-precision f64 twins.
//!
//! Every operation seeds a fresh by-value soft-float state from the FCW
//! installed by the last F80LoadFcw; sticky exception flags accumulate on
//! the interpreter and NaN detection surfaces through the IE bit of the
//! x87 status word. Transcendentals force 80-bit precision, matching
//! hardware's disregard of precision control for them.

use super::set;
use crate::{HandlerTable, Interp, InterpError};
use oxbow_cpu::flag_loc;
use oxbow_ir::ops::{F64BinOp, F64UnOp, F80BinOp, F80UnOp};
use oxbow_ir::{Instr, Opcode, ValueId};
use oxbow_softfloat::{arith, bcd, convert, trans, SoftFloatState, X80};
use oxbow_types::{FcmpFlags, OpSize, RoundMode};

pub(crate) fn register(table: &mut HandlerTable) {
    set(table, Opcode::F80Bin, f80_bin);
    set(table, Opcode::F80Un, f80_un);
    set(table, Opcode::F80Cmp, f80_cmp);
    set(table, Opcode::F80Cvt, f80_cvt);
    set(table, Opcode::F80CvtInt, f80_cvt_int);
    set(table, Opcode::F80CvtTo, f80_cvt_to);
    set(table, Opcode::F80CvtToInt, f80_cvt_to_int);
    set(table, Opcode::F80BcdLoad, f80_bcd_load);
    set(table, Opcode::F80BcdStore, f80_bcd_store);
    set(table, Opcode::F80XtractExp, f80_xtract_exp);
    set(table, Opcode::F80XtractSig, f80_xtract_sig);
    set(table, Opcode::F80LoadFcw, f80_load_fcw);
    set(table, Opcode::F64Bin, f64_bin);
    set(table, Opcode::F64Un, f64_un);
}

fn read_x80(interp: &Interp<'_>, id: ValueId) -> X80 {
    let bytes = interp.ssa.read_bytes(id, 16);
    X80::from_slot(bytes.try_into().expect("slot holds at least 16 bytes"))
}

fn write_x80(interp: &mut Interp<'_>, id: ValueId, v: X80) {
    interp.ssa.write_bytes(id, &v.to_slot());
}

fn finish(interp: &mut Interp<'_>, st: SoftFloatState) {
    interp.absorb_sf_flags(st.flags);
}

fn f80_bin(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::F80Bin { dst, op, lhs, rhs } = *instr else {
        unreachable!()
    };
    let a = read_x80(interp, lhs);
    let b = read_x80(interp, rhs);
    // Transcendentals and remainders run at full precision.
    let mut st = match op {
        F80BinOp::Add | F80BinOp::Sub | F80BinOp::Mul | F80BinOp::Div => {
            SoftFloatState::from_fcw(interp.fcw)
        }
        _ => SoftFloatState::from_fcw_f80(interp.fcw),
    };
    let result = match op {
        F80BinOp::Add => arith::fadd(&mut st, a, b),
        F80BinOp::Sub => arith::fsub(&mut st, a, b),
        F80BinOp::Mul => arith::fmul(&mut st, a, b),
        F80BinOp::Div => arith::fdiv(&mut st, a, b),
        F80BinOp::Fyl2x => trans::fyl2x(&mut st, a, b),
        F80BinOp::Atan => trans::fatan2(&mut st, a, b),
        F80BinOp::Scale => arith::fscale(&mut st, a, b),
        F80BinOp::Prem | F80BinOp::Prem1 => {
            let rem = arith::frem(&mut st, a, b, op == F80BinOp::Prem1);
            // FPREM condition codes: C0/C3/C1 hold quotient bits 2/1/0,
            // C2 signals an incomplete reduction.
            interp.state.flags[flag_loc::X87_C0] = (rem.quotient_low >> 2) & 1;
            interp.state.flags[flag_loc::X87_C3] = (rem.quotient_low >> 1) & 1;
            interp.state.flags[flag_loc::X87_C1] = rem.quotient_low & 1;
            interp.state.flags[flag_loc::X87_C2] = rem.partial as u8;
            rem.value
        }
    };
    write_x80(interp, dst, result);
    finish(interp, st);
    Ok(())
}

fn f80_un(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::F80Un { dst, op, src } = *instr else {
        unreachable!()
    };
    let a = read_x80(interp, src);
    // Square root honors precision control; the rest force 80-bit.
    let mut st = if op == F80UnOp::Sqrt {
        SoftFloatState::from_fcw(interp.fcw)
    } else {
        SoftFloatState::from_fcw_f80(interp.fcw)
    };
    let result = match op {
        F80UnOp::Sqrt => arith::fsqrt(&mut st, a),
        F80UnOp::Sin => trans::fsin(&mut st, a),
        F80UnOp::Cos => trans::fcos(&mut st, a),
        F80UnOp::Tan => trans::ftan(&mut st, a),
        F80UnOp::F2xm1 => trans::f2xm1(&mut st, a),
        F80UnOp::Round => arith::frndint(&mut st, a),
    };
    write_x80(interp, dst, result);
    finish(interp, st);
    Ok(())
}

fn f80_cmp(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::F80Cmp {
        dst,
        lhs,
        rhs,
        flags,
    } = *instr
    else {
        unreachable!()
    };
    let a = read_x80(interp, lhs);
    let b = read_x80(interp, rhs);
    let mut st = SoftFloatState::from_fcw(interp.fcw);
    let (eq, lt, unordered) = arith::fcmp(&mut st, a, b);
    let mut result = FcmpFlags::empty();
    if lt {
        result |= FcmpFlags::LT;
    }
    if unordered {
        result |= FcmpFlags::UNORDERED;
    }
    if eq {
        result |= FcmpFlags::EQ;
    }
    interp.ssa.write_u64(dst, (result & flags).bits() as u64);
    finish(interp, st);
    Ok(())
}

fn f80_cvt(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::F80Cvt { dst, size, src } = *instr else {
        unreachable!()
    };
    let a = read_x80(interp, src);
    let mut st = SoftFloatState::from_fcw(interp.fcw);
    match size {
        OpSize::B32 => {
            let v = convert::to_f32(&mut st, a);
            interp.ssa.write_bytes(dst, &v.to_bits().to_le_bytes());
        }
        OpSize::B64 => {
            let v = convert::to_f64(&mut st, a);
            interp.ssa.write_bytes(dst, &v.to_bits().to_le_bytes());
        }
        _ => debug_assert!(false, "unsupported F80Cvt size {size:?}"),
    }
    finish(interp, st);
    Ok(())
}

fn f80_cvt_int(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::F80CvtInt {
        dst,
        size,
        truncate,
        src,
    } = *instr
    else {
        unreachable!()
    };
    let a = read_x80(interp, src);
    let mut st = SoftFloatState::from_fcw(interp.fcw);
    let mode = if truncate {
        RoundMode::TowardsZero
    } else {
        RoundMode::Host
    };
    let result = match size {
        OpSize::B16 => convert::to_i16(&mut st, a, mode) as u64 & 0xFFFF,
        OpSize::B32 => convert::to_i32(&mut st, a, mode) as u32 as u64,
        OpSize::B64 => convert::to_i64(&mut st, a, mode) as u64,
        _ => {
            debug_assert!(false, "unsupported F80CvtInt size {size:?}");
            0
        }
    };
    interp.ssa.write_scalar(dst, size, result);
    finish(interp, st);
    Ok(())
}

fn f80_cvt_to(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::F80CvtTo { dst, src_size, src } = *instr else {
        unreachable!()
    };
    let raw = interp.ssa.read_u64(src);
    let value = match src_size {
        OpSize::B32 => convert::from_f32(f32::from_bits(raw as u32)),
        OpSize::B64 => convert::from_f64(f64::from_bits(raw)),
        _ => {
            debug_assert!(false, "unsupported F80CvtTo size {src_size:?}");
            X80::ZERO
        }
    };
    write_x80(interp, dst, value);
    Ok(())
}

fn f80_cvt_to_int(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::F80CvtToInt {
        dst,
        src_size,
        ref src,
    } = *instr
    else {
        unreachable!()
    };
    let raw = interp.ssa.operand(src);
    let value = match src_size {
        OpSize::B16 => convert::from_i16(raw as u16 as i16),
        OpSize::B32 => convert::from_i32(raw as u32 as i32),
        _ => {
            debug_assert!(false, "unsupported F80CvtToInt size {src_size:?}");
            X80::ZERO
        }
    };
    write_x80(interp, dst, value);
    Ok(())
}

fn f80_bcd_load(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::F80BcdLoad { dst, src } = *instr else {
        unreachable!()
    };
    let bytes: [u8; 10] = interp.ssa.read_bytes(src, 10).try_into().unwrap();
    let value = bcd::load(&bytes);
    write_x80(interp, dst, value);
    Ok(())
}

fn f80_bcd_store(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::F80BcdStore { dst, src } = *instr else {
        unreachable!()
    };
    let a = read_x80(interp, src);
    let mut st = SoftFloatState::from_fcw(interp.fcw);
    let out = bcd::store(&mut st, a);
    interp.ssa.write_bytes(dst, &out);
    finish(interp, st);
    Ok(())
}

fn f80_xtract_exp(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::F80XtractExp { dst, src } = *instr else {
        unreachable!()
    };
    let a = read_x80(interp, src);
    let mut st = SoftFloatState::from_fcw(interp.fcw);
    let value = arith::fxtract_exp(&mut st, a);
    write_x80(interp, dst, value);
    finish(interp, st);
    Ok(())
}

fn f80_xtract_sig(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::F80XtractSig { dst, src } = *instr else {
        unreachable!()
    };
    let a = read_x80(interp, src);
    write_x80(interp, dst, arith::fxtract_sig(a));
    Ok(())
}

fn f80_load_fcw(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::F80LoadFcw { ref value } = *instr else {
        unreachable!()
    };
    interp.fcw = interp.ssa.operand(value) as u16;
    interp.state.fcw = interp.fcw;
    // A new control word resets the sticky soft-float flags.
    interp.sf_flags = oxbow_softfloat::ExceptionFlags::empty();
    Ok(())
}

fn f64_bin(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::F64Bin { dst, op, lhs, rhs } = *instr else {
        unreachable!()
    };
    let a = f64::from_bits(interp.ssa.read_u64(lhs));
    let b = f64::from_bits(interp.ssa.read_u64(rhs));
    let result = match op {
        F64BinOp::Atan => a.atan2(b),
        F64BinOp::Prem => a % b,
        F64BinOp::Prem1 => {
            // IEEE remainder: quotient rounds to nearest, ties to even.
            let q = super::convert::round_f64(a / b, RoundMode::NearestEven);
            a - q * b
        }
        F64BinOp::Scale => {
            if a == 0.0 {
                a
            } else {
                a * (2f64).powf(b.trunc())
            }
        }
        F64BinOp::Fyl2x => b * a.log2(),
    };
    interp.ssa.write_bytes(dst, &result.to_bits().to_le_bytes());
    Ok(())
}

fn f64_un(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::F64Un { dst, op, src } = *instr else {
        unreachable!()
    };
    let a = f64::from_bits(interp.ssa.read_u64(src));
    let result = match op {
        F64UnOp::Sin => a.sin(),
        F64UnOp::Cos => a.cos(),
        F64UnOp::Tan => a.tan(),
        F64UnOp::F2xm1 => (a * std::f64::consts::LN_2).exp_m1(),
    };
    interp.ssa.write_bytes(dst, &result.to_bits().to_le_bytes());
    Ok(())
}
