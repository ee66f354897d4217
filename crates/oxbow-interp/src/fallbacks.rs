//! Fallback handlers for JIT backends.
//!
//! Code generators do not open-code the soft-float or string-compare
//! opcodes; they emit calls through this table instead, sharing the
//! interpreter's exact semantics. Each entry names its ABI so a backend
//! can marshal arguments without knowing the operation.

use oxbow_ir::ops::{F64BinOp, F64UnOp, F80BinOp, F80UnOp};
use oxbow_softfloat::{arith, bcd, convert, trans, ExceptionFlags, SoftFloatState, X80};
use oxbow_types::{FcmpFlags, OpSize, RoundMode};

use crate::handlers::string;

/// Key identifying one delegated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FallbackOp {
    F80Bin(F80BinOp),
    F80Un(F80UnOp),
    F80Cmp,
    /// F80 -> f32/f64.
    F80Cvt(OpSize),
    F80CvtInt {
        size: OpSize,
        truncate: bool,
    },
    /// f32/f64 -> F80.
    F80CvtTo(OpSize),
    /// i16/i32 -> F80.
    F80CvtToInt(OpSize),
    F80BcdLoad,
    F80BcdStore,
    F80XtractExp,
    F80XtractSig,
    F64Bin(F64BinOp),
    F64Un(F64UnOp),
    VPCmpEstrx,
    VPCmpIstrx,
}

/// Argument/return shape of a fallback handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackAbi {
    /// `(fcw, x80) -> (x80, flags)`
    F80Unary,
    /// `(fcw, x80, x80) -> (x80, flags)`
    F80Binary,
    /// `(fcw, x80, x80) -> (mask, flags)`
    F80Compare,
    /// `(fcw, x80) -> (u64, flags)` (integer results sign-extended,
    /// float results as raw bits)
    F80ToInt,
    /// `(fcw, u64) -> (x80, flags)` (raw scalar input)
    IntToF80,
    /// `(f64) -> f64`
    F64Unary,
    /// `(f64, f64) -> f64`
    F64Binary,
    /// `(rax, rdx, lhs, rhs, control) -> u32`
    StringExplicit,
    /// `(lhs, rhs, control) -> u32`
    StringImplicit,
}

/// Typed handler pointer, matching [`FallbackAbi`].
#[derive(Clone, Copy)]
pub enum FallbackFn {
    F80Unary(fn(u16, X80) -> (X80, ExceptionFlags)),
    F80Binary(fn(u16, X80, X80) -> (X80, ExceptionFlags)),
    F80Compare(fn(u16, X80, X80) -> (u8, ExceptionFlags)),
    F80ToInt(fn(u16, X80) -> (u64, ExceptionFlags)),
    IntToF80(fn(u16, u64) -> (X80, ExceptionFlags)),
    F64Unary(fn(f64) -> f64),
    F64Binary(fn(f64, f64) -> f64),
    StringExplicit(fn(u64, u64, u128, u128, u16) -> u32),
    StringImplicit(fn(u128, u128, u16) -> u32),
}

#[derive(Clone, Copy)]
pub struct FallbackEntry {
    pub abi: FallbackAbi,
    pub handler: FallbackFn,
}

macro_rules! f80_bin_fn {
    ($name:ident, $body:expr, $force80:expr) => {
        fn $name(fcw: u16, a: X80, b: X80) -> (X80, ExceptionFlags) {
            let mut st = if $force80 {
                SoftFloatState::from_fcw_f80(fcw)
            } else {
                SoftFloatState::from_fcw(fcw)
            };
            let f: fn(&mut SoftFloatState, X80, X80) -> X80 = $body;
            let r = f(&mut st, a, b);
            (r, st.flags)
        }
    };
}

f80_bin_fn!(fb_f80_add, arith::fadd, false);
f80_bin_fn!(fb_f80_sub, arith::fsub, false);
f80_bin_fn!(fb_f80_mul, arith::fmul, false);
f80_bin_fn!(fb_f80_div, arith::fdiv, false);
f80_bin_fn!(fb_f80_fyl2x, trans::fyl2x, true);
f80_bin_fn!(fb_f80_atan, trans::fatan2, true);
f80_bin_fn!(fb_f80_scale, arith::fscale, true);
f80_bin_fn!(
    fb_f80_prem,
    |st, a, b| arith::frem(st, a, b, false).value,
    true
);
f80_bin_fn!(
    fb_f80_prem1,
    |st, a, b| arith::frem(st, a, b, true).value,
    true
);

macro_rules! f80_un_fn {
    ($name:ident, $body:expr, $force80:expr) => {
        fn $name(fcw: u16, a: X80) -> (X80, ExceptionFlags) {
            let mut st = if $force80 {
                SoftFloatState::from_fcw_f80(fcw)
            } else {
                SoftFloatState::from_fcw(fcw)
            };
            let f: fn(&mut SoftFloatState, X80) -> X80 = $body;
            let r = f(&mut st, a);
            (r, st.flags)
        }
    };
}

f80_un_fn!(fb_f80_sqrt, arith::fsqrt, false);
f80_un_fn!(fb_f80_sin, trans::fsin, true);
f80_un_fn!(fb_f80_cos, trans::fcos, true);
f80_un_fn!(fb_f80_tan, trans::ftan, true);
f80_un_fn!(fb_f80_f2xm1, trans::f2xm1, true);
f80_un_fn!(fb_f80_round, arith::frndint, true);
f80_un_fn!(fb_f80_xtract_exp, arith::fxtract_exp, true);

fn fb_f80_xtract_sig(_fcw: u16, a: X80) -> (X80, ExceptionFlags) {
    (arith::fxtract_sig(a), ExceptionFlags::empty())
}

fn fb_f80_cmp(fcw: u16, a: X80, b: X80) -> (u8, ExceptionFlags) {
    let mut st = SoftFloatState::from_fcw(fcw);
    let (eq, lt, unordered) = arith::fcmp(&mut st, a, b);
    let mut mask = FcmpFlags::empty();
    if lt {
        mask |= FcmpFlags::LT;
    }
    if unordered {
        mask |= FcmpFlags::UNORDERED;
    }
    if eq {
        mask |= FcmpFlags::EQ;
    }
    (mask.bits(), st.flags)
}

fn fb_f80_cvt32(fcw: u16, a: X80) -> (u64, ExceptionFlags) {
    let mut st = SoftFloatState::from_fcw(fcw);
    let v = convert::to_f32(&mut st, a);
    (v.to_bits() as u64, st.flags)
}

fn fb_f80_cvt64(fcw: u16, a: X80) -> (u64, ExceptionFlags) {
    let mut st = SoftFloatState::from_fcw(fcw);
    let v = convert::to_f64(&mut st, a);
    (v.to_bits(), st.flags)
}

macro_rules! f80_to_int_fn {
    ($name:ident, $conv:path, $mode:expr) => {
        fn $name(fcw: u16, a: X80) -> (u64, ExceptionFlags) {
            let mut st = SoftFloatState::from_fcw(fcw);
            let v = $conv(&mut st, a, $mode);
            (v as u64, st.flags)
        }
    };
}

f80_to_int_fn!(fb_f80_to_i16, convert::to_i16, RoundMode::Host);
f80_to_int_fn!(fb_f80_to_i32, convert::to_i32, RoundMode::Host);
f80_to_int_fn!(fb_f80_to_i64, convert::to_i64, RoundMode::Host);
f80_to_int_fn!(fb_f80_to_i16_t, convert::to_i16, RoundMode::TowardsZero);
f80_to_int_fn!(fb_f80_to_i32_t, convert::to_i32, RoundMode::TowardsZero);
f80_to_int_fn!(fb_f80_to_i64_t, convert::to_i64, RoundMode::TowardsZero);

fn fb_f80_from_f32(_fcw: u16, raw: u64) -> (X80, ExceptionFlags) {
    (
        convert::from_f32(f32::from_bits(raw as u32)),
        ExceptionFlags::empty(),
    )
}

fn fb_f80_from_f64(_fcw: u16, raw: u64) -> (X80, ExceptionFlags) {
    (convert::from_f64(f64::from_bits(raw)), ExceptionFlags::empty())
}

fn fb_f80_from_i16(_fcw: u16, raw: u64) -> (X80, ExceptionFlags) {
    (convert::from_i16(raw as u16 as i16), ExceptionFlags::empty())
}

fn fb_f80_from_i32(_fcw: u16, raw: u64) -> (X80, ExceptionFlags) {
    (convert::from_i32(raw as u32 as i32), ExceptionFlags::empty())
}

fn fb_bcd_load(_fcw: u16, a: X80) -> (X80, ExceptionFlags) {
    let mut raw = [0u8; 10];
    raw.copy_from_slice(&a.to_slot()[..10]);
    (bcd::load(&raw), ExceptionFlags::empty())
}

fn fb_bcd_store(fcw: u16, a: X80) -> (X80, ExceptionFlags) {
    let mut st = SoftFloatState::from_fcw(fcw);
    let raw = bcd::store(&mut st, a);
    let mut slot = [0u8; 16];
    slot[..10].copy_from_slice(&raw);
    (X80::from_slot(&slot), st.flags)
}

fn fb_f64_prem1(a: f64, b: f64) -> f64 {
    let q = crate::handlers::convert::round_f64(a / b, RoundMode::NearestEven);
    a - q * b
}

fn fb_f64_scale(a: f64, b: f64) -> f64 {
    if a == 0.0 {
        a
    } else {
        a * 2f64.powf(b.trunc())
    }
}

fn fb_f64_f2xm1(a: f64) -> f64 {
    (a * std::f64::consts::LN_2).exp_m1()
}

/// Resolve the fallback entry for one delegated opcode.
pub fn lookup(op: FallbackOp) -> FallbackEntry {
    use FallbackAbi as Abi;
    use FallbackFn as F;
    let (abi, handler) = match op {
        FallbackOp::F80Bin(bin) => (
            Abi::F80Binary,
            F::F80Binary(match bin {
                F80BinOp::Add => fb_f80_add,
                F80BinOp::Sub => fb_f80_sub,
                F80BinOp::Mul => fb_f80_mul,
                F80BinOp::Div => fb_f80_div,
                F80BinOp::Fyl2x => fb_f80_fyl2x,
                F80BinOp::Atan => fb_f80_atan,
                F80BinOp::Prem => fb_f80_prem,
                F80BinOp::Prem1 => fb_f80_prem1,
                F80BinOp::Scale => fb_f80_scale,
            }),
        ),
        FallbackOp::F80Un(un) => (
            Abi::F80Unary,
            F::F80Unary(match un {
                F80UnOp::Sqrt => fb_f80_sqrt,
                F80UnOp::Sin => fb_f80_sin,
                F80UnOp::Cos => fb_f80_cos,
                F80UnOp::Tan => fb_f80_tan,
                F80UnOp::F2xm1 => fb_f80_f2xm1,
                F80UnOp::Round => fb_f80_round,
            }),
        ),
        FallbackOp::F80Cmp => (Abi::F80Compare, F::F80Compare(fb_f80_cmp)),
        FallbackOp::F80Cvt(OpSize::B32) => (Abi::F80ToInt, F::F80ToInt(fb_f80_cvt32)),
        FallbackOp::F80Cvt(_) => (Abi::F80ToInt, F::F80ToInt(fb_f80_cvt64)),
        FallbackOp::F80CvtInt { size, truncate } => (
            Abi::F80ToInt,
            F::F80ToInt(match (size, truncate) {
                (OpSize::B16, false) => fb_f80_to_i16,
                (OpSize::B32, false) => fb_f80_to_i32,
                (OpSize::B64, false) => fb_f80_to_i64,
                (OpSize::B16, true) => fb_f80_to_i16_t,
                (OpSize::B32, true) => fb_f80_to_i32_t,
                _ => fb_f80_to_i64_t,
            }),
        ),
        FallbackOp::F80CvtTo(OpSize::B32) => (Abi::IntToF80, F::IntToF80(fb_f80_from_f32)),
        FallbackOp::F80CvtTo(_) => (Abi::IntToF80, F::IntToF80(fb_f80_from_f64)),
        FallbackOp::F80CvtToInt(OpSize::B16) => (Abi::IntToF80, F::IntToF80(fb_f80_from_i16)),
        FallbackOp::F80CvtToInt(_) => (Abi::IntToF80, F::IntToF80(fb_f80_from_i32)),
        FallbackOp::F80BcdLoad => (Abi::F80Unary, F::F80Unary(fb_bcd_load)),
        FallbackOp::F80BcdStore => (Abi::F80Unary, F::F80Unary(fb_bcd_store)),
        FallbackOp::F80XtractExp => (Abi::F80Unary, F::F80Unary(fb_f80_xtract_exp)),
        FallbackOp::F80XtractSig => (Abi::F80Unary, F::F80Unary(fb_f80_xtract_sig)),
        FallbackOp::F64Bin(bin) => (
            Abi::F64Binary,
            F::F64Binary(match bin {
                F64BinOp::Atan => f64::atan2,
                F64BinOp::Prem => |a: f64, b: f64| a % b,
                F64BinOp::Prem1 => fb_f64_prem1,
                F64BinOp::Scale => fb_f64_scale,
                F64BinOp::Fyl2x => |a: f64, b: f64| b * a.log2(),
            }),
        ),
        FallbackOp::F64Un(un) => (
            Abi::F64Unary,
            F::F64Unary(match un {
                F64UnOp::Sin => f64::sin,
                F64UnOp::Cos => f64::cos,
                F64UnOp::Tan => f64::tan,
                F64UnOp::F2xm1 => fb_f64_f2xm1,
            }),
        ),
        FallbackOp::VPCmpEstrx => (Abi::StringExplicit, F::StringExplicit(string::pcmpestr)),
        FallbackOp::VPCmpIstrx => (Abi::StringImplicit, F::StringImplicit(string::pcmpistr)),
    };
    FallbackEntry { abi, handler }
}

/// Every delegated operation, for exhaustive backend wiring and tests.
pub fn all_ops() -> Vec<FallbackOp> {
    let mut ops = Vec::new();
    for bin in [
        F80BinOp::Add,
        F80BinOp::Sub,
        F80BinOp::Mul,
        F80BinOp::Div,
        F80BinOp::Fyl2x,
        F80BinOp::Atan,
        F80BinOp::Prem,
        F80BinOp::Prem1,
        F80BinOp::Scale,
    ] {
        ops.push(FallbackOp::F80Bin(bin));
    }
    for un in [
        F80UnOp::Sqrt,
        F80UnOp::Sin,
        F80UnOp::Cos,
        F80UnOp::Tan,
        F80UnOp::F2xm1,
        F80UnOp::Round,
    ] {
        ops.push(FallbackOp::F80Un(un));
    }
    ops.push(FallbackOp::F80Cmp);
    for size in [OpSize::B32, OpSize::B64] {
        ops.push(FallbackOp::F80Cvt(size));
        ops.push(FallbackOp::F80CvtTo(size));
    }
    for size in [OpSize::B16, OpSize::B32, OpSize::B64] {
        for truncate in [false, true] {
            ops.push(FallbackOp::F80CvtInt { size, truncate });
        }
    }
    for size in [OpSize::B16, OpSize::B32] {
        ops.push(FallbackOp::F80CvtToInt(size));
    }
    ops.extend([
        FallbackOp::F80BcdLoad,
        FallbackOp::F80BcdStore,
        FallbackOp::F80XtractExp,
        FallbackOp::F80XtractSig,
    ]);
    for bin in [
        F64BinOp::Atan,
        F64BinOp::Prem,
        F64BinOp::Prem1,
        F64BinOp::Scale,
        F64BinOp::Fyl2x,
    ] {
        ops.push(FallbackOp::F64Bin(bin));
    }
    for un in [F64UnOp::Sin, F64UnOp::Cos, F64UnOp::Tan, F64UnOp::F2xm1] {
        ops.push(FallbackOp::F64Un(un));
    }
    ops.extend([FallbackOp::VPCmpEstrx, FallbackOp::VPCmpIstrx]);
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_op_resolves_with_matching_abi() {
        for op in all_ops() {
            let entry = lookup(op);
            let matches = matches!(
                (entry.abi, entry.handler),
                (FallbackAbi::F80Unary, FallbackFn::F80Unary(_))
                    | (FallbackAbi::F80Binary, FallbackFn::F80Binary(_))
                    | (FallbackAbi::F80Compare, FallbackFn::F80Compare(_))
                    | (FallbackAbi::F80ToInt, FallbackFn::F80ToInt(_))
                    | (FallbackAbi::IntToF80, FallbackFn::IntToF80(_))
                    | (FallbackAbi::F64Unary, FallbackFn::F64Unary(_))
                    | (FallbackAbi::F64Binary, FallbackFn::F64Binary(_))
                    | (FallbackAbi::StringExplicit, FallbackFn::StringExplicit(_))
                    | (FallbackAbi::StringImplicit, FallbackFn::StringImplicit(_))
            );
            assert!(matches, "{op:?} ABI does not match its handler shape");
        }
    }

    #[test]
    fn fallback_add_matches_softfloat() {
        let FallbackFn::F80Binary(f) = lookup(FallbackOp::F80Bin(F80BinOp::Add)).handler else {
            panic!("wrong shape");
        };
        let a = convert::from_f64(1.5);
        let b = convert::from_f64(2.5);
        let (r, flags) = f(0x037F, a, b);
        assert_eq!(
            convert::to_f64(&mut SoftFloatState::default(), r),
            4.0
        );
        assert!(flags.is_empty());
    }

    #[test]
    fn fallback_cmp_reports_mask() {
        let FallbackFn::F80Compare(f) = lookup(FallbackOp::F80Cmp).handler else {
            panic!("wrong shape");
        };
        let (mask, _) = f(0x037F, convert::from_f64(1.0), convert::from_f64(2.0));
        assert_eq!(mask, FcmpFlags::LT.bits());
    }

    #[test]
    fn fallback_string_compare_is_shared_with_interpreter() {
        let FallbackFn::StringImplicit(f) = lookup(FallbackOp::VPCmpIstrx).handler else {
            panic!("wrong shape");
        };
        let s = u128::from_le_bytes(*b"abcdefgh\0\0\0\0\0\0\0\0");
        let r = f(s, s, 0b0000_1000);
        assert_ne!(r & (1 << 29), 0, "equal strings set CF");
    }
}
