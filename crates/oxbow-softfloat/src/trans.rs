//! Transcendental operations.
//!
//! These route through host `f64`: the original implementation offers the
//! same reduced-precision fallback path, and correctly-rounded 80-bit
//! transcendentals are out of scope for the reference executor. Results
//! are exact f64 values re-expanded to F80, so precision control never
//! truncates them further.

use crate::{convert, ExceptionFlags, SoftFloatState, X80};

fn unary(state: &mut SoftFloatState, a: X80, f: impl Fn(f64) -> f64) -> X80 {
    let x = convert::to_f64(&mut SoftFloatState::default(), a);
    let r = f(x);
    if r.is_nan() && !x.is_nan() {
        state.flags |= ExceptionFlags::INVALID;
    }
    if a.is_nan() {
        return a.quieted();
    }
    convert::from_f64(r)
}

fn binary(state: &mut SoftFloatState, a: X80, b: X80, f: impl Fn(f64, f64) -> f64) -> X80 {
    if a.is_nan() || b.is_nan() {
        if a.is_signaling_nan() || b.is_signaling_nan() {
            state.flags |= ExceptionFlags::INVALID;
        }
        return if a.is_nan() { a.quieted() } else { b.quieted() };
    }
    let x = convert::to_f64(&mut SoftFloatState::default(), a);
    let y = convert::to_f64(&mut SoftFloatState::default(), b);
    let r = f(x, y);
    if r.is_nan() && !x.is_nan() && !y.is_nan() {
        state.flags |= ExceptionFlags::INVALID;
    }
    convert::from_f64(r)
}

pub fn fsin(state: &mut SoftFloatState, a: X80) -> X80 {
    unary(state, a, f64::sin)
}

pub fn fcos(state: &mut SoftFloatState, a: X80) -> X80 {
    unary(state, a, f64::cos)
}

pub fn fsincos(state: &mut SoftFloatState, a: X80) -> (X80, X80) {
    (fsin(state, a), fcos(state, a))
}

pub fn ftan(state: &mut SoftFloatState, a: X80) -> X80 {
    unary(state, a, f64::tan)
}

/// FPATAN: atan2(a, b) with full quadrant correction.
pub fn fatan2(state: &mut SoftFloatState, a: X80, b: X80) -> X80 {
    binary(state, a, b, f64::atan2)
}

/// FYL2X: b * log2(a).
pub fn fyl2x(state: &mut SoftFloatState, a: X80, b: X80) -> X80 {
    binary(state, a, b, |x, y| y * x.log2())
}

/// F2XM1: 2^a - 1, precise near zero.
pub fn f2xm1(state: &mut SoftFloatState, a: X80) -> X80 {
    unary(state, a, |x| (x * std::f64::consts::LN_2).exp_m1())
}
