//! Core F80 arithmetic: add, sub, mul, div, sqrt, remainder, round to
//! integral, scale, and comparison.
//!
//! Every entry point is total over the full encoding space: NaNs
//! propagate quieted, invalid combinations produce the x87 indefinite and
//! set the invalid flag.

use crate::{normalize, round_pack, Class, ExceptionFlags, SoftFloatState, X80, EXP_BIAS};
use oxbow_types::{RoundMode, RoundPrecision};

/// NaN propagation for two-operand ops: prefer the first NaN operand,
/// quieted. Signaling NaNs raise invalid.
fn propagate_nan(state: &mut SoftFloatState, a: X80, b: X80) -> X80 {
    if a.is_signaling_nan() || b.is_signaling_nan() {
        state.flags |= ExceptionFlags::INVALID;
    }
    if a.is_nan() {
        a.quieted()
    } else {
        b.quieted()
    }
}

fn invalid(state: &mut SoftFloatState) -> X80 {
    state.flags |= ExceptionFlags::INVALID;
    X80::INDEFINITE
}

fn signed_zero(state: &SoftFloatState) -> X80 {
    X80 {
        sign: state.rounding == RoundMode::NegativeInfinity,
        exp: 0,
        sig: 0,
    }
}

/// Shift right with the shifted-out bits OR'd into the sticky (low) bit.
fn shift_right_sticky(sig: u128, shift: u32) -> u128 {
    if shift == 0 {
        sig
    } else if shift >= 128 {
        (sig != 0) as u128
    } else {
        let sticky = sig & ((1u128 << shift) - 1) != 0;
        (sig >> shift) | sticky as u128
    }
}

/// Add magnitudes; the result carries `sign`.
fn add_mags(state: &mut SoftFloatState, sign: bool, a: X80, b: X80) -> X80 {
    let (_, ea, siga) = a.to_parts();
    let (_, eb, sigb) = b.to_parts();
    let (eh, sigh, el, sigl) = if ea >= eb {
        (ea, siga, eb, sigb)
    } else {
        (eb, sigb, ea, siga)
    };

    let sigl = shift_right_sticky(sigl, (eh - el) as u32);
    let (mut sum, carry) = sigh.overflowing_add(sigl);
    let mut exp = eh;
    if carry {
        let sticky = sum & 1;
        sum = (sum >> 1) | (1 << 127) | sticky;
        exp += 1;
    }
    round_pack(state, sign, exp, sum)
}

/// Subtract the smaller magnitude from the larger; `sign` is the sign of
/// `a`, flipped when `b` has the larger magnitude.
fn sub_mags(state: &mut SoftFloatState, sign: bool, a: X80, b: X80) -> X80 {
    let (_, ea, siga) = a.to_parts();
    let (_, eb, sigb) = b.to_parts();

    let (res_sign, eh, sigh, el, sigl) = if ea > eb || (ea == eb && siga >= sigb) {
        (sign, ea, siga, eb, sigb)
    } else {
        (!sign, eb, sigb, ea, siga)
    };

    let sigl = shift_right_sticky(sigl, (eh - el) as u32);
    let diff = sigh - sigl;
    if diff == 0 {
        return signed_zero(state);
    }
    round_pack(state, res_sign, eh, diff)
}

pub fn fadd(state: &mut SoftFloatState, a: X80, b: X80) -> X80 {
    match (a.classify(), b.classify()) {
        (Class::Nan, _) | (_, Class::Nan) => propagate_nan(state, a, b),
        (Class::Infinity, Class::Infinity) => {
            if a.sign != b.sign {
                invalid(state)
            } else {
                a
            }
        }
        (Class::Infinity, _) => a,
        (_, Class::Infinity) => b,
        (Class::Zero, Class::Zero) => {
            if a.sign == b.sign {
                a
            } else {
                signed_zero(state)
            }
        }
        _ => {
            if a.sign == b.sign {
                add_mags(state, a.sign, a, b)
            } else {
                sub_mags(state, a.sign, a, b)
            }
        }
    }
}

pub fn fsub(state: &mut SoftFloatState, a: X80, b: X80) -> X80 {
    fadd(state, a, X80 { sign: !b.sign, ..b })
}

pub fn fmul(state: &mut SoftFloatState, a: X80, b: X80) -> X80 {
    let sign = a.sign ^ b.sign;
    match (a.classify(), b.classify()) {
        (Class::Nan, _) | (_, Class::Nan) => propagate_nan(state, a, b),
        (Class::Infinity, Class::Zero) | (Class::Zero, Class::Infinity) => invalid(state),
        (Class::Infinity, _) | (_, Class::Infinity) => X80::infinity(sign),
        (Class::Zero, _) | (_, Class::Zero) => X80 {
            sign,
            exp: 0,
            sig: 0,
        },
        _ => {
            let (_, mut ea, mut siga) = a.to_parts();
            let (_, mut eb, mut sigb) = b.to_parts();
            normalize(&mut ea, &mut siga);
            normalize(&mut eb, &mut sigb);
            // Exact 64x64 -> 128-bit product of the significands.
            let prod = ((siga >> 64) as u128) * ((sigb >> 64) as u128);
            round_pack(state, sign, ea + eb - EXP_BIAS + 1, prod)
        }
    }
}

pub fn fdiv(state: &mut SoftFloatState, a: X80, b: X80) -> X80 {
    let sign = a.sign ^ b.sign;
    match (a.classify(), b.classify()) {
        (Class::Nan, _) | (_, Class::Nan) => propagate_nan(state, a, b),
        (Class::Infinity, Class::Infinity) | (Class::Zero, Class::Zero) => invalid(state),
        (Class::Infinity, _) => X80::infinity(sign),
        (_, Class::Infinity) | (Class::Zero, _) => X80 {
            sign,
            exp: 0,
            sig: 0,
        },
        (_, Class::Zero) => {
            state.flags |= ExceptionFlags::DIV_ZERO;
            X80::infinity(sign)
        }
        _ => {
            let (_, mut ea, mut siga) = a.to_parts();
            let (_, mut eb, mut sigb) = b.to_parts();
            normalize(&mut ea, &mut siga);
            normalize(&mut eb, &mut sigb);
            let sa = (siga >> 64) as u64;
            let sb = (sigb >> 64) as u64;
            // sa/sb lies in (1/2, 2): a 63-bit-shifted dividend keeps the
            // integer quotient within 64 bits.
            let dividend = (sa as u128) << 63;
            let q = dividend / sb as u128;
            let r = dividend % sb as u128;
            let sig = (q << 64) | (r != 0) as u128;
            round_pack(state, sign, ea - eb + EXP_BIAS, sig)
        }
    }
}

pub fn fsqrt(state: &mut SoftFloatState, a: X80) -> X80 {
    match a.classify() {
        Class::Nan => {
            if a.is_signaling_nan() {
                state.flags |= ExceptionFlags::INVALID;
            }
            a.quieted()
        }
        Class::Zero => a,
        Class::Infinity => {
            if a.sign {
                invalid(state)
            } else {
                a
            }
        }
        _ if a.sign => invalid(state),
        _ => {
            let (_, mut ea, mut siga) = a.to_parts();
            normalize(&mut ea, &mut siga);
            let e = ea - EXP_BIAS;
            let k = e.div_euclid(2);
            let rem = e.rem_euclid(2) as u32;
            // Radicand scaled into [2^126, 2^128): sqrt lands in
            // [2^63, 2^64).
            let x = ((siga >> 64) as u128) << (63 + rem);
            let s = isqrt128(x);
            let sticky = (s as u128) * (s as u128) != x;
            let sig = ((s as u128) << 64) | sticky as u128;
            round_pack(state, false, k + EXP_BIAS, sig)
        }
    }
}

/// Floor square root of a 128-bit value whose root fits in 64 bits.
fn isqrt128(x: u128) -> u64 {
    let mut s: u64 = 0;
    let mut bit = 1u64 << 63;
    while bit != 0 {
        let cand = s | bit;
        if (cand as u128) * (cand as u128) <= x {
            s = cand;
        }
        bit >>= 1;
    }
    s
}

/// Remainder result: the remainder plus the low quotient bits the
/// interpreter maps onto C0/C3/C1.
#[derive(Debug, Clone, Copy)]
pub struct RemResult {
    pub value: X80,
    /// Low three bits of the integer quotient.
    pub quotient_low: u8,
    /// Set when the reduction was left incomplete (C2 on hardware). This
    /// implementation always reduces fully.
    pub partial: bool,
}

/// FPREM (`round_to_even == false`, truncating quotient) and FPREM1
/// (`round_to_even == true`, IEEE round-to-nearest-even quotient).
///
/// The remainder of two F80 values is always exactly representable, so
/// the reduction is performed in exact integer arithmetic regardless of
/// the precision-control setting.
pub fn frem(state: &mut SoftFloatState, a: X80, b: X80, round_to_even: bool) -> RemResult {
    let pass = |v: X80| RemResult {
        value: v,
        quotient_low: 0,
        partial: false,
    };

    match (a.classify(), b.classify()) {
        (Class::Nan, _) | (_, Class::Nan) => return pass(propagate_nan(state, a, b)),
        (Class::Infinity, _) | (_, Class::Zero) => return pass(invalid(state)),
        (_, Class::Infinity) | (Class::Zero, _) => return pass(a),
        _ => {}
    }

    let (_, mut ea, mut siga) = a.to_parts();
    let (_, mut eb, mut sigb) = b.to_parts();
    normalize(&mut ea, &mut siga);
    normalize(&mut eb, &mut sigb);
    let sa = (siga >> 64) as u64;
    let sb = (sigb >> 64) as u64;

    if ea < eb {
        // |a| < |b|: the quotient truncates to zero. FPREM1 may still
        // need one adjustment step below when |a| > |b|/2.
        if !round_to_even {
            return pass(a);
        }
        return rem1_adjust(state, a, b, 0, a);
    }

    // Base-2^63 long division of sa*2^(ea-eb) by sb, tracking the residue
    // exactly and the quotient modulo a word.
    let mut residue = sa as u128;
    let mut quotient: u64 = 0;
    let mut d = ea - eb;
    loop {
        let step = d.min(63) as u32;
        let wide = residue << step;
        quotient = quotient
            .wrapping_shl(step)
            .wrapping_add((wide / sb as u128) as u64);
        residue = wide % sb as u128;
        d -= step as i32;
        if d == 0 {
            break;
        }
    }

    // residue < sb: the remainder is residue * 2^(eb - BIAS - 63).
    let mut exact = SoftFloatState {
        precision: RoundPrecision::P80,
        ..*state
    };
    let rem = round_pack(&mut exact, a.sign, eb, residue << 64);
    state.flags |= exact.flags;

    if !round_to_even {
        return RemResult {
            value: rem,
            quotient_low: (quotient & 7) as u8,
            partial: false,
        };
    }
    rem1_adjust(state, rem, b, quotient, a)
}

/// FPREM1 step: if the truncated remainder exceeds half of |b| (or equals
/// it with an odd quotient), take one more quotient step toward nearest.
fn rem1_adjust(
    state: &mut SoftFloatState,
    rem: X80,
    b: X80,
    quotient: u64,
    dividend: X80,
) -> RemResult {
    let take = match cmp_mag_double(rem, b) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Equal => quotient & 1 == 1,
        std::cmp::Ordering::Less => false,
    };
    if !take || rem.is_zero() {
        return RemResult {
            value: rem,
            quotient_low: (quotient & 7) as u8,
            partial: false,
        };
    }
    let mut exact = SoftFloatState {
        precision: RoundPrecision::P80,
        ..*state
    };
    let step = X80 {
        sign: dividend.sign,
        ..b
    };
    let adjusted = fsub(&mut exact, rem, step);
    state.flags |= exact.flags;
    RemResult {
        value: adjusted,
        quotient_low: (quotient.wrapping_add(1) & 7) as u8,
        partial: false,
    }
}

/// Compare |2*a| against |b| exactly.
fn cmp_mag_double(a: X80, b: X80) -> std::cmp::Ordering {
    if a.is_zero() {
        return std::cmp::Ordering::Less;
    }
    let (_, mut ea, mut siga) = a.to_parts();
    let (_, mut eb, mut sigb) = b.to_parts();
    normalize(&mut ea, &mut siga);
    normalize(&mut eb, &mut sigb);
    (ea + 1, siga).cmp(&(eb, sigb))
}

/// FRNDINT: round to an integral value under the current rounding mode.
pub fn frndint(state: &mut SoftFloatState, a: X80) -> X80 {
    match a.classify() {
        Class::Nan => {
            if a.is_signaling_nan() {
                state.flags |= ExceptionFlags::INVALID;
            }
            return a.quieted();
        }
        Class::Infinity | Class::Zero => return a,
        _ => {}
    }

    let (sign, mut ea, mut siga) = a.to_parts();
    normalize(&mut ea, &mut siga);
    let e = ea - EXP_BIAS;

    if e >= 63 {
        // Already integral.
        return a;
    }

    if e < 0 {
        // Magnitude below 1: the result is zero or +/-1.
        state.flags |= ExceptionFlags::INEXACT;
        let one = match state.rounding {
            RoundMode::NearestEven | RoundMode::Host => {
                // >= 0.5 rounds up, except an exact 0.5 tie (to even 0).
                e == -1 && siga != 1u128 << 127
            }
            RoundMode::TowardsZero => false,
            RoundMode::NegativeInfinity => sign,
            RoundMode::PositiveInfinity => !sign,
        };
        return if one {
            X80 { sign, ..X80::ONE }
        } else {
            X80 {
                sign,
                exp: 0,
                sig: 0,
            }
        };
    }

    let frac_bits = (127 - e) as u32;
    let frac = siga & ((1u128 << frac_bits) - 1);
    if frac == 0 {
        return a;
    }
    state.flags |= ExceptionFlags::INEXACT;
    let mut int_part = siga >> frac_bits;
    let half = 1u128 << (frac_bits - 1);
    let increment = match state.rounding {
        RoundMode::NearestEven | RoundMode::Host => {
            frac > half || (frac == half && int_part & 1 == 1)
        }
        RoundMode::TowardsZero => false,
        RoundMode::NegativeInfinity => sign,
        RoundMode::PositiveInfinity => !sign,
    };
    if increment {
        int_part += 1;
        // Carry into the next power of two.
        if int_part >> (128 - frac_bits) != 0 {
            int_part >>= 1;
            ea += 1;
        }
    }
    let mut exact = SoftFloatState {
        precision: RoundPrecision::P80,
        ..*state
    };
    let v = round_pack(&mut exact, sign, ea, int_part << frac_bits);
    state.flags |= exact.flags & !ExceptionFlags::INEXACT;
    v
}

/// FSCALE: a * 2^trunc(b).
pub fn fscale(state: &mut SoftFloatState, a: X80, b: X80) -> X80 {
    match (a.classify(), b.classify()) {
        (Class::Nan, _) | (_, Class::Nan) => return propagate_nan(state, a, b),
        (Class::Zero, Class::Infinity) if !b.sign => return invalid(state),
        (Class::Infinity, Class::Infinity) if b.sign => return invalid(state),
        (Class::Zero, _) | (Class::Infinity, _) => return a,
        (_, Class::Infinity) => {
            return if b.sign {
                X80 {
                    sign: a.sign,
                    exp: 0,
                    sig: 0,
                }
            } else {
                X80::infinity(a.sign)
            };
        }
        (_, Class::Zero) => return a,
        _ => {}
    }

    // trunc(b), clamped so the exponent saturates either direction.
    let mag = crate::convert::to_int_magnitude_trunc(b).min(0x1_0000) as i32;
    let shift = if b.sign { -mag } else { mag };

    let (sign, mut ea, mut siga) = a.to_parts();
    normalize(&mut ea, &mut siga);
    round_pack(state, sign, ea + shift, siga)
}

/// FXTRACT exponent part: the unbiased exponent of `a` as an F80 value.
pub fn fxtract_exp(state: &mut SoftFloatState, a: X80) -> X80 {
    match a.classify() {
        Class::Nan => a.quieted(),
        Class::Infinity => X80::infinity(false),
        Class::Zero => {
            state.flags |= ExceptionFlags::DIV_ZERO;
            X80::infinity(true)
        }
        _ => {
            let (_, mut ea, mut siga) = a.to_parts();
            normalize(&mut ea, &mut siga);
            crate::convert::from_i64((ea - EXP_BIAS) as i64)
        }
    }
}

/// FXTRACT significand part: `a` rescaled into [1, 2).
pub fn fxtract_sig(a: X80) -> X80 {
    match a.classify() {
        Class::Nan => a.quieted(),
        Class::Infinity | Class::Zero => a,
        _ => {
            let (sign, mut ea, mut siga) = a.to_parts();
            normalize(&mut ea, &mut siga);
            X80 {
                sign,
                exp: EXP_BIAS as u16,
                sig: (siga >> 64) as u64,
            }
        }
    }
}

/// Three-way FCMP: returns (equal, less-than, unordered).
pub fn fcmp(state: &mut SoftFloatState, a: X80, b: X80) -> (bool, bool, bool) {
    if a.is_nan() || b.is_nan() {
        if a.is_signaling_nan() || b.is_signaling_nan() {
            state.flags |= ExceptionFlags::INVALID;
        }
        return (false, false, true);
    }
    if a.is_zero() && b.is_zero() {
        return (true, false, false);
    }

    // Totally ordered key: signed magnitude over (exponent, significand).
    let key = |v: &X80| -> (i8, i128) {
        if v.is_zero() {
            return (0, 0);
        }
        let (_, mut e, mut s) = v.to_parts();
        normalize(&mut e, &mut s);
        let mag = ((e as i128) << 64) | (s >> 64) as i128;
        if v.sign {
            (-1, -mag)
        } else {
            (1, mag)
        }
    };
    let ka = key(&a);
    let kb = key(&b);
    (ka == kb, ka < kb, false)
}

pub fn fneg(a: X80) -> X80 {
    X80 { sign: !a.sign, ..a }
}

pub fn fabs(a: X80) -> X80 {
    X80 { sign: false, ..a }
}
