//! Conversions between F80 and integers, f32/f64, and packed BCD.

use crate::{normalize, Class, ExceptionFlags, SoftFloatState, X80, EXP_BIAS};
use oxbow_types::RoundMode;

/// Exact conversion from f64. Never raises flags.
pub fn from_f64(v: f64) -> X80 {
    let bits = v.to_bits();
    let sign = bits >> 63 != 0;
    let exp = ((bits >> 52) & 0x7FF) as i32;
    let frac = bits & ((1u64 << 52) - 1);

    if exp == 0x7FF {
        return if frac == 0 {
            X80::infinity(sign)
        } else {
            // Preserve the payload, quieted.
            X80 {
                sign,
                exp: crate::EXP_MAX,
                sig: (1 << 63) | (1 << 62) | (frac << 11),
            }
        };
    }
    if exp == 0 && frac == 0 {
        return X80 { sign, exp: 0, sig: 0 };
    }

    let (sig, e) = if exp == 0 {
        // f64 denormal: normalize into the explicit-integer-bit form.
        let lz = frac.leading_zeros() - 11;
        (frac << (11 + lz), 1 - 1023 - lz as i32)
    } else {
        ((1u64 << 63) | (frac << 11), exp - 1023)
    };
    X80 {
        sign,
        exp: (e + EXP_BIAS) as u16,
        sig,
    }
}

/// Exact conversion from f32.
pub fn from_f32(v: f32) -> X80 {
    from_f64(v as f64)
}

/// Generic binary32/binary64 pack with correct rounding and gradual
/// underflow. `mant_bits` includes the implicit bit; `width` is the total
/// encoding width (32 or 64).
fn pack_binary(
    state: &mut SoftFloatState,
    sign: bool,
    e_unbiased: i32,
    mut sig: u128,
    width: u32,
    mant_bits: u32,
    exp_bias: i32,
    exp_field_max: u64,
) -> u64 {
    let sign_bit = (sign as u64) << (width - 1);
    if sig == 0 {
        return sign_bit;
    }
    let lz = sig.leading_zeros();
    sig <<= lz;
    let mut biased = e_unbiased - lz as i32 + exp_bias;

    if biased < 1 {
        let shift = (1 - biased) as u32;
        sig = if shift >= 128 {
            (sig != 0) as u128
        } else {
            let sticky = sig & ((1u128 << shift) - 1) != 0;
            (sig >> shift) | sticky as u128
        };
        biased = 1;
    }

    let round_shift = 128 - mant_bits;
    let round_bits = sig & ((1u128 << round_shift) - 1);
    let mut keep = sig >> round_shift;
    if round_bits != 0 {
        state.flags |= ExceptionFlags::INEXACT;
        if biased == 1 && sig >> 127 == 0 {
            state.flags |= ExceptionFlags::UNDERFLOW;
        }
    }
    let half = 1u128 << (round_shift - 1);
    let increment = match state.rounding {
        RoundMode::NearestEven | RoundMode::Host => {
            round_bits > half || (round_bits == half && keep & 1 == 1)
        }
        RoundMode::TowardsZero => false,
        RoundMode::NegativeInfinity => sign && round_bits != 0,
        RoundMode::PositiveInfinity => !sign && round_bits != 0,
    };
    if increment {
        keep += 1;
        if keep >> mant_bits != 0 {
            keep >>= 1;
            biased += 1;
        }
    }

    if biased as u64 >= exp_field_max {
        state.flags |= ExceptionFlags::OVERFLOW | ExceptionFlags::INEXACT;
        let to_inf = match state.rounding {
            RoundMode::NearestEven | RoundMode::Host => true,
            RoundMode::TowardsZero => false,
            RoundMode::NegativeInfinity => sign,
            RoundMode::PositiveInfinity => !sign,
        };
        let frac_mask = (1u64 << (mant_bits - 1)) - 1;
        return if to_inf {
            sign_bit | (exp_field_max << (mant_bits - 1))
        } else {
            sign_bit | ((exp_field_max - 1) << (mant_bits - 1)) | frac_mask
        };
    }

    let frac_mask = (1u64 << (mant_bits - 1)) - 1;
    let normal = keep >> (mant_bits - 1) != 0;
    let exp_field = if normal { biased as u64 } else { 0 };
    sign_bit | (exp_field << (mant_bits - 1)) | (keep as u64 & frac_mask)
}

/// Round to f64 under the state's rounding mode.
pub fn to_f64(state: &mut SoftFloatState, a: X80) -> f64 {
    match a.classify() {
        Class::Nan => {
            if a.is_signaling_nan() {
                state.flags |= ExceptionFlags::INVALID;
            }
            let payload = (a.sig >> 11) & ((1u64 << 52) - 1);
            let bits = (a.sign as u64) << 63 | 0x7FFu64 << 52 | payload | 1 << 51;
            f64::from_bits(bits)
        }
        Class::Infinity => {
            if a.sign {
                f64::NEG_INFINITY
            } else {
                f64::INFINITY
            }
        }
        Class::Zero => {
            if a.sign {
                -0.0
            } else {
                0.0
            }
        }
        _ => {
            let (sign, e, sig) = a.to_parts();
            f64::from_bits(pack_binary(state, sign, e - EXP_BIAS, sig, 64, 53, 1023, 0x7FF))
        }
    }
}

/// Round to f32 under the state's rounding mode.
pub fn to_f32(state: &mut SoftFloatState, a: X80) -> f32 {
    match a.classify() {
        Class::Nan => {
            if a.is_signaling_nan() {
                state.flags |= ExceptionFlags::INVALID;
            }
            let payload = ((a.sig >> 40) & ((1u64 << 23) - 1)) as u32;
            f32::from_bits((a.sign as u32) << 31 | 0xFFu32 << 23 | payload | 1 << 22)
        }
        Class::Infinity => {
            if a.sign {
                f32::NEG_INFINITY
            } else {
                f32::INFINITY
            }
        }
        Class::Zero => {
            if a.sign {
                -0.0
            } else {
                0.0
            }
        }
        _ => {
            let (sign, e, sig) = a.to_parts();
            f32::from_bits(pack_binary(state, sign, e - EXP_BIAS, sig, 32, 24, 127, 0xFF) as u32)
        }
    }
}

pub fn from_i64(v: i64) -> X80 {
    if v == 0 {
        return X80::ZERO;
    }
    let sign = v < 0;
    let mag = v.unsigned_abs();
    let lz = mag.leading_zeros();
    X80 {
        sign,
        exp: (EXP_BIAS + 63 - lz as i32) as u16,
        sig: mag << lz,
    }
}

pub fn from_i32(v: i32) -> X80 {
    from_i64(v as i64)
}

pub fn from_i16(v: i16) -> X80 {
    from_i64(v as i64)
}

pub fn from_u64(v: u64) -> X80 {
    if v == 0 {
        return X80::ZERO;
    }
    let lz = v.leading_zeros();
    X80 {
        sign: false,
        exp: (EXP_BIAS + 63 - lz as i32) as u16,
        sig: v << lz,
    }
}

/// Rounded integer magnitude, or None for NaN/infinity/too-large.
fn to_int_mag(state: &mut SoftFloatState, a: X80, mode: RoundMode) -> Option<u128> {
    match a.classify() {
        Class::Nan | Class::Infinity => return None,
        Class::Zero => return Some(0),
        _ => {}
    }
    let (sign, mut ea, mut sig) = a.to_parts();
    normalize(&mut ea, &mut sig);
    let e = ea - EXP_BIAS;
    if e > 63 {
        return None;
    }
    let (int_part, frac, frac_bits) = if e < 0 {
        (0u128, sig, 128u32)
    } else {
        let fb = (127 - e) as u32;
        (sig >> fb, sig & ((1u128 << fb) - 1), fb)
    };
    if frac == 0 {
        return Some(int_part);
    }
    state.flags |= ExceptionFlags::INEXACT;
    let half = 1u128 << (frac_bits - 1);
    let increment = match mode {
        RoundMode::NearestEven | RoundMode::Host => {
            frac > half || (frac == half && int_part & 1 == 1)
        }
        RoundMode::TowardsZero => false,
        RoundMode::NegativeInfinity => sign,
        RoundMode::PositiveInfinity => !sign,
    };
    Some(int_part + increment as u128)
}

macro_rules! to_int_fn {
    ($name:ident, $ty:ty) => {
        /// Convert under the given rounding mode; out-of-range inputs
        /// raise invalid and return the indefinite integer (minimum).
        pub fn $name(state: &mut SoftFloatState, a: X80, mode: RoundMode) -> $ty {
            let mode = if mode == RoundMode::Host {
                state.rounding
            } else {
                mode
            };
            let Some(mag) = to_int_mag(state, a, mode) else {
                state.flags |= ExceptionFlags::INVALID;
                return <$ty>::MIN;
            };
            let limit = <$ty>::MAX as u128;
            if a.sign {
                if mag > limit + 1 {
                    state.flags |= ExceptionFlags::INVALID;
                    return <$ty>::MIN;
                }
                mag.wrapping_neg() as $ty
            } else {
                if mag > limit {
                    state.flags |= ExceptionFlags::INVALID;
                    return <$ty>::MIN;
                }
                mag as $ty
            }
        }
    };
}

to_int_fn!(to_i16, i16);
to_int_fn!(to_i32, i32);
to_int_fn!(to_i64, i64);

/// Truncated integer magnitude saturated to u64, ignoring the sign.
/// Used by FSCALE to clamp the shift count.
pub(crate) fn to_int_magnitude_trunc(a: X80) -> u64 {
    match a.classify() {
        Class::Zero => 0,
        Class::Nan | Class::Infinity => u64::MAX,
        _ => {
            let (_, mut ea, mut sig) = a.to_parts();
            normalize(&mut ea, &mut sig);
            let e = ea - EXP_BIAS;
            if e < 0 {
                0
            } else if e > 63 {
                u64::MAX
            } else {
                (sig >> (127 - e)) as u64
            }
        }
    }
}

pub mod bcd {
    //! x87 packed-BCD conversions: 9 bytes of two digits each (units in
    //! the low nibble), then a sign byte with the sign in bit 7.

    use super::{from_u64, to_i64};
    use crate::arith::frndint;
    use crate::{SoftFloatState, X80};
    use oxbow_types::RoundMode;

    /// FBLD. Digits above 9 produce unspecified results.
    pub fn load(raw: &[u8; 10]) -> X80 {
        let mut value: u64 = 0;
        for i in 0..9 {
            let byte = raw[8 - i];
            value = value * 100 + (byte >> 4) as u64 * 10 + (byte & 0xF) as u64;
        }
        let mut out = from_u64(value);
        out.sign = raw[9] & 0x80 != 0;
        out
    }

    /// FBSTP. Rounds to integer first; magnitudes beyond 18 digits wrap
    /// silently.
    pub fn store(state: &mut SoftFloatState, a: X80) -> [u8; 10] {
        let negative = a.sign;
        let rounded = frndint(state, a);
        let mut tmp = to_i64(state, X80 { sign: false, ..rounded }, RoundMode::TowardsZero) as u64;

        let mut out = [0u8; 10];
        for slot in out.iter_mut().take(9) {
            if tmp == 0 {
                break;
            }
            let digits = (tmp % 100) as u8;
            tmp /= 100;
            *slot = (digits / 10) << 4 | (digits % 10);
        }
        out[9] = if negative { 0x80 } else { 0 };
        out
    }
}
