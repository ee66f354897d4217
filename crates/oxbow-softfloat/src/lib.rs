//! Reference 80-bit extended-precision float library.
//!
//! Implements the x87 operations that host FPUs cannot perform with the
//! required precision or semantics. All state is passed by value: every
//! operation takes a [`SoftFloatState`] carrying the rounding mode,
//! rounding precision, and sticky exception flags. There is no global
//! mutable state anywhere in this crate.
//!
//! Arithmetic runs over an exact 128-bit significand intermediate and
//! rounds exactly once, so results are correctly rounded for all four
//! rounding modes at all three precision-control settings (24/53/64-bit
//! significands). Transcendentals go through host `f64` with documented
//! reduced precision.

use bitflags::bitflags;
use oxbow_types::{RoundMode, RoundPrecision};

pub mod arith;
pub mod convert;
pub mod trans;

pub use arith::{
    fabs, fadd, fcmp, fdiv, fmul, fneg, frem, frndint, fscale, fsqrt, fsub, fxtract_exp,
    fxtract_sig, RemResult,
};
pub use convert::bcd;
pub use trans::{f2xm1, fatan2, fcos, fsin, fsincos, ftan, fyl2x};

bitflags! {
    /// Sticky x87 exception flags, in status-word bit order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExceptionFlags: u8 {
        const INVALID = 1 << 0;
        const DENORMAL = 1 << 1;
        const DIV_ZERO = 1 << 2;
        const OVERFLOW = 1 << 3;
        const UNDERFLOW = 1 << 4;
        const INEXACT = 1 << 5;
    }
}

/// By-value soft-float state threaded through every operation.
#[derive(Debug, Clone, Copy)]
pub struct SoftFloatState {
    pub rounding: RoundMode,
    pub precision: RoundPrecision,
    pub flags: ExceptionFlags,
}

impl Default for SoftFloatState {
    fn default() -> Self {
        SoftFloatState {
            rounding: RoundMode::NearestEven,
            precision: RoundPrecision::P80,
            flags: ExceptionFlags::empty(),
        }
    }
}

impl SoftFloatState {
    /// Decode an x87 control word: bits 8-9 are precision control
    /// (00 -> 32, 10 -> 64, 11 -> 80; 01 is reserved and treated as 80),
    /// bits 10-11 are the rounding mode.
    pub fn from_fcw(fcw: u16) -> Self {
        let precision = match (fcw >> 8) & 3 {
            0 => RoundPrecision::P32,
            2 => RoundPrecision::P64,
            _ => RoundPrecision::P80,
        };
        Self::with_precision(fcw, precision)
    }

    /// Like [`from_fcw`](Self::from_fcw) but forcing 80-bit precision.
    /// The transcendental ops ignore precision control, matching hardware.
    pub fn from_fcw_f80(fcw: u16) -> Self {
        Self::with_precision(fcw, RoundPrecision::P80)
    }

    fn with_precision(fcw: u16, precision: RoundPrecision) -> Self {
        let rounding = match (fcw >> 10) & 3 {
            0 => RoundMode::NearestEven,
            1 => RoundMode::NegativeInfinity,
            2 => RoundMode::PositiveInfinity,
            _ => RoundMode::TowardsZero,
        };
        SoftFloatState {
            rounding,
            precision,
            flags: ExceptionFlags::empty(),
        }
    }

    /// Significand width selected by precision control.
    pub(crate) fn target_bits(&self) -> u32 {
        match self.precision {
            RoundPrecision::P32 => 24,
            RoundPrecision::P64 => 53,
            RoundPrecision::P80 => 64,
        }
    }
}

pub const EXP_BIAS: i32 = 16383;
pub const EXP_MAX: u16 = 0x7FFF;

/// An x87 double-extended value: 1 sign bit, 15 exponent bits, 64
/// significand bits with an explicit integer bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X80 {
    pub sign: bool,
    /// Biased exponent field (0..=0x7FFF).
    pub exp: u16,
    /// Full 64-bit significand including the integer bit.
    pub sig: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Class {
    Zero,
    Denormal,
    Normal,
    Infinity,
    Nan,
}

impl X80 {
    pub const ZERO: X80 = X80 {
        sign: false,
        exp: 0,
        sig: 0,
    };

    pub const ONE: X80 = X80 {
        sign: false,
        exp: EXP_BIAS as u16,
        sig: 1 << 63,
    };

    /// The x87 "indefinite" quiet NaN produced by invalid operations.
    pub const INDEFINITE: X80 = X80 {
        sign: true,
        exp: EXP_MAX,
        sig: 0xC000_0000_0000_0000,
    };

    pub const fn infinity(sign: bool) -> X80 {
        X80 {
            sign,
            exp: EXP_MAX,
            sig: 1 << 63,
        }
    }

    /// Largest finite magnitude at the given significand width.
    pub(crate) fn max_finite(sign: bool, bits: u32) -> X80 {
        let sig = if bits >= 64 {
            u64::MAX
        } else {
            !((1u64 << (64 - bits)) - 1)
        };
        X80 {
            sign,
            exp: EXP_MAX - 1,
            sig,
        }
    }

    pub(crate) fn classify(&self) -> Class {
        if self.exp == EXP_MAX {
            // Infinity requires the integer bit and a zero fraction;
            // everything else in the top exponent is NaN.
            if self.sig == 1 << 63 {
                Class::Infinity
            } else {
                Class::Nan
            }
        } else if self.exp == 0 {
            if self.sig == 0 {
                Class::Zero
            } else {
                Class::Denormal
            }
        } else {
            Class::Normal
        }
    }

    pub fn is_nan(&self) -> bool {
        self.classify() == Class::Nan
    }

    pub fn is_zero(&self) -> bool {
        self.classify() == Class::Zero
    }

    pub fn is_infinity(&self) -> bool {
        self.classify() == Class::Infinity
    }

    /// Signaling NaNs have a clear quiet bit (bit 62).
    pub fn is_signaling_nan(&self) -> bool {
        self.is_nan() && self.sig & (1 << 62) == 0
    }

    pub(crate) fn quieted(&self) -> X80 {
        X80 {
            sig: self.sig | (1 << 62),
            ..*self
        }
    }

    /// Decode from the 10 low bytes of a slot (little endian: 8 significand
    /// bytes, then sign/exponent word).
    pub fn from_bytes(raw: &[u8]) -> X80 {
        let mut sig_bytes = [0u8; 8];
        sig_bytes.copy_from_slice(&raw[..8]);
        let se = u16::from_le_bytes([raw[8], raw[9]]);
        X80 {
            sign: se & 0x8000 != 0,
            exp: se & 0x7FFF,
            sig: u64::from_le_bytes(sig_bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 10] {
        let mut out = [0u8; 10];
        out[..8].copy_from_slice(&self.sig.to_le_bytes());
        let se = self.exp | if self.sign { 0x8000 } else { 0 };
        out[8..].copy_from_slice(&se.to_le_bytes());
        out
    }

    /// Decode from the low 10 bytes of a 16-byte x87 slot.
    pub fn from_slot(slot: &[u8; 16]) -> X80 {
        X80::from_bytes(&slot[..10])
    }

    /// Encode into a 16-byte x87 slot, zeroing the unused upper bytes.
    pub fn to_slot(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..10].copy_from_slice(&self.to_bytes());
        out
    }

    /// Break into (sign, biased exponent, 128-bit-aligned significand) for
    /// the arithmetic core. Denormals get the effective exponent 1; the
    /// caller normalizes.
    pub(crate) fn to_parts(&self) -> (bool, i32, u128) {
        let exp = if self.exp == 0 { 1 } else { self.exp as i32 };
        (self.sign, exp, (self.sig as u128) << 64)
    }
}

/// Round an exact intermediate to an X80 result.
///
/// `sig` carries the value `sig / 2^127 * 2^(exp - EXP_BIAS)`; any bit
/// that was shifted out of the intermediate must already be OR'd into the
/// sticky (low) bit. Handles normalization, precision control, overflow,
/// and gradual underflow.
pub(crate) fn round_pack(state: &mut SoftFloatState, sign: bool, mut exp: i32, mut sig: u128) -> X80 {
    if sig == 0 {
        return X80 {
            sign,
            exp: 0,
            sig: 0,
        };
    }

    let lz = sig.leading_zeros();
    sig <<= lz;
    exp -= lz as i32;

    // Gradual underflow: shift right until the effective exponent is in
    // range, accumulating a sticky bit.
    if exp < 1 {
        let shift = 1 - exp;
        if shift >= 128 {
            sig = 1; // pure sticky
        } else {
            let sticky = sig & ((1u128 << shift) - 1) != 0;
            sig >>= shift;
            sig |= sticky as u128;
        }
        exp = 1;
    }

    let bits = state.target_bits();
    let round_shift = 128 - bits;
    let round_mask = (1u128 << round_shift) - 1;
    let round_bits = sig & round_mask;
    let mut keep = sig >> round_shift;

    if round_bits != 0 {
        state.flags |= ExceptionFlags::INEXACT;
        if exp == 1 && sig >> 127 == 0 {
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
        if keep >> bits != 0 {
            keep >>= 1;
            exp += 1;
        }
    }

    if exp >= EXP_MAX as i32 {
        state.flags |= ExceptionFlags::OVERFLOW | ExceptionFlags::INEXACT;
        let to_inf = match state.rounding {
            RoundMode::NearestEven | RoundMode::Host => true,
            RoundMode::TowardsZero => false,
            RoundMode::NegativeInfinity => sign,
            RoundMode::PositiveInfinity => !sign,
        };
        return if to_inf {
            X80::infinity(sign)
        } else {
            X80::max_finite(sign, bits)
        };
    }

    let sig64 = (keep << (64 - bits)) as u64;
    // Results that failed to reach the integer bit stay denormal with a
    // zero exponent field.
    let exp_field = if sig64 >> 63 == 0 { 0 } else { exp as u16 };
    X80 {
        sign,
        exp: exp_field,
        sig: sig64,
    }
}

/// Normalize denormal parts so the integer bit is set. No-op for zero.
pub(crate) fn normalize(exp: &mut i32, sig: &mut u128) {
    if *sig != 0 {
        let lz = sig.leading_zeros();
        *sig <<= lz;
        *exp -= lz as i32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_roundtrip() {
        let v = X80 {
            sign: true,
            exp: 0x4005,
            sig: 0xDEAD_BEEF_0123_4567,
        };
        assert_eq!(X80::from_bytes(&v.to_bytes()), v);
        assert_eq!(X80::from_slot(&v.to_slot()), v);
    }

    #[test]
    fn classify_edges() {
        assert_eq!(X80::ZERO.classify(), Class::Zero);
        assert_eq!(X80::ONE.classify(), Class::Normal);
        assert_eq!(X80::infinity(false).classify(), Class::Infinity);
        assert_eq!(X80::INDEFINITE.classify(), Class::Nan);
        let denorm = X80 {
            sign: false,
            exp: 0,
            sig: 1,
        };
        assert_eq!(denorm.classify(), Class::Denormal);
    }

    #[test]
    fn fcw_decode() {
        // Default FCW: round nearest, 80-bit precision.
        let st = SoftFloatState::from_fcw(0x037F);
        assert_eq!(st.rounding, RoundMode::NearestEven);
        assert_eq!(st.precision, RoundPrecision::P80);

        // PC=10 -> 64-bit, RC=11 -> toward zero.
        let st = SoftFloatState::from_fcw(0x0E7F);
        assert_eq!(st.precision, RoundPrecision::P64);
        assert_eq!(st.rounding, RoundMode::TowardsZero);

        // Reserved PC=01 treated as 80-bit.
        let st = SoftFloatState::from_fcw(0x017F);
        assert_eq!(st.precision, RoundPrecision::P80);
    }

    #[test]
    fn round_pack_exact_one() {
        let mut st = SoftFloatState::default();
        let one = round_pack(&mut st, false, EXP_BIAS, 1u128 << 127);
        assert_eq!(one, X80::ONE);
        assert!(st.flags.is_empty());
    }

    #[test]
    fn round_pack_ties_to_even() {
        // 1 + 2^-64 at 80-bit precision: the tie rounds to even -> 1.0.
        let mut st = SoftFloatState::default();
        let sig = (1u128 << 127) | (1u128 << 63);
        let v = round_pack(&mut st, false, EXP_BIAS, sig);
        assert_eq!(v, X80::ONE);
        assert!(st.flags.contains(ExceptionFlags::INEXACT));

        // 1 + 2^-63 is exactly representable.
        let mut st = SoftFloatState::default();
        let sig = (1u128 << 127) | (1u128 << 64);
        let v = round_pack(&mut st, false, EXP_BIAS, sig);
        assert_eq!(v.sig, (1 << 63) | 1);
        assert!(!st.flags.contains(ExceptionFlags::INEXACT));
    }

    #[test]
    fn round_pack_precision_control() {
        // 1 + 2^-63 rounds away under 53-bit precision control.
        let mut st = SoftFloatState::default();
        st.precision = RoundPrecision::P64;
        let sig = (1u128 << 127) | (1u128 << 64);
        let v = round_pack(&mut st, false, EXP_BIAS, sig);
        assert_eq!(v, X80::ONE);
        assert!(st.flags.contains(ExceptionFlags::INEXACT));
    }

    #[test]
    fn round_pack_overflow_modes() {
        let mut st = SoftFloatState::default();
        let v = round_pack(&mut st, false, EXP_MAX as i32 + 2, 1u128 << 127);
        assert!(v.is_infinity());
        assert!(st.flags.contains(ExceptionFlags::OVERFLOW));

        let mut st = SoftFloatState::default();
        st.rounding = RoundMode::TowardsZero;
        let v = round_pack(&mut st, false, EXP_MAX as i32 + 2, 1u128 << 127);
        assert_eq!(v, X80::max_finite(false, 64));
    }
}
