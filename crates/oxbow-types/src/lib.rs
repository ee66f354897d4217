//! Leaf types shared across the translator core.
//!
//! Everything here is encoding-stable: the discriminant values appear in
//! cached IR, so they must never be renumbered.

use bitflags::bitflags;

/// Operation size attached to an IR op header, in bytes.
///
/// Vector element size is carried separately from register size so the same
/// opcode covers 128-bit and 256-bit forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum OpSize {
    B8 = 1,
    B16 = 2,
    B32 = 4,
    B64 = 8,
    B128 = 16,
    B256 = 32,
    /// x87 extended precision memory operand (10 bytes). Only valid on x87
    /// stack load/store ops.
    F80 = 10,
}

impl OpSize {
    #[inline]
    pub const fn bytes(self) -> usize {
        self as usize
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        (self as u32) * 8
    }

    /// Mask covering the low `bits()` of a u64. Only meaningful for scalar
    /// sizes up to 8 bytes.
    #[inline]
    pub const fn mask(self) -> u64 {
        match self {
            OpSize::B64 => u64::MAX,
            _ => (1u64 << self.bits()) - 1,
        }
    }

    #[inline]
    pub const fn truncate(self, value: u64) -> u64 {
        value & self.mask()
    }

    pub fn from_bytes(bytes: usize) -> Option<OpSize> {
        Some(match bytes {
            1 => OpSize::B8,
            2 => OpSize::B16,
            4 => OpSize::B32,
            8 => OpSize::B64,
            10 => OpSize::F80,
            16 => OpSize::B128,
            32 => OpSize::B256,
            _ => return None,
        })
    }
}

/// Register class of an SSA value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    Gpr,
    Fpr,
}

/// Condition codes for Select/CondJump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CondCode {
    Eq = 0,
    Neq = 1,
    Sge = 2,
    Slt = 3,
    Sgt = 4,
    Sle = 5,
    Uge = 6,
    Ult = 7,
    Ugt = 8,
    Ule = 9,
    /// Carry set (after rectifying any deferred carry inversion).
    Cs = 10,
    /// Carry clear.
    Cc = 11,
    /// Negative (minus).
    Mi = 12,
    /// Positive or zero (plus).
    Pl = 13,
    /// Overflow set.
    Vs = 14,
    /// Overflow clear.
    Vc = 15,
}

impl CondCode {
    /// Evaluate the condition over two scalar sources of the given size.
    ///
    /// The flag-style conditions (Cs/Cc/Mi/Pl/Vs/Vc) interpret `lhs` as an
    /// NZCV word at the canonical bit positions and ignore `rhs`.
    pub fn eval(self, size: OpSize, lhs: u64, rhs: u64) -> bool {
        let lhs_t = size.truncate(lhs);
        let rhs_t = size.truncate(rhs);
        let sign = |v: u64| -> i64 {
            match size {
                OpSize::B8 => v as u8 as i8 as i64,
                OpSize::B16 => v as u16 as i16 as i64,
                OpSize::B32 => v as u32 as i32 as i64,
                _ => v as i64,
            }
        };
        match self {
            CondCode::Eq => lhs_t == rhs_t,
            CondCode::Neq => lhs_t != rhs_t,
            CondCode::Sge => sign(lhs_t) >= sign(rhs_t),
            CondCode::Slt => sign(lhs_t) < sign(rhs_t),
            CondCode::Sgt => sign(lhs_t) > sign(rhs_t),
            CondCode::Sle => sign(lhs_t) <= sign(rhs_t),
            CondCode::Uge => lhs_t >= rhs_t,
            CondCode::Ult => lhs_t < rhs_t,
            CondCode::Ugt => lhs_t > rhs_t,
            CondCode::Ule => lhs_t <= rhs_t,
            CondCode::Cs => lhs_t & nzcv::C != 0,
            CondCode::Cc => lhs_t & nzcv::C == 0,
            CondCode::Mi => lhs_t & nzcv::N != 0,
            CondCode::Pl => lhs_t & nzcv::N == 0,
            CondCode::Vs => lhs_t & nzcv::V != 0,
            CondCode::Vc => lhs_t & nzcv::V == 0,
        }
    }
}

/// Canonical NZCV bit positions used by the deferred-flag scheme.
pub mod nzcv {
    pub const N_BIT: u32 = 31;
    pub const Z_BIT: u32 = 30;
    pub const C_BIT: u32 = 29;
    pub const V_BIT: u32 = 28;

    pub const N: u64 = 1 << N_BIT;
    pub const Z: u64 = 1 << Z_BIT;
    pub const C: u64 = 1 << C_BIT;
    pub const V: u64 = 1 << V_BIT;
}

/// Extension applied to a memory-op index operand before scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemOffsetType {
    Sxtx = 0,
    Uxtw = 1,
    Sxtw = 2,
}

impl MemOffsetType {
    /// Apply the extension to a raw 64-bit index value.
    #[inline]
    pub fn extend(self, index: u64) -> i64 {
        match self {
            MemOffsetType::Sxtx => index as i64,
            MemOffsetType::Uxtw => (index as u32) as i64,
            MemOffsetType::Sxtw => (index as u32) as i32 as i64,
        }
    }
}

/// Rounding mode for float-to-int and round-to-integral ops.
///
/// `Host` defers to the currently installed guest rounding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RoundMode {
    NearestEven = 0,
    NegativeInfinity = 1,
    PositiveInfinity = 2,
    TowardsZero = 3,
    Host = 4,
}

/// Guest-visible rounding encoding: two mode bits plus a flush-to-zero bit
/// mirrored from the x87 FCW.
pub mod guest_rounding {
    pub const MODE_MASK: u8 = 0b11;
    pub const FLUSH_TO_ZERO: u8 = 0b100;
}

/// x87 rounding precision, from FCW bits 8-9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RoundPrecision {
    P32 = 32,
    P64 = 64,
    P80 = 80,
}

/// Memory barrier kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FenceKind {
    /// Acquire barrier.
    Load = 0,
    /// Release barrier.
    Store = 1,
    /// Sequentially consistent barrier.
    LoadStore = 2,
}

bitflags! {
    /// Result mask of a floating-point compare (F80Cmp and friends).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FcmpFlags: u8 {
        const LT = 1 << 0;
        const UNORDERED = 1 << 1;
        const EQ = 1 << 2;
    }
}

/// Named architectural registers reachable through LoadRegister and
/// StoreRegister, including the flag pseudo-registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ArchReg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
    /// Parity pseudo-register: holds the byte whose parity defines PF
    /// (inverted convention: even parity reads as PF=1).
    Pf = 16,
    /// Aux-carry pseudo-register: AF is bit 4 of this value.
    Af = 17,
    /// Direction pseudo-register: +1 ascending, -1 descending.
    Df = 18,
}

impl ArchReg {
    pub const GPR_COUNT: usize = 16;

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<ArchReg> {
        use ArchReg::*;
        Some(match v {
            0 => Rax,
            1 => Rcx,
            2 => Rdx,
            3 => Rbx,
            4 => Rsp,
            5 => Rbp,
            6 => Rsi,
            7 => Rdi,
            8 => R8,
            9 => R9,
            10 => R10,
            11 => R11,
            12 => R12,
            13 => R13,
            14 => R14,
            15 => R15,
            16 => Pf,
            17 => Af,
            18 => Df,
            _ => return None,
        })
    }
}

/// A 256-bit vector value: the unit of SSA slot storage.
///
/// Scalar results occupy the low bytes; readers pick a width explicitly
/// rather than reinterpreting storage in place.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VectorReg(pub [u8; 32]);

impl Default for VectorReg {
    fn default() -> Self {
        VectorReg([0; 32])
    }
}

impl std::fmt::Debug for VectorReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VectorReg({:032x}:{:032x})", self.u128_at(1), self.u128_at(0))
    }
}

macro_rules! lane_accessors {
    ($get:ident, $set:ident, $ty:ty) => {
        #[inline]
        pub fn $get(&self, lane: usize) -> $ty {
            let w = std::mem::size_of::<$ty>();
            let mut buf = [0u8; std::mem::size_of::<$ty>()];
            buf.copy_from_slice(&self.0[lane * w..lane * w + w]);
            <$ty>::from_le_bytes(buf)
        }

        #[inline]
        pub fn $set(&mut self, lane: usize, value: $ty) {
            let w = std::mem::size_of::<$ty>();
            self.0[lane * w..lane * w + w].copy_from_slice(&value.to_le_bytes());
        }
    };
}

impl VectorReg {
    pub fn from_u64(value: u64) -> Self {
        let mut v = VectorReg::default();
        v.set_u64(0, value);
        v
    }

    pub fn from_u128(value: u128) -> Self {
        let mut v = VectorReg::default();
        v.set_u128(0, value);
        v
    }

    lane_accessors!(u8_at, set_u8, u8);
    lane_accessors!(u16_at, set_u16, u16);
    lane_accessors!(u32_at, set_u32, u32);
    lane_accessors!(u64_at, set_u64, u64);
    lane_accessors!(u128_at, set_u128, u128);
    lane_accessors!(i8_at, set_i8, i8);
    lane_accessors!(i16_at, set_i16, i16);
    lane_accessors!(i32_at, set_i32, i32);
    lane_accessors!(i64_at, set_i64, i64);

    #[inline]
    pub fn f32_at(&self, lane: usize) -> f32 {
        f32::from_bits(self.u32_at(lane))
    }

    #[inline]
    pub fn set_f32(&mut self, lane: usize, value: f32) {
        self.set_u32(lane, value.to_bits());
    }

    #[inline]
    pub fn f64_at(&self, lane: usize) -> f64 {
        f64::from_bits(self.u64_at(lane))
    }

    #[inline]
    pub fn set_f64(&mut self, lane: usize, value: f64) {
        self.set_u64(lane, value.to_bits());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opsize_masks() {
        assert_eq!(OpSize::B8.mask(), 0xFF);
        assert_eq!(OpSize::B16.mask(), 0xFFFF);
        assert_eq!(OpSize::B32.mask(), 0xFFFF_FFFF);
        assert_eq!(OpSize::B64.mask(), u64::MAX);
        assert_eq!(OpSize::B32.truncate(0x1_2345_6789), 0x2345_6789);
    }

    #[test]
    fn opsize_from_bytes_roundtrip() {
        for s in [
            OpSize::B8,
            OpSize::B16,
            OpSize::B32,
            OpSize::B64,
            OpSize::F80,
            OpSize::B128,
            OpSize::B256,
        ] {
            assert_eq!(OpSize::from_bytes(s.bytes()), Some(s));
        }
        assert_eq!(OpSize::from_bytes(3), None);
    }

    #[test]
    fn cond_signed_vs_unsigned() {
        // -1 < 1 signed, but 0xFFFF_FFFF > 1 unsigned.
        let a = 0xFFFF_FFFFu64;
        assert!(CondCode::Slt.eval(OpSize::B32, a, 1));
        assert!(CondCode::Ugt.eval(OpSize::B32, a, 1));
        // At 64 bits the same value is a large positive number.
        assert!(!CondCode::Slt.eval(OpSize::B64, a, 1));
    }

    #[test]
    fn cond_flag_forms_use_nzcv_positions() {
        assert!(CondCode::Cs.eval(OpSize::B32, nzcv::C, 0));
        assert!(CondCode::Mi.eval(OpSize::B32, nzcv::N, 0));
        assert!(CondCode::Vs.eval(OpSize::B32, nzcv::V, 0));
        assert!(CondCode::Pl.eval(OpSize::B32, 0, 0));
    }

    #[test]
    fn offset_extension() {
        assert_eq!(MemOffsetType::Sxtw.extend(0xFFFF_FFFF), -1);
        assert_eq!(MemOffsetType::Uxtw.extend(0xFFFF_FFFF), 0xFFFF_FFFF);
        assert_eq!(MemOffsetType::Sxtx.extend(u64::MAX), -1);
    }

    #[test]
    fn vector_lane_access() {
        let mut v = VectorReg::default();
        v.set_u16(3, 0xBEEF);
        assert_eq!(v.u16_at(3), 0xBEEF);
        assert_eq!(v.u8_at(6), 0xEF);
        assert_eq!(v.u8_at(7), 0xBE);
        v.set_f64(2, -1.5);
        assert_eq!(v.f64_at(2), -1.5);
    }
}
