//! Deferred NZCV flag tracking.
//!
//! Frontends emitting IR route every arithmetic-flag update through this
//! tracker so EFLAGS bits are only materialized when the guest actually
//! reads them. The four NZCV bits live either in the context NZCV word
//! (`cached == None`) or in a GPR-typed SSA value at the canonical bit
//! positions N=31 Z=30 C=29 V=28.
//!
//! Subtraction produces an inverted borrow. Instead of correcting it
//! eagerly, `cf_inverted` follows the carry through the block and
//! [`FlagTracker::rectify_carry_invert`] fixes the polarity before any
//! integer read of CF and at block boundaries (the ABI stores CF in x86
//! convention, non-inverted).

use crate::ops::{AluUnOp, Instr, Operand};
use crate::{IrBuilder, ValueId};
use oxbow_cpu::{flag_loc, layout};
use oxbow_types::nzcv;
use oxbow_types::{ArchReg, OpSize, RegClass};

/// Flag byte locations understood by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Cf,
    Pf,
    Af,
    Zf,
    Sf,
    Of,
    Df,
}

impl Flag {
    /// NZCV bit position, for the four flags that live in the cache word.
    fn nzcv_bit(self) -> Option<u32> {
        match self {
            Flag::Sf => Some(nzcv::N_BIT),
            Flag::Zf => Some(nzcv::Z_BIT),
            Flag::Cf => Some(nzcv::C_BIT),
            Flag::Of => Some(nzcv::V_BIT),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct FlagTracker {
    cached: Option<ValueId>,
    dirty: bool,
    cf_inverted: bool,
}

impl FlagTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cf_inverted(&self) -> bool {
        self.cf_inverted
    }

    /// The NZCV word as an SSA value, loading from context on first use.
    pub fn get_nzcv(&mut self, b: &mut IrBuilder) -> ValueId {
        match self.cached {
            Some(v) => v,
            None => {
                let v = b.load_context(OpSize::B32, RegClass::Gpr, layout::NZCV as u32);
                self.cached = Some(v);
                v
            }
        }
    }

    pub fn set_nzcv(&mut self, value: ValueId) {
        self.cached = Some(value);
        self.dirty = true;
    }

    pub fn zero_nzcv(&mut self, b: &mut IrBuilder) {
        let zero = b.const_int(0);
        self.set_nzcv(zero);
        self.cf_inverted = false;
    }

    /// Set N and Z from a result while zeroing C and V.
    ///
    /// At 32/64 bits this uses `SubNZCV(res, 0)`: x - 0 sets hardware
    /// carry, which after the invert convention reads as guest CF=0. At
    /// smaller sizes TestNZ zeroes C directly.
    pub fn set_nz_zero_cv(&mut self, b: &mut IrBuilder, size: OpSize, result: impl Into<Operand>) {
        let result = result.into();
        if size >= OpSize::B32 {
            let dst = b.alloc_value();
            b.push(Instr::SubNzcv {
                dst,
                size,
                lhs: result,
                rhs: Operand::Const(0),
                invert_carry: true,
            });
            self.set_nzcv(dst);
            self.cf_inverted = true;
        } else {
            let dst = b.alloc_value();
            b.push(Instr::TestNz {
                dst,
                size,
                lhs: result,
                rhs: result,
            });
            self.set_nzcv(dst);
            self.cf_inverted = false;
        }
    }

    /// Record the NZCV produced by an emitted AddNZCV/SubNZCV value.
    pub fn consume_nzcv(&mut self, value: ValueId, cf_inverted: bool) {
        self.set_nzcv(value);
        self.cf_inverted = cf_inverted;
    }

    /// Ensure the stored carry polarity matches `required_invert`.
    pub fn rectify_carry_invert(&mut self, b: &mut IrBuilder, required_invert: bool) {
        if self.cf_inverted != required_invert {
            let nzcv = self.get_nzcv(b);
            let flipped = b.xor(OpSize::B32, nzcv, Operand::Const(nzcv::C));
            self.set_nzcv(flipped);
            self.cf_inverted = required_invert;
        }
        debug_assert_eq!(self.cf_inverted, required_invert);
    }

    pub fn carry_invert(&mut self) {
        self.cf_inverted = !self.cf_inverted;
    }

    /// Read one flag as a 0/1 value. CF reads rectify the inversion
    /// first.
    pub fn get_flag(&mut self, b: &mut IrBuilder, flag: Flag) -> ValueId {
        match flag {
            Flag::Pf => {
                // The pseudo-register holds the byte whose parity defines
                // PF; stored parity 0 means even parity means PF=1.
                let raw = Self::load_reg(b, ArchReg::Pf);
                let byte = b.and(OpSize::B64, raw, Operand::Const(0xFF));
                let pop = b.alloc_value();
                b.push(Instr::AluUn {
                    dst: pop,
                    op: AluUnOp::Popcount,
                    size: OpSize::B64,
                    src: Operand::Value(byte),
                });
                let odd = b.and(OpSize::B64, pop, Operand::Const(1));
                b.xor(OpSize::B64, odd, Operand::Const(1))
            }
            Flag::Af => {
                let raw = Self::load_reg(b, ArchReg::Af);
                b.bfe(OpSize::B64, 1, 4, raw)
            }
            Flag::Df => {
                // Stored as +1/-1; the flag bit is the sign.
                let raw = Self::load_reg(b, ArchReg::Df);
                b.lshr(OpSize::B64, raw, Operand::Const(63))
            }
            _ => {
                if flag == Flag::Cf {
                    self.rectify_carry_invert(b, false);
                }
                let bit = flag.nzcv_bit().unwrap();
                let nzcv = self.get_nzcv(b);
                b.bfe(OpSize::B32, 1, bit as u8, nzcv)
            }
        }
    }

    /// Write one flag from a 0/1 value.
    pub fn set_flag(&mut self, b: &mut IrBuilder, flag: Flag, value: impl Into<Operand>) {
        let value = value.into();
        match flag {
            Flag::Pf => {
                // Store a byte with matching parity: 0 for PF=1 (even),
                // 1 for PF=0.
                let inverted = b.xor(OpSize::B64, value, Operand::Const(1));
                Self::store_reg(b, ArchReg::Pf, inverted);
            }
            Flag::Af => {
                let shifted = b.lshl(OpSize::B64, value, Operand::Const(4));
                Self::store_reg(b, ArchReg::Af, shifted);
            }
            Flag::Df => {
                // 0/1 -> +1/-1: df = 1 - 2*value.
                let doubled = b.lshl(OpSize::B64, value, Operand::Const(1));
                let df = b.sub(OpSize::B64, Operand::Const(1), doubled);
                Self::store_reg(b, ArchReg::Df, df);
            }
            _ => {
                if flag == Flag::Cf {
                    // Keep the invariant simple: rectify, then insert the
                    // x86-convention carry.
                    self.rectify_carry_invert(b, false);
                }
                let bit = flag.nzcv_bit().unwrap();
                let nzcv = self.get_nzcv(b);
                let updated = b.bfi(OpSize::B32, 1, bit as u8, nzcv, value);
                self.set_nzcv(updated);
            }
        }
    }

    /// Flush the cache to the context word. Called at block boundaries
    /// after rectifying to the ABI polarity.
    pub fn flush(&mut self, b: &mut IrBuilder) {
        if self.dirty {
            if let Some(v) = self.cached {
                b.store_context(OpSize::B32, RegClass::Gpr, layout::NZCV as u32, v);
            }
            self.dirty = false;
        }
    }

    /// Block-boundary reconciliation: rectify the carry to the ABI
    /// convention and write the cache back.
    pub fn finalize(&mut self, b: &mut IrBuilder) {
        if self.cached.is_some() || self.cf_inverted {
            self.rectify_carry_invert(b, false);
        }
        self.flush(b);
        self.cached = None;
    }

    fn load_reg(b: &mut IrBuilder, reg: ArchReg) -> ValueId {
        let dst = b.alloc_value();
        b.push(Instr::LoadRegister { dst, reg });
        dst
    }

    fn store_reg(b: &mut IrBuilder, reg: ArchReg, value: impl Into<Operand>) {
        b.push(Instr::StoreRegister {
            reg,
            value: value.into(),
        });
    }
}

/// Byte location of a flag in the context flag array, for frontends that
/// spill individual bits.
pub fn flag_byte_offset(flag: Flag) -> usize {
    let loc = match flag {
        Flag::Cf => flag_loc::CF,
        Flag::Pf => flag_loc::PF,
        Flag::Af => flag_loc::AF,
        Flag::Zf => flag_loc::ZF,
        Flag::Sf => flag_loc::SF,
        Flag::Of => flag_loc::OF,
        Flag::Df => flag_loc::DF,
    };
    layout::FLAGS + loc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Opcode;

    fn ops_of(block: &crate::IrBlock) -> Vec<Opcode> {
        block.blocks[0].instrs.iter().map(|i| i.opcode()).collect()
    }

    #[test]
    fn rectify_is_a_noop_when_polarity_matches() {
        let mut b = IrBuilder::new();
        let mut t = FlagTracker::new();
        t.rectify_carry_invert(&mut b, false);
        b.exit_function(Operand::Const(0));
        let block = b.finish();
        assert_eq!(ops_of(&block), vec![Opcode::ExitFunction]);
    }

    #[test]
    fn rectify_flips_carry_bit() {
        let mut b = IrBuilder::new();
        let mut t = FlagTracker::new();
        t.carry_invert();
        t.rectify_carry_invert(&mut b, false);
        assert!(!t.cf_inverted());
        b.exit_function(Operand::Const(0));
        let block = b.finish();
        // LoadContext (cache fill) + Xor of the carry bit.
        assert_eq!(
            ops_of(&block),
            vec![Opcode::LoadContext, Opcode::AluBin, Opcode::ExitFunction]
        );
    }

    #[test]
    fn set_nz_zero_cv_small_sizes_use_testnz() {
        let mut b = IrBuilder::new();
        let mut t = FlagTracker::new();
        let v = b.const_int(0x80);
        t.set_nz_zero_cv(&mut b, OpSize::B8, v);
        assert!(!t.cf_inverted());
        b.exit_function(Operand::Const(0));
        let block = b.finish();
        assert!(ops_of(&block).contains(&Opcode::TestNz));
    }

    #[test]
    fn set_nz_zero_cv_wide_sizes_invert_carry() {
        let mut b = IrBuilder::new();
        let mut t = FlagTracker::new();
        let v = b.const_int(0x80);
        t.set_nz_zero_cv(&mut b, OpSize::B64, v);
        assert!(t.cf_inverted());
        b.exit_function(Operand::Const(0));
        let block = b.finish();
        assert!(ops_of(&block).contains(&Opcode::SubNzcv));
    }

    #[test]
    fn finalize_rectifies_and_flushes() {
        let mut b = IrBuilder::new();
        let mut t = FlagTracker::new();
        let v = b.const_int(0x80);
        t.set_nz_zero_cv(&mut b, OpSize::B64, v);
        t.finalize(&mut b);
        assert!(!t.cf_inverted());
        b.exit_function(Operand::Const(0));
        let block = b.finish();
        let ops = ops_of(&block);
        // The flush must store the rectified NZCV word back to context.
        assert!(ops.contains(&Opcode::StoreContext));
        assert_eq!(block.validate(), Ok(()));
    }

    #[test]
    fn df_writes_store_plus_minus_one() {
        let mut b = IrBuilder::new();
        let mut t = FlagTracker::new();
        t.set_flag(&mut b, Flag::Df, Operand::Const(1));
        b.exit_function(Operand::Const(0));
        let block = b.finish();
        assert!(ops_of(&block).contains(&Opcode::StoreRegister));
        assert_eq!(block.validate(), Ok(()));
    }

    #[test]
    fn cf_read_rectifies_first() {
        let mut b = IrBuilder::new();
        let mut t = FlagTracker::new();
        t.carry_invert();
        let _cf = t.get_flag(&mut b, Flag::Cf);
        assert!(!t.cf_inverted());
        b.exit_function(Operand::Const(0));
        assert_eq!(b.finish().validate(), Ok(()));
    }
}
