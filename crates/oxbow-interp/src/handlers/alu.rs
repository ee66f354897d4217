//! Integer ALU, bitfield, bit-scatter, flag-emission, and select
//! handlers.

use super::{set, sext};
use crate::{HandlerTable, Interp, InterpError};
use oxbow_ir::ops::{AluBinOp, AluUnOp, LongDivOp};
use oxbow_ir::{Instr, Opcode};
use oxbow_types::{nzcv, OpSize};

pub(crate) fn register(table: &mut HandlerTable) {
    set(table, Opcode::Const, const_int);
    set(table, Opcode::VectorConst, vector_const);
    set(table, Opcode::NamedVectorConst, named_vector_const);
    set(table, Opcode::EntrypointOffset, entrypoint_offset);
    set(table, Opcode::AluBin, alu_bin);
    set(table, Opcode::AluUn, alu_un);
    set(table, Opcode::MulWide, mul_wide);
    set(table, Opcode::MulHigh, mul_high);
    set(table, Opcode::LongDivide, long_divide);
    set(table, Opcode::TruncElementPair, trunc_element_pair);
    set(table, Opcode::Bfe, bfe);
    set(table, Opcode::Bfi, bfi);
    set(table, Opcode::Pdep, pdep);
    set(table, Opcode::Pext, pext);
    set(table, Opcode::AddNzcv, add_nzcv);
    set(table, Opcode::SubNzcv, sub_nzcv);
    set(table, Opcode::TestNz, test_nz);
    set(table, Opcode::Select, select);
}

fn const_int(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::Const { dst, value } = *instr else {
        unreachable!()
    };
    interp.ssa.write_u64(dst, value);
    Ok(())
}

fn vector_const(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VectorConst { dst, value } = *instr else {
        unreachable!()
    };
    interp.ssa.write_u128(dst, value);
    Ok(())
}

fn named_vector_const(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::NamedVectorConst { dst, constant } = *instr else {
        unreachable!()
    };
    interp.ssa.write_u128(dst, constant.bits());
    Ok(())
}

fn entrypoint_offset(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::EntrypointOffset { dst, size, offset } = *instr else {
        unreachable!()
    };
    let value = interp.entry_rip.wrapping_add(offset as u64);
    let mask = if size == OpSize::B32 {
        0xFFFF_FFFF
    } else {
        u64::MAX
    };
    interp.ssa.write_u64(dst, value & mask);
    Ok(())
}

fn alu_bin(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::AluBin {
        dst,
        op,
        size,
        ref lhs,
        ref rhs,
    } = *instr
    else {
        unreachable!()
    };
    let a = interp.ssa.operand_sized(lhs, size);
    let b = interp.ssa.operand_sized(rhs, size);
    let bits = size.bits();
    let result = match op {
        AluBinOp::Add => a.wrapping_add(b),
        AluBinOp::Sub => a.wrapping_sub(b),
        AluBinOp::And => a & b,
        AluBinOp::Or => a | b,
        AluBinOp::Xor => a ^ b,
        AluBinOp::Andn => a & !b,
        // Shift amounts are masked to size-1 bits, matching x86.
        AluBinOp::Lshl => a.wrapping_shl(b as u32 & (bits - 1)),
        AluBinOp::Lshr => a.wrapping_shr(b as u32 & (bits - 1)),
        AluBinOp::Ashr => (sext(size, a) >> (b as u32 & (bits - 1))) as u64,
        AluBinOp::Ror => {
            let amount = b as u32 & (bits - 1);
            if amount == 0 {
                a
            } else {
                (a >> amount) | (a << (bits - amount))
            }
        }
        AluBinOp::Mul => (sext(size, a).wrapping_mul(sext(size, b))) as u64,
        AluBinOp::UMul => a.wrapping_mul(b),
        // Trap-free: the frontend guards divide-by-zero and overflow.
        AluBinOp::Div => {
            let (a, b) = (sext(size, a), sext(size, b));
            if b == 0 {
                0
            } else {
                a.wrapping_div(b) as u64
            }
        }
        AluBinOp::UDiv => {
            if b == 0 {
                0
            } else {
                a / b
            }
        }
        AluBinOp::Rem => {
            let (a, b) = (sext(size, a), sext(size, b));
            if b == 0 {
                0
            } else {
                a.wrapping_rem(b) as u64
            }
        }
        AluBinOp::URem => {
            if b == 0 {
                0
            } else {
                a % b
            }
        }
    };
    interp.ssa.write_scalar(dst, size, result);
    Ok(())
}

fn alu_un(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::AluUn {
        dst,
        op,
        size,
        ref src,
    } = *instr
    else {
        unreachable!()
    };
    let v = interp.ssa.operand_sized(src, size);
    let bits = size.bits();
    let result = match op {
        AluUnOp::Neg => (v as i64).wrapping_neg() as u64,
        AluUnOp::Abs => sext(size, v).unsigned_abs(),
        AluUnOp::Not => !v,
        AluUnOp::Popcount => v.count_ones() as u64,
        AluUnOp::FindLsb => {
            if v == 0 {
                u64::MAX
            } else {
                v.trailing_zeros() as u64
            }
        }
        AluUnOp::FindMsb => {
            // Index of the highest set bit within the operation size.
            if v == 0 {
                u64::MAX
            } else {
                (bits - 1 - v.leading_zeros().saturating_sub(64 - bits)) as u64
            }
        }
        AluUnOp::CountLeadingZeroes => (v.leading_zeros() - (64 - bits)) as u64,
        AluUnOp::Rev => match size {
            OpSize::B16 => (v as u16).swap_bytes() as u64,
            OpSize::B32 => (v as u32).swap_bytes() as u64,
            OpSize::B64 => v.swap_bytes(),
            _ => {
                debug_assert!(false, "unsupported Rev size {size:?}");
                v
            }
        },
    };
    interp.ssa.write_scalar(dst, size, result);
    Ok(())
}

fn mul_wide(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::MulWide {
        dst,
        size,
        signed,
        ref lhs,
        ref rhs,
    } = *instr
    else {
        unreachable!()
    };
    // `size` is the result size; sources are half as wide.
    let src_size = OpSize::from_bytes(size.bytes() / 2).expect("valid half size");
    let a = interp.ssa.operand_sized(lhs, src_size);
    let b = interp.ssa.operand_sized(rhs, src_size);
    if size == OpSize::B128 {
        let product = if signed {
            (sext(src_size, a) as i128).wrapping_mul(sext(src_size, b) as i128) as u128
        } else {
            (a as u128) * (b as u128)
        };
        interp.ssa.write_u128(dst, product);
    } else {
        let product = if signed {
            sext(src_size, a).wrapping_mul(sext(src_size, b)) as u64
        } else {
            a.wrapping_mul(b)
        };
        interp.ssa.write_scalar(dst, size, product);
    }
    Ok(())
}

fn mul_high(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::MulHigh {
        dst,
        size,
        signed,
        ref lhs,
        ref rhs,
    } = *instr
    else {
        unreachable!()
    };
    let a = interp.ssa.operand_sized(lhs, size);
    let b = interp.ssa.operand_sized(rhs, size);
    let bits = size.bits();
    let high = if signed {
        ((sext(size, a) as i128).wrapping_mul(sext(size, b) as i128) >> bits) as u64
    } else {
        (((a as u128) * (b as u128)) >> bits) as u64
    };
    interp.ssa.write_scalar(dst, size, high);
    Ok(())
}

fn long_divide(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::LongDivide {
        dst,
        op,
        size,
        ref hi,
        ref lo,
        ref divisor,
    } = *instr
    else {
        unreachable!()
    };
    let bits = size.bits();
    let hi_v = interp.ssa.operand_sized(hi, size);
    let lo_v = interp.ssa.operand_sized(lo, size);
    let div_v = interp.ssa.operand_sized(divisor, size);

    // x86 DIV: the dividend spans two registers. The frontend has
    // already guarded the zero-divisor and overflow cases.
    let dividend_u = ((hi_v as u128) << bits) | lo_v as u128;
    let result = match op {
        LongDivOp::UDiv | LongDivOp::URem => {
            if div_v == 0 {
                0
            } else {
                match op {
                    LongDivOp::UDiv => (dividend_u / div_v as u128) as u64,
                    _ => (dividend_u % div_v as u128) as u64,
                }
            }
        }
        LongDivOp::Div | LongDivOp::Rem => {
            let shift = 128 - 2 * bits;
            let dividend = ((dividend_u << shift) as i128) >> shift;
            let div_s = sext(size, div_v) as i128;
            if div_s == 0 {
                0
            } else {
                match op {
                    LongDivOp::Div => dividend.wrapping_div(div_s) as u64,
                    _ => dividend.wrapping_rem(div_s) as u64,
                }
            }
        }
    };
    interp.ssa.write_scalar(dst, size, result);
    Ok(())
}

fn trunc_element_pair(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::TruncElementPair {
        dst,
        ref lo,
        ref hi,
    } = *instr
    else {
        unreachable!()
    };
    let lo_v = interp.ssa.operand(lo) & 0xFFFF_FFFF;
    let hi_v = interp.ssa.operand(hi);
    interp.ssa.write_u64(dst, lo_v | (hi_v << 32));
    Ok(())
}

fn bfe(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::Bfe {
        dst,
        size,
        signed,
        width,
        lsb,
        ref src,
    } = *instr
    else {
        unreachable!()
    };
    debug_assert!(width >= 1 && u32::from(width) <= size.bits());
    let v = interp.ssa.operand_sized(src, size);
    let field = (v >> lsb) & width_mask(width);
    let result = if signed && field >> (width - 1) & 1 == 1 {
        field | !width_mask(width)
    } else {
        field
    };
    interp.ssa.write_scalar(dst, size, result);
    Ok(())
}

fn width_mask(width: u8) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

fn bfi(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::Bfi {
        dst,
        size,
        xil,
        width,
        lsb,
        ref base,
        ref insert,
    } = *instr
    else {
        unreachable!()
    };
    let base_v = interp.ssa.operand_sized(base, size);
    let insert_v = interp.ssa.operand(insert);
    let mask = width_mask(width);
    let result = if xil {
        // BFXIL: extract [lsb +: width] of the source into the low bits.
        (base_v & !mask) | ((insert_v >> lsb) & mask)
    } else {
        // BFI: deposit the source's low bits at [lsb +: width].
        (base_v & !(mask << lsb)) | ((insert_v & mask) << lsb)
    };
    interp.ssa.write_scalar(dst, size, result);
    Ok(())
}

fn pdep(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::Pdep {
        dst,
        size,
        ref src,
        ref mask,
    } = *instr
    else {
        unreachable!()
    };
    let src_v = interp.ssa.operand_sized(src, size);
    let mut mask_v = interp.ssa.operand_sized(mask, size);
    // Bit-by-bit scatter, independent of host BMI2 support.
    let mut result = 0u64;
    let mut take = 0u32;
    while mask_v != 0 {
        let bit = mask_v.trailing_zeros();
        result |= ((src_v >> take) & 1) << bit;
        take += 1;
        mask_v &= mask_v - 1;
    }
    interp.ssa.write_scalar(dst, size, result);
    Ok(())
}

fn pext(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::Pext {
        dst,
        size,
        ref src,
        ref mask,
    } = *instr
    else {
        unreachable!()
    };
    let src_v = interp.ssa.operand_sized(src, size);
    let mut mask_v = interp.ssa.operand_sized(mask, size);
    let mut result = 0u64;
    let mut put = 0u32;
    while mask_v != 0 {
        let bit = mask_v.trailing_zeros();
        result |= ((src_v >> bit) & 1) << put;
        put += 1;
        mask_v &= mask_v - 1;
    }
    interp.ssa.write_scalar(dst, size, result);
    Ok(())
}

/// Assemble an NZCV word at the canonical bit positions.
fn pack_nzcv(n: bool, z: bool, c: bool, v: bool) -> u64 {
    (n as u64) << nzcv::N_BIT | (z as u64) << nzcv::Z_BIT | (c as u64) << nzcv::C_BIT
        | (v as u64) << nzcv::V_BIT
}

fn add_nzcv(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::AddNzcv {
        dst,
        size,
        ref lhs,
        ref rhs,
    } = *instr
    else {
        unreachable!()
    };
    let bits = size.bits();
    let a = interp.ssa.operand_sized(lhs, size);
    let b = interp.ssa.operand_sized(rhs, size);
    let result = size.truncate(a.wrapping_add(b));
    let sign = 1u64 << (bits - 1);

    let n = result & sign != 0;
    let z = result == 0;
    let c = ((a as u128) + (b as u128)) >> bits != 0;
    let v = (a ^ result) & (b ^ result) & sign != 0;
    interp.ssa.write_u64(dst, pack_nzcv(n, z, c, v));
    Ok(())
}

fn sub_nzcv(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::SubNzcv {
        dst,
        size,
        ref lhs,
        ref rhs,
        invert_carry,
    } = *instr
    else {
        unreachable!()
    };
    let bits = size.bits();
    let a = interp.ssa.operand_sized(lhs, size);
    let b = interp.ssa.operand_sized(rhs, size);
    let result = size.truncate(a.wrapping_sub(b));
    let sign = 1u64 << (bits - 1);

    let n = result & sign != 0;
    let z = result == 0;
    let borrow = a < b;
    // x86 carries the borrow; arm64 carries its complement.
    let c = if invert_carry { !borrow } else { borrow };
    let v = (a ^ b) & (a ^ result) & sign != 0;
    interp.ssa.write_u64(dst, pack_nzcv(n, z, c, v));
    Ok(())
}

fn test_nz(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::TestNz {
        dst,
        size,
        ref lhs,
        ref rhs,
    } = *instr
    else {
        unreachable!()
    };
    let bits = size.bits();
    let v = interp.ssa.operand_sized(lhs, size) & interp.ssa.operand_sized(rhs, size);
    let n = v >> (bits - 1) & 1 == 1;
    interp.ssa.write_u64(dst, pack_nzcv(n, v == 0, false, false));
    Ok(())
}

fn select(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::Select {
        dst,
        size,
        compare_size,
        cond,
        ref cmp1,
        ref cmp2,
        ref true_val,
        ref false_val,
    } = *instr
    else {
        unreachable!()
    };
    let a = interp.ssa.operand(cmp1);
    let b = interp.ssa.operand(cmp2);
    let taken = cond.eval(compare_size, a, b);
    let result = interp.ssa.operand(if taken { true_val } else { false_val });
    interp.ssa.write_scalar(dst, size, result);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{execute_block, ExecResult, NullHost, VecMem};
    use oxbow_cpu::CpuState;
    use oxbow_ir::ops::{AluBinOp, AluUnOp};
    use oxbow_ir::{Instr, IrBuilder, Operand, ValueId};
    use oxbow_types::{nzcv, CondCode, OpSize, RegClass};

    fn run_and_read(
        build: impl FnOnce(&mut IrBuilder) -> ValueId,
    ) -> (CpuState, Vec<u8>) {
        let mut b = IrBuilder::new();
        let out = build(&mut b);
        b.store_context(
            OpSize::B256,
            RegClass::Fpr,
            oxbow_cpu::layout::vector(0) as u32,
            out,
        );
        b.exit_function(Operand::Const(0));
        let block = b.finish();
        block.validate().unwrap();
        let mut state = CpuState::default();
        let mut mem = VecMem::new(0x100);
        let mut host = NullHost;
        let r = execute_block(&block, &mut state, &mut mem, &mut host).unwrap();
        assert_eq!(r, ExecResult::Exit);
        let bytes = state.vectors[0].0.to_vec();
        (state, bytes)
    }

    fn run_u64(build: impl FnOnce(&mut IrBuilder) -> ValueId) -> u64 {
        let (_, bytes) = run_and_read(build);
        u64::from_le_bytes(bytes[..8].try_into().unwrap())
    }

    fn run_u128(build: impl FnOnce(&mut IrBuilder) -> ValueId) -> u128 {
        let (_, bytes) = run_and_read(build);
        u128::from_le_bytes(bytes[..16].try_into().unwrap())
    }

    #[test]
    fn shifts_mask_their_amount() {
        assert_eq!(
            run_u64(|b| b.alu(AluBinOp::Lshl, OpSize::B32, Operand::Const(1), Operand::Const(33))),
            2
        );
        assert_eq!(
            run_u64(|b| b.alu(AluBinOp::Lshr, OpSize::B64, Operand::Const(0x10), Operand::Const(68))),
            1
        );
    }

    #[test]
    fn ror_rotates_within_size() {
        assert_eq!(
            run_u64(|b| b.alu(AluBinOp::Ror, OpSize::B32, Operand::Const(0x1), Operand::Const(4))),
            0x1000_0000
        );
    }

    #[test]
    fn andn_is_bmi1_shape() {
        // a & !b
        assert_eq!(
            run_u64(|b| b.alu(
                AluBinOp::Andn,
                OpSize::B64,
                Operand::Const(0xFF),
                Operand::Const(0x0F)
            )),
            0xF0
        );
    }

    #[test]
    fn widening_multiply_128() {
        // -1 * 2 widened to 128 bits: low = ..FFFE, high = all ones
        // (two's complement -2).
        let v = run_u128(|b| {
            let dst = b.alloc_value();
            b.push(Instr::MulWide {
                dst,
                size: OpSize::B128,
                signed: true,
                lhs: Operand::Const(0xFFFF_FFFF_FFFF_FFFF),
                rhs: Operand::Const(2),
            });
            dst
        });
        assert_eq!(v as u64, 0xFFFF_FFFF_FFFF_FFFE);
        assert_eq!((v >> 64) as u64, u64::MAX);

        let v = run_u128(|b| {
            let dst = b.alloc_value();
            b.push(Instr::MulWide {
                dst,
                size: OpSize::B128,
                signed: false,
                lhs: Operand::Const(0xFFFF_FFFF_FFFF_FFFF),
                rhs: Operand::Const(2),
            });
            dst
        });
        assert_eq!(v as u64, 0xFFFF_FFFF_FFFF_FFFE);
        assert_eq!((v >> 64) as u64, 0x1);
    }

    #[test]
    fn mul_high_halves() {
        let v = run_u64(|b| {
            let dst = b.alloc_value();
            b.push(Instr::MulHigh {
                dst,
                size: OpSize::B64,
                signed: false,
                lhs: Operand::Const(u64::MAX),
                rhs: Operand::Const(u64::MAX),
            });
            dst
        });
        assert_eq!(v, u64::MAX - 1);
    }

    #[test]
    fn long_divide_x86_shape() {
        // 0x1_0000_0005 / 0x10 at 32-bit: dividend spans two registers.
        let v = run_u64(|b| {
            let dst = b.alloc_value();
            b.push(Instr::LongDivide {
                dst,
                op: oxbow_ir::ops::LongDivOp::UDiv,
                size: OpSize::B32,
                hi: Operand::Const(1),
                lo: Operand::Const(5),
                divisor: Operand::Const(0x10),
            });
            dst
        });
        assert_eq!(v, 0x1000_0000);
    }

    #[test]
    fn bitfield_ops() {
        assert_eq!(run_u64(|b| b.bfe(OpSize::B64, 8, 8, Operand::Const(0xABCD))), 0xAB);
        assert_eq!(
            run_u64(|b| b.bfi(OpSize::B64, 8, 8, Operand::Const(0xFF00FF), Operand::Const(0x12))),
            0xFF12FF
        );
    }

    #[test]
    fn sbfe_sign_extends() {
        let v = run_u64(|b| {
            let dst = b.alloc_value();
            b.push(Instr::Bfe {
                dst,
                size: OpSize::B64,
                signed: true,
                width: 4,
                lsb: 0,
                src: Operand::Const(0b1000),
            });
            dst
        });
        assert_eq!(v as i64, -8);
    }

    #[test]
    fn pdep_pext_roundtrip() {
        let mask = 0b1010_1010u64;
        let v = run_u64(|b| {
            let deposited = b.alloc_value();
            b.push(Instr::Pdep {
                dst: deposited,
                size: OpSize::B64,
                src: Operand::Const(0b1011),
                mask: Operand::Const(mask),
            });
            deposited
        });
        assert_eq!(v, 0b1000_1010);

        let back = run_u64(|b| {
            let extracted = b.alloc_value();
            b.push(Instr::Pext {
                dst: extracted,
                size: OpSize::B64,
                src: Operand::Const(0b1000_1010),
                mask: Operand::Const(mask),
            });
            extracted
        });
        assert_eq!(back, 0b1011);
    }

    #[test]
    fn sub_nzcv_carry_polarity() {
        let emit = |invert: bool| {
            run_u64(move |b| {
                let dst = b.alloc_value();
                b.push(Instr::SubNzcv {
                    dst,
                    size: OpSize::B64,
                    lhs: Operand::Const(1),
                    rhs: Operand::Const(2),
                    invert_carry: invert,
                });
                dst
            })
        };
        // 1 - 2 borrows: x86 CF=1, arm64 C=0.
        assert_ne!(emit(false) & nzcv::C, 0);
        assert_eq!(emit(true) & nzcv::C, 0);
        // Both agree on N.
        assert_ne!(emit(false) & nzcv::N, 0);
    }

    #[test]
    fn add_nzcv_overflow() {
        let v = run_u64(|b| {
            let dst = b.alloc_value();
            b.push(Instr::AddNzcv {
                dst,
                size: OpSize::B32,
                lhs: Operand::Const(0x7FFF_FFFF),
                rhs: Operand::Const(1),
            });
            dst
        });
        assert_ne!(v & nzcv::V, 0, "signed overflow must set V");
        assert_ne!(v & nzcv::N, 0);
        assert_eq!(v & nzcv::C, 0);
    }

    #[test]
    fn select_signed_vs_unsigned() {
        let v = run_u64(|b| {
            b.select(
                OpSize::B64,
                OpSize::B32,
                CondCode::Slt,
                Operand::Const(0xFFFF_FFFF), // -1 at 32 bits
                Operand::Const(1),
                Operand::Const(111),
                Operand::Const(222),
            )
        });
        assert_eq!(v, 111);
    }

    #[test]
    fn neg_and_clz() {
        assert_eq!(
            run_u64(|b| {
                let dst = b.alloc_value();
                b.push(Instr::AluUn {
                    dst,
                    op: AluUnOp::Neg,
                    size: OpSize::B64,
                    src: Operand::Const(5),
                });
                dst
            }) as i64,
            -5
        );
        assert_eq!(
            run_u64(|b| {
                let dst = b.alloc_value();
                b.push(Instr::AluUn {
                    dst,
                    op: AluUnOp::CountLeadingZeroes,
                    size: OpSize::B32,
                    src: Operand::Const(0x10),
                });
                dst
            }),
            27
        );
    }

    #[test]
    fn rev_swaps_bytes() {
        assert_eq!(
            run_u64(|b| {
                let dst = b.alloc_value();
                b.push(Instr::AluUn {
                    dst,
                    op: AluUnOp::Rev,
                    size: OpSize::B32,
                    src: Operand::Const(0x1122_3344),
                });
                dst
            }),
            0x4433_2211
        );
    }
}
