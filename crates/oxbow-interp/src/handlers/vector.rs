//! Vector SIMD handlers: element-wise integer and float operations over
//! 1/2/4/8-byte lanes at 128/256-bit widths.
//!
//! Widening ops take `elem` as the destination lane size (sources are
//! half as wide); narrowing ops likewise name the destination lane.

use super::{set, sext};
use crate::{HandlerTable, Interp, InterpError};
use oxbow_ir::ops::{VBinOp, VShiftImmOp, VShiftInsertOp, VUnOp};
use oxbow_ir::{Instr, Opcode};
use oxbow_types::{OpSize, VectorReg};

pub(crate) fn register(table: &mut HandlerTable) {
    set(table, Opcode::VBin, vbin);
    set(table, Opcode::VUn, vun);
    set(table, Opcode::VShiftScalar, vshift_scalar);
    set(table, Opcode::VShiftImm, vshift_imm);
    set(table, Opcode::VShiftInsert, vshift_insert);
    set(table, Opcode::VInsElement, vins_element);
    set(table, Opcode::VInsScalar, vins_scalar);
    set(table, Opcode::VExtractToGpr, vextract_to_gpr);
    set(table, Opcode::VDupElement, vdup_element);
    set(table, Opcode::VExtr, vextr);
    set(table, Opcode::VTbl1, vtbl1);
    set(table, Opcode::VBsl, vbsl);
    set(table, Opcode::VFcadd, vfcadd);
    set(table, Opcode::VBitcast, vbitcast);
    set(table, Opcode::VCastFromGpr, vcast_from_gpr);
}

/// Read lane `i` zero-extended.
pub(crate) fn lane_u(v: &VectorReg, elem: OpSize, i: usize) -> u64 {
    match elem {
        OpSize::B8 => v.u8_at(i) as u64,
        OpSize::B16 => v.u16_at(i) as u64,
        OpSize::B32 => v.u32_at(i) as u64,
        OpSize::B64 => v.u64_at(i),
        _ => unreachable!("bad lane size {elem:?}"),
    }
}

/// Read lane `i` sign-extended.
pub(crate) fn lane_i(v: &VectorReg, elem: OpSize, i: usize) -> i64 {
    sext(elem, lane_u(v, elem, i))
}

pub(crate) fn set_lane(v: &mut VectorReg, elem: OpSize, i: usize, value: u64) {
    match elem {
        OpSize::B8 => v.set_u8(i, value as u8),
        OpSize::B16 => v.set_u16(i, value as u16),
        OpSize::B32 => v.set_u32(i, value as u32),
        OpSize::B64 => v.set_u64(i, value),
        _ => unreachable!("bad lane size {elem:?}"),
    }
}

fn lane_count(size: OpSize, elem: OpSize) -> usize {
    size.bytes() / elem.bytes()
}

fn all_ones(elem: OpSize) -> u64 {
    elem.mask()
}

fn half_size(elem: OpSize) -> OpSize {
    OpSize::from_bytes(elem.bytes() / 2).expect("widening from a valid half size")
}

fn double_size(elem: OpSize) -> OpSize {
    OpSize::from_bytes(elem.bytes() * 2).expect("narrowing from a valid double size")
}

fn sat_signed(elem: OpSize, v: i64) -> u64 {
    let max = (all_ones(elem) >> 1) as i64;
    let min = -max - 1;
    v.clamp(min, max) as u64
}

fn sat_unsigned(elem: OpSize, v: i64) -> u64 {
    let max = all_ones(elem) as i64;
    // Widened arithmetic never exceeds i64 range for lanes <= 32 bits.
    v.clamp(0, max) as u64
}

/// Float lane op helper: apply at the lane's width.
fn fop2(elem: OpSize, a: u64, b: u64, f: impl Fn(f64, f64) -> f64) -> u64 {
    match elem {
        OpSize::B32 => f(f32::from_bits(a as u32) as f64, f32::from_bits(b as u32) as f64)
            .to_f32_bits(),
        OpSize::B64 => f(f64::from_bits(a), f64::from_bits(b)).to_bits(),
        _ => unreachable!("bad float lane size {elem:?}"),
    }
}

fn fcmp2(elem: OpSize, a: u64, b: u64, f: impl Fn(f64, f64) -> bool) -> u64 {
    let hit = match elem {
        OpSize::B32 => f(f32::from_bits(a as u32) as f64, f32::from_bits(b as u32) as f64),
        OpSize::B64 => f(f64::from_bits(a), f64::from_bits(b)),
        _ => unreachable!("bad float lane size {elem:?}"),
    };
    if hit {
        all_ones(elem)
    } else {
        0
    }
}

trait ToF32Bits {
    fn to_f32_bits(self) -> u64;
}

impl ToF32Bits for f64 {
    fn to_f32_bits(self) -> u64 {
        (self as f32).to_bits() as u64
    }
}

fn vbin(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VBin {
        dst,
        op,
        size,
        elem,
        lhs,
        rhs,
    } = *instr
    else {
        unreachable!()
    };
    let a = interp.ssa.read_vector(lhs);
    let b = interp.ssa.read_vector(rhs);
    let mut out = VectorReg::default();
    let lanes = lane_count(size, elem);

    use VBinOp::*;
    match op {
        And | Bic | Or | Xor => {
            for i in 0..size.bytes() {
                let (x, y) = (a.u8_at(i), b.u8_at(i));
                out.set_u8(
                    i,
                    match op {
                        And => x & y,
                        Bic => x & !y,
                        Or => x | y,
                        _ => x ^ y,
                    },
                );
            }
        }
        UMull | SMull | UMull2 | SMull2 | UAbdl => {
            // elem names the widened destination lane.
            let src_elem = half_size(elem);
            let base = if matches!(op, UMull2 | SMull2) { lanes } else { 0 };
            for i in 0..lanes {
                let value = match op {
                    UMull | UMull2 => {
                        lane_u(&a, src_elem, base + i).wrapping_mul(lane_u(&b, src_elem, base + i))
                    }
                    SMull | SMull2 => lane_i(&a, src_elem, base + i)
                        .wrapping_mul(lane_i(&b, src_elem, base + i))
                        as u64,
                    _ => lane_u(&a, src_elem, i).abs_diff(lane_u(&b, src_elem, i)),
                };
                set_lane(&mut out, elem, i, value);
            }
        }
        AddP => {
            // Pairwise over the concatenation a:b.
            let half = lanes / 2;
            for i in 0..half {
                let v = lane_u(&a, elem, 2 * i).wrapping_add(lane_u(&a, elem, 2 * i + 1));
                set_lane(&mut out, elem, i, v);
                let v = lane_u(&b, elem, 2 * i).wrapping_add(lane_u(&b, elem, 2 * i + 1));
                set_lane(&mut out, elem, half + i, v);
            }
        }
        Zip | Zip2 => {
            let half = lanes / 2;
            let base = if op == Zip2 { half } else { 0 };
            for i in 0..half {
                set_lane(&mut out, elem, 2 * i, lane_u(&a, elem, base + i));
                set_lane(&mut out, elem, 2 * i + 1, lane_u(&b, elem, base + i));
            }
        }
        Uzp | Uzp2 => {
            let half = lanes / 2;
            let odd = (op == Uzp2) as usize;
            for i in 0..half {
                set_lane(&mut out, elem, i, lane_u(&a, elem, 2 * i + odd));
                set_lane(&mut out, elem, half + i, lane_u(&b, elem, 2 * i + odd));
            }
        }
        Trn | Trn2 => {
            let odd = (op == Trn2) as usize;
            for i in 0..lanes / 2 {
                set_lane(&mut out, elem, 2 * i, lane_u(&a, elem, 2 * i + odd));
                set_lane(&mut out, elem, 2 * i + 1, lane_u(&b, elem, 2 * i + odd));
            }
        }
        SqXtn2 | SqXtun2 => {
            // Narrow b's wide lanes into the high half, preserving a's
            // low half.
            let src_elem = double_size(elem);
            let half = lanes / 2;
            out = a;
            for i in 0..half {
                let wide = lane_i(&b, src_elem, i);
                let narrowed = if op == SqXtn2 {
                    sat_signed(elem, wide)
                } else {
                    sat_unsigned(elem, wide)
                };
                set_lane(&mut out, elem, half + i, narrowed);
            }
            // Clear anything above the operation size.
            for i in size.bytes()..32 {
                out.set_u8(i, 0);
            }
        }
        _ => {
            for i in 0..lanes {
                let x = lane_u(&a, elem, i);
                let y = lane_u(&b, elem, i);
                let value = match op {
                    Add => x.wrapping_add(y),
                    Sub => x.wrapping_sub(y),
                    UqAdd => (x as u128 + y as u128).min(all_ones(elem) as u128) as u64,
                    UqSub => x.saturating_sub(y),
                    SqAdd => sat_signed(elem, sext(elem, x).wrapping_add(sext(elem, y))),
                    SqSub => sat_signed(elem, sext(elem, x).wrapping_sub(sext(elem, y))),
                    UMin => x.min(y),
                    UMax => x.max(y),
                    SMin => sext(elem, x).min(sext(elem, y)) as u64,
                    SMax => sext(elem, x).max(sext(elem, y)) as u64,
                    Mul => x.wrapping_mul(y),
                    FAdd => fop2(elem, x, y, |p, q| p + q),
                    FSub => fop2(elem, x, y, |p, q| p - q),
                    FMul => fop2(elem, x, y, |p, q| p * q),
                    FDiv => fop2(elem, x, y, |p, q| p / q),
                    FMin => fop2(elem, x, y, f64::min),
                    FMax => fop2(elem, x, y, f64::max),
                    CmpEq => {
                        if x == y {
                            all_ones(elem)
                        } else {
                            0
                        }
                    }
                    CmpGt => {
                        if sext(elem, x) > sext(elem, y) {
                            all_ones(elem)
                        } else {
                            0
                        }
                    }
                    FCmpEq => fcmp2(elem, x, y, |p, q| p == q),
                    FCmpNeq => fcmp2(elem, x, y, |p, q| p != q),
                    FCmpLt => fcmp2(elem, x, y, |p, q| p < q),
                    // gt(a, b) == lt(b, a); spelled out to keep the
                    // operand order explicit.
                    FCmpGt => fcmp2(elem, x, y, |p, q| q < p),
                    FCmpLe => fcmp2(elem, x, y, |p, q| p <= q),
                    FCmpOrd => fcmp2(elem, x, y, |p, q| !p.is_nan() && !q.is_nan()),
                    FCmpUno => fcmp2(elem, x, y, |p, q| p.is_nan() || q.is_nan()),
                    UShl => {
                        let amount = y as u8 as u32;
                        if amount >= elem.bits() {
                            0
                        } else {
                            x << amount
                        }
                    }
                    UShr => {
                        let amount = y as u8 as u32;
                        if amount >= elem.bits() {
                            0
                        } else {
                            x >> amount
                        }
                    }
                    SShr => {
                        let amount = (y as u8 as u32).min(elem.bits() - 1);
                        (sext(elem, x) >> amount) as u64
                    }
                    _ => unreachable!(),
                };
                set_lane(&mut out, elem, i, value);
            }
        }
    }
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn vun(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VUn {
        dst,
        op,
        size,
        elem,
        src,
    } = *instr
    else {
        unreachable!()
    };
    let a = interp.ssa.read_vector(src);
    let mut out = VectorReg::default();
    let lanes = lane_count(size, elem);

    use VUnOp::*;
    match op {
        Not => {
            for i in 0..size.bytes() {
                out.set_u8(i, !a.u8_at(i));
            }
        }
        AddV => {
            let mut sum = 0u64;
            for i in 0..lanes {
                sum = sum.wrapping_add(lane_u(&a, elem, i));
            }
            set_lane(&mut out, elem, 0, sum & all_ones(elem));
        }
        Rev32 | Rev64 => {
            let group = if op == Rev64 { 8 } else { 4 } / elem.bytes();
            for i in 0..lanes {
                let base = i / group * group;
                let swapped = base + (group - 1 - (i % group));
                set_lane(&mut out, elem, i, lane_u(&a, elem, swapped));
            }
        }
        Sxtl | Sxtl2 | Uxtl | Uxtl2 => {
            let src_elem = half_size(elem);
            let base = if matches!(op, Sxtl2 | Uxtl2) { lanes } else { 0 };
            for i in 0..lanes {
                let value = if matches!(op, Sxtl | Sxtl2) {
                    lane_i(&a, src_elem, base + i) as u64
                } else {
                    lane_u(&a, src_elem, base + i)
                };
                set_lane(&mut out, elem, i, value);
            }
        }
        SqXtn | SqXtun => {
            let src_elem = double_size(elem);
            for i in 0..lanes / 2 {
                let wide = lane_i(&a, src_elem, i);
                let value = if op == SqXtn {
                    sat_signed(elem, wide)
                } else {
                    sat_unsigned(elem, wide)
                };
                set_lane(&mut out, elem, i, value);
            }
        }
        _ => {
            for i in 0..lanes {
                let x = lane_u(&a, elem, i);
                let value = match op {
                    Abs => sext(elem, x).unsigned_abs(),
                    Neg => (sext(elem, x)).wrapping_neg() as u64,
                    Popcount => x.count_ones() as u64,
                    FNeg => match elem {
                        OpSize::B32 => x ^ 0x8000_0000,
                        _ => x ^ 0x8000_0000_0000_0000,
                    },
                    FAbs => match elem {
                        OpSize::B32 => x & 0x7FFF_FFFF,
                        _ => x & 0x7FFF_FFFF_FFFF_FFFF,
                    },
                    FSqrt => fop2(elem, x, 0, |p, _| p.sqrt()),
                    FRecp => fop2(elem, x, 0, |p, _| 1.0 / p),
                    FRSqrt => fop2(elem, x, 0, |p, _| 1.0 / p.sqrt()),
                    CmpEqZ => {
                        if x == 0 {
                            all_ones(elem)
                        } else {
                            0
                        }
                    }
                    CmpGtZ => {
                        if sext(elem, x) > 0 {
                            all_ones(elem)
                        } else {
                            0
                        }
                    }
                    _ => unreachable!(),
                };
                set_lane(&mut out, elem, i, value);
            }
        }
    }
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn shift_lane(op: VShiftImmOp, elem: OpSize, x: u64, amount: u32) -> u64 {
    match op {
        VShiftImmOp::Shl => {
            if amount >= elem.bits() {
                0
            } else {
                x << amount
            }
        }
        VShiftImmOp::UShr | VShiftImmOp::UShrN => {
            if amount >= elem.bits() {
                0
            } else {
                x >> amount
            }
        }
        VShiftImmOp::SShr => {
            let amount = amount.min(elem.bits() - 1);
            (sext(elem, x) >> amount) as u64
        }
    }
}

fn vshift_scalar(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VShiftScalar {
        dst,
        op,
        size,
        elem,
        vector,
        ref amount,
    } = *instr
    else {
        unreachable!()
    };
    debug_assert!(!matches!(op, VShiftImmOp::UShrN));
    let a = interp.ssa.read_vector(vector);
    let amount = interp.ssa.operand(amount) as u32;
    let mut out = VectorReg::default();
    for i in 0..lane_count(size, elem) {
        set_lane(&mut out, elem, i, shift_lane(op, elem, lane_u(&a, elem, i), amount));
    }
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn vshift_imm(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VShiftImm {
        dst,
        op,
        size,
        elem,
        vector,
        amount,
    } = *instr
    else {
        unreachable!()
    };
    let a = interp.ssa.read_vector(vector);
    let mut out = VectorReg::default();
    if op == VShiftImmOp::UShrN {
        // Narrow wide lanes into the low half.
        let src_elem = double_size(elem);
        let lanes = lane_count(size, elem) / 2;
        for i in 0..lanes {
            let shifted = shift_lane(VShiftImmOp::UShr, src_elem, lane_u(&a, src_elem, i), amount as u32);
            set_lane(&mut out, elem, i, shifted & all_ones(elem));
        }
    } else {
        for i in 0..lane_count(size, elem) {
            set_lane(
                &mut out,
                elem,
                i,
                shift_lane(op, elem, lane_u(&a, elem, i), amount as u32),
            );
        }
    }
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn vshift_insert(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VShiftInsert {
        dst,
        op,
        size,
        elem,
        base,
        vector,
        amount,
    } = *instr
    else {
        unreachable!()
    };
    let base_v = interp.ssa.read_vector(base);
    let a = interp.ssa.read_vector(vector);
    let mut out = VectorReg::default();
    let amount = amount as u32;
    match op {
        VShiftInsertOp::Sli => {
            let mask = if amount >= elem.bits() {
                0
            } else {
                all_ones(elem) << amount & all_ones(elem)
            };
            for i in 0..lane_count(size, elem) {
                let shifted = shift_lane(VShiftImmOp::Shl, elem, lane_u(&a, elem, i), amount);
                let merged = (lane_u(&base_v, elem, i) & !mask) | (shifted & mask);
                set_lane(&mut out, elem, i, merged);
            }
        }
        VShiftInsertOp::Sri => {
            let mask = if amount >= elem.bits() {
                0
            } else {
                all_ones(elem) >> amount
            };
            for i in 0..lane_count(size, elem) {
                let shifted = shift_lane(VShiftImmOp::UShr, elem, lane_u(&a, elem, i), amount);
                let merged = (lane_u(&base_v, elem, i) & !mask) | (shifted & mask);
                set_lane(&mut out, elem, i, merged);
            }
        }
        VShiftInsertOp::UShrN2 => {
            let src_elem = double_size(elem);
            let half = lane_count(size, elem) / 2;
            out = base_v;
            for i in 0..half {
                let shifted = shift_lane(VShiftImmOp::UShr, src_elem, lane_u(&a, src_elem, i), amount);
                set_lane(&mut out, elem, half + i, shifted & all_ones(elem));
            }
            for i in size.bytes()..32 {
                out.set_u8(i, 0);
            }
        }
    }
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn vins_element(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VInsElement {
        dst,
        elem,
        dest_idx,
        src_idx,
        dest_vec,
        src_vec,
        ..
    } = *instr
    else {
        unreachable!()
    };
    let mut out = interp.ssa.read_vector(dest_vec);
    let src = interp.ssa.read_vector(src_vec);
    if elem == OpSize::B128 {
        // Full-lane move, used to assemble 256-bit values.
        out.set_u128(dest_idx as usize, src.u128_at(src_idx as usize));
    } else {
        set_lane(&mut out, elem, dest_idx as usize, lane_u(&src, elem, src_idx as usize));
    }
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn vins_scalar(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VInsScalar {
        dst,
        elem,
        dest_idx,
        dest_vec,
        ref value,
        ..
    } = *instr
    else {
        unreachable!()
    };
    let mut out = interp.ssa.read_vector(dest_vec);
    let v = interp.ssa.operand(value);
    set_lane(&mut out, elem, dest_idx as usize, v);
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn vextract_to_gpr(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VExtractToGpr {
        dst,
        elem,
        vector,
        idx,
        ..
    } = *instr
    else {
        unreachable!()
    };
    let v = interp.ssa.read_vector(vector);
    interp.ssa.write_u64(dst, lane_u(&v, elem, idx as usize));
    Ok(())
}

fn vdup_element(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VDupElement {
        dst,
        size,
        elem,
        vector,
        idx,
    } = *instr
    else {
        unreachable!()
    };
    let v = interp.ssa.read_vector(vector);
    let value = lane_u(&v, elem, idx as usize);
    let mut out = VectorReg::default();
    for i in 0..lane_count(size, elem) {
        set_lane(&mut out, elem, i, value);
    }
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn vextr(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VExtr {
        dst,
        size,
        lower,
        upper,
        index,
    } = *instr
    else {
        unreachable!()
    };
    let lo = interp.ssa.read_vector(lower);
    let hi = interp.ssa.read_vector(upper);
    let n = size.bytes();
    let mut concat = Vec::with_capacity(2 * n);
    concat.extend_from_slice(&lo.0[..n]);
    concat.extend_from_slice(&hi.0[..n]);
    let mut out = VectorReg::default();
    for i in 0..n {
        let src = index as usize + i;
        if src < concat.len() {
            out.set_u8(i, concat[src]);
        }
    }
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn vtbl1(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VTbl1 {
        dst,
        size,
        table,
        indices,
    } = *instr
    else {
        unreachable!()
    };
    let tbl = interp.ssa.read_vector(table);
    let idx = interp.ssa.read_vector(indices);
    let mut out = VectorReg::default();
    for i in 0..size.bytes() {
        let j = idx.u8_at(i) as usize;
        // Out-of-range indices select zero.
        out.set_u8(i, if j < size.bytes() { tbl.u8_at(j) } else { 0 });
    }
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn vbsl(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VBsl {
        dst,
        size,
        mask,
        true_vec,
        false_vec,
    } = *instr
    else {
        unreachable!()
    };
    let m = interp.ssa.read_vector(mask);
    let t = interp.ssa.read_vector(true_vec);
    let f = interp.ssa.read_vector(false_vec);
    let mut out = VectorReg::default();
    for i in 0..size.bytes() {
        out.set_u8(i, (m.u8_at(i) & t.u8_at(i)) | (!m.u8_at(i) & f.u8_at(i)));
    }
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn vfcadd(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VFcadd {
        dst,
        size,
        elem,
        rotate,
        lhs,
        rhs,
    } = *instr
    else {
        unreachable!()
    };
    let a = interp.ssa.read_vector(lhs);
    let b = interp.ssa.read_vector(rhs);
    let mut out = VectorReg::default();
    let pairs = lane_count(size, elem) / 2;
    for i in 0..pairs {
        let (re, im) = (2 * i, 2 * i + 1);
        let (r, j) = match rotate {
            // (a.re - b.im, a.im + b.re)
            90 => (
                fop2(elem, lane_u(&a, elem, re), lane_u(&b, elem, im), |p, q| p - q),
                fop2(elem, lane_u(&a, elem, im), lane_u(&b, elem, re), |p, q| p + q),
            ),
            // (a.re + b.im, a.im - b.re)
            270 => (
                fop2(elem, lane_u(&a, elem, re), lane_u(&b, elem, im), |p, q| p + q),
                fop2(elem, lane_u(&a, elem, im), lane_u(&b, elem, re), |p, q| p - q),
            ),
            _ => {
                debug_assert!(false, "unsupported rotation {rotate}");
                (0, 0)
            }
        };
        set_lane(&mut out, elem, re, r);
        set_lane(&mut out, elem, im, j);
    }
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn vbitcast(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VBitcast { dst, size, src } = *instr else {
        unreachable!()
    };
    let v = interp.ssa.read_vector(src);
    let mut out = VectorReg::default();
    out.0[..size.bytes()].copy_from_slice(&v.0[..size.bytes()]);
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn vcast_from_gpr(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VCastFromGpr {
        dst,
        elem,
        ref value,
        ..
    } = *instr
    else {
        unreachable!()
    };
    let v = interp.ssa.operand_sized(value, elem.min(OpSize::B64));
    let mut out = VectorReg::default();
    set_lane(&mut out, elem.min(OpSize::B64), 0, v);
    interp.ssa.write_vector(dst, out);
    Ok(())
}
