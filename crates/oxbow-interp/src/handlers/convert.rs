//! Scalar and vector float/int conversion handlers.
//!
//! Out-of-range conversions produce the size-specific indefinite integer
//! (the minimum value), never undefined behavior.

use super::set;
use super::vector::{lane_u, set_lane};
use crate::{HandlerTable, Interp, InterpError};
use oxbow_ir::{Instr, Opcode};
use oxbow_types::{FcmpFlags, OpSize, RoundMode, VectorReg};

pub(crate) fn register(table: &mut HandlerTable) {
    set(table, Opcode::FloatFromGpr, float_from_gpr);
    set(table, Opcode::FloatToGpr, float_to_gpr);
    set(table, Opcode::FloatFToF, float_ftof);
    set(table, Opcode::FCmp, fcmp);
    set(table, Opcode::VSToF, vs_to_f);
    set(table, Opcode::VFToInt, vf_to_int);
    set(table, Opcode::VFToF, vf_to_f);
    set(table, Opcode::VFToIRound, vf_to_i_round);
}

/// Resolve Host mode against the guest rounding-control register.
pub(crate) fn resolve_mode(interp: &Interp<'_>, mode: RoundMode) -> RoundMode {
    if mode != RoundMode::Host {
        return mode;
    }
    match interp.state.rounding_mode & oxbow_types::guest_rounding::MODE_MASK {
        0 => RoundMode::NearestEven,
        1 => RoundMode::NegativeInfinity,
        2 => RoundMode::PositiveInfinity,
        _ => RoundMode::TowardsZero,
    }
}

/// Round to an integral float value under a concrete mode.
pub(crate) fn round_f64(v: f64, mode: RoundMode) -> f64 {
    match mode {
        RoundMode::NearestEven | RoundMode::Host => {
            // Ties to even, matching hardware round-to-nearest.
            let r = v.round();
            if (v - v.trunc()).abs() == 0.5 && r % 2.0 != 0.0 {
                r - v.signum()
            } else {
                r
            }
        }
        RoundMode::NegativeInfinity => v.floor(),
        RoundMode::PositiveInfinity => v.ceil(),
        RoundMode::TowardsZero => v.trunc(),
    }
}

/// f64 -> integer with the indefinite-value convention.
fn f64_to_int(v: f64, mode: RoundMode, bits: u32) -> u64 {
    let min = -(2f64.powi(bits as i32 - 1));
    let max = 2f64.powi(bits as i32 - 1);
    let indefinite = (1u64 << (bits - 1)) as u64;
    if v.is_nan() {
        return indefinite;
    }
    let rounded = round_f64(v, mode);
    if rounded < min || rounded >= max {
        return indefinite;
    }
    (rounded as i64 as u64) & if bits == 64 { u64::MAX } else { (1 << bits) - 1 }
}

fn lane_f(v: &VectorReg, elem: OpSize, i: usize) -> f64 {
    match elem {
        OpSize::B32 => v.f32_at(i) as f64,
        OpSize::B64 => v.f64_at(i),
        _ => unreachable!("bad float lane size {elem:?}"),
    }
}

fn set_lane_f(v: &mut VectorReg, elem: OpSize, i: usize, value: f64) {
    match elem {
        OpSize::B32 => v.set_f32(i, value as f32),
        OpSize::B64 => v.set_f64(i, value),
        _ => unreachable!("bad float lane size {elem:?}"),
    }
}

fn float_from_gpr(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::FloatFromGpr {
        dst,
        size,
        src_size,
        ref src,
    } = *instr
    else {
        unreachable!()
    };
    let raw = interp.ssa.operand_sized(src, src_size);
    let v = super::sext(src_size, raw) as f64;
    let mut out = VectorReg::default();
    set_lane_f(&mut out, size, 0, v);
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn float_to_gpr(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::FloatToGpr {
        dst,
        size,
        src_size,
        truncate,
        src,
    } = *instr
    else {
        unreachable!()
    };
    let v = lane_f(&interp.ssa.read_vector(src), src_size, 0);
    let mode = if truncate {
        RoundMode::TowardsZero
    } else {
        resolve_mode(interp, RoundMode::Host)
    };
    let result = f64_to_int(v, mode, size.bits());
    interp.ssa.write_scalar(dst, size, result);
    Ok(())
}

fn float_ftof(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::FloatFToF {
        dst,
        size,
        src_size,
        src,
    } = *instr
    else {
        unreachable!()
    };
    let v = lane_f(&interp.ssa.read_vector(src), src_size, 0);
    let mut out = VectorReg::default();
    set_lane_f(&mut out, size, 0, v);
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn fcmp(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::FCmp {
        dst,
        size,
        lhs,
        rhs,
        flags,
    } = *instr
    else {
        unreachable!()
    };
    let a = lane_f(&interp.ssa.read_vector(lhs), size, 0);
    let b = lane_f(&interp.ssa.read_vector(rhs), size, 0);
    let mut result = FcmpFlags::empty();
    if a.is_nan() || b.is_nan() {
        result |= FcmpFlags::UNORDERED;
    } else {
        if a < b {
            result |= FcmpFlags::LT;
        }
        if a == b {
            result |= FcmpFlags::EQ;
        }
    }
    interp.ssa.write_u64(dst, (result & flags).bits() as u64);
    Ok(())
}

fn vs_to_f(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VSToF {
        dst,
        size,
        elem,
        src,
    } = *instr
    else {
        unreachable!()
    };
    let a = interp.ssa.read_vector(src);
    let mut out = VectorReg::default();
    for i in 0..size.bytes() / elem.bytes() {
        let v = super::sext(elem, lane_u(&a, elem, i)) as f64;
        set_lane_f(&mut out, elem, i, v);
    }
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn vf_to_int(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VFToInt {
        dst,
        size,
        elem,
        src,
        truncate,
    } = *instr
    else {
        unreachable!()
    };
    let a = interp.ssa.read_vector(src);
    let mode = if truncate {
        RoundMode::TowardsZero
    } else {
        resolve_mode(interp, RoundMode::Host)
    };
    let mut out = VectorReg::default();
    for i in 0..size.bytes() / elem.bytes() {
        let v = f64_to_int(lane_f(&a, elem, i), mode, elem.bits());
        set_lane(&mut out, elem, i, v);
    }
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn vf_to_f(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VFToF {
        dst,
        size,
        elem,
        src_elem,
        src,
    } = *instr
    else {
        unreachable!()
    };
    let a = interp.ssa.read_vector(src);
    // Size-halving reads only the low half of the source; widening
    // writes only as many lanes as the destination holds.
    let lanes = size.bytes() / elem.bytes().max(src_elem.bytes());
    let mut out = VectorReg::default();
    for i in 0..lanes {
        set_lane_f(&mut out, elem, i, lane_f(&a, src_elem, i));
    }
    interp.ssa.write_vector(dst, out);
    Ok(())
}

fn vf_to_i_round(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::VFToIRound {
        dst,
        size,
        elem,
        src,
        mode,
    } = *instr
    else {
        unreachable!()
    };
    let a = interp.ssa.read_vector(src);
    let mode = resolve_mode(interp, mode);
    let mut out = VectorReg::default();
    for i in 0..size.bytes() / elem.bytes() {
        set_lane_f(&mut out, elem, i, round_f64(lane_f(&a, elem, i), mode));
    }
    interp.ssa.write_vector(dst, out);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{execute_block, NullHost, VecMem};
    use oxbow_cpu::{layout, CpuState};
    use oxbow_ir::{IrBuilder, Operand, ValueId};
    use oxbow_types::RegClass;

    fn run_with_state(
        state: &mut CpuState,
        build: impl FnOnce(&mut IrBuilder) -> ValueId,
    ) -> VectorReg {
        let mut b = IrBuilder::new();
        let out = build(&mut b);
        b.store_context(OpSize::B256, RegClass::Fpr, layout::vector(0) as u32, out);
        b.exit_function(Operand::Const(0));
        let block = b.finish();
        block.validate().unwrap();
        let mut mem = VecMem::new(0x10);
        let mut host = NullHost;
        execute_block(&block, state, &mut mem, &mut host).unwrap();
        state.vectors[0]
    }

    fn run(build: impl FnOnce(&mut IrBuilder) -> ValueId) -> VectorReg {
        run_with_state(&mut CpuState::default(), build)
    }

    #[test]
    fn int_to_float_scalar() {
        let out = run(|b| {
            let dst = b.alloc_value();
            b.push(Instr::FloatFromGpr {
                dst,
                size: OpSize::B64,
                src_size: OpSize::B32,
                src: Operand::Const(0xFFFF_FFFF), // -1 as i32
            });
            dst
        });
        assert_eq!(out.f64_at(0), -1.0);
    }

    #[test]
    fn float_to_int_truncates_or_rounds() {
        let v = 2.7f64.to_bits();
        let out = run(move |b| {
            let src = b.vector_const(v as u128);
            let dst = b.alloc_value();
            b.push(Instr::FloatToGpr {
                dst,
                size: OpSize::B32,
                src_size: OpSize::B64,
                truncate: true,
                src,
            });
            dst
        });
        assert_eq!(out.u32_at(0), 2);

        // Current rounding defaults to nearest-even.
        let out = run(move |b| {
            let src = b.vector_const(v as u128);
            let dst = b.alloc_value();
            b.push(Instr::FloatToGpr {
                dst,
                size: OpSize::B32,
                src_size: OpSize::B64,
                truncate: false,
                src,
            });
            dst
        });
        assert_eq!(out.u32_at(0), 3);
    }

    #[test]
    fn out_of_range_gives_indefinite() {
        let v = 1e20f64.to_bits();
        let out = run(move |b| {
            let src = b.vector_const(v as u128);
            let dst = b.alloc_value();
            b.push(Instr::FloatToGpr {
                dst,
                size: OpSize::B32,
                src_size: OpSize::B64,
                truncate: true,
                src,
            });
            dst
        });
        assert_eq!(out.u32_at(0) as i32, i32::MIN);
    }

    #[test]
    fn set_rounding_changes_current_mode() {
        let mut state = CpuState::default();
        state.rounding_mode = 3; // toward zero
        let v = 2.7f64.to_bits();
        let out = run_with_state(&mut state, move |b| {
            let src = b.vector_const(v as u128);
            let dst = b.alloc_value();
            b.push(Instr::FloatToGpr {
                dst,
                size: OpSize::B32,
                src_size: OpSize::B64,
                truncate: false,
                src,
            });
            dst
        });
        assert_eq!(out.u32_at(0), 2);
    }

    #[test]
    fn vector_float_to_int_lanes() {
        let mut v = VectorReg::default();
        v.set_f32(0, 1.5);
        v.set_f32(1, -1.5);
        v.set_f32(2, 2.5);
        v.set_f32(3, f32::NAN);
        let bits = v.u128_at(0);
        let out = run(move |b| {
            let src = b.vector_const(bits);
            let dst = b.alloc_value();
            b.push(Instr::VFToInt {
                dst,
                size: OpSize::B128,
                elem: OpSize::B32,
                src,
                truncate: false,
            });
            dst
        });
        // Ties to even at nearest.
        assert_eq!(out.u32_at(0) as i32, 2);
        assert_eq!(out.u32_at(1) as i32, -2);
        assert_eq!(out.u32_at(2) as i32, 2);
        assert_eq!(out.u32_at(3) as i32, i32::MIN, "NaN gives indefinite");
    }

    #[test]
    fn width_convert_uses_low_half() {
        let mut v = VectorReg::default();
        v.set_f64(0, 1.25);
        v.set_f64(1, -3.5);
        let bits = v.u128_at(0);
        let out = run(move |b| {
            let src = b.vector_const(bits);
            let dst = b.alloc_value();
            b.push(Instr::VFToF {
                dst,
                size: OpSize::B128,
                elem: OpSize::B32,
                src_elem: OpSize::B64,
                src,
            });
            dst
        });
        assert_eq!(out.f32_at(0), 1.25);
        assert_eq!(out.f32_at(1), -3.5);
        assert_eq!(out.u64_at(1), 0, "upper half is zeroed");
    }

    #[test]
    fn round_to_integral_float() {
        let mut v = VectorReg::default();
        v.set_f64(0, 2.5);
        v.set_f64(1, -2.5);
        let bits = v.u128_at(0);
        let out = run(move |b| {
            let src = b.vector_const(bits);
            b.vf_to_i_round(OpSize::B128, OpSize::B64, src, RoundMode::NearestEven)
        });
        assert_eq!(out.f64_at(0), 2.0);
        assert_eq!(out.f64_at(1), -2.0);
    }

    #[test]
    fn scalar_fcmp_masks() {
        let a = 1.0f64.to_bits();
        let b_bits = 2.0f64.to_bits();
        let out = run(move |b| {
            let lhs = b.vector_const(a as u128);
            let rhs = b.vector_const(b_bits as u128);
            b.fcmp(OpSize::B64, lhs, rhs, FcmpFlags::all())
        });
        assert_eq!(out.u64_at(0), FcmpFlags::LT.bits() as u64);
    }
}
