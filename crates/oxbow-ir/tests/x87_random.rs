//! Randomized x87 lowering: arbitrary stack-op sequences must always
//! lower to valid, stack-free IR, deterministically.

use oxbow_ir::ops::{MemOffset, StackBinOp, StackUnOp};
use oxbow_ir::passes::x87stack::{self, X87Options};
use oxbow_ir::{Instr, IrBuilder, Operand};
use oxbow_types::{OpSize, RegClass};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn random_block(rng: &mut ChaCha8Rng) -> oxbow_ir::IrBlock {
    let mut b = IrBuilder::new();
    let op_count = rng.gen_range(1..24);
    for _ in 0..op_count {
        match rng.gen_range(0..12) {
            0 => {
                let v = b.vector_const(rng.gen());
                b.push(Instr::PushStack {
                    value: v,
                    original: v,
                    load_size: OpSize::B128,
                    float: false,
                });
            }
            1 => b.push(Instr::PopStackDestroy),
            2 => b.push(Instr::CopyPushStack {
                slot: rng.gen_range(0..8),
            }),
            3 => {
                let dst = b.alloc_value();
                b.push(Instr::ReadStackValue {
                    dst,
                    slot: rng.gen_range(0..8),
                });
            }
            4 => b.push(Instr::StackBin {
                op: *[
                    StackBinOp::Add,
                    StackBinOp::Sub,
                    StackBinOp::Mul,
                    StackBinOp::Div,
                    StackBinOp::Prem,
                    StackBinOp::Fyl2x,
                ]
                .get(rng.gen_range(0..6))
                .unwrap(),
                dst_slot: rng.gen_range(0..2),
                slot1: rng.gen_range(0..4),
                slot2: rng.gen_range(0..4),
            }),
            5 => b.push(Instr::StackUn {
                op: *[
                    StackUnOp::Sqrt,
                    StackUnOp::ChangeSign,
                    StackUnOp::Abs,
                    StackUnOp::Round,
                    StackUnOp::Tan,
                ]
                .get(rng.gen_range(0..5))
                .unwrap(),
            }),
            6 => b.push(Instr::F80StackXchange {
                slot: rng.gen_range(1..8),
            }),
            7 => b.push(Instr::StoreStackMem {
                addr: Operand::Const(rng.gen_range(0..0x1000) * 8),
                offset: MemOffset::NONE,
                store_size: *[OpSize::B32, OpSize::B64, OpSize::F80]
                    .get(rng.gen_range(0..3))
                    .unwrap(),
            }),
            8 => b.push(Instr::InvalidateStack {
                slot: if rng.gen_bool(0.2) {
                    0xFF
                } else {
                    rng.gen_range(0..8)
                },
            }),
            9 => {
                let dst = b.alloc_value();
                b.push(Instr::StackValidTag {
                    dst,
                    slot: rng.gen_range(0..8),
                });
                b.store_context(OpSize::B64, RegClass::Gpr, 0, dst);
            }
            10 => b.push(Instr::StackForceSlow),
            _ => b.push(if rng.gen_bool(0.5) {
                Instr::IncStackTop
            } else {
                Instr::DecStackTop
            }),
        }
    }
    b.exit_function(Operand::Const(0x1000));
    b.finish()
}

#[test]
fn random_sequences_lower_to_valid_ir() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x87_57AC);
    for round in 0..200 {
        let block = random_block(&mut rng);
        block.validate().unwrap_or_else(|e| panic!("input {round}: {e}"));

        let lowered = x87stack::run(&block, X87Options::default());
        assert!(lowered.is_lowered(), "round {round} left stack ops behind");
        assert!(!lowered.has_x87);
        lowered
            .validate()
            .unwrap_or_else(|e| panic!("lowered {round}: {e}"));

        // The pass is a pure function of its input.
        let again = x87stack::run(&block, X87Options::default());
        assert_eq!(lowered, again, "round {round} not deterministic");
    }
}

#[test]
fn random_sequences_lower_under_reduced_precision() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x87_F64);
    let opts = X87Options {
        reduced_precision: true,
        ..Default::default()
    };
    for round in 0..100 {
        let block = random_block(&mut rng);
        let lowered = x87stack::run(&block, opts);
        assert!(lowered.is_lowered());
        lowered
            .validate()
            .unwrap_or_else(|e| panic!("lowered {round}: {e}"));
    }
}
