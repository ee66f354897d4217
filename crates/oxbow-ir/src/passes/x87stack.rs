//! x87 stack lowering pass.
//!
//! The decoder emits x87 opcodes against a rotating 8-slot register
//! stack. This pass rewrites each block into flat IR with no stack
//! metaphors: a virtual stack tracks which slots hold which SSA values,
//! pushes and pops become rotations of that model, and the architectural
//! top/tag state is only written back when the block ends or when static
//! tracking fails.
//!
//! The pass starts on the fast path with a complete view of the stack.
//! The moment an op needs a slot the model does not hold (a value pushed
//! in a previous block, say), the model is flushed to the architectural
//! state and the pass continues on the slow path, where every access is
//! an indexed context load/store through the real top. The transition is
//! one-way within a block.

use std::collections::HashMap;

use crate::ops::{
    F64BinOp, F64UnOp, F80BinOp, F80UnOp, Instr, MemOffset, NamedVectorConst, Operand, StackBinOp,
    StackUnOp, VBinOp, VUnOp,
};
use crate::{IrBlock, IrBuilder, ValueId};
use oxbow_cpu::layout;
use oxbow_types::{OpSize, RegClass, RoundMode};

/// Fixed configuration for a pass instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct X87Options {
    /// Lower F80 ops to f64 equivalents instead of the soft-float path.
    pub reduced_precision: bool,
    /// Fuse adjacent same-size stores into StoreMemPair.
    pub enable_pair_stores: bool,
}

const STACK_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq)]
struct StackValue {
    /// The value in stack format (F80, or f64 under reduced precision).
    node: ValueId,
    /// Original pre-conversion value and its size, when known. Enables
    /// store forwarding for load-store sequences.
    source: Option<(OpSize, ValueId)>,
    float: bool,
}

impl StackValue {
    fn bare(node: ValueId) -> Self {
        StackValue {
            node,
            source: None,
            float: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
enum Slot {
    #[default]
    Unused,
    Invalid,
    Valid(StackValue),
}

/// The virtual stack: index 0 is the current top.
#[derive(Debug, Default)]
struct VirtualStack {
    slots: [Slot; STACK_SIZE],
    /// Cumulative rotation applied in this block: +1 per push, -1 per
    /// pop. Flushed into the architectural top on synchronization.
    top_offset: i8,
}

impl VirtualStack {
    fn clear(&mut self) {
        self.slots = Default::default();
        self.top_offset = 0;
    }

    fn rotate_right(&mut self) {
        self.slots.rotate_right(1);
        self.top_offset += 1;
    }

    fn rotate_left(&mut self) {
        self.slots.rotate_left(1);
        self.top_offset -= 1;
    }

    fn push(&mut self, value: StackValue) {
        self.rotate_right();
        self.slots[0] = Slot::Valid(value);
    }

    fn pop(&mut self) {
        self.slots[0] = Slot::Invalid;
        self.rotate_left();
    }

    fn get(&self, offset: u8) -> &Slot {
        &self.slots[offset as usize]
    }

    fn set(&mut self, offset: u8, value: StackValue) {
        self.slots[offset as usize] = Slot::Valid(value);
    }

    fn set_invalid(&mut self, offset: u8) {
        self.slots[offset as usize] = Slot::Invalid;
    }

    fn valid_mask(&self) -> u8 {
        let mut mask = 0;
        for (i, slot) in self.slots.iter().enumerate() {
            if matches!(slot, Slot::Valid(_)) {
                mask |= 1 << i;
            }
        }
        mask
    }

    fn invalid_mask(&self) -> u8 {
        let mut mask = 0;
        for (i, slot) in self.slots.iter().enumerate() {
            if matches!(slot, Slot::Invalid) {
                mask |= 1 << i;
            }
        }
        mask
    }
}

struct X87StackLowering {
    opts: X87Options,
    stack: VirtualStack,
    slow_path: bool,
    /// Cached `(top + k) & 7` values; slot 0 is top itself.
    top_cache: [Option<ValueId>; STACK_SIZE],
    flush_top_pending: bool,
    const_pool: [Option<ValueId>; STACK_SIZE],
    /// Replacements for values whose defining op was consumed by the
    /// pass (ReadStackValue and friends).
    rewrites: HashMap<ValueId, Operand>,
}

impl X87StackLowering {
    fn new(opts: X87Options) -> Self {
        X87StackLowering {
            opts,
            stack: VirtualStack::default(),
            slow_path: false,
            top_cache: [None; STACK_SIZE],
            flush_top_pending: false,
            const_pool: [None; STACK_SIZE],
            rewrites: HashMap::new(),
        }
    }

    fn reset(&mut self, b: &mut IrBuilder) {
        self.stack.clear();
        self.slow_path = false;
        self.invalidate_top_cache(b);
        self.const_pool = [None; STACK_SIZE];
    }

    /// Stack element size in the lowered representation.
    fn slot_size(&self) -> OpSize {
        if self.opts.reduced_precision {
            OpSize::B64
        } else {
            OpSize::B128
        }
    }

    fn get_constant(&mut self, b: &mut IrBuilder, v: u64) -> ValueId {
        if (v as usize) < STACK_SIZE {
            if let Some(c) = self.const_pool[v as usize] {
                return c;
            }
            let c = b.const_int(v);
            self.const_pool[v as usize] = Some(c);
            return c;
        }
        b.const_int(v)
    }

    fn flush_top(&mut self, b: &mut IrBuilder) {
        if self.flush_top_pending {
            let top = self.top_cache[0].expect("pending top flush without a cached top");
            b.store_context(OpSize::B8, RegClass::Gpr, layout::X87_TOP as u32, top);
            self.flush_top_pending = false;
        }
    }

    fn invalidate_top_cache(&mut self, b: &mut IrBuilder) {
        self.flush_top(b);
        self.top_cache = [None; STACK_SIZE];
    }

    fn get_top(&mut self, b: &mut IrBuilder) -> ValueId {
        if let Some(t) = self.top_cache[0] {
            return t;
        }
        let t = b.load_context(OpSize::B8, RegClass::Gpr, layout::X87_TOP as u32);
        self.top_cache[0] = Some(t);
        t
    }

    /// `(top + offset) & 7`, or `(top + 8 - offset) & 7` when reversed.
    fn get_offset_top(&mut self, b: &mut IrBuilder, offset: u8, reverse: bool) -> ValueId {
        let offset = if reverse { 8 - offset } else { offset } & 7;
        if let Some(t) = self.top_cache[offset as usize] {
            return t;
        }
        let top = self.get_top(b);
        if offset == 0 {
            return top;
        }
        let seven = self.get_constant(b, 7);
        let sum = b.add(OpSize::B32, top, Operand::Const(offset as u64));
        let wrapped = b.and(OpSize::B32, sum, seven);
        self.top_cache[offset as usize] = Some(wrapped);
        wrapped
    }

    fn set_top(&mut self, b: &mut IrBuilder, value: ValueId) {
        self.invalidate_top_cache(b);
        self.top_cache[0] = Some(value);
        self.flush_top_pending = true;
    }

    fn update_top_for_pop_slow(&mut self, b: &mut IrBuilder) {
        self.get_offset_top(b, 1, false);
        self.top_cache.rotate_left(1);
        self.flush_top_pending = true;
    }

    fn update_top_for_push_slow(&mut self, b: &mut IrBuilder) {
        self.get_offset_top(b, 1, true);
        self.top_cache.rotate_right(1);
        self.flush_top_pending = true;
    }

    /// Set or clear the abridged-tag bit selected by a dynamic slot
    /// index.
    fn set_valid_tag(&mut self, b: &mut IrBuilder, slot_index: ValueId, valid: bool) {
        let ftw = b.load_context(OpSize::B8, RegClass::Gpr, layout::ABRIDGED_FTW as u32);
        let one = self.get_constant(b, 1);
        let mask = b.lshl(OpSize::B32, one, slot_index);
        let updated = if valid {
            b.or(OpSize::B32, ftw, mask)
        } else {
            b.andn(OpSize::B32, ftw, mask)
        };
        b.store_context(OpSize::B8, RegClass::Gpr, layout::ABRIDGED_FTW as u32, updated);
    }

    fn get_valid_tag_slow(&mut self, b: &mut IrBuilder, offset: u8) -> ValueId {
        let ftw = b.load_context(OpSize::B8, RegClass::Gpr, layout::ABRIDGED_FTW as u32);
        let index = self.get_offset_top(b, offset, false);
        let shifted = b.lshr(OpSize::B32, ftw, index);
        let one = self.get_constant(b, 1);
        b.and(OpSize::B32, shifted, one)
    }

    fn load_slot_slow(&mut self, b: &mut IrBuilder, offset: u8) -> ValueId {
        let index = self.get_offset_top(b, offset, false);
        b.load_context_indexed(
            self.slot_size(),
            RegClass::Fpr,
            layout::X87 as u32,
            layout::X87_STRIDE as u32,
            index,
        )
    }

    fn store_slot_slow(&mut self, b: &mut IrBuilder, value: ValueId, offset: u8, set_valid: bool) {
        let index = self.get_offset_top(b, offset, false);
        b.store_context_indexed(
            self.slot_size(),
            RegClass::Fpr,
            layout::X87 as u32,
            layout::X87_STRIDE as u32,
            index,
            value,
        );
        if set_valid {
            self.set_valid_tag(b, index, true);
        }
    }

    /// `(mask | mask << 8) >> amount`: an 8-bit rotate-right by a dynamic
    /// amount.
    fn rotate_right8(&mut self, b: &mut IrBuilder, mask: u8, amount: ValueId) -> ValueId {
        let doubled = (mask as u64) | ((mask as u64) << 8);
        let c = b.const_int(doubled);
        b.lshr(OpSize::B32, c, amount)
    }

    fn migrate_to_slow_path_if(&mut self, b: &mut IrBuilder, should: bool) {
        if should && !self.slow_path {
            tracing::debug!("x87 lowering leaving fast path");
            self.synchronize(b);
            self.stack.clear();
            self.slow_path = true;
        }
    }

    /// Fast-path slot lookup, migrating to the slow path when the slot is
    /// not statically known.
    fn migrate_if_invalid(&mut self, b: &mut IrBuilder, offset: u8) -> Option<StackValue> {
        let value = match self.stack.get(offset) {
            Slot::Valid(v) => Some(v.clone()),
            _ => None,
        };
        self.migrate_to_slow_path_if(b, value.is_none());
        value
    }

    fn load_stack_value(&mut self, b: &mut IrBuilder, offset: u8) -> ValueId {
        let value = self.migrate_if_invalid(b, offset);
        if self.slow_path {
            self.load_slot_slow(b, offset)
        } else {
            value.expect("fast path slot must be valid").node
        }
    }

    fn store_stack_value(&mut self, b: &mut IrBuilder, value: ValueId, offset: u8, set_valid: bool) {
        if self.slow_path {
            self.store_slot_slow(b, value, offset, set_valid);
        } else {
            self.stack.set(offset, StackValue::bare(value));
        }
    }

    fn stack_pop(&mut self, b: &mut IrBuilder) {
        if self.slow_path {
            self.update_top_for_pop_slow(b);
        } else {
            self.stack.pop();
        }
    }

    /// Write the virtual state back to the architectural state. Returns
    /// the synchronized top value.
    fn synchronize(&mut self, b: &mut IrBuilder) -> ValueId {
        if self.slow_path {
            self.flush_top(b);
            return self.get_top(b);
        }

        let top_offset = self.stack.top_offset;
        if top_offset != 0 {
            // Pushes rotate the stack right; the real top moves the other
            // way, with wraparound.
            let magnitude = top_offset.rem_euclid(8) as u8;
            let new_top = self.get_offset_top(b, magnitude, true);
            self.set_top(b, new_top);
        }
        self.stack.top_offset = 0;

        let top_value = self.get_top(b);
        for i in 0..STACK_SIZE {
            let node = match self.stack.get(i as u8) {
                Slot::Valid(v) => Some(v.node),
                _ => None,
            };
            if let Some(node) = node {
                self.store_slot_slow(b, node, i as u8, false);
            }
        }

        let valid_mask = self.stack.valid_mask();
        if valid_mask == 0xFF {
            let c = b.const_int(0xFF);
            b.store_context(OpSize::B8, RegClass::Gpr, layout::ABRIDGED_FTW as u32, c);
        } else if valid_mask != 0 {
            if valid_mask.count_ones() == 1 {
                let idx = valid_mask.trailing_zeros() as u8;
                let slot = self.get_offset_top(b, idx, false);
                self.set_valid_tag(b, slot, true);
            } else {
                // Rotate the static mask into architectural positions.
                let eight = b.const_int(8);
                let rot = b.sub(OpSize::B32, eight, top_value);
                let rotated = self.rotate_right8(b, valid_mask, rot);
                let ftw = b.load_context(OpSize::B8, RegClass::Gpr, layout::ABRIDGED_FTW as u32);
                let merged = b.or(OpSize::B32, ftw, rotated);
                b.store_context(OpSize::B8, RegClass::Gpr, layout::ABRIDGED_FTW as u32, merged);
            }
        }

        let invalid_mask = self.stack.invalid_mask();
        if invalid_mask == 0xFF {
            let c = self.get_constant(b, 0);
            b.store_context(OpSize::B8, RegClass::Gpr, layout::ABRIDGED_FTW as u32, c);
        } else if invalid_mask != 0 {
            if invalid_mask.count_ones() == 1 {
                let idx = invalid_mask.trailing_zeros() as u8;
                let slot = self.get_offset_top(b, idx, false);
                self.set_valid_tag(b, slot, false);
            } else {
                let eight = b.const_int(8);
                let rot = b.sub(OpSize::B32, eight, top_value);
                let rotated = self.rotate_right8(b, invalid_mask, rot);
                let ftw = b.load_context(OpSize::B8, RegClass::Gpr, layout::ABRIDGED_FTW as u32);
                let merged = b.andn(OpSize::B32, ftw, rotated);
                b.store_context(OpSize::B8, RegClass::Gpr, layout::ABRIDGED_FTW as u32, merged);
            }
        }

        self.flush_top(b);
        top_value
    }

    // Arithmetic lowering helpers.

    fn emit_bin(&mut self, b: &mut IrBuilder, op: StackBinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        if self.opts.reduced_precision {
            match op {
                StackBinOp::Add => b.vbin(VBinOp::FAdd, OpSize::B64, OpSize::B64, lhs, rhs),
                StackBinOp::Sub => b.vbin(VBinOp::FSub, OpSize::B64, OpSize::B64, lhs, rhs),
                StackBinOp::Mul => b.vbin(VBinOp::FMul, OpSize::B64, OpSize::B64, lhs, rhs),
                StackBinOp::Div => b.vbin(VBinOp::FDiv, OpSize::B64, OpSize::B64, lhs, rhs),
                StackBinOp::Prem => b.f64_bin(F64BinOp::Prem, lhs, rhs),
                StackBinOp::Prem1 => b.f64_bin(F64BinOp::Prem1, lhs, rhs),
                StackBinOp::Scale => b.f64_bin(F64BinOp::Scale, lhs, rhs),
                StackBinOp::Fyl2x => b.f64_bin(F64BinOp::Fyl2x, lhs, rhs),
                StackBinOp::Atan => b.f64_bin(F64BinOp::Atan, lhs, rhs),
            }
        } else {
            let op = match op {
                StackBinOp::Add => F80BinOp::Add,
                StackBinOp::Sub => F80BinOp::Sub,
                StackBinOp::Mul => F80BinOp::Mul,
                StackBinOp::Div => F80BinOp::Div,
                StackBinOp::Prem => F80BinOp::Prem,
                StackBinOp::Prem1 => F80BinOp::Prem1,
                StackBinOp::Scale => F80BinOp::Scale,
                StackBinOp::Fyl2x => F80BinOp::Fyl2x,
                StackBinOp::Atan => F80BinOp::Atan,
            };
            b.f80_bin(op, lhs, rhs)
        }
    }

    fn handle_binop_value(
        &mut self,
        b: &mut IrBuilder,
        op: StackBinOp,
        dst_slot: u8,
        mark_dest_valid: bool,
        slot: u8,
        value: ValueId,
        reverse: bool,
    ) {
        let stack_node = self.load_stack_value(b, slot);
        let (lhs, rhs) = if reverse {
            (value, stack_node)
        } else {
            (stack_node, value)
        };
        let node = self.emit_bin(b, op, lhs, rhs);
        self.store_stack_value(b, node, dst_slot, mark_dest_valid && slot != dst_slot);
    }

    fn handle_binop_stack(
        &mut self,
        b: &mut IrBuilder,
        op: StackBinOp,
        dst_slot: u8,
        slot1: u8,
        slot2: u8,
    ) {
        let value2 = self.load_stack_value(b, slot2);
        self.handle_binop_value(b, op, dst_slot, slot2 != dst_slot, slot1, value2, false);
    }

    /// The stack-format constant 1.0.
    fn one_constant(&mut self, b: &mut IrBuilder) -> ValueId {
        if self.opts.reduced_precision {
            b.vcast_from_gpr(OpSize::B64, OpSize::B64, Operand::Const(0x3FF0_0000_0000_0000))
        } else {
            b.named_vector_const(NamedVectorConst::F80One)
        }
    }

    fn handle_unop(&mut self, b: &mut IrBuilder, op: StackUnOp) {
        let st0 = self.load_stack_value(b, 0);
        let value = if self.opts.reduced_precision {
            match op {
                StackUnOp::Sqrt => b.vun(VUnOp::FSqrt, OpSize::B64, OpSize::B64, st0),
                StackUnOp::Sin => b.f64_un(F64UnOp::Sin, st0),
                StackUnOp::Cos => b.f64_un(F64UnOp::Cos, st0),
                StackUnOp::Tan => b.f64_un(F64UnOp::Tan, st0),
                StackUnOp::F2xm1 => b.f64_un(F64UnOp::F2xm1, st0),
                StackUnOp::Round => {
                    b.vf_to_i_round(OpSize::B64, OpSize::B64, st0, RoundMode::Host)
                }
                StackUnOp::ChangeSign => b.vun(VUnOp::FNeg, OpSize::B64, OpSize::B64, st0),
                StackUnOp::Abs => b.vun(VUnOp::FAbs, OpSize::B64, OpSize::B64, st0),
            }
        } else {
            match op {
                StackUnOp::Sqrt => b.f80_un(F80UnOp::Sqrt, st0),
                StackUnOp::Sin => b.f80_un(F80UnOp::Sin, st0),
                StackUnOp::Cos => b.f80_un(F80UnOp::Cos, st0),
                StackUnOp::Tan => b.f80_un(F80UnOp::Tan, st0),
                StackUnOp::F2xm1 => b.f80_un(F80UnOp::F2xm1, st0),
                StackUnOp::Round => b.f80_un(F80UnOp::Round, st0),
                StackUnOp::ChangeSign => {
                    let mask = b.named_vector_const(NamedVectorConst::F80SignMask);
                    b.vbin(VBinOp::Xor, OpSize::B128, OpSize::B8, st0, mask)
                }
                StackUnOp::Abs => {
                    let mask = b.named_vector_const(NamedVectorConst::F80SignMask);
                    b.vbin(VBinOp::Bic, OpSize::B128, OpSize::B8, st0, mask)
                }
            }
        };
        self.store_stack_value(b, value, 0, false);

        // FPTAN pushes 1.0 after replacing ST0.
        if op == StackUnOp::Tan {
            let one = self.one_constant(b);
            if self.slow_path {
                self.update_top_for_push_slow(b);
                self.store_slot_slow(b, one, 0, true);
            } else {
                self.stack.push(StackValue::bare(one));
            }
        }
    }

    fn f80_split_store(
        &mut self,
        b: &mut IrBuilder,
        node: ValueId,
        addr: Operand,
        offset: MemOffset,
    ) {
        b.store_mem(OpSize::B64, RegClass::Fpr, addr, offset, node);
        let upper = b.vextract_to_gpr(OpSize::B128, OpSize::B64, node, 1);
        // The index contribution commutes with the +8 displacement.
        let addr_hi = b.add(OpSize::B64, addr, Operand::Const(8));
        b.store_mem(OpSize::B16, RegClass::Gpr, addr_hi, offset, upper);
    }

    fn store_stack_mem(
        &mut self,
        b: &mut IrBuilder,
        node: ValueId,
        store_size: OpSize,
        addr: Operand,
        offset: MemOffset,
    ) {
        if self.opts.reduced_precision {
            match store_size {
                OpSize::B32 => {
                    let narrowed = b.float_ftof(OpSize::B32, OpSize::B64, node);
                    b.store_mem(OpSize::B32, RegClass::Fpr, addr, offset, narrowed);
                }
                OpSize::B64 => {
                    b.store_mem(OpSize::B64, RegClass::Fpr, addr, offset, node);
                }
                OpSize::F80 => {
                    let widened = b.f80_cvt_to(OpSize::B64, node);
                    self.f80_split_store(b, widened, addr, offset);
                }
                _ => unreachable!("unsupported x87 store size {store_size:?}"),
            }
            return;
        }

        match store_size {
            OpSize::B32 | OpSize::B64 => {
                let narrowed = b.f80_cvt(store_size, node);
                b.store_mem(store_size, RegClass::Fpr, addr, offset, narrowed);
            }
            OpSize::F80 => self.f80_split_store(b, node, addr, offset),
            _ => unreachable!("unsupported x87 store size {store_size:?}"),
        }
    }

    /// Map an operand through the rewrite table.
    fn rewrite_operand(&self, operand: &mut Operand) {
        if let Operand::Value(v) = operand {
            if let Some(replacement) = self.rewrites.get(v) {
                *operand = *replacement;
            }
        }
    }

    fn rewrite_value(&self, value: &mut ValueId) {
        if let Some(replacement) = self.rewrites.get(value) {
            match replacement {
                Operand::Value(v) => *value = *v,
                Operand::Const(_) => {
                    unreachable!("constant replacement used in a value-only position")
                }
            }
        }
    }

    fn apply_rewrites(&self, instr: &mut Instr) {
        use crate::ops::OperandMut;
        instr.visit_operands_mut(|operand| match operand {
            OperandMut::Gpr(o) => self.rewrite_operand(o),
            OperandMut::Fpr(v) => self.rewrite_value(v),
        });
    }

    fn handle(&mut self, b: &mut IrBuilder, instr: Instr) {
        match instr {
            Instr::StackBin {
                op,
                dst_slot,
                slot1,
                slot2,
            } => {
                self.handle_binop_stack(b, op, dst_slot, slot1, slot2);
                // FYL2X and FPATAN consume a stack entry.
                if matches!(op, StackBinOp::Fyl2x | StackBinOp::Atan) {
                    self.stack_pop(b);
                }
            }
            Instr::StackBinValue {
                op,
                slot,
                value,
                reverse,
            } => {
                self.handle_binop_value(b, op, 0, true, slot, value, reverse);
            }
            Instr::StackUn { op } => self.handle_unop(b, op),
            Instr::SinCosStack => {
                let st0 = self.load_stack_value(b, 0);
                let (sin, cos) = if self.opts.reduced_precision {
                    (b.f64_un(F64UnOp::Sin, st0), b.f64_un(F64UnOp::Cos, st0))
                } else {
                    (b.f80_un(F80UnOp::Sin, st0), b.f80_un(F80UnOp::Cos, st0))
                };
                if self.slow_path {
                    self.store_slot_slow(b, sin, 0, false);
                    self.update_top_for_push_slow(b);
                    self.store_slot_slow(b, cos, 0, true);
                } else {
                    self.stack.set(0, StackValue::bare(sin));
                    self.stack.push(StackValue::bare(cos));
                }
            }
            Instr::PushStack {
                value,
                original,
                load_size,
                float,
            } => {
                if self.slow_path {
                    self.update_top_for_push_slow(b);
                    self.store_slot_slow(b, value, 0, true);
                } else {
                    self.stack.push(StackValue {
                        node: value,
                        source: Some((load_size, original)),
                        float,
                    });
                }
            }
            Instr::PopStackDestroy => {
                if self.slow_path {
                    let top = self.get_top(b);
                    self.set_valid_tag(b, top, false);
                }
                self.stack_pop(b);
            }
            Instr::CopyPushStack { slot } => {
                let value = self.migrate_if_invalid(b, slot);
                if self.slow_path {
                    let st = self.load_slot_slow(b, slot);
                    self.update_top_for_push_slow(b);
                    self.store_slot_slow(b, st, 0, true);
                } else {
                    self.stack.push(value.expect("fast path slot must be valid"));
                }
            }
            Instr::ReadStackValue { dst, slot } => {
                let value = self.load_stack_value(b, slot);
                self.rewrites.insert(dst, Operand::Value(value));
            }
            Instr::StackValidTag { dst, slot } => {
                let value = self.migrate_if_invalid(b, slot);
                let tag = if self.slow_path {
                    Operand::Value(self.get_valid_tag_slow(b, slot))
                } else if value.is_some() {
                    Operand::Const(1)
                } else {
                    Operand::Const(0)
                };
                self.rewrites.insert(dst, tag);
            }
            Instr::StoreStackMem {
                addr,
                offset,
                store_size,
            } => {
                let value = self.migrate_if_invalid(b, 0);
                let node = if self.slow_path {
                    self.load_slot_slow(b, 0)
                } else {
                    value.as_ref().expect("fast path slot must be valid").node
                };

                // Store forwarding: a loaded value stored back at the
                // same size skips the stack-format round trip entirely.
                if !self.slow_path {
                    let value = value.expect("fast path slot must be valid");
                    if let Some((src_size, src_node)) = value.source {
                        if src_size == store_size && value.float {
                            b.store_mem(store_size, RegClass::Fpr, addr, offset, src_node);
                            return;
                        }
                    }
                }
                self.store_stack_mem(b, node, store_size, addr, offset);
            }
            Instr::StoreStackToStack { slot } => {
                if slot != 0 {
                    let value = self.migrate_if_invalid(b, 0);
                    if self.slow_path {
                        let st0 = self.load_slot_slow(b, 0);
                        self.store_slot_slow(b, st0, slot, true);
                    } else {
                        self.stack
                            .set(slot, value.expect("fast path slot must be valid"));
                    }
                }
            }
            Instr::F80StackXchange { slot } => {
                let top = self.load_stack_value(b, 0);
                let other = self.load_stack_value(b, slot);
                self.store_stack_value(b, other, 0, false);
                self.store_stack_value(b, top, slot, false);
            }
            Instr::F80CmpStack { dst, slot } => {
                let lhs = self.load_stack_value(b, 0);
                let rhs = self.load_stack_value(b, slot);
                let cmp = if self.opts.reduced_precision {
                    b.fcmp(OpSize::B64, lhs, rhs, oxbow_types::FcmpFlags::all())
                } else {
                    b.f80_cmp(lhs, rhs)
                };
                self.rewrites.insert(dst, Operand::Value(cmp));
            }
            Instr::F80CmpValue { dst, value } => {
                let st0 = self.load_stack_value(b, 0);
                let cmp = if self.opts.reduced_precision {
                    b.fcmp(OpSize::B64, st0, value, oxbow_types::FcmpFlags::all())
                } else {
                    b.f80_cmp(st0, value)
                };
                self.rewrites.insert(dst, Operand::Value(cmp));
            }
            Instr::F80StackTest { dst, slot } => {
                let node = self.load_stack_value(b, slot);
                let zero = self.get_constant(b, 0);
                let zero_vec = b.vcast_from_gpr(self.slot_size(), OpSize::B64, zero);
                let cmp = if self.opts.reduced_precision {
                    b.fcmp(OpSize::B64, node, zero_vec, oxbow_types::FcmpFlags::all())
                } else {
                    b.f80_cmp(node, zero_vec)
                };
                self.rewrites.insert(dst, Operand::Value(cmp));
            }
            Instr::F80VbslStack { mask, slot1, slot2 } => {
                let v1 = self.load_stack_value(b, slot1);
                let v2 = self.load_stack_value(b, slot2);
                let node = b.vbsl(OpSize::B128, mask, v1, v2);
                self.store_stack_value(b, node, 0, slot1 != 0 && slot2 != 0);
            }
            Instr::InitStack => {
                self.stack.clear();
                self.invalidate_top_cache(b);
            }
            Instr::InvalidateStack { slot } => {
                if slot != 0xFF {
                    if self.slow_path {
                        let index = self.get_offset_top(b, slot, false);
                        self.set_valid_tag(b, index, false);
                    } else {
                        self.stack.set_invalid(slot);
                    }
                } else if self.slow_path {
                    let zero = self.get_constant(b, 0);
                    b.store_context(OpSize::B8, RegClass::Gpr, layout::ABRIDGED_FTW as u32, zero);
                } else {
                    for i in 0..STACK_SIZE as u8 {
                        self.stack.set_invalid(i);
                    }
                }
            }
            Instr::SyncStackToSlow { dst } => {
                let top = self.synchronize(b);
                self.rewrites.insert(dst, Operand::Value(top));
            }
            Instr::StackForceSlow => {
                self.migrate_to_slow_path_if(b, true);
                self.invalidate_top_cache(b);
            }
            Instr::IncStackTop => {
                if self.slow_path {
                    self.update_top_for_pop_slow(b);
                } else {
                    self.stack.rotate_left();
                }
            }
            Instr::DecStackTop => {
                if self.slow_path {
                    self.update_top_for_push_slow(b);
                } else {
                    self.stack.rotate_right();
                }
            }
            other => unreachable!("{:?} is not an x87 stack op", other.opcode()),
        }
    }
}

/// Run the pass over one block, producing a lowered block. The input is
/// returned unchanged (cloned) when its header carries no x87.
pub fn run(block: &IrBlock, opts: X87Options) -> IrBlock {
    if !block.has_x87 {
        return block.clone();
    }

    let mut pass = X87StackLowering::new(opts);
    let mut b = IrBuilder::with_value_base(block.value_count);
    for _ in 1..block.blocks.len() {
        b.new_block();
    }

    for code_block in &block.blocks {
        b.switch_block(code_block.id);
        pass.reset(&mut b);

        for instr in &code_block.instrs {
            let mut instr = instr.clone();
            pass.apply_rewrites(&mut instr);

            if instr.meta().x87_stack {
                pass.handle(&mut b, instr);
            } else if instr.is_terminator() {
                pass.synchronize(&mut b);
                b.push(instr);
            } else {
                b.push(instr);
            }
        }
    }

    let mut out = b.finish();
    out.has_x87 = false;
    eliminate_dead_values(&mut out);
    if pass.opts.enable_pair_stores {
        fuse_store_pairs(&mut out);
    }
    out
}

/// Drop side-effect-free instructions whose results are never read.
///
/// The lowering leaves behind the conversion chains that fed consumed
/// stack ops (a forwarded store no longer needs its F80CvtTo, for
/// example); this sweep removes them so backends see the minimal block.
fn eliminate_dead_values(block: &mut IrBlock) {
    loop {
        let mut used = vec![false; block.value_count as usize];
        for instr in block.blocks.iter().flat_map(|b| b.instrs.iter()) {
            instr.visit_operands(|o| {
                if let Some(v) = o.value() {
                    used[v.0 as usize] = true;
                }
            });
        }

        let mut removed = false;
        for code_block in &mut block.blocks {
            code_block.instrs.retain(|instr| {
                let meta = instr.meta();
                let dead = meta.has_dest
                    && !meta.side_effects
                    && instr.dst().is_some_and(|d| !used[d.0 as usize]);
                if dead {
                    removed = true;
                }
                !dead
            });
        }
        if !removed {
            break;
        }
    }
}

/// Combine two adjacent same-size stores where the second address is the
/// first plus the element size.
fn fuse_store_pairs(block: &mut IrBlock) {
    for code_block in &mut block.blocks {
        let instrs = &mut code_block.instrs;
        let mut i = 0;
        while i + 1 < instrs.len() {
            let fused = match (&instrs[i], &instrs[i + 1]) {
                (
                    Instr::StoreMem {
                        size: s1,
                        class: c1,
                        addr: a1,
                        offset: o1,
                        value: v1,
                        tso: false,
                    },
                    Instr::StoreMem {
                        size: s2,
                        class: c2,
                        addr: a2,
                        offset: o2,
                        value: v2,
                        tso: false,
                    },
                ) if s1 == s2
                    && c1 == c2
                    && matches!(*s1, OpSize::B32 | OpSize::B64)
                    && o1.index.is_none()
                    && o2.index.is_none()
                    && addr_is_base_plus(instrs, *a2, *a1, s1.bytes() as u64) =>
                {
                    Some(Instr::StoreMemPair {
                        size: *s1,
                        class: *c1,
                        addr: *a1,
                        imm_offset: 0,
                        value1: *v1,
                        value2: *v2,
                    })
                }
                _ => None,
            };
            if let Some(fused) = fused {
                instrs[i] = fused;
                instrs.remove(i + 1);
            }
            i += 1;
        }
    }
}

/// True when `addr` is defined as `base + stride` within this block.
fn addr_is_base_plus(instrs: &[Instr], addr: Operand, base: Operand, stride: u64) -> bool {
    let Operand::Value(v) = addr else {
        return false;
    };
    instrs.iter().any(|i| {
        matches!(i, Instr::AluBin {
            dst,
            op: crate::ops::AluBinOp::Add,
            lhs,
            rhs: Operand::Const(c),
            ..
        } if *dst == v && *lhs == base && *c == stride)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OperandRef;
    use crate::Opcode;

    fn all_ops(block: &IrBlock) -> Vec<Opcode> {
        block
            .blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .map(|i| i.opcode())
            .collect()
    }

    fn build_x87_block(f: impl FnOnce(&mut IrBuilder)) -> IrBlock {
        let mut b = IrBuilder::new();
        f(&mut b);
        b.exit_function(Operand::Const(0x1000));
        let block = b.finish();
        block.validate().expect("input block must validate");
        block
    }

    #[test]
    fn pass_skips_blocks_without_x87() {
        let mut b = IrBuilder::new();
        b.const_int(1);
        b.exit_function(Operand::Const(0));
        let block = b.finish();
        let out = run(&block, X87Options::default());
        assert_eq!(out, block);
    }

    #[test]
    fn output_contains_no_stack_ops() {
        let block = build_x87_block(|b| {
            let loaded = b.load_mem(OpSize::B32, RegClass::Fpr, Operand::Const(0x100), MemOffset::NONE);
            let converted = b.f80_cvt_to(OpSize::B32, loaded);
            b.push(Instr::PushStack {
                value: converted,
                original: loaded,
                load_size: OpSize::B32,
                float: true,
            });
            b.push(Instr::StackBin {
                op: StackBinOp::Add,
                dst_slot: 0,
                slot1: 0,
                slot2: 0,
            });
            b.push(Instr::PopStackDestroy);
        });
        let out = run(&block, X87Options::default());
        assert!(out.is_lowered());
        assert!(!out.has_x87);
        assert_eq!(out.validate(), Ok(()));
    }

    #[test]
    fn peephole_forwards_load_to_store() {
        // fld dword [addr1]; fstp dword [addr2] collapses to a plain
        // 4-byte copy with no F80 conversions.
        let block = build_x87_block(|b| {
            let loaded = b.load_mem(OpSize::B32, RegClass::Fpr, Operand::Const(0x100), MemOffset::NONE);
            let converted = b.f80_cvt_to(OpSize::B32, loaded);
            b.push(Instr::PushStack {
                value: converted,
                original: loaded,
                load_size: OpSize::B32,
                float: true,
            });
            b.push(Instr::StoreStackMem {
                addr: Operand::Const(0x200),
                offset: MemOffset::NONE,
                store_size: OpSize::B32,
            });
            b.push(Instr::PopStackDestroy);
        });
        let out = run(&block, X87Options::default());
        let ops = all_ops(&out);
        // The store must reuse the original 4-byte load; the stack-format
        // conversion chain is dead and swept.
        assert!(!ops.contains(&Opcode::F80Cvt));
        assert!(!ops.contains(&Opcode::F80CvtTo));
        let stores: Vec<_> = out.blocks[0]
            .instrs
            .iter()
            .filter(|i| i.opcode() == Opcode::StoreMem)
            .collect();
        assert_eq!(stores.len(), 1);
        match stores[0] {
            Instr::StoreMem { size, value, .. } => {
                assert_eq!(*size, OpSize::B32);
                // Forwarded straight from the load result.
                assert_eq!(*value, Operand::Value(ValueId(0)));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn mismatched_store_size_converts() {
        let block = build_x87_block(|b| {
            let loaded = b.load_mem(OpSize::B32, RegClass::Fpr, Operand::Const(0x100), MemOffset::NONE);
            let converted = b.f80_cvt_to(OpSize::B32, loaded);
            b.push(Instr::PushStack {
                value: converted,
                original: loaded,
                load_size: OpSize::B32,
                float: true,
            });
            b.push(Instr::StoreStackMem {
                addr: Operand::Const(0x200),
                offset: MemOffset::NONE,
                store_size: OpSize::B64,
            });
        });
        let out = run(&block, X87Options::default());
        assert!(all_ops(&out).contains(&Opcode::F80Cvt));
    }

    #[test]
    fn f80_store_splits_into_two_stores() {
        let block = build_x87_block(|b| {
            let loaded = b.load_mem(OpSize::B32, RegClass::Fpr, Operand::Const(0x100), MemOffset::NONE);
            let converted = b.f80_cvt_to(OpSize::B32, loaded);
            b.push(Instr::PushStack {
                value: converted,
                original: loaded,
                load_size: OpSize::B32,
                float: true,
            });
            b.push(Instr::StoreStackMem {
                addr: Operand::Const(0x200),
                offset: MemOffset::NONE,
                store_size: OpSize::F80,
            });
        });
        let out = run(&block, X87Options::default());
        let stores = all_ops(&out)
            .iter()
            .filter(|o| **o == Opcode::StoreMem)
            .count();
        assert_eq!(stores, 2);
        assert!(all_ops(&out).contains(&Opcode::VExtractToGpr));
    }

    #[test]
    fn read_of_unknown_slot_migrates_to_slow_path() {
        // ReadStackValue on an Unused slot: the pass must fall back to
        // indexed context loads through the real top.
        let block = build_x87_block(|b| {
            let dst = b.alloc_value();
            b.push(Instr::ReadStackValue { dst, slot: 2 });
            b.push(Instr::StoreStackMem {
                addr: Operand::Const(0x300),
                offset: MemOffset::NONE,
                store_size: OpSize::F80,
            });
        });
        let out = run(&block, X87Options::default());
        let ops = all_ops(&out);
        assert!(ops.contains(&Opcode::LoadContextIndexed));
        assert_eq!(out.validate(), Ok(()));
    }

    #[test]
    fn slow_path_push_updates_top_and_tag() {
        let block = build_x87_block(|b| {
            // Force slow path, then push.
            b.push(Instr::StackForceSlow);
            let v = b.vector_const(0);
            b.push(Instr::PushStack {
                value: v,
                original: v,
                load_size: OpSize::B128,
                float: false,
            });
        });
        let out = run(&block, X87Options::default());
        let ops = all_ops(&out);
        assert!(ops.contains(&Opcode::StoreContextIndexed));
        // Tag byte update: load, shift-mask, store.
        assert!(ops.contains(&Opcode::LoadContext));
        assert_eq!(out.validate(), Ok(()));
    }

    #[test]
    fn fast_path_exit_synchronizes_top_and_tags() {
        let block = build_x87_block(|b| {
            let v = b.vector_const(0x3FFF_8000_0000_0000_0000u128);
            b.push(Instr::PushStack {
                value: v,
                original: v,
                load_size: OpSize::B128,
                float: false,
            });
        });
        let out = run(&block, X87Options::default());
        let ops = all_ops(&out);
        // Top write-back, slot store, and a tag update must all appear
        // before the exit.
        assert!(ops.contains(&Opcode::StoreContextIndexed));
        assert!(ops.contains(&Opcode::StoreContext));
        assert_eq!(*ops.last().unwrap(), Opcode::ExitFunction);
        assert_eq!(out.validate(), Ok(()));
    }

    #[test]
    fn reduced_precision_uses_f64_ops() {
        let block = build_x87_block(|b| {
            let loaded = b.load_mem(OpSize::B64, RegClass::Fpr, Operand::Const(0x100), MemOffset::NONE);
            b.push(Instr::PushStack {
                value: loaded,
                original: loaded,
                load_size: OpSize::B64,
                float: true,
            });
            b.push(Instr::StackBin {
                op: StackBinOp::Add,
                dst_slot: 0,
                slot1: 0,
                slot2: 0,
            });
        });
        let out = run(
            &block,
            X87Options {
                reduced_precision: true,
                ..Default::default()
            },
        );
        let ops = all_ops(&out);
        assert!(ops.contains(&Opcode::VBin));
        assert!(!ops.contains(&Opcode::F80Bin));
    }

    #[test]
    fn sincos_pushes_cos_over_sin() {
        let block = build_x87_block(|b| {
            let v = b.vector_const(0);
            b.push(Instr::PushStack {
                value: v,
                original: v,
                load_size: OpSize::B128,
                float: false,
            });
            b.push(Instr::SinCosStack);
        });
        let out = run(&block, X87Options::default());
        let ops = all_ops(&out);
        let f80_un_count = ops.iter().filter(|o| **o == Opcode::F80Un).count();
        assert_eq!(f80_un_count, 2);
        assert_eq!(out.validate(), Ok(()));
    }

    #[test]
    fn xchange_swaps_virtual_slots_without_memory_traffic() {
        let block = build_x87_block(|b| {
            let v1 = b.vector_const(1);
            let v2 = b.vector_const(2);
            for v in [v1, v2] {
                b.push(Instr::PushStack {
                    value: v,
                    original: v,
                    load_size: OpSize::B128,
                    float: false,
                });
            }
            b.push(Instr::F80StackXchange { slot: 1 });
            b.push(Instr::StoreStackMem {
                addr: Operand::Const(0x100),
                offset: MemOffset::NONE,
                store_size: OpSize::F80,
            });
        });
        let out = run(&block, X87Options::default());
        // After the exchange, ST0 is the first pushed value; the split
        // store must reference v1's id (value 0).
        let first_store = out.blocks[0]
            .instrs
            .iter()
            .find_map(|i| match i {
                Instr::StoreMem { size: OpSize::B64, value, .. } => Some(*value),
                _ => None,
            })
            .unwrap();
        assert_eq!(first_store, Operand::Value(ValueId(0)));
    }

    #[test]
    fn valid_tag_fast_path_is_constant() {
        let block = build_x87_block(|b| {
            let v = b.vector_const(0);
            b.push(Instr::PushStack {
                value: v,
                original: v,
                load_size: OpSize::B128,
                float: false,
            });
            let dst = b.alloc_value();
            b.push(Instr::StackValidTag { dst, slot: 0 });
            b.store_context(OpSize::B64, RegClass::Gpr, 0, dst);
        });
        let out = run(&block, X87Options::default());
        // The StoreContext consuming the tag must see an inline 1.
        let store = out.blocks[0]
            .instrs
            .iter()
            .find_map(|i| match i {
                Instr::StoreContext { offset: 0, value, .. } => Some(*value),
                _ => None,
            })
            .unwrap();
        assert_eq!(store, Operand::Const(1));
    }

    #[test]
    fn pair_fusion_combines_adjacent_stores() {
        let mut b = IrBuilder::new();
        let base = b.const_int(0x100);
        let v1 = b.const_int(1);
        let v2 = b.const_int(2);
        let hi = b.add(OpSize::B64, base, Operand::Const(8));
        b.store_mem(OpSize::B64, RegClass::Gpr, base, MemOffset::NONE, v1);
        b.store_mem(OpSize::B64, RegClass::Gpr, hi, MemOffset::NONE, v2);
        b.exit_function(Operand::Const(0));
        let mut block = b.finish();
        block.validate().unwrap();

        fuse_store_pairs(&mut block);
        assert!(all_ops(&block).contains(&Opcode::StoreMemPair));
        assert_eq!(
            all_ops(&block)
                .iter()
                .filter(|o| **o == Opcode::StoreMem)
                .count(),
            0
        );
    }

    #[test]
    fn rewrites_chain_through_later_consumers() {
        // ReadStackValue feeding a StoreContext: the copied op must see
        // the replacement value.
        let block = build_x87_block(|b| {
            let v = b.vector_const(7);
            b.push(Instr::PushStack {
                value: v,
                original: v,
                load_size: OpSize::B128,
                float: false,
            });
            let dst = b.alloc_value();
            b.push(Instr::ReadStackValue { dst, slot: 0 });
            b.store_context(OpSize::B128, RegClass::Fpr, 64, dst);
        });
        let out = run(&block, X87Options::default());
        let mut found = false;
        for i in out.blocks.iter().flat_map(|bb| bb.instrs.iter()) {
            if let Instr::StoreContext { offset: 64, value, .. } = i {
                assert_eq!(*value, Operand::Value(ValueId(0)));
                found = true;
            }
        }
        assert!(found);
        let mut uses_dead_value = false;
        for i in out.blocks.iter().flat_map(|bb| bb.instrs.iter()) {
            i.visit_operands(|o| {
                if let OperandRef::Fpr(v) = o {
                    if v.0 == 1 {
                        uses_dead_value = true;
                    }
                }
            });
        }
        assert!(!uses_dead_value, "consumed ReadStackValue id must be gone");
    }
}
