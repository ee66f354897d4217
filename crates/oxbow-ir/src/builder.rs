//! Block builder.
//!
//! The decoder and the lowering passes construct IR exclusively through
//! this type: it allocates SSA values, tracks the current code block, and
//! stamps the x87 bit when a stack-family op is emitted.

use crate::ops::{
    AluBinOp, F64BinOp, F64UnOp, F80BinOp, F80UnOp, Instr, MemOffset, NamedVectorConst, Operand,
    VBinOp, VUnOp,
};
use crate::{BlockId, CodeBlock, IrBlock, ValueId};
use oxbow_types::{CondCode, FcmpFlags, OpSize, RegClass, RoundMode};

#[derive(Debug)]
pub struct IrBuilder {
    has_x87: bool,
    next_value: u32,
    blocks: Vec<CodeBlock>,
    current: usize,
}

impl Default for IrBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IrBuilder {
    pub fn new() -> Self {
        IrBuilder {
            has_x87: false,
            next_value: 0,
            blocks: vec![CodeBlock {
                id: BlockId(0),
                instrs: Vec::new(),
            }],
            current: 0,
        }
    }

    /// Builder whose fresh values start above an existing block's value
    /// space. Used by passes that copy instructions while emitting new
    /// ones.
    pub fn with_value_base(base: u32) -> Self {
        let mut b = Self::new();
        b.next_value = base;
        b
    }

    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(CodeBlock {
            id,
            instrs: Vec::new(),
        });
        id
    }

    pub fn switch_block(&mut self, id: BlockId) {
        assert!((id.0 as usize) < self.blocks.len());
        self.current = id.0 as usize;
    }

    pub fn current_block(&self) -> BlockId {
        BlockId(self.current as u32)
    }

    pub fn alloc_value(&mut self) -> ValueId {
        let id = ValueId(self.next_value);
        self.next_value += 1;
        id
    }

    pub fn value_count(&self) -> u32 {
        self.next_value
    }

    pub fn push(&mut self, instr: Instr) {
        if instr.meta().x87_stack {
            self.has_x87 = true;
        }
        self.blocks[self.current].instrs.push(instr);
    }

    pub fn finish(self) -> IrBlock {
        IrBlock {
            has_x87: self.has_x87,
            value_count: self.next_value,
            blocks: self.blocks,
        }
    }

    // Typed emit helpers. Each returns the destination value.

    pub fn const_int(&mut self, value: u64) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::Const { dst, value });
        dst
    }

    pub fn vector_const(&mut self, value: u128) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::VectorConst { dst, value });
        dst
    }

    pub fn named_vector_const(&mut self, constant: NamedVectorConst) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::NamedVectorConst { dst, constant });
        dst
    }

    pub fn alu(
        &mut self,
        op: AluBinOp,
        size: OpSize,
        lhs: impl Into<Operand>,
        rhs: impl Into<Operand>,
    ) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::AluBin {
            dst,
            op,
            size,
            lhs: lhs.into(),
            rhs: rhs.into(),
        });
        dst
    }

    pub fn add(&mut self, size: OpSize, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> ValueId {
        self.alu(AluBinOp::Add, size, lhs, rhs)
    }

    pub fn sub(&mut self, size: OpSize, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> ValueId {
        self.alu(AluBinOp::Sub, size, lhs, rhs)
    }

    pub fn and(&mut self, size: OpSize, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> ValueId {
        self.alu(AluBinOp::And, size, lhs, rhs)
    }

    pub fn or(&mut self, size: OpSize, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> ValueId {
        self.alu(AluBinOp::Or, size, lhs, rhs)
    }

    pub fn xor(&mut self, size: OpSize, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> ValueId {
        self.alu(AluBinOp::Xor, size, lhs, rhs)
    }

    pub fn andn(&mut self, size: OpSize, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> ValueId {
        self.alu(AluBinOp::Andn, size, lhs, rhs)
    }

    pub fn lshl(&mut self, size: OpSize, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> ValueId {
        self.alu(AluBinOp::Lshl, size, lhs, rhs)
    }

    pub fn lshr(&mut self, size: OpSize, lhs: impl Into<Operand>, rhs: impl Into<Operand>) -> ValueId {
        self.alu(AluBinOp::Lshr, size, lhs, rhs)
    }

    pub fn bfe(&mut self, size: OpSize, width: u8, lsb: u8, src: impl Into<Operand>) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::Bfe {
            dst,
            size,
            signed: false,
            width,
            lsb,
            src: src.into(),
        });
        dst
    }

    pub fn bfi(
        &mut self,
        size: OpSize,
        width: u8,
        lsb: u8,
        base: impl Into<Operand>,
        insert: impl Into<Operand>,
    ) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::Bfi {
            dst,
            size,
            xil: false,
            width,
            lsb,
            base: base.into(),
            insert: insert.into(),
        });
        dst
    }

    pub fn select(
        &mut self,
        size: OpSize,
        compare_size: OpSize,
        cond: CondCode,
        cmp1: impl Into<Operand>,
        cmp2: impl Into<Operand>,
        true_val: impl Into<Operand>,
        false_val: impl Into<Operand>,
    ) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::Select {
            dst,
            size,
            compare_size,
            cond,
            cmp1: cmp1.into(),
            cmp2: cmp2.into(),
            true_val: true_val.into(),
            false_val: false_val.into(),
        });
        dst
    }

    pub fn load_context(&mut self, size: OpSize, class: RegClass, offset: u32) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::LoadContext {
            dst,
            size,
            class,
            offset,
        });
        dst
    }

    pub fn store_context(
        &mut self,
        size: OpSize,
        class: RegClass,
        offset: u32,
        value: impl Into<Operand>,
    ) {
        self.push(Instr::StoreContext {
            size,
            class,
            offset,
            value: value.into(),
        });
    }

    pub fn load_context_indexed(
        &mut self,
        size: OpSize,
        class: RegClass,
        base_offset: u32,
        stride: u32,
        index: impl Into<Operand>,
    ) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::LoadContextIndexed {
            dst,
            size,
            class,
            base_offset,
            stride,
            index: index.into(),
        });
        dst
    }

    pub fn store_context_indexed(
        &mut self,
        size: OpSize,
        class: RegClass,
        base_offset: u32,
        stride: u32,
        index: impl Into<Operand>,
        value: impl Into<Operand>,
    ) {
        self.push(Instr::StoreContextIndexed {
            size,
            class,
            base_offset,
            stride,
            index: index.into(),
            value: value.into(),
        });
    }

    pub fn load_mem(
        &mut self,
        size: OpSize,
        class: RegClass,
        addr: impl Into<Operand>,
        offset: MemOffset,
    ) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::LoadMem {
            dst,
            size,
            class,
            addr: addr.into(),
            offset,
            tso: false,
        });
        dst
    }

    pub fn store_mem(
        &mut self,
        size: OpSize,
        class: RegClass,
        addr: impl Into<Operand>,
        offset: MemOffset,
        value: impl Into<Operand>,
    ) {
        self.push(Instr::StoreMem {
            size,
            class,
            addr: addr.into(),
            offset,
            value: value.into(),
            tso: false,
        });
    }

    pub fn vbin(&mut self, op: VBinOp, size: OpSize, elem: OpSize, lhs: ValueId, rhs: ValueId) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::VBin {
            dst,
            op,
            size,
            elem,
            lhs,
            rhs,
        });
        dst
    }

    pub fn vun(&mut self, op: VUnOp, size: OpSize, elem: OpSize, src: ValueId) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::VUn {
            dst,
            op,
            size,
            elem,
            src,
        });
        dst
    }

    pub fn vbsl(&mut self, size: OpSize, mask: ValueId, true_vec: ValueId, false_vec: ValueId) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::VBsl {
            dst,
            size,
            mask,
            true_vec,
            false_vec,
        });
        dst
    }

    pub fn vextract_to_gpr(&mut self, size: OpSize, elem: OpSize, vector: ValueId, idx: u8) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::VExtractToGpr {
            dst,
            size,
            elem,
            vector,
            idx,
        });
        dst
    }

    pub fn vcast_from_gpr(&mut self, size: OpSize, elem: OpSize, value: impl Into<Operand>) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::VCastFromGpr {
            dst,
            size,
            elem,
            value: value.into(),
        });
        dst
    }

    pub fn float_ftof(&mut self, size: OpSize, src_size: OpSize, src: ValueId) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::FloatFToF {
            dst,
            size,
            src_size,
            src,
        });
        dst
    }

    pub fn fcmp(&mut self, size: OpSize, lhs: ValueId, rhs: ValueId, flags: FcmpFlags) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::FCmp {
            dst,
            size,
            lhs,
            rhs,
            flags,
        });
        dst
    }

    pub fn f80_bin(&mut self, op: F80BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::F80Bin { dst, op, lhs, rhs });
        dst
    }

    pub fn f80_un(&mut self, op: F80UnOp, src: ValueId) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::F80Un { dst, op, src });
        dst
    }

    pub fn f80_cmp(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::F80Cmp {
            dst,
            lhs,
            rhs,
            flags: FcmpFlags::all(),
        });
        dst
    }

    pub fn f80_cvt(&mut self, size: OpSize, src: ValueId) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::F80Cvt { dst, size, src });
        dst
    }

    pub fn f80_cvt_to(&mut self, src_size: OpSize, src: ValueId) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::F80CvtTo { dst, src_size, src });
        dst
    }

    pub fn f64_bin(&mut self, op: F64BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::F64Bin { dst, op, lhs, rhs });
        dst
    }

    pub fn f64_un(&mut self, op: F64UnOp, src: ValueId) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::F64Un { dst, op, src });
        dst
    }

    pub fn vf_to_i_round(
        &mut self,
        size: OpSize,
        elem: OpSize,
        src: ValueId,
        mode: RoundMode,
    ) -> ValueId {
        let dst = self.alloc_value();
        self.push(Instr::VFToIRound {
            dst,
            size,
            elem,
            src,
            mode,
        });
        dst
    }

    pub fn jump(&mut self, target: BlockId) {
        self.push(Instr::Jump { target });
    }

    pub fn exit_function(&mut self, next_rip: impl Into<Operand>) {
        self.push(Instr::ExitFunction {
            next_rip: next_rip.into(),
        });
    }
}
