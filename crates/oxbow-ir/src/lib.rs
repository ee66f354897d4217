//! SSA intermediate representation for the translator core.
//!
//! One [`IrBlock`] per decoded guest basic block: a set of code blocks
//! (intra-block control flow) over a shared SSA value space. The decoder
//! builds blocks through [`IrBuilder`]; the x87 lowering pass consumes a
//! block and emits a new one free of stack-family ops; the interpreter
//! (or a JIT backend) executes the result.

mod builder;
pub mod flags;
pub mod ops;
pub mod passes;

pub use builder::IrBuilder;
pub use ops::{Instr, MemOffset, OpMeta, Opcode, Operand};

/// Identifies an SSA value within one IR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(pub u32);

/// Identifies a code block within one IR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

/// A straight-line run of instructions ending in a terminator.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeBlock {
    pub id: BlockId,
    pub instrs: Vec<Instr>,
}

/// One translated guest basic block.
#[derive(Debug, Clone, PartialEq)]
pub struct IrBlock {
    /// Set when the block contains x87 stack-family ops; the lowering
    /// pass exits early otherwise.
    pub has_x87: bool,
    /// Number of SSA values; dense in `0..value_count`.
    pub value_count: u32,
    pub blocks: Vec<CodeBlock>,
}

impl IrBlock {
    pub fn block(&self, id: BlockId) -> &CodeBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn instr_count(&self) -> usize {
        self.blocks.iter().map(|b| b.instrs.len()).sum()
    }

    /// Structural validation: values defined exactly once and before
    /// first use, terminators only in final position, value references in
    /// range, and stack ops only when the header advertises x87.
    pub fn validate(&self) -> Result<(), String> {
        let mut defined = vec![false; self.value_count as usize];

        for block in &self.blocks {
            if block.id.0 as usize >= self.blocks.len() {
                return Err(format!("block id {} out of range", block.id.0));
            }
            let Some(last) = block.instrs.last() else {
                return Err(format!("block {} is empty", block.id.0));
            };
            if !last.is_terminator() {
                return Err(format!(
                    "block {} does not end in a terminator (got {:?})",
                    block.id.0,
                    last.opcode()
                ));
            }

            for (idx, instr) in block.instrs.iter().enumerate() {
                if instr.is_terminator() && idx != block.instrs.len() - 1 {
                    return Err(format!(
                        "terminator {:?} must be the final instruction of block {}",
                        instr.opcode(),
                        block.id.0
                    ));
                }
                if instr.meta().x87_stack && !self.has_x87 {
                    return Err(format!(
                        "{:?} present but the block header does not advertise x87",
                        instr.opcode()
                    ));
                }

                let mut err = None;
                instr.visit_operands(|operand| {
                    if err.is_some() {
                        return;
                    }
                    if let Some(v) = operand.value() {
                        if v.0 >= self.value_count {
                            err = Some(format!(
                                "value {} exceeds max_value_id {}",
                                v.0,
                                self.value_count.saturating_sub(1)
                            ));
                        } else if !defined[v.0 as usize] {
                            err = Some(format!(
                                "use-before-def of value {} at {:?}",
                                v.0,
                                instr.opcode()
                            ));
                        }
                    }
                });
                if let Some(e) = err {
                    return Err(e);
                }

                if let Some(dst) = instr.dst() {
                    if dst.0 >= self.value_count {
                        return Err(format!(
                            "destination {} exceeds max_value_id {}",
                            dst.0,
                            self.value_count.saturating_sub(1)
                        ));
                    }
                    if defined[dst.0 as usize] {
                        return Err(format!("value {} defined multiple times", dst.0));
                    }
                    defined[dst.0 as usize] = true;
                }

                if let Instr::Jump { target } = instr {
                    if target.0 as usize >= self.blocks.len() {
                        return Err(format!("jump target {} out of range", target.0));
                    }
                }
                if let Instr::CondJump {
                    true_target,
                    false_target,
                    ..
                } = instr
                {
                    for t in [true_target, false_target] {
                        if t.0 as usize >= self.blocks.len() {
                            return Err(format!("jump target {} out of range", t.0));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// True when no stack-family opcode remains (the lowering pass's
    /// output contract).
    pub fn is_lowered(&self) -> bool {
        self.blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .all(|i| !i.meta().x87_stack)
    }

    /// Register-pressure summary handed to backends alongside the
    /// lowered block.
    pub fn reg_alloc_hints(&self) -> RegAllocHints {
        let mut hints = RegAllocHints::default();
        for instr in self.blocks.iter().flat_map(|b| b.instrs.iter()) {
            let meta = instr.meta();
            if meta.has_dest {
                match meta.dest_class {
                    oxbow_types::RegClass::Gpr => hints.gpr_values += 1,
                    oxbow_types::RegClass::Fpr => hints.fpr_values += 1,
                }
            }
            if let Instr::LoadContextIndexed { base_offset, .. }
            | Instr::StoreContextIndexed { base_offset, .. } = instr
            {
                if *base_offset as usize == oxbow_cpu::layout::X87 {
                    hints.touches_x87_file = true;
                }
            }
        }
        hints
    }
}

/// Coarse per-block register-allocation hints for JIT backends: how many
/// values of each class the block defines, and whether the x87 slot file
/// is dynamically indexed (which pins the backend's scratch base
/// register).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegAllocHints {
    pub gpr_values: u32,
    pub fpr_values: u32,
    pub touches_x87_file: bool,
}
