//! Reference IR executor.
//!
//! Walks a lowered [`IrBlock`] instruction by instruction, dispatching
//! each op through a flat handler table indexed by opcode. The
//! interpreter defines the semantics of the IR: JIT backends are
//! validated against it, and delegate the soft-float and string-compare
//! opcodes back to the shared fallback table in [`fallbacks`].

use std::sync::OnceLock;

use oxbow_cpu::CpuState;
use oxbow_ir::{BlockId, Instr, IrBlock, Opcode};
use oxbow_softfloat::ExceptionFlags;
use thiserror::Error;

pub mod fallbacks;
mod handlers;
pub mod host;
pub mod mem;
mod ssa;

pub use host::{CpuidResult, HostHooks, NullHost, SyscallArgs};
pub use mem::{GuestMem, MemFault, SharedMem, VecMem};
pub use ssa::SsaStore;

#[derive(Debug, Error)]
pub enum InterpError {
    #[error(transparent)]
    Mem(#[from] MemFault),
}

/// Why the block stopped executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecResult {
    /// ExitFunction: the next guest RIP has been written to the context.
    Exit,
    CallbackReturn,
    SignalReturn,
    /// Break: the synchronous-fault record is filled and the signal has
    /// been posted through the host.
    Fault { signal: i32 },
}

/// Per-block control state the branch handlers feed back to the outer
/// loop.
#[derive(Debug, Default)]
pub(crate) struct BlockResults {
    /// Re-seat the block iterator at this target.
    pub redo: Option<BlockId>,
    /// Terminate the block with this result.
    pub quit: Option<ExecResult>,
}

/// Execution context for one block.
pub struct Interp<'a> {
    pub state: &'a mut CpuState,
    pub mem: &'a mut dyn GuestMem,
    pub host: &'a mut dyn HostHooks,
    pub ssa: SsaStore,
    /// Guest RIP of the block entrypoint, for PC-relative constants.
    pub entry_rip: u64,
    /// FCW installed by the last F80LoadFcw, seeding soft-float state.
    pub fcw: u16,
    /// Sticky soft-float exception flags since the last F80LoadFcw.
    pub sf_flags: ExceptionFlags,
    pub(crate) results: BlockResults,
}

impl Interp<'_> {
    /// Thread the soft-float flags from one operation back into the
    /// sticky set and the architectural IE bit.
    pub(crate) fn absorb_sf_flags(&mut self, flags: ExceptionFlags) {
        self.sf_flags |= flags;
        if flags.contains(ExceptionFlags::INVALID) {
            self.state.flags[oxbow_cpu::flag_loc::X87_IE] = 1;
        }
    }
}

pub(crate) type Handler = for<'a, 'b> fn(&'a mut Interp<'b>, &'a Instr) -> Result<(), InterpError>;
pub(crate) type HandlerTable = [Handler; Opcode::COUNT];

fn unimplemented_handler(_interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    tracing::warn!(op = ?instr.opcode(), "not implemented");
    Ok(())
}

fn handler_table() -> &'static HandlerTable {
    static TABLE: OnceLock<HandlerTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: HandlerTable = [unimplemented_handler; Opcode::COUNT];
        handlers::alu::register(&mut table);
        handlers::memory::register(&mut table);
        handlers::atomic::register(&mut table);
        handlers::vector::register(&mut table);
        handlers::convert::register(&mut table);
        handlers::f80::register(&mut table);
        handlers::branch::register(&mut table);
        handlers::misc::register(&mut table);
        handlers::string::register(&mut table);
        table
    })
}

/// Execute one lowered block against the guest state.
///
/// The block must be free of x87 stack-family ops (run the lowering pass
/// first); stack ops hit the not-implemented handler and do nothing.
pub fn execute_block(
    block: &IrBlock,
    state: &mut CpuState,
    mem: &mut dyn GuestMem,
    host: &mut dyn HostHooks,
) -> Result<ExecResult, InterpError> {
    let entry_rip = state.rip;
    let fcw = state.fcw;
    let mut interp = Interp {
        state,
        mem,
        host,
        ssa: SsaStore::new(block.value_count),
        entry_rip,
        fcw,
        sf_flags: ExceptionFlags::empty(),
        results: BlockResults::default(),
    };
    let table = handler_table();

    let mut current = BlockId(0);
    'blocks: loop {
        for instr in &block.block(current).instrs {
            table[instr.opcode() as usize](&mut interp, instr)?;

            if let Some(target) = interp.results.redo.take() {
                current = target;
                continue 'blocks;
            }
            if let Some(result) = interp.results.quit.take() {
                return Ok(result);
            }
        }
        // A validated block always ends in a terminator that either
        // reseats the iterator or quits.
        unreachable!("fell off the end of block {}", current.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxbow_ir::{IrBuilder, Operand};
    use oxbow_types::{OpSize, RegClass};

    #[test]
    fn executes_straight_line_block() {
        let mut b = IrBuilder::new();
        let v = b.const_int(0x1234);
        b.store_context(OpSize::B64, RegClass::Gpr, oxbow_cpu::layout::gpr(0) as u32, v);
        b.exit_function(Operand::Const(0x2000));
        let block = b.finish();
        block.validate().unwrap();

        let mut state = CpuState::default();
        let mut mem = VecMem::new(0x100);
        let mut host = NullHost;
        let result = execute_block(&block, &mut state, &mut mem, &mut host).unwrap();
        assert_eq!(result, ExecResult::Exit);
        assert_eq!(state.gpr[0], 0x1234);
        assert_eq!(state.rip, 0x2000);
    }

    #[test]
    fn unknown_stack_op_is_ignored() {
        let mut b = IrBuilder::new();
        b.push(Instr::PopStackDestroy);
        b.exit_function(Operand::Const(0));
        let block = b.finish();

        let mut state = CpuState::default();
        let mut mem = VecMem::new(0x10);
        let mut host = NullHost;
        // Logs a warning and keeps going.
        let result = execute_block(&block, &mut state, &mut mem, &mut host).unwrap();
        assert_eq!(result, ExecResult::Exit);
    }
}
