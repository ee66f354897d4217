//! Control transfer, syscall dispatch, and host-transfer handlers.

use super::set;
use crate::{ExecResult, HandlerTable, Interp, InterpError, SyscallArgs};
use oxbow_cpu::SynchronousFault;
use oxbow_ir::{Instr, Opcode};

pub(crate) fn register(table: &mut HandlerTable) {
    set(table, Opcode::Jump, jump);
    set(table, Opcode::CondJump, cond_jump);
    set(table, Opcode::ExitFunction, exit_function);
    set(table, Opcode::CallbackReturn, callback_return);
    set(table, Opcode::SignalReturn, signal_return);
    set(table, Opcode::Break, break_op);
    set(table, Opcode::Syscall, syscall);
    set(table, Opcode::Thunk, thunk);
    set(table, Opcode::GuestCpuid, guest_cpuid);
    set(table, Opcode::ValidateCode, validate_code);
}

fn jump(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::Jump { target } = *instr else {
        unreachable!()
    };
    interp.results.redo = Some(target);
    Ok(())
}

fn cond_jump(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::CondJump {
        cond,
        compare_size,
        ref cmp1,
        ref cmp2,
        true_target,
        false_target,
    } = *instr
    else {
        unreachable!()
    };
    let a = interp.ssa.operand(cmp1);
    let b = interp.ssa.operand(cmp2);
    let taken = cond.eval(compare_size, a, b);
    interp.results.redo = Some(if taken { true_target } else { false_target });
    Ok(())
}

fn exit_function(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::ExitFunction { ref next_rip } = *instr else {
        unreachable!()
    };
    interp.state.rip = interp.ssa.operand(next_rip);
    interp.results.quit = Some(ExecResult::Exit);
    Ok(())
}

fn callback_return(interp: &mut Interp<'_>, _instr: &Instr) -> Result<(), InterpError> {
    interp.host.callback_return(interp.state);
    interp.results.quit = Some(ExecResult::CallbackReturn);
    Ok(())
}

fn signal_return(interp: &mut Interp<'_>, _instr: &Instr) -> Result<(), InterpError> {
    interp.host.signal_return(interp.state);
    interp.results.quit = Some(ExecResult::SignalReturn);
    Ok(())
}

fn break_op(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::Break { reason } = *instr else {
        unreachable!()
    };
    interp.state.synchronous_fault = SynchronousFault {
        raised: true,
        signal: reason.signal,
        trap_no: reason.trap_no,
        err_code: reason.err_code,
        si_code: reason.si_code,
    };
    interp.host.raise_signal(interp.state, reason.signal);
    interp.results.quit = Some(ExecResult::Fault {
        signal: reason.signal,
    });
    Ok(())
}

fn syscall(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::Syscall { dst, ref args } = *instr else {
        unreachable!()
    };
    let mut packed = SyscallArgs::default();
    for (slot, arg) in packed.args.iter_mut().zip(args.iter()) {
        *slot = interp.ssa.operand(arg);
    }
    let result = interp.host.syscall(interp.state, &packed);
    interp.ssa.write_u64(dst, result);
    Ok(())
}

fn thunk(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::Thunk {
        name_hash,
        ref arg,
    } = *instr
    else {
        unreachable!()
    };
    let arg = interp.ssa.operand(arg);
    interp.host.thunk(name_hash, arg);
    Ok(())
}

fn guest_cpuid(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::GuestCpuid {
        dst,
        ref function,
        ref leaf,
    } = *instr
    else {
        unreachable!()
    };
    let function = interp.ssa.operand(function);
    let leaf = interp.ssa.operand(leaf);
    let r = interp.host.cpuid(function, leaf);
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&r.eax.to_le_bytes());
    out[4..8].copy_from_slice(&r.ebx.to_le_bytes());
    out[8..12].copy_from_slice(&r.ecx.to_le_bytes());
    out[12..16].copy_from_slice(&r.edx.to_le_bytes());
    interp.ssa.write_bytes(dst, &out);
    Ok(())
}

fn validate_code(interp: &mut Interp<'_>, instr: &Instr) -> Result<(), InterpError> {
    let Instr::ValidateCode {
        dst,
        offset,
        ref original,
        len,
    } = *instr
    else {
        unreachable!()
    };
    let addr = interp.entry_rip.wrapping_add(offset as u64);
    let mut current = [0u8; 16];
    let len = len as usize;
    interp.mem.read(addr, &mut current[..len])?;
    let matches = current[..len] == original[..len];
    interp.ssa.write_u64(dst, (!matches) as u64);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{execute_block, CpuidResult, HostHooks, NullHost, VecMem};
    use oxbow_cpu::{layout, CpuState};
    use oxbow_ir::ops::BreakReason;
    use oxbow_ir::{IrBuilder, Operand};
    use oxbow_types::{CondCode, OpSize, RegClass};

    #[test]
    fn cond_jump_selects_target() {
        // Block 0: jump to 1 when 5 < 7 (it is); block 1 exits with a
        // marker, block 2 with another.
        let mut b = IrBuilder::new();
        let b1 = b.new_block();
        let b2 = b.new_block();
        b.push(Instr::CondJump {
            cond: CondCode::Ult,
            compare_size: OpSize::B64,
            cmp1: Operand::Const(5),
            cmp2: Operand::Const(7),
            true_target: b1,
            false_target: b2,
        });
        b.switch_block(b1);
        b.exit_function(Operand::Const(0x1111));
        b.switch_block(b2);
        b.exit_function(Operand::Const(0x2222));
        let block = b.finish();
        block.validate().unwrap();

        let mut state = CpuState::default();
        let mut mem = VecMem::new(0x10);
        let mut host = NullHost;
        execute_block(&block, &mut state, &mut mem, &mut host).unwrap();
        assert_eq!(state.rip, 0x1111);
    }

    #[test]
    fn break_fills_fault_record() {
        let mut b = IrBuilder::new();
        b.push(Instr::Break {
            reason: BreakReason {
                signal: 5, // SIGTRAP
                trap_no: 3,
                err_code: 0,
                si_code: 128,
            },
        });
        let block = b.finish();
        block.validate().unwrap();

        let mut state = CpuState::default();
        let mut mem = VecMem::new(0x10);
        let mut host = NullHost;
        let r = execute_block(&block, &mut state, &mut mem, &mut host).unwrap();
        assert_eq!(r, ExecResult::Fault { signal: 5 });
        assert!(state.synchronous_fault.raised);
        assert_eq!(state.synchronous_fault.trap_no, 3);
        assert_eq!(state.synchronous_fault.si_code, 128);
    }

    struct RecordingHost {
        syscalls: Vec<SyscallArgs>,
    }

    impl HostHooks for RecordingHost {
        fn syscall(&mut self, _state: &mut CpuState, args: &SyscallArgs) -> u64 {
            self.syscalls.push(*args);
            0x5005
        }
        fn raise_signal(&mut self, _state: &mut CpuState, _signal: i32) {}
        fn signal_return(&mut self, _state: &mut CpuState) {}
        fn callback_return(&mut self, _state: &mut CpuState) {}
        fn cpuid(&mut self, function: u64, _leaf: u64) -> CpuidResult {
            CpuidResult {
                eax: function as u32,
                ebx: 0xB,
                ecx: 0xC,
                edx: 0xD,
            }
        }
        fn thunk(&mut self, _name_hash: u64, _arg: u64) {}
        fn random(&mut self, _out: &mut [u8]) -> bool {
            false
        }
    }

    #[test]
    fn syscall_marshals_args_and_result() {
        let mut b = IrBuilder::new();
        let dst = b.alloc_value();
        b.push(Instr::Syscall {
            dst,
            args: vec![
                Operand::Const(1),
                Operand::Const(2),
                Operand::Const(3),
            ],
        });
        b.store_context(OpSize::B64, RegClass::Gpr, layout::gpr(0) as u32, dst);
        b.exit_function(Operand::Const(0));
        let block = b.finish();
        block.validate().unwrap();

        let mut state = CpuState::default();
        let mut mem = VecMem::new(0x10);
        let mut host = RecordingHost { syscalls: vec![] };
        execute_block(&block, &mut state, &mut mem, &mut host).unwrap();
        assert_eq!(state.gpr[0], 0x5005);
        assert_eq!(host.syscalls.len(), 1);
        assert_eq!(host.syscalls[0].args[..3], [1, 2, 3]);
        assert_eq!(host.syscalls[0].args[3..], [0, 0, 0, 0]);
    }

    #[test]
    fn cpuid_packs_four_words() {
        let mut b = IrBuilder::new();
        let dst = b.alloc_value();
        b.push(Instr::GuestCpuid {
            dst,
            function: Operand::Const(0x8000_0001),
            leaf: Operand::Const(0),
        });
        b.store_context(OpSize::B128, RegClass::Fpr, layout::vector(0) as u32, dst);
        b.exit_function(Operand::Const(0));
        let block = b.finish();

        let mut state = CpuState::default();
        let mut mem = VecMem::new(0x10);
        let mut host = RecordingHost { syscalls: vec![] };
        execute_block(&block, &mut state, &mut mem, &mut host).unwrap();
        assert_eq!(state.vectors[0].u32_at(0), 0x8000_0001);
        assert_eq!(state.vectors[0].u32_at(3), 0xD);
    }

    #[test]
    fn validate_code_compares_guest_bytes() {
        let mut b = IrBuilder::new();
        let dst = b.alloc_value();
        let mut original = [0u8; 16];
        original[..4].copy_from_slice(&[0x90, 0x90, 0xC3, 0x00]);
        b.push(Instr::ValidateCode {
            dst,
            offset: 0,
            original,
            len: 3,
        });
        b.store_context(OpSize::B64, RegClass::Gpr, layout::gpr(0) as u32, dst);
        b.exit_function(Operand::Const(0));
        let block = b.finish();

        let mut state = CpuState::default();
        state.rip = 0x40;
        let mut mem = VecMem::new(0x100);
        mem.load(0x40, &[0x90, 0x90, 0xC3]);
        let mut host = NullHost;
        execute_block(&block, &mut state, &mut mem, &mut host).unwrap();
        assert_eq!(state.gpr[0], 0, "matching code returns 0");

        let mut state = CpuState::default();
        state.rip = 0x40;
        let mut mem = VecMem::new(0x100);
        mem.load(0x40, &[0x90, 0xCC, 0xC3]);
        execute_block(&block, &mut state, &mut mem, &mut host).unwrap();
        assert_eq!(state.gpr[0], 1, "patched code returns nonzero");
    }
}
