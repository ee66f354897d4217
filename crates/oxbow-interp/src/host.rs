//! Host services the interpreter delegates to.
//!
//! Syscall dispatch, signal injection, guest CPUID, thunks, and the few
//! host queries (cpu id, entropy, cycle counter) all go through this
//! trait so the core stays platform-neutral. The embedding process
//! provides the real implementation; [`NullHost`] is the inert default
//! used by tests that never reach these ops.

use oxbow_cpu::CpuState;

/// Packed syscall arguments, as handed to the external dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallArgs {
    pub args: [u64; 7],
}

/// Result of a guest CPUID query: EAX, EBX, ECX, EDX.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

pub trait HostHooks {
    /// Dispatch a guest syscall; the return value lands in the
    /// destination SSA slot. May block the host thread.
    fn syscall(&mut self, state: &mut CpuState, args: &SyscallArgs) -> u64;

    /// Post a signal to the current thread. Called by Break after the
    /// synchronous-fault record is filled in.
    fn raise_signal(&mut self, state: &mut CpuState, signal: i32);

    /// Asynchronous signal-return transfer.
    fn signal_return(&mut self, state: &mut CpuState);

    /// Callback-return transfer.
    fn callback_return(&mut self, state: &mut CpuState);

    /// Guest CPUID emulation (external collaborator).
    fn cpuid(&mut self, function: u64, leaf: u64) -> CpuidResult;

    /// Invoke a native thunk identified by its name hash.
    fn thunk(&mut self, name_hash: u64, arg: u64);

    /// `(node << 12) | cpu` of the executing processor.
    fn processor_id(&mut self) -> u64 {
        0
    }

    /// Fill with entropy; returns false when no entropy is available.
    fn random(&mut self, out: &mut [u8]) -> bool;

    /// Monotonic cycle counter.
    fn cycle_counter(&mut self) -> u64 {
        0
    }
}

/// Inert host: syscalls return ENOSYS-style failure, entropy is
/// unavailable, signals only log.
#[derive(Debug, Default)]
pub struct NullHost;

impl HostHooks for NullHost {
    fn syscall(&mut self, _state: &mut CpuState, _args: &SyscallArgs) -> u64 {
        u64::MAX
    }

    fn raise_signal(&mut self, _state: &mut CpuState, signal: i32) {
        tracing::warn!(signal, "signal raised with no host attached");
    }

    fn signal_return(&mut self, _state: &mut CpuState) {}

    fn callback_return(&mut self, _state: &mut CpuState) {}

    fn cpuid(&mut self, _function: u64, _leaf: u64) -> CpuidResult {
        CpuidResult::default()
    }

    fn thunk(&mut self, name_hash: u64, _arg: u64) {
        tracing::warn!(name_hash, "thunk invoked with no host attached");
    }

    fn random(&mut self, _out: &mut [u8]) -> bool {
        false
    }
}
