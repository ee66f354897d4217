//! Guest CPU state.
//!
//! One `CpuState` exists per guest thread. The layout is `#[repr(C)]` and
//! frozen: the x87 lowering pass and the context load/store ops address
//! fields by byte offset, and JIT backends bake those offsets into
//! generated code. Offsets are exported as constants below and pinned by
//! tests.

use oxbow_types::VectorReg;

pub mod flag_loc {
    //! Byte indices into [`CpuState::flags`]. One byte per flag, value 0
    //! or 1, except TOP which holds the 3-bit top-of-stack index.

    pub const CF: usize = 0;
    pub const PF: usize = 2;
    pub const AF: usize = 4;
    pub const ZF: usize = 6;
    pub const SF: usize = 7;
    pub const TF: usize = 8;
    pub const IF: usize = 9;
    pub const DF: usize = 10;
    pub const OF: usize = 11;

    pub const X87_C0: usize = 16;
    pub const X87_C1: usize = 17;
    pub const X87_C2: usize = 18;
    pub const X87_C3: usize = 19;
    /// 3-bit x87 top-of-stack index.
    pub const X87_TOP: usize = 20;
    /// Invalid-operation sticky bit of the x87 status word.
    pub const X87_IE: usize = 21;

    pub const COUNT: usize = 24;
}

/// Synchronous fault record filled in by the Break op before the signal is
/// posted to the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SynchronousFault {
    pub raised: bool,
    pub signal: i32,
    pub trap_no: u32,
    pub err_code: u32,
    pub si_code: i32,
}

/// Guest CPU register file.
///
/// x87 slots are stored with a 16-byte stride even though the values are
/// 80-bit; the upper 6 bytes of each slot are ignored.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct CpuState {
    /// Program counter; ExitFunction writes the next guest RIP here.
    pub rip: u64,
    /// General purpose registers, Rax..R15.
    pub gpr: [u64; 16],
    /// One byte per flag location; see [`flag_loc`].
    pub flags: [u8; flag_loc::COUNT],
    /// Parity pseudo-register: PF is the (inverted) parity of the low byte.
    pub pf_raw: u64,
    /// Aux-carry pseudo-register: AF is bit 4.
    pub af_raw: u64,
    /// Direction pseudo-register: +1 ascending, -1 descending.
    pub df: i64,
    /// Deferred NZCV cache at canonical bit positions.
    pub nzcv: u32,
    /// x87 control word.
    pub fcw: u16,
    /// Abridged x87 tag word: bit N set = slot N valid.
    pub abridged_ftw: u8,
    /// Guest rounding control: bits 0-1 are the two-bit mode, bit 2 the
    /// flush-to-zero bit mirrored from the FCW.
    pub rounding_mode: u8,
    /// Vector register file: low 128 bits = SSE lane, high 128 = AVX lane.
    pub vectors: [VectorReg; 16],
    /// x87 register file, 16-byte stride.
    pub x87: [[u8; 16]; 8],
    pub synchronous_fault: SynchronousFault,
}

impl Default for CpuState {
    fn default() -> Self {
        CpuState {
            rip: 0,
            gpr: [0; 16],
            flags: [0; flag_loc::COUNT],
            pf_raw: 0,
            af_raw: 0,
            df: 1,
            nzcv: 0,
            fcw: 0x037F,
            abridged_ftw: 0,
            rounding_mode: 0,
            vectors: [VectorReg::default(); 16],
            x87: [[0; 16]; 8],
            synchronous_fault: SynchronousFault::default(),
        }
    }
}

impl CpuState {
    /// Current x87 top-of-stack index (0-7).
    #[inline]
    pub fn top(&self) -> u8 {
        self.flags[flag_loc::X87_TOP] & 7
    }

    #[inline]
    pub fn set_top(&mut self, top: u8) {
        self.flags[flag_loc::X87_TOP] = top & 7;
    }

    /// Read the x87 slot at physical index `phys` as raw bytes.
    #[inline]
    pub fn x87_slot(&self, phys: u8) -> [u8; 16] {
        self.x87[(phys & 7) as usize]
    }

    #[inline]
    pub fn set_x87_slot(&mut self, phys: u8, value: [u8; 16]) {
        self.x87[(phys & 7) as usize] = value;
    }

    /// Physical slot index for ST(offset) relative to the current top.
    #[inline]
    pub fn st_phys(&self, offset: u8) -> u8 {
        (self.top() + offset) & 7
    }

    #[inline]
    pub fn tag_valid(&self, phys: u8) -> bool {
        self.abridged_ftw & (1 << (phys & 7)) != 0
    }

    #[inline]
    pub fn set_tag(&mut self, phys: u8, valid: bool) {
        let bit = 1u8 << (phys & 7);
        if valid {
            self.abridged_ftw |= bit;
        } else {
            self.abridged_ftw &= !bit;
        }
    }

    #[inline]
    pub fn flag(&self, loc: usize) -> bool {
        self.flags[loc] != 0
    }

    #[inline]
    pub fn set_flag(&mut self, loc: usize, value: bool) {
        self.flags[loc] = value as u8;
    }
}

/// Frozen byte offsets into [`CpuState`], used by context load/store ops
/// and the x87 lowering pass.
pub mod layout {
    use super::CpuState;
    use std::mem::offset_of;

    pub const RIP: usize = offset_of!(CpuState, rip);
    pub const GPR: usize = offset_of!(CpuState, gpr);
    pub const FLAGS: usize = offset_of!(CpuState, flags);
    pub const PF_RAW: usize = offset_of!(CpuState, pf_raw);
    pub const AF_RAW: usize = offset_of!(CpuState, af_raw);
    pub const DF: usize = offset_of!(CpuState, df);
    pub const NZCV: usize = offset_of!(CpuState, nzcv);
    pub const FCW: usize = offset_of!(CpuState, fcw);
    pub const ABRIDGED_FTW: usize = offset_of!(CpuState, abridged_ftw);
    pub const VECTORS: usize = offset_of!(CpuState, vectors);
    pub const X87: usize = offset_of!(CpuState, x87);

    pub const GPR_STRIDE: usize = 8;
    pub const VECTOR_STRIDE: usize = 32;
    /// x87 slots keep a 16-byte stride even for 80-bit values.
    pub const X87_STRIDE: usize = 16;

    pub const X87_TOP: usize = FLAGS + super::flag_loc::X87_TOP;

    pub const fn gpr(index: usize) -> usize {
        GPR + index * GPR_STRIDE
    }

    pub const fn vector(index: usize) -> usize {
        VECTORS + index * VECTOR_STRIDE
    }

    pub const fn x87_slot(index: usize) -> usize {
        X87 + index * X87_STRIDE
    }
}

/// Raw byte access into the state, for the context load/store ops.
///
/// Bounds are the caller's responsibility; offsets come from [`layout`].
impl CpuState {
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        let raw = self as *const CpuState as *const u8;
        assert!(offset + out.len() <= std::mem::size_of::<CpuState>());
        // Layout is repr(C) with no uninitialized padding inside the
        // addressable fields.
        unsafe {
            std::ptr::copy_nonoverlapping(raw.add(offset), out.as_mut_ptr(), out.len());
        }
    }

    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) {
        let raw = self as *mut CpuState as *mut u8;
        assert!(offset + data.len() <= std::mem::size_of::<CpuState>());
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), raw.add(offset), data.len());
        }
    }
}
