//! The instruction catalogue.
//!
//! Each SSA instruction is a struct variant carrying its operands and the
//! size information for the operation. GPR-class operands are
//! [`Operand`]s (value reference or inline constant); FPR-class operands
//! are always value references.

use crate::{BlockId, ValueId};
use oxbow_types::{
    ArchReg, CondCode, FcmpFlags, FenceKind, MemOffsetType, OpSize, RegClass, RoundMode,
};

/// A GPR-class operand: either an SSA value or an inline constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Value(ValueId),
    Const(u64),
}

impl From<ValueId> for Operand {
    fn from(v: ValueId) -> Operand {
        Operand::Value(v)
    }
}

/// Index operand of a memory access: `base + extend(index) * scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemOffset {
    pub index: Option<Operand>,
    pub ty: MemOffsetType,
    pub scale: u8,
}

impl MemOffset {
    pub const NONE: MemOffset = MemOffset {
        index: None,
        ty: MemOffsetType::Sxtx,
        scale: 1,
    };
}

/// Two-operand integer ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluBinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    /// BMI1 ANDN: `lhs & !rhs`.
    Andn,
    Lshl,
    Lshr,
    Ashr,
    /// Rotate right; left rotates are synthesized as `size*8 - amount`.
    Ror,
    Mul,
    UMul,
    Div,
    UDiv,
    Rem,
    URem,
}

/// One-operand integer ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluUnOp {
    Neg,
    Abs,
    Not,
    Popcount,
    FindLsb,
    FindMsb,
    CountLeadingZeroes,
    /// Byte swap at 2/4/8-byte widths.
    Rev,
}

/// 128/16-bit x86-style divides: two-register dividend, one divisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LongDivOp {
    Div,
    UDiv,
    Rem,
    URem,
}

/// Atomic read-modify-write kinds. `Neg` ignores the value operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicOpKind {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Swap,
    Neg,
}

/// Two-operand vector operations. Integer lanes are 1/2/4/8 bytes; float
/// lanes 4/8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VBinOp {
    Add,
    Sub,
    /// Unsigned/signed saturating add/sub.
    UqAdd,
    UqSub,
    SqAdd,
    SqSub,
    /// Pairwise add of concatenated sources.
    AddP,
    UMin,
    SMin,
    UMax,
    SMax,
    Mul,
    /// Widening multiplies of the low (Mull) or high (Mull2) half.
    UMull,
    SMull,
    UMull2,
    SMull2,
    /// Widening absolute difference of the low half.
    UAbdl,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FMin,
    FMax,
    And,
    /// `lhs & !rhs`.
    Bic,
    Or,
    Xor,
    Zip,
    Zip2,
    Uzp,
    Uzp2,
    Trn,
    Trn2,
    CmpEq,
    CmpGt,
    FCmpEq,
    FCmpNeq,
    FCmpLt,
    FCmpGt,
    FCmpLe,
    FCmpOrd,
    FCmpUno,
    /// Per-lane shifts by the low byte of each rhs lane.
    UShl,
    UShr,
    SShr,
    /// Saturating narrows into the high half; lhs supplies the preserved
    /// low half.
    SqXtn2,
    SqXtun2,
}

/// One-operand vector operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VUnOp {
    Abs,
    Neg,
    Not,
    Popcount,
    FNeg,
    FAbs,
    FSqrt,
    /// Reciprocal / reciprocal square root estimates.
    FRecp,
    FRSqrt,
    /// Horizontal add reduce into lane 0.
    AddV,
    CmpEqZ,
    CmpGtZ,
    Rev32,
    Rev64,
    /// Widening extends of the low (..l) or high (..l2) half.
    Sxtl,
    Sxtl2,
    Uxtl,
    Uxtl2,
    /// Saturating narrows into the low half (upper half zeroed).
    SqXtn,
    SqXtun,
}

/// Immediate vector shifts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VShiftImmOp {
    Shl,
    UShr,
    SShr,
    /// Narrowing shift right into the low half.
    UShrN,
}

/// Immediate shifts that merge into an existing vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VShiftInsertOp {
    /// Shift left and insert under the shifted-in mask.
    Sli,
    /// Shift right and insert under the shifted-in mask.
    Sri,
    /// Narrowing shift right into the high half; the base supplies the
    /// preserved low half.
    UShrN2,
}

/// Stack-relative x87 binary arithmetic, pre-lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Prem,
    Prem1,
    Scale,
    Fyl2x,
    Atan,
}

/// Stack-relative x87 unary arithmetic, pre-lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackUnOp {
    Sqrt,
    Sin,
    Cos,
    F2xm1,
    /// FPTAN: replaces ST0 with tan and pushes 1.0.
    Tan,
    Round,
    ChangeSign,
    Abs,
}

/// F80 two-operand soft-float ops (post-lowering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum F80BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Fyl2x,
    Atan,
    Prem,
    Prem1,
    Scale,
}

/// F80 one-operand soft-float ops (post-lowering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum F80UnOp {
    Sqrt,
    Sin,
    Cos,
    Tan,
    F2xm1,
    Round,
}

/// Reduced-precision f64 twins of the F80 ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum F64BinOp {
    Atan,
    Prem,
    Prem1,
    Scale,
    Fyl2x,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum F64UnOp {
    Sin,
    Cos,
    Tan,
    F2xm1,
}

/// Named 128-bit constants the x87 lowering needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamedVectorConst {
    /// Sign bit of the F80 format (bit 79).
    F80SignMask,
    /// F80-encoded 1.0.
    F80One,
}

impl NamedVectorConst {
    pub fn bits(self) -> u128 {
        match self {
            NamedVectorConst::F80SignMask => 1u128 << 79,
            NamedVectorConst::F80One => (0x3FFFu128 << 64) | (1u128 << 63),
        }
    }
}

/// Fault description carried by Break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakReason {
    pub signal: i32,
    pub trap_no: u32,
    pub err_code: u32,
    pub si_code: i32,
}

/// A single SSA instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    // Constants.
    Const {
        dst: ValueId,
        value: u64,
    },
    VectorConst {
        dst: ValueId,
        value: u128,
    },
    NamedVectorConst {
        dst: ValueId,
        constant: NamedVectorConst,
    },
    /// Entrypoint-relative PC constant; masked to 32 bits at size 4.
    EntrypointOffset {
        dst: ValueId,
        size: OpSize,
        offset: i64,
    },

    // Integer ALU.
    AluBin {
        dst: ValueId,
        op: AluBinOp,
        size: OpSize,
        lhs: Operand,
        rhs: Operand,
    },
    AluUn {
        dst: ValueId,
        op: AluUnOp,
        size: OpSize,
        src: Operand,
    },
    /// Sign-correct widening multiply: result size exceeds source size.
    MulWide {
        dst: ValueId,
        size: OpSize,
        signed: bool,
        lhs: Operand,
        rhs: Operand,
    },
    /// High half of a widening multiply.
    MulHigh {
        dst: ValueId,
        size: OpSize,
        signed: bool,
        lhs: Operand,
        rhs: Operand,
    },
    LongDivide {
        dst: ValueId,
        op: LongDivOp,
        size: OpSize,
        hi: Operand,
        lo: Operand,
        divisor: Operand,
    },
    /// Packs the low 32 bits of two values into one 64-bit result.
    TruncElementPair {
        dst: ValueId,
        lo: Operand,
        hi: Operand,
    },
    /// Zero/sign-extending bitfield extract.
    Bfe {
        dst: ValueId,
        size: OpSize,
        signed: bool,
        width: u8,
        lsb: u8,
        src: Operand,
    },
    /// Bitfield insert; `xil` keeps the remaining destination bits from
    /// `base` above the field (BFXIL) instead of around it.
    Bfi {
        dst: ValueId,
        size: OpSize,
        xil: bool,
        width: u8,
        lsb: u8,
        base: Operand,
        insert: Operand,
    },
    Pdep {
        dst: ValueId,
        size: OpSize,
        src: Operand,
        mask: Operand,
    },
    Pext {
        dst: ValueId,
        size: OpSize,
        src: Operand,
        mask: Operand,
    },
    AddNzcv {
        dst: ValueId,
        size: OpSize,
        lhs: Operand,
        rhs: Operand,
    },
    SubNzcv {
        dst: ValueId,
        size: OpSize,
        lhs: Operand,
        rhs: Operand,
        /// Produce the arm64-style inverted borrow instead of x86 carry.
        invert_carry: bool,
    },
    TestNz {
        dst: ValueId,
        size: OpSize,
        lhs: Operand,
        rhs: Operand,
    },
    Select {
        dst: ValueId,
        size: OpSize,
        compare_size: OpSize,
        cond: CondCode,
        cmp1: Operand,
        cmp2: Operand,
        true_val: Operand,
        false_val: Operand,
    },

    // Context and architectural register access.
    LoadContext {
        dst: ValueId,
        size: OpSize,
        class: RegClass,
        offset: u32,
    },
    StoreContext {
        size: OpSize,
        class: RegClass,
        offset: u32,
        value: Operand,
    },
    LoadContextIndexed {
        dst: ValueId,
        size: OpSize,
        class: RegClass,
        base_offset: u32,
        stride: u32,
        index: Operand,
    },
    StoreContextIndexed {
        size: OpSize,
        class: RegClass,
        base_offset: u32,
        stride: u32,
        index: Operand,
        value: Operand,
    },
    LoadRegister {
        dst: ValueId,
        reg: ArchReg,
    },
    StoreRegister {
        reg: ArchReg,
        value: Operand,
    },

    // Memory.
    LoadMem {
        dst: ValueId,
        size: OpSize,
        class: RegClass,
        addr: Operand,
        offset: MemOffset,
        tso: bool,
    },
    StoreMem {
        size: OpSize,
        class: RegClass,
        addr: Operand,
        offset: MemOffset,
        value: Operand,
        tso: bool,
    },
    /// Two adjacent stores fused by the x87 pass.
    StoreMemPair {
        size: OpSize,
        class: RegClass,
        addr: Operand,
        imm_offset: i32,
        value1: Operand,
        value2: Operand,
    },
    CacheLineClear {
        addr: Operand,
    },

    // Atomics.
    Cas {
        dst: ValueId,
        size: OpSize,
        expected: Operand,
        desired: Operand,
        addr: Operand,
    },
    CasPair {
        dst: ValueId,
        size: OpSize,
        expected_lo: Operand,
        expected_hi: Operand,
        desired_lo: Operand,
        desired_hi: Operand,
        addr: Operand,
    },
    AtomicOp {
        op: AtomicOpKind,
        size: OpSize,
        addr: Operand,
        value: Operand,
    },
    AtomicFetchOp {
        dst: ValueId,
        op: AtomicOpKind,
        size: OpSize,
        addr: Operand,
        value: Operand,
    },
    Fence {
        kind: FenceKind,
    },

    // Vector.
    VBin {
        dst: ValueId,
        op: VBinOp,
        size: OpSize,
        elem: OpSize,
        lhs: ValueId,
        rhs: ValueId,
    },
    VUn {
        dst: ValueId,
        op: VUnOp,
        size: OpSize,
        elem: OpSize,
        src: ValueId,
    },
    /// All lanes shifted by a scalar amount.
    VShiftScalar {
        dst: ValueId,
        op: VShiftImmOp,
        size: OpSize,
        elem: OpSize,
        vector: ValueId,
        amount: Operand,
    },
    VShiftImm {
        dst: ValueId,
        op: VShiftImmOp,
        size: OpSize,
        elem: OpSize,
        vector: ValueId,
        amount: u8,
    },
    /// Immediate shift merged into `base`.
    VShiftInsert {
        dst: ValueId,
        op: VShiftInsertOp,
        size: OpSize,
        elem: OpSize,
        base: ValueId,
        vector: ValueId,
        amount: u8,
    },
    VInsElement {
        dst: ValueId,
        size: OpSize,
        elem: OpSize,
        dest_idx: u8,
        src_idx: u8,
        dest_vec: ValueId,
        src_vec: ValueId,
    },
    /// Insert a scalar GPR value into one lane.
    VInsScalar {
        dst: ValueId,
        size: OpSize,
        elem: OpSize,
        dest_idx: u8,
        dest_vec: ValueId,
        value: Operand,
    },
    /// Extract one lane into a GPR-class value.
    VExtractToGpr {
        dst: ValueId,
        size: OpSize,
        elem: OpSize,
        vector: ValueId,
        idx: u8,
    },
    VDupElement {
        dst: ValueId,
        size: OpSize,
        elem: OpSize,
        vector: ValueId,
        idx: u8,
    },
    /// Extract `size` bytes starting at `index` from the concatenation
    /// `upper:lower`.
    VExtr {
        dst: ValueId,
        size: OpSize,
        lower: ValueId,
        upper: ValueId,
        index: u8,
    },
    /// Byte table lookup; out-of-range indices produce zero.
    VTbl1 {
        dst: ValueId,
        size: OpSize,
        table: ValueId,
        indices: ValueId,
    },
    /// Bitwise select: `(mask & true_vec) | (!mask & false_vec)`.
    VBsl {
        dst: ValueId,
        size: OpSize,
        mask: ValueId,
        true_vec: ValueId,
        false_vec: ValueId,
    },
    /// Complex add with rotation (90 or 270 degrees).
    VFcadd {
        dst: ValueId,
        size: OpSize,
        elem: OpSize,
        rotate: u16,
        lhs: ValueId,
        rhs: ValueId,
    },
    /// Pure size retag.
    VBitcast {
        dst: ValueId,
        size: OpSize,
        src: ValueId,
    },
    /// Move a GPR value into lane 0, zeroing the rest.
    VCastFromGpr {
        dst: ValueId,
        size: OpSize,
        elem: OpSize,
        value: Operand,
    },
    /// SSE4.2 explicit-length string compare.
    VPCmpEstrx {
        dst: ValueId,
        lhs: ValueId,
        rhs: ValueId,
        lhs_len: Operand,
        rhs_len: Operand,
        control: u16,
    },
    /// SSE4.2 implicit-length (NUL-scanned) string compare.
    VPCmpIstrx {
        dst: ValueId,
        lhs: ValueId,
        rhs: ValueId,
        control: u16,
    },

    // Scalar float conversions.
    FloatFromGpr {
        dst: ValueId,
        size: OpSize,
        src_size: OpSize,
        src: Operand,
    },
    FloatToGpr {
        dst: ValueId,
        size: OpSize,
        src_size: OpSize,
        truncate: bool,
        src: ValueId,
    },
    FloatFToF {
        dst: ValueId,
        size: OpSize,
        src_size: OpSize,
        src: ValueId,
    },
    /// Scalar float compare producing an FcmpFlags mask.
    FCmp {
        dst: ValueId,
        size: OpSize,
        lhs: ValueId,
        rhs: ValueId,
        flags: FcmpFlags,
    },

    // Vector conversions.
    VSToF {
        dst: ValueId,
        size: OpSize,
        elem: OpSize,
        src: ValueId,
    },
    VFToInt {
        dst: ValueId,
        size: OpSize,
        elem: OpSize,
        src: ValueId,
        truncate: bool,
    },
    /// Per-lane float width conversion; size-halving uses the low half.
    VFToF {
        dst: ValueId,
        size: OpSize,
        elem: OpSize,
        src_elem: OpSize,
        src: ValueId,
    },
    /// Round lanes to integral float values.
    VFToIRound {
        dst: ValueId,
        size: OpSize,
        elem: OpSize,
        src: ValueId,
        mode: RoundMode,
    },

    // Rounding-mode management.
    GetRoundingMode {
        dst: ValueId,
    },
    SetRoundingMode {
        value: Operand,
    },

    // F80 soft-float (post-lowering).
    F80Bin {
        dst: ValueId,
        op: F80BinOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    F80Un {
        dst: ValueId,
        op: F80UnOp,
        src: ValueId,
    },
    F80Cmp {
        dst: ValueId,
        lhs: ValueId,
        rhs: ValueId,
        flags: FcmpFlags,
    },
    /// F80 -> f32/f64 (size selects the destination width).
    F80Cvt {
        dst: ValueId,
        size: OpSize,
        src: ValueId,
    },
    /// F80 -> int (size selects 2/4/8), optionally truncating.
    F80CvtInt {
        dst: ValueId,
        size: OpSize,
        truncate: bool,
        src: ValueId,
    },
    /// f32/f64 -> F80.
    F80CvtTo {
        dst: ValueId,
        src_size: OpSize,
        src: ValueId,
    },
    /// int16/int32 -> F80.
    F80CvtToInt {
        dst: ValueId,
        src_size: OpSize,
        src: Operand,
    },
    F80BcdLoad {
        dst: ValueId,
        src: ValueId,
    },
    F80BcdStore {
        dst: ValueId,
        src: ValueId,
    },
    F80XtractExp {
        dst: ValueId,
        src: ValueId,
    },
    F80XtractSig {
        dst: ValueId,
        src: ValueId,
    },
    /// Install a new FCW: decodes rounding/precision and clears the
    /// sticky soft-float flags.
    F80LoadFcw {
        value: Operand,
    },

    // Reduced-precision f64 twins.
    F64Bin {
        dst: ValueId,
        op: F64BinOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    F64Un {
        dst: ValueId,
        op: F64UnOp,
        src: ValueId,
    },

    // Control transfer.
    Jump {
        target: BlockId,
    },
    CondJump {
        cond: CondCode,
        compare_size: OpSize,
        cmp1: Operand,
        cmp2: Operand,
        true_target: BlockId,
        false_target: BlockId,
    },
    ExitFunction {
        next_rip: Operand,
    },
    CallbackReturn,
    SignalReturn,
    Break {
        reason: BreakReason,
    },
    Syscall {
        dst: ValueId,
        args: Vec<Operand>,
    },
    Thunk {
        name_hash: u64,
        arg: Operand,
    },
    GuestCpuid {
        dst: ValueId,
        function: Operand,
        leaf: Operand,
    },
    /// Compare guest code bytes against the inline original; 0 on match.
    ValidateCode {
        dst: ValueId,
        offset: i64,
        original: [u8; 16],
        len: u8,
    },

    // Misc.
    Print {
        size: OpSize,
        value: Operand,
    },
    ProcessorId {
        dst: ValueId,
    },
    CycleCounter {
        dst: ValueId,
    },
    /// Random value in lane 0, success flag in lane 1.
    RdRand {
        dst: ValueId,
    },

    // x87 stack ops (consumed by the lowering pass; never interpreted).
    PushStack {
        /// The value in stack format (F80 or f64 under reduced precision).
        value: ValueId,
        /// The original pre-conversion value, for store forwarding.
        original: ValueId,
        load_size: OpSize,
        float: bool,
    },
    PopStackDestroy,
    CopyPushStack {
        slot: u8,
    },
    ReadStackValue {
        dst: ValueId,
        slot: u8,
    },
    StoreStackMem {
        addr: Operand,
        offset: MemOffset,
        store_size: OpSize,
    },
    /// Copy ST0 into another stack slot.
    StoreStackToStack {
        slot: u8,
    },
    F80StackXchange {
        slot: u8,
    },
    F80CmpStack {
        dst: ValueId,
        slot: u8,
    },
    F80CmpValue {
        dst: ValueId,
        value: ValueId,
    },
    F80StackTest {
        dst: ValueId,
        slot: u8,
    },
    F80VbslStack {
        mask: ValueId,
        slot1: u8,
        slot2: u8,
    },
    StackBin {
        op: StackBinOp,
        dst_slot: u8,
        slot1: u8,
        slot2: u8,
    },
    StackBinValue {
        op: StackBinOp,
        slot: u8,
        value: ValueId,
        reverse: bool,
    },
    StackUn {
        op: StackUnOp,
    },
    SinCosStack,
    InitStack,
    /// 0xff invalidates every slot.
    InvalidateStack {
        slot: u8,
    },
    /// 0 when the slot is valid, 1 otherwise.
    StackValidTag {
        dst: ValueId,
        slot: u8,
    },
    /// Flush the virtual stack; yields the synchronized top value.
    SyncStackToSlow {
        dst: ValueId,
    },
    StackForceSlow,
    IncStackTop,
    DecStackTop,
}

/// Flat opcode identifiers, used to index dispatch and fallback tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    Const = 0,
    VectorConst,
    NamedVectorConst,
    EntrypointOffset,
    AluBin,
    AluUn,
    MulWide,
    MulHigh,
    LongDivide,
    TruncElementPair,
    Bfe,
    Bfi,
    Pdep,
    Pext,
    AddNzcv,
    SubNzcv,
    TestNz,
    Select,
    LoadContext,
    StoreContext,
    LoadContextIndexed,
    StoreContextIndexed,
    LoadRegister,
    StoreRegister,
    LoadMem,
    StoreMem,
    StoreMemPair,
    CacheLineClear,
    Cas,
    CasPair,
    AtomicOp,
    AtomicFetchOp,
    Fence,
    VBin,
    VUn,
    VShiftScalar,
    VShiftImm,
    VShiftInsert,
    VInsElement,
    VInsScalar,
    VExtractToGpr,
    VDupElement,
    VExtr,
    VTbl1,
    VBsl,
    VFcadd,
    VBitcast,
    VCastFromGpr,
    VPCmpEstrx,
    VPCmpIstrx,
    FloatFromGpr,
    FloatToGpr,
    FloatFToF,
    FCmp,
    VSToF,
    VFToInt,
    VFToF,
    VFToIRound,
    GetRoundingMode,
    SetRoundingMode,
    F80Bin,
    F80Un,
    F80Cmp,
    F80Cvt,
    F80CvtInt,
    F80CvtTo,
    F80CvtToInt,
    F80BcdLoad,
    F80BcdStore,
    F80XtractExp,
    F80XtractSig,
    F80LoadFcw,
    F64Bin,
    F64Un,
    Jump,
    CondJump,
    ExitFunction,
    CallbackReturn,
    SignalReturn,
    Break,
    Syscall,
    Thunk,
    GuestCpuid,
    ValidateCode,
    Print,
    ProcessorId,
    CycleCounter,
    RdRand,
    PushStack,
    PopStackDestroy,
    CopyPushStack,
    ReadStackValue,
    StoreStackMem,
    StoreStackToStack,
    F80StackXchange,
    F80CmpStack,
    F80CmpValue,
    F80StackTest,
    F80VbslStack,
    StackBin,
    StackBinValue,
    StackUn,
    SinCosStack,
    InitStack,
    InvalidateStack,
    StackValidTag,
    SyncStackToSlow,
    StackForceSlow,
    IncStackTop,
    DecStackTop,
}

impl Opcode {
    pub const COUNT: usize = Opcode::DecStackTop as usize + 1;

    pub fn from_u16(v: u16) -> Option<Opcode> {
        if (v as usize) < Opcode::COUNT {
            // Discriminants are assigned contiguously from zero.
            Some(unsafe { std::mem::transmute::<u16, Opcode>(v) })
        } else {
            None
        }
    }
}

/// Per-opcode metadata.
#[derive(Debug, Clone, Copy)]
pub struct OpMeta {
    pub has_dest: bool,
    /// Destination register class when `has_dest`.
    pub dest_class: RegClass,
    pub terminator: bool,
    pub side_effects: bool,
    /// Member of the x87 stack family the lowering pass consumes.
    pub x87_stack: bool,
}

impl Instr {
    pub fn opcode(&self) -> Opcode {
        match self {
            Instr::Const { .. } => Opcode::Const,
            Instr::VectorConst { .. } => Opcode::VectorConst,
            Instr::NamedVectorConst { .. } => Opcode::NamedVectorConst,
            Instr::EntrypointOffset { .. } => Opcode::EntrypointOffset,
            Instr::AluBin { .. } => Opcode::AluBin,
            Instr::AluUn { .. } => Opcode::AluUn,
            Instr::MulWide { .. } => Opcode::MulWide,
            Instr::MulHigh { .. } => Opcode::MulHigh,
            Instr::LongDivide { .. } => Opcode::LongDivide,
            Instr::TruncElementPair { .. } => Opcode::TruncElementPair,
            Instr::Bfe { .. } => Opcode::Bfe,
            Instr::Bfi { .. } => Opcode::Bfi,
            Instr::Pdep { .. } => Opcode::Pdep,
            Instr::Pext { .. } => Opcode::Pext,
            Instr::AddNzcv { .. } => Opcode::AddNzcv,
            Instr::SubNzcv { .. } => Opcode::SubNzcv,
            Instr::TestNz { .. } => Opcode::TestNz,
            Instr::Select { .. } => Opcode::Select,
            Instr::LoadContext { .. } => Opcode::LoadContext,
            Instr::StoreContext { .. } => Opcode::StoreContext,
            Instr::LoadContextIndexed { .. } => Opcode::LoadContextIndexed,
            Instr::StoreContextIndexed { .. } => Opcode::StoreContextIndexed,
            Instr::LoadRegister { .. } => Opcode::LoadRegister,
            Instr::StoreRegister { .. } => Opcode::StoreRegister,
            Instr::LoadMem { .. } => Opcode::LoadMem,
            Instr::StoreMem { .. } => Opcode::StoreMem,
            Instr::StoreMemPair { .. } => Opcode::StoreMemPair,
            Instr::CacheLineClear { .. } => Opcode::CacheLineClear,
            Instr::Cas { .. } => Opcode::Cas,
            Instr::CasPair { .. } => Opcode::CasPair,
            Instr::AtomicOp { .. } => Opcode::AtomicOp,
            Instr::AtomicFetchOp { .. } => Opcode::AtomicFetchOp,
            Instr::Fence { .. } => Opcode::Fence,
            Instr::VBin { .. } => Opcode::VBin,
            Instr::VUn { .. } => Opcode::VUn,
            Instr::VShiftScalar { .. } => Opcode::VShiftScalar,
            Instr::VShiftImm { .. } => Opcode::VShiftImm,
            Instr::VShiftInsert { .. } => Opcode::VShiftInsert,
            Instr::VInsElement { .. } => Opcode::VInsElement,
            Instr::VInsScalar { .. } => Opcode::VInsScalar,
            Instr::VExtractToGpr { .. } => Opcode::VExtractToGpr,
            Instr::VDupElement { .. } => Opcode::VDupElement,
            Instr::VExtr { .. } => Opcode::VExtr,
            Instr::VTbl1 { .. } => Opcode::VTbl1,
            Instr::VBsl { .. } => Opcode::VBsl,
            Instr::VFcadd { .. } => Opcode::VFcadd,
            Instr::VBitcast { .. } => Opcode::VBitcast,
            Instr::VCastFromGpr { .. } => Opcode::VCastFromGpr,
            Instr::VPCmpEstrx { .. } => Opcode::VPCmpEstrx,
            Instr::VPCmpIstrx { .. } => Opcode::VPCmpIstrx,
            Instr::FloatFromGpr { .. } => Opcode::FloatFromGpr,
            Instr::FloatToGpr { .. } => Opcode::FloatToGpr,
            Instr::FloatFToF { .. } => Opcode::FloatFToF,
            Instr::FCmp { .. } => Opcode::FCmp,
            Instr::VSToF { .. } => Opcode::VSToF,
            Instr::VFToInt { .. } => Opcode::VFToInt,
            Instr::VFToF { .. } => Opcode::VFToF,
            Instr::VFToIRound { .. } => Opcode::VFToIRound,
            Instr::GetRoundingMode { .. } => Opcode::GetRoundingMode,
            Instr::SetRoundingMode { .. } => Opcode::SetRoundingMode,
            Instr::F80Bin { .. } => Opcode::F80Bin,
            Instr::F80Un { .. } => Opcode::F80Un,
            Instr::F80Cmp { .. } => Opcode::F80Cmp,
            Instr::F80Cvt { .. } => Opcode::F80Cvt,
            Instr::F80CvtInt { .. } => Opcode::F80CvtInt,
            Instr::F80CvtTo { .. } => Opcode::F80CvtTo,
            Instr::F80CvtToInt { .. } => Opcode::F80CvtToInt,
            Instr::F80BcdLoad { .. } => Opcode::F80BcdLoad,
            Instr::F80BcdStore { .. } => Opcode::F80BcdStore,
            Instr::F80XtractExp { .. } => Opcode::F80XtractExp,
            Instr::F80XtractSig { .. } => Opcode::F80XtractSig,
            Instr::F80LoadFcw { .. } => Opcode::F80LoadFcw,
            Instr::F64Bin { .. } => Opcode::F64Bin,
            Instr::F64Un { .. } => Opcode::F64Un,
            Instr::Jump { .. } => Opcode::Jump,
            Instr::CondJump { .. } => Opcode::CondJump,
            Instr::ExitFunction { .. } => Opcode::ExitFunction,
            Instr::CallbackReturn => Opcode::CallbackReturn,
            Instr::SignalReturn => Opcode::SignalReturn,
            Instr::Break { .. } => Opcode::Break,
            Instr::Syscall { .. } => Opcode::Syscall,
            Instr::Thunk { .. } => Opcode::Thunk,
            Instr::GuestCpuid { .. } => Opcode::GuestCpuid,
            Instr::ValidateCode { .. } => Opcode::ValidateCode,
            Instr::Print { .. } => Opcode::Print,
            Instr::ProcessorId { .. } => Opcode::ProcessorId,
            Instr::CycleCounter { .. } => Opcode::CycleCounter,
            Instr::RdRand { .. } => Opcode::RdRand,
            Instr::PushStack { .. } => Opcode::PushStack,
            Instr::PopStackDestroy => Opcode::PopStackDestroy,
            Instr::CopyPushStack { .. } => Opcode::CopyPushStack,
            Instr::ReadStackValue { .. } => Opcode::ReadStackValue,
            Instr::StoreStackMem { .. } => Opcode::StoreStackMem,
            Instr::StoreStackToStack { .. } => Opcode::StoreStackToStack,
            Instr::F80StackXchange { .. } => Opcode::F80StackXchange,
            Instr::F80CmpStack { .. } => Opcode::F80CmpStack,
            Instr::F80CmpValue { .. } => Opcode::F80CmpValue,
            Instr::F80StackTest { .. } => Opcode::F80StackTest,
            Instr::F80VbslStack { .. } => Opcode::F80VbslStack,
            Instr::StackBin { .. } => Opcode::StackBin,
            Instr::StackBinValue { .. } => Opcode::StackBinValue,
            Instr::StackUn { .. } => Opcode::StackUn,
            Instr::SinCosStack => Opcode::SinCosStack,
            Instr::InitStack => Opcode::InitStack,
            Instr::InvalidateStack { .. } => Opcode::InvalidateStack,
            Instr::StackValidTag { .. } => Opcode::StackValidTag,
            Instr::SyncStackToSlow { .. } => Opcode::SyncStackToSlow,
            Instr::StackForceSlow => Opcode::StackForceSlow,
            Instr::IncStackTop => Opcode::IncStackTop,
            Instr::DecStackTop => Opcode::DecStackTop,
        }
    }

    /// Destination value, if this instruction defines one.
    pub fn dst(&self) -> Option<ValueId> {
        use Instr::*;
        match *self {
            Const { dst, .. }
            | VectorConst { dst, .. }
            | NamedVectorConst { dst, .. }
            | EntrypointOffset { dst, .. }
            | AluBin { dst, .. }
            | AluUn { dst, .. }
            | MulWide { dst, .. }
            | MulHigh { dst, .. }
            | LongDivide { dst, .. }
            | TruncElementPair { dst, .. }
            | Bfe { dst, .. }
            | Bfi { dst, .. }
            | Pdep { dst, .. }
            | Pext { dst, .. }
            | AddNzcv { dst, .. }
            | SubNzcv { dst, .. }
            | TestNz { dst, .. }
            | Select { dst, .. }
            | LoadContext { dst, .. }
            | LoadContextIndexed { dst, .. }
            | LoadRegister { dst, .. }
            | LoadMem { dst, .. }
            | Cas { dst, .. }
            | CasPair { dst, .. }
            | AtomicFetchOp { dst, .. }
            | VBin { dst, .. }
            | VUn { dst, .. }
            | VShiftScalar { dst, .. }
            | VShiftImm { dst, .. }
            | VShiftInsert { dst, .. }
            | VInsElement { dst, .. }
            | VInsScalar { dst, .. }
            | VExtractToGpr { dst, .. }
            | VDupElement { dst, .. }
            | VExtr { dst, .. }
            | VTbl1 { dst, .. }
            | VBsl { dst, .. }
            | VFcadd { dst, .. }
            | VBitcast { dst, .. }
            | VCastFromGpr { dst, .. }
            | VPCmpEstrx { dst, .. }
            | VPCmpIstrx { dst, .. }
            | FloatFromGpr { dst, .. }
            | FloatToGpr { dst, .. }
            | FloatFToF { dst, .. }
            | FCmp { dst, .. }
            | VSToF { dst, .. }
            | VFToInt { dst, .. }
            | VFToF { dst, .. }
            | VFToIRound { dst, .. }
            | GetRoundingMode { dst }
            | F80Bin { dst, .. }
            | F80Un { dst, .. }
            | F80Cmp { dst, .. }
            | F80Cvt { dst, .. }
            | F80CvtInt { dst, .. }
            | F80CvtTo { dst, .. }
            | F80CvtToInt { dst, .. }
            | F80BcdLoad { dst, .. }
            | F80BcdStore { dst, .. }
            | F80XtractExp { dst, .. }
            | F80XtractSig { dst, .. }
            | F64Bin { dst, .. }
            | F64Un { dst, .. }
            | Syscall { dst, .. }
            | GuestCpuid { dst, .. }
            | ValidateCode { dst, .. }
            | ProcessorId { dst }
            | CycleCounter { dst }
            | RdRand { dst }
            | ReadStackValue { dst, .. }
            | F80CmpStack { dst, .. }
            | F80CmpValue { dst, .. }
            | F80StackTest { dst, .. }
            | StackValidTag { dst, .. }
            | SyncStackToSlow { dst } => Some(dst),
            _ => None,
        }
    }

    pub fn meta(&self) -> OpMeta {
        let op = self.opcode();
        let has_dest = self.dst().is_some();
        let dest_class = match op {
            Opcode::VectorConst
            | Opcode::NamedVectorConst
            | Opcode::VBin
            | Opcode::VUn
            | Opcode::VShiftScalar
            | Opcode::VShiftImm
            | Opcode::VShiftInsert
            | Opcode::VInsElement
            | Opcode::VInsScalar
            | Opcode::VDupElement
            | Opcode::VExtr
            | Opcode::VTbl1
            | Opcode::VBsl
            | Opcode::VFcadd
            | Opcode::VBitcast
            | Opcode::VCastFromGpr
            | Opcode::FloatFromGpr
            | Opcode::FloatFToF
            | Opcode::VSToF
            | Opcode::VFToInt
            | Opcode::VFToF
            | Opcode::VFToIRound
            | Opcode::F80Bin
            | Opcode::F80Un
            | Opcode::F80Cvt
            | Opcode::F80CvtTo
            | Opcode::F80CvtToInt
            | Opcode::F80BcdLoad
            | Opcode::F80BcdStore
            | Opcode::F80XtractExp
            | Opcode::F80XtractSig
            | Opcode::F64Bin
            | Opcode::F64Un
            | Opcode::RdRand
            | Opcode::ReadStackValue => RegClass::Fpr,
            Opcode::LoadContext | Opcode::LoadContextIndexed | Opcode::LoadMem => {
                match self {
                    Instr::LoadContext { class, .. }
                    | Instr::LoadContextIndexed { class, .. }
                    | Instr::LoadMem { class, .. } => *class,
                    _ => RegClass::Gpr,
                }
            }
            _ => RegClass::Gpr,
        };
        let terminator = matches!(
            op,
            Opcode::Jump
                | Opcode::CondJump
                | Opcode::ExitFunction
                | Opcode::CallbackReturn
                | Opcode::SignalReturn
                | Opcode::Break
        );
        let side_effects = terminator
            || matches!(
                op,
                Opcode::StoreContext
                    | Opcode::StoreContextIndexed
                    | Opcode::StoreRegister
                    | Opcode::StoreMem
                    | Opcode::StoreMemPair
                    | Opcode::CacheLineClear
                    | Opcode::Cas
                    | Opcode::CasPair
                    | Opcode::AtomicOp
                    | Opcode::AtomicFetchOp
                    | Opcode::Fence
                    | Opcode::SetRoundingMode
                    | Opcode::F80LoadFcw
                    | Opcode::Syscall
                    | Opcode::Thunk
                    | Opcode::Print
            );
        let x87_stack = matches!(
            op,
            Opcode::PushStack
                | Opcode::PopStackDestroy
                | Opcode::CopyPushStack
                | Opcode::ReadStackValue
                | Opcode::StoreStackMem
                | Opcode::StoreStackToStack
                | Opcode::F80StackXchange
                | Opcode::F80CmpStack
                | Opcode::F80CmpValue
                | Opcode::F80StackTest
                | Opcode::F80VbslStack
                | Opcode::StackBin
                | Opcode::StackBinValue
                | Opcode::StackUn
                | Opcode::SinCosStack
                | Opcode::InitStack
                | Opcode::InvalidateStack
                | Opcode::StackValidTag
                | Opcode::SyncStackToSlow
                | Opcode::StackForceSlow
                | Opcode::IncStackTop
                | Opcode::DecStackTop
        );
        OpMeta {
            has_dest,
            dest_class,
            terminator,
            side_effects,
            x87_stack,
        }
    }

    pub fn is_terminator(&self) -> bool {
        self.meta().terminator
    }

    /// Visit every operand (GPR operands and FPR value refs alike).
    pub fn visit_operands(&self, mut f: impl FnMut(OperandRef<'_>)) {
        self.visit(&mut f);
    }

    fn visit(&self, f: &mut impl FnMut(OperandRef<'_>)) {
        use Instr::*;
        macro_rules! op {
            ($o:expr) => {
                f(OperandRef::Gpr($o))
            };
        }
        macro_rules! val {
            ($v:expr) => {
                f(OperandRef::Fpr($v))
            };
        }
        match self {
            Const { .. }
            | VectorConst { .. }
            | NamedVectorConst { .. }
            | EntrypointOffset { .. }
            | LoadContext { .. }
            | LoadRegister { .. }
            | GetRoundingMode { .. }
            | Jump { .. }
            | CallbackReturn
            | SignalReturn
            | Break { .. }
            | ValidateCode { .. }
            | ProcessorId { .. }
            | CycleCounter { .. }
            | RdRand { .. }
            | PopStackDestroy
            | CopyPushStack { .. }
            | ReadStackValue { .. }
            | StoreStackToStack { .. }
            | F80StackXchange { .. }
            | F80CmpStack { .. }
            | F80StackTest { .. }
            | StackBin { .. }
            | StackUn { .. }
            | SinCosStack
            | InitStack
            | InvalidateStack { .. }
            | StackValidTag { .. }
            | SyncStackToSlow { .. }
            | StackForceSlow
            | IncStackTop
            | DecStackTop => {}

            AluBin { lhs, rhs, .. }
            | MulWide { lhs, rhs, .. }
            | MulHigh { lhs, rhs, .. }
            | AddNzcv { lhs, rhs, .. }
            | SubNzcv { lhs, rhs, .. }
            | TestNz { lhs, rhs, .. }
            | Pdep {
                src: lhs,
                mask: rhs,
                ..
            }
            | Pext {
                src: lhs,
                mask: rhs,
                ..
            }
            | TruncElementPair { lo: lhs, hi: rhs, .. }
            | Bfi {
                base: lhs,
                insert: rhs,
                ..
            } => {
                op!(lhs);
                op!(rhs);
            }
            AluUn { src, .. }
            | Bfe { src, .. }
            | StoreRegister { value: src, .. }
            | StoreContext { value: src, .. }
            | SetRoundingMode { value: src }
            | F80LoadFcw { value: src }
            | ExitFunction { next_rip: src }
            | Thunk { arg: src, .. }
            | Print { value: src, .. }
            | CacheLineClear { addr: src } => op!(src),
            LongDivide {
                hi, lo, divisor, ..
            } => {
                op!(hi);
                op!(lo);
                op!(divisor);
            }
            Select {
                cmp1,
                cmp2,
                true_val,
                false_val,
                ..
            } => {
                op!(cmp1);
                op!(cmp2);
                op!(true_val);
                op!(false_val);
            }
            LoadContextIndexed { index, .. } => op!(index),
            StoreContextIndexed { index, value, .. } => {
                op!(index);
                op!(value);
            }
            LoadMem { addr, offset, .. } => {
                op!(addr);
                if let Some(index) = &offset.index {
                    op!(index);
                }
            }
            StoreMem {
                addr,
                offset,
                value,
                ..
            } => {
                op!(addr);
                if let Some(index) = &offset.index {
                    op!(index);
                }
                op!(value);
            }
            StoreMemPair {
                addr,
                value1,
                value2,
                ..
            } => {
                op!(addr);
                op!(value1);
                op!(value2);
            }
            Cas {
                expected,
                desired,
                addr,
                ..
            } => {
                op!(expected);
                op!(desired);
                op!(addr);
            }
            CasPair {
                expected_lo,
                expected_hi,
                desired_lo,
                desired_hi,
                addr,
                ..
            } => {
                op!(expected_lo);
                op!(expected_hi);
                op!(desired_lo);
                op!(desired_hi);
                op!(addr);
            }
            AtomicOp { addr, value, .. } | AtomicFetchOp { addr, value, .. } => {
                op!(addr);
                op!(value);
            }
            Fence { .. } => {}
            VBin { lhs, rhs, .. } | VFcadd { lhs, rhs, .. } => {
                val!(lhs);
                val!(rhs);
            }
            VUn { src, .. }
            | VBitcast { src, .. }
            | FloatToGpr { src, .. }
            | FloatFToF { src, .. }
            | VSToF { src, .. }
            | VFToInt { src, .. }
            | VFToF { src, .. }
            | VFToIRound { src, .. }
            | F80Un { src, .. }
            | F80Cvt { src, .. }
            | F80CvtInt { src, .. }
            | F80CvtTo { src, .. }
            | F80BcdLoad { src, .. }
            | F80BcdStore { src, .. }
            | F80XtractExp { src, .. }
            | F80XtractSig { src, .. }
            | F64Un { src, .. } => val!(src),
            VShiftScalar { vector, amount, .. } => {
                val!(vector);
                op!(amount);
            }
            VShiftImm { vector, .. } => val!(vector),
            VShiftInsert { base, vector, .. } => {
                val!(base);
                val!(vector);
            }
            VInsElement {
                dest_vec, src_vec, ..
            } => {
                val!(dest_vec);
                val!(src_vec);
            }
            VInsScalar {
                dest_vec, value, ..
            } => {
                val!(dest_vec);
                op!(value);
            }
            VExtractToGpr { vector, .. } | VDupElement { vector, .. } => val!(vector),
            VExtr { lower, upper, .. } => {
                val!(lower);
                val!(upper);
            }
            VTbl1 { table, indices, .. } => {
                val!(table);
                val!(indices);
            }
            VBsl {
                mask,
                true_vec,
                false_vec,
                ..
            } => {
                val!(mask);
                val!(true_vec);
                val!(false_vec);
            }
            VCastFromGpr { value, .. } | FloatFromGpr { src: value, .. } => op!(value),
            VPCmpEstrx {
                lhs,
                rhs,
                lhs_len,
                rhs_len,
                ..
            } => {
                val!(lhs);
                val!(rhs);
                op!(lhs_len);
                op!(rhs_len);
            }
            VPCmpIstrx { lhs, rhs, .. } => {
                val!(lhs);
                val!(rhs);
            }
            FCmp { lhs, rhs, .. } | F80Cmp { lhs, rhs, .. } | F80Bin { lhs, rhs, .. }
            | F64Bin { lhs, rhs, .. } => {
                val!(lhs);
                val!(rhs);
            }
            F80CvtToInt { src, .. } => op!(src),
            CondJump { cmp1, cmp2, .. } => {
                op!(cmp1);
                op!(cmp2);
            }
            Syscall { args, .. } => {
                for a in args {
                    op!(a);
                }
            }
            GuestCpuid { function, leaf, .. } => {
                op!(function);
                op!(leaf);
            }
            PushStack {
                value, original, ..
            } => {
                val!(value);
                val!(original);
            }
            StoreStackMem { addr, offset, .. } => {
                op!(addr);
                if let Some(index) = &offset.index {
                    op!(index);
                }
            }
            F80CmpValue { value, .. } => val!(value),
            F80VbslStack { mask, .. } => val!(mask),
            StackBinValue { value, .. } => val!(value),
        }
    }
}

impl Instr {
    /// Visit every operand mutably. Used by passes that rewrite value
    /// references while copying instructions into a new block.
    pub fn visit_operands_mut(&mut self, mut f: impl FnMut(OperandMut<'_>)) {
        use Instr::*;
        macro_rules! op {
            ($o:expr) => {
                f(OperandMut::Gpr($o))
            };
        }
        macro_rules! val {
            ($v:expr) => {
                f(OperandMut::Fpr($v))
            };
        }
        match self {
            Const { .. }
            | VectorConst { .. }
            | NamedVectorConst { .. }
            | EntrypointOffset { .. }
            | LoadContext { .. }
            | LoadRegister { .. }
            | GetRoundingMode { .. }
            | Jump { .. }
            | CallbackReturn
            | SignalReturn
            | Break { .. }
            | ValidateCode { .. }
            | ProcessorId { .. }
            | CycleCounter { .. }
            | RdRand { .. }
            | PopStackDestroy
            | CopyPushStack { .. }
            | ReadStackValue { .. }
            | StoreStackToStack { .. }
            | F80StackXchange { .. }
            | F80CmpStack { .. }
            | F80StackTest { .. }
            | StackBin { .. }
            | StackUn { .. }
            | SinCosStack
            | InitStack
            | InvalidateStack { .. }
            | StackValidTag { .. }
            | SyncStackToSlow { .. }
            | StackForceSlow
            | IncStackTop
            | DecStackTop => {}

            AluBin { lhs, rhs, .. }
            | MulWide { lhs, rhs, .. }
            | MulHigh { lhs, rhs, .. }
            | AddNzcv { lhs, rhs, .. }
            | SubNzcv { lhs, rhs, .. }
            | TestNz { lhs, rhs, .. }
            | Pdep {
                src: lhs,
                mask: rhs,
                ..
            }
            | Pext {
                src: lhs,
                mask: rhs,
                ..
            }
            | TruncElementPair { lo: lhs, hi: rhs, .. }
            | Bfi {
                base: lhs,
                insert: rhs,
                ..
            } => {
                op!(lhs);
                op!(rhs);
            }
            AluUn { src, .. }
            | Bfe { src, .. }
            | StoreRegister { value: src, .. }
            | StoreContext { value: src, .. }
            | SetRoundingMode { value: src }
            | F80LoadFcw { value: src }
            | ExitFunction { next_rip: src }
            | Thunk { arg: src, .. }
            | Print { value: src, .. }
            | CacheLineClear { addr: src } => op!(src),
            LongDivide {
                hi, lo, divisor, ..
            } => {
                op!(hi);
                op!(lo);
                op!(divisor);
            }
            Select {
                cmp1,
                cmp2,
                true_val,
                false_val,
                ..
            } => {
                op!(cmp1);
                op!(cmp2);
                op!(true_val);
                op!(false_val);
            }
            LoadContextIndexed { index, .. } => op!(index),
            StoreContextIndexed { index, value, .. } => {
                op!(index);
                op!(value);
            }
            LoadMem { addr, offset, .. } => {
                op!(addr);
                if let Some(index) = &mut offset.index {
                    op!(index);
                }
            }
            StoreMem {
                addr,
                offset,
                value,
                ..
            } => {
                op!(addr);
                if let Some(index) = &mut offset.index {
                    op!(index);
                }
                op!(value);
            }
            StoreMemPair {
                addr,
                value1,
                value2,
                ..
            } => {
                op!(addr);
                op!(value1);
                op!(value2);
            }
            Cas {
                expected,
                desired,
                addr,
                ..
            } => {
                op!(expected);
                op!(desired);
                op!(addr);
            }
            CasPair {
                expected_lo,
                expected_hi,
                desired_lo,
                desired_hi,
                addr,
                ..
            } => {
                op!(expected_lo);
                op!(expected_hi);
                op!(desired_lo);
                op!(desired_hi);
                op!(addr);
            }
            AtomicOp { addr, value, .. } | AtomicFetchOp { addr, value, .. } => {
                op!(addr);
                op!(value);
            }
            Fence { .. } => {}
            VBin { lhs, rhs, .. } | VFcadd { lhs, rhs, .. } => {
                val!(lhs);
                val!(rhs);
            }
            VUn { src, .. }
            | VBitcast { src, .. }
            | FloatToGpr { src, .. }
            | FloatFToF { src, .. }
            | VSToF { src, .. }
            | VFToInt { src, .. }
            | VFToF { src, .. }
            | VFToIRound { src, .. }
            | F80Un { src, .. }
            | F80Cvt { src, .. }
            | F80CvtInt { src, .. }
            | F80CvtTo { src, .. }
            | F80BcdLoad { src, .. }
            | F80BcdStore { src, .. }
            | F80XtractExp { src, .. }
            | F80XtractSig { src, .. }
            | F64Un { src, .. } => val!(src),
            VShiftScalar { vector, amount, .. } => {
                val!(vector);
                op!(amount);
            }
            VShiftImm { vector, .. } => val!(vector),
            VShiftInsert { base, vector, .. } => {
                val!(base);
                val!(vector);
            }
            VInsElement {
                dest_vec, src_vec, ..
            } => {
                val!(dest_vec);
                val!(src_vec);
            }
            VInsScalar {
                dest_vec, value, ..
            } => {
                val!(dest_vec);
                op!(value);
            }
            VExtractToGpr { vector, .. } | VDupElement { vector, .. } => val!(vector),
            VExtr { lower, upper, .. } => {
                val!(lower);
                val!(upper);
            }
            VTbl1 { table, indices, .. } => {
                val!(table);
                val!(indices);
            }
            VBsl {
                mask,
                true_vec,
                false_vec,
                ..
            } => {
                val!(mask);
                val!(true_vec);
                val!(false_vec);
            }
            VCastFromGpr { value, .. } | FloatFromGpr { src: value, .. } => op!(value),
            VPCmpEstrx {
                lhs,
                rhs,
                lhs_len,
                rhs_len,
                ..
            } => {
                val!(lhs);
                val!(rhs);
                op!(lhs_len);
                op!(rhs_len);
            }
            VPCmpIstrx { lhs, rhs, .. } => {
                val!(lhs);
                val!(rhs);
            }
            FCmp { lhs, rhs, .. } | F80Cmp { lhs, rhs, .. } | F80Bin { lhs, rhs, .. }
            | F64Bin { lhs, rhs, .. } => {
                val!(lhs);
                val!(rhs);
            }
            F80CvtToInt { src, .. } => op!(src),
            CondJump { cmp1, cmp2, .. } => {
                op!(cmp1);
                op!(cmp2);
            }
            Syscall { args, .. } => {
                for a in args {
                    op!(a);
                }
            }
            GuestCpuid { function, leaf, .. } => {
                op!(function);
                op!(leaf);
            }
            PushStack {
                value, original, ..
            } => {
                val!(value);
                val!(original);
            }
            StoreStackMem { addr, offset, .. } => {
                op!(addr);
                if let Some(index) = &mut offset.index {
                    op!(index);
                }
            }
            F80CmpValue { value, .. } => val!(value),
            F80VbslStack { mask, .. } => val!(mask),
            StackBinValue { value, .. } => val!(value),
        }
    }
}

/// A mutably borrowed operand, tagged with its register class.
#[derive(Debug)]
pub enum OperandMut<'a> {
    Gpr(&'a mut Operand),
    Fpr(&'a mut ValueId),
}

/// A borrowed operand, tagged with its register class.
#[derive(Debug, Clone, Copy)]
pub enum OperandRef<'a> {
    Gpr(&'a Operand),
    Fpr(&'a ValueId),
}

impl OperandRef<'_> {
    /// The referenced SSA value, if the operand is not an inline constant.
    pub fn value(&self) -> Option<ValueId> {
        match self {
            OperandRef::Gpr(Operand::Value(v)) => Some(*v),
            OperandRef::Gpr(Operand::Const(_)) => None,
            OperandRef::Fpr(v) => Some(**v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrip() {
        for i in 0..Opcode::COUNT as u16 {
            let op = Opcode::from_u16(i).unwrap();
            assert_eq!(op as u16, i);
        }
        assert_eq!(Opcode::from_u16(Opcode::COUNT as u16), None);
    }

    #[test]
    fn meta_classifies_terminators() {
        let j = Instr::Jump {
            target: BlockId(0),
        };
        assert!(j.is_terminator());
        assert!(j.meta().side_effects);

        let c = Instr::Const {
            dst: ValueId(0),
            value: 1,
        };
        assert!(!c.is_terminator());
        assert!(!c.meta().side_effects);
        assert!(c.meta().has_dest);
    }

    #[test]
    fn stack_family_is_marked() {
        assert!(Instr::PopStackDestroy.meta().x87_stack);
        assert!(Instr::StackUn { op: StackUnOp::Sqrt }.meta().x87_stack);
        assert!(!Instr::Fence {
            kind: oxbow_types::FenceKind::Load
        }
        .meta()
        .x87_stack);
    }

    #[test]
    fn visit_operands_covers_memory_index() {
        let instr = Instr::StoreMem {
            size: OpSize::B32,
            class: RegClass::Gpr,
            addr: Operand::Value(ValueId(1)),
            offset: MemOffset {
                index: Some(Operand::Value(ValueId(2))),
                ty: MemOffsetType::Sxtx,
                scale: 4,
            },
            value: Operand::Value(ValueId(3)),
            tso: false,
        };
        let mut seen = Vec::new();
        instr.visit_operands(|o| {
            if let Some(v) = o.value() {
                seen.push(v.0);
            }
        });
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
