//! The architecture-neutral instruction form handed to the block compiler.
//!
//! Each instruction is 8 bytes on the wire: a 1-byte opcode, an 8-bit
//! destination, two 8-bit source operands and a 32-bit constant. The block
//! compiler only depends on this shape; producing the sequence is the front
//! end's job.

use bytemuck::{Pod, Zeroable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct IrInst {
    pub op: u8,
    pub dest: u8,
    pub src1: u8,
    pub src2: u8,
    pub imm: u32,
}

impl IrInst {
    pub fn new(op: IrOp, dest: u8, src1: u8, src2: u8, imm: u32) -> Self {
        Self { op: op as u8, dest, src1, src2, imm }
    }

    #[inline]
    pub fn opcode(&self) -> Option<IrOp> {
        IrOp::from_u8(self.op)
    }

    /// The raw 64-bit form passed to the interpreter fallback as an immediate.
    #[inline]
    pub fn encode(&self) -> u64 {
        bytemuck::cast(*self)
    }

    #[inline]
    pub fn decode(raw: u64) -> Self {
        bytemuck::cast(raw)
    }
}

macro_rules! ir_ops {
    ($($name:ident = $value:literal => $category:ident),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum IrOp {
            $($name = $value),+
        }

        impl IrOp {
            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($value => Some(Self::$name),)+
                    _ => None,
                }
            }

            pub fn category(self) -> OpCategory {
                match self {
                    $(Self::$name => OpCategory::$category),+
                }
            }
        }
    };
}

ir_ops! {
    // Integer arithmetic. `*Imm` forms use the constant field as the second
    // operand; shifts mask the amount to 5 bits.
    Mov      = 0x01 => Arith,
    SetConst = 0x02 => Arith,
    Add      = 0x03 => Arith,
    Sub      = 0x04 => Arith,
    And      = 0x05 => Arith,
    Or       = 0x06 => Arith,
    Xor      = 0x07 => Arith,
    Mul      = 0x08 => Arith,
    Shl      = 0x09 => Arith,
    Shr      = 0x0a => Arith,
    Sar      = 0x0b => Arith,
    AddImm   = 0x0c => Arith,
    AndImm   = 0x0d => Arith,
    OrImm    = 0x0e => Arith,
    XorImm   = 0x0f => Arith,
    ShlImm   = 0x10 => Arith,
    ShrImm   = 0x11 => Arith,
    SarImm   = 0x12 => Arith,

    // Comparisons produce 0/1 in an integer register.
    Slt      = 0x20 => Compare,
    SltU     = 0x21 => Compare,
    SltImm   = 0x22 => Compare,
    SltUImm  = 0x23 => Compare,

    // Memory. Effective address is `gpr[src1] + imm`. Loads zero-extend.
    Load8    = 0x30 => LoadStore,
    Load16   = 0x31 => LoadStore,
    Load32   = 0x32 => LoadStore,
    Store8   = 0x33 => LoadStore,
    Store16  = 0x34 => LoadStore,
    Store32  = 0x35 => LoadStore,

    // Single precision float. Sources and destination name FPR slots
    // except the compares, whose destination is a GPR.
    FMov     = 0x40 => Float,
    FAdd     = 0x41 => Float,
    FSub     = 0x42 => Float,
    FMul     = 0x43 => Float,
    FDiv     = 0x44 => Float,
    FNeg     = 0x45 => Float,
    FAbs     = 0x46 => Float,
    FSqrt    = 0x47 => Float,
    FCmpEq   = 0x48 => Float,
    FCmpLt   = 0x49 => Float,

    // 4-lane vector helpers over consecutive FPR slots. Rare enough that
    // backends are not expected to specialize them.
    Vec4Mov  = 0x50 => Vector,
    Vec4Add  = 0x51 => Vector,
    Vec4Mul  = 0x52 => Vector,
    Vec4Dot  = 0x53 => Vector,

    // System.
    Downcount = 0x60 => System,
    Syscall   = 0x61 => System,
    Break     = 0x62 => System,

    // Block exits. `imm` is the target guest address for the constant
    // forms; the conditional forms fall through into the rest of the block
    // when the condition does not hold.
    ExitToConst = 0x70 => Exit,
    ExitToReg   = 0x71 => Exit,
    ExitToPC    = 0x72 => Exit,
    ExitIfEq    = 0x73 => Exit,
    ExitIfNeq   = 0x74 => Exit,
    ExitIfLtZ   = 0x75 => Exit,
    ExitIfGeZ   = 0x76 => Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCategory {
    Arith,
    Compare,
    LoadStore,
    Float,
    Vector,
    System,
    Exit,
}

impl IrOp {
    /// Whether this instruction always ends the block it appears in.
    pub fn ends_block(self) -> bool {
        matches!(
            self,
            IrOp::ExitToConst | IrOp::ExitToReg | IrOp::ExitToPC | IrOp::Syscall | IrOp::Break
        )
    }

    /// Whether executing this op in the interpreter may report a block exit.
    pub fn can_exit(self) -> bool {
        self.ends_block() || matches!(self.category(), OpCategory::Exit)
    }
}
