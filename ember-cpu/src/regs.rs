use bytemuck::{Pod, Zeroable};
use memoffset::offset_of;

pub const NUM_GPRS: usize = 32;
pub const NUM_FPRS: usize = 32;

/// Total number of virtual registers the IR can name (GPRs followed by FPRs).
pub const TOTAL_VREGS: usize = NUM_GPRS + NUM_FPRS;

/// The architectural register file of the guest CPU.
///
/// The layout is fixed (`repr(C)`, no padding) because generated code
/// addresses individual registers by their byte offset within this struct.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Regs {
    pub gpr: [u32; NUM_GPRS],
    pub fpr: [f32; NUM_FPRS],
    pub pc: u32,
}

impl Regs {
    pub fn new() -> Self {
        Zeroable::zeroed()
    }
}

impl Default for Regs {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies one slot of architectural guest state for the duration of a
/// block's compilation. `0..32` are the integer registers, `32..64` the
/// floating point registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VReg(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegClass {
    Int,
    Float,
}

impl VReg {
    #[inline]
    pub fn gpr(index: u8) -> Self {
        debug_assert!((index as usize) < NUM_GPRS);
        VReg(index)
    }

    #[inline]
    pub fn fpr(index: u8) -> Self {
        debug_assert!((index as usize) < NUM_FPRS);
        VReg(NUM_GPRS as u8 + index)
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        (self.0 as usize) < TOTAL_VREGS
    }

    #[inline]
    pub fn class(self) -> RegClass {
        if (self.0 as usize) < NUM_GPRS { RegClass::Int } else { RegClass::Float }
    }

    /// Byte offset of this register's canonical slot within [Regs].
    ///
    /// This mapping must be pure and branch-free on the class split so
    /// backends can bake offsets into generated code.
    #[inline]
    pub fn state_offset(self) -> u16 {
        let idx = self.0 as usize;
        let (base, lane) = match self.class() {
            RegClass::Int => (offset_of!(Regs, gpr), idx),
            RegClass::Float => (offset_of!(Regs, fpr), idx - NUM_GPRS),
        };
        (base + lane * 4) as u16
    }
}

/// Byte offset of the program counter within [Regs].
#[inline]
pub fn pc_offset() -> u16 {
    offset_of!(Regs, pc) as u16
}

impl std::fmt::Display for VReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.class() {
            RegClass::Int => write!(f, "r{}", self.0),
            RegClass::Float => write!(f, "f{}", self.0 as usize - NUM_GPRS),
        }
    }
}
