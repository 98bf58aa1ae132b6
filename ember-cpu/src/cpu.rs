use crate::mem::GuestMemory;
use crate::regs::Regs;

/// Number of scratch slots the code generator may spill native registers to
/// while a block runs.
pub const NUM_SPILL_SLOTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExceptionCode {
    None = 0,
    Syscall,
    Break,
    ReadFault,
    WriteFault,
    InvalidInstruction,
}

impl ExceptionCode {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Syscall,
            2 => Self::Break,
            3 => Self::ReadFault,
            4 => Self::WriteFault,
            5 => Self::InvalidInstruction,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Exception {
    pub code: u32,
    pub value: u64,
}

impl Exception {
    #[inline]
    pub fn new(code: ExceptionCode, value: u64) -> Self {
        Self { code: code as u32, value }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        self.code == ExceptionCode::None as u32
    }

    #[inline]
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// The guest CPU state shared between the dispatcher, generated code and the
/// interpreter fallback.
pub struct Cpu {
    pub regs: Regs,

    /// Remaining cycle budget. Generated code never runs a block entry while
    /// this is non-positive; the scheduler's time-advance callback refills it.
    pub downcount: i64,

    /// Total guest instructions retired, for profiling.
    pub icount: u64,

    pub exception: Exception,

    /// Spill area for the register allocator. Only generated code touches
    /// this; it holds no architectural state across block exits.
    pub spill: [u32; NUM_SPILL_SLOTS],

    pub mem: GuestMemory,
}

impl Cpu {
    pub fn new(mem: GuestMemory) -> Box<Self> {
        Box::new(Self {
            regs: Regs::new(),
            downcount: 0,
            icount: 0,
            exception: Exception::default(),
            spill: [0; NUM_SPILL_SLOTS],
            mem,
        })
    }

    #[inline]
    pub fn read_pc(&self) -> u32 {
        self.regs.pc
    }

    #[inline]
    pub fn write_pc(&mut self, pc: u32) {
        self.regs.pc = pc;
    }

    /// Raw byte view of the register file, used by backends that address
    /// guest state by offset.
    #[inline]
    pub fn state_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(&self.regs)
    }

    #[inline]
    pub fn state_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::bytes_of_mut(&mut self.regs)
    }

    #[inline]
    pub fn read_state_u32(&self, offset: u16) -> u32 {
        let offset = offset as usize;
        u32::from_le_bytes(self.state_bytes()[offset..offset + 4].try_into().unwrap())
    }

    #[inline]
    pub fn write_state_u32(&mut self, offset: u16, value: u32) {
        let offset = offset as usize;
        self.state_bytes_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}
