//! Producing IR blocks from guest memory.
//!
//! The real front end (instruction decoder, delay-slot handling, IR
//! simplification passes) lives upstream. The engine only depends on
//! [BlockLifter]: hand me the ordered IR sequence for the block starting at
//! a guest address.

use crate::ir::{IrInst, IrOp, OpCategory};
use crate::mem::GuestMemory;
use crate::regs::{NUM_FPRS, NUM_GPRS};

pub const GUEST_INST_BYTES: u32 = 8;

/// Hard cap on block length, matching the front end's own limit.
pub const MAX_BLOCK_INSTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiftError {
    /// The address is outside mapped guest memory.
    BadAddress(u32),
    /// The word at the given address does not decode to a known opcode.
    InvalidOpcode { addr: u32, op: u8 },
    /// No block-ending instruction within [MAX_BLOCK_INSTS].
    Unterminated(u32),
}

impl std::fmt::Display for LiftError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiftError::BadAddress(addr) => write!(f, "no guest memory at {addr:#010x}"),
            LiftError::InvalidOpcode { addr, op } => {
                write!(f, "invalid opcode {op:#04x} at {addr:#010x}")
            }
            LiftError::Unterminated(addr) => {
                write!(f, "block at {addr:#010x} has no exit within {MAX_BLOCK_INSTS} instructions")
            }
        }
    }
}

impl std::error::Error for LiftError {}

/// One lifted block, in guest program order.
#[derive(Debug, Clone, PartialEq)]
pub struct LiftedBlock {
    pub start: u32,
    pub insts: Vec<IrInst>,
}

impl LiftedBlock {
    /// Length of the guest range this block was lifted from, in bytes.
    pub fn guest_len(&self) -> u32 {
        self.insts.len() as u32 * GUEST_INST_BYTES
    }

    /// Number of budget units the block consumes per execution.
    pub fn cost(&self) -> u32 {
        self.insts.len() as u32
    }
}

pub trait BlockLifter {
    fn lift(&mut self, mem: &GuestMemory, addr: u32) -> Result<LiftedBlock, LiftError>;
}

/// Lifter for images whose instruction words are already IR-encoded.
///
/// Used by tests and the IR dump tooling; a real front end decodes the
/// guest ISA instead.
#[derive(Default)]
pub struct RawIrLifter;

impl RawIrLifter {
    fn validate(inst: &IrInst, addr: u32) -> Result<IrOp, LiftError> {
        let Some(op) = inst.opcode() else {
            return Err(LiftError::InvalidOpcode { addr, op: inst.op });
        };
        // Operand fields are register numbers within the opcode's bank, so
        // the compiler can trust them. Exit targets and immediates are
        // unconstrained.
        let operands = [inst.dest, inst.src1, inst.src2];
        let (reg_fields, limit): (&[u8], usize) = match op.category() {
            OpCategory::System => (&[], NUM_GPRS),
            OpCategory::Exit => (&operands[1..], NUM_GPRS),
            // Vector ops touch four consecutive lanes starting at each index.
            OpCategory::Vector => (&operands, NUM_FPRS - 3),
            OpCategory::Float => (&operands, NUM_FPRS),
            _ => (&operands, NUM_GPRS),
        };
        if reg_fields.iter().any(|&r| r as usize >= limit) {
            return Err(LiftError::InvalidOpcode { addr, op: inst.op });
        }
        Ok(op)
    }
}

impl BlockLifter for RawIrLifter {
    fn lift(&mut self, mem: &GuestMemory, addr: u32) -> Result<LiftedBlock, LiftError> {
        if !mem.contains(addr, GUEST_INST_BYTES as usize) {
            return Err(LiftError::BadAddress(addr));
        }

        let mut insts = Vec::new();
        let mut cursor = addr;
        loop {
            let raw = mem.read_u64(cursor).map_err(|f| LiftError::BadAddress(f.addr))?;
            let inst = IrInst::decode(raw);
            let op = Self::validate(&inst, cursor)?;
            insts.push(inst);

            if op.ends_block() {
                break;
            }
            if insts.len() >= MAX_BLOCK_INSTS {
                return Err(LiftError::Unterminated(addr));
            }
            cursor = cursor.wrapping_add(GUEST_INST_BYTES);
        }

        tracing::trace!("lifted {} instructions at {addr:#010x}", insts.len());
        Ok(LiftedBlock { start: addr, insts })
    }
}
