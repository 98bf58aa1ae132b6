//! Compiles one block's IR stream into the arena.
//!
//! Instructions are processed in guest program order. Each one records its
//! native offset, then dispatches on opcode category to a handler that
//! either emits specialized code through the register allocator or falls
//! back to an interpreter call. All registers are flushed before every
//! block exit and before any call into non-translated code.

mod mem;
mod ops;

use ember_cpu::lifter::LiftedBlock;
use ember_cpu::{IrInst, IrOp, OpCategory, VReg};

use crate::arena::{ArenaWriter, CodeError, PatchSite};
use crate::backend::{Backend, IntOp};
use crate::regalloc::{MapIntent, RegAlloc};

/// An outbound exit whose target block was unknown at compile time.
#[derive(Debug, Clone, Copy)]
pub struct PendingExit {
    pub site: PatchSite,
    pub target: u32,
}

/// What the compiler produced for one block.
#[derive(Debug, Clone)]
pub struct CompiledCode {
    /// The budget-checking entry (block start; links target this).
    pub checked_offset: u32,
    /// The entry that skips the budget check.
    pub entry_offset: u32,
    pub code_len: u32,
    /// Native offset of each IR instruction, for invalidation, profiling
    /// and fault reporting.
    pub inst_offsets: Vec<u32>,
    pub exits: Vec<PendingExit>,
    /// The entry slot, patchable into a re-compile trampoline.
    pub entry_site: PatchSite,
}

pub(crate) struct Ctx<'a, 'w, 'arena> {
    pub backend: &'a dyn Backend,
    pub rc: RegAlloc<'a>,
    pub w: &'w mut ArenaWriter<'arena>,
    pub exits: Vec<PendingExit>,
}

/// Compiles `block` at the current write cursor.
///
/// On `CodeSpaceExhausted` the caller owns rolling the cursor back; nothing
/// the compiler wrote is reachable until the block is published in the
/// store.
pub fn compile_block(
    backend: &dyn Backend,
    w: &mut ArenaWriter,
    block: &LiftedBlock,
    always_flush_regs: bool,
) -> Result<CompiledCode, CodeError> {
    let mut rc = RegAlloc::new(backend);
    rc.start_block(block.start);

    let checked_offset = w.offset();
    backend.emit_budget_check(w, block.start, block.cost())?;
    let entry_site = w.register_patch_site(checked_offset, backend.op_bytes());
    let entry_offset = w.offset();

    let mut ctx = Ctx { backend, rc, w, exits: Vec::new() };
    let mut inst_offsets = Vec::with_capacity(block.insts.len());

    for (index, inst) in block.insts.iter().enumerate() {
        inst_offsets.push(ctx.w.offset() as u32);
        ctx.rc.set_ir_index(index as u32);

        let Some(op) = inst.opcode() else {
            // The producer validated the stream; an undecodable opcode here
            // means the build is broken, not the guest.
            panic!(
                "unhandled IR opcode {:#04x} compiling block at {:#010x}",
                inst.op, block.start
            );
        };
        tracing::trace!("[{index:03}] {op:?} {inst:x?}");

        match op.category() {
            OpCategory::Arith => ctx.compile_arith(op, inst)?,
            OpCategory::Compare => ctx.compile_compare(op, inst)?,
            OpCategory::LoadStore => ctx.compile_mem(op, inst)?,
            OpCategory::Float => ctx.compile_float(op, inst)?,
            OpCategory::System if op == IrOp::Downcount => {
                ctx.backend.emit_downcount(ctx.w, inst.imm)?;
            }
            OpCategory::Vector | OpCategory::System => ctx.compile_generic(op, inst)?,
            OpCategory::Exit => ctx.compile_exit(op, inst)?,
        }

        ctx.rc.assert_no_locks();
        if always_flush_regs {
            ctx.rc.flush_all(ctx.w)?;
        }
    }

    // The producer normally terminates every block; cover a fallthrough end
    // with a generic exit that re-checks runtime state.
    let terminated = block.insts.last().and_then(|i| i.opcode()).is_some_and(|o| o.ends_block());
    if !terminated {
        ctx.rc.flush_all(ctx.w)?;
        ctx.backend.emit_exit_to_pc(ctx.w)?;
    }

    let code_len = (ctx.w.offset() - checked_offset) as u32;
    Ok(CompiledCode {
        checked_offset: checked_offset as u32,
        entry_offset: entry_offset as u32,
        code_len,
        inst_offsets,
        exits: ctx.exits,
        entry_site,
    })
}

impl Ctx<'_, '_, '_> {
    /// The generic fallback: flush every register, then hand the raw
    /// instruction to the interpreter entry point. Opcodes that can end the
    /// block leave generated code when the interpreter reports a
    /// control-flow change.
    pub(crate) fn compile_generic(&mut self, op: IrOp, inst: &IrInst) -> Result<(), CodeError> {
        self.rc.flush_all(self.w)?;
        self.backend.emit_interp_call(self.w, inst.encode(), op.can_exit())?;
        if op.ends_block() {
            // Not reachable unless the interpreter declined the exit; keeps
            // execution from running off the end of the block either way.
            self.backend.emit_exit_to_pc(self.w)?;
        }
        Ok(())
    }

    fn compile_exit(&mut self, op: IrOp, inst: &IrInst) -> Result<(), CodeError> {
        match op {
            IrOp::ExitToConst => {
                self.rc.flush_all(self.w)?;
                let site = self.backend.emit_exit_to_const(self.w, inst.imm)?;
                self.exits.push(PendingExit { site, target: inst.imm });
            }
            IrOp::ExitToReg => {
                let reg = self.rc.map(self.w, VReg::gpr(inst.src1), MapIntent::ReadOnly)?;
                self.backend.emit_set_pc(self.w, reg)?;
                self.rc.flush_all(self.w)?;
                self.backend.emit_exit_to_pc(self.w)?;
            }
            IrOp::ExitToPC => {
                self.rc.flush_all(self.w)?;
                self.backend.emit_exit_to_pc(self.w)?;
            }
            IrOp::ExitIfEq | IrOp::ExitIfNeq => {
                let scratch = self.backend.scratch_reg(ember_cpu::RegClass::Int);
                let a = self.rc.map(self.w, VReg::gpr(inst.src1), MapIntent::ReadOnly)?;
                self.rc.lock(VReg::gpr(inst.src1));
                let b = self.rc.map(self.w, VReg::gpr(inst.src2), MapIntent::ReadOnly)?;
                self.backend.emit_int_op(self.w, IntOp::Xor, scratch, a, b)?;
                self.rc.release(VReg::gpr(inst.src1));

                self.rc.flush_all(self.w)?;
                let skip = match op {
                    // Exit taken when equal, i.e. when the xor is zero.
                    IrOp::ExitIfEq => self.backend.emit_branch_if_nonzero(self.w, scratch)?,
                    _ => self.backend.emit_branch_if_zero(self.w, scratch)?,
                };
                let site = self.backend.emit_exit_to_const(self.w, inst.imm)?;
                self.exits.push(PendingExit { site, target: inst.imm });
                self.backend.bind_branch(self.w, skip);
            }
            IrOp::ExitIfLtZ | IrOp::ExitIfGeZ => {
                let scratch = self.backend.scratch_reg(ember_cpu::RegClass::Int);
                let a = self.rc.map(self.w, VReg::gpr(inst.src1), MapIntent::ReadOnly)?;
                self.backend.emit_int_op_imm(self.w, IntOp::Slt, scratch, a, 0)?;

                self.rc.flush_all(self.w)?;
                let skip = match op {
                    // Exit taken when negative, i.e. when the compare is 1.
                    IrOp::ExitIfLtZ => self.backend.emit_branch_if_zero(self.w, scratch)?,
                    _ => self.backend.emit_branch_if_nonzero(self.w, scratch)?,
                };
                let site = self.backend.emit_exit_to_const(self.w, inst.imm)?;
                self.exits.push(PendingExit { site, target: inst.imm });
                self.backend.bind_branch(self.w, skip);
            }
            _ => unreachable!("{op:?} is not an exit"),
        }
        Ok(())
    }
}
