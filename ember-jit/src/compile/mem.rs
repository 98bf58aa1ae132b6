//! Guest memory access emission.
//!
//! Every access the compiler emits is bounds-checked by the backend and
//! reported against the IR instruction's recorded native offset, which the
//! engine maps back to a guest address for fault reporting.

use ember_cpu::{IrInst, IrOp, VReg};

use crate::arena::CodeError;
use crate::backend::MemWidth;
use crate::compile::Ctx;
use crate::regalloc::MapIntent;

fn width(op: IrOp) -> MemWidth {
    match op {
        IrOp::Load8 | IrOp::Store8 => MemWidth::U8,
        IrOp::Load16 | IrOp::Store16 => MemWidth::U16,
        IrOp::Load32 | IrOp::Store32 => MemWidth::U32,
        _ => unreachable!("{op:?} is not a memory access"),
    }
}

impl Ctx<'_, '_, '_> {
    pub(crate) fn compile_mem(&mut self, op: IrOp, inst: &IrInst) -> Result<(), CodeError> {
        match op {
            IrOp::Load8 | IrOp::Load16 | IrOp::Load32 => {
                let (dest, base) = (VReg::gpr(inst.dest), VReg::gpr(inst.src1));
                let addr = self.rc.map(self.w, base, MapIntent::ReadOnly)?;
                self.rc.lock(base);
                // Narrow loads zero-extend, so the old value never survives.
                let d = self.rc.map(self.w, dest, MapIntent::InitNoLoad)?;
                self.rc.release(base);
                self.backend.emit_load_mem(self.w, width(op), d, addr, inst.imm)
            }
            IrOp::Store8 | IrOp::Store16 | IrOp::Store32 => {
                let (value, base) = (VReg::gpr(inst.dest), VReg::gpr(inst.src1));
                let v = self.rc.map(self.w, value, MapIntent::ReadOnly)?;
                self.rc.lock(value);
                let addr = self.rc.map(self.w, base, MapIntent::ReadOnly)?;
                self.rc.release(value);
                self.backend.emit_store_mem(self.w, width(op), v, addr, inst.imm)
            }
            _ => unreachable!("{op:?} is not a memory access"),
        }
    }
}
