//! Category handlers for integer, compare and float IR instructions.

use ember_cpu::{IrInst, IrOp, VReg};

use crate::arena::CodeError;
use crate::backend::{FloatOp, IntOp};
use crate::compile::Ctx;
use crate::regalloc::MapIntent;

fn int_op(op: IrOp) -> IntOp {
    match op {
        IrOp::Add | IrOp::AddImm => IntOp::Add,
        IrOp::Sub => IntOp::Sub,
        IrOp::And | IrOp::AndImm => IntOp::And,
        IrOp::Or | IrOp::OrImm => IntOp::Or,
        IrOp::Xor | IrOp::XorImm => IntOp::Xor,
        IrOp::Mul => IntOp::Mul,
        IrOp::Shl | IrOp::ShlImm => IntOp::Shl,
        IrOp::Shr | IrOp::ShrImm => IntOp::Shr,
        IrOp::Sar | IrOp::SarImm => IntOp::Sar,
        IrOp::Slt | IrOp::SltImm => IntOp::Slt,
        IrOp::SltU | IrOp::SltUImm => IntOp::SltU,
        _ => unreachable!("{op:?} has no integer form"),
    }
}

fn float_op(op: IrOp) -> FloatOp {
    match op {
        IrOp::FAdd => FloatOp::Add,
        IrOp::FSub => FloatOp::Sub,
        IrOp::FMul => FloatOp::Mul,
        IrOp::FDiv => FloatOp::Div,
        IrOp::FNeg => FloatOp::Neg,
        IrOp::FAbs => FloatOp::Abs,
        IrOp::FSqrt => FloatOp::Sqrt,
        IrOp::FCmpEq => FloatOp::CmpEq,
        IrOp::FCmpLt => FloatOp::CmpLt,
        _ => unreachable!("{op:?} has no float form"),
    }
}

impl Ctx<'_, '_, '_> {
    /// Destination intent: a full overwrite needs no fill, but an in-place
    /// update of a source operand must keep the loaded value.
    fn dest_intent(dest: VReg, sources: &[VReg]) -> MapIntent {
        if sources.contains(&dest) { MapIntent::ReadWrite } else { MapIntent::InitNoLoad }
    }

    /// dest = a `op` b, all integer registers.
    fn three_reg(&mut self, op: IntOp, inst: &IrInst) -> Result<(), CodeError> {
        let (dest, src1, src2) =
            (VReg::gpr(inst.dest), VReg::gpr(inst.src1), VReg::gpr(inst.src2));
        let a = self.rc.map(self.w, src1, MapIntent::ReadOnly)?;
        self.rc.lock(src1);
        let b = self.rc.map(self.w, src2, MapIntent::ReadOnly)?;
        self.rc.lock(src2);
        let d = self.rc.map(self.w, dest, Self::dest_intent(dest, &[src1, src2]))?;
        self.rc.release(src2);
        self.rc.release(src1);
        self.backend.emit_int_op(self.w, op, d, a, b)
    }

    /// dest = a `op` imm.
    fn two_reg_imm(&mut self, op: IntOp, inst: &IrInst) -> Result<(), CodeError> {
        let (dest, src1) = (VReg::gpr(inst.dest), VReg::gpr(inst.src1));
        let a = self.rc.map(self.w, src1, MapIntent::ReadOnly)?;
        self.rc.lock(src1);
        let d = self.rc.map(self.w, dest, Self::dest_intent(dest, &[src1]))?;
        self.rc.release(src1);
        self.backend.emit_int_op_imm(self.w, op, d, a, inst.imm)
    }

    pub(crate) fn compile_arith(&mut self, op: IrOp, inst: &IrInst) -> Result<(), CodeError> {
        match op {
            IrOp::Mov => {
                let (dest, src) = (VReg::gpr(inst.dest), VReg::gpr(inst.src1));
                if dest == src {
                    return Ok(());
                }
                let s = self.rc.map(self.w, src, MapIntent::ReadOnly)?;
                self.rc.lock(src);
                let d = self.rc.map(self.w, dest, MapIntent::InitNoLoad)?;
                self.rc.release(src);
                self.backend.emit_move(self.w, d, s)
            }
            IrOp::SetConst => {
                let d = self.rc.map(self.w, VReg::gpr(inst.dest), MapIntent::InitNoLoad)?;
                self.backend.emit_load_imm(self.w, d, inst.imm)
            }
            IrOp::Add | IrOp::Sub | IrOp::And | IrOp::Or | IrOp::Xor | IrOp::Mul | IrOp::Shl
            | IrOp::Shr | IrOp::Sar => self.three_reg(int_op(op), inst),
            IrOp::AddImm | IrOp::AndImm | IrOp::OrImm | IrOp::XorImm | IrOp::ShlImm
            | IrOp::ShrImm | IrOp::SarImm => self.two_reg_imm(int_op(op), inst),
            _ => unreachable!("{op:?} is not arithmetic"),
        }
    }

    pub(crate) fn compile_compare(&mut self, op: IrOp, inst: &IrInst) -> Result<(), CodeError> {
        match op {
            IrOp::Slt | IrOp::SltU => self.three_reg(int_op(op), inst),
            IrOp::SltImm | IrOp::SltUImm => self.two_reg_imm(int_op(op), inst),
            _ => unreachable!("{op:?} is not a compare"),
        }
    }

    pub(crate) fn compile_float(&mut self, op: IrOp, inst: &IrInst) -> Result<(), CodeError> {
        match op {
            IrOp::FMov => {
                let (dest, src) = (VReg::fpr(inst.dest), VReg::fpr(inst.src1));
                if dest == src {
                    return Ok(());
                }
                let s = self.rc.map(self.w, src, MapIntent::ReadOnly)?;
                self.rc.lock(src);
                let d = self.rc.map(self.w, dest, MapIntent::InitNoLoad)?;
                self.rc.release(src);
                self.backend.emit_move(self.w, d, s)
            }
            IrOp::FAdd | IrOp::FSub | IrOp::FMul | IrOp::FDiv => {
                let (dest, src1, src2) =
                    (VReg::fpr(inst.dest), VReg::fpr(inst.src1), VReg::fpr(inst.src2));
                let a = self.rc.map(self.w, src1, MapIntent::ReadOnly)?;
                self.rc.lock(src1);
                let b = self.rc.map(self.w, src2, MapIntent::ReadOnly)?;
                self.rc.lock(src2);
                let d = self.rc.map(self.w, dest, Self::dest_intent(dest, &[src1, src2]))?;
                self.rc.release(src2);
                self.rc.release(src1);
                self.backend.emit_float_op(self.w, float_op(op), d, a, b)
            }
            IrOp::FNeg | IrOp::FAbs | IrOp::FSqrt => {
                let (dest, src) = (VReg::fpr(inst.dest), VReg::fpr(inst.src1));
                let a = self.rc.map(self.w, src, MapIntent::ReadOnly)?;
                self.rc.lock(src);
                let d = self.rc.map(self.w, dest, Self::dest_intent(dest, &[src]))?;
                self.rc.release(src);
                self.backend.emit_float_op(self.w, float_op(op), d, a, a)
            }
            IrOp::FCmpEq | IrOp::FCmpLt => {
                // Float sources, integer destination.
                let (dest, src1, src2) =
                    (VReg::gpr(inst.dest), VReg::fpr(inst.src1), VReg::fpr(inst.src2));
                let a = self.rc.map(self.w, src1, MapIntent::ReadOnly)?;
                self.rc.lock(src1);
                let b = self.rc.map(self.w, src2, MapIntent::ReadOnly)?;
                self.rc.lock(src2);
                let d = self.rc.map(self.w, dest, MapIntent::InitNoLoad)?;
                self.rc.release(src2);
                self.rc.release(src1);
                self.backend.emit_float_op(self.w, float_op(op), d, a, b)
            }
            _ => unreachable!("{op:?} is not a float op"),
        }
    }
}
