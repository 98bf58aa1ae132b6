//! The portable backend.
//!
//! Generated "native" code is a fixed-width host bytecode written into the
//! executable arena and run by a small threaded loop, the role a tiny-code
//! interpreter backend plays in other dynarecs. Every operation is exactly
//! [OP_BYTES] long, so exit sites, budget checks and trampolines all occupy
//! one op slot and patching never changes code size.
//!
//! Layout of one op: `[opcode][a][b][c][imm: u64 le]`.

use ember_cpu::{Cpu, Exception, ExceptionCode, RegClass};

use crate::arena::{ArenaWriter, CodeArena, CodeError, PatchSite};
use crate::backend::{Backend, BlockEnd, BranchLabel, FloatOp, IntOp, MemWidth, NativeReg};

pub const OP_BYTES: usize = 12;

/// Offset of the dispatcher re-entry stub within the arena.
pub const DISPATCH_ENTRY: u32 = 0;

mod op {
    pub const EXIT_PC: u8 = 0x01;
    pub const TRAMPOLINE: u8 = 0x02;
    pub const CHECK_BUDGET: u8 = 0x03;
    pub const LOAD_STATE: u8 = 0x04;
    pub const STORE_STATE: u8 = 0x05;
    pub const LOAD_IMM: u8 = 0x06;
    pub const MOV: u8 = 0x07;
    pub const SPILL_ST: u8 = 0x08;
    pub const SPILL_LD: u8 = 0x09;

    pub const ADD: u8 = 0x10;
    pub const SUB: u8 = 0x11;
    pub const AND: u8 = 0x12;
    pub const OR: u8 = 0x13;
    pub const XOR: u8 = 0x14;
    pub const MUL: u8 = 0x15;
    pub const SHL: u8 = 0x16;
    pub const SHR: u8 = 0x17;
    pub const SAR: u8 = 0x18;
    pub const SLT: u8 = 0x19;
    pub const SLTU: u8 = 0x1a;

    pub const ADDI: u8 = 0x20;
    pub const ANDI: u8 = 0x21;
    pub const ORI: u8 = 0x22;
    pub const XORI: u8 = 0x23;
    pub const SHLI: u8 = 0x24;
    pub const SHRI: u8 = 0x25;
    pub const SARI: u8 = 0x26;
    pub const SLTI: u8 = 0x27;
    pub const SLTUI: u8 = 0x28;

    pub const FADD: u8 = 0x30;
    pub const FSUB: u8 = 0x31;
    pub const FMUL: u8 = 0x32;
    pub const FDIV: u8 = 0x33;
    pub const FNEG: u8 = 0x34;
    pub const FABS: u8 = 0x35;
    pub const FSQRT: u8 = 0x36;
    pub const FCMPEQ: u8 = 0x37;
    pub const FCMPLT: u8 = 0x38;

    pub const LOAD8: u8 = 0x40;
    pub const LOAD16: u8 = 0x41;
    pub const LOAD32: u8 = 0x42;
    pub const STORE8: u8 = 0x43;
    pub const STORE16: u8 = 0x44;
    pub const STORE32: u8 = 0x45;

    pub const DOWNCOUNT: u8 = 0x50;
    pub const CALL_INTERP: u8 = 0x51;
    pub const SET_PC: u8 = 0x52;

    pub const EXIT_CONST: u8 = 0x60;
    pub const GOTO: u8 = 0x61;
    pub const BR_IF_Z: u8 = 0x62;
    pub const BR_IF_NZ: u8 = 0x63;

    /// Poison. Chosen so that a slot full of trap bytes decodes to it.
    pub const TRAP: u8 = 0xf4;
}

const NUM_FILE_REGS: usize = 16;

const INT_ALLOC_ORDER: [NativeReg; 6] =
    [NativeReg(0), NativeReg(1), NativeReg(2), NativeReg(3), NativeReg(4), NativeReg(5)];
const INT_SCRATCH: NativeReg = NativeReg(6);

const FLOAT_ALLOC_ORDER: [NativeReg; 6] =
    [NativeReg(8), NativeReg(9), NativeReg(10), NativeReg(11), NativeReg(12), NativeReg(13)];
const FLOAT_SCRATCH: NativeReg = NativeReg(14);

fn encode(opcode: u8, a: u8, b: u8, c: u8, imm: u64) -> [u8; OP_BYTES] {
    let mut bytes = [0; OP_BYTES];
    bytes[0] = opcode;
    bytes[1] = a;
    bytes[2] = b;
    bytes[3] = c;
    bytes[4..].copy_from_slice(&imm.to_le_bytes());
    bytes
}

fn emit(
    w: &mut ArenaWriter,
    opcode: u8,
    a: u8,
    b: u8,
    c: u8,
    imm: u64,
) -> Result<(), CodeError> {
    w.emit_bytes(&encode(opcode, a, b, c, imm))
}

pub struct PortableBackend {
    _private: (),
}

impl PortableBackend {
    pub fn new() -> Self {
        Self { _private: () }
    }
}

impl Default for PortableBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for PortableBackend {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn alloc_order(&self, class: RegClass) -> &[NativeReg] {
        match class {
            RegClass::Int => &INT_ALLOC_ORDER,
            RegClass::Float => &FLOAT_ALLOC_ORDER,
        }
    }

    fn scratch_reg(&self, class: RegClass) -> NativeReg {
        match class {
            RegClass::Int => INT_SCRATCH,
            RegClass::Float => FLOAT_SCRATCH,
        }
    }

    fn op_bytes(&self) -> usize {
        OP_BYTES
    }

    fn min_block_bytes(&self) -> usize {
        8 * OP_BYTES
    }

    fn trap_byte(&self) -> u8 {
        op::TRAP
    }

    fn emit_dispatcher_stub(&self, w: &mut ArenaWriter) -> Result<(), CodeError> {
        debug_assert_eq!(w.offset(), DISPATCH_ENTRY as usize);
        emit(w, op::EXIT_PC, 0, 0, 0, 0)?;
        // One trap slot separates the stub from the first block.
        emit(w, op::TRAP, 0, 0, 0, 0)
    }

    fn emit_budget_check(
        &self,
        w: &mut ArenaWriter,
        block_start: u32,
        cost: u32,
    ) -> Result<(), CodeError> {
        emit(w, op::CHECK_BUDGET, 0, 0, 0, (block_start as u64) << 32 | cost as u64)
    }

    fn emit_load_state(
        &self,
        w: &mut ArenaWriter,
        reg: NativeReg,
        offset: u16,
    ) -> Result<(), CodeError> {
        emit(w, op::LOAD_STATE, reg.0, 0, 0, offset as u64)
    }

    fn emit_store_state(
        &self,
        w: &mut ArenaWriter,
        reg: NativeReg,
        offset: u16,
    ) -> Result<(), CodeError> {
        emit(w, op::STORE_STATE, reg.0, 0, 0, offset as u64)
    }

    fn emit_load_imm(
        &self,
        w: &mut ArenaWriter,
        reg: NativeReg,
        value: u32,
    ) -> Result<(), CodeError> {
        emit(w, op::LOAD_IMM, reg.0, 0, 0, value as u64)
    }

    fn emit_move(
        &self,
        w: &mut ArenaWriter,
        dst: NativeReg,
        src: NativeReg,
    ) -> Result<(), CodeError> {
        emit(w, op::MOV, dst.0, src.0, 0, 0)
    }

    fn emit_spill_store(
        &self,
        w: &mut ArenaWriter,
        reg: NativeReg,
        slot: u8,
    ) -> Result<(), CodeError> {
        emit(w, op::SPILL_ST, reg.0, 0, 0, slot as u64)
    }

    fn emit_spill_load(
        &self,
        w: &mut ArenaWriter,
        reg: NativeReg,
        slot: u8,
    ) -> Result<(), CodeError> {
        emit(w, op::SPILL_LD, reg.0, 0, 0, slot as u64)
    }

    fn emit_int_op(
        &self,
        w: &mut ArenaWriter,
        int_op: IntOp,
        dst: NativeReg,
        a: NativeReg,
        b: NativeReg,
    ) -> Result<(), CodeError> {
        let opcode = match int_op {
            IntOp::Add => op::ADD,
            IntOp::Sub => op::SUB,
            IntOp::And => op::AND,
            IntOp::Or => op::OR,
            IntOp::Xor => op::XOR,
            IntOp::Mul => op::MUL,
            IntOp::Shl => op::SHL,
            IntOp::Shr => op::SHR,
            IntOp::Sar => op::SAR,
            IntOp::Slt => op::SLT,
            IntOp::SltU => op::SLTU,
        };
        emit(w, opcode, dst.0, a.0, b.0, 0)
    }

    fn emit_int_op_imm(
        &self,
        w: &mut ArenaWriter,
        int_op: IntOp,
        dst: NativeReg,
        a: NativeReg,
        imm: u32,
    ) -> Result<(), CodeError> {
        let opcode = match int_op {
            IntOp::Add => op::ADDI,
            IntOp::And => op::ANDI,
            IntOp::Or => op::ORI,
            IntOp::Xor => op::XORI,
            IntOp::Shl => op::SHLI,
            IntOp::Shr => op::SHRI,
            IntOp::Sar => op::SARI,
            IntOp::Slt => op::SLTI,
            IntOp::SltU => op::SLTUI,
            IntOp::Sub | IntOp::Mul => {
                unreachable!("no immediate form for {int_op:?}")
            }
        };
        emit(w, opcode, dst.0, a.0, 0, imm as u64)
    }

    fn emit_float_op(
        &self,
        w: &mut ArenaWriter,
        float_op: FloatOp,
        dst: NativeReg,
        a: NativeReg,
        b: NativeReg,
    ) -> Result<(), CodeError> {
        let opcode = match float_op {
            FloatOp::Add => op::FADD,
            FloatOp::Sub => op::FSUB,
            FloatOp::Mul => op::FMUL,
            FloatOp::Div => op::FDIV,
            FloatOp::Neg => op::FNEG,
            FloatOp::Abs => op::FABS,
            FloatOp::Sqrt => op::FSQRT,
            FloatOp::CmpEq => op::FCMPEQ,
            FloatOp::CmpLt => op::FCMPLT,
        };
        emit(w, opcode, dst.0, a.0, b.0, 0)
    }

    fn emit_load_mem(
        &self,
        w: &mut ArenaWriter,
        width: MemWidth,
        dst: NativeReg,
        addr: NativeReg,
        offset: u32,
    ) -> Result<(), CodeError> {
        let opcode = match width {
            MemWidth::U8 => op::LOAD8,
            MemWidth::U16 => op::LOAD16,
            MemWidth::U32 => op::LOAD32,
        };
        emit(w, opcode, dst.0, addr.0, 0, offset as u64)
    }

    fn emit_store_mem(
        &self,
        w: &mut ArenaWriter,
        width: MemWidth,
        value: NativeReg,
        addr: NativeReg,
        offset: u32,
    ) -> Result<(), CodeError> {
        let opcode = match width {
            MemWidth::U8 => op::STORE8,
            MemWidth::U16 => op::STORE16,
            MemWidth::U32 => op::STORE32,
        };
        emit(w, opcode, value.0, addr.0, 0, offset as u64)
    }

    fn emit_downcount(&self, w: &mut ArenaWriter, amount: u32) -> Result<(), CodeError> {
        emit(w, op::DOWNCOUNT, 0, 0, 0, amount as u64)
    }

    fn emit_interp_call(
        &self,
        w: &mut ArenaWriter,
        raw_inst: u64,
        can_exit: bool,
    ) -> Result<(), CodeError> {
        emit(w, op::CALL_INTERP, can_exit as u8, 0, 0, raw_inst)
    }

    fn emit_set_pc(&self, w: &mut ArenaWriter, reg: NativeReg) -> Result<(), CodeError> {
        emit(w, op::SET_PC, reg.0, 0, 0, 0)
    }

    fn emit_exit_to_pc(&self, w: &mut ArenaWriter) -> Result<(), CodeError> {
        emit(w, op::EXIT_PC, 0, 0, 0, 0)
    }

    fn emit_exit_to_const(
        &self,
        w: &mut ArenaWriter,
        target: u32,
    ) -> Result<PatchSite, CodeError> {
        let offset = w.offset();
        emit(w, op::EXIT_CONST, 0, 0, 0, target as u64)?;
        Ok(w.register_patch_site(offset, OP_BYTES))
    }

    fn emit_branch_if_zero(
        &self,
        w: &mut ArenaWriter,
        reg: NativeReg,
    ) -> Result<BranchLabel, CodeError> {
        let offset = w.offset();
        emit(w, op::BR_IF_Z, reg.0, 0, 0, 0)?;
        Ok(BranchLabel { patch_offset: (offset + 4) as u32 })
    }

    fn emit_branch_if_nonzero(
        &self,
        w: &mut ArenaWriter,
        reg: NativeReg,
    ) -> Result<BranchLabel, CodeError> {
        let offset = w.offset();
        emit(w, op::BR_IF_NZ, reg.0, 0, 0, 0)?;
        Ok(BranchLabel { patch_offset: (offset + 4) as u32 })
    }

    fn bind_branch(&self, w: &mut ArenaWriter, label: BranchLabel) {
        w.patch_u64(label.patch_offset as usize, w.offset() as u64);
    }

    fn patch_exit_to_block(&self, arena: &mut CodeArena, site: PatchSite, native_offset: u32) {
        arena.patch(site, &encode(op::GOTO, 0, 0, 0, native_offset as u64));
    }

    fn patch_exit_to_dispatcher(&self, arena: &mut CodeArena, site: PatchSite, target: u32) {
        arena.patch(site, &encode(op::EXIT_CONST, 0, 0, 0, target as u64));
    }

    fn patch_trampoline(&self, arena: &mut CodeArena, site: PatchSite, guest_addr: u32) {
        arena.patch(site, &encode(op::TRAMPOLINE, 0, 0, 0, guest_addr as u64));
    }

    fn enter(&self, arena: &CodeArena, offset: u32, cpu: &mut Cpu) -> BlockEnd {
        execute(arena.exec_slice(), offset, cpu)
    }
}

#[inline]
fn read_u32(regs: &[u64; NUM_FILE_REGS], reg: u8) -> u32 {
    regs[reg as usize] as u32
}

#[inline]
fn read_f32(regs: &[u64; NUM_FILE_REGS], reg: u8) -> f32 {
    f32::from_bits(regs[reg as usize] as u32)
}

fn execute(code: &[u8], entry: u32, cpu: &mut Cpu) -> BlockEnd {
    let mut regs = [0u64; NUM_FILE_REGS];
    let mut off = entry as usize;

    loop {
        if off + OP_BYTES > code.len() {
            return BlockEnd::Trap { offset: off as u32 };
        }
        let opcode = code[off];
        let a = code[off + 1];
        let b = code[off + 2];
        let c = code[off + 3];
        let imm = u64::from_le_bytes(code[off + 4..off + OP_BYTES].try_into().unwrap());
        let at = off;
        off += OP_BYTES;

        macro_rules! set {
            ($value:expr) => {{
                let value: u32 = $value;
                regs[a as usize] = value as u64;
            }};
        }

        match opcode {
            op::EXIT_PC => return BlockEnd::Dispatch,
            op::TRAMPOLINE => {
                cpu.write_pc(imm as u32);
                off = DISPATCH_ENTRY as usize;
            }
            op::CHECK_BUDGET => {
                if cpu.downcount <= 0 {
                    cpu.write_pc((imm >> 32) as u32);
                    return BlockEnd::Dispatch;
                }
                cpu.icount += imm as u32 as u64;
            }
            op::LOAD_STATE => set!(cpu.read_state_u32(imm as u16)),
            op::STORE_STATE => cpu.write_state_u32(imm as u16, read_u32(&regs, a)),
            op::LOAD_IMM => set!(imm as u32),
            op::MOV => regs[a as usize] = regs[b as usize],
            op::SPILL_ST => cpu.spill[imm as usize] = read_u32(&regs, a),
            op::SPILL_LD => set!(cpu.spill[imm as usize]),

            op::ADD => set!(read_u32(&regs, b).wrapping_add(read_u32(&regs, c))),
            op::SUB => set!(read_u32(&regs, b).wrapping_sub(read_u32(&regs, c))),
            op::AND => set!(read_u32(&regs, b) & read_u32(&regs, c)),
            op::OR => set!(read_u32(&regs, b) | read_u32(&regs, c)),
            op::XOR => set!(read_u32(&regs, b) ^ read_u32(&regs, c)),
            op::MUL => set!(read_u32(&regs, b).wrapping_mul(read_u32(&regs, c))),
            op::SHL => set!(read_u32(&regs, b) << (read_u32(&regs, c) & 31)),
            op::SHR => set!(read_u32(&regs, b) >> (read_u32(&regs, c) & 31)),
            op::SAR => {
                set!(((read_u32(&regs, b) as i32) >> (read_u32(&regs, c) & 31)) as u32)
            }
            op::SLT => {
                set!(((read_u32(&regs, b) as i32) < (read_u32(&regs, c) as i32)) as u32)
            }
            op::SLTU => set!((read_u32(&regs, b) < read_u32(&regs, c)) as u32),

            op::ADDI => set!(read_u32(&regs, b).wrapping_add(imm as u32)),
            op::ANDI => set!(read_u32(&regs, b) & imm as u32),
            op::ORI => set!(read_u32(&regs, b) | imm as u32),
            op::XORI => set!(read_u32(&regs, b) ^ imm as u32),
            op::SHLI => set!(read_u32(&regs, b) << (imm as u32 & 31)),
            op::SHRI => set!(read_u32(&regs, b) >> (imm as u32 & 31)),
            op::SARI => set!(((read_u32(&regs, b) as i32) >> (imm as u32 & 31)) as u32),
            op::SLTI => set!(((read_u32(&regs, b) as i32) < (imm as i32)) as u32),
            op::SLTUI => set!((read_u32(&regs, b) < imm as u32) as u32),

            op::FADD => set!((read_f32(&regs, b) + read_f32(&regs, c)).to_bits()),
            op::FSUB => set!((read_f32(&regs, b) - read_f32(&regs, c)).to_bits()),
            op::FMUL => set!((read_f32(&regs, b) * read_f32(&regs, c)).to_bits()),
            op::FDIV => set!((read_f32(&regs, b) / read_f32(&regs, c)).to_bits()),
            op::FNEG => set!((-read_f32(&regs, b)).to_bits()),
            op::FABS => set!(read_f32(&regs, b).abs().to_bits()),
            op::FSQRT => set!(read_f32(&regs, b).sqrt().to_bits()),
            op::FCMPEQ => set!((read_f32(&regs, b) == read_f32(&regs, c)) as u32),
            op::FCMPLT => set!((read_f32(&regs, b) < read_f32(&regs, c)) as u32),

            op::LOAD8 | op::LOAD16 | op::LOAD32 => {
                let addr = read_u32(&regs, b).wrapping_add(imm as u32);
                let result = match opcode {
                    op::LOAD8 => cpu.mem.read_u8(addr).map(u32::from),
                    op::LOAD16 => cpu.mem.read_u16(addr).map(u32::from),
                    _ => cpu.mem.read_u32(addr),
                };
                match result {
                    Ok(value) => set!(value),
                    Err(fault) => {
                        cpu.exception =
                            Exception::new(ExceptionCode::ReadFault, fault.addr as u64);
                        return BlockEnd::Exception;
                    }
                }
            }
            op::STORE8 | op::STORE16 | op::STORE32 => {
                let addr = read_u32(&regs, b).wrapping_add(imm as u32);
                let value = read_u32(&regs, a);
                let result = match opcode {
                    op::STORE8 => cpu.mem.write_u8(addr, value as u8),
                    op::STORE16 => cpu.mem.write_u16(addr, value as u16),
                    _ => cpu.mem.write_u32(addr, value),
                };
                if let Err(fault) = result {
                    cpu.exception = Exception::new(ExceptionCode::WriteFault, fault.addr as u64);
                    return BlockEnd::Exception;
                }
            }

            op::DOWNCOUNT => cpu.downcount -= imm as u32 as i64,
            op::CALL_INTERP => {
                let exited = crate::runtime::run_interpreter(cpu, imm);
                if !cpu.exception.is_none() {
                    return BlockEnd::Exception;
                }
                if exited && a != 0 {
                    return BlockEnd::Dispatch;
                }
            }
            op::SET_PC => cpu.write_pc(read_u32(&regs, a)),

            op::EXIT_CONST => {
                cpu.write_pc(imm as u32);
                return BlockEnd::Dispatch;
            }
            op::GOTO => off = imm as usize,
            op::BR_IF_Z => {
                if read_u32(&regs, a) == 0 {
                    off = imm as usize;
                }
            }
            op::BR_IF_NZ => {
                if read_u32(&regs, a) != 0 {
                    off = imm as usize;
                }
            }

            _ => return BlockEnd::Trap { offset: at as u32 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_cpu::{GuestMemory, VReg};

    fn setup() -> (CodeArena, PortableBackend, Box<Cpu>) {
        let backend = PortableBackend::new();
        let arena = CodeArena::reserve(0x1000, backend.trap_byte()).unwrap();
        let cpu = Cpu::new(GuestMemory::new(0x1000, 0x100));
        (arena, backend, cpu)
    }

    #[test]
    fn state_round_trip_through_file_regs() {
        let (mut arena, backend, mut cpu) = setup();
        cpu.regs.gpr[1] = 7;
        cpu.regs.gpr[2] = 35;
        cpu.downcount = 10;

        let mut w = arena.begin_write();
        backend.emit_dispatcher_stub(&mut w).unwrap();
        let entry = w.offset() as u32;
        backend.emit_budget_check(&mut w, 0x1000, 2).unwrap();
        backend.emit_load_state(&mut w, NativeReg(0), VReg::gpr(1).state_offset()).unwrap();
        backend.emit_load_state(&mut w, NativeReg(1), VReg::gpr(2).state_offset()).unwrap();
        backend
            .emit_int_op(&mut w, IntOp::Add, NativeReg(2), NativeReg(0), NativeReg(1))
            .unwrap();
        backend.emit_store_state(&mut w, NativeReg(2), VReg::gpr(3).state_offset()).unwrap();
        let site = backend.emit_exit_to_const(&mut w, 0x2000).unwrap();
        drop(w);

        assert_eq!(backend.enter(&arena, entry, &mut cpu), BlockEnd::Dispatch);
        assert_eq!(cpu.regs.gpr[3], 42);
        assert_eq!(cpu.read_pc(), 0x2000);
        assert_eq!(cpu.icount, 2);

        // Patch the exit into a direct jump back to the same entry; the
        // second pass through the budget check must stop the loop.
        backend.patch_exit_to_block(&mut arena, site, entry);
        cpu.downcount = 0;
        assert_eq!(backend.enter(&arena, entry, &mut cpu), BlockEnd::Dispatch);
        assert_eq!(cpu.read_pc(), 0x1000);
    }

    #[test]
    fn trampoline_reenters_the_dispatcher_stub() {
        let (mut arena, backend, mut cpu) = setup();
        let mut w = arena.begin_write();
        backend.emit_dispatcher_stub(&mut w).unwrap();
        let entry = w.offset();
        backend.emit_budget_check(&mut w, 0x1000, 1).unwrap();
        let site = w.register_patch_site(entry, OP_BYTES);
        backend.emit_exit_to_pc(&mut w).unwrap();
        drop(w);

        backend.patch_trampoline(&mut arena, site, 0x1234_5678);
        cpu.downcount = 5;
        assert_eq!(backend.enter(&arena, entry as u32, &mut cpu), BlockEnd::Dispatch);
        assert_eq!(cpu.read_pc(), 0x1234_5678);
    }

    #[test]
    fn poisoned_code_traps_loudly() {
        let (arena, backend, mut cpu) = setup();
        let end = backend.enter(&arena, 0x100, &mut cpu);
        assert_eq!(end, BlockEnd::Trap { offset: 0x100 });
    }

    #[test]
    fn forward_branches_bind_to_the_skip_target() {
        let (mut arena, backend, mut cpu) = setup();
        cpu.downcount = 1;

        let mut w = arena.begin_write();
        backend.emit_dispatcher_stub(&mut w).unwrap();
        let entry = w.offset() as u32;
        backend.emit_load_imm(&mut w, NativeReg(0), 1).unwrap();
        let skip = backend.emit_branch_if_nonzero(&mut w, NativeReg(0)).unwrap();
        backend.emit_exit_to_const(&mut w, 0xdead).unwrap();
        backend.bind_branch(&mut w, skip);
        backend.emit_exit_to_const(&mut w, 0xbeef).unwrap();
        drop(w);

        assert_eq!(backend.enter(&arena, entry, &mut cpu), BlockEnd::Dispatch);
        assert_eq!(cpu.read_pc(), 0xbeef);
    }

    #[test]
    fn interp_call_reports_guest_exceptions() {
        use ember_cpu::{IrInst, IrOp};
        let (mut arena, backend, mut cpu) = setup();

        let mut w = arena.begin_write();
        backend.emit_dispatcher_stub(&mut w).unwrap();
        let entry = w.offset() as u32;
        let raw = IrInst::new(IrOp::Break, 0, 0, 0, 0x4000).encode();
        backend.emit_interp_call(&mut w, raw, true).unwrap();
        backend.emit_exit_to_pc(&mut w).unwrap();
        drop(w);

        assert_eq!(backend.enter(&arena, entry, &mut cpu), BlockEnd::Exception);
        assert_eq!(cpu.exception.code, ExceptionCode::Break as u32);
        assert_eq!(cpu.read_pc(), 0x4000);
    }
}
