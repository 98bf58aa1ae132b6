//! The contract a host-architecture backend must satisfy.
//!
//! The engine is architecture-agnostic: the compiler and register allocator
//! drive code generation entirely through [Backend], and the dispatcher
//! enters finished code through it as well. How an operation is encoded is
//! the backend's business; the engine only relies on the sizing and patching
//! guarantees stated here.

pub mod portable;

use ember_cpu::{Cpu, RegClass};

use crate::arena::{ArenaWriter, CodeArena, CodeError, PatchSite};

/// A host machine register, numbered within the backend's register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeReg(pub u8);

impl std::fmt::Display for NativeReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Integer operation group shared by the compiler and backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Mul,
    Shl,
    Shr,
    Sar,
    Slt,
    SltU,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Abs,
    Sqrt,
    CmpEq,
    CmpLt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemWidth {
    U8,
    U16,
    U32,
}

/// A forward branch emitted before its target offset is known.
#[derive(Debug, Clone, Copy)]
#[must_use = "unbound branches jump into poisoned code"]
pub struct BranchLabel {
    pub(crate) patch_offset: u32,
}

/// Why control returned from generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEnd {
    /// A block exit wrote the next guest PC; look it up and continue.
    Dispatch,
    /// The CPU exception slot was set; the host must handle it.
    Exception,
    /// Execution reached trap/poison bytes. Always an engine defect.
    Trap { offset: u32 },
}

pub trait Backend {
    fn name(&self) -> &'static str;

    // -- register file description --

    /// Allocation-priority order for one register class. Scratch registers
    /// are excluded and never touched by the allocator.
    fn alloc_order(&self, class: RegClass) -> &[NativeReg];

    /// A per-class scratch register reserved for multi-step emissions.
    fn scratch_reg(&self, class: RegClass) -> NativeReg;

    // -- sizing guarantees --

    /// Size of one emitted operation. Exit sites and the budget-check entry
    /// are each exactly one operation, which makes every patch site
    /// pre-padded to the largest patched form.
    fn op_bytes(&self) -> usize;

    /// Minimum remaining arena space required to attempt a block.
    fn min_block_bytes(&self) -> usize;

    /// Byte that decodes to an immediate trap, used to poison the arena.
    fn trap_byte(&self) -> u8;

    // -- emission --

    /// The fixed dispatcher re-entry stub placed once at the arena base.
    fn emit_dispatcher_stub(&self, w: &mut ArenaWriter) -> Result<(), CodeError>;

    /// The checked entry: exits to the dispatcher with `pc = block_start`
    /// when the remaining cycle budget is non-positive.
    fn emit_budget_check(
        &self,
        w: &mut ArenaWriter,
        block_start: u32,
        cost: u32,
    ) -> Result<(), CodeError>;

    fn emit_load_state(
        &self,
        w: &mut ArenaWriter,
        reg: NativeReg,
        offset: u16,
    ) -> Result<(), CodeError>;

    fn emit_store_state(
        &self,
        w: &mut ArenaWriter,
        reg: NativeReg,
        offset: u16,
    ) -> Result<(), CodeError>;

    fn emit_load_imm(
        &self,
        w: &mut ArenaWriter,
        reg: NativeReg,
        value: u32,
    ) -> Result<(), CodeError>;

    fn emit_move(
        &self,
        w: &mut ArenaWriter,
        dst: NativeReg,
        src: NativeReg,
    ) -> Result<(), CodeError>;

    fn emit_spill_store(
        &self,
        w: &mut ArenaWriter,
        reg: NativeReg,
        slot: u8,
    ) -> Result<(), CodeError>;

    fn emit_spill_load(
        &self,
        w: &mut ArenaWriter,
        reg: NativeReg,
        slot: u8,
    ) -> Result<(), CodeError>;

    fn emit_int_op(
        &self,
        w: &mut ArenaWriter,
        op: IntOp,
        dst: NativeReg,
        a: NativeReg,
        b: NativeReg,
    ) -> Result<(), CodeError>;

    fn emit_int_op_imm(
        &self,
        w: &mut ArenaWriter,
        op: IntOp,
        dst: NativeReg,
        a: NativeReg,
        imm: u32,
    ) -> Result<(), CodeError>;

    fn emit_float_op(
        &self,
        w: &mut ArenaWriter,
        op: FloatOp,
        dst: NativeReg,
        a: NativeReg,
        b: NativeReg,
    ) -> Result<(), CodeError>;

    fn emit_load_mem(
        &self,
        w: &mut ArenaWriter,
        width: MemWidth,
        dst: NativeReg,
        addr: NativeReg,
        offset: u32,
    ) -> Result<(), CodeError>;

    fn emit_store_mem(
        &self,
        w: &mut ArenaWriter,
        width: MemWidth,
        value: NativeReg,
        addr: NativeReg,
        offset: u32,
    ) -> Result<(), CodeError>;

    fn emit_downcount(&self, w: &mut ArenaWriter, amount: u32) -> Result<(), CodeError>;

    /// Calls the interpreter entry point with the raw 64-bit IR word. When
    /// `can_exit` is set, a reported control-flow change leaves generated
    /// code for the dispatcher.
    fn emit_interp_call(
        &self,
        w: &mut ArenaWriter,
        raw_inst: u64,
        can_exit: bool,
    ) -> Result<(), CodeError>;

    fn emit_set_pc(&self, w: &mut ArenaWriter, reg: NativeReg) -> Result<(), CodeError>;

    /// Exit to the dispatcher, re-checking runtime state for the next PC.
    fn emit_exit_to_pc(&self, w: &mut ArenaWriter) -> Result<(), CodeError>;

    /// Patchable exit to a constant guest address. Returns the registered
    /// site so it can later be linked directly to the target block.
    fn emit_exit_to_const(
        &self,
        w: &mut ArenaWriter,
        target: u32,
    ) -> Result<PatchSite, CodeError>;

    fn emit_branch_if_zero(
        &self,
        w: &mut ArenaWriter,
        reg: NativeReg,
    ) -> Result<BranchLabel, CodeError>;

    fn emit_branch_if_nonzero(
        &self,
        w: &mut ArenaWriter,
        reg: NativeReg,
    ) -> Result<BranchLabel, CodeError>;

    /// Binds a forward branch to the current offset.
    fn bind_branch(&self, w: &mut ArenaWriter, label: BranchLabel);

    // -- patching finalized code --

    /// Rewrites an exit site to jump straight to another block's checked
    /// entry, bypassing the dispatcher.
    fn patch_exit_to_block(&self, arena: &mut CodeArena, site: PatchSite, native_offset: u32);

    /// Rewrites an exit site back to its dispatcher-bound form.
    fn patch_exit_to_dispatcher(&self, arena: &mut CodeArena, site: PatchSite, target: u32);

    /// Overwrites a block's checked entry with a trampoline that loads the
    /// block's guest start address and re-enters the dispatcher.
    fn patch_trampoline(&self, arena: &mut CodeArena, site: PatchSite, guest_addr: u32);

    // -- execution --

    /// Enters generated code at `offset` and runs until a block exit.
    fn enter(&self, arena: &CodeArena, offset: u32, cpu: &mut Cpu) -> BlockEnd;
}

/// Picks the backend for the running host.
///
/// Native encoders hook in here keyed on the host triple; until one lands,
/// every architecture gets the portable backend.
pub fn for_host() -> Box<dyn Backend> {
    tracing::debug!("selecting code generation backend for {}", target_lexicon::HOST);
    Box::new(portable::PortableBackend::new())
}
