//! Maps virtual (guest architectural) registers to native registers for the
//! lifetime of one block's compilation.
//!
//! Bindings move through `Unbound -> Bound(clean) -> Bound(dirty) -> Unbound`
//! on flush, with a `Spilled` detour when a fixed-register grab displaces an
//! occupant and no other native register is free. Lock counts pin a binding
//! for the duration of one IR instruction's emission; a lock that survives an
//! instruction is a compiler defect, not a guest-visible condition.

use bitflags::bitflags;
use ember_cpu::{RegClass, VReg, NUM_SPILL_SLOTS, TOTAL_VREGS};

use crate::arena::{ArenaWriter, CodeError};
use crate::backend::{Backend, NativeReg};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct MapFlags: u8 {
        /// Load the current value from guest state when binding.
        const INIT = 1 << 0;
        /// The binding will be written and must be flushed before reuse.
        const DIRTY = 1 << 1;
    }
}

/// Caller intent for [RegAlloc::map].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapIntent {
    ReadOnly,
    /// Written, but possibly only partially, so the old value is still
    /// loaded first.
    WriteOnly,
    ReadWrite,
    /// Fully overwritten; skips the initial load.
    InitNoLoad,
}

impl MapIntent {
    fn flags(self) -> MapFlags {
        match self {
            MapIntent::ReadOnly => MapFlags::INIT,
            MapIntent::WriteOnly | MapIntent::ReadWrite => MapFlags::INIT | MapFlags::DIRTY,
            MapIntent::InitNoLoad => MapFlags::DIRTY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VRegLoc {
    /// Canonical: the value lives in guest-state memory.
    Mem,
    Reg(NativeReg),
    Spilled { slot: u8, dirty: bool },
}

#[derive(Debug, Clone, Copy)]
struct NativeState {
    vreg: Option<VReg>,
    dirty: bool,
    locks: u8,
    last_use: u32,
}

const UNBOUND: NativeState = NativeState { vreg: None, dirty: false, locks: 0, last_use: 0 };

pub struct RegAlloc<'a> {
    backend: &'a dyn Backend,
    nr: [NativeState; 32],
    mr: [VRegLoc; TOTAL_VREGS],
    spill_used: [bool; NUM_SPILL_SLOTS],
    /// Index of the IR instruction currently being compiled. Bindings used
    /// in the same instruction tie on eviction age.
    ir_index: u32,
    /// Guest address of the block being compiled, for diagnostics.
    block_addr: u32,
}

impl<'a> RegAlloc<'a> {
    pub fn new(backend: &'a dyn Backend) -> Self {
        for order in [backend.alloc_order(RegClass::Int), backend.alloc_order(RegClass::Float)] {
            for reg in order {
                assert!((reg.0 as usize) < 32, "native register index out of range");
            }
        }
        Self {
            backend,
            nr: [UNBOUND; 32],
            mr: [VRegLoc::Mem; TOTAL_VREGS],
            spill_used: [false; NUM_SPILL_SLOTS],
            ir_index: 0,
            block_addr: 0,
        }
    }

    /// Resets all bindings for a new block.
    pub fn start_block(&mut self, guest_addr: u32) {
        self.nr = [UNBOUND; 32];
        self.mr = [VRegLoc::Mem; TOTAL_VREGS];
        self.spill_used = [false; NUM_SPILL_SLOTS];
        self.ir_index = 0;
        self.block_addr = guest_addr;
    }

    /// Advances the allocator to the next IR instruction.
    pub fn set_ir_index(&mut self, index: u32) {
        self.ir_index = index;
    }

    #[inline]
    fn touch(&mut self, reg: NativeReg) {
        self.nr[reg.0 as usize].last_use = self.ir_index;
    }

    fn bind(&mut self, reg: NativeReg, vreg: VReg, dirty: bool) {
        debug_assert_eq!(self.nr[reg.0 as usize].vreg, None);
        self.nr[reg.0 as usize] = NativeState { vreg: Some(vreg), dirty, locks: 0, last_use: 0 };
        self.mr[vreg.0 as usize] = VRegLoc::Reg(reg);
    }

    fn unbind(&mut self, reg: NativeReg) {
        if let Some(vreg) = self.nr[reg.0 as usize].vreg {
            self.mr[vreg.0 as usize] = VRegLoc::Mem;
        }
        self.nr[reg.0 as usize] = UNBOUND;
    }

    /// Writes a dirty binding back to its canonical slot and releases the
    /// native register.
    fn flush_reg(&mut self, w: &mut ArenaWriter, reg: NativeReg) -> Result<(), CodeError> {
        let state = self.nr[reg.0 as usize];
        if let Some(vreg) = state.vreg {
            if state.dirty {
                self.backend.emit_store_state(w, reg, vreg.state_offset())?;
            }
        }
        self.unbind(reg);
        Ok(())
    }

    /// Picks a native register for `class`, evicting the least-recently-used
    /// unlocked binding if none is free. Eviction prefers clean bindings on
    /// last-use ties, then lower virtual register numbers.
    fn alloc_reg(&mut self, w: &mut ArenaWriter, class: RegClass) -> Result<NativeReg, CodeError> {
        let order = self.backend.alloc_order(class);
        for &reg in order {
            if self.nr[reg.0 as usize].vreg.is_none() {
                return Ok(reg);
            }
        }

        let mut best: Option<(NativeReg, (u32, bool, u8))> = None;
        for &reg in order {
            let state = &self.nr[reg.0 as usize];
            if state.locks != 0 {
                continue;
            }
            let vreg = state.vreg.expect("allocatable register neither free nor bound");
            let key = (state.last_use, state.dirty, vreg.0);
            if best.map_or(true, |(_, best_key)| key < best_key) {
                best = Some((reg, key));
            }
        }

        let Some((victim, _)) = best else {
            // Every register in the class is both bound and locked. A correct
            // compiler never needs more locked values per IR instruction than
            // the backend has registers, so this is a defect in the compiler
            // itself rather than a resource condition.
            panic!(
                "all {class:?} registers locked while compiling block at {:#010x}",
                self.block_addr
            );
        };

        tracing::trace!(
            "evicting {} ({:?}) from {victim}",
            self.nr[victim.0 as usize].vreg.unwrap(),
            class
        );
        self.flush_reg(w, victim)?;
        Ok(victim)
    }

    /// Maps a virtual register to a native register with the given intent.
    pub fn map(
        &mut self,
        w: &mut ArenaWriter,
        vreg: VReg,
        intent: MapIntent,
    ) -> Result<NativeReg, CodeError> {
        assert!(vreg.is_valid(), "map of invalid vreg {}", vreg.0);
        let flags = intent.flags();

        let reg = match self.mr[vreg.0 as usize] {
            VRegLoc::Reg(reg) => reg,
            VRegLoc::Spilled { slot, dirty } => {
                let reg = self.alloc_reg(w, vreg.class())?;
                self.backend.emit_spill_load(w, reg, slot)?;
                self.spill_used[slot as usize] = false;
                self.bind(reg, vreg, dirty);
                reg
            }
            VRegLoc::Mem => {
                let reg = self.alloc_reg(w, vreg.class())?;
                if flags.contains(MapFlags::INIT) {
                    self.backend.emit_load_state(w, reg, vreg.state_offset())?;
                }
                self.bind(reg, vreg, false);
                reg
            }
        };

        if flags.contains(MapFlags::DIRTY) {
            self.nr[reg.0 as usize].dirty = true;
        }
        self.touch(reg);
        Ok(reg)
    }

    /// Maps a virtual register into a specific native register, relocating
    /// any current occupant without dropping dirty state.
    pub fn map_fixed(
        &mut self,
        w: &mut ArenaWriter,
        vreg: VReg,
        target: NativeReg,
        intent: MapIntent,
    ) -> Result<(), CodeError> {
        let class = vreg.class();
        assert!(
            self.backend.alloc_order(class).contains(&target),
            "{target} is not allocatable for {class:?}"
        );

        let occupant = self.nr[target.0 as usize].vreg;
        if occupant == Some(vreg) {
            if intent.flags().contains(MapFlags::DIRTY) {
                self.nr[target.0 as usize].dirty = true;
            }
            self.touch(target);
            return Ok(());
        }

        if let Some(other) = occupant {
            assert_eq!(
                self.nr[target.0 as usize].locks,
                0,
                "cannot displace locked binding {other} from {target} in block {:#010x}",
                self.block_addr
            );
            let dirty = self.nr[target.0 as usize].dirty;
            let free = self
                .backend
                .alloc_order(other.class())
                .iter()
                .copied()
                .find(|&r| r != target && self.nr[r.0 as usize].vreg.is_none());
            match free {
                Some(dest) => {
                    self.backend.emit_move(w, dest, target)?;
                    self.unbind(target);
                    self.bind(dest, other, dirty);
                }
                None => {
                    let slot = self
                        .spill_used
                        .iter()
                        .position(|used| !used)
                        .unwrap_or_else(|| {
                            panic!(
                                "out of spill slots relocating {other} in block {:#010x}",
                                self.block_addr
                            )
                        });
                    self.backend.emit_spill_store(w, target, slot as u8)?;
                    self.spill_used[slot] = true;
                    self.unbind(target);
                    self.mr[other.0 as usize] = VRegLoc::Spilled { slot: slot as u8, dirty };
                }
            }
        }

        let flags = intent.flags();
        match self.mr[vreg.0 as usize] {
            VRegLoc::Reg(current) => {
                let dirty = self.nr[current.0 as usize].dirty;
                assert_eq!(
                    self.nr[current.0 as usize].locks,
                    0,
                    "cannot move locked binding {vreg} in block {:#010x}",
                    self.block_addr
                );
                self.backend.emit_move(w, target, current)?;
                self.unbind(current);
                self.bind(target, vreg, dirty);
            }
            VRegLoc::Spilled { slot, dirty } => {
                self.backend.emit_spill_load(w, target, slot)?;
                self.spill_used[slot as usize] = false;
                self.bind(target, vreg, dirty);
            }
            VRegLoc::Mem => {
                if flags.contains(MapFlags::INIT) {
                    self.backend.emit_load_state(w, target, vreg.state_offset())?;
                }
                self.bind(target, vreg, false);
            }
        }

        if flags.contains(MapFlags::DIRTY) {
            self.nr[target.0 as usize].dirty = true;
        }
        self.touch(target);
        Ok(())
    }

    /// Pins a mapped virtual register against eviction.
    pub fn lock(&mut self, vreg: VReg) {
        let VRegLoc::Reg(reg) = self.mr[vreg.0 as usize] else {
            panic!("lock of unmapped vreg {vreg} in block {:#010x}", self.block_addr);
        };
        self.nr[reg.0 as usize].locks += 1;
    }

    pub fn release(&mut self, vreg: VReg) {
        let VRegLoc::Reg(reg) = self.mr[vreg.0 as usize] else {
            panic!("release of unmapped vreg {vreg} in block {:#010x}", self.block_addr);
        };
        let locks = &mut self.nr[reg.0 as usize].locks;
        assert!(*locks > 0, "unbalanced release of {vreg} in block {:#010x}", self.block_addr);
        *locks -= 1;
    }

    /// Asserts that every lock taken during an instruction's emission has
    /// been released.
    pub fn assert_no_locks(&self) {
        for state in &self.nr {
            if let Some(vreg) = state.vreg {
                assert_eq!(
                    state.locks, 0,
                    "lock on {vreg} leaked after IR instruction {} in block {:#010x}",
                    self.ir_index, self.block_addr
                );
            }
        }
    }

    /// Writes every dirty binding back to guest state and clears all
    /// bindings. Required before any block exit and before calling into
    /// non-translated code, which observes guest state through memory.
    pub fn flush_all(&mut self, w: &mut ArenaWriter) -> Result<(), CodeError> {
        self.assert_no_locks();

        for class in [RegClass::Int, RegClass::Float] {
            for &reg in self.backend.alloc_order(class) {
                self.flush_reg(w, reg)?;
            }
        }

        for idx in 0..TOTAL_VREGS {
            if let VRegLoc::Spilled { slot, dirty } = self.mr[idx] {
                let vreg = VReg(idx as u8);
                if dirty {
                    let scratch = self.backend.scratch_reg(vreg.class());
                    self.backend.emit_spill_load(w, scratch, slot)?;
                    self.backend.emit_store_state(w, scratch, vreg.state_offset())?;
                }
                self.spill_used[slot as usize] = false;
                self.mr[idx] = VRegLoc::Mem;
            }
        }
        Ok(())
    }

    /// Whether any binding is currently live (used by tests and asserts).
    pub fn has_live_bindings(&self) -> bool {
        self.nr.iter().any(|state| state.vreg.is_some())
            || self.mr.iter().any(|loc| *loc != VRegLoc::Mem)
    }

    /// Verifies the 1:1 binding invariants; panics on violation.
    pub fn check_invariants(&self) {
        let mut seen = [false; TOTAL_VREGS];
        for (idx, state) in self.nr.iter().enumerate() {
            if let Some(vreg) = state.vreg {
                assert!(
                    !std::mem::replace(&mut seen[vreg.0 as usize], true),
                    "{vreg} bound to two native registers"
                );
                assert_eq!(
                    self.mr[vreg.0 as usize],
                    VRegLoc::Reg(NativeReg(idx as u8)),
                    "binding tables disagree for {vreg}"
                );
            }
        }
        for (idx, loc) in self.mr.iter().enumerate() {
            if let VRegLoc::Reg(reg) = loc {
                assert_eq!(
                    self.nr[reg.0 as usize].vreg,
                    Some(VReg(idx as u8)),
                    "vreg {idx} points at {reg} which is not bound to it"
                );
            }
        }
    }
}
