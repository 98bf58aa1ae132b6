//! Dynamic code generation engine for the guest CPU.
//!
//! The [Jit] owns the executable arena, the block store and the selected
//! backend. All state-changing operations — compilation, linking,
//! invalidation, full clears — happen behind one writer boundary: they all
//! require `&mut Jit`, and the only cross-thread inputs (invalidation
//! requests, the stop flag, profiling reads) are message-passing handles
//! drained or polled on the execution thread. Lookups and execution read
//! only fully published blocks, because a block's metadata is completed
//! before the dispatch tables can reach it.

pub mod arena;
pub mod backend;
pub mod compile;
pub mod debug;
pub mod dispatch;
pub mod regalloc;
pub mod runtime;
pub mod store;

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;

use ember_cpu::lifter::LiftError;
use ember_cpu::{BlockLifter, Cpu, GuestMemory};

pub use crate::arena::{CodeArena, CodeError};
pub use crate::backend::{Backend, BlockEnd};
pub use crate::debug::CacheStats;
pub use crate::dispatch::{Dispatcher, VmExit};
pub use crate::store::{Block, BlockId, BlockStore};

#[derive(Debug)]
pub enum CompileError {
    Lift(LiftError),
    Code(CodeError),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Lift(err) => write!(f, "lift failed: {err}"),
            CompileError::Code(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CompileError {}

#[derive(Debug, Clone)]
pub struct JitOptions {
    /// Bytes reserved for the executable arena.
    pub code_size: usize,
    /// Patch block exits to jump directly into compiled targets.
    pub block_link: bool,
    /// Flush the whole register cache after every IR instruction. Slow;
    /// for diagnosing allocator bugs.
    pub always_flush_regs: bool,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self { code_size: 16 * 1024 * 1024, block_link: true, always_flush_regs: false }
    }
}

/// Counters shared with profiling threads; all reads are relaxed snapshots.
#[derive(Default)]
pub struct JitStats {
    pub lookup_hits: AtomicU64,
    pub lookup_misses: AtomicU64,
    pub blocks_compiled: AtomicU64,
    pub blocks_invalidated: AtomicU64,
    pub cache_clears: AtomicU64,
}

impl JitStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Jit {
    arena: CodeArena,
    store: BlockStore,
    backend: Box<dyn Backend>,
    opts: JitOptions,
    /// End of the fixed dispatcher code at the arena base; clears rewind to
    /// here, never past it.
    dispatcher_len: usize,
    stats: Arc<JitStats>,
}

impl Jit {
    pub fn new(mut opts: JitOptions) -> anyhow::Result<Self> {
        if std::env::var_os("EMBER_ALWAYS_FLUSH_REGS").is_some() {
            opts.always_flush_regs = true;
        }

        let backend = backend::for_host();
        let mut arena = CodeArena::reserve(opts.code_size, backend.trap_byte())
            .context("reserving the code arena")?;

        let mut w = arena.begin_write();
        backend.emit_dispatcher_stub(&mut w).context("emitting the dispatcher stub")?;
        let dispatcher_len = w.offset();
        drop(w);

        tracing::debug!(
            "jit ready: backend={}, arena={:#x} bytes, dispatcher={:#x} bytes",
            backend.name(),
            arena.size(),
            dispatcher_len,
        );

        Ok(Self {
            arena,
            store: BlockStore::new(),
            backend,
            opts,
            dispatcher_len,
            stats: Arc::new(JitStats::default()),
        })
    }

    /// Shared counter handle for profiling threads.
    pub fn stats(&self) -> Arc<JitStats> {
        self.stats.clone()
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn arena(&self) -> &CodeArena {
        &self.arena
    }

    /// Checked-entry offset of the valid block starting at `addr`.
    pub fn lookup(&mut self, addr: u32) -> Option<u32> {
        match self.store.lookup(addr) {
            Some(id) => {
                JitStats::bump(&self.stats.lookup_hits);
                Some(self.store.get(id).expect("lookup returned a dead block").checked_offset)
            }
            None => {
                JitStats::bump(&self.stats.lookup_misses);
                None
            }
        }
    }

    /// Compiles the block starting at `addr` and returns its checked entry.
    ///
    /// On `CompileError::Code` nothing was published and the arena holds no
    /// partial code; the caller may `clear_all` and retry once before
    /// treating the condition as fatal.
    pub fn compile(
        &mut self,
        lifter: &mut dyn BlockLifter,
        mem: &GuestMemory,
        addr: u32,
    ) -> Result<u32, CompileError> {
        if self.store.is_full() {
            tracing::debug!("block table full, treating as code-space exhaustion");
            return Err(CompileError::Code(CodeError::CodeSpaceExhausted {
                needed: 1,
                remaining: 0,
            }));
        }
        if self.arena.remaining() < self.backend.min_block_bytes() {
            return Err(CompileError::Code(CodeError::CodeSpaceExhausted {
                needed: self.backend.min_block_bytes(),
                remaining: self.arena.remaining(),
            }));
        }

        let lifted = lifter.lift(mem, addr).map_err(CompileError::Lift)?;

        let rollback = self.arena.cursor();
        let mut w = self.arena.begin_write();
        let result =
            compile::compile_block(&*self.backend, &mut w, &lifted, self.opts.always_flush_regs);
        drop(w);

        match result {
            Ok(code) => {
                let entry = code.checked_offset;
                self.store.insert(
                    &lifted,
                    code,
                    &mut self.arena,
                    &*self.backend,
                    self.opts.block_link,
                );
                JitStats::bump(&self.stats.blocks_compiled);
                Ok(entry)
            }
            Err(err) => {
                // Abandon the partial block: rewind and re-poison so nothing
                // half-written is ever reachable, let alone executable.
                self.arena.rewind(rollback);
                Err(CompileError::Code(err))
            }
        }
    }

    /// Enters generated code at `entry` and runs to a block exit.
    pub fn enter(&mut self, entry: u32, cpu: &mut Cpu) -> BlockEnd {
        self.backend.enter(&self.arena, entry, cpu)
    }

    pub fn invalidate(&mut self, id: BlockId) {
        if self.store.invalidate(id, &mut self.arena, &*self.backend) {
            JitStats::bump(&self.stats.blocks_invalidated);
        }
    }

    /// Invalidates every block whose guest range overlaps `[addr, addr+len)`.
    pub fn invalidate_range(&mut self, addr: u32, len: u32) {
        let count = self.store.invalidate_range(addr, len, &mut self.arena, &*self.backend);
        self.stats.blocks_invalidated.fetch_add(count as u64, Ordering::Relaxed);
        if count > 0 {
            tracing::debug!("invalidated {count} blocks for write to {addr:#010x}+{len:#x}");
        }
    }

    /// Erases all blocks and links and rewinds the arena to just past the
    /// fixed dispatcher code.
    pub fn clear_all(&mut self) {
        self.store.clear(&mut self.arena, self.dispatcher_len);
        JitStats::bump(&self.stats.cache_clears);
    }
}
