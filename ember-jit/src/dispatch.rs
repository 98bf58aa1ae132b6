//! The dispatcher: looks up or compiles the block for the current guest PC
//! and resumes execution.
//!
//! State machine per iteration: `EnterLoop -> CheckBudget -> {OuterAdvance |
//! LookupBlock} -> {DirectJump | Compile} -> Execute -> CheckBudget | Halt`.
//! Compilation is always synchronous on the execution thread; the only
//! cross-thread inputs are the stop flag and the invalidation queue, both
//! polled at budget checks and block exits, never mid-block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ember_cpu::lifter::LiftError;
use ember_cpu::{BlockLifter, Cpu, Exception};

use crate::backend::BlockEnd;
use crate::runtime::{AdvanceFn, InvalidationQueue};
use crate::{CompileError, Jit};

/// Why the dispatcher returned control to the host.
#[derive(Debug)]
pub enum VmExit {
    /// The external stop flag was observed at a yield point.
    Halt,
    /// The cycle budget stayed exhausted after the time-advance callback.
    InstructionLimit,
    /// Guest code raised an exception (syscall, break, memory fault). The
    /// exception is also left in `cpu.exception`.
    Exception(Exception),
    /// The front end could not produce IR for the current PC.
    Lift(LiftError),
}

pub struct Dispatcher {
    stop: Arc<AtomicBool>,
    invalidations: Arc<InvalidationQueue>,
    advance: AdvanceFn,
}

impl Dispatcher {
    /// `advance` is the host scheduler's time-advance entry point; it is
    /// expected to refill the cycle budget.
    pub fn new(advance: impl FnMut(&mut Cpu) + Send + 'static) -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            invalidations: Arc::new(InvalidationQueue::new()),
            advance: Box::new(advance),
        }
    }

    /// Shared stop flag; setting it halts the loop at the next yield point.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Shared handle other threads use to request invalidation.
    pub fn invalidation_queue(&self) -> Arc<InvalidationQueue> {
        self.invalidations.clone()
    }

    /// Runs guest code until a halt, budget starvation, exception or lift
    /// failure.
    pub fn run(
        &mut self,
        jit: &mut Jit,
        cpu: &mut Cpu,
        lifter: &mut dyn BlockLifter,
    ) -> VmExit {
        // EnterLoop: guest state is canonical in memory between blocks, so
        // there is nothing to restore beyond what blocks load themselves.
        loop {
            // CheckBudget, and the cross-thread signals that share its
            // cadence.
            for (addr, len) in self.invalidations.drain() {
                jit.invalidate_range(addr, len);
            }
            if self.stop.load(Ordering::Relaxed) {
                return VmExit::Halt;
            }
            if cpu.downcount <= 0 {
                // OuterAdvance: hand control to the host scheduler.
                (self.advance)(cpu);
                if cpu.downcount <= 0 {
                    return VmExit::InstructionLimit;
                }
                continue;
            }

            // LookupBlock / Compile. A miss compiles synchronously and jumps
            // into the fresh block without re-checking the cache.
            let pc = cpu.read_pc();
            let entry = match jit.lookup(pc) {
                Some(entry) => entry,
                None => match self.compile_with_retry(jit, cpu, lifter, pc) {
                    Ok(entry) => entry,
                    Err(exit) => return exit,
                },
            };

            // Execute: linked blocks chain without coming back here.
            match jit.enter(entry, cpu) {
                BlockEnd::Dispatch => {}
                BlockEnd::Exception => {
                    tracing::trace!(
                        "guest exception {:?} ({:#x}) at pc {:#010x}",
                        ember_cpu::ExceptionCode::from_u32(cpu.exception.code),
                        cpu.exception.value,
                        cpu.read_pc(),
                    );
                    return VmExit::Exception(cpu.exception);
                }
                BlockEnd::Trap { offset } => panic!(
                    "executed poisoned code at arena offset {offset:#x} ({})",
                    jit.describe_offset(offset)
                ),
            }
        }
    }

    /// Compiles the block at `pc`, self-healing code-space exhaustion with a
    /// full cache clear and a single retry.
    fn compile_with_retry(
        &mut self,
        jit: &mut Jit,
        cpu: &Cpu,
        lifter: &mut dyn BlockLifter,
        pc: u32,
    ) -> Result<u32, VmExit> {
        match jit.compile(lifter, &cpu.mem, pc) {
            Ok(entry) => Ok(entry),
            Err(CompileError::Lift(err)) => Err(VmExit::Lift(err)),
            Err(CompileError::Code(err)) => {
                tracing::debug!("code cache exhausted at {pc:#010x} ({err}), clearing");
                jit.clear_all();
                match jit.compile(lifter, &cpu.mem, pc) {
                    Ok(entry) => Ok(entry),
                    Err(CompileError::Lift(err)) => Err(VmExit::Lift(err)),
                    Err(CompileError::Code(err)) => {
                        // The arena cannot fit even one block after a full
                        // clear; no amount of retrying recovers from that.
                        panic!("code arena too small for a single block: {err}");
                    }
                }
            }
        }
    }
}
