//! Entry points and cross-thread signals shared between generated code, the
//! dispatcher and the host.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use ember_cpu::{interp, Cpu};

/// The interpreter fallback entry point.
///
/// Generated code calls this with the raw 64-bit encoded IR instruction.
/// Returns whether a block exit occurred; if so, the new guest PC has
/// already been written to guest state.
pub fn run_interpreter(cpu: &mut Cpu, raw_inst: u64) -> bool {
    interp::interpret_raw(cpu, raw_inst)
}

/// The scheduler's time-advance callback, run at `OuterAdvance`. Expected to
/// refill `cpu.downcount`; everything else it does is the host's business.
pub type AdvanceFn = Box<dyn FnMut(&mut Cpu) + Send>;

/// Cross-thread invalidation requests.
///
/// A device or second emulated core that modifies guest memory posts the
/// affected range here; the dispatcher drains the queue inside the writer
/// serialization boundary before entering any code, so requesting threads
/// never touch the block store directly.
#[derive(Default)]
pub struct InvalidationQueue {
    pending: Mutex<Vec<(u32, u32)>>,
    armed: AtomicBool,
}

impl InvalidationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests invalidation of `[addr, addr + len)`. Callable from any
    /// thread.
    pub fn request(&self, addr: u32, len: u32) {
        self.pending.lock().unwrap().push((addr, len));
        self.armed.store(true, Ordering::Release);
    }

    /// Takes all pending requests, if any.
    pub fn drain(&self) -> Vec<(u32, u32)> {
        if !self.armed.swap(false, Ordering::AcqRel) {
            return Vec::new();
        }
        std::mem::take(&mut *self.pending.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_is_empty_until_armed() {
        let queue = InvalidationQueue::new();
        assert!(queue.drain().is_empty());
        queue.request(0x1000, 4);
        queue.request(0x2000, 8);
        assert_eq!(queue.drain(), vec![(0x1000, 4), (0x2000, 8)]);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn requests_cross_threads() {
        let queue = std::sync::Arc::new(InvalidationQueue::new());
        let remote = queue.clone();
        std::thread::spawn(move || remote.request(0x4000, 16)).join().unwrap();
        assert_eq!(queue.drain(), vec![(0x4000, 16)]);
    }
}
