//! Introspection for disassembly and profiling tools.

use crate::Jit;

/// Aggregate code-cache statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub blocks: usize,
    pub valid_blocks: usize,
    pub code_bytes: usize,
    /// Native bytes emitted per guest byte, across valid blocks.
    pub min_bloat: f32,
    pub max_bloat: f32,
    pub avg_bloat: f32,
}

impl Jit {
    /// Maps a native code offset to a human-readable label. Handles offsets
    /// outside the generated range without crashing.
    pub fn describe_offset(&self, offset: u32) -> String {
        if (offset as usize) < self.dispatcher_len {
            return "dispatcher".to_string();
        }
        for (id, block) in self.store.iter() {
            let start = block.checked_offset;
            let end = start + block.code_len;
            if offset >= start && offset < end {
                let label = if block.valid { "block" } else { "invalidated block" };
                return format!(
                    "{label} {id} @ {:#010x}+{:#x}",
                    block.guest_addr,
                    offset - start
                );
            }
        }
        if (offset as usize) < self.arena.cursor() {
            "unknown generated code".to_string()
        } else {
            "outside generated code".to_string()
        }
    }

    /// Maps a native code offset back to the guest instruction it was
    /// emitted for. This is what lets a memory fault inside generated code
    /// be reported against a guest address.
    pub fn guest_addr_for_offset(&self, offset: u32) -> Option<u32> {
        for (_, block) in self.store.iter() {
            let end = block.checked_offset + block.code_len;
            if offset < block.checked_offset || offset >= end || block.num_insts == 0 {
                continue;
            }
            let step = block.guest_len / block.num_insts;
            // The entry sequence itself maps to the block start.
            let mut guest = block.guest_addr;
            for (index, &inst_offset) in block.inst_offsets.iter().enumerate() {
                if offset >= inst_offset {
                    guest = block.guest_addr + index as u32 * step;
                }
            }
            return Some(guest);
        }
        None
    }

    pub fn cache_stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            blocks: self.store.len(),
            min_bloat: f32::MAX,
            ..Default::default()
        };
        for (_, block) in self.store.iter() {
            if !block.valid || block.guest_len == 0 {
                continue;
            }
            stats.valid_blocks += 1;
            stats.code_bytes += block.code_len as usize;
            let bloat = block.code_len as f32 / block.guest_len as f32;
            stats.min_bloat = stats.min_bloat.min(bloat);
            stats.max_bloat = stats.max_bloat.max(bloat);
            stats.avg_bloat += bloat;
        }
        if stats.valid_blocks > 0 {
            stats.avg_bloat /= stats.valid_blocks as f32;
        } else {
            stats.min_bloat = 0.0;
        }
        stats
    }
}
