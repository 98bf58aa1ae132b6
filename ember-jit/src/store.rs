//! The block store: every compiled translation unit, the guest-address map,
//! link bookkeeping and invalidation.
//!
//! Blocks are owned exclusively by the store and referenced everywhere else
//! by [BlockId], an index plus a generation stamp. A stale stamp reads as
//! "target gone", which forces a relink through the dispatcher instead of a
//! dangling jump. Invalidated blocks are never physically removed; their
//! entry is overwritten with a re-compile trampoline and the slot stays
//! behind as a shell.

use hashbrown::HashMap;

use ember_cpu::lifter::LiftedBlock;

use crate::arena::{CodeArena, PatchSite};
use crate::backend::Backend;
use crate::compile::CompiledCode;

pub const MAX_BLOCKS: usize = 0x4000;

const FAST_LOOKUP_SIZE: usize = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub index: u32,
    pub generation: u32,
}

impl BlockId {
    pub const INVALID: BlockId = BlockId { index: u32::MAX, generation: 0 };
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.index)
    }
}

/// One outbound patchable exit of a block.
#[derive(Debug, Clone, Copy)]
pub struct ExitSite {
    pub site: PatchSite,
    pub target: u32,
    pub linked: bool,
}

pub struct Block {
    pub guest_addr: u32,
    pub guest_len: u32,
    pub num_insts: u32,
    /// Entry that verifies the cycle budget; links land here.
    pub checked_offset: u32,
    /// Entry past the budget check.
    pub entry_offset: u32,
    pub code_len: u32,
    pub inst_offsets: Vec<u32>,
    pub exits: Vec<ExitSite>,
    pub entry_site: PatchSite,
    pub valid: bool,
    generation: u32,
}

impl Block {
    pub fn id(&self, index: usize) -> BlockId {
        BlockId { index: index as u32, generation: self.generation }
    }

    pub fn contains_guest(&self, addr: u32, len: u32) -> bool {
        addr < self.guest_addr.wrapping_add(self.guest_len)
            && addr.wrapping_add(len) > self.guest_addr
    }
}

pub struct BlockStore {
    blocks: Vec<Block>,
    /// Guest start address of every valid block.
    map: HashMap<u32, BlockId>,
    /// Inbound link index: target guest address -> source blocks that have
    /// an exit aimed at it.
    links_to: HashMap<u32, Vec<BlockId>>,
    /// Direct-mapped front cache for dispatch lookups.
    fast: Box<[(u32, BlockId)]>,
    next_generation: u32,
    /// Union of all valid blocks' guest ranges, so range invalidation can
    /// skip unrelated writes cheaply.
    guest_range: (u32, u32),
}

const EMPTY_RANGE: (u32, u32) = (u32::MAX, 0);

impl BlockStore {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            map: HashMap::new(),
            links_to: HashMap::new(),
            fast: vec![(u32::MAX, BlockId::INVALID); FAST_LOOKUP_SIZE].into_boxed_slice(),
            next_generation: 1,
            guest_range: EMPTY_RANGE,
        }
    }

    #[inline]
    fn fast_key(addr: u32) -> usize {
        addr as usize % FAST_LOOKUP_SIZE
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.blocks.len() >= MAX_BLOCKS
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        let block = self.blocks.get(id.index as usize)?;
        (block.generation == id.generation && block.valid).then_some(block)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.blocks.iter().enumerate().map(|(index, block)| (block.id(index), block))
    }

    /// Map-only lookup that leaves the fast table untouched.
    pub fn find(&self, addr: u32) -> Option<BlockId> {
        self.map.get(&addr).copied()
    }

    /// Looks up the valid block starting at `addr`.
    pub fn lookup(&mut self, addr: u32) -> Option<BlockId> {
        let (key, id) = self.fast[Self::fast_key(addr)];
        if key == addr && self.get(id).is_some() {
            return Some(id);
        }
        let id = *self.map.get(&addr)?;
        debug_assert!(self.get(id).is_some(), "block map entry points at a dead block");
        self.fast[Self::fast_key(addr)] = (addr, id);
        Some(id)
    }

    /// Records a freshly compiled block and makes it reachable. Metadata is
    /// fully constructed before the map and fast table publish it.
    pub fn insert(
        &mut self,
        lifted: &LiftedBlock,
        code: CompiledCode,
        arena: &mut CodeArena,
        backend: &dyn Backend,
        block_link: bool,
    ) -> BlockId {
        assert!(!self.is_full(), "block store full");

        let generation = self.next_generation;
        self.next_generation += 1;

        let index = self.blocks.len();
        let block = Block {
            guest_addr: lifted.start,
            guest_len: lifted.guest_len(),
            num_insts: lifted.insts.len() as u32,
            checked_offset: code.checked_offset,
            entry_offset: code.entry_offset,
            code_len: code.code_len,
            inst_offsets: code.inst_offsets,
            exits: code
                .exits
                .iter()
                .map(|exit| ExitSite { site: exit.site, target: exit.target, linked: false })
                .collect(),
            entry_site: code.entry_site,
            valid: true,
            generation,
        };
        let id = block.id(index);

        self.guest_range.0 = self.guest_range.0.min(block.guest_addr);
        self.guest_range.1 = self.guest_range.1.max(block.guest_addr + block.guest_len);

        for exit in &block.exits {
            self.links_to.entry(exit.target).or_default().push(id);
        }
        self.blocks.push(block);
        self.map.insert(lifted.start, id);
        self.fast[Self::fast_key(lifted.start)] = (lifted.start, id);

        if block_link {
            self.link_new_block(id, arena, backend);
        }

        tracing::debug!(
            "block {id} compiled for {:#010x} ({} IR instructions, {} native bytes)",
            lifted.start,
            lifted.insts.len(),
            code.code_len,
        );
        id
    }

    /// Links the new block in both directions: its own exits to
    /// already-compiled targets, and other blocks' pending exits to it.
    fn link_new_block(&mut self, id: BlockId, arena: &mut CodeArena, backend: &dyn Backend) {
        // Outbound: patch exits whose target already exists.
        let exits = self.blocks[id.index as usize].exits.clone();
        for (exit_index, exit) in exits.iter().enumerate() {
            if let Some(target_id) = self.lookup(exit.target) {
                let target_entry = self.blocks[target_id.index as usize].checked_offset;
                backend.patch_exit_to_block(arena, exit.site, target_entry);
                self.blocks[id.index as usize].exits[exit_index].linked = true;
                tracing::trace!("linked {id} exit {exit_index} -> {target_id}");
            }
        }

        // Inbound: patch every pending exit aimed at this block's address.
        let addr = self.blocks[id.index as usize].guest_addr;
        let entry = self.blocks[id.index as usize].checked_offset;
        let sources = self.links_to.get(&addr).cloned().unwrap_or_default();
        for source_id in sources {
            if source_id == id || self.get(source_id).is_none() {
                continue;
            }
            let source = &mut self.blocks[source_id.index as usize];
            for exit in source.exits.iter_mut().filter(|e| e.target == addr && !e.linked) {
                backend.patch_exit_to_block(arena, exit.site, entry);
                exit.linked = true;
                tracing::trace!("linked pending exit of {source_id} -> {id}");
            }
        }
    }

    /// Overwrites the block's entry with a re-compile trampoline and erases
    /// every inbound link so future callers fall through to it. Safe to call
    /// repeatedly; a second invalidation of the same id is a no-op.
    ///
    /// Returns whether the block was live.
    pub fn invalidate(&mut self, id: BlockId, arena: &mut CodeArena, backend: &dyn Backend) -> bool {
        if self.get(id).is_none() {
            return false;
        }
        let (addr, entry_site) = {
            let block = &self.blocks[id.index as usize];
            (block.guest_addr, block.entry_site)
        };
        tracing::debug!("invalidating block {id} at {addr:#010x}");

        // Unlink inbound: sources go back through the dispatcher, which will
        // relink them lazily after recompilation.
        let sources = self.links_to.get(&addr).cloned().unwrap_or_default();
        for source_id in sources {
            if self.get(source_id).is_none() {
                continue;
            }
            let source = &mut self.blocks[source_id.index as usize];
            for exit in source.exits.iter_mut().filter(|e| e.target == addr && e.linked) {
                backend.patch_exit_to_dispatcher(arena, exit.site, exit.target);
                exit.linked = false;
            }
        }

        // Drop this block's own outbound records so a future target
        // compilation does not patch dead code.
        let exits = std::mem::take(&mut self.blocks[id.index as usize].exits);
        for exit in &exits {
            if let Some(sources) = self.links_to.get_mut(&exit.target) {
                sources.retain(|&source| source != id);
                if sources.is_empty() {
                    self.links_to.remove(&exit.target);
                }
            }
        }

        backend.patch_trampoline(arena, entry_site, addr);

        let block = &mut self.blocks[id.index as usize];
        block.valid = false;

        if self.map.get(&addr) == Some(&id) {
            self.map.remove(&addr);
        }
        let fast = &mut self.fast[Self::fast_key(addr)];
        if fast.1 == id {
            *fast = (u32::MAX, BlockId::INVALID);
        }
        true
    }

    /// Invalidates every block overlapping `[addr, addr + len)`. Returns how
    /// many blocks were invalidated.
    pub fn invalidate_range(
        &mut self,
        addr: u32,
        len: u32,
        arena: &mut CodeArena,
        backend: &dyn Backend,
    ) -> usize {
        let end = addr.saturating_add(len);
        if addr >= self.guest_range.1 || end <= self.guest_range.0 {
            return 0;
        }

        let stale: Vec<BlockId> = self
            .iter()
            .filter(|(_, block)| block.valid && block.contains_guest(addr, len))
            .map(|(id, _)| id)
            .collect();
        let count = stale.len();
        for id in stale {
            self.invalidate(id, arena, backend);
        }
        count
    }

    /// Erases all blocks and links, rewinds the arena to just past the fixed
    /// dispatcher code, and re-poisons the cleared range.
    pub fn clear(&mut self, arena: &mut CodeArena, dispatcher_len: usize) {
        tracing::debug!("clearing {} blocks from the code cache", self.blocks.len());
        self.blocks.clear();
        self.map.clear();
        self.links_to.clear();
        self.fast.fill((u32::MAX, BlockId::INVALID));
        self.guest_range = EMPTY_RANGE;
        arena.rewind(dispatcher_len);
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}
