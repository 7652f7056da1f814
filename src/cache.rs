//! Block cache manager.
//!
//! Keeps four indexes over compiled blocks mutually consistent: an
//! address-keyed block index (aliasing multimap), a direct-mapped fast
//! dispatch table, a reverse link graph driving direct-link patching, and a
//! coarse range index bounding the search space for invalidation. Blocks are
//! stored in an id-keyed arena; every index holds [`BlockId`]s, which stay
//! stable until the block is destroyed.
//!
//! Single logical owner: all operations are synchronous and `&mut self`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::backend::{CodeBackend, CodePtr, ExitTarget};
use crate::bitmap::{CACHE_LINE_SIZE, ValidityBitmap};
use crate::block::{Block, BlockId, MODE_BITS_MASK, MODE_INSN_XLATE};
use crate::config::{CacheConfig, ConfigError};
use crate::profiler::CodeProfiler;
use crate::translate::AddressTranslator;

/// Physical bytes covered by one range-index bucket (macro block).
pub const RANGE_BUCKET_SIZE: u64 = 0x100;
const RANGE_BUCKET_MASK: u64 = !(RANGE_BUCKET_SIZE - 1);

/// Instruction-alignment bits dropped when hashing into the fast table.
pub const INSN_ALIGN_SHIFT: u32 = 2;

/// Dispatch and invalidation counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    /// Fast-table probes that returned an entry directly.
    pub hits: u64,
    /// Dispatches that fell back to the block index.
    pub misses: u64,
    /// Physical-range invalidation passes.
    pub invalidations: u64,
}

pub struct BlockCache {
    /// Block storage; ids are never reused within one cache lifetime.
    blocks: HashMap<BlockId, Block>,
    next_id: u32,
    /// Physical start address → blocks compiled there. Multiple entries per
    /// key: the same code compiled under different virtual mappings or modes.
    block_map: HashMap<u64, Vec<BlockId>>,
    /// Target effective address → blocks carrying an exit edge to it.
    /// Non-owning back-references, kept consistent with every `exits` list.
    links_to: HashMap<u64, HashSet<BlockId>>,
    /// Range bucket base → candidate blocks whose footprint touches it.
    block_range_map: BTreeMap<u64, HashSet<BlockId>>,
    valid_lines: ValidityBitmap,
    fast_table: Vec<Option<BlockId>>,
    fast_mask: usize,
    stats: CacheStats,
}

impl BlockCache {
    pub fn new(config: &CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            blocks: HashMap::new(),
            next_id: 0,
            block_map: HashMap::new(),
            links_to: HashMap::new(),
            block_range_map: BTreeMap::new(),
            valid_lines: ValidityBitmap::new(config.valid_window_base, config.valid_window_size),
            fast_table: vec![None; config.fast_table_entries],
            fast_mask: config.fast_table_entries - 1,
            stats: CacheStats::default(),
        })
    }

    /// Bring the subsystem up: register the profiler and start empty.
    pub fn init(&mut self, backend: &mut dyn CodeBackend, profiler: &mut dyn CodeProfiler) {
        profiler.init();
        self.clear(backend);
    }

    /// Tear the subsystem down.
    pub fn shutdown(&self, profiler: &mut dyn CodeProfiler) {
        profiler.shutdown();
    }

    /// Shut down and re-initialize, re-registering the profiler.
    pub fn reset(&mut self, backend: &mut dyn CodeBackend, profiler: &mut dyn CodeProfiler) {
        self.shutdown(profiler);
        self.init(backend, profiler);
    }

    /// Number of live blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(&id)
    }

    /// Mutable access for the code generator to fill in entries, code size
    /// and exit edges between allocation and finalization.
    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(&id)
    }

    /// Visit every live block (debugger walks, statistics).
    pub fn for_each_block(&self, mut f: impl FnMut(&Block)) {
        for block in self.blocks.values() {
            f(block);
        }
    }

    /// Translate an effective address under the given mode bits. With
    /// instruction translation off the address is already physical.
    fn translate_for_mode(
        &self,
        address: u64,
        mode_bits: u32,
        xlat: &dyn AddressTranslator,
    ) -> Option<u64> {
        if mode_bits & MODE_INSN_XLATE != 0 {
            Some(xlat.translate_instruction(address)?.physical)
        } else {
            Some(address)
        }
    }

    #[inline]
    fn fast_index_for(&self, address: u64) -> usize {
        ((address >> INSN_ALIGN_SHIFT) as usize) & self.fast_mask
    }

    /// Create a block for the code starting at `effective_address`.
    ///
    /// Returns `None` only when translation is undefined for the address.
    /// Does not deduplicate: callers check [`Self::get_block_from_start_address`]
    /// first, or they get two live entries for the same pair.
    pub fn allocate_block(
        &mut self,
        effective_address: u64,
        mode_bits: u32,
        xlat: &dyn AddressTranslator,
    ) -> Option<BlockId> {
        let mode_bits = mode_bits & MODE_BITS_MASK;
        let physical_address = self.translate_for_mode(effective_address, mode_bits, xlat)?;

        let id = BlockId(self.next_id);
        self.next_id += 1;
        self.blocks
            .insert(id, Block::new(effective_address, physical_address, mode_bits));
        self.block_map.entry(physical_address).or_default().push(id);
        Some(id)
    }

    /// Publish a block: assign its footprint, install it in the fast table,
    /// mark covered cache lines, register range buckets, optionally link,
    /// and report the region to the profiler.
    pub fn finalize_block(
        &mut self,
        id: BlockId,
        link: bool,
        physical_footprint: BTreeSet<u64>,
        xlat: &dyn AddressTranslator,
        backend: &mut dyn CodeBackend,
        profiler: &mut dyn CodeProfiler,
    ) {
        let (effective, physical, checked_entry, code_size) = match self.blocks.get(&id) {
            Some(b) => (
                b.effective_address,
                b.physical_address,
                b.checked_entry,
                b.code_size,
            ),
            None => {
                debug_assert!(false, "finalize of unknown block {id:?}");
                return;
            }
        };

        let index = self.fast_index_for(effective);
        self.install_fast_slot(index, id);

        for &addr in &physical_footprint {
            self.valid_lines.set(addr);
            self.block_range_map
                .entry(addr & RANGE_BUCKET_MASK)
                .or_default()
                .insert(id);
        }
        if let Some(b) = self.blocks.get_mut(&id) {
            b.physical_footprint = physical_footprint;
        }

        if link {
            // Every edge goes into the reverse map up front, resolved or
            // not: a target finalized later must be able to find us.
            let targets: Vec<u64> = self.blocks[&id].exits.iter().map(|e| e.target).collect();
            for target in targets {
                self.links_to.entry(target).or_default().insert(id);
            }
            self.link_block(id, xlat, backend);
        }

        if profiler.enabled() {
            let label = match profiler.symbol_at(effective) {
                Some(symbol) => format!("DBT_{}_{:08x}", symbol, physical),
                None => format!("DBT_{:08x}", physical),
            };
            profiler.register_region(checked_entry, code_size, &label);
        }
    }

    /// Exact (effective address, mode) lookup through the block index.
    ///
    /// Translation failure yields `None`; the caller owns the fault path.
    pub fn get_block_from_start_address(
        &self,
        address: u64,
        mode_bits: u32,
        xlat: &dyn AddressTranslator,
    ) -> Option<BlockId> {
        let mode_bits = mode_bits & MODE_BITS_MASK;
        let translated = self.translate_for_mode(address, mode_bits, xlat)?;
        let bucket = self.block_map.get(&translated)?;
        bucket.iter().copied().find(|id| {
            self.blocks.get(id).is_some_and(|b| {
                b.effective_address == address && b.mode_bits == mode_bits
            })
        })
    }

    /// Steady-state dispatch. A fast-table hit is O(1) and translation-free;
    /// a stale or empty slot falls back to the block index and repopulates
    /// the slot. `None` means no compiled block exists and the caller must
    /// invoke the code generator for `pc`.
    pub fn dispatch(
        &mut self,
        pc: u64,
        mode_bits: u32,
        xlat: &dyn AddressTranslator,
    ) -> Option<CodePtr> {
        let mode_bits = mode_bits & MODE_BITS_MASK;
        let index = self.fast_index_for(pc);
        if let Some(id) = self.fast_table[index] {
            if let Some(b) = self.blocks.get(&id) {
                if b.effective_address == pc && b.mode_bits == mode_bits {
                    self.stats.hits += 1;
                    return Some(b.direct_entry);
                }
            }
        }

        self.stats.misses += 1;
        let id = self.move_block_into_fast_cache(pc, mode_bits, xlat)?;
        self.blocks.get(&id).map(|b| b.direct_entry)
    }

    /// Refill the fast table after a dispatch miss: drop the block's old
    /// slot, evict whichever block holds the new one, install.
    fn move_block_into_fast_cache(
        &mut self,
        address: u64,
        mode_bits: u32,
        xlat: &dyn AddressTranslator,
    ) -> Option<BlockId> {
        let id = self.get_block_from_start_address(address, mode_bits, xlat)?;

        if let Some(old) = self.blocks.get(&id).and_then(|b| b.fast_index) {
            if self.fast_table[old] == Some(id) {
                self.fast_table[old] = None;
            }
        }
        let index = self.fast_index_for(address);
        self.install_fast_slot(index, id);
        Some(id)
    }

    /// Point `fast_table[index]` at `id`, clearing the evicted occupant's
    /// back-reference. Eviction is always safe: the table is a cache, not a
    /// source of truth.
    fn install_fast_slot(&mut self, index: usize, id: BlockId) {
        if let Some(prev) = self.fast_table[index] {
            if prev != id {
                if let Some(pb) = self.blocks.get_mut(&prev) {
                    pb.fast_index = None;
                }
            }
        }
        self.fast_table[index] = Some(id);
        if let Some(b) = self.blocks.get_mut(&id) {
            b.fast_index = Some(index);
        }
    }

    /// Resolve this block's own unresolved exits whose targets now have a
    /// compiled same-mode block.
    pub fn link_block_exits(
        &mut self,
        id: BlockId,
        xlat: &dyn AddressTranslator,
        backend: &mut dyn CodeBackend,
    ) {
        let Some(mode_bits) = self.blocks.get(&id).map(|b| b.mode_bits) else {
            return;
        };
        let pending: Vec<(usize, u64)> = self.blocks[&id]
            .exits
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.resolved)
            .map(|(i, e)| (i, e.target))
            .collect();

        for (i, target) in pending {
            let Some(dest) = self.get_block_from_start_address(target, mode_bits, xlat) else {
                continue;
            };
            let direct = self.blocks[&dest].direct_entry;
            if let Some(b) = self.blocks.get_mut(&id) {
                let edge = &mut b.exits[i];
                backend.patch_exit(edge.patch, ExitTarget::Direct(direct));
                edge.resolved = true;
            }
        }
    }

    /// Bidirectional linking: resolve this block's exits, then re-resolve
    /// every same-mode block whose exit targets this block's start address.
    /// O(edges to this address), not a global rescan.
    pub fn link_block(
        &mut self,
        id: BlockId,
        xlat: &dyn AddressTranslator,
        backend: &mut dyn CodeBackend,
    ) {
        self.link_block_exits(id, xlat, backend);

        let Some((effective, mode_bits)) = self
            .blocks
            .get(&id)
            .map(|b| (b.effective_address, b.mode_bits))
        else {
            return;
        };
        let Some(sources) = self.links_to.get(&effective) else {
            return;
        };
        let sources: Vec<BlockId> = sources.iter().copied().collect();
        for source in sources {
            if self.blocks.get(&source).map(|b| b.mode_bits) == Some(mode_bits) {
                self.link_block_exits(source, xlat, backend);
            }
        }
    }

    /// Revert every exit of this block to the dispatcher form, and every
    /// same-mode edge in other blocks that targets it. Must run before the
    /// block's code memory can be reclaimed; a surviving direct link would
    /// jump into freed memory.
    pub fn unlink_block(&mut self, id: BlockId, backend: &mut dyn CodeBackend) {
        let Some((effective, mode_bits)) = self
            .blocks
            .get(&id)
            .map(|b| (b.effective_address, b.mode_bits))
        else {
            return;
        };

        if let Some(b) = self.blocks.get_mut(&id) {
            for edge in &mut b.exits {
                backend.patch_exit(edge.patch, ExitTarget::Dispatcher);
                edge.resolved = false;
            }
        }

        let Some(sources) = self.links_to.get(&effective) else {
            return;
        };
        let sources: Vec<BlockId> = sources.iter().copied().collect();
        for source in sources {
            if source == id {
                continue; // own exits already reverted
            }
            let Some(sb) = self.blocks.get_mut(&source) else {
                continue;
            };
            if sb.mode_bits != mode_bits {
                continue;
            }
            for edge in &mut sb.exits {
                if edge.target == effective {
                    backend.patch_exit(edge.patch, ExitTarget::Dispatcher);
                    edge.resolved = false;
                }
            }
        }
    }

    /// Detach a block from the fast table, the link graph and the backend.
    /// Arena and index removal stay with the caller, which knows which
    /// bucket walk is in progress.
    fn destroy_block(&mut self, id: BlockId, backend: &mut dyn CodeBackend) {
        let Some(fast_index) = self.blocks.get(&id).map(|b| b.fast_index) else {
            debug_assert!(false, "destroy of unknown block {id:?}");
            return;
        };
        if let Some(index) = fast_index {
            if self.fast_table[index] == Some(id) {
                self.fast_table[index] = None;
            }
        }

        self.unlink_block(id, backend);

        let targets: Vec<u64> = self.blocks[&id].exits.iter().map(|e| e.target).collect();
        for target in targets {
            if let Some(set) = self.links_to.get_mut(&target) {
                set.remove(&id);
                if set.is_empty() {
                    self.links_to.remove(&target);
                }
            }
        }

        let b = &self.blocks[&id];
        backend.on_block_destroyed(b.effective_address, b.checked_entry);
    }

    /// Remove one block completely (external eviction policy hook).
    pub fn evict_block(&mut self, id: BlockId, backend: &mut dyn CodeBackend) {
        if !self.blocks.contains_key(&id) {
            return;
        }
        self.destroy_block(id, backend);
        self.deregister_range_buckets(id, None);
        let physical = self.blocks[&id].physical_address;
        self.remove_from_block_map(id, physical);
        self.blocks.remove(&id);
    }

    fn remove_from_block_map(&mut self, id: BlockId, physical_address: u64) {
        if let Some(bucket) = self.block_map.get_mut(&physical_address) {
            if let Some(pos) = bucket.iter().position(|&b| b == id) {
                bucket.swap_remove(pos);
            }
            if bucket.is_empty() {
                self.block_map.remove(&physical_address);
            }
        }
    }

    /// Drop the block from every range bucket its footprint touches except
    /// `keep`, removing buckets that become empty.
    fn deregister_range_buckets(&mut self, id: BlockId, keep: Option<u64>) {
        let Some(block) = self.blocks.get(&id) else {
            return;
        };
        let buckets: BTreeSet<u64> = block
            .physical_footprint
            .iter()
            .map(|&addr| addr & RANGE_BUCKET_MASK)
            .collect();
        for key in buckets {
            if Some(key) == keep {
                continue;
            }
            if let Some(set) = self.block_range_map.get_mut(&key) {
                set.remove(&id);
                if set.is_empty() {
                    self.block_range_map.remove(&key);
                }
            }
        }
    }

    /// Invalidate a single alignment-rounded cache line. Wrapper for the
    /// self-check stores guests issue after writing code.
    pub fn invalidate_icache_line(
        &mut self,
        address: u64,
        xlat: &dyn AddressTranslator,
        backend: &mut dyn CodeBackend,
    ) {
        let line_address = address & !(CACHE_LINE_SIZE - 1);
        if let Some(t) = xlat.translate_instruction(line_address) {
            self.invalidate_physical(t.physical, line_address, CACHE_LINE_SIZE, false, backend);
        }
    }

    /// Invalidate a virtual range, splitting it at translation-unit
    /// boundaries: each chunk may map to a different physical region, and
    /// the boundary granularity depends on which mechanism translated it.
    /// Untranslatable chunks are skipped; code that was never resident need
    /// not be invalidated.
    pub fn invalidate_icache(
        &mut self,
        initial_address: u64,
        initial_length: u64,
        forced: bool,
        xlat: &dyn AddressTranslator,
        backend: &mut dyn CodeBackend,
    ) {
        let mut address = initial_address;
        let mut length = initial_length;
        while length > 0 {
            let translated = xlat.translate_instruction(address);

            let shift = translated.map_or(crate::translate::PAGE_SHIFT, |t| t.granularity.shift());
            let mask = !((1u64 << shift) - 1);
            let first_address = address;
            let last_address = address + (length - 1);
            if first_address & mask == last_address & mask {
                if let Some(t) = translated {
                    self.invalidate_physical(t.physical, address, length, forced, backend);
                }
                return;
            }

            let end_of_unit = (first_address + (1u64 << shift)) & mask;
            let length_this_unit = end_of_unit - first_address;
            if let Some(t) = translated {
                self.invalidate_physical(t.physical, address, length_this_unit, forced, backend);
            }
            address += length_this_unit;
            length -= length_this_unit;
        }
    }

    /// Invalidate one translated chunk.
    ///
    /// Exact-line regime: a clear validity bit proves nothing occupies the
    /// line and skips all further work. Longer ranges clear every fully
    /// covered line's bit unconditionally and always proceed to destroy.
    fn invalidate_physical(
        &mut self,
        physical_address: u64,
        virtual_address: u64,
        length: u64,
        forced: bool,
        backend: &mut dyn CodeBackend,
    ) {
        self.stats.invalidations += 1;

        let mut destroy = true;
        if length == CACHE_LINE_SIZE && physical_address & (CACHE_LINE_SIZE - 1) == 0 {
            if !self.valid_lines.test(physical_address) {
                destroy = false;
            } else {
                self.valid_lines.clear(physical_address);
            }
        } else if length > CACHE_LINE_SIZE {
            let mut line = (physical_address + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1);
            let end = (physical_address + length) & !(CACHE_LINE_SIZE - 1);
            while line < end {
                self.valid_lines.clear(line);
                line += CACHE_LINE_SIZE;
            }
        }

        if destroy {
            self.erase_physical_range(physical_address, length, backend);

            // A genuine code modification also invalidates any per-address
            // hints the backend recorded for the old instructions. A forced
            // (administrative) flush leaves them; the code is unchanged.
            if !forced {
                let mut slot = virtual_address;
                let end = virtual_address.saturating_add(length);
                while slot < end {
                    backend.purge_hint(slot);
                    slot += 4;
                }
            }
        }
    }

    /// Destroy every block whose exact footprint overlaps the physical
    /// range, using the range buckets to bound the candidate set.
    pub fn erase_physical_range(
        &mut self,
        address: u64,
        length: u64,
        backend: &mut dyn CodeBackend,
    ) {
        let start_key = address & RANGE_BUCKET_MASK;
        let end = address.saturating_add(length);
        let bucket_keys: Vec<u64> = self
            .block_range_map
            .range(start_key..end)
            .map(|(&key, _)| key)
            .collect();

        for key in bucket_keys {
            let candidates: Vec<BlockId> = match self.block_range_map.get(&key) {
                Some(set) => set.iter().copied().collect(),
                None => continue,
            };
            for id in candidates {
                let overlaps = self
                    .blocks
                    .get(&id)
                    .is_some_and(|b| b.overlaps_physical_range(address, length));
                if !overlaps {
                    continue;
                }

                // Clear every other bucket registration before the block
                // goes away, so no bucket keeps a dangling candidate.
                self.deregister_range_buckets(id, Some(key));
                self.destroy_block(id, backend);
                let physical = self.blocks[&id].physical_address;
                self.remove_from_block_map(id, physical);
                self.blocks.remove(&id);
                if let Some(set) = self.block_range_map.get_mut(&key) {
                    set.remove(&id);
                }
            }
            if self.block_range_map.get(&key).is_some_and(|s| s.is_empty()) {
                self.block_range_map.remove(&key);
            }
        }
    }

    /// Destroy every block and empty every index. Full-cache flush: cache
    /// exhaustion, save-state load, mode-wide assumption changes.
    pub fn clear(&mut self, backend: &mut dyn CodeBackend) {
        if !self.blocks.is_empty() {
            log::debug!("[BlockCache] clearing {} blocks", self.blocks.len());
        }
        backend.purge_all_hints();

        let ids: Vec<BlockId> = self.blocks.keys().copied().collect();
        for id in ids {
            self.destroy_block(id, backend);
        }
        self.blocks.clear();
        self.block_map.clear();
        self.links_to.clear();
        self.block_range_map.clear();
        self.valid_lines.clear_all();
        self.fast_table.fill(None);
        self.stats = CacheStats::default();
    }
}
