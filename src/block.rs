//! Compiled-block representation.
//!
//! A block is one translated unit of guest code. Its identity inside the
//! block index is the physical start address; several live blocks may share
//! that key when the same code is reached through different virtual mappings
//! or translation modes.

use std::collections::BTreeSet;

use crate::backend::{CodePtr, PatchHandle};

/// Translation-mode bit: instruction address translation enabled.
pub const MODE_INSN_XLATE: u32 = 1 << 0;
/// Translation-mode bit: data address translation enabled.
pub const MODE_DATA_XLATE: u32 = 1 << 1;
/// Machine-state bits that select a distinct compiled variant. Two blocks at
/// the same address with different masked bits are separate cache entries.
pub const MODE_BITS_MASK: u32 = MODE_INSN_XLATE | MODE_DATA_XLATE;

/// Stable handle to a block in the cache. Valid until the block is destroyed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct BlockId(pub(crate) u32);

/// One patchable control transfer out of a block.
#[derive(Clone, Debug)]
pub struct ExitEdge {
    /// Effective address the exit transfers to.
    pub target: u64,
    /// Whether the exit is currently patched straight into another block.
    pub resolved: bool,
    /// Backend-owned handle naming the patch site in the emitted code.
    pub patch: PatchHandle,
}

/// A compiled unit of guest code, tracked by every cache index.
pub struct Block {
    /// Guest virtual address where execution begins.
    pub effective_address: u64,
    /// Physical start address; the block's key in the block index.
    pub physical_address: u64,
    /// Masked translation-mode bits this block was compiled under.
    pub mode_bits: u32,
    /// Entry that re-validates the mode bits before running.
    pub checked_entry: CodePtr,
    /// Entry that assumes the caller already proved the mode match.
    pub direct_entry: CodePtr,
    /// Byte length of the emitted code; used for profiler registration only.
    pub code_size: u32,
    /// Exact set of physical addresses the source bytes span. May cross
    /// translation-unit boundaries; authoritative for overlap tests.
    pub physical_footprint: BTreeSet<u64>,
    /// Exit edges, in emission order.
    pub exits: Vec<ExitEdge>,
    /// Fast-dispatch slot this block currently owns, if any.
    pub fast_index: Option<usize>,
}

impl Block {
    pub(crate) fn new(effective_address: u64, physical_address: u64, mode_bits: u32) -> Self {
        Self {
            effective_address,
            physical_address,
            mode_bits: mode_bits & MODE_BITS_MASK,
            checked_entry: CodePtr::default(),
            direct_entry: CodePtr::default(),
            code_size: 0,
            physical_footprint: BTreeSet::new(),
            exits: Vec::new(),
            fast_index: None,
        }
    }

    /// Record an exit edge. Called by the code generator between allocation
    /// and finalization.
    pub fn add_exit(&mut self, target: u64, patch: PatchHandle) {
        self.exits.push(ExitEdge {
            target,
            resolved: false,
            patch,
        });
    }

    /// Exact overlap test against the physical range `[address, address+length)`.
    #[inline]
    pub fn overlaps_physical_range(&self, address: u64, length: u64) -> bool {
        self.physical_footprint
            .range(address..address.saturating_add(length))
            .next()
            .is_some()
    }
}
