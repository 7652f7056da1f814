//! Boundary with the code generator.
//!
//! The cache never touches emitted machine code itself; every mutation of a
//! code region goes through this trait. The backend owns the patch sites and
//! any address-keyed optimization hints it recorded while emitting code.

/// Address of an entry point inside emitted code.
///
/// Opaque to the cache: it is handed out by `dispatch` and passed back to the
/// backend for direct-link patching, never dereferenced here.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct CodePtr(pub u64);

/// Backend-owned identifier for a patchable exit site inside a block's code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PatchHandle(pub u64);

/// Where a patched exit edge should transfer control.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExitTarget {
    /// Jump straight into another block's direct entry.
    Direct(CodePtr),
    /// Fall back to the generic dispatcher.
    Dispatcher,
}

/// Operations the cache requires from the code generator.
pub trait CodeBackend {
    /// Rewrite the control transfer at `patch` to the given target.
    fn patch_exit(&mut self, patch: PatchHandle, target: ExitTarget);

    /// Called just before a block's indexes are torn down. After this call
    /// the code region must no longer be entered.
    fn on_block_destroyed(&mut self, effective_address: u64, checked_entry: CodePtr);

    /// Drop the optimization hint recorded for one instruction slot, if any.
    /// Called for every 4-byte slot of a genuinely modified code range.
    fn purge_hint(&mut self, address: u64);

    /// Drop every recorded optimization hint (full cache clear).
    fn purge_all_hints(&mut self);
}
