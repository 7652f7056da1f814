//! Conservative per-cache-line occupancy bitmap.
//!
//! One bit per guest instruction-cache line over a fixed physical window.
//! A set bit means "a block may occupy this line"; a clear bit means
//! "definitely no block here" and lets single-line invalidation skip all
//! further work. Addresses outside the window always read as occupied, so
//! the bitmap never under-approximates.

/// Guest instruction-cache line size in bytes.
pub const CACHE_LINE_SIZE: u64 = 32;
/// Shift of [`CACHE_LINE_SIZE`].
pub const CACHE_LINE_SHIFT: u32 = 5;

pub struct ValidityBitmap {
    base: u64,
    lines: usize,
    words: Vec<u64>,
}

impl ValidityBitmap {
    /// Create a bitmap covering `[window_base, window_base + window_size)`.
    /// `window_size` must be cache-line aligned.
    pub fn new(window_base: u64, window_size: u64) -> Self {
        debug_assert_eq!(window_size & (CACHE_LINE_SIZE - 1), 0);
        let lines = (window_size >> CACHE_LINE_SHIFT) as usize;
        Self {
            base: window_base,
            lines,
            words: vec![0; lines.div_ceil(64)],
        }
    }

    /// Line index for a physical address, or `None` outside the window.
    #[inline]
    fn line_of(&self, physical: u64) -> Option<usize> {
        let off = physical.wrapping_sub(self.base);
        let line = (off >> CACHE_LINE_SHIFT) as usize;
        (physical >= self.base && line < self.lines).then_some(line)
    }

    /// Mark the line containing `physical` as maybe-occupied.
    #[inline]
    pub fn set(&mut self, physical: u64) {
        if let Some(line) = self.line_of(physical) {
            self.words[line / 64] |= 1u64 << (line % 64);
        }
    }

    /// Mark the line containing `physical` as definitely empty.
    #[inline]
    pub fn clear(&mut self, physical: u64) {
        if let Some(line) = self.line_of(physical) {
            self.words[line / 64] &= !(1u64 << (line % 64));
        }
    }

    /// Whether the line containing `physical` may hold a block.
    /// Out-of-window addresses conservatively report `true`.
    #[inline]
    pub fn test(&self, physical: u64) -> bool {
        match self.line_of(physical) {
            Some(line) => self.words[line / 64] & (1u64 << (line % 64)) != 0,
            None => true,
        }
    }

    /// Mark every line definitely empty.
    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }
}
