//! Boundary with the guest address translator.
//!
//! The cache only needs instruction-address translation and the granularity
//! of the mapping that satisfied it: invalidation clips virtual ranges at
//! translation-unit boundaries, and a coarse (superpage) mapping allows much
//! larger chunks per step than a fine (base page) one.

/// Fine page shift (4 KiB base pages).
pub const PAGE_SHIFT: u32 = 12;
/// Coarse page shift (2 MiB superpages).
pub const COARSE_PAGE_SHIFT: u32 = 21;

/// Which mapping granularity satisfied a translation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TranslateGranularity {
    /// Base page (4 KiB).
    Fine,
    /// Superpage (2 MiB).
    Coarse,
}

impl TranslateGranularity {
    /// Shift of the translation-unit size for this granularity.
    #[inline]
    pub const fn shift(self) -> u32 {
        match self {
            TranslateGranularity::Fine => PAGE_SHIFT,
            TranslateGranularity::Coarse => COARSE_PAGE_SHIFT,
        }
    }
}

/// A successful instruction-address translation.
#[derive(Clone, Copy, Debug)]
pub struct Translation {
    /// Translated physical address.
    pub physical: u64,
    /// Granularity of the mapping used.
    pub granularity: TranslateGranularity,
}

/// Guest virtual → physical translation for instruction fetches.
///
/// Implementations are expected to reflect the guest's current translation
/// state; `None` means no mapping exists for the address (the caller treats
/// the address as untranslatable, never as an error).
pub trait AddressTranslator {
    fn translate_instruction(&self, virtual_address: u64) -> Option<Translation>;
}

/// Identity translation for guests running with address translation off.
///
/// Reports fine granularity so range invalidation still advances in page
/// sized steps.
pub struct BareTranslator;

impl AddressTranslator for BareTranslator {
    #[inline]
    fn translate_instruction(&self, virtual_address: u64) -> Option<Translation> {
        Some(Translation {
            physical: virtual_address,
            granularity: TranslateGranularity::Fine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_translator_is_identity() {
        let t = BareTranslator;
        let r = t.translate_instruction(0x8000_1234).unwrap();
        assert_eq!(r.physical, 0x8000_1234);
        assert_eq!(r.granularity, TranslateGranularity::Fine);
    }

    #[test]
    fn test_granularity_shifts() {
        assert_eq!(TranslateGranularity::Fine.shift(), PAGE_SHIFT);
        assert_eq!(TranslateGranularity::Coarse.shift(), COARSE_PAGE_SHIFT);
    }
}
