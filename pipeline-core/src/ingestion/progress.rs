//! Pure progress-percentage calculations, kept apart from the async
//! ingestion loop so the mapping is unit-testable without a runtime.
//!
//! All arithmetic is integer-only (the workspace denies `clippy::float_arithmetic`):
//! `⌊(i+1)/N · 65⌋` becomes `((i+1) * 65) / N`, which is exact since both
//! operands are non-negative integers.

/// Progress percent reported once a source is registered (or confirmed
/// already registered) with its handler.
pub const REGISTRATION: u8 = 10;

/// Progress percent reported once document discovery completes.
pub const DISCOVERY: u8 = 25;

/// Progress percent reported once per-document processing is done and
/// cleanup is about to run.
pub const FINALIZE: u8 = 95;

/// Progress percent reported once a run is fully complete.
pub const COMPLETE: u8 = 100;

/// Percent for the `(index + 1)`-th of `total` documents processed,
/// following `25 + ⌊(i+1)/N · 65⌋`.
#[must_use]
pub fn per_document(index: usize, total: usize) -> u8 {
    if total == 0 {
        return DISCOVERY;
    }
    let numerator = u64::try_from(index + 1).unwrap_or(u64::MAX).saturating_mul(65);
    let denominator = u64::try_from(total).unwrap_or(1).max(1);
    let fraction = numerator / denominator;
    DISCOVERY.saturating_add(u8::try_from(fraction).unwrap_or(u8::MAX))
}

/// Percent for source `index` of `total` in a batch run, scaling an inner
/// single-source percent (`0..=100`) into that source's slot:
/// `⌊(i·100 + inner)/N⌋`.
#[must_use]
pub fn batch_slot(index: usize, total: usize, inner: u8) -> u8 {
    if total == 0 {
        return inner;
    }
    let index = u64::try_from(index).unwrap_or(0);
    let total = u64::try_from(total).unwrap_or(1).max(1);
    let numerator = index.saturating_mul(100).saturating_add(u64::from(inner));
    let percent = numerator / total;
    u8::try_from(percent.min(100)).unwrap_or(100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_document_follows_the_fixed_mapping() {
        assert_eq!(per_document(0, 4), 25 + (65 / 4));
        assert_eq!(per_document(3, 4), 25 + 65);
    }

    #[test]
    fn per_document_never_exceeds_finalize_threshold() {
        for total in 1..=20usize {
            for index in 0..total {
                assert!(per_document(index, total) <= FINALIZE);
            }
        }
    }

    #[test]
    fn batch_slot_spans_the_full_range_across_sources() {
        assert_eq!(batch_slot(0, 2, 0), 0);
        assert_eq!(batch_slot(1, 2, 100), 100);
    }

    #[test]
    fn batch_slot_is_monotonic_within_a_source() {
        let mut previous = batch_slot(1, 3, 0);
        for inner in 1..=100u8 {
            let current = batch_slot(1, 3, inner);
            assert!(current >= previous);
            previous = current;
        }
    }
}
