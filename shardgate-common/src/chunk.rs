//! Chunk sizing.

/// Chunk count used when a caller does not ask for one.
pub const DEFAULT_CHUNK_COUNT: u32 = 6;

/// Upper bound on chunks per file accepted from callers.
pub const MAX_CHUNK_COUNT: u32 = 4096;

/// Split `size_bytes` into `chunk_count` contiguous lengths.
///
/// The first `size_bytes % chunk_count` chunks are one byte longer than the rest, so the
/// lengths always sum to `size_bytes` and differ by at most one. A zero chunk count yields
/// an empty plan.
pub fn split(size_bytes: u64, chunk_count: u32) -> Vec<u64> {
    if chunk_count == 0 {
        return Vec::new();
    }
    let count = u64::from(chunk_count);
    let base = size_bytes / count;
    let remainder = size_bytes % count;

    (0..count)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_even() {
        assert_eq!(split(600, 6), vec![100; 6]);
    }

    #[test]
    fn test_split_remainder_goes_first() {
        assert_eq!(split(601, 6), vec![101, 100, 100, 100, 100, 100]);
        assert_eq!(split(5, 6), vec![1, 1, 1, 1, 1, 0]);
    }

    #[test]
    fn test_split_empty_file() {
        assert_eq!(split(0, 6), vec![0; 6]);
    }

    #[test]
    fn test_split_zero_chunks() {
        assert!(split(100, 0).is_empty());
    }

    #[test]
    fn test_split_properties() {
        let sizes = [0u64, 1, 2, 5, 7, 99, 100, 101, 4095, 65_537, 104_857_601, u64::MAX];
        for &size in &sizes {
            for count in 1..=64u32 {
                let plan = split(size, count);
                assert_eq!(plan.len(), count as usize);
                assert_eq!(plan.iter().map(|&l| l as u128).sum::<u128>(), size as u128);
                let max = *plan.iter().max().unwrap();
                let min = *plan.iter().min().unwrap();
                assert!(max - min <= 1, "size={size} count={count}");
            }
        }
    }
}
