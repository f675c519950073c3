//! Wave planning
//!
//! Splits an ordered target list into consecutive chunks sized by the
//! concurrency limit. Pure: the plan depends only on `(targets, limit)`.

use crate::error::ChunkError;
use serde::{Deserialize, Serialize};

/// One wave of targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Zero-based wave index
    pub index: usize,
    /// Targets in original order
    pub targets: Vec<String>,
}

impl Chunk {
    /// Number of targets in the wave
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Waves are never empty, but keep clippy honest
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Number of waves needed for `total` targets
#[inline]
#[must_use]
pub fn chunk_count(total: usize, limit: usize) -> usize {
    if limit == 0 {
        0
    } else {
        total.div_ceil(limit)
    }
}

/// Partition `targets` into waves of `limit`
///
/// Every wave but the last holds exactly `limit` targets; the last holds the
/// remainder (or a full wave when the division is exact).
///
/// # Errors
/// `ChunkError::ZeroLimit` when `limit` is zero.
pub fn plan_chunks(targets: &[String], limit: usize) -> Result<Vec<Chunk>, ChunkError> {
    if limit == 0 {
        return Err(ChunkError::ZeroLimit);
    }

    Ok(targets
        .chunks(limit)
        .enumerate()
        .map(|(index, members)| Chunk {
            index,
            targets: members.to_vec(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn targets(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("t{i}")).collect()
    }

    #[test]
    fn five_targets_limit_two() {
        let chunks = plan_chunks(&targets(5), 2).unwrap();
        let sizes: Vec<_> = chunks.iter().map(Chunk::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(chunks[2].targets, vec!["t4".to_string()]);
    }

    #[test]
    fn exact_division_keeps_full_last_chunk() {
        let chunks = plan_chunks(&targets(6), 3).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].len(), 3);
    }

    #[test]
    fn zero_limit_rejected() {
        assert!(matches!(
            plan_chunks(&targets(3), 0),
            Err(ChunkError::ZeroLimit)
        ));
    }

    #[test]
    fn empty_targets_plan_nothing() {
        assert!(plan_chunks(&[], 4).unwrap().is_empty());
        assert_eq!(chunk_count(0, 4), 0);
    }

    proptest! {
        #[test]
        fn prop_chunks_partition_in_order(n in 0usize..200, limit in 1usize..17) {
            let input = targets(n);
            let chunks = plan_chunks(&input, limit).unwrap();

            prop_assert_eq!(chunks.len(), chunk_count(n, limit));

            let flattened: Vec<String> = chunks.iter().flat_map(|c| c.targets.clone()).collect();
            prop_assert_eq!(&flattened, &input);

            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.index, i);
                if i + 1 < chunks.len() {
                    prop_assert_eq!(chunk.len(), limit);
                } else {
                    let expected = if n % limit == 0 { limit } else { n % limit };
                    prop_assert_eq!(chunk.len(), expected);
                }
            }
        }
    }
}
