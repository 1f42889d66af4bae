//! Assignment of file ranks to reader ranks when their counts differ.
//!
//! File ranks are handed out as contiguous runs in file order.  A file rank
//! goes to the reader whose share of the total element count contains the
//! rank's midpoint, so readers receive roughly equal numbers of elements
//! whatever the ratio between file and reader ranks.  Empty files fall back
//! to an equal split by rank count.

use std::ops::Range;

/// Reader that file rank `j` is assigned to.
fn owner(prefix: u64, nelems: u64, total: u64, readers: usize) -> usize {
    let mid = u128::from(prefix) * 2 + u128::from(nelems);
    let slot = mid * readers as u128 / (u128::from(total) * 2);
    (slot as usize).min(readers - 1)
}

/// File ranks assigned to `reader` out of `readers`, given the element count
/// of every file rank.  The result is a contiguous, possibly empty, range;
/// across all readers the ranges partition `0..counts.len()` in order.
pub fn source_ranks(counts: &[u64], reader: usize, readers: usize) -> Range<usize> {
    let nranks = counts.len();
    if readers == 0 || reader >= readers {
        return 0..0;
    }
    let total: u64 = counts.iter().fold(0u64, |a, &c| a.saturating_add(c));
    if total == 0 {
        let lo = reader * nranks / readers;
        let hi = (reader + 1) * nranks / readers;
        return lo..hi;
    }

    let mut lo = None;
    let mut hi = 0;
    let mut prefix = 0u64;
    for (j, &n) in counts.iter().enumerate() {
        let who = owner(prefix, n, total, readers);
        if who == reader {
            lo.get_or_insert(j);
            hi = j + 1;
        } else if who > reader {
            break;
        }
        prefix = prefix.saturating_add(n);
    }
    match lo {
        Some(lo) => lo..hi,
        None => 0..0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn all(counts: &[u64], readers: usize) -> Vec<Range<usize>> {
        (0..readers).map(|r| source_ranks(counts, r, readers)).collect()
    }

    #[test]
    fn four_equal_ranks_over_two_readers() {
        assert_eq!(all(&[250_000; 4], 2), vec![0..2, 2..4]);
    }

    #[test]
    fn more_readers_than_file_ranks_leaves_some_idle() {
        let ranges = all(&[10, 10], 5);
        let covered: Vec<usize> = ranges.iter().flat_map(|r| r.clone()).collect();
        assert_eq!(covered, vec![0, 1]);
        assert_eq!(ranges.iter().filter(|r| r.is_empty()).count(), 3);
    }

    #[test]
    fn heavy_rank_is_not_split() {
        assert_eq!(all(&[1, 1, 1000, 1], 2), vec![0..2, 2..4]);
    }

    #[test]
    fn empty_file_splits_by_rank_count() {
        assert_eq!(all(&[0; 6], 4), vec![0..1, 1..3, 3..4, 4..6]);
    }

    #[test]
    fn out_of_range_reader_gets_nothing() {
        assert_eq!(source_ranks(&[5, 5], 2, 2), 0..0);
    }

    proptest! {
        #[test]
        fn ranges_partition_the_file_in_order(
            counts in prop::collection::vec(0u64..10_000, 0..40),
            readers in 1usize..16,
        ) {
            let ranges = all(&counts, readers);
            let mut next = 0;
            for r in &ranges {
                if r.is_empty() {
                    continue;
                }
                prop_assert_eq!(r.start, next);
                next = r.end;
            }
            prop_assert_eq!(next, counts.len());
        }

        #[test]
        fn equal_counts_balance_within_one_rank(
            per_rank in 1u64..1000,
            nranks in 1usize..64,
            readers in 1usize..16,
        ) {
            let counts = vec![per_rank; nranks];
            for r in all(&counts, readers) {
                let got = r.len();
                prop_assert!(got <= nranks / readers + 1);
                prop_assert!(got + 1 >= nranks / readers);
            }
        }
    }
}
