//! Small helpers shared by the scheduler and the multi-version memory.

use crate::types::{TxnIndex, Wave};
use std::cmp::Ordering;

const TXN_IDX_MASK: u64 = (1 << 32) - 1;

/// Packs a validation index and its wave into one word so both can be advanced with a
/// single compare-and-swap. The index lives in the low half.
#[inline]
pub fn pack_validation_idx(txn_idx: TxnIndex, wave: Wave) -> u64 {
    (u64::from(wave) << 32) | u64::from(txn_idx)
}

#[inline]
pub fn unpack_validation_idx(packed: u64) -> (TxnIndex, Wave) {
    ((packed & TXN_IDX_MASK) as TxnIndex, (packed >> 32) as Wave)
}

/// Compares two sorted, de-duplicated lists.
///
/// Returns the items only present in `new` and the items only present in `old`.
pub fn diff_ordered_list<'a, T: Ord>(old: &'a [T], new: &'a [T]) -> (Vec<&'a T>, Vec<&'a T>) {
    let (mut added, mut removed) = (Vec::new(), Vec::new());
    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        match old[i].cmp(&new[j]) {
            Ordering::Less => {
                removed.push(&old[i]);
                i += 1;
            }
            Ordering::Greater => {
                added.push(&new[j]);
                j += 1;
            }
            Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    removed.extend(&old[i..]);
    added.extend(&new[j..]);
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_pack_unpack() {
        assert_eq!(unpack_validation_idx(pack_validation_idx(0, 0)), (0, 0));
        assert_eq!(unpack_validation_idx(pack_validation_idx(7, 3)), (7, 3));
        assert_eq!(
            unpack_validation_idx(pack_validation_idx(u32::MAX, u32::MAX)),
            (u32::MAX, u32::MAX)
        );
        // A higher wave never changes the index half.
        assert_eq!(pack_validation_idx(5, 1) & TXN_IDX_MASK, 5);
    }

    #[test]
    fn test_diff_ordered_list() {
        let old = vec![1, 3, 5, 7];
        let new = vec![2, 3, 7, 9];
        let (added, removed) = diff_ordered_list(&old, &new);
        assert_eq!(added, vec![&2, &9]);
        assert_eq!(removed, vec![&1, &5]);

        let (added, removed) = diff_ordered_list::<u8>(&[], &[]);
        assert!(added.is_empty() && removed.is_empty());
    }

    proptest! {
        #[test]
        fn test_diff_matches_set_difference(
            old in proptest::collection::btree_set(0u16..64, 0..32),
            new in proptest::collection::btree_set(0u16..64, 0..32),
        ) {
            let old_list: Vec<_> = old.iter().copied().collect();
            let new_list: Vec<_> = new.iter().copied().collect();
            let (added, removed) = diff_ordered_list(&old_list, &new_list);

            let expected_added: BTreeSet<_> = new.difference(&old).collect();
            let expected_removed: BTreeSet<_> = old.difference(&new).collect();
            prop_assert_eq!(added.into_iter().collect::<BTreeSet<_>>(), expected_added);
            prop_assert_eq!(removed.into_iter().collect::<BTreeSet<_>>(), expected_removed);
        }
    }
}
