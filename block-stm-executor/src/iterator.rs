//! Iterators over the multi-version store and the layered merge used by views.

use crate::{
    mvdata::{resolve, OuterSnapshot, ReadResult, Secondary},
    types::{key_beyond, IteratorOptions, Key, TxnIndex, TxnVersion},
};
use std::{cmp::Ordering, iter::Peekable, ops::Bound, sync::Arc};

/// Called with the blocking transaction when an estimate is hit. Returns `false`
/// when the wait was abandoned (cancellation).
pub type WaitFn<'a> = Box<dyn Fn(TxnIndex) -> bool + 'a>;

// ============================================================================
// Multi-version iterator
// ============================================================================

/// Walks the keys of one multi-version store in a range, resolving each key at `txn`.
///
/// Keys with no write below `txn` are skipped. Deletions are yielded as `None` so an
/// outer merge can shadow the base store with them.
///
/// In execution mode (`wait` is set) estimates block on the writer and are then
/// re-resolved. In validation mode an estimate ends the iteration and sets
/// [`MVIterator::read_estimate`].
pub struct MVIterator<'a, V> {
    snapshot: OuterSnapshot<V>,
    options: IteratorOptions,
    /// Inclusive bound in the iteration direction, used when replaying.
    stop: Option<Key>,
    txn: TxnIndex,
    wait: Option<WaitFn<'a>>,
    /// Last key visited.
    cursor: Option<Key>,
    read_estimate: bool,
    done: bool,
}

impl<'a, V: Clone> MVIterator<'a, V> {
    pub fn new(
        snapshot: OuterSnapshot<V>,
        options: IteratorOptions,
        txn: TxnIndex,
        wait: Option<WaitFn<'a>>,
    ) -> Self {
        Self {
            snapshot,
            options,
            stop: None,
            txn,
            wait,
            cursor: None,
            read_estimate: false,
            done: false,
        }
    }

    pub fn with_stop(mut self, stop: Option<Key>) -> Self {
        self.stop = stop;
        self
    }

    /// Whether a validation-mode iteration ran into an estimate.
    pub fn read_estimate(&self) -> bool {
        self.read_estimate
    }

    /// Next outer key after the cursor, in iteration order.
    fn next_key(&self) -> Option<(Key, Arc<Secondary<V>>)> {
        let start = self.options.start.as_deref().map_or(Bound::Unbounded, Bound::Included);
        let end = self.options.end.as_deref().map_or(Bound::Unbounded, Bound::Excluded);
        let cursor = self.cursor.as_deref().map(Bound::Excluded);

        let (lower, upper) = if self.options.ascending {
            (cursor.unwrap_or(start), end)
        } else {
            (start, cursor.unwrap_or(end))
        };
        if range_is_empty(lower, upper) {
            return None;
        }

        let mut range = self.snapshot.range::<_, [u8]>((lower, upper));
        let (key, secondary) = if self.options.ascending {
            range.next()
        } else {
            range.next_back()
        }?;
        Some((key.clone(), secondary.clone()))
    }

    pub fn next_entry(&mut self) -> Option<(Key, TxnVersion, Option<V>)> {
        while !self.done {
            let Some((key, secondary)) = self.next_key() else {
                self.done = true;
                break;
            };
            if let Some(stop) = &self.stop {
                if key_beyond(&key, stop, self.options.ascending) {
                    self.done = true;
                    break;
                }
            }

            loop {
                match resolve(&secondary, self.txn) {
                    ReadResult::Storage => break,
                    ReadResult::Versioned(version, value) => {
                        self.cursor = Some(key.clone());
                        return Some((key, version, value));
                    }
                    ReadResult::Dependency(blocking) => match &self.wait {
                        Some(wait) if wait(blocking) => continue,
                        Some(_) => {
                            self.done = true;
                            return None;
                        }
                        None => {
                            self.read_estimate = true;
                            self.done = true;
                            return None;
                        }
                    }
                }
            }
            self.cursor = Some(key);
        }
        None
    }
}

impl<V: Clone> Iterator for MVIterator<'_, V> {
    type Item = (Key, TxnVersion, Option<V>);

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry()
    }
}

fn range_is_empty(lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}

// ============================================================================
// Merge iterator
// ============================================================================

/// Layers `cache` over `parent`. Both streams must be ordered in the same direction.
///
/// On equal keys the cache entry wins and the parent entry is discarded. Deletions
/// (`None` values) are passed through so further layers can be stacked; the consumer
/// filters them out at the top.
pub struct MergeIterator<P: Iterator, C: Iterator> {
    parent: Peekable<P>,
    cache: Peekable<C>,
    ascending: bool,
}

impl<V, P, C> MergeIterator<P, C>
where
    P: Iterator<Item = (Key, Option<V>)>,
    C: Iterator<Item = (Key, Option<V>)>,
{
    pub fn new(parent: P, cache: C, ascending: bool) -> Self {
        Self {
            parent: parent.peekable(),
            cache: cache.peekable(),
            ascending,
        }
    }
}

impl<V, P, C> Iterator for MergeIterator<P, C>
where
    P: Iterator<Item = (Key, Option<V>)>,
    C: Iterator<Item = (Key, Option<V>)>,
{
    type Item = (Key, Option<V>);

    fn next(&mut self) -> Option<Self::Item> {
        let order = match (self.parent.peek(), self.cache.peek()) {
            (None, None) => return None,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some((parent, _)), Some((cache, _))) if self.ascending => parent.cmp(cache),
            (Some((parent, _)), Some((cache, _))) => cache.cmp(parent),
        };
        match order {
            Ordering::Less => self.parent.next(),
            Ordering::Greater => self.cache.next(),
            Ordering::Equal => {
                self.parent.next();
                self.cache.next()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvdata::MVData;
    use std::cell::Cell;

    fn entries(items: &[(&str, Option<&str>)]) -> Vec<(Key, Option<Vec<u8>>)> {
        items
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.map(|v| v.as_bytes().to_vec())))
            .collect()
    }

    fn flatten(iter: impl Iterator<Item = (Key, Option<Vec<u8>>)>) -> Vec<(String, String)> {
        iter.filter_map(|(k, v)| {
            v.map(|v| (String::from_utf8(k).unwrap(), String::from_utf8(v).unwrap()))
        })
        .collect()
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_merge_cache_shadows_parent() {
        let parent = entries(&[("a", Some("p")), ("b", Some("p")), ("d", Some("p"))]);
        let cache = entries(&[("b", Some("c")), ("c", Some("c")), ("d", None)]);
        let merged = MergeIterator::new(parent.into_iter(), cache.into_iter(), true);
        assert_eq!(flatten(merged), pairs(&[("a", "p"), ("b", "c"), ("c", "c")]));
    }

    #[test]
    fn test_merge_descending() {
        let parent = entries(&[("d", Some("p")), ("b", Some("p")), ("a", Some("p"))]);
        let cache = entries(&[("c", Some("c")), ("b", None)]);
        let merged = MergeIterator::new(parent.into_iter(), cache.into_iter(), false);
        assert_eq!(flatten(merged), pairs(&[("d", "p"), ("c", "c"), ("a", "p")]));
    }

    #[test]
    fn test_merge_three_layers() {
        let base = entries(&[("a", Some("base")), ("b", Some("base"))]);
        let mv = entries(&[("a", None), ("c", Some("mv"))]);
        let writes = entries(&[("a", Some("w")), ("c", None)]);
        let merged = MergeIterator::new(
            MergeIterator::new(base.into_iter(), mv.into_iter(), true),
            writes.into_iter(),
            true,
        );
        assert_eq!(flatten(merged), pairs(&[("a", "w"), ("b", "base")]));
    }

    fn sample() -> MVData<Vec<u8>> {
        let mv = MVData::new();
        mv.write(b"a", Some(b"1".to_vec()), TxnVersion::new(0, 0));
        mv.write(b"b", Some(b"1".to_vec()), TxnVersion::new(0, 0));
        mv.write(b"b", Some(b"2".to_vec()), TxnVersion::new(1, 0));
        mv.write(b"c", None, TxnVersion::new(1, 0));
        mv.write(b"d", Some(b"3".to_vec()), TxnVersion::new(3, 0));
        mv
    }

    #[test]
    fn test_mv_iterator_resolves_versions() {
        let mv = sample();
        let opts = IteratorOptions::new(None, None, true);
        let seen: Vec<_> = MVIterator::new(mv.snapshot(), opts, 2, None)
            .map(|(k, version, v)| (k, version, v.is_some()))
            .collect();
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), TxnVersion::new(0, 0), true),
                (b"b".to_vec(), TxnVersion::new(1, 0), true),
                (b"c".to_vec(), TxnVersion::new(1, 0), false),
            ]
        );
    }

    #[test]
    fn test_mv_iterator_bounds_direction_and_stop() {
        let mv = sample();

        let opts = IteratorOptions::new(Some(b"b".as_slice()), Some(b"d".as_slice()), true);
        let keys: Vec<_> = MVIterator::new(mv.snapshot(), opts, 5, None).map(|e| e.0).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);

        let opts = IteratorOptions::new(None, None, false);
        let keys: Vec<_> = MVIterator::new(mv.snapshot(), opts, 5, None).map(|e| e.0).collect();
        assert_eq!(keys, vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);

        let opts = IteratorOptions::new(None, None, false);
        let keys: Vec<_> = MVIterator::new(mv.snapshot(), opts, 5, None)
            .with_stop(Some(b"c".to_vec()))
            .map(|e| e.0)
            .collect();
        assert_eq!(keys, vec![b"d".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_mv_iterator_validation_mode_estimate() {
        let mv = sample();
        mv.write_estimate(b"b", 1);
        let mut iter =
            MVIterator::new(mv.snapshot(), IteratorOptions::new(None, None, true), 2, None);
        assert_eq!(iter.next().map(|e| e.0), Some(b"a".to_vec()));
        assert!(iter.next().is_none());
        assert!(iter.read_estimate());
    }

    #[test]
    fn test_mv_iterator_execution_mode_waits() {
        let mv = sample();
        mv.write_estimate(b"b", 1);
        let waits = Cell::new(0);
        let wait: WaitFn<'_> = Box::new(|blocking| {
            assert_eq!(blocking, 1);
            waits.set(waits.get() + 1);
            // The writer finishes while we wait.
            mv.write(b"b", Some(b"9".to_vec()), TxnVersion::new(1, 1));
            true
        });

        let seen: Vec<_> =
            MVIterator::new(mv.snapshot(), IteratorOptions::new(None, None, true), 2, Some(wait))
                .map(|(k, version, _)| (k, version))
                .collect();
        assert_eq!(waits.get(), 1);
        assert_eq!(seen[1], (b"b".to_vec(), TxnVersion::new(1, 1)));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_mv_iterator_abandoned_wait() {
        let mv = sample();
        mv.write_estimate(b"a", 0);
        let wait: WaitFn<'_> = Box::new(|_| false);
        let mut iter =
            MVIterator::new(mv.snapshot(), IteratorOptions::new(None, None, true), 2, Some(wait));
        assert!(iter.next().is_none());
        assert!(!iter.read_estimate());
    }
}
