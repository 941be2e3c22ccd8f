//! Best-effort write-set estimation ahead of execution.
//!
//! Estimates seed the multi-version memory with placeholders so that transactions
//! block on their likely writer from the start instead of reading stale data and
//! aborting. Wrong estimates never affect the outcome of a block: a missed key only
//! costs an abort, a spurious one only a wait.

use crate::types::MultiLocations;
use rayon::prelude::*;

/// Runs `estimator` over every transaction payload in parallel chunks of
/// `chunk_size`. Returns one [`MultiLocations`] per transaction, with sorted and
/// de-duplicated key lists. Payloads the estimator cannot decode should map to an
/// empty [`MultiLocations`].
pub fn estimate_block<T, F>(payloads: &[T], chunk_size: usize, estimator: F) -> Vec<MultiLocations>
where
    T: Sync,
    F: Fn(&T) -> MultiLocations + Sync,
{
    payloads
        .par_chunks(chunk_size.max(1))
        .flat_map_iter(|chunk| {
            chunk.iter().map(|payload| {
                let mut locations = estimator(payload);
                locations.retain(|_, keys| {
                    keys.sort();
                    keys.dedup();
                    !keys.is_empty()
                });
                locations
            })
        })
        .collect()
}
