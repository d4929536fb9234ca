//! A thread-safe cache of the salts observed on incoming streams.
//!
//! The cache answers one question: has this salt been seen before? Salts
//! are hashed to 64 bits and stored across N ≥ 3 [`Set64`] generations —
//! one active set taking writes, archives holding recent history, and a
//! spare being cleared for reuse. When the active set reaches its
//! occupancy ceiling the roles rotate, so memory stays bounded while the
//! cache remembers at least the requested number of recent salts.
//!
//! False positives come only from 64-bit hash collisions, at a rate of
//! about `population / 2^64` per lookup.
//!
//! To disable replay detection, hold an `Option<ReplayCache<_>>` set to
//! `None` and treat every salt as new.

use std::{mem, sync::Arc, thread};

use log::{debug, warn};
use parking_lot::RwLock;

use crate::{
    error::Error,
    hash::{TabulationHasher, IV_LEN},
    set64::{FileIndex, Index64, MemIndex, Set64},
};

/// The maximum occupancy to allow in the active set.
///
/// Higher values have better memory efficiency, but additions take
/// time O(1/(1 - occupancy)).
const MAX_OCCUPANCY: f64 = 0.95;

/// A replay cache over N ≥ 3 set generations.
///
/// [`add`] may be called concurrently from any number of threads; archive
/// lookups run in parallel under read locks while the active set is
/// updated under its write lock.
///
/// [`add`]: ReplayCache::add
#[derive(Debug)]
pub struct ReplayCache<I> {
    // slots[0] is the active set, slots[1..N-1] the archives from newest
    // to oldest, and slots[N-1] the spare.
    slots: Vec<Arc<RwLock<Set64<I>>>>,
    hasher: TabulationHasher,
}

impl ReplayCache<MemIndex> {
    /// Creates a memory-backed cache with a fresh random hasher.
    ///
    /// The cache remembers at least the last `n` salts and always fewer
    /// than twice the per-set capacity.
    pub fn new(n: usize) -> Self {
        let cells = (n as f64 / MAX_OCCUPANCY) as usize + 1;
        let sets = (0..3)
            .map(|_| Set64::new(MemIndex::new(cells)).expect("scanning a fresh store cannot fail"))
            .collect();
        Self::with_sets(sets, TabulationHasher::new()).expect("three fresh sets are valid")
    }
}

impl ReplayCache<FileIndex> {
    /// Creates a cache backed by `files`, of which there must be at
    /// least 3.
    ///
    /// When reconstituting a cache from disk, the files must be provided
    /// in the same order as before and `hasher` must be the same hash
    /// function (see [`TabulationHasher::to_bytes`]); otherwise every
    /// prior entry is garbage and the files should be zeroed instead.
    pub fn with_files(files: Vec<FileIndex>, hasher: TabulationHasher) -> Result<Self, Error> {
        let sets = files
            .into_iter()
            .map(Set64::new)
            .collect::<Result<Vec<_>, Error>>()?;
        Self::with_sets(sets, hasher)
    }
}

impl<I> ReplayCache<I>
where
    I: Index64 + Send + Sync + 'static,
{
    /// Creates a cache from prebuilt generations. The last set is the
    /// spare and is cleared if nonempty, in case the previous process
    /// shut down mid-rotation.
    pub fn with_sets(mut sets: Vec<Set64<I>>, hasher: TabulationHasher) -> Result<Self, Error> {
        if sets.len() < 3 {
            return Err(Error::TooFewSets {
                received: sets.len(),
            });
        }
        let spare = sets.last_mut().expect("at least three sets");
        if spare.count() != 0 {
            spare.clear()?;
        }
        Ok(Self {
            slots: sets
                .into_iter()
                .map(|set| Arc::new(RwLock::new(set)))
                .collect(),
            hasher,
        })
    }

    /// Records `iv`, returning true if it has not been seen within the
    /// cache's retention window.
    ///
    /// An error is only returned in exceptional circumstances (a failing
    /// backing store); the salt's status is then unknown and the stream
    /// should be rejected.
    pub fn add(&self, iv: &[u8; IV_LEN]) -> Result<bool, Error> {
        let hash = self.hasher.hash(iv);
        let n = self.slots.len();
        thread::scope(|s| {
            // Scan every archive concurrently under its read lock.
            let scans: Vec<_> = self.slots[1..n - 1]
                .iter()
                .map(|slot| s.spawn(move || slot.read().contains(hash)))
                .collect();

            let mut active = self.slots[0].write();
            let added = active.add(hash);

            // Wait for the archive verdicts before deciding.
            let mut found = false;
            let mut scan_err = None;
            for scan in scans {
                match scan.join().expect("archive scan panicked") {
                    Ok(hit) => found |= hit,
                    Err(err) => scan_err = scan_err.or(Some(err)),
                }
            }

            if matches!(added, Ok(true))
                && active.count() as f64 >= MAX_OCCUPANCY * active.capacity() as f64
            {
                // This addition crossed the occupancy threshold, so it's
                // time to archive the active set.
                self.rotate(&mut active);
            }
            drop(active);

            if let Some(err) = scan_err {
                return Err(err);
            }
            if found {
                return Ok(false);
            }
            added
        })
    }

    /// Cycles the generation roles. Called with the active write lock
    /// held; takes every other lock in index order.
    fn rotate(&self, active: &mut Set64<I>) {
        debug!(
            "rotating replay cache at {}/{} cells",
            active.count(),
            active.capacity()
        );
        let mut guards: Vec<_> = self.slots[1..]
            .iter()
            .map(|slot| slot.write_arc())
            .collect();
        // Cyclic permutation: the spare becomes the active set, the old
        // active becomes the freshest archive, and every archive ages by
        // one slot.
        for guard in guards.iter_mut() {
            mem::swap(active, &mut **guard);
        }
        let mut spare = guards.pop().expect("at least two non-active slots");
        // Archives become readable again immediately. The new spare keeps
        // its write lock until the clear completes: clearing is faster
        // than filling the fresh active set, and if it ever is not, the
        // next rotation blocks here instead of claiming a dirty spare.
        drop(guards);
        thread::spawn(move || {
            if let Err(err) = spare.clear() {
                warn!("failed to clear spare replay set: {err}");
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn slot_counts(&self) -> Vec<u64> {
        self.slots.iter().map(|slot| slot.read().count()).collect()
    }
}

#[cfg(test)]
mod test {
    use std::fs::File;
    use std::path::Path;

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn make_vecs(n: usize, seed: u8) -> Vec<[u8; IV_LEN]> {
        let mut rng = StdRng::from_seed([seed; 32]);
        (0..n).map(|_| rng.random()).collect()
    }

    #[test]
    fn test_cache_active() {
        let cache = ReplayCache::new(5);
        let vecs = make_vecs(2, 10);
        assert!(cache.add(&vecs[0]).unwrap(), "first addition should succeed");
        assert!(!cache.add(&vecs[0]).unwrap(), "duplicate add should fail");
        assert!(cache.add(&vecs[1]).unwrap(), "new vector should succeed");
        assert!(!cache.add(&vecs[1]).unwrap(), "second duplicate should fail");
    }

    #[test]
    fn test_cache_archive() {
        let n = 256;
        let batches = [
            make_vecs(n, 11),
            make_vecs(n, 12),
            make_vecs(n, 13),
        ];
        // The cache remembers at least `n` vectors, but always fewer
        // than `3 * n`.
        let cache = ReplayCache::new(n);
        // Add enough vectors to overflow the archive, so the first
        // vectors are forgotten.
        for (round, batch) in batches.iter().enumerate() {
            for (i, v) in batch.iter().enumerate() {
                assert!(
                    cache.add(v).unwrap(),
                    "round {round} item {i}: new vector should succeed"
                );
            }
            // This whole batch is still remembered.
            for (i, v) in batch.iter().enumerate() {
                assert!(
                    !cache.add(v).unwrap(),
                    "round {round} item {i}: duplicate add should fail"
                );
            }
        }
        assert!(
            cache.add(&batches[0][0]).unwrap(),
            "expected the first vector to be forgotten"
        );
    }

    #[test]
    fn test_cache_concurrent() {
        const THREADS: u8 = 8;
        const PER_THREAD: u32 = 500;
        let cache = ReplayCache::new(THREADS as usize * PER_THREAD as usize);

        let make_iv = |t: u8, i: u32| {
            let mut iv = [0u8; IV_LEN];
            iv[0] = t;
            iv[1..5].copy_from_slice(&i.to_be_bytes());
            iv[5] = 1;
            iv
        };

        thread::scope(|s| {
            for t in 0..THREADS {
                let cache = &cache;
                s.spawn(move || {
                    for i in 0..PER_THREAD {
                        assert!(cache.add(&make_iv(t, i)).unwrap());
                    }
                    for i in 0..PER_THREAD {
                        assert!(!cache.add(&make_iv(t, i)).unwrap());
                    }
                });
            }
        });
    }

    #[test]
    fn test_cache_rotation_under_contention() {
        // A tiny retention target makes nearly every addition rotate;
        // unique vectors must still all be reported new.
        let cache = ReplayCache::new(1);
        thread::scope(|s| {
            for t in 0..4u8 {
                let cache = &cache;
                s.spawn(move || {
                    let mut rng = StdRng::from_seed([t + 20; 32]);
                    for _ in 0..200 {
                        let mut iv: [u8; IV_LEN] = rng.random();
                        iv[31] = t; // disjoint per thread
                        assert!(cache.add(&iv).unwrap());
                    }
                });
            }
        });
    }

    #[test]
    fn test_too_few_sets() {
        let sets = (0..2)
            .map(|_| Set64::new(MemIndex::new(64)).unwrap())
            .collect();
        assert!(matches!(
            ReplayCache::with_sets(sets, TabulationHasher::new()),
            Err(Error::TooFewSets { received: 2 })
        ));
    }

    #[test]
    fn test_spare_cleared_on_reconstitution() {
        let mut sets: Vec<Set64<MemIndex>> = (0..3)
            .map(|_| Set64::new(MemIndex::new(64)).unwrap())
            .collect();
        // Simulate an unclean shutdown that left the spare dirty.
        sets[2].add(77).unwrap();
        sets[2].add(78).unwrap();
        let cache = ReplayCache::with_sets(sets, TabulationHasher::new()).unwrap();
        assert_eq!(cache.slot_counts()[2], 0);
    }

    fn cache_file(dir: &Path, name: &str, cells: u64) -> FileIndex {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(name))
            .unwrap();
        file.set_len(cells * 8).unwrap();
        FileIndex::new(file).unwrap()
    }

    #[test]
    fn test_file_cache_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let names = ["gen0", "gen1", "gen2"];
        let open_files = || names.iter().map(|name| cache_file(dir.path(), name, 512)).collect();

        let hasher = TabulationHasher::new();
        let sidecar = hasher.to_bytes();
        let vecs = make_vecs(256, 14);

        {
            let cache = ReplayCache::with_files(open_files(), hasher).unwrap();
            for v in &vecs {
                assert!(cache.add(v).unwrap());
            }
        }

        // Same files, same order, same hasher: everything is remembered.
        let restored = TabulationHasher::from_bytes(&sidecar).unwrap();
        let cache = ReplayCache::with_files(open_files(), restored).unwrap();
        for v in &vecs {
            assert!(!cache.add(v).unwrap());
        }
        for v in &make_vecs(16, 15) {
            assert!(cache.add(v).unwrap());
        }
    }
}
