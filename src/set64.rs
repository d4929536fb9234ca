//! An add-only set of `u64`s, implemented as a linear-probing ordered
//! prefix table over a pluggable backing store.
//!
//! For good performance, values should be uniformly distributed. Zero is
//! not an allowed value; it marks empty cells.

use std::fs::File;
use std::io;

use crate::error::Error;

/// Random access to a fixed run of 64-bit cells.
///
/// `get` returns `Ok(None)` past the last cell, which is how [`Set64`]
/// discovers the store's capacity and wraps its probes. Short reads and
/// writes surface as explicit errors, never as silent truncation.
pub trait Index64 {
    /// Reads the cell at `index`, or `None` past the capacity boundary.
    fn get(&self, index: u64) -> Result<Option<u64>, Error>;

    /// Writes the cell at `index`.
    fn set(&mut self, index: u64, value: u64) -> Result<(), Error>;
}

/// An in-memory backing store.
#[derive(Debug)]
pub struct MemIndex(Vec<u64>);

impl MemIndex {
    /// Creates an empty store of `cells` cells.
    pub fn new(cells: usize) -> Self {
        Self(vec![0u64; cells])
    }
}

impl From<Vec<u64>> for MemIndex {
    fn from(cells: Vec<u64>) -> Self {
        Self(cells)
    }
}

impl Index64 for MemIndex {
    fn get(&self, index: u64) -> Result<Option<u64>, Error> {
        let cell = usize::try_from(index)
            .ok()
            .and_then(|i| self.0.get(i))
            .copied();
        Ok(cell)
    }

    fn set(&mut self, index: u64, value: u64) -> Result<(), Error> {
        let cell = usize::try_from(index)
            .ok()
            .and_then(|i| self.0.get_mut(i))
            .ok_or(Error::ShortWrite { index })?;
        *cell = value;
        Ok(())
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}

/// A file-backed store: big-endian cells of 8 bytes at byte offset
/// `index * 8`, accessed positionally.
///
/// The file length fixes the capacity and must be a multiple of 8 with a
/// cell count that is a power of two of at least 8.
#[derive(Debug)]
pub struct FileIndex {
    file: File,
    cells: u64,
}

impl FileIndex {
    /// Binds to `file`, whose current length determines the capacity.
    pub fn new(file: File) -> Result<Self, Error> {
        let len = file.metadata().map_err(Error::Io)?.len();
        let cells = len / 8;
        if len % 8 != 0 || !cells.is_power_of_two() || cells < 8 {
            return Err(Error::BadCapacity { cells });
        }
        Ok(Self { file, cells })
    }

    /// The number of cells in the file.
    pub fn cells(&self) -> u64 {
        self.cells
    }
}

impl Index64 for FileIndex {
    fn get(&self, index: u64) -> Result<Option<u64>, Error> {
        if index >= self.cells {
            return Ok(None);
        }
        let mut buf = [0u8; 8];
        let mut done = 0;
        while done < 8 {
            let n = read_at(&self.file, &mut buf[done..], index * 8 + done as u64)
                .map_err(Error::Io)?;
            if n == 0 {
                return Err(Error::ShortRead { index });
            }
            done += n;
        }
        Ok(Some(u64::from_be_bytes(buf)))
    }

    fn set(&mut self, index: u64, value: u64) -> Result<(), Error> {
        if index >= self.cells {
            return Err(Error::ShortWrite { index });
        }
        let buf = value.to_be_bytes();
        let mut done = 0;
        while done < 8 {
            let n = write_at(&self.file, &buf[done..], index * 8 + done as u64)
                .map_err(Error::Io)?;
            if n == 0 {
                return Err(Error::ShortWrite { index });
            }
            done += n;
        }
        Ok(())
    }
}

/// An add-only set of nonzero `u64`s over an [`Index64`] backing store.
///
/// Probing keeps one invariant: scanning the cells from `wrap`, wrapping
/// past the end, and skipping zeros yields a strictly ascending sequence.
/// Lookups can therefore stop at the first cell holding a larger value,
/// which bounds probe lengths by the occupancy (roughly `1/(1 - load)`).
#[derive(Debug)]
pub struct Set64<I> {
    capacity: u64,
    vals: I,
    count: u64,
    wrap: u64,
}

impl<I: Index64> Set64<I> {
    /// Binds to `vals`, recovering `count` and the wrap point if the store
    /// is already populated.
    ///
    /// Recovery locates the smallest and largest nonzero values; the store
    /// is wrapped exactly when the smallest sits at a higher index than the
    /// largest. A duplicated smallest or largest value cannot result from
    /// correct use and is reported as corruption.
    pub fn new(vals: I) -> Result<Self, Error> {
        let mut max: Option<(u64, u64)> = None; // (value, index)
        let mut min: Option<(u64, u64)> = None;
        let mut count = 0u64;
        let mut i = 0u64;
        loop {
            let Some(val) = vals.get(i)? else { break };
            if val != 0 {
                count += 1;
                match &mut max {
                    Some((v, _)) if val == *v => return Err(Error::CorruptSet),
                    Some((v, idx)) if val > *v => {
                        *v = val;
                        *idx = i;
                    }
                    Some(_) => {}
                    None => max = Some((val, i)),
                }
                match &mut min {
                    Some((v, _)) if val == *v => return Err(Error::CorruptSet),
                    Some((v, idx)) if val < *v => {
                        *v = val;
                        *idx = i;
                    }
                    Some(_) => {}
                    None => min = Some((val, i)),
                }
            }
            i += 1;
        }
        let wrap = match (min, max) {
            (Some((_, min_idx)), Some((_, max_idx))) if min_idx > max_idx => max_idx + 1,
            _ => 0,
        };
        Ok(Self {
            capacity: i,
            vals,
            count,
            wrap,
        })
    }

    /// The probe origin for `val`: the high half of the 128-bit product
    /// maps uniform keys onto ascending indices (a fastrange reduction),
    /// clamped into the ordered window.
    fn start(&self, val: u64) -> u64 {
        let i = ((u128::from(val) * u128::from(self.capacity)) >> 64) as u64;
        i.max(self.wrap)
    }

    /// Returns true if `val` is in the set.
    pub fn contains(&self, val: u64) -> Result<bool, Error> {
        if val == 0 {
            return Err(Error::ZeroValue);
        }
        let mut i = self.start(val);
        loop {
            match self.vals.get(i)? {
                None => i = 0,
                Some(v) => {
                    if v == 0 || v > val {
                        return Ok(false);
                    } else if v == val {
                        return Ok(true);
                    }
                    i += 1;
                }
            }
            if i == self.wrap {
                // The ordered window is exhausted.
                return Ok(false);
            }
        }
    }

    /// Adds `val`, returning true if it was not already present.
    ///
    /// Insertion displaces smaller residents Robin-Hood style to keep the
    /// ordering invariant; a probe that crosses the wrap point exchanges
    /// with the cell there and advances the wrap, lazily growing the
    /// ordered window.
    pub fn add(&mut self, mut val: u64) -> Result<bool, Error> {
        if val == 0 {
            return Err(Error::ZeroValue);
        }
        if self.count == self.capacity {
            return Err(Error::SetFull);
        }
        let mut i = self.start(val);
        loop {
            match self.vals.get(i)? {
                None => i = 0,
                Some(v) => {
                    if v == 0 {
                        self.vals.set(i, val)?;
                        self.count += 1;
                        return Ok(true);
                    } else if v == val {
                        return Ok(false);
                    } else if v > val {
                        // Swap values to maintain ordering and continue
                        // with the displaced resident.
                        self.vals.set(i, val)?;
                        val = v;
                    }
                    i += 1;
                }
            }
            if i == self.wrap {
                // The carried value is now the largest in the window and
                // the cell at the wrap point holds the smallest (or 0).
                let Some(v) = self.vals.get(i)? else {
                    return Err(Error::CorruptSet);
                };
                self.vals.set(i, val)?;
                val = v;
                self.wrap += 1;
                if val == 0 {
                    self.count += 1;
                    return Ok(true);
                }
                i += 1;
            }
        }
    }

    /// Resets the set to its initial, empty state. O(capacity).
    pub fn clear(&mut self) -> Result<(), Error> {
        for i in 0..self.capacity {
            self.vals.set(i, 0)?;
        }
        self.count = 0;
        self.wrap = 0;
        Ok(())
    }

    /// The number of values in the set.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// The fixed number of cells in the backing store.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[cfg(test)]
    pub(crate) fn wrap(&self) -> u64 {
        self.wrap
    }

    #[cfg(test)]
    pub(crate) fn cells(&self) -> Vec<u64> {
        let mut out = Vec::new();
        let mut i = 0;
        while let Some(v) = self.vals.get(i).unwrap() {
            out.push(v);
            i += 1;
        }
        out
    }
}

#[cfg(test)]
mod test {
    use std::fs::File;

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn mem_set(cells: usize) -> Set64<MemIndex> {
        Set64::new(MemIndex::new(cells)).unwrap()
    }

    /// Walks the cells from the wrap point, skipping zeros, and asserts
    /// the sequence is strictly ascending.
    fn assert_ordered<I: Index64>(set: &Set64<I>) {
        let cells = set.cells();
        let wrap = set.wrap() as usize;
        let mut prev = 0u64;
        for k in 0..cells.len() {
            let v = cells[(wrap + k) % cells.len()];
            if v == 0 {
                continue;
            }
            assert!(v > prev, "cells out of order: {v} after {prev}");
            prev = v;
        }
    }

    #[test]
    fn test_set64() {
        let mut s = mem_set(32);
        let val = StdRng::from_seed([1u8; 32]).random::<u64>() | 1;

        assert_eq!(s.count(), 0);
        assert_eq!(s.capacity(), 32);
        assert!(!s.contains(val).unwrap());
        assert!(s.add(val).unwrap());
        assert!(s.contains(val).unwrap());
        assert!(!s.add(val).unwrap());
        assert_eq!(s.count(), 1);
    }

    #[test]
    fn test_set64_zero() {
        let mut s = mem_set(32);
        assert!(matches!(s.contains(0), Err(Error::ZeroValue)));
        assert!(matches!(s.add(0), Err(Error::ZeroValue)));
    }

    #[test]
    fn test_set64_full() {
        let mut s = mem_set(32);
        let mut rng = StdRng::from_seed([2u8; 32]);
        let vals: Vec<u64> = (0..32).map(|_| rng.random::<u64>() | 1).collect();
        for (i, v) in vals.iter().enumerate() {
            assert!(s.add(*v).unwrap(), "failed to add value {i}, {v}");
        }
        for (i, v) in vals.iter().enumerate() {
            assert!(s.contains(*v).unwrap(), "failed to find value {i}, {v}");
        }

        let extra = rng.random::<u64>() | 1;
        assert!(matches!(s.add(extra), Err(Error::SetFull)));
        assert!(!s.contains(extra).unwrap());
        // No addition spuriously replaced a prior value.
        for v in &vals {
            assert!(s.contains(*v).unwrap());
        }
        assert_ordered(&s);
    }

    #[test]
    fn test_set64_clear() {
        let mut s = mem_set(32);
        for v in 1..=32u64 {
            assert!(s.add(v).unwrap());
        }
        assert!(matches!(s.add(33), Err(Error::SetFull)));
        s.clear().unwrap();
        assert_eq!(s.count(), 0);
        assert!(s.add(1).unwrap());
    }

    #[test]
    fn test_set64_collide_low() {
        let mut s = mem_set(32);
        for v in 1..=32u64 {
            assert!(!s.contains(v).unwrap(), "we haven't added {v} yet");
            assert!(s.add(v).unwrap(), "add({v}) failed");
            assert!(s.contains(v).unwrap(), "missing value {v}");
        }
        assert_ordered(&s);
    }

    #[test]
    fn test_set64_collide_high() {
        let mut s = mem_set(32);
        for i in 0..32u64 {
            let v = u64::MAX - i;
            assert!(!s.contains(v).unwrap(), "we haven't added {v} yet");
            assert!(s.add(v).unwrap(), "add({v}) failed");
            assert!(s.contains(v).unwrap(), "missing value {v}");
        }
        assert_ordered(&s);
    }

    #[test]
    fn test_set64_ordering_random() {
        let mut s = mem_set(64);
        let mut rng = StdRng::from_seed([3u8; 32]);
        for _ in 0..60 {
            s.add(rng.random::<u64>() | 1).unwrap();
            assert_ordered(&s);
        }
    }

    #[test]
    fn test_recovery_from_populated_store() {
        let mut s = mem_set(32);
        let mut rng = StdRng::from_seed([4u8; 32]);
        let vals: Vec<u64> = (0..24).map(|_| rng.random::<u64>() | 1).collect();
        for v in &vals {
            s.add(*v).unwrap();
        }

        let recovered = Set64::new(MemIndex::from(s.cells())).unwrap();
        assert_eq!(recovered.count(), s.count());
        assert_eq!(recovered.wrap(), s.wrap());
        for v in &vals {
            assert!(recovered.contains(*v).unwrap());
        }
        assert!(!recovered.contains(rng.random::<u64>() | 1).unwrap());
    }

    #[test]
    fn test_recovery_wrapped_store() {
        // High-end clustering forces probes across the wrap point.
        let mut s = mem_set(16);
        let vals: Vec<u64> = (0..12).map(|i| u64::MAX - i).collect();
        for v in &vals {
            s.add(*v).unwrap();
        }
        assert!(s.wrap() > 0, "expected a wrapped store");

        let recovered = Set64::new(MemIndex::from(s.cells())).unwrap();
        assert_eq!(recovered.count(), s.count());
        assert_eq!(recovered.wrap(), s.wrap());
        for v in &vals {
            assert!(recovered.contains(*v).unwrap());
        }
    }

    #[test]
    fn test_recovery_rejects_duplicates() {
        let mut cells = vec![0u64; 16];
        cells[3] = 5;
        cells[9] = 5;
        assert!(matches!(
            Set64::new(MemIndex::from(cells)),
            Err(Error::CorruptSet)
        ));
    }

    #[test]
    fn test_recovery_single_value() {
        let mut cells = vec![0u64; 16];
        cells[11] = 42;
        let s = Set64::new(MemIndex::from(cells)).unwrap();
        assert_eq!(s.count(), 1);
        assert_eq!(s.wrap(), 0);
        assert!(s.contains(42).unwrap());
    }

    fn sized_file(dir: &std::path::Path, name: &str, cells: u64) -> File {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(name))
            .unwrap();
        file.set_len(cells * 8).unwrap();
        file
    }

    #[test]
    fn test_file_index_capacity_checked() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FileIndex::new(sized_file(dir.path(), "three", 3)),
            Err(Error::BadCapacity { cells: 3 })
        ));
        assert!(matches!(
            FileIndex::new(sized_file(dir.path(), "twelve", 12)),
            Err(Error::BadCapacity { cells: 12 })
        ));
        assert!(FileIndex::new(sized_file(dir.path(), "eight", 8)).is_ok());
    }

    #[test]
    fn test_file_index_get_set() {
        let dir = tempfile::tempdir().unwrap();
        let mut idx = FileIndex::new(sized_file(dir.path(), "cells", 8)).unwrap();
        assert_eq!(idx.get(0).unwrap(), Some(0));
        idx.set(5, 0xdead_beef_cafe_f00d).unwrap();
        assert_eq!(idx.get(5).unwrap(), Some(0xdead_beef_cafe_f00d));
        assert_eq!(idx.get(8).unwrap(), None);
        assert!(matches!(idx.set(8, 1), Err(Error::ShortWrite { index: 8 })));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::from_seed([5u8; 32]);
        let vals: Vec<u64> = (0..48).map(|_| rng.random::<u64>() | 1).collect();
        let probes: Vec<u64> = (0..48).map(|_| rng.random::<u64>() | 1).collect();

        let (count, wrap, answers) = {
            let mut s = Set64::new(FileIndex::new(sized_file(dir.path(), "set", 64)).unwrap())
                .unwrap();
            for v in &vals {
                assert!(s.add(*v).unwrap());
            }
            let answers: Vec<bool> =
                probes.iter().map(|v| s.contains(*v).unwrap()).collect();
            (s.count(), s.wrap(), answers)
        };

        let reopened =
            Set64::new(FileIndex::new(sized_file(dir.path(), "set", 64)).unwrap()).unwrap();
        assert_eq!(reopened.count(), count);
        assert_eq!(reopened.wrap(), wrap);
        for v in &vals {
            assert!(reopened.contains(*v).unwrap());
        }
        for (v, expected) in probes.iter().zip(answers) {
            assert_eq!(reopened.contains(*v).unwrap(), expected);
        }
    }
}

#[cfg(test)]
mod proptests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    proptest! {
        #[test]
        fn add_matches_hash_set_model(keys in proptest::collection::vec(1u64.., 0..96)) {
            let mut set = Set64::new(MemIndex::new(128)).unwrap();
            let mut model = HashSet::new();
            for k in &keys {
                prop_assert_eq!(set.add(*k).unwrap(), model.insert(*k));
            }
            prop_assert_eq!(set.count(), model.len() as u64);
            for k in &keys {
                prop_assert!(set.contains(*k).unwrap());
            }
        }

        #[test]
        fn cells_stay_strictly_ascending(keys in proptest::collection::vec(1u64.., 0..96)) {
            let mut set = Set64::new(MemIndex::new(128)).unwrap();
            for k in &keys {
                set.add(*k).unwrap();
            }
            let cells = set.cells();
            let wrap = set.wrap() as usize;
            let mut prev = 0u64;
            for k in 0..cells.len() {
                let v = cells[(wrap + k) % cells.len()];
                if v != 0 {
                    prop_assert!(v > prev);
                    prev = v;
                }
            }
        }

        #[test]
        fn recovery_preserves_membership(keys in proptest::collection::vec(1u64.., 1..96)) {
            let mut set = Set64::new(MemIndex::new(128)).unwrap();
            for k in &keys {
                set.add(*k).unwrap();
            }
            let recovered = Set64::new(MemIndex::from(set.cells())).unwrap();
            prop_assert_eq!(recovered.count(), set.count());
            prop_assert_eq!(recovered.wrap(), set.wrap());
            for k in &keys {
                prop_assert!(recovered.contains(*k).unwrap());
            }
        }
    }
}
