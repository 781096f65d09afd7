//! Sets and Areas
//!
//! A `Set` is a sorted collection of element ids in a single dimension. An
//! `Area` assigns one set per cube dimension; its Cartesian product defines a
//! sub-cube. Areas are always explicit here: "all elements" selectors are
//! resolved against the dimension before plan construction, so processors
//! never see wildcards.

use std::sync::Arc;

use crate::ident::{IdentifierType, Key};

/// Sorted, deduplicated collection of element ids in one dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Set {
    ids: Vec<IdentifierType>,
}

impl Set {
    pub fn new() -> Self {
        Set { ids: Vec::new() }
    }

    /// Build from arbitrary ids; sorts and deduplicates.
    pub fn from_ids(mut ids: Vec<IdentifierType>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Set { ids }
    }

    pub fn insert(&mut self, id: IdentifierType) {
        if let Err(pos) = self.ids.binary_search(&id) {
            self.ids.insert(pos, id);
        }
    }

    pub fn contains(&self, id: IdentifierType) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    /// Index of `id` within the sorted order.
    pub fn find(&self, id: IdentifierType) -> Option<usize> {
        self.ids.binary_search(&id).ok()
    }

    /// Index of the smallest member >= `id`.
    pub fn find_at_or_above(&self, id: IdentifierType) -> Option<usize> {
        match self.ids.binary_search(&id) {
            Ok(pos) => Some(pos),
            Err(pos) if pos < self.ids.len() => Some(pos),
            Err(_) => None,
        }
    }

    pub fn at(&self, index: usize) -> IdentifierType {
        self.ids[index]
    }

    pub fn first(&self) -> Option<IdentifierType> {
        self.ids.first().copied()
    }

    pub fn last(&self) -> Option<IdentifierType> {
        self.ids.last().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = IdentifierType> + '_ {
        self.ids.iter().copied()
    }

    pub fn as_slice(&self) -> &[IdentifierType] {
        &self.ids
    }

    /// Element-wise intersection with another set.
    pub fn intersect(&self, other: &Set) -> Set {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ids.len() && j < other.ids.len() {
            match self.ids[i].cmp(&other.ids[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    out.push(self.ids[i]);
                    i += 1;
                    j += 1;
                }
            }
        }
        Set { ids: out }
    }
}

impl FromIterator<IdentifierType> for Set {
    fn from_iter<T: IntoIterator<Item = IdentifierType>>(iter: T) -> Self {
        Set::from_ids(iter.into_iter().collect())
    }
}

/// Per-dimension request selector, resolved to a concrete [`Area`] by the
/// engine before any plan is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DimSelector {
    /// Every element of the dimension
    All,
    /// Explicit element ids
    Ids(Vec<IdentifierType>),
}

/// Area selector: one entry per cube dimension.
pub type AreaSelector = Vec<DimSelector>;

/// Concrete sub-cube: one explicit set per cube dimension.
#[derive(Debug, Clone)]
pub struct Area {
    dims: Vec<Arc<Set>>,
}

impl Area {
    pub fn new(dims: Vec<Arc<Set>>) -> Self {
        Area { dims }
    }

    /// Area over a single fully-qualified key.
    pub fn from_key(key: &[IdentifierType]) -> Self {
        Area {
            dims: key
                .iter()
                .map(|id| Arc::new(Set::from_ids(vec![*id])))
                .collect(),
        }
    }

    pub fn dim_count(&self) -> usize {
        self.dims.len()
    }

    pub fn get_dim(&self, ordinal: usize) -> &Arc<Set> {
        &self.dims[ordinal]
    }

    /// Replace the set of one dimension.
    pub fn insert(&mut self, ordinal: usize, set: Arc<Set>) {
        self.dims[ordinal] = set;
    }

    /// Number of cells addressed by the area.
    pub fn size(&self) -> f64 {
        self.dims.iter().map(|s| s.len() as f64).product()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.iter().any(|s| s.is_empty())
    }

    pub fn contains(&self, key: &[IdentifierType]) -> bool {
        key.len() == self.dims.len()
            && key
                .iter()
                .zip(self.dims.iter())
                .all(|(id, set)| set.contains(*id))
    }

    /// The smallest key of the area, or `None` when any set is empty.
    pub fn path_begin(&self) -> Option<Key> {
        self.dims.iter().map(|s| s.first()).collect()
    }

    /// The smallest area key >= `key`, or `None` past the end.
    pub fn seek(&self, key: &[IdentifierType]) -> Option<Key> {
        debug_assert_eq!(key.len(), self.dims.len());
        if self.is_empty() {
            return None;
        }
        let n = self.dims.len();
        let mut out: Key = Vec::with_capacity(n);
        let mut dim = 0;
        while dim < n {
            match self.dims[dim].find_at_or_above(key[dim]) {
                Some(idx) => {
                    let val = self.dims[dim].at(idx);
                    out.push(val);
                    if val > key[dim] {
                        // later dimensions restart at their minimum
                        for d in dim + 1..n {
                            out.push(self.dims[d].at(0));
                        }
                        return Some(out);
                    }
                    dim += 1;
                }
                None => {
                    // carry into an earlier dimension
                    loop {
                        if dim == 0 {
                            return None;
                        }
                        dim -= 1;
                        out.pop();
                        let cur_idx = self.dims[dim]
                            .find(key[dim])
                            .or_else(|| self.dims[dim].find_at_or_above(key[dim]));
                        let next_idx = match cur_idx {
                            Some(i) if i + 1 < self.dims[dim].len() => Some(i + 1),
                            _ => None,
                        };
                        if let Some(i) = next_idx {
                            out.push(self.dims[dim].at(i));
                            for d in dim + 1..n {
                                out.push(self.dims[d].at(0));
                            }
                            return Some(out);
                        }
                    }
                }
            }
        }
        Some(out)
    }

    /// True if the Cartesian products intersect.
    pub fn overlaps(&self, other: &Area) -> bool {
        self.dims.len() == other.dims.len()
            && self
                .dims
                .iter()
                .zip(other.dims.iter())
                .all(|(a, b)| !a.intersect(b).is_empty())
    }

    /// Per-dimension intersection.
    pub fn intersect(&self, other: &Area) -> Area {
        Area {
            dims: self
                .dims
                .iter()
                .zip(other.dims.iter())
                .map(|(a, b)| Arc::new(a.intersect(b)))
                .collect(),
        }
    }

    /// Ordered enumeration of every key in the area.
    pub fn keys(&self) -> AreaIterator<'_> {
        AreaIterator {
            area: self,
            positions: vec![0; self.dims.len()],
            done: self.is_empty(),
            started: false,
        }
    }
}

/// Odometer over the area's per-dimension sets, yielding keys in ascending
/// lexicographic order.
pub struct AreaIterator<'a> {
    area: &'a Area,
    positions: Vec<usize>,
    done: bool,
    started: bool,
}

impl AreaIterator<'_> {
    fn current(&self) -> Key {
        self.positions
            .iter()
            .enumerate()
            .map(|(d, p)| self.area.dims[d].at(*p))
            .collect()
    }

    /// Position at the smallest key >= `key`; returns it if any remains.
    pub fn move_to(&mut self, key: &[IdentifierType]) -> Option<Key> {
        let target = self.area.seek(key)?;
        for (d, id) in target.iter().enumerate() {
            self.positions[d] = self.area.dims[d].find(*id)?;
        }
        self.started = true;
        self.done = false;
        Some(target)
    }
}

impl Iterator for AreaIterator<'_> {
    type Item = Key;

    fn next(&mut self) -> Option<Key> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(self.current());
        }
        // advance the odometer, right-most dimension fastest
        let n = self.positions.len();
        for d in (0..n).rev() {
            self.positions[d] += 1;
            if self.positions[d] < self.area.dims[d].len() {
                return Some(self.current());
            }
            self.positions[d] = 0;
        }
        self.done = true;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn area(dims: &[&[IdentifierType]]) -> Area {
        Area::new(
            dims.iter()
                .map(|ids| Arc::new(Set::from_ids(ids.to_vec())))
                .collect(),
        )
    }

    #[test]
    fn test_set_intersect() {
        let a = Set::from_ids(vec![1, 3, 5, 7]);
        let b = Set::from_ids(vec![3, 4, 5]);
        assert_eq!(a.intersect(&b).as_slice(), &[3, 5]);
    }

    #[test]
    fn test_area_contains_and_size() {
        let a = area(&[&[1, 2], &[10, 20, 30]]);
        assert_eq!(a.size(), 6.0);
        assert!(a.contains(&[2, 20]));
        assert!(!a.contains(&[3, 20]));
    }

    #[test]
    fn test_area_seek_exact_and_jump() {
        let a = area(&[&[1, 3], &[10, 20]]);
        assert_eq!(a.seek(&[1, 10]), Some(vec![1, 10]));
        assert_eq!(a.seek(&[1, 11]), Some(vec![1, 20]));
        assert_eq!(a.seek(&[1, 21]), Some(vec![3, 10]));
        assert_eq!(a.seek(&[2, 0]), Some(vec![3, 10]));
        assert_eq!(a.seek(&[3, 21]), None);
    }

    #[test]
    fn test_area_iterator_order() {
        let a = area(&[&[1, 3], &[10, 20]]);
        let keys: Vec<Key> = a.keys().collect();
        assert_eq!(
            keys,
            vec![vec![1, 10], vec![1, 20], vec![3, 10], vec![3, 20]]
        );
    }

    #[test]
    fn test_area_iterator_move_to() {
        let a = area(&[&[1, 3], &[10, 20]]);
        let mut it = a.keys();
        assert_eq!(it.move_to(&[1, 15]), Some(vec![1, 20]));
        assert_eq!(it.next(), Some(vec![3, 10]));
    }

    #[test]
    fn test_overlaps() {
        let a = area(&[&[1, 2], &[10]]);
        let b = area(&[&[2, 3], &[10, 20]]);
        let c = area(&[&[3], &[10]]);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }
}
