/// Sorted list of page numbers, ascending and without duplicates.
///
/// Used for pages released by a transaction and for pages that are free to
/// be handed out again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Idl {
    ids: Vec<u64>,
}

impl Idl {
    pub(crate) fn new() -> Self {
        Idl { ids: Vec::new() }
    }

    pub(crate) fn from_unsorted(mut ids: Vec<u64>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Idl { ids }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Inserts `id`, returning false if it was already present.
    pub(crate) fn insert(&mut self, id: u64) -> bool {
        match self.ids.binary_search(&id) {
            Ok(_) => false,
            Err(pos) => {
                self.ids.insert(pos, id);
                true
            }
        }
    }

    pub(crate) fn insert_run(&mut self, first: u64, count: u64) {
        for id in first..first + count {
            self.insert(id);
        }
    }

    /// Merges `other` into `self`.
    pub(crate) fn merge(&mut self, other: &Idl) {
        if other.is_empty() {
            return;
        }
        let (a, b) = (&self.ids, &other.ids);
        let mut merged = Vec::with_capacity(a.len() + b.len());
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            if a[i] < b[j] {
                merged.push(a[i]);
                i += 1;
            } else if a[i] > b[j] {
                merged.push(b[j]);
                j += 1;
            } else {
                merged.push(a[i]);
                i += 1;
                j += 1;
            }
        }
        merged.extend_from_slice(&a[i..]);
        merged.extend_from_slice(&b[j..]);
        self.ids = merged;
    }

    pub(crate) fn pop_first(&mut self) -> Option<u64> {
        if self.ids.is_empty() {
            None
        } else {
            Some(self.ids.remove(0))
        }
    }

    /// Removes and returns the first page of the lowest run of `n`
    /// consecutive page numbers.
    pub(crate) fn take_run(&mut self, n: usize) -> Option<u64> {
        if n == 0 || self.ids.len() < n {
            return None;
        }
        if n == 1 {
            return self.pop_first();
        }
        let mut start = 0;
        for i in 1..self.ids.len() {
            if self.ids[i] != self.ids[i - 1] + 1 {
                start = i;
            }
            if i + 1 - start == n {
                let first = self.ids[start];
                self.ids.drain(start..=i);
                return Some(first);
            }
        }
        None
    }

    /// Drops every page at or above `limit`, returning how many were removed.
    pub(crate) fn truncate_from(&mut self, limit: u64) -> usize {
        let keep = self.ids.partition_point(|&id| id < limit);
        let removed = self.ids.len() - keep;
        self.ids.truncate(keep);
        removed
    }

    /// Length of the run of pages that ends exactly at `end`.
    pub(crate) fn tail_run(&self, end: u64) -> u64 {
        let mut expect = end;
        let mut run = 0;
        for &id in self.ids.iter().rev() {
            if id + 1 != expect {
                break;
            }
            run += 1;
            expect = id;
        }
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_keeps_order() {
        let mut idl = Idl::new();
        for id in [9, 3, 7, 3, 1] {
            idl.insert(id);
        }
        assert_eq!(idl.ids, [1, 3, 7, 9]);
        assert!(!idl.insert(7));
        assert_eq!(idl.len(), 4);
    }

    #[test]
    fn merge_dedups() {
        let mut a = Idl::from_unsorted(vec![1, 5, 9]);
        let b = Idl::from_unsorted(vec![2, 5, 10]);
        a.merge(&b);
        assert_eq!(a.ids, [1, 2, 5, 9, 10]);
    }

    #[test]
    fn take_run_finds_lowest_contiguous() {
        let mut idl = Idl::from_unsorted(vec![2, 4, 5, 6, 10, 11, 12, 13]);
        assert_eq!(idl.take_run(3), Some(4));
        assert_eq!(idl.ids, [2, 10, 11, 12, 13]);
        assert_eq!(idl.take_run(5), None);
        assert_eq!(idl.take_run(4), Some(10));
        assert_eq!(idl.take_run(1), Some(2));
        assert!(idl.is_empty());
    }

    #[test]
    fn tail_run_and_truncate() {
        let mut idl = Idl::from_unsorted(vec![3, 7, 8, 9]);
        assert_eq!(idl.tail_run(10), 3);
        assert_eq!(idl.tail_run(9), 0);
        assert_eq!(idl.truncate_from(7), 3);
        assert_eq!(idl.ids, [3]);
    }
}
