// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use crate::schema::ObjectStoreId;

/// Returns true when the two scopes share at least one object store.
pub(crate) fn scopes_overlap(a: &[ObjectStoreId], b: &[ObjectStoreId]) -> bool {
    a.iter().any(|store| b.contains(store))
}

/// A multiset of object store ids counting how many in-progress transactions
/// reference each store. Supports O(1) increment, decrement and membership
/// probing, which is all the scheduler's overlap check needs.
#[derive(Default)]
pub(crate) struct ScopeCounters {
    counts: HashMap<ObjectStoreId, usize>,
}

impl ScopeCounters {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, scope: &[ObjectStoreId]) {
        for store in scope {
            *self.counts.entry(*store).or_default() += 1;
        }
    }

    /// Removes one count per store in `scope`. A transaction releases its
    /// scope exactly once; releasing a store that is not counted is a
    /// programming error.
    pub(crate) fn release(&mut self, scope: &[ObjectStoreId]) {
        for store in scope {
            let count = self
                .counts
                .get_mut(store)
                .unwrap_or_else(|| panic!("scope counter underflow for {store}"));
            *count -= 1;
            if *count == 0 {
                self.counts.remove(store);
            }
        }
    }

    pub(crate) fn contains(&self, store: ObjectStoreId) -> bool {
        self.counts.contains_key(&store)
    }

    pub(crate) fn overlaps(&self, scope: &[ObjectStoreId]) -> bool {
        scope.iter().any(|store| self.contains(*store))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub(crate) fn snapshot(&self) -> Vec<(ObjectStoreId, usize)> {
        let mut entries: Vec<_> = self.counts.iter().map(|(id, n)| (*id, *n)).collect();
        entries.sort();
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ObjectStoreId = ObjectStoreId(1);
    const B: ObjectStoreId = ObjectStoreId(2);
    const C: ObjectStoreId = ObjectStoreId(3);

    #[test]
    fn counts_are_per_store() {
        let mut counters = ScopeCounters::new();
        counters.add(&[A, B]);
        counters.add(&[B]);

        assert!(counters.contains(A));
        assert!(counters.contains(B));
        assert!(!counters.contains(C));
        assert!(counters.overlaps(&[C, B]));
        assert!(!counters.overlaps(&[C]));

        counters.release(&[A, B]);
        assert!(!counters.contains(A));
        assert!(counters.contains(B));

        counters.release(&[B]);
        assert!(counters.is_empty());
    }

    #[test]
    #[should_panic(expected = "scope counter underflow")]
    fn releasing_more_than_added_panics() {
        let mut counters = ScopeCounters::new();
        counters.add(&[A]);
        counters.release(&[A]);
        counters.release(&[A]);
    }

    #[test]
    fn overlap_helper() {
        assert!(scopes_overlap(&[A, B], &[B, C]));
        assert!(!scopes_overlap(&[A], &[B, C]));
        assert!(!scopes_overlap(&[], &[A]));
    }
}
