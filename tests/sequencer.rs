//! Ordering tests for the fractional order-index sequencer, driven through a
//! model list: every placement is applied the way the storage layer would
//! apply it (reassign on rebalance, then insert), and the labels track the
//! expected visual order.

use girder::{OrderKey, Placement, Sequencer};
use proptest::prelude::*;

/// Model of one element's task list: `(label, key)` pairs kept sorted by key.
struct ModelList {
    entries: Vec<(String, OrderKey)>,
    rebalances: usize,
}

impl ModelList {
    fn new() -> Self {
        ModelList {
            entries: Vec::new(),
            rebalances: 0,
        }
    }

    fn with_initial(labels: &[&str]) -> Self {
        let keys = Sequencer::initial_keys(labels.len());
        ModelList {
            entries: labels
                .iter()
                .map(|l| l.to_string())
                .zip(keys)
                .collect(),
            rebalances: 0,
        }
    }

    fn insert_at(&mut self, index: usize, label: &str) {
        let keys: Vec<OrderKey> = self.entries.iter().map(|(_, k)| *k).collect();
        match Sequencer::insert_at(&keys, index) {
            Placement::Key(key) => {
                self.entries.insert(index, (label.to_string(), key));
            }
            Placement::Rebalanced {
                reassigned,
                new_key,
            } => {
                self.rebalances += 1;
                for (entry, key) in self.entries.iter_mut().zip(reassigned) {
                    entry.1 = key;
                }
                self.entries.insert(index, (label.to_string(), new_key));
            }
        }
    }

    fn labels(&self) -> Vec<&str> {
        self.entries.iter().map(|(l, _)| l.as_str()).collect()
    }

    fn assert_sorted_and_unique(&self) {
        assert!(
            self.entries.windows(2).all(|w| w[0].1 < w[1].1),
            "keys must be strictly increasing: {:?}",
            self.entries
                .iter()
                .map(|(l, k)| (l.as_str(), k.raw()))
                .collect::<Vec<_>>()
        );
    }
}

#[test]
fn repeated_insertion_at_one_position_rebalances_and_keeps_order() {
    let mut list = ModelList::with_initial(&["a", "b", "c"]);

    // First insertion between a and b takes the midpoint.
    list.insert_at(1, "i0");
    assert_eq!(list.entries[1].1, OrderKey::from_units(15));

    // Keep inserting directly after "a"; the gap halves until it drops below
    // the minimum and a rebalance restores spacing.
    for n in 1..=6 {
        list.insert_at(1, &format!("i{n}"));
        list.assert_sorted_and_unique();
    }
    assert!(list.rebalances >= 1, "gap exhaustion must trigger a rebalance");

    // Visual order: a, then the inserts newest-first, then b and c.
    assert_eq!(
        list.labels(),
        ["a", "i6", "i5", "i4", "i3", "i2", "i1", "i0", "b", "c"]
    );
}

#[test]
fn ten_thousand_insertions_at_the_same_position_stay_ordered() {
    let mut list = ModelList::with_initial(&["first", "last"]);
    for n in 0..10_000 {
        list.insert_at(1, &format!("t{n}"));
    }
    list.assert_sorted_and_unique();
    assert_eq!(list.entries.len(), 10_002);
    assert_eq!(list.labels()[0], "first");
    assert_eq!(*list.labels().last().unwrap(), "last");
    assert!(list.rebalances >= 1);
}

#[test]
fn appends_and_prepends_never_rebalance() {
    let mut list = ModelList::new();
    for n in 0..1_000 {
        let index = if n % 2 == 0 { 0 } else { list.entries.len() };
        list.insert_at(index, &format!("e{n}"));
    }
    list.assert_sorted_and_unique();
    assert_eq!(list.rebalances, 0);
}

proptest! {
    /// Random insertion positions: the key order always matches the positional
    /// order a plain `Vec::insert` would produce, and keys never collide.
    #[test]
    fn random_insertions_match_positional_model(positions in prop::collection::vec(0usize..=64, 1..200)) {
        let mut list = ModelList::new();
        let mut expected: Vec<String> = Vec::new();

        for (n, position) in positions.into_iter().enumerate() {
            let label = format!("p{n}");
            let index = position.min(list.entries.len());
            list.insert_at(index, &label);
            expected.insert(index, label);
            list.assert_sorted_and_unique();
        }

        prop_assert_eq!(list.labels(), expected.iter().map(|s| s.as_str()).collect::<Vec<_>>());
    }
}
