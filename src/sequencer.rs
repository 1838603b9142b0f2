//! Fractional order-index assignment for one element's task list.
//!
//! Tasks are sorted by an [`OrderKey`]. Inserting a task at an arbitrary
//! position assigns a key between its neighbours and leaves every other key
//! untouched, so list position and key value stay independent. When repeated
//! insertions at the same position exhaust the gap, the sequencer produces a
//! rebalance plan: every key in the list is reassigned to an even multiple of
//! [`OrderKey::GAP`] in the current order, and the insertion is performed
//! against the rebalanced keys.
//!
//! The sequencer is pure. Callers apply a [`Placement`] atomically (the
//! manager holds a per-element lock and the storage layer commits the
//! reassignment and the insertion in one operation), so concurrent readers see
//! either the pre- or post-rebalance ordering, never an interleaved one.

use serde::{Deserialize, Serialize};

/// Fixed-point fractional order key, stored in millionths of a unit.
///
/// A bounded fixed-point domain satisfies the ordering contract without
/// arbitrary-precision arithmetic: midpoints stay exact down to the minimum
/// gap, below which a rebalance restores precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderKey(i64);

const SCALE: i64 = 1_000_000;

impl OrderKey {
    /// Spacing between consecutive keys on append, prepend, and rebalance.
    pub const GAP: OrderKey = OrderKey(10 * SCALE);

    /// Smallest gap a midpoint insertion is allowed into. Below this the
    /// sequencer rebalances instead of halving further.
    pub const MIN_GAP: OrderKey = OrderKey(SCALE);

    /// Build a key from whole units (e.g. `from_units(15)` is key 15.0).
    pub fn from_units(units: i64) -> Self {
        OrderKey(units * SCALE)
    }

    /// Raw fixed-point value in millionths of a unit.
    pub fn raw(self) -> i64 {
        self.0
    }

    fn midpoint(a: OrderKey, b: OrderKey) -> OrderKey {
        OrderKey((a.0 + b.0) / 2)
    }
}

impl std::fmt::Display for OrderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0 as f64 / SCALE as f64)
    }
}

/// The sequencer's decision for one insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Assign this key to the new entry; every existing key stays unchanged.
    Key(OrderKey),

    /// The gap at the insertion point is exhausted. Reassign every existing
    /// entry to its paired key (current order preserved, even multiples of
    /// `GAP`), then insert the new entry at `new_key`. Must be applied
    /// atomically with respect to concurrent reads.
    Rebalanced {
        /// New keys for the existing entries, parallel to the input list.
        reassigned: Vec<OrderKey>,
        /// Key for the entry being inserted.
        new_key: OrderKey,
    },
}

impl Placement {
    /// The key assigned to the new entry, regardless of whether a rebalance
    /// was required.
    pub fn new_key(&self) -> OrderKey {
        match self {
            Placement::Key(k) => *k,
            Placement::Rebalanced { new_key, .. } => *new_key,
        }
    }
}

/// Single authority for order-key assignment.
///
/// All operations take the element's current keys in ascending order. Callers
/// must never compute keys with ad hoc arithmetic; initial bulk assignment and
/// interactive insertion both go through these functions so rebalancing
/// composes correctly.
pub struct Sequencer;

impl Sequencer {
    /// Key that sorts after every existing key: `max + GAP`, or `GAP` on an
    /// empty list. Never requires a rebalance.
    pub fn append(keys: &[OrderKey]) -> OrderKey {
        match keys.iter().max() {
            Some(max) => OrderKey(max.0 + OrderKey::GAP.0),
            None => OrderKey::GAP,
        }
    }

    /// Key that sorts before every existing key: `min - GAP`, or `GAP` on an
    /// empty list. Never requires a rebalance.
    pub fn prepend(keys: &[OrderKey]) -> OrderKey {
        match keys.iter().min() {
            Some(min) => OrderKey(min.0 - OrderKey::GAP.0),
            None => OrderKey::GAP,
        }
    }

    /// Place a new entry so that `index` existing entries sort before it.
    /// `index == 0` prepends, `index == keys.len()` appends, anything else
    /// takes the midpoint of the surrounding pair or rebalances when the gap
    /// has dropped below `MIN_GAP`.
    pub fn insert_at(keys: &[OrderKey], index: usize) -> Placement {
        debug_assert!(index <= keys.len());
        debug_assert!(keys.windows(2).all(|w| w[0] < w[1]));

        if index == 0 {
            return Placement::Key(Self::prepend(keys));
        }
        if index == keys.len() {
            return Placement::Key(Self::append(keys));
        }

        let prev = keys[index - 1];
        let next = keys[index];
        if next.0 - prev.0 >= OrderKey::MIN_GAP.0 {
            return Placement::Key(OrderKey::midpoint(prev, next));
        }

        // Gap exhausted: re-key the whole list to even multiples of GAP in its
        // current order, then insert against the rebalanced neighbours.
        let reassigned: Vec<OrderKey> = (1..=keys.len() as i64)
            .map(|i| OrderKey(i * OrderKey::GAP.0))
            .collect();
        let new_key = OrderKey::midpoint(reassigned[index - 1], reassigned[index]);
        Placement::Rebalanced {
            reassigned,
            new_key,
        }
    }

    /// Evenly spaced keys for bulk creation of `count` entries, produced by
    /// repeated appends from an empty list (multiples of `GAP`).
    pub fn initial_keys(count: usize) -> Vec<OrderKey> {
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            let next = Self::append(&keys);
            keys.push(next);
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_spaces_by_gap() {
        assert_eq!(Sequencer::append(&[]), OrderKey::from_units(10));
        let keys = [OrderKey::from_units(10), OrderKey::from_units(20)];
        assert_eq!(Sequencer::append(&keys), OrderKey::from_units(30));
    }

    #[test]
    fn prepend_goes_below_min() {
        let keys = [OrderKey::from_units(10), OrderKey::from_units(20)];
        assert_eq!(Sequencer::prepend(&keys), OrderKey::from_units(0));
        assert_eq!(
            Sequencer::prepend(&[OrderKey::from_units(0)]),
            OrderKey::from_units(-10)
        );
    }

    #[test]
    fn midpoint_between_neighbours() {
        let keys = [
            OrderKey::from_units(10),
            OrderKey::from_units(20),
            OrderKey::from_units(30),
        ];
        assert_eq!(
            Sequencer::insert_at(&keys, 1),
            Placement::Key(OrderKey::from_units(15))
        );
    }

    #[test]
    fn rebalance_when_gap_exhausted() {
        // Keys 10.0 and 10.5: the gap is already below MIN_GAP.
        let keys = [OrderKey(10 * SCALE), OrderKey(10 * SCALE + SCALE / 2)];
        match Sequencer::insert_at(&keys, 1) {
            Placement::Rebalanced {
                reassigned,
                new_key,
            } => {
                assert_eq!(
                    reassigned,
                    vec![OrderKey::from_units(10), OrderKey::from_units(20)]
                );
                assert_eq!(new_key, OrderKey::from_units(15));
            }
            other => panic!("expected rebalance, got {:?}", other),
        }
    }

    #[test]
    fn initial_keys_are_gap_multiples() {
        let keys = Sequencer::initial_keys(4);
        assert_eq!(
            keys,
            vec![
                OrderKey::from_units(10),
                OrderKey::from_units(20),
                OrderKey::from_units(30),
                OrderKey::from_units(40),
            ]
        );
    }

    #[test]
    fn insert_at_ends_never_rebalances() {
        let keys = [OrderKey(SCALE), OrderKey(SCALE + 1)];
        assert!(matches!(Sequencer::insert_at(&keys, 0), Placement::Key(_)));
        assert!(matches!(Sequencer::insert_at(&keys, 2), Placement::Key(_)));
    }
}
