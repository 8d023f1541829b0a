use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::prelude::*;

#[derive(Debug, Clone)]
struct KeyedItem<T> {
    key: f64,
    seq: usize,
    item: T,
}

impl<T> PartialEq for KeyedItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for KeyedItem<T> {}

impl<T> PartialOrd for KeyedItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for KeyedItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed: the smallest key sits at the top of the heap, and among
        // equal keys the latest item
        other
            .key
            .total_cmp(&self.key)
            .then(self.seq.cmp(&other.seq))
    }
}

///
/// A-Res weighted reservoir sampling without replacement (Efraimidis &
/// Spirakis, 2006).
///
/// Every item gets the key `ln(u) / w` with `u` uniform on `(0, 1]`, which
/// orders items exactly like the classic `u^(1/w)` but stays finite for tiny
/// weights. The `k` largest keys are kept in a min-heap.
///
/// Zero-weight items get the key `-inf`: they are only ever selected while the
/// reservoir still has room, in stream order, and are displaced by any item
/// with a positive weight.
///
/// Time `O(n log k)`, space `O(k)`, one pass.
///
pub struct AResSampler<T> {
    reservoir: BinaryHeap<KeyedItem<T>>,
    k: usize,
    items_seen: usize,
    rng: StdRng,
}

impl<T> AResSampler<T> {
    pub fn new(k: usize, seed: u64) -> Self {
        Self {
            reservoir: BinaryHeap::with_capacity(k),
            k,
            items_seen: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Offer one item. Negative or non-finite weights count as zero.
    pub fn add_weighted(&mut self, item: T, weight: f64) {
        if self.k == 0 {
            return;
        }
        let seq = self.items_seen;
        self.items_seen += 1;

        let u: f64 = 1.0 - self.rng.random::<f64>();
        let key = if weight > 0.0 && weight.is_finite() {
            u.ln() / weight
        } else {
            f64::NEG_INFINITY
        };

        if self.reservoir.len() < self.k {
            self.reservoir.push(KeyedItem { key, seq, item });
        } else if self
            .reservoir
            .peek()
            .is_some_and(|smallest| key > smallest.key)
        {
            self.reservoir.pop();
            self.reservoir.push(KeyedItem { key, seq, item });
        }
    }

    pub fn sample_stream<I>(mut self, items: I, weight_fn: impl Fn(&T) -> f64) -> Vec<T>
    where
        I: Iterator<Item = T>,
    {
        for item in items {
            let weight = weight_fn(&item);
            self.add_weighted(item, weight);
        }
        self.into_sample()
    }

    /// Selected items, largest key first.
    pub fn into_sample(self) -> Vec<T> {
        self.reservoir
            .into_sorted_vec()
            .into_iter()
            .map(|keyed| keyed.item)
            .collect()
    }
}
