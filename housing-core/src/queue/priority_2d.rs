//! Two-dimensional priority queue over (price, secondary key).
//!
//! Elements have two unrelated orderings: price X and a secondary key Y
//! (quality for home buyers, yield for investors). For a price ceiling `p`
//! the queue answers "which element has the greatest Y among all elements
//! with X <= p" without scanning every element.
//!
//! Two ordered views are kept over the same element set:
//! - `by_y`: every element, ordered by Y.
//! - `uncovered`: the Pareto frontier of (low price, high Y), ordered by X.
//!
//! An element `e` is *covered* iff some other element `f` has `f.Y > e.Y` and
//! `f.X < e.X`. Covered elements can never be the answer to a ceiling query,
//! and along the frontier Y strictly increases with X, so the answer is the
//! floor of the ceiling in `uncovered`.
//!
//! Both orderings are total: X is (price asc, key desc, seq asc) and Y is
//! (key asc, price desc, seq desc). Equal-price elements are thus ordered by
//! key, and fully tied elements by their insertion sequence id, earliest
//! first.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::ops::Bound::{Excluded, Unbounded};

use crate::error::QueueError;
use crate::types::{Price, is_valid_price};

/// One element of the queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entry<K> {
    pub handle: K,
    pub price: Price,
    /// Secondary key Y.
    pub key: f64,
    /// Strictly monotonic tie-break id, assigned by the owner of the element.
    pub seq: u64,
}

impl<K: Ord> Entry<K> {
    pub fn new(handle: K, price: Price, key: f64, seq: u64) -> Self {
        Self {
            handle,
            price,
            key,
            seq,
        }
    }

    fn x_cmp(&self, other: &Self) -> Ordering {
        self.price
            .total_cmp(&other.price)
            .then_with(|| other.key.total_cmp(&self.key))
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| self.handle.cmp(&other.handle))
    }

    fn y_cmp(&self, other: &Self) -> Ordering {
        self.key
            .total_cmp(&other.key)
            .then_with(|| other.price.total_cmp(&self.price))
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| other.handle.cmp(&self.handle))
    }

    /// `true` if `self` Pareto-dominates `other` (cheaper and Y-greater).
    pub fn covers(&self, other: &Self) -> bool {
        self.x_cmp(other) == Ordering::Less && self.y_cmp(other) == Ordering::Greater
    }
}

#[derive(Debug, Clone, Copy)]
struct ByX<K>(Entry<K>);

impl<K: Ord> PartialEq for ByX<K> {
    fn eq(&self, other: &Self) -> bool {
        self.0.x_cmp(&other.0) == Ordering::Equal
    }
}
impl<K: Ord> Eq for ByX<K> {}
impl<K: Ord> PartialOrd for ByX<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<K: Ord> Ord for ByX<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.x_cmp(&other.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct ByY<K>(Entry<K>);

impl<K: Ord> PartialEq for ByY<K> {
    fn eq(&self, other: &Self) -> bool {
        self.0.y_cmp(&other.0) == Ordering::Equal
    }
}
impl<K: Ord> Eq for ByY<K> {}
impl<K: Ord> PartialOrd for ByY<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<K: Ord> Ord for ByY<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.y_cmp(&other.0)
    }
}

#[derive(Debug, Clone)]
pub struct PriorityQueue2D<K> {
    members: HashMap<K, Entry<K>>,
    by_y: BTreeSet<ByY<K>>,
    uncovered: BTreeSet<ByX<K>>,
}

impl<K> Default for PriorityQueue2D<K>
where
    K: Copy + Ord + Hash + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> PriorityQueue2D<K>
where
    K: Copy + Ord + Hash + Default,
{
    pub fn new() -> Self {
        Self {
            members: HashMap::new(),
            by_y: BTreeSet::new(),
            uncovered: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_y.is_empty()
    }

    /// Size of the Pareto frontier.
    pub fn uncovered_len(&self) -> usize {
        self.uncovered.len()
    }

    pub fn contains(&self, handle: K) -> bool {
        self.members.contains_key(&handle)
    }

    pub fn get(&self, handle: K) -> Option<&Entry<K>> {
        self.members.get(&handle)
    }

    pub fn is_uncovered(&self, handle: K) -> bool {
        self.members
            .get(&handle)
            .is_some_and(|e| self.uncovered.contains(&ByX(*e)))
    }

    /// All elements in ascending Y order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry<K>> + '_ {
        self.by_y.iter().map(|y| &y.0)
    }

    /// Frontier elements in ascending price order.
    pub fn uncovered(&self) -> impl Iterator<Item = &Entry<K>> + '_ {
        self.uncovered.iter().map(|x| &x.0)
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.by_y.clear();
        self.uncovered.clear();
    }

    pub fn insert(&mut self, entry: Entry<K>) -> Result<(), QueueError> {
        if !is_valid_price(entry.price) {
            return Err(QueueError::InvalidPrice(entry.price));
        }
        if !entry.key.is_finite() {
            return Err(QueueError::InvalidKey(entry.key));
        }
        if self.members.contains_key(&entry.handle) {
            return Err(QueueError::AlreadyPresent);
        }
        // -0.0 and 0.0 must order identically
        let entry = Entry {
            price: entry.price + 0.0,
            key: entry.key + 0.0,
            ..entry
        };

        self.members.insert(entry.handle, entry);
        self.by_y.insert(ByY(entry));

        let uncovered = match self.uncovered.range(..ByX(entry)).next_back() {
            None => true,
            Some(prev) => prev.0.y_cmp(&entry) == Ordering::Less,
        };
        if uncovered {
            // Frontier successors with lower Y are now dominated by `entry`
            while let Some(next) = self
                .uncovered
                .range((Excluded(ByX(entry)), Unbounded))
                .next()
                .copied()
            {
                if next.0.y_cmp(&entry) == Ordering::Greater {
                    break;
                }
                self.uncovered.remove(&next);
            }
            self.uncovered.insert(ByX(entry));
        }
        Ok(())
    }

    /// The element with greatest Y among those priced at or below `ceiling`.
    pub fn peek(&self, ceiling: Price) -> Result<Option<K>, QueueError> {
        Ok(self.floor(ceiling)?.map(|e| e.handle))
    }

    /// Like [`peek`](Self::peek), but removes and returns the element.
    pub fn poll(&mut self, ceiling: Price) -> Result<Option<Entry<K>>, QueueError> {
        match self.floor(ceiling)? {
            Some(entry) => self.remove(entry.handle).map(Some),
            None => Ok(None),
        }
    }

    pub fn remove(&mut self, handle: K) -> Result<Entry<K>, QueueError> {
        let entry = self.members.remove(&handle).ok_or(QueueError::NotMember)?;
        self.by_y.remove(&ByY(entry));
        if self.uncovered.remove(&ByX(entry)) {
            self.uncover_after_removal(&entry);
        }
        Ok(entry)
    }

    /// Re-prioritize an element, keeping its sequence id.
    pub fn update(&mut self, handle: K, price: Price, key: f64) -> Result<(), QueueError> {
        if !is_valid_price(price) {
            return Err(QueueError::InvalidPrice(price));
        }
        if !key.is_finite() {
            return Err(QueueError::InvalidKey(key));
        }
        let old = self.remove(handle)?;
        self.insert(Entry { price, key, ..old })
    }

    fn floor(&self, ceiling: Price) -> Result<Option<Entry<K>>, QueueError> {
        if !is_valid_price(ceiling) {
            return Err(QueueError::InvalidPrice(ceiling));
        }
        if self.is_empty() {
            return Err(QueueError::Empty);
        }
        // Sorts after every real element priced at `ceiling` (keys are finite)
        let ceiling_entry = Entry {
            handle: K::default(),
            price: ceiling + 0.0,
            key: f64::NEG_INFINITY,
            seq: u64::MAX,
        };
        Ok(self.uncovered.range(..=ByX(ceiling_entry)).next_back().map(|x| x.0))
    }

    /// Restore the frontier after removing the frontier element `removed`.
    ///
    /// Only elements covered by `removed` alone can surface: they lie
    /// Y-between its former frontier neighbours and price-below the upper one.
    fn uncover_after_removal(&mut self, removed: &Entry<K>) {
        let lower = self.uncovered.range(..ByX(*removed)).next_back().map(|x| x.0);
        let mut bound = self
            .uncovered
            .range((Excluded(ByX(*removed)), Unbounded))
            .next()
            .map(|x| x.0);

        let candidates: Vec<Entry<K>> = match lower {
            Some(lower) => self
                .by_y
                .range((Excluded(ByY(lower)), Excluded(ByY(*removed))))
                .rev()
                .map(|y| y.0)
                .collect(),
            None => self
                .by_y
                .range(..ByY(*removed))
                .rev()
                .map(|y| y.0)
                .collect(),
        };

        for candidate in candidates {
            let below_bound = bound.is_none_or(|b| candidate.x_cmp(&b) == Ordering::Less);
            if below_bound {
                self.uncovered.insert(ByX(candidate));
                bound = Some(candidate);
            }
        }
    }

    /// Verify both views against a from-scratch frontier computation.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.members.len() != self.by_y.len() {
            return Err(format!(
                "member index holds {} elements, Y view holds {}",
                self.members.len(),
                self.by_y.len()
            ));
        }
        if self.uncovered.len() > self.by_y.len() {
            return Err("uncovered view larger than the full set".to_string());
        }

        let mut by_x: Vec<Entry<K>> = self.by_y.iter().map(|y| y.0).collect();
        by_x.sort_by(|a, b| a.x_cmp(b));

        let mut best: Option<Entry<K>> = None;
        let mut expected = 0;
        for e in &by_x {
            if self.members.get(&e.handle) != Some(e) {
                return Err(format!("element with seq {} missing from member index", e.seq));
            }
            let is_frontier = best.is_none_or(|b| e.y_cmp(&b) == Ordering::Greater);
            if is_frontier {
                expected += 1;
                best = Some(*e);
            }
            if is_frontier != self.uncovered.contains(&ByX(*e)) {
                return Err(format!(
                    "element (price {}, key {}, seq {}) should be {}",
                    e.price,
                    e.key,
                    e.seq,
                    if is_frontier { "uncovered" } else { "covered" }
                ));
            }
        }
        if expected != self.uncovered.len() {
            return Err("uncovered view holds elements outside the full set".to_string());
        }
        Ok(())
    }
}
