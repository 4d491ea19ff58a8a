//! The soft index is the in-memory layer in front of the bucket
//! files.  Its entries are shared `Arc<V>`s, and any entry may vanish
//! whenever the reaper decides the index holds too many: the bucket
//! files stay authoritative, so a reclaimed entry is just a future
//! miss that reloads from disk.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::second_chance;
use crate::trigger::PeriodicTrigger;

/// We aim to nudge the reaper a few times per `capacity` insertions
/// past the capacity.
const NUDGE_SCALE: usize = 4;

#[derive(Debug)]
struct Slot<V> {
    value: Arc<V>,
    rank: u64,
    accessed: AtomicBool,
}

/// A snapshot of one slot's eviction metadata.
struct Victim<K> {
    key: K,
    rank: u64,
    accessed: bool,
}

impl<K> second_chance::Candidate for Victim<K> {
    type Rank = u64;

    fn rank(&self) -> u64 {
        self.rank
    }

    fn accessed(&self) -> bool {
        self.accessed
    }
}

#[derive(Debug)]
pub(crate) struct SoftIndex<K, V> {
    map: RwLock<HashMap<K, Slot<V>>>,
    // Source of insertion ranks.
    clock: AtomicU64,
    capacity: usize,
    trigger: PeriodicTrigger,
}

impl<K, V> SoftIndex<K, V>
where
    K: Clone + Eq + Hash,
{
    /// Returns an empty index that aims to hold at most `capacity`
    /// entries once the reaper has caught up.
    pub fn new(capacity: usize) -> SoftIndex<K, V> {
        SoftIndex {
            map: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            capacity,
            trigger: PeriodicTrigger::new((capacity / NUDGE_SCALE) as u64),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn slot(&self, value: Arc<V>) -> Slot<V> {
        Slot {
            value,
            rank: self.tick(),
            accessed: AtomicBool::new(false),
        }
    }

    /// Returns the cached value for `key`, and marks it as recently
    /// used.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let map = self.map.read();
        let slot = map.get(key)?;

        slot.accessed.store(true, Ordering::Relaxed);
        Some(slot.value.clone())
    }

    /// Inserts or replaces the value for `key`.  Returns whether the
    /// reaper should run soon.
    pub fn insert(&self, key: K, value: Arc<V>) -> bool {
        let slot = self.slot(value);
        let len = {
            let mut map = self.map.write();
            map.insert(key, slot);
            map.len()
        };

        self.wants_reclaim(len, || self.trigger.event())
    }

    /// Inserts every pair in `entries`; when a key repeats, the last
    /// pair wins.  Returns whether the reaper should run soon.
    pub fn populate(&self, entries: impl IntoIterator<Item = (K, Arc<V>)>) -> bool {
        let mut count = 0u64;
        let len = {
            let mut map = self.map.write();
            for (key, value) in entries {
                let slot = self.slot(value);
                map.insert(key, slot);
                count += 1;
            }
            map.len()
        };

        count > 0 && self.wants_reclaim(len, || self.trigger.weighted_event(count))
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.map.write().remove(key).map(|slot| slot.value)
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.read().contains_key(key)
    }

    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        self.map
            .read()
            .values()
            .any(|slot| slot.value.as_ref() == value)
    }

    /// Always reclaim when we're at twice the capacity; otherwise,
    /// only reclaim occasionally once we're over capacity.
    fn wants_reclaim(&self, len: usize, fire: impl FnOnce() -> bool) -> bool {
        if len <= self.capacity {
            return false;
        }

        len >= self.capacity.saturating_mul(2) || fire()
    }

    /// Brings the index back down to capacity with a batched second
    /// chance pass.  Returns the number of entries dropped.
    pub fn reclaim(&self) -> usize {
        let mut map = self.map.write();

        if map.len() <= self.capacity {
            return 0;
        }

        let victims = map.iter().map(|(key, slot)| Victim {
            key: key.clone(),
            rank: slot.rank,
            accessed: slot.accessed.load(Ordering::Relaxed),
        });
        let plan = second_chance::Plan::new(victims, self.capacity);

        for victim in &plan.reclaim {
            map.remove(&victim.key);
        }

        // Oldest first, so they keep their relative order at the back
        // of the clock.
        for victim in &plan.second_chance {
            if let Some(slot) = map.get_mut(&victim.key) {
                slot.rank = self.tick();
                *slot.accessed.get_mut() = false;
            }
        }

        plan.reclaim.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn index(capacity: usize) -> SoftIndex<u32, String> {
        SoftIndex::new(capacity)
    }

    #[test]
    fn smoke_test() {
        let index = index(10);

        assert!(index.get(&1).is_none());
        assert!(!index.insert(1, Arc::new("one".to_string())));
        assert_eq!(index.get(&1).as_deref(), Some(&"one".to_string()));
        assert!(index.contains_key(&1));
        assert!(index.contains_value(&"one".to_string()));
        assert!(!index.contains_value(&"two".to_string()));
        assert_eq!(index.len(), 1);

        assert_eq!(index.remove(&1).as_deref(), Some(&"one".to_string()));
        assert!(index.remove(&1).is_none());
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_populate_last_wins() {
        let index = index(10);

        index.populate(vec![
            (1, Arc::new("first".to_string())),
            (2, Arc::new("other".to_string())),
            (1, Arc::new("last".to_string())),
        ]);

        assert_eq!(index.len(), 2);
        assert_eq!(index.get(&1).as_deref(), Some(&"last".to_string()));
    }

    #[test]
    fn test_clear() {
        let index = index(10);

        index.populate((0..5).map(|i| (i, Arc::new(i.to_string()))));
        assert_eq!(index.len(), 5);

        index.clear();
        assert_eq!(index.len(), 0);
        assert!(!index.contains_key(&0));
    }

    /// Unaccessed entries go first, in insertion order; accessed
    /// entries get a second chance.
    #[test]
    fn test_reclaim() {
        let index = index(2);

        for i in 0..4 {
            index.insert(i, Arc::new(i.to_string()));
        }

        // Mark 0 as accessed.
        assert!(index.get(&0).is_some());
        assert_eq!(index.reclaim(), 2);

        assert!(index.contains_key(&0));
        assert!(!index.contains_key(&1));
        assert!(!index.contains_key(&2));
        assert!(index.contains_key(&3));

        // 0 moved to the back of the clock, behind 3: it's the next
        // to survive.
        index.insert(4, Arc::new("4".to_string()));
        assert_eq!(index.reclaim(), 1);
        assert!(!index.contains_key(&3));
        assert!(index.contains_key(&0));
        assert!(index.contains_key(&4));
    }

    #[test]
    fn test_reclaim_under_capacity() {
        let index = index(8);

        index.populate((0..8).map(|i| (i, Arc::new(i.to_string()))));
        assert_eq!(index.reclaim(), 0);
        assert_eq!(index.len(), 8);
    }

    /// Growing to twice the capacity always asks for the reaper.
    #[test]
    fn test_wants_reclaim() {
        let index = index(4);

        for i in 0..4 {
            assert!(!index.insert(i, Arc::new(i.to_string())));
        }

        let nudged = (4..8)
            .map(|i| index.insert(i, Arc::new(i.to_string())))
            .collect::<Vec<_>>();
        assert_eq!(nudged.last(), Some(&true));

        index.reclaim();
        assert_eq!(index.len(), 4);
    }

    /// Capacity zero means entries are transient.
    #[test]
    fn test_zero_capacity() {
        let index = index(0);

        assert!(index.insert(1, Arc::new("one".to_string())));
        assert_eq!(index.reclaim(), 1);
        assert_eq!(index.len(), 0);
    }
}
