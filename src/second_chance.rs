//! Batched Second Chance (Clock) eviction for the soft index.
//!
//! The soft index can't rely on the allocator to tell it when memory
//! is tight, so it caps its entry count instead.  Entries enter the
//! clock with a monotonically increasing rank, and set an "accessed"
//! bit on every hit.  When the reaper finds the index over capacity,
//! it asks for a [`Plan`]: the oldest unaccessed entries are
//! reclaimed, and accessed entries that the clock hand passes over
//! are given a second chance (re-ranked at the back, bit cleared).

/// Something the clock can rank and evict.
pub(crate) trait Candidate {
    /// Lower ranks are older, and evicted first.
    type Rank: Ord + Copy;

    fn rank(&self) -> Self::Rank;

    /// Whether the entry was hit since it last (re-)entered the clock.
    fn accessed(&self) -> bool;
}

/// What the reaper should do to bring the index back to capacity.
#[derive(Debug)]
pub(crate) struct Plan<T> {
    /// Entries to drop from memory.
    pub reclaim: Vec<T>,

    /// Entries to move to the back of the clock, oldest first.
    pub second_chance: Vec<T>,
}

impl<T: Candidate> Plan<T> {
    /// Plans the reclamation of `candidates` down to `capacity`
    /// entries.
    pub fn new(candidates: impl IntoIterator<Item = T>, capacity: usize) -> Plan<T> {
        let mut clock: Vec<T> = candidates.into_iter().collect();

        if clock.len() <= capacity {
            return Plan {
                reclaim: Vec::new(),
                second_chance: Vec::new(),
            };
        }

        let excess = clock.len() - capacity;
        let unaccessed = clock.iter().filter(|c| !c.accessed()).count();
        clock.sort_by_key(|c| c.rank());

        let mut reclaim = Vec::with_capacity(excess);
        let mut second_chance = Vec::new();

        if unaccessed >= excess {
            // One sweep of the clock hand suffices: stop as soon as we
            // have reclaimed enough unaccessed entries.  Every accessed
            // entry we swept past gets its second chance.
            for candidate in clock {
                if reclaim.len() == excess {
                    break;
                }

                if candidate.accessed() {
                    second_chance.push(candidate);
                } else {
                    reclaim.push(candidate);
                }
            }
        } else {
            // The hand comes all the way around: every unaccessed
            // entry goes, and so do the oldest accessed ones (their
            // second chance is used up).
            let mut accessed_to_reclaim = excess - unaccessed;

            for candidate in clock {
                if !candidate.accessed() {
                    reclaim.push(candidate);
                } else if accessed_to_reclaim > 0 {
                    accessed_to_reclaim -= 1;
                    reclaim.push(candidate);
                } else {
                    second_chance.push(candidate);
                }
            }
        }

        Plan {
            reclaim,
            second_chance,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;
    use proptest_derive::Arbitrary;
    use std::collections::HashSet;

    /// A test slot is its insertion tick and its accessed bit.
    #[derive(Arbitrary, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    struct Slot(u32, bool);

    impl Candidate for Slot {
        type Rank = u32;

        fn rank(&self) -> u32 {
            self.0
        }

        fn accessed(&self) -> bool {
            self.1
        }
    }

    #[test]
    fn test_under_capacity() {
        let plan = Plan::new(vec![Slot(0, false), Slot(1, true)], 2);

        assert!(plan.reclaim.is_empty());
        assert!(plan.second_chance.is_empty());

        let plan = Plan::<Slot>::new(vec![], 0);
        assert!(plan.reclaim.is_empty());
    }

    /// The oldest unaccessed slot goes; nothing was swept past.
    #[test]
    fn test_reclaim_oldest() {
        let plan = Plan::new(vec![Slot(2, false), Slot(0, false), Slot(1, true)], 2);

        assert_eq!(plan.reclaim, vec![Slot(0, false)]);
        assert!(plan.second_chance.is_empty());
    }

    /// An accessed slot at the front survives, and moves back.
    #[test]
    fn test_second_chance() {
        let plan = Plan::new(
            vec![Slot(0, true), Slot(1, true), Slot(2, false), Slot(3, false)],
            3,
        );

        assert_eq!(plan.reclaim, vec![Slot(2, false)]);
        assert_eq!(plan.second_chance, vec![Slot(0, true), Slot(1, true)]);
    }

    /// Not enough unaccessed slots: the oldest accessed ones go too.
    #[test]
    fn test_full_sweep() {
        let plan = Plan::new(
            vec![Slot(3, true), Slot(1, false), Slot(0, true), Slot(2, true)],
            1,
        );

        assert_eq!(plan.reclaim, vec![Slot(0, true), Slot(1, false), Slot(2, true)]);
        assert_eq!(plan.second_chance, vec![Slot(3, true)]);
    }

    /// Capacity zero empties the index.
    #[test]
    fn test_zero_capacity() {
        let plan = Plan::new(vec![Slot(0, true), Slot(1, false)], 0);

        assert_eq!(plan.reclaim.len(), 2);
        assert!(plan.second_chance.is_empty());
    }

    proptest! {
        /// Reclaimed slots are exactly the first ones when sorting
        /// unaccessed before accessed, then by rank.
        #[test]
        fn test_reclaim_oracle(slots in vec(any::<Slot>(), 0..24usize),
                               capacity in 0..12usize) {
            let unique: HashSet<u32> = slots.iter().map(|s| s.0).collect();
            prop_assume!(unique.len() == slots.len());

            let plan = Plan::new(slots.clone(), capacity);
            let mut expected = slots.clone();
            expected.sort_by_key(|s| (s.1, s.0));
            expected.truncate(slots.len().saturating_sub(capacity));

            let mut reclaimed = plan.reclaim.clone();
            reclaimed.sort_by_key(|s| (s.1, s.0));
            assert_eq!(reclaimed, expected);
        }

        /// Nothing is both reclaimed and given a second chance, only
        /// accessed slots get a second chance, and they come out in
        /// rank order.
        #[test]
        fn test_second_chance_oracle(slots in vec(any::<Slot>(), 0..24usize),
                                     capacity in 0..12usize) {
            let unique: HashSet<u32> = slots.iter().map(|s| s.0).collect();
            prop_assume!(unique.len() == slots.len());

            let plan = Plan::new(slots.clone(), capacity);
            let reclaimed: HashSet<Slot> = plan.reclaim.iter().copied().collect();

            assert!(plan.second_chance.iter().all(|s| s.accessed()));
            assert!(plan.second_chance.iter().all(|s| !reclaimed.contains(s)));
            assert!(plan.second_chance.windows(2).all(|w| w[0].rank() < w[1].rank()));

            // Every accessed slot older than the newest reclaimed
            // unaccessed slot was swept past.
            if let Some(newest) = plan.reclaim.iter().filter(|s| !s.accessed()).map(|s| s.rank()).max() {
                let swept: HashSet<Slot> = slots
                    .iter()
                    .filter(|s| s.accessed() && s.rank() < newest)
                    .copied()
                    .collect();
                assert!(swept.iter().all(|s| reclaimed.contains(s) || plan.second_chance.contains(s)));
            }
        }
    }
}
