//! A randomised periodic trigger: fires roughly every `period`
//! events, and never waits more than `period` events between firings.
//!
//! Each trigger owns an atomic countdown that is refilled with a
//! uniform draw from `[1, period]` whenever it runs out, so the
//! expected gap is about `period / 2` events.  Randomisation means a
//! workload can't settle into a rhythm that always lands just short
//! of the trigger.
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

fn draw(period: u64) -> u64 {
    use rand::Rng;

    rand::thread_rng().gen_range(1..=period)
}

#[derive(Debug)]
pub(crate) struct PeriodicTrigger {
    period: u64,
    // Events left before we fire.  Never zero.
    countdown: AtomicU64,
}

impl PeriodicTrigger {
    /// Returns a trigger that fires at least once every `period`
    /// events.  A zero period means "every event."
    pub fn new(period: u64) -> PeriodicTrigger {
        let period = period.max(1);

        PeriodicTrigger {
            period,
            countdown: AtomicU64::new(draw(period)),
        }
    }

    /// Observes one event.  Returns whether the trigger fired.
    #[inline]
    pub fn event(&self) -> bool {
        self.weighted_event(1)
    }

    /// Observes `count` events at once.  Returns whether the trigger
    /// fired for any of them.
    pub fn weighted_event(&self, count: u64) -> bool {
        let mut fired = false;

        // The closure may run more than once under contention; only
        // the value from the successful exchange matters.
        let _ = self
            .countdown
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current > count {
                    fired = false;
                    Some(current - count)
                } else {
                    fired = true;
                    Some(draw(self.period))
                }
            });

        fired
    }
}

#[test]
fn smoke_test() {
    let trigger = PeriodicTrigger::new(10);

    for _ in 0..20 {
        assert!((0..10).any(|_| trigger.event()));
    }
}

/// We never need more than `period` events, and a uniform countdown
/// sometimes makes us wait the full period.
#[test]
fn test_delay_until_trigger() {
    let trigger = PeriodicTrigger::new(4);
    // Drain the initial countdown so every round starts fresh.
    while !trigger.event() {}

    let mut max_delay = 0;
    for _ in 0..200 {
        let delay = (1..=4)
            .find(|_| trigger.event())
            .expect("must fire within the period");
        max_delay = max_delay.max(delay);
    }

    // Waiting the full 4 events happens with probability 1/4 per
    // round; missing it 200 times in a row is astronomically unlikely.
    assert_eq!(max_delay, 4);
}

#[test]
fn test_weighted_always_fire() {
    let trigger = PeriodicTrigger::new(20);

    for _ in 0..10 {
        assert!(trigger.weighted_event(20));
    }
}

#[test]
fn test_zero_period() {
    let trigger = PeriodicTrigger::new(0);

    for _ in 0..10 {
        assert!(trigger.event());
    }
}

#[test]
fn test_huge_period() {
    let trigger = PeriodicTrigger::new(u64::MAX);

    // It should virtually never fire.
    for _ in 0..1000 {
        assert!(!trigger.event());
    }
}

/// Concurrent observers don't lose the guarantee.
#[test]
fn test_shared() {
    use std::sync::Arc;

    let trigger = Arc::new(PeriodicTrigger::new(8));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let trigger = trigger.clone();
            std::thread::spawn(move || (0..800).filter(|_| trigger.event()).count())
        })
        .collect();

    let fired: usize = workers
        .into_iter()
        .map(|w| w.join().expect("worker must not panic"))
        .sum();
    // 3200 events, at least one firing per 8 events.
    assert!(fired >= 3200 / 8);
}
