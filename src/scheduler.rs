//! Seed selection and power scheduling.
//!
//! The queue is traversed in cycles. At every cycle boundary the scheduler
//! re-sorts the queue, marks seeds whose coverage matches or exceeds the
//! number of globally known edges as favored, and resets its cursor. Within a
//! cycle every seed is handed out at most once; favored seeds go first.

use std::collections::HashSet;

use libafl_bolts::rands::Rand;

use crate::corpus::{Seed, SeedQueue};

/// Chance to hand out a random unvisited seed instead of following the
/// favored-first policy.
const RANDOM_PICK_PROB: f64 = 0.1;

/// Upper bound on the number of mutants generated per selected seed.
pub const POWER_MAX: usize = 200;

/// Cycle-driven seed selection state.
#[derive(Debug)]
pub struct Scheduler<R> {
    rand: R,
    /// Cursor into the queue for the current cycle.
    queue_position: usize,
    /// Post-sort indices of this cycle's favored seeds that were not yet
    /// consumed by the favored-first rule.
    priority_set: HashSet<usize>,
}

impl<R> Scheduler<R>
where
    R: Rand,
{
    pub fn new(rand: R) -> Self {
        Self {
            rand,
            queue_position: 0,
            priority_set: HashSet::new(),
        }
    }

    /// Picks the index of the next seed to mutate and marks it visited.
    ///
    /// Returns `None` only for an empty queue.
    pub fn select_next(&mut self, queue: &mut SeedQueue, num_branches: usize) -> Option<usize> {
        if queue.is_empty() {
            return None;
        }
        loop {
            if self.queue_position >= queue.len() {
                self.begin_cycle(queue, num_branches);
            }

            // Occasionally jump to a random unvisited seed at or after the
            // cursor, leaving the cursor in place.
            if self.rand.coinflip(RANDOM_PICK_PROB) {
                let unvisited: Vec<usize> = (self.queue_position..queue.len())
                    .filter(|&idx| !queue.get(idx).visited)
                    .collect();
                if let Some(idx) = self.rand.choose(unvisited) {
                    queue.get_mut(idx).visited = true;
                    return Some(idx);
                }
            }

            // Favored seeds are served first. The scan starts at 0 so a
            // favored seed behind the cursor is never skipped; the cursor
            // only ever moves forward.
            if !self.priority_set.is_empty() {
                if let Some(idx) =
                    (0..queue.len()).find(|&idx| queue.get(idx).favored && !queue.get(idx).visited)
                {
                    self.priority_set.remove(&idx);
                    queue.get_mut(idx).visited = true;
                    self.queue_position = self.queue_position.max(idx + 1);
                    return Some(idx);
                }
            }

            // Plain traversal: the first unvisited seed from the cursor.
            while self.queue_position < queue.len() {
                let idx = self.queue_position;
                self.queue_position += 1;
                if !queue.get(idx).visited {
                    queue.get_mut(idx).visited = true;
                    return Some(idx);
                }
            }

            // Cycle exhausted; the next iteration starts a fresh one.
        }
    }

    /// Resets the per-cycle state: visited flags, favored flags, sort order
    /// and the cursor. `num_branches` is the size of the global bitmap at
    /// the cycle boundary.
    fn begin_cycle(&mut self, queue: &mut SeedQueue, num_branches: usize) {
        self.queue_position = 0;
        self.priority_set.clear();
        for seed in queue.iter_mut() {
            seed.visited = false;
            seed.favored = seed.coverage >= num_branches as u64;
        }
        // Favored flags feed the sort key, so sort after flagging and
        // collect indices only once the order is final.
        queue.sort_for_cycle();
        self.priority_set.extend(
            queue
                .iter()
                .enumerate()
                .filter(|(_, seed)| seed.favored)
                .map(|(idx, _)| idx),
        );
    }
}

/// Aggregates over the whole queue that the power schedule compares a seed
/// against.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub total_us: u64,
    pub total_cycles: usize,
    pub total_cov: u64,
    pub total_entries: usize,
}

impl QueueStats {
    pub fn collect(queue: &SeedQueue) -> Self {
        Self {
            total_us: queue.iter().map(|seed| seed.exec_time_us).sum(),
            total_cycles: queue.len(),
            total_cov: queue.iter().map(|seed| seed.coverage).sum(),
            total_entries: queue.len(),
        }
    }
}

/// How many mutants to derive from `seed` this round.
///
/// Starts from a base score of 100, adjusts it once for execution speed and
/// once for coverage relative to the queue averages, and maps the result to
/// `[1, POWER_MAX]`. With an empty denominator the seed is compared against
/// itself, which leaves the base score untouched.
pub fn power_schedule(seed: &Seed, stats: &QueueStats) -> usize {
    let avg_us = if stats.total_cycles == 0 {
        seed.exec_time_us as f64
    } else {
        stats.total_us as f64 / stats.total_cycles as f64
    };
    let avg_cov = if stats.total_entries == 0 {
        seed.coverage as f64
    } else {
        stats.total_cov as f64 / stats.total_entries as f64
    };

    let t = seed.exec_time_us as f64;
    let c = seed.coverage as f64;

    // Slower-than-average seeds get fewer mutations, faster ones more.
    let mut score: f64 = 100.0;
    if t * 0.10 > avg_us {
        score = 10.0;
    } else if t * 0.25 > avg_us {
        score = 25.0;
    } else if t * 0.50 > avg_us {
        score = 50.0;
    } else if t * 0.75 > avg_us {
        score = 75.0;
    } else if t * 4.0 < avg_us {
        score = 300.0;
    } else if t * 3.0 < avg_us {
        score = 200.0;
    } else if t * 2.0 < avg_us {
        score = 150.0;
    }

    // Higher-coverage seeds get a multiplier.
    if c * 0.3 > avg_cov {
        score *= 3.0;
    } else if c * 0.5 > avg_cov {
        score *= 2.0;
    } else if c * 0.75 > avg_cov {
        score *= 1.5;
    } else if c * 3.0 < avg_cov {
        score *= 0.25;
    } else if c * 2.0 < avg_cov {
        score *= 0.5;
    } else if c * 1.5 < avg_cov {
        score *= 0.75;
    }

    ((score / 100.0) as usize).clamp(1, POWER_MAX)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use libafl_bolts::rands::StdRand;
    use serde::{Deserialize, Serialize};

    use super::*;

    /// A rand whose `next` is pinned to the maximum, so `coinflip(0.1)` never
    /// fires and selection follows the deterministic policy.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct MaxRand;

    impl Rand for MaxRand {
        fn set_seed(&mut self, _seed: u64) {}

        fn next(&mut self) -> u64 {
            u64::MAX
        }
    }

    fn seed(id_hint: &str, coverage: u64, exec_time_us: u64, file_size: u64) -> Seed {
        Seed::new(PathBuf::from(id_hint), 0, coverage, exec_time_us, file_size)
    }

    /// Queue of three seeds with sort keys `(favored, time*size, id)` =
    /// `(1, 50, 2)`, `(0, 10, 0)`, `(1, 20, 1)` relative to 100 known edges.
    fn three_seed_queue() -> SeedQueue {
        let mut queue = SeedQueue::new();
        queue.add(PathBuf::from("0"), 10, 10, 1);
        queue.add(PathBuf::from("1"), 100, 5, 4);
        queue.add(PathBuf::from("2"), 150, 25, 2);
        queue
    }

    #[test]
    fn cycle_sorts_favored_then_cheapest() {
        let mut queue = three_seed_queue();
        let mut scheduler = Scheduler::new(MaxRand);

        let first = scheduler.select_next(&mut queue, 100).unwrap();
        assert_eq!(queue.get(first).seed_id, 1);
        // After the cycle boundary the queue order is [1, 2, 0].
        let order: Vec<usize> = queue.iter().map(|seed| seed.seed_id).collect();
        assert_eq!(order, vec![1, 2, 0]);

        let second = scheduler.select_next(&mut queue, 100).unwrap();
        assert_eq!(queue.get(second).seed_id, 2);
        let third = scheduler.select_next(&mut queue, 100).unwrap();
        assert_eq!(queue.get(third).seed_id, 0);
    }

    #[test]
    fn every_seed_selected_once_per_cycle() {
        let mut queue = SeedQueue::new();
        for i in 0..5u64 {
            queue.add(PathBuf::from(i.to_string()), i * 3, 10 + i, 1 + i);
        }
        let mut scheduler = Scheduler::new(StdRand::with_seed(1234));

        for _ in 0..3 {
            let mut picked = Vec::new();
            for _ in 0..queue.len() {
                let idx = scheduler.select_next(&mut queue, 4).unwrap();
                picked.push(queue.get(idx).seed_id);
            }
            picked.sort_unstable();
            assert_eq!(picked, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn empty_queue_selects_nothing() {
        let mut queue = SeedQueue::new();
        let mut scheduler = Scheduler::new(MaxRand);
        assert_eq!(scheduler.select_next(&mut queue, 0), None);
    }

    #[test]
    fn power_walks_both_adjustment_tables() {
        // avg_us = 100, avg_cov = 100 over four entries.
        let stats = QueueStats {
            total_us: 400,
            total_cycles: 4,
            total_cov: 400,
            total_entries: 4,
        };
        // Time rule 10 * 4 < 100 scores 300, coverage rule 1000 * 0.3 > 100
        // triples it; 900 / 100 = 9 mutants.
        assert_eq!(power_schedule(&seed("s", 1000, 10, 1), &stats), 9);
        // A slow, low-coverage seed bottoms out at the minimum.
        assert_eq!(power_schedule(&seed("s", 10, 100_000, 1), &stats), 1);
    }

    #[test]
    fn power_without_history_uses_the_seed_itself() {
        let stats = QueueStats::default();
        // Compared against itself the seed is exactly average.
        assert_eq!(power_schedule(&seed("s", 50, 777, 1), &stats), 1);
    }

    #[test]
    fn power_stays_within_bounds() {
        let stats = QueueStats {
            total_us: 1_000_000,
            total_cycles: 10,
            total_cov: 10,
            total_entries: 10,
        };
        for coverage in [0, 1, 100, 100_000] {
            for exec_time_us in [1, 100, 100_000, 10_000_000] {
                let power = power_schedule(&seed("s", coverage, exec_time_us, 1), &stats);
                assert!((1..=POWER_MAX).contains(&power));
            }
        }
    }
}
