//! Serialized SMP scheduling for the simulated machine.
//!
//! Only one vCPU executes at a time. The [`VcpuScheduler`] decides which
//! one, and for how many retired instructions (its **quantum**) before
//! the next vCPU gets a turn:
//!
//! - **Round-robin**: every turn lasts `quantum` instructions.
//! - **Randomized**: each turn's length is drawn from a seeded ChaCha20
//!   stream, so a given seed always produces the same interleaving.
//!
//! The scheduler state (active vCPU, remaining quantum, PRNG position) is
//! part of the machine's save slot, so a restore replays the exact same
//! interleaving.

use rand::RngCore;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// How turn lengths are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingStrategy {
    /// Every turn lasts exactly `quantum` instructions.
    RoundRobin,
    /// Each turn lasts a value drawn from `[min_quantum, max_quantum)`.
    Randomized {
        /// Shortest turn.
        min_quantum: u64,
        /// Upper bound (exclusive) of a turn.
        max_quantum: u64,
    },
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Instructions per turn for the first turn and for round-robin.
    pub quantum: u64,
    /// Turn-length strategy.
    pub strategy: SchedulingStrategy,
    /// PRNG seed.
    pub seed: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            quantum: 64,
            strategy: SchedulingStrategy::RoundRobin,
            seed: 0,
        }
    }
}

/// Picks the running vCPU of a serialized SMP machine.
#[derive(Debug, Clone)]
pub struct VcpuScheduler {
    vcpus: usize,
    active: usize,
    remaining: u64,
    quantum: u64,
    strategy: SchedulingStrategy,
    rng: ChaCha20Rng,
}

impl VcpuScheduler {
    /// Create a scheduler for `vcpus` vCPUs, starting on vCPU 0.
    pub fn new(vcpus: usize, config: &SchedulerConfig) -> Self {
        let mut key = [0u8; 32];
        // Domain-separated key for the scheduler stream.
        key[..8].copy_from_slice(&config.seed.to_le_bytes());
        key[8..16].copy_from_slice(b"vcpusch\0");
        let quantum = config.quantum.max(1);
        Self {
            vcpus: vcpus.max(1),
            active: 0,
            remaining: quantum,
            quantum,
            strategy: config.strategy,
            rng: ChaCha20Rng::from_seed(key),
        }
    }

    /// Index of the vCPU whose turn it is.
    #[inline]
    pub fn active(&self) -> usize {
        self.active
    }

    /// Instructions left in the current turn.
    #[inline]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Account one retired instruction.
    ///
    /// Returns the next vCPU when the turn is over.
    pub fn retire(&mut self) -> Option<usize> {
        if self.vcpus <= 1 {
            return None;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining > 0 {
            return None;
        }
        self.active = (self.active + 1) % self.vcpus;
        self.remaining = self.draw_quantum();
        Some(self.active)
    }

    fn draw_quantum(&mut self) -> u64 {
        match self.strategy {
            SchedulingStrategy::RoundRobin => self.quantum,
            SchedulingStrategy::Randomized {
                min_quantum,
                max_quantum,
            } => {
                let span = max_quantum.saturating_sub(min_quantum).max(1);
                (min_quantum + self.rng.next_u64() % span).max(1)
            }
        }
    }

    /// Capture the scheduler position.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            active: self.active,
            remaining: self.remaining,
            rng_seed: self.rng.get_seed(),
            rng_word_pos: self.rng.get_word_pos(),
        }
    }

    /// Return to a captured position. Strategy and vCPU count are kept.
    pub fn restore(&mut self, snap: &SchedulerSnapshot) {
        self.active = snap.active;
        self.remaining = snap.remaining;
        self.rng = ChaCha20Rng::from_seed(snap.rng_seed);
        self.rng.set_word_pos(snap.rng_word_pos);
    }
}

/// Scheduler position inside the save slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub active: usize,
    pub remaining: u64,
    pub rng_seed: [u8; 32],
    pub rng_word_pos: u128,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(sched: &mut VcpuScheduler, steps: usize) -> Vec<usize> {
        (0..steps)
            .map(|_| {
                let now = sched.active();
                sched.retire();
                now
            })
            .collect()
    }

    #[test]
    fn single_vcpu_never_switches() {
        let mut sched = VcpuScheduler::new(1, &SchedulerConfig::default());
        for _ in 0..500 {
            assert_eq!(sched.retire(), None);
        }
        assert_eq!(sched.active(), 0);
    }

    #[test]
    fn round_robin_alternates_by_quantum() {
        let config = SchedulerConfig {
            quantum: 3,
            ..Default::default()
        };
        let mut sched = VcpuScheduler::new(2, &config);
        assert_eq!(
            trace(&mut sched, 12),
            vec![0, 0, 0, 1, 1, 1, 0, 0, 0, 1, 1, 1]
        );
    }

    #[test]
    fn zero_quantum_is_clamped() {
        let config = SchedulerConfig {
            quantum: 0,
            ..Default::default()
        };
        let mut sched = VcpuScheduler::new(3, &config);
        assert_eq!(trace(&mut sched, 4), vec![0, 1, 2, 0]);
    }

    #[test]
    fn randomized_quanta_stay_in_range_and_vary() {
        let config = SchedulerConfig {
            quantum: 10,
            strategy: SchedulingStrategy::Randomized {
                min_quantum: 5,
                max_quantum: 40,
            },
            seed: 7,
        };
        let mut sched = VcpuScheduler::new(2, &config);
        let mut turns = Vec::new();
        for _ in 0..5_000 {
            if sched.retire().is_some() {
                turns.push(sched.remaining());
            }
        }
        assert!(turns.len() > 10);
        assert!(turns.iter().all(|&q| (5..40).contains(&q)), "{:?}", turns);
        assert!(turns.iter().any(|&q| q != turns[0]), "quanta never varied");
    }

    #[test]
    fn same_seed_same_interleaving() {
        let run = |seed| {
            let config = SchedulerConfig {
                quantum: 4,
                strategy: SchedulingStrategy::Randomized {
                    min_quantum: 1,
                    max_quantum: 20,
                },
                seed,
            };
            trace(&mut VcpuScheduler::new(4, &config), 1_000)
        };
        assert_eq!(run(42), run(42));
        assert_ne!(run(42), run(43));
    }

    #[test]
    fn restore_replays_interleaving() {
        let config = SchedulerConfig {
            quantum: 4,
            strategy: SchedulingStrategy::Randomized {
                min_quantum: 2,
                max_quantum: 30,
            },
            seed: 99,
        };
        let mut sched = VcpuScheduler::new(3, &config);
        trace(&mut sched, 137);
        let snap = sched.snapshot();
        let after = trace(&mut sched, 400);

        let mut other = VcpuScheduler::new(3, &config);
        other.restore(&snap);
        assert_eq!(trace(&mut other, 400), after);
    }
}
