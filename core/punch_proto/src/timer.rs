//! Tickers, attempt budgets and jitter for retry loops
//!
//! Everything here is driven by explicit `Instant`s passed in by the caller,
//! so event loops decide when to look at the clock and tests can step time
//! forward without sleeping.

use std::time::{Duration, Instant};

use ring::rand::{SecureRandom, SystemRandom};

// ============================================================================
// Jitter
// ============================================================================

/// Source of random delay added on top of a base interval
#[derive(Clone)]
pub struct Jitter {
    rng: SystemRandom,
    spread: Duration,
}

impl Jitter {
    /// Jitter drawn uniformly from `[0, spread)`
    pub fn new(spread: Duration) -> Self {
        Self {
            rng: SystemRandom::new(),
            spread,
        }
    }

    /// No jitter at all
    pub fn none() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn spread(&self) -> Duration {
        self.spread
    }

    /// Draw one random delay
    pub fn sample(&self) -> Duration {
        let spread_ms = self.spread.as_millis() as u64;
        if spread_ms == 0 {
            return Duration::ZERO;
        }

        let mut bytes = [0u8; 8];
        if self.rng.fill(&mut bytes).is_err() {
            log::debug!("System RNG unavailable, jitter disabled for this tick");
            return Duration::ZERO;
        }

        Duration::from_millis(u64::from_be_bytes(bytes) % spread_ms)
    }

    /// `base` plus one random delay
    pub fn apply(&self, base: Duration) -> Duration {
        base + self.sample()
    }
}

impl std::fmt::Debug for Jitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jitter").field("spread", &self.spread).finish()
    }
}

// ============================================================================
// Ticker
// ============================================================================

/// Periodic deadline with optional jitter
///
/// A tick that is polled late fires once; missed periods are not replayed.
#[derive(Debug, Clone)]
pub struct Ticker {
    interval: Duration,
    jitter: Jitter,
    next: Instant,
}

impl Ticker {
    /// First tick one interval after `now`
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self::with_jitter(interval, Jitter::none(), now)
    }

    /// First tick one jittered interval after `now`
    pub fn with_jitter(interval: Duration, jitter: Jitter, now: Instant) -> Self {
        let next = now + jitter.apply(interval);
        Self {
            interval,
            jitter,
            next,
        }
    }

    /// When the ticker next fires
    pub fn deadline(&self) -> Instant {
        self.next
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns true (once) if the deadline has passed, and schedules the next
    /// tick relative to `now`
    pub fn poll(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }
        self.next = now + self.jitter.apply(self.interval);
        true
    }

    /// Change the period; the next tick is one new interval after `now`
    pub fn reset(&mut self, interval: Duration, jitter: Jitter, now: Instant) {
        self.interval = interval;
        self.jitter = jitter;
        self.next = now + self.jitter.apply(interval);
    }

    /// Time left until the next tick (zero if overdue)
    pub fn remaining(&self, now: Instant) -> Duration {
        self.next.saturating_duration_since(now)
    }
}

// ============================================================================
// Attempt Budget
// ============================================================================

/// Bounded attempt counter for retry loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    limit: u32,
    used: u32,
}

impl Budget {
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    /// Take one attempt; returns false once the budget is spent
    pub fn try_consume(&mut self) -> bool {
        if self.used >= self.limit {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }
}

/// Earliest of a set of optional deadlines
pub fn earliest(deadlines: impl IntoIterator<Item = Option<Instant>>) -> Option<Instant> {
    deadlines.into_iter().flatten().min()
}

// ============================================================================
// Tests
// ============================================================================
