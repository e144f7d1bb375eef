//! Ephemeral peer registry
//!
//! Maps a peer id to the public endpoint it was last seen from, the phase it
//! reported and an absolute expiry. Every write refreshes the expiry, and a
//! periodic sweep drops records nobody has refreshed.
//!
//! All access goes through the methods below; callers never see the map, so
//! each operation is atomic under the lock. Nothing is atomic *across* calls:
//! a record can be swept between `select_one_match` and the following
//! `delete`, which only costs the two peers one failed punch attempt.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

// ============================================================================
// Record Types
// ============================================================================

/// How far a peer has progressed with the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Seen via `ping1`
    Probe1 = 1,
    /// Seen via `ping2`
    Probe2 = 2,
    /// Reporting/requesting; the only phase eligible for matching
    Seeking = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// `host:port` the peer was last seen from
    pub public: String,
    pub phase: Phase,
    pub expires_at: Instant,
}

impl PeerRecord {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at < now
    }
}

// ============================================================================
// Registry
// ============================================================================

pub struct Registry {
    /// Lifetime given to a record on every write
    ttl: Duration,
    records: RwLock<HashMap<String, PeerRecord>>,
}

impl Registry {
    pub fn new(ttl: Duration) -> Self {
        Registry {
            ttl,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    // A panic while holding the lock cannot leave a half-written record
    // behind (every write is a single insert/remove), so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, PeerRecord>> {
        self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, PeerRecord>> {
        self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Upsert `id` with a fresh expiry
    ///
    /// Last writer wins: the endpoint and phase are overwritten even if the
    /// stored record is "further along" than the incoming one.
    pub fn set(&self, id: &str, public: &str, phase: Phase) {
        self.set_at(id, public, phase, Instant::now());
    }

    /// [`Registry::set`] with an explicit clock
    pub fn set_at(&self, id: &str, public: &str, phase: Phase, now: Instant) {
        let record = PeerRecord {
            public: public.to_string(),
            phase,
            expires_at: now + self.ttl,
        };

        if let Some(previous) = self.write().insert(id.to_string(), record) {
            if previous.phase != phase || previous.public != public {
                log::debug!(
                    "Registry update for '{}': {} phase {:?} -> {} phase {:?}",
                    id,
                    previous.public,
                    previous.phase,
                    public,
                    phase
                );
            }
        } else {
            log::debug!("Registered '{}' at {} (phase {:?})", id, public, phase);
        }
    }

    pub fn get(&self, id: &str) -> Option<PeerRecord> {
        self.read().get(id).cloned()
    }

    /// Remove `id`; returns whether a record existed
    pub fn delete(&self, id: &str) -> bool {
        self.write().remove(id).is_some()
    }

    /// Any record in `phase` other than `exclude`, as `(id, public)`
    ///
    /// Iteration order is unspecified, so with several candidates waiting the
    /// choice is arbitrary.
    pub fn select_one_match(&self, exclude: &str, phase: Phase) -> Option<(String, String)> {
        self.read()
            .iter()
            .find(|(id, record)| id.as_str() != exclude && record.phase == phase)
            .map(|(id, record)| (id.clone(), record.public.clone()))
    }

    /// Drop every record whose expiry is before `now`; returns how many
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut records = self.write();
        let before = records.len();
        records.retain(|id, record| {
            let keep = !record.is_expired(now);
            if !keep {
                log::debug!("Expired '{}' ({})", id, record.public);
            }
            keep
        });
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
