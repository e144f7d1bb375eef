//! One-shot latches and the process-wide shutdown flag

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Granularity used when sleeping while watching the shutdown flag
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

// ============================================================================
// One-shot latch
// ============================================================================

/// A value that can be set exactly once
///
/// Later `fire` calls are no-ops that report `false`, so a duplicate event
/// (a second `pong3`, another probe after the punch) never re-triggers the
/// transition it guards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneShot<T> {
    value: Option<T>,
}

impl<T> OneShot<T> {
    pub fn new() -> Self {
        Self { value: None }
    }

    /// Set the value if unset; returns true only for the first call
    pub fn fire(&mut self, value: T) -> bool {
        if self.value.is_some() {
            return false;
        }
        self.value = Some(value);
        true
    }

    pub fn is_fired(&self) -> bool {
        self.value.is_some()
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

impl<T> Default for OneShot<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Shutdown
// ============================================================================

/// Shared cancellation flag
///
/// Cloned into every listener, sweeper and agent loop. Loops check it between
/// polls, so they exit within one poll interval of the flag being raised.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag on SIGINT or SIGTERM
    pub fn register_signals(&self) -> io::Result<()> {
        for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register(sig, Arc::clone(&self.flag))?;
        }
        Ok(())
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` or until shutdown; returns true if shut down
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_triggered() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep((deadline - now).min(SHUTDOWN_POLL));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oneshot_fires_once() {
        let mut latch = OneShot::new();
        assert!(!latch.is_fired());
        assert!(latch.fire("first"));
        assert!(!latch.fire("second"));
        assert_eq!(latch.get(), Some(&"first"));
    }

    #[test]
    fn test_shutdown_shared_between_clones() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        assert!(!clone.is_triggered());
        shutdown.trigger();
        assert!(clone.is_triggered());
    }

    #[test]
    fn test_sleep_returns_early_on_trigger() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            trigger.trigger();
        });

        let start = Instant::now();
        assert!(shutdown.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_sleep_runs_full_duration() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.sleep(Duration::from_millis(10)));
    }
}
