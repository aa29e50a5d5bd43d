/// Double-clap gesture recognition
///
/// Pairs consecutive claps that fall within a time window, and hands the
/// resulting event to a poller through a single-slot atomic flag.

use cache_padded::CachePadded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::trace;

/// Temporal state machine pairing claps into double claps
///
/// Timestamps are monotonic offsets from an arbitrary origin (loop start for
/// live capture, the start of the recording for offline scans).
#[derive(Debug, Clone)]
pub struct DoubleClapTracker {
    window: Duration,
    pending: Option<Duration>,
}

impl DoubleClapTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
        }
    }

    /// Feed the clap decision for the frame read at `now`
    ///
    /// Returns true when this clap completes a double clap. The window check
    /// is inclusive. A completed pair consumes the pending clap, so a third
    /// clap starts a new pair.
    pub fn observe(&mut self, clap: bool, now: Duration) -> bool {
        if !clap {
            return false;
        }

        match self.pending {
            Some(first) if now.saturating_sub(first) <= self.window => {
                trace!("Clap at {:?} pairs with {:?}", now, first);
                self.pending = None;
                true
            }
            _ => {
                trace!("Clap at {:?} is pending", now);
                self.pending = Some(now);
                false
            }
        }
    }

    /// Timestamp of the unpaired clap, if any
    pub fn pending(&self) -> Option<Duration> {
        self.pending
    }
}

/// Sticky "double clap happened" event shared between the detection loop
/// and the poller
#[derive(Debug, Default)]
pub struct DoubleClapFlag {
    raised: CachePadded<AtomicBool>,
}

impl DoubleClapFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag; repeated raises before a consume collapse into one
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    /// Clear the flag, returning whether it was set
    pub fn consume(&self) -> bool {
        self.raised.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}
