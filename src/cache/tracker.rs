//! Per-object cache metadata.
//!
//! A [`FileTracker`] exists for every object the cache knows about and is
//! the source of truth for that object's lifecycle phase and access
//! statistics.  Trackers are created and mutated only by the cache manager;
//! everything here is bookkeeping with no I/O of its own.

use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::warn;

use super::score::{normalize, Ewma};

/// Smoothing factor for the inter-access gap average.
const ACCESS_DELTA_ALPHA: f64 = 0.2;
/// Seed for the inter-access gap average, in milliseconds.
const ACCESS_DELTA_SEED_MS: f64 = 1000.0;
/// Access frequency (1/ms) at which the frequency signal saturates: about
/// once per second.
const FREQ_HIGH: f64 = 0.001;
/// Inverse recency gap (1/ms) at which the recency signal saturates: a last
/// access roughly 20 seconds ago.
const RECENCY_HIGH: f64 = 0.00005;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Lifecycle phase of a cached object.
///
/// Legal transitions: `Pending -> Precached -> OnDisk -> Gone`, with direct
/// exits to `Gone` from every live phase.  There is no demotion from
/// `OnDisk` back to `Precached`; a hot disk-tier object is served from disk
/// reads instead of being re-buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// A fill is in flight; no bytes are available yet.
    Pending,
    /// Fully buffered in the memory tier.
    Precached,
    /// Stored as a file in the disk tier.
    OnDisk,
    /// Evicted or invalidated.  A `Gone` tracker is removed from the
    /// table, never retained as a tombstone.
    Gone,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Precached => "precached",
            Phase::OnDisk => "on-disk",
            Phase::Gone => "gone",
        }
    }

    /// Whether the transition `self -> next` is part of the lifecycle.
    pub fn can_transition_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Pending, Phase::Precached)
                | (Phase::Pending, Phase::Gone)
                | (Phase::Precached, Phase::OnDisk)
                | (Phase::Precached, Phase::Gone)
                | (Phase::OnDisk, Phase::Gone)
        )
    }
}

// ---------------------------------------------------------------------------
// FileTracker
// ---------------------------------------------------------------------------

/// Metadata record for a single cached object.
#[derive(Debug)]
pub struct FileTracker {
    key: String,
    size: u64,
    /// Creation sequence number; distinguishes a re-created tracker from
    /// the one an in-flight fill task was started for.
    seq: u64,
    phase: Phase,
    birth: Instant,
    access_count: u64,
    last_access: Instant,
    avg_access_delta: Ewma,
    hash: Option<String>,
    ready_tx: watch::Sender<bool>,
}

impl FileTracker {
    /// Create a tracker in [`Phase::Pending`] for an object of `size` bytes.
    pub fn new(key: impl Into<String>, size: u64, seq: u64) -> Self {
        let now = Instant::now();
        let (ready_tx, _) = watch::channel(false);
        Self {
            key: key.into(),
            size,
            seq,
            phase: Phase::Pending,
            birth: now,
            access_count: 0,
            last_access: now,
            avg_access_delta: Ewma::new(ACCESS_DELTA_SEED_MS, ACCESS_DELTA_ALPHA),
            hash: None,
            ready_tx,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Content hash recorded once the object was fully buffered.
    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    pub fn record_hash(&mut self, hash: String) {
        self.hash = Some(hash);
    }

    /// Advance the lifecycle phase.  Illegal transitions are rejected and
    /// logged; the phase is left unchanged and `false` is returned.
    pub fn set_phase(&mut self, next: Phase) -> bool {
        if !self.phase.can_transition_to(next) {
            warn!(
                key = %self.key,
                from = self.phase.label(),
                to = next.label(),
                "rejecting illegal tracker phase transition"
            );
            return false;
        }
        self.phase = next;
        true
    }

    /// Record an access: bump the counter, fold the gap since the previous
    /// access into the moving average, and stamp `last_access`.
    pub fn touch(&mut self) {
        let now = Instant::now();
        let gap_ms = now.duration_since(self.last_access).as_secs_f64() * 1000.0;
        self.avg_access_delta.put(gap_ms);
        self.access_count += 1;
        self.last_access = now;
    }

    /// Time since the tracker was created; compared against the TTL.
    pub fn age(&self) -> Duration {
        self.birth.elapsed()
    }

    /// Eviction priority, derived on demand.  Blends normalized access
    /// frequency and recency; higher means more worth keeping (and more
    /// worth the durability of the disk tier).
    pub fn score(&self) -> f64 {
        let access_freq = 1.0 / self.avg_access_delta.get();
        let n_freq = normalize(FREQ_HIGH, access_freq);

        let recency_gap_ms = self.last_access.elapsed().as_secs_f64() * 1000.0;
        let n_recency = normalize(RECENCY_HIGH, 1.0 / recency_gap_ms);

        0.5 * n_freq + 0.5 * n_recency
    }

    /// Subscribe to the fill-completion signal.  The value flips to `true`
    /// exactly once, when the tracker leaves [`Phase::Pending`] for any
    /// reason (fill completed or torn down).
    pub fn ready_signal(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Wake everyone waiting on [`Self::ready_signal`].
    pub fn release_waiters(&self) {
        self.ready_tx.send_replace(true);
    }
}
