//! Two-tier content cache manager.
//!
//! Whole objects are cached in a memory tier (the precache) and an on-disk
//! tier in front of the backing file store.  Ingestion tees the object's
//! byte stream so the original consumer is served while the cache buffers a
//! copy; capacity maintenance runs synchronously inside ingestion, promoting
//! or evicting entries by their recency/frequency score.  There is no
//! background sweep: TTL expiry and capacity checks happen on the
//! operations that need them.
//!
//! Objects are assumed to be accessed through a single daemon at a time;
//! cross-node coherence is out of scope.  Staleness is handled by the
//! write-hash event feed and the TTL.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::diagnostics::{ErrorReporter, Report};
use crate::metrics::MetricsRegistry;
use crate::node::FsNode;

use super::score::Ewma;
use super::tee::{pausing_tee, ByteStream};
use super::tracker::{FileTracker, Phase};

/// Smoothing factor for the diagnostic hit-rate estimate.
const HIT_RATE_ALPHA: f64 = 0.2;

// ---------------------------------------------------------------------------
// Result and status types
// ---------------------------------------------------------------------------

/// Outcome of offering a stream to [`FileCacheService::maybe_store`].
///
/// `stream` replaces the input stream and must be consumed by the caller
/// from here on: it is either the caller-facing branch of the ingestion tee
/// or, when nothing was stored, the original stream handed back unchanged.
pub struct StoreOutcome {
    /// Whether the object is now (or already was) tracked by the cache.
    pub cached: bool,
    pub stream: ByteStream,
}

/// Read-only usage snapshot for the introspection surface.
#[derive(Debug, Serialize)]
pub struct CacheStatus {
    pub precache: TierStatus,
    pub disk: TierStatus,
    pub hit_rate: f64,
    pub tracked_objects: usize,
}

#[derive(Debug, Serialize)]
pub struct TierStatus {
    pub used: u64,
    pub capacity: u64,
}

// ---------------------------------------------------------------------------
// FileCacheService
// ---------------------------------------------------------------------------

/// Mutable cache state, guarded by a single async mutex.  Every `.await`
/// taken outside the guard is a re-entrancy point; phase checks made before
/// it must be re-validated after resumption.
struct CacheState {
    /// Memory-tier buffers, keyed by object uid.
    precache: HashMap<String, Bytes>,
    /// Source of truth for phase and scoring.
    trackers: HashMap<String, FileTracker>,
    /// Diagnostic hit/miss estimate; does not affect placement.
    hit_rate: Ewma,
    next_seq: u64,
}

/// The cache manager: owns the memory buffer table, the disk directory and
/// the tracker table.
pub struct FileCacheService {
    precache_capacity: u64,
    disk_capacity: u64,
    disk_max_file_size: u64,
    ttl: Duration,
    pending_wait: Duration,
    path: PathBuf,
    state: Mutex<CacheState>,
    reporter: ErrorReporter,
    metrics: MetricsRegistry,
}

impl FileCacheService {
    pub fn new(config: &CacheConfig, reporter: ErrorReporter, metrics: MetricsRegistry) -> Self {
        Self {
            precache_capacity: config.precache_capacity,
            disk_capacity: config.disk_capacity,
            disk_max_file_size: config.disk_max_file_size,
            ttl: Duration::from_millis(config.ttl_ms),
            pending_wait: Duration::from_millis(config.pending_wait_ms),
            path: PathBuf::from(&config.path),
            state: Mutex::new(CacheState {
                precache: HashMap::new(),
                trackers: HashMap::new(),
                hit_rate: Ewma::new(0.0, HIT_RATE_ALPHA),
                next_seq: 0,
            }),
            reporter,
            metrics,
        }
    }

    /// Prepare the disk tier: create the cache directory and remove files
    /// left behind by a previous run.  With the tracker table empty those
    /// files could never be served and would distort disk accounting.
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.path)
            .await
            .with_context(|| format!("failed to create cache dir: {}", self.path.display()))?;

        let removed = self.sweep_orphans().await?;
        if removed > 0 {
            info!(
                removed,
                path = %self.path.display(),
                "removed orphaned cache files from a previous run"
            );
        }
        Ok(())
    }

    async fn sweep_orphans(&self) -> Result<usize> {
        let mut removed = 0usize;
        let mut entries = tokio::fs::read_dir(&self.path)
            .await
            .with_context(|| format!("failed to read cache dir: {}", self.path.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(
                        path = %entry.path().display(),
                        error = %e,
                        "failed to remove orphaned cache file"
                    );
                }
            }
        }
        Ok(removed)
    }

    /// On-disk location for a cache key.  The disk tier is a flat
    /// directory, one file per key, no sidecar metadata.
    fn entry_path(&self, uid: &str) -> PathBuf {
        self.path.join(uid)
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Return the cached bytes for `uid`, or `None` on a miss.
    ///
    /// Every internal failure (expired entry, stalled fill, disk read
    /// error, broken invariant) resolves to a miss; the caller falls back
    /// to its own backing-store read.
    pub async fn try_get(&self, uid: &str) -> Option<Bytes> {
        let mut st = self.state.lock().await;

        let expired = match st.trackers.get_mut(uid) {
            None => return self.miss(&mut st),
            Some(tracker) => {
                if tracker.age() > self.ttl {
                    true
                } else {
                    tracker.touch();
                    false
                }
            }
        };

        if expired {
            debug!(key = %uid, "cached entry outlived its ttl");
            self.invalidate_locked(&mut st, uid).await;
            return self.miss(&mut st);
        }

        // An in-flight fill gets a bounded grace period; whatever phase is
        // observed after resumption decides the outcome.
        if st.trackers.get(uid).map(|t| t.phase()) == Some(Phase::Pending) {
            let mut ready = match st.trackers.get(uid) {
                Some(tracker) => tracker.ready_signal(),
                None => return self.miss(&mut st),
            };
            drop(st);
            let _ = timeout(self.pending_wait, ready.wait_for(|ready| *ready)).await;
            st = self.state.lock().await;
        }

        let phase = match st.trackers.get(uid) {
            Some(tracker) => tracker.phase(),
            None => return self.miss(&mut st),
        };

        match phase {
            Phase::Precached => match st.precache.get(uid).cloned() {
                Some(data) => {
                    debug!(key = %uid, "obtained from precache");
                    self.hit(&mut st);
                    Some(data)
                }
                None => {
                    self.reporter.report(
                        "file_cache:unexpected-cache-state",
                        Report {
                            message: format!("precached entry {uid} has no memory buffer"),
                            trace: true,
                            alarm: true,
                            extra: Some(json!({ "key": uid, "phase": phase.label() })),
                        },
                    );
                    self.miss(&mut st)
                }
            },
            Phase::OnDisk => {
                let path = self.entry_path(uid);
                match tokio::fs::read(&path).await {
                    Ok(data) => {
                        debug!(key = %uid, "obtained from disk");
                        self.hit(&mut st);
                        Some(Bytes::from(data))
                    }
                    Err(e) => {
                        self.reporter.report(
                            "file_cache:read_error",
                            Report {
                                message: format!("failed to read cached file for {uid}: {e}"),
                                trace: true,
                                alarm: true,
                                extra: Some(json!({ "key": uid })),
                            },
                        );
                        self.miss(&mut st)
                    }
                }
            }
            // The fill did not finish inside the grace period.
            Phase::Pending => self.miss(&mut st),
            Phase::Gone => {
                self.reporter.report(
                    "file_cache:unexpected-cache-state",
                    Report {
                        message: format!("unexpected cache state: {}", phase.label()),
                        trace: true,
                        alarm: true,
                        extra: Some(json!({ "key": uid, "phase": phase.label() })),
                    },
                );
                self.miss(&mut st)
            }
        }
    }

    fn hit(&self, st: &mut CacheState) {
        st.hit_rate.put(1.0);
        self.metrics.metrics.cache_hits.inc();
    }

    fn miss(&self, st: &mut CacheState) -> Option<Bytes> {
        st.hit_rate.put(0.0);
        self.metrics.metrics.cache_misses.inc();
        None
    }

    // -----------------------------------------------------------------------
    // Ingestion
    // -----------------------------------------------------------------------

    /// Offer a freshly fetched object for caching.
    ///
    /// Returns immediately with the stream the caller should consume;
    /// buffering and hashing happen on the tee'd branch in the background,
    /// so caching never delays the caller.  Objects above the admission
    /// ceiling and objects that are already tracked pass the stream back
    /// unchanged.
    pub async fn maybe_store(self: Arc<Self>, node: &FsNode, stream: ByteStream) -> StoreOutcome {
        let size = node.size();
        if size > self.disk_max_file_size {
            debug!(key = %node.uid(), size, "object above admission ceiling, not caching");
            self.metrics.metrics.stores_declined.inc();
            return StoreOutcome {
                cached: false,
                stream,
            };
        }

        let uid = node.uid().to_string();
        let seq = {
            let mut st = self.state.lock().await;
            if st.trackers.contains_key(&uid) {
                return StoreOutcome {
                    cached: true,
                    stream,
                };
            }
            st.next_seq += 1;
            let seq = st.next_seq;
            let mut tracker = FileTracker::new(&uid, size, seq);
            tracker.touch();
            st.trackers.insert(uid.clone(), tracker);
            seq
        };

        let (caller_stream, store_stream) = pausing_tee(stream);

        let svc = Arc::clone(&self);
        tokio::spawn(async move {
            if let Err(e) = svc.fill(&uid, size, seq, store_stream).await {
                svc.metrics.metrics.ingest_failures.inc();
                svc.reporter.report(
                    "file_cache:ingest_error",
                    Report {
                        message: format!("cache fill for {uid} failed: {e:#}"),
                        trace: false,
                        alarm: false,
                        extra: Some(json!({ "key": uid.clone() })),
                    },
                );
                svc.abort_fill(&uid, seq).await;
            }
        });

        StoreOutcome {
            cached: true,
            stream: caller_stream,
        }
    }

    /// Consume the cache-facing tee branch: buffer the object, hash it
    /// incrementally, then move the tracker to `Precached`.
    async fn fill(&self, uid: &str, size: u64, seq: u64, mut stream: ByteStream) -> Result<()> {
        let mut buf = BytesMut::with_capacity(size as usize);
        let mut hasher = Sha256::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("reading object stream")?;
            if (buf.len() + chunk.len()) as u64 > size {
                anyhow::bail!("object exceeded its declared size of {size} bytes");
            }
            hasher.update(&chunk);
            buf.extend_from_slice(&chunk);
            self.metrics.metrics.ingest_bytes.inc_by(chunk.len() as u64);
        }
        if buf.len() as u64 != size {
            anyhow::bail!("object ended at {} bytes, expected {size}", buf.len());
        }
        let hash = hex::encode(hasher.finalize());

        let mut st = self.state.lock().await;

        // The tracker may have been invalidated (or replaced) while the
        // bytes were in flight; storing the buffer would resurrect a dead
        // entry.
        let still_ours = st
            .trackers
            .get(uid)
            .map(|t| t.phase() == Phase::Pending && t.seq() == seq)
            .unwrap_or(false);
        if !still_ours {
            debug!(key = %uid, "tracker gone before fill completed, discarding buffer");
            return Ok(());
        }

        self.make_room_in_precache(&mut st, size).await;

        st.precache.insert(uid.to_string(), buf.freeze());
        if let Some(tracker) = st.trackers.get_mut(uid) {
            tracker.record_hash(hash);
            tracker.set_phase(Phase::Precached);
            tracker.release_waiters();
        }
        debug!(key = %uid, size, "object buffered in precache");
        self.update_usage_gauges(&st);
        Ok(())
    }

    /// Tear down the tracker after a failed fill so it is not left
    /// `Pending` until the TTL sweeps it.
    async fn abort_fill(&self, uid: &str, seq: u64) {
        let mut st = self.state.lock().await;
        let still_ours = st
            .trackers
            .get(uid)
            .map(|t| t.phase() == Phase::Pending && t.seq() == seq)
            .unwrap_or(false);
        if still_ours {
            self.invalidate_locked(&mut st, uid).await;
        }
    }

    // -----------------------------------------------------------------------
    // Invalidation
    // -----------------------------------------------------------------------

    /// Drop `uid` from whichever tier holds it and forget its tracker.
    /// No-op when the key is untracked.
    pub async fn invalidate(&self, uid: &str) {
        let mut st = self.state.lock().await;
        if st.trackers.contains_key(uid) {
            info!(key = %uid, "invalidating cached entry");
        }
        self.invalidate_locked(&mut st, uid).await;
    }

    /// External consistency signal: the backing store reports a new content
    /// hash for `uid`.  Invalidate when it differs from the recorded hash;
    /// an entry still filling has no recorded hash and is treated as
    /// differing, since its bytes predate the reported write.
    pub async fn on_write_hash(&self, uid: &str, hash: &str) {
        let mut st = self.state.lock().await;
        let Some(tracker) = st.trackers.get(uid) else {
            return;
        };
        if tracker.hash() == Some(hash) {
            return;
        }
        info!(key = %uid, "write hash changed, invalidating cached entry");
        self.invalidate_locked(&mut st, uid).await;
    }

    async fn invalidate_locked(&self, st: &mut CacheState, uid: &str) {
        let Some(tracker) = st.trackers.get(uid) else {
            return;
        };
        match tracker.phase() {
            Phase::Precached => {
                st.precache.remove(uid);
            }
            Phase::OnDisk => {
                let path = self.entry_path(uid);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(
                        key = %uid,
                        error = %e,
                        "failed to unlink cached file during invalidation"
                    );
                }
            }
            Phase::Pending | Phase::Gone => {}
        }

        if let Some(mut tracker) = st.trackers.remove(uid) {
            tracker.set_phase(Phase::Gone);
            tracker.release_waiters();
        }
        self.metrics.metrics.invalidations.inc();
        self.update_usage_gauges(st);
    }

    // -----------------------------------------------------------------------
    // Capacity management
    // -----------------------------------------------------------------------

    fn precache_used(st: &CacheState) -> u64 {
        st.trackers
            .values()
            .filter(|t| t.phase() == Phase::Precached)
            .map(FileTracker::size)
            .sum()
    }

    fn disk_used(st: &CacheState) -> u64 {
        st.trackers
            .values()
            .filter(|t| t.phase() == Phase::OnDisk)
            .map(FileTracker::size)
            .sum()
    }

    /// Free memory-tier capacity for an incoming object of `needed` bytes.
    async fn make_room_in_precache(&self, st: &mut CacheState, needed: u64) {
        let used = Self::precache_used(st);
        if used + needed <= self.precache_capacity {
            return;
        }
        self.evict_from_precache(st, used + needed - self.precache_capacity)
            .await;
    }

    /// Walk memory-tier entries by descending score, attempting to promote
    /// each to disk.  An attempted promotion counts as freed capacity even
    /// when the score gate declines it, so the precache budget is a soft
    /// ceiling under pressure.
    async fn evict_from_precache(&self, st: &mut CacheState, capacity_needed: u64) {
        let mut candidates: Vec<(String, u64, f64)> = st
            .trackers
            .values()
            .filter(|t| t.phase() == Phase::Precached)
            .map(|t| (t.key().to_string(), t.size(), t.score()))
            .collect();
        candidates.sort_by(|a, b| b.2.total_cmp(&a.2));

        let mut freed = 0u64;
        for (key, size, _score) in candidates {
            freed += size;
            self.promote_to_disk(st, &key).await;
            if freed >= capacity_needed {
                break;
            }
        }
    }

    /// Move a memory-tier entry to the disk tier, if it is worth it.
    ///
    /// The candidate must out-score the combined score of the disk
    /// occupants that would have to be evicted to make room for it;
    /// otherwise the promotion is declined and the entry stays in memory.
    async fn promote_to_disk(&self, st: &mut CacheState, uid: &str) {
        let (candidate_size, candidate_score) = match st.trackers.get(uid) {
            Some(t) if t.phase() == Phase::Precached => (t.size(), t.score()),
            _ => return,
        };

        let mut disk: Vec<(String, u64, f64)> = st
            .trackers
            .values()
            .filter(|t| t.phase() == Phase::OnDisk)
            .map(|t| (t.key().to_string(), t.size(), t.score()))
            .collect();
        disk.sort_by(|a, b| b.2.total_cmp(&a.2));

        let capacity_needed =
            (Self::disk_used(st) + candidate_size).saturating_sub(self.disk_capacity);

        let mut covered = 0u64;
        let mut score_needed = 0f64;
        let mut displaced: Vec<String> = Vec::new();
        if capacity_needed > 0 {
            for (key, size, score) in &disk {
                displaced.push(key.clone());
                covered += *size;
                score_needed += *score;
                if covered >= capacity_needed {
                    break;
                }
            }
        }

        if candidate_score < score_needed {
            debug!(
                key = %uid,
                candidate_score,
                score_needed,
                "promotion declined by score gate"
            );
            return;
        }

        for key in displaced {
            self.disk_evict(st, &key).await;
        }

        let Some(data) = st.precache.get(uid).cloned() else {
            self.reporter.report(
                "file_cache:unexpected-cache-state",
                Report {
                    message: format!("precached entry {uid} has no memory buffer"),
                    trace: true,
                    alarm: true,
                    extra: Some(json!({ "key": uid })),
                },
            );
            return;
        };

        let path = self.entry_path(uid);
        if let Err(e) = tokio::fs::write(&path, &data).await {
            // The entry stays in memory; the invariant is intact either way.
            self.reporter.report(
                "file_cache:write_error",
                Report {
                    message: format!("failed to write cache file for {uid}: {e}"),
                    trace: true,
                    alarm: true,
                    extra: Some(json!({ "key": uid })),
                },
            );
            return;
        }

        st.precache.remove(uid);
        if let Some(tracker) = st.trackers.get_mut(uid) {
            tracker.set_phase(Phase::OnDisk);
        }
        self.metrics.metrics.promotions.inc();
        debug!(key = %uid, size = candidate_size, "promoted to disk tier");
    }

    /// Remove a disk-tier entry: unlink its file and forget its tracker.
    async fn disk_evict(&self, st: &mut CacheState, uid: &str) {
        match st.trackers.get(uid) {
            Some(t) if t.phase() == Phase::OnDisk => {}
            _ => return,
        }

        let path = self.entry_path(uid);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(key = %uid, error = %e, "failed to unlink evicted cache file");
        }

        if let Some(mut tracker) = st.trackers.remove(uid) {
            tracker.set_phase(Phase::Gone);
            tracker.release_waiters();
        }
        self.metrics.metrics.disk_evictions.inc();
        debug!(key = %uid, "evicted from disk tier");
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Read-only usage and hit-rate snapshot.
    pub async fn status(&self) -> CacheStatus {
        let st = self.state.lock().await;
        self.update_usage_gauges(&st);
        CacheStatus {
            precache: TierStatus {
                used: Self::precache_used(&st),
                capacity: self.precache_capacity,
            },
            disk: TierStatus {
                used: Self::disk_used(&st),
                capacity: self.disk_capacity,
            },
            hit_rate: st.hit_rate.get(),
            tracked_objects: st.trackers.len(),
        }
    }

    fn update_usage_gauges(&self, st: &CacheState) {
        self.metrics
            .metrics
            .precache_used_bytes
            .set(Self::precache_used(st) as i64);
        self.metrics
            .metrics
            .disk_used_bytes
            .set(Self::disk_used(st) as i64);
    }

    // -----------------------------------------------------------------------
    // Test hooks
    // -----------------------------------------------------------------------

    #[cfg(test)]
    pub(crate) async fn phase_of(&self, uid: &str) -> Option<Phase> {
        self.state.lock().await.trackers.get(uid).map(|t| t.phase())
    }

    #[cfg(test)]
    pub(crate) async fn in_precache(&self, uid: &str) -> bool {
        self.state.lock().await.precache.contains_key(uid)
    }

    #[cfg(test)]
    pub(crate) async fn hash_of(&self, uid: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .trackers
            .get(uid)
            .and_then(|t| t.hash().map(str::to_owned))
    }

    /// Spin until `uid` is no longer mid-fill (or is gone entirely).
    #[cfg(test)]
    pub(crate) async fn wait_settled(&self, uid: &str) {
        loop {
            match self.phase_of(uid).await {
                Some(Phase::Pending) => tokio::time::sleep(Duration::from_millis(1)).await,
                _ => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tempfile::TempDir;

    const KB: u64 = 1024;

    fn test_cache_config(dir: &TempDir) -> CacheConfig {
        CacheConfig {
            path: dir.path().to_string_lossy().into_owned(),
            precache_capacity: 15 * KB,
            disk_capacity: 100 * KB,
            disk_max_file_size: 1024 * KB,
            ttl_ms: 60_000,
            pending_wait_ms: 2_000,
        }
    }

    fn service(config: CacheConfig) -> (Arc<FileCacheService>, MetricsRegistry) {
        let metrics = MetricsRegistry::new();
        let reporter = ErrorReporter::new(metrics.metrics.alarms.clone());
        let svc = Arc::new(FileCacheService::new(&config, reporter, metrics.clone()));
        (svc, metrics)
    }

    async fn ready_service(config: CacheConfig) -> (Arc<FileCacheService>, MetricsRegistry) {
        let (svc, metrics) = service(config);
        svc.init().await.unwrap();
        (svc, metrics)
    }

    fn payload(len: u64, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len as usize])
    }

    fn chunked(data: Bytes) -> ByteStream {
        let chunks: Vec<io::Result<Bytes>> = data
            .chunks(1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Box::pin(futures::stream::iter(chunks))
    }

    async fn drain(mut stream: ByteStream) -> io::Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }

    /// Store `data` under `uid`, consume the caller branch, and wait for
    /// the fill to settle.
    async fn store_settled(svc: &Arc<FileCacheService>, uid: &str, data: Bytes) -> Bytes {
        let node = FsNode::new(uid, data.len() as u64);
        let outcome = svc.clone().maybe_store(&node, chunked(data)).await;
        assert!(outcome.cached);
        let echoed = drain(outcome.stream).await.unwrap();
        svc.wait_settled(uid).await;
        echoed
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    /// Check the phase/table/disk agreement for every live tracker.
    async fn assert_phase_invariant(svc: &Arc<FileCacheService>) {
        let st = svc.state.lock().await;
        for (key, tracker) in &st.trackers {
            match tracker.phase() {
                Phase::Precached => {
                    assert!(st.precache.contains_key(key), "{key}: buffer missing");
                    assert!(
                        !svc.entry_path(key).exists(),
                        "{key}: precached entry also on disk"
                    );
                }
                Phase::OnDisk => {
                    assert!(!st.precache.contains_key(key), "{key}: buffer retained");
                    assert!(svc.entry_path(key).exists(), "{key}: disk file missing");
                }
                Phase::Pending => {
                    assert!(!st.precache.contains_key(key), "{key}: pending with buffer");
                }
                Phase::Gone => panic!("{key}: gone tracker retained in table"),
            }
        }
    }

    // ── lookup and round trips ─────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn store_then_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let (svc, _metrics) = ready_service(test_cache_config(&dir)).await;

        let data = payload(10 * KB, b'a');
        let echoed = store_settled(&svc, "obj-a", data.clone()).await;
        assert_eq!(echoed, data);

        let got = svc.try_get("obj-a").await.expect("expected a hit");
        assert_eq!(got, data);

        let status = svc.status().await;
        assert!(status.hit_rate > 0.0);

        let first = status.hit_rate;
        svc.try_get("obj-a").await.expect("expected a hit");
        let status = svc.status().await;
        assert!(status.hit_rate > first);
        assert_phase_invariant(&svc).await;
    }

    #[tokio::test(start_paused = true)]
    async fn untracked_key_is_a_miss() {
        let dir = TempDir::new().unwrap();
        let (svc, metrics) = ready_service(test_cache_config(&dir)).await;

        assert!(svc.try_get("nope").await.is_none());
        assert_eq!(metrics.metrics.cache_misses.get(), 1);
        assert_eq!(metrics.metrics.cache_hits.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_waits_for_inflight_fill() {
        let dir = TempDir::new().unwrap();
        let (svc, _metrics) = ready_service(test_cache_config(&dir)).await;

        let data = payload(3 * KB, b'w');
        let chunks: Vec<Bytes> = data.chunks(1024).map(Bytes::copy_from_slice).collect();
        let slow: ByteStream = Box::pin(futures::stream::iter(chunks).then(|c| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, io::Error>(c)
        }));

        let node = FsNode::new("obj-slow", data.len() as u64);
        let outcome = svc.clone().maybe_store(&node, slow).await;
        assert!(outcome.cached);

        let reader = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.try_get("obj-slow").await })
        };

        let echoed = drain(outcome.stream).await.unwrap();
        assert_eq!(echoed, data);

        let got = reader.await.unwrap().expect("waiter should see the fill");
        assert_eq!(got, data);
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_gives_up_on_stalled_fill() {
        let dir = TempDir::new().unwrap();
        let (svc, _metrics) = ready_service(test_cache_config(&dir)).await;

        let stalled: ByteStream = Box::pin(
            futures::stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"x"))])
                .chain(futures::stream::pending()),
        );
        let node = FsNode::new("obj-stuck", 4 * KB);
        let outcome = svc.clone().maybe_store(&node, stalled).await;
        assert!(outcome.cached);

        // The bounded wait elapses and the lookup resolves to a miss while
        // the fill is still pending.
        assert!(svc.try_get("obj-stuck").await.is_none());
        assert_eq!(svc.phase_of("obj-stuck").await, Some(Phase::Pending));

        // The stranded entry is reaped by TTL expiry on a later lookup.
        tokio::time::advance(Duration::from_millis(61_000)).await;
        assert!(svc.try_get("obj-stuck").await.is_none());
        assert_eq!(svc.phase_of("obj-stuck").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn disk_tier_serves_reads() {
        let dir = TempDir::new().unwrap();
        let (svc, metrics) = ready_service(test_cache_config(&dir)).await;

        let a = payload(10 * KB, b'a');
        store_settled(&svc, "obj-a", a.clone()).await;
        // Second store pushes the first object over the precache budget and
        // promotes it.
        store_settled(&svc, "obj-b", payload(10 * KB, b'b')).await;

        assert_eq!(svc.phase_of("obj-a").await, Some(Phase::OnDisk));
        assert_eq!(metrics.metrics.promotions.get(), 1);

        let got = svc.try_get("obj-a").await.expect("disk read should hit");
        assert_eq!(got, a);
        assert_phase_invariant(&svc).await;
    }

    #[tokio::test(start_paused = true)]
    async fn disk_read_failure_resolves_to_miss() {
        let dir = TempDir::new().unwrap();
        let (svc, metrics) = ready_service(test_cache_config(&dir)).await;

        store_settled(&svc, "obj-a", payload(10 * KB, b'a')).await;
        store_settled(&svc, "obj-b", payload(10 * KB, b'b')).await;
        assert_eq!(svc.phase_of("obj-a").await, Some(Phase::OnDisk));

        // Sabotage the disk tier behind the manager's back.
        std::fs::remove_file(svc.entry_path("obj-a")).unwrap();

        assert!(svc.try_get("obj-a").await.is_none());
        assert_eq!(metrics.metrics.alarms.get(), 1);
    }

    // ── admission ──────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn admission_ceiling_declines_large_objects() {
        let dir = TempDir::new().unwrap();
        let mut config = test_cache_config(&dir);
        config.disk_max_file_size = 8 * KB;
        let (svc, metrics) = ready_service(config).await;

        let data = payload(9 * KB, b'z');
        let node = FsNode::new("obj-big", data.len() as u64);
        let outcome = svc.clone().maybe_store(&node, chunked(data.clone())).await;

        assert!(!outcome.cached);
        assert_eq!(svc.phase_of("obj-big").await, None);
        assert_eq!(metrics.metrics.stores_declined.get(), 1);

        // The original stream is handed back untouched.
        assert_eq!(drain(outcome.stream).await.unwrap(), data);
    }

    #[tokio::test(start_paused = true)]
    async fn second_store_is_an_idempotent_no_op() {
        let dir = TempDir::new().unwrap();
        let (svc, _metrics) = ready_service(test_cache_config(&dir)).await;

        let data = payload(4 * KB, b'd');
        store_settled(&svc, "obj-a", data.clone()).await;

        let node = FsNode::new("obj-a", data.len() as u64);
        let outcome = svc.clone().maybe_store(&node, chunked(data.clone())).await;
        assert!(outcome.cached);
        assert_eq!(drain(outcome.stream).await.unwrap(), data);

        // Still exactly the original bytes cached.
        assert_eq!(svc.try_get("obj-a").await.unwrap(), data);
    }

    // ── ttl ────────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_is_lazy_and_final() {
        let dir = TempDir::new().unwrap();
        let mut config = test_cache_config(&dir);
        config.ttl_ms = 5_000;
        let (svc, metrics) = ready_service(config).await;

        store_settled(&svc, "obj-a", payload(4 * KB, b'a')).await;
        assert!(svc.try_get("obj-a").await.is_some());

        tokio::time::advance(Duration::from_millis(5_001)).await;
        assert!(svc.try_get("obj-a").await.is_none());
        assert_eq!(svc.phase_of("obj-a").await, None);
        assert!(!svc.in_precache("obj-a").await);
        assert_eq!(metrics.metrics.invalidations.get(), 1);

        // No resurrection.
        assert!(svc.try_get("obj-a").await.is_none());
    }

    // ── invalidation ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn explicit_invalidation_covers_both_tiers() {
        let dir = TempDir::new().unwrap();
        let (svc, _metrics) = ready_service(test_cache_config(&dir)).await;

        store_settled(&svc, "obj-a", payload(10 * KB, b'a')).await;
        store_settled(&svc, "obj-b", payload(10 * KB, b'b')).await;
        assert_eq!(svc.phase_of("obj-a").await, Some(Phase::OnDisk));
        assert_eq!(svc.phase_of("obj-b").await, Some(Phase::Precached));

        svc.invalidate("obj-a").await;
        svc.invalidate("obj-b").await;

        assert_eq!(svc.phase_of("obj-a").await, None);
        assert_eq!(svc.phase_of("obj-b").await, None);
        assert!(!svc.entry_path("obj-a").exists());
        assert!(!svc.in_precache("obj-b").await);

        // Untracked keys are a quiet no-op.
        svc.invalidate("obj-a").await;
    }

    #[tokio::test(start_paused = true)]
    async fn matching_write_hash_keeps_the_entry() {
        let dir = TempDir::new().unwrap();
        let (svc, _metrics) = ready_service(test_cache_config(&dir)).await;

        let data = payload(4 * KB, b'h');
        store_settled(&svc, "obj-a", data.clone()).await;
        let recorded = svc.hash_of("obj-a").await.unwrap();
        assert_eq!(recorded, sha256_hex(&data));

        svc.on_write_hash("obj-a", &recorded).await;
        assert_eq!(svc.try_get("obj-a").await.unwrap(), data);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_write_hash_invalidates() {
        let dir = TempDir::new().unwrap();
        let (svc, metrics) = ready_service(test_cache_config(&dir)).await;

        store_settled(&svc, "obj-a", payload(4 * KB, b'h')).await;

        svc.on_write_hash("obj-a", "0000000000000000").await;
        assert_eq!(svc.phase_of("obj-a").await, None);
        assert!(svc.try_get("obj-a").await.is_none());
        assert_eq!(metrics.metrics.invalidations.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn write_hash_during_fill_discards_the_buffer() {
        let dir = TempDir::new().unwrap();
        let (svc, _metrics) = ready_service(test_cache_config(&dir)).await;

        let data = payload(3 * KB, b'm');
        let chunks: Vec<Bytes> = data.chunks(1024).map(Bytes::copy_from_slice).collect();
        let slow: ByteStream = Box::pin(futures::stream::iter(chunks).then(|c| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, io::Error>(c)
        }));

        let node = FsNode::new("obj-a", data.len() as u64);
        let outcome = svc.clone().maybe_store(&node, slow).await;

        // The write lands while the fill is still buffering.
        svc.on_write_hash("obj-a", "somethingelse").await;

        drain(outcome.stream).await.unwrap();
        // Give the fill task a chance to observe the dead tracker.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(svc.phase_of("obj-a").await, None);
        assert!(!svc.in_precache("obj-a").await);
        assert!(svc.try_get("obj-a").await.is_none());
    }

    // ── ingestion failures ─────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn stream_error_tears_down_the_tracker() {
        let dir = TempDir::new().unwrap();
        let (svc, metrics) = ready_service(test_cache_config(&dir)).await;

        let broken: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::other("upstream reset")),
        ]));
        let node = FsNode::new("obj-a", 4 * KB);
        let outcome = svc.clone().maybe_store(&node, broken).await;
        assert!(outcome.cached);

        assert!(drain(outcome.stream).await.is_err());
        svc.wait_settled("obj-a").await;

        assert_eq!(svc.phase_of("obj-a").await, None);
        assert!(svc.try_get("obj-a").await.is_none());
        assert_eq!(metrics.metrics.ingest_failures.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn short_stream_is_an_ingest_failure() {
        let dir = TempDir::new().unwrap();
        let (svc, metrics) = ready_service(test_cache_config(&dir)).await;

        // Declared 4 KiB, delivers 1 KiB.
        let node = FsNode::new("obj-a", 4 * KB);
        let outcome = svc
            .clone()
            .maybe_store(&node, chunked(payload(KB, b's')))
            .await;
        drain(outcome.stream).await.unwrap();
        svc.wait_settled("obj-a").await;

        assert_eq!(svc.phase_of("obj-a").await, None);
        assert_eq!(metrics.metrics.ingest_failures.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_stream_is_an_ingest_failure() {
        let dir = TempDir::new().unwrap();
        let (svc, metrics) = ready_service(test_cache_config(&dir)).await;

        // Declared 1 KiB, delivers 4 KiB.
        let node = FsNode::new("obj-a", KB);
        let outcome = svc
            .clone()
            .maybe_store(&node, chunked(payload(4 * KB, b'o')))
            .await;
        drain(outcome.stream).await.unwrap();
        svc.wait_settled("obj-a").await;

        assert_eq!(svc.phase_of("obj-a").await, None);
        assert_eq!(metrics.metrics.ingest_failures.get(), 1);
    }

    // ── promotion and eviction ─────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn sequential_stores_promote_by_descending_score() {
        let dir = TempDir::new().unwrap();
        let (svc, _metrics) = ready_service(test_cache_config(&dir)).await;

        let a = payload(10 * KB, b'a');
        store_settled(&svc, "obj-a", a.clone()).await;

        // Touch the first object twice before the next store.
        tokio::time::advance(Duration::from_millis(100)).await;
        svc.try_get("obj-a").await.unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        svc.try_get("obj-a").await.unwrap();

        // Storing the second object breaches the 15 KiB budget; the
        // highest-scoring resident is promoted to the disk tier and stays
        // cached there.
        store_settled(&svc, "obj-b", payload(10 * KB, b'b')).await;
        assert_eq!(svc.phase_of("obj-a").await, Some(Phase::OnDisk));
        assert_eq!(svc.phase_of("obj-b").await, Some(Phase::Precached));
        assert_phase_invariant(&svc).await;

        store_settled(&svc, "obj-c", payload(10 * KB, b'c')).await;
        assert_eq!(svc.phase_of("obj-b").await, Some(Phase::OnDisk));
        assert_eq!(svc.phase_of("obj-c").await, Some(Phase::Precached));
        assert_phase_invariant(&svc).await;

        // Every object is still served, the promoted ones from disk.
        assert_eq!(svc.try_get("obj-a").await.unwrap(), a);
        assert!(svc.try_get("obj-b").await.is_some());
        assert!(svc.try_get("obj-c").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn promotion_gate_declines_weak_candidates() {
        let dir = TempDir::new().unwrap();
        let mut config = test_cache_config(&dir);
        config.precache_capacity = 10 * KB;
        config.disk_capacity = 10 * KB;
        config.ttl_ms = 600_000;
        let (svc, metrics) = ready_service(config).await;

        // First store fills the precache; the second displaces it to disk.
        store_settled(&svc, "obj-a", payload(10 * KB, b'a')).await;
        store_settled(&svc, "obj-b", payload(10 * KB, b'b')).await;
        assert_eq!(svc.phase_of("obj-a").await, Some(Phase::OnDisk));

        // Keep the disk occupant hot while the precache resident goes
        // stale.
        for _ in 0..20 {
            tokio::time::advance(Duration::from_millis(500)).await;
            svc.try_get("obj-a").await.unwrap();
        }

        // The disk tier is full and its occupant out-scores obj-b, so the
        // promotion is declined: no disk write happens for obj-b.
        store_settled(&svc, "obj-c", payload(10 * KB, b'c')).await;
        assert_eq!(svc.phase_of("obj-a").await, Some(Phase::OnDisk));
        assert_eq!(svc.phase_of("obj-b").await, Some(Phase::Precached));
        assert!(!svc.entry_path("obj-b").exists());
        assert_eq!(metrics.metrics.promotions.get(), 1);

        // The attempted promotion was still counted as freed capacity, so
        // the precache budget is now silently exceeded.
        let status = svc.status().await;
        assert_eq!(status.precache.used, 20 * KB);
        assert!(status.precache.used > status.precache.capacity);
        assert_phase_invariant(&svc).await;
    }

    #[tokio::test(start_paused = true)]
    async fn promotion_displaces_weaker_disk_occupants() {
        let dir = TempDir::new().unwrap();
        let mut config = test_cache_config(&dir);
        config.precache_capacity = 10 * KB;
        config.disk_capacity = 10 * KB;
        config.ttl_ms = 600_000;
        let (svc, metrics) = ready_service(config).await;

        store_settled(&svc, "obj-a", payload(10 * KB, b'a')).await;
        store_settled(&svc, "obj-b", payload(10 * KB, b'b')).await;
        assert_eq!(svc.phase_of("obj-a").await, Some(Phase::OnDisk));

        // This time the precache resident stays hot while the disk
        // occupant goes stale.
        for _ in 0..30 {
            tokio::time::advance(Duration::from_millis(1_000)).await;
            svc.try_get("obj-b").await.unwrap();
        }

        store_settled(&svc, "obj-c", payload(10 * KB, b'c')).await;

        // obj-b out-scored the disk occupant: obj-a was evicted outright
        // and obj-b took its place.
        assert_eq!(svc.phase_of("obj-a").await, None);
        assert!(!svc.entry_path("obj-a").exists());
        assert_eq!(svc.phase_of("obj-b").await, Some(Phase::OnDisk));
        assert_eq!(svc.phase_of("obj-c").await, Some(Phase::Precached));
        assert_eq!(metrics.metrics.disk_evictions.get(), 1);
        assert_eq!(metrics.metrics.promotions.get(), 2);

        assert!(svc.try_get("obj-a").await.is_none());
        assert!(svc.try_get("obj-b").await.is_some());
        assert_phase_invariant(&svc).await;
    }

    // ── startup ────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn init_sweeps_orphaned_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("stale-object"), b"left behind").unwrap();

        let (svc, _metrics) = service(test_cache_config(&dir));
        svc.init().await.unwrap();

        assert!(!dir.path().join("stale-object").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_usage_per_tier() {
        let dir = TempDir::new().unwrap();
        let (svc, _metrics) = ready_service(test_cache_config(&dir)).await;

        store_settled(&svc, "obj-a", payload(10 * KB, b'a')).await;
        let status = svc.status().await;
        assert_eq!(status.precache.used, 10 * KB);
        assert_eq!(status.precache.capacity, 15 * KB);
        assert_eq!(status.disk.used, 0);
        assert_eq!(status.tracked_objects, 1);
    }
}
