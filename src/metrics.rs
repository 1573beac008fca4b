use std::sync::Arc;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the daemon.
pub struct Metrics {
    // -- lookups --
    pub cache_hits: Counter,
    pub cache_misses: Counter,

    // -- tier movement --
    pub promotions: Counter,
    pub disk_evictions: Counter,
    pub invalidations: Counter,

    // -- ingestion --
    pub stores_declined: Counter,
    pub ingest_bytes: Counter,
    pub ingest_failures: Counter,

    // -- diagnostics --
    pub alarms: Counter,

    // -- gauges --
    pub precache_used_bytes: Gauge,
    pub disk_used_bytes: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let cache_hits = Counter::default();
        registry.register(
            "blobcache_cache_hits_total",
            "Lookups served from the memory or disk tier",
            cache_hits.clone(),
        );

        let cache_misses = Counter::default();
        registry.register(
            "blobcache_cache_misses_total",
            "Lookups resolved as misses",
            cache_misses.clone(),
        );

        let promotions = Counter::default();
        registry.register(
            "blobcache_promotions_total",
            "Objects promoted from the memory tier to the disk tier",
            promotions.clone(),
        );

        let disk_evictions = Counter::default();
        registry.register(
            "blobcache_disk_evictions_total",
            "Objects evicted from the disk tier",
            disk_evictions.clone(),
        );

        let invalidations = Counter::default();
        registry.register(
            "blobcache_invalidations_total",
            "Tracked objects invalidated (explicitly, by TTL, or by hash change)",
            invalidations.clone(),
        );

        let stores_declined = Counter::default();
        registry.register(
            "blobcache_stores_declined_total",
            "Store offers declined by the admission ceiling",
            stores_declined.clone(),
        );

        let ingest_bytes = Counter::default();
        registry.register(
            "blobcache_ingest_bytes_total",
            "Bytes buffered by the cache-facing side of tee'd ingestion",
            ingest_bytes.clone(),
        );

        let ingest_failures = Counter::default();
        registry.register(
            "blobcache_ingest_failures_total",
            "Fills torn down due to stream errors or size mismatches",
            ingest_failures.clone(),
        );

        let alarms = Counter::default();
        registry.register(
            "blobcache_alarms_total",
            "Diagnostics reports raised with alarm severity",
            alarms.clone(),
        );

        let precache_used_bytes: Gauge = Gauge::default();
        registry.register(
            "blobcache_precache_used_bytes",
            "Bytes currently held in the memory tier",
            precache_used_bytes.clone(),
        );

        let disk_used_bytes: Gauge = Gauge::default();
        registry.register(
            "blobcache_disk_used_bytes",
            "Bytes currently held in the disk tier",
            disk_used_bytes.clone(),
        );

        Self {
            cache_hits,
            cache_misses,
            promotions,
            disk_evictions,
            invalidations,
            stores_declined,
            ingest_bytes,
            ingest_failures,
            alarms,
            precache_used_bytes,
            disk_used_bytes,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, shared through `AppState`
/// and injected into the cache manager.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all daemon metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}
