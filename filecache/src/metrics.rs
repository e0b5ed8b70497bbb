//! Cache-internal counters. The embedding engine scrapes the default
//! prometheus registry; nothing here is exposed otherwise.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

pub(crate) struct CacheMetrics {
    /// Occupancy accounted against the hard limit (READY + EVICTING).
    pub(crate) occupancy_bytes: IntGauge,
    pub(crate) resident_files: IntGauge,

    pub(crate) downloads_started: IntCounter,
    pub(crate) downloads_completed: IntCounter,
    pub(crate) downloads_failed: IntCounter,
    pub(crate) downloads_cancelled: IntCounter,

    pub(crate) evictions: IntCounterVec,
    pub(crate) eviction_unlink_failures: IntCounter,
    /// Admissions that pushed occupancy past the hard limit because the
    /// feasible victim set was too small.
    pub(crate) overshoot: IntCounter,

    pub(crate) sweep_iterations: IntCounter,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum EvictionReason {
    MakeRoom,
    Sweep,
    Explicit,
}

impl EvictionReason {
    fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::MakeRoom => "make_room",
            EvictionReason::Sweep => "sweep",
            EvictionReason::Explicit => "explicit",
        }
    }
}

impl CacheMetrics {
    fn new() -> Self {
        CacheMetrics {
            occupancy_bytes: register_int_gauge!(
                "filecache_occupancy_bytes",
                "Bytes of READY and EVICTING cache files accounted against the hard limit"
            )
            .unwrap(),
            resident_files: register_int_gauge!(
                "filecache_resident_files",
                "Number of files currently indexed by the cache"
            )
            .unwrap(),
            downloads_started: register_int_counter!(
                "filecache_downloads_started_total",
                "Producer elections that began a transfer"
            )
            .unwrap(),
            downloads_completed: register_int_counter!(
                "filecache_downloads_completed_total",
                "Transfers that reached READY"
            )
            .unwrap(),
            downloads_failed: register_int_counter!(
                "filecache_downloads_failed_total",
                "Transfers that ended in FAILED"
            )
            .unwrap(),
            downloads_cancelled: register_int_counter!(
                "filecache_downloads_cancelled_total",
                "Transfers abandoned before any reader attached"
            )
            .unwrap(),
            evictions: register_int_counter_vec!(
                "filecache_evictions_total",
                "Files physically evicted, by trigger",
                &["reason"]
            )
            .unwrap(),
            eviction_unlink_failures: register_int_counter!(
                "filecache_eviction_unlink_failures_total",
                "Unlinks that failed and were left for the next sweep"
            )
            .unwrap(),
            overshoot: register_int_counter!(
                "filecache_admission_overshoot_total",
                "Admissions that transiently exceeded the hard limit"
            )
            .unwrap(),
            sweep_iterations: register_int_counter!(
                "filecache_sweep_iterations_total",
                "Background sweep passes"
            )
            .unwrap(),
        }
    }

    pub(crate) fn inc_evicted(&self, reason: EvictionReason) {
        self.evictions.with_label_values(&[reason.as_str()]).inc();
    }
}

pub(crate) static CACHE_METRICS: Lazy<CacheMetrics> = Lazy::new(CacheMetrics::new);
