// Counters for admission, pipeline and cache outcomes
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Metrics collector shared by the gate, the pipeline workers and the cache
#[derive(Default)]
pub struct FlashSaleMetrics {
    // Admission
    admission_attempts: AtomicU64,
    admitted: AtomicU64,
    sold_out: AtomicU64,
    duplicates: AtomicU64,
    not_yet_open: AtomicU64,
    closed: AtomicU64,
    not_found: AtomicU64,
    admission_errors: AtomicU64,
    lazy_seeds: AtomicU64,

    // Admission latency
    total_admission_latency_us: AtomicU64,
    max_admission_latency_us: AtomicU64,

    // Pipeline
    persisted: AtomicU64,
    redelivered: AtomicU64,
    dead_lettered: AtomicU64,
    persist_failures: AtomicU64,

    // Cache
    cache_hits: AtomicU64,
    cache_null_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_reloads: AtomicU64,
    cache_retry_later: AtomicU64,
    filter_rejections: AtomicU64,
}

/// Admission results as counted by [`FlashSaleMetrics::record_admission`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionKind {
    Admitted,
    SoldOut,
    Duplicate,
    NotYetOpen,
    Closed,
    NotFound,
    Error,
}

impl FlashSaleMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admission(&self, kind: AdmissionKind, latency_us: u64) {
        self.admission_attempts.fetch_add(1, Ordering::Relaxed);
        let counter = match kind {
            AdmissionKind::Admitted => &self.admitted,
            AdmissionKind::SoldOut => &self.sold_out,
            AdmissionKind::Duplicate => &self.duplicates,
            AdmissionKind::NotYetOpen => &self.not_yet_open,
            AdmissionKind::Closed => &self.closed,
            AdmissionKind::NotFound => &self.not_found,
            AdmissionKind::Error => &self.admission_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.record_admission_latency(latency_us);
    }

    pub fn record_lazy_seed(&self) {
        self.lazy_seeds.fetch_add(1, Ordering::Relaxed);
    }

    fn record_admission_latency(&self, latency_us: u64) {
        self.total_admission_latency_us.fetch_add(latency_us, Ordering::Relaxed);

        // Update max latency
        let mut current_max = self.max_admission_latency_us.load(Ordering::Relaxed);
        while latency_us > current_max {
            match self.max_admission_latency_us.compare_exchange(
                current_max,
                latency_us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(new_max) => current_max = new_max,
            }
        }
    }

    pub fn record_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_redelivered(&self) {
        self.redelivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_null_hit(&self) {
        self.cache_null_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_reload(&self) {
        self.cache_reloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_retry_later(&self) {
        self.cache_retry_later.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filter_rejection(&self) {
        self.filter_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let attempts = self.admission_attempts.load(Ordering::Relaxed);
        let latency = self.total_admission_latency_us.load(Ordering::Relaxed);

        MetricsSnapshot {
            admission_attempts: attempts,
            admitted: self.admitted.load(Ordering::Relaxed),
            sold_out: self.sold_out.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            not_yet_open: self.not_yet_open.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            admission_errors: self.admission_errors.load(Ordering::Relaxed),
            lazy_seeds: self.lazy_seeds.load(Ordering::Relaxed),
            avg_admission_latency_us: if attempts > 0 { latency / attempts } else { 0 },
            max_admission_latency_us: self.max_admission_latency_us.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_null_hits: self.cache_null_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_reloads: self.cache_reloads.load(Ordering::Relaxed),
            cache_retry_later: self.cache_retry_later.load(Ordering::Relaxed),
            filter_rejections: self.filter_rejections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub admission_attempts: u64,
    pub admitted: u64,
    pub sold_out: u64,
    pub duplicates: u64,
    pub not_yet_open: u64,
    pub closed: u64,
    pub not_found: u64,
    pub admission_errors: u64,
    pub lazy_seeds: u64,
    pub avg_admission_latency_us: u64,
    pub max_admission_latency_us: u64,
    pub persisted: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
    pub persist_failures: u64,
    pub cache_hits: u64,
    pub cache_null_hits: u64,
    pub cache_misses: u64,
    pub cache_reloads: u64,
    pub cache_retry_later: u64,
    pub filter_rejections: u64,
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let counters: [(&str, &str, u64); 19] = [
            ("flashsale_admission_attempts", "Admission attempts", self.admission_attempts),
            ("flashsale_admitted", "Admitted purchases", self.admitted),
            ("flashsale_sold_out", "Attempts rejected as sold out", self.sold_out),
            ("flashsale_duplicates", "Attempts rejected as duplicate", self.duplicates),
            ("flashsale_not_yet_open", "Attempts before the window opened", self.not_yet_open),
            ("flashsale_closed", "Attempts after the window closed", self.closed),
            ("flashsale_not_found", "Attempts for unknown coupons", self.not_found),
            ("flashsale_admission_errors", "Attempts failed by infrastructure", self.admission_errors),
            ("flashsale_lazy_seeds", "Coupons seeded on first admission", self.lazy_seeds),
            ("flashsale_orders_persisted", "Orders persisted by the pipeline", self.persisted),
            ("flashsale_orders_redelivered", "Redelivered entries already persisted", self.redelivered),
            ("flashsale_orders_dead_lettered", "Entries routed to the dead-letter stream", self.dead_lettered),
            ("flashsale_persist_failures", "Transient persistence failures", self.persist_failures),
            ("flashsale_cache_hits", "Cache hits", self.cache_hits),
            ("flashsale_cache_null_hits", "Cached not-found markers served", self.cache_null_hits),
            ("flashsale_cache_misses", "Cache misses", self.cache_misses),
            ("flashsale_cache_reloads", "System-of-record reloads", self.cache_reloads),
            ("flashsale_cache_retry_later", "Lookups answered with retry-later", self.cache_retry_later),
            ("flashsale_filter_rejections", "Lookups rejected by the existence filter", self.filter_rejections),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!("# HELP {} {}\n# TYPE {} counter\n{} {}\n\n", name, help, name, name, value));
        }
        out.push_str(&format!(
            "# HELP flashsale_admission_avg_latency_us Average admission latency in microseconds\n\
             # TYPE flashsale_admission_avg_latency_us gauge\n\
             flashsale_admission_avg_latency_us {}\n\n\
             # HELP flashsale_admission_max_latency_us Maximum admission latency in microseconds\n\
             # TYPE flashsale_admission_max_latency_us gauge\n\
             flashsale_admission_max_latency_us {}\n",
            self.avg_admission_latency_us, self.max_admission_latency_us
        ));
        out
    }
}

/// Timer for measuring operation latency
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}
