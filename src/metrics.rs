//! Prometheus metrics for the cache path.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder,
};

const NAMESPACE: &str = "cachefront";

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Number of invalidation requests handled.
pub static CACHE_INVALIDATIONS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::with_opts(
        Opts::new("cache_invalidations", "cache invalidation requests").namespace(NAMESPACE),
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Number of cache entries deleted by invalidation requests.
pub static CACHE_INVALIDATED_ITEMS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::with_opts(
        Opts::new("cache_invalidated_items", "cache entries deleted by invalidation")
            .namespace(NAMESPACE),
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Any store failure: transport, decompression, deserialization, write.
pub static CACHE_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::with_opts(
        Opts::new("cache_errors", "cache store failures").namespace(NAMESPACE),
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Cache lookup latency, labeled with the lookup outcome.
pub static CACHE_LOAD_TIME: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new("cache_load_time", "cache lookup latency in seconds")
            .namespace(NAMESPACE),
        &["cache_status"],
    )
    .unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

/// Force registration of all metrics so they show up in the exposition
/// before their first increment.
pub fn init() {
    Lazy::force(&CACHE_INVALIDATIONS);
    Lazy::force(&CACHE_INVALIDATED_ITEMS);
    Lazy::force(&CACHE_ERRORS);
    Lazy::force(&CACHE_LOAD_TIME);
}

/// Render the registry in the Prometheus text exposition format.
pub fn gather_text() -> String {
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buf) {
        log::error!("cant encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
