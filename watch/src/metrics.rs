//! Prometheus metrics, registered on the default registry.
//!
//! Each metric is stored as a `Result` so that a failed registration never panics; the helpers
//! below silently skip metrics that failed to register.
use lazy_static::lazy_static;
pub use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramTimer, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec, Opts, Result, TextEncoder,
};

pub const DUTIES: &str = "duties";
pub const FULL: &str = "full";
pub const FIXUP: &str = "fixup";

pub const CONSISTENT: &str = "consistent";
pub const REPAIRED: &str = "repaired";
pub const MISMATCH: &str = "mismatch";
pub const SKIPPED: &str = "skipped";

lazy_static! {
    /*
     * Epoch units
     */
    pub static ref EPOCHS_PROCESSED_TOTAL: Result<IntCounterVec> = try_create_int_counter_vec(
        "watch_epochs_processed_total",
        "Count of epoch units completed successfully",
        &["mode"]
    );
    pub static ref EPOCH_PROCESSING_SECONDS: Result<HistogramVec> = try_create_histogram_vec(
        "watch_epoch_processing_seconds",
        "Time taken to process a single epoch unit",
        &["mode"]
    );
    pub static ref EPOCH_UNITS_IN_FLIGHT: Result<IntGaugeVec> = try_create_int_gauge_vec(
        "watch_epoch_units_in_flight",
        "Number of epoch units currently dispatched",
        &["mode"]
    );
    pub static ref WATERMARK_EPOCH: Result<IntGaugeVec> = try_create_int_gauge_vec(
        "watch_watermark_epoch",
        "Highest epoch below which every dispatched unit has completed",
        &["mode"]
    );

    /*
     * Consistency checker
     */
    pub static ref CONSISTENCY_CHECKS_TOTAL: Result<IntCounterVec> = try_create_int_counter_vec(
        "watch_consistency_checks_total",
        "Outcomes of sampled consistency checks against the explorer",
        &["outcome"]
    );

    /*
     * Block cache
     */
    pub static ref BLOCK_CACHE_HITS: Result<IntCounter> = try_create_int_counter(
        "watch_block_cache_hits_total",
        "Block lookups served from the shared cache"
    );
    pub static ref BLOCK_CACHE_MISSES: Result<IntCounter> = try_create_int_counter(
        "watch_block_cache_misses_total",
        "Block lookups that went to the beacon node"
    );
}

pub fn try_create_int_counter(name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    prometheus::register(Box::new(counter.clone()))?;
    Ok(counter)
}

pub fn try_create_int_counter_vec(
    name: &str,
    help: &str,
    label_names: &[&str],
) -> Result<IntCounterVec> {
    let counter_vec = IntCounterVec::new(Opts::new(name, help), label_names)?;
    prometheus::register(Box::new(counter_vec.clone()))?;
    Ok(counter_vec)
}

pub fn try_create_int_gauge_vec(
    name: &str,
    help: &str,
    label_names: &[&str],
) -> Result<IntGaugeVec> {
    let gauge_vec = IntGaugeVec::new(Opts::new(name, help), label_names)?;
    prometheus::register(Box::new(gauge_vec.clone()))?;
    Ok(gauge_vec)
}

pub fn try_create_histogram_vec(
    name: &str,
    help: &str,
    label_names: &[&str],
) -> Result<HistogramVec> {
    let histogram_vec = HistogramVec::new(HistogramOpts::new(name, help), label_names)?;
    prometheus::register(Box::new(histogram_vec.clone()))?;
    Ok(histogram_vec)
}

pub fn inc_counter(counter: &Result<IntCounter>) {
    if let Ok(counter) = counter {
        counter.inc();
    }
}

pub fn inc_counter_vec(counter_vec: &Result<IntCounterVec>, label_values: &[&str]) {
    if let Ok(counter_vec) = counter_vec {
        if let Ok(counter) = counter_vec.get_metric_with_label_values(label_values) {
            counter.inc();
        }
    }
}

pub fn set_gauge_vec(gauge_vec: &Result<IntGaugeVec>, label_values: &[&str], value: i64) {
    if let Ok(gauge_vec) = gauge_vec {
        if let Ok(gauge) = gauge_vec.get_metric_with_label_values(label_values) {
            gauge.set(value);
        }
    }
}

pub fn inc_gauge_vec(gauge_vec: &Result<IntGaugeVec>, label_values: &[&str]) {
    if let Ok(gauge_vec) = gauge_vec {
        if let Ok(gauge) = gauge_vec.get_metric_with_label_values(label_values) {
            gauge.inc();
        }
    }
}

pub fn dec_gauge_vec(gauge_vec: &Result<IntGaugeVec>, label_values: &[&str]) {
    if let Ok(gauge_vec) = gauge_vec {
        if let Ok(gauge) = gauge_vec.get_metric_with_label_values(label_values) {
            gauge.dec();
        }
    }
}

/// Start a timer on the histogram with `label_values`. The observation is recorded on drop.
pub fn start_timer_vec(
    histogram_vec: &Result<HistogramVec>,
    label_values: &[&str],
) -> Option<HistogramTimer> {
    histogram_vec
        .as_ref()
        .ok()?
        .get_metric_with_label_values(label_values)
        .ok()
        .map(|histogram| histogram.start_timer())
}

/// Encode everything on the default registry in the prometheus text format.
pub fn gather_text() -> std::result::Result<String, String> {
    let mut buffer = vec![];
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| format!("Unable to encode metrics: {:?}", e))?;
    String::from_utf8(buffer).map_err(|e| format!("Metrics are not UTF-8: {:?}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labelled_metrics_are_exported() {
        inc_counter_vec(&CONSISTENCY_CHECKS_TOTAL, &[SKIPPED]);
        set_gauge_vec(&WATERMARK_EPOCH, &[DUTIES], 42);

        let text = gather_text().unwrap();
        assert!(text.contains("watch_consistency_checks_total{outcome=\"skipped\"}"));
        assert!(text.contains("watch_watermark_epoch{mode=\"duties\"}"));
    }
}
