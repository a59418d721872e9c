//! Prometheus counters for batch traffic and worker health.
//!
//! Registered in the default registry so pingora's Prometheus HTTP service
//! exposes them.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

pub const MODE_SYNC: &str = "sync";
pub const MODE_ASYNC: &str = "async";

// Batches accepted per mode
static REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "batch_requests_total",
        "Batch envelopes accepted since batchgate started",
        &["mode"]
    )
    .unwrap()
});

// Sub-requests per mode
static ITEMS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "batch_items_total",
        "Sub-requests executed or queued",
        &["mode"]
    )
    .unwrap()
});

static ITEM_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "batch_item_failures_total",
        "Sub-requests that ended with a 5xx response, local or upstream",
        &["mode"]
    )
    .unwrap()
});

static WORKER_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "batch_worker_messages_total",
        "Queue messages handled by workers, by outcome",
        &["outcome"]
    )
    .unwrap()
});

static WORKER_RESTARTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "batch_worker_restarts_total",
        "Workers relaunched after a fault"
    )
    .unwrap()
});

pub fn batch_accepted(mode: &str) {
    REQUESTS.with_label_values(&[mode]).inc();
}

pub fn items_processed(mode: &str, count: usize) {
    ITEMS.with_label_values(&[mode]).inc_by(count as u64);
}

/// Same rule for both modes: any 5xx item counts as a failure.
pub fn item_completed(mode: &str, status_code: u16) {
    if is_failure(status_code) {
        ITEM_FAILURES.with_label_values(&[mode]).inc();
    }
}

fn is_failure(status_code: u16) -> bool {
    status_code >= 500
}

#[cfg(test)]
pub(crate) fn item_failures(mode: &str) -> u64 {
    ITEM_FAILURES.with_label_values(&[mode]).get()
}

pub fn worker_message(outcome: &str) {
    WORKER_MESSAGES.with_label_values(&[outcome]).inc();
}

pub fn worker_restarted() {
    WORKER_RESTARTS.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_once() {
        batch_accepted(MODE_SYNC);
        batch_accepted(MODE_SYNC);
        items_processed(MODE_ASYNC, 3);
        worker_restarted();
        assert!(REQUESTS.with_label_values(&[MODE_SYNC]).get() >= 2);
        assert!(ITEMS.with_label_values(&[MODE_ASYNC]).get() >= 3);
        assert!(WORKER_RESTARTS.get() >= 1);
    }

    #[test]
    fn test_item_failure_rule() {
        assert!(is_failure(500));
        assert!(is_failure(503));
        assert!(!is_failure(404));
        assert!(!is_failure(200));

        let before = ITEM_FAILURES.with_label_values(&[MODE_ASYNC]).get();
        item_completed(MODE_ASYNC, 502);
        assert!(ITEM_FAILURES.with_label_values(&[MODE_ASYNC]).get() > before);
    }
}
