use tracing::trace;

// Lightweight metrics helpers that stay safe without a recorder installed.
// These intentionally avoid the metrics macros to keep deps stable.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "listwright.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn batch_finished(succeeded: usize, failed: usize, retried: usize) {
    trace!(
        target = "listwright.metrics",
        succeeded = succeeded as u64,
        failed = failed as u64,
        retried = retried as u64,
        "batch_finished"
    );
}
