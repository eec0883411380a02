use tracing::trace;

// Lightweight metrics helpers kept trace-based; the Prometheus recorder in
// main picks up the HTTP-level series, these cover flow-level counters.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "courier.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn files_uploaded(count: usize) {
    trace!(
        target = "courier.metrics",
        count = count as u64,
        "files_uploaded_inc"
    );
}

pub fn sweep_reverted(count: usize) {
    trace!(
        target = "courier.metrics",
        count = count as u64,
        "sweep_reverted_inc"
    );
}
