use tracing::trace;

// Counters are emitted as `wb.metrics` trace events only. The Prometheus
// exporter behind `/metrics` does not see them.

pub fn inc_requests(route: &'static str) {
    trace!(target: "wb.metrics", route = route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target: "wb.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn provider_probe(kind: &'static str, ok: bool) {
    trace!(
        target: "wb.metrics",
        provider = kind,
        ok = ok,
        "provider_probe_total_inc"
    );
}

pub fn generation_attempt(model: &str, mode: &'static str, ok: bool) {
    trace!(
        target: "wb.metrics",
        model = model,
        mode = mode,
        ok = ok,
        "generation_attempt_total_inc"
    );
}
