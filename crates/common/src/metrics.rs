use std::sync::{Arc, OnceLock};

use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    dispatch_queued_jobs: GaugeVec,
    dispatch_running_jobs: GaugeVec,
    dispatch_retries: CounterVec,
    dispatch_job_seconds: HistogramVec,
    frames_received: CounterVec,
    frame_bytes_received: CounterVec,
    merge_rows_loaded: CounterVec,
    merge_bytes_loaded: CounterVec,
    merge_inflight_loads: GaugeVec,
    merge_load_seconds: HistogramVec,
    queries_submitted: Counter,
    queries_terminal: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn set_dispatch_queued_jobs(&self, query_id: &str, queued: u64) {
        self.inner
            .dispatch_queued_jobs
            .with_label_values(&[query_id])
            .set(queued as f64);
    }

    pub fn set_dispatch_running_jobs(&self, query_id: &str, running: u64) {
        self.inner
            .dispatch_running_jobs
            .with_label_values(&[query_id])
            .set(running as f64);
    }

    pub fn inc_dispatch_retries(&self, query_id: &str, chunk_id: u32) {
        self.inner
            .dispatch_retries
            .with_label_values(&[query_id, &chunk_id.to_string()])
            .inc();
    }

    pub fn observe_job_seconds(&self, query_id: &str, chunk_id: u32, secs: f64) {
        self.inner
            .dispatch_job_seconds
            .with_label_values(&[query_id, &chunk_id.to_string()])
            .observe(secs.max(0.0));
    }

    pub fn record_frame(&self, query_id: &str, chunk_id: u32, bytes: u64) {
        let labels = [query_id, &chunk_id.to_string()];
        self.inner
            .frames_received
            .with_label_values(&labels)
            .inc();
        self.inner
            .frame_bytes_received
            .with_label_values(&labels)
            .inc_by(bytes as f64);
    }

    pub fn record_merge_load(&self, query_id: &str, rows: u64, bytes: u64, secs: f64) {
        self.inner
            .merge_rows_loaded
            .with_label_values(&[query_id])
            .inc_by(rows as f64);
        self.inner
            .merge_bytes_loaded
            .with_label_values(&[query_id])
            .inc_by(bytes as f64);
        self.inner
            .merge_load_seconds
            .with_label_values(&[query_id])
            .observe(secs.max(0.0));
    }

    pub fn set_merge_inflight_loads(&self, query_id: &str, inflight: u64) {
        self.inner
            .merge_inflight_loads
            .with_label_values(&[query_id])
            .set(inflight as f64);
    }

    pub fn inc_queries_submitted(&self) {
        self.inner.queries_submitted.inc();
    }

    pub fn inc_queries_terminal(&self, state: &str) {
        self.inner
            .queries_terminal
            .with_label_values(&[state])
            .inc();
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let dispatch_queued_jobs = gauge_vec(
            &registry,
            "skyq_dispatch_queued_jobs",
            "Chunk jobs not yet released to the transport",
            &["query_id"],
        );
        let dispatch_running_jobs = gauge_vec(
            &registry,
            "skyq_dispatch_running_jobs",
            "Chunk jobs currently dispatched or streaming",
            &["query_id"],
        );
        let dispatch_retries = counter_vec(
            &registry,
            "skyq_dispatch_retries_total",
            "Chunk job retry attempts",
            &["query_id", "chunk_id"],
        );
        let dispatch_job_seconds = histogram_vec(
            &registry,
            "skyq_dispatch_job_seconds",
            "Wall time from dispatch to terminal job state",
            &["query_id", "chunk_id"],
        );

        let frames_received = counter_vec(
            &registry,
            "skyq_frames_received_total",
            "Result frames accepted by the stream reader",
            &["query_id", "chunk_id"],
        );
        let frame_bytes_received = counter_vec(
            &registry,
            "skyq_frame_bytes_received_total",
            "Result payload bytes accepted by the stream reader",
            &["query_id", "chunk_id"],
        );

        let merge_rows_loaded = counter_vec(
            &registry,
            "skyq_merge_rows_loaded_total",
            "Rows loaded into the merge table",
            &["query_id"],
        );
        let merge_bytes_loaded = counter_vec(
            &registry,
            "skyq_merge_bytes_loaded_total",
            "Bytes loaded into the merge table",
            &["query_id"],
        );
        let merge_inflight_loads = gauge_vec(
            &registry,
            "skyq_merge_inflight_loads",
            "LOAD DATA statements currently in flight",
            &["query_id"],
        );
        let merge_load_seconds = histogram_vec(
            &registry,
            "skyq_merge_load_seconds",
            "LOAD DATA statement latency",
            &["query_id"],
        );

        let queries_submitted = Counter::with_opts(Opts::new(
            "skyq_queries_submitted_total",
            "User queries accepted for execution",
        ))
        .expect("counter");
        registry
            .register(Box::new(queries_submitted.clone()))
            .expect("register counter");
        let queries_terminal = counter_vec(
            &registry,
            "skyq_queries_terminal_total",
            "User queries reaching a terminal state",
            &["state"],
        );

        Self {
            registry,
            dispatch_queued_jobs,
            dispatch_running_jobs,
            dispatch_retries,
            dispatch_job_seconds,
            frames_received,
            frame_bytes_received,
            merge_rows_loaded,
            merge_bytes_loaded,
            merge_inflight_loads,
            merge_load_seconds,
            queries_submitted,
            queries_terminal,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    let g = GaugeVec::new(Opts::new(name, help), labels).expect("gauge vec");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

static GLOBAL_METRICS: OnceLock<MetricsRegistry> = OnceLock::new();

pub fn global_metrics() -> &'static MetricsRegistry {
    GLOBAL_METRICS.get_or_init(MetricsRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.record_frame("42", 101, 4096);
        let text = m.render_prometheus();
        assert!(text.contains("skyq_frames_received_total"));
        assert!(text.contains("101"));
    }

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.set_dispatch_queued_jobs("7", 12);
        m.set_dispatch_running_jobs("7", 4);
        m.inc_dispatch_retries("7", 33);
        m.observe_job_seconds("7", 33, 1.25);
        m.record_frame("7", 33, 1024);
        m.record_merge_load("7", 500, 65536, 0.02);
        m.set_merge_inflight_loads("7", 2);
        m.inc_queries_submitted();
        m.inc_queries_terminal("COMPLETE");
        let text = m.render_prometheus();

        assert!(text.contains("skyq_dispatch_queued_jobs"));
        assert!(text.contains("skyq_dispatch_running_jobs"));
        assert!(text.contains("skyq_dispatch_retries_total"));
        assert!(text.contains("skyq_dispatch_job_seconds"));
        assert!(text.contains("skyq_frames_received_total"));
        assert!(text.contains("skyq_frame_bytes_received_total"));
        assert!(text.contains("skyq_merge_rows_loaded_total"));
        assert!(text.contains("skyq_merge_bytes_loaded_total"));
        assert!(text.contains("skyq_merge_inflight_loads"));
        assert!(text.contains("skyq_merge_load_seconds"));
        assert!(text.contains("skyq_queries_submitted_total"));
        assert!(text.contains("skyq_queries_terminal_total"));
    }
}
