//! Hand-rolled Prometheus-style metrics (C16, §3a).
//!
//! No metrics crate is part of this workspace's dependency stack, and the
//! surface needed here is small and fixed, so counters and histograms are
//! plain atomics behind a couple of `DashMap`s keyed by label value. The
//! text exposition format follows the Prometheus exposition format closely
//! enough for a scraper to parse, without pulling in a crate for it.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Fixed histogram bucket upper bounds, in seconds. Chosen to cover
/// sub-second TMS calls through multi-minute signing/render jobs.
const BUCKET_BOUNDS_SECS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

#[derive(Default)]
struct Histogram {
    buckets: Vec<AtomicU64>,
    sum_millis: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: (0..BUCKET_BOUNDS_SECS.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_millis: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, seconds: f64) {
        for (bound, bucket) in BUCKET_BOUNDS_SECS.iter().zip(self.buckets.iter()) {
            if seconds <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_millis.fetch_add((seconds * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// The fixed set of counters and histograms the orchestrator and ingress
/// layer update (§3a). One instance is shared across the process behind an
/// `Arc`.
#[derive(Default)]
pub struct Metrics {
    ingress_requests_total: DashMap<String, AtomicU64>,
    jobs_total: DashMap<String, AtomicU64>,
    jobs_in_flight: AtomicU64,
    delivery_duplicates_total: AtomicU64,
    signing_failures_total: AtomicU64,
    tsa_failures_total: AtomicU64,
    job_duration_seconds: Histogram,
    tms_call_duration_seconds: DashMap<String, Histogram>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            job_duration_seconds: Histogram::new(),
            ..Default::default()
        }
    }

    pub fn record_ingress_request(&self, outcome: &str) {
        self.ingress_requests_total
            .entry(outcome.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_outcome(&self, outcome: &str) {
        self.jobs_total
            .entry(outcome.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_started(&self) {
        self.jobs_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_finished(&self, duration_secs: f64) {
        self.jobs_in_flight.fetch_sub(1, Ordering::Relaxed);
        self.job_duration_seconds.observe(duration_secs);
    }

    pub fn record_delivery_duplicate(&self) {
        self.delivery_duplicates_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signing_failure(&self) {
        self.signing_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tsa_failure(&self) {
        self.tsa_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tms_call(&self, operation: &str, duration_secs: f64) {
        self.tms_call_duration_seconds
            .entry(operation.to_string())
            .or_insert_with(Histogram::new)
            .observe(duration_secs);
    }

    /// Renders the current snapshot in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# TYPE ingress_requests_total counter\n");
        for entry in self.ingress_requests_total.iter() {
            out.push_str(&format!(
                "ingress_requests_total{{outcome=\"{}\"}} {}\n",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            ));
        }

        out.push_str("# TYPE jobs_total counter\n");
        for entry in self.jobs_total.iter() {
            out.push_str(&format!(
                "jobs_total{{outcome=\"{}\"}} {}\n",
                entry.key(),
                entry.value().load(Ordering::Relaxed)
            ));
        }

        out.push_str("# TYPE jobs_in_flight gauge\n");
        out.push_str(&format!("jobs_in_flight {}\n", self.jobs_in_flight.load(Ordering::Relaxed)));

        out.push_str("# TYPE delivery_duplicates_total counter\n");
        out.push_str(&format!(
            "delivery_duplicates_total {}\n",
            self.delivery_duplicates_total.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE signing_failures_total counter\n");
        out.push_str(&format!(
            "signing_failures_total {}\n",
            self.signing_failures_total.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE tsa_failures_total counter\n");
        out.push_str(&format!(
            "tsa_failures_total {}\n",
            self.tsa_failures_total.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE job_duration_seconds histogram\n");
        render_histogram(&mut out, "job_duration_seconds", &[], &self.job_duration_seconds);

        out.push_str("# TYPE tms_call_duration_seconds histogram\n");
        for entry in self.tms_call_duration_seconds.iter() {
            render_histogram(
                &mut out,
                "tms_call_duration_seconds",
                &[("operation", entry.key())],
                entry.value(),
            );
        }

        out
    }
}

fn render_histogram(out: &mut String, name: &str, extra_labels: &[(&str, &str)], histogram: &Histogram) {
    let labels = |bucket_label: Option<String>| -> String {
        let mut parts: Vec<String> = extra_labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{v}\""))
            .collect();
        if let Some(le) = bucket_label {
            parts.push(format!("le=\"{le}\""));
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!("{{{}}}", parts.join(","))
        }
    };

    let mut cumulative = 0u64;
    for (bound, bucket) in BUCKET_BOUNDS_SECS.iter().zip(histogram.buckets.iter()) {
        cumulative = cumulative.max(bucket.load(Ordering::Relaxed));
        out.push_str(&format!("{name}_bucket{} {}\n", labels(Some(bound.to_string())), cumulative));
    }
    out.push_str(&format!("{name}_bucket{} {}\n", labels(Some("+Inf".to_string())), histogram.count.load(Ordering::Relaxed)));
    out.push_str(&format!(
        "{name}_sum{} {}\n",
        labels(None),
        histogram.sum_millis.load(Ordering::Relaxed) as f64 / 1000.0
    ));
    out.push_str(&format!("{name}_count{} {}\n", labels(None), histogram.count.load(Ordering::Relaxed)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingress_counter_increments_per_outcome() {
        let metrics = Metrics::new();
        metrics.record_ingress_request("accepted");
        metrics.record_ingress_request("accepted");
        metrics.record_ingress_request("rejected_hmac");
        let rendered = metrics.render();
        assert!(rendered.contains("ingress_requests_total{outcome=\"accepted\"} 2"));
        assert!(rendered.contains("ingress_requests_total{outcome=\"rejected_hmac\"} 1"));
    }

    #[test]
    fn jobs_in_flight_tracks_start_and_finish() {
        let metrics = Metrics::new();
        metrics.job_started();
        metrics.job_started();
        assert!(metrics.render().contains("jobs_in_flight 2"));
        metrics.job_finished(0.2);
        assert!(metrics.render().contains("jobs_in_flight 1"));
    }

    #[test]
    fn histogram_bucket_is_cumulative() {
        let metrics = Metrics::new();
        metrics.job_started();
        metrics.job_finished(0.0);
        let rendered = metrics.render();
        assert!(rendered.contains("job_duration_seconds_count 1"));
    }

    #[test]
    fn tms_call_duration_is_labelled_by_operation() {
        let metrics = Metrics::new();
        metrics.record_tms_call("get_ticket", 0.1);
        let rendered = metrics.render();
        assert!(rendered.contains("operation=\"get_ticket\""));
    }
}
