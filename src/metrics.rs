use axum::{http::StatusCode, routing};
use prometheus::{
    opts, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::LazyLock;

pub const RESPONSE_TIME_BUCKETS: &[f64] = &[
    0.0001, // 0.1 ms
    0.0005, // 0.5 ms
    0.0010, // 1   ms
    0.0050, // 5   ms
    0.0100, // 10  ms
    0.0250, // 25  ms
    0.0500, // 50  ms
    0.1000, // 100 ms
    0.2500, // 250 ms
    0.5000, // 500 ms
    1.0000, // 1    s
    2.5000, // 2.5  s
    5.0000, // 5    s
];

pub const REFUSED_FOR_MULTIPLE_QUESTIONS: &str = "multiple_questions";

pub const RELOAD_OK: &str = "ok";
pub const RELOAD_FAILED: &str = "failed";

pub static DNS_REQUESTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        opts!(
            "dns_requests_total",
            "Total number of DNS requests received, whether valid or invalid."
        ),
        &["protocol"]
    )
    .unwrap()
});

pub static DNS_REQUESTS_REFUSED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        opts!(
            "dns_requests_refused_total",
            "Total number of DNS requests refused."
        ),
        &["reason"]
    )
    .unwrap()
});

pub static DNS_RESPONSES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        opts!("dns_responses_total", "Total number of DNS responses sent."),
        &["aa", "tc", "rd", "ra", "rcode"]
    )
    .unwrap()
});

pub static DNS_RESPONSE_TIME_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "dns_response_time_seconds",
        "Response time of DNS requests, whether valid or invalid.",
        &["protocol"],
        RESPONSE_TIME_BUCKETS.to_vec()
    )
    .unwrap()
});

pub static DNS_QUESTIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        opts!("dns_questions_total", "Total number of DNS questions received."),
        &["rd", "qtype", "qclass"]
    )
    .unwrap()
});

pub static DNS_AUTHORITATIVE_HIT_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_authoritative_hit_total",
        "Total number of questions under the authoritative suffix with a Name Table entry."
    ))
    .unwrap()
});

pub static DNS_AUTHORITATIVE_MISS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_authoritative_miss_total",
        "Total number of questions under the authoritative suffix with no Name Table entry."
    ))
    .unwrap()
});

pub static DNS_UPSTREAM_HIT_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_upstream_hit_total",
        "Total number of forwarded questions the upstream nameserver answered."
    ))
    .unwrap()
});

pub static DNS_UPSTREAM_MISS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(opts!(
        "dns_upstream_miss_total",
        "Total number of forwarded questions the upstream nameserver failed to answer in time."
    ))
    .unwrap()
});

pub static NAME_TABLE_ENTRIES: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(opts!(
        "name_table_entries",
        "Number of names in the current Name Table snapshot."
    ))
    .unwrap()
});

pub static NAME_TABLE_RELOADS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        opts!(
            "name_table_reloads_total",
            "Total number of attempts to reload the Name Table from its sources."
        ),
        &["outcome"]
    )
    .unwrap()
});

/// Hit and miss counts from routing one query.  The responder fills
/// these in, and the listener adds them to the Prometheus counters
/// with `record` as soon as the query has been handled, before the
/// response is serialised and sent.  Refusals and question counts go
/// straight to their counters from the responder.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct Metrics {
    /// Questions in the suffix with a Name Table entry, whatever the
    /// qtype.
    pub authoritative_hits: u64,
    /// Questions in the suffix without an entry, including empty
    /// non-terminals.
    pub authoritative_misses: u64,
    /// Forwarded questions which got a valid upstream response.
    pub upstream_hits: u64,
    /// Forwarded questions which timed out or errored.
    pub upstream_misses: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) {
        DNS_AUTHORITATIVE_HIT_TOTAL.inc_by(self.authoritative_hits);
        DNS_AUTHORITATIVE_MISS_TOTAL.inc_by(self.authoritative_misses);
        DNS_UPSTREAM_HIT_TOTAL.inc_by(self.upstream_hits);
        DNS_UPSTREAM_MISS_TOTAL.inc_by(self.upstream_misses);
    }
}

async fn get_metrics() -> (StatusCode, String) {
    match TextEncoder::new().encode_to_string(&prometheus::gather()) {
        Ok(metrics_str) => (StatusCode::OK, metrics_str),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// Serve `GET /metrics` until the listener fails.
///
/// # Errors
///
/// If the address cannot be bound or the server stops with an error.
pub async fn serve_prometheus_endpoint_task(address: SocketAddr) -> std::io::Result<()> {
    let app = axum::Router::new().route("/metrics", routing::get(get_metrics));
    let listener = tokio::net::TcpListener::bind(address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
