use http::StatusCode;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

#[derive(Clone, Debug)]
pub struct ProxyMetrics {
    requests: Family<RequestLabels, Counter>,
    duration: Family<ListenerLabels, Histogram>,
    upstream: Family<UpstreamLabels, Counter>,
    tls_rejected: Family<ListenerLabels, Counter>,
}

/// Records the completion of a single request.
pub(crate) struct RequestObserver {
    start: time::Instant,
    listener: &'static str,
    metrics: ProxyMetrics,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ListenerLabels {
    listener: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct RequestLabels {
    listener: &'static str,
    status_class: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct UpstreamLabels {
    outcome: &'static str,
}

/// How an upstream attempt ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum UpstreamOutcome {
    Response,
    ConnectFailure,
    Reset,
    Timeout,
    Retry,
}

// === impl ProxyMetrics ===

impl ProxyMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<RequestLabels, Counter>::default();
        reg.register(
            "requests",
            "Total number of requests served, by response status class",
            requests.clone(),
        );

        let duration = Family::<ListenerLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0])
        });
        reg.register_with_unit(
            "request_duration",
            "Histogram of the time taken to produce a response",
            Unit::Seconds,
            duration.clone(),
        );

        let upstream = Family::<UpstreamLabels, Counter>::default();
        reg.register(
            "upstream_attempts",
            "Total number of upstream attempts, by outcome",
            upstream.clone(),
        );

        let tls_rejected = Family::<ListenerLabels, Counter>::default();
        reg.register(
            "tls_rejected",
            "Total number of connections that failed the TLS handshake",
            tls_rejected.clone(),
        );

        Self {
            requests,
            duration,
            upstream,
            tls_rejected,
        }
    }

    pub(crate) fn start(&self, listener: &'static str) -> RequestObserver {
        RequestObserver {
            start: time::Instant::now(),
            listener,
            metrics: self.clone(),
        }
    }

    pub(crate) fn upstream(&self, outcome: UpstreamOutcome) {
        let outcome = match outcome {
            UpstreamOutcome::Response => "response",
            UpstreamOutcome::ConnectFailure => "connect_failure",
            UpstreamOutcome::Reset => "reset",
            UpstreamOutcome::Timeout => "timeout",
            UpstreamOutcome::Retry => "retry",
        };
        self.upstream.get_or_create(&UpstreamLabels { outcome }).inc();
    }

    pub(crate) fn tls_rejected(&self) {
        self.tls_rejected
            .get_or_create(&ListenerLabels { listener: "https" })
            .inc();
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === impl RequestObserver ===

impl RequestObserver {
    pub(crate) fn end(self, status: StatusCode) {
        let Self {
            start,
            listener,
            metrics,
        } = self;
        metrics
            .duration
            .get_or_create(&ListenerLabels { listener })
            .observe(start.elapsed().as_secs_f64());
        metrics
            .requests
            .get_or_create(&RequestLabels {
                listener,
                status_class: status_class(status),
            })
            .inc();
    }
}

fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_counted_by_class() {
        let metrics = ProxyMetrics::default();
        metrics.start("http").end(StatusCode::OK);
        metrics.start("http").end(StatusCode::NO_CONTENT);
        metrics.start("https").end(StatusCode::SERVICE_UNAVAILABLE);

        let count = |listener, status_class| {
            metrics
                .requests
                .get_or_create(&RequestLabels {
                    listener,
                    status_class,
                })
                .get()
        };
        assert_eq!(count("http", "2xx"), 2);
        assert_eq!(count("https", "5xx"), 1);
        assert_eq!(count("http", "5xx"), 0);
    }
}
