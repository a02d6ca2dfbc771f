use http::StatusCode;
use std::{str::FromStr, time::Duration};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub count: u32,
    pub per_try_timeout: Option<Duration>,
    pub retry_on: Vec<RetryOn>,
    pub retriable_status_codes: Vec<u16>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RetryOn {
    ServerError,
    GatewayError,
    Reset,
    ConnectFailure,
    Retriable4xx,
    RefusedStream,
    RetriableStatusCodes,
    RetriableHeaders,
    Cancelled,
    DeadlineExceeded,
    Internal,
    ResourceExhausted,
    Unavailable,
}

/// The result of a single upstream attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Response {
        status: StatusCode,
        grpc_status: Option<u32>,
    },
    ConnectFailure,
    Reset,
    Timeout,
}

/// Active HTTP health checking of a cluster's endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCheckPolicy {
    pub path: String,
    pub host: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

pub const DEFAULT_HEALTH_CHECK_HOST: &str = "ingress-healthcheck";

#[derive(Debug, thiserror::Error)]
#[error("unsupported retryOn value: {0}")]
pub struct InvalidRetryOn(pub String);

// === impl RetryPolicy ===

impl RetryPolicy {
    pub fn should_retry(&self, outcome: Outcome) -> bool {
        let conditions: &[RetryOn] = if self.retry_on.is_empty() {
            &[RetryOn::ServerError]
        } else {
            &self.retry_on
        };
        conditions.iter().any(|c| self.retries_on(*c, outcome))
    }

    fn retries_on(&self, condition: RetryOn, outcome: Outcome) -> bool {
        let (status, grpc) = match outcome {
            Outcome::Response {
                status,
                grpc_status,
            } => (Some(status.as_u16()), grpc_status),
            _ => (None, None),
        };
        match condition {
            RetryOn::ServerError => {
                status.is_some_and(|s| s >= 500) || !matches!(outcome, Outcome::Response { .. })
            }
            RetryOn::GatewayError => {
                matches!(status, Some(502..=504)) || outcome == Outcome::ConnectFailure
            }
            RetryOn::Reset => matches!(outcome, Outcome::Reset | Outcome::Timeout),
            RetryOn::ConnectFailure => outcome == Outcome::ConnectFailure,
            RetryOn::Retriable4xx => status == Some(409),
            RetryOn::RefusedStream => outcome == Outcome::Reset,
            RetryOn::RetriableStatusCodes => {
                status.is_some_and(|s| self.retriable_status_codes.contains(&s))
            }
            RetryOn::RetriableHeaders => false,
            RetryOn::Cancelled => grpc == Some(1),
            RetryOn::DeadlineExceeded => grpc == Some(4),
            RetryOn::ResourceExhausted => grpc == Some(8),
            RetryOn::Internal => grpc == Some(13),
            RetryOn::Unavailable => grpc == Some(14),
        }
    }
}

// === impl RetryOn ===

impl FromStr for RetryOn {
    type Err = InvalidRetryOn;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "5xx" => Self::ServerError,
            "gateway-error" => Self::GatewayError,
            "reset" => Self::Reset,
            "connect-failure" => Self::ConnectFailure,
            "retriable-4xx" => Self::Retriable4xx,
            "refused-stream" => Self::RefusedStream,
            "retriable-status-codes" => Self::RetriableStatusCodes,
            "retriable-headers" => Self::RetriableHeaders,
            "cancelled" => Self::Cancelled,
            "deadline-exceeded" => Self::DeadlineExceeded,
            "internal" => Self::Internal,
            "resource-exhausted" => Self::ResourceExhausted,
            "unavailable" => Self::Unavailable,
            s => return Err(InvalidRetryOn(s.to_string())),
        })
    }
}

// === impl HealthCheckPolicy ===

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            host: DEFAULT_HEALTH_CHECK_HOST.to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}
