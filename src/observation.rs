use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::plan::IterationIndex;
use crate::request::RequestLabel;

/// The only status code that counts as a passing check.
pub const EXPECTED_STATUS: u16 = 200;

/// Outcome of one dispatched search request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub iteration: u64,
    pub pass: u32,
    #[serde(flatten)]
    pub label: RequestLabel,
    pub status: Option<u16>,
    pub success: bool,
    #[serde(rename = "latency_ms", serialize_with = "serialize_latency")]
    pub latency: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl Observation {
    /// An HTTP response arrived; success depends only on the status code.
    pub fn responded(
        index: IterationIndex,
        label: RequestLabel,
        status: u16,
        latency: Duration,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            iteration: index.iteration,
            pass: index.pass,
            label,
            status: Some(status),
            success: status == EXPECTED_STATUS,
            latency: Some(latency),
            error: None,
            started_at,
        }
    }

    /// No response at all (refused, reset, timed out). No latency is recorded.
    pub fn transport_failure(
        index: IterationIndex,
        label: RequestLabel,
        error: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            iteration: index.iteration,
            pass: index.pass,
            label,
            status: None,
            success: false,
            latency: None,
            error: Some(error),
            started_at,
        }
    }

    pub fn is_transport_failure(&self) -> bool {
        self.status.is_none()
    }

    pub fn latency_ms(&self) -> Option<f64> {
        self.latency.map(duration_ms)
    }
}

/// `status is 200`.
pub fn validate(observation: &Observation) -> bool {
    observation.status == Some(EXPECTED_STATUS)
}

pub(crate) fn duration_ms(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

fn serialize_latency<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(latency) => serializer.serialize_some(&duration_ms(*latency)),
        None => serializer.serialize_none(),
    }
}
