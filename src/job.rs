//! Job and result records for the dispatch pipeline.
//!
//! This module defines the wire types shared by the front-end and the
//! workers:
//!
//! - `MoveRequest`: the inbound HTTP request body with validation and
//!   normalisation rules
//! - `Job`: a unit of analysis work pushed onto the jobs list
//! - `JobResult`: the outcome published to the results list
//!
//! Jobs and results are self-describing JSON text records so that any
//! front-end or worker instance (and operators inspecting the queue by hand)
//! can read them without out-of-band schema knowledge.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Lowest engine strength the engine accepts.
pub const ELO_MIN: i32 = 1320;

/// Highest engine strength the engine accepts.
pub const ELO_MAX: i32 = 3190;

/// Strength applied when the client does not ask for one.
pub const ELO_DEFAULT: i32 = 1600;

/// Think time applied when the client omits it or sends a non-positive value.
pub const MOVETIME_DEFAULT_MS: i64 = 1000;

/// Timing phase keys recorded in `JobResult::timings`.
pub mod timing {
    pub const QUEUE_WAIT_MS: &str = "queue_wait_ms";
    pub const ENGINE_CONNECT_MS: &str = "engine_connect_ms";
    pub const ENGINE_COMPUTE_MS: &str = "engine_compute_ms";
    pub const RESULT_PUBLISH_MS: &str = "result_publish_ms";
    pub const TOTAL_MS: &str = "total_ms";
}

/// Inbound analysis request as posted to `/move`.
#[derive(Debug, Clone, Deserialize)]
pub struct MoveRequest {
    /// Position in Forsyth–Edwards notation. Required.
    #[serde(default)]
    pub fen: String,
    /// Desired engine strength. Zero means "use the default".
    #[serde(default)]
    pub elo: i32,
    /// Engine think time in milliseconds.
    #[serde(default)]
    pub movetime_ms: i64,
}

impl MoveRequest {
    /// Validates the request. A missing FEN is the only hard rejection;
    /// everything else is normalised instead.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.fen.is_empty() {
            return Err("missing fen");
        }
        Ok(())
    }

    /// Applies defaults and clamps in place: Elo 0 becomes 1600, out-of-range
    /// values are clamped to [1320, 3190], and a non-positive think time
    /// becomes 1000 ms.
    pub fn normalize(&mut self) {
        if self.elo == 0 {
            self.elo = ELO_DEFAULT;
        }
        self.elo = self.elo.clamp(ELO_MIN, ELO_MAX);
        if self.movetime_ms <= 0 {
            self.movetime_ms = MOVETIME_DEFAULT_MS;
        }
    }
}

/// Successful response body for `/move`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveResponse {
    pub bestmove: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ponder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

/// A unit of analysis work flowing from the front-end to a worker.
///
/// The job identifier is unique within the process: a nanosecond timestamp
/// plus the requested Elo. The creation timestamp is RFC 3339 with
/// nanosecond precision and is used by workers to measure queue wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub correlation_id: String,
    pub fen: String,
    pub elo: i32,
    pub max_time_ms: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_at: String,
}

impl Job {
    /// Creates a job from a normalised request, stamping `created_at` now.
    pub fn new(fen: &str, elo: i32, max_time_ms: i64, correlation_id: &str) -> Self {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self {
            job_id: format!("job_{}_{}", nanos, elo),
            correlation_id: correlation_id.to_string(),
            fen: fen.to_string(),
            elo,
            max_time_ms,
            created_at: now_rfc3339_nanos(),
        }
    }

    /// Encodes the job as a JSON text record.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a job from a JSON text record.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Time the job has spent in the queue, derived from `created_at`.
    ///
    /// Returns `None` when the timestamp is absent or unparseable; queue
    /// wait is then simply not reported for this job.
    pub fn queue_wait(&self) -> Option<Duration> {
        if self.created_at.is_empty() {
            return None;
        }
        let created = chrono::DateTime::parse_from_rfc3339(&self.created_at).ok()?;
        Utc::now()
            .signed_duration_since(created)
            .to_std()
            .ok()
            .or(Some(Duration::ZERO))
    }
}

/// The outcome of one job: either a best move or an error, plus per-phase
/// timings and a completion timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bestmove: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ponder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub timings: BTreeMap<String, i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub completed_at: String,
}

impl JobResult {
    /// Creates an empty result for a job, carrying its correlation ID.
    pub fn for_job(job: &Job, correlation_id: &str) -> Self {
        Self {
            job_id: job.job_id.clone(),
            correlation_id: correlation_id.to_string(),
            ..Self::default()
        }
    }

    /// Records a timing phase in whole milliseconds.
    pub fn record_timing(&mut self, phase: &str, elapsed: Duration) {
        self.timings
            .insert(phase.to_string(), elapsed.as_millis() as i64);
    }

    /// Stamps the completion timestamp.
    pub fn mark_completed(&mut self) {
        self.completed_at = now_rfc3339_nanos();
    }

    /// Whether the job failed.
    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }

    /// Encodes the result as a JSON text record.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a result from a JSON text record.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Current time as RFC 3339 with nanosecond precision.
pub fn now_rfc3339_nanos() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(fen: &str, elo: i32, movetime_ms: i64) -> MoveRequest {
        MoveRequest {
            fen: fen.to_string(),
            elo,
            movetime_ms,
        }
    }

    #[test]
    fn test_validate_rejects_missing_fen() {
        assert!(request("", 1600, 1000).validate().is_err());
        assert!(request("8/8/8/8/8/8/8/8 w - - 0 1", 1600, 1000)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_normalize_elo_default_and_clamps() {
        let mut req = request("fen", 0, 1000);
        req.normalize();
        assert_eq!(req.elo, 1600);

        let mut req = request("fen", 1319, 1000);
        req.normalize();
        assert_eq!(req.elo, 1320);

        let mut req = request("fen", 3191, 1000);
        req.normalize();
        assert_eq!(req.elo, 3190);

        let mut req = request("fen", 2000, 1000);
        req.normalize();
        assert_eq!(req.elo, 2000);
    }

    #[test]
    fn test_normalize_movetime() {
        let mut req = request("fen", 1600, 0);
        req.normalize();
        assert_eq!(req.movetime_ms, 1000);

        let mut req = request("fen", 1600, -5);
        req.normalize();
        assert_eq!(req.movetime_ms, 1000);

        let mut req = request("fen", 1600, 2500);
        req.normalize();
        assert_eq!(req.movetime_ms, 2500);
    }

    #[test]
    fn test_move_request_defaults_from_json() {
        let req: MoveRequest = serde_json::from_str(r#"{"fen":"abc"}"#).expect("should parse");
        assert_eq!(req.fen, "abc");
        assert_eq!(req.elo, 0);
        assert_eq!(req.movetime_ms, 0);
    }

    #[test]
    fn test_job_id_carries_elo_suffix() {
        let job = Job::new("fen", 1850, 1000, "api-1-abc");
        assert!(job.job_id.starts_with("job_"));
        assert!(job.job_id.ends_with("_1850"));
    }

    #[test]
    fn test_job_encode_decode_roundtrip() {
        let job = Job::new(
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1",
            1600,
            1000,
            "trace-xyz",
        );
        let encoded = job.encode().expect("encode should work");
        let decoded = Job::decode(&encoded).expect("decode should work");
        assert_eq!(job, decoded);
    }

    #[test]
    fn test_job_decode_tolerates_missing_optional_fields() {
        let raw = r#"{"job_id":"job_1_1600","fen":"abc","elo":1600,"max_time_ms":1000}"#;
        let job = Job::decode(raw).expect("decode should work");
        assert!(job.correlation_id.is_empty());
        assert!(job.created_at.is_empty());
        assert!(job.queue_wait().is_none());
    }

    #[test]
    fn test_queue_wait_unparseable_timestamp() {
        let mut job = Job::new("fen", 1600, 1000, "c");
        job.created_at = "not-a-timestamp".to_string();
        assert!(job.queue_wait().is_none());
    }

    #[test]
    fn test_queue_wait_is_nonnegative() {
        let mut job = Job::new("fen", 1600, 1000, "c");
        // A creation timestamp in the future clamps to zero.
        job.created_at = (Utc::now() + chrono::Duration::seconds(60))
            .to_rfc3339_opts(SecondsFormat::Nanos, true);
        assert_eq!(job.queue_wait(), Some(Duration::ZERO));
    }

    #[test]
    fn test_result_roundtrip_preserves_correlation() {
        let job = Job::new("fen", 1600, 1000, "trace-xyz");
        let mut result = JobResult::for_job(&job, &job.correlation_id);
        result.bestmove = "e2e4".to_string();
        result.ponder = Some("e7e5".to_string());
        result.record_timing(timing::ENGINE_COMPUTE_MS, Duration::from_millis(987));
        result.mark_completed();

        let decoded = JobResult::decode(&result.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, result);
        assert_eq!(decoded.correlation_id, "trace-xyz");
        assert_eq!(decoded.timings[timing::ENGINE_COMPUTE_MS], 987);
    }

    #[test]
    fn test_result_error_detection() {
        let mut result = JobResult::default();
        assert!(!result.is_error());
        result.error = Some(String::new());
        assert!(!result.is_error());
        result.error = Some("engine computation error: timeout".to_string());
        assert!(result.is_error());
    }
}
