use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Ok,
    Error,
    Skipped,
    Timeout,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Ok => write!(f, "ok"),
            JobStatus::Error => write!(f, "error"),
            JobStatus::Skipped => write!(f, "skipped"),
            JobStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// A unit of work handed down by the coordinator service. Immutable once
/// received; owned exclusively by the job coordinator for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(rename = "artifactUrl", default)]
    pub artifact_url: String,
    #[serde(default)]
    pub sha256: String,
    #[serde(rename = "maxSeconds", default)]
    pub max_seconds: u64,
    #[serde(rename = "memMB", default)]
    pub mem_mb: u64,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Outcome of one job attempt. Created once, never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: JobStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cpu_time: std::time::Duration,
    pub fuel_used: u64,
}

impl ExecutionResult {
    pub fn skipped(reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            status: JobStatus::Skipped,
            output: None,
            error: Some(reason.into()),
            started_at: now,
            finished_at: now,
            cpu_time: std::time::Duration::ZERO,
            fuel_used: 0,
        }
    }

    pub fn failure(error: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Error,
            output: None,
            error: Some(error.into()),
            started_at,
            finished_at: Utc::now(),
            cpu_time: std::time::Duration::ZERO,
            fuel_used: 0,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn report(&self, job_id: &str) -> JobReport {
        JobReport {
            job_id: job_id.to_string(),
            status: self.status,
            duration_ms: self.duration_ms(),
            error: self.error.clone().unwrap_or_default(),
        }
    }
}

/// Execution report sent back to the coordinator service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    #[serde(rename = "jobId")]
    pub job_id: String,
    pub status: JobStatus,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    #[serde(default)]
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_deserializes_wire_format() {
        let job: Job = serde_json::from_str(
            r#"{
                "id": "job-7",
                "type": "wasm",
                "artifactUrl": "https://grid.example.com/a.wasm",
                "sha256": "abc123",
                "maxSeconds": 60,
                "memMB": 16,
                "args": {"n": 4}
            }"#,
        )
        .unwrap();
        assert_eq!(job.id, "job-7");
        assert_eq!(job.job_type, "wasm");
        assert_eq!(job.max_seconds, 60);
        assert_eq!(job.mem_mb, 16);
    }

    #[test]
    fn job_tolerates_missing_optional_fields() {
        let job: Job = serde_json::from_str(r#"{"id": "j", "type": "sleep"}"#).unwrap();
        assert!(job.artifact_url.is_empty());
        assert_eq!(job.max_seconds, 0);
        assert!(job.args.is_null());
    }

    #[test]
    fn report_serializes_wire_format() {
        let result = ExecutionResult::skipped("unsupported job type");
        let report = result.report("job-9");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["jobId"], "job-9");
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["error"], "unsupported job type");
    }

    #[test]
    fn status_display_matches_wire_values() {
        assert_eq!(JobStatus::Ok.to_string(), "ok");
        assert_eq!(JobStatus::Timeout.to_string(), "timeout");
    }
}
