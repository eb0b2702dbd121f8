//! Orchestrates one job at a time: admission, artifact retrieval, sandboxed
//! execution and scratch-directory lifecycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionController;
use crate::error::AgentError;
use crate::fetch::ArtifactFetcher;
use crate::job::{ExecutionResult, Job, JobStatus};
use crate::sandbox::SandboxExecutor;

pub struct JobCoordinator {
    admission: Arc<AdmissionController>,
    fetcher: ArtifactFetcher,
    sandbox: SandboxExecutor,
    work_root: PathBuf,
    max_timeout: Duration,
}

impl JobCoordinator {
    pub fn new(
        admission: Arc<AdmissionController>,
        fetcher: ArtifactFetcher,
        sandbox: SandboxExecutor,
        work_root: PathBuf,
        max_timeout: Duration,
    ) -> Self {
        Self {
            admission,
            fetcher,
            sandbox,
            work_root,
            max_timeout,
        }
    }

    /// Run one job to completion. Every expected failure is folded into the
    /// returned result; nothing here crashes the scheduler loop.
    pub async fn run_job(&self, job: &Job, cancel: &CancellationToken) -> ExecutionResult {
        if !self.admission.should_run_job() {
            tracing::debug!(job_id = %job.id, "admission denied, skipping job");
            return ExecutionResult::skipped(AgentError::InsufficientResources.to_string());
        }

        if !valid_job_id(&job.id) {
            tracing::warn!(job_id = %job.id, "rejecting job with unsafe id");
            return ExecutionResult::skipped("invalid job id");
        }

        let wall = self.time_box(job.max_seconds);

        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            timeout = ?wall,
            "running job"
        );

        let result = match job.job_type.as_str() {
            "wasm" => self.run_wasm_job(job, wall, cancel).await,
            "sleep" => run_sleep_job(job, wall, cancel).await,
            "hash" => run_hash_job(job, wall, cancel).await,
            other => ExecutionResult::skipped(format!("unsupported job type: {other}")),
        };

        tracing::info!(
            job_id = %job.id,
            status = %result.status,
            duration_ms = result.duration_ms(),
            fuel_used = result.fuel_used,
            "job finished"
        );
        result
    }

    fn time_box(&self, max_seconds: u64) -> Duration {
        let declared = if max_seconds == 0 {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(max_seconds)
        };
        declared.min(self.max_timeout)
    }

    async fn run_wasm_job(
        &self,
        job: &Job,
        wall: Duration,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let job_dir = self.work_root.join(&job.id);
        if let Err(e) = tokio::fs::create_dir_all(&job_dir).await {
            return ExecutionResult::failure(
                format!("failed to create job directory: {e}"),
                Utc::now(),
            );
        }

        let result = self.run_wasm_in_dir(job, &job_dir, wall, cancel).await;

        // The scratch directory is exclusively owned by this job and must be
        // gone before the path can be reused.
        if let Err(e) = tokio::fs::remove_dir_all(&job_dir).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to remove job directory");
        }

        result
    }

    async fn run_wasm_in_dir(
        &self,
        job: &Job,
        job_dir: &std::path::Path,
        wall: Duration,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let started_at = Utc::now();
        let artifact_path = job_dir.join("job.wasm");

        if let Err(e) = self
            .fetcher
            .fetch_and_verify(&job.artifact_url, &job.sha256, &artifact_path)
            .await
        {
            return ExecutionResult::failure(format!("failed to fetch artifact: {e}"), started_at);
        }

        let bytes = match tokio::fs::read(&artifact_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return ExecutionResult::failure(
                    format!("failed to read artifact: {e}"),
                    started_at,
                )
            }
        };

        let mut budget = self.sandbox.budget_for(job.max_seconds, job.mem_mb);
        budget.wall_clock = budget.wall_clock.min(wall);

        let entry = job
            .args
            .get("entry")
            .and_then(|v| v.as_str())
            .map(str::to_owned);

        tokio::select! {
            result = self
                .sandbox
                .execute(bytes, entry.as_deref(), budget, Some(job_dir.to_path_buf())) => result,
            _ = cancel.cancelled() => {
                ExecutionResult::failure("cancelled by shutdown", started_at)
            }
        }
    }
}

/// Scratch directories are named by job id; reject anything that could
/// escape the work root.
fn valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !id.starts_with('.')
}

fn args_seconds(job: &Job, default: u64) -> u64 {
    job.args
        .get("seconds")
        .and_then(|v| v.as_u64())
        .filter(|s| *s > 0)
        .unwrap_or(default)
}

/// Diagnostic canary: sleep for the requested duration inside the time box.
async fn run_sleep_job(job: &Job, wall: Duration, cancel: &CancellationToken) -> ExecutionResult {
    let started_at = Utc::now();
    let start = Instant::now();
    let requested = Duration::from_secs(args_seconds(job, 5));

    let mut result = tokio::select! {
        _ = tokio::time::sleep(requested.min(wall)) => {
            if requested > wall {
                ExecutionResult {
                    status: JobStatus::Timeout,
                    output: None,
                    error: Some(AgentError::Timeout(wall).to_string()),
                    started_at,
                    finished_at: Utc::now(),
                    cpu_time: Duration::ZERO,
                    fuel_used: 0,
                }
            } else {
                ExecutionResult {
                    status: JobStatus::Ok,
                    output: None,
                    error: None,
                    started_at,
                    finished_at: Utc::now(),
                    cpu_time: Duration::ZERO,
                    fuel_used: 0,
                }
            }
        }
        _ = cancel.cancelled() => ExecutionResult::failure("cancelled by shutdown", started_at),
    };
    result.cpu_time = start.elapsed();
    result
}

/// Diagnostic canary: burn CPU hashing a fixed buffer for the requested
/// duration. Runs on a blocking thread and observes cancellation between
/// rounds.
async fn run_hash_job(job: &Job, wall: Duration, cancel: &CancellationToken) -> ExecutionResult {
    let started_at = Utc::now();
    let requested = Duration::from_secs(args_seconds(job, 10));
    let deadline = requested.min(wall);
    let cancel = cancel.clone();

    let outcome = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 1 << 16];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = i as u8;
        }
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cancel.is_cancelled() {
                return (start.elapsed(), true);
            }
            let digest = Sha256::digest(&buf);
            std::hint::black_box(digest);
        }
        (start.elapsed(), false)
    })
    .await;

    let finished_at = Utc::now();
    match outcome {
        Ok((elapsed, cancelled)) => {
            let (status, error) = if cancelled {
                (JobStatus::Error, Some("cancelled by shutdown".to_string()))
            } else if requested > wall {
                (
                    JobStatus::Timeout,
                    Some(AgentError::Timeout(wall).to_string()),
                )
            } else {
                (JobStatus::Ok, None)
            };
            ExecutionResult {
                status,
                output: None,
                error,
                started_at,
                finished_at,
                cpu_time: elapsed,
                fuel_used: 0,
            }
        }
        Err(e) => ExecutionResult::failure(format!("hash task failed: {e}"), started_at),
    }
}
