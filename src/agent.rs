//! The agent's scheduler loop: a single dispatcher multiplexing the job
//! poll, heartbeat, workdir cleanup and update-check timers over one
//! cancellation signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::activity::ActivityProbe;
use crate::admission::AdmissionController;
use crate::api::AgentClient;
use crate::config::{AgentConfig, DeviceIdentity};
use crate::coordinator::JobCoordinator;
use crate::error::{AgentError, Result};
use crate::fetch::ArtifactFetcher;
use crate::sandbox::SandboxExecutor;
use crate::update::UpdateManager;

/// Scratch directories older than this are swept on the cleanup timer.
const STALE_WORKDIR_AGE: Duration = Duration::from_secs(24 * 3600);

pub struct Agent {
    config: AgentConfig,
    identity: DeviceIdentity,
    client: AgentClient,
    admission: Arc<AdmissionController>,
    coordinator: Arc<JobCoordinator>,
    updater: Arc<UpdateManager>,
    /// Single-slot gate: at most one job executes at a time.
    job_slot: Arc<Semaphore>,
    /// Set after a rollback failure; the agent must not claim to be healthy
    /// once it can no longer self-heal.
    degraded: Arc<AtomicBool>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        identity: DeviceIdentity,
        probe: Box<dyn ActivityProbe>,
    ) -> Result<Self> {
        let admission = Arc::new(AdmissionController::new(config.mode, probe));
        let sandbox = SandboxExecutor::new(config.wasm.clone())?;
        let coordinator = Arc::new(JobCoordinator::new(
            admission.clone(),
            ArtifactFetcher::new(),
            sandbox,
            config.work_root.clone(),
            config.max_job_timeout,
        ));
        let updater = Arc::new(UpdateManager::new(&config.version, &config.update_feed_url)?);
        let client = AgentClient::new(config.api_base.clone(), config.version.clone());

        Ok(Self {
            config,
            identity,
            client,
            admission,
            coordinator,
            updater,
            job_slot: Arc::new(Semaphore::new(1)),
            degraded: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Run until the cancellation token fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.work_root).await?;
        self.updater.cleanup().await;

        match self.client.register(&self.identity).await {
            Ok(()) => tracing::info!(device_id = %self.identity.device_id, "registered"),
            Err(e) => tracing::warn!(error = %e, "registration failed, continuing"),
        }

        let mut poll = tokio::time::interval(self.config.poll_interval);
        let mut beat = tokio::time::interval(self.config.heartbeat_interval);
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval);
        let mut update = tokio::time::interval(self.config.update_interval);

        tracing::info!(
            mode = %self.admission.mode(),
            work_root = %self.config.work_root.display(),
            "agent started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => self.poll_for_job(&cancel).await,
                _ = beat.tick() => self.heartbeat().await,
                _ = cleanup.tick() => self.sweep_work_root().await,
                _ = update.tick() => self.check_updates().await,
            }
        }

        // Give an in-flight job a bounded window to observe cancellation and
        // report before the process exits.
        let _ = tokio::time::timeout(Duration::from_secs(5), self.job_slot.acquire()).await;
        tracing::info!("agent stopped");
        Ok(())
    }

    /// Admission is evaluated fresh before every poll; an approved decision
    /// is never reused across polls.
    async fn poll_for_job(&self, cancel: &CancellationToken) {
        if self.job_slot.available_permits() == 0 {
            tracing::trace!("job already in flight, skipping poll");
            return;
        }
        if !self.admission.should_run_job() {
            tracing::debug!("host too active, skipping job poll");
            return;
        }

        let job = match self.client.next_job(&self.identity).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::trace!("no work available");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "job poll failed");
                return;
            }
        };

        let Ok(permit) = self.job_slot.clone().try_acquire_owned() else {
            return;
        };
        let coordinator = self.coordinator.clone();
        let client = self.client.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let result = coordinator.run_job(&job, &cancel).await;
            let report = result.report(&job.id);
            if let Err(e) = client.report(&report).await {
                tracing::warn!(job_id = %job.id, error = %e, "failed to report job result");
            }
        });
    }

    async fn heartbeat(&self) {
        if self.degraded.load(Ordering::Relaxed) {
            tracing::warn!("rollback failure recorded, withholding healthy heartbeat");
            return;
        }
        match self.client.beat(&self.identity).await {
            Ok(()) => tracing::debug!("heartbeat OK"),
            Err(e) => tracing::warn!(error = %e, "heartbeat failed"),
        }
    }

    /// Updates and jobs never run concurrently; the executable-replacement
    /// path is a global exclusive resource.
    async fn check_updates(&self) {
        if self.job_slot.available_permits() == 0 {
            tracing::debug!("job in flight, deferring update check");
            return;
        }

        let release = match self.updater.check_for_update().await {
            Ok(Some(release)) => release,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(error = %e, "update check failed");
                return;
            }
        };

        if !self.config.auto_update {
            tracing::info!(version = %release.tag, "update available, auto-update disabled");
            return;
        }

        match self.updater.apply_update(&release).await {
            // On Unix a successful apply never returns; reaching here means
            // the platform replacer deferred the swap to a helper.
            Ok(()) => {
                tracing::info!("update scheduled, exiting for relaunch");
                std::process::exit(0);
            }
            Err(AgentError::RollbackFailure(e)) => {
                self.degraded.store(true, Ordering::Relaxed);
                tracing::error!(error = %e, "entering degraded state after rollback failure");
            }
            Err(e) => {
                tracing::warn!(error = %e, "update attempt failed, will retry next cycle");
            }
        }
    }

    /// Remove scratch directories left behind by earlier runs.
    async fn sweep_work_root(&self) {
        let mut entries = match tokio::fs::read_dir(&self.config.work_root).await {
            Ok(entries) => entries,
            Err(_) => return,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let stale = metadata
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .map(|age| age > STALE_WORKDIR_AGE)
                .unwrap_or(false);
            if stale {
                tracing::debug!(dir = %entry.path().display(), "removing stale work directory");
                let _ = tokio::fs::remove_dir_all(entry.path()).await;
            }
        }
    }
}
