use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::error::{AgentError, Result};
use crate::fetch::ArtifactFetcher;
use crate::update::checker::{ReleaseDescriptor, VersionChecker};
use crate::update::replacer::{platform_replacer, ProcessReplacer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    CheckingVersion,
    Downloading,
    Verifying,
    BackingUp,
    Replacing,
    Relaunched,
    RolledBack,
    FatalRollbackFailure,
}

/// Coordinates the whole update transaction.
///
/// Invariant: at every observable point exactly one of {original executable,
/// backed-up original, newly-applied executable} is present and executable at
/// the canonical path. Download and verification happen in staging before the
/// canonical path is touched; once the backup exists, any later failure rolls
/// back to it.
pub struct UpdateManager {
    checker: VersionChecker,
    fetcher: ArtifactFetcher,
    replacer: Box<dyn ProcessReplacer>,
    exe_path: PathBuf,
    backup_path: PathBuf,
    staging_dir: PathBuf,
    state: Mutex<UpdateState>,
}

impl UpdateManager {
    pub fn new(current_version: &str, feed_url: &str) -> Result<Self> {
        let exe_path = std::env::current_exe()?;
        Ok(Self::with_parts(
            VersionChecker::new(current_version, feed_url),
            ArtifactFetcher::new(),
            platform_replacer(),
            exe_path,
            std::env::temp_dir().join("idlegrid-updates"),
        ))
    }

    pub fn with_parts(
        checker: VersionChecker,
        fetcher: ArtifactFetcher,
        replacer: Box<dyn ProcessReplacer>,
        exe_path: PathBuf,
        staging_dir: PathBuf,
    ) -> Self {
        let backup_path = backup_path_for(&exe_path);
        Self {
            checker,
            fetcher,
            replacer,
            exe_path,
            backup_path,
            staging_dir,
            state: Mutex::new(UpdateState::Idle),
        }
    }

    pub fn state(&self) -> UpdateState {
        *self.state.lock().expect("update state poisoned")
    }

    fn set_state(&self, state: UpdateState) {
        tracing::debug!(state = ?state, "update state transition");
        *self.state.lock().expect("update state poisoned") = state;
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Poll the feed. `Some` when a newer release exists for any platform;
    /// asset applicability is decided at apply time.
    pub async fn check_for_update(&self) -> Result<Option<ReleaseDescriptor>> {
        self.set_state(UpdateState::CheckingVersion);
        let result = self.checker.check_for_update().await;
        if !matches!(result, Ok(Some(_))) {
            self.set_state(UpdateState::Idle);
        }
        result
    }

    /// Apply `release` transactionally.
    ///
    /// On Unix this does not return on success. Download and verification
    /// failures abandon the attempt without touching the canonical path;
    /// failures during replacement roll back to the backup. A rollback
    /// failure is fatal and leaves the manager refusing to look healthy.
    pub async fn apply_update(&self, release: &ReleaseDescriptor) -> Result<()> {
        let asset = self.checker.select_asset(release).ok_or_else(|| {
            AgentError::NoApplicableRelease {
                os: std::env::consts::OS.to_string(),
                arch: std::env::consts::ARCH.to_string(),
            }
        })?;
        if asset.sha256.is_empty() {
            return Err(AgentError::UpdateVerification(format!(
                "release asset {} carries no digest",
                asset.name
            )));
        }

        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let staged = self.staging_dir.join(&asset.name);

        self.set_state(UpdateState::Downloading);
        if let Err(e) = self
            .fetcher
            .fetch_and_verify(&asset.download_url, &asset.sha256, &staged)
            .await
        {
            self.set_state(UpdateState::Idle);
            return Err(match e {
                e @ AgentError::ChecksumMismatch { .. } => {
                    AgentError::UpdateVerification(e.to_string())
                }
                other => AgentError::UpdateDownload(other.to_string()),
            });
        }

        // Re-verify the staged file as written to disk before trusting it
        // with the canonical path.
        self.set_state(UpdateState::Verifying);
        if let Err(e) = verify_file_digest(&staged, &asset.sha256).await {
            let _ = tokio::fs::remove_file(&staged).await;
            self.set_state(UpdateState::Idle);
            return Err(AgentError::UpdateVerification(e.to_string()));
        }

        self.set_state(UpdateState::BackingUp);
        if let Err(e) = tokio::fs::copy(&self.exe_path, &self.backup_path).await {
            let _ = tokio::fs::remove_file(&self.backup_path).await;
            self.set_state(UpdateState::Idle);
            return Err(AgentError::UpdateApply(format!(
                "failed to back up current executable: {e}"
            )));
        }

        self.set_state(UpdateState::Replacing);
        match self.replacer.replace_and_relaunch(&staged, &self.exe_path) {
            Ok(()) => {
                self.set_state(UpdateState::Relaunched);
                tracing::info!(version = %release.tag, "update applied");
                Ok(())
            }
            Err(apply_err) => {
                tracing::warn!(error = %apply_err, "update apply failed, rolling back");
                match self.rollback().await {
                    Ok(()) => {
                        self.set_state(UpdateState::RolledBack);
                        Err(AgentError::UpdateApply(apply_err.to_string()))
                    }
                    Err(rollback_err) => {
                        self.set_state(UpdateState::FatalRollbackFailure);
                        tracing::error!(
                            apply_error = %apply_err,
                            rollback_error = %rollback_err,
                            exe = %self.exe_path.display(),
                            backup = %self.backup_path.display(),
                            "ROLLBACK FAILED: executable may be broken, manual intervention required"
                        );
                        Err(rollback_err)
                    }
                }
            }
        }
    }

    /// Restore the backed-up executable to the canonical path.
    pub async fn rollback(&self) -> Result<()> {
        if tokio::fs::metadata(&self.backup_path).await.is_err() {
            return Err(AgentError::RollbackFailure("no backup found".to_string()));
        }
        tokio::fs::rename(&self.backup_path, &self.exe_path)
            .await
            .map_err(|e| AgentError::RollbackFailure(e.to_string()))
    }

    /// Remove leftovers of a previous update attempt. Called on startup; a
    /// surviving backup from the run that applied this binary is no longer
    /// needed.
    pub async fn cleanup(&self) {
        if tokio::fs::remove_file(&self.backup_path).await.is_ok() {
            tracing::debug!(backup = %self.backup_path.display(), "removed stale backup");
        }
        let _ = tokio::fs::remove_dir_all(&self.staging_dir).await;
    }
}

fn backup_path_for(exe: &Path) -> PathBuf {
    let mut name = exe
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".backup");
    exe.with_file_name(name)
}

async fn verify_file_digest(path: &Path, expected: &str) -> Result<()> {
    let bytes = tokio::fs::read(path).await?;
    let actual = hex::encode(Sha256::digest(&bytes));
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(AgentError::ChecksumMismatch {
            expected: expected.to_ascii_lowercase(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_path_is_sibling_with_suffix() {
        let backup = backup_path_for(Path::new("/opt/idlegrid/idlegrid"));
        assert_eq!(backup, Path::new("/opt/idlegrid/idlegrid.backup"));
    }
}
