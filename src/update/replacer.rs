//! Platform strategies for swapping the running executable.
//!
//! The transactional backup/rollback logic in the update manager is identical
//! across platforms; only the final swap differs. Unix allows renaming over a
//! running binary and re-exec'ing in place; Windows needs an external helper
//! that waits for the process to exit.

use std::path::Path;

use crate::error::{AgentError, Result};

pub trait ProcessReplacer: Send + Sync {
    /// Put `new_exe` at `current_exe` and relaunch the agent.
    ///
    /// On Unix this does not return on success (the process image is
    /// replaced). On Windows it returns `Ok` after scheduling the helper and
    /// the caller is expected to exit promptly.
    fn replace_and_relaunch(&self, new_exe: &Path, current_exe: &Path) -> Result<()>;
}

/// Strategy for the current platform, chosen once at startup.
pub fn platform_replacer() -> Box<dyn ProcessReplacer> {
    #[cfg(unix)]
    {
        Box::new(ExecReplacer)
    }
    #[cfg(windows)]
    {
        Box::new(HelperScriptReplacer)
    }
    #[cfg(not(any(unix, windows)))]
    {
        Box::new(UnsupportedReplacer)
    }
}

/// Rename the verified binary over the canonical path, then re-exec it with
/// the original arguments and environment.
#[cfg(unix)]
pub struct ExecReplacer;

#[cfg(unix)]
impl ProcessReplacer for ExecReplacer {
    fn replace_and_relaunch(&self, new_exe: &Path, current_exe: &Path) -> Result<()> {
        use std::os::unix::process::CommandExt;

        let mode = std::fs::metadata(current_exe)?.permissions();
        std::fs::set_permissions(new_exe, mode)?;
        std::fs::rename(new_exe, current_exe)?;

        tracing::info!(exe = %current_exe.display(), "relaunching updated binary");
        let err = std::process::Command::new(current_exe)
            .args(std::env::args_os().skip(1))
            .exec();
        // exec only returns on failure.
        Err(AgentError::UpdateApply(format!(
            "failed to relaunch after replacement: {err}"
        )))
    }
}

/// The running image cannot be overwritten on Windows; a batch helper waits
/// for this process to exit, performs the move and restarts the agent.
#[cfg(windows)]
pub struct HelperScriptReplacer;

#[cfg(windows)]
impl ProcessReplacer for HelperScriptReplacer {
    fn replace_and_relaunch(&self, new_exe: &Path, current_exe: &Path) -> Result<()> {
        let script = format!(
            "@echo off\r\n\
             ping 127.0.0.1 -n 3 > nul\r\n\
             move /y \"{}\" \"{}\"\r\n\
             start \"\" \"{}\"\r\n\
             del \"%~f0\"\r\n",
            new_exe.display(),
            current_exe.display(),
            current_exe.display(),
        );

        let script_path = std::env::temp_dir().join("idlegrid_update.bat");
        std::fs::write(&script_path, script)?;

        std::process::Command::new("cmd")
            .args(["/c", &script_path.to_string_lossy()])
            .spawn()
            .map_err(|e| AgentError::UpdateApply(format!("failed to start update helper: {e}")))?;

        tracing::info!("update helper scheduled, exiting for replacement");
        Ok(())
    }
}

#[cfg(not(any(unix, windows)))]
pub struct UnsupportedReplacer;

#[cfg(not(any(unix, windows)))]
impl ProcessReplacer for UnsupportedReplacer {
    fn replace_and_relaunch(&self, _new_exe: &Path, _current_exe: &Path) -> Result<()> {
        Err(AgentError::UpdateApply(
            "self-update is not supported on this platform".to_string(),
        ))
    }
}
