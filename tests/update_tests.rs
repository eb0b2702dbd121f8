use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::routing::get;
use axum::Router;
use sha2::{Digest, Sha256};

use idlegrid::error::{AgentError, Result};
use idlegrid::fetch::ArtifactFetcher;
use idlegrid::update::{
    platform_asset_name, ProcessReplacer, ReleaseAsset, ReleaseDescriptor, UpdateManager,
    UpdateState, VersionChecker,
};

const OLD_BINARY: &[u8] = b"old agent binary v1";
const NEW_BINARY: &[u8] = b"new agent binary v2";

/// Swap strategy that performs the rename but skips the re-exec, standing in
/// for the platform replacer in tests.
struct RenameOnlyReplacer;

impl ProcessReplacer for RenameOnlyReplacer {
    fn replace_and_relaunch(&self, new_exe: &Path, current_exe: &Path) -> Result<()> {
        std::fs::rename(new_exe, current_exe)?;
        Ok(())
    }
}

struct FailingReplacer;

impl ProcessReplacer for FailingReplacer {
    fn replace_and_relaunch(&self, _new_exe: &Path, _current_exe: &Path) -> Result<()> {
        Err(AgentError::UpdateApply("simulated swap failure".to_string()))
    }
}

/// Fails the swap after destroying the backup, forcing rollback to fail too.
struct BackupEatingReplacer {
    backup: PathBuf,
}

impl ProcessReplacer for BackupEatingReplacer {
    fn replace_and_relaunch(&self, _new_exe: &Path, _current_exe: &Path) -> Result<()> {
        let _ = std::fs::remove_file(&self.backup);
        Err(AgentError::UpdateApply("simulated swap failure".to_string()))
    }
}

async fn serve_binary(bytes: &'static [u8]) -> SocketAddr {
    let app = Router::new().route("/release/asset", get(move || async move { bytes.to_vec() }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn release_for(addr: SocketAddr, sha256: String) -> ReleaseDescriptor {
    ReleaseDescriptor {
        tag: "v99.0.0".to_string(),
        name: String::new(),
        assets: vec![ReleaseAsset {
            name: platform_asset_name(),
            download_url: format!("http://{addr}/release/asset"),
            sha256,
            size: NEW_BINARY.len() as u64,
        }],
        published_at: None,
    }
}

enum Swap {
    Rename,
    Fail,
    FailAndEatBackup,
}

struct Fixture {
    manager: UpdateManager,
    exe_path: PathBuf,
    _dir: tempfile::TempDir,
}

fn fixture(swap: Swap) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let exe_path = dir.path().join("idlegrid");
    std::fs::write(&exe_path, OLD_BINARY).unwrap();

    let replacer: Box<dyn ProcessReplacer> = match swap {
        Swap::Rename => Box::new(RenameOnlyReplacer),
        Swap::Fail => Box::new(FailingReplacer),
        Swap::FailAndEatBackup => Box::new(BackupEatingReplacer {
            backup: dir.path().join("idlegrid.backup"),
        }),
    };

    let manager = UpdateManager::with_parts(
        VersionChecker::new("1.0.0", "http://unused.invalid"),
        ArtifactFetcher::new(),
        replacer,
        exe_path.clone(),
        dir.path().join("staging"),
    );

    Fixture {
        manager,
        exe_path,
        _dir: dir,
    }
}

#[tokio::test]
async fn successful_apply_replaces_executable() {
    let addr = serve_binary(NEW_BINARY).await;
    let release = release_for(addr, hex::encode(Sha256::digest(NEW_BINARY)));
    let fx = fixture(Swap::Rename);

    fx.manager.apply_update(&release).await.unwrap();

    assert_eq!(std::fs::read(&fx.exe_path).unwrap(), NEW_BINARY);
    assert_eq!(fx.manager.state(), UpdateState::Relaunched);
    // The backup of the previous binary remains until the next startup sweep.
    assert_eq!(
        std::fs::read(fx.manager.backup_path()).unwrap(),
        OLD_BINARY
    );
}

#[tokio::test]
async fn failed_swap_rolls_back_to_byte_identical_binary() {
    let addr = serve_binary(NEW_BINARY).await;
    let release = release_for(addr, hex::encode(Sha256::digest(NEW_BINARY)));
    let fx = fixture(Swap::Fail);

    let err = fx.manager.apply_update(&release).await.unwrap_err();

    assert!(matches!(err, AgentError::UpdateApply(_)));
    assert_eq!(fx.manager.state(), UpdateState::RolledBack);
    assert_eq!(std::fs::read(&fx.exe_path).unwrap(), OLD_BINARY);
    assert!(
        !fx.manager.backup_path().exists(),
        "rollback consumes the backup"
    );
}

#[tokio::test]
async fn rollback_failure_is_fatal_and_visible() {
    let addr = serve_binary(NEW_BINARY).await;
    let release = release_for(addr, hex::encode(Sha256::digest(NEW_BINARY)));
    let fx = fixture(Swap::FailAndEatBackup);

    let err = fx.manager.apply_update(&release).await.unwrap_err();

    assert!(matches!(err, AgentError::RollbackFailure(_)));
    assert_eq!(fx.manager.state(), UpdateState::FatalRollbackFailure);
}

#[tokio::test]
async fn corrupt_download_abandons_update_without_touching_executable() {
    let addr = serve_binary(NEW_BINARY).await;
    // Digest of different content: the stream verification must fail.
    let release = release_for(addr, hex::encode(Sha256::digest(b"not what is served")));
    let fx = fixture(Swap::Rename);

    let err = fx.manager.apply_update(&release).await.unwrap_err();

    assert!(matches!(err, AgentError::UpdateVerification(_)));
    assert_eq!(std::fs::read(&fx.exe_path).unwrap(), OLD_BINARY);
    assert!(!fx.manager.backup_path().exists());
    assert_eq!(fx.manager.state(), UpdateState::Idle);
}

#[tokio::test]
async fn asset_without_digest_is_rejected() {
    let addr = serve_binary(NEW_BINARY).await;
    let release = release_for(addr, String::new());
    let fx = fixture(Swap::Rename);

    let err = fx.manager.apply_update(&release).await.unwrap_err();

    assert!(matches!(err, AgentError::UpdateVerification(_)));
    assert_eq!(std::fs::read(&fx.exe_path).unwrap(), OLD_BINARY);
}

#[tokio::test]
async fn release_without_platform_asset_is_non_fatal() {
    let release = ReleaseDescriptor {
        tag: "v99.0.0".to_string(),
        name: String::new(),
        assets: Vec::new(),
        published_at: None,
    };
    let fx = fixture(Swap::Rename);

    let err = fx.manager.apply_update(&release).await.unwrap_err();

    assert!(matches!(err, AgentError::NoApplicableRelease { .. }));
    assert_eq!(std::fs::read(&fx.exe_path).unwrap(), OLD_BINARY);
}

#[tokio::test]
async fn check_for_update_consults_feed() {
    let release_json = serde_json::json!({
        "tag_name": "v99.0.0",
        "assets": [{
            "name": platform_asset_name(),
            "browser_download_url": "http://unused.invalid/asset",
            "sha256": "ff",
        }],
    });
    let app = Router::new().route(
        "/releases/latest",
        get(move || {
            let body = release_json.clone();
            async move { axum::Json(body) }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let checker = VersionChecker::new("1.0.0", format!("http://{addr}/releases/latest"));
    let release = checker.check_for_update().await.unwrap().unwrap();
    assert_eq!(release.tag, "v99.0.0");

    let checker = VersionChecker::new("99.0.0", format!("http://{addr}/releases/latest"));
    assert!(checker.check_for_update().await.unwrap().is_none());
}
