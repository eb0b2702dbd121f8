use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use sha2::{Digest, Sha256};

use idlegrid::error::AgentError;
use idlegrid::fetch::ArtifactFetcher;

const BODY: &[u8] = b"pretend this is a wasm module";

fn digest_of(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn artifact_server() -> SocketAddr {
    let app = Router::new()
        .route("/artifact", get(|| async { BODY.to_vec() }))
        .route(
            "/missing",
            get(|| async { (StatusCode::NOT_FOUND, "no such artifact") }),
        );
    serve(app).await
}

#[tokio::test]
async fn verified_download_lands_byte_identical() {
    let addr = artifact_server().await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("job.wasm");

    ArtifactFetcher::new()
        .fetch_and_verify(&format!("http://{addr}/artifact"), &digest_of(BODY), &dest)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), BODY);
    // No temp file left behind.
    assert!(!dir.path().join("job.wasm.tmp").exists());
}

#[tokio::test]
async fn digest_mismatch_leaves_destination_absent() {
    let addr = artifact_server().await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("job.wasm");

    let err = ArtifactFetcher::new()
        .fetch_and_verify(
            &format!("http://{addr}/artifact"),
            &digest_of(b"something else entirely"),
            &dest,
        )
        .await
        .unwrap_err();

    match err {
        AgentError::ChecksumMismatch { expected, actual } => {
            assert_eq!(expected, digest_of(b"something else entirely"));
            assert_eq!(actual, digest_of(BODY));
        }
        other => panic!("expected checksum mismatch, got {other}"),
    }
    assert!(!dest.exists());
    assert!(!dir.path().join("job.wasm.tmp").exists());
}

#[tokio::test]
async fn digest_mismatch_leaves_prior_artifact_untouched() {
    let addr = artifact_server().await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("job.wasm");
    std::fs::write(&dest, b"previously verified artifact").unwrap();

    let result = ArtifactFetcher::new()
        .fetch_and_verify(&format!("http://{addr}/artifact"), "deadbeef", &dest)
        .await;

    assert!(result.is_err());
    assert_eq!(
        std::fs::read(&dest).unwrap(),
        b"previously verified artifact"
    );
}

#[tokio::test]
async fn non_success_status_is_a_download_error() {
    let addr = artifact_server().await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("job.wasm");

    let err = ArtifactFetcher::new()
        .fetch_and_verify(&format!("http://{addr}/missing"), &digest_of(BODY), &dest)
        .await
        .unwrap_err();

    match err {
        AgentError::Download { status } => assert_eq!(status, 404),
        other => panic!("expected download error, got {other}"),
    }
    assert!(!dest.exists());
}

#[tokio::test]
async fn digest_comparison_is_case_insensitive() {
    let addr = artifact_server().await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("job.wasm");

    ArtifactFetcher::new()
        .fetch_and_verify(
            &format!("http://{addr}/artifact"),
            &digest_of(BODY).to_uppercase(),
            &dest,
        )
        .await
        .unwrap();

    assert!(dest.exists());
}
