//! Integrity-verified artifact retrieval.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::error::{AgentError, Result};

/// Downloads content-addressed artifacts over HTTP(S) and verifies them
/// against a required SHA-256 digest before they become visible at their
/// destination path.
#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
    client: reqwest::Client,
}

impl Default for ArtifactFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("default reqwest client");
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Stream `url` to `dest`, verifying its SHA-256 on the way down.
    ///
    /// The body is written to a `.tmp` sibling while the digest accumulates,
    /// then renamed onto `dest` only after the digest matches. The rename is
    /// same-filesystem, so `dest` is only ever absent or a fully-written,
    /// verified artifact. On a digest mismatch the temp file is removed and
    /// any prior file at `dest` is left untouched.
    pub async fn fetch_and_verify(
        &self,
        url: &str,
        expected_sha256: &str,
        dest: &Path,
    ) -> Result<()> {
        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Download {
                status: status.as_u16(),
            });
        }

        let tmp = temp_sibling(dest);
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut hasher = Sha256::new();

        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(e.into());
                }
            };
            hasher.update(&chunk);
            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e.into());
            }
        }

        file.flush().await?;
        drop(file);

        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected_sha256) {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(AgentError::ChecksumMismatch {
                expected: expected_sha256.to_ascii_lowercase(),
                actual,
            });
        }

        tokio::fs::rename(&tmp, dest).await?;
        Ok(())
    }
}

/// `.tmp` path next to `dest`, on the same filesystem so the final rename is
/// atomic.
fn temp_sibling(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    dest.with_file_name(name)
}
