use std::time::Duration;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::Deserialize;

use crate::error::{AgentError, Result};

/// One downloadable artifact attached to a release.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
    /// Digest of the asset. Required before an update is applied.
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub size: u64,
}

/// A published release as served by the update feed. Read-only.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseDescriptor {
    #[serde(rename = "tag_name")]
    pub tag: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
    #[serde(rename = "published_at", default)]
    pub published_at: Option<DateTime<Utc>>,
}

/// Asset name expected for this host, `<app>-<os>-<arch>[.exe]`.
pub fn platform_asset_name() -> String {
    let mut name = format!(
        "idlegrid-{}-{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    if cfg!(windows) {
        name.push_str(".exe");
    }
    name
}

/// True when `candidate` is a strictly newer semantic version than `current`.
///
/// Tags may carry a `v` prefix. A tag that does not parse as a semantic
/// version is never considered newer, so a feed with a foreign tagging scheme
/// degrades to "no update" instead of mis-applying one.
pub fn is_newer(current: &str, candidate: &str) -> bool {
    let parse = |s: &str| Version::parse(s.trim().trim_start_matches('v')).ok();
    match (parse(current), parse(candidate)) {
        (Some(current), Some(candidate)) => candidate > current,
        _ => false,
    }
}

/// Polls the release feed and decides whether a newer build exists.
pub struct VersionChecker {
    current_version: String,
    feed_url: String,
    http: reqwest::Client,
}

impl VersionChecker {
    pub fn new(current_version: impl Into<String>, feed_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("default reqwest client");
        Self {
            current_version: current_version.into(),
            feed_url: feed_url.into(),
            http,
        }
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// Fetch the latest release; `Some` when it is newer than the running
    /// version.
    pub async fn check_for_update(&self) -> Result<Option<ReleaseDescriptor>> {
        let response = self
            .http
            .get(&self.feed_url)
            // The GitHub API rejects requests without a user agent.
            .header(reqwest::header::USER_AGENT, "IdleGrid-Agent-Updater")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Api {
                path: self.feed_url.clone(),
                status: status.as_u16(),
                body: String::new(),
            });
        }

        let release: ReleaseDescriptor = response.json().await?;
        if is_newer(&self.current_version, &release.tag) {
            tracing::info!(
                current = %self.current_version,
                latest = %release.tag,
                "update available"
            );
            Ok(Some(release))
        } else {
            tracing::debug!(
                current = %self.current_version,
                latest = %release.tag,
                "running latest version"
            );
            Ok(None)
        }
    }

    /// The asset matching this host, if the release carries one.
    pub fn select_asset<'a>(&self, release: &'a ReleaseDescriptor) -> Option<&'a ReleaseAsset> {
        let wanted = platform_asset_name();
        release.assets.iter().find(|asset| asset.name == wanted)
    }
}
