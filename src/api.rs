//! HTTP client for the coordinator service: registration, heartbeats, job
//! polling and result reporting.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;

use crate::config::DeviceIdentity;
use crate::error::{AgentError, Result};
use crate::job::{Job, JobReport};

#[derive(Debug, Clone)]
pub struct AgentClient {
    base: String,
    version: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    email: &'a str,
    #[serde(rename = "deviceId")]
    device_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    referral: &'a str,
    version: &'a str,
}

#[derive(Serialize)]
struct BeatBody<'a> {
    email: &'a str,
    #[serde(rename = "deviceId")]
    device_id: &'a str,
}

impl AgentClient {
    pub fn new(base: impl Into<String>, version: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("default reqwest client");
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            version: version.into(),
            http,
        }
    }

    fn user_agent(&self) -> String {
        format!(
            "IdleGrid-Agent/{} ({}/{})",
            self.version,
            std::env::consts::OS,
            std::env::consts::ARCH
        )
    }

    pub async fn register(&self, identity: &DeviceIdentity) -> Result<()> {
        let body = RegisterBody {
            email: identity.email.trim(),
            device_id: &identity.device_id,
            referral: identity.referral.trim(),
            version: &self.version,
        };
        self.post("/api/agent/register", &body).await
    }

    pub async fn beat(&self, identity: &DeviceIdentity) -> Result<()> {
        let body = BeatBody {
            email: identity.email.trim(),
            device_id: &identity.device_id,
        };
        self.post("/api/agent/beat", &body).await
    }

    /// Poll for the next job. `None` means no work is available.
    pub async fn next_job(&self, identity: &DeviceIdentity) -> Result<Option<Job>> {
        let path = "/api/agent/jobs/next";
        let response = self
            .http
            .get(format!("{}{}", self.base, path))
            .query(&[
                ("email", identity.email.as_str()),
                ("deviceId", identity.device_id.as_str()),
            ])
            .header(reqwest::header::USER_AGENT, self.user_agent())
            .send()
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let response = Self::check_status(path, response).await?;
        Ok(Some(response.json().await?))
    }

    pub async fn report(&self, report: &JobReport) -> Result<()> {
        self.post("/api/agent/jobs/report", report).await
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let response = self
            .http
            .post(format!("{}{}", self.base, path))
            .header(reqwest::header::USER_AGENT, self.user_agent())
            .json(body)
            .send()
            .await?;
        Self::check_status(path, response).await?;
        Ok(())
    }

    async fn check_status(path: &str, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let mut body = body.trim().to_string();
        body.truncate(4096);
        Err(AgentError::Api {
            path: path.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}
