//! HTTP client for the NeuroChron API.

use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use neurochron_core::{JobStatus, NotificationStatus, PredictionResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Serialize)]
pub struct SubmitRequest {
    pub input_reference: String,
    pub chronological_age: u32,
    pub contact: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    pub id: String,
    pub status: JobStatus,
}

#[derive(Debug, Deserialize)]
pub struct JobErrorView {
    pub stage: Option<String>,
    pub category: String,
    pub message: String,
    pub retry_count: u32,
}

#[derive(Debug, Deserialize)]
pub struct JobView {
    pub id: String,
    pub status: JobStatus,
    pub message: String,
    pub subject_id: String,
    pub chronological_age: u32,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    pub result: Option<PredictionResult>,
    pub error: Option<JobErrorView>,
    pub notification: Option<NotificationStatus>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub struct ApiClient {
    base: Url,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(api_url: &str) -> Result<Self> {
        let mut base = Url::parse(api_url).with_context(|| format!("invalid API URL: {api_url}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            http: reqwest::Client::new(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    pub async fn submit(&self, request: &SubmitRequest) -> Result<SubmitResponse> {
        let response = self
            .http
            .post(self.endpoint("api/v1/jobs")?)
            .json(request)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn get_job(&self, id: &str) -> Result<JobView> {
        let response = self
            .http
            .get(self.endpoint(&format!("api/v1/jobs/{id}"))?)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn list_jobs(&self, status: Option<&str>, limit: usize) -> Result<Vec<JobView>> {
        let mut url = self.endpoint("api/v1/jobs")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(status) = status {
                query.append_pair("status", status);
            }
            query.append_pair("limit", &limit.to_string());
        }
        let response = self.http.get(url).send().await?;
        decode(response).await
    }

    pub async fn cancel(&self, id: &str) -> Result<JobView> {
        let response = self
            .http
            .post(self.endpoint(&format!("api/v1/jobs/{id}/cancel"))?)
            .send()
            .await?;
        decode(response).await
    }
}

/// Decode a successful response, or turn the API's `{"error": ...}` body
/// into an error.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .context("failed to decode API response");
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
        .unwrap_or(body);
    bail!("API error ({status}): {message}")
}
