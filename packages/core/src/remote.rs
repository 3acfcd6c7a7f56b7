//! Remote segmentation service collaborators
//!
//! The segmentation service does the actual AI background removal; this
//! module holds its client plus the two gates consulted before any upload:
//! the per-day request quota and the source duration cap. Both are
//! explicit injected capabilities rather than ambient state, so the core
//! stays testable in isolation.

use crate::{BackdropError, BackdropResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

/// Free requests allowed per day.
pub const MAX_FREE_REQUESTS: u32 = 5;

/// Longest source clip accepted for upload.
pub const MAX_SOURCE_DURATION: Duration = Duration::from_secs(10);

/// Response of the background-removal endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveBackgroundResponse {
    pub video_id: String,
    /// Relative path of the composited preview asset.
    pub preview_video: String,
    /// Relative path of the alpha-bearing asset the export pipeline reads.
    pub rgba_video: String,
    pub fps: f64,
}

/// Per-day request quota, consulted before the service is contacted and
/// recorded only after a successful response.
pub trait RequestQuota: Send + Sync {
    fn check(&self) -> BackdropResult<()>;
    fn record(&self);
}

/// In-memory daily counter with a fixed limit.
pub struct DailyQuota {
    limit: u32,
    state: Mutex<(NaiveDate, u32)>,
}

impl DailyQuota {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            state: Mutex::new((chrono::Local::now().date_naive(), 0)),
        }
    }

    fn check_at(&self, today: NaiveDate) -> BackdropResult<()> {
        let mut state = self.state.lock().expect("quota lock");
        if state.0 != today {
            *state = (today, 0);
        }
        if state.1 >= self.limit {
            return Err(BackdropError::QuotaExceeded {
                used: state.1,
                limit: self.limit,
            });
        }
        Ok(())
    }

    fn record_at(&self, today: NaiveDate) {
        let mut state = self.state.lock().expect("quota lock");
        if state.0 != today {
            *state = (today, 0);
        }
        state.1 += 1;
    }
}

impl Default for DailyQuota {
    fn default() -> Self {
        Self::new(MAX_FREE_REQUESTS)
    }
}

impl RequestQuota for DailyQuota {
    fn check(&self) -> BackdropResult<()> {
        self.check_at(chrono::Local::now().date_naive())
    }

    fn record(&self) {
        self.record_at(chrono::Local::now().date_naive())
    }
}

/// Validates a source clip before it is ever handed to the service.
#[derive(Debug, Clone, Copy)]
pub struct UploadPolicy {
    pub max_duration: Duration,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_duration: MAX_SOURCE_DURATION,
        }
    }
}

impl UploadPolicy {
    pub fn validate(&self, duration: Duration) -> BackdropResult<()> {
        if duration > self.max_duration {
            return Err(BackdropError::SourceTooLong {
                actual_secs: duration.as_secs_f64(),
                max_secs: self.max_duration.as_secs(),
            });
        }
        Ok(())
    }
}

/// Client for the remote segmentation service.
pub struct SegmentationClient {
    base_url: String,
    client: reqwest::Client,
}

impl SegmentationClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Upload a source video for background removal.
    ///
    /// The quota is checked before contacting the service and recorded only
    /// on success. Non-success responses surface as a service error without
    /// retry.
    pub async fn remove_background(
        &self,
        quota: &dyn RequestQuota,
        video: Vec<u8>,
        filename: &str,
    ) -> BackdropResult<RemoveBackgroundResponse> {
        quota.check()?;

        let part = reqwest::multipart::Part::bytes(video)
            .file_name(filename.to_string())
            .mime_str("video/mp4")
            .map_err(|e| BackdropError::RemoteService(format!("invalid upload part: {}", e)))?;
        let form = reqwest::multipart::Form::new().part("video", part);

        let response = self
            .client
            .post(format!("{}/remove-background", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| BackdropError::RemoteService(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackdropError::RemoteService(format!(
                "HTTP {} {} - {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
                body
            )));
        }

        let parsed: RemoveBackgroundResponse = response
            .json()
            .await
            .map_err(|e| BackdropError::RemoteService(format!("invalid response: {}", e)))?;

        quota.record();
        tracing::info!(
            "Segmentation complete: video_id={}, {} fps",
            parsed.video_id,
            parsed.fps
        );
        Ok(parsed)
    }

    /// Absolute download URL for a path returned by the service.
    pub fn download_url(&self, path: &str) -> String {
        if path.starts_with("http") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Liveness probe; any transport or status failure reads as unhealthy.
    pub async fn health(&self) -> bool {
        match self.client.get(format!("{}/health", self.base_url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
