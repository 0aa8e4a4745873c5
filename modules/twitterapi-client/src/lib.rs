pub mod error;
pub mod types;

use std::time::Duration;

pub use error::{GraphApiError, Result};
pub use types::{FollowPage, GraphUser, ListKind};

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use types::{FollowersResponse, FollowingsResponse, ProfileResponse};

const BASE_URL: &str = "https://api.twitterapi.io";

/// Page size requested from the follower/following endpoints (API maximum).
pub const DEFAULT_PAGE_SIZE: u32 = 200;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TwitterApiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    page_size: u32,
}

impl TwitterApiClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_key,
            base_url,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Fetch one page of accounts following `username`.
    pub async fn list_followers(&self, username: &str, cursor: Option<&str>) -> Result<FollowPage> {
        let resp: FollowersResponse = self.list_page(ListKind::Followers, username, cursor).await?;
        Ok(resp.into())
    }

    /// Fetch one page of accounts `username` follows.
    pub async fn list_followings(&self, username: &str, cursor: Option<&str>) -> Result<FollowPage> {
        let resp: FollowingsResponse = self.list_page(ListKind::Followings, username, cursor).await?;
        Ok(resp.into())
    }

    /// Look up a single profile. Returns `Ok(None)` when the account does not exist.
    pub async fn get_profile(&self, username: &str) -> Result<Option<GraphUser>> {
        let url = format!("{}/twitter/user/info", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .query(&[("userName", username)])
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            tracing::debug!(username, "Profile not found");
            return Ok(None);
        }
        let resp = check_status(resp).await?;
        let body: ProfileResponse = resp.json().await?;
        Ok(body.into_user())
    }

    async fn list_page<T: DeserializeOwned>(
        &self,
        kind: ListKind,
        username: &str,
        cursor: Option<&str>,
    ) -> Result<T> {
        let url = format!("{}/twitter/user/{}", self.base_url, kind.as_str());
        let page_size = self.page_size.to_string();
        let mut query = vec![("userName", username), ("pageSize", page_size.as_str())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }

        tracing::debug!(username, kind = %kind, cursor, "Requesting page");
        let resp = self
            .client
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .query(&query)
            .send()
            .await?;

        let resp = check_status(resp).await?;
        let body: T = resp.json().await?;
        Ok(body)
    }
}

/// Map non-2xx responses into typed errors. 429 carries the reset-derived wait.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .headers()
            .get("x-rate-limit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(|reset| wait_until_reset(reset, chrono::Utc::now().timestamp()));
        return Err(GraphApiError::RateLimited { retry_after });
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(GraphApiError::Api {
            status: status.as_u16(),
            message: body.chars().take(200).collect(),
        });
    }
    Ok(resp)
}

/// Seconds until an epoch reset timestamp, clamped at zero.
fn wait_until_reset(reset_epoch: i64, now_epoch: i64) -> Duration {
    Duration::from_secs(reset_epoch.saturating_sub(now_epoch).max(0) as u64)
}
