//! Strava API client: OAuth token grants and paginated activity listing.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "stride-strava";

pub const DEFAULT_TOKEN_URL: &str = "https://www.strava.com/oauth/token";
pub const DEFAULT_API_BASE_URL: &str = "https://www.strava.com/api/v3";
pub const DEFAULT_PER_PAGE: u32 = 200;

/// Token endpoint response. Strava rotates refresh tokens, so callers must store both values.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    #[serde(default)]
    pub athlete: Option<AthleteSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AthleteSummary {
    pub id: i64,
}

#[derive(Debug, Error)]
pub enum StravaError {
    #[error("strava rejected credentials ({status}): {body}")]
    Auth { status: u16, body: String },
    #[error("strava api error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("still rate limited after {attempts} retries")]
    RateLimited { attempts: usize },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    Success,
    RateLimited,
    Unauthorized,
    Failed,
}

/// Listing responses are only usable on a plain 200.
pub fn classify_status(status: StatusCode) -> ResponseDisposition {
    match status {
        StatusCode::OK => ResponseDisposition::Success,
        StatusCode::TOO_MANY_REQUESTS => ResponseDisposition::RateLimited,
        StatusCode::UNAUTHORIZED => ResponseDisposition::Unauthorized,
        _ => ResponseDisposition::Failed,
    }
}

/// Pause schedule for HTTP 429 on a single page.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RateLimitPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct StravaConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub api_base_url: String,
    pub per_page: u32,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub rate_limit: RateLimitPolicy,
}

impl StravaConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            per_page: DEFAULT_PER_PAGE,
            timeout: Duration::from_secs(30),
            user_agent: None,
            rate_limit: RateLimitPolicy::default(),
        }
    }

    pub fn activities_url(&self) -> String {
        format!("{}/athlete/activities", self.api_base_url.trim_end_matches('/'))
    }
}

/// The provider operations the ingestion job depends on.
#[async_trait]
pub trait ActivityProvider: Send + Sync {
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, StravaError>;

    async fn fetch_all_activities(&self, access_token: &str)
        -> Result<Vec<JsonValue>, StravaError>;
}

#[derive(Debug, Clone)]
pub struct StravaClient {
    client: reqwest::Client,
    config: StravaConfig,
}

impl StravaClient {
    pub fn new(config: StravaConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &StravaConfig {
        &self.config
    }

    /// Exchange an authorization code from the OAuth callback for a token pair.
    pub async fn exchange_authorization_code(&self, code: &str) -> Result<TokenGrant, StravaError> {
        self.token_request("authorization_code", ("code", code)).await
    }

    async fn token_request(
        &self,
        grant_type: &str,
        grant: (&str, &str),
    ) -> Result<TokenGrant, StravaError> {
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("grant_type", grant_type),
            grant,
        ];
        let resp = self
            .client
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StravaError::Auth {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Fetch one listing page, pausing on 429 according to the rate-limit policy.
    pub async fn fetch_activities_page(
        &self,
        access_token: &str,
        page: u32,
    ) -> Result<Vec<JsonValue>, StravaError> {
        let url = self.config.activities_url();
        let policy = self.config.rate_limit;
        let mut attempt = 0usize;

        loop {
            let resp = self
                .client
                .get(&url)
                .bearer_auth(access_token)
                .query(&[("per_page", self.config.per_page), ("page", page)])
                .send()
                .await?;
            let status = resp.status();

            match classify_status(status) {
                ResponseDisposition::Success => {
                    let body = resp.bytes().await?;
                    return Ok(serde_json::from_slice(&body)?);
                }
                ResponseDisposition::RateLimited => {
                    if attempt >= policy.max_retries {
                        return Err(StravaError::RateLimited { attempts: attempt });
                    }
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        page,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited by strava; pausing before retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                ResponseDisposition::Unauthorized => {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(StravaError::Auth {
                        status: status.as_u16(),
                        body,
                    });
                }
                ResponseDisposition::Failed => {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(StravaError::Api {
                        status: status.as_u16(),
                        body,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl ActivityProvider for StravaClient {
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant, StravaError> {
        let grant = self
            .token_request("refresh_token", ("refresh_token", refresh_token))
            .await?;
        info!(expires_at = grant.expires_at, "access token refreshed");
        Ok(grant)
    }

    async fn fetch_all_activities(
        &self,
        access_token: &str,
    ) -> Result<Vec<JsonValue>, StravaError> {
        let mut activities = Vec::new();
        let mut page = 1u32;

        loop {
            let batch = self.fetch_activities_page(access_token, page).await?;
            if batch.is_empty() {
                break;
            }
            debug!(page, count = batch.len(), "fetched activity page");
            activities.extend(batch);
            page += 1;
        }

        Ok(activities)
    }
}
