use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::{CalendarNotifier, NotifyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct CalendarClientConfig {
    pub endpoint: String,
    pub bearer_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl CalendarClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            bearer_token: None,
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SyncRequest {
    recruitment_id: Uuid,
}

/// Asks the calendar service to re-sync the event of one recruitment.
#[derive(Debug)]
pub struct HttpCalendarNotifier {
    client: reqwest::Client,
    endpoint: String,
    bearer_token: Option<String>,
    backoff: BackoffPolicy,
}

impl HttpCalendarNotifier {
    pub fn new(config: CalendarClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint,
            bearer_token: config.bearer_token,
            backoff: config.backoff,
        })
    }

    fn request(&self, recruitment_id: Uuid) -> reqwest::RequestBuilder {
        let request = self
            .client
            .post(&self.endpoint)
            .json(&SyncRequest { recruitment_id });
        match &self.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl CalendarNotifier for HttpCalendarNotifier {
    async fn notify_calendar_sync(&self, recruitment_id: Uuid) -> Result<(), NotifyError> {
        let span = info_span!("calendar_sync", %recruitment_id, endpoint = %self.endpoint);

        async move {
            let mut attempt = 0;
            loop {
                match self.request(recruitment_id).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            debug!(%status, attempt, "calendar sync accepted");
                            return Ok(());
                        }
                        if classify_status(status) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(NotifyError::HttpStatus {
                            status: status.as_u16(),
                            recruitment_id,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(NotifyError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Used when no calendar endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCalendarNotifier;

#[async_trait]
impl CalendarNotifier for NoopCalendarNotifier {
    async fn notify_calendar_sync(&self, recruitment_id: Uuid) -> Result<(), NotifyError> {
        debug!(%recruitment_id, "calendar sync disabled; skipping notification");
        Ok(())
    }
}
