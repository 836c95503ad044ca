//! Chat history fetching with bounded retry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use kindred_protocol::chat::HistoryEntry;

use crate::api::{ApiClient, ApiRequest, ApiResult};

const HISTORY_PATH: &str = "/chat/messages/";

/// Fixed-delay retry for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, including the first.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> ApiResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ApiResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    warn!(
                        "Attempt {}/{} failed, retrying in {:?}: {}",
                        attempt, max_attempts, self.delay, err
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// One read of a conversation's persisted messages, newest-first as the
/// backend returns them.
#[async_trait]
pub trait HistoryApi: Send + Sync {
    async fn fetch_page(&self, conversation_id: &str) -> ApiResult<Vec<HistoryEntry>>;
}

#[async_trait]
impl HistoryApi for ApiClient {
    async fn fetch_page(&self, conversation_id: &str) -> ApiResult<Vec<HistoryEntry>> {
        let request = ApiRequest::get(HISTORY_PATH).query("match_id", conversation_id);
        self.send(&request).await
    }
}

/// Fetches history for a conversation, oldest-first.
#[derive(Clone)]
pub struct HistoryFetcher {
    api: Arc<dyn HistoryApi>,
    policy: RetryPolicy,
}

impl HistoryFetcher {
    pub fn new(api: Arc<dyn HistoryApi>, policy: RetryPolicy) -> Self {
        Self { api, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Fetch with retry. An empty result is a success and is not retried.
    pub async fn fetch(&self, conversation_id: &str) -> ApiResult<Vec<HistoryEntry>> {
        let api = &self.api;
        let mut entries = self
            .policy
            .run(move |attempt| {
                debug!("Fetching history for {} (attempt {})", conversation_id, attempt);
                api.fetch_page(conversation_id)
            })
            .await?;
        entries.reverse();
        Ok(entries)
    }
}
