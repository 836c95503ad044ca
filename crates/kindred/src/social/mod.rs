//! Swipes and matches.

use std::sync::Arc;

use tracing::{info, instrument};

use kindred_protocol::social::{Match, SwipeAction, SwipeRequest, SwipeResponse};

use crate::api::{ApiClient, ApiResult};

const SWIPES_PATH: &str = "/social/swipes/";
const MATCHES_PATH: &str = "/social/matches/";

#[derive(Debug, Clone)]
pub struct SocialService {
    api: Arc<ApiClient>,
}

impl SocialService {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }

    /// Matches of the signed-in user. A match id is a chat conversation id.
    #[instrument(skip(self))]
    pub async fn matches(&self) -> ApiResult<Vec<Match>> {
        self.api.get_json(MATCHES_PATH).await
    }

    #[instrument(skip(self))]
    pub async fn swipe(&self, target: &str, action: SwipeAction) -> ApiResult<SwipeResponse> {
        let request = SwipeRequest {
            target: target.to_string(),
            value: action,
        };
        let response: SwipeResponse = self.api.post_json(SWIPES_PATH, &request).await?;
        if response.is_match {
            info!("It's a match with {}", target);
        }
        Ok(response)
    }
}
