//! Login, registration and logout.

use std::sync::Arc;

use tracing::{info, instrument};

use kindred_protocol::auth::{LoginRequest, RegisterRequest, TokenResponse};

use crate::api::{ApiClient, ApiResult};

const LOGIN_PATH: &str = "/users/auth/login/";
const REGISTER_PATH: &str = "/users/auth/register/";

/// Issues and discards credential pairs.
///
/// Both login and register store the returned pair in the client's
/// credential store; everything else reads it from there.
#[derive(Debug, Clone)]
pub struct AuthService {
    api: Arc<ApiClient>,
}

impl AuthService {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self { api }
    }

    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> ApiResult<()> {
        let request = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let tokens: TokenResponse = self.api.post_json(LOGIN_PATH, &request).await?;
        self.api.credentials().set(tokens.into())?;
        info!("Signed in");
        Ok(())
    }

    #[instrument(skip(self, password, password_confirm))]
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        password_confirm: &str,
    ) -> ApiResult<()> {
        let request = RegisterRequest {
            email: email.to_string(),
            password: password.to_string(),
            password_confirm: password_confirm.to_string(),
        };
        let tokens: TokenResponse = self.api.post_json(REGISTER_PATH, &request).await?;
        self.api.credentials().set(tokens.into())?;
        info!("Registered and signed in");
        Ok(())
    }

    /// Forget the stored pair. Purely local; the backend keeps no session.
    pub fn logout(&self) -> ApiResult<()> {
        self.api.credentials().clear()?;
        info!("Signed out");
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.api.credentials().get().is_some()
    }
}
