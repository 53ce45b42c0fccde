use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tabpilot_core::{AuthConfig, Result, ServiceError, ServiceResult};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct AccessToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn expires_within(&self, window: Duration) -> bool {
        self.expires_at - Utc::now() < window
    }
}

/// OAuth/OIDC capability supplied by the host. Token handling itself lives there.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Interactive sign in, run once when a session is created.
    async fn login(&self, config: &AuthConfig) -> Result<AccessToken>;

    async fn current_token(&self, config: &AuthConfig) -> Result<Option<AccessToken>>;

    /// Silent renewal.
    async fn refresh(&self, config: &AuthConfig) -> Result<AccessToken>;
}

/// Bearer source for one agent's auth config.
#[derive(Clone)]
pub struct Authenticator {
    provider: Arc<dyn TokenProvider>,
    config: AuthConfig,
    refresh_threshold: Duration,
}

impl Authenticator {
    pub fn new(provider: Arc<dyn TokenProvider>, config: AuthConfig, refresh_threshold_secs: i64) -> Self {
        Self {
            provider,
            config,
            refresh_threshold: Duration::seconds(refresh_threshold_secs),
        }
    }

    pub async fn login(&self) -> ServiceResult<()> {
        self.provider
            .login(&self.config)
            .await
            .map(|_| ())
            .map_err(|e| auth_failure("login", e))
    }

    /// Current access token, refreshed first when it is about to expire.
    pub async fn bearer(&self) -> ServiceResult<String> {
        let current = self
            .provider
            .current_token(&self.config)
            .await
            .map_err(|e| auth_failure("current_token", e))?;
        let token = match current {
            Some(token) if token.expires_within(self.refresh_threshold) => {
                debug!(authority = %self.config.url, "Access token close to expiry, refreshing");
                self.provider
                    .refresh(&self.config)
                    .await
                    .map_err(|e| auth_failure("refresh", e))?
            }
            Some(token) => token,
            None => self
                .provider
                .login(&self.config)
                .await
                .map_err(|e| auth_failure("login", e))?,
        };
        Ok(token.value)
    }
}

fn auth_failure(stage: &str, e: tabpilot_core::Error) -> ServiceError {
    warn!(stage = %stage, error = %e, "Token provider failed");
    ServiceError::without_detail()
}

/// Fixed bearer token, for agents reached from the command line.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
        }
    }

    fn issue(&self) -> AccessToken {
        AccessToken {
            value: self.token.clone(),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn login(&self, _config: &AuthConfig) -> Result<AccessToken> {
        Ok(self.issue())
    }

    async fn current_token(&self, _config: &AuthConfig) -> Result<Option<AccessToken>> {
        Ok(Some(self.issue()))
    }

    async fn refresh(&self, _config: &AuthConfig) -> Result<AccessToken> {
        Ok(self.issue())
    }
}
