//! Credentials presented when connecting to the dispatcher.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use workerhub_core::{DispatchError, DispatchResult};

/// Produces the bearer token for the next connection attempt.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self) -> DispatchResult<String>;
}

/// Always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> DispatchResult<String> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Where a [`RefreshingTokenProvider`] obtains fresh tokens, e.g. an identity service.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> DispatchResult<IssuedToken>;
}

/// When to replace a token: the later of its midpoint and two minutes before expiry.
///
/// Tokens living four minutes or less refresh at half-life, longer ones two
/// minutes ahead of expiry. At exactly four minutes both rules agree.
pub fn calculate_token_refresh_time(
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> DateTime<Utc> {
    let midpoint = issued_at + (expires_at - issued_at) / 2;
    let ahead_of_expiry = expires_at - TimeDelta::minutes(2);
    midpoint.max(ahead_of_expiry)
}

struct CachedToken {
    issued: IssuedToken,
    refresh_at: DateTime<Utc>,
}

/// Caches tokens from a [`TokenSource`] and fetches ahead of expiry.
///
/// If a refresh fails while the cached token is still valid, the cached token
/// is returned and the next call tries again.
pub struct RefreshingTokenProvider<S> {
    source: S,
    cached: Mutex<Option<CachedToken>>,
}

impl<S: TokenSource> RefreshingTokenProvider<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
        }
    }

    async fn token_at(&self, now: DateTime<Utc>) -> DispatchResult<String> {
        let mut cached = self.cached.lock().await;

        if let Some(current) = cached.as_ref() {
            if now < current.refresh_at {
                return Ok(current.issued.token.clone());
            }
        }

        match self.source.fetch().await {
            Ok(issued) => {
                if issued.expires_at <= issued.issued_at {
                    return Err(DispatchError::authentication(
                        "token source returned an already expired token",
                    ));
                }
                let refresh_at = calculate_token_refresh_time(issued.issued_at, issued.expires_at);
                debug!(expires_at = %issued.expires_at, refresh_at = %refresh_at, "token refreshed");
                let token = issued.token.clone();
                *cached = Some(CachedToken { issued, refresh_at });
                Ok(token)
            }
            Err(e) => match cached.as_ref() {
                Some(current) if now < current.issued.expires_at => {
                    warn!(error = %e, expires_at = %current.issued.expires_at, "token refresh failed, reusing current token");
                    Ok(current.issued.token.clone())
                }
                _ => Err(e),
            },
        }
    }
}

#[async_trait]
impl<S: TokenSource> TokenProvider for RefreshingTokenProvider<S> {
    async fn get_token(&self) -> DispatchResult<String> {
        self.token_at(Utc::now()).await
    }
}
