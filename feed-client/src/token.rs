//! Auth token lifecycle.
//!
//! A token is either a fixed string or produced by a [`TokenProvider`].
//! Provider loads are retried a bounded number of times and shared: any
//! number of concurrent callers await the same in-flight load, so the
//! provider is never invoked twice at once.

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::TokenConfig;

/// Error type returned by token providers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Token errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    /// No token or provider was set.
    #[error("no token or token provider set")]
    MissingToken,

    /// The provider failed on every attempt.
    #[error("failed to load token after {attempts} attempts: {cause}")]
    ProviderExhausted {
        /// Provider invocations made.
        attempts: u32,
        /// Error from the last invocation.
        cause: String,
    },
}

/// Produces fresh auth tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Fetch a new token.
    async fn fetch_token(&self) -> Result<String, BoxError>;
}

#[async_trait]
impl<F, Fut> TokenProvider for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, BoxError>> + Send,
{
    async fn fetch_token(&self) -> Result<String, BoxError> {
        (self)().await
    }
}

/// Where tokens come from.
#[derive(Clone)]
pub enum TokenSource {
    /// A fixed token that is never reloaded.
    Static(String),
    /// A provider invoked on first use and after expiry.
    Provider(Arc<dyn TokenProvider>),
}

impl TokenSource {
    /// Wrap a provider.
    pub fn provider<P: TokenProvider + 'static>(provider: P) -> Self {
        Self::Provider(Arc::new(provider))
    }
}

impl std::fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(_) => f.write_str("TokenSource::Static([REDACTED])"),
            Self::Provider(_) => f.write_str("TokenSource::Provider"),
        }
    }
}

type SharedLoad = Shared<BoxFuture<'static, Result<String, TokenError>>>;

#[derive(Default)]
struct TokenState {
    source: Option<TokenSource>,
    token: Option<String>,
    generation: u64,
    loading: Option<(u64, SharedLoad)>,
}

/// Holds the current token and coordinates reloads.
pub struct TokenManager {
    max_attempts: u32,
    retry_delay: Duration,
    state: Mutex<TokenState>,
}

impl TokenManager {
    /// Create a manager with no token set.
    pub fn new(config: &TokenConfig) -> Self {
        Self {
            max_attempts: config.max_load_attempts.max(1),
            retry_delay: config.retry_delay(),
            state: Mutex::new(TokenState::default()),
        }
    }

    /// Set the token source for a new user session.
    ///
    /// Drops any cached token; an in-flight load from the previous source
    /// still completes for its callers but is not cached.
    pub fn set_source(&self, source: TokenSource) {
        let mut state = self.state.lock();
        state.token = match &source {
            TokenSource::Static(token) => Some(token.clone()),
            TokenSource::Provider(_) => None,
        };
        state.source = Some(source);
        state.loading = None;
        state.generation += 1;
    }

    /// Forget the source and any cached token.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.source = None;
        state.token = None;
        state.loading = None;
        state.generation += 1;
    }

    /// Whether the token is a fixed string.
    pub fn is_static(&self) -> bool {
        matches!(self.state.lock().source, Some(TokenSource::Static(_)))
    }

    /// Whether the token can be reloaded after expiry.
    pub fn is_refreshable(&self) -> bool {
        matches!(self.state.lock().source, Some(TokenSource::Provider(_)))
    }

    /// Drop the cached provider token so the next [`get_token`] reloads it.
    ///
    /// [`get_token`]: TokenManager::get_token
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        if matches!(state.source, Some(TokenSource::Provider(_))) {
            state.token = None;
        }
    }

    /// The cached token, loading it first if needed.
    pub async fn get_token(&self) -> Result<String, TokenError> {
        let cached = self.state.lock().token.clone();
        if let Some(token) = cached {
            return Ok(token);
        }
        self.load_token().await
    }

    /// Load a token from the source, joining any load already in flight.
    pub async fn load_token(&self) -> Result<String, TokenError> {
        let (generation, load) = {
            let mut state = self.state.lock();
            let provider = match &state.source {
                None => return Err(TokenError::MissingToken),
                Some(TokenSource::Static(token)) => return Ok(token.clone()),
                Some(TokenSource::Provider(provider)) => Arc::clone(provider),
            };
            match &state.loading {
                Some((generation, load)) => (*generation, load.clone()),
                None => {
                    let load = fetch_with_retry(provider, self.max_attempts, self.retry_delay)
                        .boxed()
                        .shared();
                    let generation = state.generation;
                    state.loading = Some((generation, load.clone()));
                    (generation, load)
                }
            }
        };

        let result = load.await;

        let mut state = self.state.lock();
        if state.generation == generation {
            if matches!(&state.loading, Some((g, _)) if *g == generation) {
                state.loading = None;
            }
            if let Ok(token) = &result {
                state.token = Some(token.clone());
            }
        }
        result
    }
}

async fn fetch_with_retry(
    provider: Arc<dyn TokenProvider>,
    max_attempts: u32,
    retry_delay: Duration,
) -> Result<String, TokenError> {
    let mut cause = String::new();
    for attempt in 1..=max_attempts {
        match provider.fetch_token().await {
            Ok(token) => {
                tracing::debug!("token loaded on attempt {}", attempt);
                return Ok(token);
            }
            Err(e) => {
                tracing::warn!("token provider failed (attempt {}/{}): {}", attempt, max_attempts, e);
                cause = e.to_string();
                if attempt < max_attempts {
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }
    Err(TokenError::ProviderExhausted {
        attempts: max_attempts,
        cause,
    })
}
