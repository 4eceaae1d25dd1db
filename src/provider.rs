use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ProviderFailure;

/// Tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30);
const DEFAULT_TOKEN_LIFETIME: u64 = 3600;

#[derive(Clone, Deserialize, Default, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderAuth {
    #[default]
    None,
    ApiKey {
        header: String,
        value: String,
    },
    #[serde(rename = "oauth2")]
    OAuth2 {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scopes: Vec<String>,
    },
}

// Credentials stay out of logs.
impl fmt::Debug for ProviderAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderAuth::None => f.write_str("None"),
            ProviderAuth::ApiKey { header, .. } => f.debug_struct("ApiKey").field("header", header).finish(),
            ProviderAuth::OAuth2 {
                token_url, client_id, ..
            } => f
                .debug_struct("OAuth2")
                .field("token_url", token_url)
                .field("client_id", client_id)
                .finish(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    pub key: String,
    pub url: String,
    #[serde(default)]
    pub schema_id: Option<String>,
    /// Overrides the executor's default per-call timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub auth: ProviderAuth,
}

impl ProviderConfig {
    pub fn new(key: impl Into<String>, url: impl Into<String>) -> Self {
        ProviderConfig {
            key: key.into(),
            url: url.into(),
            schema_id: None,
            timeout_ms: None,
            auth: ProviderAuth::None,
        }
    }

    pub fn with_auth(mut self, auth: ProviderAuth) -> Self {
        self.auth = auth;
        self
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

/// OAuth2 client-credentials token, fetched lazily and reused until shortly
/// before it expires.
#[derive(Default)]
pub struct TokenCache {
    token: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub async fn access_token(
        &self,
        client: &reqwest::Client,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        scopes: &[String],
    ) -> Result<String, ProviderFailure> {
        // Held across the fetch so concurrent callers share one refresh.
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref().filter(|t| Instant::now() < t.refresh_at) {
            return Ok(cached.access_token.clone());
        }

        let mut form = vec![("grant_type", "client_credentials".to_string())];
        if !scopes.is_empty() {
            form.push(("scope", scopes.join(" ")));
        }
        let response = client
            .post(token_url)
            .basic_auth(client_id, Some(client_secret))
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderFailure::Auth(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProviderFailure::Auth(format!(
                "token endpoint returned status {}",
                response.status()
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderFailure::Auth(e.to_string()))?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME));
        debug!(token_url = %token_url, lifetime_s = lifetime.as_secs(), "Fetched provider access token");
        *guard = Some(CachedToken {
            access_token: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        });
        Ok(token.access_token)
    }
}

pub struct Provider {
    pub config: ProviderConfig,
    token: TokenCache,
}

impl Provider {
    pub fn new(config: ProviderConfig) -> Self {
        Provider {
            config,
            token: TokenCache::default(),
        }
    }

    /// Adds whatever credentials the provider's auth mode needs.
    pub async fn authorize(
        &self,
        client: &reqwest::Client,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, ProviderFailure> {
        match &self.config.auth {
            ProviderAuth::None => Ok(request),
            ProviderAuth::ApiKey { header, value } => Ok(request.header(header.as_str(), value.as_str())),
            ProviderAuth::OAuth2 {
                token_url,
                client_id,
                client_secret,
                scopes,
            } => {
                let token = self
                    .token
                    .access_token(client, token_url, client_id, client_secret, scopes)
                    .await?;
                Ok(request.bearer_auth(token))
            }
        }
    }
}

/// Providers by key.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Provider>,
}

impl ProviderRegistry {
    pub fn new(configs: Vec<ProviderConfig>) -> Self {
        let providers = configs
            .into_iter()
            .map(|config| (config.key.clone(), Provider::new(config)))
            .collect();
        ProviderRegistry { providers }
    }

    pub fn get(&self, key: &str) -> Option<&Provider> {
        self.providers.get(key)
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        keys.sort();
        keys
    }
}
