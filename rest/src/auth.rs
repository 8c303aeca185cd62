use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use log::{debug, info};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex, OnceCell};

// Refresh a little before the server-side expiry
const EXPIRY_MARGIN: Duration = Duration::seconds(30);
// Not reported by the token endpoint; the broker documents seven days
const REFRESH_TOKEN_LIFETIME: Duration = Duration::days(7);

/// Authentication or session failures. These are fatal: callers must not retry them
/// the way they retry transient network failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token store {0} not found; run `schwab-cli authorize` to create one")]
    MissingTokenStore(PathBuf),
    #[error("token store {path} is unreadable: {reason}")]
    InvalidTokenStore { path: PathBuf, reason: String },
    #[error("failed to refresh the access token (HTTP {status}); the refresh token may have expired, run `schwab-cli authorize`: {body}")]
    RefreshRejected { status: u16, body: String },
    #[error("the authorization code was rejected (HTTP {status}); codes are only valid for about 30 seconds: {body}")]
    CodeRejected { status: u16, body: String },
    #[error("the broker rejected the session credentials (HTTP {status})")]
    Unauthorized { status: u16 },
}

/// The on-disk token store. Unknown fields are carried through untouched.
///
/// A freshly authorized store may hold only the refresh token, in which case the first
/// request fetches an access token.
#[derive(Serialize, Deserialize, Clone, Debug)]
struct TokenStore {
    #[serde(default)]
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    expires_in: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiration_origin_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token_expected_expiration_time: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl TokenStore {
    /// Builds a store from the response to an authorization-code grant.
    fn issued(token: RefreshedToken, now: OffsetDateTime) -> Option<Self> {
        let mut extra = token.extra;
        if let Ok(issued_at) = now.format(&Rfc3339) {
            extra.insert("refresh_token_issue_time".to_owned(), Value::String(issued_at));
        }

        Some(Self {
            access_token: token.access_token,
            refresh_token: token.refresh_token?,
            token_type: token.token_type,
            expires_in: token.expires_in,
            expiration_origin_time: now.format(&Rfc3339).ok(),
            refresh_token_expected_expiration_time: (now + REFRESH_TOKEN_LIFETIME)
                .format(&Rfc3339)
                .ok(),
            extra,
        })
    }

    fn is_access_token_expired(&self, now: OffsetDateTime) -> bool {
        if self.access_token.is_empty() {
            return true;
        }

        let origin = match self
            .expiration_origin_time
            .as_deref()
            .and_then(|origin| OffsetDateTime::parse(origin, &Rfc3339).ok())
        {
            Some(origin) => origin,
            // Unknown origin, so assume the token is stale
            None => return true,
        };

        now > origin + Duration::seconds(self.expires_in) - EXPIRY_MARGIN
    }

    fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }

    fn merge(&mut self, refreshed: RefreshedToken, now: OffsetDateTime) {
        self.access_token = refreshed.access_token;
        self.token_type = refreshed.token_type;
        self.expires_in = refreshed.expires_in;
        if let Some(refresh_token) = refreshed.refresh_token {
            self.refresh_token = refresh_token;
        }
        self.extra.extend(refreshed.extra);
        self.expiration_origin_time = now.format(&Rfc3339).ok();
    }
}

#[derive(Deserialize)]
struct RefreshedToken {
    access_token: String,
    token_type: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Credentials and per-account state for one broker login.
///
/// The account hash is resolved at most once per session and then shared by every
/// request that needs it.
pub struct Session {
    store_path: PathBuf,
    tokens: Mutex<TokenStore>,
    refresh_token_expiration: Option<String>,
    pub(crate) account_hash: OnceCell<String>,
}

impl Session {
    pub fn load(store_path: &Path) -> Result<Self, AuthError> {
        let contents = match fs::read_to_string(store_path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(AuthError::MissingTokenStore(store_path.to_owned()))
            }
            Err(error) => {
                return Err(AuthError::InvalidTokenStore {
                    path: store_path.to_owned(),
                    reason: error.to_string(),
                })
            }
        };

        let tokens = serde_json::from_str::<TokenStore>(&contents).map_err(|error| {
            AuthError::InvalidTokenStore {
                path: store_path.to_owned(),
                reason: error.to_string(),
            }
        })?;

        Ok(Self::from_store(store_path, tokens))
    }

    /// Trades the code from a browser login for a new token pair and writes a new store
    /// at `store_path`, replacing any old one.
    pub async fn from_authorization_code(
        store_path: &Path,
        client: &Client,
        token_url: &str,
        app_key: &str,
        app_secret: &str,
        callback_url: &str,
        code: &str,
    ) -> anyhow::Result<Self> {
        let response = client
            .post(token_url)
            .basic_auth(app_key, Some(app_secret))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", callback_url),
            ])
            .send()
            .await
            .context("Failed to reach the token endpoint")?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AuthError::CodeRejected {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let issued = serde_json::from_str::<RefreshedToken>(&body)
            .context("Failed to parse the token response")?;
        let tokens = TokenStore::issued(issued, OffsetDateTime::now_utc())
            .ok_or_else(|| anyhow!("The token response carried no refresh token"))?;

        write_store(store_path, &tokens)?;
        info!("Saved new tokens to {}", store_path.display());

        Ok(Self::from_store(store_path, tokens))
    }

    fn from_store(store_path: &Path, tokens: TokenStore) -> Self {
        Self {
            store_path: store_path.to_owned(),
            refresh_token_expiration: tokens.refresh_token_expected_expiration_time.clone(),
            tokens: Mutex::new(tokens),
            account_hash: OnceCell::new(),
        }
    }

    pub fn refresh_token_expiration(&self) -> Option<&str> {
        self.refresh_token_expiration.as_deref()
    }

    /// Returns the value for the `Authorization` header, refreshing the access token first
    /// if it is about to expire.
    pub(crate) async fn authorization(
        &self,
        client: &Client,
        token_url: &str,
        app_key: &str,
        app_secret: &str,
    ) -> anyhow::Result<String> {
        let mut tokens = self.tokens.lock().await;
        let now = OffsetDateTime::now_utc();

        if tokens.is_access_token_expired(now) {
            info!("Refreshing access token");

            let response = client
                .post(token_url)
                .basic_auth(app_key, Some(app_secret))
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", tokens.refresh_token.as_str()),
                ])
                .send()
                .await
                .context("Failed to reach the token endpoint")?;

            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(AuthError::RefreshRejected {
                    status: status.as_u16(),
                    body,
                }
                .into());
            }

            let refreshed = serde_json::from_str::<RefreshedToken>(&body)
                .context("Failed to parse refreshed token")?;
            tokens.merge(refreshed, now);

            write_store(&self.store_path, &tokens)?;
            debug!("Access token refreshed and saved");
        }

        Ok(tokens.authorization())
    }
}

fn write_store(store_path: &Path, tokens: &TokenStore) -> anyhow::Result<()> {
    let serialized = serde_json::to_string_pretty(tokens)?;
    fs::write(store_path, serialized)
        .with_context(|| format!("Failed to save tokens to {}", store_path.display()))
}

/// The page where the user logs in and grants the app access.
pub fn authorize_url(
    oauth_api_root: &str,
    app_key: &str,
    callback_url: &str,
) -> anyhow::Result<Url> {
    Url::parse_with_params(
        &format!("{oauth_api_root}/oauth/authorize"),
        &[
            ("client_id", app_key),
            ("response_type", "code"),
            ("redirect_uri", callback_url),
        ],
    )
    .context("Invalid OAuth API root")
}

/// Pulls the decoded `code` parameter out of the URL the browser was sent back to.
pub fn authorization_code(redirected_url: &str) -> Option<String> {
    Url::parse(redirected_url.trim())
        .ok()?
        .query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, code)| code.into_owned())
        .filter(|code| !code.is_empty())
}
