use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
/// Live chat read/post and video upload.
pub const SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/youtube.force-ssl",
    "https://www.googleapis.com/auth/youtube.upload",
];
/// Refresh this long before the recorded expiry.
const EXPIRY_SLACK_SECS: i64 = 60;

#[derive(Deserialize)]
struct CredentialsFile {
    installed: Option<ClientInfo>,
    web: Option<ClientInfo>,
}

#[derive(Deserialize)]
struct ClientInfo {
    client_id: String,
    client_secret: String,
    token_uri: Option<String>,
    auth_uri: Option<String>,
}

async fn read_client(credentials: &Path) -> Result<ClientInfo> {
    let creds: CredentialsFile = serde_json::from_slice(
        &tokio::fs::read(credentials)
            .await
            .with_context(|| format!("reading {}", credentials.display()))?,
    )
    .context("parsing credentials file")?;
    creds
        .installed
        .or(creds.web)
        .context("credentials file has neither `installed` nor `web` client info")
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenFile {
    access_token: Option<String>,
    refresh_token: Option<String>,
    /// Milliseconds since the epoch.
    expiry_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_type: Option<String>,
}

/// Token endpoint answer to an authorization-code exchange.
#[derive(Debug, Deserialize)]
pub struct CodeExchange {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    pub scope: Option<String>,
    pub token_type: Option<String>,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
}

struct CachedToken {
    access_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

/// OAuth2 installed-app credentials with a refresh token.
///
/// Shared by the chat transport and the YouTube publisher; the access token is
/// refreshed lazily when it is missing or about to expire.
pub struct GoogleAuth {
    client_id: String,
    client_secret: String,
    token_uri: String,
    refresh_token: String,
    cached: Mutex<CachedToken>,
    http: reqwest::Client,
}

impl GoogleAuth {
    pub async fn from_files(credentials: &Path, token: &Path) -> Result<Self> {
        let client = read_client(credentials).await?;

        let token_file: TokenFile = serde_json::from_slice(
            &tokio::fs::read(token)
                .await
                .with_context(|| format!("reading {}", token.display()))?,
        )
        .context("parsing token file")?;
        let refresh_token = token_file
            .refresh_token
            .context("token file has no refresh_token; run `shorts_clipper auth` first")?;

        Ok(Self {
            client_id: client.client_id,
            client_secret: client.client_secret,
            token_uri: client
                .token_uri
                .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            refresh_token,
            cached: Mutex::new(CachedToken {
                access_token: token_file.access_token,
                expires_at: token_file
                    .expiry_date
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            }),
            http: reqwest::Client::new(),
        })
    }

    /// A bearer token valid for at least the next minute.
    pub async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let (Some(token), Some(expires_at)) = (&cached.access_token, cached.expires_at) {
            if Utc::now() + Duration::seconds(EXPIRY_SLACK_SECS) < expires_at {
                return Ok(token.clone());
            }
        }

        debug!("Refreshing Google access token");
        let resp = self
            .http
            .post(&self.token_uri)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("token refresh failed ({}): {}", status, body);
        }
        let refreshed: RefreshResponse = resp.json().await?;
        info!("Google access token refreshed");

        cached.expires_at = Some(Utc::now() + Duration::seconds(refreshed.expires_in));
        cached.access_token = Some(refreshed.access_token.clone());
        Ok(refreshed.access_token)
    }
}

/// Installed-app consent: sends the user to Google, trades the returned code
/// for tokens and stores them where [`GoogleAuth::from_files`] expects them.
pub struct ConsentFlow {
    client_id: String,
    client_secret: String,
    auth_uri: String,
    token_uri: String,
    redirect_uri: String,
    http: reqwest::Client,
}

impl ConsentFlow {
    pub async fn from_credentials(credentials: &Path, redirect_uri: &str) -> Result<Self> {
        let client = read_client(credentials).await?;
        Ok(Self {
            client_id: client.client_id,
            client_secret: client.client_secret,
            auth_uri: client.auth_uri.unwrap_or_else(|| DEFAULT_AUTH_URI.to_string()),
            token_uri: client
                .token_uri
                .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            redirect_uri: redirect_uri.to_string(),
            http: reqwest::Client::new(),
        })
    }

    /// Consent page URL asking for offline access to [`SCOPES`].
    pub fn authorize_url(&self) -> Result<String> {
        let scope = SCOPES.join(" ");
        let url = reqwest::Url::parse_with_params(
            &self.auth_uri,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
        .with_context(|| format!("bad auth_uri {}", self.auth_uri))?;
        Ok(url.into())
    }

    pub async fn exchange_code(&self, code: &str) -> Result<CodeExchange> {
        let resp = self
            .http
            .post(&self.token_uri)
            .form(&[
                ("code", code),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("code exchange failed ({}): {}", status, body);
        }
        Ok(resp.json().await?)
    }
}

/// Writes an exchanged token in the `token.json` layout.
pub async fn write_token(path: &Path, exchange: &CodeExchange, now: DateTime<Utc>) -> Result<()> {
    if exchange.refresh_token.is_none() {
        bail!("Google returned no refresh_token; revoke the app's access and authorize again");
    }
    let file = TokenFile {
        access_token: Some(exchange.access_token.clone()),
        refresh_token: exchange.refresh_token.clone(),
        expiry_date: Some((now + Duration::seconds(exchange.expires_in)).timestamp_millis()),
        scope: exchange.scope.clone(),
        token_type: exchange.token_type.clone(),
    };
    tokio::fs::write(path, serde_json::to_vec_pretty(&file)?)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!("Saved Google token to {}", path.display());
    Ok(())
}
