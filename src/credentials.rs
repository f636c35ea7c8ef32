//! OAuth2 credential store for the Google Drive connection.
//!
//! The authorization-code flow is split into two explicit steps so any
//! front end can drive it:
//!
//! 1. [`CredentialStore::begin_auth`] builds the consent URL (with PKCE and
//!    a `state` value) and returns an [`AuthRequest`] to hold on to.
//! 2. [`CredentialStore::complete_auth`] takes the code the user pasted
//!    back (bare, or the whole redirect URL), exchanges it at the token
//!    endpoint, and persists the resulting [`Credential`].
//!
//! After that, [`CredentialStore::access_token`] hands out a valid bearer
//! token, refreshing it first when it is within a minute of expiry.
//!
//! The token blob is JSON at `auth.token_path`, readable only by the
//! owner on Unix. A refresh token supplied through configuration
//! (`GOOGLE_REFRESH_TOKEN`) bootstraps a credential when no file exists.

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::models::Credential;

/// An authorization attempt in progress.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// Consent page the user must open.
    pub url: String,
    pub state: String,
    pub code_verifier: String,
}

struct ClientSecrets {
    client_id: String,
    client_secret: Option<String>,
}

/// Google `credentials.json`, either layout.
#[derive(Deserialize)]
struct SecretsFile {
    installed: Option<SecretsEntry>,
    web: Option<SecretsEntry>,
}

#[derive(Deserialize)]
struct SecretsEntry {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Clone, Copy)]
enum Grant {
    Exchange,
    Refresh,
}

/// Default lifetime when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

pub struct CredentialStore {
    config: AuthConfig,
    http: reqwest::Client,
    current: Mutex<Option<Credential>>,
}

impl CredentialStore {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            config: config.clone(),
            http,
            current: Mutex::new(None),
        })
    }

    /// Load a persisted credential, or bootstrap one from a configured
    /// refresh token. `Ok(None)` when neither exists.
    pub async fn load(&self) -> Result<Option<Credential>> {
        let path = &self.config.token_path;
        let loaded = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            let credential: Credential = serde_json::from_str(&raw).map_err(|e| {
                Error::Auth(format!(
                    "stored token at {} is unreadable ({}); reconnect",
                    path.display(),
                    e
                ))
            })?;
            tracing::debug!(path = %path.display(), "loaded stored credential");
            Some(credential)
        } else if let Some(refresh) = self
            .config
            .refresh_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
        {
            tracing::debug!("bootstrapping credential from configured refresh token");
            Some(Credential {
                access_token: String::new(),
                refresh_token: Some(refresh.trim().to_string()),
                expires_at: DateTime::<Utc>::default(),
                scopes: self.config.scopes.clone(),
            })
        } else {
            None
        };

        *self.current.lock().await = loaded.clone();
        Ok(loaded)
    }

    pub async fn is_connected(&self) -> bool {
        self.current.lock().await.is_some()
    }

    /// Start the authorization-code flow.
    pub fn begin_auth(&self) -> Result<AuthRequest> {
        let client = self.client_secrets()?;
        let state = uuid::Uuid::new_v4().simple().to_string();
        let code_verifier = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()));
        let scope = self.config.scopes.join(" ");

        let url = reqwest::Url::parse_with_params(
            &self.config.auth_uri,
            &[
                ("client_id", client.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("state", state.as_str()),
                ("code_challenge", challenge.as_str()),
                ("code_challenge_method", "S256"),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("include_granted_scopes", "true"),
            ],
        )
        .map_err(|e| Error::Config(format!("invalid auth.auth_uri: {}", e)))?;

        Ok(AuthRequest {
            url: url.to_string(),
            state,
            code_verifier,
        })
    }

    /// Exchange the user-supplied code for a credential and persist it.
    pub async fn complete_auth(&self, request: &AuthRequest, input: &str) -> Result<Credential> {
        let code = parse_authorization_code(input, &request.state)?;
        let client = self.client_secrets()?;

        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code),
            ("client_id", client.client_id),
            ("redirect_uri", self.config.redirect_uri.clone()),
            ("code_verifier", request.code_verifier.clone()),
        ];
        if let Some(secret) = client.client_secret {
            form.push(("client_secret", secret));
        }

        let token = self.token_request(&form, Grant::Exchange).await?;
        let credential = self.credential_from(token, None);
        self.persist(&credential)?;
        *self.current.lock().await = Some(credential.clone());
        tracing::info!("connected storage account");
        Ok(credential)
    }

    /// A valid access token, refreshed first if it is about to expire.
    pub async fn access_token(&self) -> Result<String> {
        let mut current = self.current.lock().await;
        let credential = current
            .as_ref()
            .ok_or_else(|| Error::Auth("not connected; run `imos connect` first".to_string()))?;

        if !credential.is_expired() {
            return Ok(credential.access_token.clone());
        }
        if !credential.can_refresh() {
            return Err(Error::Auth(
                "access token expired and no refresh token is available; reconnect".to_string(),
            ));
        }

        let refreshed = self.refresh(credential).await?;
        self.persist(&refreshed)?;
        let token = refreshed.access_token.clone();
        *current = Some(refreshed);
        Ok(token)
    }

    /// Forget the credential and delete the token file. No-op if absent.
    pub async fn disconnect(&self) -> Result<()> {
        *self.current.lock().await = None;
        match std::fs::remove_file(&self.config.token_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn refresh(&self, credential: &Credential) -> Result<Credential> {
        let client = self.client_secrets()?;
        let refresh_token = credential.refresh_token.clone().unwrap_or_default();
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
            ("client_id", client.client_id),
        ];
        if let Some(secret) = client.client_secret {
            form.push(("client_secret", secret));
        }

        tracing::debug!("refreshing access token");
        let token = self.token_request(&form, Grant::Refresh).await?;
        Ok(self.credential_from(token, Some(credential)))
    }

    fn credential_from(&self, token: TokenResponse, previous: Option<&Credential>) -> Credential {
        let expires_in = token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let scopes = match token.scope {
            Some(scope) => scope.split_whitespace().map(str::to_string).collect(),
            None => previous
                .map(|p| p.scopes.clone())
                .unwrap_or_else(|| self.config.scopes.clone()),
        };
        Credential {
            access_token: token.access_token,
            // Refresh responses usually omit the refresh token; keep the old one.
            refresh_token: token
                .refresh_token
                .or_else(|| previous.and_then(|p| p.refresh_token.clone())),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
            scopes,
        }
    }

    async fn token_request(&self, form: &[(&str, String)], grant: Grant) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.config.token_uri)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::TransientNetwork(format!("token endpoint: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| Error::Schema {
                service: "OAuth token",
                detail: e.to_string(),
            });
        }
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(Error::TransientNetwork(format!(
                "token endpoint returned {}",
                status
            )));
        }

        let body = response.text().await.unwrap_or_default();
        let parsed: Option<TokenErrorResponse> = serde_json::from_str(&body).ok();
        let message = match (parsed, grant) {
            (Some(e), Grant::Exchange) if e.error == "invalid_grant" => {
                "Authorization code expired or invalid; start the connection again".to_string()
            }
            (Some(e), Grant::Refresh) if e.error == "invalid_grant" => {
                "refresh token was revoked or expired; reconnect".to_string()
            }
            (Some(e), _) => format!(
                "token endpoint rejected the request: {}{}",
                e.error,
                e.error_description
                    .map(|d| format!(" ({})", d))
                    .unwrap_or_default()
            ),
            (None, _) => format!("token endpoint returned {}", status),
        };
        Err(Error::Auth(message))
    }

    fn client_secrets(&self) -> Result<ClientSecrets> {
        let from_file = match &self.config.client_secrets_path {
            Some(path) => Some(read_client_secrets(path)?),
            None => None,
        };

        let client_id = self
            .config
            .client_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| from_file.as_ref().map(|f| f.client_id.clone()))
            .ok_or_else(|| {
                Error::Config(
                    "no OAuth client configured; set auth.client_id or auth.client_secrets_path"
                        .to_string(),
                )
            })?;
        let client_secret = self
            .config
            .client_secret
            .clone()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| from_file.and_then(|f| f.client_secret));

        Ok(ClientSecrets {
            client_id,
            client_secret,
        })
    }

    fn persist(&self, credential: &Credential) -> Result<()> {
        let path = &self.config.token_path;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(credential)?;
        write_private(path, json.as_bytes())?;
        Ok(())
    }
}

fn read_client_secrets(path: &Path) -> Result<ClientSecrets> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "cannot read client secrets {}: {}",
            path.display(),
            e
        ))
    })?;
    let file: SecretsFile = serde_json::from_str(&raw).map_err(|e| {
        Error::Config(format!("invalid client secrets {}: {}", path.display(), e))
    })?;
    let entry = file.installed.or(file.web).ok_or_else(|| {
        Error::Config(format!(
            "client secrets {} has neither an `installed` nor a `web` section",
            path.display()
        ))
    })?;
    Ok(ClientSecrets {
        client_id: entry.client_id,
        client_secret: entry.client_secret,
    })
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    // `mode` only applies on creation.
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}

/// Accept either a bare code or a full redirect URL carrying `code=`.
pub fn parse_authorization_code(input: &str, expected_state: &str) -> Result<String> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::Auth("authorization code is empty".to_string()));
    }

    let url = match reqwest::Url::parse(input) {
        Ok(url) if input.contains("code=") || input.contains("error=") => url,
        _ => return Ok(input.to_string()),
    };

    let mut code = None;
    let mut state = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => {
                return Err(Error::Auth(format!("authorization was denied: {}", value)));
            }
            _ => {}
        }
    }
    if let Some(state) = state {
        if state != expected_state {
            return Err(Error::Auth(
                "authorization response does not match this request (state mismatch)".to_string(),
            ));
        }
    }
    code.filter(|c| !c.is_empty())
        .ok_or_else(|| Error::Auth("redirect URL carries no authorization code".to_string()))
}
