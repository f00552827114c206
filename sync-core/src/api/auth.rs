use super::{
    error::{GraphError, Result},
    types::TokenResponse,
};
use base64::prelude::*;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub const DEFAULT_LOGIN_BASE: &str = "https://login.microsoftonline.com";

/// Which credential a request is made with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenScope {
    /// Application (client credentials) token
    App,
    /// Delegated token belonging to a local user
    User(u64),
}

/// Application registration used for the client credentials flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Delegated token stored for a local user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserToken {
    /// Build from a bare access token, taking the expiry from its JWT payload
    pub fn from_access_token(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        let access_token = access_token.into();
        let expires_at = parse_token_expiration(&access_token);
        Self {
            access_token,
            refresh_token,
            expires_at,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthState {
    pub token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthState {
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() >= expires_at,
            None => false,
        }
    }

    pub fn needs_refresh(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                // Refresh if token expires within 5 minutes
                let refresh_threshold = expires_at - Duration::minutes(5);
                Utc::now() >= refresh_threshold
            }
            None => false,
        }
    }

    fn usable_token(&self) -> Option<String> {
        if self.token.is_some() && !self.is_expired() && !self.needs_refresh() {
            self.token.clone()
        } else {
            None
        }
    }

    fn set_token(&mut self, response: &TokenResponse) {
        self.token = Some(response.access_token.clone());
        self.expires_at = expiry_of(response);
    }

    fn clear(&mut self) {
        self.token = None;
        self.expires_at = None;
    }
}

fn expiry_of(response: &TokenResponse) -> Option<DateTime<Utc>> {
    if let Some(expires_on) = response.expires_on {
        return DateTime::from_timestamp(expires_on, 0);
    }
    if let Some(expires_in) = response.expires_in {
        return Some(Utc::now() + Duration::seconds(expires_in));
    }
    parse_token_expiration(&response.access_token)
}

/// Read the `exp` claim of a JWT without validating it
pub fn parse_token_expiration(token: &str) -> Option<DateTime<Utc>> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }

    let decoded = BASE64_URL_SAFE_NO_PAD.decode(parts[1]).ok()?;
    let payload: serde_json::Value = serde_json::from_slice(&decoded).ok()?;

    let exp = payload.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}

/// Issues bearer tokens for application and per-user scopes
pub struct AuthManager {
    client: reqwest::Client,
    login_base: String,
    tenant_id: String,
    resource: String,
    credentials: Option<AppCredentials>,
    app_only_enabled: bool,
    app_state: RwLock<AuthState>,
    user_tokens: RwLock<HashMap<u64, UserToken>>,
}

impl AuthManager {
    pub fn new(
        client: reqwest::Client,
        tenant_id: impl Into<String>,
        resource: impl Into<String>,
        credentials: Option<AppCredentials>,
        app_only_enabled: bool,
    ) -> Self {
        Self {
            client,
            login_base: DEFAULT_LOGIN_BASE.to_string(),
            tenant_id: tenant_id.into(),
            resource: resource.into(),
            credentials,
            app_only_enabled,
            app_state: RwLock::new(AuthState::default()),
            user_tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Point token requests at another authority (sovereign clouds, tests)
    pub fn with_login_base(mut self, login_base: impl Into<String>) -> Self {
        self.login_base = login_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn has_app_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Whether requests may fall back to the application token
    pub fn app_only_available(&self) -> bool {
        self.app_only_enabled && self.credentials.is_some()
    }

    pub async fn store_user_token(&self, user_id: u64, token: UserToken) {
        self.user_tokens.write().await.insert(user_id, token);
    }

    pub async fn has_user_token(&self, user_id: u64) -> bool {
        self.user_tokens.read().await.contains_key(&user_id)
    }

    /// Pick the credential for acting on behalf of `user_id`
    ///
    /// Prefers the user's own token and falls back to the application
    /// token when that is allowed. `None` means no credential exists.
    pub async fn choose_scope(&self, user_id: Option<u64>) -> Option<TokenScope> {
        if let Some(user_id) = user_id {
            if self.has_user_token(user_id).await {
                return Some(TokenScope::User(user_id));
            }
        }
        if self.app_only_available() {
            Some(TokenScope::App)
        } else {
            None
        }
    }

    /// Get a valid bearer token for `scope`, refreshing when close to expiry
    pub async fn token_for(&self, scope: TokenScope) -> Result<String> {
        match scope {
            TokenScope::App => self.app_token().await,
            TokenScope::User(user_id) => self.user_token(user_id).await,
        }
    }

    /// Drop a cached token after the remote rejected it
    pub async fn invalidate(&self, scope: TokenScope) {
        match scope {
            TokenScope::App => self.app_state.write().await.clear(),
            TokenScope::User(user_id) => {
                if let Some(token) = self.user_tokens.write().await.get_mut(&user_id) {
                    token.expires_at = Some(Utc::now());
                }
            }
        }
    }

    async fn app_token(&self) -> Result<String> {
        if let Some(token) = self.app_state.read().await.usable_token() {
            return Ok(token);
        }

        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| GraphError::NoCredentials("no application credentials configured".to_string()))?;

        debug!("Requesting application token for {}", self.resource);
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("resource", self.resource.as_str()),
        ];
        let response = self.request_token(&params).await?;

        let mut state = self.app_state.write().await;
        state.set_token(&response);
        debug!("Application token acquired, expires at {:?}", state.expires_at);
        Ok(response.access_token)
    }

    async fn user_token(&self, user_id: u64) -> Result<String> {
        let stored = self
            .user_tokens
            .read()
            .await
            .get(&user_id)
            .cloned()
            .ok_or_else(|| GraphError::NoCredentials(format!("no token stored for user {}", user_id)))?;

        let state = AuthState {
            token: Some(stored.access_token.clone()),
            expires_at: stored.expires_at,
        };
        if let Some(token) = state.usable_token() {
            return Ok(token);
        }

        let refresh_token = match stored.refresh_token {
            Some(token) => token,
            None => {
                warn!("Token for user {} expired and cannot be refreshed", user_id);
                return Err(GraphError::NoCredentials(format!(
                    "token for user {} expired",
                    user_id
                )));
            }
        };
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| GraphError::NoCredentials("no application credentials configured".to_string()))?;

        debug!("Refreshing delegated token for user {}", user_id);
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
            ("resource", self.resource.as_str()),
        ];
        let response = match self.request_token(&params).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Token refresh failed for user {}: {}", user_id, e);
                self.user_tokens.write().await.remove(&user_id);
                return Err(e);
            }
        };

        let refreshed = UserToken {
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token.clone().or(Some(refresh_token)),
            expires_at: expiry_of(&response),
        };
        self.user_tokens.write().await.insert(user_id, refreshed);
        Ok(response.access_token)
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> Result<TokenResponse> {
        let url = format!("{}/{}/oauth2/token", self.login_base, self.tenant_id);
        let response = self.client.post(&url).form(params).send().await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(GraphError::Authentication(error_text));
        }

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| GraphError::Authentication(format!("malformed token response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn jwt_with_exp(exp: i64) -> String {
        let payload = BASE64_URL_SAFE_NO_PAD.encode(format!("{{\"exp\":{}}}", exp));
        format!("header.{}.signature", payload)
    }

    fn manager(server: &MockServer, credentials: Option<AppCredentials>, app_only: bool) -> AuthManager {
        AuthManager::new(
            reqwest::Client::new(),
            "contoso",
            "https://graph.microsoft.com",
            credentials,
            app_only,
        )
        .with_login_base(server.uri())
    }

    fn credentials() -> AppCredentials {
        AppCredentials {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
        }
    }

    #[test]
    fn test_parse_token_expiration() {
        let token = jwt_with_exp(1_700_000_000);
        let exp = parse_token_expiration(&token).unwrap();
        assert_eq!(exp.timestamp(), 1_700_000_000);
        assert!(parse_token_expiration("not-a-jwt").is_none());
    }

    #[test]
    fn test_needs_refresh_inside_window() {
        let state = AuthState {
            token: Some("t".to_string()),
            expires_at: Some(Utc::now() + Duration::minutes(2)),
        };
        assert!(state.needs_refresh());
        assert!(!state.is_expired());
        assert!(state.usable_token().is_none());
    }

    #[tokio::test]
    async fn test_app_token_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contoso/oauth2/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "app-token",
                "expires_in": "3599"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let auth = manager(&server, Some(credentials()), true);
        assert_eq!(auth.token_for(TokenScope::App).await.unwrap(), "app-token");
        assert_eq!(auth.token_for(TokenScope::App).await.unwrap(), "app-token");
    }

    #[tokio::test]
    async fn test_choose_scope_prefers_user_token() {
        let server = MockServer::start().await;
        let auth = manager(&server, Some(credentials()), true);
        auth.store_user_token(7, UserToken::from_access_token("user-token", None)).await;

        assert_eq!(auth.choose_scope(Some(7)).await, Some(TokenScope::User(7)));
        assert_eq!(auth.choose_scope(Some(8)).await, Some(TokenScope::App));
        assert_eq!(auth.choose_scope(None).await, Some(TokenScope::App));
    }

    #[tokio::test]
    async fn test_choose_scope_without_app_only() {
        let server = MockServer::start().await;
        let auth = manager(&server, Some(credentials()), false);
        assert_eq!(auth.choose_scope(Some(8)).await, None);
    }

    #[tokio::test]
    async fn test_expired_user_token_is_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/contoso/oauth2/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "refresh_token": "r2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let auth = manager(&server, Some(credentials()), false);
        auth.store_user_token(
            3,
            UserToken {
                access_token: "stale".to_string(),
                refresh_token: Some("r1".to_string()),
                expires_at: Some(Utc::now() - Duration::minutes(1)),
            },
        )
        .await;

        assert_eq!(auth.token_for(TokenScope::User(3)).await.unwrap(), "fresh");
        assert_eq!(auth.token_for(TokenScope::User(3)).await.unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_missing_user_token_is_no_credentials() {
        let server = MockServer::start().await;
        let auth = manager(&server, None, false);
        let err = auth.token_for(TokenScope::User(1)).await.unwrap_err();
        assert!(matches!(err, GraphError::NoCredentials(_)));
    }
}
