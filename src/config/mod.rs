//! Application configuration.
//!
//! Loaded from a TOML file (every section optional), then overridden by
//! `ACCTLINK_*` environment variables, then validated. Validation failures are
//! fatal at startup.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Complete configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub provider_a: ProviderAConfig,
    #[serde(default)]
    pub provider_b: ProviderBConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Prefix for every route, e.g. `/api/v1`
    #[serde(default = "default_api_base_path")]
    pub api_base_path: String,
    /// Where OAuth redirect flows land (success and error pages)
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_api_base_path() -> String {
    "/api/v1".to_string()
}

fn default_frontend_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            api_base_path: default_api_base_path(),
            frontend_url: default_frontend_url(),
            cors_origins: default_cors_origins(),
        }
    }
}

/// Connection store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_database_path() -> String {
    "connections.db".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Transient cache configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheConfig {
    /// Shared Redis; without it an in-process cache is used (single instance only)
    #[serde(default)]
    pub redis_url: Option<String>,
}

/// Idempotency middleware configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencyConfig {
    /// Record lifetime, terminal or not
    #[serde(default = "default_idempotency_ttl")]
    pub ttl_seconds: u64,
    /// Largest request body buffered for fingerprinting
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_idempotency_ttl() -> u64 {
    86_400
}

fn default_max_body_bytes() -> usize {
    1_048_576 // 1 MB
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_idempotency_ttl(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// OAuth orchestration configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: u64,
    /// Upper bound on every provider call
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
}

fn default_state_ttl() -> u64 {
    300
}

fn default_http_timeout() -> u64 {
    10
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            state_ttl_seconds: default_state_ttl(),
            http_timeout_seconds: default_http_timeout(),
        }
    }
}

/// Key material. Never logged.
#[derive(Clone, Default, Deserialize)]
pub struct SecurityConfig {
    /// Base64-encoded 32-byte AES key
    #[serde(default)]
    pub encryption_key: String,
    /// HMAC secret for bearer identity tokens; unset trusts the `userId` query parameter
    #[serde(default)]
    pub token_secret: Option<String>,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("encryption_key", &"[REDACTED]")
            .field("token_secret", &self.token_secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Provider A (client-credentials grant)
#[derive(Clone, Deserialize)]
pub struct ProviderAConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default = "default_provider_a_oauth_base")]
    pub oauth_base: String,
    #[serde(default = "default_provider_a_api_base")]
    pub api_base: String,
    #[serde(default = "default_provider_a_scope")]
    pub scope: String,
}

fn default_provider_a_oauth_base() -> String {
    "https://oauth2.cert.toss.im".to_string()
}

fn default_provider_a_api_base() -> String {
    "https://cert.toss.im".to_string()
}

fn default_provider_a_scope() -> String {
    "ca".to_string()
}

impl Default for ProviderAConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            oauth_base: default_provider_a_oauth_base(),
            api_base: default_provider_a_api_base(),
            scope: default_provider_a_scope(),
        }
    }
}

impl std::fmt::Debug for ProviderAConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("oauth_base", &self.oauth_base)
            .field("api_base", &self.api_base)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Provider B (authorization-code grant)
#[derive(Clone, Deserialize)]
pub struct ProviderBConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default = "default_provider_b_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_provider_b_token_url")]
    pub token_url: String,
    #[serde(default = "default_provider_b_api_base_url")]
    pub api_base_url: String,
    /// Institution code prefixed to every transaction id
    #[serde(default = "default_provider_b_org_code")]
    pub org_code: String,
    #[serde(default = "default_provider_b_scope")]
    pub scope: String,
    /// 0 = integrated authentication, 1 = per-account authentication
    #[serde(default = "default_provider_b_auth_type")]
    pub auth_type: String,
}

fn default_provider_b_authorize_url() -> String {
    "https://testapi.openbanking.or.kr/oauth/2.0/authorize".to_string()
}

fn default_provider_b_token_url() -> String {
    "https://testapi.openbanking.or.kr/oauth/2.0/token".to_string()
}

fn default_provider_b_api_base_url() -> String {
    "https://testapi.openbanking.or.kr".to_string()
}

fn default_provider_b_org_code() -> String {
    "1101073389".to_string()
}

fn default_provider_b_scope() -> String {
    "login inquiry".to_string()
}

fn default_provider_b_auth_type() -> String {
    "0".to_string()
}

impl Default for ProviderBConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: String::new(),
            authorize_url: default_provider_b_authorize_url(),
            token_url: default_provider_b_token_url(),
            api_base_url: default_provider_b_api_base_url(),
            org_code: default_provider_b_org_code(),
            scope: default_provider_b_scope(),
            auth_type: default_provider_b_auth_type(),
        }
    }
}

impl std::fmt::Debug for ProviderBConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderBConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("api_base_url", &self.api_base_url)
            .field("org_code", &self.org_code)
            .field("scope", &self.scope)
            .field("auth_type", &self.auth_type)
            .finish()
    }
}

impl AppConfig {
    /// Loads the file (if present), applies environment overrides and validates.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            load_config(path)?
        } else {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Applies `ACCTLINK_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from any variable source; unparsable numbers are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |target: &mut String, name: &str| {
            if let Some(v) = lookup(name) {
                *target = v;
            }
        };

        set(&mut self.server.bind_addr, "ACCTLINK_BIND_ADDR");
        set(&mut self.server.api_base_path, "ACCTLINK_API_BASE_PATH");
        set(&mut self.server.frontend_url, "ACCTLINK_FRONTEND_URL");
        set(&mut self.store.database_path, "ACCTLINK_DATABASE_PATH");
        set(&mut self.security.encryption_key, "ACCTLINK_ENCRYPTION_KEY");

        set(&mut self.provider_a.client_id, "ACCTLINK_PROVIDER_A_CLIENT_ID");
        set(&mut self.provider_a.client_secret, "ACCTLINK_PROVIDER_A_CLIENT_SECRET");
        set(&mut self.provider_a.oauth_base, "ACCTLINK_PROVIDER_A_OAUTH_BASE");
        set(&mut self.provider_a.api_base, "ACCTLINK_PROVIDER_A_API_BASE");

        set(&mut self.provider_b.client_id, "ACCTLINK_PROVIDER_B_CLIENT_ID");
        set(&mut self.provider_b.client_secret, "ACCTLINK_PROVIDER_B_CLIENT_SECRET");
        set(&mut self.provider_b.redirect_uri, "ACCTLINK_PROVIDER_B_REDIRECT_URI");
        set(&mut self.provider_b.authorize_url, "ACCTLINK_PROVIDER_B_AUTHORIZE_URL");
        set(&mut self.provider_b.token_url, "ACCTLINK_PROVIDER_B_TOKEN_URL");
        set(&mut self.provider_b.api_base_url, "ACCTLINK_PROVIDER_B_API_BASE_URL");
        set(&mut self.provider_b.org_code, "ACCTLINK_PROVIDER_B_ORG_CODE");

        if let Some(v) = lookup("ACCTLINK_CORS_ORIGINS") {
            self.server.cors_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = lookup("ACCTLINK_REDIS_URL") {
            self.cache.redis_url = Some(v);
        }
        if let Some(v) = lookup("ACCTLINK_TOKEN_SECRET") {
            self.security.token_secret = Some(v);
        }
        if let Some(n) = lookup("ACCTLINK_IDEMPOTENCY_TTL").and_then(|v| v.parse().ok()) {
            self.idempotency.ttl_seconds = n;
        }
        if let Some(n) = lookup("ACCTLINK_OAUTH_STATE_TTL").and_then(|v| v.parse().ok()) {
            self.oauth.state_ttl_seconds = n;
        }
        if let Some(n) = lookup("ACCTLINK_HTTP_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.oauth.http_timeout_seconds = n;
        }
    }

    /// Rejects configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.security.encryption_key.is_empty() {
            missing.push("security.encryption_key");
        }
        if self.provider_a.client_id.is_empty() {
            missing.push("provider_a.client_id");
        }
        if self.provider_a.client_secret.is_empty() {
            missing.push("provider_a.client_secret");
        }
        if self.provider_b.client_id.is_empty() {
            missing.push("provider_b.client_id");
        }
        if self.provider_b.client_secret.is_empty() {
            missing.push("provider_b.client_secret");
        }
        if self.provider_b.redirect_uri.is_empty() {
            missing.push("provider_b.redirect_uri");
        }
        if !missing.is_empty() {
            bail!("Missing required configuration: {}", missing.join(", "));
        }

        crate::crypto::validate_key(&self.security.encryption_key)
            .context("Invalid security.encryption_key")?;

        if self.idempotency.ttl_seconds == 0 {
            return Err(anyhow!("idempotency.ttl_seconds must be positive"));
        }
        if self.idempotency.max_body_bytes == 0 {
            return Err(anyhow!("idempotency.max_body_bytes must be positive"));
        }
        if self.oauth.state_ttl_seconds == 0 {
            return Err(anyhow!("oauth.state_ttl_seconds must be positive"));
        }
        if self.security.token_secret.as_deref() == Some("") {
            return Err(anyhow!("security.token_secret must not be empty when set"));
        }

        Ok(())
    }
}

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: AppConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}
