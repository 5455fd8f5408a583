use crate::auth::{
    Client, ClientRegistry, KeyError, MAX_LIFETIME_SECS, RegistryError, ServerSettings,
    SigningKey, SigningKeySet, TrustedHeaderAuthenticator, UserProfile,
};
use crate::gateway::{GatewaySettings, RouteEntry, RouteError, RouteTable};
use clap::{ArgAction, Parser};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Parser, Debug, Clone)]
#[command(name = "idam")]
#[command(about = "identity & access manager: oauth2/oidc tokens plus a gateway that checks them")]
pub struct Args {
    /// Host to bind to
    #[arg(long, env = "IDAM_HOST", default_value = "localhost")]
    pub host: String,

    /// Port to bind to
    #[arg(short, long, env = "IDAM_PORT", default_value = "5001")]
    pub port: u16,

    /// Public issuer URI, e.g. https://id.example.com. Goes in `iss` and in discovery.
    #[arg(long, env = "ISSUER_URI")]
    pub issuer: String,

    /// JSON catalog with clients, users, routes and signing keys
    #[arg(long, env = "IDAM_CATALOG", default_value = "config/catalog.json")]
    pub catalog: PathBuf,

    /// `aud` on access tokens (defaults to {issuer}/resources)
    #[arg(long, env = "IDAM_AUDIENCE")]
    pub audience: Option<String>,

    /// Authorization code lifetime in seconds
    #[arg(long, env = "AUTHORIZATION_CODE_LIFETIME", default_value = "300")]
    pub authorization_code_lifetime: u64,

    /// Per-call timeout for the code/token store and the claims service
    #[arg(long, env = "STORE_TIMEOUT_MS", default_value = "2000")]
    pub store_timeout_ms: u64,

    /// Pause before the single retry of an idempotent store call
    #[arg(long, env = "STORE_RETRY_BACKOFF_MS", default_value = "50")]
    pub store_retry_backoff_ms: u64,

    /// Gateway: how long to wait on a backend
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value = "30")]
    pub upstream_timeout_secs: u64,

    /// Gateway: largest request body we'll buffer and forward
    #[arg(long, env = "MAX_BODY_BYTES", default_value = "10485760")]
    pub max_body_bytes: usize,

    /// Leeway for exp/nbf when validating tokens
    #[arg(long, env = "CLOCK_SKEW_SECS", default_value = "60")]
    pub clock_skew_secs: u64,

    /// Revoke the whole refresh token family when a spent token or code is replayed
    #[arg(long, env = "REVOKE_FAMILY_ON_REUSE", default_value = "true", action = ArgAction::Set)]
    pub revoke_family_on_reuse: bool,

    /// Header the fronting login service puts the authenticated user id in
    #[arg(long, env = "SUBJECT_HEADER", default_value = TrustedHeaderAuthenticator::DEFAULT_HEADER)]
    pub subject_header: String,

    /// Users API for claims enrichment. Without it the catalog's users are used.
    #[arg(long, env = "PROFILE_SERVICE_URL")]
    pub profile_service_url: Option<String>,

    /// Bearer token for the users API
    #[arg(long, env = "PROFILE_SERVICE_TOKEN")]
    pub profile_service_token: Option<String>,

    /// How often expired codes, refresh tokens and retired keys get swept
    #[arg(long, env = "PURGE_INTERVAL_SECS", default_value = "60")]
    pub purge_interval_secs: u64,
}

impl Args {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let issuer = url::Url::parse(&self.issuer)
            .map_err(|e| ConfigError::Invalid(format!("issuer '{}': {}", self.issuer, e)))?;
        if !matches!(issuer.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "issuer '{}' must be http(s)",
                self.issuer
            )));
        }

        let positive = [
            ("authorization-code-lifetime", self.authorization_code_lifetime),
            ("store-timeout-ms", self.store_timeout_ms),
            ("upstream-timeout-secs", self.upstream_timeout_secs),
            ("purge-interval-secs", self.purge_interval_secs),
            ("max-body-bytes", self.max_body_bytes as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
        }
        let bounded = [
            ("authorization-code-lifetime", self.authorization_code_lifetime),
            ("clock-skew-secs", self.clock_skew_secs),
        ];
        if let Some((name, _)) = bounded.iter().find(|(_, v)| *v > MAX_LIFETIME_SECS) {
            return Err(ConfigError::Invalid(format!(
                "{} can't exceed {} seconds",
                name, MAX_LIFETIME_SECS
            )));
        }

        if let Some(url) = &self.profile_service_url {
            url::Url::parse(url)
                .map_err(|e| ConfigError::Invalid(format!("profile-service-url '{}': {}", url, e)))?;
        }
        Ok(())
    }

    fn base_url(&self) -> &str {
        self.issuer.trim_end_matches('/')
    }

    pub fn audience(&self) -> String {
        self.audience
            .clone()
            .unwrap_or_else(|| format!("{}/resources", self.base_url()))
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            issuer: self.base_url().to_string(),
            audience: self.audience(),
            authorization_code_lifetime: Duration::from_secs(self.authorization_code_lifetime),
            clock_skew: Duration::from_secs(self.clock_skew_secs),
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            store_retry_backoff: Duration::from_millis(self.store_retry_backoff_ms),
            revoke_family_on_reuse: self.revoke_family_on_reuse,
        }
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            realm: self.base_url().to_string(),
            upstream_timeout: Duration::from_secs(self.upstream_timeout_secs),
            max_body_bytes: self.max_body_bytes,
        }
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse catalog {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Clients(#[from] RegistryError),
    #[error(transparent)]
    Routes(#[from] RouteError),
    #[error(transparent)]
    Keys(#[from] KeyError),
    #[error("expected exactly one active signing key, found {0}")]
    ActiveKeys(usize),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyEntry {
    pub kid: String,
    /// relative paths are resolved against the catalog's directory
    pub pem_path: PathBuf,
    #[serde(default)]
    pub active: bool,
}

/// Raw catalog file
#[derive(Debug, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub clients: Vec<Client>,
    #[serde(default)]
    pub users: Vec<UserProfile>,
    #[serde(default)]
    pub routes: Vec<RouteEntry>,
    #[serde(default)]
    pub signing_keys: Vec<KeyEntry>,
}

/// Catalog after validation, ready to wire up
pub struct LoadedCatalog {
    pub clients: ClientRegistry,
    pub users: Vec<UserProfile>,
    pub routes: RouteTable,
    pub keys: SigningKeySet,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<LoadedCatalog, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog: Catalog = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        catalog.build(base_dir)
    }

    /// Validate everything and load the key material. Any failure here aborts startup.
    pub fn build(self, base_dir: &Path) -> Result<LoadedCatalog, ConfigError> {
        let clients = ClientRegistry::new(self.clients)?;
        let routes = RouteTable::new(self.routes)?;
        let keys = load_keys(&self.signing_keys, base_dir)?;

        tracing::info!(
            "catalog: {} clients, {} users, {} routes, {} signing keys",
            clients.len(),
            self.users.len(),
            routes.len(),
            self.signing_keys.len()
        );

        Ok(LoadedCatalog {
            clients,
            users: self.users,
            routes,
            keys,
        })
    }
}

fn load_keys(entries: &[KeyEntry], base_dir: &Path) -> Result<SigningKeySet, ConfigError> {
    let active_count = entries.iter().filter(|k| k.active).count();
    if active_count != 1 {
        return Err(ConfigError::ActiveKeys(active_count));
    }

    let mut active = None;
    let mut others = Vec::new();
    for entry in entries {
        let path = base_dir.join(&entry.pem_path);
        let pem = std::fs::read(&path).map_err(|source| ConfigError::Read { path, source })?;
        let key = SigningKey::from_rsa_pem(entry.kid.clone(), &pem)?;
        if entry.active {
            active = Some(key);
        } else {
            others.push(key);
        }
    }

    let active = active.ok_or(KeyError::NoActiveKey)?;
    Ok(SigningKeySet::new(active, others)?)
}
