use super::traits::{GrantType, RefreshTokenExpiration, RefreshTokenUsage, ScopeSet};
use crate::error::OAuthError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use subtle::ConstantTimeEq;
use thiserror::Error;

fn default_true() -> bool {
    true
}

fn default_access_token_lifetime() -> u64 {
    3600
}

fn default_identity_token_lifetime() -> u64 {
    300
}

fn default_refresh_token_lifetime() -> u64 {
    2_592_000 // 30 days
}

/// A registered OAuth client. Loaded from the catalog at startup and never mutated.
#[derive(Debug, Clone, Deserialize)]
pub struct Client {
    pub client_id: String,
    #[serde(default)]
    pub client_name: Option<String>,
    pub allowed_grants: HashSet<GrantType>,
    #[serde(default)]
    pub redirect_uris: HashSet<String>,
    #[serde(default = "default_true")]
    pub require_pkce: bool,
    #[serde(default)]
    pub allow_plain_text_pkce: bool,
    #[serde(default)]
    pub allowed_scopes: ScopeSet,
    #[serde(default)]
    pub allowed_cors_origins: Vec<String>,
    /// base64(sha256(secret)), see `hash_secret`
    #[serde(default)]
    pub secret_hash: Option<String>,
    #[serde(default = "default_true")]
    pub require_client_secret: bool,
    /// seconds
    #[serde(default = "default_access_token_lifetime")]
    pub access_token_lifetime: u64,
    #[serde(default = "default_identity_token_lifetime")]
    pub identity_token_lifetime: u64,
    /// absolute lifetime, or the sliding window when expiration is sliding
    #[serde(default = "default_refresh_token_lifetime")]
    pub refresh_token_lifetime: u64,
    /// hard cap for sliding refresh tokens, measured from when the family started
    #[serde(default)]
    pub absolute_refresh_token_lifetime: Option<u64>,
    #[serde(default)]
    pub refresh_token_usage: RefreshTokenUsage,
    #[serde(default)]
    pub refresh_token_expiration: RefreshTokenExpiration,
}

impl Client {
    pub fn allows(&self, grant: GrantType) -> bool {
        self.allowed_grants.contains(&grant)
    }

    pub fn is_public(&self) -> bool {
        !self.require_client_secret
    }

    pub fn access_token_lifetime(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.access_token_lifetime)
    }

    pub fn identity_token_lifetime(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.identity_token_lifetime)
    }

    /// Expiry of a refresh token handed out at `now` for a family that began at `family_started`
    pub fn refresh_token_expiry(
        &self,
        family_started: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let lifetime = Duration::seconds(self.refresh_token_lifetime as i64);
        match self.refresh_token_expiration {
            RefreshTokenExpiration::Absolute => family_started + lifetime,
            RefreshTokenExpiration::Sliding => {
                let slid = now + lifetime;
                match self.absolute_refresh_token_lifetime {
                    Some(cap) if cap > 0 => {
                        slid.min(family_started + Duration::seconds(cap as i64))
                    }
                    _ => slid,
                }
            }
        }
    }
}

/// Longest lifetime any token may have (ten years)
pub const MAX_LIFETIME_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("client '{0}' is registered more than once")]
    DuplicateClient(String),
    #[error("client '{0}': {1}")]
    InvalidClient(String, String),
}

/// Hash a client secret the way the catalog stores it
pub fn hash_secret(secret: &str) -> String {
    BASE64.encode(Sha256::digest(secret.as_bytes()))
}

/// Catalog of registered clients. Built once, then shared read-only behind an `Arc`.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, Client>,
}

impl ClientRegistry {
    pub fn new(clients: Vec<Client>) -> Result<Self, RegistryError> {
        let mut map = HashMap::with_capacity(clients.len());
        for client in clients {
            validate_client(&client)?;
            if map.contains_key(&client.client_id) {
                return Err(RegistryError::DuplicateClient(client.client_id));
            }
            map.insert(client.client_id.clone(), client);
        }
        Ok(Self { clients: map })
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn lookup(&self, client_id: &str) -> Option<&Client> {
        self.clients.get(client_id)
    }

    /// Constant-time comparison against the stored hash. Unknown clients and clients
    /// without a secret never validate.
    pub fn validate_secret(&self, client_id: &str, secret: &str) -> bool {
        let Some(expected) = self
            .clients
            .get(client_id)
            .and_then(|c| c.secret_hash.as_deref())
        else {
            return false;
        };

        let presented = hash_secret(secret);
        presented.as_bytes().ct_eq(expected.as_bytes()).into()
    }

    /// Exact string match only. No prefixes, no wildcards, no localhost port games.
    pub fn is_redirect_uri_allowed(&self, client_id: &str, uri: &str) -> bool {
        self.clients
            .get(client_id)
            .is_some_and(|c| c.redirect_uris.contains(uri))
    }

    /// Look up the client and check its secret if it's a confidential one
    pub fn authenticate(
        &self,
        client_id: &str,
        client_secret: Option<&str>,
    ) -> Result<&Client, OAuthError> {
        let client = self.lookup(client_id).ok_or_else(|| {
            tracing::warn!("token request from unknown client_id: {}", client_id);
            OAuthError::invalid_client("Client authentication failed")
        })?;

        if client.is_public() {
            return Ok(client);
        }

        match client_secret {
            Some(secret) if self.validate_secret(client_id, secret) => Ok(client),
            _ => {
                tracing::warn!(
                    "Invalid client credentials attempted for client_id: {}",
                    client_id
                );
                // Don't leak information about why validation failed
                Err(OAuthError::invalid_client("Client authentication failed"))
            }
        }
    }

    /// Every origin any client is allowed to call us from (for CORS)
    pub fn allowed_origins(&self) -> Vec<String> {
        let mut origins: Vec<String> = self
            .clients
            .values()
            .flat_map(|c| c.allowed_cors_origins.iter().cloned())
            .collect();
        origins.sort();
        origins.dedup();
        origins
    }

    /// Union of every scope any client may ask for (published in discovery)
    pub fn known_scopes(&self) -> ScopeSet {
        self.clients
            .values()
            .flat_map(|c| c.allowed_scopes.iter().cloned())
            .collect()
    }
}

fn validate_client(client: &Client) -> Result<(), RegistryError> {
    let invalid = |msg: &str| Err(RegistryError::InvalidClient(client.client_id.clone(), msg.into()));

    if client.client_id.trim().is_empty() {
        return invalid("client_id cannot be empty");
    }
    if client.allowed_grants.is_empty() {
        return invalid("at least one grant must be allowed");
    }
    if client.require_client_secret && client.secret_hash.is_none() {
        return invalid("confidential clients need a secret_hash");
    }
    if client.allows(GrantType::ClientCredentials) && client.is_public() {
        return invalid("client_credentials needs a confidential client");
    }
    if client.allows(GrantType::AuthorizationCode) && client.redirect_uris.is_empty() {
        return invalid("authorization_code needs at least one redirect_uri");
    }
    for uri in &client.redirect_uris {
        if url::Url::parse(uri).is_err() {
            return invalid(&format!("redirect_uri '{}' is not an absolute URL", uri));
        }
    }
    // tokens must always expire strictly after they're issued
    if client.access_token_lifetime == 0
        || client.identity_token_lifetime == 0
        || client.refresh_token_lifetime == 0
    {
        return invalid("token lifetimes must be at least one second");
    }
    // expiry arithmetic on the token path relies on this bound
    let lifetimes = [
        client.access_token_lifetime,
        client.identity_token_lifetime,
        client.refresh_token_lifetime,
        client.absolute_refresh_token_lifetime.unwrap_or(0),
    ];
    if lifetimes.iter().any(|&secs| secs > MAX_LIFETIME_SECS) {
        return invalid(&format!(
            "token lifetimes can't exceed {} seconds",
            MAX_LIFETIME_SECS
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{client_credentials_client, nextjs_client};

    #[test]
    fn validates_secret_against_stored_hash() {
        let registry = ClientRegistry::new(vec![client_credentials_client()]).unwrap();

        assert!(registry.validate_secret("client", "secret"));
        assert!(!registry.validate_secret("client", "Secret"));
        assert!(!registry.validate_secret("client", ""));
        assert!(!registry.validate_secret("nobody", "secret"));
    }

    #[test]
    fn public_clients_never_validate_a_secret() {
        let registry = ClientRegistry::new(vec![nextjs_client()]).unwrap();
        assert!(!registry.validate_secret("nextjs", "anything"));
        // but they still authenticate by id alone
        assert!(registry.authenticate("nextjs", None).is_ok());
    }

    #[test]
    fn confidential_client_needs_the_right_secret() {
        let registry = ClientRegistry::new(vec![client_credentials_client()]).unwrap();

        assert!(registry.authenticate("client", Some("secret")).is_ok());
        assert_eq!(
            registry.authenticate("client", None).unwrap_err().code(),
            "invalid_client"
        );
        assert_eq!(
            registry.authenticate("client", Some("nope")).unwrap_err().code(),
            "invalid_client"
        );
        assert_eq!(
            registry.authenticate("ghost", Some("secret")).unwrap_err().code(),
            "invalid_client"
        );
    }

    #[test]
    fn redirect_uris_match_exactly() {
        let registry = ClientRegistry::new(vec![nextjs_client()]).unwrap();

        assert!(registry.is_redirect_uri_allowed("nextjs", "https://localhost:3000/callback"));
        assert!(registry.is_redirect_uri_allowed("nextjs", "http://localhost:3000/callback"));
        // prefix / suffix / port tricks are all rejected
        assert!(!registry.is_redirect_uri_allowed("nextjs", "https://localhost:3000/callback/evil"));
        assert!(!registry.is_redirect_uri_allowed("nextjs", "https://localhost:3001/callback"));
        assert!(!registry.is_redirect_uri_allowed("nextjs", "https://localhost:3000/callback?x=1"));
        assert!(!registry.is_redirect_uri_allowed("other", "https://localhost:3000/callback"));
    }

    #[test]
    fn duplicate_client_ids_are_rejected() {
        let err = ClientRegistry::new(vec![nextjs_client(), nextjs_client()]).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateClient("nextjs".into()));
    }

    #[test]
    fn public_client_cannot_use_client_credentials() {
        let mut client = nextjs_client();
        client.allowed_grants.insert(GrantType::ClientCredentials);
        assert!(matches!(
            ClientRegistry::new(vec![client]),
            Err(RegistryError::InvalidClient(..))
        ));
    }

    #[test]
    fn zero_lifetimes_are_rejected() {
        let mut client = client_credentials_client();
        client.access_token_lifetime = 0;
        assert!(ClientRegistry::new(vec![client]).is_err());
    }

    #[test]
    fn oversized_lifetimes_are_rejected() {
        let mut client = nextjs_client();
        client.refresh_token_lifetime = u64::MAX;
        assert!(matches!(
            ClientRegistry::new(vec![client]),
            Err(RegistryError::InvalidClient(..))
        ));

        let mut client = nextjs_client();
        client.absolute_refresh_token_lifetime = Some(MAX_LIFETIME_SECS + 1);
        assert!(ClientRegistry::new(vec![client]).is_err());

        let mut client = client_credentials_client();
        client.access_token_lifetime = MAX_LIFETIME_SECS;
        assert!(ClientRegistry::new(vec![client]).is_ok());
    }

    #[test]
    fn sliding_expiry_is_capped_by_absolute_lifetime() {
        let mut client = nextjs_client();
        client.refresh_token_expiration = RefreshTokenExpiration::Sliding;
        client.refresh_token_lifetime = 100;
        client.absolute_refresh_token_lifetime = Some(150);

        let started = Utc::now();
        assert_eq!(
            client.refresh_token_expiry(started, started),
            started + Duration::seconds(100)
        );
        let later = started + Duration::seconds(80);
        assert_eq!(
            client.refresh_token_expiry(started, later),
            started + Duration::seconds(150)
        );

        client.refresh_token_expiration = RefreshTokenExpiration::Absolute;
        assert_eq!(
            client.refresh_token_expiry(started, later),
            started + Duration::seconds(100)
        );
    }

    #[test]
    fn known_scopes_and_origins_are_unioned() {
        let registry =
            ClientRegistry::new(vec![nextjs_client(), client_credentials_client()]).unwrap();
        let scopes = registry.known_scopes();
        assert!(scopes.contains("api1"));
        assert!(scopes.contains("openid"));
        assert_eq!(
            registry.allowed_origins(),
            vec!["http://localhost:3000", "https://localhost:3000"]
        );
    }
}
