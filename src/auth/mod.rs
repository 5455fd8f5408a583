mod authorization_code;
mod clients;
mod grants;
mod handlers;
mod keys;
mod middleware;
mod profile;
mod store;
mod token;
mod traits;

pub use authorization_code::{TrustedHeaderAuthenticator, authorize_handler, verify_pkce};
pub use clients::{Client, ClientRegistry, MAX_LIFETIME_SECS, RegistryError, hash_secret};
pub use grants::{GrantPolicy, GrantProcessor};
pub use handlers::{
    AUTHORIZE_PATH, DISCOVERY_PATH, INTROSPECTION_PATH, JWKS_PATH, OAuthAppState, REVOCATION_PATH,
    TOKEN_PATH, USERINFO_PATH, discovery_handler, introspection_handler, jwks_handler, revocation_handler,
    token_handler, userinfo_handler,
};
pub use keys::{KeyError, SigningKey, SigningKeySet};
pub use middleware::{
    authenticate_bearer, extract_bearer, forbidden_response, jwt_auth_middleware,
    unauthorized_response,
};
pub use profile::{HttpProfileService, StaticProfileStore, UserProfile};
pub use store::{
    AuthorizationCode, CodeRedemption, GrantStore, GuardedStore, MemoryGrantStore, RefreshToken,
    StoreError, new_handle,
};
pub use token::{JwtTokenIssuer, JwtTokenValidator};
pub use traits::{
    AccessTokenRequest, ClaimMap, Claims, ClaimsProvider, CodeChallengeMethod, GrantType,
    RefreshTokenExpiration, RefreshTokenUsage, ResourceOwnerAuthenticator, ScopeSet, TokenIssuer,
    TokenRequest, TokenResponse, TokenValidator, join_scopes, parse_scopes,
};

use std::sync::Arc;
use std::time::Duration;

/// Knobs for the authorization server that don't belong to any one client
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub issuer: String,
    /// `aud` on every access token, and what the gateway expects to see there
    pub audience: String,
    pub authorization_code_lifetime: Duration,
    pub clock_skew: Duration,
    pub store_timeout: Duration,
    pub store_retry_backoff: Duration,
    pub revoke_family_on_reuse: bool,
}

impl ServerSettings {
    /// issuer without a trailing slash, for building endpoint urls
    pub fn base_url(&self) -> &str {
        self.issuer.trim_end_matches('/')
    }
}

/// Complete authorization server: registry, store, keys and collaborators wired
/// together. Built once in `main` and shared behind an `Arc`.
pub struct AuthorizationServer {
    pub settings: ServerSettings,
    pub clients: Arc<ClientRegistry>,
    pub store: GuardedStore,
    pub keys: Arc<SigningKeySet>,
    pub validator: Arc<dyn TokenValidator + Send + Sync>,
    pub authenticator: Arc<dyn ResourceOwnerAuthenticator + Send + Sync>,
    pub grants: GrantProcessor,
}

impl AuthorizationServer {
    pub fn new(
        settings: ServerSettings,
        clients: ClientRegistry,
        store: Arc<dyn GrantStore>,
        keys: Arc<SigningKeySet>,
        claims: Arc<dyn ClaimsProvider + Send + Sync>,
        authenticator: Arc<dyn ResourceOwnerAuthenticator + Send + Sync>,
    ) -> Self {
        let clients = Arc::new(clients);
        let store = GuardedStore::new(store, settings.store_timeout, settings.store_retry_backoff);

        let issuer = Arc::new(JwtTokenIssuer::new(
            settings.issuer.clone(),
            settings.audience.clone(),
            keys.clone(),
        ));
        let validator = Arc::new(JwtTokenValidator::new(
            keys.clone(),
            &settings.issuer,
            &settings.audience,
            settings.clock_skew,
        ));

        let grants = GrantProcessor::new(
            clients.clone(),
            store.clone(),
            issuer,
            claims,
            GrantPolicy {
                revoke_family_on_reuse: settings.revoke_family_on_reuse,
                claims_timeout: settings.store_timeout,
            },
        );

        Self {
            settings,
            clients,
            store,
            keys,
            validator,
            authenticator,
            grants,
        }
    }

    pub fn validate_token(&self, token: &str) -> anyhow::Result<Claims> {
        self.validator.validate_token(token)
    }
}
