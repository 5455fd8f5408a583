//! Shared fixtures for the unit tests: test keys, the sample clients and users, and a
//! `TestFixture` that wires up a complete server around the in-memory store.

use crate::auth::{
    AccessTokenRequest, AuthorizationCode, AuthorizationServer, ClaimMap, Claims, ClaimsProvider,
    Client, ClientRegistry, GrantPolicy, GrantProcessor, GrantStore, JwtTokenIssuer,
    MemoryGrantStore, OAuthAppState, RefreshToken, ServerSettings, SigningKey, SigningKeySet,
    StaticProfileStore, TokenIssuer, TokenRequest, TokenResponse, TrustedHeaderAuthenticator,
    UserProfile, parse_scopes,
};
use crate::gateway::{GatewaySettings, GatewayState, RouteEntry, RouteTable};
use crate::server;
use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const KEY_A: &[u8] = include_bytes!("../testdata/signing-key-a.pem");
pub const KEY_B: &[u8] = include_bytes!("../testdata/signing-key-b.pem");

pub const ISSUER: &str = "https://localhost:5001";
pub const AUDIENCE: &str = "https://localhost:5001/resources";
pub const NEXTJS_REDIRECT: &str = "https://localhost:3000/callback";
pub const MVC_REDIRECT: &str = "https://localhost:5002/signin-oidc";

fn client(value: serde_json::Value) -> Client {
    serde_json::from_value(value).unwrap()
}

/// Machine to machine client, secret "secret"
pub fn client_credentials_client() -> Client {
    client(json!({
        "client_id": "client",
        "client_name": "Client Credentials Client",
        "allowed_grants": ["client_credentials"],
        "secret_hash": crate::auth::hash_secret("secret"),
        "allowed_scopes": ["api1"],
    }))
}

/// The SPA: public, PKCE, reusable sliding refresh tokens
pub fn nextjs_client() -> Client {
    client(json!({
        "client_id": "nextjs",
        "client_name": "Next.js SPA",
        "allowed_grants": ["authorization_code", "refresh_token"],
        "require_client_secret": false,
        "redirect_uris": ["http://localhost:3000/callback", NEXTJS_REDIRECT],
        "allowed_cors_origins": ["http://localhost:3000", "https://localhost:3000"],
        "allowed_scopes": ["openid", "profile", "email", "roles", "api1", "users", "notifications"],
        "access_token_lifetime": 3600,
        "refresh_token_usage": "reusable",
        "refresh_token_expiration": "sliding",
        "refresh_token_lifetime": 2592000,
    }))
}

/// Server-rendered app: public, PKCE, one-time refresh tokens
pub fn mvc_client() -> Client {
    client(json!({
        "client_id": "mvc",
        "client_name": "MVC Client",
        "allowed_grants": ["authorization_code", "refresh_token"],
        "require_client_secret": false,
        "redirect_uris": [MVC_REDIRECT],
        "allowed_scopes": ["openid", "profile", "email", "roles", "api1"],
        "refresh_token_usage": "one_time",
        "refresh_token_expiration": "absolute",
    }))
}

/// alice is the happy path, bob is switched off, carol gets switched off mid-test
pub fn users() -> Vec<UserProfile> {
    let user = |id: &str, first: &str, roles: &[&str], is_active: bool| UserProfile {
        id: id.into(),
        first_name: Some(first.into()),
        last_name: Some("Example".into()),
        email: Some(format!("{}@example.com", id)),
        tenant_id: Some("tenant-1".into()),
        roles: roles.iter().map(|r| r.to_string()).collect(),
        is_active,
    };
    vec![
        user("alice", "Alice", &["Admin", "User"], true),
        user("bob", "Bob", &["User"], false),
        user("carol", "Carol", &["User"], true),
    ]
}

pub fn sample_code(code: &str) -> AuthorizationCode {
    let now = Utc::now();
    AuthorizationCode {
        code: code.into(),
        client_id: "nextjs".into(),
        subject_id: "alice".into(),
        redirect_uri: NEXTJS_REDIRECT.into(),
        code_challenge: None,
        code_challenge_method: None,
        scopes: parse_scopes(Some("openid api1")),
        nonce: None,
        family_id: Uuid::new_v4(),
        issued_at: now,
        expires_at: now + chrono::Duration::minutes(5),
        consumed: false,
    }
}

pub fn sample_refresh_token(token: &str, family_id: Uuid) -> RefreshToken {
    let now = Utc::now();
    RefreshToken {
        token: token.into(),
        client_id: "nextjs".into(),
        subject_id: "alice".into(),
        scopes: parse_scopes(Some("openid api1")),
        family_id,
        family_started_at: now,
        issued_at: now,
        expires_at: now + chrono::Duration::days(1),
        nonce: None,
        revoked: false,
    }
}

/// (verifier, S256 challenge)
pub fn pkce_pair() -> (String, String) {
    let verifier = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    (verifier, challenge)
}

/// Static profiles with a kill switch per subject
pub struct SwitchableProfiles {
    inner: StaticProfileStore,
    disabled: Mutex<HashSet<String>>,
}

impl SwitchableProfiles {
    fn new(users: Vec<UserProfile>) -> Self {
        Self {
            inner: StaticProfileStore::new(users),
            disabled: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl ClaimsProvider for SwitchableProfiles {
    async fn enrich(&self, subject_id: &str) -> Result<ClaimMap> {
        self.inner.enrich(subject_id).await
    }

    async fn is_active(&self, subject_id: &str) -> Result<bool> {
        if self.disabled.lock().unwrap().contains(subject_id) {
            return Ok(false);
        }
        self.inner.is_active(subject_id).await
    }
}

pub struct TestFixture {
    pub server: Arc<AuthorizationServer>,
    profiles: Arc<SwitchableProfiles>,
}

impl TestFixture {
    pub fn new() -> Self {
        Self::build(GrantPolicy::default(), Arc::new(MemoryGrantStore::new()))
    }

    pub fn with_policy(policy: GrantPolicy) -> Self {
        Self::build(policy, Arc::new(MemoryGrantStore::new()))
    }

    pub fn with_store(store: Arc<dyn GrantStore>) -> Self {
        Self::build(GrantPolicy::default(), store)
    }

    fn build(policy: GrantPolicy, store: Arc<dyn GrantStore>) -> Self {
        let settings = ServerSettings {
            issuer: ISSUER.into(),
            audience: AUDIENCE.into(),
            authorization_code_lifetime: Duration::from_secs(300),
            clock_skew: Duration::ZERO,
            // short, so the stalled-store tests don't drag
            store_timeout: Duration::from_millis(200),
            store_retry_backoff: Duration::from_millis(10),
            revoke_family_on_reuse: policy.revoke_family_on_reuse,
        };
        let clients =
            ClientRegistry::new(vec![client_credentials_client(), nextjs_client(), mvc_client()])
                .unwrap();
        let keys = SigningKeySet::new(SigningKey::from_rsa_pem("k1", KEY_A).unwrap(), vec![]).unwrap();
        let profiles = Arc::new(SwitchableProfiles::new(users()));
        let authenticator =
            TrustedHeaderAuthenticator::new(TrustedHeaderAuthenticator::DEFAULT_HEADER).unwrap();

        let server = AuthorizationServer::new(
            settings,
            clients,
            store,
            Arc::new(keys),
            profiles.clone(),
            Arc::new(authenticator),
        );

        Self {
            server: Arc::new(server),
            profiles,
        }
    }

    pub fn grants(&self) -> &GrantProcessor {
        &self.server.grants
    }

    pub fn state(&self) -> OAuthAppState {
        OAuthAppState {
            server: self.server.clone(),
        }
    }

    /// Tight limits so timeouts and oversized bodies are cheap to provoke
    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            realm: ISSUER.into(),
            upstream_timeout: Duration::from_millis(300),
            max_body_bytes: 1024,
        }
    }

    fn gateway(&self, routes: Vec<RouteEntry>) -> GatewayState {
        GatewayState::new(
            RouteTable::new(routes).unwrap(),
            self.server.validator.clone(),
            self.gateway_settings(),
        )
        .unwrap()
    }

    /// The full router with an empty route table
    pub fn app(&self) -> Router {
        server::router(self.state(), self.gateway(vec![]))
    }

    pub fn gateway_app(&self, routes: Vec<RouteEntry>) -> Router {
        server::router(self.state(), self.gateway(routes))
    }

    pub fn deactivate(&self, subject_id: &str) {
        self.profiles.disabled.lock().unwrap().insert(subject_id.into());
    }

    fn redirect_for(client_id: &str) -> &'static str {
        if client_id == "mvc" {
            MVC_REDIRECT
        } else {
            NEXTJS_REDIRECT
        }
    }

    /// An S256 code as the authorize endpoint would have minted it
    pub fn code_for(&self, client_id: &str, subject_id: &str, scope: &str, challenge: &str) -> AuthorizationCode {
        AuthorizationCode {
            client_id: client_id.into(),
            subject_id: subject_id.into(),
            redirect_uri: Self::redirect_for(client_id).into(),
            code_challenge: Some(challenge.into()),
            code_challenge_method: Some(crate::auth::CodeChallengeMethod::S256),
            scopes: parse_scopes(Some(scope)),
            ..sample_code(&crate::auth::new_handle())
        }
    }

    pub async fn seed_code(&self, client_id: &str, subject_id: &str, scope: &str, challenge: &str) -> String {
        let grant = self.code_for(client_id, subject_id, scope, challenge);
        let code = grant.code.clone();
        self.server.store.store_code(grant).await.unwrap();
        code
    }

    pub async fn login(&self, client_id: &str, subject_id: &str, scope: &str) -> TokenResponse {
        self.login_with_nonce(client_id, subject_id, scope, None).await
    }

    /// Walk the code flow straight through the grant processor
    pub async fn login_with_nonce(
        &self,
        client_id: &str,
        subject_id: &str,
        scope: &str,
        nonce: Option<&str>,
    ) -> TokenResponse {
        let (verifier, challenge) = pkce_pair();
        let mut grant = self.code_for(client_id, subject_id, scope, &challenge);
        grant.nonce = nonce.map(str::to_string);
        let code = grant.code.clone();
        self.server.store.store_code(grant).await.unwrap();

        self.grants()
            .process(TokenRequest {
                grant_type: "authorization_code".into(),
                client_id: Some(client_id.into()),
                code: Some(code),
                code_verifier: Some(verifier),
                redirect_uri: Some(Self::redirect_for(client_id).into()),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    /// Access token for the machine client, signed with whatever key is active right now
    pub fn client_token(&self, scope: &str) -> String {
        let issuer = JwtTokenIssuer::new(ISSUER, AUDIENCE, self.server.keys.clone());
        let scopes = parse_scopes(Some(scope));
        issuer
            .issue(AccessTokenRequest {
                subject: None,
                client_id: "client",
                scopes: &scopes,
                lifetime: Duration::from_secs(3600),
                claims: ClaimMap::new(),
            })
            .unwrap()
            .token
    }

    pub fn decode_id_token(&self, token: &str, client_id: &str) -> Claims {
        let kid = decode_header(token).unwrap().kid.unwrap();
        let key = self.server.keys.verification_key(&kid).unwrap();
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[ISSUER]);
        validation.set_audience(&[client_id]);
        decode::<Claims>(token, key.decoding_key(), &validation)
            .unwrap()
            .claims
    }
}
