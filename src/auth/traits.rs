use anyhow::Result;
use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// async_trait my beloved. this shit rocks

/// Claim name -> value. Order doesn't matter, values can be arrays (roles) or strings.
pub type ClaimMap = serde_json::Map<String, serde_json::Value>;

/// Scope sets are kept sorted so the `scope` claim comes out the same every time
pub type ScopeSet = BTreeSet<String>;

/// Split a space-delimited `scope` parameter (RFC 6749 §3.3)
pub fn parse_scopes(raw: Option<&str>) -> ScopeSet {
    raw.map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

pub fn join_scopes(scopes: &ScopeSet) -> String {
    scopes.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    ClientCredentials,
    AuthorizationCode,
    RefreshToken,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::ClientCredentials => "client_credentials",
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "client_credentials" => Some(GrantType::ClientCredentials),
            "authorization_code" => Some(GrantType::AuthorizationCode),
            "refresh_token" => Some(GrantType::RefreshToken),
            _ => None,
        }
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    #[serde(rename = "plain")]
    Plain,
    S256,
}

impl CodeChallengeMethod {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "plain" => Some(CodeChallengeMethod::Plain),
            "S256" => Some(CodeChallengeMethod::S256),
            _ => None,
        }
    }
}

/// What happens to a refresh token once it's been used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTokenUsage {
    /// rotated on every use, the old handle is revoked
    #[default]
    OneTime,
    Reusable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTokenExpiration {
    #[default]
    Absolute,
    Sliding,
}

/// Form body of `POST /connect/token`. grant_type is a plain string so unknown grants
/// come back as `unsupported_grant_type` instead of a deserialisation failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    pub grant_type: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub code: Option<String>,
    pub code_verifier: Option<String>,
    pub redirect_uri: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64, // seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// JWT body shared by access and id tokens
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    pub iss: String, // Issuer
    pub aud: String, // Audience (resource indicator for access tokens, client_id for id tokens)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>, // Subject, absent for machine tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub iat: i64, // Issued at
    pub exp: i64, // Expiration time
    pub jti: String, // JWT ID (unique identifier)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(flatten)]
    pub extra: ClaimMap,
}

impl Claims {
    pub fn scopes(&self) -> ScopeSet {
        parse_scopes(self.scope.as_deref())
    }
}

/// Issued token plus the bits the caller needs to build a response
#[derive(Debug, Clone)]
pub struct SignedToken {
    pub token: String,
    pub key_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

/// What an access token should say
#[derive(Debug, Clone)]
pub struct AccessTokenRequest<'a> {
    pub subject: Option<&'a str>,
    pub client_id: &'a str,
    pub scopes: &'a ScopeSet,
    pub lifetime: std::time::Duration,
    pub claims: ClaimMap,
}

pub trait TokenIssuer {
    fn issue(&self, request: AccessTokenRequest<'_>) -> Result<SignedToken>;

    fn issue_id_token(
        &self,
        subject: &str,
        client_id: &str,
        nonce: Option<&str>,
        lifetime: std::time::Duration,
        claims: ClaimMap,
    ) -> Result<SignedToken>;
}

pub trait TokenValidator {
    fn validate_token(&self, token: &str) -> Result<Claims>;
}

/// Where user-profile data plugs into token issuance. Implemented by whatever owns the
/// user records; the authorization server never looks at profiles directly.
#[async_trait]
pub trait ClaimsProvider {
    async fn enrich(&self, subject_id: &str) -> Result<ClaimMap>;

    async fn is_active(&self, subject_id: &str) -> Result<bool>;
}

/// Figures out which end user is sitting behind an authorize request
#[async_trait]
pub trait ResourceOwnerAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Option<String>;
}
