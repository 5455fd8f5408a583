use super::keys::SigningKeySet;
use super::traits::{AccessTokenRequest, ClaimMap, Claims, SignedToken, TokenIssuer, TokenValidator, join_scopes};
use anyhow::{Result, anyhow, bail};
use chrono::{Duration, Utc};
use jsonwebtoken::{Validation, decode, decode_header};
use std::sync::Arc;
use uuid::Uuid;

/// `typ` header on access tokens (RFC 9068), so an id token can't be replayed as one
pub const ACCESS_TOKEN_TYP: &str = "at+jwt";
pub const ID_TOKEN_TYP: &str = "JWT";

/// Claims the issuer owns. Anything the profile hands us under these names is dropped
/// instead of overwriting what we computed.
const RESERVED_CLAIMS: &[&str] = &[
    "iss", "aud", "sub", "client_id", "iat", "nbf", "exp", "jti", "scope", "nonce",
];

fn strip_reserved(mut claims: ClaimMap) -> ClaimMap {
    claims.retain(|name, _| !RESERVED_CLAIMS.contains(&name.as_str()));
    claims
}

fn expiry(now: i64, lifetime: std::time::Duration) -> Result<i64> {
    if lifetime.is_zero() {
        bail!("token lifetime must be greater than zero");
    }
    let lifetime = Duration::from_std(lifetime).map_err(|_| anyhow!("token lifetime out of range"))?;
    Ok(now + lifetime.num_seconds())
}

pub struct JwtTokenIssuer {
    issuer: String,
    audience: String,
    keys: Arc<SigningKeySet>,
}

impl JwtTokenIssuer {
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>, keys: Arc<SigningKeySet>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            keys,
        }
    }

    fn sign(&self, typ: &str, claims: &Claims) -> Result<SignedToken> {
        // grab the key once; a rotation mid-sign still gives us a consistent kid + key
        let key = self.keys.signing_key();
        let token = key.sign(typ, claims, claims.exp)?;
        Ok(SignedToken {
            token,
            key_id: key.kid().to_string(),
            issued_at: claims.iat,
            expires_at: claims.exp,
        })
    }
}

impl TokenIssuer for JwtTokenIssuer {
    fn issue(&self, request: AccessTokenRequest<'_>) -> Result<SignedToken> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: request.subject.map(str::to_string),
            client_id: Some(request.client_id.to_string()),
            iat: now,
            exp: expiry(now, request.lifetime)?,
            jti: Uuid::new_v4().to_string(),
            scope: Some(join_scopes(request.scopes)),
            nonce: None,
            extra: strip_reserved(request.claims),
        };

        self.sign(ACCESS_TOKEN_TYP, &claims)
    }

    fn issue_id_token(
        &self,
        subject: &str,
        client_id: &str,
        nonce: Option<&str>,
        lifetime: std::time::Duration,
        claims: ClaimMap,
    ) -> Result<SignedToken> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: self.issuer.clone(),
            aud: client_id.to_string(),
            sub: Some(subject.to_string()),
            client_id: None,
            iat: now,
            exp: expiry(now, lifetime)?,
            jti: Uuid::new_v4().to_string(),
            scope: None,
            nonce: nonce.map(str::to_string),
            extra: strip_reserved(claims),
        };

        self.sign(ID_TOKEN_TYP, &claims)
    }
}

/// Checks access tokens against the published key set. Used by the gateway, introspection
/// and userinfo; it never sees private keys.
pub struct JwtTokenValidator {
    keys: Arc<SigningKeySet>,
    validation: Validation,
}

impl JwtTokenValidator {
    pub fn new(keys: Arc<SigningKeySet>, issuer: &str, audience: &str, leeway: std::time::Duration) -> Self {
        let mut validation = Validation::new(jsonwebtoken::Algorithm::RS256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.leeway = leeway.as_secs();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.required_spec_claims = ["exp", "iss", "aud"]
            .into_iter()
            .map(str::to_string)
            .collect();

        Self { keys, validation }
    }
}

impl TokenValidator for JwtTokenValidator {
    fn validate_token(&self, token: &str) -> Result<Claims> {
        let header = decode_header(token).map_err(|e| anyhow!("Malformed JWT: {}", e))?;
        if header.typ.as_deref() != Some(ACCESS_TOKEN_TYP) {
            bail!("Not an access token (typ {:?})", header.typ);
        }
        let kid = header.kid.ok_or_else(|| anyhow!("JWT has no kid"))?;
        let key = self
            .keys
            .verification_key(&kid)
            .ok_or_else(|| anyhow!("Unknown signing key '{}'", kid))?;
        if header.alg != key.algorithm() {
            bail!("JWT algorithm {:?} doesn't match key '{}'", header.alg, kid);
        }

        let token_data = decode::<Claims>(token, key.decoding_key(), &self.validation)
            .map_err(|e| anyhow!("Invalid JWT: {}", e))?;

        Ok(token_data.claims)
    }
}
