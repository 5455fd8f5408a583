use super::authorization_code::verify_pkce;
use super::clients::{Client, ClientRegistry};
use super::profile::{identity_claims, is_identity_scope};
use super::store::{AuthorizationCode, CodeRedemption, GuardedStore, RefreshToken, new_handle};
use super::traits::{
    AccessTokenRequest, ClaimMap, ClaimsProvider, CodeChallengeMethod, GrantType,
    RefreshTokenUsage, ScopeSet, TokenIssuer, TokenRequest, TokenResponse, join_scopes,
    parse_scopes,
};
use crate::error::OAuthError;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct GrantPolicy {
    /// a replayed code or a reused one-time refresh token kills every refresh token in
    /// its family, including ones handed out since
    pub revoke_family_on_reuse: bool,
    /// deadline for each claims provider call
    pub claims_timeout: Duration,
}

impl Default for GrantPolicy {
    fn default() -> Self {
        Self {
            revoke_family_on_reuse: true,
            claims_timeout: Duration::from_secs(2),
        }
    }
}

/// Token endpoint state machine. Each `process` call either returns a full token
/// response or a protocol error; nothing half-issued leaks out.
pub struct GrantProcessor {
    clients: Arc<ClientRegistry>,
    store: GuardedStore,
    issuer: Arc<dyn TokenIssuer + Send + Sync>,
    claims: Arc<dyn ClaimsProvider + Send + Sync>,
    policy: GrantPolicy,
}

impl GrantProcessor {
    pub fn new(
        clients: Arc<ClientRegistry>,
        store: GuardedStore,
        issuer: Arc<dyn TokenIssuer + Send + Sync>,
        claims: Arc<dyn ClaimsProvider + Send + Sync>,
        policy: GrantPolicy,
    ) -> Self {
        Self {
            clients,
            store,
            issuer,
            claims,
            policy,
        }
    }

    pub async fn process(&self, req: TokenRequest) -> Result<TokenResponse, OAuthError> {
        let grant = GrantType::parse(&req.grant_type).ok_or_else(|| {
            tracing::warn!("unsupported grant_type requested: {}", req.grant_type);
            OAuthError::UnsupportedGrantType(format!(
                "grant_type '{}' is not supported",
                req.grant_type
            ))
        })?;

        let client_id = req
            .client_id
            .as_deref()
            .ok_or_else(|| OAuthError::invalid_request("Missing required parameter: client_id"))?;
        let client = self
            .clients
            .authenticate(client_id, req.client_secret.as_deref())?;

        if !client.allows(grant) {
            tracing::warn!("client {} tried grant {} it isn't allowed", client.client_id, grant);
            return Err(OAuthError::unauthorized_client(format!(
                "Client is not allowed to use grant_type {}",
                grant
            )));
        }

        tracing::debug!("token request: grant_type={} client_id={}", grant, client.client_id);

        match grant {
            GrantType::ClientCredentials => self.client_credentials(client, &req).await,
            GrantType::AuthorizationCode => self.authorization_code(client, &req).await,
            GrantType::RefreshToken => self.refresh_token(client, &req).await,
        }
    }

    async fn client_credentials(
        &self,
        client: &Client,
        req: &TokenRequest,
    ) -> Result<TokenResponse, OAuthError> {
        let requested = parse_scopes(req.scope.as_deref());

        // machine tokens have no user, so identity scopes make no sense here
        if let Some(scope) = requested.iter().find(|s| is_identity_scope(s)) {
            return Err(OAuthError::invalid_scope(format!(
                "Scope '{}' can't be used with client_credentials",
                scope
            )));
        }

        let scopes: ScopeSet = if requested.is_empty() {
            client
                .allowed_scopes
                .iter()
                .filter(|s| !is_identity_scope(s))
                .cloned()
                .collect()
        } else {
            check_subset(&requested, &client.allowed_scopes)?;
            requested
        };
        if scopes.is_empty() {
            return Err(OAuthError::invalid_scope("No scopes could be granted"));
        }

        let response = self.mint(client, None, &scopes, ClaimMap::new(), None, None)?;
        tracing::info!(
            "Issued token via client_credentials for client: {} (scope: {})",
            client.client_id,
            join_scopes(&scopes)
        );
        Ok(response)
    }

    async fn authorization_code(
        &self,
        client: &Client,
        req: &TokenRequest,
    ) -> Result<TokenResponse, OAuthError> {
        let code = req
            .code
            .as_deref()
            .ok_or_else(|| OAuthError::invalid_request("Missing required parameter: code"))?;
        let redirect_uri = req
            .redirect_uri
            .as_deref()
            .ok_or_else(|| OAuthError::invalid_request("Missing required parameter: redirect_uri"))?;

        let grant = match self.store.consume_code(code).await? {
            CodeRedemption::Redeemed(grant) => grant,
            CodeRedemption::Replayed(grant) => {
                tracing::warn!(
                    "authorization code replayed by client {} (issued to {})",
                    client.client_id,
                    grant.client_id
                );
                self.on_reuse(grant.family_id).await;
                return Err(OAuthError::invalid_grant("Invalid or expired authorization code"));
            }
            CodeRedemption::Unknown => {
                tracing::warn!("unknown authorization code presented by {}", client.client_id);
                return Err(OAuthError::invalid_grant("Invalid or expired authorization code"));
            }
        };

        match self.exchange_code(client, req, redirect_uri, &grant).await {
            // a transient fault mustn't burn the code, or the client's retry looks like a replay
            Err(e @ OAuthError::ServerError(_)) => {
                match self.store.release_code(&grant.code).await {
                    Ok(true) => {
                        tracing::info!("released code for client {} after: {}", client.client_id, e)
                    }
                    Ok(false) => tracing::warn!(
                        "code for client {} stays consumed after: {}",
                        client.client_id,
                        e
                    ),
                    Err(release) => tracing::error!(
                        "failed to release code for client {}: {}",
                        client.client_id,
                        release
                    ),
                }
                Err(e)
            }
            result => result,
        }
    }

    /// Everything after the code has been consumed. Protocol errors here leave the code
    /// burnt; a `server_error` gets it released by the caller.
    async fn exchange_code(
        &self,
        client: &Client,
        req: &TokenRequest,
        redirect_uri: &str,
        grant: &AuthorizationCode,
    ) -> Result<TokenResponse, OAuthError> {
        let now = Utc::now();
        if grant.client_id != client.client_id {
            tracing::warn!(
                "client {} presented a code issued to {}",
                client.client_id,
                grant.client_id
            );
            return Err(OAuthError::invalid_grant("Invalid or expired authorization code"));
        }
        if grant.is_expired(now) {
            return Err(OAuthError::invalid_grant("Invalid or expired authorization code"));
        }
        if grant.redirect_uri != redirect_uri {
            tracing::warn!(
                "redirect_uri mismatch for client {}: expected '{}', got '{}'",
                client.client_id,
                grant.redirect_uri,
                redirect_uri
            );
            return Err(OAuthError::invalid_grant("redirect_uri mismatch"));
        }

        match (&grant.code_challenge, req.code_verifier.as_deref()) {
            (Some(challenge), Some(verifier)) => {
                let method = grant.code_challenge_method.unwrap_or(CodeChallengeMethod::Plain);
                if !verify_pkce(verifier, challenge, method) {
                    tracing::warn!("PKCE verification failed for client {}", client.client_id);
                    return Err(OAuthError::invalid_grant("PKCE verification failed"));
                }
            }
            (Some(_), None) => {
                return Err(OAuthError::invalid_grant("PKCE verification failed"));
            }
            (None, Some(_)) => {
                return Err(OAuthError::invalid_grant(
                    "code_verifier sent for a code issued without a challenge",
                ));
            }
            (None, None) => {}
        }

        let claims = self.subject_claims(&grant.subject_id).await?;

        let refresh = if client.allows(GrantType::RefreshToken) {
            Some(RefreshToken {
                token: new_handle(),
                client_id: client.client_id.clone(),
                subject_id: grant.subject_id.clone(),
                scopes: grant.scopes.clone(),
                family_id: grant.family_id,
                family_started_at: now,
                issued_at: now,
                expires_at: client.refresh_token_expiry(now, now),
                nonce: grant.nonce.clone(),
                revoked: false,
            })
        } else {
            None
        };

        // sign first, store last: nothing after the store call can fail
        let response = self.mint(
            client,
            Some(&grant.subject_id),
            &grant.scopes,
            claims,
            grant.nonce.as_deref(),
            refresh.as_ref().map(|t| t.token.clone()),
        )?;
        if let Some(token) = refresh {
            self.store.store_refresh_token(token).await?;
        }
        tracing::info!(
            "Issued token via authorization_code for client: {} subject: {}",
            client.client_id,
            grant.subject_id
        );
        Ok(response)
    }

    async fn refresh_token(
        &self,
        client: &Client,
        req: &TokenRequest,
    ) -> Result<TokenResponse, OAuthError> {
        let handle = req
            .refresh_token
            .as_deref()
            .ok_or_else(|| OAuthError::invalid_request("Missing required parameter: refresh_token"))?;

        let Some(current) = self.store.find_refresh_token(handle).await? else {
            tracing::warn!("unknown refresh token presented by {}", client.client_id);
            return Err(OAuthError::invalid_grant("Invalid refresh token"));
        };

        if current.client_id != client.client_id {
            tracing::warn!(
                "client {} presented a refresh token issued to {}",
                client.client_id,
                current.client_id
            );
            return Err(OAuthError::invalid_grant("Invalid refresh token"));
        }
        if current.revoked {
            tracing::warn!(
                "revoked refresh token reused by client {} (family {})",
                client.client_id,
                current.family_id
            );
            self.on_reuse(current.family_id).await;
            return Err(OAuthError::invalid_grant("Invalid refresh token"));
        }
        let now = Utc::now();
        if current.is_expired(now) {
            return Err(OAuthError::invalid_grant("Refresh token has expired"));
        }

        // a refresh can narrow the scope of the new access token, never widen it
        let requested = parse_scopes(req.scope.as_deref());
        let scopes = if requested.is_empty() {
            current.scopes.clone()
        } else {
            check_subset(&requested, &current.scopes)?;
            requested
        };

        let claims = self.subject_claims(&current.subject_id).await?;

        let (issued, successor) = match client.refresh_token_usage {
            RefreshTokenUsage::OneTime => {
                let next = RefreshToken {
                    token: new_handle(),
                    issued_at: now,
                    expires_at: client.refresh_token_expiry(current.family_started_at, now),
                    revoked: false,
                    ..current.clone()
                };
                (next.token.clone(), Some(next))
            }
            RefreshTokenUsage::Reusable => {
                let expires_at = client.refresh_token_expiry(current.family_started_at, now);
                if expires_at != current.expires_at
                    && !self.store.extend_refresh_token(handle, expires_at).await?
                {
                    return Err(OAuthError::invalid_grant("Invalid refresh token"));
                }
                (handle.to_string(), None)
            }
        };

        let response = self.mint(
            client,
            Some(&current.subject_id),
            &scopes,
            claims,
            current.nonce.as_deref(),
            Some(issued),
        )?;

        if let Some(next) = successor {
            let next_handle = next.token.clone();
            // successor in before the old handle is retired: a failed write leaves the
            // presented token usable for a retry
            self.store.store_refresh_token(next).await?;
            if !self.store.revoke_refresh_token(handle).await? {
                // somebody else rotated this exact handle first
                tracing::warn!(
                    "lost refresh rotation race for client {} (family {})",
                    client.client_id,
                    current.family_id
                );
                if let Err(e) = self.store.revoke_refresh_token(&next_handle).await {
                    tracing::error!("failed to revoke orphaned refresh token: {}", e);
                }
                self.on_reuse(current.family_id).await;
                return Err(OAuthError::invalid_grant("Invalid refresh token"));
            }
        }

        tracing::info!(
            "Issued token via refresh_token for client: {} subject: {}",
            client.client_id,
            current.subject_id
        );
        Ok(response)
    }

    /// Revoke the refresh token `handle` (and its family) if it belongs to `client`.
    /// Unknown or foreign handles are ignored, the caller always sees success.
    pub async fn revoke(&self, client: &Client, handle: &str) -> Result<(), OAuthError> {
        match self.store.find_refresh_token(handle).await? {
            Some(token) if token.client_id == client.client_id => {
                let revoked = self.store.revoke_family(token.family_id).await?;
                tracing::info!(
                    "client {} revoked refresh family {} ({} tokens)",
                    client.client_id,
                    token.family_id,
                    revoked
                );
            }
            Some(_) => {
                tracing::warn!("client {} tried to revoke a foreign refresh token", client.client_id);
            }
            None => {}
        }
        Ok(())
    }

    async fn on_reuse(&self, family_id: Uuid) {
        if !self.policy.revoke_family_on_reuse {
            return;
        }
        match self.store.revoke_family(family_id).await {
            Ok(n) => tracing::warn!("revoked refresh family {} after reuse ({} tokens)", family_id, n),
            Err(e) => tracing::error!("failed to revoke refresh family {}: {}", family_id, e),
        }
    }

    /// Active-subject check with the same deadline the token endpoint uses
    pub async fn is_active(&self, subject_id: &str) -> Result<bool, OAuthError> {
        self.ask("is_active", subject_id, self.claims.is_active(subject_id))
            .await
    }

    pub async fn enrich(&self, subject_id: &str) -> Result<ClaimMap, OAuthError> {
        self.ask("enrich", subject_id, self.claims.enrich(subject_id))
            .await
    }

    /// Active check, then enrichment. Runs before any subject token gets minted.
    async fn subject_claims(&self, subject_id: &str) -> Result<ClaimMap, OAuthError> {
        if !self.is_active(subject_id).await? {
            tracing::warn!("refusing to issue tokens for inactive subject {}", subject_id);
            return Err(OAuthError::invalid_grant("The subject is not active"));
        }
        self.enrich(subject_id).await
    }

    async fn ask<T>(
        &self,
        op: &str,
        subject_id: &str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, OAuthError> {
        match tokio::time::timeout(self.policy.claims_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::error!("claims provider {} failed for {}: {}", op, subject_id, e);
                Err(OAuthError::server_error("Profile lookup failed"))
            }
            Err(_) => {
                tracing::error!("claims provider {} timed out for {}", op, subject_id);
                Err(OAuthError::server_error("Profile lookup timed out"))
            }
        }
    }

    fn mint(
        &self,
        client: &Client,
        subject: Option<&str>,
        scopes: &ScopeSet,
        claims: ClaimMap,
        nonce: Option<&str>,
        refresh_token: Option<String>,
    ) -> Result<TokenResponse, OAuthError> {
        let id_token = match subject {
            Some(sub) if scopes.contains("openid") => Some(
                self.issuer
                    .issue_id_token(
                        sub,
                        &client.client_id,
                        nonce,
                        client.identity_token_lifetime(),
                        identity_claims(&claims, scopes),
                    )
                    .map_err(issue_failed)?
                    .token,
            ),
            _ => None,
        };

        let access = self
            .issuer
            .issue(AccessTokenRequest {
                subject,
                client_id: &client.client_id,
                scopes,
                lifetime: client.access_token_lifetime(),
                claims,
            })
            .map_err(issue_failed)?;

        Ok(TokenResponse {
            access_token: access.token,
            token_type: "Bearer".to_string(),
            expires_in: client.access_token_lifetime,
            refresh_token,
            id_token,
            scope: Some(join_scopes(scopes)),
        })
    }
}

fn issue_failed(e: anyhow::Error) -> OAuthError {
    tracing::error!("Failed to issue token: {}", e);
    OAuthError::server_error("Failed to issue token")
}

fn check_subset(requested: &ScopeSet, allowed: &ScopeSet) -> Result<(), OAuthError> {
    match requested.difference(allowed).next() {
        Some(scope) => Err(OAuthError::invalid_scope(format!(
            "Scope '{}' is not allowed",
            scope
        ))),
        None => Ok(()),
    }
}
