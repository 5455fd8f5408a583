use super::traits::{CodeChallengeMethod, ScopeSet};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Fresh opaque handle for a code or refresh token: 256 random bits, base64url
pub fn new_handle() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug, Clone)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub subject_id: String,
    pub redirect_uri: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    pub scopes: ScopeSet,
    pub nonce: Option<String>,
    /// refresh tokens minted from this code join this family
    pub family_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

impl AuthorizationCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct RefreshToken {
    pub token: String,
    pub client_id: String,
    pub subject_id: String,
    pub scopes: ScopeSet,
    pub family_id: Uuid,
    /// when the family's first token was handed out (absolute expiry is measured from here)
    pub family_started_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub nonce: Option<String>,
    pub revoked: bool,
}

impl RefreshToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of trying to redeem an authorization code
#[derive(Debug, Clone)]
pub enum CodeRedemption {
    /// this caller won, the code is now consumed
    Redeemed(AuthorizationCode),
    /// someone already used it
    Replayed(AuthorizationCode),
    Unknown,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store operation '{0}' timed out")]
    Timeout(&'static str),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Backing storage for codes and refresh tokens. Whatever sits behind this has to make
/// `consume_code` and `revoke_refresh_token` atomic: concurrent callers get at most one
/// winner.
#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn store_code(&self, code: AuthorizationCode) -> Result<(), StoreError>;

    async fn consume_code(&self, code: &str) -> Result<CodeRedemption, StoreError>;

    /// Undo a redemption that couldn't finish (consumed -> unconsumed), so the client
    /// can retry after a transient fault. Refused once the code's family is revoked.
    /// Returns whether the code is redeemable again.
    async fn release_code(&self, code: &str) -> Result<bool, StoreError>;

    /// Stores the token. If its family was revoked beforehand it's stored revoked.
    async fn store_refresh_token(&self, token: RefreshToken) -> Result<(), StoreError>;

    async fn find_refresh_token(&self, token: &str) -> Result<Option<RefreshToken>, StoreError>;

    /// flips `revoked` false -> true. Returns whether this call did the flip.
    async fn revoke_refresh_token(&self, token: &str) -> Result<bool, StoreError>;

    /// Revokes every token in the family, and any that join it later
    async fn revoke_family(&self, family_id: Uuid) -> Result<usize, StoreError>;

    /// move a live token's expiry, returns false if it's gone or revoked
    async fn extend_refresh_token(
        &self,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// drop everything that expired before `now`
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// In-memory store (doesn't persist). DashMap shards its locks so two different codes
/// never wait on each other, while two redemptions of the same code serialise on the
/// entry lock.
#[derive(Clone, Default)]
pub struct MemoryGrantStore {
    codes: Arc<DashMap<String, AuthorizationCode>>,
    refresh_tokens: Arc<DashMap<String, RefreshToken>>,
    /// families revoked while something may still be minting into them
    revoked_families: Arc<DashMap<Uuid, DateTime<Utc>>>,
}

impl MemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GrantStore for MemoryGrantStore {
    async fn store_code(&self, code: AuthorizationCode) -> Result<(), StoreError> {
        self.codes.insert(code.code.clone(), code);
        Ok(())
    }

    async fn consume_code(&self, code: &str) -> Result<CodeRedemption, StoreError> {
        // consumed codes stay around until they expire so replays can be spotted
        Ok(match self.codes.get_mut(code) {
            None => CodeRedemption::Unknown,
            Some(entry) if entry.consumed => CodeRedemption::Replayed(entry.value().clone()),
            Some(mut entry) => {
                entry.consumed = true;
                CodeRedemption::Redeemed(entry.value().clone())
            }
        })
    }

    async fn release_code(&self, code: &str) -> Result<bool, StoreError> {
        let Some(mut entry) = self.codes.get_mut(code) else {
            return Ok(false);
        };
        if !entry.consumed || self.revoked_families.contains_key(&entry.family_id) {
            return Ok(false);
        }
        entry.consumed = false;
        Ok(true)
    }

    async fn store_refresh_token(&self, token: RefreshToken) -> Result<(), StoreError> {
        let handle = token.token.clone();
        let family_id = token.family_id;
        self.refresh_tokens.insert(handle.clone(), token);
        // insert first, check second: revoke_family marks first and sweeps second, so
        // one of the two always sees the other
        if self.revoked_families.contains_key(&family_id) {
            if let Some(mut entry) = self.refresh_tokens.get_mut(&handle) {
                entry.revoked = true;
            }
        }
        Ok(())
    }

    async fn find_refresh_token(&self, token: &str) -> Result<Option<RefreshToken>, StoreError> {
        Ok(self.refresh_tokens.get(token).map(|t| t.value().clone()))
    }

    async fn revoke_refresh_token(&self, token: &str) -> Result<bool, StoreError> {
        Ok(match self.refresh_tokens.get_mut(token) {
            Some(mut entry) if !entry.revoked => {
                entry.revoked = true;
                true
            }
            _ => false,
        })
    }

    async fn revoke_family(&self, family_id: Uuid) -> Result<usize, StoreError> {
        self.revoked_families.insert(family_id, Utc::now());
        let mut revoked = 0;
        for mut entry in self.refresh_tokens.iter_mut() {
            if entry.family_id == family_id && !entry.revoked {
                entry.revoked = true;
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn extend_refresh_token(
        &self,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(match self.refresh_tokens.get_mut(token) {
            Some(mut entry) if !entry.revoked => {
                entry.expires_at = expires_at;
                true
            }
            _ => false,
        })
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let before = self.codes.len() + self.refresh_tokens.len();
        self.codes.retain(|_, code| !code.is_expired(now));
        self.refresh_tokens.retain(|_, token| !token.is_expired(now));
        let after = self.codes.len() + self.refresh_tokens.len();

        // a family mark only matters while a code or token of that family is still around
        let live: HashSet<Uuid> = self
            .codes
            .iter()
            .map(|c| c.family_id)
            .chain(self.refresh_tokens.iter().map(|t| t.family_id))
            .collect();
        self.revoked_families.retain(|family, _| live.contains(family));

        Ok(before.saturating_sub(after))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Wraps a `GrantStore` with a deadline on every call and one retry for the operations
/// that are safe to repeat. Compare-and-swap operations are never retried: if the first
/// attempt timed out after it actually landed, a retry would report a false replay.
#[derive(Clone)]
pub struct GuardedStore {
    inner: Arc<dyn GrantStore>,
    timeout: Duration,
    retry_backoff: Duration,
}

impl GuardedStore {
    pub fn new(inner: Arc<dyn GrantStore>, timeout: Duration, retry_backoff: Duration) -> Self {
        Self {
            inner,
            timeout,
            retry_backoff,
        }
    }

    async fn attempt<T, Fut>(&self, op: &'static str, fut: Fut) -> Result<T, StoreError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(op)),
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, call: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match self.attempt(op, call()).await {
            Err(e) => {
                tracing::warn!("store call '{}' failed ({}), retrying once", op, e);
                tokio::time::sleep(self.retry_backoff).await;
                self.attempt(op, call()).await
            }
            ok => ok,
        }
    }

    pub async fn store_code(&self, code: AuthorizationCode) -> Result<(), StoreError> {
        self.with_retry("store_code", move || self.inner.store_code(code.clone()))
            .await
    }

    pub async fn consume_code(&self, code: &str) -> Result<CodeRedemption, StoreError> {
        self.attempt("consume_code", self.inner.consume_code(code))
            .await
    }

    pub async fn release_code(&self, code: &str) -> Result<bool, StoreError> {
        self.attempt("release_code", self.inner.release_code(code))
            .await
    }

    pub async fn store_refresh_token(&self, token: RefreshToken) -> Result<(), StoreError> {
        self.with_retry("store_refresh_token", move || {
            self.inner.store_refresh_token(token.clone())
        })
        .await
    }

    pub async fn find_refresh_token(
        &self,
        token: &str,
    ) -> Result<Option<RefreshToken>, StoreError> {
        self.with_retry("find_refresh_token", move || self.inner.find_refresh_token(token))
            .await
    }

    pub async fn revoke_refresh_token(&self, token: &str) -> Result<bool, StoreError> {
        self.attempt("revoke_refresh_token", self.inner.revoke_refresh_token(token))
            .await
    }

    /// idempotent: revoking an already-revoked family is a no-op
    pub async fn revoke_family(&self, family_id: Uuid) -> Result<usize, StoreError> {
        self.with_retry("revoke_family", move || self.inner.revoke_family(family_id))
            .await
    }

    pub async fn extend_refresh_token(
        &self,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_retry("extend_refresh_token", move || {
            self.inner.extend_refresh_token(token, expires_at)
        })
        .await
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.attempt("purge_expired", self.inner.purge_expired(now))
            .await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.attempt("ping", self.inner.ping()).await
    }
}
