use chrono::Utc;
use jsonwebtoken::jwk::{Jwk, JwkSet, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("signing key '{0}' could not be loaded: {1}")]
    Load(String, String),
    #[error("no active signing key configured")]
    NoActiveKey,
    #[error("signing key '{0}' is already published")]
    Duplicate(String),
    #[error("signing key '{0}' is not published")]
    Unknown(String),
    #[error("failed to sign token: {0}")]
    Sign(String),
}

/// One RSA signing key. The private half never leaves this struct; the public half is
/// kept as a JWK for the key set endpoint and for verification.
pub struct SigningKey {
    kid: String,
    algorithm: Algorithm,
    encoding: EncodingKey,
    decoding: DecodingKey,
    jwk: Jwk,
    /// latest `exp` this key has signed, so a retired key knows when it's safe to drop
    last_expiry: AtomicI64,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("private_material", &"***REDACTED***")
            .finish()
    }
}

impl SigningKey {
    pub fn from_rsa_pem(kid: impl Into<String>, pem: &[u8]) -> Result<Self, KeyError> {
        let kid = kid.into();
        let load_err = |e: jsonwebtoken::errors::Error| KeyError::Load(kid.clone(), e.to_string());

        let algorithm = Algorithm::RS256;
        let encoding = EncodingKey::from_rsa_pem(pem).map_err(load_err)?;
        let mut jwk = Jwk::from_encoding_key(&encoding, algorithm).map_err(load_err)?;
        jwk.common.key_id = Some(kid.clone());
        jwk.common.public_key_use = Some(PublicKeyUse::Signature);
        let decoding = DecodingKey::from_jwk(&jwk).map_err(load_err)?;

        Ok(Self {
            kid,
            algorithm,
            encoding,
            decoding,
            jwk,
            last_expiry: AtomicI64::new(0),
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }

    pub fn jwk(&self) -> &Jwk {
        &self.jwk
    }

    pub fn last_expiry(&self) -> i64 {
        self.last_expiry.load(Ordering::Acquire)
    }

    /// Sign `claims` with this key, stamping `kid` and `typ` into the header
    pub fn sign<T: Serialize>(&self, typ: &str, claims: &T, expires_at: i64) -> Result<String, KeyError> {
        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.kid.clone());
        header.typ = Some(typ.to_string());

        let token = jsonwebtoken::encode(&header, claims, &self.encoding)
            .map_err(|e| KeyError::Sign(e.to_string()))?;
        self.last_expiry.fetch_max(expires_at, Ordering::AcqRel);
        Ok(token)
    }
}

#[derive(Clone)]
struct PublishedKey {
    key: Arc<SigningKey>,
    /// set once the key stops signing; it keeps verifying until its last token expires
    retired_at: Option<i64>,
}

/// Immutable snapshot of the key set. Rotation builds a new ring and swaps the pointer,
/// so readers always see a whole ring.
#[derive(Clone)]
struct KeyRing {
    active: Arc<SigningKey>,
    published: Vec<PublishedKey>,
}

impl KeyRing {
    fn find(&self, kid: &str) -> Option<&PublishedKey> {
        self.published.iter().find(|p| p.key.kid == kid)
    }
}

pub struct SigningKeySet {
    ring: RwLock<Arc<KeyRing>>,
}

impl SigningKeySet {
    /// `active` signs new tokens; `others` are published for verification only (keys that
    /// were active before a restart, or the next key being pre-published).
    pub fn new(active: SigningKey, others: Vec<SigningKey>) -> Result<Self, KeyError> {
        let active = Arc::new(active);
        let mut published = vec![PublishedKey {
            key: active.clone(),
            retired_at: None,
        }];
        for key in others {
            if published.iter().any(|p| p.key.kid == key.kid) {
                return Err(KeyError::Duplicate(key.kid));
            }
            published.push(PublishedKey {
                key: Arc::new(key),
                retired_at: None,
            });
        }

        Ok(Self {
            ring: RwLock::new(Arc::new(KeyRing { active, published })),
        })
    }

    fn snapshot(&self) -> Arc<KeyRing> {
        self.ring
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn swap(&self, update: impl FnOnce(&KeyRing) -> Result<KeyRing, KeyError>) -> Result<(), KeyError> {
        let mut guard = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        let next = update(&guard)?;
        *guard = Arc::new(next);
        Ok(())
    }

    /// the key new tokens get signed with
    pub fn signing_key(&self) -> Arc<SigningKey> {
        self.snapshot().active.clone()
    }

    /// Any published key, active or retired, by `kid`
    pub fn verification_key(&self, kid: &str) -> Option<Arc<SigningKey>> {
        self.snapshot().find(kid).map(|p| p.key.clone())
    }

    pub fn key_ids(&self) -> Vec<String> {
        self.snapshot()
            .published
            .iter()
            .map(|p| p.key.kid.clone())
            .collect()
    }

    /// Publish a key for verification without signing with it yet
    pub fn publish(&self, key: SigningKey) -> Result<(), KeyError> {
        self.swap(|ring| {
            if ring.find(&key.kid).is_some() {
                return Err(KeyError::Duplicate(key.kid.clone()));
            }
            let mut next = ring.clone();
            next.published.push(PublishedKey {
                key: Arc::new(key),
                retired_at: None,
            });
            Ok(next)
        })
    }

    /// Switch signing over to an already-published key. The previous key is retired but
    /// stays in the key set until everything it signed has expired.
    pub fn activate(&self, kid: &str) -> Result<(), KeyError> {
        let now = Utc::now().timestamp();
        self.swap(|ring| {
            let incoming = ring
                .find(kid)
                .ok_or_else(|| KeyError::Unknown(kid.to_string()))?
                .key
                .clone();
            if incoming.kid == ring.active.kid {
                return Ok(ring.clone());
            }

            let outgoing = ring.active.kid.clone();
            let published = ring
                .published
                .iter()
                .map(|p| PublishedKey {
                    key: p.key.clone(),
                    retired_at: if p.key.kid == outgoing {
                        Some(now)
                    } else if p.key.kid == incoming.kid {
                        None
                    } else {
                        p.retired_at
                    },
                })
                .collect();

            tracing::info!("signing key rotated: {} -> {}", outgoing, incoming.kid);
            Ok(KeyRing {
                active: incoming,
                published,
            })
        })
    }

    /// publish + activate in one go
    pub fn rotate(&self, key: SigningKey) -> Result<(), KeyError> {
        let kid = key.kid.clone();
        self.publish(key)?;
        self.activate(&kid)
    }

    /// Drop retired keys whose last token has expired. Returns the purged key ids.
    pub fn purge_retired(&self, now: i64) -> Vec<String> {
        let mut purged = Vec::new();
        // swap can't fail here, the closure always returns Ok
        let _ = self.swap(|ring| {
            let mut next = ring.clone();
            next.published.retain(|p| {
                let expired = p.retired_at.is_some() && p.key.last_expiry() < now;
                if expired {
                    purged.push(p.key.kid.clone());
                }
                !expired
            });
            Ok(next)
        });

        for kid in &purged {
            tracing::info!("purged retired signing key {}", kid);
        }
        purged
    }

    /// Public halves of every published key, for the JWKS endpoint
    pub fn jwks(&self) -> JwkSet {
        JwkSet {
            keys: self
                .snapshot()
                .published
                .iter()
                .map(|p| p.key.jwk.clone())
                .collect(),
        }
    }
}
