use super::handlers::OAuthAppState;
use super::store::{AuthorizationCode, new_handle};
use super::traits::{CodeChallengeMethod, GrantType, ResourceOwnerAuthenticator, parse_scopes};
use crate::error::OAuthError;
use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderName, StatusCode, header::InvalidHeaderName},
    response::{IntoResponse, Redirect, Response},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use url::Url;
use uuid::Uuid;

/// Every field is optional so a bad request still gets a proper OAuth error redirect
/// instead of axum's generic 400
#[derive(Debug, Default, Deserialize)]
pub struct AuthorizationRequest {
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub response_type: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
}

/// Reads the end user from a header set by whatever sits in front of us and did the
/// actual login. Only safe if that proxy strips the header from inbound requests.
pub struct TrustedHeaderAuthenticator {
    header: HeaderName,
}

impl TrustedHeaderAuthenticator {
    pub const DEFAULT_HEADER: &'static str = "x-authenticated-subject";

    pub fn new(header: &str) -> Result<Self, InvalidHeaderName> {
        Ok(Self {
            header: HeaderName::try_from(header)?,
        })
    }
}

#[async_trait]
impl ResourceOwnerAuthenticator for TrustedHeaderAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// GET /connect/authorize
pub async fn authorize_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
    Query(req): Query<AuthorizationRequest>,
) -> Response {
    let server = &state.server;
    tracing::info!(
        "Authorization request from client_id={:?}, redirect_uri={:?}",
        req.client_id,
        req.redirect_uri
    );

    // validate client + redirect_uri BEFORE we redirect anywhere
    // this prevents open redirect attacks
    let Some(client) = req.client_id.as_deref().and_then(|id| server.clients.lookup(id)) else {
        tracing::warn!("authorize request for unknown client {:?}", req.client_id);
        return (StatusCode::BAD_REQUEST, "unknown client_id").into_response();
    };
    let redirect_uri = match req.redirect_uri.as_deref() {
        Some(uri) if server.clients.is_redirect_uri_allowed(&client.client_id, uri) => uri,
        other => {
            tracing::warn!(
                "rejected redirect_uri {:?} for client '{}'",
                other,
                client.client_id
            );
            // DON'T redirect to the invalid URI - return an error page instead
            return (StatusCode::BAD_REQUEST, "invalid redirect_uri").into_response();
        }
    };
    let client_state = req.state.as_deref();
    let fail = |err: OAuthError| error_redirect(redirect_uri, &err, client_state);

    if req.response_type.as_deref() != Some("code") {
        return fail(OAuthError::UnsupportedResponseType(
            "Only response_type=code is supported".into(),
        ));
    }
    if !client.allows(GrantType::AuthorizationCode) {
        return fail(OAuthError::unauthorized_client(
            "Client is not allowed to use the authorization code flow",
        ));
    }

    let scopes = parse_scopes(req.scope.as_deref());
    if scopes.is_empty() {
        return fail(OAuthError::invalid_scope("Missing required parameter: scope"));
    }
    if let Some(scope) = scopes.difference(&client.allowed_scopes).next() {
        return fail(OAuthError::invalid_scope(format!("Scope '{}' is not allowed", scope)));
    }

    let challenge = match challenge_for(client.require_pkce, client.allow_plain_text_pkce, &req) {
        Ok(c) => c,
        Err(e) => return fail(e),
    };

    let Some(subject_id) = server.authenticator.authenticate(&headers).await else {
        return fail(OAuthError::LoginRequired("The end user is not signed in".into()));
    };
    match server.grants.is_active(&subject_id).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!("inactive subject {} tried to authorize {}", subject_id, client.client_id);
            return fail(OAuthError::AccessDenied("The account is not active".into()));
        }
        Err(e) => return fail(e),
    }

    let now = Utc::now();
    let lifetime = chrono::Duration::from_std(server.settings.authorization_code_lifetime)
        .unwrap_or_else(|_| chrono::Duration::minutes(5));
    let (code_challenge, code_challenge_method) = challenge.unzip();
    let code = AuthorizationCode {
        code: new_handle(),
        client_id: client.client_id.clone(),
        subject_id: subject_id.clone(),
        redirect_uri: redirect_uri.to_string(),
        code_challenge,
        code_challenge_method,
        scopes,
        nonce: req.nonce.clone(),
        family_id: Uuid::new_v4(),
        issued_at: now,
        expires_at: now + lifetime,
        consumed: false,
    };
    let handle = code.code.clone();
    if let Err(e) = server.store.store_code(code).await {
        return fail(e.into());
    }

    tracing::info!(
        "Authorization granted for client_id={} subject={}",
        client.client_id,
        subject_id
    );

    redirect_with(redirect_uri, &[("code", handle.as_str())], client_state)
}

/// Works out the PKCE challenge to bind to the code, per the client's settings
fn challenge_for(
    require_pkce: bool,
    allow_plain: bool,
    req: &AuthorizationRequest,
) -> Result<Option<(String, CodeChallengeMethod)>, OAuthError> {
    let Some(challenge) = req.code_challenge.as_deref() else {
        if require_pkce {
            return Err(OAuthError::invalid_request("code_challenge is required"));
        }
        return Ok(None);
    };

    // RFC 7636 §4.2: absent method means plain
    let method = match req.code_challenge_method.as_deref() {
        None => CodeChallengeMethod::Plain,
        Some(raw) => CodeChallengeMethod::parse(raw).ok_or_else(|| {
            OAuthError::invalid_request(format!("Unsupported code_challenge_method '{}'", raw))
        })?,
    };
    if method == CodeChallengeMethod::Plain && !allow_plain {
        return Err(OAuthError::invalid_request(
            "Transform algorithm not supported, use S256",
        ));
    }
    if !(43..=128).contains(&challenge.len()) {
        return Err(OAuthError::invalid_request("code_challenge must be 43-128 characters"));
    }

    Ok(Some((challenge.to_string(), method)))
}

/// PKCE verification (RFC 7636 §4.6)
pub fn verify_pkce(code_verifier: &str, code_challenge: &str, method: CodeChallengeMethod) -> bool {
    let computed = match method {
        CodeChallengeMethod::S256 => {
            let mut hasher = Sha256::new();
            hasher.update(code_verifier.as_bytes());
            URL_SAFE_NO_PAD.encode(hasher.finalize())
        }
        CodeChallengeMethod::Plain => code_verifier.to_string(),
    };
    computed.as_bytes().ct_eq(code_challenge.as_bytes()).into()
}

fn redirect_with(redirect_uri: &str, params: &[(&str, &str)], state: Option<&str>) -> Response {
    // redirect_uri was matched against the registry, which only holds parseable URLs
    let Ok(mut url) = Url::parse(redirect_uri) else {
        return (StatusCode::BAD_REQUEST, "invalid redirect_uri").into_response();
    };
    {
        let mut query = url.query_pairs_mut();
        for (k, v) in params {
            query.append_pair(k, v);
        }
        if let Some(s) = state {
            query.append_pair("state", s);
        }
    }
    Redirect::temporary(url.as_str()).into_response()
}

fn error_redirect(redirect_uri: &str, err: &OAuthError, state: Option<&str>) -> Response {
    tracing::warn!("authorize request rejected: {}", err);
    redirect_with(
        redirect_uri,
        &[("error", err.code()), ("error_description", err.description())],
        state,
    )
}
