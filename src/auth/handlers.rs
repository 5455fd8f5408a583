use super::AuthorizationServer;
use super::clients::Client;
use super::middleware::{forbidden_response, unauthorized_response};
use super::profile::identity_claims;
use super::traits::{ClaimMap, Claims, TokenRequest, TokenResponse, join_scopes};
use crate::error::OAuthError;
use axum::{
    Extension, Form,
    extract::{State, rejection::FormRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const AUTHORIZE_PATH: &str = "/connect/authorize";
pub const TOKEN_PATH: &str = "/connect/token";
pub const INTROSPECTION_PATH: &str = "/connect/introspect";
pub const REVOCATION_PATH: &str = "/connect/revocation";
pub const USERINFO_PATH: &str = "/connect/userinfo";
pub const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";
pub const JWKS_PATH: &str = "/.well-known/openid-configuration/jwks";

/// Combined OAuth state for all handlers
#[derive(Clone)]
pub struct OAuthAppState {
    pub server: Arc<AuthorizationServer>,
}

fn no_store() -> [(header::HeaderName, HeaderValue); 2] {
    [
        (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
        (header::PRAGMA, HeaderValue::from_static("no-cache")),
    ]
}

/// Client credentials from `Authorization: Basic` (client_secret_basic). Both halves are
/// form-urlencoded before base64 (RFC 6749 §2.3.1).
fn basic_credentials(headers: &HeaderMap) -> Result<Option<(String, String)>, OAuthError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let malformed = || OAuthError::invalid_client("Malformed Basic authorization header");

    let value = value.to_str().map_err(|_| malformed())?;
    let Some((scheme, encoded)) = value.split_once(' ') else {
        return Err(malformed());
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return Ok(None);
    }

    let decoded = BASE64.decode(encoded.trim()).map_err(|_| malformed())?;
    let decoded = String::from_utf8(decoded).map_err(|_| malformed())?;
    let (id, secret) = decoded.split_once(':').ok_or_else(malformed)?;
    Ok(Some((form_decode(id), form_decode(secret))))
}

fn form_decode(raw: &str) -> String {
    // a bare '=' or '&' here is literal, not a separator
    let escaped = raw.replace('&', "%26").replace('=', "%3D");
    url::form_urlencoded::parse(escaped.as_bytes())
        .next()
        .map(|(k, _)| k.into_owned())
        .unwrap_or_default()
}

/// Merge Basic credentials with whatever came in the form. Using both methods at once
/// is refused (RFC 6749 §2.3).
fn client_auth(
    headers: &HeaderMap,
    form_id: Option<String>,
    form_secret: Option<String>,
) -> Result<(Option<String>, Option<String>), OAuthError> {
    match basic_credentials(headers)? {
        Some((id, secret)) => {
            if form_secret.is_some() {
                return Err(OAuthError::invalid_request(
                    "Multiple client authentication methods used",
                ));
            }
            if form_id.as_deref().is_some_and(|f| f != id) {
                return Err(OAuthError::invalid_client("client_id mismatch"));
            }
            Ok((Some(id), Some(secret)))
        }
        None => Ok((form_id, form_secret)),
    }
}

fn form_error(rejection: FormRejection) -> OAuthError {
    tracing::warn!("rejected malformed form body: {}", rejection);
    OAuthError::invalid_request(format!("Malformed request body: {}", rejection.body_text()))
}

/// Handler for POST /connect/token
pub async fn token_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> Response {
    match issue_tokens(&state.server, &headers, form).await {
        Ok(tokens) => (StatusCode::OK, no_store(), Json(tokens)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn issue_tokens(
    server: &AuthorizationServer,
    headers: &HeaderMap,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> Result<TokenResponse, OAuthError> {
    let Form(mut req) = form.map_err(form_error)?;
    tracing::info!("Token request: grant_type={}", req.grant_type);

    let (client_id, client_secret) =
        client_auth(headers, req.client_id.take(), req.client_secret.take())?;
    req.client_id = client_id;
    req.client_secret = client_secret;

    server.grants.process(req).await
}

/// Tokens-holding endpoints other than /token share this shape
#[derive(Debug, Default, Deserialize)]
pub struct TokenLookupRequest {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_type_hint: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

fn authenticate_caller<'a>(
    server: &'a AuthorizationServer,
    headers: &HeaderMap,
    req: &mut TokenLookupRequest,
) -> Result<&'a Client, OAuthError> {
    let (id, secret) = client_auth(headers, req.client_id.take(), req.client_secret.take())?;
    let id = id.ok_or_else(|| OAuthError::invalid_client("Client authentication failed"))?;
    server.clients.authenticate(&id, secret.as_deref())
}

/// RFC 7662 response. Inactive tokens are just `{"active": false}`.
#[derive(Debug, Default, Serialize)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

impl From<Claims> for IntrospectionResponse {
    fn from(claims: Claims) -> Self {
        Self {
            active: true,
            scope: claims.scope,
            client_id: claims.client_id,
            sub: claims.sub,
            token_type: Some("access_token"),
            exp: Some(claims.exp),
            iat: Some(claims.iat),
            iss: Some(claims.iss),
            aud: Some(claims.aud),
            jti: Some(claims.jti),
        }
    }
}

/// Handler for POST /connect/introspect
pub async fn introspection_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
    form: Result<Form<TokenLookupRequest>, FormRejection>,
) -> Response {
    match introspect(&state.server, &headers, form).await {
        Ok(body) => (StatusCode::OK, no_store(), Json(body)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn introspect(
    server: &AuthorizationServer,
    headers: &HeaderMap,
    form: Result<Form<TokenLookupRequest>, FormRejection>,
) -> Result<IntrospectionResponse, OAuthError> {
    let Form(mut req) = form.map_err(form_error)?;
    let caller = authenticate_caller(server, headers, &mut req)?;
    // public clients can't prove who they are, so they don't get to ask
    if caller.is_public() {
        tracing::warn!("public client {} tried to introspect", caller.client_id);
        return Err(OAuthError::invalid_client("Client authentication failed"));
    }
    let hinted_refresh = req.token_type_hint.as_deref() == Some("refresh_token");
    let token = req
        .token
        .ok_or_else(|| OAuthError::invalid_request("Missing required parameter: token"))?;

    if !hinted_refresh {
        if let Ok(claims) = server.validate_token(&token) {
            return Ok(claims.into());
        }
    }

    // refresh tokens are only visible to the client that owns them
    let now = Utc::now();
    match server.store.find_refresh_token(&token).await? {
        Some(rt) if rt.client_id == caller.client_id && !rt.revoked && !rt.is_expired(now) => {
            Ok(IntrospectionResponse {
                active: true,
                scope: Some(join_scopes(&rt.scopes)),
                client_id: Some(rt.client_id),
                sub: Some(rt.subject_id),
                token_type: Some("refresh_token"),
                exp: Some(rt.expires_at.timestamp()),
                iat: Some(rt.issued_at.timestamp()),
                ..Default::default()
            })
        }
        // the hint was wrong, fall back to treating it as an access token
        _ if hinted_refresh => Ok(server
            .validate_token(&token)
            .map(IntrospectionResponse::from)
            .unwrap_or_default()),
        _ => Ok(IntrospectionResponse::default()),
    }
}

/// Handler for POST /connect/revocation (RFC 7009). Unknown tokens still get a 200.
pub async fn revocation_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
    form: Result<Form<TokenLookupRequest>, FormRejection>,
) -> Response {
    match revoke(&state.server, &headers, form).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn revoke(
    server: &AuthorizationServer,
    headers: &HeaderMap,
    form: Result<Form<TokenLookupRequest>, FormRejection>,
) -> Result<(), OAuthError> {
    let Form(mut req) = form.map_err(form_error)?;
    let caller = authenticate_caller(server, headers, &mut req)?;
    let token = req
        .token
        .ok_or_else(|| OAuthError::invalid_request("Missing required parameter: token"))?;

    // access tokens are self-contained and can't be recalled, only refresh tokens
    server.grants.revoke(caller, &token).await
}

/// Handler for GET /connect/userinfo, mounted behind `jwt_auth_middleware`
pub async fn userinfo_handler(
    State(state): State<OAuthAppState>,
    Extension(claims): Extension<Claims>,
) -> Response {
    let server = &state.server;
    let scopes = claims.scopes();
    let Some(subject) = claims.sub.as_deref().filter(|_| scopes.contains("openid")) else {
        return forbidden_response(server.settings.base_url(), "openid");
    };

    let profile = match server.grants.is_active(subject).await {
        Ok(true) => server.grants.enrich(subject).await,
        Ok(false) => {
            return unauthorized_response(
                server.settings.base_url(),
                Some("invalid_token"),
            );
        }
        Err(e) => Err(e),
    };

    match profile {
        Ok(profile) => {
            let mut body: ClaimMap = identity_claims(&profile, &scopes);
            body.insert("sub".into(), Value::String(subject.to_string()));
            (StatusCode::OK, no_store(), Json(body)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// OpenID Provider Metadata (OIDC Discovery §3, RFC 8414)
#[derive(Debug, Serialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    pub userinfo_endpoint: String,
    pub introspection_endpoint: String,
    pub revocation_endpoint: String,
    pub scopes_supported: Vec<String>,
    pub claims_supported: Vec<&'static str>,
    pub grant_types_supported: Vec<&'static str>,
    pub response_types_supported: Vec<&'static str>,
    pub response_modes_supported: Vec<&'static str>,
    pub subject_types_supported: Vec<&'static str>,
    pub id_token_signing_alg_values_supported: Vec<&'static str>,
    pub token_endpoint_auth_methods_supported: Vec<&'static str>,
    pub introspection_endpoint_auth_methods_supported: Vec<&'static str>,
    pub revocation_endpoint_auth_methods_supported: Vec<&'static str>,
    pub code_challenge_methods_supported: Vec<&'static str>,
}

/// Handler for GET /.well-known/openid-configuration
pub async fn discovery_handler(State(state): State<OAuthAppState>) -> Response {
    let server = &state.server;
    let base = server.settings.base_url();
    let url = |path: &str| format!("{}{}", base, path);

    let document = DiscoveryDocument {
        issuer: server.settings.issuer.clone(),
        authorization_endpoint: url(AUTHORIZE_PATH),
        token_endpoint: url(TOKEN_PATH),
        jwks_uri: url(JWKS_PATH),
        userinfo_endpoint: url(USERINFO_PATH),
        introspection_endpoint: url(INTROSPECTION_PATH),
        revocation_endpoint: url(REVOCATION_PATH),
        scopes_supported: server.clients.known_scopes().into_iter().collect(),
        claims_supported: vec![
            "sub", "first_name", "last_name", "email", "user_id", "tenant_id", "role",
        ],
        grant_types_supported: vec!["authorization_code", "client_credentials", "refresh_token"],
        response_types_supported: vec!["code"],
        response_modes_supported: vec!["query"],
        subject_types_supported: vec!["public"],
        id_token_signing_alg_values_supported: vec!["RS256"],
        token_endpoint_auth_methods_supported: vec![
            "client_secret_basic",
            "client_secret_post",
            "none",
        ],
        introspection_endpoint_auth_methods_supported: vec![
            "client_secret_basic",
            "client_secret_post",
        ],
        revocation_endpoint_auth_methods_supported: vec![
            "client_secret_basic",
            "client_secret_post",
            "none",
        ],
        code_challenge_methods_supported: vec!["plain", "S256"],
    };

    tracing::debug!("Serving discovery document");
    (StatusCode::OK, Json(document)).into_response()
}

/// Handler for GET /.well-known/openid-configuration/jwks
pub async fn jwks_handler(State(state): State<OAuthAppState>) -> Response {
    let jwks = state.server.keys.jwks();
    // short enough that a rotation shows up before the old key's tokens run out
    let cache = [(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=300"),
    )];
    (StatusCode::OK, cache, Json(jwks)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestFixture, pkce_pair};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn send(fx: &TestFixture, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = fx.app().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, json)
    }

    fn form_post(path: &str, body: &[(&str, &str)], basic: Option<(&str, &str)>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some((id, secret)) = basic {
            let encoded = BASE64.encode(format!("{}:{}", id, secret));
            builder = builder.header(header::AUTHORIZATION, format!("Basic {}", encoded));
        }
        builder
            .body(Body::from(serde_urlencoded::to_string(body).unwrap()))
            .unwrap()
    }

    fn get(path: &str, bearer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(path);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn basic_credentials_are_form_decoded() {
        let mut headers = HeaderMap::new();
        let encoded = BASE64.encode("my%20client:p%40ss=word");
        headers.insert(header::AUTHORIZATION, format!("Basic {}", encoded).parse().unwrap());
        assert_eq!(
            basic_credentials(&headers).unwrap(),
            Some(("my client".into(), "p@ss=word".into()))
        );

        headers.insert(header::AUTHORIZATION, "Basic !!!".parse().unwrap());
        assert_eq!(basic_credentials(&headers).unwrap_err().code(), "invalid_client");
    }

    #[tokio::test]
    async fn client_credentials_over_post_and_basic() {
        let fx = TestFixture::new();

        let (status, headers, body) = send(
            &fx,
            form_post(
                TOKEN_PATH,
                &[("grant_type", "client_credentials"), ("client_id", "client"), ("client_secret", "secret")],
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CACHE_CONTROL], "no-store");
        assert_eq!(body["token_type"], "Bearer");
        assert_eq!(body["expires_in"], 3600);
        assert!(body.get("refresh_token").is_none());

        let (status, _, body) = send(
            &fx,
            form_post(TOKEN_PATH, &[("grant_type", "client_credentials")], Some(("client", "secret"))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["access_token"].is_string());
    }

    #[tokio::test]
    async fn token_endpoint_errors_are_rfc_shaped() {
        let fx = TestFixture::new();

        let (status, headers, body) = send(
            &fx,
            form_post(TOKEN_PATH, &[("grant_type", "client_credentials")], Some(("client", "wrong"))),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_client");
        assert!(headers.contains_key(header::WWW_AUTHENTICATE));

        let (status, _, body) = send(
            &fx,
            form_post(TOKEN_PATH, &[("grant_type", "password"), ("client_id", "nextjs")], None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "unsupported_grant_type");

        // no grant_type at all
        let (status, _, body) = send(&fx, form_post(TOKEN_PATH, &[("client_id", "nextjs")], None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        // secret in both the header and the body
        let (status, _, body) = send(
            &fx,
            form_post(
                TOKEN_PATH,
                &[("grant_type", "client_credentials"), ("client_secret", "secret")],
                Some(("client", "secret")),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn discovery_points_at_our_endpoints() {
        let fx = TestFixture::new();
        let (status, _, body) = send(&fx, get(DISCOVERY_PATH, None)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["issuer"], fx.server.settings.issuer);
        assert_eq!(
            body["jwks_uri"],
            format!("{}{}", fx.server.settings.base_url(), JWKS_PATH)
        );
        assert_eq!(
            body["token_endpoint"],
            format!("{}{}", fx.server.settings.base_url(), TOKEN_PATH)
        );
        let grants: Vec<&str> = body["grant_types_supported"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(grants.contains(&"client_credentials"));
        assert!(grants.contains(&"authorization_code"));
        assert!(grants.contains(&"refresh_token"));
        assert_eq!(body["id_token_signing_alg_values_supported"][0], "RS256");
    }

    #[tokio::test]
    async fn jwks_publishes_one_entry_per_key() {
        let fx = TestFixture::new();
        let (status, headers, body) = send(&fx, get(JWKS_PATH, None)).await;

        assert_eq!(status, StatusCode::OK);
        assert!(headers[header::CACHE_CONTROL].to_str().unwrap().contains("max-age"));
        let keys = body["keys"].as_array().unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0]["kid"], fx.server.keys.signing_key().kid());
        assert!(keys[0].get("d").is_none());
    }

    #[tokio::test]
    async fn introspection_reports_access_and_refresh_tokens() {
        let fx = TestFixture::new();
        let access = fx.client_token("api1");
        let login = fx.login("nextjs", "alice", "openid api1").await;
        let refresh = login.refresh_token.unwrap();

        let (status, _, body) = send(
            &fx,
            form_post(INTROSPECTION_PATH, &[("token", access.as_str())], Some(("client", "secret"))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active"], true);
        assert_eq!(body["client_id"], "client");
        assert_eq!(body["scope"], "api1");
        assert_eq!(body["token_type"], "access_token");

        // "client" doesn't own this refresh token, so it looks dead from there
        let (_, _, body) = send(
            &fx,
            form_post(
                INTROSPECTION_PATH,
                &[("token", refresh.as_str()), ("token_type_hint", "refresh_token")],
                Some(("client", "secret")),
            ),
        )
        .await;
        assert_eq!(body, serde_json::json!({ "active": false }));

        let (_, _, body) = send(
            &fx,
            form_post(INTROSPECTION_PATH, &[("token", "garbage")], Some(("client", "secret"))),
        )
        .await;
        assert_eq!(body["active"], false);

        // public clients can't introspect
        let (status, _, _) = send(
            &fx,
            form_post(INTROSPECTION_PATH, &[("token", access.as_str()), ("client_id", "nextjs")], None),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn revocation_always_succeeds_and_kills_the_family() {
        let fx = TestFixture::new();
        let login = fx.login("nextjs", "alice", "api1").await;
        let refresh = login.refresh_token.unwrap();

        let (status, _, _) = send(
            &fx,
            form_post(REVOCATION_PATH, &[("token", "unknown"), ("client_id", "nextjs")], None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, _) = send(
            &fx,
            form_post(REVOCATION_PATH, &[("token", refresh.as_str()), ("client_id", "nextjs")], None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = send(
            &fx,
            form_post(
                TOKEN_PATH,
                &[("grant_type", "refresh_token"), ("client_id", "nextjs"), ("refresh_token", refresh.as_str())],
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_grant");
    }

    #[tokio::test]
    async fn userinfo_needs_openid_and_filters_by_scope() {
        let fx = TestFixture::new();

        let (status, headers, _) = send(&fx, get(USERINFO_PATH, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(headers.contains_key(header::WWW_AUTHENTICATE));

        let machine = fx.client_token("api1");
        let (status, _, _) = send(&fx, get(USERINFO_PATH, Some(&machine))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let user = fx.login("nextjs", "alice", "openid email").await.access_token;
        let (status, _, body) = send(&fx, get(USERINFO_PATH, Some(&user))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sub"], "alice");
        assert_eq!(body["email"], "alice@example.com");
        assert!(body.get("role").is_none());
    }

    #[tokio::test]
    async fn full_code_flow_over_http() {
        let fx = TestFixture::new();
        let (verifier, challenge) = pkce_pair();
        let code = fx.seed_code("nextjs", "alice", "openid profile api1", &challenge).await;

        let exchange = [
            ("grant_type", "authorization_code"),
            ("client_id", "nextjs"),
            ("code", code.as_str()),
            ("code_verifier", verifier.as_str()),
            ("redirect_uri", crate::test_support::NEXTJS_REDIRECT),
        ];
        let (status, _, body) = send(&fx, form_post(TOKEN_PATH, &exchange, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["expires_in"], 3600);
        assert!(body["refresh_token"].is_string());
        assert!(body["id_token"].is_string());

        let (status, _, body) = send(&fx, form_post(TOKEN_PATH, &exchange, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_grant");
    }
}
