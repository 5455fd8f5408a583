use super::handlers::OAuthAppState;
use super::traits::{Claims, TokenValidator};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};

// If you're perusing this code, there are like 50 bajillion RFCs about bearer tokens and
// they're all like 50 bajillion lines long. 6750 is the one that matters here

/// Pull the token out of `Authorization: Bearer <token>`. The scheme is case-insensitive.
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Validate the bearer token on a request, turning every failure into the matching
/// 401 response
pub fn authenticate_bearer(
    validator: &(dyn TokenValidator + Send + Sync),
    headers: &HeaderMap,
    realm: &str,
) -> Result<Claims, Response> {
    let Some(token) = extract_bearer(headers) else {
        return Err(unauthorized_response(realm, None));
    };

    validator.validate_token(token).map_err(|e| {
        tracing::warn!("Invalid bearer token: {}", e);
        unauthorized_response(realm, Some("invalid_token"))
    })
}

/// JWT authentication middleware - validates Bearer tokens and stashes the claims in the
/// request extensions for the handler
pub async fn jwt_auth_middleware(
    State(state): State<OAuthAppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let server = &state.server;
    match authenticate_bearer(server.validator.as_ref(), req.headers(), server.settings.base_url()) {
        Ok(claims) => {
            tracing::debug!(
                "Valid JWT for client {:?} subject {:?}",
                claims.client_id,
                claims.sub
            );
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(response) => {
            tracing::debug!("rejected {} {}", req.method(), req.uri().path());
            response
        }
    }
}

fn header_value(raw: String) -> HeaderValue {
    // realm/scope come from config and tokens we issued, so this only trips on garbage
    HeaderValue::from_str(&raw).unwrap_or_else(|_| HeaderValue::from_static("Bearer"))
}

/// 401 with a `WWW-Authenticate` challenge (RFC 6750 §3)
pub fn unauthorized_response(realm: &str, error: Option<&str>) -> Response {
    let challenge = match error {
        Some(err) => format!("Bearer realm=\"{}\", error=\"{}\"", realm, err),
        None => format!("Bearer realm=\"{}\"", realm),
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::WWW_AUTHENTICATE, header_value(challenge));
    (StatusCode::UNAUTHORIZED, headers).into_response()
}

/// 403 for a valid token that's missing scopes
pub fn forbidden_response(realm: &str, required_scope: &str) -> Response {
    let challenge = format!(
        "Bearer realm=\"{}\", error=\"insufficient_scope\", scope=\"{}\"",
        realm, required_scope
    );

    let mut headers = HeaderMap::new();
    headers.insert(header::WWW_AUTHENTICATE, header_value(challenge));
    (StatusCode::FORBIDDEN, headers).into_response()
}
