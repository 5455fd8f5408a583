use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Protocol errors from RFC 6749 §5.2 (plus the authorize-endpoint codes from §4.1.2.1
/// and OIDC Core §3.1.2.6). The description is shown to the caller, so keep it free of
/// anything sensitive.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OAuthError {
    #[error("invalid_request: {0}")]
    InvalidRequest(String),
    #[error("invalid_client: {0}")]
    InvalidClient(String),
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),
    #[error("unauthorized_client: {0}")]
    UnauthorizedClient(String),
    #[error("unsupported_grant_type: {0}")]
    UnsupportedGrantType(String),
    #[error("invalid_scope: {0}")]
    InvalidScope(String),
    #[error("unsupported_response_type: {0}")]
    UnsupportedResponseType(String),
    #[error("access_denied: {0}")]
    AccessDenied(String),
    #[error("login_required: {0}")]
    LoginRequired(String),
    #[error("server_error: {0}")]
    ServerError(String),
}

impl OAuthError {
    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::InvalidRequest(description.into())
    }

    pub fn invalid_client(description: impl Into<String>) -> Self {
        Self::InvalidClient(description.into())
    }

    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self::InvalidGrant(description.into())
    }

    pub fn invalid_scope(description: impl Into<String>) -> Self {
        Self::InvalidScope(description.into())
    }

    pub fn unauthorized_client(description: impl Into<String>) -> Self {
        Self::UnauthorizedClient(description.into())
    }

    pub fn server_error(description: impl Into<String>) -> Self {
        Self::ServerError(description.into())
    }

    /// The `error` code on the wire
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidClient(_) => "invalid_client",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::UnauthorizedClient(_) => "unauthorized_client",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::InvalidScope(_) => "invalid_scope",
            Self::UnsupportedResponseType(_) => "unsupported_response_type",
            Self::AccessDenied(_) => "access_denied",
            Self::LoginRequired(_) => "login_required",
            Self::ServerError(_) => "server_error",
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Self::InvalidRequest(d)
            | Self::InvalidClient(d)
            | Self::InvalidGrant(d)
            | Self::UnauthorizedClient(d)
            | Self::UnsupportedGrantType(d)
            | Self::InvalidScope(d)
            | Self::UnsupportedResponseType(d)
            | Self::AccessDenied(d)
            | Self::LoginRequired(d)
            | Self::ServerError(d) => d,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidClient(_) => StatusCode::UNAUTHORIZED,
            Self::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<crate::auth::StoreError> for OAuthError {
    fn from(err: crate::auth::StoreError) -> Self {
        tracing::error!("grant store failure: {}", err);
        Self::ServerError("the grant store is temporarily unavailable".to_string())
    }
}

/// OAuth 2.0 error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        if matches!(self, Self::InvalidClient(_)) {
            headers.insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"idam\""),
            );
        }

        let body = ErrorResponse {
            error: self.code().to_string(),
            error_description: Some(self.description().to_string()),
        };
        (self.status(), headers, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn invalid_client_is_401_with_basic_challenge() {
        let response = OAuthError::invalid_client("Client authentication failed").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "invalid_client");
        assert_eq!(json["error_description"], "Client authentication failed");
    }

    #[test]
    fn protocol_errors_map_to_bad_request() {
        for err in [
            OAuthError::invalid_request("x"),
            OAuthError::invalid_grant("x"),
            OAuthError::invalid_scope("x"),
            OAuthError::unauthorized_client("x"),
            OAuthError::UnsupportedGrantType("x".into()),
        ] {
            assert_eq!(err.status(), StatusCode::BAD_REQUEST, "{}", err.code());
        }
        assert_eq!(
            OAuthError::server_error("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
