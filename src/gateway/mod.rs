mod proxy;
mod routes;

pub use routes::{Route, RouteEntry, RouteError, RouteTable};

use routes::has_dot_segment;

use crate::auth::{TokenValidator, authenticate_bearer, forbidden_response, join_scopes};
use anyhow::Result;
use axum::{
    extract::{Request, State},
    http::{Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// realm in the `WWW-Authenticate` challenges we send back
    pub realm: String,
    pub upstream_timeout: Duration,
    pub max_body_bytes: usize,
}

#[derive(Clone)]
pub struct GatewayState {
    routes: Arc<RouteTable>,
    validator: Arc<dyn TokenValidator + Send + Sync>,
    http: reqwest::Client,
    settings: GatewaySettings,
}

impl GatewayState {
    pub fn new(
        routes: RouteTable,
        validator: Arc<dyn TokenValidator + Send + Sync>,
        settings: GatewaySettings,
    ) -> Result<Self> {
        // redirects from a backend belong to the caller, don't chase them ourselves
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            routes: Arc::new(routes),
            validator,
            http,
            settings,
        })
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }
}

fn is_preflight(request: &Request) -> bool {
    request.method() == Method::OPTIONS
        && request
            .headers()
            .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
}

/// Fallback for everything the authorization server doesn't answer itself: find the
/// route, check the bearer token and scopes, then proxy.
pub async fn gateway_handler(State(state): State<GatewayState>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    // the route has to be picked on the same path the backend will see
    if has_dot_segment(&path) {
        tracing::warn!("refusing dot segments in {} {}", request.method(), path);
        return (StatusCode::BAD_REQUEST, "Dot segments are not allowed in the path").into_response();
    }
    let Some(route) = state.routes.resolve(&path) else {
        tracing::debug!("no route for {} {}", request.method(), path);
        return StatusCode::NOT_FOUND.into_response();
    };

    // browsers never attach credentials to a preflight
    if route.entry.requires_auth && !is_preflight(&request) {
        let claims = match authenticate_bearer(
            state.validator.as_ref(),
            request.headers(),
            &state.settings.realm,
        ) {
            Ok(claims) => claims,
            Err(response) => {
                tracing::debug!("gateway rejected {} {}", request.method(), path);
                return response;
            }
        };

        let required = &route.entry.required_scopes;
        if !required.is_subset(&claims.scopes()) {
            tracing::warn!(
                "client {:?} lacks scopes for {} (needs {:?}, has {:?})",
                claims.client_id,
                path,
                required,
                claims.scope
            );
            return forbidden_response(&state.settings.realm, &join_scopes(required));
        }
    }

    proxy::forward(&state, route, request).await
}
