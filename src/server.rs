use crate::auth::{
    AUTHORIZE_PATH, AuthorizationServer, ClientRegistry, DISCOVERY_PATH, INTROSPECTION_PATH,
    JWKS_PATH, OAuthAppState, REVOCATION_PATH, TOKEN_PATH, USERINFO_PATH, authorize_handler,
    discovery_handler, introspection_handler, jwks_handler, jwt_auth_middleware,
    revocation_handler, token_handler, userinfo_handler,
};
use crate::gateway::{GatewayState, gateway_handler};
use anyhow::{Result, anyhow};
use axum::{
    Router,
    extract::State,
    http::{HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub const HEALTH_PATH: &str = "/health";

/// The endpoints that take client credentials. Split out so `serve` can put a tighter
/// rate limit on them.
fn credential_routes() -> Router<OAuthAppState> {
    Router::new()
        .route(TOKEN_PATH, post(token_handler))
        .route(INTROSPECTION_PATH, post(introspection_handler))
        .route(REVOCATION_PATH, post(revocation_handler))
}

fn assemble(
    state: OAuthAppState,
    gateway: GatewayState,
    credentials: Router<OAuthAppState>,
) -> Router {
    let cors = cors_layer(&state.server.clients);

    // userinfo is the one endpoint of ours that wants a bearer token
    let userinfo = Router::new()
        .route(USERINFO_PATH, get(userinfo_handler).post(userinfo_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            jwt_auth_middleware,
        ));

    // anything we don't serve ourselves goes through the gateway
    let proxy = Router::new()
        .fallback(gateway_handler)
        .with_state(gateway);

    Router::new()
        .route(AUTHORIZE_PATH, get(authorize_handler))
        .route(DISCOVERY_PATH, get(discovery_handler))
        .route(JWKS_PATH, get(jwks_handler))
        .route(HEALTH_PATH, get(health_handler))
        .merge(credentials)
        .merge(userinfo)
        .with_state(state)
        .fallback_service(proxy)
        .layer(ServiceBuilder::new().layer(cors))
}

/// Full application router, minus rate limiting (which needs real peer addresses)
pub fn router(state: OAuthAppState, gateway: GatewayState) -> Router {
    assemble(state, gateway, credential_routes())
}

/// CORS for the browser clients in the catalog. Origins come from each client's
/// `allowed_cors_origins`; anything else gets no CORS headers at all.
pub fn cors_layer(clients: &ClientRegistry) -> CorsLayer {
    let origins: Vec<HeaderValue> = clients
        .allowed_origins()
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("ignoring unusable CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

#[derive(Debug, Serialize)]
struct ComponentHealth {
    healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl ComponentHealth {
    fn up(detail: Option<String>) -> Self {
        Self {
            healthy: true,
            detail,
        }
    }

    fn down(detail: String) -> Self {
        Self {
            healthy: false,
            detail: Some(detail),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    store: ComponentHealth,
    clients: ComponentHealth,
    signing_key: ComponentHealth,
}

/// Handler for GET /health
async fn health_handler(State(state): State<OAuthAppState>) -> Response {
    let server = &state.server;

    let store = match server.store.ping().await {
        Ok(()) => ComponentHealth::up(None),
        Err(e) => {
            tracing::warn!("health check: store unavailable: {}", e);
            ComponentHealth::down(e.to_string())
        }
    };
    let clients = if server.clients.is_empty() {
        ComponentHealth::down("no clients registered".into())
    } else {
        ComponentHealth::up(Some(format!("{} clients", server.clients.len())))
    };
    // the key set can't be built without an active key, so this one only ever reports
    let signing_key = ComponentHealth::up(Some(server.keys.signing_key().kid().to_string()));

    let healthy = store.healthy && clients.healthy && signing_key.healthy;
    let report = HealthReport {
        status: if healthy { "healthy" } else { "unhealthy" },
        store,
        clients,
        signing_key,
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report)).into_response()
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub grants: usize,
    pub keys: Vec<String>,
}

/// One sweep: expired codes and refresh tokens, then retired keys nothing can still be
/// signed by
pub async fn purge_once(server: &AuthorizationServer) -> PurgeReport {
    let now = Utc::now();
    let grants = match server.store.purge_expired(now).await {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!("purge of expired grants failed: {}", e);
            0
        }
    };
    let keys = server.keys.purge_retired(now.timestamp());
    if grants > 0 {
        tracing::info!("purged {} expired codes/refresh tokens", grants);
    }
    PurgeReport { grants, keys }
}

pub fn spawn_purge_task(
    server: Arc<AuthorizationServer>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    purge_once(&server).await;
                }
                _ = cancel.cancelled() => {
                    tracing::info!("purge task stopped");
                    break;
                }
            }
        }
    })
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();
}

/// Bind, serve until Ctrl+C/SIGTERM, then drain in-flight requests and stop the
/// background tasks
pub async fn serve(
    state: OAuthAppState,
    gateway: GatewayState,
    bind_addr: &str,
    purge_interval: Duration,
) -> Result<()> {
    // Rate limiting: 10 requests per second per IP, burst of 30
    // SmartIpKeyExtractor checks x-forwarded-for and friends before falling back to peer ip,
    // so this works both behind a load balancer and when running locally
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(SmartIpKeyExtractor)
            .per_second(10)
            .burst_size(30)
            .finish()
            .ok_or_else(|| anyhow!("invalid rate limiter config"))?,
    );
    let governor_limiter = governor_conf.limiter().clone();
    let rate_limit_layer = GovernorLayer::new(governor_conf);

    // Stricter for anything that checks a client secret: 5 per second, burst of 10
    let credential_governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(SmartIpKeyExtractor)
            .per_second(5)
            .burst_size(10)
            .finish()
            .ok_or_else(|| anyhow!("invalid credential endpoint rate limiter config"))?,
    );
    let credential_limiter = credential_governor_conf.limiter().clone();
    let credential_rate_limit_layer = GovernorLayer::new(credential_governor_conf);

    let server = state.server.clone();
    let base_url = server.settings.base_url().to_string();
    let app = assemble(
        state,
        gateway.clone(),
        credential_routes().layer(credential_rate_limit_layer),
    )
    .layer(rate_limit_layer);

    let cancel = CancellationToken::new();
    let purge = spawn_purge_task(server.clone(), purge_interval, cancel.clone());

    // governor keeps per-ip state forever unless told otherwise
    let limiter_cleanup = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {
                        governor_limiter.retain_recent();
                        credential_limiter.retain_recent();
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("listening on {}", bind_addr);
    tracing::info!("issuer: {}", base_url);
    tracing::info!("discovery: {}{}", base_url, DISCOVERY_PATH);
    tracing::info!("gateway routes: {}", gateway.routes().len());

    // into_make_service_with_connect_info gives us the peer ip for rate limiting fallback
    // and X-Forwarded-For
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(cancel.clone()))
    .await;

    cancel.cancel();
    let _ = purge.await;
    let _ = limiter_cleanup.await;
    tracing::info!("shutdown complete");

    result?;
    Ok(())
}
