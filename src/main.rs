mod auth;
mod config;
mod error;
mod gateway;
mod server;

#[cfg(test)]
mod test_support;

use anyhow::Result;
use auth::{
    AuthorizationServer, ClaimsProvider, HttpProfileService, MemoryGrantStore, OAuthAppState,
    StaticProfileStore, TrustedHeaderAuthenticator,
};
use clap::Parser;
use config::{Args, Catalog};
use gateway::GatewayState;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "idam=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // anything wrong with the config is fatal, we'd rather not start than start half-keyed
    if let Err(e) = args.validate() {
        tracing::error!("Configuration error: {}", e);
        return Err(e.into());
    }
    tracing::info!("Loading catalog from {}", args.catalog.display());
    let catalog = match Catalog::load(&args.catalog) {
        Ok(catalog) => catalog,
        Err(e) => {
            tracing::error!("Catalog error: {}", e);
            return Err(e.into());
        }
    };

    let claims: Arc<dyn ClaimsProvider + Send + Sync> = match &args.profile_service_url {
        Some(url) => {
            tracing::info!("Claims enrichment via users API at {}", url);
            Arc::new(HttpProfileService::new(
                url,
                args.profile_service_token.as_deref(),
                Duration::from_millis(args.store_timeout_ms),
            )?)
        }
        None => {
            tracing::info!("Claims enrichment from {} catalog users", catalog.users.len());
            Arc::new(StaticProfileStore::new(catalog.users))
        }
    };

    let authenticator = Arc::new(TrustedHeaderAuthenticator::new(&args.subject_header)?);
    tracing::info!("Resource owner taken from the {} header", args.subject_header);

    let server = Arc::new(AuthorizationServer::new(
        args.server_settings(),
        catalog.clients,
        Arc::new(MemoryGrantStore::new()),
        Arc::new(catalog.keys),
        claims,
        authenticator,
    ));

    let gateway = GatewayState::new(
        catalog.routes,
        server.validator.clone(),
        args.gateway_settings(),
    )?;

    let bind_addr = format!("{}:{}", args.host, args.port);
    server::serve(
        OAuthAppState { server },
        gateway,
        &bind_addr,
        args.purge_interval(),
    )
    .await
}
