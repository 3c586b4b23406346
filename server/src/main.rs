//! burrow: reverse-tunnel rendezvous server.
//!
//! Public plane routes HTTP by Host subdomain onto pooled tunnel sockets;
//! admin plane mints tunnels. Configuration comes from the `LT_*`
//! environment.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info};

mod admin;
mod agent;
mod auth;
mod client;
mod config;
mod error;
mod ids;
mod manager;
mod nonce;
mod public;

use admin::AdminState;
use auth::HmacAuthenticator;
use config::ServerConfig;
use manager::ClientManager;
use nonce::NonceCache;
use public::PublicState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "burrow_server=info".to_string()),
        )
        .init();

    let config = Arc::new(ServerConfig::from_env()?);
    let manager = ClientManager::new(Arc::clone(&config));

    let auth = match &config.hmac_secret {
        Some(secret) => {
            let nonces = Arc::new(NonceCache::new());
            let _sweeper = nonces.spawn_sweeper(config.nonce_cleanup_interval);
            info!("HMAC authentication enabled for tunnel creation");
            Some(Arc::new(HmacAuthenticator::new(secret, &config, nonces)))
        }
        None => None,
    };

    let admin_router = admin::router(AdminState {
        manager: manager.clone(),
        config: Arc::clone(&config),
        auth,
    });
    let public_router = public::router(PublicState {
        manager,
        config: Arc::clone(&config),
        admin: admin_router.clone(),
    });

    if let Some(admin_port) = config.admin_port {
        let listener = TcpListener::bind((config.admin_address, admin_port))
            .await
            .with_context(|| format!("binding admin plane on port {admin_port}"))?;
        info!(address = %config.admin_address, port = admin_port, "admin plane listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(
                listener,
                admin_router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            {
                error!(error = %e, "admin plane failed");
            }
        });
    }

    let listener = TcpListener::bind((config.address, config.port))
        .await
        .with_context(|| format!("binding public plane on port {}", config.port))?;
    info!(
        address = %config.address,
        port = config.port,
        domain = config.domain.as_deref().unwrap_or("-"),
        max_sockets = config.max_sockets,
        secure = config.secure,
        "burrow server listening"
    );

    axum::serve(
        listener,
        public_router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
