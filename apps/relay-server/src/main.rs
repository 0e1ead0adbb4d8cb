//! CareLink Relay Server
//!
//! Encrypted chat relay for clinician and patient sessions.

use relay_server::{AppState, RelayConfig, router, spawn_idle_sweeper};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relay_server=debug".parse()?)
                .add_directive("crypto_session=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    info!("Starting CareLink Relay Server");

    let config = RelayConfig::from_env()?;
    info!(
        "DH modulus {} bits, at-rest nonce {} bytes",
        config.crypto.dh_prime_bits, config.crypto.at_rest_nonce_len
    );

    let state = AppState::from_config(&config)?;
    let _sweeper = spawn_idle_sweeper(
        state.clone(),
        config.sweep_interval(),
        config.session_idle_timeout(),
    );

    let addr = config.server.listen_addr;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;

    Ok(())
}
