//! Dual-role Minecraft edge proxy.
//!
//! Lets one backend serve players arriving on two incompatible paths at
//! once: direct connections (authenticated against Mojang) and
//! connections relayed by a PROXY-protocol gateway with its own session
//! service. Two planes run side by side:
//!
//! - a TCP forwarder that normalizes every connection to carry exactly
//!   one PROXY header (passing an existing v1/v2 header through verbatim,
//!   synthesizing a v2 header otherwise) and then splices bytes;
//! - a multiauth HTTP server the backend queries for `hasJoined`, which
//!   races the request across every configured session service.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

mod config;
mod forwarder;
mod multiauth;
mod proxy_protocol;

use config::Config;
use forwarder::TcpForwarder;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = Arc::new(Config::load(config_path)?);

    info!(listen = %cfg.listen, backend = %cfg.backend, "tcp plane");
    info!(auth_listen = %cfg.auth_listen, session_servers = ?cfg.session_servers, "auth plane");

    let forwarder = TcpForwarder::bind(&cfg.listen, cfg.backend.clone()).await?;

    tokio::select! {
        result = forwarder.run() => result.context("tcp forwarder exited"),
        result = multiauth::serve(cfg.clone()) => result.context("multiauth server exited"),
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            Ok(())
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mc_edge=debug".into()),
        )
        .try_init();
}
