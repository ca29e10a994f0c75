//! mailbox-relay: Single-account HTTP relay over SMTP and IMAP
//!
//! Exposes one configured mailbox over a small HTTP API: send mail with
//! remote attachments, list and read messages, move, delete, reply, forward
//! and store drafts. Every mail operation opens its own TLS session.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading and HTTP serving
//! - [`config`]: Environment-driven configuration for the account and server
//! - [`errors`]: Application error model with HTTP error mapping
//! - [`imap`]: IMAP session operations with timeout wrappers
//! - [`mime`]: Header decoding and body extraction
//! - [`attachments`]: Validated, bounded-concurrency attachment download
//! - [`compose`]: MIME assembly, reply/forward derivation and SMTP delivery
//! - [`models`]: Request/response DTOs
//! - [`server`]: axum router, bearer-key check and handlers

mod attachments;
mod compose;
mod config;
mod errors;
mod imap;
mod mime;
mod models;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use config::ServerConfig;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::attachments::HttpFetcher;
use crate::compose::{Composer, SmtpTransport};
use crate::imap::ImapMailbox;
use crate::server::AppState;

/// Command-line options
#[derive(Debug, Parser)]
#[command(name = "mailbox-relay", version, about)]
struct Cli {
    /// Address the HTTP server binds to
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    listen: SocketAddr,
}

/// Application entry point
///
/// Initializes tracing from environment, loads config, and serves the HTTP
/// API until Ctrl-C or SIGTERM.
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// ACCOUNT_EMAIL=me@example.com \
/// ACCOUNT_PASSWORD=secret \
/// ACCOUNT_SMTP_SERVER=smtp.example.com \
/// ACCOUNT_IMAP_SERVER=imap.example.com \
/// cargo run -- --listen 127.0.0.1:8000
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // reqwest and lettre may pull in different rustls backends.
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let config = ServerConfig::load_from_env()?;
    let mailbox_config = Arc::new(config.mailbox);

    let fetcher = HttpFetcher::new(Duration::from_millis(
        mailbox_config.attachment_timeout_ms,
    ))?;
    let transport = SmtpTransport::new(&mailbox_config)?;
    let state = AppState {
        api_key: config.api_key,
        mailbox: Arc::new(ImapMailbox::new(Arc::clone(&mailbox_config))),
        composer: Composer::new(
            Arc::clone(&mailbox_config),
            Arc::new(fetcher),
            Arc::new(transport),
        ),
    };
    if state.api_key.is_none() {
        tracing::warn!("API_KEY is not set; endpoints are open");
    }

    let listener = TcpListener::bind(cli.listen).await?;
    tracing::info!(
        addr = %cli.listen,
        account = %mailbox_config.account_address,
        "mailbox relay listening"
    );
    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("mailbox relay stopped");
    Ok(())
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl-C");
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
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
