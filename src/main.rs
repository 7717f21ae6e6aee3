//! indieauthd - standalone IndieAuth / OAuth 2.1 identity provider

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use indieauthd::authn::Authenticator;
use indieauthd::chores::Chores;
use indieauthd::config::{load_config, AppConfig};
use indieauthd::envelope::EnvelopeCodec;
use indieauthd::fetch::Fetcher;
use indieauthd::queue::TicketQueue;
use indieauthd::server::{create_router, AppState};
use indieauthd::store;

/// Timeout for outbound fetches of client identifiers, profiles, and
/// ticket endpoints.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "indieauthd")]
#[command(author, version, about = "IndieAuth / OAuth 2.1 identity provider")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to indieauthd.yaml in the working
    /// directory, plus INDIEAUTHD_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
    },

    /// Show the effective configuration
    Config,

    /// Check configuration, storage, and queue connectivity
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "indieauthd=debug,tower_http=debug"
    } else {
        "indieauthd=info,tower_http=warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(config, port, host).await,
        Commands::Config => cmd_config(config),
        Commands::Doctor => cmd_doctor(config).await,
    }
}

/// Assemble shared state and run the HTTP server.
async fn cmd_serve(
    mut config: AppConfig,
    port: Option<u16>,
    host: Option<String>,
) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.listen.port = port;
    }
    if let Some(host) = host {
        config.listen.host = host;
    }
    if config.encryption_secret.is_empty() {
        anyhow::bail!("encryption_secret must be configured");
    }

    let store = store::connect(
        &config.db.connection_string,
        &config.db.query_log_level,
    )
    .await?;
    store.initialize().await?;
    info!(db = %config.db.connection_string, "storage ready");

    let queue = match &config.queues.amqp_url {
        Some(url) => {
            match TicketQueue::connect(
                url,
                &config.queues.ticket_publish_name,
                &config.queues.ticket_redeemed_name,
            )
            .await
            {
                Ok(queue) => Some(Arc::new(queue)),
                Err(err) => {
                    warn!(error = %err, "queue unavailable, ticket traffic disabled");
                    None
                }
            }
        }
        None => None,
    };

    let config = Arc::new(config);
    let chores = Arc::new(Chores::new(store.clone(), queue.clone(), &config));
    chores.spawn();

    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        codec: Arc::new(EnvelopeCodec::new(&config.encryption_secret)),
        fetcher: Arc::new(Fetcher::new(FETCH_TIMEOUT)),
        queue,
        chores,
        authenticator: Arc::new(Authenticator::new(
            store,
            config.authenticator.authn_enabled,
        )),
    };

    let addr = format!("{}:{}", config.listen.host, config.listen.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, issuer = %config.dingus.self_base_url, "listening");
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}

/// Print the effective configuration, without secrets.
fn cmd_config(config: AppConfig) -> anyhow::Result<()> {
    println!("listen:              {}:{}", config.listen.host, config.listen.port);
    println!("db:                  {}", config.db.connection_string);
    println!("self base url:       {}", config.dingus.self_base_url);
    println!(
        "encryption secret:   {}",
        if config.encryption_secret.is_empty() {
            "(unset)"
        } else {
            "(set)"
        }
    );
    println!(
        "amqp:                {}",
        config.queues.amqp_url.as_deref().unwrap_or("(disabled)")
    );
    println!(
        "chores (ms):         tokens={} scopes={} tickets={}",
        config.chores.token_cleanup_ms,
        config.chores.scope_cleanup_ms,
        config.chores.publish_tickets_ms
    );
    println!(
        "code validity (ms):  {}",
        config.manager.code_validity_timeout_ms
    );
    println!(
        "legacy non-PKCE:     {}",
        config.manager.allow_legacy_non_pkce
    );
    println!("authn enabled:       {}", config.authenticator.authn_enabled);
    Ok(())
}

/// Connectivity checks for storage and queue.
async fn cmd_doctor(config: AppConfig) -> anyhow::Result<()> {
    let mut healthy = true;

    if config.encryption_secret.is_empty() {
        error!("encryption_secret is not set");
        healthy = false;
    } else {
        info!("encryption secret present");
    }

    match store::connect(&config.db.connection_string, &config.db.query_log_level).await {
        Ok(store) => match store.initialize().await.and(store.health_check().await) {
            Ok(()) => info!("storage healthy"),
            Err(err) => {
                error!(error = %err, "storage unhealthy");
                healthy = false;
            }
        },
        Err(err) => {
            error!(error = %err, "storage connection failed");
            healthy = false;
        }
    }

    match &config.queues.amqp_url {
        None => info!("queue not configured, ticket traffic disabled"),
        Some(url) => {
            match TicketQueue::connect(
                url,
                &config.queues.ticket_publish_name,
                &config.queues.ticket_redeemed_name,
            )
            .await
            {
                Ok(_) => info!("queue reachable"),
                Err(err) => {
                    error!(error = %err, "queue unreachable");
                    healthy = false;
                }
            }
        }
    }

    if healthy {
        println!("ok");
        Ok(())
    } else {
        anyhow::bail!("doctor found problems")
    }
}
