use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use latchkey::config::LatchkeyConfig;
use latchkey::context::OpContext;
use latchkey::lock::{lock_key, LockManager};
use latchkey::ratelimit::{LimitConfig, RateLimiter};
use latchkey::store::{self, KeyTtl, KeyValueStore};

#[derive(Parser)]
#[command(name = "latchkey", version, about = "Distributed locks and rate limits on Redis")]
struct Cli {
    /// Configuration file (YAML)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Acquire a lock, hold it, then release it
    Hold {
        #[arg(long)]
        name: String,
        #[arg(long, default_value_t = 10_000)]
        ttl_ms: u64,
        #[arg(long, default_value_t = 5_000)]
        hold_ms: u64,
        /// Keep extending the lease while held
        #[arg(long)]
        auto_renew: bool,
    },
    /// Record requests against a sliding window
    Allow {
        #[arg(long)]
        name: String,
        #[arg(long)]
        window_ms: u64,
        #[arg(long)]
        max: u64,
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Show the holder and remaining lease of a lock
    Inspect {
        #[arg(long)]
        name: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = LatchkeyConfig::load(cli.config.as_deref())?;
    info!(
        backend = ?config.store.backend,
        url = %config.store.redacted_url(),
        "Configuration loaded"
    );

    let store = store::connect(&config.store).await?;

    match cli.command {
        Command::Hold {
            name,
            ttl_ms,
            hold_ms,
            auto_renew,
        } => {
            let manager = Arc::new(LockManager::with_settings(store, &config.locks));
            let sweeper = manager.spawn_sweeper(config.locks.sweep_interval());

            let mut options = manager.default_options();
            if auto_renew {
                options = options.with_auto_renew(Duration::ZERO);
            }
            let lock = manager.get_lock(&name, Duration::from_millis(ttl_ms), options);

            let ctx = OpContext::background();
            lock.acquire_with_retry(&ctx, config.locks.mutex_retries, config.locks.mutex_retry_delay())
                .await?;
            println!("acquired {} token={}", lock.key(), lock.token());

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(hold_ms)) => {}
                _ = shutdown_signal() => {}
            }

            let release_ctx = OpContext::with_timeout(Duration::from_secs(5));
            if let Err(e) = manager.release_all(&release_ctx).await {
                warn!(error = %e, "Some locks could not be released");
                sweeper.abort();
                return Err(e.into());
            }
            println!("released {}", lock.key());
            sweeper.abort();
        }
        Command::Allow {
            name,
            window_ms,
            max,
            count,
        } => {
            let limiter = RateLimiter::with_config(store, &config.rate_limiting)?;
            let limit = LimitConfig::new(Duration::from_millis(window_ms), max);
            let ctx = OpContext::background();

            for i in 1..=count {
                let allowed = limiter.sliding_window_allow(&ctx, &name, limit).await?;
                println!("request {}: {}", i, if allowed { "allowed" } else { "limited" });
            }
            println!(
                "{} requests in window",
                limiter.current_count(&ctx, &name).await?
            );
        }
        Command::Inspect { name } => {
            let key = lock_key(&name);
            match store.get(&key).await? {
                None => println!("{}: free", key),
                Some(token) => {
                    let ttl = match store.ttl(&key).await? {
                        KeyTtl::Remaining(d) => format!("{}ms", d.as_millis()),
                        KeyTtl::Persistent => "no expiry".to_string(),
                        KeyTtl::Missing => "expired".to_string(),
                    };
                    println!("{}: held by {} ({})", key, token, ttl);
                }
            }
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, releasing locks");
        }
        _ = terminate => {
            info!("Received SIGTERM, releasing locks");
        }
    }
}
