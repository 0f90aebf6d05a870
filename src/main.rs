use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, LoggingConfig};
use gatekeeper::grpc::connect_limiter;
use gatekeeper::ratelimit::{format_window, Limiter, PolicyFile, PolicyTable, RateLimitKey};

/// Inspect and manage gRPC rate limits.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// Configuration file (YAML); `GATEKEEPER__*` variables override it
    #[arg(short, long, env = "GATEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the effective policy table
    Policies {
        /// Emit the table as JSON in policy file form
        #[arg(long)]
        json: bool,
    },
    /// Consume one permit for a caller and print the verdict
    Check {
        /// Full gRPC method name, e.g. /listings.v1.ListingsService/CreateListing
        method: String,
        /// Client identifier as produced by the endpoint's strategy
        identifier: String,
    },
    /// Print the permits left in the caller's current window
    Remaining { method: String, identifier: String },
    /// Clear the caller's counter
    Reset { method: String, identifier: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = GatekeeperConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);
    debug!(config = ?config, "Configuration loaded");

    let policies = config.rate_limiting.load_policies()?;

    match cli.command {
        Command::Policies { json } => print_policies(&policies, json)?,
        Command::Check { method, identifier } => {
            let policy = policies.policy(&method);
            if !policy.enabled {
                println!("{}: rate limiting disabled", method);
                return Ok(());
            }

            let limiter = connect_limiter(&config.redis).await?;
            let key = RateLimitKey::new(&method, &identifier);
            let verdict = limiter.check(key.as_str(), policy.limit, policy.window).await?;
            let reset_in = verdict
                .retry_after
                .map(format_window)
                .unwrap_or_else(|| "unknown".to_string());
            println!(
                "{}: {} ({} remaining, window resets in {})",
                key,
                if verdict.allowed { "allowed" } else { "denied" },
                verdict.remaining,
                reset_in
            );
        }
        Command::Remaining { method, identifier } => {
            let limiter = connect_limiter(&config.redis).await?;
            let key = RateLimitKey::new(&method, &identifier);
            match limiter.remaining(key.as_str()).await? {
                -1 => println!("{}: no active window", key),
                remaining => println!("{}: {} remaining", key, remaining),
            }
        }
        Command::Reset { method, identifier } => {
            let limiter = connect_limiter(&config.redis).await?;
            let key = RateLimitKey::new(&method, &identifier);
            limiter.reset(key.as_str()).await?;
            info!(key = %key, "Counter reset");
            println!("{}: reset", key);
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_policies(policies: &PolicyTable, json: bool) -> anyhow::Result<()> {
    if json {
        let file = PolicyFile::from_table(policies);
        println!("{}", serde_json::to_string_pretty(&file)?);
        return Ok(());
    }

    let default = policies.default_policy();
    println!("{:<56} {:>6} {:>8} {:<18} ENABLED", "METHOD", "LIMIT", "WINDOW", "STRATEGY");
    for (method, policy) in policies.endpoints() {
        println!(
            "{:<56} {:>6} {:>8} {:<18} {}",
            method,
            policy.limit,
            format_window(policy.window),
            policy.strategy.as_str(),
            policy.enabled
        );
    }
    println!(
        "{:<56} {:>6} {:>8} {:<18} {}",
        "(default)",
        default.limit,
        format_window(default.window),
        default.strategy.as_str(),
        default.enabled
    );
    Ok(())
}
