use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use ocu_core::harness::{random_bytes, run_unlock_flow, SimulatedCompanion};
use ocu_core::CompanionConfig;
use ocu_token::{testing::MockToken, TokenError};
use ocu_tunnel::{SIGNED_TOKEN_SIZE, UNLOCK_KEY_SIZE};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ocu-demo")]
#[command(about = "Unlock a simulated companion computer end to end")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Number of simulated companion computers
    #[arg(long, default_value_t = 1)]
    companions: usize,

    /// Make the security token reject the PIN
    #[arg(long)]
    fail_token: bool,

    /// Companions never acknowledge the unlock key
    #[arg(long)]
    drop_ack: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "ocu_demo={0},ocu_core={0},ocu_tunnel={0},ocu_token={0}",
            args.log_level
        ))
        .init();

    let config = match &args.config {
        Some(path) => CompanionConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => CompanionConfig::load_from_env().context("loading config from environment")?,
    };

    let ids: Vec<u8> = config.component_range().take(args.companions).collect();
    if args.companions == 0 || ids.len() < args.companions {
        bail!(
            "--companions must be between 1 and {}",
            config.component_range().count()
        );
    }

    let fleet = ids
        .into_iter()
        .map(|id| {
            let companion = SimulatedCompanion::new(id);
            if args.drop_ack {
                companion.drop_ack()
            } else {
                companion
            }
        })
        .collect();

    let token = if args.fail_token {
        MockToken::failing(TokenError::Authentication)
    } else {
        MockToken::expanding(UNLOCK_KEY_SIZE)
    };
    let signed_token = random_bytes::<SIGNED_TOKEN_SIZE>()
        .map_err(|e| anyhow!("random source unavailable: {e}"))?;

    info!(companions = args.companions, "starting simulated unlock");
    match run_unlock_flow(config, Arc::new(token), fleet, &signed_token).await {
        Ok(report) => {
            println!("unlocked companion {}", report.target);
            for companion in &report.fleet {
                let status = if companion.received_key().is_some() {
                    "key delivered"
                } else {
                    "untouched"
                };
                println!("  companion {}: {}", companion.component_id(), status);
            }
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "unlock failed");
            Err(e).context("unlock failed")
        }
    }
}
