use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use digitbot_core::{AccountInfo, BrokerLink, TradingSession};
use digitbot_engine::{EngineConfig, TradingEngine};
use digitbot_transport::{HeartbeatMonitor, ReconnectionSupervisor, Transport};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

mod config;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "digitbot")]
#[command(about = "Digit contract trading client - single websocket, martingale staking")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Broker API token; overrides the config file
    #[arg(long, env = "DIGITBOT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a trading session against the configured broker endpoint
    Run {
        /// Path to the TOML configuration file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Parse and validate a configuration file without connecting
    CheckConfig {
        /// Path to the TOML configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    match cli.command {
        Commands::Run { config } => run_session(config, cli.token).await,
        Commands::CheckConfig { config } => check_config(config),
    }
}

async fn run_session(config_path: PathBuf, token_override: Option<String>) -> Result<()> {
    let config = AppConfig::load(&config_path)?;
    let token = token_override
        .or_else(|| config.token.clone())
        .ok_or_else(|| anyhow!("no API token: set `token` in the config file or DIGITBOT_TOKEN"))?;

    let transport = Transport::new(config.transport.clone());
    transport.connect().await?;
    let heartbeat = HeartbeatMonitor::spawn(transport.clone());
    let mut supervisor = ReconnectionSupervisor::spawn(transport.clone());

    let account = transport.authorize(&token).await?;
    info!(
        loginid = %account.loginid,
        balance = %account.balance,
        currency = %account.currency,
        "Authorized"
    );

    let engine_config = EngineConfig {
        settlement_timeout: Duration::from_secs(config.engine.settlement_timeout_secs),
        ..Default::default()
    };
    let (engine, mut updates) = TradingEngine::new(Arc::new(transport.clone()), engine_config);

    let runner = engine.run(config.session.clone());
    tokio::pin!(runner);
    let mut supervisor_running = true;

    let session = loop {
        tokio::select! {
            session = &mut runner => break session,
            Some(update) = updates.recv() => {
                debug!(
                    state = ?update.state,
                    profit = %update.cumulative_profit,
                    step = update.step_count,
                    "Session update"
                );
            }
            result = &mut supervisor, if supervisor_running => {
                supervisor_running = false;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "Connection permanently lost, stopping session"),
                    Err(e) => error!(error = %e, "Reconnection supervisor failed"),
                }
                engine.stop();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested, letting the open trade settle");
                engine.stop();
            }
        }
    };

    transport.close();
    heartbeat.abort();
    if supervisor_running {
        let _ = supervisor.await;
    }

    print_summary(&account, &session);
    Ok(())
}

fn check_config(config_path: PathBuf) -> Result<()> {
    let config = AppConfig::load(&config_path)?;
    println!("Configuration OK: {}", config_path.display());
    println!("  endpoint:      {}", config.transport.endpoint);
    println!("  symbol:        {}", config.session.symbol);
    println!(
        "  contract type: {}",
        config.session.contract_type.wire_name()
    );
    println!(
        "  base stake:    {} {}",
        config.session.base_stake, config.session.currency
    );
    println!(
        "  ladder:        x{} up to {} ({} steps max)",
        config.session.multiplier, config.session.max_stake, config.session.max_steps
    );
    if config.token.is_none() {
        println!("  note: no token in file; DIGITBOT_TOKEN must be set at run time");
    }
    Ok(())
}

fn print_summary(account: &AccountInfo, session: &TradingSession) {
    let reason = session
        .stop_reason
        .as_ref()
        .map(|r| r.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let sep = "=".repeat(60);
    println!("\n{sep}");
    println!("  SESSION RESULTS");
    println!("{sep}");
    println!(
        "  Account:         {} ({})",
        account.loginid, account.currency
    );
    println!("  Symbol:          {}", session.config.symbol);
    println!(
        "  Contract Type:   {}",
        session.config.contract_type.wire_name()
    );
    println!("  Trades:          {}", session.trades);
    println!("  Net Profit:      {:.2}", session.cumulative_profit);
    println!(
        "  Ladder Step:     {} / {}",
        session.step_count, session.config.max_steps
    );
    println!("  Stop Reason:     {}", reason);
    println!("{sep}\n");
}
