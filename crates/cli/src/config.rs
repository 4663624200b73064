use std::path::Path;

use anyhow::{bail, Context, Result};
use digitbot_core::SessionConfig;
use digitbot_transport::TransportConfig;
use rust_decimal::Decimal;
use serde::Deserialize;

/// Engine tuning exposed through the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Seconds to wait for a contract to settle before booking it as a loss.
    pub settlement_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            settlement_timeout_secs: 120,
        }
    }
}

/// Top-level TOML configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Broker API token. The DIGITBOT_TOKEN environment variable takes
    /// precedence, so the token can be kept out of the file.
    pub token: Option<String>,
    #[serde(default)]
    pub transport: TransportConfig,
    pub session: SessionConfig,
    #[serde(default)]
    pub engine: EngineSettings,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would be refused by the broker or would
    /// make the session unable to ever stop.
    pub fn validate(&self) -> Result<()> {
        let session = &self.session;
        if session.base_stake <= Decimal::ZERO {
            bail!("session.base_stake must be positive");
        }
        if session.multiplier < Decimal::ONE {
            bail!("session.multiplier must be at least 1");
        }
        if session.max_stake < session.base_stake {
            bail!("session.max_stake must not be below session.base_stake");
        }
        if session.take_profit <= Decimal::ZERO {
            bail!("session.take_profit must be positive");
        }
        if session.stop_loss <= Decimal::ZERO {
            bail!("session.stop_loss must be positive");
        }
        if session.max_steps == 0 {
            bail!("session.max_steps must be at least 1");
        }
        if session.contract_type.requires_barrier() && session.barrier.is_none() {
            bail!(
                "session.barrier is required for {} contracts",
                session.contract_type.wire_name()
            );
        }
        let heartbeat = &self.transport.heartbeat;
        if heartbeat.stale_after_secs <= heartbeat.interval_secs {
            bail!("transport.heartbeat.stale_after_secs must exceed interval_secs");
        }
        Ok(())
    }
}
