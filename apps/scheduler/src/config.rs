use crate::types::parse_hex_32;
use alloy::primitives::Address;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Chains the scheduler may serve. A chain is only activated when its RPC URL
/// is configured.
pub const SUPPORTED_CHAINS: &[(u64, &str)] = &[
    (11155111, "sepolia"),
    (421614, "arbitrum-sepolia"),
    (84532, "base-sepolia"),
    (11155420, "optimism-sepolia"),
    (80002, "polygon-amoy"),
];

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Env {
    polling_interval: u64,

    private_key: String,

    database_url: String,

    redis_url: String,

    sepolia_rpc_url: String,
    arbitrum_sepolia_rpc_url: String,
    base_sepolia_rpc_url: String,
    optimism_sepolia_rpc_url: String,
    polygon_amoy_rpc_url: String,

    /// Optional sponsor paymaster attached to every submitted op.
    paymaster_address: String,
}

impl Default for Env {
    fn default() -> Self {
        Self {
            polling_interval: 60,
            private_key: String::new(),
            database_url: String::new(),
            redis_url: String::new(),
            sepolia_rpc_url: String::new(),
            arbitrum_sepolia_rpc_url: String::new(),
            base_sepolia_rpc_url: String::new(),
            optimism_sepolia_rpc_url: String::new(),
            polygon_amoy_rpc_url: String::new(),
            paymaster_address: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainEndpoint {
    pub chain_id: u64,
    pub name: &'static str,
    pub rpc_url: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub polling_interval: Duration,
    pub private_key: [u8; 32],
    pub database_url: String,
    pub redis_url: String,
    pub chains: Vec<ChainEndpoint>,
    pub sponsor_paymaster: Option<Address>,
}

pub fn load_config() -> Result<AppConfig> {
    let env: Env = envy::from_env().context("load scheduler env config")?;

    if env.database_url.trim().is_empty() {
        anyhow::bail!("DATABASE_URL must be set");
    }
    if env.redis_url.trim().is_empty() {
        anyhow::bail!("REDIS_URL must be set");
    }
    if env.private_key.trim().is_empty() {
        anyhow::bail!("PRIVATE_KEY must be set");
    }
    let private_key = parse_hex_32("PRIVATE_KEY", &env.private_key)?;

    if env.polling_interval == 0 {
        anyhow::bail!("POLLING_INTERVAL must be positive");
    }

    let urls = [
        &env.sepolia_rpc_url,
        &env.arbitrum_sepolia_rpc_url,
        &env.base_sepolia_rpc_url,
        &env.optimism_sepolia_rpc_url,
        &env.polygon_amoy_rpc_url,
    ];
    let mut chains = Vec::new();
    for ((chain_id, name), url) in SUPPORTED_CHAINS.iter().zip(urls) {
        if url.trim().is_empty() {
            continue;
        }
        chains.push(ChainEndpoint {
            chain_id: *chain_id,
            name,
            rpc_url: url.trim().to_string(),
        });
    }
    if chains.is_empty() {
        anyhow::bail!(
            "no chain RPC URL configured; set at least one of SEPOLIA_RPC_URL, \
             ARBITRUM_SEPOLIA_RPC_URL, BASE_SEPOLIA_RPC_URL, OPTIMISM_SEPOLIA_RPC_URL, \
             POLYGON_AMOY_RPC_URL"
        );
    }

    let sponsor_paymaster = if env.paymaster_address.trim().is_empty() {
        None
    } else {
        Some(
            env.paymaster_address
                .trim()
                .parse()
                .context("parse PAYMASTER_ADDRESS")?,
        )
    };

    Ok(AppConfig {
        polling_interval: Duration::from_secs(env.polling_interval),
        private_key,
        database_url: env.database_url,
        redis_url: env.redis_url,
        chains,
        sponsor_paymaster,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_chains_cover_the_five_testnets() {
        let ids: Vec<u64> = SUPPORTED_CHAINS.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![11155111, 421614, 84532, 11155420, 80002]);
    }
}
