mod bundler;
mod cache;
mod chain;
mod config;
mod db;
mod executor;
mod rpc;
mod scheduler;
mod types;

use anyhow::{Context, Result};
use cache::{CacheStore, DEFAULT_QUEUE_KEY, RedisCache};
use chain::ChainRegistry;
use db::{JobRepository, JobsDb};
use executor::ExecutionService;
use scheduler::Scheduler;
use std::collections::HashMap;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use userop::UserOpSigner;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = config::load_config()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("scheduler starting");
    tracing::info!(
        chains = ?cfg.chains.iter().map(|c| c.name).collect::<Vec<_>>(),
        polling_interval = ?cfg.polling_interval,
        sponsored = cfg.sponsor_paymaster.is_some(),
        "config loaded"
    );

    let db = JobsDb::connect(&cfg.database_url, 10).await?;
    db.migrate().await?;

    let cache = RedisCache::connect(&cfg.redis_url, DEFAULT_QUEUE_KEY)
        .await
        .context("connect REDIS_URL")?;

    let signer = UserOpSigner::from_bytes(&cfg.private_key).context("load PRIVATE_KEY")?;
    tracing::info!(signer = %signer.address(), "signer loaded");

    let mut chains = HashMap::new();
    for endpoint in &cfg.chains {
        let handle = chain::connect_chain(endpoint.chain_id, &endpoint.rpc_url)
            .await
            .with_context(|| format!("connect {} rpc", endpoint.name))?;
        tracing::info!(chain = endpoint.name, chain_id = endpoint.chain_id, "chain connected");
        chains.insert(handle.chain_id, Arc::new(handle));
    }
    let registry = Arc::new(ChainRegistry::new(chains));

    let executor = Arc::new(ExecutionService::new(
        registry.clone(),
        signer,
        cfg.sponsor_paymaster,
    ));

    let repo: Arc<dyn JobRepository> = Arc::new(db);
    let cache: Arc<dyn CacheStore> = Arc::new(cache);
    let handle = Scheduler::new(
        repo,
        cache,
        registry,
        executor,
        cfg.polling_interval,
    )
    .start();

    tracing::info!("scheduler started");

    shutdown_signal().await?;
    tracing::info!("shutdown requested");
    handle.stop().await;

    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("ctrl-c")?;
        Ok(())
    }
}
