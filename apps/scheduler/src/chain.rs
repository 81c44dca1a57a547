use crate::bundler::{Bundler, RpcBundler};
use crate::rpc::{ClientError, FeeQuote};
use crate::types::ExecutionConfig;
use alloy::primitives::aliases::U192;
use alloy::primitives::{Address, U256, address};
use alloy::providers::{DynProvider, ProviderBuilder};
use alloy::rpc::client::{BuiltInConnectionString, RpcClient};
use alloy::sol;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// The on-chain module whose `executionLog` view drives job scheduling.
pub const SCHEDULED_TRANSFERS_MODULE: Address =
    address!("A8E374779aeE60413c974b484d6509c7E4DDb6bA");

sol! {
    #[sol(rpc)]
    interface IScheduledTransfers {
        function executionLog(address smartAccount, uint256 jobId)
            external
            view
            returns (
                uint48 executeInterval,
                uint16 numberOfExecutions,
                uint16 numberOfExecutionsCompleted,
                uint48 startDate,
                bool isEnabled,
                uint48 lastExecutionTime,
                bytes executionData
            );
    }

    #[sol(rpc)]
    interface IEntryPoint {
        function getNonce(address sender, uint192 key) external view returns (uint256 nonce);
    }
}

/// Read-only chain access used by the poller and the execution pipeline.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn read_execution_log(
        &self,
        account: Address,
        on_chain_job_id: i64,
    ) -> Result<ExecutionConfig, ClientError>;

    async fn get_nonce(
        &self,
        entry_point: Address,
        sender: Address,
        key: U192,
    ) -> Result<U256, ClientError>;

    async fn fee_quote(&self) -> Result<FeeQuote, ClientError>;
}

pub struct ChainClient {
    provider: DynProvider,
    client: RpcClient,
}

impl ChainClient {
    pub fn new(client: RpcClient) -> Self {
        let provider = DynProvider::new(ProviderBuilder::default().connect_client(client.clone()));
        Self { provider, client }
    }
}

// Only the base fee is needed from the header; everything else is ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestHeader {
    base_fee_per_gas: Option<U256>,
}

#[async_trait]
impl ChainReader for ChainClient {
    async fn read_execution_log(
        &self,
        account: Address,
        on_chain_job_id: i64,
    ) -> Result<ExecutionConfig, ClientError> {
        let module = IScheduledTransfers::new(SCHEDULED_TRANSFERS_MODULE, &self.provider);
        let log = module
            .executionLog(account, U256::from(on_chain_job_id))
            .call()
            .await?;
        Ok(ExecutionConfig {
            execute_interval: log.executeInterval.to::<u64>(),
            number_of_executions: log.numberOfExecutions,
            number_of_executions_completed: log.numberOfExecutionsCompleted,
            start_date: log.startDate.to::<u64>(),
            is_enabled: log.isEnabled,
            last_execution_time: log.lastExecutionTime.to::<u64>(),
            execution_data: log.executionData,
        })
    }

    async fn get_nonce(
        &self,
        entry_point: Address,
        sender: Address,
        key: U192,
    ) -> Result<U256, ClientError> {
        let entry_point = IEntryPoint::new(entry_point, &self.provider);
        Ok(entry_point.getNonce(sender, key).call().await?)
    }

    async fn fee_quote(&self) -> Result<FeeQuote, ClientError> {
        let mut batch = self.client.new_batch();
        let header = batch
            .add_call::<_, LatestHeader>("eth_getBlockByNumber", &("latest", false))
            .map_err(ClientError::from)?;
        let priority_fee = batch
            .add_call::<_, U256>("rundler_maxPriorityFeePerGas", &[(); 0])
            .map_err(ClientError::from)?;
        batch.send().await.map_err(ClientError::from)?;

        let header = header.await.map_err(ClientError::from)?;
        let max_priority_fee_per_gas = priority_fee.await.map_err(ClientError::from)?;
        let base_fee_per_gas = header
            .base_fee_per_gas
            .ok_or_else(|| ClientError::Decode("latest block has no baseFeePerGas".into()))?;
        Ok(FeeQuote {
            base_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }
}

/// One shared reader + bundler pair per chain.
pub struct ChainHandle {
    pub chain_id: u64,
    pub reader: Arc<dyn ChainReader>,
    pub bundler: Arc<dyn Bundler>,
}

pub struct ChainRegistry {
    chains: HashMap<u64, Arc<ChainHandle>>,
}

impl ChainRegistry {
    pub fn new(chains: HashMap<u64, Arc<ChainHandle>>) -> Self {
        Self { chains }
    }

    pub fn get(&self, chain_id: u64) -> Result<Arc<ChainHandle>, ClientError> {
        self.chains
            .get(&chain_id)
            .cloned()
            .ok_or(ClientError::UnsupportedChain(chain_id))
    }

    pub fn chain_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.chains.keys().copied()
    }
}

/// Connects the shared transport for one chain and hands the same RPC client
/// to both the reader and the bundler.
pub async fn connect_chain(chain_id: u64, rpc_url: &str) -> Result<ChainHandle, ClientError> {
    let transport = BuiltInConnectionString::connect(rpc_url)
        .await
        .map_err(ClientError::from)?;
    let client = RpcClient::builder().transport(transport, false);
    let bundler = Arc::new(RpcBundler::new(client.clone()));

    match bundler.chain_id().await {
        Ok(reported) if reported != U256::from(chain_id) => {
            tracing::warn!(
                chain_id,
                reported = %reported,
                "endpoint reports a different chain id than configured"
            );
        }
        Err(err) => {
            tracing::warn!(chain_id, err = %err, "failed to query eth_chainId");
        }
        _ => {}
    }

    Ok(ChainHandle {
        chain_id,
        reader: Arc::new(ChainClient::new(client)),
        bundler,
    })
}
