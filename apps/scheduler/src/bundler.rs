use crate::rpc::{ClientError, GasEstimate, UserOperationReceipt};
use alloy::primitives::{Address, B256, U256};
use alloy::rpc::client::RpcClient;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use userop::UserOperation;

/// ERC-4337 bundler RPC surface. `wait_for_receipt` is part of the trait so
/// callers never need the concrete client to reach it.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn chain_id(&self) -> Result<U256, ClientError>;

    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<GasEstimate, ClientError>;

    async fn send_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<B256, ClientError>;

    /// Returns `None` while the operation has not been included. Some
    /// bundlers answer early polls with a receipt object whose `userOpHash`
    /// is the zero hash; that is "not yet available", not a receipt.
    async fn get_user_operation_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<UserOperationReceipt>, ClientError>;

    #[allow(dead_code)]
    async fn wait_for_receipt(
        &self,
        hash: B256,
        max_attempts: u32,
        interval: Duration,
        shutdown: &CancellationToken,
    ) -> Result<UserOperationReceipt, ClientError> {
        for _ in 0..max_attempts {
            if let Some(receipt) = self.get_user_operation_receipt(hash).await? {
                return Ok(receipt);
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
        Err(ClientError::ReceiptTimeout)
    }
}

/// JSON-RPC bundler client. One instance per chain, shared across workers;
/// the underlying transport is connection-pooled and clone-cheap.
pub struct RpcBundler {
    client: RpcClient,
}

impl RpcBundler {
    pub fn new(client: RpcClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Bundler for RpcBundler {
    async fn chain_id(&self) -> Result<U256, ClientError> {
        Ok(self.client.request_noparams("eth_chainId").await?)
    }

    async fn estimate_user_operation_gas(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<GasEstimate, ClientError> {
        Ok(self
            .client
            .request("eth_estimateUserOperationGas", (op.clone(), entry_point))
            .await?)
    }

    async fn send_user_operation(
        &self,
        op: &UserOperation,
        entry_point: Address,
    ) -> Result<B256, ClientError> {
        Ok(self
            .client
            .request("eth_sendUserOperation", (op.clone(), entry_point))
            .await?)
    }

    async fn get_user_operation_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<UserOperationReceipt>, ClientError> {
        let receipt: Option<UserOperationReceipt> = self
            .client
            .request("eth_getUserOperationReceipt", (hash,))
            .await?;
        Ok(filter_placeholder_receipt(receipt))
    }
}

/// Some bundlers answer `eth_getUserOperationReceipt` for an unmined op with
/// a placeholder object whose `userOpHash` is the zero hash. Treat that as
/// "not yet available".
fn filter_placeholder_receipt(
    receipt: Option<UserOperationReceipt>,
) -> Option<UserOperationReceipt> {
    receipt.filter(|r| r.user_op_hash != B256::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedBundler {
        // One entry per poll; None = not yet available.
        receipts: Mutex<Vec<Option<UserOperationReceipt>>>,
        polls: AtomicU32,
    }

    impl ScriptedBundler {
        fn new(receipts: Vec<Option<UserOperationReceipt>>) -> Self {
            Self {
                receipts: Mutex::new(receipts),
                polls: AtomicU32::new(0),
            }
        }
    }

    fn receipt(hash: B256, success: bool) -> UserOperationReceipt {
        UserOperationReceipt {
            user_op_hash: hash,
            entry_point: None,
            sender: None,
            nonce: None,
            success,
            actual_gas_cost: None,
            actual_gas_used: None,
            reason: None,
        }
    }

    #[async_trait]
    impl Bundler for ScriptedBundler {
        async fn chain_id(&self) -> Result<U256, ClientError> {
            Ok(U256::from(11155111u64))
        }

        async fn estimate_user_operation_gas(
            &self,
            _op: &UserOperation,
            _entry_point: Address,
        ) -> Result<GasEstimate, ClientError> {
            unimplemented!("not exercised")
        }

        async fn send_user_operation(
            &self,
            _op: &UserOperation,
            _entry_point: Address,
        ) -> Result<B256, ClientError> {
            unimplemented!("not exercised")
        }

        async fn get_user_operation_receipt(
            &self,
            _hash: B256,
        ) -> Result<Option<UserOperationReceipt>, ClientError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut receipts = self.receipts.lock().unwrap();
            if receipts.is_empty() {
                Ok(None)
            } else {
                Ok(receipts.remove(0))
            }
        }
    }

    #[test]
    fn zero_hash_receipt_is_not_yet_available() {
        assert!(filter_placeholder_receipt(None).is_none());
        assert!(filter_placeholder_receipt(Some(receipt(B256::ZERO, true))).is_none());
        let real = receipt(B256::repeat_byte(0x0a), false);
        assert_eq!(
            filter_placeholder_receipt(Some(real))
                .unwrap()
                .user_op_hash,
            B256::repeat_byte(0x0a)
        );
    }

    #[tokio::test]
    async fn wait_for_receipt_polls_until_available() {
        let hash = B256::repeat_byte(0x01);
        let bundler = ScriptedBundler::new(vec![None, None, Some(receipt(hash, true))]);
        let shutdown = CancellationToken::new();
        let got = bundler
            .wait_for_receipt(hash, 5, Duration::ZERO, &shutdown)
            .await
            .unwrap();
        assert!(got.success);
        assert_eq!(bundler.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn wait_for_receipt_times_out_after_max_attempts() {
        let bundler = ScriptedBundler::new(vec![]);
        let shutdown = CancellationToken::new();
        let err = bundler
            .wait_for_receipt(B256::repeat_byte(0x02), 3, Duration::ZERO, &shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ReceiptTimeout));
        assert_eq!(bundler.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn wait_for_receipt_observes_cancellation() {
        let bundler = ScriptedBundler::new(vec![]);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let err = bundler
            .wait_for_receipt(B256::repeat_byte(0x03), 3, Duration::from_secs(60), &shutdown)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
    }
}
