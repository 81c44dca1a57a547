use crate::chain::ChainRegistry;
use crate::rpc::ClientError;
use crate::types::Job;
use alloy::primitives::{Address, B256, U256};
use std::sync::Arc;
use thiserror::Error;
use userop::{PackError, SignError, UserOpSigner, dummy_signature, user_op_hash_v07};

/// Per-stage failure taxonomy for one execution attempt. Every variant is
/// terminal for the attempt; the scheduler records the message and moves on.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("unsupported chain id {0}")]
    UnsupportedChain(u64),
    #[error("refresh nonce: {0}")]
    Nonce(#[source] ClientError),
    #[error("estimate user operation gas: {0}")]
    Estimate(#[source] ClientError),
    #[error("query fee market: {0}")]
    FeeMarket(#[source] ClientError),
    #[error("hash user operation: {0}")]
    Hash(#[from] PackError),
    #[error("sign user operation: {0}")]
    Sign(#[from] SignError),
    #[error("submit user operation: {0}")]
    Submit(#[source] ClientError),
}

/// Builds, signs and submits one user operation per due job. Holds the
/// process-wide signing key; only the dispatcher calls into it.
pub struct ExecutionService {
    chains: Arc<ChainRegistry>,
    signer: UserOpSigner,
    sponsor_paymaster: Option<Address>,
}

impl ExecutionService {
    pub fn new(
        chains: Arc<ChainRegistry>,
        signer: UserOpSigner,
        sponsor_paymaster: Option<Address>,
    ) -> Self {
        Self {
            chains,
            signer,
            sponsor_paymaster,
        }
    }

    /// Runs the full submission pipeline for `job` and returns the bundler's
    /// user-operation hash.
    pub async fn execute(&self, job: &Job) -> Result<B256, ExecuteError> {
        let chain = self
            .chains
            .get(job.chain_id)
            .map_err(|_| ExecuteError::UnsupportedChain(job.chain_id))?;

        let mut op = job.user_op.clone();

        // The template's nonce names the key; the sequence comes from chain
        // state so a replayed template cannot reuse an old nonce.
        op.nonce = chain
            .reader
            .get_nonce(job.entry_point, op.sender, op.nonce_key())
            .await
            .map_err(ExecuteError::Nonce)?;

        if let Some(paymaster) = self.sponsor_paymaster {
            op.paymaster = Some(paymaster);
        }

        // The template signature is a prefix selecting the validator module.
        // Estimation runs over prefix + dummy so the verifier sees a payload
        // with the final length and entropy.
        let signature_prefix = op.signature.clone();
        op.signature = [signature_prefix.as_ref(), dummy_signature().as_ref()]
            .concat()
            .into();

        let estimate = chain
            .bundler
            .estimate_user_operation_gas(&op, job.entry_point)
            .await
            .map_err(ExecuteError::Estimate)?;
        op.pre_verification_gas = estimate.pre_verification_gas;
        op.verification_gas_limit = estimate.verification_gas_limit;
        op.call_gas_limit = estimate.call_gas_limit;
        if estimate.paymaster_verification_gas_limit.is_some() {
            op.paymaster_verification_gas_limit = estimate.paymaster_verification_gas_limit;
        }

        let fees = chain
            .reader
            .fee_quote()
            .await
            .map_err(ExecuteError::FeeMarket)?;
        op.max_priority_fee_per_gas = fees.max_priority_fee_per_gas;
        op.max_fee_per_gas = fees.base_fee_per_gas * U256::from(3) / U256::from(2)
            + fees.max_priority_fee_per_gas;

        let hash = user_op_hash_v07(&op, job.entry_point, job.chain_id)?;
        let signature = self.signer.sign_prefixed(hash)?;
        op.signature = [signature_prefix.as_ref(), signature.as_slice()]
            .concat()
            .into();

        chain
            .bundler
            .send_user_operation(&op, job.entry_point)
            .await
            .map_err(ExecuteError::Submit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::Bundler;
    use crate::chain::{ChainHandle, ChainReader};
    use crate::rpc::{FeeQuote, GasEstimate, UserOperationReceipt};
    use crate::types::JobStatus;
    use alloy::primitives::aliases::U192;
    use alloy::primitives::{Bytes, address};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use userop::{ENTRY_POINT_V07, UserOperation};
    use uuid::Uuid;

    const CHAIN_ID: u64 = 11155111;

    struct StubReader {
        nonce: U256,
        fee: FeeQuote,
    }

    #[async_trait]
    impl ChainReader for StubReader {
        async fn read_execution_log(
            &self,
            _account: Address,
            _on_chain_job_id: i64,
        ) -> Result<crate::types::ExecutionConfig, ClientError> {
            unimplemented!("not exercised")
        }

        async fn get_nonce(
            &self,
            _entry_point: Address,
            _sender: Address,
            key: U192,
        ) -> Result<U256, ClientError> {
            // Chain-side recombination: key ‖ next sequence.
            Ok((U256::from(key) << 64) | (self.nonce & U256::from(u64::MAX)))
        }

        async fn fee_quote(&self) -> Result<FeeQuote, ClientError> {
            Ok(self.fee)
        }
    }

    #[derive(Default)]
    struct RecordingBundler {
        estimated: Mutex<Vec<UserOperation>>,
        sent: Mutex<Vec<UserOperation>>,
        fail_estimate: bool,
    }

    #[async_trait]
    impl Bundler for RecordingBundler {
        async fn chain_id(&self) -> Result<U256, ClientError> {
            Ok(U256::from(CHAIN_ID))
        }

        async fn estimate_user_operation_gas(
            &self,
            op: &UserOperation,
            _entry_point: Address,
        ) -> Result<GasEstimate, ClientError> {
            if self.fail_estimate {
                return Err(ClientError::Rpc {
                    code: -32500,
                    message: "AA23 reverted".into(),
                    data: Some("\"0x\"".into()),
                });
            }
            self.estimated.lock().unwrap().push(op.clone());
            Ok(GasEstimate {
                pre_verification_gas: U256::from(50_000u64),
                verification_gas_limit: U256::from(200_000u64),
                call_gas_limit: U256::from(100_000u64),
                paymaster_verification_gas_limit: None,
                paymaster_post_op_gas_limit: None,
            })
        }

        async fn send_user_operation(
            &self,
            op: &UserOperation,
            _entry_point: Address,
        ) -> Result<B256, ClientError> {
            self.sent.lock().unwrap().push(op.clone());
            Ok(B256::repeat_byte(0x99))
        }

        async fn get_user_operation_receipt(
            &self,
            _hash: B256,
        ) -> Result<Option<UserOperationReceipt>, ClientError> {
            Ok(None)
        }
    }

    fn job() -> Job {
        Job {
            id: Uuid::new_v4(),
            account: address!("1111111111111111111111111111111111111111"),
            chain_id: CHAIN_ID,
            on_chain_job_id: 1,
            entry_point: ENTRY_POINT_V07,
            user_op: UserOperation {
                sender: address!("1111111111111111111111111111111111111111"),
                nonce: U256::from(5u64) << 64,
                call_data: Bytes::from(vec![0xca, 0x11]),
                // Validator-selecting prefix registered with the job.
                signature: Bytes::from(vec![0x01, 0x02, 0x03]),
                ..Default::default()
            },
            status: JobStatus::Queuing,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn service(reader: StubReader, bundler: Arc<RecordingBundler>) -> ExecutionService {
        let handle = ChainHandle {
            chain_id: CHAIN_ID,
            reader: Arc::new(reader),
            bundler,
        };
        let registry = ChainRegistry::new(HashMap::from([(CHAIN_ID, Arc::new(handle))]));
        let signer = UserOpSigner::from_bytes(&[0x11u8; 32]).unwrap();
        ExecutionService::new(Arc::new(registry), signer, None)
    }

    fn reader() -> StubReader {
        StubReader {
            nonce: U256::from(7u64),
            fee: FeeQuote {
                base_fee_per_gas: U256::from(1_000_000_000u64),
                max_priority_fee_per_gas: U256::from(100_000_000u64),
            },
        }
    }

    #[tokio::test]
    async fn execute_builds_and_submits_a_signed_op() {
        let bundler = Arc::new(RecordingBundler::default());
        let service = service(reader(), bundler.clone());
        let job = job();

        let hash = service.execute(&job).await.unwrap();
        assert_eq!(hash, B256::repeat_byte(0x99));

        let sent = bundler.sent.lock().unwrap();
        let op = &sent[0];

        // Nonce refreshed from chain under the template's key.
        assert_eq!(op.nonce, (U256::from(5u64) << 64) | U256::from(7u64));
        // Gas copied from the estimate.
        assert_eq!(op.call_gas_limit, U256::from(100_000u64));
        assert_eq!(op.verification_gas_limit, U256::from(200_000u64));
        assert_eq!(op.pre_verification_gas, U256::from(50_000u64));
        // maxFee = base * 3/2 + tip.
        assert_eq!(op.max_fee_per_gas, U256::from(1_600_000_000u64));
        assert_eq!(op.max_priority_fee_per_gas, U256::from(100_000_000u64));
        // Final signature: registered prefix + 65-byte ECDSA signature.
        assert_eq!(op.signature.len(), 3 + 65);
        assert_eq!(&op.signature[..3], &[0x01, 0x02, 0x03]);
        let v = op.signature[op.signature.len() - 1];
        assert!(v == 27 || v == 28);
    }

    #[tokio::test]
    async fn execute_estimates_over_prefix_plus_dummy_signature() {
        let bundler = Arc::new(RecordingBundler::default());
        let service = service(reader(), bundler.clone());
        let job = job();

        service.execute(&job).await.unwrap();

        let estimated = bundler.estimated.lock().unwrap();
        let op = &estimated[0];
        assert_eq!(op.signature.len(), 3 + 65);
        assert_eq!(&op.signature[..3], &[0x01, 0x02, 0x03]);
        assert_eq!(&op.signature[3..], dummy_signature().as_ref());
    }

    #[tokio::test]
    async fn execute_attaches_sponsor_paymaster_when_configured() {
        let bundler = Arc::new(RecordingBundler::default());
        let handle = ChainHandle {
            chain_id: CHAIN_ID,
            reader: Arc::new(reader()),
            bundler: bundler.clone(),
        };
        let registry = ChainRegistry::new(HashMap::from([(CHAIN_ID, Arc::new(handle))]));
        let signer = UserOpSigner::from_bytes(&[0x11u8; 32]).unwrap();
        let paymaster = address!("7777777777777777777777777777777777777777");
        let service = ExecutionService::new(Arc::new(registry), signer, Some(paymaster));

        service.execute(&job()).await.unwrap();
        assert_eq!(
            bundler.sent.lock().unwrap()[0].paymaster,
            Some(paymaster)
        );
    }

    #[tokio::test]
    async fn estimate_failure_is_classified_and_carries_rpc_data() {
        let bundler = Arc::new(RecordingBundler {
            fail_estimate: true,
            ..Default::default()
        });
        let service = service(reader(), bundler);
        let err = service.execute(&job()).await.unwrap_err();
        assert!(matches!(err, ExecuteError::Estimate(_)));
        let rendered = err.to_string();
        assert!(rendered.contains("estimate user operation gas"));
    }

    #[tokio::test]
    async fn unknown_chain_is_rejected_before_any_rpc() {
        let service = service(reader(), Arc::new(RecordingBundler::default()));
        let mut job = job();
        job.chain_id = 1;
        assert!(matches!(
            service.execute(&job).await.unwrap_err(),
            ExecuteError::UnsupportedChain(1)
        ));
    }
}
