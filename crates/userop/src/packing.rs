use alloy::primitives::{Address, B256, Bytes, U256, keccak256};
use alloy::sol_types::SolValue;
use thiserror::Error;

use crate::types::UserOperation;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackError {
    #[error("{field} does not fit in 128 bits")]
    GasValueTooLarge { field: &'static str },
    #[error("initCode shorter than a factory address")]
    MalformedInitCode,
    #[error("paymasterAndData shorter than the address + gas limit prefix")]
    MalformedPaymasterAndData,
}

/// ERC-4337 v0.7 wire layout. `accountGasLimits` and `gasFees` each pack two
/// 128-bit big-endian halves into one word; `initCode` and `paymasterAndData`
/// are concatenations of their unpacked parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedUserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub account_gas_limits: B256,
    pub pre_verification_gas: U256,
    pub gas_fees: B256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

pub fn pack(op: &UserOperation) -> Result<PackedUserOperation, PackError> {
    let init_code = match (op.factory, &op.factory_data) {
        (Some(factory), Some(data)) => {
            let mut buf = Vec::with_capacity(20 + data.len());
            buf.extend_from_slice(factory.as_slice());
            buf.extend_from_slice(data);
            Bytes::from(buf)
        }
        (Some(factory), None) => Bytes::from(factory.to_vec()),
        (None, _) => Bytes::new(),
    };

    let paymaster_and_data = match op.paymaster {
        Some(paymaster) => {
            let verification = be16(
                op.paymaster_verification_gas_limit.unwrap_or_default(),
                "paymasterVerificationGasLimit",
            )?;
            let post_op = be16(
                op.paymaster_post_op_gas_limit.unwrap_or_default(),
                "paymasterPostOpGasLimit",
            )?;
            let data: &[u8] = op
                .paymaster_data
                .as_ref()
                .map(|b| b.as_ref())
                .unwrap_or(&[]);
            let mut buf = Vec::with_capacity(52 + data.len());
            buf.extend_from_slice(paymaster.as_slice());
            buf.extend_from_slice(&verification);
            buf.extend_from_slice(&post_op);
            buf.extend_from_slice(data);
            Bytes::from(buf)
        }
        None => Bytes::new(),
    };

    Ok(PackedUserOperation {
        sender: op.sender,
        nonce: op.nonce,
        init_code,
        call_data: op.call_data.clone(),
        account_gas_limits: pack_pair(
            op.verification_gas_limit,
            "verificationGasLimit",
            op.call_gas_limit,
            "callGasLimit",
        )?,
        pre_verification_gas: op.pre_verification_gas,
        gas_fees: pack_pair(
            op.max_priority_fee_per_gas,
            "maxPriorityFeePerGas",
            op.max_fee_per_gas,
            "maxFeePerGas",
        )?,
        paymaster_and_data,
        signature: op.signature.clone(),
    })
}

pub fn unpack(packed: &PackedUserOperation) -> Result<UserOperation, PackError> {
    let (factory, factory_data) = if packed.init_code.is_empty() {
        (None, None)
    } else if packed.init_code.len() < 20 {
        return Err(PackError::MalformedInitCode);
    } else {
        let factory = Address::from_slice(&packed.init_code[..20]);
        let data = if packed.init_code.len() > 20 {
            Some(Bytes::copy_from_slice(&packed.init_code[20..]))
        } else {
            None
        };
        (Some(factory), data)
    };

    let (verification_gas_limit, call_gas_limit) = unpack_pair(packed.account_gas_limits);
    let (max_priority_fee_per_gas, max_fee_per_gas) = unpack_pair(packed.gas_fees);

    let mut op = UserOperation {
        sender: packed.sender,
        nonce: packed.nonce,
        factory,
        factory_data,
        call_data: packed.call_data.clone(),
        call_gas_limit,
        verification_gas_limit,
        pre_verification_gas: packed.pre_verification_gas,
        max_priority_fee_per_gas,
        max_fee_per_gas,
        paymaster: None,
        paymaster_verification_gas_limit: None,
        paymaster_post_op_gas_limit: None,
        paymaster_data: None,
        signature: packed.signature.clone(),
    };

    if !packed.paymaster_and_data.is_empty() {
        let pmd = &packed.paymaster_and_data;
        if pmd.len() < 52 {
            return Err(PackError::MalformedPaymasterAndData);
        }
        op.paymaster = Some(Address::from_slice(&pmd[..20]));
        op.paymaster_verification_gas_limit =
            Some(U256::from(u128::from_be_bytes(pmd[20..36].try_into().unwrap())));
        op.paymaster_post_op_gas_limit =
            Some(U256::from(u128::from_be_bytes(pmd[36..52].try_into().unwrap())));
        if pmd.len() > 52 {
            op.paymaster_data = Some(Bytes::copy_from_slice(&pmd[52..]));
        }
    }

    Ok(op)
}

/// ERC-4337 v0.7 user operation hash:
///
/// ```text
/// keccak256(abi.encode(
///     keccak256(abi.encode(sender, nonce, keccak256(initCode),
///                          keccak256(callData), accountGasLimits,
///                          preVerificationGas, gasFees,
///                          keccak256(paymasterAndData))),
///     entryPoint, chainId))
/// ```
pub fn user_op_hash_v07(
    op: &UserOperation,
    entry_point: Address,
    chain_id: u64,
) -> Result<B256, PackError> {
    Ok(hash_packed(&pack(op)?, entry_point, chain_id))
}

pub fn hash_packed(packed: &PackedUserOperation, entry_point: Address, chain_id: u64) -> B256 {
    let inner = keccak256(
        (
            packed.sender,
            packed.nonce,
            keccak256(&packed.init_code),
            keccak256(&packed.call_data),
            packed.account_gas_limits,
            packed.pre_verification_gas,
            packed.gas_fees,
            keccak256(&packed.paymaster_and_data),
        )
            .abi_encode(),
    );
    keccak256((inner, entry_point, U256::from(chain_id)).abi_encode())
}

fn be16(value: U256, field: &'static str) -> Result<[u8; 16], PackError> {
    u128::try_from(value)
        .map(u128::to_be_bytes)
        .map_err(|_| PackError::GasValueTooLarge { field })
}

fn pack_pair(
    high: U256,
    high_field: &'static str,
    low: U256,
    low_field: &'static str,
) -> Result<B256, PackError> {
    let mut word = [0u8; 32];
    word[..16].copy_from_slice(&be16(high, high_field)?);
    word[16..].copy_from_slice(&be16(low, low_field)?);
    Ok(B256::from(word))
}

fn unpack_pair(word: B256) -> (U256, U256) {
    let high = u128::from_be_bytes(word[..16].try_into().unwrap());
    let low = u128::from_be_bytes(word[16..].try_into().unwrap());
    (U256::from(high), U256::from(low))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn minimal_op() -> UserOperation {
        UserOperation {
            sender: address!("1234567890123456789012345678901234567890"),
            nonce: U256::ZERO,
            call_data: Bytes::from(vec![0x56, 0x78]),
            call_gas_limit: U256::from(100_000u64),
            verification_gas_limit: U256::from(200_000u64),
            pre_verification_gas: U256::from(50_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000u64),
            max_fee_per_gas: U256::from(2_000_000u64),
            signature: Bytes::from(vec![0xab, 0xcd]),
            ..Default::default()
        }
    }

    #[test]
    fn pack_minimal_op_gas_words() {
        let packed = pack(&minimal_op()).unwrap();
        assert_eq!(
            packed.account_gas_limits.as_slice(),
            hex::decode("00000000000000000000000000030d40000000000000000000000000000186a0")
                .unwrap()
                .as_slice(),
        );
        assert_eq!(
            packed.gas_fees.as_slice(),
            hex::decode("000000000000000000000000000f4240000000000000000000000000001e8480")
                .unwrap()
                .as_slice(),
        );
        assert!(packed.init_code.is_empty());
        assert!(packed.paymaster_and_data.is_empty());
        assert_eq!(packed.call_data, Bytes::from(vec![0x56, 0x78]));
    }

    #[test]
    fn pack_rejects_gas_values_wider_than_128_bits() {
        let mut op = minimal_op();
        op.call_gas_limit = U256::from(1u64) << 128;
        assert_eq!(
            pack(&op),
            Err(PackError::GasValueTooLarge {
                field: "callGasLimit"
            })
        );
    }

    #[test]
    fn pack_concatenates_paymaster_triple() {
        let mut op = minimal_op();
        op.paymaster = Some(address!("4444444444444444444444444444444444444444"));
        op.paymaster_verification_gas_limit = Some(U256::from(0x1111u64));
        op.paymaster_post_op_gas_limit = Some(U256::from(0x22u64));
        op.paymaster_data = Some(Bytes::from(vec![0xaa, 0xbb]));
        let packed = pack(&op).unwrap();
        assert_eq!(packed.paymaster_and_data.len(), 54);
        assert_eq!(&packed.paymaster_and_data[..20], op.paymaster.unwrap().as_slice());
        assert_eq!(&packed.paymaster_and_data[20..36], &{
            let mut w = [0u8; 16];
            w[14..].copy_from_slice(&[0x11, 0x11]);
            w
        });
        assert_eq!(packed.paymaster_and_data[51], 0x22);
        assert_eq!(&packed.paymaster_and_data[52..], &[0xaa, 0xbb]);
    }

    #[test]
    fn unpack_inverts_pack() {
        let mut op = minimal_op();
        op.factory = Some(address!("3333333333333333333333333333333333333333"));
        op.factory_data = Some(Bytes::from(vec![0x01, 0x02, 0x03]));
        op.paymaster = Some(address!("4444444444444444444444444444444444444444"));
        op.paymaster_verification_gas_limit = Some(U256::from(600_000u64));
        op.paymaster_post_op_gas_limit = Some(U256::from(70_000u64));
        op.paymaster_data = Some(Bytes::from(vec![0xcc]));

        let packed = pack(&op).unwrap();
        assert_eq!(unpack(&packed).unwrap(), op);
    }

    #[test]
    fn unpack_inverts_pack_without_optionals() {
        let op = minimal_op();
        let packed = pack(&op).unwrap();
        assert_eq!(unpack(&packed).unwrap(), op);
    }

    #[test]
    fn unpack_rejects_truncated_paymaster_and_data() {
        let mut packed = pack(&minimal_op()).unwrap();
        packed.paymaster_and_data = Bytes::from(vec![0u8; 51]);
        assert_eq!(unpack(&packed), Err(PackError::MalformedPaymasterAndData));
    }

    #[test]
    fn hash_is_deterministic_and_nonce_sensitive() {
        let op = minimal_op();
        let entry_point = crate::ENTRY_POINT_V07;
        let first = user_op_hash_v07(&op, entry_point, 1).unwrap();
        let second = user_op_hash_v07(&op, entry_point, 1).unwrap();
        assert_eq!(first, second);

        let mut mutated = op.clone();
        mutated.nonce = U256::from(2u64);
        assert_ne!(user_op_hash_v07(&mutated, entry_point, 1).unwrap(), first);
    }

    #[test]
    fn hash_depends_on_every_input() {
        let base = minimal_op();
        let entry_point = crate::ENTRY_POINT_V07;
        let reference = user_op_hash_v07(&base, entry_point, 11155111).unwrap();

        let mut sender = base.clone();
        sender.sender = address!("9999999999999999999999999999999999999999");
        assert_ne!(user_op_hash_v07(&sender, entry_point, 11155111).unwrap(), reference);

        let mut call_data = base.clone();
        call_data.call_data = Bytes::from(vec![0x00]);
        assert_ne!(user_op_hash_v07(&call_data, entry_point, 11155111).unwrap(), reference);

        let mut gas = base.clone();
        gas.max_fee_per_gas = U256::from(3_000_000u64);
        assert_ne!(user_op_hash_v07(&gas, entry_point, 11155111).unwrap(), reference);

        let other_entry = address!("5FF137D4b0FDCD49DcA30c7CF57E578a026d2789");
        assert_ne!(user_op_hash_v07(&base, other_entry, 11155111).unwrap(), reference);

        assert_ne!(user_op_hash_v07(&base, entry_point, 84532).unwrap(), reference);
    }

    #[test]
    fn signature_does_not_affect_hash() {
        let mut op = minimal_op();
        let entry_point = crate::ENTRY_POINT_V07;
        let reference = user_op_hash_v07(&op, entry_point, 1).unwrap();
        op.signature = Bytes::from(vec![0xff; 65]);
        assert_eq!(user_op_hash_v07(&op, entry_point, 1).unwrap(), reference);
    }
}
