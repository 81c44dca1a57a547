use alloy::primitives::aliases::U192;
use alloy::primitives::{Address, Bytes, U256, address};
use serde::{Deserialize, Serialize, Serializer};

/// Canonical ERC-4337 v0.7 EntryPoint address.
pub const ENTRY_POINT_V07: Address = address!("0000000071727De22E5E9d8BAf0edAc6f37da032");

/// ERC-4337 v0.7 user operation, in the unpacked form bundlers accept over
/// JSON-RPC.
///
/// Gas and fee fields are 256-bit on the wire but must each fit in 128 bits
/// to be packable (see [`crate::pack`]). The `nonce` serializes as a 32-byte
/// zero-padded hex string; every other quantity uses minimal hex. Bundlers
/// reject ops whose `nonce` is not exactly 64 hex digits, so the asymmetry is
/// deliberate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    #[serde(serialize_with = "serialize_padded_u256")]
    pub nonce: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_data: Option<Bytes>,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub max_fee_per_gas: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_verification_gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_post_op_gas_limit: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paymaster_data: Option<Bytes>,
    pub signature: Bytes,
}

impl UserOperation {
    /// The high 192 bits of the nonce, naming an independent sequence under
    /// the same sender. `EntryPoint.getNonce(sender, key)` returns the full
    /// 256-bit nonce for this key.
    pub fn nonce_key(&self) -> U192 {
        (self.nonce >> 64usize).to::<U192>()
    }
}

fn serialize_padded_u256<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("0x{}", hex::encode(value.to_be_bytes::<32>())))
}
