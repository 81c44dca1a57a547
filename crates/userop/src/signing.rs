use alloy::primitives::utils::eip191_hash_message;
use alloy::primitives::{Address, B256, Bytes, keccak256};
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("invalid private key")]
    InvalidKey,
    #[error("ecdsa signing failed: {0}")]
    Ecdsa(#[from] k256::ecdsa::Error),
}

/// Placeholder signature appended before gas estimation. Bundler verifiers
/// charge per calldata byte, so the stand-in must have the length and entropy
/// of a real 65-byte ECDSA signature.
pub fn dummy_signature() -> Bytes {
    let mut sig = [0xffu8; 65];
    sig[64] = 0x1c;
    Bytes::from(sig.to_vec())
}

/// Holds the scheduler's ECDSA key and signs user-operation hashes with the
/// EIP-191 personal-sign prefix.
pub struct UserOpSigner {
    key: SigningKey,
    address: Address,
}

impl UserOpSigner {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, SignError> {
        let key = SigningKey::from_slice(bytes).map_err(|_| SignError::InvalidKey)?;
        let encoded = key.verifying_key().to_encoded_point(false);
        let digest = keccak256(&encoded.as_bytes()[1..]);
        let address = Address::from_slice(&digest[12..]);
        Ok(Self { key, address })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Signs `keccak256("\x19Ethereum Signed Message:\n32" ‖ hash)` and
    /// returns `r(32) ‖ s(32) ‖ v(1)` with `v ∈ {27, 28}`.
    pub fn sign_prefixed(&self, hash: B256) -> Result<[u8; 65], SignError> {
        let digest = eip191_hash_message(hash);
        let (signature, recovery_id) = self.key.sign_prehash_recoverable(digest.as_slice())?;
        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = 27 + recovery_id.to_byte();
        Ok(out)
    }
}
