//! Signer using the k256 Rust crate (implementation of ecdsa in Rust).

use crate::abiencode::types::{Address, Hash, Signature};
use k256::{
    ecdsa::{
        recoverable,
        signature::{hazmat::PrehashSigner, Signature as k256Signature},
        SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use super::hash_to_eth_signed_msg_hash;

#[derive(Debug, Error)]
pub enum SigError {
    #[error("recovery byte {0} is neither 27 nor 28")]
    InvalidRecoveryByte(u8),
    #[error("ecdsa: {0}")]
    Ecdsa(#[from] k256::ecdsa::Error),
}

/// Holds the private key of one engine instance. The key never leaves this
/// type; everything that needs a signature asks the signer for it.
#[derive(Clone)]
pub struct Signer {
    key: SigningKey,
    addr: Address,
}

impl core::fmt::Debug for Signer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Signer").field("addr", &self.addr).finish()
    }
}

impl From<VerifyingKey> for Address {
    fn from(key: VerifyingKey) -> Self {
        // The uncompressed point is 0x04 || x || y, the address is taken from
        // the hash of x || y.
        let point = key.to_encoded_point(false);
        let hash: [u8; 32] = Keccak256::digest(&point.as_bytes()[1..]).into();

        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash[32 - 20..]);
        addr
    }
}

impl Signer {
    pub fn new<R: rand::RngCore + rand::CryptoRng>(rng: &mut R) -> Self {
        Self::from_key(SigningKey::random(rng))
    }

    /// Imports an existing 32 byte secp256k1 secret.
    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self, SigError> {
        Ok(Self::from_key(SigningKey::from_bytes(secret)?))
    }

    fn from_key(key: SigningKey) -> Self {
        let addr = key.verifying_key().into();
        Self { key, addr }
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    pub fn sign_eth(&self, msg: Hash) -> Result<Signature, SigError> {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        let sig: recoverable::Signature = self.key.sign_prehash(&hash.0)?;

        // r || s || v, but the EVM expects v to be offset by 27.
        let mut sig_bytes = [0u8; 65];
        sig_bytes.copy_from_slice(sig.as_bytes());
        sig_bytes[64] += 27;

        Ok(Signature(sig_bytes))
    }
}

/// Recovers the address that produced `eth_sig` over `msg`.
pub fn recover_signer(msg: Hash, eth_sig: &Signature) -> Result<Address, SigError> {
    let hash = hash_to_eth_signed_msg_hash(msg);

    let mut sig_bytes: [u8; 65] = eth_sig.0;
    sig_bytes[64] = match sig_bytes[64] {
        v @ (27 | 28) => v - 27,
        v => return Err(SigError::InvalidRecoveryByte(v)),
    };

    let sig = recoverable::Signature::from_bytes(&sig_bytes)?;
    let verifying_key = sig.recover_verifying_key_from_digest_bytes(&hash.0.into())?;
    Ok(verifying_key.into())
}
