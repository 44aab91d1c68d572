//! # secp256k1 Signatures
//!
//! ECDSA over secp256k1 using `k256`. Messages are signed as the double
//! SHA-256 of their bytes; keys travel in SEC1 compressed form and
//! signatures as 64-byte `r ‖ s`.

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::domain::{double_sha256, NodeIdentity, PublicKey, Signature};
use crate::error::{RegistryResult, SignerError};
use crate::ports::{MessageSigner, SignatureVerifier};
use crate::service::LocalPopnode;

/// Signs with the local popnode's node key.
pub struct EcdsaMessageSigner {
    key: SigningKey,
    public_key: PublicKey,
}

impl EcdsaMessageSigner {
    pub fn new(key: SigningKey) -> Self {
        let public_key = PublicKey::new(key.verifying_key().to_encoded_point(true).as_bytes());
        Self { key, public_key }
    }

    /// Load a 32-byte secret scalar.
    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self, SignerError> {
        let key = SigningKey::from_slice(secret).map_err(|_| SignerError::InvalidKey)?;
        Ok(Self::new(key))
    }
}

/// The popnode this process runs, signing with the raw node key `secret`.
pub fn local_popnode(
    identity: NodeIdentity,
    addr: SocketAddr,
    secret: &[u8],
) -> RegistryResult<LocalPopnode> {
    let signer = EcdsaMessageSigner::from_secret_bytes(secret)?;
    Ok(LocalPopnode {
        identity,
        addr,
        signer: Arc::new(signer),
    })
}

impl MessageSigner for EcdsaMessageSigner {
    fn public_key(&self) -> PublicKey {
        self.public_key.clone()
    }

    fn sign(&self, message: &[u8]) -> Result<Signature, SignerError> {
        let digest = double_sha256(message);
        let signature: EcdsaSignature = self
            .key
            .sign_prehash(&digest)
            .map_err(|e| SignerError::Signing(e.to_string()))?;
        Ok(Signature(signature.to_bytes().to_vec()))
    }
}

/// Verifies signatures made by [`EcdsaMessageSigner`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EcdsaSignatureVerifier;

impl EcdsaSignatureVerifier {
    pub fn new() -> Self {
        Self
    }
}

impl SignatureVerifier for EcdsaSignatureVerifier {
    fn verify(&self, key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(&key.0) else {
            return false;
        };
        let Ok(signature) = EcdsaSignature::from_slice(&signature.0) else {
            return false;
        };
        verifying_key
            .verify_prehash(&double_sha256(message), &signature)
            .is_ok()
    }
}
