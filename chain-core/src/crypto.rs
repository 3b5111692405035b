//! Cryptographic operations for the chain
//!
//! This module provides:
//! - SHA-256 hashing (hex digests are the chain's on-disk form)
//! - secp256k1 ECDSA key pair generation, signing, and verification
//! - Key persistence as hex files
//!
//! Signatures are the fixed-width `r || s` concatenation, each scalar
//! zero-padded to 64 hex characters. Public keys are SEC1-compressed
//! (parity prefix `02`/`03` followed by the x-coordinate).

use crate::{Error, Result};
use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Length of a hex-encoded signature (two 64-char scalars)
pub const SIGNATURE_HEX_LEN: usize = 128;

/// Length of a hex-encoded compressed public key
pub const PUBLIC_KEY_HEX_LEN: usize = 66;

const PRIVATE_KEY_FILE: &str = "private_key.hex";
const PUBLIC_KEY_FILE: &str = "public_key.hex";

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 as lowercase hex
pub fn hash_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(hash_bytes(data.as_ref()))
}

/// Sign canonical bytes with a hex-encoded private scalar
pub fn sign(message: &[u8], private_key_hex: &str) -> Result<String> {
    let keypair = KeyPair::from_private_hex(private_key_hex)?;
    keypair.sign(message)
}

/// Verify a hex signature over canonical bytes
///
/// Total: malformed signatures, malformed keys, and mismatches all yield
/// `false`. Signatures of the wrong length are rejected before any parsing.
pub fn verify(message: &[u8], signature_hex: &str, public_key_hex: &str) -> bool {
    if signature_hex.len() != SIGNATURE_HEX_LEN {
        return false;
    }

    let signature = match hex::decode(signature_hex)
        .ok()
        .and_then(|bytes| Signature::from_slice(&bytes).ok())
    {
        Some(sig) => sig,
        None => return false,
    };

    let verifying_key = match hex::decode(public_key_hex)
        .ok()
        .and_then(|bytes| VerifyingKey::from_sec1_bytes(&bytes).ok())
    {
        Some(key) => key,
        None => return false,
    };

    let digest = hash_bytes(message);
    verifying_key.verify_prehash(&digest, &signature).is_ok()
}

/// secp256k1 key pair
pub struct KeyPair {
    signing_key: SigningKey,
    public_key_hex: String,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut rand::rngs::OsRng))
    }

    /// Restore from a hex-encoded 32-byte private scalar
    pub fn from_private_hex(private_key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(private_key_hex.trim())
            .map_err(|e| Error::Crypto(format!("Invalid private key hex: {}", e)))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| Error::Crypto(format!("Invalid private key: {}", e)))?;
        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key_hex = hex::encode(
            signing_key
                .verifying_key()
                .to_encoded_point(true)
                .as_bytes(),
        );
        Self {
            signing_key,
            public_key_hex,
        }
    }

    /// Compressed public key (66 hex chars)
    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    /// Private scalar as hex (USE WITH CAUTION - should be protected)
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Sign a message: SHA-256 digest, then ECDSA over the digest
    pub fn sign(&self, message: &[u8]) -> Result<String> {
        let digest = hash_bytes(message);
        let signature: Signature = self
            .signing_key
            .sign_prehash(&digest)
            .map_err(|e| Error::Crypto(format!("Signature creation failed: {}", e)))?;
        Ok(hex::encode(signature.to_bytes()))
    }

    /// Verify a signature against this key pair's public key
    pub fn verify(&self, message: &[u8], signature_hex: &str) -> bool {
        verify(message, signature_hex, &self.public_key_hex)
    }

    /// Write `private_key.hex` and `public_key.hex` into `dir`
    pub fn save(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(PRIVATE_KEY_FILE), self.private_key_hex())?;
        std::fs::write(dir.join(PUBLIC_KEY_FILE), &self.public_key_hex)?;
        tracing::info!(path = %dir.display(), "Keys saved");
        Ok(())
    }

    /// Load keys from `dir`; `None` when no key files exist there
    pub fn load(dir: impl AsRef<Path>) -> Result<Option<Self>> {
        let dir = dir.as_ref();
        let private_path = dir.join(PRIVATE_KEY_FILE);
        if !private_path.exists() {
            return Ok(None);
        }

        let keypair = Self::from_private_hex(&std::fs::read_to_string(private_path)?)?;

        let public_path = dir.join(PUBLIC_KEY_FILE);
        if public_path.exists() {
            let stored = std::fs::read_to_string(public_path)?;
            if stored.trim() != keypair.public_key_hex {
                return Err(Error::Crypto(format!(
                    "Public key in {} does not match private key",
                    dir.display()
                )));
            }
        }

        Ok(Some(keypair))
    }

    /// Load keys from `dir`, generating and saving a fresh pair if absent
    pub fn load_or_generate(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        match Self::load(dir)? {
            Some(keypair) => Ok(keypair),
            None => {
                let keypair = Self::generate();
                keypair.save(dir)?;
                Ok(keypair)
            }
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_hex)
            .finish_non_exhaustive()
    }
}
