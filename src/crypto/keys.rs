//! Ed25519 key management and validator address derivation.
//!
//! A validator address is the last 20 bytes of the Keccak-256 hash of the
//! public key, so addresses commit to keys without carrying them.

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};

use crate::{keccak256, Address};

/// Ed25519 signature size in bytes.
pub(crate) const SIGNATURE_BYTES: usize = 64;

/// An Ed25519 verifying key (32 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningPublicKey(pub(crate) [u8; 32]);

/// A detached Ed25519 signature.
///
/// Inner bytes are `pub(crate)` so sizes are validated during
/// deserialization rather than at every verification site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(pub(crate) Vec<u8>);

impl Signature {
    /// Create an empty signature (unsigned event under construction).
    pub fn empty() -> Self {
        Signature(vec![])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Access the raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Reconstruct a signature from raw bytes, validating the length.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        if bytes.is_empty() || bytes.len() == SIGNATURE_BYTES {
            Some(Signature(bytes))
        } else {
            None
        }
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(&self.0, s)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        // Allow empty signatures (events under construction) and full
        // Ed25519 signatures; reject anything else.
        if !bytes.is_empty() && bytes.len() != SIGNATURE_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid Ed25519 signature: expected {} bytes, got {}",
                SIGNATURE_BYTES,
                bytes.len()
            )));
        }
        Ok(Signature(bytes))
    }
}

/// An Ed25519 signing keypair.
#[derive(Clone)]
pub struct SigningKeypair {
    signing: ed25519_dalek::SigningKey,
    pub public: SigningPublicKey,
}

impl SigningKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let signing = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        let public = SigningPublicKey(signing.verifying_key().to_bytes());
        SigningKeypair { signing, public }
    }

    /// Reconstruct a keypair from a 32-byte secret seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
        let public = SigningPublicKey(signing.verifying_key().to_bytes());
        SigningKeypair { signing, public }
    }

    /// Sign a message, producing a detached signature.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.signing.sign(message);
        Signature(sig.to_bytes().to_vec())
    }

    /// The validator address of this keypair's public key.
    pub fn address(&self) -> Address {
        self.public.address()
    }
}

impl SigningPublicKey {
    /// Access the raw public key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Derive the 20-byte validator address: last 20 bytes of Keccak-256
    /// of the public key.
    pub fn address(&self) -> Address {
        let digest = keccak256(&self.0);
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&digest[12..]);
        addr
    }

    /// Verify a detached signature against this public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let key = match ed25519_dalek::VerifyingKey::from_bytes(&self.0) {
            Ok(k) => k,
            Err(_) => return false,
        };
        let raw: [u8; SIGNATURE_BYTES] = match signature.0.as_slice().try_into() {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        key.verify(message, &ed25519_dalek::Signature::from_bytes(&raw))
            .is_ok()
    }
}
