//! Cryptographic primitives for PeerVault.
//!
//! Wraps Ed25519 signing and Blake3 hashing/key derivation with strong types.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Key-derivation contexts. Changing any of these changes every identity.
mod contexts {
    pub const TOPIC: &str = "peervault overlay topic v0";
    pub const DEVICE_LOG_KEY: &str = "peervault device log key v0";
}

/// A 32-byte Blake3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blake3Hash(pub [u8; 32]);

impl Blake3Hash {
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blake3({})", &self.to_hex()[..16])
    }
}

/// Secret material shared by every device of one identity.
///
/// Produced by the onboarding/unlock flow; opaque here beyond being the input
/// to topic and log-key derivation.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentitySeed([u8; 32]);

impl IdentitySeed {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Generate a random seed.
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }
}

impl fmt::Debug for IdentitySeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentitySeed(<redacted>)")
    }
}

/// Overlay-network rendezvous point for all devices of one identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic(pub [u8; 32]);

impl Topic {
    /// Derive the topic from the identity seed.
    pub fn derive(seed: &IdentitySeed) -> Self {
        Self(blake3::derive_key(contexts::TOPIC, seed.as_bytes()))
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", &self.to_hex()[..16])
    }
}

/// Public identity of a log: the owner's Ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogIdentity(pub [u8; 32]);

impl LogIdentity {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Text form used on the wire: lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the text form.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s).map_err(|e| CoreError::InvalidIdentity(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidIdentity(format!("expected 32 bytes: {s}")))?;
        Ok(Self(arr))
    }

    /// Verify a signature made by the owner of this log.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<(), CoreError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;
        let sig = Signature::from_bytes(&signature.0);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CoreError::InvalidPublicKey)
    }
}

impl fmt::Debug for LogIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogIdentity({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for LogIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ed25519Signature(pub [u8; 64]);

impl Ed25519Signature {
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Sig({}...)", &self.to_hex()[..16])
    }
}

impl TryFrom<&[u8]> for Ed25519Signature {
    type Error = CoreError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; 64] = slice
            .try_into()
            .map_err(|_| CoreError::EncodingError(format!("signature length {}", slice.len())))?;
        Ok(Self(arr))
    }
}

/// Signing key of a writable log.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Create from a 32-byte secret.
    pub fn from_secret(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    /// Derive the key of a device's local log.
    ///
    /// `device_nonce` is generated once per device and persisted next to the
    /// log, so devices sharing a seed still own distinct logs.
    pub fn derive_device_log(seed: &IdentitySeed, device_nonce: &[u8; 32]) -> Self {
        let mut material = [0u8; 64];
        material[..32].copy_from_slice(seed.as_bytes());
        material[32..].copy_from_slice(device_nonce);
        let secret = blake3::derive_key(contexts::DEVICE_LOG_KEY, &material);
        Self::from_secret(&secret)
    }

    /// The log identity this key writes as.
    pub fn identity(&self) -> LogIdentity {
        LogIdentity(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        Ed25519Signature(self.signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({:?})", self.identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_sign_verify() {
        let keypair = Keypair::generate();
        let message = b"vault entry";
        let signature = keypair.sign(message);

        keypair
            .identity()
            .verify(message, &signature)
            .expect("valid signature should verify");

        assert!(keypair.identity().verify(b"vault entrY", &signature).is_err());
    }

    #[test]
    fn test_device_logs_differ_per_nonce() {
        let seed = IdentitySeed::from_bytes([0x42; 32]);
        let a = Keypair::derive_device_log(&seed, &[1u8; 32]);
        let b = Keypair::derive_device_log(&seed, &[2u8; 32]);
        let a_again = Keypair::derive_device_log(&seed, &[1u8; 32]);

        assert_ne!(a.identity(), b.identity());
        assert_eq!(a.identity(), a_again.identity());
    }

    #[test]
    fn test_topic_is_deterministic_per_seed() {
        let seed = IdentitySeed::from_bytes([7u8; 32]);
        assert_eq!(Topic::derive(&seed), Topic::derive(&seed.clone()));
        assert_ne!(
            Topic::derive(&seed),
            Topic::derive(&IdentitySeed::from_bytes([8u8; 32]))
        );
    }

    #[test]
    fn test_identity_hex_roundtrip() {
        let id = Keypair::generate().identity();
        assert_eq!(LogIdentity::from_hex(&id.to_hex()).unwrap(), id);
        assert!(LogIdentity::from_hex("abcd").is_err());
        assert!(LogIdentity::from_hex("zz").is_err());
    }

    #[test]
    fn test_seed_debug_is_redacted() {
        let seed = IdentitySeed::from_bytes([0xAB; 32]);
        assert_eq!(format!("{:?}", seed), "IdentitySeed(<redacted>)");
    }
}
