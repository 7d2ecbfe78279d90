//! Account and peer identity keys: ECDSA over secp256k1 with SHA3-256 digests.
//!
//! Everything signed on the wire is the *raw text* of the thing being signed:
//! an amount's decimal rendering, a hash string, or one of the fixed proof
//! strings (`"VALIDATION"`, `"VERIFY"`). Public keys encode as SEC1 bytes;
//! the wire and key-file forms additionally gzip that encoding.

use k256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use signature::{DigestSigner, DigestVerifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use zeroize::Zeroizing;

use crate::{constants, TxHash};

/// Fixed size of a serialized ECDSA signature (r ‖ s).
const SIGNATURE_BYTES: usize = 64;

/// Errors from key handling.
#[derive(Clone, Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("key I/O error: {0}")]
    Io(String),
    #[error("malformed key material: {0}")]
    Malformed(String),
}

/// A detached ECDSA signature over the SHA3-256 digest of a text message.
///
/// Inner bytes are `pub(crate)` so size validation happens through
/// deserialization; an empty signature never verifies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(pub(crate) Vec<u8>);

impl Signature {
    /// An empty signature (placeholder that always fails verification).
    pub fn empty() -> Self {
        Signature(vec![])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
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
        if !bytes.is_empty() && bytes.len() != SIGNATURE_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid signature: expected {} bytes, got {}",
                SIGNATURE_BYTES,
                bytes.len()
            )));
        }
        Ok(Signature(bytes))
    }
}

/// A secp256k1 verifying key identifying an account or a peer.
#[derive(Clone, Debug)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Serialize to the raw SEC1 encoding. This is the byte form the account
    /// hash and the transaction hash contributions are computed over.
    pub fn save(&self) -> Vec<u8> {
        self.0.to_sec1_bytes().into_vec()
    }

    /// Parse a raw SEC1 encoding.
    pub fn load(bytes: &[u8]) -> Result<Self, KeyError> {
        VerifyingKey::from_sec1_bytes(bytes)
            .map(PublicKey)
            .map_err(|e| KeyError::Malformed(e.to_string()))
    }

    /// The account hash: SHA3-256-base64 of the SEC1 encoding. This is the
    /// textual address peers exchange and `find_account` resolves.
    pub fn account_hash(&self) -> TxHash {
        crate::hash_b64(&self.save())
    }

    /// Verify `signature` over the raw text of `message`.
    pub fn verify(&self, message: &str, signature: &Signature) -> bool {
        let Ok(sig) = EcdsaSignature::from_slice(&signature.0) else {
            return false;
        };
        self.0
            .verify_digest(Sha3_256::new_with_prefix(message.as_bytes()), &sig)
            .is_ok()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for PublicKey {}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        // Wire form is the gzip-compressed SEC1 encoding.
        serde::Serialize::serialize(&crate::gzip(&self.save()), s)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let compressed: Vec<u8> = serde::Deserialize::deserialize(d)?;
        let raw = crate::gunzip(&compressed)
            .map_err(|e| serde::de::Error::custom(format!("key decompression failed: {e}")))?;
        PublicKey::load(&raw).map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}

/// A secp256k1 signing key. Never serialized onto the wire; the inner scalar
/// is zeroized when dropped.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl SecretKey {
    /// Sign the raw text of `message`.
    pub fn sign(&self, message: &str) -> Signature {
        let sig: EcdsaSignature = self
            .0
            .sign_digest(Sha3_256::new_with_prefix(message.as_bytes()));
        Signature(sig.to_bytes().to_vec())
    }
}

/// A public/secret keypair. Shared between the console, mining, and gossip
/// layers via `Arc`; only signatures ever leave the process.
#[derive(Clone)]
pub struct Keypair {
    pub public: PublicKey,
    secret: SecretKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let signing = SigningKey::random(&mut OsRng);
        Keypair {
            public: PublicKey(*signing.verifying_key()),
            secret: SecretKey(signing),
        }
    }

    /// Sign the raw text of `message` with the secret half.
    pub fn sign(&self, message: &str) -> Signature {
        self.secret.sign(message)
    }

    /// A keypair is valid iff its halves were created from each other:
    /// the public key must verify a fresh signature over the fixed
    /// validation text.
    pub fn validate(&self) -> bool {
        let sig = self.sign(constants::KEY_VALIDATION_TEXT);
        self.public.verify(constants::KEY_VALIDATION_TEXT, &sig)
    }

    /// Serialize the keypair to the gzip-compressed key-file form.
    pub fn save(&self) -> Vec<u8> {
        let secret = Zeroizing::new(self.secret.0.to_bytes().to_vec());
        let material = (secret.as_slice(), self.public.save());
        let encoded = Zeroizing::new(bincode::serialize(&material).expect("key material encodes"));
        crate::gzip(&encoded)
    }

    /// Load a keypair from the key-file form, checking that the halves
    /// belong together.
    pub fn load(data: &[u8]) -> Result<Self, KeyError> {
        let raw = Zeroizing::new(crate::gunzip(data).map_err(|e| KeyError::Io(e.to_string()))?);
        let (secret_bytes, public_bytes): (Vec<u8>, Vec<u8>) =
            bincode::deserialize(&raw).map_err(|e| KeyError::Malformed(e.to_string()))?;
        let secret_bytes = Zeroizing::new(secret_bytes);
        let signing = SigningKey::from_slice(&secret_bytes)
            .map_err(|e| KeyError::Malformed(e.to_string()))?;
        let pair = Keypair {
            public: PublicKey::load(&public_bytes)?,
            secret: SecretKey(signing),
        };
        if !pair.validate() {
            return Err(KeyError::InvalidKey(
                "public and secret halves were not created from each other".into(),
            ));
        }
        Ok(pair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let pair = Keypair::generate();
        let sig = pair.sign("1000000.000000");
        assert!(pair.public.verify("1000000.000000", &sig));
        assert!(!pair.public.verify("1000000.000001", &sig));
    }

    #[test]
    fn foreign_signature_rejected() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let sig = a.sign("VERIFY");
        assert!(!b.public.verify("VERIFY", &sig));
    }

    #[test]
    fn empty_signature_never_verifies() {
        let pair = Keypair::generate();
        assert!(!pair.public.verify("anything", &Signature::empty()));
    }

    #[test]
    fn keypair_validates_itself() {
        assert!(Keypair::generate().validate());
    }

    #[test]
    fn public_key_sec1_roundtrip() {
        let pair = Keypair::generate();
        let restored = PublicKey::load(&pair.public.save()).unwrap();
        assert_eq!(restored, pair.public);
        assert_eq!(restored.account_hash(), pair.public.account_hash());
    }

    #[test]
    fn public_key_wire_roundtrip_is_compressed() {
        let pair = Keypair::generate();
        let wire = bincode::serialize(&pair.public).unwrap();
        let back: PublicKey = bincode::deserialize(&wire).unwrap();
        assert_eq!(back, pair.public);
    }

    #[test]
    fn keyfile_roundtrip() {
        let pair = Keypair::generate();
        let file = pair.save();
        let loaded = Keypair::load(&file).unwrap();
        assert_eq!(loaded.public, pair.public);
        let sig = loaded.sign("VERIFY");
        assert!(pair.public.verify("VERIFY", &sig));
    }

    #[test]
    fn keyfile_garbage_rejected() {
        assert!(Keypair::load(b"not a key file").is_err());
    }

    #[test]
    fn account_hashes_differ_between_keys() {
        let a = Keypair::generate().public.account_hash();
        let b = Keypair::generate().public.account_hash();
        assert_ne!(a, b);
    }

    #[test]
    fn signature_deserialize_rejects_bad_length() {
        let bad = bincode::serialize(&vec![1u8; 17]).unwrap();
        assert!(bincode::deserialize::<Signature>(&bad).is_err());
    }
}
