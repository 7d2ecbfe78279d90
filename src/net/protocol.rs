//! Gossip wire protocol: the message taxonomy and its codec.
//!
//! Transaction-bearing messages gzip their payload *inside* the message, not
//! at the transport: compression policy stays per message type, and a bus
//! implementation never needs to know which payloads compress well.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::keys::{Keypair, PublicKey, Signature};
use crate::transaction::Transaction;
use crate::{constants, TxHash};

/// Errors from message encoding.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message serialization failed: {0}")]
    SerializationFailed(String),
    #[error("message exceeds maximum size ({} bytes)", constants::MAX_MESSAGE_BYTES)]
    MessageTooLarge,
}

/// A payload stored as gzip-compressed bincode on the wire.
#[derive(Clone, Debug)]
pub struct Compressed<T>(pub T);

impl<T: Serialize> Serialize for Compressed<T> {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let raw = bincode::serialize(&self.0).map_err(serde::ser::Error::custom)?;
        serde::Serialize::serialize(&crate::gzip(&raw), s)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Compressed<T> {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let compressed: Vec<u8> = serde::Deserialize::deserialize(d)?;
        let raw = crate::gunzip(&compressed)
            .map_err(|e| serde::de::Error::custom(format!("payload decompression failed: {e}")))?;
        if raw.len() > constants::MAX_MESSAGE_BYTES {
            return Err(serde::de::Error::custom("decompressed payload too large"));
        }
        bincode::deserialize(&raw)
            .map(Compressed)
            .map_err(serde::de::Error::custom)
    }
}

/// A transaction plus the sender's proof that they vouch for its hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxEnvelope {
    /// The hash the sender claims for the transaction.
    pub hash: TxHash,
    /// Sender's signature over the hash text.
    pub signature: Signature,
    pub transaction: Transaction,
}

impl TxEnvelope {
    pub fn signed(transaction: &Transaction, keys: &Keypair) -> Self {
        let hash = transaction.hash().clone();
        TxEnvelope {
            signature: keys.sign(hash.as_str()),
            hash,
            transaction: transaction.clone(),
        }
    }
}

/// A genesis transaction offered for installation.
///
/// `claimed` is the hash the genesis goes by (after pruning this is an
/// inherited alias); `actual` is the recomputed transaction hash. The
/// signature covers both, concatenated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisEnvelope {
    pub claimed: TxHash,
    pub actual: TxHash,
    pub signature: Signature,
    pub genesis: Transaction,
}

impl GenesisEnvelope {
    pub fn signed(genesis: &Transaction, keys: &Keypair) -> Self {
        let claimed = genesis.hash().clone();
        let actual = genesis.compute_hash();
        let signature = keys.sign(&format!("{claimed}{actual}"));
        GenesisEnvelope {
            claimed,
            actual,
            signature,
            genesis: genesis.clone(),
        }
    }

    /// The text the envelope signature covers.
    pub fn signed_text(&self) -> String {
        format!("{}{}", self.claimed, self.actual)
    }
}

/// Gossip protocol messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    // ── Peer Keys ──
    /// "Please send me your public key."
    PublicKeySyncRequest,

    /// The sender's key plus a signature over the fixed verify text proving
    /// they hold the secret half.
    PublicKeySyncResponse { key: PublicKey, signature: Signature },

    // ── Genesis Voting ──
    /// "What hashes does your genesis alias?"
    GenesisVoteRequest,

    /// The sender's genesis lineage: alias hashes first, the actual genesis
    /// hash last, signed as one concatenated string.
    GenesisVoteResponse {
        hashes: Vec<TxHash>,
        signature: Signature,
    },

    // ── Tangle Sync ──
    /// "Replay your entire tangle to me."
    TangleSynchronizeRequest,

    /// "Start a background weight refresh."
    UpdateWeightsRequest,

    /// Install this transaction as the genesis (only honored while a sync is
    /// expected).
    SyncGenesis(Compressed<GenesisEnvelope>),

    // ── Transactions ──
    /// Normal broadcast of a freshly mined transaction.
    AddTransaction(Compressed<TxEnvelope>),

    /// Same payload, but the receiver suppresses weight recomputation while
    /// processing it (bulk synchronization).
    SynchronizationAddTransaction(Compressed<TxEnvelope>),
}

/// Serialize a message to bytes (length-prefixed).
///
/// Returns an error if serialization fails or the encoded message exceeds
/// [`constants::MAX_MESSAGE_BYTES`].
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload =
        bincode::serialize(msg).map_err(|e| ProtocolError::SerializationFailed(e.to_string()))?;
    if payload.len() > constants::MAX_MESSAGE_BYTES {
        return Err(ProtocolError::MessageTooLarge);
    }
    let len = (payload.len() as u32).to_le_bytes();
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Deserialize a message from bytes (after length prefix).
///
/// Rejects messages whose declared length exceeds
/// [`constants::MAX_MESSAGE_BYTES`] to prevent allocation-based DoS.
pub fn decode_message(data: &[u8]) -> Option<Message> {
    if data.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes(data[..4].try_into().ok()?) as usize;
    if len > constants::MAX_MESSAGE_BYTES {
        return None;
    }
    if data.len() < 4usize.saturating_add(len) {
        return None;
    }
    bincode::deserialize(&data[4..4 + len]).ok()
}
