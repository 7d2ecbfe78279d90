//! # Weft
//!
//! A peer-to-peer Tangle ledger:
//! - **DAG structure** — every transaction approves multiple parents; no blocks
//! - **Proof-of-work gating** — transactions are mined against a base64 target
//! - **MCMC tip selection** — a biased random walk weighted by cumulative weight
//! - **G-IOTA rescue** — left-behind tips are re-attached as extra parents
//! - **Gossip synchronization** — signed broadcast messages with orphan queueing
//! - **Prune-by-confidence** — fully confirmed tip sets collapse into a new genesis

pub mod config;
pub mod crypto;
pub mod net;
pub mod store;
pub mod tangle;
pub mod transaction;

use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

/// Protocol constants
pub mod constants {
    /// Default number of leading target characters a mined hash must carry
    pub const DEFAULT_DIFFICULTY: u8 = 3;
    /// Default mining target character ('A' is the least base64 symbol)
    pub const DEFAULT_MINING_TARGET: char = 'A';
    /// Default bias exponent for the tip-selection random walk
    pub const DEFAULT_WALK_ALPHA: f64 = 10.0;
    /// Tip-set snapshots are retained as pruning candidates when the tangle
    /// narrows to at most this many tips
    pub const GENESIS_CANDIDATE_THRESHOLD: usize = 3;
    /// A tip this far below the average parent height is "left behind" and
    /// gets attached as an extra parent (G-IOTA)
    pub const LEFT_BEHIND_TIP_DELTA: u64 = 5;
    /// Minimum number of walk starts used by confirmation confidence
    pub const WALK_SET_MIN: usize = 100;
    /// Initial orphan-queue capacity
    pub const ORPHAN_QUEUE_MIN: usize = 8;
    /// Orphan-queue capacity ceiling; beyond it the ring rotates
    pub const ORPHAN_QUEUE_MAX: usize = 1024;
    /// Maximum encoded gossip message size (16 MiB)
    pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
    /// Attempts to find a second distinct parent tip before giving up
    pub const DISTINCT_TIP_RETRIES: u8 = u8::MAX;
    /// Text signed by a keypair to prove the halves belong together
    pub const KEY_VALIDATION_TEXT: &str = "VALIDATION";
    /// Text signed to prove ownership of a broadcast public key
    pub const KEY_VERIFY_TEXT: &str = "VERIFY";
}

/// A transaction hash: the base64 rendering of a SHA3-256 digest.
///
/// Hashes are compared two ways. `Ord`/`PartialOrd` is plain string order and
/// is what parent lists are sorted by. [`TxHash::numeric_cmp`] is the mining
/// order, where longer strings are larger and characters rank by their base64
/// alphabet position (`A` least, `/` greatest).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

/// Sentinel text denoting "no hash".
const INVALID_HASH_TEXT: &str = "Invalid";

impl TxHash {
    /// The sentinel "no hash" value.
    pub fn invalid() -> Self {
        TxHash(INVALID_HASH_TEXT.to_string())
    }

    pub fn is_invalid(&self) -> bool {
        self.0 == INVALID_HASH_TEXT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap an already-encoded base64 digest.
    pub fn from_encoded(text: impl Into<String>) -> Self {
        TxHash(text.into())
    }

    /// Rank of a character in the mining order: base64 alphabet position.
    /// Padding (`=`) and foreign characters rank below every alphabet symbol.
    fn rank(c: u8) -> i16 {
        match c {
            b'A'..=b'Z' => (c - b'A') as i16,
            b'a'..=b'z' => (c - b'a') as i16 + 26,
            b'0'..=b'9' => (c - b'0') as i16 + 52,
            b'+' => 62,
            b'/' => 63,
            _ => -1,
        }
    }

    /// The mining total order: longer strings are larger; equal lengths
    /// compare character-wise by base64 alphabet rank.
    pub fn numeric_cmp(&self, other: &TxHash) -> std::cmp::Ordering {
        let (a, b) = (self.0.as_bytes(), other.0.as_bytes());
        a.len().cmp(&b.len()).then_with(|| {
            for (&x, &y) in a.iter().zip(b.iter()) {
                let ord = Self::rank(x).cmp(&Self::rank(y));
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        })
    }
}

impl std::fmt::Display for TxHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash arbitrary bytes into a [`TxHash`]: SHA3-256, base64, newline-free.
pub fn hash_b64(data: &[u8]) -> TxHash {
    use base64::Engine;
    let digest = Sha3_256::digest(data);
    let encoded = base64::engine::general_purpose::STANDARD.encode(digest);
    TxHash(encoded.replace('\n', ""))
}

/// Gzip-compress a byte slice.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    // Writing to a Vec cannot fail.
    encoder.write_all(data).expect("gzip into Vec");
    encoder.finish().expect("gzip finish into Vec")
}

/// Gunzip a byte slice. Fails on truncated or corrupt streams.
pub fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Read;
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
