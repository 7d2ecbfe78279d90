//! Value-transfer transactions.
//!
//! A transaction moves value from signed inputs to outputs while approving a
//! set of parent transactions. Its hash is the SHA3-256-base64 digest of the
//! canonical field concatenation, and proof of work is the search for a nonce
//! that pushes that hash under the mining target in the base64 order.

use serde::{Deserialize, Serialize};

use crate::crypto::keys::{Keypair, PublicKey, Signature};
use crate::{constants, TxHash};

/// Errors from transaction validation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TxError {
    #[error("transaction hash mismatch: computed `{actual}`, stored `{claimed}`")]
    InvalidHash { actual: TxHash, claimed: TxHash },
    #[error("input from account `{account}` carries a signature that does not verify")]
    InputSignature { account: TxHash },
}

/// The fixed decimal rendering of an amount. This exact text is what input
/// signatures are computed over and what the transaction hash ingests, so it
/// must never change shape.
pub fn decimal_text(amount: f64) -> String {
    format!("{amount:.6}")
}

/// A transaction input: an account, the amount it contributes, and the
/// account's signature over that amount's decimal text. The signature is the
/// only proof of consent; the secret key never appears.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Input {
    pub account: PublicKey,
    pub amount: f64,
    pub signature: Signature,
}

impl Input {
    /// Build an input signed by the contributing account's keypair.
    pub fn signed(keys: &Keypair, amount: f64) -> Self {
        Input {
            account: keys.public.clone(),
            amount,
            signature: keys.sign(&decimal_text(amount)),
        }
    }

    /// Check the account's signature over the amount.
    pub fn verify(&self) -> bool {
        self.account.verify(&decimal_text(self.amount), &self.signature)
    }

    fn hash_contribution(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(account_b64(&self.account).as_bytes());
        buf.extend_from_slice(decimal_text(self.amount).as_bytes());
        buf.extend_from_slice(self.signature.as_bytes());
    }
}

/// A transaction output: an account credited with an amount.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub account: PublicKey,
    pub amount: f64,
}

impl Output {
    pub fn new(account: PublicKey, amount: f64) -> Self {
        Output { account, amount }
    }

    fn hash_contribution(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(account_b64(&self.account).as_bytes());
        buf.extend_from_slice(decimal_text(self.amount).as_bytes());
    }
}

/// Base64 of the account's SEC1 encoding, as ingested by the hash.
fn account_b64(key: &PublicKey) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(key.save())
}

/// A value-transfer record in the tangle.
///
/// Fields are immutable after construction except through mining (which
/// advances the nonce and rehashes) and through the crate-internal genesis
/// aliasing used by pruning and genesis sync, where the stored hash is
/// deliberately *not* the recomputed hash.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    timestamp: i64,
    nonce: u64,
    difficulty: u8,
    target: char,
    inputs: Vec<Input>,
    outputs: Vec<Output>,
    parents: Vec<TxHash>,
    hash: TxHash,
}

impl Transaction {
    /// Construct a transaction. Parent hashes are sorted and deduplicated,
    /// the nonce is seeded randomly, and the hash is computed immediately.
    /// Construction never mines.
    pub fn new(
        parents: Vec<TxHash>,
        inputs: Vec<Input>,
        outputs: Vec<Output>,
        difficulty: u8,
    ) -> Self {
        let mut parents = parents;
        parents.sort();
        parents.dedup();

        let mut tx = Transaction {
            timestamp: utc_now(),
            nonce: rand::random(),
            difficulty,
            target: constants::DEFAULT_MINING_TARGET,
            inputs,
            outputs,
            parents,
            hash: TxHash::invalid(),
        };
        tx.hash = tx.compute_hash();
        tx
    }

    /// Construct a genesis transaction: no parents, no inputs, only the
    /// outputs that define the initial money supply.
    pub fn genesis(outputs: Vec<Output>) -> Self {
        Transaction::new(vec![], vec![], outputs, constants::DEFAULT_DIFFICULTY)
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn difficulty(&self) -> u8 {
        self.difficulty
    }

    pub fn target(&self) -> char {
        self.target
    }

    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn parents(&self) -> &[TxHash] {
        &self.parents
    }

    pub fn hash(&self) -> &TxHash {
        &self.hash
    }

    /// Recompute the hash over the canonical field concatenation:
    /// `timestamp ‖ nonce ‖ inputs(account ‖ amount ‖ signature) ‖
    /// outputs(account ‖ amount) ‖ parents…`.
    pub fn compute_hash(&self) -> TxHash {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.timestamp.to_string().as_bytes());
        buf.extend_from_slice(self.nonce.to_string().as_bytes());
        for input in &self.inputs {
            input.hash_contribution(&mut buf);
        }
        for output in &self.outputs {
            output.hash_contribution(&mut buf);
        }
        for parent in &self.parents {
            buf.extend_from_slice(parent.as_str().as_bytes());
        }
        crate::hash_b64(&buf)
    }

    /// Search for a nonce that satisfies the mining predicate. Pure CPU;
    /// callers run it on a worker thread when latency matters.
    pub fn mine(&mut self) {
        let started = std::time::Instant::now();
        while !self.validate_mined() {
            self.nonce = self.nonce.wrapping_add(1);
            self.hash = self.compute_hash();
        }
        tracing::debug!(
            hash = %self.hash,
            difficulty = self.difficulty,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "mined transaction"
        );
    }

    /// The mining predicate: the hash must be numerically at most the string
    /// of `difficulty` target characters padded with `/` to hash length. With
    /// the default target `'A'` (the least base64 symbol) this means the hash
    /// starts with `difficulty` copies of `'A'`.
    pub fn validate_mined(&self) -> bool {
        let len = self.hash.as_str().len();
        let difficulty = self.difficulty as usize;
        if difficulty > len {
            return false;
        }
        let mut target = String::with_capacity(len);
        for _ in 0..difficulty {
            target.push(self.target);
        }
        for _ in difficulty..len {
            target.push('/');
        }
        self.hash.numeric_cmp(&TxHash::from_encoded(target)) != std::cmp::Ordering::Greater
    }

    /// Value conservation: inputs must cover outputs.
    pub fn validate_totals(&self) -> bool {
        let input_sum: f64 = self.inputs.iter().map(|i| i.amount).sum();
        let output_sum: f64 = self.outputs.iter().map(|o| o.amount).sum();
        input_sum >= output_sum
    }

    /// Full integrity check: the stored hash must match the recomputed hash
    /// and every input's account must have signed its amount.
    pub fn validate_full(&self) -> Result<(), TxError> {
        let actual = self.compute_hash();
        if actual != self.hash {
            return Err(TxError::InvalidHash {
                actual,
                claimed: self.hash.clone(),
            });
        }
        for input in &self.inputs {
            if !input.verify() {
                return Err(TxError::InputSignature {
                    account: input.account.account_hash(),
                });
            }
        }
        Ok(())
    }

    /// Overwrite the stored hash. Only pruning and genesis synchronization
    /// use this: an aliased genesis deliberately carries another node's hash,
    /// so `compute_hash` will disagree with `hash` on such a transaction.
    pub(crate) fn force_hash(&mut self, hash: TxHash) {
        self.hash = hash;
    }

    /// Overwrite the parent list with alias hashes (genesis aliasing).
    pub(crate) fn force_parents(&mut self, parents: Vec<TxHash>) {
        self.parents = parents;
    }
}

/// UTC seconds since the epoch.
fn utc_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> Keypair {
        Keypair::generate()
    }

    #[test]
    fn construction_sorts_and_dedups_parents() {
        let a = crate::hash_b64(b"a");
        let b = crate::hash_b64(b"b");
        let (lo, hi) = if a < b { (a.clone(), b.clone()) } else { (b.clone(), a.clone()) };

        let tx = Transaction::new(vec![hi.clone(), lo.clone(), hi.clone()], vec![], vec![], 1);
        assert_eq!(tx.parents(), &[lo, hi]);
    }

    #[test]
    fn stored_hash_matches_computed_hash() {
        let keys = keypair();
        let tx = Transaction::new(
            vec![crate::hash_b64(b"parent")],
            vec![Input::signed(&keys, 5.0)],
            vec![Output::new(keys.public.clone(), 5.0)],
            1,
        );
        assert_eq!(tx.compute_hash(), *tx.hash());
        assert!(tx.validate_full().is_ok());
    }

    #[test]
    fn hash_covers_every_field() {
        let keys = keypair();
        let base = Transaction::new(vec![], vec![], vec![Output::new(keys.public.clone(), 1.0)], 1);
        let mut other = base.clone();
        other.nonce = other.nonce.wrapping_add(1);
        assert_ne!(base.compute_hash(), other.compute_hash());

        let mut retimed = base.clone();
        retimed.timestamp += 1;
        assert_ne!(base.compute_hash(), retimed.compute_hash());
    }

    #[test]
    fn tampered_hash_fails_full_validation() {
        let tx = {
            let mut tx = Transaction::new(vec![], vec![], vec![], 1);
            tx.force_hash(crate::hash_b64(b"somewhere else"));
            tx
        };
        assert!(matches!(
            tx.validate_full(),
            Err(TxError::InvalidHash { .. })
        ));
    }

    #[test]
    fn forged_input_signature_rejected() {
        let signer = keypair();
        let imposter = keypair();
        let mut input = Input::signed(&signer, 10.0);
        input.account = imposter.public.clone();

        let tx = Transaction::new(vec![], vec![input], vec![], 1);
        assert!(matches!(
            tx.validate_full(),
            Err(TxError::InputSignature { .. })
        ));
    }

    #[test]
    fn totals_require_inputs_to_cover_outputs() {
        let keys = keypair();
        let balanced = Transaction::new(
            vec![],
            vec![Input::signed(&keys, 2.0)],
            vec![Output::new(keys.public.clone(), 2.0)],
            1,
        );
        assert!(balanced.validate_totals());

        let inflating = Transaction::new(
            vec![],
            vec![Input::signed(&keys, 1.0)],
            vec![Output::new(keys.public.clone(), 2.0)],
            1,
        );
        assert!(!inflating.validate_totals());
    }

    #[test]
    fn mining_produces_target_prefix() {
        let mut tx = Transaction::new(vec![], vec![], vec![], 1);
        tx.mine();
        assert!(tx.validate_mined());
        assert!(tx.hash().as_str().starts_with('A'));
        assert_eq!(tx.compute_hash(), *tx.hash());
    }

    #[test]
    fn high_difficulty_predicate_requires_full_prefix() {
        let mut tx = Transaction::new(vec![], vec![], vec![], 5);
        tx.force_hash(TxHash::from_encoded(format!("AAAAA{}", "B".repeat(39))));
        assert!(tx.validate_mined());

        tx.force_hash(TxHash::from_encoded(format!("AAAAB{}", "A".repeat(39))));
        assert!(!tx.validate_mined());
    }

    #[test]
    fn difficulty_longer_than_hash_is_never_mined() {
        let mut tx = Transaction::new(vec![], vec![], vec![], 255);
        tx.force_hash(TxHash::from_encoded("AAAA"));
        assert!(!tx.validate_mined());
    }

    #[test]
    fn decimal_text_is_fixed_width() {
        assert_eq!(decimal_text(1_000_000.0), "1000000.000000");
        assert_eq!(decimal_text(0.5), "0.500000");
    }

    #[test]
    fn serde_roundtrip_preserves_hash() {
        let keys = keypair();
        let tx = Transaction::new(
            vec![crate::hash_b64(b"p")],
            vec![Input::signed(&keys, 3.0)],
            vec![Output::new(keys.public.clone(), 3.0)],
            2,
        );
        let bytes = bincode::serialize(&tx).unwrap();
        let back: Transaction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.hash(), tx.hash());
        assert_eq!(back.parents(), tx.parents());
        assert!(back.validate_full().is_ok());
    }
}
