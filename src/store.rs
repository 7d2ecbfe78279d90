//! Tangle snapshots: a gzip stream whose cleartext is the transaction count
//! followed by every transaction, genesis first and the rest in timestamp
//! order.
//!
//! Loading replays the snapshot through the same gossip handlers a live sync
//! uses (self-addressed), so the signature checks, the orphan queue, and the
//! weight refresh all apply to disk data exactly as they do to network data.

use std::io::{Read, Write};

use crate::net::{Compressed, GenesisEnvelope, Message, NetTangle, TxEnvelope};
use crate::tangle::Tangle;
use crate::transaction::Transaction;

/// Errors from snapshot save/load.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("snapshot I/O error: {0}")]
    Io(String),
    #[error("snapshot serialization error: {0}")]
    Serialization(String),
    #[error("snapshot is empty")]
    Empty,
    #[error("cannot load a tangle without a personal keypair")]
    MissingKeys,
}

/// Write every reachable transaction as a compressed snapshot.
pub fn save_tangle<W: Write>(tangle: &Tangle, out: &mut W) -> Result<usize, StoreError> {
    let nodes = tangle.all_nodes();
    let genesis_hash = tangle.genesis().hash().clone();

    let mut transactions: Vec<Transaction> =
        nodes.iter().map(|n| n.transaction().clone()).collect();
    transactions.sort_by(|a, b| {
        use std::cmp::Ordering;
        if *a.hash() == genesis_hash {
            Ordering::Less
        } else if *b.hash() == genesis_hash {
            Ordering::Greater
        } else {
            a.timestamp().cmp(&b.timestamp())
        }
    });

    let cleartext =
        bincode::serialize(&transactions).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let compressed = crate::gzip(&cleartext);
    out.write_all(&compressed)
        .map_err(|e| StoreError::Io(e.to_string()))?;
    tracing::info!(
        transactions = transactions.len(),
        bytes = compressed.len(),
        "saved tangle snapshot"
    );
    Ok(transactions.len())
}

/// Read `size` bytes of snapshot and replay it into the tangle through the
/// self-addressed gossip path. Returns the number of transactions replayed.
pub fn load_tangle<R: Read>(
    net: &NetTangle,
    input: &mut R,
    size: usize,
) -> Result<usize, StoreError> {
    let keys = net.personal_keys().ok_or(StoreError::MissingKeys)?;

    let mut compressed = vec![0u8; size];
    input
        .read_exact(&mut compressed)
        .map_err(|e| StoreError::Io(e.to_string()))?;
    let cleartext = crate::gunzip(&compressed).map_err(|e| StoreError::Io(e.to_string()))?;
    let transactions: Vec<Transaction> =
        bincode::deserialize(&cleartext).map_err(|e| StoreError::Serialization(e.to_string()))?;

    let mut iter = transactions.into_iter();
    let genesis = iter.next().ok_or(StoreError::Empty)?;
    let count = 1 + iter.len();

    // The first transaction is the genesis: arm the sync gate and install it
    // through the same handler a remote sync would hit.
    net.expect_genesis(genesis.hash().clone());
    net.handle_message(
        net.self_id(),
        Message::SyncGenesis(Compressed(GenesisEnvelope::signed(&genesis, &keys))),
    );

    for tx in iter {
        net.handle_message(
            net.self_id(),
            Message::SynchronizationAddTransaction(Compressed(TxEnvelope::signed(&tx, &keys))),
        );
    }
    net.handle_message(net.self_id(), Message::UpdateWeightsRequest);

    tracing::info!(transactions = count, "loaded tangle snapshot");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::crypto::keys::Keypair;
    use crate::net::{MemoryBus, PeerId};
    use crate::transaction::{Input, Output};

    fn lone_peer() -> Arc<NetTangle> {
        let bus = MemoryBus::new();
        let id = PeerId::random();
        let net = NetTangle::new(Tangle::new(), bus.handle(id), id);
        bus.attach(&net);
        net.set_key_pair(Arc::new(Keypair::generate()), false);
        net
    }

    fn build_sample(net: &NetTangle, keys: &Keypair, transfers: usize) {
        net.tangle()
            .set_genesis(Transaction::genesis(vec![Output::new(
                keys.public.clone(),
                f64::MAX,
            )]));
        for _ in 0..transfers {
            let node = net
                .tangle()
                .create_and_mine(
                    vec![Input::signed(keys, 10.0)],
                    vec![Output::new(keys.public.clone(), 10.0)],
                    1,
                );
            net.tangle().add(node).unwrap();
        }
    }

    #[test]
    fn snapshot_roundtrip_preserves_hashes() {
        let keys = Keypair::generate();
        let source = lone_peer();
        build_sample(&source, &keys, 5);

        let mut buffer = Vec::new();
        let saved = save_tangle(source.tangle(), &mut buffer).unwrap();
        assert_eq!(saved, 6);

        let target = lone_peer();
        let loaded = load_tangle(&target, &mut buffer.as_slice(), buffer.len()).unwrap();
        assert_eq!(loaded, 6);

        let mut original: Vec<_> = source
            .tangle()
            .all_nodes()
            .iter()
            .map(|n| n.hash().clone())
            .collect();
        let mut restored: Vec<_> = target
            .tangle()
            .all_nodes()
            .iter()
            .map(|n| n.hash().clone())
            .collect();
        original.sort();
        restored.sort();
        assert_eq!(original, restored);
        assert_eq!(
            source.tangle().genesis().hash(),
            target.tangle().genesis().hash()
        );
    }

    #[test]
    fn snapshot_is_compressed() {
        let keys = Keypair::generate();
        let source = lone_peer();
        build_sample(&source, &keys, 4);

        let mut buffer = Vec::new();
        save_tangle(source.tangle(), &mut buffer).unwrap();

        let cleartext: usize = source
            .tangle()
            .all_nodes()
            .iter()
            .map(|n| bincode::serialize(n.transaction()).map(|b| b.len()).unwrap_or(0))
            .sum();
        assert!(buffer.len() < cleartext);
    }

    #[test]
    fn load_without_keys_fails() {
        let bus = MemoryBus::new();
        let id = PeerId::random();
        let net = NetTangle::new(Tangle::new(), bus.handle(id), id);
        bus.attach(&net);

        let mut data: &[u8] = &[];
        assert!(matches!(
            load_tangle(&net, &mut data, 0),
            Err(StoreError::MissingKeys)
        ));
    }

    #[test]
    fn truncated_snapshot_fails() {
        let keys = Keypair::generate();
        let source = lone_peer();
        build_sample(&source, &keys, 2);

        let mut buffer = Vec::new();
        save_tangle(source.tangle(), &mut buffer).unwrap();
        buffer.truncate(buffer.len() / 2);

        let target = lone_peer();
        assert!(load_tangle(&target, &mut buffer.as_slice(), buffer.len()).is_err());
    }
}
