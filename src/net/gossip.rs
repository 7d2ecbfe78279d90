//! The networked tangle: peer key directory, genesis voting, full-tangle
//! synchronization, and orphan-queued transaction ingestion.
//!
//! All handler state lives under one mutex because the bus delivers into a
//! single logical handler context. Handlers compute their replies under the
//! lock and send them after releasing it, so a reply that re-enters this
//! endpoint cannot deadlock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::crypto::keys::{Keypair, PublicKey, Signature};
use crate::tangle::{Tangle, TangleError, TangleNode};
use crate::transaction::TxError;
use crate::{constants, TxHash};

use super::bus::{Bus, PeerId};
use super::orphan::{OrphanEntry, OrphanQueue};
use super::protocol::{Compressed, GenesisEnvelope, Message, TxEnvelope};

/// Errors surfaced by the gossip layer.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GossipError {
    #[error("no account with hash `{hash}` is known")]
    InvalidAccount { hash: TxHash },
    #[error("invalid personal keypair: {0}")]
    InvalidKey(String),
    #[error("sender `{peer}` failed identity verification")]
    Verification { peer: PeerId },
    #[error("genesis rejected: {0}")]
    GenesisRejected(String),
    #[error(transparent)]
    Tangle(#[from] TangleError),
    #[error(transparent)]
    Tx(#[from] TxError),
}

/// One vote tuple's tally: who voted for it first, and how many peers did.
struct VoteTally {
    first_voter: PeerId,
    count: usize,
}

/// Mutable gossip state, collapsed under one lock (the bus context is
/// single-threaded; see the module note).
struct GossipState {
    personal_keys: Option<Arc<Keypair>>,
    peer_keys: HashMap<PeerId, PublicKey>,
    orphans: OrphanQueue,
    /// `Some` while collecting genesis votes.
    votes: Option<HashMap<Vec<TxHash>, VoteTally>>,
    /// `Some(hash)` while a genesis sync is expected.
    expected_genesis: Option<TxHash>,
    /// The peer we last pushed our key to (suppresses request ping-pong).
    last_key_recipient: Option<PeerId>,
}

/// A reply computed under the state lock, sent after it is released.
struct Outgoing {
    to: Option<PeerId>,
    msg: Message,
}

impl Outgoing {
    fn to(peer: PeerId, msg: Message) -> Self {
        Outgoing {
            to: Some(peer),
            msg,
        }
    }
}

/// A tangle bound to a broadcast bus.
pub struct NetTangle {
    tangle: Arc<Tangle>,
    bus: Arc<dyn Bus>,
    self_id: PeerId,
    state: Mutex<GossipState>,
}

impl NetTangle {
    pub fn new(tangle: Arc<Tangle>, bus: Arc<dyn Bus>, self_id: PeerId) -> Arc<NetTangle> {
        Arc::new(NetTangle {
            tangle,
            bus,
            self_id,
            state: Mutex::new(GossipState {
                personal_keys: None,
                peer_keys: HashMap::new(),
                orphans: OrphanQueue::new(),
                votes: None,
                expected_genesis: None,
                last_key_recipient: None,
            }),
        })
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn tangle(&self) -> &Arc<Tangle> {
        &self.tangle
    }

    pub fn personal_keys(&self) -> Option<Arc<Keypair>> {
        self.lock_state().personal_keys.clone()
    }

    /// Install this peer's identity, register it in the key directory, and
    /// (optionally) push it to the network.
    pub fn set_key_pair(&self, pair: Arc<Keypair>, network_sync: bool) {
        {
            let mut state = self.lock_state();
            state.peer_keys.insert(self.self_id, pair.public.clone());
            state.personal_keys = Some(pair.clone());
        }
        if network_sync {
            self.bus.broadcast(Message::PublicKeySyncResponse {
                key: pair.public.clone(),
                signature: pair.sign(constants::KEY_VERIFY_TEXT),
            });
        }
    }

    /// Look up a verified peer key by its account hash.
    pub fn find_account(&self, hash: &TxHash) -> Result<PublicKey, GossipError> {
        self.lock_state()
            .peer_keys
            .values()
            .find(|key| key.account_hash() == *hash)
            .cloned()
            .ok_or_else(|| GossipError::InvalidAccount { hash: hash.clone() })
    }

    /// The key we hold for a peer, if any.
    pub fn peer_key(&self, peer: &PeerId) -> Option<PublicKey> {
        self.lock_state().peer_keys.get(peer).cloned()
    }

    /// How many received transactions are waiting on missing parents or
    /// unverified senders.
    pub fn orphan_count(&self) -> usize {
        self.lock_state().orphans.len()
    }

    /// Networked add: install locally, then broadcast. Handlers receiving
    /// remote transactions go through the structural add instead, so a
    /// received broadcast never fans back out.
    pub fn add(&self, node: Arc<TangleNode>) -> Result<TxHash, GossipError> {
        let keys = self
            .personal_keys()
            .ok_or_else(|| GossipError::InvalidKey("missing personal keypair".into()))?;
        let hash = self.tangle.add(node.clone())?;
        self.bus.broadcast(Message::AddTransaction(Compressed(
            TxEnvelope::signed(node.transaction(), &keys),
        )));
        Ok(hash)
    }

    /// Start collecting genesis votes and ask every peer for theirs.
    pub fn request_genesis_vote(&self) {
        self.lock_state().votes = Some(HashMap::new());
        self.bus.broadcast(Message::GenesisVoteRequest);
    }

    /// Arm the genesis-sync gate: only a genesis with this claimed hash will
    /// be installed. Used before replaying a saved tangle.
    pub fn expect_genesis(&self, hash: TxHash) {
        self.lock_state().expected_genesis = Some(hash);
    }

    pub fn handle_connect(&self, peer: PeerId) {
        tracing::info!(%peer, "peer connected");
    }

    /// A departed peer's key is forgotten; a reconnect re-verifies it.
    pub fn handle_disconnect(&self, peer: PeerId) {
        tracing::info!(%peer, "peer disconnected");
        self.lock_state().peer_keys.remove(&peer);
    }

    /// Dispatch one incoming message. Handler errors are logged and
    /// swallowed so the bus thread keeps running.
    pub fn handle_message(&self, source: PeerId, msg: Message) {
        let result = match msg {
            Message::PublicKeySyncRequest => self.on_key_request(source),
            Message::PublicKeySyncResponse { key, signature } => {
                self.on_key_response(source, key, signature)
            }
            Message::GenesisVoteRequest => self.on_vote_request(source),
            Message::GenesisVoteResponse { hashes, signature } => {
                self.on_vote_response(source, hashes, signature)
            }
            Message::TangleSynchronizeRequest => self.on_tangle_synchronize(source),
            Message::UpdateWeightsRequest => {
                self.tangle.refresh_weights();
                Ok(vec![])
            }
            Message::SyncGenesis(Compressed(envelope)) => self.on_sync_genesis(source, envelope),
            Message::AddTransaction(Compressed(envelope)) => {
                self.on_add_transaction(source, envelope, false)
            }
            Message::SynchronizationAddTransaction(Compressed(envelope)) => {
                self.on_add_transaction(source, envelope, true)
            }
        };
        match result {
            Ok(outgoing) => self.dispatch(outgoing),
            Err(e) => tracing::warn!(%source, error = %e, "gossip handler failed, discarding"),
        }
    }

    fn dispatch(&self, outgoing: Vec<Outgoing>) {
        for out in outgoing {
            match out.to {
                Some(peer) => self.bus.send_to(&peer, out.msg),
                None => self.bus.broadcast(out.msg),
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GossipState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The validated personal keypair, or the error both key handlers raise.
    fn require_keys(state: &GossipState) -> Result<Arc<Keypair>, GossipError> {
        let keys = state
            .personal_keys
            .clone()
            .ok_or_else(|| GossipError::InvalidKey("missing personal keypair".into()))?;
        if !keys.validate() {
            return Err(GossipError::InvalidKey(
                "public and secret halves were not created from each other".into(),
            ));
        }
        Ok(keys)
    }

    // ── Peer Keys ──

    fn on_key_response(
        &self,
        source: PeerId,
        key: PublicKey,
        signature: Signature,
    ) -> Result<Vec<Outgoing>, GossipError> {
        if key.verify(constants::KEY_VERIFY_TEXT, &signature) {
            tracing::info!(%source, account = %key.account_hash(), "recorded peer key");
            self.lock_state().peer_keys.insert(source, key);
        } else {
            tracing::warn!(%source, "failed to verify peer key, discarding");
        }
        Ok(vec![])
    }

    fn on_key_request(&self, source: PeerId) -> Result<Vec<Outgoing>, GossipError> {
        let mut state = self.lock_state();
        let keys = Self::require_keys(&state)?;

        let mut out = Vec::new();
        if state.last_key_recipient != Some(source) {
            out.push(Outgoing::to(
                source,
                Message::PublicKeySyncResponse {
                    key: keys.public.clone(),
                    signature: keys.sign(constants::KEY_VERIFY_TEXT),
                },
            ));
            tracing::info!(%source, "sent public key");
        }
        state.last_key_recipient = Some(source);

        if !state.peer_keys.contains_key(&source) {
            out.push(Outgoing::to(source, Message::PublicKeySyncRequest));
        }
        Ok(out)
    }

    // ── Genesis Voting ──

    /// Our genesis lineage, signed: alias hashes first, actual hash last.
    fn vote_for_own_genesis(&self, keys: &Keypair) -> Message {
        let genesis = self.tangle.genesis();
        let mut hashes: Vec<TxHash> = genesis.transaction().parents().to_vec();
        hashes.push(genesis.hash().clone());
        let concatenated: String = hashes.iter().map(|h| h.as_str()).collect();
        Message::GenesisVoteResponse {
            signature: keys.sign(&concatenated),
            hashes,
        }
    }

    fn on_vote_request(&self, source: PeerId) -> Result<Vec<Outgoing>, GossipError> {
        let keys = Self::require_keys(&self.lock_state())?;
        Ok(vec![Outgoing::to(source, self.vote_for_own_genesis(&keys))])
    }

    fn on_vote_response(
        &self,
        source: PeerId,
        hashes: Vec<TxHash>,
        signature: Signature,
    ) -> Result<Vec<Outgoing>, GossipError> {
        let mut state = self.lock_state();
        if state.votes.is_none() {
            return Ok(vec![]);
        }
        let Some(actual_hash) = hashes.last().cloned() else {
            tracing::warn!(%source, "empty genesis vote, discarding");
            return Ok(vec![]);
        };
        let Some(key) = state.peer_keys.get(&source).cloned() else {
            // Can't verify the vote yet: learn the key, then ask again.
            return Ok(vec![
                Outgoing::to(source, Message::PublicKeySyncRequest),
                Outgoing::to(source, Message::GenesisVoteRequest),
            ]);
        };
        let concatenated: String = hashes.iter().map(|h| h.as_str()).collect();
        if !key.verify(&concatenated, &signature) {
            return Err(GossipError::Verification { peer: source });
        }

        let votes = state.votes.as_mut().expect("checked above");
        let tally = votes.entry(hashes.clone()).or_insert(VoteTally {
            first_voter: source,
            count: 0,
        });
        tally.count += 1;
        let tally_count = tally.count;
        tracing::info!(%source, votes = tally_count, "received genesis vote");

        let known_peers = state.peer_keys.len();
        let accept = |state: &mut GossipState, voter: PeerId, expected: TxHash| {
            state.votes = None;
            state.expected_genesis = Some(expected);
            vec![Outgoing::to(voter, Message::TangleSynchronizeRequest)]
        };

        // Majority for this tuple wins outright.
        if tally_count > known_peers / 2 {
            return Ok(accept(&mut state, source, actual_hash));
        }

        // Everyone voted: the best tuple wins, synced from its first voter
        // (when still connected).
        let votes = state.votes.as_ref().expect("checked above");
        let total: usize = votes.values().map(|t| t.count).sum();
        if total >= known_peers.saturating_sub(1) {
            if let Some((best_hashes, best)) = votes
                .iter()
                .max_by_key(|(_, tally)| tally.count)
                .map(|(h, t)| (h.clone(), (t.first_voter, t.count)))
            {
                if self.bus.peers().contains(&best.0) {
                    let expected = best_hashes.last().cloned().unwrap_or_else(TxHash::invalid);
                    return Ok(accept(&mut state, best.0, expected));
                }
            }
        }
        Ok(vec![])
    }

    // ── Tangle Sync ──

    fn on_tangle_synchronize(&self, source: PeerId) -> Result<Vec<Outgoing>, GossipError> {
        let keys = Self::require_keys(&self.lock_state())?;

        // Enumerate under the structural mutex so the peer receives a
        // consistent snapshot of the graph.
        let nodes = {
            let _structural = self.tangle.structural_guard();
            self.tangle.all_nodes()
        };

        let mut out = Vec::with_capacity(nodes.len() + 1);
        for node in &nodes {
            let msg = if node.is_genesis() {
                Message::SyncGenesis(Compressed(GenesisEnvelope::signed(
                    node.transaction(),
                    &keys,
                )))
            } else {
                Message::SynchronizationAddTransaction(Compressed(TxEnvelope::signed(
                    node.transaction(),
                    &keys,
                )))
            };
            out.push(Outgoing::to(source, msg));
        }
        out.push(Outgoing::to(source, Message::UpdateWeightsRequest));
        tracing::info!(%source, nodes = nodes.len(), "sent tangle");
        Ok(out)
    }

    fn on_sync_genesis(
        &self,
        source: PeerId,
        envelope: GenesisEnvelope,
    ) -> Result<Vec<Outgoing>, GossipError> {
        let mut state = self.lock_state();
        let Some(expected) = state.expected_genesis.clone() else {
            return Ok(vec![]);
        };
        if self.tangle.genesis().hash() == envelope.genesis.hash() {
            return Ok(vec![]);
        }
        if expected != *envelope.genesis.hash() {
            return Err(GossipError::GenesisRejected(format!(
                "expected genesis `{expected}`, got `{}`",
                envelope.genesis.hash()
            )));
        }
        let recomputed = envelope.genesis.compute_hash();
        if recomputed != envelope.actual {
            return Err(GossipError::Tx(TxError::InvalidHash {
                actual: recomputed,
                claimed: envelope.actual.clone(),
            }));
        }
        let Some(key) = state.peer_keys.get(&source).cloned() else {
            // Learn the sender's key, then have them replay the tangle.
            return Ok(vec![
                Outgoing::to(source, Message::PublicKeySyncRequest),
                Outgoing::to(source, Message::TangleSynchronizeRequest),
            ]);
        };
        if !key.verify(&envelope.signed_text(), &envelope.signature) {
            return Err(GossipError::Verification { peer: source });
        }
        if !envelope.genesis.inputs().is_empty() {
            return Err(GossipError::GenesisRejected(
                "genesis transactions cannot have inputs".into(),
            ));
        }

        let mut tx = envelope.genesis;
        tx.force_hash(envelope.claimed);
        let installed = self.tangle.set_genesis(tx);
        state.expected_genesis = None;
        tracing::info!(%source, genesis = %installed.hash(), "synchronized new genesis");
        Ok(vec![])
    }

    // ── Transactions ──

    fn on_add_transaction(
        &self,
        source: PeerId,
        envelope: TxEnvelope,
        bulk_sync: bool,
    ) -> Result<Vec<Outgoing>, GossipError> {
        if envelope.transaction.hash() != &envelope.hash {
            return Err(GossipError::Tx(TxError::InvalidHash {
                actual: envelope.transaction.hash().clone(),
                claimed: envelope.hash,
            }));
        }

        if bulk_sync {
            self.tangle.set_update_weights(false);
        }
        let result = self.ingest_and_drain(OrphanEntry {
            transaction: envelope.transaction,
            peer: source,
            signature: envelope.signature,
        });
        if bulk_sync {
            self.tangle.set_update_weights(true);
        }
        result
    }

    fn ingest_and_drain(&self, entry: OrphanEntry) -> Result<Vec<Outgoing>, GossipError> {
        let mut state = self.lock_state();
        let hash = entry.transaction.hash().clone();
        let source = entry.peer;

        let mut out = self.attempt_to_add(&mut state, entry);

        // Every arrival retries the whole queue: the new transaction may be
        // the missing parent of any of them.
        for queued in state.orphans.take_all() {
            out.extend(self.attempt_to_add(&mut state, queued));
        }
        state.orphans.shrink();

        tracing::debug!(%hash, %source, "processed remote transaction");
        Ok(out)
    }

    /// Try to install one received transaction; orphan it when its sender's
    /// key or any parent is missing. Failures discard the transaction and
    /// never propagate.
    fn attempt_to_add(&self, state: &mut GossipState, entry: OrphanEntry) -> Vec<Outgoing> {
        let hash = entry.transaction.hash().clone();

        let Some(key) = state.peer_keys.get(&entry.peer).cloned() else {
            tracing::info!(
                %hash,
                peer = %entry.peer,
                "transaction from unverified peer, queueing and requesting key"
            );
            let request = Outgoing::to(entry.peer, Message::PublicKeySyncRequest);
            state.orphans.push(entry);
            return vec![request];
        };

        if !key.verify(hash.as_str(), &entry.signature) {
            tracing::warn!(%hash, peer = %entry.peer, "sender identity failed verification, discarding");
            return vec![];
        }

        let missing_parent = entry
            .transaction
            .parents()
            .iter()
            .any(|parent| self.tangle.find(parent).is_none());
        if missing_parent {
            tracing::info!(%hash, "transaction is temporarily orphaned, queueing");
            state.orphans.push(entry);
            return vec![];
        }

        // Structural add only: broadcasting here would echo every received
        // transaction back into the network.
        let installed = self
            .tangle
            .node_from_tx(entry.transaction)
            .and_then(|node| self.tangle.add(node));
        match installed {
            Ok(_) => tracing::info!(%hash, "added remote transaction"),
            Err(e) => tracing::warn!(%hash, error = %e, "invalid remote transaction, discarding"),
        }
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::bus::MemoryBus;
    use crate::transaction::{Input, Output, Transaction};

    fn endpoint(bus: &Arc<MemoryBus>, tangle: Arc<Tangle>) -> Arc<NetTangle> {
        let id = PeerId::random();
        let net = NetTangle::new(tangle, bus.handle(id), id);
        bus.attach(&net);
        net
    }

    /// Attach an endpoint and broadcast a fresh identity. Peers attached
    /// *after* this call miss the broadcast and learn the key on demand
    /// through the request/response flow.
    fn peer(bus: &Arc<MemoryBus>, tangle: Arc<Tangle>) -> Arc<NetTangle> {
        let net = endpoint(bus, tangle);
        net.set_key_pair(Arc::new(Keypair::generate()), true);
        net
    }

    /// Attach `n` endpoints first, then broadcast every identity, so all
    /// peers hold all keys.
    fn mesh(bus: &Arc<MemoryBus>, n: usize) -> Vec<Arc<NetTangle>> {
        let nets: Vec<_> = (0..n).map(|_| endpoint(bus, Tangle::new())).collect();
        for net in &nets {
            net.set_key_pair(Arc::new(Keypair::generate()), true);
        }
        nets
    }

    #[test]
    fn key_exchange_via_broadcast() {
        let bus = MemoryBus::new();
        let a = peer(&bus, Tangle::new());
        let b = peer(&bus, Tangle::new());

        // b broadcast its key on set_key_pair, and a had already done so
        // before b attached; ask explicitly for the missing direction.
        assert!(a.peer_key(&b.self_id()).is_some());
        b.handle_message(a.self_id(), Message::PublicKeySyncRequest);
        assert!(b.peer_key(&a.self_id()).is_some());
    }

    #[test]
    fn find_account_resolves_peer_keys() {
        let bus = MemoryBus::new();
        let a = peer(&bus, Tangle::new());
        let b = peer(&bus, Tangle::new());

        let b_key = b.personal_keys().unwrap().public.clone();
        let found = a.find_account(&b_key.account_hash()).unwrap();
        assert_eq!(found, b_key);

        let unknown = crate::hash_b64(b"nobody");
        assert!(matches!(
            a.find_account(&unknown),
            Err(GossipError::InvalidAccount { .. })
        ));
    }

    #[test]
    fn disconnect_forgets_peer_key() {
        let bus = MemoryBus::new();
        let a = peer(&bus, Tangle::new());
        let b = peer(&bus, Tangle::new());

        assert!(a.peer_key(&b.self_id()).is_some());
        bus.detach(&b.self_id());
        assert!(a.peer_key(&b.self_id()).is_none());
    }

    #[test]
    fn networked_add_propagates_to_peer() {
        let bus = MemoryBus::new();
        let keys = Arc::new(Keypair::generate());

        let nets = mesh(&bus, 2);
        let (a, b) = (&nets[0], &nets[1]);
        let genesis_tx =
            Transaction::genesis(vec![Output::new(keys.public.clone(), 1000.0)]);
        a.tangle().set_genesis(genesis_tx.clone());
        b.tangle().set_genesis(genesis_tx);

        let node = a
            .tangle()
            .create_and_mine(
                vec![Input::signed(&keys, 10.0)],
                vec![Output::new(keys.public.clone(), 10.0)],
                1,
            );
        a.add(node.clone()).unwrap();

        assert!(b.tangle().find(node.hash()).is_some());
        assert_eq!(b.tangle().tips()[0].hash(), node.hash());
    }

    #[test]
    fn received_broadcast_does_not_echo() {
        let bus = MemoryBus::new();
        let nets = mesh(&bus, 3);
        let genesis_tx = Transaction::genesis(vec![]);
        for net in &nets {
            net.tangle().set_genesis(genesis_tx.clone());
        }

        let node = nets[0].tangle().create_and_mine(vec![], vec![], 1);
        // If a receiver's handler re-broadcast, the third peer would get the
        // transaction twice and the duplicate structural add would fail; the
        // assertion is that everyone converged to exactly one copy.
        nets[0].add(node.clone()).unwrap();
        for net in &nets {
            assert_eq!(net.tangle().all_nodes().len(), 2);
        }
    }

    #[test]
    fn genesis_vote_triggers_sync_from_majority() {
        let bus = MemoryBus::new();
        let keys = Arc::new(Keypair::generate());

        let established = peer(&bus, Tangle::new());
        established
            .tangle()
            .set_genesis(Transaction::genesis(vec![Output::new(
                keys.public.clone(),
                500.0,
            )]));
        let node = established
            .tangle()
            .create_and_mine(vec![Input::signed(&keys, 5.0)], vec![], 1);
        established.tangle().add(node).unwrap();

        let joiner = peer(&bus, Tangle::new());
        joiner.request_genesis_vote();

        // The vote response carried the established genesis, the majority
        // rule accepted it, and the follow-up tangle sync replayed the graph.
        assert_eq!(
            joiner.tangle().genesis().hash(),
            established.tangle().genesis().hash()
        );
        assert_eq!(joiner.tangle().all_nodes().len(), 2);
    }

    #[test]
    fn unknown_sender_transaction_waits_for_key() {
        let bus = MemoryBus::new();
        let a = peer(&bus, Tangle::new());
        let genesis_tx = Transaction::genesis(vec![]);
        a.tangle().set_genesis(genesis_tx.clone());

        // A transaction signed by a peer a has never seen.
        let ghost_keys = Keypair::generate();
        let ghost_id = PeerId::random();
        let mut tx = Transaction::new(
            vec![a.tangle().genesis().hash().clone()],
            vec![],
            vec![],
            1,
        );
        tx.mine();
        let envelope = TxEnvelope::signed(&tx, &ghost_keys);
        a.handle_message(ghost_id, Message::AddTransaction(Compressed(envelope)));

        // Not installed, but not lost either.
        assert!(a.tangle().find(tx.hash()).is_none());
        assert_eq!(a.tangle().all_nodes().len(), 1);
    }
}
