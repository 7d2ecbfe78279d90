//! The tangle graph: insertion, tip maintenance, balances, weights, the
//! biased random walk, confirmation confidence, and pruning.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use rand::Rng;

use crate::crypto::keys::PublicKey;
use crate::transaction::{Input, Output, Transaction, TxError};
use crate::{constants, TxHash};

use super::node::TangleNode;
use super::{lock, read, write};

/// Errors from structural tangle operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TangleError {
    #[error("transaction `{hash}` failed validation: {source}")]
    ValidationFailed {
        hash: TxHash,
        #[source]
        source: TxError,
    },
    #[error("transaction `{hash}` tried to generate something from nothing")]
    ValueConservation { hash: TxHash },
    #[error("transaction `{hash}` was not mined")]
    Unmined { hash: TxHash },
    #[error("transaction `{hash}` would leave account `{account}` at {balance}")]
    InvalidBalance {
        hash: TxHash,
        account: TxHash,
        balance: f64,
    },
    #[error("no node with hash `{hash}` in the tangle")]
    NodeNotFound { hash: TxHash },
    #[error("node `{parent}` already has a child with hash `{hash}`")]
    DuplicateChild { hash: TxHash, parent: TxHash },
    #[error("node `{hash}` still has children and is not a tip")]
    NotATip { hash: TxHash },
}

/// Tunable parameters, normally sourced from [`crate::config::WeftConfig`].
#[derive(Clone, Copy, Debug)]
pub struct TangleParams {
    /// Bias exponent of the tip-selection walk.
    pub walk_alpha: f64,
    /// Difficulty used when a caller does not choose one.
    pub default_difficulty: u8,
}

impl Default for TangleParams {
    fn default() -> Self {
        TangleParams {
            walk_alpha: constants::DEFAULT_WALK_ALPHA,
            default_difficulty: constants::DEFAULT_DIFFICULTY,
        }
    }
}

/// The local tangle held by a peer.
///
/// One structural mutex serializes every mutation of the graph shape (`add`,
/// `remove_tip`, `set_genesis`, `prune`) and the full-graph enumeration used
/// by peer synchronization. Tip and child lists sit behind their own
/// read/write locks so queries run concurrently with each other.
///
/// Note on hash aliasing: after pruning (or a genesis sync), the genesis's
/// stored hash is a *claimed* hash inherited from a collapsed node and its
/// parent list holds further alias hashes. [`Tangle::find`] resolves all of
/// them to the genesis; recomputing the genesis transaction's hash will not
/// reproduce the stored value. This is intentional.
pub struct Tangle {
    me: Weak<Tangle>,
    structural: Mutex<()>,
    genesis: RwLock<Arc<TangleNode>>,
    tips: RwLock<Vec<Arc<TangleNode>>>,
    candidates: Mutex<VecDeque<Vec<Arc<TangleNode>>>>,
    update_weights: AtomicBool,
    params: TangleParams,
}

impl Tangle {
    /// Create a tangle rooted at an empty genesis.
    pub fn new() -> Arc<Tangle> {
        Self::with_params(TangleParams::default())
    }

    pub fn with_params(params: TangleParams) -> Arc<Tangle> {
        let genesis = TangleNode::new_genesis(Transaction::genesis(vec![]));
        Arc::new_cyclic(|me| Tangle {
            me: me.clone(),
            structural: Mutex::new(()),
            genesis: RwLock::new(genesis.clone()),
            tips: RwLock::new(vec![genesis]),
            candidates: Mutex::new(VecDeque::new()),
            update_weights: AtomicBool::new(true),
            params,
        })
    }

    pub fn params(&self) -> &TangleParams {
        &self.params
    }

    /// Hold the structural mutex across a multi-step read, e.g. streaming the
    /// whole graph to a peer, so no insertion lands mid-enumeration.
    pub(crate) fn structural_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        lock(&self.structural)
    }

    pub fn genesis(&self) -> Arc<TangleNode> {
        read(&self.genesis).clone()
    }

    /// Snapshot of the current tips.
    pub fn tips(&self) -> Vec<Arc<TangleNode>> {
        read(&self.tips).clone()
    }

    /// Enable or suppress background weight propagation (bulk loads disable
    /// it and run one refresh afterwards).
    pub fn set_update_weights(&self, enabled: bool) {
        self.update_weights.store(enabled, Ordering::Release);
    }

    /// Replace the whole tangle with a fresh genesis. Everything previously
    /// reachable is released.
    pub fn set_genesis(&self, tx: Transaction) -> Arc<TangleNode> {
        let _structural = lock(&self.structural);
        let node = TangleNode::new_genesis(tx);
        *write(&self.genesis) = node.clone();
        *write(&self.tips) = vec![node.clone()];
        lock(&self.candidates).clear();
        node
    }

    /// Find a node by hash: breadth-first over child edges. The genesis also
    /// answers to its alias hashes (see the type-level note).
    pub fn find(&self, hash: &TxHash) -> Option<Arc<TangleNode>> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(self.genesis());
        while let Some(node) = queue.pop_front() {
            if !visited.insert(node.hash().clone()) {
                continue;
            }
            if node.hash() == hash
                || (node.is_genesis() && node.transaction().parents().contains(hash))
            {
                return Some(node);
            }
            queue.extend(node.children());
        }
        None
    }

    /// Every node reachable from the genesis, in BFS order (genesis first).
    pub fn all_nodes(&self) -> Vec<Arc<TangleNode>> {
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        let mut queue = VecDeque::new();
        queue.push_back(self.genesis());
        while let Some(node) = queue.pop_front() {
            if !visited.insert(node.hash().clone()) {
                continue;
            }
            queue.extend(node.children());
            out.push(node);
        }
        out
    }

    /// Resolve a bare transaction into a node wired to its parents, which
    /// must already be installed.
    pub fn node_from_tx(&self, tx: Transaction) -> Result<Arc<TangleNode>, TangleError> {
        let mut parents = Vec::with_capacity(tx.parents().len());
        for hash in tx.parents() {
            parents.push(self.find(hash).ok_or_else(|| TangleError::NodeNotFound {
                hash: hash.clone(),
            })?);
        }
        Ok(TangleNode::new(tx, &parents))
    }

    /// Install a fully constructed, mined node.
    ///
    /// Validation order: full integrity, value conservation, proof of work,
    /// simulated account debits, parent resolution, re-insertion. On success
    /// the node joins its parents' child lists and the tip list, and (unless
    /// suppressed) a background weight propagation is spawned from it.
    pub fn add(&self, node: Arc<TangleNode>) -> Result<TxHash, TangleError> {
        // Held across validation too: two racing adds must not both pass the
        // balance simulation against the same history.
        let _structural = lock(&self.structural);
        let tx = node.transaction();
        let hash = node.hash().clone();

        tx.validate_full().map_err(|source| TangleError::ValidationFailed {
            hash: hash.clone(),
            source,
        })?;
        if !tx.validate_totals() {
            return Err(TangleError::ValueConservation { hash });
        }
        if !tx.validate_mined() {
            return Err(TangleError::Unmined { hash });
        }

        // Simulate the debit of every distinct input account against its
        // current balance before touching the graph.
        let mut checked: HashSet<TxHash> = HashSet::new();
        for input in tx.inputs() {
            let account_hash = input.account.account_hash();
            if !checked.insert(account_hash.clone()) {
                continue;
            }
            let spent: f64 = tx
                .inputs()
                .iter()
                .filter(|i| i.account == input.account)
                .map(|i| i.amount)
                .sum();
            let remaining = self.balance(&input.account, 0.0)? - spent;
            if remaining < 0.0 {
                return Err(TangleError::InvalidBalance {
                    hash,
                    account: account_hash,
                    balance: remaining,
                });
            }
        }

        let parents = node.parents();
        for parent in &parents {
            if self.find(parent.hash()).is_none() {
                return Err(TangleError::NodeNotFound {
                    hash: parent.hash().clone(),
                });
            }
            if parent.children().iter().any(|c| c.hash() == node.hash()) {
                return Err(TangleError::DuplicateChild {
                    hash,
                    parent: parent.hash().clone(),
                });
            }
        }

        {
            let mut tips = write(&self.tips);
            for parent in &parents {
                tips.retain(|t| t.hash() != parent.hash());
                parent.add_child(node.clone());
            }
            if !tips.iter().any(|t| t.hash() == node.hash()) {
                tips.push(node.clone());
            }
            if tips.len() <= constants::GENESIS_CANDIDATE_THRESHOLD {
                let snapshot = tips.clone();
                drop(tips);
                let mut candidates = lock(&self.candidates);
                if candidates.len() == constants::GENESIS_CANDIDATE_THRESHOLD {
                    candidates.pop_front();
                }
                candidates.push_back(snapshot);
            }
        }

        if self.update_weights.load(Ordering::Acquire) {
            if let Some(tangle) = self.me.upgrade() {
                let rooted = node.clone();
                std::thread::spawn(move || tangle.update_cumulative_weights(&rooted));
            }
        }

        Ok(node.hash().clone())
    }

    /// Remove a childless node. Parents left childless become tips again.
    pub fn remove_tip(&self, node: &Arc<TangleNode>) -> Result<(), TangleError> {
        let _structural = lock(&self.structural);
        if self.find(node.hash()).is_none() {
            return Err(TangleError::NodeNotFound {
                hash: node.hash().clone(),
            });
        }
        if !node.is_tip() {
            return Err(TangleError::NotATip {
                hash: node.hash().clone(),
            });
        }

        let parents = node.parents();
        let mut tips = write(&self.tips);
        for parent in &parents {
            parent.remove_child(node.hash());
            if parent.is_tip() && !tips.iter().any(|t| t.hash() == parent.hash()) {
                tips.push(parent.clone());
            }
        }
        tips.retain(|t| t.hash() != node.hash());
        drop(tips);
        node.clear_parents();
        Ok(())
    }

    /// The balance of an account as seen from the genesis, counting only
    /// nodes above the confidence threshold (0 counts everything).
    ///
    /// Inputs are subtracted before outputs are added at each node; a
    /// negative running balance means history is inconsistent and fails.
    pub fn balance(
        &self,
        account: &PublicKey,
        confidence_threshold: f32,
    ) -> Result<f64, TangleError> {
        let mut balance = 0.0;
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        let genesis = self.genesis();
        visited.insert(genesis.hash().clone());
        queue.push_back(genesis);

        while let Some(node) = queue.pop_front() {
            for input in node.transaction().inputs() {
                if input.account == *account {
                    balance -= input.amount;
                    if balance < 0.0 {
                        return Err(TangleError::InvalidBalance {
                            hash: node.hash().clone(),
                            account: account.account_hash(),
                            balance,
                        });
                    }
                }
            }
            for output in node.transaction().outputs() {
                if output.account == *account {
                    balance += output.amount;
                }
            }
            for child in node.children() {
                if visited.contains(child.hash()) {
                    continue;
                }
                if confidence_threshold > 0.0
                    && self.confirmation_confidence(&child) < confidence_threshold
                {
                    continue;
                }
                visited.insert(child.hash().clone());
                queue.push_back(child);
            }
        }
        Ok(balance)
    }

    /// Recompute cumulative weights from `source` back toward the genesis.
    ///
    /// Each visited node gets `own_weight + Σ children's stored weight`.
    /// The pass is idempotent and safe to run concurrently with inserts;
    /// repeated passes converge on the exact sums.
    pub fn update_cumulative_weights(&self, source: &Arc<TangleNode>) {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(source.hash().clone());
        queue.push_back(source.clone());

        while let Some(node) = queue.pop_front() {
            let children_sum: f32 = node.children().iter().map(|c| c.cumulative_weight()).sum();
            node.store_cumulative_weight(node.own_weight() + children_sum);
            for parent in node.parents() {
                if visited.insert(parent.hash().clone()) {
                    queue.push_back(parent);
                }
            }
        }
    }

    /// Spawn a detached refresh of every tip's ancestry weights.
    pub fn refresh_weights(&self) {
        let Some(tangle) = self.me.upgrade() else {
            return;
        };
        std::thread::spawn(move || {
            for tip in tangle.tips() {
                tangle.update_cumulative_weights(&tip);
            }
            tracing::debug!("background weight refresh finished");
        });
    }

    /// The MCMC tip-selection walk. From `from`, repeatedly step to a child
    /// drawn with probability proportional to `exp(-α · (cw(here) − cw(child)))`
    /// (floored at the smallest positive weight), until a tip is reached.
    pub fn random_walk(&self, from: &Arc<TangleNode>) -> Arc<TangleNode> {
        let mut rng = rand::thread_rng();
        let mut current = from.clone();
        loop {
            let children = current.children();
            if children.is_empty() {
                return current;
            }
            let here = current.cumulative_weight() as f64;
            // Floor at the smallest positive subnormal, not `MIN_POSITIVE`
            // (the smallest *normal*), so a child whose exp underflows to
            // zero keeps the least representable nonzero weight.
            let floor = f64::from_bits(1);
            let weights: Vec<f64> = children
                .iter()
                .map(|child| {
                    let delta = here - child.cumulative_weight() as f64;
                    (-self.params.walk_alpha * delta).exp().max(floor)
                })
                .collect();
            let total: f64 = weights.iter().sum();
            let mut draw = rng.gen::<f64>() * total;
            let mut chosen = children.len() - 1;
            for (i, w) in weights.iter().enumerate() {
                if draw < *w {
                    chosen = i;
                    break;
                }
                draw -= w;
            }
            current = children[chosen].clone();
        }
    }

    /// Walk from the genesis to a tip.
    pub fn select_tip(&self) -> Arc<TangleNode> {
        let genesis = self.genesis();
        self.random_walk(&genesis)
    }

    /// How confident the network is in `node`: the fraction of biased walks,
    /// started from a neighborhood of the node, that end at one of its
    /// descendants.
    ///
    /// The neighborhood is the node's children (or the node itself when it is
    /// a tip) expanded five (six when it had children) levels of ancestors,
    /// minus the node and those children, duplicated until it holds at least
    /// [`constants::WALK_SET_MIN`] entries.
    pub fn confirmation_confidence(&self, node: &Arc<TangleNode>) -> f32 {
        let children = node.children();
        let had_children = !children.is_empty();

        let mut walk_set: Vec<Arc<TangleNode>> = if had_children {
            children.clone()
        } else {
            vec![node.clone()]
        };
        let levels = if had_children { 6 } else { 5 };
        let mut frontier = walk_set.clone();
        for _ in 0..levels {
            let next: Vec<Arc<TangleNode>> =
                frontier.iter().flat_map(|n| n.parents()).collect();
            if next.is_empty() {
                break;
            }
            walk_set.extend(next.iter().cloned());
            frontier = next;
        }

        walk_set.retain(|candidate| {
            candidate.hash() != node.hash()
                && !children.iter().any(|c| c.hash() == candidate.hash())
        });
        if walk_set.is_empty() {
            // Nothing around the node to walk from; a lone node is trivially
            // agreed on.
            return 1.0;
        }
        while walk_set.len() < constants::WALK_SET_MIN {
            let doubled = walk_set.clone();
            walk_set.extend(doubled);
        }

        let hits = walk_set
            .iter()
            .filter(|start| node.is_ancestor_of(&self.random_walk(start)))
            .count();
        hits as f32 / walk_set.len() as f32
    }

    /// Create, mine, and wire a transaction to tips chosen by biased walks.
    ///
    /// Two walks pick the parents (retrying for a distinct second tip while
    /// more than one exists); a tip left at least
    /// [`constants::LEFT_BEHIND_TIP_DELTA`] below the parents' average height
    /// is attached as an extra parent so laggards catch back up.
    pub fn create_and_mine(
        &self,
        inputs: Vec<Input>,
        outputs: Vec<Output>,
        difficulty: u8,
    ) -> Arc<TangleNode> {
        let first = self.select_tip();
        let mut second = self.select_tip();
        let tip_count = read(&self.tips).len();
        let mut attempts = 0u8;
        while tip_count > 1
            && second.hash() == first.hash()
            && attempts < constants::DISTINCT_TIP_RETRIES
        {
            second = self.select_tip();
            attempts += 1;
        }

        let mut parents = vec![first, second];
        let avg_height: u64 =
            parents.iter().map(|p| p.height()).sum::<u64>() / parents.len() as u64;

        {
            let tips = read(&self.tips);
            if let Some(lagging) = tips
                .iter()
                .find(|tip| tip.height() + constants::LEFT_BEHIND_TIP_DELTA <= avg_height)
            {
                parents.push(lagging.clone());
            }
        }

        let mut seen = HashSet::new();
        parents.retain(|p| seen.insert(p.hash().clone()));

        let parent_hashes = parents.iter().map(|p| p.hash().clone()).collect();
        let mut tx = Transaction::new(parent_hashes, inputs, outputs, difficulty);
        tx.mine();
        TangleNode::new(tx, &parents)
    }

    /// Collapse fully confirmed history into a synthetic genesis.
    ///
    /// The newest candidate tip set whose members all sit at confidence 1.0
    /// becomes the cut: per-account balances at the cut are tabulated
    /// backwards through parents and emitted as the new genesis's outputs,
    /// the new genesis takes over the chosen nodes' children and hashes
    /// (first hash stored, the rest as aliases), and everything above the cut
    /// is released. Tips survive the splice. Does nothing when no candidate
    /// set qualifies.
    pub fn prune(&self) {
        let _structural = lock(&self.structural);

        let Some((genesis_tx, chosen)) = self.latest_common_genesis() else {
            return;
        };
        tracing::info!(
            genesis = %genesis_tx.hash(),
            collapsed = chosen.len(),
            "pruning tangle to latest common genesis"
        );

        let original_tips = read(&self.tips).clone();
        let new_genesis = TangleNode::new_genesis(genesis_tx);

        // Splice: the chosen nodes' children move under the new genesis.
        let mut spliced: Vec<Arc<TangleNode>> = Vec::new();
        let mut seen = HashSet::new();
        for node in &chosen {
            for child in node.take_children() {
                if seen.insert(child.hash().clone()) {
                    spliced.push(child);
                }
            }
        }
        for child in &spliced {
            child.set_parents(vec![Arc::downgrade(&new_genesis)]);
            new_genesis.add_child(child.clone());
        }

        *write(&self.genesis) = new_genesis.clone();

        // The old tip nodes stay valid below the cut; chosen tips collapse
        // into the genesis itself.
        let chosen_hashes: HashSet<&TxHash> = chosen.iter().map(|c| c.hash()).collect();
        let mut tips: Vec<Arc<TangleNode>> = Vec::new();
        let mut tip_seen = HashSet::new();
        for tip in original_tips {
            let replacement = if chosen_hashes.contains(tip.hash()) {
                new_genesis.clone()
            } else {
                tip
            };
            if tip_seen.insert(replacement.hash().clone()) {
                tips.push(replacement);
            }
        }
        *write(&self.tips) = tips;

        // Stale candidate sets reference nodes above the cut.
        lock(&self.candidates).clear();
    }

    /// Choose the cut for [`Tangle::prune`] and build its genesis
    /// transaction. `None` when no recorded tip set is unanimously at
    /// confidence 1.0.
    fn latest_common_genesis(&self) -> Option<(Transaction, Vec<Arc<TangleNode>>)> {
        let candidates = lock(&self.candidates).clone();
        let chosen = candidates.iter().rev().find(|set| {
            set.iter()
                .all(|node| self.confirmation_confidence(node) >= 1.0)
        })?;
        let chosen = chosen.clone();

        let mut outputs = Vec::new();
        for account in self.accounts_up_to(&chosen) {
            let balance = Self::reverse_balance(&chosen, &account);
            if balance != 0.0 {
                outputs.push(Output::new(account, balance));
            }
        }

        let mut tx = Transaction::new(vec![], vec![], outputs, self.params.default_difficulty);
        tx.force_hash(chosen[0].hash().clone());
        tx.force_parents(chosen[1..].iter().map(|c| c.hash().clone()).collect());
        Some((tx, chosen))
    }

    /// Every account referenced between the genesis and the chosen cut,
    /// inclusive of the cut nodes themselves.
    fn accounts_up_to(&self, chosen: &[Arc<TangleNode>]) -> Vec<PublicKey> {
        let chosen_hashes: HashSet<&TxHash> = chosen.iter().map(|c| c.hash()).collect();
        let mut accounts: Vec<PublicKey> = Vec::new();
        let mut account_hashes = HashSet::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(self.genesis());

        while let Some(node) = queue.pop_front() {
            if !visited.insert(node.hash().clone()) {
                continue;
            }
            let tx = node.transaction();
            for account in tx
                .inputs()
                .iter()
                .map(|i| &i.account)
                .chain(tx.outputs().iter().map(|o| &o.account))
            {
                if account_hashes.insert(account.account_hash()) {
                    accounts.push(account.clone());
                }
            }
            if !chosen_hashes.contains(node.hash()) {
                queue.extend(node.children());
            }
        }
        accounts
    }

    /// The balance of `account` as seen by the cut: walk backwards from the
    /// chosen nodes through parents, subtracting inputs and adding outputs.
    /// History behind the cut was validated on the way in and is trusted.
    fn reverse_balance(chosen: &[Arc<TangleNode>], account: &PublicKey) -> f64 {
        let mut balance = 0.0;
        let mut visited = HashSet::new();
        let mut queue: VecDeque<Arc<TangleNode>> = chosen.iter().cloned().collect();

        while let Some(node) = queue.pop_front() {
            for input in node.transaction().inputs() {
                if input.account == *account {
                    balance -= input.amount;
                }
            }
            for output in node.transaction().outputs() {
                if output.account == *account {
                    balance += output.amount;
                }
            }
            for parent in node.parents() {
                if visited.insert(parent.hash().clone()) {
                    queue.push_back(parent);
                }
            }
        }
        balance
    }

    /// Render the reachable graph, one node per line, children inline. For
    /// operator diagnostics.
    pub fn debug_dump(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        for node in self.all_nodes() {
            let children = node.children();
            let _ = write!(out, "{}", node.hash());
            let _ = write!(out, " children: [");
            for child in &children {
                let _ = write!(out, " {}", child.hash());
            }
            let _ = writeln!(out, " ]");
        }
        out
    }
}
