//! Gossip synchronization over a best-effort broadcast bus.
//!
//! The transport itself is out of scope; anything that can deliver typed
//! messages to all peers (or one peer) implements [`Bus`]. The gossip layer
//! tolerates loss, reordering, and duplication: unknown senders trigger key
//! exchange, transactions with missing parents wait in an orphan ring, and
//! every handler failure is logged and swallowed so the transport keeps
//! running.

mod bus;
mod gossip;
mod orphan;
mod protocol;

pub use bus::{Bus, MemoryBus, MemoryBusHandle, PeerId};
pub use gossip::{GossipError, NetTangle};
pub use orphan::{OrphanEntry, OrphanQueue};
pub use protocol::{
    decode_message, encode_message, Compressed, GenesisEnvelope, Message, ProtocolError,
    TxEnvelope,
};
