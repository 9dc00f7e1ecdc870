//! Paired peers: their state, and applying what they push to us

pub mod apply;
pub mod directory;
pub mod state;

pub use apply::{ApplicationCompleted, ApplicationEvents, ApplyOutcome, PeerApplier};
pub use directory::{Peer, PeerDirectory};
pub use state::{PeerAckView, PeerSyncState, PeerSyncStateMachine};
