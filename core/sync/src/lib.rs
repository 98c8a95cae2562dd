//! Tandem shared state synchronizer
//!
//! This module keeps the ephemeral session state identical across the
//! windows of one session:
//! - A pure reducer applied identically to local and remote mutations
//! - Named broadcast channels carrying self-describing mutation messages
//! - Snapshot hand-off so a late window starts from its siblings' state

pub mod channel;
pub mod message;
pub mod mutation;
pub mod state;
pub mod synchronizer;

// Re-export main types
pub use channel::{BroadcastChannel, BroadcastHub, ChannelHandle, DEFAULT_CHANNEL_CAPACITY};
pub use message::{Envelope, Payload};
pub use mutation::Mutation;
pub use state::{ServiceEntry, SharedState};
pub use synchronizer::SharedStateSync;
