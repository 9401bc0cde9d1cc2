//! Runtime for the haggle conversation subsystem.
//!
//! One [`ConversationHandle`] per open conversation view: it resolves the
//! participants' identities, subscribes the conversation channel, keeps the
//! message list synced through push plus silent polling, runs the presence
//! heartbeat and typing debounce, and wraps the message store with the
//! client-side guarantees (validation, single-flight, idempotent deletes).
//!
//! Transport and store backends are injected through the traits in
//! [`transport`] and [`store`]; [`testing`] has in-memory implementations.

pub mod config;
pub mod conversation;
pub mod error;
pub mod identity;
pub mod presence;
pub mod services;
pub mod session;
pub mod state;
pub mod store;
pub mod sync;
pub mod testing;
pub mod transport;
pub mod typing;

pub use config::ChatConfig;
pub use conversation::ConversationHandle;
pub use error::ChatError;
pub use identity::{DirectoryProfile, IdentityDirectory, IdentityRecord, IdentityResolver};
pub use presence::{PresenceEntry, PresenceMap};
pub use session::{PortalSession, PresenceRegistry};
pub use state::ChatState;
pub use store::{MessageBatch, MessageStoreApi, MessageStoreClient};
pub use transport::{ChannelStreams, ConversationTransport, PresenceChannel};
