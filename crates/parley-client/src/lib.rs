//! # parley-client
//!
//! Client side of the relay: the device keystore, the public key directory
//! client, the per-peer shared-secret cache and the chat session that ties
//! them to the relay's HTTP API.
//!
//! Everything that talks to the network sits behind a trait
//! ([`KeyDirectory`], [`RelayTransport`]) so sessions can be driven against
//! the real [`RelayClient`] or an in-memory double.

pub mod config;
pub mod context;
pub mod directory;
pub mod error;
pub mod events;
pub mod keystore;
pub mod relay_client;
pub mod scheduler;
pub mod secrets;
pub mod session;
pub mod transport;

pub use config::ClientConfig;
pub use context::E2eeContext;
pub use directory::KeyDirectory;
pub use error::ClientError;
pub use events::{EventBus, SessionEvent};
pub use keystore::{FileSecretStorage, Keystore, MemorySecretStorage, SecretStorage};
pub use relay_client::RelayClient;
pub use secrets::SecretCache;
pub use session::{ChatSession, EncryptionState, LocalMessage, SessionSettings};
pub use transport::RelayTransport;
