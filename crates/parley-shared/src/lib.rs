//! # parley-shared
//!
//! Types and primitives shared by the relay server and the client:
//! X25519 keypairs and key agreement, the AES-256-GCM cipher engine, the
//! typed message/chat model and the field-tagged envelope used on the wire.

pub mod constants;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod protocol;
pub mod types;
