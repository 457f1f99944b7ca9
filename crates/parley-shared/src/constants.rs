/// Application name
pub const APP_NAME: &str = "Parley";

/// Identity used when no operator is configured
pub const DEFAULT_OPERATOR_IDENTITY: &str = "admin@example.com";

/// AES-256-GCM nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// AES-256-GCM authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// X25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Symmetric key size in bytes (for AES-256-GCM)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// HKDF-SHA256 salt. Must match the mobile client byte for byte.
pub const KDF_SALT: &[u8] = b"kylegpt-e2ee-v1";

/// Maximum encoded length accepted for a published public key
pub const MAX_PUBLIC_KEY_LEN: usize = 200;

/// Maximum message text length in characters
pub const MAX_TEXT_CHARS: usize = 10_000;

/// Maximum encoded image payload length
pub const MAX_IMAGE_ENCODED_LEN: usize = 2_800_000;

/// Maximum accepted chat title length in characters
pub const MAX_TITLE_CHARS: usize = 100;

/// Titles longer than this are truncated for display
pub const TITLE_DISPLAY_CHARS: usize = 28;

/// Characters kept before the ellipsis when truncating a title
pub const TITLE_TRUNCATE_AT: usize = 25;

/// Title given to freshly created chats
pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

/// Default and maximum page sizes for message listings
pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const MAX_PAGE_SIZE: u32 = 500;

/// Presence room used by the operator heartbeat
pub const DEFAULT_PRESENCE_ROOM: &str = "admin_heartbeat";

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 3000;
