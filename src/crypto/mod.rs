//! Secrets at rest and signed identity tokens.
//!
//! - [`Cipher`]: AES-256-GCM, one random nonce per value, output is one opaque string
//! - [`TokenSigner`]: HMAC-SHA256 compact tokens carrying the calling user id
//!
//! Key material is process-wide configuration, loaded once at startup.

mod encryption;
mod token;

pub use encryption::{validate_key, Cipher};
pub use token::{Claims, TokenError, TokenKind, TokenSigner};
