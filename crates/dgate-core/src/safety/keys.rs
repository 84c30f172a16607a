//! Entity-key normalization for the safety counter maps.
//!
//! Identifiers are trimmed. Identifiers longer than [`MAX_ENTITY_KEY_LENGTH`]
//! characters are replaced by `"h:" + hex(sha256(id))` so an attacker cannot
//! grow the persisted document by choosing long ids. Distinct long ids that
//! collide under SHA-256 would share a counter; that risk is accepted.

use sha2::{Digest, Sha256};

/// Longest identifier stored verbatim.
pub const MAX_ENTITY_KEY_LENGTH: usize = 128;

/// Prefix marking a hashed key.
pub const HASHED_KEY_PREFIX: &str = "h:";

/// Normalizes an entity identifier. Returns `None` for blank identifiers.
#[must_use]
pub fn normalize_entity_key(id: &str) -> Option<String> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.chars().count() > MAX_ENTITY_KEY_LENGTH {
        let digest = Sha256::digest(trimmed.as_bytes());
        return Some(format!("{HASHED_KEY_PREFIX}{}", hex::encode(digest)));
    }
    Some(trimmed.to_string())
}
