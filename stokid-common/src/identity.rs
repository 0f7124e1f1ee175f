//! Stock variant identity generation

use uuid::Uuid;

/// Generate a fresh identity_id for a new stock variant.
///
/// Identities are opaque UUIDv4 strings and are never reused.
pub fn generate() -> String {
    Uuid::new_v4().to_string()
}

/// True when `identity_id` carries a usable value.
pub fn is_present(identity_id: &str) -> bool {
    !identity_id.trim().is_empty()
}
