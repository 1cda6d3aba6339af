use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Fresh opaque access token for callers that did not supply one.
pub fn generate_token() -> String {
    Uuid::new_v4().simple().to_string().to_ascii_uppercase()
}

/// Instance-independent digest used to detect a token reused across instances.
pub fn token_fingerprint(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// Credential hash handed back to the caller; binds the token to one instance id.
pub fn credential_hash(instance_id: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(instance_id.as_bytes());
    hasher.update(b":");
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub(crate) fn normalize_token(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}
