use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of bytes, returning lowercase hex string.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Identity for a record that carries no `uuid` of its own.
pub fn content_uuid(line: &str) -> String {
    format!("sha256:{}", sha256_hex(line.as_bytes()))
}
