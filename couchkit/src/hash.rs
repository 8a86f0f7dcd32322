//! Content digests for expanded design document functions.

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of `text`.
///
/// Keys of the `couchapp.objects` table: the digest of an expanded function
/// body maps to its source before macro expansion, which is how a cloned
/// design directory gets its `!code` directives back.
pub fn sha256(text: impl AsRef<str>) -> String {
    let digest = Sha256::digest(text.as_ref().as_bytes());
    format!("{digest:x}")
}
