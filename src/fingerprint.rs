//! Deterministic, collision-free `Session.id` derivation (§3 invariant).
//!
//! Uses SHA-256 rather than `std::collections::hash_map::DefaultHasher`
//! because the output has to stay stable across process restarts and
//! toolchain upgrades -- `DefaultHasher`'s algorithm is explicitly
//! unspecified and may change between compiler versions, which would
//! silently orphan every persisted session on an upgrade.

use sha2::{Digest, Sha256};

/// Length of the hex-encoded id. 16 hex chars (64 bits) is far beyond the
/// realistic `(tool, workdir)` cardinality of a single controller instance.
const ID_HEX_LEN: usize = 16;

/// Derive a session id from `(tool_name, workdir)`.
#[must_use]
pub fn fingerprint(tool_name: &str, workdir: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(workdir.as_bytes());
    let digest = hasher.finalize();
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    hex[..ID_HEX_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_and_distinct() {
        let a = fingerprint("codex", "/home/user/proj");
        let b = fingerprint("codex", "/home/user/proj");
        let c = fingerprint("codex", "/home/user/other");
        let d = fingerprint("claude", "/home/user/proj");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), ID_HEX_LEN);
    }
}
