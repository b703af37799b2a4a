#![forbid(unsafe_code)]

use blake3::Hasher;

/// 32-byte blake3 digest used for every hash in the ledger.
pub type Digest = [u8; 32];

/// Sentinel predecessor of the first record in any chain.
pub const GENESIS: Digest = [0u8; 32];

/// Start a hasher bound to a fully-qualified domain to avoid cross-type collisions.
pub fn domain_hasher(domain: &str, schema: &str, version: &str) -> Hasher {
    let mut hasher = Hasher::new();
    hasher.update(domain.as_bytes());
    hasher.update(b":");
    hasher.update(schema.as_bytes());
    hasher.update(b":");
    hasher.update(version.as_bytes());
    hasher
}

/// Feed a length-prefixed string so adjacent fields cannot run together.
pub fn update_str(hasher: &mut Hasher, value: &str) {
    hasher.update(&(value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

pub fn finalize(hasher: Hasher) -> Digest {
    *hasher.finalize().as_bytes()
}

/// Lowercase hex rendering used in diagnostics.
pub fn to_hex(digest: &Digest) -> String {
    hex::encode(digest)
}

/// Short prefix for log lines and error descriptions.
pub fn short_hex(digest: &Digest) -> String {
    digest
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_separates_digests() {
        let mut a = domain_hasher("PDO", "TRANSITION", "v1");
        update_str(&mut a, "payload");
        let mut b = domain_hasher("PDO", "PROOF", "v1");
        update_str(&mut b, "payload");

        assert_ne!(finalize(a), finalize(b));
    }

    #[test]
    fn length_prefix_prevents_field_shifting() {
        let mut a = domain_hasher("PDO", "T", "v1");
        update_str(&mut a, "ab");
        update_str(&mut a, "c");
        let mut b = domain_hasher("PDO", "T", "v1");
        update_str(&mut b, "a");
        update_str(&mut b, "bc");

        assert_ne!(finalize(a), finalize(b));
    }

    #[test]
    fn hex_helpers() {
        let digest = [0xabu8; 32];
        assert_eq!(to_hex(&digest).len(), 64);
        assert_eq!(short_hex(&digest), "abababababababab");
        assert_eq!(to_hex(&GENESIS), "0".repeat(64));
    }
}
