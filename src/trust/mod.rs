//! Host-key trust: persisted store, acceptance policy, key text helpers

mod policy;
mod store;

pub use policy::{Classification, HostKeyPolicy, HostState, REDUNDANT_NEW_FLAG_MSG};
pub use store::{ServerPubKeyRecord, StoreError, StoreFormat, TrustStore};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};

/// OpenSSH one-line text encoding of a public key. This is the trust store's
/// key: the algorithm name followed by the base64 of the wire bytes.
pub fn authorized_key_line(key: &PublicKey) -> String {
    format!("{} {}", key.algorithm().as_str(), key.public_key_base64())
}

/// SHA256 fingerprint of a public key in the format OpenSSH prints:
/// `SHA256:` + unpadded standard base64 of the wire marshal's digest.
pub fn fingerprint(key: &PublicKey) -> String {
    fingerprint_bytes(&key.public_key_bytes())
}

/// Fingerprint of raw wire-form key bytes.
pub fn fingerprint_bytes(wire: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(wire);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format_and_stability() {
        let wire = b"\x00\x00\x00\x0bssh-ed25519\x00\x00\x00 0123456789abcdef0123456789abcdef";
        let fp = fingerprint_bytes(wire);
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        // pure function of the bytes
        assert_eq!(fp, fingerprint_bytes(wire));
    }

    #[test]
    fn test_fingerprint_changes_with_any_byte() {
        let wire = b"\x00\x00\x00\x07ssh-rsa payload".to_vec();
        let base = fingerprint_bytes(&wire);
        for i in 0..wire.len() {
            let mut flipped = wire.clone();
            flipped[i] ^= 0x01;
            assert_ne!(base, fingerprint_bytes(&flipped), "byte {} did not matter", i);
        }
    }

    #[test]
    fn test_fingerprint_matches_manual_digest() {
        use sha2::{Digest, Sha256};

        let wire = b"arbitrary wire bytes";
        let digest = Sha256::digest(wire);
        let expected = format!(
            "SHA256:{}",
            BASE64.encode(digest).trim_end_matches('=')
        );
        assert_eq!(fingerprint_bytes(wire), expected);
    }
}
