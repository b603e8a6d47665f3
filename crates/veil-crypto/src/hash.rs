//! SHA-256 hashing, truncated checksums and record-matching prefixes.

use sha2::{Digest, Sha256};

/// SHA-256 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute the SHA-256 hash of input data.
#[must_use]
pub fn sha256(data: &[u8]) -> HashOutput {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute the SHA-256 hash over several concatenated parts.
///
/// Equivalent to hashing the concatenation without allocating it.
#[must_use]
pub fn sha256_parts(parts: &[&[u8]]) -> HashOutput {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Truncated 4-byte checksum over a payload and its initialization vector.
///
/// Tunnel-data messages carry this over the decrypted fragment area; a
/// mismatch after layer decryption means the message was corrupted or
/// mis-keyed and its fragments must be dropped.
#[must_use]
pub fn checksum4(payload: &[u8], iv: &[u8]) -> [u8; 4] {
    let digest = sha256_parts(&[payload, iv]);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Truncated 16-byte prefix of an identity hash, used to match a build
/// record against the local router without decrypting every record.
#[must_use]
pub fn trunc16(hash: &[u8; 32]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&hash[..16]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        // SHA-256 of the empty string
        let digest = sha256(b"");
        assert_eq!(
            digest[..4],
            [0xe3, 0xb0, 0xc4, 0x42],
            "empty-input digest prefix mismatch"
        );
    }

    #[test]
    fn test_sha256_parts_matches_concat() {
        let whole = sha256(b"hello world");
        let parts = sha256_parts(&[b"hello", b" ", b"world"]);
        assert_eq!(whole, parts);
    }

    #[test]
    fn test_checksum_depends_on_iv() {
        let a = checksum4(b"payload", &[0u8; 16]);
        let b = checksum4(b"payload", &[1u8; 16]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_trunc16_prefix() {
        let digest = sha256(b"router identity");
        assert_eq!(trunc16(&digest), digest[..16]);
    }
}
