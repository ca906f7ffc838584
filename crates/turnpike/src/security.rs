//! Shared security helpers: constant-time comparison and log redaction.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Constant-time byte comparison that does not leak input lengths or content.
///
/// Both inputs are hashed to fixed-length SHA-256 digests before comparison,
/// so timing reveals neither the content nor the length of either input.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let ha = Sha256::digest(a);
    let hb = Sha256::digest(b);
    ha.ct_eq(&hb).into()
}

/// Redact an address for logging: `0x1234…abcd`.
///
/// Full addresses never appear in logs; full transaction hashes may, at info
/// level only.
pub fn redact_address(address: &str) -> String {
    let trimmed = address.strip_prefix("0x").unwrap_or(address);
    if trimmed.len() < 8 {
        return "0x…".to_string();
    }
    format!("0x{}…{}", &trimmed[..4], &trimmed[trimmed.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_inputs_match() {
        assert!(constant_time_eq(b"hello", b"hello"));
    }

    #[test]
    fn different_inputs_do_not_match() {
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"much longer string"));
    }

    #[test]
    fn test_redact_address() {
        assert_eq!(
            redact_address("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
            "0x8335…2913"
        );
        assert_eq!(redact_address("0xab"), "0x…");
    }
}
