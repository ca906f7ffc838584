use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256 over the given body bytes using the shared secret.
/// Returns the hex-encoded MAC.
pub fn compute_hmac(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    alloy::hex::encode(mac.finalize().into_bytes())
}

/// Verify an HMAC-SHA256 signature against the expected body.
///
/// Uses constant-time comparison; invalid hex signatures are handled without
/// timing side-channels.
pub fn verify_hmac(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    let expected = alloy::hex::decode(signature).unwrap_or_else(|_| vec![0u8; 32]);
    mac.verify_slice(&expected).is_ok()
}
