// SPDX-License-Identifier: MIT

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 over `payload`. Used for webhook signatures
/// (`X-Quack-Signature`) and bridge tokens.
pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    hex(&mac.finalize().into_bytes())
}

/// Bridge token for an agent: HMAC over the agent id, truncated to 32 hex
/// characters.
pub fn bridge_token(secret: &str, agent_id: &str) -> String {
    let mut tok = hmac_sha256_hex(secret, agent_id.as_bytes());
    tok.truncate(32);
    tok
}

/// Hex-encoded SHA-256 digest, used for API keys at rest.
pub fn sha256_hex(input: &str) -> String {
    hex(&Sha256::digest(input.as_bytes()))
}

/// Constant-time string comparison for token checks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_token_is_32_hex_chars_and_deterministic() {
        let a = bridge_token("secret", "replit/agent");
        let b = bridge_token("secret", "replit/agent");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, bridge_token("secret", "cursor/agent"));
        assert_ne!(a, bridge_token("other", "replit/agent"));
    }

    #[test]
    fn constant_time_eq_rejects_mismatch() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }

    #[test]
    fn signature_matches_known_shape() {
        let sig = hmac_sha256_hex("s3cret", b"{\"ok\":true}");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
