/// Keyed token fingerprints
///
/// Refresh tokens are stored by HMAC-SHA256 fingerprint so that storage can
/// match them by equality without ever holding the raw value.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `data` under `secret` (64 characters).
pub fn fingerprint(data: &str, secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC-SHA256 accepts keys of any length");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let first = fingerprint("token-value", "secret");
        let second = fingerprint("token-value", "secret");

        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, "token-value");
    }

    #[test]
    fn test_different_inputs_different_fingerprints() {
        assert_ne!(fingerprint("token-a", "secret"), fingerprint("token-b", "secret"));
        assert_ne!(fingerprint("token-a", "secret"), fingerprint("token-a", "other"));
    }

    #[test]
    fn test_known_vector() {
        // RFC 4231 test case 2
        assert_eq!(
            fingerprint("what do ya want for nothing?", "Jefe"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
