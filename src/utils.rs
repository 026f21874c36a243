use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

pub fn get_current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// HMAC-SHA256 of `value` under `secret`, hex-encoded.
pub fn hmac_sha256_hex(secret: &str, value: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(value.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time string equality. Both sides are HMAC'd under `secret` and
/// the MACs compared with a constant-time verify, so neither length nor
/// content differences leak through timing.
pub fn constant_time_eq(secret: &str, a: &str, b: &str) -> bool {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(a.as_bytes());
    let tag = mac.finalize().into_bytes();

    let mut other =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    other.update(b.as_bytes());
    other.verify_slice(&tag).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_hex_is_deterministic() {
        let a = hmac_sha256_hex("secret", "value");
        let b = hmac_sha256_hex("secret", "value");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, hmac_sha256_hex("other-secret", "value"));
    }

    #[test]
    fn constant_time_eq_matches_plain_equality() {
        assert!(constant_time_eq("k", "token", "token"));
        assert!(!constant_time_eq("k", "token", "token2"));
        assert!(!constant_time_eq("k", "", "token"));
        assert!(constant_time_eq("k", "", ""));
    }

    #[test]
    fn current_timestamp_is_recent() {
        // Sanity: after 2023, before 2100.
        let now = get_current_timestamp();
        assert!(now > 1_672_531_200);
        assert!(now < 4_102_444_800);
    }
}
