use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Header carrying the hex-encoded HMAC-SHA256 of `"{timestamp}." + body`.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Header carrying the unix-seconds timestamp the signature covers.
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

type HmacSha256 = Hmac<Sha256>;

fn mac_for(secret: &[u8]) -> HmacSha256 {
    // HMAC-SHA256 accepts keys of any length.
    HmacSha256::new_from_slice(secret).expect("hmac key")
}

/// Sign a request body. The timestamp is folded into the MAC so a
/// captured request cannot be replayed outside its freshness window.
pub fn compute_signature(secret: &[u8], timestamp_secs: u64, body: &[u8]) -> String {
    let mut mac = mac_for(secret);
    mac.update(timestamp_secs.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a received signature.
pub fn verify_signature(
    secret: &[u8],
    timestamp_secs: u64,
    body: &[u8],
    signature_hex: &str,
) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    let mut mac = mac_for(secret);
    mac.update(timestamp_secs.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// Whether a signed timestamp is recent enough. Timestamps from the
/// future are rejected outright.
pub fn is_timestamp_fresh(timestamp_secs: u64, now_secs: u64, max_age_secs: u64) -> bool {
    now_secs >= timestamp_secs && now_secs - timestamp_secs <= max_age_secs
}

/// Receiver-side verification failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    MissingTimestamp,
    InvalidTimestamp,
    StaleTimestamp,
    InvalidSignature,
}

/// Verify an incoming request against the headers this engine sends.
///
/// Receivers pass the header pairs as seen on the wire; names are
/// matched case-insensitively.
pub fn verify_request<'a, I>(
    headers: I,
    body: &[u8],
    secret: &[u8],
    max_age_secs: u64,
    now_secs: u64,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut signature = None;
    let mut timestamp = None;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case(SIGNATURE_HEADER) {
            signature = Some(value);
        } else if name.eq_ignore_ascii_case(TIMESTAMP_HEADER) {
            timestamp = Some(value);
        }
    }

    let signature = signature.ok_or(VerificationError::MissingSignature)?;
    let timestamp = timestamp
        .ok_or(VerificationError::MissingTimestamp)?
        .parse::<u64>()
        .map_err(|_| VerificationError::InvalidTimestamp)?;

    if !is_timestamp_fresh(timestamp, now_secs, max_age_secs) {
        return Err(VerificationError::StaleTimestamp);
    }

    if verify_signature(secret, timestamp, body, signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let signature = compute_signature(b"secret", 1000, b"payload");
        assert!(verify_signature(b"secret", 1000, b"payload", &signature));
        assert!(!verify_signature(b"secret", 1001, b"payload", &signature));
        assert!(!verify_signature(b"other", 1000, b"payload", &signature));
        assert!(!verify_signature(b"secret", 1000, b"tampered", &signature));
    }

    #[test]
    fn freshness_window() {
        assert!(is_timestamp_fresh(100, 130, 60));
        assert!(!is_timestamp_fresh(100, 200, 60));
        // Future timestamps are never fresh.
        assert!(!is_timestamp_fresh(130, 100, 60));
    }

    #[test]
    fn verify_request_reports_each_failure() {
        let ts = 1000u64;
        let sig = compute_signature(b"k", ts, b"body");
        let ts_str = ts.to_string();

        let ok = vec![
            ("x-webhook-signature", sig.as_str()),
            ("x-webhook-timestamp", ts_str.as_str()),
        ];
        assert_eq!(verify_request(ok.clone(), b"body", b"k", 60, ts + 10), Ok(()));

        assert_eq!(
            verify_request(ok.clone(), b"body", b"k", 60, ts + 120),
            Err(VerificationError::StaleTimestamp)
        );
        assert_eq!(
            verify_request(ok, b"other", b"k", 60, ts + 10),
            Err(VerificationError::InvalidSignature)
        );
        assert_eq!(
            verify_request(Vec::new(), b"body", b"k", 60, ts),
            Err(VerificationError::MissingSignature)
        );
    }
}
