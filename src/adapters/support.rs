//! Shared plumbing for the six platform adapters: signature verification,
//! replay-window checks, and the base64url codec used by several thread-ID
//! encodings. Grounded in the HMAC-token pattern from the sibling corpus
//! repo's `chatty_server::server::auth` (constant-time compare over a
//! `Hmac<Sha256>` digest) and the Ed25519 signature check the wider
//! Discord-bot ecosystem (`ed25519-dalek`) standardizes on.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

/// Maximum allowed clock skew for replayed webhook timestamps, per the
/// "typical: 5 minutes" guidance on adapter ingress.
pub const REPLAY_WINDOW_SECS: i64 = 300;

pub fn b64url_encode(bytes: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64url_decode(s: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| Error::validation("thread_id", format!("invalid base64url segment: {e}")))
}

/// Constant-time comparison; avoids leaking timing information about where
/// two byte strings first differ.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Verifies an HMAC-SHA256 digest (hex-encoded, optionally prefixed with
/// `sha256=` as GitHub does) over `signed_payload` using `secret`.
pub fn verify_hmac_sha256_hex(secret: &[u8], signed_payload: &[u8], provided_hex: &str) -> bool {
    let provided_hex = provided_hex.strip_prefix("sha256=").unwrap_or(provided_hex);
    let Ok(provided) = hex::decode(provided_hex) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
        return false;
    };
    mac.update(signed_payload);
    constant_time_eq(&mac.finalize().into_bytes(), &provided)
}

/// Current Unix time in seconds.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Rejects a webhook-carried timestamp that falls outside the replay window.
pub fn check_replay_window(timestamp_secs: i64) -> Result<()> {
    if (now_secs() - timestamp_secs).abs() > REPLAY_WINDOW_SECS {
        return Err(Error::Authentication);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_round_trip() {
        let secret = b"s3cr3t";
        let payload = b"v0:1690000000:{\"ok\":true}";
        let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
        mac.update(payload);
        let sig = hex::encode(mac.finalize().into_bytes());
        assert!(verify_hmac_sha256_hex(secret, payload, &sig));
        assert!(verify_hmac_sha256_hex(secret, payload, &format!("sha256={sig}")));
        assert!(!verify_hmac_sha256_hex(secret, payload, "00"));
    }

    #[test]
    fn replay_window_rejects_stale_timestamps() {
        assert!(check_replay_window(now_secs()).is_ok());
        assert!(check_replay_window(now_secs() - 3600).is_err());
    }

    #[test]
    fn b64url_round_trip() {
        let encoded = b64url_encode("conv-123:abc");
        assert_eq!(b64url_decode(&encoded).unwrap(), b"conv-123:abc");
    }
}
