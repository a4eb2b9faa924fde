//! Webhook payload signatures.
//!
//! Every delivery carries `X-Webhook-Signature: <alg>=<hex digest>` where the
//! digest is an HMAC of the multipart body keyed by the webhook secret.
//! Receivers recompute it with [`verify_signature`].

use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use tracing::warn;

use crate::accounts::WebhookAlg;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Lowercase hex HMAC of `payload` keyed by `secret`.
pub fn sign(alg: WebhookAlg, secret: &str, payload: &[u8]) -> Result<String, InvalidLength> {
    let digest = match alg {
        WebhookAlg::Sha256 => {
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
            mac.update(payload);
            hex::encode(mac.finalize().into_bytes())
        }
        WebhookAlg::Sha512 => {
            let mut mac = HmacSha512::new_from_slice(secret.as_bytes())?;
            mac.update(payload);
            hex::encode(mac.finalize().into_bytes())
        }
    };
    Ok(digest)
}

/// Value of the signature header: `<alg>=<digest>`.
pub fn signature_header(
    alg: WebhookAlg,
    secret: &str,
    payload: &[u8],
) -> Result<String, InvalidLength> {
    Ok(format!("{}={}", alg, sign(alg, secret, payload)?))
}

/// Check a received signature header against `payload`.
///
/// # Arguments
///
/// * `secret` - The shared webhook secret
/// * `header` - The `X-Webhook-Signature` value, e.g. `sha256=ab12...`
/// * `payload` - The signed bytes
///
/// # Returns
///
/// `true` if the header names a supported algorithm and the digest matches.
pub fn verify_signature(secret: &str, header: &str, payload: &[u8]) -> bool {
    if secret.is_empty() || header.is_empty() {
        warn!(
            has_secret = !secret.is_empty(),
            has_header = !header.is_empty(),
            "webhook_signature_missing_fields"
        );
        return false;
    }

    let (alg, digest) = match header.split_once('=') {
        Some(parts) => parts,
        None => {
            warn!("webhook_signature_malformed");
            return false;
        }
    };

    let alg = match alg {
        "sha256" => WebhookAlg::Sha256,
        "sha512" => WebhookAlg::Sha512,
        other => {
            warn!(alg = %other, "webhook_signature_unsupported_alg");
            return false;
        }
    };

    let expected = match sign(alg, secret, payload) {
        Ok(d) => d,
        Err(_) => {
            warn!("webhook_signature_invalid_key");
            return false;
        }
    };

    let valid = constant_time_compare(&expected, &digest.to_ascii_lowercase());

    if !valid {
        warn!(
            expected_length = expected.len(),
            actual_length = digest.len(),
            "webhook_signature_mismatch"
        );
    }

    valid
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_known_vector() {
        // RFC 4231 test case 2
        let digest = sign(WebhookAlg::Sha256, "Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            digest,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_sign_is_deterministic() {
        let body = b"--boundary\r\nContent-Disposition: form-data; name=\"account\"\r\n\r\nx\r\n";
        let a = signature_header(WebhookAlg::Sha256, "s3cr3t", body).unwrap();
        let b = signature_header(WebhookAlg::Sha256, "s3cr3t", body).unwrap();
        let other = signature_header(WebhookAlg::Sha256, "other", body).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, other);
        assert!(a.starts_with("sha256="));
        assert!(a["sha256=".len()..]
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_sha512_digest_length() {
        let digest = sign(WebhookAlg::Sha512, "s3cr3t", b"payload").unwrap();
        assert_eq!(digest.len(), 128);
    }

    #[test]
    fn test_verify_signature_roundtrip() {
        let header = signature_header(WebhookAlg::Sha512, "s3cr3t", b"payload").unwrap();
        assert!(verify_signature("s3cr3t", &header, b"payload"));
        assert!(!verify_signature("s3cr3t", &header, b"tampered"));
        assert!(!verify_signature("wrong", &header, b"payload"));
    }

    #[test]
    fn test_verify_signature_rejects_malformed_headers() {
        assert!(!verify_signature("s3cr3t", "", b"payload"));
        assert!(!verify_signature("", "sha256=00", b"payload"));
        assert!(!verify_signature("s3cr3t", "no-separator", b"payload"));
        assert!(!verify_signature("s3cr3t", "md5=00", b"payload"));
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "abcd"));
    }
}
