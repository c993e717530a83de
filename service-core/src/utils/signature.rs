use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `payload` under `secret`.
pub fn sign_payload(secret: &str, payload: &[u8]) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a hex HMAC-SHA256 signature using constant-time comparison.
///
/// Accepts an optional `sha256=` prefix, as sent by most webhook senders.
pub fn verify_payload(
    secret: &str,
    payload: &[u8],
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected_signature = sign_payload(secret, payload)?;
    let provided = signature.trim();
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);

    let expected_bytes = expected_signature.as_bytes();
    let signature_bytes = provided.as_bytes();

    if expected_bytes.len() != signature_bytes.len() {
        return Ok(false);
    }

    Ok(expected_bytes.ct_eq(signature_bytes).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_generation_and_verification() {
        let secret = "whsec_test";
        let body = br#"{"type":"payment.succeeded"}"#;

        let signature = sign_payload(secret, body).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(verify_payload(secret, body, &signature).unwrap());
        assert!(verify_payload(secret, body, &format!("sha256={}", signature)).unwrap());
    }

    #[test]
    fn test_invalid_signature() {
        let secret = "whsec_test";
        let body = br#"{"type":"payment.succeeded"}"#;

        let signature = sign_payload(secret, body).unwrap();
        let flipped = if signature.starts_with('a') { "b" } else { "a" };
        let invalid_signature = format!("{}{}", flipped, &signature[1..]);

        assert!(!verify_payload(secret, body, &invalid_signature).unwrap());
        assert!(!verify_payload(secret, body, "short").unwrap());
    }

    #[test]
    fn test_tampered_body() {
        let secret = "whsec_test";
        let signature = sign_payload(secret, br#"{"amount":1000}"#).unwrap();

        assert!(!verify_payload(secret, br#"{"amount":9000}"#, &signature).unwrap());
    }
}
