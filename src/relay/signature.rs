//! Webhook signatures: `X-Signature-256: sha256=<hex HMAC-SHA256 of body>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "x-signature-256";

const PREFIX: &str = "sha256=";

/// Why a webhook signature was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// No signature header was sent.
    #[error("missing X-Signature-256 header")]
    Missing,

    /// The header is not `sha256=<hex>`.
    #[error("malformed signature header")]
    Malformed,

    /// The signature does not match the body.
    #[error("signature mismatch")]
    Mismatch,

    /// The configured secret cannot be used as a key.
    #[error("invalid webhook secret")]
    InvalidSecret,
}

/// Signature header value for `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(body);
    Ok(format!("{}{}", PREFIX, hex::encode(mac.finalize().into_bytes())))
}

/// Check a signature header against `body` in constant time.
pub fn verify(secret: &[u8], body: &[u8], header: Option<&str>) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::Missing)?;
    let digest = header
        .trim()
        .strip_prefix(PREFIX)
        .and_then(|hex_digest| hex::decode(hex_digest).ok())
        .ok_or(SignatureError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidSecret)?;
    mac.update(body);
    mac.verify_slice(&digest).map_err(|_| SignatureError::Mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_body_verifies() {
        let header = sign(b"secret", b"{\"results\":[]}").unwrap();
        assert!(header.starts_with("sha256="));
        assert_eq!(verify(b"secret", b"{\"results\":[]}", Some(&header)), Ok(()));
    }

    #[test]
    fn test_rejections() {
        let header = sign(b"secret", b"body").unwrap();
        assert_eq!(verify(b"secret", b"body", None), Err(SignatureError::Missing));
        assert_eq!(
            verify(b"secret", b"body", Some("md5=abc")),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify(b"other", b"body", Some(&header)),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify(b"secret", b"tampered", Some(&header)),
            Err(SignatureError::Mismatch)
        );
    }
}
