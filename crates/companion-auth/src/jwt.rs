//! Unverified JWT claim decoding
//!
//! Only used to read the `exp` claim of the persona access token so minted
//! bundles never outlive the token they were issued from. Signatures are not
//! checked: the token is ours and the server validates it anyway.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Decode the claims segment of a JWT without verifying its signature.
pub fn decode_claims(token: &str) -> Option<serde_json::Value> {
    let mut segments = token.split('.');
    let (_header, payload) = (segments.next()?, segments.next()?);
    segments.next()?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// `exp` claim as unix milliseconds.
pub fn expiry_millis(token: &str) -> Option<u64> {
    decode_claims(token)?
        .get("exp")?
        .as_u64()
        .map(|secs| secs.saturating_mul(1000))
}

#[cfg(test)]
pub(crate) fn encode_test_token(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
    format!("{header}.{payload}.signature")
}
