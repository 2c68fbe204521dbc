//! Request signing for the CloudStack API: parameters sorted by key, values
//! URL-encoded, the whole query lowercased and signed with HMAC-SHA1.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use ring::hmac;
use url::form_urlencoded;

/// Encode a query value the way the management server decodes it. Spaces
/// have to be `%20`; a `+` breaks the signature.
pub fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Build the full query string for `params`, `signature` included.
pub fn signed_query(params: &[(String, String)], secret_key: &str) -> String {
    let mut sorted = params.to_vec();
    sorted.sort_by_key(|(k, _)| k.to_lowercase());
    let query = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret_key.as_bytes());
    let tag = hmac::sign(&key, query.to_lowercase().as_bytes());
    let signature = BASE64_STANDARD.encode(tag.as_ref());
    format!("{}&signature={}", query, encode(&signature))
}
