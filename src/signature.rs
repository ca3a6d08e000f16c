use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

/// Provider message-signing scheme: the full webhook URL concatenated with
/// every POST parameter key (sorted lexicographically) immediately followed
/// by its value, HMAC-SHA1 keyed with the auth token, base64-encoded.
pub fn expected_signature(auth_token: &str, url: &str, params: &HashMap<String, String>) -> Option<String> {
    let mut payload = String::from(url);
    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();
    for key in keys {
        payload.push_str(key);
        payload.push_str(&params[key]);
    }

    let mut mac = Hmac::<Sha1>::new_from_slice(auth_token.as_bytes()).ok()?;
    mac.update(payload.as_bytes());
    Some(BASE64.encode(mac.finalize().into_bytes()))
}

pub fn verify_signature(
    auth_token: &str,
    signature_header: Option<&str>,
    url: &str,
    params: &HashMap<String, String>,
) -> bool {
    if auth_token.is_empty() {
        return true;
    }
    let signature = signature_header.unwrap_or("").trim();
    if signature.is_empty() {
        return false;
    }
    let Some(expected) = expected_signature(auth_token, url, params) else {
        return false;
    };
    expected == signature
}
