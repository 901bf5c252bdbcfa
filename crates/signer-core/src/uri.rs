//! Connection-string helpers (spec §6, §11 supplement): a `bunker://`
//! generator for the daemon side and a `nostrconnect://` parser for the
//! client-initiated connect flow.

use nostr_sdk::PublicKey;
use url::Url;

use crate::error::SignerError;
use crate::validation;

/// Build a `bunker://<pubkey>?relay=...&relay=...&secret=...` URI
/// advertising this key. `relays` should already be the effective relay
/// set (config or per-app override); `secret` is the opaque one-time
/// token or admin secret to embed, if any.
pub fn bunker_uri(pubkey: &PublicKey, relays: &[String], secret: Option<&str>) -> String {
    let mut url = format!("bunker://{}?", pubkey.to_hex());
    let mut first = true;
    for relay in relays {
        if !first {
            url.push('&');
        }
        first = false;
        url.push_str("relay=");
        url.push_str(&urlencoding_encode(relay));
    }
    if let Some(secret) = secret {
        if !first {
            url.push('&');
        }
        url.push_str("secret=");
        url.push_str(&urlencoding_encode(secret));
    }
    url
}

/// A parsed `nostrconnect://` URI (spec §6): a client announcing itself
/// and the relays/secret it wants the connect handshake to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NostrConnectUri {
    pub client_pubkey: PublicKey,
    pub relays: Vec<String>,
    pub secret: Option<String>,
    pub name: Option<String>,
}

/// Parse and validate a `nostrconnect://<client-pubkey>?relay=...&secret=...&name=...`
/// URI. Rejects more than 10 relays, any non-`ws(s)://` relay, or a total
/// length over 2048 chars (spec §6).
pub fn parse_nostrconnect(uri: &str) -> Result<NostrConnectUri, SignerError> {
    validation::validate_uri_len(uri)?;

    let parsed = Url::parse(uri).map_err(|e| SignerError::InvalidUri(format!("{uri}: {e}")))?;
    if parsed.scheme() != "nostrconnect" {
        return Err(SignerError::InvalidUri(format!("expected nostrconnect:// scheme, got {}", parsed.scheme())));
    }

    let host = parsed
        .host_str()
        .or_else(|| parsed.path().strip_prefix('/'))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SignerError::InvalidUri("missing client pubkey".into()))?;
    let client_pubkey = PublicKey::from_hex(host).map_err(|e| SignerError::InvalidUri(format!("bad client pubkey: {e}")))?;

    let mut relays = Vec::new();
    let mut secret = None;
    let mut name = None;
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "relay" => relays.push(value.into_owned()),
            "secret" => secret = Some(value.into_owned()),
            "name" => name = Some(value.into_owned()),
            _ => {}
        }
    }

    validation::validate_relay_list(&relays)?;

    Ok(NostrConnectUri { client_pubkey, relays, secret, name })
}

/// Minimal RFC 3986 percent-encoding for query values; `url::Url` only
/// encodes when building a full URL via its own query-pair builder, which
/// this one-off string format doesn't use.
fn urlencoding_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::Keys;

    #[test]
    fn bunker_uri_includes_relays_and_secret() {
        let keys = Keys::generate();
        let url = bunker_uri(&keys.public_key(), &["wss://relay.damus.io".to_string()], Some("tok"));
        assert!(url.starts_with(&format!("bunker://{}?", keys.public_key().to_hex())));
        assert!(url.contains("relay=wss%3A%2F%2Frelay.damus.io"));
        assert!(url.contains("secret=tok"));
    }

    #[test]
    fn nostrconnect_round_trips_through_parse() {
        let keys = Keys::generate();
        let uri = format!(
            "nostrconnect://{}?relay=wss%3A%2F%2Frelay.damus.io&secret=abc&name=MyApp",
            keys.public_key().to_hex()
        );
        let parsed = parse_nostrconnect(&uri).unwrap();
        assert_eq!(parsed.client_pubkey, keys.public_key());
        assert_eq!(parsed.relays, vec!["wss://relay.damus.io".to_string()]);
        assert_eq!(parsed.secret.as_deref(), Some("abc"));
        assert_eq!(parsed.name.as_deref(), Some("MyApp"));
    }

    #[test]
    fn nostrconnect_rejects_too_many_relays() {
        let keys = Keys::generate();
        let mut uri = format!("nostrconnect://{}?", keys.public_key().to_hex());
        for i in 0..11 {
            uri.push_str(&format!("relay=wss%3A%2F%2Frelay{i}.example&"));
        }
        assert!(parse_nostrconnect(&uri).is_err());
    }

    #[test]
    fn nostrconnect_rejects_wrong_scheme() {
        let keys = Keys::generate();
        let uri = format!("bunker://{}", keys.public_key().to_hex());
        assert!(parse_nostrconnect(&uri).is_err());
    }
}
