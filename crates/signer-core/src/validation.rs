//! Input-validation bounds from spec §6.

use crate::error::SignerError;

pub const MAX_KEY_NAME_LEN: usize = 64;
pub const MAX_APP_NAME_LEN: usize = 128;
pub const MAX_PASSPHRASE_LEN: usize = 256;
pub const MAX_URI_LEN: usize = 2048;
pub const MAX_RELAYS_PER_CONNECTION: usize = 10;

/// `keyName`: 1-64 chars, `[A-Za-z0-9_-]`.
pub fn validate_key_name(name: &str) -> Result<(), SignerError> {
    if name.is_empty() || name.len() > MAX_KEY_NAME_LEN {
        return Err(SignerError::InvalidKeyName(format!(
            "length must be 1-{MAX_KEY_NAME_LEN}, got {}",
            name.len()
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(SignerError::InvalidKeyName(
            "must match [A-Za-z0-9_-]".into(),
        ));
    }
    Ok(())
}

/// `appName`: <= 128 chars.
pub fn validate_app_name(name: &str) -> Result<(), SignerError> {
    if name.len() > MAX_APP_NAME_LEN {
        return Err(SignerError::InvalidInput(format!(
            "app name exceeds {MAX_APP_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// `passphrase`: <= 256 chars.
pub fn validate_passphrase_len(passphrase: &str) -> Result<(), SignerError> {
    if passphrase.len() > MAX_PASSPHRASE_LEN {
        return Err(SignerError::PassphraseTooLong);
    }
    Ok(())
}

pub fn validate_uri_len(uri: &str) -> Result<(), SignerError> {
    if uri.len() > MAX_URI_LEN {
        return Err(SignerError::InvalidUri(format!(
            "exceeds {MAX_URI_LEN} characters"
        )));
    }
    Ok(())
}

/// A relay URL must be `ws://` or `wss://`.
pub fn validate_relay_url(url: &str) -> Result<(), SignerError> {
    if !(url.starts_with("ws://") || url.starts_with("wss://")) {
        return Err(SignerError::InvalidRelay(url.to_string()));
    }
    url::Url::parse(url).map_err(|e| SignerError::InvalidRelay(format!("{url}: {e}")))?;
    Ok(())
}

pub fn validate_relay_list(relays: &[String]) -> Result<(), SignerError> {
    if relays.len() > MAX_RELAYS_PER_CONNECTION {
        return Err(SignerError::TooManyRelays(relays.len()));
    }
    for r in relays {
        validate_relay_url(r)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_name_bounds() {
        assert!(validate_key_name("alice").is_ok());
        assert!(validate_key_name("alice-2_main").is_ok());
        assert!(validate_key_name("").is_err());
        assert!(validate_key_name(&"a".repeat(65)).is_err());
        assert!(validate_key_name("alice bob").is_err());
        assert!(validate_key_name("alice/bob").is_err());
    }

    #[test]
    fn relay_list_bounds() {
        let too_many: Vec<String> = (0..11).map(|i| format!("wss://relay{i}.example")).collect();
        assert!(validate_relay_list(&too_many).is_err());

        let ok = vec!["wss://relay.damus.io".to_string(), "ws://localhost:7777".to_string()];
        assert!(validate_relay_list(&ok).is_ok());

        let bad = vec!["https://not-a-relay.example".to_string()];
        assert!(validate_relay_list(&bad).is_err());
    }

    #[test]
    fn passphrase_and_uri_len() {
        assert!(validate_passphrase_len(&"x".repeat(256)).is_ok());
        assert!(validate_passphrase_len(&"x".repeat(257)).is_err());
        assert!(validate_uri_len(&"x".repeat(2048)).is_ok());
        assert!(validate_uri_len(&"x".repeat(2049)).is_err());
    }
}
