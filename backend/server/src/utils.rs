use axum::body::Bytes;
use rand::{RngCore, rngs::OsRng};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::AppError;

/// 32 random bytes, 64 hex characters once encoded.
pub const TOKEN_BYTES: usize = 32;

pub fn random_token() -> Result<String, rand::Error> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.try_fill_bytes(&mut bytes)?;

    Ok(hex::encode(bytes))
}

pub fn new_patient_id() -> String {
    Uuid::new_v4().to_string()
}

/// Display label shown on shared screens instead of the full name.
///
/// First letter of every whitespace separated part, uppercased and followed by a period.
pub fn initials(full_name: &str) -> String {
    full_name
        .split_whitespace()
        .filter_map(|part| part.chars().next())
        .map(|letter| format!("{}.", letter.to_uppercase()))
        .collect()
}

/// Log-safe prefix of a token.
pub fn redact(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}

/// Empty bodies fall back to `T::default()`, anything else must be valid JSON.
pub fn parse_optional_json<T>(body: &Bytes) -> Result<T, AppError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }

    serde_json::from_slice(body).map_err(|_| AppError::MalformedPayload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initials_basic() {
        assert_eq!(initials("John Smith"), "J.S.");
        assert_eq!(initials("Alice Young"), "A.Y.");
    }

    #[test]
    fn test_initials_single_name() {
        assert_eq!(initials("Madonna"), "M.");
        assert_eq!(initials("Maria"), "M.");
    }

    #[test]
    fn test_initials_whitespace() {
        assert_eq!(initials(""), "");
        assert_eq!(initials("   "), "");
        assert_eq!(initials("  mary   ann\tlee "), "M.A.L.");
    }

    #[test]
    fn test_initials_unicode() {
        assert_eq!(initials("élodie durand"), "É.D.");
    }

    #[test]
    fn test_random_token_shape() {
        let first = random_token().unwrap();
        let second = random_token().unwrap();

        assert_eq!(first.len(), TOKEN_BYTES * 2);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }

    #[test]
    fn test_redact() {
        assert_eq!(redact("0123456789abcdef"), "01234567");
        assert_eq!(redact("abc"), "abc");
    }

    #[test]
    fn test_parse_optional_json() {
        #[derive(serde::Deserialize, Default, Debug, PartialEq)]
        struct Body {
            room: Option<String>,
        }

        assert_eq!(
            parse_optional_json::<Body>(&Bytes::new()).unwrap(),
            Body::default()
        );
        assert_eq!(
            parse_optional_json::<Body>(&Bytes::from_static(br#"{"room":"12"}"#)).unwrap(),
            Body {
                room: Some("12".to_string())
            }
        );
        assert!(matches!(
            parse_optional_json::<Body>(&Bytes::from_static(b"{not json")),
            Err(AppError::MalformedPayload)
        ));
    }
}
