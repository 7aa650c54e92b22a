//! JSON storable codec.

use super::Storable;
use crate::error::{KeychainError, Result};

pub(super) fn encode(storable: &Storable) -> Result<String> {
    Ok(serde_json::to_string_pretty(storable)?)
}

pub(super) fn decode(text: &str) -> Result<Storable> {
    serde_json::from_str(text).map_err(|e| KeychainError::storable(e.line(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storable::{StorableChain, StorableChainLink};

    #[test]
    fn test_plaintext_json_shape() {
        let storable = Storable {
            private: false,
            chains: vec![StorableChain {
                name: "Work".to_string(),
                description: "Office".to_string(),
                salt: None,
                kdf: None,
                validator: None,
                links: vec![StorableChainLink {
                    name: "Email".to_string(),
                    description: String::new(),
                    password: "pw".to_string(),
                    iv: None,
                }],
            }],
        };

        let text = encode(&storable).unwrap();
        assert!(text.contains("\"private\": false"));
        assert!(!text.contains("salt"));
        assert!(!text.contains("\"iv\""));
        assert_eq!(decode(&text).unwrap(), storable);
    }

    #[test]
    fn test_decode_error_reports_line() {
        let err = decode("{\n  \"private\": true,\n  \"chains\": [\n}").unwrap_err();
        assert!(matches!(err, KeychainError::Storable { line, .. } if line >= 3));
    }
}
