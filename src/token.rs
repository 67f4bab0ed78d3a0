//! Access tokens.
//!
//! A token is the persistent credential issued by the access manager. It
//! travels between people as an access-key string: `vh://` followed by the
//! base64 of the token JSON.

use std::net::SocketAddr;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Accepted access-key prefixes, longest first so `vh://` wins over `vh:`.
const ACCESS_KEY_PREFIXES: &[&str] = &["vhkey://", "vh://", "vhkey:", "vh:"];

/// Persistent credential issued by the access manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Unique token id
    pub token_id: Uuid,
    /// Shared secret, at least 16 bytes
    #[serde(with = "base64_bytes")]
    pub secret: Vec<u8>,
    /// Server host name presented during TLS
    pub host_name: String,
    /// Host endpoints to try, in order
    pub host_endpoints: Vec<SocketAddr>,
    /// Expected certificate fingerprint, if pinned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_hash: Option<String>,
    /// URL the client may poll for a refreshed token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_url: Option<String>,
    /// Protocol version hint
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
}

fn default_protocol_version() -> u32 {
    crate::PROTOCOL_VERSION
}

impl Token {
    /// Encode this token as an access-key string.
    pub fn to_access_key(&self) -> String {
        let json = serde_json::to_vec(self).expect("token serialization is infallible");
        format!("vh://{}", STANDARD.encode(json))
    }

    /// Parse an access-key string.
    ///
    /// Lenient on purpose: surrounding whitespace and quotes are stripped
    /// (keys get mangled by chat apps and shells), and all historic prefixes
    /// are accepted.
    pub fn from_access_key(key: &str) -> Result<Self> {
        let trimmed = key.trim().trim_matches(|c| c == '"' || c == '\'');

        let body = ACCESS_KEY_PREFIXES
            .iter()
            .find_map(|prefix| trimmed.strip_prefix(prefix))
            .ok_or_else(|| Error::invalid("access key must start with vh:// or vhkey://"))?;

        let json = STANDARD
            .decode(body.trim())
            .map_err(|e| Error::invalid(format!("access key base64: {e}")))?;

        let token: Token = serde_json::from_slice(&json)?;
        if token.secret.len() < 16 {
            return Err(Error::invalid("token secret shorter than 16 bytes"));
        }
        if token.host_endpoints.is_empty() {
            return Err(Error::invalid("token carries no host endpoints"));
        }
        Ok(token)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecureRandom;

    fn test_token() -> Token {
        Token {
            token_id: Uuid::new_v4(),
            secret: SecureRandom::bytes::<16>().to_vec(),
            host_name: "gate.example.org".into(),
            host_endpoints: vec!["203.0.113.10:443".parse().unwrap()],
            cert_hash: None,
            refresh_url: Some("https://gate.example.org/refresh".into()),
            protocol_version: crate::PROTOCOL_VERSION,
        }
    }

    #[test]
    fn test_access_key_roundtrip() {
        let token = test_token();
        let key = token.to_access_key();
        assert!(key.starts_with("vh://"));

        let parsed = Token::from_access_key(&key).unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn test_all_prefixes_accepted() {
        let token = test_token();
        let body = token.to_access_key()["vh://".len()..].to_string();

        for prefix in ["vh://", "vhkey://", "vh:", "vhkey:"] {
            let parsed = Token::from_access_key(&format!("{prefix}{body}")).unwrap();
            assert_eq!(parsed, token, "prefix {prefix}");
        }
    }

    #[test]
    fn test_lenient_whitespace_and_quotes() {
        let token = test_token();
        let key = format!("  \"{}\" \n", token.to_access_key());
        assert_eq!(Token::from_access_key(&key).unwrap(), token);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Token::from_access_key("http://not-a-key").is_err());
        assert!(Token::from_access_key("vh://!!!not-base64!!!").is_err());

        // Secret below the floor is rejected even when well-formed.
        let mut token = test_token();
        token.secret = vec![0u8; 8];
        let json = serde_json::to_vec(&token).unwrap();
        let key = format!("vh://{}", STANDARD.encode(json));
        assert!(Token::from_access_key(&key).is_err());
    }
}
