use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::RelayError;

/// Token length in bytes.
pub const TOKEN_LEN: usize = 32;

/// Shared rendezvous secret. Both peers present the same token to the broker.
///
/// `Debug` never prints the bytes. Use [`Token::short`] for log correlation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    /// Draw a fresh token from the operating system's secure random source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Lowercase hex encoding of all 32 bytes.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(input: &str) -> Result<Self, RelayError> {
        let mut bytes = [0u8; TOKEN_LEN];
        hex::decode_to_slice(input.trim(), &mut bytes)
            .map_err(|err| RelayError::Decode(format!("invalid token hex: {err}")))?;
        Ok(Self(bytes))
    }

    /// First 4 bytes as hex, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token(<redacted:{}..>)", self.short())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Token {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; TOKEN_LEN]> for Token {
    fn from(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_differ() {
        assert_ne!(Token::generate(), Token::generate());
    }

    #[test]
    fn hex_round_trip() {
        let token = Token::from_bytes([0xAB; TOKEN_LEN]);
        let text = token.to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(text.parse::<Token>().unwrap(), token);
    }

    #[test]
    fn rejects_wrong_length_hex() {
        assert!(matches!(
            Token::from_hex("abcd"),
            Err(RelayError::Decode(_))
        ));
        assert!(Token::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn debug_is_redacted() {
        let token = Token::from_bytes([0x11; TOKEN_LEN]);
        let debug = format!("{token:?}");
        assert!(debug.contains("redacted"));
        assert!(!debug.contains(&token.to_hex()));
        assert_eq!(token.short(), "11111111");
    }
}
