use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};

const TOKEN_BYTES: usize = 32;

#[derive(thiserror::Error, Debug)]
#[error("Failed to generate random token")]
pub struct TokenGenerationError;

/// Generates a pass authentication token: 32 random bytes, hex encoded (64 chars)
pub fn generate_auth_token() -> Result<String, TokenGenerationError> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; TOKEN_BYTES];
    rng.fill(&mut bytes).map_err(|_| TokenGenerationError)?;
    Ok(hex::encode(bytes))
}

/// Compares a presented token against the expected one without leaking the position
/// of the first mismatch. Both sides are hashed first so lengths never differ.
pub fn tokens_match(presented: &str, expected: &str) -> bool {
    let a = digest::digest(&digest::SHA256, presented.as_bytes());
    let b = digest::digest(&digest::SHA256, expected.as_bytes());

    a.as_ref()
        .iter()
        .zip(b.as_ref())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_token_format() {
        let token = generate_auth_token().unwrap();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_auth_token().unwrap());
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("abc123", "abc123"));
        assert!(!tokens_match("abc123", "abc124"));
        assert!(!tokens_match("abc", "abc123"));
        assert!(!tokens_match("", "abc"));
    }
}
