use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Compare a presented token against the session's expected token.
///
/// Comparison happens over SHA-256 digests so the check does not
/// short-circuit on the first differing byte of the raw secrets.
pub fn token_matches(expected: &str, presented: &str) -> bool {
    Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
}

/// Generate a fresh bearer token for a new session.
pub fn generate_token() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_tokens_pass() {
        assert!(token_matches("secret-token", "secret-token"));
    }

    #[test]
    fn non_matching_tokens_fail() {
        assert!(!token_matches("secret-token", "secret-tokeN"));
        assert!(!token_matches("secret-token", ""));
    }

    #[test]
    fn generated_tokens_are_unique_and_valid_session_ids() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert!(hl_protocol::validate_session_id(&a).is_ok());
    }
}
