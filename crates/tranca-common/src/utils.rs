//! Utility functions shared across the lock service crates.

use uuid::Uuid;

/// Generate an opaque holder token.
///
/// Tokens are random UUIDs rendered as strings. Callers treat them as
/// opaque; only equality against the stored token ever matters.
pub fn generate_token() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
    }

    #[test]
    fn test_token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), 36);
        assert_eq!(token.chars().filter(|c| *c == '-').count(), 4);
    }
}
