use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generate a fresh agent token.
pub fn generate_token() -> String {
    Uuid::new_v4().to_string()
}

/// Hash a token for at-rest storage using SHA-256.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Verify a presented token against a stored hash.
pub fn verify_token(token: &str, hash: &str) -> bool {
    hash_token(token) == hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_stable_and_opaque() {
        let token = "agent_token";
        let hash1 = hash_token(token);
        let hash2 = hash_token(token);

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, token);
    }

    #[test]
    fn verification() {
        let token = generate_token();
        let hash = hash_token(&token);

        assert!(verify_token(&token, &hash));
        assert!(!verify_token("something-else", &hash));
    }
}
