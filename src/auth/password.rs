/// Password Hashing and Verification
///
/// bcrypt with a fixed work factor. Strength rules are a request-validation
/// concern and live in `validators`.

use bcrypt::{hash, verify};

use crate::error::{AppError, CryptoError};

/// bcrypt cost used for every new hash
const PASSWORD_HASH_COST: u32 = 14;

/// Hash a password using bcrypt
///
/// # Errors
/// Returns `CryptoError::Hashing` only if bcrypt itself fails
/// (RNG or allocation failure).
pub fn hash_password(password: &str) -> Result<String, AppError> {
    hash(password, PASSWORD_HASH_COST)
        .map_err(|e| AppError::Crypto(CryptoError::Hashing(e.to_string())))
}

/// Verify a password against its hash
///
/// Returns `false` for a wrong password and for a malformed hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    match verify(password, hash) {
        Ok(valid) => valid,
        Err(e) => {
            tracing::warn!(error = %e, "Stored password hash could not be parsed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_password() {
        let password = "secret123";
        let hash = hash_password(password).expect("Failed to hash password");

        assert_ne!(password, hash);
        assert!(hash.starts_with("$2"));
        assert!(hash.contains(&format!("${}$", PASSWORD_HASH_COST)));

        assert!(verify_password(password, &hash));
        assert!(!verify_password("secret124", &hash));
    }

    #[test]
    fn test_hashes_are_salted() {
        // Low cost keeps this test fast; salting does not depend on cost
        let first = bcrypt::hash("secret123", 4).unwrap();
        let second = bcrypt::hash("secret123", 4).unwrap();

        assert_ne!(first, second);
        assert!(verify_password("secret123", &first));
        assert!(verify_password("secret123", &second));
    }

    #[test]
    fn test_malformed_hash_is_rejected() {
        assert!(!verify_password("secret123", "not-a-bcrypt-hash"));
        assert!(!verify_password("secret123", ""));
    }
}
