/// Authentication primitives
///
/// Password hashing, secret encryption, keyed token fingerprints and JWT
/// issuance/verification. None of these touch storage.

mod cipher;
mod claims;
mod fingerprint;
mod jwt;
mod password;

pub use cipher::SecretCipher;
pub use claims::{AccessClaims, RefreshClaims, TokenClaims, TokenKind};
pub use fingerprint::fingerprint;
pub use jwt::TokenIssuer;
pub use password::{hash_password, verify_password};
