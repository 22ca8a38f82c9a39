/// Request payload validators
///
/// Run at the HTTP boundary before anything reaches the session protocol.
/// Each validator returns the trimmed value on success.
///
/// 1. Length limits on every field
/// 2. Email format (RFC 5322, simplified)
/// 3. Usernames restricted to a URL- and log-safe alphabet
/// 4. Passwords bounded by what bcrypt actually hashes

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::ValidationError;

const MAX_EMAIL_LENGTH: usize = 254; // RFC 5321
const MIN_EMAIL_LENGTH: usize = 5;
const MAX_NAME_LENGTH: usize = 100;
const MAX_USERNAME_LENGTH: usize = 64;
/// bcrypt ignores everything past 72 bytes
const MAX_PASSWORD_BYTES: usize = 72;

lazy_static! {
    static ref EMAIL_REGEX: Regex = Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$"
    )
    .unwrap();
    static ref USERNAME_REGEX: Regex = Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap();
}

pub fn is_valid_email(email: &str) -> Result<String, ValidationError> {
    let trimmed = email.trim();

    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField("email".to_string()));
    }
    if trimmed.len() < MIN_EMAIL_LENGTH {
        return Err(ValidationError::TooShort("email".to_string(), MIN_EMAIL_LENGTH));
    }
    if trimmed.len() > MAX_EMAIL_LENGTH {
        return Err(ValidationError::TooLong("email".to_string(), MAX_EMAIL_LENGTH));
    }

    // Local part over 64 octets is invalid per RFC 5321
    let local_too_long = trimmed.find('@').map_or(false, |at| at > 64);
    if local_too_long || !EMAIL_REGEX.is_match(trimmed) {
        return Err(ValidationError::InvalidFormat("email".to_string()));
    }

    Ok(trimmed.to_string())
}

/// Display name: any printable text
pub fn is_valid_name(name: &str) -> Result<String, ValidationError> {
    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField("name".to_string()));
    }
    if trimmed.chars().count() > MAX_NAME_LENGTH {
        return Err(ValidationError::TooLong("name".to_string(), MAX_NAME_LENGTH));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(ValidationError::InvalidFormat("name".to_string()));
    }

    Ok(trimmed.to_string())
}

pub fn is_valid_username(username: &str) -> Result<String, ValidationError> {
    let trimmed = username.trim();

    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField("username".to_string()));
    }
    if trimmed.len() > MAX_USERNAME_LENGTH {
        return Err(ValidationError::TooLong("username".to_string(), MAX_USERNAME_LENGTH));
    }
    if !USERNAME_REGEX.is_match(trimmed) {
        return Err(ValidationError::InvalidFormat("username".to_string()));
    }

    Ok(trimmed.to_string())
}

/// Passwords are checked, never trimmed or echoed back
pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    if password.is_empty() {
        return Err(ValidationError::EmptyField("password".to_string()));
    }
    if password.len() > MAX_PASSWORD_BYTES {
        return Err(ValidationError::TooLong("password".to_string(), MAX_PASSWORD_BYTES));
    }

    Ok(())
}
