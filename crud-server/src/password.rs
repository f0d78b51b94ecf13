//! Password hashing (bcrypt) and strength heuristics.
//! The hashing functions are synchronous; `auth::JwtAuthService` runs them on the blocking pool.

use rand::Rng;
use serde::Serialize;

use crate::models::AppError;

/// Cost used when no explicit round count is configured.
pub const DEFAULT_ROUNDS: u32 = 10;

const SALT_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

const COMMON_PASSWORDS: [&str; 5] = ["password", "qwerty", "123456", "12345678", "abc123"];

pub fn hash_password(password: &str, rounds: u32) -> Result<String, AppError> {
    if password.is_empty() {
        return Err(AppError::Validation("Password cannot be empty".into()));
    }
    Ok(bcrypt::hash(password, rounds)?)
}

/// Compares `password` against a stored bcrypt hash.
pub fn compare_password(password: &str, hash: &str) -> Result<bool, AppError> {
    if hash.is_empty() {
        return Err(AppError::Bcrypt("Hash is required".into()));
    }
    if !is_bcrypt_hash(hash) {
        return Err(AppError::Bcrypt("Invalid hash format".into()));
    }
    bcrypt::verify(password, hash).map_err(|_| AppError::Bcrypt("Invalid hash format".into()))
}

/// `$2a$`, `$2b$` and `$2y$` prefixes are accepted.
pub fn is_bcrypt_hash(hash: &str) -> bool {
    let bytes = hash.as_bytes();
    bytes.len() > 4 && hash.starts_with("$2") && matches!(bytes[2], b'a' | b'b' | b'y') && bytes[3] == b'$'
}

/// Random salt drawn from the base64 alphabet.
pub fn generate_salt(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| SALT_ALPHABET[rng.gen_range(0..SALT_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Strength {
    Weak,
    Medium,
    Strong,
    VeryStrong,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StrengthReport {
    pub strength: Strength,
    pub is_strong: bool,
    pub is_common: bool,
    pub warnings: Vec<String>,
}

pub fn validate_password_strength(password: &str) -> StrengthReport {
    let is_common = COMMON_PASSWORDS.contains(&password.to_lowercase().as_str());
    let length = password.chars().count();

    let checks = [
        length >= 8,
        length >= 16,
        password.chars().any(|c| c.is_ascii_lowercase()),
        password.chars().any(|c| c.is_ascii_uppercase()),
        password.chars().any(|c| c.is_ascii_digit()),
        password.chars().any(|c| !c.is_ascii_alphanumeric()),
    ];
    let score = checks.iter().filter(|&&passed| passed).count();

    let strength = match score {
        s if s >= 6 => Strength::VeryStrong,
        5 => Strength::Strong,
        3 | 4 => Strength::Medium,
        _ => Strength::Weak,
    };

    let mut warnings = Vec::new();
    if is_common {
        warnings.push("This is a commonly used password".to_string());
    }

    StrengthReport { strength, is_strong: score >= 3, is_common, warnings }
}

/// Policy applied on registration and password change.
pub fn enforce_password_policy(password: &str) -> Result<(), AppError> {
    if password.chars().count() < 8 {
        return Err(AppError::Validation("Password must be at least 8 characters".into()));
    }
    let report = validate_password_strength(password);
    if report.is_common {
        return Err(AppError::ValidationList {
            message: "Password is too common".into(),
            errors: report.warnings,
        });
    }
    if !report.is_strong {
        return Err(AppError::Validation(
            "Password is too weak: mix letters, numbers and symbols".into(),
        ));
    }
    Ok(())
}
