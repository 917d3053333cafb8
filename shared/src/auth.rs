//! Credential and token utilities.
//!
//! Tokens are opaque random strings. They are not stored anywhere, so
//! [`token_passes_placeholder_check`] can only look at their length: any string
//! of at least [`MIN_TOKEN_LEN`] characters is accepted, whether or not it was
//! ever issued. This is a known weak policy kept for client compatibility.
//!
//! Passwords are written either as salted Argon2id PHC strings or, for
//! compatibility with older credential stores, as unsalted SHA-256 hex digests.
//! Verification understands both formats so stores can migrate in place.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::PasswordScheme;
use crate::{Error, Result};

/// Random bytes per issued token.
const TOKEN_BYTES: usize = 32;

/// Shortest token the placeholder check accepts.
pub const MIN_TOKEN_LEN: usize = 10;

/// Generate a fresh URL-safe opaque token (43 characters).
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Length-only token check. Performs no verification against issued tokens.
pub fn token_passes_placeholder_check(token: &str) -> bool {
    token.chars().count() >= MIN_TOKEN_LEN
}

/// Outcome of checking a password against a stored hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Mismatch,
    Match,
    /// Matched an unsalted legacy digest; the hash should be rewritten.
    MatchLegacy,
}

impl Verification {
    pub fn is_match(self) -> bool {
        !matches!(self, Verification::Mismatch)
    }
}

/// Unsalted single-round SHA-256 hex digest used by older credential stores.
pub fn legacy_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Hash a password for storage using the configured scheme.
pub fn hash_password(password: &str, scheme: PasswordScheme) -> Result<String> {
    match scheme {
        PasswordScheme::LegacySha256 => Ok(legacy_digest(password)),
        PasswordScheme::Argon2id => {
            let salt = SaltString::generate(&mut OsRng);
            Argon2::default()
                .hash_password(password.as_bytes(), &salt)
                .map(|hash| hash.to_string())
                .map_err(|e| Error::Credential(format!("Failed to hash password: {}", e)))
        }
    }
}

/// Verify a password against a stored hash of either format.
pub fn verify_password(password: &str, stored: &str) -> Result<Verification> {
    if stored.starts_with('$') {
        let parsed = PasswordHash::new(stored)
            .map_err(|e| Error::Credential(format!("Invalid password hash: {}", e)))?;
        return match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(Verification::Match),
            Err(argon2::password_hash::Error::Password) => Ok(Verification::Mismatch),
            Err(e) => Err(Error::Credential(format!("Failed to verify password: {}", e))),
        };
    }

    if stored.eq_ignore_ascii_case(&legacy_digest(password)) {
        Ok(Verification::MatchLegacy)
    } else {
        Ok(Verification::Mismatch)
    }
}

/// Whether a successful verification should rewrite the stored hash.
pub fn needs_rehash(verification: Verification, scheme: PasswordScheme) -> bool {
    verification == Verification::MatchLegacy && scheme == PasswordScheme::Argon2id
}
