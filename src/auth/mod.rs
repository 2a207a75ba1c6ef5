//! Credential Codec
//!
//! One-way password hashing and verification. Every hash is an Argon2id PHC
//! string with a fresh random salt, so hashing the same input twice yields
//! different digests. Verification never exposes the stored digest and
//! treats a malformed digest as a plain mismatch.

#![allow(missing_docs)]

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

use crate::misc::AccountError;

/// Configurable password policy rules
pub mod policy;
/// Single-use confirmation/reset token protocol
pub mod token;

/// Hashes a password into an Argon2id PHC string with a random per-hash salt
pub fn hash_password(plain: &str) -> Result<String, AccountError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|err| AccountError::msg(format!("Unable to hash password: {err}")))?;
    Ok(hash.to_string())
}

/// True iff `plain` re-hashes to the stored digest under the stored salt.
/// A malformed stored digest is a verification failure, not an error
pub fn verify_password(plain: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok(),
        Err(err) => {
            log::warn!(target: "bastion", "Stored digest failed to parse: {err}");
            false
        }
    }
}
