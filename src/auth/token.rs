//! Confirmation/Reset Token Protocol
//!
//! Single-use secrets for email confirmation and password resets. Tokens are
//! 32 bytes of OS randomness rendered URL-safe (43 characters). Verification
//! uses rehash-and-compare: the stored token is itself re-salted and hashed
//! at verification time and the candidate is checked against that digest, so
//! verification cost is independent of how much of the candidate matches the
//! true token. A plain string comparison would return early at the first
//! mismatching byte and leak prefix length through timing.
//!
//! Consumption is the caller's job: the lifecycle engine clears token fields
//! with a conditional update keyed on the exact stored value, so a token that
//! verified here can still lose the race to a concurrent consumer.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;

/// Bytes of entropy per token (256 bits)
const TOKEN_ENTROPY_BYTES: usize = 32;

/// Mints a cryptographically random, URL-safe token
pub fn mint() -> String {
    let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// True iff `candidate` matches the stored token, in time independent of
/// where a mismatch occurs
pub fn verify(stored: &str, candidate: &str) -> bool {
    match crate::auth::hash_password(stored) {
        Ok(digest) => crate::auth::verify_password(candidate, &digest),
        Err(err) => {
            log::error!(target: "bastion", "Unable to rehash stored token: {err:?}");
            false
        }
    }
}

/// True if `ttl` has elapsed since `generated_at`
pub fn is_expired(generated_at: DateTime<Utc>, ttl: Duration) -> bool {
    Utc::now().signed_duration_since(generated_at) > ttl
}
