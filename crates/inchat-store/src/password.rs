//! Credentials: password hashing, user names and the password policy.
//!
//! Passwords are hashed with PBKDF2-HMAC-SHA256 (ring) and stored as
//! `pbkdf2$<iterations>$<base64 salt>$<base64 hash>`, so the iteration count
//! can be raised later without invalidating existing accounts.

use std::fmt;
use std::num::NonZeroU32;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Password hashing
// ═══════════════════════════════════════════════════════════════════════

/// PBKDF2 iterations for new hashes (OWASP 2023).
pub const DEFAULT_ITERATIONS: u32 = 600_000;

const SCHEME: &str = "pbkdf2";
const SALT_LEN: usize = 32;
const KEY_LEN: usize = 32;

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

/// A salted password hash in its stored form.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PasswordHash(String);

impl PasswordHash {
    /// Hash `password` with a fresh random salt.
    ///
    /// CPU-heavy at production iteration counts; call from
    /// `spawn_blocking` when on the async runtime.
    pub fn create(password: &str, iterations: u32) -> StoreResult<Self> {
        let iterations = NonZeroU32::new(iterations)
            .ok_or_else(|| StoreError::InvalidArgument("PBKDF2 iterations must be non-zero".into()))?;

        let mut salt = [0u8; SALT_LEN];
        SystemRandom::new()
            .fill(&mut salt)
            .map_err(|_| StoreError::InvalidArgument("failed to generate random salt".into()))?;

        let mut hash = [0u8; KEY_LEN];
        pbkdf2::derive(PBKDF2_ALG, iterations, &salt, password.as_bytes(), &mut hash);

        Ok(Self(format!(
            "{SCHEME}${iterations}${}${}",
            BASE64.encode(salt),
            BASE64.encode(hash)
        )))
    }

    /// Wrap a stored string after checking its shape.
    pub fn from_stored(stored: String) -> StoreResult<Self> {
        Self::parts(&stored)?;
        Ok(Self(stored))
    }

    /// Constant-time comparison of `password` against this hash.
    ///
    /// The empty password never matches.
    pub fn verify(&self, password: &str) -> bool {
        if password.is_empty() {
            return false;
        }
        let Ok((iterations, salt, expected)) = Self::parts(&self.0) else {
            return false;
        };
        pbkdf2::verify(PBKDF2_ALG, iterations, &salt, password.as_bytes(), &expected).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parts(stored: &str) -> StoreResult<(NonZeroU32, Vec<u8>, Vec<u8>)> {
        let malformed = |what: &str| StoreError::Corrupt {
            entity: "password",
            reason: what.to_string(),
        };

        let mut fields = stored.split('$');
        let (Some(scheme), Some(iterations), Some(salt), Some(hash), None) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(malformed("expected four `$`-separated fields"));
        };
        if scheme != SCHEME {
            return Err(malformed(&format!("unknown scheme {scheme:?}")));
        }
        let iterations = iterations
            .parse::<u32>()
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| malformed("invalid iteration count"))?;
        let salt = BASE64
            .decode(salt)
            .map_err(|e| malformed(&format!("invalid salt encoding: {e}")))?;
        let hash = BASE64
            .decode(hash)
            .map_err(|e| malformed(&format!("invalid hash encoding: {e}")))?;
        Ok((iterations, salt, hash))
    }
}

impl fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PasswordHash(..)")
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  User names
// ═══════════════════════════════════════════════════════════════════════

const NAME_MIN: usize = 4;
const NAME_MAX: usize = 40;

/// A validated user name: 4 to 40 characters of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserName(String);

impl UserName {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let len = raw.chars().count();
        if !(NAME_MIN..=NAME_MAX).contains(&len) {
            return Err(format!(
                "user name must be {NAME_MIN} to {NAME_MAX} characters long"
            ));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(format!("user name may not contain {bad:?}"));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserName {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UserName> for String {
    fn from(name: UserName) -> Self {
        name.0
    }
}

impl fmt::Display for UserName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Password policy
// ═══════════════════════════════════════════════════════════════════════

const PASSWORD_MIN: usize = 8;
const PASSWORD_MAX: usize = 64;

/// Check a new password against the policy.
///
/// Rejects passwords outside 8..=64 characters, containing an ascending run
/// of three letters or digits (`abc`, `789`), or repeating one character
/// three times in a row.
pub fn validate_password(password: &str) -> Result<(), String> {
    let chars: Vec<char> = password.chars().collect();
    if !(PASSWORD_MIN..=PASSWORD_MAX).contains(&chars.len()) {
        return Err(format!(
            "password must be {PASSWORD_MIN} to {PASSWORD_MAX} characters long"
        ));
    }

    for w in chars.windows(3) {
        if w[0] == w[1] && w[1] == w[2] {
            return Err(format!("password repeats {:?} three times in a row", w[0]));
        }
        if is_ascending(w[0], w[1], w[2]) {
            return Err(format!(
                "password contains the sequence \"{}{}{}\"",
                w[0], w[1], w[2]
            ));
        }
    }
    Ok(())
}

fn is_ascending(a: char, b: char, c: char) -> bool {
    let same_class = (a.is_ascii_lowercase() && c.is_ascii_lowercase())
        || (a.is_ascii_digit() && c.is_ascii_digit());
    same_class && b as u32 == a as u32 + 1 && c as u32 == b as u32 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: u32 = 1_000;

    #[test]
    fn hash_verifies_only_the_right_password() {
        let hash = PasswordHash::create("correct horse", FAST).unwrap();
        assert!(hash.verify("correct horse"));
        assert!(!hash.verify("correct horsE"));
        assert!(!hash.verify(""));
    }

    #[test]
    fn hash_format_is_self_describing() {
        let hash = PasswordHash::create("pw", FAST).unwrap();
        let fields: Vec<&str> = hash.as_str().split('$').collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0], "pbkdf2");
        assert_eq!(fields[1], "1000");

        let restored = PasswordHash::from_stored(hash.as_str().to_string()).unwrap();
        assert!(restored.verify("pw"));
    }

    #[test]
    fn salts_differ_between_hashes() {
        let a = PasswordHash::create("same", FAST).unwrap();
        let b = PasswordHash::create("same", FAST).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_stored_hashes_are_rejected() {
        for stored in ["", "pbkdf2$10$AAAA", "scrypt$10$AAAA$AAAA", "pbkdf2$0$AAAA$AAAA", "pbkdf2$10$!!$AAAA"] {
            assert!(PasswordHash::from_stored(stored.to_string()).is_err(), "{stored}");
        }
        assert!(PasswordHash::create("pw", 0).is_err());
    }

    #[test]
    fn debug_hides_hash() {
        let hash = PasswordHash::create("pw", FAST).unwrap();
        assert_eq!(format!("{hash:?}"), "PasswordHash(..)");
    }

    #[test]
    fn user_name_rules() {
        assert!(UserName::parse("alice").is_ok());
        assert!(UserName::parse("bob_the-2nd").is_ok());
        assert!(UserName::parse("bob").is_err());
        assert!(UserName::parse(&"x".repeat(41)).is_err());
        assert!(UserName::parse("al ice").is_err());
        assert!(UserName::parse("ålice").is_err());
    }

    #[test]
    fn user_name_deserialization_validates() {
        let ok: UserName = serde_json::from_str("\"alice\"").unwrap();
        assert_eq!(ok.as_str(), "alice");
        assert!(serde_json::from_str::<UserName>("\"a b\"").is_err());
    }

    #[test]
    fn password_policy() {
        assert!(validate_password("Tr0ub4dor&3").is_ok());
        assert!(validate_password("short").is_err());
        assert!(validate_password(&"ab".repeat(40)).is_err());
        assert!(validate_password("xxabcxxq").is_err());
        assert!(validate_password("pass1234word").is_err());
        assert!(validate_password("paaassword").is_err());
        // Two in a row and descending runs are fine.
        assert!(validate_password("paassword").is_ok());
        assert!(validate_password("zyx-9876").is_ok());
    }
}
