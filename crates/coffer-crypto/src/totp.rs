//! Time-based one-time password engine (RFC 6238 over RFC 4226 HOTP).
//!
//! Enrollment secrets are 20 random bytes, base32-encoded without padding.
//! Validation accepts the current 30-second window with one step of tolerance
//! on either side, and rejects anything that is not exactly six ASCII digits
//! before the secret is even decoded.

use base32::Alphabet;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

/// Code length in digits.
pub const CODE_DIGITS: usize = 6;

/// TOTP time step in seconds.
pub const PERIOD_SECS: u64 = 30;

/// Raw secret length in bytes (160 bits).
const SECRET_LEN: usize = 20;

/// A fresh TOTP enrollment: the base32 secret and the otpauth URI an
/// authenticator app consumes (usually rendered as a QR code).
#[derive(Debug, Clone)]
pub struct Enrollment {
    /// Base32-encoded secret (no padding)
    pub secret: String,
    /// `otpauth://totp/...` provisioning URI
    pub provisioning_uri: String,
}

/// Generate a new enrollment for an account.
pub fn generate_enrollment(issuer: &str, account: &str) -> Enrollment {
    let mut bytes = [0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut bytes);
    let secret = base32::encode(Alphabet::RFC4648 { padding: false }, &bytes);

    let provisioning_uri = format!(
        "otpauth://totp/{}:{}?secret={}&issuer={}",
        urlencoding::encode(issuer),
        urlencoding::encode(account),
        secret,
        urlencoding::encode(issuer),
    );

    Enrollment {
        secret,
        provisioning_uri,
    }
}

/// Validate a submitted code against a base32 secret at the current time.
pub fn validate(secret_base32: &str, code: &str) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    validate_at(secret_base32, code, now)
}

/// Validate a submitted code at an explicit unix timestamp.
///
/// Accepts the window containing `unix_secs` plus one step on either side.
/// Input that is not exactly six ASCII decimal digits is rejected without
/// decoding the secret.
pub fn validate_at(secret_base32: &str, code: &str, unix_secs: u64) -> bool {
    if code.len() != CODE_DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }

    let Some(key) = base32::decode(Alphabet::RFC4648 { padding: false }, secret_base32) else {
        return false;
    };

    let counter = unix_secs / PERIOD_SECS;
    for offset in [-1i64, 0, 1] {
        let Some(step) = counter.checked_add_signed(offset) else {
            continue;
        };
        if hotp(&key, step) == code {
            return true;
        }
    }
    false
}

/// Compute the code for a secret at a given unix timestamp.
///
/// This is the authenticator-app side of the protocol; the server uses it in
/// tests and enrollment demos. Returns `None` if the secret is not valid
/// base32.
pub fn code_at(secret_base32: &str, unix_secs: u64) -> Option<String> {
    let key = base32::decode(Alphabet::RFC4648 { padding: false }, secret_base32)?;
    Some(hotp(&key, unix_secs / PERIOD_SECS))
}

/// RFC 4226 HOTP: HMAC-SHA1 over the big-endian counter, dynamic truncation,
/// six decimal digits with leading zeros.
fn hotp(key: &[u8], counter: u64) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&counter.to_be_bytes());
    let hash = mac.finalize().into_bytes();

    let offset = (hash[hash.len() - 1] & 0x0f) as usize;
    let binary = ((hash[offset] & 0x7f) as u32) << 24
        | (hash[offset + 1] as u32) << 16
        | (hash[offset + 2] as u32) << 8
        | hash[offset + 3] as u32;

    format!("{:06}", binary % 1_000_000)
}
