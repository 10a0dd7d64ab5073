//! Coffer Crypto - secret storage primitives for the auth core.
//!
//! Provides:
//! - AES-256-GCM authenticated encryption for per-device TOTP secrets at rest
//! - Argon2id password hashing and constant-time verification
//! - Challenge secret generation (short human-entered codes)
//! - TOTP enrollment and validation (see [`totp`])
//!
//! Every encryption call uses a fresh random nonce, so the same plaintext
//! never produces the same ciphertext twice. Decryption failures collapse to
//! a single opaque error so callers cannot distinguish a wrong key from a
//! tampered blob.

#![forbid(unsafe_code)]

pub mod totp;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{
    password_hash::{PasswordHash, SaltString},
    Algorithm, Argon2, Params, PasswordHasher, PasswordVerifier, Version,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{rngs::OsRng, Rng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Required key length for the vault (AES-256).
pub const KEY_LEN: usize = 32;

/// GCM standard nonce length.
const NONCE_LEN: usize = 12;

/// Length of a generated challenge secret.
pub const CHALLENGE_SECRET_LEN: usize = 6;

/// Alphabet for challenge secrets (uppercase alphanumeric, 36 symbols).
const CHALLENGE_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Error types for vault operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// Encryption key is not exactly 32 bytes
    InvalidKey,
    /// Ciphertext could not be decrypted (bad encoding, wrong key, or tampered data)
    Undecipherable,
    /// Password hashing failed
    Hashing(String),
}

impl std::fmt::Display for VaultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "encryption key must be exactly {} bytes", KEY_LEN),
            Self::Undecipherable => write!(f, "ciphertext could not be decrypted"),
            Self::Hashing(msg) => write!(f, "password hashing failed: {}", msg),
        }
    }
}

impl std::error::Error for VaultError {}

/// Result type for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Vault for secrets at rest, keyed by the process-wide MFA encryption key.
///
/// Output format is `base64(nonce || ciphertext || tag)`. The key is wiped
/// from memory on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretVault {
    key: [u8; KEY_LEN],
}

impl SecretVault {
    /// Create a vault from the configured key. Any length other than
    /// 32 bytes is rejected.
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = key.try_into().map_err(|_| VaultError::InvalidKey)?;
        Ok(Self { key })
    }

    /// Encrypt a plaintext secret with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| VaultError::InvalidKey)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Undecipherable)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Decrypt an opaque string produced by [`encrypt`](Self::encrypt).
    ///
    /// All failure modes (invalid base64, truncated input, wrong key,
    /// tampered tag) collapse to [`VaultError::Undecipherable`].
    pub fn decrypt(&self, opaque: &str) -> Result<String> {
        let raw = BASE64
            .decode(opaque)
            .map_err(|_| VaultError::Undecipherable)?;
        if raw.len() <= NONCE_LEN {
            return Err(VaultError::Undecipherable);
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key).map_err(|_| VaultError::InvalidKey)?;
        let nonce = Nonce::from_slice(&raw[..NONCE_LEN]);

        let plaintext = cipher
            .decrypt(nonce, &raw[NONCE_LEN..])
            .map_err(|_| VaultError::Undecipherable)?;

        String::from_utf8(plaintext).map_err(|_| VaultError::Undecipherable)
    }
}

impl std::fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretVault")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

fn argon2_instance() -> Result<Argon2<'static>> {
    // 64 MiB memory, 3 passes, 2 lanes, 32-byte output
    let params =
        Params::new(64 * 1024, 3, 2, Some(32)).map_err(|e| VaultError::Hashing(e.to_string()))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash a password with Argon2id and a fresh 32-byte salt.
///
/// Returns the PHC string encoding, which embeds the salt and parameters.
pub fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut salt_bytes);
    let salt =
        SaltString::encode_b64(&salt_bytes).map_err(|e| VaultError::Hashing(e.to_string()))?;

    let hash = argon2_instance()?
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| VaultError::Hashing(e.to_string()))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored PHC hash string. Constant-time.
///
/// A malformed hash verifies as `false` rather than erroring, so callers
/// cannot distinguish a missing hash from a wrong password.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Generate a challenge secret: six characters drawn uniformly from `0-9A-Z`
/// using the OS CSPRNG.
pub fn generate_challenge_secret() -> String {
    let mut rng = OsRng;
    (0..CHALLENGE_SECRET_LEN)
        .map(|_| CHALLENGE_ALPHABET[rng.gen_range(0..CHALLENGE_ALPHABET.len())] as char)
        .collect()
}
