//! Random secrets for newly created accounts.
//!
//! The backend refuses passwords that lack a digit or a letter, so every
//! generated secret has one of each planted at two distinct random positions.

use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use std::path::Path;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

pub const DIGITS: &[u8] = b"0123456789";
pub const LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
pub const SYMBOLS: &[u8] = b"!@#$%^&*()-_=+";

pub const DEFAULT_SECRET_LENGTH: usize = 16;
pub const MIN_SECRET_LENGTH: usize = 2;

/// Generated secret. Wiped from memory on drop and redacted in `Debug`.
#[derive(Debug, Clone)]
pub struct Secret(SecretString);

impl Secret {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.expose_secret().as_bytes()
    }

    pub fn len(&self) -> usize {
        self.0.expose_secret().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

/// Full alphabet a secret is drawn from.
pub fn alphabet() -> Vec<u8> {
    [DIGITS, LETTERS, SYMBOLS].concat()
}

pub struct SecretGenerator<R = OsRng> {
    rng: R,
    alphabet: Vec<u8>,
}

impl SecretGenerator<OsRng> {
    pub fn new() -> Self {
        Self::with_rng(OsRng)
    }
}

impl Default for SecretGenerator<OsRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RngCore> SecretGenerator<R> {
    pub fn with_rng(rng: R) -> Self {
        Self {
            rng,
            alphabet: alphabet(),
        }
    }

    pub fn generate(&mut self, length: usize) -> Result<Secret> {
        if length < MIN_SECRET_LENGTH {
            return Err(Error::InvalidSecretLength(length));
        }

        // Two trailing bytes pick the positions of the forced digit and letter.
        let mut bytes = Zeroizing::new(vec![0u8; length + 2]);
        self.rng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| Error::Random(e.to_string()))?;

        let digit_selector = bytes[length];
        let letter_selector = bytes[length + 1];

        for byte in bytes.iter_mut().take(length) {
            *byte = self.alphabet[*byte as usize % self.alphabet.len()];
        }

        let digit_pos = digit_selector as usize % length;
        let mut letter_pos = letter_selector as usize % length;
        if digit_pos == letter_pos {
            letter_pos = (letter_pos + 1) % length;
        }

        bytes[digit_pos] = DIGITS[digit_selector as usize % DIGITS.len()];
        bytes[letter_pos] = LETTERS[letter_selector as usize % LETTERS.len()];

        // ASCII only, and exact capacity so boxing the string never reallocates.
        let mut secret = String::with_capacity(length);
        secret.extend(bytes[..length].iter().map(|&b| char::from(b)));
        Ok(Secret(SecretString::from(secret)))
    }
}

/// Generate a secret from the operating system's CSPRNG.
pub fn generate(length: usize) -> Result<Secret> {
    SecretGenerator::new().generate(length)
}

/// Write secret material to `path`, creating missing parent directories.
pub async fn write_secret(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    tokio::fs::write(path, bytes).await?;
    Ok(())
}
