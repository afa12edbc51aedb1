//! Random identifiers and password hashing.

use argon2::{
  Argon2,
  password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use rand_core::{OsRng, RngCore};

use crate::{Error, Result};

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of generated collection and record ids.
pub const DEFAULT_ID_LENGTH: usize = 15;

/// Length of generated schema field ids.
pub const FIELD_ID_LENGTH: usize = 8;

/// Length of generated auth token keys.
pub const TOKEN_KEY_LENGTH: usize = 50;

/// A random lowercase alphanumeric string of `len` characters.
pub fn random_id(len: usize) -> String {
  // Largest multiple of the alphabet size that fits into a byte; anything
  // above it is rejected to keep the distribution uniform.
  let limit = (u8::MAX as usize / ID_ALPHABET.len()) * ID_ALPHABET.len();
  let mut out = String::with_capacity(len);
  let mut buf = [0u8; 32];
  while out.len() < len {
    OsRng.fill_bytes(&mut buf);
    for b in buf {
      if (b as usize) < limit && out.len() < len {
        out.push(ID_ALPHABET[b as usize % ID_ALPHABET.len()] as char);
      }
    }
  }
  out
}

/// Hash `password` into a PHC string.
pub fn hash_password(password: &str) -> Result<String> {
  let salt = SaltString::generate(&mut OsRng);
  Argon2::default()
    .hash_password(password.as_bytes(), &salt)
    .map(|h| h.to_string())
    .map_err(|e| Error::PasswordHash(e.to_string()))
}

/// Check `password` against a stored PHC hash. Malformed hashes never verify.
pub fn verify_password(password: &str, hash: &str) -> bool {
  let Ok(parsed) = PasswordHash::new(hash) else {
    return false;
  };
  Argon2::default()
    .verify_password(password.as_bytes(), &parsed)
    .is_ok()
}
