//! Random usernames, passwords and name suffixes.
//!
//! A single [`SecretGenerator`] is created at startup and shared by everything that needs
//! randomness. It is seeded once from the operating system and never reseeded.

use std::sync::{Mutex, PoisonError};

use rand::{Rng, SeedableRng, rngs::StdRng};

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

pub const USERNAME_LENGTH: usize = 8;
pub const PASSWORD_LENGTH: usize = 12;

#[derive(Debug)]
pub struct SecretGenerator {
    rng: Mutex<StdRng>,
}

impl SecretGenerator {
    pub fn from_os_rng() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// A deterministic generator, only meant for tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn username(&self) -> String {
        self.lowercase(USERNAME_LENGTH)
    }

    pub fn password(&self) -> String {
        self.lowercase(PASSWORD_LENGTH)
    }

    /// Returns `len` characters drawn from the lowercase ASCII alphabet.
    pub fn lowercase(&self, len: usize) -> String {
        // The RNG state stays valid even if another thread panicked while holding the lock.
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        (0..len)
            .map(|_| char::from(ALPHABET[rng.random_range(0..ALPHABET.len())]))
            .collect()
    }
}

impl Default for SecretGenerator {
    fn default() -> Self {
        Self::from_os_rng()
    }
}
