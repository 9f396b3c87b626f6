use argon2::password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("invalid hashing parameters: {0}")]
    Params(String),
    #[error("passphrase hashing failed: {0}")]
    Hash(String),
    #[error("stored passphrase hash is malformed: {0}")]
    MalformedHash(String),
    #[error("hashing task aborted: {0}")]
    Task(String),
}

/// Argon2id cost settings. Verification reads the cost back out of the
/// stored PHC string, so changing these only affects new transfers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashingParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashingParams {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PassphraseHasher {
    params: Params,
}

impl PassphraseHasher {
    pub fn new(settings: HashingParams) -> Result<Self, HashError> {
        let params = Params::new(
            settings.memory_kib,
            settings.iterations,
            settings.parallelism,
            None,
        )
        .map_err(|e| HashError::Params(e.to_string()))?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    pub fn hash(&self, passphrase: &str) -> Result<String, HashError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()
            .hash_password(passphrase.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| HashError::Hash(e.to_string()))
    }

    /// `Ok(false)` is a wrong passphrase; `Err` means the check itself
    /// could not run and must not be treated as a failed attempt.
    pub fn verify(&self, passphrase: &str, stored: &str) -> Result<bool, HashError> {
        let parsed = PasswordHash::new(stored).map_err(|e| HashError::MalformedHash(e.to_string()))?;
        match self.argon2().verify_password(passphrase.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(HashError::Hash(e.to_string())),
        }
    }

    pub async fn hash_blocking(&self, passphrase: String) -> Result<String, HashError> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.hash(&passphrase))
            .await
            .map_err(|e| HashError::Task(e.to_string()))?
    }

    pub async fn verify_blocking(&self, passphrase: String, stored: String) -> Result<bool, HashError> {
        let hasher = self.clone();
        tokio::task::spawn_blocking(move || hasher.verify(&passphrase, &stored))
            .await
            .map_err(|e| HashError::Task(e.to_string()))?
    }
}
