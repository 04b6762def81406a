use aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use secrecy::{ExposeSecret, Secret};
use thiserror::Error;
use tracing::info;
use zeroize::Zeroize;

use crate::secure_store::{SecureStore, StoreError, StoreKey};

/// Storage key the symmetric key lives under. Written once on first use and
/// read back on every process start so the queue stays decryptable.
const KEY_STORAGE_ID: &str = "handover.crypto.key.v1";

const ENVELOPE_PREFIX_V1: &str = "v1:";
const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;
const MAX_PLAINTEXT: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptFailure {
    MalformedEnvelope,
    UnsupportedVersion { prefix: String },
    AuthenticationFailed,
    PayloadTooLarge,
}

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("key store error: {0}")]
    KeyStore(#[from] StoreError),

    #[error("persisted key material is invalid")]
    InvalidKeyMaterial,

    #[error("randomness unavailable")]
    RandomUnavailable,

    #[error("plaintext too large: {size} > {max}")]
    PlaintextTooLarge { size: usize, max: usize },

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed: {0:?}")]
    DecryptionFailed(DecryptFailure),
}

pub trait RandomProvider: Send + Sync {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError>;
}

pub struct OsRng;

impl RandomProvider for OsRng {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError> {
        getrandom::getrandom(out).map_err(|_| CryptoError::RandomUnavailable)
    }
}

/// Symmetric encryption for queue blobs. The envelope is a string so it can
/// live inside a string-valued secure store: a version prefix selecting the
/// decrypt path, then hex of `nonce || ciphertext || tag`.
pub struct EncryptionService {
    key: Secret<[u8; KEY_SIZE]>,
    rng: Box<dyn RandomProvider>,
}

impl std::fmt::Debug for EncryptionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionService")
            .field("key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl EncryptionService {
    /// Load the device key, generating and persisting one on first use.
    /// Repeated calls (including across process restarts) return a service
    /// holding the same key.
    pub async fn ensure_key(store: &dyn SecureStore) -> Result<Self, CryptoError> {
        Self::ensure_key_with_rng(store, Box::new(OsRng)).await
    }

    pub async fn ensure_key_with_rng(
        store: &dyn SecureStore,
        rng: Box<dyn RandomProvider>,
    ) -> Result<Self, CryptoError> {
        let storage_key = StoreKey::new(KEY_STORAGE_ID)?;

        if let Some(existing) = store.get(&storage_key).await? {
            let mut raw = hex::decode(existing.trim())
                .map_err(|_| CryptoError::InvalidKeyMaterial)?;
            if raw.len() != KEY_SIZE {
                raw.zeroize();
                return Err(CryptoError::InvalidKeyMaterial);
            }
            let mut key = [0u8; KEY_SIZE];
            key.copy_from_slice(&raw);
            raw.zeroize();
            let service = Self {
                key: Secret::new(key),
                rng,
            };
            key.zeroize();
            return Ok(service);
        }

        let mut key = [0u8; KEY_SIZE];
        rng.fill(&mut key)?;
        let encoded = hex::encode(key);
        store.set(&storage_key, &encoded).await?;
        info!("generated new device encryption key");

        let service = Self {
            key: Secret::new(key),
            rng,
        };
        key.zeroize();
        Ok(service)
    }

    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<String, CryptoError> {
        if plaintext.len() > MAX_PLAINTEXT {
            return Err(CryptoError::PlaintextTooLarge {
                size: plaintext.len(),
                max: MAX_PLAINTEXT,
            });
        }

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce_bytes)?;

        let cipher = XChaCha20Poly1305::new(Key::from_slice(self.key.expose_secret()));
        let sealed = cipher
            .encrypt(
                XNonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut body = Vec::with_capacity(NONCE_SIZE + sealed.len());
        body.extend_from_slice(&nonce_bytes);
        body.extend_from_slice(&sealed);

        Ok(format!("{ENVELOPE_PREFIX_V1}{}", hex::encode(body)))
    }

    pub fn decrypt(&self, envelope: &str, aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let hex_body = match envelope.strip_prefix(ENVELOPE_PREFIX_V1) {
            Some(body) => body,
            None => {
                let prefix: String = envelope.chars().take(8).collect();
                if envelope.contains(':') {
                    return Err(CryptoError::DecryptionFailed(
                        DecryptFailure::UnsupportedVersion { prefix },
                    ));
                }
                return Err(CryptoError::DecryptionFailed(
                    DecryptFailure::MalformedEnvelope,
                ));
            }
        };

        let body = hex::decode(hex_body).map_err(|_| {
            CryptoError::DecryptionFailed(DecryptFailure::MalformedEnvelope)
        })?;

        if body.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed(
                DecryptFailure::MalformedEnvelope,
            ));
        }
        if body.len() > NONCE_SIZE + TAG_SIZE + MAX_PLAINTEXT {
            return Err(CryptoError::DecryptionFailed(
                DecryptFailure::PayloadTooLarge,
            ));
        }

        let (nonce_bytes, sealed) = body.split_at(NONCE_SIZE);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(self.key.expose_secret()));

        cipher
            .decrypt(XNonce::from_slice(nonce_bytes), Payload { msg: sealed, aad })
            .map_err(|_| CryptoError::DecryptionFailed(DecryptFailure::AuthenticationFailed))
    }
}

/// AAD binding an envelope to the store it was written for, so a blob copied
/// between storage keys fails authentication instead of decrypting.
pub fn build_aad(store_name: &str) -> Vec<u8> {
    format!("handover-sync:v1:{store_name}").into_bytes()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Deterministic RNG for reproducible envelopes in tests.
    pub struct SequentialRng {
        counter: AtomicU64,
    }

    impl SequentialRng {
        pub fn new() -> Self {
            Self {
                counter: AtomicU64::new(1),
            }
        }
    }

    impl RandomProvider for SequentialRng {
        fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError> {
            let val = self.counter.fetch_add(1, Ordering::SeqCst);
            for (i, byte) in out.iter_mut().enumerate() {
                *byte = ((val >> ((i % 8) * 8)) ^ (i as u64)) as u8;
            }
            Ok(())
        }
    }
}
