// MNEMO Core - envelope encryption
// AES-256-CBC + PKCS7 over key-manager data keys, with a TTL key cache

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::memory::config::CryptoConfig;
use crate::memory::{MemoryError, MemoryResult};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const KEY_LENGTH: usize = 32;
pub const IV_LENGTH: usize = 16;

/// A data key fresh from the key manager. The plaintext half wipes
/// itself on drop; the wrapped half is safe to persist.
pub struct DataKey {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub wrapped: Vec<u8>,
}

/// Key-manager contract (consumed). Produces data keys wrapped by a
/// master key and unwraps them on request.
#[async_trait]
pub trait KeyManager: Send + Sync {
    async fn generate_data_key(&self, key_id: &str) -> MemoryResult<DataKey>;
    async fn decrypt_data_key(&self, wrapped: &[u8]) -> MemoryResult<Zeroizing<Vec<u8>>>;
    async fn rotate(&self, key_id: &str) -> MemoryResult<()>;
}

/// In-process key manager: master keys are derived per (key id,
/// generation); rotation bumps the generation while old generations
/// keep unwrapping historical keys.
pub struct LocalKeyManager {
    master_secret: Zeroizing<Vec<u8>>,
    generations: Mutex<HashMap<String, u32>>,
}

impl LocalKeyManager {
    pub fn new(master_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            master_secret: Zeroizing::new(master_secret.into()),
            generations: Mutex::new(HashMap::new()),
        }
    }

    fn master_key(&self, key_id: &str, generation: u32) -> Zeroizing<Vec<u8>> {
        let context = format!("mnemo key-manager {key_id} gen {generation}");
        let derived = blake3::derive_key(&context, &self.master_secret);
        Zeroizing::new(derived.to_vec())
    }

    fn current_generation(&self, key_id: &str) -> u32 {
        *self.generations.lock().unwrap().get(key_id).unwrap_or(&0)
    }
}

#[async_trait]
impl KeyManager for LocalKeyManager {
    async fn generate_data_key(&self, key_id: &str) -> MemoryResult<DataKey> {
        let mut plaintext = Zeroizing::new(vec![0u8; KEY_LENGTH]);
        rand::rngs::OsRng.fill_bytes(&mut plaintext);

        let generation = self.current_generation(key_id);
        let master = self.master_key(key_id, generation);
        let mut iv = [0u8; IV_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let key: &[u8; KEY_LENGTH] = master.as_slice().try_into().expect("derived key length");
        let ciphertext = Aes256CbcEnc::new(key.into(), (&iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

        // Wrapped layout: key id length, key id, generation, iv, ciphertext.
        let mut wrapped = Vec::with_capacity(2 + key_id.len() + 4 + IV_LENGTH + ciphertext.len());
        wrapped.extend_from_slice(&(key_id.len() as u16).to_be_bytes());
        wrapped.extend_from_slice(key_id.as_bytes());
        wrapped.extend_from_slice(&generation.to_be_bytes());
        wrapped.extend_from_slice(&iv);
        wrapped.extend_from_slice(&ciphertext);

        Ok(DataKey { plaintext, wrapped })
    }

    async fn decrypt_data_key(&self, wrapped: &[u8]) -> MemoryResult<Zeroizing<Vec<u8>>> {
        let parse = || -> Option<(String, u32, [u8; IV_LENGTH], &[u8])> {
            let id_len = u16::from_be_bytes(wrapped.get(0..2)?.try_into().ok()?) as usize;
            let key_id = std::str::from_utf8(wrapped.get(2..2 + id_len)?).ok()?.to_string();
            let mut offset = 2 + id_len;
            let generation = u32::from_be_bytes(wrapped.get(offset..offset + 4)?.try_into().ok()?);
            offset += 4;
            let iv: [u8; IV_LENGTH] = wrapped.get(offset..offset + IV_LENGTH)?.try_into().ok()?;
            offset += IV_LENGTH;
            Some((key_id, generation, iv, wrapped.get(offset..)?))
        };

        let (key_id, generation, iv, ciphertext) = parse()
            .ok_or_else(|| MemoryError::Storage("malformed wrapped key".into()))?;

        let master = self.master_key(&key_id, generation);
        let key: &[u8; KEY_LENGTH] = master.as_slice().try_into().expect("derived key length");
        let plaintext = Aes256CbcDec::new(key.into(), (&iv).into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| MemoryError::Storage("data key unwrap failed".into()))?;

        Ok(Zeroizing::new(plaintext))
    }

    async fn rotate(&self, key_id: &str) -> MemoryResult<()> {
        let mut generations = self.generations.lock().unwrap();
        let next = generations.get(key_id).unwrap_or(&0) + 1;
        generations.insert(key_id.to_string(), next);
        info!(key_id, generation = next, "master key rotated");
        Ok(())
    }
}

/// Everything a caller needs to store alongside the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    pub ciphertext: Vec<u8>,
    pub wrapped_key: Vec<u8>,
    pub iv: [u8; IV_LENGTH],
}

struct CachedKey {
    plaintext: Zeroizing<Vec<u8>>,
    wrapped: Vec<u8>,
    cached_at: Instant,
}

/// Envelope encryption over the key manager. Data keys are cached for a
/// bounded TTL: the generate path by key id, the unwrap path by the
/// wrapped bytes. Plaintext key material is zeroized on every exit path
/// via `Zeroizing` buffers.
pub struct EnvelopeCrypto {
    config: CryptoConfig,
    key_manager: std::sync::Arc<dyn KeyManager>,
    generate_cache: DashMap<String, CachedKey>,
    unwrap_cache: DashMap<Vec<u8>, CachedKey>,
}

impl EnvelopeCrypto {
    pub fn new(config: CryptoConfig, key_manager: std::sync::Arc<dyn KeyManager>) -> Self {
        Self {
            config,
            key_manager,
            generate_cache: DashMap::new(),
            unwrap_cache: DashMap::new(),
        }
    }

    /// Encrypt with a fresh IV per call. The data key may come from the
    /// TTL cache. Round-trips any plaintext, empty included; rejecting
    /// empty documents is a Store/Update boundary concern.
    pub async fn encrypt(&self, plaintext: &[u8]) -> MemoryResult<EncryptedPayload> {
        let (key, wrapped) = self.data_key().await?;

        let mut iv = [0u8; IV_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let key_array: &[u8; KEY_LENGTH] = key
            .as_slice()
            .try_into()
            .map_err(|_| MemoryError::Storage("data key has wrong length".into()))?;
        let ciphertext = Aes256CbcEnc::new(key_array.into(), (&iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        Ok(EncryptedPayload {
            ciphertext,
            wrapped_key: wrapped,
            iv,
        })
    }

    /// Reverse the transform. The unwrapped key may come from the TTL
    /// cache keyed by the wrapped bytes.
    pub async fn decrypt(&self, payload: &EncryptedPayload) -> MemoryResult<Vec<u8>> {
        let key = self.unwrap_key(&payload.wrapped_key).await?;

        let key_array: &[u8; KEY_LENGTH] = key
            .as_slice()
            .try_into()
            .map_err(|_| MemoryError::Storage("data key has wrong length".into()))?;
        let plaintext = Aes256CbcDec::new(key_array.into(), (&payload.iv).into())
            .decrypt_padded_vec_mut::<Pkcs7>(&payload.ciphertext)
            .map_err(|_| MemoryError::Storage("decryption failed: bad padding".into()))?;

        Ok(plaintext)
    }

    /// Rotate the master key and drop cached data keys for this key id.
    pub async fn rotate(&self) -> MemoryResult<()> {
        self.key_manager.rotate(&self.config.key_id).await?;
        self.generate_cache.remove(&self.config.key_id);
        Ok(())
    }

    async fn data_key(&self) -> MemoryResult<(Zeroizing<Vec<u8>>, Vec<u8>)> {
        if let Some(cached) = self.generate_cache.get(&self.config.key_id) {
            if cached.cached_at.elapsed() < self.config.key_cache_ttl {
                debug!("data key served from cache");
                return Ok((cached.plaintext.clone(), cached.wrapped.clone()));
            }
        }
        self.generate_cache.remove(&self.config.key_id);

        let data_key = self.key_manager.generate_data_key(&self.config.key_id).await?;
        self.generate_cache.insert(
            self.config.key_id.clone(),
            CachedKey {
                plaintext: data_key.plaintext.clone(),
                wrapped: data_key.wrapped.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok((data_key.plaintext, data_key.wrapped))
    }

    async fn unwrap_key(&self, wrapped: &[u8]) -> MemoryResult<Zeroizing<Vec<u8>>> {
        if let Some(cached) = self.unwrap_cache.get(wrapped) {
            if cached.cached_at.elapsed() < self.config.key_cache_ttl {
                return Ok(cached.plaintext.clone());
            }
        }
        self.unwrap_cache.remove(wrapped);

        let plaintext = self.key_manager.decrypt_data_key(wrapped).await?;
        self.unwrap_cache.insert(
            wrapped.to_vec(),
            CachedKey {
                plaintext: plaintext.clone(),
                wrapped: wrapped.to_vec(),
                cached_at: Instant::now(),
            },
        );
        Ok(plaintext)
    }
}
