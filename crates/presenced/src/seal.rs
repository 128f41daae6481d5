//! At-rest sealing of descriptor blobs with AES-256-GCM.
//!
//! Blob layout: `PSD1` marker, 12-byte nonce, ciphertext with 16-byte tag.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

const MARKER: &[u8; 4] = b"PSD1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_FILE_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum SealError {
    #[error("key file {path}: {source}")]
    KeyFile {
        path: String,
        source: std::io::Error,
    },
    #[error("key file {0} is empty")]
    EmptyKey(String),
    #[error("sealed blob is malformed")]
    Malformed,
    #[error("sealing failed")]
    Seal,
    #[error("blob does not open with this key")]
    Open,
}

pub struct Sealer {
    cipher: Aes256Gcm,
}

impl Sealer {
    /// Derive the cipher key as SHA-256 of arbitrary key material.
    pub fn from_key_material(material: &[u8]) -> Self {
        let key = Sha256::digest(material);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Read the key file, generating a fresh random one (mode 0600) if it is missing.
    pub fn load_or_create(path: &Path) -> Result<Self, SealError> {
        let key_err = |source| SealError::KeyFile {
            path: path.display().to_string(),
            source,
        };

        match std::fs::read(path) {
            Ok(material) if material.is_empty() => {
                Err(SealError::EmptyKey(path.display().to_string()))
            }
            Ok(material) => Ok(Self::from_key_material(&material)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(key_err)?;
                }
                let mut material = [0u8; KEY_FILE_LEN];
                rand::thread_rng().fill_bytes(&mut material);

                let mut options = std::fs::OpenOptions::new();
                options.write(true).create_new(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    options.mode(0o600);
                }
                let mut file = options.open(path).map_err(key_err)?;
                file.write_all(&material).map_err(key_err)?;
                tracing::info!(path = %path.display(), "generated new gallery sealing key");
                Ok(Self::from_key_material(&material))
            }
            Err(e) => Err(key_err(e)),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SealError::Seal)?;

        let mut blob = Vec::with_capacity(MARKER.len() + NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(MARKER);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, SealError> {
        if blob.len() < MARKER.len() + NONCE_LEN + TAG_LEN || &blob[..MARKER.len()] != MARKER {
            return Err(SealError::Malformed);
        }
        let (nonce, ciphertext) = blob[MARKER.len()..].split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::Open)
    }
}

/// Little-endian f32 encoding of descriptor values.
pub fn encode_values(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_values(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
