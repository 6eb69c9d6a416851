use std::fs;
use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Keypair, PublicKey};
use rand::rngs::OsRng;

use crate::errors::{ChainError, ChainResult};

/// Environment variable carrying the base64 32-byte data-encryption key.
pub const DEK_ENV: &str = "UNICARE_DEK";

const NONCE_LEN: usize = 12;

// Every Ed25519 identity on disk (node producer key, finalizer key) uses
// the same format: one base64 line encoding the 64-byte keypair.

pub fn read_identity(path: &Path) -> ChainResult<Keypair> {
    let raw = fs::read_to_string(path).map_err(|err| {
        ChainError::Config(format!("unreadable identity file {}: {err}", path.display()))
    })?;
    let bytes = BASE64.decode(raw.trim()).map_err(|_| {
        ChainError::Config(format!("identity file {} is not valid base64", path.display()))
    })?;
    if bytes.len() != ed25519_dalek::KEYPAIR_LENGTH {
        return Err(ChainError::Crypto(format!(
            "identity file {} holds {} bytes, expected a {}-byte Ed25519 keypair",
            path.display(),
            bytes.len(),
            ed25519_dalek::KEYPAIR_LENGTH
        )));
    }
    Keypair::from_bytes(&bytes)
        .map_err(|err| ChainError::Crypto(format!("identity key material rejected: {err}")))
}

/// Key material is written owner-readable only.
pub fn write_identity(path: &Path, keypair: &Keypair) -> ChainResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, BASE64.encode(keypair.to_bytes()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Reads the node identity, minting a fresh one on first start.
pub fn load_or_create_identity(path: &Path) -> ChainResult<Keypair> {
    if path.exists() {
        return read_identity(path);
    }
    let keypair = Keypair::generate(&mut OsRng);
    write_identity(path, &keypair)?;
    Ok(keypair)
}

/// Producer identity as it appears in block headers and peer hellos.
pub fn identity_did(public_key: &PublicKey) -> String {
    format!("ed25519:{}", hex::encode(public_key.to_bytes()))
}

pub fn public_key_from_base64(data: &str) -> ChainResult<PublicKey> {
    let bytes = BASE64
        .decode(data)
        .map_err(|_| ChainError::Crypto("invalid base64 public key".into()))?;
    if bytes.len() != ed25519_dalek::PUBLIC_KEY_LENGTH {
        return Err(ChainError::Crypto("invalid public key length".into()));
    }
    PublicKey::from_bytes(&bytes)
        .map_err(|err| ChainError::Crypto(format!("invalid public key bytes: {err}")))
}

/// AES-256-GCM codec for blocks at rest. A fresh 96-bit nonce is generated
/// per encryption and prepended to the ciphertext.
#[derive(Clone)]
pub struct BlockCipher {
    cipher: Aes256Gcm,
}

impl BlockCipher {
    pub fn new(key: [u8; 32]) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        Self { cipher }
    }

    /// Reads the data-encryption key from the environment. Missing or
    /// malformed keys are startup-fatal for the caller.
    pub fn from_env() -> ChainResult<Self> {
        let encoded = std::env::var(DEK_ENV)
            .map_err(|_| ChainError::Config(format!("{DEK_ENV} not set in environment")))?;
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|err| ChainError::Config(format!("failed to decode {DEK_ENV}: {err}")))?;
        if bytes.len() != 32 {
            return Err(ChainError::Config(format!(
                "{DEK_ENV} must decode to 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self::new(key))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> ChainResult<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|err| ChainError::Crypto(format!("encryption failed: {err}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> ChainResult<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(ChainError::Crypto("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|err| ChainError::Crypto(format!("decryption failed: {err}")))
    }
}
