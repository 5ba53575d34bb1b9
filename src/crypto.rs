//! Decryption of event payloads.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

const NONCE_SIZE: usize = 12;
const KEY_LENGTH: usize = 32;

type Result<T> = std::result::Result<T, DecryptionError>;

/// Every way a ciphertext can fail to become plaintext.
#[derive(thiserror::Error, Debug)]
pub enum DecryptionError {
    #[error("ciphertext is not valid hex")]
    Hex(#[from] hex::FromHexError),
    #[error("ciphertext is {value} bytes long while at least {excepted} are excepted")]
    TooShort { value: usize, excepted: usize },
    #[error("authentication failed, wrong key or tampered ciphertext")]
    Aead,
    #[error("decrypted data is not utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("key length is {value} while {excepted} is excepted")]
    KeyLength { value: usize, excepted: usize },
    #[error("key derivation failed: {0}")]
    Derivation(String),
}

/// Turns an opaque ciphertext into plaintext.
///
/// Implementations hold no mutable state and are shared between consumers.
pub trait Decryptor: Send + Sync {
    /// Decrypt `ciphertext` into UTF-8 text.
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// SymmetricKey holds a fixed-size key protected by Zeroizing.
#[derive(Clone)]
pub struct SymmetricKey(Zeroizing<[u8; KEY_LENGTH]>);

impl SymmetricKey {
    /// Create from raw bytes (must be 32 bytes).
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self> {
        let bytes = bytes.as_ref();
        let key: [u8; KEY_LENGTH] =
            bytes.try_into().map_err(|_| DecryptionError::KeyLength {
                value: bytes.len(),
                excepted: KEY_LENGTH,
            })?;

        Ok(Self(Zeroizing::new(key)))
    }

    /// Derive key from a password + salt using Argon2id.
    pub fn derive_from_password(
        password: impl AsRef<[u8]>,
        salt: impl AsRef<[u8]>,
    ) -> Result<Self> {
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);

        Argon2::default()
            .hash_password_into(password.as_ref(), salt.as_ref(), &mut *key)
            .map_err(|err| DecryptionError::Derivation(err.to_string()))?;

        Ok(Self(key))
    }

    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }
}

/// SymmetricCipher provides encrypt/decrypt operations with AES-256-GCM.
///
/// Wire form is hex of `nonce || sealed bytes`.
pub struct SymmetricCipher {
    key: SymmetricKey,
}

impl SymmetricCipher {
    /// Create a new [`SymmetricCipher`].
    pub fn new(key: SymmetricKey) -> Self {
        Self { key }
    }

    /// Encrypt and hex-encode plaintext, as upstream producers do.
    pub fn encrypt_to_hex(&self, plaintext: impl AsRef<[u8]>) -> Result<String> {
        let key = Key::<Aes256Gcm>::from_slice(self.key.as_slice());
        let cipher = Aes256Gcm::new(key);

        // Generate random 96-bit nonce.
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = GenericArray::from_slice(&nonce_bytes);

        let sealed = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| DecryptionError::Aead)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(hex::encode(out))
    }
}

impl Decryptor for SymmetricCipher {
    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let data = hex::decode(ciphertext.trim())?;
        if data.len() < NONCE_SIZE {
            return Err(DecryptionError::TooShort {
                value: data.len(),
                excepted: NONCE_SIZE,
            });
        }

        let (nonce_bytes, sealed) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(self.key.as_slice());
        let cipher = Aes256Gcm::new(key);

        let plain = cipher
            .decrypt(nonce, sealed)
            .map_err(|_| DecryptionError::Aead)?;

        Ok(String::from_utf8(plain)?)
    }
}
