use std::env;
use std::fmt;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::AccountError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;

/// AES-256 key derived from `HELPDESK_CREDENTIALS_KEY`.
#[derive(Clone)]
pub struct CredentialKey([u8; 32]);

impl fmt::Debug for CredentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialKey(..)")
    }
}

impl CredentialKey {
    pub fn from_secret(secret: &str) -> Result<Self, AccountError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(AccountError::MissingKey);
        }
        Ok(Self(Sha256::digest(secret.as_bytes()).into()))
    }

    pub fn from_env() -> Result<Self, AccountError> {
        let secret = env::var("HELPDESK_CREDENTIALS_KEY").map_err(|_| AccountError::MissingKey)?;
        Self::from_secret(&secret)
    }
}

/// Returns base64 of `iv || ciphertext`.
pub fn encrypt_secret(key: &CredentialKey, plaintext: &str) -> String {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let ciphertext = Aes256CbcEnc::new(&key.0.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let mut payload = Vec::with_capacity(IV_LEN + ciphertext.len());
    payload.extend_from_slice(&iv);
    payload.extend_from_slice(&ciphertext);
    STANDARD.encode(payload)
}

pub fn decrypt_secret(key: &CredentialKey, encoded: &str) -> Result<String, AccountError> {
    let payload = STANDARD.decode(encoded.trim())?;
    if payload.len() <= IV_LEN || (payload.len() - IV_LEN) % IV_LEN != 0 {
        return Err(AccountError::Crypto("ciphertext has invalid length".to_string()));
    }
    let (iv, ciphertext) = payload.split_at(IV_LEN);
    let mut iv_block = [0u8; IV_LEN];
    iv_block.copy_from_slice(iv);
    let plaintext = Aes256CbcDec::new(&key.0.into(), &iv_block.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| AccountError::Crypto("wrong key or corrupted ciphertext".to_string()))?;
    String::from_utf8(plaintext)
        .map_err(|_| AccountError::Crypto("decrypted secret is not utf-8".to_string()))
}
