use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const ENVELOPE_PREFIX: &str = "enc:v1:";

/// Generate a random tracking token (32 bytes → 64 hex chars).
pub fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time string comparison.
pub fn constant_time_eq(provided: &str, expected: &str) -> bool {
    let a = provided.as_bytes();
    let b = expected.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

fn compute_session_mac(secret: &str, token: &str) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(b"phish_session:");
    mac.update(token.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Cookie value carrying a tracking token: `token.hmac`.
pub fn sign_session_token(secret: &str, token: &str) -> String {
    format!("{token}.{}", compute_session_mac(secret, token))
}

/// Returns the token if the cookie value was produced by `sign_session_token`.
pub fn verify_session_token(secret: &str, value: &str) -> Option<String> {
    let (token, mac) = value.rsplit_once('.')?;
    if token.is_empty() {
        return None;
    }
    let expected = compute_session_mac(secret, token);
    constant_time_eq(mac, &expected).then(|| token.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Failed to encrypt payload: {0}")]
    Encrypt(String),

    #[error("Failed to decrypt payload: {0}")]
    Decrypt(String),

    #[error("Malformed encrypted envelope")]
    Envelope,

    #[error("Payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Seals captured form data at rest.
///
/// Ciphertext is stored as `enc:v1:<nonce>:<ciphertext>` with both parts in
/// URL-safe base64 without padding.
#[derive(Clone)]
pub struct SubmissionCipher {
    key: [u8; 32],
}

impl SubmissionCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    fn aead(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(&self.key.into())
    }

    pub fn encrypt_json(&self, value: &serde_json::Value) -> Result<String, CryptoError> {
        let plaintext = serde_json::to_vec(value)?;

        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .aead()
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        Ok(format!(
            "{ENVELOPE_PREFIX}{}:{}",
            URL_SAFE_NO_PAD.encode(nonce_bytes),
            URL_SAFE_NO_PAD.encode(ciphertext)
        ))
    }

    pub fn decrypt_json(&self, stored: &str) -> Result<serde_json::Value, CryptoError> {
        let body = stored
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or(CryptoError::Envelope)?;
        let (nonce_b64, ciphertext_b64) = body.split_once(':').ok_or(CryptoError::Envelope)?;

        let nonce_raw = URL_SAFE_NO_PAD
            .decode(nonce_b64)
            .map_err(|_| CryptoError::Envelope)?;
        if nonce_raw.len() != 12 {
            return Err(CryptoError::Envelope);
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(ciphertext_b64)
            .map_err(|_| CryptoError::Envelope)?;

        let plaintext = self
            .aead()
            .decrypt(Nonce::from_slice(&nonce_raw), ciphertext.as_slice())
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;

        Ok(serde_json::from_slice(&plaintext)?)
    }
}
