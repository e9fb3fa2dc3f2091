use std::path::Path;

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use alloy::primitives::B256;

use wallet_bg_core::{PasswordGatePort, PortError};

type HmacSha256 = Hmac<Sha256>;

const VERIFY_KEY_INFO: &[u8] = b"verify_key_v1";
const VERIFIER_LABEL: &[u8] = b"wallet-bg-password-v1";
const PBKDF2_ROUNDS: u32 = 600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KdfAlgorithm {
    Argon2idV1,
    Pbkdf2HmacSha256V1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65_536,
            iterations: 3,
        }
    }
}

/// What gets persisted: never the password, only a keyed verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordRecord {
    pub kdf_algorithm: KdfAlgorithm,
    pub params: KdfParams,
    pub salt: [u8; 16],
    pub verifier: B256,
}

/// Checks the wallet password before a keyring signature.
#[derive(Debug, Clone)]
pub struct PasswordGate {
    record: PasswordRecord,
}

impl PasswordGate {
    pub fn create(password: &str, params: KdfParams) -> Result<Self, PortError> {
        if password.is_empty() {
            return Err(PortError::Validation("password must not be empty".to_owned()));
        }
        let salt = generate_salt()?;
        let (root, kdf_algorithm) = derive_root_key(password.as_bytes(), &salt, params);
        let verifier = compute_verifier(&root)?;
        Ok(Self {
            record: PasswordRecord {
                kdf_algorithm,
                params,
                salt,
                verifier,
            },
        })
    }

    pub fn from_record(record: PasswordRecord) -> Self {
        Self { record }
    }

    pub fn record(&self) -> &PasswordRecord {
        &self.record
    }

    pub async fn load(path: &Path) -> Result<Self, PortError> {
        let raw = tokio::fs::read(path)
            .await
            .map_err(|e| PortError::NotFound(format!("{}: {e}", path.display())))?;
        let record: PasswordRecord = serde_json::from_slice(&raw)
            .map_err(|e| PortError::Validation(format!("password record decode failed: {e}")))?;
        Ok(Self::from_record(record))
    }

    pub async fn save(&self, path: &Path) -> Result<(), PortError> {
        let bytes = serde_json::to_vec_pretty(&self.record)
            .map_err(|e| PortError::Validation(format!("password record encode failed: {e}")))?;
        crate::store::write_atomic(path, &bytes).await
    }
}

impl PasswordGatePort for PasswordGate {
    fn verify(&self, password: &str) -> Result<(), PortError> {
        let record = &self.record;
        let root = match record.kdf_algorithm {
            KdfAlgorithm::Argon2idV1 => {
                argon2_root(password.as_bytes(), &record.salt, record.params)
                    .ok_or_else(|| PortError::Validation("argon2id derivation failed".to_owned()))?
            }
            KdfAlgorithm::Pbkdf2HmacSha256V1 => pbkdf2_root(password.as_bytes(), &record.salt),
        };
        let mut mac = verifier_mac(&root)?;
        mac.update(VERIFIER_LABEL);
        mac.verify_slice(record.verifier.as_slice())
            .map_err(|_| PortError::Policy("wrong password".to_owned()))
    }
}

pub fn generate_salt() -> Result<[u8; 16], PortError> {
    let mut salt = [0u8; 16];
    getrandom::getrandom(&mut salt)
        .map_err(|e| PortError::Transport(format!("salt generation failed: {e}")))?;
    Ok(salt)
}

fn compute_verifier(root: &[u8; 32]) -> Result<B256, PortError> {
    let mut mac = verifier_mac(root)?;
    mac.update(VERIFIER_LABEL);
    Ok(B256::from_slice(&mac.finalize().into_bytes()))
}

fn verifier_mac(root: &[u8; 32]) -> Result<HmacSha256, PortError> {
    let hk = Hkdf::<Sha256>::new(None, root);
    let mut verify_key = [0u8; 32];
    hk.expand(VERIFY_KEY_INFO, &mut verify_key)
        .map_err(|_| PortError::Validation("hkdf expand for verify_key_v1 failed".to_owned()))?;
    <HmacSha256 as Mac>::new_from_slice(&verify_key)
        .map_err(|e| PortError::Validation(format!("hmac init failed: {e}")))
}

fn derive_root_key(
    passphrase: &[u8],
    salt: &[u8; 16],
    params: KdfParams,
) -> ([u8; 32], KdfAlgorithm) {
    if let Some(root) = argon2_root(passphrase, salt, params) {
        return (root, KdfAlgorithm::Argon2idV1);
    }
    tracing::warn!("argon2id unavailable, falling back to pbkdf2");
    (pbkdf2_root(passphrase, salt), KdfAlgorithm::Pbkdf2HmacSha256V1)
}

fn argon2_root(passphrase: &[u8], salt: &[u8; 16], params: KdfParams) -> Option<[u8; 32]> {
    let params = Params::new(params.memory_kib, params.iterations, 1, Some(32)).ok()?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut root = [0u8; 32];
    argon.hash_password_into(passphrase, salt, &mut root).ok()?;
    Some(root)
}

fn pbkdf2_root(passphrase: &[u8], salt: &[u8; 16]) -> [u8; 32] {
    let mut root = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase, salt, PBKDF2_ROUNDS, &mut root);
    root
}
