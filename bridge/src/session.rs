use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use serde_json::Value;
use sha3::{Digest, Keccak256};
use zeroize::Zeroizing;

use crate::dispatcher::KeyManager;
use crate::errors::{BridgeError, BridgeResult};

/// Default duration before an unlocked wallet automatically locks.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug)]
struct UnlockedSession {
    signing_key: SigningKey,
    address: String,
    expires_at: Instant,
}

impl UnlockedSession {
    fn new(signing_key: SigningKey, timeout: Duration) -> Self {
        let address = address_for(&signing_key.verifying_key());
        Self {
            signing_key,
            address,
            expires_at: Instant::now() + timeout,
        }
    }

    fn touch(&mut self, timeout: Duration) {
        self.expires_at = Instant::now() + timeout;
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct SessionState {
    unlocked: Option<UnlockedSession>,
}

/// Holds the active key in memory and locks it automatically after inactivity.
#[derive(Debug, Clone)]
pub struct SessionManager {
    state: Arc<RwLock<SessionState>>,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(SessionState::default())),
            timeout,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }

    pub fn is_locked(&self) -> bool {
        let state = self.state.read();
        state.unlocked.is_none()
    }

    /// Unlock the session with a 32-byte ed25519 seed.
    pub fn unlock(&self, seed: &Zeroizing<[u8; 32]>) {
        let signing_key = SigningKey::from_bytes(seed);
        let mut state = self.state.write();
        state.unlocked = Some(UnlockedSession::new(signing_key, self.timeout));
        log::info!("wallet session unlocked");
    }

    /// Explicitly lock the session, dropping the key.
    pub fn lock(&self) {
        let mut state = self.state.write();
        if state.unlocked.take().is_some() {
            log::info!("wallet session locked");
        }
    }

    /// Access the unlocked key while refreshing the timeout.
    pub fn with_unlocked<F, T>(&self, operation: F) -> BridgeResult<T>
    where
        F: FnOnce(&SigningKey, &str) -> BridgeResult<T>,
    {
        let mut state = self.state.write();
        let session = state
            .unlocked
            .as_mut()
            .ok_or_else(|| BridgeError::Unauthorized("Wallet is locked".to_string()))?;

        if session.is_expired() {
            state.unlocked = None;
            return Err(BridgeError::Unauthorized(
                "Wallet session expired".to_string(),
            ));
        }

        session.touch(self.timeout);
        operation(&session.signing_key, &session.address)
    }

    fn sign_digest(&self, address: &str, digest: [u8; 32]) -> BridgeResult<String> {
        self.with_unlocked(|key, active| {
            if !active.eq_ignore_ascii_case(address) {
                return Err(BridgeError::Unauthorized(format!(
                    "Address {} is not managed by this wallet",
                    address
                )));
            }
            let signature = key.sign(&digest);
            Ok(format!("0x{}", hex::encode(signature.to_bytes())))
        })
    }
}

impl KeyManager for SessionManager {
    fn accounts(&self) -> BridgeResult<Vec<String>> {
        self.with_unlocked(|_, address| Ok(vec![address.to_string()]))
    }

    fn sign_message(&self, address: &str, message: &[u8]) -> BridgeResult<String> {
        self.sign_digest(address, personal_message_digest(message))
    }

    fn sign_typed_data(&self, address: &str, typed_data: &Value) -> BridgeResult<String> {
        self.sign_digest(address, typed_data_digest(typed_data)?)
    }

    fn lock(&self) {
        SessionManager::lock(self)
    }
}

/// `0x`-prefixed address: last 20 bytes of keccak-256 over the public key.
pub fn address_for(key: &VerifyingKey) -> String {
    let hash = Keccak256::digest(key.as_bytes());
    format!("0x{}", hex::encode(&hash[12..]))
}

/// EIP-191 personal message digest.
pub fn personal_message_digest(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Digest over the canonical JSON encoding of typed data, domain-separated with `0x1901`.
pub fn typed_data_digest(typed_data: &Value) -> BridgeResult<[u8; 32]> {
    if !typed_data.is_object() {
        return Err(BridgeError::InvalidParams(
            "typed data must be a JSON object".to_string(),
        ));
    }
    let encoded = serde_json::to_vec(typed_data)?;
    let mut hasher = Keccak256::new();
    hasher.update([0x19, 0x01]);
    hasher.update(Keccak256::digest(&encoded));
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};

    fn seed() -> Zeroizing<[u8; 32]> {
        Zeroizing::new([7u8; 32])
    }

    #[test]
    fn unlock_and_lock_cycle() {
        let manager = SessionManager::with_defaults();
        assert!(manager.is_locked());
        assert!(matches!(
            manager.accounts(),
            Err(BridgeError::Unauthorized(_))
        ));

        manager.unlock(&seed());
        assert!(!manager.is_locked());
        let accounts = manager.accounts().unwrap();
        assert_eq!(accounts.len(), 1);
        assert!(accounts[0].starts_with("0x"));
        assert_eq!(accounts[0].len(), 42);

        manager.lock();
        assert!(manager.is_locked());
    }

    #[test]
    fn timeout_enforced() {
        let manager = SessionManager::new(Duration::from_millis(10));
        manager.unlock(&seed());
        std::thread::sleep(Duration::from_millis(30));
        assert!(manager.accounts().is_err());
        assert!(manager.is_locked());
    }

    #[test]
    fn personal_sign_verifies_against_the_session_key() {
        let manager = SessionManager::with_defaults();
        manager.unlock(&seed());
        let address = manager.accounts().unwrap().remove(0);

        let signature = manager.sign_message(&address, b"hello").unwrap();
        let bytes = hex::decode(signature.trim_start_matches("0x")).unwrap();
        let signature = Signature::from_slice(&bytes).unwrap();

        let verifying = SigningKey::from_bytes(&seed()).verifying_key();
        verifying
            .verify(&personal_message_digest(b"hello"), &signature)
            .unwrap();
    }

    #[test]
    fn foreign_address_is_refused() {
        let manager = SessionManager::with_defaults();
        manager.unlock(&seed());
        let err = manager
            .sign_message("0x0000000000000000000000000000000000000001", b"hi")
            .unwrap_err();
        assert!(matches!(err, BridgeError::Unauthorized(_)));
    }

    #[test]
    fn typed_data_must_be_an_object() {
        assert!(typed_data_digest(&serde_json::json!("nope")).is_err());
        assert!(typed_data_digest(&serde_json::json!({ "primaryType": "Mail" })).is_ok());
    }
}
