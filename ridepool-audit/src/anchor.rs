use hmac::{Hmac, Mac};
use ridepool_core::audit::{AuditDraft, AuditError, ChainSealer};
use ridepool_shared::Masked;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::canonical;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_KEY_VERSION: &str = "kv1";

/// Seals entries with SHA-256 and folds them into daily HMAC-SHA256 anchors.
#[derive(Debug, Clone)]
pub struct HmacSealer {
    secret: Masked<Vec<u8>>,
    key_version: String,
}

impl HmacSealer {
    pub fn new(secret: impl Into<Vec<u8>>, key_version: impl Into<String>) -> Result<Self, AuditError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(AuditError::Key("anchor secret is empty".to_string()));
        }
        Ok(Self {
            secret: Masked(secret),
            key_version: key_version.into(),
        })
    }
}

impl ChainSealer for HmacSealer {
    fn key_version(&self) -> &str {
        &self.key_version
    }

    fn seal(&self, draft: &AuditDraft, prev_hash: Option<&str>) -> Result<String, AuditError> {
        canonical::entry_hash(draft, prev_hash)
    }

    /// `HMAC(secret, running ++ hash)` over the hex strings.
    fn fold(&self, running: &str, hash: &str) -> Result<String, AuditError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose())
            .map_err(|e| AuditError::Key(format!("invalid anchor secret: {e}")))?;
        mac.update(running.as_bytes());
        mac.update(hash.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Constant-time comparison of two hex digests.
pub fn anchors_match(stored: &str, computed: &str) -> bool {
    let (Ok(expected), Ok(actual)) = (hex::decode(stored), hex::decode(computed)) else {
        return false;
    };
    if expected.len() != actual.len() {
        return false;
    }
    expected.ct_eq(actual.as_slice()).into()
}
