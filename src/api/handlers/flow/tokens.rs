//! Client flow tokens.
//!
//! Every flow instance is paired with a bearer token the client must present
//! on each request. Only the hash is kept server-side; the raw value is
//! returned once when the flow opens.

use anyhow::{Context, Result};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

pub(super) struct FlowTokens {
    hashes: Mutex<HashMap<Uuid, Vec<u8>>>,
}

impl FlowTokens {
    pub(super) fn new() -> Self {
        Self {
            hashes: Mutex::new(HashMap::new()),
        }
    }

    /// Mint the token for a fresh flow; the raw value is only returned here.
    pub(super) fn issue(&self, flow_id: Uuid) -> Result<String> {
        let mut bytes = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut bytes)
            .context("failed to generate flow token")?;
        let token = Base64UrlUnpadded::encode_string(&bytes);
        self.lock().insert(flow_id, hash_token(&token));
        Ok(token)
    }

    /// Compare a presented token against the stored hash.
    pub(super) fn verify(&self, flow_id: Uuid, presented: &str) -> bool {
        self.lock()
            .get(&flow_id)
            .is_some_and(|stored| stored == &hash_token(presented))
    }

    pub(super) fn remove(&self, flow_id: Uuid) {
        self.lock().remove(&flow_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Vec<u8>>> {
        self.hashes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Hash a flow token so raw values never sit in memory longer than a request.
fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::FlowTokens;
    use base64ct::{Base64UrlUnpadded, Encoding};
    use uuid::Uuid;

    #[test]
    fn issue_verify_remove_round_trip() {
        let tokens = FlowTokens::new();
        let flow_id = Uuid::new_v4();

        let token = tokens.issue(flow_id).expect("token should issue");
        assert!(tokens.verify(flow_id, &token));
        assert!(!tokens.verify(flow_id, "other"));
        assert!(!tokens.verify(Uuid::new_v4(), &token));

        tokens.remove(flow_id);
        assert!(!tokens.verify(flow_id, &token));
    }

    #[test]
    fn issued_tokens_decode_to_32_bytes() {
        let tokens = FlowTokens::new();
        let token = tokens.issue(Uuid::new_v4()).expect("token should issue");
        let decoded = Base64UrlUnpadded::decode_vec(&token).expect("token is base64url");
        assert_eq!(decoded.len(), 32);
    }
}
