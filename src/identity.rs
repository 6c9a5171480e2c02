use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::storage::StoreError;
use crate::types::VerificationTier;

/// What the proof-of-personhood verifier asserts about a user. Proofs are
/// validated upstream; the engine trusts this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub tier: VerificationTier,
    /// Opaque per-human handle, shared by every account of one person.
    pub uniqueness_handle: Option<String>,
}

impl Verification {
    pub fn unverified() -> Self {
        Self { tier: VerificationTier::None, uniqueness_handle: None }
    }
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn current_verification(&self, user_id: &str) -> Result<Verification, StoreError>;
}

/// Verifier backed by a local table. Unknown users are unverified.
#[derive(Debug, Default)]
pub struct StaticVerifier {
    entries: RwLock<HashMap<String, Verification>>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user_id: &str, tier: VerificationTier, handle: Option<&str>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                user_id.to_string(),
                Verification { tier, uniqueness_handle: handle.map(str::to_string) },
            );
        }
    }
}

#[async_trait]
impl IdentityVerifier for StaticVerifier {
    async fn current_verification(&self, user_id: &str) -> Result<Verification, StoreError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| StoreError::Unavailable("verifier table poisoned".to_string()))?;
        Ok(entries.get(user_id).cloned().unwrap_or_else(Verification::unverified))
    }
}
