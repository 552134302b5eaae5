//! Credential verifier.
//!
//! Flow Overview: validate the primary credential (or bind a federated
//! token), check the audience's access flag, and hand a verified identity to
//! the phase controller. Account creation and linking also land here because
//! both yield a bound identity token.
//!
//! Security boundaries: an authenticated-but-unauthorized identity is
//! revoked before the error leaves this adapter, so no partially-established
//! token outlives the check that rejected it.

use std::sync::Arc;

use secrecy::SecretString;
use tracing::{info, warn};

use crate::identity::{IdentityBackend, IdentityToken, VerifiedCredential};

use super::error::FlowError;
use super::policy::{Audience, FlowPolicy};

pub(crate) struct CredentialVerifier<B> {
    backend: Arc<B>,
}

impl<B: IdentityBackend> CredentialVerifier<B> {
    pub(crate) fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Verify an email/password pair and enforce the audience access flag.
    pub(crate) async fn verify(
        &self,
        policy: &FlowPolicy,
        email: &str,
        password: &SecretString,
    ) -> Result<VerifiedCredential, FlowError> {
        let verified = self
            .backend
            .verify_credential(email, password)
            .await
            .map_err(FlowError::from)?;
        self.authorize(policy, verified).await
    }

    /// Bind profile flags to a federated token and enforce the same access
    /// policy as the password path.
    pub(crate) async fn resolve(
        &self,
        policy: &FlowPolicy,
        token: &IdentityToken,
    ) -> Result<VerifiedCredential, FlowError> {
        let verified = self
            .backend
            .resolve_token(token)
            .await
            .map_err(FlowError::from)?;
        self.authorize(policy, verified).await
    }

    /// Verify a credential for the portal-linking path, where the access flag
    /// is expected to still be unset.
    pub(crate) async fn verify_for_link(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<VerifiedCredential, FlowError> {
        self.backend
            .verify_credential(email, password)
            .await
            .map_err(FlowError::from)
    }

    /// Create or link the account, yielding the bound identity.
    pub(crate) async fn establish(
        &self,
        email: &str,
        name: &str,
        password: &SecretString,
    ) -> Result<IdentityToken, FlowError> {
        let created = self
            .backend
            .create_or_link_account(email, name, password)
            .await
            .map_err(FlowError::from)?;
        info!("account created or linked");
        Ok(created.identity)
    }

    /// Revoke a token that must not outlive the current step.
    pub(crate) async fn discard(&self, token: &IdentityToken) -> Result<(), FlowError> {
        self.backend.sign_out(token).await.map_err(|err| {
            warn!("failed to revoke identity token: {err}");
            FlowError::from(err)
        })
    }

    async fn authorize(
        &self,
        policy: &FlowPolicy,
        verified: VerifiedCredential,
    ) -> Result<VerifiedCredential, FlowError> {
        let allowed = match policy.audience() {
            Audience::MemberPortal => verified.flags.portal_access,
            Audience::StaffConsole => verified.flags.staff_role,
        };
        if allowed {
            return Ok(verified);
        }

        // Revoke before surfacing the denial; the token must never linger.
        if let Err(err) = self.backend.sign_out(&verified.token).await {
            warn!("failed to revoke unauthorized identity: {err}");
        }

        Err(match policy.audience() {
            Audience::MemberPortal => FlowError::AccountNotPortalEnabled,
            Audience::StaffConsole => FlowError::NoStaffRole,
        })
    }
}
