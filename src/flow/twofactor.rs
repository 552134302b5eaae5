//! Two-factor challenge handler.
//!
//! Two sub-machines share this adapter:
//! - verification of one-time codes against an enrolled secret
//!   (`AwaitingCode -> Verifying -> Verified | Rejected`);
//! - first-time enrollment (`SecretIssued -> AwaitingFirstCode -> Completed |
//!   Rejected`), where completion marks the profile bound and returns the
//!   one-time backup codes.
//!
//! Emailed verification codes for enrollment travel through the same
//! adapter; every challenge is one-shot and replaced on resend.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::identity::{EmailChallenge, IdentityBackend, IdentityToken, TwoFactorSetup};

use super::error::FlowError;

/// Progress of a single code verification attempt, surfaced on the flow
/// status so a client can render the in-flight state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CodeCheckState {
    AwaitingCode,
    Verifying,
    Verified,
    Rejected,
}

pub(crate) struct TwoFactorHandler<B> {
    backend: Arc<B>,
}

impl<B: IdentityBackend> TwoFactorHandler<B> {
    pub(crate) fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Verify a one-time code against the enrolled secret.
    pub(crate) async fn verify_code(
        &self,
        identity: &IdentityToken,
        code: &str,
    ) -> Result<(), FlowError> {
        let outcome = self
            .backend
            .verify_two_factor_code(identity, code)
            .await
            .map_err(FlowError::from)?;
        if outcome.success {
            Ok(())
        } else {
            Err(FlowError::CodeInvalid)
        }
    }

    /// Issue a fresh secret and setup payload for first-time enrollment.
    pub(crate) async fn begin_enrollment(
        &self,
        identity: &IdentityToken,
    ) -> Result<TwoFactorSetup, FlowError> {
        let setup = self
            .backend
            .issue_two_factor_secret(identity)
            .await
            .map_err(FlowError::from)?;
        info!("two-factor secret issued");
        Ok(setup)
    }

    /// Confirm enrollment with the first code from the authenticator.
    ///
    /// On success the backend has already marked the profile
    /// `enabled && secret_bound`; the returned backup codes are displayed
    /// exactly once and are not retrievable again.
    pub(crate) async fn confirm_enrollment(
        &self,
        identity: &IdentityToken,
        code: &str,
    ) -> Result<Vec<String>, FlowError> {
        let outcome = self
            .backend
            .verify_two_factor_code(identity, code)
            .await
            .map_err(FlowError::from)?;
        if !outcome.success {
            return Err(FlowError::CodeInvalid);
        }
        let codes = outcome.backup_codes.unwrap_or_else(|| {
            warn!("enrollment completed without backup codes");
            Vec::new()
        });
        info!("two-factor enrollment completed");
        Ok(codes)
    }

    /// Issue an emailed verification code, replacing any prior challenge for
    /// the address.
    pub(crate) async fn issue_email_code(
        &self,
        email: &str,
        name: &str,
    ) -> Result<EmailChallenge, FlowError> {
        self.backend
            .issue_email_code(email, name)
            .await
            .map_err(FlowError::from)
    }

    /// Consume an emailed verification code.
    pub(crate) async fn verify_email_code(
        &self,
        challenge_id: Uuid,
        code: &str,
    ) -> Result<(), FlowError> {
        let outcome = self
            .backend
            .verify_email_code(challenge_id, code)
            .await
            .map_err(FlowError::from)?;
        if outcome.success {
            Ok(())
        } else {
            Err(FlowError::CodeInvalid)
        }
    }
}
