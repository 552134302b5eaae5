//! Identity backend RPC surface.
//!
//! The identity backend owns credentials, profile flags, and verification
//! challenges. Gatehouse only orchestrates calls against it; nothing in this
//! crate stores a password or a TOTP secret durably.
//!
//! Security boundaries:
//! - Raw identity tokens are opaque strings; they are never logged.
//! - Challenges are one-shot and owned by the backend; this crate only keeps
//!   their identifiers.

pub(crate) mod http;
#[cfg(test)]
pub(crate) mod stub;

pub use http::HttpIdentityBackend;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

/// Opaque identity token issued by the backend.
///
/// Wrapped so the raw value never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityToken(String);

impl IdentityToken {
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentityToken(***)")
    }
}

/// Member record details returned by account classification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct MemberInfo {
    pub first_name: String,
    pub last_name: String,
    pub member_id: String,
}

/// Raw classification of an email as the backend reports it.
///
/// Both the portal-access and staff-role flags are carried; the lookup
/// adapter resolves the one relevant for the flow's audience.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountClassification {
    pub has_account: bool,
    pub has_portal_access: bool,
    pub has_staff_role: bool,
    pub can_create_portal: bool,
    pub requires_password_first: bool,
    pub member: Option<MemberInfo>,
}

/// Two-factor flags on a profile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoFactorFlags {
    pub enabled: bool,
    pub secret_bound: bool,
}

impl TwoFactorFlags {
    /// Only `enabled && secret_bound` permits skipping the setup sub-flow.
    #[must_use]
    pub const fn active(self) -> bool {
        self.enabled && self.secret_bound
    }
}

/// Profile flags bound to a verified identity.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFlags {
    pub portal_access: bool,
    pub staff_role: bool,
    pub two_factor: TwoFactorFlags,
}

/// Result of a successful primary-credential check.
#[derive(Clone, Debug)]
pub struct VerifiedCredential {
    pub token: IdentityToken,
    pub flags: ProfileFlags,
}

/// Backend handle for an outstanding email verification code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailChallenge {
    pub challenge_id: Uuid,
}

/// Freshly issued TOTP secret plus the payload a client renders as a QR code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TwoFactorSetup {
    pub secret: String,
    pub setup_payload: String,
}

/// Outcome of verifying a one-time code against the backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeVerification {
    pub success: bool,
    /// Present exactly once, when a first code completes enrollment.
    pub backup_codes: Option<Vec<String>>,
}

/// Result of creating or linking an account.
#[derive(Clone, Debug)]
pub struct CreatedAccount {
    pub identity: IdentityToken,
}

/// Errors surfaced by the identity backend, already stripped of transport
/// detail. Adapters in `crate::flow` map these into the flow error taxonomy;
/// the phase controller never sees this type.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("identity backend unreachable")]
    Network,
    #[error("credential rejected")]
    InvalidCredential,
    #[error("too many attempts")]
    TooManyAttempts,
    #[error("code expired")]
    CodeExpired,
    #[error("code invalid")]
    CodeInvalid,
    #[error("challenge not found")]
    UnknownChallenge,
    #[error("backend rejected the request: {0}")]
    Rejected(String),
}

/// RPC surface consumed by the flow engine.
///
/// `sign_out` and `resolve_token` supplement the classification and
/// verification calls: the first revokes a partially-established identity,
/// the second binds profile flags to a token minted out-of-band (federated
/// sign-in).
#[allow(async_fn_in_trait)]
pub trait IdentityBackend: Send + Sync + 'static {
    async fn classify_account(&self, email: &str) -> Result<AccountClassification, BackendError>;

    async fn verify_credential(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<VerifiedCredential, BackendError>;

    async fn resolve_token(&self, token: &IdentityToken)
        -> Result<VerifiedCredential, BackendError>;

    async fn issue_email_code(&self, email: &str, name: &str)
        -> Result<EmailChallenge, BackendError>;

    async fn verify_email_code(
        &self,
        challenge_id: Uuid,
        code: &str,
    ) -> Result<CodeVerification, BackendError>;

    async fn issue_two_factor_secret(
        &self,
        identity: &IdentityToken,
    ) -> Result<TwoFactorSetup, BackendError>;

    async fn verify_two_factor_code(
        &self,
        identity: &IdentityToken,
        code: &str,
    ) -> Result<CodeVerification, BackendError>;

    async fn create_or_link_account(
        &self,
        email: &str,
        name: &str,
        password: &SecretString,
    ) -> Result<CreatedAccount, BackendError>;

    async fn sign_out(&self, token: &IdentityToken) -> Result<(), BackendError>;
}
