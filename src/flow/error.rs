//! Error taxonomy for the access flow.
//!
//! Backend errors are normalized into this enum at the adapter boundary; the
//! phase controller never receives a raw transport error. Every user-visible
//! failure names the next recoverable action and exposes no backend internals.

use crate::identity::BackendError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// What the user can do next after a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    Resend,
    ChangeEmail,
    ReenterCredentials,
    ContactSupport,
    StartOver,
}

/// Normalized flow errors.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FlowError {
    /// Retryable; the flow stays in its current phase.
    #[error("the service could not be reached, try again")]
    NetworkFailure,
    #[error("email or password is incorrect")]
    InvalidCredential,
    #[error("too many attempts, wait before trying again")]
    TooManyAttempts,
    #[error("this account is not enabled for the portal")]
    AccountNotPortalEnabled,
    #[error("this account has no staff role")]
    NoStaffRole,
    #[error("the code has expired, request a new one")]
    CodeExpired,
    #[error("the code is incorrect")]
    CodeInvalid,
    #[error("the sign-in session has expired, start again from your credentials")]
    SessionExpired,
    /// The submitted event is not valid in the current phase.
    #[error("that step is not available right now")]
    UnexpectedEvent,
}

impl FlowError {
    /// Next recoverable action to surface alongside the message.
    #[must_use]
    pub const fn recovery(&self) -> RecoveryAction {
        match self {
            Self::NetworkFailure | Self::InvalidCredential | Self::CodeInvalid => {
                RecoveryAction::Retry
            }
            Self::CodeExpired => RecoveryAction::Resend,
            Self::NoStaffRole => RecoveryAction::ChangeEmail,
            Self::SessionExpired => RecoveryAction::ReenterCredentials,
            Self::TooManyAttempts | Self::AccountNotPortalEnabled => RecoveryAction::ContactSupport,
            Self::UnexpectedEvent => RecoveryAction::StartOver,
        }
    }

    /// Whether the client should clear its password field.
    #[must_use]
    pub const fn clears_password(&self) -> bool {
        matches!(self, Self::InvalidCredential)
    }

    /// Whether the client should clear its code field.
    #[must_use]
    pub const fn clears_code(&self) -> bool {
        matches!(self, Self::CodeInvalid | Self::CodeExpired)
    }
}

impl From<BackendError> for FlowError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Network => Self::NetworkFailure,
            BackendError::InvalidCredential => Self::InvalidCredential,
            BackendError::TooManyAttempts => Self::TooManyAttempts,
            BackendError::CodeExpired => Self::CodeExpired,
            // A consumed or replaced challenge behaves like a bad code; the
            // resend path issues a fresh one.
            BackendError::CodeInvalid | BackendError::UnknownChallenge => Self::CodeInvalid,
            BackendError::Rejected(_) => Self::NetworkFailure,
        }
    }
}
