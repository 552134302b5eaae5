//! Phases, events, and guard flags for the access flow.
//!
//! Flow Overview:
//! - A flow instance starts at `EmailEntry` and moves through credential,
//!   code, and enrollment phases until it reaches a terminal phase.
//! - Events are the only way to move a flow; the controller decides the next
//!   phase from `(phase, event)` plus adapter results.
//!
//! Security boundaries: `Authenticated` is reached exactly once per flow
//! instance, and only with the primary credential verified and the
//! two-factor requirement satisfied in the same instance.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::identity::IdentityToken;

/// Named state of the access flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Entry phase: waiting for an email to classify.
    EmailEntry,
    /// Account classified; waiting for the primary credential.
    PasswordEntry,
    /// Primary credential verified; waiting for a one-time code.
    AwaitingCode,
    /// No account yet, but enrollment is offered.
    PortalCreatable,
    /// Enrollment started; waiting for the emailed verification code.
    EmailVerificationPending,
    /// Account created or linked; staff flows continue into two-factor setup.
    AccountCreated,
    /// Two-factor secret issued; the setup payload was returned once.
    SecretIssued,
    /// Waiting for the first code from the freshly bound authenticator.
    AwaitingFirstCode,
    Authenticated,
    DeniedNoAccount,
    DeniedNoRole,
    Abandoned,
}

impl Phase {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Authenticated | Self::DeniedNoAccount | Self::DeniedNoRole | Self::Abandoned
        )
    }

    /// Phases in which an externally observed identity token may complete the
    /// flow. Everywhere else the watcher defers.
    #[must_use]
    pub const fn accepts_identity_signal(self) -> bool {
        matches!(self, Self::PasswordEntry | Self::AwaitingCode)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EmailEntry => "email_entry",
            Self::PasswordEntry => "password_entry",
            Self::AwaitingCode => "awaiting_code",
            Self::PortalCreatable => "portal_creatable",
            Self::EmailVerificationPending => "email_verification_pending",
            Self::AccountCreated => "account_created",
            Self::SecretIssued => "secret_issued",
            Self::AwaitingFirstCode => "awaiting_first_code",
            Self::Authenticated => "authenticated",
            Self::DeniedNoAccount => "denied_no_account",
            Self::DeniedNoRole => "denied_no_role",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Events accepted by the phase controller.
#[derive(Clone, Debug)]
pub enum FlowEvent {
    EmailSubmitted {
        email: String,
    },
    PasswordSubmitted {
        password: SecretString,
        /// Display name, required when starting enrollment.
        display_name: Option<String>,
    },
    CodeSubmitted {
        code: String,
    },
    ResendRequested,
    /// Federated provider callback carrying the provider-issued token and the
    /// provider-returned email.
    ExternalSignInCompleted {
        token: IdentityToken,
        email: String,
        is_new_identity: bool,
    },
    Abandon,
}

impl FlowEvent {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EmailSubmitted { .. } => "email_submitted",
            Self::PasswordSubmitted { .. } => "password_submitted",
            Self::CodeSubmitted { .. } => "code_submitted",
            Self::ResendRequested => "resend_requested",
            Self::ExternalSignInCompleted { .. } => "external_sign_in_completed",
            Self::Abandon => "abandon",
        }
    }
}

/// Guarded async paths that may end in `Authenticated`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardKind {
    TwoFactorCheck,
    ExternalSignIn,
}

/// Advisory flags blocking the identity watcher while a check that could
/// grant a session is still in flight. Scoped to one flow instance, never
/// persisted.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionGuardFlags {
    is_checking_two_factor: bool,
    is_processing_external_sign_in: bool,
}

impl SessionGuardFlags {
    #[must_use]
    pub const fn any(self) -> bool {
        self.is_checking_two_factor || self.is_processing_external_sign_in
    }

    /// Test-and-set; returns false when the guard was already held.
    pub fn acquire(&mut self, kind: GuardKind) -> bool {
        let flag = match kind {
            GuardKind::TwoFactorCheck => &mut self.is_checking_two_factor,
            GuardKind::ExternalSignIn => &mut self.is_processing_external_sign_in,
        };
        if *flag {
            return false;
        }
        *flag = true;
        true
    }

    pub fn release(&mut self, kind: GuardKind) {
        match kind {
            GuardKind::TwoFactorCheck => self.is_checking_two_factor = false,
            GuardKind::ExternalSignIn => self.is_processing_external_sign_in = false,
        }
    }

    pub fn clear(&mut self) {
        self.is_checking_two_factor = false;
        self.is_processing_external_sign_in = false;
    }
}
