//! Account-access flow engine.
//!
//! Flow Overview:
//! 1) The UI submits an email; the lookup adapter classifies it and the
//!    controller selects a phase.
//! 2) If a password phase follows, the credential verifier runs; with
//!    two-factor enabled the challenge handler takes over.
//! 3) The controller commits the authenticated session exactly once, or
//!    loops back to a recoverable phase with a normalized error.
//!
//! Security boundaries:
//! - No session is granted without the primary credential verified and the
//!   two-factor requirement satisfied inside the same flow instance.
//! - Partially-established identities are revoked before any denial is
//!   shown.
//! - Credential drafts live only in the ephemeral cache and die with the
//!   flow.

pub(crate) mod cache;
mod controller;
mod error;
mod lookup;
mod phase;
mod policy;
mod twofactor;
mod verifier;

pub use cache::CredentialDraft;
pub use controller::{FlowEngine, FlowReply, FlowTiming, ObserveOutcome};
pub use error::{FlowError, RecoveryAction};
pub use lookup::AccountLookupResult;
pub use phase::{FlowEvent, GuardKind, Phase, SessionGuardFlags};
pub use policy::{Audience, FlowPolicy};
pub use twofactor::CodeCheckState;
