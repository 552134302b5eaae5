//! # Gatehouse (Front-Door Access Flows)
//!
//! `gatehouse` drives the account-access flows behind the member portal and
//! the staff console. It authenticates users against an external identity
//! backend, classifies what kind of account relationship exists, and routes
//! each flow through the enrollment or verification phases required before a
//! session is granted.
//!
//! ## Flow model
//!
//! Every sign-in runs as one **flow instance**: a server-side state machine
//! from the first email submission to a terminal phase (`authenticated`,
//! `denied_no_account`, `denied_no_role`, or `abandoned`). The phase
//! controller owns the race-prevention guards and the ephemeral credential
//! cache that lets a multi-request flow survive page reloads and the forced
//! sign-out that precedes two-factor verification.
//!
//! ## Audiences
//!
//! The member portal and staff console share one parameterized state
//! machine. A policy object carries the differences: staff logins require
//! two-factor (including first-time enrollment), and the staff role-missing
//! denial auto-expires into a forced sign-out.
//!
//! ## Authentication boundaries
//!
//! - No session exists before the password is verified and the two-factor
//!   requirement is satisfied inside the same flow instance.
//! - Partially-established identities (wrong audience, missing role) are
//!   revoked before the denial is shown.
//! - Passwords and challenge identifiers live only in the session-scoped
//!   credential cache, with a hard staleness ceiling.

pub mod api;
pub mod cli;
pub mod flow;
pub mod identity;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        // Should be a hex string (full SHA-1 is 40 chars, but could be short)
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
