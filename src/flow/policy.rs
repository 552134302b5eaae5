//! Audience policy for the two front doors.
//!
//! The member portal and staff console run the same state machine; the
//! differences live entirely in this policy object instead of two divergent
//! flow copies.

use crate::identity::TwoFactorFlags;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use utoipa::ToSchema;

use super::phase::Phase;

const DEFAULT_DENIAL_EXPIRY: Duration = Duration::from_secs(12);

/// Which front door the flow belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    MemberPortal,
    StaffConsole,
}

impl Audience {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MemberPortal => "member_portal",
            Self::StaffConsole => "staff_console",
        }
    }
}

/// Policy differences between the front doors.
#[derive(Clone, Copy, Debug)]
pub struct FlowPolicy {
    audience: Audience,
    two_factor_required: bool,
    auto_expire_denial: Option<Duration>,
}

impl FlowPolicy {
    /// Member portal: two-factor is honored when enrolled, never forced.
    #[must_use]
    pub const fn member() -> Self {
        Self {
            audience: Audience::MemberPortal,
            two_factor_required: false,
            auto_expire_denial: None,
        }
    }

    /// Staff console: two-factor is mandatory, including first-time
    /// enrollment, and the role-missing denial auto-expires into sign-out.
    #[must_use]
    pub const fn staff() -> Self {
        Self {
            audience: Audience::StaffConsole,
            two_factor_required: true,
            auto_expire_denial: Some(DEFAULT_DENIAL_EXPIRY),
        }
    }

    #[must_use]
    pub const fn for_audience(audience: Audience) -> Self {
        match audience {
            Audience::MemberPortal => Self::member(),
            Audience::StaffConsole => Self::staff(),
        }
    }

    #[must_use]
    pub const fn with_auto_expire_denial(mut self, delay: Option<Duration>) -> Self {
        self.auto_expire_denial = delay;
        self
    }

    #[must_use]
    pub const fn audience(&self) -> Audience {
        self.audience
    }

    #[must_use]
    pub const fn two_factor_required(&self) -> bool {
        self.two_factor_required
    }

    #[must_use]
    pub const fn auto_expire_denial(&self) -> Option<Duration> {
        self.auto_expire_denial
    }

    /// Whether a verified identity with these flags still has to complete
    /// first-time two-factor enrollment before a session may exist.
    #[must_use]
    pub const fn requires_enrollment(&self, flags: TwoFactorFlags) -> bool {
        self.two_factor_required && !flags.active()
    }

    /// Denial phase for an account that exists but lacks the audience's
    /// access flag.
    #[must_use]
    pub const fn denied_access_phase(&self) -> Phase {
        match self.audience {
            Audience::MemberPortal => Phase::DeniedNoAccount,
            Audience::StaffConsole => Phase::DeniedNoRole,
        }
    }
}
