//! Account lookup service adapter.
//!
//! Wraps the identity backend's account classification call and resolves the
//! audience-specific access flag. Idempotent and side-effect free; called
//! once per email submission and never cached across submissions.

use std::sync::Arc;
use tracing::debug;

use crate::identity::{AccountClassification, IdentityBackend, MemberInfo};

use super::error::FlowError;
use super::policy::Audience;

/// Classification of an email, resolved for one audience.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountLookupResult {
    pub has_account: bool,
    /// Portal access for the member audience, staff role for the staff
    /// audience.
    pub has_access: bool,
    pub can_create_portal: bool,
    pub requires_password_first: bool,
    pub member: Option<MemberInfo>,
}

pub(crate) struct AccountLookupAdapter<B> {
    backend: Arc<B>,
}

impl<B: IdentityBackend> AccountLookupAdapter<B> {
    pub(crate) fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Classify an email for an audience.
    ///
    /// Classification has no semantic failure modes; every backend error
    /// surfaces as a retryable [`FlowError::NetworkFailure`] and the caller
    /// stays in its current phase.
    pub(crate) async fn lookup(
        &self,
        audience: Audience,
        email: &str,
    ) -> Result<AccountLookupResult, FlowError> {
        let classification = self
            .backend
            .classify_account(email)
            .await
            .map_err(|err| {
                debug!("account classification failed: {err}");
                FlowError::NetworkFailure
            })?;

        Ok(resolve(audience, classification))
    }
}

fn resolve(audience: Audience, classification: AccountClassification) -> AccountLookupResult {
    let has_access = match audience {
        Audience::MemberPortal => classification.has_portal_access,
        Audience::StaffConsole => classification.has_staff_role,
    };

    AccountLookupResult {
        has_account: classification.has_account,
        has_access,
        can_create_portal: classification.can_create_portal,
        requires_password_first: classification.requires_password_first,
        member: classification.member,
    }
}

#[cfg(test)]
mod tests {
    use super::{resolve, AccountLookupAdapter};
    use crate::flow::error::FlowError;
    use crate::flow::policy::Audience;
    use crate::identity::stub::StubBackend;
    use crate::identity::{AccountClassification, BackendError};
    use std::sync::Arc;

    #[test]
    fn resolve_picks_the_audience_flag() {
        let classification = AccountClassification {
            has_account: true,
            has_portal_access: true,
            has_staff_role: false,
            ..AccountClassification::default()
        };

        let member = resolve(Audience::MemberPortal, classification.clone());
        assert!(member.has_access);

        let staff = resolve(Audience::StaffConsole, classification);
        assert!(!staff.has_access);
    }

    #[tokio::test]
    async fn lookup_is_called_once_per_submission() {
        let backend = Arc::new(StubBackend::new());
        backend.set_classification(Ok(AccountClassification {
            has_account: true,
            has_portal_access: true,
            ..AccountClassification::default()
        }));
        let adapter = AccountLookupAdapter::new(Arc::clone(&backend));

        let first = adapter
            .lookup(Audience::MemberPortal, "alice@example.com")
            .await;
        let second = adapter
            .lookup(Audience::MemberPortal, "alice@example.com")
            .await;

        assert_eq!(first, second);
        assert_eq!(backend.classify_calls(), 2);
    }

    #[tokio::test]
    async fn every_backend_error_is_a_retryable_network_failure() {
        let backend = Arc::new(StubBackend::new());
        backend.set_classification(Err(BackendError::Rejected("boom".to_string())));
        let adapter = AccountLookupAdapter::new(Arc::clone(&backend));

        let err = adapter
            .lookup(Audience::StaffConsole, "bob@example.com")
            .await
            .expect_err("classification error expected");
        assert_eq!(err, FlowError::NetworkFailure);
    }
}
