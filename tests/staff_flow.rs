//! Staff console flow tests: mandatory two-factor and auto-expiring denials.

mod common;

use std::time::Duration;

use common::{
    engine, enrolled_staff_account, staff_account, unknown_account, MockBackend, BACKUP_CODES,
    ENROLL_CODE,
};
use gatehouse::flow::{FlowError, FlowEvent, FlowPolicy, Phase};
use secrecy::SecretString;

fn email_event(email: &str) -> FlowEvent {
    FlowEvent::EmailSubmitted {
        email: email.to_string(),
    }
}

fn password_event(password: &str) -> FlowEvent {
    FlowEvent::PasswordSubmitted {
        password: SecretString::from(password.to_string()),
        display_name: None,
    }
}

fn signup_event(password: &str, name: &str) -> FlowEvent {
    FlowEvent::PasswordSubmitted {
        password: SecretString::from(password.to_string()),
        display_name: Some(name.to_string()),
    }
}

fn code_event(code: &str) -> FlowEvent {
    FlowEvent::CodeSubmitted {
        code: code.to_string(),
    }
}

#[tokio::test]
async fn first_staff_login_forces_enrollment_before_any_session() {
    let backend = MockBackend::new();
    backend.insert_account("ops@example.com", staff_account("hunter2"));
    let engine = engine(&backend);
    let flow_id = engine.begin(FlowPolicy::staff());

    engine
        .submit(flow_id, email_event("ops@example.com"))
        .await
        .expect("email submits");
    let reply = engine
        .submit(flow_id, password_event("hunter2"))
        .await
        .expect("password submits");
    assert_eq!(reply.phase, Phase::SecretIssued);
    assert!(reply.session.is_none());
    let setup = reply.setup.expect("setup payload expected");
    assert!(setup.setup_payload.starts_with("otpauth://"));

    let reply = engine
        .submit(flow_id, code_event(ENROLL_CODE))
        .await
        .expect("first code submits");
    assert_eq!(reply.phase, Phase::Authenticated);
    assert!(reply.session.is_some());
    // Backup codes are returned exactly once, with the completion.
    let codes = reply.backup_codes.expect("backup codes expected");
    assert_eq!(codes, BACKUP_CODES.map(str::to_string).to_vec());
}

#[tokio::test]
async fn wrong_first_code_rejects_and_retries() {
    let backend = MockBackend::new();
    backend.insert_account("ops@example.com", staff_account("hunter2"));
    let engine = engine(&backend);
    let flow_id = engine.begin(FlowPolicy::staff());

    engine
        .submit(flow_id, email_event("ops@example.com"))
        .await
        .expect("email submits");
    engine
        .submit(flow_id, password_event("hunter2"))
        .await
        .expect("password submits");

    let reply = engine
        .submit(flow_id, code_event("000000"))
        .await
        .expect("submit returns a reply");
    assert_eq!(reply.phase, Phase::AwaitingFirstCode);
    assert_eq!(reply.error, Some(FlowError::CodeInvalid));
    assert!(reply.backup_codes.is_none());

    let reply = engine
        .submit(flow_id, code_event(ENROLL_CODE))
        .await
        .expect("first code submits");
    assert_eq!(reply.phase, Phase::Authenticated);
    assert!(reply.backup_codes.is_some());
}

#[tokio::test]
async fn enrolled_staff_login_uses_the_code_phase() {
    let backend = MockBackend::new();
    backend.insert_account("ops@example.com", enrolled_staff_account("hunter2", "135791"));
    let engine = engine(&backend);
    let flow_id = engine.begin(FlowPolicy::staff());

    engine
        .submit(flow_id, email_event("ops@example.com"))
        .await
        .expect("email submits");
    let reply = engine
        .submit(flow_id, password_event("hunter2"))
        .await
        .expect("password submits");
    assert_eq!(reply.phase, Phase::AwaitingCode);

    let reply = engine
        .submit(flow_id, code_event("135791"))
        .await
        .expect("code submits");
    assert_eq!(reply.phase, Phase::Authenticated);
    // No enrollment happened, so no backup codes.
    assert!(reply.backup_codes.is_none());
}

#[tokio::test]
async fn missing_staff_role_denies_and_auto_expires() {
    let backend = MockBackend::new();
    // Known account, no staff role.
    let mut fixture = staff_account("hunter2");
    fixture.classification.has_staff_role = false;
    fixture.flags.staff_role = false;
    backend.insert_account("user@example.com", fixture);

    let engine = engine(&backend);
    let policy = FlowPolicy::staff().with_auto_expire_denial(Some(Duration::from_millis(50)));
    let flow_id = engine.begin(policy);

    let reply = engine
        .submit(flow_id, email_event("user@example.com"))
        .await
        .expect("email submits");
    assert_eq!(reply.phase, Phase::DeniedNoRole);
    assert_eq!(reply.error, Some(FlowError::NoStaffRole));

    // The denial stays readable for the configured delay...
    assert_eq!(engine.phase(flow_id).ok(), Some(Phase::DeniedNoRole));

    // ...then expires into a forced sign-out.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(engine.phase(flow_id).ok(), Some(Phase::Abandoned));
}

#[tokio::test]
async fn abandoning_the_denial_cancels_the_pending_sign_out() {
    let backend = MockBackend::new();
    let mut fixture = staff_account("hunter2");
    fixture.classification.has_staff_role = false;
    fixture.flags.staff_role = false;
    backend.insert_account("user@example.com", fixture);

    let engine = engine(&backend);
    let policy = FlowPolicy::staff().with_auto_expire_denial(Some(Duration::from_millis(50)));
    let flow_id = engine.begin(policy);

    engine
        .submit(flow_id, email_event("user@example.com"))
        .await
        .expect("email submits");
    engine
        .submit(flow_id, FlowEvent::Abandon)
        .await
        .expect("abandon replied");

    // The scheduled task was aborted with the flow; nothing fires late.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(engine.phase(flow_id).is_err());
}

#[tokio::test]
async fn staff_creation_flow_ends_with_mandatory_enrollment() {
    let backend = MockBackend::new();
    backend.insert_account("new-hire@example.com", unknown_account(true));
    let engine = engine(&backend);
    let flow_id = engine.begin(FlowPolicy::staff());

    engine
        .submit(flow_id, email_event("new-hire@example.com"))
        .await
        .expect("email submits");
    let reply = engine
        .submit(flow_id, signup_event("s3cret!", "New Hire"))
        .await
        .expect("signup starts");
    assert_eq!(reply.phase, Phase::EmailVerificationPending);

    let code = backend
        .current_email_code("new-hire@example.com")
        .expect("challenge outstanding");
    let reply = engine
        .submit(flow_id, code_event(&code))
        .await
        .expect("email code submits");
    // Staff enrollment continues into two-factor setup instead of a session.
    assert_eq!(reply.phase, Phase::SecretIssued);
    assert!(reply.session.is_none());
    assert!(reply.setup.is_some());

    let reply = engine
        .submit(flow_id, code_event(ENROLL_CODE))
        .await
        .expect("first code submits");
    assert_eq!(reply.phase, Phase::Authenticated);
    assert!(reply.backup_codes.is_some());
}

#[tokio::test]
async fn staff_password_login_with_wrong_role_is_revoked() {
    let backend = MockBackend::new();
    // Classified as staff, but the profile flag flipped between lookup and
    // verification.
    let mut fixture = staff_account("hunter2");
    fixture.flags.staff_role = false;
    backend.insert_account("ops@example.com", fixture);

    let engine = engine(&backend);
    let policy = FlowPolicy::staff().with_auto_expire_denial(Some(Duration::from_millis(50)));
    let flow_id = engine.begin(policy);

    engine
        .submit(flow_id, email_event("ops@example.com"))
        .await
        .expect("email submits");
    let reply = engine
        .submit(flow_id, password_event("hunter2"))
        .await
        .expect("password submits");
    assert_eq!(reply.phase, Phase::DeniedNoRole);
    assert_eq!(reply.error, Some(FlowError::NoStaffRole));
    // The partially-established identity was revoked before the denial.
    assert_eq!(backend.signed_out_tokens().len(), 1);
}
