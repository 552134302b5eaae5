#![allow(dead_code)]
//! Scriptable in-memory identity backend for flow tests.
//!
//! Implements the backend contract faithfully enough to exercise the state
//! machine: one outstanding email challenge per address (replaced on
//! resend), one-shot code consumption, token minting and revocation, and
//! enrollment that flips the profile's two-factor flags.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use gatehouse::flow::{FlowEngine, FlowTiming};
use gatehouse::identity::{
    AccountClassification, BackendError, CodeVerification, CreatedAccount, EmailChallenge,
    IdentityBackend, IdentityToken, ProfileFlags, TwoFactorFlags, TwoFactorSetup,
    VerifiedCredential,
};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

/// First code produced by a freshly issued TOTP secret.
pub const ENROLL_CODE: &str = "654321";
pub const BACKUP_CODES: [&str; 2] = ["1111-2222", "3333-4444"];

pub struct AccountFixture {
    pub password: String,
    pub classification: AccountClassification,
    pub flags: ProfileFlags,
    /// Valid TOTP code for an already-enrolled account.
    pub totp_code: Option<String>,
}

pub fn member_account(password: &str) -> AccountFixture {
    AccountFixture {
        password: password.to_string(),
        classification: AccountClassification {
            has_account: true,
            has_portal_access: true,
            ..AccountClassification::default()
        },
        flags: ProfileFlags {
            portal_access: true,
            ..ProfileFlags::default()
        },
        totp_code: None,
    }
}

pub fn enrolled_member_account(password: &str, totp_code: &str) -> AccountFixture {
    let mut fixture = member_account(password);
    fixture.flags.two_factor = TwoFactorFlags {
        enabled: true,
        secret_bound: true,
    };
    fixture.totp_code = Some(totp_code.to_string());
    fixture
}

pub fn staff_account(password: &str) -> AccountFixture {
    AccountFixture {
        password: password.to_string(),
        classification: AccountClassification {
            has_account: true,
            has_staff_role: true,
            ..AccountClassification::default()
        },
        flags: ProfileFlags {
            staff_role: true,
            ..ProfileFlags::default()
        },
        totp_code: None,
    }
}

pub fn enrolled_staff_account(password: &str, totp_code: &str) -> AccountFixture {
    let mut fixture = staff_account(password);
    fixture.flags.two_factor = TwoFactorFlags {
        enabled: true,
        secret_bound: true,
    };
    fixture.totp_code = Some(totp_code.to_string());
    fixture
}

pub fn unknown_account(can_create_portal: bool) -> AccountFixture {
    AccountFixture {
        password: String::new(),
        classification: AccountClassification {
            can_create_portal,
            ..AccountClassification::default()
        },
        flags: ProfileFlags::default(),
        totp_code: None,
    }
}

#[derive(Default)]
pub struct MockBackend {
    accounts: Mutex<HashMap<String, AccountFixture>>,
    /// One outstanding challenge per email; issuing replaces the previous.
    challenges: Mutex<HashMap<String, (Uuid, String)>>,
    /// Tokens waiting for their first enrollment code.
    pending_secrets: Mutex<HashMap<String, String>>,
    /// Minted tokens, mapped back to the email they belong to.
    tokens: Mutex<HashMap<String, String>>,
    pub signed_out: Mutex<Vec<String>>,
    token_seq: AtomicUsize,
    code_seq: AtomicUsize,
    pub classify_calls: AtomicUsize,
    pub fail_classify: AtomicBool,
    pub fail_verify: AtomicBool,
    verify_delay: Mutex<Option<Duration>>,
    classify_delay: Mutex<Option<Duration>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_account(&self, email: &str, fixture: AccountFixture) {
        lock(&self.accounts).insert(email.to_string(), fixture);
    }

    /// Mint a token out-of-band, as a federated provider would.
    pub fn mint_token_for(&self, email: &str) -> IdentityToken {
        let token = self.next_token();
        lock(&self.tokens).insert(token.clone(), email.to_string());
        IdentityToken::new(token)
    }

    /// The outstanding emailed code for an address.
    pub fn current_email_code(&self, email: &str) -> Option<String> {
        lock(&self.challenges)
            .get(email)
            .map(|(_, code)| code.clone())
    }

    pub fn signed_out_tokens(&self) -> Vec<String> {
        lock(&self.signed_out).clone()
    }

    pub fn set_verify_delay(&self, delay: Duration) {
        *lock(&self.verify_delay) = Some(delay);
    }

    pub fn set_classify_delay(&self, delay: Duration) {
        *lock(&self.classify_delay) = Some(delay);
    }

    fn next_token(&self) -> String {
        format!("tok-{}", self.token_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn email_for_token(&self, token: &IdentityToken) -> Option<String> {
        lock(&self.tokens).get(token.expose()).cloned()
    }

    fn classification_for(&self, email: &str) -> AccountClassification {
        lock(&self.accounts)
            .get(email)
            .map(|fixture| fixture.classification.clone())
            .unwrap_or_default()
    }

    fn flags_for(&self, email: &str) -> ProfileFlags {
        lock(&self.accounts)
            .get(email)
            .map(|fixture| fixture.flags.clone())
            .unwrap_or_default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn maybe_sleep(slot: &Mutex<Option<Duration>>) {
    let delay = *lock(slot);
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

impl IdentityBackend for MockBackend {
    async fn classify_account(&self, email: &str) -> Result<AccountClassification, BackendError> {
        maybe_sleep(&self.classify_delay).await;
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_classify.load(Ordering::SeqCst) {
            return Err(BackendError::Network);
        }
        Ok(self.classification_for(email))
    }

    async fn verify_credential(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<VerifiedCredential, BackendError> {
        maybe_sleep(&self.verify_delay).await;
        if self.fail_verify.load(Ordering::SeqCst) {
            return Err(BackendError::Network);
        }
        let valid = lock(&self.accounts)
            .get(email)
            .is_some_and(|fixture| {
                fixture.classification.has_account
                    && fixture.password == password.expose_secret()
            });
        if !valid {
            return Err(BackendError::InvalidCredential);
        }
        let token = self.next_token();
        lock(&self.tokens).insert(token.clone(), email.to_string());
        Ok(VerifiedCredential {
            token: IdentityToken::new(token),
            flags: self.flags_for(email),
        })
    }

    async fn resolve_token(
        &self,
        token: &IdentityToken,
    ) -> Result<VerifiedCredential, BackendError> {
        let email = self
            .email_for_token(token)
            .ok_or(BackendError::InvalidCredential)?;
        Ok(VerifiedCredential {
            token: token.clone(),
            flags: self.flags_for(&email),
        })
    }

    async fn issue_email_code(
        &self,
        email: &str,
        _name: &str,
    ) -> Result<EmailChallenge, BackendError> {
        let challenge_id = Uuid::new_v4();
        let code = format!("{}", 100_000 + self.code_seq.fetch_add(1, Ordering::SeqCst));
        // Replaces any outstanding challenge for the address.
        lock(&self.challenges).insert(email.to_string(), (challenge_id, code));
        Ok(EmailChallenge { challenge_id })
    }

    async fn verify_email_code(
        &self,
        challenge_id: Uuid,
        code: &str,
    ) -> Result<CodeVerification, BackendError> {
        let mut challenges = lock(&self.challenges);
        let entry = challenges
            .iter()
            .find(|(_, (id, _))| *id == challenge_id)
            .map(|(email, (_, expected))| (email.clone(), expected.clone()));
        match entry {
            Some((email, expected)) if expected == code => {
                // One-shot: consumed on success.
                challenges.remove(&email);
                Ok(CodeVerification {
                    success: true,
                    backup_codes: None,
                })
            }
            _ => Ok(CodeVerification {
                success: false,
                backup_codes: None,
            }),
        }
    }

    async fn issue_two_factor_secret(
        &self,
        identity: &IdentityToken,
    ) -> Result<TwoFactorSetup, BackendError> {
        if self.email_for_token(identity).is_none() {
            return Err(BackendError::InvalidCredential);
        }
        let serial = self.code_seq.fetch_add(1, Ordering::SeqCst);
        lock(&self.pending_secrets).insert(identity.expose().to_string(), ENROLL_CODE.to_string());
        Ok(TwoFactorSetup {
            secret: format!("SECRET-{serial}"),
            setup_payload: format!("otpauth://totp/gatehouse?secret=SECRET-{serial}"),
        })
    }

    async fn verify_two_factor_code(
        &self,
        identity: &IdentityToken,
        code: &str,
    ) -> Result<CodeVerification, BackendError> {
        let email = self
            .email_for_token(identity)
            .ok_or(BackendError::InvalidCredential)?;

        let pending = lock(&self.pending_secrets)
            .get(identity.expose())
            .cloned();
        if let Some(expected) = pending {
            if expected != code {
                return Ok(CodeVerification {
                    success: false,
                    backup_codes: None,
                });
            }
            lock(&self.pending_secrets).remove(identity.expose());
            // Enrollment completes: bind the secret and hand out the codes.
            if let Some(fixture) = lock(&self.accounts).get_mut(&email) {
                fixture.flags.two_factor = TwoFactorFlags {
                    enabled: true,
                    secret_bound: true,
                };
                fixture.totp_code = Some(ENROLL_CODE.to_string());
            }
            return Ok(CodeVerification {
                success: true,
                backup_codes: Some(BACKUP_CODES.iter().map(ToString::to_string).collect()),
            });
        }

        let valid = lock(&self.accounts)
            .get(&email)
            .is_some_and(|fixture| fixture.totp_code.as_deref() == Some(code));
        Ok(CodeVerification {
            success: valid,
            backup_codes: None,
        })
    }

    async fn create_or_link_account(
        &self,
        email: &str,
        _name: &str,
        password: &SecretString,
    ) -> Result<CreatedAccount, BackendError> {
        let token = self.next_token();
        lock(&self.tokens).insert(token.clone(), email.to_string());
        let mut accounts = lock(&self.accounts);
        let fixture = accounts
            .entry(email.to_string())
            .or_insert_with(|| unknown_account(true));
        fixture.password = password.expose_secret().to_string();
        fixture.classification.has_account = true;
        fixture.classification.has_portal_access = true;
        fixture.classification.has_staff_role = true;
        fixture.flags.portal_access = true;
        fixture.flags.staff_role = true;
        Ok(CreatedAccount {
            identity: IdentityToken::new(token),
        })
    }

    async fn sign_out(&self, token: &IdentityToken) -> Result<(), BackendError> {
        lock(&self.signed_out).push(token.expose().to_string());
        lock(&self.tokens).remove(token.expose());
        Ok(())
    }
}

pub fn engine(backend: &Arc<MockBackend>) -> FlowEngine<MockBackend> {
    FlowEngine::new(Arc::clone(backend), FlowTiming::new())
}

pub fn engine_with(backend: &Arc<MockBackend>, timing: FlowTiming) -> FlowEngine<MockBackend> {
    FlowEngine::new(Arc::clone(backend), timing)
}
