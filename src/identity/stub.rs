//! Scriptable in-memory backend for unit tests.
//!
//! Only the calls the adapter unit tests drive are scriptable; everything
//! else answers with a rejection. The full-flow mock lives with the
//! integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use secrecy::SecretString;
use uuid::Uuid;

use super::{
    AccountClassification, BackendError, CodeVerification, CreatedAccount, EmailChallenge,
    IdentityBackend, IdentityToken, TwoFactorSetup, VerifiedCredential,
};

type Scripted<T> = Mutex<Result<T, BackendError>>;

fn unscripted<T>() -> Scripted<T> {
    Mutex::new(Err(not_scripted()))
}

fn not_scripted() -> BackendError {
    BackendError::Rejected("not scripted".to_string())
}

fn read<T: Clone>(slot: &Scripted<T>) -> Result<T, BackendError> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write<T>(slot: &Scripted<T>, value: Result<T, BackendError>) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = value;
}

pub(crate) struct StubBackend {
    classification: Scripted<AccountClassification>,
    verify: Scripted<VerifiedCredential>,
    resolve: Scripted<VerifiedCredential>,
    totp_verify: Scripted<CodeVerification>,
    classify_calls: AtomicUsize,
    signed_out: Mutex<Vec<String>>,
}

impl StubBackend {
    pub(crate) fn new() -> Self {
        Self {
            classification: unscripted(),
            verify: unscripted(),
            resolve: unscripted(),
            totp_verify: unscripted(),
            classify_calls: AtomicUsize::new(0),
            signed_out: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn set_classification(&self, value: Result<AccountClassification, BackendError>) {
        write(&self.classification, value);
    }

    pub(crate) fn set_verify(&self, value: Result<VerifiedCredential, BackendError>) {
        write(&self.verify, value);
    }

    pub(crate) fn set_resolve(&self, value: Result<VerifiedCredential, BackendError>) {
        write(&self.resolve, value);
    }

    pub(crate) fn set_totp_verify(&self, value: Result<CodeVerification, BackendError>) {
        write(&self.totp_verify, value);
    }

    pub(crate) fn classify_calls(&self) -> usize {
        self.classify_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn signed_out(&self) -> Vec<String> {
        self.signed_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl IdentityBackend for StubBackend {
    async fn classify_account(&self, _email: &str) -> Result<AccountClassification, BackendError> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        read(&self.classification)
    }

    async fn verify_credential(
        &self,
        _email: &str,
        _password: &SecretString,
    ) -> Result<VerifiedCredential, BackendError> {
        read(&self.verify)
    }

    async fn resolve_token(
        &self,
        _token: &IdentityToken,
    ) -> Result<VerifiedCredential, BackendError> {
        read(&self.resolve)
    }

    async fn issue_email_code(
        &self,
        _email: &str,
        _name: &str,
    ) -> Result<EmailChallenge, BackendError> {
        Err(not_scripted())
    }

    async fn verify_email_code(
        &self,
        _challenge_id: Uuid,
        _code: &str,
    ) -> Result<CodeVerification, BackendError> {
        Err(not_scripted())
    }

    async fn issue_two_factor_secret(
        &self,
        _identity: &IdentityToken,
    ) -> Result<TwoFactorSetup, BackendError> {
        Err(not_scripted())
    }

    async fn verify_two_factor_code(
        &self,
        _identity: &IdentityToken,
        _code: &str,
    ) -> Result<CodeVerification, BackendError> {
        read(&self.totp_verify)
    }

    async fn create_or_link_account(
        &self,
        _email: &str,
        _name: &str,
        _password: &SecretString,
    ) -> Result<CreatedAccount, BackendError> {
        Err(not_scripted())
    }

    async fn sign_out(&self, token: &IdentityToken) -> Result<(), BackendError> {
        self.signed_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(token.expose().to_string());
        Ok(())
    }
}
