//! Phase controller for the account-access flow.
//!
//! Flow Overview:
//! 1) An email submission is classified and routed to a credential,
//!    enrollment, or denial phase.
//! 2) The credential verifier and two-factor handler run as side effects of
//!    events; the controller applies their results and picks the next phase.
//! 3) `Authenticated` is committed exactly once per flow instance; every
//!    other terminal phase destroys the credential draft.
//!
//! Concurrency model: one logical flow per instance, but independently
//! scheduled async results can resolve out of order. Two advisory guard
//! flags block the identity watcher while a check that could grant a session
//! is in flight, and an epoch counter on each instance discards results that
//! started before the latest reset ("is this response still relevant").
//! Guards are released by a drop guard so an error return cannot leave one
//! held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::AbortHandle;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::identity::{IdentityBackend, IdentityToken, MemberInfo, TwoFactorSetup};

use super::cache::{CredentialCache, CredentialDraft};
use super::error::FlowError;
use super::lookup::{AccountLookupAdapter, AccountLookupResult};
use super::phase::{FlowEvent, GuardKind, Phase, SessionGuardFlags};
use super::policy::{Audience, FlowPolicy};
use super::twofactor::{CodeCheckState, TwoFactorHandler};
use super::verifier::CredentialVerifier;

const DEFAULT_FLOW_TTL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_RESEND_COOLDOWN: Duration = Duration::from_secs(60);

/// Timing knobs for flow instances and the credential cache.
#[derive(Clone, Copy, Debug)]
pub struct FlowTiming {
    flow_ttl: Duration,
    cache_ttl: Duration,
    resend_cooldown: Duration,
}

impl FlowTiming {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            flow_ttl: DEFAULT_FLOW_TTL,
            cache_ttl: DEFAULT_CACHE_TTL,
            resend_cooldown: DEFAULT_RESEND_COOLDOWN,
        }
    }

    #[must_use]
    pub const fn with_flow_ttl(mut self, ttl: Duration) -> Self {
        self.flow_ttl = ttl;
        self
    }

    #[must_use]
    pub const fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    #[must_use]
    pub const fn with_resend_cooldown(mut self, cooldown: Duration) -> Self {
        self.resend_cooldown = cooldown;
        self
    }

    #[must_use]
    pub const fn flow_ttl(&self) -> Duration {
        self.flow_ttl
    }

    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    #[must_use]
    pub const fn resend_cooldown(&self) -> Duration {
        self.resend_cooldown
    }
}

impl Default for FlowTiming {
    fn default() -> Self {
        Self::new()
    }
}

/// Reply from the controller after an event.
#[derive(Clone, Debug)]
pub struct FlowReply {
    pub phase: Phase,
    /// Normalized failure, present when the flow stayed put or was denied.
    pub error: Option<FlowError>,
    pub member: Option<MemberInfo>,
    /// Setup payload, returned when a two-factor secret was issued.
    pub setup: Option<TwoFactorSetup>,
    /// Backup codes, returned exactly once when enrollment completes.
    pub backup_codes: Option<Vec<String>>,
    /// Session token, present only in the `Authenticated` phase.
    pub session: Option<IdentityToken>,
    /// Seconds until a resend is accepted again.
    pub retry_after_seconds: Option<u64>,
}

impl FlowReply {
    pub(crate) fn at(phase: Phase) -> Self {
        Self {
            phase,
            error: None,
            member: None,
            setup: None,
            backup_codes: None,
            session: None,
            retry_after_seconds: None,
        }
    }

    fn with_error(phase: Phase, error: FlowError) -> Self {
        Self {
            error: Some(error),
            ..Self::at(phase)
        }
    }
}

/// Outcome of the identity watcher observing an ambient token.
#[derive(Clone, Debug)]
pub enum ObserveOutcome {
    /// The flow was already in a success sub-state; the token completed it.
    Completed(FlowReply),
    /// A guard was held or the phase does not accept the signal yet.
    Deferred(Phase),
}

/// Which code verification an incoming `CodeSubmitted` event drives.
enum CodeRoute {
    SecondFactor,
    EmailChallenge,
    Enrollment,
}

struct FlowInstance {
    policy: FlowPolicy,
    phase: Phase,
    /// Bumped on every applied transition; in-flight results from an older
    /// epoch are discarded.
    epoch: u64,
    guards: SessionGuardFlags,
    email: Option<String>,
    member: Option<MemberInfo>,
    credential_verified: bool,
    two_factor_pending: bool,
    code_check: Option<CodeCheckState>,
    /// Portal link pending: verify the existing credential, then link.
    linking: bool,
    /// Identity held server-side during enrollment; never returned to the
    /// client before the second factor is bound.
    pending_identity: Option<IdentityToken>,
    session: Option<IdentityToken>,
    denial_timer: Option<AbortHandle>,
    last_resend: Option<Instant>,
    touched: Instant,
}

impl FlowInstance {
    fn new(policy: FlowPolicy) -> Self {
        Self {
            policy,
            phase: Phase::EmailEntry,
            epoch: 0,
            guards: SessionGuardFlags::default(),
            email: None,
            member: None,
            credential_verified: false,
            two_factor_pending: false,
            code_check: None,
            linking: false,
            pending_identity: None,
            session: None,
            denial_timer: None,
            last_resend: None,
            touched: Instant::now(),
        }
    }

    /// Drop all progress from a previous email, keeping the instance alive.
    fn reset_progress(&mut self) {
        self.member = None;
        self.credential_verified = false;
        self.two_factor_pending = false;
        self.code_check = None;
        self.linking = false;
        self.pending_identity = None;
        self.last_resend = None;
        self.guards.clear();
        if let Some(timer) = self.denial_timer.take() {
            timer.abort();
        }
    }

    /// Commit the terminal `Authenticated` transition, exactly once.
    fn complete(&mut self, token: IdentityToken) -> Result<FlowReply, FlowError> {
        if self.session.is_some() {
            return Err(FlowError::UnexpectedEvent);
        }
        if let Some(timer) = self.denial_timer.take() {
            timer.abort();
        }
        self.session = Some(token.clone());
        self.credential_verified = true;
        self.two_factor_pending = false;
        self.pending_identity = None;
        self.linking = false;
        self.guards.clear();
        self.phase = Phase::Authenticated;

        let mut reply = FlowReply::at(Phase::Authenticated);
        reply.member = self.member.clone();
        reply.session = Some(token);
        Ok(reply)
    }
}

type FlowMap = HashMap<Uuid, FlowInstance>;

fn lock_map(flows: &Mutex<FlowMap>) -> MutexGuard<'_, FlowMap> {
    flows.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases a guard flag when dropped, unless the instance has moved to a
/// newer epoch (a reset or applied transition already cleared or re-owns the
/// guard state).
struct GuardHold {
    flows: Arc<Mutex<FlowMap>>,
    flow_id: Uuid,
    kind: GuardKind,
    epoch: u64,
}

impl Drop for GuardHold {
    fn drop(&mut self) {
        let mut flows = lock_map(&self.flows);
        if let Some(flow) = flows.get_mut(&self.flow_id) {
            if flow.epoch == self.epoch {
                flow.guards.release(self.kind);
            }
        }
    }
}

/// The orchestrating core: computes the next phase from lookup, credential,
/// and two-factor results, owns the race-prevention guards, and commits or
/// discards the ephemeral credential cache.
pub struct FlowEngine<B> {
    flows: Arc<Mutex<FlowMap>>,
    cache: CredentialCache,
    lookup: AccountLookupAdapter<B>,
    verifier: CredentialVerifier<B>,
    challenges: TwoFactorHandler<B>,
    timing: FlowTiming,
}

impl<B: IdentityBackend> FlowEngine<B> {
    #[must_use]
    pub fn new(backend: Arc<B>, timing: FlowTiming) -> Self {
        Self {
            flows: Arc::new(Mutex::new(HashMap::new())),
            cache: CredentialCache::new(timing.cache_ttl()),
            lookup: AccountLookupAdapter::new(Arc::clone(&backend)),
            verifier: CredentialVerifier::new(Arc::clone(&backend)),
            challenges: TwoFactorHandler::new(backend),
            timing,
        }
    }

    /// Open a new flow instance for an audience.
    #[must_use]
    pub fn begin(&self, policy: FlowPolicy) -> Uuid {
        let flow_id = Uuid::new_v4();
        let mut flows = lock_map(&self.flows);
        flows.insert(flow_id, FlowInstance::new(policy));
        info!(flow = %flow_id, audience = policy.audience().as_str(), "flow opened");
        flow_id
    }

    /// Current phase of a flow, or `SessionExpired` when it is gone or stale.
    pub fn phase(&self, flow_id: Uuid) -> Result<Phase, FlowError> {
        self.with_flow(flow_id, |flow| Ok(flow.phase))
    }

    /// Current code-check progress, if a verification attempt is tracked.
    pub fn code_check(&self, flow_id: Uuid) -> Result<Option<CodeCheckState>, FlowError> {
        self.with_flow(flow_id, |flow| Ok(flow.code_check))
    }

    /// Whether a credential draft is still cached for the flow.
    #[must_use]
    pub fn has_draft(&self, flow_id: Uuid) -> bool {
        self.cache.contains(flow_id)
    }

    /// Feed one event through the state machine.
    ///
    /// # Errors
    /// Returns `SessionExpired` when the flow instance is unknown, stale, or
    /// the result of the event raced a newer reset. Every other failure is
    /// embedded in the reply with the phase the flow stayed in.
    #[instrument(skip(self, event), fields(event = event.as_str()))]
    pub async fn submit(&self, flow_id: Uuid, event: FlowEvent) -> Result<FlowReply, FlowError> {
        let result = match event {
            FlowEvent::EmailSubmitted { email } => self.on_email(flow_id, email).await,
            FlowEvent::PasswordSubmitted {
                password,
                display_name,
            } => self.on_password(flow_id, password, display_name).await,
            FlowEvent::CodeSubmitted { code } => self.on_code(flow_id, code).await,
            FlowEvent::ResendRequested => self.on_resend(flow_id).await,
            FlowEvent::ExternalSignInCompleted {
                token,
                email,
                is_new_identity,
            } => self.on_external(flow_id, token, email, is_new_identity).await,
            FlowEvent::Abandon => self.abandon(flow_id),
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(FlowError::SessionExpired) => return Err(FlowError::SessionExpired),
            // Stay-in-phase failures are embedded so the caller still sees
            // where the flow is.
            Err(err) => FlowReply::with_error(self.phase(flow_id)?, err),
        };

        if reply.phase.is_terminal() {
            self.cache.remove(flow_id);
        }
        Ok(reply)
    }

    /// Identity watcher entry point: an identity token exists, did this flow
    /// earn it?
    ///
    /// Defers while a guard is held, while the phase does not accept the
    /// signal, or while the two-factor requirement is unsatisfied, so an
    /// externally-issued token can never cause a premature redirect.
    pub fn observe_identity_token(
        &self,
        flow_id: Uuid,
        token: IdentityToken,
    ) -> Result<ObserveOutcome, FlowError> {
        let (phase, epoch, accept) = self.with_flow(flow_id, |flow| {
            let accept = !flow.guards.any()
                && flow.phase.accepts_identity_signal()
                && flow.credential_verified
                && !flow.two_factor_pending;
            Ok((flow.phase, flow.epoch, accept))
        })?;

        if !accept {
            debug!(flow = %flow_id, phase = phase.as_str(), "identity signal deferred");
            return Ok(ObserveOutcome::Deferred(phase));
        }

        let reply = self.apply(flow_id, epoch, FlowInstance::complete, token)?;
        self.cache.remove(flow_id);
        Ok(ObserveOutcome::Completed(reply))
    }

    /// Drop stale flow instances and cache entries.
    pub fn sweep(&self) {
        let ttl = self.timing.flow_ttl();
        let mut flows = lock_map(&self.flows);
        flows.retain(|flow_id, flow| {
            let keep = flow.touched.elapsed() < ttl;
            if !keep {
                if let Some(timer) = flow.denial_timer.take() {
                    timer.abort();
                }
                self.cache.remove(*flow_id);
            }
            keep
        });
        drop(flows);
        self.cache.sweep();
    }

    /// Periodic sweeper tied to the engine lifetime.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                engine.sweep();
            }
        })
    }

    /// Commit `Authenticated`, revoking the token if the result arrived
    /// stale; a discarded result must not leave a live identity behind.
    async fn complete_or_discard(
        &self,
        flow_id: Uuid,
        epoch: u64,
        token: IdentityToken,
    ) -> Result<FlowReply, FlowError> {
        match self.apply(flow_id, epoch, FlowInstance::complete, token.clone()) {
            Ok(reply) => Ok(reply),
            Err(err) => {
                let _ = self.verifier.discard(&token).await;
                Err(err)
            }
        }
    }

    async fn on_email(&self, flow_id: Uuid, email: String) -> Result<FlowReply, FlowError> {
        let (epoch, policy) = self.with_flow(flow_id, |flow| {
            if flow.phase.is_terminal() {
                return Err(FlowError::UnexpectedEvent);
            }
            Ok((flow.epoch, flow.policy))
        })?;

        // Fresh classification on every submission; never cached across
        // phases.
        let lookup = self.lookup.lookup(policy.audience(), &email).await?;

        let reply = self.apply(flow_id, epoch, |flow, lookup: AccountLookupResult| {
            flow.reset_progress();
            flow.email = Some(email.clone());
            flow.member = lookup.member.clone();

            let routed = route_classification(&flow.policy, &lookup);
            flow.linking = routed.linking;
            flow.phase = routed.phase;
            if flow.phase == Phase::DeniedNoRole {
                self.arm_denial_timer(flow, flow_id);
            }

            let mut reply = FlowReply::at(routed.phase);
            reply.error = routed.error;
            reply.member = flow.member.clone();
            Ok(reply)
        }, lookup)?;

        // The draft belongs to the previous email.
        self.cache.remove(flow_id);
        Ok(reply)
    }

    async fn on_password(
        &self,
        flow_id: Uuid,
        password: secrecy::SecretString,
        display_name: Option<String>,
    ) -> Result<FlowReply, FlowError> {
        let (epoch, policy, phase, email, linking) = self.with_flow(flow_id, |flow| {
            if !matches!(flow.phase, Phase::PasswordEntry | Phase::PortalCreatable) {
                return Err(FlowError::UnexpectedEvent);
            }
            let email = flow.email.clone().ok_or(FlowError::UnexpectedEvent)?;
            Ok((flow.epoch, flow.policy, flow.phase, email, flow.linking))
        })?;

        if phase == Phase::PortalCreatable {
            return self
                .start_signup(flow_id, epoch, email, password, display_name)
                .await;
        }
        if linking {
            return self.link_account(flow_id, epoch, email, password).await;
        }

        let verified = match self.verifier.verify(&policy, &email, &password).await {
            Ok(verified) => verified,
            Err(err @ (FlowError::AccountNotPortalEnabled | FlowError::NoStaffRole)) => {
                // The verifier already revoked the token; show the denial.
                return self.apply(flow_id, epoch, |flow, err: FlowError| {
                    flow.phase = flow.policy.denied_access_phase();
                    if flow.phase == Phase::DeniedNoRole {
                        self.arm_denial_timer(flow, flow_id);
                    }
                    Ok(FlowReply::with_error(flow.phase, err))
                }, err);
            }
            Err(err) => return Err(err),
        };

        let flags = verified.flags.two_factor;
        if flags.active() {
            // Close the password-only session gap: revoke the token now and
            // re-authenticate from the cache once the code arrives.
            self.verifier.discard(&verified.token).await?;
            let reply = self.apply(flow_id, epoch, |flow, ()| {
                flow.credential_verified = true;
                flow.two_factor_pending = true;
                flow.code_check = Some(CodeCheckState::AwaitingCode);
                flow.phase = Phase::AwaitingCode;
                let mut reply = FlowReply::at(Phase::AwaitingCode);
                reply.member = flow.member.clone();
                Ok(reply)
            }, ())?;
            self.cache.put(
                flow_id,
                CredentialDraft {
                    email,
                    password: Some(password),
                    ..CredentialDraft::default()
                },
            );
            return Ok(reply);
        }

        if policy.requires_enrollment(flags) {
            // Staff first login: no session before the secret is bound.
            let setup = self.challenges.begin_enrollment(&verified.token).await?;
            let applied = self.apply(flow_id, epoch, |flow, setup: TwoFactorSetup| {
                flow.credential_verified = true;
                flow.two_factor_pending = true;
                flow.pending_identity = Some(verified.token.clone());
                flow.phase = Phase::SecretIssued;
                let mut reply = FlowReply::at(Phase::SecretIssued);
                reply.setup = Some(setup);
                Ok(reply)
            }, setup);
            if applied.is_err() {
                let _ = self.verifier.discard(&verified.token).await;
            }
            return applied;
        }

        self.complete_or_discard(flow_id, epoch, verified.token).await
    }

    async fn start_signup(
        &self,
        flow_id: Uuid,
        epoch: u64,
        email: String,
        password: secrecy::SecretString,
        display_name: Option<String>,
    ) -> Result<FlowReply, FlowError> {
        let name = display_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or(FlowError::UnexpectedEvent)?;

        let challenge = self.challenges.issue_email_code(&email, &name).await?;

        let reply = self.apply(flow_id, epoch, |flow, ()| {
            flow.phase = Phase::EmailVerificationPending;
            flow.last_resend = Some(Instant::now());
            Ok(FlowReply::at(Phase::EmailVerificationPending))
        }, ())?;
        self.cache.put(
            flow_id,
            CredentialDraft {
                email,
                password: Some(password),
                display_name: Some(name),
                continuation: None,
                challenge_id: Some(challenge.challenge_id),
            },
        );
        Ok(reply)
    }

    async fn link_account(
        &self,
        flow_id: Uuid,
        epoch: u64,
        email: String,
        password: secrecy::SecretString,
    ) -> Result<FlowReply, FlowError> {
        let verified = self.verifier.verify_for_link(&email, &password).await?;

        if verified.flags.two_factor.active() {
            // The enrolled second factor still applies before linking.
            self.verifier.discard(&verified.token).await?;
            let reply = self.apply(flow_id, epoch, |flow, ()| {
                flow.credential_verified = true;
                flow.two_factor_pending = true;
                flow.code_check = Some(CodeCheckState::AwaitingCode);
                flow.phase = Phase::AwaitingCode;
                Ok(FlowReply::at(Phase::AwaitingCode))
            }, ())?;
            self.cache.put(
                flow_id,
                CredentialDraft {
                    email,
                    password: Some(password),
                    ..CredentialDraft::default()
                },
            );
            return Ok(reply);
        }

        let name = self.display_name_for_link(flow_id, &email)?;
        let identity = self.verifier.establish(&email, &name, &password).await?;
        // The pre-link token has no further use.
        let _ = self.verifier.discard(&verified.token).await;
        self.complete_or_discard(flow_id, epoch, identity).await
    }

    async fn on_code(&self, flow_id: Uuid, code: String) -> Result<FlowReply, FlowError> {
        let (epoch, policy, route) = self.with_flow(flow_id, |flow| {
            let route = match flow.phase {
                Phase::AwaitingCode => CodeRoute::SecondFactor,
                Phase::EmailVerificationPending => CodeRoute::EmailChallenge,
                Phase::SecretIssued | Phase::AwaitingFirstCode => CodeRoute::Enrollment,
                _ => return Err(FlowError::UnexpectedEvent),
            };
            Ok((flow.epoch, flow.policy, route))
        })?;

        match route {
            CodeRoute::SecondFactor => {
                self.verify_second_factor(flow_id, epoch, policy, &code).await
            }
            CodeRoute::EmailChallenge => {
                self.verify_email_challenge(flow_id, epoch, policy, &code).await
            }
            CodeRoute::Enrollment => self.confirm_enrollment(flow_id, epoch, &code).await,
        }
    }

    async fn verify_second_factor(
        &self,
        flow_id: Uuid,
        epoch: u64,
        policy: FlowPolicy,
        code: &str,
    ) -> Result<FlowReply, FlowError> {
        self.with_flow(flow_id, |flow| {
            if !flow.guards.acquire(GuardKind::TwoFactorCheck) {
                return Err(FlowError::UnexpectedEvent);
            }
            flow.code_check = Some(CodeCheckState::Verifying);
            Ok(())
        })?;
        let _hold = GuardHold {
            flows: Arc::clone(&self.flows),
            flow_id,
            kind: GuardKind::TwoFactorCheck,
            epoch,
        };

        let Some(draft) = self.cache.get(flow_id) else {
            // Never silently resume with stale credentials.
            return self.expire_to_credentials(flow_id, epoch);
        };

        // Re-authenticate from the cached draft so the session is bound to
        // this very verification.
        let reauth = if let Some(continuation) = draft.continuation.as_ref() {
            self.verifier.resolve(&policy, continuation).await
        } else if let Some(password) = draft.password.as_ref() {
            self.verifier.verify(&policy, &draft.email, password).await
        } else {
            return self.expire_to_credentials(flow_id, epoch);
        };

        let verified = match reauth {
            Ok(verified) => verified,
            Err(err @ (FlowError::NetworkFailure | FlowError::TooManyAttempts)) => {
                self.mark_code_check(flow_id, CodeCheckState::AwaitingCode);
                return Err(err);
            }
            Err(err) => {
                // The cached credential no longer verifies; back to the
                // credential phase.
                self.cache.remove(flow_id);
                return self.apply(flow_id, epoch, |flow, err: FlowError| {
                    flow.credential_verified = false;
                    flow.two_factor_pending = false;
                    flow.code_check = None;
                    flow.guards.clear();
                    flow.phase = Phase::PasswordEntry;
                    Ok(FlowReply::with_error(Phase::PasswordEntry, err))
                }, err);
            }
        };

        match self.challenges.verify_code(&verified.token, code).await {
            Ok(()) => {
                let (linking, email) = self.with_flow(flow_id, |flow| {
                    Ok((flow.linking, flow.email.clone().unwrap_or_default()))
                })?;
                if linking {
                    let Some(password) = draft.password.clone() else {
                        return self.expire_to_credentials(flow_id, epoch);
                    };
                    let name = self.display_name_for_link(flow_id, &email)?;
                    let identity = self.verifier.establish(&email, &name, &password).await?;
                    let _ = self.verifier.discard(&verified.token).await;
                    let reply = self.complete_or_discard(flow_id, epoch, identity).await?;
                    self.mark_code_check(flow_id, CodeCheckState::Verified);
                    return Ok(reply);
                }
                let reply = self
                    .complete_or_discard(flow_id, epoch, verified.token)
                    .await?;
                self.mark_code_check(flow_id, CodeCheckState::Verified);
                Ok(reply)
            }
            Err(err @ (FlowError::CodeInvalid | FlowError::CodeExpired)) => {
                // The re-auth token must not survive a rejected code.
                let _ = self.verifier.discard(&verified.token).await;
                self.mark_code_check(flow_id, CodeCheckState::Rejected);
                Err(err)
            }
            Err(err) => {
                let _ = self.verifier.discard(&verified.token).await;
                self.mark_code_check(flow_id, CodeCheckState::AwaitingCode);
                Err(err)
            }
        }
    }

    async fn verify_email_challenge(
        &self,
        flow_id: Uuid,
        epoch: u64,
        policy: FlowPolicy,
        code: &str,
    ) -> Result<FlowReply, FlowError> {
        let Some(draft) = self.cache.get(flow_id) else {
            return self.expire_to_signup(flow_id, epoch);
        };
        let (Some(challenge_id), Some(password)) =
            (draft.challenge_id, draft.password.clone())
        else {
            return self.expire_to_signup(flow_id, epoch);
        };

        self.challenges.verify_email_code(challenge_id, code).await?;

        let name = draft.display_name.clone().unwrap_or_default();
        let identity = self
            .verifier
            .establish(&draft.email, &name, &password)
            .await?;

        if policy.two_factor_required() {
            // Mandatory enrollment before the first session.
            let applied = match self.challenges.begin_enrollment(&identity).await {
                Ok(setup) => self.apply(flow_id, epoch, |flow, setup: TwoFactorSetup| {
                    flow.credential_verified = true;
                    flow.two_factor_pending = true;
                    flow.pending_identity = Some(identity.clone());
                    flow.phase = Phase::SecretIssued;
                    let mut reply = FlowReply::at(Phase::SecretIssued);
                    reply.setup = Some(setup);
                    Ok(reply)
                }, setup),
                Err(err) => {
                    // The account exists; park at `AccountCreated` so a
                    // resend can retry the secret issuance.
                    self.apply(flow_id, epoch, |flow, err: FlowError| {
                        flow.credential_verified = true;
                        flow.two_factor_pending = true;
                        flow.pending_identity = Some(identity.clone());
                        flow.phase = Phase::AccountCreated;
                        Ok(FlowReply::with_error(Phase::AccountCreated, err))
                    }, err)
                }
            };
            if applied.is_err() {
                let _ = self.verifier.discard(&identity).await;
            }
            applied
        } else {
            self.complete_or_discard(flow_id, epoch, identity).await
        }
    }

    async fn confirm_enrollment(
        &self,
        flow_id: Uuid,
        epoch: u64,
        code: &str,
    ) -> Result<FlowReply, FlowError> {
        let identity = match self.with_flow(flow_id, |flow| Ok(flow.pending_identity.clone()))? {
            Some(identity) => identity,
            None => return self.expire_to_credentials(flow_id, epoch),
        };

        match self.challenges.confirm_enrollment(&identity, code).await {
            Ok(codes) => {
                let mut reply = self.complete_or_discard(flow_id, epoch, identity).await?;
                // Displayed exactly once, never retrievable again.
                reply.backup_codes = Some(codes);
                Ok(reply)
            }
            Err(err @ (FlowError::CodeInvalid | FlowError::CodeExpired)) => {
                self.apply(flow_id, epoch, |flow, err: FlowError| {
                    flow.phase = Phase::AwaitingFirstCode;
                    Ok(FlowReply::with_error(Phase::AwaitingFirstCode, err))
                }, err)
            }
            Err(err) => Err(err),
        }
    }

    async fn on_resend(&self, flow_id: Uuid) -> Result<FlowReply, FlowError> {
        let (epoch, phase, last_resend) = self.with_flow(flow_id, |flow| {
            if !matches!(
                flow.phase,
                Phase::EmailVerificationPending | Phase::SecretIssued | Phase::AccountCreated
            ) {
                return Err(FlowError::UnexpectedEvent);
            }
            Ok((flow.epoch, flow.phase, flow.last_resend))
        })?;

        if phase == Phase::EmailVerificationPending {
            if let Some(last) = last_resend {
                let cooldown = self.timing.resend_cooldown();
                if last.elapsed() < cooldown {
                    // Inside the cooldown the prior challenge stays valid.
                    let mut reply = FlowReply::at(phase);
                    reply.retry_after_seconds =
                        Some(cooldown.saturating_sub(last.elapsed()).as_secs().max(1));
                    return Ok(reply);
                }
            }
            let Some(draft) = self.cache.get(flow_id) else {
                return self.expire_to_signup(flow_id, epoch);
            };
            let name = draft.display_name.clone().unwrap_or_default();
            let challenge = self.challenges.issue_email_code(&draft.email, &name).await?;

            // One-shot challenges are replaced, never reused; codes for the
            // previous challenge now fail verification.
            self.cache.set_challenge(flow_id, challenge.challenge_id);
            return self.apply(flow_id, epoch, |flow, ()| {
                flow.last_resend = Some(Instant::now());
                Ok(FlowReply::at(Phase::EmailVerificationPending))
            }, ());
        }

        // SecretIssued / AccountCreated: re-issue the two-factor secret.
        let identity = match self.with_flow(flow_id, |flow| Ok(flow.pending_identity.clone()))? {
            Some(identity) => identity,
            None => return self.expire_to_credentials(flow_id, epoch),
        };
        let setup = self.challenges.begin_enrollment(&identity).await?;
        self.apply(flow_id, epoch, |flow, setup: TwoFactorSetup| {
            flow.phase = Phase::SecretIssued;
            let mut reply = FlowReply::at(Phase::SecretIssued);
            reply.setup = Some(setup);
            Ok(reply)
        }, setup)
    }

    async fn on_external(
        &self,
        flow_id: Uuid,
        token: IdentityToken,
        email: String,
        is_new_identity: bool,
    ) -> Result<FlowReply, FlowError> {
        let (epoch, policy) = self.with_flow(flow_id, |flow| {
            if !matches!(flow.phase, Phase::EmailEntry | Phase::PasswordEntry) {
                return Err(FlowError::UnexpectedEvent);
            }
            if !flow.guards.acquire(GuardKind::ExternalSignIn) {
                return Err(FlowError::UnexpectedEvent);
            }
            Ok((flow.epoch, flow.policy))
        })?;
        let _hold = GuardHold {
            flows: Arc::clone(&self.flows),
            flow_id,
            kind: GuardKind::ExternalSignIn,
            epoch,
        };

        debug!(flow = %flow_id, is_new_identity, "external sign-in completed");

        // Both entry paths obey one authorization policy: classify the
        // provider email through the same lookup adapter first.
        let lookup = self.lookup.lookup(policy.audience(), &email).await?;

        if !lookup.has_account {
            // The provider identity has no account here; it must not linger.
            let _ = self.verifier.discard(&token).await;
            return self.apply(flow_id, epoch, |flow, lookup: AccountLookupResult| {
                flow.reset_progress();
                flow.email = Some(email.clone());
                flow.member = lookup.member.clone();
                flow.phase = if lookup.can_create_portal {
                    Phase::PortalCreatable
                } else {
                    Phase::DeniedNoAccount
                };
                let mut reply = FlowReply::at(flow.phase);
                reply.member = flow.member.clone();
                Ok(reply)
            }, lookup);
        }

        if !lookup.has_access {
            if policy.audience() == Audience::MemberPortal && lookup.can_create_portal {
                // Portal linking still requires the password proof.
                let _ = self.verifier.discard(&token).await;
                return self.apply(flow_id, epoch, |flow, lookup: AccountLookupResult| {
                    flow.reset_progress();
                    flow.email = Some(email.clone());
                    flow.member = lookup.member.clone();
                    flow.linking = true;
                    flow.phase = Phase::PasswordEntry;
                    let mut reply = FlowReply::at(Phase::PasswordEntry);
                    reply.member = flow.member.clone();
                    Ok(reply)
                }, lookup);
            }
            let _ = self.verifier.discard(&token).await;
            let err = match policy.audience() {
                Audience::MemberPortal => FlowError::AccountNotPortalEnabled,
                Audience::StaffConsole => FlowError::NoStaffRole,
            };
            return self.apply(flow_id, epoch, |flow, err: FlowError| {
                flow.email = Some(email.clone());
                flow.phase = flow.policy.denied_access_phase();
                if flow.phase == Phase::DeniedNoRole {
                    self.arm_denial_timer(flow, flow_id);
                }
                Ok(FlowReply::with_error(flow.phase, err))
            }, err);
        }

        // Bind profile flags to the provider token; unauthorized tokens are
        // revoked inside the verifier.
        let verified = match self.verifier.resolve(&policy, &token).await {
            Ok(verified) => verified,
            Err(err @ (FlowError::AccountNotPortalEnabled | FlowError::NoStaffRole)) => {
                return self.apply(flow_id, epoch, |flow, err: FlowError| {
                    flow.email = Some(email.clone());
                    flow.phase = flow.policy.denied_access_phase();
                    if flow.phase == Phase::DeniedNoRole {
                        self.arm_denial_timer(flow, flow_id);
                    }
                    Ok(FlowReply::with_error(flow.phase, err))
                }, err);
            }
            Err(err) => return Err(err),
        };

        let flags = verified.flags.two_factor;
        if flags.active() {
            // The continuation is held server-side; the client sees no
            // session until the code verifies.
            let applied = self.apply(flow_id, epoch, |flow, lookup: AccountLookupResult| {
                flow.email = Some(email.clone());
                flow.member = lookup.member.clone();
                flow.credential_verified = true;
                flow.two_factor_pending = true;
                flow.code_check = Some(CodeCheckState::AwaitingCode);
                flow.guards.release(GuardKind::ExternalSignIn);
                flow.phase = Phase::AwaitingCode;
                let mut reply = FlowReply::at(Phase::AwaitingCode);
                reply.member = flow.member.clone();
                Ok(reply)
            }, lookup);
            return match applied {
                Ok(reply) => {
                    self.cache.put(
                        flow_id,
                        CredentialDraft {
                            email,
                            continuation: Some(verified.token),
                            ..CredentialDraft::default()
                        },
                    );
                    Ok(reply)
                }
                Err(err) => {
                    let _ = self.verifier.discard(&verified.token).await;
                    Err(err)
                }
            };
        }

        if policy.requires_enrollment(flags) {
            let setup = self.challenges.begin_enrollment(&verified.token).await?;
            let applied = self.apply(flow_id, epoch, |flow, setup: TwoFactorSetup| {
                flow.email = Some(email.clone());
                flow.credential_verified = true;
                flow.two_factor_pending = true;
                flow.pending_identity = Some(verified.token.clone());
                flow.guards.release(GuardKind::ExternalSignIn);
                flow.phase = Phase::SecretIssued;
                let mut reply = FlowReply::at(Phase::SecretIssued);
                reply.setup = Some(setup);
                Ok(reply)
            }, setup);
            if applied.is_err() {
                let _ = self.verifier.discard(&verified.token).await;
            }
            return applied;
        }

        let token = verified.token.clone();
        let applied = self.apply(flow_id, epoch, |flow, token: IdentityToken| {
            flow.email = Some(email.clone());
            flow.member = lookup.member.clone();
            flow.complete(token)
        }, verified.token);
        if applied.is_err() {
            let _ = self.verifier.discard(&token).await;
        }
        applied
    }

    fn abandon(&self, flow_id: Uuid) -> Result<FlowReply, FlowError> {
        let mut flows = lock_map(&self.flows);
        let Some(flow) = flows.remove(&flow_id) else {
            return Err(FlowError::SessionExpired);
        };
        if let Some(timer) = flow.denial_timer {
            timer.abort();
        }
        drop(flows);
        self.cache.remove(flow_id);
        info!(flow = %flow_id, "flow abandoned");
        Ok(FlowReply::at(Phase::Abandoned))
    }

    /// The denial message is readable for a bounded window, then the flow is
    /// forced back to anonymous. The task dies with the flow instance.
    fn arm_denial_timer(&self, flow: &mut FlowInstance, flow_id: Uuid) {
        let Some(delay) = flow.policy.auto_expire_denial() else {
            return;
        };
        if let Some(previous) = flow.denial_timer.take() {
            previous.abort();
        }
        let flows = Arc::clone(&self.flows);
        let cache = self.cache.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut flows = lock_map(&flows);
            if let Some(flow) = flows.get_mut(&flow_id) {
                debug!(flow = %flow_id, "denial expired into forced sign-out");
                flow.epoch += 1;
                flow.phase = Phase::Abandoned;
                flow.guards.clear();
                flow.denial_timer = None;
            }
            drop(flows);
            cache.remove(flow_id);
        });
        flow.denial_timer = Some(handle.abort_handle());
    }

    fn expire_to_credentials(&self, flow_id: Uuid, epoch: u64) -> Result<FlowReply, FlowError> {
        self.cache.remove(flow_id);
        self.apply(flow_id, epoch, |flow, ()| {
            flow.credential_verified = false;
            flow.two_factor_pending = false;
            flow.code_check = None;
            flow.pending_identity = None;
            flow.guards.clear();
            flow.phase = Phase::PasswordEntry;
            Ok(FlowReply::with_error(
                Phase::PasswordEntry,
                FlowError::SessionExpired,
            ))
        }, ())
    }

    fn expire_to_signup(&self, flow_id: Uuid, epoch: u64) -> Result<FlowReply, FlowError> {
        self.cache.remove(flow_id);
        self.apply(flow_id, epoch, |flow, ()| {
            flow.phase = Phase::PortalCreatable;
            Ok(FlowReply::with_error(
                Phase::PortalCreatable,
                FlowError::SessionExpired,
            ))
        }, ())
    }

    fn mark_code_check(&self, flow_id: Uuid, state: CodeCheckState) {
        let mut flows = lock_map(&self.flows);
        if let Some(flow) = flows.get_mut(&flow_id) {
            flow.code_check = Some(state);
        }
    }

    fn display_name_for_link(&self, flow_id: Uuid, email: &str) -> Result<String, FlowError> {
        self.with_flow(flow_id, |flow| {
            Ok(flow
                .member
                .as_ref()
                .map(|member| format!("{} {}", member.first_name, member.last_name))
                .unwrap_or_else(|| email.to_string()))
        })
    }

    fn with_flow<T>(
        &self,
        flow_id: Uuid,
        f: impl FnOnce(&mut FlowInstance) -> Result<T, FlowError>,
    ) -> Result<T, FlowError> {
        let mut flows = lock_map(&self.flows);
        let stale = flows
            .get(&flow_id)
            .is_some_and(|flow| flow.touched.elapsed() > self.timing.flow_ttl());
        if stale {
            if let Some(flow) = flows.remove(&flow_id) {
                if let Some(timer) = flow.denial_timer {
                    timer.abort();
                }
            }
            drop(flows);
            self.cache.remove(flow_id);
            return Err(FlowError::SessionExpired);
        }
        let flow = flows.get_mut(&flow_id).ok_or(FlowError::SessionExpired)?;
        flow.touched = Instant::now();
        f(flow)
    }

    /// Apply the result of an async step, unless the instance moved on while
    /// the step was in flight.
    fn apply<T, V>(
        &self,
        flow_id: Uuid,
        epoch: u64,
        f: impl FnOnce(&mut FlowInstance, V) -> Result<T, FlowError>,
        value: V,
    ) -> Result<T, FlowError> {
        let mut flows = lock_map(&self.flows);
        let flow = flows.get_mut(&flow_id).ok_or(FlowError::SessionExpired)?;
        if flow.epoch != epoch {
            debug!(flow = %flow_id, "stale result discarded");
            return Err(FlowError::SessionExpired);
        }
        flow.touched = Instant::now();
        flow.epoch += 1;
        f(flow, value)
    }
}

/// Routed outcome of an account classification.
struct RoutedClassification {
    phase: Phase,
    error: Option<FlowError>,
    linking: bool,
}

/// Pure routing table from classification to phase; the side-effect-free
/// half of the reducer.
fn route_classification(
    policy: &FlowPolicy,
    lookup: &AccountLookupResult,
) -> RoutedClassification {
    if lookup.has_account {
        if lookup.has_access {
            return RoutedClassification {
                phase: Phase::PasswordEntry,
                error: None,
                linking: false,
            };
        }
        return match policy.audience() {
            Audience::MemberPortal if lookup.can_create_portal => RoutedClassification {
                // The password proof comes first, then the portal link.
                phase: Phase::PasswordEntry,
                error: None,
                linking: true,
            },
            Audience::MemberPortal => RoutedClassification {
                phase: Phase::DeniedNoAccount,
                error: Some(FlowError::AccountNotPortalEnabled),
                linking: false,
            },
            Audience::StaffConsole => RoutedClassification {
                phase: Phase::DeniedNoRole,
                error: Some(FlowError::NoStaffRole),
                linking: false,
            },
        };
    }

    if lookup.can_create_portal {
        return RoutedClassification {
            phase: Phase::PortalCreatable,
            error: None,
            linking: false,
        };
    }

    RoutedClassification {
        phase: Phase::DeniedNoAccount,
        error: None,
        linking: false,
    }
}
