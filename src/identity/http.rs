//! HTTP client for the identity backend.
//!
//! One request per adapter call, JSON bodies, a bounded request timeout, and
//! the service token on every call. Transport and status errors are collapsed
//! into [`BackendError`] here so nothing above this layer handles a raw
//! `reqwest` error.

use crate::APP_USER_AGENT;
use anyhow::{anyhow, Context, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;
use uuid::Uuid;

use super::{
    AccountClassification, BackendError, CodeVerification, CreatedAccount, EmailChallenge,
    IdentityBackend, IdentityToken, ProfileFlags, TwoFactorSetup, VerifiedCredential,
};

/// Lookups and verifications that do not resolve within this window surface a
/// retryable network failure; there is no automatic retry.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpIdentityBackend {
    client: Client,
    base_url: Url,
    service_token: SecretString,
}

impl HttpIdentityBackend {
    /// Build a client against the backend base URL.
    ///
    /// # Errors
    /// Returns an error if the URL cannot be parsed or the client cannot be
    /// constructed.
    pub fn new(base_url: &str, service_token: SecretString) -> Result<Self> {
        let base_url = Url::parse(base_url).context("Error parsing identity backend URL")?;

        if base_url.host().is_none() {
            return Err(anyhow!("Error parsing identity backend URL: no host"));
        }

        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Error building identity backend client")?;

        Ok(Self {
            client,
            base_url,
            service_token,
        })
    }

    fn endpoint(&self, path: &str) -> Result<String, BackendError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|_| BackendError::Rejected(format!("invalid endpoint path: {path}")))?;

        debug!("endpoint URL: {}", path);

        Ok(url.to_string())
    }

    fn post(&self, url: &str, body: Value) -> RequestBuilder {
        self.client
            .post(url)
            .bearer_auth(self.service_token.expose_secret())
            .json(&body)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, BackendError> {
        let response = request.send().await.map_err(|_| BackendError::Network)?;
        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|_| BackendError::Rejected("invalid response body".to_string()))
    }

    async fn send_unit(&self, request: RequestBuilder) -> Result<(), BackendError> {
        let response = request.send().await.map_err(|_| BackendError::Network)?;
        check_status(response).await.map(|_| ())
    }
}

/// Normalize HTTP status codes into backend errors.
async fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    // Error bodies follow the backend convention {"errors": ["..."]}.
    let detail = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| body["errors"][0].as_str().map(str::to_string))
        .unwrap_or_default();

    Err(match status {
        StatusCode::UNAUTHORIZED => BackendError::InvalidCredential,
        StatusCode::TOO_MANY_REQUESTS => BackendError::TooManyAttempts,
        StatusCode::NOT_FOUND => BackendError::UnknownChallenge,
        StatusCode::GONE => BackendError::CodeExpired,
        StatusCode::UNPROCESSABLE_ENTITY => BackendError::CodeInvalid,
        _ if status.is_server_error() => BackendError::Network,
        _ => BackendError::Rejected(detail),
    })
}

impl IdentityBackend for HttpIdentityBackend {
    #[instrument(skip(self))]
    async fn classify_account(&self, email: &str) -> Result<AccountClassification, BackendError> {
        let url = self.endpoint("/v1/identity/classify")?;
        self.send_json(self.post(&url, json!({ "email": email }))).await
    }

    #[instrument(skip(self, password))]
    async fn verify_credential(
        &self,
        email: &str,
        password: &SecretString,
    ) -> Result<VerifiedCredential, BackendError> {
        let url = self.endpoint("/v1/identity/verify")?;
        let body = json!({ "email": email, "password": password.expose_secret() });
        let payload: TokenWithFlags = self.send_json(self.post(&url, body)).await?;
        Ok(payload.into())
    }

    #[instrument(skip(self, token))]
    async fn resolve_token(
        &self,
        token: &IdentityToken,
    ) -> Result<VerifiedCredential, BackendError> {
        let url = self.endpoint("/v1/identity/token/resolve")?;
        let body = json!({ "token": token.expose() });
        let payload: TokenWithFlags = self.send_json(self.post(&url, body)).await?;
        Ok(payload.into())
    }

    #[instrument(skip(self))]
    async fn issue_email_code(
        &self,
        email: &str,
        name: &str,
    ) -> Result<EmailChallenge, BackendError> {
        let url = self.endpoint("/v1/identity/email-code")?;
        self.send_json(self.post(&url, json!({ "email": email, "name": name })))
            .await
    }

    #[instrument(skip(self, code))]
    async fn verify_email_code(
        &self,
        challenge_id: Uuid,
        code: &str,
    ) -> Result<CodeVerification, BackendError> {
        let url = self.endpoint("/v1/identity/email-code/verify")?;
        let body = json!({ "challenge_id": challenge_id, "code": code });
        self.send_json(self.post(&url, body)).await
    }

    #[instrument(skip(self, identity))]
    async fn issue_two_factor_secret(
        &self,
        identity: &IdentityToken,
    ) -> Result<TwoFactorSetup, BackendError> {
        let url = self.endpoint("/v1/identity/two-factor/secret")?;
        self.send_json(self.post(&url, json!({ "identity": identity.expose() })))
            .await
    }

    #[instrument(skip(self, identity, code))]
    async fn verify_two_factor_code(
        &self,
        identity: &IdentityToken,
        code: &str,
    ) -> Result<CodeVerification, BackendError> {
        let url = self.endpoint("/v1/identity/two-factor/verify")?;
        let body = json!({ "identity": identity.expose(), "code": code });
        self.send_json(self.post(&url, body)).await
    }

    #[instrument(skip(self, password))]
    async fn create_or_link_account(
        &self,
        email: &str,
        name: &str,
        password: &SecretString,
    ) -> Result<CreatedAccount, BackendError> {
        let url = self.endpoint("/v1/identity/account")?;
        let body = json!({
            "email": email,
            "name": name,
            "password": password.expose_secret(),
        });
        let payload: TokenOnly = self.send_json(self.post(&url, body)).await?;
        Ok(CreatedAccount {
            identity: IdentityToken::new(payload.identity),
        })
    }

    #[instrument(skip(self, token))]
    async fn sign_out(&self, token: &IdentityToken) -> Result<(), BackendError> {
        let url = self.endpoint("/v1/identity/sign-out")?;
        self.send_unit(self.post(&url, json!({ "token": token.expose() })))
            .await
    }
}

#[derive(serde::Deserialize)]
struct TokenWithFlags {
    token: String,
    flags: ProfileFlags,
}

impl From<TokenWithFlags> for VerifiedCredential {
    fn from(payload: TokenWithFlags) -> Self {
        Self {
            token: IdentityToken::new(payload.token),
            flags: payload.flags,
        }
    }
}

#[derive(serde::Deserialize)]
struct TokenOnly {
    identity: String,
}
