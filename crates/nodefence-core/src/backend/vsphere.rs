//! Guest power control through a vCenter REST endpoint.
//!
//! Every successful login is paired with a logout. The session lives in a
//! guard whose drop path terminates it, so the power-off, the state poll, an
//! interrupt or an unexpected early return all end the session. A logout
//! failure is logged and never changes the fencing outcome.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use super::{FailureReason, FenceOutcome};
use crate::config::VirtualizedHostConfig;
use crate::credentials::{CredentialConfig, Credentials};
use crate::interrupt::InterruptFlag;

/// Power state reported for a guest that is off.
pub const POWERED_OFF: &str = "POWERED_OFF";

/// Header carrying the session token.
const SESSION_HEADER: &str = "vmware-api-session-id";

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Errors talking to the management API.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ApiError {
    /// The request never got an HTTP response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The API answered with an error status or error payload.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error type or body.
        message: String,
    },

    /// The response body was not what the API documents.
    #[error("unexpected response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

/// Opaque API session token.
#[derive(Debug, Clone)]
pub struct SessionToken(SecretString);

impl SessionToken {
    /// Wraps a token string.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    /// The token value, for request headers.
    #[must_use]
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

/// Virtualization management API.
pub trait VirtApi: Send + Sync {
    /// Opens a session.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or rejected credentials.
    fn login(&self, host: &str, credentials: &Credentials) -> Result<SessionToken, ApiError>;

    /// Requests a hard power-off of `guest`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or an API error.
    fn power_off(&self, host: &str, session: &SessionToken, guest: &str) -> Result<(), ApiError>;

    /// Reads the power state of `guest`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, an API error or a malformed
    /// body.
    fn power_state(
        &self,
        host: &str,
        session: &SessionToken,
        guest: &str,
    ) -> Result<String, ApiError>;

    /// Terminates the session.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or an API error.
    fn logout(&self, host: &str, session: &SessionToken) -> Result<(), ApiError>;
}

#[derive(Debug, Deserialize)]
struct ValueEnvelope<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct PowerInfo {
    state: String,
}

/// [`VirtApi`] for the vCenter REST API.
///
/// The HTTP client is built on first use, so hosts without a vCenter-backed
/// node never initialise the TLS stack.
#[derive(Debug, Clone)]
pub struct RestVirtApi {
    connect_timeout: Duration,
    request_timeout: Duration,
    accept_invalid_certs: bool,
    client: OnceLock<Result<Client, ApiError>>,
}

impl RestVirtApi {
    /// Captures the HTTP settings from the virtualized-host configuration.
    #[must_use]
    pub fn new(config: &VirtualizedHostConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            accept_invalid_certs: config.accept_invalid_certs,
            client: OnceLock::new(),
        }
    }

    /// The shared HTTP client; a build failure is kept and returned to every
    /// caller as a transport error.
    fn client(&self) -> Result<&Client, ApiError> {
        self.client
            .get_or_init(|| {
                Client::builder()
                    .connect_timeout(self.connect_timeout)
                    .timeout(self.request_timeout)
                    .danger_accept_invalid_certs(self.accept_invalid_certs)
                    .build()
                    .map_err(ApiError::from)
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    /// `https://<host>/rest/<segments...>`, each segment percent-encoded.
    fn url(host: &str, segments: &[&str]) -> Result<Url, ApiError> {
        let base = if host.contains("://") {
            host.to_string()
        } else {
            format!("https://{host}")
        };
        let mut url =
            Url::parse(&base).map_err(|e| ApiError::Parse(format!("bad API host {host}: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| ApiError::Parse(format!("API host {host} cannot carry a path")))?
            .pop_if_empty()
            .push("rest")
            .extend(segments);
        Ok(url)
    }

    fn send(request: RequestBuilder) -> Result<Option<serde_json::Value>, ApiError> {
        let response = request.send()?;
        let status = response.status();
        let body = response.text()?;

        let json: Option<serde_json::Value> = if body.trim().is_empty() {
            None
        } else {
            serde_json::from_str(&body).ok()
        };

        // vCenter reports errors as {"type": "com.vmware.vapi.std.errors.*", ...}
        let error_type = json
            .as_ref()
            .and_then(|v| v.get("type"))
            .and_then(serde_json::Value::as_str)
            .filter(|t| t.contains("error"));

        if !status.is_success() || error_type.is_some() {
            return Err(ApiError::Api {
                status: status.as_u16(),
                message: error_type.map_or_else(|| body.trim().to_string(), str::to_string),
            });
        }
        Ok(json)
    }

    fn value<T: DeserializeOwned>(json: Option<serde_json::Value>) -> Result<T, ApiError> {
        let json = json.ok_or_else(|| ApiError::Parse("empty body".to_string()))?;
        serde_json::from_value::<ValueEnvelope<T>>(json)
            .map(|envelope| envelope.value)
            .map_err(|e| ApiError::Parse(e.to_string()))
    }
}

impl VirtApi for RestVirtApi {
    fn login(&self, host: &str, credentials: &Credentials) -> Result<SessionToken, ApiError> {
        let url = Self::url(host, &["com", "vmware", "cis", "session"])?;
        let request = self.client()?.post(url).basic_auth(
            &credentials.username,
            Some(credentials.password.expose_secret()),
        );
        let token: String = Self::value(Self::send(request)?)?;
        Ok(SessionToken::new(token))
    }

    fn power_off(&self, host: &str, session: &SessionToken, guest: &str) -> Result<(), ApiError> {
        let url = Self::url(host, &["vcenter", "vm", guest, "power", "stop"])?;
        let request = self.client()?.post(url);
        Self::send(request.header(SESSION_HEADER, session.expose()))?;
        Ok(())
    }

    fn power_state(
        &self,
        host: &str,
        session: &SessionToken,
        guest: &str,
    ) -> Result<String, ApiError> {
        let url = Self::url(host, &["vcenter", "vm", guest, "power"])?;
        let request = self.client()?.get(url);
        let json = Self::send(request.header(SESSION_HEADER, session.expose()))?;
        let info: PowerInfo = Self::value(json)?;
        Ok(info.state)
    }

    fn logout(&self, host: &str, session: &SessionToken) -> Result<(), ApiError> {
        let url = Self::url(host, &["com", "vmware", "cis", "session"])?;
        let request = self.client()?.delete(url);
        Self::send(request.header(SESSION_HEADER, session.expose()))?;
        Ok(())
    }
}

/// Open API session; terminated when dropped.
struct Session<'a, V: VirtApi> {
    api: &'a V,
    host: &'a str,
    token: SessionToken,
    terminated: bool,
}

impl<'a, V: VirtApi> Session<'a, V> {
    const fn new(api: &'a V, host: &'a str, token: SessionToken) -> Self {
        Self {
            api,
            host,
            token,
            terminated: false,
        }
    }

    fn end(mut self) {
        self.terminate();
    }

    fn terminate(&mut self) {
        if std::mem::replace(&mut self.terminated, true) {
            return;
        }
        match self.api.logout(self.host, &self.token) {
            Ok(()) => debug!(host = self.host, "vsphere session terminated"),
            Err(e) => warn!(host = self.host, error = %e, "vsphere session logout failed"),
        }
    }
}

impl<V: VirtApi> Drop for Session<'_, V> {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Why a read-only self-test check failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VirtCheckError {
    /// Credentials did not decode; no request was sent.
    #[error("bad credentials: {0}")]
    Credentials(String),
    /// Login was rejected or failed.
    #[error("login failed: {0}")]
    Auth(String),
    /// Login worked but the state query failed.
    #[error("power state query failed: {0}")]
    Query(String),
}

/// Virtualized host control driver.
pub struct VirtualizedHostDriver<V> {
    api: V,
    credentials: CredentialConfig,
    settle: Duration,
    interrupt: InterruptFlag,
}

impl<V: VirtApi> VirtualizedHostDriver<V> {
    /// Creates a driver.
    #[must_use]
    pub fn new(api: V, config: &VirtualizedHostConfig, interrupt: InterruptFlag) -> Self {
        Self {
            api,
            credentials: config.credentials.clone(),
            settle: config.settle,
            interrupt,
        }
    }

    fn credentials(&self) -> Result<Credentials, FailureReason> {
        self.credentials
            .decode()
            .map_err(|e| FailureReason::BadCredentials(e.to_string()))
    }

    /// Validates credentials without contacting the API.
    ///
    /// # Errors
    ///
    /// Returns [`FailureReason::BadCredentials`] when they do not decode.
    pub fn preflight(&self) -> Result<(), FailureReason> {
        self.credentials().map(|_| ())
    }

    /// Powers `guest_id` off through `api_host` and confirms the state.
    pub fn power_off_and_confirm(&self, api_host: &str, guest_id: &str) -> FenceOutcome {
        let credentials = match self.credentials() {
            Ok(credentials) => credentials,
            Err(reason) => {
                error!(api_host, guest_id, %reason, "vsphere credentials unusable");
                return FenceOutcome::Failed(reason);
            },
        };

        let token = match self.api.login(api_host, &credentials) {
            Ok(token) => token,
            Err(e) => {
                error!(api_host, error = %e, "vsphere login {api_host} failed");
                return FenceOutcome::Failed(FailureReason::AuthError(e.to_string()));
            },
        };

        let session = Session::new(&self.api, api_host, token);
        let outcome = self.fence_in_session(&session, guest_id);
        session.end();
        outcome
    }

    fn fence_in_session(&self, session: &Session<'_, V>, guest_id: &str) -> FenceOutcome {
        let api_host = session.host;
        if self.interrupt.is_raised() {
            warn!(api_host, guest_id, "interrupted before power off");
            return FenceOutcome::Failed(FailureReason::Interrupted);
        }

        info!(api_host, guest_id, "vsphere power off");
        if let Err(e) = self.api.power_off(api_host, &session.token, guest_id) {
            error!(api_host, guest_id, error = %e, "vsphere off {guest_id} failed");
            return FenceOutcome::Failed(FailureReason::CommandError(format!(
                "vsphere off {guest_id}: {e}"
            )));
        }

        if !self.settle_interruptibly() {
            warn!(api_host, guest_id, "interrupted while waiting for power off");
            return FenceOutcome::Failed(FailureReason::Interrupted);
        }

        match self.api.power_state(api_host, &session.token, guest_id) {
            Ok(state) if state == POWERED_OFF => {
                info!(api_host, guest_id, %state, "vsphere power confirmed off");
                FenceOutcome::Confirmed
            },
            Ok(state) => {
                let reason = format!("vsphere stat {guest_id} {state}, not off");
                error!(api_host, guest_id, %state, "{reason}");
                FenceOutcome::Failed(FailureReason::NotConfirmedOff(reason))
            },
            Err(e) => {
                let reason = format!("vsphere stat {guest_id}: {e}");
                error!(api_host, guest_id, error = %e, "{reason}");
                FenceOutcome::Failed(FailureReason::NotConfirmedOff(reason))
            },
        }
    }

    /// Sleeps for the settle period; false if interrupted meanwhile.
    fn settle_interruptibly(&self) -> bool {
        let deadline = Instant::now() + self.settle;
        loop {
            if self.interrupt.is_raised() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    /// Logs in, reads the guest's power state and logs out.
    ///
    /// # Errors
    ///
    /// Returns which step failed; [`VirtCheckError::Auth`] means the login
    /// itself was rejected.
    pub fn check(&self, api_host: &str, guest_id: &str) -> Result<String, VirtCheckError> {
        let credentials = self
            .credentials()
            .map_err(|r| VirtCheckError::Credentials(r.to_string()))?;
        let token = self
            .api
            .login(api_host, &credentials)
            .map_err(|e| VirtCheckError::Auth(e.to_string()))?;
        let session = Session::new(&self.api, api_host, token);
        let state = self
            .api
            .power_state(api_host, &session.token, guest_id)
            .map_err(|e| VirtCheckError::Query(e.to_string()));
        session.end();
        state
    }
}
