//! Cloud transport.
//!
//! The cloud portal is reached through the [`CloudApi`] seam: a login that
//! trades credentials for a session, and an authenticated request function.
//! [`CloudTransport`] adds the retry policy on top of it:
//!
//! * an expired session is renewed once per call, a second expiry is fatal;
//! * transient failures are retried with exponential backoff, and the retry
//!   counter survives the re-authentication;
//! * permanent failures and decode errors are surfaced immediately;
//! * writes are never retried after a transient failure.

use crate::{
    error::{Error, Result},
    planner::Chunk,
    register::{Category, RegisterKind},
    retry::RetryPolicy,
    transport::{DeviceAddress, RawRegisterBlock, RecordPayload, Transport, TransportCapabilities},
};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tokio::sync::Mutex;

/// Registers per remote read, fixed by the portal.
pub const CLOUD_MAX_CHUNK: u16 = 127;

pub const LOGIN_PATH: &str = "/WManage/api/login";
pub const RUNTIME_PATH: &str = "/WManage/api/inverter/getInverterRuntime";
pub const ENERGY_PATH: &str = "/WManage/api/inverter/getInverterEnergyInfo";
pub const BATTERY_PATH: &str = "/WManage/api/battery/getBatteryInfo";
pub const REMOTE_READ_PATH: &str = "/WManage/web/maintain/remoteRead/read";
pub const REMOTE_WRITE_PATH: &str = "/WManage/web/maintain/remoteSet/write";
pub const FUNCTION_CONTROL_PATH: &str = "/WManage/web/maintain/remoteSet/functionControl";

const TRANSIENT_MARKERS: &[&str] = &["timeout", "busy", "communication", "comm_error", "try again"];
const SESSION_MARKERS: &[&str] = &["session", "login", "unauthorized", "unauthenticated"];

/// Opaque session issued by [`CloudApi::authenticate`].
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

/// Classified failure of one cloud exchange.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudFailure {
    #[error("session expired")]
    AuthExpired,

    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl From<CloudFailure> for Error {
    fn from(failure: CloudFailure) -> Self {
        match failure {
            CloudFailure::AuthExpired => Error::Authentication("session expired".into()),
            CloudFailure::Transient(message) => Error::TransientCommunication(message),
            CloudFailure::Permanent(message) => Error::Rejected(message),
            CloudFailure::Decode(message) => Error::ProtocolDecode(message),
        }
    }
}

/// Classifies an error message returned by the portal.
pub fn classify_message(message: &str) -> CloudFailure {
    let lower = message.to_ascii_lowercase();
    if TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        CloudFailure::Transient(message.to_string())
    } else if SESSION_MARKERS.iter().any(|marker| lower.contains(marker)) {
        CloudFailure::AuthExpired
    } else {
        CloudFailure::Permanent(message.to_string())
    }
}

/// Fails with the classified portal message unless `success` is true.
pub fn check_success(value: Value) -> std::result::Result<Value, CloudFailure> {
    match value.get("success").and_then(Value::as_bool) {
        Some(false) => {
            let message = value
                .get("msg")
                .or_else(|| value.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            Err(classify_message(message))
        }
        _ => Ok(value),
    }
}

/// Decodes a remote read `valueFrame`: hex bytes, each register little endian.
pub fn words_from_value_frame(frame: &str) -> Result<Vec<u16>> {
    let bytes = hex::decode(frame.trim())
        .map_err(|e| Error::ProtocolDecode(format!("invalid value frame: {e}")))?;
    if bytes.len() % 2 != 0 {
        return Err(Error::ProtocolDecode(format!(
            "value frame has an odd length of {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// The authenticated request function of the cloud portal.
#[async_trait]
pub trait CloudApi: Send + Sync + fmt::Debug {
    /// Exchanges the configured credentials for a new session.
    async fn authenticate(&self) -> std::result::Result<SessionToken, CloudFailure>;

    /// Posts `form` to `path` and returns the decoded JSON body.
    async fn request(
        &self,
        session: &SessionToken,
        path: &str,
        form: &[(&'static str, String)],
    ) -> std::result::Result<Value, CloudFailure>;
}

/// `reqwest` implementation of [`CloudApi`].
///
/// The session is the portal's `JSESSIONID` cookie, captured at login and
/// sent explicitly with every request.
#[cfg(feature = "cloud")]
#[derive(Debug, Clone)]
pub struct HttpCloudApi {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

#[cfg(feature = "cloud")]
impl HttpCloudApi {
    pub const SESSION_COOKIE: &'static str = "JSESSIONID";

    /// Builds the HTTP client. `timeout` bounds every request.
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn decode(response: reqwest::Response) -> std::result::Result<Value, CloudFailure> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(CloudFailure::AuthExpired);
        }
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CloudFailure::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(CloudFailure::Permanent(format!("HTTP {status}")));
        }
        let value = response
            .json::<Value>()
            .await
            .map_err(|e| CloudFailure::Decode(e.to_string()))?;
        check_success(value)
    }
}

#[cfg(feature = "cloud")]
fn classify_http(err: reqwest::Error) -> CloudFailure {
    if err.is_decode() {
        CloudFailure::Decode(err.to_string())
    } else if err.is_builder() {
        CloudFailure::Permanent(err.to_string())
    } else {
        CloudFailure::Transient(err.to_string())
    }
}

#[cfg(feature = "cloud")]
#[async_trait]
impl CloudApi for HttpCloudApi {
    async fn authenticate(&self) -> std::result::Result<SessionToken, CloudFailure> {
        let response = self
            .client
            .post(self.url(LOGIN_PATH))
            .form(&[("account", &self.username), ("password", &self.password)])
            .send()
            .await
            .map_err(classify_http)?;
        let cookie = response
            .cookies()
            .find(|cookie| cookie.name() == Self::SESSION_COOKIE)
            .map(|cookie| cookie.value().to_string());
        Self::decode(response).await?;
        cookie
            .map(SessionToken)
            .ok_or_else(|| CloudFailure::Decode("login response carried no session cookie".into()))
    }

    async fn request(
        &self,
        session: &SessionToken,
        path: &str,
        form: &[(&'static str, String)],
    ) -> std::result::Result<Value, CloudFailure> {
        let response = self
            .client
            .post(self.url(path))
            .header(
                reqwest::header::COOKIE,
                format!("{}={}", Self::SESSION_COOKIE, session.as_str()),
            )
            .form(form)
            .send()
            .await
            .map_err(classify_http)?;
        Self::decode(response).await
    }
}

/// [`Transport`] over the cloud portal.
#[derive(Debug)]
pub struct CloudTransport<A> {
    api: A,
    retry: RetryPolicy,
    session: Mutex<Option<SessionToken>>,
}

impl<A: CloudApi> CloudTransport<A> {
    /// Wraps `api`; the first request logs in.
    pub fn new(api: A, retry: RetryPolicy) -> Self {
        Self {
            api,
            retry,
            session: Mutex::new(None),
        }
    }

    /// The underlying request function.
    pub fn api(&self) -> &A {
        &self.api
    }

    /// Current session, logging in first if there is none.
    async fn session(&self) -> Result<SessionToken> {
        let mut session = self.session.lock().await;
        if let Some(token) = session.as_ref() {
            return Ok(token.clone());
        }
        let token = self.api.authenticate().await.map_err(login_error)?;
        *session = Some(token.clone());
        Ok(token)
    }

    /// Replaces `expired` with a fresh session unless another call already did.
    async fn reauthenticate(&self, expired: &SessionToken) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(|current| current != expired) {
            return Ok(());
        }
        log::info!("cloud session expired, logging in again");
        *session = None;
        let token = self.api.authenticate().await.map_err(login_error)?;
        *session = Some(token);
        Ok(())
    }

    /// Runs one request under the retry policy.
    ///
    /// Only idempotent requests are retried after a transient failure.
    async fn call(
        &self,
        path: &str,
        form: &[(&'static str, String)],
        idempotent: bool,
    ) -> Result<Value> {
        let mut retries = 0u32;
        let mut reauthenticated = false;
        loop {
            let session = self.session().await?;
            match self.api.request(&session, path, form).await {
                Ok(value) => return Ok(value),
                Err(CloudFailure::AuthExpired) if reauthenticated => {
                    return Err(Error::Authentication(format!(
                        "session rejected again after re-authentication ({path})"
                    )));
                }
                Err(CloudFailure::AuthExpired) => {
                    reauthenticated = true;
                    self.reauthenticate(&session).await?;
                }
                Err(failure) => {
                    let err = Error::from(failure);
                    if !idempotent || !err.is_transient() {
                        return Err(err);
                    }
                    if !self.retry.allows(retries) {
                        log::warn!("{path}: giving up after {retries} retries");
                        return Err(err);
                    }
                    let delay = self.retry.delay(retries);
                    retries += 1;
                    log::warn!(
                        "{path}: {err}, retry {retries}/{} in {}ms",
                        self.retry.max_retries,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Writes one parameter by its portal name.
    pub async fn write_named_parameter(
        &self,
        device: &DeviceAddress,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let form = [
            ("inverterSn", device.serial.clone()),
            ("holdParam", name.to_string()),
            ("valueText", value.to_string()),
        ];
        self.call(REMOTE_WRITE_PATH, &form, false).await.map(drop)
    }

    /// Toggles one named device function.
    pub async fn control_function(
        &self,
        device: &DeviceAddress,
        function: &str,
        enable: bool,
    ) -> Result<()> {
        let form = [
            ("inverterSn", device.serial.clone()),
            ("functionParam", function.to_string()),
            ("enable", enable.to_string()),
        ];
        self.call(FUNCTION_CONTROL_PATH, &form, false).await.map(drop)
    }
}

fn login_error(failure: CloudFailure) -> Error {
    match failure {
        CloudFailure::Transient(message) => Error::TransientCommunication(message),
        CloudFailure::Decode(message) => Error::ProtocolDecode(message),
        CloudFailure::AuthExpired => Error::Authentication("login rejected".into()),
        CloudFailure::Permanent(message) => Error::Authentication(message),
    }
}

#[async_trait]
impl<A: CloudApi> Transport for CloudTransport<A> {
    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            max_chunk_size: CLOUD_MAX_CHUNK,
            supports_write: true,
            is_local: false,
            concurrent_reads: true,
            record_endpoints: true,
        }
    }

    async fn read_chunk(&self, device: &DeviceAddress, chunk: Chunk) -> Result<RawRegisterBlock> {
        if chunk.kind != RegisterKind::Holding {
            return Err(Error::Unsupported("input register reads over the cloud"));
        }
        if chunk.count > CLOUD_MAX_CHUNK {
            return Err(Error::Unsupported("chunks above the remote read ceiling"));
        }
        let form = [
            ("inverterSn", device.serial.clone()),
            ("startRegister", chunk.start_address.to_string()),
            ("pointNumber", chunk.count.to_string()),
        ];
        let value = self.call(REMOTE_READ_PATH, &form, true).await?;
        let frame = value.get("valueFrame").and_then(Value::as_str).ok_or_else(|| {
            Error::ProtocolDecode("remote read response without valueFrame".into())
        })?;
        RawRegisterBlock::new(chunk, words_from_value_frame(frame)?)
    }

    async fn write_chunk(
        &self,
        device: &DeviceAddress,
        chunk: Chunk,
        values: &[u16],
    ) -> Result<()> {
        if chunk.kind != RegisterKind::Holding {
            return Err(Error::Unsupported("writes to input registers"));
        }
        if values.len() != usize::from(chunk.count) || chunk.count > CLOUD_MAX_CHUNK {
            return Err(Error::ProtocolDecode(format!(
                "{} value(s) for {chunk}",
                values.len()
            )));
        }
        let joined: Vec<String> = values.iter().map(u16::to_string).collect();
        let form = [
            ("inverterSn", device.serial.clone()),
            ("startRegister", chunk.start_address.to_string()),
            ("valueText", joined.join(",")),
        ];
        self.call(REMOTE_WRITE_PATH, &form, false).await.map(drop)
    }

    async fn fetch_record(
        &self,
        device: &DeviceAddress,
        category: Category,
    ) -> Result<RecordPayload> {
        let path = match category {
            Category::Runtime => RUNTIME_PATH,
            Category::Energy => ENERGY_PATH,
            Category::Battery => BATTERY_PATH,
            Category::Parameters => return Err(Error::Unsupported("parameter records")),
        };
        let form = [("serialNum", device.serial.clone())];
        match self.call(path, &form, true).await? {
            Value::Object(record) => Ok(record),
            other => Err(Error::ProtocolDecode(format!(
                "{category} record is not an object: {other}"
            ))),
        }
    }
}
