//! Attendance server gateway: login, roster fetch, attendance confirmation.

use crate::credentials::{CredentialError, CredentialStore, Credentials, UserProfile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use faceattend_core::{EnrolledIdentity, IdentityId, Roster};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("session expired, please log in again")]
    SessionExpired,
    #[error("request timed out")]
    Timeout,
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),
    #[error("unexpected response from server: {0}")]
    Decode(String),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

impl ApiError {
    fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Network(e)
        }
    }
}

/// Server acknowledgement of a marked attendance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub name: String,
    /// Server-local date, as the server formats it.
    pub date: String,
    /// Server-local time, as the server formats it.
    pub time: String,
    pub received_at: DateTime<Utc>,
}

/// Remote collaborator for one attendance attempt.
#[async_trait]
pub trait AttendanceApi: Send + Sync {
    /// Fetch the enrolled roster. Failure is never an empty roster.
    async fn fetch_roster(&self) -> Result<Roster, ApiError>;

    /// Mark attendance for `identity`.
    async fn confirm_attendance(&self, identity: &IdentityId) -> Result<Confirmation, ApiError>;
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
    #[serde(default)]
    user: UserProfile,
}

/// `employees` is required: a body without it is a failed fetch, not an
/// empty roster.
#[derive(Debug, Deserialize)]
struct RosterResponse {
    employees: Vec<EnrolledIdentity>,
}

#[derive(Deserialize)]
struct ConfirmUser {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct ConfirmResponse {
    user: ConfirmUser,
    #[serde(default)]
    date: String,
    #[serde(default)]
    time: String,
}

/// JSON-over-HTTP client for the attendance server.
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
}

impl HttpApi {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ApiError::Network)?;
        let base_url: String = base_url.into();
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Exchange username and password for a token and store it.
    pub async fn login(&self, username: &str, password: &str) -> Result<Credentials, ApiError> {
        let response = self
            .client
            .post(self.url("/api/mobile/login"))
            .json(&json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        let status = response.status();
        let body = response.bytes().await.map_err(ApiError::from_transport)?;
        let login: LoginResponse = decode_response(status, &body, false)?;

        let credentials = Credentials {
            token: login.token,
            user: login.user,
            issued_at: Utc::now(),
        };
        self.credentials.set(&credentials)?;
        tracing::info!(username, "logged in");
        Ok(credentials)
    }

    pub fn logout(&self) -> Result<(), ApiError> {
        self.credentials.clear()?;
        tracing::info!("logged out");
        Ok(())
    }

    async fn send_authorized<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        let request = match self.credentials.get()? {
            Some(credentials) => request.bearer_auth(credentials.token),
            None => request,
        };

        let response = request.send().await.map_err(ApiError::from_transport)?;
        let status = response.status();
        let body = response.bytes().await.map_err(ApiError::from_transport)?;

        let decoded = decode_response(status, &body, true);
        if matches!(decoded, Err(ApiError::SessionExpired)) {
            tracing::warn!("server reported session expired; clearing credentials");
            self.credentials.clear()?;
        }
        decoded
    }
}

#[async_trait]
impl AttendanceApi for HttpApi {
    async fn fetch_roster(&self) -> Result<Roster, ApiError> {
        let response: RosterResponse = self
            .send_authorized(self.client.get(self.url("/api/mobile/employees")))
            .await?;
        let roster = Roster::new(response.employees);
        tracing::info!(
            identities = roster.len(),
            samples = roster.sample_count(),
            "roster fetched"
        );
        Ok(roster)
    }

    async fn confirm_attendance(&self, identity: &IdentityId) -> Result<Confirmation, ApiError> {
        let response: ConfirmResponse = self
            .send_authorized(
                self.client
                    .post(self.url("/api/mobile/confirm-attendance"))
                    .json(&json!({ "userId": identity })),
            )
            .await?;
        Ok(Confirmation {
            name: response.user.name,
            date: response.date,
            time: response.time,
            received_at: Utc::now(),
        })
    }
}

/// Map a status and body to a decoded value or a typed error.
///
/// `401` on an authenticated call means the stored token is no longer
/// valid; on login it is an ordinary rejection (bad password).
fn decode_response<T: DeserializeOwned>(
    status: StatusCode,
    body: &[u8],
    authenticated: bool,
) -> Result<T, ApiError> {
    if authenticated && status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::SessionExpired);
    }
    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        return Err(ApiError::Timeout);
    }
    if !status.is_success() {
        let message = serde_json::from_slice::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.error)
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            });
        return Err(ApiError::Rejected {
            status: status.as_u16(),
            message,
        });
    }
    serde_json::from_slice(body).map_err(|e| ApiError::Decode(e.to_string()))
}
