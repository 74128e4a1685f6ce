//! Drives one attendance attempt end to end.
//!
//! `Attendance` feeds the session the completions of the camera, the
//! detection channel and the server. The session lock is only taken for
//! synchronous transitions and is never held across an `.await`.

use crate::api::{ApiError, AttendanceApi, Confirmation};
use crate::capture::{CaptureError, CaptureSource};
use crate::channel::{ChannelError, DetectionChannel, Readiness};
use crate::session::{
    CaptureSession, ConfirmationCompletion, DetectionCompletion, Phase, Rejection, SessionError,
};
use faceattend_core::{Match, Roster};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("detection failed: {0}")]
    Channel(#[from] ChannelError),
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("employee roster unavailable: {0}")]
    RosterUnavailable(#[source] ApiError),
    #[error("could not confirm attendance: {0}")]
    Confirmation(#[source] ApiError),
    #[error("session expired, please log in again")]
    SessionExpired,
    #[error("timed out waiting for the server")]
    Timeout,
    #[error("attempt was reset")]
    Superseded,
}

impl AttendanceError {
    /// Whether the caller must send the user through login again.
    pub fn needs_login(&self) -> bool {
        matches!(self, AttendanceError::SessionExpired)
    }
}

/// Result of one capture-and-detect attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    Matched(Match),
    Rejected(Rejection),
    /// A reset overtook the attempt; its result was discarded.
    Superseded,
}

pub struct Attendance {
    session: Mutex<CaptureSession>,
    channel: DetectionChannel,
    api: Arc<dyn AttendanceApi>,
    camera: Arc<dyn CaptureSource>,
    roster: RwLock<Option<Arc<Roster>>>,
    request_timeout: Duration,
}

impl Attendance {
    pub fn new(
        channel: DetectionChannel,
        api: Arc<dyn AttendanceApi>,
        camera: Arc<dyn CaptureSource>,
        threshold: f32,
        request_timeout: Duration,
    ) -> Self {
        Self {
            session: Mutex::new(CaptureSession::new(threshold)),
            channel,
            api,
            camera,
            roster: RwLock::new(None),
            request_timeout,
        }
    }

    fn session(&self) -> MutexGuard<'_, CaptureSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase(&self) -> Phase {
        self.session().phase()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.session().subscribe()
    }

    pub fn readiness(&self) -> Readiness {
        self.channel.readiness()
    }

    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), AttendanceError> {
        Ok(self.channel.wait_ready(timeout).await?)
    }

    /// The roster snapshot new attempts are matched against.
    pub fn roster(&self) -> Option<Arc<Roster>> {
        self.roster
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fetch the roster and swap it in. On failure the previous snapshot
    /// is kept.
    pub async fn reload_roster(&self) -> Result<Arc<Roster>, AttendanceError> {
        let fetched = tokio::time::timeout(self.request_timeout, self.api.fetch_roster()).await;
        let roster = match fetched {
            Ok(Ok(roster)) => Arc::new(roster),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "roster fetch failed");
                return Err(match e {
                    ApiError::SessionExpired => AttendanceError::SessionExpired,
                    ApiError::Timeout => AttendanceError::Timeout,
                    other => AttendanceError::RosterUnavailable(other),
                });
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.request_timeout, "roster fetch timed out");
                return Err(AttendanceError::Timeout);
            }
        };

        *self.roster.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&roster));
        tracing::info!(identities = roster.len(), "roster loaded");
        Ok(roster)
    }

    /// Capture a photo, detect a face in it and match it against the roster.
    pub async fn capture_and_detect(&self) -> Result<AttemptOutcome, AttendanceError> {
        let roster = self.roster();
        let ready = self.channel.is_ready();
        let ticket = self.session().start_capture(roster, ready)?;

        let image = match self.camera.capture().await {
            Ok(image) => image,
            Err(e) => {
                if self.session().capture_failed(ticket, e.to_string()) {
                    return Err(e.into());
                }
                return Ok(AttemptOutcome::Superseded);
            }
        };

        let Some(correlation) = self.session().image_ready(ticket, image.clone()) else {
            return Ok(AttemptOutcome::Superseded);
        };

        let detection = self.channel.detect(correlation, &image).await;
        let completion = self.session().detection_completed(correlation, detection);
        match completion {
            DetectionCompletion::Matched(result) => Ok(AttemptOutcome::Matched(result)),
            DetectionCompletion::Rejected(rejection) => Ok(AttemptOutcome::Rejected(rejection)),
            DetectionCompletion::Failed(e) => Err(e.into()),
            DetectionCompletion::Stale => Ok(AttemptOutcome::Superseded),
        }
    }

    /// Confirm the current match with the server.
    ///
    /// On any failure the session returns to `Matched` and the call may be
    /// repeated.
    pub async fn confirm(&self) -> Result<Confirmation, AttendanceError> {
        let (ticket, identity) = self.session().confirm()?;

        let result =
            match tokio::time::timeout(self.request_timeout, self.api.confirm_attendance(&identity.id))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ApiError::Timeout),
            };

        let completion = self.session().confirmation_completed(ticket, result);
        match completion {
            ConfirmationCompletion::Confirmed(confirmation) => Ok(confirmation),
            ConfirmationCompletion::Retryable(ApiError::SessionExpired) => {
                Err(AttendanceError::SessionExpired)
            }
            ConfirmationCompletion::Retryable(ApiError::Timeout) => Err(AttendanceError::Timeout),
            ConfirmationCompletion::Retryable(e) => Err(AttendanceError::Confirmation(e)),
            ConfirmationCompletion::Stale => Err(AttendanceError::Superseded),
        }
    }

    /// Discard the current attempt. An outstanding extractor request is
    /// cancelled; its answer will not reach any later attempt.
    pub async fn reset(&self) {
        let pending = self.session().reset();
        if let Some(id) = pending {
            tracing::debug!(%id, "cancelling in-flight detection");
            self.channel.cancel(id).await;
        }
    }
}
