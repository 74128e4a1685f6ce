//! Capture/detection session state machine.
//!
//! `CaptureSession` is synchronous and owns no I/O. Every asynchronous step
//! (photo capture, extractor request, confirmation call) is started with a
//! [`CorrelationId`] and its completion is applied with the same id. A
//! completion carrying an id the session no longer waits for is `Stale` and
//! leaves the state untouched, which is how `reset` cancels in-flight work.

use crate::api::{ApiError, Confirmation};
use crate::capture::CapturedImage;
use crate::channel::{ChannelError, Detection};
use faceattend_core::{
    CorrelationId, EnrolledIdentity, EuclideanMatcher, Match, MatchResult, Matcher, Roster,
};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Observable position of the session, without payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Capturing,
    AwaitingDetection,
    Matched,
    Rejected,
    Failed,
    Confirming,
    Confirmed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Capturing => "capturing",
            Phase::AwaitingDetection => "awaiting detection",
            Phase::Matched => "matched",
            Phase::Rejected => "rejected",
            Phase::Failed => "failed",
            Phase::Confirming => "confirming",
            Phase::Confirmed => "confirmed",
        };
        f.write_str(name)
    }
}

/// Why a capture could not start.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    #[error("no employees are enrolled")]
    RosterEmpty,
    #[error("face models are still loading")]
    ExtractorNotReady,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("cannot start capture: {0}")]
    PreconditionNotMet(Precondition),
    #[error("cannot {action} while {phase}")]
    InvalidTransition { action: &'static str, phase: Phase },
}

/// A capture that produced no identity.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    /// The extractor found no face in the photo.
    NoFace,
    /// A face was found but no enrolled sample was within the threshold.
    BelowThreshold { closest: Option<f32> },
}

impl Rejection {
    /// Text for the person at the camera. Both kinds mean "not recognized"
    /// but point at different fixes.
    pub fn user_message(&self) -> &'static str {
        match self {
            Rejection::NoFace => {
                "No face detected. Position your face clearly in the frame and try again."
            }
            Rejection::BelowThreshold { .. } => {
                "Face not recognized. It does not match any registered employee."
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionState {
    Idle,
    Capturing {
        ticket: CorrelationId,
        roster: Arc<Roster>,
    },
    AwaitingDetection {
        correlation: CorrelationId,
        roster: Arc<Roster>,
        image: CapturedImage,
    },
    Matched {
        image: CapturedImage,
        result: Match,
    },
    Rejected(Rejection),
    Failed {
        reason: String,
    },
    Confirming {
        ticket: CorrelationId,
        image: CapturedImage,
        result: Match,
    },
    Confirmed(Confirmation),
}

impl SessionState {
    pub fn phase(&self) -> Phase {
        match self {
            SessionState::Idle => Phase::Idle,
            SessionState::Capturing { .. } => Phase::Capturing,
            SessionState::AwaitingDetection { .. } => Phase::AwaitingDetection,
            SessionState::Matched { .. } => Phase::Matched,
            SessionState::Rejected(_) => Phase::Rejected,
            SessionState::Failed { .. } => Phase::Failed,
            SessionState::Confirming { .. } => Phase::Confirming,
            SessionState::Confirmed(_) => Phase::Confirmed,
        }
    }
}

/// How a detection completion was applied.
#[derive(Debug)]
pub enum DetectionCompletion {
    Matched(Match),
    Rejected(Rejection),
    Failed(ChannelError),
    /// The session moved on (reset or a newer attempt); nothing changed.
    Stale,
}

/// How a confirmation completion was applied.
#[derive(Debug)]
pub enum ConfirmationCompletion {
    Confirmed(Confirmation),
    /// Back in `Matched`; confirmation may be retried without recapturing.
    Retryable(ApiError),
    Stale,
}

/// One attendance attempt at a time.
pub struct CaptureSession {
    state: SessionState,
    matcher: Arc<dyn Matcher + Send + Sync>,
    threshold: f32,
    phase_tx: watch::Sender<Phase>,
}

impl CaptureSession {
    pub fn new(threshold: f32) -> Self {
        Self::with_matcher(Arc::new(EuclideanMatcher), threshold)
    }

    pub fn with_matcher(matcher: Arc<dyn Matcher + Send + Sync>, threshold: f32) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Idle);
        Self {
            state: SessionState::Idle,
            matcher,
            threshold,
            phase_tx,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Phase notifications for presentation layers.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    /// The current match; present only while matched or confirming.
    pub fn match_result(&self) -> Option<&Match> {
        match &self.state {
            SessionState::Matched { result, .. } | SessionState::Confirming { result, .. } => {
                Some(result)
            }
            _ => None,
        }
    }

    /// The photo of the current attempt, once captured.
    pub fn image(&self) -> Option<&CapturedImage> {
        match &self.state {
            SessionState::AwaitingDetection { image, .. }
            | SessionState::Matched { image, .. }
            | SessionState::Confirming { image, .. } => Some(image),
            _ => None,
        }
    }

    /// Begin an attempt against `roster`, which stays the attempt's snapshot
    /// even if the caller reloads its roster meanwhile.
    ///
    /// Legal from `Idle`, and from `Rejected`/`Failed` which are retryable.
    /// Returns the ticket the capture completion must present.
    pub fn start_capture(
        &mut self,
        roster: Option<Arc<Roster>>,
        extractor_ready: bool,
    ) -> Result<CorrelationId, SessionError> {
        let phase = self.phase();
        if !matches!(phase, Phase::Idle | Phase::Rejected | Phase::Failed) {
            return Err(SessionError::InvalidTransition {
                action: "start capture",
                phase,
            });
        }

        let roster = match roster {
            Some(roster) if !roster.is_empty() => roster,
            _ => return Err(SessionError::PreconditionNotMet(Precondition::RosterEmpty)),
        };
        if !extractor_ready {
            return Err(SessionError::PreconditionNotMet(Precondition::ExtractorNotReady));
        }

        let ticket = CorrelationId::next();
        tracing::info!(%ticket, identities = roster.len(), "capture started");
        self.transition(SessionState::Capturing { ticket, roster });
        Ok(ticket)
    }

    /// The camera failed. Returns `false` if `ticket` is stale.
    pub fn capture_failed(&mut self, ticket: CorrelationId, reason: impl Into<String>) -> bool {
        if !matches!(&self.state, SessionState::Capturing { ticket: t, .. } if *t == ticket) {
            tracing::debug!(%ticket, "stale capture failure ignored");
            return false;
        }
        let reason = reason.into();
        tracing::warn!(%ticket, %reason, "capture failed");
        self.transition(SessionState::Failed { reason });
        true
    }

    /// The photo is available. Returns the correlation id for the single
    /// extractor request of this attempt, or `None` if `ticket` is stale.
    pub fn image_ready(
        &mut self,
        ticket: CorrelationId,
        image: CapturedImage,
    ) -> Option<CorrelationId> {
        let roster = match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Capturing { ticket: t, roster } if t == ticket => roster,
            other => {
                self.state = other;
                tracing::debug!(%ticket, "stale capture result ignored");
                return None;
            }
        };

        let correlation = CorrelationId::next();
        tracing::debug!(%ticket, %correlation, "photo captured, awaiting detection");
        self.transition(SessionState::AwaitingDetection {
            correlation,
            roster,
            image,
        });
        Some(correlation)
    }

    /// Apply the extractor's answer for `correlation`.
    pub fn detection_completed(
        &mut self,
        correlation: CorrelationId,
        result: Result<Detection, ChannelError>,
    ) -> DetectionCompletion {
        let (roster, image) = match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::AwaitingDetection {
                correlation: pending,
                roster,
                image,
            } if pending == correlation => (roster, image),
            other => {
                self.state = other;
                tracing::debug!(%correlation, "stale detection response dropped");
                return DetectionCompletion::Stale;
            }
        };

        match result {
            Ok(Detection::Face(probe)) => {
                match self.matcher.find_best_match(&probe, &roster, self.threshold) {
                    MatchResult::Match(result) => {
                        tracing::info!(
                            %correlation,
                            identity = %result.identity.id,
                            name = %result.identity.name,
                            distance = result.distance,
                            confidence = result.confidence_percent(),
                            "face matched"
                        );
                        self.transition(SessionState::Matched {
                            image,
                            result: result.clone(),
                        });
                        DetectionCompletion::Matched(result)
                    }
                    MatchResult::NoMatch { closest } => {
                        tracing::info!(
                            %correlation,
                            closest = ?closest,
                            threshold = self.threshold,
                            dims = probe.len(),
                            "face below match threshold"
                        );
                        let rejection = Rejection::BelowThreshold { closest };
                        self.transition(SessionState::Rejected(rejection.clone()));
                        DetectionCompletion::Rejected(rejection)
                    }
                }
            }
            Ok(Detection::NoFace) => {
                tracing::info!(%correlation, "no face in captured photo");
                self.transition(SessionState::Rejected(Rejection::NoFace));
                DetectionCompletion::Rejected(Rejection::NoFace)
            }
            Err(error) => {
                tracing::warn!(%correlation, %error, "detection failed");
                self.transition(SessionState::Failed {
                    reason: error.to_string(),
                });
                DetectionCompletion::Failed(error)
            }
        }
    }

    /// Start confirming the current match. Returns the ticket for the
    /// gateway call and the identity to confirm.
    pub fn confirm(&mut self) -> Result<(CorrelationId, Arc<EnrolledIdentity>), SessionError> {
        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Matched { image, result } => {
                let ticket = CorrelationId::next();
                let identity = Arc::clone(&result.identity);
                tracing::info!(%ticket, identity = %identity.id, "confirming attendance");
                self.transition(SessionState::Confirming {
                    ticket,
                    image,
                    result,
                });
                Ok((ticket, identity))
            }
            other => {
                let phase = other.phase();
                self.state = other;
                Err(SessionError::InvalidTransition {
                    action: "confirm",
                    phase,
                })
            }
        }
    }

    /// Apply the gateway's answer for `ticket`.
    pub fn confirmation_completed(
        &mut self,
        ticket: CorrelationId,
        result: Result<Confirmation, ApiError>,
    ) -> ConfirmationCompletion {
        let (image, matched) = match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Confirming {
                ticket: pending,
                image,
                result,
            } if pending == ticket => (image, result),
            other => {
                self.state = other;
                tracing::debug!(%ticket, "stale confirmation result dropped");
                return ConfirmationCompletion::Stale;
            }
        };

        match result {
            Ok(confirmation) => {
                tracing::info!(
                    %ticket,
                    name = %confirmation.name,
                    date = %confirmation.date,
                    time = %confirmation.time,
                    "attendance confirmed"
                );
                self.transition(SessionState::Confirmed(confirmation.clone()));
                ConfirmationCompletion::Confirmed(confirmation)
            }
            Err(error) => {
                tracing::warn!(%ticket, %error, "confirmation failed");
                self.transition(SessionState::Matched {
                    image,
                    result: matched,
                });
                ConfirmationCompletion::Retryable(error)
            }
        }
    }

    /// Return to `Idle`, discarding the photo and any match. Always legal.
    ///
    /// Returns the extractor request that was in flight, if any, so the
    /// caller can cancel it on the channel.
    pub fn reset(&mut self) -> Option<CorrelationId> {
        let pending = match &self.state {
            SessionState::AwaitingDetection { correlation, .. } => Some(*correlation),
            _ => None,
        };
        if self.phase() != Phase::Idle {
            self.transition(SessionState::Idle);
        }
        pending
    }

    fn transition(&mut self, next: SessionState) {
        // The published phase is the last one observers saw, which stays
        // correct while `state` is temporarily swapped out.
        let from = *self.phase_tx.borrow();
        let to = next.phase();
        self.state = next;
        tracing::debug!(%from, %to, "session transition");
        self.phase_tx.send_replace(to);
    }
}
