//! Detection channel: request/response bridge to the embedding extractor.
//!
//! A single actor task owns the transport. Callers talk to it through a
//! clone-safe [`DetectionChannel`] handle; each `detect` gets exactly one
//! reply over a oneshot, or none at all if it was cancelled first.

use crate::capture::CapturedImage;
use crate::transport::Transport;
use faceattend_core::{CorrelationId, Embedding, ExtractorMessage, ExtractorRequest};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

/// Cancels remembered for requests that had not reached the actor yet.
const EARLY_CANCELS: usize = 16;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("extractor is still loading its models")]
    NotReady,
    #[error("extractor unavailable: {0}")]
    Unavailable(String),
    #[error("extractor error: {0}")]
    Extractor(String),
    #[error("request {0} is already in flight")]
    DuplicateRequest(CorrelationId),
    #[error("request was cancelled")]
    Cancelled,
    #[error("extractor connection closed")]
    Closed,
}

/// Extractor lifecycle as seen by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    Loading,
    Ready,
    Failed(String),
}

/// Successful answer to a detect request.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    Face(Embedding),
    NoFace,
}

type Reply = oneshot::Sender<Result<Detection, ChannelError>>;

enum ChannelCommand {
    Detect {
        id: CorrelationId,
        image: CapturedImage,
        reply: Reply,
    },
    Cancel {
        id: CorrelationId,
        ack: oneshot::Sender<()>,
    },
}

/// A request the extractor has not answered yet. `reply` is `None` once
/// cancelled; the entry stays queued so its late answer is swallowed.
struct InFlight {
    id: CorrelationId,
    reply: Option<Reply>,
}

/// Clone-safe handle to the detection actor.
#[derive(Clone)]
pub struct DetectionChannel {
    tx: mpsc::Sender<ChannelCommand>,
    readiness: watch::Receiver<Readiness>,
    status: watch::Receiver<Option<String>>,
}

impl DetectionChannel {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(transport: Transport) -> Self {
        let (tx, commands) = mpsc::channel(8);
        let (readiness_tx, readiness) = watch::channel(Readiness::Loading);
        let (status_tx, status) = watch::channel(None);

        let actor = ChannelActor {
            commands,
            transport,
            readiness: readiness_tx,
            status: status_tx,
            in_flight: VecDeque::new(),
            early_cancels: VecDeque::new(),
        };
        tokio::spawn(actor.run());

        Self {
            tx,
            readiness,
            status,
        }
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.readiness.borrow(), Readiness::Ready)
    }

    pub fn subscribe_readiness(&self) -> watch::Receiver<Readiness> {
        self.readiness.clone()
    }

    /// Last progress text reported by the extractor.
    pub fn subscribe_status(&self) -> watch::Receiver<Option<String>> {
        self.status.clone()
    }

    /// Wait until the extractor is ready or has failed, up to `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ChannelError> {
        let mut rx = self.readiness.clone();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|r| !matches!(r, Readiness::Loading)),
        )
        .await;

        match settled {
            Err(_) => Err(ChannelError::NotReady),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Ok(Ok(state)) => match &*state {
                Readiness::Ready => Ok(()),
                Readiness::Failed(reason) => Err(ChannelError::Unavailable(reason.clone())),
                Readiness::Loading => Err(ChannelError::NotReady),
            },
        }
    }

    /// Send `image` to the extractor and wait for its single answer.
    ///
    /// Fails fast with [`ChannelError::NotReady`] before the extractor has
    /// signalled readiness; nothing is queued in that case.
    pub async fn detect(
        &self,
        id: CorrelationId,
        image: &CapturedImage,
    ) -> Result<Detection, ChannelError> {
        match self.readiness() {
            Readiness::Ready => {}
            Readiness::Loading => return Err(ChannelError::NotReady),
            Readiness::Failed(reason) => return Err(ChannelError::Unavailable(reason)),
        }

        let (reply, reply_rx) = oneshot::channel();
        self.tx
            .send(ChannelCommand::Detect {
                id,
                image: image.clone(),
                reply,
            })
            .await
            .map_err(|_| ChannelError::Closed)?;
        reply_rx.await.map_err(|_| ChannelError::Cancelled)?
    }

    /// Abandon request `id`. Once this returns its answer will never be
    /// delivered; a pending `detect` for it resolves to `Cancelled`.
    pub async fn cancel(&self, id: CorrelationId) {
        let (ack, ack_rx) = oneshot::channel();
        if self.tx.send(ChannelCommand::Cancel { id, ack }).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

struct ChannelActor {
    commands: mpsc::Receiver<ChannelCommand>,
    transport: Transport,
    readiness: watch::Sender<Readiness>,
    status: watch::Sender<Option<String>>,
    in_flight: VecDeque<InFlight>,
    early_cancels: VecDeque<CorrelationId>,
}

impl ChannelActor {
    async fn run(mut self) {
        tracing::debug!("detection channel started");
        let mut connected = true;

        loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                line = self.transport.inbound.recv(), if connected => match line {
                    Some(line) => self.handle_line(&line),
                    None => {
                        connected = false;
                        self.handle_disconnect();
                    }
                },
            }
        }

        tracing::debug!("detection channel stopped");
    }

    async fn handle_command(&mut self, cmd: ChannelCommand) {
        match cmd {
            ChannelCommand::Detect { id, image, reply } => {
                let readiness = self.readiness.borrow().clone();
                match readiness {
                    Readiness::Ready => {}
                    Readiness::Loading => {
                        let _ = reply.send(Err(ChannelError::NotReady));
                        return;
                    }
                    Readiness::Failed(reason) => {
                        let _ = reply.send(Err(ChannelError::Unavailable(reason)));
                        return;
                    }
                }

                if let Some(pos) = self.early_cancels.iter().position(|c| *c == id) {
                    self.early_cancels.remove(pos);
                    tracing::debug!(%id, "detect request cancelled before it was sent");
                    let _ = reply.send(Err(ChannelError::Cancelled));
                    return;
                }

                if self.in_flight.iter().any(|f| f.id == id) {
                    let _ = reply.send(Err(ChannelError::DuplicateRequest(id)));
                    return;
                }

                let request = ExtractorRequest::Detect {
                    id,
                    image: image.base64().to_string(),
                };
                let line = match request.to_line() {
                    Ok(line) => line,
                    Err(e) => {
                        let _ = reply.send(Err(ChannelError::Extractor(e.to_string())));
                        return;
                    }
                };

                if self.transport.outbound.send(line).await.is_err() {
                    let _ = reply.send(Err(ChannelError::Closed));
                    return;
                }

                self.in_flight.push_back(InFlight {
                    id,
                    reply: Some(reply),
                });
                tracing::debug!(%id, in_flight = self.in_flight.len(), "detect request sent");
            }
            ChannelCommand::Cancel { id, ack } => {
                match self.in_flight.iter_mut().find(|f| f.id == id) {
                    Some(entry) => {
                        if entry.reply.take().is_some() {
                            tracing::debug!(%id, "detect request cancelled");
                        }
                    }
                    None => {
                        // The request may still be on its way; refuse it when it arrives.
                        if self.early_cancels.len() == EARLY_CANCELS {
                            self.early_cancels.pop_front();
                        }
                        self.early_cancels.push_back(id);
                    }
                }
                let _ = ack.send(());
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        let msg = match ExtractorMessage::parse(line) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable extractor message");
                return;
            }
        };

        match msg {
            ExtractorMessage::ModelsLoaded => {
                if self.is_ready() {
                    tracing::debug!("repeated modelsLoaded signal ignored");
                } else {
                    tracing::info!("extractor ready");
                    self.readiness.send_replace(Readiness::Ready);
                }
            }
            ExtractorMessage::Status { message } => {
                tracing::debug!(%message, "extractor status");
                self.status.send_replace(Some(message));
            }
            response => self.resolve(response),
        }
    }

    fn resolve(&mut self, response: ExtractorMessage) {
        let correlation = response.correlation();
        let outcome = match response {
            ExtractorMessage::FaceDetected { descriptor, .. } => Ok(Detection::Face(descriptor)),
            ExtractorMessage::NoFace { .. } => Ok(Detection::NoFace),
            ExtractorMessage::Error { message, .. } => Err(ChannelError::Extractor(message)),
            ExtractorMessage::ModelsLoaded | ExtractorMessage::Status { .. } => return,
        };

        let entry = match correlation {
            Some(id) => match self.in_flight.iter().position(|f| f.id == id) {
                Some(pos) => self.in_flight.remove(pos),
                None => {
                    tracing::debug!(%id, "dropping response for a request not in flight");
                    return;
                }
            },
            None => self.in_flight.pop_front(),
        };

        let Some(entry) = entry else {
            match outcome {
                Err(ChannelError::Extractor(message)) if !self.is_ready() => {
                    tracing::warn!(%message, "extractor failed to initialise");
                    self.readiness.send_replace(Readiness::Failed(message));
                }
                _ => tracing::debug!("dropping unsolicited extractor response"),
            }
            return;
        };

        match entry.reply {
            Some(reply) => {
                if reply.send(outcome).is_err() {
                    tracing::debug!(id = %entry.id, "requester went away before the answer");
                }
            }
            None => tracing::debug!(id = %entry.id, "discarding answer to cancelled request"),
        }
    }

    fn is_ready(&self) -> bool {
        matches!(*self.readiness.borrow(), Readiness::Ready)
    }

    fn handle_disconnect(&mut self) {
        tracing::warn!(in_flight = self.in_flight.len(), "extractor connection closed");
        self.readiness
            .send_replace(Readiness::Failed("extractor connection closed".into()));
        for entry in self.in_flight.drain(..) {
            if let Some(reply) = entry.reply {
                let _ = reply.send(Err(ChannelError::Closed));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ExtractorEnd;

    const WAIT: Duration = Duration::from_secs(5);

    fn image() -> CapturedImage {
        CapturedImage::from_base64_jpeg("/9j/AAAA", 1, 1)
    }

    async fn ready_channel() -> (DetectionChannel, ExtractorEnd) {
        let (transport, end) = Transport::in_memory();
        let channel = DetectionChannel::spawn(transport);
        end.messages.send(r#"{"type":"modelsLoaded"}"#.into()).await.unwrap();
        channel.wait_ready(WAIT).await.unwrap();
        (channel, end)
    }

    /// Read the next request line and return its correlation id.
    async fn next_request(end: &mut ExtractorEnd) -> CorrelationId {
        let line = end.requests.recv().await.expect("request line");
        match serde_json::from_str::<ExtractorRequest>(&line).unwrap() {
            ExtractorRequest::Detect { id, image } => {
                assert_eq!(image, "/9j/AAAA");
                id
            }
        }
    }

    async fn reply(end: &ExtractorEnd, msg: ExtractorMessage) {
        end.messages.send(serde_json::to_string(&msg).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_detect_before_ready_fails_fast() {
        let (transport, mut end) = Transport::in_memory();
        let channel = DetectionChannel::spawn(transport);

        assert_eq!(channel.readiness(), Readiness::Loading);
        let err = channel.detect(CorrelationId::next(), &image()).await.unwrap_err();
        assert_eq!(err, ChannelError::NotReady);
        assert!(end.requests.try_recv().is_err(), "nothing should be queued");
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_while_loading() {
        let (transport, _end) = Transport::in_memory();
        let channel = DetectionChannel::spawn(transport);
        let err = channel.wait_ready(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, ChannelError::NotReady);
    }

    #[tokio::test]
    async fn test_face_detected_with_echoed_id() {
        let (channel, mut end) = ready_channel().await;
        let id = CorrelationId::next();

        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.detect(id, &image()).await }
        });
        assert_eq!(next_request(&mut end).await, id);
        reply(
            &end,
            ExtractorMessage::FaceDetected {
                descriptor: Embedding::new(vec![0.1, 0.2, 0.3]),
                id: Some(id),
            },
        )
        .await;

        let detection = pending.await.unwrap().unwrap();
        assert_eq!(detection, Detection::Face(Embedding::new(vec![0.1, 0.2, 0.3])));
    }

    #[tokio::test]
    async fn test_responses_without_id_resolve_in_order() {
        let (channel, mut end) = ready_channel().await;

        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.detect(CorrelationId::next(), &image()).await }
        });
        next_request(&mut end).await;
        end.messages.send(r#"{"type":"noFace"}"#.into()).await.unwrap();

        assert_eq!(pending.await.unwrap().unwrap(), Detection::NoFace);
    }

    #[tokio::test]
    async fn test_extractor_error_fails_request() {
        let (channel, mut end) = ready_channel().await;

        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.detect(CorrelationId::next(), &image()).await }
        });
        next_request(&mut end).await;
        end.messages
            .send(r#"{"type":"error","message":"Failed to load captured image"}"#.into())
            .await
            .unwrap();

        assert_eq!(
            pending.await.unwrap().unwrap_err(),
            ChannelError::Extractor("Failed to load captured image".into())
        );
    }

    #[tokio::test]
    async fn test_duplicate_responses_are_ignored() {
        let (channel, mut end) = ready_channel().await;

        let first = CorrelationId::next();
        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.detect(first, &image()).await }
        });
        next_request(&mut end).await;
        let face = ExtractorMessage::FaceDetected {
            descriptor: Embedding::new(vec![1.0]),
            id: Some(first),
        };
        reply(&end, face.clone()).await;
        reply(&end, face.clone()).await;
        reply(&end, face).await;
        assert_eq!(pending.await.unwrap().unwrap(), Detection::Face(Embedding::new(vec![1.0])));

        let second = CorrelationId::next();
        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.detect(second, &image()).await }
        });
        assert_eq!(next_request(&mut end).await, second);
        reply(&end, ExtractorMessage::NoFace { id: Some(second) }).await;
        assert_eq!(pending.await.unwrap().unwrap(), Detection::NoFace);
    }

    #[tokio::test]
    async fn test_cancelled_request_never_receives_late_answer() {
        let (channel, mut end) = ready_channel().await;

        let stale = CorrelationId::next();
        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.detect(stale, &image()).await }
        });
        next_request(&mut end).await;
        channel.cancel(stale).await;
        assert_eq!(pending.await.unwrap().unwrap_err(), ChannelError::Cancelled);

        // The extractor answers the abandoned request late and without an id;
        // that answer must not leak into the next request.
        let fresh = CorrelationId::next();
        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.detect(fresh, &image()).await }
        });
        next_request(&mut end).await;
        end.messages.send(r#"{"type":"faceDetected","descriptor":[0.5]}"#.into()).await.unwrap();
        end.messages.send(r#"{"type":"noFace"}"#.into()).await.unwrap();

        assert_eq!(pending.await.unwrap().unwrap(), Detection::NoFace);
    }

    #[tokio::test]
    async fn test_request_cancelled_before_sending_never_reaches_extractor() {
        let (channel, mut end) = ready_channel().await;

        let abandoned = CorrelationId::next();
        channel.cancel(abandoned).await;
        let err = channel.detect(abandoned, &image()).await.unwrap_err();
        assert_eq!(err, ChannelError::Cancelled);

        // Only the next request is written to the extractor.
        let fresh = CorrelationId::next();
        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.detect(fresh, &image()).await }
        });
        assert_eq!(next_request(&mut end).await, fresh);
        reply(&end, ExtractorMessage::NoFace { id: Some(fresh) }).await;
        assert_eq!(pending.await.unwrap().unwrap(), Detection::NoFace);
        assert!(end.requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_request_id_is_refused() {
        let (channel, mut end) = ready_channel().await;
        let id = CorrelationId::next();

        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.detect(id, &image()).await }
        });
        next_request(&mut end).await;

        let err = channel.detect(id, &image()).await.unwrap_err();
        assert_eq!(err, ChannelError::DuplicateRequest(id));

        reply(&end, ExtractorMessage::NoFace { id: Some(id) }).await;
        assert_eq!(pending.await.unwrap().unwrap(), Detection::NoFace);
    }

    #[tokio::test]
    async fn test_error_before_ready_marks_extractor_failed() {
        let (transport, end) = Transport::in_memory();
        let channel = DetectionChannel::spawn(transport);
        end.messages
            .send(r#"{"type":"error","message":"Failed to load models: offline"}"#.into())
            .await
            .unwrap();

        let err = channel.wait_ready(WAIT).await.unwrap_err();
        assert_eq!(err, ChannelError::Unavailable("Failed to load models: offline".into()));
        let err = channel.detect(CorrelationId::next(), &image()).await.unwrap_err();
        assert!(matches!(err, ChannelError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_disconnect_fails_in_flight_requests() {
        let (channel, mut end) = ready_channel().await;

        let pending = tokio::spawn({
            let channel = channel.clone();
            async move { channel.detect(CorrelationId::next(), &image()).await }
        });
        next_request(&mut end).await;
        drop(end);

        assert_eq!(pending.await.unwrap().unwrap_err(), ChannelError::Closed);
        let mut readiness = channel.subscribe_readiness();
        readiness
            .wait_for(|r| matches!(r, Readiness::Failed(_)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_status_messages_are_published() {
        let (channel, end) = ready_channel().await;
        let mut status = channel.subscribe_status();

        end.messages.send("garbage".into()).await.unwrap();
        end.messages
            .send(r#"{"type":"status","message":"Analyzing face..."}"#.into())
            .await
            .unwrap();

        let seen = status.wait_for(|s| s.is_some()).await.unwrap().clone();
        assert_eq!(seen.as_deref(), Some("Analyzing face..."));
        assert!(channel.is_ready());
    }
}
