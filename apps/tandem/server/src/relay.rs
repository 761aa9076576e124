//! Delivery toward endpoints, and the transport the session's negotiation
//! machines drive: "installing" a description or "adding" a candidate on an
//! endpoint means handing it the exact frame its peer sent.

use async_trait::async_trait;
use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use tandem_core::{
    CandidateCheck, CloseReason, EndpointId, MessageError, NegotiationError, SdpKind,
    ServerEvent, SignalingMessage, TransportError, TransportHandle,
};

use crate::telemetry::MESSAGES_RELAYED;

#[derive(Debug, Clone)]
pub enum Outbound {
    Text(String),
    Close(CloseReason),
}

/// Write side of one endpoint connection.
#[derive(Debug, Clone)]
pub struct EndpointHandle {
    pub id: EndpointId,
    tx: mpsc::Sender<Outbound>,
}

impl EndpointHandle {
    pub fn new(id: EndpointId, tx: mpsc::Sender<Outbound>) -> Self {
        Self { id, tx }
    }

    pub fn send_event(&self, event: &ServerEvent) {
        match event.to_text() {
            Ok(text) => {
                if let Err(err) = self.tx.try_send(Outbound::Text(text)) {
                    debug!(endpoint_id = %self.id, error = %err, "dropping event for endpoint");
                }
            }
            Err(err) => warn!(endpoint_id = %self.id, error = %err, "failed to encode event"),
        }
    }

    /// Asks the writer to send a close frame and stop.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.tx.try_send(Outbound::Close(reason));
    }

    /// Frames that can be queued right now without waiting.
    pub fn room(&self) -> usize {
        self.tx.capacity()
    }

    fn forward(&self, raw: &str) -> Result<(), TrySendError<Outbound>> {
        self.tx.try_send(Outbound::Text(raw.to_string()))
    }
}

/// A relayed frame: the text exactly as received plus its parsed form.
#[derive(Debug, Clone)]
pub struct RelayFrame {
    pub raw: String,
    pub message: SignalingMessage,
}

impl RelayFrame {
    pub fn new(raw: impl Into<String>, message: SignalingMessage) -> Self {
        Self {
            raw: raw.into(),
            message,
        }
    }

    pub fn event(&self) -> &'static str {
        self.message.event()
    }
}

impl CandidateCheck for RelayFrame {
    fn check(&self) -> Result<(), MessageError> {
        match &self.message {
            SignalingMessage::Candidate(candidate) => candidate.check(),
            other => Err(MessageError::NotACandidate(other.event())),
        }
    }
}

/// Forwards frames to whichever endpoint currently holds one role.
#[derive(Debug, Default)]
pub struct ForwardingTransport {
    target: Option<EndpointHandle>,
}

impl ForwardingTransport {
    pub fn attach(&mut self, endpoint: EndpointHandle) {
        self.target = Some(endpoint);
    }

    pub fn detach(&mut self) {
        self.target = None;
    }

    /// A detached transport has no queue to fill; delivery reports `Closed`.
    pub fn has_room_for(&self, frames: usize) -> bool {
        self.target
            .as_ref()
            .map_or(true, |target| target.room() >= frames)
    }

    fn deliver(&self, frame: &RelayFrame) -> Result<(), TransportError> {
        let Some(target) = &self.target else {
            return Err(TransportError::Closed);
        };
        match target.forward(&frame.raw) {
            Ok(()) => {
                counter!(MESSAGES_RELAYED, 1, "event" => frame.event());
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                warn!(endpoint_id = %target.id, event = frame.event(), "outbound queue full; frame refused");
                Err(TransportError::Backpressure)
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl TransportHandle for ForwardingTransport {
    type Description = RelayFrame;
    type Candidate = RelayFrame;

    async fn install_remote_description(
        &mut self,
        _kind: SdpKind,
        description: &RelayFrame,
    ) -> Result<(), TransportError> {
        self.deliver(description)
    }

    async fn add_candidate(&mut self, candidate: &RelayFrame) -> Result<(), TransportError> {
        self.deliver(candidate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Forwarded,
    /// Held until the destination has been handed a remote description.
    Buffered { pending: usize },
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("endpoint has not registered a role")]
    NotRegistered,
    #[error(transparent)]
    Malformed(#[from] MessageError),
    #[error("no peer connected to receive {event}")]
    PeerUnavailable { event: &'static str },
    #[error("peer is not draining its queue; {event} was not delivered")]
    Backpressure { event: &'static str },
    #[error("{event} is handled by the core and is never relayed")]
    NotRelayable { event: &'static str },
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("session is no longer running")]
    SessionGone,
}

impl RouteError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RouteError::NotRegistered => "not_registered",
            RouteError::Malformed(err) => err.metric_label(),
            RouteError::PeerUnavailable { .. } => "peer_unavailable",
            RouteError::Backpressure { .. } => "backpressure",
            RouteError::NotRelayable { .. } => "not_relayable",
            RouteError::Negotiation(err) => err.metric_label(),
            RouteError::SessionGone => "session_gone",
        }
    }

    /// What the originating endpoint is told about a dropped frame.
    pub fn to_event(&self) -> ServerEvent {
        match self {
            RouteError::PeerUnavailable { event } => ServerEvent::PeerUnavailable {
                event: (*event).to_string(),
            },
            other => ServerEvent::Error {
                kind: other.metric_label().to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{CandidatePayload, DescriptionPayload};

    fn candidate_frame(line: &str) -> RelayFrame {
        let message = SignalingMessage::Candidate(Some(CandidatePayload::new(line)));
        RelayFrame::new(message.to_text().unwrap(), message)
    }

    #[test_timeout::tokio_timeout_test]
    async fn forwards_the_raw_text_untouched() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut transport = ForwardingTransport::default();
        transport.attach(EndpointHandle::new(EndpointId::from("r"), tx));

        let raw = r#"{"event":"offer","data":{"sdp":"v=0","type":1,"extra":true}}"#;
        let frame = RelayFrame::new(raw, SignalingMessage::Offer(DescriptionPayload::new("v=0")));
        transport
            .install_remote_description(SdpKind::Offer, &frame)
            .await
            .unwrap();

        match rx.recv().await {
            Some(Outbound::Text(text)) => assert_eq!(text, raw),
            other => panic!("unexpected outbound {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn detached_or_closed_targets_report_closed() {
        let mut transport = ForwardingTransport::default();
        let frame = candidate_frame("candidate:1");
        assert!(matches!(
            transport.add_candidate(&frame).await,
            Err(TransportError::Closed)
        ));

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        transport.attach(EndpointHandle::new(EndpointId::from("gone"), tx));
        assert!(matches!(
            transport.add_candidate(&frame).await,
            Err(TransportError::Closed)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn full_queue_refuses_instead_of_dropping() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut transport = ForwardingTransport::default();
        transport.attach(EndpointHandle::new(EndpointId::from("slow"), tx));
        assert!(transport.has_room_for(1));
        assert!(!transport.has_room_for(2));

        transport.add_candidate(&candidate_frame("candidate:1")).await.unwrap();
        assert!(!transport.has_room_for(1));
        assert!(matches!(
            transport.add_candidate(&candidate_frame("candidate:2")).await,
            Err(TransportError::Backpressure)
        ));

        assert!(matches!(rx.recv().await, Some(Outbound::Text(text)) if text.contains("candidate:1")));
        assert!(rx.try_recv().is_err());
        assert!(transport.has_room_for(1));
    }

    #[test_timeout::timeout]
    fn only_candidate_frames_pass_the_candidate_check() {
        assert!(candidate_frame("candidate:1").check().is_ok());
        assert!(candidate_frame("  ").check().is_err());

        let offer = RelayFrame::new("{}", SignalingMessage::Offer(DescriptionPayload::new("v=0")));
        assert!(matches!(
            offer.check(),
            Err(MessageError::NotACandidate("offer"))
        ));
    }

    #[test_timeout::timeout]
    fn peer_unavailable_maps_to_its_own_event() {
        let event = RouteError::PeerUnavailable { event: "offer" }.to_event();
        assert_eq!(
            event,
            ServerEvent::PeerUnavailable {
                event: "offer".into()
            }
        );
        let event = RouteError::NotRegistered.to_event();
        assert!(matches!(event, ServerEvent::Error { ref kind, .. } if kind == "not_registered"));
        let event = RouteError::Backpressure { event: "answer" }.to_event();
        assert!(matches!(event, ServerEvent::Error { ref kind, .. } if kind == "backpressure"));
    }
}
