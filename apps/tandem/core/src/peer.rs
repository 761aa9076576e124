use thiserror::Error;
use tracing::{debug, info, warn};

use crate::machine::{NegotiationError, NegotiationMachine, NegotiationState};
use crate::message::{
    CandidatePayload, CandidateSignal, DescriptionPayload, Inbound, MessageError, OffererPolicy,
    Role, SdpKind, ServerEvent, SignalingMessage,
};
use crate::transport::LocalDescriptions;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

/// Endpoint-side driver: feeds frames received from the core into a
/// negotiation machine backed by a real engine and returns the frames to send
/// back.
pub struct Peer<T>
where
    T: LocalDescriptions<Description = String, Candidate = CandidateSignal>,
{
    role: Role,
    policy: OffererPolicy,
    session_id: Option<String>,
    machine: NegotiationMachine<T>,
}

impl<T> Peer<T>
where
    T: LocalDescriptions<Description = String, Candidate = CandidateSignal>,
{
    pub fn new(role: Role, policy: OffererPolicy, transport: T) -> Self {
        let mut machine = NegotiationMachine::new(transport);
        machine.set_initiator(policy.offerer() == role);
        Self {
            role,
            policy,
            session_id: None,
            machine,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn state(&self) -> NegotiationState {
        self.machine.state()
    }

    pub fn machine(&self) -> &NegotiationMachine<T> {
        &self.machine
    }

    /// First frame to send after the socket opens.
    pub fn registration(&self) -> SignalingMessage {
        SignalingMessage::RegisterRole(self.role.as_str().to_string())
    }

    /// Wraps a locally gathered candidate, or the end-of-candidates marker,
    /// for the wire.
    pub fn candidate_message(&self, candidate: CandidateSignal) -> SignalingMessage {
        SignalingMessage::Candidate(candidate)
    }

    pub async fn handle_text(&mut self, text: &str) -> Result<Vec<SignalingMessage>, PeerError> {
        let inbound = Inbound::parse(text)?;
        Ok(self.handle(inbound).await?)
    }

    pub async fn handle(
        &mut self,
        inbound: Inbound,
    ) -> Result<Vec<SignalingMessage>, NegotiationError> {
        match inbound {
            Inbound::Event(event) => self.on_event(event).await,
            Inbound::Relayed(message) => self.on_relayed(message).await,
        }
    }

    /// Re-offer after the local engine reported changed requirements.
    pub async fn renegotiate(&mut self) -> Result<Option<SignalingMessage>, NegotiationError> {
        let offer = self.machine.on_renegotiation_needed().await?;
        Ok(offer.map(|sdp| description(SdpKind::Offer, sdp)))
    }

    async fn on_event(
        &mut self,
        event: ServerEvent,
    ) -> Result<Vec<SignalingMessage>, NegotiationError> {
        match event {
            ServerEvent::Registered {
                endpoint_id,
                session_id,
                peer_id,
                ..
            } => {
                info!(%endpoint_id, %session_id, role = %self.role, "registered with core");
                self.machine.set_local_id(Some(endpoint_id));
                self.machine.set_remote_id(peer_id);
                self.session_id = Some(session_id);
            }
            ServerEvent::PeerJoined { peer_id, role } => {
                debug!(%peer_id, %role, "peer joined");
                self.machine.set_remote_id(Some(peer_id));
            }
            ServerEvent::StartNegotiation => {
                if self.role != self.policy.offerer() {
                    warn!(role = %self.role, "start_negotiation sent to the answering side");
                    return Ok(Vec::new());
                }
                self.machine.reset();
                let sdp = self.machine.create_offer().await?;
                return Ok(vec![description(SdpKind::Offer, sdp)]);
            }
            ServerEvent::SessionClosed { reason } => {
                info!(%reason, "session closed by core");
                self.machine.reset();
                self.machine.set_remote_id(None);
            }
            ServerEvent::PeerReconnecting {
                role,
                attempt,
                retry_in_ms,
            } => {
                debug!(%role, attempt, retry_in_ms, "peer reconnecting");
            }
            ServerEvent::PeerUnavailable { event } => {
                debug!(%event, "frame dropped, peer not connected");
            }
            ServerEvent::Error { kind, message } => {
                warn!(%kind, %message, "core rejected a frame");
            }
            ServerEvent::Pong => {}
        }
        Ok(Vec::new())
    }

    async fn on_relayed(
        &mut self,
        message: SignalingMessage,
    ) -> Result<Vec<SignalingMessage>, NegotiationError> {
        match message {
            SignalingMessage::Offer(payload) => match self.machine.on_offer(&payload.sdp).await {
                Ok(_) => {
                    let sdp = self.machine.create_answer().await?;
                    Ok(vec![description(SdpKind::Answer, sdp)])
                }
                Err(NegotiationError::OfferCollision { winner }) => {
                    debug!(%winner, "ignoring colliding offer");
                    Ok(Vec::new())
                }
                Err(err) => Err(err),
            },
            SignalingMessage::Answer(payload) => {
                self.machine.on_answer(&payload.sdp).await?;
                Ok(Vec::new())
            }
            SignalingMessage::Candidate(candidate) => {
                self.machine
                    .on_candidate(candidate.map(CandidatePayload::normalized))
                    .await?;
                Ok(Vec::new())
            }
            other => {
                debug!(event = other.event(), "ignoring frame not meant for endpoints");
                Ok(Vec::new())
            }
        }
    }
}

fn description(kind: SdpKind, sdp: String) -> SignalingMessage {
    let payload = DescriptionPayload {
        sdp,
        kind: Some(kind),
    };
    match kind {
        SdpKind::Offer => SignalingMessage::Offer(payload),
        SdpKind::Answer => SignalingMessage::Answer(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CloseReason, EndpointId};
    use crate::testing::RecordingTransport;

    fn registered(id: &str, role: Role, peer: Option<&str>) -> Inbound {
        Inbound::Event(ServerEvent::Registered {
            endpoint_id: EndpointId::from(id),
            session_id: "default".into(),
            role,
            peer_id: peer.map(EndpointId::from),
        })
    }

    fn relay(messages: Vec<SignalingMessage>) -> Inbound {
        let mut messages = messages.into_iter();
        let message = messages.next().expect("one frame to relay");
        assert!(messages.next().is_none());
        // Round-trip through text the way the core forwards it.
        Inbound::parse(&message.to_text().unwrap()).unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn peers_complete_a_negotiation_through_relayed_frames() {
        let mut sender = Peer::new(Role::Sender, OffererPolicy::Sender, RecordingTransport::new("s"));
        let mut receiver = Peer::new(
            Role::Receiver,
            OffererPolicy::Sender,
            RecordingTransport::new("r"),
        );
        assert_eq!(
            receiver.registration(),
            SignalingMessage::RegisterRole("receiver".into())
        );

        receiver.handle(registered("r", Role::Receiver, None)).await.unwrap();
        sender.handle(registered("s", Role::Sender, Some("r"))).await.unwrap();
        assert_eq!(sender.session_id(), Some("default"));

        let offer = sender
            .handle(Inbound::Event(ServerEvent::StartNegotiation))
            .await
            .unwrap();
        assert_eq!(sender.state(), NegotiationState::OfferSent);

        let answer = receiver.handle(relay(offer)).await.unwrap();
        assert_eq!(receiver.state(), NegotiationState::Stable);

        let nothing = sender.handle(relay(answer)).await.unwrap();
        assert!(nothing.is_empty());
        assert_eq!(sender.state(), NegotiationState::Stable);
    }

    #[test_timeout::tokio_timeout_test]
    async fn early_candidates_are_normalized_and_flushed_after_offer() {
        let transport = RecordingTransport::new("r");
        let log = transport.clone();
        let mut receiver = Peer::new(Role::Receiver, OffererPolicy::Sender, transport);

        receiver
            .handle_text(r#"{"event":"candidate","data":{"candidate":"a=candidate:1 1 udp 1 10.0.0.2 5000 typ host"}}"#)
            .await
            .unwrap();
        assert!(log.applied_candidates().is_empty());
        assert_eq!(receiver.machine().pending_candidates(), 1);

        let out = receiver
            .handle_text(r#"{"event":"offer","data":{"sdp":"v=0 offer","type":"offer"}}"#)
            .await
            .unwrap();
        assert!(matches!(out.as_slice(), [SignalingMessage::Answer(_)]));
        assert_eq!(
            log.applied_candidates(),
            vec!["candidate:1 1 udp 1 10.0.0.2 5000 typ host"]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn answering_side_ignores_start_negotiation() {
        let mut receiver = Peer::new(
            Role::Receiver,
            OffererPolicy::Sender,
            RecordingTransport::new("r"),
        );
        let out = receiver
            .handle(Inbound::Event(ServerEvent::StartNegotiation))
            .await
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(receiver.state(), NegotiationState::Idle);
    }

    #[test_timeout::tokio_timeout_test]
    async fn session_closed_allows_a_fresh_offer() {
        let mut sender = Peer::new(Role::Sender, OffererPolicy::Sender, RecordingTransport::new("s"));
        sender
            .handle(Inbound::Event(ServerEvent::StartNegotiation))
            .await
            .unwrap();
        sender
            .handle(Inbound::Event(ServerEvent::SessionClosed {
                reason: CloseReason::PeerDisconnected,
            }))
            .await
            .unwrap();
        assert_eq!(sender.state(), NegotiationState::Idle);

        let out = sender
            .handle(Inbound::Event(ServerEvent::StartNegotiation))
            .await
            .unwrap();
        assert!(matches!(out.as_slice(), [SignalingMessage::Offer(_)]));
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_frames_surface_as_message_errors() {
        let mut receiver = Peer::new(
            Role::Receiver,
            OffererPolicy::Receiver,
            RecordingTransport::new("r"),
        );
        let err = receiver.handle_text("{not json").await.unwrap_err();
        assert!(matches!(err, PeerError::Message(MessageError::Json(_))));
        assert!(receiver.machine().is_initiator());
        assert!(receiver.renegotiate().await.unwrap().is_none());
    }
}
