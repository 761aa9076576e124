//! `webrtc` peer connection behind the transport traits.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::message::{CandidatePayload, CandidateSignal, SdpKind};
use crate::payload::{DATA_CHANNEL_LABEL, LANDMARK_CHANNEL};
use crate::transport::{LocalDescriptions, TransportError, TransportHandle};

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

impl RtcTransport {
    /// An empty `ice_urls` limits gathering to host candidates.
    pub async fn new(ice_urls: Vec<String>) -> Result<Self, TransportError> {
        let api = APIBuilder::new().build();
        let ice_servers = if ice_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_urls,
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|err| TransportError::LocalDescription(err.to_string()))?;
        Ok(Self { pc: Arc::new(pc) })
    }

    pub fn peer_connection(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.pc)
    }

    /// Locally gathered candidates, ready to be wrapped in `candidate` frames.
    /// Gathering completion yields `None`.
    pub fn gathered_candidates(&self) -> mpsc::UnboundedReceiver<CandidateSignal> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let signal = match candidate {
                        Some(candidate) => match candidate.to_json() {
                            Ok(init) => Some(CandidatePayload {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }),
                            Err(err) => {
                                warn!(error = %err, "failed to serialize local candidate");
                                return;
                            }
                        },
                        None => None,
                    };
                    let _ = tx.send(signal);
                })
            }));
        rx
    }

    /// Opens the unordered, zero-retransmit landmark channel.
    pub async fn open_landmark_channel(&self) -> Result<Arc<RTCDataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(LANDMARK_CHANNEL.ordered),
            max_retransmits: LANDMARK_CHANNEL.max_retransmits,
            ..Default::default()
        };
        self.pc
            .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
            .await
            .map_err(|err| TransportError::LocalDescription(err.to_string()))
    }

    async fn author(&mut self, kind: SdpKind) -> Result<String, TransportError> {
        let description = match kind {
            SdpKind::Offer => self.pc.create_offer(None).await,
            SdpKind::Answer => self.pc.create_answer(None).await,
        }
        .map_err(|err| TransportError::LocalDescription(err.to_string()))?;
        let sdp = description.sdp.clone();
        self.pc
            .set_local_description(description)
            .await
            .map_err(|err| TransportError::LocalDescription(err.to_string()))?;
        Ok(sdp)
    }
}

#[async_trait]
impl TransportHandle for RtcTransport {
    type Description = String;
    type Candidate = CandidateSignal;

    async fn install_remote_description(
        &mut self,
        kind: SdpKind,
        description: &String,
    ) -> Result<(), TransportError> {
        let parsed = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(description.clone()),
        }
        .map_err(|err| TransportError::DescriptionRejected(err.to_string()))?;
        self.pc
            .set_remote_description(parsed)
            .await
            .map_err(|err| TransportError::DescriptionRejected(err.to_string()))
    }

    async fn add_candidate(&mut self, candidate: &CandidateSignal) -> Result<(), TransportError> {
        let Some(payload) = candidate else {
            debug!("remote finished gathering candidates");
            return Ok(());
        };
        let init = RTCIceCandidateInit {
            candidate: payload.candidate.clone(),
            sdp_mid: payload.sdp_mid.clone(),
            sdp_mline_index: payload.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| TransportError::CandidateRejected(err.to_string()))
    }

    async fn rollback_local_offer(&mut self) -> Result<(), TransportError> {
        // The engine refuses an empty local description, so the rollback
        // carries the offer it withdraws.
        let Some(pending) = self.pc.pending_local_description().await else {
            return Ok(());
        };
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        rollback.sdp = pending.sdp;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(|err| TransportError::LocalDescription(err.to_string()))
    }
}

#[async_trait]
impl LocalDescriptions for RtcTransport {
    async fn create_offer(&mut self) -> Result<String, TransportError> {
        self.author(SdpKind::Offer).await
    }

    async fn create_answer(&mut self) -> Result<String, TransportError> {
        self.author(SdpKind::Answer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{NegotiationMachine, NegotiationState};
    use crate::message::{EndpointId, Inbound, OffererPolicy, Role, ServerEvent, SignalingMessage};
    use crate::peer::Peer;
    use std::time::Duration;
    use webrtc::peer_connection::signaling_state::RTCSignalingState;

    async fn transport() -> RtcTransport {
        let transport = RtcTransport::new(Vec::new()).await.unwrap();
        transport.open_landmark_channel().await.unwrap();
        transport
    }

    fn relay(messages: Vec<SignalingMessage>) -> Inbound {
        assert_eq!(messages.len(), 1);
        Inbound::parse(&messages[0].to_text().unwrap()).unwrap()
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn two_engines_negotiate_through_peers() {
        let sender_rtc = transport().await;
        let sender_pc = sender_rtc.peer_connection();
        let mut gathered = sender_rtc.gathered_candidates();
        let receiver_rtc = RtcTransport::new(Vec::new()).await.unwrap();
        let receiver_pc = receiver_rtc.peer_connection();

        let mut sender = Peer::new(Role::Sender, OffererPolicy::Sender, sender_rtc);
        let mut receiver = Peer::new(Role::Receiver, OffererPolicy::Sender, receiver_rtc);

        let offer = sender
            .handle(Inbound::Event(ServerEvent::StartNegotiation))
            .await
            .unwrap();
        let answer = receiver.handle(relay(offer)).await.unwrap();
        assert!(sender.handle(relay(answer)).await.unwrap().is_empty());

        assert_eq!(sender.state(), NegotiationState::Stable);
        assert_eq!(receiver.state(), NegotiationState::Stable);
        assert_eq!(sender_pc.signaling_state(), RTCSignalingState::Stable);
        assert_eq!(receiver_pc.signaling_state(), RTCSignalingState::Stable);
        assert!(receiver_pc.remote_description().await.is_some());

        // Gathering ends with `None` even on hosts without usable interfaces.
        let signal = tokio::time::timeout(Duration::from_secs(10), gathered.recv())
            .await
            .unwrap()
            .unwrap();
        let frame = sender.candidate_message(signal);
        assert!(receiver.handle(relay(vec![frame])).await.unwrap().is_empty());
        assert_eq!(receiver.state(), NegotiationState::Stable);

        sender_pc.close().await.unwrap();
        receiver_pc.close().await.unwrap();
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn losing_engine_rolls_back_its_offer() {
        let mut low = NegotiationMachine::new(transport().await);
        let mut high = NegotiationMachine::new(transport().await);
        low.set_local_id(Some(EndpointId::from("a-low")));
        low.set_remote_id(Some(EndpointId::from("b-high")));
        high.set_local_id(Some(EndpointId::from("b-high")));
        high.set_remote_id(Some(EndpointId::from("a-low")));

        let low_offer = low.create_offer().await.unwrap();
        let high_offer = high.create_offer().await.unwrap();
        assert!(low.on_offer(&high_offer).await.is_err());

        let outcome = high.on_offer(&low_offer).await.unwrap();
        assert!(outcome.yielded);
        let answer = high.create_answer().await.unwrap();
        low.on_answer(&answer).await.unwrap();

        for machine in [&low, &high] {
            assert_eq!(machine.state(), NegotiationState::Stable);
            let pc = machine.transport().peer_connection();
            assert_eq!(pc.signaling_state(), RTCSignalingState::Stable);
            pc.close().await.unwrap();
        }
    }
}
