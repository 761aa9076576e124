//! One task per session. Every registration, departure and relayed frame for
//! a session goes through its command queue, so negotiation bookkeeping and
//! candidate flushes happen strictly in receipt order.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tandem_core::{
    CandidateDisposition, CloseReason, EndpointId, NegotiationError, NegotiationMachine,
    NegotiationState, OffererPolicy, Role, ServerEvent,
};

use crate::relay::{EndpointHandle, ForwardingTransport, RelayFrame, RouteError, RouteOutcome};
use crate::supervisor::{ReconnectPolicy, ReconnectionSupervisor, SupervisorEvent};
use crate::telemetry::{
    EVICTIONS, NEGOTIATIONS_COMPLETED, NEGOTIATION_TIMEOUTS, RECONNECT_ATTEMPTS,
    RECONNECT_EXHAUSTED, SESSIONS_READY,
};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub offerer: OffererPolicy,
    pub negotiation_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            offerer: OffererPolicy::default(),
            negotiation_timeout: Duration::from_secs(20),
            reconnect: ReconnectPolicy::default(),
            max_sessions: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// The endpoint said `session_close`.
    Explicit,
    /// The connection dropped or went silent.
    Unexpected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub session_id: String,
    pub role: Role,
    pub ready: bool,
    pub evicted: Option<EndpointId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub sender: Option<EndpointId>,
    pub receiver: Option<EndpointId>,
    pub ready: bool,
    pub sender_state: NegotiationState,
    pub receiver_state: NegotiationState,
    pub buffered_candidates: usize,
    pub reconnecting: Option<Role>,
}

pub(crate) enum SessionCommand {
    Register {
        endpoint: EndpointHandle,
        role: Role,
        reply: oneshot::Sender<Registration>,
    },
    Unregister {
        endpoint: EndpointId,
        departure: Departure,
        reply: oneshot::Sender<bool>,
    },
    Route {
        from: EndpointId,
        frame: RelayFrame,
        reply: oneshot::Sender<Result<RouteOutcome, RouteError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

type RelayMachine = NegotiationMachine<ForwardingTransport>;

pub(crate) struct Session {
    id: String,
    config: SessionConfig,
    created_at: DateTime<Utc>,
    sender: Option<EndpointHandle>,
    receiver: Option<EndpointHandle>,
    /// Negotiation state of the sender endpoint, as observed from the frames
    /// it sent and was handed.
    sender_side: RelayMachine,
    receiver_side: RelayMachine,
    negotiation_deadline: Option<Instant>,
    supervisor: ReconnectionSupervisor,
}

impl Session {
    pub(crate) fn new(id: String, config: SessionConfig) -> Self {
        let supervisor = ReconnectionSupervisor::new(config.reconnect.clone());
        Self {
            id,
            config,
            created_at: Utc::now(),
            sender: None,
            receiver: None,
            sender_side: NegotiationMachine::new(ForwardingTransport::default()),
            receiver_side: NegotiationMachine::new(ForwardingTransport::default()),
            negotiation_deadline: None,
            supervisor,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        debug!(session_id = %self.id, "session task started");
        loop {
            let negotiation_deadline = self.negotiation_deadline;
            let retry_due = self.supervisor.next_due();
            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => Flow::Stop,
                },
                _ = sleep_until(negotiation_deadline) => self.on_negotiation_timeout(),
                _ = sleep_until(retry_due) => self.on_retry_due(),
            };
            if flow == Flow::Stop {
                break;
            }
        }
        // Anything still queued is answered by dropping its reply channel.
        commands.close();
        info!(session_id = %self.id, "session ended");
    }

    async fn handle(&mut self, command: SessionCommand) -> Flow {
        match command {
            SessionCommand::Register {
                endpoint,
                role,
                reply,
            } => {
                let registration = self.register(endpoint, role);
                let _ = reply.send(registration);
                Flow::Continue
            }
            SessionCommand::Unregister {
                endpoint,
                departure,
                reply,
            } => {
                let removed = self.unregister(&endpoint, departure);
                let _ = reply.send(removed);
                if self.is_empty() {
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
            SessionCommand::Route { from, frame, reply } => {
                let result = self.route(&from, frame).await;
                let _ = reply.send(result);
                Flow::Continue
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
                Flow::Continue
            }
            SessionCommand::Shutdown => self.teardown(CloseReason::Shutdown),
        }
    }

    fn register(&mut self, endpoint: EndpointHandle, role: Role) -> Registration {
        // The same connection switching roles gives up its old slot first.
        if let Some(previous) = self.role_of(&endpoint.id) {
            if previous != role {
                self.unregister(&endpoint.id, Departure::Explicit);
            }
        }

        let mut evicted = None;
        if let Some(old) = self.slot_mut(role).take() {
            if old.id != endpoint.id {
                info!(
                    session_id = %self.id,
                    %role,
                    evicted = %old.id,
                    replacement = %endpoint.id,
                    "role taken over by a new connection"
                );
                counter!(EVICTIONS, 1, "role" => role.as_str());
                old.send_event(&ServerEvent::SessionClosed {
                    reason: CloseReason::Evicted,
                });
                old.close(CloseReason::Evicted);
                if let Some(peer) = self.slot(role.opposite()) {
                    peer.send_event(&ServerEvent::SessionClosed {
                        reason: CloseReason::PeerReplaced,
                    });
                }
                evicted = Some(old.id);
            }
            self.reset_negotiation();
        }

        if self.supervisor.on_reconnected(role) {
            info!(session_id = %self.id, %role, "role reconnected");
        }

        let peer_id = self.slot(role.opposite()).map(|peer| peer.id.clone());
        endpoint.send_event(&ServerEvent::Registered {
            endpoint_id: endpoint.id.clone(),
            session_id: self.id.clone(),
            role,
            peer_id,
        });
        if let Some(peer) = self.slot(role.opposite()) {
            peer.send_event(&ServerEvent::PeerJoined {
                peer_id: endpoint.id.clone(),
                role,
            });
        }

        info!(session_id = %self.id, endpoint_id = %endpoint.id, %role, "endpoint registered");
        self.side_mut(role).transport_mut().attach(endpoint.clone());
        *self.slot_mut(role) = Some(endpoint);

        let ready = self.is_ready();
        if ready {
            self.announce_ready();
        }
        Registration {
            session_id: self.id.clone(),
            role,
            ready,
            evicted,
        }
    }

    fn unregister(&mut self, endpoint: &EndpointId, departure: Departure) -> bool {
        let Some(role) = self.role_of(endpoint) else {
            return false;
        };
        *self.slot_mut(role) = None;
        self.side_mut(role).transport_mut().detach();
        self.reset_negotiation();
        info!(session_id = %self.id, endpoint_id = %endpoint, %role, ?departure, "endpoint left");

        let Some(peer) = self.slot(role.opposite()).cloned() else {
            self.supervisor.cancel();
            return true;
        };
        match departure {
            Departure::Explicit => {
                peer.send_event(&ServerEvent::SessionClosed {
                    reason: CloseReason::PeerLeft,
                });
            }
            Departure::Unexpected => {
                peer.send_event(&ServerEvent::SessionClosed {
                    reason: CloseReason::PeerDisconnected,
                });
                let delay = self.supervisor.on_disconnect(role, Instant::now());
                peer.send_event(&ServerEvent::PeerReconnecting {
                    role,
                    attempt: 1,
                    retry_in_ms: delay.as_millis() as u64,
                });
            }
        }
        true
    }

    async fn route(&mut self, from: &EndpointId, frame: RelayFrame) -> Result<RouteOutcome, RouteError> {
        let origin = self.role_of(from).ok_or(RouteError::NotRegistered)?;
        let event = frame.event();
        if self.slot(origin.opposite()).is_none() {
            return Err(RouteError::PeerUnavailable { event });
        }

        let result = self.forward(origin, frame).await;
        self.update_deadline();
        match result {
            Ok(outcome) => {
                debug!(session_id = %self.id, %origin, event, ?outcome, "frame routed");
                Ok(outcome)
            }
            Err(RouteError::Negotiation(NegotiationError::Transport { source, .. })) => {
                if source.is_transient() {
                    warn!(session_id = %self.id, %origin, event, "peer queue full; frame refused");
                    Err(RouteError::Backpressure { event })
                } else {
                    // The destination's connection went away underneath us.
                    Err(RouteError::PeerUnavailable { event })
                }
            }
            Err(err) => {
                debug!(session_id = %self.id, %origin, event, error = %err, "frame dropped");
                Err(err)
            }
        }
    }

    /// Neither side's bookkeeping moves unless the frame reaches the peer's
    /// queue, so a refused frame can simply be sent again.
    async fn forward(&mut self, origin: Role, frame: RelayFrame) -> Result<RouteOutcome, RouteError> {
        let (origin_side, peer_side) = self.sides_mut(origin);
        match frame.event() {
            event @ "offer" => {
                origin_side.accepts_local_offer()?;
                ensure_room(peer_side, 1 + peer_side.pending_candidates(), event)?;
                peer_side.on_offer(&frame).await?;
                origin_side.on_local_offer()?;
                Ok(RouteOutcome::Forwarded)
            }
            event @ "answer" => {
                if origin_side.state() != NegotiationState::AnswerPending {
                    return Err(NegotiationError::InvalidState {
                        event,
                        state: origin_side.state(),
                    }
                    .into());
                }
                ensure_room(peer_side, 1 + peer_side.pending_candidates(), event)?;
                peer_side.on_answer(&frame).await?;
                origin_side.on_local_answer()?;
                Ok(RouteOutcome::Forwarded)
            }
            event @ "candidate" => {
                if peer_side.state().has_remote_description() {
                    ensure_room(peer_side, 1, event)?;
                }
                match peer_side.on_candidate(frame).await? {
                    CandidateDisposition::Applied => Ok(RouteOutcome::Forwarded),
                    CandidateDisposition::Buffered { pending } => {
                        Ok(RouteOutcome::Buffered { pending })
                    }
                }
            }
            event => Err(RouteError::NotRelayable { event }),
        }
    }

    fn announce_ready(&mut self) {
        let (Some(sender), Some(receiver)) = (&self.sender, &self.receiver) else {
            return;
        };
        let sender_id = sender.id.clone();
        let receiver_id = receiver.id.clone();
        let offerer = self.config.offerer.offerer();

        self.sender_side.reset();
        self.sender_side.set_local_id(Some(sender_id.clone()));
        self.sender_side.set_remote_id(Some(receiver_id.clone()));
        self.sender_side.set_initiator(offerer == Role::Sender);
        self.receiver_side.reset();
        self.receiver_side.set_local_id(Some(receiver_id));
        self.receiver_side.set_remote_id(Some(sender_id));
        self.receiver_side.set_initiator(offerer == Role::Receiver);

        self.negotiation_deadline = Some(Instant::now() + self.config.negotiation_timeout);
        counter!(SESSIONS_READY, 1);
        info!(session_id = %self.id, %offerer, "session ready; starting negotiation");
        if let Some(endpoint) = self.slot(offerer) {
            endpoint.send_event(&ServerEvent::StartNegotiation);
        }
    }

    fn update_deadline(&mut self) {
        let sender = self.sender_side.state();
        let receiver = self.receiver_side.state();
        if sender == NegotiationState::Stable && receiver == NegotiationState::Stable {
            if self.negotiation_deadline.take().is_some() {
                counter!(NEGOTIATIONS_COMPLETED, 1);
                info!(session_id = %self.id, "negotiation reached stable");
            }
        } else if self.negotiation_deadline.is_none()
            && (sender.is_negotiating() || receiver.is_negotiating())
        {
            self.negotiation_deadline = Some(Instant::now() + self.config.negotiation_timeout);
        }
    }

    fn on_negotiation_timeout(&mut self) -> Flow {
        warn!(
            session_id = %self.id,
            sender_state = %self.sender_side.state(),
            receiver_state = %self.receiver_side.state(),
            "negotiation did not reach stable in time"
        );
        counter!(NEGOTIATION_TIMEOUTS, 1);
        self.sender_side.fail();
        self.receiver_side.fail();
        self.teardown(CloseReason::NegotiationTimeout)
    }

    fn on_retry_due(&mut self) -> Flow {
        match self.supervisor.poll_due(Instant::now()) {
            Some(SupervisorEvent::Retry {
                role,
                attempt,
                retry_in,
            }) => {
                counter!(RECONNECT_ATTEMPTS, 1, "role" => role.as_str());
                debug!(session_id = %self.id, %role, attempt, "waiting for role to reconnect");
                if let Some(peer) = self.slot(role.opposite()) {
                    peer.send_event(&ServerEvent::PeerReconnecting {
                        role,
                        attempt,
                        retry_in_ms: retry_in.as_millis() as u64,
                    });
                }
                Flow::Continue
            }
            Some(SupervisorEvent::Exhausted { role, attempts }) => {
                warn!(session_id = %self.id, %role, attempts, "role did not reconnect; closing session");
                counter!(RECONNECT_EXHAUSTED, 1, "role" => role.as_str());
                self.teardown(CloseReason::ReconnectExhausted)
            }
            None => Flow::Continue,
        }
    }

    fn teardown(&mut self, reason: CloseReason) -> Flow {
        for endpoint in [self.sender.take(), self.receiver.take()].into_iter().flatten() {
            endpoint.send_event(&ServerEvent::SessionClosed { reason });
            endpoint.close(reason);
        }
        self.sender_side.close();
        self.receiver_side.close();
        self.sender_side.transport_mut().detach();
        self.receiver_side.transport_mut().detach();
        self.negotiation_deadline = None;
        self.supervisor.cancel();
        info!(session_id = %self.id, %reason, "session torn down");
        Flow::Stop
    }

    fn reset_negotiation(&mut self) {
        self.sender_side.reset();
        self.receiver_side.reset();
        self.negotiation_deadline = None;
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            created_at: self.created_at,
            sender: self.sender.as_ref().map(|e| e.id.clone()),
            receiver: self.receiver.as_ref().map(|e| e.id.clone()),
            ready: self.is_ready(),
            sender_state: self.sender_side.state(),
            receiver_state: self.receiver_side.state(),
            buffered_candidates: self.sender_side.pending_candidates()
                + self.receiver_side.pending_candidates(),
            reconnecting: self.supervisor.supervising(),
        }
    }

    fn is_ready(&self) -> bool {
        self.sender.is_some() && self.receiver.is_some()
    }

    fn is_empty(&self) -> bool {
        self.sender.is_none() && self.receiver.is_none()
    }

    fn role_of(&self, endpoint: &EndpointId) -> Option<Role> {
        if self.sender.as_ref().is_some_and(|e| &e.id == endpoint) {
            Some(Role::Sender)
        } else if self.receiver.as_ref().is_some_and(|e| &e.id == endpoint) {
            Some(Role::Receiver)
        } else {
            None
        }
    }

    fn slot(&self, role: Role) -> Option<&EndpointHandle> {
        match role {
            Role::Sender => self.sender.as_ref(),
            Role::Receiver => self.receiver.as_ref(),
        }
    }

    fn slot_mut(&mut self, role: Role) -> &mut Option<EndpointHandle> {
        match role {
            Role::Sender => &mut self.sender,
            Role::Receiver => &mut self.receiver,
        }
    }

    fn side_mut(&mut self, role: Role) -> &mut RelayMachine {
        match role {
            Role::Sender => &mut self.sender_side,
            Role::Receiver => &mut self.receiver_side,
        }
    }

    fn sides_mut(&mut self, origin: Role) -> (&mut RelayMachine, &mut RelayMachine) {
        match origin {
            Role::Sender => (&mut self.sender_side, &mut self.receiver_side),
            Role::Receiver => (&mut self.receiver_side, &mut self.sender_side),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn ensure_room(side: &RelayMachine, frames: usize, event: &'static str) -> Result<(), RouteError> {
    if side.transport().has_room_for(frames) {
        Ok(())
    } else {
        Err(RouteError::Backpressure { event })
    }
}
