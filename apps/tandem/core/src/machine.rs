//! Offer/answer state for one side of a session.
//!
//! The machine owns the side's [`CandidateBuffer`]: candidates are applied to
//! the transport only once a remote description is installed, and anything
//! that arrives earlier is released in arrival order as soon as one is.
//! Offer collisions are settled by endpoint id: the lexicographically smaller
//! id keeps its offer, the other side rolls back and answers.

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

use crate::buffer::CandidateBuffer;
use crate::message::{CandidateCheck, EndpointId, MessageError, SdpKind};
use crate::transport::{LocalDescriptions, TransportError, TransportHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Idle,
    /// Local offer emitted, waiting for the answer.
    OfferSent,
    /// Remote offer installed, local answer not produced yet.
    AnswerPending,
    Stable,
    /// Re-offer from `Stable` emitted, waiting for the answer.
    Renegotiating,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferSent => "offer_sent",
            NegotiationState::AnswerPending => "answer_pending",
            NegotiationState::Stable => "stable",
            NegotiationState::Renegotiating => "renegotiating",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        }
    }

    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            NegotiationState::OfferSent
                | NegotiationState::AnswerPending
                | NegotiationState::Renegotiating
        )
    }

    pub fn has_remote_description(self) -> bool {
        matches!(
            self,
            NegotiationState::AnswerPending | NegotiationState::Stable
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }

    fn awaiting_answer(self) -> bool {
        matches!(
            self,
            NegotiationState::OfferSent | NegotiationState::Renegotiating
        )
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionWinner {
    Local,
    Remote,
}

impl fmt::Display for CollisionWinner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollisionWinner::Local => f.write_str("local"),
            CollisionWinner::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("{event} not accepted while {state}")]
    InvalidState {
        event: &'static str,
        state: NegotiationState,
    },
    #[error("answer not expected while {0}")]
    UnexpectedAnswer(NegotiationState),
    #[error("offer collision won by the {winner} side")]
    OfferCollision { winner: CollisionWinner },
    #[error("malformed candidate: {0}")]
    MalformedCandidate(#[from] MessageError),
    #[error("transport failed to {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: TransportError,
    },
}

impl NegotiationError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            NegotiationError::InvalidState { .. } => "invalid_state",
            NegotiationError::UnexpectedAnswer(_) => "unexpected_answer",
            NegotiationError::OfferCollision { .. } => "offer_collision",
            NegotiationError::MalformedCandidate(_) => "malformed_candidate",
            NegotiationError::Transport { source, .. } if source.is_transient() => "backpressure",
            NegotiationError::Transport { .. } => "transport_failure",
        }
    }

    /// Transport failures leave the machine `Failed` unless they were
    /// transient; everything else is dropped and the negotiation carries on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NegotiationError::Transport { source, .. } if !source.is_transient())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Buffered { pending: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferOutcome {
    /// The local offer was rolled back in favour of the remote one.
    pub yielded: bool,
    /// Buffered candidates released once the offer was installed.
    pub flushed: usize,
}

pub struct NegotiationMachine<T: TransportHandle> {
    local_id: Option<EndpointId>,
    remote_id: Option<EndpointId>,
    initiator: bool,
    state: NegotiationState,
    buffer: CandidateBuffer<T::Candidate>,
    transport: T,
}

impl<T: TransportHandle> NegotiationMachine<T> {
    pub fn new(transport: T) -> Self {
        Self {
            local_id: None,
            remote_id: None,
            initiator: false,
            state: NegotiationState::Idle,
            buffer: CandidateBuffer::new(),
            transport,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn pending_candidates(&self) -> usize {
        self.buffer.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn local_id(&self) -> Option<&EndpointId> {
        self.local_id.as_ref()
    }

    pub fn remote_id(&self) -> Option<&EndpointId> {
        self.remote_id.as_ref()
    }

    pub fn set_local_id(&mut self, id: Option<EndpointId>) {
        self.local_id = id;
    }

    pub fn set_remote_id(&mut self, id: Option<EndpointId>) {
        self.remote_id = id;
    }

    /// Only the initiating side may start a renegotiation.
    pub fn set_initiator(&mut self, initiator: bool) {
        self.initiator = initiator;
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    /// Records that this side emitted an offer.
    pub fn on_local_offer(&mut self) -> Result<(), NegotiationError> {
        let next = self.local_offer_target()?;
        self.transition(next);
        Ok(())
    }

    /// Checks whether this side may emit an offer now, without recording it.
    pub fn accepts_local_offer(&self) -> Result<(), NegotiationError> {
        self.local_offer_target().map(|_| ())
    }

    fn local_offer_target(&self) -> Result<NegotiationState, NegotiationError> {
        let next = match self.state {
            NegotiationState::Idle => NegotiationState::OfferSent,
            NegotiationState::Stable if self.initiator => NegotiationState::Renegotiating,
            NegotiationState::AnswerPending => {
                // Our offer crossed the peer's on the wire.
                if self.collision_winner() == CollisionWinner::Remote {
                    return Err(NegotiationError::OfferCollision {
                        winner: CollisionWinner::Remote,
                    });
                }
                NegotiationState::OfferSent
            }
            state => {
                return Err(NegotiationError::InvalidState {
                    event: "local offer",
                    state,
                })
            }
        };
        Ok(next)
    }

    /// Installs a remote offer. While our own offer is outstanding the
    /// collision rule decides whether to roll back and accept it or to reject
    /// it and keep waiting for our answer.
    pub async fn on_offer(
        &mut self,
        offer: &T::Description,
    ) -> Result<OfferOutcome, NegotiationError> {
        let yielded = match self.state {
            NegotiationState::Idle | NegotiationState::Stable => false,
            NegotiationState::OfferSent | NegotiationState::Renegotiating => {
                if self.collision_winner() == CollisionWinner::Local {
                    debug!(
                        local = ?self.local_id,
                        remote = ?self.remote_id,
                        "offer collision: keeping local offer"
                    );
                    return Err(NegotiationError::OfferCollision {
                        winner: CollisionWinner::Local,
                    });
                }
                debug!(
                    local = ?self.local_id,
                    remote = ?self.remote_id,
                    "offer collision: rolling back local offer"
                );
                if let Err(source) = self.transport.rollback_local_offer().await {
                    return Err(self.fail_with("roll back local offer", source));
                }
                true
            }
            state => {
                return Err(NegotiationError::InvalidState {
                    event: "offer",
                    state,
                })
            }
        };

        self.install(SdpKind::Offer, offer).await?;
        self.transition(NegotiationState::AnswerPending);
        let flushed = self.flush().await?;
        Ok(OfferOutcome { yielded, flushed })
    }

    /// Records that this side emitted the answer to an installed offer.
    pub fn on_local_answer(&mut self) -> Result<(), NegotiationError> {
        match self.state {
            NegotiationState::AnswerPending => {
                self.transition(NegotiationState::Stable);
                Ok(())
            }
            state => Err(NegotiationError::InvalidState {
                event: "local answer",
                state,
            }),
        }
    }

    /// Installs the remote answer and releases buffered candidates. Returns
    /// how many were flushed.
    pub async fn on_answer(&mut self, answer: &T::Description) -> Result<usize, NegotiationError> {
        if !self.state.awaiting_answer() {
            warn!(state = %self.state, "dropping unexpected answer");
            return Err(NegotiationError::UnexpectedAnswer(self.state));
        }
        self.install(SdpKind::Answer, answer).await?;
        self.transition(NegotiationState::Stable);
        self.flush().await
    }

    pub async fn on_candidate(
        &mut self,
        candidate: T::Candidate,
    ) -> Result<CandidateDisposition, NegotiationError> {
        if let Err(err) = candidate.check() {
            warn!(error = %err, state = %self.state, "discarding malformed candidate");
            return Err(err.into());
        }
        if self.state.is_terminal() {
            return Err(NegotiationError::InvalidState {
                event: "candidate",
                state: self.state,
            });
        }
        if self.state.has_remote_description() {
            self.apply(&candidate).await?;
            return Ok(CandidateDisposition::Applied);
        }

        let pending = self.buffer.enqueue(candidate);
        debug!(pending, state = %self.state, "buffering candidate until remote description is installed");
        Ok(CandidateDisposition::Buffered { pending })
    }

    /// Moves to `Failed`, discarding buffered candidates.
    pub fn fail(&mut self) {
        let dropped = self.buffer.clear();
        if dropped > 0 {
            debug!(dropped, "discarded buffered candidates on failure");
        }
        self.transition(NegotiationState::Failed);
    }

    pub fn close(&mut self) {
        self.buffer.clear();
        self.transition(NegotiationState::Closed);
    }

    /// Back to `Idle` with an empty buffer, ready for a fresh negotiation.
    pub fn reset(&mut self) {
        self.buffer.clear();
        if self.state != NegotiationState::Idle {
            self.transition(NegotiationState::Idle);
        }
    }

    fn collision_winner(&self) -> CollisionWinner {
        match (&self.local_id, &self.remote_id) {
            (Some(local), Some(remote)) if local < remote => CollisionWinner::Local,
            (Some(_), Some(_)) => CollisionWinner::Remote,
            (_, None) => CollisionWinner::Local,
            (None, Some(_)) => CollisionWinner::Remote,
        }
    }

    async fn install(
        &mut self,
        kind: SdpKind,
        description: &T::Description,
    ) -> Result<(), NegotiationError> {
        match self
            .transport
            .install_remote_description(kind, description)
            .await
        {
            Ok(()) => Ok(()),
            Err(source) => Err(self.fail_with("install remote description", source)),
        }
    }

    async fn apply(&mut self, candidate: &T::Candidate) -> Result<(), NegotiationError> {
        match self.transport.add_candidate(candidate).await {
            Ok(()) => Ok(()),
            Err(source) => Err(self.fail_with("add candidate", source)),
        }
    }

    async fn flush(&mut self) -> Result<usize, NegotiationError> {
        let pending = self.buffer.flush();
        let flushed = pending.len();
        for entry in pending {
            if let Err(err) = self.apply(&entry.candidate).await {
                // The rest of the drained buffer is gone either way.
                if !self.state.is_terminal() {
                    self.fail();
                }
                return Err(err);
            }
        }
        if flushed > 0 {
            debug!(flushed, "flushed buffered candidates");
        }
        Ok(flushed)
    }

    fn fail_with(&mut self, operation: &'static str, source: TransportError) -> NegotiationError {
        if source.is_transient() {
            warn!(operation, error = %source, state = %self.state, "transport busy; state kept");
        } else {
            warn!(operation, error = %source, "transport failure");
            self.fail();
        }
        NegotiationError::Transport { operation, source }
    }

    fn transition(&mut self, next: NegotiationState) {
        debug!(from = %self.state, to = %next, "negotiation transition");
        self.state = next;
    }
}

impl<T: LocalDescriptions> NegotiationMachine<T> {
    /// Authors the initial offer from `Idle`.
    pub async fn create_offer(&mut self) -> Result<T::Description, NegotiationError> {
        if self.state != NegotiationState::Idle {
            return Err(NegotiationError::InvalidState {
                event: "create offer",
                state: self.state,
            });
        }
        let offer = match self.transport.create_offer().await {
            Ok(offer) => offer,
            Err(source) => return Err(self.fail_with("create offer", source)),
        };
        self.transition(NegotiationState::OfferSent);
        Ok(offer)
    }

    /// Authors the answer to an installed remote offer.
    pub async fn create_answer(&mut self) -> Result<T::Description, NegotiationError> {
        if self.state != NegotiationState::AnswerPending {
            return Err(NegotiationError::InvalidState {
                event: "create answer",
                state: self.state,
            });
        }
        let answer = match self.transport.create_answer().await {
            Ok(answer) => answer,
            Err(source) => return Err(self.fail_with("create answer", source)),
        };
        self.transition(NegotiationState::Stable);
        Ok(answer)
    }

    /// Produces a re-offer when the transport's requirements changed. A no-op
    /// on the non-initiating side and while a negotiation is already running.
    pub async fn on_renegotiation_needed(
        &mut self,
    ) -> Result<Option<T::Description>, NegotiationError> {
        if !self.initiator {
            debug!("ignoring renegotiation request on the answering side");
            return Ok(None);
        }
        if self.state != NegotiationState::Stable {
            debug!(state = %self.state, "renegotiation deferred");
            return Ok(None);
        }
        let offer = match self.transport.create_offer().await {
            Ok(offer) => offer,
            Err(source) => return Err(self.fail_with("create offer", source)),
        };
        self.transition(NegotiationState::Renegotiating);
        Ok(Some(offer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CandidatePayload, CandidateSignal};
    use crate::testing::{RecordingTransport, TransportCall};

    fn machine(id: &str, initiator: bool) -> (NegotiationMachine<RecordingTransport>, RecordingTransport) {
        let transport = RecordingTransport::new(id);
        let mut machine = NegotiationMachine::new(transport.clone());
        machine.set_local_id(Some(EndpointId::from(id)));
        machine.set_initiator(initiator);
        (machine, transport)
    }

    fn pair(
        sender_id: &str,
        receiver_id: &str,
    ) -> (
        (NegotiationMachine<RecordingTransport>, RecordingTransport),
        (NegotiationMachine<RecordingTransport>, RecordingTransport),
    ) {
        let (mut sender, sender_log) = machine(sender_id, true);
        let (mut receiver, receiver_log) = machine(receiver_id, false);
        sender.set_remote_id(Some(EndpointId::from(receiver_id)));
        receiver.set_remote_id(Some(EndpointId::from(sender_id)));
        ((sender, sender_log), (receiver, receiver_log))
    }

    fn candidate(line: &str) -> CandidateSignal {
        Some(CandidatePayload::new(line))
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_and_answer_reach_stable_on_both_sides() {
        let ((mut sender, _), (mut receiver, receiver_log)) = pair("s", "r");

        let offer = sender.create_offer().await.unwrap();
        assert_eq!(sender.state(), NegotiationState::OfferSent);

        let outcome = receiver.on_offer(&offer).await.unwrap();
        assert!(!outcome.yielded);
        assert_eq!(receiver.state(), NegotiationState::AnswerPending);

        let answer = receiver.create_answer().await.unwrap();
        assert_eq!(receiver.state(), NegotiationState::Stable);

        sender.on_answer(&answer).await.unwrap();
        assert_eq!(sender.state(), NegotiationState::Stable);
        assert_eq!(
            receiver_log.remote_descriptions(),
            vec![(SdpKind::Offer, offer)]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn early_candidates_wait_for_the_remote_offer() {
        let (mut receiver, log) = machine("r", false);

        for (index, line) in ["c1", "c2", "c3"].iter().enumerate() {
            let disposition = receiver.on_candidate(candidate(line)).await.unwrap();
            assert_eq!(
                disposition,
                CandidateDisposition::Buffered { pending: index + 1 }
            );
        }
        assert!(log.applied_candidates().is_empty());

        let outcome = receiver.on_offer(&"offer".to_string()).await.unwrap();
        assert_eq!(outcome.flushed, 3);
        assert_eq!(receiver.pending_candidates(), 0);

        let calls = log.calls();
        assert_eq!(
            calls[0],
            TransportCall::RemoteDescription(SdpKind::Offer, "offer".into())
        );
        assert_eq!(log.applied_candidates(), vec!["c1", "c2", "c3"]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn offerer_buffers_until_the_answer_is_installed() {
        let (mut sender, log) = machine("s", true);
        sender.create_offer().await.unwrap();

        let disposition = sender.on_candidate(candidate("late-1")).await.unwrap();
        assert_eq!(disposition, CandidateDisposition::Buffered { pending: 1 });
        sender.on_candidate(None).await.unwrap();

        let flushed = sender.on_answer(&"answer".to_string()).await.unwrap();
        assert_eq!(flushed, 2);

        let calls = log.calls();
        let answer_at = calls
            .iter()
            .position(|call| matches!(call, TransportCall::RemoteDescription(SdpKind::Answer, _)))
            .unwrap();
        assert_eq!(
            &calls[answer_at + 1..],
            &[
                TransportCall::Candidate(candidate("late-1")),
                TransportCall::Candidate(None),
            ]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn candidates_apply_immediately_once_the_offer_is_installed() {
        let (mut receiver, log) = machine("r", false);
        receiver.on_offer(&"offer".to_string()).await.unwrap();

        let disposition = receiver.on_candidate(candidate("c1")).await.unwrap();
        assert_eq!(disposition, CandidateDisposition::Applied);
        assert_eq!(log.applied_candidates(), vec!["c1"]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unexpected_answer_leaves_transport_untouched() {
        let (mut receiver, log) = machine("r", false);

        let err = receiver.on_answer(&"answer".to_string()).await.unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::UnexpectedAnswer(NegotiationState::Idle)
        ));
        assert!(!err.is_fatal());
        assert_eq!(receiver.state(), NegotiationState::Idle);
        assert!(log.calls().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn malformed_candidate_is_discarded_without_state_change() {
        let (mut sender, log) = machine("s", true);
        sender.create_offer().await.unwrap();

        let err = sender
            .on_candidate(Some(CandidatePayload::new("   ")))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::MalformedCandidate(_)));
        assert_eq!(sender.state(), NegotiationState::OfferSent);
        assert_eq!(sender.pending_candidates(), 0);
        assert!(log.applied_candidates().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn renegotiation_only_from_stable_on_initiating_side() {
        let ((mut sender, _), (mut receiver, _)) = pair("s", "r");

        assert!(sender.on_renegotiation_needed().await.unwrap().is_none());

        let offer = sender.create_offer().await.unwrap();
        assert!(sender.on_renegotiation_needed().await.unwrap().is_none());
        assert_eq!(sender.state(), NegotiationState::OfferSent);

        receiver.on_offer(&offer).await.unwrap();
        let answer = receiver.create_answer().await.unwrap();
        sender.on_answer(&answer).await.unwrap();

        let reoffer = sender.on_renegotiation_needed().await.unwrap().unwrap();
        assert_eq!(sender.state(), NegotiationState::Renegotiating);
        assert!(sender.on_renegotiation_needed().await.unwrap().is_none());
        assert!(receiver.on_renegotiation_needed().await.unwrap().is_none());

        receiver.on_offer(&reoffer).await.unwrap();
        let answer = receiver.create_answer().await.unwrap();
        sender.on_answer(&answer).await.unwrap();
        assert_eq!(sender.state(), NegotiationState::Stable);
        assert_eq!(receiver.state(), NegotiationState::Stable);
    }

    async fn run_collision(low_first: bool) -> (Vec<(SdpKind, String)>, Vec<(SdpKind, String)>) {
        let ((mut low, low_log), (mut high, high_log)) = pair("a-low", "b-high");
        let low_offer = low.create_offer().await.unwrap();
        let high_offer = high.create_offer().await.unwrap();

        if low_first {
            assert!(matches!(
                low.on_offer(&high_offer).await,
                Err(NegotiationError::OfferCollision {
                    winner: CollisionWinner::Local
                })
            ));
            let outcome = high.on_offer(&low_offer).await.unwrap();
            assert!(outcome.yielded);
        } else {
            let outcome = high.on_offer(&low_offer).await.unwrap();
            assert!(outcome.yielded);
            assert!(low.on_offer(&high_offer).await.is_err());
        }

        let answer = high.create_answer().await.unwrap();
        low.on_answer(&answer).await.unwrap();
        assert_eq!(low.state(), NegotiationState::Stable);
        assert_eq!(high.state(), NegotiationState::Stable);
        assert!(high_log.calls().contains(&TransportCall::Rollback));
        assert!(!low_log.calls().contains(&TransportCall::Rollback));
        (low_log.remote_descriptions(), high_log.remote_descriptions())
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_collision_converges_on_lower_id_regardless_of_arrival_order() {
        let first = run_collision(true).await;
        let second = run_collision(false).await;
        assert_eq!(first, second);

        let (low_remote, high_remote) = first;
        assert_eq!(low_remote.len(), 1);
        assert_eq!(low_remote[0].0, SdpKind::Answer);
        assert_eq!(high_remote.len(), 1);
        assert_eq!(high_remote[0].0, SdpKind::Offer);
        assert!(high_remote[0].1.contains("a-low"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn transport_rejection_fails_and_discards_buffer() {
        let (mut receiver, log) = machine("r", false);
        receiver.on_candidate(candidate("c1")).await.unwrap();
        receiver.on_candidate(candidate("c2")).await.unwrap();
        log.fail_candidates(true);

        let err = receiver.on_offer(&"offer".to_string()).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(receiver.state(), NegotiationState::Failed);
        assert_eq!(receiver.pending_candidates(), 0);

        let err = receiver.on_candidate(candidate("c3")).await.unwrap_err();
        assert!(matches!(err, NegotiationError::InvalidState { .. }));
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejected_description_fails_without_installing() {
        let (mut receiver, log) = machine("r", false);
        log.fail_descriptions(true);

        let err = receiver.on_offer(&"offer".to_string()).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.metric_label(), "transport_failure");
        assert_eq!(receiver.state(), NegotiationState::Failed);
        assert!(log.remote_descriptions().is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn busy_transport_keeps_state_and_buffered_candidates() {
        let (mut receiver, log) = machine("r", false);
        receiver.on_candidate(candidate("c1")).await.unwrap();
        log.set_busy(true);

        let err = receiver.on_offer(&"offer".to_string()).await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.metric_label(), "backpressure");
        assert_eq!(receiver.state(), NegotiationState::Idle);
        assert_eq!(receiver.pending_candidates(), 1);

        log.set_busy(false);
        let outcome = receiver.on_offer(&"offer".to_string()).await.unwrap();
        assert_eq!(outcome.flushed, 1);
        assert_eq!(receiver.state(), NegotiationState::AnswerPending);
        assert_eq!(log.applied_candidates(), vec!["c1"]);
    }

    #[test_timeout::tokio_timeout_test]
    async fn answering_side_cannot_reoffer_once_stable() {
        let ((mut sender, _), (mut receiver, _)) = pair("s", "r");
        let offer = sender.create_offer().await.unwrap();
        receiver.on_offer(&offer).await.unwrap();
        let answer = receiver.create_answer().await.unwrap();
        sender.on_answer(&answer).await.unwrap();

        assert!(receiver.accepts_local_offer().is_err());
        assert!(matches!(
            receiver.on_local_offer(),
            Err(NegotiationError::InvalidState {
                event: "local offer",
                state: NegotiationState::Stable
            })
        ));
        assert_eq!(receiver.state(), NegotiationState::Stable);

        sender.accepts_local_offer().unwrap();
        assert_eq!(sender.state(), NegotiationState::Stable);
        sender.on_local_offer().unwrap();
        assert_eq!(sender.state(), NegotiationState::Renegotiating);
    }

    #[test_timeout::tokio_timeout_test]
    async fn reset_returns_to_idle_with_an_empty_buffer() {
        let (mut sender, _) = machine("s", true);
        sender.create_offer().await.unwrap();
        sender.on_candidate(candidate("stale")).await.unwrap();

        sender.reset();
        assert_eq!(sender.state(), NegotiationState::Idle);
        assert_eq!(sender.pending_candidates(), 0);
        assert!(sender.create_offer().await.is_ok());
    }

    #[test_timeout::timeout]
    fn local_offer_bookkeeping_follows_collision_rule() {
        let transport = RecordingTransport::new("relay");
        let mut low = NegotiationMachine::new(transport.clone());
        low.set_local_id(Some(EndpointId::from("a")));
        low.set_remote_id(Some(EndpointId::from("b")));
        let mut high = NegotiationMachine::new(transport);
        high.set_local_id(Some(EndpointId::from("b")));
        high.set_remote_id(Some(EndpointId::from("a")));

        // Both have the other's offer installed when their own offer shows up.
        low.state = NegotiationState::AnswerPending;
        high.state = NegotiationState::AnswerPending;

        assert!(low.on_local_offer().is_ok());
        assert_eq!(low.state(), NegotiationState::OfferSent);
        assert!(matches!(
            high.on_local_offer(),
            Err(NegotiationError::OfferCollision {
                winner: CollisionWinner::Remote
            })
        ));
        assert!(matches!(
            low.on_local_offer(),
            Err(NegotiationError::InvalidState { .. })
        ));
    }
}
