//! Signaling core for a two-endpoint relay: the wire schema, candidate
//! buffering and the offer/answer state machine shared by the server and by
//! endpoint-side drivers.

pub mod buffer;
pub mod machine;
pub mod message;
pub mod payload;
pub mod peer;
#[cfg(feature = "rtc")]
pub mod rtc;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use buffer::{BufferedCandidate, CandidateBuffer};
pub use machine::{
    CandidateDisposition, CollisionWinner, NegotiationError, NegotiationMachine,
    NegotiationState, OfferOutcome,
};
pub use message::{
    CandidateCheck, CandidatePayload, CandidateSignal, CloseReason, DescriptionPayload,
    EndpointId, Inbound, MessageError, OffererPolicy, Role, SdpKind, ServerEvent,
    SignalingMessage,
};
pub use payload::{LandmarkFrame, PayloadError};
pub use peer::{Peer, PeerError};
pub use transport::{LocalDescriptions, TransportError, TransportHandle};
