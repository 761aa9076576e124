use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Identifier of one endpoint connection. Ordering is lexicographic on the
/// string form, which is what offer collisions are resolved by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The two identities an endpoint may register as within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = MessageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sender" => Ok(Role::Sender),
            "receiver" => Ok(Role::Receiver),
            other => Err(MessageError::InvalidRole(other.to_string())),
        }
    }
}

/// Which role creates the offer once a session becomes ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffererPolicy {
    #[default]
    Sender,
    Receiver,
}

impl OffererPolicy {
    pub fn offerer(self) -> Role {
        match self {
            OffererPolicy::Sender => Role::Sender,
            OffererPolicy::Receiver => Role::Receiver,
        }
    }
}

impl FromStr for OffererPolicy {
    type Err = MessageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.parse::<Role>()? {
            Role::Sender => Ok(OffererPolicy::Sender),
            Role::Receiver => Ok(OffererPolicy::Receiver),
        }
    }
}

/// Kind of a session description. Engine-side clients send the numeric enum
/// value instead of the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "RawSdpKind")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSdpKind {
    Name(String),
    Code(u8),
}

impl TryFrom<RawSdpKind> for SdpKind {
    type Error = String;

    fn try_from(raw: RawSdpKind) -> Result<Self, Self::Error> {
        match raw {
            RawSdpKind::Name(name) if name == "offer" => Ok(SdpKind::Offer),
            RawSdpKind::Name(name) if name == "answer" => Ok(SdpKind::Answer),
            RawSdpKind::Code(1) => Ok(SdpKind::Offer),
            RawSdpKind::Code(2) => Ok(SdpKind::Answer),
            RawSdpKind::Name(name) => Err(format!("unsupported description type {name:?}")),
            RawSdpKind::Code(code) => Err(format!("unsupported description type {code}")),
        }
    }
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptionPayload {
    pub sdp: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<SdpKind>,
}

impl DescriptionPayload {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl CandidatePayload {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    /// Strips a leading `a=` attribute prefix and fills the media section
    /// fields some clients leave out.
    pub fn normalized(mut self) -> Self {
        if let Some(stripped) = self.candidate.strip_prefix("a=") {
            self.candidate = stripped.to_string();
        }
        self.candidate = self.candidate.trim().to_string();
        if self.sdp_mid.is_none() {
            self.sdp_mid = Some(String::new());
        }
        if self.sdp_mline_index.is_none() {
            self.sdp_mline_index = Some(0);
        }
        self
    }
}

/// A connectivity candidate as carried on the wire; `None` is the
/// end-of-candidates marker.
pub type CandidateSignal = Option<CandidatePayload>;

/// Structural check applied to anything the negotiation machine is asked to
/// treat as a candidate.
pub trait CandidateCheck {
    fn check(&self) -> Result<(), MessageError>;
}

impl CandidateCheck for CandidateSignal {
    fn check(&self) -> Result<(), MessageError> {
        match self {
            None => Ok(()),
            Some(payload) if payload.candidate.trim().is_empty() => {
                Err(MessageError::EmptyCandidate)
            }
            Some(_) => Ok(()),
        }
    }
}

/// Messages an endpoint sends to the core. Offer, answer and candidate frames
/// are relayed to the peer exactly as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SignalingMessage {
    RegisterRole(String),
    Offer(DescriptionPayload),
    Answer(DescriptionPayload),
    Candidate(CandidateSignal),
    SessionClose,
    Ping,
}

impl SignalingMessage {
    /// Parses and structurally validates one text frame.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let message: SignalingMessage = serde_json::from_str(text)?;
        message.validate()?;
        Ok(message)
    }

    pub fn validate(&self) -> Result<(), MessageError> {
        match self {
            SignalingMessage::Offer(payload) => validate_description(SdpKind::Offer, payload),
            SignalingMessage::Answer(payload) => validate_description(SdpKind::Answer, payload),
            SignalingMessage::Candidate(candidate) => candidate.check(),
            SignalingMessage::RegisterRole(_)
            | SignalingMessage::SessionClose
            | SignalingMessage::Ping => Ok(()),
        }
    }

    pub fn event(&self) -> &'static str {
        match self {
            SignalingMessage::RegisterRole(_) => "register_role",
            SignalingMessage::Offer(_) => "offer",
            SignalingMessage::Answer(_) => "answer",
            SignalingMessage::Candidate(_) => "candidate",
            SignalingMessage::SessionClose => "session_close",
            SignalingMessage::Ping => "ping",
        }
    }

    /// Offer, answer and candidate frames travel to the peer; everything else
    /// is addressed to the core.
    pub fn is_relayed(&self) -> bool {
        matches!(
            self,
            SignalingMessage::Offer(_)
                | SignalingMessage::Answer(_)
                | SignalingMessage::Candidate(_)
        )
    }

    pub fn to_text(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}

fn validate_description(expected: SdpKind, payload: &DescriptionPayload) -> Result<(), MessageError> {
    if payload.sdp.trim().is_empty() {
        return Err(MessageError::EmptySdp(expected));
    }
    match payload.kind {
        Some(found) if found != expected => Err(MessageError::KindMismatch { expected, found }),
        _ => Ok(()),
    }
}

/// Why the core told an endpoint its session is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The peer sent `session_close`.
    PeerLeft,
    /// The peer's connection dropped without saying goodbye.
    PeerDisconnected,
    /// The peer's role was taken over by a newer connection.
    PeerReplaced,
    /// This endpoint's role was taken over by a newer connection.
    Evicted,
    NegotiationTimeout,
    ReconnectExhausted,
    InvalidRole,
    SessionLimit,
    IdleTimeout,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::PeerLeft => "peer_left",
            CloseReason::PeerDisconnected => "peer_disconnected",
            CloseReason::PeerReplaced => "peer_replaced",
            CloseReason::Evicted => "evicted",
            CloseReason::NegotiationTimeout => "negotiation_timeout",
            CloseReason::ReconnectExhausted => "reconnect_exhausted",
            CloseReason::InvalidRole => "invalid_role",
            CloseReason::SessionLimit => "session_limit",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events the core originates toward an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Registered {
        endpoint_id: EndpointId,
        session_id: String,
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<EndpointId>,
    },
    PeerJoined {
        peer_id: EndpointId,
        role: Role,
    },
    StartNegotiation,
    SessionClosed {
        reason: CloseReason,
    },
    PeerUnavailable {
        event: String,
    },
    PeerReconnecting {
        role: Role,
        attempt: u32,
        retry_in_ms: u64,
    },
    Error {
        kind: String,
        message: String,
    },
    Pong,
}

impl ServerEvent {
    pub fn to_text(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Anything an endpoint can receive: a core event or a frame relayed from its
/// peer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    Event(ServerEvent),
    Relayed(SignalingMessage),
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let inbound: Inbound = serde_json::from_str(text)?;
        if let Inbound::Relayed(message) = &inbound {
            message.validate()?;
        }
        Ok(inbound)
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized role {0:?}")]
    InvalidRole(String),
    #[error("{0} carries an empty sdp")]
    EmptySdp(SdpKind),
    #[error("{expected} event carries a description of type {found}")]
    KindMismatch { expected: SdpKind, found: SdpKind },
    #[error("candidate line is empty")]
    EmptyCandidate,
    #[error("{0} frame cannot be used as a candidate")]
    NotACandidate(&'static str),
    #[error("binary frame is not valid UTF-8")]
    NotUtf8,
}

impl MessageError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            MessageError::Json(_) => "invalid_json",
            MessageError::InvalidRole(_) => "invalid_role",
            MessageError::EmptySdp(_) => "empty_sdp",
            MessageError::KindMismatch { .. } => "kind_mismatch",
            MessageError::EmptyCandidate => "empty_candidate",
            MessageError::NotACandidate(_) => "not_a_candidate",
            MessageError::NotUtf8 => "not_utf8",
        }
    }
}
