use async_trait::async_trait;
use thiserror::Error;

use crate::message::{CandidateCheck, SdpKind};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("remote description rejected: {0}")]
    DescriptionRejected(String),
    #[error("candidate rejected: {0}")]
    CandidateRejected(String),
    #[error("local description unavailable: {0}")]
    LocalDescription(String),
    #[error("transport closed")]
    Closed,
    #[error("transport cannot take more frames right now")]
    Backpressure,
}

impl TransportError {
    /// Nothing was handed to the engine and the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Backpressure)
    }
}

/// The peer-connection engine as seen by the negotiation machine. Each call
/// completes (or fails) before the machine looks at the next signaling
/// message, which is what keeps candidate application ordered.
#[async_trait]
pub trait TransportHandle: Send {
    type Description: Send + Sync;
    type Candidate: CandidateCheck + Send + Sync;

    async fn install_remote_description(
        &mut self,
        kind: SdpKind,
        description: &Self::Description,
    ) -> Result<(), TransportError>;

    async fn add_candidate(&mut self, candidate: &Self::Candidate) -> Result<(), TransportError>;

    /// Abandons a local offer that lost an offer collision.
    async fn rollback_local_offer(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Engines that can author descriptions themselves, as opposed to the relay,
/// which only ever moves descriptions authored elsewhere.
#[async_trait]
pub trait LocalDescriptions: TransportHandle {
    async fn create_offer(&mut self) -> Result<Self::Description, TransportError>;

    async fn create_answer(&mut self) -> Result<Self::Description, TransportError>;
}
