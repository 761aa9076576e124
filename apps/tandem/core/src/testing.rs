//! In-memory transport that records every call, for exercising the
//! negotiation machine and peer driver without a real engine.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::message::{CandidateSignal, SdpKind};
use crate::transport::{LocalDescriptions, TransportError, TransportHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    RemoteDescription(SdpKind, String),
    Candidate(CandidateSignal),
    Rollback,
    CreateOffer,
    CreateAnswer,
}

#[derive(Debug, Default)]
struct Recorder {
    calls: Vec<TransportCall>,
    reject_descriptions: bool,
    reject_candidates: bool,
    busy: bool,
    authored: usize,
}

/// Clones share one log, so a test can keep a handle after moving the
/// transport into a machine.
#[derive(Debug, Clone)]
pub struct RecordingTransport {
    label: String,
    inner: Arc<Mutex<Recorder>>,
}

impl RecordingTransport {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            inner: Arc::new(Mutex::new(Recorder::default())),
        }
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.inner.lock().calls.clone()
    }

    pub fn remote_descriptions(&self) -> Vec<(SdpKind, String)> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::RemoteDescription(kind, sdp) => Some((*kind, sdp.clone())),
                _ => None,
            })
            .collect()
    }

    /// Candidate lines applied so far; end-of-candidates markers are skipped.
    pub fn applied_candidates(&self) -> Vec<String> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Candidate(Some(payload)) => Some(payload.candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn fail_descriptions(&self, reject: bool) {
        self.inner.lock().reject_descriptions = reject;
    }

    pub fn fail_candidates(&self, reject: bool) {
        self.inner.lock().reject_candidates = reject;
    }

    /// While set, descriptions and candidates are refused as backpressure.
    pub fn set_busy(&self, busy: bool) {
        self.inner.lock().busy = busy;
    }

    fn author(&self, kind: SdpKind, call: TransportCall) -> String {
        let mut recorder = self.inner.lock();
        recorder.calls.push(call);
        recorder.authored += 1;
        format!("{kind}:{}:{}", self.label, recorder.authored)
    }
}

#[async_trait]
impl TransportHandle for RecordingTransport {
    type Description = String;
    type Candidate = CandidateSignal;

    async fn install_remote_description(
        &mut self,
        kind: SdpKind,
        description: &String,
    ) -> Result<(), TransportError> {
        let mut recorder = self.inner.lock();
        if recorder.busy {
            return Err(TransportError::Backpressure);
        }
        if recorder.reject_descriptions {
            return Err(TransportError::DescriptionRejected(description.clone()));
        }
        recorder
            .calls
            .push(TransportCall::RemoteDescription(kind, description.clone()));
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: &CandidateSignal) -> Result<(), TransportError> {
        let mut recorder = self.inner.lock();
        if recorder.busy {
            return Err(TransportError::Backpressure);
        }
        if recorder.reject_candidates {
            let line = candidate
                .as_ref()
                .map(|payload| payload.candidate.clone())
                .unwrap_or_default();
            return Err(TransportError::CandidateRejected(line));
        }
        recorder.calls.push(TransportCall::Candidate(candidate.clone()));
        Ok(())
    }

    async fn rollback_local_offer(&mut self) -> Result<(), TransportError> {
        self.inner.lock().calls.push(TransportCall::Rollback);
        Ok(())
    }
}

#[async_trait]
impl LocalDescriptions for RecordingTransport {
    async fn create_offer(&mut self) -> Result<String, TransportError> {
        Ok(self.author(SdpKind::Offer, TransportCall::CreateOffer))
    }

    async fn create_answer(&mut self) -> Result<String, TransportError> {
        Ok(self.author(SdpKind::Answer, TransportCall::CreateAnswer))
    }
}
