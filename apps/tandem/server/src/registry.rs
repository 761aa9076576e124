use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use tandem_core::{CloseReason, EndpointId, Role};

use crate::relay::{EndpointHandle, RelayFrame, RouteError, RouteOutcome};
use crate::session::{
    Departure, Registration, Session, SessionCommand, SessionConfig, SessionSnapshot,
};
use crate::telemetry::{ENDPOINTS_REGISTERED, SESSIONS_ACTIVE};

const COMMAND_QUEUE_DEPTH: usize = 256;
/// A session task can finish between lookup and delivery; retry against a
/// fresh one this many times.
const REGISTER_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("unrecognized role {0:?}")]
    InvalidRole(String),
    #[error("session limit of {limit} reached")]
    SessionLimitReached { limit: usize },
    #[error("session could not accept the registration")]
    SessionUnavailable,
}

impl RegistrationError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RegistrationError::InvalidRole(_) => "invalid_role",
            RegistrationError::SessionLimitReached { .. } => "session_limit",
            RegistrationError::SessionUnavailable => "session_unavailable",
        }
    }

    pub fn close_reason(&self) -> CloseReason {
        match self {
            RegistrationError::InvalidRole(_) => CloseReason::InvalidRole,
            RegistrationError::SessionLimitReached { .. } => CloseReason::SessionLimit,
            RegistrationError::SessionUnavailable => CloseReason::Shutdown,
        }
    }
}

#[derive(Clone)]
struct SessionHandle {
    generation: u64,
    commands: mpsc::Sender<SessionCommand>,
}

/// Maps session ids to their tasks and endpoints to their sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: DashMap<String, SessionHandle>,
    endpoints: DashMap<EndpointId, String>,
    config: SessionConfig,
    active: AtomicUsize,
    generations: AtomicU64,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                endpoints: DashMap::new(),
                config,
                active: AtomicUsize::new(0),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub async fn register(
        &self,
        session_id: &str,
        endpoint: EndpointHandle,
        role: &str,
    ) -> Result<Registration, RegistrationError> {
        let role: Role = role
            .parse()
            .map_err(|_| RegistrationError::InvalidRole(role.to_string()))?;

        for _ in 0..REGISTER_ATTEMPTS {
            let handle = self.session_handle(session_id)?;
            let (reply, response) = oneshot::channel();
            let command = SessionCommand::Register {
                endpoint: endpoint.clone(),
                role,
                reply,
            };
            if handle.commands.send(command).await.is_ok() {
                if let Ok(registration) = response.await {
                    self.inner
                        .endpoints
                        .insert(endpoint.id.clone(), session_id.to_string());
                    counter!(ENDPOINTS_REGISTERED, 1, "role" => role.as_str());
                    return Ok(registration);
                }
            }
            debug!(session_id, "session task finished during registration; retrying");
            self.forget(session_id, handle.generation);
        }
        warn!(session_id, endpoint_id = %endpoint.id, "registration failed repeatedly");
        Err(RegistrationError::SessionUnavailable)
    }

    /// Returns whether the endpoint still held a role. Safe to call any number
    /// of times.
    pub async fn unregister(&self, endpoint: &EndpointId, departure: Departure) -> bool {
        let Some((_, session_id)) = self.inner.endpoints.remove(endpoint) else {
            return false;
        };
        let Some(handle) = self.handle(&session_id) else {
            return false;
        };
        let (reply, response) = oneshot::channel();
        let command = SessionCommand::Unregister {
            endpoint: endpoint.clone(),
            departure,
            reply,
        };
        if handle.commands.send(command).await.is_err() {
            return false;
        }
        response.await.unwrap_or(false)
    }

    pub async fn route(
        &self,
        from: &EndpointId,
        frame: RelayFrame,
    ) -> Result<RouteOutcome, RouteError> {
        if !frame.message.is_relayed() {
            return Err(RouteError::NotRelayable {
                event: frame.event(),
            });
        }
        let session_id = self
            .inner
            .endpoints
            .get(from)
            .map(|entry| entry.value().clone())
            .ok_or(RouteError::NotRegistered)?;
        let handle = self.handle(&session_id).ok_or(RouteError::SessionGone)?;
        let (reply, response) = oneshot::channel();
        let command = SessionCommand::Route {
            from: from.clone(),
            frame,
            reply,
        };
        handle
            .commands
            .send(command)
            .await
            .map_err(|_| RouteError::SessionGone)?;
        response.await.map_err(|_| RouteError::SessionGone)?
    }

    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let handles: Vec<SessionHandle> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            let (reply, response) = oneshot::channel();
            if handle
                .commands
                .send(SessionCommand::Snapshot { reply })
                .await
                .is_err()
            {
                continue;
            }
            if let Ok(snapshot) = response.await {
                snapshots.push(snapshot);
            }
        }
        snapshots.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        snapshots
    }

    /// Closes every session, telling both endpoints the server is going away.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in handles {
            let _ = handle.commands.send(SessionCommand::Shutdown).await;
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.len()
    }

    fn handle(&self, session_id: &str) -> Option<SessionHandle> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    fn session_handle(&self, session_id: &str) -> Result<SessionHandle, RegistrationError> {
        if let Some(handle) = self.handle(session_id) {
            return Ok(handle);
        }

        let limit = self.inner.config.max_sessions;
        let reserved = self
            .inner
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < limit).then_some(active + 1)
            });
        if reserved.is_err() {
            warn!(session_id, limit, "refusing new session");
            return Err(RegistrationError::SessionLimitReached { limit });
        }

        match self.inner.sessions.entry(session_id.to_string()) {
            Entry::Occupied(entry) => {
                self.inner.active.fetch_sub(1, Ordering::SeqCst);
                Ok(entry.get().clone())
            }
            Entry::Vacant(entry) => {
                let handle = self.spawn_session(session_id);
                entry.insert(handle.clone());
                gauge!(SESSIONS_ACTIVE, self.inner.active.load(Ordering::SeqCst) as f64);
                Ok(handle)
            }
        }
    }

    fn spawn_session(&self, session_id: &str) -> SessionHandle {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let (commands, inbox) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let session = Session::new(session_id.to_string(), self.inner.config.clone());
        let registry = self.clone();
        let id = session_id.to_string();
        tokio::spawn(async move {
            session.run(inbox).await;
            registry.forget(&id, generation);
        });
        debug!(session_id, generation, "session created");
        SessionHandle {
            generation,
            commands,
        }
    }

    fn forget(&self, session_id: &str, generation: u64) {
        let removed = self
            .inner
            .sessions
            .remove_if(session_id, |_, handle| handle.generation == generation);
        if removed.is_some() {
            let active = self.inner.active.fetch_sub(1, Ordering::SeqCst) - 1;
            gauge!(SESSIONS_ACTIVE, active as f64);
            debug!(session_id, generation, "session removed");
        }
    }
}
