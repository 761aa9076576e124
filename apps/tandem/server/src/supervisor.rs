use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use tandem_core::Role;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_attempts: Some(5),
        }
    }
}

/// Doubling delay, capped at the policy maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        Self {
            initial: policy.initial_delay,
            max: policy.max_delay,
            current: policy.initial_delay,
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);
        self.attempts += 1;
        delay
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// The previous attempt lapsed; the next one is due after `retry_in`.
    Retry {
        role: Role,
        attempt: u32,
        retry_in: Duration,
    },
    Exhausted { role: Role, attempts: u32 },
}

#[derive(Debug)]
struct PendingReconnect {
    role: Role,
    backoff: Backoff,
    due: Instant,
}

/// Paces the surviving endpoint while its peer is away. Only one role can be
/// missing at a time; if both leave the session is gone anyway.
#[derive(Debug)]
pub struct ReconnectionSupervisor {
    policy: ReconnectPolicy,
    pending: Option<PendingReconnect>,
}

impl ReconnectionSupervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            pending: None,
        }
    }

    /// Starts supervising `role` and returns the delay before the first
    /// attempt lapses.
    pub fn on_disconnect(&mut self, role: Role, now: Instant) -> Duration {
        let mut backoff = Backoff::new(&self.policy);
        let delay = backoff.next_delay();
        self.pending = Some(PendingReconnect {
            role,
            backoff,
            due: now + delay,
        });
        debug!(%role, delay_ms = delay.as_millis() as u64, "reconnection window opened");
        delay
    }

    /// Returns true when `role` was being supervised.
    pub fn on_reconnected(&mut self, role: Role) -> bool {
        match &self.pending {
            Some(pending) if pending.role == role => {
                debug!(%role, attempts = pending.backoff.attempts(), "role reconnected");
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    pub fn supervising(&self) -> Option<Role> {
        self.pending.as_ref().map(|pending| pending.role)
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.pending.as_ref().map(|pending| pending.due)
    }

    pub fn poll_due(&mut self, now: Instant) -> Option<SupervisorEvent> {
        let pending = self.pending.as_mut()?;
        if now < pending.due {
            return None;
        }

        let attempts = pending.backoff.attempts();
        if self
            .policy
            .max_attempts
            .is_some_and(|max| attempts >= max)
        {
            let role = pending.role;
            self.pending = None;
            return Some(SupervisorEvent::Exhausted { role, attempts });
        }

        let retry_in = pending.backoff.next_delay();
        pending.due = now + retry_in;
        Some(SupervisorEvent::Retry {
            role: pending.role,
            attempt: pending.backoff.attempts(),
            retry_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
            max_attempts,
        }
    }

    #[test_timeout::timeout]
    fn backoff_doubles_up_to_the_cap_and_resets() {
        let mut backoff = Backoff::new(&policy(None));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 2000, 2000]);
        assert_eq!(backoff.attempts(), 5);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn attempts_lapse_until_exhausted() {
        let mut supervisor = ReconnectionSupervisor::new(policy(Some(3)));
        let start = Instant::now();
        let first = supervisor.on_disconnect(Role::Receiver, start);
        assert_eq!(first, Duration::from_millis(500));
        assert!(supervisor.poll_due(start).is_none());

        let mut events = Vec::new();
        while let Some(due) = supervisor.next_due() {
            events.extend(supervisor.poll_due(due));
        }
        assert_eq!(
            events,
            vec![
                SupervisorEvent::Retry {
                    role: Role::Receiver,
                    attempt: 2,
                    retry_in: Duration::from_millis(1000),
                },
                SupervisorEvent::Retry {
                    role: Role::Receiver,
                    attempt: 3,
                    retry_in: Duration::from_millis(2000),
                },
                SupervisorEvent::Exhausted {
                    role: Role::Receiver,
                    attempts: 3,
                },
            ]
        );
        assert!(supervisor.supervising().is_none());
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn reconnection_clears_supervision_and_restarts_from_initial_delay() {
        let mut supervisor = ReconnectionSupervisor::new(policy(Some(3)));
        let start = Instant::now();
        supervisor.on_disconnect(Role::Sender, start);
        let due = supervisor.next_due().unwrap();
        supervisor.poll_due(due);

        assert!(!supervisor.on_reconnected(Role::Receiver));
        assert!(supervisor.on_reconnected(Role::Sender));
        assert!(supervisor.next_due().is_none());

        let delay = supervisor.on_disconnect(Role::Sender, start);
        assert_eq!(delay, Duration::from_millis(500));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn unlimited_policy_never_exhausts() {
        let mut supervisor = ReconnectionSupervisor::new(policy(None));
        supervisor.on_disconnect(Role::Receiver, Instant::now());
        for _ in 0..50 {
            let due = supervisor.next_due().unwrap();
            assert!(matches!(
                supervisor.poll_due(due),
                Some(SupervisorEvent::Retry { .. })
            ));
        }
        assert_eq!(supervisor.supervising(), Some(Role::Receiver));
    }
}
