use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A candidate held back until the remote description it depends on has been
/// installed.
#[derive(Debug, Clone)]
pub struct BufferedCandidate<C> {
    pub candidate: C,
    pub received_at: Instant,
}

impl<C> BufferedCandidate<C> {
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}

/// FIFO queue of early candidates. Flushing hands every entry back in arrival
/// order and leaves the buffer empty, so each candidate is released once.
#[derive(Debug)]
pub struct CandidateBuffer<C> {
    queue: VecDeque<BufferedCandidate<C>>,
}

impl<C> Default for CandidateBuffer<C> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
}

impl<C> CandidateBuffer<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, candidate: C) -> usize {
        self.queue.push_back(BufferedCandidate {
            candidate,
            received_at: Instant::now(),
        });
        self.queue.len()
    }

    pub fn flush(&mut self) -> Vec<BufferedCandidate<C>> {
        self.queue.drain(..).collect()
    }

    /// Discards everything without releasing it; returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn oldest(&self) -> Option<&BufferedCandidate<C>> {
        self.queue.front()
    }
}
