//! Correlation of engine output with waiting callers.
//!
//! The engine protocol has no request identifiers, so a caller waiting for a
//! reply simply receives the next line the engine prints. Waiters are served
//! strictly first-in, first-out. The reply may be an intermediate progress
//! line rather than the final answer to the command; that is a property of
//! the wrapped protocol and is not corrected here.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use protocol::ReplyOutcome;
use tokio::sync::oneshot;

/// A resolved reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineReply {
    /// The reply line, possibly empty.
    pub line: String,
    /// How the reply was resolved.
    pub outcome: ReplyOutcome,
}

impl EngineReply {
    fn new(line: impl Into<String>, outcome: ReplyOutcome) -> Self {
        Self {
            line: line.into(),
            outcome,
        }
    }

    /// Whether a fresh line answered the wait.
    pub fn is_fresh(&self) -> bool {
        self.outcome == ReplyOutcome::Line
    }
}

/// Identifies one queued waiter so it can withdraw itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

struct Waiter {
    ticket: Ticket,
    tx: oneshot::Sender<EngineReply>,
}

/// Output log plus the queue of callers waiting for the next line.
pub struct ReplyQueue {
    log: Vec<String>,
    last_line: String,
    pending: VecDeque<Waiter>,
    next_ticket: u64,
    closed: bool,
}

impl ReplyQueue {
    /// Creates an empty, open queue.
    pub fn new() -> Self {
        Self {
            log: Vec::new(),
            last_line: String::new(),
            pending: VecDeque::new(),
            next_ticket: 0,
            closed: false,
        }
    }

    /// Queues a waiter for the next line.
    ///
    /// Once the queue is closed this returns the termination reply instead.
    pub fn enqueue(&mut self) -> Result<(Ticket, oneshot::Receiver<EngineReply>), EngineReply> {
        if self.closed {
            return Err(self.terminated_reply());
        }

        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;

        let (tx, rx) = oneshot::channel();
        self.pending.push_back(Waiter { ticket, tx });
        Ok((ticket, rx))
    }

    /// Records a line and hands it to the oldest live waiter.
    ///
    /// Returns `true` if a waiter received the line.
    pub fn push_line(&mut self, line: String) -> bool {
        self.log.push(line.clone());
        self.last_line.clone_from(&line);

        // Skip waiters whose caller has gone away.
        while let Some(waiter) = self.pending.pop_front() {
            if waiter
                .tx
                .send(EngineReply::new(line.clone(), ReplyOutcome::Line))
                .is_ok()
            {
                return true;
            }
        }
        false
    }

    /// Withdraws a waiter. Returns `false` if it was already resolved.
    pub fn cancel(&mut self, ticket: Ticket) -> bool {
        match self.pending.iter().position(|w| w.ticket == ticket) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Closes the queue, resolving every waiter with the termination reply.
    ///
    /// Returns the number of waiters resolved.
    pub fn close(&mut self) -> usize {
        self.closed = true;
        let reply = self.terminated_reply();
        let count = self.pending.len();
        for waiter in self.pending.drain(..) {
            let _ = waiter.tx.send(reply.clone());
        }
        count
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The most recent line, or empty.
    pub fn last_line(&self) -> &str {
        &self.last_line
    }

    /// Every line received so far.
    pub fn log(&self) -> &[String] {
        &self.log
    }

    /// The last `n` lines received.
    pub fn recent(&self, n: usize) -> &[String] {
        let start = self.log.len().saturating_sub(n);
        &self.log[start..]
    }

    /// Number of waiters still queued.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Reply used when a wait times out.
    pub fn timed_out_reply(&self) -> EngineReply {
        EngineReply::new(self.last_line.clone(), ReplyOutcome::TimedOut)
    }

    /// Reply used when the engine has terminated.
    pub fn terminated_reply(&self) -> EngineReply {
        EngineReply::new(self.last_line.clone(), ReplyOutcome::Terminated)
    }
}

impl Default for ReplyQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Locks a queue, recovering from poisoning.
pub(crate) fn lock(queue: &Mutex<ReplyQueue>) -> MutexGuard<'_, ReplyQueue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Waits for a queued waiter to resolve, for at most `timeout`.
///
/// On timeout the waiter is withdrawn from the queue so it cannot swallow a
/// later line, and the last known line is returned. If the line raced the
/// timer, the delivered line wins.
pub async fn wait_for_reply(
    queue: &Mutex<ReplyQueue>,
    ticket: Ticket,
    mut rx: oneshot::Receiver<EngineReply>,
    timeout: Duration,
) -> EngineReply {
    match tokio::time::timeout(timeout, &mut rx).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(_)) => lock(queue).terminated_reply(),
        Err(_) => {
            let mut guard = lock(queue);
            if guard.cancel(ticket) {
                return guard.timed_out_reply();
            }
            // Resolved while we were taking the lock: the sender ran under
            // the same lock, so the value is already in the channel.
            drop(guard);
            match rx.try_recv() {
                Ok(reply) => reply,
                Err(_) => lock(queue).terminated_reply(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_push_without_waiters_only_logs() {
        let mut queue = ReplyQueue::new();
        assert!(!queue.push_line("info string hello".to_string()));
        assert_eq!(queue.log(), ["info string hello"]);
        assert_eq!(queue.last_line(), "info string hello");
    }

    #[test]
    fn test_waiters_fulfilled_in_fifo_order() {
        let mut queue = ReplyQueue::new();
        let (_, mut first) = queue.enqueue().unwrap();
        let (_, mut second) = queue.enqueue().unwrap();
        let (_, mut third) = queue.enqueue().unwrap();

        assert!(queue.push_line("a".to_string()));
        assert!(queue.push_line("b".to_string()));
        assert!(queue.push_line("c".to_string()));

        assert_eq!(first.try_recv().unwrap().line, "a");
        assert_eq!(second.try_recv().unwrap().line, "b");
        assert_eq!(third.try_recv().unwrap().line, "c");
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn test_interleaved_enqueue_and_lines() {
        let mut queue = ReplyQueue::new();

        let (_, mut first) = queue.enqueue().unwrap();
        queue.push_line("one".to_string());
        queue.push_line("unsolicited".to_string());
        let (_, mut second) = queue.enqueue().unwrap();
        let (_, mut third) = queue.enqueue().unwrap();
        queue.push_line("two".to_string());

        assert_eq!(first.try_recv().unwrap().line, "one");
        assert_eq!(second.try_recv().unwrap().line, "two");
        assert!(third.try_recv().is_err());
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn test_dropped_waiter_is_skipped() {
        let mut queue = ReplyQueue::new();
        let (_, gone) = queue.enqueue().unwrap();
        let (_, mut live) = queue.enqueue().unwrap();
        drop(gone);

        assert!(queue.push_line("readyok".to_string()));
        let reply = live.try_recv().unwrap();
        assert_eq!(reply.line, "readyok");
        assert!(reply.is_fresh());
    }

    #[test]
    fn test_cancel_removes_only_that_waiter() {
        let mut queue = ReplyQueue::new();
        let (first_ticket, _first) = queue.enqueue().unwrap();
        let (_, mut second) = queue.enqueue().unwrap();

        assert!(queue.cancel(first_ticket));
        assert!(!queue.cancel(first_ticket));

        queue.push_line("bestmove a0a1".to_string());
        assert_eq!(second.try_recv().unwrap().line, "bestmove a0a1");
    }

    #[test]
    fn test_close_resolves_everyone() {
        let mut queue = ReplyQueue::new();
        queue.push_line("info depth 3".to_string());
        let (_, mut a) = queue.enqueue().unwrap();
        let (_, mut b) = queue.enqueue().unwrap();

        assert_eq!(queue.close(), 2);
        assert_eq!(queue.pending_len(), 0);

        for rx in [&mut a, &mut b] {
            let reply = rx.try_recv().unwrap();
            assert_eq!(reply.outcome, ReplyOutcome::Terminated);
            assert_eq!(reply.line, "info depth 3");
        }
    }

    #[test]
    fn test_enqueue_after_close_resolves_immediately() {
        let mut queue = ReplyQueue::new();
        queue.close();
        let reply = queue.enqueue().unwrap_err();
        assert_eq!(reply.outcome, ReplyOutcome::Terminated);
        assert_eq!(reply.line, "");
        assert!(queue.is_closed());
    }

    #[test]
    fn test_recent_lines() {
        let mut queue = ReplyQueue::new();
        assert!(queue.recent(3).is_empty());
        for line in ["1", "2", "3", "4"] {
            queue.push_line(line.to_string());
        }
        assert_eq!(queue.recent(3), ["2", "3", "4"]);
        assert_eq!(queue.recent(10).len(), 4);
    }

    #[tokio::test]
    async fn test_wait_times_out_with_last_line() {
        let queue = Mutex::new(ReplyQueue::new());
        lock(&queue).push_line("uciok".to_string());
        let (ticket, rx) = lock(&queue).enqueue().unwrap();

        let start = std::time::Instant::now();
        let reply = wait_for_reply(&queue, ticket, rx, Duration::from_millis(50)).await;

        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(reply.outcome, ReplyOutcome::TimedOut);
        assert_eq!(reply.line, "uciok");
        // The timed-out waiter must not linger and steal a later line.
        assert_eq!(lock(&queue).pending_len(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_waiter_does_not_consume_next_line() {
        let queue = Mutex::new(ReplyQueue::new());
        let (ticket, rx) = lock(&queue).enqueue().unwrap();
        let reply = wait_for_reply(&queue, ticket, rx, Duration::from_millis(10)).await;
        assert_eq!(reply.outcome, ReplyOutcome::TimedOut);
        assert_eq!(reply.line, "");

        let (ticket, rx) = lock(&queue).enqueue().unwrap();
        lock(&queue).push_line("readyok".to_string());
        let reply = wait_for_reply(&queue, ticket, rx, Duration::from_secs(1)).await;
        assert_eq!(reply.line, "readyok");
        assert_eq!(reply.outcome, ReplyOutcome::Line);
    }

    #[tokio::test]
    async fn test_wait_resolved_by_line_from_another_task() {
        let queue = Arc::new(Mutex::new(ReplyQueue::new()));
        let (ticket, rx) = lock(&queue).enqueue().unwrap();

        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            lock(&producer).push_line("bestmove h2e2".to_string());
        });

        let reply = wait_for_reply(&queue, ticket, rx, Duration::from_secs(5)).await;
        assert_eq!(reply.line, "bestmove h2e2");
        assert!(reply.is_fresh());
    }

    #[tokio::test]
    async fn test_wait_resolved_by_close() {
        let queue = Arc::new(Mutex::new(ReplyQueue::new()));
        let (ticket, rx) = lock(&queue).enqueue().unwrap();

        let closer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            lock(&closer).close();
        });

        let start = std::time::Instant::now();
        let reply = wait_for_reply(&queue, ticket, rx, Duration::from_secs(10)).await;
        assert_eq!(reply.outcome, ReplyOutcome::Terminated);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
