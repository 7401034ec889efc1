use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{BrokerError, DEFAULT_QUEUE_NAME, Delivery, TaskBroker, TaskMessage};

/// Default time a fetched delivery stays invisible before it is redelivered.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Message parked by `dead_letter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message: TaskMessage,
    pub reason: String,
}

#[derive(Debug)]
struct InFlight {
    message: TaskMessage,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<TaskMessage>,
    delayed: Vec<(Instant, TaskMessage)>,
    in_flight: HashMap<String, InFlight>,
    dead_letters: Vec<DeadLetter>,
    next_receipt: u64,
}

impl QueueState {
    /// Move due delayed messages and expired in-flight deliveries back to
    /// the ready queue.
    fn promote(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        self.delayed = pending;
        let mut due = due;
        due.sort_by_key(|(at, _)| *at);
        self.ready.extend(due.into_iter().map(|(_, message)| message));

        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(flight) = self.in_flight.remove(&receipt) {
                self.ready.push_back(flight.message);
            }
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let delayed = self.delayed.iter().map(|(at, _)| *at);
        let in_flight = self.in_flight.values().map(|flight| flight.visible_at);
        delayed.chain(in_flight).min()
    }
}

/// In-process broker for tests/dev.
///
/// Same delivery semantics as the Redis broker: late ack, delayed
/// redelivery and redelivery after the visibility timeout. `set_available`
/// simulates an outage.
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    queue_name: String,
    visibility_timeout: Duration,
    available: AtomicBool,
    state: Mutex<QueueState>,
    signal: Condvar,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_NAME)
    }
}

impl InMemoryTaskQueue {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            available: AtomicBool::new(true),
            state: Mutex::new(QueueState::default()),
            signal: Condvar::new(),
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// While unavailable, every operation fails with `BrokerError::Connection`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        self.signal.notify_all();
    }

    /// Messages that are deliverable right now or scheduled for later.
    pub fn pending_len(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.ready.len() + s.delayed.len())
            .unwrap_or(0)
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().map(|s| s.in_flight.len()).unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state
            .lock()
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Connection(format!(
                "queue '{}' is unavailable",
                self.queue_name
            )))
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, QueueState>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Command("in-memory queue lock poisoned".to_string()))
    }
}

impl TaskBroker for InMemoryTaskQueue {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn enqueue(&self, message: TaskMessage) -> Result<(), BrokerError> {
        self.check_available()?;
        self.lock_state()?.ready.push_back(message);
        self.signal.notify_one();
        Ok(())
    }

    fn enqueue_after(&self, message: TaskMessage, delay: Duration) -> Result<(), BrokerError> {
        if delay.is_zero() {
            return self.enqueue(message);
        }
        self.check_available()?;
        self.lock_state()?
            .delayed
            .push((Instant::now() + delay, message));
        // Waiters recompute their deadline.
        self.signal.notify_all();
        Ok(())
    }

    fn fetch(&self, _consumer: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        let mut state = self.lock_state()?;

        loop {
            self.check_available()?;

            let now = Instant::now();
            state.promote(now);

            if let Some(message) = state.ready.pop_front() {
                state.next_receipt += 1;
                let receipt = format!("{}-{}", self.queue_name, state.next_receipt);
                state.in_flight.insert(
                    receipt.clone(),
                    InFlight {
                        message: message.clone(),
                        visible_at: now + self.visibility_timeout,
                    },
                );
                return Ok(Some(Delivery { receipt, message }));
            }

            if now >= deadline {
                return Ok(None);
            }

            let wake_at = state
                .next_wakeup()
                .map_or(deadline, |at| at.min(deadline));
            let timeout = wake_at.saturating_duration_since(now);
            state = self
                .signal
                .wait_timeout(state, timeout)
                .map_err(|_| BrokerError::Command("in-memory queue lock poisoned".to_string()))?
                .0;
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.check_available()?;
        self.lock_state()?.in_flight.remove(&delivery.receipt);
        Ok(())
    }

    fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError> {
        self.check_available()?;
        let mut state = self.lock_state()?;
        state.in_flight.remove(&delivery.receipt);
        state.dead_letters.push(DeadLetter {
            message: delivery.message.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobq_core::JobId;

    const NO_WAIT: Duration = Duration::ZERO;

    fn msg(id: i64) -> TaskMessage {
        TaskMessage::process_job(JobId::new(id))
    }

    #[test]
    fn delivers_in_fifo_order_and_hides_in_flight() {
        let queue = InMemoryTaskQueue::default();
        queue.enqueue(msg(1)).unwrap();
        queue.enqueue(msg(2)).unwrap();

        let first = queue.fetch("w", NO_WAIT).unwrap().unwrap();
        let second = queue.fetch("w", NO_WAIT).unwrap().unwrap();
        assert_eq!(first.message.job_id.get(), 1);
        assert_eq!(second.message.job_id.get(), 2);
        assert!(queue.fetch("w", NO_WAIT).unwrap().is_none());
        assert_eq!(queue.in_flight_len(), 2);

        queue.ack(&first).unwrap();
        queue.ack(&first).unwrap();
        assert_eq!(queue.in_flight_len(), 1);
    }

    #[test]
    fn unacked_delivery_comes_back_after_visibility_timeout() {
        let queue = InMemoryTaskQueue::default().with_visibility_timeout(Duration::from_millis(20));
        queue.enqueue(msg(7)).unwrap();

        let lost = queue.fetch("w", NO_WAIT).unwrap().unwrap();
        assert!(queue.fetch("w", NO_WAIT).unwrap().is_none());

        let again = queue
            .fetch("w", Duration::from_millis(500))
            .unwrap()
            .expect("redelivered");
        assert_eq!(again.message, lost.message);
        assert_ne!(again.receipt, lost.receipt);
    }

    #[test]
    fn delayed_messages_wait_their_turn() {
        let queue = InMemoryTaskQueue::default();
        queue
            .enqueue_after(msg(1), Duration::from_millis(30))
            .unwrap();
        assert!(queue.fetch("w", NO_WAIT).unwrap().is_none());
        assert_eq!(queue.pending_len(), 1);

        let started = Instant::now();
        let delivery = queue.fetch("w", Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(delivery.message.job_id.get(), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn reschedule_settles_and_bumps_attempt() {
        let queue = InMemoryTaskQueue::default();
        queue.enqueue(msg(4)).unwrap();
        let delivery = queue.fetch("w", NO_WAIT).unwrap().unwrap();

        queue.reschedule(&delivery, Duration::ZERO).unwrap();
        assert_eq!(queue.in_flight_len(), 0);

        let retry = queue.fetch("w", NO_WAIT).unwrap().unwrap();
        assert_eq!(retry.message.attempt, 1);
        assert_eq!(retry.message.job_id.get(), 4);
    }

    #[test]
    fn dead_letter_records_reason() {
        let queue = InMemoryTaskQueue::default();
        queue.enqueue(msg(9)).unwrap();
        let delivery = queue.fetch("w", NO_WAIT).unwrap().unwrap();

        queue.dead_letter(&delivery, "boom").unwrap();
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "boom");
        assert_eq!(queue.in_flight_len(), 0);
    }

    #[test]
    fn unavailable_queue_rejects_operations() {
        let queue = InMemoryTaskQueue::default();
        queue.set_available(false);
        assert!(matches!(queue.enqueue(msg(1)), Err(BrokerError::Connection(_))));
        assert!(queue.fetch("w", NO_WAIT).is_err());

        queue.set_available(true);
        queue.enqueue(msg(1)).unwrap();
        assert_eq!(queue.pending_len(), 1);
    }
}
