//! Bounded per-call event queue.
//!
//! Overflow policy: when the queue is full and another event arrives, the
//! oldest *interim transcript* is dropped and counted. Finals, TC events,
//! and control events are never dropped; they may push the queue past its
//! soft capacity, which is bounded in practice by call activity.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::session::SessionEvent;

pub struct SessionQueue {
    inner: Mutex<VecDeque<SessionEvent>>,
    notify: Notify,
    capacity: usize,
}

fn is_droppable(event: &SessionEvent) -> bool {
    matches!(event, SessionEvent::Stt(Ok(result)) if !result.is_final)
}

impl SessionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue an event, applying the overflow policy.
    pub fn push(&self, event: SessionEvent) {
        {
            let mut queue = self.inner.lock();
            if queue.len() >= self.capacity {
                if let Some(pos) = queue.iter().position(is_droppable) {
                    queue.remove(pos);
                    metrics::counter!("session_interims_dropped_total").increment(1);
                } else if is_droppable(&event) {
                    // Nothing older to shed and the newcomer is itself an
                    // interim: shed it instead.
                    metrics::counter!("session_interims_dropped_total").increment(1);
                    return;
                }
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Dequeue the next event, waiting if the queue is empty.
    pub async fn pop(&self) -> SessionEvent {
        loop {
            if let Some(event) = self.inner.lock().pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
