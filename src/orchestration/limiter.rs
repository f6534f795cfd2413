//! Global admission control for collaborator invocations.
//!
//! Every edit or review call must hold an [`InvocationPermit`]. When all
//! slots are busy, callers park in a priority queue (priority ascending,
//! then arrival order) and are granted a permit as slots free up. A permit
//! releases its slot exactly once, on drop, so completion, error, and
//! cancellation all release the same way.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::clog_trace;
use crate::core::task::TaskId;
use crate::error::{Error, Result};

/// Admission priority. Lower ranks are admitted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum InvocationPriority {
    /// Reviews outrank edits: a passing review unblocks downstream tasks.
    Review = 0,
    Edit = 1,
}

/// A waiter parked in the queue.
struct QueuedInvocation {
    priority: InvocationPriority,
    seq: u64,
    requester: String,
    task_id: Option<TaskId>,
    enqueued_at: DateTime<Utc>,
    grant: oneshot::Sender<InvocationPermit>,
}

impl PartialEq for QueuedInvocation {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedInvocation {}

impl Ord for QueuedInvocation {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest entry, so invert: lowest priority
        // rank first, then earliest sequence number.
        other
            .priority
            .cmp(&self.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedInvocation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Snapshot of one queued waiter, for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedInvocationInfo {
    pub requester: String,
    pub task_id: Option<TaskId>,
    pub enqueued_at: DateTime<Utc>,
}

struct Inner {
    max_concurrent: usize,
    active: usize,
    queue: BinaryHeap<QueuedInvocation>,
    next_seq: u64,
}

/// Counting limiter over all collaborator invocations.
#[derive(Clone)]
pub struct InvocationLimiter {
    inner: Arc<Mutex<Inner>>,
}

/// Held for the duration of one invocation; releases its slot on drop.
pub struct InvocationPermit {
    inner: Arc<Mutex<Inner>>,
    released: bool,
}

impl InvocationLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                max_concurrent: max_concurrent.max(1),
                active: 0,
                queue: BinaryHeap::new(),
                next_seq: 0,
            })),
        }
    }

    /// Acquire a slot, waiting in the priority queue when none is free.
    ///
    /// Errors with `InvocationQueueClosed` when the queue is drained while
    /// waiting (session shutdown). Dropping the returned future while
    /// queued simply abandons the spot; no slot is consumed.
    pub async fn acquire(
        &self,
        priority: InvocationPriority,
        requester: &str,
        task_id: Option<TaskId>,
    ) -> Result<InvocationPermit> {
        let rx = {
            let mut inner = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if inner.active < inner.max_concurrent {
                inner.active += 1;
                clog_trace!(
                    "limiter: immediate grant to {} ({}/{} active)",
                    requester,
                    inner.active,
                    inner.max_concurrent
                );
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.queue.push(QueuedInvocation {
                    priority,
                    seq,
                    requester: requester.to_string(),
                    task_id,
                    enqueued_at: Utc::now(),
                    grant: tx,
                });
                clog_trace!(
                    "limiter: queued {} at priority {:?} (queue depth {})",
                    requester,
                    priority,
                    inner.queue.len()
                );
                Some(rx)
            }
        };

        match rx {
            None => Ok(self.make_permit()),
            Some(rx) => rx.await.map_err(|_| Error::InvocationQueueClosed),
        }
    }

    fn make_permit(&self) -> InvocationPermit {
        InvocationPermit {
            inner: Arc::clone(&self.inner),
            released: false,
        }
    }

    /// Release one slot and hand it to the best waiter, if any.
    fn release_slot(inner: &Arc<Mutex<Inner>>) {
        let grant = {
            let mut guard = match inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.active = guard.active.saturating_sub(1);
            match guard.queue.pop() {
                Some(waiter) => {
                    guard.active += 1;
                    Some(waiter.grant)
                }
                None => None,
            }
        };

        if let Some(grant) = grant {
            let permit = InvocationPermit {
                inner: Arc::clone(inner),
                released: false,
            };
            // A waiter that stopped listening (cancelled while queued) drops
            // the returned permit, which re-runs release and admits the
            // next waiter.
            let _ = grant.send(permit);
        }
    }

    /// Reject every queued waiter. Held permits are unaffected.
    pub fn drain(&self) {
        let waiters = {
            let mut guard = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut guard.queue)
        };
        clog_trace!("limiter: drained {} queued waiter(s)", waiters.len());
        // Dropping the grant senders resolves the waiters with an error.
        drop(waiters);
    }

    pub fn active_count(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.active,
            Err(poisoned) => poisoned.into_inner().active,
        }
    }

    pub fn queued_count(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.queue.len(),
            Err(poisoned) => poisoned.into_inner().queue.len(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        match self.inner.lock() {
            Ok(guard) => guard.max_concurrent,
            Err(poisoned) => poisoned.into_inner().max_concurrent,
        }
    }

    /// Queued waiters, best-first.
    pub fn queue_snapshot(&self) -> Vec<QueuedInvocationInfo> {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut waiters: Vec<&QueuedInvocation> = guard.queue.iter().collect();
        waiters.sort_by(|a, b| b.cmp(a));
        waiters
            .into_iter()
            .map(|w| QueuedInvocationInfo {
                requester: w.requester.clone(),
                task_id: w.task_id,
                enqueued_at: w.enqueued_at,
            })
            .collect()
    }
}

impl Drop for InvocationPermit {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            InvocationLimiter::release_slot(&self.inner);
        }
    }
}
