//! Command/reply and background-job correlation
//!
//! Two mechanisms coexist because the protocol has two asynchronous
//! patterns: replies arrive in command send order (FIFO, with events freely
//! interleaved), and background jobs complete later through the event stream
//! keyed by a job identifier.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::error::{EslError, EslResult};
use crate::event::Event;

/// Outcome of routing a reply frame to the FIFO queue.
pub(crate) enum ReplyDelivery {
    /// Delivered to the oldest pending command.
    Delivered,
    /// The oldest slot had timed out; the reply was consumed and discarded to
    /// keep later commands correctly paired.
    Abandoned { waited: std::time::Duration },
    /// No command was pending at all.
    NoPending,
}

/// Outcome of routing a background-job completion event.
pub(crate) enum JobDelivery {
    /// Delivered to the registered waiter.
    Delivered,
    /// The waiter had timed out; the completion was discarded.
    Abandoned,
    /// No waiter was registered; the event is handed back for normal
    /// listener dispatch.
    NoWaiter(Event),
}

struct PendingCommand {
    id: u64,
    /// `None` once the waiting caller timed out. The slot stays queued so the
    /// reader still consumes exactly one reply for it.
    tx: Option<oneshot::Sender<Event>>,
    sent_at: Instant,
}

#[derive(Default)]
struct Inner {
    pending: VecDeque<PendingCommand>,
    jobs: HashMap<String, oneshot::Sender<Event>>,
    next_id: u64,
    closed: bool,
}

/// Shared correlation state, guarded by a mutex distinct from the write lock
/// so the reader can resolve a reply while another task writes a command.
pub(crate) struct Correlator {
    inner: Mutex<Inner>,
}

impl Correlator {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Push a pending command onto the FIFO queue.
    ///
    /// Must be called under the connection write lock, before the command
    /// frame is written, so queue order matches wire order.
    pub(crate) fn enqueue(&self) -> EslResult<(u64, oneshot::Receiver<Event>)> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(EslError::ConnectionClosed);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        let (tx, rx) = oneshot::channel();
        inner
            .pending
            .push_back(PendingCommand {
                id,
                tx: Some(tx),
                sent_at: Instant::now(),
            });
        Ok((id, rx))
    }

    /// Mark a specific pending command abandoned after its caller timed out.
    ///
    /// The slot is located by identity, not position — the queue may have
    /// moved on. It stays queued so its eventual reply is consumed and
    /// discarded rather than delivered to the wrong command.
    pub(crate) fn abandon(&self, id: u64) {
        let mut inner = self.lock();
        if let Some(slot) = inner
            .pending
            .iter_mut()
            .find(|p| p.id == id)
        {
            slot.tx = None;
        }
    }

    /// Drop a pending command from the queue entirely.
    ///
    /// Only valid when the command frame never reached the wire (a write
    /// failure): no reply will arrive, so unlike [`abandon`](Self::abandon)
    /// the slot must not stay queued to consume one.
    pub(crate) fn remove(&self, id: u64) {
        self.lock()
            .pending
            .retain(|p| p.id != id);
    }

    /// Resolve the oldest pending command with a reply frame.
    pub(crate) fn deliver_reply(&self, event: Event) -> ReplyDelivery {
        let slot = match self
            .lock()
            .pending
            .pop_front()
        {
            Some(slot) => slot,
            None => return ReplyDelivery::NoPending,
        };
        let waited = slot
            .sent_at
            .elapsed();
        match slot.tx {
            // Send fails when the receiver is gone; the caller is no longer
            // listening either way.
            Some(tx) => {
                if tx.send(event).is_ok() {
                    ReplyDelivery::Delivered
                } else {
                    ReplyDelivery::Abandoned { waited }
                }
            }
            None => ReplyDelivery::Abandoned { waited },
        }
    }

    /// Register interest in a background job's completion event.
    ///
    /// Registered before the `bgapi` command is written, so a fast completion
    /// cannot race past the waiter.
    pub(crate) fn register_job(&self, job_id: &str) -> EslResult<oneshot::Receiver<Event>> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(EslError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        inner
            .jobs
            .insert(job_id.to_string(), tx);
        Ok(rx)
    }

    /// Drop a job waiter after its `bgapi` command failed to send. A
    /// completion for the id, should one somehow arrive, falls through to
    /// listener dispatch.
    pub(crate) fn cancel_job(&self, job_id: &str) {
        self.lock()
            .jobs
            .remove(job_id);
    }

    /// Route a completion event to its job waiter, if one is registered.
    pub(crate) fn complete_job(&self, job_id: &str, event: Event) -> JobDelivery {
        let waiter = self
            .lock()
            .jobs
            .remove(job_id);
        match waiter {
            Some(tx) => match tx.send(event) {
                Ok(()) => JobDelivery::Delivered,
                Err(_) => JobDelivery::Abandoned,
            },
            None => JobDelivery::NoWaiter(event),
        }
    }

    /// Whether the connection has torn down.
    pub(crate) fn is_closed(&self) -> bool {
        self.lock()
            .closed
    }

    /// Release every pending command and job waiter with a connection-closed
    /// failure, and reject all future enqueues. Idempotent.
    pub(crate) fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        // Dropping the senders resolves every waiting receiver with an error,
        // which the callers map to ConnectionClosed.
        inner
            .pending
            .clear();
        inner
            .jobs
            .clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .expect("correlator state poisoned")
    }
}
