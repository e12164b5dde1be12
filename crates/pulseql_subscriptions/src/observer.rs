//! Per-operation message observer.
//!
//! One observer exists per `(connection, operation id)` pair. A single
//! bounded channel gives it buffering, producer backpressure and reader
//! wake-up in one primitive; terminal and disposed state live in a
//! CAS-guarded atomic that every push checks *before* enqueuing, so no
//! data message can follow a terminal message into the buffer.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use pulseql_protocol::{OperationId, OperationMessage};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::timeout;

use crate::config::SubscriptionConfig;
use crate::error::SubscriptionError;

const ACTIVE: u8 = 0;
const TERMINAL: u8 = 1;
const DISPOSED: u8 = 2;

struct Inner {
    id: OperationId,
    tx: mpsc::Sender<OperationMessage>,
    rx: Mutex<mpsc::Receiver<OperationMessage>>,
    /// ACTIVE → TERMINAL → DISPOSED, or ACTIVE → DISPOSED. Never moves
    /// backwards.
    state: AtomicU8,
    /// Set once the terminal message (or terminal error) has been handed
    /// to the reader.
    drained: AtomicBool,
    /// Terminal error slot; first error wins.
    error: StdMutex<Option<SubscriptionError>>,
    /// Wakes a suspended reader on `fail` or `dispose`.
    wake: Notify,
    stall_timeout: Duration,
    buffer_capacity: usize,
}

/// Buffered consumer for exactly one subscription operation.
///
/// Cloning is cheap and shares the same underlying buffer; the router
/// keeps one clone for pushing while the drain loop holds another for
/// reading. Only one reader may drain at a time.
#[derive(Clone)]
pub struct OperationObserver {
    inner: Arc<Inner>,
}

impl OperationObserver {
    /// Creates an observer for `id` with the configured buffer bound and
    /// stall timeout.
    pub fn new(id: OperationId, config: &SubscriptionConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_capacity);
        Self {
            inner: Arc::new(Inner {
                id,
                tx,
                rx: Mutex::new(rx),
                state: AtomicU8::new(ACTIVE),
                drained: AtomicBool::new(false),
                error: StdMutex::new(None),
                wake: Notify::new(),
                stall_timeout: config.stall_timeout,
                buffer_capacity: config.buffer_capacity,
            }),
        }
    }

    /// The operation this observer belongs to.
    pub fn id(&self) -> &OperationId {
        &self.inner.id
    }

    /// True if both handles share one underlying observer.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Enqueues one message for the consumer.
    ///
    /// No-op once the operation is terminal. Suspends against a full
    /// buffer; a producer held off longer than the stall timeout fails
    /// the operation with [`SubscriptionError::ConsumerStalled`] and gets
    /// the same error back.
    pub async fn push(&self, message: OperationMessage) -> Result<(), SubscriptionError> {
        match self.inner.state.load(Ordering::Acquire) {
            DISPOSED => return Err(SubscriptionError::ObserverDisposed),
            TERMINAL => return Ok(()),
            _ => {}
        }

        if message.is_terminal() {
            // Claim the terminal slot before enqueuing; a loser of this
            // race must not enqueue a second terminal message.
            match self.inner.state.compare_exchange(
                ACTIVE,
                TERMINAL,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {}
                Err(DISPOSED) => return Err(SubscriptionError::ObserverDisposed),
                Err(_) => return Ok(()),
            }
        }

        match timeout(self.inner.stall_timeout, self.inner.tx.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SubscriptionError::ObserverDisposed),
            Err(_) => {
                self.fail(SubscriptionError::ConsumerStalled);
                Err(SubscriptionError::ConsumerStalled)
            }
        }
    }

    /// Waits for the next message.
    ///
    /// Returns `Ok(Some(_))` for each buffered message in push order, the
    /// terminal message exactly once, then `Ok(None)` forever. A terminal
    /// error set via [`fail`](Self::fail) is returned once in place of a
    /// message. The returned future is cancel-safe: dropping it cancels
    /// only that read and leaves buffer and terminal state untouched.
    pub async fn read_next(&self) -> Result<Option<OperationMessage>, SubscriptionError> {
        let mut rx = self.inner.rx.lock().await;
        loop {
            if self.inner.state.load(Ordering::Acquire) == DISPOSED {
                return Err(SubscriptionError::ObserverDisposed);
            }
            if self.inner.drained.load(Ordering::Acquire) {
                return Ok(None);
            }
            if let Some(error) = self.error_snapshot() {
                self.inner.drained.store(true, Ordering::Release);
                return Err(error);
            }

            tokio::select! {
                biased;
                message = rx.recv() => match message {
                    Some(message) => {
                        if message.is_terminal() {
                            self.inner.drained.store(true, Ordering::Release);
                        }
                        return Ok(Some(message));
                    }
                    None => {
                        self.inner.drained.store(true, Ordering::Release);
                        return Ok(None);
                    }
                },
                _ = self.inner.wake.notified() => {}
            }
        }
    }

    /// Marks the operation failed. The first error wins; later calls are
    /// no-ops. Wakes a suspended reader.
    pub fn fail(&self, error: SubscriptionError) {
        {
            let mut slot = self
                .inner
                .error
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return;
            }
            *slot = Some(error);
        }
        let _ = self.inner.state.compare_exchange(
            ACTIVE,
            TERMINAL,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.inner.wake.notify_one();
    }

    /// Disposes the observer. Idempotent; afterwards `push` and
    /// `read_next` return [`SubscriptionError::ObserverDisposed`].
    pub fn dispose(&self) {
        let previous = self.inner.state.swap(DISPOSED, Ordering::AcqRel);
        if previous != DISPOSED {
            self.inner.wake.notify_one();
        }
    }

    /// True once a terminal message, terminal error or disposal has been
    /// recorded.
    pub fn is_terminal(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != ACTIVE
    }

    /// True once disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == DISPOSED
    }

    /// Number of messages currently buffered.
    pub fn buffered(&self) -> usize {
        self.inner.buffer_capacity - self.inner.tx.capacity()
    }

    fn error_snapshot(&self) -> Option<SubscriptionError> {
        self.inner
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
