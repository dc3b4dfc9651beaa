//! Notification dispatcher.
//!
//! Transitions enqueue committed events here after their state lock is
//! released. A dedicated thread drains the queue, invokes callbacks, and
//! forwards each event to broadcast subscribers. Callback code therefore never
//! runs while a coordination lock is held and may call back into the
//! `StateManager` freely.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::StateEvent;
use crate::thread::{LockContext, LockRank, RankedMutex, RankedRwLock};

/// Observer invoked on the dispatcher thread for every published event.
pub type StateCallback = Arc<dyn Fn(&StateEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub u64);

enum Message {
    Event(StateEvent),
    Flush(Sender<()>),
    Shutdown,
}

struct Shared {
    locks: LockContext,
    callbacks: RankedRwLock<Vec<(CallbackId, StateCallback)>>,
    broadcast_tx: broadcast::Sender<StateEvent>,
    delivered: AtomicU64,
    callback_panics: AtomicU64,
}

pub(crate) struct Dispatcher {
    tx: Sender<Message>,
    shared: Arc<Shared>,
    next_callback: AtomicU64,
    thread: RankedMutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub(crate) fn start(locks: LockContext, broadcast_capacity: usize) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (broadcast_tx, _) = broadcast::channel(broadcast_capacity);
        let shared = Arc::new(Shared {
            locks,
            callbacks: RankedRwLock::new(LockRank::Update, Vec::new()),
            broadcast_tx,
            delivered: AtomicU64::new(0),
            callback_panics: AtomicU64::new(0),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("cadence-state-dispatch".into())
            .spawn(move || run(rx, thread_shared))?;

        Ok(Self {
            tx,
            shared,
            next_callback: AtomicU64::new(1),
            thread: RankedMutex::new(LockRank::Update, Some(handle)),
        })
    }

    pub(crate) fn publish(&self, event: StateEvent) {
        if self.tx.send(Message::Event(event)).is_err() {
            debug!("dispatcher stopped; dropping state event");
        }
    }

    pub(crate) fn register(&self, callback: StateCallback) -> crate::error::Result<CallbackId> {
        let id = CallbackId(self.next_callback.fetch_add(1, Ordering::Relaxed));
        self.shared
            .locks
            .write(&self.shared.callbacks)?
            .push((id, callback));
        Ok(id)
    }

    pub(crate) fn unregister(&self, id: CallbackId) -> crate::error::Result<bool> {
        let mut callbacks = self.shared.locks.write(&self.shared.callbacks)?;
        let before = callbacks.len();
        callbacks.retain(|(cid, _)| *cid != id);
        Ok(callbacks.len() != before)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.shared.broadcast_tx.subscribe()
    }

    /// Wait until every event enqueued before this call has been delivered.
    pub(crate) fn flush(&self, timeout: Duration) -> bool {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.tx.send(Message::Flush(ack_tx)).is_err() {
            return true;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    pub(crate) fn callback_panics(&self) -> u64 {
        self.shared.callback_panics.load(Ordering::Relaxed)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.shared
            .locks
            .lock(&self.thread)
            .map(|t| t.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Drain outstanding events, then stop and join the dispatcher thread.
    /// Returns `false` if the thread did not exit within `timeout`.
    pub(crate) fn shutdown(&self, timeout: Duration) -> crate::error::Result<bool> {
        let Some(handle) = self.shared.locks.lock(&self.thread)?.take() else {
            return Ok(true);
        };
        let _ = self.tx.send(Message::Shutdown);

        let deadline = std::time::Instant::now() + timeout;
        while !handle.is_finished() {
            if std::time::Instant::now() >= deadline {
                warn!("state dispatcher did not stop before deadline");
                *self.shared.locks.lock(&self.thread)? = Some(handle);
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        let _ = handle.join();
        debug!("state dispatcher stopped");
        Ok(true)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
    }
}

fn run(rx: Receiver<Message>, shared: Arc<Shared>) {
    while let Ok(message) = rx.recv() {
        match message {
            Message::Event(event) => deliver(&shared, event),
            Message::Flush(ack) => {
                let _ = ack.send(());
            }
            Message::Shutdown => break,
        }
    }
}

fn deliver(shared: &Shared, event: StateEvent) {
    let callbacks: Vec<StateCallback> = match shared.locks.read(&shared.callbacks) {
        Ok(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
        Err(e) => {
            warn!(component = %event.component, "skipping callbacks: {e}");
            Vec::new()
        }
    };

    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
            shared.callback_panics.fetch_add(1, Ordering::Relaxed);
            warn!(component = %event.component, "state callback panicked");
        }
    }

    // No subscribers is not an error.
    let _ = shared.broadcast_tx.send(event);
    shared.delivered.fetch_add(1, Ordering::Relaxed);
}
