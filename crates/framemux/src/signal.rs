use std::sync::{Arc, Mutex, PoisonError};

use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError};

/// A one-shot, multi-observer close notification.
///
/// Three independent sources can close a channel (local close, peer `CLOSE`,
/// connection teardown), and every blocked operation has to observe the
/// event without consuming it. A zero-capacity channel gives exactly that:
/// nothing is ever sent, firing drops the sender, and from then on every
/// clone of the receiver is permanently ready, both for `select!` arms and
/// for polling.
pub(crate) struct CloseSignal {
    armed: Arc<Mutex<Option<Sender<()>>>>,
    observer: Receiver<()>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            armed: Arc::new(Mutex::new(Some(tx))),
            observer: rx,
        }
    }

    /// Fire the signal. Returns `true` on the first call, `false` after.
    pub fn fire(&self) -> bool {
        self.armed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    /// Whether the signal has fired.
    pub fn is_fired(&self) -> bool {
        matches!(self.observer.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// A receiver that becomes permanently ready once the signal fires.
    ///
    /// Use in `select!` arms: the arm never sees a message, only the
    /// disconnect.
    pub fn observer(&self) -> &Receiver<()> {
        &self.observer
    }

    /// Block until the signal fires.
    #[allow(dead_code)]
    pub fn wait(&self) {
        let _ = self.observer.recv();
    }
}

impl Clone for CloseSignal {
    fn clone(&self) -> Self {
        Self {
            armed: Arc::clone(&self.armed),
            observer: self.observer.clone(),
        }
    }
}
