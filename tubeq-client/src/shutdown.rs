//! # Shutdown Signal
//!
//! A one-shot, cloneable lifecycle flag. Raising it disconnects a channel,
//! so every thread blocked in a `select!` on [`ShutdownSignal::receiver`]
//! wakes at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{self, Receiver, Sender};

/// Process-wide shutdown flag shared between pools and their owners.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    raised: AtomicBool,
    // Dropping the sender is the broadcast.
    trigger: Mutex<Option<Sender<()>>>,
    done: Receiver<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, done) = channel::bounded(0);
        ShutdownSignal {
            inner: Arc::new(SignalInner {
                raised: AtomicBool::new(false),
                trigger: Mutex::new(Some(trigger)),
                done,
            }),
        }
    }

    /// Raises the signal. Idempotent.
    pub fn raise(&self) {
        self.inner.raised.store(true, Ordering::SeqCst);
        let mut trigger = self
            .inner
            .trigger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        trigger.take();
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Becomes ready (disconnected) once the signal is raised.
    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.inner.done
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("raised", &self.is_raised())
            .finish()
    }
}
