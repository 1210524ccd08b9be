//! Close-once connection handle shared by the reader and writer of a session

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::debug;

type OnClose = Box<dyn FnOnce() + Send>;

/// Tracks whether a websocket session has been closed.
///
/// `close()` may be called from any task, any number of times. The first
/// call flips the flag, wakes every `closed()` waiter and runs `on_close`;
/// later calls do nothing.
pub struct Connection {
    id: String,
    closed: AtomicBool,
    signal: watch::Sender<bool>,
    on_close: Mutex<Option<OnClose>>,
}

impl Connection {
    pub fn new(id: impl Into<String>, on_close: impl FnOnce() + Send + 'static) -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            id: id.into(),
            closed: AtomicBool::new(false),
            signal,
            on_close: Mutex::new(Some(Box::new(on_close))),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns true if this call performed the close
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        debug!("Closing connection {}", self.id);
        self.signal.send_replace(true);

        let callback = self.on_close.lock().take();
        if let Some(callback) = callback {
            callback();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once `close()` has been called
    pub async fn closed(&self) {
        let mut rx = self.signal.subscribe();
        // the sender lives in self, so this only errors if self is gone
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
