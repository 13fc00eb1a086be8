//! Progress notifications and cancellation signals.
//!
//! The orchestrator reports each lifecycle transition as a [`SessionEvent`]
//! on an [`EventSink`]; the CLI drains the matching [`SessionEvents`] to
//! print progress. Events are observational: a closed or missing receiver
//! never changes how a session runs.
//!
//! [`CancelSignal`] is the receiving half of an external cancellation
//! source (Ctrl-C, a supervisor). Every call to [`CancelHandle::cancel`]
//! delivers one signal, so a second cancellation can be observed while
//! the first one is being handled.

use tokio::sync::mpsc;

use crate::orchestrator::SessionReport;

/// Channel buffer size for session events. Larger than the number of
/// events a single session emits, so sending never waits.
const EVENT_CHANNEL_SIZE: usize = 64;

// ── Session events ───────────────────────────────────────────

/// Lifecycle notifications, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ProvisioningStarted,
    ProvisioningFinished,
    SetupStarted,
    SetupFinished,
    RunStarted {
        instruction: String,
    },
    /// The agent finished and results were collected.
    Completed(SessionReport),
    /// A lifecycle step failed; carries the primary error message.
    Failed(String),
    CleanupStarted,
    CleanupFinished,
    /// Teardown failed; carries the teardown error message.
    CleanupFailed(String),
}

/// Sending half for session events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<SessionEvent>>,
}

impl EventSink {
    /// Create a connected sink and event stream.
    pub fn channel() -> (Self, SessionEvents) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        (Self { tx: Some(tx) }, SessionEvents { rx })
    }

    /// A sink that drops every event.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Emit an event, ignoring a closed receiver.
    pub(crate) async fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}

/// Receiving half for session events.
#[derive(Debug)]
pub struct SessionEvents {
    rx: mpsc::Receiver<SessionEvent>,
}

impl SessionEvents {
    /// Get the next event.
    ///
    /// Returns `None` once the orchestrator and every sink clone are gone.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }
}

// ── Cancellation ─────────────────────────────────────────────

/// Triggers cancellation of a session.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl CancelHandle {
    /// Deliver one cancellation signal. Has no effect once the session ended.
    pub fn cancel(&self) {
        let _ = self.tx.send(());
    }
}

/// Receives cancellation signals for a session.
#[derive(Debug)]
pub struct CancelSignal {
    rx: Option<mpsc::UnboundedReceiver<()>>,
}

impl CancelSignal {
    /// Create a connected handle and signal.
    pub fn channel() -> (CancelHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CancelHandle { tx }, Self { rx: Some(rx) })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Wait for the next cancellation signal.
    ///
    /// Pends forever when every [`CancelHandle`] has been dropped. Cancel
    /// safe: a signal is only consumed when this future completes.
    pub async fn cancelled(&mut self) {
        if let Some(rx) = &mut self.rx {
            if rx.recv().await.is_some() {
                return;
            }
            self.rx = None;
        }
        std::future::pending::<()>().await;
    }
}
