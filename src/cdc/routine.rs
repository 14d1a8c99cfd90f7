// ABOUTME: ActiveRoutine - cooperative pause/cancel signals observed by a table reader
// ABOUTME: Checked at the tick wait and before every fragment

use tokio_util::sync::CancellationToken;

/// Which signal stopped a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Stop this reader's work; the task may be restarted later.
    Pause,
    /// Shut down.
    Cancel,
}

/// Control surface of one reader: a pause signal and a cancel signal.
///
/// Clones observe and trigger the same signals.
#[derive(Debug, Clone, Default)]
pub struct ActiveRoutine {
    pause: CancellationToken,
    cancel: CancellationToken,
}

impl ActiveRoutine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routine whose cancel signal follows `parent` (e.g. a process-wide shutdown token).
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self {
            pause: CancellationToken::new(),
            cancel: parent.child_token(),
        }
    }

    pub fn pause(&self) {
        self.pause.cancel();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Pending signal, if any. Cancel wins over pause.
    pub fn stop_signal(&self) -> Option<StopSignal> {
        if self.cancel.is_cancelled() {
            Some(StopSignal::Cancel)
        } else if self.pause.is_cancelled() {
            Some(StopSignal::Pause)
        } else {
            None
        }
    }

    /// Resolves once either signal fires.
    pub async fn stopped(&self) -> StopSignal {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => StopSignal::Cancel,
            _ = self.pause.cancelled() => StopSignal::Pause,
        }
    }
}
