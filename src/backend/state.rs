use std::fmt;

/// Lifecycle of the supervised backend process.
///
/// `NotStarted -> Starting -> Ready | Failed`, `Ready -> Busy -> Ready | Failed`,
/// and any state moves to `Terminated` on stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    NotStarted,
    Starting,
    Ready,
    Busy,
    Failed,
    Terminated,
}

impl BackendState {
    /// Whether a fresh `start()` is required before commands can be sent.
    pub fn is_terminal(self) -> bool {
        matches!(self, BackendState::Failed | BackendState::Terminated)
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendState::NotStarted => "not started",
            BackendState::Starting => "starting",
            BackendState::Ready => "ready",
            BackendState::Busy => "busy",
            BackendState::Failed => "failed",
            BackendState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}
