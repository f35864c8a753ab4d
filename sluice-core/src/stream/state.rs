//! Session state machine

use serde::Serialize;

/// Lifecycle state of a stream session.
///
/// `Starting -> Ready -> Stopped` on the happy path, `Starting -> Errored`
/// on startup failure and `Ready -> Errored` when the transcoder dies or
/// stalls. `Stopped` is terminal and the registry entry is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Transcoder launched, no playable manifest yet
    Starting,
    /// Manifest present and being refreshed
    Ready,
    /// Startup failed or the transcoder died
    Errored,
    /// Torn down
    Stopped,
}

impl SessionState {
    /// Check if the session can still be handed to an acquirer.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Ready)
    }

    /// Check if the session has settled on an outcome for waiters.
    pub fn is_settled(self) -> bool {
        !matches!(self, SessionState::Starting)
    }

    /// Check if moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Ready)
                | (Starting, Errored)
                | (Starting, Stopped)
                | (Ready, Errored)
                | (Ready, Stopped)
                | (Errored, Stopped)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Errored => "errored",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
