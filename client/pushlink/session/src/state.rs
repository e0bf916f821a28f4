//! Session identity and lifecycle state.
//!
//! The state machine proper lives in the driver loop; this module holds the
//! session's identity and the transition rules the driver relies on:
//! `CLOSED` is terminal, a session identifier is assigned once per logical
//! session, and the progress marker only ever moves forward.

use tracing::{debug, info};

/// How the data connection delivers updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Long-lived streamed connection
    Streaming,
    /// Repeated poll cycles
    Polling,
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No session and none being created
    Disconnected,
    /// Session-create request in flight
    Creating,
    /// Session established, data connection live
    Connected(ConnectionMode),
    /// Connection silent past the keep-alive threshold
    Stalled,
    /// Recovery bind cycle in progress
    Recovering,
    /// Terminal; a closed session is never revived
    Closed,
}

impl SessionStatus {
    /// Status string delivered to client listeners.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Disconnected => "DISCONNECTED",
            SessionStatus::Creating => "CREATING",
            SessionStatus::Connected(ConnectionMode::Streaming) => "CONNECTED:STREAMING",
            SessionStatus::Connected(ConnectionMode::Polling) => "CONNECTED:POLLING",
            SessionStatus::Stalled => "STALLED",
            SessionStatus::Recovering => "RECOVERING",
            SessionStatus::Closed => "CLOSED",
        }
    }

    /// Whether this is the terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Closed)
    }
}

/// Mutable session identity, owned by the driver task.
#[derive(Debug)]
pub struct SessionState {
    status: SessionStatus,
    session_id: Option<String>,
    bind_count: u64,
    progress: u64,
    recoverable: bool,
    keepalive_millis: u64,
    request_limit: u64,
}

impl SessionState {
    /// Fresh state with no session.
    pub fn new() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            session_id: None,
            bind_count: 0,
            progress: 0,
            recoverable: false,
            keepalive_millis: 0,
            request_limit: 0,
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Move to a new state. Returns whether the state actually changed;
    /// `Closed` is sticky and refuses further transitions.
    pub fn set_status(&mut self, status: SessionStatus) -> bool {
        if self.status == status || self.status.is_terminal() {
            return false;
        }
        debug!("session {} -> {}", self.status.as_str(), status.as_str());
        self.status = status;
        true
    }

    /// Record a successful session create or bind.
    pub fn session_established(
        &mut self,
        session_id: &str,
        request_limit: u64,
        keepalive_millis: u64,
    ) {
        if self.session_id.as_deref() != Some(session_id) {
            info!("session {} established", session_id);
            self.session_id = Some(session_id.to_string());
        }
        self.bind_count += 1;
        self.request_limit = request_limit;
        self.keepalive_millis = keepalive_millis;
    }

    /// Server-assigned session identifier, if established.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Number of binds performed for this session, the create included.
    pub fn bind_count(&self) -> u64 {
        self.bind_count
    }

    /// Count one delivered data-carrying frame.
    pub fn note_data_frame(&mut self) {
        self.progress += 1;
    }

    /// Last-delivered progress marker.
    pub fn progress(&self) -> u64 {
        self.progress
    }

    /// Flag whether the pending interruption cause permits recovery.
    pub fn set_recoverable(&mut self, recoverable: bool) {
        self.recoverable = recoverable;
    }

    /// Whether the pending interruption cause permits recovery.
    pub fn recoverable(&self) -> bool {
        self.recoverable
    }

    /// Keep-alive interval promised by the server, in milliseconds.
    pub fn keepalive_millis(&self) -> u64 {
        self.keepalive_millis
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_is_sticky() {
        let mut state = SessionState::new();
        assert!(state.set_status(SessionStatus::Creating));
        assert!(state.set_status(SessionStatus::Closed));
        assert!(!state.set_status(SessionStatus::Creating));
        assert!(!state.set_status(SessionStatus::Recovering));
        assert_eq!(state.status(), SessionStatus::Closed);
    }

    #[test]
    fn test_unchanged_status_reports_no_transition() {
        let mut state = SessionState::new();
        state.set_status(SessionStatus::Connected(ConnectionMode::Streaming));
        assert!(!state.set_status(SessionStatus::Connected(ConnectionMode::Streaming)));
    }

    #[test]
    fn test_bind_count_and_identity() {
        let mut state = SessionState::new();
        state.session_established("S1", 10, 5000);
        state.session_established("S1", 10, 5000);
        assert_eq!(state.bind_count(), 2);
        assert_eq!(state.session_id(), Some("S1"));
        assert_eq!(state.keepalive_millis(), 5000);
    }

    #[test]
    fn test_progress_moves_forward_only() {
        let mut state = SessionState::new();
        state.note_data_frame();
        state.note_data_frame();
        assert_eq!(state.progress(), 2);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(SessionStatus::Stalled.as_str(), "STALLED");
        assert_eq!(
            SessionStatus::Connected(ConnectionMode::Polling).as_str(),
            "CONNECTED:POLLING"
        );
    }
}
