/// Identifies one run of the managed server, minted on every successful start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Observable lifecycle state. Spawning happens under the supervisor lock, so
/// there is no separately visible `Starting` state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ServerState {
    #[default]
    Stopped,
    Running,
}

impl ServerState {
    pub fn is_running(self) -> bool {
        matches!(self, ServerState::Running)
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ServerStatus {
    pub state: ServerState,
    pub session_id: Option<SessionId>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_non_empty_and_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert!(!a.0.is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn default_status_is_stopped() {
        let s = ServerStatus::default();
        assert_eq!(s.state, ServerState::Stopped);
        assert!(!s.state.is_running());
        assert!(s.pid.is_none());
    }

    #[test]
    fn status_serializes_state_by_name() {
        let s = ServerStatus {
            state: ServerState::Running,
            pid: Some(42),
            ..Default::default()
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["state"], "Running");
        assert_eq!(v["pid"], 42);
    }
}
