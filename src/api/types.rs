//! Wire shapes exchanged with a peer agent.

use serde::{Deserialize, Serialize};

/// Logical state key a server publishes once its workload accepts traffic.
pub const SERVER_ONLINE_KEY: &str = "ServerOnline";

/// Body stored under [`SERVER_ONLINE_KEY`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerOnlineState {
    #[serde(rename = "Online", default)]
    pub online: bool,
}

impl ServerOnlineState {
    pub fn online() -> Self {
        Self { online: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_online_uses_pascal_case_field() {
        let json = serde_json::to_string(&ServerOnlineState::online()).unwrap();
        assert_eq!(json, r#"{"Online":true}"#);
    }

    #[test]
    fn missing_flag_reads_as_offline() {
        let state: ServerOnlineState = serde_json::from_str("{}").unwrap();
        assert!(!state.online);
    }
}
