use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness response for `/_gateway/health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    /// Configured route rules
    pub routes: usize,
    /// Keys currently holding a rate-limit window
    pub rate_limit_windows: usize,
    /// Sessions currently tracked
    pub active_sessions: usize,
    pub timestamp: DateTime<Utc>,
}

/// Readiness response for `/_gateway/ready`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    /// Registered backend services
    pub services: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            version: "0.1.0".to_string(),
            uptime_seconds: 5,
            routes: 1,
            rate_limit_windows: 0,
            active_sessions: 0,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&response).expect("Serialization should succeed");
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"active_sessions\":0"));
    }
}
