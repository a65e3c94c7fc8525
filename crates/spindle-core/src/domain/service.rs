use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker service id, assigned at registration.
pub type ServiceId = i64;

/// Liveness record of one worker service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub started: DateTime<Utc>,
    pub heartbeat: DateTime<Utc>,
    pub threads: u32,
    pub host: Option<String>,
}
