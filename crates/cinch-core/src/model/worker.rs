use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique worker identifier, stable per credential across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    /// Generate a new random worker ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a worker runs only its owner's jobs or accepts approved
/// collaborator and external work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    Personal,
    Shared,
}

impl WorkerMode {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Shared => "shared",
        }
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "personal" => Some(Self::Personal),
            "shared" => Some(Self::Shared),
            _ => None,
        }
    }
}

/// Worker liveness status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    Offline,
    Draining,
}

impl WorkerStatus {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Draining => "draining",
        }
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Self {
        match s {
            "online" => Self::Online,
            "draining" => Self::Draining,
            _ => Self::Offline,
        }
    }

    /// Whether the worker may receive new assignments.
    pub fn can_accept_work(&self) -> bool {
        matches!(self, Self::Online)
    }
}

/// What a worker advertises when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    /// Display name.
    pub name: String,
    /// Hostname of the machine.
    pub hostname: String,
    /// Advertised capability labels.
    pub labels: BTreeSet<String>,
    /// Personal or shared.
    pub mode: WorkerMode,
    /// Maximum concurrent jobs.
    pub concurrency: u32,
    /// Worker software version.
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        assert_eq!(WorkerStatus::parse("online"), WorkerStatus::Online);
        assert_eq!(WorkerStatus::parse("draining"), WorkerStatus::Draining);
        assert_eq!(WorkerStatus::parse("anything"), WorkerStatus::Offline);
    }

    #[test]
    fn test_only_online_accepts_work() {
        assert!(WorkerStatus::Online.can_accept_work());
        assert!(!WorkerStatus::Draining.can_accept_work());
        assert!(!WorkerStatus::Offline.can_accept_work());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(WorkerMode::parse("shared"), Some(WorkerMode::Shared));
        assert_eq!(WorkerMode::parse("personal"), Some(WorkerMode::Personal));
        assert_eq!(WorkerMode::parse("other"), None);
    }
}
