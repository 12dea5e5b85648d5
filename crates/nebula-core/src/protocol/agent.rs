//! Payloads originated by agents.

use serde::{Deserialize, Serialize};

/// Host metrics snapshot inside an `agent_metrics` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
    pub hostname: String,
    pub os: String,
    pub uptime: u64,
}

/// `agent_metrics` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub agent_id: String,
    pub agent_name: String,
    pub host_metrics: HostMetrics,
    /// Externally discovered `host:port` reachable by peers, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_endpoint: Option<String>,
    /// Unix seconds at sampling time.
    pub timestamp: i64,
}

/// `agent_conn_break` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnBreak {
    pub agent_id: String,
    pub timestamp: i64,
}

/// One entry of a directory snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntryInfo {
    pub name: String,
    /// Path relative to the shared folder.
    pub path: String,
    pub size: u64,
    /// RFC 3339 modification time.
    pub modified: String,
    /// "file" or "directory".
    #[serde(rename = "type")]
    pub kind: String,
}

/// Aggregate listing inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryInfo {
    pub files: Vec<FileEntryInfo>,
    pub total_files: usize,
    pub total_size: u64,
}

/// `agent_directory_snapshot` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub agent_id: String,
    /// RFC 3339 time of the scan.
    pub timestamp: String,
    pub directory: DirectoryInfo,
}
