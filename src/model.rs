// SPDX-License-Identifier: MIT
//! Shared data model: trigger events, task instances, and the wire shapes
//! exchanged with the remote authority.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Source kind of a dispatched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Timer,
    Stream,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Timer => "timer",
            TriggerKind::Stream => "stream",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One dispatch through the coordinator. Built per trigger firing, never
/// persisted. `payload` is opaque to the core: stream triggers carry the raw
/// message bytes, timer triggers leave it empty and the coordinator injects a
/// task snapshot before the handler sees it.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub kind: TriggerKind,
    pub name: String,
    pub payload: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

impl TriggerEvent {
    pub fn new(kind: TriggerKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            payload: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

/// One unit of assigned work, delivered by the authority in a heartbeat
/// response and held until the next wholesale replacement. `task_params` is
/// an opaque blob interpreted by the handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    #[serde(default)]
    pub id: i64,
    pub task_id: String,
    #[serde(default)]
    pub rule_id: String,
    /// Node the authority assigned this instance to.
    #[serde(rename = "planned_exec_node", default)]
    pub assigned_node: String,
    #[serde(default)]
    pub task_params: String,
    /// The authority marks superseded instances invalid instead of removing
    /// them; invalid entries are kept in snapshots but never dispatched.
    #[serde(with = "int_bool", default)]
    pub invalid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// The authority encodes `invalid` as 0/1. Accept a real bool too, emit the
/// integer form it expects.
mod int_bool {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u8(u8::from(*v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Bool(bool),
        }
        Ok(match Raw::deserialize(d)? {
            Raw::Int(n) => n != 0,
            Raw::Bool(b) => b,
        })
    }
}

/// Outcome of one task execution, reported with the authority's numeric
/// status codes (2 = success, 4 = failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum TaskStatus {
    Success,
    Failed,
}

impl TaskStatus {
    pub fn code(self) -> u8 {
        self.into()
    }
}

impl From<TaskStatus> for u8 {
    fn from(status: TaskStatus) -> u8 {
        match status {
            TaskStatus::Success => 2,
            TaskStatus::Failed => 4,
        }
    }
}

impl TryFrom<u8> for TaskStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            2 => Ok(TaskStatus::Success),
            4 => Ok(TaskStatus::Failed),
            other => Err(format!("unknown task status code {other}")),
        }
    }
}

/// Per-task outcome produced by the handler. `result` carries the error text
/// when the status is `Failed`, empty otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: String,
}

/// Handler response to a dispatched event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerResponse {
    #[serde(default)]
    pub task_results: Vec<TaskResult>,
}

/// Snapshot payload injected into timer-originated events so out-of-process
/// handlers see a complete, hash-stamped view of current assignments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerPayload {
    pub tasks: Vec<TaskInstance>,
    pub tasks_md5: String,
}

/// Envelope the authority wraps every response in.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncEnvelope {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
}

/// First element of a heartbeat response's `data`. Every field is optional:
/// an absent task list means the reported hash matched, an absent address
/// means the authority did not move.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncData {
    pub package_version: Option<String>,
    pub task_instances: Option<Vec<TaskInstance>>,
    pub server_ip: Option<String>,
    pub server_port: Option<u16>,
}

/// Inbound probe from the authority (or its gateway), used to correct node
/// identity and to learn the address results should be reported to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeRequest {
    pub action: String,
    pub request_id: String,
    pub server_ip: String,
    pub server_port: u16,
}

/// Node status snapshot returned to a probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub node_id: String,
    pub state: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub details: ProbeDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeDetails {
    pub node_info: NodeInfo,
    pub system_info: SystemInfo,
    pub heartbeat_info: HeartbeatInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub node_type: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub num_cpus: usize,
    pub memory_used_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatInfo {
    pub interval: String,
    pub server_ip: String,
    pub server_port: u16,
}
