//! Task value objects.

use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Task execution priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::High => "high",
        };
        write!(f, "{s}")
    }
}

/// Unique task identifier: `task_<unix millis>_<9 base36 chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    const SUFFIX_LEN: usize = 9;
    const ALPHABET: &'static [u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    /// Generate a fresh id from the current time and a random suffix.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..Self::SUFFIX_LEN)
            .map(|_| Self::ALPHABET[rng.gen_range(0..Self::ALPHABET.len())] as char)
            .collect();
        Self(format!("task_{}_{}", Utc::now().timestamp_millis(), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a producer hands to `Scheduler::submit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Job type tag selecting the executor.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
}

impl TaskRequest {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: serde_json::Value::Null,
            args: Vec::new(),
            priority: Priority::Normal,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Shorthand for `with_priority(Priority::High)`.
    pub fn high(self) -> Self {
        self.with_priority(Priority::High)
    }
}

/// One unit of schedulable work. Never mutated after creation; shared as `Arc<Task>`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub args: Vec<String>,
    pub priority: Priority,
    /// 1 for a fresh submission, incremented by each retry.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    pub(crate) fn from_request(request: TaskRequest, attempt: u32) -> Self {
        Self {
            id: TaskId::generate(),
            kind: request.kind,
            payload: request.payload,
            args: request.args,
            priority: request.priority,
            attempt,
            enqueued_at: Utc::now(),
        }
    }

    /// Rebuild the request this task was created from (used for resubmission).
    pub fn to_request(&self) -> TaskRequest {
        TaskRequest {
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            args: self.args.clone(),
            priority: self.priority,
        }
    }

    pub fn is_high_priority(&self) -> bool {
        self.priority == Priority::High
    }
}
