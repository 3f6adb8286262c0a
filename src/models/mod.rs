//! Data models for thinknode entities.
//!
//! This module defines the core data structures:
//! - `Node` - A conversation thread positioned in 3D space, optionally parented
//! - `Message` - A single user or assistant turn within a node's chat
//! - `LogEntry` - An append-only diagnostic record attached to a node
//! - `NodeExport` / `MessagePair` - Composite results returned by the service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Free-form node metadata: string keys mapped to opaque JSON values.
pub type Meta = Map<String, Value>;

/// Position of a node in the 3D layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// A thinking node: an isolated conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique content-derived identifier (64 hex chars)
    pub hash: String,

    /// Node title
    pub title: String,

    /// Parent node hash, `None` for roots
    pub parent_hash: Option<String>,

    /// Position in the 3D layout
    #[serde(default)]
    pub position: Position,

    /// Optional grouping tag
    pub cluster_hash: Option<String>,

    /// Free-form metadata
    #[serde(default)]
    pub meta: Meta,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp (refreshed by chat writes and resets)
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Create a new node with the given hash and title.
    pub fn new(hash: String, title: String) -> Self {
        let now = Utc::now();
        Self {
            hash,
            title,
            parent_hash: None,
            position: Position::default(),
            cluster_hash: None,
            meta: Meta::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Input for creating a node. Only `title` is required.
#[derive(Debug, Clone, Default)]
pub struct NewNode {
    pub title: String,
    pub parent_hash: Option<String>,
    pub position: Option<Position>,
    pub cluster_hash: Option<String>,
    pub meta: Option<Meta>,
}

impl NewNode {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_parent(mut self, parent_hash: impl Into<String>) -> Self {
        self.parent_hash = Some(parent_hash.into());
        self
    }
}

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// A single turn within a node's chat history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned sequence number, strictly increasing in creation order
    pub id: i64,
    pub node_hash: String,
    pub role: Role,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Severity of a node log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    /// Only the three canonical lowercase names are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!(
                "Invalid log level: {} (expected info, warning or error)",
                s
            )),
        }
    }
}

/// An append-only diagnostic record attached to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub node_hash: String,
    pub level: LogLevel,
    pub text: String,

    /// Optional structured context (e.g. the error behind a failed backend call)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    pub created_at: DateTime<Utc>,
}

/// Snapshot of a node and its full ordered chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExport {
    pub node: Node,
    pub messages: Vec<Message>,
}

/// The user message and the assistant reply appended by one chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePair {
    pub user_message: Message,
    pub assistant_message: Message,
}
