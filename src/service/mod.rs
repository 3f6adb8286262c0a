//! Node graph service: validation and ordering rules on top of the store.
//!
//! This is the only writer path into [`Storage`]. The store connection sits
//! behind an async mutex held for individual store calls; chat writes on a
//! node additionally hold a per-node lock for the whole turn so a user
//! message and its reply are always adjacent.

use crate::inference::InferenceAdapter;
use crate::models::{
    LogEntry, LogLevel, Message, MessagePair, NewNode, Node, NodeExport, Role,
};
use crate::storage::{Storage, generate_node_hash};
use crate::{Error, Result};
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::Mutex;

pub struct NodeService {
    storage: Mutex<Storage>,
    adapter: InferenceAdapter,
    node_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NodeService {
    pub fn new(storage: Storage, adapter: InferenceAdapter) -> Self {
        Self {
            storage: Mutex::new(storage),
            adapter,
            node_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Short name of the active inference adapter.
    pub fn inference_kind(&self) -> &'static str {
        self.adapter.kind()
    }

    pub fn adapter(&self) -> &InferenceAdapter {
        &self.adapter
    }

    /// Write lock serialising chat mutations on one node.
    fn node_lock(&self, hash: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .node_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn require_node(&self, hash: &str) -> Result<()> {
        let storage = self.storage.lock().await;
        if !storage.node_exists(hash)? {
            return Err(Error::NotFound(format!("Node not found: {}", hash)));
        }
        Ok(())
    }

    // === Nodes ===

    /// Create a node. The title must be non-blank and the parent, if any,
    /// must already exist.
    pub async fn create_node(&self, input: NewNode) -> Result<Node> {
        let title = input.title.trim();
        if title.is_empty() {
            return Err(Error::InvalidArgument(
                "Node title must not be empty".to_string(),
            ));
        }

        let storage = self.storage.lock().await;

        if let Some(parent) = input.parent_hash.as_deref() {
            if !storage.node_exists(parent)? {
                return Err(Error::NotFound(format!("Parent node not found: {}", parent)));
            }
        }

        // put_node upserts, so never hand it a hash that is already taken.
        let mut hash = generate_node_hash(title, input.parent_hash.as_deref());
        while storage.node_exists(&hash)? {
            hash = generate_node_hash(title, input.parent_hash.as_deref());
        }

        let mut node = Node::new(hash, title.to_string());
        node.parent_hash = input.parent_hash;
        node.position = input.position.unwrap_or_default();
        node.cluster_hash = input.cluster_hash;
        node.meta = input.meta.unwrap_or_default();

        storage.put_node(&node)?;
        tracing::info!(node = %node.hash, title = %node.title, "created node");
        Ok(node)
    }

    pub async fn get_node(&self, hash: &str) -> Result<Node> {
        self.storage.lock().await.get_node(hash)
    }

    /// All nodes sorted by creation time, then hash.
    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.storage.lock().await.list_nodes()
    }

    // === Chat ===

    /// Append a user message, ask the inference adapter for a reply and
    /// append it right after. A failed backend call leaves one `error` log
    /// on the node and the mock reply in the chat.
    pub async fn add_message(&self, hash: &str, body: &str) -> Result<MessagePair> {
        self.require_node(hash).await?;
        if body.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "Message body must not be empty".to_string(),
            ));
        }

        let lock = self.node_lock(hash);
        let _turn = lock.lock().await;

        let (node, user_message, history) = {
            let storage = self.storage.lock().await;
            let node = storage.get_node(hash)?;
            let user_message = storage.append_message(hash, Role::User, body)?;
            let history = storage.list_messages(hash)?;
            (node, user_message, history)
        };

        // The store lock is released while the adapter runs; the node lock
        // still keeps other turns on this node out.
        let completion = self.adapter.complete(&node, &history).await;

        let storage = self.storage.lock().await;
        if let Some(failure) = &completion.failure {
            let payload = json!({
                "error": failure.to_string(),
                "fallback": "mock",
            });
            storage.append_log(
                hash,
                LogLevel::Error,
                &format!("Inference backend failed: {}", failure),
                Some(&payload),
            )?;
        }
        let assistant_message = storage.append_message(hash, Role::Assistant, &completion.text)?;
        storage.touch_node(hash, Utc::now())?;

        tracing::debug!(node = %hash, source = ?completion.source, "chat turn recorded");

        Ok(MessagePair {
            user_message,
            assistant_message,
        })
    }

    pub async fn list_messages(&self, hash: &str) -> Result<Vec<Message>> {
        let storage = self.storage.lock().await;
        storage.get_node(hash)?;
        storage.list_messages(hash)
    }

    /// Clear a node's chat. Logs are kept. Returns the number of messages removed.
    pub async fn reset(&self, hash: &str) -> Result<usize> {
        self.require_node(hash).await?;

        let lock = self.node_lock(hash);
        let _turn = lock.lock().await;

        let storage = self.storage.lock().await;
        let cleared = storage.clear_messages(hash)?;
        storage.touch_node(hash, Utc::now())?;

        tracing::info!(node = %hash, cleared, "reset node chat");
        Ok(cleared)
    }

    /// Snapshot of a node and its chat.
    pub async fn export(&self, hash: &str) -> Result<NodeExport> {
        let storage = self.storage.lock().await;
        let node = storage.get_node(hash)?;
        let messages = storage.list_messages(hash)?;
        Ok(NodeExport { node, messages })
    }

    // === Logs ===

    pub async fn add_log(
        &self,
        hash: &str,
        level: &str,
        text: &str,
        payload: Option<Value>,
    ) -> Result<LogEntry> {
        let storage = self.storage.lock().await;
        storage.get_node(hash)?;

        let level: LogLevel = level.parse().map_err(Error::InvalidArgument)?;
        if text.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "Log text must not be empty".to_string(),
            ));
        }
        let payload = match payload {
            None | Some(Value::Null) => None,
            Some(value @ Value::Object(_)) => Some(value),
            Some(_) => {
                return Err(Error::InvalidArgument(
                    "Log payload must be a JSON object".to_string(),
                ));
            }
        };

        storage.append_log(hash, level, text, payload.as_ref())
    }

    pub async fn list_logs(&self, hash: &str) -> Result<Vec<LogEntry>> {
        let storage = self.storage.lock().await;
        storage.get_node(hash)?;
        storage.list_logs(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::InferenceSettings;
    use crate::models::Position;
    use crate::test_utils::{TestEnv, spawn_backend};
    use axum::{Json, Router, routing::post};
    use std::collections::HashSet;
    use std::time::Duration;

    async fn root(service: &NodeService, title: &str) -> Node {
        service.create_node(NewNode::titled(title)).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_node_defaults() {
        let env = TestEnv::new();
        let service = env.mock_service();

        let node = root(&service, "  Ideas ").await;

        assert_eq!(node.title, "Ideas");
        assert_eq!(node.hash.len(), 64);
        assert_eq!(node.position, Position::default());
        assert!(node.meta.is_empty());
        assert_eq!(node.created_at, node.updated_at);
        assert_eq!(service.get_node(&node.hash).await.unwrap(), node);
    }

    #[tokio::test]
    async fn test_create_node_rejects_blank_title() {
        let env = TestEnv::new();
        let service = env.mock_service();

        let result = service.create_node(NewNode::titled("   ")).await;

        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(service.list_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_node_unknown_parent_writes_nothing() {
        let env = TestEnv::new();
        let service = env.mock_service();

        let result = service
            .create_node(NewNode::titled("child").with_parent("deadbeef"))
            .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(service.list_nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_child_node() {
        let env = TestEnv::new();
        let service = env.mock_service();
        let parent = root(&service, "parent").await;

        let child = service
            .create_node(NewNode::titled("child").with_parent(parent.hash.clone()))
            .await
            .unwrap();

        assert_eq!(child.parent_hash.as_deref(), Some(parent.hash.as_str()));
        assert_eq!(service.list_nodes().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_identical_titles_get_unique_hashes() {
        let env = TestEnv::new();
        let service = env.mock_service();

        let mut hashes = HashSet::new();
        for _ in 0..25 {
            hashes.insert(root(&service, "same").await.hash);
        }
        assert_eq!(hashes.len(), 25);
    }

    #[tokio::test]
    async fn test_add_message_alternates_roles() {
        let env = TestEnv::new();
        let service = env.mock_service();
        let node = root(&service, "chat").await;

        for i in 0..3 {
            let pair = service
                .add_message(&node.hash, &format!("note {}", i))
                .await
                .unwrap();
            assert_eq!(pair.user_message.role, Role::User);
            assert_eq!(pair.assistant_message.role, Role::Assistant);
            assert!(pair.assistant_message.id > pair.user_message.id);
        }

        let messages = service.list_messages(&node.hash).await.unwrap();
        assert_eq!(messages.len(), 6);
        for (i, message) in messages.iter().enumerate() {
            let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
            assert_eq!(message.role, expected);
        }
        assert_eq!(
            messages[5].body,
            "[chat] Seed AI reasoning node: Received 5 messages. Latest user note: note 2"
        );
    }

    #[tokio::test]
    async fn test_add_message_touches_node() {
        let env = TestEnv::new();
        let service = env.mock_service();
        let node = root(&service, "chat").await;

        service.add_message(&node.hash, "hello").await.unwrap();

        let updated = service.get_node(&node.hash).await.unwrap();
        assert!(updated.updated_at >= node.updated_at);
        assert_eq!(updated.created_at, node.created_at);
    }

    #[tokio::test]
    async fn test_add_message_rejects_empty_body() {
        let env = TestEnv::new();
        let service = env.mock_service();
        let node = root(&service, "chat").await;

        let result = service.add_message(&node.hash, " \n").await;

        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(service.list_messages(&node.hash).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_message_unknown_node() {
        let env = TestEnv::new();
        let service = env.mock_service();

        let result = service.add_message("missing", "hello").await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_messages_never_interleave() {
        let env = TestEnv::new();
        let service = env.mock_service();
        let node = root(&service, "busy").await;

        let mut tasks = Vec::new();
        for i in 0..12 {
            let service = service.clone();
            let hash = node.hash.clone();
            tasks.push(tokio::spawn(async move {
                service.add_message(&hash, &format!("msg-{}", i)).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let messages = service.list_messages(&node.hash).await.unwrap();
        assert_eq!(messages.len(), 24);
        for pair in messages.chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Assistant);
            let note = format!("Latest user note: {}", pair[0].body);
            assert!(pair[1].body.ends_with(&note));
        }
    }

    #[tokio::test]
    async fn test_reset_clears_messages_keeps_logs() {
        let env = TestEnv::new();
        let service = env.mock_service();
        let node = root(&service, "root").await;

        service.add_message(&node.hash, "hello").await.unwrap();
        service
            .add_log(&node.hash, "info", "kept", None)
            .await
            .unwrap();

        assert_eq!(service.reset(&node.hash).await.unwrap(), 2);
        assert!(service.list_messages(&node.hash).await.unwrap().is_empty());
        assert_eq!(service.list_logs(&node.hash).await.unwrap().len(), 1);

        // A second reset has nothing left to clear.
        assert_eq!(service.reset(&node.hash).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reset_unknown_node() {
        let env = TestEnv::new();
        let service = env.mock_service();
        assert!(matches!(
            service.reset("missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_export_is_pure() {
        let env = TestEnv::new();
        let service = env.mock_service();
        let node = root(&service, "root").await;
        service.add_message(&node.hash, "hello").await.unwrap();

        let first = service.export(&node.hash).await.unwrap();
        let second = service.export(&node.hash).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.messages.len(), 2);
        assert_eq!(first.node.hash, node.hash);
    }

    #[tokio::test]
    async fn test_add_log_validation() {
        let env = TestEnv::new();
        let service = env.mock_service();
        let node = root(&service, "root").await;

        let bad_level = service.add_log(&node.hash, "bogus", "x", None).await;
        assert!(matches!(bad_level, Err(Error::InvalidArgument(_))));

        let empty_text = service.add_log(&node.hash, "info", "  ", None).await;
        assert!(matches!(empty_text, Err(Error::InvalidArgument(_))));

        let bad_payload = service
            .add_log(&node.hash, "info", "x", Some(json!([1, 2])))
            .await;
        assert!(matches!(bad_payload, Err(Error::InvalidArgument(_))));

        assert!(service.list_logs(&node.hash).await.unwrap().is_empty());

        let entry = service
            .add_log(&node.hash, "warning", "slow", Some(json!({"ms": 900})))
            .await
            .unwrap();
        assert_eq!(entry.level, LogLevel::Warning);
        assert_eq!(entry.payload, Some(json!({"ms": 900})));
    }

    #[tokio::test]
    async fn test_logs_on_unknown_node() {
        let env = TestEnv::new();
        let service = env.mock_service();

        assert!(matches!(
            service.add_log("missing", "info", "x", None).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            service.list_logs("missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_backend_logs_error_and_falls_back() {
        let env = TestEnv::new();
        let settings = InferenceSettings {
            backend_url: Some("http://127.0.0.1:1".to_string()),
            timeout: Duration::from_secs(2),
            ..InferenceSettings::default()
        };
        let service = env.service(InferenceAdapter::from_settings(&settings).unwrap());
        let node = root(&service, "offline").await;

        let pair = service.add_message(&node.hash, "hello").await.unwrap();

        assert!(pair.assistant_message.body.contains("Latest user note: hello"));
        let logs = service.list_logs(&node.hash).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, LogLevel::Error);
        assert!(logs[0].text.contains("127.0.0.1:1"));
        assert_eq!(logs[0].payload.as_ref().unwrap()["fallback"], "mock");
    }

    #[tokio::test]
    async fn test_backend_reply_is_stored_without_log() {
        let app = Router::new().route(
            "/completion",
            post(|| async { Json(serde_json::json!({ "content": "backend says hi" })) }),
        );
        let url = spawn_backend(app).await;
        let env = TestEnv::new();
        let settings = InferenceSettings {
            backend_url: Some(url),
            ..InferenceSettings::default()
        };
        let service = env.service(InferenceAdapter::from_settings(&settings).unwrap());
        let node = root(&service, "online").await;

        let pair = service.add_message(&node.hash, "hello").await.unwrap();

        assert_eq!(pair.user_message.body, "hello");
        assert_eq!(pair.assistant_message.body, "backend says hi");
        assert!(service.list_logs(&node.hash).await.unwrap().is_empty());
        let history = service.list_messages(&node.hash).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].body, "backend says hi");
    }
}
