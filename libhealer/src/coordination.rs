use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("node {0} does not exist")]
    NoNode(String),
    #[error("node {0} already exists")]
    NodeExists(String),
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("session is closed")]
    SessionClosed,
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error(transparent)]
    Xline(#[from] Box<etcd_client::Error>),
}

impl From<etcd_client::Error> for CoordinationError {
    fn from(e: etcd_client::Error) -> Self {
        CoordinationError::Xline(Box::new(e))
    }
}

/// Notifications delivered by a session to whoever drives the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session is live (first connection or recovery after a disconnect).
    Connected,
    /// The session could not reach the store within its timeout.
    Disconnected,
    /// The session's lease is gone; ephemeral nodes owned by it are deleted.
    Expired,
    /// A one-shot children watch armed on `path` fired.
    ChildrenChanged { path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the session that created it.
    Persistent,
    /// Attached to the session lease, removed when the session ends.
    Ephemeral,
}

/// Metadata of an existing node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
    pub data_length: usize,
}

/// Node operations of one coordination session.
///
/// Watches registered through a session report on the event channel that was
/// handed to the [`Connector`] which created it.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn exists(&self, path: &str) -> Result<Option<NodeStat>, CoordinationError>;

    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordinationError>;

    /// Reads the immediate children of `path` and arms a one-shot watch on
    /// them in the same request.
    ///
    /// The first change to the children after the read emits
    /// [`SessionEvent::ChildrenChanged`]; later changes need a new call.
    async fn get_children_with_watch(&self, path: &str) -> Result<Vec<String>, CoordinationError>;

    async fn close(&self) -> Result<(), CoordinationError>;
}

/// Establishes sessions. A fresh session is needed after expiry.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        events: UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn Coordinator>, CoordinationError>;
}

pub fn validate_path(path: &str) -> Result<(), CoordinationError> {
    let invalid = |reason| CoordinationError::InvalidPath {
        path: path.to_string(),
        reason,
    };
    if !path.starts_with('/') {
        return Err(invalid("path must start with '/'"));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(invalid("path must not end with '/'"));
    }
    if path[1..].split('/').any(str::is_empty) {
        return Err(invalid("empty path segment"));
    }
    Ok(())
}

/// Key prefix shared by every child of `path`.
pub fn children_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

/// Parent of `path`, `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(i) => Some(&path[..i]),
    }
}

/// Name of the immediate child of `parent` that `key` names, if any.
pub fn child_name<'a>(parent: &str, key: &'a str) -> Option<&'a str> {
    let name = key.strip_prefix(&children_prefix(parent))?;
    if name.is_empty() || name.contains('/') {
        None
    } else {
        Some(name)
    }
}

/// Immediate children of `parent` among `keys`, sorted and deduplicated.
pub fn direct_children<'a, I>(parent: &str, keys: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut names: Vec<String> = keys
        .into_iter()
        .filter_map(|k| child_name(parent, k))
        .map(str::to_string)
        .collect();
    names.sort();
    names.dedup();
    names
}
