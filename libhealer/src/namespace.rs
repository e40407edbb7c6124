use log::info;

use crate::coordination::{CoordinationError, Coordinator, CreateMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceStatus {
    Created,
    Existing,
}

/// Makes sure the persistent parent node `path` exists.
///
/// Safe to call on every start. Losing a creation race to another client is
/// not an error. Anything else is returned untouched, the caller decides
/// whether it is fatal.
pub async fn ensure_namespace(
    client: &dyn Coordinator,
    path: &str,
) -> Result<NamespaceStatus, CoordinationError> {
    if client.exists(path).await?.is_some() {
        info!("Parent node {path} exists");
        return Ok(NamespaceStatus::Existing);
    }

    match client.create(path, &[], CreateMode::Persistent).await {
        Ok(_) => {
            info!("Created parent node {path}");
            Ok(NamespaceStatus::Created)
        }
        Err(CoordinationError::NodeExists(_)) => {
            info!("Parent node {path} was created concurrently");
            Ok(NamespaceStatus::Existing)
        }
        Err(e) => Err(e),
    }
}
