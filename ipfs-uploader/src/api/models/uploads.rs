use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::backends::BackendEndpoint;
use crate::content::TreeEntry;
use crate::lifecycle::LifecycleState;

/// One file of a directory tree upload
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct TreeEntryRequest {
    /// Relative path inside the tree (e.g. `folder1/hello.txt`)
    pub path: String,
    /// UTF-8 file content
    pub content: String,
}

/// Directory tree upload; all entries are added as one tree
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct TreeUploadRequest {
    pub entries: Vec<TreeEntryRequest>,
}

impl From<TreeEntryRequest> for TreeEntry {
    fn from(entry: TreeEntryRequest) -> Self {
        TreeEntry::new(entry.path, entry.content)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct PingResponse {
    pub message: String,
}

/// A configured node. Credentials are never returned.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendSummary {
    pub name: String,
    pub url: String,
    pub timeout_ms: u64,
    pub max_concurrency: usize,
    pub tree_uploads: bool,
    pub authenticated: bool,
}

impl From<&BackendEndpoint> for BackendSummary {
    fn from(endpoint: &BackendEndpoint) -> Self {
        Self {
            name: endpoint.name.clone(),
            url: endpoint.url.to_string(),
            timeout_ms: endpoint.timeout.as_millis() as u64,
            max_concurrency: endpoint.max_concurrency,
            tree_uploads: endpoint.tree_uploads,
            authenticated: endpoint.credential.is_some(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BackendsResponse {
    pub state: LifecycleState,
    pub backends: Vec<BackendSummary>,
}
