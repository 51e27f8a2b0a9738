//
// state.rs
//
// Global LSP state
//

use std::path::PathBuf;
use std::sync::Arc;

use tower_lsp::lsp_types::Url;

use crate::document_store::DocumentStore;
use crate::projects::{ProjectGraph, ProjectLoader};

/// Shared server state, held behind one `RwLock`. The document store and
/// the project graph are internally synchronized, so nearly all access goes
/// through the read lock; the write lock is only needed to mutate the
/// workspace folder list. Readers snapshot what they need and release the
/// lock before any compiler call.
pub struct WorldState {
    pub documents: DocumentStore,
    pub projects: ProjectGraph,
    pub workspace_folders: Vec<Url>,
}

impl WorldState {
    pub fn new(loader: Arc<dyn ProjectLoader>) -> Self {
        Self {
            documents: DocumentStore::new(),
            projects: ProjectGraph::new(loader),
            workspace_folders: Vec::new(),
        }
    }
}

/// File path for a `file://` URI; non-file URIs have no path.
pub fn uri_to_path(uri: &Url) -> Option<PathBuf> {
    uri.to_file_path().ok()
}

/// URI for an absolute file path.
pub fn path_to_uri(path: &std::path::Path) -> Option<Url> {
    Url::from_file_path(path).ok()
}
