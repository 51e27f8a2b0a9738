//
// progress.rs
//
// Outgoing notifications: diagnostics, messages, and the custom progress
// protocol the editor renders while long batches of files are checked.
//

use serde::{Deserialize, Serialize};
use tower_lsp::lsp_types::notification::Notification;
use tower_lsp::lsp_types::{Diagnostic, MessageType, Url};
use tower_lsp::Client;

use std::sync::Arc;

// ── Custom notifications ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartProgressParams {
    pub title: String,
    pub n_files: u32,
}

pub enum StartProgress {}

impl Notification for StartProgress {
    type Params = StartProgressParams;
    const METHOD: &'static str = "fsharp/startProgress";
}

pub enum IncrementProgress {}

impl Notification for IncrementProgress {
    /// The name of the file being checked
    type Params = String;
    const METHOD: &'static str = "fsharp/incrementProgress";
}

pub enum EndProgress {}

impl Notification for EndProgress {
    type Params = ();
    const METHOD: &'static str = "fsharp/endProgress";
}

// ── Outgoing channel ────────────────────────────────────────────────────

/// The server's outgoing surface, separated from the transport so the
/// orchestrator and features can be exercised without a live client.
#[tower_lsp::async_trait]
pub trait Notifier: Send + Sync {
    async fn publish_diagnostics(
        &self,
        uri: Url,
        diagnostics: Vec<Diagnostic>,
        version: Option<i32>,
    );
    async fn show_message(&self, typ: MessageType, message: String);
    async fn start_progress(&self, title: &str, n_files: u32);
    async fn increment_progress(&self, file_name: &str);
    async fn end_progress(&self);
}

#[tower_lsp::async_trait]
impl Notifier for Client {
    async fn publish_diagnostics(
        &self,
        uri: Url,
        diagnostics: Vec<Diagnostic>,
        version: Option<i32>,
    ) {
        Client::publish_diagnostics(self, uri, diagnostics, version).await;
    }

    async fn show_message(&self, typ: MessageType, message: String) {
        Client::show_message(self, typ, message).await;
    }

    async fn start_progress(&self, title: &str, n_files: u32) {
        self.send_notification::<StartProgress>(StartProgressParams {
            title: title.to_string(),
            n_files,
        })
        .await;
    }

    async fn increment_progress(&self, file_name: &str) {
        self.send_notification::<IncrementProgress>(file_name.to_string())
            .await;
    }

    async fn end_progress(&self) {
        self.send_notification::<EndProgress>(()).await;
    }
}

// ── Batch progress ──────────────────────────────────────────────────────

/// Progress bar around a batch of files. Suppressed for batches of one; a
/// started bar must always be ended, including on the error path.
pub struct Progress {
    notifier: Arc<dyn Notifier>,
    active: bool,
}

impl Progress {
    pub async fn begin(notifier: Arc<dyn Notifier>, title: &str, n_files: usize) -> Self {
        let active = n_files > 1;
        if active {
            notifier.start_progress(title, n_files as u32).await;
        }
        Self { notifier, active }
    }

    pub async fn end(mut self) {
        if self.active {
            self.notifier.end_progress().await;
            self.active = false;
        }
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        if self.active {
            log::warn!("Progress bar dropped without end");
        }
    }
}
