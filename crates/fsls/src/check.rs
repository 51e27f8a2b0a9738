//
// check.rs
//
// The check orchestrator: decides when the compiler runs for a file
// (foreground on demand, debounced in the background), publishes the
// resulting diagnostics, sizes progress bars, and keeps the pending
// background work cancellable without ever aborting an in-flight check.
//

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, SystemTime};

use indexmap::IndexSet;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_lsp::lsp_types::{
    Diagnostic, DiagnosticSeverity, FileChangeType, FileEvent, Position, Range, Url,
};

use crate::analyzer::{
    Analyzer, AnalyzerEvent, CheckOutcome, CheckResult, DeclarationList, ParseResult,
};
use crate::document_store::line_of;
use crate::progress::{Notifier, Progress};
use crate::projects::{is_script_file, ProjectOptions};
use crate::state::{path_to_uri, uri_to_path, WorldState};

/// Quiescence window between the last edit and a background re-check.
pub const BACKGROUND_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Files invalidated by edits and awaiting a background re-check, plus the
/// single debounce timer guarding them.
#[derive(Default)]
pub struct PendingBackground {
    files: StdMutex<IndexSet<PathBuf>>,
    timer: StdMutex<Option<CancellationToken>>,
}

impl PendingBackground {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: PathBuf) {
        self.files.lock().expect("pending set poisoned").insert(path);
    }

    /// Removal is by file path, no matter how the file was referred to.
    pub fn remove(&self, path: &Path) {
        self.files
            .lock()
            .expect("pending set poisoned")
            .shift_remove(path);
    }

    pub fn snapshot(&self) -> Vec<PathBuf> {
        self.files
            .lock()
            .expect("pending set poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().expect("pending set poisoned").is_empty()
    }

    fn replace_timer(&self, token: CancellationToken) -> Option<CancellationToken> {
        self.timer
            .lock()
            .expect("pending timer poisoned")
            .replace(token)
    }

    fn take_timer(&self) -> Option<CancellationToken> {
        self.timer.lock().expect("pending timer poisoned").take()
    }
}

/// Last-modified time of each file at the moment the compiler last checked
/// it. Written only from the compiler's before-background-check event; read
/// only to size the on-open progress bar, so weak consistency is fine.
#[derive(Default)]
pub struct CheckedOnDiskMap {
    inner: StdRwLock<std::collections::HashMap<PathBuf, SystemTime>>,
}

impl CheckedOnDiskMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, path: PathBuf, mtime: SystemTime) {
        self.inner
            .write()
            .expect("checked-on-disk map poisoned")
            .insert(path, mtime);
    }

    pub fn last_checked(&self, path: &Path) -> Option<SystemTime> {
        self.inner
            .read()
            .expect("checked-on-disk map poisoned")
            .get(path)
            .copied()
    }
}

/// The most recent completion list, kept so resolve requests can attach
/// documentation. Single slot, last writer wins.
#[derive(Default)]
pub struct LastCompletion {
    slot: StdMutex<Option<DeclarationList>>,
}

impl LastCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, list: DeclarationList) {
        *self.slot.lock().expect("last completion poisoned") = Some(list);
    }

    pub fn documentation_for(&self, full_name: &str) -> Option<String> {
        self.slot
            .lock()
            .expect("last completion poisoned")
            .as_ref()?
            .items
            .iter()
            .find(|item| item.full_name == full_name)
            .map(|item| item.description.clone())
    }
}

/// Outcome of a check tier: parse and check results, or the diagnostics
/// explaining why there are none.
pub type CheckAttempt = Result<(ParseResult, CheckResult), Vec<Diagnostic>>;

/// A diagnostic pinned to the top of the file.
fn file_start_diagnostic(message: String) -> Diagnostic {
    Diagnostic {
        range: Range {
            start: Position {
                line: 0,
                character: 0,
            },
            end: Position {
                line: 0,
                character: 0,
            },
        },
        severity: Some(DiagnosticSeverity::ERROR),
        source: Some("fsls".to_string()),
        message,
        ..Default::default()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// The check orchestrator. Cheap to clone; every clone shares the same
/// pending set, timer, and caches.
#[derive(Clone)]
pub struct Checker {
    state: Arc<RwLock<WorldState>>,
    analyzer: Arc<dyn Analyzer>,
    notifier: Arc<dyn Notifier>,
    pending: Arc<PendingBackground>,
    checked_on_disk: Arc<CheckedOnDiskMap>,
    last_completion: Arc<LastCompletion>,
    /// Background passes run one at a time so checks for the same file
    /// never overlap themselves
    background_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Checker {
    pub fn new(
        state: Arc<RwLock<WorldState>>,
        analyzer: Arc<dyn Analyzer>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            state,
            analyzer,
            notifier,
            pending: Arc::new(PendingBackground::new()),
            checked_on_disk: Arc::new(CheckedOnDiskMap::new()),
            last_completion: Arc::new(LastCompletion::new()),
            background_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn state(&self) -> &Arc<RwLock<WorldState>> {
        &self.state
    }

    pub fn analyzer(&self) -> &Arc<dyn Analyzer> {
        &self.analyzer
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn last_completion(&self) -> &LastCompletion {
        &self.last_completion
    }

    pub fn checked_on_disk(&self) -> &Arc<CheckedOnDiskMap> {
        &self.checked_on_disk
    }

    pub fn pending_is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    // ── Text access ─────────────────────────────────────────────────────

    /// The open buffer and its version, or the on-disk content at version 0.
    async fn current_text(&self, path: &Path) -> Option<(String, i32)> {
        if let Some(uri) = path_to_uri(path) {
            let state = self.state.read().await;
            if let Some(text) = state.documents.get_text(&uri) {
                let version = state.documents.get_version(&uri).unwrap_or(0);
                return Some((text, version));
            }
        }
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Some((text, 0)),
            Err(_) => None,
        }
    }

    pub async fn get_or_read(&self, path: &Path) -> Option<String> {
        self.current_text(path).await.map(|(text, _)| text)
    }

    pub async fn open_version(&self, path: &Path) -> Option<i32> {
        let uri = path_to_uri(path)?;
        self.state.read().await.documents.get_version(&uri)
    }

    /// One line of the document, open buffer preferred.
    pub async fn line_text(&self, path: &Path, line: u32) -> Option<String> {
        let text = self.get_or_read(path).await?;
        Some(line_of(&text, line as usize))
    }

    // ── Project options ─────────────────────────────────────────────────

    /// Options for a file: from the graph for project files, from the
    /// compiler (cached in the graph) for scripts.
    pub async fn options_for(&self, path: &Path) -> Result<Arc<ProjectOptions>, Vec<Diagnostic>> {
        if is_script_file(path) {
            if let Some(options) = self.state.read().await.projects.find_script(path) {
                return Ok(options);
            }
            let Some((text, _)) = self.current_text(path).await else {
                return Err(Vec::new());
            };
            let mtime = std::fs::metadata(path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            match self.analyzer.script_options(path, &text, mtime).await {
                Ok((options, diagnostics)) => {
                    if !diagnostics.is_empty() {
                        log::trace!(
                            "Script options for {} carry {} diagnostics",
                            path.display(),
                            diagnostics.len()
                        );
                    }
                    let state = self.state.read().await;
                    state.projects.put_script(path, options);
                    Ok(state.projects.find_script(path).expect("script just added"))
                }
                Err(e) => Err(vec![file_start_diagnostic(format!(
                    "Failed to resolve script options: {e}"
                ))]),
            }
        } else {
            self.state
                .read()
                .await
                .projects
                .find(path)
                .map_err(|e| vec![file_start_diagnostic(e.to_string())])
        }
    }

    // ── Check tiers ─────────────────────────────────────────────────────

    /// Re-check at the current version, never consulting the cache.
    pub async fn force(&self, path: &Path) -> CheckAttempt {
        let Some((text, version)) = self.current_text(path).await else {
            // Nothing to say about a file that is neither open nor on disk
            self.publish_if_open(path, Vec::new()).await;
            return Err(Vec::new());
        };
        let options = match self.options_for(path).await {
            Ok(options) => options,
            Err(diagnostics) => {
                self.publish_if_open(path, diagnostics.clone()).await;
                return Err(diagnostics);
            }
        };
        match self.analyzer.check(path, version, &text, &options).await {
            Ok((parse, CheckOutcome::Succeeded(check))) => {
                let mut combined = parse.diagnostics.clone();
                combined.extend(check.diagnostics.iter().cloned());
                self.publish_if_open(path, combined).await;
                Ok((parse, check))
            }
            Ok((parse, CheckOutcome::Aborted)) => {
                log::trace!("Check of {} was aborted", path.display());
                self.publish_if_open(path, parse.diagnostics.clone()).await;
                Err(parse.diagnostics)
            }
            Err(e) => {
                log::warn!("Compiler failed on {}: {}", path.display(), e);
                Err(Vec::new())
            }
        }
    }

    /// Check whose result must match the current version; falls back to a
    /// full re-check on a cache miss.
    pub async fn check(&self, path: &Path) -> CheckAttempt {
        let Some((_, version)) = self.current_text(path).await else {
            self.publish_if_open(path, Vec::new()).await;
            return Err(Vec::new());
        };
        let options = match self.options_for(path).await {
            Ok(options) => options,
            Err(diagnostics) => {
                self.publish_if_open(path, diagnostics.clone()).await;
                return Err(diagnostics);
            }
        };
        if let Some((parse, check, cached_version)) =
            self.analyzer.try_cached(path, &options).await
        {
            if cached_version == version {
                let mut combined = parse.diagnostics.clone();
                combined.extend(check.diagnostics.iter().cloned());
                self.publish_if_open(path, combined).await;
                return Ok((parse, check));
            }
        }
        self.force(path).await
    }

    /// Any cached check result is acceptable, however stale; preferred by
    /// latency-sensitive features.
    pub async fn quick(&self, path: &Path) -> CheckAttempt {
        if self.current_text(path).await.is_none() {
            return Err(vec![file_start_diagnostic(format!(
                "No source file {}",
                path.display()
            ))]);
        }
        let options = self.options_for(path).await?;
        if let Some((parse, check, _)) = self.analyzer.try_cached(path, &options).await {
            return Ok((parse, check));
        }
        self.force(path).await
    }

    /// Parse the file with the project's parsing options.
    pub async fn parse_file(&self, path: &Path) -> Option<ParseResult> {
        let text = self.get_or_read(path).await?;
        let options = self.options_for(path).await.ok()?;
        let parsing = self.analyzer.parsing_options_of(&options);
        match self.analyzer.parse(path, &text, &parsing).await {
            Ok(parse) => Some(parse),
            Err(e) => {
                log::warn!("Parse failed for {}: {}", path.display(), e);
                None
            }
        }
    }

    async fn publish_if_open(&self, path: &Path, diagnostics: Vec<Diagnostic>) {
        let Some(uri) = path_to_uri(path) else {
            return;
        };
        // Diagnostics for a file closed since the check started are stale
        if !self.state.read().await.documents.contains(&uri) {
            log::trace!("Suppressing diagnostics for closed {}", uri);
            return;
        }
        self.notifier.publish_diagnostics(uri, diagnostics, None).await;
    }

    // ── Debounced background checking ───────────────────────────────────

    /// Queue a file for background re-checking and restart the quiescence
    /// window.
    pub fn invalidate(&self, path: PathBuf) {
        self.pending.insert(path);
        self.arm_debounce();
    }

    /// Drop the pending wait, leaving any in-flight compiler call alone.
    /// Every foreground operation calls this before running.
    pub fn cancel_debounce(&self) {
        if let Some(token) = self.pending.take_timer() {
            token.cancel();
        }
    }

    /// Restart the quiescence window if anything is still queued. Every
    /// foreground operation calls this after finishing.
    pub fn rearm_if_pending(&self) {
        if !self.pending.is_empty() {
            self.arm_debounce();
        }
    }

    fn arm_debounce(&self) {
        let token = CancellationToken::new();
        if let Some(old) = self.pending.replace_timer(token.clone()) {
            old.cancel();
        }
        let checker = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(BACKGROUND_DEBOUNCE) => {
                    checker.run_background_pass().await;
                }
            }
        });
    }

    async fn run_background_pass(&self) {
        let _guard = self.background_lock.lock().await;
        for path in self.pending.snapshot() {
            // Dequeue before checking: an invalidation that lands while the
            // check is in flight re-queues the file under a fresh debounce
            self.pending.remove(&path);
            let still_open = match path_to_uri(&path) {
                Some(uri) => self.state.read().await.documents.contains(&uri),
                None => false,
            };
            if !still_open {
                continue;
            }
            log::trace!("Background checking {}", path.display());
            let _ = self.check(&path).await;
        }
    }

    // ── Lifecycle operations ────────────────────────────────────────────

    /// A file was opened: size the progress bar from the dependency-ordered
    /// files that need re-checking, then check it.
    pub async fn on_open(&self, path: &Path) {
        let batch = self.open_batch(path).await;
        let title = format!("Checking {}", file_name(path));
        let progress = Progress::begin(self.notifier.clone(), &title, batch.len()).await;
        let _ = self.check(path).await;
        progress.end().await;
    }

    /// Walk the dependency-ordered source list up to the opened file and
    /// keep everything from the first file needing a re-check: files never
    /// checked in this process, files whose mtime moved past the recorded
    /// one, and everything ordered after such a file.
    async fn open_batch(&self, path: &Path) -> Vec<PathBuf> {
        let Ok(options) = self.options_for(path).await else {
            return vec![path.to_path_buf()];
        };
        let ordered = {
            let state = self.state.read().await;
            state.projects.transitive_source_order(&options)
        };
        let mut batch = Vec::new();
        let mut stale = false;
        for file in ordered {
            if !stale && self.needs_recheck(&file) {
                stale = true;
            }
            let is_target = file == *path;
            if stale {
                batch.push(file);
            }
            if is_target {
                break;
            }
        }
        batch
    }

    fn needs_recheck(&self, path: &Path) -> bool {
        match self.checked_on_disk.last_checked(path) {
            None => true,
            Some(checked) => std::fs::metadata(path)
                .and_then(|m| m.modified())
                .map(|mtime| mtime > checked)
                .unwrap_or(false),
        }
    }

    /// A file was saved: force-re-check every open file that can see it.
    pub async fn on_save(&self, path: &Path) {
        let dependents: Vec<PathBuf> = {
            let state = self.state.read().await;
            state
                .documents
                .open_files()
                .into_iter()
                .filter(|open| state.projects.visible(path, open))
                .collect()
        };
        let title = format!("Checking files that depend on {}", file_name(path));
        let progress = Progress::begin(self.notifier.clone(), &title, dependents.len()).await;
        for dependent in dependents {
            let _ = self.force(&dependent).await;
        }
        progress.end().await;
    }

    /// A file was closed: its diagnostics are cleared and any pending
    /// background work for it is dropped.
    pub async fn on_close(&self, uri: &Url) {
        if let Some(path) = uri_to_path(uri) {
            self.pending.remove(&path);
        }
        self.notifier
            .publish_diagnostics(uri.clone(), Vec::new(), None)
            .await;
    }

    /// Watched project files changed on disk: update the graph, then queue
    /// every open file for a background re-check.
    pub async fn on_watched_files(&self, changes: Vec<FileEvent>) {
        {
            let state = self.state.read().await;
            for event in &changes {
                let Some(path) = uri_to_path(&event.uri) else {
                    continue;
                };
                let name = file_name(&path);
                if name == "project.assets.json" {
                    state.projects.update_assets_json(&path);
                } else if event.typ == FileChangeType::DELETED {
                    state.projects.delete_project_file(&path);
                } else {
                    state.projects.put_project_file(&path);
                }
            }
        }
        let open_files = self.state.read().await.documents.open_files();
        if open_files.is_empty() {
            return;
        }
        for path in open_files {
            self.pending.insert(path);
        }
        self.arm_debounce();
    }
}

/// Forward compiler events: record the checked file's mtime for on-open
/// batch sizing, stream per-file progress, and warn when the compiler runs
/// low on memory. Runs until the analyzer drops its event channel.
pub fn spawn_analyzer_event_listener(
    mut events: tokio::sync::broadcast::Receiver<AnalyzerEvent>,
    notifier: Arc<dyn Notifier>,
    checked_on_disk: Arc<CheckedOnDiskMap>,
) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(AnalyzerEvent::BeforeBackgroundCheck(path)) => {
                    if let Ok(mtime) = std::fs::metadata(&path).and_then(|m| m.modified()) {
                        checked_on_disk.record(path.clone(), mtime);
                    }
                    notifier.increment_progress(&file_name(&path)).await;
                }
                Ok(AnalyzerEvent::MaxMemory) => {
                    notifier
                        .show_message(
                            tower_lsp::lsp_types::MessageType::WARNING,
                            "The compiler is approaching its memory limit".to_string(),
                        )
                        .await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Dropped {} compiler events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
