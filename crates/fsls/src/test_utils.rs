//
// test_utils.rs
//
// Shared fixtures: a scriptable fake compiler gateway, a project loader
// backed by a map, and a notifier that records everything it is told.
//

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::broadcast;
use tower_lsp::lsp_types::{
    Diagnostic, DiagnosticSeverity, MessageType, Position, Range, Url,
};

use crate::analyzer::{
    Analyzer, AnalyzerEvent, CheckOutcome, CheckResult, DeclarationList, MethodGroup,
    NavigationDecl, ParseResult, ParsingOptions, Symbol, SymbolUse, ToolTip,
};
use crate::check::Checker;
use crate::cursor::PartialLongName;
use crate::progress::Notifier;
use crate::projects::{ProjectError, ProjectLoader, ProjectOptions};
use crate::state::WorldState;

// ── Diagnostics ─────────────────────────────────────────────────────────

pub fn diag(message: &str) -> Diagnostic {
    Diagnostic {
        range: Range {
            start: Position {
                line: 0,
                character: 0,
            },
            end: Position {
                line: 0,
                character: 1,
            },
        },
        severity: Some(DiagnosticSeverity::ERROR),
        message: message.to_string(),
        ..Default::default()
    }
}

pub fn range(line: u32, start: u32, end: u32) -> Range {
    Range {
        start: Position {
            line,
            character: start,
        },
        end: Position {
            line,
            character: end,
        },
    }
}

// ── Fake compiler gateway ───────────────────────────────────────────────

#[derive(Default)]
struct FakeAnalyzerState {
    parse_diagnostics: HashMap<PathBuf, Vec<Diagnostic>>,
    check_diagnostics: HashMap<PathBuf, Vec<Diagnostic>>,
    navigation: HashMap<PathBuf, Vec<NavigationDecl>>,
    uses: Vec<SymbolUse>,
    declarations: DeclarationList,
    methods: Option<MethodGroup>,
    tooltip: Option<ToolTip>,
    cached_versions: HashMap<PathBuf, i32>,
    check_count: HashMap<PathBuf, usize>,
    abort: HashSet<PathBuf>,
}

pub struct FakeAnalyzer {
    state: Mutex<FakeAnalyzerState>,
    events_tx: broadcast::Sender<AnalyzerEvent>,
    next_id: AtomicU64,
}

impl FakeAnalyzer {
    pub fn new() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Mutex::new(FakeAnalyzerState::default()),
            events_tx,
            next_id: AtomicU64::new(1),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeAnalyzerState> {
        self.state.lock().expect("fake analyzer poisoned")
    }

    pub fn set_parse_diagnostics(&self, file: &Path, diagnostics: Vec<Diagnostic>) {
        self.lock()
            .parse_diagnostics
            .insert(file.to_path_buf(), diagnostics);
    }

    pub fn set_check_diagnostics(&self, file: &Path, diagnostics: Vec<Diagnostic>) {
        self.lock()
            .check_diagnostics
            .insert(file.to_path_buf(), diagnostics);
    }

    pub fn set_navigation(&self, file: &Path, navigation: Vec<NavigationDecl>) {
        self.lock().navigation.insert(file.to_path_buf(), navigation);
    }

    pub fn add_symbol_use(&self, symbol_use: SymbolUse) {
        self.lock().uses.push(symbol_use);
    }

    pub fn set_declarations(&self, declarations: DeclarationList) {
        self.lock().declarations = declarations;
    }

    pub fn set_methods(&self, methods: MethodGroup) {
        self.lock().methods = Some(methods);
    }

    pub fn set_tooltip(&self, tooltip: ToolTip) {
        self.lock().tooltip = Some(tooltip);
    }

    /// Pretend the compiler has a cached result for this file at `version`.
    pub fn prime_cache(&self, file: &Path, version: i32) {
        self.lock().cached_versions.insert(file.to_path_buf(), version);
    }

    /// Make checks of this file abort instead of succeeding.
    pub fn set_abort(&self, file: &Path) {
        self.lock().abort.insert(file.to_path_buf());
    }

    pub fn check_count(&self, file: &Path) -> usize {
        self.lock().check_count.get(file).copied().unwrap_or(0)
    }

    pub fn emit(&self, event: AnalyzerEvent) {
        let _ = self.events_tx.send(event);
    }

    fn parse_result(&self, file: &Path) -> ParseResult {
        let state = self.lock();
        ParseResult {
            file: file.to_path_buf(),
            diagnostics: state
                .parse_diagnostics
                .get(file)
                .cloned()
                .unwrap_or_default(),
            navigation: state.navigation.get(file).cloned().unwrap_or_default(),
        }
    }

    fn check_result(&self, file: &Path, version: i32) -> CheckResult {
        CheckResult {
            file: file.to_path_buf(),
            version,
            diagnostics: self
                .lock()
                .check_diagnostics
                .get(file)
                .cloned()
                .unwrap_or_default(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }
}

#[tower_lsp::async_trait]
impl Analyzer for FakeAnalyzer {
    async fn parse(
        &self,
        file: &Path,
        _text: &str,
        _options: &ParsingOptions,
    ) -> anyhow::Result<ParseResult> {
        Ok(self.parse_result(file))
    }

    async fn check(
        &self,
        file: &Path,
        version: i32,
        _text: &str,
        _options: &ProjectOptions,
    ) -> anyhow::Result<(ParseResult, CheckOutcome)> {
        *self
            .lock()
            .check_count
            .entry(file.to_path_buf())
            .or_insert(0) += 1;
        let parse = self.parse_result(file);
        if self.lock().abort.contains(file) {
            return Ok((parse, CheckOutcome::Aborted));
        }
        let check = self.check_result(file, version);
        Ok((parse, CheckOutcome::Succeeded(check)))
    }

    async fn try_cached(
        &self,
        file: &Path,
        _options: &ProjectOptions,
    ) -> Option<(ParseResult, CheckResult, i32)> {
        let version = *self.lock().cached_versions.get(file)?;
        Some((
            self.parse_result(file),
            self.check_result(file, version),
            version,
        ))
    }

    async fn script_options(
        &self,
        file: &Path,
        _text: &str,
        _mtime: SystemTime,
    ) -> anyhow::Result<(ProjectOptions, Vec<Diagnostic>)> {
        Ok((
            ProjectOptions {
                project_file: file.to_path_buf(),
                source_files: vec![file.to_path_buf()],
                ..Default::default()
            },
            Vec::new(),
        ))
    }

    fn parsing_options_of(&self, options: &ProjectOptions) -> ParsingOptions {
        ParsingOptions {
            source_files: options.source_files.clone(),
            compiler_flags: options.compiler_flags.clone(),
        }
    }

    fn uses_in_file(&self, check: &CheckResult, symbol: &Symbol) -> Vec<SymbolUse> {
        self.lock()
            .uses
            .iter()
            .filter(|u| u.file == check.file && u.symbol.full_name == symbol.full_name)
            .cloned()
            .collect()
    }

    fn symbol_at(
        &self,
        check: &CheckResult,
        line: u32,
        end_col: u32,
        _line_text: &str,
        names: &[String],
    ) -> Option<SymbolUse> {
        self.lock()
            .uses
            .iter()
            .find(|u| {
                u.file == check.file
                    && u.range.start.line == line - 1
                    && u.range.end.character == end_col
                    && (names.is_empty()
                        || names.last() == Some(&u.symbol.display_name))
            })
            .cloned()
    }

    fn declarations(
        &self,
        _parse: &ParseResult,
        _line: u32,
        _line_text: &str,
        partial: &PartialLongName,
    ) -> DeclarationList {
        let state = self.lock();
        let items = state
            .declarations
            .items
            .iter()
            .filter(|item| {
                partial.partial.is_empty()
                    || item
                        .name
                        .to_lowercase()
                        .starts_with(&partial.partial.to_lowercase())
            })
            .cloned()
            .collect();
        DeclarationList { items }
    }

    fn methods(
        &self,
        _check: &CheckResult,
        _line: u32,
        _end_col: u32,
        _line_text: &str,
        _names: &[String],
    ) -> Option<MethodGroup> {
        self.lock().methods.clone()
    }

    fn tooltip(
        &self,
        _check: &CheckResult,
        _line: u32,
        _col: u32,
        _line_text: &str,
        _names: &[String],
    ) -> Option<ToolTip> {
        self.lock().tooltip.clone()
    }

    fn events(&self) -> broadcast::Receiver<AnalyzerEvent> {
        self.events_tx.subscribe()
    }
}

// ── Map-backed project loader ───────────────────────────────────────────

pub struct FakeLoader {
    options: HashMap<PathBuf, ProjectOptions>,
}

impl FakeLoader {
    pub fn new(projects: Vec<ProjectOptions>) -> Self {
        Self {
            options: projects
                .into_iter()
                .map(|p| (p.project_file.clone(), p))
                .collect(),
        }
    }
}

impl ProjectLoader for FakeLoader {
    fn load(&self, project_file: &Path) -> Result<ProjectOptions, ProjectError> {
        self.options
            .get(project_file)
            .cloned()
            .ok_or_else(|| ProjectError::Loader {
                file: project_file.to_path_buf(),
                message: "unresolvable project".to_string(),
            })
    }
}

// ── Recording notifier ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Notified {
    Diagnostics {
        uri: Url,
        diagnostics: Vec<Diagnostic>,
    },
    Message(String),
    StartProgress {
        title: String,
        n_files: u32,
    },
    Increment(String),
    EndProgress,
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notified>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Notified> {
        self.events.lock().expect("notifier poisoned").clone()
    }

    pub fn diagnostics_publishes(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Notified::Diagnostics { .. }))
            .count()
    }

    pub fn last_diagnostics_for(&self, path: &str) -> Option<Vec<Diagnostic>> {
        self.events()
            .iter()
            .rev()
            .find_map(|e| match e {
                Notified::Diagnostics { uri, diagnostics } if uri.path() == path => {
                    Some(diagnostics.clone())
                }
                _ => None,
            })
    }

    fn push(&self, event: Notified) {
        self.events.lock().expect("notifier poisoned").push(event);
    }
}

#[tower_lsp::async_trait]
impl Notifier for RecordingNotifier {
    async fn publish_diagnostics(
        &self,
        uri: Url,
        diagnostics: Vec<Diagnostic>,
        _version: Option<i32>,
    ) {
        self.push(Notified::Diagnostics { uri, diagnostics });
    }

    async fn show_message(&self, _typ: MessageType, message: String) {
        self.push(Notified::Message(message));
    }

    async fn start_progress(&self, title: &str, n_files: u32) {
        self.push(Notified::StartProgress {
            title: title.to_string(),
            n_files,
        });
    }

    async fn increment_progress(&self, file_name: &str) {
        self.push(Notified::Increment(file_name.to_string()));
    }

    async fn end_progress(&self) {
        self.push(Notified::EndProgress);
    }
}

// ── World construction ──────────────────────────────────────────────────

pub fn project_options(
    project_file: &str,
    sources: Vec<&str>,
    references: Vec<&str>,
) -> ProjectOptions {
    ProjectOptions {
        project_file: PathBuf::from(project_file),
        source_files: sources.into_iter().map(PathBuf::from).collect(),
        compiler_flags: Vec::new(),
        references: references.into_iter().map(PathBuf::from).collect(),
    }
}

/// A checker over a world containing the given projects, wired to a fake
/// analyzer and a recording notifier.
pub async fn world_with_projects(
    specs: Vec<(&str, Vec<&str>, Vec<&str>)>,
) -> (Checker, Arc<FakeAnalyzer>, Arc<RecordingNotifier>) {
    let projects: Vec<ProjectOptions> = specs
        .into_iter()
        .map(|(file, sources, references)| project_options(file, sources, references))
        .collect();
    let loader = Arc::new(FakeLoader::new(projects.clone()));
    let world = WorldState::new(loader);
    for project in &projects {
        world.projects.put_project_file(&project.project_file);
    }
    let state = Arc::new(tokio::sync::RwLock::new(world));
    let fake = FakeAnalyzer::new();
    let notifier = Arc::new(RecordingNotifier::new());
    let checker = Checker::new(state, fake.clone(), notifier.clone());
    (checker, fake, notifier)
}

pub async fn world_with_project(
    project_file: &str,
    sources: &[&str],
) -> (Checker, Arc<FakeAnalyzer>, Arc<RecordingNotifier>) {
    world_with_projects(vec![(project_file, sources.to_vec(), vec![])]).await
}

/// Open a document in the world's store.
pub async fn open_doc(checker: &Checker, path: &str, text: &str, version: i32) {
    let uri = Url::from_file_path(path).expect("absolute test path");
    checker
        .state()
        .read()
        .await
        .documents
        .open(uri, text, version);
}
