//
// analyzer.rs
//
// The compiler front-end boundary: a gateway trait the server calls for
// parsing, checking and symbol queries, plus the data model those calls
// exchange. The gateway is the only place compiler-owned state lives; all
// types handed back to the server are immutable snapshots.
//

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::broadcast;
use tower_lsp::lsp_types::{Diagnostic, Range};

use crate::cursor::PartialLongName;
use crate::projects::ProjectOptions;

/// Options for a standalone parse, derived from project options.
#[derive(Debug, Clone, Default)]
pub struct ParsingOptions {
    pub source_files: Vec<PathBuf>,
    pub compiler_flags: Vec<String>,
}

/// Declaration kinds reported by the compiler's navigation tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Namespace,
    Module,
    ModuleFile,
    Type,
    Exn,
    Method,
    Property,
    Field,
    Other,
}

/// One declaration in the navigation tree of a parsed file.
#[derive(Debug, Clone)]
pub struct NavigationItem {
    pub name: String,
    pub kind: DeclKind,
    pub range: Range,
}

/// A top-level declaration and the declarations nested directly under it.
#[derive(Debug, Clone)]
pub struct NavigationDecl {
    pub declaration: NavigationItem,
    pub nested: Vec<NavigationItem>,
}

/// Result of parsing one file.
#[derive(Debug, Clone)]
pub struct ParseResult {
    pub file: PathBuf,
    pub diagnostics: Vec<Diagnostic>,
    pub navigation: Vec<NavigationDecl>,
}

/// Result of type-checking one file. The `id` is an opaque handle the
/// gateway implementation uses to find its own state for symbol queries.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub file: PathBuf,
    pub version: i32,
    pub diagnostics: Vec<Diagnostic>,
    pub id: u64,
}

/// Whether a check ran to completion or was aborted mid-way.
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    Succeeded(CheckResult),
    Aborted,
}

/// Where a symbol is declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolLocation {
    pub file: PathBuf,
    pub range: Range,
}

/// A symbol resolved by the compiler. Shared across tasks by handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub display_name: String,
    pub full_name: String,
    pub declaration: Option<SymbolLocation>,
    pub is_private: bool,
    pub is_internal: bool,
}

/// One use of a symbol in a checked file.
#[derive(Debug, Clone)]
pub struct SymbolUse {
    pub symbol: Arc<Symbol>,
    pub file: PathBuf,
    pub range: Range,
    pub is_definition: bool,
}

/// Completion item kinds reported by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    Field,
    Property,
    Method { extension: bool },
    Argument,
    Event,
    Other,
}

/// One completion candidate.
#[derive(Debug, Clone)]
pub struct DeclarationItem {
    pub name: String,
    pub full_name: String,
    pub kind: CompletionKind,
    pub description: String,
}

/// The declaration list for a completion request. Retained as the most
/// recent completion so resolve requests can attach documentation.
#[derive(Debug, Clone, Default)]
pub struct DeclarationList {
    pub items: Vec<DeclarationItem>,
}

/// A single overload's parameter.
#[derive(Debug, Clone)]
pub struct ParameterSig {
    pub name: String,
    pub display: String,
}

/// One overload of a method group.
#[derive(Debug, Clone)]
pub struct Overload {
    pub parameters: Vec<ParameterSig>,
    /// Tooltip groups; used as overload documentation when there is exactly one
    pub documentation: Vec<String>,
}

/// All overloads at a call site.
#[derive(Debug, Clone)]
pub struct MethodGroup {
    pub name: String,
    pub overloads: Vec<Overload>,
}

/// Tooltip elements for a hover, each a compiler-rendered snippet.
#[derive(Debug, Clone)]
pub struct ToolTip {
    pub elements: Vec<String>,
}

/// Events the compiler reports while it works. Subscribers must not block
/// the reporting task.
#[derive(Debug, Clone)]
pub enum AnalyzerEvent {
    /// The compiler is about to check a file in the background
    BeforeBackgroundCheck(PathBuf),
    /// The compiler is approaching its memory budget
    MaxMemory,
}

/// Gateway to the compiler front-end.
///
/// All methods may be long-running and must be safe to call from multiple
/// tasks concurrently; the underlying compiler may serialize calls for the
/// same file.
#[tower_lsp::async_trait]
pub trait Analyzer: Send + Sync {
    /// Parse one file.
    async fn parse(
        &self,
        file: &Path,
        text: &str,
        options: &ParsingOptions,
    ) -> anyhow::Result<ParseResult>;

    /// Parse and type-check one file at the given version.
    async fn check(
        &self,
        file: &Path,
        version: i32,
        text: &str,
        options: &ProjectOptions,
    ) -> anyhow::Result<(ParseResult, CheckOutcome)>;

    /// The most recent cached results for this file and project, if any.
    async fn try_cached(
        &self,
        file: &Path,
        options: &ProjectOptions,
    ) -> Option<(ParseResult, CheckResult, i32)>;

    /// Compilation options for a standalone script file.
    async fn script_options(
        &self,
        file: &Path,
        text: &str,
        mtime: SystemTime,
    ) -> anyhow::Result<(ProjectOptions, Vec<Diagnostic>)>;

    /// Derive parse-only options from full project options.
    fn parsing_options_of(&self, options: &ProjectOptions) -> ParsingOptions;

    /// All uses of a symbol within one checked file.
    fn uses_in_file(&self, check: &CheckResult, symbol: &Symbol) -> Vec<SymbolUse>;

    /// The symbol whose name ends at `end_col` on the 1-based `line`.
    fn symbol_at(
        &self,
        check: &CheckResult,
        line: u32,
        end_col: u32,
        line_text: &str,
        names: &[String],
    ) -> Option<SymbolUse>;

    /// Completion candidates at a position.
    fn declarations(
        &self,
        parse: &ParseResult,
        line: u32,
        line_text: &str,
        partial: &PartialLongName,
    ) -> DeclarationList;

    /// Overloads of the method being called at a position.
    fn methods(
        &self,
        check: &CheckResult,
        line: u32,
        end_col: u32,
        line_text: &str,
        names: &[String],
    ) -> Option<MethodGroup>;

    /// Hover text at a position.
    fn tooltip(
        &self,
        check: &CheckResult,
        line: u32,
        col: u32,
        line_text: &str,
        names: &[String],
    ) -> Option<ToolTip>;

    /// Subscribe to compiler events.
    fn events(&self) -> broadcast::Receiver<AnalyzerEvent>;
}
