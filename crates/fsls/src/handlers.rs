//
// handlers.rs
//
// One function per LSP feature. Each composes the cursor heuristics, the
// check orchestrator and the compiler gateway, and fails soft: a feature
// that cannot answer returns nothing rather than an error.
//

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;

use indexmap::IndexSet;
use regex::Regex;
use tower_lsp::lsp_types::*;

use crate::analyzer::{
    CompletionKind, DeclKind, DeclarationItem, NavigationDecl, NavigationItem, Overload, Symbol,
    SymbolUse,
};
use crate::check::Checker;
use crate::cursor;
use crate::document_store::line_of;
use crate::progress::Progress;
use crate::state::{path_to_uri, uri_to_path};
use crate::utf16;

/// The maximum number of workspace symbol results returned for one query.
const MAX_WORKSPACE_SYMBOLS: usize = 50;

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\w+").unwrap())
}

// ── Kind mapping ────────────────────────────────────────────────────────

fn completion_item_kind(kind: CompletionKind) -> Option<CompletionItemKind> {
    match kind {
        CompletionKind::Field => Some(CompletionItemKind::FIELD),
        CompletionKind::Property => Some(CompletionItemKind::PROPERTY),
        CompletionKind::Method { .. } => Some(CompletionItemKind::METHOD),
        CompletionKind::Argument => Some(CompletionItemKind::VARIABLE),
        CompletionKind::Event | CompletionKind::Other => None,
    }
}

fn symbol_kind(kind: DeclKind) -> SymbolKind {
    match kind {
        DeclKind::Namespace => SymbolKind::NAMESPACE,
        DeclKind::Module | DeclKind::ModuleFile => SymbolKind::MODULE,
        DeclKind::Type => SymbolKind::INTERFACE,
        DeclKind::Exn => SymbolKind::CLASS,
        DeclKind::Method => SymbolKind::METHOD,
        DeclKind::Property => SymbolKind::PROPERTY,
        DeclKind::Field => SymbolKind::FIELD,
        DeclKind::Other => SymbolKind::VARIABLE,
    }
}

// ── Hover ───────────────────────────────────────────────────────────────

pub async fn hover(checker: &Checker, uri: &Url, position: Position) -> Option<Hover> {
    let path = uri_to_path(uri)?;
    let line = checker.line_text(&path, position.line).await?;
    let names = cursor::find_names_under_cursor(&line, position.character as usize);
    if names.is_empty() {
        return None;
    }
    let (_parse, check) = checker.check(&path).await.ok()?;
    let tip = checker.analyzer().tooltip(
        &check,
        position.line + 1,
        position.character + 1,
        &line,
        &names,
    )?;
    let contents = tip
        .elements
        .into_iter()
        .map(|value| {
            MarkedString::LanguageString(LanguageString {
                language: "fsharp".to_string(),
                value,
            })
        })
        .collect();
    Some(Hover {
        contents: HoverContents::Array(contents),
        range: None,
    })
}

// ── Completion ──────────────────────────────────────────────────────────

fn to_completion_item(item: &DeclarationItem) -> CompletionItem {
    CompletionItem {
        label: item.name.clone(),
        kind: completion_item_kind(item.kind),
        detail: Some(item.full_name.clone()),
        data: Some(serde_json::json!({ "FullName": item.full_name })),
        ..Default::default()
    }
}

pub async fn completion(
    checker: &Checker,
    uri: &Url,
    position: Position,
) -> Option<CompletionResponse> {
    let path = uri_to_path(uri)?;
    // Responsiveness beats freshness here; any cached check will do
    let (parse, _check) = checker.quick(&path).await.ok()?;
    let line = checker.line_text(&path, position.line).await?;
    let partial = cursor::partial_long_name(&line, position.character as usize);
    let declarations =
        checker
            .analyzer()
            .declarations(&parse, position.line + 1, &line, &partial);
    checker.last_completion().store(declarations.clone());
    let items = declarations.items.iter().map(to_completion_item).collect();
    Some(CompletionResponse::List(CompletionList {
        is_incomplete: false,
        items,
    }))
}

/// Enrich a completion item with documentation from the most recent
/// completion list; best-effort by design.
pub fn resolve_completion(checker: &Checker, mut item: CompletionItem) -> CompletionItem {
    let full_name = item
        .data
        .as_ref()
        .and_then(|data| data.get("FullName"))
        .and_then(|v| v.as_str());
    if let Some(full_name) = full_name {
        if let Some(description) = checker.last_completion().documentation_for(full_name) {
            item.documentation = Some(Documentation::String(description));
        }
    }
    item
}

// ── Signature help ──────────────────────────────────────────────────────

fn find_compatible_overload(active_parameter: u32, overloads: &[Overload]) -> Option<u32> {
    overloads
        .iter()
        .position(|o| active_parameter == 0 || (active_parameter as usize) < o.parameters.len())
        .map(|i| i as u32)
}

pub async fn signature_help(
    checker: &Checker,
    uri: &Url,
    position: Position,
) -> Option<SignatureHelp> {
    let path = uri_to_path(uri)?;
    let (_parse, check) = checker.quick(&path).await.ok()?;
    let line = checker.line_text(&path, position.line).await?;
    let end_of_name = cursor::find_method_call_before_cursor(&line, position.character as usize)?;
    let names = cursor::find_names_under_cursor(&line, end_of_name.saturating_sub(1));
    let group = checker.analyzer().methods(
        &check,
        position.line + 1,
        end_of_name as u32,
        &line,
        &names,
    )?;

    let signatures = group
        .overloads
        .iter()
        .map(|overload| {
            let parameter_list: Vec<String> =
                overload.parameters.iter().map(|p| p.display.clone()).collect();
            SignatureInformation {
                label: format!("{}({})", group.name, parameter_list.join(", ")),
                documentation: if overload.documentation.len() == 1 {
                    Some(Documentation::String(overload.documentation[0].clone()))
                } else {
                    None
                },
                parameters: Some(
                    overload
                        .parameters
                        .iter()
                        .map(|p| ParameterInformation {
                            label: ParameterLabel::Simple(p.display.clone()),
                            documentation: None,
                        })
                        .collect(),
                ),
                active_parameter: None,
            }
        })
        .collect();

    let active_parameter =
        cursor::count_commas(&line, end_of_name, position.character as usize);
    let active_signature = find_compatible_overload(active_parameter, &group.overloads);
    Some(SignatureHelp {
        signatures,
        active_signature,
        active_parameter: Some(active_parameter),
    })
}

// ── Symbol lookup ───────────────────────────────────────────────────────

async fn symbol_at(checker: &Checker, path: &Path, position: Position) -> Option<SymbolUse> {
    let line = checker.line_text(path, position.line).await?;
    let end_col = cursor::find_end_of_identifier_under_cursor(&line, position.character as usize)?;
    let names = cursor::find_names_under_cursor(&line, end_col.saturating_sub(1));
    let (_parse, check) = checker.check(path).await.ok()?;
    checker
        .analyzer()
        .symbol_at(&check, position.line + 1, end_col as u32, &line, &names)
}

pub async fn goto_definition(
    checker: &Checker,
    uri: &Url,
    position: Position,
) -> Option<GotoDefinitionResponse> {
    let path = uri_to_path(uri)?;
    let symbol_use = symbol_at(checker, &path, position).await?;
    let declaration = symbol_use.symbol.declaration.as_ref()?;
    let location = Location {
        uri: path_to_uri(&declaration.file)?,
        range: declaration.range,
    };
    Some(GotoDefinitionResponse::Scalar(location))
}

pub async fn references(
    checker: &Checker,
    uri: &Url,
    position: Position,
) -> Option<Vec<Location>> {
    let path = uri_to_path(uri)?;
    let symbol_use = symbol_at(checker, &path, position).await?;
    let uses = find_all_symbol_uses(checker, &symbol_use.symbol).await;
    Some(
        uses.into_iter()
            .filter_map(|u| {
                Some(Location {
                    uri: path_to_uri(&u.file)?,
                    range: u.range,
                })
            })
            .collect(),
    )
}

/// Every use of a symbol across the workspace.
///
/// Accessibility narrows the candidate files: a private symbol stays in its
/// declaring file, an internal one in its declaring project, anything else
/// is bounded only by dependency-order visibility. Candidates are
/// pre-filtered by a plain substring search before the compiler is asked.
/// The accessibility detection mirrors the compiler's declared flags;
/// implicitly-private symbols are not inferred.
async fn find_all_symbol_uses(checker: &Checker, symbol: &Arc<Symbol>) -> Vec<SymbolUse> {
    let is_private = symbol.is_private;
    let is_internal = symbol.is_private || symbol.is_internal;

    let candidates: Vec<PathBuf> = {
        let state = checker.state().read().await;
        let decl_file = symbol.declaration.as_ref().map(|d| d.file.clone());
        let decl_project = decl_file
            .as_ref()
            .and_then(|f| state.projects.find(f).ok());

        let mut candidates = IndexSet::new();
        for project in state.projects.open_projects() {
            for file in &project.source_files {
                let visible = if is_private {
                    decl_file
                        .as_ref()
                        .map(|df| crate::projects::same_file(df, file))
                        .unwrap_or(false)
                } else if is_internal {
                    match (&decl_file, &decl_project) {
                        (Some(df), Some(dp)) => {
                            project.project_file == dp.project_file
                                && state.projects.visible(df, file)
                        }
                        _ => false,
                    }
                } else {
                    match &decl_file {
                        None => true,
                        Some(df) => state.projects.visible(df, file),
                    }
                };
                if visible {
                    candidates.insert(file.clone());
                }
            }
        }
        candidates.into_iter().collect()
    };

    let mut survivors = Vec::new();
    for file in candidates {
        if let Some(text) = checker.get_or_read(&file).await {
            if text.contains(&symbol.display_name) {
                survivors.push(file);
            }
        }
    }

    let title = format!("Finding uses of {}", symbol.display_name);
    let progress = Progress::begin(checker.notifier().clone(), &title, survivors.len()).await;
    let mut uses = Vec::new();
    for file in survivors {
        if let Ok((_parse, check)) = checker.check(&file).await {
            uses.extend(checker.analyzer().uses_in_file(&check, symbol));
        }
    }
    progress.end().await;
    uses
}

// ── Document and workspace symbols ──────────────────────────────────────

/// Flatten a navigation tree into (declaration, container) pairs.
fn flatten_navigation(
    navigation: &[NavigationDecl],
) -> Vec<(NavigationItem, Option<String>)> {
    let mut flat = Vec::new();
    for top in navigation {
        flat.push((top.declaration.clone(), None));
        for nested in &top.nested {
            flat.push((nested.clone(), Some(top.declaration.name.clone())));
        }
    }
    flat
}

#[allow(deprecated)]
fn to_symbol_information(
    item: &NavigationItem,
    container: Option<String>,
    uri: &Url,
) -> SymbolInformation {
    SymbolInformation {
        name: item.name.clone(),
        kind: symbol_kind(item.kind),
        tags: None,
        deprecated: None,
        location: Location {
            uri: uri.clone(),
            range: item.range,
        },
        container_name: container,
    }
}

pub async fn document_symbols(
    checker: &Checker,
    uri: &Url,
) -> Option<DocumentSymbolResponse> {
    let path = uri_to_path(uri)?;
    let parse = checker.parse_file(&path).await?;
    let symbols = flatten_navigation(&parse.navigation)
        .into_iter()
        .map(|(item, container)| to_symbol_information(&item, container, uri))
        .collect();
    Some(DocumentSymbolResponse::Flat(symbols))
}

pub async fn workspace_symbols(
    checker: &Checker,
    query: &str,
) -> Option<Vec<SymbolInformation>> {
    let files: Vec<PathBuf> = {
        let state = checker.state().read().await;
        let mut files: Vec<PathBuf> = state
            .projects
            .open_projects()
            .iter()
            .flat_map(|p| p.source_files.iter().cloned())
            .collect();
        // Workspace scripts are single-file projects; search them too
        files.extend(state.projects.script_files());
        files
    };

    let mut results = Vec::new();
    let mut seen_files = IndexSet::new();
    'files: for file in &files {
        if !seen_files.insert(file.clone()) {
            continue;
        }
        let Some(text) = checker.get_or_read(file).await else {
            continue;
        };
        // Cheap token scan before paying for a parse
        let worth_parsing = identifier_pattern()
            .find_iter(&text)
            .any(|token| cursor::matches_title_case(query, token.as_str()));
        if !worth_parsing {
            continue;
        }
        let Some(parse) = checker.parse_file(file).await else {
            continue;
        };
        let Some(file_uri) = path_to_uri(file) else {
            continue;
        };
        for (item, container) in flatten_navigation(&parse.navigation) {
            if cursor::matches_title_case(query, &item.name) {
                results.push(to_symbol_information(&item, container, &file_uri));
                if results.len() >= MAX_WORKSPACE_SYMBOLS {
                    break 'files;
                }
            }
        }
    }
    Some(results)
}

// ── Rename ──────────────────────────────────────────────────────────────

/// Narrow a compiler-reported range to the last occurrence of the symbol's
/// display name on the range's last line; qualified uses report the whole
/// dotted path but only the final identifier is renamed.
fn refine_range(name: &str, text: &str, range: Range) -> Range {
    let line_text = line_of(text, range.end.line as usize);
    let start_col = if range.start.line == range.end.line {
        range.start.character as usize
    } else {
        0
    };
    let end_col = (range.end.character as usize).min(utf16::utf16_len(&line_text));
    let start_byte = utf16::utf16_col_to_byte(&line_text, start_col);
    let end_byte = utf16::utf16_col_to_byte(&line_text, end_col);
    if start_byte > end_byte || end_byte > line_text.len() {
        return range;
    }
    match line_text[start_byte..end_byte].rfind(name) {
        Some(rel) => {
            let found = start_byte + rel;
            Range {
                start: Position {
                    line: range.end.line,
                    character: utf16::byte_to_utf16_col(&line_text, found) as u32,
                },
                end: Position {
                    line: range.end.line,
                    character: utf16::byte_to_utf16_col(&line_text, found + name.len()) as u32,
                },
            }
        }
        None => range,
    }
}

pub async fn rename(
    checker: &Checker,
    uri: &Url,
    position: Position,
    new_name: &str,
) -> Option<WorkspaceEdit> {
    let path = uri_to_path(uri)?;
    let symbol_use = symbol_at(checker, &path, position).await?;
    let symbol = symbol_use.symbol.clone();
    let uses = find_all_symbol_uses(checker, &symbol).await;

    let mut by_file: HashMap<PathBuf, Vec<SymbolUse>> = HashMap::new();
    for symbol_use in uses {
        by_file
            .entry(symbol_use.file.clone())
            .or_default()
            .push(symbol_use);
    }

    let mut files: Vec<PathBuf> = by_file.keys().cloned().collect();
    files.sort();

    let mut document_edits = Vec::new();
    for file in files {
        let file_uri = path_to_uri(&file)?;
        let version = checker.open_version(&file).await.unwrap_or(0);
        let text = checker.get_or_read(&file).await.unwrap_or_default();
        let edits = by_file
            .remove(&file)
            .unwrap_or_default()
            .into_iter()
            .map(|u| {
                OneOf::Left(TextEdit {
                    range: refine_range(&symbol.display_name, &text, u.range),
                    new_text: new_name.to_string(),
                })
            })
            .collect();
        document_edits.push(TextDocumentEdit {
            text_document: OptionalVersionedTextDocumentIdentifier {
                uri: file_uri,
                version: Some(version),
            },
            edits,
        });
    }

    Some(WorkspaceEdit {
        changes: None,
        document_changes: Some(DocumentChanges::Edits(document_edits)),
        change_annotations: None,
    })
}
