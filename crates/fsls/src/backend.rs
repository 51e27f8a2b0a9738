//
// backend.rs
//
// The server loop: routes LSP requests and notifications to the feature
// handlers and the check orchestrator, and advertises capabilities. The
// compiler gateway and the project loader are injected by the embedder;
// requests outside the advertised surface get the default
// method-not-found response.
//

use std::sync::Arc;

use tokio::sync::RwLock;
use tower_lsp::jsonrpc::Result;
use tower_lsp::lsp_types::*;
use tower_lsp::Client;
use tower_lsp::LanguageServer;
use tower_lsp::LspService;
use tower_lsp::Server;

use crate::analyzer::Analyzer;
use crate::check::{spawn_analyzer_event_listener, Checker};
use crate::handlers;
use crate::progress::Notifier;
use crate::projects::ProjectLoader;
use crate::state::{uri_to_path, WorldState};

pub struct Backend {
    state: Arc<RwLock<WorldState>>,
    checker: Checker,
}

impl Backend {
    pub fn new(
        client: Client,
        analyzer: Arc<dyn Analyzer>,
        loader: Arc<dyn ProjectLoader>,
    ) -> Self {
        let state = Arc::new(RwLock::new(WorldState::new(loader)));
        let notifier: Arc<dyn Notifier> = Arc::new(client);
        let checker = Checker::new(state.clone(), analyzer.clone(), notifier.clone());
        spawn_analyzer_event_listener(
            analyzer.events(),
            notifier,
            checker.checked_on_disk().clone(),
        );
        Self { state, checker }
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        log::info!("Initializing fsls");

        let mut state = self.state.write().await;
        if let Some(folders) = params.workspace_folders {
            for folder in folders {
                log::info!("Adding workspace folder: {}", folder.uri);
                state.workspace_folders.push(folder.uri);
            }
        } else if let Some(root_uri) = params.root_uri {
            log::info!("Adding root URI as workspace folder: {}", root_uri);
            state.workspace_folders.push(root_uri);
        }
        drop(state);

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(TextDocumentSyncKind::INCREMENTAL),
                        will_save: None,
                        will_save_wait_until: None,
                        save: Some(TextDocumentSyncSaveOptions::SaveOptions(SaveOptions {
                            include_text: Some(false),
                        })),
                    },
                )),
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                completion_provider: Some(CompletionOptions {
                    resolve_provider: Some(true),
                    trigger_characters: Some(vec![String::from(".")]),
                    ..Default::default()
                }),
                signature_help_provider: Some(SignatureHelpOptions {
                    trigger_characters: Some(vec![String::from("("), String::from(",")]),
                    ..Default::default()
                }),
                definition_provider: Some(OneOf::Left(true)),
                references_provider: Some(OneOf::Left(true)),
                document_symbol_provider: Some(OneOf::Left(true)),
                workspace_symbol_provider: Some(OneOf::Left(true)),
                rename_provider: Some(OneOf::Left(true)),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: String::from("fsls"),
                version: Some(String::from(env!("CARGO_PKG_VERSION"))),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        let state = self.state.read().await;
        for folder in &state.workspace_folders {
            if let Some(dir) = uri_to_path(folder) {
                state.projects.add_workspace_root(&dir);
            }
        }
        log::info!("Workspace initialization complete");
    }

    async fn shutdown(&self) -> Result<()> {
        log::info!("fsls shutting down");
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let uri = params.text_document.uri;
        let Some(path) = uri_to_path(&uri) else {
            log::warn!("Ignoring non-file URI {}", uri);
            return;
        };

        self.checker.cancel_debounce();
        {
            let state = self.state.read().await;
            state.documents.open(
                uri.clone(),
                &params.text_document.text,
                params.text_document.version,
            );
        }
        self.checker.on_open(&path).await;
        self.checker.rearm_if_pending();
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        let version = params.text_document.version;

        {
            let state = self.state.read().await;
            if let Err(e) = state
                .documents
                .change(&uri, version, params.content_changes)
            {
                log::warn!("Dropping change: {}", e);
                return;
            }
        }
        if let Some(path) = uri_to_path(&uri) {
            self.checker.invalidate(path);
        }
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        let Some(path) = uri_to_path(&params.text_document.uri) else {
            return;
        };
        self.checker.cancel_debounce();
        self.checker.on_save(&path).await;
        self.checker.rearm_if_pending();
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        {
            let state = self.state.read().await;
            state.documents.close(&uri);
        }
        self.checker.on_close(&uri).await;
    }

    async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        self.checker.cancel_debounce();
        self.checker.on_watched_files(params.changes).await;
    }

    async fn did_change_workspace_folders(&self, params: DidChangeWorkspaceFoldersParams) {
        let mut state = self.state.write().await;
        for folder in params.event.added {
            log::info!("Adding workspace folder: {}", folder.uri);
            state.workspace_folders.push(folder.uri.clone());
            if let Some(dir) = uri_to_path(&folder.uri) {
                state.projects.add_workspace_root(&dir);
            }
        }
        for folder in params.event.removed {
            log::info!("Workspace folder removed: {}", folder.uri);
            state.workspace_folders.retain(|f| f != &folder.uri);
        }
    }

    async fn did_change_configuration(&self, _params: DidChangeConfigurationParams) {
        // No configurable knobs in the core; acknowledged for completeness
        log::trace!("Configuration changed");
    }

    async fn hover(&self, params: HoverParams) -> Result<Option<Hover>> {
        self.checker.cancel_debounce();
        let result = handlers::hover(
            &self.checker,
            &params.text_document_position_params.text_document.uri,
            params.text_document_position_params.position,
        )
        .await;
        self.checker.rearm_if_pending();
        Ok(result)
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        self.checker.cancel_debounce();
        let result = handlers::completion(
            &self.checker,
            &params.text_document_position.text_document.uri,
            params.text_document_position.position,
        )
        .await;
        self.checker.rearm_if_pending();
        Ok(result)
    }

    async fn completion_resolve(&self, item: CompletionItem) -> Result<CompletionItem> {
        Ok(handlers::resolve_completion(&self.checker, item))
    }

    async fn signature_help(&self, params: SignatureHelpParams) -> Result<Option<SignatureHelp>> {
        self.checker.cancel_debounce();
        let result = handlers::signature_help(
            &self.checker,
            &params.text_document_position_params.text_document.uri,
            params.text_document_position_params.position,
        )
        .await;
        self.checker.rearm_if_pending();
        Ok(result)
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Result<Option<GotoDefinitionResponse>> {
        self.checker.cancel_debounce();
        let result = handlers::goto_definition(
            &self.checker,
            &params.text_document_position_params.text_document.uri,
            params.text_document_position_params.position,
        )
        .await;
        self.checker.rearm_if_pending();
        Ok(result)
    }

    async fn references(&self, params: ReferenceParams) -> Result<Option<Vec<Location>>> {
        self.checker.cancel_debounce();
        let result = handlers::references(
            &self.checker,
            &params.text_document_position.text_document.uri,
            params.text_document_position.position,
        )
        .await;
        self.checker.rearm_if_pending();
        Ok(result)
    }

    async fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> Result<Option<DocumentSymbolResponse>> {
        self.checker.cancel_debounce();
        let result =
            handlers::document_symbols(&self.checker, &params.text_document.uri).await;
        self.checker.rearm_if_pending();
        Ok(result)
    }

    async fn symbol(
        &self,
        params: WorkspaceSymbolParams,
    ) -> Result<Option<Vec<SymbolInformation>>> {
        self.checker.cancel_debounce();
        let result = handlers::workspace_symbols(&self.checker, &params.query).await;
        self.checker.rearm_if_pending();
        Ok(result)
    }

    async fn rename(&self, params: RenameParams) -> Result<Option<WorkspaceEdit>> {
        self.checker.cancel_debounce();
        let result = handlers::rename(
            &self.checker,
            &params.text_document_position.text_document.uri,
            params.text_document_position.position,
            &params.new_name,
        )
        .await;
        self.checker.rearm_if_pending();
        Ok(result)
    }
}

/// Run the language server over stdio with the given collaborators until the
/// client disconnects. The embedder maps the result to an exit code.
pub async fn start_lsp(
    analyzer: Arc<dyn Analyzer>,
    loader: Arc<dyn ProjectLoader>,
) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) =
        LspService::new(move |client| Backend::new(client, analyzer, loader));
    Server::new(stdin, stdout, socket).serve(service).await;
    Ok(())
}
