//
// document_store.rs
//
// Versioned text buffers for open documents, with UTF-16 aware incremental
// edits and line extraction. Internally synchronized: the map lock guards
// insertion and removal, and each document carries its own lock, so one
// writer per URI runs alongside readers of every other document.
//

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use ropey::Rope;
use tower_lsp::lsp_types::{TextDocumentContentChangeEvent, Url};

/// An open document
pub struct Document {
    pub contents: Rope,
    pub version: i32,
}

impl Document {
    fn new(text: &str, version: i32) -> Self {
        Self {
            contents: Rope::from_str(text),
            version,
        }
    }

    fn apply_change(&mut self, change: TextDocumentContentChangeEvent) {
        if let Some(range) = change.range {
            let start_line = (range.start.line as usize).min(self.contents.len_lines() - 1);
            let end_line = (range.end.line as usize).min(self.contents.len_lines() - 1);

            let start_line_text = self.contents.line(start_line).to_string();
            let end_line_text = self.contents.line(end_line).to_string();

            let start_char = utf16_offset_to_char_offset(
                &start_line_text,
                range.start.character as usize,
            );
            let end_char =
                utf16_offset_to_char_offset(&end_line_text, range.end.character as usize);

            let start_idx = self.contents.line_to_char(start_line) + start_char;
            let end_idx = self.contents.line_to_char(end_line) + end_char;

            self.contents.remove(start_idx..end_idx);
            self.contents.insert(start_idx, &change.text);
        } else {
            // Full document sync
            self.contents = Rope::from_str(&change.text);
        }
    }

    pub fn text(&self) -> String {
        self.contents.to_string()
    }
}

/// Convert UTF-16 offset to char offset within a line
fn utf16_offset_to_char_offset(line_text: &str, utf16_offset: usize) -> usize {
    let mut utf16_count = 0;
    let mut char_count = 0;

    for ch in line_text.chars() {
        if utf16_count >= utf16_offset {
            return char_count;
        }
        utf16_count += ch.len_utf16();
        char_count += 1;
    }
    char_count
}

/// Operating on a URI that is not open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDocument(pub Url);

impl fmt::Display for UnknownDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "document is not open: {}", self.0)
    }
}

impl std::error::Error for UnknownDocument {}

/// Store for open documents
///
/// Writes for a given URI are applied in the order the caller delivers
/// them; the version only ever increases while a document stays open.
/// Closing drops the buffer; the file on disk may still be read on demand
/// by the orchestrator.
#[derive(Default)]
pub struct DocumentStore {
    documents: RwLock<HashMap<Url, Arc<RwLock<Document>>>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, uri: &Url) -> Option<Arc<RwLock<Document>>> {
        self.documents
            .read()
            .expect("document map poisoned")
            .get(uri)
            .cloned()
    }

    pub fn open(&self, uri: Url, text: &str, version: i32) {
        log::trace!("Opening document {} at version {}", uri, version);
        self.documents
            .write()
            .expect("document map poisoned")
            .insert(uri, Arc::new(RwLock::new(Document::new(text, version))));
    }

    /// Apply incremental changes in order and move the document to `version`.
    pub fn change(
        &self,
        uri: &Url,
        version: i32,
        changes: Vec<TextDocumentContentChangeEvent>,
    ) -> Result<(), UnknownDocument> {
        let doc = self.entry(uri).ok_or_else(|| UnknownDocument(uri.clone()))?;
        let mut doc = doc.write().expect("document poisoned");
        for change in changes {
            doc.apply_change(change);
        }
        doc.version = version;
        Ok(())
    }

    pub fn close(&self, uri: &Url) {
        log::trace!("Closing document {}", uri);
        self.documents
            .write()
            .expect("document map poisoned")
            .remove(uri);
    }

    pub fn get_text(&self, uri: &Url) -> Option<String> {
        let doc = self.entry(uri)?;
        let doc = doc.read().expect("document poisoned");
        Some(doc.text())
    }

    pub fn get_version(&self, uri: &Url) -> Option<i32> {
        let doc = self.entry(uri)?;
        let version = doc.read().expect("document poisoned").version;
        Some(version)
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.documents
            .read()
            .expect("document map poisoned")
            .contains_key(uri)
    }

    /// File paths of all open documents
    pub fn open_files(&self) -> Vec<PathBuf> {
        self.documents
            .read()
            .expect("document map poisoned")
            .keys()
            .filter_map(|uri| uri.to_file_path().ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.documents
            .read()
            .expect("document map poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents
            .read()
            .expect("document map poisoned")
            .is_empty()
    }
}

/// The requested line with its trailing newline stripped; the empty string
/// past the end of the text.
pub fn line_of(text: &str, line: usize) -> String {
    text.lines().nth(line).unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower_lsp::lsp_types::{Position, Range};

    fn test_uri(name: &str) -> Url {
        Url::parse(&format!("file:///{}", name)).unwrap()
    }

    fn edit(start: (u32, u32), end: (u32, u32), text: &str) -> TextDocumentContentChangeEvent {
        TextDocumentContentChangeEvent {
            range: Some(Range {
                start: Position {
                    line: start.0,
                    character: start.1,
                },
                end: Position {
                    line: end.0,
                    character: end.1,
                },
            }),
            range_length: None,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_open_and_read() {
        let store = DocumentStore::new();
        let uri = test_uri("a.fs");

        store.open(uri.clone(), "let x = 1", 1);

        assert!(store.contains(&uri));
        assert_eq!(store.get_text(&uri).as_deref(), Some("let x = 1"));
        assert_eq!(store.get_version(&uri), Some(1));
    }

    #[test]
    fn test_incremental_change() {
        let store = DocumentStore::new();
        let uri = test_uri("a.fs");

        store.open(uri.clone(), "hello world", 1);
        store
            .change(&uri, 2, vec![edit((0, 6), (0, 11), "there")])
            .unwrap();

        assert_eq!(store.get_text(&uri).as_deref(), Some("hello there"));
        assert_eq!(store.get_version(&uri), Some(2));
    }

    #[test]
    fn test_changes_applied_in_order() {
        let store = DocumentStore::new();
        let uri = test_uri("a.fs");

        store.open(uri.clone(), "abc", 1);
        store
            .change(
                &uri,
                2,
                vec![edit((0, 0), (0, 1), "x"), edit((0, 1), (0, 2), "y")],
            )
            .unwrap();

        assert_eq!(store.get_text(&uri).as_deref(), Some("xyc"));
    }

    #[test]
    fn test_full_sync_change() {
        let store = DocumentStore::new();
        let uri = test_uri("a.fs");

        store.open(uri.clone(), "old", 1);
        store
            .change(
                &uri,
                5,
                vec![TextDocumentContentChangeEvent {
                    range: None,
                    range_length: None,
                    text: "new".to_string(),
                }],
            )
            .unwrap();

        assert_eq!(store.get_text(&uri).as_deref(), Some("new"));
        assert_eq!(store.get_version(&uri), Some(5));
    }

    #[test]
    fn test_change_unknown_document() {
        let store = DocumentStore::new();
        let uri = test_uri("missing.fs");
        let err = store.change(&uri, 1, vec![]).unwrap_err();
        assert_eq!(err, UnknownDocument(uri));
    }

    #[test]
    fn test_utf16_emoji_edit() {
        // 🎉 is 2 UTF-16 code units
        let store = DocumentStore::new();
        let uri = test_uri("a.fs");

        store.open(uri.clone(), "a🎉b", 1);
        store.change(&uri, 2, vec![edit((0, 3), (0, 3), "x")]).unwrap();

        assert_eq!(store.get_text(&uri).as_deref(), Some("a🎉xb"));
    }

    #[test]
    fn test_multiline_edit() {
        let store = DocumentStore::new();
        let uri = test_uri("a.fs");

        store.open(uri.clone(), "line1\nline2\nline3", 1);
        store
            .change(&uri, 2, vec![edit((0, 5), (1, 5), "")])
            .unwrap();

        assert_eq!(store.get_text(&uri).as_deref(), Some("line1\nline3"));
    }

    #[test]
    fn test_close_drops_buffer() {
        let store = DocumentStore::new();
        let uri = test_uri("a.fs");

        store.open(uri.clone(), "let x = 1", 1);
        store.close(&uri);

        assert!(!store.contains(&uri));
        assert_eq!(store.get_text(&uri), None);
    }

    #[test]
    fn test_open_files() {
        let store = DocumentStore::new();
        store.open(test_uri("a.fs"), "", 1);
        store.open(test_uri("b.fs"), "", 1);

        let mut files = store.open_files();
        files.sort();
        assert_eq!(files, vec![PathBuf::from("/a.fs"), PathBuf::from("/b.fs")]);
    }

    #[test]
    fn test_reads_do_not_block_other_documents() {
        // A held write lock on one document must not stall reads of another
        let store = DocumentStore::new();
        let busy = test_uri("busy.fs");
        let idle = test_uri("idle.fs");
        store.open(busy.clone(), "let x = 1", 1);
        store.open(idle.clone(), "let y = 2", 1);

        let busy_entry = store.entry(&busy).unwrap();
        let _writer = busy_entry.write().expect("document poisoned");

        assert_eq!(store.get_text(&idle).as_deref(), Some("let y = 2"));
        assert_eq!(store.get_version(&idle), Some(1));
        assert!(store.contains(&busy));
    }

    #[test]
    fn test_line_of() {
        assert_eq!(line_of("let x = 1\nlet y = 2", 0), "let x = 1");
        assert_eq!(line_of("let x = 1\nlet y = 2", 1), "let y = 2");
        assert_eq!(line_of("let x = 1\n", 1), "");
        assert_eq!(line_of("one line", 5), "");
    }
}
