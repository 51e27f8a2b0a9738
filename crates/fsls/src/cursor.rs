//
// cursor.rs
//
// Pure text heuristics around a cursor position: the identifier chain under
// the cursor, the end of the identifier, the start of the enclosing method
// call, comma counting for signature help, and title-case fuzzy matching.
//
// Columns are 0-based UTF-16 code units, as delivered by LSP positions.
//

use std::sync::OnceLock;

use regex::Regex;

use crate::utf16;

/// Compiled patterns shared by the cursor heuristics
struct CursorPatterns {
    /// A dotted (or `?`-separated) chain of identifiers
    qualified: Regex,
    /// A single identifier, either a word or a backtick-quoted name
    simple: Regex,
    /// A trailing `let` binding head, which is a declaration rather than a call
    let_binding: Regex,
    /// A trailing `member` head, likewise a declaration
    member_binding: Regex,
}

fn patterns() -> &'static CursorPatterns {
    static PATTERNS: OnceLock<CursorPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| CursorPatterns {
        qualified: Regex::new(r"(\w+|``[^`]+``)([.?](\w+|``[^`]+``))*").unwrap(),
        simple: Regex::new(r"\w+|``[^`]+``").unwrap(),
        let_binding: Regex::new(r"\blet[ \w]+$").unwrap(),
        member_binding: Regex::new(r"\bmember[ \w.]+$").unwrap(),
    })
}

fn strip_backticks(ident: &str) -> &str {
    ident
        .strip_prefix("``")
        .and_then(|s| s.strip_suffix("``"))
        .unwrap_or(ident)
}

/// The qualified-name fragment before the cursor: the identifiers that
/// qualify the position, plus the partial identifier being typed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialLongName {
    pub qualifiers: Vec<String>,
    pub partial: String,
}

/// Find the dotted name chain the cursor lies in, returning the simple
/// identifiers up to and including the one containing the cursor, with
/// surrounding backticks stripped. Returns an empty list when the cursor
/// touches no name, or when it ambiguously touches more than one.
pub fn find_names_under_cursor(line: &str, character: usize) -> Vec<String> {
    let cursor = utf16::utf16_col_to_byte(line, character);
    let overlapping: Vec<_> = patterns()
        .qualified
        .find_iter(line)
        .filter(|m| m.start() <= cursor && cursor <= m.end())
        .collect();
    let m = match overlapping.as_slice() {
        [single] => *single,
        _ => return Vec::new(),
    };

    let mut names = Vec::new();
    for id in patterns().simple.find_iter(m.as_str()) {
        let start = m.start() + id.start();
        let end = m.start() + id.end();
        if start > cursor {
            break;
        }
        names.push(strip_backticks(id.as_str()).to_string());
        if cursor <= end {
            break;
        }
    }
    names
}

/// The exclusive end column of the identifier the cursor lies within, or
/// `None` when the cursor is not on an identifier.
pub fn find_end_of_identifier_under_cursor(line: &str, character: usize) -> Option<usize> {
    let cursor = utf16::utf16_col_to_byte(line, character);
    patterns()
        .simple
        .find_iter(line)
        .find(|m| m.start() <= cursor && cursor <= m.end())
        .map(|m| utf16::byte_to_utf16_col(line, m.end()))
}

/// Scan leftward from the cursor for the `(` that opens the enclosing call
/// and return the length of the trimmed callee text before it. Close parens
/// raise a depth counter so completed nested calls are skipped. Returns
/// `None` when the text before the paren is a `let` or `member` declaration
/// head rather than a call.
pub fn find_method_call_before_cursor(line: &str, character: usize) -> Option<usize> {
    let cursor = utf16::utf16_col_to_byte(line, character);
    let mut depth = 0u32;
    let mut open_paren = None;
    for (idx, ch) in line[..cursor].char_indices().rev() {
        match ch {
            ')' => depth += 1,
            '(' => {
                if depth > 0 {
                    depth -= 1;
                } else {
                    open_paren = Some(idx);
                    break;
                }
            }
            _ => {}
        }
    }
    let open_paren = open_paren?;

    let prefix = line[..open_paren].trim_end();
    if patterns().let_binding.is_match(prefix) || patterns().member_binding.is_match(prefix) {
        return None;
    }
    Some(utf16::byte_to_utf16_col(line, prefix.len()))
}

/// Number of commas between the end of the callee name and the cursor.
/// Commas inside nested calls or string literals are counted too; signature
/// help accepts that imprecision.
pub fn count_commas(line: &str, end_of_name: usize, character: usize) -> u32 {
    let stop = character.saturating_sub(1).min(utf16::utf16_len(line));
    if stop <= end_of_name {
        return 0;
    }
    let start_byte = utf16::utf16_col_to_byte(line, end_of_name);
    let stop_byte = utf16::utf16_col_to_byte(line, stop);
    line[start_byte..stop_byte].matches(',').count() as u32
}

/// Fuzzy match in the style of an IDE symbol search: each character of
/// `find` must either continue exactly where the previous match left off, or
/// jump to the first character of the next uppercase-introduced word.
/// Word-start jumps compare case-insensitively; an empty `find` matches
/// everything.
pub fn matches_title_case(find: &str, candidate: &str) -> bool {
    let cand: Vec<char> = candidate.chars().collect();
    let mut ci = 0usize;
    for fc in find.chars() {
        if ci < cand.len() && cand[ci] == fc {
            ci += 1;
            continue;
        }
        let mut j = ci;
        while j < cand.len() && !cand[j].is_uppercase() {
            j += 1;
        }
        if j < cand.len() && cand[j].to_lowercase().eq(fc.to_lowercase()) {
            ci = j + 1;
            continue;
        }
        return false;
    }
    true
}

/// Split the text before the cursor into qualifying identifiers and the
/// partial identifier still being typed, for completion requests.
pub fn partial_long_name(line: &str, character: usize) -> PartialLongName {
    let cursor = utf16::utf16_col_to_byte(line, character);
    let before = &line[..cursor];

    let mut idx = before.len();
    while let Some(c) = before[..idx].chars().next_back() {
        if c.is_alphanumeric() || c == '_' {
            idx -= c.len_utf8();
        } else {
            break;
        }
    }
    let partial = before[idx..].to_string();

    let mut qualifiers = Vec::new();
    let mut end = idx;
    while end > 0 && before[..end].ends_with('.') {
        end -= 1;
        let start = if before[..end].ends_with("``") {
            match before[..end.saturating_sub(2)].rfind("``") {
                Some(s) => s,
                None => break,
            }
        } else {
            let mut s = end;
            while let Some(c) = before[..s].chars().next_back() {
                if c.is_alphanumeric() || c == '_' {
                    s -= c.len_utf8();
                } else {
                    break;
                }
            }
            s
        };
        if start == end {
            break;
        }
        qualifiers.insert(0, strip_backticks(&before[start..end]).to_string());
        end = start;
    }

    PartialLongName {
        qualifiers,
        partial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_names_in_dotted_chain() {
        assert_eq!(find_names_under_cursor("foo.bar", 5), vec!["foo", "bar"]);
        assert_eq!(find_names_under_cursor("foo.bar", 3), vec!["foo"]);
        assert_eq!(find_names_under_cursor("  x", 0), Vec::<String>::new());
    }

    #[test]
    fn test_names_at_chain_edges() {
        assert_eq!(find_names_under_cursor("foo.bar", 0), vec!["foo"]);
        assert_eq!(find_names_under_cursor("foo.bar", 7), vec!["foo", "bar"]);
    }

    #[test]
    fn test_backtick_identifier() {
        assert_eq!(find_names_under_cursor("``a b``.c", 5), vec!["a b"]);
    }

    #[test]
    fn test_optional_access_chain() {
        assert_eq!(find_names_under_cursor("a?b", 2), vec!["a", "b"]);
    }

    #[test]
    fn test_end_of_identifier() {
        assert_eq!(find_end_of_identifier_under_cursor("foo.bar", 1), Some(3));
        assert_eq!(find_end_of_identifier_under_cursor("foo.bar", 5), Some(7));
        assert_eq!(find_end_of_identifier_under_cursor("   ", 1), None);
    }

    #[test]
    fn test_method_call_before_cursor() {
        assert_eq!(find_method_call_before_cursor("f(x, y", 6), Some(1));
        assert_eq!(find_method_call_before_cursor("let g(x", 6), None);
        assert_eq!(find_method_call_before_cursor("member this.M(x", 14), None);
        assert_eq!(find_method_call_before_cursor("f(g(), ", 7), Some(1));
    }

    #[test]
    fn test_method_call_no_paren() {
        assert_eq!(find_method_call_before_cursor("let x = 1", 9), None);
    }

    #[test]
    fn test_method_call_inside_word_is_not_let() {
        // "violet" must not be mistaken for a `let` head
        assert_eq!(find_method_call_before_cursor("violet(x", 8), Some(6));
    }

    #[test]
    fn test_count_commas() {
        assert_eq!(count_commas("a, b, c)", 0, 7), 2);
        assert_eq!(count_commas("f(x)", 1, 3), 0);
        // Commas inside string literals are counted; a documented limitation
        assert_eq!(count_commas("f(\"a,b\", x", 1, 10), 2);
    }

    #[test]
    fn test_matches_title_case() {
        assert!(matches_title_case("fb", "FooBar"));
        assert!(!matches_title_case("fb", "Foobar"));
        assert!(matches_title_case("", "anything"));
        assert!(!matches_title_case("FB", "fooBar"));
        assert!(matches_title_case("FB", "FooBar"));
        assert!(matches_title_case("foo", "FooBar"));
    }

    #[test]
    fn test_partial_long_name() {
        let p = partial_long_name("System.Cons", 11);
        assert_eq!(p.qualifiers, vec!["System"]);
        assert_eq!(p.partial, "Cons");

        let p = partial_long_name("let x = str.", 12);
        assert_eq!(p.qualifiers, vec!["str"]);
        assert_eq!(p.partial, "");

        let p = partial_long_name("  ab", 4);
        assert!(p.qualifiers.is_empty());
        assert_eq!(p.partial, "ab");
    }

    #[test]
    fn test_partial_long_name_backticks() {
        let p = partial_long_name("``my mod``.Va", 13);
        assert_eq!(p.qualifiers, vec!["my mod"]);
        assert_eq!(p.partial, "Va");
    }

    proptest! {
        /// An empty query matches any candidate.
        #[test]
        fn prop_empty_find_matches_all(candidate in "\\PC*") {
            prop_assert!(matches_title_case("", &candidate));
        }

        /// A candidate always matches itself when it starts uppercase.
        #[test]
        fn prop_identity_match(word in "[A-Z][a-z]{0,8}") {
            prop_assert!(matches_title_case(&word, &word));
        }

        /// Comma counting never exceeds the commas present on the line.
        #[test]
        fn prop_count_commas_bounded(line in "[a-z,() ]{0,30}", end in 0usize..10, cursor in 0usize..40) {
            let total = line.matches(',').count() as u32;
            prop_assert!(count_commas(&line, end, cursor) <= total);
        }
    }
}
