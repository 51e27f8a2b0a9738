/// Convert a UTF-16 column offset (from LSP Position.character) to a byte
/// offset within the given line. Internal string processing works on UTF-8
/// bytes, not UTF-16 code units.
pub fn utf16_col_to_byte(line: &str, utf16_col: usize) -> usize {
    let mut utf16_count = 0;
    for (byte_idx, ch) in line.char_indices() {
        if utf16_count >= utf16_col {
            return byte_idx;
        }
        utf16_count += ch.len_utf16();
    }
    line.len()
}

/// Convert a byte offset within the given line back to a UTF-16 column.
pub fn byte_to_utf16_col(line: &str, byte_offset: usize) -> usize {
    let mut utf16_count = 0;
    for (byte_idx, ch) in line.char_indices() {
        if byte_idx >= byte_offset {
            return utf16_count;
        }
        utf16_count += ch.len_utf16();
    }
    utf16_count
}

/// Length of the line in UTF-16 code units.
pub fn utf16_len(line: &str) -> usize {
    line.chars().map(|c| c.len_utf16()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_round_trip() {
        let line = "hello";
        assert_eq!(utf16_col_to_byte(line, 0), 0);
        assert_eq!(utf16_col_to_byte(line, 3), 3);
        assert_eq!(utf16_col_to_byte(line, 5), 5);
        assert_eq!(byte_to_utf16_col(line, 3), 3);
    }

    #[test]
    fn test_emoji() {
        // 🎉 is 4 bytes in UTF-8, 2 UTF-16 code units
        let line = "a🎉b";
        assert_eq!(utf16_col_to_byte(line, 1), 1);
        assert_eq!(utf16_col_to_byte(line, 3), 5);
        assert_eq!(byte_to_utf16_col(line, 5), 3);
        assert_eq!(utf16_len(line), 4);
    }

    #[test]
    fn test_past_end_clamps() {
        let line = "ab";
        assert_eq!(utf16_col_to_byte(line, 10), 2);
        assert_eq!(byte_to_utf16_col(line, 10), 2);
    }
}
