//
// buffer.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::cmp::Ordering;

use ropey::Rope;
use tower_lsp::lsp_types::Position;
use tower_lsp::lsp_types::Range;
use tower_lsp::lsp_types::TextDocumentContentChangeEvent;

use crate::error::Error;

/// The authoritative text of one document.
///
/// Offsets are byte offsets; positions are (line, UTF-16 code unit) pairs as
/// on the wire. The buffer is immutable between edit batches and a batch
/// bumps the version atomically, so a version uniquely identifies a snapshot.
pub struct TextBuffer {
    contents: Rope,
    version: i32,
}

impl TextBuffer {
    pub fn new(text: &str, version: i32) -> Self {
        Self {
            contents: Rope::from_str(text),
            version,
        }
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn len_bytes(&self) -> usize {
        self.contents.len_bytes()
    }

    /// Apply an edit batch. Changes are applied latest-position first so that
    /// the ranges of the remaining changes stay valid while the batch is in
    /// progress; the version is bumped once for the whole batch.
    pub fn apply(
        &mut self,
        changes: &[TextDocumentContentChangeEvent],
        new_version: i32,
    ) -> crate::Result<()> {
        if new_version <= self.version {
            return Err(Error::StaleEdit {
                current: self.version,
                proposed: new_version,
            });
        }

        let mut ordered: Vec<&TextDocumentContentChangeEvent> = changes.iter().collect();
        ordered.sort_by(|lhs, rhs| match (lhs.range, rhs.range) {
            (Some(lhs), Some(rhs)) => compare_positions(rhs.start, lhs.start),
            // Full-document replacements swallow everything before them
            _ => Ordering::Equal,
        });

        for change in ordered {
            match change.range {
                Some(range) => {
                    let start = self.contents.byte_to_char(self.offset_at(range.start));
                    let end = self.contents.byte_to_char(self.offset_at(range.end));
                    self.contents.remove(start..end);
                    self.contents.insert(start, &change.text);
                },
                None => {
                    self.contents = Rope::from_str(&change.text);
                },
            }
        }

        self.version = new_version;
        Ok(())
    }

    /// Byte offset of a position. Out-of-range positions clamp to the end of
    /// the line or of the buffer, per LSP convention.
    pub fn offset_at(&self, position: Position) -> usize {
        let line = position.line as usize;
        if line >= self.contents.len_lines() {
            return self.contents.len_bytes();
        }

        let line_start = self.contents.line_to_byte(line);

        let mut units = 0;
        let mut bytes = 0;
        for ch in self.contents.line(line).chars() {
            if units >= position.character || ch == '\n' || ch == '\r' {
                break;
            }
            units += ch.len_utf16() as u32;
            bytes += ch.len_utf8();
        }

        line_start + bytes
    }

    /// Position of a byte offset. Offsets beyond the end of the buffer clamp;
    /// offsets inside a multi-byte character floor to its start.
    pub fn position_at(&self, offset: usize) -> Position {
        let offset = offset.min(self.contents.len_bytes());
        let offset = self.contents.char_to_byte(self.contents.byte_to_char(offset));

        let line = self.contents.byte_to_line(offset);
        let line_start = self.contents.line_to_byte(line);

        let character: usize = self
            .contents
            .byte_slice(line_start..offset)
            .chars()
            .map(char::len_utf16)
            .sum();

        Position::new(line as u32, character as u32)
    }

    pub fn end_position(&self) -> Position {
        self.position_at(self.contents.len_bytes())
    }

    pub fn whole_range(&self) -> Range {
        Range::new(Position::new(0, 0), self.end_position())
    }

    pub fn slice(&self, range: Range) -> String {
        let start = self.offset_at(range.start);
        let end = self.offset_at(range.end);
        self.substr(start, end.saturating_sub(start))
    }

    pub fn substr(&self, offset: usize, length: usize) -> String {
        let start = offset.min(self.contents.len_bytes());
        let end = (offset + length).min(self.contents.len_bytes());
        self.contents.byte_slice(start..end).to_string()
    }

    /// The suffix starting at `offset`, as owned text for the sentence
    /// scanner.
    pub fn text_from(&self, offset: usize) -> String {
        let offset = offset.min(self.contents.len_bytes());
        self.contents
            .byte_slice(offset..self.contents.len_bytes())
            .to_string()
    }

    pub fn text(&self) -> String {
        self.contents.to_string()
    }
}

impl std::fmt::Debug for TextBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextBuffer")
            .field("version", &self.version)
            .field("len_bytes", &self.contents.len_bytes())
            .finish()
    }
}

pub fn compare_positions(lhs: Position, rhs: Position) -> Ordering {
    (lhs.line, lhs.character).cmp(&(rhs.line, rhs.character))
}

/// Half-open range intersection. A pure insertion point only intersects a
/// range it falls strictly inside of, so edits that touch a sentence boundary
/// from the outside do not count as touching the sentence.
pub fn ranges_overlap(lhs: Range, rhs: Range) -> bool {
    compare_positions(lhs.start, rhs.end) == Ordering::Less
        && compare_positions(rhs.start, lhs.end) == Ordering::Less
}

pub fn range_contains(range: Range, position: Position) -> bool {
    compare_positions(range.start, position) != Ordering::Greater
        && compare_positions(position, range.end) == Ordering::Less
}

/// End position of `text` when inserted at `start`. Line endings `\r\n`,
/// `\r`, and `\n` each count as one break.
pub fn end_position_of(start: Position, text: &str) -> Position {
    let mut line = start.line;
    let mut character = start.character;

    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\n' => {
                line += 1;
                character = 0;
            },
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                line += 1;
                character = 0;
            },
            _ => {
                character += ch.len_utf16() as u32;
            },
        }
    }

    Position::new(line, character)
}

/// Positional displacement induced by replacing a range with new text.
/// Applies to positions at or after the replaced range's end.
#[derive(Debug, Clone, Copy)]
pub struct RangeDelta {
    old_end: Position,
    new_end: Position,
}

impl RangeDelta {
    pub fn new(range: Range, new_text: &str) -> Self {
        Self {
            old_end: range.end,
            new_end: end_position_of(range.start, new_text),
        }
    }

    pub fn shift_position(&self, position: Position) -> Position {
        if compare_positions(position, self.old_end) == Ordering::Less {
            return position;
        }

        if position.line == self.old_end.line {
            Position::new(
                self.new_end.line,
                self.new_end.character + (position.character - self.old_end.character),
            )
        } else {
            let line = position.line as i64 + self.new_end.line as i64 - self.old_end.line as i64;
            Position::new(line as u32, position.character)
        }
    }

    pub fn shift_range(&self, range: Range) -> Range {
        Range::new(self.shift_position(range.start), self.shift_position(range.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(range: Range, text: &str) -> TextDocumentContentChangeEvent {
        TextDocumentContentChangeEvent {
            range: Some(range),
            range_length: None,
            text: text.to_string(),
        }
    }

    fn range(sl: u32, sc: u32, el: u32, ec: u32) -> Range {
        Range::new(Position::new(sl, sc), Position::new(el, ec))
    }

    #[test]
    fn test_offset_position_round_trip() {
        let buffer = TextBuffer::new("intros.\nsimpl.\n", 0);

        assert_eq!(buffer.offset_at(Position::new(0, 0)), 0);
        assert_eq!(buffer.offset_at(Position::new(1, 0)), 8);
        assert_eq!(buffer.offset_at(Position::new(1, 6)), 14);
        assert_eq!(buffer.position_at(8), Position::new(1, 0));
        assert_eq!(buffer.position_at(14), Position::new(1, 6));

        // Past-the-end clamps
        assert_eq!(buffer.offset_at(Position::new(5, 0)), 15);
        assert_eq!(buffer.position_at(100), Position::new(2, 0));
    }

    #[test]
    fn test_positions_count_utf16_units() {
        // 'é' is 1 UTF-16 unit / 2 bytes, '𝔸' is 2 units / 4 bytes
        let buffer = TextBuffer::new("é𝔸x", 0);

        assert_eq!(buffer.offset_at(Position::new(0, 1)), 2);
        assert_eq!(buffer.offset_at(Position::new(0, 3)), 6);
        assert_eq!(buffer.position_at(6), Position::new(0, 3));
        assert_eq!(buffer.position_at(7), Position::new(0, 4));
    }

    #[test]
    fn test_carriage_return_line_endings() {
        let buffer = TextBuffer::new("a.\r\nb.\rc.\n", 0);

        assert_eq!(buffer.offset_at(Position::new(1, 0)), 4);
        assert_eq!(buffer.offset_at(Position::new(2, 0)), 7);
        assert_eq!(buffer.position_at(7), Position::new(2, 0));
    }

    #[test]
    fn test_apply_batch_in_reverse_document_order() {
        let mut buffer = TextBuffer::new("one two three", 0);

        // Given in document order; the buffer must reorder before applying
        let changes = vec![
            change(range(0, 0, 0, 3), "ONE"),
            change(range(0, 8, 0, 13), "THREE"),
        ];
        buffer.apply(&changes, 1).unwrap();

        assert_eq!(buffer.text(), "ONE two THREE");
        assert_eq!(buffer.version(), 1);
    }

    #[test]
    fn test_apply_rejects_stale_versions() {
        let mut buffer = TextBuffer::new("x", 3);

        let result = buffer.apply(&[change(range(0, 0, 0, 1), "y")], 3);
        assert!(matches!(
            result,
            Err(Error::StaleEdit {
                current: 3,
                proposed: 3
            })
        ));
        assert_eq!(buffer.text(), "x");
    }

    #[test]
    fn test_apply_full_document_replacement() {
        let mut buffer = TextBuffer::new("old text", 0);

        let full = TextDocumentContentChangeEvent {
            range: None,
            range_length: None,
            text: String::from("new text"),
        };
        buffer.apply(&[full], 1).unwrap();

        assert_eq!(buffer.text(), "new text");
    }

    #[test]
    fn test_range_delta_shifts_later_positions() {
        // Insert "(*x*)" at offset 2 of "A. B. C."
        let delta = RangeDelta::new(range(0, 2, 0, 2), "(*x*)");

        assert_eq!(
            delta.shift_range(range(0, 3, 0, 5)),
            range(0, 8, 0, 10)
        );
        assert_eq!(
            delta.shift_range(range(0, 6, 0, 8)),
            range(0, 11, 0, 13)
        );
    }

    #[test]
    fn test_range_delta_across_lines() {
        // Replace a one-line span with two lines
        let delta = RangeDelta::new(range(1, 2, 1, 4), "xx\nyyy");

        // Same line as the old end: column re-anchors to the new end
        assert_eq!(delta.shift_position(Position::new(1, 6)), Position::new(2, 5));
        // Later lines only shift by the line delta
        assert_eq!(delta.shift_position(Position::new(3, 1)), Position::new(4, 1));
    }

    #[test]
    fn test_ranges_overlap_is_half_open() {
        let sentence = range(0, 3, 0, 5);

        assert!(ranges_overlap(sentence, range(0, 4, 0, 6)));
        assert!(ranges_overlap(sentence, range(0, 3, 0, 5)));

        // Touching from the outside does not overlap
        assert!(!ranges_overlap(sentence, range(0, 5, 0, 7)));
        assert!(!ranges_overlap(sentence, range(0, 0, 0, 3)));

        // Insertion points only overlap strictly inside
        assert!(ranges_overlap(sentence, range(0, 4, 0, 4)));
        assert!(!ranges_overlap(sentence, range(0, 3, 0, 3)));
        assert!(!ranges_overlap(sentence, range(0, 5, 0, 5)));
    }
}
