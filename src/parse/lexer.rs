//! Shared low-level cursor used by the manifest, depfile, and dyndep
//! parsers.
//!
//! The manifest grammar is indent-sensitive and line-continuation-aware in
//! the same irregular way a shell grammar is, so this is a hand-rolled
//! cursor over the raw byte/char stream rather than a combinator grammar.

use crate::error::ParseError;
use crate::eval::EvalString;

/// A cursor over manifest-like source text, tracking line/column for error
/// messages.
pub struct Cursor<'a> {
    pub filename: String,
    input: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(filename: impl Into<String>, input: &'a str) -> Self {
        Self { filename: filename.into(), input, pos: 0, line: 1 }
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    pub fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn current_line_text(&self) -> &'a str {
        let start = self.input[..self.pos].rfind('\n').map(|i| i + 1).unwrap_or(0);
        let end = self.input[self.pos..].find('\n').map(|i| self.pos + i).unwrap_or(self.input.len());
        &self.input[start..end]
    }

    fn col(&self) -> usize {
        let start = self.input[..self.pos].rfind('\n').map(|i| i + 1).unwrap_or(0);
        self.pos - start
    }

    pub fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(&self.filename, self.line, self.col(), message, self.current_line_text())
    }

    /// Advance past `n` bytes of the *current* line (no embedded newlines).
    fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    /// Count and consume leading spaces/tabs (indentation), not newlines.
    pub fn count_and_skip_indent(&mut self) -> usize {
        let rest = self.rest();
        let n = rest.bytes().take_while(|&b| b == b' ' || b == b'\t').count();
        self.advance(n);
        n
    }

    /// Skip spaces/tabs only (mid-line horizontal whitespace).
    pub fn skip_inline_ws(&mut self) {
        let rest = self.rest();
        let n = rest.bytes().take_while(|&b| b == b' ' || b == b'\t').count();
        self.advance(n);
    }

    /// Skip blank lines and `#`-comment lines entirely.
    pub fn skip_blank_and_comment_lines(&mut self) {
        loop {
            let save = (self.pos, self.line);
            self.count_and_skip_indent();
            let rest = self.rest();
            if rest.starts_with('#') {
                self.skip_to_eol();
                self.consume_newline();
                continue;
            }
            if rest.starts_with('\n') {
                self.consume_newline();
                continue;
            }
            if rest.is_empty() {
                return;
            }
            // Not blank: rewind the indent we ate so the caller can measure it.
            self.pos = save.0;
            self.line = save.1;
            return;
        }
    }

    fn skip_to_eol(&mut self) {
        let rest = self.rest();
        let n = rest.find('\n').unwrap_or(rest.len());
        self.advance(n);
    }

    /// Consume a single `\n`, if present, updating line tracking. A bare
    /// `\r` anywhere is a lexing error.
    pub fn consume_newline(&mut self) -> Result<(), ParseError> {
        if self.rest().starts_with('\r') {
            return Err(self.error("carriage return is not allowed; manifests must use bare LF line endings"));
        }
        if self.rest().starts_with('\n') {
            self.advance(1);
            self.line += 1;
        }
        Ok(())
    }

    /// Read a bare identifier: letters, digits, `_`, `-`, `.`.
    pub fn read_ident(&mut self) -> Option<&'a str> {
        let rest = self.rest();
        let n = rest
            .char_indices()
            .take_while(|&(_, c)| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
            .count();
        if n == 0 {
            return None;
        }
        let s = &rest[..n];
        self.advance(n);
        Some(s)
    }

    /// Read one whitespace-delimited "word" as an [`EvalString`], honoring
    /// `$`-escapes of space/`:`/`|` and line continuation, stopping at an
    /// unescaped space/tab/newline/EOF or any of `extra_stop_chars`.
    pub fn read_word(&mut self, extra_stop_chars: &str) -> (EvalString, bool) {
        self.skip_inline_ws();
        let mut stop = String::from(" \t");
        stop.push_str(extra_stop_chars);
        let rest = self.rest();
        if rest.starts_with('\r') {
            return (EvalString::new(), false);
        }
        let (s, consumed) = EvalString::parse(rest, &stop);
        let had_content = consumed > 0;
        // Track embedded newlines consumed by line continuations.
        self.line += rest[..consumed].matches('\n').count();
        self.advance(consumed);
        (s, had_content)
    }

    /// Read the remainder of the line as a value, honoring line continuation.
    pub fn read_value(&mut self) -> EvalString {
        self.skip_inline_ws();
        let rest = self.rest();
        let (s, consumed) = EvalString::parse(rest, "");
        self.line += rest[..consumed].matches('\n').count();
        self.advance(consumed);
        s
    }

    pub fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    pub fn eat_char(&mut self, c: char) -> bool {
        if self.rest().starts_with(c) {
            self.advance(c.len_utf8());
            true
        } else {
            false
        }
    }
}
