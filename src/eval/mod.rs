//! Evaluated strings and the lexically scoped binding environment.
//!
//! An [`EvalString`] is a tokenized template: raw text interleaved with
//! `$var` references. It is parsed once out of manifest source and
//! evaluated many times (once per edge, against that edge's scope), so the
//! token list is kept as owned small enums rather than re-scanning the
//! original text on every evaluation.

use std::collections::HashMap;

/// One piece of an [`EvalString`]: literal text or a variable reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalPart {
    Literal(String),
    Var(String),
}

/// A parsed template of literal text and variable references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvalString {
    parts: Vec<EvalPart>,
}

impl EvalString {
    pub fn new() -> Self {
        Self { parts: Vec::new() }
    }

    pub fn from_parts(parts: Vec<EvalPart>) -> Self {
        Self { parts }
    }

    pub fn push_literal(&mut self, s: impl Into<String>) {
        let s = s.into();
        if s.is_empty() {
            return;
        }
        if let Some(EvalPart::Literal(last)) = self.parts.last_mut() {
            last.push_str(&s);
        } else {
            self.parts.push(EvalPart::Literal(s));
        }
    }

    pub fn push_var(&mut self, name: impl Into<String>) {
        self.parts.push(EvalPart::Var(name.into()));
    }

    pub fn parts(&self) -> &[EvalPart] {
        &self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Raw literal text, when the whole string has no variable references.
    /// Used for fast-path comparisons (e.g. `deps = gcc`).
    pub fn as_literal(&self) -> Option<&str> {
        match self.parts.as_slice() {
            [] => Some(""),
            [EvalPart::Literal(s)] => Some(s),
            _ => None,
        }
    }

    /// Parse manifest-language evaluation syntax: `$var`, `${var}`, `$$` ->
    /// `$`, `$ ` -> ` `, `$:` -> `:`, and `$\n` followed by leading
    /// whitespace on the next line (line continuation) is elided entirely.
    /// `stop_chars` are characters that end parsing, unescaped (e.g. `:` and
    /// `|` inside a `build` statement's path list); they are returned
    /// literally if escaped with `$`.
    pub fn parse(input: &str, stop_chars: &str) -> (Self, usize) {
        let mut out = Self::new();
        let bytes = input.as_bytes();
        let mut i = 0usize;
        while i < bytes.len() {
            let c = bytes[i] as char;
            if c == '\n' || (stop_chars.contains(c) && c != '$') {
                break;
            }
            if c == '$' && i + 1 < bytes.len() {
                let next = bytes[i + 1] as char;
                match next {
                    '$' => {
                        out.push_literal("$");
                        i += 2;
                    }
                    ' ' => {
                        out.push_literal(" ");
                        i += 2;
                    }
                    ':' => {
                        out.push_literal(":");
                        i += 2;
                    }
                    '\n' => {
                        // Line continuation: skip the newline and any
                        // leading indentation on the following line.
                        i += 2;
                        while i < bytes.len() && (bytes[i] == b' ' || bytes[i] == b'\t') {
                            i += 1;
                        }
                    }
                    '{' => {
                        let start = i + 2;
                        let mut j = start;
                        while j < bytes.len() && bytes[j] != b'}' {
                            j += 1;
                        }
                        out.push_var(&input[start..j]);
                        i = if j < bytes.len() { j + 1 } else { j };
                    }
                    _ if next.is_ascii_alphanumeric() || next == '_' => {
                        let start = i + 1;
                        let mut j = start;
                        while j < bytes.len() {
                            let cc = bytes[j] as char;
                            if cc.is_ascii_alphanumeric() || cc == '_' {
                                j += 1;
                            } else {
                                break;
                            }
                        }
                        out.push_var(&input[start..j]);
                        i = j;
                    }
                    _ => {
                        // Bare `$` before something unrecognized: keep literally.
                        out.push_literal("$");
                        i += 1;
                    }
                }
            } else {
                let start = i;
                let mut j = i;
                while j < bytes.len() {
                    let cc = bytes[j] as char;
                    if cc == '$' || cc == '\n' || (stop_chars.contains(cc)) {
                        break;
                    }
                    j += 1;
                }
                out.push_literal(&input[start..j]);
                i = j;
            }
        }
        (out, i)
    }

    /// Render this template back to manifest-syntax source, normalizing all
    /// variable references to `${var}` form.
    pub fn unparse(&self) -> String {
        let mut s = String::new();
        for part in &self.parts {
            match part {
                EvalPart::Literal(lit) => {
                    for c in lit.chars() {
                        match c {
                            '$' => s.push_str("$$"),
                            ':' => s.push_str("$:"),
                            ' ' => s.push_str("$ "),
                            _ => s.push(c),
                        }
                    }
                }
                EvalPart::Var(name) => {
                    s.push_str("${");
                    s.push_str(name);
                    s.push('}');
                }
            }
        }
        s
    }

    /// Evaluate this template against an explicit environment stack
    /// (innermost scope first) rather than store parent pointers.
    pub fn evaluate(&self, scopes: &[&BindingEnv]) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                EvalPart::Literal(lit) => out.push_str(lit),
                EvalPart::Var(name) => {
                    if let Some(val) = lookup(scopes, name) {
                        out.push_str(&val);
                    }
                }
            }
        }
        out
    }
}

/// Look up `name` in the scope stack, innermost first, falling back to
/// each scope's own evaluation of its bindings (which may themselves
/// reference outer scopes).
fn lookup(scopes: &[&BindingEnv], name: &str) -> Option<String> {
    for (i, scope) in scopes.iter().enumerate() {
        if let Some(val) = scope.bindings.get(name) {
            return Some(val.evaluate(&scopes[i..]));
        }
    }
    None
}

/// A lexically scoped binding environment. The scope chain is
/// modeled as a slice passed explicitly at evaluation time rather than a
/// parent pointer stored on the struct, to avoid cyclic references between
/// edges and the files that enclose them.
#[derive(Debug, Clone, Default)]
pub struct BindingEnv {
    bindings: HashMap<String, EvalString>,
}

impl BindingEnv {
    pub fn new() -> Self {
        Self { bindings: HashMap::new() }
    }

    pub fn set(&mut self, key: impl Into<String>, value: EvalString) {
        self.bindings.insert(key.into(), value);
    }

    pub fn get_raw(&self, key: &str) -> Option<&EvalString> {
        self.bindings.get(key)
    }

    /// Evaluate `key` against this scope plus any outer scopes supplied.
    pub fn lookup(&self, key: &str, outer: &[&BindingEnv]) -> Option<String> {
        let mut scopes: Vec<&BindingEnv> = Vec::with_capacity(outer.len() + 1);
        scopes.push(self);
        scopes.extend_from_slice(outer);
        lookup(&scopes, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_var() {
        let (s, consumed) = EvalString::parse("cat $in > $out", "");
        assert_eq!(consumed, "cat $in > $out".len());
        let mut env = BindingEnv::new();
        env.set("in", EvalString::parse("a.c b.c", "").0);
        env.set("out", EvalString::parse("out.o", "").0);
        assert_eq!(s.evaluate(&[&env]), "cat a.c b.c > out.o");
    }

    #[test]
    fn brace_form() {
        let (s, _) = EvalString::parse("${out}.tmp", "");
        let mut env = BindingEnv::new();
        env.set("out", EvalString::parse("foo", "").0);
        assert_eq!(s.evaluate(&[&env]), "foo.tmp");
    }

    #[test]
    fn dollar_escapes() {
        let (s, _) = EvalString::parse("$$HOME$ $:literal", "");
        assert_eq!(s.evaluate(&[]), "$HOME :literal");
    }

    #[test]
    fn line_continuation_elided() {
        let (s, _) = EvalString::parse("a $\n   b", "");
        assert_eq!(s.evaluate(&[]), "ab");
    }

    #[test]
    fn unparse_roundtrip_normalizes_braces() {
        let (s, _) = EvalString::parse("$out.o", "");
        assert_eq!(s.unparse(), "${out}.o");
        let (s2, _) = EvalString::parse(&s.unparse(), "");
        assert_eq!(s2, s);
    }

    #[test]
    fn nested_scope_lookup() {
        let mut root = BindingEnv::new();
        root.set("cflags", EvalString::parse("-O2", "").0);
        let mut child = BindingEnv::new();
        child.set("command", EvalString::parse("cc $cflags -c a.c", "").0);
        let cmd = child.get_raw("command").unwrap();
        assert_eq!(cmd.evaluate(&[&child, &root]), "cc -O2 -c a.c");
    }
}
