//! Manifest parser: turns `build.ninja`-shaped source into edits on a
//! shared `graph::State`.
//!
//! Grammar:
//! ```text
//! file      := (stmt NEWLINE)*
//! stmt      := 'rule' IDENT INDENT bindings
//!            | 'pool' IDENT INDENT { 'depth' '=' int }
//!            | 'build' path+ [ '|' path+ ] ':' IDENT path* [ '|' path+ ] [ '||' path+ ]  INDENT bindings?
//!            | 'default' path+
//!            | 'include' path
//!            | 'subninja' path
//!            | IDENT '=' value
//! ```

use crate::error::{GraphError, NinjaError, ParseError};
use crate::eval::{BindingEnv, EvalString};
use crate::graph::State;
use crate::parse::lexer::Cursor;

/// Reads manifest/include/subninja file contents by path.
pub trait FileReader {
    fn read(&self, path: &str) -> std::io::Result<String>;
}

/// A `FileReader` backed by the real filesystem, relative to a base
/// directory.
pub struct RealFileReader {
    pub base_dir: std::path::PathBuf,
}

impl FileReader for RealFileReader {
    fn read(&self, path: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.base_dir.join(path))
    }
}

/// Parse `filename`'s contents into `state`. `reader` is consulted for
/// `include`/`subninja` targets.
pub fn parse_manifest(state: &mut State, filename: &str, content: &str, reader: &dyn FileReader) -> Result<(), NinjaError> {
    let mut p = Parser { state, reader, depth: 0 };
    p.parse_file(filename, content)
}

struct Parser<'s> {
    state: &'s mut State,
    reader: &'s dyn FileReader,
    depth: u32,
}

impl<'s> Parser<'s> {
    fn parse_file(&mut self, filename: &str, content: &str) -> Result<(), NinjaError> {
        if self.depth > 64 {
            return Err(ParseError::new(filename, 0, 0, "include/subninja nesting too deep", "").into());
        }
        let mut c = Cursor::new(filename, content);
        loop {
            c.skip_blank_and_comment_lines();
            if c.is_eof() {
                break;
            }
            let indent = c.count_and_skip_indent();
            if indent > 0 {
                return Err(c.error("unexpected indentation").into());
            }
            self.parse_statement(&mut c)?;
        }
        Ok(())
    }

    fn parse_statement(&mut self, c: &mut Cursor) -> Result<(), NinjaError> {
        let kw = c.read_ident().ok_or_else(|| c.error("expected statement"))?.to_string();
        match kw.as_str() {
            "rule" => self.parse_rule(c),
            "pool" => self.parse_pool(c),
            "build" => self.parse_build(c),
            "default" => self.parse_default(c),
            "include" => self.parse_include(c),
            "subninja" => self.parse_subninja(c),
            _ => self.parse_top_level_assignment(c, kw),
        }
    }

    fn parse_rule(&mut self, c: &mut Cursor) -> Result<(), NinjaError> {
        c.skip_inline_ws();
        let name = c.read_ident().ok_or_else(|| c.error("expected rule name"))?.to_string();
        c.consume_newline().map_err(NinjaError::from)?;
        if self.state.rules.contains_key(&name) {
            return Err(GraphError::DuplicateRule { name }.into());
        }
        let mut rule = crate::graph::Rule::new(name.clone());
        self.parse_indented_bindings(c, &mut rule.bindings)?;
        if rule.bindings.get_raw("command").is_none() && name != "phony" {
            return Err(GraphError::MissingCommand { name }.into());
        }
        self.state.rules.insert(name, rule);
        Ok(())
    }

    fn parse_pool(&mut self, c: &mut Cursor) -> Result<(), NinjaError> {
        c.skip_inline_ws();
        let name = c.read_ident().ok_or_else(|| c.error("expected pool name"))?.to_string();
        c.consume_newline().map_err(NinjaError::from)?;
        let mut bindings = BindingEnv::new();
        self.parse_indented_bindings(c, &mut bindings)?;
        let depth_str = bindings.get_raw("depth").map(|e| e.evaluate(&[])).unwrap_or_default();
        let depth: usize = depth_str.trim().parse().map_err(|_| c.error("pool 'depth' must be an integer"))?;
        self.state.pools.insert(name.clone(), crate::graph::Pool::new(name, depth));
        Ok(())
    }

    fn parse_build(&mut self, c: &mut Cursor) -> Result<(), NinjaError> {
        let mut explicit_outs = Vec::new();
        loop {
            let (w, had) = c.read_word(":|");
            if !had {
                break;
            }
            explicit_outs.push(w);
            c.skip_inline_ws();
            if c.peek() == Some('|') && !c.rest().starts_with("||") {
                break;
            }
            if c.rest().starts_with('|') || c.rest().starts_with(':') {
                break;
            }
        }
        if explicit_outs.is_empty() {
            return Err(c.error("expected at least one output path").into());
        }

        let mut implicit_outs = Vec::new();
        if c.rest().starts_with('|') && !c.rest().starts_with("||") {
            c.eat_char('|');
            loop {
                let (w, had) = c.read_word(":|");
                if !had {
                    break;
                }
                implicit_outs.push(w);
                c.skip_inline_ws();
                if c.rest().starts_with('|') || c.rest().starts_with(':') {
                    break;
                }
            }
        }

        c.skip_inline_ws();
        if !c.eat_char(':') {
            return Err(c.error("expected ':' after build outputs").into());
        }
        c.skip_inline_ws();
        let rule_name = c.read_ident().ok_or_else(|| c.error("expected rule name"))?.to_string();
        if !self.state.rules.contains_key(&rule_name) {
            return Err(GraphError::UnknownRule { name: rule_name }.into());
        }

        let mut explicit_ins = Vec::new();
        loop {
            c.skip_inline_ws();
            if c.rest().starts_with('|') || c.rest().starts_with('\n') || c.is_eof() {
                break;
            }
            let (w, had) = c.read_word("|");
            if !had {
                break;
            }
            explicit_ins.push(w);
        }

        let mut implicit_ins = Vec::new();
        if c.rest().starts_with('|') && !c.rest().starts_with("||") {
            c.eat_char('|');
            loop {
                c.skip_inline_ws();
                if c.rest().starts_with("||") || c.rest().starts_with('\n') || c.is_eof() {
                    break;
                }
                let (w, had) = c.read_word("|");
                if !had {
                    break;
                }
                implicit_ins.push(w);
            }
        }

        let mut order_only_ins = Vec::new();
        if c.rest().starts_with("||") {
            c.eat_char('|');
            c.eat_char('|');
            loop {
                c.skip_inline_ws();
                if c.rest().starts_with('\n') || c.is_eof() {
                    break;
                }
                let (w, had) = c.read_word("");
                if !had {
                    break;
                }
                order_only_ins.push(w);
            }
        }

        c.consume_newline().map_err(NinjaError::from)?;

        let mut env = BindingEnv::new();
        self.parse_indented_bindings(c, &mut env)?;

        let implicit_deps_count = implicit_ins.len();
        let order_only_deps_count = order_only_ins.len();
        let implicit_outs_count = implicit_outs.len();

        let pool = env
            .get_raw("pool")
            .map(|e| e.evaluate(&[&env]))
            .unwrap_or_default();

        let resolve = |state: &mut State, list: Vec<EvalString>| -> Vec<crate::graph::NodeId> {
            list.into_iter().map(|e| state.node_id(&e.evaluate(&[&state.root_env]))).collect()
        };

        let mut inputs: Vec<crate::graph::NodeId> = Vec::new();
        inputs.extend(resolve(&mut *self.state, explicit_ins));
        inputs.extend(resolve(&mut *self.state, implicit_ins));
        inputs.extend(resolve(&mut *self.state, order_only_ins));

        let mut outputs: Vec<crate::graph::NodeId> = Vec::new();
        outputs.extend(resolve(&mut *self.state, explicit_outs));
        outputs.extend(resolve(&mut *self.state, implicit_outs));

        if env.get_raw("depfile").is_some() && outputs.len() - implicit_outs_count != 1 {
            return Err(GraphError::DepfileMultipleOutputs { rule: rule_name }.into());
        }

        let edge_id = self.state.add_edge(
            rule_name,
            env,
            inputs,
            outputs,
            implicit_deps_count,
            order_only_deps_count,
            implicit_outs_count,
            pool,
        )?;

        let restat = self.state.lookup_edge_var(self.state.edge(edge_id), "restat").as_deref() == Some("1");
        if restat {
            self.state.edge_mut(edge_id).restat = true;
        }

        // Resolve `dyndep = path` into a NodeId eagerly, since it names a
        // file rather than a boolean.
        let dyndep_path = {
            let edge = self.state.edge(edge_id);
            edge.env.get_raw("dyndep").map(|e| e.evaluate(&[&edge.env, &self.state.root_env]))
        };
        if let Some(path) = dyndep_path {
            let node = self.state.node_id(&path);
            self.state.node_mut(node).dyndep_pending = true;
            self.state.edge_mut(edge_id).dyndep = Some(node);
        }

        Ok(())
    }

    fn parse_default(&mut self, c: &mut Cursor) -> Result<(), NinjaError> {
        let mut any = false;
        loop {
            c.skip_inline_ws();
            if c.rest().starts_with('\n') || c.is_eof() {
                break;
            }
            let (w, had) = c.read_word("");
            if !had {
                break;
            }
            any = true;
            let path = w.evaluate(&[&self.state.root_env]);
            let id = self.state.node_id(&path);
            self.state.defaults.push(id);
        }
        if !any {
            return Err(c.error("expected at least one default target").into());
        }
        c.consume_newline().map_err(NinjaError::from)?;
        Ok(())
    }

    fn parse_include(&mut self, c: &mut Cursor) -> Result<(), NinjaError> {
        c.skip_inline_ws();
        let (w, _) = c.read_word("");
        c.consume_newline().map_err(NinjaError::from)?;
        let path = w.evaluate(&[&self.state.root_env]);
        let content = self.reader.read(&path).map_err(|_| c.error(format!("loading '{path}': file not found")))?;
        self.depth += 1;
        let res = self.parse_file(&path, &content);
        self.depth -= 1;
        res
    }

    fn parse_subninja(&mut self, c: &mut Cursor) -> Result<(), NinjaError> {
        c.skip_inline_ws();
        let (w, _) = c.read_word("");
        c.consume_newline().map_err(NinjaError::from)?;
        let path = w.evaluate(&[&self.state.root_env]);
        let content = self.reader.read(&path).map_err(|_| c.error(format!("loading '{path}': file not found")))?;
        // A subninja gets a child scope: top-level variable assignments it
        // makes do not leak back into the parent. Rules/pools/edges it
        // defines remain global. See DESIGN.md for the scoping rationale.
        let saved_root = self.state.root_env.clone();
        self.depth += 1;
        let res = self.parse_file(&path, &content);
        self.depth -= 1;
        self.state.root_env = saved_root;
        res
    }

    fn parse_top_level_assignment(&mut self, c: &mut Cursor, key: String) -> Result<(), NinjaError> {
        c.skip_inline_ws();
        if !c.eat_char('=') {
            return Err(c.error("expected '=' or a statement keyword").into());
        }
        let value = c.read_value();
        c.consume_newline().map_err(NinjaError::from)?;
        self.state.root_env.set(key, value);
        Ok(())
    }

    /// Parse `key = value` bindings on consecutive indented lines, stopping
    /// at the first line with zero indentation (or EOF).
    fn parse_indented_bindings(&mut self, c: &mut Cursor, into: &mut BindingEnv) -> Result<(), NinjaError> {
        loop {
            c.skip_blank_and_comment_lines();
            if c.is_eof() {
                return Ok(());
            }
            let save_pos = c.pos();
            let indent = c.count_and_skip_indent();
            if indent == 0 {
                // Not part of this block; caller's main loop re-measures it,
                // so just stop here without consuming.
                let _ = save_pos;
                return Ok(());
            }
            let key = c.read_ident().ok_or_else(|| c.error("expected binding name"))?.to_string();
            c.skip_inline_ws();
            if !c.eat_char('=') {
                return Err(c.error("expected '=' in binding").into());
            }
            let value = c.read_value();
            c.consume_newline().map_err(NinjaError::from)?;
            into.set(key, value);
        }
    }
}
