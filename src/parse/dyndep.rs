//! Dyndep parser: dynamically-generated implicit edges.
//!
//! Grammar:
//! ```text
//! ninja_dyndep_version = 1[.x]
//! (build out [| impout…] : dyndep [| impin…] [restat = 1])*
//! ```
//! No explicit inputs/outputs are permitted on dyndep `build` records.

use std::collections::HashMap;

use crate::error::{GraphError, ParseError};
use crate::graph::{NodeId, State};
use crate::parse::lexer::Cursor;

/// Per-edge additions discovered from a dyndep file.
#[derive(Debug, Clone, Default)]
pub struct DyndepRecord {
    pub restat: bool,
    pub implicit_inputs: Vec<NodeId>,
    pub implicit_outputs: Vec<NodeId>,
}

/// The full contents of one dyndep file, keyed by the primary output path
/// (already resolved to a [`NodeId`] in `state`).
pub type DyndepFile = HashMap<NodeId, DyndepRecord>;

pub fn parse_dyndep(state: &mut State, filename: &str, content: &str) -> Result<DyndepFile, ParseError> {
    let mut c = Cursor::new(filename, content);
    let mut file = DyndepFile::new();

    c.skip_blank_and_comment_lines();
    c.skip_inline_ws();
    let key = c.read_ident().ok_or_else(|| c.error("expected 'ninja_dyndep_version'"))?;
    if key != "ninja_dyndep_version" {
        return Err(c.error("expected 'ninja_dyndep_version = 1' as the first statement"));
    }
    c.skip_inline_ws();
    if !c.eat_char('=') {
        return Err(c.error("expected '=' after ninja_dyndep_version"));
    }
    let version = c.read_value().evaluate(&[]);
    c.consume_newline()?;
    let version = version.trim();
    if version != "1" && !version.starts_with("1.") {
        return Err(c.error(format!("unsupported dyndep version '{version}'; expected 1 or 1.x")));
    }

    loop {
        c.skip_blank_and_comment_lines();
        if c.is_eof() {
            break;
        }
        let indent = c.count_and_skip_indent();
        if indent > 0 {
            return Err(c.error("unexpected indentation"));
        }
        let kw = c.read_ident().ok_or_else(|| c.error("expected 'build'"))?;
        if kw != "build" {
            return Err(c.error("expected 'build' record"));
        }
        parse_build_record(state, &mut c, &mut file)?;
    }

    Ok(file)
}

fn parse_build_record(state: &mut State, c: &mut Cursor<'_>, file: &mut DyndepFile) -> Result<(), ParseError> {
    let (out_word, had) = c.read_word(":|");
    if !had {
        return Err(c.error("expected output path"));
    }
    let out_path = out_word.evaluate(&[]);

    let mut implicit_outs = Vec::new();
    c.skip_inline_ws();
    if c.rest().starts_with('|') && !c.rest().starts_with("||") {
        c.eat_char('|');
        loop {
            c.skip_inline_ws();
            if c.rest().starts_with(':') {
                break;
            }
            let (w, had) = c.read_word(":|");
            if !had {
                break;
            }
            implicit_outs.push(w.evaluate(&[]));
        }
    }

    c.skip_inline_ws();
    if !c.eat_char(':') {
        return Err(c.error("expected ':'"));
    }
    c.skip_inline_ws();
    let marker = c.read_ident().ok_or_else(|| c.error("expected 'dyndep'"))?;
    if marker != "dyndep" {
        return Err(c.error("dyndep build records must name 'dyndep' as their rule"));
    }

    let mut implicit_ins = Vec::new();
    c.skip_inline_ws();
    if c.rest().starts_with('|') && !c.rest().starts_with("||") {
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
            implicit_ins.push(w.evaluate(&[]));
        }
    }
    c.consume_newline()?;

    let mut restat = false;
    loop {
        c.skip_blank_and_comment_lines();
        let indent = c.count_and_skip_indent();
        if indent == 0 {
            break;
        }
        let key = c.read_ident().ok_or_else(|| c.error("expected binding"))?;
        c.skip_inline_ws();
        if !c.eat_char('=') {
            return Err(c.error("expected '='"));
        }
        let value = c.read_value().evaluate(&[]);
        c.consume_newline()?;
        if key == "restat" {
            restat = value.trim() == "1";
        }
    }

    let out_id = state
        .lookup_node(&out_path)
        .ok_or_else(|| c.error(format!("dyndep record for unknown output '{out_path}'")))?;

    if state.node(out_id).in_edge.is_none() {
        return Err(c.error(format!("'{out_path}' has no producing edge to attach dyndep info to")));
    }

    let record = DyndepRecord {
        restat,
        implicit_inputs: implicit_ins.iter().map(|p| state.node_id(p)).collect(),
        implicit_outputs: implicit_outs.iter().map(|p| state.node_id(p)).collect(),
    };
    file.insert(out_id, record);
    Ok(())
}

/// Apply a loaded dyndep file's additions to the edge that produces each
/// named output. Returns an error if an output names
/// an edge that already has a different producer for one of the new
/// implicit outputs.
pub fn apply_dyndep(state: &mut State, file: &DyndepFile) -> Result<(), GraphError> {
    for (&out_id, record) in file.iter() {
        let edge_id = state.node(out_id).in_edge.unwrap();
        for &impout in &record.implicit_outputs {
            if let Some(existing) = state.node(impout).in_edge {
                if existing != edge_id {
                    return Err(GraphError::MultipleProducers { path: state.node(impout).path.clone() });
                }
            } else {
                state.node_mut(impout).in_edge = Some(edge_id);
            }
        }
        for &impin in &record.implicit_inputs {
            state.node_mut(impin).out_edges.push(edge_id);
        }
        let edge = state.edge_mut(edge_id);
        // Splice the new implicit inputs in just before the order-only
        // tail so `explicit_inputs`/`dirtying_inputs`/`order_only_inputs`
        // keep slicing `inputs` correctly.
        let splice_at = edge.inputs.len() - edge.order_only_deps_count;
        for (i, &impin) in record.implicit_inputs.iter().enumerate() {
            edge.inputs.insert(splice_at + i, impin);
        }
        edge.implicit_deps_count += record.implicit_inputs.len();
        edge.discovered_ins = record.implicit_inputs.clone();
        edge.outputs.extend(record.implicit_outputs.iter().copied());
        edge.implicit_outs_count += record.implicit_outputs.len();
        if record.restat {
            edge.restat = true;
        }
        state.node_mut(out_id).dyndep_pending = false;
    }
    Ok(())
}
