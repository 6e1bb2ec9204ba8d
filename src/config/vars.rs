//! Variable expansion: `%{NAME}` references in string fields.
//!
//! Lookup is a flat three-level scope: command vars, then group vars, then
//! global vars. The system environment is never consulted here; the only
//! door for it is the explicit `env_import` mechanism, whose values land
//! in the vars maps before expansion runs.
//!
//! Cycles are caught by bounded iteration: a string that still contains
//! references after the pass cap is treated as cyclic.

use crate::errors::{RunnerError, VariableError};
use indexmap::IndexMap;

/// Maximum number of expansion passes over one string.
pub const MAX_EXPANSION_PASSES: usize = 15;

/// The three-level lookup used while expanding one command's fields.
/// Group- and global-only contexts pass empty maps for the inner levels.
#[derive(Debug, Clone, Copy)]
pub struct VarScope<'a> {
    pub command: &'a IndexMap<String, String>,
    pub group: &'a IndexMap<String, String>,
    pub global: &'a IndexMap<String, String>,
}

impl<'a> VarScope<'a> {
    fn lookup(&self, name: &str) -> Option<&'a str> {
        self.command
            .get(name)
            .or_else(|| self.group.get(name))
            .or_else(|| self.global.get(name))
            .map(String::as_str)
    }
}

/// Expand every `%{NAME}` in `input`. `field` names the config field for
/// error messages (e.g. `build.compile.args[2]`).
pub fn expand(input: &str, scope: &VarScope<'_>, field: &str) -> Result<String, RunnerError> {
    let mut current = input.to_string();
    for _ in 0..MAX_EXPANSION_PASSES {
        let (next, changed) = expand_pass(&current, scope, field)?;
        if !changed {
            return Ok(next);
        }
        current = next;
    }
    // Still rewriting after the cap: a reference chain that feeds itself.
    Err(VariableError::Cycle {
        field: field.to_string(),
        limit: MAX_EXPANSION_PASSES,
    }
    .into())
}

/// One pass: substitute each `%{NAME}` with its value. Returns whether any
/// substitution happened.
fn expand_pass(
    input: &str,
    scope: &VarScope<'_>,
    field: &str,
) -> Result<(String, bool), RunnerError> {
    let mut out = String::with_capacity(input.len());
    let mut changed = false;
    let mut rest = input;

    while let Some(start) = rest.find("%{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated reference: keep as written.
            out.push_str(&rest[start..]);
            return Ok((out, changed));
        };
        let name = &after[..end];
        let value = scope.lookup(name).ok_or_else(|| VariableError::Undefined {
            name: name.to_string(),
            field: field.to_string(),
        })?;
        out.push_str(value);
        changed = true;
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok((out, changed))
}

/// Expand a whole vars map, value by value in declaration order. Entries
/// may reference siblings at the same level (resolved through iterative
/// passes) and anything in the outer levels; same-level names shadow
/// outer ones. Mutual references within a level hit the pass cap and
/// surface as a cycle.
pub fn expand_map(
    map: &IndexMap<String, String>,
    outer: &IndexMap<String, String>,
    outermost: &IndexMap<String, String>,
    context: &str,
) -> Result<IndexMap<String, String>, RunnerError> {
    let mut expanded: IndexMap<String, String> = IndexMap::with_capacity(map.len());
    for (name, raw) in map {
        let scope = VarScope {
            command: map,
            group: outer,
            global: outermost,
        };
        let field = format!("{context}.vars.{name}");
        expanded.insert(name.clone(), expand(raw, &scope, &field)?);
    }
    Ok(expanded)
}
