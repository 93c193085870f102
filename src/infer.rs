//! Suffix-rule matching: deriving `base.o` from `base.c` through a `.c.o`
//! inference rule, chaining through intermediate sources when needed.

use tracing::debug;

use crate::error::Error;
use crate::path::Path;
use crate::scope::{FileRef, ScopeId, ScopeTree};
use crate::types::{Dependency, File, InferenceId, Stamp};

/// Bound on chained inference lookups (`.y.c` feeding `.c.o` and so on).
pub const MAX_INFERENCE_DEPTH: usize = 16;

/// Find an inference rule able to produce `name` in `scope`.
///
/// Rules are tried newest first, in the scope and then in each ancestor.
/// A rule applies when its target suffix matches and its source file is
/// known, exists under `dir`, or can itself be inferred. Sources found on
/// the way are added to the scope's file table.
///
/// # Errors
///
/// Returns `Error::InferenceLoop` when the chain exceeds
/// [`MAX_INFERENCE_DEPTH`].
pub fn find_inference(
    tree: &mut ScopeTree,
    scope: ScopeId,
    dir: &Path,
    name: &str,
    depth: usize,
) -> Result<Option<InferenceId>, Error> {
    if depth > MAX_INFERENCE_DEPTH {
        return Err(Error::InferenceLoop {
            name: name.to_string(),
            scope: tree.display_path(scope),
        });
    }

    let (base, ext) = split_extension(name);

    for owner in tree.lineage(scope) {
        let candidates: Vec<InferenceId> = match tree.directory(owner) {
            Ok(d) => d.inferences.iter().rev().copied().collect(),
            Err(_) => continue,
        };
        for id in candidates {
            if tree.inference(id).to != ext {
                continue;
            }
            let source = format!("{base}{}", tree.inference(id).from);
            let found = tree.find_file(scope, &source).is_some() || try_find(tree, scope, dir, &source, depth.saturating_add(1))?.is_some();
            if found {
                debug!(name, source, "inferred");
                return Ok(Some(id));
            }
        }
    }
    return Ok(None);
}

/// Add `name` to the file table if it exists on disk or can be inferred.
///
/// # Errors
///
/// See [`find_inference`].
pub fn try_find(tree: &mut ScopeTree, scope: ScopeId, dir: &Path, name: &str, depth: usize) -> Result<Option<FileRef>, Error> {
    let stamp = tree.stamp(scope, dir, name);
    if stamp.exists() {
        let at = tree.add_file(scope, File::new(name, None, stamp))?;
        return Ok(Some(at));
    }
    let Some(id) = find_inference(tree, scope, dir, name, depth)? else {
        return Ok(None);
    };
    let at = instantiate(tree, scope, id, name)?;
    return Ok(Some(at));
}

/// New, not-yet-built file produced by an inference rule.
///
/// # Errors
///
/// Returns `Error::InvalidScopeType` if `scope` is foreign.
pub fn instantiate(tree: &mut ScopeTree, scope: ScopeId, id: InferenceId, name: &str) -> Result<FileRef, Error> {
    let inference = tree.inference(id);
    let mut file = File::new(name, Some(inference.rule), Stamp::MISSING);
    file.deps.push(Dependency::new(Path::parse(&source_name(name, &inference.from))));
    file.inference = Some(id);
    return tree.add_file(scope, file);
}

/// Give an existing recipe-less file the recipe of an inference rule,
/// with the source prepended to its dependencies.
///
/// # Errors
///
/// Returns `Error::InvalidScopeType` if the file's scope is foreign.
pub fn attach(tree: &mut ScopeTree, at: FileRef, id: InferenceId) -> Result<(), Error> {
    let inference = tree.inference(id);
    let rule = inference.rule;
    let from = inference.from.clone();
    let file = tree.file_mut(at)?;
    let source = Dependency::new(Path::parse(&source_name(&file.name, &from)));
    file.deps.insert(0, source);
    file.inference = Some(id);
    file.rule = Some(rule);
    return Ok(());
}

/// `x.o` becomes (`x`, `.o`); a name without a dot has an empty suffix.
fn split_extension(name: &str) -> (&str, &str) {
    return name.rfind('.').map_or((name, ""), |idx| return name.split_at(idx));
}

/// Source file for `name` under a rule whose source suffix is `from`.
fn source_name(name: &str, from: &str) -> String {
    return format!("{}{from}", split_extension(name).0);
}
