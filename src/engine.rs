//! The build engine: depth-first recursion over `(scope, target, prefix)`
//! deciding staleness from modification times and running recipes.

use std::time::SystemTime;

use tracing::{debug, info};

use crate::config::BuildConfig;
use crate::error::Error;
use crate::expand::{ExpansionContext, Expander};
use crate::infer;
use crate::parser::Parser;
use crate::path::{Component, Path};
use crate::scope::{FileRef, ScopeId, ScopeKind, ScopeTree};
use crate::shell::{ShellCommand, ShellExecutor};
use crate::types::{Dependency, File, Stamp};

/// Outcome of building one target. Fatal conditions are `Err` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    /// Up to date; the stamp is compared against dependents.
    Done(Stamp),
    /// A recipe line or a dependency failed.
    Failed,
}

/// Builds targets of a parsed tree, loading sub-scopes on demand.
pub struct Engine<'a> {
    /// Flags for this run.
    config: &'a BuildConfig,
    /// Files whose dependencies are being built, outermost first.
    in_progress: Vec<FileRef>,
    /// Runs recipe lines.
    shell: &'a dyn ShellExecutor,
    /// Tree being built.
    tree: &'a mut ScopeTree,
}

impl<'a> Engine<'a> {
    /// Engine over `tree`.
    pub const fn new(tree: &'a mut ScopeTree, config: &'a BuildConfig, shell: &'a dyn ShellExecutor) -> Self {
        return Self {
            config,
            in_progress: Vec::new(),
            shell,
            tree,
        };
    }

    /// Build `target` relative to `scope`, whose directory is `start`
    /// relative to the working directory. An empty target builds the
    /// scope's default.
    ///
    /// # Errors
    ///
    /// Returns resolution errors (unknown file, subdir or rule), parse
    /// errors from lazily loaded scopes and shell spawn failures.
    pub fn build(&mut self, scope: ScopeId, start: &Path, target: &Path) -> Result<BuildStatus, Error> {
        return self.build_path(scope, target.components(), start);
    }

    /// Walk `components` from `scope`, loading scopes on the way, and build
    /// what the last one names.
    fn build_path(&mut self, scope: ScopeId, components: &[Component], prefix: &Path) -> Result<BuildStatus, Error> {
        match components {
            [] => return self.build_target(scope, None, prefix),
            [Component::Root, ..] => return self.build_absolute(scope, components),
            [Component::Parent, rest @ ..] => {
                let parent = self.tree.parent(scope).ok_or_else(|| return Error::EscapesRoot {
                    scope: self.tree.display_path(scope),
                })?;
                return self.build_path(parent, rest, &prefix.join(Component::Parent));
            },
            [Component::Name(name)] => return self.build_target(scope, Some(name), prefix),
            [Component::Name(name), rest @ ..] => {
                if !self.tree.is_directory(scope) {
                    return Err(Error::InvalidPath { scope: self.tree.display_path(scope) });
                }
                self.load(scope, prefix)?;
                let child = self.tree.find_child(scope, name).ok_or_else(|| return Error::InvalidSubdir {
                    name: name.clone(),
                    scope: self.tree.display_path(scope),
                })?;
                return self.build_path(child, rest, &prefix.join_name(name));
            },
        }
    }

    /// Absolute dependencies are plain files outside the project.
    fn build_absolute(&self, scope: ScopeId, components: &[Component]) -> Result<BuildStatus, Error> {
        let path = Path::from_components(components);
        return match std::fs::symlink_metadata(path.to_fs()).and_then(|m| return m.modified()) {
            Ok(time) => Ok(BuildStatus::Done(Stamp { in_objdir: false, time })),
            Err(_) => Err(Error::NoSuchFile {
                name: path.to_string(),
                scope: self.tree.display_path(scope),
            }),
        };
    }

    /// Build `name` in a directory scope, or run a foreign scope's rules.
    fn build_target(&mut self, scope: ScopeId, name: Option<&str>, prefix: &Path) -> Result<BuildStatus, Error> {
        debug!(dir = %prefix, target = name.unwrap_or_default(), "entering");
        self.tree.ensure_objdir(scope)?;
        if self.tree.is_directory(scope) {
            return self.build_file(scope, name, prefix);
        }
        return self.build_foreign(scope, name, prefix);
    }

    /// Parse a directory scope on first visit.
    fn load(&mut self, scope: ScopeId, prefix: &Path) -> Result<(), Error> {
        return Parser::new(&mut *self.tree, self.shell).load_directory(scope, prefix);
    }

    // ── Directory scopes ──────────────────────────────────────────────

    /// Resolve `requested` (or the default target) and build it. A file
    /// reached again while its own dependencies are building is a cycle.
    fn build_file(&mut self, scope: ScopeId, requested: Option<&str>, prefix: &Path) -> Result<BuildStatus, Error> {
        self.load(scope, prefix)?;

        let name = match requested {
            Some(n) => Some(n.to_string()),
            None => self.tree.directory(scope)?.default_target.clone(),
        };
        let at = match &name {
            Some(name) => match self.resolve(scope, name, prefix)? {
                Resolved::File(at) => at,
                Resolved::Child(child) => return self.build_target(child, None, &prefix.join_name(name)),
            },
            None => {
                if self.tree.directory(scope)?.files.is_empty() {
                    return Err(Error::NothingToBuild { scope: self.tree.display_path(scope) });
                }
                FileRef { index: 0, scope }
            },
        };

        if self.in_progress.contains(&at) {
            return Err(Error::DependencyCycle {
                name: self.tree.file(at)?.name.clone(),
                scope: self.tree.display_path(scope),
            });
        }
        self.in_progress.push(at);
        let status = self.build_entry(scope, at, name.as_deref(), prefix);
        self.in_progress.pop();
        return status;
    }

    /// Attach an inference rule if the file has no recipe, build its
    /// dependencies and run the recipe when it is stale.
    fn build_entry(&mut self, scope: ScopeId, at: FileRef, name: Option<&str>, prefix: &Path) -> Result<BuildStatus, Error> {
        let file = self.tree.file(at)?;
        let has_recipe = file.rule.is_some_and(|r| return !self.tree.rule(r).recipe.is_empty());
        if !has_recipe && file.inference.is_none() {
            let (has_rule, stamp, fname) = (file.rule.is_some(), file.stamp, file.name.clone());
            let found = match name {
                Some(n) => infer::find_inference(self.tree, scope, prefix, n, 0)?,
                None => None,
            };
            if let Some(id) = found {
                infer::attach(self.tree, at, id)?;
            } else if !has_rule {
                if stamp.exists() {
                    return Ok(BuildStatus::Done(stamp));
                }
                return Err(Error::NoRuleToBuild {
                    name: fname,
                    scope: self.tree.display_path(scope),
                });
            }
        }

        let file = self.tree.file(at)?;
        if file.failed {
            return Ok(BuildStatus::Failed);
        }
        let own = file.stamp;
        let explicit = file.deps.clone();
        let inference = file.inference;
        let inferred = inference.map(|id| return self.tree.inference(id).deps.clone()).unwrap_or_default();

        let explicit_stamps = self.build_deps(scope, &explicit, prefix)?;
        if explicit_stamps.is_none() && !self.config.keep_going {
            return self.fail(at);
        }
        let inferred_stamps = self.build_deps(scope, &inferred, prefix)?;
        let (Some(explicit_stamps), Some(inferred_stamps)) = (explicit_stamps, inferred_stamps) else {
            return self.fail(at);
        };

        for (dep, stamp) in self.tree.file_mut(at)?.deps.iter_mut().zip(&explicit_stamps) {
            dep.in_objdir = stamp.in_objdir;
        }
        if let Some(id) = inference {
            for (dep, stamp) in self.tree.inference_mut(id).deps.iter_mut().zip(&inferred_stamps) {
                dep.in_objdir = stamp.in_objdir;
            }
        }

        let dep_stamps = explicit_stamps.iter().chain(&inferred_stamps);
        let stale = !own.exists() || dep_stamps.clone().any(|s| return s.time >= own.time);
        if !stale {
            return Ok(BuildStatus::Done(own));
        }

        let file = self.tree.file(at)?;
        let recipe = file.rule.map(|r| return self.tree.rule(r).recipe.clone()).unwrap_or_default();
        if recipe.is_empty() {
            let newest = dep_stamps.map(|s| return s.time).fold(own.time, SystemTime::max);
            return Ok(BuildStatus::Done(Stamp { in_objdir: own.in_objdir, time: newest }));
        }

        let ctx = ExpansionContext::for_file(&*self.tree, scope, file);
        let fname = file.name.clone();
        for line in &recipe {
            let rc = self.run_recipe_line(scope, prefix, line, &ctx, Some(&fname))?;
            if rc != 0 {
                eprintln!("{}: command failed with {rc}: {line}", self.tree.display_path(scope));
                return self.fail(at);
            }
        }

        let stamp = self.tree.stamp(scope, prefix, &fname);
        self.tree.file_mut(at)?.stamp = stamp;
        return Ok(BuildStatus::Done(stamp));
    }

    /// Map a requested name to a file entry (refreshing its stamp), a
    /// child scope, or a file found on disk or through inference.
    fn resolve(&mut self, scope: ScopeId, name: &str, prefix: &Path) -> Result<Resolved, Error> {
        if let Some(index) = self.tree.find_file(scope, name) {
            let at = FileRef { index, scope };
            let stamp = self.tree.stamp(scope, prefix, name);
            self.tree.file_mut(at)?.stamp = stamp;
            return Ok(Resolved::File(at));
        }
        if let Some(child) = self.tree.find_child(scope, name) {
            return Ok(Resolved::Child(child));
        }
        return match infer::try_find(self.tree, scope, prefix, name, 0)? {
            Some(at) => Ok(Resolved::File(at)),
            None => Err(Error::NoSuchFile {
                name: name.to_string(),
                scope: self.tree.display_path(scope),
            }),
        };
    }

    /// Build each dependency in order. Returns their stamps, or `None` if
    /// any failed. Without keep-going the first failure stops the loop.
    fn build_deps(&mut self, scope: ScopeId, deps: &[Dependency], prefix: &Path) -> Result<Option<Vec<Stamp>>, Error> {
        let mut stamps = Vec::with_capacity(deps.len());
        let mut failed = false;
        for dep in deps {
            match self.build_path(scope, dep.path.components(), prefix)? {
                BuildStatus::Done(stamp) => stamps.push(stamp),
                BuildStatus::Failed => {
                    failed = true;
                    if !self.config.keep_going {
                        break;
                    }
                },
            }
        }
        return Ok((!failed).then_some(stamps));
    }

    /// Mark the file failed so it is not retried this run.
    fn fail(&mut self, at: FileRef) -> Result<BuildStatus, Error> {
        self.tree.file_mut(at)?.failed = true;
        return Ok(BuildStatus::Failed);
    }

    // ── Foreign scopes ────────────────────────────────────────────────

    /// Run the `name?` test rule, then the `name!` exec rule if the test
    /// failed or is absent. Both run in the parent directory.
    fn build_foreign(&mut self, scope: ScopeId, name: Option<&str>, prefix: &Path) -> Result<BuildStatus, Error> {
        let ScopeKind::Foreign(foreign) = &self.tree.scope(scope).kind else {
            return Err(Error::InvalidScopeType {
                expected: "foreign",
                scope: self.tree.display_path(scope),
            });
        };
        let (test, exec) = (foreign.test, foreign.exec);
        let parent = self.tree.parent(scope).ok_or_else(|| return Error::EscapesRoot {
            scope: self.tree.display_path(scope),
        })?;
        let parent_prefix = prefix.join(Component::Parent);
        let scope_name = self.tree.scope(scope).name.clone();

        let stale = match test {
            Some(at) => {
                let file = self.tree.file(at)?.clone();
                if self.build_deps(parent, &file.deps, &parent_prefix)?.is_none() {
                    return Ok(BuildStatus::Failed);
                }
                let ctx = foreign_context(&scope_name, name, &file);
                let mut stale = false;
                for line in &self.recipe_of(&file) {
                    if self.run_recipe_line(parent, &parent_prefix, line, &ctx, name)? != 0 {
                        stale = true;
                        break;
                    }
                }
                stale
            },
            None => true,
        };

        if !stale {
            info!(scope = %scope_name, "up to date");
            return Ok(BuildStatus::Done(self.foreign_stamp(scope, prefix, name, Stamp::MISSING)));
        }

        let at = exec.ok_or_else(|| return Error::MissingExecRule {
            name: scope_name.clone(),
            scope: self.tree.display_path(parent),
        })?;
        let file = self.tree.file(at)?.clone();
        if self.build_deps(parent, &file.deps, &parent_prefix)?.is_none() {
            return Ok(BuildStatus::Failed);
        }
        let ctx = foreign_context(&scope_name, name, &file);
        for line in &self.recipe_of(&file) {
            let rc = self.run_recipe_line(parent, &parent_prefix, line, &ctx, name)?;
            if rc != 0 {
                eprintln!("{}: command failed with {rc}: {line}", self.tree.display_path(parent));
                return Ok(BuildStatus::Failed);
            }
        }

        let now = Stamp { in_objdir: false, time: SystemTime::now() };
        return Ok(BuildStatus::Done(self.foreign_stamp(scope, prefix, name, now)));
    }

    /// Recipe lines of a file's rule.
    fn recipe_of(&self, file: &File) -> Vec<String> {
        return file.rule.map(|r| return self.tree.rule(r).recipe.clone()).unwrap_or_default();
    }

    /// Time of the requested file inside the foreign directory, if any.
    fn foreign_stamp(&self, scope: ScopeId, prefix: &Path, name: Option<&str>, fallback: Stamp) -> Stamp {
        return name
            .map(|n| return self.tree.stamp(scope, prefix, n))
            .filter(Stamp::exists)
            .unwrap_or(fallback);
    }

    // ── Recipes ───────────────────────────────────────────────────────

    /// Echo and run one recipe line. `@` suppresses the echo and `-`
    /// ignores the exit status, in either order.
    fn run_recipe_line(
        &self,
        scope: ScopeId,
        prefix: &Path,
        line: &str,
        ctx: &ExpansionContext,
        target: Option<&str>,
    ) -> Result<i32, Error> {
        let mut text = line;
        let mut quiet = self.config.silent();
        let mut ignore = false;
        loop {
            if let Some(rest) = text.strip_prefix('@') {
                quiet = true;
                text = rest;
            } else if let Some(rest) = text.strip_prefix('-') {
                ignore = true;
                text = rest;
            } else {
                break;
            }
        }

        let expander = Expander::new(&*self.tree, scope, prefix, ctx);
        let program = expander.expand("${SHELL}")?;
        let expanded = expander.expand(text)?;

        if !quiet {
            let shown = if self.config.verbose() { expanded.as_str() } else { text };
            println!("[{}] $ {shown}", echo_label(prefix, target));
        }

        let command = ShellCommand {
            cwd: prefix.to_fs(),
            errexit: !ignore,
            line: expanded,
            program,
        };
        let rc = self.shell.run(&command)?;
        return Ok(if ignore { 0 } else { rc });
    }
}

/// What a requested name refers to.
enum Resolved {
    /// A declared child scope; its default target is built.
    Child(ScopeId),
    /// A file table entry.
    File(FileRef),
}

/// Context for `name?`/`name!` recipes: the target is the foreign
/// directory and the first source is the file requested inside it.
fn foreign_context(scope_name: &str, requested: Option<&str>, file: &File) -> ExpansionContext {
    return ExpansionContext {
        deps: file.deps.clone(),
        first: requested.map(|n| return Dependency::new(Path::name(n))),
        inferred: Vec::new(),
        target: Some(scope_name.to_string()),
    };
}

/// `prefix/target`, leaving out whichever part is empty.
fn echo_label(prefix: &Path, target: Option<&str>) -> String {
    return match (prefix.is_empty(), target) {
        (true, Some(t)) => t.to_string(),
        (true, None) => String::new(),
        (false, Some(t)) => format!("{prefix}/{t}"),
        (false, None) => prefix.to_string(),
    };
}
