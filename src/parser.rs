//! Build-description parser and upward scope discovery.
//!
//! Files are read as logical lines (backslash-newline joins), each line
//! classified as a directive, recipe line, assignment or target line, and
//! applied to one directory scope. `include` and `.expand` re-enter
//! [`Parser::parse_text`] with their own conditional stack.

use std::path::PathBuf;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::config::DEFAULT_MAKEFILE;
use crate::cond;
use crate::error::Error;
use crate::expand::{ExpansionContext, Expander};
use crate::path::{Component, Path};
use crate::scope::{Directory, FileRef, Foreign, ScopeId, ScopeKind, ScopeTree};
use crate::shell::{ShellCommand, ShellExecutor};
use crate::types::{Dependency, File, InferenceRule, Macro, MacroValue, Rule, RuleId, Template, is_macro_name};

/// Bound on nested `.if` blocks in one file.
pub const MAX_CONDITIONAL_DEPTH: usize = 16;

/// Bound on nested `include` and `.expand`.
pub const MAX_NESTING: usize = 16;

/// How an assignment line stores its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssignOp {
    /// `+=`
    Append,
    /// `?=`
    Default,
    /// `??=`
    DefaultNoEnv,
    /// `:=` and `::=`
    Eager,
    /// `=`
    Lazy,
    /// `!=`
    Shell,
}

/// A comment-free line split at its first top-level separator.
#[derive(Debug, PartialEq, Eq)]
enum Definition<'l> {
    /// `name op value`
    Assign {
        /// Macro name, untrimmed.
        name: &'l str,
        /// Operator found at the separator.
        op: AssignOp,
        /// Text after the operator, untrimmed.
        value: &'l str,
    },
    /// `targets: deps`
    Rule {
        /// Text after the colon.
        deps: &'l str,
        /// Text before the colon.
        targets: &'l str,
    },
}

/// One `.if` chain on the conditional stack.
#[derive(Debug, Clone, Copy)]
struct Condition {
    /// Some branch of the chain has been selected.
    taken: bool,
    /// The current branch is live.
    truthy: bool,
}

/// Per-file parser state.
#[derive(Default)]
struct Frame {
    /// Open `.if` chains, innermost last.
    conditions: Vec<Condition>,
    /// Pending `##` documentation for the next statement.
    help: Option<String>,
    /// Rule receiving recipe lines.
    rule: Option<RuleId>,
}

/// Applies build-description text to scopes of a tree.
pub struct Parser<'a> {
    /// Runs `!=` assignments.
    shell: &'a dyn ShellExecutor,
    /// Tree receiving scopes, macros and rules.
    tree: &'a mut ScopeTree,
}

/// Where the text being parsed came from.
struct Source<'s> {
    /// Directory of the scope, relative to the working directory.
    dir: &'s Path,
    /// File name or `template NAME`, for diagnostics.
    name: &'s str,
    /// Depth of `include`/`.expand` re-entry.
    nesting: usize,
}

impl Frame {
    /// Every open conditional is on a live branch.
    fn running(&self) -> bool {
        return self.conditions.iter().all(|c| return c.truthy);
    }
}

impl<'a> Parser<'a> {
    /// Parser writing into `tree`.
    pub fn new(tree: &'a mut ScopeTree, shell: &'a dyn ShellExecutor) -> Self {
        return Self { shell, tree };
    }

    // ── Discovery ─────────────────────────────────────────────────────

    /// Build the scope for `dir` and every ancestor directory holding a
    /// build description, parents first. Returns `None` if `dir` itself has
    /// no `makefile`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidScopeType` if an ancestor declared this
    /// directory as foreign, and any parse error.
    pub fn parse_recursive(&mut self, dir: &Path, makefile: &str) -> Result<Option<ScopeId>, Error> {
        let file = dir.file(makefile);
        if !file.exists() {
            return Ok(None);
        }

        let at_top = std::fs::canonicalize(dir.to_fs())?.parent().is_none();
        let parent = if at_top {
            None
        } else {
            let up = dir.join(Component::Parent);
            match self.parse_recursive(&up, makefile)? {
                Some(p) => Some(p),
                None if makefile != DEFAULT_MAKEFILE => self.parse_recursive(&up, DEFAULT_MAKEFILE)?,
                None => None,
            }
        };

        let name = dir.basename()?;
        let scope = match parent {
            Some(p) => {
                self.tree.directory(p)?;
                match self.tree.find_child(p, &name) {
                    Some(existing) if self.tree.is_directory(existing) => existing,
                    Some(existing) => {
                        return Err(Error::InvalidScopeType {
                            expected: "directory",
                            scope: self.tree.display_path(existing),
                        });
                    },
                    None => self.tree.add_scope(&name, Some(p), ScopeKind::Directory(Directory::default()), None),
                }
            },
            None => self.tree.add_scope(&name, None, ScopeKind::Directory(Directory::default()), None),
        };

        self.tree.scope_mut(scope).makefile = Some(makefile.to_string());
        self.parse_file(scope, dir, &file)?;
        return Ok(Some(scope));
    }

    /// Parse a directory scope's build description unless already done.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidScopeType` for foreign scopes, and any parse
    /// error.
    pub fn load_directory(&mut self, scope: ScopeId, dir: &Path) -> Result<(), Error> {
        if self.tree.directory(scope)?.parsed {
            return Ok(());
        }
        let makefile = self.tree.scope(scope).makefile.clone().unwrap_or_else(|| return DEFAULT_MAKEFILE.to_string());
        return self.parse_file(scope, dir, &dir.file(&makefile));
    }

    /// Parse `path` into `scope`. An unreadable file leaves the scope empty.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyParsed` on a second call for the same scope.
    pub fn parse_file(&mut self, scope: ScopeId, dir: &Path, path: &std::path::Path) -> Result<(), Error> {
        let payload = self.tree.directory_mut(scope)?;
        if payload.parsed {
            return Err(Error::AlreadyParsed { path: path.to_path_buf() });
        }
        payload.parsed = true;

        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no build description");
                return Ok(());
            },
        };
        debug!(path = %path.display(), "parsing");
        let name = path.display().to_string();
        let source = Source { dir, name: &name, nesting: 0 };
        return self.parse_text(scope, &source, &text);
    }

    // ── Line loop ─────────────────────────────────────────────────────

    /// Apply every logical line of `text`. Errors are located at the line
    /// that raised them.
    fn parse_text(&mut self, scope: ScopeId, src: &Source<'_>, text: &str) -> Result<(), Error> {
        let mut lines = logical_lines(text).into_iter();
        let mut frame = Frame::default();
        let mut last = 1;

        while let Some((lineno, line)) = lines.next() {
            last = lineno;

            if let Some(arg) = directive(&line, "template") {
                let name = strip_comment(arg).trim().to_string();
                let (body, closed) = template_body(&mut lines);
                if !closed {
                    warn!("{}:{lineno}: unterminated .template {name}", src.name);
                }
                if frame.running() {
                    self.tree.directory_mut(scope)?.templates.push(Template { name, text: body });
                }
                frame.help = None;
                continue;
            }

            self.parse_line(scope, src, &mut frame, &line, lineno).map_err(|e| return e.at(src.name, lineno))?;
        }

        if !frame.conditions.is_empty() {
            return Err(Error::UnterminatedConditional { depth: frame.conditions.len() }.at(src.name, last));
        }
        return Ok(());
    }

    /// Capture `##` help, skip comments and blanks, and hand everything
    /// else to [`Self::parse_statement`].
    fn parse_line(&mut self, scope: ScopeId, src: &Source<'_>, frame: &mut Frame, line: &str, lineno: usize) -> Result<(), Error> {
        if let Some(doc) = line.strip_prefix("##") {
            frame.help = frame.running().then(|| return self.expand(scope, src.dir, doc.trim())).transpose()?;
            return Ok(());
        }
        if line.starts_with('#') || line.trim().is_empty() {
            return Ok(());
        }
        let result = self.parse_statement(scope, src, frame, line, lineno);
        frame.help = None;
        return result;
    }

    /// Directives first, then recipe lines, then assignments and target
    /// lines. Dead conditional branches only track nesting.
    fn parse_statement(&mut self, scope: ScopeId, src: &Source<'_>, frame: &mut Frame, line: &str, lineno: usize) -> Result<(), Error> {
        let running = frame.running();

        if let Some(arg) = keyword(line, "include") {
            return if running { self.include(scope, src, arg, true) } else { Ok(()) };
        }
        if let Some(arg) = keyword(line, "-include").or_else(|| return keyword(line, "sinclude")) {
            return if running { self.include(scope, src, arg, false) } else { Ok(()) };
        }
        if directive(line, "include").is_some() {
            return if running { Err(Error::IncludeDirective) } else { Ok(()) };
        }
        if self.conditional(scope, src.dir, frame, line)? || !running {
            return Ok(());
        }

        if let Some(name) = directive(line, "expand") {
            return self.expand_template(scope, src, strip_comment(name).trim());
        }
        if let Some(arg) = special_target(line, ".DEFAULT") {
            let target = strip_comment(arg).trim();
            self.tree.directory_mut(scope)?.default_target = Some(target.to_string());
            return Ok(());
        }
        if special_target(line, ".POSIX").is_some() {
            warn!("{}:{lineno}: this is not a POSIX-compatible make", src.name);
            return Ok(());
        }
        if special_target(line, ".SUFFIXES").is_some() {
            warn!("{}:{lineno}: .SUFFIXES is not needed", src.name);
            return Ok(());
        }
        if let Some(arg) = special_target(line, ".SUBDIRS") {
            return self.declare_children(scope, src.dir, strip_comment(arg), false);
        }
        if let Some(arg) = special_target(line, ".FOREIGN") {
            return self.declare_children(scope, src.dir, strip_comment(arg), true);
        }
        if let Some(arg) = special_target(line, ".EXPORTS") {
            return self.export(scope, strip_comment(arg));
        }

        if let Some(recipe) = line.strip_prefix('\t') {
            let rule = frame.rule.ok_or(Error::RecipeWithoutRule)?;
            self.tree.rule_mut(rule).recipe.push(recipe.to_string());
            return Ok(());
        }

        match split_definition(strip_comment(line)) {
            Some(Definition::Rule { deps, targets }) => {
                frame.rule = self.define_rule(scope, src.dir, targets, deps, frame.help.as_deref())?;
            },
            Some(Definition::Assign { name, op, value }) => {
                self.assign(scope, src.dir, name, op, value, frame.help.clone())?;
            },
            None => warn!("{}:{lineno}: invalid line: {line}", src.name),
        }
        return Ok(());
    }

    /// Apply `.if`, `.elif`, `.else` or `.endif`. Returns `false` for any
    /// other line. Expressions on dead branches are not evaluated.
    fn conditional(&self, scope: ScopeId, dir: &Path, frame: &mut Frame, line: &str) -> Result<bool, Error> {
        if let Some(expr) = directive(line, "if") {
            if frame.conditions.len() >= MAX_CONDITIONAL_DEPTH {
                return Err(Error::ConditionalOverflow { limit: MAX_CONDITIONAL_DEPTH });
            }
            let condition = if frame.running() {
                let value = self.evaluate(scope, dir, expr)?;
                Condition { taken: value, truthy: value }
            } else {
                Condition { taken: true, truthy: false }
            };
            frame.conditions.push(condition);
            return Ok(true);
        }
        if directive(line, "else").is_some() {
            let top = frame
                .conditions
                .last_mut()
                .ok_or_else(|| return Error::ConditionalUnderflow { directive: "else".to_string() })?;
            top.truthy = !top.taken;
            top.taken = true;
            return Ok(true);
        }
        if let Some(expr) = directive(line, "elif") {
            let Some((top, outer)) = frame.conditions.split_last_mut() else {
                return Err(Error::ConditionalUnderflow { directive: "elif".to_string() });
            };
            if top.taken {
                top.truthy = false;
            } else if outer.iter().all(|c| return c.truthy) {
                let value = self.evaluate(scope, dir, expr)?;
                top.truthy = value;
                top.taken = value;
            }
            return Ok(true);
        }
        if directive(line, "endif").is_some() {
            if frame.conditions.pop().is_none() {
                return Err(Error::ConditionalUnderflow { directive: "endif".to_string() });
            }
            return Ok(true);
        }
        return Ok(false);
    }

    // ── Directives ────────────────────────────────────────────────────

    /// `include FILE`, relative to the scope directory. A missing optional
    /// include is only warned about.
    fn include(&mut self, scope: ScopeId, src: &Source<'_>, arg: &str, required: bool) -> Result<(), Error> {
        let target = self.expand(scope, src.dir, strip_comment(arg).trim())?;
        let path = if target.starts_with('/') { PathBuf::from(&target) } else { src.dir.file(&target) };
        if src.nesting >= MAX_NESTING {
            return Err(Error::TemplateNesting { limit: MAX_NESTING });
        }

        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(_) if !required => {
                warn!("{}: cannot include {}", src.name, path.display());
                return Ok(());
            },
            Err(_) => return Err(Error::IncludeNotFound { path }),
        };
        debug!(path = %path.display(), "including");
        let name = path.display().to_string();
        let nested = Source {
            dir: src.dir,
            name: &name,
            nesting: src.nesting.saturating_add(1),
        };
        return self.parse_text(scope, &nested, &text);
    }

    /// `.expand NAME`: parse a captured template in place.
    fn expand_template(&mut self, scope: ScopeId, src: &Source<'_>, name: &str) -> Result<(), Error> {
        let text = self
            .tree
            .find_template(scope, name)
            .map(|t| return t.text.clone())
            .ok_or_else(|| return Error::UnknownTemplate { name: name.to_string() })?;
        if src.nesting >= MAX_NESTING {
            return Err(Error::TemplateNesting { limit: MAX_NESTING });
        }
        let label = format!("template {name}");
        let nested = Source {
            dir: src.dir,
            name: &label,
            nesting: src.nesting.saturating_add(1),
        };
        return self.parse_text(scope, &nested, &text);
    }

    /// `.SUBDIRS:` and `.FOREIGN:` entries.
    fn declare_children(&mut self, scope: ScopeId, dir: &Path, names: &str, foreign: bool) -> Result<(), Error> {
        for name in names.split_whitespace() {
            if let Some(existing) = self.tree.find_child(scope, name) {
                if self.tree.is_directory(existing) == foreign {
                    return Err(Error::InvalidScopeType {
                        expected: if foreign { "foreign" } else { "directory" },
                        scope: self.tree.display_path(existing),
                    });
                }
                continue;
            }

            let child = if foreign {
                self.tree.add_scope(name, Some(scope), ScopeKind::Foreign(Foreign::default()), None)
            } else {
                let path = dir.file(name);
                if !path.is_dir() {
                    return Err(Error::DirectoryNotFound { name: name.to_string(), path });
                }
                self.tree.add_scope(
                    name,
                    Some(scope),
                    ScopeKind::Directory(Directory::default()),
                    Some(DEFAULT_MAKEFILE.to_string()),
                )
            };
            self.tree.attach_child(scope, child)?;
        }
        return Ok(());
    }

    /// `.EXPORTS:` captures the current definition of each name.
    fn export(&mut self, scope: ScopeId, names: &str) -> Result<(), Error> {
        for name in names.split_whitespace() {
            if self.tree.directory(scope)?.exports.iter().any(|m| return m.name == name) {
                continue;
            }
            let found = self
                .tree
                .find_macro(scope, name)
                .ok_or_else(|| return Error::UndefinedExport { name: name.to_string() })?;
            self.tree.directory_mut(scope)?.exports.push(found);
        }
        return Ok(());
    }

    // ── Rules and assignments ─────────────────────────────────────────

    /// Returns the rule that subsequent recipe lines extend, or `None` when
    /// a target was already known.
    fn define_rule(
        &mut self,
        scope: ScopeId,
        dir: &Path,
        targets: &str,
        deps: &str,
        help: Option<&str>,
    ) -> Result<Option<RuleId>, Error> {
        let deps: Vec<Dependency> = self
            .expand(scope, dir, deps)?
            .split_whitespace()
            .map(|w| return Dependency::new(Path::parse(w)))
            .collect();
        let targets = self.expand(scope, dir, targets)?;
        let rule = self.tree.add_rule(Rule::default());

        if let Some((from, to)) = inference_suffixes(&targets) {
            let id = self.tree.add_inference(InferenceRule { deps, from, rule, to });
            self.tree.directory_mut(scope)?.inferences.push(id);
            return Ok(Some(rule));
        }

        let mut fresh = true;
        for name in targets.split_whitespace() {
            if let Some(index) = self.tree.find_file(scope, name) {
                fresh = false;
                let file = self.tree.file_mut(FileRef { index, scope })?;
                if file.help.is_none() {
                    file.help = help.map(str::to_string);
                }
                file.deps.extend(deps.iter().cloned());
                continue;
            }

            let stamp = self.tree.stamp(scope, dir, name);
            let mut file = File::new(name, Some(rule), stamp);
            file.deps.clone_from(&deps);
            file.help = help.map(str::to_string);
            let at = self.tree.add_file(scope, file)?;
            self.attach_foreign(scope, name, at)?;
        }
        return Ok(fresh.then_some(rule));
    }

    /// Bind `name?`/`name!` files to the foreign child `name`.
    fn attach_foreign(&mut self, scope: ScopeId, name: &str, at: FileRef) -> Result<(), Error> {
        let (base, test) = if let Some(base) = name.strip_suffix('?') {
            (base, true)
        } else if let Some(base) = name.strip_suffix('!') {
            (base, false)
        } else {
            return Ok(());
        };

        let child = self.tree.find_child(scope, base).ok_or_else(|| return Error::NotASubdir {
            name: base.to_string(),
            scope: self.tree.display_path(scope),
        })?;
        if self.tree.is_directory(child) {
            return Err(Error::NotAForeignScope {
                name: base.to_string(),
                scope: self.tree.display_path(scope),
            });
        }
        if let ScopeKind::Foreign(foreign) = &mut self.tree.scope_mut(child).kind {
            if test {
                foreign.test = Some(at);
            } else {
                foreign.exec = Some(at);
            }
        }
        return Ok(());
    }

    /// Append a macro definition to the scope.
    fn assign(&mut self, scope: ScopeId, dir: &Path, name: &str, op: AssignOp, value: &str, help: Option<String>) -> Result<(), Error> {
        let name = name.trim();
        if !is_macro_name(name) {
            return Err(Error::InvalidMacroName { name: name.to_string() });
        }
        let value = value.trim();

        let (value, prepend) = match op {
            AssignOp::Lazy => (MacroValue::Deferred(value.to_string()), None),
            AssignOp::Eager => (MacroValue::Literal(self.expand(scope, dir, value)?), None),
            AssignOp::Append => (MacroValue::Deferred(value.to_string()), self.tree.find_macro(scope, name)),
            AssignOp::Default | AssignOp::DefaultNoEnv => {
                let from_env = if op == AssignOp::Default { std::env::var(name).ok() } else { None };
                if let Some(env) = from_env {
                    (MacroValue::Literal(env), None)
                } else if let Some(existing) = self.tree.find_macro(scope, name) {
                    (existing.value.clone(), existing.prepend.clone())
                } else {
                    (MacroValue::Deferred(value.to_string()), None)
                }
            },
            AssignOp::Shell => {
                let command = ShellCommand {
                    cwd: dir.to_fs(),
                    errexit: false,
                    line: self.expand(scope, dir, value)?,
                    program: self.expand(scope, dir, "${SHELL}")?,
                };
                (MacroValue::Literal(self.shell.capture(&command)?), None)
            },
        };

        self.tree.directory_mut(scope)?.macros.push(Rc::new(Macro {
            help,
            name: name.to_string(),
            prepend,
            value,
        }));
        return Ok(());
    }

    // ── Expansion helpers ─────────────────────────────────────────────

    /// Expand outside any recipe.
    fn expand(&self, scope: ScopeId, dir: &Path, text: &str) -> Result<String, Error> {
        let ctx = ExpansionContext::none();
        return Expander::new(&*self.tree, scope, dir, &ctx).expand(text);
    }

    /// Evaluate a `.if`/`.elif` expression, trailing comment removed.
    fn evaluate(&self, scope: ScopeId, dir: &Path, expr: &str) -> Result<bool, Error> {
        let ctx = ExpansionContext::none();
        let expander = Expander::new(&*self.tree, scope, dir, &ctx);
        return cond::evaluate(&expander, &*self.tree, scope, strip_expression_comment(expr).trim());
    }
}

// ── Lexical helpers ───────────────────────────────────────────────────

/// Join backslash-newline continuations. Each logical line carries the
/// number of its first physical line.
fn logical_lines(text: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut lineno: usize = 1;
    let mut start = 1;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\n' => {
                lines.push((start, std::mem::take(&mut current)));
                lineno = lineno.saturating_add(1);
                start = lineno;
            },
            '\\' if chars.peek() == Some(&'\n') => {
                chars.next();
                lineno = lineno.saturating_add(1);
            },
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        lines.push((start, current));
    }
    return lines;
}

/// Raw lines up to `.endtemplate` (or `.endt`), and whether the
/// terminator was seen.
fn template_body(lines: &mut impl Iterator<Item = (usize, String)>) -> (String, bool) {
    let mut body = String::new();
    for (_, inner) in lines {
        if directive(&inner, "endt").is_some() || directive(&inner, "endtemplate").is_some() {
            return (body, true);
        }
        body.push_str(&inner);
        body.push('\n');
    }
    return (body, false);
}

/// Cut a `#` comment that starts the line or follows whitespace.
fn strip_comment(line: &str) -> &str {
    return cut_comment(line, false);
}

/// [`strip_comment`] for `.if` expressions: a `#` inside a `"..."` atom
/// is text.
fn strip_expression_comment(expr: &str) -> &str {
    return cut_comment(expr, true);
}

/// Scan for a comment start; with `quotes`, double-quoted spans are opaque.
fn cut_comment(line: &str, quotes: bool) -> &str {
    let mut quoted = false;
    let mut after_blank = true;
    for (i, ch) in line.char_indices() {
        if ch == '#' && after_blank && !quoted {
            return line.get(..i).unwrap_or(line);
        }
        if quotes && ch == '"' {
            quoted = !quoted;
        }
        after_blank = ch.is_ascii_whitespace();
    }
    return line;
}

/// `.name args`, with optional whitespace after the dot.
fn directive<'l>(line: &'l str, name: &str) -> Option<&'l str> {
    let rest = line.strip_prefix('.')?.trim_start().strip_prefix(name)?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    return Some(rest.trim());
}

/// `word args` at the very start of the line.
fn keyword<'l>(line: &'l str, word: &str) -> Option<&'l str> {
    let rest = line.strip_prefix(word)?;
    if !rest.starts_with([' ', '\t']) {
        return None;
    }
    return Some(rest.trim());
}

/// `.NAME: args`.
fn special_target<'l>(line: &'l str, name: &str) -> Option<&'l str> {
    let rest = line.strip_prefix(name)?.trim_start().strip_prefix(':')?;
    return Some(rest.trim());
}

/// Position of the first `:` or `=` outside `${...}` and backslash
/// escapes. An unterminated `${` hides everything after it.
fn find_separator(line: &str) -> Option<usize> {
    let mut chars = line.char_indices();
    let mut depth: usize = 0;
    while let Some((i, ch)) = chars.next() {
        match ch {
            '$' if depth == 0 => {
                if chars.next().is_some_and(|(_, next)| return next == '{') {
                    depth = 1;
                }
            },
            '{' if depth > 0 => depth = depth.saturating_add(1),
            '}' if depth > 0 => depth = depth.saturating_sub(1),
            '\\' if depth == 0 => {
                chars.next();
            },
            ':' | '=' if depth == 0 => return Some(i),
            _ => {},
        }
    }
    return None;
}

/// Classify a comment-free line as an assignment or a target line.
fn split_definition(line: &str) -> Option<Definition<'_>> {
    let pos = find_separator(line)?;
    let (lhs, rest) = line.split_at(pos);

    let (name, op, value) = if let Some(value) = rest.strip_prefix("::=") {
        (lhs, AssignOp::Eager, value)
    } else if let Some(value) = rest.strip_prefix(":=") {
        (lhs, AssignOp::Eager, value)
    } else if let Some(deps) = rest.strip_prefix(':') {
        if lhs.trim().is_empty() {
            return None;
        }
        return Some(Definition::Rule { deps, targets: lhs });
    } else {
        let value = rest.strip_prefix('=')?;
        if let Some(name) = lhs.strip_suffix("??") {
            (name, AssignOp::DefaultNoEnv, value)
        } else if let Some(name) = lhs.strip_suffix('?') {
            (name, AssignOp::Default, value)
        } else if let Some(name) = lhs.strip_suffix('+') {
            (name, AssignOp::Append, value)
        } else if let Some(name) = lhs.strip_suffix('!') {
            (name, AssignOp::Shell, value)
        } else {
            (lhs, AssignOp::Lazy, value)
        }
    };

    if name.trim().is_empty() {
        return None;
    }
    return Some(Definition::Assign { name, op, value });
}

/// `.c.o` gives (`.c`, `.o`); `.sh` gives (`.sh`, ``). Each suffix is at
/// most three characters.
fn inference_suffixes(targets: &str) -> Option<(String, String)> {
    if targets.is_empty() || targets.contains(char::is_whitespace) {
        return None;
    }
    let rest = targets.strip_prefix('.')?;
    match rest.split_once('.') {
        Some((from, to)) => {
            let valid = !from.is_empty() && !to.is_empty() && from.len() <= 3 && to.len() <= 3;
            return valid.then(|| return (format!(".{from}"), format!(".{to}")));
        },
        None => {
            let valid = !rest.is_empty() && rest.len() <= 3;
            return valid.then(|| return (targets.to_string(), String::new()));
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::RecordingShell;

    struct Project {
        dir: Path,
        root: ScopeId,
        shell: RecordingShell,
        tmp: tempfile::TempDir,
        tree: ScopeTree,
    }

    impl Project {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let mut tree = ScopeTree::new(None, vec![Rc::new(Macro::literal("SHELL", "sh"))]);
            let root = tree.add_scope("proj", None, ScopeKind::Directory(Directory::default()), Some("Mkfile".into()));
            let dir = Path::parse(&tmp.path().display().to_string());
            Self {
                dir,
                root,
                shell: RecordingShell::default(),
                tmp,
                tree,
            }
        }

        fn parse(&mut self, text: &str) -> Result<(), Error> {
            std::fs::write(self.tmp.path().join("Mkfile"), text).unwrap();
            let path = self.tmp.path().join("Mkfile");
            Parser::new(&mut self.tree, &self.shell).parse_file(self.root, &self.dir, &path)
        }

        fn value(&self, name: &str) -> String {
            let ctx = ExpansionContext::none();
            Expander::new(&self.tree, self.root, &self.dir, &ctx)
                .expand(&format!("${{{name}}}"))
                .unwrap()
        }

        fn payload(&self) -> &Directory {
            self.tree.directory(self.root).unwrap()
        }

        fn file(&self, name: &str) -> &File {
            let index = self.tree.find_file(self.root, name).unwrap();
            &self.payload().files[index]
        }
    }

    #[test]
    fn assignment_operators() {
        let mut p = Project::new();
        p.parse(
            "A = one\n\
             B := ${A}\n\
             A = two\n\
             C = ${A}\n\
             C += three\n\
             D ??= fallback\n\
             A ??= ignored\n\
             E != echo captured\n",
        )
        .unwrap();
        assert_eq!(p.value("B"), "one");
        assert_eq!(p.value("C"), "two three");
        assert_eq!(p.value("D"), "fallback");
        assert_eq!(p.value("A"), "two");
        assert_eq!(p.value("E"), "captured");
        assert_eq!(p.shell.lines(), ["echo captured"]);
    }

    #[test]
    fn conditional_assignment_prefers_environment() {
        let mut p = Project::new();
        p.parse("PATH ?= nowhere\nPATH ??= nowhere\n").unwrap();
        let macros = &p.payload().macros;
        assert_ne!(macros[0].value.text(), "nowhere");
        assert_eq!(macros[1].value.text(), macros[0].value.text());
    }

    #[test]
    fn colon_equals_is_not_a_target() {
        assert_eq!(
            split_definition("X := a:b"),
            Some(Definition::Assign { name: "X ", op: AssignOp::Eager, value: " a:b" })
        );
        assert_eq!(
            split_definition("X ::= y"),
            Some(Definition::Assign { name: "X ", op: AssignOp::Eager, value: " y" })
        );
        assert_eq!(
            split_definition("${OUT:T}: in"),
            Some(Definition::Rule { deps: " in", targets: "${OUT:T}" })
        );
        assert_eq!(split_definition(": nothing"), None);
        assert_eq!(split_definition("= nothing"), None);
        assert_eq!(split_definition("just words"), None);
    }

    #[test]
    fn invalid_macro_name_is_fatal() {
        let mut p = Project::new();
        let err = p.parse("BAD-NAME = 1\n").unwrap_err();
        assert!(matches!(err, Error::Located { source, line: 1, .. } if matches!(*source, Error::InvalidMacroName { .. })));
    }

    #[test]
    fn rules_collect_recipes_and_help() {
        let mut p = Project::new();
        p.parse(
            "## build everything\n\
             all: a b \\\n  c # trailing\n\
             \techo one\n\
             \t@echo two\n",
        )
        .unwrap();
        let all = p.file("all");
        let deps: Vec<String> = all.deps.iter().map(|d| d.path.to_string()).collect();
        assert_eq!(deps, ["a", "b", "c"]);
        assert_eq!(all.help.as_deref(), Some("build everything"));
        let rule = p.tree.rule(all.rule.unwrap());
        assert_eq!(rule.recipe, ["echo one", "@echo two"]);
    }

    #[test]
    fn redeclared_target_merges_but_keeps_recipe() {
        let mut p = Project::new();
        p.parse("x: a\n\techo first\n## later\nx: b\n").unwrap();
        let x = p.file("x");
        assert_eq!(x.deps.len(), 2);
        assert_eq!(x.help.as_deref(), Some("later"));
        assert_eq!(p.tree.rule(x.rule.unwrap()).recipe, ["echo first"]);

        let mut q = Project::new();
        let err = q.parse("x: a\n\techo first\nx: b\n\techo second\n").unwrap_err();
        assert!(err.to_string().contains("recipe line outside of a rule"));
        assert!(err.to_string().contains(":4:"));
    }

    #[test]
    fn recipe_without_rule_is_fatal() {
        let mut p = Project::new();
        assert!(p.parse("\techo orphan\n").is_err());
    }

    #[test]
    fn inference_rule_definitions() {
        let mut p = Project::new();
        p.parse(".c.o: common.h\n\tcc -c $<\n.sh:\n\tcp $< $@\n").unwrap();
        let infs = &p.payload().inferences;
        assert_eq!(infs.len(), 2);
        let co = p.tree.inference(infs[0]);
        assert_eq!((co.from.as_str(), co.to.as_str()), (".c", ".o"));
        assert_eq!(co.deps.len(), 1);
        let sh = p.tree.inference(infs[1]);
        assert_eq!((sh.from.as_str(), sh.to.as_str()), (".sh", ""));
        assert!(p.payload().files.is_empty());
    }

    #[test]
    fn suffix_detection() {
        assert_eq!(inference_suffixes(".c.o"), Some((".c".into(), ".o".into())));
        assert_eq!(inference_suffixes(".cpp"), Some((".cpp".into(), String::new())));
        assert_eq!(inference_suffixes(".PHONY"), None);
        assert_eq!(inference_suffixes(".c.obj1"), None);
        assert_eq!(inference_suffixes("x.c"), None);
        assert_eq!(inference_suffixes(".c .o"), None);
    }

    #[test]
    fn conditionals_select_branches() {
        let mut p = Project::new();
        p.parse(
            ".if defined(DEBUG)\n\
             CFLAGS = -g\n\
             .else\n\
             CFLAGS = -O2\n\
             .endif\n\
             .if \"a\" == \"b\"\n\
             X = 1\n\
             .elif \"a\" == \"a\" # matches\n\
             X = 2\n\
             .elif \"b\" == \"b\"\n\
             X = 3\n\
             .else\n\
             X = 4\n\
             .endif\n",
        )
        .unwrap();
        assert_eq!(p.value("CFLAGS"), "-O2");
        assert_eq!(p.value("X"), "2");
    }

    #[test]
    fn dead_branches_skip_nested_expressions() {
        let mut p = Project::new();
        p.parse(
            ".if \"0\"\n\
             .if this is not parsed\n\
             Y = inner\n\
             .else\n\
             Y = inner-else\n\
             .endif\n\
             .else\n\
             Y = outer\n\
             .endif\n",
        )
        .unwrap();
        assert_eq!(p.value("Y"), "outer");
    }

    #[test]
    fn conditional_stack_errors() {
        let mut p = Project::new();
        assert!(matches!(
            p.parse(".endif\n"),
            Err(Error::Located { source, .. }) if matches!(*source, Error::ConditionalUnderflow { .. })
        ));

        let mut q = Project::new();
        assert!(matches!(
            q.parse(".if \"1\"\n"),
            Err(Error::Located { source, .. }) if matches!(*source, Error::UnterminatedConditional { depth: 1 })
        ));

        let mut r = Project::new();
        let deep = ".if \"1\"\n".repeat(MAX_CONDITIONAL_DEPTH + 1);
        assert!(matches!(
            r.parse(&deep),
            Err(Error::Located { source, line: 17, .. }) if matches!(*source, Error::ConditionalOverflow { .. })
        ));
    }

    #[test]
    fn templates_are_captured_and_expanded() {
        let mut p = Project::new();
        p.parse(
            ".template prog\n\
             ${NAME}: ${NAME}.c\n\
             \tcc -o $@ $<\n\
             .endtemplate\n\
             NAME = hello\n\
             .expand prog\n",
        )
        .unwrap();
        let hello = p.file("hello");
        assert_eq!(hello.deps[0].path.to_string(), "hello.c");
        assert_eq!(p.tree.rule(hello.rule.unwrap()).recipe, ["cc -o $@ $<"]);
    }

    #[test]
    fn unknown_template_is_fatal() {
        let mut p = Project::new();
        assert!(p.parse(".expand nothing\n").unwrap_err().to_string().contains("no such template"));
    }

    #[test]
    fn includes_share_the_scope() {
        let mut p = Project::new();
        std::fs::write(p.tmp.path().join("common.mk"), "CC = cc\n").unwrap();
        p.parse("INC = common.mk\ninclude ${INC}\n-include missing.mk\nsinclude missing.mk\n").unwrap();
        assert_eq!(p.value("CC"), "cc");

        let mut q = Project::new();
        let err = q.parse("include missing.mk\n").unwrap_err();
        assert!(err.to_string().contains("cannot include"));

        let mut r = Project::new();
        assert!(matches!(
            r.parse(".include x\n"),
            Err(Error::Located { source, .. }) if matches!(*source, Error::IncludeDirective)
        ));
    }

    #[test]
    fn errors_in_includes_keep_their_location() {
        let mut p = Project::new();
        std::fs::write(p.tmp.path().join("bad.mk"), "\n\n.endif\n").unwrap();
        let err = p.parse("X = 1\ninclude bad.mk\n").unwrap_err();
        let Error::Located { file, line, .. } = err else {
            panic!("expected a located error");
        };
        assert!(file.ends_with("bad.mk"));
        assert_eq!(line, 3);
    }

    #[test]
    fn self_include_hits_the_nesting_bound() {
        let mut p = Project::new();
        std::fs::write(p.tmp.path().join("loop.mk"), "include loop.mk\n").unwrap();
        let err = p.parse("include loop.mk\n").unwrap_err();
        assert!(err.to_string().contains("maximum include depth"));
    }

    #[test]
    fn subdirs_must_exist() {
        let mut p = Project::new();
        let err = p.parse(".SUBDIRS: lib\n").unwrap_err();
        assert!(matches!(err, Error::Located { source, .. } if matches!(*source, Error::DirectoryNotFound { .. })));

        let mut q = Project::new();
        std::fs::create_dir(q.tmp.path().join("lib")).unwrap();
        std::fs::create_dir(q.tmp.path().join("doc")).unwrap();
        q.parse(".SUBDIRS: lib doc # two\n.SUBDIRS: lib\n").unwrap();
        let names: Vec<&str> = q.payload().children.iter().map(|&c| q.tree.scope(c).name.as_str()).collect();
        assert_eq!(names, ["lib", "doc"]);
        assert_eq!(q.value(".SUBDIRS"), "lib doc");
    }

    #[test]
    fn foreign_rules_attach_to_child() {
        let mut p = Project::new();
        p.parse(
            ".FOREIGN: vendor\n\
             vendor?:\n\
             \ttest -f vendor/out\n\
             vendor!: patch\n\
             \tcd vendor && make\n",
        )
        .unwrap();
        let child = p.tree.find_child(p.root, "vendor").unwrap();
        let ScopeKind::Foreign(foreign) = &p.tree.scope(child).kind else {
            panic!("expected a foreign scope");
        };
        let exec = p.tree.file(foreign.exec.unwrap()).unwrap();
        assert_eq!(exec.name, "vendor!");
        assert!(foreign.test.is_some());
        assert!(!p.tree.is_directory(child));
    }

    #[test]
    fn foreign_rule_for_unknown_child_is_fatal() {
        let mut p = Project::new();
        assert!(p.parse("nothing?:\n\ttrue\n").unwrap_err().to_string().contains("not a subdir"));

        let mut q = Project::new();
        std::fs::create_dir(q.tmp.path().join("lib")).unwrap();
        let err = q.parse(".SUBDIRS: lib\nlib!:\n\ttrue\n").unwrap_err();
        assert!(err.to_string().contains("not a foreign subdir"));
    }

    #[test]
    fn child_kind_cannot_change() {
        let mut p = Project::new();
        std::fs::create_dir(p.tmp.path().join("lib")).unwrap();
        let err = p.parse(".SUBDIRS: lib\n.FOREIGN: lib\n").unwrap_err();
        assert!(err.to_string().contains("invalid scope type"));
    }

    #[test]
    fn exports_require_defined_macros() {
        let mut p = Project::new();
        p.parse("CC = cc\n.EXPORTS: CC CC\n").unwrap();
        assert_eq!(p.payload().exports.len(), 1);

        let mut q = Project::new();
        assert!(q.parse(".EXPORTS: NOPE\n").unwrap_err().to_string().contains("no such macro"));
    }

    #[test]
    fn default_target_is_literal() {
        let mut p = Project::new();
        p.parse(".DEFAULT: ${X} # comment\nall:\n").unwrap();
        assert_eq!(p.payload().default_target.as_deref(), Some("${X}"));
    }

    #[test]
    fn advisory_lines_are_skipped() {
        let mut p = Project::new();
        p.parse(".POSIX:\n.SUFFIXES: .c .o\nnonsense here\nX = 1\n").unwrap();
        assert_eq!(p.value("X"), "1");
        assert!(p.payload().files.is_empty());
    }

    #[test]
    fn second_parse_is_rejected() {
        let mut p = Project::new();
        p.parse("X = 1\n").unwrap();
        assert!(matches!(p.parse("X = 2\n"), Err(Error::AlreadyParsed { .. })));
    }

    #[test]
    fn missing_build_file_gives_empty_scope() {
        let mut p = Project::new();
        let path = p.tmp.path().join("absent");
        Parser::new(&mut p.tree, &p.shell).parse_file(p.root, &p.dir, &path).unwrap();
        assert!(p.payload().parsed);
        assert!(p.payload().files.is_empty());
    }

    #[test]
    fn logical_line_numbers() {
        let lines = logical_lines("a \\\nb\nc\n\nd");
        assert_eq!(
            lines,
            [(1, "a b".to_string()), (3, "c".to_string()), (4, String::new()), (5, "d".to_string())]
        );
    }

    #[test]
    fn comments_need_leading_whitespace() {
        assert_eq!(strip_comment("a # b"), "a ");
        assert_eq!(strip_comment("a#b"), "a#b");
        assert_eq!(strip_comment("# all"), "");
    }

    #[test]
    fn quoted_hash_in_condition_is_not_a_comment() {
        assert_eq!(strip_expression_comment("\"a #1\" == \"a #1\" # same"), "\"a #1\" == \"a #1\" ");
        assert_eq!(strip_expression_comment("defined(X) # why"), "defined(X) ");

        let mut p = Project::new();
        p.parse(".if \"a #1\" == \"a #1\"\nX = yes\n.endif\n").unwrap();
        assert_eq!(p.value("X"), "yes");
    }

    #[test]
    fn discovery_climbs_to_the_top_build_file() {
        let tmp = tempfile::tempdir().unwrap();
        let top = tmp.path().join("proj");
        std::fs::create_dir_all(top.join("lib")).unwrap();
        std::fs::write(top.join("Mkfile"), ".SUBDIRS: lib\nTOP = yes\n.EXPORTS: TOP\n").unwrap();
        std::fs::write(top.join("lib/Mkfile"), "LOCAL = ${TOP}\n").unwrap();

        let shell = RecordingShell::default();
        let mut tree = ScopeTree::new(None, Vec::new());
        let start = Path::parse(&top.join("lib").display().to_string());
        let leaf = Parser::new(&mut tree, &shell).parse_recursive(&start, "Mkfile").unwrap().unwrap();

        assert_eq!(tree.scope(leaf).name, "lib");
        let parent = tree.parent(leaf).unwrap();
        assert_eq!(tree.scope(parent).name, "proj");
        assert_eq!(tree.find_child(parent, "lib"), Some(leaf));
        assert_eq!(tree.display_path(leaf), "./lib");
        assert!(tree.directory(leaf).unwrap().parsed);

        let ctx = ExpansionContext::none();
        let value = Expander::new(&tree, leaf, &start, &ctx).expand("${LOCAL}").unwrap();
        assert_eq!(value, "yes");
    }

    #[test]
    fn discovery_keeps_unlisted_directories_unattached() {
        let tmp = tempfile::tempdir().unwrap();
        let top = tmp.path().join("proj");
        std::fs::create_dir_all(top.join("tools")).unwrap();
        std::fs::write(top.join("Mkfile"), "X = 1\n").unwrap();
        std::fs::write(top.join("tools/Mkfile"), "").unwrap();

        let shell = RecordingShell::default();
        let mut tree = ScopeTree::new(None, Vec::new());
        let start = Path::parse(&top.join("tools").display().to_string());
        let leaf = Parser::new(&mut tree, &shell).parse_recursive(&start, "Mkfile").unwrap().unwrap();
        let parent = tree.parent(leaf).unwrap();
        assert!(tree.find_child(parent, "tools").is_none());
    }

    #[test]
    fn discovery_without_build_file() {
        let tmp = tempfile::tempdir().unwrap();
        let shell = RecordingShell::default();
        let mut tree = ScopeTree::new(None, Vec::new());
        let start = Path::parse(&tmp.path().display().to_string());
        assert!(Parser::new(&mut tree, &shell).parse_recursive(&start, "Mkfile").unwrap().is_none());
    }
}
