//! The `${...}` substitution language.
//!
//! Expansion runs against a scope (for macro lookup), a directory prefix
//! relative to the working directory (for timestamp lookups), and an
//! [`ExpansionContext`] carrying the target being built. Recursion depth is
//! threaded through every call as a plain parameter.

use glob::Pattern;

use crate::error::Error;
use crate::path::Path;
use crate::scope::{ScopeId, ScopeTree};
use crate::types::{Dependency, File, Macro, MacroValue, is_macro_char};

/// Bound on nested `${...}` forms, lazy re-expansion included.
pub const MAX_EXPANSION_DEPTH: usize = 64;

/// Dynamic state for `.TARGET`, `.IMPSRC` and `.ALLSRC`.
#[derive(Debug, Clone, Default)]
pub struct ExpansionContext {
    /// Explicit prerequisites.
    pub deps: Vec<Dependency>,
    /// Rendered by `.IMPSRC`.
    pub first: Option<Dependency>,
    /// Prerequisites contributed by an inference rule.
    pub inferred: Vec<Dependency>,
    /// `None` outside recipes.
    pub target: Option<String>,
}

impl ExpansionContext {
    /// Context for text expanded outside any recipe.
    pub fn none() -> Self {
        return Self::default();
    }

    /// Context for running `file`'s recipe. With an object directory the
    /// target is rendered inside the scope's shadow directory.
    pub fn for_file(tree: &ScopeTree, scope: ScopeId, file: &File) -> Self {
        let target = match tree.objdir_for(scope) {
            Some(dir) => dir.join(&file.name).display().to_string(),
            None => file.name.clone(),
        };
        let inferred = file
            .inference
            .map(|id| return tree.inference(id).deps.clone())
            .unwrap_or_default();
        let first = file.deps.first().or_else(|| return inferred.first()).cloned();
        return Self {
            deps: file.deps.clone(),
            first,
            inferred,
            target: Some(target),
        };
    }
}

/// Position in the text being expanded.
pub struct Cursor<'t> {
    /// Byte offset of the next character.
    pos: usize,
    /// Whole text.
    text: &'t str,
}

impl<'t> Cursor<'t> {
    /// Cursor at the start of `text`.
    pub const fn new(text: &'t str) -> Self {
        return Self { pos: 0, text };
    }

    /// Next character without consuming it.
    pub fn peek(&self) -> Option<char> {
        return self.rest().chars().next();
    }

    /// Consume and return the next character.
    pub fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos = self.pos.saturating_add(ch.len_utf8());
        return Some(ch);
    }

    /// Unconsumed text.
    pub fn rest(&self) -> &'t str {
        return self.text.get(self.pos..).unwrap_or_default();
    }

    /// Consume whitespace.
    pub fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    /// Consume `token` if the remaining text starts with it.
    pub fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos = self.pos.saturating_add(token.len());
            return true;
        }
        return false;
    }
}

/// Expands text against one scope.
pub struct Expander<'a> {
    /// Target macros.
    ctx: &'a ExpansionContext,
    /// Scope directory relative to the working directory.
    prefix: &'a Path,
    /// Scope whose macros are visible.
    scope: ScopeId,
    /// Tree holding `scope`.
    tree: &'a ScopeTree,
}

impl<'a> Expander<'a> {
    /// Expander for `scope`, whose directory is `prefix`.
    pub const fn new(tree: &'a ScopeTree, scope: ScopeId, prefix: &'a Path, ctx: &'a ExpansionContext) -> Self {
        return Self { ctx, prefix, scope, tree };
    }

    /// Expand `text` and trim surrounding whitespace.
    ///
    /// # Errors
    ///
    /// Returns syntax errors for malformed substitutions, `ContextRequired`
    /// for target macros outside a recipe and `ExpansionDepth` on runaway
    /// recursion.
    pub fn expand(&self, text: &str) -> Result<String, Error> {
        let mut out = String::new();
        self.expand_into(&mut out, text, 0)?;
        return Ok(out.trim().to_string());
    }

    /// Expand `text` onto `out` without trimming.
    fn expand_into(&self, out: &mut String, text: &str, depth: usize) -> Result<(), Error> {
        let mut cursor = Cursor::new(text);
        while let Some(ch) = cursor.bump() {
            if ch == '$' {
                self.substitute(out, &mut cursor, depth)?;
            } else {
                out.push(ch);
            }
        }
        return Ok(());
    }

    /// Expand the substitution whose `$` was just consumed.
    ///
    /// # Errors
    ///
    /// See [`Self::expand`].
    pub fn substitute(&self, out: &mut String, cursor: &mut Cursor<'_>, depth: usize) -> Result<(), Error> {
        let Some(ch) = cursor.bump() else {
            return Err(Error::InvalidEscape { scope: self.scope_path(), sequence: "$".to_string() });
        };
        match ch {
            '$' => out.push('$'),
            '.' => self.expand_special(out, ".TOPDIR", depth)?,
            '@' => self.expand_special(out, ".TARGET", depth)?,
            '<' => self.expand_special(out, ".IMPSRC", depth)?,
            '^' => self.expand_special(out, ".ALLSRC", depth)?,
            '*' => self.braced(out, &mut Cursor::new(".IMPSRC:T:R}"), depth)?,
            '{' => self.braced(out, cursor, depth)?,
            '(' => return Err(Error::ReservedSyntax { scope: self.scope_path() }),
            c if c.is_ascii_alphabetic() => {
                let shorthand = format!("{c}}}");
                self.braced(out, &mut Cursor::new(&shorthand), depth)?;
            },
            c => {
                return Err(Error::InvalidEscape {
                    scope: self.scope_path(),
                    sequence: format!("${c}{}", cursor.rest()),
                });
            },
        }
        return Ok(());
    }

    /// `name[:modifier]*}` after the opening brace.
    fn braced(&self, out: &mut String, cursor: &mut Cursor<'_>, depth: usize) -> Result<(), Error> {
        let depth = depth.saturating_add(1);
        let orig = cursor.rest();
        if depth >= MAX_EXPANSION_DEPTH {
            return Err(Error::ExpansionDepth { text: orig.to_string() });
        }

        let mut name = String::new();
        loop {
            match cursor.peek() {
                Some(c) if is_macro_char(c) => {
                    name.push(c);
                    cursor.bump();
                },
                Some('$') => {
                    cursor.bump();
                    self.substitute(&mut name, cursor, depth)?;
                },
                _ => break,
            }
        }

        let found = self.tree.find_macro(self.scope, &name);
        if cursor.peek() == Some('}') {
            cursor.bump();
            return self.expand_macro_into(out, found.as_deref(), &name, depth);
        }

        let mut value = String::new();
        self.expand_macro_into(&mut value, found.as_deref(), &name, depth)?;

        while cursor.peek() == Some(':') {
            cursor.bump();
            let modifier = self.modifier_argument(cursor, &[':', '=', '}'], depth)?;
            if cursor.peek() == Some('=') {
                cursor.bump();
                let replacement = self.modifier_argument(cursor, &['}'], depth)?;
                value = replace_suffix(&value, &modifier, &replacement);
                break;
            }
            value = self.apply_modifier(&value, &modifier, orig)?;
        }

        if cursor.bump() != Some('}') {
            return Err(Error::InvalidExpansion { scope: self.scope_path(), text: orig.to_string() });
        }
        out.push_str(&value);
        return Ok(());
    }

    /// Modifier text up to one of `stops`. Substitutions are expanded and a
    /// backslash takes the next character literally.
    fn modifier_argument(&self, cursor: &mut Cursor<'_>, stops: &[char], depth: usize) -> Result<String, Error> {
        let mut arg = String::new();
        while let Some(c) = cursor.peek() {
            if stops.contains(&c) {
                break;
            }
            cursor.bump();
            match c {
                '$' => self.substitute(&mut arg, cursor, depth)?,
                '\\' => {
                    if let Some(next) = cursor.bump() {
                        arg.push(next);
                    }
                },
                _ => arg.push(c),
            }
        }
        return Ok(arg);
    }

    /// Expand a macro's value, its `+=` predecessors first. Unknown names
    /// fall through to the special variables.
    fn expand_macro_into(&self, out: &mut String, found: Option<&Macro>, name: &str, depth: usize) -> Result<(), Error> {
        let Some(m) = found else {
            return self.expand_special(out, name, depth);
        };
        if let Some(prev) = &m.prepend {
            self.expand_macro_into(out, Some(prev), &prev.name, depth)?;
            out.push(' ');
        }
        match &m.value {
            MacroValue::Literal(text) => out.push_str(text),
            MacroValue::Deferred(text) => self.expand_into(out, text, depth)?,
        }
        return Ok(());
    }

    /// Special variables; any other name expands to nothing.
    fn expand_special(&self, out: &mut String, name: &str, depth: usize) -> Result<(), Error> {
        match name {
            ".SUBDIRS" => {
                let dir = self.tree.directory(self.scope)?;
                let names: Vec<&str> = dir
                    .children
                    .iter()
                    .filter(|&&c| return self.tree.is_directory(c))
                    .map(|&c| return self.tree.scope(c).name.as_str())
                    .collect();
                out.push_str(&names.join(" "));
            },
            ".EXPORTS" => {
                let dir = self.tree.directory(self.scope)?;
                for (i, m) in dir.exports.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    out.push_str(&m.name);
                    out.push_str("='");
                    self.expand_macro_into(out, Some(m), &m.name, depth)?;
                    out.push('\'');
                }
            },
            ".OBJDIR" => out.push_str(&self.tree.render_objdir(self.scope)),
            ".TARGET" => out.push_str(self.require_target(name)?),
            ".IMPSRC" => {
                self.require_target(name)?;
                if let Some(dep) = &self.ctx.first {
                    out.push_str(&self.render_dependency(dep));
                }
            },
            ".ALLSRC" => {
                self.require_target(name)?;
                let all: Vec<String> = self
                    .ctx
                    .deps
                    .iter()
                    .chain(&self.ctx.inferred)
                    .map(|d| return self.render_dependency(d))
                    .collect();
                out.push_str(&all.join(" "));
            },
            ".TOPDIR" => {
                out.push('.');
                for _ in 0..self.tree.depth(self.scope) {
                    out.push_str("/..");
                }
            },
            ".MAKEFILES" => {
                let files: Vec<String> = self
                    .tree
                    .lineage(self.scope)
                    .iter()
                    .enumerate()
                    .filter_map(|(i, &id)| {
                        let makefile = self.tree.scope(id).makefile.as_ref()?;
                        return Some(format!("{}{makefile}", "../".repeat(i)));
                    })
                    .collect();
                out.push_str(&files.join(" "));
            },
            _ => {},
        }
        return Ok(());
    }

    /// The current target, or `ContextRequired` outside a recipe.
    fn require_target(&self, name: &str) -> Result<&'a str, Error> {
        return self.ctx.target.as_deref().ok_or_else(|| return Error::ContextRequired {
            name: name.to_string(),
            scope: self.scope_path(),
        });
    }

    /// A prerequisite as recipes see it: found in the object directory
    /// means prefixed with it.
    fn render_dependency(&self, dep: &Dependency) -> String {
        match self.tree.objdir_for(self.scope) {
            Some(dir) if dep.in_objdir => return format!("{}/{}", dir.display(), dep.path),
            _ => return dep.path.to_string(),
        }
    }

    /// One `:X` modifier over the whole value.
    fn apply_modifier(&self, value: &str, modifier: &str, orig: &str) -> Result<String, Error> {
        let words = value.split([' ', '\t']).filter(|w| return !w.is_empty());
        let result = match modifier {
            "U" => value.to_uppercase(),
            "L" => value.to_lowercase(),
            "F" => {
                let objdir = self.tree.render_objdir(self.scope);
                words
                    .map(|w| {
                        if self.tree.stamp(self.scope, self.prefix, w).in_objdir {
                            return format!("{objdir}/{w}");
                        }
                        return w.to_string();
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            },
            "E" => words.filter_map(extension).filter(|e| return !e.is_empty()).collect::<Vec<_>>().join(" "),
            "R" => words.map(strip_extension).collect::<Vec<_>>().join(" "),
            "H" => words.map(dirname).collect::<Vec<_>>().join(" "),
            "T" => words.map(basename).collect::<Vec<_>>().join(" "),
            _ => {
                let mut chars = modifier.chars();
                let kind = chars.next();
                let arg = chars.as_str();
                match kind {
                    Some('M') => {
                        let pattern = self.pattern(arg, modifier, orig)?;
                        words.filter(|w| return pattern.matches(w)).collect::<Vec<_>>().join(" ")
                    },
                    Some('N') => {
                        let pattern = self.pattern(arg, modifier, orig)?;
                        words.filter(|w| return !pattern.matches(w)).collect::<Vec<_>>().join(" ")
                    },
                    Some('J') => words.collect::<Vec<_>>().join(arg),
                    _ => return Err(self.invalid_modifier(modifier, orig)),
                }
            },
        };
        return Ok(result);
    }

    /// Glob for `:M` and `:N`.
    fn pattern(&self, glob: &str, modifier: &str, orig: &str) -> Result<Pattern, Error> {
        return Pattern::new(glob).map_err(|_| return self.invalid_modifier(modifier, orig));
    }

    /// `InvalidModifier` for the expansion starting at `orig`.
    fn invalid_modifier(&self, modifier: &str, orig: &str) -> Error {
        return Error::InvalidModifier {
            modifier: modifier.to_string(),
            scope: self.scope_path(),
            text: orig.to_string(),
        };
    }

    /// Scope path for diagnostics.
    fn scope_path(&self) -> String {
        return self.tree.display_path(self.scope);
    }
}

/// Replace a trailing `old` in the whole value with `new`.
fn replace_suffix(value: &str, old: &str, new: &str) -> String {
    return match value.strip_suffix(old) {
        Some(head) => format!("{head}{new}"),
        None => value.to_string(),
    };
}

/// Text after the last `.` of the final path segment.
fn extension(word: &str) -> Option<&str> {
    let (_, ext) = word.rsplit_once('.')?;
    if ext.contains('/') {
        return None;
    }
    return Some(ext);
}

/// Drop the extension of the final path segment.
fn strip_extension(word: &str) -> &str {
    return match word.rsplit_once('.') {
        Some((head, ext)) if !ext.contains('/') => head,
        _ => word,
    };
}

/// POSIX `dirname`.
fn dirname(word: &str) -> &str {
    let trimmed = word.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    return match trimmed.rsplit_once('/') {
        None => ".",
        Some((head, _)) => {
            let head = head.trim_end_matches('/');
            if head.is_empty() { "/" } else { head }
        },
    };
}

/// POSIX `basename`.
fn basename(word: &str) -> &str {
    let trimmed = word.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    return match trimmed.rsplit_once('/') {
        Some((_, tail)) => tail,
        None => trimmed,
    };
}
