//! Core domain types for bmk scopes: macros, files, rules and timestamps.

use std::rc::Rc;
use std::time::SystemTime;

use crate::path::Path;

/// Index of a rule in the scope tree's rule arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleId(
    /// Position in the arena.
    pub usize,
);

/// Index of an inference rule in the scope tree's inference arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceId(
    /// Position in the arena.
    pub usize,
);

/// Stored text of a macro, tagged by when it is expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroValue {
    /// Already expanded; used verbatim.
    Literal(String),
    /// Expanded at every use against the caller's scope and context.
    Deferred(String),
}

impl MacroValue {
    /// Raw stored text regardless of tag.
    pub fn text(&self) -> &str {
        return match self {
            Self::Literal(text) | Self::Deferred(text) => text,
        };
    }
}

/// A named text variable. `prepend` links the definition a `+=`
/// extended, so each use renders the whole chain.
#[derive(Debug, Clone)]
pub struct Macro {
    /// Documentation from a preceding `##` line.
    pub help: Option<String>,
    /// Name restricted to `[A-Za-z0-9_.]`.
    pub name: String,
    /// Earlier definition rendered before this one.
    pub prepend: Option<Rc<Macro>>,
    /// Stored value.
    pub value: MacroValue,
}

impl Macro {
    /// A literal macro with no help or chain, as defined on the command line.
    pub fn literal(name: &str, value: &str) -> Self {
        return Self {
            help: None,
            name: name.to_string(),
            prepend: None,
            value: MacroValue::Literal(value.to_string()),
        };
    }
}

/// Whether `name` is a legal macro name.
pub fn is_macro_name(name: &str) -> bool {
    return !name.is_empty() && name.chars().all(is_macro_char);
}

/// Characters allowed in macro names.
pub fn is_macro_char(ch: char) -> bool {
    return ch.is_ascii_alphanumeric() || ch == '_' || ch == '.';
}

/// Ordered recipe lines. An empty recipe marks a dependency-only target.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    /// Recipe lines without the leading tab.
    pub recipe: Vec<String>,
}

/// Modification time as observed on disk, and where it was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    /// Found under the shadow object directory rather than the source tree.
    pub in_objdir: bool,
    /// Modification time, `UNIX_EPOCH` when the file is absent.
    pub time: SystemTime,
}

impl Stamp {
    /// Sentinel for a file that exists nowhere.
    pub const MISSING: Self = Self {
        in_objdir: false,
        time: SystemTime::UNIX_EPOCH,
    };

    /// The file was found somewhere.
    pub fn exists(&self) -> bool {
        return self.time > SystemTime::UNIX_EPOCH;
    }
}

/// A prerequisite path. `in_objdir` is filled in when the dependency is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// The dependency was found or built under the object directory.
    pub in_objdir: bool,
    /// Path relative to the declaring scope.
    pub path: Path,
}

impl Dependency {
    /// A dependency not yet located.
    pub const fn new(path: Path) -> Self {
        return Self { in_objdir: false, path };
    }
}

/// An entry in a directory's file table.
#[derive(Debug, Clone)]
pub struct File {
    /// Explicit dependencies in declaration order.
    pub deps: Vec<Dependency>,
    /// Set once a build attempt fails; never retried in the same run.
    pub failed: bool,
    /// Documentation from a preceding `##` line.
    pub help: Option<String>,
    /// Inference rule that supplied this file's recipe, if any.
    pub inference: Option<InferenceId>,
    /// Target name, unique within the scope.
    pub name: String,
    /// Owning rule; `None` for files only known from the filesystem.
    pub rule: Option<RuleId>,
    /// Cached timestamp.
    pub stamp: Stamp,
}

impl File {
    /// A file with no dependencies yet.
    pub fn new(name: &str, rule: Option<RuleId>, stamp: Stamp) -> Self {
        return Self {
            deps: Vec::new(),
            failed: false,
            help: None,
            inference: None,
            name: name.to_string(),
            rule,
            stamp,
        };
    }
}

/// A suffix rule such as `.c.o`, turning `base.c` into `base.o`.
#[derive(Debug, Clone)]
pub struct InferenceRule {
    /// Prerequisites shared by every instantiated file.
    pub deps: Vec<Dependency>,
    /// Source suffix including the dot.
    pub from: String,
    /// Recipe shared with instantiated files.
    pub rule: RuleId,
    /// Target suffix including the dot, or empty.
    pub to: String,
}

/// Raw text captured between `.template NAME` and `.endtemplate`.
#[derive(Debug, Clone)]
pub struct Template {
    /// Name given to `.expand`.
    pub name: String,
    /// Body lines, each newline-terminated.
    pub text: String,
}
