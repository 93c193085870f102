//! Crate-level error types for bmk diagnostics.

use std::path::PathBuf;

/// Fatal conditions that end the whole run. A recipe exiting non-zero is not
/// an error; the build engine reports that as a failed target instead.
#[allow(clippy::error_impl_error, reason = "crate-internal error type in binary")]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A build description was handed to the parser a second time.
    #[error("{}: parsing this file again", path.display())]
    AlreadyParsed {
        /// Build-description file that was already parsed.
        path: PathBuf,
    },

    /// `.if` nesting exceeded the conditional stack.
    #[error("maximum .if depth of {limit} reached")]
    ConditionalOverflow {
        /// Maximum number of nested conditionals.
        limit: usize,
    },

    /// `.elif`, `.else` or `.endif` appeared without an open `.if`.
    #[error(".{directive} without .if")]
    ConditionalUnderflow {
        /// Directive that found the stack empty.
        directive: String,
    },

    /// A special macro that needs a build target was used outside a recipe.
    #[error("{scope}: cannot use ${{{name}}} here")]
    ContextRequired {
        /// Special macro name such as `.TARGET`.
        name: String,
        /// Scope path where the expansion happened.
        scope: String,
    },

    /// A target was reached again while its own dependencies were building.
    #[error("{scope}: dependency cycle through {name}")]
    DependencyCycle {
        /// Target reached twice.
        name: String,
        /// Scope that owns the target.
        scope: String,
    },

    /// A `.SUBDIRS:` entry does not exist on disk.
    #[error("directory not found: {name}")]
    DirectoryNotFound {
        /// Declared subdirectory name.
        name: String,
        /// Filesystem path that was checked.
        path: PathBuf,
    },

    /// A `..` component climbed above the top-level scope.
    #[error("{scope}: path escapes the project root")]
    EscapesRoot {
        /// Scope path where the walk stopped.
        scope: String,
    },

    /// Nested `${...}` expansion exceeded the recursion bound.
    #[error("reached maximum expansion depth in '{text}'")]
    ExpansionDepth {
        /// Text being expanded when the bound was hit.
        text: String,
    },

    /// The retired bare `.include` directive.
    #[error("please use .SUBDIRS: or .FOREIGN: now")]
    IncludeDirective,

    /// A mandatory `include` names a file that cannot be read.
    #[error("cannot include {}", path.display())]
    IncludeNotFound {
        /// Resolved path of the included file.
        path: PathBuf,
    },

    /// Chained inference rules kept producing new source names.
    #[error("{scope}: inference chain too deep while looking for {name}")]
    InferenceLoop {
        /// Target that started the chain.
        name: String,
        /// Scope being searched.
        scope: String,
    },

    /// `$` followed by a character that starts no substitution.
    #[error("{scope}: syntax error: invalid escape sequence: {sequence}")]
    InvalidEscape {
        /// Scope path where the expansion happened.
        scope: String,
        /// Offending text starting at the `$`.
        sequence: String,
    },

    /// A `${...}` form that is not terminated correctly.
    #[error("{scope}: invalid macro expansion: '${{{text}'")]
    InvalidExpansion {
        /// Scope path where the expansion happened.
        scope: String,
        /// Text following the opening brace.
        text: String,
    },

    /// Malformed `.if`/`.elif` expression.
    #[error("invalid expression: '{text}'")]
    InvalidExpression {
        /// Remaining expression text at the point of failure.
        text: String,
    },

    /// Assignment to a name outside `[A-Za-z0-9_.]`.
    #[error("invalid macro name: '{name}'")]
    InvalidMacroName {
        /// Rejected name.
        name: String,
    },

    /// Unknown `${name:modifier}` or a bad glob pattern.
    #[error("{scope}: invalid modifier: ':{modifier}' in '${{{text}'")]
    InvalidModifier {
        /// Modifier text after the colon.
        modifier: String,
        /// Scope path where the expansion happened.
        scope: String,
        /// Text following the opening brace.
        text: String,
    },

    /// A target path descends through a scope that is not a directory.
    #[error("{scope}: invalid path")]
    InvalidPath {
        /// Scope that cannot contain children.
        scope: String,
    },

    /// An operation needed a different kind of scope.
    #[error("{scope}: invalid scope type, expected {expected}")]
    InvalidScopeType {
        /// Scope kind the operation needed.
        expected: &'static str,
        /// Scope path of the mismatching scope.
        scope: String,
    },

    /// A target path names a subdirectory that was never declared.
    #[error("{scope}: invalid subdir: {name}")]
    InvalidSubdir {
        /// Missing child name.
        name: String,
        /// Scope that was searched.
        scope: String,
    },

    /// Underlying I/O error from the filesystem.
    #[error("io: {0}")]
    Io(
        /// The wrapped I/O error.
        #[from]
        std::io::Error,
    ),

    /// An error raised while parsing a specific line.
    #[error("{file}:{line}: {source}")]
    Located {
        /// Build-description file or template being parsed.
        file: String,
        /// One-based line number of the logical line.
        line: usize,
        /// The underlying error.
        source: Box<Error>,
    },

    /// No build description was found in the working directory.
    #[error("failed to find or parse {name}")]
    MakefileNotFound {
        /// Build-description filename that was looked for.
        name: String,
    },

    /// A stale foreign scope has no `name!` rule.
    #[error("{scope}: missing '{name}!' rule")]
    MissingExecRule {
        /// Foreign scope name.
        name: String,
        /// Scope that declared it.
        scope: String,
    },

    /// A file exists in the table but has no recipe and no file on disk.
    #[error("{scope}: no rule to build: {name}")]
    NoRuleToBuild {
        /// Target name.
        name: String,
        /// Scope that owns the target.
        scope: String,
    },

    /// A requested name is no file, child scope or inferable target.
    #[error("{scope}: no such file: {name}")]
    NoSuchFile {
        /// Requested target name.
        name: String,
        /// Scope that was searched.
        scope: String,
    },

    /// A `name?`/`name!` rule names a directory scope.
    #[error("{scope}: not a foreign subdir: {name}")]
    NotAForeignScope {
        /// Child scope name.
        name: String,
        /// Scope that declared the rule.
        scope: String,
    },

    /// A `name?`/`name!` rule names no declared child scope.
    #[error("{scope}: not a subdir: {name}")]
    NotASubdir {
        /// Name with the `?`/`!` suffix stripped.
        name: String,
        /// Scope that declared the rule.
        scope: String,
    },

    /// A scope has no files and no default target.
    #[error("{scope}: nothing to build")]
    NothingToBuild {
        /// Scope that was asked for its default target.
        scope: String,
    },

    /// The shadow object directory path is occupied by something else.
    #[error("{}: not a directory", path.display())]
    ObjdirNotDirectory {
        /// Path that should have been a directory.
        path: PathBuf,
    },

    /// A tab-indented line appeared while no rule was open.
    #[error("recipe line outside of a rule")]
    RecipeWithoutRule,

    /// A built-in pattern failed to compile.
    #[error("regex: {0}")]
    Regex(
        /// The wrapped regex error.
        #[from]
        regex::Error,
    ),

    /// `$(...)` is reserved syntax.
    #[error("{scope}: syntax error: $(...) syntax is reserved for future use, please use ${{...}} instead")]
    ReservedSyntax {
        /// Scope path where the expansion happened.
        scope: String,
    },

    /// The shell could not be started.
    #[error("cannot run '{program}': {source}")]
    Spawn {
        /// Conventional exit status: 126 for unusable, 127 for missing.
        code: u8,
        /// Shell program that failed to start.
        program: String,
        /// The wrapped I/O error.
        source: std::io::Error,
    },

    /// `include`/`.expand` nested too deeply.
    #[error("maximum include depth of {limit} reached")]
    TemplateNesting {
        /// Maximum nesting depth.
        limit: usize,
    },

    /// TOML deserialization failed.
    #[error("toml deserialize: {0}")]
    TomlDe(
        /// The wrapped TOML deserialization error.
        #[from]
        toml::de::Error,
    ),

    /// `.EXPORTS:` named a macro that is not defined.
    #[error("no such macro: '{name}'")]
    UndefinedExport {
        /// Macro name.
        name: String,
    },

    /// `.expand` named no captured template.
    #[error("no such template: {name}")]
    UnknownTemplate {
        /// Template name.
        name: String,
    },

    /// End of input reached with `.if` blocks still open.
    #[error("{depth} unterminated .if block(s)")]
    UnterminatedConditional {
        /// Number of open conditionals.
        depth: usize,
    },
}

impl Error {
    /// Attach a source location. Errors that already carry one keep the
    /// innermost location.
    pub fn at(self, file: &str, line: usize) -> Self {
        if matches!(self, Self::Located { .. }) {
            return self;
        }
        return Self::Located {
            file: file.to_string(),
            line,
            source: Box::new(self),
        };
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        return match self {
            Self::Located { source, .. } => source.exit_code(),
            Self::Spawn { code, .. } => *code,
            _ => 1,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_is_attached_once() {
        let e = Error::RecipeWithoutRule.at("Mkfile", 3).at("Outer", 9);
        assert_eq!(e.to_string(), "Mkfile:3: recipe line outside of a rule");
    }

    #[test]
    fn spawn_exit_code_passes_through_location() {
        let e = Error::Spawn {
            code: 127,
            program: "nosh".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        }
        .at("Mkfile", 1);
        assert_eq!(e.exit_code(), 127);
        assert_eq!(Error::RecipeWithoutRule.exit_code(), 1);
    }
}
