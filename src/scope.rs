//! The scope tree: an arena of directory and foreign scopes mirroring the
//! project layout, plus the rules, inference rules and global macros they
//! reference.

use std::path::PathBuf;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::error::Error;
use crate::path::Path;
use crate::types::{File, InferenceId, InferenceRule, Macro, Rule, RuleId, Stamp, Template};

/// Index of a scope in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeId(pub usize);

/// A file entry addressed by owning scope and position in its file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRef {
    /// Position in the owning directory's file table.
    pub index: usize,
    /// Owning directory scope.
    pub scope: ScopeId,
}

/// A node in the build tree.
#[derive(Debug)]
pub struct Scope {
    /// Object directory materialized for this scope.
    pub created: bool,
    /// Directory or foreign payload.
    pub kind: ScopeKind,
    /// Build-description filename; `None` for foreign scopes.
    pub makefile: Option<String>,
    /// Directory name; the top scope keeps its real basename.
    pub name: String,
    /// Non-owning back-reference; `None` at the top of the project.
    pub parent: Option<ScopeId>,
}

/// What a scope holds.
#[derive(Debug)]
pub enum ScopeKind {
    /// A directory with its own build description.
    Directory(Directory),
    /// An externally built subproject.
    Foreign(Foreign),
}

/// Parsed contents of a directory scope.
#[derive(Debug, Default)]
pub struct Directory {
    /// Child scopes in declaration order.
    pub children: Vec<ScopeId>,
    /// Target named by `.DEFAULT:`, unexpanded.
    pub default_target: Option<String>,
    /// Exported macros in export order.
    pub exports: Vec<Rc<Macro>>,
    /// File table in insertion order.
    pub files: Vec<File>,
    /// Inference rules in definition order.
    pub inferences: Vec<InferenceId>,
    /// Macro definitions in definition order; lookups scan from the end.
    pub macros: Vec<Rc<Macro>>,
    /// The build description has been read.
    pub parsed: bool,
    /// Captured `.template` bodies in definition order.
    pub templates: Vec<Template>,
}

/// A subproject built through `name?` (test) and `name!` (exec) rules
/// declared in the parent directory.
#[derive(Debug, Default)]
pub struct Foreign {
    /// `name!`: builds the subproject.
    pub exec: Option<FileRef>,
    /// `name?`: succeeds when the subproject is up to date.
    pub test: Option<FileRef>,
}

/// Arena owning every scope, rule and inference rule of a run.
pub struct ScopeTree {
    /// Built-in and command-line macros.
    globals: Vec<Rc<Macro>>,
    /// Inference rules of all scopes, addressed by [`InferenceId`].
    inferences: Vec<InferenceRule>,
    /// Absolute object directory root.
    objdir: Option<PathBuf>,
    /// Rules of all scopes, addressed by [`RuleId`].
    rules: Vec<Rule>,
    /// Scopes, addressed by [`ScopeId`].
    scopes: Vec<Scope>,
}

impl ScopeTree {
    /// Empty tree. `globals` are searched last, newest first.
    pub const fn new(objdir: Option<PathBuf>, globals: Vec<Rc<Macro>>) -> Self {
        return Self {
            globals,
            inferences: Vec::new(),
            objdir,
            rules: Vec::new(),
            scopes: Vec::new(),
        };
    }

    // ── Arena access ──────────────────────────────────────────────────

    /// Create a scope with a parent link. It is not listed among the
    /// parent's children until [`Self::attach_child`] is called.
    pub fn add_scope(&mut self, name: &str, parent: Option<ScopeId>, kind: ScopeKind, makefile: Option<String>) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(Scope {
            created: false,
            kind,
            makefile,
            name: name.to_string(),
            parent,
        });
        return id;
    }

    /// List `child` under `parent`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidScopeType` if `parent` is not a directory.
    pub fn attach_child(&mut self, parent: ScopeId, child: ScopeId) -> Result<(), Error> {
        self.directory_mut(parent)?.children.push(child);
        return Ok(());
    }

    /// Scope behind an id.
    #[allow(clippy::indexing_slicing, reason = "ids are only minted by this arena and entries are never removed")]
    pub fn scope(&self, id: ScopeId) -> &Scope {
        return &self.scopes[id.0];
    }

    /// Mutable scope behind an id.
    #[allow(clippy::indexing_slicing, reason = "ids are only minted by this arena and entries are never removed")]
    pub fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        return &mut self.scopes[id.0];
    }

    /// Enclosing scope, `None` at the top.
    pub fn parent(&self, id: ScopeId) -> Option<ScopeId> {
        return self.scope(id).parent;
    }

    /// Directory payload of a scope.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidScopeType` for foreign scopes.
    pub fn directory(&self, id: ScopeId) -> Result<&Directory, Error> {
        return match &self.scope(id).kind {
            ScopeKind::Directory(dir) => Ok(dir),
            ScopeKind::Foreign(_) => Err(self.not_a_directory(id)),
        };
    }

    /// Mutable directory payload of a scope.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidScopeType` for foreign scopes.
    pub fn directory_mut(&mut self, id: ScopeId) -> Result<&mut Directory, Error> {
        if !self.is_directory(id) {
            return Err(self.not_a_directory(id));
        }
        let ScopeKind::Directory(dir) = &mut self.scope_mut(id).kind else {
            return Err(Error::InvalidScopeType { expected: "directory", scope: String::new() });
        };
        return Ok(dir);
    }

    /// The scope holds a build description.
    pub fn is_directory(&self, id: ScopeId) -> bool {
        return matches!(self.scope(id).kind, ScopeKind::Directory(_));
    }

    /// `InvalidScopeType` naming `id`.
    fn not_a_directory(&self, id: ScopeId) -> Error {
        return Error::InvalidScopeType {
            expected: "directory",
            scope: self.display_path(id),
        };
    }

    /// Store a rule shared by the targets of one line.
    pub fn add_rule(&mut self, rule: Rule) -> RuleId {
        let id = RuleId(self.rules.len());
        self.rules.push(rule);
        return id;
    }

    /// Rule behind an id.
    #[allow(clippy::indexing_slicing, reason = "ids are only minted by this arena and entries are never removed")]
    pub fn rule(&self, id: RuleId) -> &Rule {
        return &self.rules[id.0];
    }

    /// Mutable rule behind an id.
    #[allow(clippy::indexing_slicing, reason = "ids are only minted by this arena and entries are never removed")]
    pub fn rule_mut(&mut self, id: RuleId) -> &mut Rule {
        return &mut self.rules[id.0];
    }

    /// Store an inference rule.
    pub fn add_inference(&mut self, inference: InferenceRule) -> InferenceId {
        let id = InferenceId(self.inferences.len());
        self.inferences.push(inference);
        return id;
    }

    /// Inference rule behind an id.
    #[allow(clippy::indexing_slicing, reason = "ids are only minted by this arena and entries are never removed")]
    pub fn inference(&self, id: InferenceId) -> &InferenceRule {
        return &self.inferences[id.0];
    }

    /// Mutable inference rule behind an id.
    #[allow(clippy::indexing_slicing, reason = "ids are only minted by this arena and entries are never removed")]
    pub fn inference_mut(&mut self, id: InferenceId) -> &mut InferenceRule {
        return &mut self.inferences[id.0];
    }

    /// File entry behind a reference.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidScopeType` if the owning scope is foreign.
    #[allow(clippy::indexing_slicing, reason = "file references are only minted from the file table, which never shrinks")]
    pub fn file(&self, at: FileRef) -> Result<&File, Error> {
        return Ok(&self.directory(at.scope)?.files[at.index]);
    }

    /// Mutable file entry behind a reference.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidScopeType` if the owning scope is foreign.
    #[allow(clippy::indexing_slicing, reason = "file references are only minted from the file table, which never shrinks")]
    pub fn file_mut(&mut self, at: FileRef) -> Result<&mut File, Error> {
        return Ok(&mut self.directory_mut(at.scope)?.files[at.index]);
    }

    /// Append a file to a directory's table.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidScopeType` if `scope` is foreign.
    pub fn add_file(&mut self, scope: ScopeId, file: File) -> Result<FileRef, Error> {
        let files = &mut self.directory_mut(scope)?.files;
        let at = FileRef { index: files.len(), scope };
        files.push(file);
        return Ok(at);
    }

    // ── Lookups ───────────────────────────────────────────────────────

    /// Resolve a macro: the scope's own definitions newest first, then the
    /// exports of each ancestor nearest first, then the globals newest first.
    pub fn find_macro(&self, scope: ScopeId, name: &str) -> Option<Rc<Macro>> {
        if let Ok(dir) = self.directory(scope) {
            if let Some(m) = dir.macros.iter().rev().find(|m| return m.name == name) {
                return Some(Rc::clone(m));
            }
        }

        let mut cursor = self.parent(scope);
        while let Some(id) = cursor {
            let exported = self.directory(id).ok().and_then(|dir| return dir.exports.iter().find(|m| return m.name == name));
            if let Some(m) = exported {
                return Some(Rc::clone(m));
            }
            cursor = self.parent(id);
        }

        return self.globals.iter().rev().find(|m| return m.name == name).map(Rc::clone);
    }

    /// Find a template in the scope or any ancestor, newest first.
    pub fn find_template(&self, scope: ScopeId, name: &str) -> Option<&Template> {
        let mut cursor = Some(scope);
        while let Some(id) = cursor {
            let found = self.directory(id).ok().and_then(|dir| return dir.templates.iter().rev().find(|t| return t.name == name));
            if found.is_some() {
                return found;
            }
            cursor = self.parent(id);
        }
        return None;
    }

    /// Index of the most recently added file called `name`.
    pub fn find_file(&self, scope: ScopeId, name: &str) -> Option<usize> {
        let dir = self.directory(scope).ok()?;
        return dir.files.iter().rposition(|f| return f.name == name);
    }

    /// Declared child scope called `name`.
    pub fn find_child(&self, scope: ScopeId, name: &str) -> Option<ScopeId> {
        let dir = self.directory(scope).ok()?;
        return dir.children.iter().copied().find(|&c| return self.scope(c).name == name);
    }

    /// The scope followed by its ancestors, nearest first.
    pub fn lineage(&self, scope: ScopeId) -> Vec<ScopeId> {
        let mut chain = vec![scope];
        let mut cursor = self.parent(scope);
        while let Some(id) = cursor {
            chain.push(id);
            cursor = self.parent(id);
        }
        return chain;
    }

    /// Number of ancestors.
    pub fn depth(&self, scope: ScopeId) -> usize {
        return self.lineage(scope).len().saturating_sub(1);
    }

    /// Diagnostic path from the top scope: `.`, `./lib`, `./lib/sub`.
    pub fn display_path(&self, scope: ScopeId) -> String {
        let mut names: Vec<&str> = self.lineage(scope).iter().map(|&id| return self.scope(id).name.as_str()).collect();
        names.pop();
        names.reverse();
        let mut out = String::from(".");
        for name in names {
            out.push('/');
            out.push_str(name);
        }
        return out;
    }

    // ── Object directory and timestamps ───────────────────────────────

    /// Shadow directory mirroring this scope, if an object directory is set.
    pub fn objdir_for(&self, scope: ScopeId) -> Option<PathBuf> {
        let root = self.objdir.as_ref()?;
        let mut names: Vec<&str> = self.lineage(scope).iter().map(|&id| return self.scope(id).name.as_str()).collect();
        names.pop();
        names.reverse();
        let mut dir = root.clone();
        for name in names {
            dir.push(name);
        }
        return Some(dir);
    }

    /// `.OBJDIR` rendering: the shadow directory, or `.` without one.
    pub fn render_objdir(&self, scope: ScopeId) -> String {
        return self
            .objdir_for(scope)
            .map_or_else(|| return ".".to_string(), |p| return p.display().to_string());
    }

    /// Look up `name` under the source directory `dir`, then under the
    /// scope's shadow directory. Absence is reported as `Stamp::MISSING`.
    pub fn stamp(&self, scope: ScopeId, dir: &Path, name: &str) -> Stamp {
        if let Some(time) = modified(&dir.file(name)) {
            trace!(name, "found");
            return Stamp { in_objdir: false, time };
        }
        if let Some(time) = self.objdir_for(scope).and_then(|shadow| return modified(&shadow.join(name))) {
            trace!(name, "found in objdir");
            return Stamp { in_objdir: true, time };
        }
        trace!(name, "not found");
        return Stamp::MISSING;
    }

    /// Create the scope's shadow directory once per run.
    ///
    /// # Errors
    ///
    /// Returns `Error::ObjdirNotDirectory` if a non-directory occupies the
    /// path, or `Error::Io` if creation fails.
    pub fn ensure_objdir(&mut self, scope: ScopeId) -> Result<(), Error> {
        if self.scope(scope).created {
            return Ok(());
        }
        if let Some(dir) = self.objdir_for(scope) {
            debug!(dir = %dir.display(), "mkdir");
            if dir.exists() && !dir.is_dir() {
                return Err(Error::ObjdirNotDirectory { path: dir });
            }
            std::fs::create_dir_all(&dir)?;
        }
        self.scope_mut(scope).created = true;
        return Ok(());
    }
}

/// Modification time without following a final symlink.
fn modified(path: &std::path::Path) -> Option<std::time::SystemTime> {
    return std::fs::symlink_metadata(path).and_then(|m| return m.modified()).ok();
}
