use std::io::Write;

use crate::error::Error;
use crate::parser::Parser;
use crate::path::Path;
use crate::scope::{ScopeId, ScopeKind, ScopeTree};
use crate::shell::ShellExecutor;

/// Width of the name column in the help page.
const HELP_COLUMN: usize = 28;

/// Flag and description rows of the help page.
const OPTIONS: &[(&str, &str)] = &[
    ("-C dir", "chdir(dir)"),
    ("-f file", "read `file` instead of \"Mkfile\""),
    ("-o objdir", "put build artifacts into objdir"),
    ("-V var", "print expanded version of var"),
    ("-h", "print help page"),
    ("-hv", "print help page, recursively"),
    ("-p", "dump tree"),
    ("-pv", "dump tree, recursively"),
    ("-s", "do not echo commands"),
    ("-k", "continue processing after errors are encountered"),
    ("-S", "stop processing when errors are encountered (default)"),
    ("-v", "verbose output"),
];

/// Renders the help page and tree dump for the scope the tool started in.
/// Sub-scopes reached while recursing are parsed on demand.
pub struct Report<'a> {
    /// Runs `!=` assignments of sub-scopes parsed while recursing.
    shell: &'a dyn ShellExecutor,
    /// Tree being reported.
    tree: &'a mut ScopeTree,
    /// Recurse into directory children.
    verbose: bool,
}

impl<'a> Report<'a> {
    /// Reporter over `tree`.
    pub const fn new(tree: &'a mut ScopeTree, shell: &'a dyn ShellExecutor, verbose: bool) -> Self {
        return Self { shell, tree, verbose };
    }

    // ── Help ──────────────────────────────────────────────────────────

    /// Usage, options and, when a build file was found, the documented
    /// macros and targets of `scope`, whose directory is `start`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if writing fails, or parse errors from
    /// sub-scopes loaded while recursing.
    pub fn help(&mut self, out: &mut impl Write, program: &str, scope: Option<ScopeId>, start: &Path) -> Result<(), Error> {
        writeln!(out, "{}", usage(program))?;
        writeln!(out, "\nOptions:")?;
        for (flag, text) in OPTIONS {
            writeln!(out, "  {flag:<HELP_COLUMN$}- {text}")?;
        }

        if let Some(scope) = scope {
            writeln!(out, "\nMacros:")?;
            for m in &self.tree.directory(scope)?.macros {
                if let Some(help) = &m.help {
                    writeln!(out, "  {:<HELP_COLUMN$}- {help}", m.name)?;
                }
            }
            writeln!(out, "\nTargets:")?;
            self.help_files(out, scope, start, &Path::root())?;
        }

        writeln!(out, "\nbmk v{}", env!("CARGO_PKG_VERSION"))?;
        return Ok(());
    }

    /// Documented files of `scope`, named relative to the starting scope.
    fn help_files(&mut self, out: &mut impl Write, scope: ScopeId, dir: &Path, prefix: &Path) -> Result<(), Error> {
        Parser::new(&mut *self.tree, self.shell).load_directory(scope, dir)?;
        let directory = self.tree.directory(scope)?;
        for file in &directory.files {
            let Some(help) = &file.help else {
                continue;
            };
            let name = if prefix.is_empty() {
                file.name.clone()
            } else {
                format!("{prefix}/{}", file.name)
            };
            writeln!(out, "  {name:<HELP_COLUMN$}- {help}")?;
        }

        if !self.verbose {
            return Ok(());
        }
        for (child, name) in self.subdirectories(scope)? {
            self.help_files(out, child, &dir.join_name(&name), &prefix.join_name(&name))?;
        }
        return Ok(());
    }

    // ── Dump ──────────────────────────────────────────────────────────

    /// Print `scope` back in build-file syntax: default target, macros,
    /// files with their recipes, inference rules and children. Verbose
    /// mode recurses into directory children.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidScopeType` for a foreign scope, `Error::Io`
    /// if writing fails, or parse errors from loaded sub-scopes.
    pub fn dump(&mut self, out: &mut impl Write, scope: ScopeId, prefix: &Path) -> Result<(), Error> {
        Parser::new(&mut *self.tree, self.shell).load_directory(scope, prefix)?;
        if self.verbose {
            writeln!(out, "=== {}", self.tree.display_path(scope))?;
        }
        let directory = self.tree.directory(scope)?;

        if let Some(default) = &directory.default_target {
            writeln!(out, ".DEFAULT: {default}")?;
        }

        for m in &directory.macros {
            if let Some(help) = &m.help {
                writeln!(out, "\n## {help}")?;
            }
            let op = if m.prepend.is_some() { "+=" } else { "=" };
            writeln!(out, "{} {op} {}", m.name, m.value.text())?;
        }
        writeln!(out)?;

        for file in &directory.files {
            if let Some(help) = &file.help {
                writeln!(out, "## {help}")?;
            }
            write!(out, "{}:", file.name)?;
            let inferred = file.inference.map(|id| return &self.tree.inference(id).deps);
            for dep in file.deps.iter().chain(inferred.into_iter().flatten()) {
                write!(out, " {}", dep.path)?;
            }
            writeln!(out)?;
            if let Some(rule) = file.rule {
                for line in &self.tree.rule(rule).recipe {
                    writeln!(out, "\t{line}")?;
                }
            }
            writeln!(out)?;
        }

        for &id in &directory.inferences {
            let inference = self.tree.inference(id);
            write!(out, "{}{}:", inference.from, inference.to)?;
            for dep in &inference.deps {
                write!(out, " {}", dep.path)?;
            }
            writeln!(out)?;
            let recipe = &self.tree.rule(inference.rule).recipe;
            if !recipe.is_empty() {
                for line in recipe {
                    writeln!(out, "\t{line}")?;
                }
                writeln!(out)?;
            }
        }

        for &child in &directory.children {
            let child = self.tree.scope(child);
            let kind = match child.kind {
                ScopeKind::Directory(_) => "DIR",
                ScopeKind::Foreign(_) => "FOREIGN",
            };
            writeln!(out, ".include {}, {kind}", child.name)?;
        }

        if !self.verbose {
            return Ok(());
        }
        for (child, name) in self.subdirectories(scope)? {
            writeln!(out)?;
            self.dump(out, child, &prefix.join_name(&name))?;
        }
        return Ok(());
    }

    /// Directory children of `scope` with their names, in declaration order.
    fn subdirectories(&self, scope: ScopeId) -> Result<Vec<(ScopeId, String)>, Error> {
        let children = self
            .tree
            .directory(scope)?
            .children
            .iter()
            .filter(|&&id| return self.tree.is_directory(id))
            .map(|&id| return (id, self.tree.scope(id).name.clone()))
            .collect();
        return Ok(children);
    }
}

/// One-line synopsis.
pub fn usage(program: &str) -> String {
    return format!("usage: {program} [-hkpsSv] [-C dir] [-f makefile] [-o objdir] [-V var] [target...]");
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::shell::RecordingShell;
    use crate::types::Macro;

    fn project(files: &[(&str, &str)]) -> (tempfile::TempDir, ScopeTree, ScopeId, Path) {
        let tmp = tempfile::tempdir().unwrap();
        for (name, text) in files {
            let path = tmp.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, text).unwrap();
        }
        let mut tree = ScopeTree::new(None, vec![Rc::new(Macro::literal("SHELL", "sh"))]);
        let shell = RecordingShell::default();
        let start = Path::parse(&tmp.path().display().to_string());
        let root = Parser::new(&mut tree, &shell).parse_recursive(&start, "Mkfile").unwrap().unwrap();
        (tmp, tree, root, start)
    }

    fn help(tree: &mut ScopeTree, scope: Option<ScopeId>, start: &Path, verbose: bool) -> String {
        let shell = RecordingShell::default();
        let mut out = Vec::new();
        Report::new(tree, &shell, verbose).help(&mut out, "bmk", scope, start).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn dump(tree: &mut ScopeTree, scope: ScopeId, prefix: &Path, verbose: bool) -> String {
        let shell = RecordingShell::default();
        let mut out = Vec::new();
        Report::new(tree, &shell, verbose).dump(&mut out, scope, prefix).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn help_without_build_file_lists_only_options() {
        let mut tree = ScopeTree::new(None, Vec::new());
        let text = help(&mut tree, None, &Path::root(), false);
        assert!(text.starts_with("usage: bmk [-hkpsSv]"));
        assert!(text.contains("  -k                          - continue processing"));
        assert!(!text.contains("Macros:"));
    }

    #[test]
    fn help_lists_documented_macros_and_targets() {
        let (_tmp, mut tree, root, start) = project(&[(
            "Mkfile",
            "## C compiler\nCC = cc\nCFLAGS = -O2\n## build everything\nall: prog\n\ttrue\nprog:\n\ttrue\n",
        )]);
        let text = help(&mut tree, Some(root), &start, false);
        assert!(text.contains("\nMacros:\n  CC                          - C compiler\n"));
        assert!(!text.contains("CFLAGS"));
        assert!(text.contains("\nTargets:\n  all                         - build everything\n"));
        assert!(!text.contains("  prog"));
    }

    #[test]
    fn verbose_help_recurses_into_subdirectories() {
        let files = [
            ("Mkfile", ".SUBDIRS: lib\n## top\nall:\n"),
            ("lib/Mkfile", "## the library\nlibx.a:\n\tar rc $@\n"),
        ];
        let (_tmp, mut tree, root, start) = project(&files);
        assert!(!help(&mut tree, Some(root), &start, false).contains("lib/libx.a"));
        let text = help(&mut tree, Some(root), &start, true);
        assert!(text.contains("  lib/libx.a                  - the library\n"));
    }

    #[test]
    fn dump_prints_build_file_syntax() {
        let (_tmp, mut tree, root, start) = project(&[(
            "Mkfile",
            ".DEFAULT: all\n## compiler\nCC = cc\nCC += -g\nall: a.o b.o\n\t${CC} -o $@ $^\n.c.o: config.h\n\t${CC} -c $<\n.FOREIGN: vendor\n",
        )]);
        let text = dump(&mut tree, root, &start, false);
        assert!(text.starts_with(".DEFAULT: all\n"));
        assert!(text.contains("\n## compiler\nCC = cc\nCC += -g\n"));
        assert!(text.contains("all: a.o b.o\n\t${CC} -o $@ $^\n\n"));
        assert!(text.contains(".c.o: config.h\n\t${CC} -c $<\n\n"));
        assert!(text.ends_with(".include vendor, FOREIGN\n"));
        assert!(!text.contains("==="));
    }

    #[test]
    fn dump_shows_inferred_dependencies() {
        let (tmp, mut tree, root, start) = project(&[("Mkfile", "x.o: x.h\n.c.o: common.h\n\tcc -c $<\n")]);
        std::fs::write(tmp.path().join("x.c"), "").unwrap();
        let id = crate::infer::find_inference(&mut tree, root, &start, "x.o", 0).unwrap().unwrap();
        let at = crate::scope::FileRef {
            index: tree.find_file(root, "x.o").unwrap(),
            scope: root,
        };
        crate::infer::attach(&mut tree, at, id).unwrap();
        let text = dump(&mut tree, root, &start, false);
        assert!(text.contains("x.o: x.c x.h common.h\n\tcc -c $<\n"));
    }

    #[test]
    fn verbose_dump_recurses_with_headers() {
        let files = [("Mkfile", ".SUBDIRS: lib\n"), ("lib/Mkfile", "X = 1\n")];
        let (_tmp, mut tree, root, start) = project(&files);
        let text = dump(&mut tree, root, &start, true);
        assert!(text.starts_with("=== .\n"));
        assert!(text.contains(".include lib, DIR\n\n=== ./lib\nX = 1\n"));
    }
}
