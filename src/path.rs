//! Logical paths between scopes, normalized without touching the filesystem.

use std::fmt;
use std::path::PathBuf;

use crate::error::Error;

/// One step of a logical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    /// A named child directory or file.
    Name(String),
    /// Step up to the enclosing scope (`..`).
    Parent,
    /// Filesystem root; only ever the first component.
    Root,
}

/// Relative path from one scope to another, or to a file within one.
/// The empty path is the current scope. A `Parent` never directly
/// follows a `Name`; the two cancel on construction. A `Parent` right
/// after `Root` is dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Path {
    /// Normalized steps, `Root` first when absolute.
    components: Vec<Component>,
}

impl Path {
    /// The empty path, rendered as `.`.
    pub const fn root() -> Self {
        return Self { components: Vec::new() };
    }

    /// Split on `/`, skipping empty and `.` segments. A leading `/` makes
    /// the path absolute.
    pub fn parse(text: &str) -> Self {
        let mut path = Self::root();
        if text.starts_with('/') {
            path.components.push(Component::Root);
        }
        for segment in text.split('/') {
            match segment {
                "" | "." => {},
                ".." => path.push(Component::Parent),
                name => path.push(Component::Name(name.to_string())),
            }
        }
        return path;
    }

    /// Path made of the given components, normalized.
    pub fn from_components(components: &[Component]) -> Self {
        let mut path = Self::root();
        for component in components {
            path.push(component.clone());
        }
        return path;
    }

    /// A single-name path.
    pub fn name(name: &str) -> Self {
        return Self {
            components: vec![Component::Name(name.to_string())],
        };
    }

    /// Append one component, producing a new path.
    pub fn join(&self, component: Component) -> Self {
        let mut path = self.clone();
        path.push(component);
        return path;
    }

    /// Append a named component.
    pub fn join_name(&self, name: &str) -> Self {
        return self.join(Component::Name(name.to_string()));
    }

    /// Normalized steps.
    pub fn components(&self) -> &[Component] {
        return &self.components;
    }

    /// The path names the current scope.
    pub fn is_empty(&self) -> bool {
        return self.components.is_empty();
    }

    /// Filesystem location of this path relative to the working directory.
    pub fn to_fs(&self) -> PathBuf {
        return PathBuf::from(self.to_string());
    }

    /// Filesystem location of `name` inside this directory.
    pub fn file(&self, name: &str) -> PathBuf {
        return self.to_fs().join(name);
    }

    /// Final name of the real directory this path points at, following
    /// `..` and symlinks.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the directory cannot be resolved.
    pub fn basename(&self) -> Result<String, Error> {
        let real = std::fs::canonicalize(self.to_fs())?;
        let name = real
            .file_name()
            .map_or_else(|| return real.display().to_string(), |n| return n.to_string_lossy().into_owned());
        return Ok(name);
    }

    /// Push with `Name`/`Parent` cancellation.
    fn push(&mut self, component: Component) {
        match (&component, self.components.last()) {
            (Component::Parent, Some(Component::Name(_))) => {
                self.components.pop();
            },
            (Component::Parent, Some(Component::Root)) => {},
            (Component::Root, Some(_)) => {},
            _ => self.components.push(component),
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.components.as_slice() {
            [] => return f.write_str("."),
            [Component::Root] => return f.write_str("/"),
            _ => {},
        }
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            match component {
                Component::Name(name) => f.write_str(name)?,
                Component::Parent => f.write_str("..")?,
                Component::Root => {},
            }
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_cancels_trailing_name() {
        let p = Path::parse("src/lib").join(Component::Parent);
        assert_eq!(p, Path::parse("src"));
    }

    #[test]
    fn parent_appends_after_parent_or_empty() {
        let up = Path::root().join(Component::Parent);
        assert_eq!(up.components(), &[Component::Parent]);
        let up2 = up.join(Component::Parent);
        assert_eq!(up2.to_string(), "../..");
    }

    #[test]
    fn parse_skips_empty_and_dot_segments() {
        let p = Path::parse("./a//b/.");
        assert_eq!(p.to_string(), "a/b");
        assert_eq!(Path::parse("").to_string(), ".");
    }

    #[test]
    fn parse_normalizes_inner_parent() {
        assert_eq!(Path::parse("a/../b").to_string(), "b");
        assert_eq!(Path::parse("../../x").to_string(), "../../x");
    }

    #[test]
    fn absolute_paths_keep_their_root() {
        let p = Path::parse("/usr/include");
        assert_eq!(p.components()[0], Component::Root);
        assert_eq!(p.to_string(), "/usr/include");
        assert_eq!(Path::parse("/..").to_string(), "/");
        assert_eq!(Path::parse("/tmp").file("x"), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn name_only_paths_round_trip() {
        for text in ["a", "a/b", "x.c", "lib/sub/file.o"] {
            let p = Path::parse(text);
            assert_eq!(Path::parse(&p.to_string()), p);
        }
    }

    #[test]
    fn file_joins_under_directory() {
        assert_eq!(Path::root().file("Mkfile"), PathBuf::from("./Mkfile"));
        assert_eq!(Path::parse("../lib").file("x.c"), PathBuf::from("../lib/x.c"));
    }
}
