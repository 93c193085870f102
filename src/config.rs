use std::path::{Path, PathBuf};

use crate::error::Error;

/// Build-description filename used when none is given, and always for
/// `.SUBDIRS:` children.
pub const DEFAULT_MAKEFILE: &str = "Mkfile";

/// Settings file read from the project directory.
pub const SETTINGS_FILE: &str = ".bmk.toml";

/// Run-wide options, fixed before parsing starts.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Keep building independent targets after a failure.
    pub keep_going: bool,
    /// Build-description filename for the starting directory.
    pub makefile: String,
    /// Absolute shadow object directory.
    pub objdir: Option<PathBuf>,
    /// -1 silent, 0 normal, 1 and up verbose.
    pub verbosity: i8,
}

impl Default for BuildConfig {
    fn default() -> Self {
        return Self {
            keep_going: false,
            makefile: DEFAULT_MAKEFILE.to_string(),
            objdir: None,
            verbosity: 0,
        };
    }
}

impl BuildConfig {
    /// Recipe lines are not echoed.
    pub const fn silent(&self) -> bool {
        return self.verbosity < 0;
    }

    /// Echoed recipe lines show their expanded text.
    pub const fn verbose(&self) -> bool {
        return self.verbosity > 0;
    }
}

/// Project defaults from `.bmk.toml`. Command-line flags take precedence.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Default for `-k`.
    #[serde(default)]
    pub keep_going: Option<bool>,
    /// Default for `-f`.
    #[serde(default)]
    pub makefile: Option<String>,
    /// Default for `-o`, relative to the project directory.
    #[serde(default)]
    pub objdir: Option<PathBuf>,
    /// Default for `-s`.
    #[serde(default)]
    pub silent: Option<bool>,
}

impl Settings {
    /// Load `.bmk.toml` from `root`.
    /// Returns defaults if the file doesn't exist, and an error if it exists
    /// but is malformed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if reading fails (other than not-found),
    /// or `Error::TomlDe` if the TOML is malformed or has unknown keys.
    pub fn load(root: &Path) -> Result<Self, Error> {
        let path = root.join(SETTINGS_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(Error::Io(e)),
        };
        let settings: Self = toml::from_str(&content)?;
        return Ok(settings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_settings_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert!(settings.makefile.is_none());
        assert!(settings.keep_going.is_none());
    }

    #[test]
    fn settings_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            "makefile = \"Build\"\nobjdir = \"out\"\nkeep_going = true\n",
        )
        .unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.makefile.as_deref(), Some("Build"));
        assert_eq!(settings.objdir, Some(PathBuf::from("out")));
        assert_eq!(settings.keep_going, Some(true));
        assert_eq!(settings.silent, None);
    }

    #[test]
    fn malformed_settings_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "makefile = [").unwrap();
        assert!(matches!(Settings::load(dir.path()), Err(Error::TomlDe(_))));
        std::fs::write(dir.path().join(SETTINGS_FILE), "colour = true").unwrap();
        assert!(matches!(Settings::load(dir.path()), Err(Error::TomlDe(_))));
    }

    #[test]
    fn verbosity_levels() {
        let mut config = BuildConfig::default();
        assert!(!config.silent() && !config.verbose());
        config.verbosity = -1;
        assert!(config.silent());
        config.verbosity = 2;
        assert!(config.verbose());
    }
}
