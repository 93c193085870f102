use std::io::IsTerminal as _;

use crate::error::Error;

/// ANSI bold on.
const BOLD: &str = "\x1b[1m";
/// ANSI attributes off.
const RESET: &str = "\x1b[0m";

/// Print a rendered diagnostic to stderr, headings in bold on a terminal.
pub fn print_error(e: &Error) {
    let bold = std::io::stderr().is_terminal();
    for line in render_error(e).lines() {
        if bold && line.starts_with('#') {
            eprintln!("{BOLD}{line}{RESET}");
        } else {
            eprintln!("{line}");
        }
    }
}

/// Render an error as a short diagnostic: a titled heading, the message
/// with its location, and a fix when there is a usual one.
pub fn render_error(e: &Error) -> String {
    let fix_section = fix(innermost(e)).map_or_else(String::new, |text| return format!("\n## Fix\n\n{text}\n"));
    return format!("# Error: {}\n\n{e}\n{fix_section}", title(e));
}

/// The error a location wraps.
fn innermost(e: &Error) -> &Error {
    return match e {
        Error::Located { source, .. } => innermost(source),
        _ => e,
    };
}

/// Heading for the kind of failure.
fn title(e: &Error) -> &'static str {
    return match innermost(e) {
        Error::AlreadyParsed { .. } => "File Parsed Twice",
        Error::ConditionalOverflow { .. } | Error::ConditionalUnderflow { .. } | Error::UnterminatedConditional { .. } => {
            "Unbalanced Conditional"
        },
        Error::DependencyCycle { .. } => "Dependency Cycle",
        Error::DirectoryNotFound { .. } => "Directory Not Found",
        Error::IncludeNotFound { .. } => "Include Not Found",
        Error::InvalidEscape { .. }
        | Error::InvalidExpansion { .. }
        | Error::InvalidModifier { .. }
        | Error::ReservedSyntax { .. }
        | Error::ExpansionDepth { .. } => "Expansion Failed",
        Error::MakefileNotFound { .. } => "Build File Not Found",
        Error::MissingExecRule { .. } => "Missing Exec Rule",
        Error::NoRuleToBuild { .. } | Error::NoSuchFile { .. } | Error::NothingToBuild { .. } => "Nothing To Build",
        Error::Spawn { .. } => "Shell Not Runnable",
        Error::TomlDe(_) => "Invalid Settings",
        Error::UndefinedExport { .. } => "Undefined Export",
        Error::Io(_) => "I/O",
        _ => "Build Failed",
    };
}

/// Usual remedy, if there is one.
fn fix(e: &Error) -> Option<String> {
    let text = match e {
        Error::DependencyCycle { name, .. } => format!("Remove one of the dependencies that lead from `{name}` back to itself."),
        Error::DirectoryNotFound { name, .. } => {
            format!("Create `{name}`, or remove it from `.SUBDIRS:`. Externally built trees belong in `.FOREIGN:`.")
        },
        Error::IncludeDirective => {
            "Declare subdirectories with `.SUBDIRS: name`, or externally built ones with `.FOREIGN: name`.".to_string()
        },
        Error::IncludeNotFound { .. } => "Use `-include` for files that may not exist.".to_string(),
        Error::MakefileNotFound { name } => format!("Create `{name}`, pass `-f file` or change directory with `-C dir`."),
        Error::MissingExecRule { name, .. } => format!("Add a rule that builds the foreign tree:\n\n    {name}!:\n    \tcommand"),
        Error::ReservedSyntax { .. } => "Write `${NAME}` instead of `$(NAME)`.".to_string(),
        Error::Spawn { program, .. } => format!("Check that `{program}` is installed, or set `SHELL=` on the command line."),
        Error::TomlDe(_) => "Known keys in `.bmk.toml`: `keep_going`, `makefile`, `objdir`, `silent`.".to_string(),
        Error::UndefinedExport { name } => format!("Define `{name}` before listing it in `.EXPORTS:`."),
        _ => return None,
    };
    return Some(text);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn located_errors_keep_location_and_fix() {
        let e = Error::UndefinedExport { name: "CC".to_string() }.at("Mkfile", 4);
        let text = render_error(&e);
        assert!(text.starts_with("# Error: Undefined Export\n\nMkfile:4: no such macro: 'CC'\n"));
        assert!(text.contains("## Fix\n\nDefine `CC` before listing it in `.EXPORTS:`."));
    }

    #[test]
    fn errors_without_fix_have_no_fix_section() {
        let text = render_error(&Error::RecipeWithoutRule);
        assert_eq!(text, "# Error: Build Failed\n\nrecipe line outside of a rule\n");
    }

    #[test]
    fn dependency_cycle_names_the_target() {
        let e = Error::DependencyCycle {
            name: "a".to_string(),
            scope: ".".to_string(),
        };
        let text = render_error(&e);
        assert!(text.starts_with("# Error: Dependency Cycle\n\n.: dependency cycle through a\n"));
        assert!(text.contains("from `a` back to itself"));
    }

    #[test]
    fn missing_exec_rule_suggests_rule() {
        let e = Error::MissingExecRule {
            name: "vendor".to_string(),
            scope: ".".to_string(),
        };
        assert!(render_error(&e).contains("    vendor!:\n"));
    }
}
