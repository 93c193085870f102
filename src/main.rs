//! bmk: a make tool that treats each directory of a project as a scope.

mod cond;
/// Run-wide options and the `.bmk.toml` settings file.
mod config;
/// Rendering of fatal errors for the terminal.
mod diagnostics;
mod engine;
mod error;
mod expand;
mod infer;
mod parser;
mod path;
/// Help page and tree dump.
mod report;
mod scope;
mod shell;
mod types;

use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use clap::{ArgAction, Parser as _};
use regex::Regex;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::config::{BuildConfig, DEFAULT_MAKEFILE, Settings};
use crate::engine::{BuildStatus, Engine};
use crate::error::Error;
use crate::expand::{ExpansionContext, Expander};
use crate::parser::Parser;
use crate::path::Path;
use crate::report::Report;
use crate::scope::ScopeTree;
use crate::shell::SystemShell;
use crate::types::{Macro, is_macro_name};

/// `NAME=value` on the command line; surrounding blanks are dropped.
const ASSIGNMENT: &str = r"^\s*([^=]*?)\s*=\s*(.*?)\s*$";

/// Command-line flags. Help and version are handled by the help page.
#[allow(clippy::struct_excessive_bools, reason = "one field per single-letter flag")]
#[derive(clap::Parser)]
#[command(name = "bmk", disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    /// Print the help page
    #[arg(short = 'h')]
    help: bool,
    /// Dump the scope tree
    #[arg(short = 'p')]
    print: bool,
    /// Do not echo commands
    #[arg(short = 's')]
    silent: bool,
    /// Verbose output (repeatable)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,
    /// Continue after errors
    #[arg(short = 'k', overrides_with = "stop")]
    keep_going: bool,
    /// Stop at the first error (default)
    #[arg(short = 'S', overrides_with = "keep_going")]
    stop: bool,
    /// Change to this directory first
    #[arg(short = 'C', value_name = "dir")]
    directory: Option<PathBuf>,
    /// Read this build file instead of Mkfile
    #[arg(short = 'f', value_name = "file")]
    makefile: Option<String>,
    /// Shadow object directory
    #[arg(short = 'o', value_name = "objdir")]
    objdir: Option<PathBuf>,
    /// Print the expansion of a macro
    #[arg(short = 'V', value_name = "var")]
    variable: Option<String>,
    /// Targets and NAME=value definitions
    args: Vec<String>,
}

/// Exit 0 on success, 1 on a failed build or usage error, or the shell's
/// 126/127 when it cannot be started.
fn main() -> ExitCode {
    let program = std::env::args().next().unwrap_or_else(|| return "bmk".to_string());
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprint!("{e}");
            eprintln!("{}", report::usage(&program));
            return ExitCode::FAILURE;
        },
    };

    return match run(&cli, &program) {
        Ok(code) => code,
        Err(e) => {
            diagnostics::print_error(&e);
            ExitCode::from(e.exit_code())
        },
    };
}

/// Parse the tree from the working directory, then print, query or build.
///
/// # Errors
///
/// Returns fatal errors from settings, parsing, expansion or building.
fn run(cli: &Cli, program: &str) -> Result<ExitCode, Error> {
    // -o is relative to where we were started, before -C
    let mut objdir = cli.objdir.as_deref().map(prepare_objdir).transpose()?;
    if let Some(dir) = &cli.directory {
        std::env::set_current_dir(dir)?;
    }

    let settings = Settings::load(std::path::Path::new("."))?;
    if objdir.is_none() {
        objdir = settings.objdir.as_deref().map(prepare_objdir).transpose()?;
    }
    let config = BuildConfig {
        keep_going: cli.keep_going || (!cli.stop && settings.keep_going.unwrap_or(false)),
        makefile: cli
            .makefile
            .clone()
            .or(settings.makefile)
            .unwrap_or_else(|| return DEFAULT_MAKEFILE.to_string()),
        objdir,
        verbosity: if cli.silent || (cli.verbose == 0 && settings.silent.unwrap_or(false)) {
            -1
        } else {
            i8::try_from(cli.verbose).unwrap_or(i8::MAX)
        },
    };
    init_tracing(config.verbosity);

    let (definitions, targets): (Vec<&String>, Vec<&String>) = cli.args.iter().partition(|a| return a.contains('='));
    let globals = builtin_macros(cli, program, &definitions)?;
    debug!(?config, globals = globals.len(), "starting");

    let shell = SystemShell;
    let mut tree = ScopeTree::new(config.objdir.clone(), globals);
    let start = Path::root();
    let root = Parser::new(&mut tree, &shell).parse_recursive(&start, &config.makefile)?;

    if cli.help {
        Report::new(&mut tree, &shell, config.verbose()).help(&mut std::io::stderr().lock(), program, root, &start)?;
        return Ok(ExitCode::FAILURE);
    }
    let Some(scope) = root else {
        return Err(Error::MakefileNotFound { name: config.makefile });
    };

    if cli.print {
        Report::new(&mut tree, &shell, config.verbose()).dump(&mut std::io::stdout().lock(), scope, &start)?;
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(var) = &cli.variable {
        let text = if var.contains('$') { var.clone() } else { format!("${{{var}}}") };
        let ctx = ExpansionContext::none();
        println!("{}", Expander::new(&tree, scope, &start, &ctx).expand(&text)?);
        return Ok(ExitCode::SUCCESS);
    }

    let requested: Vec<Path> = if targets.is_empty() {
        vec![Path::root()]
    } else {
        targets.iter().map(|t| return Path::parse(t)).collect()
    };
    let mut engine = Engine::new(&mut tree, &config, &shell);
    let mut failed = false;
    for target in &requested {
        if engine.build(scope, &start, target)? == BuildStatus::Failed {
            failed = true;
            if !config.keep_going {
                break;
            }
        }
    }

    return Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS });
}

/// Create the shadow object directory if needed and make it absolute.
///
/// # Errors
///
/// Returns `Error::ObjdirNotDirectory` if the path names something else,
/// or `Error::Io` if it cannot be created.
fn prepare_objdir(dir: &std::path::Path) -> Result<PathBuf, Error> {
    if dir.exists() && !dir.is_dir() {
        return Err(Error::ObjdirNotDirectory { path: dir.to_path_buf() });
    }
    std::fs::create_dir_all(dir)?;
    return Ok(std::fs::canonicalize(dir)?);
}

/// `SHELL`, `MAKE`, `MAKEFLAGS` and their dotted forms, then the
/// command-line definitions in order so later ones take priority.
///
/// # Errors
///
/// Returns `Error::InvalidMacroName` for a definition with a bad name.
fn builtin_macros(cli: &Cli, program: &str, definitions: &[&String]) -> Result<Vec<Rc<Macro>>, Error> {
    let mut flags: Vec<String> = Vec::new();
    if cli.print {
        flags.push("-p".to_string());
    }
    if cli.silent {
        flags.push("-s".to_string());
    }
    for _ in 0..cli.verbose {
        flags.push("-v".to_string());
    }
    flags.extend(definitions.iter().map(ToString::to_string));
    let makeflags = flags.join(" ");

    let mut globals = vec![
        Rc::new(Macro::literal("SHELL", "sh")),
        Rc::new(Macro::literal("MAKE", program)),
        Rc::new(Macro::literal(".MAKE", program)),
        Rc::new(Macro::literal("MAKEFLAGS", &makeflags)),
        Rc::new(Macro::literal(".MAKEFLAGS", &makeflags)),
    ];
    let pattern = Regex::new(ASSIGNMENT)?;
    for definition in definitions {
        let (name, value) = split_assignment(&pattern, definition)?;
        globals.push(Rc::new(Macro::literal(name, value)));
    }
    return Ok(globals);
}

/// Split `NAME=value`, trimming both sides.
///
/// # Errors
///
/// Returns `Error::InvalidMacroName` if the name is empty or uses
/// characters outside `[A-Za-z0-9_.]`.
fn split_assignment<'t>(pattern: &Regex, text: &'t str) -> Result<(&'t str, &'t str), Error> {
    let invalid = || return Error::InvalidMacroName { name: text.to_string() };
    let captures = pattern.captures(text).ok_or_else(invalid)?;
    let (Some(name), Some(value)) = (captures.get(1), captures.get(2)) else {
        return Err(invalid());
    };
    if !is_macro_name(name.as_str()) {
        return Err(Error::InvalidMacroName {
            name: name.as_str().to_string(),
        });
    }
    return Ok((name.as_str(), value.as_str()));
}

/// Log to stderr without timestamps. The level follows `-v` unless
/// `RUST_LOG` is set.
fn init_tracing(verbosity: i8) {
    let level = match verbosity {
        ..=0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| return EnvFilter::new(level));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .try_init();
    if let Err(e) = installed {
        debug!(error = %e, "keeping the existing subscriber");
    }
}
